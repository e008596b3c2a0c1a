use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::player::PlayerHandle;
use crate::room::Room;
use crate::Result;
use ballroom_common::{Scores, TeamId};

/// Outcome of a single handler, and of a whole dispatch.
///
/// Returning [`Flow::Veto`] from any handler makes the dispatch result
/// `Veto`, which suppresses the default action tied to the event (e.g.
/// command routing for a chat message). Handler errors are logged and
/// isolated; they never count as vetoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flow {
    #[default]
    Continue,
    Veto,
}

impl Flow {
    pub fn is_veto(self) -> bool {
        self == Flow::Veto
    }
}

/// Canonical key of an event.
///
/// Native events have fixed keys; everything else is `Custom` under its
/// canonical snake_case name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    PlayerJoin,
    PlayerLeave,
    TeamVictory,
    PlayerChat,
    PlayerBallKick,
    TeamGoal,
    GameStart,
    GameStop,
    PlayerAdminChange,
    PlayerTeamChange,
    PlayerKicked,
    GameTick,
    GamePause,
    GameUnpause,
    PositionsReset,
    StadiumChange,
    RoomLink,
    Custom(String),
}

/// Fold an event name into its canonical snake_case form.
///
/// Accepts camelCase, PascalCase, kebab-case and snake_case, with an
/// optional leading `on` (`onPlayerChat` folds to `player_chat`).
pub fn canonical_event_name(name: &str) -> String {
    let trimmed = name.trim();
    let rest = trimmed
        .strip_prefix("on")
        .filter(|r| r.starts_with(|c: char| c.is_ascii_uppercase()))
        .unwrap_or(trimmed);

    let mut out = String::with_capacity(rest.len() + 4);
    let mut at_boundary = true;
    for ch in rest.chars() {
        if ch == '-' || ch == '_' || ch.is_whitespace() {
            if !at_boundary {
                out.push('_');
                at_boundary = true;
            }
        } else if ch.is_ascii_uppercase() {
            if !at_boundary {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            at_boundary = false;
        } else {
            out.push(ch);
            at_boundary = false;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

impl EventKey {
    /// Parse any accepted spelling of an event name into its key.
    pub fn parse(name: &str) -> EventKey {
        match canonical_event_name(name).as_str() {
            "player_join" => EventKey::PlayerJoin,
            "player_leave" => EventKey::PlayerLeave,
            "team_victory" => EventKey::TeamVictory,
            "player_chat" => EventKey::PlayerChat,
            "player_ball_kick" => EventKey::PlayerBallKick,
            "team_goal" => EventKey::TeamGoal,
            "game_start" => EventKey::GameStart,
            "game_stop" => EventKey::GameStop,
            "player_admin_change" => EventKey::PlayerAdminChange,
            "player_team_change" => EventKey::PlayerTeamChange,
            "player_kicked" => EventKey::PlayerKicked,
            "game_tick" => EventKey::GameTick,
            "game_pause" => EventKey::GamePause,
            "game_unpause" => EventKey::GameUnpause,
            "positions_reset" => EventKey::PositionsReset,
            "stadium_change" => EventKey::StadiumChange,
            "room_link" => EventKey::RoomLink,
            other => EventKey::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKey::PlayerJoin => "player_join",
            EventKey::PlayerLeave => "player_leave",
            EventKey::TeamVictory => "team_victory",
            EventKey::PlayerChat => "player_chat",
            EventKey::PlayerBallKick => "player_ball_kick",
            EventKey::TeamGoal => "team_goal",
            EventKey::GameStart => "game_start",
            EventKey::GameStop => "game_stop",
            EventKey::PlayerAdminChange => "player_admin_change",
            EventKey::PlayerTeamChange => "player_team_change",
            EventKey::PlayerKicked => "player_kicked",
            EventKey::GameTick => "game_tick",
            EventKey::GamePause => "game_pause",
            EventKey::GameUnpause => "game_unpause",
            EventKey::PositionsReset => "positions_reset",
            EventKey::StadiumChange => "stadium_change",
            EventKey::RoomLink => "room_link",
            EventKey::Custom(name) => name,
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A room event as seen by modules and subscribers.
///
/// Non-player arguments are owned immutable values; player arguments are
/// the registry's long-lived wrappers.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    PlayerJoin { player: PlayerHandle },
    PlayerLeave { player: PlayerHandle },
    TeamVictory { scores: Scores },
    PlayerChat { player: PlayerHandle, message: String },
    PlayerBallKick { player: PlayerHandle },
    TeamGoal { team: TeamId },
    GameStart { by: Option<PlayerHandle> },
    GameStop { by: Option<PlayerHandle> },
    PlayerAdminChange { player: PlayerHandle, by: Option<PlayerHandle> },
    PlayerTeamChange { player: PlayerHandle, by: Option<PlayerHandle> },
    PlayerKicked {
        player: PlayerHandle,
        reason: String,
        ban: bool,
        by: Option<PlayerHandle>,
    },
    GameTick,
    GamePause { by: Option<PlayerHandle> },
    GameUnpause { by: Option<PlayerHandle> },
    PositionsReset,
    StadiumChange { stadium: String, by: Option<PlayerHandle> },
    RoomLink { url: String },
    /// A tracked custom player property changed value.
    PropertyChange { property: String, player: PlayerHandle },
    /// Integrator-defined event dispatched through [`Room::dispatch_custom`].
    Custom { name: String, data: Value },
}

impl RoomEvent {
    pub fn key(&self) -> EventKey {
        match self {
            RoomEvent::PlayerJoin { .. } => EventKey::PlayerJoin,
            RoomEvent::PlayerLeave { .. } => EventKey::PlayerLeave,
            RoomEvent::TeamVictory { .. } => EventKey::TeamVictory,
            RoomEvent::PlayerChat { .. } => EventKey::PlayerChat,
            RoomEvent::PlayerBallKick { .. } => EventKey::PlayerBallKick,
            RoomEvent::TeamGoal { .. } => EventKey::TeamGoal,
            RoomEvent::GameStart { .. } => EventKey::GameStart,
            RoomEvent::GameStop { .. } => EventKey::GameStop,
            RoomEvent::PlayerAdminChange { .. } => EventKey::PlayerAdminChange,
            RoomEvent::PlayerTeamChange { .. } => EventKey::PlayerTeamChange,
            RoomEvent::PlayerKicked { .. } => EventKey::PlayerKicked,
            RoomEvent::GameTick => EventKey::GameTick,
            RoomEvent::GamePause { .. } => EventKey::GamePause,
            RoomEvent::GameUnpause { .. } => EventKey::GameUnpause,
            RoomEvent::PositionsReset => EventKey::PositionsReset,
            RoomEvent::StadiumChange { .. } => EventKey::StadiumChange,
            RoomEvent::RoomLink { .. } => EventKey::RoomLink,
            RoomEvent::PropertyChange { property, .. } => {
                EventKey::Custom(property_change_event(property))
            }
            RoomEvent::Custom { name, .. } => EventKey::parse(name),
        }
    }
}

/// Canonical event name for a change of the given player property.
pub fn property_change_event(property: &str) -> String {
    format!("player_{}_change", canonical_event_name(property))
}

/// Event handler methods a module may override.
///
/// Every method defaults to `Ok(Flow::Continue)`; modules override only the
/// events they care about. `handle` is the uniform dispatch entry and
/// normally stays as provided.
#[allow(unused_variables)]
pub trait RoomHandlers: Send + Sync {
    fn on_player_join(&self, room: &Room, player: &PlayerHandle) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn on_player_leave(&self, room: &Room, player: &PlayerHandle) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn on_team_victory(&self, room: &Room, scores: &Scores) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn on_player_chat(&self, room: &Room, player: &PlayerHandle, message: &str) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn on_player_ball_kick(&self, room: &Room, player: &PlayerHandle) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn on_team_goal(&self, room: &Room, team: TeamId) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn on_game_start(&self, room: &Room, by: Option<&PlayerHandle>) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn on_game_stop(&self, room: &Room, by: Option<&PlayerHandle>) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn on_player_admin_change(
        &self,
        room: &Room,
        player: &PlayerHandle,
        by: Option<&PlayerHandle>,
    ) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn on_player_team_change(
        &self,
        room: &Room,
        player: &PlayerHandle,
        by: Option<&PlayerHandle>,
    ) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn on_player_kicked(
        &self,
        room: &Room,
        player: &PlayerHandle,
        reason: &str,
        ban: bool,
        by: Option<&PlayerHandle>,
    ) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn on_game_tick(&self, room: &Room) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn on_game_pause(&self, room: &Room, by: Option<&PlayerHandle>) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn on_game_unpause(&self, room: &Room, by: Option<&PlayerHandle>) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn on_positions_reset(&self, room: &Room) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn on_stadium_change(
        &self,
        room: &Room,
        stadium: &str,
        by: Option<&PlayerHandle>,
    ) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn on_room_link(&self, room: &Room, url: &str) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn on_property_change(
        &self,
        room: &Room,
        property: &str,
        player: &PlayerHandle,
    ) -> Result<Flow> {
        Ok(Flow::Continue)
    }
    fn on_custom(&self, room: &Room, name: &str, data: &Value) -> Result<Flow> {
        Ok(Flow::Continue)
    }

    /// Route an event to the matching named handler.
    fn handle(&self, room: &Room, event: &RoomEvent) -> Result<Flow> {
        match event {
            RoomEvent::PlayerJoin { player } => self.on_player_join(room, player),
            RoomEvent::PlayerLeave { player } => self.on_player_leave(room, player),
            RoomEvent::TeamVictory { scores } => self.on_team_victory(room, scores),
            RoomEvent::PlayerChat { player, message } => {
                self.on_player_chat(room, player, message)
            }
            RoomEvent::PlayerBallKick { player } => self.on_player_ball_kick(room, player),
            RoomEvent::TeamGoal { team } => self.on_team_goal(room, *team),
            RoomEvent::GameStart { by } => self.on_game_start(room, by.as_ref()),
            RoomEvent::GameStop { by } => self.on_game_stop(room, by.as_ref()),
            RoomEvent::PlayerAdminChange { player, by } => {
                self.on_player_admin_change(room, player, by.as_ref())
            }
            RoomEvent::PlayerTeamChange { player, by } => {
                self.on_player_team_change(room, player, by.as_ref())
            }
            RoomEvent::PlayerKicked {
                player,
                reason,
                ban,
                by,
            } => self.on_player_kicked(room, player, reason, *ban, by.as_ref()),
            RoomEvent::GameTick => self.on_game_tick(room),
            RoomEvent::GamePause { by } => self.on_game_pause(room, by.as_ref()),
            RoomEvent::GameUnpause { by } => self.on_game_unpause(room, by.as_ref()),
            RoomEvent::PositionsReset => self.on_positions_reset(room),
            RoomEvent::StadiumChange { stadium, by } => {
                self.on_stadium_change(room, stadium, by.as_ref())
            }
            RoomEvent::RoomLink { url } => self.on_room_link(room, url),
            RoomEvent::PropertyChange { property, player } => {
                self.on_property_change(room, property, player)
            }
            RoomEvent::Custom { name, data } => self.on_custom(room, name, data),
        }
    }
}

/// Callback signature for dynamic subscriptions.
pub type EventCallback = Arc<dyn Fn(&Room, &RoomEvent) -> Result<Flow> + Send + Sync>;

/// Opaque handle to a dynamic subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// A dynamic subscription bound to one event key.
#[derive(Clone)]
pub(crate) struct EventSubscription {
    pub id: SubscriptionId,
    pub callback: EventCallback,
}
