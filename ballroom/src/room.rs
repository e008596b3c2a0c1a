use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::access::RoleTable;
use crate::command_system::{CommandDef, CommandInfo, CommandRegistry};
use crate::config::{RolesFn, RoomOptions, UnlistedTeamPolicy};
use crate::dependency::{ModuleInstance, ModuleResolver, RoomModule};
use crate::event_system::{
    EventCallback, EventKey, EventSubscription, Flow, RoomEvent, SubscriptionId,
};
use crate::player::{bucket_by_teams, PlayerFilter, PlayerHandle, PlayerRegistry};
use crate::{Error, Result};
use ballroom_common::{
    HostContext, HostEnvironment, NativeEvent, NativeRoom, PlayerId, Scores, TeamId, Vec2,
    HOST_ID,
};

type DeferredTask = Box<dyn FnOnce(&Room) + Send>;

struct RoomInner {
    native: Box<dyn NativeRoom>,
    registry: PlayerRegistry,
    modules: RwLock<Vec<Arc<dyn ModuleInstance>>>,
    commands: CommandRegistry,
    subscriptions: RwLock<HashMap<EventKey, Vec<EventSubscription>>>,
    broadcast_tx: broadcast::Sender<Arc<RoomEvent>>,
    roles: RoleTable,
    get_roles: RolesFn,
    command_prefix: Option<String>,
    unlisted_teams: UnlistedTeamPolicy,
    state: RwLock<Value>,
    deferred: Mutex<VecDeque<DeferredTask>>,
    dispatch_depth: AtomicUsize,
}

/// Counters describing the current shape of a room.
#[derive(Debug, Clone, Copy)]
pub struct RoomStats {
    pub modules: usize,
    pub commands: usize,
    pub players: usize,
    pub subscriptions: usize,
}

/// The aggregate root: owns the player registry, the ordered module list,
/// the command table and all event plumbing.
///
/// `Room` is a cheap clone of a shared handle; the room lives until the
/// last strong handle drops.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

/// Weak room reference injected into modules.
///
/// Upgrading fails with [`Error::NotInitialized`] once the room is gone, so
/// deferred module code can never touch a dead native handle.
#[derive(Clone)]
pub struct RoomHandle {
    inner: Weak<RoomInner>,
}

impl RoomHandle {
    pub fn room(&self) -> Result<Room> {
        self.inner
            .upgrade()
            .map(|inner| Room { inner })
            .ok_or(Error::NotInitialized)
    }
}

impl Room {
    /// Create the native room through the host context and construct every
    /// configured module. Any module or command error aborts creation.
    pub fn create<E: HostEnvironment>(
        host: &HostContext<E>,
        options: RoomOptions,
    ) -> Result<Room> {
        let native = host.init_room(&options.native)?;
        Self::assemble(native, options)
    }

    pub(crate) fn assemble(native: Box<dyn NativeRoom>, options: RoomOptions) -> Result<Room> {
        let state = match options.state {
            Value::Null => Value::Object(Default::default()),
            Value::Object(map) => Value::Object(map),
            other => {
                return Err(Error::Config(format!(
                    "room state must be an object, got {other}"
                )))
            }
        };
        let (broadcast_tx, _) = broadcast::channel(100);

        let room = Room {
            inner: Arc::new(RoomInner {
                native,
                registry: PlayerRegistry::new(options.properties),
                modules: RwLock::new(Vec::new()),
                commands: CommandRegistry::new(),
                subscriptions: RwLock::new(HashMap::new()),
                broadcast_tx,
                roles: options.roles,
                get_roles: options
                    .get_roles
                    .unwrap_or_else(|| Arc::new(|_: &crate::player::PlayerData| Vec::new())),
                command_prefix: options.command_prefix,
                unlisted_teams: options.unlisted_teams,
                state: RwLock::new(state),
                deferred: Mutex::new(VecDeque::new()),
                dispatch_depth: AtomicUsize::new(0),
            }),
        };

        let modules = ModuleResolver::new().resolve_all(&room, &options.modules)?;
        info!(modules = modules.len(), "room created");
        *room.inner.modules.write() = modules;
        Ok(room)
    }

    /// Weak handle for injection into modules and deferred tasks.
    pub fn handle(&self) -> RoomHandle {
        RoomHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /*
     * =======================
     * EVENT DISPATCH PIPELINE
     * =======================
     */

    /// Entry point for the native bridge: wrap the event's arguments, run
    /// the dispatch pipeline, then apply the event's default action unless
    /// it was vetoed.
    pub fn handle_native(&self, event: NativeEvent) -> Flow {
        let event = self.wrap_native(event);
        self.inner.dispatch_depth.fetch_add(1, Ordering::SeqCst);
        let flow = self.dispatch(&event);

        match &event {
            // Teardown happens after dispatch so handlers still observe the
            // departing player's custom state.
            RoomEvent::PlayerLeave { player } => {
                self.inner.registry.remove(player.id());
            }
            RoomEvent::PlayerChat { player, message } if !flow.is_veto() => {
                if let Some(prefix) = &self.inner.command_prefix {
                    if let Some(line) = message.strip_prefix(prefix.as_str()) {
                        self.route_chat_command(player, line);
                    }
                }
            }
            _ => {}
        }

        let depth = self.inner.dispatch_depth.fetch_sub(1, Ordering::SeqCst);
        if depth == 1 {
            self.run_deferred();
        }
        flow
    }

    /// Broadcast an event to modules (in registration order), then dynamic
    /// subscribers. Handler failures are logged and isolated; a `Veto` from
    /// any handler makes the whole dispatch a `Veto`, but every handler
    /// still runs.
    pub fn dispatch(&self, event: &RoomEvent) -> Flow {
        let key = event.key();
        debug!(event = %key, "dispatching");
        let mut vetoed = false;

        let modules: Vec<Arc<dyn ModuleInstance>> = self.inner.modules.read().clone();
        for module in &modules {
            match module.handle(self, event) {
                Ok(Flow::Veto) => vetoed = true,
                Ok(Flow::Continue) => {}
                Err(e) => {
                    error!(module = module.name(), event = %key, "event handler failed: {e}")
                }
            }
        }

        let subscriptions: Vec<EventSubscription> = self
            .inner
            .subscriptions
            .read()
            .get(&key)
            .cloned()
            .unwrap_or_default();
        for subscription in &subscriptions {
            match (subscription.callback)(self, event) {
                Ok(Flow::Veto) => vetoed = true,
                Ok(Flow::Continue) => {}
                Err(e) => error!(event = %key, "subscriber failed: {e}"),
            }
        }

        if self.inner.broadcast_tx.receiver_count() > 0 {
            let _ = self.inner.broadcast_tx.send(Arc::new(event.clone()));
        }

        if vetoed {
            Flow::Veto
        } else {
            Flow::Continue
        }
    }

    /// Dispatch an integrator-defined event.
    pub fn dispatch_custom(&self, name: impl Into<String>, data: Value) -> Flow {
        self.dispatch(&RoomEvent::Custom {
            name: name.into(),
            data,
        })
    }

    /// Subscribe a callback to an event by name (any accepted spelling).
    /// Subscribers run after modules, in subscription order.
    pub fn on(
        &self,
        event: &str,
        callback: impl Fn(&Room, &RoomEvent) -> Result<Flow> + Send + Sync + 'static,
    ) -> SubscriptionId {
        let key = EventKey::parse(event);
        let id = SubscriptionId::new();
        debug!(event = %key, "subscription added");
        self.inner
            .subscriptions
            .write()
            .entry(key)
            .or_default()
            .push(EventSubscription {
                id,
                callback: Arc::new(callback) as EventCallback,
            });
        id
    }

    /// Remove a subscription; returns whether it existed.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.inner.subscriptions.write();
        let mut removed = false;
        for subscribers in subscriptions.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|s| s.id != id);
            removed |= subscribers.len() != before;
        }
        subscriptions.retain(|_, v| !v.is_empty());
        removed
    }

    /// Receiver mirroring every dispatched event, for async observers.
    pub fn subscribe_broadcast(&self) -> broadcast::Receiver<Arc<RoomEvent>> {
        self.inner.broadcast_tx.subscribe()
    }

    fn wrap_native(&self, event: NativeEvent) -> RoomEvent {
        let registry = &self.inner.registry;
        match event {
            NativeEvent::PlayerJoin { player } => RoomEvent::PlayerJoin {
                player: registry.wrap(&player, Some(&EventKey::PlayerJoin)),
            },
            NativeEvent::PlayerLeave { player } => RoomEvent::PlayerLeave {
                player: registry.wrap(&player, Some(&EventKey::PlayerLeave)),
            },
            NativeEvent::TeamVictory { scores } => RoomEvent::TeamVictory { scores },
            NativeEvent::PlayerChat { player, message } => RoomEvent::PlayerChat {
                player: registry.wrap(&player, Some(&EventKey::PlayerChat)),
                message,
            },
            NativeEvent::PlayerBallKick { player } => RoomEvent::PlayerBallKick {
                player: registry.wrap(&player, Some(&EventKey::PlayerBallKick)),
            },
            NativeEvent::TeamGoal { team } => RoomEvent::TeamGoal { team },
            NativeEvent::GameStart { by } => RoomEvent::GameStart {
                by: by.map(|p| registry.wrap(&p, None)),
            },
            NativeEvent::GameStop { by } => RoomEvent::GameStop {
                by: by.map(|p| registry.wrap(&p, None)),
            },
            NativeEvent::PlayerAdminChange { player, by } => RoomEvent::PlayerAdminChange {
                player: registry.wrap(&player, Some(&EventKey::PlayerAdminChange)),
                by: by.map(|p| registry.wrap(&p, None)),
            },
            NativeEvent::PlayerTeamChange { player, by } => RoomEvent::PlayerTeamChange {
                player: registry.wrap(&player, Some(&EventKey::PlayerTeamChange)),
                by: by.map(|p| registry.wrap(&p, None)),
            },
            NativeEvent::PlayerKicked {
                player,
                reason,
                ban,
                by,
            } => RoomEvent::PlayerKicked {
                player: registry.wrap(&player, Some(&EventKey::PlayerKicked)),
                reason,
                ban,
                by: by.map(|p| registry.wrap(&p, None)),
            },
            NativeEvent::GameTick => RoomEvent::GameTick,
            NativeEvent::GamePause { by } => RoomEvent::GamePause {
                by: by.map(|p| registry.wrap(&p, None)),
            },
            NativeEvent::GameUnpause { by } => RoomEvent::GameUnpause {
                by: by.map(|p| registry.wrap(&p, None)),
            },
            NativeEvent::PositionsReset => RoomEvent::PositionsReset,
            NativeEvent::StadiumChange { stadium, by } => RoomEvent::StadiumChange {
                stadium,
                by: by.map(|p| registry.wrap(&p, None)),
            },
            NativeEvent::RoomLink { url } => RoomEvent::RoomLink { url },
        }
    }

    /*
     * ========
     * COMMANDS
     * ========
     */

    /// Tokenize and execute a command line as `player`.
    ///
    /// Unknown-command and access errors surface to the caller; deciding
    /// how to report them is the caller's business.
    pub fn execute_command(&self, player: &PlayerHandle, raw: &str) -> Result<()> {
        self.inner.commands.execute(self, player, raw)
    }

    /// Register a free-standing command (modules register theirs through
    /// their class declaration).
    pub fn register_command(&self, def: CommandDef) -> Result<()> {
        self.inner.commands.register(def, &self.inner.roles)
    }

    /// Metadata of registered commands.
    pub fn commands_info(&self, name: Option<&str>) -> Vec<CommandInfo> {
        self.inner.commands.info(name)
    }

    fn route_chat_command(&self, player: &PlayerHandle, line: &str) {
        match self.execute_command(player, line) {
            Ok(()) => {}
            Err(Error::UnknownCommand(name)) => {
                self.send_chat(&format!("Unknown command: {name}"), Some(player.id()));
            }
            Err(Error::AccessDenied(name)) => {
                self.send_chat(
                    &format!("You don't have access to the {name} command"),
                    Some(player.id()),
                );
            }
            Err(e) => {
                error!(player = player.id(), "command failed: {e}");
                self.send_chat("The command failed with an error", Some(player.id()));
            }
        }
    }

    pub(crate) fn commands(&self) -> &CommandRegistry {
        &self.inner.commands
    }

    pub(crate) fn role_table(&self) -> &RoleTable {
        &self.inner.roles
    }

    pub(crate) fn roles_of(&self, player: &PlayerHandle) -> Vec<String> {
        player.with(|data| (self.inner.get_roles)(data))
    }

    /*
     * =======
     * PLAYERS
     * =======
     */

    /// Stable wrapper for a connected player.
    pub fn get_player(&self, id: PlayerId) -> Option<PlayerHandle> {
        self.inner
            .native
            .get_player(id)
            .map(|p| self.inner.registry.wrap(&p, None))
    }

    /// All connected players except the host entry, minus those the filter
    /// drops.
    pub fn get_player_list(&self, filter: &PlayerFilter) -> Vec<PlayerHandle> {
        self.inner
            .native
            .get_player_list()
            .iter()
            .filter(|p| p.id != HOST_ID)
            .map(|p| self.inner.registry.wrap(p, None))
            .filter(|p| !p.with(|data| filter.excludes(data)))
            .collect()
    }

    /// Players partitioned by the given team order; placement of teams not
    /// in the order follows the configured policy.
    pub fn get_player_list_by_teams(
        &self,
        order: &[TeamId],
        filter: &PlayerFilter,
    ) -> Vec<Vec<PlayerHandle>> {
        bucket_by_teams(
            self.get_player_list(filter),
            order,
            self.inner.unlisted_teams,
        )
    }

    /// Write a tracked custom property.
    ///
    /// Deferred properties are applied on the next scheduling tick; either
    /// way a change event fires only if the value actually differs.
    pub fn set_player_property(
        &self,
        id: PlayerId,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let spec = self
            .inner
            .registry
            .spec(name)
            .ok_or_else(|| Error::UnknownProperty(name.to_string()))?;
        if spec.deferred {
            let name = name.to_string();
            self.defer(move |room| {
                if let Err(e) = room.apply_property(id, &name, value) {
                    debug!(id, property = %name, "deferred property write dropped: {e}");
                }
            });
            Ok(())
        } else {
            self.apply_property(id, name, value)
        }
    }

    fn apply_property(&self, id: PlayerId, name: &str, value: Value) -> Result<()> {
        let player = self
            .inner
            .registry
            .get(id)
            .ok_or(Error::PlayerNotFound(id))?;
        if self.inner.registry.set_property(&player, name, value)? {
            self.dispatch(&RoomEvent::PropertyChange {
                property: name.to_string(),
                player,
            });
        }
        Ok(())
    }

    /*
     * ==========
     * SCHEDULING
     * ==========
     */

    /// Run `f` after the current native callback unwinds.
    ///
    /// Deferred tasks run in FIFO order relative to each other, but native
    /// events arriving before the drain still run first.
    pub fn defer(&self, f: impl FnOnce(&Room) + Send + 'static) {
        self.inner.deferred.lock().push_back(Box::new(f));
    }

    /// Drain the deferred queue. Called automatically when the outermost
    /// `handle_native` returns; hosts driving the room manually can call it
    /// from their own scheduler.
    pub fn run_deferred(&self) {
        loop {
            let task = self.inner.deferred.lock().pop_front();
            match task {
                Some(task) => task(self),
                None => break,
            }
        }
    }

    /*
     * ============
     * SHARED STATE
     * ============
     */

    pub fn with_state<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        f(&self.inner.state.read())
    }

    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        f(&mut self.inner.state.write())
    }

    pub(crate) fn merge_default_state(&self, defaults: Value) {
        match defaults {
            Value::Null => {}
            Value::Object(map) => {
                let mut state = self.inner.state.write();
                let Value::Object(state_map) = &mut *state else {
                    return;
                };
                for (key, value) in map {
                    state_map.entry(key).or_insert(value);
                }
            }
            other => warn!("module default state must be an object, got {other}"),
        }
    }

    /// Borrow a constructed module of type `M`.
    pub fn with_module<M: RoomModule, R>(&self, f: impl FnOnce(&M) -> R) -> Option<R> {
        let modules = self.inner.modules.read();
        modules
            .iter()
            .find_map(|m| m.as_any().downcast_ref::<M>())
            .map(f)
    }

    pub fn stats(&self) -> RoomStats {
        RoomStats {
            modules: self.inner.modules.read().len(),
            commands: self.inner.commands.len(),
            players: self.inner.registry.len(),
            subscriptions: self.inner.subscriptions.read().values().map(Vec::len).sum(),
        }
    }

    /*
     * =================
     * DELEGATED METHODS
     * =================
     */

    pub fn send_chat(&self, message: &str, target: Option<PlayerId>) {
        self.inner.native.send_chat(message, target)
    }

    pub fn set_player_admin(&self, id: PlayerId, admin: bool) {
        self.inner.native.set_player_admin(id, admin)
    }

    pub fn set_player_team(&self, id: PlayerId, team: TeamId) {
        self.inner.native.set_player_team(id, team)
    }

    pub fn kick_player(&self, id: PlayerId, reason: &str, ban: bool) {
        self.inner.native.kick_player(id, reason, ban)
    }

    pub fn clear_ban(&self, id: PlayerId) {
        self.inner.native.clear_ban(id)
    }

    pub fn clear_bans(&self) {
        self.inner.native.clear_bans()
    }

    pub fn set_score_limit(&self, limit: u32) {
        self.inner.native.set_score_limit(limit)
    }

    pub fn set_time_limit(&self, minutes: u32) {
        self.inner.native.set_time_limit(minutes)
    }

    pub fn set_custom_stadium(&self, contents: &str) {
        self.inner.native.set_custom_stadium(contents)
    }

    pub fn set_default_stadium(&self, name: &str) {
        self.inner.native.set_default_stadium(name)
    }

    pub fn set_teams_lock(&self, locked: bool) {
        self.inner.native.set_teams_lock(locked)
    }

    pub fn set_team_colors(&self, team: TeamId, angle: u16, text_color: u32, colors: &[u32]) {
        self.inner.native.set_team_colors(team, angle, text_color, colors)
    }

    pub fn start_game(&self) {
        self.inner.native.start_game()
    }

    pub fn stop_game(&self) {
        self.inner.native.stop_game()
    }

    pub fn pause_game(&self, paused: bool) {
        self.inner.native.pause_game(paused)
    }

    pub fn get_scores(&self) -> Option<Scores> {
        self.inner.native.get_scores()
    }

    pub fn get_ball_position(&self) -> Option<Vec2> {
        self.inner.native.get_ball_position()
    }

    pub fn start_recording(&self) {
        self.inner.native.start_recording()
    }

    pub fn stop_recording(&self) -> Option<Vec<u8>> {
        self.inner.native.stop_recording()
    }

    pub fn set_password(&self, password: Option<&str>) {
        self.inner.native.set_password(password)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::player::PropertySpec;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn veto_from_any_subscriber_vetoes_the_dispatch() {
        let room = stub_room();
        let calls = Arc::new(AtomicUsize::new(0));

        for flow in [Flow::Continue, Flow::Veto, Flow::Continue] {
            let calls = Arc::clone(&calls);
            room.on("player_chat", move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(flow)
            });
        }

        let flow = room.handle_native(NativeEvent::PlayerChat {
            player: native_player(1, "alice"),
            message: "hi".to_string(),
        });
        assert_eq!(flow, Flow::Veto);
        // Every handler runs exactly once, veto or not.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn a_failing_handler_does_not_stop_the_others() {
        let room = stub_room();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = Arc::clone(&calls);
        room.on("game_tick", move |_, _| {
            first.fetch_add(1, Ordering::SeqCst);
            Ok(Flow::Continue)
        });
        room.on("game_tick", |_, _| Err(Error::Module("boom".to_string())));
        let third = Arc::clone(&calls);
        room.on("game_tick", move |_, _| {
            third.fetch_add(1, Ordering::SeqCst);
            Ok(Flow::Continue)
        });

        let flow = room.handle_native(NativeEvent::GameTick);
        assert_eq!(flow, Flow::Continue);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribing_stops_delivery() {
        let room = stub_room();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = room.on("game_tick", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Flow::Continue)
        });

        room.handle_native(NativeEvent::GameTick);
        assert!(room.off(id));
        assert!(!room.off(id));
        room.handle_native(NativeEvent::GameTick);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deferred_property_writes_apply_after_the_event() {
        let options = RoomOptions::default().with_property(PropertySpec::new("goals", json!(0)));
        let room = stub_room_with(options);
        room.handle_native(NativeEvent::PlayerJoin {
            player: native_player(4, "dana"),
        });

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        room.on("player_goals_change", move |_, event| {
            if let RoomEvent::PropertyChange { player, .. } = event {
                counter.store(
                    player.property("goals").and_then(|v| v.as_u64()).unwrap() as usize,
                    Ordering::SeqCst,
                );
            }
            Ok(Flow::Continue)
        });

        room.set_player_property(4, "goals", json!(2)).unwrap();
        // Not applied until the queue drains.
        let player = room.inner.registry.get(4).unwrap();
        assert_eq!(player.property("goals"), Some(json!(0)));

        room.run_deferred();
        assert_eq!(player.property("goals"), Some(json!(2)));
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        // Same value again: silent no-op.
        room.set_player_property(4, "goals", json!(2)).unwrap();
        room.run_deferred();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn module_default_state_fills_only_missing_keys() {
        let room = stub_room_with(RoomOptions {
            state: json!({ "motd": "hello" }),
            ..RoomOptions::default()
        });
        room.merge_default_state(json!({ "motd": "ignored", "round": 1 }));
        room.with_state(|state| {
            assert_eq!(state["motd"], json!("hello"));
            assert_eq!(state["round"], json!(1));
        });
    }

    #[test]
    fn re_entrant_dispatch_is_depth_first() {
        let room = stub_room();
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner_log = Arc::clone(&log);
        room.on("outer", move |_, _| {
            inner_log.lock().push("outer-begin");
            Ok(Flow::Continue)
        });
        let nested = Arc::clone(&log);
        room.on("outer", move |room, _| {
            room.dispatch_custom("inner", json!(null));
            nested.lock().push("outer-end");
            Ok(Flow::Continue)
        });
        let inner = Arc::clone(&log);
        room.on("inner", move |_, _| {
            inner.lock().push("inner");
            Ok(Flow::Continue)
        });

        room.dispatch_custom("outer", json!(null));
        assert_eq!(*log.lock(), vec!["outer-begin", "inner", "outer-end"]);
    }

    #[tokio::test]
    async fn broadcast_mirror_sees_dispatched_events() {
        let room = stub_room();
        let mut rx = room.subscribe_broadcast();
        room.dispatch_custom("score_update", json!({ "red": 1 }));
        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            RoomEvent::Custom { name, data } => {
                assert_eq!(name, "score_update");
                assert_eq!(data["red"], json!(1));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
