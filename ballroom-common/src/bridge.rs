use std::sync::atomic::{AtomicBool, Ordering};

use crate::types::{NativePlayer, NativeRoomConfig, PlayerId, Scores, TeamId, Vec2};
use crate::BridgeError;

/// Imperative surface of a native room handle.
///
/// Every method forwards its arguments to the host engine verbatim; no
/// framework logic lives behind this trait. Adapters for a concrete host
/// implement it, the framework only ever calls it.
pub trait NativeRoom: Send + Sync {
    fn send_chat(&self, message: &str, target: Option<PlayerId>);
    fn set_player_admin(&self, id: PlayerId, admin: bool);
    fn set_player_team(&self, id: PlayerId, team: TeamId);
    fn kick_player(&self, id: PlayerId, reason: &str, ban: bool);
    fn clear_ban(&self, id: PlayerId);
    fn clear_bans(&self);
    fn set_score_limit(&self, limit: u32);
    fn set_time_limit(&self, minutes: u32);
    fn set_custom_stadium(&self, contents: &str);
    fn set_default_stadium(&self, name: &str);
    fn set_teams_lock(&self, locked: bool);
    fn set_team_colors(&self, team: TeamId, angle: u16, text_color: u32, colors: &[u32]);
    fn start_game(&self);
    fn stop_game(&self);
    fn pause_game(&self, paused: bool);
    fn get_scores(&self) -> Option<Scores>;
    fn get_ball_position(&self) -> Option<Vec2>;
    fn start_recording(&self);
    fn stop_recording(&self) -> Option<Vec<u8>>;
    fn set_password(&self, password: Option<&str>);
    fn get_player(&self, id: PlayerId) -> Option<NativePlayer>;
    fn get_player_list(&self) -> Vec<NativePlayer>;
}

/// A host environment capable of creating one native room.
pub trait HostEnvironment {
    /// Obtain a native room handle for the given configuration.
    fn init_room(&self, config: &NativeRoomConfig) -> Result<Box<dyn NativeRoom>, BridgeError>;
}

/// One hosting context, one room.
///
/// The host's room factory must not be invoked twice for the same page or
/// process; this guard owns that invariant explicitly instead of hiding it
/// in a global flag.
pub struct HostContext<E> {
    env: E,
    initialized: AtomicBool,
}

impl<E: HostEnvironment> HostContext<E> {
    pub fn new(env: E) -> Self {
        Self {
            env,
            initialized: AtomicBool::new(false),
        }
    }

    /// Create the native room, failing if one was already created here.
    pub fn init_room(
        &self,
        config: &NativeRoomConfig,
    ) -> Result<Box<dyn NativeRoom>, BridgeError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::AlreadyInitialized);
        }
        self.env.init_room(config)
    }

    /// Whether a room has been created in this context.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}
