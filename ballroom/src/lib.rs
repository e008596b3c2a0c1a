//! Ballroom room framework
//!
//! An ergonomic layer over a host-injected ball-game room engine: typed
//! events and players, a dependency-injected module system, and a command
//! dispatch layer with role-based access control.

pub mod access;
pub mod command_system;
pub mod config;
pub mod dependency;
pub mod event_system;
pub mod player;
pub mod room;

// Re-exports
pub use access::{AccessPredicate, RoleTable};
pub use command_system::{Command, CommandDef, CommandInfo, CommandRegistry, CommandSpec};
pub use config::{RoomOptions, UnlistedTeamPolicy};
pub use dependency::{Dependency, ModuleClass, ModuleContext, RoomModule};
pub use event_system::{EventKey, Flow, RoomEvent, RoomHandlers, SubscriptionId};
pub use player::{PlayerData, PlayerFilter, PlayerHandle, PropertySpec};
pub use room::{Room, RoomHandle};

pub use ballroom_common::{
    BridgeError, GeoHint, HostContext, HostEnvironment, NativeEvent, NativePlayer, NativeRoom,
    NativeRoomConfig, PlayerId, Scores, TeamId, Vec2, HOST_ID,
};

/// Result type for framework operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the room framework.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("the room is not initialized or has been destroyed")]
    NotInitialized,
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("cannot inject `{dependency}` into module `{module}`: it is not an injectable module")]
    InvalidDependency {
        module: String,
        dependency: String,
    },
    #[error("module `{0}` cannot depend on itself")]
    SelfDependency(String),
    #[error("cyclic module dependency: {0}")]
    CyclicDependency(String),
    #[error("no module metadata is registered for `{0}`")]
    MissingDependencyMetadata(String),
    #[error("command `{0}` is already registered")]
    DuplicateCommandName(String),
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("access to command `{0}` denied")]
    AccessDenied(String),
    #[error("bad access string {input:?}: {reason}")]
    BadAccessString {
        input: String,
        reason: String,
    },
    #[error("invalid command definition: {0}")]
    InvalidCommand(String),
    #[error("unknown player property `{0}`")]
    UnknownProperty(String),
    #[error("player {0} is not connected")]
    PlayerNotFound(PlayerId),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("module error: {0}")]
    Module(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Module(s)
    }
}
