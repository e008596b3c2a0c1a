//! Ballroom native host surface
//!
//! Value types and traits shared between the framework and host-environment
//! adapters: player snapshots, the fixed native event set, the `NativeRoom`
//! operation surface and the one-room-per-context bridge guard.

pub mod bridge;
pub mod event;
pub mod types;

pub use bridge::{HostContext, HostEnvironment, NativeRoom};
pub use event::NativeEvent;
pub use types::{
    GeoHint, NativePlayer, NativeRoomConfig, PlayerId, Scores, TeamId, Vec2, HOST_ID,
};

/// Error type for the host bridge.
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("a room has already been initialized in this hosting context")]
    AlreadyInitialized,
    #[error("the native room handle is not initialized")]
    NotInitialized,
    #[error("host error: {0}")]
    Host(String),
}
