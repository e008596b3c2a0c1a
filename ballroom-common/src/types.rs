use serde::{Deserialize, Serialize};

/// Numeric id assigned by the host to every connected participant.
pub type PlayerId = u32;

/// Id 0 is the host/server itself and is excluded from player listings.
pub const HOST_ID: PlayerId = 0;

/// Team assignment of a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TeamId {
    #[default]
    Spectators,
    Red,
    Blue,
}

/// 2D position in stadium coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

/// Current game scores as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Scores {
    pub red: u32,
    pub blue: u32,
    /// Elapsed game time in seconds.
    pub time: f64,
    pub score_limit: u32,
    /// Time limit in minutes, 0 for unlimited.
    pub time_limit: u32,
}

/// Raw player snapshot as delivered by the host engine.
///
/// Snapshots are transient: the host hands a fresh one to every callback.
/// The framework folds them into long-lived wrappers, never stores them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativePlayer {
    pub id: PlayerId,
    pub name: String,
    pub team: TeamId,
    pub admin: bool,
    /// `None` while the player is not in active play.
    pub position: Option<Vec2>,
    /// Public auth token of the player.
    pub auth: String,
    /// Connection fingerprint.
    pub conn: String,
}

/// Geolocation hint for room listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GeoHint {
    pub code: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

/// Fixed configuration object handed to the host's room factory.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NativeRoomConfig {
    pub room_name: Option<String>,
    /// Name the host player appears under.
    pub player_name: Option<String>,
    pub password: Option<String>,
    pub max_players: Option<u32>,
    pub public: bool,
    pub geo: Option<GeoHint>,
    /// Auth token of the hosting player.
    pub auth_token: Option<String>,
    /// Room-initialization token issued by the host service.
    pub init_token: Option<String>,
}
