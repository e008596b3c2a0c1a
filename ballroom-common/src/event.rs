use crate::types::{NativePlayer, Scores, TeamId};

/// The fixed set of native callbacks the host engine can fire.
///
/// Each variant carries the statically known argument shape of its callback
/// slot, so player payloads never have to be detected structurally at
/// runtime.
#[derive(Debug, Clone)]
pub enum NativeEvent {
    PlayerJoin { player: NativePlayer },
    PlayerLeave { player: NativePlayer },
    TeamVictory { scores: Scores },
    PlayerChat { player: NativePlayer, message: String },
    PlayerBallKick { player: NativePlayer },
    TeamGoal { team: TeamId },
    GameStart { by: Option<NativePlayer> },
    GameStop { by: Option<NativePlayer> },
    PlayerAdminChange { player: NativePlayer, by: Option<NativePlayer> },
    PlayerTeamChange { player: NativePlayer, by: Option<NativePlayer> },
    PlayerKicked {
        player: NativePlayer,
        reason: String,
        ban: bool,
        by: Option<NativePlayer>,
    },
    GameTick,
    GamePause { by: Option<NativePlayer> },
    GameUnpause { by: Option<NativePlayer> },
    PositionsReset,
    StadiumChange { stadium: String, by: Option<NativePlayer> },
    RoomLink { url: String },
}
