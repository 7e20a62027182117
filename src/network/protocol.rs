//! Protocol Messages
//!
//! Wire format for client-server communication: one UTF-8 JSON object
//! per line, shaped `{"cmd":"<COMMAND>","payload":{...}}` and
//! terminated by `\n` (a trailing CR is tolerated). The adjacently
//! tagged serde enums below produce exactly that shape, and the
//! serializer guarantees escaping of anything interpolated into a
//! frame (usernames, chat).

use serde::{Deserialize, Serialize};

use crate::game::board::ShipSpec;
use crate::network::session::PlayerStatus;
use crate::store::history::{MatchRecord, MatchResult};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Commands sent from client to server.
///
/// A frame that fails to parse into one of these (bad JSON, unknown
/// `cmd`, missing field) is answered with `SYSTEM_MSG {code:400}` and
/// changes no state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientCommand {
    /// Create an account.
    Register { username: String, password: String },

    /// Authenticate this connection.
    Login { username: String, password: String },

    /// Return to the unauthenticated state.
    Logout {},

    /// List players visible in the lobby.
    PlayerList {},

    /// Top accounts by rating.
    Leaderboard {},

    /// The caller's recent match records.
    MatchHistory {},

    /// Enter the skill-bucketed pairing queue.
    StartMatching {},

    /// Leave the pairing queue.
    CancelMatching {},

    /// Confirm a `MATCH_FOUND` pairing.
    MatchReady {},

    /// Decline a `MATCH_FOUND` pairing.
    MatchDecline {},

    /// Challenge a specific player directly.
    Challenge { target_username: String },

    /// Answer an incoming challenge. `status` is `ACCEPT` or `REJECT`.
    ChallengeReply { challenger_username: String, status: String },

    /// Submit the full fleet. Numeric row/col, unlike `MOVE`.
    PlaceShips { ships: Vec<ShipSpec> },

    /// Fire at a coordinate in wire form (`"A0"`..`"J9"`).
    Move { coord: String },

    /// In-game chat, relayed to the opponent only.
    Chat { message: String },

    /// Concede the current game.
    Surrender {},

    /// Offer the opponent a draw.
    DrawOffer {},

    /// Answer a draw offer. `status` is `accept` or `reject`.
    DrawReply { status: String },

    /// Latency probe.
    Ping {},

    /// Report a measured ping, forwarded to an in-game opponent.
    UpdatePing { ping: u32 },
}

impl ClientCommand {
    /// Parse one received line. The caller strips nothing; trailing
    /// CR/LF from the socket is tolerated here.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end_matches(['\r', '\n']))
    }

    /// Serialize to a newline-terminated frame (used by tests and
    /// client tooling).
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        let mut s = serde_json::to_string(self)?;
        s.push('\n');
        Ok(s)
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Result of one shot as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShotResult {
    Hit,
    Miss,
    /// The cell was shot before; nothing changed and the turn stays.
    AlreadyHit,
}

/// A lobby entry in a `PLAYER_LIST` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerEntry {
    pub username: String,
    pub status: PlayerStatus,
    pub rating: i32,
}

/// One row of the leaderboard, rank 1 first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardRow {
    pub rank: u32,
    pub username: String,
    pub rating: i32,
    pub games: u32,
    pub wins: u32,
    /// Wins over games played, 0.0 when no games yet.
    pub winrate: f64,
}

/// Frames emitted by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    /// Greeting sent on connect.
    Welcome { message: String },

    /// Account created.
    RegisterSuccess { message: String },

    /// Authenticated. The token is opaque and at least 128 bits of
    /// entropy; it is not a reconnect credential.
    LoginSuccess {
        username: String,
        rating: i32,
        #[serde(rename = "sessionToken")]
        session_token: String,
    },

    /// Session returned to the unauthenticated state.
    LogoutSuccess {},

    /// Lobby listing, requester excluded.
    PlayerList { players: Vec<PlayerEntry> },

    /// Top accounts by rating.
    Leaderboard { players: Vec<LeaderboardRow> },

    /// The caller's recent matches, newest first.
    MatchHistory { matches: Vec<MatchRecord> },

    /// Queued for pairing.
    MatchingStarted { message: String },

    /// Left the pairing queue.
    MatchingCancelled { message: String },

    /// Paired; answer with `MATCH_READY` or `MATCH_DECLINE`.
    MatchFound { opponent: String, rating: i32 },

    /// The pairing fell through (peer declined, disconnected, or the
    /// handshake timed out).
    MatchDeclined { message: String },

    /// The paired opponent confirmed readiness.
    OpponentReady { username: String },

    /// Both sides committed; the game begins in the placement phase.
    GameStart { opponent: String, your_turn: bool },

    /// Fleet accepted.
    PlaceShipAck { message: String },

    /// Fleet accepted; the opponent is still placing.
    WaitingOpponent { message: String },

    /// Both fleets placed; shots may be exchanged.
    GameReady { your_turn: bool },

    /// A resolved shot, sent to both players (shooter distinguished by
    /// `is_your_shot`). `ship_sunk` is empty unless this shot completed
    /// a ship; `game_over` appears only on the winning shot.
    MoveResult {
        coord: String,
        result: ShotResult,
        ship_sunk: String,
        is_your_shot: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        game_over: Option<bool>,
    },

    /// Turn handoff after a hit or miss.
    TurnChange { your_turn: bool },

    /// Relayed chat line.
    Chat { from: String, message: String },

    /// An incoming challenge.
    Challenge { challenger: String },

    /// The challenged player's answer, relayed to the challenger.
    ChallengeReply { target_username: String, status: String },

    /// The opponent proposes a draw.
    DrawOffer { from: String },

    /// The opponent refused the draw offer.
    DrawRejected {},

    /// Terminal game notification with the post-game rating.
    GameEnd { result: MatchResult, reason: String, rating: i32 },

    /// The opponent's reported latency.
    PingUpdate { opponent_ping: u32 },

    /// Reply to `PING`. Server clock, Unix milliseconds.
    Pong { timestamp: i64 },

    /// Error/status channel: 200 info, 400 bad request or state, 401
    /// unauthenticated, 404 not found, 500 internal.
    SystemMsg { code: u16, message: String },
}

impl ServerEvent {
    /// Serialize to a newline-terminated frame.
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        let mut s = serde_json::to_string(self)?;
        s.push('\n');
        Ok(s)
    }

    pub fn system(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::SystemMsg { code, message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::system(400, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::system(401, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::system(404, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::system(500, message)
    }
}
