//! # Broadside Server
//!
//! Authoritative multiplayer battleship over TCP: accounts with ELO
//! ratings, a lobby with skill-bucketed matchmaking and direct
//! challenges, and concurrent two-player duels with chat, surrender,
//! and draws. Clients speak line-delimited JSON frames shaped
//! `{"cmd":"...","payload":{...}}`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     BROADSIDE SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/           - Authoritative rules (pure, sync)          │
//! │  ├── board.rs    - 10x10 grid, placement, shot resolution    │
//! │  └── battle.rs   - Duel state machine (turns, draws, wins)   │
//! │                                                              │
//! │  store/          - Persistence                               │
//! │  ├── accounts.rs - Account table, argon2 secrets, ratings    │
//! │  └── history.rs  - Per-user match history files              │
//! │                                                              │
//! │  network/        - Transport and shared state                │
//! │  ├── protocol.rs - JSON wire frames                          │
//! │  ├── session.rs  - Connection registry and presence          │
//! │  ├── matchmaker.rs - Pairing queue + ready handshake         │
//! │  └── server.rs   - Accept loop, dispatch, resolver, reaper   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authority Guarantee
//!
//! Clients never mutate game state directly: every placement and shot
//! is validated and resolved server-side under a per-battle lock, and
//! the two participants observe shot results in one order.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod game;
pub mod network;
pub mod store;

// Re-export commonly used types
pub use game::battle::{Battle, BattleStatus, GameId, Side};
pub use game::board::{Board, Cell, Coord, ShipSpec};
pub use network::protocol::{ClientCommand, ServerEvent};
pub use network::server::{Server, ServerConfig, ServerError};
pub use store::accounts::AccountStore;
pub use store::history::{HistoryStore, MatchResult};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Board edge length
pub const GRID_SIZE: usize = 10;

/// The fixed fleet: one ship of each listed size (two threes)
pub const FLEET_SIZES: [u8; 5] = [5, 4, 3, 3, 2];

/// Sum of the fleet sizes; hitting this many cells wins
pub const TOTAL_SHIP_CELLS: u32 = 17;

/// Longest accepted ship label
pub const MAX_SHIP_NAME: usize = 29;

/// Longest accepted username
pub const MAX_USERNAME: usize = 49;

/// Rating assigned to fresh accounts
pub const DEFAULT_RATING: i32 = 800;

/// Rows returned by LEADERBOARD
pub const LEADERBOARD_LIMIT: usize = 50;

/// Rows returned by MATCH_HISTORY
pub const HISTORY_LIMIT: usize = 50;
