//! Network Layer
//!
//! TCP server speaking line-delimited JSON frames. This layer owns all
//! shared mutable state - the game rules themselves live in `game/`.

pub mod matchmaker;
pub mod protocol;
pub mod server;
pub mod session;

pub use matchmaker::{Matchmaker, PairExpiry, ReadyOutcome};
pub use protocol::{ClientCommand, ServerEvent};
pub use server::{Server, ServerConfig, ServerError};
pub use session::{PlayerStatus, Registry, Session, SessionId};
