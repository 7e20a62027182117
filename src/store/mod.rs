//! Persistence Layer
//!
//! File-backed storage: the account table and per-user match history.
//! Both stores serialize their read-modify-write cycles behind a lock
//! and are plain synchronous code; the files involved are tiny.

pub mod accounts;
pub mod history;

pub use accounts::{Account, AccountStore, StoreError};
pub use history::{HistoryStore, MatchRecord, MatchResult};
