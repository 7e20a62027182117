//! Match History
//!
//! Append-only per-user record files, `<dir>/match_history_<username>`,
//! one `timestamp:opponent:result` line per finished game.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::accounts::StoreError;

/// Outcome of a match from one player's perspective. Wire and file
/// form are both the SCREAMING name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchResult {
    Win,
    Lose,
    Draw,
}

impl MatchResult {
    fn as_str(self) -> &'static str {
        match self {
            MatchResult::Win => "WIN",
            MatchResult::Lose => "LOSE",
            MatchResult::Draw => "DRAW",
        }
    }
}

impl std::fmt::Display for MatchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchResult {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WIN" => Ok(MatchResult::Win),
            "LOSE" => Ok(MatchResult::Lose),
            "DRAW" => Ok(MatchResult::Draw),
            _ => Err(()),
        }
    }
}

/// One stored match record. Also the wire shape of a `MATCH_HISTORY`
/// row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    /// Unix seconds.
    pub timestamp: i64,
    pub opponent: String,
    pub result: MatchResult,
}

/// Per-user match history files under one directory.
pub struct HistoryStore {
    dir: PathBuf,
    // Serializes appends; reads go straight to the file.
    lock: Mutex<()>,
}

impl HistoryStore {
    /// Open (and create) the history directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, lock: Mutex::new(()) })
    }

    fn file_for(&self, username: &str) -> PathBuf {
        self.dir.join(format!("match_history_{username}"))
    }

    /// Append one record to a user's history file.
    pub fn append(
        &self,
        username: &str,
        opponent: &str,
        result: MatchResult,
        timestamp: i64,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(username))?;
        writeln!(file, "{timestamp}:{opponent}:{result}")?;
        Ok(())
    }

    /// Read a user's records, newest first, up to `limit`. A user with
    /// no history file simply has no records. Malformed lines are
    /// skipped.
    pub fn read(&self, username: &str, limit: usize) -> Result<Vec<MatchRecord>, StoreError> {
        let contents = match fs::read_to_string(self.file_for(username)) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records: Vec<MatchRecord> = contents
            .lines()
            .filter_map(|line| match parse_line(line) {
                Some(record) => Some(record),
                None => {
                    warn!(username, line, "skipping malformed history line");
                    None
                }
            })
            .collect();

        records.reverse();
        records.truncate(limit);
        Ok(records)
    }
}

fn parse_line(line: &str) -> Option<MatchRecord> {
    let mut parts = line.splitn(3, ':');
    let timestamp = parts.next()?.parse().ok()?;
    let opponent = parts.next()?.to_string();
    let result = parts.next()?.parse().ok()?;
    Some(MatchRecord { timestamp, opponent, result })
}
