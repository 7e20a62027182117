//! Account Store
//!
//! The persistent account table: one `username:secret:rating:games:wins`
//! line per account. Secrets are argon2id PHC strings (which never
//! contain `:`), so the line format stays splittable. The whole table
//! loads into memory at startup; every mutation rewrites the file
//! atomically (temp file + rename) under the store lock.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use thiserror::Error;

use crate::{DEFAULT_RATING, MAX_USERNAME};

/// One persisted account.
#[derive(Clone, Debug)]
pub struct Account {
    pub username: String,
    /// Argon2id PHC string.
    secret: String,
    pub rating: i32,
    pub games_played: u32,
    pub games_won: u32,
}

impl Account {
    /// Win rate in [0, 1]; 0 before the first game.
    pub fn winrate(&self) -> f64 {
        if self.games_played == 0 {
            0.0
        } else {
            f64::from(self.games_won) / f64::from(self.games_played)
        }
    }
}

/// Account store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Registration with a taken username.
    #[error("username {0:?} is already taken")]
    UsernameTaken(String),

    /// Username outside `[A-Za-z0-9_]{1,49}`.
    #[error("invalid username")]
    InvalidUsername,

    /// Stats update for an account that does not exist.
    #[error("no such account {0:?}")]
    NoSuchAccount(String),

    /// Unparseable line in the accounts file.
    #[error("corrupt account record: {0}")]
    Corrupt(String),

    /// Password hashing failed.
    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Registration-time username rule: `[A-Za-z0-9_]{1,49}`. Keeping the
/// alphabet this small also keeps usernames trivially JSON- and
/// filename-safe.
pub fn valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= MAX_USERNAME
        && username.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// The account table.
pub struct AccountStore {
    path: PathBuf,
    state: Mutex<BTreeMap<String, Account>>,
}

impl AccountStore {
    /// Open the store, loading every account from `path` if it exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut accounts = BTreeMap::new();

        match fs::read_to_string(&path) {
            Ok(contents) => {
                for line in contents.lines().filter(|l| !l.is_empty()) {
                    let account = parse_line(line)?;
                    accounts.insert(account.username.clone(), account);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        Ok(Self { path, state: Mutex::new(accounts) })
    }

    /// Create an account with the default rating. The secret is hashed
    /// before anything touches disk.
    pub fn register(&self, username: &str, password: &str) -> Result<(), StoreError> {
        if !valid_username(username) {
            return Err(StoreError::InvalidUsername);
        }

        let salt = SaltString::generate(&mut OsRng);
        let secret = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| StoreError::Hash(e.to_string()))?
            .to_string();

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.contains_key(username) {
            return Err(StoreError::UsernameTaken(username.to_string()));
        }

        state.insert(
            username.to_string(),
            Account {
                username: username.to_string(),
                secret,
                rating: DEFAULT_RATING,
                games_played: 0,
                games_won: 0,
            },
        );
        self.persist(&state)
    }

    /// Verify credentials. Unknown usernames and bad passwords are the
    /// same `false`.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(account) = state.get(username) else {
            return false;
        };
        let Ok(parsed) = PasswordHash::new(&account.secret) else {
            return false;
        };
        Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
    }

    /// Look up one account.
    pub fn get(&self, username: &str) -> Option<Account> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).get(username).cloned()
    }

    /// Current rating for a username.
    pub fn rating(&self, username: &str) -> Option<i32> {
        self.get(username).map(|a| a.rating)
    }

    /// Apply a game result: rating moves by `delta` (clamped at zero),
    /// games played increments, wins increment for the winner.
    /// Returns the new rating.
    pub fn update_stats(
        &self,
        username: &str,
        delta: i32,
        was_winner: bool,
    ) -> Result<i32, StoreError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let account = state
            .get_mut(username)
            .ok_or_else(|| StoreError::NoSuchAccount(username.to_string()))?;

        account.rating = (account.rating + delta).max(0);
        account.games_played += 1;
        if was_winner {
            account.games_won += 1;
        }
        let rating = account.rating;
        self.persist(&state)?;
        Ok(rating)
    }

    /// Top `top_n` accounts, rating descending, username ascending on
    /// ties.
    pub fn leaderboard(&self, top_n: usize) -> Vec<Account> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut accounts: Vec<Account> = state.values().cloned().collect();
        accounts.sort_by(|a, b| {
            b.rating.cmp(&a.rating).then_with(|| a.username.cmp(&b.username))
        });
        accounts.truncate(top_n);
        accounts
    }

    fn persist(&self, state: &BTreeMap<String, Account>) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            for account in state.values() {
                writeln!(
                    file,
                    "{}:{}:{}:{}:{}",
                    account.username,
                    account.secret,
                    account.rating,
                    account.games_played,
                    account.games_won
                )?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn parse_line(line: &str) -> Result<Account, StoreError> {
    let corrupt = || StoreError::Corrupt(line.to_string());
    let parts: Vec<&str> = line.split(':').collect();
    if parts.len() != 5 {
        return Err(corrupt());
    }
    Ok(Account {
        username: parts[0].to_string(),
        secret: parts[1].to_string(),
        rating: parts[2].parse().map_err(|_| corrupt())?,
        games_played: parts[3].parse().map_err(|_| corrupt())?,
        games_won: parts[4].parse().map_err(|_| corrupt())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &tempfile::TempDir) -> AccountStore {
        AccountStore::open(dir.path().join("users.dat")).unwrap()
    }

    #[test]
    fn test_register_and_authenticate() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);

        store.register("alice", "hunter2").unwrap();
        assert!(store.authenticate("alice", "hunter2"));
        assert!(!store.authenticate("alice", "wrong"));
        assert!(!store.authenticate("nobody", "hunter2"));
        assert_eq!(store.rating("alice"), Some(DEFAULT_RATING));
    }

    #[test]
    fn test_secrets_are_hashed_on_disk() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.register("alice", "hunter2").unwrap();

        let raw = std::fs::read_to_string(dir.path().join("users.dat")).unwrap();
        assert!(!raw.contains("hunter2"));
        assert!(raw.contains("$argon2"));
    }

    #[test]
    fn test_duplicate_register_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.register("alice", "pw1").unwrap();

        assert!(matches!(
            store.register("alice", "pw2"),
            Err(StoreError::UsernameTaken(_))
        ));

        // The original credentials survive a reload.
        let reloaded = open_store(&dir);
        assert!(reloaded.authenticate("alice", "pw1"));
        assert!(!reloaded.authenticate("alice", "pw2"));
    }

    #[test]
    fn test_username_rule() {
        assert!(valid_username("alice_99"));
        assert!(valid_username(&"a".repeat(49)));
        assert!(!valid_username(""));
        assert!(!valid_username(&"a".repeat(50)));
        assert!(!valid_username("no spaces"));
        assert!(!valid_username("no:colons"));
        assert!(!valid_username("no\"quotes"));

        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        assert!(matches!(store.register("no spaces", "pw"), Err(StoreError::InvalidUsername)));
    }

    #[test]
    fn test_update_stats_and_clamp() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        store.register("alice", "pw").unwrap();

        assert_eq!(store.update_stats("alice", 10, true).unwrap(), 810);
        let account = store.get("alice").unwrap();
        assert_eq!(account.games_played, 1);
        assert_eq!(account.games_won, 1);

        // Lose enough and the floor kicks in.
        for _ in 0..100 {
            store.update_stats("alice", -10, false).unwrap();
        }
        assert_eq!(store.rating("alice"), Some(0));

        assert!(matches!(
            store.update_stats("nobody", 10, true),
            Err(StoreError::NoSuchAccount(_))
        ));
    }

    #[test]
    fn test_stats_survive_reload() {
        let dir = tempdir().unwrap();
        {
            let store = open_store(&dir);
            store.register("alice", "pw").unwrap();
            store.update_stats("alice", 10, true).unwrap();
        }

        let store = open_store(&dir);
        let account = store.get("alice").unwrap();
        assert_eq!(account.rating, 810);
        assert_eq!(account.games_played, 1);
        assert!(store.authenticate("alice", "pw"));
    }

    #[test]
    fn test_leaderboard_order_and_ties() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir);
        for name in ["carol", "alice", "bob", "dave"] {
            store.register(name, "pw").unwrap();
        }
        store.update_stats("dave", 10, true).unwrap();
        store.update_stats("carol", -10, false).unwrap();

        let board = store.leaderboard(3);
        let names: Vec<_> = board.iter().map(|a| a.username.as_str()).collect();
        // dave 810, then the 800 tie broken by username, top 3 only.
        assert_eq!(names, vec!["dave", "alice", "bob"]);
        assert_eq!(board[0].winrate(), 1.0);
        assert_eq!(board[1].winrate(), 0.0);
    }
}
