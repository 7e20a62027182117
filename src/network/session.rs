//! Connection Sessions & Presence
//!
//! One `Session` per live TCP connection, all owned by the `Registry`.
//! A session records identity and lifecycle state plus the handles the
//! rest of the server needs to reach the connection: the outbound
//! frame channel (drained by the connection's writer task) and a kick
//! handle the reaper uses to force the reader loop to unwind.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify, RwLock};

use crate::game::battle::GameId;
use crate::network::protocol::{PlayerEntry, ServerEvent};

/// Unique identifier of one live connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// Session lifecycle status. Doubles as the wire form in player lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerStatus {
    /// Connected, not authenticated.
    Offline,
    /// Authenticated, idle.
    Online,
    /// Queued or in the ready handshake.
    InLobby,
    /// Playing a battle.
    InGame,
}

/// Server-side state for one TCP connection.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    /// Empty until LOGIN succeeds.
    pub username: String,
    pub status: PlayerStatus,
    /// Opaque token issued on LOGIN.
    pub token: String,
    /// Rating snapshot, refreshed on login and at game end.
    pub rating: i32,
    /// Outgoing challenge target, if any.
    pub challenge_out: Option<SessionId>,
    /// Incoming challenger, if any.
    pub challenge_in: Option<SessionId>,
    /// Active battle, if any.
    pub game: Option<GameId>,
    /// Last inbound frame.
    pub last_active: Instant,
    /// Latency reported via UPDATE_PING.
    pub ping_ms: Option<u32>,
    /// Outbound frames, drained by the connection's writer task.
    /// Unbounded so emitting under a lock never blocks; a dead peer
    /// just stops draining.
    pub tx: mpsc::UnboundedSender<ServerEvent>,
    /// Wakes the reader loop so the connection unwinds.
    pub kick: Arc<Notify>,
}

impl Session {
    /// The session is logged in.
    pub fn is_authenticated(&self) -> bool {
        self.status != PlayerStatus::Offline
    }

    /// Holding any of: lobby queue slot, pending challenge, battle.
    /// A session may hold at most one engagement at a time.
    pub fn is_engaged(&self) -> bool {
        self.status == PlayerStatus::InLobby
            || self.status == PlayerStatus::InGame
            || self.challenge_out.is_some()
            || self.challenge_in.is_some()
            || self.game.is_some()
    }

    /// Drop all game and matchmaking state and return to ONLINE.
    pub fn reset_to_online(&mut self) {
        self.status = PlayerStatus::Online;
        self.challenge_out = None;
        self.challenge_in = None;
        self.game = None;
    }
}

/// Issue a fresh session token: 128 bits from the OS RNG, hex encoded
/// to 32 characters.
pub fn issue_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The set of live sessions, keyed by id.
///
/// All access goes through short closures under the registry lock; no
/// await happens while the lock is held.
pub struct Registry {
    sessions: RwLock<BTreeMap<SessionId, Session>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a freshly accepted connection.
    pub async fn insert(
        &self,
        tx: mpsc::UnboundedSender<ServerEvent>,
        kick: Arc<Notify>,
    ) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Session {
            id,
            username: String::new(),
            status: PlayerStatus::Offline,
            token: String::new(),
            rating: 0,
            challenge_out: None,
            challenge_in: None,
            game: None,
            last_active: Instant::now(),
            ping_ms: None,
            tx,
            kick,
        };
        self.sessions.write().await.insert(id, session);
        id
    }

    /// Remove a session entirely (connection closed).
    pub async fn remove(&self, id: SessionId) -> Option<Session> {
        self.sessions.write().await.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Read access to one session.
    pub async fn with<R>(&self, id: SessionId, f: impl FnOnce(&Session) -> R) -> Option<R> {
        self.sessions.read().await.get(&id).map(f)
    }

    /// Write access to one session.
    pub async fn with_mut<R>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        self.sessions.write().await.get_mut(&id).map(f)
    }

    /// Queue a frame to one session. A missing session or a hung-up
    /// writer is not an error; the frame is simply dropped.
    pub async fn send(&self, id: SessionId, event: ServerEvent) {
        if let Some(session) = self.sessions.read().await.get(&id) {
            let _ = session.tx.send(event);
        }
    }

    /// Record inbound activity.
    pub async fn touch(&self, id: SessionId) {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            session.last_active = Instant::now();
        }
    }

    /// Atomically bind `username` to session `id`, refusing if any
    /// live session already holds that name. Check and bind happen
    /// under one write lock so two racing logins cannot both win.
    pub async fn try_login(
        &self,
        id: SessionId,
        username: &str,
        rating: i32,
        token: &str,
    ) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.values().any(|s| s.is_authenticated() && s.username == username) {
            return false;
        }
        match sessions.get_mut(&id) {
            Some(s) => {
                s.username = username.to_string();
                s.status = PlayerStatus::Online;
                s.rating = rating;
                s.token = token.to_string();
                true
            }
            None => false,
        }
    }

    /// Atomically record a challenge from `challenger` to `target`.
    /// Verifies under one write lock that the challenger is free and
    /// the target is challengeable (ONLINE or queued IN_LOBBY, no
    /// other challenge, no game), then sets both pointers. Two racing
    /// challengers cannot both claim the same target.
    pub async fn reserve_challenge(&self, challenger: SessionId, target: SessionId) -> bool {
        if challenger == target {
            return false;
        }
        let mut sessions = self.sessions.write().await;

        let challenger_free = sessions
            .get(&challenger)
            .map(|s| s.is_authenticated() && !s.is_engaged())
            .unwrap_or(false);
        let target_free = sessions
            .get(&target)
            .map(|s| {
                matches!(s.status, PlayerStatus::Online | PlayerStatus::InLobby)
                    && s.challenge_in.is_none()
                    && s.challenge_out.is_none()
                    && s.game.is_none()
            })
            .unwrap_or(false);
        if !challenger_free || !target_free {
            return false;
        }

        if let Some(s) = sessions.get_mut(&challenger) {
            s.challenge_out = Some(target);
        }
        if let Some(s) = sessions.get_mut(&target) {
            s.challenge_in = Some(challenger);
        }
        true
    }

    /// Drop every challenge pointer involving `id`, clearing the
    /// counterpart field on the other session as well. Returns the
    /// challenger that was pointing at `id` (with `id`'s username) so
    /// the caller can tell them the challenge is off.
    pub async fn sever_challenges(&self, id: SessionId) -> Option<(SessionId, String)> {
        let mut sessions = self.sessions.write().await;

        let (incoming, outgoing, username) = match sessions.get_mut(&id) {
            Some(s) => {
                let state = (s.challenge_in, s.challenge_out, s.username.clone());
                s.challenge_in = None;
                s.challenge_out = None;
                state
            }
            None => return None,
        };

        if let Some(target) = outgoing {
            if let Some(s) = sessions.get_mut(&target) {
                if s.challenge_in == Some(id) {
                    s.challenge_in = None;
                }
            }
        }
        if let Some(challenger) = incoming {
            if let Some(s) = sessions.get_mut(&challenger) {
                if s.challenge_out == Some(id) {
                    s.challenge_out = None;
                }
            }
            return Some((challenger, username));
        }
        None
    }

    /// Find the live (logged-in) session for a username.
    pub async fn by_username(&self, username: &str) -> Option<SessionId> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.is_authenticated() && s.username == username)
            .map(|s| s.id)
    }

    /// Lobby view for `requester`: every ONLINE or IN_LOBBY session
    /// except the requester. Players already in a game are hidden.
    pub async fn player_list(&self, requester: SessionId) -> Vec<PlayerEntry> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| {
                s.id != requester
                    && matches!(s.status, PlayerStatus::Online | PlayerStatus::InLobby)
            })
            .map(|s| PlayerEntry {
                username: s.username.clone(),
                status: s.status,
                rating: s.rating,
            })
            .collect()
    }

    /// Sessions with no inbound frame for longer than `grace`.
    /// In-game sessions are exempt: a turn stall is a player thinking,
    /// and a dead in-game peer surfaces as socket EOF instead.
    pub async fn idle_sessions(&self, grace: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| {
                s.status != PlayerStatus::InGame && now.duration_since(s.last_active) > grace
            })
            .map(|s| s.id)
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
