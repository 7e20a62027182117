//! Matchmaking
//!
//! The skill-bucketed pairing queue and the post-pairing ready
//! handshake. Pure synchronous logic; the server owns one `Matchmaker`
//! behind a mutex and runs a pairing pass on every `START_MATCHING`
//! plus a periodic sweep that also expires stale handshakes.

use std::time::{Duration, Instant};

use crate::network::session::SessionId;

/// One queued player.
#[derive(Clone, Debug)]
pub struct Ticket {
    pub session: SessionId,
    pub username: String,
    pub rating: i32,
    queued_at: Instant,
}

impl Ticket {
    pub fn new(session: SessionId, username: String, rating: i32) -> Self {
        Self { session, username, rating, queued_at: Instant::now() }
    }
}

/// A pair that has been announced with `MATCH_FOUND` and is waiting
/// for both `MATCH_READY` confirmations. `a` queued before `b` and
/// takes the first turn if the battle starts.
#[derive(Debug)]
struct PendingPair {
    a: SessionId,
    b: SessionId,
    a_ready: bool,
    b_ready: bool,
    created_at: Instant,
}

/// Both members of a dissolved pairing, for decline/expiry notices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PairExpiry {
    pub a: SessionId,
    pub b: SessionId,
}

impl PairExpiry {
    /// The other member of the pair.
    pub fn peer_of(&self, id: SessionId) -> SessionId {
        if self.a == id { self.b } else { self.a }
    }
}

/// What a `MATCH_READY` led to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyOutcome {
    /// Still waiting on the peer; forward OPPONENT_READY to them.
    Waiting { peer: SessionId },
    /// Both confirmed. The pair is gone from the matchmaker; start
    /// the battle with `p1` moving first.
    BothReady { p1: SessionId, p2: SessionId },
}

/// Queue plus pending handshakes.
pub struct Matchmaker {
    queue: Vec<Ticket>,
    pending: Vec<PendingPair>,
    /// Maximum rating difference for a pairing (inclusive).
    window: i32,
}

impl Matchmaker {
    pub fn new(window: i32) -> Self {
        Self { queue: Vec::new(), pending: Vec::new(), window }
    }

    /// Whether the session currently holds a queue slot or a pending
    /// pairing.
    pub fn contains(&self, id: SessionId) -> bool {
        self.queue.iter().any(|t| t.session == id)
            || self.pending.iter().any(|p| p.a == id || p.b == id)
    }

    /// Whether the session is mid ready-handshake (as opposed to
    /// merely queued).
    pub fn is_pending(&self, id: SessionId) -> bool {
        self.pending.iter().any(|p| p.a == id || p.b == id)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Add a player to the queue. Refused if they already hold a slot
    /// or a pending pairing.
    pub fn enqueue(&mut self, ticket: Ticket) -> bool {
        if self.contains(ticket.session) {
            return false;
        }
        self.queue.push(ticket);
        true
    }

    /// Remove a player from the queue (CANCEL_MATCHING). Pending
    /// pairings are not cancellable this way; those go through
    /// [`Matchmaker::decline`].
    pub fn cancel(&mut self, id: SessionId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|t| t.session != id);
        self.queue.len() != before
    }

    /// Pair queued players whose ratings differ by at most the window,
    /// earliest entry first. Matched pairs move into the pending
    /// handshake; the tickets are returned so the caller can emit
    /// `MATCH_FOUND` to both sides.
    pub fn pair_pass(&mut self) -> Vec<(Ticket, Ticket)> {
        let mut pairs = Vec::new();

        let mut i = 0;
        while i < self.queue.len() {
            let partner = (i + 1..self.queue.len()).find(|&j| {
                (self.queue[i].rating - self.queue[j].rating).abs() <= self.window
            });

            if let Some(j) = partner {
                // j > i, so remove j first to keep i stable.
                let b = self.queue.remove(j);
                let a = self.queue.remove(i);
                self.pending.push(PendingPair {
                    a: a.session,
                    b: b.session,
                    a_ready: false,
                    b_ready: false,
                    created_at: Instant::now(),
                });
                pairs.push((a, b));
            } else {
                i += 1;
            }
        }

        pairs
    }

    /// Record a `MATCH_READY` confirmation.
    pub fn mark_ready(&mut self, id: SessionId) -> Option<ReadyOutcome> {
        let idx = self.pending.iter().position(|p| p.a == id || p.b == id)?;
        let pair = &mut self.pending[idx];

        if pair.a == id {
            pair.a_ready = true;
        } else {
            pair.b_ready = true;
        }

        if pair.a_ready && pair.b_ready {
            let pair = self.pending.remove(idx);
            Some(ReadyOutcome::BothReady { p1: pair.a, p2: pair.b })
        } else {
            let peer = if pair.a == id { pair.b } else { pair.a };
            Some(ReadyOutcome::Waiting { peer })
        }
    }

    /// Dissolve the pending pairing containing `id` (explicit decline
    /// or disconnect during the handshake).
    pub fn decline(&mut self, id: SessionId) -> Option<PairExpiry> {
        let idx = self.pending.iter().position(|p| p.a == id || p.b == id)?;
        let pair = self.pending.remove(idx);
        Some(PairExpiry { a: pair.a, b: pair.b })
    }

    /// Expire handshakes older than `timeout` as mutual declines.
    pub fn sweep_expired(&mut self, timeout: Duration) -> Vec<PairExpiry> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.pending.retain(|p| {
            if now.duration_since(p.created_at) > timeout {
                expired.push(PairExpiry { a: p.a, b: p.b });
                false
            } else {
                true
            }
        });
        expired
    }

    /// Drop every trace of a session (disconnect path). Returns the
    /// dissolved pairing if the session was mid-handshake, so the
    /// peer can be notified.
    pub fn remove_session(&mut self, id: SessionId) -> Option<PairExpiry> {
        self.queue.retain(|t| t.session != id);
        self.decline(id)
    }
}
