//! Battle State Machine
//!
//! One authoritative duel between two sessions: placement phase,
//! turn-based play, surrender, draw offers, and termination. The
//! server holds each battle behind its own lock and drives this state
//! machine from both players' connection tasks.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::game::board::{Board, Coord, PlacementError, ShipSpec, ShotOutcome};
use crate::network::session::SessionId;

/// Identifier of an active battle in the games table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct GameId(pub u64);

/// Which of the two seats a player occupies. The first seat belongs to
/// the player who queued earlier (or the challenger) and moves first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    P1,
    P2,
}

impl Side {
    /// The opposing seat.
    pub fn other(self) -> Side {
        match self {
            Side::P1 => Side::P2,
            Side::P2 => Side::P1,
        }
    }

    fn index(self) -> usize {
        match self {
            Side::P1 => 0,
            Side::P2 => 1,
        }
    }
}

/// Battle lifecycle phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BattleStatus {
    /// Waiting for fleet submissions.
    PlacingShips,
    /// Both fleets placed; shots are being exchanged.
    Playing,
    /// Terminal. The battle is kept only until the resolver tears it
    /// down.
    Finished,
}

/// One player's side of a battle.
#[derive(Debug)]
pub struct Seat {
    /// Owning connection.
    pub session: SessionId,
    /// Username captured at battle start; survives a logout mid-game.
    pub username: String,
    /// This player's own board (the opponent shoots at it).
    pub board: Board,
    /// Fleet submitted and accepted.
    pub ready: bool,
}

/// Battle errors, reported to the acting player as state errors.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BattleError {
    /// Fleet submissions are only accepted during placement.
    #[error("placement phase is over")]
    PlacementOver,

    /// The seat already committed a fleet.
    #[error("ships are already placed")]
    AlreadyPlaced,

    /// Invalid fleet submission.
    #[error(transparent)]
    Placement(#[from] PlacementError),

    /// The action requires the playing phase.
    #[error("game is not in the playing phase")]
    NotPlaying,

    /// Shot attempted out of turn.
    #[error("not your turn")]
    NotYourTurn,

    /// Draw reply without a pending offer from the opponent.
    #[error("no draw offer is pending")]
    NoDrawPending,
}

/// What a fleet submission led to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlacementOutcome {
    /// Accepted; the opponent has not finished placing yet.
    WaitingOpponent,
    /// Accepted, and both fleets are in: the battle is now Playing
    /// with P1 on turn.
    BattleStarted,
}

/// Everything the dispatcher needs to report one resolved shot.
#[derive(Clone, Debug)]
pub struct ShotReport {
    pub coord: Coord,
    pub outcome: ShotOutcome,
    /// The turn moved to the opponent (false for `AlreadyTried` and
    /// for the winning shot).
    pub turn_passed: bool,
    /// Set when this shot sank the last ship cell.
    pub winner: Option<Side>,
}

/// Outcome of a draw reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawReply {
    Accepted,
    Rejected,
}

/// An authoritative two-player battleship duel.
#[derive(Debug)]
pub struct Battle {
    pub id: GameId,
    seats: [Seat; 2],
    status: BattleStatus,
    turn: Side,
    draw_offer: Option<Side>,
    /// When the battle was created.
    pub started_at: DateTime<Utc>,
    /// Opaque identifier carried in logs.
    pub log_id: String,
}

impl Battle {
    /// Create a battle in the placement phase. `p1` moves first once
    /// both fleets are placed.
    pub fn new(id: GameId, p1: (SessionId, String), p2: (SessionId, String)) -> Self {
        Self {
            id,
            seats: [
                Seat { session: p1.0, username: p1.1, board: Board::default(), ready: false },
                Seat { session: p2.0, username: p2.1, board: Board::default(), ready: false },
            ],
            status: BattleStatus::PlacingShips,
            turn: Side::P1,
            draw_offer: None,
            started_at: Utc::now(),
            log_id: format!("game_{}", uuid::Uuid::new_v4().simple()),
        }
    }

    /// Which side a session occupies, if it is part of this battle.
    pub fn side_of(&self, session: SessionId) -> Option<Side> {
        if self.seats[0].session == session {
            Some(Side::P1)
        } else if self.seats[1].session == session {
            Some(Side::P2)
        } else {
            None
        }
    }

    pub fn seat(&self, side: Side) -> &Seat {
        &self.seats[side.index()]
    }

    pub fn opponent(&self, side: Side) -> &Seat {
        &self.seats[side.other().index()]
    }

    pub fn status(&self) -> BattleStatus {
        self.status
    }

    pub fn turn(&self) -> Side {
        self.turn
    }

    pub fn is_finished(&self) -> bool {
        self.status == BattleStatus::Finished
    }

    /// Submit a fleet for one seat.
    ///
    /// Rejected wholesale on any rule violation; an accepted fleet is
    /// frozen for the rest of the battle. When the second fleet lands
    /// the battle advances to Playing with P1 on turn.
    pub fn place_ships(
        &mut self,
        side: Side,
        specs: &[ShipSpec],
    ) -> Result<PlacementOutcome, BattleError> {
        if self.status != BattleStatus::PlacingShips {
            return Err(BattleError::PlacementOver);
        }
        if self.seats[side.index()].ready {
            return Err(BattleError::AlreadyPlaced);
        }

        self.seats[side.index()].board.place_fleet(specs)?;
        self.seats[side.index()].ready = true;

        if self.seats.iter().all(|s| s.ready) {
            self.status = BattleStatus::Playing;
            self.turn = Side::P1;
            Ok(PlacementOutcome::BattleStarted)
        } else {
            Ok(PlacementOutcome::WaitingOpponent)
        }
    }

    /// Resolve a shot from `side` at the opponent's board.
    ///
    /// Win detection happens before any turn handoff: the shot that
    /// hits the last ship cell finishes the battle with the shooter as
    /// winner, and the turn does not move. A re-shot cell is a no-op
    /// that keeps the turn with the shooter.
    pub fn fire(&mut self, side: Side, at: Coord) -> Result<ShotReport, BattleError> {
        if self.status != BattleStatus::Playing {
            return Err(BattleError::NotPlaying);
        }
        if self.turn != side {
            return Err(BattleError::NotYourTurn);
        }

        let outcome = self.seats[side.other().index()].board.fire(at);

        let (turn_passed, winner) = match &outcome {
            ShotOutcome::AlreadyTried => (false, None),
            ShotOutcome::Hit { all_sunk: true, .. } => {
                self.status = BattleStatus::Finished;
                (false, Some(side))
            }
            ShotOutcome::Hit { .. } | ShotOutcome::Miss => {
                self.turn = side.other();
                (true, None)
            }
        };

        Ok(ShotReport { coord: at, outcome, turn_passed, winner })
    }

    /// Concede. Returns the winning side.
    pub fn surrender(&mut self, side: Side) -> Result<Side, BattleError> {
        if self.status != BattleStatus::Playing {
            return Err(BattleError::NotPlaying);
        }
        self.status = BattleStatus::Finished;
        Ok(side.other())
    }

    /// Record a draw offer from `side`. The offer stays pending until
    /// answered or the battle ends.
    pub fn offer_draw(&mut self, side: Side) -> Result<(), BattleError> {
        if self.status != BattleStatus::Playing {
            return Err(BattleError::NotPlaying);
        }
        self.draw_offer = Some(side);
        Ok(())
    }

    /// Answer the opponent's pending draw offer.
    pub fn reply_draw(&mut self, side: Side, accept: bool) -> Result<DrawReply, BattleError> {
        if self.status != BattleStatus::Playing {
            return Err(BattleError::NotPlaying);
        }
        if self.draw_offer != Some(side.other()) {
            return Err(BattleError::NoDrawPending);
        }
        self.draw_offer = None;
        if accept {
            self.status = BattleStatus::Finished;
            Ok(DrawReply::Accepted)
        } else {
            Ok(DrawReply::Rejected)
        }
    }

    /// Force-terminate, used by the disconnect path.
    pub fn finish(&mut self) {
        self.status = BattleStatus::Finished;
    }
}
