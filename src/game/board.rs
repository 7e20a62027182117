//! Board State & Shot Resolution
//!
//! The 10x10 grid, fleet placement validation, and authoritative
//! hit/miss/sunk resolution. Everything here is pure and synchronous;
//! the network layer drives it under the battle lock.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{FLEET_SIZES, GRID_SIZE, MAX_SHIP_NAME, TOTAL_SHIP_CELLS};

// =============================================================================
// COORDINATES
// =============================================================================

/// A grid coordinate. Row and column are both 0-9.
///
/// On the wire a shot coordinate is `<row letter A-J><col digit 0-9>`,
/// e.g. `"A0"` is the top-left cell and `"J9"` the bottom-right.
/// Ship placement uses numeric `row`/`col` instead; see [`ShipSpec`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Coord {
    /// Row index (letter on the wire).
    pub row: u8,
    /// Column index (digit on the wire).
    pub col: u8,
}

impl Coord {
    /// Create a coordinate, rejecting anything off the board.
    pub fn new(row: u8, col: u8) -> Option<Self> {
        if (row as usize) < GRID_SIZE && (col as usize) < GRID_SIZE {
            Some(Self { row, col })
        } else {
            None
        }
    }

    /// Parse the wire form. Strict: exactly one uppercase row letter
    /// followed by one column digit (`"A0"`..`"J9"`).
    pub fn parse(s: &str) -> Option<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 2 {
            return None;
        }
        let row = bytes[0].checked_sub(b'A')?;
        let col = bytes[1].checked_sub(b'0')?;
        Self::new(row, col)
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", (b'A' + self.row) as char, self.col)
    }
}

// =============================================================================
// CELLS & SHIPS
// =============================================================================

/// State of a single grid cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cell {
    /// Open water, never shot at.
    #[default]
    Water,
    /// Occupied by a ship, not yet hit.
    Ship,
    /// A ship cell that has been hit.
    Hit,
    /// A water cell that has been shot at.
    Miss,
}

/// One ship in a `PLACE_SHIPS` submission, exactly as it appears on
/// the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShipSpec {
    /// Display label. Opaque to the rules; only sizes matter.
    pub name: String,
    /// Length in cells.
    pub size: u8,
    /// Origin row, 0-indexed.
    pub row: u8,
    /// Origin column, 0-indexed.
    pub col: u8,
    /// Extends rightwards when true, downwards when false.
    pub horizontal: bool,
}

/// A placed ship with its running hit count.
///
/// Hits are tracked per ship so that a sunk notification fires exactly
/// once, on the hit that completes the ship.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ship {
    pub name: String,
    pub size: u8,
    pub row: u8,
    pub col: u8,
    pub horizontal: bool,
    hits: u8,
}

impl Ship {
    fn from_spec(spec: &ShipSpec) -> Self {
        Self {
            name: spec.name.clone(),
            size: spec.size,
            row: spec.row,
            col: spec.col,
            horizontal: spec.horizontal,
            hits: 0,
        }
    }

    /// Iterate the cells this ship occupies.
    ///
    /// Assumes the ship fits on the board, which placement validation
    /// guarantees before a `Ship` is constructed.
    fn cells(&self) -> impl Iterator<Item = Coord> + '_ {
        (0..self.size).map(move |i| {
            if self.horizontal {
                Coord { row: self.row, col: self.col + i }
            } else {
                Coord { row: self.row + i, col: self.col }
            }
        })
    }

    fn occupies(&self, at: Coord) -> bool {
        self.cells().any(|c| c == at)
    }

    /// Every cell of this ship has been hit.
    pub fn is_sunk(&self) -> bool {
        self.hits == self.size
    }
}

// =============================================================================
// PLACEMENT
// =============================================================================

/// Why a fleet submission was rejected. The submission is rejected
/// wholesale; a failed placement leaves the board untouched.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PlacementError {
    /// Fleet must contain exactly five ships.
    #[error("expected {expected} ships, got {got}")]
    WrongShipCount { expected: usize, got: usize },

    /// Ship sizes must be the fixed multiset {5,4,3,3,2}.
    #[error("fleet sizes must be 5,4,3,3,2")]
    WrongFleetSizes,

    /// Ship name exceeds the storage limit.
    #[error("ship name {0:?} is too long")]
    NameTooLong(String),

    /// Ship extends past the edge of the board.
    #[error("ship {0:?} does not fit on the board")]
    OutOfBounds(String),

    /// Ship overlaps a previously placed ship.
    #[error("ship {0:?} overlaps another ship")]
    Overlap(String),
}

// =============================================================================
// BOARD
// =============================================================================

/// Result of resolving one shot against a board.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShotOutcome {
    /// Open water.
    Miss,
    /// A ship cell. `sunk` carries the ship name if this hit completed
    /// it; `all_sunk` is the win condition.
    Hit { sunk: Option<String>, all_sunk: bool },
    /// The cell was already Hit or Miss. Nothing changed.
    AlreadyTried,
}

/// One player's 10x10 board.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Board {
    grid: [[Cell; GRID_SIZE]; GRID_SIZE],
    ships: Vec<Ship>,
    total_ship_cells: u32,
    hits_received: u32,
}

impl Default for Board {
    fn default() -> Self {
        Self {
            grid: [[Cell::Water; GRID_SIZE]; GRID_SIZE],
            ships: Vec::new(),
            total_ship_cells: 0,
            hits_received: 0,
        }
    }
}

impl Board {
    /// Validate and commit a full fleet submission.
    ///
    /// Enforces the fixed fleet (five ships, sizes {5,4,3,3,2}),
    /// board bounds, and no overlap. Adjacent ships are legal. On any
    /// violation the board is left exactly as it was.
    pub fn place_fleet(&mut self, specs: &[ShipSpec]) -> Result<(), PlacementError> {
        if specs.len() != FLEET_SIZES.len() {
            return Err(PlacementError::WrongShipCount {
                expected: FLEET_SIZES.len(),
                got: specs.len(),
            });
        }

        let mut sizes: Vec<u8> = specs.iter().map(|s| s.size).collect();
        sizes.sort_unstable();
        let mut expected = FLEET_SIZES;
        expected.sort_unstable();
        if sizes != expected {
            return Err(PlacementError::WrongFleetSizes);
        }

        // Stage onto a scratch grid so a late failure cannot leave a
        // half-placed fleet behind.
        let mut grid = [[Cell::Water; GRID_SIZE]; GRID_SIZE];
        let mut ships = Vec::with_capacity(specs.len());

        for spec in specs {
            if spec.name.len() > MAX_SHIP_NAME {
                return Err(PlacementError::NameTooLong(spec.name.clone()));
            }

            let end_row = spec.row as usize + if spec.horizontal { 0 } else { spec.size as usize - 1 };
            let end_col = spec.col as usize + if spec.horizontal { spec.size as usize - 1 } else { 0 };
            if spec.row as usize >= GRID_SIZE
                || spec.col as usize >= GRID_SIZE
                || end_row >= GRID_SIZE
                || end_col >= GRID_SIZE
            {
                return Err(PlacementError::OutOfBounds(spec.name.clone()));
            }

            let ship = Ship::from_spec(spec);
            for cell in ship.cells() {
                let slot = &mut grid[cell.row as usize][cell.col as usize];
                if *slot == Cell::Ship {
                    return Err(PlacementError::Overlap(spec.name.clone()));
                }
                *slot = Cell::Ship;
            }
            ships.push(ship);
        }

        self.grid = grid;
        self.ships = ships;
        self.total_ship_cells = TOTAL_SHIP_CELLS;
        self.hits_received = 0;
        Ok(())
    }

    /// Resolve a shot at `at`.
    ///
    /// Water becomes Miss, Ship becomes Hit (incrementing the owning
    /// ship's hit counter), and a cell that was already shot reports
    /// `AlreadyTried` without mutating anything.
    pub fn fire(&mut self, at: Coord) -> ShotOutcome {
        match self.grid[at.row as usize][at.col as usize] {
            Cell::Water => {
                self.grid[at.row as usize][at.col as usize] = Cell::Miss;
                ShotOutcome::Miss
            }
            Cell::Ship => {
                self.grid[at.row as usize][at.col as usize] = Cell::Hit;
                self.hits_received += 1;

                let mut sunk = None;
                if let Some(ship) = self.ships.iter_mut().find(|s| s.occupies(at)) {
                    ship.hits += 1;
                    if ship.is_sunk() {
                        sunk = Some(ship.name.clone());
                    }
                }

                ShotOutcome::Hit {
                    sunk,
                    all_sunk: self.hits_received == self.total_ship_cells,
                }
            }
            Cell::Hit | Cell::Miss => ShotOutcome::AlreadyTried,
        }
    }

    /// A full fleet has been committed.
    pub fn is_placed(&self) -> bool {
        self.total_ship_cells > 0
    }

    /// Hit cells so far.
    pub fn hits_received(&self) -> u32 {
        self.hits_received
    }

    /// Sum of placed ship sizes (0 before placement, 17 after).
    pub fn total_ship_cells(&self) -> u32 {
        self.total_ship_cells
    }

    /// Every ship cell has been hit.
    pub fn all_sunk(&self) -> bool {
        self.is_placed() && self.hits_received == self.total_ship_cells
    }

    #[cfg(test)]
    fn cell(&self, at: Coord) -> Cell {
        self.grid[at.row as usize][at.col as usize]
    }
}
