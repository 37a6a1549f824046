//! Terrain map - per-cell movement cost and blocked cells
//!
//! Map generation is out of scope; matches run on fixed arenas.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::grid::Cell;

/// Movement cost to enter a normal cell.
pub const NORMAL_COST: u32 = 1;
/// Movement cost to enter difficult terrain.
pub const DIFFICULT_COST: u32 = 2;

/// The battle arena: a bounded grid with blocked and difficult cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerrainMap {
    pub width: i32,
    pub height: i32,
    blocked: HashSet<Cell>,
    difficult: HashSet<Cell>,
}

impl TerrainMap {
    /// An open arena with no obstacles.
    pub fn open(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            blocked: HashSet::new(),
            difficult: HashSet::new(),
        }
    }

    /// The stock arena used for new matches: a few pillars and rough patches.
    pub fn standard_arena() -> Self {
        let mut map = Self::open(16, 16);
        for cell in [Cell::new(7, 4), Cell::new(8, 4), Cell::new(7, 11), Cell::new(8, 11)] {
            map.block(cell);
        }
        for cell in [
            Cell::new(3, 7),
            Cell::new(3, 8),
            Cell::new(4, 8),
            Cell::new(11, 7),
            Cell::new(12, 7),
            Cell::new(12, 8),
        ] {
            map.set_difficult(cell);
        }
        map
    }

    pub fn block(&mut self, cell: Cell) {
        self.blocked.insert(cell);
    }

    pub fn set_difficult(&mut self, cell: Cell) {
        self.difficult.insert(cell);
    }

    pub fn in_bounds(&self, cell: Cell) -> bool {
        cell.x >= 0 && cell.x < self.width && cell.y >= 0 && cell.y < self.height
    }

    pub fn is_blocked(&self, cell: Cell) -> bool {
        !self.in_bounds(cell) || self.blocked.contains(&cell)
    }

    /// Cost to enter a cell, or None if it cannot be entered.
    pub fn entry_cost(&self, cell: Cell) -> Option<u32> {
        if self.is_blocked(cell) {
            None
        } else if self.difficult.contains(&cell) {
            Some(DIFFICULT_COST)
        } else {
            Some(NORMAL_COST)
        }
    }

    /// Cells exported to clients as blocked, for rendering.
    pub fn blocked_cells(&self) -> Vec<Cell> {
        self.blocked.iter().copied().collect()
    }

    /// Cells exported to clients as difficult terrain.
    pub fn difficult_cells(&self) -> Vec<Cell> {
        self.difficult.iter().copied().collect()
    }
}
