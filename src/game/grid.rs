//! Grid geometry - distance, neighbors, world conversion, reachability
//!
//! Pure functions over integer cell coordinates. The topology is picked once
//! per match from the active ruleset and threaded through every geometric
//! computation, so combat logic never special-cases hex vs square.

use std::collections::{BinaryHeap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::map::TerrainMap;

/// A cell on the battle grid.
///
/// Hex topology interprets (x, y) as axial (q, r); square topology as
/// column/row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub x: i32,
    pub y: i32,
}

impl Cell {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// How diagonals are counted on a square grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagonalRule {
    /// Diagonal steps cost the same as orthogonal (8 neighbors).
    Chebyshev,
    /// No diagonal movement (4 neighbors).
    Manhattan,
}

/// Grid topology strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    Hex,
    Square(DiagonalRule),
}

/// Axial direction offsets for pointy-top hexes, clockwise from east.
const HEX_DIRS: [(i32, i32); 6] = [(1, 0), (1, -1), (0, -1), (-1, 0), (-1, 1), (0, 1)];

/// Square direction offsets, clockwise from east.
const SQUARE_DIRS: [(i32, i32); 8] = [
    (1, 0),
    (1, -1),
    (0, -1),
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

const HEX_SIZE: f32 = 32.0;
const SQUARE_SIZE: f32 = 32.0;

impl Topology {
    /// Number of facing directions under this topology.
    pub fn direction_count(&self) -> u8 {
        match self {
            Topology::Hex => 6,
            Topology::Square(DiagonalRule::Chebyshev) => 8,
            Topology::Square(DiagonalRule::Manhattan) => 4,
        }
    }

    /// Integer distance between two cells under this topology's metric.
    pub fn distance(&self, a: Cell, b: Cell) -> i32 {
        let dx = b.x - a.x;
        let dy = b.y - a.y;
        match self {
            Topology::Hex => {
                // Cube distance in axial coordinates.
                (dx.abs() + dy.abs() + (dx + dy).abs()) / 2
            }
            Topology::Square(DiagonalRule::Chebyshev) => dx.abs().max(dy.abs()),
            Topology::Square(DiagonalRule::Manhattan) => dx.abs() + dy.abs(),
        }
    }

    /// All neighboring cells, clockwise starting east.
    pub fn neighbors(&self, c: Cell) -> Vec<Cell> {
        self.offsets()
            .iter()
            .map(|(dx, dy)| Cell::new(c.x + dx, c.y + dy))
            .collect()
    }

    /// The cell one step from `c` in facing direction `dir`.
    pub fn step(&self, c: Cell, dir: u8) -> Cell {
        let offsets = self.offsets();
        let (dx, dy) = offsets[dir as usize % offsets.len()];
        Cell::new(c.x + dx, c.y + dy)
    }

    /// Facing index that points from `from` most directly toward `to`.
    pub fn direction_towards(&self, from: Cell, to: Cell) -> u8 {
        if from == to {
            return 0;
        }
        let mut best = 0u8;
        let mut best_dist = i32::MAX;
        for (i, (dx, dy)) in self.offsets().iter().enumerate() {
            let next = Cell::new(from.x + dx, from.y + dy);
            let d = self.distance(next, to);
            if d < best_dist {
                best_dist = d;
                best = i as u8;
            }
        }
        best
    }

    /// Continuous world position of a cell center, for clients.
    pub fn to_world(&self, c: Cell) -> (f32, f32) {
        match self {
            Topology::Hex => {
                let x = HEX_SIZE * 3f32.sqrt() * (c.x as f32 + c.y as f32 / 2.0);
                let y = HEX_SIZE * 1.5 * c.y as f32;
                (x, y)
            }
            Topology::Square(_) => (c.x as f32 * SQUARE_SIZE, c.y as f32 * SQUARE_SIZE),
        }
    }

    /// Nearest cell to a continuous world position.
    pub fn from_world(&self, x: f32, y: f32) -> Cell {
        match self {
            Topology::Hex => {
                let q = (3f32.sqrt() / 3.0 * x - y / 3.0) / HEX_SIZE;
                let r = 2.0 / 3.0 * y / HEX_SIZE;
                axial_round(q, r)
            }
            Topology::Square(_) => Cell::new(
                (x / SQUARE_SIZE).round() as i32,
                (y / SQUARE_SIZE).round() as i32,
            ),
        }
    }

    fn offsets(&self) -> &'static [(i32, i32)] {
        match self {
            Topology::Hex => &HEX_DIRS,
            Topology::Square(DiagonalRule::Chebyshev) => &SQUARE_DIRS,
            // Orthogonals are indices 0, 2, 4, 6 of the square ring.
            Topology::Square(DiagonalRule::Manhattan) => {
                const ORTHO: [(i32, i32); 4] = [(1, 0), (0, -1), (-1, 0), (0, 1)];
                &ORTHO
            }
        }
    }
}

/// Round fractional axial coordinates to the containing hex.
fn axial_round(q: f32, r: f32) -> Cell {
    let s = -q - r;
    let mut rq = q.round();
    let mut rr = r.round();
    let rs = s.round();

    let dq = (rq - q).abs();
    let dr = (rr - r).abs();
    let ds = (rs - s).abs();

    if dq > dr && dq > ds {
        rq = -rr - rs;
    } else if dr > ds {
        rr = -rq - rs;
    }
    Cell::new(rq as i32, rr as i32)
}

/// A cell reachable this turn, with its cumulative movement cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReachableCell {
    pub cell: Cell,
    pub cost: u32,
}

#[derive(PartialEq, Eq)]
struct QueueEntry {
    cost: u32,
    cell: Cell,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Min-heap on cost.
        other
            .cost
            .cmp(&self.cost)
            .then_with(|| (self.cell.x, self.cell.y).cmp(&(other.cell.x, other.cell.y)))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Dijkstra over terrain cost: every cell whose cumulative cost from `start`
/// is within `budget`. Blocked and occupied cells are excluded (the start
/// cell itself is always included at cost 0).
pub fn reachable_cells(
    topology: Topology,
    map: &TerrainMap,
    occupied: &HashSet<Cell>,
    start: Cell,
    budget: u32,
) -> HashMap<Cell, u32> {
    let mut best: HashMap<Cell, u32> = HashMap::new();
    let mut heap = BinaryHeap::new();

    best.insert(start, 0);
    heap.push(QueueEntry {
        cost: 0,
        cell: start,
    });

    while let Some(QueueEntry { cost, cell }) = heap.pop() {
        if cost > *best.get(&cell).unwrap_or(&u32::MAX) {
            continue;
        }
        for next in topology.neighbors(cell) {
            let Some(step_cost) = map.entry_cost(next) else {
                continue;
            };
            if occupied.contains(&next) {
                continue;
            }
            let total = cost + step_cost;
            if total > budget {
                continue;
            }
            if total < *best.get(&next).unwrap_or(&u32::MAX) {
                best.insert(next, total);
                heap.push(QueueEntry {
                    cost: total,
                    cell: next,
                });
            }
        }
    }

    best
}

/// Cost of a single step from `from` to an adjacent `to`, or None if illegal.
pub fn step_cost(
    topology: Topology,
    map: &TerrainMap,
    occupied: &HashSet<Cell>,
    from: Cell,
    to: Cell,
) -> Option<u32> {
    if topology.distance(from, to) != 1 {
        return None;
    }
    if occupied.contains(&to) {
        return None;
    }
    map.entry_cost(to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::map::TerrainMap;

    #[test]
    fn hex_distance_is_cube_metric() {
        let t = Topology::Hex;
        assert_eq!(t.distance(Cell::new(0, 0), Cell::new(0, 0)), 0);
        assert_eq!(t.distance(Cell::new(0, 0), Cell::new(3, 0)), 3);
        assert_eq!(t.distance(Cell::new(0, 0), Cell::new(2, -1)), 2);
        assert_eq!(t.distance(Cell::new(-1, 2), Cell::new(2, -2)), 4);
    }

    #[test]
    fn square_chebyshev_counts_diagonals_as_one() {
        let t = Topology::Square(DiagonalRule::Chebyshev);
        assert_eq!(t.distance(Cell::new(0, 0), Cell::new(3, 3)), 3);
        assert_eq!(t.distance(Cell::new(1, 1), Cell::new(4, 2)), 3);
    }

    #[test]
    fn square_manhattan_has_four_neighbors() {
        let t = Topology::Square(DiagonalRule::Manhattan);
        assert_eq!(t.neighbors(Cell::new(0, 0)).len(), 4);
        assert_eq!(t.distance(Cell::new(0, 0), Cell::new(2, 2)), 4);
    }

    #[test]
    fn hex_has_six_neighbors_all_at_distance_one() {
        let t = Topology::Hex;
        let n = t.neighbors(Cell::new(2, -1));
        assert_eq!(n.len(), 6);
        for c in n {
            assert_eq!(t.distance(Cell::new(2, -1), c), 1);
        }
    }

    #[test]
    fn world_round_trip() {
        for t in [
            Topology::Hex,
            Topology::Square(DiagonalRule::Chebyshev),
        ] {
            let c = Cell::new(4, -2);
            let (x, y) = t.to_world(c);
            assert_eq!(t.from_world(x, y), c);
        }
    }

    #[test]
    fn direction_towards_reduces_distance() {
        let t = Topology::Hex;
        let from = Cell::new(0, 0);
        let to = Cell::new(3, -2);
        let dir = t.direction_towards(from, to);
        let next = t.step(from, dir);
        assert!(t.distance(next, to) < t.distance(from, to));
    }

    #[test]
    fn reachability_respects_budget_and_blocked() {
        let mut map = TerrainMap::open(10, 10);
        map.block(Cell::new(1, 0));
        let t = Topology::Square(DiagonalRule::Manhattan);
        let reach = reachable_cells(t, &map, &HashSet::new(), Cell::new(0, 0), 2);

        assert_eq!(reach.get(&Cell::new(0, 0)), Some(&0));
        assert_eq!(reach.get(&Cell::new(0, 2)), Some(&2));
        assert!(!reach.contains_key(&Cell::new(1, 0)));
        // Around the block costs more than straight through would.
        assert!(!reach.contains_key(&Cell::new(2, 0)));
    }

    #[test]
    fn reachability_monotone_in_budget() {
        let mut map = TerrainMap::open(12, 12);
        map.set_difficult(Cell::new(2, 1));
        let t = Topology::Hex;
        let small = reachable_cells(t, &map, &HashSet::new(), Cell::new(0, 0), 3);
        let large = reachable_cells(t, &map, &HashSet::new(), Cell::new(0, 0), 5);
        for (cell, cost) in &small {
            assert_eq!(large.get(cell), Some(cost));
        }
    }

    #[test]
    fn difficult_terrain_costs_double() {
        let mut map = TerrainMap::open(8, 8);
        map.set_difficult(Cell::new(1, 0));
        let t = Topology::Square(DiagonalRule::Manhattan);
        let reach = reachable_cells(t, &map, &HashSet::new(), Cell::new(0, 0), 2);
        assert_eq!(reach.get(&Cell::new(1, 0)), Some(&2));
    }

    #[test]
    fn occupied_cells_are_not_reachable() {
        let map = TerrainMap::open(8, 8);
        let t = Topology::Hex;
        let mut occupied = HashSet::new();
        occupied.insert(Cell::new(1, 0));
        let reach = reachable_cells(t, &map, &occupied, Cell::new(0, 0), 3);
        assert!(!reach.contains_key(&Cell::new(1, 0)));
    }
}
