//! Dice rolling with an injectable random source
//!
//! Every roll in the engine goes through a `Roller`, so tests can force
//! exact dice while production matches use a ChaCha8 stream seeded from the
//! match seed.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Source of individual die results.
pub trait Roller: Send {
    /// Roll one die with the given number of sides (1..=sides).
    fn die(&mut self, sides: u32) -> i32;
}

/// Production roller backed by a seeded ChaCha8 stream.
pub struct DiceRoller {
    rng: ChaCha8Rng,
}

impl DiceRoller {
    pub fn seeded(seed: u64) -> Self {
        use rand::SeedableRng;
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl Roller for DiceRoller {
    fn die(&mut self, sides: u32) -> i32 {
        self.rng.gen_range(1..=sides as i32)
    }
}

/// Deterministic roller fed a fixed sequence, for tests.
pub struct SequenceRoller {
    rolls: std::collections::VecDeque<i32>,
    /// Returned when the sequence runs dry.
    fallback: i32,
}

impl SequenceRoller {
    pub fn new(rolls: &[i32]) -> Self {
        Self {
            rolls: rolls.iter().copied().collect(),
            fallback: 1,
        }
    }
}

impl Roller for SequenceRoller {
    fn die(&mut self, _sides: u32) -> i32 {
        self.rolls.pop_front().unwrap_or(self.fallback)
    }
}

/// Roll 3d6 (GURPS success rolls).
pub fn roll_3d6(roller: &mut dyn Roller) -> i32 {
    roller.die(6) + roller.die(6) + roller.die(6)
}

/// Roll a single d20 (PF2 checks).
pub fn roll_d20(roller: &mut dyn Roller) -> i32 {
    roller.die(20)
}

/// Roll a single d6.
pub fn roll_d6(roller: &mut dyn Roller) -> i32 {
    roller.die(6)
}

/// A damage formula: `count` dice of `sides` plus a flat modifier,
/// e.g. 1d6+2 or 2d8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DamageFormula {
    pub count: u32,
    pub sides: u32,
    pub modifier: i32,
}

impl DamageFormula {
    pub const fn new(count: u32, sides: u32, modifier: i32) -> Self {
        Self {
            count,
            sides,
            modifier,
        }
    }

    /// Roll the formula; never below zero.
    pub fn roll(&self, roller: &mut dyn Roller) -> i32 {
        let mut total = self.modifier;
        for _ in 0..self.count {
            total += roller.die(self.sides);
        }
        total.max(0)
    }

    /// Maximum possible result (used by the critical hit table).
    pub fn max_roll(&self) -> i32 {
        (self.count * self.sides) as i32 + self.modifier
    }
}

impl std::fmt::Display for DamageFormula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}d{}", self.count, self.sides)?;
        if self.modifier > 0 {
            write!(f, "+{}", self.modifier)?;
        } else if self.modifier < 0 {
            write!(f, "{}", self.modifier)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_roller_replays_rolls() {
        let mut r = SequenceRoller::new(&[3, 4, 5]);
        assert_eq!(roll_3d6(&mut r), 12);
    }

    #[test]
    fn damage_formula_rolls_and_clamps() {
        let f = DamageFormula::new(2, 6, -10);
        let mut r = SequenceRoller::new(&[1, 1]);
        assert_eq!(f.roll(&mut r), 0);

        let f = DamageFormula::new(1, 8, 2);
        let mut r = SequenceRoller::new(&[5]);
        assert_eq!(f.roll(&mut r), 7);
        assert_eq!(f.max_roll(), 10);
    }

    #[test]
    fn formula_display() {
        assert_eq!(DamageFormula::new(2, 6, 1).to_string(), "2d6+1");
        assert_eq!(DamageFormula::new(1, 8, -1).to_string(), "1d8-1");
        assert_eq!(DamageFormula::new(3, 6, 0).to_string(), "3d6");
    }

    #[test]
    fn seeded_roller_is_deterministic() {
        let mut a = DiceRoller::seeded(42);
        let mut b = DiceRoller::seeded(42);
        for _ in 0..20 {
            assert_eq!(a.die(20), b.die(20));
        }
    }

    #[test]
    fn seeded_roller_stays_in_range() {
        let mut r = DiceRoller::seeded(7);
        for _ in 0..200 {
            let v = r.die(6);
            assert!((1..=6).contains(&v));
        }
    }
}
