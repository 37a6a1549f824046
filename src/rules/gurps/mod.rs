//! Contested-defense ruleset - core numbers
//!
//! Skill-vs-skill resolution on a hex grid: one maneuver per turn, active
//! defenses rolled against the attack, damage reduced by DR and multiplied
//! by type and location.

pub mod attack;
pub mod close_combat;
pub mod damage;
pub mod defense;

use crate::ws::protocol::{HitLocation, Posture};

use super::character::GurpsSheet;
use super::DerivedStats;

/// HP = ST, Basic Speed = (DX + HT) / 4, Move = floor(Speed), Dodge =
/// floor(Speed) + 3.
pub fn derived_stats(sheet: &GurpsSheet) -> DerivedStats {
    let basic_speed_quarters = sheet.dx + sheet.ht; // speed * 4
    let basic_move = (basic_speed_quarters / 4).max(1);
    DerivedStats {
        max_hp: sheet.st,
        move_points: basic_move as u32,
        dodge: basic_move + 3,
        ac: 0,
    }
}

/// Attack penalty from the attacker's posture.
pub fn posture_attack_penalty(posture: Posture) -> i32 {
    match posture {
        Posture::Standing => 0,
        Posture::Crouching => -2,
        Posture::Kneeling => -2,
        Posture::Prone => -4,
    }
}

/// Defense penalty from the defender's posture.
pub fn posture_defense_penalty(posture: Posture) -> i32 {
    match posture {
        Posture::Standing => 0,
        Posture::Crouching => 0,
        Posture::Kneeling => -2,
        Posture::Prone => -3,
    }
}

/// To-hit penalty for targeting a specific location.
pub fn location_penalty(location: HitLocation) -> i32 {
    match location {
        HitLocation::Torso => 0,
        HitLocation::Vitals => -3,
        HitLocation::Skull => -7,
        HitLocation::Face => -5,
        HitLocation::Arm | HitLocation::Leg => -2,
        HitLocation::Hand | HitLocation::Foot => -4,
    }
}

/// Simplified speed/range penalty table: cumulative -1 at 3, 5, 7, 10, 15,
/// 20 hexes and each doubling after.
pub fn range_penalty(distance: i32) -> i32 {
    const STEPS: [i32; 6] = [3, 5, 7, 10, 15, 20];
    if distance <= 2 {
        return 0;
    }
    let mut penalty = 0;
    for step in STEPS {
        if distance >= step {
            penalty -= 1;
        }
    }
    let mut bound = 40;
    while distance >= bound {
        penalty -= 1;
        bound *= 2;
    }
    penalty
}
