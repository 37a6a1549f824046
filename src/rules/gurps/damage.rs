//! Damage application: DR, wounding multipliers, major wounds, consciousness

use serde::{Deserialize, Serialize};

use crate::rules::character::DamageKind;
use crate::rules::dice::{roll_3d6, Roller};
use crate::ws::protocol::HitLocation;

/// Wounding multiplier by damage type and struck location.
pub fn wounding_multiplier(kind: DamageKind, location: HitLocation) -> f32 {
    let type_mult = match kind {
        DamageKind::Cutting | DamageKind::Slashing => 1.5,
        DamageKind::Impaling => 2.0,
        _ => 1.0,
    };
    match location {
        HitLocation::Skull => 4.0,
        HitLocation::Vitals => match kind {
            DamageKind::Impaling | DamageKind::Piercing => 3.0,
            _ => type_mult,
        },
        // Limb wounds never benefit from impaling's full multiplier.
        HitLocation::Arm | HitLocation::Leg | HitLocation::Hand | HitLocation::Foot => {
            type_mult.min(1.5)
        }
        _ => type_mult,
    }
}

/// Fully computed damage for one hit, before any state is mutated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DamageResult {
    pub rolled: i32,
    pub penetrating: i32,
    pub injury: i32,
    pub major_wound: bool,
    /// Shock penalty the injury inflicts on the victim's next turn (0..=-4).
    pub shock: i32,
}

/// Apply DR and multipliers to a rolled damage value.
pub fn compute_damage(
    rolled: i32,
    dr: i32,
    kind: DamageKind,
    location: HitLocation,
    target_max_hp: i32,
) -> DamageResult {
    let penetrating = (rolled - dr.max(0)).max(0);
    let injury = (penetrating as f32 * wounding_multiplier(kind, location)).floor() as i32;
    // At least 1 point of injury on any penetration.
    let injury = if penetrating > 0 { injury.max(1) } else { 0 };
    DamageResult {
        rolled,
        penetrating,
        injury,
        major_wound: injury > target_max_hp / 2,
        shock: -(injury.min(4)),
    }
}

/// HP floor: damage never drives HP below zero.
pub fn apply_injury(current_hp: i32, injury: i32) -> i32 {
    (current_hp - injury).max(0)
}

/// Consciousness check at 0 HP: roll HT, penalized by how deep past zero
/// the pre-floor total would have gone, in full multiples of max HP.
pub fn consciousness_check(
    ht: i32,
    hp_before: i32,
    injury: i32,
    max_hp: i32,
    roller: &mut dyn Roller,
) -> bool {
    let deficit = injury - hp_before; // how far below zero pre-clamp
    let penalty = if max_hp > 0 { (deficit / max_hp).max(0) } else { 0 };
    let target = ht - penalty;
    roll_3d6(roller) <= target
}

/// Major wound stun check: roll HT or be stunned.
pub fn major_wound_check(ht: i32, roller: &mut dyn Roller) -> bool {
    roll_3d6(roller) <= ht
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::dice::SequenceRoller;

    #[test]
    fn multipliers_by_type_and_location() {
        assert_eq!(wounding_multiplier(DamageKind::Cutting, HitLocation::Torso), 1.5);
        assert_eq!(wounding_multiplier(DamageKind::Impaling, HitLocation::Torso), 2.0);
        assert_eq!(wounding_multiplier(DamageKind::Crushing, HitLocation::Torso), 1.0);
        assert_eq!(wounding_multiplier(DamageKind::Crushing, HitLocation::Skull), 4.0);
        assert_eq!(wounding_multiplier(DamageKind::Piercing, HitLocation::Vitals), 3.0);
        assert_eq!(wounding_multiplier(DamageKind::Impaling, HitLocation::Arm), 1.5);
    }

    #[test]
    fn dr_reduces_before_multiplier() {
        let r = compute_damage(7, 3, DamageKind::Cutting, HitLocation::Torso, 12);
        assert_eq!(r.penetrating, 4);
        assert_eq!(r.injury, 6); // 4 * 1.5
        assert!(!r.major_wound);
        assert_eq!(r.shock, -4);
    }

    #[test]
    fn fully_absorbed_hit_does_nothing() {
        let r = compute_damage(3, 5, DamageKind::Impaling, HitLocation::Torso, 12);
        assert_eq!(r.penetrating, 0);
        assert_eq!(r.injury, 0);
        assert_eq!(r.shock, 0);
    }

    #[test]
    fn minimum_one_injury_on_penetration() {
        let r = compute_damage(1, 0, DamageKind::Crushing, HitLocation::Torso, 12);
        assert_eq!(r.injury, 1);
        assert_eq!(r.shock, -1);
    }

    #[test]
    fn major_wound_over_half_hp() {
        let r = compute_damage(10, 0, DamageKind::Crushing, HitLocation::Torso, 12);
        assert!(r.major_wound);
    }

    #[test]
    fn hp_never_negative() {
        assert_eq!(apply_injury(5, 9), 0);
        assert_eq!(apply_injury(5, 3), 2);
        assert_eq!(apply_injury(0, 100), 0);
    }

    #[test]
    fn consciousness_check_scales_with_deficit() {
        // HT 11, 2 HP left, 26 injury, max 12: deficit 24 -> -2 penalty.
        let mut r = SequenceRoller::new(&[3, 3, 3]);
        assert!(consciousness_check(11, 2, 26, 12, &mut r)); // 9 <= 9
        let mut r = SequenceRoller::new(&[4, 3, 3]);
        assert!(!consciousness_check(11, 2, 26, 12, &mut r)); // 10 > 9
    }
}
