//! Attack roll resolution: effective skill, 3d6 success roll, criticals

use serde::{Deserialize, Serialize};

use crate::rules::dice::{roll_3d6, Roller};
use crate::rules::Maneuver;

/// Everything that shifts the attacker's effective skill for one swing.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttackModifiers {
    pub deceptive_levels: u8,
    pub rapid_strike: bool,
    pub move_and_attack: bool,
    pub all_out_determined: bool,
    pub aim_bonus: i32,
    pub evaluate_bonus: i32,
    pub posture_penalty: i32,
    pub shock_penalty: i32,
    pub location_penalty: i32,
    pub range_penalty: i32,
}

/// Effective skill after all modifiers. Move and Attack caps at 9.
pub fn effective_skill(base: i32, m: &AttackModifiers) -> i32 {
    let mut eff = base;
    eff -= 2 * m.deceptive_levels as i32;
    if m.rapid_strike {
        eff -= 6;
    }
    if m.all_out_determined {
        eff += 4;
    }
    eff += m.aim_bonus + m.evaluate_bonus;
    eff += m.posture_penalty + m.shock_penalty + m.location_penalty + m.range_penalty;
    if m.move_and_attack {
        eff = (eff - 4).min(9);
    }
    eff
}

/// Outcome of a 3d6 roll against effective skill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackOutcome {
    CriticalHit,
    Hit,
    Miss,
    CriticalMiss,
}

/// Classify a 3d6 roll against effective skill.
///
/// Critical success: 3-4 always; 5 at skill 15+; 6 at skill 16+.
/// Critical failure: 18 always; 17 at skill 15 or less; any roll at least
/// 10 over skill.
pub fn classify_roll(effective: i32, roll: i32) -> AttackOutcome {
    let crit_success = roll <= 4
        || (roll == 5 && effective >= 15)
        || (roll == 6 && effective >= 16);
    if crit_success {
        return AttackOutcome::CriticalHit;
    }
    let crit_failure = roll == 18 || (roll == 17 && effective <= 15) || roll >= effective + 10;
    if crit_failure {
        return AttackOutcome::CriticalMiss;
    }
    if roll <= effective {
        AttackOutcome::Hit
    } else {
        AttackOutcome::Miss
    }
}

/// Resolved attack roll with the margin the defense must beat.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AttackRoll {
    pub effective: i32,
    pub roll: i32,
    pub margin: i32,
    pub outcome: AttackOutcome,
}

pub fn roll_attack(effective: i32, roller: &mut dyn Roller) -> AttackRoll {
    let roll = roll_3d6(roller);
    AttackRoll {
        effective,
        roll,
        margin: effective - roll,
        outcome: classify_roll(effective, roll),
    }
}

/// Attacks granted for the turn. Rapid strike and All-Out-Attack (double)
/// each grant exactly one extra attack; this is the single source of truth
/// for the per-turn attack budget on both resolution paths.
pub fn attacks_granted(maneuver: Maneuver, rapid_strike: bool) -> u32 {
    let mut attacks = 1;
    if maneuver == Maneuver::AllOutAttackDouble {
        attacks += 1;
    }
    if rapid_strike {
        attacks += 1;
    }
    attacks
}

/// Result row from the critical hit table (simplified 3d6 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CritHitEffect {
    NormalDamage,
    MaxDamage,
    DoubleDamage,
    BypassArmor,
}

pub fn critical_hit_table(roll: i32) -> CritHitEffect {
    match roll {
        3 | 18 => CritHitEffect::DoubleDamage,
        4 | 5 | 16 | 17 => CritHitEffect::MaxDamage,
        6 | 7 => CritHitEffect::BypassArmor,
        _ => CritHitEffect::NormalDamage,
    }
}

/// Result row from the critical miss table (simplified 3d6 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CritMissEffect {
    Nothing,
    DropWeapon,
    HitSelf,
    LoseBalance,
}

pub fn critical_miss_table(roll: i32) -> CritMissEffect {
    match roll {
        3 | 4 => CritMissEffect::HitSelf,
        5..=8 => CritMissEffect::DropWeapon,
        9..=11 => CritMissEffect::LoseBalance,
        _ => CritMissEffect::Nothing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::dice::SequenceRoller;

    #[test]
    fn effective_skill_stacks_modifiers() {
        let m = AttackModifiers {
            deceptive_levels: 2,
            aim_bonus: 3,
            shock_penalty: -1,
            location_penalty: -3,
            ..Default::default()
        };
        // 14 - 4 + 3 - 1 - 3
        assert_eq!(effective_skill(14, &m), 9);
    }

    #[test]
    fn move_and_attack_caps_at_nine() {
        let m = AttackModifiers {
            move_and_attack: true,
            ..Default::default()
        };
        assert_eq!(effective_skill(18, &m), 9);
        assert_eq!(effective_skill(10, &m), 6);
    }

    #[test]
    fn classify_criticals() {
        assert_eq!(classify_roll(10, 3), AttackOutcome::CriticalHit);
        assert_eq!(classify_roll(10, 4), AttackOutcome::CriticalHit);
        assert_eq!(classify_roll(15, 5), AttackOutcome::CriticalHit);
        assert_eq!(classify_roll(14, 5), AttackOutcome::Hit);
        assert_eq!(classify_roll(16, 6), AttackOutcome::CriticalHit);
        assert_eq!(classify_roll(10, 18), AttackOutcome::CriticalMiss);
        assert_eq!(classify_roll(15, 17), AttackOutcome::CriticalMiss);
        assert_eq!(classify_roll(16, 17), AttackOutcome::Miss);
        assert_eq!(classify_roll(6, 16), AttackOutcome::CriticalMiss);
        assert_eq!(classify_roll(12, 12), AttackOutcome::Hit);
        assert_eq!(classify_roll(12, 13), AttackOutcome::Miss);
    }

    #[test]
    fn attack_budget_single_source() {
        assert_eq!(attacks_granted(Maneuver::Attack, false), 1);
        assert_eq!(attacks_granted(Maneuver::Attack, true), 2);
        assert_eq!(attacks_granted(Maneuver::AllOutAttackDouble, false), 2);
        assert_eq!(attacks_granted(Maneuver::AllOutAttackDouble, true), 3);
    }

    #[test]
    fn roll_attack_reports_margin() {
        let mut r = SequenceRoller::new(&[3, 4, 3]);
        let res = roll_attack(12, &mut r);
        assert_eq!(res.roll, 10);
        assert_eq!(res.margin, 2);
        assert_eq!(res.outcome, AttackOutcome::Hit);
    }
}
