//! Close combat and grappling - control point ledger

use serde::{Deserialize, Serialize};

use crate::rules::character::GurpsSheet;
use crate::rules::dice::{roll_3d6, DamageFormula, Roller};

/// Control damage from a successful grapple, scaled from ST.
pub fn control_formula(st: i32) -> DamageFormula {
    // Thrust-based: ST 10 = 1d6-2, one step per 2 ST.
    DamageFormula::new(1, 6, (st - 10) / 2 - 2)
}

/// DX-based grapple skill, falling back to raw DX.
pub fn grapple_skill(sheet: &GurpsSheet) -> i32 {
    sheet.grapple_skill.unwrap_or(sheet.dx)
}

/// Result of a grapple attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GrappleResult {
    pub attack_roll: i32,
    pub success: bool,
    /// Control points gained on success.
    pub control_points: i32,
}

/// Roll a grapple: skill roll to grab, then control points if it lands.
/// The defender's resistance is resolved by the caller as a normal active
/// defense; this covers the unopposed path (rear arc, stunned target).
pub fn roll_grapple(sheet: &GurpsSheet, roller: &mut dyn Roller) -> GrappleResult {
    let skill = grapple_skill(sheet);
    let roll = roll_3d6(roller);
    if roll > skill {
        return GrappleResult {
            attack_roll: roll,
            success: false,
            control_points: 0,
        };
    }
    let cp = control_formula(sheet.st).roll(roller).max(1);
    GrappleResult {
        attack_roll: roll,
        success: true,
        control_points: cp,
    }
}

/// Result of a break-free contest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakFreeResult {
    pub escaper_margin: i32,
    pub holder_margin: i32,
    /// Control points removed from the holder's ledger (0 on failure).
    pub points_removed: i32,
    pub free: bool,
}

/// Contested ST roll to shed control points. The holder adds a bonus from
/// accumulated control points; the escaper removes points equal to their
/// margin of victory and is free once the ledger empties.
pub fn roll_break_free(
    escaper_st: i32,
    holder_st: i32,
    held_points: i32,
    roller: &mut dyn Roller,
) -> BreakFreeResult {
    let holder_bonus = held_points / 2;
    let escaper_margin = escaper_st - roll_3d6(roller);
    let holder_margin = (holder_st + holder_bonus) - roll_3d6(roller);
    if escaper_margin > holder_margin {
        let removed = (escaper_margin - holder_margin).min(held_points);
        BreakFreeResult {
            escaper_margin,
            holder_margin,
            points_removed: removed,
            free: removed >= held_points,
        }
    } else {
        BreakFreeResult {
            escaper_margin,
            holder_margin,
            points_removed: 0,
            free: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::character::stock_gurps_fighter;
    use crate::rules::dice::SequenceRoller;

    #[test]
    fn control_formula_scales_with_st() {
        assert_eq!(control_formula(10), DamageFormula::new(1, 6, -2));
        assert_eq!(control_formula(14), DamageFormula::new(1, 6, 0));
    }

    #[test]
    fn grapple_success_awards_points() {
        let sheet = stock_gurps_fighter("g");
        let gs = sheet.gurps().expect("gurps");
        // Skill 13: roll 10 hits, then 1d6-1 control (ST 12 -> 1d6-1... )
        let mut r = SequenceRoller::new(&[3, 3, 4, 5]);
        let res = roll_grapple(gs, &mut r);
        assert!(res.success);
        assert!(res.control_points >= 1);
    }

    #[test]
    fn grapple_miss_awards_nothing() {
        let sheet = stock_gurps_fighter("g");
        let gs = sheet.gurps().expect("gurps");
        let mut r = SequenceRoller::new(&[6, 6, 6]);
        let res = roll_grapple(gs, &mut r);
        assert!(!res.success);
        assert_eq!(res.control_points, 0);
    }

    #[test]
    fn break_free_removes_margin_points() {
        // Escaper ST 14 rolls 8 (margin 6); holder ST 10 + 2 CP bonus
        // rolls 12 (margin 0). Removes 4 of 4 points -> free.
        let mut r = SequenceRoller::new(&[3, 3, 2, 4, 4, 4]);
        let res = roll_break_free(14, 10, 4, &mut r);
        assert_eq!(res.escaper_margin, 6);
        assert_eq!(res.holder_margin, 0);
        assert_eq!(res.points_removed, 4);
        assert!(res.free);
    }

    #[test]
    fn break_free_failure_keeps_hold() {
        let mut r = SequenceRoller::new(&[6, 6, 6, 1, 1, 1]);
        let res = roll_break_free(10, 14, 6, &mut r);
        assert!(!res.free);
        assert_eq!(res.points_removed, 0);
    }
}
