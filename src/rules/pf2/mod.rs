//! DC-based ruleset - derived numbers, multiple attack penalty, dying

pub mod check;

use crate::rules::character::Pf2Sheet;
use crate::rules::DerivedStats;

pub fn derived_stats(sheet: &Pf2Sheet) -> DerivedStats {
    DerivedStats {
        max_hp: sheet.max_hp,
        move_points: sheet.speed,
        dodge: 0,
        ac: sheet.ac,
    }
}

/// Escalating penalty for each attack after the first in one turn.
pub fn map_penalty(attacks_this_turn: u8, agile: bool) -> i32 {
    match attacks_this_turn {
        0 => 0,
        1 => {
            if agile {
                -4
            } else {
                -5
            }
        }
        _ => {
            if agile {
                -8
            } else {
                -10
            }
        }
    }
}

/// AC adjustment from the defender's transient circumstances.
pub fn ac_adjustment(shield_raised: bool, shield_bonus: i32, prone: bool, flat_footed: bool) -> i32 {
    let mut adj = 0;
    if shield_raised {
        adj += shield_bonus;
    }
    if prone {
        adj -= 2;
    }
    if flat_footed {
        adj -= 2;
    }
    adj
}

/// Recovery flat check DC while dying.
pub fn recovery_dc(dying: u8) -> i32 {
    10 + dying as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_escalates_and_agile_reduces() {
        assert_eq!(map_penalty(0, false), 0);
        assert_eq!(map_penalty(1, false), -5);
        assert_eq!(map_penalty(2, false), -10);
        assert_eq!(map_penalty(3, false), -10);
        assert_eq!(map_penalty(1, true), -4);
        assert_eq!(map_penalty(2, true), -8);
    }

    #[test]
    fn ac_adjustments_stack() {
        assert_eq!(ac_adjustment(true, 2, false, false), 2);
        assert_eq!(ac_adjustment(false, 2, true, true), -4);
        assert_eq!(ac_adjustment(true, 2, true, false), 0);
    }

    #[test]
    fn recovery_dc_tracks_dying() {
        assert_eq!(recovery_dc(1), 11);
        assert_eq!(recovery_dc(3), 13);
    }
}
