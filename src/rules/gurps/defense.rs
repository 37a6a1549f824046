//! Active defense resolution: dodge, parry, block, retreat

use serde::{Deserialize, Serialize};

use crate::game::grid::{Cell, Topology};
use crate::rules::character::GurpsSheet;
use crate::rules::dice::{roll_3d6, Roller};
use crate::rules::{GurpsCombatant, Maneuver};
use crate::ws::protocol::{DefenseKind, Posture};

/// Which arc the attack comes from, relative to the defender's facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacingArc {
    Front,
    Side,
    Rear,
}

/// Arc of `attacker_pos` as seen by a defender at `pos` facing `facing`.
pub fn facing_arc(topology: Topology, pos: Cell, facing: u8, attacker_pos: Cell) -> FacingArc {
    let dirs = topology.direction_count() as i32;
    let towards = topology.direction_towards(pos, attacker_pos) as i32;
    let diff = {
        let d = (towards - facing as i32).rem_euclid(dirs);
        d.min(dirs - d)
    };
    // Hex: diff 0-1 front, 2 side, 3 rear. Square/8: 0-2 front, 3 side, 4 rear.
    let half = dirs / 2;
    if diff < half - 1 {
        FacingArc::Front
    } else if diff == half - 1 {
        FacingArc::Side
    } else {
        FacingArc::Rear
    }
}

/// One concrete defense the defender could attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefenseOption {
    pub kind: DefenseKind,
    pub weapon: Option<usize>,
    pub retreat: bool,
    pub drop_prone: bool,
}

/// Inputs that shape every defense value for one incoming attack.
#[derive(Debug, Clone, Copy)]
pub struct DefenseQuery<'a> {
    pub sheet: &'a GurpsSheet,
    pub state: &'a GurpsCombatant,
    pub base_dodge: i32,
    pub posture: Posture,
    pub stunned: bool,
    pub arc: FacingArc,
    /// Penalty from the attacker's deceptive attack (zero or negative).
    pub deceptive_penalty: i32,
}

/// Effective value of one defense option, or None if it is not legal.
pub fn defense_value(q: &DefenseQuery<'_>, option: &DefenseOption) -> Option<i32> {
    if option.kind == DefenseKind::None {
        return None;
    }
    // No active defense from the rear arc or after an All-Out Attack.
    if q.arc == FacingArc::Rear {
        return None;
    }
    if q.state.maneuver.is_some_and(|m| m.forfeits_defense()) {
        return None;
    }

    let mut value = match option.kind {
        DefenseKind::Dodge => {
            let mut v = q.base_dodge;
            if option.retreat && !q.state.retreated_this_turn {
                v += 3;
            }
            if option.drop_prone {
                v += 3;
            }
            v
        }
        DefenseKind::Parry => {
            let idx = option.weapon?;
            // Parrying needs the weapon in hand.
            if q.state.ready_weapon != Some(idx) {
                return None;
            }
            let weapon = q.sheet.weapons.get(idx)?;
            if weapon.ranged {
                return None;
            }
            let mut v = weapon.skill / 2 + 3 + weapon.parry_mod;
            // Cumulative penalty for repeat parries with the same weapon.
            let prior = q.state.parries_by_weapon.get(&idx).copied().unwrap_or(0);
            v -= 4 * prior as i32;
            if option.retreat && !q.state.retreated_this_turn {
                v += 1;
            }
            if option.drop_prone {
                return None;
            }
            v
        }
        DefenseKind::Block => {
            if q.state.blocked_this_turn {
                return None;
            }
            let shield = q.sheet.shield.as_ref()?;
            let mut v = shield.skill / 2 + 3;
            if option.retreat && !q.state.retreated_this_turn {
                v += 1;
            }
            if option.drop_prone {
                return None;
            }
            v
        }
        DefenseKind::None => return None,
    };

    if let Some(shield) = &q.sheet.shield {
        value += shield.db;
    }
    if q.state.maneuver == Some(Maneuver::AllOutDefense) {
        value += 2;
    }
    if q.arc == FacingArc::Side {
        value -= 2;
    }
    if q.stunned {
        value -= 4;
    }
    value += super::posture_defense_penalty(q.posture);
    value += q.deceptive_penalty;

    Some(value)
}

/// Every legal defense option with its effective value.
pub fn legal_options(q: &DefenseQuery<'_>) -> Vec<(DefenseOption, i32)> {
    let mut options = Vec::new();
    for retreat in [false, true] {
        for drop_prone in [false, true] {
            let dodge = DefenseOption {
                kind: DefenseKind::Dodge,
                weapon: None,
                retreat,
                drop_prone,
            };
            if let Some(v) = defense_value(q, &dodge) {
                options.push((dodge, v));
            }
            if drop_prone {
                continue;
            }
            for idx in 0..q.sheet.weapons.len() {
                let parry = DefenseOption {
                    kind: DefenseKind::Parry,
                    weapon: Some(idx),
                    retreat,
                    drop_prone: false,
                };
                if let Some(v) = defense_value(q, &parry) {
                    options.push((parry, v));
                }
            }
            let block = DefenseOption {
                kind: DefenseKind::Block,
                weapon: None,
                retreat,
                drop_prone: false,
            };
            if let Some(v) = defense_value(q, &block) {
                options.push((block, v));
            }
        }
    }
    options
}

/// Highest-value legal defense, preferring a free retreat on ties.
pub fn best_defense(q: &DefenseQuery<'_>) -> Option<(DefenseOption, i32)> {
    legal_options(q)
        .into_iter()
        .max_by_key(|(opt, v)| (*v, opt.retreat && !q.state.retreated_this_turn))
}

/// A rolled defense attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DefenseRoll {
    pub value: i32,
    pub roll: i32,
    pub success: bool,
}

pub fn roll_defense(value: i32, roller: &mut dyn Roller) -> DefenseRoll {
    let roll = roll_3d6(roller);
    // 3 and 4 always defend; 17 and 18 always fail.
    let success = roll <= 4 || (roll <= value && roll < 17);
    DefenseRoll {
        value,
        roll,
        success,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::character::stock_gurps_fighter;
    use crate::rules::dice::SequenceRoller;

    fn query<'a>(
        sheet: &'a GurpsSheet,
        state: &'a GurpsCombatant,
        arc: FacingArc,
    ) -> DefenseQuery<'a> {
        DefenseQuery {
            sheet,
            state,
            base_dodge: 8,
            posture: Posture::Standing,
            stunned: false,
            arc,
            deceptive_penalty: 0,
        }
    }

    fn ready_state() -> GurpsCombatant {
        GurpsCombatant {
            ready_weapon: Some(0),
            ..Default::default()
        }
    }

    #[test]
    fn rear_arc_allows_no_defense() {
        let sheet = stock_gurps_fighter("d");
        let state = ready_state();
        let q = query(sheet.gurps().expect("gurps"), &state, FacingArc::Rear);
        assert!(legal_options(&q).is_empty());
    }

    #[test]
    fn dodge_retreat_adds_three_parry_retreat_one() {
        let sheet = stock_gurps_fighter("d");
        let gs = sheet.gurps().expect("gurps");
        let state = ready_state();
        let q = query(gs, &state, FacingArc::Front);

        let dodge = DefenseOption {
            kind: DefenseKind::Dodge,
            weapon: None,
            retreat: false,
            drop_prone: false,
        };
        let dodge_retreat = DefenseOption {
            retreat: true,
            ..dodge
        };
        let base = defense_value(&q, &dodge).expect("legal");
        let retreating = defense_value(&q, &dodge_retreat).expect("legal");
        assert_eq!(retreating - base, 3);

        let parry = DefenseOption {
            kind: DefenseKind::Parry,
            weapon: Some(0),
            retreat: false,
            drop_prone: false,
        };
        let parry_retreat = DefenseOption {
            retreat: true,
            ..parry
        };
        let base = defense_value(&q, &parry).expect("legal");
        let retreating = defense_value(&q, &parry_retreat).expect("legal");
        assert_eq!(retreating - base, 1);
    }

    #[test]
    fn repeat_parry_same_weapon_penalized() {
        let sheet = stock_gurps_fighter("d");
        let gs = sheet.gurps().expect("gurps");
        let mut state = ready_state();
        let parry = DefenseOption {
            kind: DefenseKind::Parry,
            weapon: Some(0),
            retreat: false,
            drop_prone: false,
        };
        let fresh = {
            let q = query(gs, &state, FacingArc::Front);
            defense_value(&q, &parry).expect("legal")
        };
        state.parries_by_weapon.insert(0, 1);
        let repeat = {
            let q = query(gs, &state, FacingArc::Front);
            defense_value(&q, &parry).expect("legal")
        };
        assert_eq!(fresh - repeat, 4);
    }

    #[test]
    fn block_only_once_per_turn() {
        let sheet = stock_gurps_fighter("d");
        let gs = sheet.gurps().expect("gurps");
        let mut state = ready_state();
        let block = DefenseOption {
            kind: DefenseKind::Block,
            weapon: None,
            retreat: false,
            drop_prone: false,
        };
        {
            let q = query(gs, &state, FacingArc::Front);
            assert!(defense_value(&q, &block).is_some());
        }
        state.blocked_this_turn = true;
        let q = query(gs, &state, FacingArc::Front);
        assert!(defense_value(&q, &block).is_none());
    }

    #[test]
    fn all_out_attacker_cannot_defend() {
        let sheet = stock_gurps_fighter("d");
        let gs = sheet.gurps().expect("gurps");
        let state = GurpsCombatant {
            maneuver: Some(Maneuver::AllOutAttackDouble),
            ready_weapon: Some(0),
            ..Default::default()
        };
        let q = query(gs, &state, FacingArc::Front);
        assert!(legal_options(&q).is_empty());
    }

    #[test]
    fn best_defense_prefers_highest_then_free_retreat() {
        let sheet = stock_gurps_fighter("d");
        let gs = sheet.gurps().expect("gurps");
        let state = ready_state();
        let q = query(gs, &state, FacingArc::Front);
        let (opt, value) = best_defense(&q).expect("some option");
        for (_, v) in legal_options(&q) {
            assert!(value >= v);
        }
        // A retreat strictly improves dodge, so the best pick retreats.
        assert!(opt.retreat);
    }

    #[test]
    fn defense_roll_success_bounds() {
        let mut r = SequenceRoller::new(&[1, 1, 1]);
        assert!(roll_defense(-5, &mut r).success); // 3 always defends
        let mut r = SequenceRoller::new(&[6, 6, 5]);
        assert!(!roll_defense(18, &mut r).success); // 17 always fails
        let mut r = SequenceRoller::new(&[3, 3, 3]);
        assert!(roll_defense(9, &mut r).success);
        let mut r = SequenceRoller::new(&[4, 3, 3]);
        assert!(!roll_defense(9, &mut r).success);
    }

    #[test]
    fn side_arc_penalizes_defense() {
        let sheet = stock_gurps_fighter("d");
        let gs = sheet.gurps().expect("gurps");
        let state = ready_state();
        let dodge = DefenseOption {
            kind: DefenseKind::Dodge,
            weapon: None,
            retreat: false,
            drop_prone: false,
        };
        let front = {
            let q = query(gs, &state, FacingArc::Front);
            defense_value(&q, &dodge).expect("legal")
        };
        let side = {
            let q = query(gs, &state, FacingArc::Side);
            defense_value(&q, &dodge).expect("legal")
        };
        assert_eq!(front - side, 2);
    }
}
