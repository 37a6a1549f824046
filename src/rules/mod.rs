//! Ruleset adapter - one engine, two rule systems
//!
//! `RulesetId` is the seam that keeps the match engine ruleset-agnostic: a
//! tagged enum of the two supported systems with a uniform operation surface
//! (turn reset, derived stats, initiative, grid topology) and explicit
//! capability queries for the few places that genuinely differ in shape.

pub mod character;
pub mod dice;
pub mod gurps;
pub mod pf2;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::grid::{DiagonalRule, Topology};
use character::{CharacterSheet, SheetBlock};
use dice::Roller;

/// The two supported rule systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulesetId {
    /// Skill-vs-skill contested defense, hex grid, one maneuver per turn.
    Gurps,
    /// DC/degree-of-success checks, square grid, three-action budget.
    Pf2,
}

impl RulesetId {
    /// Grid topology used by this ruleset.
    pub fn topology(self) -> Topology {
        match self {
            RulesetId::Gurps => Topology::Hex,
            RulesetId::Pf2 => Topology::Square(DiagonalRule::Chebyshev),
        }
    }

    /// Close combat / grappling exists only in the contested-defense system.
    pub fn supports_close_combat(self) -> bool {
        matches!(self, RulesetId::Gurps)
    }

    /// Whether turns spend a shared action budget instead of one maneuver.
    pub fn uses_action_budget(self) -> bool {
        matches!(self, RulesetId::Pf2)
    }

    /// Compute combat-relevant numbers from a sheet, once at seeding.
    pub fn derived_stats(self, sheet: &CharacterSheet) -> DerivedStats {
        match (&sheet.block, self) {
            (SheetBlock::Gurps(s), RulesetId::Gurps) => gurps::derived_stats(s),
            (SheetBlock::Pf2(s), RulesetId::Pf2) => pf2::derived_stats(s),
            // Mismatched sheet; produce an inert combatant rather than panic.
            _ => DerivedStats::default(),
        }
    }

    /// Initiative score for turn ordering, higher first.
    pub fn initiative(self, sheet: &CharacterSheet, roller: &mut dyn Roller) -> i32 {
        match (&sheet.block, self) {
            // Basic Speed in quarter points, d6 tiebreak in the low bits.
            (SheetBlock::Gurps(s), RulesetId::Gurps) => {
                (s.dx + s.ht) * 10 + dice::roll_d6(roller)
            }
            (SheetBlock::Pf2(s), RulesetId::Pf2) => dice::roll_d20(roller) + s.perception,
            _ => 0,
        }
    }

    /// Fresh per-combatant rules state for the start of a match.
    pub fn initial_state(self, sheet: &CharacterSheet) -> RulesState {
        match self {
            // Fighters enter the arena with their first weapon in hand.
            RulesetId::Gurps => RulesState::Gurps(GurpsCombatant {
                ready_weapon: sheet
                    .gurps()
                    .filter(|s| !s.weapons.is_empty())
                    .map(|_| 0),
                ..Default::default()
            }),
            RulesetId::Pf2 => {
                let (slots, focus) = sheet
                    .pf2()
                    .map(|s| (s.spell_slots, s.focus_points))
                    .unwrap_or((0, 0));
                RulesState::Pf2(Pf2Combatant::new(slots, focus))
            }
        }
    }

    /// Reset a combatant's per-turn resources as their turn begins.
    pub fn reset_turn(self, rules: &mut RulesState) {
        match rules {
            RulesState::Gurps(g) => g.reset_turn(),
            RulesState::Pf2(p) => p.reset_turn(),
        }
    }
}

impl std::fmt::Display for RulesetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RulesetId::Gurps => write!(f, "gurps"),
            RulesetId::Pf2 => write!(f, "pf2"),
        }
    }
}

/// Combat-relevant numbers derived from a sheet.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DerivedStats {
    pub max_hp: i32,
    /// Full movement allowance in grid cells per turn.
    pub move_points: u32,
    /// Base Dodge defense (contested-defense ruleset).
    pub dodge: i32,
    /// Armor Class (DC-based ruleset).
    pub ac: i32,
}

/// Per-combatant, ruleset-specific mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulesState {
    Gurps(GurpsCombatant),
    Pf2(Pf2Combatant),
}

impl RulesState {
    pub fn gurps(&self) -> Option<&GurpsCombatant> {
        match self {
            RulesState::Gurps(g) => Some(g),
            RulesState::Pf2(_) => None,
        }
    }

    pub fn gurps_mut(&mut self) -> Option<&mut GurpsCombatant> {
        match self {
            RulesState::Gurps(g) => Some(g),
            RulesState::Pf2(_) => None,
        }
    }

    pub fn pf2(&self) -> Option<&Pf2Combatant> {
        match self {
            RulesState::Pf2(p) => Some(p),
            RulesState::Gurps(_) => None,
        }
    }

    pub fn pf2_mut(&mut self) -> Option<&mut Pf2Combatant> {
        match self {
            RulesState::Pf2(p) => Some(p),
            RulesState::Gurps(_) => None,
        }
    }
}

/// Per-turn maneuver choice (contested-defense ruleset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Maneuver {
    DoNothing,
    Move,
    ChangePosture,
    Aim,
    Evaluate,
    Attack,
    MoveAndAttack,
    AllOutAttackDetermined,
    AllOutAttackDouble,
    AllOutDefense,
    Ready,
    Concentrate,
    Wait,
}

impl Maneuver {
    /// Movement budget granted, as a fraction of full Move.
    pub fn move_allowance(self, full: u32) -> u32 {
        match self {
            Maneuver::Move | Maneuver::MoveAndAttack => full,
            Maneuver::AllOutAttackDetermined
            | Maneuver::AllOutAttackDouble
            | Maneuver::AllOutDefense => (full / 2).max(1),
            // Everything else allows a single step.
            _ => 1,
        }
    }

    pub fn allows_attack(self) -> bool {
        matches!(
            self,
            Maneuver::Attack
                | Maneuver::MoveAndAttack
                | Maneuver::AllOutAttackDetermined
                | Maneuver::AllOutAttackDouble
                | Maneuver::Wait
        )
    }

    /// All-Out maneuvers give up every active defense until next turn.
    pub fn forfeits_defense(self) -> bool {
        matches!(
            self,
            Maneuver::AllOutAttackDetermined | Maneuver::AllOutAttackDouble
        )
    }
}

/// What a Wait maneuver is watching for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitTrigger {
    EnemyApproaches,
    EnemyAttacks,
}

/// Aim state tied to a specific target; the bonus grows with held turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AimState {
    pub target: Uuid,
    pub turns: u32,
}

/// Evaluate state tied to a specific target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluateState {
    pub target: Uuid,
    pub bonus: i32,
}

/// Contested-defense per-combatant state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GurpsCombatant {
    pub maneuver: Option<Maneuver>,
    pub defenses_this_turn: u32,
    pub retreated_this_turn: bool,
    /// Parries already made this turn, keyed by weapon index.
    pub parries_by_weapon: HashMap<usize, u32>,
    pub blocked_this_turn: bool,
    pub aim: Option<AimState>,
    pub evaluate: Option<EvaluateState>,
    pub in_close_combat_with: Option<Uuid>,
    /// Grapple control points this combatant holds on others.
    pub control_points: HashMap<Uuid, i32>,
    /// Cumulative shock penalty to skills from injuries this turn.
    pub shock_penalty: i32,
    pub attacks_remaining: u32,
    /// Rapid Strike already bought its extra attack this turn.
    pub rapid_strike_granted: bool,
    /// Weapon currently in hand; attacks and parries need a ready weapon.
    pub ready_weapon: Option<usize>,
    pub wait_trigger: Option<WaitTrigger>,
}

impl GurpsCombatant {
    pub fn reset_turn(&mut self) {
        self.maneuver = None;
        self.defenses_this_turn = 0;
        self.retreated_this_turn = false;
        self.parries_by_weapon.clear();
        self.blocked_this_turn = false;
        self.shock_penalty = 0;
        self.attacks_remaining = 0;
        self.rapid_strike_granted = false;
        self.wait_trigger = None;
        // Aim and Evaluate survive only while the maneuver is repeated; the
        // handlers re-arm them, so expire here and let selection restore.
    }
}

/// DC-based per-combatant state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pf2Combatant {
    pub actions_remaining: u8,
    /// Attacks already made this turn, for the multiple attack penalty.
    pub attacks_this_turn: u8,
    pub reaction_available: bool,
    pub shield_raised: bool,
    pub spell_slots_remaining: u8,
    pub focus_points: u8,
    pub dying: u8,
    pub wounded: u8,
    pub frightened: u8,
    /// Flat-footed against this specific combatant (from a Feint).
    pub flat_footed_vs: Option<Uuid>,
}

/// Actions granted at the start of each turn.
pub const PF2_ACTIONS_PER_TURN: u8 = 3;
/// Dying value at which a combatant is defeated.
pub const PF2_DYING_MAX: u8 = 4;

impl Pf2Combatant {
    pub fn new(spell_slots: u8, focus_points: u8) -> Self {
        Self {
            actions_remaining: PF2_ACTIONS_PER_TURN,
            attacks_this_turn: 0,
            reaction_available: true,
            shield_raised: false,
            spell_slots_remaining: spell_slots,
            focus_points,
            dying: 0,
            wounded: 0,
            frightened: 0,
            flat_footed_vs: None,
        }
    }

    pub fn reset_turn(&mut self) {
        self.actions_remaining = PF2_ACTIONS_PER_TURN;
        self.attacks_this_turn = 0;
        self.reaction_available = true;
        self.shield_raised = false;
        self.flat_footed_vs = None;
        if self.frightened > 0 {
            self.frightened -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use character::{stock_gurps_fighter, stock_pf2_fighter};
    use dice::SequenceRoller;

    #[test]
    fn topology_follows_ruleset() {
        assert_eq!(RulesetId::Gurps.topology(), Topology::Hex);
        assert!(matches!(RulesetId::Pf2.topology(), Topology::Square(_)));
    }

    #[test]
    fn capabilities_are_disjoint() {
        assert!(RulesetId::Gurps.supports_close_combat());
        assert!(!RulesetId::Gurps.uses_action_budget());
        assert!(!RulesetId::Pf2.supports_close_combat());
        assert!(RulesetId::Pf2.uses_action_budget());
    }

    #[test]
    fn pf2_turn_reset_refills_budget_and_decays_fear() {
        let mut p = Pf2Combatant::new(2, 1);
        p.actions_remaining = 0;
        p.attacks_this_turn = 2;
        p.reaction_available = false;
        p.shield_raised = true;
        p.frightened = 2;
        p.reset_turn();
        assert_eq!(p.actions_remaining, PF2_ACTIONS_PER_TURN);
        assert_eq!(p.attacks_this_turn, 0);
        assert!(p.reaction_available);
        assert!(!p.shield_raised);
        assert_eq!(p.frightened, 1);
    }

    #[test]
    fn gurps_turn_reset_clears_counters() {
        let mut g = GurpsCombatant {
            maneuver: Some(Maneuver::Attack),
            defenses_this_turn: 2,
            retreated_this_turn: true,
            shock_penalty: -3,
            ..Default::default()
        };
        g.parries_by_weapon.insert(0, 2);
        g.reset_turn();
        assert_eq!(g.maneuver, None);
        assert_eq!(g.defenses_this_turn, 0);
        assert!(!g.retreated_this_turn);
        assert!(g.parries_by_weapon.is_empty());
        assert_eq!(g.shock_penalty, 0);
    }

    #[test]
    fn initiative_uses_sheet_numbers() {
        let g = stock_gurps_fighter("a");
        let mut roller = SequenceRoller::new(&[4]);
        // (DX 12 + HT 11) * 10 + d6
        assert_eq!(RulesetId::Gurps.initiative(&g, &mut roller), 234);

        let p = stock_pf2_fighter("b");
        let mut roller = SequenceRoller::new(&[13]);
        assert_eq!(RulesetId::Pf2.initiative(&p, &mut roller), 20);
    }

    #[test]
    fn maneuver_move_allowance() {
        assert_eq!(Maneuver::Move.move_allowance(6), 6);
        assert_eq!(Maneuver::AllOutAttackDouble.move_allowance(6), 3);
        assert_eq!(Maneuver::Attack.move_allowance(6), 1);
        assert_eq!(Maneuver::Aim.move_allowance(6), 1);
    }
}
