//! The built-in opponent. The bot produces plain client messages and feeds
//! them through the same dispatch as a human, so it can never do anything a
//! player could not.

use uuid::Uuid;

use crate::rules::gurps::defense::{best_defense, DefenseOption, DefenseQuery};
use crate::rules::{Maneuver, RulesetId};
use crate::ws::protocol::{ClientMsg, Condition};

use super::actions::default_defense;
use super::grid::{step_cost, Cell};
use super::r#match::{MatchState, PendingDefense, PendingReaction};

/// Plan a full turn for the bot. The match task dispatches these in order
/// and stops at the first rejection.
pub fn plan_turn(state: &MatchState, bot: Uuid) -> Vec<ClientMsg> {
    let Ok(me) = state.combatant(bot) else {
        return vec![ClientMsg::EndTurn];
    };
    if me.defeated {
        return vec![ClientMsg::EndTurn];
    }
    let Some(target) = nearest_enemy(state, bot) else {
        return vec![ClientMsg::EndTurn];
    };

    match state.ruleset {
        RulesetId::Gurps => plan_gurps(state, bot, target),
        RulesetId::Pf2 => plan_pf2(state, bot, target),
    }
}

fn nearest_enemy(state: &MatchState, of: Uuid) -> Option<Uuid> {
    let me = state.combatants.get(&of)?;
    state
        .standing_enemies(of)
        .into_iter()
        .min_by_key(|id| {
            state
                .combatants
                .get(id)
                .map(|c| state.topology.distance(me.position, c.position))
                .unwrap_or(i32::MAX)
        })
}

fn plan_gurps(state: &MatchState, bot: Uuid, target: Uuid) -> Vec<ClientMsg> {
    let me = &state.combatants[&bot];
    let enemy = &state.combatants[&target];
    let dist = state.topology.distance(me.position, enemy.position);
    let reach = me
        .sheet
        .gurps()
        .and_then(|s| s.weapons.first())
        .map(|w| w.reach.max(1) as i32)
        .unwrap_or(1);
    let in_close_combat = me
        .rules
        .gurps()
        .and_then(|g| g.in_close_combat_with)
        .is_some();
    let stunned = me.has_condition(Condition::Stunned);

    if stunned {
        return vec![
            ClientMsg::SelectManeuver {
                maneuver: Maneuver::DoNothing,
            },
            ClientMsg::EndTurn,
        ];
    }

    if in_close_combat || dist <= reach {
        return vec![
            ClientMsg::SelectManeuver {
                maneuver: Maneuver::Attack,
            },
            ClientMsg::Attack {
                target_id: target,
                weapon: 0,
                hit_location: None,
                deceptive: 0,
                rapid_strike: false,
            },
        ];
    }

    // Close the gap, stopping one cell short of the enemy.
    let mut msgs = vec![ClientMsg::SelectManeuver {
        maneuver: Maneuver::Move,
    }];
    let budget = me.derived.move_points;
    for cell in path_towards(state, bot, me.position, enemy.position, budget, reach) {
        msgs.push(ClientMsg::MoveStep { to: cell });
    }
    msgs.push(ClientMsg::ConfirmMovement);
    msgs.push(ClientMsg::EndTurn);
    msgs
}

fn plan_pf2(state: &MatchState, bot: Uuid, target: Uuid) -> Vec<ClientMsg> {
    let me = &state.combatants[&bot];
    let enemy = &state.combatants[&target];
    let dist = state.topology.distance(me.position, enemy.position);
    let reach = me
        .sheet
        .pf2()
        .and_then(|s| s.attacks.first())
        .map(|a| a.reach.max(1) as i32)
        .unwrap_or(1);
    let actions = me
        .rules
        .pf2()
        .map(|p| p.actions_remaining)
        .unwrap_or(0);

    let mut msgs = Vec::new();
    let mut remaining = actions;

    if dist > reach && remaining > 0 {
        let speed = me.derived.move_points;
        let steps = path_towards(state, bot, me.position, enemy.position, speed, reach);
        if let Some(dest) = steps.last() {
            msgs.push(ClientMsg::Pf2Stride { to: *dest });
            remaining -= 1;
        }
    }
    while remaining > 0 {
        msgs.push(ClientMsg::Pf2Strike {
            target_id: target,
            weapon: 0,
        });
        remaining -= 1;
    }
    msgs.push(ClientMsg::EndTurn);
    msgs
}

/// Greedy steps toward a goal, spending at most `budget` movement and
/// stopping once within `reach` of the goal.
fn path_towards(
    state: &MatchState,
    mover: Uuid,
    from: Cell,
    goal: Cell,
    budget: u32,
    reach: i32,
) -> Vec<Cell> {
    let occupied = state.occupied_cells(mover);
    let mut path = Vec::new();
    let mut here = from;
    let mut spent = 0u32;
    while state.topology.distance(here, goal) > reach {
        let next = state
            .topology
            .neighbors(here)
            .into_iter()
            .filter_map(|n| {
                let cost = step_cost(state.topology, &state.map, &occupied, here, n)?;
                Some((n, cost))
            })
            .min_by_key(|(n, _)| state.topology.distance(*n, goal));
        let Some((next, cost)) = next else { break };
        if spent + cost > budget {
            break;
        }
        // No progress means we are walled in; stop rather than loop.
        if state.topology.distance(next, goal) >= state.topology.distance(here, goal) {
            break;
        }
        spent += cost;
        here = next;
        path.push(next);
    }
    path
}

/// Pick the bot's defense against a pending attack: the best legal option,
/// or a plain dodge when nothing rates.
pub fn choose_defense(state: &MatchState, pd: &PendingDefense) -> DefenseOption {
    let Ok(c) = state.combatant(pd.defender) else {
        return default_defense();
    };
    let (Some(sheet), Some(g)) = (c.sheet.gurps(), c.rules.gurps()) else {
        return default_defense();
    };
    let q = DefenseQuery {
        sheet,
        state: g,
        base_dodge: c.derived.dodge,
        posture: c.posture,
        stunned: c.has_condition(Condition::Stunned),
        arc: pd.arc,
        deceptive_penalty: pd.deceptive_penalty,
    };
    best_defense(&q).map(|(opt, _)| opt).unwrap_or_else(default_defense)
}

/// Whether the bot takes an offered reaction. It always follows a fleeing
/// close-combat opponent and always takes a free swing.
pub fn accept_reaction(_state: &MatchState, _pr: &PendingReaction) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::r#match::duel;
    use crate::rules::gurps::defense::FacingArc;
    use crate::rules::character::DamageKind;
    use crate::rules::dice::DamageFormula;
    use crate::ws::protocol::HitLocation;

    const A: Uuid = Uuid::from_u128(1);
    const B: Uuid = Uuid::from_u128(2);

    #[test]
    fn adjacent_bot_attacks_instead_of_moving() {
        let state = duel(RulesetId::Gurps);
        let plan = plan_turn(&state, A);
        assert!(matches!(
            plan[0],
            ClientMsg::SelectManeuver {
                maneuver: Maneuver::Attack
            }
        ));
        assert!(plan
            .iter()
            .any(|m| matches!(m, ClientMsg::Attack { target_id, .. } if *target_id == B)));
    }

    #[test]
    fn distant_bot_closes_the_gap() {
        let mut state = duel(RulesetId::Gurps);
        state.combatants.get_mut(&B).unwrap().position = Cell::new(12, 4);
        let plan = plan_turn(&state, A);
        assert!(matches!(
            plan[0],
            ClientMsg::SelectManeuver {
                maneuver: Maneuver::Move
            }
        ));
        let steps = plan
            .iter()
            .filter(|m| matches!(m, ClientMsg::MoveStep { .. }))
            .count();
        assert!(steps >= 1);
        assert!(plan.iter().any(|m| matches!(m, ClientMsg::ConfirmMovement)));
    }

    #[test]
    fn pf2_bot_strides_then_spends_the_rest_on_strikes() {
        let mut state = duel(RulesetId::Pf2);
        state.combatants.get_mut(&B).unwrap().position = Cell::new(8, 4);
        let plan = plan_turn(&state, A);
        assert!(matches!(plan[0], ClientMsg::Pf2Stride { .. }));
        let strikes = plan
            .iter()
            .filter(|m| matches!(m, ClientMsg::Pf2Strike { .. }))
            .count();
        assert_eq!(strikes, 2);
        assert!(matches!(plan.last(), Some(ClientMsg::EndTurn)));
    }

    #[test]
    fn defenseless_bot_falls_back_to_dodge() {
        let mut state = duel(RulesetId::Gurps);
        // An attacker who went all-out has no legal defense left.
        state
            .combatants
            .get_mut(&B)
            .unwrap()
            .rules
            .gurps_mut()
            .unwrap()
            .maneuver = Some(Maneuver::AllOutAttackDouble);
        let pd = PendingDefense {
            attacker: A,
            defender: B,
            weapon: 0,
            attack_margin: 2,
            hit_location: HitLocation::Torso,
            damage: DamageFormula::new(1, 6, 2),
            damage_kind: DamageKind::Cutting,
            deceptive_penalty: 0,
            arc: FacingArc::Front,
        };
        let choice = choose_defense(&state, &pd);
        assert_eq!(choice, default_defense());
    }

    #[test]
    fn healthy_bot_picks_its_best_defense() {
        let state = duel(RulesetId::Gurps);
        let pd = PendingDefense {
            attacker: A,
            defender: B,
            weapon: 0,
            attack_margin: 2,
            hit_location: HitLocation::Torso,
            damage: DamageFormula::new(1, 6, 2),
            damage_kind: DamageKind::Cutting,
            deceptive_penalty: 0,
            arc: FacingArc::Front,
        };
        let choice = choose_defense(&state, &pd);
        // Dodge 8 + DB 2 + retreat 3 beats every parry and block.
        assert_eq!(choice.kind, crate::ws::protocol::DefenseKind::Dodge);
        assert!(choice.retreat);
    }
}
