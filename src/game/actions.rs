//! Intent handlers for the contested-defense ruleset, plus the shared
//! dispatch gate and error taxonomy.
//!
//! Every handler has the same shape: it validates against the current
//! `MatchState`, mutates it, and returns presentation events. Nothing here
//! is async; the match task owns the state and calls in.

use thiserror::Error;
use uuid::Uuid;

use crate::rules::character::DamageKind;
use crate::rules::dice::{DamageFormula, Roller};
use crate::rules::gurps::attack::{
    attacks_granted, critical_hit_table, critical_miss_table, effective_skill, roll_attack,
    AttackModifiers, AttackOutcome, CritHitEffect, CritMissEffect,
};
use crate::rules::gurps::close_combat::{roll_break_free, roll_grapple};
use crate::rules::gurps::damage::{
    apply_injury, compute_damage, consciousness_check, major_wound_check,
};
use crate::rules::gurps::defense::{
    best_defense, defense_value, facing_arc, roll_defense, DefenseOption, DefenseQuery, FacingArc,
};
use crate::rules::gurps::{
    location_penalty, posture_attack_penalty, posture_defense_penalty, range_penalty,
};
use crate::rules::{AimState, EvaluateState, Maneuver, RulesetId, WaitTrigger};
use crate::ws::protocol::{
    ClientMsg, Condition, DefenseKind, EffectKind, HitLocation, PendingPrompt, Posture, ReadyKind,
};

use super::grid::{reachable_cells, step_cost, Cell};
use super::r#match::{
    Focus, MatchPhase, MatchState, PendingDefense, PendingReaction, ReactionKind, TurnMovement,
    DEFENSE_TIMEOUT,
};
use super::OutEvent;

/// Why a player intent was rejected. The code string goes out on the wire;
/// the display form is the human-readable message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("it is not your turn")]
    NotYourTurn,
    #[error("no such combatant in this match")]
    UnknownCombatant,
    #[error("you are not seated in this match")]
    NotInMatch,
    #[error("the match is not in progress")]
    MatchNotActive,
    #[error("the match is paused")]
    MatchPaused,
    #[error("that action belongs to the other ruleset")]
    UnsupportedByRuleset,
    #[error("select a maneuver first")]
    ManeuverRequired,
    #[error("a maneuver was already selected this turn")]
    ManeuverAlreadySet,
    #[error("your maneuver does not allow attacking")]
    ManeuverForbidsAttack,
    #[error("no attacks remaining this turn")]
    NoAttacksLeft,
    #[error("no such weapon")]
    UnknownWeapon,
    #[error("that weapon is not ready")]
    WeaponNotReady,
    #[error("invalid target")]
    InvalidTarget,
    #[error("target is out of range")]
    OutOfRange,
    #[error("no movement in progress")]
    NotMoving,
    #[error("that step is not legal")]
    IllegalStep,
    #[error("a defense is pending; only the defender may act")]
    DefensePending,
    #[error("a reaction is pending; only the reactor may act")]
    ReactionPending,
    #[error("no defense is pending")]
    NoDefensePending,
    #[error("you are not the defender of the pending attack")]
    NotDefender,
    #[error("that defense is not available")]
    IllegalDefense,
    #[error("no reaction is pending")]
    NoReactionPending,
    #[error("you are not the owner of the pending reaction")]
    NotReactor,
    #[error("you are not in close combat")]
    NotInCloseCombat,
    #[error("you are already in close combat")]
    AlreadyInCloseCombat,
    #[error("you are held in a grapple; break free first")]
    HeldInGrapple,
    #[error("deceptive attack cannot push effective skill below 10")]
    DeceptiveLimit,
    #[error("no actions remaining this turn")]
    NoActionsLeft,
    #[error("no such spell")]
    UnknownSpell,
    #[error("no spell slots or focus points remaining")]
    NoSpellSlots,
    #[error("you have no shield")]
    NoShield,
    #[error("you are incapacitated")]
    Incapacitated,
}

impl ActionError {
    pub fn code(&self) -> &'static str {
        match self {
            ActionError::NotYourTurn => "not_your_turn",
            ActionError::UnknownCombatant => "unknown_combatant",
            ActionError::NotInMatch => "not_in_match",
            ActionError::MatchNotActive => "match_not_active",
            ActionError::MatchPaused => "match_paused",
            ActionError::UnsupportedByRuleset => "unsupported_by_ruleset",
            ActionError::ManeuverRequired => "maneuver_required",
            ActionError::ManeuverAlreadySet => "maneuver_already_set",
            ActionError::ManeuverForbidsAttack => "maneuver_forbids_attack",
            ActionError::NoAttacksLeft => "no_attacks_left",
            ActionError::UnknownWeapon => "unknown_weapon",
            ActionError::WeaponNotReady => "weapon_not_ready",
            ActionError::InvalidTarget => "invalid_target",
            ActionError::OutOfRange => "out_of_range",
            ActionError::NotMoving => "not_moving",
            ActionError::IllegalStep => "illegal_step",
            ActionError::DefensePending => "defense_pending",
            ActionError::ReactionPending => "reaction_pending",
            ActionError::NoDefensePending => "no_defense_pending",
            ActionError::NotDefender => "not_defender",
            ActionError::IllegalDefense => "illegal_defense",
            ActionError::NoReactionPending => "no_reaction_pending",
            ActionError::NotReactor => "not_reactor",
            ActionError::NotInCloseCombat => "not_in_close_combat",
            ActionError::AlreadyInCloseCombat => "already_in_close_combat",
            ActionError::HeldInGrapple => "held_in_grapple",
            ActionError::DeceptiveLimit => "deceptive_limit",
            ActionError::NoActionsLeft => "no_actions_left",
            ActionError::UnknownSpell => "unknown_spell",
            ActionError::NoSpellSlots => "no_spell_slots",
            ActionError::NoShield => "no_shield",
            ActionError::Incapacitated => "incapacitated",
        }
    }
}

/// Gate and route one intent. Pending defense and reaction windows lock out
/// everyone but their owner; surrender is always allowed.
pub fn dispatch(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    actor: Uuid,
    msg: &ClientMsg,
) -> Result<Vec<OutEvent>, ActionError> {
    if state.phase == MatchPhase::Paused {
        return Err(ActionError::MatchPaused);
    }
    if state.phase != MatchPhase::Active {
        return Err(ActionError::MatchNotActive);
    }

    match &state.focus {
        Focus::AwaitingDefense(pd) => match msg {
            ClientMsg::Defend { .. } if actor == pd.defender => {}
            ClientMsg::Surrender => {}
            _ => return Err(ActionError::DefensePending),
        },
        Focus::AwaitingReaction(pr) => match msg {
            ClientMsg::CloseCombatResponse { .. }
                if actor == pr.reactor && pr.kind == ReactionKind::CloseCombatExit => {}
            ClientMsg::Surrender => {}
            _ => return Err(ActionError::ReactionPending),
        },
        _ => {}
    }

    match msg {
        ClientMsg::SelectManeuver { maneuver } => select_maneuver(state, actor, *maneuver),
        ClientMsg::MoveStep { to } => move_step(state, roller, actor, *to),
        ClientMsg::Rotate { clockwise } => rotate(state, actor, *clockwise),
        ClientMsg::ConfirmMovement => confirm_movement(state, actor),
        ClientMsg::UndoMovement => undo_movement(state, actor),
        ClientMsg::SkipMovement => skip_movement(state, actor),
        ClientMsg::Attack {
            target_id,
            weapon,
            hit_location,
            deceptive,
            rapid_strike,
        } => attack(
            state,
            roller,
            actor,
            *target_id,
            *weapon,
            hit_location.unwrap_or_default(),
            *deceptive,
            *rapid_strike,
        ),
        ClientMsg::Defend {
            defense,
            weapon,
            retreat,
            drop_prone,
        } => {
            let choice = DefenseOption {
                kind: *defense,
                weapon: *weapon,
                retreat: *retreat,
                drop_prone: *drop_prone,
            };
            resolve_defense(state, roller, actor, choice)
        }
        ClientMsg::ReadyAction { action, weapon } => ready_action(state, actor, *action, *weapon),
        ClientMsg::EnterCloseCombat { target_id } => enter_close_combat(state, actor, *target_id),
        ClientMsg::ExitCloseCombat => exit_close_combat(state, actor),
        ClientMsg::CloseCombatResponse { follow } => {
            let pr = state
                .focus
                .pending_reaction()
                .ok_or(ActionError::NoReactionPending)?;
            if pr.reactor != actor {
                return Err(ActionError::NotReactor);
            }
            resolve_close_combat_exit(state, roller, *follow)
        }
        ClientMsg::Grapple => grapple(state, roller, actor),
        ClientMsg::BreakFree => break_free(state, roller, actor),
        ClientMsg::AimTarget { target_id } => aim_target(state, actor, *target_id),
        ClientMsg::EvaluateTarget { target_id } => evaluate_target(state, actor, *target_id),
        ClientMsg::SetWaitTrigger { trigger } => set_wait_trigger(state, actor, *trigger),
        ClientMsg::ChangePosture { posture } => change_posture(state, actor, *posture),
        ClientMsg::EndTurn => end_turn(state, roller, actor),
        ClientMsg::Surrender => surrender(state, roller, actor),
        _ => Err(ActionError::UnsupportedByRuleset),
    }
}

fn require_turn(state: &MatchState, actor: Uuid) -> Result<(), ActionError> {
    let c = state.combatant(actor)?;
    if c.defeated {
        return Err(ActionError::Incapacitated);
    }
    if state.active_turn != actor {
        return Err(ActionError::NotYourTurn);
    }
    Ok(())
}

fn require_gurps(state: &MatchState) -> Result<(), ActionError> {
    if state.ruleset != RulesetId::Gurps {
        return Err(ActionError::UnsupportedByRuleset);
    }
    Ok(())
}

/// The default when a human defender lets the clock run out: dodge in place.
pub fn default_defense() -> DefenseOption {
    DefenseOption {
        kind: DefenseKind::Dodge,
        weapon: None,
        retreat: false,
        drop_prone: false,
    }
}

// ---------------------------------------------------------------------------
// Maneuver selection and movement
// ---------------------------------------------------------------------------

fn select_maneuver(
    state: &mut MatchState,
    actor: Uuid,
    maneuver: Maneuver,
) -> Result<Vec<OutEvent>, ActionError> {
    require_gurps(state)?;
    require_turn(state, actor)?;

    let c = state.combatant(actor)?;
    let g = c.rules.gurps().ok_or(ActionError::UnsupportedByRuleset)?;
    if g.maneuver.is_some() {
        return Err(ActionError::ManeuverAlreadySet);
    }
    let full = c.derived.move_points;
    let posture = c.posture;
    let in_close_combat = g.in_close_combat_with.is_some();
    let position = c.position;
    let keeps_aim = g.aim;
    let keeps_evaluate = g.evaluate;

    let mut budget = maneuver.move_allowance(full);
    budget = match posture {
        Posture::Standing => budget,
        Posture::Crouching => budget.min((full * 2 / 3).max(1)),
        Posture::Kneeling => budget.min((full / 3).max(1)),
        Posture::Prone => budget.min(1),
    };

    {
        let c = state.combatant_mut(actor)?;
        let g = c
            .rules
            .gurps_mut()
            .ok_or(ActionError::UnsupportedByRuleset)?;
        g.maneuver = Some(maneuver);
        g.attacks_remaining = attacks_granted(maneuver, false);
        g.rapid_strike_granted = false;
        // Aim and Evaluate only persist while the maneuver is repeated.
        if maneuver != Maneuver::Aim {
            g.aim = None;
        } else {
            g.aim = keeps_aim;
        }
        if maneuver != Maneuver::Evaluate {
            g.evaluate = None;
        } else {
            g.evaluate = keeps_evaluate;
        }
        let facing = c.facing;
        // Close combat pins you to your hex until you disengage.
        if in_close_combat || budget == 0 {
            state.focus = Focus::Idle;
        } else {
            let occupied = state.occupied_cells(actor);
            let reachable =
                reachable_cells(state.topology, &state.map, &occupied, position, budget);
            state.focus = Focus::Moving(TurnMovement {
                start: position,
                start_facing: facing,
                current: position,
                facing,
                budget,
                spent: 0,
                path: Vec::new(),
                reachable,
            });
        }
    }

    let name = state.display_name(actor).to_string();
    state.push_log(format!("{name} takes a {maneuver:?} maneuver"));
    Ok(Vec::new())
}

fn move_step(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    actor: Uuid,
    to: Cell,
) -> Result<Vec<OutEvent>, ActionError> {
    require_gurps(state)?;
    require_turn(state, actor)?;

    let occupied = state.occupied_cells(actor);
    let topology = state.topology;
    let Focus::Moving(tm) = &mut state.focus else {
        return Err(ActionError::NotMoving);
    };
    let cost = step_cost(topology, &state.map, &occupied, tm.current, to)
        .ok_or(ActionError::IllegalStep)?;
    if tm.spent + cost > tm.budget {
        return Err(ActionError::IllegalStep);
    }
    tm.facing = topology.direction_towards(tm.current, to);
    tm.current = to;
    tm.spent += cost;
    tm.path.push(to);

    // Stepping into a waiting enemy's reach can trigger their interrupt.
    Ok(trigger_waits(state, roller, actor, to, false))
}

fn rotate(state: &mut MatchState, actor: Uuid, clockwise: bool) -> Result<Vec<OutEvent>, ActionError> {
    require_gurps(state)?;
    require_turn(state, actor)?;
    let n = state.topology.direction_count() as i16;
    let Focus::Moving(tm) = &mut state.focus else {
        return Err(ActionError::NotMoving);
    };
    let delta: i16 = if clockwise { 1 } else { -1 };
    tm.facing = ((tm.facing as i16 + delta).rem_euclid(n)) as u8;
    Ok(Vec::new())
}

fn confirm_movement(state: &mut MatchState, actor: Uuid) -> Result<Vec<OutEvent>, ActionError> {
    require_gurps(state)?;
    require_turn(state, actor)?;
    if state.focus.movement().is_none() {
        return Err(ActionError::NotMoving);
    }
    commit_movement(state, actor)?;
    Ok(Vec::new())
}

fn undo_movement(state: &mut MatchState, actor: Uuid) -> Result<Vec<OutEvent>, ActionError> {
    require_gurps(state)?;
    require_turn(state, actor)?;
    let Focus::Moving(tm) = &mut state.focus else {
        return Err(ActionError::NotMoving);
    };
    tm.current = tm.start;
    tm.facing = tm.start_facing;
    tm.spent = 0;
    tm.path.clear();
    Ok(Vec::new())
}

fn skip_movement(state: &mut MatchState, actor: Uuid) -> Result<Vec<OutEvent>, ActionError> {
    require_gurps(state)?;
    require_turn(state, actor)?;
    let Focus::Moving(tm) = &mut state.focus else {
        return Err(ActionError::NotMoving);
    };
    tm.current = tm.start;
    tm.facing = tm.start_facing;
    tm.spent = 0;
    tm.path.clear();
    commit_movement(state, actor)?;
    Ok(Vec::new())
}

/// Write in-progress movement into the combatant and drop back to idle.
/// A no-op when no movement is in progress.
fn commit_movement(state: &mut MatchState, actor: Uuid) -> Result<(), ActionError> {
    let tm = match std::mem::replace(&mut state.focus, Focus::Idle) {
        Focus::Moving(tm) => tm,
        other => {
            state.focus = other;
            return Ok(());
        }
    };
    let moved = tm.current != tm.start;
    let (current, facing) = (tm.current, tm.facing);
    let c = state.combatant_mut(actor)?;
    c.position = current;
    c.facing = facing;
    if moved {
        let name = state.display_name(actor).to_string();
        state.push_log(format!(
            "{name} moves to ({}, {})",
            current.x, current.y
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// The attack/defense handshake
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn attack(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    actor: Uuid,
    target_id: Uuid,
    weapon_idx: usize,
    location: HitLocation,
    deceptive: u8,
    rapid_strike: bool,
) -> Result<Vec<OutEvent>, ActionError> {
    require_gurps(state)?;
    require_turn(state, actor)?;

    if target_id == actor {
        return Err(ActionError::InvalidTarget);
    }
    let target = state.combatant(target_id)?;
    if target.defeated {
        return Err(ActionError::InvalidTarget);
    }
    let target_pos = target.position;

    // An attack from mid-movement resolves from wherever the mover stands;
    // the pending steps are only locked in once the attack is legal.
    let pending_pos = match &state.focus {
        Focus::Moving(tm) => Some(tm.current),
        _ => None,
    };

    let c = state.combatant(actor)?;
    let g = c.rules.gurps().ok_or(ActionError::UnsupportedByRuleset)?;
    let sheet = c.sheet.gurps().ok_or(ActionError::UnsupportedByRuleset)?;
    let maneuver = g.maneuver.ok_or(ActionError::ManeuverRequired)?;
    if !maneuver.allows_attack() {
        return Err(ActionError::ManeuverForbidsAttack);
    }
    let weapon = sheet
        .weapons
        .get(weapon_idx)
        .ok_or(ActionError::UnknownWeapon)?
        .clone();
    if g.ready_weapon != Some(weapon_idx) {
        return Err(ActionError::WeaponNotReady);
    }

    let attack_pos = pending_pos.unwrap_or(c.position);
    let distance = state.topology.distance(attack_pos, target_pos);
    let in_close_combat = g.in_close_combat_with.is_some();
    if in_close_combat {
        if g.in_close_combat_with != Some(target_id) {
            return Err(ActionError::InvalidTarget);
        }
        if weapon.ranged {
            return Err(ActionError::OutOfRange);
        }
    } else if weapon.ranged {
        if distance > weapon.max_range as i32 {
            return Err(ActionError::OutOfRange);
        }
    } else if distance > (weapon.reach.max(1)) as i32 {
        return Err(ActionError::OutOfRange);
    }

    let mods = AttackModifiers {
        deceptive_levels: deceptive,
        rapid_strike,
        move_and_attack: maneuver == Maneuver::MoveAndAttack,
        all_out_determined: maneuver == Maneuver::AllOutAttackDetermined,
        aim_bonus: g
            .aim
            .filter(|a| a.target == target_id)
            .map(|a| a.turns.min(3) as i32)
            .unwrap_or(0),
        evaluate_bonus: g
            .evaluate
            .filter(|e| e.target == target_id)
            .map(|e| e.bonus)
            .unwrap_or(0),
        posture_penalty: posture_attack_penalty(c.posture),
        shock_penalty: g.shock_penalty,
        location_penalty: location_penalty(location),
        range_penalty: if weapon.ranged && !in_close_combat {
            range_penalty(distance)
        } else {
            0
        },
    };
    let eff = effective_skill(weapon.skill, &mods);
    if deceptive > 0 && eff < 10 {
        return Err(ActionError::DeceptiveLimit);
    }
    // The rapid-strike grant counts towards the budget before it is written.
    let grants_rapid_strike = rapid_strike && !g.rapid_strike_granted;
    if g.attacks_remaining == 0 && !grants_rapid_strike {
        return Err(ActionError::NoAttacksLeft);
    }

    // Every check has passed; lock in pending movement and the grant.
    commit_movement(state, actor)?;
    if grants_rapid_strike {
        let g = state
            .combatant_mut(actor)?
            .rules
            .gurps_mut()
            .ok_or(ActionError::UnsupportedByRuleset)?;
        g.rapid_strike_granted = true;
        g.attacks_remaining += 1;
    }

    let mut events = Vec::new();

    // A waiting enemy with an attack trigger strikes first.
    let actor_pos = state.combatant(actor)?.position;
    events.extend(trigger_waits(state, roller, actor, actor_pos, true));
    let c = state.combatant(actor)?;
    if c.defeated {
        return Ok(events);
    }

    let roll = roll_attack(eff, roller);
    let attacker_name = state.display_name(actor).to_string();
    let target_name = state.display_name(target_id).to_string();
    let weapon_name = weapon.name.clone();
    state.push_log(format!(
        "{attacker_name} attacks {target_name} with {weapon_name} \
         (skill {eff}, rolled {})",
        roll.roll
    ));

    match roll.outcome {
        AttackOutcome::CriticalMiss => {
            events.extend(resolve_critical_miss(state, roller, actor, weapon_idx)?);
            finish_attack(state, roller, actor);
        }
        AttackOutcome::Miss => {
            state.push_log(format!("{attacker_name} misses"));
            events.push(OutEvent::Effect {
                effect: EffectKind::Miss,
                actor,
                target: Some(target_id),
                cell: target_pos,
                magnitude: 0,
            });
            finish_attack(state, roller, actor);
        }
        AttackOutcome::CriticalHit => {
            let table = crate::rules::dice::roll_3d6(roller);
            let crit = critical_hit_table(table);
            state.push_log(format!(
                "{attacker_name} scores a critical hit ({crit:?})"
            ));
            events.extend(apply_attack_damage(
                state,
                roller,
                actor,
                target_id,
                weapon.damage,
                weapon.kind,
                location,
                Some(crit),
            )?);
            finish_attack(state, roller, actor);
        }
        AttackOutcome::Hit => {
            let target = state.combatant(target_id)?;
            let arc = facing_arc(state.topology, target.position, target.facing, actor_pos);
            let forfeits = target
                .rules
                .gurps()
                .and_then(|g| g.maneuver)
                .is_some_and(|m| m.forfeits_defense());
            let helpless = target.has_condition(Condition::Unconscious);

            if arc == FacingArc::Rear || forfeits || helpless {
                state.push_log(format!("{target_name} cannot defend"));
                events.extend(apply_attack_damage(
                    state,
                    roller,
                    actor,
                    target_id,
                    weapon.damage,
                    weapon.kind,
                    location,
                    None,
                )?);
                finish_attack(state, roller, actor);
            } else {
                state.focus = Focus::AwaitingDefense(PendingDefense {
                    attacker: actor,
                    defender: target_id,
                    weapon: weapon_idx,
                    attack_margin: roll.margin,
                    hit_location: location,
                    damage: weapon.damage,
                    damage_kind: weapon.kind,
                    deceptive_penalty: -(deceptive as i32),
                    arc,
                });
                if !state.is_bot(target_id) {
                    events.push(OutEvent::Prompt {
                        to: target_id,
                        prompt: PendingPrompt::DefenseRequired {
                            attacker: actor,
                            deadline_ms: DEFENSE_TIMEOUT.as_millis() as u64,
                        },
                    });
                }
            }
        }
    }

    Ok(events)
}

/// Resolve the defender's choice against the pending attack. Also the entry
/// point for timed-out and bot defenses.
pub fn resolve_defense(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    defender: Uuid,
    mut choice: DefenseOption,
) -> Result<Vec<OutEvent>, ActionError> {
    let pd = state
        .focus
        .pending_defense()
        .ok_or(ActionError::NoDefensePending)?
        .clone();
    if pd.defender != defender {
        return Err(ActionError::NotDefender);
    }

    let mut events = Vec::new();
    let defender_name = state.display_name(defender).to_string();

    if choice.kind == DefenseKind::None {
        state.push_log(format!("{defender_name} takes the hit"));
        state.focus = Focus::Idle;
        events.extend(apply_attack_damage(
            state,
            roller,
            pd.attacker,
            defender,
            pd.damage,
            pd.damage_kind,
            pd.hit_location,
            None,
        )?);
        finish_attack(state, roller, pd.attacker);
        return Ok(events);
    }

    // A retreat with nowhere to go is no retreat at all.
    let retreat_to = if choice.retreat {
        let cell = retreat_cell(state, defender, pd.attacker);
        if cell.is_none() {
            choice.retreat = false;
        }
        cell
    } else {
        None
    };

    let value = {
        let c = state.combatant(defender)?;
        let g = c.rules.gurps().ok_or(ActionError::UnsupportedByRuleset)?;
        let sheet = c.sheet.gurps().ok_or(ActionError::UnsupportedByRuleset)?;
        let q = DefenseQuery {
            sheet,
            state: g,
            base_dodge: c.derived.dodge,
            posture: c.posture,
            stunned: c.has_condition(Condition::Stunned),
            arc: pd.arc,
            deceptive_penalty: pd.deceptive_penalty,
        };
        defense_value(&q, &choice).ok_or(ActionError::IllegalDefense)?
    };

    let droll = roll_defense(value, roller);

    {
        let c = state.combatant_mut(defender)?;
        if choice.drop_prone {
            c.posture = Posture::Prone;
        }
        if let Some(cell) = retreat_to {
            c.position = cell;
        }
        let g = c
            .rules
            .gurps_mut()
            .ok_or(ActionError::UnsupportedByRuleset)?;
        g.defenses_this_turn += 1;
        if choice.retreat {
            g.retreated_this_turn = true;
        }
        match choice.kind {
            DefenseKind::Parry => {
                if let Some(idx) = choice.weapon {
                    *g.parries_by_weapon.entry(idx).or_insert(0) += 1;
                }
            }
            DefenseKind::Block => g.blocked_this_turn = true,
            _ => {}
        }
    }

    state.focus = Focus::Idle;

    if droll.success {
        state.push_log(format!(
            "{defender_name} defends with {:?} ({} vs {})",
            choice.kind, droll.roll, droll.value
        ));
        let cell = state.combatant(defender)?.position;
        events.push(OutEvent::Effect {
            effect: EffectKind::Defend,
            actor: defender,
            target: Some(pd.attacker),
            cell,
            magnitude: 0,
        });
    } else {
        state.push_log(format!(
            "{defender_name} fails to defend ({} vs {})",
            droll.roll, droll.value
        ));
        events.extend(apply_attack_damage(
            state,
            roller,
            pd.attacker,
            defender,
            pd.damage,
            pd.damage_kind,
            pd.hit_location,
            None,
        )?);
    }

    finish_attack(state, roller, pd.attacker);
    Ok(events)
}

/// One attack fully resolved: spend it, and hand the turn off when the
/// budget is empty. Shared by the immediate and handshake paths so each
/// attack is counted exactly once.
fn finish_attack(state: &mut MatchState, roller: &mut dyn Roller, attacker: Uuid) {
    let remaining = match state
        .combatants
        .get_mut(&attacker)
        .and_then(|c| c.rules.gurps_mut())
    {
        Some(g) => {
            g.attacks_remaining = g.attacks_remaining.saturating_sub(1);
            g.attacks_remaining
        }
        None => 0,
    };
    // The victory check at commit ends the match; do not rotate past it.
    if state.standing_count() <= 1 {
        return;
    }
    if remaining == 0 && state.active_turn == attacker {
        state.advance_turn(roller);
    }
}

/// Pick the cell directly away from the attacker, falling back to the two
/// adjacent back directions.
fn retreat_cell(state: &MatchState, defender: Uuid, attacker: Uuid) -> Option<Cell> {
    let def = state.combatants.get(&defender)?;
    let atk = state.combatants.get(&attacker)?;
    let n = state.topology.direction_count();
    let towards = state.topology.direction_towards(def.position, atk.position);
    let away = (towards + n / 2) % n;
    let occupied = state.occupied_cells(defender);
    for delta in [0i16, 1, -1] {
        let dir = ((away as i16 + delta).rem_euclid(n as i16)) as u8;
        let cell = state.topology.step(def.position, dir);
        if state.map.entry_cost(cell).is_some() && !occupied.contains(&cell) {
            return Some(cell);
        }
    }
    None
}

fn resolve_critical_miss(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    actor: Uuid,
    weapon_idx: usize,
) -> Result<Vec<OutEvent>, ActionError> {
    let table = crate::rules::dice::roll_3d6(roller);
    let effect = critical_miss_table(table);
    let name = state.display_name(actor).to_string();
    match effect {
        CritMissEffect::Nothing => {
            state.push_log(format!("{name} fumbles harmlessly"));
            Ok(Vec::new())
        }
        CritMissEffect::DropWeapon => {
            state.push_log(format!("{name} drops their weapon"));
            if let Some(g) = state.combatant_mut(actor)?.rules.gurps_mut() {
                g.ready_weapon = None;
            }
            Ok(Vec::new())
        }
        CritMissEffect::HitSelf => {
            state.push_log(format!("{name} hits themselves"));
            let (damage, kind) = {
                let sheet = state
                    .combatant(actor)?
                    .sheet
                    .gurps()
                    .ok_or(ActionError::UnsupportedByRuleset)?;
                let w = sheet
                    .weapons
                    .get(weapon_idx)
                    .ok_or(ActionError::UnknownWeapon)?;
                (w.damage, w.kind)
            };
            apply_attack_damage(
                state,
                roller,
                actor,
                actor,
                damage,
                kind,
                HitLocation::Torso,
                None,
            )
        }
        CritMissEffect::LoseBalance => {
            state.push_log(format!("{name} loses their balance"));
            state.combatant_mut(actor)?.posture = Posture::Kneeling;
            Ok(Vec::new())
        }
    }
}

/// Roll damage, subtract DR, apply wounding and its knock-on effects.
#[allow(clippy::too_many_arguments)]
fn apply_attack_damage(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    attacker: Uuid,
    defender: Uuid,
    damage: DamageFormula,
    kind: DamageKind,
    location: HitLocation,
    crit: Option<CritHitEffect>,
) -> Result<Vec<OutEvent>, ActionError> {
    let rolled = match crit {
        Some(CritHitEffect::MaxDamage) => damage.max_roll(),
        Some(CritHitEffect::DoubleDamage) => damage.roll(roller) * 2,
        _ => damage.roll(roller),
    };
    let (dr, ht, max_hp, hp_before, pos) = {
        let c = state.combatant(defender)?;
        let sheet = c.sheet.gurps().ok_or(ActionError::UnsupportedByRuleset)?;
        let dr = if crit == Some(CritHitEffect::BypassArmor) {
            0
        } else {
            sheet.armor_dr
        };
        (dr, sheet.ht, c.derived.max_hp, c.current_hp, c.position)
    };

    let result = compute_damage(rolled, dr, kind, location, max_hp);
    let defender_name = state.display_name(defender).to_string();
    state.push_log(format!(
        "{defender_name} takes {} injury ({rolled} rolled, {dr} DR, {location:?})",
        result.injury
    ));

    {
        let c = state.combatant_mut(defender)?;
        c.current_hp = apply_injury(hp_before, result.injury);
        if let Some(g) = c.rules.gurps_mut() {
            g.shock_penalty = (g.shock_penalty + result.shock).max(-4);
        }
    }

    let events = vec![OutEvent::Effect {
        effect: EffectKind::Damage,
        actor: attacker,
        target: Some(defender),
        cell: pos,
        magnitude: result.injury,
    }];

    let now_at_zero = state.combatant(defender)?.current_hp == 0;
    let already_out = state.combatant(defender)?.defeated;
    if result.injury > 0 && now_at_zero && !already_out {
        if consciousness_check(ht, hp_before, result.injury, max_hp, roller) {
            state.push_log(format!("{defender_name} stays on their feet"));
        } else {
            state.push_log(format!("{defender_name} falls unconscious"));
            let c = state.combatant_mut(defender)?;
            c.add_condition(Condition::Unconscious);
            c.posture = Posture::Prone;
            c.defeated = true;
            release_grapples(state, defender);
        }
    } else if result.major_wound && !already_out && !major_wound_check(ht, roller) {
        state.push_log(format!("{defender_name} is stunned by a major wound"));
        state
            .combatant_mut(defender)?
            .add_condition(Condition::Stunned);
    }

    Ok(events)
}

/// An incapacitated combatant releases every hold and is released in turn.
fn release_grapples(state: &mut MatchState, user_id: Uuid) {
    let others: Vec<Uuid> = state
        .combatants
        .keys()
        .copied()
        .filter(|id| *id != user_id)
        .collect();
    if let Some(c) = state.combatants.get_mut(&user_id) {
        if let Some(g) = c.rules.gurps_mut() {
            g.control_points.clear();
            g.in_close_combat_with = None;
        }
        c.remove_condition(Condition::Grappled);
    }
    for id in others {
        if let Some(c) = state.combatants.get_mut(&id) {
            if let Some(g) = c.rules.gurps_mut() {
                g.control_points.remove(&user_id);
                if g.in_close_combat_with == Some(user_id) {
                    g.in_close_combat_with = None;
                }
            }
        }
        // Whoever was held only by the downed combatant is free now.
        let still_held = state.combatants.values().any(|h| {
            h.rules
                .gurps()
                .is_some_and(|g| g.control_points.get(&id).copied().unwrap_or(0) > 0)
        });
        if !still_held {
            if let Some(c) = state.combatants.get_mut(&id) {
                c.remove_condition(Condition::Grappled);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Wait-maneuver interrupts
// ---------------------------------------------------------------------------

/// Enemies holding a Wait whose trigger just fired make one interrupt
/// attack, resolved synchronously with the mover's best defense.
fn trigger_waits(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    mover: Uuid,
    mover_pos: Cell,
    attacking: bool,
) -> Vec<OutEvent> {
    let wanted = if attacking {
        WaitTrigger::EnemyAttacks
    } else {
        WaitTrigger::EnemyApproaches
    };
    let waiters: Vec<Uuid> = state
        .combatants
        .values()
        .filter(|c| {
            c.user_id != mover
                && !c.defeated
                && c.rules.gurps().is_some_and(|g| g.wait_trigger == Some(wanted))
                && state.topology.distance(c.position, mover_pos) <= 1
        })
        .map(|c| c.user_id)
        .collect();

    let mut events = Vec::new();
    for w in waiters {
        if let Some(g) = state.combatants.get_mut(&w).and_then(|c| c.rules.gurps_mut()) {
            g.wait_trigger = None;
        }
        let name = state.display_name(w).to_string();
        state.push_log(format!("{name}'s wait triggers"));
        if let Ok(mut ev) = interrupt_attack(state, roller, w, mover) {
            events.append(&mut ev);
        }
        if state.combatants.get(&mover).is_none_or(|c| c.defeated) {
            break;
        }
    }
    events
}

/// A single out-of-turn attack with no budget and no handshake; the target
/// gets their best available defense automatically.
fn interrupt_attack(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    attacker: Uuid,
    target: Uuid,
) -> Result<Vec<OutEvent>, ActionError> {
    let (weapon, eff, attacker_pos) = {
        let c = state.combatant(attacker)?;
        let g = c.rules.gurps().ok_or(ActionError::UnsupportedByRuleset)?;
        let sheet = c.sheet.gurps().ok_or(ActionError::UnsupportedByRuleset)?;
        let Some(idx) = g.ready_weapon else {
            return Ok(Vec::new());
        };
        let weapon = sheet
            .weapons
            .get(idx)
            .ok_or(ActionError::UnknownWeapon)?
            .clone();
        let eff = weapon.skill + posture_attack_penalty(c.posture) + g.shock_penalty;
        (weapon, eff, c.position)
    };

    let roll = roll_attack(eff, roller);
    if !matches!(roll.outcome, AttackOutcome::Hit | AttackOutcome::CriticalHit) {
        let name = state.display_name(attacker).to_string();
        state.push_log(format!("{name}'s interrupt misses"));
        return Ok(Vec::new());
    }

    let defended = {
        let t = state.combatant(target)?;
        let arc = facing_arc(state.topology, t.position, t.facing, attacker_pos);
        let best = t
            .rules
            .gurps()
            .zip(t.sheet.gurps())
            .and_then(|(g, sheet)| {
                best_defense(&DefenseQuery {
                    sheet,
                    state: g,
                    base_dodge: t.derived.dodge,
                    posture: t.posture,
                    stunned: t.has_condition(Condition::Stunned),
                    arc,
                    deceptive_penalty: 0,
                })
            });
        match best {
            Some((_, value)) if roll.outcome == AttackOutcome::Hit => {
                roll_defense(value, roller).success
            }
            _ => false,
        }
    };

    if defended {
        let name = state.display_name(target).to_string();
        state.push_log(format!("{name} defends against the interrupt"));
        return Ok(Vec::new());
    }

    apply_attack_damage(
        state,
        roller,
        attacker,
        target,
        weapon.damage,
        weapon.kind,
        HitLocation::Torso,
        None,
    )
}

// ---------------------------------------------------------------------------
// Ready, close combat, grappling
// ---------------------------------------------------------------------------

fn ready_action(
    state: &mut MatchState,
    actor: Uuid,
    action: ReadyKind,
    weapon: Option<usize>,
) -> Result<Vec<OutEvent>, ActionError> {
    require_gurps(state)?;
    require_turn(state, actor)?;

    let c = state.combatant(actor)?;
    let g = c.rules.gurps().ok_or(ActionError::UnsupportedByRuleset)?;
    if g.maneuver != Some(Maneuver::Ready) {
        return Err(ActionError::ManeuverRequired);
    }
    let weapon_count = c
        .sheet
        .gurps()
        .map(|s| s.weapons.len())
        .unwrap_or(0);

    let name = state.display_name(actor).to_string();
    match action {
        ReadyKind::Draw => {
            let idx = weapon.ok_or(ActionError::UnknownWeapon)?;
            if idx >= weapon_count {
                return Err(ActionError::UnknownWeapon);
            }
            if let Some(g) = state.combatant_mut(actor)?.rules.gurps_mut() {
                g.ready_weapon = Some(idx);
            }
            state.push_log(format!("{name} readies a weapon"));
        }
        ReadyKind::Sheathe => {
            if let Some(g) = state.combatant_mut(actor)?.rules.gurps_mut() {
                g.ready_weapon = None;
            }
            state.push_log(format!("{name} sheathes their weapon"));
        }
        ReadyKind::Reload | ReadyKind::Prepare | ReadyKind::Pickup => {
            state.push_log(format!("{name} spends the turn readying equipment"));
        }
    }
    Ok(Vec::new())
}

fn enter_close_combat(
    state: &mut MatchState,
    actor: Uuid,
    target_id: Uuid,
) -> Result<Vec<OutEvent>, ActionError> {
    require_gurps(state)?;
    require_turn(state, actor)?;

    if target_id == actor {
        return Err(ActionError::InvalidTarget);
    }
    let target = state.combatant(target_id)?;
    if target.defeated {
        return Err(ActionError::InvalidTarget);
    }
    let target_pos = target.position;

    let pending_pos = match &state.focus {
        Focus::Moving(tm) => Some(tm.current),
        _ => None,
    };

    let c = state.combatant(actor)?;
    let g = c.rules.gurps().ok_or(ActionError::UnsupportedByRuleset)?;
    let maneuver = g.maneuver.ok_or(ActionError::ManeuverRequired)?;
    if maneuver != Maneuver::Move && !maneuver.allows_attack() {
        return Err(ActionError::ManeuverForbidsAttack);
    }
    if g.in_close_combat_with.is_some() {
        return Err(ActionError::AlreadyInCloseCombat);
    }
    let pos = pending_pos.unwrap_or(c.position);
    if state.topology.distance(pos, target_pos) != 1 {
        return Err(ActionError::OutOfRange);
    }

    commit_movement(state, actor)?;
    if let Some(g) = state.combatants.get_mut(&actor).and_then(|c| c.rules.gurps_mut()) {
        g.in_close_combat_with = Some(target_id);
    }
    if let Some(g) = state
        .combatants
        .get_mut(&target_id)
        .and_then(|c| c.rules.gurps_mut())
    {
        g.in_close_combat_with = Some(actor);
    }

    let name = state.display_name(actor).to_string();
    let target_name = state.display_name(target_id).to_string();
    state.push_log(format!("{name} closes into close combat with {target_name}"));
    Ok(vec![OutEvent::Effect {
        effect: EffectKind::CloseCombat,
        actor,
        target: Some(target_id),
        cell: pos,
        magnitude: 0,
    }])
}

fn exit_close_combat(state: &mut MatchState, actor: Uuid) -> Result<Vec<OutEvent>, ActionError> {
    require_gurps(state)?;
    require_turn(state, actor)?;

    let c = state.combatant(actor)?;
    let g = c.rules.gurps().ok_or(ActionError::UnsupportedByRuleset)?;
    let partner = g.in_close_combat_with.ok_or(ActionError::NotInCloseCombat)?;

    // Can't walk away while held.
    let held = state
        .combatants
        .get(&partner)
        .and_then(|p| p.rules.gurps())
        .and_then(|g| g.control_points.get(&actor))
        .copied()
        .unwrap_or(0);
    if held > 0 {
        return Err(ActionError::HeldInGrapple);
    }

    let partner_out = state.combatants.get(&partner).is_none_or(|p| p.defeated);
    if partner_out {
        // Nobody to object.
        return resolve_exit(state, actor, partner, false);
    }

    state.focus = Focus::AwaitingReaction(PendingReaction {
        reactor: partner,
        provoker: actor,
        kind: ReactionKind::CloseCombatExit,
    });
    let mut events = Vec::new();
    if !state.is_bot(partner) {
        events.push(OutEvent::Prompt {
            to: partner,
            prompt: PendingPrompt::OpponentExitingCloseCombat { leaver: actor },
        });
    }
    Ok(events)
}

/// Close the exit window: the leaver steps out; the partner follows or
/// lets go. Also the entry point for timed-out and bot responses.
pub fn resolve_close_combat_exit(
    state: &mut MatchState,
    _roller: &mut dyn Roller,
    follow: bool,
) -> Result<Vec<OutEvent>, ActionError> {
    let pr = state
        .focus
        .pending_reaction()
        .ok_or(ActionError::NoReactionPending)?
        .clone();
    if pr.kind != ReactionKind::CloseCombatExit {
        return Err(ActionError::NoReactionPending);
    }
    state.focus = Focus::Idle;
    resolve_exit(state, pr.provoker, pr.reactor, follow)
}

fn resolve_exit(
    state: &mut MatchState,
    leaver: Uuid,
    partner: Uuid,
    follow: bool,
) -> Result<Vec<OutEvent>, ActionError> {
    let old_pos = state.combatant(leaver)?.position;
    if let Some(cell) = retreat_cell(state, leaver, partner) {
        state.combatant_mut(leaver)?.position = cell;
    }

    let leaver_name = state.display_name(leaver).to_string();
    let partner_name = state.display_name(partner).to_string();

    if follow {
        // The partner pursues into the vacated hex; the clinch holds.
        if let Some(p) = state.combatants.get_mut(&partner) {
            if !p.defeated {
                p.position = old_pos;
            }
        }
        state.push_log(format!(
            "{leaver_name} pulls back but {partner_name} follows"
        ));
    } else {
        for id in [leaver, partner] {
            if let Some(c) = state.combatants.get_mut(&id) {
                if let Some(g) = c.rules.gurps_mut() {
                    g.in_close_combat_with = None;
                    g.control_points.remove(&leaver);
                    g.control_points.remove(&partner);
                }
                c.remove_condition(Condition::Grappled);
            }
        }
        state.push_log(format!("{leaver_name} breaks away from {partner_name}"));
    }
    Ok(Vec::new())
}

fn grapple(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    actor: Uuid,
) -> Result<Vec<OutEvent>, ActionError> {
    require_gurps(state)?;
    require_turn(state, actor)?;

    let (target_id, pos) = {
        let c = state.combatant(actor)?;
        let g = c.rules.gurps().ok_or(ActionError::UnsupportedByRuleset)?;
        let maneuver = g.maneuver.ok_or(ActionError::ManeuverRequired)?;
        if !maneuver.allows_attack() {
            return Err(ActionError::ManeuverForbidsAttack);
        }
        if g.attacks_remaining == 0 {
            return Err(ActionError::NoAttacksLeft);
        }
        let target = g.in_close_combat_with.ok_or(ActionError::NotInCloseCombat)?;
        (target, c.position)
    };
    commit_movement(state, actor)?;

    let sheet = state
        .combatant(actor)?
        .sheet
        .gurps()
        .ok_or(ActionError::UnsupportedByRuleset)?
        .clone();
    let res = roll_grapple(&sheet, roller);
    let name = state.display_name(actor).to_string();
    let target_name = state.display_name(target_id).to_string();

    let mut events = Vec::new();
    if !res.success {
        state.push_log(format!("{name} fails to grab {target_name}"));
    } else {
        // The target twists away with a quick dodge.
        let dodge_value = {
            let t = state.combatant(target_id)?;
            t.derived.dodge
                + posture_defense_penalty(t.posture)
                + if t.has_condition(Condition::Stunned) { -4 } else { 0 }
        };
        let dodge = roll_defense(dodge_value, roller);
        if dodge.success {
            state.push_log(format!("{target_name} twists out of the grab"));
        } else {
            let cp = res.control_points;
            if let Some(g) = state.combatants.get_mut(&actor).and_then(|c| c.rules.gurps_mut()) {
                *g.control_points.entry(target_id).or_insert(0) += cp;
            }
            state
                .combatant_mut(target_id)?
                .add_condition(Condition::Grappled);
            state.push_log(format!(
                "{name} grapples {target_name} ({cp} control points)"
            ));
            events.push(OutEvent::Effect {
                effect: EffectKind::Grapple,
                actor,
                target: Some(target_id),
                cell: pos,
                magnitude: cp,
            });
        }
    }

    finish_attack(state, roller, actor);
    Ok(events)
}

fn break_free(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    actor: Uuid,
) -> Result<Vec<OutEvent>, ActionError> {
    require_gurps(state)?;
    require_turn(state, actor)?;

    {
        let c = state.combatant(actor)?;
        let g = c.rules.gurps().ok_or(ActionError::UnsupportedByRuleset)?;
        let maneuver = g.maneuver.ok_or(ActionError::ManeuverRequired)?;
        if !maneuver.allows_attack() {
            return Err(ActionError::ManeuverForbidsAttack);
        }
        if g.attacks_remaining == 0 {
            return Err(ActionError::NoAttacksLeft);
        }
    }

    // Whoever holds the most points on us is the one we wrestle against.
    let holder = state
        .combatants
        .values()
        .filter_map(|c| {
            let cp = c.rules.gurps()?.control_points.get(&actor).copied()?;
            (cp > 0).then_some((c.user_id, cp))
        })
        .max_by_key(|(_, cp)| *cp);
    let Some((holder_id, held)) = holder else {
        return Err(ActionError::NotInCloseCombat);
    };

    let escaper_st = state
        .combatant(actor)?
        .sheet
        .gurps()
        .ok_or(ActionError::UnsupportedByRuleset)?
        .st;
    let holder_st = state
        .combatant(holder_id)?
        .sheet
        .gurps()
        .ok_or(ActionError::UnsupportedByRuleset)?
        .st;

    let res = roll_break_free(escaper_st, holder_st, held, roller);
    let name = state.display_name(actor).to_string();
    let holder_name = state.display_name(holder_id).to_string();

    if res.points_removed > 0 {
        if let Some(g) = state
            .combatants
            .get_mut(&holder_id)
            .and_then(|c| c.rules.gurps_mut())
        {
            let entry = g.control_points.entry(actor).or_insert(0);
            *entry -= res.points_removed;
            if *entry <= 0 {
                g.control_points.remove(&actor);
            }
        }
    }
    if res.free {
        state.combatant_mut(actor)?.remove_condition(Condition::Grappled);
        state.push_log(format!("{name} breaks free of {holder_name}"));
    } else if res.points_removed > 0 {
        state.push_log(format!(
            "{name} loosens {holder_name}'s hold ({} points)",
            res.points_removed
        ));
    } else {
        state.push_log(format!("{name} struggles in vain against {holder_name}"));
    }

    finish_attack(state, roller, actor);
    Ok(Vec::new())
}

// ---------------------------------------------------------------------------
// Aim, Evaluate, Wait, posture, turn end, surrender
// ---------------------------------------------------------------------------

fn aim_target(state: &mut MatchState, actor: Uuid, target_id: Uuid) -> Result<Vec<OutEvent>, ActionError> {
    require_gurps(state)?;
    require_turn(state, actor)?;
    if state.combatants.get(&target_id).is_none_or(|t| t.defeated) {
        return Err(ActionError::InvalidTarget);
    }
    let c = state.combatant(actor)?;
    let g = c.rules.gurps().ok_or(ActionError::UnsupportedByRuleset)?;
    if g.maneuver != Some(Maneuver::Aim) {
        return Err(ActionError::ManeuverRequired);
    }
    let turns = match g.aim {
        Some(a) if a.target == target_id => a.turns + 1,
        _ => 1,
    };
    if let Some(g) = state.combatant_mut(actor)?.rules.gurps_mut() {
        g.aim = Some(AimState {
            target: target_id,
            turns,
        });
    }
    Ok(Vec::new())
}

fn evaluate_target(
    state: &mut MatchState,
    actor: Uuid,
    target_id: Uuid,
) -> Result<Vec<OutEvent>, ActionError> {
    require_gurps(state)?;
    require_turn(state, actor)?;
    if state.combatants.get(&target_id).is_none_or(|t| t.defeated) {
        return Err(ActionError::InvalidTarget);
    }
    let c = state.combatant(actor)?;
    let g = c.rules.gurps().ok_or(ActionError::UnsupportedByRuleset)?;
    if g.maneuver != Some(Maneuver::Evaluate) {
        return Err(ActionError::ManeuverRequired);
    }
    let bonus = match g.evaluate {
        Some(e) if e.target == target_id => (e.bonus + 1).min(3),
        _ => 1,
    };
    if let Some(g) = state.combatant_mut(actor)?.rules.gurps_mut() {
        g.evaluate = Some(EvaluateState {
            target: target_id,
            bonus,
        });
    }
    Ok(Vec::new())
}

fn set_wait_trigger(
    state: &mut MatchState,
    actor: Uuid,
    trigger: WaitTrigger,
) -> Result<Vec<OutEvent>, ActionError> {
    require_gurps(state)?;
    require_turn(state, actor)?;
    let c = state.combatant(actor)?;
    let g = c.rules.gurps().ok_or(ActionError::UnsupportedByRuleset)?;
    if g.maneuver != Some(Maneuver::Wait) {
        return Err(ActionError::ManeuverRequired);
    }
    if let Some(g) = state.combatant_mut(actor)?.rules.gurps_mut() {
        g.wait_trigger = Some(trigger);
    }
    Ok(Vec::new())
}

fn change_posture(
    state: &mut MatchState,
    actor: Uuid,
    posture: Posture,
) -> Result<Vec<OutEvent>, ActionError> {
    require_gurps(state)?;
    require_turn(state, actor)?;
    let c = state.combatant(actor)?;
    let g = c.rules.gurps().ok_or(ActionError::UnsupportedByRuleset)?;
    if g.maneuver != Some(Maneuver::ChangePosture) {
        return Err(ActionError::ManeuverRequired);
    }
    commit_movement(state, actor)?;
    state.combatant_mut(actor)?.posture = posture;
    let name = state.display_name(actor).to_string();
    state.push_log(format!("{name} changes posture to {posture:?}"));
    Ok(Vec::new())
}

fn end_turn(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    actor: Uuid,
) -> Result<Vec<OutEvent>, ActionError> {
    require_turn(state, actor)?;
    if state.ruleset == RulesetId::Gurps {
        commit_movement(state, actor)?;
    }
    state.advance_turn(roller);
    Ok(Vec::new())
}

fn surrender(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    actor: Uuid,
) -> Result<Vec<OutEvent>, ActionError> {
    let c = state.combatant_mut(actor)?;
    if c.defeated {
        return Err(ActionError::Incapacitated);
    }
    c.add_condition(Condition::Surrendered);
    c.defeated = true;
    release_grapples(state, actor);

    let name = state.display_name(actor).to_string();
    state.push_log(format!("{name} surrenders"));

    // A pending window involving the quitter can never resolve; drop it.
    let clear = match &state.focus {
        Focus::AwaitingDefense(pd) => pd.attacker == actor || pd.defender == actor,
        Focus::AwaitingReaction(pr) => pr.reactor == actor || pr.provoker == actor,
        _ => false,
    };
    if clear {
        state.focus = Focus::Idle;
    }
    if state.active_turn == actor && state.standing_count() > 1 {
        state.advance_turn(roller);
    }
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::r#match::duel;
    use crate::rules::dice::SequenceRoller;

    const A: Uuid = Uuid::from_u128(1);
    const B: Uuid = Uuid::from_u128(2);

    fn msg_attack(target: Uuid) -> ClientMsg {
        ClientMsg::Attack {
            target_id: target,
            weapon: 0,
            hit_location: None,
            deceptive: 0,
            rapid_strike: false,
        }
    }

    fn msg_defend(kind: DefenseKind, retreat: bool) -> ClientMsg {
        ClientMsg::Defend {
            defense: kind,
            weapon: None,
            retreat,
            drop_prone: false,
        }
    }

    fn select(state: &mut MatchState, actor: Uuid, m: Maneuver) {
        let mut roller = SequenceRoller::new(&[]);
        dispatch(
            state,
            &mut roller,
            actor,
            &ClientMsg::SelectManeuver { maneuver: m },
        )
        .expect("select maneuver");
    }

    #[test]
    fn attack_opens_a_defense_window_and_locks_others_out() {
        let mut state = duel(RulesetId::Gurps);
        select(&mut state, A, Maneuver::Attack);

        // Skill 14, rolled 10: a hit by 4.
        let mut roller = SequenceRoller::new(&[4, 4, 2]);
        let events = dispatch(&mut state, &mut roller, A, &msg_attack(B)).expect("attack");
        assert!(state.focus.pending_defense().is_some());
        assert!(events
            .iter()
            .any(|e| matches!(e, OutEvent::Prompt { to, .. } if *to == B)));

        // Nobody else may act while the window is open.
        let err = dispatch2(&mut state, A, &ClientMsg::EndTurn).unwrap_err();
        assert_eq!(err, ActionError::DefensePending);
    }

    /// Dispatch for intents that never touch the dice.
    fn dispatch2(
        state: &mut MatchState,
        actor: Uuid,
        msg: &ClientMsg,
    ) -> Result<Vec<OutEvent>, ActionError> {
        let mut roller = SequenceRoller::new(&[]);
        dispatch(state, &mut roller, actor, msg)
    }

    #[test]
    fn successful_dodge_negates_the_hit_and_spends_the_attack() {
        let mut state = duel(RulesetId::Gurps);
        select(&mut state, A, Maneuver::Attack);

        let mut roller = SequenceRoller::new(&[4, 4, 2]);
        dispatch(&mut state, &mut roller, A, &msg_attack(B)).expect("attack");

        // Dodge 8 + shield DB 2 = 10; rolled 9 succeeds.
        let mut roller = SequenceRoller::new(&[3, 3, 3]);
        dispatch(&mut state, &mut roller, B, &msg_defend(DefenseKind::Dodge, false))
            .expect("defend");

        assert_eq!(state.combatants[&B].current_hp, 12);
        assert!(matches!(state.focus, Focus::Idle));
        // The single attack is spent; the turn rotated to the defender.
        assert_eq!(state.active_turn, B);
    }

    #[test]
    fn failed_defense_applies_dr_and_wounding() {
        let mut state = duel(RulesetId::Gurps);
        select(&mut state, A, Maneuver::Attack);

        let mut roller = SequenceRoller::new(&[4, 4, 2]);
        dispatch(&mut state, &mut roller, A, &msg_attack(B)).expect("attack");

        // 17 always fails; then 1d6+2 damage with a 4: 6 rolled, DR 3,
        // cutting x1.5 on the remainder = 4 injury.
        let mut roller = SequenceRoller::new(&[6, 6, 5, 4]);
        dispatch(&mut state, &mut roller, B, &msg_defend(DefenseKind::Dodge, false))
            .expect("defend");

        assert_eq!(state.combatants[&B].current_hp, 8);
        assert_eq!(
            state.combatants[&B].rules.gurps().unwrap().shock_penalty,
            -4
        );
    }

    #[test]
    fn rear_arc_attack_skips_the_handshake() {
        let mut state = duel(RulesetId::Gurps);
        // Turn the defender around so the attack comes from behind.
        let n = state.topology.direction_count();
        {
            let c = state.combatants.get_mut(&B).unwrap();
            c.facing = (c.facing + n / 2) % n;
        }
        select(&mut state, A, Maneuver::Attack);

        // Hit, then damage die 4: same arithmetic as the failed defense.
        let mut roller = SequenceRoller::new(&[4, 4, 2, 4]);
        dispatch(&mut state, &mut roller, A, &msg_attack(B)).expect("attack");

        assert!(state.focus.pending_defense().is_none());
        assert_eq!(state.combatants[&B].current_hp, 8);
        assert_eq!(state.active_turn, B);
    }

    #[test]
    fn a_lethal_hit_finishes_the_match_with_a_winner() {
        let mut state = duel(RulesetId::Gurps);
        let n = state.topology.direction_count();
        {
            let c = state.combatants.get_mut(&B).unwrap();
            // Attack from behind so the hit lands without a defense window,
            // and leave the defender exactly one wound from zero.
            c.facing = (c.facing + n / 2) % n;
            c.current_hp = 4;
        }
        select(&mut state, A, Maneuver::Attack);

        // Hit, damage die 4 for 4 injury, then a consciousness roll of 18
        // that cannot succeed.
        let mut roller = SequenceRoller::new(&[4, 4, 2, 4, 6, 6, 6]);
        dispatch(&mut state, &mut roller, A, &msg_attack(B)).expect("attack");

        assert_eq!(state.combatants[&B].current_hp, 0);
        assert!(state.combatants[&B].defeated);
        assert!(state.combatants[&B].has_condition(Condition::Unconscious));

        // The match task runs this check on every commit.
        assert!(state.check_victory());
        assert_eq!(state.phase, MatchPhase::Finished);
        assert_eq!(state.winner, Some(A));
    }

    #[test]
    fn all_out_attack_forfeits_the_defense() {
        let mut state = duel(RulesetId::Gurps);
        // The defender committed to an All-Out Attack last turn.
        state
            .combatants
            .get_mut(&B)
            .unwrap()
            .rules
            .gurps_mut()
            .unwrap()
            .maneuver = Some(Maneuver::AllOutAttackDouble);
        select(&mut state, A, Maneuver::Attack);

        let mut roller = SequenceRoller::new(&[4, 4, 2, 4]);
        dispatch(&mut state, &mut roller, A, &msg_attack(B)).expect("attack");
        assert!(state.focus.pending_defense().is_none());
        assert_eq!(state.combatants[&B].current_hp, 8);
    }

    #[test]
    fn critical_hit_resolves_immediately_with_table_effect() {
        let mut state = duel(RulesetId::Gurps);
        select(&mut state, A, Maneuver::Attack);

        // 3 to hit (critical), 3 on the table (double damage), 3 on the
        // damage die: (3+2)*2 = 10, DR 3, cutting: 10 injury. Major wound:
        // HT roll 18 fails, stunning the defender.
        let mut roller = SequenceRoller::new(&[1, 1, 1, 1, 1, 1, 3, 6, 6, 6]);
        dispatch(&mut state, &mut roller, A, &msg_attack(B)).expect("attack");

        assert!(state.focus.pending_defense().is_none());
        assert_eq!(state.combatants[&B].current_hp, 2);
        assert!(state.combatants[&B].has_condition(Condition::Stunned));
    }

    #[test]
    fn all_out_double_grants_two_attacks_before_the_turn_ends() {
        let mut state = duel(RulesetId::Gurps);
        // Rear-facing defender keeps both resolutions synchronous.
        let n = state.topology.direction_count();
        {
            let c = state.combatants.get_mut(&B).unwrap();
            c.facing = (c.facing + n / 2) % n;
        }
        select(&mut state, A, Maneuver::AllOutAttackDouble);

        // Miss outright (16 vs 14).
        let mut roller = SequenceRoller::new(&[6, 6, 4]);
        dispatch(&mut state, &mut roller, A, &msg_attack(B)).expect("first attack");
        assert_eq!(state.active_turn, A);
        assert_eq!(state.log.last().unwrap(), "Kira misses");
        assert_eq!(state.combatants[&B].current_hp, 12);

        // Second attack hits for 1d6+2 = 6, minus DR 3, x1.5 = 4.
        let mut roller = SequenceRoller::new(&[4, 4, 2, 4]);
        dispatch(&mut state, &mut roller, A, &msg_attack(B)).expect("second attack");
        assert_eq!(state.combatants[&B].current_hp, 8);
        assert_eq!(state.active_turn, B);

        // No third attack.
        select(&mut state, B, Maneuver::Attack);
    }

    #[test]
    fn deceptive_attack_cannot_push_skill_below_ten() {
        let mut state = duel(RulesetId::Gurps);
        select(&mut state, A, Maneuver::Attack);
        let mut roller = SequenceRoller::new(&[]);
        let err = dispatch(
            &mut state,
            &mut roller,
            A,
            &ClientMsg::Attack {
                target_id: B,
                weapon: 0,
                hit_location: None,
                deceptive: 3,
                rapid_strike: false,
            },
        )
        .unwrap_err();
        assert_eq!(err, ActionError::DeceptiveLimit);
    }

    #[test]
    fn retreat_steps_the_defender_away() {
        let mut state = duel(RulesetId::Gurps);
        select(&mut state, A, Maneuver::Attack);

        let mut roller = SequenceRoller::new(&[4, 4, 2]);
        dispatch(&mut state, &mut roller, A, &msg_attack(B)).expect("attack");

        let before = state.combatants[&B].position;
        // Dodge 10 + retreat 3 = 13; a 12 succeeds.
        let mut roller = SequenceRoller::new(&[4, 4, 4]);
        dispatch(&mut state, &mut roller, B, &msg_defend(DefenseKind::Dodge, true))
            .expect("defend");

        let after = state.combatants[&B].position;
        assert_ne!(before, after);
        assert!(state.combatants[&B].rules.gurps().unwrap().retreated_this_turn);
        let a_pos = state.combatants[&A].position;
        assert!(state.topology.distance(a_pos, after) > state.topology.distance(a_pos, before));
    }

    #[test]
    fn movement_flow_steps_confirms_and_undoes() {
        let mut state = duel(RulesetId::Gurps);
        select(&mut state, A, Maneuver::Move);
        assert!(state.focus.movement().is_some());

        let start = state.combatants[&A].position;
        let to = Cell::new(4, 5);
        dispatch2(&mut state, A, &ClientMsg::MoveStep { to }).expect("step");
        dispatch2(&mut state, A, &ClientMsg::UndoMovement).expect("undo");
        assert_eq!(state.focus.movement().unwrap().current, start);

        dispatch2(&mut state, A, &ClientMsg::MoveStep { to }).expect("step again");
        dispatch2(&mut state, A, &ClientMsg::ConfirmMovement).expect("confirm");
        assert_eq!(state.combatants[&A].position, to);
        assert!(matches!(state.focus, Focus::Idle));
    }

    #[test]
    fn step_into_an_occupied_cell_is_rejected() {
        let mut state = duel(RulesetId::Gurps);
        select(&mut state, A, Maneuver::Move);
        let b_pos = state.combatants[&B].position;
        let err = dispatch2(&mut state, A, &ClientMsg::MoveStep { to: b_pos }).unwrap_err();
        assert_eq!(err, ActionError::IllegalStep);
    }

    #[test]
    fn a_rejected_attack_leaves_pending_movement_open() {
        let mut state = duel(RulesetId::Gurps);
        select(&mut state, A, Maneuver::Move);
        let start = state.combatants[&A].position;
        let to = Cell::new(4, 5);
        dispatch2(&mut state, A, &ClientMsg::MoveStep { to }).expect("step");

        // Move forbids attacking; the refusal must not swallow the movement.
        let err = dispatch2(&mut state, A, &msg_attack(B)).unwrap_err();
        assert_eq!(err, ActionError::ManeuverForbidsAttack);
        assert_eq!(state.focus.movement().unwrap().current, to);
        assert_eq!(state.combatants[&A].position, start);

        // Still free to walk back and confirm as if nothing happened.
        dispatch2(&mut state, A, &ClientMsg::UndoMovement).expect("undo");
        dispatch2(&mut state, A, &ClientMsg::ConfirmMovement).expect("confirm");
        assert_eq!(state.combatants[&A].position, start);
    }

    #[test]
    fn a_rejected_close_combat_entry_keeps_the_move_in_progress() {
        let mut state = duel(RulesetId::Gurps);
        select(&mut state, A, Maneuver::Move);
        let to = Cell::new(4, 5);
        dispatch2(&mut state, A, &ClientMsg::MoveStep { to }).expect("step");

        let err = dispatch2(&mut state, A, &ClientMsg::EnterCloseCombat { target_id: A })
            .unwrap_err();
        assert_eq!(err, ActionError::InvalidTarget);
        assert_eq!(state.focus.movement().unwrap().current, to);
    }

    #[test]
    fn grapple_builds_control_and_break_free_sheds_it() {
        let mut state = duel(RulesetId::Gurps);
        select(&mut state, A, Maneuver::Attack);
        dispatch2(&mut state, A, &ClientMsg::EnterCloseCombat { target_id: B })
            .expect("enter close combat");
        assert_eq!(
            state.combatants[&A].rules.gurps().unwrap().in_close_combat_with,
            Some(B)
        );

        // Grapple 9 vs 13 lands; 1d6-1 with a 4 gives 3 points; the dodge
        // (18) fails.
        let mut roller = SequenceRoller::new(&[3, 3, 3, 4, 6, 6, 6]);
        dispatch(&mut state, &mut roller, A, &ClientMsg::Grapple).expect("grapple");
        assert_eq!(
            state.combatants[&A].rules.gurps().unwrap().control_points[&B],
            3
        );
        assert!(state.combatants[&B].has_condition(Condition::Grappled));
        assert_eq!(state.active_turn, B);

        // B wrestles loose: margin 3 vs -4 removes all 3 points.
        select(&mut state, B, Maneuver::Attack);
        let mut roller = SequenceRoller::new(&[3, 3, 3, 6, 6, 5]);
        dispatch(&mut state, &mut roller, B, &ClientMsg::BreakFree).expect("break free");
        assert!(!state.combatants[&B].has_condition(Condition::Grappled));
        assert!(state.combatants[&A]
            .rules
            .gurps()
            .unwrap()
            .control_points
            .is_empty());
    }

    #[test]
    fn exiting_close_combat_asks_the_partner() {
        let mut state = duel(RulesetId::Gurps);
        select(&mut state, A, Maneuver::Attack);
        dispatch2(&mut state, A, &ClientMsg::EnterCloseCombat { target_id: B })
            .expect("enter close combat");
        dispatch2(&mut state, A, &ClientMsg::EndTurn).expect("end turn");
        dispatch2(&mut state, B, &ClientMsg::EndTurn).expect("end turn");

        select(&mut state, A, Maneuver::Move);
        let events = dispatch2(&mut state, A, &ClientMsg::ExitCloseCombat).expect("exit");
        assert!(state.focus.pending_reaction().is_some());
        assert!(events
            .iter()
            .any(|e| matches!(e, OutEvent::Prompt { to, .. } if *to == B)));

        // The partner lets go; both clinches clear and the leaver stepped out.
        dispatch2(&mut state, B, &ClientMsg::CloseCombatResponse { follow: false })
            .expect("respond");
        assert_eq!(
            state.combatants[&A].rules.gurps().unwrap().in_close_combat_with,
            None
        );
        assert_eq!(
            state.combatants[&B].rules.gurps().unwrap().in_close_combat_with,
            None
        );
        let dist = state
            .topology
            .distance(state.combatants[&A].position, state.combatants[&B].position);
        assert!(dist > 1);
    }

    #[test]
    fn surrender_ends_the_duel() {
        let mut state = duel(RulesetId::Gurps);
        dispatch2(&mut state, B, &ClientMsg::Surrender).expect("surrender");
        assert!(state.combatants[&B].defeated);
        assert!(state.check_victory());
        assert_eq!(state.winner, Some(A));
    }

    #[test]
    fn acting_out_of_turn_is_rejected() {
        let mut state = duel(RulesetId::Gurps);
        let err = dispatch2(
            &mut state,
            B,
            &ClientMsg::SelectManeuver {
                maneuver: Maneuver::Attack,
            },
        )
        .unwrap_err();
        assert_eq!(err, ActionError::NotYourTurn);
    }
}
