//! Intent handlers for the DC-based ruleset: the three-action economy,
//! degree-of-success strikes, and the opportunity reaction window.

use uuid::Uuid;

use crate::rules::character::Pf2Attack;
use crate::rules::dice::Roller;
use crate::rules::pf2::check::{check, Degree};
use crate::rules::pf2::{ac_adjustment, map_penalty};
use crate::rules::RulesetId;
use crate::ws::protocol::{ClientMsg, Condition, EffectKind, PendingPrompt, Posture};

use super::actions::ActionError;
use super::grid::{reachable_cells, Cell};
use super::r#match::{Focus, MatchPhase, MatchState, PendingReaction, ReactionKind};
use super::OutEvent;

/// Gate and route one DC-based intent. The reaction window locks out
/// everyone but its owner; surrender stays open through it.
pub fn dispatch(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    actor: Uuid,
    msg: &ClientMsg,
) -> Result<Vec<OutEvent>, ActionError> {
    if state.ruleset != RulesetId::Pf2 {
        return Err(ActionError::UnsupportedByRuleset);
    }
    if state.phase == MatchPhase::Paused {
        return Err(ActionError::MatchPaused);
    }
    if state.phase != MatchPhase::Active {
        return Err(ActionError::MatchNotActive);
    }

    if let Focus::AwaitingReaction(pr) = &state.focus {
        match msg {
            ClientMsg::Pf2Reaction { .. }
                if actor == pr.reactor && pr.kind == ReactionKind::OpportunityStrike => {}
            _ => return Err(ActionError::ReactionPending),
        }
    }

    match msg {
        ClientMsg::Pf2Stride { to } => stride(state, actor, *to),
        ClientMsg::Pf2Step { to } => step(state, actor, *to),
        ClientMsg::Pf2DropProne => drop_prone(state, actor),
        ClientMsg::Pf2Stand => stand(state, actor),
        ClientMsg::Pf2Strike { target_id, weapon } => strike(state, roller, actor, *target_id, *weapon),
        ClientMsg::Pf2RaiseShield => raise_shield(state, actor),
        ClientMsg::Pf2CastSpell { spell, target_id } => {
            cast_spell(state, roller, actor, *spell, *target_id)
        }
        ClientMsg::Pf2Trip { target_id } => trip(state, roller, actor, *target_id),
        ClientMsg::Pf2Feint { target_id } => feint(state, roller, actor, *target_id),
        ClientMsg::Pf2Demoralize { target_id } => demoralize(state, roller, actor, *target_id),
        ClientMsg::Pf2Reaction { accept } => {
            let pr = state
                .focus
                .pending_reaction()
                .ok_or(ActionError::NoReactionPending)?;
            if pr.reactor != actor {
                return Err(ActionError::NotReactor);
            }
            resolve_reaction(state, roller, *accept)
        }
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

/// Pay for an action out of the turn's budget of three.
fn spend(state: &mut MatchState, actor: Uuid, cost: u8) -> Result<(), ActionError> {
    let p = state
        .combatant_mut(actor)?
        .rules
        .pf2_mut()
        .ok_or(ActionError::UnsupportedByRuleset)?;
    if p.actions_remaining < cost {
        return Err(ActionError::NoActionsLeft);
    }
    p.actions_remaining -= cost;
    Ok(())
}

// ---------------------------------------------------------------------------
// Movement
// ---------------------------------------------------------------------------

fn stride(state: &mut MatchState, actor: Uuid, to: Cell) -> Result<Vec<OutEvent>, ActionError> {
    require_turn(state, actor)?;

    let (from, speed) = {
        let c = state.combatant(actor)?;
        let speed = if c.posture == Posture::Prone {
            // Crawling: one square per Stride.
            1
        } else {
            c.derived.move_points
        };
        (c.position, speed)
    };
    let occupied = state.occupied_cells(actor);
    let reachable = reachable_cells(state.topology, &state.map, &occupied, from, speed);
    if to == from || !reachable.contains_key(&to) {
        return Err(ActionError::IllegalStep);
    }

    // Enemies in reach when the stride begins get their opportunity if the
    // mover leaves that reach.
    let provoker_left = |enemy_pos: Cell| {
        state.topology.distance(enemy_pos, from) <= 1 && state.topology.distance(enemy_pos, to) > 1
    };
    let reactor = state
        .combatants
        .values()
        .filter(|c| c.user_id != actor && !c.defeated)
        .filter(|c| c.rules.pf2().is_some_and(|p| p.reaction_available))
        .find(|c| provoker_left(c.position))
        .map(|c| c.user_id);

    spend(state, actor, 1)?;
    let facing = state.topology.direction_towards(from, to);
    {
        let c = state.combatant_mut(actor)?;
        c.facing = facing;
        c.position = to;
    }
    let name = state.display_name(actor).to_string();
    state.push_log(format!("{name} strides to ({}, {})", to.x, to.y));

    let mut events = Vec::new();
    if let Some(r) = reactor {
        state.focus = Focus::AwaitingReaction(PendingReaction {
            reactor: r,
            provoker: actor,
            kind: ReactionKind::OpportunityStrike,
        });
        if !state.is_bot(r) {
            events.push(OutEvent::Prompt {
                to: r,
                prompt: PendingPrompt::ReactionAvailable { provoker: actor },
            });
        }
    }
    Ok(events)
}

fn step(state: &mut MatchState, actor: Uuid, to: Cell) -> Result<Vec<OutEvent>, ActionError> {
    require_turn(state, actor)?;
    let from = state.combatant(actor)?.position;
    if state.topology.distance(from, to) != 1 {
        return Err(ActionError::IllegalStep);
    }
    if state.map.entry_cost(to).is_none() || state.occupied_cells(actor).contains(&to) {
        return Err(ActionError::IllegalStep);
    }
    spend(state, actor, 1)?;
    let facing = state.topology.direction_towards(from, to);
    let c = state.combatant_mut(actor)?;
    c.facing = facing;
    c.position = to;
    Ok(Vec::new())
}

fn drop_prone(state: &mut MatchState, actor: Uuid) -> Result<Vec<OutEvent>, ActionError> {
    require_turn(state, actor)?;
    spend(state, actor, 1)?;
    state.combatant_mut(actor)?.posture = Posture::Prone;
    Ok(Vec::new())
}

fn stand(state: &mut MatchState, actor: Uuid) -> Result<Vec<OutEvent>, ActionError> {
    require_turn(state, actor)?;
    spend(state, actor, 1)?;
    state.combatant_mut(actor)?.posture = Posture::Standing;
    Ok(Vec::new())
}

// ---------------------------------------------------------------------------
// Strikes and spells
// ---------------------------------------------------------------------------

fn strike(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    actor: Uuid,
    target_id: Uuid,
    weapon_idx: usize,
) -> Result<Vec<OutEvent>, ActionError> {
    require_turn(state, actor)?;
    if target_id == actor {
        return Err(ActionError::InvalidTarget);
    }
    let map = {
        let p = state
            .combatant(actor)?
            .rules
            .pf2()
            .ok_or(ActionError::UnsupportedByRuleset)?;
        let agile = state
            .combatant(actor)?
            .sheet
            .pf2()
            .and_then(|s| s.attacks.get(weapon_idx))
            .ok_or(ActionError::UnknownWeapon)?
            .agile;
        map_penalty(p.attacks_this_turn, agile)
    };
    spend(state, actor, 1)?;
    resolve_strike(state, roller, actor, target_id, weapon_idx, map)
}

/// One weapon strike at an explicit multiple attack penalty. Always counts
/// toward the attacker's penalty for later attacks this turn.
fn resolve_strike(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    attacker: Uuid,
    target_id: Uuid,
    weapon_idx: usize,
    map: i32,
) -> Result<Vec<OutEvent>, ActionError> {
    let attack: Pf2Attack = {
        let c = state.combatant(attacker)?;
        let sheet = c.sheet.pf2().ok_or(ActionError::UnsupportedByRuleset)?;
        sheet
            .attacks
            .get(weapon_idx)
            .ok_or(ActionError::UnknownWeapon)?
            .clone()
    };
    let target = state.combatant(target_id)?;
    if target.defeated {
        return Err(ActionError::InvalidTarget);
    }
    let attacker_pos = state.combatant(attacker)?.position;
    if state.topology.distance(attacker_pos, target.position) > attack.reach.max(1) as i32 {
        return Err(ActionError::OutOfRange);
    }

    let frightened = state
        .combatant(attacker)?
        .rules
        .pf2()
        .map(|p| p.frightened as i32)
        .unwrap_or(0);
    let dc = strike_dc(state, target_id, attacker)?;
    let modifier = attack.bonus + map - frightened;

    if let Some(p) = state.combatant_mut(attacker)?.rules.pf2_mut() {
        p.attacks_this_turn += 1;
    }

    let result = check(modifier, dc, roller);
    let attacker_name = state.display_name(attacker).to_string();
    let target_name = state.display_name(target_id).to_string();
    state.push_log(format!(
        "{attacker_name} strikes {target_name} with {} ({} vs DC {dc}, {:?})",
        attack.name, result.total, result.degree
    ));

    match result.degree {
        Degree::CriticalSuccess => {
            let dmg = attack.damage.roll(roller) * 2;
            apply_pf2_damage(state, attacker, target_id, dmg, true)
        }
        Degree::Success => {
            let dmg = attack.damage.roll(roller);
            apply_pf2_damage(state, attacker, target_id, dmg, false)
        }
        _ => {
            let cell = state.combatant(target_id)?.position;
            Ok(vec![OutEvent::Effect {
                effect: EffectKind::Miss,
                actor: attacker,
                target: Some(target_id),
                cell,
                magnitude: 0,
            }])
        }
    }
}

/// Effective AC of the target against one specific attacker.
fn strike_dc(state: &MatchState, target_id: Uuid, attacker: Uuid) -> Result<i32, ActionError> {
    let t = state.combatant(target_id)?;
    let sheet = t.sheet.pf2().ok_or(ActionError::UnsupportedByRuleset)?;
    let p = t.rules.pf2().ok_or(ActionError::UnsupportedByRuleset)?;
    let shield_bonus = sheet.shield.as_ref().map(|s| s.ac_bonus).unwrap_or(0);
    let adj = ac_adjustment(
        p.shield_raised,
        shield_bonus,
        t.posture == Posture::Prone,
        p.flat_footed_vs == Some(attacker),
    );
    // Frightened lowers the victim's DCs as well as their checks.
    Ok(sheet.ac + adj - p.frightened as i32)
}

fn raise_shield(state: &mut MatchState, actor: Uuid) -> Result<Vec<OutEvent>, ActionError> {
    require_turn(state, actor)?;
    if state
        .combatant(actor)?
        .sheet
        .pf2()
        .ok_or(ActionError::UnsupportedByRuleset)?
        .shield
        .is_none()
    {
        return Err(ActionError::NoShield);
    }
    spend(state, actor, 1)?;
    if let Some(p) = state.combatant_mut(actor)?.rules.pf2_mut() {
        p.shield_raised = true;
    }
    let name = state.display_name(actor).to_string();
    state.push_log(format!("{name} raises their shield"));
    Ok(Vec::new())
}

fn cast_spell(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    actor: Uuid,
    spell_idx: usize,
    target_id: Uuid,
) -> Result<Vec<OutEvent>, ActionError> {
    require_turn(state, actor)?;
    if target_id == actor {
        return Err(ActionError::InvalidTarget);
    }
    let (spell, class_dc) = {
        let sheet = state
            .combatant(actor)?
            .sheet
            .pf2()
            .ok_or(ActionError::UnsupportedByRuleset)?;
        let spell = sheet
            .spells
            .get(spell_idx)
            .ok_or(ActionError::UnknownSpell)?
            .clone();
        (spell, sheet.class_dc)
    };
    let target = state.combatant(target_id)?;
    if target.defeated {
        return Err(ActionError::InvalidTarget);
    }
    let dist = state
        .topology
        .distance(state.combatant(actor)?.position, target.position);
    if dist > spell.range.max(1) as i32 {
        return Err(ActionError::OutOfRange);
    }

    // Check the resource before touching the action budget.
    {
        let p = state
            .combatant(actor)?
            .rules
            .pf2()
            .ok_or(ActionError::UnsupportedByRuleset)?;
        if spell.focus {
            if p.focus_points == 0 {
                return Err(ActionError::NoSpellSlots);
            }
        } else if p.spell_slots_remaining == 0 {
            return Err(ActionError::NoSpellSlots);
        }
    }
    spend(state, actor, spell.actions.max(1))?;
    if let Some(p) = state.combatant_mut(actor)?.rules.pf2_mut() {
        if spell.focus {
            p.focus_points -= 1;
        } else {
            p.spell_slots_remaining -= 1;
        }
    }

    let name = state.display_name(actor).to_string();
    let target_name = state.display_name(target_id).to_string();
    state.push_log(format!("{name} casts {} at {target_name}", spell.name));

    if spell.attack_roll {
        // Spell attacks take and feed the multiple attack penalty.
        let (map, frightened) = {
            let p = state
                .combatant(actor)?
                .rules
                .pf2()
                .ok_or(ActionError::UnsupportedByRuleset)?;
            (map_penalty(p.attacks_this_turn, false), p.frightened as i32)
        };
        let dc = strike_dc(state, target_id, actor)?;
        let modifier = class_dc - 10 + map - frightened;
        if let Some(p) = state.combatant_mut(actor)?.rules.pf2_mut() {
            p.attacks_this_turn += 1;
        }
        let result = check(modifier, dc, roller);
        state.push_log(format!(
            "Spell attack {} vs DC {dc} ({:?})",
            result.total, result.degree
        ));
        match result.degree {
            Degree::CriticalSuccess => {
                let dmg = spell.damage.roll(roller) * 2;
                apply_pf2_damage(state, actor, target_id, dmg, true)
            }
            Degree::Success => {
                let dmg = spell.damage.roll(roller);
                apply_pf2_damage(state, actor, target_id, dmg, false)
            }
            _ => Ok(Vec::new()),
        }
    } else {
        // Basic save against the caster's class DC.
        let save = state
            .combatant(target_id)?
            .sheet
            .pf2()
            .ok_or(ActionError::UnsupportedByRuleset)?
            .reflex;
        let result = check(save, class_dc, roller);
        state.push_log(format!(
            "{target_name} saves {} vs DC {class_dc} ({:?})",
            result.total, result.degree
        ));
        let rolled = spell.damage.roll(roller);
        let dmg = match result.degree {
            Degree::CriticalFailure => rolled * 2,
            Degree::Failure => rolled,
            Degree::Success => rolled / 2,
            Degree::CriticalSuccess => 0,
        };
        if dmg > 0 {
            apply_pf2_damage(state, actor, target_id, dmg, false)
        } else {
            Ok(Vec::new())
        }
    }
}

// ---------------------------------------------------------------------------
// Skill actions
// ---------------------------------------------------------------------------

fn trip(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    actor: Uuid,
    target_id: Uuid,
) -> Result<Vec<OutEvent>, ActionError> {
    require_turn(state, actor)?;
    if target_id == actor {
        return Err(ActionError::InvalidTarget);
    }
    let target = state.combatant(target_id)?;
    if target.defeated {
        return Err(ActionError::InvalidTarget);
    }
    let actor_pos = state.combatant(actor)?.position;
    if state.topology.distance(actor_pos, target.position) > 1 {
        return Err(ActionError::OutOfRange);
    }

    let (athletics, map, frightened) = {
        let c = state.combatant(actor)?;
        let sheet = c.sheet.pf2().ok_or(ActionError::UnsupportedByRuleset)?;
        let p = c.rules.pf2().ok_or(ActionError::UnsupportedByRuleset)?;
        (
            sheet.skills.athletics,
            // Trip has the attack trait.
            map_penalty(p.attacks_this_turn, false),
            p.frightened as i32,
        )
    };
    let dc = 10 + state
        .combatant(target_id)?
        .sheet
        .pf2()
        .ok_or(ActionError::UnsupportedByRuleset)?
        .reflex;

    spend(state, actor, 1)?;
    if let Some(p) = state.combatant_mut(actor)?.rules.pf2_mut() {
        p.attacks_this_turn += 1;
    }

    let result = check(athletics + map - frightened, dc, roller);
    let name = state.display_name(actor).to_string();
    let target_name = state.display_name(target_id).to_string();
    state.push_log(format!(
        "{name} tries to trip {target_name} ({} vs DC {dc}, {:?})",
        result.total, result.degree
    ));

    match result.degree {
        Degree::CriticalSuccess => {
            state.combatant_mut(target_id)?.posture = Posture::Prone;
            let dmg = crate::rules::dice::roll_d6(roller);
            apply_pf2_damage(state, actor, target_id, dmg, false)
        }
        Degree::Success => {
            state.combatant_mut(target_id)?.posture = Posture::Prone;
            Ok(Vec::new())
        }
        Degree::Failure => Ok(Vec::new()),
        Degree::CriticalFailure => {
            state.combatant_mut(actor)?.posture = Posture::Prone;
            state.push_log(format!("{name} overbalances and falls"));
            Ok(Vec::new())
        }
    }
}

fn feint(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    actor: Uuid,
    target_id: Uuid,
) -> Result<Vec<OutEvent>, ActionError> {
    require_turn(state, actor)?;
    if target_id == actor {
        return Err(ActionError::InvalidTarget);
    }
    let target = state.combatant(target_id)?;
    if target.defeated {
        return Err(ActionError::InvalidTarget);
    }
    let actor_pos = state.combatant(actor)?.position;
    if state.topology.distance(actor_pos, target.position) > 1 {
        return Err(ActionError::OutOfRange);
    }

    let deception = state
        .combatant(actor)?
        .sheet
        .pf2()
        .ok_or(ActionError::UnsupportedByRuleset)?
        .skills
        .deception;
    let dc = 10 + state
        .combatant(target_id)?
        .sheet
        .pf2()
        .ok_or(ActionError::UnsupportedByRuleset)?
        .perception;

    spend(state, actor, 1)?;
    let result = check(deception, dc, roller);
    let name = state.display_name(actor).to_string();
    let target_name = state.display_name(target_id).to_string();
    state.push_log(format!(
        "{name} feints at {target_name} ({} vs DC {dc}, {:?})",
        result.total, result.degree
    ));
    if result.degree.is_success() {
        if let Some(p) = state.combatant_mut(target_id)?.rules.pf2_mut() {
            p.flat_footed_vs = Some(actor);
        }
    }
    Ok(Vec::new())
}

fn demoralize(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    actor: Uuid,
    target_id: Uuid,
) -> Result<Vec<OutEvent>, ActionError> {
    require_turn(state, actor)?;
    if target_id == actor {
        return Err(ActionError::InvalidTarget);
    }
    let target = state.combatant(target_id)?;
    if target.defeated {
        return Err(ActionError::InvalidTarget);
    }

    let intimidation = state
        .combatant(actor)?
        .sheet
        .pf2()
        .ok_or(ActionError::UnsupportedByRuleset)?
        .skills
        .intimidation;
    let dc = 10 + state
        .combatant(target_id)?
        .sheet
        .pf2()
        .ok_or(ActionError::UnsupportedByRuleset)?
        .will;

    spend(state, actor, 1)?;
    let result = check(intimidation, dc, roller);
    let name = state.display_name(actor).to_string();
    let target_name = state.display_name(target_id).to_string();
    state.push_log(format!(
        "{name} demoralizes {target_name} ({} vs DC {dc}, {:?})",
        result.total, result.degree
    ));
    let fright = match result.degree {
        Degree::CriticalSuccess => 2,
        Degree::Success => 1,
        _ => 0,
    };
    if fright > 0 {
        if let Some(p) = state.combatant_mut(target_id)?.rules.pf2_mut() {
            p.frightened = p.frightened.max(fright);
        }
    }
    Ok(Vec::new())
}

// ---------------------------------------------------------------------------
// Reactions and wounding
// ---------------------------------------------------------------------------

/// Close the opportunity window: the reactor swings once at no multiple
/// attack penalty, or declines and keeps the reaction. Also the entry
/// point for timed-out and bot responses.
pub fn resolve_reaction(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    accept: bool,
) -> Result<Vec<OutEvent>, ActionError> {
    let pr = state
        .focus
        .pending_reaction()
        .ok_or(ActionError::NoReactionPending)?
        .clone();
    if pr.kind != ReactionKind::OpportunityStrike {
        return Err(ActionError::NoReactionPending);
    }
    state.focus = Focus::Idle;
    if !accept {
        return Ok(Vec::new());
    }
    if let Some(p) = state
        .combatants
        .get_mut(&pr.reactor)
        .and_then(|c| c.rules.pf2_mut())
    {
        p.reaction_available = false;
    }
    let name = state.display_name(pr.reactor).to_string();
    state.push_log(format!("{name} takes the opening"));
    // Off-turn strike at no penalty; the swing lands as the provoker pulls
    // away, so range is not re-checked against their new square.
    match resolve_strike_unchecked(state, roller, pr.reactor, pr.provoker, 0) {
        Ok(events) => Ok(events),
        Err(_) => Ok(Vec::new()),
    }
}

/// The reaction strike, skipping the reach test.
fn resolve_strike_unchecked(
    state: &mut MatchState,
    roller: &mut dyn Roller,
    attacker: Uuid,
    target_id: Uuid,
    map: i32,
) -> Result<Vec<OutEvent>, ActionError> {
    let attack: Pf2Attack = {
        let sheet = state
            .combatant(attacker)?
            .sheet
            .pf2()
            .ok_or(ActionError::UnsupportedByRuleset)?;
        sheet.attacks.first().ok_or(ActionError::UnknownWeapon)?.clone()
    };
    if state.combatant(target_id)?.defeated {
        return Ok(Vec::new());
    }
    let frightened = state
        .combatant(attacker)?
        .rules
        .pf2()
        .map(|p| p.frightened as i32)
        .unwrap_or(0);
    let dc = strike_dc(state, target_id, attacker)?;
    let result = check(attack.bonus + map - frightened, dc, roller);
    let attacker_name = state.display_name(attacker).to_string();
    let target_name = state.display_name(target_id).to_string();
    state.push_log(format!(
        "{attacker_name} strikes {target_name} with {} ({} vs DC {dc}, {:?})",
        attack.name, result.total, result.degree
    ));
    match result.degree {
        Degree::CriticalSuccess => {
            let dmg = attack.damage.roll(roller) * 2;
            apply_pf2_damage(state, attacker, target_id, dmg, true)
        }
        Degree::Success => {
            let dmg = attack.damage.roll(roller);
            apply_pf2_damage(state, attacker, target_id, dmg, false)
        }
        _ => Ok(Vec::new()),
    }
}

/// Subtract hit points and handle the drop to zero: the victim falls
/// unconscious and starts dying, deeper if the blow was a critical.
fn apply_pf2_damage(
    state: &mut MatchState,
    attacker: Uuid,
    target_id: Uuid,
    amount: i32,
    critical: bool,
) -> Result<Vec<OutEvent>, ActionError> {
    let amount = amount.max(0);
    let (hp_after, pos) = {
        let c = state.combatant_mut(target_id)?;
        c.current_hp = (c.current_hp - amount).max(0);
        (c.current_hp, c.position)
    };
    let target_name = state.display_name(target_id).to_string();
    state.push_log(format!("{target_name} takes {amount} damage"));

    let events = vec![OutEvent::Effect {
        effect: EffectKind::Damage,
        actor: attacker,
        target: Some(target_id),
        cell: pos,
        magnitude: amount,
    }];

    if hp_after == 0 && amount > 0 && !state.combatant(target_id)?.defeated {
        let c = state.combatant_mut(target_id)?;
        c.posture = Posture::Prone;
        c.add_condition(Condition::Unconscious);
        c.defeated = true;
        if let Some(p) = c.rules.pf2_mut() {
            let base = 1 + p.wounded;
            p.dying = if critical { base + 1 } else { base };
            p.wounded += 1;
        }
        state.push_log(format!("{target_name} falls, dying"));
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::r#match::duel;
    use crate::rules::dice::SequenceRoller;

    const A: Uuid = Uuid::from_u128(1);
    const B: Uuid = Uuid::from_u128(2);

    fn strike_msg(target: Uuid) -> ClientMsg {
        ClientMsg::Pf2Strike {
            target_id: target,
            weapon: 0,
        }
    }

    fn pf2_of(state: &MatchState, id: Uuid) -> &crate::rules::Pf2Combatant {
        state.combatants[&id].rules.pf2().unwrap()
    }

    #[test]
    fn map_escalates_across_strikes_and_budget_runs_out() {
        let mut state = duel(RulesetId::Pf2);

        // First strike: +9 vs AC 18, die 10 hits for 1d8+3 with a 5.
        let mut roller = SequenceRoller::new(&[10, 5]);
        dispatch(&mut state, &mut roller, A, &strike_msg(B)).expect("first strike");
        assert_eq!(state.combatants[&B].current_hp, 20);
        assert_eq!(pf2_of(&state, A).attacks_this_turn, 1);

        // Second strike at -5: die 15 totals 19, still a hit, die 1 for 4.
        let mut roller = SequenceRoller::new(&[15, 1]);
        dispatch(&mut state, &mut roller, A, &strike_msg(B)).expect("second strike");
        assert_eq!(state.combatants[&B].current_hp, 16);

        // Third at -10: a natural 20 upgrades the failure into a hit and
        // then a critical for double damage, die 4 -> 14.
        let mut roller = SequenceRoller::new(&[20, 4]);
        dispatch(&mut state, &mut roller, A, &strike_msg(B)).expect("third strike");
        assert_eq!(state.combatants[&B].current_hp, 2);

        // Budget exhausted.
        let mut roller = SequenceRoller::new(&[10, 5]);
        let err = dispatch(&mut state, &mut roller, A, &strike_msg(B)).unwrap_err();
        assert_eq!(err, ActionError::NoActionsLeft);
    }

    #[test]
    fn raised_shield_and_prone_shift_the_dc() {
        let mut state = duel(RulesetId::Pf2);
        // Give the defender a raised shield out of band: DC becomes 20.
        state
            .combatants
            .get_mut(&B)
            .unwrap()
            .rules
            .pf2_mut()
            .unwrap()
            .shield_raised = true;

        // die 10 totals 19: a hit against 18, a miss against 20.
        let mut roller = SequenceRoller::new(&[10]);
        dispatch(&mut state, &mut roller, A, &strike_msg(B)).expect("strike");
        assert_eq!(state.combatants[&B].current_hp, 28);

        // Prone cancels the shield: DC back to 18, the same roll hits.
        state.combatants.get_mut(&B).unwrap().posture = Posture::Prone;
        let mut roller = SequenceRoller::new(&[15, 5]);
        dispatch(&mut state, &mut roller, A, &strike_msg(B)).expect("strike");
        assert_eq!(state.combatants[&B].current_hp, 20);
    }

    #[test]
    fn trip_drops_the_target_prone() {
        let mut state = duel(RulesetId::Pf2);
        // Athletics 9 vs DC 17 (10 + reflex 7): die 10 succeeds.
        let mut roller = SequenceRoller::new(&[10]);
        dispatch(&mut state, &mut roller, A, &ClientMsg::Pf2Trip { target_id: B })
            .expect("trip");
        assert_eq!(state.combatants[&B].posture, Posture::Prone);
        // Trip carries the attack trait.
        assert_eq!(pf2_of(&state, A).attacks_this_turn, 1);
    }

    #[test]
    fn feint_opens_the_target_to_the_feinter_only() {
        let mut state = duel(RulesetId::Pf2);
        // Deception 2 vs DC 17 (10 + perception 7): die 19 totals 21.
        let mut roller = SequenceRoller::new(&[19]);
        dispatch(&mut state, &mut roller, A, &ClientMsg::Pf2Feint { target_id: B })
            .expect("feint");
        assert_eq!(pf2_of(&state, B).flat_footed_vs, Some(A));

        // Flat-footed shifts the strike DC to 16; die 7 totals 16, a hit.
        let mut roller = SequenceRoller::new(&[7, 5]);
        dispatch(&mut state, &mut roller, A, &strike_msg(B)).expect("strike");
        assert_eq!(state.combatants[&B].current_hp, 20);
    }

    #[test]
    fn demoralize_frightens_and_dulls_the_victim() {
        let mut state = duel(RulesetId::Pf2);
        // Intimidation 5 vs DC 15 (10 + will 5): die 15 totals 20.
        let mut roller = SequenceRoller::new(&[15]);
        dispatch(&mut state, &mut roller, A, &ClientMsg::Pf2Demoralize { target_id: B })
            .expect("demoralize");
        assert_eq!(pf2_of(&state, B).frightened, 1);

        // The victim's DC drops by one: die 8 totals 17 vs DC 17, a hit.
        let mut roller = SequenceRoller::new(&[8, 5]);
        dispatch(&mut state, &mut roller, A, &strike_msg(B)).expect("strike");
        assert_eq!(state.combatants[&B].current_hp, 20);
    }

    #[test]
    fn stride_out_of_reach_offers_the_opportunity() {
        let mut state = duel(RulesetId::Pf2);
        let events = dispatch(
            &mut state,
            &mut SequenceRoller::new(&[]),
            A,
            &ClientMsg::Pf2Stride { to: Cell::new(2, 4) },
        )
        .expect("stride");
        assert_eq!(state.combatants[&A].position, Cell::new(2, 4));
        assert!(state.focus.pending_reaction().is_some());
        assert!(events
            .iter()
            .any(|e| matches!(e, OutEvent::Prompt { to, .. } if *to == B)));

        // The mover cannot keep acting while the window is open.
        let err = dispatch(
            &mut state,
            &mut SequenceRoller::new(&[]),
            A,
            &ClientMsg::Pf2Stand,
        )
        .unwrap_err();
        assert_eq!(err, ActionError::ReactionPending);

        // The reactor accepts: +9 with no penalty, die 15 hits for 8.
        let mut roller = SequenceRoller::new(&[15, 5]);
        dispatch(&mut state, &mut roller, B, &ClientMsg::Pf2Reaction { accept: true })
            .expect("reaction");
        assert_eq!(state.combatants[&A].current_hp, 20);
        assert!(!pf2_of(&state, B).reaction_available);
        assert!(matches!(state.focus, Focus::Idle));
    }

    #[test]
    fn declined_reaction_keeps_it_for_later() {
        let mut state = duel(RulesetId::Pf2);
        dispatch(
            &mut state,
            &mut SequenceRoller::new(&[]),
            A,
            &ClientMsg::Pf2Stride { to: Cell::new(2, 4) },
        )
        .expect("stride");
        dispatch(
            &mut state,
            &mut SequenceRoller::new(&[]),
            B,
            &ClientMsg::Pf2Reaction { accept: false },
        )
        .expect("decline");
        assert!(pf2_of(&state, B).reaction_available);
        assert_eq!(state.combatants[&A].current_hp, 28);
    }

    #[test]
    fn a_step_never_provokes() {
        let mut state = duel(RulesetId::Pf2);
        dispatch(
            &mut state,
            &mut SequenceRoller::new(&[]),
            A,
            &ClientMsg::Pf2Step { to: Cell::new(3, 4) },
        )
        .expect("step");
        assert!(state.focus.pending_reaction().is_none());
        assert_eq!(state.combatants[&A].position, Cell::new(3, 4));
    }

    #[test]
    fn dropping_to_zero_starts_dying() {
        let mut state = duel(RulesetId::Pf2);
        state.combatants.get_mut(&B).unwrap().current_hp = 4;

        let mut roller = SequenceRoller::new(&[10, 5]);
        dispatch(&mut state, &mut roller, A, &strike_msg(B)).expect("strike");

        let b = &state.combatants[&B];
        assert_eq!(b.current_hp, 0);
        assert!(b.defeated);
        assert!(b.has_condition(Condition::Unconscious));
        assert_eq!(b.posture, Posture::Prone);
        assert_eq!(pf2_of(&state, B).dying, 1);
        assert_eq!(pf2_of(&state, B).wounded, 1);
    }

    #[test]
    fn stride_rejects_unreachable_squares() {
        let mut state = duel(RulesetId::Pf2);
        // Speed 5: (12, 4) is 8 squares out.
        let err = dispatch(
            &mut state,
            &mut SequenceRoller::new(&[]),
            A,
            &ClientMsg::Pf2Stride { to: Cell::new(12, 4) },
        )
        .unwrap_err();
        assert_eq!(err, ActionError::IllegalStep);
    }
}
