//! Wire snapshot of a match: the full authoritative state every client
//! receives after each committed mutation, and the shape persisted to the
//! store for resume and post-match review.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rules::{RulesState, RulesetId};
use crate::ws::protocol::{Condition, ParticipantInfo, Posture, WorldPos};

use super::grid::{Cell, Topology};
use super::r#match::{Focus, MatchPhase, MatchState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSnapshot {
    pub match_id: Uuid,
    pub ruleset: RulesetId,
    pub topology: Topology,
    pub phase: MatchPhase,
    pub round: u32,
    pub active_turn: Uuid,
    pub turn_order: Vec<Uuid>,
    pub focus: FocusSnapshot,
    pub participants: Vec<ParticipantInfo>,
    pub combatants: Vec<CombatantSnapshot>,
    pub map: MapSnapshot,
    pub log: Vec<String>,
    pub winner: Option<Uuid>,
    pub started_at: Option<u64>,
}

/// The blocking concern, flattened for clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FocusSnapshot {
    Idle,
    Moving {
        current: Cell,
        facing: u8,
        budget: u32,
        spent: u32,
        /// Cells still reachable this turn with their cumulative cost.
        reachable: Vec<(Cell, u32)>,
    },
    AwaitingDefense {
        attacker: Uuid,
        defender: Uuid,
    },
    AwaitingReaction {
        reactor: Uuid,
        provoker: Uuid,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombatantSnapshot {
    pub user_id: Uuid,
    pub display_name: String,
    pub position: Cell,
    /// Continuous coordinates of the cell center, for rendering.
    pub world: WorldPos,
    pub facing: u8,
    pub posture: Posture,
    pub conditions: Vec<Condition>,
    pub current_hp: i32,
    pub max_hp: i32,
    pub defeated: bool,
    pub rules: RulesState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapSnapshot {
    pub width: i32,
    pub height: i32,
    pub blocked: Vec<Cell>,
    pub difficult: Vec<Cell>,
}

impl MatchSnapshot {
    pub fn of(state: &MatchState) -> Self {
        let focus = match &state.focus {
            Focus::Idle => FocusSnapshot::Idle,
            Focus::Moving(tm) => FocusSnapshot::Moving {
                current: tm.current,
                facing: tm.facing,
                budget: tm.budget,
                spent: tm.spent,
                reachable: tm.reachable.iter().map(|(c, v)| (*c, *v)).collect(),
            },
            Focus::AwaitingDefense(pd) => FocusSnapshot::AwaitingDefense {
                attacker: pd.attacker,
                defender: pd.defender,
            },
            Focus::AwaitingReaction(pr) => FocusSnapshot::AwaitingReaction {
                reactor: pr.reactor,
                provoker: pr.provoker,
            },
        };

        let combatants = state
            .turn_order
            .iter()
            .filter_map(|id| state.combatants.get(id))
            .map(|c| {
                let (wx, wy) = state.topology.to_world(c.position);
                CombatantSnapshot {
                    user_id: c.user_id,
                    display_name: state.display_name(c.user_id).to_string(),
                    position: c.position,
                    world: WorldPos { x: wx, y: wy },
                    facing: c.facing,
                    posture: c.posture,
                    conditions: c.conditions.clone(),
                    current_hp: c.current_hp,
                    max_hp: c.derived.max_hp,
                    defeated: c.defeated,
                    rules: c.rules.clone(),
                }
            })
            .collect();

        Self {
            match_id: state.id,
            ruleset: state.ruleset,
            topology: state.topology,
            phase: state.phase,
            round: state.round,
            active_turn: state.active_turn,
            turn_order: state.turn_order.clone(),
            focus,
            participants: state.participants.iter().map(|p| p.info()).collect(),
            combatants,
            map: MapSnapshot {
                width: state.map.width,
                height: state.map.height,
                blocked: state.map.blocked_cells(),
                difficult: state.map.difficult_cells(),
            },
            log: state.log.clone(),
            winner: state.winner,
            started_at: state.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::r#match::duel;

    #[test]
    fn snapshot_round_trips_through_json() {
        let state = duel(RulesetId::Gurps);
        let snap = MatchSnapshot::of(&state);
        assert_eq!(snap.match_id, state.id);
        assert_eq!(snap.combatants.len(), 2);
        assert_eq!(snap.turn_order, state.turn_order);

        let json = serde_json::to_string(&snap).expect("serialize");
        let back: MatchSnapshot = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.match_id, snap.match_id);
        assert_eq!(back.combatants.len(), 2);
    }

    #[test]
    fn combatants_follow_initiative_order() {
        let state = duel(RulesetId::Gurps);
        let snap = MatchSnapshot::of(&state);
        let ids: Vec<Uuid> = snap.combatants.iter().map(|c| c.user_id).collect();
        assert_eq!(ids, snap.turn_order);
    }
}
