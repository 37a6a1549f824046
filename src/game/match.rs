//! Match state and the authoritative per-match task
//!
//! Each match runs as its own tokio task that exclusively owns a
//! `MatchState`. Sessions feed it `PlayerInput` over an mpsc channel and
//! subscribe to a broadcast channel for state snapshots; nothing outside the
//! task ever touches match state directly. Timers (bot turns, defense and
//! reaction deadlines) are `Option<Instant>` fields raced in the same
//! `select!` loop, so overwriting or clearing one is cancellation.

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::rules::character::{CharacterSheet, DamageKind};
use crate::rules::dice::{roll_d20, Roller};
use crate::rules::gurps::defense::FacingArc;
use crate::rules::pf2::recovery_dc;
use crate::rules::{DerivedStats, RulesState, RulesetId, PF2_DYING_MAX};
use crate::store::MatchStore;
use crate::util::time::unix_millis;
use crate::ws::protocol::{
    ClientMsg, Condition, HitLocation, ParticipantInfo, Posture, ServerMsg, WorldPos,
};

use super::actions::{self, ActionError};
use super::bot;
use super::grid::{Cell, Topology};
use super::map::TerrainMap;
use super::pf2_actions;
use super::snapshot::MatchSnapshot;
use super::{OutEvent, PlayerInput};

/// How long a human defender gets before the default defense is applied.
pub const DEFENSE_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a human gets to resolve a reaction or close-combat prompt.
pub const REACTION_TIMEOUT: Duration = Duration::from_secs(15);
/// Artificial thinking delay before a bot takes its turn.
pub const BOT_TURN_DELAY: Duration = Duration::from_millis(1200);
/// Artificial delay before a bot answers a defense or reaction prompt.
pub const BOT_PROMPT_DELAY: Duration = Duration::from_millis(600);

/// Match phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPhase {
    /// Waiting for every human participant to connect.
    Waiting,
    /// Match in progress
    Active,
    /// A human disconnected; state is frozen until they return.
    Paused,
    /// Match ended
    Finished,
}

/// A seat at the table: identity and connection state, bot or human.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: Uuid,
    pub display_name: String,
    pub is_bot: bool,
    pub connected: bool,
}

impl Participant {
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            user_id: self.user_id,
            display_name: self.display_name.clone(),
            is_bot: self.is_bot,
            connected: self.connected,
        }
    }
}

/// Everything needed to seed one combatant into a fresh match.
#[derive(Debug, Clone)]
pub struct CombatantSeed {
    pub user_id: Uuid,
    pub display_name: String,
    pub is_bot: bool,
    pub sheet: CharacterSheet,
    pub position: Cell,
    pub facing: u8,
}

/// A combatant on the grid (authoritative).
#[derive(Debug, Clone)]
pub struct Combatant {
    pub user_id: Uuid,
    pub sheet: CharacterSheet,
    pub derived: DerivedStats,
    pub position: Cell,
    /// Facing as a direction index, 0..topology.direction_count().
    pub facing: u8,
    pub current_hp: i32,
    pub posture: Posture,
    pub conditions: Vec<Condition>,
    pub defeated: bool,
    pub rules: RulesState,
}

impl Combatant {
    pub fn has_condition(&self, c: Condition) -> bool {
        self.conditions.contains(&c)
    }

    pub fn add_condition(&mut self, c: Condition) {
        if !self.has_condition(c) {
            self.conditions.push(c);
        }
    }

    pub fn remove_condition(&mut self, c: Condition) {
        self.conditions.retain(|&x| x != c);
    }
}

/// In-progress movement for the active combatant's turn. Steps accumulate
/// until confirmed; undo rewinds to the start of the turn.
#[derive(Debug, Clone)]
pub struct TurnMovement {
    pub start: Cell,
    pub start_facing: u8,
    pub current: Cell,
    pub facing: u8,
    pub budget: u32,
    pub spent: u32,
    pub path: Vec<Cell>,
    /// Cells reachable from `start` this turn, with cumulative cost.
    pub reachable: HashMap<Cell, u32>,
}

/// An attack that landed and now waits on the defender's choice.
#[derive(Debug, Clone)]
pub struct PendingDefense {
    pub attacker: Uuid,
    pub defender: Uuid,
    pub weapon: usize,
    pub attack_margin: i32,
    pub hit_location: HitLocation,
    pub damage: crate::rules::dice::DamageFormula,
    pub damage_kind: DamageKind,
    /// Penalty to the defense from a deceptive attack (zero or negative).
    pub deceptive_penalty: i32,
    /// Which arc the attack came from, fixed at attack resolution.
    pub arc: FacingArc,
}

/// What an open reaction window is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionKind {
    /// The reactor's close-combat opponent is stepping away.
    CloseCombatExit,
    /// The provoker moved out of the reactor's reach.
    OpportunityStrike,
}

/// A decision window owned by a single combatant.
#[derive(Debug, Clone)]
pub struct PendingReaction {
    pub reactor: Uuid,
    pub provoker: Uuid,
    pub kind: ReactionKind,
}

/// The single blocking concern of a match, if any. At most one of these
/// exists at a time; every handler checks it before mutating state.
#[derive(Debug, Clone, Default)]
pub enum Focus {
    #[default]
    Idle,
    Moving(TurnMovement),
    AwaitingDefense(PendingDefense),
    AwaitingReaction(PendingReaction),
}

impl Focus {
    pub fn pending_defense(&self) -> Option<&PendingDefense> {
        match self {
            Focus::AwaitingDefense(pd) => Some(pd),
            _ => None,
        }
    }

    pub fn pending_reaction(&self) -> Option<&PendingReaction> {
        match self {
            Focus::AwaitingReaction(pr) => Some(pr),
            _ => None,
        }
    }

    pub fn movement(&self) -> Option<&TurnMovement> {
        match self {
            Focus::Moving(tm) => Some(tm),
            _ => None,
        }
    }
}

/// Match state (owned by the match task)
pub struct MatchState {
    pub id: Uuid,
    pub seed: u64,
    pub ruleset: RulesetId,
    pub topology: Topology,
    pub map: TerrainMap,
    pub participants: Vec<Participant>,
    pub combatants: HashMap<Uuid, Combatant>,
    /// Initiative order, highest first; fixed for the whole match.
    pub turn_order: Vec<Uuid>,
    pub active_turn: Uuid,
    pub round: u32,
    pub phase: MatchPhase,
    pub focus: Focus,
    pub log: Vec<String>,
    pub winner: Option<Uuid>,
    pub started_at: Option<u64>,
}

impl MatchState {
    /// Seed a match: derive stats, roll initiative, place combatants.
    pub fn new(
        id: Uuid,
        seed: u64,
        ruleset: RulesetId,
        map: TerrainMap,
        seeds: Vec<CombatantSeed>,
        roller: &mut dyn Roller,
    ) -> Self {
        let topology = ruleset.topology();
        let mut participants = Vec::new();
        let mut combatants = HashMap::new();
        let mut rolls: Vec<(Uuid, i32)> = Vec::new();

        for s in seeds {
            let derived = ruleset.derived_stats(&s.sheet);
            let rules = ruleset.initial_state(&s.sheet);
            rolls.push((s.user_id, ruleset.initiative(&s.sheet, roller)));
            participants.push(Participant {
                user_id: s.user_id,
                display_name: s.display_name,
                is_bot: s.is_bot,
                // Bots never connect; humans attach via join_match.
                connected: s.is_bot,
            });
            combatants.insert(
                s.user_id,
                Combatant {
                    user_id: s.user_id,
                    sheet: s.sheet,
                    derived,
                    position: s.position,
                    facing: s.facing,
                    current_hp: derived.max_hp,
                    posture: Posture::Standing,
                    conditions: Vec::new(),
                    defeated: false,
                    rules,
                },
            );
        }

        rolls.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let turn_order: Vec<Uuid> = rolls.iter().map(|(id, _)| *id).collect();
        let active_turn = turn_order.first().copied().unwrap_or_else(Uuid::nil);

        Self {
            id,
            seed,
            ruleset,
            topology,
            map,
            participants,
            combatants,
            turn_order,
            active_turn,
            round: 1,
            phase: MatchPhase::Waiting,
            focus: Focus::Idle,
            log: Vec::new(),
            winner: None,
            started_at: None,
        }
    }

    /// All human participants are attached; begin round 1.
    pub fn start(&mut self) {
        if self.phase != MatchPhase::Waiting {
            return;
        }
        self.phase = MatchPhase::Active;
        self.started_at = Some(unix_millis());
        let first = self.active_turn;
        let ruleset = self.ruleset;
        if let Some(c) = self.combatants.get_mut(&first) {
            ruleset.reset_turn(&mut c.rules);
        }
        let name = self.display_name(first).to_string();
        self.push_log(format!("Round 1: {name} acts first"));
    }

    pub fn participant(&self, user_id: Uuid) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: Uuid) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    pub fn is_bot(&self, user_id: Uuid) -> bool {
        self.participant(user_id).is_some_and(|p| p.is_bot)
    }

    pub fn display_name(&self, user_id: Uuid) -> &str {
        self.participant(user_id)
            .map(|p| p.display_name.as_str())
            .unwrap_or("unknown")
    }

    pub fn combatant(&self, user_id: Uuid) -> Result<&Combatant, ActionError> {
        self.combatants
            .get(&user_id)
            .ok_or(ActionError::UnknownCombatant)
    }

    pub fn combatant_mut(&mut self, user_id: Uuid) -> Result<&mut Combatant, ActionError> {
        self.combatants
            .get_mut(&user_id)
            .ok_or(ActionError::UnknownCombatant)
    }

    /// Cells occupied by living combatants, excluding one of them.
    pub fn occupied_cells(&self, excluding: Uuid) -> HashSet<Cell> {
        self.combatants
            .values()
            .filter(|c| c.user_id != excluding && !c.defeated)
            .map(|c| c.position)
            .collect()
    }

    /// Non-defeated opponents of a combatant.
    pub fn standing_enemies(&self, of: Uuid) -> Vec<Uuid> {
        self.combatants
            .values()
            .filter(|c| c.user_id != of && !c.defeated)
            .map(|c| c.user_id)
            .collect()
    }

    pub fn standing_count(&self) -> usize {
        self.combatants.values().filter(|c| !c.defeated).count()
    }

    /// Append one audit line. The log is never truncated while the match
    /// lives; it rides along in every snapshot.
    pub fn push_log(&mut self, line: String) {
        self.log.push(line);
    }

    /// Advance to the next combatant who can act. Skipped dying combatants
    /// make their recovery roll as their turn passes.
    pub fn advance_turn(&mut self, roller: &mut dyn Roller) {
        self.focus = Focus::Idle;
        let len = self.turn_order.len();
        let Some(mut idx) = self.turn_order.iter().position(|id| *id == self.active_turn) else {
            return;
        };
        let ruleset = self.ruleset;
        for _ in 0..len {
            idx += 1;
            if idx >= len {
                idx = 0;
                self.round += 1;
            }
            let cand = self.turn_order[idx];
            self.roll_recovery(cand, roller);
            let (defeated, stunned) = match self.combatants.get(&cand) {
                Some(c) => (c.defeated, c.has_condition(Condition::Stunned)),
                None => continue,
            };
            if defeated {
                continue;
            }
            if stunned {
                if let Some(c) = self.combatants.get_mut(&cand) {
                    c.remove_condition(Condition::Stunned);
                }
                let name = self.display_name(cand).to_string();
                self.push_log(format!("{name} shakes off the stun"));
            }
            if let Some(c) = self.combatants.get_mut(&cand) {
                ruleset.reset_turn(&mut c.rules);
            }
            self.active_turn = cand;
            let round = self.round;
            let name = self.display_name(cand).to_string();
            self.push_log(format!("Round {round}: {name}'s turn"));
            return;
        }
    }

    /// Flat check against the recovery DC for a dying combatant, rolled as
    /// their turn slot comes around.
    fn roll_recovery(&mut self, user_id: Uuid, roller: &mut dyn Roller) {
        let dying = match self.combatants.get(&user_id).and_then(|c| c.rules.pf2()) {
            Some(p) if p.dying > 0 && p.dying < PF2_DYING_MAX => p.dying,
            _ => return,
        };
        let dc = recovery_dc(dying);
        let die = roll_d20(roller);
        let new_dying = if die >= dc { dying - 1 } else { dying + 1 };
        if let Some(p) = self
            .combatants
            .get_mut(&user_id)
            .and_then(|c| c.rules.pf2_mut())
        {
            p.dying = new_dying;
        }
        let name = self.display_name(user_id).to_string();
        let line = if die >= dc {
            if new_dying == 0 {
                format!("{name} stabilizes (recovery {die} vs DC {dc})")
            } else {
                format!("{name} rallies, dying {new_dying} (recovery {die} vs DC {dc})")
            }
        } else if new_dying >= PF2_DYING_MAX {
            format!("{name} succumbs to their wounds")
        } else {
            format!("{name} worsens, dying {new_dying} (recovery {die} vs DC {dc})")
        };
        self.push_log(line);
    }

    /// End the match if at most one combatant is still standing.
    /// Returns true when the match just finished.
    pub fn check_victory(&mut self) -> bool {
        if self.phase != MatchPhase::Active {
            return false;
        }
        if self.standing_count() > 1 {
            return false;
        }
        self.phase = MatchPhase::Finished;
        self.focus = Focus::Idle;
        self.winner = self
            .combatants
            .values()
            .find(|c| !c.defeated)
            .map(|c| c.user_id);
        match self.winner {
            Some(w) => {
                let name = self.display_name(w).to_string();
                self.push_log(format!("{name} wins the match"));
            }
            None => self.push_log("The match ends with no one standing".to_string()),
        }
        true
    }
}

/// Handle to a running match
#[derive(Clone)]
pub struct MatchHandle {
    pub id: Uuid,
    pub ruleset: RulesetId,
    pub input_tx: mpsc::Sender<PlayerInput>,
    pub broadcast_tx: broadcast::Sender<ServerMsg>,
    pub player_count: Arc<std::sync::atomic::AtomicUsize>,
}

impl MatchHandle {
    pub fn player_count(&self) -> usize {
        self.player_count.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Registry of all active matches
pub struct MatchRegistry {
    matches: DashMap<Uuid, MatchHandle>,
    /// Which match each player currently belongs to.
    seats: DashMap<Uuid, Uuid>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            matches: DashMap::new(),
            seats: DashMap::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.get(id).map(|m| m.value().clone())
    }

    pub fn insert(&self, handle: MatchHandle, players: &[Uuid]) {
        for p in players {
            self.seats.insert(*p, handle.id);
        }
        self.matches.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<MatchHandle> {
        self.seats.retain(|_, v| v != id);
        self.matches.remove(id).map(|(_, h)| h)
    }

    /// The match a player is seated in, if any.
    pub fn match_for_player(&self, user_id: &Uuid) -> Option<MatchHandle> {
        let id = *self.seats.get(user_id)?.value();
        self.get(&id)
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_players(&self) -> usize {
        self.matches.iter().map(|m| m.value().player_count()).sum()
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The authoritative match task
pub struct GameMatch {
    state: MatchState,
    roller: Box<dyn Roller>,
    input_rx: mpsc::Receiver<PlayerInput>,
    broadcast_tx: broadcast::Sender<ServerMsg>,
    player_count: Arc<std::sync::atomic::AtomicUsize>,
    store: Option<MatchStore>,
    /// When the active bot takes its turn.
    bot_at: Option<Instant>,
    /// Deadline of the currently open defense/reaction window.
    wait_at: Option<Instant>,
}

impl GameMatch {
    pub fn new(
        state: MatchState,
        roller: Box<dyn Roller>,
        store: Option<MatchStore>,
    ) -> (Self, MatchHandle) {
        let (input_tx, input_rx) = mpsc::channel(256);
        let (broadcast_tx, _) = broadcast::channel(64);
        let player_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handle = MatchHandle {
            id: state.id,
            ruleset: state.ruleset,
            input_tx,
            broadcast_tx: broadcast_tx.clone(),
            player_count: player_count.clone(),
        };

        let game_match = Self {
            state,
            roller,
            input_rx,
            broadcast_tx,
            player_count,
            store,
            bot_at: None,
            wait_at: None,
        };

        (game_match, handle)
    }

    /// Run the match to completion.
    pub async fn run(mut self) {
        info!(match_id = %self.state.id, ruleset = %self.state.ruleset, "Match task started");

        // A bot-only match has nobody to wait for.
        if self.state.participants.iter().all(|p| p.is_bot) {
            self.state.start();
            self.commit(Vec::new());
        }

        loop {
            let deadline = match (self.bot_at, self.wait_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            tokio::select! {
                maybe_input = self.input_rx.recv() => {
                    match maybe_input {
                        Some(input) => self.handle_input(input),
                        None => break,
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire_deadline();
                }
            }

            if self.state.phase == MatchPhase::Finished {
                break;
            }
        }

        let _ = self.broadcast_tx.send(ServerMsg::MatchEnd {
            winner_user_id: self.state.winner,
        });
        self.persist();
        info!(match_id = %self.state.id, winner = ?self.state.winner, "Match task ended");
    }

    fn handle_input(&mut self, input: PlayerInput) {
        match input.msg {
            ClientMsg::JoinMatch { .. } => self.handle_join(input.user_id),
            ClientMsg::LeaveMatch => self.handle_leave(input.user_id),
            ClientMsg::Ping { t } => {
                let _ = self.broadcast_tx.send(ServerMsg::Pong { t });
            }
            msg => {
                if self.state.phase == MatchPhase::Paused {
                    self.send_error(input.user_id, ActionError::MatchPaused);
                    return;
                }
                let result = if msg_is_pf2(&msg) {
                    pf2_actions::dispatch(&mut self.state, self.roller.as_mut(), input.user_id, &msg)
                } else {
                    actions::dispatch(&mut self.state, self.roller.as_mut(), input.user_id, &msg)
                };
                match result {
                    Ok(events) => self.commit(events),
                    Err(e) => self.send_error(input.user_id, e),
                }
            }
        }
    }

    fn handle_join(&mut self, user_id: Uuid) {
        let Some(p) = self.state.participant_mut(user_id) else {
            self.send_error(user_id, ActionError::NotInMatch);
            return;
        };
        p.connected = true;
        let info = p.info();
        self.update_player_count();

        let _ = self.broadcast_tx.send(ServerMsg::PlayerJoined { player: info });
        let players: Vec<ParticipantInfo> =
            self.state.participants.iter().map(|p| p.info()).collect();
        let _ = self.broadcast_tx.send(ServerMsg::MatchJoined {
            match_id: self.state.id,
            ruleset: self.state.ruleset,
            players,
        });

        info!(match_id = %self.state.id, user_id = %user_id, "Player attached to match");

        let all_connected = self.state.participants.iter().all(|p| p.connected);
        if self.state.phase == MatchPhase::Waiting && all_connected {
            self.state.start();
        } else if self.state.phase == MatchPhase::Paused && all_connected {
            self.state.phase = MatchPhase::Active;
            let name = self.state.display_name(user_id).to_string();
            self.state.push_log(format!("{name} reconnected, match resumes"));
        }
        self.commit(Vec::new());
    }

    fn handle_leave(&mut self, user_id: Uuid) {
        let Some(p) = self.state.participant_mut(user_id) else {
            return;
        };
        if p.is_bot {
            return;
        }
        p.connected = false;
        self.update_player_count();

        let _ = self.broadcast_tx.send(ServerMsg::PlayerLeft {
            user_id,
            reason: "disconnected".to_string(),
        });
        info!(match_id = %self.state.id, user_id = %user_id, "Player detached from match");

        if self.state.phase == MatchPhase::Active {
            self.state.phase = MatchPhase::Paused;
            let name = self.state.display_name(user_id).to_string();
            self.state
                .push_log(format!("{name} disconnected, match paused"));
        }
        self.commit(Vec::new());
    }

    fn update_player_count(&self) {
        let n = self.state.participants.iter().filter(|p| p.connected).count();
        self.player_count
            .store(n, std::sync::atomic::Ordering::Relaxed);
    }

    fn send_error(&self, to: Uuid, err: ActionError) {
        let _ = self.broadcast_tx.send(ServerMsg::Error {
            to,
            code: err.code().to_string(),
            message: err.to_string(),
        });
    }

    /// Publish the outcome of a committed mutation: victory check, persist,
    /// snapshot broadcast, event fan-out, then re-arm timers.
    fn commit(&mut self, events: Vec<OutEvent>) {
        self.state.check_victory();
        self.persist();

        let snapshot = MatchSnapshot::of(&self.state);
        let _ = self.broadcast_tx.send(ServerMsg::MatchState { snapshot });

        for event in events {
            let msg = match event {
                OutEvent::Effect {
                    effect,
                    actor,
                    target,
                    cell,
                    magnitude,
                } => {
                    let (x, y) = self.state.topology.to_world(cell);
                    ServerMsg::VisualEffect {
                        effect,
                        actor_id: actor,
                        target_id: target,
                        position: WorldPos { x, y },
                        magnitude,
                    }
                }
                OutEvent::Prompt { to, prompt } => ServerMsg::PendingAction { to, prompt },
            };
            let _ = self.broadcast_tx.send(msg);
        }

        self.schedule();
    }

    /// Re-derive both timers from the current focus. Clearing before
    /// re-arming makes every commit a cancellation point for stale work.
    fn schedule(&mut self) {
        self.bot_at = None;
        self.wait_at = None;
        if self.state.phase != MatchPhase::Active {
            return;
        }

        match &self.state.focus {
            Focus::AwaitingDefense(pd) => {
                let delay = if self.state.is_bot(pd.defender) {
                    BOT_PROMPT_DELAY
                } else {
                    DEFENSE_TIMEOUT
                };
                self.wait_at = Some(Instant::now() + delay);
            }
            Focus::AwaitingReaction(pr) => {
                let delay = if self.state.is_bot(pr.reactor) {
                    BOT_PROMPT_DELAY
                } else {
                    REACTION_TIMEOUT
                };
                self.wait_at = Some(Instant::now() + delay);
            }
            _ => {
                if self.state.is_bot(self.state.active_turn) {
                    self.bot_at = Some(Instant::now() + BOT_TURN_DELAY);
                }
            }
        }
    }

    fn fire_deadline(&mut self) {
        let now = Instant::now();
        if self.wait_at.is_some_and(|at| at <= now) {
            self.wait_at = None;
            self.resolve_wait();
        } else if self.bot_at.is_some_and(|at| at <= now) {
            self.bot_at = None;
            self.run_bot_turn();
        }
    }

    /// A defense or reaction window expired (or its owner is a bot).
    fn resolve_wait(&mut self) {
        match self.state.focus.clone() {
            Focus::AwaitingDefense(pd) => {
                let choice = if self.state.is_bot(pd.defender) {
                    bot::choose_defense(&self.state, &pd)
                } else {
                    // Humans who let the clock run out dodge in place.
                    actions::default_defense()
                };
                match actions::resolve_defense(
                    &mut self.state,
                    self.roller.as_mut(),
                    pd.defender,
                    choice,
                ) {
                    Ok(events) => self.commit(events),
                    Err(e) => {
                        warn!(match_id = %self.state.id, error = %e, "Timed-out defense failed");
                        self.commit(Vec::new());
                    }
                }
            }
            Focus::AwaitingReaction(pr) => {
                let accept = self.state.is_bot(pr.reactor) && bot::accept_reaction(&self.state, &pr);
                let result = match pr.kind {
                    ReactionKind::CloseCombatExit => actions::resolve_close_combat_exit(
                        &mut self.state,
                        self.roller.as_mut(),
                        accept,
                    ),
                    ReactionKind::OpportunityStrike => {
                        pf2_actions::resolve_reaction(&mut self.state, self.roller.as_mut(), accept)
                    }
                };
                match result {
                    Ok(events) => self.commit(events),
                    Err(e) => {
                        warn!(match_id = %self.state.id, error = %e, "Timed-out reaction failed");
                        self.commit(Vec::new());
                    }
                }
            }
            _ => {}
        }
    }

    /// Plan and execute one bot turn through the normal dispatch path.
    fn run_bot_turn(&mut self) {
        let bot_id = self.state.active_turn;
        if !self.state.is_bot(bot_id) || self.state.phase != MatchPhase::Active {
            return;
        }

        let plan = bot::plan_turn(&self.state, bot_id);
        let mut events = Vec::new();
        let mut turn_over = false;
        for msg in plan {
            if self.state.phase != MatchPhase::Active || self.state.active_turn != bot_id {
                turn_over = true;
                break;
            }
            if self.state.focus.pending_defense().is_some()
                || self.state.focus.pending_reaction().is_some()
            {
                // An attack opened a decision window; the turn resumes
                // after it resolves.
                turn_over = true;
                break;
            }
            let result = if msg_is_pf2(&msg) {
                pf2_actions::dispatch(&mut self.state, self.roller.as_mut(), bot_id, &msg)
            } else {
                actions::dispatch(&mut self.state, self.roller.as_mut(), bot_id, &msg)
            };
            match result {
                Ok(mut ev) => events.append(&mut ev),
                Err(e) => {
                    warn!(match_id = %self.state.id, bot = %bot_id, error = %e, "Bot action rejected");
                }
            }
        }

        // A bot turn never stalls the match: if the plan did not hand the
        // turn off or open a window, force the turn to end.
        if !turn_over
            && self.state.phase == MatchPhase::Active
            && self.state.active_turn == bot_id
            && self.state.focus.pending_defense().is_none()
            && self.state.focus.pending_reaction().is_none()
        {
            if actions::dispatch(&mut self.state, self.roller.as_mut(), bot_id, &ClientMsg::EndTurn)
                .is_err()
            {
                self.state.advance_turn(self.roller.as_mut());
            }
        }

        self.commit(events);
    }

    /// Fire-and-forget persistence of the current snapshot.
    fn persist(&self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let snapshot = MatchSnapshot::of(&self.state);
        let finished = self.state.phase == MatchPhase::Finished;
        let winner = self.state.winner;
        tokio::spawn(async move {
            if let Err(e) = store.save_snapshot(&snapshot).await {
                warn!(match_id = %snapshot.match_id, error = %e, "Failed to persist match state");
            }
            if finished {
                if let Err(e) = store.record_result(snapshot.match_id, winner).await {
                    warn!(match_id = %snapshot.match_id, error = %e, "Failed to record match result");
                }
            }
        });
    }
}

/// Whether a message belongs to the DC-based ruleset's action surface.
fn msg_is_pf2(msg: &ClientMsg) -> bool {
    matches!(
        msg,
        ClientMsg::Pf2Stride { .. }
            | ClientMsg::Pf2Step { .. }
            | ClientMsg::Pf2DropProne
            | ClientMsg::Pf2Stand
            | ClientMsg::Pf2Strike { .. }
            | ClientMsg::Pf2RaiseShield
            | ClientMsg::Pf2CastSpell { .. }
            | ClientMsg::Pf2Trip { .. }
            | ClientMsg::Pf2Feint { .. }
            | ClientMsg::Pf2Demoralize { .. }
            | ClientMsg::Pf2Reaction { .. }
    )
}

#[cfg(test)]
pub(crate) fn duel(ruleset: RulesetId) -> MatchState {
    use crate::rules::character::{stock_gurps_fighter, stock_pf2_fighter};
    use crate::rules::dice::SequenceRoller;

    let a = Uuid::from_u128(1);
    let b = Uuid::from_u128(2);
    let topology = ruleset.topology();
    let pos_a = Cell::new(4, 4);
    let pos_b = Cell::new(5, 4);
    let sheet = |name: &str| match ruleset {
        RulesetId::Gurps => stock_gurps_fighter(name),
        RulesetId::Pf2 => stock_pf2_fighter(name),
    };
    let seeds = vec![
        CombatantSeed {
            user_id: a,
            display_name: "Kira".to_string(),
            is_bot: false,
            sheet: sheet("Kira"),
            position: pos_a,
            facing: topology.direction_towards(pos_a, pos_b),
        },
        CombatantSeed {
            user_id: b,
            display_name: "Dorn".to_string(),
            is_bot: false,
            sheet: sheet("Dorn"),
            position: pos_b,
            facing: topology.direction_towards(pos_b, pos_a),
        },
    ];
    // High first roll: seat 1 wins initiative on either ruleset.
    let mut roller = SequenceRoller::new(&[6, 1]);
    let mut state = MatchState::new(
        Uuid::from_u128(99),
        7,
        ruleset,
        TerrainMap::open(16, 16),
        seeds,
        &mut roller,
    );
    state.participants.iter_mut().for_each(|p| p.connected = true);
    state.start();
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::dice::SequenceRoller;

    #[test]
    fn initiative_orders_turns_highest_first() {
        let state = duel(RulesetId::Gurps);
        assert_eq!(state.turn_order[0], Uuid::from_u128(1));
        assert_eq!(state.active_turn, Uuid::from_u128(1));
        assert_eq!(state.round, 1);
        assert_eq!(state.phase, MatchPhase::Active);
    }

    #[test]
    fn advance_turn_skips_defeated_and_wraps_round() {
        let mut state = duel(RulesetId::Gurps);
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let mut roller = SequenceRoller::new(&[]);

        state.advance_turn(&mut roller);
        assert_eq!(state.active_turn, b);
        assert_eq!(state.round, 1);

        state.advance_turn(&mut roller);
        assert_eq!(state.active_turn, a);
        assert_eq!(state.round, 2);

        // With b defeated the rotation comes straight back to a.
        state.combatants.get_mut(&b).unwrap().defeated = true;
        state.advance_turn(&mut roller);
        assert_eq!(state.active_turn, a);
        assert_eq!(state.round, 3);
    }

    #[test]
    fn victory_goes_to_the_last_one_standing() {
        let mut state = duel(RulesetId::Gurps);
        let b = Uuid::from_u128(2);
        assert!(!state.check_victory());

        state.combatants.get_mut(&b).unwrap().defeated = true;
        assert!(state.check_victory());
        assert_eq!(state.phase, MatchPhase::Finished);
        assert_eq!(state.winner, Some(Uuid::from_u128(1)));

        // Already finished; the second call is a no-op.
        assert!(!state.check_victory());
    }

    #[test]
    fn dying_recovery_runs_as_the_turn_passes() {
        let mut state = duel(RulesetId::Pf2);
        let b = Uuid::from_u128(2);
        {
            let c = state.combatants.get_mut(&b).unwrap();
            c.defeated = true;
            c.current_hp = 0;
            c.rules.pf2_mut().unwrap().dying = 2;
        }
        // d20 = 15 beats DC 12: dying drops to 1.
        let mut roller = SequenceRoller::new(&[15]);
        state.advance_turn(&mut roller);
        assert_eq!(state.combatants[&b].rules.pf2().unwrap().dying, 1);

        // Next rotation: d20 = 2 misses DC 11, dying climbs back to 2.
        let mut roller = SequenceRoller::new(&[2]);
        state.advance_turn(&mut roller);
        assert_eq!(state.combatants[&b].rules.pf2().unwrap().dying, 2);
    }

    #[test]
    fn a_bot_turn_that_goes_nowhere_still_hands_the_turn_off() {
        use crate::rules::dice::SequenceRoller;
        use crate::rules::Maneuver;

        let mut state = duel(RulesetId::Gurps);
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        state
            .participants
            .iter_mut()
            .find(|p| p.user_id == a)
            .unwrap()
            .is_bot = true;
        // A maneuver is already locked in, so the bot's whole plan (select
        // Attack, then swing) is rejected message by message.
        state
            .combatants
            .get_mut(&a)
            .unwrap()
            .rules
            .gurps_mut()
            .unwrap()
            .maneuver = Some(Maneuver::DoNothing);

        let (mut game, _handle) = GameMatch::new(state, Box::new(SequenceRoller::new(&[])), None);
        game.run_bot_turn();

        // The forced end-of-turn rotated to the other seat exactly once.
        assert_eq!(game.state.active_turn, b);
        assert_eq!(game.state.round, 1);
        assert_eq!(game.state.phase, MatchPhase::Active);
        assert!(matches!(game.state.focus, Focus::Idle));
    }

    #[test]
    fn log_is_append_only() {
        let mut state = duel(RulesetId::Gurps);
        let before = state.log.len();
        for i in 0..500 {
            state.push_log(format!("line {i}"));
        }
        assert_eq!(state.log.len(), before + 500);
        assert!(state.log.last().unwrap().contains("499"));
    }
}
