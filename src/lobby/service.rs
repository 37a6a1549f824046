//! Lobby service - manages queues and match creation
//!
//! One queue per ruleset. A periodic tick forms matches, loads character
//! sheets, seeds combatants on the arena, rolls initiative and spawns the
//! match task. Short queues that waited past the limit get padded to the
//! minimum with bot combatants.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::game::grid::Cell;
use crate::game::map::TerrainMap;
use crate::game::{CombatantSeed, GameMatch, MatchRegistry, MatchState};
use crate::rules::character::CharacterSheet;
use crate::rules::dice::DiceRoller;
use crate::rules::RulesetId;
use crate::store::characters::stock_sheet;
use crate::store::{CharacterStore, MatchStore};

use super::queue::{MatchQueue, QueuedPlayer};

/// Spawn cells on the standard 16x16 arena, facing the center.
const SPAWN_CELLS: [(i32, i32); 4] = [(3, 8), (12, 8), (8, 3), (8, 12)];

/// Lobby errors reported to the joining client.
#[derive(Debug, thiserror::Error)]
pub enum LobbyError {
    #[error("already seated in an active match")]
    AlreadySeated,
}

/// Lobby service
pub struct LobbyService {
    registry: Arc<MatchRegistry>,
    characters: Option<CharacterStore>,
    matches: Option<MatchStore>,
    gurps_queue: Mutex<MatchQueue>,
    pf2_queue: Mutex<MatchQueue>,
}

impl LobbyService {
    pub fn new(
        registry: Arc<MatchRegistry>,
        characters: Option<CharacterStore>,
        matches: Option<MatchStore>,
    ) -> Self {
        Self {
            registry,
            characters,
            matches,
            gurps_queue: Mutex::new(MatchQueue::default()),
            pf2_queue: Mutex::new(MatchQueue::default()),
        }
    }

    fn queue_for(&self, ruleset: RulesetId) -> &Mutex<MatchQueue> {
        match ruleset {
            RulesetId::Gurps => &self.gurps_queue,
            RulesetId::Pf2 => &self.pf2_queue,
        }
    }

    /// Join the queue for a ruleset. Re-joining moves the player to the back.
    pub async fn join_queue(&self, player: QueuedPlayer) -> Result<usize, LobbyError> {
        if self.registry.match_for_player(&player.user_id).is_some() {
            return Err(LobbyError::AlreadySeated);
        }
        let user_id = player.user_id;
        let ruleset = player.ruleset;
        let mut queue = self.queue_for(ruleset).lock().await;
        queue.enqueue(player);
        let size = queue.len();
        info!(user_id = %user_id, %ruleset, queue_size = size, "Player joined lobby queue");
        Ok(size)
    }

    /// Leave whichever queue the player is in.
    pub async fn leave_queue(&self, user_id: Uuid) {
        self.gurps_queue.lock().await.dequeue(user_id);
        self.pf2_queue.lock().await.dequeue(user_id);
    }

    /// Total players waiting across both queues.
    pub async fn queue_size(&self) -> usize {
        self.gurps_queue.lock().await.len() + self.pf2_queue.lock().await.len()
    }

    pub async fn is_in_queue(&self, user_id: &Uuid) -> bool {
        self.gurps_queue.lock().await.contains(user_id)
            || self.pf2_queue.lock().await.contains(user_id)
    }

    /// Run the lobby service (periodic queue processing)
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(500));
        loop {
            interval.tick().await;
            for ruleset in [RulesetId::Gurps, RulesetId::Pf2] {
                let formed = self.queue_for(ruleset).lock().await.try_form_match();
                if let Some(players) = formed {
                    self.create_match(ruleset, players).await;
                }
            }
        }
    }

    /// Create and spawn a match for the given players.
    async fn create_match(&self, ruleset: RulesetId, players: Vec<QueuedPlayer>) {
        let match_id = Uuid::new_v4();
        let seed = rand::random::<u64>();
        let min_players = self.queue_for(ruleset).lock().await.min_players();

        let mut sheets = Vec::with_capacity(players.len());
        for p in &players {
            let sheet = match &self.characters {
                Some(store) => {
                    store
                        .load_character(p.character_id, ruleset, &p.display_name)
                        .await
                }
                None => stock_sheet(ruleset, &p.display_name),
            };
            sheets.push(sheet);
        }

        let seeds = build_seeds(ruleset, &players, sheets, min_players);
        let human_ids: Vec<Uuid> = players.iter().map(|p| p.user_id).collect();

        let mut roller = DiceRoller::seeded(seed);
        let state = MatchState::new(
            match_id,
            seed,
            ruleset,
            TerrainMap::standard_arena(),
            seeds,
            &mut roller,
        );
        let (game_match, handle) = GameMatch::new(state, Box::new(roller), self.matches.clone());

        self.registry.insert(handle, &human_ids);
        info!(
            match_id = %match_id,
            %ruleset,
            player_count = human_ids.len(),
            "Created new match"
        );

        let registry = self.registry.clone();
        tokio::spawn(async move {
            game_match.run().await;
            registry.remove(&match_id);
            info!(match_id = %match_id, "Match removed from registry");
        });
    }
}

/// Seat players (and bot filler up to the minimum) on the arena.
fn build_seeds(
    ruleset: RulesetId,
    players: &[QueuedPlayer],
    sheets: Vec<CharacterSheet>,
    min_players: usize,
) -> Vec<CombatantSeed> {
    let topology = ruleset.topology();
    let center = Cell::new(8, 8);
    let mut seeds = Vec::new();

    for (p, sheet) in players.iter().zip(sheets) {
        let (x, y) = SPAWN_CELLS[seeds.len() % SPAWN_CELLS.len()];
        let position = Cell::new(x, y);
        seeds.push(CombatantSeed {
            user_id: p.user_id,
            display_name: p.display_name.clone(),
            is_bot: false,
            sheet,
            position,
            facing: topology.direction_towards(position, center),
        });
    }

    let mut bot_number = 0;
    while seeds.len() < min_players {
        bot_number += 1;
        let name = if bot_number == 1 {
            "Sparring Bot".to_string()
        } else {
            format!("Sparring Bot {bot_number}")
        };
        let (x, y) = SPAWN_CELLS[seeds.len() % SPAWN_CELLS.len()];
        let position = Cell::new(x, y);
        seeds.push(CombatantSeed {
            user_id: Uuid::new_v4(),
            display_name: name.clone(),
            is_bot: true,
            sheet: stock_sheet(ruleset, &name),
            position,
            facing: topology.direction_towards(position, center),
        });
        warn!(%ruleset, bot = %name, "Padding short-handed match with a bot");
    }

    seeds
}
