//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::MatchRegistry;
use crate::lobby::LobbyService;
use crate::store::{CharacterStore, MatchStore, SupabaseClient};
use crate::util::rate_limit::{create_limiter, Limiter, LOBBY_RATE_LIMIT};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub lobby: Arc<LobbyService>,
    pub registry: Arc<MatchRegistry>,
    pub join_limiter: Arc<Limiter>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);

        let supabase = SupabaseClient::new(&config);
        let character_store = CharacterStore::new(supabase.clone());
        let match_store = MatchStore::new(supabase);

        let registry = Arc::new(MatchRegistry::new());
        let lobby = Arc::new(LobbyService::new(
            registry.clone(),
            Some(character_store),
            Some(match_store),
        ));

        Self {
            config,
            lobby,
            registry,
            join_limiter: create_limiter(LOBBY_RATE_LIMIT),
        }
    }
}
