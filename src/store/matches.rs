//! Match persistence
//!
//! Every committed mutation upserts the full snapshot keyed on the match id,
//! so a crashed server can offer resume and finished matches stay reviewable.
//! Writes are spawned fire-and-forget by the match task.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::game::r#match::MatchPhase;
use crate::game::snapshot::MatchSnapshot;
use crate::rules::RulesetId;

use super::supabase::{SupabaseClient, SupabaseError};

/// Row shape of the `matches` table.
#[derive(Debug, Clone, Serialize)]
struct MatchRow<'a> {
    id: Uuid,
    ruleset: RulesetId,
    phase: MatchPhase,
    state: &'a MatchSnapshot,
    updated_at: DateTime<Utc>,
}

/// Final-result columns patched once when a match finishes.
#[derive(Debug, Clone, Serialize)]
struct MatchResult {
    phase: MatchPhase,
    winner_user_id: Option<Uuid>,
    finished_at: DateTime<Utc>,
}

/// Match store operations
#[derive(Clone)]
pub struct MatchStore {
    client: SupabaseClient,
}

impl MatchStore {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }

    /// Upsert the full match snapshot, keyed on the match id.
    pub async fn save_snapshot(&self, snapshot: &MatchSnapshot) -> Result<(), SupabaseError> {
        let row = MatchRow {
            id: snapshot.match_id,
            ruleset: snapshot.ruleset,
            phase: snapshot.phase,
            state: snapshot,
            updated_at: Utc::now(),
        };
        self.client.upsert("matches", &row, "id").await
    }

    /// Record the final outcome of a finished match.
    pub async fn record_result(
        &self,
        match_id: Uuid,
        winner: Option<Uuid>,
    ) -> Result<(), SupabaseError> {
        let query = format!("id=eq.{match_id}");
        let result = MatchResult {
            phase: MatchPhase::Finished,
            winner_user_id: winner,
            finished_at: Utc::now(),
        };
        self.client.update("matches", &query, &result).await
    }
}
