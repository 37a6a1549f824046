//! Character sheet loading
//!
//! Sheets are authored outside this server and stored as a JSON column in
//! the `characters` table. A missing or malformed sheet never blocks a
//! match from forming: the lobby falls back to a stock fighter.

use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::rules::character::{stock_gurps_fighter, stock_pf2_fighter, CharacterSheet};
use crate::rules::RulesetId;

use super::supabase::{SupabaseClient, SupabaseError};

/// Sheet column of the `characters` table.
#[derive(Debug, Clone, Deserialize)]
struct CharacterRow {
    sheet: CharacterSheet,
}

/// Character store operations
#[derive(Clone)]
pub struct CharacterStore {
    client: SupabaseClient,
}

impl CharacterStore {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }

    /// Fetch a character sheet by ID, if one exists for the given ruleset.
    pub async fn get_character(
        &self,
        character_id: Uuid,
        ruleset: RulesetId,
    ) -> Result<Option<CharacterSheet>, SupabaseError> {
        let query = format!("id=eq.{character_id}&select=sheet");
        let row: Option<CharacterRow> = self.client.get_one("characters", &query).await?;
        Ok(row
            .map(|r| r.sheet)
            .filter(|sheet| sheet.ruleset == ruleset))
    }

    /// Load the sheet a combatant will fight with. Falls back to the stock
    /// fighter for the ruleset when the row is missing, belongs to the other
    /// ruleset, or the store is unreachable.
    pub async fn load_character(
        &self,
        character_id: Option<Uuid>,
        ruleset: RulesetId,
        display_name: &str,
    ) -> CharacterSheet {
        if let Some(id) = character_id {
            match self.get_character(id, ruleset).await {
                Ok(Some(sheet)) => return sheet,
                Ok(None) => {
                    warn!(character_id = %id, %ruleset, "No usable character row, using stock sheet");
                }
                Err(e) => {
                    warn!(character_id = %id, error = %e, "Character load failed, using stock sheet");
                }
            }
        }
        stock_sheet(ruleset, display_name)
    }
}

/// The sheet bots and characterless players fight with.
pub fn stock_sheet(ruleset: RulesetId, name: &str) -> CharacterSheet {
    match ruleset {
        RulesetId::Gurps => stock_gurps_fighter(name),
        RulesetId::Pf2 => stock_pf2_fighter(name),
    }
}
