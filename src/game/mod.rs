//! Game simulation modules

pub mod actions;
pub mod bot;
pub mod grid;
pub mod map;
pub mod r#match;
pub mod pf2_actions;
pub mod snapshot;

pub use r#match::{CombatantSeed, GameMatch, MatchHandle, MatchRegistry, MatchState};

use uuid::Uuid;

use crate::ws::protocol::{ClientMsg, EffectKind, PendingPrompt};
use grid::Cell;

/// Player input received from WebSocket
#[derive(Debug, Clone)]
pub struct PlayerInput {
    pub user_id: Uuid,
    pub msg: ClientMsg,
    pub received_at: u64,
}

/// Side effects produced by a committed action, translated to `ServerMsg`
/// by the match task.
#[derive(Debug, Clone)]
pub enum OutEvent {
    /// Presentation event anchored to a grid cell.
    Effect {
        effect: EffectKind,
        actor: Uuid,
        target: Option<Uuid>,
        cell: Cell,
        magnitude: i32,
    },
    /// A decision is required from a specific player.
    Prompt { to: Uuid, prompt: PendingPrompt },
}
