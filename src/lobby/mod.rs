//! Lobby modules - queueing and match formation

pub mod queue;
pub mod service;

pub use queue::QueuedPlayer;
pub use service::{LobbyError, LobbyService};
