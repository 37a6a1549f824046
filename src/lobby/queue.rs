//! Lobby queue implementation

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::rules::RulesetId;

/// Player waiting for a match
#[derive(Debug, Clone)]
pub struct QueuedPlayer {
    pub user_id: Uuid,
    pub display_name: String,
    pub ruleset: RulesetId,
    /// Sheet to fight with; `None` falls back to the stock fighter.
    pub character_id: Option<Uuid>,
    pub queued_at: Instant,
}

impl QueuedPlayer {
    pub fn new(
        user_id: Uuid,
        display_name: String,
        ruleset: RulesetId,
        character_id: Option<Uuid>,
    ) -> Self {
        Self {
            user_id,
            display_name,
            ruleset,
            character_id,
            queued_at: Instant::now(),
        }
    }

    /// How long this player has been waiting
    pub fn wait_time(&self) -> Duration {
        self.queued_at.elapsed()
    }
}

/// A per-ruleset queue. Players of the two rule systems never mix.
pub struct MatchQueue {
    queue: VecDeque<QueuedPlayer>,
    /// Minimum combatants for a match; shortfalls are padded with bots.
    min_players: usize,
    /// Maximum combatants per match
    max_players: usize,
    /// Max time to wait before starting short-handed
    max_wait_time: Duration,
}

impl MatchQueue {
    pub fn new(min_players: usize, max_players: usize, max_wait_secs: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            min_players,
            max_players,
            max_wait_time: Duration::from_secs(max_wait_secs),
        }
    }

    /// Add a player to the queue
    pub fn enqueue(&mut self, player: QueuedPlayer) {
        // Remove if already in queue (rejoin)
        self.queue.retain(|p| p.user_id != player.user_id);
        self.queue.push_back(player);
    }

    /// Remove a player from the queue
    pub fn dequeue(&mut self, user_id: Uuid) -> Option<QueuedPlayer> {
        if let Some(pos) = self.queue.iter().position(|p| p.user_id == user_id) {
            self.queue.remove(pos)
        } else {
            None
        }
    }

    /// Check if a player is in the queue
    pub fn contains(&self, user_id: &Uuid) -> bool {
        self.queue.iter().any(|p| &p.user_id == user_id)
    }

    /// Get queue length
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Try to form a match from queued players. Returns the players to seat,
    /// or None if not enough yet. A queue whose front has waited past the
    /// limit starts anyway; the lobby pads it to minimum with bots.
    pub fn try_form_match(&mut self) -> Option<Vec<QueuedPlayer>> {
        if self.queue.len() >= self.min_players {
            let count = self.queue.len().min(self.max_players);
            return Some(self.queue.drain(..count).collect());
        }

        let oldest_wait = self.queue.front().map(|p| p.wait_time())?;
        if oldest_wait >= self.max_wait_time {
            return Some(self.queue.drain(..).collect());
        }

        None
    }

    /// Get min players setting
    pub fn min_players(&self) -> usize {
        self.min_players
    }
}

impl Default for MatchQueue {
    fn default() -> Self {
        Self::new(2, 4, 15) // duels up to four-way brawls, 15 second max wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn player(n: u128) -> QueuedPlayer {
        QueuedPlayer::new(
            Uuid::from_u128(n),
            format!("player-{n}"),
            RulesetId::Gurps,
            None,
        )
    }

    #[test]
    fn enqueue_replaces_a_rejoining_player() {
        let mut q = MatchQueue::default();
        q.enqueue(player(1));
        q.enqueue(player(2));
        q.enqueue(player(1));
        assert_eq!(q.len(), 2);
        // Rejoining moved them to the back.
        assert_eq!(q.queue.back().unwrap().user_id, Uuid::from_u128(1));
    }

    #[test]
    fn forms_a_match_at_minimum_size() {
        let mut q = MatchQueue::new(2, 4, 15);
        q.enqueue(player(1));
        assert!(q.try_form_match().is_none());
        q.enqueue(player(2));
        let players = q.try_form_match().unwrap();
        assert_eq!(players.len(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn a_full_queue_caps_at_max_players() {
        let mut q = MatchQueue::new(2, 4, 15);
        for n in 1..=6 {
            q.enqueue(player(n));
        }
        let players = q.try_form_match().unwrap();
        assert_eq!(players.len(), 4);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn a_long_wait_starts_short_handed() {
        let mut q = MatchQueue::new(2, 4, 15);
        let mut lonely = player(1);
        lonely.queued_at = Instant::now() - Duration::from_secs(20);
        q.enqueue(lonely);
        let players = q.try_form_match().unwrap();
        assert_eq!(players.len(), 1);
    }

    #[test]
    fn dequeue_removes_only_the_named_player() {
        let mut q = MatchQueue::default();
        q.enqueue(player(1));
        q.enqueue(player(2));
        assert!(q.dequeue(Uuid::from_u128(1)).is_some());
        assert!(!q.contains(&Uuid::from_u128(1)));
        assert!(q.contains(&Uuid::from_u128(2)));
    }
}
