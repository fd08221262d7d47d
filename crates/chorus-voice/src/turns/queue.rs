//! Priority turn queue for one room.
//!
//! Ordering invariant: entries are sorted by priority descending, ties
//! broken by creation time ascending (FIFO within a priority band). The
//! queue holds only *pending* requests — the active turn lives beside it.

use serde::{Deserialize, Serialize};

use super::types::TurnRequest;

/// Queue snapshot for one room. Cloned into `QueueUpdated` events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnQueueState {
    pub queue: Vec<TurnRequest>,
    pub active_turn: Option<TurnRequest>,
    pub total_processed: u64,
    pub total_expired: u64,
}

impl TurnQueueState {
    /// Insert a pending request at its sorted position and renumber.
    pub fn insert(&mut self, request: TurnRequest) {
        let at = self
            .queue
            .iter()
            .position(|queued| queued.priority < request.priority)
            .unwrap_or(self.queue.len());
        self.queue.insert(at, request);
        self.recompute_positions();
    }

    /// Remove a pending request by id and renumber. Returns the removed
    /// entry, or `None` if no such request is queued.
    pub fn remove(&mut self, request_id: &str) -> Option<TurnRequest> {
        let at = self.queue.iter().position(|q| q.id == request_id)?;
        let removed = self.queue.remove(at);
        self.recompute_positions();
        Some(removed)
    }

    /// Take the highest-priority pending request off the queue.
    pub fn pop_next(&mut self) -> Option<TurnRequest> {
        if self.queue.is_empty() {
            return None;
        }
        let next = self.queue.remove(0);
        self.recompute_positions();
        Some(next)
    }

    /// Find the pending entry for a peer, if any.
    pub fn find_peer(&self, peer_id: &str) -> Option<&TurnRequest> {
        self.queue.iter().find(|q| q.peer_id == peer_id)
    }

    /// Whether this peer currently holds the active turn.
    pub fn is_active_peer(&self, peer_id: &str) -> bool {
        self.active_turn
            .as_ref()
            .is_some_and(|t| t.peer_id == peer_id)
    }

    /// 1-based queue position for a peer; 0 for the active speaker or a
    /// peer with no pending entry.
    pub fn position_of(&self, peer_id: &str) -> usize {
        if self.is_active_peer(peer_id) {
            return 0;
        }
        self.find_peer(peer_id).map(|q| q.position).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn recompute_positions(&mut self) {
        for (idx, queued) in self.queue.iter_mut().enumerate() {
            queued.position = idx + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn request(peer: &str, priority: i32) -> TurnRequest {
        TurnRequest {
            id: format!("req-{peer}"),
            peer_id: peer.to_string(),
            peer_display_name: peer.to_uppercase(),
            room_id: "r1".to_string(),
            created_at: Utc::now(),
            expires_at: None,
            position: 0,
            priority,
        }
    }

    fn peer_order(q: &TurnQueueState) -> Vec<&str> {
        q.queue.iter().map(|r| r.peer_id.as_str()).collect()
    }

    #[test]
    fn insert_orders_by_priority_desc() {
        let mut q = TurnQueueState::default();
        q.insert(request("low", 0));
        q.insert(request("high", 10));
        q.insert(request("mid", 5));
        assert_eq!(peer_order(&q), vec!["high", "mid", "low"]);
    }

    #[test]
    fn insert_is_fifo_within_priority_band() {
        let mut q = TurnQueueState::default();
        q.insert(request("first", 1));
        q.insert(request("second", 1));
        q.insert(request("third", 1));
        assert_eq!(peer_order(&q), vec!["first", "second", "third"]);
    }

    #[test]
    fn positions_are_one_based_and_contiguous() {
        let mut q = TurnQueueState::default();
        q.insert(request("a", 0));
        q.insert(request("b", 3));
        q.insert(request("c", 0));
        let positions: Vec<usize> = q.queue.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
    }

    #[test]
    fn remove_renumbers_remaining_entries() {
        let mut q = TurnQueueState::default();
        q.insert(request("a", 0));
        q.insert(request("b", 0));
        q.insert(request("c", 0));

        let removed = q.remove("req-b").unwrap();
        assert_eq!(removed.peer_id, "b");
        assert_eq!(peer_order(&q), vec!["a", "c"]);
        assert_eq!(q.queue[1].position, 2);

        assert!(q.remove("req-b").is_none());
    }

    #[test]
    fn pop_next_takes_highest_priority() {
        let mut q = TurnQueueState::default();
        q.insert(request("low", 0));
        q.insert(request("high", 7));

        let next = q.pop_next().unwrap();
        assert_eq!(next.peer_id, "high");
        assert_eq!(q.len(), 1);
        assert_eq!(q.queue[0].position, 1);

        q.pop_next().unwrap();
        assert!(q.pop_next().is_none());
    }

    #[test]
    fn position_of_active_and_absent_is_zero() {
        let mut q = TurnQueueState::default();
        q.active_turn = Some(request("owner", 0));
        q.insert(request("waiting", 0));

        assert_eq!(q.position_of("owner"), 0);
        assert_eq!(q.position_of("stranger"), 0);
        assert_eq!(q.position_of("waiting"), 1);
    }

    #[test]
    fn find_peer_ignores_active_turn() {
        let mut q = TurnQueueState::default();
        q.active_turn = Some(request("owner", 0));
        assert!(q.find_peer("owner").is_none());
        assert!(q.is_active_peer("owner"));
    }
}
