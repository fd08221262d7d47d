//! Turn arbiter — grants, queues, and revokes the AI voice channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chorus_common::{new_request_id, TurnDenied};

use super::types::{
    AiResponseState, ArbiterConfig, RoomAiState, TurnEvent, TurnRequest, VoiceMode, VoiceSettings,
    VoiceSettingsPatch,
};

/// `last_error` value set by the lock-safety release. Part of the client
/// contract.
pub const LOCK_TIMEOUT_ERROR: &str = "Lock timeout - safety release";

// ---------------------------------------------------------------------------
// Room entry
// ---------------------------------------------------------------------------

/// One room's AI state plus the timer handles guarding it.
struct RoomEntry {
    settings: VoiceSettings,
    ai: RoomAiState,
    /// Bumped on every lock-timer arm/clear; a fired timer whose epoch no
    /// longer matches lost the race and must not force-release.
    lock_epoch: u64,
    lock_timer: Option<JoinHandle<()>>,
    /// Queue-entry expiry timers keyed by request id.
    expiry_timers: HashMap<String, JoinHandle<()>>,
}

impl RoomEntry {
    fn new(settings: VoiceSettings) -> Self {
        Self {
            settings,
            ai: RoomAiState::new(),
            lock_epoch: 0,
            lock_timer: None,
            expiry_timers: HashMap::new(),
        }
    }

    fn clear_lock_timer(&mut self) {
        self.lock_epoch += 1;
        if let Some(handle) = self.lock_timer.take() {
            handle.abort();
        }
    }

    fn clear_expiry_timer(&mut self, request_id: &str) {
        if let Some(handle) = self.expiry_timers.remove(request_id) {
            handle.abort();
        }
    }

    fn clear_all_timers(&mut self) {
        self.clear_lock_timer();
        for (_, handle) in self.expiry_timers.drain() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct ArbiterState {
    rooms: HashMap<String, RoomEntry>,
}

// ---------------------------------------------------------------------------
// Turn Arbiter
// ---------------------------------------------------------------------------

/// Per-room turn-taking and locking state machine.
///
/// All mutations go through this type; the room map lives behind a single
/// lock, so operations on a room are totally ordered by call order.
/// Events are sent while the write guard is held, which keeps per-room
/// event delivery order identical to mutation order.
pub struct TurnArbiter {
    config: ArbiterConfig,
    state: Arc<RwLock<ArbiterState>>,
    /// Unbounded so emission never blocks a mutation.
    event_tx: mpsc::UnboundedSender<TurnEvent>,
}

impl TurnArbiter {
    pub fn new(config: ArbiterConfig) -> (Self, mpsc::UnboundedReceiver<TurnEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let arbiter = Self {
            config,
            state: Arc::new(RwLock::new(ArbiterState::default())),
            event_tx,
        };
        (arbiter, event_rx)
    }

    // -----------------------------------------------------------------------
    // Room lifecycle
    // -----------------------------------------------------------------------

    /// Register a room in `idle` with an empty queue. No-op if the room
    /// already exists — existing settings are preserved.
    pub async fn init_room(&self, room_id: &str, settings: Option<VoiceSettings>) {
        let mut state = self.state.write().await;
        if state.rooms.contains_key(room_id) {
            debug!(room_id, "room already initialized");
            return;
        }
        let settings = settings.unwrap_or_else(|| VoiceSettings::defaults_from(&self.config));
        state.rooms.insert(room_id.to_string(), RoomEntry::new(settings));
        info!(room_id, "voice room initialized");
    }

    /// Drop a room and every timer guarding it. Safe on unknown rooms.
    pub async fn remove_room(&self, room_id: &str) {
        let mut state = self.state.write().await;
        if let Some(mut entry) = state.rooms.remove(room_id) {
            entry.clear_all_timers();
            info!(room_id, "voice room removed");
        }
    }

    /// Merge a partial settings update into the room. Does not change the
    /// AI state; in-flight decisions always see the latest snapshot.
    pub async fn update_settings(&self, room_id: &str, patch: VoiceSettingsPatch) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.rooms.get_mut(room_id) else {
            return false;
        };
        patch.apply(&mut entry.settings);
        debug!(room_id, "voice settings updated");
        true
    }

    /// Remove every room and cancel every timer. Process shutdown path.
    pub async fn dispose(&self) {
        let mut state = self.state.write().await;
        for (_, mut entry) in state.rooms.drain() {
            entry.clear_all_timers();
        }
        info!("turn arbiter disposed");
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Whether `peer_id` could request a turn right now. Pure check, no
    /// side effects.
    pub async fn can_request_turn(&self, room_id: &str, peer_id: &str) -> Result<(), TurnDenied> {
        let state = self.state.read().await;
        let Some(entry) = state.rooms.get(room_id) else {
            return Err(TurnDenied::RoomNotFound);
        };
        Self::admit(entry, peer_id)
    }

    fn admit(entry: &RoomEntry, peer_id: &str) -> Result<(), TurnDenied> {
        if entry.settings.mode == VoiceMode::DesignatedSpeaker
            && !entry.settings.designated_speakers.contains(peer_id)
        {
            return Err(TurnDenied::NotDesignatedSpeaker);
        }
        if entry.ai.queue.is_active_peer(peer_id) {
            return Err(TurnDenied::AlreadyActive);
        }
        if entry.ai.queue.find_peer(peer_id).is_some() {
            return Err(TurnDenied::AlreadyQueued);
        }
        if entry.settings.max_queue_size > 0
            && entry.ai.queue.len() >= entry.settings.max_queue_size
        {
            return Err(TurnDenied::QueueFull);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Turn requests
    // -----------------------------------------------------------------------

    /// Request a turn for `peer_id`. Granted immediately when the AI is
    /// idle and unowned; queued otherwise. A repeat call while the peer
    /// still holds an unresolved request returns that same request.
    pub async fn request_turn(
        &self,
        room_id: &str,
        peer_id: &str,
        display_name: &str,
        priority: i32,
    ) -> Option<TurnRequest> {
        let mut state = self.state.write().await;
        let Some(entry) = state.rooms.get_mut(room_id) else {
            debug!(room_id, peer_id, "turn requested for unknown room");
            return None;
        };

        match Self::admit(entry, peer_id) {
            Ok(()) => {}
            // Idempotent retry: hand back the request the peer already holds.
            Err(TurnDenied::AlreadyActive) => return entry.ai.queue.active_turn.clone(),
            Err(TurnDenied::AlreadyQueued) => return entry.ai.queue.find_peer(peer_id).cloned(),
            Err(reason) => {
                debug!(room_id, peer_id, %reason, "turn request denied");
                return None;
            }
        }

        let now = Utc::now();
        let request = TurnRequest {
            id: new_request_id(),
            peer_id: peer_id.to_string(),
            peer_display_name: display_name.to_string(),
            room_id: room_id.to_string(),
            created_at: now,
            expires_at: None,
            position: 0,
            priority,
        };

        // Idle and unowned: grant without queueing. The state machine
        // itself does not move until start_listening.
        if entry.ai.state == AiResponseState::Idle && entry.ai.queue.active_turn.is_none() {
            entry.ai.queue.active_turn = Some(request.clone());
            info!(room_id, peer_id, "turn granted immediately");
            self.emit(TurnEvent::TurnStarted {
                room_id: room_id.to_string(),
                request: request.clone(),
            });
            return Some(request);
        }

        if !entry.settings.enable_queue {
            debug!(room_id, peer_id, "AI busy and queueing disabled");
            return None;
        }

        let timeout_ms = entry.settings.queue_timeout_ms;
        let mut request = request;
        request.expires_at = Some(now + ChronoDuration::milliseconds(timeout_ms as i64));
        entry.ai.queue.insert(request);
        let queued = entry.ai.queue.find_peer(peer_id).cloned()?;

        self.spawn_expiry_timer(entry, room_id, &queued.id, timeout_ms);
        info!(
            room_id,
            peer_id,
            position = queued.position,
            priority = queued.priority,
            "turn request queued"
        );
        self.emit(TurnEvent::QueueUpdated {
            room_id: room_id.to_string(),
            queue: entry.ai.queue.clone(),
        });
        Some(queued)
    }

    /// Cancel a queued request. Returns `false` if it is not queued
    /// (unknown room, unknown id, or already promoted).
    pub async fn cancel_request(&self, room_id: &str, request_id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.rooms.get_mut(room_id) else {
            return false;
        };
        let Some(removed) = entry.ai.queue.remove(request_id) else {
            return false;
        };
        entry.clear_expiry_timer(request_id);
        debug!(room_id, request_id, peer_id = %removed.peer_id, "turn request cancelled");
        self.emit(TurnEvent::QueueUpdated {
            room_id: room_id.to_string(),
            queue: entry.ai.queue.clone(),
        });
        true
    }

    /// 1-based queue position; 0 for the active speaker, an unknown peer,
    /// or an unknown room.
    pub async fn queue_position(&self, room_id: &str, peer_id: &str) -> usize {
        let state = self.state.read().await;
        state
            .rooms
            .get(room_id)
            .map(|entry| entry.ai.queue.position_of(peer_id))
            .unwrap_or(0)
    }

    /// Manually promote the next queued request. Same logic as the
    /// automatic promotion after `finish_speaking`/`unlock`.
    pub async fn process_next_in_queue(&self, room_id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.rooms.get_mut(room_id) else {
            return false;
        };
        self.promote_next(entry, room_id)
    }

    // -----------------------------------------------------------------------
    // State machine transitions
    // -----------------------------------------------------------------------

    /// `idle → listening`. Only the active turn holder may open the mic.
    pub async fn start_listening(&self, room_id: &str, peer_id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.rooms.get_mut(room_id) else {
            return false;
        };
        if entry.ai.state != AiResponseState::Idle {
            debug!(room_id, peer_id, state = %entry.ai.state, "stale start_listening ignored");
            return false;
        }
        if !entry.ai.queue.is_active_peer(peer_id) {
            debug!(room_id, peer_id, "start_listening from non-owner rejected");
            return false;
        }
        entry.ai.state = AiResponseState::Listening;
        entry.ai.active_speaker_id = Some(peer_id.to_string());
        entry.ai.state_started_at = Utc::now();
        info!(room_id, peer_id, "AI listening");
        self.emit_state(room_id, entry);
        true
    }

    /// `listening → processing`.
    pub async fn start_processing(&self, room_id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.rooms.get_mut(room_id) else {
            return false;
        };
        if entry.ai.state != AiResponseState::Listening {
            debug!(room_id, state = %entry.ai.state, "stale start_processing ignored");
            return false;
        }
        entry.ai.state = AiResponseState::Processing;
        entry.ai.state_started_at = Utc::now();
        info!(room_id, "AI processing");
        self.emit_state(room_id, entry);
        true
    }

    /// `listening|processing → speaking`. Arms the lock-safety timer when
    /// the room locks during responses.
    pub async fn start_speaking(&self, room_id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.rooms.get_mut(room_id) else {
            return false;
        };
        if entry.ai.state != AiResponseState::Listening
            && entry.ai.state != AiResponseState::Processing
        {
            debug!(room_id, state = %entry.ai.state, "stale start_speaking ignored");
            return false;
        }
        entry.ai.state = AiResponseState::Speaking;
        entry.ai.state_started_at = Utc::now();
        if entry.settings.lock_during_response {
            self.arm_lock_timer(entry, room_id);
        }
        info!(room_id, "AI speaking");
        self.emit_state(room_id, entry);
        true
    }

    /// `speaking → idle`. Ends the active turn and, when configured,
    /// promotes the next queued request.
    pub async fn finish_speaking(&self, room_id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.rooms.get_mut(room_id) else {
            return false;
        };
        if entry.ai.state != AiResponseState::Speaking {
            debug!(room_id, state = %entry.ai.state, "stale finish_speaking ignored");
            return false;
        }
        entry.clear_lock_timer();
        entry.ai.state = AiResponseState::Idle;
        entry.ai.active_speaker_id = None;
        entry.ai.state_started_at = Utc::now();
        entry.ai.queue.total_processed += 1;
        if let Some(done) = entry.ai.queue.active_turn.take() {
            self.emit(TurnEvent::TurnEnded {
                room_id: room_id.to_string(),
                request: done,
            });
        }
        info!(room_id, "AI response finished");
        self.emit_state(room_id, entry);
        if self.config.auto_process_queue {
            self.promote_next(entry, room_id);
        }
        true
    }

    // -----------------------------------------------------------------------
    // Manual lock / unlock / interrupt
    // -----------------------------------------------------------------------

    /// Force the room into `locked` from any state — moderator holds
    /// unrelated to the turn queue. Records the reason as `last_error`.
    pub async fn lock(&self, room_id: &str, reason: Option<&str>) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.rooms.get_mut(room_id) else {
            return false;
        };
        entry.clear_lock_timer();
        entry.ai.state = AiResponseState::Locked;
        entry.ai.active_speaker_id = None;
        entry.ai.state_started_at = Utc::now();
        entry.ai.last_error = reason.map(str::to_string);
        info!(room_id, reason = reason.unwrap_or("none"), "room locked");
        self.emit_state(room_id, entry);
        true
    }

    /// `locked → idle`, then queue auto-processing.
    pub async fn unlock(&self, room_id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.rooms.get_mut(room_id) else {
            return false;
        };
        if entry.ai.state != AiResponseState::Locked {
            debug!(room_id, state = %entry.ai.state, "unlock outside locked ignored");
            return false;
        }
        entry.ai.state = AiResponseState::Idle;
        entry.ai.state_started_at = Utc::now();
        info!(room_id, "room unlocked");
        self.emit_state(room_id, entry);
        if self.config.auto_process_queue {
            self.promote_next(entry, room_id);
        }
        true
    }

    /// Cut the AI off mid-response. Permitted only while `speaking` and
    /// only when the room allows interrupts. The interrupted peer keeps
    /// the turn.
    pub async fn interrupt(
        &self,
        room_id: &str,
        interrupted_by: &str,
        reason: Option<&str>,
    ) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.rooms.get_mut(room_id) else {
            return false;
        };
        if entry.ai.state != AiResponseState::Speaking {
            debug!(room_id, interrupted_by, state = %entry.ai.state, "interrupt outside speaking rejected");
            return false;
        }
        if !entry.settings.allow_interrupt {
            debug!(room_id, interrupted_by, "interrupts disabled for room");
            return false;
        }
        entry.clear_lock_timer();
        entry.ai.state = AiResponseState::Idle;
        entry.ai.active_speaker_id = None;
        entry.ai.state_started_at = Utc::now();
        info!(
            room_id,
            interrupted_by,
            reason = reason.unwrap_or("none"),
            "AI response interrupted"
        );
        self.emit_state(room_id, entry);
        true
    }

    // -----------------------------------------------------------------------
    // Session health
    // -----------------------------------------------------------------------

    /// Mark the provider session degraded. Advisory: the state machine
    /// does not move — recovery is the lock-safety timer's job, or an
    /// explicit `finish_speaking`/`unlock` from the provider layer.
    pub async fn report_error(&self, room_id: &str, message: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.rooms.get_mut(room_id) else {
            return false;
        };
        entry.ai.is_session_healthy = false;
        entry.ai.last_error = Some(message.to_string());
        warn!(room_id, message, "provider session error reported");
        self.emit(TurnEvent::Error {
            room_id: room_id.to_string(),
            message: message.to_string(),
        });
        true
    }

    /// Clear the degraded flag after the provider session recovers.
    pub async fn report_session_reconnected(&self, room_id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(entry) = state.rooms.get_mut(room_id) else {
            return false;
        };
        entry.ai.is_session_healthy = true;
        entry.ai.last_error = None;
        info!(room_id, "provider session reconnected");
        self.emit_state(room_id, entry);
        true
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Snapshot of a room's AI state.
    pub async fn ai_state(&self, room_id: &str) -> Option<RoomAiState> {
        let state = self.state.read().await;
        state.rooms.get(room_id).map(|entry| entry.ai.clone())
    }

    /// Current effective settings for a room.
    pub async fn voice_settings(&self, room_id: &str) -> Option<VoiceSettings> {
        let state = self.state.read().await;
        state.rooms.get(room_id).map(|entry| entry.settings.clone())
    }

    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Promote the highest-priority queued request to active turn.
    /// Requires an idle, unowned room and a non-empty queue.
    fn promote_next(&self, entry: &mut RoomEntry, room_id: &str) -> bool {
        if entry.ai.state != AiResponseState::Idle || entry.ai.queue.active_turn.is_some() {
            return false;
        }
        let Some(mut next) = entry.ai.queue.pop_next() else {
            return false;
        };
        entry.clear_expiry_timer(&next.id);
        next.position = 0;
        next.expires_at = None;
        entry.ai.queue.active_turn = Some(next.clone());
        info!(room_id, peer_id = %next.peer_id, "promoted next queued turn");
        self.emit(TurnEvent::TurnStarted {
            room_id: room_id.to_string(),
            request: next,
        });
        self.emit(TurnEvent::QueueUpdated {
            room_id: room_id.to_string(),
            queue: entry.ai.queue.clone(),
        });
        true
    }

    /// Arm the per-request expiry timer. The handle is stored beside the
    /// entry it guards so cancellation/promotion can abort it exactly once;
    /// a wakeup that lost that race finds the request gone and no-ops.
    fn spawn_expiry_timer(
        &self,
        entry: &mut RoomEntry,
        room_id: &str,
        request_id: &str,
        timeout_ms: u64,
    ) {
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let room_id = room_id.to_string();
        let request_id_owned = request_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            let mut state = state.write().await;
            let Some(entry) = state.rooms.get_mut(&room_id) else {
                return;
            };
            entry.expiry_timers.remove(&request_id_owned);
            let Some(expired) = entry.ai.queue.remove(&request_id_owned) else {
                return;
            };
            entry.ai.queue.total_expired += 1;
            debug!(%room_id, request_id = %request_id_owned, peer_id = %expired.peer_id, "queued turn request expired");
            let _ = event_tx.send(TurnEvent::QueueUpdated {
                room_id: room_id.clone(),
                queue: entry.ai.queue.clone(),
            });
        });
        entry.expiry_timers.insert(request_id.to_string(), handle);
    }

    /// Arm the lock-safety timer for the current speaking hold. If it
    /// fires before `finish_speaking`, the room self-heals to idle.
    fn arm_lock_timer(&self, entry: &mut RoomEntry, room_id: &str) {
        entry.clear_lock_timer();
        let epoch = entry.lock_epoch;
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let room_id = room_id.to_string();
        let timeout_ms = self.config.default_lock_timeout_ms;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            let mut state = state.write().await;
            let Some(entry) = state.rooms.get_mut(&room_id) else {
                return;
            };
            if entry.lock_epoch != epoch || entry.ai.state != AiResponseState::Speaking {
                return;
            }
            entry.lock_timer = None;
            entry.lock_epoch += 1;
            entry.ai.state = AiResponseState::Idle;
            entry.ai.active_speaker_id = None;
            entry.ai.state_started_at = Utc::now();
            entry.ai.last_error = Some(LOCK_TIMEOUT_ERROR.to_string());
            warn!(%room_id, timeout_ms, "speaking lock held past timeout, force-releasing");
            let _ = event_tx.send(TurnEvent::Error {
                room_id: room_id.clone(),
                message: LOCK_TIMEOUT_ERROR.to_string(),
            });
            let _ = event_tx.send(TurnEvent::StateChanged {
                room_id: room_id.clone(),
                state: entry.ai.clone(),
            });
        });
        entry.lock_timer = Some(handle);
    }

    fn emit_state(&self, room_id: &str, entry: &RoomEntry) {
        self.emit(TurnEvent::StateChanged {
            room_id: room_id.to_string(),
            state: entry.ai.clone(),
        });
    }

    fn emit(&self, event: TurnEvent) {
        // Receiver dropped means the transport is gone; mutations still apply.
        let _ = self.event_tx.send(event);
    }
}
