//! Types, configuration, and events for AI turn arbitration.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::queue::TurnQueueState;

// ---------------------------------------------------------------------------
// Voice modes
// ---------------------------------------------------------------------------

/// How peers are admitted to speak with the AI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VoiceMode {
    /// Anyone may request a turn at any time.
    #[default]
    Open,
    /// Turns are requested explicitly via a push-to-talk control.
    PushToTalk,
    /// The client only opens a turn after hearing a wake word.
    WakeWord,
    /// Only peers in `designated_speakers` may request turns.
    DesignatedSpeaker,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Per-room voice policy. Relayed to clients as-is, so field names follow
/// the JSON wire convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VoiceSettings {
    pub mode: VoiceMode,
    /// Whether the AI holds the channel exclusively while speaking.
    pub lock_during_response: bool,
    pub enable_queue: bool,
    /// 0 = unlimited.
    pub max_queue_size: usize,
    pub queue_timeout_ms: u64,
    pub allow_interrupt: bool,
    /// Lookup table consulted when `mode` is `DesignatedSpeaker`.
    pub designated_speakers: HashSet<String>,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            mode: VoiceMode::Open,
            lock_during_response: true,
            enable_queue: true,
            max_queue_size: 0,
            queue_timeout_ms: 30_000,
            allow_interrupt: true,
            designated_speakers: HashSet::new(),
        }
    }
}

impl VoiceSettings {
    /// Room defaults seeded from the arbiter-wide configuration.
    pub fn defaults_from(config: &ArbiterConfig) -> Self {
        Self {
            max_queue_size: config.max_queue_size,
            queue_timeout_ms: config.default_queue_timeout_ms,
            ..Default::default()
        }
    }
}

/// Partial settings update. Unset fields leave the current value alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VoiceSettingsPatch {
    pub mode: Option<VoiceMode>,
    pub lock_during_response: Option<bool>,
    pub enable_queue: Option<bool>,
    pub max_queue_size: Option<usize>,
    pub queue_timeout_ms: Option<u64>,
    pub allow_interrupt: Option<bool>,
    pub designated_speakers: Option<HashSet<String>>,
}

impl VoiceSettingsPatch {
    pub fn apply(self, settings: &mut VoiceSettings) {
        if let Some(mode) = self.mode {
            settings.mode = mode;
        }
        if let Some(v) = self.lock_during_response {
            settings.lock_during_response = v;
        }
        if let Some(v) = self.enable_queue {
            settings.enable_queue = v;
        }
        if let Some(v) = self.max_queue_size {
            settings.max_queue_size = v;
        }
        if let Some(v) = self.queue_timeout_ms {
            settings.queue_timeout_ms = v;
        }
        if let Some(v) = self.allow_interrupt {
            settings.allow_interrupt = v;
        }
        if let Some(v) = self.designated_speakers {
            settings.designated_speakers = v;
        }
    }
}

// ---------------------------------------------------------------------------
// Arbiter configuration
// ---------------------------------------------------------------------------

/// Process-wide arbiter configuration, supplied at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ArbiterConfig {
    /// Safety-release timeout for a speaking lock held too long.
    pub default_lock_timeout_ms: u64,
    /// Default expiry for queued turn requests.
    pub default_queue_timeout_ms: u64,
    /// Default per-room queue cap (0 = unlimited).
    pub max_queue_size: usize,
    /// Promote the next queued request automatically after
    /// `finish_speaking` / `unlock`.
    pub auto_process_queue: bool,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            default_lock_timeout_ms: 30_000,
            default_queue_timeout_ms: 30_000,
            max_queue_size: 0,
            auto_process_queue: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Turn requests and room state
// ---------------------------------------------------------------------------

/// A peer's claim on the AI voice channel — either the active turn or a
/// queued entry waiting for promotion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub id: String,
    pub peer_id: String,
    pub peer_display_name: String,
    pub room_id: String,
    pub created_at: DateTime<Utc>,
    /// Unset for the active turn — only queued entries expire.
    pub expires_at: Option<DateTime<Utc>>,
    /// 0 for the active turn, 1-based while queued.
    pub position: usize,
    pub priority: i32,
}

/// What the AI provider is currently doing in a room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiResponseState {
    #[default]
    Idle,
    Listening,
    Processing,
    Speaking,
    Locked,
}

impl std::fmt::Display for AiResponseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AiResponseState::Idle => write!(f, "idle"),
            AiResponseState::Listening => write!(f, "listening"),
            AiResponseState::Processing => write!(f, "processing"),
            AiResponseState::Speaking => write!(f, "speaking"),
            AiResponseState::Locked => write!(f, "locked"),
        }
    }
}

/// Snapshot of one room's AI state, as relayed to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomAiState {
    pub state: AiResponseState,
    pub active_speaker_id: Option<String>,
    pub state_started_at: DateTime<Utc>,
    pub queue: TurnQueueState,
    pub is_session_healthy: bool,
    pub last_error: Option<String>,
}

impl RoomAiState {
    pub fn new() -> Self {
        Self {
            state: AiResponseState::Idle,
            active_speaker_id: None,
            state_started_at: Utc::now(),
            queue: TurnQueueState::default(),
            is_session_healthy: true,
            last_error: None,
        }
    }
}

impl Default for RoomAiState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events emitted by the turn arbiter for the signaling layer to relay.
///
/// Delivery order within a room always matches mutation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TurnEvent {
    /// The room's AI state machine moved or its health flags changed.
    StateChanged {
        room_id: String,
        state: RoomAiState,
    },
    /// The pending queue changed (insert, cancel, expiry, promotion).
    QueueUpdated {
        room_id: String,
        queue: TurnQueueState,
    },
    /// A peer was granted the turn (immediately or by promotion).
    TurnStarted {
        room_id: String,
        request: TurnRequest,
    },
    /// The active turn completed normally.
    TurnEnded {
        room_id: String,
        request: TurnRequest,
    },
    /// A recoverable failure (safety release, degraded provider session).
    Error {
        room_id: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_mode_wire_names() {
        assert_eq!(
            serde_json::to_string(&VoiceMode::PushToTalk).unwrap(),
            "\"pushToTalk\""
        );
        assert_eq!(
            serde_json::to_string(&VoiceMode::DesignatedSpeaker).unwrap(),
            "\"designatedSpeaker\""
        );
        let mode: VoiceMode = serde_json::from_str("\"wakeWord\"").unwrap();
        assert_eq!(mode, VoiceMode::WakeWord);
    }

    #[test]
    fn ai_state_wire_names() {
        assert_eq!(
            serde_json::to_string(&AiResponseState::Speaking).unwrap(),
            "\"speaking\""
        );
        assert_eq!(AiResponseState::Processing.to_string(), "processing");
    }

    #[test]
    fn settings_default_is_open_and_unlimited() {
        let s = VoiceSettings::default();
        assert_eq!(s.mode, VoiceMode::Open);
        assert!(s.lock_during_response);
        assert!(s.enable_queue);
        assert_eq!(s.max_queue_size, 0);
        assert!(s.allow_interrupt);
        assert!(s.designated_speakers.is_empty());
    }

    #[test]
    fn settings_deserialize_partial_json() {
        // Clients may send sparse settings objects; missing fields take
        // defaults.
        let s: VoiceSettings =
            serde_json::from_str(r#"{"mode":"pushToTalk","maxQueueSize":3}"#).unwrap();
        assert_eq!(s.mode, VoiceMode::PushToTalk);
        assert_eq!(s.max_queue_size, 3);
        assert_eq!(s.queue_timeout_ms, 30_000);
    }

    #[test]
    fn settings_defaults_from_config() {
        let config = ArbiterConfig {
            default_queue_timeout_ms: 5_000,
            max_queue_size: 4,
            ..Default::default()
        };
        let s = VoiceSettings::defaults_from(&config);
        assert_eq!(s.queue_timeout_ms, 5_000);
        assert_eq!(s.max_queue_size, 4);
    }

    #[test]
    fn patch_applies_only_set_fields() {
        let mut s = VoiceSettings::default();
        let patch = VoiceSettingsPatch {
            allow_interrupt: Some(false),
            queue_timeout_ms: Some(1_000),
            ..Default::default()
        };
        patch.apply(&mut s);
        assert!(!s.allow_interrupt);
        assert_eq!(s.queue_timeout_ms, 1_000);
        assert_eq!(s.mode, VoiceMode::Open);
        assert!(s.lock_during_response);
    }

    #[test]
    fn turn_event_tagged_serialization() {
        let event = TurnEvent::Error {
            room_id: "r1".into(),
            message: "boom".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "error");
        assert_eq!(json["roomId"], "r1");
    }
}
