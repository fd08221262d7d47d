//! AI turn arbitration for shared voice rooms.
//!
//! Several humans share one live session with a single AI participant,
//! but only one voice stream can address the AI at a time. This module
//! owns the per-room state machine deciding who holds that turn, who
//! waits, and when ownership passes — priority queue, timeout-based
//! safety releases, interrupt semantics, and voice-mode-dependent
//! admission. Media transport and provider I/O live elsewhere; this is
//! coordination only.

mod manager;
mod queue;
mod types;


pub use manager::{TurnArbiter, LOCK_TIMEOUT_ERROR};
pub use queue::TurnQueueState;
pub use types::{
    AiResponseState, ArbiterConfig, RoomAiState, TurnEvent, TurnRequest, VoiceMode, VoiceSettings,
    VoiceSettingsPatch,
};
