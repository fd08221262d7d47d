pub mod backoff;
pub mod turns;

pub use backoff::BackoffPolicy;
pub use turns::{
    AiResponseState, ArbiterConfig, RoomAiState, TurnArbiter, TurnEvent, TurnQueueState,
    TurnRequest, VoiceMode, VoiceSettings, VoiceSettingsPatch,
};
