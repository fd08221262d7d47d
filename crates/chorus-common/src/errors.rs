use serde::{Deserialize, Serialize};

/// Why a peer was refused a turn with the AI.
///
/// The display strings are part of the client contract — the signaling
/// layer forwards them verbatim for the UI to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDenied {
    #[error("Room not found")]
    RoomNotFound,

    #[error("Not a designated speaker")]
    NotDesignatedSpeaker,

    #[error("Already has active turn")]
    AlreadyActive,

    #[error("Already in queue")]
    AlreadyQueued,

    #[error("Queue is full")]
    QueueFull,
}

#[derive(Debug, thiserror::Error)]
pub enum ChorusError {
    #[error("turn denied: {0}")]
    TurnDenied(#[from] TurnDenied),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Other(String),
}
