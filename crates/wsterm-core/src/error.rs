use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failures raised by a terminal session or the activity tracker.
///
/// Only [`BridgeError::Decode`] and [`BridgeError::Notification`] are local to
/// a single frame or call; every other variant ends the task that raised it.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to start pty process: {0}")]
    Spawn(String),

    #[error("websocket transport error: {0}")]
    Transport(String),

    #[error("malformed control message: {0}")]
    Decode(String),

    #[error("pty output is not valid UTF-8 at byte {offset}")]
    InvalidEncoding { offset: usize },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("activity notification failed: {0}")]
    Notification(String),

    #[error("pty closed")]
    PtyClosed,

    #[error("pty I/O error: {0}")]
    Pty(#[from] io::Error),
}

impl BridgeError {
    /// Returns `true` when the error only affects the current frame or call.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Notification(_))
    }

    #[must_use]
    pub fn spawn(error: impl std::fmt::Display) -> Self {
        Self::Spawn(error.to_string())
    }

    #[must_use]
    pub fn transport(error: impl std::fmt::Display) -> Self {
        Self::Transport(error.to_string())
    }

    #[must_use]
    pub fn decode(error: impl std::fmt::Display) -> Self {
        Self::Decode(error.to_string())
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(error: reqwest::Error) -> Self {
        Self::Notification(error.to_string())
    }
}
