use thiserror::Error;

use crate::types::{ParticipantId, TrackId};

#[derive(Error, Debug)]
pub enum Error {
    /// Signaling delivery failed after the channel's retries were exhausted
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Negotiation with {remote} stuck in {phase} beyond the timeout")]
    NegotiationTimeout { remote: ParticipantId, phase: String },

    #[error("Screen share lock is held by {held_by}")]
    LockDenied { held_by: ParticipantId },

    #[error("Screen share lock request timed out")]
    LockTimeout,

    #[error("Screen share lock is not held by {0}")]
    NotLockHolder(ParticipantId),

    #[error("Ambiguous track classification for {0}")]
    ClassificationAmbiguous(ParticipantId),

    #[error("Duplicate track: {0}")]
    DuplicateTrack(TrackId),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Media engine error: {0}")]
    Media(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Session closed")]
    Closed,
}

impl Error {
    /// Errors a UI is expected to show to the user as-is
    #[must_use]
    pub const fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::LockDenied { .. } | Self::LockTimeout | Self::NotLockHolder(_)
        )
    }

    /// Worth another delivery attempt
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Message suitable for display to the end user
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::LockDenied { held_by } => {
                format!("Screen sharing is already in use by {held_by}")
            }
            Self::LockTimeout => {
                "Screen sharing could not be started: no response from the session".to_string()
            }
            Self::NotLockHolder(_) => "You are not sharing your screen".to_string(),
            Self::NegotiationTimeout { remote, .. } | Self::ClassificationAmbiguous(remote) => {
                format!("Media from {remote} is temporarily unavailable")
            }
            Self::Transport(_) | Self::Closed => "Connection to the classroom was lost".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
