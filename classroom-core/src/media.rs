//! Media-engine capability interface
//!
//! Capture, encoding and transport of samples belong to an external media
//! engine. The core drives it through [`MediaEngine`] and learns about
//! remote tracks and transport health from the [`MediaEvent`] stream the
//! engine was created with.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{ConnectionKey, MediaTrack, RemoteTrack, TrackId, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Transport health of one connection as reported by the ICE layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    RemoteTrack {
        connection: ConnectionKey,
        track: RemoteTrack,
    },
    TrackEnded {
        connection: ConnectionKey,
        track_id: TrackId,
    },
    /// Locally gathered candidate to forward to the peer
    IceCandidate {
        connection: ConnectionKey,
        candidate: String,
    },
    ConnectionStateChanged {
        connection: ConnectionKey,
        state: IceConnectionState,
    },
    /// A local capture stopped on its own: device unplugged, or the OS
    /// "stop sharing" control was used
    CaptureEnded { track_id: TrackId },
}

impl MediaEvent {
    /// The connection this event belongs to; `None` for capture events
    #[must_use]
    pub const fn connection(&self) -> Option<&ConnectionKey> {
        match self {
            Self::RemoteTrack { connection, .. }
            | Self::TrackEnded { connection, .. }
            | Self::IceCandidate { connection, .. }
            | Self::ConnectionStateChanged { connection, .. } => Some(connection),
            Self::CaptureEnded { .. } => None,
        }
    }
}

/// Operations the orchestrator needs from the media engine.
///
/// Connection-scoped calls are keyed by [`ConnectionKey`]; the engine
/// creates the underlying session lazily on first use and forgets it on
/// [`MediaEngine::close_connection`].
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn open_capture(&self, kind: TrackKind) -> Result<MediaTrack>;

    async fn close_capture(&self, track: &MediaTrack) -> Result<()>;

    async fn attach_local_track(&self, connection: &ConnectionKey, track: &MediaTrack) -> Result<()>;

    async fn detach_local_track(&self, connection: &ConnectionKey, track_id: &TrackId) -> Result<()>;

    async fn create_offer(&self, connection: &ConnectionKey) -> Result<String>;

    async fn create_answer(&self, connection: &ConnectionKey) -> Result<String>;

    async fn set_remote_description(
        &self,
        connection: &ConnectionKey,
        description: &SessionDescription,
    ) -> Result<()>;

    /// Discard a pending local offer (glare, polite side)
    async fn rollback_local_offer(&self, connection: &ConnectionKey) -> Result<()>;

    async fn add_ice_candidate(&self, connection: &ConnectionKey, candidate: &str) -> Result<()>;

    async fn close_connection(&self, connection: &ConnectionKey) -> Result<()>;
}
