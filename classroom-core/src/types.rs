//! Common types shared by every classroom component

use serde::{Deserialize, Serialize};
use std::fmt;

/// Relay-assigned participant identifier.
///
/// Ordering is lexicographic on the underlying string; glare resolution
/// relies on it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a media track
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random track id
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(12))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TrackId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TrackId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Ordered (local, remote) pair identifying one negotiated media session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub local: ParticipantId,
    pub remote: ParticipantId,
}

impl ConnectionKey {
    #[must_use]
    pub const fn new(local: ParticipantId, remote: ParticipantId) -> Self {
        Self { local, remote }
    }

    /// The lower id of the pair is the polite side during glare.
    #[must_use]
    pub fn is_polite(&self) -> bool {
        self.local < self.remote
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.local, self.remote)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Broadcaster,
    Viewer,
}

/// Capability flags a participant declares through status updates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantFlags {
    pub camera_on: bool,
    pub mic_on: bool,
    pub screen_sharing: bool,
}

impl ParticipantFlags {
    /// Whether the participant is sending any media at all
    #[must_use]
    pub const fn has_outbound(&self) -> bool {
        self.camera_on || self.mic_on || self.screen_sharing
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[serde(rename = "participantId")]
    pub id: ParticipantId,
    pub role: Role,
    pub display_name: String,
    #[serde(default)]
    pub flags: ParticipantFlags,
}

impl Participant {
    pub fn new(id: impl Into<ParticipantId>, role: Role, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            display_name: display_name.into(),
            flags: ParticipantFlags::default(),
        }
    }

    #[must_use]
    pub fn is_broadcaster(&self) -> bool {
        self.role == Role::Broadcaster
    }
}

/// Transport-level media kind, as declared by the media engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Semantic purpose of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Camera,
    Screen,
    Audio,
}

impl TrackKind {
    #[must_use]
    pub const fn media_kind(self) -> MediaKind {
        match self {
            Self::Audio => MediaKind::Audio,
            Self::Camera | Self::Screen => MediaKind::Video,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Live,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// A logical media track, local or remote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: TrackId,
    pub kind: TrackKind,
    pub owner: ParticipantId,
    /// Human-readable device label reported by the capture layer
    pub label: String,
    pub liveness: Liveness,
    pub direction: Direction,
}

impl MediaTrack {
    /// A freshly captured local track
    pub fn local(owner: ParticipantId, kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: TrackId::generate(),
            kind,
            owner,
            label: label.into(),
            liveness: Liveness::Live,
            direction: Direction::Outbound,
        }
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.liveness == Liveness::Live
    }
}

/// An inbound track as the media engine reports it, before classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: TrackId,
    pub media: MediaKind,
    pub label: String,
}

impl RemoteTrack {
    pub fn new(id: impl Into<TrackId>, media: MediaKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            media,
            label: label.into(),
        }
    }
}
