//! Per-pair connection state
//!
//! `ConnectionState` wraps one negotiated media session between the local
//! participant and one remote: the signaling phase, the tracks flowing in
//! each direction and the last time anything happened on it. It is plain
//! data owned by exactly one pair worker; see [`crate::negotiation`].

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

use crate::classifier::{looks_like_camera, looks_like_screen};
use crate::error::{Error, Result};
use crate::types::{ConnectionKey, MediaKind, MediaTrack, RemoteTrack, TrackId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingPhase {
    Idle,
    /// This side produced an offer and awaits the answer
    LocalOffering,
    /// The peer's offer is applied and the answer is being produced
    Answering,
    Stable,
    Failed,
    Closed,
}

impl SignalingPhase {
    /// Phases that must not be held beyond the negotiation timeout
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Idle | Self::LocalOffering | Self::Answering)
    }

    const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Closed, _) => false,
            (_, Self::Closed | Self::Failed) => true,
            (Self::Idle | Self::Stable, Self::LocalOffering | Self::Answering) => true,
            // polite side rolls back its own offer to accept the peer's
            (Self::LocalOffering, Self::Answering | Self::Stable) => true,
            (Self::Answering, Self::Stable) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SignalingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::LocalOffering => "local-offering",
            Self::Answering => "answering",
            Self::Stable => "stable",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What a video label says about its source, when it says anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VideoPurpose {
    Camera,
    Screen,
}

impl VideoPurpose {
    fn of(label: &str) -> Option<Self> {
        if looks_like_screen(label) {
            Some(Self::Screen)
        } else if looks_like_camera(label) {
            Some(Self::Camera)
        } else {
            None
        }
    }
}

/// Inbound track plus bookkeeping needed for arrival-order classification
#[derive(Debug, Clone)]
struct InboundEntry {
    track: RemoteTrack,
    live: bool,
}

#[derive(Debug)]
pub struct ConnectionState {
    pub key: ConnectionKey,
    /// Fresh for every (re)creation of the pair
    pub session_id: String,
    phase: SignalingPhase,
    phase_since: Instant,
    inbound: IndexMap<TrackId, InboundEntry>,
    outbound: IndexMap<TrackId, MediaTrack>,
    last_activity: DateTime<Utc>,
}

impl ConnectionState {
    #[must_use]
    pub fn new(key: ConnectionKey) -> Self {
        Self {
            key,
            session_id: nanoid::nanoid!(10),
            phase: SignalingPhase::Idle,
            phase_since: Instant::now(),
            inbound: IndexMap::new(),
            outbound: IndexMap::new(),
            last_activity: Utc::now(),
        }
    }

    #[must_use]
    pub const fn phase(&self) -> SignalingPhase {
        self.phase
    }

    #[must_use]
    pub const fn phase_since(&self) -> Instant {
        self.phase_since
    }

    #[must_use]
    pub const fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Move to `next`, rejecting transitions the state machine does not allow
    pub fn transition(&mut self, next: SignalingPhase) -> Result<()> {
        if self.phase == next {
            return Ok(());
        }
        if !self.phase.can_transition_to(next) {
            return Err(Error::InvalidState(format!(
                "{}: cannot move from {} to {}",
                self.key, self.phase, next
            )));
        }
        self.phase = next;
        self.phase_since = Instant::now();
        self.touch();
        Ok(())
    }

    /// Record an inbound track. A live track with the same id is a duplicate.
    ///
    /// Returns the ids of live tracks the newcomer replaces: a screen-labelled
    /// video supersedes the previous screen, a camera-labelled one the
    /// previous camera. Generic labels replace nothing so a camera and a
    /// screen that are both unlabelled still reach arrival-order
    /// classification.
    pub fn add_inbound(&mut self, track: RemoteTrack) -> Result<Vec<TrackId>> {
        if let Some(existing) = self.inbound.get(&track.id) {
            if existing.live {
                return Err(Error::DuplicateTrack(track.id));
            }
            // a revived id counts as a new arrival
            self.inbound.shift_remove(&track.id);
        }
        let superseded = self.retire_superseded(&track);
        self.inbound.insert(track.id.clone(), InboundEntry { track, live: true });
        self.touch();
        Ok(superseded)
    }

    /// Drop ended video entries and live ones of the same purpose as `incoming`,
    /// so at most one camera and one screen are ever on record.
    fn retire_superseded(&mut self, incoming: &RemoteTrack) -> Vec<TrackId> {
        if incoming.media != MediaKind::Video {
            return Vec::new();
        }
        let purpose = VideoPurpose::of(&incoming.label);
        let mut superseded = Vec::new();
        self.inbound.retain(|id, entry| {
            if entry.track.media != MediaKind::Video {
                return true;
            }
            if !entry.live {
                return false;
            }
            if purpose.is_some() && VideoPurpose::of(&entry.track.label) == purpose {
                superseded.push(id.clone());
                return false;
            }
            true
        });
        superseded
    }

    /// Mark an inbound track ended. Returns false for unknown or already-ended ids.
    pub fn end_inbound(&mut self, id: &TrackId) -> bool {
        match self.inbound.get_mut(id) {
            Some(entry) if entry.live => {
                entry.live = false;
                self.touch();
                true
            }
            _ => false,
        }
    }

    /// Live inbound tracks in arrival order
    #[must_use]
    pub fn live_inbound(&self) -> Vec<RemoteTrack> {
        self.inbound
            .values()
            .filter(|entry| entry.live)
            .map(|entry| entry.track.clone())
            .collect()
    }

    /// Returns false if a track with this id is already being sent
    pub fn attach_outbound(&mut self, track: MediaTrack) -> bool {
        if self.outbound.contains_key(&track.id) {
            return false;
        }
        self.outbound.insert(track.id.clone(), track);
        self.touch();
        true
    }

    pub fn detach_outbound(&mut self, id: &TrackId) -> Option<MediaTrack> {
        let removed = self.outbound.shift_remove(id);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub fn outbound(&self) -> impl Iterator<Item = &MediaTrack> {
        self.outbound.values()
    }

    #[must_use]
    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrackKind;

    fn state() -> ConnectionState {
        ConnectionState::new(ConnectionKey::new("a".into(), "b".into()))
    }

    #[test]
    fn test_standard_offer_path() {
        let mut conn = state();
        assert_eq!(conn.phase(), SignalingPhase::Idle);
        conn.transition(SignalingPhase::LocalOffering).unwrap();
        conn.transition(SignalingPhase::Stable).unwrap();
        conn.transition(SignalingPhase::LocalOffering).unwrap();
        conn.transition(SignalingPhase::Stable).unwrap();
    }

    #[test]
    fn test_answer_path_and_rollback() {
        let mut conn = state();
        conn.transition(SignalingPhase::LocalOffering).unwrap();
        conn.transition(SignalingPhase::Answering).unwrap();
        conn.transition(SignalingPhase::Stable).unwrap();
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut conn = state();
        assert!(conn.transition(SignalingPhase::Stable).is_err());
        conn.transition(SignalingPhase::Closed).unwrap();
        assert!(conn.transition(SignalingPhase::LocalOffering).is_err());
        assert!(conn.transition(SignalingPhase::Failed).is_err());
    }

    #[test]
    fn test_any_live_phase_can_fail() {
        let mut conn = state();
        conn.transition(SignalingPhase::LocalOffering).unwrap();
        conn.transition(SignalingPhase::Failed).unwrap();
        assert!(!conn.phase().is_transient());
        conn.transition(SignalingPhase::Closed).unwrap();
    }

    #[test]
    fn test_duplicate_inbound_track() {
        let mut conn = state();
        let track = RemoteTrack::new("v1", MediaKind::Video, "Camera");
        conn.add_inbound(track.clone()).unwrap();
        assert!(matches!(conn.add_inbound(track), Err(Error::DuplicateTrack(_))));
        assert_eq!(conn.live_inbound().len(), 1);
    }

    #[test]
    fn test_inbound_arrival_order_survives_endings() {
        let mut conn = state();
        conn.add_inbound(RemoteTrack::new("v1", MediaKind::Video, "video0")).unwrap();
        conn.add_inbound(RemoteTrack::new("a1", MediaKind::Audio, "Mic")).unwrap();
        conn.add_inbound(RemoteTrack::new("v2", MediaKind::Video, "video1")).unwrap();
        assert!(conn.end_inbound(&TrackId::from("v1")));
        assert!(!conn.end_inbound(&TrackId::from("v1")));

        let ids: Vec<_> = conn.live_inbound().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![TrackId::from("a1"), TrackId::from("v2")]);
    }

    #[test]
    fn test_replacement_camera_retires_previous() {
        let mut conn = state();
        conn.add_inbound(RemoteTrack::new("scr", MediaKind::Video, "screen:0:0")).unwrap();
        conn.add_inbound(RemoteTrack::new("cam1", MediaKind::Video, "FaceTime HD Camera")).unwrap();
        let superseded = conn
            .add_inbound(RemoteTrack::new("cam2", MediaKind::Video, "USB Webcam"))
            .unwrap();
        assert_eq!(superseded, vec![TrackId::from("cam1")]);

        let ids: Vec<_> = conn.live_inbound().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![TrackId::from("scr"), TrackId::from("cam2")]);
        // the late `ended` for the old camera is a no-op
        assert!(!conn.end_inbound(&TrackId::from("cam1")));

        let result = crate::classifier::classify(&"b".into(), &conn.live_inbound());
        assert_eq!(result.tracks.camera.unwrap().id.as_str(), "cam2");
        assert_eq!(result.tracks.screen.unwrap().id.as_str(), "scr");
    }

    #[test]
    fn test_replacement_screen_retires_previous() {
        let mut conn = state();
        conn.add_inbound(RemoteTrack::new("s1", MediaKind::Video, "Window: Slides")).unwrap();
        let superseded = conn
            .add_inbound(RemoteTrack::new("s2", MediaKind::Video, "Entire Screen"))
            .unwrap();
        assert_eq!(superseded, vec![TrackId::from("s1")]);
        assert_eq!(conn.live_inbound().len(), 1);
    }

    #[test]
    fn test_generic_labels_are_kept_side_by_side() {
        let mut conn = state();
        conn.add_inbound(RemoteTrack::new("v1", MediaKind::Video, "video0")).unwrap();
        let superseded = conn
            .add_inbound(RemoteTrack::new("v2", MediaKind::Video, "video1"))
            .unwrap();
        assert!(superseded.is_empty());
        assert_eq!(conn.live_inbound().len(), 2);
    }

    #[test]
    fn test_ended_track_can_return() {
        let mut conn = state();
        let track = RemoteTrack::new("v1", MediaKind::Video, "Cam");
        conn.add_inbound(track.clone()).unwrap();
        conn.end_inbound(&track.id);
        conn.add_inbound(track).unwrap();
        assert_eq!(conn.live_inbound().len(), 1);
    }

    #[test]
    fn test_outbound_is_idempotent() {
        let mut conn = state();
        let track = MediaTrack::local("a".into(), TrackKind::Camera, "Cam");
        assert!(conn.attach_outbound(track.clone()));
        assert!(!conn.attach_outbound(track.clone()));
        assert!(conn.has_outbound());
        assert!(conn.detach_outbound(&track.id).is_some());
        assert!(conn.detach_outbound(&track.id).is_none());
    }
}
