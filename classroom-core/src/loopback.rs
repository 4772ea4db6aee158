//! In-process media engine
//!
//! `LoopbackEngine` implements [`MediaEngine`] without any real media: a
//! session description is a JSON manifest of the tracks attached on the
//! sending side, and applying a remote description diffs that manifest
//! against what was received before, emitting `TrackEnded` and
//! `RemoteTrack` events accordingly. Used by the integration tests and the
//! `classroom` binary.

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::media::{IceConnectionState, MediaEngine, MediaEvent, SdpType, SessionDescription};
use crate::types::{ConnectionKey, Liveness, MediaTrack, ParticipantId, RemoteTrack, TrackId, TrackKind};

/// Device labels reported for new captures
#[derive(Debug, Clone)]
pub struct CaptureLabels {
    pub camera: String,
    pub screen: String,
    pub audio: String,
}

impl Default for CaptureLabels {
    fn default() -> Self {
        Self {
            camera: "FaceTime HD Camera".to_string(),
            screen: "screen:0:0".to_string(),
            audio: "Built-in Microphone".to_string(),
        }
    }
}

impl CaptureLabels {
    fn for_kind(&self, kind: TrackKind) -> &str {
        match kind {
            TrackKind::Camera => &self.camera,
            TrackKind::Screen => &self.screen,
            TrackKind::Audio => &self.audio,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    origin: ParticipantId,
    tracks: Vec<RemoteTrack>,
}

#[derive(Debug, Default)]
struct LoopbackSession {
    attached: IndexMap<TrackId, MediaTrack>,
    received: IndexMap<TrackId, RemoteTrack>,
    pending_offer: bool,
    connected: bool,
}

#[derive(Debug, Default)]
struct EngineState {
    sessions: HashMap<ConnectionKey, LoopbackSession>,
    captures: IndexMap<TrackId, MediaTrack>,
    fail_next_capture: bool,
}

pub struct LoopbackEngine {
    owner: ParticipantId,
    labels: CaptureLabels,
    state: Mutex<EngineState>,
    events: mpsc::UnboundedSender<MediaEvent>,
}

impl LoopbackEngine {
    /// Create an engine for `owner` and the event stream it reports on
    pub fn new(
        owner: ParticipantId,
        labels: CaptureLabels,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MediaEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            owner,
            labels,
            state: Mutex::new(EngineState::default()),
            events,
        });
        (engine, rx)
    }

    /// Deliver an arbitrary engine event, e.g. an ICE disconnect
    pub fn inject(&self, event: MediaEvent) {
        self.emit(event);
    }

    /// Make the next `open_capture` fail, as a denied permission prompt would
    pub fn fail_next_capture(&self) {
        self.state.lock().fail_next_capture = true;
    }

    /// End a capture from the device side, as unplugging a camera or using
    /// the OS "stop sharing" control would. Returns false for unknown or
    /// already-ended captures.
    pub fn end_capture(&self, track_id: &TrackId) -> bool {
        {
            let mut state = self.state.lock();
            match state.captures.get_mut(track_id) {
                Some(track) if track.is_live() => track.liveness = Liveness::Ended,
                _ => return false,
            }
        }
        debug!(owner = %self.owner, track_id = %track_id, "Capture ended by device");
        self.emit(MediaEvent::CaptureEnded {
            track_id: track_id.clone(),
        });
        true
    }

    /// Captures opened and not yet closed
    #[must_use]
    pub fn open_captures(&self) -> Vec<MediaTrack> {
        self.state.lock().captures.values().cloned().collect()
    }

    #[must_use]
    pub fn has_session(&self, connection: &ConnectionKey) -> bool {
        self.state.lock().sessions.contains_key(connection)
    }

    fn emit(&self, event: MediaEvent) {
        if self.events.send(event).is_err() {
            trace!(owner = %self.owner, "Media event receiver dropped");
        }
    }

    fn manifest(&self, session: &LoopbackSession) -> Result<String> {
        let manifest = Manifest {
            origin: self.owner.clone(),
            tracks: session
                .attached
                .values()
                .map(|t| RemoteTrack::new(t.id.clone(), t.kind.media_kind(), t.label.clone()))
                .collect(),
        };
        Ok(serde_json::to_string(&manifest)?)
    }

    fn local_candidate(&self, connection: &ConnectionKey) {
        self.emit(MediaEvent::IceCandidate {
            connection: connection.clone(),
            candidate: format!("candidate:loopback 1 udp 2130706431 {} 9 typ host", self.owner),
        });
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn open_capture(&self, kind: TrackKind) -> Result<MediaTrack> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_capture) {
            return Err(Error::Media(format!("{kind:?} capture was not permitted")));
        }
        let track = MediaTrack::local(self.owner.clone(), kind, self.labels.for_kind(kind));
        state.captures.insert(track.id.clone(), track.clone());
        debug!(owner = %self.owner, track_id = %track.id, ?kind, "Capture opened");
        Ok(track)
    }

    async fn close_capture(&self, track: &MediaTrack) -> Result<()> {
        let mut state = self.state.lock();
        if state.captures.shift_remove(&track.id).is_none() {
            return Err(Error::NotFound(format!("capture {}", track.id)));
        }
        for session in state.sessions.values_mut() {
            session.attached.shift_remove(&track.id);
        }
        debug!(owner = %self.owner, track_id = %track.id, "Capture closed");
        Ok(())
    }

    async fn attach_local_track(&self, connection: &ConnectionKey, track: &MediaTrack) -> Result<()> {
        let mut state = self.state.lock();
        state
            .sessions
            .entry(connection.clone())
            .or_default()
            .attached
            .insert(track.id.clone(), track.clone());
        Ok(())
    }

    async fn detach_local_track(&self, connection: &ConnectionKey, track_id: &TrackId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(session) = state.sessions.get_mut(connection) {
            session.attached.shift_remove(track_id);
        }
        Ok(())
    }

    async fn create_offer(&self, connection: &ConnectionKey) -> Result<String> {
        let sdp = {
            let mut state = self.state.lock();
            let session = state.sessions.entry(connection.clone()).or_default();
            session.pending_offer = true;
            self.manifest(session)?
        };
        self.local_candidate(connection);
        Ok(sdp)
    }

    async fn create_answer(&self, connection: &ConnectionKey) -> Result<String> {
        let sdp = {
            let mut state = self.state.lock();
            let session = state.sessions.entry(connection.clone()).or_default();
            self.manifest(session)?
        };
        self.local_candidate(connection);
        Ok(sdp)
    }

    async fn set_remote_description(
        &self,
        connection: &ConnectionKey,
        description: &SessionDescription,
    ) -> Result<()> {
        let manifest: Manifest = serde_json::from_str(&description.sdp)?;
        if manifest.origin != connection.remote {
            return Err(Error::Media(format!(
                "description from {} applied to {connection}",
                manifest.origin
            )));
        }

        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let session = state.sessions.entry(connection.clone()).or_default();
            match description.sdp_type {
                SdpType::Answer if !session.pending_offer => {
                    return Err(Error::Media(format!("answer without pending offer on {connection}")));
                }
                SdpType::Answer => session.pending_offer = false,
                SdpType::Offer => {}
            }

            // retire before announcing replacements
            let ended: Vec<TrackId> = session
                .received
                .keys()
                .filter(|id| !manifest.tracks.iter().any(|t| &t.id == *id))
                .cloned()
                .collect();
            for track_id in ended {
                session.received.shift_remove(&track_id);
                events.push(MediaEvent::TrackEnded {
                    connection: connection.clone(),
                    track_id,
                });
            }
            for track in manifest.tracks {
                if !session.received.contains_key(&track.id) {
                    session.received.insert(track.id.clone(), track.clone());
                    events.push(MediaEvent::RemoteTrack {
                        connection: connection.clone(),
                        track,
                    });
                }
            }
            if !session.connected {
                session.connected = true;
                events.push(MediaEvent::ConnectionStateChanged {
                    connection: connection.clone(),
                    state: IceConnectionState::Connected,
                });
            }
        }

        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    async fn rollback_local_offer(&self, connection: &ConnectionKey) -> Result<()> {
        if let Some(session) = self.state.lock().sessions.get_mut(connection) {
            session.pending_offer = false;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, connection: &ConnectionKey, candidate: &str) -> Result<()> {
        if !candidate.starts_with("candidate:") {
            return Err(Error::Media(format!("malformed candidate on {connection}")));
        }
        Ok(())
    }

    async fn close_connection(&self, connection: &ConnectionKey) -> Result<()> {
        self.state.lock().sessions.remove(connection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaKind;

    fn key(local: &str, remote: &str) -> ConnectionKey {
        ConnectionKey::new(local.into(), remote.into())
    }

    #[tokio::test]
    async fn test_offer_answer_emits_remote_tracks() {
        let (alice, _alice_events) = LoopbackEngine::new("alice".into(), CaptureLabels::default());
        let (bob, mut bob_events) = LoopbackEngine::new("bob".into(), CaptureLabels::default());

        let cam = alice.open_capture(TrackKind::Camera).await.unwrap();
        alice.attach_local_track(&key("alice", "bob"), &cam).await.unwrap();
        let offer = alice.create_offer(&key("alice", "bob")).await.unwrap();

        bob.set_remote_description(&key("bob", "alice"), &SessionDescription::offer(offer))
            .await
            .unwrap();

        match bob_events.recv().await.unwrap() {
            MediaEvent::RemoteTrack { track, .. } => {
                assert_eq!(track.id, cam.id);
                assert_eq!(track.media, MediaKind::Video);
                assert_eq!(track.label, "FaceTime HD Camera");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            bob_events.recv().await.unwrap(),
            MediaEvent::ConnectionStateChanged { state: IceConnectionState::Connected, .. }
        ));
    }

    #[tokio::test]
    async fn test_removed_track_ends() {
        let (alice, _alice_events) = LoopbackEngine::new("alice".into(), CaptureLabels::default());
        let (bob, mut bob_events) = LoopbackEngine::new("bob".into(), CaptureLabels::default());
        let ab = key("alice", "bob");
        let ba = key("bob", "alice");

        let cam = alice.open_capture(TrackKind::Camera).await.unwrap();
        alice.attach_local_track(&ab, &cam).await.unwrap();
        let offer = alice.create_offer(&ab).await.unwrap();
        bob.set_remote_description(&ba, &SessionDescription::offer(offer)).await.unwrap();

        alice.close_capture(&cam).await.unwrap();
        let offer = alice.create_offer(&ab).await.unwrap();
        bob.set_remote_description(&ba, &SessionDescription::offer(offer)).await.unwrap();

        let mut ended = None;
        while let Ok(event) = bob_events.try_recv() {
            if let MediaEvent::TrackEnded { track_id, .. } = event {
                ended = Some(track_id);
            }
        }
        assert_eq!(ended, Some(cam.id));
    }

    #[tokio::test]
    async fn test_answer_requires_pending_offer() {
        let (alice, _events) = LoopbackEngine::new("alice".into(), CaptureLabels::default());
        let (bob, _bob_events) = LoopbackEngine::new("bob".into(), CaptureLabels::default());
        let answer = bob.create_answer(&key("bob", "alice")).await.unwrap();
        let result = alice
            .set_remote_description(&key("alice", "bob"), &SessionDescription::answer(answer))
            .await;
        assert!(matches!(result, Err(Error::Media(_))));
    }

    #[tokio::test]
    async fn test_capture_failure_is_one_shot() {
        let (engine, _events) = LoopbackEngine::new("alice".into(), CaptureLabels::default());
        engine.fail_next_capture();
        assert!(engine.open_capture(TrackKind::Screen).await.is_err());
        assert!(engine.open_capture(TrackKind::Screen).await.is_ok());
        assert_eq!(engine.open_captures().len(), 1);
    }

    #[tokio::test]
    async fn test_device_ended_capture_is_reported_once() {
        let (engine, mut events) = LoopbackEngine::new("alice".into(), CaptureLabels::default());
        let screen = engine.open_capture(TrackKind::Screen).await.unwrap();

        assert!(engine.end_capture(&screen.id));
        assert!(!engine.end_capture(&screen.id));
        assert_eq!(
            events.recv().await.unwrap(),
            MediaEvent::CaptureEnded {
                track_id: screen.id.clone()
            }
        );
        assert!(events.try_recv().is_err());

        // still closable by its owner afterwards
        engine.close_capture(&screen).await.unwrap();
        assert!(engine.open_captures().is_empty());
    }
}
