//! Session orchestrator
//!
//! One actor per local participant. It is the only writer of session-wide
//! state: presence, the pin selection, the read-only mirror of the screen
//! lock holder and the arena of per-peer entries. Per-pair negotiation is
//! delegated to workers from [`crate::negotiation`]; their events come back
//! here tagged with a session id so results of a replaced worker are
//! discarded.

use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::classifier::ClassifiedTracks;
use crate::config::SessionConfig;
use crate::connection::SignalingPhase;
use crate::error::{Error, Result};
use crate::media::{MediaEngine, MediaEvent};
use crate::negotiation::{
    sleep_until_opt, spawn_pair, PairCommand, PairContext, PairEvent, PairEventKind, PairHandle,
};
use crate::pin::PinSelector;
use crate::presence::{PresenceTracker, StatusChange};
use crate::signaling::{Outbox, SignalingChannel, SignalingMessage};
use crate::types::{
    ConnectionKey, MediaTrack, Participant, ParticipantFlags, ParticipantId, TrackId, TrackKind,
};
use crate::view::{ParticipantView, SessionStats, SessionView, ViewUpdate};

const COMMAND_BUFFER: usize = 64;
const UPDATE_BUFFER: usize = 256;

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    RequestPin {
        participant: Option<ParticipantId>,
        reply: Reply<()>,
    },
    RequestScreenShare {
        reply: Reply<()>,
    },
    StopScreenShare {
        reply: Reply<()>,
    },
    SetCapture {
        kind: TrackKind,
        enabled: bool,
        reply: Reply<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionView>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

/// Connections of one participant: its relay link and its media engine
pub struct SessionIo {
    pub channel: Arc<dyn SignalingChannel>,
    pub inbound: mpsc::UnboundedReceiver<SignalingMessage>,
    pub engine: Arc<dyn MediaEngine>,
    pub media_events: mpsc::UnboundedReceiver<MediaEvent>,
}

/// Cloneable front door to a running [`Orchestrator`]
#[derive(Clone)]
pub struct OrchestratorHandle {
    local: ParticipantId,
    commands: mpsc::Sender<Command>,
    updates: broadcast::Sender<ViewUpdate>,
}

impl OrchestratorHandle {
    #[must_use]
    pub const fn local_id(&self) -> &ParticipantId {
        &self.local
    }

    /// Live stream of view changes from now on
    #[must_use]
    pub fn subscribe(&self) -> BroadcastStream<ViewUpdate> {
        BroadcastStream::new(self.updates.subscribe())
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Pin a participant as primary view, or `None` to go back to the broadcaster
    pub async fn request_pin(&self, participant: Option<ParticipantId>) -> Result<()> {
        self.call(|reply| Command::RequestPin { participant, reply }).await?
    }

    /// Ask the relay for the screen lock and start capturing once granted.
    /// Fails with [`Error::LockDenied`] or [`Error::LockTimeout`].
    pub async fn request_screen_share(&self) -> Result<()> {
        self.call(|reply| Command::RequestScreenShare { reply }).await?
    }

    /// Stop the screen track and release the lock in one step
    pub async fn stop_screen_share(&self) -> Result<()> {
        self.call(|reply| Command::StopScreenShare { reply }).await?
    }

    pub async fn set_camera_enabled(&self, enabled: bool) -> Result<()> {
        self.call(|reply| Command::SetCapture {
            kind: TrackKind::Camera,
            enabled,
            reply,
        })
        .await?
    }

    pub async fn set_mic_enabled(&self, enabled: bool) -> Result<()> {
        self.call(|reply| Command::SetCapture {
            kind: TrackKind::Audio,
            enabled,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> Result<SessionView> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    pub async fn stats(&self) -> Result<SessionStats> {
        self.call(|reply| Command::Stats { reply }).await
    }

    /// Tear everything down, release the lock if held and announce departure
    pub async fn leave(&self) -> Result<()> {
        self.call(|reply| Command::Leave { reply }).await
    }
}

struct PendingLock {
    reply: Reply<()>,
    deadline: Instant,
}

/// Everything known about one remote participant besides presence data
#[derive(Default)]
struct PeerEntry {
    pair: Option<PairHandle>,
    phase: Option<SignalingPhase>,
    tracks: ClassifiedTracks,
    media_available: bool,
    /// Transport was lost past the grace period; no new pair until rejoin
    media_lost: bool,
    consecutive_resets: u32,
}

pub struct Orchestrator {
    config: Arc<SessionConfig>,
    local: Participant,
    outbox: Outbox,
    engine: Arc<dyn MediaEngine>,
    presence: PresenceTracker,
    pin: PinSelector,
    /// Mirror of the relay's lock state
    lock_holder: Option<ParticipantId>,
    pending_lock: Option<PendingLock>,
    peers: IndexMap<ParticipantId, PeerEntry>,
    local_tracks: IndexMap<TrackKind, MediaTrack>,
    stats: SessionStats,
    pair_ctx: PairContext,
    pair_events: mpsc::UnboundedReceiver<PairEvent>,
    inbound: mpsc::UnboundedReceiver<SignalingMessage>,
    media_events: mpsc::UnboundedReceiver<MediaEvent>,
    updates: broadcast::Sender<ViewUpdate>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Start the actor for `local` and return its handle
    pub fn spawn(config: SessionConfig, local: Participant, io: SessionIo) -> OrchestratorHandle {
        let config = Arc::new(config);
        let outbox = Outbox::new(io.channel, config.signaling_retry_attempts);
        let (pair_tx, pair_events) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);

        let handle = OrchestratorHandle {
            local: local.id.clone(),
            commands: commands_tx,
            updates: updates.clone(),
        };

        let orchestrator = Self {
            pair_ctx: PairContext {
                config: config.clone(),
                engine: io.engine.clone(),
                outbox: outbox.clone(),
                events: pair_tx,
            },
            config,
            local,
            outbox,
            engine: io.engine,
            presence: PresenceTracker::new(),
            pin: PinSelector::new(),
            lock_holder: None,
            pending_lock: None,
            peers: IndexMap::new(),
            local_tracks: IndexMap::new(),
            stats: SessionStats::default(),
            pair_events,
            inbound: io.inbound,
            media_events: io.media_events,
            updates,
            cancel: CancellationToken::new(),
        };
        tokio::spawn(orchestrator.run(commands));
        handle
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!(
            participant = %self.local.id,
            role = ?self.local.role,
            "Orchestrator started"
        );
        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let lock_deadline = self.pending_lock.as_ref().map(|p| p.deadline);
            tokio::select! {
                () = self.cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(Command::Leave { reply }) => {
                        self.shutdown(true).await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!(participant = %self.local.id, "All handles dropped, leaving");
                        self.shutdown(true).await;
                        return;
                    }
                },
                message = self.inbound.recv() => match message {
                    Some(message) => self.handle_signal(message).await,
                    None => {
                        warn!(participant = %self.local.id, "Relay connection closed");
                        break;
                    }
                },
                Some(event) = self.pair_events.recv() => self.handle_pair_event(event).await,
                Some(event) = self.media_events.recv() => self.route_media(event).await,
                () = sleep_until_opt(lock_deadline) => self.expire_lock_request(),
                _ = heartbeat.tick() => {
                    let beat = SignalingMessage::Heartbeat {
                        participant_id: self.local.id.clone(),
                    };
                    self.send_logged(beat).await;
                }
            }
        }
        self.shutdown(false).await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::RequestPin { participant, reply } => {
                let _ = reply.send(self.request_pin(participant));
            }
            Command::RequestScreenShare { reply } => self.request_screen_share(reply).await,
            Command::StopScreenShare { reply } => {
                let _ = reply.send(self.stop_screen_share().await);
            }
            Command::SetCapture {
                kind,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.set_capture(kind, enabled).await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Stats { reply } => {
                let mut stats = self.stats.clone();
                stats.active_pairs = self.peers.values().filter(|e| e.pair.is_some()).count();
                let _ = reply.send(stats);
            }
            // handled by the run loop
            Command::Leave { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn handle_signal(&mut self, message: SignalingMessage) {
        trace!(participant = %self.local.id, message = message.kind(), "Signal received");
        match message {
            SignalingMessage::Roster { participants } => {
                for participant in participants {
                    self.on_participant_joined(participant, true).await;
                }
            }
            SignalingMessage::Join {
                participant_id,
                role,
                display_name,
            } => {
                let participant = Participant::new(participant_id, role, display_name);
                self.on_participant_joined(participant, false).await;
            }
            SignalingMessage::Leave { participant_id } => {
                self.on_participant_left(&participant_id).await;
            }
            SignalingMessage::StatusUpdate {
                participant_id,
                camera_on,
                mic_on,
                screen_sharing,
            } => {
                let flags = ParticipantFlags {
                    camera_on,
                    mic_on,
                    screen_sharing,
                };
                self.on_status(&participant_id, flags).await;
            }
            SignalingMessage::Offer { from_id, to_id, sdp } => {
                if to_id != self.local.id {
                    warn!(from = %from_id, to = %to_id, "Offer addressed to someone else");
                    return;
                }
                self.on_offer(&from_id, sdp);
            }
            SignalingMessage::Answer { from_id, sdp, .. } => {
                self.forward(&from_id, PairCommand::RemoteAnswer(sdp));
            }
            SignalingMessage::IceCandidate {
                from_id, candidate, ..
            } => {
                self.forward(&from_id, PairCommand::RemoteCandidate(candidate));
            }
            SignalingMessage::ScreenLockGranted { participant_id } => {
                self.on_lock_granted(participant_id).await;
            }
            SignalingMessage::ScreenLockDenied {
                participant_id,
                held_by,
            } => self.on_lock_denied(&participant_id, held_by),
            SignalingMessage::ScreenLockRelease { participant_id } => {
                if self.lock_holder.as_ref() == Some(&participant_id) {
                    debug!(holder = %participant_id, "Screen lock released");
                    self.lock_holder = None;
                }
            }
            SignalingMessage::ScreenLockRequest { .. } | SignalingMessage::Heartbeat { .. } => {
                debug!(participant = %self.local.id, "Ignoring relay-bound message");
            }
        }
    }

    // Presence

    async fn on_participant_joined(&mut self, participant: Participant, from_roster: bool) {
        let id = participant.id.clone();
        if id == self.local.id {
            return;
        }
        if self.presence.on_join(participant).is_some() {
            self.teardown_pair(&id).await;
        }
        self.peers.insert(id.clone(), PeerEntry::default());

        // the newcomer offers; existing participants wait for it
        if self.needs_connection(&id) {
            self.create_pair(&id, from_roster);
        }
        self.publish_participant(&id);
    }

    async fn on_participant_left(&mut self, id: &ParticipantId) {
        self.teardown_pair(id).await;
        self.peers.shift_remove(id);
        if self.presence.on_leave(id).is_none() {
            return;
        }
        if self.lock_holder.as_ref() == Some(id) {
            self.lock_holder = None;
        }
        if self.pin.clear_if(id) {
            self.publish_pin();
        }
        self.emit(ViewUpdate::Left {
            participant_id: id.clone(),
        });
    }

    async fn on_status(&mut self, id: &ParticipantId, flags: ParticipantFlags) {
        if id == &self.local.id {
            return;
        }
        let Some(change) = self.presence.on_status_update(id, flags) else {
            debug!(participant = %id, "Status update for unknown participant");
            return;
        };
        self.apply_share_change(id, &change);
        if change.outbound_changed() {
            self.reconcile_peer(id).await;
        }
    }

    fn apply_share_change(&mut self, id: &ParticipantId, change: &StatusChange) {
        let changed = if change.screen_share_started() {
            self.pin.on_auto_screen_share_change(id, true)
        } else if change.screen_share_stopped() {
            self.pin.on_auto_screen_share_change(id, false)
        } else {
            false
        };
        if changed {
            self.publish_pin();
        }
    }

    fn needs_connection(&self, id: &ParticipantId) -> bool {
        self.presence
            .get(id)
            .is_some_and(|remote| PresenceTracker::needs_connection(&self.local, remote))
    }

    /// Create or prune the lazy connection toward `id` after an outbound change
    async fn reconcile_peer(&mut self, id: &ParticipantId) {
        let needed = self.needs_connection(id);
        let Some(entry) = self.peers.get(id) else {
            return;
        };
        let has_pair = entry.pair.is_some();

        if needed && !has_pair && !entry.media_lost && self.local.flags.has_outbound() {
            self.create_pair(id, true);
        } else if !needed && has_pair {
            info!(local = %self.local.id, remote = %id, "Nobody sends media anymore, pruning connection");
            self.teardown_pair(id).await;
            if let Some(entry) = self.peers.get_mut(id) {
                entry.tracks = ClassifiedTracks::default();
                entry.media_available = false;
            }
            self.publish_participant(id);
        }
    }

    async fn reconcile_all(&mut self) {
        let ids: Vec<ParticipantId> = self.peers.keys().cloned().collect();
        for id in ids {
            self.reconcile_peer(&id).await;
        }
    }

    // Pairs

    fn create_pair(&mut self, remote: &ParticipantId, initiate: bool) {
        let key = ConnectionKey::new(self.local.id.clone(), remote.clone());
        let tracks: Vec<MediaTrack> = self.local_tracks.values().cloned().collect();
        debug!(connection = %key, initiate, tracks = tracks.len(), "Creating connection");
        let handle = spawn_pair(self.pair_ctx.clone(), key, tracks, initiate, &self.cancel);

        let entry = self.peers.entry(remote.clone()).or_default();
        entry.pair = Some(handle);
        entry.phase = Some(SignalingPhase::Idle);
        entry.media_lost = false;
    }

    async fn teardown_pair(&mut self, remote: &ParticipantId) {
        let Some(entry) = self.peers.get_mut(remote) else {
            return;
        };
        let Some(handle) = entry.pair.take() else {
            return;
        };
        entry.phase = None;

        handle.shutdown().await;
        let key = ConnectionKey::new(self.local.id.clone(), remote.clone());
        if let Err(e) = self.engine.close_connection(&key).await {
            warn!(connection = %key, error = %e, "Failed to close media connection");
        }
        debug!(connection = %key, "Connection torn down");
    }

    fn on_offer(&mut self, from: &ParticipantId, sdp: String) {
        if !self.presence.contains(from) {
            warn!(from = %from, "Offer from unknown participant");
            return;
        }
        // a renegotiation that raced with the sender's own status update
        if !self.needs_connection(from) {
            debug!(from = %from, "Offer for a connection nobody needs, ignoring");
            return;
        }
        if !self.peers.get(from).is_some_and(|e| e.pair.is_some()) {
            self.create_pair(from, false);
        }
        self.forward(from, PairCommand::RemoteOffer(sdp));
    }

    fn forward(&self, remote: &ParticipantId, command: PairCommand) {
        match self.peers.get(remote).and_then(|e| e.pair.as_ref()) {
            Some(pair) => {
                if !pair.send(command) {
                    debug!(remote = %remote, "Pair worker already stopped");
                }
            }
            None => debug!(remote = %remote, "No connection for message, dropping"),
        }
    }

    async fn route_media(&mut self, event: MediaEvent) {
        if let MediaEvent::CaptureEnded { track_id } = &event {
            self.on_capture_ended(track_id).await;
            return;
        }
        if let Some(remote) = event.connection().map(|c| c.remote.clone()) {
            self.forward(&remote, PairCommand::Media(event));
        }
    }

    async fn handle_pair_event(&mut self, event: PairEvent) {
        let remote = event.remote;
        let Some(entry) = self.peers.get_mut(&remote) else {
            return;
        };
        if entry.pair.as_ref().map(|p| p.session_id.as_str()) != Some(event.session_id.as_str()) {
            debug!(remote = %remote, session_id = %event.session_id, "Dropping event of a replaced connection");
            return;
        }

        match event.kind {
            PairEventKind::PhaseChanged(phase) => {
                entry.phase = Some(phase);
                if phase == SignalingPhase::Stable {
                    self.stats.negotiations_completed += 1;
                    entry.consecutive_resets = 0;
                    if !entry.media_available {
                        entry.media_available = true;
                        self.publish_participant(&remote);
                    }
                }
            }
            PairEventKind::Classified(tracks) => {
                entry.tracks = tracks;
                self.publish_participant(&remote);
            }
            PairEventKind::Glare { rolled_back: true } => self.stats.glare_rolled_back += 1,
            PairEventKind::Glare { rolled_back: false } => self.stats.glare_ignored += 1,
            PairEventKind::ResetRequired(error) => self.reset_pair(&remote, &error).await,
            PairEventKind::MediaLost => {
                self.teardown_pair(&remote).await;
                if let Some(entry) = self.peers.get_mut(&remote) {
                    entry.tracks = ClassifiedTracks::default();
                    entry.media_available = false;
                    entry.media_lost = true;
                }
                self.publish_participant(&remote);
            }
        }
    }

    /// Tear the pair down and start over with a fresh connection
    async fn reset_pair(&mut self, remote: &ParticipantId, error: &Error) {
        self.stats.resets += 1;
        self.teardown_pair(remote).await;
        let resets = match self.peers.get_mut(remote) {
            Some(entry) => {
                entry.consecutive_resets += 1;
                entry.media_available = false;
                entry.consecutive_resets
            }
            None => return,
        };

        warn!(remote = %remote, error = %error, resets, "Resetting connection");
        self.emit(ViewUpdate::Reconnecting {
            participant_id: remote.clone(),
        });
        if resets >= self.config.reset_warning_threshold {
            self.emit(ViewUpdate::ConnectivityWarning {
                participant_id: remote.clone(),
                resets,
            });
        }
        self.publish_participant(remote);

        if self.needs_connection(remote) {
            self.create_pair(remote, true);
        }
    }

    // Local media

    async fn set_capture(&mut self, kind: TrackKind, enabled: bool) -> Result<()> {
        if enabled == self.local_tracks.contains_key(&kind) {
            return Ok(());
        }
        let mut flags = self.local.flags;
        match kind {
            TrackKind::Camera => flags.camera_on = enabled,
            TrackKind::Audio => flags.mic_on = enabled,
            TrackKind::Screen => {
                return Err(Error::InvalidState(
                    "screen capture goes through the screen share lock".to_string(),
                ));
            }
        }

        if enabled {
            let track = self.engine.open_capture(kind).await?;
            let published = self.publish_flags(flags).await;
            self.add_local_track(track).await;
            published
        } else {
            self.remove_local_track(kind).await;
            let published = self.publish_flags(flags).await;
            self.reconcile_all().await;
            published
        }
    }

    async fn add_local_track(&mut self, track: MediaTrack) {
        info!(participant = %self.local.id, track_id = %track.id, kind = ?track.kind, "Local track started");
        self.local_tracks.insert(track.kind, track.clone());
        for entry in self.peers.values() {
            if let Some(pair) = &entry.pair {
                pair.send(PairCommand::AttachTrack(track.clone()));
            }
        }
        self.reconcile_all().await;
    }

    async fn remove_local_track(&mut self, kind: TrackKind) -> Option<MediaTrack> {
        let track = self.local_tracks.shift_remove(&kind)?;
        for entry in self.peers.values() {
            if let Some(pair) = &entry.pair {
                pair.send(PairCommand::DetachTrack(track.id.clone()));
            }
        }
        if let Err(e) = self.engine.close_capture(&track).await {
            warn!(track_id = %track.id, error = %e, "Failed to close capture");
        }
        info!(participant = %self.local.id, track_id = %track.id, kind = ?kind, "Local track stopped");
        Some(track)
    }

    /// A capture died outside our control; unwind it as if the user had stopped it
    async fn on_capture_ended(&mut self, track_id: &TrackId) {
        let Some(kind) = self
            .local_tracks
            .values()
            .find(|t| &t.id == track_id)
            .map(|t| t.kind)
        else {
            debug!(track_id = %track_id, "Ended capture is no longer in use");
            return;
        };
        warn!(participant = %self.local.id, track_id = %track_id, ?kind, "Local capture ended unexpectedly");

        let result = match kind {
            TrackKind::Screen => self.stop_screen_share().await,
            TrackKind::Camera | TrackKind::Audio => self.set_capture(kind, false).await,
        };
        if let Err(e) = result {
            warn!(participant = %self.local.id, error = %e, "Failed to unwind ended capture");
        }
    }

    /// Record our own flags, apply them to the pin and tell everyone else
    async fn publish_flags(&mut self, flags: ParticipantFlags) -> Result<()> {
        let change = StatusChange {
            previous: self.local.flags,
            current: flags,
        };
        self.local.flags = flags;
        let id = self.local.id.clone();
        self.apply_share_change(&id, &change);
        self.outbox.send(SignalingMessage::status(id, flags)).await
    }

    // Screen share

    fn holds_lock(&self) -> bool {
        self.lock_holder.as_ref() == Some(&self.local.id)
    }

    async fn request_screen_share(&mut self, reply: Reply<()>) {
        if self.local_tracks.contains_key(&TrackKind::Screen) {
            let _ = reply.send(Ok(()));
            return;
        }
        if self.pending_lock.is_some() {
            let _ = reply.send(Err(Error::InvalidState(
                "a screen share request is already pending".to_string(),
            )));
            return;
        }

        let request = SignalingMessage::ScreenLockRequest {
            participant_id: self.local.id.clone(),
        };
        match self.outbox.send(request).await {
            Ok(()) => {
                debug!(participant = %self.local.id, "Screen lock requested");
                self.pending_lock = Some(PendingLock {
                    reply,
                    deadline: Instant::now() + self.config.lock_request_timeout(),
                });
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn on_lock_granted(&mut self, holder: ParticipantId) {
        let is_local = holder == self.local.id;
        self.lock_holder = Some(holder);
        if !is_local {
            return;
        }

        match self.pending_lock.take() {
            Some(pending) => {
                let result = self.start_screen_share().await;
                let _ = pending.reply.send(result);
            }
            None if self.local_tracks.contains_key(&TrackKind::Screen) => {}
            None => {
                warn!(participant = %self.local.id, "Screen lock granted after the request was abandoned, releasing");
                self.release_lock().await;
            }
        }
    }

    fn on_lock_denied(&mut self, requester: &ParticipantId, held_by: ParticipantId) {
        if requester != &self.local.id {
            return;
        }
        info!(participant = %self.local.id, held_by = %held_by, "Screen share denied");
        self.lock_holder = Some(held_by.clone());
        if let Some(pending) = self.pending_lock.take() {
            let _ = pending.reply.send(Err(Error::LockDenied {
                held_by: held_by.clone(),
            }));
        }
        self.emit(ViewUpdate::ScreenShareDenied { held_by });
    }

    fn expire_lock_request(&mut self) {
        if let Some(pending) = self.pending_lock.take() {
            warn!(
                participant = %self.local.id,
                timeout = ?self.config.lock_request_timeout(),
                "Screen lock request timed out"
            );
            let _ = pending.reply.send(Err(Error::LockTimeout));
        }
    }

    async fn start_screen_share(&mut self) -> Result<()> {
        let track = match self.engine.open_capture(TrackKind::Screen).await {
            Ok(track) => track,
            Err(e) => {
                warn!(participant = %self.local.id, error = %e, "Screen capture failed, giving the lock back");
                self.release_lock().await;
                return Err(e);
            }
        };
        let flags = ParticipantFlags {
            screen_sharing: true,
            ..self.local.flags
        };
        let published = self.publish_flags(flags).await;
        self.add_local_track(track).await;
        published
    }

    async fn stop_screen_share(&mut self) -> Result<()> {
        let held = self.holds_lock();
        let had_track = self.remove_local_track(TrackKind::Screen).await.is_some();
        if !held && !had_track {
            return Err(Error::NotLockHolder(self.local.id.clone()));
        }

        let flags = ParticipantFlags {
            screen_sharing: false,
            ..self.local.flags
        };
        let published = self.publish_flags(flags).await;
        if held {
            self.release_lock().await;
        }
        self.reconcile_all().await;
        published
    }

    async fn release_lock(&mut self) {
        if self.holds_lock() {
            self.lock_holder = None;
        }
        let release = SignalingMessage::ScreenLockRelease {
            participant_id: self.local.id.clone(),
        };
        self.send_logged(release).await;
    }

    // View

    fn request_pin(&mut self, participant: Option<ParticipantId>) -> Result<()> {
        if let Some(id) = &participant {
            if id != &self.local.id && !self.presence.contains(id) {
                return Err(Error::NotFound(format!("participant {id}")));
            }
        }
        if self.pin.set_manual(participant) {
            self.publish_pin();
        }
        Ok(())
    }

    fn snapshot(&self) -> SessionView {
        let participants = self
            .presence
            .list()
            .into_iter()
            .map(|participant| {
                let entry = self.peers.get(&participant.id);
                ParticipantView {
                    classified_tracks: entry.map(|e| e.tracks.clone()).unwrap_or_default(),
                    media_available: entry.is_some_and(|e| e.media_available),
                    phase: entry.and_then(|e| e.phase),
                    participant,
                }
            })
            .collect();

        SessionView {
            local: self.local.clone(),
            participants,
            pin: self.pin.current().clone(),
            lock_holder: self.lock_holder.clone(),
        }
    }

    fn publish_participant(&self, id: &ParticipantId) {
        if let Some(entry) = self.peers.get(id) {
            self.emit(ViewUpdate::Participant {
                participant_id: id.clone(),
                classified_tracks: entry.tracks.clone(),
                media_available: entry.media_available,
            });
        }
    }

    fn publish_pin(&self) {
        self.emit(ViewUpdate::Pin {
            selection: self.pin.current().clone(),
        });
    }

    fn emit(&self, update: ViewUpdate) {
        let event_type = update.event_type();
        if self.updates.send(update).is_err() {
            trace!(event_type, "No view subscribers");
        }
    }

    async fn send_logged(&self, message: SignalingMessage) {
        let kind = message.kind();
        if let Err(e) = self.outbox.send(message).await {
            warn!(participant = %self.local.id, message = kind, error = %e, "Failed to send signaling message");
        }
    }

    async fn shutdown(&mut self, announce: bool) {
        if let Some(pending) = self.pending_lock.take() {
            let _ = pending.reply.send(Err(Error::Closed));
        }
        let remotes: Vec<ParticipantId> = self.peers.keys().cloned().collect();
        for remote in &remotes {
            self.teardown_pair(remote).await;
        }
        let tracks: Vec<MediaTrack> = self.local_tracks.drain(..).map(|(_, t)| t).collect();
        for track in &tracks {
            if let Err(e) = self.engine.close_capture(track).await {
                debug!(track_id = %track.id, error = %e, "Capture already closed");
            }
        }

        if announce {
            if self.holds_lock() {
                self.release_lock().await;
            }
            self.send_logged(SignalingMessage::Leave {
                participant_id: self.local.id.clone(),
            })
            .await;
        }
        self.cancel.cancel();
        info!(participant = %self.local.id, "Left session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{CaptureLabels, LoopbackEngine};
    use crate::relay::RelayHub;
    use crate::types::Role;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Relay that accepts everything and never answers
    struct Silent;

    #[async_trait]
    impl SignalingChannel for Silent {
        async fn send(&self, _message: SignalingMessage) -> Result<()> {
            Ok(())
        }
    }

    fn silent_session(id: &str) -> (OrchestratorHandle, mpsc::UnboundedSender<SignalingMessage>) {
        let (engine, media_events) = LoopbackEngine::new(id.into(), CaptureLabels::default());
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let handle = Orchestrator::spawn(
            SessionConfig::default(),
            Participant::new(id, Role::Viewer, id),
            SessionIo {
                channel: Arc::new(Silent),
                inbound,
                engine,
                media_events,
            },
        );
        (handle, inbound_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_request_times_out() {
        let (handle, _inbound) = silent_session("a");
        let started = Instant::now();
        let err = handle.request_screen_share().await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout));
        assert!(started.elapsed() >= SessionConfig::default().lock_request_timeout());
        assert!(err.is_user_facing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pin_unknown_participant_is_rejected() {
        let (handle, inbound) = silent_session("a");
        assert!(matches!(
            handle.request_pin(Some("ghost".into())).await,
            Err(Error::NotFound(_))
        ));

        inbound
            .send(SignalingMessage::Roster {
                participants: vec![Participant::new("t", Role::Broadcaster, "Teacher")],
            })
            .unwrap();
        // the roster and commands arrive on different queues
        while handle.snapshot().await.unwrap().participants.is_empty() {
            tokio::task::yield_now().await;
        }
        handle.request_pin(Some("t".into())).await.unwrap();
        let view = handle.snapshot().await.unwrap();
        assert_eq!(view.pin.participant().unwrap().as_str(), "t");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_sharing_is_not_holder() {
        let (handle, _inbound) = silent_session("a");
        assert!(matches!(
            handle.stop_screen_share().await,
            Err(Error::NotLockHolder(_))
        ));
    }

    fn hub_session(hub: &RelayHub, id: &str) -> (OrchestratorHandle, Arc<LoopbackEngine>) {
        let (engine, media_events) = LoopbackEngine::new(id.into(), CaptureLabels::default());
        let participant = Participant::new(id, Role::Viewer, id);
        let (channel, inbound) = hub.connect(participant.clone());
        let handle = Orchestrator::spawn(
            SessionConfig::default(),
            participant,
            SessionIo {
                channel: Arc::new(channel),
                inbound,
                engine: engine.clone(),
                media_events,
            },
        );
        (handle, engine)
    }

    fn capture_of(engine: &LoopbackEngine, kind: TrackKind) -> MediaTrack {
        engine
            .open_captures()
            .into_iter()
            .find(|t| t.kind == kind)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_failure_gives_lock_back() {
        let hub = RelayHub::new();
        let (handle, engine) = hub_session(&hub, "a");
        engine.fail_next_capture();

        assert!(matches!(handle.request_screen_share().await, Err(Error::Media(_))));
        assert!(hub.lock_holder().is_none());
        handle.request_screen_share().await.unwrap();
        assert_eq!(hub.lock_holder().unwrap().as_str(), "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_screen_capture_ending_releases_lock() {
        let hub = RelayHub::new();
        let (handle, engine) = hub_session(&hub, "a");
        handle.request_screen_share().await.unwrap();
        assert_eq!(hub.lock_holder().unwrap().as_str(), "a");

        let screen = capture_of(&engine, TrackKind::Screen);
        assert!(engine.end_capture(&screen.id));
        while hub.lock_holder().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let view = handle.snapshot().await.unwrap();
        assert!(!view.local.flags.screen_sharing);
        assert!(view.lock_holder.is_none());
        assert!(engine.open_captures().is_empty());

        // the lock can be taken again right away
        handle.request_screen_share().await.unwrap();
        assert_eq!(hub.lock_holder().unwrap().as_str(), "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_unplugged_clears_flag() {
        let hub = RelayHub::new();
        let (handle, engine) = hub_session(&hub, "a");
        handle.set_camera_enabled(true).await.unwrap();
        handle.set_mic_enabled(true).await.unwrap();

        let camera = capture_of(&engine, TrackKind::Camera);
        assert!(engine.end_capture(&camera.id));
        while handle.snapshot().await.unwrap().local.flags.camera_on {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let flags = handle.snapshot().await.unwrap().local.flags;
        assert!(flags.mic_on);
        let open: Vec<_> = engine.open_captures().into_iter().map(|t| t.kind).collect();
        assert_eq!(open, vec![TrackKind::Audio]);

        // turning it back on opens a fresh capture
        handle.set_camera_enabled(true).await.unwrap();
        assert_ne!(capture_of(&engine, TrackKind::Camera).id, camera.id);
    }
}
