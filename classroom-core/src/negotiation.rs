//! Per-pair renegotiation coordinator
//!
//! Every (local, remote) pair gets one worker task. All mutations of that
//! pair's [`ConnectionState`] happen inside the worker, one command at a
//! time, while different pairs progress concurrently. The worker:
//!
//! - serializes offer/answer exchanges and queues renegotiation requests
//!   that arrive while one is already in flight;
//! - resolves glare statelessly: the lower participant id is polite and
//!   rolls back its own offer, the higher id ignores the incoming one;
//! - resets the pair when `idle`, `local-offering` or `answering` outlives
//!   the negotiation timeout, or when a failed transport comes back;
//! - coalesces inbound track events and re-classifies after the debounce;
//! - tears the pair down once the transport stays disconnected past the
//!   grace period.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classifier::{classify, ClassifiedTracks, ClassifyDebounce, Confidence};
use crate::config::SessionConfig;
use crate::connection::{ConnectionState, SignalingPhase};
use crate::error::{Error, Result};
use crate::media::{IceConnectionState, MediaEngine, MediaEvent, SessionDescription};
use crate::signaling::{Outbox, SignalingMessage};
use crate::types::{ConnectionKey, MediaTrack, ParticipantId, TrackId};

/// Why an offer is being produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    Initial,
    TrackAdded,
    TrackRemoved,
    /// Changes carried by an offer the polite side rolled back
    GlareRollback,
}

#[derive(Debug)]
pub(crate) enum PairCommand {
    RemoteOffer(String),
    RemoteAnswer(String),
    RemoteCandidate(String),
    AttachTrack(MediaTrack),
    DetachTrack(TrackId),
    Media(MediaEvent),
}

#[derive(Debug)]
pub(crate) enum PairEventKind {
    PhaseChanged(SignalingPhase),
    Classified(ClassifiedTracks),
    Glare { rolled_back: bool },
    /// The pair must be torn down and recreated
    ResetRequired(Error),
    /// Transport stayed down past the grace period
    MediaLost,
}

#[derive(Debug)]
pub(crate) struct PairEvent {
    pub remote: ParticipantId,
    /// Identifies the worker generation; stale events are dropped by the receiver
    pub session_id: String,
    pub kind: PairEventKind,
}

/// Everything a worker borrows from its orchestrator
#[derive(Clone)]
pub(crate) struct PairContext {
    pub config: Arc<SessionConfig>,
    pub engine: Arc<dyn MediaEngine>,
    pub outbox: Outbox,
    pub events: mpsc::UnboundedSender<PairEvent>,
}

/// Orchestrator-side handle to a running pair worker
pub(crate) struct PairHandle {
    pub session_id: String,
    commands: mpsc::UnboundedSender<PairCommand>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PairHandle {
    /// Returns false if the worker has already stopped
    pub fn send(&self, command: PairCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Cancel the worker and wait until it no longer touches the engine
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!(session_id = %self.session_id, "Pair worker panicked");
            }
        }
    }
}

/// Start a worker for `key`. With `initiate` it offers immediately,
/// otherwise it waits in `idle` for the peer's offer.
pub(crate) fn spawn_pair(
    ctx: PairContext,
    key: ConnectionKey,
    initial_tracks: Vec<MediaTrack>,
    initiate: bool,
    parent: &CancellationToken,
) -> PairHandle {
    let (commands, rx) = mpsc::unbounded_channel();
    let cancel = parent.child_token();
    let conn = ConnectionState::new(key);
    let session_id = conn.session_id.clone();

    let worker = PairWorker {
        debounce: ClassifyDebounce::new(ctx.config.classify_debounce()),
        ctx,
        conn,
        pending: None,
        disconnected_since: None,
        cancel: cancel.clone(),
    };
    let task = tokio::spawn(worker.run(rx, initial_tracks, initiate));

    PairHandle {
        session_id,
        commands,
        cancel,
        task,
    }
}

enum Exit {
    Cancelled,
    Reset(Error),
    MediaLost,
}

struct PairWorker {
    ctx: PairContext,
    conn: ConnectionState,
    /// Renegotiation requested while another exchange was in flight
    pending: Option<ChangeReason>,
    debounce: ClassifyDebounce,
    disconnected_since: Option<Instant>,
    cancel: CancellationToken,
}

pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl PairWorker {
    fn remote(&self) -> &ParticipantId {
        &self.conn.key.remote
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PairCommand>,
        initial_tracks: Vec<MediaTrack>,
        initiate: bool,
    ) {
        let cancel = self.cancel.clone();
        let exit = tokio::select! {
            biased;
            () = cancel.cancelled() => Exit::Cancelled,
            exit = self.drive(&mut commands, initial_tracks, initiate) => exit,
        };

        match exit {
            Exit::Cancelled => {
                debug!(connection = %self.conn.key, "Pair worker cancelled");
            }
            Exit::Reset(error) => {
                warn!(connection = %self.conn.key, error = %error, "Pair requires reset");
                self.emit(PairEventKind::ResetRequired(error));
            }
            Exit::MediaLost => {
                warn!(
                    connection = %self.conn.key,
                    grace = ?self.ctx.config.disconnect_grace(),
                    "Transport down past grace period, tearing down pair"
                );
                self.emit(PairEventKind::MediaLost);
            }
        }
    }

    async fn drive(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<PairCommand>,
        initial_tracks: Vec<MediaTrack>,
        initiate: bool,
    ) -> Exit {
        for track in initial_tracks {
            if let Err(e) = self.attach(track).await {
                warn!(connection = %self.conn.key, error = %e, "Failed to attach initial track");
            }
        }
        if initiate {
            if let Err(e) = self.offer(ChangeReason::Initial).await {
                return Exit::Reset(e);
            }
        }

        loop {
            let now_phase = self.conn.phase();
            let negotiation_deadline = now_phase
                .is_transient()
                .then(|| self.conn.phase_since() + self.ctx.config.negotiation_timeout());
            let grace_deadline = self
                .disconnected_since
                .map(|since| since + self.ctx.config.disconnect_grace());

            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        return Exit::Cancelled;
                    };
                    if let Err(e) = self.handle(command).await {
                        match e {
                            Error::Transport(_) => return Exit::Reset(e),
                            Error::DuplicateTrack(id) => {
                                debug!(connection = %self.conn.key, track_id = %id, "Duplicate track ignored");
                            }
                            other => {
                                warn!(connection = %self.conn.key, error = %other, "Pair command failed");
                            }
                        }
                    }
                }
                () = sleep_until_opt(negotiation_deadline) => {
                    return Exit::Reset(Error::NegotiationTimeout {
                        remote: self.remote().clone(),
                        phase: now_phase.to_string(),
                    });
                }
                () = sleep_until_opt(self.debounce.deadline()) => {
                    self.classify();
                }
                () = sleep_until_opt(grace_deadline) => {
                    return Exit::MediaLost;
                }
            }
        }
    }

    async fn handle(&mut self, command: PairCommand) -> Result<()> {
        match command {
            PairCommand::RemoteOffer(sdp) => self.on_remote_offer(sdp).await,
            PairCommand::RemoteAnswer(sdp) => self.on_remote_answer(sdp).await,
            PairCommand::RemoteCandidate(candidate) => {
                if let Err(e) = self.ctx.engine.add_ice_candidate(&self.conn.key, &candidate).await {
                    debug!(connection = %self.conn.key, error = %e, "Remote candidate rejected");
                }
                Ok(())
            }
            PairCommand::AttachTrack(track) => {
                if self.attach(track).await? {
                    self.renegotiate(ChangeReason::TrackAdded).await?;
                }
                Ok(())
            }
            PairCommand::DetachTrack(track_id) => {
                if self.conn.detach_outbound(&track_id).is_some() {
                    self.ctx.engine.detach_local_track(&self.conn.key, &track_id).await?;
                    self.renegotiate(ChangeReason::TrackRemoved).await?;
                }
                Ok(())
            }
            PairCommand::Media(event) => self.on_media_event(event).await,
        }
    }

    async fn attach(&mut self, track: MediaTrack) -> Result<bool> {
        if !self.conn.attach_outbound(track.clone()) {
            debug!(connection = %self.conn.key, track_id = %track.id, "Track already attached");
            return Ok(false);
        }
        self.ctx.engine.attach_local_track(&self.conn.key, &track).await?;
        Ok(true)
    }

    fn set_phase(&mut self, phase: SignalingPhase) -> Result<()> {
        let previous = self.conn.phase();
        self.conn.transition(phase)?;
        if previous != phase {
            debug!(connection = %self.conn.key, from = %previous, to = %phase, "Phase changed");
            self.emit(PairEventKind::PhaseChanged(phase));
        }
        Ok(())
    }

    /// Offer now if the pair is stable, otherwise queue the request. In
    /// `idle` the peer's first offer is on its way and carries the queue.
    async fn renegotiate(&mut self, reason: ChangeReason) -> Result<()> {
        match self.conn.phase() {
            SignalingPhase::Stable => self.offer(reason).await,
            SignalingPhase::Idle | SignalingPhase::LocalOffering | SignalingPhase::Answering => {
                debug!(connection = %self.conn.key, ?reason, phase = %self.conn.phase(), "Renegotiation queued");
                self.pending.get_or_insert(reason);
                Ok(())
            }
            phase @ (SignalingPhase::Failed | SignalingPhase::Closed) => Err(Error::InvalidState(
                format!("{}: cannot renegotiate while {phase}", self.conn.key),
            )),
        }
    }

    async fn offer(&mut self, reason: ChangeReason) -> Result<()> {
        self.set_phase(SignalingPhase::LocalOffering)?;
        let sdp = self.ctx.engine.create_offer(&self.conn.key).await?;
        self.ctx
            .outbox
            .send(SignalingMessage::Offer {
                from_id: self.conn.key.local.clone(),
                to_id: self.conn.key.remote.clone(),
                sdp,
            })
            .await?;
        debug!(connection = %self.conn.key, ?reason, "Offer sent");
        Ok(())
    }

    async fn on_remote_offer(&mut self, sdp: String) -> Result<()> {
        match self.conn.phase() {
            SignalingPhase::LocalOffering if self.conn.key.is_polite() => {
                info!(connection = %self.conn.key, "Glare: polite side rolling back its offer");
                self.ctx.engine.rollback_local_offer(&self.conn.key).await?;
                self.pending.get_or_insert(ChangeReason::GlareRollback);
                self.emit(PairEventKind::Glare { rolled_back: true });
            }
            SignalingPhase::LocalOffering => {
                info!(connection = %self.conn.key, "Glare: impolite side ignoring remote offer");
                self.emit(PairEventKind::Glare { rolled_back: false });
                return Ok(());
            }
            phase @ (SignalingPhase::Failed | SignalingPhase::Closed) => {
                return Err(Error::InvalidState(format!(
                    "{}: offer received while {phase}",
                    self.conn.key
                )));
            }
            SignalingPhase::Idle | SignalingPhase::Stable | SignalingPhase::Answering => {}
        }

        self.set_phase(SignalingPhase::Answering)?;
        self.ctx
            .engine
            .set_remote_description(&self.conn.key, &SessionDescription::offer(sdp))
            .await?;
        let answer = self.ctx.engine.create_answer(&self.conn.key).await?;
        self.ctx
            .outbox
            .send(SignalingMessage::Answer {
                from_id: self.conn.key.local.clone(),
                to_id: self.conn.key.remote.clone(),
                sdp: answer,
            })
            .await?;
        self.become_stable().await
    }

    async fn on_remote_answer(&mut self, sdp: String) -> Result<()> {
        if self.conn.phase() != SignalingPhase::LocalOffering {
            warn!(
                connection = %self.conn.key,
                phase = %self.conn.phase(),
                "Ignoring answer without an outstanding offer"
            );
            return Ok(());
        }
        self.ctx
            .engine
            .set_remote_description(&self.conn.key, &SessionDescription::answer(sdp))
            .await?;
        self.become_stable().await
    }

    async fn become_stable(&mut self) -> Result<()> {
        self.set_phase(SignalingPhase::Stable)?;
        if let Some(reason) = self.pending.take() {
            debug!(connection = %self.conn.key, ?reason, "Running queued renegotiation");
            self.offer(reason).await?;
        }
        Ok(())
    }

    async fn on_media_event(&mut self, event: MediaEvent) -> Result<()> {
        match event {
            MediaEvent::RemoteTrack { track, .. } => {
                debug!(connection = %self.conn.key, track_id = %track.id, label = %track.label, "Remote track arrived");
                for old in self.conn.add_inbound(track)? {
                    debug!(connection = %self.conn.key, track_id = %old, "Superseded remote track retired");
                }
                self.debounce.touch(Instant::now());
            }
            MediaEvent::TrackEnded { track_id, .. } => {
                if self.conn.end_inbound(&track_id) {
                    debug!(connection = %self.conn.key, track_id = %track_id, "Remote track ended");
                    self.debounce.touch(Instant::now());
                }
            }
            MediaEvent::IceCandidate { candidate, .. } => {
                self.ctx
                    .outbox
                    .send(SignalingMessage::IceCandidate {
                        from_id: self.conn.key.local.clone(),
                        to_id: self.conn.key.remote.clone(),
                        candidate,
                    })
                    .await?;
            }
            MediaEvent::ConnectionStateChanged { state, .. } => match state {
                IceConnectionState::Connected => {
                    if self.disconnected_since.take().is_some() {
                        info!(connection = %self.conn.key, "Transport recovered");
                    }
                    // a failed session cannot negotiate again; start over
                    if self.conn.phase() == SignalingPhase::Failed {
                        return Err(Error::Transport(format!(
                            "{}: transport came back after failing",
                            self.conn.key
                        )));
                    }
                }
                IceConnectionState::Disconnected => {
                    warn!(connection = %self.conn.key, "Transport disconnected, waiting for ICE to recover");
                    self.disconnected_since.get_or_insert_with(Instant::now);
                }
                IceConnectionState::Failed => {
                    warn!(connection = %self.conn.key, "Transport failed");
                    self.set_phase(SignalingPhase::Failed)?;
                    self.disconnected_since.get_or_insert_with(Instant::now);
                }
            },
            // local captures are the orchestrator's business
            MediaEvent::CaptureEnded { .. } => {}
        }
        Ok(())
    }

    fn classify(&mut self) {
        if !self.debounce.fire(Instant::now()) {
            return;
        }
        let result = classify(self.remote(), &self.conn.live_inbound());
        if result.confidence == Confidence::Fallback {
            let error = Error::ClassificationAmbiguous(self.remote().clone());
            warn!(
                connection = %self.conn.key,
                error = %error,
                "Low-confidence classification: first video is camera, second is screen"
            );
        }
        for track in &result.ignored {
            debug!(connection = %self.conn.key, track_id = %track.id, "Extra video track left unclassified");
        }
        self.emit(PairEventKind::Classified(result.tracks));
    }

    fn emit(&self, kind: PairEventKind) {
        let event = PairEvent {
            remote: self.remote().clone(),
            session_id: self.conn.session_id.clone(),
            kind,
        };
        if self.ctx.events.send(event).is_err() {
            debug!(connection = %self.conn.key, "Orchestrator gone, dropping pair event");
        }
    }
}
