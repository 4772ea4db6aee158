//! In-memory signaling relay
//!
//! `RelayHub` plays the server side of the signaling channel for a single
//! classroom: it keeps one outbound queue per connected participant, routes
//! point-to-point negotiation messages, fans out presence changes and is
//! the authority for the session's [`ScreenShareLock`].

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::screen_lock::{LockEvent, LockOutcome, ScreenShareLock};
use crate::signaling::{SignalingChannel, SignalingMessage};
use crate::types::{Participant, ParticipantFlags, ParticipantId};

/// Message sender for a connected participant
pub type MessageSender = mpsc::UnboundedSender<SignalingMessage>;

#[derive(Debug)]
struct Member {
    participant: Participant,
    sender: MessageSender,
    last_seen: Instant,
    joined_seq: u64,
}

#[derive(Clone, Default)]
pub struct RelayHub {
    members: Arc<DashMap<ParticipantId, Member>>,
    lock: Arc<Mutex<ScreenShareLock>>,
    /// (from, to) routes whose point-to-point messages are swallowed
    dropped_routes: Arc<DashSet<(ParticipantId, ParticipantId)>>,
    seq: Arc<AtomicU64>,
}

impl RelayHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant. The newcomer receives a roster of everyone
    /// already present (and the current lock holder, if any); everyone else
    /// receives its `join`.
    pub fn connect(
        &self,
        participant: Participant,
    ) -> (RelayConnection, mpsc::UnboundedReceiver<SignalingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = participant.id.clone();
        let join = SignalingMessage::join(&participant);

        let mut roster: Vec<(u64, Participant)> = self
            .members
            .iter()
            .filter(|m| m.key() != &id)
            .map(|m| (m.joined_seq, m.participant.clone()))
            .collect();
        roster.sort_by_key(|(seq, _)| *seq);

        let _ = tx.send(SignalingMessage::Roster {
            participants: roster.into_iter().map(|(_, p)| p).collect(),
        });
        if let Some(holder) = self.lock_holder() {
            let _ = tx.send(SignalingMessage::ScreenLockGranted {
                participant_id: holder,
            });
        }

        let member = Member {
            participant,
            sender: tx,
            last_seen: Instant::now(),
            joined_seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        if self.members.insert(id.clone(), member).is_some() {
            info!(participant = %id, "Participant reconnected to relay");
        } else {
            info!(participant = %id, "Participant connected to relay");
        }

        self.broadcast(&join, Some(&id));

        (
            RelayConnection {
                hub: self.clone(),
                participant_id: id,
            },
            rx,
        )
    }

    /// Remove a participant, reclaiming its lock and announcing its departure.
    /// Returns false if it was not connected.
    pub fn disconnect(&self, id: &ParticipantId) -> bool {
        if self.members.remove(id).is_none() {
            return false;
        }
        self.dropped_routes.retain(|(from, to)| from != id && to != id);

        let released = self.lock.lock().force_release(id);
        if released {
            self.broadcast(
                &SignalingMessage::ScreenLockRelease {
                    participant_id: id.clone(),
                },
                None,
            );
        }
        self.broadcast(
            &SignalingMessage::Leave {
                participant_id: id.clone(),
            },
            None,
        );
        info!(participant = %id, lock_released = released, "Participant disconnected from relay");
        true
    }

    /// Process one message sent by `from`
    pub fn handle(&self, from: &ParticipantId, message: SignalingMessage) -> Result<()> {
        match self.members.get_mut(from) {
            Some(mut member) => member.last_seen = Instant::now(),
            None => {
                return Err(Error::Transport(format!("{from} is not connected to the relay")));
            }
        }
        trace!(from = %from, message = message.kind(), "Relay received message");

        match message {
            SignalingMessage::Offer { .. }
            | SignalingMessage::Answer { .. }
            | SignalingMessage::IceCandidate { .. } => self.route(from, message),
            SignalingMessage::StatusUpdate {
                camera_on,
                mic_on,
                screen_sharing,
                ..
            } => {
                let flags = ParticipantFlags {
                    camera_on,
                    mic_on,
                    screen_sharing,
                };
                if let Some(mut member) = self.members.get_mut(from) {
                    member.participant.flags = flags;
                }
                self.broadcast(&SignalingMessage::status(from.clone(), flags), Some(from));
                Ok(())
            }
            SignalingMessage::ScreenLockRequest { .. } => {
                let outcome = self.lock.lock().acquire(from);
                match outcome {
                    LockOutcome::Granted => {
                        self.broadcast(
                            &SignalingMessage::ScreenLockGranted {
                                participant_id: from.clone(),
                            },
                            None,
                        );
                    }
                    LockOutcome::Denied { held_by } => {
                        self.send_to(
                            from,
                            SignalingMessage::ScreenLockDenied {
                                participant_id: from.clone(),
                                held_by,
                            },
                        )?;
                    }
                }
                Ok(())
            }
            SignalingMessage::ScreenLockRelease { .. } => {
                self.lock.lock().release(from)?;
                self.broadcast(
                    &SignalingMessage::ScreenLockRelease {
                        participant_id: from.clone(),
                    },
                    None,
                );
                Ok(())
            }
            SignalingMessage::Leave { .. } => {
                self.disconnect(from);
                Ok(())
            }
            SignalingMessage::Heartbeat { .. } => Ok(()),
            other => {
                warn!(from = %from, message = other.kind(), "Relay ignoring server-only message");
                Ok(())
            }
        }
    }

    fn route(&self, from: &ParticipantId, message: SignalingMessage) -> Result<()> {
        let Some(to) = message.recipient().cloned() else {
            return Ok(());
        };
        if self.dropped_routes.contains(&(from.clone(), to.clone())) {
            debug!(from = %from, to = %to, message = message.kind(), "Route dropped, swallowing message");
            return Ok(());
        }
        self.send_to(&to, message)
    }

    fn send_to(&self, to: &ParticipantId, message: SignalingMessage) -> Result<()> {
        let sender = self
            .members
            .get(to)
            .map(|m| m.sender.clone())
            .ok_or_else(|| Error::Transport(format!("unknown recipient {to}")))?;
        sender
            .send(message)
            .map_err(|_| Error::Transport(format!("connection to {to} closed")))
    }

    /// Send to every connected participant except `except`
    pub fn broadcast(&self, message: &SignalingMessage, except: Option<&ParticipantId>) -> usize {
        // collect first: no map guard may be held while disconnecting
        let targets: Vec<(ParticipantId, MessageSender)> = self
            .members
            .iter()
            .filter(|m| Some(m.key()) != except)
            .map(|m| (m.key().clone(), m.sender.clone()))
            .collect();

        let mut sent_count = 0;
        let mut failed = Vec::new();
        for (id, sender) in targets {
            match sender.send(message.clone()) {
                Ok(()) => sent_count += 1,
                Err(_) => {
                    warn!(participant = %id, message = message.kind(), "Failed to deliver, marking for cleanup");
                    failed.push(id);
                }
            }
        }
        for id in failed {
            self.disconnect(&id);
        }
        sent_count
    }

    /// Disconnect every participant silent for longer than `grace`
    pub fn sweep(&self, grace: Duration) -> Vec<ParticipantId> {
        let now = Instant::now();
        let silent: Vec<ParticipantId> = self
            .members
            .iter()
            .filter(|m| now.duration_since(m.last_seen) > grace)
            .map(|m| m.key().clone())
            .collect();
        for id in &silent {
            warn!(participant = %id, grace = ?grace, "Participant silent past grace period, reclaiming");
            self.disconnect(id);
        }
        silent
    }

    /// Periodically reclaim silent participants until `cancel` fires
    pub fn spawn_liveness_sweeper(&self, grace: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let hub = self.clone();
        let period = (grace / 4).max(Duration::from_millis(250));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        hub.sweep(grace);
                    }
                }
            }
            debug!("Relay liveness sweeper stopped");
        })
    }

    /// Swallow offers, answers and candidates sent from `from` to `to`
    pub fn drop_route(&self, from: &ParticipantId, to: &ParticipantId) {
        self.dropped_routes.insert((from.clone(), to.clone()));
    }

    pub fn restore_route(&self, from: &ParticipantId, to: &ParticipantId) {
        self.dropped_routes.remove(&(from.clone(), to.clone()));
    }

    #[must_use]
    pub fn is_connected(&self, id: &ParticipantId) -> bool {
        self.members.contains_key(id)
    }

    #[must_use]
    pub fn participants(&self) -> Vec<Participant> {
        let mut members: Vec<(u64, Participant)> = self
            .members
            .iter()
            .map(|m| (m.joined_seq, m.participant.clone()))
            .collect();
        members.sort_by_key(|(seq, _)| *seq);
        members.into_iter().map(|(_, p)| p).collect()
    }

    #[must_use]
    pub fn lock_holder(&self) -> Option<ParticipantId> {
        self.lock.lock().holder().cloned()
    }

    #[must_use]
    pub fn lock_events(&self) -> Vec<LockEvent> {
        self.lock.lock().events().to_vec()
    }

    #[must_use]
    pub fn overlapping_grants(&self) -> Vec<(ParticipantId, ParticipantId)> {
        self.lock.lock().overlapping_grants()
    }
}

/// A participant's link to the relay
#[derive(Clone)]
pub struct RelayConnection {
    hub: RelayHub,
    participant_id: ParticipantId,
}

impl RelayConnection {
    #[must_use]
    pub const fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }
}

#[async_trait]
impl SignalingChannel for RelayConnection {
    async fn send(&self, message: SignalingMessage) -> Result<()> {
        self.hub.handle(&self.participant_id, message)
    }
}
