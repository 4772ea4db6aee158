//! Session-wide screen-share mutual exclusion
//!
//! One `ScreenShareLock` exists per session and lives with the relay,
//! which arbitrates `screen-lock-request` messages. Participants only see
//! a read-only mirror of the holder, kept current by the relay's
//! grant/release broadcasts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::ParticipantId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    Denied { held_by: ParticipantId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockEventKind {
    Granted,
    Released,
    /// Reclaimed by the system after the holder disconnected
    ForceReleased,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEvent {
    pub participant: ParticipantId,
    pub kind: LockEventKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ScreenShareLock {
    holder: Option<ParticipantId>,
    acquired_at: Option<DateTime<Utc>>,
    events: Vec<LockEvent>,
}

impl ScreenShareLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-acquiring by the current holder is granted again without a new event.
    pub fn acquire(&mut self, participant: &ParticipantId) -> LockOutcome {
        match &self.holder {
            Some(holder) if holder == participant => {
                debug!(participant = %participant, "Screen lock re-acquired by holder");
                LockOutcome::Granted
            }
            Some(holder) => {
                debug!(participant = %participant, held_by = %holder, "Screen lock denied");
                LockOutcome::Denied {
                    held_by: holder.clone(),
                }
            }
            None => {
                let now = Utc::now();
                self.holder = Some(participant.clone());
                self.acquired_at = Some(now);
                self.record(participant, LockEventKind::Granted, now);
                info!(participant = %participant, "Screen lock granted");
                LockOutcome::Granted
            }
        }
    }

    /// User-initiated release; only the holder may release.
    pub fn release(&mut self, participant: &ParticipantId) -> Result<()> {
        if self.holder.as_ref() != Some(participant) {
            warn!(
                participant = %participant,
                holder = ?self.holder,
                "Screen lock release by non-holder"
            );
            return Err(Error::NotLockHolder(participant.clone()));
        }
        self.clear(participant, LockEventKind::Released);
        info!(participant = %participant, "Screen lock released");
        Ok(())
    }

    /// System-initiated release on disconnect. Returns whether `participant`
    /// actually held the lock.
    pub fn force_release(&mut self, participant: &ParticipantId) -> bool {
        if self.holder.as_ref() != Some(participant) {
            return false;
        }
        self.clear(participant, LockEventKind::ForceReleased);
        warn!(participant = %participant, "Screen lock reclaimed from departed holder");
        true
    }

    #[must_use]
    pub const fn holder(&self) -> Option<&ParticipantId> {
        self.holder.as_ref()
    }

    #[must_use]
    pub const fn acquired_at(&self) -> Option<DateTime<Utc>> {
        self.acquired_at
    }

    #[must_use]
    pub fn events(&self) -> &[LockEvent] {
        &self.events
    }

    /// Scan the event log for grants issued while someone else held the
    /// lock. Returns `(holder, second_grantee)` for every overlap.
    #[must_use]
    pub fn overlapping_grants(&self) -> Vec<(ParticipantId, ParticipantId)> {
        let mut current: Option<&ParticipantId> = None;
        let mut overlaps = Vec::new();
        for event in &self.events {
            match event.kind {
                LockEventKind::Granted => {
                    if let Some(holder) = current {
                        overlaps.push((holder.clone(), event.participant.clone()));
                    }
                    current = Some(&event.participant);
                }
                LockEventKind::Released | LockEventKind::ForceReleased => {
                    if current == Some(&event.participant) {
                        current = None;
                    }
                }
            }
        }
        overlaps
    }

    fn clear(&mut self, participant: &ParticipantId, kind: LockEventKind) {
        self.holder = None;
        self.acquired_at = None;
        self.record(participant, kind, Utc::now());
    }

    fn record(&mut self, participant: &ParticipantId, kind: LockEventKind, at: DateTime<Utc>) {
        self.events.push(LockEvent {
            participant: participant.clone(),
            kind,
            at,
        });
    }
}
