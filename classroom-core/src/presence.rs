//! Authoritative participant list
//!
//! The tracker only records who is present and what they declare; acting
//! on those changes (connections, lock, pin) is the orchestrator's job.

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::types::{Participant, ParticipantFlags, ParticipantId};

/// Flag change reported by a status update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub previous: ParticipantFlags,
    pub current: ParticipantFlags,
}

impl StatusChange {
    #[must_use]
    pub const fn screen_share_started(&self) -> bool {
        !self.previous.screen_sharing && self.current.screen_sharing
    }

    #[must_use]
    pub const fn screen_share_stopped(&self) -> bool {
        self.previous.screen_sharing && !self.current.screen_sharing
    }

    #[must_use]
    pub const fn outbound_changed(&self) -> bool {
        self.previous.has_outbound() != self.current.has_outbound()
    }
}

#[derive(Debug, Default)]
pub struct PresenceTracker {
    participants: IndexMap<ParticipantId, Participant>,
}

impl PresenceTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a join. Returns the flags previously on record when the
    /// participant was already present (a rejoin).
    pub fn on_join(&mut self, participant: Participant) -> Option<ParticipantFlags> {
        let previous = self
            .participants
            .insert(participant.id.clone(), participant.clone())
            .map(|old| old.flags);
        match previous {
            Some(_) => debug!(participant = %participant.id, "Participant rejoined"),
            None => info!(
                participant = %participant.id,
                role = ?participant.role,
                display_name = %participant.display_name,
                "Participant joined"
            ),
        }
        previous
    }

    pub fn on_leave(&mut self, id: &ParticipantId) -> Option<Participant> {
        let removed = self.participants.shift_remove(id);
        if removed.is_some() {
            info!(participant = %id, "Participant left");
        }
        removed
    }

    /// Apply declared flags. Unknown participants are ignored.
    pub fn on_status_update(
        &mut self,
        id: &ParticipantId,
        flags: ParticipantFlags,
    ) -> Option<StatusChange> {
        let participant = self.participants.get_mut(id)?;
        let previous = participant.flags;
        participant.flags = flags;
        debug!(participant = %id, ?previous, current = ?flags, "Participant status updated");
        Some(StatusChange {
            previous,
            current: flags,
        })
    }

    #[must_use]
    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.contains_key(id)
    }

    #[must_use]
    pub fn list(&self) -> Vec<Participant> {
        self.participants.values().cloned().collect()
    }

    #[must_use]
    pub fn broadcaster(&self) -> Option<&Participant> {
        self.participants.values().find(|p| p.is_broadcaster())
    }

    /// Mesh rule: the broadcaster is always connected to every viewer;
    /// two viewers only once either of them is sending something.
    #[must_use]
    pub fn needs_connection(local: &Participant, remote: &Participant) -> bool {
        local.is_broadcaster()
            || remote.is_broadcaster()
            || local.flags.has_outbound()
            || remote.flags.has_outbound()
    }
}
