//! Primary-view ("pinned") participant selection

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::ParticipantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PinSource {
    Manual,
    AutoScreenshare,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PinSelection {
    /// Nothing pinned; the broadcaster is shown
    #[default]
    Default,
    Pinned {
        participant_id: ParticipantId,
        source: PinSource,
    },
}

impl PinSelection {
    #[must_use]
    pub const fn participant(&self) -> Option<&ParticipantId> {
        match self {
            Self::Default => None,
            Self::Pinned { participant_id, .. } => Some(participant_id),
        }
    }

    #[must_use]
    pub const fn source(&self) -> Option<PinSource> {
        match self {
            Self::Default => None,
            Self::Pinned { source, .. } => Some(*source),
        }
    }

    fn pinned(participant_id: ParticipantId, source: PinSource) -> Self {
        Self::Pinned {
            participant_id,
            source,
        }
    }
}

/// Rule precedence:
/// - a manual pin holds until another manual pin, or until a share-stop of
///   the pinned participant clears it;
/// - a share-start always moves the pin to the new sharer;
/// - a share-stop of someone other than the pinned participant changes nothing.
#[derive(Debug, Default)]
pub struct PinSelector {
    current: PinSelection,
}

impl PinSelector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn current(&self) -> &PinSelection {
        &self.current
    }

    /// Returns whether the selection changed
    pub fn set_manual(&mut self, participant: Option<ParticipantId>) -> bool {
        let next = participant.map_or(PinSelection::Default, |id| {
            PinSelection::pinned(id, PinSource::Manual)
        });
        self.replace(next)
    }

    /// Returns whether the selection changed
    pub fn on_auto_screen_share_change(&mut self, participant: &ParticipantId, is_sharing: bool) -> bool {
        if is_sharing {
            return self.replace(PinSelection::pinned(
                participant.clone(),
                PinSource::AutoScreenshare,
            ));
        }
        if self.current.participant() == Some(participant) {
            return self.replace(PinSelection::Default);
        }
        false
    }

    /// Drop the pin if it points at a departed participant
    pub fn clear_if(&mut self, participant: &ParticipantId) -> bool {
        if self.current.participant() == Some(participant) {
            return self.replace(PinSelection::Default);
        }
        false
    }

    fn replace(&mut self, next: PinSelection) -> bool {
        if self.current == next {
            return false;
        }
        debug!(previous = ?self.current, next = ?next, "Pin selection changed");
        self.current = next;
        true
    }
}
