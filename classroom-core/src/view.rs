//! Read-only view of orchestrator state for the rendering layer

use serde::{Deserialize, Serialize};

use crate::classifier::ClassifiedTracks;
use crate::connection::SignalingPhase;
use crate::pin::PinSelection;
use crate::types::{Participant, ParticipantId};

/// Incremental change pushed to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ViewUpdate {
    Participant {
        participant_id: ParticipantId,
        classified_tracks: ClassifiedTracks,
        /// False while the pair is being reset or after its transport was lost
        media_available: bool,
    },
    Pin {
        selection: PinSelection,
    },
    /// Automatic reset in progress; shown as a brief reconnecting state
    Reconnecting {
        participant_id: ParticipantId,
    },
    /// Resets kept repeating for this participant
    ConnectivityWarning {
        participant_id: ParticipantId,
        resets: u32,
    },
    ScreenShareDenied {
        held_by: ParticipantId,
    },
    Left {
        participant_id: ParticipantId,
    },
}

impl ViewUpdate {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Participant { .. } => "participant",
            Self::Pin { .. } => "pin",
            Self::Reconnecting { .. } => "reconnecting",
            Self::ConnectivityWarning { .. } => "connectivity-warning",
            Self::ScreenShareDenied { .. } => "screen-share-denied",
            Self::Left { .. } => "left",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub participant: Participant,
    pub classified_tracks: ClassifiedTracks,
    pub media_available: bool,
    /// Phase of the connection toward this participant, if one exists
    pub phase: Option<SignalingPhase>,
}

/// Full state at one instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub local: Participant,
    pub participants: Vec<ParticipantView>,
    pub pin: PinSelection,
    pub lock_holder: Option<ParticipantId>,
}

impl SessionView {
    #[must_use]
    pub fn participant(&self, id: &ParticipantId) -> Option<&ParticipantView> {
        self.participants.iter().find(|p| &p.participant.id == id)
    }
}

/// Session statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Pairs with a running negotiation worker
    pub active_pairs: usize,
    /// Offer/answer exchanges that reached `stable`
    pub negotiations_completed: u64,
    /// Pairs torn down and recreated after a timeout or transport failure
    pub resets: u64,
    /// Glare resolved by rolling back our own offer
    pub glare_rolled_back: u64,
    /// Glare resolved by ignoring the peer's offer
    pub glare_ignored: u64,
}
