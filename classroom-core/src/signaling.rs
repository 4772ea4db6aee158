//! Signaling messages and the channel contract
//!
//! The relay is an external collaborator; the core only depends on
//! [`SignalingChannel`]: ordered, at-most-once delivery per message,
//! addressed by participant id. [`Outbox`] layers bounded retries on top.

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};
use crate::types::{Participant, ParticipantFlags, ParticipantId, Role};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalingMessage {
    Join {
        participant_id: ParticipantId,
        role: Role,
        display_name: String,
    },
    Leave {
        participant_id: ParticipantId,
    },
    /// Sent by the relay to a newcomer: everyone already present
    Roster {
        participants: Vec<Participant>,
    },
    StatusUpdate {
        participant_id: ParticipantId,
        camera_on: bool,
        mic_on: bool,
        screen_sharing: bool,
    },
    Offer {
        from_id: ParticipantId,
        to_id: ParticipantId,
        sdp: String,
    },
    Answer {
        from_id: ParticipantId,
        to_id: ParticipantId,
        sdp: String,
    },
    IceCandidate {
        from_id: ParticipantId,
        to_id: ParticipantId,
        candidate: String,
    },
    ScreenLockRequest {
        participant_id: ParticipantId,
    },
    ScreenLockGranted {
        participant_id: ParticipantId,
    },
    ScreenLockDenied {
        participant_id: ParticipantId,
        held_by: ParticipantId,
    },
    ScreenLockRelease {
        participant_id: ParticipantId,
    },
    /// Keep-alive so the relay can reclaim resources of silent participants
    Heartbeat {
        participant_id: ParticipantId,
    },
}

impl SignalingMessage {
    #[must_use]
    pub fn join(participant: &Participant) -> Self {
        Self::Join {
            participant_id: participant.id.clone(),
            role: participant.role,
            display_name: participant.display_name.clone(),
        }
    }

    #[must_use]
    pub fn status(participant_id: ParticipantId, flags: ParticipantFlags) -> Self {
        Self::StatusUpdate {
            participant_id,
            camera_on: flags.camera_on,
            mic_on: flags.mic_on,
            screen_sharing: flags.screen_sharing,
        }
    }

    /// Participant on whose behalf the message was sent
    #[must_use]
    pub fn origin(&self) -> Option<&ParticipantId> {
        match self {
            Self::Offer { from_id, .. }
            | Self::Answer { from_id, .. }
            | Self::IceCandidate { from_id, .. } => Some(from_id),
            Self::Join { participant_id, .. }
            | Self::Leave { participant_id }
            | Self::StatusUpdate { participant_id, .. }
            | Self::ScreenLockRequest { participant_id }
            | Self::ScreenLockRelease { participant_id }
            | Self::Heartbeat { participant_id } => Some(participant_id),
            Self::Roster { .. } | Self::ScreenLockGranted { .. } | Self::ScreenLockDenied { .. } => {
                None
            }
        }
    }

    /// Addressee of point-to-point messages
    #[must_use]
    pub fn recipient(&self) -> Option<&ParticipantId> {
        match self {
            Self::Offer { to_id, .. } | Self::Answer { to_id, .. } | Self::IceCandidate { to_id, .. } => {
                Some(to_id)
            }
            _ => None,
        }
    }

    /// Short name for logging
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Roster { .. } => "roster",
            Self::StatusUpdate { .. } => "status-update",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::ScreenLockRequest { .. } => "screen-lock-request",
            Self::ScreenLockGranted { .. } => "screen-lock-granted",
            Self::ScreenLockDenied { .. } => "screen-lock-denied",
            Self::ScreenLockRelease { .. } => "screen-lock-release",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Outbound half of a participant's connection to the relay
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, message: SignalingMessage) -> Result<()>;
}

/// Signaling sender with exponential-backoff retries.
///
/// Only [`Error::Transport`] failures are retried; once attempts are
/// exhausted the last transport error is returned to the caller.
#[derive(Clone)]
pub struct Outbox {
    channel: Arc<dyn SignalingChannel>,
    retry_attempts: usize,
}

impl Outbox {
    pub fn new(channel: Arc<dyn SignalingChannel>, retry_attempts: usize) -> Self {
        Self {
            channel,
            retry_attempts,
        }
    }

    pub async fn send(&self, message: SignalingMessage) -> Result<()> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(50))
            .with_max_delay(Duration::from_secs(1))
            .with_max_times(self.retry_attempts)
            .with_jitter()
            .build();

        let mut last_err = None;
        for delay in std::iter::once(Duration::ZERO).chain(backoff) {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }

            match self.channel.send(message.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!(
                        message = message.kind(),
                        error = %e,
                        delay = ?delay,
                        "Signaling send failed"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Transport("retry exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_wire_field_names() {
        let msg = SignalingMessage::Offer {
            from_id: "a".into(),
            to_id: "b".into(),
            sdp: "v=0".to_string(),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["fromId"], "a");
        assert_eq!(json["toId"], "b");
        assert_eq!(json["sdp"], "v=0");

        let denied = SignalingMessage::ScreenLockDenied {
            participant_id: "v1".into(),
            held_by: "t".into(),
        };
        let json = serde_json::to_value(&denied).unwrap();
        assert_eq!(json["type"], "screen-lock-denied");
        assert_eq!(json["participantId"], "v1");
        assert_eq!(json["heldBy"], "t");
    }

    #[test]
    fn test_parse_status_update() {
        let raw = r#"{"type":"status-update","participantId":"p","cameraOn":true,"micOn":false,"screenSharing":true}"#;
        let msg = SignalingMessage::from_json(raw).unwrap();
        assert_eq!(
            msg,
            SignalingMessage::StatusUpdate {
                participant_id: "p".into(),
                camera_on: true,
                mic_on: false,
                screen_sharing: true,
            }
        );
        assert_eq!(msg.origin(), Some(&ParticipantId::from("p")));
        assert!(msg.recipient().is_none());
    }

    #[test]
    fn test_garbage_is_a_serialization_error() {
        assert!(matches!(
            SignalingMessage::from_json("{\"type\":\"nope\"}"),
            Err(Error::Serialization(_))
        ));
    }

    /// Fails the first `failures` sends with a transport error
    struct Flaky {
        failures: Mutex<usize>,
        delivered: Mutex<Vec<SignalingMessage>>,
    }

    #[async_trait]
    impl SignalingChannel for Flaky {
        async fn send(&self, message: SignalingMessage) -> Result<()> {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Transport("flaky".to_string()));
            }
            self.delivered.lock().push(message);
            Ok(())
        }
    }

    fn flaky(failures: usize) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures: Mutex::new(failures),
            delivered: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbox_retries_transport_errors() {
        let channel = flaky(2);
        let outbox = Outbox::new(channel.clone(), 3);
        outbox
            .send(SignalingMessage::Heartbeat { participant_id: "p".into() })
            .await
            .unwrap();
        assert_eq!(channel.delivered.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbox_gives_up_after_attempts() {
        let channel = flaky(10);
        let outbox = Outbox::new(channel.clone(), 2);
        let result = outbox
            .send(SignalingMessage::Heartbeat { participant_id: "p".into() })
            .await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(*channel.failures.lock(), 7);
    }
}
