//! Classroom connection orchestrator
//!
//! Coordinates the peer-to-peer media mesh of a virtual classroom: one
//! broadcaster (teacher) and any number of viewers (students), connected
//! through a signaling relay.
//!
//! ## Architecture
//!
//! - **`Orchestrator`**: per-participant actor owning session-wide state
//! - **Pair workers**: one task per (local, remote) connection serializing
//!   offer/answer exchanges, resolving glare and resetting stuck pairs
//! - **`classify`**: camera/screen/audio split of a remote participant's tracks
//! - **`ScreenShareLock`**: single-sharer mutual exclusion, arbitrated by the relay
//! - **`PresenceTracker`** / **`PinSelector`**: who is here, who is shown
//! - **`RelayHub`** / **`LoopbackEngine`**: in-process relay and media engine
//!
//! ## Usage
//!
//! ```rust,ignore
//! use classroom_core::{
//!     CaptureLabels, LoopbackEngine, Orchestrator, Participant, RelayHub, Role, SessionConfig,
//!     SessionIo,
//! };
//! use std::sync::Arc;
//!
//! let hub = RelayHub::new();
//! let teacher = Participant::new("teacher", Role::Broadcaster, "Teacher");
//! let (channel, inbound) = hub.connect(teacher.clone());
//! let (engine, media_events) = LoopbackEngine::new(teacher.id.clone(), CaptureLabels::default());
//!
//! let handle = Orchestrator::spawn(
//!     SessionConfig::default(),
//!     teacher,
//!     SessionIo { channel: Arc::new(channel), inbound, engine, media_events },
//! );
//! handle.request_screen_share().await?;
//! ```

mod classifier;
mod config;
mod connection;
mod error;
mod logging;
mod loopback;
mod media;
mod negotiation;
mod orchestrator;
mod pin;
mod presence;
mod relay;
mod screen_lock;
mod signaling;
mod types;
mod view;

pub use classifier::{
    classify, looks_like_camera, looks_like_screen, Classification, ClassifiedTracks,
    ClassifyDebounce, Confidence,
};
pub use config::{Config, LoggingConfig, SessionConfig};
pub use connection::{ConnectionState, SignalingPhase};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use loopback::{CaptureLabels, LoopbackEngine};
pub use media::{IceConnectionState, MediaEngine, MediaEvent, SdpType, SessionDescription};
pub use negotiation::ChangeReason;
pub use orchestrator::{Orchestrator, OrchestratorHandle, SessionIo};
pub use pin::{PinSelection, PinSelector, PinSource};
pub use presence::{PresenceTracker, StatusChange};
pub use relay::{MessageSender, RelayConnection, RelayHub};
pub use screen_lock::{LockEvent, LockEventKind, LockOutcome, ScreenShareLock};
pub use signaling::{Outbox, SignalingChannel, SignalingMessage};
pub use types::{
    ConnectionKey, Direction, Liveness, MediaKind, MediaTrack, Participant, ParticipantFlags,
    ParticipantId, RemoteTrack, Role, TrackId, TrackKind,
};
pub use view::{ParticipantView, SessionStats, SessionView, ViewUpdate};
