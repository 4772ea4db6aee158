//! Track classification
//!
//! The transport carries no semantic tag saying whether a video track is a
//! camera or a screen capture; only the device label survives. This module
//! labels inbound tracks from that string, falling back to arrival order
//! when the labels do not disambiguate. Classification is a pure function
//! and is re-run after every track add/remove, coalesced by
//! [`ClassifyDebounce`].

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{Direction, Liveness, MediaKind, MediaTrack, ParticipantId, RemoteTrack, TrackKind};

/// Substrings of capture labels that indicate display capture, covering
/// the names desktop OSes and browsers give to screen/window sources.
const SCREEN_LABEL_HINTS: &[&str] = &[
    "screen",
    "window",
    "monitor",
    "display",
    "desktop",
    "entire",
    "web-contents-media-stream",
    "browser tab",
    "chrome tab",
    "pipewire",
    "wayland",
    "xdg-desktop-portal",
];

/// Substrings of capture labels that positively name a camera device
const CAMERA_LABEL_HINTS: &[&str] = &["camera", "webcam", "facetime", "isight", "cam ", "usb video"];

/// Longest a burst of track events can postpone classification
const MAX_DEBOUNCE_MULTIPLIER: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Labels alone decided every video track
    Label,
    /// Arrival order decided at least one video track
    Fallback,
}

/// Tracks of one remote participant sorted by purpose
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedTracks {
    pub camera: Option<MediaTrack>,
    pub screen: Option<MediaTrack>,
    pub audio: Vec<MediaTrack>,
}

impl ClassifiedTracks {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.camera.is_none() && self.screen.is_none() && self.audio.is_empty()
    }

    #[must_use]
    pub const fn has_screen(&self) -> bool {
        self.screen.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub tracks: ClassifiedTracks,
    pub confidence: Confidence,
    /// Video tracks beyond one camera and one screen
    pub ignored: Vec<RemoteTrack>,
}

/// Whether a capture label looks like display capture
#[must_use]
pub fn looks_like_screen(label: &str) -> bool {
    let label = label.to_lowercase();
    SCREEN_LABEL_HINTS.iter().any(|hint| label.contains(hint))
}

/// Whether a capture label names a camera. Unlike `!looks_like_screen`,
/// this is false for generic labels that could be either.
#[must_use]
pub fn looks_like_camera(label: &str) -> bool {
    let label = label.to_lowercase();
    !looks_like_screen(&label)
        && (CAMERA_LABEL_HINTS.iter().any(|hint| label.contains(hint)) || label.ends_with(" cam"))
}

/// Classify the live inbound tracks of `owner`.
///
/// `tracks` must be in arrival order; the first-received/second-received
/// tie-break depends on it.
#[must_use]
pub fn classify(owner: &ParticipantId, tracks: &[RemoteTrack]) -> Classification {
    let labelled = |track: &RemoteTrack, kind: TrackKind| MediaTrack {
        id: track.id.clone(),
        kind,
        owner: owner.clone(),
        label: track.label.clone(),
        liveness: Liveness::Live,
        direction: Direction::Inbound,
    };

    let audio = tracks
        .iter()
        .filter(|t| t.media == MediaKind::Audio)
        .map(|t| labelled(t, TrackKind::Audio))
        .collect();
    let video: Vec<&RemoteTrack> = tracks.iter().filter(|t| t.media == MediaKind::Video).collect();

    let mut confidence = Confidence::Label;
    let mut ignored = Vec::new();

    let (camera, screen) = match video.as_slice() {
        [] => (None, None),
        [only] => {
            if looks_like_screen(&only.label) {
                (None, Some(*only))
            } else {
                (Some(*only), None)
            }
        }
        [first, second] => match (looks_like_screen(&first.label), looks_like_screen(&second.label)) {
            (false, true) => (Some(*first), Some(*second)),
            (true, false) => (Some(*second), Some(*first)),
            _ => {
                confidence = Confidence::Fallback;
                (Some(*first), Some(*second))
            }
        },
        many => {
            confidence = Confidence::Fallback;
            let screen_pos = many.iter().position(|t| looks_like_screen(&t.label));
            let camera_pos = many.iter().position(|t| !looks_like_screen(&t.label));
            let (camera_pos, screen_pos) = match (camera_pos, screen_pos) {
                (Some(c), Some(s)) => (c, s),
                _ => (0, 1),
            };
            ignored = many
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != camera_pos && *i != screen_pos)
                .map(|(_, t)| (*t).clone())
                .collect();
            (Some(many[camera_pos]), Some(many[screen_pos]))
        }
    };

    Classification {
        tracks: ClassifiedTracks {
            camera: camera.map(|t| labelled(t, TrackKind::Camera)),
            screen: screen.map(|t| labelled(t, TrackKind::Screen)),
            audio,
        },
        confidence,
        ignored,
    }
}

/// Trailing debounce for classification passes.
///
/// Each touch pushes the deadline out by the window, but never past
/// `MAX_DEBOUNCE_MULTIPLIER` windows after the first touch of a burst.
#[derive(Debug)]
pub struct ClassifyDebounce {
    window: Duration,
    burst_started: Option<Instant>,
    deadline: Option<Instant>,
}

impl ClassifyDebounce {
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self {
            window,
            burst_started: None,
            deadline: None,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        let started = *self.burst_started.get_or_insert(now);
        let cap = started + self.window * MAX_DEBOUNCE_MULTIPLIER;
        self.deadline = Some((now + self.window).min(cap));
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consume the pending pass, if its deadline has been reached
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                self.burst_started = None;
                true
            }
            _ => false,
        }
    }
}
