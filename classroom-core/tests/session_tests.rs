//! Integration tests for classroom sessions
//!
//! Every participant runs a real orchestrator against the in-process relay
//! and its own loopback media engine. Time is paused, so timeouts and grace
//! periods elapse instantly once every task is idle.
//!
//! Run with: cargo test --test session_tests

use std::sync::Arc;
use std::time::Duration;

use classroom_core::{
    CaptureLabels, ConnectionKey, Error, IceConnectionState, LoopbackEngine, MediaEvent,
    Orchestrator, OrchestratorHandle, Participant, ParticipantId, ParticipantView, PinSelection,
    PinSource, RelayHub, Role, SessionConfig, SessionIo, SessionView, SignalingChannel,
    SignalingMessage, SignalingPhase, TrackKind, ViewUpdate,
};
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

const WAIT_LIMIT: Duration = Duration::from_secs(60);

struct Member {
    handle: OrchestratorHandle,
    engine: Arc<LoopbackEngine>,
}

fn join(hub: &RelayHub, participant: Participant) -> Member {
    let (channel, inbound) = hub.connect(participant.clone());
    let (engine, media_events) = LoopbackEngine::new(participant.id.clone(), CaptureLabels::default());
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
    Member { handle, engine }
}

fn teacher() -> Participant {
    Participant::new("teacher", Role::Broadcaster, "Teacher")
}

fn viewer(id: &str) -> Participant {
    Participant::new(id, Role::Viewer, id.to_uppercase())
}

fn id(s: &str) -> ParticipantId {
    ParticipantId::from(s)
}

/// Poll a participant's view until `pred` holds
async fn wait_for(handle: &OrchestratorHandle, what: &str, pred: impl Fn(&SessionView) -> bool) -> SessionView {
    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        let view = handle.snapshot().await.unwrap();
        if pred(&view) {
            return view;
        }
        assert!(
            Instant::now() < deadline,
            "{} never reached: {what}\n{view:#?}",
            handle.local_id()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn peer<'a>(view: &'a SessionView, remote: &str) -> Option<&'a ParticipantView> {
    view.participant(&id(remote))
}

fn is_stable(view: &SessionView, remote: &str) -> bool {
    peer(view, remote).is_some_and(|p| p.phase == Some(SignalingPhase::Stable))
}

async fn wait_for_update(
    handle: &OrchestratorHandle,
    updates: &mut tokio_stream::wrappers::BroadcastStream<ViewUpdate>,
    pred: impl Fn(&ViewUpdate) -> bool,
) -> ViewUpdate {
    let found = tokio::time::timeout(WAIT_LIMIT, async {
        while let Some(update) = updates.next().await {
            if let Ok(update) = update {
                if pred(&update) {
                    return Some(update);
                }
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(update)) => update,
        _ => panic!("{}: expected view update never arrived", handle.local_id()),
    }
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_screen_share() {
    let hub = RelayHub::new();
    let t = join(&hub, teacher());
    t.handle.set_camera_enabled(true).await.unwrap();
    let a = join(&hub, viewer("a"));
    let b = join(&hub, viewer("b"));

    for v in [&a, &b] {
        wait_for(&v.handle, "camera from teacher", |view| {
            is_stable(view, "teacher")
                && peer(view, "teacher").is_some_and(|p| p.classified_tracks.camera.is_some())
        })
        .await;
    }

    t.handle.request_screen_share().await.unwrap();
    assert_eq!(hub.lock_holder(), Some(id("teacher")));

    for v in [&a, &b] {
        let view = wait_for(&v.handle, "camera and screen from teacher", |view| {
            is_stable(view, "teacher")
                && peer(view, "teacher").is_some_and(|p| p.classified_tracks.has_screen())
        })
        .await;
        let tracks = &peer(&view, "teacher").unwrap().classified_tracks;
        assert_eq!(tracks.camera.as_ref().unwrap().label, "FaceTime HD Camera");
        assert_eq!(tracks.screen.as_ref().unwrap().label, "screen:0:0");
        assert_eq!(
            view.pin,
            PinSelection::Pinned {
                participant_id: id("teacher"),
                source: PinSource::AutoScreenshare,
            }
        );
        assert_eq!(view.lock_holder, Some(id("teacher")));
    }

    t.handle.stop_screen_share().await.unwrap();
    for v in [&a, &b] {
        let view = wait_for(&v.handle, "screen gone and pin cleared", |view| {
            view.pin == PinSelection::Default
                && peer(view, "teacher").is_some_and(|p| !p.classified_tracks.has_screen())
        })
        .await;
        assert!(view.lock_holder.is_none());
        assert!(peer(&view, "teacher").unwrap().classified_tracks.camera.is_some());
    }

    assert!(hub.lock_holder().is_none());
    assert!(hub.overlapping_grants().is_empty());

    // no viewer pairs while only the teacher sends
    let stats = a.handle.stats().await.unwrap();
    assert_eq!(stats.active_pairs, 1);
}

#[tokio::test(start_paused = true)]
async fn test_screen_capture_ended_by_os_clears_share_everywhere() {
    let hub = RelayHub::new();
    let t = join(&hub, teacher());
    let a = join(&hub, viewer("a"));

    t.handle.request_screen_share().await.unwrap();
    wait_for(&a.handle, "screen from teacher", |view| {
        peer(view, "teacher").is_some_and(|p| p.classified_tracks.has_screen())
            && view.pin.participant() == Some(&id("teacher"))
    })
    .await;

    let screen = t
        .engine
        .open_captures()
        .into_iter()
        .find(|track| track.kind == TrackKind::Screen)
        .unwrap();
    assert!(t.engine.end_capture(&screen.id));

    let view = wait_for(&a.handle, "share unwound after capture ended", |view| {
        view.pin == PinSelection::Default
            && view.lock_holder.is_none()
            && peer(view, "teacher").is_some_and(|p| !p.classified_tracks.has_screen())
    })
    .await;
    assert!(!peer(&view, "teacher").unwrap().participant.flags.screen_sharing);
    assert!(hub.lock_holder().is_none());

    // someone else may share now
    a.handle.request_screen_share().await.unwrap();
    assert_eq!(hub.lock_holder(), Some(id("a")));
}

#[tokio::test(start_paused = true)]
async fn test_simultaneous_offers_between_viewers_settle() {
    let hub = RelayHub::new();
    let _t = join(&hub, teacher());
    let a = join(&hub, viewer("a"));
    let b = join(&hub, viewer("b"));

    let (ra, rb) = tokio::join!(a.handle.set_camera_enabled(true), b.handle.set_camera_enabled(true));
    ra.unwrap();
    rb.unwrap();

    wait_for(&a.handle, "camera from b", |view| {
        is_stable(view, "b") && peer(view, "b").is_some_and(|p| p.classified_tracks.camera.is_some())
    })
    .await;
    wait_for(&b.handle, "camera from a", |view| {
        is_stable(view, "a") && peer(view, "a").is_some_and(|p| p.classified_tracks.camera.is_some())
    })
    .await;

    // "a" < "b": only a may roll back, only b may ignore
    let sa = a.handle.stats().await.unwrap();
    let sb = b.handle.stats().await.unwrap();
    assert_eq!(sa.glare_ignored, 0);
    assert_eq!(sb.glare_rolled_back, 0);
    assert_eq!(sa.glare_rolled_back, sb.glare_ignored);
    assert_eq!(sa.resets, 0);
    assert_eq!(sb.resets, 0);
}

#[tokio::test(start_paused = true)]
async fn test_viewer_pair_pruned_when_nobody_sends() {
    let hub = RelayHub::new();
    let _t = join(&hub, teacher());
    let a = join(&hub, viewer("a"));
    let b = join(&hub, viewer("b"));

    a.handle.set_camera_enabled(true).await.unwrap();
    wait_for(&b.handle, "camera from a", |view| {
        peer(view, "a").is_some_and(|p| p.classified_tracks.camera.is_some())
    })
    .await;
    assert_eq!(b.handle.stats().await.unwrap().active_pairs, 2);

    a.handle.set_camera_enabled(false).await.unwrap();
    wait_for(&b.handle, "viewer connection pruned", |view| {
        peer(view, "a").is_some_and(|p| p.phase.is_none() && p.classified_tracks.is_empty())
    })
    .await;
    wait_for(&a.handle, "viewer connection pruned", |view| {
        peer(view, "b").is_some_and(|p| p.phase.is_none())
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_lost_answers_reset_connection_until_route_recovers() {
    let hub = RelayHub::new();
    let t = join(&hub, teacher());
    t.handle.set_camera_enabled(true).await.unwrap();

    // a joins and offers; every answer from the teacher vanishes
    hub.drop_route(&id("teacher"), &id("a"));
    let a = join(&hub, viewer("a"));
    let mut updates = a.handle.subscribe();

    wait_for_update(&a.handle, &mut updates, |u| {
        matches!(u, ViewUpdate::Reconnecting { participant_id } if participant_id.as_str() == "teacher")
    })
    .await;
    let warning = wait_for_update(&a.handle, &mut updates, |u| {
        matches!(u, ViewUpdate::ConnectivityWarning { .. })
    })
    .await;
    assert!(matches!(warning, ViewUpdate::ConnectivityWarning { resets: 3, .. }));

    hub.restore_route(&id("teacher"), &id("a"));
    wait_for(&a.handle, "recovered camera from teacher", |view| {
        is_stable(view, "teacher")
            && peer(view, "teacher").is_some_and(|p| p.media_available && p.classified_tracks.camera.is_some())
    })
    .await;
    assert!(a.handle.stats().await.unwrap().resets >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_denied_share_names_holder_and_silent_holder_is_reclaimed() {
    let hub = RelayHub::new();
    let cancel = CancellationToken::new();
    let grace = SessionConfig::default().disconnect_grace();
    let sweeper = hub.spawn_liveness_sweeper(grace, cancel.clone());

    let t = join(&hub, teacher());
    // a participant that grabs the lock and then goes silent
    let (ghost, _ghost_rx) = hub.connect(viewer("ghost"));
    ghost
        .send(SignalingMessage::ScreenLockRequest {
            participant_id: id("ghost"),
        })
        .await
        .unwrap();

    let mut updates = t.handle.subscribe();
    let err = t.handle.request_screen_share().await.unwrap_err();
    match &err {
        Error::LockDenied { held_by } => assert_eq!(held_by.as_str(), "ghost"),
        other => panic!("expected denial, got {other:?}"),
    }
    assert!(err.user_message().contains("ghost"));
    wait_for_update(&t.handle, &mut updates, |u| matches!(u, ViewUpdate::ScreenShareDenied { .. })).await;

    wait_for(&t.handle, "ghost reclaimed", |view| {
        peer(view, "ghost").is_none() && view.lock_holder.is_none()
    })
    .await;
    assert!(hub.is_connected(&id("teacher")));

    t.handle.request_screen_share().await.unwrap();
    assert_eq!(hub.lock_holder(), Some(id("teacher")));
    assert!(hub.overlapping_grants().is_empty());

    cancel.cancel();
    sweeper.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_holder_leaving_frees_lock_for_others() {
    let hub = RelayHub::new();
    let _t = join(&hub, teacher());
    let a = join(&hub, viewer("a"));
    let b = join(&hub, viewer("b"));

    a.handle.request_screen_share().await.unwrap();
    wait_for(&b.handle, "screen from a", |view| {
        view.lock_holder == Some(id("a"))
            && peer(view, "a").is_some_and(|p| p.classified_tracks.has_screen())
    })
    .await;
    assert!(matches!(
        b.handle.request_screen_share().await,
        Err(Error::LockDenied { .. })
    ));

    a.handle.leave().await.unwrap();
    let view = wait_for(&b.handle, "a gone", |view| peer(view, "a").is_none()).await;
    assert_eq!(view.pin, PinSelection::Default);
    assert!(view.lock_holder.is_none());

    b.handle.request_screen_share().await.unwrap();
    assert_eq!(hub.lock_holder(), Some(id("b")));
    assert!(hub.overlapping_grants().is_empty());
    assert!(!a.engine.has_session(&ConnectionKey::new(id("a"), id("teacher"))));
}

#[tokio::test(start_paused = true)]
async fn test_manual_pin_survives_unrelated_share_stop() {
    let hub = RelayHub::new();
    let t = join(&hub, teacher());
    let a = join(&hub, viewer("a"));
    let _b = join(&hub, viewer("b"));

    wait_for(&a.handle, "everyone present", |view| view.participants.len() == 2).await;
    a.handle.request_pin(Some(id("b"))).await.unwrap();

    t.handle.request_screen_share().await.unwrap();
    wait_for(&a.handle, "auto pin to teacher", |view| {
        view.pin.participant() == Some(&id("teacher"))
            && view.pin.source() == Some(PinSource::AutoScreenshare)
    })
    .await;

    a.handle.request_pin(Some(id("b"))).await.unwrap();
    t.handle.stop_screen_share().await.unwrap();
    wait_for(&a.handle, "teacher stopped sharing", |view| {
        peer(view, "teacher").is_some_and(|p| !p.participant.flags.screen_sharing)
    })
    .await;

    let view = a.handle.snapshot().await.unwrap();
    assert_eq!(
        view.pin,
        PinSelection::Pinned {
            participant_id: id("b"),
            source: PinSource::Manual,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_transport_lost_past_grace_drops_media() {
    let hub = RelayHub::new();
    let t = join(&hub, teacher());
    t.handle.set_camera_enabled(true).await.unwrap();
    let a = join(&hub, viewer("a"));

    wait_for(&a.handle, "camera from teacher", |view| {
        peer(view, "teacher").is_some_and(|p| p.media_available && p.classified_tracks.camera.is_some())
    })
    .await;

    a.engine.inject(MediaEvent::ConnectionStateChanged {
        connection: ConnectionKey::new(id("a"), id("teacher")),
        state: IceConnectionState::Disconnected,
    });

    let started = Instant::now();
    let view = wait_for(&a.handle, "teacher media dropped", |view| {
        peer(view, "teacher").is_some_and(|p| !p.media_available && p.phase.is_none())
    })
    .await;
    assert!(started.elapsed() >= SessionConfig::default().disconnect_grace());
    assert!(peer(&view, "teacher").unwrap().classified_tracks.is_empty());
    // still present, only without media
    assert!(hub.is_connected(&id("teacher")));
}

#[tokio::test(start_paused = true)]
async fn test_transport_recovering_within_grace_keeps_media() {
    let hub = RelayHub::new();
    let t = join(&hub, teacher());
    t.handle.set_camera_enabled(true).await.unwrap();
    let a = join(&hub, viewer("a"));

    wait_for(&a.handle, "camera from teacher", |view| {
        peer(view, "teacher").is_some_and(|p| p.classified_tracks.camera.is_some())
    })
    .await;

    let conn = ConnectionKey::new(id("a"), id("teacher"));
    a.engine.inject(MediaEvent::ConnectionStateChanged {
        connection: conn.clone(),
        state: IceConnectionState::Disconnected,
    });
    tokio::time::sleep(Duration::from_secs(5)).await;
    a.engine.inject(MediaEvent::ConnectionStateChanged {
        connection: conn,
        state: IceConnectionState::Connected,
    });
    tokio::time::sleep(Duration::from_secs(20)).await;

    let view = a.handle.snapshot().await.unwrap();
    let teacher_view = peer(&view, "teacher").unwrap();
    assert!(teacher_view.media_available);
    assert_eq!(teacher_view.phase, Some(SignalingPhase::Stable));
}
