use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use classroom_core::{
    init_logging, CaptureLabels, Config, LoopbackEngine, Orchestrator, OrchestratorHandle,
    Participant, RelayHub, Role, SessionConfig, SessionIo,
};

#[derive(Parser, Debug)]
#[command(name = "classroom")]
#[command(about = "Simulated virtual classroom over an in-process relay", long_about = None)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, env = "CLASSROOM_CONFIG_PATH")]
    config: Option<String>,

    /// Number of students joining the class
    #[arg(long, default_value = "2")]
    viewers: usize,

    /// Seconds the teacher keeps sharing the screen
    #[arg(long, default_value = "5")]
    share_seconds: u64,

    /// Students turn their cameras on
    #[arg(long, default_value = "false")]
    viewer_cameras: bool,

    /// Overrides logging.level
    #[arg(long)]
    log_level: Option<String>,
}

fn join(hub: &RelayHub, config: &SessionConfig, participant: Participant) -> OrchestratorHandle {
    let (channel, inbound) = hub.connect(participant.clone());
    let (engine, media_events) = LoopbackEngine::new(participant.id.clone(), CaptureLabels::default());
    Orchestrator::spawn(
        config.clone(),
        participant,
        SessionIo {
            channel: Arc::new(channel),
            inbound,
            engine,
            media_events,
        },
    )
}

/// Log every view update a participant's UI would render
fn watch(handle: &OrchestratorHandle, cancel: CancellationToken) {
    let mut updates = handle.subscribe();
    let viewer = handle.local_id().clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                update = updates.next() => match update {
                    Some(Ok(update)) => match serde_json::to_string(&update) {
                        Ok(json) => info!(viewer = %viewer, update = %json, "View update"),
                        Err(e) => warn!(viewer = %viewer, error = %e, "Unserializable view update"),
                    },
                    Some(Err(e)) => warn!(viewer = %viewer, error = %e, "View updates lagged"),
                    None => break,
                },
            }
        }
    });
}

/// Wait for SIGTERM or Ctrl+C
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    init_logging(&config.logging)?;
    info!(viewers = args.viewers, "Classroom simulation starting");

    // 3. Relay
    let hub = RelayHub::new();
    let cancel = CancellationToken::new();
    let sweeper = hub.spawn_liveness_sweeper(config.session.disconnect_grace(), cancel.clone());

    // 4. Participants
    let teacher = join(
        &hub,
        &config.session,
        Participant::new("teacher", Role::Broadcaster, "Teacher"),
    );
    teacher.set_camera_enabled(true).await?;
    teacher.set_mic_enabled(true).await?;

    let mut students = Vec::with_capacity(args.viewers);
    for n in 1..=args.viewers {
        let id = format!("student-{n:02}");
        let student = join(
            &hub,
            &config.session,
            Participant::new(id.as_str(), Role::Viewer, format!("Student {n}")),
        );
        watch(&student, cancel.clone());
        if args.viewer_cameras {
            student.set_camera_enabled(true).await?;
        }
        students.push(student);
    }

    // 5. Screen share
    match teacher.request_screen_share().await {
        Ok(()) => info!("Teacher is sharing the screen"),
        Err(e) => warn!(error = %e, message = %e.user_message(), "Screen share refused"),
    }

    tokio::select! {
        () = tokio::time::sleep(Duration::from_secs(args.share_seconds)) => {}
        () = shutdown_signal() => {}
    }

    if let Err(e) = teacher.stop_screen_share().await {
        warn!(error = %e, "Failed to stop screen share");
    }
    // give viewers a moment to renegotiate
    tokio::time::sleep(config.session.classify_debounce() * 4).await;

    // 6. Report and leave
    let stats = teacher.stats().await?;
    info!(stats = %serde_json::to_string(&stats)?, "Teacher session stats");
    for student in &students {
        let view = student.snapshot().await?;
        info!(
            viewer = %student.local_id(),
            view = %serde_json::to_string(&view)?,
            "Final view"
        );
    }

    for student in &students {
        student.leave().await?;
    }
    teacher.leave().await?;

    let overlaps = hub.overlapping_grants();
    if !overlaps.is_empty() {
        error!(?overlaps, "Screen lock was held by two participants at once");
    }
    info!(lock_events = hub.lock_events().len(), "Classroom simulation finished");

    cancel.cancel();
    sweeper.await?;
    Ok(())
}
