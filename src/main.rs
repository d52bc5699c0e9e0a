//! Touchdrive - live production monitor
//!
//! Entry point for the headless monitor: connects every configured
//! service, prints the event log as it grows and serves the web surface.

use anyhow::{Context, Result};
use chrono::Local;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use touchdrive::supervisor::backoff_delay;
use touchdrive::timeline::spawn_live_timeline;
use touchdrive::{AppConfig, ConnectionSupervisor, ServiceId, SessionManager};
use touchdrive_server::{AppState, ServerConfig, SupervisorHandle};

/// How often failed services are checked for a due retry
const RECONNECT_TICK: Duration = Duration::from_millis(250);

/// Live timeline recompute period
const TIMELINE_PERIOD: Duration = Duration::from_secs(1);

struct Options {
    config_path: Option<PathBuf>,
    port: Option<u16>,
    serve: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("touchdrive=info".parse().unwrap()),
        )
        .init();

    let Some(options) = parse_args()? else {
        return Ok(());
    };

    println!("Touchdrive v{} - production monitor", touchdrive::VERSION);
    println!();

    let config = match &options.config_path {
        Some(path) => AppConfig::try_load(path)
            .with_context(|| format!("Cannot use config {}", path.display()))?,
        None => AppConfig::load_default(),
    };
    config.validate().context("Invalid configuration")?;

    run(config, options).await
}

/// Parse command line arguments; `None` means the run is already done
fn parse_args() -> Result<Option<Options>> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options {
        config_path: None,
        port: None,
        serve: true,
    };
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--version" | "-v" => {
                println!("touchdrive {}", touchdrive::VERSION);
                return Ok(None);
            }
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            "--print-config" => {
                let config = match &options.config_path {
                    Some(path) => AppConfig::load(path),
                    None => AppConfig::load_default(),
                };
                println!("{}", serde_json::to_string_pretty(&config)?);
                return Ok(None);
            }
            "--config" | "-c" => {
                let Some(path) = args.get(i + 1) else {
                    anyhow::bail!("--config requires a path");
                };
                options.config_path = Some(PathBuf::from(path));
                i += 2;
                continue;
            }
            "--port" | "-p" => {
                let Some(value) = args.get(i + 1) else {
                    anyhow::bail!("--port requires a value");
                };
                let port = value
                    .parse()
                    .with_context(|| format!("Invalid port: {}", value))?;
                options.port = Some(port);
                i += 2;
                continue;
            }
            "--no-server" => options.serve = false,
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                return Ok(None);
            }
        }
        i += 1;
    }

    Ok(Some(options))
}

fn print_help() {
    println!("Usage: touchdrive [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --config PATH   Config file (default: {})", AppConfig::path().display());
    println!("  -p, --port PORT     Web server port (overrides config)");
    println!("      --no-server     Do not start the web server");
    println!("      --print-config  Print the effective config and exit");
    println!("  -v, --version       Show version");
    println!("  -h, --help          Show this help");
    println!();
    println!("Set RUST_LOG=touchdrive=debug for protocol detail.");
}

async fn run(config: AppConfig, options: Options) -> Result<()> {
    let sessions = SessionManager::from_config(&config.timeline)?;

    let mut supervisor = ConnectionSupervisor::new(config.clone());
    let events = supervisor
        .take_event_stream()
        .context("Event stream already taken")?;
    let pump = sessions.spawn_pump(events, config.follow_deck_recording);
    let handle = SupervisorHandle::spawn(supervisor);

    spawn_event_printer(&sessions);
    let (timeline_rx, timeline_task) =
        spawn_live_timeline(sessions.clone(), config.timeline.clone(), TIMELINE_PERIOD);

    for outcome in handle.connect_all().await? {
        match outcome.result {
            Ok(()) => println!("  {:<24} connected", outcome.service.to_string()),
            Err(e) => println!("  {:<24} FAILED: {}", outcome.service.to_string(), e),
        }
    }
    println!();

    let reconnect = tokio::spawn(run_reconnect_loop(handle.clone()));

    if options.serve {
        let server = ServerConfig {
            port: options.port.unwrap_or(config.server.port),
            bind_addr: config.server.bind_addr.clone(),
        };
        let mut state = AppState::new(
            handle.clone(),
            sessions.clone(),
            config.timeline.clone(),
            server,
        );
        state.event_display_limit = config.event_display_limit;
        tokio::spawn(async move {
            if let Err(e) = touchdrive_server::start_server(state).await {
                tracing::error!("Web server failed: {}", e);
            }
        });
    }

    println!("Monitoring. Press Ctrl+C to stop.");
    println!("────────────────────────────────────────");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    println!();
    info!("Shutting down");

    reconnect.abort();
    if sessions.is_recording() {
        if let Ok(session) = sessions.stop_session() {
            info!(number = session.number, "Closed open session on exit");
        }
    }
    let timeline = timeline_rx.borrow().clone();
    drop(timeline_rx);
    timeline_task.abort();

    handle.shutdown().await?;
    // All senders are gone once the supervisor task ends
    let _ = tokio::time::timeout(Duration::from_secs(2), pump).await;

    println!("Events logged: {}", sessions.event_count());
    println!("Sessions:      {}", sessions.sessions().len());
    println!("Clips on last timeline: {}", timeline.clip_count());
    Ok(())
}

/// Print each logged event as one line
fn spawn_event_printer(sessions: &SessionManager) {
    let mut rx = sessions.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => println!(
                    "{} {} {:>6} {}",
                    event.timestamp.with_timezone(&Local).format("%H:%M:%S%.3f"),
                    event.timecode,
                    event.id.to_string(),
                    event.summary()
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Console output fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Retry failed services with capped exponential backoff
///
/// Attempt counts reset once a service stops showing up as failed.
async fn run_reconnect_loop(handle: SupervisorHandle) {
    let mut attempts: HashMap<ServiceId, (u32, Instant)> = HashMap::new();
    let mut ticker = tokio::time::interval(RECONNECT_TICK);

    loop {
        ticker.tick().await;
        let failed = match handle.failed_services().await {
            Ok(failed) => failed,
            Err(_) => break,
        };
        attempts.retain(|service, _| failed.contains(service));

        let now = Instant::now();
        for service in failed {
            let (attempt, due) = attempts
                .entry(service.clone())
                .or_insert_with(|| (1, now + backoff_delay(1)));
            if now < *due {
                continue;
            }
            info!(service = %service, attempt = *attempt, "Reconnecting");
            if let Err(e) = handle.reconnect(service.clone()).await {
                warn!(service = %service, attempt = *attempt, error = %e, "Reconnect failed");
            }
            *attempt = attempt.saturating_add(1);
            *due = Instant::now() + backoff_delay(*attempt);
        }
    }
}
