//! hindsight-daemon - keep the coordinator alive for scheduled analysis
//!
//! Runs the coordinator and worker with the browser history attached, so
//! the analysis alarm can start sessions over history newer than the
//! profile watermark. Stops on Ctrl-C.

mod process_lock;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use hindsight_core::bus::{Incoming, RemoteError, RemoteErrorKind};
use hindsight_core::history::{self, ChromiumHistory, HistorySource};
use hindsight_core::provider::probe_provider;
use hindsight_core::{Config, Event, Runtime, Services, SqliteStore};
use process_lock::acquire_session_guard;

#[derive(Parser)]
#[command(name = "hindsight-daemon")]
#[command(about = "Run scheduled browsing-history analysis in the background")]
#[command(version)]
struct Args {
    /// Turn scheduled analysis on before starting
    #[arg(long)]
    enable: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        hindsight_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("hindsight-daemon starting");

    let store_path = Config::store_path();
    let _guard = acquire_session_guard(&store_path, "hindsight-daemon")
        .context("failed to acquire process lock")?;

    let store = Arc::new(SqliteStore::open(&store_path).context("failed to open store")?);
    if args.enable {
        hindsight_core::store::set_schedule_enabled(&*store, true)
            .context("failed to enable schedule")?;
    }

    let history = history_source(&config)?;
    if history.is_none() {
        println!("No browser history found; scheduled runs will be skipped.");
    }

    let (runtime, mut ui) = Runtime::start(
        &config,
        Services {
            store,
            probe: probe_provider(&config),
            history,
            alarms: None,
        },
    )
    .context("failed to start runtime")?;

    println!("Store: {}", store_path.display());
    println!("hindsight-daemon running (Ctrl-C to stop)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            incoming = ui.recv() => match incoming {
                Some(Incoming::Event { event, .. }) => log_event(&event),
                Some(Incoming::Request { request, responder, .. }) => {
                    let _ = responder.respond(Err(RemoteError::new(
                        RemoteErrorKind::Unsupported,
                        format!("ui does not serve {}", request.name()),
                    )));
                }
                None => break,
            },
        }
    }

    println!("Shutting down...");
    runtime.shutdown().await;
    Ok(())
}

fn history_source(config: &Config) -> Result<Option<Arc<dyn HistorySource>>> {
    let path = match &config.history.chromium_path {
        Some(path) => Some(path.clone()),
        None => history::discover_chromium_profiles()?.into_iter().next(),
    };
    Ok(path.map(|path| {
        tracing::info!(path = %path.display(), "Using browser history");
        Arc::new(ChromiumHistory::new(path)) as Arc<dyn HistorySource>
    }))
}

fn log_event(event: &Event) {
    match event {
        Event::Status(status) => {
            tracing::info!(
                session_id = %status.session_id,
                trigger = %status.trigger,
                outcome = status.outcome.as_str(),
                "Session finished"
            );
            println!(
                "[{}] {} session {}: {}",
                chrono::Local::now().format("%H:%M:%S"),
                status.trigger,
                status.session_id,
                status.outcome.as_str()
            );
        }
        Event::AiStatus(status) if !status.available => {
            println!(
                "Language model unavailable: {}",
                status.reason.as_deref().unwrap_or("unknown")
            );
        }
        _ => {}
    }
}
