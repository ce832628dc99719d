//! hindsight - analyze browsing history into a behavioral profile
//!
//! Subcommands:
//! - `analyze`: run one manual session over recent history, with progress
//! - `profile`: print the stored profile
//! - `schedule`: show or toggle periodic analysis (run by `hindsight-daemon`)
//! - `status`: show the last finished session
//!
//! Uses XDG Base Directory specification for file locations:
//! - Store: $XDG_DATA_HOME/hindsight/store.db (~/.local/share/hindsight/store.db)
//! - Logs: $XDG_STATE_HOME/hindsight/hindsight.log.YYYY-MM-DD, rotated daily
//! - Config: $XDG_CONFIG_HOME/hindsight/config.toml (~/.config/hindsight/config.toml)

mod process_lock;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};

use hindsight_core::bus::{Incoming, RemoteError, RemoteErrorKind};
use hindsight_core::history::{self, ChromiumHistory, HistorySource};
use hindsight_core::provider::probe_provider;
use hindsight_core::store;
use hindsight_core::{
    AnalysisInput, Config, Event, HistoryEntry, Phase, Profile, Progress, Request, Response,
    Runtime, Services, SessionOutcome, SqliteStore, TimeRange, Trigger,
};
use process_lock::acquire_session_guard;

#[derive(Parser)]
#[command(name = "hindsight")]
#[command(about = "Analyze browsing history into a behavioral profile")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Analyze recent browsing history and fold it into the profile
    Analyze {
        /// JSON history export to analyze instead of the browser database
        #[arg(long)]
        history: Option<PathBuf>,

        /// Only analyze the last N hours (defaults to `analysis.lookback_hours`
        /// for the browser database, everything for an export)
        #[arg(long)]
        hours: Option<u32>,

        /// Output format: text (default) or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the stored profile
    Profile {
        /// Output format: text (default) or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show or change scheduled analysis
    Schedule {
        #[arg(value_enum)]
        action: ScheduleAction,
    },

    /// Show the last finished session
    Status {
        /// Output format: text (default) or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ScheduleAction {
    On,
    Off,
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        hindsight_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let store_path = Config::store_path();
    let store = SqliteStore::open(&store_path).context("failed to open store")?;

    match args.command {
        Command::Analyze {
            history,
            hours,
            format,
        } => {
            let _guard = acquire_session_guard(&store_path, "hindsight analyze")
                .context("failed to acquire process lock")?;
            analyze(&config, Arc::new(store), history.as_deref(), hours, &format).await
        }
        Command::Profile { format } => print_profile(&store, &format),
        Command::Schedule { action } => schedule(&config, &store, action),
        Command::Status { format } => print_status(&store, &format),
    }
}

// ============================================
// analyze
// ============================================

async fn analyze(
    config: &Config,
    store: Arc<SqliteStore>,
    export: Option<&Path>,
    hours: Option<u32>,
    format: &str,
) -> Result<()> {
    let entries = load_history(config, export, hours)?;
    if entries.is_empty() {
        println!("No browsing history in the selected window.");
        return Ok(());
    }
    tracing::info!(entries = entries.len(), "Starting manual analysis");

    let (runtime, mut ui) = Runtime::start(
        config,
        Services {
            store,
            probe: probe_provider(config),
            history: None,
            alarms: None,
        },
    )
    .context("failed to start runtime")?;

    let started = runtime
        .request(Request::StartAnalysis {
            session_id: None,
            trigger: Trigger::Manual,
            input: AnalysisInput {
                items: entries,
                ranges: Vec::new(),
            },
        })
        .await
        .into_result();

    let session_id = match started {
        Ok(Response::Started { session_id }) => session_id,
        Ok(other) => {
            runtime.shutdown().await;
            anyhow::bail!("unexpected reply to start-analysis: {other:?}");
        }
        Err(e) => {
            runtime.shutdown().await;
            return Err(e).context("analysis did not start");
        }
    };

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut cancel_sent = false;
    let outcome = loop {
        tokio::select! {
            incoming = ui.recv() => match incoming {
                Some(Incoming::Event { event, .. }) => match event {
                    Event::Progress(progress) if progress.session_id == session_id => {
                        render_progress(&pb, &progress);
                    }
                    Event::Status(status) if status.session_id == session_id => {
                        break Some(status.outcome);
                    }
                    Event::AiStatus(status) if !status.available => {
                        pb.println(format!(
                            "Language model unavailable: {}",
                            status.reason.unwrap_or_default()
                        ));
                    }
                    _ => {}
                },
                Some(Incoming::Request { request, responder, .. }) => {
                    let _ = responder.respond(Err(RemoteError::new(
                        RemoteErrorKind::Unsupported,
                        format!("ui does not serve {}", request.name()),
                    )));
                }
                None => break None,
            },
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                cancel_sent = true;
                pb.set_message("cancelling...");
                let cancel = Request::Cancel { session_id: session_id.clone() };
                if let Err(e) = runtime.request(cancel).await.into_result() {
                    tracing::warn!(error = %e, "Cancel request failed");
                }
            }
        }
    };

    pb.finish_and_clear();
    runtime.shutdown().await;

    let outcome = outcome.context("runtime stopped before the session finished")?;
    report_outcome(&session_id, &outcome, format)
}

fn load_history(
    config: &Config,
    export: Option<&Path>,
    hours: Option<u32>,
) -> Result<Vec<HistoryEntry>> {
    let now = Utc::now();

    if let Some(path) = export {
        let entries = history::load_json_export(path)
            .with_context(|| format!("failed to read history export: {}", path.display()))?;
        let Some(hours) = hours else {
            return Ok(entries);
        };
        let window = TimeRange::new(now - chrono::Duration::hours(i64::from(hours)), now);
        return Ok(entries
            .into_iter()
            .filter(|e| e.visited_at.is_some_and(|ts| window.contains(ts)))
            .collect());
    }

    let path = match &config.history.chromium_path {
        Some(path) => path.clone(),
        None => history::discover_chromium_profiles()?
            .into_iter()
            .next()
            .context("no Chromium history found; pass --history or set [history] chromium_path")?,
    };
    tracing::info!(path = %path.display(), "Reading browser history");

    let hours = hours.unwrap_or(config.analysis.lookback_hours);
    let window = TimeRange::new(now - chrono::Duration::hours(i64::from(hours)), now);
    Ok(ChromiumHistory::new(path).search(&window)?)
}

fn render_progress(pb: &ProgressBar, progress: &Progress) {
    if let Some(chunk) = &progress.chunk_progress {
        pb.set_length(chunk.total as u64);
        pb.set_position(chunk.current as u64);
    }

    let message = match progress.phase {
        Phase::Retrying => progress.retry_message.clone().unwrap_or_default(),
        Phase::Analyzing => progress
            .chunk_progress
            .as_ref()
            .map(|c| c.description.clone())
            .unwrap_or_else(|| "analyzing".to_string()),
        phase => match &progress.sub_phase {
            Some(sub) => format!("{phase}: {sub}"),
            None => phase.to_string(),
        },
    };
    pb.set_message(message);
}

fn report_outcome(session_id: &str, outcome: &SessionOutcome, format: &str) -> Result<()> {
    if format == "json" {
        let output = serde_json::json!({
            "session_id": session_id,
            "outcome": outcome,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        match outcome {
            SessionOutcome::Completed {
                chunks_analyzed,
                chunks_skipped,
                watermark,
            } => {
                println!(
                    "Analysis complete: {} chunk(s) analyzed, {} skipped",
                    chunks_analyzed, chunks_skipped
                );
                if let Some(ts) = watermark {
                    println!("History analyzed through {}", ts.to_rfc3339());
                }
            }
            SessionOutcome::Cancelled { chunks_analyzed } => {
                println!(
                    "Analysis cancelled after {} chunk(s); profile unchanged",
                    chunks_analyzed
                );
            }
            SessionOutcome::Failed { .. } => {}
        }
    }

    if let SessionOutcome::Failed { kind, message } = outcome {
        anyhow::bail!("analysis failed ({kind:?}): {message}");
    }
    Ok(())
}

// ============================================
// profile / schedule / status
// ============================================

fn print_profile(store: &SqliteStore, format: &str) -> Result<()> {
    let profile = store::load_profile(store).context("failed to read profile")?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&profile)?);
        return Ok(());
    }

    let Some(profile) = profile.filter(|p| !p.is_empty()) else {
        println!("No profile yet.");
        println!("Run 'hindsight analyze' to build one from your browsing history.");
        return Ok(());
    };
    print_profile_text(&profile);
    Ok(())
}

fn print_profile_text(profile: &Profile) {
    if !profile.summary.is_empty() {
        println!("{}\n", profile.summary);
    }

    let sections: [(&str, &[String]); 7] = [
        ("Goals", &profile.goals),
        ("Obsessions", &profile.obsessions),
        ("Preferences", &profile.preferences),
        ("Traits", &profile.traits),
        ("Interests", &profile.interests),
        ("Technology", &profile.technology_use),
        ("Life stage", &profile.lifecycle_hints),
    ];
    for (title, items) in sections.iter().filter(|(_, items)| !items.is_empty()) {
        println!("{title}:");
        for item in items.iter() {
            println!("  - {item}");
        }
    }

    if !profile.workflow_patterns.is_empty() {
        println!("Workflow patterns:");
        for pattern in &profile.workflow_patterns {
            println!("  - {} (seen {}x)", pattern.pattern, pattern.frequency);
            if !pattern.suggestion.is_empty() {
                println!("      suggestion: {}", pattern.suggestion);
            }
        }
    }

    println!("\n---");
    println!("Sessions analyzed: {}", profile.sessions_analyzed);
    if let Some(ts) = profile.last_history_timestamp {
        println!("History analyzed through: {}", ts.to_rfc3339());
    }
    if let Some(ts) = profile.updated_at {
        println!("Updated: {}", ts.to_rfc3339());
    }
}

fn schedule(config: &Config, store: &SqliteStore, action: ScheduleAction) -> Result<()> {
    match action {
        ScheduleAction::On | ScheduleAction::Off => {
            let enabled = matches!(action, ScheduleAction::On);
            store::set_schedule_enabled(store, enabled).context("failed to save schedule")?;
            println!(
                "Scheduled analysis {}",
                if enabled { "enabled" } else { "disabled" }
            );
            println!("hindsight-daemon picks this up on its next health check or restart.");
        }
        ScheduleAction::Status => {
            let stored =
                store::stored_schedule_enabled(store).context("failed to read schedule")?;
            let enabled = stored.unwrap_or(config.schedule.enabled);
            println!(
                "Scheduled analysis: {}",
                if enabled { "enabled" } else { "disabled" }
            );
            println!(
                "Interval: every {} minute(s)",
                config.schedule.interval().as_secs() / 60
            );
        }
    }
    Ok(())
}

fn print_status(store: &SqliteStore, format: &str) -> Result<()> {
    let record = store::load_last_run(store).context("failed to read last run")?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    let Some(record) = record else {
        println!("No sessions have finished yet.");
        return Ok(());
    };

    println!("Last session: {}", record.session_id);
    println!("  trigger:  {}", record.trigger);
    println!("  outcome:  {}", record.outcome.as_str());
    println!("  finished: {}", record.finished_at.to_rfc3339());
    match &record.outcome {
        SessionOutcome::Completed {
            chunks_analyzed,
            chunks_skipped,
            ..
        } => println!("  chunks:   {chunks_analyzed} analyzed, {chunks_skipped} skipped"),
        SessionOutcome::Cancelled { chunks_analyzed } => {
            println!("  chunks:   {chunks_analyzed} analyzed before cancel")
        }
        SessionOutcome::Failed { message, .. } => println!("  error:    {message}"),
    }
    Ok(())
}
