//! Coordinator context
//!
//! The always-available hub. It owns the [`SessionRegistry`], enforces
//! single-flight, relays worker events to the UI, persists run records and
//! turns alarm firings into scheduled sessions.
//!
//! Each request is handled on its own task so a slow worker hand-off never
//! blocks `get-state`. Events are handled inline, in arrival order.
//!
//! Worker keepalives renew the current session's lease. A session silent
//! for longer than the lease is dropped the next time the registry is read.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::{
    AnalysisInput, ContextId, Delivery, Endpoint, Event, Incoming, Mailbox, RemoteError, Reply,
    Request, Response, StatusEvent,
};
use crate::error::{Error, Result};
use crate::history::HistorySource;
use crate::scheduler::{Schedule, SkipReason, TriggerOutcome, ANALYSIS_ALARM, HEALTH_ALARM};
use crate::session::{new_session_id, SessionRegistry};
use crate::store::{self, KeyValueStore};
use crate::types::{Phase, Profile, Progress, RunRecord, SessionState, TimeRange, Trigger};

#[derive(Clone)]
pub struct Coordinator {
    endpoint: Endpoint,
    registry: Arc<SessionRegistry>,
    store: Arc<dyn KeyValueStore>,
    schedule: Arc<Schedule>,
    history: Option<Arc<dyn HistorySource>>,
    lookback: chrono::Duration,
    session_lease: Duration,
}

impl Coordinator {
    pub fn new(
        endpoint: Endpoint,
        registry: Arc<SessionRegistry>,
        store: Arc<dyn KeyValueStore>,
        schedule: Arc<Schedule>,
        history: Option<Arc<dyn HistorySource>>,
        lookback_hours: u32,
        session_lease: Duration,
    ) -> Self {
        Self {
            endpoint,
            registry,
            store,
            schedule,
            history,
            lookback: chrono::Duration::hours(i64::from(lookback_hours)),
            session_lease,
        }
    }

    // ============================================
    // Operations
    // ============================================

    /// Start a session, cancelling any current one. Returns the session id.
    ///
    /// Fails loudly when the worker cannot be reached, and with
    /// `SessionRunning` when `session_id` is the current session.
    pub async fn start(
        &self,
        session_id: Option<String>,
        trigger: Trigger,
        input: AnalysisInput,
    ) -> Result<String> {
        let id = session_id.unwrap_or_else(new_session_id);
        let begun = self.registry.begin(id.clone(), trigger)?;
        if let Some(old) = begun.preempted {
            self.forward_cancel(&old).await;
        }
        self.dispatch(id, trigger, input).await
    }

    async fn dispatch(&self, id: String, trigger: Trigger, input: AnalysisInput) -> Result<String> {
        tracing::info!(session_id = %id, %trigger, entries = input.items.len(), "Dispatching session to worker");
        let delivery = self
            .endpoint
            .request(
                ContextId::Worker,
                Request::StartAnalysis {
                    session_id: Some(id.clone()),
                    trigger,
                    input,
                },
            )
            .await;

        match delivery.into_result() {
            Ok(Response::Started { session_id }) => Ok(session_id),
            Ok(other) => {
                self.registry.finish(&id);
                Err(Error::Transport(format!("unexpected worker reply: {other:?}")))
            }
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Worker did not accept session");
                self.registry.finish(&id);
                Err(e)
            }
        }
    }

    /// Cancel `session_id` if it is current.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        self.registry.cancel(session_id)?;
        self.forward_cancel(session_id).await;
        self.endpoint.emit(
            ContextId::Ui,
            Event::Progress(Progress::new(session_id, Phase::Idle)),
        );
        Ok(())
    }

    async fn forward_cancel(&self, session_id: &str) {
        let delivery = self
            .endpoint
            .request(
                ContextId::Worker,
                Request::Cancel {
                    session_id: session_id.to_string(),
                },
            )
            .await;
        match delivery {
            Delivery::Responded(Ok(_)) => {}
            Delivery::Responded(Err(e)) => {
                tracing::debug!(session_id, error = %e, "Worker had no such session");
            }
            other => {
                tracing::warn!(session_id, delivery = ?other, "Cancel not delivered to worker");
            }
        }
    }

    /// Drop the current session if its lease ran out. Returns its id.
    fn expire_stale(&self) -> Option<String> {
        self.registry.expire_stale(self.session_lease)
    }

    pub fn state(&self) -> SessionState {
        self.expire_stale();
        self.registry.snapshot()
    }

    pub fn toggle_schedule(&self, enabled: bool) -> Result<Option<chrono::DateTime<Utc>>> {
        self.schedule.set_enabled(enabled)
    }

    pub fn read_profile(&self) -> Result<Option<Profile>> {
        Ok(store::load_profile(&*self.store)?)
    }

    /// Replace the stored profile. Refused while a session runs, since the
    /// session would overwrite it on completion.
    pub fn write_profile(&self, profile: &Profile) -> Result<()> {
        self.expire_stale();
        if let Some(id) = self.registry.current_id() {
            return Err(Error::SessionRunning(id));
        }
        store::save_profile(&*self.store, profile)?;
        Ok(())
    }

    /// Handle a periodic firing. Never pre-empts a running session.
    pub async fn fire_scheduled(&self) -> Result<TriggerOutcome> {
        if !self.schedule.is_enabled()? {
            return Ok(TriggerOutcome::Skipped(SkipReason::Disabled));
        }
        if let Some(stale) = self.expire_stale() {
            self.forward_cancel(&stale).await;
        }
        if self.registry.is_running() {
            return Ok(TriggerOutcome::Skipped(SkipReason::SessionRunning));
        }
        let Some(history) = self.history.clone() else {
            return Ok(TriggerOutcome::Skipped(SkipReason::NoHistorySource));
        };

        let watermark = store::load_profile(&*self.store)?.and_then(|p| p.last_history_timestamp);
        let now = Utc::now();
        let since = watermark.unwrap_or(now - self.lookback);
        let range = TimeRange::new(since, now + chrono::Duration::microseconds(1));

        let mut items = tokio::task::spawn_blocking(move || history.search(&range))
            .await
            .map_err(|e| Error::History(format!("history task failed: {e}")))??;
        if let Some(watermark) = watermark {
            items.retain(|e| e.visited_at.is_some_and(|ts| ts > watermark));
        }
        if items.is_empty() {
            return Ok(TriggerOutcome::Skipped(SkipReason::NoNewHistory));
        }

        let id = new_session_id();
        if self.registry.begin_if_idle(id.clone(), Trigger::Scheduled).is_none() {
            return Ok(TriggerOutcome::Skipped(SkipReason::SessionRunning));
        }

        let input = AnalysisInput {
            items,
            ranges: Vec::new(),
        };
        match self.dispatch(id, Trigger::Scheduled, input).await {
            Ok(id) => Ok(TriggerOutcome::Started(id)),
            Err(e) => {
                tracing::warn!(error = %e, "Scheduled session not started");
                Ok(TriggerOutcome::Skipped(SkipReason::WorkerUnavailable))
            }
        }
    }

    // ============================================
    // Dispatch
    // ============================================

    pub async fn handle_request(&self, request: Request) -> Reply {
        let name = request.name();
        let result = match request {
            Request::StartAnalysis {
                session_id,
                trigger,
                input,
            } => self
                .start(session_id, trigger, input)
                .await
                .map(|session_id| Response::Started { session_id }),
            Request::Cancel { session_id } => self
                .cancel(&session_id)
                .await
                .map(|()| Response::Cancelled { session_id }),
            Request::GetState => Ok(Response::State {
                state: self.state(),
            }),
            Request::ToggleSchedule { enabled } => self
                .toggle_schedule(enabled)
                .map(|next_fire| Response::ScheduleToggled { enabled, next_fire }),
            Request::ReadProfile => self.read_profile().map(|profile| Response::Profile { profile }),
            Request::WriteProfile { profile } => {
                self.write_profile(&profile).map(|()| Response::ProfileWritten)
            }
        };

        result.map_err(|e| {
            tracing::debug!(request = name, error = %e, "Request failed");
            RemoteError::from(&e)
        })
    }

    pub fn handle_event(&self, from: ContextId, event: Event) {
        match event {
            Event::Progress(progress) => {
                if self.registry.record_progress(&progress) {
                    self.endpoint.emit(ContextId::Ui, Event::Progress(progress));
                } else {
                    tracing::trace!(session_id = %progress.session_id, "Dropping progress for stale session");
                }
            }
            Event::Status(status) => self.handle_status(status),
            Event::AiStatus(status) => {
                tracing::info!(available = status.available, provider = ?status.provider, "AI status");
                self.endpoint.emit(ContextId::Ui, Event::AiStatus(status));
            }
            Event::Keepalive { session_id } => {
                if self.registry.record_keepalive(&session_id) {
                    tracing::trace!(from = %from, session_id = %session_id, "Keepalive");
                } else {
                    tracing::debug!(from = %from, session_id = %session_id, "Keepalive for stale session");
                }
            }
        }
    }

    fn handle_status(&self, status: StatusEvent) {
        self.registry.finish(&status.session_id);
        tracing::info!(
            session_id = %status.session_id,
            trigger = %status.trigger,
            outcome = status.outcome.as_str(),
            "Session ended"
        );

        let record = RunRecord {
            session_id: status.session_id.clone(),
            trigger: status.trigger,
            outcome: status.outcome.clone(),
            finished_at: Utc::now(),
        };
        if let Err(e) = store::save_last_run(&*self.store, &record) {
            tracing::warn!(error = %e, "Failed to save run record");
        }

        self.endpoint.emit(ContextId::Ui, Event::Status(status));
    }

    pub async fn handle_alarm(&self, name: &str) {
        match name {
            ANALYSIS_ALARM => match self.fire_scheduled().await {
                Ok(TriggerOutcome::Started(id)) => {
                    tracing::info!(session_id = %id, "Scheduled session started");
                }
                Ok(TriggerOutcome::Skipped(reason)) => {
                    tracing::info!(reason = reason.as_str(), "Scheduled run skipped");
                }
                Err(e) => tracing::warn!(error = %e, "Scheduled run failed"),
            },
            HEALTH_ALARM => {
                if let Err(e) = self.schedule.health_check() {
                    tracing::warn!(error = %e, "Schedule health check failed");
                }
            }
            other => tracing::debug!(alarm = other, "Unknown alarm"),
        }
    }

    /// Process the mailbox and alarm firings until `shutdown` fires.
    pub async fn serve(
        self,
        mut mailbox: Mailbox,
        mut alarms: Option<mpsc::Receiver<String>>,
        shutdown: CancellationToken,
    ) {
        let mut alarms_open = alarms.is_some();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                incoming = mailbox.recv() => match incoming {
                    Some(Incoming::Request { from, request, responder }) => {
                        tracing::debug!(from = %from, request = request.name(), "Request");
                        let this = self.clone();
                        tokio::spawn(async move {
                            let reply = this.handle_request(request).await;
                            if !responder.respond(reply) {
                                tracing::debug!("Requester stopped waiting");
                            }
                        });
                    }
                    Some(Incoming::Event { from, event }) => self.handle_event(from, event),
                    None => break,
                },
                fired = next_alarm(&mut alarms), if alarms_open => match fired {
                    Some(name) => {
                        let this = self.clone();
                        tokio::spawn(async move { this.handle_alarm(&name).await });
                    }
                    None => alarms_open = false,
                },
            }
        }
        tracing::debug!("Coordinator stopped");
    }
}

async fn next_alarm(alarms: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match alarms.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
