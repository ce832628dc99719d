//! Analysis worker
//!
//! [`AnalysisPipeline`] runs one session end to end:
//!
//! ```text
//! calculating → chunking → analyzing ⇄ retrying → complete | error
//! ```
//!
//! Chunks are analyzed strictly one after another. Each extracted result is
//! merged into a working copy of the profile right away; the copy is written
//! back to the store once, after the last chunk. Cancellation is checked at
//! every chunk boundary and before each provider call. A call already in
//! flight is allowed to finish and its result is dropped.
//!
//! [`WorkerContext`] wraps the pipeline in a bus mailbox loop.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::analysis;
use crate::bus::{
    AiStatus, AnalysisInput, ContextId, Endpoint, Event, Incoming, Mailbox, RemoteError,
    RemoteErrorKind, Request, Response, StatusEvent,
};
use crate::chunking;
use crate::config::AnalysisConfig;
use crate::keepalive::spawn_keepalive;
use crate::merge::{self, MergeLimits};
use crate::provider::{estimate_tokens, LanguageModel, ProviderError, ProviderProbe, PromptOptions};
use crate::session::new_session_id;
use crate::store::{self, KeyValueStore};
use crate::types::{
    Chunk, ChunkProgress, ChunkResult, FailureKind, Phase, Profile, Progress, SessionOutcome,
    TimeRange, Trigger,
};

/// Approximate characters per token, used to size prompts
const CHARS_PER_TOKEN: usize = 4;

/// Receives progress snapshots as the pipeline advances.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, progress: Progress);
}

/// Discards progress.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn progress(&self, _progress: Progress) {}
}

/// Delay before retry number `attempt` (zero-based).
///
/// Doubles from `base`, capped at `max`. A provider-requested delay replaces
/// the computed one but is still capped.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, requested: Option<Duration>) -> Duration {
    let computed = base.saturating_mul(2u32.saturating_pow(attempt));
    requested.unwrap_or(computed).min(max)
}

enum CallOutcome {
    Answer(String),
    Cancelled,
    Failed(FailureKind, String),
}

/// One analysis session's worth of work.
pub struct AnalysisPipeline {
    provider: Arc<dyn LanguageModel>,
    store: Arc<dyn KeyValueStore>,
    config: AnalysisConfig,
}

impl AnalysisPipeline {
    pub fn new(provider: Arc<dyn LanguageModel>, store: Arc<dyn KeyValueStore>, config: AnalysisConfig) -> Self {
        Self {
            provider,
            store,
            config,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Run a session to its outcome. Never panics on provider or store failure.
    pub async fn run(
        &self,
        session_id: &str,
        input: AnalysisInput,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> SessionOutcome {
        let outcome = self.run_inner(session_id, input, cancel, sink).await;
        match &outcome {
            SessionOutcome::Completed {
                chunks_analyzed,
                chunks_skipped,
                ..
            } => {
                tracing::info!(session_id, chunks_analyzed, chunks_skipped, "Analysis complete");
                sink.progress(Progress::new(session_id, Phase::Complete));
            }
            SessionOutcome::Cancelled { chunks_analyzed } => {
                tracing::info!(session_id, chunks_analyzed, "Analysis cancelled");
            }
            SessionOutcome::Failed { kind, message } => {
                tracing::warn!(session_id, ?kind, error = %message, "Analysis failed");
                sink.progress(Progress::new(session_id, Phase::Error).with_sub_phase(message.clone()));
            }
        }
        outcome
    }

    async fn run_inner(
        &self,
        session_id: &str,
        input: AnalysisInput,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> SessionOutcome {
        sink.progress(Progress::new(session_id, Phase::Calculating));

        let mut working = match store::load_profile(&*self.store) {
            Ok(profile) => profile.unwrap_or_default(),
            Err(e) => {
                return SessionOutcome::Failed {
                    kind: FailureKind::Storage,
                    message: e.to_string(),
                }
            }
        };
        if cancel.is_cancelled() {
            return SessionOutcome::Cancelled { chunks_analyzed: 0 };
        }

        sink.progress(Progress::new(session_id, Phase::Chunking));
        let chunks = self.plan_chunks(session_id, &input, sink).await;
        tracing::info!(
            session_id,
            entries = input.items.len(),
            chunks = chunks.len(),
            "Session planned"
        );

        let caps = self.provider.capabilities();
        let limits = MergeLimits::with_max_list_items(self.config.max_list_items);
        let opts = analysis::chunk_prompt_options();
        let mut analyzed = 0usize;
        let mut skipped = 0usize;

        for chunk in &chunks {
            if cancel.is_cancelled() {
                return SessionOutcome::Cancelled {
                    chunks_analyzed: analyzed,
                };
            }

            let chunk_progress = ChunkProgress {
                current: chunk.index + 1,
                total: chunk.total_chunks,
                description: chunking::describe(chunk),
            };
            sink.progress(Progress::new(session_id, Phase::Analyzing).with_chunk(chunk_progress.clone()));

            let prompt = self.fit_prompt(chunk, &working, &opts, caps.max_input_tokens).await;

            let raw = match self
                .call_with_retry(session_id, &prompt, &opts, cancel, sink, &chunk_progress)
                .await
            {
                CallOutcome::Answer(raw) => raw,
                CallOutcome::Cancelled => {
                    return SessionOutcome::Cancelled {
                        chunks_analyzed: analyzed,
                    }
                }
                CallOutcome::Failed(kind, message) => return SessionOutcome::Failed { kind, message },
            };

            // in-flight result of a cancelled session is dropped
            if cancel.is_cancelled() {
                return SessionOutcome::Cancelled {
                    chunks_analyzed: analyzed,
                };
            }

            match analysis::parse_insights(&raw) {
                Ok(insights) => {
                    let result = ChunkResult {
                        insights,
                        latest_visit: chunk.latest_visit(),
                    };
                    working = merge::merge_with(working, &result, &limits);
                    analyzed += 1;
                }
                Err(e) => {
                    tracing::warn!(session_id, chunk = chunk.index, error = %e, "Skipping unparseable chunk result");
                    skipped += 1;
                }
            }
        }

        if cancel.is_cancelled() {
            return SessionOutcome::Cancelled {
                chunks_analyzed: analyzed,
            };
        }

        if chunks.is_empty() {
            return SessionOutcome::Completed {
                chunks_analyzed: 0,
                chunks_skipped: 0,
                watermark: working.last_history_timestamp,
            };
        }

        working.updated_at = Some(Utc::now());
        working.sessions_analyzed = working.sessions_analyzed.saturating_add(1);
        if let Err(e) = store::save_profile(&*self.store, &working) {
            return SessionOutcome::Failed {
                kind: FailureKind::Storage,
                message: e.to_string(),
            };
        }

        SessionOutcome::Completed {
            chunks_analyzed: analyzed,
            chunks_skipped: skipped,
            watermark: working.last_history_timestamp,
        }
    }

    /// Supplied ranges, else model-suggested ranges when enabled, else the
    /// half-day fallback; then split to the provider's preferred size.
    async fn plan_chunks(&self, session_id: &str, input: &AnalysisInput, sink: &dyn ProgressSink) -> Vec<Chunk> {
        let mut ranges = input.ranges.clone();
        if ranges.is_empty() && self.config.suggest_ranges && !input.items.is_empty() {
            sink.progress(Progress::new(session_id, Phase::Chunking).with_sub_phase("suggesting time ranges"));
            ranges = self.suggest_ranges(session_id, &input.items).await;
        }

        let chunks = chunking::chunk(&input.items, &ranges, true);
        let budget = self.provider.capabilities().optimal_chunk_tokens.max(1);
        chunking::enforce_token_budget(chunks, budget, analysis::entry_tokens)
    }

    async fn suggest_ranges(&self, session_id: &str, items: &[crate::types::HistoryEntry]) -> Vec<TimeRange> {
        let max_chars = self.provider.capabilities().max_input_tokens.saturating_mul(CHARS_PER_TOKEN) / 2;
        let (prompt, opts) = analysis::build_range_prompt(items, max_chars);
        match self.provider.prompt(&prompt, &opts).await {
            Ok(raw) => match analysis::parse_time_ranges(&raw) {
                Ok(ranges) => {
                    tracing::debug!(session_id, ranges = ranges.len(), "Using model-suggested ranges");
                    ranges
                }
                Err(e) => {
                    tracing::debug!(session_id, error = %e, "Unusable range suggestion, using half-day fallback");
                    Vec::new()
                }
            },
            Err(e) => {
                tracing::debug!(session_id, error = %e, "Range suggestion failed, using half-day fallback");
                Vec::new()
            }
        }
    }

    /// Build the chunk prompt and shrink it until the provider says it fits.
    async fn fit_prompt(&self, chunk: &Chunk, profile: &Profile, opts: &PromptOptions, max_tokens: usize) -> String {
        let mut max_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN);
        let mut prompt = analysis::build_chunk_prompt(chunk, profile, max_chars);

        for _ in 0..3 {
            let used = match self.provider.measure_input_usage(&prompt, opts).await {
                Ok(used) => used,
                Err(e) => {
                    tracing::debug!(error = %e, "Token measurement failed, using estimate");
                    estimate_tokens(&prompt)
                }
            };
            if used <= max_tokens {
                break;
            }
            // scale down by the overshoot plus a margin
            max_chars = max_chars.saturating_mul(max_tokens) / used.max(1) * 9 / 10;
            tracing::debug!(chunk = chunk.index, used, max_tokens, max_chars, "Prompt over input window, shrinking");
            prompt = analysis::build_chunk_prompt(chunk, profile, max_chars);
        }
        prompt
    }

    async fn call_with_retry(
        &self,
        session_id: &str,
        prompt: &str,
        opts: &PromptOptions,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
        chunk_progress: &ChunkProgress,
    ) -> CallOutcome {
        let max_retries = self.config.max_retries;
        let mut attempt: usize = 0;

        loop {
            if cancel.is_cancelled() {
                return CallOutcome::Cancelled;
            }

            let err = match self.provider.prompt(prompt, opts).await {
                Ok(raw) => return CallOutcome::Answer(raw),
                Err(e) => e,
            };

            if !err.is_transient() {
                return CallOutcome::Failed(FailureKind::Configuration, err.to_string());
            }
            if attempt >= max_retries {
                return CallOutcome::Failed(
                    FailureKind::RetriesExhausted,
                    format!("{} (after {} attempts)", err, attempt + 1),
                );
            }

            let delay = backoff_delay(
                attempt as u32,
                self.config.retry_base(),
                self.config.retry_max(),
                err.retry_after(),
            );
            attempt += 1;
            tracing::warn!(session_id, attempt, ?delay, error = %err, "Transient provider error, retrying");
            sink.progress(
                Progress::new(session_id, Phase::Retrying)
                    .with_chunk(chunk_progress.clone())
                    .with_retry_message(retry_message(&err, delay, attempt, max_retries)),
            );

            tokio::select! {
                _ = cancel.cancelled() => return CallOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn retry_message(err: &ProviderError, delay: Duration, attempt: usize, max_retries: usize) -> String {
    format!(
        "{}. Retrying in {}s (attempt {} of {})",
        err.user_message(),
        delay.as_secs().max(1),
        attempt,
        max_retries
    )
}

// ============================================
// Bus context
// ============================================

/// Forwards progress to another context over the bus.
pub struct BusSink {
    endpoint: Endpoint,
    to: ContextId,
}

impl BusSink {
    pub fn new(endpoint: Endpoint, to: ContextId) -> Self {
        Self { endpoint, to }
    }
}

impl ProgressSink for BusSink {
    fn progress(&self, progress: Progress) {
        self.endpoint.emit(self.to, Event::Progress(progress));
    }
}

struct Active {
    session_id: String,
    token: CancellationToken,
}

/// The worker's mailbox loop.
pub struct WorkerContext {
    endpoint: Endpoint,
    pipeline: Option<Arc<AnalysisPipeline>>,
    unavailable_reason: Option<String>,
    keepalive_interval: Duration,
    active: Arc<Mutex<Option<Active>>>,
}

impl WorkerContext {
    pub fn new(
        endpoint: Endpoint,
        probe: ProviderProbe,
        store: Arc<dyn KeyValueStore>,
        analysis: AnalysisConfig,
        keepalive_interval: Duration,
    ) -> Self {
        let (pipeline, unavailable_reason) = match probe {
            ProviderProbe::Ready(provider) => (
                Some(Arc::new(AnalysisPipeline::new(provider, store, analysis))),
                None,
            ),
            ProviderProbe::Unavailable { reason } => (None, Some(reason)),
        };
        Self {
            endpoint,
            pipeline,
            unavailable_reason,
            keepalive_interval,
            active: Arc::new(Mutex::new(None)),
        }
    }

    fn ai_status(&self) -> AiStatus {
        AiStatus {
            available: self.pipeline.is_some(),
            provider: self.pipeline.as_ref().map(|p| p.provider_name().to_string()),
            reason: self.unavailable_reason.clone(),
        }
    }

    /// Process the mailbox until every sender is gone or `shutdown` fires.
    pub async fn serve(self, mut mailbox: Mailbox, shutdown: CancellationToken) {
        self.endpoint
            .emit(ContextId::Coordinator, Event::AiStatus(self.ai_status()));

        loop {
            let incoming = tokio::select! {
                _ = shutdown.cancelled() => break,
                incoming = mailbox.recv() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };

            match incoming {
                Incoming::Request {
                    request, responder, ..
                } => {
                    let reply = self.handle_request(request);
                    responder.respond(reply);
                }
                Incoming::Event { from, event } => {
                    tracing::trace!(from = %from, event = event.name(), "Worker ignoring event");
                }
            }
        }

        if let Some(active) = self.lock_active().take() {
            active.token.cancel();
        }
        tracing::debug!("Worker stopped");
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<Active>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_request(&self, request: Request) -> crate::bus::Reply {
        match request {
            Request::StartAnalysis {
                session_id,
                trigger,
                input,
            } => {
                let session_id = session_id.unwrap_or_else(new_session_id);
                self.start(session_id, trigger, input)
            }
            Request::Cancel { session_id } => self.cancel(&session_id),
            other => Err(RemoteError::new(
                RemoteErrorKind::Unsupported,
                format!("worker does not handle {}", other.name()),
            )),
        }
    }

    /// Acknowledge immediately; the outcome arrives later as a `status` event.
    fn start(&self, session_id: String, trigger: Trigger, input: AnalysisInput) -> crate::bus::Reply {
        let Some(pipeline) = self.pipeline.clone() else {
            let reason = self
                .unavailable_reason
                .clone()
                .unwrap_or_else(|| "no language model".to_string());
            self.endpoint
                .emit(ContextId::Coordinator, Event::AiStatus(self.ai_status()));
            return Err(RemoteError::new(RemoteErrorKind::ProviderUnavailable, reason));
        };

        let token = CancellationToken::new();
        {
            let mut active = self.lock_active();
            // an id stays taken until its run has emitted `status`
            if active.as_ref().is_some_and(|a| a.session_id == session_id) {
                return Err(RemoteError::new(RemoteErrorKind::SessionRunning, session_id));
            }
            if let Some(previous) = active.replace(Active {
                session_id: session_id.clone(),
                token: token.clone(),
            }) {
                tracing::info!(old = %previous.session_id, new = %session_id, "Worker preempting session");
                previous.token.cancel();
            }
        }

        let endpoint = self.endpoint.clone();
        let active = Arc::clone(&self.active);
        let keepalive_interval = self.keepalive_interval;
        let id = session_id.clone();

        tokio::spawn(async move {
            let stop = token.child_token();
            let keepalive = spawn_keepalive(
                endpoint.clone(),
                ContextId::Coordinator,
                keepalive_interval,
                id.clone(),
                stop.clone(),
            );

            let sink = BusSink::new(endpoint.clone(), ContextId::Coordinator);
            let outcome = pipeline.run(&id, input, &token, &sink).await;

            stop.cancel();
            let _ = keepalive.await;

            {
                let mut guard = active.lock().unwrap_or_else(PoisonError::into_inner);
                if guard.as_ref().is_some_and(|a| a.session_id == id) {
                    guard.take();
                }
            }

            endpoint.emit(
                ContextId::Coordinator,
                Event::Status(StatusEvent {
                    session_id: id,
                    trigger,
                    outcome,
                }),
            );
        });

        Ok(Response::Started { session_id })
    }

    fn cancel(&self, session_id: &str) -> crate::bus::Reply {
        let active = self.lock_active();
        match active.as_ref() {
            Some(a) if a.session_id == session_id => {
                a.token.cancel();
                Ok(Response::Cancelled {
                    session_id: session_id.to_string(),
                })
            }
            Some(a) => Err(RemoteError::new(
                RemoteErrorKind::SessionMismatch,
                format!("worker is running {}", a.session_id),
            )),
            None => Err(RemoteError::new(
                RemoteErrorKind::SessionNotFound,
                session_id.to_string(),
            )),
        }
    }
}
