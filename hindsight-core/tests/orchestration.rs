//! End-to-end tests of the coordinator, worker and UI contexts over the bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone, Utc};
use tokio::sync::Semaphore;

use hindsight_core::bus::{Incoming, Mailbox, RemoteErrorKind, StatusEvent};
use hindsight_core::config::Config;
use hindsight_core::history::StaticHistory;
use hindsight_core::provider::{LanguageModel, PromptOptions, ProviderError, ProviderProbe};
use hindsight_core::scheduler::{SkipReason, TriggerOutcome};
use hindsight_core::store::{self, KeyValueStore, MemoryStore, SqliteStore};
use hindsight_core::{
    AnalysisInput, Delivery, Event, FailureKind, HistoryEntry, Phase, Profile,
    ProviderCapabilities, Request, Response, Runtime, Services, SessionOutcome, Trigger,
};

const ANSWER: &str = r#"{"summary":"Researching Rust async","interests":["rust","tokio"],"workflow_patterns":[{"pattern":"docs lookup","urls":["https://docs.rs"]}]}"#;

// ============================================
// Fixtures
// ============================================

/// Answers every prompt the same way; optionally waits for a permit first.
struct FakeModel {
    answer: Result<String, ProviderError>,
    gate: Option<Arc<Semaphore>>,
    calls: AtomicUsize,
}

impl FakeModel {
    fn answering(answer: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: Ok(answer.to_string()),
            gate: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(err: ProviderError) -> Arc<Self> {
        Arc::new(Self {
            answer: Err(err),
            gate: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn gated(answer: &str, gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            answer: Ok(answer.to_string()),
            gate: Some(gate),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for FakeModel {
    fn name(&self) -> &str {
        "fake"
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            max_input_tokens: 100_000,
            optimal_chunk_tokens: 10_000,
            supports_token_measurement: false,
        }
    }

    async fn prompt(&self, _text: &str, _opts: &PromptOptions) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.answer.clone()
    }
}

fn local(hour: u32) -> DateTime<Utc> {
    Local
        .with_ymd_and_hms(2024, 1, 15, hour, 0, 0)
        .unwrap()
        .with_timezone(&Utc)
}

fn four_entries() -> Vec<HistoryEntry> {
    vec![
        HistoryEntry::new("https://docs.rs/tokio", "tokio - Rust", local(9)),
        HistoryEntry::new("https://docs.rs/serde", "serde - Rust", local(11)),
        HistoryEntry::new("https://news.example", "News", local(14)),
        HistoryEntry::new("https://weather.example", "Weather", local(15)),
    ]
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.bus.request_timeout_secs = 5;
    config.analysis.retry_base_ms = 10;
    config.analysis.retry_max_ms = 20;
    config
}

fn start_runtime(
    model: Option<Arc<FakeModel>>,
    store: Arc<dyn KeyValueStore>,
    history: Option<StaticHistory>,
) -> (Runtime, Mailbox) {
    hindsight_core::logging::init_test();
    let probe = match model {
        Some(model) => ProviderProbe::Ready(model),
        None => ProviderProbe::Unavailable {
            reason: "no [llm] section configured".to_string(),
        },
    };
    Runtime::start(
        &test_config(),
        Services {
            store,
            probe,
            history: history.map(|h| Arc::new(h) as Arc<dyn hindsight_core::history::HistorySource>),
            alarms: None,
        },
    )
    .expect("runtime should start")
}

async fn start_manual(runtime: &Runtime, items: Vec<HistoryEntry>) -> String {
    let delivery = runtime
        .request(Request::StartAnalysis {
            session_id: None,
            trigger: Trigger::Manual,
            input: AnalysisInput {
                items,
                ranges: vec![],
            },
        })
        .await;
    match delivery {
        Delivery::Responded(Ok(Response::Started { session_id })) => session_id,
        other => panic!("expected started, got {other:?}"),
    }
}

async fn next_event(ui: &mut Mailbox) -> Event {
    let incoming = tokio::time::timeout(Duration::from_secs(5), ui.recv())
        .await
        .expect("timed out waiting for event")
        .expect("ui mailbox closed");
    match incoming {
        Incoming::Event { event, .. } => event,
        Incoming::Request { request, .. } => panic!("ui received request {request:?}"),
    }
}

async fn status_for(ui: &mut Mailbox, session_id: &str) -> StatusEvent {
    loop {
        if let Event::Status(status) = next_event(ui).await {
            if status.session_id == session_id {
                return status;
            }
        }
    }
}

async fn wait_for_phase(ui: &mut Mailbox, session_id: &str, phase: Phase) {
    loop {
        if let Event::Progress(progress) = next_event(ui).await {
            if progress.session_id == session_id && progress.phase == phase {
                return;
            }
        }
    }
}

// ============================================
// End to end
// ============================================

#[tokio::test]
async fn four_entries_produce_two_fallback_chunks_and_advance_watermark() {
    let model = FakeModel::answering(ANSWER);
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let (runtime, mut ui) = start_runtime(Some(model.clone()), Arc::clone(&store), None);

    let id = start_manual(&runtime, four_entries()).await;
    let status = status_for(&mut ui, &id).await;

    assert_eq!(status.trigger, Trigger::Manual);
    assert_eq!(
        status.outcome,
        SessionOutcome::Completed {
            chunks_analyzed: 2,
            chunks_skipped: 0,
            watermark: Some(local(15)),
        }
    );
    assert_eq!(model.calls(), 2);

    let profile = store::load_profile(&*store).unwrap().unwrap();
    assert_eq!(profile.summary, "Researching Rust async");
    assert_eq!(profile.interests, vec!["rust", "tokio"]);
    assert_eq!(profile.workflow_patterns.len(), 1);
    assert_eq!(profile.workflow_patterns[0].frequency, 2);
    assert_eq!(profile.last_history_timestamp, Some(local(15)));
    assert_eq!(profile.sessions_analyzed, 1);

    let record = store::load_last_run(&*store).unwrap().unwrap();
    assert_eq!(record.session_id, id);
    assert!(record.outcome.is_success());

    runtime.shutdown().await;
}

#[tokio::test]
async fn progress_reaches_ui_with_chunk_counts() {
    let model = FakeModel::answering(ANSWER);
    let (runtime, mut ui) = start_runtime(Some(model), Arc::new(MemoryStore::new()), None);

    let id = start_manual(&runtime, four_entries()).await;

    let mut analyzing = Vec::new();
    loop {
        match next_event(&mut ui).await {
            Event::Progress(p) if p.phase == Phase::Analyzing => {
                analyzing.push(p.chunk_progress.expect("analyzing carries chunk progress"));
            }
            Event::Status(s) if s.session_id == id => break,
            _ => {}
        }
    }

    assert_eq!(analyzing.len(), 2);
    assert_eq!((analyzing[0].current, analyzing[0].total), (1, 2));
    assert_eq!((analyzing[1].current, analyzing[1].total), (2, 2));
    runtime.shutdown().await;
}

#[tokio::test]
async fn sqlite_store_keeps_profile_across_runtimes() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("store.db");

    {
        let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(&path).unwrap());
        let (runtime, mut ui) = start_runtime(Some(FakeModel::answering(ANSWER)), store, None);
        let id = start_manual(&runtime, four_entries()).await;
        assert!(status_for(&mut ui, &id).await.outcome.is_success());
        runtime.shutdown().await;
    }

    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(&path).unwrap());
    let (runtime, _ui) = start_runtime(Some(FakeModel::answering(ANSWER)), store, None);
    match runtime.request(Request::ReadProfile).await {
        Delivery::Responded(Ok(Response::Profile {
            profile: Some(profile),
        })) => {
            assert_eq!(profile.last_history_timestamp, Some(local(15)));
        }
        other => panic!("expected stored profile, got {other:?}"),
    }
    runtime.shutdown().await;
}

// ============================================
// Single flight and cancellation
// ============================================

#[tokio::test]
async fn newer_manual_request_cancels_running_session() {
    let gate = Arc::new(Semaphore::new(0));
    let model = FakeModel::gated(ANSWER, Arc::clone(&gate));
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let (runtime, mut ui) = start_runtime(Some(model), Arc::clone(&store), None);

    let first = start_manual(&runtime, four_entries()).await;
    wait_for_phase(&mut ui, &first, Phase::Analyzing).await;

    let second = start_manual(&runtime, four_entries()).await;
    assert_ne!(first, second);

    match runtime.request(Request::GetState).await {
        Delivery::Responded(Ok(Response::State { state })) => {
            assert!(state.is_running);
            assert_eq!(state.session_id.as_deref(), Some(second.as_str()));
        }
        other => panic!("unexpected {other:?}"),
    }

    gate.add_permits(10);

    let mut first_outcome = None;
    let mut second_outcome = None;
    while first_outcome.is_none() || second_outcome.is_none() {
        if let Event::Status(status) = next_event(&mut ui).await {
            if status.session_id == first {
                first_outcome = Some(status.outcome);
            } else if status.session_id == second {
                second_outcome = Some(status.outcome);
            }
        }
    }

    assert!(matches!(first_outcome, Some(SessionOutcome::Cancelled { .. })));
    assert!(matches!(second_outcome, Some(SessionOutcome::Completed { .. })));
    // only the surviving session was merged
    let profile = store::load_profile(&*store).unwrap().unwrap();
    assert_eq!(profile.sessions_analyzed, 1);
    runtime.shutdown().await;
}

#[tokio::test]
async fn cancel_checks_session_identity() {
    let gate = Arc::new(Semaphore::new(0));
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let (runtime, mut ui) = start_runtime(
        Some(FakeModel::gated(ANSWER, Arc::clone(&gate))),
        Arc::clone(&store),
        None,
    );

    // nothing running
    match runtime
        .request(Request::Cancel {
            session_id: "missing".to_string(),
        })
        .await
    {
        Delivery::Responded(Err(e)) => assert_eq!(e.kind, RemoteErrorKind::SessionNotFound),
        other => panic!("expected not-found, got {other:?}"),
    }

    let id = start_manual(&runtime, four_entries()).await;
    wait_for_phase(&mut ui, &id, Phase::Analyzing).await;

    match runtime
        .request(Request::Cancel {
            session_id: "someone-else".to_string(),
        })
        .await
    {
        Delivery::Responded(Err(e)) => assert_eq!(e.kind, RemoteErrorKind::SessionMismatch),
        other => panic!("expected mismatch, got {other:?}"),
    }
    assert!(runtime.coordinator().state().is_running);

    match runtime
        .request(Request::Cancel {
            session_id: id.clone(),
        })
        .await
    {
        Delivery::Responded(Ok(Response::Cancelled { session_id })) => assert_eq!(session_id, id),
        other => panic!("expected cancelled, got {other:?}"),
    }
    assert!(!runtime.coordinator().state().is_running);
    wait_for_phase(&mut ui, &id, Phase::Idle).await;

    gate.add_permits(10);
    let status = status_for(&mut ui, &id).await;
    assert_eq!(status.outcome, SessionOutcome::Cancelled { chunks_analyzed: 0 });
    assert!(store::load_profile(&*store).unwrap().is_none());
    runtime.shutdown().await;
}

#[tokio::test]
async fn reusing_running_session_id_is_refused() {
    let gate = Arc::new(Semaphore::new(0));
    let (runtime, mut ui) = start_runtime(
        Some(FakeModel::gated(ANSWER, Arc::clone(&gate))),
        Arc::new(MemoryStore::new()),
        None,
    );
    let start_dup = || Request::StartAnalysis {
        session_id: Some("dup".to_string()),
        trigger: Trigger::Manual,
        input: AnalysisInput {
            items: four_entries(),
            ranges: vec![],
        },
    };

    match runtime.request(start_dup()).await {
        Delivery::Responded(Ok(Response::Started { session_id })) => assert_eq!(session_id, "dup"),
        other => panic!("expected started, got {other:?}"),
    }
    wait_for_phase(&mut ui, "dup", Phase::Analyzing).await;

    match runtime.request(start_dup()).await {
        Delivery::Responded(Err(e)) => assert_eq!(e.kind, RemoteErrorKind::SessionRunning),
        other => panic!("expected refusal, got {other:?}"),
    }
    let state = runtime.coordinator().state();
    assert!(state.is_running);
    assert_eq!(state.session_id.as_deref(), Some("dup"));

    // the live run is still addressable
    runtime.coordinator().cancel("dup").await.unwrap();
    gate.add_permits(10);
    let status = status_for(&mut ui, "dup").await;
    assert_eq!(status.outcome, SessionOutcome::Cancelled { chunks_analyzed: 0 });

    // once its status is out, the id is free again
    match runtime.request(start_dup()).await {
        Delivery::Responded(Ok(Response::Started { session_id })) => assert_eq!(session_id, "dup"),
        other => panic!("expected started, got {other:?}"),
    }
    assert!(status_for(&mut ui, "dup").await.outcome.is_success());
    assert!(!runtime.coordinator().state().is_running);
    runtime.shutdown().await;
}

#[tokio::test]
async fn profile_write_refused_while_running() {
    let gate = Arc::new(Semaphore::new(0));
    let (runtime, mut ui) = start_runtime(
        Some(FakeModel::gated(ANSWER, Arc::clone(&gate))),
        Arc::new(MemoryStore::new()),
        None,
    );
    let id = start_manual(&runtime, four_entries()).await;
    wait_for_phase(&mut ui, &id, Phase::Analyzing).await;

    let delivery = runtime
        .request(Request::WriteProfile {
            profile: Profile::default(),
        })
        .await;
    match delivery {
        Delivery::Responded(Err(e)) => assert_eq!(e.kind, RemoteErrorKind::SessionRunning),
        other => panic!("expected refusal, got {other:?}"),
    }

    gate.add_permits(10);
    status_for(&mut ui, &id).await;
    let delivery = runtime
        .request(Request::WriteProfile {
            profile: Profile::default(),
        })
        .await;
    assert_eq!(delivery, Delivery::Responded(Ok(Response::ProfileWritten)));
    runtime.shutdown().await;
}

// ============================================
// Failures
// ============================================

#[tokio::test]
async fn configuration_error_fails_session() {
    let model = FakeModel::failing(ProviderError::InvalidConfiguration("401 unauthorized".into()));
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let (runtime, mut ui) = start_runtime(Some(model.clone()), Arc::clone(&store), None);

    let id = start_manual(&runtime, four_entries()).await;
    let status = status_for(&mut ui, &id).await;

    match status.outcome {
        SessionOutcome::Failed { kind, message } => {
            assert_eq!(kind, FailureKind::Configuration);
            assert!(message.contains("401"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(model.calls(), 1);
    assert!(store::load_profile(&*store).unwrap().is_none());
    assert!(!runtime.coordinator().state().is_running);
    runtime.shutdown().await;
}

#[tokio::test]
async fn transient_errors_exhaust_retries() {
    let model = FakeModel::failing(ProviderError::Transient("connection reset".into()));
    let (runtime, mut ui) = start_runtime(Some(model.clone()), Arc::new(MemoryStore::new()), None);

    let id = start_manual(&runtime, four_entries()).await;
    let mut saw_retrying = false;
    let status = loop {
        match next_event(&mut ui).await {
            Event::Progress(p) if p.phase == Phase::Retrying => {
                assert!(p.retry_message.is_some());
                saw_retrying = true;
            }
            Event::Status(s) if s.session_id == id => break s,
            _ => {}
        }
    };

    assert!(saw_retrying);
    assert!(matches!(
        status.outcome,
        SessionOutcome::Failed {
            kind: FailureKind::RetriesExhausted,
            ..
        }
    ));
    // default max_retries = 3
    assert_eq!(model.calls(), 4);
    runtime.shutdown().await;
}

#[tokio::test]
async fn start_fails_loudly_without_provider() {
    let (runtime, mut ui) = start_runtime(None, Arc::new(MemoryStore::new()), None);

    match next_event(&mut ui).await {
        Event::AiStatus(status) => {
            assert!(!status.available);
            assert!(status.reason.is_some());
        }
        other => panic!("expected ai-status, got {other:?}"),
    }

    let delivery = runtime
        .request(Request::StartAnalysis {
            session_id: None,
            trigger: Trigger::Manual,
            input: AnalysisInput {
                items: four_entries(),
                ranges: vec![],
            },
        })
        .await;
    match delivery {
        Delivery::Responded(Err(e)) => assert_eq!(e.kind, RemoteErrorKind::ProviderUnavailable),
        other => panic!("expected provider-unavailable, got {other:?}"),
    }
    assert!(!runtime.coordinator().state().is_running);
    runtime.shutdown().await;
}

// ============================================
// Scheduling
// ============================================

#[tokio::test]
async fn scheduled_run_respects_toggle_and_running_session() {
    let gate = Arc::new(Semaphore::new(0));
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let recent = Utc::now() - chrono::Duration::minutes(30);
    let history = StaticHistory::new(vec![HistoryEntry::new(
        "https://docs.rs",
        "Docs",
        recent,
    )]);
    let (runtime, mut ui) = start_runtime(
        Some(FakeModel::gated(ANSWER, Arc::clone(&gate))),
        Arc::clone(&store),
        Some(history),
    );
    let coordinator = runtime.coordinator();

    assert_eq!(
        coordinator.fire_scheduled().await.unwrap(),
        TriggerOutcome::Skipped(SkipReason::Disabled)
    );

    match runtime.request(Request::ToggleSchedule { enabled: true }).await {
        Delivery::Responded(Ok(Response::ScheduleToggled { enabled, next_fire })) => {
            assert!(enabled);
            assert!(next_fire.is_some());
        }
        other => panic!("unexpected {other:?}"),
    }

    let manual = start_manual(&runtime, four_entries()).await;
    wait_for_phase(&mut ui, &manual, Phase::Analyzing).await;
    assert_eq!(
        coordinator.fire_scheduled().await.unwrap(),
        TriggerOutcome::Skipped(SkipReason::SessionRunning)
    );
    // the manual session was not pre-empted
    assert_eq!(coordinator.state().session_id.as_deref(), Some(manual.as_str()));

    gate.add_permits(100);
    status_for(&mut ui, &manual).await;

    // manual run moved the watermark to 2024, so the recent visit is new
    let scheduled = match coordinator.fire_scheduled().await.unwrap() {
        TriggerOutcome::Started(id) => id,
        other => panic!("expected start, got {other:?}"),
    };
    let status = status_for(&mut ui, &scheduled).await;
    assert_eq!(status.trigger, Trigger::Scheduled);
    assert!(status.outcome.is_success());

    assert_eq!(
        coordinator.fire_scheduled().await.unwrap(),
        TriggerOutcome::Skipped(SkipReason::NoNewHistory)
    );
    runtime.shutdown().await;
}

#[tokio::test]
async fn scheduled_run_without_history_source_is_skipped() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    store::set_schedule_enabled(&*store, true).unwrap();
    let (runtime, _ui) = start_runtime(Some(FakeModel::answering(ANSWER)), store, None);

    assert_eq!(
        runtime.coordinator().fire_scheduled().await.unwrap(),
        TriggerOutcome::Skipped(SkipReason::NoHistorySource)
    );
    runtime.shutdown().await;
}
