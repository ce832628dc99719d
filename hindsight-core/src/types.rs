//! Core domain types for hindsight
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **HistoryEntry** | One visited URL as reported by the browser (read-only input) |
//! | **Chunk** | A time-bounded group of entries sized for one model call |
//! | **Session** | One run of the analysis pipeline, from chunking through merge |
//! | **Profile** | The durable behavioral memory accumulated across sessions |
//! | **Watermark** | `Profile::last_history_timestamp`, history at or before it has been analyzed |
//!
//! Every type that crosses a context boundary derives `Serialize`/`Deserialize`;
//! contexts exchange owned copies, never references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// History input
// ============================================

/// A single browsing history record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub url: String,
    #[serde(default)]
    pub title: String,
    /// `None` when the source had no usable timestamp; such entries are never chunked
    pub visited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub visit_count: u32,
}

impl HistoryEntry {
    pub fn new(url: impl Into<String>, title: impl Into<String>, visited_at: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            visited_at: Some(visited_at),
            visit_count: 1,
        }
    }
}

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// True when `ts` falls inside `[start, end)`
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// A group of history entries analyzed by one provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub items: Vec<HistoryEntry>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Zero-based position in the session's chunk list
    pub index: usize,
    pub total_chunks: usize,
    /// Produced by the half-day partitioner rather than a supplied range
    pub is_fallback: bool,
}

impl Chunk {
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end)
    }

    /// Latest defined visit time among the chunk's items
    pub fn latest_visit(&self) -> Option<DateTime<Utc>> {
        self.items.iter().filter_map(|i| i.visited_at).max()
    }
}

// ============================================
// Sessions and progress
// ============================================

/// What started a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Scheduled,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Scheduled => "scheduled",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pipeline phase reported in progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Calculating,
    Chunking,
    Analyzing,
    Retrying,
    Complete,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Calculating => "calculating",
            Phase::Chunking => "chunking",
            Phase::Analyzing => "analyzing",
            Phase::Retrying => "retrying",
            Phase::Complete => "complete",
            Phase::Error => "error",
        }
    }

    /// Phases after which the session no longer runs
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Error | Phase::Idle)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkProgress {
    /// One-based chunk number
    pub current: usize,
    pub total: usize,
    pub description: String,
}

/// Ephemeral progress snapshot emitted by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub session_id: String,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_progress: Option<ChunkProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_message: Option<String>,
}

impl Progress {
    pub fn new(session_id: impl Into<String>, phase: Phase) -> Self {
        Self {
            session_id: session_id.into(),
            phase,
            sub_phase: None,
            chunk_progress: None,
            retry_message: None,
        }
    }

    pub fn with_sub_phase(mut self, sub_phase: impl Into<String>) -> Self {
        self.sub_phase = Some(sub_phase.into());
        self
    }

    pub fn with_chunk(mut self, chunk_progress: ChunkProgress) -> Self {
        self.chunk_progress = Some(chunk_progress);
        self
    }

    pub fn with_retry_message(mut self, message: impl Into<String>) -> Self {
        self.retry_message = Some(message.into());
        self
    }
}

/// Snapshot answered by `get-state`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub is_running: bool,
    pub session_id: Option<String>,
    pub trigger: Option<Trigger>,
    pub phase: Option<Phase>,
    pub chunk_progress: Option<ChunkProgress>,
}

/// Category of a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Credentials or model settings are wrong; retrying will not help
    Configuration,
    /// Transient provider failures outlasted the retry budget
    RetriesExhausted,
    /// The store rejected the final write
    Storage,
    /// No language model is available
    ProviderUnavailable,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed {
        chunks_analyzed: usize,
        chunks_skipped: usize,
        watermark: Option<DateTime<Utc>>,
    },
    Cancelled {
        chunks_analyzed: usize,
    },
    Failed {
        kind: FailureKind,
        message: String,
    },
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Completed { .. } => "completed",
            SessionOutcome::Cancelled { .. } => "cancelled",
            SessionOutcome::Failed { .. } => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Completed { .. })
    }
}

/// Persisted summary of the most recently finished session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub session_id: String,
    pub trigger: Trigger,
    pub outcome: SessionOutcome,
    pub finished_at: DateTime<Utc>,
}

// ============================================
// Profile ("memory")
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutomationPotential {
    High,
    #[default]
    Medium,
    Low,
}

/// A recurring browsing workflow the model recognized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowPattern {
    pub pattern: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_frequency")]
    pub frequency: u32,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_pattern: Option<String>,
    #[serde(default)]
    pub suggestion: String,
    #[serde(default)]
    pub automation_potential: AutomationPotential,
}

fn default_frequency() -> u32 {
    1
}

/// The durable behavioral profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub summary: String,
    pub goals: Vec<String>,
    pub obsessions: Vec<String>,
    pub preferences: Vec<String>,
    pub traits: Vec<String>,
    pub interests: Vec<String>,
    pub technology_use: Vec<String>,
    pub lifecycle_hints: Vec<String>,
    pub workflow_patterns: Vec<WorkflowPattern>,
    /// High-water mark of analyzed history
    pub last_history_timestamp: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub sessions_analyzed: u32,
}

impl Profile {
    pub fn is_empty(&self) -> bool {
        self.summary.is_empty()
            && self.last_history_timestamp.is_none()
            && self.workflow_patterns.is_empty()
            && self.goals.is_empty()
            && self.interests.is_empty()
    }
}

/// Facts the model extracted from one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkInsights {
    pub summary: Option<String>,
    pub goals: Vec<String>,
    pub obsessions: Vec<String>,
    pub preferences: Vec<String>,
    pub traits: Vec<String>,
    pub interests: Vec<String>,
    pub technology_use: Vec<String>,
    pub lifecycle_hints: Vec<String>,
    pub workflow_patterns: Vec<WorkflowPattern>,
}

/// Input to the merge engine: extracted insights plus the chunk's latest visit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkResult {
    pub insights: ChunkInsights,
    pub latest_visit: Option<DateTime<Utc>>,
}

// ============================================
// Provider capabilities
// ============================================

/// Read-only limits advertised by a language model provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub max_input_tokens: usize,
    pub optimal_chunk_tokens: usize,
    pub supports_token_measurement: bool,
}
