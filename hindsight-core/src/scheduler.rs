//! Periodic scheduling
//!
//! Two named recurring alarms drive the scheduled path:
//!
//! - [`ANALYSIS_ALARM`] fires every `interval_minutes` and asks the coordinator
//!   to start a `Scheduled` session
//! - [`HEALTH_ALARM`] fires every `health_check_minutes`, enabled or not, and
//!   arms or clears the analysis alarm to match the stored toggle
//!
//! Alarms only deliver names on a channel; what a firing means is decided by
//! the coordinator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ScheduleConfig;
use crate::error::Result;
use crate::store::{self, KeyValueStore};

pub const ANALYSIS_ALARM: &str = "periodic-analysis";
pub const HEALTH_ALARM: &str = "schedule-health-check";

/// Named recurring timers.
pub trait Alarms: Send + Sync {
    /// Create or replace `name`, first firing after `delay`, then every `period`.
    fn create(&self, name: &str, delay: Duration, period: Duration);

    /// Returns whether an alarm was removed
    fn clear(&self, name: &str) -> bool;

    /// Next fire time, or `None` when no such alarm exists
    fn get(&self, name: &str) -> Option<DateTime<Utc>>;
}

struct AlarmHandle {
    next_fire: Arc<Mutex<DateTime<Utc>>>,
    task: JoinHandle<()>,
}

/// Alarms backed by tokio timers; firings arrive on the receiver returned by
/// [`TokioAlarms::new`].
pub struct TokioAlarms {
    alarms: Mutex<HashMap<String, AlarmHandle>>,
    fired: mpsc::Sender<String>,
}

impl TokioAlarms {
    pub fn new() -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                alarms: Mutex::new(HashMap::new()),
                fired: tx,
            },
            rx,
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AlarmHandle>> {
        self.alarms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

impl Alarms for TokioAlarms {
    fn create(&self, name: &str, delay: Duration, period: Duration) {
        let period = period.max(Duration::from_millis(1));
        let next_fire = Arc::new(Mutex::new(Utc::now() + to_chrono(delay)));
        let task_next = Arc::clone(&next_fire);
        let fired = self.fired.clone();
        let alarm_name = name.to_string();

        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + delay;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                *task_next.lock().unwrap_or_else(PoisonError::into_inner) =
                    Utc::now() + to_chrono(period);
                if fired.send(alarm_name.clone()).await.is_err() {
                    break;
                }
            }
        });

        if let Some(old) = self.lock().insert(name.to_string(), AlarmHandle { next_fire, task }) {
            old.task.abort();
        }
        tracing::debug!(alarm = name, ?delay, ?period, "Alarm armed");
    }

    fn clear(&self, name: &str) -> bool {
        match self.lock().remove(name) {
            Some(handle) => {
                handle.task.abort();
                tracing::debug!(alarm = name, "Alarm cleared");
                true
            }
            None => false,
        }
    }

    fn get(&self, name: &str) -> Option<DateTime<Utc>> {
        let alarms = self.lock();
        let handle = alarms.get(name)?;
        if handle.task.is_finished() {
            return None;
        }
        let next = *handle.next_fire.lock().unwrap_or_else(PoisonError::into_inner);
        Some(next)
    }
}

impl Drop for TokioAlarms {
    fn drop(&mut self) {
        for (_, handle) in self.lock().drain() {
            handle.task.abort();
        }
    }
}

/// Why a scheduled firing did not start a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    SessionRunning,
    NoNewHistory,
    NoHistorySource,
    WorkerUnavailable,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Disabled => "scheduling disabled",
            SkipReason::SessionRunning => "a session is already running",
            SkipReason::NoNewHistory => "no new history since last run",
            SkipReason::NoHistorySource => "no history source configured",
            SkipReason::WorkerUnavailable => "worker did not accept the session",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started(String),
    Skipped(SkipReason),
}

/// Scheduling toggle and alarm lifecycle.
pub struct Schedule {
    alarms: Arc<dyn Alarms>,
    store: Arc<dyn KeyValueStore>,
    config: ScheduleConfig,
}

impl Schedule {
    pub fn new(alarms: Arc<dyn Alarms>, store: Arc<dyn KeyValueStore>, config: ScheduleConfig) -> Self {
        Self {
            alarms,
            store,
            config,
        }
    }

    /// Stored toggle, falling back to the configured default.
    pub fn is_enabled(&self) -> Result<bool> {
        let stored = store::stored_schedule_enabled(&*self.store)?;
        Ok(stored.unwrap_or(self.config.enabled))
    }

    /// Persist the toggle and arm or clear the analysis alarm. Returns the
    /// next fire time.
    pub fn set_enabled(&self, enabled: bool) -> Result<Option<DateTime<Utc>>> {
        store::set_schedule_enabled(&*self.store, enabled)?;
        self.ensure_health_alarm();
        if enabled {
            self.arm_analysis();
        } else {
            self.alarms.clear(ANALYSIS_ALARM);
        }
        tracing::info!(enabled, "Scheduled analysis toggled");
        Ok(self.next_fire())
    }

    /// Arm the health alarm, and the analysis alarm when the toggle is on.
    ///
    /// The health alarm runs even while disabled so a toggle written by
    /// another process is noticed without a restart.
    pub fn restore(&self) -> Result<bool> {
        let enabled = self.is_enabled()?;
        self.ensure_health_alarm();
        if enabled {
            self.arm_analysis();
        }
        Ok(enabled)
    }

    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.alarms.get(ANALYSIS_ALARM)
    }

    /// Bring the analysis alarm in line with the stored toggle.
    ///
    /// Returns true when the alarm had to be created or cleared.
    pub fn health_check(&self) -> Result<bool> {
        let enabled = self.is_enabled()?;
        self.ensure_health_alarm();
        let armed = self.alarms.get(ANALYSIS_ALARM).is_some();
        match (enabled, armed) {
            (true, false) => {
                tracing::warn!("Analysis alarm missing, arming");
                self.arm_analysis();
                Ok(true)
            }
            (false, true) => {
                tracing::info!("Scheduled analysis disabled, clearing alarm");
                self.alarms.clear(ANALYSIS_ALARM);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn arm_analysis(&self) {
        let interval = self.config.interval();
        self.alarms.create(ANALYSIS_ALARM, interval, interval);
    }

    fn ensure_health_alarm(&self) {
        if self.alarms.get(HEALTH_ALARM).is_none() {
            let check = self.config.health_check_interval();
            self.alarms.create(HEALTH_ALARM, check, check);
        }
    }
}
