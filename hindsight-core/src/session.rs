//! Session registry
//!
//! Owned by the coordinator. Holds at most one current session and the last
//! progress seen for it. Every mutation is a single critical section under a
//! std mutex; nothing awaits while the lock is held.
//!
//! The current session holds a lease that keepalive and progress events
//! renew. A session whose lease runs out is treated as dead, so a lost
//! `status` event or a crashed worker task cannot wedge the registry.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::{Progress, SessionState, Trigger};

/// Fresh random session id.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug)]
struct Current {
    id: String,
    trigger: Trigger,
    token: CancellationToken,
    started_at: DateTime<Utc>,
    last_seen: Instant,
    last_progress: Option<Progress>,
}

impl Current {
    fn new(id: String, trigger: Trigger, token: CancellationToken) -> Self {
        Self {
            id,
            trigger,
            token,
            started_at: Utc::now(),
            last_seen: Instant::now(),
            last_progress: None,
        }
    }
}

/// Result of registering a session.
#[derive(Debug, Clone)]
pub struct Begun {
    pub token: CancellationToken,
    /// Session that was cancelled to make room, if any
    pub preempted: Option<String>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    current: Mutex<Option<Current>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Current>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `id` as current. A running session is cancelled first.
    ///
    /// Fails with [`Error::SessionRunning`] when `id` is already current;
    /// the old run's `status` would otherwise finish the new one.
    pub fn begin(&self, id: impl Into<String>, trigger: Trigger) -> Result<Begun> {
        let id = id.into();
        let mut current = self.lock();
        if current.as_ref().is_some_and(|c| c.id == id) {
            return Err(Error::SessionRunning(id));
        }

        let preempted = current.take().map(|old| {
            old.token.cancel();
            tracing::info!(old = %old.id, new = %id, "Preempting running session");
            old.id
        });

        let token = CancellationToken::new();
        *current = Some(Current::new(id, trigger, token.clone()));

        Ok(Begun { token, preempted })
    }

    /// Register `id` only when nothing is running.
    pub fn begin_if_idle(&self, id: impl Into<String>, trigger: Trigger) -> Option<CancellationToken> {
        let mut current = self.lock();
        if current.is_some() {
            return None;
        }
        let token = CancellationToken::new();
        *current = Some(Current::new(id.into(), trigger, token.clone()));
        Some(token)
    }

    /// Cancel the current session if it is `id`.
    ///
    /// Leaves the registry untouched when `id` is unknown or not current.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let mut current = self.lock();
        match current.as_ref() {
            None => Err(Error::SessionNotFound(id.to_string())),
            Some(c) if c.id != id => Err(Error::SessionMismatch {
                requested: id.to_string(),
                current: c.id.clone(),
            }),
            Some(_) => {
                if let Some(c) = current.take() {
                    c.token.cancel();
                }
                Ok(())
            }
        }
    }

    /// Clear `id` if it is still current. Stale ids are ignored.
    pub fn finish(&self, id: &str) -> bool {
        let mut current = self.lock();
        if current.as_ref().is_some_and(|c| c.id == id) {
            if let Some(c) = current.take() {
                tracing::debug!(
                    session_id = %c.id,
                    elapsed_ms = (Utc::now() - c.started_at).num_milliseconds(),
                    "Session finished"
                );
            }
            true
        } else {
            false
        }
    }

    /// Remember progress for the current session. Returns false for stale sessions.
    pub fn record_progress(&self, progress: &Progress) -> bool {
        let mut current = self.lock();
        match current.as_mut() {
            Some(c) if c.id == progress.session_id => {
                c.last_progress = Some(progress.clone());
                c.last_seen = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Renew the lease of `id`. Returns false for stale sessions.
    pub fn record_keepalive(&self, id: &str) -> bool {
        let mut current = self.lock();
        match current.as_mut() {
            Some(c) if c.id == id => {
                c.last_seen = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Drop the current session if nothing was heard from it for `lease`.
    ///
    /// Cancels its token and returns its id.
    pub fn expire_stale(&self, lease: Duration) -> Option<String> {
        let mut current = self.lock();
        if !current.as_ref().is_some_and(|c| c.last_seen.elapsed() > lease) {
            return None;
        }
        let stale = current.take()?;
        stale.token.cancel();
        tracing::warn!(
            session_id = %stale.id,
            silent_ms = stale.last_seen.elapsed().as_millis() as u64,
            "Session lease expired"
        );
        Some(stale.id)
    }

    pub fn snapshot(&self) -> SessionState {
        let current = self.lock();
        match current.as_ref() {
            None => SessionState::default(),
            Some(c) => SessionState {
                is_running: true,
                session_id: Some(c.id.clone()),
                trigger: Some(c.trigger),
                phase: c.last_progress.as_ref().map(|p| p.phase),
                chunk_progress: c
                    .last_progress
                    .as_ref()
                    .and_then(|p| p.chunk_progress.clone()),
            },
        }
    }

    pub fn current_id(&self) -> Option<String> {
        self.lock().as_ref().map(|c| c.id.clone())
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }
}
