//! # hindsight-core
//!
//! Core library for hindsight - a browsing-history analyst that keeps a
//! behavioral profile up to date with a language model.
//!
//! This library provides:
//! - Time-based chunking of browsing history
//! - A session orchestrator with single-flight execution, cancellation,
//!   keepalive and periodic scheduling
//! - A message bus between the coordinator, worker and UI contexts
//! - The memory merge engine that folds chunk results into the profile
//! - Configuration, logging and SQLite-backed storage
//!
//! ## Architecture
//!
//! Three contexts run as independent tasks and share no mutable state:
//! - **Coordinator:** always available; owns the session registry, relays
//!   events and fires scheduled runs
//! - **Worker:** runs the analysis pipeline for one session at a time
//! - **UI:** issues requests and observes `progress`/`status` events
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hindsight_core::{Config, Runtime, Services, SqliteStore};
//! use hindsight_core::provider::probe_provider;
//!
//! # async fn run() -> hindsight_core::Result<()> {
//! let config = Config::load()?;
//! let store = Arc::new(SqliteStore::open(&Config::store_path())?);
//! let (runtime, _ui_events) = Runtime::start(
//!     &config,
//!     Services {
//!         store,
//!         probe: probe_provider(&config),
//!         history: None,
//!         alarms: None,
//!     },
//! )?;
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use bus::{AnalysisInput, Bus, ContextId, Delivery, Event, Request, Response};
pub use config::Config;
pub use error::{Error, Result};
pub use runtime::{Runtime, Services};
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
pub use types::*;

// Public modules
pub mod analysis;
pub mod bus;
pub mod chunking;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod keepalive;
pub mod logging;
pub mod merge;
pub mod provider;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod types;
pub mod worker;
