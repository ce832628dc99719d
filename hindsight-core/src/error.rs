//! Error types for hindsight-core

use thiserror::Error;

use crate::bus::RemoteError;
use crate::provider::ProviderError;
use crate::store::StoreError;

/// Main error type for the hindsight-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error (history readers)
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Language model provider error
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Model returned something we could not interpret
    #[error("LLM error: {0}")]
    Llm(String),

    /// Persistence collaborator error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// No session is registered under this id
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A different session is current
    #[error("session {requested} is not the current session ({current})")]
    SessionMismatch { requested: String, current: String },

    /// Operation not allowed while a session is running
    #[error("session {0} is running")]
    SessionRunning(String),

    /// Another context answered with an error
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// Message bus could not deliver or got no answer
    #[error("transport error: {0}")]
    Transport(String),

    /// History source error
    #[error("history error: {0}")]
    History(String),
}

/// Result type alias for hindsight-core
pub type Result<T> = std::result::Result<T, Error>;
