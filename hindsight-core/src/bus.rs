//! Cross-context message bus
//!
//! Coordinator, worker and UI surface each own one [`Mailbox`] and talk only
//! through the bus; nothing mutable is shared between them.
//!
//! ## Catalog
//!
//! | Kind | Name | Direction |
//! |------|------|-----------|
//! | request | `start-analysis` | ui → coordinator → worker |
//! | request | `cancel` | ui → coordinator → worker |
//! | request | `get-state` | ui → coordinator |
//! | request | `toggle-schedule` | ui → coordinator |
//! | request | `read-profile` / `write-profile` | ui → coordinator |
//! | event | `progress` | worker → coordinator → ui |
//! | event | `status` | worker → coordinator → ui |
//! | event | `ai-status` | worker → coordinator → ui |
//! | event | `keepalive` | worker → coordinator |
//!
//! Delivery is at-most-once. A request yields a [`Delivery`] that separates
//! "the other side answered" from "nobody answered". Events are fire and
//! forget. The bus never retries.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::config::BusConfig;
use crate::error::Error;
use crate::types::{
    HistoryEntry, Profile, Progress, SessionOutcome, SessionState, TimeRange, Trigger,
};

// ============================================
// Addresses and messages
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextId {
    Coordinator,
    Worker,
    Ui,
}

impl ContextId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextId::Coordinator => "coordinator",
            ContextId::Worker => "worker",
            ContextId::Ui => "ui",
        }
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// History to analyze plus optional caller-supplied ranges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisInput {
    pub items: Vec<HistoryEntry>,
    #[serde(default)]
    pub ranges: Vec<TimeRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Request {
    StartAnalysis {
        /// Assigned by the coordinator when absent
        #[serde(default)]
        session_id: Option<String>,
        trigger: Trigger,
        input: AnalysisInput,
    },
    Cancel {
        session_id: String,
    },
    GetState,
    ToggleSchedule {
        enabled: bool,
    },
    ReadProfile,
    WriteProfile {
        profile: Profile,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::StartAnalysis { .. } => "start-analysis",
            Request::Cancel { .. } => "cancel",
            Request::GetState => "get-state",
            Request::ToggleSchedule { .. } => "toggle-schedule",
            Request::ReadProfile => "read-profile",
            Request::WriteProfile { .. } => "write-profile",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Response {
    Started {
        session_id: String,
    },
    Cancelled {
        session_id: String,
    },
    State {
        state: SessionState,
    },
    ScheduleToggled {
        enabled: bool,
        next_fire: Option<DateTime<Utc>>,
    },
    Profile {
        profile: Option<Profile>,
    },
    ProfileWritten,
}

/// Category of an application-level failure carried inside a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    SessionNotFound,
    SessionMismatch,
    SessionRunning,
    ProviderUnavailable,
    Storage,
    Transport,
    Unsupported,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<&Error> for RemoteError {
    fn from(e: &Error) -> Self {
        if let Error::Remote(remote) = e {
            return remote.clone();
        }
        let kind = match e {
            Error::SessionNotFound(_) => RemoteErrorKind::SessionNotFound,
            Error::SessionMismatch { .. } => RemoteErrorKind::SessionMismatch,
            Error::SessionRunning(_) => RemoteErrorKind::SessionRunning,
            Error::Store(_) | Error::Database(_) => RemoteErrorKind::Storage,
            Error::Transport(_) => RemoteErrorKind::Transport,
            Error::Provider(_) | Error::Config(_) => RemoteErrorKind::ProviderUnavailable,
            _ => RemoteErrorKind::Internal,
        };
        RemoteError::new(kind, e.to_string())
    }
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        match e.kind {
            RemoteErrorKind::SessionNotFound => Error::SessionNotFound(e.message),
            RemoteErrorKind::SessionRunning => Error::SessionRunning(e.message),
            RemoteErrorKind::Transport => Error::Transport(e.message),
            _ => Error::Remote(e),
        }
    }
}

/// Application answer to a request.
pub type Reply = std::result::Result<Response, RemoteError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub session_id: String,
    pub trigger: Trigger,
    pub outcome: SessionOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiStatus {
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    Progress(Progress),
    Status(StatusEvent),
    AiStatus(AiStatus),
    Keepalive { session_id: String },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Progress(_) => "progress",
            Event::Status(_) => "status",
            Event::AiStatus(_) => "ai-status",
            Event::Keepalive { .. } => "keepalive",
        }
    }
}

enum Message {
    Request {
        request: Request,
        reply: oneshot::Sender<Reply>,
    },
    Event(Event),
}

struct Envelope {
    from: ContextId,
    to: ContextId,
    message: Message,
}

// ============================================
// Delivery
// ============================================

/// Transport-level result of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// The receiver answered; the reply may itself be an error
    Responded(Reply),
    /// Delivered, but no answer arrived before the deadline
    NoResponse,
    /// No live mailbox for the target context
    Undeliverable(String),
}

impl Delivery {
    pub fn is_transport_failure(&self) -> bool {
        !matches!(self, Delivery::Responded(_))
    }

    /// Lift transport failures into [`Error::Transport`], keeping the reply.
    pub fn into_reply(self) -> crate::error::Result<Reply> {
        match self {
            Delivery::Responded(reply) => Ok(reply),
            Delivery::NoResponse => Err(Error::Transport("no response".to_string())),
            Delivery::Undeliverable(reason) => Err(Error::Transport(reason)),
        }
    }

    /// Flatten into a single result; remote errors become [`Error`].
    pub fn into_result(self) -> crate::error::Result<Response> {
        self.into_reply()?.map_err(Error::from)
    }
}

// ============================================
// Bus
// ============================================

struct BusInner {
    routes: RwLock<HashMap<ContextId, mpsc::Sender<Envelope>>>,
    capacity: usize,
    request_timeout: Duration,
}

/// Routing table from context id to mailbox.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new(config: &BusConfig) -> Self {
        Self::with_settings(config.mailbox_capacity, config.request_timeout())
    }

    pub fn with_settings(capacity: usize, request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                routes: RwLock::new(HashMap::new()),
                capacity: capacity.max(1),
                request_timeout,
            }),
        }
    }

    /// Open the mailbox for `ctx`, replacing any previous one.
    pub fn attach(&self, ctx: ContextId) -> Mailbox {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let mut routes = self
            .inner
            .routes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if routes.insert(ctx, tx).is_some() {
            tracing::debug!(context = %ctx, "Replaced existing mailbox");
        }
        Mailbox { ctx, rx }
    }

    /// Remove the route for `ctx`; later sends to it are undeliverable.
    pub fn detach(&self, ctx: ContextId) {
        self.inner
            .routes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&ctx);
    }

    pub fn is_attached(&self, ctx: ContextId) -> bool {
        self.route(ctx).is_some_and(|tx| !tx.is_closed())
    }

    /// Sending handle that stamps `from` on every envelope.
    pub fn endpoint(&self, from: ContextId) -> Endpoint {
        Endpoint {
            bus: self.clone(),
            from,
        }
    }

    fn route(&self, ctx: ContextId) -> Option<mpsc::Sender<Envelope>> {
        self.inner
            .routes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&ctx)
            .cloned()
    }
}

/// Sending side of one context.
#[derive(Clone)]
pub struct Endpoint {
    bus: Bus,
    from: ContextId,
}

impl Endpoint {
    pub fn id(&self) -> ContextId {
        self.from
    }

    /// Send a request and wait for the reply or the bus timeout.
    pub async fn request(&self, to: ContextId, request: Request) -> Delivery {
        let name = request.name();
        let Some(tx) = self.bus.route(to) else {
            tracing::debug!(from = %self.from, to = %to, request = name, "No mailbox attached");
            return Delivery::Undeliverable(format!("no {to} context attached"));
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            from: self.from,
            to,
            message: Message::Request {
                request,
                reply: reply_tx,
            },
        };

        let exchange = async {
            if tx.send(envelope).await.is_err() {
                return Delivery::Undeliverable(format!("{to} mailbox closed"));
            }
            match reply_rx.await {
                Ok(reply) => Delivery::Responded(reply),
                Err(_) => Delivery::NoResponse,
            }
        };

        match tokio::time::timeout(self.bus.inner.request_timeout, exchange).await {
            Ok(delivery) => delivery,
            Err(_) => {
                tracing::debug!(from = %self.from, to = %to, request = name, "Request timed out");
                Delivery::NoResponse
            }
        }
    }

    /// Queue an event without waiting.
    ///
    /// Returns false when nobody listens or the mailbox is full; the event is
    /// dropped in that case.
    pub fn emit(&self, to: ContextId, event: Event) -> bool {
        let Some(tx) = self.bus.route(to) else {
            tracing::trace!(from = %self.from, to = %to, event = event.name(), "Event dropped, no listener");
            return false;
        };
        let name = event.name();
        let envelope = Envelope {
            from: self.from,
            to,
            message: Message::Event(event),
        };
        match tx.try_send(envelope) {
            Ok(()) => true,
            Err(e) => {
                tracing::trace!(from = %self.from, to = %to, event = name, error = %e, "Event dropped");
                false
            }
        }
    }
}

/// Replies to exactly one request.
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<Reply>,
}

impl Responder {
    /// Returns false when the requester stopped waiting.
    pub fn respond(self, reply: Reply) -> bool {
        self.tx.send(reply).is_ok()
    }
}

/// Something taken out of a mailbox.
#[derive(Debug)]
pub enum Incoming {
    Request {
        from: ContextId,
        request: Request,
        responder: Responder,
    },
    Event {
        from: ContextId,
        event: Event,
    },
}

/// Receiving side of one context.
pub struct Mailbox {
    ctx: ContextId,
    rx: mpsc::Receiver<Envelope>,
}

impl Mailbox {
    pub fn id(&self) -> ContextId {
        self.ctx
    }

    /// Next envelope addressed to this context; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Incoming> {
        loop {
            let envelope = self.rx.recv().await?;
            if envelope.to != self.ctx {
                tracing::trace!(context = %self.ctx, to = %envelope.to, "Ignoring misaddressed envelope");
                continue;
            }
            return Some(match envelope.message {
                Message::Request { request, reply } => Incoming::Request {
                    from: envelope.from,
                    request,
                    responder: Responder { tx: reply },
                },
                Message::Event(event) => Incoming::Event {
                    from: envelope.from,
                    event,
                },
            });
        }
    }
}
