//! Wiring for the three contexts
//!
//! [`Runtime::start`] attaches the coordinator, worker and UI mailboxes to one
//! [`Bus`] and spawns the coordinator and worker loops. The caller keeps the UI
//! [`Mailbox`] to observe events and talks to the coordinator through
//! [`Runtime::request`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{Bus, ContextId, Delivery, Endpoint, Mailbox, Request};
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::history::HistorySource;
use crate::provider::ProviderProbe;
use crate::scheduler::{Alarms, Schedule, TokioAlarms};
use crate::session::SessionRegistry;
use crate::store::KeyValueStore;
use crate::worker::WorkerContext;

/// Collaborators injected into a runtime.
pub struct Services {
    pub store: Arc<dyn KeyValueStore>,
    pub probe: ProviderProbe,
    pub history: Option<Arc<dyn HistorySource>>,
    /// Custom alarms and their firing channel; tokio timers when `None`
    pub alarms: Option<(Arc<dyn Alarms>, mpsc::Receiver<String>)>,
}

pub struct Runtime {
    bus: Bus,
    ui: Endpoint,
    coordinator: Coordinator,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Spawn coordinator and worker; returns the runtime and the UI mailbox.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(config: &Config, services: Services) -> Result<(Self, Mailbox)> {
        let bus = Bus::new(&config.bus);
        let coordinator_mailbox = bus.attach(ContextId::Coordinator);
        let worker_mailbox = bus.attach(ContextId::Worker);
        let ui_mailbox = bus.attach(ContextId::Ui);

        let (alarms, fired) = match services.alarms {
            Some((alarms, fired)) => (alarms, fired),
            None => {
                let (alarms, fired) = TokioAlarms::new();
                (Arc::new(alarms) as Arc<dyn Alarms>, fired)
            }
        };

        let schedule = Arc::new(Schedule::new(
            alarms,
            Arc::clone(&services.store),
            config.schedule.clone(),
        ));
        let scheduled = schedule.restore()?;

        let coordinator = Coordinator::new(
            bus.endpoint(ContextId::Coordinator),
            Arc::new(SessionRegistry::new()),
            Arc::clone(&services.store),
            schedule,
            services.history,
            config.analysis.lookback_hours,
            config.schedule.session_lease(),
        );

        let worker = WorkerContext::new(
            bus.endpoint(ContextId::Worker),
            services.probe,
            services.store,
            config.analysis.clone(),
            config.schedule.keepalive_interval(),
        );

        let shutdown = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(
                coordinator
                    .clone()
                    .serve(coordinator_mailbox, Some(fired), shutdown.clone()),
            ),
            tokio::spawn(worker.serve(worker_mailbox, shutdown.clone())),
        ];

        tracing::info!(scheduled, "Runtime started");

        Ok((
            Self {
                ui: bus.endpoint(ContextId::Ui),
                bus,
                coordinator,
                shutdown,
                tasks,
            },
            ui_mailbox,
        ))
    }

    /// Send a request from the UI surface to the coordinator.
    pub async fn request(&self, request: Request) -> Delivery {
        self.ui.request(ContextId::Coordinator, request).await
    }

    /// Direct handle for in-process callers (the daemon's scheduler hooks, tests).
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Stop both loops and wait for them. Later requests are undeliverable.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for ctx in [ContextId::Coordinator, ContextId::Worker, ContextId::Ui] {
            self.bus.detach(ctx);
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Context task ended abnormally");
            }
        }
        tracing::info!("Runtime stopped");
    }
}
