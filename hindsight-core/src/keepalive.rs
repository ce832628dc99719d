//! Liveness pings from the worker while a session runs.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{ContextId, Endpoint, Event};

/// Emit `keepalive` to `to` every `interval` until `stop` fires.
///
/// Undelivered pings are logged at debug level and otherwise ignored.
pub fn spawn_keepalive(
    endpoint: Endpoint,
    to: ContextId,
    interval: Duration,
    session_id: String,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // first tick completes immediately
        ticker.tick().await;
        let mut sequence: u64 = 0;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    sequence += 1;
                    let delivered = endpoint.emit(
                        to,
                        Event::Keepalive {
                            session_id: session_id.clone(),
                        },
                    );
                    if !delivered {
                        tracing::debug!(session_id = %session_id, sequence, "Keepalive not delivered");
                    }
                }
            }
        }
        tracing::trace!(session_id = %session_id, pings = sequence, "Keepalive stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, Incoming};

    #[tokio::test(start_paused = true)]
    async fn test_pings_until_stopped() {
        let bus = Bus::with_settings(16, Duration::from_secs(1));
        let mut mailbox = bus.attach(ContextId::Coordinator);
        let stop = CancellationToken::new();
        let handle = spawn_keepalive(
            bus.endpoint(ContextId::Worker),
            ContextId::Coordinator,
            Duration::from_secs(20),
            "s1".to_string(),
            stop.clone(),
        );

        for _ in 0..2 {
            match mailbox.recv().await {
                Some(Incoming::Event {
                    event: Event::Keepalive { session_id },
                    from,
                }) => {
                    assert_eq!(session_id, "s1");
                    assert_eq!(from, ContextId::Worker);
                }
                other => panic!("expected keepalive, got {other:?}"),
            }
        }

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_listener_does_not_stop_pings() {
        let bus = Bus::with_settings(4, Duration::from_secs(1));
        let stop = CancellationToken::new();
        let handle = spawn_keepalive(
            bus.endpoint(ContextId::Worker),
            ContextId::Coordinator,
            Duration::from_secs(1),
            "s1".to_string(),
            stop.clone(),
        );
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!handle.is_finished());
        stop.cancel();
        handle.await.unwrap();
    }
}
