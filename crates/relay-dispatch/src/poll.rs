//! The polling loop.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::coordinator::Coordinator;

pub struct PollingConfig {
    /// Tick cadence, driven by the monotonic clock so wall-clock jumps do
    /// not alter it.
    pub interval: Duration,
    /// Extra pause after a failed tick.
    pub error_backoff: Duration,
    /// Optional schema-ready gate: the first tick waits until this signal
    /// turns true (e.g. after migrations have been deployed).
    pub ready: Option<watch::Receiver<bool>>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
            error_backoff: Duration::from_secs(1),
            ready: None,
        }
    }
}

/// Drive coordinator ticks until `cancel` fires.
///
/// Tick errors are logged and the loop continues after a short backoff;
/// cancellation exits cleanly.
pub async fn run_polling_loop(
    mut coordinator: Coordinator,
    cfg: PollingConfig,
    cancel: CancellationToken,
) {
    if let Some(mut ready) = cfg.ready {
        loop {
            if *ready.borrow() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = ready.changed() => {
                    if changed.is_err() {
                        // Gate sender dropped without ever signalling; poll
                        // anyway rather than hang forever.
                        tracing::warn!(
                            event = "relay.poll.ready_gate.dropped",
                            "schema-ready gate dropped; starting to poll"
                        );
                        break;
                    }
                }
            }
        }
    }

    let mut interval = tokio::time::interval(cfg.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        if let Err(err) = coordinator.tick(&cancel).await {
            tracing::warn!(
                event = "relay.poll.tick.error",
                error = %err,
                "tick failed"
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(cfg.error_backoff) => {}
            }
        }
    }
}
