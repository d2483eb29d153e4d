//! Per-store batch dispatch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use relay_core::{
    BackoffPolicy, Delivery, FailKind, HandlerError, OwnerToken, Result, WorkQueue,
};

use crate::registry::HandlerRegistry;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Rows claimed per batch.
    pub batch_size: usize,
    /// How long a claimed row stays reserved before the reaper may recover
    /// it. Independent of the per-store dispatch lease.
    pub claim_lease: Duration,
    /// A message is failed terminally once this many attempts have errored.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            claim_lease: Duration::from_secs(30),
            max_attempts: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Default)]
struct DispatchStats {
    sent: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

/// Point-in-time view of a dispatcher's outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSnapshot {
    pub sent: u64,
    pub failed: u64,
    pub retried: u64,
}

/// Claims batches from a store and runs the registered handlers.
///
/// Per message: resolve the handler by topic (an unroutable topic is failed,
/// not retried; a registration gap does not heal with time), invoke it, and
/// map the outcome onto ack / abandon-with-backoff / fail. Cancellation is
/// honored between messages; an in-flight handler sees the token and is
/// expected to cooperate.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    cfg: DispatchConfig,
    owner: OwnerToken,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, cfg: DispatchConfig) -> Self {
        Self {
            registry,
            cfg,
            owner: OwnerToken::random(),
            stats: DispatchStats::default(),
        }
    }

    pub fn owner(&self) -> OwnerToken {
        self.owner
    }

    pub fn stats(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            sent: self.stats.sent.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
        }
    }

    /// Claim and process one batch. Returns the number of rows claimed,
    /// which the drain-first strategy uses to decide whether to stay on
    /// this store.
    pub async fn run_once(
        &self,
        queue: &dyn WorkQueue,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let deliveries = queue
            .claim(self.owner, self.cfg.claim_lease, self.cfg.batch_size)
            .await?;
        let claimed = deliveries.len();

        for delivery in &deliveries {
            if cancel.is_cancelled() {
                // Undecided rows keep their claim lease and come back via
                // the reaper.
                break;
            }
            self.dispatch_one(queue, delivery, cancel).await?;
        }
        Ok(claimed)
    }

    async fn dispatch_one(
        &self,
        queue: &dyn WorkQueue,
        delivery: &Delivery,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let store = queue.identifier();
        let started = Instant::now();

        let Some(handler) = self.registry.get(&delivery.topic) else {
            let error = format!("no handler registered for topic {:?}", delivery.topic);
            queue
                .fail(self.owner, &[delivery.work_item_id], &error, FailKind::Permanent)
                .await?;
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                event = "relay.dispatch.unroutable",
                store = %store,
                work_item_id = %delivery.work_item_id,
                topic = %delivery.topic,
                "no handler for topic; message failed"
            );
            return Ok(());
        };

        match handler.handle(delivery, cancel).await {
            Ok(()) => {
                queue.ack(self.owner, &[delivery.work_item_id]).await?;
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    event = "relay.dispatch.sent",
                    store = %store,
                    work_item_id = %delivery.work_item_id,
                    topic = %delivery.topic,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "message handled"
                );
            }
            Err(HandlerError::Permanent(err)) => {
                let error = format!("permanent failure: {err:#}");
                queue
                    .fail(self.owner, &[delivery.work_item_id], &error, FailKind::Permanent)
                    .await?;
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    event = "relay.dispatch.failed",
                    store = %store,
                    work_item_id = %delivery.work_item_id,
                    topic = %delivery.topic,
                    error = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "handler declared permanent failure"
                );
            }
            Err(err) => {
                // Transient, including JoinNotReady and honored cancellation.
                let attempt = delivery.attempt.max(0) as u32 + 1;
                let error = err.to_string();
                if attempt >= self.cfg.max_attempts {
                    queue
                        .fail(self.owner, &[delivery.work_item_id], &error, FailKind::Exhausted)
                        .await?;
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        event = "relay.dispatch.exhausted",
                        store = %store,
                        work_item_id = %delivery.work_item_id,
                        topic = %delivery.topic,
                        attempt,
                        error = %error,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "retries exhausted; message failed"
                    );
                } else {
                    let delay = self.cfg.backoff.delay(attempt);
                    queue
                        .abandon(
                            self.owner,
                            &[delivery.work_item_id],
                            Some(&error),
                            Some(delay),
                        )
                        .await?;
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        event = "relay.dispatch.retry",
                        store = %store,
                        work_item_id = %delivery.work_item_id,
                        topic = %delivery.topic,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "handler errored; rescheduled"
                    );
                }
            }
        }
        Ok(())
    }
}
