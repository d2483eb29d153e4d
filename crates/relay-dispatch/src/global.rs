//! Control-plane dispatch.
//!
//! Some work does not belong to any tenant store; platform-wide messages
//! live in a single designated database. The global dispatcher services
//! that one store with the same dispatch logic as the coordinator, under
//! its own lease key.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use relay_core::{LeaseFactory, Result, WorkQueue};

use crate::coordinator::dispatch_scoped;
use crate::dispatcher::Dispatcher;

pub const GLOBAL_DISPATCH_LEASE: &str = "outbox-processing:global";

pub struct GlobalDispatcher {
    store: Arc<dyn WorkQueue>,
    lease_factory: Option<Arc<dyn LeaseFactory>>,
    dispatcher: Dispatcher,
    dispatch_lease: Duration,
}

impl GlobalDispatcher {
    pub fn new(store: Arc<dyn WorkQueue>, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            lease_factory: None,
            dispatcher,
            dispatch_lease: Duration::from_secs(30),
        }
    }

    pub fn with_lease_factory(mut self, factory: Arc<dyn LeaseFactory>) -> Self {
        self.lease_factory = Some(factory);
        self
    }

    pub fn with_dispatch_lease(mut self, duration: Duration) -> Self {
        self.dispatch_lease = duration;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Drive ticks on the polling cadence until `cancel` fires. Tick errors
    /// are logged and the loop continues.
    pub async fn run(&self, cfg: crate::poll::PollingConfig, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(cfg.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            if let Err(err) = self.tick(&cancel).await {
                tracing::warn!(
                    event = "relay.global.tick.error",
                    store = %self.store.identifier(),
                    error = %err,
                    "global dispatch tick failed"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(cfg.error_backoff) => {}
                }
            }
        }
    }

    /// Run one batch against the control-plane store. Returns the number of
    /// rows claimed; zero when the dispatch lease was held elsewhere.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<usize> {
        let lease = match &self.lease_factory {
            Some(factory) => {
                match factory
                    .acquire(GLOBAL_DISPATCH_LEASE, self.dispatch_lease, None)
                    .await?
                {
                    Some(lease) => Some(lease),
                    None => return Ok(0),
                }
            }
            None => None,
        };
        dispatch_scoped(&self.dispatcher, self.store.as_ref(), lease, cancel).await
    }
}
