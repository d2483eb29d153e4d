//! Multi-store coordination.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use relay_core::{Lease, LeaseFactory, Result, WorkQueue};

use crate::dispatcher::Dispatcher;
use crate::selection::SelectionStrategy;

/// Supplies the current store list. Pluggable so hosts can discover tenant
/// databases however they like; the coordinator just snapshots the list at
/// every tick.
pub trait StoreProvider: Send + Sync {
    fn stores(&self) -> Vec<Arc<dyn WorkQueue>>;
}

/// A fixed store list.
pub struct FixedStores(pub Vec<Arc<dyn WorkQueue>>);

impl StoreProvider for FixedStores {
    fn stores(&self) -> Vec<Arc<dyn WorkQueue>> {
        self.0.clone()
    }
}

/// Maps a store identifier to the lease factory guarding it.
pub trait LeaseRouter: Send + Sync {
    fn factory(&self, store: &str) -> Option<Arc<dyn LeaseFactory>>;
}

impl LeaseRouter for HashMap<String, Arc<dyn LeaseFactory>> {
    fn factory(&self, store: &str) -> Option<Arc<dyn LeaseFactory>> {
        self.get(store).cloned()
    }
}

/// Routes every store to one shared factory.
pub struct SharedLeaseFactory(pub Arc<dyn LeaseFactory>);

impl LeaseRouter for SharedLeaseFactory {
    fn factory(&self, _store: &str) -> Option<Arc<dyn LeaseFactory>> {
        Some(self.0.clone())
    }
}

/// Which queue a coordinator services; decides the dispatch lease name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Outbox,
    Inbox,
}

impl QueueKind {
    pub fn lease_name(&self) -> &'static str {
        match self {
            Self::Outbox => "outbox-processing",
            Self::Inbox => "inbox-processing",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub kind: QueueKind,
    /// Duration of the per-store dispatch lease. Bounds how long one worker
    /// monopolizes a store; independent of the claim lease on rows.
    pub dispatch_lease: Duration,
}

impl CoordinatorConfig {
    pub fn new(kind: QueueKind) -> Self {
        Self {
            kind,
            dispatch_lease: Duration::from_secs(30),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No stores available.
    Idle,
    /// The selected store's dispatch lease was held elsewhere.
    Skipped { store: String },
    Dispatched { store: String, count: usize },
}

/// Walks the store list, serializing per-store dispatch through leases.
///
/// Each tick snapshots the store list, lets the [`SelectionStrategy`] pick
/// one store, takes that store's dispatch lease (skips the store when the
/// lease is contended; proceeds leaseless with a warning when no factory is
/// registered for it), and runs one dispatcher batch under a cancellation
/// scope that is torn down if the outer token fires or the lease is lost.
/// The lease is always released, also on errors.
pub struct Coordinator {
    provider: Arc<dyn StoreProvider>,
    strategy: SelectionStrategy,
    lease_router: Option<Arc<dyn LeaseRouter>>,
    dispatcher: Dispatcher,
    cfg: CoordinatorConfig,
    last: Option<(String, usize)>,
}

impl Coordinator {
    pub fn new(
        provider: Arc<dyn StoreProvider>,
        strategy: SelectionStrategy,
        dispatcher: Dispatcher,
        cfg: CoordinatorConfig,
    ) -> Self {
        Self {
            provider,
            strategy,
            lease_router: None,
            dispatcher,
            cfg,
            last: None,
        }
    }

    pub fn with_lease_router(mut self, router: Arc<dyn LeaseRouter>) -> Self {
        self.lease_router = Some(router);
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn tick(&mut self, cancel: &CancellationToken) -> Result<TickOutcome> {
        let stores = self.provider.stores();
        if stores.is_empty() {
            return Ok(TickOutcome::Idle);
        }

        let last = self
            .last
            .as_ref()
            .map(|(store, count)| (store.as_str(), *count));
        let index = self.strategy.select(&stores, last);
        let store = stores[index].clone();
        let store_id = store.identifier().to_string();

        let lease = match self.acquire_dispatch_lease(&store_id).await? {
            LeaseOutcome::Acquired(lease) => Some(lease),
            LeaseOutcome::NoFactory => None,
            LeaseOutcome::Contended => {
                self.last = Some((store_id.clone(), 0));
                return Ok(TickOutcome::Skipped { store: store_id });
            }
        };

        let count = dispatch_scoped(&self.dispatcher, store.as_ref(), lease, cancel).await?;
        self.last = Some((store_id.clone(), count));
        Ok(TickOutcome::Dispatched {
            store: store_id,
            count,
        })
    }

    async fn acquire_dispatch_lease(&self, store_id: &str) -> Result<LeaseOutcome> {
        let Some(router) = &self.lease_router else {
            return Ok(LeaseOutcome::NoFactory);
        };
        let Some(factory) = router.factory(store_id) else {
            tracing::warn!(
                event = "relay.coordinator.lease_missing",
                store = %store_id,
                "no lease factory registered for store; dispatching without a lease"
            );
            return Ok(LeaseOutcome::NoFactory);
        };
        match factory
            .acquire(self.cfg.kind.lease_name(), self.cfg.dispatch_lease, None)
            .await?
        {
            Some(lease) => Ok(LeaseOutcome::Acquired(lease)),
            None => Ok(LeaseOutcome::Contended),
        }
    }
}

enum LeaseOutcome {
    Acquired(Box<dyn Lease>),
    NoFactory,
    Contended,
}

/// Run one dispatcher batch under a scope cancelled by either the outer
/// token or the loss of `lease`. The lease is released on every path.
pub(crate) async fn dispatch_scoped(
    dispatcher: &Dispatcher,
    store: &dyn WorkQueue,
    lease: Option<Box<dyn Lease>>,
    cancel: &CancellationToken,
) -> Result<usize> {
    let scope = cancel.child_token();
    let linker = lease.as_ref().map(|lease| {
        let lost = lease.lost_token();
        let scope = scope.clone();
        tokio::spawn(async move {
            lost.cancelled().await;
            scope.cancel();
        })
    });

    let result = dispatcher.run_once(store, &scope).await;

    if let Some(linker) = linker {
        linker.abort();
    }
    if let Some(lease) = lease {
        if let Err(err) = lease.release().await {
            tracing::warn!(
                event = "relay.coordinator.lease_release.error",
                store = %store.identifier(),
                error = %err,
                "failed to release dispatch lease"
            );
        }
    }

    result
}
