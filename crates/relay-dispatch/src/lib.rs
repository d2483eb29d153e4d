//! Dispatch machinery for the Relay substrate.
//!
//! A [`Dispatcher`] claims batches from one store and runs the registered
//! handlers; the [`Coordinator`] spreads a dispatcher's attention across
//! many stores under per-store dispatch leases; [`run_polling_loop`] drives
//! ticks on a monotonic cadence. The [`JoinWaitHandler`] services the
//! reserved `join.wait` topic.

pub mod coordinator;
pub mod dispatcher;
pub mod global;
pub mod join_wait;
pub mod poll;
pub mod registry;
pub mod router;
pub mod selection;

pub use coordinator::{
    Coordinator, CoordinatorConfig, FixedStores, LeaseRouter, QueueKind, SharedLeaseFactory,
    StoreProvider, TickOutcome,
};
pub use dispatcher::{DispatchConfig, DispatchSnapshot, Dispatcher};
pub use global::{GlobalDispatcher, GLOBAL_DISPATCH_LEASE};
pub use join_wait::JoinWaitHandler;
pub use poll::{run_polling_loop, PollingConfig};
pub use registry::{HandlerRegistry, HandlerRegistryBuilder};
pub use router::StoreRouter;
pub use selection::SelectionStrategy;
