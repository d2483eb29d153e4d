//! In-memory Relay stores for tests.
//!
//! [`MemStore`] keeps one database's outbox, inbox and join tables behind a
//! single mutex, which gives the same atomic coupling between outbox
//! transitions and join counters that the Postgres store gets from a
//! transaction. A controllable clock offset ([`MemStore::advance`]) lets
//! tests step over backoff delays and lease expiries without sleeping.
//!
//! [`MemLeaseFactory`] mirrors the fenced-lease semantics of the Postgres
//! factory on tokio's clock, so lease expiry tests can run under paused
//! time.

mod lease;
mod store;

pub use lease::MemLeaseFactory;
pub use store::{MemInbox, MemJoinStore, MemOutbox, MemStore};
