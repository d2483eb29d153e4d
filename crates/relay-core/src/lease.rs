//! Fenced, named, time-bounded exclusive leases.
//!
//! A lease serializes work on a named resource (e.g. one store's dispatch
//! loop) without blocking writers. Every successful acquire or renew bumps
//! a per-resource fencing token, a monotonically increasing sequence number
//! downstream state stores can key on to reject writes from stale owners.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::ids::OwnerToken;

/// A held lease.
///
/// Implementations watch expiry on a timer so [`lost_token`](Lease::lost_token)
/// fires promptly when the lease lapses, letting holders tear down work
/// scoped to it.
#[async_trait]
pub trait Lease: Send + Sync {
    fn resource(&self) -> &str;

    fn owner(&self) -> OwnerToken;

    /// Monotonically increasing per resource across owners.
    fn fencing_token(&self) -> i64;

    /// True once the lease has observably expired or been released.
    fn is_lost(&self) -> bool;

    /// Synchronous guard for critical sections.
    fn ensure_held(&self) -> Result<()>;

    /// Fires when the lease is observably lost.
    fn lost_token(&self) -> CancellationToken;

    /// Extend the lease. `Ok(true)` with a bumped fencing token while still
    /// the live owner; `Ok(false)` once the lease is gone.
    async fn renew(&self) -> Result<bool>;

    /// Release the lease iff still the owner.
    async fn release(&self) -> Result<()>;
}

/// Issues leases on named resources.
#[async_trait]
pub trait LeaseFactory: Send + Sync {
    /// Try to acquire `resource` for `duration`. Returns `None` while the
    /// resource is held by another live owner. `owner` defaults to a fresh
    /// random token; re-acquiring under the current owner extends the lease.
    async fn acquire(
        &self,
        resource: &str,
        duration: Duration,
        owner: Option<OwnerToken>,
    ) -> Result<Option<Box<dyn Lease>>>;
}
