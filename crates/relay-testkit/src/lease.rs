//! In-process fenced leases on tokio's clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use relay_core::{Error, Lease, LeaseFactory, OwnerToken, Result};

struct LeaseRow {
    owner: OwnerToken,
    fencing: i64,
    expires_at: Instant,
}

type LeaseTable = Arc<Mutex<HashMap<String, LeaseRow>>>;

fn lock(table: &LeaseTable) -> MutexGuard<'_, HashMap<String, LeaseRow>> {
    table
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Issues fenced leases out of a process-local table. Semantics mirror the
/// Postgres factory: expired rows are stolen, fencing tokens only grow, the
/// loss token fires on expiry.
#[derive(Clone, Default)]
pub struct MemLeaseFactory {
    table: LeaseTable,
}

impl MemLeaseFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemLease {
    table: LeaseTable,
    resource: String,
    owner: OwnerToken,
    duration: Duration,
    fencing: AtomicI64,
    expires_at: Arc<Mutex<Instant>>,
    lost: CancellationToken,
    watchdog: JoinHandle<()>,
}

impl Drop for MemLease {
    fn drop(&mut self) {
        self.watchdog.abort();
    }
}

async fn watchdog(expires_at: Arc<Mutex<Instant>>, lost: CancellationToken) {
    loop {
        let deadline = *expires_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if Instant::now() >= deadline {
            lost.cancel();
            return;
        }
        tokio::select! {
            _ = lost.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }
}

#[async_trait]
impl Lease for MemLease {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn owner(&self) -> OwnerToken {
        self.owner
    }

    fn fencing_token(&self) -> i64 {
        self.fencing.load(Ordering::Acquire)
    }

    fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    fn ensure_held(&self) -> Result<()> {
        if self.is_lost() {
            return Err(Error::LeaseLost(self.resource.clone()));
        }
        Ok(())
    }

    fn lost_token(&self) -> CancellationToken {
        self.lost.clone()
    }

    async fn renew(&self) -> Result<bool> {
        if self.is_lost() {
            return Ok(false);
        }
        let mut table = lock(&self.table);
        let now = Instant::now();
        match table.get_mut(&self.resource) {
            Some(row) if row.owner == self.owner && row.expires_at > now => {
                row.fencing += 1;
                row.expires_at = now + self.duration;
                self.fencing.store(row.fencing, Ordering::Release);
                *self
                    .expires_at
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = row.expires_at;
                Ok(true)
            }
            _ => {
                self.lost.cancel();
                Ok(false)
            }
        }
    }

    async fn release(&self) -> Result<()> {
        // Expire in place rather than remove: the row carries the fencing
        // counter, which must keep growing across owners.
        let mut table = lock(&self.table);
        if let Some(row) = table
            .get_mut(&self.resource)
            .filter(|row| row.owner == self.owner)
        {
            row.expires_at = Instant::now();
        }
        self.lost.cancel();
        Ok(())
    }
}

#[async_trait]
impl LeaseFactory for MemLeaseFactory {
    async fn acquire(
        &self,
        resource: &str,
        duration: Duration,
        owner: Option<OwnerToken>,
    ) -> Result<Option<Box<dyn Lease>>> {
        if resource.is_empty() {
            return Err(Error::invalid("lease resource must not be empty"));
        }
        if duration.is_zero() {
            return Err(Error::invalid("lease duration must be positive"));
        }

        let owner = owner.unwrap_or_else(OwnerToken::random);
        let now = Instant::now();
        let expires_at = now + duration;

        let fencing = {
            let mut table = lock(&self.table);
            match table.get_mut(resource) {
                Some(row) if row.expires_at > now && row.owner != owner => return Ok(None),
                Some(row) => {
                    row.owner = owner;
                    row.fencing += 1;
                    row.expires_at = expires_at;
                    row.fencing
                }
                None => {
                    table.insert(
                        resource.to_string(),
                        LeaseRow {
                            owner,
                            fencing: 1,
                            expires_at,
                        },
                    );
                    1
                }
            }
        };

        let expires = Arc::new(Mutex::new(expires_at));
        let lost = CancellationToken::new();
        let handle = tokio::spawn(watchdog(expires.clone(), lost.clone()));

        Ok(Some(Box::new(MemLease {
            table: self.table.clone(),
            resource: resource.to_string(),
            owner,
            duration,
            fencing: AtomicI64::new(fencing),
            expires_at: expires,
            lost,
            watchdog: handle,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn contention_and_steal_after_expiry() {
        let factory = MemLeaseFactory::new();
        let held = factory
            .acquire("outbox-processing", Duration::from_secs(5), None)
            .await
            .unwrap()
            .expect("first acquire succeeds");
        assert_eq!(held.fencing_token(), 1);

        // Live lease blocks other owners.
        assert!(factory
            .acquire("outbox-processing", Duration::from_secs(5), None)
            .await
            .unwrap()
            .is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        let stolen = factory
            .acquire("outbox-processing", Duration::from_secs(5), None)
            .await
            .unwrap()
            .expect("expired lease is stolen");
        assert!(stolen.fencing_token() > held.fencing_token());
    }

    #[tokio::test(start_paused = true)]
    async fn renew_extends_and_bumps_fencing() {
        let factory = MemLeaseFactory::new();
        let lease = factory
            .acquire("r", Duration::from_secs(5), None)
            .await
            .unwrap()
            .unwrap();
        let before = lease.fencing_token();

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(lease.renew().await.unwrap());
        assert!(lease.fencing_token() > before);

        // The renewal pushed expiry out past the original deadline.
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!lease.is_lost());
        lease.ensure_held().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_fires_the_loss_token() {
        let factory = MemLeaseFactory::new();
        let lease = factory
            .acquire("r", Duration::from_millis(100), None)
            .await
            .unwrap()
            .unwrap();
        let lost = lease.lost_token();

        tokio::time::timeout(Duration::from_secs(1), lost.cancelled())
            .await
            .expect("loss token fires at expiry");
        assert!(lease.is_lost());
        assert!(lease.ensure_held().is_err());
        assert!(!lease.renew().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn release_frees_the_resource() {
        let factory = MemLeaseFactory::new();
        let lease = factory
            .acquire("r", Duration::from_secs(30), None)
            .await
            .unwrap()
            .unwrap();
        lease.release().await.unwrap();

        // The fencing counter survives the release.
        let next = factory
            .acquire("r", Duration::from_secs(30), None)
            .await
            .unwrap()
            .expect("released resource is acquirable");
        assert!(next.fencing_token() > lease.fencing_token());
    }
}
