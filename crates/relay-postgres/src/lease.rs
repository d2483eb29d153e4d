//! Fenced leases backed by a lease table.
//!
//! One row per resource. Acquire is a conditional upsert that steals the
//! row only when the previous lease has expired (or the caller already owns
//! it); every successful acquire or renew bumps the row's fencing token. A
//! per-lease watchdog task polls expiry so the loss token fires promptly
//! even when the holder never touches the lease again.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use relay_core::{Error, Lease, LeaseFactory, OwnerToken, Result};

use crate::{duration_millis, storage};

const MIN_WATCHDOG_SLEEP: Duration = Duration::from_millis(10);

/// Issues leases out of one database's `relay_lease` table.
#[derive(Clone)]
pub struct PgLeaseFactory {
    pool: PgPool,
    watchdog_interval: Duration,
}

impl PgLeaseFactory {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            watchdog_interval: Duration::from_secs(1),
        }
    }

    /// How often held leases re-check their expiry. Bounds how late the
    /// loss token can fire.
    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }
}

struct LeaseShared {
    pool: PgPool,
    resource: String,
    owner: OwnerToken,
    duration_ms: i64,
    fencing: AtomicI64,
    expires_at: Mutex<DateTime<Utc>>,
    lost: CancellationToken,
}

impl LeaseShared {
    fn expires_at(&self) -> DateTime<Utc> {
        *self
            .expires_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_expires_at(&self, at: DateTime<Utc>) {
        *self
            .expires_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = at;
    }
}

pub struct PgLease {
    shared: Arc<LeaseShared>,
    watchdog: JoinHandle<()>,
}

impl Drop for PgLease {
    fn drop(&mut self) {
        self.watchdog.abort();
    }
}

async fn watchdog(shared: Arc<LeaseShared>, interval: Duration) {
    loop {
        let now = Utc::now();
        let expires = shared.expires_at();
        if now >= expires {
            shared.lost.cancel();
            return;
        }
        let remaining = (expires - now).to_std().unwrap_or(Duration::ZERO);
        let sleep_for = remaining.min(interval).max(MIN_WATCHDOG_SLEEP);
        tokio::select! {
            _ = shared.lost.cancelled() => return,
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
}

#[async_trait]
impl Lease for PgLease {
    fn resource(&self) -> &str {
        &self.shared.resource
    }

    fn owner(&self) -> OwnerToken {
        self.shared.owner
    }

    fn fencing_token(&self) -> i64 {
        self.shared.fencing.load(Ordering::Acquire)
    }

    fn is_lost(&self) -> bool {
        self.shared.lost.is_cancelled()
    }

    fn ensure_held(&self) -> Result<()> {
        if self.is_lost() {
            return Err(Error::LeaseLost(self.shared.resource.clone()));
        }
        Ok(())
    }

    fn lost_token(&self) -> CancellationToken {
        self.shared.lost.clone()
    }

    async fn renew(&self) -> Result<bool> {
        if self.is_lost() {
            return Ok(false);
        }
        let row = sqlx::query(
            r#"
            UPDATE relay_lease
            SET fencing_token = fencing_token + 1,
                expires_at = now() + ($3::text || ' milliseconds')::interval
            WHERE resource = $1
              AND owner_token = $2
              AND expires_at > now()
            RETURNING fencing_token, expires_at
            "#,
        )
        .bind(&self.shared.resource)
        .bind(self.shared.owner.as_uuid())
        .bind(self.shared.duration_ms)
        .fetch_optional(&self.shared.pool)
        .await
        .map_err(|err| storage(err, "renew lease"))?;

        let Some(row) = row else {
            // Someone else holds (or stole) the resource.
            self.shared.lost.cancel();
            return Ok(false);
        };

        let fencing: i64 = row.try_get("fencing_token").map_err(Error::from)?;
        let expires_at: DateTime<Utc> = row.try_get("expires_at").map_err(Error::from)?;
        self.shared.fencing.store(fencing, Ordering::Release);
        self.shared.set_expires_at(expires_at);
        Ok(true)
    }

    async fn release(&self) -> Result<()> {
        // Expire in place rather than delete: the row carries the fencing
        // counter, which must keep growing across owners.
        sqlx::query(
            r#"
            UPDATE relay_lease
            SET expires_at = now()
            WHERE resource = $1
              AND owner_token = $2
            "#,
        )
        .bind(&self.shared.resource)
        .bind(self.shared.owner.as_uuid())
        .execute(&self.shared.pool)
        .await
        .map_err(|err| storage(err, "release lease"))?;
        self.shared.lost.cancel();
        Ok(())
    }
}

#[async_trait]
impl LeaseFactory for PgLeaseFactory {
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
        let duration_ms = duration_millis(duration);

        let row = sqlx::query(
            r#"
            INSERT INTO relay_lease (resource, owner_token, fencing_token, expires_at)
            VALUES ($1, $2, 1, now() + ($3::text || ' milliseconds')::interval)
            ON CONFLICT (resource) DO UPDATE
            SET owner_token = EXCLUDED.owner_token,
                fencing_token = relay_lease.fencing_token + 1,
                expires_at = EXCLUDED.expires_at,
                acquired_at = now()
            WHERE relay_lease.expires_at <= now()
               OR relay_lease.owner_token = EXCLUDED.owner_token
            RETURNING fencing_token, expires_at
            "#,
        )
        .bind(resource)
        .bind(owner.as_uuid())
        .bind(duration_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| storage(err, "acquire lease"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let fencing: i64 = row.try_get("fencing_token").map_err(Error::from)?;
        let expires_at: DateTime<Utc> = row.try_get("expires_at").map_err(Error::from)?;

        let shared = Arc::new(LeaseShared {
            pool: self.pool.clone(),
            resource: resource.to_string(),
            owner,
            duration_ms,
            fencing: AtomicI64::new(fencing),
            expires_at: Mutex::new(expires_at),
            lost: CancellationToken::new(),
        });
        let handle = tokio::spawn(watchdog(shared.clone(), self.watchdog_interval));

        Ok(Some(Box::new(PgLease {
            shared,
            watchdog: handle,
        })))
    }
}
