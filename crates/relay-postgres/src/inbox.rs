//! Inbox store.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use relay_core::message::{validate_key, validate_topic};
use relay_core::{
    BackoffPolicy, Delivery, Error, FailKind, InboxMessage, InboxStatus, InboxStore,
    NewInboxMessage, OwnerToken, QueueCounts, Result, WorkItemId, WorkQueue,
};

use crate::{duration_millis, storage};

const CLEANUP_BATCH: i64 = 500;

/// One database's inbox.
#[derive(Clone)]
pub struct PgInbox {
    pool: PgPool,
    identifier: String,
    backoff: BackoffPolicy,
}

impl PgInbox {
    pub fn new(pool: PgPool, identifier: impl Into<String>) -> Self {
        Self {
            pool,
            identifier: identifier.into(),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<InboxMessage> {
    let status: String = row.try_get("status").map_err(Error::from)?;
    Ok(InboxMessage {
        work_item_id: WorkItemId::from_uuid(row.try_get("work_item_id").map_err(Error::from)?),
        source: row.try_get("source").map_err(Error::from)?,
        external_id: row.try_get("external_id").map_err(Error::from)?,
        topic: row.try_get("topic").map_err(Error::from)?,
        payload: row.try_get("payload").map_err(Error::from)?,
        hash: row.try_get("hash").map_err(Error::from)?,
        status: InboxStatus::from_str(&status)?,
        first_seen_at: row.try_get("first_seen_at").map_err(Error::from)?,
        last_seen_at: row.try_get("last_seen_at").map_err(Error::from)?,
        processed_at: row.try_get("processed_at").map_err(Error::from)?,
        due_at: row.try_get("due_at").map_err(Error::from)?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(Error::from)?,
        attempts: row.try_get("attempts").map_err(Error::from)?,
        last_error: row.try_get("last_error").map_err(Error::from)?,
        locked_until: row.try_get("locked_until").map_err(Error::from)?,
        owner: row
            .try_get::<Option<Uuid>, _>("owner_token")
            .map_err(Error::from)?
            .map(OwnerToken::from_uuid),
    })
}

const SELECT_COLUMNS: &str = "source, external_id, work_item_id, topic, payload, hash, status, \
     first_seen_at, last_seen_at, processed_at, due_at, next_attempt_at, attempts, last_error, \
     locked_until, owner_token";

fn ids_as_uuids(ids: &[WorkItemId]) -> Vec<Uuid> {
    ids.iter().map(|id| id.as_uuid()).collect()
}

#[async_trait]
impl WorkQueue for PgInbox {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn claim(
        &self,
        owner: OwnerToken,
        lease: Duration,
        batch_size: usize,
    ) -> Result<Vec<Delivery>> {
        if lease.is_zero() {
            return Err(Error::invalid("claim lease must be positive"));
        }
        if batch_size == 0 {
            return Err(Error::invalid("claim batch size must be positive"));
        }

        let rows = sqlx::query(
            r#"
            WITH picked AS (
              SELECT work_item_id
              FROM relay_inbox
              WHERE status = 'seen'
                AND (locked_until IS NULL OR locked_until <= now())
                AND (due_at IS NULL OR due_at <= now())
                AND next_attempt_at <= now()
              ORDER BY last_seen_at
              LIMIT $1
              FOR UPDATE SKIP LOCKED
            )
            UPDATE relay_inbox AS i
            SET status = 'processing',
                owner_token = $2,
                locked_until = now() + ($3::text || ' milliseconds')::interval
            FROM picked
            WHERE i.work_item_id = picked.work_item_id
            RETURNING i.work_item_id, i.source, i.external_id, i.topic, i.payload, i.attempts
            "#,
        )
        .bind(batch_size.min(i64::MAX as usize) as i64)
        .bind(owner.as_uuid())
        .bind(duration_millis(lease))
        .fetch_all(&self.pool)
        .await
        .map_err(|err| storage(err, "claim inbox batch"))?;

        let mut deliveries = Vec::with_capacity(rows.len());
        for row in rows {
            deliveries.push(Delivery {
                work_item_id: WorkItemId::from_uuid(
                    row.try_get("work_item_id").map_err(Error::from)?,
                ),
                message_id: None,
                source: Some(row.try_get("source").map_err(Error::from)?),
                external_id: Some(row.try_get("external_id").map_err(Error::from)?),
                topic: row.try_get("topic").map_err(Error::from)?,
                payload: row.try_get("payload").map_err(Error::from)?,
                correlation_id: None,
                attempt: row.try_get("attempts").map_err(Error::from)?,
            });
        }
        Ok(deliveries)
    }

    async fn ack(&self, owner: OwnerToken, ids: &[WorkItemId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE relay_inbox
            SET status = 'done',
                locked_until = NULL,
                owner_token = NULL,
                processed_at = now()
            WHERE work_item_id = ANY($1)
              AND status = 'processing'
              AND owner_token = $2
            "#,
        )
        .bind(ids_as_uuids(ids))
        .bind(owner.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|err| storage(err, "ack inbox rows"))?;
        Ok(())
    }

    async fn abandon(
        &self,
        owner: OwnerToken,
        ids: &[WorkItemId],
        last_error: Option<&str>,
        delay: Option<Duration>,
    ) -> Result<()> {
        if delay.is_some_and(|d| d.is_zero()) {
            return Err(Error::invalid("abandon delay must be positive"));
        }
        if ids.is_empty() {
            return Ok(());
        }

        let last_error = last_error.unwrap_or_default();

        if let Some(delay) = delay {
            sqlx::query(
                r#"
                UPDATE relay_inbox
                SET status = 'seen',
                    locked_until = NULL,
                    owner_token = NULL,
                    attempts = attempts + 1,
                    last_error = COALESCE(NULLIF($3, ''), last_error),
                    next_attempt_at = now() + ($4::text || ' milliseconds')::interval
                WHERE work_item_id = ANY($1)
                  AND status = 'processing'
                  AND owner_token = $2
                "#,
            )
            .bind(ids_as_uuids(ids))
            .bind(owner.as_uuid())
            .bind(last_error)
            .bind(duration_millis(delay))
            .execute(&self.pool)
            .await
            .map_err(|err| storage(err, "abandon inbox rows"))?;
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| storage(err, "begin abandon tx"))?;
        for id in ids {
            let row = sqlx::query(
                r#"
                UPDATE relay_inbox
                SET status = 'seen',
                    locked_until = NULL,
                    owner_token = NULL,
                    attempts = attempts + 1,
                    last_error = COALESCE(NULLIF($3, ''), last_error)
                WHERE work_item_id = $1
                  AND status = 'processing'
                  AND owner_token = $2
                RETURNING attempts
                "#,
            )
            .bind(id.as_uuid())
            .bind(owner.as_uuid())
            .bind(last_error)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|err| storage(err, "abandon inbox row"))?;

            let Some(row) = row else {
                continue;
            };
            let attempts: i32 = row.try_get("attempts").map_err(Error::from)?;
            let delay = self.backoff.delay(attempts.max(0) as u32);
            sqlx::query(
                r#"
                UPDATE relay_inbox
                SET next_attempt_at = now() + ($2::text || ' milliseconds')::interval
                WHERE work_item_id = $1
                "#,
            )
            .bind(id.as_uuid())
            .bind(duration_millis(delay))
            .execute(&mut *tx)
            .await
            .map_err(|err| storage(err, "schedule inbox retry"))?;
        }
        tx.commit()
            .await
            .map_err(|err| storage(err, "commit abandon"))?;
        Ok(())
    }

    async fn fail(
        &self,
        owner: OwnerToken,
        ids: &[WorkItemId],
        error: &str,
        kind: FailKind,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE relay_inbox
            SET status = 'dead',
                locked_until = NULL,
                owner_token = NULL,
                attempts = attempts + CASE WHEN $4 THEN 1 ELSE 0 END,
                last_error = $3
            WHERE work_item_id = ANY($1)
              AND status = 'processing'
              AND owner_token = $2
            "#,
        )
        .bind(ids_as_uuids(ids))
        .bind(owner.as_uuid())
        .bind(error)
        .bind(kind == FailKind::Exhausted)
        .execute(&self.pool)
        .await
        .map_err(|err| storage(err, "fail inbox rows"))?;
        Ok(())
    }

    async fn reap_expired(&self) -> Result<u64> {
        let done = sqlx::query(
            r#"
            UPDATE relay_inbox
            SET status = 'seen',
                locked_until = NULL,
                owner_token = NULL
            WHERE status = 'processing'
              AND locked_until IS NOT NULL
              AND locked_until <= now()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|err| storage(err, "reap expired inbox leases"))?;
        Ok(done.rows_affected())
    }
}

fn validate_natural_key(msg: &NewInboxMessage) -> Result<()> {
    validate_key("source", &msg.source)?;
    validate_key("external id", &msg.external_id)?;
    Ok(())
}

#[async_trait]
impl InboxStore for PgInbox {
    async fn enqueue(&self, msg: NewInboxMessage) -> Result<WorkItemId> {
        validate_natural_key(&msg)?;
        validate_topic(&msg.topic)?;

        // Upsert on the natural key. Redeliveries refresh the mutable
        // columns only while the row is pre-terminal; a done row is never
        // resurrected and a dead row waits for an explicit revive.
        let row = sqlx::query(
            r#"
            INSERT INTO relay_inbox (
              source, external_id, work_item_id, topic, payload, hash, due_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (source, external_id) DO UPDATE
            SET last_seen_at = now(),
                topic = CASE WHEN relay_inbox.status IN ('seen', 'processing')
                             THEN EXCLUDED.topic ELSE relay_inbox.topic END,
                payload = CASE WHEN relay_inbox.status IN ('seen', 'processing')
                               THEN EXCLUDED.payload ELSE relay_inbox.payload END,
                hash = CASE WHEN relay_inbox.status IN ('seen', 'processing')
                            THEN EXCLUDED.hash ELSE relay_inbox.hash END,
                due_at = CASE WHEN relay_inbox.status IN ('seen', 'processing')
                              THEN EXCLUDED.due_at ELSE relay_inbox.due_at END
            RETURNING work_item_id
            "#,
        )
        .bind(&msg.source)
        .bind(&msg.external_id)
        .bind(WorkItemId::random().as_uuid())
        .bind(&msg.topic)
        .bind(&msg.payload)
        .bind(msg.hash.as_deref())
        .bind(msg.due_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| storage(err, "upsert inbox row"))?;

        Ok(WorkItemId::from_uuid(
            row.try_get("work_item_id").map_err(Error::from)?,
        ))
    }

    async fn already_processed(
        &self,
        source: &str,
        external_id: &str,
        hash: Option<&str>,
    ) -> Result<bool> {
        validate_key("source", source)?;
        validate_key("external id", external_id)?;

        // Record the contact and read the row's standing in one statement.
        let row = sqlx::query(
            r#"
            INSERT INTO relay_inbox (source, external_id, work_item_id, topic, payload, hash)
            VALUES ($1, $2, $3, '', '', $4)
            ON CONFLICT (source, external_id) DO UPDATE
            SET last_seen_at = now()
            RETURNING status, hash
            "#,
        )
        .bind(source)
        .bind(external_id)
        .bind(WorkItemId::random().as_uuid())
        .bind(hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| storage(err, "record inbox contact"))?;

        let status: String = row.try_get("status").map_err(Error::from)?;
        let stored_hash: Option<String> = row.try_get("hash").map_err(Error::from)?;

        if let (Some(seen), Some(stored)) = (hash, stored_hash.as_deref()) {
            if seen != stored {
                tracing::warn!(
                    event = "relay.inbox.hash_mismatch",
                    store = %self.identifier,
                    source = %source,
                    external_id = %external_id,
                    "redelivered message content differs from the stored digest"
                );
            }
        }

        Ok(InboxStatus::from_str(&status)? == InboxStatus::Done)
    }

    async fn get(&self, source: &str, external_id: &str) -> Result<Option<InboxMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM relay_inbox WHERE source = $1 AND external_id = $2"
        ))
        .bind(source)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| storage(err, "select inbox row"))?;
        row.as_ref().map(row_to_message).transpose()
    }

    async fn revive(&self, source: &str, external_id: &str) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE relay_inbox
            SET status = 'seen',
                locked_until = NULL,
                owner_token = NULL,
                next_attempt_at = now()
            WHERE source = $1
              AND external_id = $2
              AND status = 'dead'
            "#,
        )
        .bind(source)
        .bind(external_id)
        .execute(&self.pool)
        .await
        .map_err(|err| storage(err, "revive inbox row"))?;
        Ok(done.rows_affected() > 0)
    }

    async fn cleanup(&self, retention: Duration) -> Result<u64> {
        let mut total = 0u64;
        loop {
            let done = sqlx::query(
                r#"
                DELETE FROM relay_inbox
                WHERE work_item_id IN (
                  SELECT work_item_id
                  FROM relay_inbox
                  WHERE status = 'done'
                    AND processed_at < now() - ($1::text || ' milliseconds')::interval
                  LIMIT $2
                )
                "#,
            )
            .bind(duration_millis(retention))
            .bind(CLEANUP_BATCH)
            .execute(&self.pool)
            .await
            .map_err(|err| storage(err, "cleanup inbox rows"))?;
            total += done.rows_affected();
            if (done.rows_affected() as i64) < CLEANUP_BATCH {
                return Ok(total);
            }
        }
    }

    async fn dead(&self, limit: usize) -> Result<Vec<InboxMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM relay_inbox WHERE status = 'dead' \
             ORDER BY first_seen_at LIMIT $1"
        ))
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| storage(err, "select dead inbox rows"))?;
        rows.iter().map(row_to_message).collect()
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let rows = sqlx::query("SELECT status, count(*) AS n FROM relay_inbox GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|err| storage(err, "count inbox rows"))?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(Error::from)?;
            let n: i64 = row.try_get("n").map_err(Error::from)?;
            let n = n.max(0) as u64;
            match InboxStatus::from_str(&status)? {
                InboxStatus::Seen => counts.pending += n,
                InboxStatus::Processing => counts.in_flight += n,
                InboxStatus::Done => counts.done += n,
                InboxStatus::Dead => counts.dead += n,
            }
        }
        Ok(counts)
    }
}
