//! Outbox store.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use relay_core::message::{normalize_opt, validate_topic};
use relay_core::{
    BackoffPolicy, Delivery, Enqueued, Error, FailKind, MessageId, NewOutboxMessage, OutboxMessage,
    OutboxStatus, OutboxStore, OwnerToken, QueueCounts, Result, WorkItemId, WorkQueue,
};

use crate::join::{mark_members, MemberOutcome};
use crate::{duration_millis, storage};

const CLEANUP_BATCH: i64 = 500;

/// One database's outbox.
#[derive(Clone)]
pub struct PgOutbox {
    pool: PgPool,
    identifier: String,
    backoff: BackoffPolicy,
}

impl PgOutbox {
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

    /// Insert a new `Ready` row inside the caller's open transaction, so the
    /// message commits (or rolls back) together with the business write.
    /// The store neither commits nor rolls back.
    pub async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        msg: NewOutboxMessage,
    ) -> Result<Enqueued> {
        let insert = validate_new(msg)?;
        insert_row(&mut **tx, &insert).await?;
        Ok(insert.enqueued())
    }
}

struct ValidatedInsert {
    work_item_id: WorkItemId,
    message_id: MessageId,
    msg: NewOutboxMessage,
}

impl ValidatedInsert {
    fn enqueued(&self) -> Enqueued {
        Enqueued {
            work_item_id: self.work_item_id,
            message_id: self.message_id,
        }
    }
}

fn validate_new(mut msg: NewOutboxMessage) -> Result<ValidatedInsert> {
    validate_topic(&msg.topic)?;
    msg.correlation_id = normalize_opt(msg.correlation_id.take());
    Ok(ValidatedInsert {
        work_item_id: WorkItemId::random(),
        message_id: msg.message_id.unwrap_or_else(MessageId::random),
        msg,
    })
}

async fn insert_row<'e, E>(executor: E, insert: &ValidatedInsert) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO relay_outbox (
          work_item_id, message_id, topic, payload, correlation_id, due_at
        ) VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(insert.work_item_id.as_uuid())
    .bind(insert.message_id.as_uuid())
    .bind(&insert.msg.topic)
    .bind(&insert.msg.payload)
    .bind(insert.msg.correlation_id.as_deref())
    .bind(insert.msg.due_at)
    .execute(executor)
    .await
    .map_err(|err| storage(err, "insert outbox row"))?;
    Ok(())
}

fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<OutboxMessage> {
    let status: String = row.try_get("status").map_err(Error::from)?;
    Ok(OutboxMessage {
        work_item_id: WorkItemId::from_uuid(row.try_get("work_item_id").map_err(Error::from)?),
        message_id: MessageId::from_uuid(row.try_get("message_id").map_err(Error::from)?),
        topic: row.try_get("topic").map_err(Error::from)?,
        payload: row.try_get("payload").map_err(Error::from)?,
        correlation_id: row.try_get("correlation_id").map_err(Error::from)?,
        status: OutboxStatus::from_str(&status)?,
        created_at: row.try_get("created_at").map_err(Error::from)?,
        due_at: row.try_get("due_at").map_err(Error::from)?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(Error::from)?,
        locked_until: row.try_get("locked_until").map_err(Error::from)?,
        owner: row
            .try_get::<Option<Uuid>, _>("owner_token")
            .map_err(Error::from)?
            .map(OwnerToken::from_uuid),
        retry_count: row.try_get("retry_count").map_err(Error::from)?,
        last_error: row.try_get("last_error").map_err(Error::from)?,
        processed_at: row.try_get("processed_at").map_err(Error::from)?,
        processed_by: row.try_get("processed_by").map_err(Error::from)?,
    })
}

const SELECT_COLUMNS: &str = "work_item_id, message_id, topic, payload, correlation_id, status, \
     created_at, due_at, next_attempt_at, locked_until, owner_token, retry_count, last_error, \
     processed_at, processed_by";

fn ids_as_uuids(ids: &[WorkItemId]) -> Vec<Uuid> {
    ids.iter().map(|id| id.as_uuid()).collect()
}

#[async_trait]
impl WorkQueue for PgOutbox {
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
              FROM relay_outbox
              WHERE status = 'ready'
                AND (locked_until IS NULL OR locked_until <= now())
                AND (due_at IS NULL OR due_at <= now())
                AND next_attempt_at <= now()
              ORDER BY created_at
              LIMIT $1
              FOR UPDATE SKIP LOCKED
            )
            UPDATE relay_outbox AS o
            SET status = 'in_progress',
                owner_token = $2,
                locked_until = now() + ($3::text || ' milliseconds')::interval
            FROM picked
            WHERE o.work_item_id = picked.work_item_id
            RETURNING o.work_item_id, o.message_id, o.topic, o.payload, o.correlation_id,
                      o.retry_count
            "#,
        )
        .bind(batch_size.min(i64::MAX as usize) as i64)
        .bind(owner.as_uuid())
        .bind(duration_millis(lease))
        .fetch_all(&self.pool)
        .await
        .map_err(|err| storage(err, "claim outbox batch"))?;

        let mut deliveries = Vec::with_capacity(rows.len());
        for row in rows {
            deliveries.push(Delivery {
                work_item_id: WorkItemId::from_uuid(
                    row.try_get("work_item_id").map_err(Error::from)?,
                ),
                message_id: Some(MessageId::from_uuid(
                    row.try_get("message_id").map_err(Error::from)?,
                )),
                source: None,
                external_id: None,
                topic: row.try_get("topic").map_err(Error::from)?,
                payload: row.try_get("payload").map_err(Error::from)?,
                correlation_id: row.try_get("correlation_id").map_err(Error::from)?,
                attempt: row.try_get("retry_count").map_err(Error::from)?,
            });
        }
        Ok(deliveries)
    }

    async fn ack(&self, owner: OwnerToken, ids: &[WorkItemId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        // The join counter updates must commit with the row transition, so
        // an observer never sees a done row whose member is still pending.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| storage(err, "begin ack tx"))?;

        let rows = sqlx::query(
            r#"
            UPDATE relay_outbox
            SET status = 'done',
                locked_until = NULL,
                owner_token = NULL,
                processed_at = now(),
                processed_by = $3
            WHERE work_item_id = ANY($1)
              AND status = 'in_progress'
              AND owner_token = $2
            RETURNING message_id
            "#,
        )
        .bind(ids_as_uuids(ids))
        .bind(owner.as_uuid())
        .bind(owner.to_string())
        .fetch_all(&mut *tx)
        .await
        .map_err(|err| storage(err, "ack outbox rows"))?;

        let message_ids: Vec<Uuid> = rows
            .iter()
            .map(|row| row.try_get("message_id"))
            .collect::<std::result::Result<_, _>>()
            .map_err(Error::from)?;
        mark_members(&mut tx, &message_ids, MemberOutcome::Completed).await?;

        tx.commit().await.map_err(|err| storage(err, "commit ack"))?;
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
                UPDATE relay_outbox
                SET status = 'ready',
                    locked_until = NULL,
                    owner_token = NULL,
                    retry_count = retry_count + 1,
                    last_error = COALESCE(NULLIF($3, ''), last_error),
                    next_attempt_at = now() + ($4::text || ' milliseconds')::interval
                WHERE work_item_id = ANY($1)
                  AND status = 'in_progress'
                  AND owner_token = $2
                "#,
            )
            .bind(ids_as_uuids(ids))
            .bind(owner.as_uuid())
            .bind(last_error)
            .bind(duration_millis(delay))
            .execute(&self.pool)
            .await
            .map_err(|err| storage(err, "abandon outbox rows"))?;
            return Ok(());
        }

        // No explicit delay: the next attempt follows the store's backoff,
        // which depends on each row's attempt count.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| storage(err, "begin abandon tx"))?;
        for id in ids {
            let row = sqlx::query(
                r#"
                UPDATE relay_outbox
                SET status = 'ready',
                    locked_until = NULL,
                    owner_token = NULL,
                    retry_count = retry_count + 1,
                    last_error = COALESCE(NULLIF($3, ''), last_error)
                WHERE work_item_id = $1
                  AND status = 'in_progress'
                  AND owner_token = $2
                RETURNING retry_count
                "#,
            )
            .bind(id.as_uuid())
            .bind(owner.as_uuid())
            .bind(last_error)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|err| storage(err, "abandon outbox row"))?;

            let Some(row) = row else {
                continue;
            };
            let retry_count: i32 = row.try_get("retry_count").map_err(Error::from)?;
            let delay = self.backoff.delay(retry_count.max(0) as u32);
            sqlx::query(
                r#"
                UPDATE relay_outbox
                SET next_attempt_at = now() + ($2::text || ' milliseconds')::interval
                WHERE work_item_id = $1
                "#,
            )
            .bind(id.as_uuid())
            .bind(duration_millis(delay))
            .execute(&mut *tx)
            .await
            .map_err(|err| storage(err, "schedule outbox retry"))?;
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

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| storage(err, "begin fail tx"))?;

        let rows = sqlx::query(
            r#"
            UPDATE relay_outbox
            SET status = 'failed',
                locked_until = NULL,
                owner_token = NULL,
                retry_count = retry_count + CASE WHEN $4 THEN 1 ELSE 0 END,
                last_error = $3
            WHERE work_item_id = ANY($1)
              AND status = 'in_progress'
              AND owner_token = $2
            RETURNING message_id
            "#,
        )
        .bind(ids_as_uuids(ids))
        .bind(owner.as_uuid())
        .bind(error)
        .bind(kind == FailKind::Exhausted)
        .fetch_all(&mut *tx)
        .await
        .map_err(|err| storage(err, "fail outbox rows"))?;

        let message_ids: Vec<Uuid> = rows
            .iter()
            .map(|row| row.try_get("message_id"))
            .collect::<std::result::Result<_, _>>()
            .map_err(Error::from)?;
        mark_members(&mut tx, &message_ids, MemberOutcome::Failed).await?;

        tx.commit()
            .await
            .map_err(|err| storage(err, "commit fail"))?;
        Ok(())
    }

    async fn reap_expired(&self) -> Result<u64> {
        let done = sqlx::query(
            r#"
            UPDATE relay_outbox
            SET status = 'ready',
                locked_until = NULL,
                owner_token = NULL
            WHERE status = 'in_progress'
              AND locked_until IS NOT NULL
              AND locked_until <= now()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|err| storage(err, "reap expired outbox leases"))?;
        Ok(done.rows_affected())
    }
}

#[async_trait]
impl OutboxStore for PgOutbox {
    async fn enqueue(&self, msg: NewOutboxMessage) -> Result<Enqueued> {
        let insert = validate_new(msg)?;
        insert_row(&self.pool, &insert).await?;
        Ok(insert.enqueued())
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<OutboxMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM relay_outbox WHERE work_item_id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| storage(err, "select outbox row"))?;
        row.as_ref().map(row_to_message).transpose()
    }

    async fn find_by_message_id(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM relay_outbox WHERE message_id = $1 \
             ORDER BY created_at LIMIT 1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| storage(err, "select outbox row by message id"))?;
        row.as_ref().map(row_to_message).transpose()
    }

    async fn cleanup(&self, retention: Duration) -> Result<u64> {
        let mut total = 0u64;
        loop {
            let done = sqlx::query(
                r#"
                DELETE FROM relay_outbox
                WHERE work_item_id IN (
                  SELECT work_item_id
                  FROM relay_outbox
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
            .map_err(|err| storage(err, "cleanup outbox rows"))?;
            total += done.rows_affected();
            if (done.rows_affected() as i64) < CLEANUP_BATCH {
                return Ok(total);
            }
        }
    }

    async fn failed(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM relay_outbox WHERE status = 'failed' \
             ORDER BY created_at LIMIT $1"
        ))
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| storage(err, "select failed outbox rows"))?;
        rows.iter().map(row_to_message).collect()
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let rows = sqlx::query("SELECT status, count(*) AS n FROM relay_outbox GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|err| storage(err, "count outbox rows"))?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(Error::from)?;
            let n: i64 = row.try_get("n").map_err(Error::from)?;
            let n = n.max(0) as u64;
            match OutboxStatus::from_str(&status)? {
                OutboxStatus::Ready => counts.pending += n,
                OutboxStatus::InProgress => counts.in_flight += n,
                OutboxStatus::Done => counts.done += n,
                OutboxStatus::Failed => counts.dead += n,
            }
        }
        Ok(counts)
    }
}
