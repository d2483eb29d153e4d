//! Join store.
//!
//! Counter updates are guarded twice: a member is only stamped while both
//! of its outcome timestamps are null, and the parent counter only moves
//! while `completed_steps + failed_steps < expected_steps`. Together that
//! makes each member worth at most one increment, no matter how often a
//! settlement is replayed.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use relay_core::message::MAX_KEY_LEN;
use relay_core::{
    Error, JoinId, JoinMember, JoinRecord, JoinStatus, JoinStore, MessageId, Result,
};

use crate::{foreign_key_violation, storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemberOutcome {
    Completed,
    Failed,
}

/// Settle every still-pending member row for the given logical message ids
/// and advance the parent counters, inside the caller's transaction.
///
/// The outbox calls this from its ack/fail transaction; the standalone
/// [`PgJoinStore::mark_completed`]/[`PgJoinStore::mark_failed`] wrap it in
/// their own.
pub(crate) async fn mark_members(
    tx: &mut Transaction<'_, Postgres>,
    message_ids: &[Uuid],
    outcome: MemberOutcome,
) -> Result<()> {
    for message_id in message_ids {
        let members = match outcome {
            MemberOutcome::Completed => {
                sqlx::query(
                    r#"
                    UPDATE relay_join_member
                    SET completed_at = now()
                    WHERE message_id = $1
                      AND completed_at IS NULL
                      AND failed_at IS NULL
                    RETURNING join_id
                    "#,
                )
                .bind(message_id)
                .fetch_all(&mut **tx)
                .await
            }
            MemberOutcome::Failed => {
                sqlx::query(
                    r#"
                    UPDATE relay_join_member
                    SET failed_at = now()
                    WHERE message_id = $1
                      AND completed_at IS NULL
                      AND failed_at IS NULL
                    RETURNING join_id
                    "#,
                )
                .bind(message_id)
                .fetch_all(&mut **tx)
                .await
            }
        }
        .map_err(|err| storage(err, "settle join members"))?;

        for member in members {
            let join_id: Uuid = member.try_get("join_id").map_err(Error::from)?;
            let update = match outcome {
                MemberOutcome::Completed => {
                    r#"
                    UPDATE relay_join
                    SET completed_steps = completed_steps + 1,
                        last_updated_at = now()
                    WHERE join_id = $1
                      AND completed_steps + failed_steps < expected_steps
                    "#
                }
                MemberOutcome::Failed => {
                    r#"
                    UPDATE relay_join
                    SET failed_steps = failed_steps + 1,
                        last_updated_at = now()
                    WHERE join_id = $1
                      AND completed_steps + failed_steps < expected_steps
                    "#
                }
            };
            sqlx::query(update)
                .bind(join_id)
                .execute(&mut **tx)
                .await
                .map_err(|err| storage(err, "advance join counters"))?;
        }
    }
    Ok(())
}

/// One database's join tables.
#[derive(Clone)]
pub struct PgJoinStore {
    pool: PgPool,
}

impl PgJoinStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn mark(&self, message_id: MessageId, outcome: MemberOutcome) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| storage(err, "begin join mark tx"))?;
        mark_members(&mut tx, &[message_id.as_uuid()], outcome).await?;
        tx.commit()
            .await
            .map_err(|err| storage(err, "commit join mark"))?;
        Ok(())
    }
}

fn row_to_join(row: &sqlx::postgres::PgRow) -> Result<JoinRecord> {
    let status: String = row.try_get("status").map_err(Error::from)?;
    Ok(JoinRecord {
        join_id: JoinId::from_uuid(row.try_get("join_id").map_err(Error::from)?),
        grouping_key: row.try_get("grouping_key").map_err(Error::from)?,
        expected_steps: row.try_get("expected_steps").map_err(Error::from)?,
        completed_steps: row.try_get("completed_steps").map_err(Error::from)?,
        failed_steps: row.try_get("failed_steps").map_err(Error::from)?,
        status: JoinStatus::from_str(&status)?,
        created_at: row.try_get("created_at").map_err(Error::from)?,
        last_updated_at: row.try_get("last_updated_at").map_err(Error::from)?,
        metadata: row.try_get("metadata").map_err(Error::from)?,
    })
}

#[async_trait]
impl JoinStore for PgJoinStore {
    async fn create_join(
        &self,
        grouping_key: Option<&str>,
        expected_steps: i32,
        metadata: Option<&str>,
    ) -> Result<JoinId> {
        if expected_steps <= 0 {
            return Err(Error::invalid("expected steps must be at least 1"));
        }
        let grouping_key = grouping_key.filter(|k| !k.is_empty());
        if grouping_key.is_some_and(|k| k.len() > MAX_KEY_LEN) {
            return Err(Error::invalid(format!(
                "grouping key exceeds {MAX_KEY_LEN} characters"
            )));
        }

        let join_id = JoinId::random();
        sqlx::query(
            r#"
            INSERT INTO relay_join (join_id, grouping_key, expected_steps, metadata)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(join_id.as_uuid())
        .bind(grouping_key)
        .bind(expected_steps)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .map_err(|err| storage(err, "insert join"))?;
        Ok(join_id)
    }

    async fn attach_member(&self, join_id: JoinId, message_id: MessageId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO relay_join_member (join_id, message_id)
            VALUES ($1, $2)
            ON CONFLICT (join_id, message_id) DO NOTHING
            "#,
        )
        .bind(join_id.as_uuid())
        .bind(message_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if foreign_key_violation(&err) {
                Error::not_found(format!("join {join_id} does not exist"))
            } else {
                storage(err, "insert join member")
            }
        })?;
        Ok(())
    }

    async fn get_join(&self, join_id: JoinId) -> Result<Option<JoinRecord>> {
        let row = sqlx::query(
            r#"
            SELECT join_id, grouping_key, expected_steps, completed_steps, failed_steps,
                   status, created_at, last_updated_at, metadata
            FROM relay_join
            WHERE join_id = $1
            "#,
        )
        .bind(join_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| storage(err, "select join"))?;
        row.as_ref().map(row_to_join).transpose()
    }

    async fn members(&self, join_id: JoinId) -> Result<Vec<JoinMember>> {
        let rows = sqlx::query(
            r#"
            SELECT join_id, message_id, completed_at, failed_at, created_at
            FROM relay_join_member
            WHERE join_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(join_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|err| storage(err, "select join members"))?;

        rows.iter()
            .map(|row| {
                Ok(JoinMember {
                    join_id: JoinId::from_uuid(row.try_get("join_id").map_err(Error::from)?),
                    message_id: MessageId::from_uuid(
                        row.try_get("message_id").map_err(Error::from)?,
                    ),
                    completed_at: row.try_get("completed_at").map_err(Error::from)?,
                    failed_at: row.try_get("failed_at").map_err(Error::from)?,
                    created_at: row.try_get("created_at").map_err(Error::from)?,
                })
            })
            .collect()
    }

    async fn mark_completed(&self, message_id: MessageId) -> Result<()> {
        self.mark(message_id, MemberOutcome::Completed).await
    }

    async fn mark_failed(&self, message_id: MessageId) -> Result<()> {
        self.mark(message_id, MemberOutcome::Failed).await
    }

    async fn update_status(&self, join_id: JoinId, status: JoinStatus) -> Result<()> {
        // Terminal joins are immutable; the pending guard makes replays
        // no-ops instead of overwrites.
        sqlx::query(
            r#"
            UPDATE relay_join
            SET status = $2,
                last_updated_at = now()
            WHERE join_id = $1
              AND status = 'pending'
            "#,
        )
        .bind(join_id.as_uuid())
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|err| storage(err, "update join status"))?;
        Ok(())
    }
}
