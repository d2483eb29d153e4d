//! Fan-in coordination ("joins").
//!
//! A join tracks a fixed number of expected steps. Members are outbox
//! messages referenced by logical [`MessageId`]; when the outbox acks or
//! fails a member message, the store advances the join counters in the same
//! transaction. A message on the reserved [`JOIN_WAIT_TOPIC`] inspects the
//! join and emits continuation messages once every step has settled.
//!
//! Joins reference messages by logical id only; there is no foreign key
//! from the outbox back to joins, keeping the outbox join-agnostic.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::{JoinId, MessageId};
use crate::message::MAX_KEY_LEN;
use crate::store::{Enqueued, NewOutboxMessage, OutboxStore};

/// Reserved topic consumed by the join-wait handler. No other topic is
/// interpreted by the substrate.
pub const JOIN_WAIT_TOPIC: &str = "join.wait";

/// Join lifecycle: `Pending` until every expected step settles, then one of
/// the terminal states. Terminal joins are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl JoinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for JoinStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JoinStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::invalid(format!("unknown join status {other:?}"))),
        }
    }
}

/// A fan-in coordination record.
#[derive(Debug, Clone)]
pub struct JoinRecord {
    pub join_id: JoinId,
    /// Optional scoping string, at most 255 characters.
    pub grouping_key: Option<String>,
    pub expected_steps: i32,
    pub completed_steps: i32,
    pub failed_steps: i32,
    pub status: JoinStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Opaque caller blob.
    pub metadata: Option<String>,
}

impl JoinRecord {
    /// Every expected step has reported a terminal outcome.
    pub fn all_steps_settled(&self) -> bool {
        self.completed_steps + self.failed_steps >= self.expected_steps
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Membership of one message in one join. `completed_at` and `failed_at`
/// are mutually exclusive and transition at most once.
#[derive(Debug, Clone)]
pub struct JoinMember {
    pub join_id: JoinId,
    pub message_id: MessageId,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Join persistence for one database.
#[async_trait]
pub trait JoinStore: Send + Sync {
    /// Create a `Pending` join expecting `expected_steps ≥ 1` members.
    /// An empty `grouping_key` is normalized to absent.
    async fn create_join(
        &self,
        grouping_key: Option<&str>,
        expected_steps: i32,
        metadata: Option<&str>,
    ) -> Result<JoinId>;

    /// Idempotently record `(join_id, message_id)` membership. Counters are
    /// untouched. Unknown `join_id` is an error.
    async fn attach_member(&self, join_id: JoinId, message_id: MessageId) -> Result<()>;

    async fn get_join(&self, join_id: JoinId) -> Result<Option<JoinRecord>>;

    async fn members(&self, join_id: JoinId) -> Result<Vec<JoinMember>>;

    /// Mark every still-unsettled member row referencing `message_id` as
    /// completed and advance the parent counters, at most once per member.
    /// The outbox invokes the same logic inside its ack transaction; this
    /// entry point exists for out-of-band settlement.
    async fn mark_completed(&self, message_id: MessageId) -> Result<()>;

    /// Counterpart of [`mark_completed`](Self::mark_completed) for failure.
    async fn mark_failed(&self, message_id: MessageId) -> Result<()>;

    /// Write a terminal status. A no-op when the join is already terminal;
    /// terminal joins never change again.
    async fn update_status(&self, join_id: JoinId, status: JoinStatus) -> Result<()>;
}

/// Wire payload of a [`JOIN_WAIT_TOPIC`] message.
///
/// Encoded as JSON with camelCase names so any platform on the bus can
/// round-trip it. Either continuation pair may be absent, in which case
/// nothing is emitted for that outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinWaitCommand {
    pub join_id: JoinId,
    pub fail_if_any_step_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete_payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail_payload: Option<String>,
}

impl JoinWaitCommand {
    pub fn new(join_id: JoinId, fail_if_any_step_failed: bool) -> Self {
        Self {
            join_id,
            fail_if_any_step_failed,
            on_complete_topic: None,
            on_complete_payload: None,
            on_fail_topic: None,
            on_fail_payload: None,
        }
    }

    pub fn on_complete(mut self, topic: impl Into<String>, payload: impl Into<String>) -> Self {
        self.on_complete_topic = Some(topic.into());
        self.on_complete_payload = Some(payload.into());
        self
    }

    pub fn on_fail(mut self, topic: impl Into<String>, payload: impl Into<String>) -> Self {
        self.on_fail_topic = Some(topic.into());
        self.on_fail_payload = Some(payload.into());
        self
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|err| Error::Storage(anyhow::anyhow!("encode join.wait payload: {err}")))
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|err| Error::invalid(format!("malformed join.wait payload: {err}")))
    }
}

/// Producer-facing fan-in API over one store's outbox and join tables.
#[derive(Clone)]
pub struct JoinApi {
    outbox: Arc<dyn OutboxStore>,
    joins: Arc<dyn JoinStore>,
}

impl JoinApi {
    pub fn new(outbox: Arc<dyn OutboxStore>, joins: Arc<dyn JoinStore>) -> Self {
        Self { outbox, joins }
    }

    pub async fn start_join(
        &self,
        grouping_key: Option<&str>,
        expected_steps: i32,
        metadata: Option<&str>,
    ) -> Result<JoinId> {
        if grouping_key.is_some_and(|key| key.len() > MAX_KEY_LEN) {
            return Err(Error::invalid(format!(
                "grouping key exceeds {MAX_KEY_LEN} characters"
            )));
        }
        self.joins
            .create_join(grouping_key, expected_steps, metadata)
            .await
    }

    pub async fn attach_message(&self, join_id: JoinId, message_id: MessageId) -> Result<()> {
        self.joins.attach_member(join_id, message_id).await
    }

    /// Enqueue the wait message that fires once every step of the join has
    /// settled.
    pub async fn enqueue_join_wait(&self, command: JoinWaitCommand) -> Result<Enqueued> {
        let payload = command.to_json()?;
        self.outbox
            .enqueue(NewOutboxMessage::new(JOIN_WAIT_TOPIC, payload))
            .await
    }
}
