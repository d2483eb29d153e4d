//! Queue row models and status state machines.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::ids::{MessageId, OwnerToken, WorkItemId};

/// Longest accepted topic.
pub const MAX_TOPIC_LEN: usize = 255;

/// Longest accepted inbox `source` / `external_id` and join grouping key.
pub const MAX_KEY_LEN: usize = 255;

/// Outbox row lifecycle: `Ready → InProgress → Done | Failed`, with
/// `InProgress → Ready` on abandon or lease reap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboxStatus {
    Ready,
    InProgress,
    Done,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Self::Ready),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(Error::invalid(format!("unknown outbox status {other:?}"))),
        }
    }
}

/// Inbox row lifecycle: `Seen → Processing → Done | Dead`, with
/// `Dead → Seen` only via explicit revive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboxStatus {
    Seen,
    Processing,
    Done,
    Dead,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seen => "seen",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Dead)
    }
}

impl fmt::Display for InboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InboxStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seen" => Ok(Self::Seen),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "dead" => Ok(Self::Dead),
            other => Err(Error::invalid(format!("unknown inbox status {other:?}"))),
        }
    }
}

/// A durable outgoing message.
#[derive(Debug, Clone)]
pub struct OutboxMessage {
    pub work_item_id: WorkItemId,
    pub message_id: MessageId,
    pub topic: String,
    pub payload: String,
    pub correlation_id: Option<String>,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    /// Row is ineligible for claim until this passes.
    pub due_at: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub owner: Option<OwnerToken>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<String>,
}

impl OutboxMessage {
    pub fn delivery(&self) -> Delivery {
        Delivery {
            work_item_id: self.work_item_id,
            message_id: Some(self.message_id),
            source: None,
            external_id: None,
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            correlation_id: self.correlation_id.clone(),
            attempt: self.retry_count,
        }
    }
}

/// A deduplicated incoming message.
///
/// The natural key is `(source, external_id)`. Rows additionally carry a
/// surrogate [`WorkItemId`], assigned at first contact and stable across
/// upserts, so the claim/ack surface is uniform across both queues.
#[derive(Debug, Clone)]
pub struct InboxMessage {
    pub work_item_id: WorkItemId,
    pub source: String,
    pub external_id: String,
    pub topic: String,
    pub payload: String,
    /// Optional content digest, used to flag divergent redeliveries.
    pub hash: Option<String>,
    pub status: InboxStatus,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub owner: Option<OwnerToken>,
}

impl InboxMessage {
    pub fn delivery(&self) -> Delivery {
        Delivery {
            work_item_id: self.work_item_id,
            message_id: None,
            source: Some(self.source.clone()),
            external_id: Some(self.external_id.clone()),
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            correlation_id: None,
            attempt: self.attempts,
        }
    }
}

/// A claimed row as handed to handlers.
///
/// Outbox deliveries carry a `message_id`; inbox deliveries carry
/// `(source, external_id)`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub work_item_id: WorkItemId,
    pub message_id: Option<MessageId>,
    pub source: Option<String>,
    pub external_id: Option<String>,
    pub topic: String,
    pub payload: String,
    pub correlation_id: Option<String>,
    /// Failed attempts recorded before this delivery (0 on first).
    pub attempt: i32,
}

/// Empty optional strings are normalized to absent.
pub fn normalize_opt(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

pub fn validate_topic(topic: &str) -> Result<(), Error> {
    if topic.is_empty() {
        return Err(Error::invalid("topic must not be empty"));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(Error::invalid(format!(
            "topic exceeds {MAX_TOPIC_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_key(name: &str, value: &str) -> Result<(), Error> {
    if value.is_empty() {
        return Err(Error::invalid(format!("{name} must not be empty")));
    }
    if value.len() > MAX_KEY_LEN {
        return Err(Error::invalid(format!(
            "{name} exceeds {MAX_KEY_LEN} characters"
        )));
    }
    Ok(())
}
