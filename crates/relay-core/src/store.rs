//! Store capability traits.
//!
//! A store encapsulates one database's worth of queue state. [`WorkQueue`]
//! is the dispatch-facing claim/ack surface shared by the outbox and the
//! inbox; [`OutboxStore`] and [`InboxStore`] add the producer operations.
//!
//! Every operation executes as a single atomic unit against the underlying
//! rows. Concurrent claimers must observe disjoint row sets; ack, abandon
//! and fail are fenced on the claiming [`OwnerToken`] and silently ignore
//! rows held by someone else.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::ids::{MessageId, OwnerToken, WorkItemId};
use crate::message::{Delivery, InboxMessage, OutboxMessage};

/// A new outgoing message.
#[derive(Debug, Clone, Default)]
pub struct NewOutboxMessage {
    /// Routing key, case-sensitive, at most 255 characters.
    pub topic: String,
    /// Opaque payload; may be empty.
    pub payload: String,
    /// Fixed logical id, e.g. when the message was attached to a join
    /// before being enqueued. Random when absent.
    pub message_id: Option<MessageId>,
    pub correlation_id: Option<String>,
    /// The row is ineligible for claim until this passes.
    pub due_at: Option<DateTime<Utc>>,
}

impl NewOutboxMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn due_at(mut self, at: DateTime<Utc>) -> Self {
        self.due_at = Some(at);
        self
    }
}

/// Identity of a freshly enqueued outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub work_item_id: WorkItemId,
    pub message_id: MessageId,
}

/// A new (or redelivered) incoming message.
#[derive(Debug, Clone, Default)]
pub struct NewInboxMessage {
    /// Originating system, at most 255 characters.
    pub source: String,
    /// Sender-assigned id, unique within `source`, at most 255 characters.
    pub external_id: String,
    pub topic: String,
    pub payload: String,
    /// Optional content digest for divergence detection.
    pub hash: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
}

impl NewInboxMessage {
    pub fn new(
        source: impl Into<String>,
        external_id: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            external_id: external_id.into(),
            topic: topic.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn due_at(mut self, at: DateTime<Utc>) -> Self {
        self.due_at = Some(at);
        self
    }
}

/// Why a message is being failed terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailKind {
    /// The handler declared the message unprocessable. The attempt counter
    /// is left untouched.
    Permanent,
    /// The retry budget ran out. The final attempt is recorded on the row.
    Exhausted,
}

/// Per-status row counts, for operators and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// `Ready` / `Seen`.
    pub pending: u64,
    /// `InProgress` / `Processing`.
    pub in_flight: u64,
    pub done: u64,
    /// `Failed` / `Dead`.
    pub dead: u64,
}

/// The dispatch-facing claim/ack surface of one queue in one database.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Human-readable identifier of the backing store, carried in log scopes
    /// and used to route dispatch leases.
    fn identifier(&self) -> &str;

    /// Atomically reserve up to `batch_size` eligible rows under `owner`
    /// with a lease of `lease`. Eligible means pending status, not leased,
    /// past `due_at` and past `next_attempt_at`; rows are taken oldest
    /// first. Concurrent claimers never receive overlapping sets and never
    /// block each other. An empty result is not an error.
    async fn claim(
        &self,
        owner: OwnerToken,
        lease: Duration,
        batch_size: usize,
    ) -> Result<Vec<Delivery>>;

    /// Transition rows claimed by `owner` to done and stamp the processing
    /// audit fields. Rows not held by `owner` are silently ignored.
    async fn ack(&self, owner: OwnerToken, ids: &[WorkItemId]) -> Result<()>;

    /// Release rows claimed by `owner` back to pending for a later retry.
    /// Bumps the attempt counter, records `last_error` when non-empty and
    /// schedules the next attempt after `delay` (the default backoff when
    /// absent). Rows not held by `owner` are silently ignored.
    async fn abandon(
        &self,
        owner: OwnerToken,
        ids: &[WorkItemId],
        last_error: Option<&str>,
        delay: Option<Duration>,
    ) -> Result<()>;

    /// Transition rows claimed by `owner` to the terminal failure status.
    /// Rows not held by `owner` are silently ignored.
    async fn fail(
        &self,
        owner: OwnerToken,
        ids: &[WorkItemId],
        error: &str,
        kind: FailKind,
    ) -> Result<()>;

    /// Release every in-flight row whose lease has expired back to pending.
    /// Idempotent. Returns the number of rows recovered.
    async fn reap_expired(&self) -> Result<u64>;
}

/// One database's outbox.
#[async_trait]
pub trait OutboxStore: WorkQueue {
    /// Insert a new `Ready` row in the store's own transaction.
    ///
    /// Postgres stores additionally offer `enqueue_in_tx` to join a caller's
    /// open transaction, for co-committing with business writes.
    async fn enqueue(&self, msg: NewOutboxMessage) -> Result<Enqueued>;

    async fn get(&self, id: WorkItemId) -> Result<Option<OutboxMessage>>;

    /// Look a row up by its logical message id.
    async fn find_by_message_id(&self, id: MessageId) -> Result<Option<OutboxMessage>>;

    /// Delete `Done` rows processed longer than `retention` ago. Batched;
    /// never touches other terminal rows. Returns the number deleted.
    async fn cleanup(&self, retention: Duration) -> Result<u64>;

    /// Terminally failed rows, oldest first, for dead-letter inspection.
    async fn failed(&self, limit: usize) -> Result<Vec<OutboxMessage>>;

    async fn counts(&self) -> Result<QueueCounts>;
}

/// One database's inbox.
#[async_trait]
pub trait InboxStore: WorkQueue {
    /// Upsert on the `(source, external_id)` natural key: the first contact
    /// inserts a `Seen` row; a redelivery bumps `last_seen_at` and, while
    /// the row is still pre-terminal, refreshes topic, payload, hash and
    /// due time. A `Done` row is never resurrected.
    async fn enqueue(&self, msg: NewInboxMessage) -> Result<WorkItemId>;

    /// Pre-flight dedupe for idempotent webhooks: true iff a `Done` row
    /// exists for the key. Otherwise records the contact as a `Seen` row
    /// (upsert) and returns false. A differing `hash` against the stored
    /// digest is logged at warning level but never fails the call.
    async fn already_processed(
        &self,
        source: &str,
        external_id: &str,
        hash: Option<&str>,
    ) -> Result<bool>;

    async fn get(&self, source: &str, external_id: &str) -> Result<Option<InboxMessage>>;

    /// Transition a `Dead` row back to `Seen` for reprocessing. Returns
    /// false when the key is unknown or the row is not dead.
    async fn revive(&self, source: &str, external_id: &str) -> Result<bool>;

    /// Delete `Done` rows processed longer than `retention` ago.
    async fn cleanup(&self, retention: Duration) -> Result<u64>;

    /// `Dead` rows, oldest first, for dead-letter inspection.
    async fn dead(&self, limit: usize) -> Result<Vec<InboxMessage>>;

    async fn counts(&self) -> Result<QueueCounts>;
}
