//! Single-mutex store implementation.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use relay_core::message::{normalize_opt, validate_key, validate_topic, MAX_KEY_LEN};
use relay_core::{
    BackoffPolicy, Delivery, Enqueued, Error, FailKind, InboxMessage, InboxStatus, InboxStore,
    JoinId, JoinMember, JoinRecord, JoinStatus, JoinStore, MessageId, NewInboxMessage,
    NewOutboxMessage, OutboxMessage, OutboxStatus, OutboxStore, OwnerToken, QueueCounts, Result,
    WorkItemId, WorkQueue,
};

struct Inner {
    /// Added to the wall clock; only ever grows.
    offset: chrono::Duration,
    outbox: Vec<OutboxMessage>,
    inbox: Vec<InboxMessage>,
    joins: Vec<JoinRecord>,
    members: Vec<JoinMember>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            offset: chrono::Duration::zero(),
            outbox: Vec::new(),
            inbox: Vec::new(),
            joins: Vec::new(),
            members: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MemberOutcome {
    Completed,
    Failed,
}

fn mark_members_locked(
    inner: &mut Inner,
    message_ids: &[MessageId],
    outcome: MemberOutcome,
    now: DateTime<Utc>,
) {
    for message_id in message_ids {
        let mut touched = Vec::new();
        for member in inner.members.iter_mut() {
            if member.message_id == *message_id
                && member.completed_at.is_none()
                && member.failed_at.is_none()
            {
                match outcome {
                    MemberOutcome::Completed => member.completed_at = Some(now),
                    MemberOutcome::Failed => member.failed_at = Some(now),
                }
                touched.push(member.join_id);
            }
        }
        for join_id in touched {
            let Some(join) = inner.joins.iter_mut().find(|j| j.join_id == join_id) else {
                continue;
            };
            if join.completed_steps + join.failed_steps < join.expected_steps {
                match outcome {
                    MemberOutcome::Completed => join.completed_steps += 1,
                    MemberOutcome::Failed => join.failed_steps += 1,
                }
                join.last_updated_at = now;
            }
        }
    }
}

/// One in-memory database: outbox, inbox and join tables under one lock.
#[derive(Clone)]
pub struct MemStore {
    identifier: Arc<str>,
    backoff: BackoffPolicy,
    inner: Arc<Mutex<Inner>>,
}

impl MemStore {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into().into(),
            backoff: BackoffPolicy::default(),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn outbox(&self) -> MemOutbox {
        MemOutbox {
            store: self.clone(),
        }
    }

    pub fn inbox(&self) -> MemInbox {
        MemInbox {
            store: self.clone(),
        }
    }

    pub fn joins(&self) -> MemJoinStore {
        MemJoinStore {
            store: self.clone(),
        }
    }

    /// Step the store clock forward, e.g. past a retry backoff or a claim
    /// lease, without sleeping.
    pub fn advance(&self, by: Duration) {
        let mut inner = self.lock();
        inner.offset =
            inner.offset + chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
    }

    /// Snapshot of an outbox row, for assertions.
    pub fn outbox_row(&self, id: WorkItemId) -> Option<OutboxMessage> {
        self.lock()
            .outbox
            .iter()
            .find(|m| m.work_item_id == id)
            .cloned()
    }

    /// Outbox rows carrying `topic`, oldest first, for assertions.
    pub fn outbox_rows_by_topic(&self, topic: &str) -> Vec<OutboxMessage> {
        self.lock()
            .outbox
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Snapshot of an inbox row, for assertions.
    pub fn inbox_row(&self, source: &str, external_id: &str) -> Option<InboxMessage> {
        self.lock()
            .inbox
            .iter()
            .find(|m| m.source == source && m.external_id == external_id)
            .cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn now_locked(inner: &Inner) -> DateTime<Utc> {
        Utc::now() + inner.offset
    }
}

fn claim_eligible_outbox(m: &OutboxMessage, now: DateTime<Utc>) -> bool {
    m.status == OutboxStatus::Ready
        && m.locked_until.map_or(true, |t| t <= now)
        && m.due_at.map_or(true, |t| t <= now)
        && m.next_attempt_at <= now
}

fn claim_eligible_inbox(m: &InboxMessage, now: DateTime<Utc>) -> bool {
    m.status == InboxStatus::Seen
        && m.locked_until.map_or(true, |t| t <= now)
        && m.due_at.map_or(true, |t| t <= now)
        && m.next_attempt_at <= now
}

fn validate_claim(lease: Duration, batch_size: usize) -> Result<chrono::Duration> {
    if lease.is_zero() {
        return Err(Error::invalid("claim lease must be positive"));
    }
    if batch_size == 0 {
        return Err(Error::invalid("claim batch size must be positive"));
    }
    Ok(chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX))
}

fn validate_abandon_delay(delay: Option<Duration>) -> Result<()> {
    if delay.is_some_and(|d| d.is_zero()) {
        return Err(Error::invalid("abandon delay must be positive"));
    }
    Ok(())
}

/// Outbox handle of a [`MemStore`].
#[derive(Clone)]
pub struct MemOutbox {
    store: MemStore,
}

#[async_trait]
impl WorkQueue for MemOutbox {
    fn identifier(&self) -> &str {
        &self.store.identifier
    }

    async fn claim(
        &self,
        owner: OwnerToken,
        lease: Duration,
        batch_size: usize,
    ) -> Result<Vec<Delivery>> {
        let lease = validate_claim(lease, batch_size)?;
        let mut inner = self.store.lock();
        let now = MemStore::now_locked(&inner);

        // Rows are kept in insertion order, which matches created_at.
        let mut deliveries = Vec::new();
        for m in inner.outbox.iter_mut() {
            if deliveries.len() == batch_size {
                break;
            }
            if !claim_eligible_outbox(m, now) {
                continue;
            }
            m.status = OutboxStatus::InProgress;
            m.owner = Some(owner);
            m.locked_until = Some(now + lease);
            deliveries.push(m.delivery());
        }
        Ok(deliveries)
    }

    async fn ack(&self, owner: OwnerToken, ids: &[WorkItemId]) -> Result<()> {
        let mut inner = self.store.lock();
        let now = MemStore::now_locked(&inner);
        let mut acked = Vec::new();
        for m in inner.outbox.iter_mut() {
            if ids.contains(&m.work_item_id)
                && m.status == OutboxStatus::InProgress
                && m.owner == Some(owner)
            {
                m.status = OutboxStatus::Done;
                m.owner = None;
                m.locked_until = None;
                m.processed_at = Some(now);
                m.processed_by = Some(owner.to_string());
                acked.push(m.message_id);
            }
        }
        mark_members_locked(&mut inner, &acked, MemberOutcome::Completed, now);
        Ok(())
    }

    async fn abandon(
        &self,
        owner: OwnerToken,
        ids: &[WorkItemId],
        last_error: Option<&str>,
        delay: Option<Duration>,
    ) -> Result<()> {
        validate_abandon_delay(delay)?;
        let backoff = self.store.backoff.clone();
        let mut inner = self.store.lock();
        let now = MemStore::now_locked(&inner);
        for m in inner.outbox.iter_mut() {
            if ids.contains(&m.work_item_id)
                && m.status == OutboxStatus::InProgress
                && m.owner == Some(owner)
            {
                m.status = OutboxStatus::Ready;
                m.owner = None;
                m.locked_until = None;
                m.retry_count += 1;
                if let Some(err) = last_error.filter(|e| !e.is_empty()) {
                    m.last_error = Some(err.to_string());
                }
                let delay = delay.unwrap_or_else(|| backoff.delay(m.retry_count.max(0) as u32));
                m.next_attempt_at =
                    now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
            }
        }
        Ok(())
    }

    async fn fail(
        &self,
        owner: OwnerToken,
        ids: &[WorkItemId],
        error: &str,
        kind: FailKind,
    ) -> Result<()> {
        let mut inner = self.store.lock();
        let now = MemStore::now_locked(&inner);
        let mut failed = Vec::new();
        for m in inner.outbox.iter_mut() {
            if ids.contains(&m.work_item_id)
                && m.status == OutboxStatus::InProgress
                && m.owner == Some(owner)
            {
                m.status = OutboxStatus::Failed;
                m.owner = None;
                m.locked_until = None;
                m.last_error = Some(error.to_string());
                if kind == FailKind::Exhausted {
                    m.retry_count += 1;
                }
                failed.push(m.message_id);
            }
        }
        mark_members_locked(&mut inner, &failed, MemberOutcome::Failed, now);
        Ok(())
    }

    async fn reap_expired(&self) -> Result<u64> {
        let mut inner = self.store.lock();
        let now = MemStore::now_locked(&inner);
        let mut reaped = 0u64;
        for m in inner.outbox.iter_mut() {
            if m.status == OutboxStatus::InProgress && m.locked_until.is_some_and(|t| t <= now) {
                m.status = OutboxStatus::Ready;
                m.owner = None;
                m.locked_until = None;
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

#[async_trait]
impl OutboxStore for MemOutbox {
    async fn enqueue(&self, mut msg: NewOutboxMessage) -> Result<Enqueued> {
        validate_topic(&msg.topic)?;
        msg.correlation_id = normalize_opt(msg.correlation_id.take());

        let mut inner = self.store.lock();
        let now = MemStore::now_locked(&inner);
        let enqueued = Enqueued {
            work_item_id: WorkItemId::random(),
            message_id: msg.message_id.unwrap_or_else(MessageId::random),
        };
        inner.outbox.push(OutboxMessage {
            work_item_id: enqueued.work_item_id,
            message_id: enqueued.message_id,
            topic: msg.topic,
            payload: msg.payload,
            correlation_id: msg.correlation_id,
            status: OutboxStatus::Ready,
            created_at: now,
            due_at: msg.due_at,
            next_attempt_at: now,
            locked_until: None,
            owner: None,
            retry_count: 0,
            last_error: None,
            processed_at: None,
            processed_by: None,
        });
        Ok(enqueued)
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<OutboxMessage>> {
        Ok(self.store.outbox_row(id))
    }

    async fn find_by_message_id(&self, id: MessageId) -> Result<Option<OutboxMessage>> {
        Ok(self
            .store
            .lock()
            .outbox
            .iter()
            .find(|m| m.message_id == id)
            .cloned())
    }

    async fn cleanup(&self, retention: Duration) -> Result<u64> {
        let mut inner = self.store.lock();
        let cutoff = MemStore::now_locked(&inner)
            - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let before = inner.outbox.len();
        inner.outbox.retain(|m| {
            !(m.status == OutboxStatus::Done && m.processed_at.is_some_and(|t| t < cutoff))
        });
        Ok((before - inner.outbox.len()) as u64)
    }

    async fn failed(&self, limit: usize) -> Result<Vec<OutboxMessage>> {
        Ok(self
            .store
            .lock()
            .outbox
            .iter()
            .filter(|m| m.status == OutboxStatus::Failed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let inner = self.store.lock();
        let mut counts = QueueCounts::default();
        for m in &inner.outbox {
            match m.status {
                OutboxStatus::Ready => counts.pending += 1,
                OutboxStatus::InProgress => counts.in_flight += 1,
                OutboxStatus::Done => counts.done += 1,
                OutboxStatus::Failed => counts.dead += 1,
            }
        }
        Ok(counts)
    }
}

/// Inbox handle of a [`MemStore`].
#[derive(Clone)]
pub struct MemInbox {
    store: MemStore,
}

#[async_trait]
impl WorkQueue for MemInbox {
    fn identifier(&self) -> &str {
        &self.store.identifier
    }

    async fn claim(
        &self,
        owner: OwnerToken,
        lease: Duration,
        batch_size: usize,
    ) -> Result<Vec<Delivery>> {
        let lease = validate_claim(lease, batch_size)?;
        let mut inner = self.store.lock();
        let now = MemStore::now_locked(&inner);

        let mut order: Vec<usize> = (0..inner.inbox.len())
            .filter(|&i| claim_eligible_inbox(&inner.inbox[i], now))
            .collect();
        order.sort_by_key(|&i| inner.inbox[i].last_seen_at);

        let mut deliveries = Vec::new();
        for i in order.into_iter().take(batch_size) {
            let m = &mut inner.inbox[i];
            m.status = InboxStatus::Processing;
            m.owner = Some(owner);
            m.locked_until = Some(now + lease);
            deliveries.push(m.delivery());
        }
        Ok(deliveries)
    }

    async fn ack(&self, owner: OwnerToken, ids: &[WorkItemId]) -> Result<()> {
        let mut inner = self.store.lock();
        let now = MemStore::now_locked(&inner);
        for m in inner.inbox.iter_mut() {
            if ids.contains(&m.work_item_id)
                && m.status == InboxStatus::Processing
                && m.owner == Some(owner)
            {
                m.status = InboxStatus::Done;
                m.owner = None;
                m.locked_until = None;
                m.processed_at = Some(now);
            }
        }
        Ok(())
    }

    async fn abandon(
        &self,
        owner: OwnerToken,
        ids: &[WorkItemId],
        last_error: Option<&str>,
        delay: Option<Duration>,
    ) -> Result<()> {
        validate_abandon_delay(delay)?;
        let backoff = self.store.backoff.clone();
        let mut inner = self.store.lock();
        let now = MemStore::now_locked(&inner);
        for m in inner.inbox.iter_mut() {
            if ids.contains(&m.work_item_id)
                && m.status == InboxStatus::Processing
                && m.owner == Some(owner)
            {
                m.status = InboxStatus::Seen;
                m.owner = None;
                m.locked_until = None;
                m.attempts += 1;
                if let Some(err) = last_error.filter(|e| !e.is_empty()) {
                    m.last_error = Some(err.to_string());
                }
                let delay = delay.unwrap_or_else(|| backoff.delay(m.attempts.max(0) as u32));
                m.next_attempt_at =
                    now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
            }
        }
        Ok(())
    }

    async fn fail(
        &self,
        owner: OwnerToken,
        ids: &[WorkItemId],
        error: &str,
        kind: FailKind,
    ) -> Result<()> {
        let mut inner = self.store.lock();
        for m in inner.inbox.iter_mut() {
            if ids.contains(&m.work_item_id)
                && m.status == InboxStatus::Processing
                && m.owner == Some(owner)
            {
                m.status = InboxStatus::Dead;
                m.owner = None;
                m.locked_until = None;
                m.last_error = Some(error.to_string());
                if kind == FailKind::Exhausted {
                    m.attempts += 1;
                }
            }
        }
        Ok(())
    }

    async fn reap_expired(&self) -> Result<u64> {
        let mut inner = self.store.lock();
        let now = MemStore::now_locked(&inner);
        let mut reaped = 0u64;
        for m in inner.inbox.iter_mut() {
            if m.status == InboxStatus::Processing && m.locked_until.is_some_and(|t| t <= now) {
                m.status = InboxStatus::Seen;
                m.owner = None;
                m.locked_until = None;
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

#[async_trait]
impl InboxStore for MemInbox {
    async fn enqueue(&self, msg: NewInboxMessage) -> Result<WorkItemId> {
        validate_key("source", &msg.source)?;
        validate_key("external id", &msg.external_id)?;
        validate_topic(&msg.topic)?;

        let mut inner = self.store.lock();
        let now = MemStore::now_locked(&inner);
        if let Some(m) = inner
            .inbox
            .iter_mut()
            .find(|m| m.source == msg.source && m.external_id == msg.external_id)
        {
            m.last_seen_at = now;
            if !m.status.is_terminal() {
                m.topic = msg.topic;
                m.payload = msg.payload;
                m.hash = msg.hash;
                m.due_at = msg.due_at;
            }
            return Ok(m.work_item_id);
        }

        let work_item_id = WorkItemId::random();
        inner.inbox.push(InboxMessage {
            work_item_id,
            source: msg.source,
            external_id: msg.external_id,
            topic: msg.topic,
            payload: msg.payload,
            hash: msg.hash,
            status: InboxStatus::Seen,
            first_seen_at: now,
            last_seen_at: now,
            processed_at: None,
            due_at: msg.due_at,
            next_attempt_at: now,
            attempts: 0,
            last_error: None,
            locked_until: None,
            owner: None,
        });
        Ok(work_item_id)
    }

    async fn already_processed(
        &self,
        source: &str,
        external_id: &str,
        hash: Option<&str>,
    ) -> Result<bool> {
        validate_key("source", source)?;
        validate_key("external id", external_id)?;

        let identifier = self.store.identifier.clone();
        let mut inner = self.store.lock();
        let now = MemStore::now_locked(&inner);
        if let Some(m) = inner
            .inbox
            .iter_mut()
            .find(|m| m.source == source && m.external_id == external_id)
        {
            m.last_seen_at = now;
            if let (Some(seen), Some(stored)) = (hash, m.hash.as_deref()) {
                if seen != stored {
                    tracing::warn!(
                        event = "relay.inbox.hash_mismatch",
                        store = %identifier,
                        source = %source,
                        external_id = %external_id,
                        "redelivered message content differs from the stored digest"
                    );
                }
            }
            return Ok(m.status == InboxStatus::Done);
        }

        inner.inbox.push(InboxMessage {
            work_item_id: WorkItemId::random(),
            source: source.to_string(),
            external_id: external_id.to_string(),
            topic: String::new(),
            payload: String::new(),
            hash: hash.map(str::to_string),
            status: InboxStatus::Seen,
            first_seen_at: now,
            last_seen_at: now,
            processed_at: None,
            due_at: None,
            next_attempt_at: now,
            attempts: 0,
            last_error: None,
            locked_until: None,
            owner: None,
        });
        Ok(false)
    }

    async fn get(&self, source: &str, external_id: &str) -> Result<Option<InboxMessage>> {
        Ok(self.store.inbox_row(source, external_id))
    }

    async fn revive(&self, source: &str, external_id: &str) -> Result<bool> {
        let mut inner = self.store.lock();
        let now = MemStore::now_locked(&inner);
        let Some(m) = inner
            .inbox
            .iter_mut()
            .find(|m| m.source == source && m.external_id == external_id)
        else {
            return Ok(false);
        };
        if m.status != InboxStatus::Dead {
            return Ok(false);
        }
        m.status = InboxStatus::Seen;
        m.owner = None;
        m.locked_until = None;
        m.next_attempt_at = now;
        Ok(true)
    }

    async fn cleanup(&self, retention: Duration) -> Result<u64> {
        let mut inner = self.store.lock();
        let cutoff = MemStore::now_locked(&inner)
            - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let before = inner.inbox.len();
        inner.inbox.retain(|m| {
            !(m.status == InboxStatus::Done && m.processed_at.is_some_and(|t| t < cutoff))
        });
        Ok((before - inner.inbox.len()) as u64)
    }

    async fn dead(&self, limit: usize) -> Result<Vec<InboxMessage>> {
        Ok(self
            .store
            .lock()
            .inbox
            .iter()
            .filter(|m| m.status == InboxStatus::Dead)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let inner = self.store.lock();
        let mut counts = QueueCounts::default();
        for m in &inner.inbox {
            match m.status {
                InboxStatus::Seen => counts.pending += 1,
                InboxStatus::Processing => counts.in_flight += 1,
                InboxStatus::Done => counts.done += 1,
                InboxStatus::Dead => counts.dead += 1,
            }
        }
        Ok(counts)
    }
}

/// Join handle of a [`MemStore`].
#[derive(Clone)]
pub struct MemJoinStore {
    store: MemStore,
}

impl MemJoinStore {
    fn mark(&self, message_id: MessageId, outcome: MemberOutcome) {
        let mut inner = self.store.lock();
        let now = MemStore::now_locked(&inner);
        mark_members_locked(&mut inner, &[message_id], outcome, now);
    }
}

#[async_trait]
impl JoinStore for MemJoinStore {
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

        let mut inner = self.store.lock();
        let now = MemStore::now_locked(&inner);
        let join_id = JoinId::random();
        inner.joins.push(JoinRecord {
            join_id,
            grouping_key: grouping_key.map(str::to_string),
            expected_steps,
            completed_steps: 0,
            failed_steps: 0,
            status: JoinStatus::Pending,
            created_at: now,
            last_updated_at: now,
            metadata: metadata.map(str::to_string),
        });
        Ok(join_id)
    }

    async fn attach_member(&self, join_id: JoinId, message_id: MessageId) -> Result<()> {
        let mut inner = self.store.lock();
        let now = MemStore::now_locked(&inner);
        if !inner.joins.iter().any(|j| j.join_id == join_id) {
            return Err(Error::not_found(format!("join {join_id} does not exist")));
        }
        if inner
            .members
            .iter()
            .any(|m| m.join_id == join_id && m.message_id == message_id)
        {
            return Ok(());
        }
        inner.members.push(JoinMember {
            join_id,
            message_id,
            completed_at: None,
            failed_at: None,
            created_at: now,
        });
        Ok(())
    }

    async fn get_join(&self, join_id: JoinId) -> Result<Option<JoinRecord>> {
        Ok(self
            .store
            .lock()
            .joins
            .iter()
            .find(|j| j.join_id == join_id)
            .cloned())
    }

    async fn members(&self, join_id: JoinId) -> Result<Vec<JoinMember>> {
        Ok(self
            .store
            .lock()
            .members
            .iter()
            .filter(|m| m.join_id == join_id)
            .cloned()
            .collect())
    }

    async fn mark_completed(&self, message_id: MessageId) -> Result<()> {
        self.mark(message_id, MemberOutcome::Completed);
        Ok(())
    }

    async fn mark_failed(&self, message_id: MessageId) -> Result<()> {
        self.mark(message_id, MemberOutcome::Failed);
        Ok(())
    }

    async fn update_status(&self, join_id: JoinId, status: JoinStatus) -> Result<()> {
        let mut inner = self.store.lock();
        let now = MemStore::now_locked(&inner);
        if let Some(join) = inner
            .joins
            .iter_mut()
            .find(|j| j.join_id == join_id && j.status == JoinStatus::Pending)
        {
            join.status = status;
            join.last_updated_at = now;
        }
        Ok(())
    }
}
