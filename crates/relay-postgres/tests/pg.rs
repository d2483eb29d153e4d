//! Integration tests against a live Postgres.
//!
//! Set `RELAY_TEST_DATABASE_URL` to run these; without it every test exits
//! early so the suite stays green on machines without a database. Tests
//! share one database and serialize through a lock, truncating state
//! between runs.

use std::sync::{Once, OnceLock};
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use relay_core::{
    FailKind, InboxStatus, InboxStore, JoinStatus, JoinStore, LeaseFactory, NewInboxMessage,
    NewOutboxMessage, OutboxStatus, OutboxStore, OwnerToken, WorkQueue,
};
use relay_postgres::{run_migrations, PgInbox, PgJoinStore, PgLeaseFactory, PgOutbox};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

async fn integration_lock() -> tokio::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| tokio::sync::Mutex::new(()))
        .lock()
        .await
}

async fn test_pool() -> Option<PgPool> {
    init_tracing();
    let Ok(url) = std::env::var("RELAY_TEST_DATABASE_URL") else {
        eprintln!("skipping: RELAY_TEST_DATABASE_URL not set");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .expect("connect test database");
    run_migrations(&pool).await.expect("run migrations");
    sqlx::query(
        r#"
        TRUNCATE relay_outbox, relay_inbox, relay_join, relay_join_member, relay_lease
        "#,
    )
    .execute(&pool)
    .await
    .expect("truncate relay tables");
    Some(pool)
}

#[tokio::test]
async fn outbox_round_trip() {
    let _guard = integration_lock().await;
    let Some(pool) = test_pool().await else { return };
    let outbox = PgOutbox::new(pool, "it");

    let enqueued = outbox
        .enqueue(NewOutboxMessage::new("T", "payload").correlation_id("corr"))
        .await
        .unwrap();

    let owner = OwnerToken::random();
    let claimed = outbox
        .claim(owner, Duration::from_secs(30), 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].work_item_id, enqueued.work_item_id);
    assert_eq!(claimed[0].payload, "payload");
    assert_eq!(claimed[0].correlation_id.as_deref(), Some("corr"));

    // Claimed rows are invisible to other claimers.
    assert!(outbox
        .claim(OwnerToken::random(), Duration::from_secs(30), 10)
        .await
        .unwrap()
        .is_empty());

    outbox.ack(owner, &[enqueued.work_item_id]).await.unwrap();
    let row = outbox.get(enqueued.work_item_id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Done);
    assert_eq!(row.payload, "payload");
    assert!(row.processed_at.is_some());
    assert!(row.owner.is_none());
}

#[tokio::test]
async fn concurrent_claims_are_disjoint() {
    let _guard = integration_lock().await;
    let Some(pool) = test_pool().await else { return };
    let outbox = PgOutbox::new(pool, "it");

    for i in 0..40 {
        outbox
            .enqueue(NewOutboxMessage::new("T", format!("p{i}")))
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let outbox = outbox.clone();
        tasks.push(tokio::spawn(async move {
            let owner = OwnerToken::random();
            let mut mine = Vec::new();
            loop {
                let batch = outbox
                    .claim(owner, Duration::from_secs(60), 5)
                    .await
                    .unwrap();
                if batch.is_empty() {
                    return mine;
                }
                mine.extend(batch.into_iter().map(|d| d.work_item_id));
            }
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    assert_eq!(all.len(), 40);
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 40, "claimed sets overlap");
}

#[tokio::test]
async fn abandon_reschedules_and_fail_records_the_error() {
    let _guard = integration_lock().await;
    let Some(pool) = test_pool().await else { return };
    let outbox = PgOutbox::new(pool, "it");

    let enqueued = outbox
        .enqueue(NewOutboxMessage::new("T", "p"))
        .await
        .unwrap();
    let owner = OwnerToken::random();
    outbox
        .claim(owner, Duration::from_secs(30), 10)
        .await
        .unwrap();
    outbox
        .abandon(
            owner,
            &[enqueued.work_item_id],
            Some("first error"),
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap();

    let row = outbox.get(enqueued.work_item_id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Ready);
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.last_error.as_deref(), Some("first error"));

    // Not eligible until the delay passes.
    assert!(outbox
        .claim(owner, Duration::from_secs(30), 10)
        .await
        .unwrap()
        .is_empty());
    tokio::time::sleep(Duration::from_millis(100)).await;

    outbox
        .claim(owner, Duration::from_secs(30), 10)
        .await
        .unwrap();
    outbox
        .fail(owner, &[enqueued.work_item_id], "gave up", FailKind::Exhausted)
        .await
        .unwrap();

    let row = outbox.get(enqueued.work_item_id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.retry_count, 2);
    assert_eq!(row.last_error.as_deref(), Some("gave up"));

    let dead_letters = outbox.failed(10).await.unwrap();
    assert_eq!(dead_letters.len(), 1);
}

#[tokio::test]
async fn expired_claims_are_reaped() {
    let _guard = integration_lock().await;
    let Some(pool) = test_pool().await else { return };
    let outbox = PgOutbox::new(pool, "it");

    let enqueued = outbox
        .enqueue(NewOutboxMessage::new("T", "p"))
        .await
        .unwrap();
    let owner = OwnerToken::random();
    outbox
        .claim(owner, Duration::from_millis(50), 10)
        .await
        .unwrap();

    assert_eq!(outbox.reap_expired().await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(outbox.reap_expired().await.unwrap(), 1);

    let row = outbox.get(enqueued.work_item_id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Ready);
    assert!(row.owner.is_none());
    assert!(row.locked_until.is_none());
}

#[tokio::test]
async fn ack_settles_join_members_in_the_same_transaction() {
    let _guard = integration_lock().await;
    let Some(pool) = test_pool().await else { return };
    let outbox = PgOutbox::new(pool.clone(), "it");
    let joins = PgJoinStore::new(pool);

    let join_id = joins.create_join(Some("batch-7"), 2, None).await.unwrap();
    let good = outbox
        .enqueue(NewOutboxMessage::new("T", "ok"))
        .await
        .unwrap();
    let bad = outbox
        .enqueue(NewOutboxMessage::new("T", "broken"))
        .await
        .unwrap();
    joins.attach_member(join_id, good.message_id).await.unwrap();
    joins.attach_member(join_id, bad.message_id).await.unwrap();
    // Attach is idempotent.
    joins.attach_member(join_id, good.message_id).await.unwrap();

    let owner = OwnerToken::random();
    outbox
        .claim(owner, Duration::from_secs(30), 10)
        .await
        .unwrap();
    outbox.ack(owner, &[good.work_item_id]).await.unwrap();
    outbox
        .fail(owner, &[bad.work_item_id], "exploded", FailKind::Permanent)
        .await
        .unwrap();

    let join = joins.get_join(join_id).await.unwrap().unwrap();
    assert_eq!((join.completed_steps, join.failed_steps), (1, 1));
    assert_eq!(join.status, JoinStatus::Pending);

    let members = joins.members(join_id).await.unwrap();
    assert_eq!(members.len(), 2);
    assert!(members
        .iter()
        .all(|m| m.completed_at.is_some() != m.failed_at.is_some()));

    // Duplicate marks never double-count.
    joins.mark_completed(good.message_id).await.unwrap();
    joins.mark_failed(good.message_id).await.unwrap();
    let join = joins.get_join(join_id).await.unwrap().unwrap();
    assert_eq!((join.completed_steps, join.failed_steps), (1, 1));

    joins
        .update_status(join_id, JoinStatus::Failed)
        .await
        .unwrap();
    joins
        .update_status(join_id, JoinStatus::Completed)
        .await
        .unwrap();
    assert_eq!(
        joins.get_join(join_id).await.unwrap().unwrap().status,
        JoinStatus::Failed
    );
}

#[tokio::test]
async fn transactional_enqueue_rolls_back_with_the_business_write() {
    let _guard = integration_lock().await;
    let Some(pool) = test_pool().await else { return };
    let outbox = PgOutbox::new(pool.clone(), "it");

    let mut tx = pool.begin().await.unwrap();
    let enqueued = outbox
        .enqueue_in_tx(&mut tx, NewOutboxMessage::new("T", "doomed"))
        .await
        .unwrap();
    tx.rollback().await.unwrap();
    assert!(outbox.get(enqueued.work_item_id).await.unwrap().is_none());

    let mut tx = pool.begin().await.unwrap();
    let enqueued = outbox
        .enqueue_in_tx(&mut tx, NewOutboxMessage::new("T", "kept"))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    let row = outbox.get(enqueued.work_item_id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Ready);
}

#[tokio::test]
async fn inbox_upsert_and_preflight() {
    let _guard = integration_lock().await;
    let Some(pool) = test_pool().await else { return };
    let inbox = PgInbox::new(pool, "it");

    let first = inbox
        .enqueue(NewInboxMessage::new("stripe", "evt-1", "T", "v1").hash("h1"))
        .await
        .unwrap();
    let second = inbox
        .enqueue(NewInboxMessage::new("stripe", "evt-1", "T", "v2").hash("h2"))
        .await
        .unwrap();
    assert_eq!(first, second);

    let row = inbox.get("stripe", "evt-1").await.unwrap().unwrap();
    assert_eq!(row.status, InboxStatus::Seen);
    assert_eq!(row.payload, "v2");
    assert_eq!(row.hash.as_deref(), Some("h2"));

    assert!(!inbox
        .already_processed("stripe", "evt-1", Some("h2"))
        .await
        .unwrap());

    let owner = OwnerToken::random();
    let claimed = inbox
        .claim(owner, Duration::from_secs(30), 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].source.as_deref(), Some("stripe"));
    inbox.ack(owner, &[claimed[0].work_item_id]).await.unwrap();

    assert!(inbox
        .already_processed("stripe", "evt-1", Some("h2"))
        .await
        .unwrap());
    // A redelivery cannot resurrect the done row.
    inbox
        .enqueue(NewInboxMessage::new("stripe", "evt-1", "T", "v3"))
        .await
        .unwrap();
    let row = inbox.get("stripe", "evt-1").await.unwrap().unwrap();
    assert_eq!(row.status, InboxStatus::Done);
    assert_eq!(row.payload, "v2");

    // Fresh keys go through the preflight as unseen.
    assert!(!inbox
        .already_processed("stripe", "evt-2", None)
        .await
        .unwrap());
    let row = inbox.get("stripe", "evt-2").await.unwrap().unwrap();
    assert_eq!(row.status, InboxStatus::Seen);
}

#[tokio::test]
async fn dead_inbox_rows_revive() {
    let _guard = integration_lock().await;
    let Some(pool) = test_pool().await else { return };
    let inbox = PgInbox::new(pool, "it");

    inbox
        .enqueue(NewInboxMessage::new("stripe", "evt-1", "T", "v1"))
        .await
        .unwrap();
    let owner = OwnerToken::random();
    let claimed = inbox
        .claim(owner, Duration::from_secs(30), 10)
        .await
        .unwrap();
    inbox
        .fail(owner, &[claimed[0].work_item_id], "poison", FailKind::Permanent)
        .await
        .unwrap();

    assert_eq!(inbox.dead(10).await.unwrap().len(), 1);
    assert!(inbox.revive("stripe", "evt-1").await.unwrap());
    assert!(!inbox.revive("stripe", "evt-1").await.unwrap());

    let row = inbox.get("stripe", "evt-1").await.unwrap().unwrap();
    assert_eq!(row.status, InboxStatus::Seen);
}

#[tokio::test]
async fn lease_factory_fences_and_steals() {
    let _guard = integration_lock().await;
    let Some(pool) = test_pool().await else { return };
    let factory = PgLeaseFactory::new(pool).with_watchdog_interval(Duration::from_millis(20));

    let held = factory
        .acquire("outbox-processing", Duration::from_millis(150), None)
        .await
        .unwrap()
        .expect("first acquire");
    let first_token = held.fencing_token();

    // Contended while live.
    assert!(factory
        .acquire("outbox-processing", Duration::from_secs(5), None)
        .await
        .unwrap()
        .is_none());

    // Renewal extends and bumps the fencing token.
    assert!(held.renew().await.unwrap());
    assert!(held.fencing_token() > first_token);

    // Left alone, the lease expires, the loss token fires, and another
    // owner can steal the resource with a higher fencing token.
    tokio::time::timeout(Duration::from_secs(2), held.lost_token().cancelled())
        .await
        .expect("loss token fires");
    assert!(held.ensure_held().is_err());
    assert!(!held.renew().await.unwrap());

    let stolen = factory
        .acquire("outbox-processing", Duration::from_secs(5), None)
        .await
        .unwrap()
        .expect("steal after expiry");
    assert!(stolen.fencing_token() > held.fencing_token());

    // Release keeps the fencing counter growing for the next owner.
    stolen.release().await.unwrap();
    let next = factory
        .acquire("outbox-processing", Duration::from_secs(5), None)
        .await
        .unwrap()
        .expect("acquire after release");
    assert!(next.fencing_token() > stolen.fencing_token());
}
