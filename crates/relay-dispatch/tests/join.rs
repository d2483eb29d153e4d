//! Fan-in scenarios: join counters, coupling to ack/fail, and the
//! `join.wait` handler.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use relay_core::{
    Error, FailKind, JoinApi, JoinStatus, JoinStore, JoinWaitCommand, MessageId, NewOutboxMessage,
    OutboxStatus, OutboxStore, OwnerToken, WorkQueue, JOIN_WAIT_TOPIC,
};
use relay_dispatch::{DispatchConfig, Dispatcher, HandlerRegistryBuilder, JoinWaitHandler};
use relay_testkit::MemStore;

use common::{init_tracing, ScriptedHandler};

struct JoinFixture {
    store: MemStore,
    outbox: Arc<relay_testkit::MemOutbox>,
    joins: Arc<relay_testkit::MemJoinStore>,
    api: JoinApi,
}

fn fixture() -> JoinFixture {
    init_tracing();
    let store = MemStore::new("tenant-a");
    let outbox = Arc::new(store.outbox());
    let joins = Arc::new(store.joins());
    let api = JoinApi::new(outbox.clone(), joins.clone());
    JoinFixture {
        store,
        outbox,
        joins,
        api,
    }
}

fn wait_dispatcher(fx: &JoinFixture, extra: Vec<Arc<dyn relay_core::Handler>>) -> Dispatcher {
    let mut builder = HandlerRegistryBuilder::default()
        .register(Arc::new(JoinWaitHandler::new(
            fx.joins.clone(),
            fx.outbox.clone(),
        )))
        .unwrap();
    for handler in extra {
        builder = builder.register(handler).unwrap();
    }
    Dispatcher::new(Arc::new(builder.build()), DispatchConfig::default())
}

#[tokio::test]
async fn create_join_validates_parameters() {
    let fx = fixture();
    assert!(matches!(
        fx.api.start_join(None, 0, None).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        fx.api.start_join(None, -3, None).await,
        Err(Error::InvalidArgument(_))
    ));

    // Empty grouping key is normalized to absent.
    let join_id = fx.api.start_join(Some(""), 2, Some("meta")).await.unwrap();
    let join = fx.joins.get_join(join_id).await.unwrap().unwrap();
    assert_eq!(join.grouping_key, None);
    assert_eq!(join.expected_steps, 2);
    assert_eq!(join.status, JoinStatus::Pending);
    assert_eq!(join.metadata.as_deref(), Some("meta"));
}

#[tokio::test]
async fn attach_member_is_idempotent_and_checks_the_join() {
    let fx = fixture();
    let join_id = fx.api.start_join(None, 2, None).await.unwrap();
    let message_id = MessageId::random();

    fx.api.attach_message(join_id, message_id).await.unwrap();
    fx.api.attach_message(join_id, message_id).await.unwrap();
    assert_eq!(fx.joins.members(join_id).await.unwrap().len(), 1);

    assert!(matches!(
        fx.api
            .attach_message(relay_core::JoinId::random(), message_id)
            .await,
        Err(Error::NotFound(_))
    ));

    // Attaching never moves counters.
    let join = fx.joins.get_join(join_id).await.unwrap().unwrap();
    assert_eq!((join.completed_steps, join.failed_steps), (0, 0));
}

#[tokio::test]
async fn marks_increment_counters_at_most_once_per_member() {
    let fx = fixture();
    let join_id = fx.api.start_join(None, 2, None).await.unwrap();
    let m1 = MessageId::random();
    let m2 = MessageId::random();
    fx.api.attach_message(join_id, m1).await.unwrap();
    fx.api.attach_message(join_id, m2).await.unwrap();

    fx.joins.mark_completed(m1).await.unwrap();
    fx.joins.mark_completed(m1).await.unwrap();
    // A settled member ignores the opposite outcome too.
    fx.joins.mark_failed(m1).await.unwrap();

    let join = fx.joins.get_join(join_id).await.unwrap().unwrap();
    assert_eq!((join.completed_steps, join.failed_steps), (1, 0));

    fx.joins.mark_failed(m2).await.unwrap();
    fx.joins.mark_failed(m2).await.unwrap();
    let join = fx.joins.get_join(join_id).await.unwrap().unwrap();
    assert_eq!((join.completed_steps, join.failed_steps), (1, 1));
    assert!(join.all_steps_settled());

    let members = fx.joins.members(join_id).await.unwrap();
    let settled_once = members.iter().all(|m| {
        u8::from(m.completed_at.is_some()) + u8::from(m.failed_at.is_some()) == 1
    });
    assert!(settled_once);
}

#[tokio::test]
async fn outbox_ack_and_fail_settle_members_automatically() {
    let fx = fixture();
    let join_id = fx.api.start_join(None, 2, None).await.unwrap();

    let good = fx
        .outbox
        .enqueue(NewOutboxMessage::new("T", "ok"))
        .await
        .unwrap();
    let bad = fx
        .outbox
        .enqueue(NewOutboxMessage::new("T", "broken"))
        .await
        .unwrap();
    fx.api.attach_message(join_id, good.message_id).await.unwrap();
    fx.api.attach_message(join_id, bad.message_id).await.unwrap();

    let owner = OwnerToken::random();
    let claimed = fx
        .outbox
        .claim(owner, Duration::from_secs(30), 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 2);

    // Handlers never mention joins; the store settles members on its own.
    fx.outbox.ack(owner, &[good.work_item_id]).await.unwrap();
    fx.outbox
        .fail(owner, &[bad.work_item_id], "exploded", FailKind::Exhausted)
        .await
        .unwrap();

    let join = fx.joins.get_join(join_id).await.unwrap().unwrap();
    assert_eq!((join.completed_steps, join.failed_steps), (1, 1));

    // Replaying terminal transitions does not double-settle.
    fx.outbox.ack(owner, &[good.work_item_id]).await.unwrap();
    let join = fx.joins.get_join(join_id).await.unwrap().unwrap();
    assert_eq!((join.completed_steps, join.failed_steps), (1, 1));
}

#[tokio::test]
async fn three_step_join_with_one_failure_takes_the_fail_continuation() {
    let fx = fixture();
    let join_id = fx.api.start_join(None, 3, None).await.unwrap();

    for payload in ["ok-1", "ok-2", "bad"] {
        let enqueued = fx
            .outbox
            .enqueue(NewOutboxMessage::new("step", payload))
            .await
            .unwrap();
        fx.api
            .attach_message(join_id, enqueued.message_id)
            .await
            .unwrap();
    }

    let step_handler = ScriptedHandler::fail_on_payload("step", "bad", "bad step");
    let dispatcher = wait_dispatcher(&fx, vec![step_handler]);
    let cancel = CancellationToken::new();

    assert_eq!(dispatcher.run_once(fx.outbox.as_ref(), &cancel).await.unwrap(), 3);
    let join = fx.joins.get_join(join_id).await.unwrap().unwrap();
    assert!(join.all_steps_settled());
    assert_eq!((join.completed_steps, join.failed_steps), (2, 1));
    assert_eq!(join.status, JoinStatus::Pending);

    // Now the wait message fires and picks the failure continuation.
    let wait = fx
        .api
        .enqueue_join_wait(
            JoinWaitCommand::new(join_id, true)
                .on_complete("celebrate", "yay")
                .on_fail("X", "x"),
        )
        .await
        .unwrap();

    dispatcher.run_once(fx.outbox.as_ref(), &cancel).await.unwrap();

    let wait_row = fx.store.outbox_row(wait.work_item_id).unwrap();
    assert_eq!(wait_row.status, OutboxStatus::Done);

    let continuations = fx.store.outbox_rows_by_topic("X");
    assert_eq!(continuations.len(), 1);
    assert_eq!(continuations[0].payload, "x");
    assert!(fx.store.outbox_rows_by_topic("celebrate").is_empty());

    let join = fx.joins.get_join(join_id).await.unwrap().unwrap();
    assert_eq!(join.status, JoinStatus::Failed);

    // A second wait against the now-terminal join is a no-op: acked, no
    // duplicate continuation.
    let rerun = fx
        .api
        .enqueue_join_wait(JoinWaitCommand::new(join_id, true).on_fail("X", "x"))
        .await
        .unwrap();
    dispatcher.run_once(fx.outbox.as_ref(), &cancel).await.unwrap();
    assert_eq!(
        fx.store.outbox_row(rerun.work_item_id).unwrap().status,
        OutboxStatus::Done
    );
    assert_eq!(fx.store.outbox_rows_by_topic("X").len(), 1);
}

#[tokio::test]
async fn wait_retries_until_all_steps_settle() {
    let fx = fixture();
    let join_id = fx.api.start_join(None, 2, None).await.unwrap();
    let m1 = MessageId::random();
    let m2 = MessageId::random();
    fx.api.attach_message(join_id, m1).await.unwrap();
    fx.api.attach_message(join_id, m2).await.unwrap();
    fx.joins.mark_completed(m1).await.unwrap();

    let wait = fx
        .api
        .enqueue_join_wait(JoinWaitCommand::new(join_id, false).on_complete("C", "c"))
        .await
        .unwrap();

    let dispatcher = wait_dispatcher(&fx, vec![]);
    let cancel = CancellationToken::new();
    dispatcher.run_once(fx.outbox.as_ref(), &cancel).await.unwrap();

    // Not ready yet: rescheduled, not failed.
    let row = fx.store.outbox_row(wait.work_item_id).unwrap();
    assert_eq!(row.status, OutboxStatus::Ready);
    assert_eq!(row.retry_count, 1);
    assert!(row.last_error.as_deref().unwrap().contains("not ready"));
    assert!(fx.store.outbox_rows_by_topic("C").is_empty());

    fx.joins.mark_completed(m2).await.unwrap();
    fx.store.advance(Duration::from_secs(120));
    dispatcher.run_once(fx.outbox.as_ref(), &cancel).await.unwrap();

    assert_eq!(
        fx.store.outbox_row(wait.work_item_id).unwrap().status,
        OutboxStatus::Done
    );
    assert_eq!(fx.store.outbox_rows_by_topic("C").len(), 1);
    assert_eq!(
        fx.joins.get_join(join_id).await.unwrap().unwrap().status,
        JoinStatus::Completed
    );
}

#[tokio::test]
async fn failed_steps_complete_the_join_when_failure_is_tolerated() {
    let fx = fixture();
    let join_id = fx.api.start_join(None, 2, None).await.unwrap();
    let m1 = MessageId::random();
    let m2 = MessageId::random();
    fx.api.attach_message(join_id, m1).await.unwrap();
    fx.api.attach_message(join_id, m2).await.unwrap();
    fx.joins.mark_completed(m1).await.unwrap();
    fx.joins.mark_failed(m2).await.unwrap();

    fx.api
        .enqueue_join_wait(
            JoinWaitCommand::new(join_id, false)
                .on_complete("C", "c")
                .on_fail("F", "f"),
        )
        .await
        .unwrap();

    let dispatcher = wait_dispatcher(&fx, vec![]);
    dispatcher
        .run_once(fx.outbox.as_ref(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fx.store.outbox_rows_by_topic("C").len(), 1);
    assert!(fx.store.outbox_rows_by_topic("F").is_empty());
    assert_eq!(
        fx.joins.get_join(join_id).await.unwrap().unwrap().status,
        JoinStatus::Completed
    );
}

#[tokio::test]
async fn wait_without_continuation_just_settles_the_join() {
    let fx = fixture();
    let join_id = fx.api.start_join(None, 1, None).await.unwrap();
    let m1 = MessageId::random();
    fx.api.attach_message(join_id, m1).await.unwrap();
    fx.joins.mark_completed(m1).await.unwrap();

    let wait = fx
        .api
        .enqueue_join_wait(JoinWaitCommand::new(join_id, true))
        .await
        .unwrap();
    let dispatcher = wait_dispatcher(&fx, vec![]);
    dispatcher
        .run_once(fx.outbox.as_ref(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        fx.store.outbox_row(wait.work_item_id).unwrap().status,
        OutboxStatus::Done
    );
    assert_eq!(
        fx.joins.get_join(join_id).await.unwrap().unwrap().status,
        JoinStatus::Completed
    );
}

#[tokio::test]
async fn wait_against_a_missing_join_fails_permanently() {
    let fx = fixture();
    let wait = fx
        .api
        .enqueue_join_wait(JoinWaitCommand::new(relay_core::JoinId::random(), true))
        .await
        .unwrap();

    let dispatcher = wait_dispatcher(&fx, vec![]);
    dispatcher
        .run_once(fx.outbox.as_ref(), &CancellationToken::new())
        .await
        .unwrap();

    let row = fx.store.outbox_row(wait.work_item_id).unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.retry_count, 0);
    assert!(row.last_error.as_deref().unwrap().contains("does not exist"));
}

#[tokio::test]
async fn malformed_wait_payload_fails_permanently() {
    let fx = fixture();
    let wait = fx
        .outbox
        .enqueue(NewOutboxMessage::new(JOIN_WAIT_TOPIC, "not json"))
        .await
        .unwrap();

    let dispatcher = wait_dispatcher(&fx, vec![]);
    dispatcher
        .run_once(fx.outbox.as_ref(), &CancellationToken::new())
        .await
        .unwrap();

    let row = fx.store.outbox_row(wait.work_item_id).unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.retry_count, 0);
}

#[tokio::test]
async fn terminal_joins_are_immutable() {
    let fx = fixture();
    let join_id = fx.api.start_join(None, 1, None).await.unwrap();

    fx.joins
        .update_status(join_id, JoinStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(
        fx.joins.get_join(join_id).await.unwrap().unwrap().status,
        JoinStatus::Cancelled
    );

    fx.joins
        .update_status(join_id, JoinStatus::Completed)
        .await
        .unwrap();
    assert_eq!(
        fx.joins.get_join(join_id).await.unwrap().unwrap().status,
        JoinStatus::Cancelled
    );
}

#[tokio::test]
async fn counters_never_exceed_expected_steps() {
    let fx = fixture();
    let join_id = fx.api.start_join(None, 1, None).await.unwrap();
    // Two members on a one-step join: only the first settlement counts.
    let m1 = MessageId::random();
    let m2 = MessageId::random();
    fx.api.attach_message(join_id, m1).await.unwrap();
    fx.api.attach_message(join_id, m2).await.unwrap();

    fx.joins.mark_completed(m1).await.unwrap();
    fx.joins.mark_failed(m2).await.unwrap();

    let join = fx.joins.get_join(join_id).await.unwrap().unwrap();
    assert_eq!(join.completed_steps + join.failed_steps, 1);
    assert!(join.completed_steps + join.failed_steps <= join.expected_steps);
}
