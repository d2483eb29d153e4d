//! Handler for the reserved `join.wait` topic.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use relay_core::{
    Delivery, Handler, HandlerError, JoinStatus, JoinStore, JoinWaitCommand, NewOutboxMessage,
    OutboxStore, JOIN_WAIT_TOPIC,
};

/// Inspects a join once its wait message comes up for dispatch and emits
/// the configured continuation.
///
/// While steps are still outstanding the handler raises
/// [`HandlerError::JoinNotReady`], which the dispatcher treats as a plain
/// retry. A missing join is permanent: a wait message referencing nothing
/// will never start succeeding.
pub struct JoinWaitHandler {
    joins: Arc<dyn JoinStore>,
    outbox: Arc<dyn OutboxStore>,
}

impl JoinWaitHandler {
    pub fn new(joins: Arc<dyn JoinStore>, outbox: Arc<dyn OutboxStore>) -> Self {
        Self { joins, outbox }
    }
}

#[async_trait]
impl Handler for JoinWaitHandler {
    fn topic(&self) -> &str {
        JOIN_WAIT_TOPIC
    }

    async fn handle(
        &self,
        delivery: &Delivery,
        _cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let command = JoinWaitCommand::from_json(&delivery.payload)?;

        let Some(join) = self.joins.get_join(command.join_id).await? else {
            return Err(HandlerError::permanent(format!(
                "join {} does not exist",
                command.join_id
            )));
        };

        // A terminal join means an earlier run already settled everything;
        // replays (including crash recovery) stop here.
        if join.is_terminal() {
            return Ok(());
        }

        if !join.all_steps_settled() {
            return Err(HandlerError::JoinNotReady(command.join_id));
        }

        let failed = command.fail_if_any_step_failed && join.failed_steps > 0;
        let (topic, payload) = if failed {
            (command.on_fail_topic, command.on_fail_payload)
        } else {
            (command.on_complete_topic, command.on_complete_payload)
        };

        // Continuation first, status second: if we crash in between, the
        // retry re-runs the whole handler and the terminal check above turns
        // it into a no-op. Consumers tolerate the duplicate continuation;
        // the reverse order could strand the workflow with a terminal join
        // and no continuation.
        if let Some(topic) = topic {
            let mut msg = NewOutboxMessage::new(topic, payload.unwrap_or_default());
            msg.correlation_id = delivery.correlation_id.clone();
            self.outbox.enqueue(msg).await?;
        }

        let status = if failed {
            JoinStatus::Failed
        } else {
            JoinStatus::Completed
        };
        self.joins.update_status(command.join_id, status).await?;
        Ok(())
    }
}
