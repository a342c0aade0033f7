//! Runs a sequence step when its queue job fires

use crate::error::FrameworkError;
use crate::queue::{ClaimedJob, JobHandler};
use crate::realtime::{ChannelName, NotificationBus, ServerEvent};
use crate::sequence::engine::SequenceEngine;
use crate::sequence::rules;
use crate::sequence::types::{FollowUpStatus, Outcome, SequenceError};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

/// A step's message, addressed to its client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub follow_up_id: i64,
    pub rule_id: i64,
    pub client_id: i64,
    pub workspace_id: i64,
    pub content: String,
}

/// Delivers step messages
///
/// An error is treated as transient and the step is retried, so a sender
/// may see the same message more than once.
#[async_trait]
pub trait MessageSender: Send + Sync + 'static {
    async fn send(&self, message: &OutboundMessage) -> Result<(), FrameworkError>;
}

/// Queue handler for step jobs
///
/// Jobs can fire late, twice, or after their follow-up moved on. Before
/// sending, the executor checks that the follow-up is still ACTIVE and that
/// this job is the step in flight; anything else completes the job without
/// side effects.
pub struct StepExecutor {
    engine: SequenceEngine,
    sender: Arc<dyn MessageSender>,
    bus: NotificationBus,
}

impl StepExecutor {
    pub fn new(engine: SequenceEngine, sender: Arc<dyn MessageSender>, bus: NotificationBus) -> Self {
        Self {
            engine,
            sender,
            bus,
        }
    }

    async fn outbound_for(&self, job: &ClaimedJob) -> Result<Option<OutboundMessage>, FrameworkError> {
        let payload = job.payload()?;

        let Some(follow_up) = self.engine.find(payload.follow_up_id).await? else {
            tracing::debug!(job_id = %job.job_id, "follow-up is gone; step dropped");
            return Ok(None);
        };

        if FollowUpStatus::from_str(&follow_up.status) != Some(FollowUpStatus::Active) {
            tracing::debug!(job_id = %job.job_id, status = %follow_up.status, "follow-up not active; step dropped");
            return Ok(None);
        }
        if follow_up.last_rule_id != Some(payload.rule_id)
            || follow_up.active_job_id.as_deref() != Some(job.job_id.as_str())
        {
            tracing::debug!(job_id = %job.job_id, "job is not the step in flight; dropped");
            return Ok(None);
        }

        let Some(rule) = rules::find(self.engine.db().inner(), payload.rule_id).await? else {
            tracing::warn!(job_id = %job.job_id, rule_id = payload.rule_id, "rule was deleted; step dropped");
            return Ok(None);
        };
        if rule.workspace_id != follow_up.workspace_id {
            tracing::warn!(job_id = %job.job_id, rule_id = rule.id, "rule belongs to another workspace; step dropped");
            return Ok(None);
        }

        Ok(Some(OutboundMessage {
            follow_up_id: follow_up.id,
            rule_id: rule.id,
            client_id: follow_up.client_id,
            workspace_id: follow_up.workspace_id,
            content: rule.message_content,
        }))
    }
}

#[async_trait]
impl JobHandler for StepExecutor {
    async fn handle(&self, job: &ClaimedJob) -> Result<(), FrameworkError> {
        let Some(message) = self.outbound_for(job).await? else {
            return Ok(());
        };

        self.sender.send(&message).await?;

        self.bus
            .notify(
                &ChannelName::conversation(message.client_id),
                ServerEvent::new("message.sent", json!({ "message": message })),
            )
            .await;

        match self
            .engine
            .advance_after_step(message.follow_up_id, message.rule_id)
            .await
        {
            Ok(Outcome::Skipped { reason, .. }) => {
                tracing::info!(job_id = %job.job_id, reason, "step sent but follow-up moved on");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(SequenceError::Infrastructure(err)) => Err(err),
            Err(err) => {
                tracing::warn!(job_id = %job.job_id, error = %err, "advance after step rejected");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::{JobId, JobQueue, QueueWorker};
    use crate::realtime::{Realtime, Sink};
    use crate::testing::{RecordingSender, TestDatabase};
    use pretty_assertions::assert_eq;

    const HOUR_MS: i64 = 3_600_000;

    struct Fixture {
        db: TestDatabase,
        engine: SequenceEngine,
        sender: Arc<RecordingSender>,
        worker: QueueWorker,
        realtime: Realtime,
    }

    async fn fixture(delays: &[i64], sender: RecordingSender) -> Fixture {
        let db = TestDatabase::fresh().await.expect("test db");
        for (i, delay) in delays.iter().enumerate() {
            rules::create(db.conn(), 1, *delay, format!("step {}", i + 1))
                .await
                .unwrap();
        }
        let realtime = Realtime::local();
        let queue = JobQueue::new(QueueConfig::builder().max_attempts(3).backoff_secs(60).build());
        let engine = SequenceEngine::new(db.connection(), queue.clone(), realtime.bus.clone());
        let sender = Arc::new(sender);
        let executor = StepExecutor::new(engine.clone(), sender.clone(), realtime.bus.clone());
        let worker = QueueWorker::new(db.connection(), queue, Arc::new(executor));
        Fixture {
            db,
            engine,
            sender,
            worker,
            realtime,
        }
    }

    #[tokio::test]
    async fn due_step_sends_and_schedules_the_next() {
        let fx = fixture(&[0, HOUR_MS], RecordingSender::default()).await;
        let rules = rules::ordered_for_workspace(fx.db.conn(), 1).await.unwrap();
        let start = fx.engine.start(42, 1).await.unwrap();
        let id = start.follow_up().unwrap().id;

        assert_eq!(fx.worker.run_once().await.unwrap(), 1);

        let sent = fx.sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "step 1");
        assert_eq!(sent[0].client_id, 42);

        let current = fx.engine.find(id).await.unwrap().unwrap();
        assert_eq!(current.status, "ACTIVE");
        assert_eq!(current.current_step_order, 2);
        assert_eq!(
            current.active_job_id,
            Some(JobId::for_step(id, rules[1].id).to_string())
        );

        let fired = fx
            .engine
            .queue()
            .find(fx.db.conn(), &JobId::for_step(id, rules[0].id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired.status, "completed");

        // The next step is an hour out.
        assert_eq!(fx.worker.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn last_step_completes_the_follow_up() {
        let fx = fixture(&[0], RecordingSender::default()).await;
        let id = fx.engine.start(42, 1).await.unwrap().follow_up().unwrap().id;

        fx.worker.run_once().await.unwrap();

        let current = fx.engine.find(id).await.unwrap().unwrap();
        assert_eq!(current.status, "COMPLETED");
        assert_eq!(current.next_step_at, None);
    }

    #[tokio::test]
    async fn redelivered_job_does_not_send_twice() {
        let fx = fixture(&[0, HOUR_MS], RecordingSender::default()).await;
        let rules = rules::ordered_for_workspace(fx.db.conn(), 1).await.unwrap();
        let id = fx.engine.start(42, 1).await.unwrap().follow_up().unwrap().id;
        fx.worker.run_once().await.unwrap();

        let executor = StepExecutor::new(
            fx.engine.clone(),
            fx.sender.clone(),
            fx.realtime.bus.clone(),
        );
        let stale = ClaimedJob {
            id: 0,
            job_id: JobId::for_step(id, rules[0].id),
            payload: serde_json::to_string(&crate::queue::JobPayload {
                follow_up_id: id,
                rule_id: rules[0].id,
                workspace_id: 1,
            })
            .unwrap(),
            attempts: 2,
            max_attempts: 3,
            worker_id: "w-stale".to_string(),
        };
        executor.handle(&stale).await.unwrap();

        assert_eq!(fx.sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn job_for_a_paused_follow_up_is_a_no_op() {
        let fx = fixture(&[0], RecordingSender::default()).await;
        let start = fx.engine.start(42, 1).await.unwrap();
        let follow_up = start.follow_up().unwrap().clone();
        let job_id = JobId::parse(follow_up.active_job_id.as_deref().unwrap()).unwrap();

        // Claim before pausing so the job is already in a worker's hands.
        let claimed = fx
            .engine
            .queue()
            .claim_next(fx.db.conn(), "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.job_id, JobId::for_step(job_id.0, job_id.1));
        fx.engine.pause(follow_up.id, 1).await.unwrap();

        let executor = StepExecutor::new(
            fx.engine.clone(),
            fx.sender.clone(),
            fx.realtime.bus.clone(),
        );
        executor.handle(&claimed).await.unwrap();

        assert!(fx.sender.sent().is_empty());
        let current = fx.engine.find(follow_up.id).await.unwrap().unwrap();
        assert_eq!(current.status, "PAUSED");
    }

    #[tokio::test]
    async fn send_failure_is_retried() {
        let fx = fixture(&[0], RecordingSender::failing("provider down")).await;
        let id = fx.engine.start(42, 1).await.unwrap().follow_up().unwrap().id;

        fx.worker.run_once().await.unwrap();

        let jobs = fx.engine.queue().pending_for(fx.db.conn(), id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempts, 1);
        assert_eq!(
            jobs[0].last_error.as_deref(),
            Some("Delivery failed: provider down")
        );

        let current = fx.engine.find(id).await.unwrap().unwrap();
        assert_eq!(current.current_step_order, 1);
    }

    #[tokio::test]
    async fn sent_messages_show_up_on_the_conversation_channel() {
        let fx = fixture(&[0], RecordingSender::default()).await;
        let (sink, mut rx) = Sink::channel(8);
        fx.realtime
            .registry
            .register(&ChannelName::conversation(42), sink);
        rx.recv().await.unwrap();

        fx.engine.start(42, 1).await.unwrap();
        fx.worker.run_once().await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "message.sent");
        assert_eq!(event.data["message"]["content"], "step 1");
    }
}
