use async_trait::async_trait;
use cadence::{FrameworkError, MessageSender, OutboundMessage};

/// Writes step messages to the log instead of a messaging provider
pub struct LogSender;

#[async_trait]
impl MessageSender for LogSender {
    async fn send(&self, message: &OutboundMessage) -> Result<(), FrameworkError> {
        tracing::info!(
            follow_up_id = message.follow_up_id,
            rule_id = message.rule_id,
            client_id = message.client_id,
            workspace_id = message.workspace_id,
            content = %message.content,
            "follow-up message"
        );
        Ok(())
    }
}
