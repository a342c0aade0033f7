//! Publishing side of the live update pipeline

use crate::error::FrameworkError;
use crate::realtime::channel::ChannelName;
use crate::realtime::event::ServerEvent;
use crate::realtime::registry::ChannelRegistry;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;

/// Where published payloads go
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), FrameworkError>;
}

/// Publish through Redis so every process's registry sees the event
#[derive(Clone)]
pub struct RedisTransport {
    conn: ConnectionManager,
}

impl RedisTransport {
    pub async fn connect(redis_url: &str) -> Result<Self, FrameworkError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), FrameworkError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        tracing::trace!(channel, receivers, "published");
        Ok(())
    }
}

/// Deliver straight into this process's registry
#[derive(Clone)]
pub struct LocalTransport {
    registry: Arc<ChannelRegistry>,
}

impl LocalTransport {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), FrameworkError> {
        let event = ServerEvent::from_payload(&payload)?;
        self.registry.deliver(channel, Arc::new(event));
        Ok(())
    }
}

/// Publishes events to channels
#[derive(Clone)]
pub struct NotificationBus {
    transport: Arc<dyn Transport>,
}

impl NotificationBus {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Bus that delivers only within this process
    pub fn local(registry: Arc<ChannelRegistry>) -> Self {
        Self::new(Arc::new(LocalTransport::new(registry)))
    }

    pub async fn publish(
        &self,
        channel: &ChannelName,
        event: &ServerEvent,
    ) -> Result<(), FrameworkError> {
        self.transport
            .publish(channel.as_str(), event.to_payload())
            .await
    }

    /// Publish, logging instead of failing
    ///
    /// For notifications that follow an already committed state change.
    pub async fn notify(&self, channel: &ChannelName, event: ServerEvent) {
        if let Err(err) = self.publish(channel, &event).await {
            tracing::warn!(
                channel = %channel,
                event = %event.kind,
                error = %err,
                "notification not published"
            );
        }
    }
}
