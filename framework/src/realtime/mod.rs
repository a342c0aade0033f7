//! Live dashboard updates
//!
//! Publishing goes through the [`NotificationBus`]; with Redis configured it
//! `PUBLISH`es so every process sees the event. Each process keeps one
//! [`ChannelRegistry`] of connected sinks and one shared upstream connection
//! holding just the subscriptions those sinks need. A dispatcher task routes
//! upstream messages to the sinks by exact channel name.
//!
//! Without Redis everything stays in-process: the bus delivers directly into
//! the registry and the upstream is a no-op.
//!
//! ```rust,ignore
//! let (realtime, tasks) = Realtime::connect(&RealtimeConfig::from_env()).await?;
//!
//! let (sink, rx) = Sink::channel(64);
//! let _guard = realtime.registry.register_guarded(&ChannelName::workspace(1), sink);
//!
//! realtime.bus.notify(&ChannelName::workspace(1), ServerEvent::new("ping", json!({}))).await;
//! ```

pub mod bus;
pub mod channel;
pub mod event;
pub mod registry;
pub mod upstream;

pub use bus::{LocalTransport, NotificationBus, RedisTransport, Transport};
pub use channel::{ChannelName, Topic, CONVERSATION_PATTERN};
pub use event::{keep_alive_frame, ServerEvent, CONNECTION_READY};
pub use registry::{spawn_dispatcher, ChannelRegistry, Sink, SinkGuard, SinkId};
pub use upstream::{InboundMessage, LocalUpstream, RedisUpstream, Upstream};

use crate::config::RealtimeConfig;
use crate::error::FrameworkError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const INBOUND_CAPACITY: usize = 1024;

/// Registry and bus wired to the same transport
#[derive(Clone)]
pub struct Realtime {
    pub registry: Arc<ChannelRegistry>,
    pub bus: NotificationBus,
}

impl Realtime {
    /// Single-process wiring
    pub fn local() -> Self {
        let registry = Arc::new(ChannelRegistry::new(Arc::new(LocalUpstream)));
        let bus = NotificationBus::local(registry.clone());
        Self { registry, bus }
    }

    /// Wire to Redis when `REDIS_URL` is set, otherwise run locally
    ///
    /// Returns the background tasks (upstream connection and dispatcher).
    pub async fn connect(
        config: &RealtimeConfig,
    ) -> Result<(Self, Vec<JoinHandle<()>>), FrameworkError> {
        let Some(url) = config.redis_url.as_deref() else {
            tracing::info!("realtime running in-process (no REDIS_URL)");
            return Ok((Self::local(), Vec::new()));
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (upstream, upstream_task) = RedisUpstream::spawn(url, inbound_tx)?;
        let registry = Arc::new(ChannelRegistry::new(Arc::new(upstream)));
        let dispatcher = spawn_dispatcher(registry.clone(), inbound_rx);
        let bus = NotificationBus::new(Arc::new(RedisTransport::connect(url).await?));

        tracing::info!("realtime connected to redis");
        Ok((Self { registry, bus }, vec![upstream_task, dispatcher]))
    }

    /// Open a sink on `channel` and keep it registered while the guard lives
    pub fn open(
        &self,
        channel: &ChannelName,
        capacity: usize,
    ) -> Option<(SinkGuard, mpsc::Receiver<Arc<ServerEvent>>)> {
        let (sink, rx) = Sink::channel(capacity);
        let guard = self.registry.register_guarded(channel, sink)?;
        Some((guard, rx))
    }
}
