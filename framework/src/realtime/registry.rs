//! Per-process registry of connected dashboard sinks
//!
//! Every open stream registers a [`Sink`] under a channel name. The registry
//! keeps a reference count per upstream [`Topic`] so the process holds an
//! upstream subscription exactly while some channel it covers has sinks.
//! All bookkeeping, including the upstream calls that follow a count
//! crossing zero, happens under one lock, so a subscribe can never overtake
//! the unsubscribe that preceded it.

use crate::realtime::channel::{ChannelName, Topic};
use crate::realtime::event::ServerEvent;
use crate::realtime::upstream::{InboundMessage, Upstream};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one registered sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

/// Push destination for one connected client
///
/// Bounded: a client that stops reading fills its buffer and is dropped from
/// the registry instead of holding up everyone else.
#[derive(Debug, Clone)]
pub struct Sink {
    id: SinkId,
    tx: mpsc::Sender<Arc<ServerEvent>>,
}

impl Sink {
    /// A new sink and the receiving end the stream reads from
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<ServerEvent>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = SinkId(NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed));
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> SinkId {
        self.id
    }

    fn push(&self, event: Arc<ServerEvent>) -> bool {
        self.tx.try_send(event).is_ok()
    }
}

#[derive(Default)]
struct State {
    channels: HashMap<String, HashMap<SinkId, Sink>>,
    topics: HashMap<Topic, usize>,
}

/// Channel name → sinks, plus upstream topic ref counts
pub struct ChannelRegistry {
    state: Mutex<State>,
    upstream: Arc<dyn Upstream>,
}

impl ChannelRegistry {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            upstream,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a sink to a channel
    ///
    /// The sink receives `connection_ready` before anything else. Returns
    /// `false` if the sink was already closed and nothing was registered.
    pub fn register(&self, channel: &ChannelName, sink: Sink) -> bool {
        if !sink.push(Arc::new(ServerEvent::connection_ready(channel))) {
            return false;
        }

        let mut state = self.lock();
        let sinks = state.channels.entry(channel.as_str().to_string()).or_default();
        let first = sinks.is_empty();
        sinks.insert(sink.id(), sink);

        if first {
            let topic = channel.topic();
            let count = state.topics.entry(topic.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                tracing::debug!(%topic, "upstream subscribe");
                self.upstream.subscribe(&topic);
            }
        }
        true
    }

    /// Register and get a guard that unregisters on drop
    pub fn register_guarded(
        self: &Arc<Self>,
        channel: &ChannelName,
        sink: Sink,
    ) -> Option<SinkGuard> {
        let sink_id = sink.id();
        self.register(channel, sink).then(|| SinkGuard {
            registry: Arc::clone(self),
            channel: channel.clone(),
            sink_id,
        })
    }

    /// Remove a sink; unknown or already removed sinks are ignored
    pub fn unregister(&self, channel: &ChannelName, sink_id: SinkId) {
        let mut state = self.lock();
        let emptied = match state.channels.get_mut(channel.as_str()) {
            Some(sinks) => sinks.remove(&sink_id).is_some() && sinks.is_empty(),
            None => false,
        };
        if emptied {
            self.release_channel(&mut state, channel.as_str());
        }
    }

    /// Push an event to every sink of a channel
    ///
    /// Full or closed sinks are removed. Returns how many sinks got the event.
    pub fn deliver(&self, channel: &str, event: Arc<ServerEvent>) -> usize {
        let mut state = self.lock();
        let Some(sinks) = state.channels.get_mut(channel) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, sink) in sinks.iter() {
            if sink.push(Arc::clone(&event)) {
                delivered += 1;
            } else {
                dead.push(*id);
            }
        }

        if !dead.is_empty() {
            tracing::debug!(channel, dropped = dead.len(), "dropping slow or closed sinks");
            for id in &dead {
                sinks.remove(id);
            }
            if sinks.is_empty() {
                self.release_channel(&mut state, channel);
            }
        }

        delivered
    }

    fn release_channel(&self, state: &mut State, channel: &str) {
        state.channels.remove(channel);

        let topic = ChannelName::new(channel).topic();
        let remaining = match state.topics.get_mut(&topic) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        if remaining == 0 {
            state.topics.remove(&topic);
            tracing::debug!(%topic, "upstream unsubscribe");
            self.upstream.unsubscribe(&topic);
        }
    }

    pub fn sink_count(&self, channel: &ChannelName) -> usize {
        self.lock()
            .channels
            .get(channel.as_str())
            .map_or(0, HashMap::len)
    }

    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    /// Whether the upstream subscription for `topic` is held
    pub fn is_subscribed(&self, topic: &Topic) -> bool {
        self.lock().topics.contains_key(topic)
    }
}

/// Keeps a sink registered for as long as it lives
///
/// Dropping it, on any exit path of the stream, unregisters the sink.
pub struct SinkGuard {
    registry: Arc<ChannelRegistry>,
    channel: ChannelName,
    sink_id: SinkId,
}

impl SinkGuard {
    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    pub fn sink_id(&self) -> SinkId {
        self.sink_id
    }
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.channel, self.sink_id);
    }
}

/// Route upstream messages to local sinks by exact channel name
pub fn spawn_dispatcher(
    registry: Arc<ChannelRegistry>,
    mut inbound: mpsc::Receiver<InboundMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            match ServerEvent::from_payload(&message.payload) {
                Ok(event) => {
                    let delivered = registry.deliver(&message.channel, Arc::new(event));
                    tracing::trace!(channel = %message.channel, delivered, "upstream message dispatched");
                }
                Err(err) => {
                    tracing::warn!(channel = %message.channel, error = %err, "dropping malformed upstream payload");
                }
            }
        }
        tracing::debug!("realtime dispatcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingUpstream, UpstreamCall};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry() -> (Arc<ChannelRegistry>, Arc<RecordingUpstream>) {
        let upstream = Arc::new(RecordingUpstream::default());
        let registry = Arc::new(ChannelRegistry::new(upstream.clone()));
        (registry, upstream)
    }

    fn event(kind: &str) -> Arc<ServerEvent> {
        Arc::new(ServerEvent::new(kind, json!({})))
    }

    #[tokio::test]
    async fn two_sinks_share_one_upstream_subscription() {
        let (registry, upstream) = registry();
        let channel = ChannelName::workspace(1);
        let topic = channel.topic();

        let (a, mut rx_a) = Sink::channel(8);
        let (b, mut rx_b) = Sink::channel(8);
        let (a_id, b_id) = (a.id(), b.id());
        assert!(registry.register(&channel, a));
        assert!(registry.register(&channel, b));
        assert_eq!(upstream.calls(), vec![UpstreamCall::Subscribe(topic.clone())]);

        assert_eq!(rx_a.recv().await.unwrap().kind, "connection_ready");
        assert_eq!(rx_b.recv().await.unwrap().kind, "connection_ready");

        assert_eq!(registry.deliver(channel.as_str(), event("x")), 2);
        assert_eq!(rx_a.recv().await.unwrap().kind, "x");
        assert_eq!(rx_b.recv().await.unwrap().kind, "x");

        registry.unregister(&channel, a_id);
        assert!(registry.is_subscribed(&topic));
        assert_eq!(upstream.calls().len(), 1);

        registry.unregister(&channel, b_id);
        assert!(!registry.is_subscribed(&topic));
        assert_eq!(
            upstream.calls(),
            vec![
                UpstreamCall::Subscribe(topic.clone()),
                UpstreamCall::Unsubscribe(topic)
            ]
        );
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let (registry, upstream) = registry();
        let channel = ChannelName::workspace(1);
        let (sink, _rx) = Sink::channel(8);
        let id = sink.id();

        registry.unregister(&channel, id);
        registry.register(&channel, sink);
        registry.unregister(&channel, id);
        registry.unregister(&channel, id);

        assert_eq!(upstream.calls().len(), 2);
        assert_eq!(registry.channel_count(), 0);
    }

    #[tokio::test]
    async fn conversations_ref_count_the_shared_pattern() {
        let (registry, upstream) = registry();
        let first = ChannelName::conversation(1);
        let second = ChannelName::conversation(2);

        let (a, _rx_a) = Sink::channel(8);
        let (b, _rx_b) = Sink::channel(8);
        let (a_id, b_id) = (a.id(), b.id());
        registry.register(&first, a);
        registry.register(&second, b);
        assert_eq!(upstream.calls().len(), 1);

        registry.unregister(&first, a_id);
        assert!(registry.is_subscribed(&second.topic()));

        registry.unregister(&second, b_id);
        assert_eq!(
            upstream.calls().last(),
            Some(&UpstreamCall::Unsubscribe(Topic::Pattern(
                "conversation:*".to_string()
            )))
        );
    }

    #[tokio::test]
    async fn delivery_routes_by_exact_channel() {
        let (registry, _upstream) = registry();
        let (a, mut rx_a) = Sink::channel(8);
        let (b, mut rx_b) = Sink::channel(8);
        registry.register(&ChannelName::conversation(1), a);
        registry.register(&ChannelName::conversation(2), b);
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        assert_eq!(registry.deliver("conversation:2", event("message.sent")), 1);
        assert_eq!(registry.deliver("conversation:3", event("message.sent")), 0);

        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.recv().await.unwrap().kind, "message.sent");
    }

    #[tokio::test]
    async fn slow_sink_is_dropped_without_blocking_others() {
        let (registry, upstream) = registry();
        let channel = ChannelName::workspace(5);

        // Capacity 1 is used up by connection_ready.
        let (slow, _slow_rx) = Sink::channel(1);
        let (fast, mut fast_rx) = Sink::channel(8);
        let fast_id = fast.id();
        registry.register(&channel, slow);
        registry.register(&channel, fast);
        fast_rx.recv().await.unwrap();

        assert_eq!(registry.deliver(channel.as_str(), event("a")), 1);
        assert_eq!(registry.sink_count(&channel), 1);
        assert_eq!(fast_rx.recv().await.unwrap().kind, "a");

        registry.unregister(&channel, fast_id);
        assert_eq!(upstream.calls().len(), 2);
    }

    #[tokio::test]
    async fn closed_sink_is_not_registered() {
        let (registry, upstream) = registry();
        let (sink, rx) = Sink::channel(8);
        drop(rx);

        assert!(!registry.register(&ChannelName::workspace(1), sink));
        assert!(upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn guard_unregisters_on_drop() {
        let (registry, upstream) = registry();
        let channel = ChannelName::workspace(9);
        let (sink, _rx) = Sink::channel(8);

        let guard = registry.register_guarded(&channel, sink).unwrap();
        assert_eq!(registry.sink_count(&channel), 1);

        drop(guard);
        assert_eq!(registry.sink_count(&channel), 0);
        assert!(!registry.is_subscribed(&channel.topic()));
        assert_eq!(upstream.calls().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_sinks_each_get_the_event_once() {
        let (registry, upstream) = registry();
        let channel = ChannelName::workspace(77);
        let mut tasks = Vec::new();

        for _ in 0..32 {
            let registry = registry.clone();
            let channel = channel.clone();
            tasks.push(tokio::spawn(async move {
                let (sink, mut rx) = Sink::channel(8);
                let guard = registry.register_guarded(&channel, sink).unwrap();
                let ready = rx.recv().await.unwrap();
                (guard, ready, rx)
            }));
        }

        let mut connections = Vec::new();
        for task in tasks {
            connections.push(task.await.unwrap());
        }
        assert_eq!(registry.sink_count(&channel), 32);

        assert_eq!(registry.deliver(channel.as_str(), event("tick")), 32);

        let mut handles = Vec::new();
        for (guard, ready, mut rx) in connections {
            assert_eq!(ready.kind, "connection_ready");
            handles.push(tokio::spawn(async move {
                let got = rx.recv().await.unwrap();
                assert!(rx.try_recv().is_err());
                drop(guard);
                got.kind.clone()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "tick");
        }

        assert_eq!(
            upstream.calls(),
            vec![
                UpstreamCall::Subscribe(channel.topic()),
                UpstreamCall::Unsubscribe(channel.topic())
            ]
        );
    }

    #[tokio::test]
    async fn dispatcher_skips_malformed_payloads() {
        let (registry, _upstream) = registry();
        let channel = ChannelName::workspace(2);
        let (sink, mut rx) = Sink::channel(8);
        registry.register(&channel, sink);
        rx.recv().await.unwrap();

        let (tx, inbound) = mpsc::channel(8);
        let dispatcher = spawn_dispatcher(registry.clone(), inbound);

        tx.send(InboundMessage {
            channel: "workspace:2".to_string(),
            payload: "{broken".to_string(),
        })
        .await
        .unwrap();
        tx.send(InboundMessage {
            channel: "workspace:2".to_string(),
            payload: r#"{"type":"follow_up.started","id":1}"#.to_string(),
        })
        .await
        .unwrap();
        drop(tx);
        dispatcher.await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "follow_up.started");
        assert_eq!(event.data["id"], 1);
    }
}
