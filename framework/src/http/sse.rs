//! `text/event-stream` response bodies

use crate::realtime::{keep_alive_frame, ServerEvent, SinkGuard};
use bytes::Bytes;
use hyper::body::{Body, Frame};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Body that streams a registered sink's events
///
/// Owns the [`SinkGuard`], so the sink is unregistered as soon as hyper
/// drops the body: client disconnect, write error, or server shutdown.
/// Ends when the registry drops the sink.
pub struct EventStream {
    rx: mpsc::Receiver<Arc<ServerEvent>>,
    keep_alive: Interval,
    _guard: SinkGuard,
}

impl EventStream {
    pub fn new(
        guard: SinkGuard,
        rx: mpsc::Receiver<Arc<ServerEvent>>,
        keep_alive: Duration,
    ) -> Self {
        let mut keep_alive = interval_at(Instant::now() + keep_alive, keep_alive);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            rx,
            keep_alive,
            _guard: guard,
        }
    }
}

impl Body for EventStream {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        let this = self.get_mut();

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                this.keep_alive.reset();
                return Poll::Ready(Some(Ok(Frame::data(event.encode()))));
            }
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => {}
        }

        match this.keep_alive.poll_tick(cx) {
            Poll::Ready(_) => Poll::Ready(Some(Ok(Frame::data(keep_alive_frame())))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::{ChannelName, ChannelRegistry, Sink};
    use crate::testing::RecordingUpstream;
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry() -> Arc<ChannelRegistry> {
        Arc::new(ChannelRegistry::new(Arc::new(RecordingUpstream::default())))
    }

    async fn next_frame(stream: &mut EventStream) -> Option<Bytes> {
        stream
            .frame()
            .await
            .map(|frame| frame.unwrap().into_data().unwrap())
    }

    #[tokio::test]
    async fn streams_ready_then_events() {
        let registry = registry();
        let channel = ChannelName::workspace(4);
        let (sink, rx) = Sink::channel(8);
        let guard = registry.register_guarded(&channel, sink).unwrap();
        let mut stream = EventStream::new(guard, rx, Duration::from_secs(60));

        assert_eq!(
            next_frame(&mut stream).await.unwrap(),
            Bytes::from("event: connection_ready\ndata: {\"channel\":\"workspace:4\"}\n\n")
        );

        registry.deliver(channel.as_str(), Arc::new(ServerEvent::new("ping", json!({}))));
        assert_eq!(
            next_frame(&mut stream).await.unwrap(),
            Bytes::from("event: ping\ndata: {\"type\":\"ping\"}\n\n")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_streams_get_keep_alive_comments() {
        let registry = registry();
        let (sink, rx) = Sink::channel(8);
        let guard = registry
            .register_guarded(&ChannelName::workspace(4), sink)
            .unwrap();
        let mut stream = EventStream::new(guard, rx, Duration::from_secs(15));

        next_frame(&mut stream).await.unwrap();
        assert_eq!(
            next_frame(&mut stream).await.unwrap(),
            Bytes::from(": keep-alive\n\n")
        );
    }

    #[tokio::test]
    async fn dropping_the_body_unregisters() {
        let registry = registry();
        let channel = ChannelName::workspace(4);
        let (sink, rx) = Sink::channel(8);
        let guard = registry.register_guarded(&channel, sink).unwrap();
        let stream = EventStream::new(guard, rx, Duration::from_secs(60));
        assert_eq!(registry.sink_count(&channel), 1);

        drop(stream);
        assert_eq!(registry.sink_count(&channel), 0);
    }
}
