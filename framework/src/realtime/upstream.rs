//! Upstream pub/sub subscriptions
//!
//! The registry decides *when* a topic is needed; an [`Upstream`] makes it
//! so. Calls are fire-and-forget and must be applied in the order they were
//! made, which is what keeps a quick unsubscribe/subscribe pair from ending
//! up reversed on the wire.

use crate::error::FrameworkError;
use crate::realtime::channel::Topic;
use futures_util::StreamExt;
use redis::aio::PubSubSink;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const RECONNECT_INITIAL: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Owner of the process's upstream subscriptions
pub trait Upstream: Send + Sync + 'static {
    fn subscribe(&self, topic: &Topic);
    fn unsubscribe(&self, topic: &Topic);
}

/// Single-process mode: publishes are delivered locally, nothing to subscribe
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalUpstream;

impl Upstream for LocalUpstream {
    fn subscribe(&self, topic: &Topic) {
        tracing::trace!(%topic, "local upstream subscribe");
    }

    fn unsubscribe(&self, topic: &Topic) {
        tracing::trace!(%topic, "local upstream unsubscribe");
    }
}

/// A message received on the shared upstream connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Originating exact channel, also for pattern matches
    pub channel: String,
    pub payload: String,
}

#[derive(Debug)]
enum Command {
    Subscribe(Topic),
    Unsubscribe(Topic),
}

/// Redis pub/sub upstream
///
/// One task owns the pub/sub connection. It applies subscription commands in
/// order, forwards every message to `inbound`, and on connection loss
/// reconnects with backoff and re-subscribes whatever is currently wanted.
#[derive(Debug, Clone)]
pub struct RedisUpstream {
    commands: mpsc::UnboundedSender<Command>,
}

impl RedisUpstream {
    /// Start the connection task
    ///
    /// The task ends once every `RedisUpstream` handle is dropped or the
    /// inbound receiver goes away.
    pub fn spawn(
        redis_url: &str,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Result<(Self, JoinHandle<()>), FrameworkError> {
        let client = redis::Client::open(redis_url)?;
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_connection(client, rx, inbound));
        Ok((Self { commands }, handle))
    }

    fn send(&self, command: Command) {
        if let Err(err) = self.commands.send(command) {
            tracing::warn!(command = ?err.0, "upstream task is gone; command dropped");
        }
    }
}

impl Upstream for RedisUpstream {
    fn subscribe(&self, topic: &Topic) {
        self.send(Command::Subscribe(topic.clone()));
    }

    fn unsubscribe(&self, topic: &Topic) {
        self.send(Command::Unsubscribe(topic.clone()));
    }
}

enum Next {
    Command(Option<Command>),
    Message(Option<redis::Msg>),
}

async fn run_connection(
    client: redis::Client,
    mut commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::Sender<InboundMessage>,
) {
    let mut wanted: HashSet<Topic> = HashSet::new();
    let mut backoff = RECONNECT_INITIAL;

    loop {
        let (mut sink, mut messages) = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub.split(),
            Err(err) => {
                tracing::warn!(error = %err, retry_in_ms = backoff.as_millis() as u64, "upstream connect failed");
                let sleep = tokio::time::sleep(backoff);
                tokio::pin!(sleep);
                // Keep tracking wanted topics while disconnected.
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        command = commands.recv() => match command {
                            Some(command) => track(&mut wanted, &command),
                            None => return,
                        },
                    }
                }
                backoff = (backoff * 2).min(RECONNECT_MAX);
                continue;
            }
        };

        backoff = RECONNECT_INITIAL;
        for topic in &wanted {
            if let Err(err) = apply(&mut sink, &Command::Subscribe(topic.clone())).await {
                tracing::warn!(%topic, error = %err, "upstream resubscribe failed");
            }
        }
        tracing::info!(topics = wanted.len(), "upstream connected");

        // The stream buffers frames on its own, so a command arriving mid-read
        // loses nothing.
        loop {
            let next = tokio::select! {
                command = commands.recv() => Next::Command(command),
                message = messages.next() => Next::Message(message),
            };

            match next {
                Next::Command(None) => return,
                Next::Command(Some(command)) => {
                    track(&mut wanted, &command);
                    // Local bookkeeping stays; the topic is retried on reconnect.
                    if let Err(err) = apply(&mut sink, &command).await {
                        tracing::warn!(command = ?command, error = %err, "upstream command failed");
                    }
                }
                Next::Message(Some(message)) => {
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(err) => {
                            tracing::warn!(error = %err, "undecodable upstream payload");
                            continue;
                        }
                    };
                    let message = InboundMessage {
                        channel: message.get_channel_name().to_string(),
                        payload,
                    };
                    if inbound.send(message).await.is_err() {
                        return;
                    }
                }
                Next::Message(None) => {
                    tracing::warn!("upstream connection lost; reconnecting");
                    break;
                }
            }
        }
    }
}

fn track(wanted: &mut HashSet<Topic>, command: &Command) {
    match command {
        Command::Subscribe(topic) => {
            wanted.insert(topic.clone());
        }
        Command::Unsubscribe(topic) => {
            wanted.remove(topic);
        }
    }
}

async fn apply(sink: &mut PubSubSink, command: &Command) -> redis::RedisResult<()> {
    match command {
        Command::Subscribe(Topic::Pattern(pattern)) => sink.psubscribe(pattern).await,
        Command::Subscribe(Topic::Exact(channel)) => sink.subscribe(channel).await,
        Command::Unsubscribe(Topic::Pattern(pattern)) => sink.punsubscribe(pattern).await,
        Command::Unsubscribe(Topic::Exact(channel)) => sink.unsubscribe(channel).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Server side of one client connection, speaking just enough RESP2
    struct FakeRedis {
        conn: BufReader<TcpStream>,
    }

    impl FakeRedis {
        async fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
            Self {
                conn: BufReader::new(stream),
            }
        }

        async fn read_command(&mut self) -> Option<Vec<String>> {
            let mut line = String::new();
            if self.conn.read_line(&mut line).await.ok()? == 0 {
                return None;
            }
            let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;
            let mut args = Vec::with_capacity(count);
            for _ in 0..count {
                line.clear();
                self.conn.read_line(&mut line).await.ok()?;
                let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
                let mut arg = vec![0; len + 2];
                self.conn.read_exact(&mut arg).await.ok()?;
                arg.truncate(len);
                args.push(String::from_utf8(arg).ok()?);
            }
            Some(args)
        }

        /// Next (un)subscribe command; connection setup commands get `+OK`
        async fn next_subscription(&mut self) -> Vec<String> {
            loop {
                let command = timeout(WAIT, self.read_command())
                    .await
                    .unwrap()
                    .expect("client hung up");
                if command[0].to_ascii_lowercase().contains("subscribe") {
                    return command;
                }
                self.write(b"+OK\r\n").await;
            }
        }

        /// Confirm a subscribe command the way Redis does
        async fn ack(&mut self, command: &[String]) {
            let kind = command[0].to_ascii_lowercase();
            let frame = format!("*3\r\n{}{}:1\r\n", bulk(&kind), bulk(&command[1]));
            self.write(frame.as_bytes()).await;
        }

        async fn write(&mut self, bytes: &[u8]) {
            self.conn.get_mut().write_all(bytes).await.unwrap();
        }
    }

    fn bulk(value: &str) -> String {
        format!("${}\r\n{}\r\n", value.len(), value)
    }

    fn message(channel: &str, payload: &str) -> String {
        format!("*3\r\n{}{}{}", bulk("message"), bulk(channel), bulk(payload))
    }

    fn pmessage(pattern: &str, channel: &str, payload: &str) -> String {
        format!(
            "*4\r\n{}{}{}{}",
            bulk("pmessage"),
            bulk(pattern),
            bulk(channel),
            bulk(payload)
        )
    }

    async fn start() -> (
        TcpListener,
        RedisUpstream,
        mpsc::Receiver<InboundMessage>,
        JoinHandle<()>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("redis://{}/", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::channel(16);
        let (upstream, handle) = RedisUpstream::spawn(&url, tx).unwrap();
        (listener, upstream, rx, handle)
    }

    async fn recv(rx: &mut mpsc::Receiver<InboundMessage>) -> InboundMessage {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    fn exact(channel: &str) -> Topic {
        Topic::Exact(channel.to_string())
    }

    #[tokio::test]
    async fn a_burst_of_messages_is_forwarded_whole() {
        let (listener, upstream, mut rx, _task) = start().await;
        let mut server = FakeRedis::accept(&listener).await;

        upstream.subscribe(&exact("workspace:1"));
        let command = server.next_subscription().await;
        assert_eq!(command, vec!["SUBSCRIBE", "workspace:1"]);
        server.ack(&command).await;

        let burst: String = (0..3)
            .map(|n| message("workspace:1", &format!("{{\"type\":\"e{}\"}}", n)))
            .collect();
        server.write(burst.as_bytes()).await;

        for n in 0..3 {
            let received = recv(&mut rx).await;
            assert_eq!(received.channel, "workspace:1");
            assert_eq!(received.payload, format!("{{\"type\":\"e{}\"}}", n));
        }
    }

    #[tokio::test]
    async fn pattern_matches_carry_the_originating_channel() {
        let (listener, upstream, mut rx, _task) = start().await;
        let mut server = FakeRedis::accept(&listener).await;

        upstream.subscribe(&Topic::Pattern("conversation:*".to_string()));
        let command = server.next_subscription().await;
        assert_eq!(command, vec!["PSUBSCRIBE", "conversation:*"]);
        server.ack(&command).await;

        server
            .write(pmessage("conversation:*", "conversation:77", "{}").as_bytes())
            .await;
        assert_eq!(
            recv(&mut rx).await,
            InboundMessage {
                channel: "conversation:77".to_string(),
                payload: "{}".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn reconnect_resubscribes_wanted_topics() {
        let (listener, upstream, mut rx, _task) = start().await;
        let mut first = FakeRedis::accept(&listener).await;

        upstream.subscribe(&exact("workspace:1"));
        upstream.subscribe(&exact("workspace:2"));
        upstream.unsubscribe(&exact("workspace:2"));
        for expected in [
            ["SUBSCRIBE", "workspace:1"],
            ["SUBSCRIBE", "workspace:2"],
            ["UNSUBSCRIBE", "workspace:2"],
        ] {
            let command = first.next_subscription().await;
            assert_eq!(command, expected);
            first.ack(&command).await;
        }
        drop(first);

        let mut second = FakeRedis::accept(&listener).await;
        let command = second.next_subscription().await;
        assert_eq!(command, vec!["SUBSCRIBE", "workspace:1"]);
        second.ack(&command).await;

        second.write(message("workspace:1", "{}").as_bytes()).await;
        assert_eq!(recv(&mut rx).await.channel, "workspace:1");
    }

    #[tokio::test]
    async fn unacknowledged_subscribe_is_retried_after_reconnect() {
        let (listener, upstream, mut rx, _task) = start().await;
        let mut first = FakeRedis::accept(&listener).await;

        upstream.subscribe(&exact("workspace:9"));
        let command = first.next_subscription().await;
        assert_eq!(command, vec!["SUBSCRIBE", "workspace:9"]);
        // Hang up before confirming; the client sees the subscribe fail.
        drop(first);

        let mut second = FakeRedis::accept(&listener).await;
        let command = second.next_subscription().await;
        assert_eq!(command, vec!["SUBSCRIBE", "workspace:9"]);
        second.ack(&command).await;

        second.write(message("workspace:9", "{}").as_bytes()).await;
        assert_eq!(recv(&mut rx).await.channel, "workspace:9");
    }

    #[tokio::test]
    async fn error_replies_do_not_stop_the_connection() {
        let (listener, upstream, mut rx, _task) = start().await;
        let mut server = FakeRedis::accept(&listener).await;

        upstream.subscribe(&exact("workspace:9"));
        server.next_subscription().await;
        server.write(b"-ERR subscriptions disabled\r\n").await;

        upstream.subscribe(&exact("workspace:10"));
        let command = server.next_subscription().await;
        assert_eq!(command, vec!["SUBSCRIBE", "workspace:10"]);
        server.ack(&command).await;

        server.write(message("workspace:10", "{}").as_bytes()).await;
        assert_eq!(recv(&mut rx).await.channel, "workspace:10");
    }

    #[tokio::test]
    async fn task_ends_when_every_handle_is_dropped() {
        let (listener, upstream, _rx, task) = start().await;
        let mut server = FakeRedis::accept(&listener).await;
        tokio::spawn(async move {
            while server.read_command().await.is_some() {
                if server.conn.get_mut().write_all(b"+OK\r\n").await.is_err() {
                    break;
                }
            }
        });

        drop(upstream);
        timeout(WAIT, task).await.unwrap().unwrap();
    }

    #[test]
    fn tracking_follows_command_order() {
        let topic = Topic::Exact("workspace:1".to_string());
        let mut wanted = HashSet::new();

        track(&mut wanted, &Command::Subscribe(topic.clone()));
        track(&mut wanted, &Command::Unsubscribe(topic.clone()));
        assert!(wanted.is_empty());

        track(&mut wanted, &Command::Subscribe(topic.clone()));
        assert!(wanted.contains(&topic));
    }

    #[test]
    fn invalid_url_is_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        assert!(RedisUpstream::spawn("not a url", tx).is_err());
    }
}
