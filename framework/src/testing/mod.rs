//! Test support
//!
//! - [`TestDatabase`]: migrated in-memory SQLite
//! - [`RecordingUpstream`] and [`RecordingSender`]: fakes for the pub/sub
//!   upstream and the outbound message provider
//! - [`TestServer`]: a router served on an ephemeral port with a small client
//!
//! ```rust,ignore
//! let db = TestDatabase::fresh().await?;
//! let engine = SequenceEngine::new(db.connection(), queue, Realtime::local().bus);
//! ```
//!
//! Helpers here panic on failure so tests read top to bottom.

use crate::database::{DbConnection, Migrator};
use crate::error::FrameworkError;
use crate::realtime::{Topic, Upstream};
use crate::routing::Router;
use crate::sequence::{MessageSender, OutboundMessage};
use crate::server::Server;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Fresh, migrated, in-memory SQLite database
///
/// The pool holds exactly one connection so every query sees the same
/// in-memory database.
pub struct TestDatabase {
    conn: DbConnection,
}

impl TestDatabase {
    pub async fn fresh() -> Result<Self, FrameworkError> {
        let mut opt = ConnectOptions::new("sqlite::memory:".to_string());
        opt.max_connections(1)
            .min_connections(1)
            .sqlx_logging(false);

        let conn = Database::connect(opt).await?;
        Migrator::up(&conn, None).await?;

        Ok(Self {
            conn: DbConnection::from_connection(conn),
        })
    }

    pub fn conn(&self) -> &DatabaseConnection {
        self.conn.inner()
    }

    /// Clonable handle for components that own their connection
    pub fn connection(&self) -> DbConnection {
        self.conn.clone()
    }
}

/// Upstream call recorded by [`RecordingUpstream`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamCall {
    Subscribe(Topic),
    Unsubscribe(Topic),
}

/// Upstream that only records what it was asked to do
#[derive(Debug, Default)]
pub struct RecordingUpstream {
    calls: Mutex<Vec<UpstreamCall>>,
}

impl RecordingUpstream {
    pub fn calls(&self) -> Vec<UpstreamCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: UpstreamCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl Upstream for RecordingUpstream {
    fn subscribe(&self, topic: &Topic) {
        self.record(UpstreamCall::Subscribe(topic.clone()));
    }

    fn unsubscribe(&self, topic: &Topic) {
        self.record(UpstreamCall::Unsubscribe(topic.clone()));
    }
}

/// Message sender that keeps what it sent, or always fails
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<OutboundMessage>>,
    failure: Option<String>,
}

impl RecordingSender {
    /// A sender whose every delivery fails with `message`
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failure: Some(message.into()),
        }
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, message: &OutboundMessage) -> Result<(), FrameworkError> {
        if let Some(failure) = &self.failure {
            return Err(FrameworkError::delivery(failure.clone()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message.clone());
        }
        Ok(())
    }
}

const STREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Router served on `127.0.0.1:0` for the lifetime of the value
pub struct TestServer {
    addr: SocketAddr,
    client: Client<HttpConnector, Full<Bytes>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start(router: Router) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("test listener address");
        let (shutdown, stopped) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let stop = async {
                let _ = stopped.await;
            };
            if let Err(err) = Server::new(router).serve(listener, stop).await {
                tracing::error!(error = %err, "test server failed");
            }
        });

        Self {
            addr,
            client: Client::builder(TokioExecutor::new()).build_http(),
            shutdown: Some(shutdown),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn send(&self, request: hyper::Request<Full<Bytes>>) -> hyper::Response<Incoming> {
        self.client
            .request(request)
            .await
            .expect("test request failed")
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        let request = hyper::Request::get(self.url(path))
            .body(Full::new(Bytes::new()))
            .expect("build GET request");
        TestResponse::collect(self.send(request).await).await
    }

    pub async fn post_json(&self, path: &str, body: Value) -> TestResponse {
        self.post_raw(path, body.to_string()).await
    }

    /// POST an arbitrary body with a JSON content type
    pub async fn post_raw(&self, path: &str, body: impl Into<Bytes>) -> TestResponse {
        let request = hyper::Request::post(self.url(path))
            .header("content-type", "application/json")
            .body(Full::new(body.into()))
            .expect("build POST request");
        TestResponse::collect(self.send(request).await).await
    }

    /// Open an event stream and keep it open
    pub async fn stream(&self, path: &str) -> TestStream {
        let request = hyper::Request::get(self.url(path))
            .header("accept", "text/event-stream")
            .body(Full::new(Bytes::new()))
            .expect("build stream request");
        let response = self.send(request).await;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        TestStream {
            status,
            content_type,
            body: response.into_body(),
            buffer: BytesMut::new(),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Fully read response
#[derive(Debug)]
pub struct TestResponse {
    pub status: u16,
    pub body: Bytes,
}

impl TestResponse {
    async fn collect(response: hyper::Response<Incoming>) -> Self {
        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("read test response body")
            .to_bytes();
        Self { status, body }
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("response body is not JSON")
    }
}

/// A received server-sent event
#[derive(Debug, Clone, PartialEq)]
pub struct TestEvent {
    pub event: String,
    pub data: Value,
}

/// Open event stream, read one event at a time
pub struct TestStream {
    pub status: u16,
    pub content_type: String,
    body: Incoming,
    buffer: BytesMut,
}

impl TestStream {
    /// Next event, skipping comment frames
    ///
    /// Panics if nothing arrives within five seconds or the stream ends.
    pub async fn next_event(&mut self) -> TestEvent {
        tokio::time::timeout(STREAM_TIMEOUT, self.read_event())
            .await
            .expect("timed out waiting for an event")
    }

    /// Whether the server ended the stream within `wait`
    pub async fn is_closed_within(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, async {
            while let Some(frame) = self.body.frame().await {
                if frame.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }

    async fn read_event(&mut self) -> TestEvent {
        loop {
            if let Some(end) = find_frame_end(&self.buffer) {
                let frame = self.buffer.split_to(end + 2);
                let text = String::from_utf8_lossy(&frame[..end]).into_owned();
                if let Some(event) = parse_event(&text) {
                    return event;
                }
                continue;
            }

            let frame = self
                .body
                .frame()
                .await
                .expect("event stream ended")
                .expect("event stream failed");
            if let Ok(data) = frame.into_data() {
                self.buffer.extend_from_slice(&data);
            }
        }
    }
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn parse_event(frame: &str) -> Option<TestEvent> {
    let mut event = None;
    let mut data = None;
    for line in frame.lines() {
        if let Some(kind) = line.strip_prefix("event: ") {
            event = Some(kind.to_string());
        } else if let Some(payload) = line.strip_prefix("data: ") {
            data = serde_json::from_str(payload).ok();
        }
    }
    Some(TestEvent {
        event: event?,
        data: data.unwrap_or(Value::Null),
    })
}
