//! Cadence: timed follow-up sequences with realtime fan-out
//!
//! - [`sequence`]: the follow-up state machine and the step executor
//! - [`queue`]: durable delayed jobs backed by the application database
//! - [`realtime`]: ref-counted pub/sub channels feeding server-sent events
//! - [`http`], [`routing`], [`server`]: a small hyper stack for the API
//! - [`app`]: the CLI that wires it all together

pub mod app;
pub mod config;
pub mod database;
pub mod error;
pub mod http;
pub mod logging;
pub mod queue;
pub mod realtime;
pub mod routing;
pub mod sequence;
pub mod server;
pub mod testing;

pub use app::{Application, Services};
pub use config::{Config, Environment};
pub use database::DbConnection;
pub use error::{FrameworkError, HttpError, ValidationErrors};
pub use http::{json, text, EventStream, FormRequest, HttpResponse, Request, Response, ResponseExt};
pub use queue::{JobQueue, QueueWorker};
pub use realtime::{ChannelName, Realtime, ServerEvent};
pub use routing::{with_state, Router};
pub use sequence::{MessageSender, OutboundMessage, Outcome, SequenceEngine, SequenceError};
pub use server::Server;

// Re-exported so applications derive request validation against the same versions
pub use async_trait::async_trait;
pub use serde_json;
pub use validator;
