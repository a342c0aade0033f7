use cadence::{ChannelName, EventStream, HttpResponse, Request, Response};
use serde_json::json;

use crate::state::AppState;

/// Live follow-up changes for a workspace dashboard
pub async fn workspace(state: AppState, req: Request) -> Response {
    let workspace_id = req.param_id("workspace_id")?;
    open(&state, ChannelName::workspace(workspace_id))
}

/// Messages sent to one client
pub async fn conversation(state: AppState, req: Request) -> Response {
    let client_id = req.param_id("id")?;
    open(&state, ChannelName::conversation(client_id))
}

fn open(state: &AppState, channel: ChannelName) -> Response {
    let config = &state.realtime_config;
    let Some((guard, rx)) = state.realtime.open(&channel, config.sink_capacity) else {
        tracing::warn!(%channel, "stream closed before it was registered");
        return Err(HttpResponse::json(json!({
            "error": "infrastructure",
            "message": "stream could not be opened",
        }))
        .status(503));
    };

    tracing::debug!(%channel, sink_id = ?guard.sink_id(), "stream opened");
    Ok(HttpResponse::event_stream(EventStream::new(
        guard,
        rx,
        config.keep_alive(),
    )))
}
