use cadence::{HttpResponse, Request, Response};
use serde_json::json;

use crate::state::AppState;

pub async fn show(state: AppState, _req: Request) -> Response {
    if let Err(err) = state.engine.db().ping().await {
        tracing::warn!(error = %err, "health check: database unreachable");
        return Err(
            HttpResponse::json(json!({"status": "degraded", "database": "unreachable"}))
                .status(503),
        );
    }

    HttpResponse::json(json!({
        "status": "ok",
        "streams": state.realtime.registry.channel_count(),
    }))
    .ok()
}
