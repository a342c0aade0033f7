use cadence::{with_state, Router, Services};

use crate::controllers::{follow_ups, health, streams};
use crate::state::AppState;

pub fn register(services: &Services) -> Router {
    router(AppState::from(services))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .get("/health", with_state(state.clone(), health::show))
        // Follow-up lifecycle
        .post(
            "/workspaces/{workspace_id}/follow-ups",
            with_state(state.clone(), follow_ups::start),
        )
        .post(
            "/workspaces/{workspace_id}/follow-ups/{id}/pause",
            with_state(state.clone(), follow_ups::pause),
        )
        .post(
            "/workspaces/{workspace_id}/follow-ups/{id}/resume",
            with_state(state.clone(), follow_ups::resume),
        )
        .post(
            "/workspaces/{workspace_id}/follow-ups/{id}/cancel",
            with_state(state.clone(), follow_ups::cancel),
        )
        .post(
            "/workspaces/{workspace_id}/follow-ups/{id}/convert",
            with_state(state.clone(), follow_ups::convert),
        )
        // Live streams
        .get(
            "/streams/workspaces/{workspace_id}",
            with_state(state.clone(), streams::workspace),
        )
        .get(
            "/streams/conversations/{id}",
            with_state(state, streams::conversation),
        )
}
