use cadence::{FormRequest, HttpResponse, Outcome, Request, Response};

use crate::requests::StartFollowUp;
use crate::state::AppState;

fn render(outcome: Outcome) -> HttpResponse {
    HttpResponse::json(outcome.to_json())
}

fn ids(req: &Request) -> Result<(i64, i64), HttpResponse> {
    Ok((req.param_id("workspace_id")?, req.param_id("id")?))
}

pub async fn start(state: AppState, req: Request) -> Response {
    let workspace_id = req.param_id("workspace_id")?;
    let form = StartFollowUp::extract(req).await?;
    let outcome = state.engine.start(form.client_id, workspace_id).await?;
    Ok(render(outcome).status(201))
}

pub async fn pause(state: AppState, req: Request) -> Response {
    let (workspace_id, id) = ids(&req)?;
    Ok(render(state.engine.pause(id, workspace_id).await?))
}

pub async fn resume(state: AppState, req: Request) -> Response {
    let (workspace_id, id) = ids(&req)?;
    Ok(render(state.engine.resume(id, workspace_id).await?))
}

pub async fn cancel(state: AppState, req: Request) -> Response {
    let (workspace_id, id) = ids(&req)?;
    Ok(render(state.engine.cancel(id, workspace_id).await?))
}

/// Client replied; the sequence stops for good
pub async fn convert(state: AppState, req: Request) -> Response {
    let (workspace_id, id) = ids(&req)?;
    Ok(render(state.engine.convert(id, workspace_id).await?))
}
