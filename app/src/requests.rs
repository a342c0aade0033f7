use cadence::FormRequest;
use serde::Deserialize;
use validator::Validate;

/// Body of `POST /workspaces/{workspace_id}/follow-ups`
#[derive(Debug, Deserialize, Validate)]
pub struct StartFollowUp {
    #[validate(range(min = 1, message = "client_id must be a positive id"))]
    pub client_id: i64,
}

impl FormRequest for StartFollowUp {}
