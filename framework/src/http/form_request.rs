//! Validated request bodies

use super::body::{collect_body, parse_json};
use super::response::HttpResponse;
use super::Request;
use crate::error::ValidationErrors;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use validator::Validate;

/// JSON body that is validated before a handler sees it
///
/// ```rust,ignore
/// #[derive(Deserialize, Validate)]
/// pub struct StartFollowUp {
///     #[validate(range(min = 1, message = "client_id must be a positive id"))]
///     pub client_id: i64,
/// }
///
/// impl FormRequest for StartFollowUp {}
///
/// pub async fn start(req: Request) -> Response {
///     let form = StartFollowUp::extract(req).await?;
///     // ...
/// }
/// ```
#[async_trait]
pub trait FormRequest: Sized + DeserializeOwned + Validate + Send {
    /// Parse and validate the body, rendering failures as 422
    async fn extract(req: Request) -> Result<Self, HttpResponse> {
        let limit = req.body_limit();
        let bytes = collect_body(req.into_body(), limit).await?;
        let data: Self = parse_json(&bytes)?;

        if let Err(errors) = data.validate() {
            let errors = ValidationErrors::from_validator(errors);
            return Err(HttpResponse::json(errors.to_json()).status(422));
        }

        Ok(data)
    }
}
