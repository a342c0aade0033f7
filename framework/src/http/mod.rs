mod body;
mod form_request;
mod request;
mod response;
mod sse;

pub use body::{collect_body, parse_json};
pub use form_request::FormRequest;
pub use request::Request;
pub use response::{HttpResponse, Response, ResponseBody, ResponseExt};
pub use sse::EventStream;

/// Create a text response
pub fn text(body: impl Into<String>) -> Response {
    Ok(HttpResponse::text(body))
}

/// Create a JSON response from a serde_json::Value
pub fn json(body: serde_json::Value) -> Response {
    Ok(HttpResponse::json(body))
}
