use crate::error::{FrameworkError, HttpError};
use crate::http::sse::EventStream;
use crate::sequence::SequenceError;
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use std::convert::Infallible;

/// Body type every response is converted to
pub type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

enum Body {
    Full(Bytes),
    Stream(EventStream),
}

/// HTTP response builder
pub struct HttpResponse {
    status: u16,
    body: Body,
    headers: Vec<(String, String)>,
}

/// Response type alias - allows using `?` operator for early returns
pub type Response = Result<HttpResponse, HttpResponse>;

impl HttpResponse {
    pub fn new() -> Self {
        Self {
            status: 200,
            body: Body::Full(Bytes::new()),
            headers: Vec::new(),
        }
    }

    /// Create a response with a string body
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: Body::Full(Bytes::from(body.into())),
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
        }
    }

    /// Create a JSON response from a serde_json::Value
    pub fn json(body: serde_json::Value) -> Self {
        Self {
            status: 200,
            body: Body::Full(Bytes::from(body.to_string())),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
        }
    }

    /// A `text/event-stream` response fed by `stream`
    pub fn event_stream(stream: EventStream) -> Self {
        Self {
            status: 200,
            body: Body::Stream(stream),
            headers: vec![
                ("Content-Type".to_string(), "text/event-stream".to_string()),
                ("Cache-Control".to_string(), "no-cache".to_string()),
                ("X-Accel-Buffering".to_string(), "no".to_string()),
            ],
        }
    }

    /// `{"error": kind, "message": ...}` with the error's status
    pub fn error<E: HttpError>(err: &E) -> Self {
        Self::json(serde_json::json!({
            "error": err.error_kind(),
            "message": err.error_message(),
        }))
        .status(err.status_code())
    }

    /// Set the HTTP status code
    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    /// Add a header to the response
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Wrap this response in Ok() for use as Response type
    pub fn ok(self) -> Response {
        Ok(self)
    }

    /// Convert to hyper response
    pub fn into_hyper(self) -> hyper::Response<ResponseBody> {
        let mut builder = hyper::Response::builder().status(self.status);

        for (name, value) in self.headers {
            builder = builder.header(name, value);
        }

        let body = match self.body {
            Body::Full(bytes) => Full::new(bytes).boxed_unsync(),
            Body::Stream(stream) => stream.boxed_unsync(),
        };

        builder.body(body).unwrap_or_else(|err| {
            tracing::error!(error = %err, "invalid response parts");
            let mut fallback = hyper::Response::new(Full::new(Bytes::new()).boxed_unsync());
            *fallback.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}

/// Extension trait for Response to enable method chaining
pub trait ResponseExt {
    fn status(self, code: u16) -> Self;
    fn header(self, name: impl Into<String>, value: impl Into<String>) -> Self;
}

impl ResponseExt for Response {
    fn status(self, code: u16) -> Self {
        self.map(|r| r.status(code))
    }

    fn header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.map(|r| r.header(name, value))
    }
}

/// Lets handlers use `?` on framework errors
impl From<FrameworkError> for HttpResponse {
    fn from(err: FrameworkError) -> HttpResponse {
        tracing::error!(error = %err, "request failed");
        HttpResponse::error(&err)
    }
}

/// Lets handlers use `?` on sequence engine results
impl From<SequenceError> for HttpResponse {
    fn from(err: SequenceError) -> HttpResponse {
        if let SequenceError::Infrastructure(inner) = &err {
            tracing::error!(error = %inner, "request failed");
        }
        HttpResponse::error(&err)
    }
}
