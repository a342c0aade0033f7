use super::body::{collect_body, parse_json};
use super::response::HttpResponse;
use crate::config::ServerConfig;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;

/// HTTP request wrapper with route parameters and body helpers
pub struct Request {
    inner: hyper::Request<hyper::body::Incoming>,
    params: HashMap<String, String>,
    body_limit: usize,
}

impl Request {
    pub fn new(inner: hyper::Request<hyper::body::Incoming>) -> Self {
        Self {
            inner,
            params: HashMap::new(),
            body_limit: ServerConfig::DEFAULT_MAX_BODY_SIZE,
        }
    }

    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = params;
        self
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Get the request method
    pub fn method(&self) -> &hyper::Method {
        self.inner.method()
    }

    /// Get the request path
    pub fn path(&self) -> &str {
        self.inner.uri().path()
    }

    /// Get a route parameter by name (e.g., /follow-ups/{id})
    ///
    /// A missing parameter is a routing bug, reported as a 500.
    pub fn param(&self, name: &str) -> Result<&str, HttpResponse> {
        self.params.get(name).map(|s| s.as_str()).ok_or_else(|| {
            tracing::error!(param = name, path = self.path(), "route parameter missing");
            HttpResponse::json(json!({
                "error": "internal",
                "message": format!("Missing route parameter: {}", name),
            }))
            .status(500)
        })
    }

    /// Route parameter parsed as a positive id, 422 otherwise
    pub fn param_id(&self, name: &str) -> Result<i64, HttpResponse> {
        let raw = self.param(name)?;
        match raw.parse::<i64>() {
            Ok(id) if id > 0 => Ok(id),
            _ => Err(HttpResponse::json(json!({
                "error": "validation",
                "message": format!("{} must be a positive integer, got '{}'", name, raw),
            }))
            .status(422)),
        }
    }

    /// Get all route parameters
    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    /// Get a header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.headers().get(name).and_then(|v| v.to_str().ok())
    }

    /// Get the Content-Type header
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn body_limit(&self) -> usize {
        self.body_limit
    }

    /// Consume the request, keeping only its body
    pub fn into_body(self) -> hyper::body::Incoming {
        self.inner.into_body()
    }

    /// Parse the request body as JSON
    ///
    /// Consumes the request since the body can only be read once.
    ///
    /// ```rust,ignore
    /// #[derive(Deserialize)]
    /// struct AddRule { delay_ms: i64, content: String }
    ///
    /// pub async fn store(req: Request) -> Response {
    ///     let data: AddRule = req.json().await?;
    ///     // ...
    /// }
    /// ```
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, HttpResponse> {
        let bytes = collect_body(self.inner.into_body(), self.body_limit).await?;
        parse_json(&bytes)
    }
}
