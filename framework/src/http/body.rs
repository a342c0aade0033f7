//! Body collection and parsing for HTTP requests

use crate::http::response::HttpResponse;
use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use serde::de::DeserializeOwned;
use serde_json::json;

/// Collect the full body, refusing anything over `limit` bytes
pub async fn collect_body(body: Incoming, limit: usize) -> Result<Bytes, HttpResponse> {
    Limited::new(body, limit)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| {
            tracing::debug!(error = %e, limit, "request body rejected");
            HttpResponse::json(json!({
                "error": "payload_too_large",
                "message": format!("Request body exceeds {} bytes", limit),
            }))
            .status(413)
        })
}

/// Parse bytes as JSON into the target type
///
/// An empty body parses as `{}` so requests whose fields all have defaults
/// need not send one.
pub fn parse_json<T: DeserializeOwned>(bytes: &Bytes) -> Result<T, HttpResponse> {
    let bytes: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        bytes
    };
    serde_json::from_slice(bytes).map_err(|e| {
        HttpResponse::json(json!({
            "error": "validation",
            "message": format!("Malformed JSON body: {}", e),
        }))
        .status(422)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Body {
        #[serde(default)]
        n: i64,
    }

    fn parsed(raw: &'static str) -> Result<Body, u16> {
        parse_json::<Body>(&Bytes::from(raw)).map_err(|response| response.status_code())
    }

    #[test]
    fn empty_body_is_an_empty_object() {
        assert_eq!(parsed(""), Ok(Body { n: 0 }));
        assert_eq!(parsed(" \n"), Ok(Body { n: 0 }));
        assert_eq!(parsed("{\"n\":3}"), Ok(Body { n: 3 }));
    }

    #[test]
    fn malformed_json_is_unprocessable() {
        assert_eq!(parsed("{n:"), Err(422));
    }
}
