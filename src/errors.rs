//! The canonical gateway error type and the generic error responder.
//!
//! Every failure the gateway detects is raised as a [`GatewayError`]
//! carrying an HTTP status, a message, the underlying error (when one
//! exists) and a structured diagnostic context map.  The type implements
//! [`axum::response::IntoResponse`] so handlers can simply return
//! `Err(GatewayError::not_found())` and have a well-formed JSON error
//! body rendered for the client.

use std::collections::HashMap;
use std::fmt;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Canonical error raised by the gateway core.
///
/// The status is always a valid HTTP status: out-of-range inputs are
/// coerced to 500 and the original value is preserved in the context
/// under `originalStatus` rather than silently dropped.
pub struct GatewayError {
    status: StatusCode,
    message: String,
    underlying: Option<anyhow::Error>,
    context: HashMap<String, serde_json::Value>,
    /// Response headers the error must emit (e.g. the `Content-Range`
    /// of a 416 response).
    headers: Vec<(HeaderName, String)>,
}

impl GatewayError {
    /// Build an error from a raw status code, clamping it into the valid
    /// HTTP range.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        let mut context = HashMap::new();
        let status = match StatusCode::from_u16(status) {
            Ok(code) if (100..600).contains(&status) => code,
            _ => {
                context.insert("originalStatus".to_string(), status.into());
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: message.into(),
            underlying: None,
            context,
            headers: Vec::new(),
        }
    }

    /// 404 -- the object does not exist.
    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    /// 500 -- resolver malfunction, zero-size object, or an unclassified
    /// stream failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    /// 400 -- malformed request input.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    /// 406 -- the client's `Accept` header rejects the blob's type.
    pub fn not_acceptable() -> Self {
        Self::new(406, "Not Acceptable")
    }

    /// 416 -- the requested range lies outside the object's bounds.
    pub fn range_not_satisfiable() -> Self {
        Self::new(416, "Range Not Satisfiable")
    }

    /// 504 -- the backend reported a timeout.
    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self::new(504, message)
    }

    /// 502 -- the backend failed with its own 5xx.
    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(502, message)
    }

    /// Attach the originating error.
    pub fn with_underlying(mut self, err: anyhow::Error) -> Self {
        self.underlying = Some(err);
        self
    }

    /// Attach a diagnostic context entry, merged into the JSON error body.
    pub fn with_context(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach a response header to emit alongside the error.
    pub fn with_header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn underlying(&self) -> Option<&anyhow::Error> {
        self.underlying.as_ref()
    }

    pub fn context(&self) -> &HashMap<String, serde_json::Value> {
        &self.context
    }

    /// Short error-kind name used as the `type` field of the JSON body.
    pub fn kind(&self) -> &'static str {
        match self.status {
            StatusCode::NOT_FOUND => "NotFound",
            StatusCode::BAD_REQUEST => "BadRequest",
            StatusCode::NOT_ACCEPTABLE => "NotAcceptable",
            StatusCode::RANGE_NOT_SATISFIABLE => "RangeNotSatisfiable",
            StatusCode::GATEWAY_TIMEOUT => "GatewayTimeout",
            StatusCode::BAD_GATEWAY => "BadGateway",
            StatusCode::INTERNAL_SERVER_ERROR => "InternalServerError",
            _ => "Error",
        }
    }

    /// Render the structured JSON error body: `status`, `type` and
    /// `message`, with the diagnostic context merged at the top level.
    fn body_json(&self) -> serde_json::Value {
        let mut body = serde_json::Map::new();
        body.insert("status".to_string(), self.status.as_u16().into());
        body.insert("type".to_string(), self.kind().into());
        body.insert("message".to_string(), self.message.clone().into());
        for (key, value) in &self.context {
            body.insert(key.clone(), value.clone());
        }
        serde_json::Value::Object(body)
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.status.as_u16(), self.kind(), self.message)
    }
}

impl fmt::Debug for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayError")
            .field("status", &self.status)
            .field("message", &self.message)
            .field("underlying", &self.underlying)
            .field("context", &self.context)
            .finish()
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.underlying.as_ref().map(AsRef::as_ref)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        error!(
            status = self.status.as_u16(),
            kind = self.kind(),
            underlying = ?self.underlying,
            "{}",
            self.message
        );

        let body = self.body_json().to_string();
        let mut response = (
            self.status,
            [("content-type", "application/json")],
            body,
        )
            .into_response();

        for (name, value) in &self.headers {
            match HeaderValue::from_str(value) {
                Ok(v) => {
                    response.headers_mut().insert(name.clone(), v);
                }
                Err(_) => {
                    error!("Dropping invalid error response header {}", name);
                }
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::CONTENT_RANGE;

    #[test]
    fn status_in_range_is_kept() {
        let err = GatewayError::new(416, "nope");
        assert_eq!(err.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert!(err.context().is_empty());
    }

    #[test]
    fn out_of_range_status_coerces_to_500_and_keeps_original() {
        for bad in [0u16, 42, 99, 600, 999] {
            let err = GatewayError::new(bad, "boom");
            assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(
                err.context().get("originalStatus"),
                Some(&serde_json::Value::from(bad))
            );
        }
    }

    #[test]
    fn kind_names_match_taxonomy() {
        assert_eq!(GatewayError::not_found().kind(), "NotFound");
        assert_eq!(GatewayError::bad_request("x").kind(), "BadRequest");
        assert_eq!(GatewayError::not_acceptable().kind(), "NotAcceptable");
        assert_eq!(
            GatewayError::range_not_satisfiable().kind(),
            "RangeNotSatisfiable"
        );
        assert_eq!(GatewayError::gateway_timeout("x").kind(), "GatewayTimeout");
        assert_eq!(GatewayError::bad_gateway("x").kind(), "BadGateway");
        assert_eq!(GatewayError::internal("x").kind(), "InternalServerError");
    }

    #[test]
    fn context_merges_into_body() {
        let err = GatewayError::bad_request("Malformed 'Range' header")
            .with_context("requestRangeHeader", "bytes=abc");
        let body = err.body_json();
        assert_eq!(body["status"], 400);
        assert_eq!(body["type"], "BadRequest");
        assert_eq!(body["requestRangeHeader"], "bytes=abc");
    }

    #[test]
    fn carried_headers_are_emitted() {
        let err = GatewayError::range_not_satisfiable()
            .with_header(CONTENT_RANGE, "bytes */1000");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers().get(CONTENT_RANGE).unwrap(),
            "bytes */1000"
        );
    }

    #[test]
    fn underlying_is_exposed_as_source() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = GatewayError::gateway_timeout("upstream timeout")
            .with_underlying(anyhow::Error::new(io));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn request_id_is_sixteen_hex_chars() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
