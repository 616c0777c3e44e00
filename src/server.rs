//! Axum router construction and route mapping.
//!
//! The [`app`] function wires the gateway routes to their handlers and
//! returns a ready-to-serve [`axum::Router`].  The object route uses a
//! wildcard capture so object names may contain slashes.

use axum::{
    extract::{Path, RawQuery, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::errors::{generate_request_id, GatewayError};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the Blobgate API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Blobgate API",
        version = "0.1.0",
        description = "HTTP gateway for range and conditional reads of remote-stored blobs"
    ),
    paths(health_check, crate::handlers::object::get_object),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "File", description = "Blob-serving endpoints"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with all gateway routes.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new();

    if state.config.observability.health_check {
        router = router.route("/health", get(health_check));
    }
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .route("/openapi.json", get(openapi_spec))
        // Wildcard capture: object names may contain slashes.
        .route("/file/*name", get(handle_get_file))
        // Unknown paths get the same structured 404 body as missing objects.
        .fallback(handle_not_found)
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http())
        // metrics_middleware is outermost (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
}

// -- Common headers middleware -----------------------------------------------

/// Tower middleware that adds common response headers to every response:
/// - `x-request-id`: 16-character uppercase hex string
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: `Blobgate`
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-request-id") {
        let request_id = generate_request_id();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert("x-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("Blobgate"));

    response
}

// -- Health check ------------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// `GET /openapi.json` -- Serve the OpenAPI specification.
async fn openapi_spec() -> impl IntoResponse {
    let body = ApiDoc::openapi()
        .to_json()
        .unwrap_or_else(|_| "{}".to_string());
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        body,
    )
}

// -- Query parameter parsing helper ------------------------------------------

/// Parse a raw query string into a map, percent-decoding keys and values.
/// The map is passed through opaquely as stream-error diagnostic context.
fn parse_query(raw: Option<String>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(qs) = raw {
        for part in qs.split('&') {
            if let Some((k, v)) = part.split_once('=') {
                let decoded_k = percent_encoding::percent_decode_str(k)
                    .decode_utf8_lossy()
                    .into_owned();
                let decoded_v = percent_encoding::percent_decode_str(v)
                    .decode_utf8_lossy()
                    .into_owned();
                map.insert(decoded_k, decoded_v);
            } else if !part.is_empty() {
                let decoded = percent_encoding::percent_decode_str(part)
                    .decode_utf8_lossy()
                    .into_owned();
                map.insert(decoded, String::new());
            }
        }
    }
    map
}

// -- Route handlers -----------------------------------------------------------

/// `GET /file/*name` -- serve a blob.
async fn handle_get_file(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let query = parse_query(raw_query);
    crate::handlers::object::get_object(state, &name, &headers, &query).await
}

/// Catch-all for unknown paths.
async fn handle_not_found() -> GatewayError {
    GatewayError::not_found()
}

// -- Router-level tests --------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::backend::ObjectMetadata;
    use crate::storage::memory::{InjectedFailure, MemoryStore};
    use axum::body::Body;
    use bytes::Bytes;
    use tower::ServiceExt;

    const LAST_MODIFIED: &str = "Mon, 01 Jan 2024 00:00:00 GMT";

    fn test_config() -> Config {
        serde_yaml::from_str("{}").unwrap()
    }

    fn blob_metadata(size: u64) -> ObjectMetadata {
        ObjectMetadata {
            content_type: Some("application/octet-stream".to_string()),
            size: Some(size),
            last_modified: Some(httpdate::parse_http_date(LAST_MODIFIED).unwrap()),
            validator: Some("abc".to_string()),
        }
    }

    fn blob_data() -> Bytes {
        Bytes::from((0..1000u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new().with_chunk_size(64));
        store
            .insert("blob.bin", blob_data(), blob_metadata(1000))
            .await;
        store
    }

    fn app_for(store: Arc<MemoryStore>) -> Router {
        app(Arc::new(AppState {
            config: test_config(),
            store,
        }))
    }

    fn get_request(uri: &str, headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_bytes(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    #[tokio::test]
    async fn full_body_is_served_with_caching_headers() {
        let app = app_for(seeded_store().await);
        let response = app
            .oneshot(get_request("/file/blob.bin", &[]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["accept-ranges"], "bytes");
        assert_eq!(response.headers()["etag"], "\"abc\"");
        assert_eq!(response.headers()["last-modified"], LAST_MODIFIED);
        assert_eq!(response.headers()["content-length"], "1000");
        assert_eq!(response.headers()["content-type"], "application/octet-stream");
        assert_eq!(response.headers()["server"], "Blobgate");
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(body_bytes(response).await, blob_data());
    }

    #[tokio::test]
    async fn valid_range_yields_partial_content() {
        let app = app_for(seeded_store().await);
        let response = app
            .oneshot(get_request(
                "/file/blob.bin",
                &[("range", "bytes=100-199")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()["content-range"], "bytes 100-199/1000");
        assert_eq!(response.headers()["content-length"], "100");
        assert_eq!(body_bytes(response).await, blob_data().slice(100..200));
    }

    #[tokio::test]
    async fn out_of_bounds_range_yields_416_with_content_range() {
        let app = app_for(seeded_store().await);
        let response = app
            .oneshot(get_request("/file/blob.bin", &[("range", "bytes=2000-")]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()["content-range"], "bytes */1000");
        let body = body_json(response).await;
        assert_eq!(body["type"], "RangeNotSatisfiable");
        assert_eq!(body["requestRangeHeader"], "bytes=2000-");
        assert_eq!(body["maxContentLength"], 1000);
    }

    #[tokio::test]
    async fn malformed_range_yields_400_with_header_context() {
        let app = app_for(seeded_store().await);
        let response = app
            .oneshot(get_request("/file/blob.bin", &[("range", "bytes=abc")]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["type"], "BadRequest");
        assert_eq!(body["requestRangeHeader"], "bytes=abc");
    }

    #[tokio::test]
    async fn if_none_match_yields_304_with_empty_body() {
        let app = app_for(seeded_store().await);
        let response = app
            .oneshot(get_request(
                "/file/blob.bin",
                &[("if-none-match", "\"abc\"")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert!(!response.headers().contains_key("content-range"));
        assert_eq!(response.headers()["etag"], "\"abc\"");
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn if_modified_since_yields_304() {
        let app = app_for(seeded_store().await);
        let response = app
            .oneshot(get_request(
                "/file/blob.bin",
                &[("if-modified-since", "Tue, 02 Jan 2024 00:00:00 GMT")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn stale_if_range_date_serves_the_full_body() {
        let app = app_for(seeded_store().await);
        let response = app
            .oneshot(get_request(
                "/file/blob.bin",
                &[
                    ("range", "bytes=100-199"),
                    ("if-range", "Sun, 31 Dec 2023 00:00:00 GMT"),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-length"], "1000");
        assert!(!response.headers().contains_key("content-range"));
    }

    #[tokio::test]
    async fn matching_if_range_etag_serves_partial_content() {
        let app = app_for(seeded_store().await);
        let response = app
            .oneshot(get_request(
                "/file/blob.bin",
                &[("range", "bytes=100-199"), ("if-range", "\"abc\"")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()["content-range"], "bytes 100-199/1000");
    }

    #[tokio::test]
    async fn zero_size_object_is_a_500_regardless_of_headers() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert("empty.bin", Bytes::new(), blob_metadata(0))
            .await;
        let app = app_for(store);

        let response = app
            .oneshot(get_request(
                "/file/empty.bin",
                &[("range", "bytes=0-10"), ("if-none-match", "\"abc\"")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["type"], "InternalServerError");
        assert_eq!(body["file"], "empty.bin");
    }

    #[tokio::test]
    async fn missing_object_is_a_structured_404() {
        let app = app_for(seeded_store().await);
        let response = app
            .oneshot(get_request("/file/missing.bin", &[]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["type"], "NotFound");
    }

    #[tokio::test]
    async fn rejected_accept_header_is_406() {
        let app = app_for(seeded_store().await);
        let response = app
            .oneshot(get_request("/file/blob.bin", &[("accept", "text/html")]))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    }

    #[tokio::test]
    async fn content_length_override_suppresses_the_header() {
        let app = app_for(seeded_store().await);
        let response = app
            .oneshot(get_request(
                "/file/blob.bin",
                &[("x-blobgate-no-content-length", "true")],
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("content-length"));
        assert_eq!(body_bytes(response).await.len(), 1000);
    }

    #[tokio::test]
    async fn repeated_requests_are_idempotent() {
        let store = seeded_store().await;
        let request = || get_request("/file/blob.bin", &[("range", "bytes=0-9")]);

        let first = app_for(store.clone()).oneshot(request()).await.unwrap();
        let second = app_for(store).oneshot(request()).await.unwrap();

        assert_eq!(first.status(), second.status());
        for header in ["content-range", "content-length", "etag", "last-modified"] {
            assert_eq!(first.headers().get(header), second.headers().get(header));
        }
    }

    #[tokio::test]
    async fn mid_stream_failure_releases_the_stream_and_cuts_the_body() {
        let store = Arc::new(MemoryStore::new().with_chunk_size(64));
        store
            .insert_failing(
                "flaky.bin",
                blob_data(),
                blob_metadata(1000),
                2,
                InjectedFailure::Code {
                    code: "ESOCKETTIMEDOUT".to_string(),
                    message: "socket timed out mid-read".to_string(),
                },
            )
            .await;
        let app = app_for(store.clone());

        let response = app
            .oneshot(get_request("/file/flaky.bin", &[]))
            .await
            .unwrap();

        // Headers were already sent as a 200; the failure surfaces as a
        // truncated body.
        assert_eq!(response.status(), StatusCode::OK);
        let result = axum::body::to_bytes(response.into_body(), usize::MAX).await;
        assert!(result.is_err());
        assert_eq!(store.release_count(), 1);
    }

    #[tokio::test]
    async fn open_time_upstream_failure_becomes_the_response() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_failing(
                "gone.bin",
                Bytes::new(),
                blob_metadata(1000),
                0,
                InjectedFailure::Upstream {
                    status: 503,
                    message: "backend unavailable".to_string(),
                },
            )
            .await;
        let app = app_for(store);

        let response = app.oneshot(get_request("/file/gone.bin", &[])).await.unwrap();

        // The backend's own 5xx is never mirrored; it is an upstream fault.
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["type"], "BadGateway");
        assert!(body["underlyingErr"]
            .as_str()
            .unwrap()
            .contains("backend unavailable"));
        assert_eq!(body["source"], "gone.bin");
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let app = app_for(seeded_store().await);
        let response = app.oneshot(get_request("/health", &[])).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn unknown_route_gets_the_structured_404() {
        let app = app_for(seeded_store().await);
        let response = app.oneshot(get_request("/nope", &[])).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["type"], "NotFound");
    }

    #[test]
    fn parse_query_decodes_pairs_and_bare_keys() {
        let query = parse_query(Some("width=120&height=80&debug".to_string()));
        assert_eq!(query["width"], "120");
        assert_eq!(query["height"], "80");
        assert_eq!(query["debug"], "");

        let query = parse_query(Some("name=a%20b".to_string()));
        assert_eq!(query["name"], "a b");
    }
}
