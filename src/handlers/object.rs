//! Object-serving handler -- the request-to-response decision engine.
//!
//! For each request: resolve object metadata, build the caching/range
//! headers, negotiate the `Range` header and its `If-Range` gate,
//! evaluate conditional-request headers, and hand off to the streaming
//! pipeline.  Everything here is freshly derived per request; nothing is
//! cached across requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::header::{
    AsHeaderName, ACCEPT, ACCEPT_RANGES, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE,
    CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_RANGE, LAST_MODIFIED, RANGE,
};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::errors::GatewayError;
use crate::pipeline::{self, StreamContext};
use crate::storage::backend::ObjectMetadata;
use crate::AppState;

/// Request header that suppresses `Content-Length` emission, for
/// downstream layers streaming content whose length is not the object's
/// raw size.  Only the exact value `true` activates it.
pub const NO_CONTENT_LENGTH_HEADER: &str = "x-blobgate-no-content-length";

fn header_str(headers: &HeaderMap, name: impl AsHeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// -- Range negotiation --------------------------------------------------------

/// Outcome of parsing the `Range` request header against the object size.
#[derive(Debug, Clone, PartialEq)]
enum ParsedRange {
    /// No usable range; serve the full body.
    None,
    /// Syntactically invalid header.
    Malformed,
    /// The range unit is not `bytes`.
    UnsupportedUnit,
    /// A single satisfiable range, inclusive on both ends.
    Satisfiable { start: u64, end: u64 },
    /// Every requested range falls outside the object.
    Unsatisfiable,
}

/// One byte-range-spec from the header, before resolution.
#[derive(Debug)]
enum RangeSpec {
    /// `start-end`, inclusive both ends.
    FromTo(u64, u64),
    /// `start-`, from start to end of object.
    From(u64),
    /// `-n`, the last n bytes.
    Suffix(u64),
}

/// Parse and resolve a `Range` header value against the object size.
///
/// Overlapping or adjacent ranges are combined; more than one range
/// surviving combination downgrades to `None`, as multi-range responses
/// are unsupported.
fn negotiate_range(header: &str, size: u64) -> ParsedRange {
    let Some((unit, specs)) = header.trim().split_once('=') else {
        return ParsedRange::Malformed;
    };
    if unit.trim() != "bytes" {
        return ParsedRange::UnsupportedUnit;
    }

    let mut resolved: Vec<(u64, u64)> = Vec::new();
    for spec in specs.split(',') {
        match parse_range_spec(spec.trim()) {
            None => return ParsedRange::Malformed,
            Some(spec) => {
                if let Some(range) = resolve_range_spec(&spec, size) {
                    resolved.push(range);
                }
            }
        }
    }

    if resolved.is_empty() {
        return ParsedRange::Unsatisfiable;
    }

    match combine_ranges(resolved).as_slice() {
        [(start, end)] => ParsedRange::Satisfiable {
            start: *start,
            end: *end,
        },
        _ => ParsedRange::None,
    }
}

/// Parse a single byte-range-spec like `0-4`, `5-` or `-3`.
fn parse_range_spec(spec: &str) -> Option<RangeSpec> {
    if spec.is_empty() {
        return None;
    }
    if let Some(suffix) = spec.strip_prefix('-') {
        return suffix.parse().ok().map(RangeSpec::Suffix);
    }
    let (start, end) = spec.split_once('-')?;
    let start = start.parse().ok()?;
    if end.is_empty() {
        return Some(RangeSpec::From(start));
    }
    Some(RangeSpec::FromTo(start, end.parse().ok()?))
}

/// Resolve a spec against the object size.  Returns `None` when the
/// spec selects no bytes of the object.
fn resolve_range_spec(spec: &RangeSpec, size: u64) -> Option<(u64, u64)> {
    if size == 0 {
        return None;
    }
    match *spec {
        RangeSpec::FromTo(start, end) => {
            if start >= size || start > end {
                return None;
            }
            Some((start, end.min(size - 1)))
        }
        RangeSpec::From(start) => (start < size).then_some((start, size - 1)),
        RangeSpec::Suffix(n) => {
            if n == 0 {
                return None;
            }
            Some((size.saturating_sub(n), size - 1))
        }
    }
}

/// Merge overlapping and adjacent ranges.
fn combine_ranges(mut ranges: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    ranges.sort_by_key(|r| r.0);
    let mut combined: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match combined.last_mut() {
            Some((_, last_end)) if start <= *last_end + 1 => {
                *last_end = (*last_end).max(end);
            }
            _ => combined.push((start, end)),
        }
    }
    combined
}

// -- Conditional request evaluation -------------------------------------------

/// Decision for conditional-request headers.
#[derive(Debug, PartialEq)]
enum ConditionalOutcome {
    NotModified,
    Proceed,
}

/// Strip the weak prefix and surrounding quotes from an entity tag.
fn normalize_etag(etag: &str) -> &str {
    let etag = etag.trim();
    let etag = etag.strip_prefix("W/").unwrap_or(etag);
    if etag.len() >= 2 && etag.starts_with('"') && etag.ends_with('"') {
        &etag[1..etag.len() - 1]
    } else {
        etag
    }
}

/// Evaluate `If-None-Match` / `If-Modified-Since` against the object's
/// validator and last-modified time.  Only consulted when not serving a
/// satisfiable range.
///
/// `If-Modified-Since` applies only when neither `If-None-Match` nor
/// `If-Range` was sent; comparison is at second resolution.
fn evaluate_conditionals(
    headers: &HeaderMap,
    validator: Option<&str>,
    last_modified: Option<SystemTime>,
) -> ConditionalOutcome {
    let if_none_match = header_str(headers, IF_NONE_MATCH);

    if let (Some(validator), Some(candidate)) = (validator, if_none_match) {
        if normalize_etag(candidate) == validator {
            debug!("Resource unmodified based on eTag");
            return ConditionalOutcome::NotModified;
        }
    }

    if if_none_match.is_none() && !headers.contains_key(IF_RANGE) {
        if let (Some(last_modified), Some(since)) = (
            last_modified,
            header_str(headers, IF_MODIFIED_SINCE)
                .and_then(|v| httpdate::parse_http_date(v).ok()),
        ) {
            if last_modified <= since {
                debug!("Resource unmodified based on update time");
                return ConditionalOutcome::NotModified;
            }
        }
    }

    ConditionalOutcome::Proceed
}

/// Apply `If-Range` gating to an already-satisfiable range.
///
/// A date value honors the range only when the last-modified time is
/// known and not newer than it; any other value must match the
/// validator exactly.  Every doubtful case falls back to the full body.
fn apply_if_range(
    headers: &HeaderMap,
    last_modified: Option<SystemTime>,
    validator: Option<&str>,
    range: Option<(u64, u64)>,
) -> Option<(u64, u64)> {
    let range = range?;
    let Some(if_range) = header_str(headers, IF_RANGE) else {
        return Some(range);
    };

    if let Ok(date) = httpdate::parse_http_date(if_range) {
        return match last_modified {
            Some(last_modified) if last_modified <= date => Some(range),
            Some(_) => {
                debug!("Resource stale based on If-Range last modified");
                None
            }
            None => None,
        };
    }

    match validator {
        Some(validator) if normalize_etag(if_range) == validator => Some(range),
        Some(_) => {
            debug!("Resource stale based on If-Range eTag");
            None
        }
        None => None,
    }
}

// -- Content negotiation ------------------------------------------------------

/// Check whether the client's `Accept` header admits `content_type`.
///
/// Media ranges `*/*` and `type/*` match; the most specific matching
/// range decides, and `q=0` on it rejects.  An absent header accepts
/// everything.
fn accepts(accept: Option<&str>, content_type: &str) -> bool {
    let Some(accept) = accept else { return true };
    if accept.trim().is_empty() {
        return true;
    }
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    let Some((ctype, csub)) = essence.split_once('/') else {
        return true;
    };

    let mut best: Option<(u8, f32)> = None;
    for item in accept.split(',') {
        let mut parts = item.split(';');
        let media = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let q = parts
            .find_map(|p| p.trim().strip_prefix("q=").map(str::trim))
            .and_then(|v| v.parse::<f32>().ok())
            .unwrap_or(1.0);
        let Some((mtype, msub)) = media.split_once('/') else {
            continue;
        };
        let specificity = if mtype == ctype && msub == csub {
            3
        } else if mtype == ctype && msub == "*" {
            2
        } else if mtype == "*" && msub == "*" {
            1
        } else {
            continue;
        };
        if best.map_or(true, |(s, _)| specificity > s) {
            best = Some((specificity, q));
        }
    }

    matches!(best, Some((_, q)) if q > 0.0)
}

// -- Response header builder --------------------------------------------------

/// Quote a validator token as an entity tag, unless already quoted.
fn format_etag(validator: &str) -> String {
    if validator.len() >= 2 && validator.starts_with('"') && validator.ends_with('"') {
        validator.to_string()
    } else {
        format!("\"{validator}\"")
    }
}

/// HTTP dates carry no sub-second precision; the server timestamp is
/// floored to the second before comparison and emission.
fn floor_to_second(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => UNIX_EPOCH + Duration::from_secs(d.as_secs()),
        Err(_) => time,
    }
}

/// Assemble the caching / range-capability headers shared by 200, 206
/// and 304 responses.
fn base_headers(
    meta: &ObjectMetadata,
    validator: Option<&str>,
    last_modified: Option<SystemTime>,
    suppress_content_length: bool,
    cache_control: Option<&str>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();

    // The object is presumed seekable.
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    if let Some(last_modified) = last_modified {
        if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(last_modified)) {
            headers.insert(LAST_MODIFIED, value);
        }
    }
    if let Some(validator) = validator {
        if let Ok(value) = HeaderValue::from_str(&format_etag(validator)) {
            headers.insert(ETAG, value);
        }
    }
    if !suppress_content_length {
        if let Some(size) = meta.size {
            headers.insert(
                CONTENT_LENGTH,
                HeaderValue::from_str(&size.to_string()).expect("decimal is ASCII"),
            );
        }
    }
    if let Some(content_type) = &meta.content_type {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
    }
    if let Some(cache_control) = cache_control {
        if let Ok(value) = HeaderValue::from_str(cache_control) {
            headers.insert(CACHE_CONTROL, value);
        }
    }

    headers
}

// -- Handler ------------------------------------------------------------------

/// `GET /file/{name}` -- serve a blob with byte-range and
/// conditional-request semantics.
#[utoipa::path(
    get,
    path = "/file/{name}",
    tag = "File",
    operation_id = "GetFile",
    params(("name" = String, Path, description = "Object name")),
    responses(
        (status = 200, description = "Full object body"),
        (status = 206, description = "Partial content (range request)"),
        (status = 304, description = "Not modified"),
        (status = 400, description = "Malformed Range header"),
        (status = 404, description = "Object not found"),
        (status = 406, description = "Content type not acceptable"),
        (status = 416, description = "Range not satisfiable"),
        (status = 500, description = "Internal error"),
        (status = 502, description = "Upstream failure"),
        (status = 504, description = "Upstream timeout")
    )
)]
pub async fn get_object(
    state: Arc<AppState>,
    name: &str,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<Response, GatewayError> {
    // Metadata resolution gate.  Resolver failures propagate, never retry.
    let meta = state
        .store
        .fetch_metadata(name)
        .await
        .map_err(|e| {
            GatewayError::internal("Failed to resolve object metadata").with_underlying(e)
        })?
        .ok_or_else(GatewayError::not_found)?;

    if meta.size == Some(0) {
        return Err(GatewayError::internal("File has 0 bytes size").with_context("file", name));
    }

    let last_modified = meta.last_modified.map(floor_to_second);
    let validator = meta.validator.as_deref().map(normalize_etag);
    let suppress_len = header_str(headers, NO_CONTENT_LENGTH_HEADER) == Some("true");

    let mut response_headers = base_headers(
        &meta,
        validator,
        last_modified,
        suppress_len,
        state.config.server.cache_control.as_deref(),
    );

    // Content negotiation happens before any byte is streamed.
    if let Some(content_type) = &meta.content_type {
        if !accepts(header_str(headers, ACCEPT), content_type) {
            return Err(GatewayError::not_acceptable());
        }
    }

    // Range negotiation.  An unknown size suppresses range support.
    let raw_range = header_str(headers, RANGE);
    let parsed = match (raw_range, meta.size) {
        (Some(value), Some(size)) => negotiate_range(value, size),
        _ => ParsedRange::None,
    };

    let range = match parsed {
        ParsedRange::Malformed => {
            let value = raw_range.unwrap_or_default();
            warn!("Malformed 'Range' header: {value}");
            return Err(GatewayError::bad_request("Malformed 'Range' header")
                .with_context("requestRangeHeader", value));
        }
        ParsedRange::UnsupportedUnit | ParsedRange::Unsatisfiable => {
            let value = raw_range.unwrap_or_default();
            let size = meta.size.unwrap_or(0);
            warn!("Unsatisfiable 'Range' header: {value} - max size: {size}");
            return Err(GatewayError::range_not_satisfiable()
                .with_header(CONTENT_RANGE, format!("bytes */{size}"))
                .with_context("requestRangeHeader", value)
                .with_context("maxContentLength", size));
        }
        ParsedRange::Satisfiable { start, end } => Some((start, end)),
        ParsedRange::None => None,
    };

    let range = apply_if_range(headers, last_modified, validator, range);

    let status = match range {
        Some((start, end)) => {
            let total = meta.size.expect("range resolved against a known size");
            response_headers.insert(
                CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {start}-{end}/{total}"))
                    .expect("decimal is ASCII"),
            );
            response_headers.insert(
                CONTENT_LENGTH,
                HeaderValue::from_str(&(end - start + 1).to_string()).expect("decimal is ASCII"),
            );
            StatusCode::PARTIAL_CONTENT
        }
        None => {
            // Conditional evaluation applies to full-body responses only.
            if evaluate_conditionals(headers, validator, last_modified)
                == ConditionalOutcome::NotModified
            {
                let mut response = StatusCode::NOT_MODIFIED.into_response();
                response.headers_mut().extend(response_headers);
                return Ok(response);
            }
            StatusCode::OK
        }
    };

    // Stream pipeline.  Open-time failures still become the response;
    // later ones can only cut the body short.
    let ctx = StreamContext::new(name.to_string(), query.clone());
    let stream = state
        .store
        .open_read_stream(name, range)
        .await
        .map_err(|err| pipeline::translate_read_error(err, &ctx))?;

    let mut response = (status, pipeline::pipe_to_body(ctx, stream)).into_response();
    response.headers_mut().extend(response_headers);
    Ok(response)
}

// -- Unit tests ---------------------------------------------------------------
