//! Streaming pipeline and stream-error translation.
//!
//! Connects a backend blob stream to the client response body through an
//! explicit bounded pull loop: a spawned task pulls chunks from the
//! backend and sends them into a bounded channel the response body
//! drains.  The loop suspends at exactly two points -- the backend read
//! and the channel send -- so the backend read rate is throttled by the
//! client's ability to accept bytes.
//!
//! Stream failures are classified into [`GatewayError`]s here.  Failures
//! surfacing at open time become the response; failures after the first
//! byte can no longer change the status, so they are logged and the body
//! is cut short.

use std::collections::HashMap;

use axum::body::Body;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::error;

use crate::errors::GatewayError;
use crate::storage::backend::{BlobStream, ReadError};

/// Chunks buffered between the backend reader and the client writer.
const PIPE_DEPTH: usize = 8;

/// Backend error codes that map to 504 Gateway Timeout.
const GATEWAY_TIMEOUT_CODES: &[&str] = &["ETIMEDOUT", "ESOCKETTIMEDOUT"];

// -- Content-processing failure matching --------------------------------------

/// Known content-processing failures, recognized by substring.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ProcessingFailure {
    /// The upstream processor rejected the input format.
    UnsupportedFormat,
    /// Processing produced a zero-sized output.
    ZeroSizedOutput,
    /// A required processing parameter was left unset.
    MissingParameter,
}

/// Substring-to-classification table.  Best-effort by construction: the
/// upstream failure contract is unversioned, so message matching lives
/// only here and nowhere else in the pipeline.
const PROCESSING_PATTERNS: &[(&str, ProcessingFailure)] = &[
    (
        "unsupported image format",
        ProcessingFailure::UnsupportedFormat,
    ),
    (
        ": image has shrunk to nothing",
        ProcessingFailure::ZeroSizedOutput,
    ),
    (
        "extract_area: parameter height not set",
        ProcessingFailure::MissingParameter,
    ),
];

fn match_processing_failure(message: &str) -> Option<ProcessingFailure> {
    PROCESSING_PATTERNS
        .iter()
        .find(|(pattern, _)| message.contains(pattern))
        .map(|(_, class)| *class)
}

// -- Diagnostic context -------------------------------------------------------

/// Diagnostic context attached to translated stream errors.
#[derive(Debug, Clone)]
pub struct StreamContext {
    /// Pipeline tag for log correlation.
    pub tag: &'static str,
    /// Object the stream was reading.
    pub source: String,
    /// Request query map, passed through opaquely.
    pub query: HashMap<String, String>,
}

impl StreamContext {
    pub fn new(source: String, query: HashMap<String, String>) -> Self {
        Self {
            tag: "blobStreamer",
            source,
            query,
        }
    }
}

// -- Error translation --------------------------------------------------------

/// Classify a stream failure into a canonical gateway error.
///
/// Order: known content-processing failure strings first, then
/// already-classified errors pass through unchanged, then timeout codes
/// (504), upstream 4xx mirrored, upstream 5xx folded to 502, and 500
/// for everything else.
pub fn translate_read_error(err: ReadError, ctx: &StreamContext) -> GatewayError {
    let message = err.to_string();

    match match_processing_failure(&message) {
        Some(ProcessingFailure::ZeroSizedOutput) => {
            error!(
                "[{}] Image was shrunk to a zero size ({:?}) {}",
                ctx.tag, ctx.query, ctx.source
            );
            return with_stream_context(
                GatewayError::bad_request("Requesting 0 sized image"),
                err,
                ctx,
            );
        }
        Some(ProcessingFailure::UnsupportedFormat) => {
            // Logged for diagnostics; translated through the generic path.
            error!("[{}] Image could not be processed {}", ctx.tag, ctx.source);
        }
        Some(ProcessingFailure::MissingParameter) => {
            error!(
                "[{}] {} ({:?}) {}",
                ctx.tag, message, ctx.query, ctx.source
            );
        }
        None => {}
    }

    // Already-classified errors pass through unchanged.
    let err = match err {
        ReadError::Classified(gw) => return gw,
        err => err,
    };

    let translated = match &err {
        ReadError::Classified(_) => unreachable!("handled above"),
        ReadError::Code { code, message } => {
            if GATEWAY_TIMEOUT_CODES.contains(&code.as_str()) {
                GatewayError::gateway_timeout(message.clone())
            } else {
                GatewayError::internal(message.clone())
            }
        }
        ReadError::Upstream { status, message } => match *status {
            400..=499 => GatewayError::new(*status, message.clone()),
            // The backend's own 5xx is an upstream fault, never mirrored.
            500..=599 => GatewayError::bad_gateway(message.clone()),
            _ => GatewayError::internal(message.clone()),
        },
        ReadError::Other(e) => GatewayError::internal(e.to_string()),
    };

    with_stream_context(translated, err, ctx)
}

/// Attach the original failure and tag/source/query diagnostics.
fn with_stream_context(base: GatewayError, err: ReadError, ctx: &StreamContext) -> GatewayError {
    let query: serde_json::Map<String, serde_json::Value> = ctx
        .query
        .iter()
        .map(|(k, v)| (k.clone(), v.clone().into()))
        .collect();

    base.with_context("underlyingErr", err.to_string())
        .with_context("tag", ctx.tag)
        .with_context("source", ctx.source.clone())
        .with_context("query", serde_json::Value::Object(query))
        .with_underlying(anyhow::Error::new(err))
}

// -- Pull loop ----------------------------------------------------------------

/// Connect a backend stream to a response [`Body`] through the bounded
/// pull loop.
pub fn pipe_to_body(ctx: StreamContext, stream: BlobStream) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, GatewayError>>(PIPE_DEPTH);
    tokio::spawn(pump(ctx, stream, tx));
    Body::from_stream(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

/// Pull chunks from the backend and push them to the client channel.
///
/// On client disconnect or stream failure the backend stream is
/// forcibly released so the connection is not leaked; release is
/// best-effort and never escalated.
async fn pump(
    ctx: StreamContext,
    mut stream: BlobStream,
    tx: mpsc::Sender<Result<Bytes, GatewayError>>,
) {
    loop {
        match stream.next_chunk().await {
            Some(Ok(chunk)) => {
                // Suspends while the client is slower than the backend; a
                // send error means the client hung up.
                if tx.send(Ok(chunk)).await.is_err() {
                    stream.release();
                    return;
                }
            }
            Some(Err(err)) => {
                stream.release();
                let translated = translate_read_error(err, &ctx);
                metrics::counter!(crate::metrics::STREAM_ERRORS_TOTAL, "kind" => translated.kind())
                    .increment(1);
                // Headers are already out; the failure can only be logged
                // and the body cut short.
                error!(
                    "[{}] Stream error for {}: {}",
                    ctx.tag, ctx.source, translated
                );
                let _ = tx.send(Err(translated)).await;
                return;
            }
            None => return,
        }
    }
}
