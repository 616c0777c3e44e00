//! Blobgate library -- HTTP blob-serving gateway.
//!
//! This crate provides the components for running a gateway that serves
//! remote-stored blobs over HTTP with byte-range and conditional-request
//! semantics: request handling, range and precondition evaluation, a
//! streaming pipeline with error translation, and pluggable blob stores.

use std::sync::Arc;

pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod pipeline;
pub mod server;
pub mod storage;

use crate::config::Config;
use crate::storage::backend::BlobStore;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Blob store the gateway reads from (GCS gateway or in-memory).
    pub store: Arc<dyn BlobStore>,
}
