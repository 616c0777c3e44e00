//! Abstract blob store contract.
//!
//! Every backend must implement [`BlobStore`].  The trait exposes the
//! two collaborator operations the gateway core needs: a metadata fetch
//! and a ranged read stream.  Streams are wrapped in [`BlobStream`] so
//! the pipeline can forcibly release the backend resource on failure or
//! client disconnect.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::time::SystemTime;
use thiserror::Error;
use tracing::warn;

use crate::errors::GatewayError;

/// Metadata for a stored object, resolved once per request.
///
/// Every field is optional: a resolver that returns a malformed payload
/// is normalized to `ObjectMetadata::default()` and downstream logic
/// tolerates all fields being absent.  An unknown size suppresses range
/// support and `Content-Length` emission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectMetadata {
    /// MIME type of the object, if recorded.
    pub content_type: Option<String>,
    /// Object length in bytes, if known.
    pub size: Option<u64>,
    /// Last modification time, if known.
    pub last_modified: Option<SystemTime>,
    /// Opaque validator token (entity tag) for the current content.
    pub validator: Option<String>,
}

/// Failure reported by a blob read stream, either at open time or
/// asynchronously mid-stream.
#[derive(Debug, Error)]
pub enum ReadError {
    /// Transport-level failure identified by a code such as `ETIMEDOUT`.
    #[error("{message}")]
    Code { code: String, message: String },

    /// HTTP-shaped upstream failure.
    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Already-classified gateway error; passes through translation
    /// unchanged.
    #[error(transparent)]
    Classified(#[from] GatewayError),

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Chunked byte stream yielded by a blob store.
pub type ChunkStream = BoxStream<'static, Result<Bytes, ReadError>>;

/// A backend read stream plus its forced-release handle.
///
/// Dropping the inner chunk stream closes the backend connection;
/// [`release`](BlobStream::release) does so eagerly and fires the
/// optional release hook at most once.
pub struct BlobStream {
    chunks: Option<ChunkStream>,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl BlobStream {
    /// Wrap a chunk stream with no release hook.
    pub fn new(chunks: ChunkStream) -> Self {
        Self {
            chunks: Some(chunks),
            on_release: None,
        }
    }

    /// Attach a hook invoked when the stream is forcibly released.
    pub fn with_release_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    /// Pull the next chunk.  Returns `None` at end of stream or after
    /// the stream has been released.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, ReadError>> {
        match self.chunks.as_mut() {
            Some(chunks) => chunks.next().await,
            None => None,
        }
    }

    /// Forcibly release the underlying backend resource.
    ///
    /// Best-effort: releasing an already-released stream is logged, not
    /// escalated.
    pub fn release(&mut self) {
        let dropped = self.chunks.take().is_some();
        match self.on_release.take() {
            Some(hook) => hook(),
            None if !dropped => warn!("Blob stream already released"),
            None => {}
        }
    }
}

impl std::fmt::Debug for BlobStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStream")
            .field("chunks", &self.chunks.as_ref().map(|_| "..."))
            .field("on_release", &self.on_release.as_ref().map(|_| "..."))
            .finish()
    }
}

/// Async read-only blob store contract.
pub trait BlobStore: Send + Sync + 'static {
    /// Fetch object metadata.  `Ok(None)` means the object does not
    /// exist; `Err` means the resolver call itself failed and is
    /// propagated, never retried.
    fn fetch_metadata(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectMetadata>>> + Send + '_>>;

    /// Open a read stream over the whole object, or over the inclusive
    /// byte range `(start, end)` when one is given.
    fn open_read_stream(
        &self,
        name: &str,
        range: Option<(u64, u64)>,
    ) -> Pin<Box<dyn Future<Output = Result<BlobStream, ReadError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn chunk_stream(chunks: Vec<&'static [u8]>) -> ChunkStream {
        futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c)))).boxed()
    }

    #[tokio::test]
    async fn next_chunk_drains_then_ends() {
        let mut stream = BlobStream::new(chunk_stream(vec![b"ab", b"cd"]));
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), "ab");
        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), "cd");
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn release_fires_hook_exactly_once() {
        let releases = Arc::new(AtomicUsize::new(0));
        let counter = releases.clone();
        let mut stream = BlobStream::new(chunk_stream(vec![b"ab"]))
            .with_release_hook(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        stream.release();
        stream.release();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(stream.next_chunk().await.is_none());
    }
}
