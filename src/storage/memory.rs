//! In-memory blob store.
//!
//! Objects are held in a `tokio::sync::RwLock<HashMap<...>>` map.  Used
//! as the local development backend and by the unit and router tests,
//! which also rely on its failure injection to drive the stream-error
//! translation path.

use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::backend::{BlobStore, BlobStream, ObjectMetadata, ReadError};

/// Default size of the chunks a stored object is sliced into.
const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Failure injected into a read stream.
#[derive(Debug, Clone)]
pub enum InjectedFailure {
    /// Transport-level code, e.g. `ETIMEDOUT`.
    Code { code: String, message: String },
    /// HTTP-shaped upstream failure.
    Upstream { status: u16, message: String },
    /// Unclassified failure carrying only a message.
    Message(String),
}

impl InjectedFailure {
    fn into_read_error(self) -> ReadError {
        match self {
            InjectedFailure::Code { code, message } => ReadError::Code { code, message },
            InjectedFailure::Upstream { status, message } => {
                ReadError::Upstream { status, message }
            }
            InjectedFailure::Message(message) => ReadError::Other(anyhow::anyhow!(message)),
        }
    }
}

struct StoredBlob {
    data: Bytes,
    metadata: ObjectMetadata,
    /// Fail the stream after this many chunks have been yielded.  Zero
    /// fails the open call itself.
    fail_after_chunks: Option<(usize, InjectedFailure)>,
}

/// In-memory blob store.
pub struct MemoryStore {
    objects: tokio::sync::RwLock<HashMap<String, StoredBlob>>,
    chunk_size: usize,
    /// Count of forced stream releases across all opened streams.
    releases: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            objects: tokio::sync::RwLock::new(HashMap::new()),
            chunk_size: DEFAULT_CHUNK_SIZE,
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Override the stream chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Insert an object.
    pub async fn insert(&self, name: &str, data: Bytes, metadata: ObjectMetadata) {
        self.objects.write().await.insert(
            name.to_string(),
            StoredBlob {
                data,
                metadata,
                fail_after_chunks: None,
            },
        );
    }

    /// Insert an object whose read stream fails after `after_chunks`
    /// chunks (`0` fails the open call itself).
    pub async fn insert_failing(
        &self,
        name: &str,
        data: Bytes,
        metadata: ObjectMetadata,
        after_chunks: usize,
        failure: InjectedFailure,
    ) {
        self.objects.write().await.insert(
            name.to_string(),
            StoredBlob {
                data,
                metadata,
                fail_after_chunks: Some((after_chunks, failure)),
            },
        );
    }

    /// Number of forced stream releases observed so far.
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for MemoryStore {
    fn fetch_metadata(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectMetadata>>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let objects = self.objects.read().await;
            Ok(objects.get(&name).map(|blob| blob.metadata.clone()))
        })
    }

    fn open_read_stream(
        &self,
        name: &str,
        range: Option<(u64, u64)>,
    ) -> Pin<Box<dyn Future<Output = Result<BlobStream, ReadError>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let objects = self.objects.read().await;
            let blob = objects.get(&name).ok_or(ReadError::Upstream {
                status: 404,
                message: format!("object {name} not found"),
            })?;

            if let Some((0, failure)) = &blob.fail_after_chunks {
                return Err(failure.clone().into_read_error());
            }

            let data = match range {
                Some((start, end)) => {
                    let start = (start as usize).min(blob.data.len());
                    let end = ((end + 1) as usize).min(blob.data.len()).max(start);
                    blob.data.slice(start..end)
                }
                None => blob.data.clone(),
            };

            // Slice into chunks eagerly; objects in this store are small.
            let mut items: Vec<Result<Bytes, ReadError>> = data
                .chunks(self.chunk_size)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();

            if let Some((after, failure)) = &blob.fail_after_chunks {
                items.truncate(*after);
                items.push(Err(failure.clone().into_read_error()));
            }

            let releases = self.releases.clone();
            Ok(
                BlobStream::new(futures::stream::iter(items).boxed()).with_release_hook(
                    move || {
                        releases.fetch_add(1, Ordering::SeqCst);
                    },
                ),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(size: u64) -> ObjectMetadata {
        ObjectMetadata {
            content_type: Some("application/octet-stream".to_string()),
            size: Some(size),
            last_modified: None,
            validator: None,
        }
    }

    #[tokio::test]
    async fn fetch_metadata_returns_none_for_missing_object() {
        let store = MemoryStore::new();
        assert!(store.fetch_metadata("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn range_open_yields_the_sub_slice() {
        let store = MemoryStore::new().with_chunk_size(4);
        store
            .insert("blob", Bytes::from_static(b"0123456789"), meta(10))
            .await;

        let mut stream = store
            .open_read_stream("blob", Some((2, 6)))
            .await
            .unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next_chunk().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"23456");
    }

    #[tokio::test]
    async fn injected_failure_surfaces_after_n_chunks() {
        let store = MemoryStore::new().with_chunk_size(2);
        store
            .insert_failing(
                "blob",
                Bytes::from_static(b"abcdef"),
                meta(6),
                1,
                InjectedFailure::Code {
                    code: "ETIMEDOUT".to_string(),
                    message: "socket timed out".to_string(),
                },
            )
            .await;

        let mut stream = store.open_read_stream("blob", None).await.unwrap();
        assert!(stream.next_chunk().await.unwrap().is_ok());
        let err = stream.next_chunk().await.unwrap().unwrap_err();
        assert!(matches!(err, ReadError::Code { ref code, .. } if code == "ETIMEDOUT"));
    }

    #[tokio::test]
    async fn zero_chunk_failure_fails_the_open() {
        let store = MemoryStore::new();
        store
            .insert_failing(
                "blob",
                Bytes::from_static(b"abc"),
                meta(3),
                0,
                InjectedFailure::Upstream {
                    status: 503,
                    message: "backend unavailable".to_string(),
                },
            )
            .await;

        let err = store.open_read_stream("blob", None).await.unwrap_err();
        assert!(matches!(err, ReadError::Upstream { status: 503, .. }));
    }
}
