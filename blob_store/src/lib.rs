mod error;

use std::{env, fmt::Debug, ops::Range, path::PathBuf, sync::Arc};

use bytes::Bytes;
use data_model::ArtifactKey;
pub use error::{BlobError, BlobResult};
use futures::{stream::BoxStream, Stream, StreamExt, TryStreamExt};
use metrics::{blob_storage::Metrics, Timer};
use object_store::{
    aws::{AmazonS3Builder, AmazonS3ConfigKey},
    parse_url,
    parse_url_opts,
    path::Path,
    GetOptions,
    GetRange,
    ObjectStore,
    ObjectStoreScheme,
    WriteMultipart,
};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

const CHUNKS_DIR: &str = "chunks";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlobStorageConfig {
    pub path: String,
    #[serde(default)]
    pub region: Option<String>,
}

impl BlobStorageConfig {
    pub fn new(path: &str) -> Self {
        BlobStorageConfig {
            path: format!("file://{}", path),
            region: None,
        }
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        let blob_store_path = format!(
            "file://{}",
            env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("artifact_storage/blobs")
                .display()
        );
        BlobStorageConfig {
            path: blob_store_path,
            region: None,
        }
    }
}

/// Cursor into an object opened for upload. Writes made through the handle
/// advance its offset past the furthest byte written.
#[derive(Debug, Clone)]
pub struct WriteHandle {
    key: ArtifactKey,
    offset: u64,
}

impl WriteHandle {
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// A bounded read over an object. `end` is inclusive.
pub struct RangeRead {
    pub stream: BoxStream<'static, BlobResult<Bytes>>,
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl RangeRead {
    pub fn content_length(&self) -> u64 {
        self.end + 1 - self.start
    }
}

#[derive(Debug, Clone)]
struct ChunkMeta {
    location: Path,
    offset: u64,
    size: u64,
}

impl ChunkMeta {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Clone)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    path: Path,
    max_chunk_bytes: Option<u64>,
    metrics: Arc<Metrics>,
}

impl Debug for BlobStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStorage")
            .field("object_store", &self.object_store.to_string())
            .field("path", &self.path)
            .finish()
    }
}

impl BlobStorage {
    pub fn new(config: BlobStorageConfig) -> BlobResult<Self> {
        let (object_store, path) = Self::build_object_store(&config)?;
        info!(path = %config.path, "using blob store");
        Ok(Self {
            object_store: Arc::from(object_store),
            path,
            max_chunk_bytes: None,
            metrics: Arc::new(Metrics::new()),
        })
    }

    pub fn with_max_chunk_bytes(mut self, limit: u64) -> Self {
        self.max_chunk_bytes = Some(limit);
        self
    }

    fn build_object_store(config: &BlobStorageConfig) -> BlobResult<(Box<dyn ObjectStore>, Path)> {
        let url = config.path.parse::<Url>()?;
        let (scheme, _) = ObjectStoreScheme::parse(&url).map_err(|e| BlobError::InvalidPath {
            path: config.path.clone(),
            reason: e.to_string(),
        })?;
        match scheme {
            ObjectStoreScheme::AmazonS3 => {
                // inject AWS environment variables to prioritize keys over instance metadata
                // credentials.
                let mut opts: Vec<(AmazonS3ConfigKey, String)> = std::env::vars_os()
                    .filter_map(|(os_key, os_value)| {
                        if let (Some(key), Some(value)) = (os_key.to_str(), os_value.to_str()) {
                            if key.starts_with("AWS_") {
                                if let Ok(config_key) = key.to_ascii_lowercase().parse() {
                                    return Some((config_key, String::from(value)));
                                }
                            }
                        }
                        None
                    })
                    .collect();
                if let Some(region) = &config.region {
                    opts.push((AmazonS3ConfigKey::Region, region.clone()));
                }

                let mut s3_builder = AmazonS3Builder::new().with_url(config.path.as_str());
                for (key, value) in opts.iter() {
                    s3_builder = s3_builder.with_config(*key, value.clone());
                }
                let s3 = s3_builder.build()?;
                let (_, path) = parse_url_opts(&url, opts)?;
                Ok((Box::new(s3), path))
            }
            _ => Ok(parse_url(&url)?),
        }
    }

    fn object_prefix(&self, key: &ArtifactKey) -> Path {
        self.path
            .child(key.scope.run_id.as_str())
            .child(key.scope.job_id.as_str())
            .child(key.name.as_str())
            .child(CHUNKS_DIR)
    }

    fn chunk_path(&self, key: &ArtifactKey, offset: u64) -> Path {
        self.object_prefix(key).child(format!("{:020}", offset))
    }

    fn record_error<T>(&self, op: &'static str, result: BlobResult<T>) -> BlobResult<T> {
        if let Err(err) = &result {
            if !matches!(
                err,
                BlobError::NotFound { .. } | BlobError::RangeNotSatisfiable { .. }
            ) {
                self.metrics.errors.add(1, &[KeyValue::new("op", op)]);
            }
        }
        result
    }

    async fn list_chunks(&self, key: &ArtifactKey) -> BlobResult<Vec<ChunkMeta>> {
        let prefix = self.object_prefix(key);
        let objects: Vec<_> = self.object_store.list(Some(&prefix)).try_collect().await?;
        let mut chunks = Vec::with_capacity(objects.len());
        for meta in objects {
            let Some(offset) = meta
                .location
                .filename()
                .and_then(|name| name.parse::<u64>().ok())
            else {
                warn!(location = %meta.location, "ignoring unexpected object in chunk prefix");
                continue;
            };
            chunks.push(ChunkMeta {
                location: meta.location,
                offset,
                size: meta.size,
            });
        }
        chunks.sort_by_key(|c| c.offset);
        Ok(chunks)
    }

    fn ensure_contiguous(key: &ArtifactKey, chunks: &[ChunkMeta]) -> BlobResult<u64> {
        let mut expected = 0;
        for chunk in chunks {
            if chunk.offset != expected {
                return Err(BlobError::Inconsistent {
                    key: key.to_string(),
                    reason: if chunk.offset > expected {
                        format!("gap between byte {} and {}", expected, chunk.offset)
                    } else {
                        format!("chunk at {} overlaps byte {}", chunk.offset, expected)
                    },
                });
            }
            expected = chunk.end();
        }
        Ok(expected)
    }

    /// Opens `key` for upload positioned at the current end of the object.
    pub async fn open_for_write(&self, key: &ArtifactKey) -> BlobResult<WriteHandle> {
        let offset = self.length(key).await?;
        Ok(WriteHandle {
            key: key.clone(),
            offset,
        })
    }

    /// Streams `data` into a new chunk object starting at `offset`. Returns
    /// the number of bytes written. An empty stream writes nothing.
    pub async fn write_chunk<S, E>(
        &self,
        handle: &mut WriteHandle,
        offset: u64,
        data: S,
    ) -> BlobResult<u64>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Unpin,
        E: Into<anyhow::Error>,
    {
        let _timer = Timer::start_with_labels(
            &self.metrics.operations,
            &[KeyValue::new("op", "write_chunk")],
        );
        let result = self.stream_chunk(&handle.key, offset, data).await;
        let written = self.record_error("write_chunk", result)?;
        handle.offset = handle.offset.max(offset + written);
        Ok(written)
    }

    /// Writes `data` at the handle's current offset.
    pub async fn append<S, E>(&self, handle: &mut WriteHandle, data: S) -> BlobResult<u64>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Unpin,
        E: Into<anyhow::Error>,
    {
        let offset = handle.offset;
        self.write_chunk(handle, offset, data).await
    }

    async fn stream_chunk<S, E>(&self, key: &ArtifactKey, offset: u64, mut data: S) -> BlobResult<u64>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Unpin,
        E: Into<anyhow::Error>,
    {
        let path = self.chunk_path(key, offset);
        match self.object_store.head(&path).await {
            Ok(_) => {
                return Err(BlobError::ConflictingWrite {
                    key: key.to_string(),
                    offset,
                })
            }
            Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let mut writer: Option<WriteMultipart> = None;
        let mut size_bytes: u64 = 0;
        while let Some(chunk) = data.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    if let Some(w) = writer.take() {
                        let _ = w.abort().await;
                    }
                    return Err(BlobError::Backend { source: e.into() });
                }
            };
            if chunk.is_empty() {
                continue;
            }
            size_bytes += chunk.len() as u64;
            if let Some(limit) = self.max_chunk_bytes {
                if size_bytes > limit {
                    if let Some(w) = writer.take() {
                        let _ = w.abort().await;
                    }
                    return Err(BlobError::ChunkTooLarge { limit });
                }
            }
            if writer.is_none() {
                let upload = self.object_store.put_multipart(&path).await?;
                writer = Some(WriteMultipart::new(upload));
            }
            if let Some(w) = writer.as_mut() {
                w.wait_for_capacity(1).await?;
                w.write(&chunk);
            }
        }
        if let Some(w) = writer {
            w.finish().await?;
        }
        debug!(key = %key, offset, size_bytes, "wrote chunk");
        Ok(size_bytes)
    }

    /// Total bytes stored for `key`; zero when nothing has been written.
    pub async fn length(&self, key: &ArtifactKey) -> BlobResult<u64> {
        let _timer =
            Timer::start_with_labels(&self.metrics.operations, &[KeyValue::new("op", "length")]);
        let result = async {
            let chunks = self.list_chunks(key).await?;
            Self::ensure_contiguous(key, &chunks)
        }
        .await;
        self.record_error("length", result)
    }

    /// Streams bytes `start..=end` of `key`, `end` defaulting to the last
    /// byte and clamped to it.
    pub async fn read_range(
        &self,
        key: &ArtifactKey,
        start: u64,
        end: Option<u64>,
    ) -> BlobResult<RangeRead> {
        let _timer = Timer::start_with_labels(
            &self.metrics.operations,
            &[KeyValue::new("op", "read_range")],
        );
        let result = self.open_range(key, start, end).await;
        self.record_error("read_range", result)
    }

    async fn open_range(
        &self,
        key: &ArtifactKey,
        start: u64,
        end: Option<u64>,
    ) -> BlobResult<RangeRead> {
        let chunks = self.list_chunks(key).await?;
        if chunks.is_empty() {
            return Err(BlobError::NotFound {
                key: key.to_string(),
            });
        }
        let total = Self::ensure_contiguous(key, &chunks)?;
        if start >= total {
            return Err(BlobError::RangeNotSatisfiable { total });
        }
        let end = end.map_or(total - 1, |end| end.min(total - 1));
        if end < start {
            return Err(BlobError::RangeNotSatisfiable { total });
        }

        let segments: Vec<(Path, Range<u64>)> = chunks
            .into_iter()
            .filter(|c| c.offset <= end && c.end() > start)
            .map(|c| {
                let lo = start.max(c.offset) - c.offset;
                let hi = (end + 1).min(c.end()) - c.offset;
                (c.location, lo..hi)
            })
            .collect();

        let object_store = self.object_store.clone();
        let stream = futures::stream::iter(segments.into_iter().map(Ok::<_, BlobError>))
            .and_then(move |(location, range)| {
                let object_store = object_store.clone();
                async move {
                    let options = GetOptions {
                        range: Some(GetRange::Bounded(range)),
                        ..Default::default()
                    };
                    let result = object_store.get_opts(&location, options).await?;
                    Ok::<_, BlobError>(result.into_stream().map_err(BlobError::from))
                }
            })
            .try_flatten()
            .boxed();

        Ok(RangeRead {
            stream,
            start,
            end,
            total,
        })
    }

    /// Removes every chunk of `key`. Missing objects are a no-op.
    pub async fn delete(&self, key: &ArtifactKey) -> BlobResult<()> {
        let _timer =
            Timer::start_with_labels(&self.metrics.operations, &[KeyValue::new("op", "delete")]);
        let result = async {
            for chunk in self.list_chunks(key).await? {
                match self.object_store.delete(&chunk.location).await {
                    Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                    Err(e) => return Err(BlobError::from(e)),
                }
            }
            Ok::<(), BlobError>(())
        }
        .await;
        self.record_error("delete", result)
    }

    /// Reads the whole object into memory.
    #[cfg(test)]
    async fn read_all(&self, key: &ArtifactKey) -> BlobResult<Bytes> {
        let read = self.read_range(key, 0, None).await?;
        let parts: Vec<Bytes> = read.stream.try_collect().await?;
        Ok(parts.concat().into())
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{mock_key, mock_other_job_scope};

    use super::*;

    fn memory_store() -> BlobStorage {
        BlobStorage::new(BlobStorageConfig {
            path: "memory://".to_string(),
            region: None,
        })
        .unwrap()
    }

    fn bytes_stream(
        parts: Vec<&'static [u8]>,
    ) -> impl Stream<Item = Result<Bytes, anyhow::Error>> + Send + Unpin {
        futures::stream::iter(
            parts
                .into_iter()
                .map(|p| Ok::<_, anyhow::Error>(Bytes::from_static(p))),
        )
    }

    #[tokio::test]
    async fn test_chunked_write_and_full_read() {
        let storage = memory_store();
        let key = mock_key("artifact");
        let mut handle = storage.open_for_write(&key).await.unwrap();
        assert_eq!(handle.offset(), 0);

        let written = storage
            .append(&mut handle, bytes_stream(vec![b"hello ", b"wor"]))
            .await
            .unwrap();
        assert_eq!(written, 9);
        storage
            .append(&mut handle, bytes_stream(vec![b"ld"]))
            .await
            .unwrap();
        assert_eq!(handle.offset(), 11);
        assert_eq!(storage.length(&key).await.unwrap(), 11);
        assert_eq!(storage.read_all(&key).await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn test_range_spans_chunks() {
        let storage = memory_store();
        let key = mock_key("artifact");
        let mut handle = storage.open_for_write(&key).await.unwrap();
        storage
            .append(&mut handle, bytes_stream(vec![b"AAAA"]))
            .await
            .unwrap();
        storage
            .append(&mut handle, bytes_stream(vec![b"BBBB"]))
            .await
            .unwrap();

        let read = storage.read_range(&key, 2, Some(5)).await.unwrap();
        assert_eq!((read.start, read.end, read.total), (2, 5, 8));
        let parts: Vec<Bytes> = read.stream.try_collect().await.unwrap();
        assert_eq!(parts.concat(), b"AABB");

        let read = storage.read_range(&key, 6, Some(100)).await.unwrap();
        assert_eq!(read.end, 7);
        assert_eq!(read.content_length(), 2);
    }

    #[tokio::test]
    async fn test_range_errors() {
        let storage = memory_store();
        let key = mock_key("artifact");
        assert!(matches!(
            storage.read_range(&key, 0, None).await,
            Err(BlobError::NotFound { .. })
        ));

        let mut handle = storage.open_for_write(&key).await.unwrap();
        storage
            .append(&mut handle, bytes_stream(vec![b"0123456789"]))
            .await
            .unwrap();
        assert!(matches!(
            storage.read_range(&key, 10, None).await,
            Err(BlobError::RangeNotSatisfiable { total: 10 })
        ));
        assert!(matches!(
            storage.read_range(&key, 5, Some(4)).await,
            Err(BlobError::RangeNotSatisfiable { total: 10 })
        ));
    }

    #[tokio::test]
    async fn test_conflicting_and_gapped_writes() {
        let storage = memory_store();
        let key = mock_key("artifact");
        let mut handle = storage.open_for_write(&key).await.unwrap();
        storage
            .write_chunk(&mut handle, 0, bytes_stream(vec![b"abc"]))
            .await
            .unwrap();
        assert!(matches!(
            storage
                .write_chunk(&mut handle, 0, bytes_stream(vec![b"xyz"]))
                .await,
            Err(BlobError::ConflictingWrite { offset: 0, .. })
        ));

        storage
            .write_chunk(&mut handle, 10, bytes_stream(vec![b"late"]))
            .await
            .unwrap();
        assert_eq!(handle.offset(), 14);
        assert!(matches!(
            storage.length(&key).await,
            Err(BlobError::Inconsistent { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_chunk_writes_nothing() {
        let storage = memory_store();
        let key = mock_key("artifact");
        let mut handle = storage.open_for_write(&key).await.unwrap();
        let written = storage
            .append(&mut handle, bytes_stream(vec![b""]))
            .await
            .unwrap();
        assert_eq!(written, 0);
        assert_eq!(storage.length(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_chunk_limit() {
        let storage = memory_store().with_max_chunk_bytes(4);
        let key = mock_key("artifact");
        let mut handle = storage.open_for_write(&key).await.unwrap();
        assert!(matches!(
            storage
                .append(&mut handle, bytes_stream(vec![b"abc", b"de"]))
                .await,
            Err(BlobError::ChunkTooLarge { limit: 4 })
        ));
        assert_eq!(storage.length(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_is_scoped_and_idempotent() {
        let storage = memory_store();
        let key = mock_key("artifact");
        let other = ArtifactKey {
            scope: mock_other_job_scope(),
            name: "artifact".to_string(),
        };
        for k in [&key, &other] {
            let mut handle = storage.open_for_write(k).await.unwrap();
            storage
                .append(&mut handle, bytes_stream(vec![b"data"]))
                .await
                .unwrap();
        }

        storage.delete(&key).await.unwrap();
        storage.delete(&key).await.unwrap();
        assert_eq!(storage.length(&key).await.unwrap(), 0);
        assert_eq!(storage.read_all(&other).await.unwrap(), "data");
    }

    #[tokio::test]
    async fn test_local_filesystem_large_object() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage =
            BlobStorage::new(BlobStorageConfig::new(temp_dir.path().to_str().unwrap())).unwrap();
        let key = mock_key("big artifact");

        let content: Vec<u8> = (0..65 * 1024).map(|i| (i % 251) as u8).collect();
        let mut handle = storage.open_for_write(&key).await.unwrap();
        for part in content.chunks(8 * 1024) {
            let part = Bytes::copy_from_slice(part);
            storage
                .append(
                    &mut handle,
                    futures::stream::iter(vec![Ok::<_, anyhow::Error>(part)]),
                )
                .await
                .unwrap();
        }

        assert_eq!(storage.length(&key).await.unwrap(), content.len() as u64);
        assert_eq!(storage.read_all(&key).await.unwrap(), content);

        let read = storage.read_range(&key, 8190, Some(8200)).await.unwrap();
        let parts: Vec<Bytes> = read.stream.try_collect().await.unwrap();
        assert_eq!(parts.concat(), &content[8190..=8200]);
    }
}
