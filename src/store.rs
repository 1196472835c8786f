//! Object storage holding HDF5 containers.
//!
//! A store reports an object's identity (size, modification time, entity tag) and opens the
//! object as a [Container]. The identity is folded into every cache key, so replacing an object
//! makes earlier cache entries unreachable.
//!
//! Containers are never downloaded whole. An opened [H5File] reads the byte ranges it needs
//! through a [BlockReader], and opened files are kept in a tier keyed by object version so
//! later requests reuse the superblock, headers and blocks already fetched.

use crate::dataset::{Container, MemoryContainer};
use crate::error::H5LensError;
use crate::h5::H5File;
use crate::limits::Limit;
use crate::range_reader::{BlockOptions, BlockReader, ByteSource, MemorySource};
use crate::s3_client::{get_range, S3Client};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

/// Size and identity of a stored object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectInfo {
    pub size: u64,
    /// Seconds since the epoch
    pub last_modified: Option<i64>,
    pub etag: Option<String>,
}

impl ObjectInfo {
    /// Token which changes whenever the object does.
    ///
    /// The entity tag when present, otherwise the modification time and size.
    pub fn version(&self) -> String {
        match &self.etag {
            Some(etag) => etag.trim_matches('"').to_string(),
            None => format!("{}-{}", self.last_modified.unwrap_or(0), self.size),
        }
    }
}

/// Object storage holding HDF5 containers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Retrieve the size and identity of an object.
    async fn head(&self, key: &str) -> Result<ObjectInfo, H5LensError>;

    /// Open an object as a container. `info` is the identity returned by [ObjectStore::head].
    async fn open(&self, key: &str, info: &ObjectInfo) -> Result<Box<dyn Container>, H5LensError>;
}

/// Opened files, keyed by object key and version.
struct OpenFiles {
    files: Option<Mutex<LruCache<(String, String), H5File>>>,
}

impl OpenFiles {
    fn new(capacity: usize) -> Self {
        OpenFiles {
            files: NonZeroUsize::new(capacity).map(|capacity| Mutex::new(LruCache::new(capacity))),
        }
    }

    fn get(&self, key: &str, info: &ObjectInfo) -> Option<H5File> {
        let files = self.files.as_ref()?;
        files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(key.to_string(), info.version()))
            .cloned()
    }

    fn insert(&self, key: &str, info: &ObjectInfo, file: H5File) {
        if let Some(files) = &self.files {
            files
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .put((key.to_string(), info.version()), file);
        }
    }
}

/// Byte ranges of one S3 object, fetched with ranged GET requests.
///
/// Reads happen on blocking tasks, so each request is driven to completion on the runtime
/// that opened the object. The entity tag seen by the HEAD request is sent as `If-Match`, so
/// a replaced object fails the read instead of mixing bytes from two versions.
struct S3RangeSource {
    client: S3Client,
    bucket: String,
    key: String,
    info: ObjectInfo,
    runtime: Handle,
    connections: Option<Arc<Semaphore>>,
}

impl ByteSource for S3RangeSource {
    fn size(&self) -> u64 {
        self.info.size
    }

    fn read_range(&self, offset: u64, len: u64) -> Result<Bytes, H5LensError> {
        self.runtime.block_on(async {
            let _conn = match &self.connections {
                Some(connections) => Some(connections.acquire().await?),
                None => None,
            };
            let mut data = Vec::with_capacity(len as usize);
            let received = self
                .client
                .download_object(
                    &self.bucket,
                    &self.key,
                    get_range(Some(offset), Some(len)),
                    self.info.etag.clone(),
                    &mut data,
                )
                .await?;
            if received != len {
                return Err(H5LensError::upstream(format!(
                    "{}: received {received} of {len} bytes at {offset}",
                    self.key
                )));
            }
            tracing::trace!("Fetched {} bytes at {} of {}", len, offset, self.key);
            Ok::<_, H5LensError>(Bytes::from(data))
        })
    }
}

/// An [ObjectStore] backed by an S3 bucket.
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    max_object_bytes: u64,
    options: BlockOptions,
    connections: Option<Arc<Semaphore>>,
    files: OpenFiles,
}

impl S3ObjectStore {
    /// Create a store reading objects from `bucket`, keeping up to `open_files` opened files.
    pub fn new(
        client: S3Client,
        bucket: &str,
        max_object_bytes: u64,
        options: BlockOptions,
        open_files: usize,
    ) -> Self {
        S3ObjectStore {
            client,
            bucket: bucket.to_string(),
            max_object_bytes,
            options,
            connections: None,
            files: OpenFiles::new(open_files),
        }
    }

    /// Share a limit on concurrent S3 requests with the rest of the server.
    pub fn with_connection_limit(mut self, connections: Option<Arc<Semaphore>>) -> Self {
        self.connections = connections;
        self
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn head(&self, key: &str) -> Result<ObjectInfo, H5LensError> {
        self.client.head_object(&self.bucket, key).await
    }

    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn open(&self, key: &str, info: &ObjectInfo) -> Result<Box<dyn Container>, H5LensError> {
        if info.size > self.max_object_bytes {
            return Err(H5LensError::LimitExceeded {
                limit: Limit::MaxObjectBytes,
                requested: info.size,
                allowed: self.max_object_bytes,
            });
        }
        if let Some(file) = self.files.get(key, info) {
            tracing::debug!("Reusing opened file {}", key);
            return Ok(Box::new(file));
        }
        let source = S3RangeSource {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: key.to_string(),
            info: info.clone(),
            runtime: Handle::current(),
            connections: self.connections.clone(),
        };
        let options = self.options;
        let file = tokio::task::spawn_blocking(move || {
            H5File::open(BlockReader::new(Box::new(source), options))
        })
        .await??;
        tracing::debug!("Opened {} after fetching {} bytes", key, file.fetched());
        self.files.insert(key, info, file.clone());
        Ok(Box::new(file))
    }
}

#[derive(Clone)]
enum StoredContents {
    Container(MemoryContainer),
    File(Arc<MemorySource>),
}

struct StoredObject {
    info: ObjectInfo,
    contents: StoredContents,
}

/// An [ObjectStore] serving in-memory containers and HDF5 files.
///
/// Counts the objects opened, so callers can check which requests reached storage. Files are
/// read through a [BlockReader] like stored objects are, and kept open per version.
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    revision: AtomicU64,
    opens: AtomicU64,
    options: BlockOptions,
    files: OpenFiles,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        MemoryObjectStore {
            objects: Mutex::default(),
            revision: AtomicU64::default(),
            opens: AtomicU64::default(),
            options: BlockOptions::default(),
            files: OpenFiles::new(16),
        }
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block cache settings used when opening files.
    pub fn with_block_options(mut self, options: BlockOptions) -> Self {
        self.options = options;
        self
    }

    fn store(&self, key: &str, size: u64, contents: StoredContents) {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let info = ObjectInfo {
            size,
            last_modified: None,
            etag: Some(format!("\"{key}-{revision}\"")),
        };
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), StoredObject { info, contents });
    }

    /// Store a container, replacing any object with the same key under a new entity tag.
    pub fn insert(&self, key: &str, container: MemoryContainer) {
        self.store(key, 0, StoredContents::Container(container));
    }

    /// Store the bytes of an HDF5 file. The source records every range read from it.
    pub fn insert_file(&self, key: &str, source: Arc<MemorySource>) {
        self.store(key, source.size(), StoredContents::File(source));
    }

    /// Builder form of [MemoryObjectStore::insert].
    pub fn with_object(self, key: &str, container: MemoryContainer) -> Self {
        self.insert(key, container);
        self
    }

    /// Builder form of [MemoryObjectStore::insert_file].
    pub fn with_file(self, key: &str, source: Arc<MemorySource>) -> Self {
        self.insert_file(key, source);
        self
    }

    /// Number of objects opened so far.
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head(&self, key: &str) -> Result<ObjectInfo, H5LensError> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|object| object.info.clone())
            .ok_or_else(|| H5LensError::not_found(key))
    }

    async fn open(&self, key: &str, info: &ObjectInfo) -> Result<Box<dyn Container>, H5LensError> {
        let contents = {
            let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
            let object = objects.get(key).ok_or_else(|| H5LensError::not_found(key))?;
            if object.info != *info {
                return Err(H5LensError::upstream(format!("{key} changed while opening")));
            }
            object.contents.clone()
        };
        match contents {
            StoredContents::Container(container) => {
                self.opens.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(container))
            }
            StoredContents::File(source) => {
                if let Some(file) = self.files.get(key, info) {
                    return Ok(Box::new(file));
                }
                self.opens.fetch_add(1, Ordering::SeqCst);
                let file = H5File::open(BlockReader::new(Box::new(source), self.options))?;
                self.files.insert(key, info, file.clone());
                Ok(Box::new(file))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h5::writer::{self, DatasetSpec, FileWriter, Flavour, GroupSpec};
    use crate::test_utils;

    fn h5_source() -> Arc<MemorySource> {
        let data: Vec<u8> = (0..12_i32).flat_map(|v| v.to_le_bytes()).collect();
        let root = GroupSpec::default().with_dataset(
            "values",
            DatasetSpec::contiguous(writer::int_type(4, true), &[3, 4], &data),
        );
        Arc::new(MemorySource::new(
            FileWriter::new(Flavour::Latest).with_root(root).finish(),
        ))
    }

    #[test]
    fn version_prefers_etag() {
        let info = ObjectInfo {
            size: 10,
            last_modified: Some(1_700_000_000),
            etag: Some("\"abc\"".to_string()),
        };
        assert_eq!("abc", info.version());
        let info = ObjectInfo { etag: None, ..info };
        assert_eq!("1700000000-10", info.version());
    }

    #[tokio::test]
    async fn memory_store() {
        let store = MemoryObjectStore::new().with_object("a.h5", test_utils::sample_container());
        let info = store.head("a.h5").await.unwrap();
        let container = store.open("a.h5", &info).await.unwrap();
        assert_eq!(3, container.children("/").unwrap().len());
        assert_eq!(1, store.opens());
    }

    #[tokio::test]
    async fn memory_store_missing() {
        let store = MemoryObjectStore::new();
        let err = store.head("missing.h5").await.unwrap_err();
        assert_eq!("not_found", err.code());
    }

    #[tokio::test]
    async fn replace_changes_version() {
        let store = MemoryObjectStore::new().with_object("a.h5", test_utils::sample_container());
        let before = store.head("a.h5").await.unwrap();
        store.insert("a.h5", test_utils::float_container(&[2, 2]));
        let after = store.head("a.h5").await.unwrap();
        assert_ne!(before.version(), after.version());
        let err = store.open("a.h5", &before).await.err().unwrap();
        assert_eq!("upstream_read_error", err.code());
    }

    #[tokio::test]
    async fn opened_files_reused_per_version() {
        let source = h5_source();
        let store = MemoryObjectStore::new().with_file("a.h5", source.clone());
        let info = store.head("a.h5").await.unwrap();
        assert_eq!(source.size(), info.size);
        let container = store.open("a.h5", &info).await.unwrap();
        assert_eq!(vec![3, 4], container.dataset("/values").unwrap().info().shape);
        let requests = source.requests().len();
        let container = store.open("a.h5", &info).await.unwrap();
        assert_eq!(1, container.children("/").unwrap().len());
        assert_eq!(1, store.opens());
        // The superblock is not fetched again.
        assert!(!source.requests()[requests..].iter().any(|(offset, _)| *offset == 0));

        store.insert_file("a.h5", source.clone());
        let info = store.head("a.h5").await.unwrap();
        store.open("a.h5", &info).await.unwrap();
        assert_eq!(2, store.opens());
    }

    #[tokio::test]
    async fn s3_object_size_ceiling() {
        let url = url::Url::parse("http://example.com").unwrap();
        let client = S3Client::new(&url, crate::s3_client::S3Credentials::None);
        let store = S3ObjectStore::new(client, "bucket", 1_024, BlockOptions::default(), 4);
        let info = ObjectInfo {
            size: 2_048,
            last_modified: None,
            etag: None,
        };
        let err = store.open("big.h5", &info).await.err().unwrap();
        assert!(matches!(
            err,
            H5LensError::LimitExceeded {
                limit: Limit::MaxObjectBytes,
                requested: 2_048,
                allowed: 1_024,
            }
        ));
    }
}
