//! Storage abstraction and backends.
//!
//! The request processor only sees the [`Storage`] trait: four primitives
//! that all answer with a [`Response`]. Backend errors are encoded into the
//! response status so the processor can pass them through verbatim instead
//! of unwinding.

pub mod filesystem;
pub mod http;
pub mod list;
pub mod memory;

pub use filesystem::FilesystemStorage;
pub use http::HttpStorage;
pub use memory::MemoryStorage;

use crate::config::{Config, StorageConfig};
use crate::object::FileObject;
use crate::response::{HeaderMap, Response};
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use thiserror::Error;

/// Listing parameters forwarded from the query string. The `delimeter`
/// spelling matches the accepted query parameter.
#[derive(Debug, Clone)]
pub struct ListParams {
    pub max_keys: usize,
    pub delimeter: String,
    pub prefix: String,
    pub marker: String,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            max_keys: 1000,
            delimeter: String::new(),
            prefix: String::new(),
            marker: String::new(),
        }
    }
}

/// Blob backend primitives the processor consumes.
pub trait Storage: Send + Sync + 'static {
    /// Fetches an object. Missing objects answer 404.
    fn get(&self, obj: &FileObject) -> impl Future<Output = Response> + Send;

    /// Existence and metadata probe; the response carries headers only.
    fn head(&self, obj: &FileObject) -> impl Future<Output = Response> + Send;

    /// Stores an object.
    fn set(
        &self,
        obj: &FileObject,
        headers: &HeaderMap,
        body: Bytes,
    ) -> impl Future<Output = Response> + Send;

    /// Enumerates keys in the object's bucket.
    fn list(&self, obj: &FileObject, params: &ListParams) -> impl Future<Output = Response> + Send;
}

/// Errors constructing backends at startup.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket '{bucket}': failed to build http client: {source}")]
    HttpClient {
        bucket: String,
        source: reqwest::Error,
    },
}

/// One configured backend.
pub enum BucketBackend {
    Filesystem(FilesystemStorage),
    Memory(MemoryStorage),
    Http(HttpStorage),
}

impl Storage for BucketBackend {
    async fn get(&self, obj: &FileObject) -> Response {
        match self {
            Self::Filesystem(s) => s.get(obj).await,
            Self::Memory(s) => s.get(obj).await,
            Self::Http(s) => s.get(obj).await,
        }
    }

    async fn head(&self, obj: &FileObject) -> Response {
        match self {
            Self::Filesystem(s) => s.head(obj).await,
            Self::Memory(s) => s.head(obj).await,
            Self::Http(s) => s.head(obj).await,
        }
    }

    async fn set(&self, obj: &FileObject, headers: &HeaderMap, body: Bytes) -> Response {
        match self {
            Self::Filesystem(s) => s.set(obj, headers, body).await,
            Self::Memory(s) => s.set(obj, headers, body).await,
            Self::Http(s) => s.set(obj, headers, body).await,
        }
    }

    async fn list(&self, obj: &FileObject, params: &ListParams) -> Response {
        match self {
            Self::Filesystem(s) => s.list(obj, params).await,
            Self::Memory(s) => s.list(obj, params).await,
            Self::Http(s) => s.list(obj, params).await,
        }
    }
}

/// Routes operations to the backend configured for the object's bucket.
pub struct BucketStorage {
    buckets: HashMap<String, BucketBackend>,
}

impl BucketStorage {
    /// Builds one backend per configured bucket.
    pub fn from_config(config: &Config) -> Result<Self, StorageError> {
        let mut buckets = HashMap::new();
        for (name, bucket) in &config.buckets {
            let backend = match &bucket.storage {
                StorageConfig::Filesystem { root } => {
                    BucketBackend::Filesystem(FilesystemStorage::new(root.clone()))
                }
                StorageConfig::Memory => BucketBackend::Memory(MemoryStorage::new()),
                StorageConfig::Http { url } => BucketBackend::Http(
                    HttpStorage::new(url).map_err(|source| StorageError::HttpClient {
                        bucket: name.clone(),
                        source,
                    })?,
                ),
            };
            buckets.insert(name.clone(), backend);
        }
        Ok(Self { buckets })
    }

    pub fn backend(&self, bucket: &str) -> Option<&BucketBackend> {
        self.buckets.get(bucket)
    }
}

fn unknown_bucket(obj: &FileObject) -> Response {
    Response::error(404, format!("unknown bucket '{}'", obj.bucket))
}

impl Storage for BucketStorage {
    async fn get(&self, obj: &FileObject) -> Response {
        match self.backend(&obj.bucket) {
            Some(backend) => backend.get(obj).await,
            None => unknown_bucket(obj),
        }
    }

    async fn head(&self, obj: &FileObject) -> Response {
        match self.backend(&obj.bucket) {
            Some(backend) => backend.head(obj).await,
            None => unknown_bucket(obj),
        }
    }

    async fn set(&self, obj: &FileObject, headers: &HeaderMap, body: Bytes) -> Response {
        match self.backend(&obj.bucket) {
            Some(backend) => backend.set(obj, headers, body).await,
            None => unknown_bucket(obj),
        }
    }

    async fn list(&self, obj: &FileObject, params: &ListParams) -> Response {
        match self.backend(&obj.bucket) {
            Some(backend) => backend.list(obj, params).await,
            None => unknown_bucket(obj),
        }
    }
}

/// Recognizes image payloads from their leading bytes.
pub(crate) fn sniff_content_type(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(format) => format.to_mime_type(),
        Err(_) => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_unknown_bucket_is_404() {
        let storage = BucketStorage::from_config(&Config::default()).unwrap();
        let res = storage.get(&FileObject::root("ghost", "k")).await;
        assert_eq!(res.status(), 404);
    }

    #[tokio::test]
    async fn test_routes_to_configured_backend() {
        let config = Config::from_yaml(
            r#"
buckets:
  mem:
    storage:
      kind: memory
"#,
        )
        .unwrap();
        let storage = BucketStorage::from_config(&config).unwrap();

        let obj = FileObject::root("mem", "k.bin");
        storage
            .set(&obj, &HeaderMap::new(), Bytes::from_static(b"v"))
            .await;
        let res = storage.get(&obj).await;
        assert_eq!(res.status(), 200);
        assert_eq!(res.body().as_ref(), b"v");
    }

    #[test]
    fn test_sniff_content_type_fallback() {
        assert_eq!(sniff_content_type(b"plainly text"), "application/octet-stream");
    }
}
