//! Filesystem storage backend.
//!
//! Objects are plain files under the bucket root; keys map to relative
//! paths. Writes create intermediate directories as needed.

use crate::object::FileObject;
use crate::response::{HeaderMap, Response};
use crate::storage::list::{build_listing, ObjectEntry};
use crate::storage::{sniff_content_type, ListParams, Storage};
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::warn;

/// File-backed object store for a single bucket.
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a key to a path under the root. Keys that would escape the root
    /// (absolute, `..`) are rejected.
    fn resolve(&self, key: &str) -> Option<PathBuf> {
        let relative = Path::new(key);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }
}

impl Storage for FilesystemStorage {
    async fn get(&self, obj: &FileObject) -> Response {
        let Some(path) = self.resolve(&obj.key) else {
            return Response::error(404, format!("invalid key '{}'", obj.key));
        };

        match tokio::fs::read(&path).await {
            Ok(data) => {
                let content_type = sniff_content_type(&data);
                Response::new(200, Bytes::from(data)).with_content_type(content_type)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Response::error(404, format!("no such key '{}'", obj.key))
            }
            Err(e) => {
                warn!(key = %obj.key, error = %e, "filesystem read failed");
                Response::error(500, e)
            }
        }
    }

    async fn head(&self, obj: &FileObject) -> Response {
        let Some(path) = self.resolve(&obj.key) else {
            return Response::error(404, format!("invalid key '{}'", obj.key));
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Response::error(404, format!("no such key '{}'", obj.key)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Response::error(404, format!("no such key '{}'", obj.key));
            }
            Err(e) => {
                warn!(key = %obj.key, error = %e, "filesystem stat failed");
                return Response::error(500, e);
            }
        };

        // Only the leading bytes are needed to recognize the format.
        let mut header = [0u8; 64];
        let sniffed = match tokio::fs::File::open(&path).await {
            Ok(mut file) => {
                let n = file.read(&mut header).await.unwrap_or(0);
                sniff_content_type(&header[..n])
            }
            Err(_) => "application/octet-stream",
        };

        let mut res = Response::empty(200).with_content_type(sniffed);
        res.set_header("content-length", &metadata.len().to_string());
        res
    }

    async fn set(&self, obj: &FileObject, _headers: &HeaderMap, body: Bytes) -> Response {
        let Some(path) = self.resolve(&obj.key) else {
            return Response::error(400, format!("invalid key '{}'", obj.key));
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(key = %obj.key, error = %e, "failed to create object directory");
                return Response::error(500, e);
            }
        }

        match tokio::fs::write(&path, &body).await {
            Ok(()) => Response::empty(200),
            Err(e) => {
                warn!(key = %obj.key, error = %e, "filesystem write failed");
                Response::error(500, e)
            }
        }
    }

    async fn list(&self, obj: &FileObject, params: &ListParams) -> Response {
        let mut entries = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut reader = match tokio::fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(error = %e, "filesystem listing failed");
                    return Response::error(500, e);
                }
            };

            while let Ok(Some(entry)) = reader.next_entry().await {
                let path = entry.path();
                match entry.file_type().await {
                    Ok(ft) if ft.is_dir() => pending.push(path),
                    Ok(ft) if ft.is_file() => {
                        let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                        if let Ok(relative) = path.strip_prefix(&self.root) {
                            entries.push(ObjectEntry {
                                key: relative.to_string_lossy().replace('\\', "/"),
                                size,
                            });
                        }
                    }
                    _ => {}
                }
            }
        }

        build_listing(&obj.bucket, params, entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(key: &str) -> FileObject {
        FileObject::root("b", key)
    }

    #[tokio::test]
    async fn test_get_missing_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path());
        assert_eq!(storage.get(&obj("nope.jpg")).await.status(), 404);
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path());

        let put = storage
            .set(
                &obj("sub/dir/cat.bin"),
                &HeaderMap::new(),
                Bytes::from_static(b"payload"),
            )
            .await;
        assert_eq!(put.status(), 200);

        let got = storage.get(&obj("sub/dir/cat.bin")).await;
        assert_eq!(got.status(), 200);
        assert_eq!(got.body().as_ref(), b"payload");
    }

    #[tokio::test]
    async fn test_head_reports_length() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path());
        storage
            .set(&obj("x.bin"), &HeaderMap::new(), Bytes::from_static(b"12345"))
            .await;

        let res = storage.head(&obj("x.bin")).await;
        assert_eq!(res.status(), 200);
        assert_eq!(res.header("content-length"), Some("5"));
        assert!(res.body().is_empty());
    }

    #[tokio::test]
    async fn test_traversal_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path());

        assert_eq!(storage.get(&obj("../escape")).await.status(), 404);
        assert_eq!(
            storage
                .set(&obj("../escape"), &HeaderMap::new(), Bytes::new())
                .await
                .status(),
            400
        );
    }

    #[tokio::test]
    async fn test_list_walks_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemStorage::new(dir.path());
        storage
            .set(&obj("a.bin"), &HeaderMap::new(), Bytes::from_static(b"1"))
            .await;
        storage
            .set(
                &obj("nested/b.bin"),
                &HeaderMap::new(),
                Bytes::from_static(b"22"),
            )
            .await;

        let res = storage
            .list(&FileObject::listing("b"), &ListParams::default())
            .await;
        let xml = String::from_utf8(res.body().to_vec()).unwrap();
        assert!(xml.contains("<Key>a.bin</Key>"));
        assert!(xml.contains("<Key>nested/b.bin</Key>"));
    }
}
