//! In-memory storage backend.
//!
//! Holds objects in a concurrent map. Used as the development backend and
//! throughout the test suite; nothing survives a restart.

use crate::object::FileObject;
use crate::response::{HeaderMap, Response};
use crate::storage::list::{build_listing, ObjectEntry};
use crate::storage::{sniff_content_type, ListParams, Storage};
use bytes::Bytes;
use dashmap::DashMap;
use http::header::CONTENT_TYPE;

struct StoredObject {
    body: Bytes,
    content_type: String,
}

/// Volatile, concurrent object store for a single bucket.
pub struct MemoryStorage {
    objects: DashMap<String, StoredObject>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
        }
    }

    /// Seeds an object directly, bypassing the storage contract. Intended
    /// for startup fixtures and tests.
    pub fn insert(&self, key: impl Into<String>, content_type: impl Into<String>, body: Bytes) {
        self.objects.insert(
            key.into(),
            StoredObject {
                body,
                content_type: content_type.into(),
            },
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    async fn get(&self, obj: &FileObject) -> Response {
        match self.objects.get(&obj.key) {
            Some(stored) => Response::new(200, stored.body.clone())
                .with_content_type(&stored.content_type),
            None => Response::error(404, format!("no such key '{}'", obj.key)),
        }
    }

    async fn head(&self, obj: &FileObject) -> Response {
        match self.objects.get(&obj.key) {
            Some(stored) => {
                let mut res = Response::empty(200).with_content_type(&stored.content_type);
                res.set_header("content-length", &stored.body.len().to_string());
                res
            }
            None => Response::error(404, format!("no such key '{}'", obj.key)),
        }
    }

    async fn set(&self, obj: &FileObject, headers: &HeaderMap, body: Bytes) -> Response {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| sniff_content_type(&body).to_string());

        self.objects.insert(
            obj.key.clone(),
            StoredObject { body, content_type },
        );
        Response::empty(200)
    }

    async fn list(&self, obj: &FileObject, params: &ListParams) -> Response {
        let entries: Vec<ObjectEntry> = self
            .objects
            .iter()
            .map(|item| ObjectEntry {
                key: item.key().clone(),
                size: item.value().body.len() as u64,
            })
            .collect();
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
        let storage = MemoryStorage::new();
        let res = storage.get(&obj("nope")).await;
        assert_eq!(res.status(), 404);
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrip() {
        let storage = MemoryStorage::new();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "image/jpeg".parse().unwrap());

        let put = storage
            .set(&obj("cat.jpg"), &headers, Bytes::from_static(b"jpegdata"))
            .await;
        assert_eq!(put.status(), 200);

        let got = storage.get(&obj("cat.jpg")).await;
        assert_eq!(got.status(), 200);
        assert_eq!(got.body().as_ref(), b"jpegdata");
        assert_eq!(got.content_type(), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn test_head_reports_length_without_body() {
        let storage = MemoryStorage::new();
        storage.insert("cat.jpg", "image/jpeg", Bytes::from_static(b"12345"));

        let res = storage.head(&obj("cat.jpg")).await;
        assert_eq!(res.status(), 200);
        assert!(res.body().is_empty());
        assert_eq!(res.header("content-length"), Some("5"));
        assert_eq!(res.content_type(), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn test_set_sniffs_missing_content_type() {
        let storage = MemoryStorage::new();
        let png = {
            use image::{Rgba, RgbaImage};
            let img = RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 255]));
            let mut buf = Vec::new();
            img.write_to(
                &mut std::io::Cursor::new(&mut buf),
                image::ImageFormat::Png,
            )
            .unwrap();
            Bytes::from(buf)
        };

        storage.set(&obj("x.png"), &HeaderMap::new(), png).await;
        let got = storage.get(&obj("x.png")).await;
        assert_eq!(got.content_type(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_list_renders_keys() {
        let storage = MemoryStorage::new();
        storage.insert("a.png", "image/png", Bytes::from_static(b"1"));
        storage.insert("b.png", "image/png", Bytes::from_static(b"22"));

        let res = storage
            .list(&FileObject::listing("b"), &ListParams::default())
            .await;
        let xml = String::from_utf8(res.body().to_vec()).unwrap();
        assert!(xml.contains("<Key>a.png</Key>"));
        assert!(xml.contains("<Key>b.png</Key>"));
        assert!(xml.contains("<Name>b</Name>"));
    }
}
