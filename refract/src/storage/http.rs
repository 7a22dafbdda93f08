//! HTTP origin storage backend.
//!
//! Proxies storage operations to a remote HTTP server (an upstream S3
//! gateway or another proxy instance). Transport failures map to 502 so
//! the processor can pass the status through.

use crate::object::FileObject;
use crate::response::{HeaderMap, Response};
use crate::storage::{ListParams, Storage};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::warn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote HTTP object store for a single bucket.
pub struct HttpStorage {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStorage {
    /// Creates a backend rooted at `base_url` (which already names the
    /// remote bucket).
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    async fn relay(&self, request: reqwest::RequestBuilder, key: &str) -> Response {
        let reply = match request.send().await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(key, error = %e, "upstream request failed");
                return Response::error(502, e);
            }
        };

        let status = reply.status().as_u16();
        let headers = reply.headers().clone();
        match reply.bytes().await {
            Ok(body) => Response::new(status, body).with_headers(headers),
            Err(e) => {
                warn!(key, error = %e, "failed to read upstream body");
                Response::error(502, e)
            }
        }
    }
}

impl Storage for HttpStorage {
    async fn get(&self, obj: &FileObject) -> Response {
        self.relay(self.client.get(self.object_url(&obj.key)), &obj.key)
            .await
    }

    async fn head(&self, obj: &FileObject) -> Response {
        self.relay(self.client.head(self.object_url(&obj.key)), &obj.key)
            .await
    }

    async fn set(&self, obj: &FileObject, headers: &HeaderMap, body: Bytes) -> Response {
        let mut request = self.client.put(self.object_url(&obj.key)).body(body);
        if let Some(content_type) = headers.get(CONTENT_TYPE) {
            request = request.header(CONTENT_TYPE, content_type);
        }
        self.relay(request, &obj.key).await
    }

    async fn list(&self, obj: &FileObject, params: &ListParams) -> Response {
        let mut query: Vec<(&str, String)> = vec![("max-keys", params.max_keys.to_string())];
        if !params.delimeter.is_empty() {
            query.push(("delimeter", params.delimeter.clone()));
        }
        if !params.prefix.is_empty() {
            query.push(("prefix", params.prefix.clone()));
        }
        if !params.marker.is_empty() {
            query.push(("marker", params.marker.clone()));
        }

        self.relay(self.client.get(&self.base_url).query(&query), &obj.key)
            .await
    }
}
