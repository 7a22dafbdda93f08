//! HTTP surface: axum router binding requests to the processor.
//!
//! The server resolves `/{bucket}/{key}` paths into object descriptors,
//! hands them to the [`RequestProcessor`] and adapts its [`Response`] back
//! into an HTTP reply. HEAD requests run the same pipeline as GET; the
//! body is elided here.

use crate::engine::Transformer;
use crate::object::BucketRouter;
use crate::processor::{ProxyRequest, RequestProcessor};
use crate::response::Response;
use crate::storage::Storage;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response as HttpResponse;
use axum::routing::any;
use axum::Router;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared state for the HTTP handlers.
pub struct AppState<S, T> {
    pub processor: Arc<RequestProcessor<S, T>>,
    pub router: Arc<BucketRouter>,
}

impl<S, T> Clone for AppState<S, T> {
    fn clone(&self) -> Self {
        Self {
            processor: Arc::clone(&self.processor),
            router: Arc::clone(&self.router),
        }
    }
}

/// Builds the axum router for the proxy.
pub fn router<S: Storage, T: Transformer>(state: AppState<S, T>) -> Router {
    Router::new()
        .route("/{bucket}", any(bucket_handler::<S, T>))
        .route("/{bucket}/{*key}", any(object_handler::<S, T>))
        .with_state(state)
}

/// Runs the proxy on `listener` until ctrl-c.
pub async fn serve<S: Storage, T: Transformer>(
    listener: tokio::net::TcpListener,
    state: AppState<S, T>,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn bucket_handler<S: Storage, T: Transformer>(
    State(state): State<AppState<S, T>>,
    Path(bucket): Path<String>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResponse {
    handle(state, bucket, String::new(), method, query, headers, body).await
}

async fn object_handler<S: Storage, T: Transformer>(
    State(state): State<AppState<S, T>>,
    Path((bucket, key)): Path<(String, String)>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResponse {
    handle(state, bucket, key, method, query, headers, body).await
}

async fn handle<S: Storage, T: Transformer>(
    state: AppState<S, T>,
    bucket: String,
    key: String,
    method: Method,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResponse {
    let obj = match state.router.resolve(&bucket, &key, &query) {
        Ok(obj) => obj,
        Err(e) => return to_http(Response::error(400, e), false),
    };

    let head_only = method == Method::HEAD;
    let mut req = ProxyRequest::new(method);
    req.query = query;
    req.headers = headers;
    req.body = body;

    let res = state.processor.process(req, &obj).await;
    to_http(res, head_only)
}

fn to_http(res: Response, head_only: bool) -> HttpResponse {
    let status =
        StatusCode::from_u16(res.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let headers = res.headers().clone();
    let body = if head_only {
        Body::empty()
    } else {
        Body::from(res.into_body())
    };

    let mut reply = HttpResponse::new(body);
    *reply.status_mut() = status;
    *reply.headers_mut() = headers;
    reply
}
