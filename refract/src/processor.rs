//! The request processor: dispatch, request collapsing and the production
//! pipeline.
//!
//! This is the control plane between the HTTP layer and the storage and
//! imaging collaborators. For every request it interleaves four sources of
//! progress: client cancellation, storage I/O completion, peer-request
//! completion (collapsing) and its own deadline.
//!
//! # Flow for a derivative GET
//!
//! ```text
//! Request ──► dispatch ──► coalescer lock
//!                            │
//!              leader ◄──────┴──────► waiter
//!                │                      │
//!           pipeline:              wait for: leader result,
//!           cache probe,           cache hit, deadline,
//!           parent walk,           cancellation
//!           prefetch + select,
//!           transform (throttled),
//!           cache insert,
//!           async write-back
//! ```

use crate::cache::DerivativeCache;
use crate::coalesce::{LockOutcome, LockResult, RequestCoalescer};
use crate::config::{Config, HeaderRule};
use crate::engine::Transformer;
use crate::object::{FileObject, MAX_PARENT_DEPTH};
use crate::response::{HeaderMap, Response};
use crate::storage::{ListParams, Storage};
use crate::throttler::TransformThrottler;
use crate::transform::TransformStep;
use bytes::Bytes;
use http::Method;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fixed body of the `?location` reply.
const S3_LOCATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?><LocationConstraint xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">EU</LocationConstraint>";

/// How long produced derivatives stay in the cache.
const DERIVATIVE_TTL: Duration = Duration::from_secs(120);

/// How often a collapsed waiter probes the derivative cache. The leader
/// populates the cache before its storage write-back completes, so waiters
/// can often return before the coalescer notifies them.
const CACHE_PROBE_INTERVAL: Duration = Duration::from_millis(25);

/// The slice of an HTTP request the processor consumes.
pub struct ProxyRequest {
    pub method: Method,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Fires when the client goes away; every wait in the processor races
    /// against it.
    pub cancel: CancellationToken,
}

impl ProxyRequest {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            query: HashMap::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn put(body: Bytes) -> Self {
        let mut req = Self::new(Method::PUT);
        req.body = body;
        req
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Coordinates collapsing, caching, throttling and write-back around the
/// storage and imaging collaborators.
pub struct RequestProcessor<S, T> {
    storage: Arc<S>,
    engine: Arc<T>,
    coalescer: RequestCoalescer,
    cache: DerivativeCache,
    throttler: TransformThrottler,
    header_rules: Vec<HeaderRule>,
    queue: Arc<Semaphore>,
    process_timeout: Duration,
    lock_timeout: Duration,
}

impl<S: Storage, T: Transformer> RequestProcessor<S, T> {
    pub fn new(config: &Config, storage: Arc<S>, engine: Arc<T>) -> Self {
        let server = &config.server;
        Self {
            storage,
            engine,
            coalescer: RequestCoalescer::new(),
            cache: DerivativeCache::new(server.cache_size),
            throttler: TransformThrottler::new(server.transform_concurrency),
            header_rules: config.headers.clone(),
            queue: Arc::new(Semaphore::new(server.queue_len.max(1))),
            process_timeout: server.request_timeout(),
            // One second is reserved for a waiter's inline fallback run.
            lock_timeout: server
                .request_timeout()
                .saturating_sub(Duration::from_secs(1)),
        }
    }

    pub fn cache(&self) -> &DerivativeCache {
        &self.cache
    }

    pub fn coalescer(&self) -> &RequestCoalescer {
        &self.coalescer
    }

    pub fn throttler(&self) -> &TransformThrottler {
        &self.throttler
    }

    /// Entry point: applies admission and the per-request deadline, then
    /// dispatches. Client cancellation answers 499, deadline expiry 504.
    pub async fn process(&self, req: ProxyRequest, obj: &FileObject) -> Response {
        let cancel = req.cancel.clone();
        let deadline = tokio::time::sleep(self.process_timeout);
        tokio::pin!(deadline);

        let work = async {
            let _admission = Arc::clone(&self.queue)
                .acquire_owned()
                .await
                .expect("request queue semaphore closed unexpectedly");
            self.dispatch(req, obj).await
        };
        tokio::pin!(work);

        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(key = %obj.key, "request cancelled by client");
                Response::empty(499)
            }
            res = &mut work => res,
            _ = &mut deadline => {
                warn!(key = %obj.key, "request deadline exceeded");
                Response::text(504, "timeout")
            }
        }
    }

    async fn dispatch(&self, req: ProxyRequest, obj: &FileObject) -> Response {
        let method = req.method.clone();
        match method.as_str() {
            "GET" | "HEAD" => {
                let res = if obj.has_transform() {
                    self.collapsed_get(&req, obj).await
                } else {
                    self.handle_get(&req, obj).await
                };
                self.rewrite_headers(res)
            }
            "PUT" => self.storage.set(obj, &req.headers, req.body).await,
            _ => Response::error(405, "method not allowed"),
        }
    }

    /// Single-flight wrapper around the pipeline for derivative requests.
    async fn collapsed_get(&self, req: &ProxyRequest, obj: &FileObject) -> Response {
        match self.coalescer.lock(&obj.key) {
            LockOutcome::Leader(guard) => {
                let res = self.handle_get(req, obj).await;
                guard.notify_and_release(&res);
                res
            }
            LockOutcome::Waiter(lock) => self.wait_for_leader(req, obj, lock).await,
        }
    }

    /// Waiter side of a collapsed request.
    async fn wait_for_leader(
        &self,
        req: &ProxyRequest,
        obj: &FileObject,
        lock: LockResult,
    ) -> Response {
        let LockResult {
            mut response,
            cancel,
        } = lock;

        let deadline = tokio::time::sleep(self.lock_timeout);
        tokio::pin!(deadline);
        let mut probe = tokio::time::interval(CACHE_PROBE_INTERVAL);
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = req.cancel.cancelled() => {
                    cancel.cancel();
                    return Response::empty(499);
                }
                delivered = &mut response => {
                    return match delivered {
                        Ok(res) => res,
                        // Leader died before publishing; run the pipeline
                        // inline as a best effort.
                        Err(_) => self.handle_get(req, obj).await,
                    };
                }
                _ = &mut deadline => {
                    cancel.cancel();
                    warn!(key = %obj.key, "collapsed wait deadline exceeded");
                    return Response::text(504, "timeout");
                }
                _ = probe.tick() => {
                    if let Some(hit) = self.cache.get(&obj.key) {
                        cancel.cancel();
                        debug!(key = %obj.key, "collapsed wait satisfied from cache");
                        return hit;
                    }
                }
            }
        }
    }

    /// The production pipeline: cache probe, parent walk, concurrent
    /// prefetch, then transformation when the object is absent.
    async fn handle_get(&self, req: &ProxyRequest, obj: &FileObject) -> Response {
        if obj.is_listing() {
            return self.bucket_get(req, obj).await;
        }

        if let Some(hit) = self.cache.get(&obj.key) {
            debug!(key = %obj.key, "derivative cache hit");
            return hit;
        }

        // Walk to the root ancestor, collecting each node's transform
        // chain. Collection order is child to root.
        let mut chains: Vec<Vec<TransformStep>> = Vec::new();
        let mut root: Option<FileObject> = None;
        let mut depth = 0usize;
        let mut current = obj;
        while let Some(parent) = current.parent.as_deref() {
            if current.has_transform() {
                chains.push(current.transforms.clone());
            }
            depth += 1;
            if depth > MAX_PARENT_DEPTH {
                return Response::error(400, "parent chain too deep");
            }
            current = parent;
            if !current.has_parent() {
                root = Some(current.clone());
            }
        }

        // Prefetch the object itself and, when configured, probe the root
        // parent concurrently.
        let (object_tx, mut object_rx) = oneshot::channel();
        {
            let storage = Arc::clone(&self.storage);
            let target = obj.clone();
            tokio::spawn(async move {
                let _ = object_tx.send(storage.get(&target).await);
            });
        }

        let mut parent_rx = match (&root, obj.check_parent) {
            (Some(parent), true) => {
                let (tx, rx) = oneshot::channel();
                let storage = Arc::clone(&self.storage);
                let parent = parent.clone();
                tokio::spawn(async move {
                    let _ = tx.send(storage.head(&parent).await);
                });
                Some(rx)
            }
            _ => None,
        };

        let mut parent_res: Option<Response> = None;
        let mut object_slot: Option<Response> = None;
        let mut object_pending = true;

        let object_res = loop {
            // An object response is only examined once the parent status
            // is known (or was never requested). Until then it is parked
            // in the slot, not re-sent anywhere.
            if parent_rx.is_none() || parent_res.is_some() {
                if let Some(res) = object_slot.take() {
                    match res.status() {
                        200 => return res,
                        404 => break res,
                        _ => return res,
                    }
                }
            }

            tokio::select! {
                _ = req.cancel.cancelled() => return Response::empty(499),
                res = &mut object_rx, if object_pending => {
                    object_pending = false;
                    object_slot = Some(res.unwrap_or_else(|_| {
                        Response::error(500, "object fetch task failed")
                    }));
                }
                res = recv_opt(&mut parent_rx), if parent_rx.is_some() && parent_res.is_none() => {
                    let res = res.unwrap_or_else(|_| {
                        Response::error(500, "parent probe task failed")
                    });
                    if res.status() == 404 {
                        debug!(key = %obj.key, "parent missing, failing fast");
                        return res;
                    }
                    parent_res = Some(res);
                }
            }
        };

        // The object is not in storage. Produce it if the chain has a
        // usable image source.
        let Some(parent) = root else {
            return object_res;
        };

        let parent_res = match parent_res {
            Some(res) => res,
            None => self.storage.head(&parent).await,
        };

        let parent_is_image = parent_res.status() == 200
            && parent_res
                .content_type()
                .map(|ct| ct.starts_with("image/"))
                .unwrap_or(false);

        if obj.has_transform() && parent_is_image {
            drop(object_res);
            let source = self.storage.get(&parent).await;
            if source.status() != 200 {
                // Source disappeared between the probe and the fetch.
                return source;
            }

            // Walk order is child to root; the engine applies the
            // root-most chain first.
            let steps: Vec<TransformStep> = chains.iter().rev().flatten().cloned().collect();
            info!(
                bucket = %obj.bucket,
                key = %obj.key,
                steps = steps.len(),
                "performing transforms"
            );
            return self.transform(&req.cancel, obj, source, steps).await;
        } else if obj.has_transform() {
            warn!(
                bucket = %obj.bucket,
                key = %obj.key,
                parent_status = parent_res.status(),
                parent_content_type = parent_res.content_type().unwrap_or(""),
                error = parent_res.error_message().unwrap_or(""),
                "not performing transforms"
            );
        }

        object_res
    }

    /// Runs the engine under a throttler slot, caches the result and kicks
    /// off the asynchronous write-back.
    async fn transform(
        &self,
        cancel: &CancellationToken,
        obj: &FileObject,
        source: Response,
        steps: Vec<TransformStep>,
    ) -> Response {
        let Some(_permit) = self.throttler.acquire(cancel).await else {
            if cancel.is_cancelled() {
                return Response::empty(499);
            }
            warn!(key = %obj.key, "transformation throttled");
            return Response::empty(503);
        };

        let engine = Arc::clone(&self.engine);
        let target = obj.clone();
        let produced =
            tokio::task::spawn_blocking(move || engine.transform(&source, &target, &steps)).await;

        let res = match produced {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                warn!(key = %obj.key, error = %err, "transformation failed");
                return Response::error(400, err);
            }
            Err(join_err) => {
                warn!(key = %obj.key, error = %join_err, "transformation task died");
                return Response::error(500, "transformation task died");
            }
        };

        // Cache insert precedes the write-back spawn so collapsed waiters
        // can be served from memory while the backend write is in flight.
        self.cache.set(&obj.key, res.copy(), DERIVATIVE_TTL);

        let write_back = res.copy();
        let storage = Arc::clone(&self.storage);
        let target = obj.clone();
        tokio::spawn(async move {
            let reply = storage
                .set(&target, write_back.headers(), write_back.body().clone())
                .await;
            if reply.status() != 200 {
                warn!(
                    key = %target.key,
                    status = reply.status(),
                    "derivative write-back failed"
                );
            }
        });

        res
    }

    /// Bucket-level GET: the region query or an object listing.
    async fn bucket_get(&self, req: &ProxyRequest, obj: &FileObject) -> Response {
        if req.query.contains_key("location") {
            return Response::text(200, S3_LOCATION).with_content_type("application/xml");
        }

        let mut params = ListParams::default();
        if let Some(n) = req.query.get("max-keys").and_then(|v| v.parse().ok()) {
            params.max_keys = n;
        }
        if let Some(v) = req.query.get("delimeter") {
            params.delimeter = v.clone();
        }
        if let Some(v) = req.query.get("prefix") {
            params.prefix = v.clone();
        }
        if let Some(v) = req.query.get("marker") {
            params.marker = v.clone();
        }

        self.storage.list(obj, &params).await
    }

    /// Overlays the first configured header rule matching the response
    /// status. Applying the pass twice yields the same headers.
    fn rewrite_headers(&self, mut res: Response) -> Response {
        for rule in &self.header_rules {
            if rule.matches(res.status()) {
                for (name, value) in &rule.values {
                    res.set_header(name, value);
                }
                break;
            }
        }
        res
    }
}

async fn recv_opt(
    rx: &mut Option<oneshot::Receiver<Response>>,
) -> Result<Response, oneshot::error::RecvError> {
    match rx {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    }
}
