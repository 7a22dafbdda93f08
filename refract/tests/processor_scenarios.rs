//! End-to-end scenarios for the request processor, driven through mock
//! storage and a counting engine.

use bytes::Bytes;
use refract::config::Config;
use refract::engine::{EngineError, Transformer};
use refract::object::FileObject;
use refract::processor::{ProxyRequest, RequestProcessor};
use refract::response::{HeaderMap, Response};
use refract::storage::{ListParams, Storage};
use refract::transform::TransformStep;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const LOCATION_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?><LocationConstraint xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">EU</LocationConstraint>";

// ---------------------------------------------------------------------------
// Mock collaborators
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Behavior {
    Respond {
        status: u16,
        content_type: &'static str,
        body: Bytes,
    },
    Hang,
}

impl Behavior {
    fn ok_image(content_type: &'static str, body: &'static [u8]) -> Self {
        Behavior::Respond {
            status: 200,
            content_type,
            body: Bytes::from_static(body),
        }
    }

    fn status(status: u16) -> Self {
        Behavior::Respond {
            status,
            content_type: "text/plain",
            body: Bytes::new(),
        }
    }
}

/// Programmable storage double. Unconfigured keys answer 404.
struct MockStorage {
    behaviors: Mutex<HashMap<(&'static str, String), Behavior>>,
    gets: AtomicUsize,
    heads: AtomicUsize,
    sets: AtomicUsize,
    set_keys: Mutex<Vec<String>>,
}

impl MockStorage {
    fn new() -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            gets: AtomicUsize::new(0),
            heads: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
            set_keys: Mutex::new(Vec::new()),
        }
    }

    fn on_get(&self, key: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(("get", key.to_string()), behavior);
    }

    fn on_head(&self, key: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(("head", key.to_string()), behavior);
    }

    async fn run(&self, op: &'static str, key: &str) -> Response {
        let behavior = self.behaviors.lock().unwrap().get(&(op, key.to_string())).cloned();
        match behavior {
            Some(Behavior::Respond {
                status,
                content_type,
                body,
            }) => Response::new(status, body).with_content_type(content_type),
            Some(Behavior::Hang) => std::future::pending().await,
            None => Response::error(404, format!("no such key '{}'", key)),
        }
    }
}

impl Storage for MockStorage {
    async fn get(&self, obj: &FileObject) -> Response {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.run("get", &obj.key).await
    }

    async fn head(&self, obj: &FileObject) -> Response {
        self.heads.fetch_add(1, Ordering::SeqCst);
        self.run("head", &obj.key).await
    }

    async fn set(&self, obj: &FileObject, _headers: &HeaderMap, _body: Bytes) -> Response {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.set_keys.lock().unwrap().push(obj.key.clone());
        Response::empty(200)
    }

    async fn list(&self, obj: &FileObject, _params: &ListParams) -> Response {
        Response::text(200, format!("<ListBucketResult>{}</ListBucketResult>", obj.bucket))
            .with_content_type("application/xml")
    }
}

/// Engine double that records invocations and the step lists it was given.
struct CountingEngine {
    invocations: AtomicUsize,
    seen_steps: Mutex<Vec<Vec<TransformStep>>>,
    delay: Option<Duration>,
    fail: bool,
}

impl CountingEngine {
    fn new() -> Self {
        Self {
            invocations: AtomicUsize::new(0),
            seen_steps: Mutex::new(Vec::new()),
            delay: None,
            fail: false,
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }
}

impl Transformer for CountingEngine {
    fn transform(
        &self,
        _source: &Response,
        _target: &FileObject,
        steps: &[TransformStep],
    ) -> Result<Response, EngineError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.seen_steps.lock().unwrap().push(steps.to_vec());
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail {
            return Err(EngineError::Decode("synthetic failure".to_string()));
        }
        Ok(Response::new(200, Bytes::from_static(b"DERIVED")).with_content_type("image/png"))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn test_config(request_timeout: u64, transform_concurrency: usize) -> Config {
    Config::from_yaml(&format!(
        "server:\n  queue_len: 32\n  cache_size: 64\n  request_timeout: {}\n  transform_concurrency: {}\n",
        request_timeout, transform_concurrency
    ))
    .unwrap()
}

fn resize_derivative(key: &str, parent: &str, check_parent: bool) -> FileObject {
    FileObject::derivative(
        "b",
        key,
        vec![TransformStep::Resize {
            width: 200,
            height: 200,
        }],
        FileObject::root("b", parent),
        check_parent,
    )
    .unwrap()
}

/// Storage primed for a fresh-derivative run: derivative absent, parent
/// present and an image.
fn fresh_storage() -> MockStorage {
    let storage = MockStorage::new();
    storage.on_get("k@200x200", Behavior::status(404));
    storage.on_head("k", Behavior::ok_image("image/jpeg", b""));
    storage.on_get("k", Behavior::ok_image("image/jpeg", b"SOURCEJPEG"));
    storage
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within deadline");
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_fresh_derivative_is_produced_cached_and_written_back() {
    let storage = Arc::new(fresh_storage());
    let engine = Arc::new(CountingEngine::new());
    let processor = RequestProcessor::new(
        &test_config(10, 4),
        Arc::clone(&storage),
        Arc::clone(&engine),
    );

    let obj = resize_derivative("k@200x200", "k", true);
    let res = processor.process(ProxyRequest::get(), &obj).await;

    assert_eq!(res.status(), 200);
    assert_eq!(res.body().as_ref(), b"DERIVED");
    assert_eq!(engine.invocations.load(Ordering::SeqCst), 1);
    assert!(processor.cache().get("k@200x200").is_some());

    // The write-back runs detached from the reply.
    wait_until(|| storage.sets.load(Ordering::SeqCst) == 1).await;
    assert_eq!(
        storage.set_keys.lock().unwrap().as_slice(),
        &["k@200x200".to_string()]
    );
}

#[tokio::test]
async fn scenario_cached_derivative_skips_engine_and_storage() {
    let storage = Arc::new(fresh_storage());
    let engine = Arc::new(CountingEngine::new());
    let processor = RequestProcessor::new(
        &test_config(10, 4),
        Arc::clone(&storage),
        Arc::clone(&engine),
    );

    let obj = resize_derivative("k@200x200", "k", true);
    let first = processor.process(ProxyRequest::get(), &obj).await;
    assert_eq!(first.status(), 200);

    let gets_before = storage.gets.load(Ordering::SeqCst);
    let heads_before = storage.heads.load(Ordering::SeqCst);

    let second = processor.process(ProxyRequest::get(), &obj).await;
    assert_eq!(second.status(), 200);
    assert_eq!(second.body().as_ref(), b"DERIVED");

    assert_eq!(engine.invocations.load(Ordering::SeqCst), 1);
    assert_eq!(storage.gets.load(Ordering::SeqCst), gets_before);
    assert_eq!(storage.heads.load(Ordering::SeqCst), heads_before);
}

#[tokio::test]
async fn scenario_concurrent_requests_collapse_to_one_production() {
    let storage = Arc::new(fresh_storage());
    let engine = Arc::new(CountingEngine::slow(Duration::from_millis(80)));
    let processor = Arc::new(RequestProcessor::new(
        &test_config(10, 4),
        Arc::clone(&storage),
        Arc::clone(&engine),
    ));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let processor = Arc::clone(&processor);
        handles.push(tokio::spawn(async move {
            let obj = resize_derivative("k@200x200", "k", true);
            processor.process(ProxyRequest::get(), &obj).await
        }));
    }

    let responses: Vec<Response> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(engine.invocations.load(Ordering::SeqCst), 1);
    for res in &responses {
        assert_eq!(res.status(), 200);
        assert_eq!(res.body().as_ref(), b"DERIVED");
    }
}

#[tokio::test]
async fn scenario_zero_transform_budget_yields_503() {
    let storage = Arc::new(fresh_storage());
    let engine = Arc::new(CountingEngine::new());
    let processor = RequestProcessor::new(
        &test_config(10, 0),
        Arc::clone(&storage),
        Arc::clone(&engine),
    );

    let obj = resize_derivative("k@200x200", "k", true);
    let res = processor.process(ProxyRequest::get(), &obj).await;

    assert_eq!(res.status(), 503);
    assert_eq!(engine.invocations.load(Ordering::SeqCst), 0);
    assert!(processor.cache().get("k@200x200").is_none());
}

#[tokio::test]
async fn scenario_missing_parent_fails_fast_with_404() {
    let storage = Arc::new(MockStorage::new());
    // The derivative fetch never resolves; only the parent probe decides.
    storage.on_get("k@200x200", Behavior::Hang);
    storage.on_head("k", Behavior::status(404));

    let engine = Arc::new(CountingEngine::new());
    let processor = RequestProcessor::new(
        &test_config(10, 4),
        Arc::clone(&storage),
        Arc::clone(&engine),
    );

    let obj = resize_derivative("k@200x200", "k", true);
    let res = processor.process(ProxyRequest::get(), &obj).await;

    assert_eq!(res.status(), 404);
    assert_eq!(engine.invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn scenario_parent_404_beats_existing_derivative() {
    let storage = Arc::new(MockStorage::new());
    // The derivative is still persisted, but its source is gone.
    storage.on_get("k@200x200", Behavior::ok_image("image/png", b"STALE"));
    storage.on_head("k", Behavior::status(404));

    let engine = Arc::new(CountingEngine::new());
    let processor = RequestProcessor::new(
        &test_config(10, 4),
        Arc::clone(&storage),
        Arc::clone(&engine),
    );

    let obj = resize_derivative("k@200x200", "k", true);
    let res = processor.process(ProxyRequest::get(), &obj).await;

    assert_eq!(res.status(), 404);
    assert_eq!(engine.invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_hanging_storage_times_out_at_the_deadline() {
    let storage = Arc::new(MockStorage::new());
    storage.on_get("k", Behavior::Hang);

    let engine = Arc::new(CountingEngine::new());
    let processor = RequestProcessor::new(&test_config(2, 4), storage, engine);

    let started = tokio::time::Instant::now();
    let res = processor
        .process(ProxyRequest::get(), &FileObject::root("b", "k"))
        .await;

    assert_eq!(res.status(), 504);
    assert_eq!(res.body().as_ref(), b"timeout");
    assert_eq!(started.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn scenario_collapsed_waiter_times_out_one_second_early() {
    let storage = Arc::new(MockStorage::new());
    storage.on_get("k@200x200", Behavior::Hang);

    let engine = Arc::new(CountingEngine::new());
    let processor = Arc::new(RequestProcessor::new(&test_config(5, 4), storage, engine));

    let leader = {
        let processor = Arc::clone(&processor);
        tokio::spawn(async move {
            let obj = resize_derivative("k@200x200", "k", false);
            processor.process(ProxyRequest::get(), &obj).await
        })
    };

    // Let the leader take the lock before the waiter arrives.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = tokio::time::Instant::now();
    let obj = resize_derivative("k@200x200", "k", false);
    let waiter_res = processor.process(ProxyRequest::get(), &obj).await;

    assert_eq!(waiter_res.status(), 504);
    assert_eq!(waiter_res.body().as_ref(), b"timeout");
    assert_eq!(started.elapsed(), Duration::from_secs(4));

    let leader_res = leader.await.unwrap();
    assert_eq!(leader_res.status(), 504);
}

#[tokio::test]
async fn scenario_location_query_returns_exact_xml() {
    let storage = Arc::new(MockStorage::new());
    let engine = Arc::new(CountingEngine::new());
    let processor = RequestProcessor::new(&test_config(10, 4), storage, engine);

    let res = processor
        .process(
            ProxyRequest::get().with_query("location", ""),
            &FileObject::listing("b"),
        )
        .await;

    assert_eq!(res.status(), 200);
    assert_eq!(res.body().as_ref(), LOCATION_XML.as_bytes());
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn property_cancelled_request_returns_499() {
    let storage = Arc::new(MockStorage::new());
    storage.on_get("k", Behavior::Hang);

    let engine = Arc::new(CountingEngine::new());
    let processor = Arc::new(RequestProcessor::new(&test_config(10, 4), storage, engine));

    let cancel = CancellationToken::new();
    let request = {
        let processor = Arc::clone(&processor);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            processor
                .process(
                    ProxyRequest::get().with_cancel(cancel),
                    &FileObject::root("b", "k"),
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();

    let res = request.await.unwrap();
    assert_eq!(res.status(), 499);
    assert!(res.body().is_empty());
}

#[tokio::test]
async fn property_cancelled_waiter_does_not_stall_the_leader() {
    let storage = Arc::new(fresh_storage());
    let engine = Arc::new(CountingEngine::slow(Duration::from_millis(120)));
    let processor = Arc::new(RequestProcessor::new(
        &test_config(10, 4),
        Arc::clone(&storage),
        Arc::clone(&engine),
    ));

    let leader = {
        let processor = Arc::clone(&processor);
        tokio::spawn(async move {
            let obj = resize_derivative("k@200x200", "k", true);
            processor.process(ProxyRequest::get(), &obj).await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;

    let cancel = CancellationToken::new();
    let waiter = {
        let processor = Arc::clone(&processor);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let obj = resize_derivative("k@200x200", "k", true);
            processor
                .process(ProxyRequest::get().with_cancel(cancel), &obj)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let waiter_res = waiter.await.unwrap();
    assert_eq!(waiter_res.status(), 499);

    let leader_res = leader.await.unwrap();
    assert_eq!(leader_res.status(), 200);
    assert_eq!(leader_res.body().as_ref(), b"DERIVED");
}

#[tokio::test]
async fn property_transform_chain_is_applied_root_first() {
    let storage = Arc::new(MockStorage::new());
    storage.on_get("leaf", Behavior::status(404));
    storage.on_head("src", Behavior::ok_image("image/png", b""));
    storage.on_get("src", Behavior::ok_image("image/png", b"SRC"));

    let engine = Arc::new(CountingEngine::new());
    let processor = RequestProcessor::new(
        &test_config(10, 4),
        Arc::clone(&storage),
        Arc::clone(&engine),
    );

    let root = FileObject::root("b", "src");
    let mid = FileObject::derivative(
        "b",
        "mid",
        vec![TransformStep::Resize {
            width: 100,
            height: 100,
        }],
        root,
        false,
    )
    .unwrap();
    let leaf =
        FileObject::derivative("b", "leaf", vec![TransformStep::Grayscale], mid, false).unwrap();

    let res = processor.process(ProxyRequest::get(), &leaf).await;
    assert_eq!(res.status(), 200);

    // The walk collects child-to-root; the engine must see root-first.
    let seen = engine.seen_steps.lock().unwrap();
    assert_eq!(
        seen.as_slice(),
        &[vec![
            TransformStep::Resize {
                width: 100,
                height: 100
            },
            TransformStep::Grayscale,
        ]]
    );
}

#[tokio::test]
async fn property_put_returns_storage_reply_untouched() {
    let storage = Arc::new(MockStorage::new());
    let engine = Arc::new(CountingEngine::new());
    let config = Config::from_yaml(
        "server:\n  request_timeout: 10\nheaders:\n  - status_codes: [200]\n    values:\n      cache-control: \"max-age=60\"\n",
    )
    .unwrap();
    let processor = RequestProcessor::new(&config, Arc::clone(&storage), engine);

    let res = processor
        .process(
            ProxyRequest::put(Bytes::from_static(b"payload")),
            &FileObject::root("b", "up.bin"),
        )
        .await;

    assert_eq!(res.status(), 200);
    assert!(res.header("cache-control").is_none());
    assert_eq!(storage.sets.load(Ordering::SeqCst), 1);
    assert!(processor.cache().is_empty());
}

#[tokio::test]
async fn property_engine_failure_maps_to_400_and_is_not_cached() {
    let storage = Arc::new(fresh_storage());
    let engine = Arc::new(CountingEngine::failing());
    let processor = RequestProcessor::new(
        &test_config(10, 4),
        Arc::clone(&storage),
        Arc::clone(&engine),
    );

    let obj = resize_derivative("k@200x200", "k", true);
    let res = processor.process(ProxyRequest::get(), &obj).await;

    assert_eq!(res.status(), 400);
    assert!(String::from_utf8_lossy(res.body()).contains("synthetic failure"));
    assert!(processor.cache().get("k@200x200").is_none());
    assert_eq!(storage.sets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn property_persisted_derivative_is_served_without_engine() {
    let storage = Arc::new(MockStorage::new());
    storage.on_get("k@200x200", Behavior::ok_image("image/png", b"PERSISTED"));
    storage.on_head("k", Behavior::ok_image("image/jpeg", b""));

    let engine = Arc::new(CountingEngine::new());
    let processor = RequestProcessor::new(
        &test_config(10, 4),
        Arc::clone(&storage),
        Arc::clone(&engine),
    );

    let obj = resize_derivative("k@200x200", "k", true);
    let res = processor.process(ProxyRequest::get(), &obj).await;

    assert_eq!(res.status(), 200);
    assert_eq!(res.body().as_ref(), b"PERSISTED");
    assert_eq!(engine.invocations.load(Ordering::SeqCst), 0);
}
