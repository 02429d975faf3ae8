//! Tests for clear_cache, remove, dispose and tracer events.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use query_stream::{
    CacheError, Fetcher, LogTracer, OperationKind, OperationOutcome, QueryCache, Tracer,
    TracerKey, UpdateFn,
};
use tokio::sync::oneshot;

/// Fetcher answering `fetched_<key>`, or waiting on a gate when one is queued.
#[derive(Default)]
struct TestFetcher {
    gates: Mutex<VecDeque<oneshot::Receiver<String>>>,
}

impl TestFetcher {
    fn gate(&self) -> oneshot::Sender<String> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().push_back(rx);
        tx
    }
}

#[async_trait]
impl Fetcher<String, String> for TestFetcher {
    async fn fetch(&self, key: &String) -> anyhow::Result<String> {
        let gate = self.gates.lock().pop_front();
        match gate {
            Some(gate) => Ok(gate.await?),
            None => Ok(format!("fetched_{key}")),
        }
    }
}

/// Tracer recording event names.
#[derive(Default)]
struct RecordingTracer {
    events: Mutex<Vec<String>>,
}

impl RecordingTracer {
    fn record(&self, event: String) {
        self.events.lock().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl Tracer for RecordingTracer {
    fn on_cache_hit(&self, key: &TracerKey) {
        self.record(format!("hit {}", key.key_debug));
    }

    fn on_fetch_start(&self, key: &TracerKey, force_refresh: bool) {
        self.record(format!("fetch {} {}", key.key_debug, force_refresh));
    }

    fn on_fetch_end(&self, key: &TracerKey, outcome: &OperationOutcome) {
        self.record(format!("fetched {} {:?}", key.key_debug, outcome));
    }

    fn on_rollback(&self, key: &TracerKey, restored: bool) {
        self.record(format!("rollback {} {}", key.key_debug, restored));
    }

    fn on_superseded(&self, key: &TracerKey, kind: OperationKind) {
        self.record(format!("superseded {} {:?}", key.key_debug, kind));
    }

    fn on_cache_cleared(&self, entries: usize) {
        self.record(format!("cleared {entries}"));
    }

    fn on_disposed(&self, cancelled: usize) {
        self.record(format!("disposed {cancelled}"));
    }
}

fn key(name: &str) -> String {
    name.to_string()
}

// =============================================================================
// clear_cache / remove
// =============================================================================

#[tokio::test]
async fn test_clear_cache_publishes_miss_everywhere() {
    let cache = QueryCache::new(TestFetcher::default());
    cache.get(key("a")).await.unwrap();
    cache.get(key("b")).await.unwrap();
    let mut stream_a = cache.get_stream(&key("a"));
    let mut stream_b = cache.get_stream(&key("b"));
    stream_a.next().await.unwrap();
    stream_b.next().await.unwrap();

    cache.clear_cache();

    assert!(cache.get_current_value(&key("a")).is_none());
    assert!(cache.get_current_value(&key("b")).is_none());
    assert!(cache.is_empty());
    assert!(stream_a.next().await.unwrap().is_miss());
    assert!(stream_b.next().await.unwrap().is_miss());

    // Streams stay open and keep delivering.
    cache.get(key("a")).await.unwrap();
    assert!(stream_a.next().await.unwrap().value().is_some());
}

#[tokio::test]
async fn test_clear_cache_does_not_cancel_in_flight_fetch() {
    let fetcher = Arc::new(TestFetcher::default());
    let cache = QueryCache::new(fetcher.clone());
    let gate = fetcher.gate();

    let mut pending = Box::pin(cache.get(key("a")));
    assert!(futures::poll!(pending.as_mut()).is_pending());

    cache.clear_cache();
    assert!(cache.is_fetching(&key("a")));

    gate.send("late".to_string()).unwrap();
    assert_eq!(*pending.await.unwrap(), "late");
    assert_eq!(
        cache.get_current_value(&key("a")).as_deref(),
        Some(&"late".to_string())
    );
}

#[tokio::test]
async fn test_clear_cache_does_not_cancel_in_flight_update() {
    let (tx, rx) = oneshot::channel::<String>();
    let rx = Mutex::new(Some(rx));
    let cache = QueryCache::builder(TestFetcher::default())
        .updater(UpdateFn::new(move |_key: String, _value: Arc<String>| {
            let gate = rx.lock().take();
            async move {
                match gate {
                    Some(gate) => Ok::<String, anyhow::Error>(gate.await?),
                    None => Err(anyhow::anyhow!("gate already used")),
                }
            }
        }))
        .build();

    let mut pending = Box::pin(cache.update_data(key("a"), "draft".to_string()));
    assert!(futures::poll!(pending.as_mut()).is_pending());

    cache.clear_cache();
    assert!(cache.get_current_value(&key("a")).is_none());
    assert!(cache.is_updating(&key("a")));

    tx.send("saved".to_string()).unwrap();
    let confirmed = pending.await.unwrap();
    assert_eq!(confirmed.as_deref().map(String::as_str), Some("saved"));
}

#[tokio::test]
async fn test_remove_single_key() {
    let cache = QueryCache::new(TestFetcher::default());
    cache.get(key("a")).await.unwrap();
    cache.get(key("b")).await.unwrap();
    let mut stream_a = cache.get_stream(&key("a"));
    stream_a.next().await.unwrap();

    assert!(cache.remove(&key("a")));
    assert!(!cache.remove(&key("a")));
    assert!(stream_a.next().await.unwrap().is_miss());

    assert!(cache.get_current_value(&key("a")).is_none());
    assert!(cache.get_current_value(&key("b")).is_some());
    assert_eq!(cache.cached_keys(), vec![key("b")]);
}

// =============================================================================
// dispose
// =============================================================================

#[tokio::test]
async fn test_dispose_closes_streams() {
    let cache = QueryCache::new(TestFetcher::default());
    cache.get(key("a")).await.unwrap();
    let mut open = cache.get_stream(&key("a"));
    open.next().await.unwrap();

    cache.dispose();
    assert!(cache.is_disposed());
    assert!(open.next().await.is_none());

    // Subscribing after dispose yields an already-ended stream.
    let mut late = cache.get_stream(&key("a"));
    assert!(matches!(late.next().now_or_never(), Some(None)));
    let mut unknown = cache.get_stream(&key("never"));
    assert!(matches!(unknown.next().now_or_never(), Some(None)));
    assert!(cache.get_current_value(&key("a")).is_none());
}

#[tokio::test]
async fn test_dispose_cancels_in_flight_operations() {
    let fetcher = Arc::new(TestFetcher::default());
    let (update_tx, update_rx) = oneshot::channel::<String>();
    let update_rx = Mutex::new(Some(update_rx));
    let cache = QueryCache::builder(fetcher.clone())
        .updater(UpdateFn::new(move |_key: String, _value: Arc<String>| {
            let gate = update_rx.lock().take();
            async move {
                match gate {
                    Some(gate) => Ok::<String, anyhow::Error>(gate.await?),
                    None => Err(anyhow::anyhow!("gate already used")),
                }
            }
        }))
        .build();
    let fetch_gate = fetcher.gate();

    let mut fetch = Box::pin(cache.get(key("a")));
    assert!(futures::poll!(fetch.as_mut()).is_pending());
    let mut update = Box::pin(cache.update_data(key("b"), "draft".to_string()));
    assert!(futures::poll!(update.as_mut()).is_pending());
    assert_eq!(cache.in_flight(OperationKind::Fetch), 1);
    assert_eq!(cache.in_flight(OperationKind::Update), 1);

    cache.dispose();
    assert_eq!(cache.in_flight(OperationKind::Fetch), 0);
    assert_eq!(cache.in_flight(OperationKind::Update), 0);

    // Gates may still fire; results are discarded.
    let _ = fetch_gate.send("late".to_string());
    let _ = update_tx.send("late".to_string());
    assert!(fetch.await.unwrap_err().is_cancelled());
    assert!(update.await.unwrap_err().is_cancelled());
    assert!(cache.get_current_value(&key("a")).is_none());
}

#[tokio::test]
async fn test_operations_after_dispose() {
    let cache = QueryCache::new(TestFetcher::default());
    cache.dispose();
    cache.dispose();

    assert!(matches!(
        cache.get(key("a")).await,
        Err(CacheError::Disposed)
    ));
    assert!(matches!(
        cache.update_data(key("a"), "x".to_string()).await,
        Err(CacheError::Disposed)
    ));
    cache.clear_cache();
    assert!(!cache.remove(&key("a")));
}

// =============================================================================
// Tracer
// =============================================================================

#[tokio::test]
async fn test_tracer_sees_lifecycle() {
    let tracer = Arc::new(RecordingTracer::default());
    let fetcher = Arc::new(TestFetcher::default());
    let cache = QueryCache::builder(fetcher.clone())
        .updater(UpdateFn::new(|_key: String, _value: Arc<String>| async move {
            Err::<String, _>(anyhow::anyhow!("rejected"))
        }))
        .tracer(tracer.clone())
        .build();

    cache.get(key("a")).await.unwrap();
    cache.get(key("a")).await.unwrap();
    assert!(cache.update_data(key("a"), "x".to_string()).await.is_err());

    let first_gate = fetcher.gate();
    let _second_gate = fetcher.gate();
    let mut first = Box::pin(cache.refresh(key("a")));
    assert!(futures::poll!(first.as_mut()).is_pending());
    let mut second = Box::pin(cache.refresh(key("a")));
    assert!(futures::poll!(second.as_mut()).is_pending());
    drop(first_gate);
    assert!(first.await.is_err());
    drop(second);

    cache.clear_cache();
    cache.dispose();

    assert_eq!(
        tracer.events(),
        vec![
            "fetch \"a\" false".to_string(),
            "fetched \"a\" Stored".to_string(),
            "hit \"a\"".to_string(),
            "rollback \"a\" true".to_string(),
            "fetch \"a\" true".to_string(),
            "superseded \"a\" Fetch".to_string(),
            "fetch \"a\" true".to_string(),
            "fetched \"a\" Cancelled".to_string(),
            "cleared 1".to_string(),
            "disposed 0".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_log_tracer_does_not_disturb_results() {
    let cache = QueryCache::builder(TestFetcher::default())
        .tracer(LogTracer)
        .build();
    assert_eq!(*cache.get(key("a")).await.unwrap(), "fetched_a");
    cache.dispose();
}
