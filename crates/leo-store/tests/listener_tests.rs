//! Index listener scheduling, routing and redelivery behavior over the
//! in-memory queue.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use leo_store::{
    Error, IndexListener, Indexer, ListenerConfig, Location, MemoryQueue, Metadata, QueueClient,
    Result, StoreDataDetails,
};

fn event(path: &str, type_name: Option<&str>, id: Option<i64>, reindex: bool) -> String {
    let mut metadata = Metadata::new();
    if let Some(type_name) = type_name {
        metadata.set("Type", type_name);
    }
    if reindex {
        metadata.set_reindex();
    }
    StoreDataDetails::new(&Location::new("kalixtest", path), id, metadata)
        .to_json()
        .unwrap()
}

fn fast_config(parallelism: usize) -> ListenerConfig {
    ListenerConfig {
        parallelism,
        empty_poll_delay: Duration::from_millis(5),
    }
}

fn spawn_listener(listener: IndexListener) -> (Arc<IndexListener>, JoinHandle<Result<()>>) {
    let listener = Arc::new(listener);
    let runner = Arc::clone(&listener);
    let handle = tokio::spawn(async move { runner.run().await });
    (listener, handle)
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

/// Records invocations, their payloads and any concurrent overlap.
#[derive(Default)]
struct RecordingIndexer {
    active: AtomicUsize,
    overlaps: AtomicUsize,
    hold: Duration,
    indexed: Mutex<Vec<Vec<StoreDataDetails>>>,
    reindexed: Mutex<Vec<Vec<StoreDataDetails>>>,
}

impl RecordingIndexer {
    fn with_hold(hold: Duration) -> Self {
        Self {
            hold,
            ..Self::default()
        }
    }

    fn indexed_invocations(&self) -> usize {
        self.indexed.lock().len()
    }

    fn indexed_paths(&self) -> Vec<String> {
        self.indexed
            .lock()
            .iter()
            .flatten()
            .map(|details| details.base_path.clone())
            .collect()
    }
}

#[async_trait]
impl Indexer for RecordingIndexer {
    async fn index(&self, items: Vec<StoreDataDetails>) -> Result<()> {
        if self.active.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        sleep(self.hold).await;
        self.indexed.lock().push(items);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reindex(&self, items: Vec<StoreDataDetails>) -> Result<()> {
        self.reindexed.lock().push(items);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spaced_events_on_one_key_arrive_as_ordered_non_overlapping_invocations() {
    let queue = Arc::new(MemoryQueue::new());
    let indexer = Arc::new(RecordingIndexer::with_hold(Duration::from_millis(15)));

    let mut listener = IndexListener::new(queue.clone()).with_config(fast_config(4));
    listener
        .register_type_indexer("Order", indexer.clone())
        .unwrap();
    let (listener, handle) = spawn_listener(listener);

    for (n, path) in ["orders/1.json", "orders/2.json", "orders/3.json"]
        .iter()
        .enumerate()
    {
        queue
            .send_message(event(path, Some("Order"), Some(n as i64), false))
            .await
            .unwrap();
        sleep(Duration::from_millis(10)).await;
        let expected = n + 1;
        let recorder = Arc::clone(&indexer);
        wait_until("invocation to land", move || {
            recorder.indexed_invocations() >= expected
        })
        .await;
    }

    listener.shutdown();
    handle.await.unwrap().unwrap();

    assert_eq!(indexer.indexed_invocations(), 3);
    assert_eq!(
        indexer.indexed_paths(),
        vec!["orders/1.json", "orders/2.json", "orders/3.json"]
    );
    assert_eq!(indexer.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(queue.depth(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bursts_on_one_key_preserve_arrival_order_without_overlap() {
    let queue = Arc::new(MemoryQueue::new());
    let indexer = Arc::new(RecordingIndexer::with_hold(Duration::from_millis(5)));

    let mut listener = IndexListener::new(queue.clone()).with_config(fast_config(4));
    listener
        .register_path_indexer("orders/", indexer.clone())
        .unwrap();
    let (listener, handle) = spawn_listener(listener);

    let paths: Vec<String> = (0..6).map(|n| format!("orders/{n}.json")).collect();
    for path in &paths {
        queue.send_message(event(path, None, None, false)).await.unwrap();
    }

    let recorder = Arc::clone(&indexer);
    wait_until("all six events", move || {
        recorder.indexed_paths().len() == 6
    })
    .await;
    listener.shutdown();
    handle.await.unwrap().unwrap();

    assert_eq!(indexer.indexed_paths(), paths);
    assert_eq!(indexer.overlaps.load(Ordering::SeqCst), 0);
}

/// Tracks wall-clock intervals of invocations to observe cross-key overlap.
#[derive(Default)]
struct TimingIndexer {
    spans: Mutex<Vec<(Instant, Instant)>>,
}

#[async_trait]
impl Indexer for TimingIndexer {
    async fn index(&self, _items: Vec<StoreDataDetails>) -> Result<()> {
        let start = Instant::now();
        sleep(Duration::from_millis(60)).await;
        self.spans.lock().push((start, Instant::now()));
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_keys_run_in_parallel() {
    let queue = Arc::new(MemoryQueue::new());
    let indexer = Arc::new(TimingIndexer::default());

    let mut listener = IndexListener::new(queue.clone()).with_config(fast_config(4));
    listener.register_path_indexer("", indexer.clone()).unwrap();
    let (listener, handle) = spawn_listener(listener);

    // Different first segments mean different logical keys.
    queue
        .send_message(event("alpha/1.json", None, None, false))
        .await
        .unwrap();
    queue
        .send_message(event("beta/1.json", None, None, false))
        .await
        .unwrap();

    let recorder = Arc::clone(&indexer);
    wait_until("both invocations", move || recorder.spans.lock().len() == 2).await;
    listener.shutdown();
    handle.await.unwrap().unwrap();

    let spans = indexer.spans.lock();
    let (start_a, end_a) = spans[0];
    let (start_b, end_b) = spans[1];
    assert!(
        start_a < end_b && start_b < end_a,
        "expected the two key handlers to overlap in time"
    );
}

/// Fails its first invocation, then succeeds.
struct FlakyIndexer {
    failures_left: AtomicUsize,
    succeeded: Mutex<Vec<String>>,
}

#[async_trait]
impl Indexer for FlakyIndexer {
    async fn index(&self, items: Vec<StoreDataDetails>) -> Result<()> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok()
        {
            return Err(Error::Dispatch("injected failure".to_string()));
        }
        let mut succeeded = self.succeeded.lock();
        succeeded.extend(items.into_iter().map(|d| d.base_path));
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_batches_are_redelivered_until_they_succeed() {
    let queue = Arc::new(MemoryQueue::new());
    let indexer = Arc::new(FlakyIndexer {
        failures_left: AtomicUsize::new(1),
        succeeded: Mutex::new(Vec::new()),
    });
    let sink_errors = Arc::new(AtomicUsize::new(0));

    let mut listener = IndexListener::new(queue.clone()).with_config(fast_config(2));
    listener
        .register_path_indexer("orders/", indexer.clone())
        .unwrap();
    let sink_count = Arc::clone(&sink_errors);
    let listener = listener.with_error_sink(Arc::new(move |_err| {
        sink_count.fetch_add(1, Ordering::SeqCst);
    }));
    let (listener, handle) = spawn_listener(listener);

    queue
        .send_message(event("orders/1.json", None, None, false))
        .await
        .unwrap();

    let recorder = Arc::clone(&indexer);
    wait_until("redelivered batch to succeed", move || {
        !recorder.succeeded.lock().is_empty()
    })
    .await;
    let queue_probe = Arc::clone(&queue);
    wait_until("queue to drain", move || queue_probe.depth() == 0).await;
    listener.shutdown();
    handle.await.unwrap().unwrap();

    assert_eq!(indexer.succeeded.lock().as_slice(), ["orders/1.json"]);
    assert!(sink_errors.load(Ordering::SeqCst) >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reindex_events_reach_the_reindex_capability_with_the_flag_stripped() {
    let queue = Arc::new(MemoryQueue::new());
    let indexer = Arc::new(RecordingIndexer::default());

    let mut listener = IndexListener::new(queue.clone()).with_config(fast_config(2));
    listener
        .register_type_indexer("Order", indexer.clone())
        .unwrap();
    let (listener, handle) = spawn_listener(listener);

    queue
        .send_message(event("orders/1.json", Some("Order"), Some(1), true))
        .await
        .unwrap();

    let recorder = Arc::clone(&indexer);
    wait_until("reindex invocation", move || {
        !recorder.reindexed.lock().is_empty()
    })
    .await;
    listener.shutdown();
    handle.await.unwrap().unwrap();

    assert_eq!(indexer.indexed_invocations(), 0);
    let reindexed = indexer.reindexed.lock();
    assert_eq!(reindexed.len(), 1);
    assert!(
        !reindexed[0][0].metadata.reindex(),
        "the transient flag must not propagate downstream"
    );
}

/// No reindex override: synthetic re-emissions fall back to `index`.
struct PlainIndexer {
    indexed: Mutex<Vec<StoreDataDetails>>,
}

#[async_trait]
impl Indexer for PlainIndexer {
    async fn index(&self, items: Vec<StoreDataDetails>) -> Result<()> {
        self.indexed.lock().extend(items);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reindex_defaults_to_index_when_the_capability_is_absent() {
    let queue = Arc::new(MemoryQueue::new());
    let indexer = Arc::new(PlainIndexer {
        indexed: Mutex::new(Vec::new()),
    });

    let mut listener = IndexListener::new(queue.clone()).with_config(fast_config(2));
    listener
        .register_path_indexer("orders/", indexer.clone())
        .unwrap();
    let (listener, handle) = spawn_listener(listener);

    queue
        .send_message(event("orders/1.json", None, None, true))
        .await
        .unwrap();

    let recorder = Arc::clone(&indexer);
    wait_until("fallback invocation", move || {
        !recorder.indexed.lock().is_empty()
    })
    .await;
    listener.shutdown();
    handle.await.unwrap().unwrap();

    assert_eq!(indexer.indexed.lock().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unrouteable_messages_stay_queued_and_hit_the_error_sink() {
    let queue = Arc::new(MemoryQueue::new());
    let dispatch_errors = Arc::new(AtomicUsize::new(0));

    let mut listener = IndexListener::new(queue.clone()).with_config(fast_config(2));
    listener
        .register_path_indexer("documents/", Arc::new(PlainIndexer {
            indexed: Mutex::new(Vec::new()),
        }))
        .unwrap();
    let sink_count = Arc::clone(&dispatch_errors);
    let listener = listener.with_error_sink(Arc::new(move |err| {
        if matches!(err, Error::Dispatch(_)) {
            sink_count.fetch_add(1, Ordering::SeqCst);
        }
    }));
    let (listener, handle) = spawn_listener(listener);

    queue
        .send_message(event("orders/1.json", Some("Unregistered"), None, false))
        .await
        .unwrap();

    // Seeing the error more than once proves the message was redelivered.
    let errors = Arc::clone(&dispatch_errors);
    wait_until("repeated dispatch failures", move || {
        errors.load(Ordering::SeqCst) >= 2
    })
    .await;
    listener.shutdown();
    handle.await.unwrap().unwrap();

    assert_eq!(queue.depth(), 1, "the message must remain for redelivery");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn type_batches_deduplicate_by_id_within_one_fetch() {
    let queue = Arc::new(MemoryQueue::new());
    let indexer = Arc::new(RecordingIndexer::default());

    // Everything is enqueued before the listener starts, so one fetch picks
    // up the whole batch for the key.
    for (path, id) in [
        ("orders/1.json", 1),
        ("orders/1-again.json", 1),
        ("orders/2.json", 2),
    ] {
        queue
            .send_message(event(path, Some("Order"), Some(id), false))
            .await
            .unwrap();
    }

    let mut listener = IndexListener::new(queue.clone()).with_config(fast_config(4));
    listener
        .register_type_indexer("Order", indexer.clone())
        .unwrap();
    let (listener, handle) = spawn_listener(listener);

    let recorder = Arc::clone(&indexer);
    wait_until("deduplicated invocation", move || {
        recorder.indexed_invocations() >= 1
    })
    .await;
    listener.shutdown();
    handle.await.unwrap().unwrap();

    assert_eq!(indexer.indexed_invocations(), 1);
    let ids: HashSet<Option<i64>> = indexer.indexed.lock()[0].iter().map(|d| d.id).collect();
    assert_eq!(ids, HashSet::from([Some(1), Some(2)]));
    assert_eq!(indexer.indexed.lock()[0].len(), 2);
    assert_eq!(queue.depth(), 0, "deduplicated messages are still acknowledged");
}
