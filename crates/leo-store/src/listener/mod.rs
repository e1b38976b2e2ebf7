//! The index listener: consumes change events and dispatches them to
//! registered indexers.
//!
//! Two constraints shape the scheduler: at most one handler is in flight per
//! logical key (`container + "_" + first path segment`), so updates to a
//! single logical entity are serialized, and up to `parallelism` distinct
//! keys run concurrently. Per-key order is enforced by chaining a new batch
//! onto the previous task for the same key; completions are signaled over a
//! channel rather than polled.

mod dispatch;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::events::StoreDataDetails;
use crate::metrics::StoreMetrics;
use crate::queue::{LeasedMessage, QueueClient};
use crate::{Error, Result};

/// A registered consumer of change events.
///
/// Indexers must be idempotent on `(Container, BasePath, Id, Snapshot)`:
/// delivery is at-least-once, and a failed batch is redelivered whole.
/// An indexer may be invoked concurrently for different logical keys, never
/// concurrently for the same one.
#[async_trait]
pub trait Indexer: Send + Sync {
    async fn index(&self, items: Vec<StoreDataDetails>) -> Result<()>;

    /// Invoked for synthetic re-emissions. Override to handle them
    /// distinctly; the default treats them as ordinary index calls.
    async fn reindex(&self, items: Vec<StoreDataDetails>) -> Result<()> {
        self.index(items).await
    }
}

/// Routing decision for one event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Route {
    Type(String),
    Path(String),
}

/// Immutable-after-startup indexer registries.
#[derive(Clone, Default)]
pub(crate) struct IndexerRegistry {
    by_type: HashMap<String, Arc<dyn Indexer>>,
    by_path: BTreeMap<String, Arc<dyn Indexer>>,
}

impl IndexerRegistry {
    fn register_type(&mut self, type_name: String, indexer: Arc<dyn Indexer>) -> Result<()> {
        if self.by_type.contains_key(&type_name) {
            return Err(Error::Config(format!(
                "type indexer already registered for {type_name}"
            )));
        }
        self.by_type.insert(type_name, indexer);
        Ok(())
    }

    fn register_path(&mut self, prefix: String, indexer: Arc<dyn Indexer>) -> Result<()> {
        if self.by_path.contains_key(&prefix) {
            return Err(Error::Config(format!(
                "path indexer already registered for {prefix}"
            )));
        }
        self.by_path.insert(prefix, indexer);
        Ok(())
    }

    /// Type match first, then the longest matching path prefix.
    pub(crate) fn resolve(
        &self,
        details: &StoreDataDetails,
    ) -> Result<(Route, Arc<dyn Indexer>)> {
        if let Some(type_name) = details.metadata.type_name() {
            if let Some(indexer) = self.by_type.get(type_name) {
                return Ok((Route::Type(type_name.to_string()), Arc::clone(indexer)));
            }
        }
        let matched = self
            .by_path
            .iter()
            .filter(|(prefix, _)| details.base_path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len());
        match matched {
            Some((prefix, indexer)) => Ok((Route::Path(prefix.clone()), Arc::clone(indexer))),
            None => Err(Error::Dispatch(format!(
                "no indexer for {}/{} (type {:?})",
                details.container,
                details.base_path,
                details.metadata.type_name()
            ))),
        }
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Maximum distinct logical keys in flight at once.
    pub parallelism: usize,
    /// How long to sleep after an empty fetch.
    pub empty_poll_delay: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            empty_poll_delay: Duration::from_secs(2),
        }
    }
}

/// Where batch failures go. The scheduler itself never dies on them.
pub type ErrorSink = Arc<dyn Fn(&Error) + Send + Sync>;

struct InFlight {
    handle: JoinHandle<()>,
    generation: u64,
}

struct Completion {
    key: String,
    generation: u64,
}

/// Consumes the index queue and fans batches out to indexers.
pub struct IndexListener {
    queue: Arc<dyn QueueClient>,
    registry: IndexerRegistry,
    config: ListenerConfig,
    error_sink: ErrorSink,
    metrics: Arc<StoreMetrics>,
    shutdown_tx: broadcast::Sender<()>,
}

impl IndexListener {
    pub fn new(queue: Arc<dyn QueueClient>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            queue,
            registry: IndexerRegistry::default(),
            config: ListenerConfig::default(),
            error_sink: Arc::new(|err| error!("index listener error: {err}")),
            metrics: Arc::new(StoreMetrics::new()),
            shutdown_tx,
        }
    }

    pub fn with_config(mut self, config: ListenerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
        self.error_sink = sink;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<StoreMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Register an indexer for an application type name. Duplicate
    /// registrations are configuration errors.
    pub fn register_type_indexer(
        &mut self,
        type_name: impl Into<String>,
        indexer: Arc<dyn Indexer>,
    ) -> Result<()> {
        self.registry.register_type(type_name.into(), indexer)
    }

    /// Register an indexer for a base-path prefix. Duplicate registrations
    /// are configuration errors.
    pub fn register_path_indexer(
        &mut self,
        prefix: impl Into<String>,
        indexer: Arc<dyn Indexer>,
    ) -> Result<()> {
        self.registry.register_path(prefix.into(), indexer)
    }

    /// Signal the supervising loop to exit. In-flight batches finish.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// A clone of the shutdown sender for external signal handling.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// The supervising loop. Runs until [`shutdown`](Self::shutdown) is
    /// signaled; batch failures are forwarded to the error sink and the
    /// affected messages are left for redelivery.
    pub async fn run(&self) -> Result<()> {
        let parallelism = self.config.parallelism.max(1);
        let registry = Arc::new(self.registry.clone());
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let mut in_flight: HashMap<String, InFlight> = HashMap::new();
        let mut generation: u64 = 0;
        info!("index listener started (parallelism {parallelism})");

        loop {
            while let Ok(done) = done_rx.try_recv() {
                reap(&mut in_flight, done);
            }
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            if in_flight.len() >= parallelism {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    done = done_rx.recv() => {
                        if let Some(done) = done {
                            reap(&mut in_flight, done);
                        }
                    }
                }
                continue;
            }

            let messages = match self.queue.listen_for_next_message(parallelism).await {
                Ok(messages) => messages,
                Err(err) => {
                    (self.error_sink)(&err);
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(self.config.empty_poll_delay) => {}
                    }
                    continue;
                }
            };
            if messages.is_empty() {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(self.config.empty_poll_delay) => {}
                }
                continue;
            }

            let mut batches: HashMap<String, Vec<Box<dyn LeasedMessage>>> = HashMap::new();
            for message in messages {
                let key = logical_key_of(message.body());
                batches.entry(key).or_default().push(message);
            }

            for (key, batch) in batches {
                generation += 1;
                // Chaining onto the predecessor task guarantees per-key FIFO.
                let predecessor = in_flight.remove(&key).map(|task| task.handle);
                let registry = Arc::clone(&registry);
                let sink = Arc::clone(&self.error_sink);
                let metrics = Arc::clone(&self.metrics);
                let done_tx = done_tx.clone();
                let task_key = key.clone();
                let task_generation = generation;
                let handle = tokio::spawn(async move {
                    if let Some(previous) = predecessor {
                        let _ = previous.await;
                    }
                    match dispatch::dispatch_batch(&registry, batch).await {
                        Ok(()) => metrics.record_dispatch(),
                        Err(err) => {
                            metrics.record_dispatch_failure();
                            sink(&err);
                        }
                    }
                    let _ = done_tx.send(Completion {
                        key: task_key,
                        generation: task_generation,
                    });
                });
                in_flight.insert(key, InFlight { handle, generation });
            }
        }

        info!("index listener draining {} in-flight batches", in_flight.len());
        for (_, task) in in_flight {
            let _ = task.handle.await;
        }
        Ok(())
    }
}

fn reap(in_flight: &mut HashMap<String, InFlight>, done: Completion) {
    // A completion for a superseded generation must not remove the task
    // chained on top of it.
    if in_flight
        .get(&done.key)
        .is_some_and(|task| task.generation == done.generation)
    {
        in_flight.remove(&done.key);
    }
}

/// Group messages by logical key without fully validating them; unparseable
/// bodies share a bucket and fail dispatch together, staying on the queue.
fn logical_key_of(body: &str) -> String {
    StoreDataDetails::from_json(body)
        .map(|details| details.logical_key())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;

    struct NullIndexer;

    #[async_trait]
    impl Indexer for NullIndexer {
        async fn index(&self, _items: Vec<StoreDataDetails>) -> Result<()> {
            Ok(())
        }
    }

    fn details(base_path: &str, type_name: Option<&str>) -> StoreDataDetails {
        let mut metadata = Metadata::new();
        if let Some(type_name) = type_name {
            metadata.set(crate::metadata::keys::TYPE, type_name);
        }
        StoreDataDetails {
            container: "c".to_string(),
            base_path: base_path.to_string(),
            id: None,
            metadata,
        }
    }

    #[test]
    fn duplicate_registrations_are_rejected() {
        let mut registry = IndexerRegistry::default();
        registry
            .register_type("Order".to_string(), Arc::new(NullIndexer))
            .unwrap();
        assert!(matches!(
            registry.register_type("Order".to_string(), Arc::new(NullIndexer)),
            Err(Error::Config(_))
        ));

        registry
            .register_path("orders/".to_string(), Arc::new(NullIndexer))
            .unwrap();
        assert!(matches!(
            registry.register_path("orders/".to_string(), Arc::new(NullIndexer)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn type_match_wins_over_path_match() {
        let mut registry = IndexerRegistry::default();
        registry
            .register_type("Order".to_string(), Arc::new(NullIndexer))
            .unwrap();
        registry
            .register_path("orders/".to_string(), Arc::new(NullIndexer))
            .unwrap();

        let (route, _) = registry
            .resolve(&details("orders/1.json", Some("Order")))
            .unwrap();
        assert_eq!(route, Route::Type("Order".to_string()));
    }

    #[test]
    fn longest_path_prefix_wins() {
        let mut registry = IndexerRegistry::default();
        registry
            .register_path("orders/".to_string(), Arc::new(NullIndexer))
            .unwrap();
        registry
            .register_path("orders/archive/".to_string(), Arc::new(NullIndexer))
            .unwrap();

        let (route, _) = registry
            .resolve(&details("orders/archive/1.json", None))
            .unwrap();
        assert_eq!(route, Route::Path("orders/archive/".to_string()));
    }

    #[test]
    fn unregistered_type_falls_back_to_path() {
        let mut registry = IndexerRegistry::default();
        registry
            .register_path("orders/".to_string(), Arc::new(NullIndexer))
            .unwrap();

        let (route, _) = registry
            .resolve(&details("orders/1.json", Some("Unknown")))
            .unwrap();
        assert_eq!(route, Route::Path("orders/".to_string()));
    }

    #[test]
    fn unrouteable_events_are_dispatch_errors() {
        let registry = IndexerRegistry::default();
        assert!(matches!(
            registry.resolve(&details("orders/1.json", None)),
            Err(Error::Dispatch(_))
        ));
    }
}
