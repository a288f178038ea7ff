/// Propagation rounds under slow, failing, and instrumented storage.
///
/// `InstrumentedStore` wraps a `MemoryStore`, delays every lookup, fails
/// lookups whose query text contains a marker, and logs connection events so
/// the tests can check when a round releases its connection.
use factsync::prelude::*;
use factsync::{
    CoordinatorConfig, FactMapper, MemoryStore, Saved, Source, StorageConnection,
    StorageProvider, WatchPhase,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Open,
    Lookup(String),
    Failed(String),
    Close,
}

#[derive(Clone, Default)]
struct InstrumentedStore {
    inner: MemoryStore,
    delay: Duration,
    fail_when: Option<String>,
    events: Arc<Mutex<Vec<Event>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl InstrumentedStore {
    fn new() -> Self {
        Self::default()
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing_on(mut self, marker: &str) -> Self {
        self.fail_when = Some(marker.to_string());
        self
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

#[async_trait::async_trait]
impl StorageProvider for InstrumentedStore {
    async fn save(&self, record: &FactRecord, source: &Source) -> SyncResult<Saved> {
        self.inner.save(record, source).await
    }

    async fn open(&self) -> SyncResult<Arc<dyn StorageConnection>> {
        self.events.lock().unwrap().push(Event::Open);
        let inner = self.inner.open().await?;
        Ok(Arc::new(InstrumentedConnection {
            inner,
            store: self.clone(),
        }))
    }

    async fn load(&self, references: &[FactReference]) -> SyncResult<Vec<FactRecord>> {
        self.inner.load(references).await
    }
}

struct InstrumentedConnection {
    inner: Arc<dyn StorageConnection>,
    store: InstrumentedStore,
}

#[async_trait::async_trait]
impl StorageConnection for InstrumentedConnection {
    async fn execute_query(
        &self,
        start: &FactReference,
        query: &Query,
    ) -> SyncResult<Vec<Vec<FactReference>>> {
        let now = self.store.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.store.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.store.delay).await;
        self.store.in_flight.fetch_sub(1, Ordering::SeqCst);

        let text = query.to_string();
        if let Some(marker) = &self.store.fail_when {
            if text.contains(marker.as_str()) {
                self.store.events.lock().unwrap().push(Event::Failed(text));
                return Err(SyncError::Storage("injected failure".to_string()));
            }
        }
        self.store.events.lock().unwrap().push(Event::Lookup(text));
        self.inner.execute_query(start, query).await
    }

    async fn close(&self) {
        self.store.events.lock().unwrap().push(Event::Close);
        self.inner.close().await;
    }
}

type Log = Arc<Mutex<Vec<FactReference>>>;

fn recorder() -> (Log, impl Fn(FactReference) + Send + Sync + 'static) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    (log, move |reference| sink.lock().unwrap().push(reference))
}

fn list() -> JsonValue {
    json!({ "type": "List", "name": "Groceries" })
}

fn task(description: &str) -> JsonValue {
    json!({ "type": "Task", "description": description, "list": list() })
}

fn tasks_in_list(l: Placeholder) -> Specification {
    matching(Template::of_type("Task").with("list", l.has_type("List")))
}

fn uncompleted_tasks_in_list(l: Placeholder) -> Specification {
    tasks_in_list(l).such_that(|t| not_exists(Template::of_type("Completion").with("task", t)))
}

#[tokio::test]
async fn test_connection_released_after_nested_lookups() {
    let store = InstrumentedStore::new().with_delay(Duration::from_millis(10));
    let coordinator = Coordinator::new(Arc::new(store.clone()));
    let groceries = coordinator.fact(&list()).await.unwrap();
    coordinator
        .watch_template(&groceries, uncompleted_tasks_in_list, |_| {}, |_| {})
        .await
        .unwrap();
    coordinator
        .watch_template(&groceries, tasks_in_list, |_| {}, |_| {})
        .await
        .unwrap();
    store.clear();

    coordinator.fact(&task("Milk")).await.unwrap();

    let events = store.events();
    assert_eq!(events.first(), Some(&Event::Open));
    assert_eq!(events.last(), Some(&Event::Close));
    assert_eq!(events.iter().filter(|e| **e == Event::Open).count(), 1);
    assert_eq!(events.iter().filter(|e| **e == Event::Close).count(), 1);
    // Two affected lookups, then one added lookup per watch.
    let lookups = events
        .iter()
        .filter(|e| matches!(e, Event::Lookup(_)))
        .count();
    assert_eq!(lookups, 4);
    assert_eq!(store.inner.open_connections(), 0);
}

#[tokio::test]
async fn test_storage_failure_abandons_only_its_branch() {
    let store = InstrumentedStore::new().failing_on("N(");
    let coordinator = Coordinator::new(Arc::new(store.clone()));
    let groceries = coordinator.fact(&list()).await.unwrap();

    let (uncompleted, on_uncompleted) = recorder();
    let failing = coordinator
        .watch_template(&groceries, uncompleted_tasks_in_list, on_uncompleted, |_| {})
        .await
        .unwrap();
    // Seeding failed, but the watch is still live.
    assert_eq!(failing.phase(), WatchPhase::Live);

    let (all, on_all) = recorder();
    coordinator
        .watch_template(&groceries, tasks_in_list, on_all, |_| {})
        .await
        .unwrap();

    let milk = coordinator.fact(&task("Milk")).await.unwrap();
    assert_eq!(*all.lock().unwrap(), vec![milk]);
    assert!(uncompleted.lock().unwrap().is_empty());
    assert!(store
        .events()
        .iter()
        .any(|e| matches!(e, Event::Failed(text) if text.contains("N("))));
    assert_eq!(store.events().last(), Some(&Event::Close));
}

#[tokio::test]
async fn test_watch_stopped_mid_round_gets_nothing() {
    let store = InstrumentedStore::new().with_delay(Duration::from_millis(50));
    let coordinator = Coordinator::new(Arc::new(store.clone()));
    let groceries = coordinator.fact(&list()).await.unwrap();

    let (added, on_added) = recorder();
    let handle = coordinator
        .watch_template(&groceries, tasks_in_list, on_added, |_| {})
        .await
        .unwrap();

    let saver = coordinator.clone();
    let round = tokio::spawn(async move { saver.fact(&task("Milk")).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.stop();
    round.await.unwrap().unwrap();

    assert!(added.lock().unwrap().is_empty());
    assert_eq!(handle.phase(), WatchPhase::Stopped);
    // The lookups still ran; only their results were discarded.
    assert!(store
        .events()
        .iter()
        .any(|e| matches!(e, Event::Lookup(text) if text == r#"F.type="Task""#)));
}

#[tokio::test]
async fn test_lookup_limit_bounds_concurrency() {
    let store = InstrumentedStore::new().with_delay(Duration::from_millis(10));
    let config = CoordinatorConfig::new().max_concurrent_lookups(1);
    let coordinator = Coordinator::with_config(Arc::new(store.clone()), config);
    let groceries = coordinator.fact(&list()).await.unwrap();

    let mut logs = Vec::new();
    for _ in 0..4 {
        let (log, on_added) = recorder();
        coordinator
            .watch_template(&groceries, tasks_in_list, on_added, |_| {})
            .await
            .unwrap();
        logs.push(log);
    }

    let milk = coordinator.fact(&task("Milk")).await.unwrap();
    for log in logs {
        assert_eq!(*log.lock().unwrap(), vec![milk.clone()]);
    }
    assert_eq!(store.peak_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unrelated_fact_opens_no_connection() {
    let store = InstrumentedStore::new();
    let coordinator = Coordinator::new(Arc::new(store.clone()));
    let groceries = coordinator.fact(&list()).await.unwrap();
    coordinator
        .watch_template(&groceries, tasks_in_list, |_| {}, |_| {})
        .await
        .unwrap();
    store.clear();

    coordinator
        .fact(&json!({ "type": "Board", "title": "Kanban" }))
        .await
        .unwrap();
    assert!(store.events().is_empty());
    assert!(store.inner.contains(&FactMapper::reference_of(&json!({ "type": "Board", "title": "Kanban" })).unwrap()));
}
