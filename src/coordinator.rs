/// The coordinator: watches, fact saves, and incremental propagation.
///
/// A [`Coordinator`] owns the set of active watches. Every watch pairs a
/// start fact and a compiled query with added/removed callbacks, plus the
/// inverses derived from the query when the watch was registered.
///
/// When a fact is saved for the first time, the coordinator runs a
/// propagation round:
///
/// 1. open one storage connection for the whole round
/// 2. for every watch, for every inverse whose trigger type matches the new
///    fact, run the `affected` query from the new fact
/// 3. if the watch's start is among the affected facts, run the `added` and
///    `removed` queries from the new fact and deliver their results
/// 4. once every lookup, including the ones started by step 3, has finished,
///    close the connection
///
/// Lookups run concurrently on a [`TaskQueue`]. A failing lookup is logged
/// and its branch is dropped; the rest of the round carries on.
///
/// # Watch lifecycle
///
/// `Registered -> Seeding -> Live -> Stopped`. Stopping is terminal and is
/// checked right before every callback, so a watch stopped mid-round hears
/// nothing more from that round even though its lookups still run.
use crate::error::{SyncError, SyncResult};
use crate::fact::{FactRecord, FactReference};
use crate::inverter::{Inverse, invert};
use crate::mapper::FactMapper;
use crate::memory_store::MemoryStore;
use crate::network::{NetworkProvider, Source};
use crate::parser::{Placeholder, Preposition, Specification};
use crate::query::Query;
use crate::storage::{StorageConnection, StorageProvider, terminals};
use crate::tasks::TaskQueue;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{RwLock, Semaphore, mpsc};

/// Default number of local facts kept while no network is attached.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

/// Configuration for a coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Forward new watches to the network provider (default: true).
    pub mirror_watches: bool,
    /// Push locally created facts to the network provider (default: true).
    pub relay_local_facts: bool,
    /// Upper bound on concurrently running lookups in one round (default: unbounded).
    pub max_concurrent_lookups: Option<usize>,
    /// Local facts retained while no network is attached (default: 1024).
    pub outbox_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            mirror_watches: true,
            relay_local_facts: true,
            max_concurrent_lookups: None,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

impl CoordinatorConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable watch mirroring.
    pub fn mirror_watches(mut self, enabled: bool) -> Self {
        self.mirror_watches = enabled;
        self
    }

    /// Enable or disable relaying local facts.
    pub fn relay_local_facts(mut self, enabled: bool) -> Self {
        self.relay_local_facts = enabled;
        self
    }

    /// Bound the number of concurrent lookups per round.
    pub fn max_concurrent_lookups(mut self, limit: usize) -> Self {
        self.max_concurrent_lookups = Some(limit.max(1));
        self
    }

    /// Set the outbox capacity.
    pub fn outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }
}

/// Unique identifier for a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchId(pub u64);

impl std::fmt::Display for WatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "watch-{}", self.0)
    }
}

/// Lifecycle phase of a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WatchPhase {
    /// Inverted and added to the watch set.
    Registered = 0,
    /// Initial query running.
    Seeding = 1,
    /// Receiving incremental updates.
    Live = 2,
    /// Removed; no further callbacks.
    Stopped = 3,
}

impl WatchPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WatchPhase::Registered,
            1 => WatchPhase::Seeding,
            2 => WatchPhase::Live,
            _ => WatchPhase::Stopped,
        }
    }
}

/// A change to a watch's result set, for channel delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A fact entered the result set.
    Added(FactReference),
    /// A fact left the result set.
    Removed(FactReference),
}

/// Information about an active watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchInfo {
    /// The watch ID.
    pub id: WatchId,
    /// The fact the query starts from.
    pub start: FactReference,
    /// Canonical query text.
    pub query: String,
    /// Number of inverses derived from the query.
    pub inverses: usize,
    /// Size of the current result set.
    pub results: usize,
    /// Current phase.
    pub phase: WatchPhase,
    /// When the watch was registered.
    pub created_at: DateTime<Utc>,
    /// Number of added callbacks delivered.
    pub added_delivered: u64,
    /// Number of removed callbacks delivered.
    pub removed_delivered: u64,
}

type FactCallback = Box<dyn Fn(FactReference) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
enum Delta {
    Added,
    Removed,
}

struct WatchState {
    id: WatchId,
    start: FactReference,
    query: Query,
    inverses: Vec<Arc<Inverse>>,
    on_added: FactCallback,
    on_removed: FactCallback,
    phase: AtomicU8,
    /// Results delivered as added and not since removed.
    results: DashSet<FactReference>,
    created_at: DateTime<Utc>,
    added_delivered: AtomicU64,
    removed_delivered: AtomicU64,
}

impl WatchState {
    fn phase(&self) -> WatchPhase {
        WatchPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn is_stopped(&self) -> bool {
        self.phase() == WatchPhase::Stopped
    }

    /// Move to `phase` unless already stopped.
    fn advance(&self, phase: WatchPhase) {
        let _ = self
            .phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != WatchPhase::Stopped as u8).then_some(phase as u8)
            });
    }

    fn stop(&self) {
        self.phase.store(WatchPhase::Stopped as u8, Ordering::Release);
    }

    fn deliver(&self, delta: Delta, reference: FactReference) {
        if self.is_stopped() {
            tracing::trace!(watch = %self.id, fact = %reference.short(), "discarding result for stopped watch");
            return;
        }
        match delta {
            Delta::Added => {
                if !self.results.insert(reference.clone()) {
                    tracing::trace!(watch = %self.id, fact = %reference.short(), "already in results");
                    return;
                }
                (self.on_added)(reference);
                self.added_delivered.fetch_add(1, Ordering::Relaxed);
            }
            Delta::Removed => {
                if self.results.remove(&reference).is_none() {
                    tracing::trace!(watch = %self.id, fact = %reference.short(), "not in results");
                    return;
                }
                (self.on_removed)(reference);
                self.removed_delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn info(&self) -> WatchInfo {
        WatchInfo {
            id: self.id,
            start: self.start.clone(),
            query: self.query.to_string(),
            inverses: self.inverses.len(),
            results: self.results.len(),
            phase: self.phase(),
            created_at: self.created_at,
            added_delivered: self.added_delivered.load(Ordering::Relaxed),
            removed_delivered: self.removed_delivered.load(Ordering::Relaxed),
        }
    }
}

struct CoordinatorInner {
    storage: Arc<dyn StorageProvider>,
    network: RwLock<Option<Arc<dyn NetworkProvider>>>,
    watches: DashMap<WatchId, Arc<WatchState>>,
    next_watch_id: AtomicU64,
    outbox: Mutex<VecDeque<FactRecord>>,
    lookup_limit: Option<Arc<Semaphore>>,
    config: CoordinatorConfig,
}

/// Orchestrates storage, watches, and the network provider.
///
/// Cloning is cheap; clones share the same watch set. Independent
/// coordinators share nothing.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

/// Weak reference to a coordinator, handed to providers in `init`.
#[derive(Clone)]
pub struct CoordinatorHandle {
    inner: Weak<CoordinatorInner>,
}

/// Opaque handle to a registered watch.
#[derive(Clone)]
pub struct WatchHandle {
    id: WatchId,
    inner: Weak<CoordinatorInner>,
}

impl Coordinator {
    /// Create a coordinator with default configuration.
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self::with_config(storage, CoordinatorConfig::default())
    }

    /// Create a coordinator backed by a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Create a coordinator with custom configuration.
    pub fn with_config(storage: Arc<dyn StorageProvider>, config: CoordinatorConfig) -> Self {
        let lookup_limit = config
            .max_concurrent_lookups
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let coordinator = Self {
            inner: Arc::new(CoordinatorInner {
                storage,
                network: RwLock::new(None),
                watches: DashMap::new(),
                next_watch_id: AtomicU64::new(1),
                outbox: Mutex::new(VecDeque::new()),
                lookup_limit,
                config,
            }),
        };
        coordinator.inner.storage.init(coordinator.handle());
        coordinator
    }

    /// A weak handle for providers.
    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The configuration this coordinator was built with.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Save a local fact and everything it references.
    ///
    /// Returns the reference of the document's root fact. Newly stored facts
    /// are propagated to matching watches before this returns, then relayed
    /// to the network provider.
    pub async fn fact(&self, value: &JsonValue) -> SyncResult<FactReference> {
        let records = FactMapper::dehydrate(value)?;
        let root = records
            .last()
            .map(FactRecord::reference)
            .ok_or_else(|| SyncError::invalid_fact("document produced no records"))?;
        let inserted = self.inner.save_all(&records, Source::Local).await?;
        if inserted > 0 {
            self.inner.relay(&records).await;
        }
        Ok(root)
    }

    /// Register a watch on `start`.
    ///
    /// Seeds the result set through `on_added`, then keeps it current. Each
    /// watch tracks its results, so `on_added` fires only for facts not
    /// already in the set and `on_removed` only for facts that are. A
    /// storage failure while seeding is logged and the watch stays live; a
    /// failing remote registration is logged and ignored.
    pub async fn watch<A, R>(
        &self,
        start: &FactReference,
        preposition: &Preposition,
        on_added: A,
        on_removed: R,
    ) -> SyncResult<WatchHandle>
    where
        A: Fn(FactReference) + Send + Sync + 'static,
        R: Fn(FactReference) + Send + Sync + 'static,
    {
        let query = preposition.query().clone();
        let inverses: Vec<Arc<Inverse>> = invert(&query).into_iter().map(Arc::new).collect();
        let id = WatchId(self.inner.next_watch_id.fetch_add(1, Ordering::SeqCst));
        let state = Arc::new(WatchState {
            id,
            start: start.clone(),
            query,
            inverses,
            on_added: Box::new(on_added),
            on_removed: Box::new(on_removed),
            phase: AtomicU8::new(WatchPhase::Registered as u8),
            results: DashSet::new(),
            created_at: Utc::now(),
            added_delivered: AtomicU64::new(0),
            removed_delivered: AtomicU64::new(0),
        });
        self.inner.watches.insert(id, Arc::clone(&state));
        tracing::debug!(
            watch = %id,
            start = %start.short(),
            query = %state.query,
            inverses = state.inverses.len(),
            "registered watch"
        );

        state.advance(WatchPhase::Seeding);
        self.inner.seed(&state).await;
        state.advance(WatchPhase::Live);

        if self.inner.config.mirror_watches {
            self.inner.mirror(&state).await;
        }

        Ok(WatchHandle {
            id,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Compile a template and watch it.
    pub async fn watch_template<T, A, R>(
        &self,
        start: &FactReference,
        template: T,
        on_added: A,
        on_removed: R,
    ) -> SyncResult<WatchHandle>
    where
        T: FnOnce(Placeholder) -> Specification,
        A: Fn(FactReference) + Send + Sync + 'static,
        R: Fn(FactReference) + Send + Sync + 'static,
    {
        let preposition = Preposition::for_template(template)?;
        self.watch(start, &preposition, on_added, on_removed).await
    }

    /// Watch `start`, receiving changes on a channel instead of callbacks.
    pub async fn watch_channel(
        &self,
        start: &FactReference,
        preposition: &Preposition,
    ) -> SyncResult<(WatchHandle, mpsc::UnboundedReceiver<WatchEvent>)> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let removed = sender.clone();
        let handle = self
            .watch(
                start,
                preposition,
                move |reference| {
                    let _ = sender.send(WatchEvent::Added(reference));
                },
                move |reference| {
                    let _ = removed.send(WatchEvent::Removed(reference));
                },
            )
            .await?;
        Ok((handle, receiver))
    }

    /// Stop a watch. Stopping twice is a no-op.
    pub fn remove_watch(&self, handle: &WatchHandle) {
        self.inner.remove_watch(handle.id);
    }

    /// Information about every active watch, ordered by ID.
    pub fn watches(&self) -> Vec<WatchInfo> {
        let mut infos: Vec<WatchInfo> = self
            .inner
            .watches
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Number of active watches.
    pub fn watch_count(&self) -> usize {
        self.inner.watches.len()
    }

    /// Run a compiled query once, returning distinct matches in discovery order.
    pub async fn query(
        &self,
        start: &FactReference,
        preposition: &Preposition,
    ) -> SyncResult<Vec<FactReference>> {
        self.inner.run_query(start, preposition.query()).await
    }

    /// Load full records.
    pub async fn load(&self, references: &[FactReference]) -> SyncResult<Vec<FactRecord>> {
        self.inner.storage.load(references).await
    }

    /// Rebuild the nested JSON document for `reference`.
    pub async fn hydrate(&self, reference: &FactReference) -> SyncResult<JsonValue> {
        let records = self.inner.load_closure(std::slice::from_ref(reference)).await?;
        FactMapper::hydrate(&records, reference)
    }

    /// Attach a network provider.
    ///
    /// Flushes facts created while no provider was attached, then mirrors
    /// every live watch when mirroring is enabled.
    pub async fn sync(&self, network: Arc<dyn NetworkProvider>) {
        network.init(self.handle());
        *self.inner.network.write().await = Some(Arc::clone(&network));
        tracing::info!(watches = self.watch_count(), "network provider attached");

        let pending: Vec<FactRecord> = self.inner.outbox().drain(..).collect();
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "flushing outbox");
        }
        for record in &pending {
            if let Err(error) = network.fact(record).await {
                tracing::warn!(fact = %record.reference().short(), %error, "failed to relay fact");
            }
        }

        if self.inner.config.mirror_watches {
            let live: Vec<Arc<WatchState>> = self
                .inner
                .watches
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .filter(|state| !state.is_stopped())
                .collect();
            futures::future::join_all(live.iter().map(|state| self.inner.mirror(state))).await;
        }
    }

    /// Local facts waiting for a network provider.
    pub fn outbox_len(&self) -> usize {
        self.inner.outbox().len()
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("watches", &self.watch_count())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl CoordinatorHandle {
    /// The coordinator, if it is still alive.
    pub fn upgrade(&self) -> Option<Coordinator> {
        self.inner.upgrade().map(|inner| Coordinator { inner })
    }

    fn live(&self) -> SyncResult<Arc<CoordinatorInner>> {
        self.inner
            .upgrade()
            .ok_or_else(|| SyncError::Network("coordinator has been dropped".to_string()))
    }

    /// Deliver a fact from a provider.
    ///
    /// The record's hash is verified before saving. Returns whether the fact
    /// was new. Facts from peers are never relayed back to the network.
    pub async fn receive(&self, record: FactRecord, source: Source) -> SyncResult<bool> {
        let inner = self.live()?;
        if !record.verify()? {
            return Err(SyncError::invalid_fact(format!(
                "hash mismatch for {} from {}",
                record.reference().short(),
                source
            )));
        }
        let records = [record];
        let inserted = inner.save_all(&records, source).await? > 0;
        if inserted && source.is_local() {
            inner.relay(&records).await;
        }
        Ok(inserted)
    }

    /// Facts matching `query` from `start`, with their predecessors.
    ///
    /// Records are ordered predecessors first. This is what a provider sends
    /// a peer that mirrors a watch.
    pub async fn closure(&self, start: &FactReference, query: &Query) -> SyncResult<Vec<FactRecord>> {
        let inner = self.live()?;
        let matches = inner.run_query(start, query).await?;
        let records = inner.load_closure(&matches).await?;
        Ok(topological(&records, &matches))
    }
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl WatchHandle {
    /// The watch ID.
    pub fn id(&self) -> WatchId {
        self.id
    }

    /// Current phase; `Stopped` once removed or once the coordinator is gone.
    pub fn phase(&self) -> WatchPhase {
        let Some(inner) = self.inner.upgrade() else {
            return WatchPhase::Stopped;
        };
        let phase = inner.watches.get(&self.id).map(|state| state.phase());
        phase.unwrap_or(WatchPhase::Stopped)
    }

    /// Stop the watch. Stopping twice is a no-op.
    pub fn stop(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_watch(self.id);
        }
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").field("id", &self.id).finish()
    }
}

impl CoordinatorInner {
    fn outbox(&self) -> std::sync::MutexGuard<'_, VecDeque<FactRecord>> {
        self.outbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove_watch(&self, id: WatchId) {
        if let Some((_, state)) = self.watches.remove(&id) {
            state.stop();
            tracing::debug!(watch = %id, "stopped watch");
        }
    }

    /// Save records in order, propagating each new one. Returns how many were new.
    async fn save_all(&self, records: &[FactRecord], source: Source) -> SyncResult<usize> {
        let mut inserted = 0;
        for record in records {
            let saved = self.storage.save(record, &source).await?;
            if saved.inserted {
                inserted += 1;
                let reference = saved.record.reference();
                tracing::debug!(fact = %reference.short(), %source, "saved fact");
                self.propagate(&reference).await;
            }
        }
        Ok(inserted)
    }

    async fn relay(&self, records: &[FactRecord]) {
        if !self.config.relay_local_facts {
            return;
        }
        let network = self.network.read().await.clone();
        match network {
            Some(network) => {
                for record in records {
                    if let Err(error) = network.fact(record).await {
                        tracing::warn!(fact = %record.reference().short(), %error, "failed to relay fact");
                    }
                }
            }
            None => {
                let mut outbox = self.outbox();
                for record in records {
                    if self.config.outbox_capacity == 0 {
                        break;
                    }
                    if outbox.len() >= self.config.outbox_capacity {
                        if let Some(dropped) = outbox.pop_front() {
                            tracing::warn!(fact = %dropped.reference().short(), "outbox full, dropping oldest fact");
                        }
                    }
                    outbox.push_back(record.clone());
                }
            }
        }
    }

    async fn mirror(&self, state: &WatchState) {
        let network = self.network.read().await.clone();
        let Some(network) = network else { return };
        if let Err(error) = network.watch(&state.start, &state.query).await {
            tracing::warn!(watch = %state.id, %error, "remote watch registration failed");
        }
    }

    async fn seed(&self, state: &WatchState) {
        let connection = match self.storage.open().await {
            Ok(connection) => connection,
            Err(error) => {
                tracing::warn!(watch = %state.id, %error, "could not open storage to seed watch");
                return;
            }
        };
        match connection.execute_query(&state.start, &state.query).await {
            Ok(paths) => {
                let results = terminals(&paths);
                tracing::debug!(watch = %state.id, results = results.len(), "seeded watch");
                for reference in results {
                    state.deliver(Delta::Added, reference);
                }
            }
            Err(error) => {
                tracing::warn!(watch = %state.id, %error, "seeding query failed");
            }
        }
        connection.close().await;
    }

    async fn run_query(&self, start: &FactReference, query: &Query) -> SyncResult<Vec<FactReference>> {
        let connection = self.storage.open().await?;
        let result = connection.execute_query(start, query).await;
        connection.close().await;
        Ok(terminals(&result?))
    }

    /// Load `roots` and every fact they transitively reference.
    async fn load_closure(
        &self,
        roots: &[FactReference],
    ) -> SyncResult<HashMap<FactReference, FactRecord>> {
        let mut records = HashMap::new();
        let mut frontier: Vec<FactReference> = roots.to_vec();
        while !frontier.is_empty() {
            let loaded = self.storage.load(&frontier).await?;
            let mut next = HashSet::new();
            for record in loaded {
                for list in record.predecessors.values() {
                    for predecessor in list.iter() {
                        if !records.contains_key(predecessor) {
                            next.insert(predecessor.clone());
                        }
                    }
                }
                records.insert(record.reference(), record);
            }
            frontier = next
                .into_iter()
                .filter(|reference| !records.contains_key(reference))
                .collect();
        }
        Ok(records)
    }

    /// Run one propagation round for a newly stored fact.
    async fn propagate(&self, fact: &FactReference) {
        let triggered: Vec<(Arc<WatchState>, Arc<Inverse>)> = self
            .watches
            .iter()
            .filter(|entry| !entry.value().is_stopped())
            .flat_map(|entry| {
                let state = Arc::clone(entry.value());
                state
                    .inverses
                    .iter()
                    .filter(|inverse| inverse.applies_to(&fact.fact_type))
                    .map(|inverse| (Arc::clone(&state), Arc::clone(inverse)))
                    .collect::<Vec<_>>()
            })
            .collect();
        if triggered.is_empty() {
            return;
        }

        let connection = match self.storage.open().await {
            Ok(connection) => connection,
            Err(error) => {
                tracing::warn!(fact = %fact.short(), %error, "could not open storage for propagation");
                return;
            }
        };
        let round = Round {
            connection: Arc::clone(&connection),
            tasks: TaskQueue::new(),
            limit: self.lookup_limit.clone(),
        };
        tracing::trace!(fact = %fact.short(), inverses = triggered.len(), "propagating");
        for (state, inverse) in triggered {
            round
                .tasks
                .push(check_affected(round.clone(), state, inverse, fact.clone()));
        }
        round.tasks.finished().await;
        connection.close().await;
    }
}

/// Resources shared by the lookups of one propagation round.
#[derive(Clone)]
struct Round {
    connection: Arc<dyn StorageConnection>,
    tasks: TaskQueue,
    limit: Option<Arc<Semaphore>>,
}

impl Round {
    async fn lookup(&self, start: &FactReference, query: &Query) -> SyncResult<Vec<Vec<FactReference>>> {
        let _permit = match &self.limit {
            Some(limit) => Some(
                Arc::clone(limit)
                    .acquire_owned()
                    .await
                    .map_err(|_| SyncError::Storage("lookup limiter closed".to_string()))?,
            ),
            None => None,
        };
        tracing::trace!(start = %start.short(), query = %query, "lookup");
        self.connection.execute_query(start, query).await
    }
}

async fn check_affected(round: Round, state: Arc<WatchState>, inverse: Arc<Inverse>, fact: FactReference) {
    if state.is_stopped() {
        return;
    }
    let paths = match round.lookup(&fact, &inverse.affected).await {
        Ok(paths) => paths,
        Err(error) => {
            tracing::warn!(watch = %state.id, fact = %fact.short(), %error, "affected lookup failed, abandoning branch");
            return;
        }
    };
    if !terminals(&paths).contains(&state.start) {
        return;
    }
    if inverse.added.is_some() {
        round.tasks.push(deliver(
            round.clone(),
            Arc::clone(&state),
            Arc::clone(&inverse),
            fact.clone(),
            Delta::Added,
        ));
    }
    if inverse.removed.is_some() {
        round
            .tasks
            .push(deliver(round.clone(), state, inverse, fact, Delta::Removed));
    }
}

async fn deliver(round: Round, state: Arc<WatchState>, inverse: Arc<Inverse>, fact: FactReference, delta: Delta) {
    let query = match delta {
        Delta::Added => inverse.added.as_ref(),
        Delta::Removed => inverse.removed.as_ref(),
    };
    let Some(query) = query else { return };
    match round.lookup(&fact, query).await {
        Ok(paths) => {
            for reference in terminals(&paths) {
                state.deliver(delta, reference);
            }
        }
        Err(error) => {
            tracing::warn!(watch = %state.id, fact = %fact.short(), ?delta, %error, "result lookup failed, abandoning branch");
        }
    }
}

/// Order `records` so every record follows its predecessors, starting from `roots`.
fn topological(
    records: &HashMap<FactReference, FactRecord>,
    roots: &[FactReference],
) -> Vec<FactRecord> {
    let mut ordered = Vec::new();
    let mut visited = HashSet::new();
    for root in roots {
        let mut stack = vec![(root.clone(), false)];
        while let Some((reference, expanded)) = stack.pop() {
            let Some(record) = records.get(&reference) else { continue };
            if expanded {
                ordered.push(record.clone());
                continue;
            }
            if !visited.insert(reference.clone()) {
                continue;
            }
            stack.push((reference, true));
            for list in record.predecessors.values() {
                for predecessor in list.iter() {
                    if !visited.contains(predecessor) {
                        stack.push((predecessor.clone(), false));
                    }
                }
            }
        }
    }
    ordered
}
