/// In-memory storage provider.
///
/// Facts live in a `DashMap` keyed by reference, next to a successor index
/// keyed by `(predecessor, role)`. The index is what makes `S.<role>` steps
/// cheap: a successor traversal is a single map lookup instead of a scan.
///
/// The store is cheap to clone; clones share the same data, so a test can
/// keep one handle for inspection while the coordinator owns another.
use crate::error::{SyncError, SyncResult};
use crate::fact::{FactRecord, FactReference};
use crate::network::Source;
use crate::query::{Query, Step};
use crate::storage::{Saved, StorageConnection, StorageProvider};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

type Path = Vec<FactReference>;

#[derive(Default)]
struct StoreState {
    facts: DashMap<FactReference, FactRecord>,
    successors: DashMap<(FactReference, String), Vec<FactReference>>,
    open_connections: AtomicUsize,
    connections_opened: AtomicUsize,
}

impl StoreState {
    fn successors_of(&self, reference: &FactReference, role: &str) -> Vec<FactReference> {
        self.successors
            .get(&(reference.clone(), role.to_string()))
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn record(&self, reference: &FactReference) -> SyncResult<FactRecord> {
        self.facts
            .get(reference)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SyncError::FactNotFound {
                reference: reference.clone(),
            })
    }

    fn evaluate(&self, mut paths: Vec<Path>, steps: &[Step]) -> SyncResult<Vec<Path>> {
        for step in steps {
            if paths.is_empty() {
                break;
            }
            paths = match step {
                Step::Field(fact_type) => paths
                    .into_iter()
                    .filter(|path| path.last().is_some_and(|r| r.fact_type == *fact_type))
                    .collect(),
                Step::Successor(role) => {
                    let mut next = Vec::new();
                    for path in paths {
                        let Some(current) = path.last() else { continue };
                        for successor in self.successors_of(current, role) {
                            let mut extended = path.clone();
                            extended.push(successor);
                            next.push(extended);
                        }
                    }
                    next
                }
                Step::Predecessor(role) => {
                    let mut next = Vec::new();
                    for path in paths {
                        let Some(current) = path.last() else { continue };
                        let record = self.record(current)?;
                        for predecessor in record.predecessors_in(role) {
                            let mut extended = path.clone();
                            extended.push(predecessor.clone());
                            next.push(extended);
                        }
                    }
                    next
                }
                Step::Existential { quantifier, steps } => {
                    let mut kept = Vec::new();
                    for path in paths {
                        let Some(current) = path.last() else { continue };
                        let found = self.evaluate(vec![vec![current.clone()]], steps)?;
                        if quantifier.accepts(!found.is_empty()) {
                            kept.push(path);
                        }
                    }
                    kept
                }
            };
        }
        Ok(paths)
    }
}

/// `DashMap`-backed [`StorageProvider`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<StoreState>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored facts.
    pub fn len(&self) -> usize {
        self.state.facts.len()
    }

    /// Whether the store holds no facts.
    pub fn is_empty(&self) -> bool {
        self.state.facts.is_empty()
    }

    /// Whether `reference` is stored.
    pub fn contains(&self, reference: &FactReference) -> bool {
        self.state.facts.contains_key(reference)
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.state.open_connections.load(Ordering::SeqCst)
    }

    /// Connections opened over the store's lifetime.
    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    /// Run a query directly, without opening a connection.
    pub fn evaluate(&self, start: &FactReference, query: &Query) -> SyncResult<Vec<Path>> {
        self.state.evaluate(vec![vec![start.clone()]], query.steps())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("facts", &self.len())
            .field("open_connections", &self.open_connections())
            .finish()
    }
}

#[async_trait::async_trait]
impl StorageProvider for MemoryStore {
    async fn save(&self, record: &FactRecord, source: &Source) -> SyncResult<Saved> {
        let reference = record.reference();
        match self.state.facts.entry(reference.clone()) {
            Entry::Occupied(existing) => Ok(Saved {
                record: existing.get().clone(),
                inserted: false,
            }),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                for (role, list) in &record.predecessors {
                    for predecessor in list.iter() {
                        self.state
                            .successors
                            .entry((predecessor.clone(), role.clone()))
                            .or_default()
                            .push(reference.clone());
                    }
                }
                tracing::trace!(fact = %reference.short(), ?source, "stored fact");
                Ok(Saved {
                    record: record.clone(),
                    inserted: true,
                })
            }
        }
    }

    async fn open(&self) -> SyncResult<Arc<dyn StorageConnection>> {
        self.state.open_connections.fetch_add(1, Ordering::SeqCst);
        self.state.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }

    async fn load(&self, references: &[FactReference]) -> SyncResult<Vec<FactRecord>> {
        references
            .iter()
            .map(|reference| self.state.record(reference))
            .collect()
    }
}

struct MemoryConnection {
    state: Arc<StoreState>,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl StorageConnection for MemoryConnection {
    async fn execute_query(&self, start: &FactReference, query: &Query) -> SyncResult<Vec<Path>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("connection already closed".to_string()));
        }
        self.state.evaluate(vec![vec![start.clone()]], query.steps())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
