/// Storage provider contract.
///
/// The coordinator never persists facts itself. It talks to a
/// [`StorageProvider`], which must:
///
/// - save records idempotently under the content-addressing rule: saving a
///   fact that is already stored is a no-op that still returns the record
/// - hand out connections that run [`Query`] instances from a start fact
/// - load full records for references
///
/// A propagation round holds one [`StorageConnection`] for all of its
/// lookups and closes it once the whole fan-out is done. Providers may hand
/// out several connections at once; rounds never share one.
///
/// [`crate::memory_store::MemoryStore`] is the in-process implementation.
use crate::coordinator::CoordinatorHandle;
use crate::error::SyncResult;
use crate::fact::{FactRecord, FactReference};
use crate::network::Source;
use crate::query::Query;
use std::sync::Arc;

/// Outcome of a save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Saved {
    /// The canonical stored record.
    pub record: FactRecord,
    /// `false` when the fact was already present.
    pub inserted: bool,
}

/// Persistence backend consumed by the coordinator.
#[async_trait::async_trait]
pub trait StorageProvider: Send + Sync {
    /// One-time wiring, invoked when the coordinator is built.
    fn init(&self, _coordinator: CoordinatorHandle) {}

    /// Persist a fact.
    async fn save(&self, record: &FactRecord, source: &Source) -> SyncResult<Saved>;

    /// Acquire a connection for query execution.
    ///
    /// The caller releases it with [`StorageConnection::close`].
    async fn open(&self) -> SyncResult<Arc<dyn StorageConnection>>;

    /// Hydrate references into full records.
    ///
    /// Missing references fail with [`crate::SyncError::FactNotFound`].
    async fn load(&self, references: &[FactReference]) -> SyncResult<Vec<FactRecord>>;
}

/// A scoped connection used by one propagation round or one query.
#[async_trait::async_trait]
pub trait StorageConnection: Send + Sync {
    /// Run `query` from `start`.
    ///
    /// Each result is a path of references beginning with `start`; the last
    /// element is the match. An empty query yields the single path `[start]`.
    async fn execute_query(
        &self,
        start: &FactReference,
        query: &Query,
    ) -> SyncResult<Vec<Vec<FactReference>>>;

    /// Release the connection.
    async fn close(&self) {}
}

/// Distinct terminal references of a set of result paths, in discovery order.
pub fn terminals(paths: &[Vec<FactReference>]) -> Vec<FactReference> {
    let mut seen = std::collections::HashSet::new();
    paths
        .iter()
        .filter_map(|path| path.last())
        .filter(|reference| seen.insert((*reference).clone()))
        .cloned()
        .collect()
}
