/// Network provider contract and an in-process loopback transport.
///
/// A [`NetworkProvider`] connects a coordinator to its peers. The coordinator
/// uses it in two directions:
///
/// - outbound: locally created facts are pushed with
///   [`NetworkProvider::fact`], and watches are mirrored with
///   [`NetworkProvider::watch`] so the peer sends matching facts back
/// - inbound: the provider delivers peer facts through the
///   [`CoordinatorHandle`] it received in [`NetworkProvider::init`], tagged
///   with [`Source::Peer`] so they are never echoed back
///
/// Wire formats and authentication belong to concrete transports. The
/// [`LoopbackNetwork`] pair links two coordinators in the same process and
/// is what the integration tests use.
use crate::coordinator::CoordinatorHandle;
use crate::error::{SyncError, SyncResult};
use crate::fact::{FactRecord, FactReference};
use crate::query::Query;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// Unique identifier for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generate a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a node ID from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// Where a saved fact came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    /// Created by this process through `Coordinator::fact`.
    Local,
    /// Delivered by a network provider on behalf of a peer.
    Peer(NodeId),
}

impl Source {
    /// Whether the fact originated locally.
    pub fn is_local(&self) -> bool {
        matches!(self, Source::Local)
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Local => write!(f, "local"),
            Source::Peer(node) => write!(f, "peer {}", node),
        }
    }
}

/// Transport to peers, consumed by the coordinator.
#[async_trait::async_trait]
pub trait NetworkProvider: Send + Sync {
    /// One-time wiring, invoked when the provider is attached.
    fn init(&self, coordinator: CoordinatorHandle);

    /// Ask the peer to send facts matching `query` from `start`.
    async fn watch(&self, start: &FactReference, query: &Query) -> SyncResult<()>;

    /// Push a locally created fact to the peer.
    async fn fact(&self, record: &FactRecord) -> SyncResult<()>;
}

struct LoopbackLink {
    nodes: [NodeId; 2],
    handles: [OnceLock<CoordinatorHandle>; 2],
}

/// One end of an in-process link between two coordinators.
#[derive(Clone)]
pub struct LoopbackNetwork {
    side: usize,
    link: Arc<LoopbackLink>,
}

impl LoopbackNetwork {
    /// Create two connected endpoints.
    pub fn pair() -> (Self, Self) {
        let link = Arc::new(LoopbackLink {
            nodes: [NodeId::new(), NodeId::new()],
            handles: [OnceLock::new(), OnceLock::new()],
        });
        (
            Self {
                side: 0,
                link: Arc::clone(&link),
            },
            Self { side: 1, link },
        )
    }

    /// The node this endpoint speaks for.
    pub fn node_id(&self) -> NodeId {
        self.link.nodes[self.side]
    }

    /// The node on the other end.
    pub fn peer_id(&self) -> NodeId {
        self.link.nodes[1 - self.side]
    }

    fn local(&self) -> SyncResult<&CoordinatorHandle> {
        self.link.handles[self.side]
            .get()
            .ok_or_else(|| SyncError::Network("loopback endpoint not attached".to_string()))
    }

    fn peer(&self) -> SyncResult<&CoordinatorHandle> {
        self.link.handles[1 - self.side]
            .get()
            .ok_or_else(|| SyncError::Network(format!("peer {} not attached", self.peer_id())))
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNetwork")
            .field("node", &self.node_id())
            .field("peer", &self.peer_id())
            .finish()
    }
}

#[async_trait::async_trait]
impl NetworkProvider for LoopbackNetwork {
    fn init(&self, coordinator: CoordinatorHandle) {
        if self.link.handles[self.side].set(coordinator).is_err() {
            tracing::debug!(node = %self.node_id(), "loopback endpoint already attached");
        }
    }

    async fn watch(&self, start: &FactReference, query: &Query) -> SyncResult<()> {
        let local = self.local()?;
        let peer = self.peer()?;
        let records = peer.closure(start, query).await?;
        tracing::debug!(
            node = %self.node_id(),
            count = records.len(),
            query = %query,
            "peer answered mirrored watch"
        );
        for record in records {
            local.receive(record, Source::Peer(self.peer_id())).await?;
        }
        Ok(())
    }

    async fn fact(&self, record: &FactRecord) -> SyncResult<()> {
        self.peer()?
            .receive(record.clone(), Source::Peer(self.node_id()))
            .await?;
        Ok(())
    }
}
