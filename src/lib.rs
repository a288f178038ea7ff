//! # factsync: live queries over immutable facts
//!
//! factsync keeps query results current over a graph of immutable,
//! content-addressed facts. Applications save facts, register watches, and
//! receive added/removed notifications as new facts arrive, locally or from
//! a peer, without re-running whole queries.
//!
//! ## Quick Start
//!
//! ```ignore
//! use factsync::prelude::*;
//!
//! fn tasks_in_list(l: Placeholder) -> Specification {
//!     matching(Template::of_type("Task").with("list", l.has_type("List")))
//!         .such_that(|t| not_exists(Template::of_type("Completion").with("task", t)))
//! }
//!
//! #[tokio::main]
//! async fn main() -> SyncResult<()> {
//!     let coordinator = Coordinator::in_memory();
//!     let list = coordinator.fact(&json!({ "type": "List", "name": "Groceries" })).await?;
//!
//!     let handle = coordinator
//!         .watch_template(
//!             &list,
//!             tasks_in_list,
//!             |task| println!("added {}", task.short()),
//!             |task| println!("removed {}", task.short()),
//!         )
//!         .await?;
//!
//!     coordinator
//!         .fact(&json!({ "type": "Task", "description": "Milk",
//!                        "list": { "type": "List", "name": "Groceries" } }))
//!         .await?;
//!
//!     handle.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Facts** (`fact`, `mapper`) - records and references, JSON boundary
//! - **Queries** (`query`, `parser`) - step sequences and the template builder
//! - **Inversion** (`inverter`) - per-query rules for incremental updates
//! - **Coordination** (`coordinator`, `tasks`) - watches and propagation rounds
//! - **Providers** (`storage`, `memory_store`, `network`) - pluggable I/O
//!
//! ## Thread Safety
//!
//! A `Coordinator` is cheap to clone and safe to share across tasks. Each
//! instance owns its own watch set; nothing is process-global.

pub mod coordinator;
mod error;
pub mod fact;
pub mod inverter;
pub mod mapper;
pub mod memory_store;
pub mod network;
pub mod parser;
pub mod query;
pub mod storage;
pub mod tasks;

// Public API exports
pub use coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorHandle, WatchEvent, WatchHandle, WatchId,
    WatchInfo, WatchPhase,
};
pub use error::{SyncError, SyncResult};
pub use fact::{FactRecord, FactReference, PredecessorList};
pub use inverter::{Inverse, invert};
pub use mapper::FactMapper;
pub use memory_store::MemoryStore;
pub use network::{LoopbackNetwork, NetworkProvider, NodeId, Source};
pub use parser::{
    Condition, Placeholder, Preposition, Shape, Specification, Template, exists, matching, not,
    not_exists,
};
pub use query::{Quantifier, Query, Step, parse_descriptive};
pub use storage::{Saved, StorageConnection, StorageProvider};
pub use tasks::TaskQueue;

// Re-export commonly used external types for convenience
pub use serde_json::{Value as JsonValue, json};

/// Prelude module for convenient imports.
///
/// Import everything you need with:
/// ```ignore
/// use factsync::prelude::*;
/// ```
pub mod prelude {
    pub use crate::coordinator::{Coordinator, CoordinatorConfig, WatchEvent, WatchHandle};
    pub use crate::error::{SyncError, SyncResult};
    pub use crate::fact::{FactRecord, FactReference};
    pub use crate::parser::{
        Condition, Placeholder, Preposition, Specification, Template, exists, matching, not,
        not_exists,
    };
    pub use crate::query::Query;
    pub use serde_json::{Value as JsonValue, json};
}
