//! # EduGraph Graph
//!
//! Incremental upsert and transactional batch engine for the education
//! knowledge graph.
//!
//! Provides the graph store seam (Neo4j and in-memory), conflict resolution,
//! the upsert engine, batch execution, duplicate merge, bulk record import and
//! neighbourhood and path queries.

pub mod batch;
pub mod client;
pub mod import;
pub mod merge;
pub mod query;
pub mod repository;
pub mod resolver;
pub mod schema;
pub mod store;
pub mod upsert;

pub use batch::{BatchExecutor, BatchOperation, BatchResult, BatchState, NodeRef, OperationOutcome, RelationshipRef};
pub use client::GraphClient;
pub use import::{ImportProgress, ImportRecord, ImportResult, Importer, ProgressHandle, RecordType, ValidationResult};
pub use merge::{merge_nodes, MergeReport};
pub use query::{GraphPath, NodeDetails, PathQuery, Subgraph, SubgraphQuery};
pub use resolver::{resolve, ConflictStrategy, Resolution, Snapshot, Winner};
pub use schema::initialize_schema;
pub use store::{
    EdgeFilter, GraphCounts, GraphStore, GraphTransaction, MemoryStore, Neo4jStore, StoreWrite, WriteOutcome,
};
pub use upsert::UpsertEngine;
