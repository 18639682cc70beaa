//! Graph Store Adapter.
//!
//! The only seam between the engine and the property graph database. A
//! [`GraphStore`] hands out [`GraphTransaction`]s; every read and write goes
//! through one, so writes stay invisible to other transactions until commit
//! and a rollback leaves the store untouched.
//!
//! Two backends implement the contract:
//! - [`Neo4jStore`](neo4j::Neo4jStore) over neo4rs, for production
//! - [`MemoryStore`](memory::MemoryStore), snapshot-isolated and in-process,
//!   for tests and dry runs

pub mod memory;
pub mod neo4j;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use edugraph_core::{GraphError, GraphResult, Node, NodeLabel, Relationship, RelationshipType};

use crate::query::{GraphPath, PathQuery, Subgraph, SubgraphQuery};

pub use memory::MemoryStore;
pub use neo4j::Neo4jStore;

/// Default deadline for a single store call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Node and relationship counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphCounts {
    pub nodes: usize,
    pub relationships: usize,
}

/// Filter for relationship listings. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EdgeFilter {
    pub from_node_id: Option<String>,
    pub to_node_id: Option<String>,
    /// Matches edges touching this node at either end.
    pub node_id: Option<String>,
    pub rel_type: Option<RelationshipType>,
    pub limit: Option<usize>,
}

impl EdgeFilter {
    /// All edges touching `node_id`, in either direction.
    pub fn touching(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, rel: &Relationship) -> bool {
        self.from_node_id.as_deref().is_none_or(|id| rel.from_node_id == id)
            && self.to_node_id.as_deref().is_none_or(|id| rel.to_node_id == id)
            && self
                .node_id
                .as_deref()
                .is_none_or(|id| rel.from_node_id == id || rel.to_node_id == id)
            && self.rel_type.is_none_or(|t| rel.rel_type == t)
    }
}

/// A primitive write for [`GraphStore::run_in_transaction`].
#[derive(Debug, Clone)]
pub enum StoreWrite {
    CreateNode(Node),
    UpdateNode(Node),
    DeleteNode(String),
    CreateEdge(Relationship),
    UpdateEdge(Relationship),
    DeleteEdge(String),
}

/// Outcome of a single [`StoreWrite`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Node(Node),
    Relationship(Relationship),
    Deleted(bool),
}

/// Connection-level handle to a property graph database.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Open a new transaction.
    async fn begin_transaction(&self) -> GraphResult<Box<dyn GraphTransaction>>;

    /// Committed node and relationship counts.
    async fn counts(&self) -> GraphResult<GraphCounts>;

    /// Release the connection. Later `begin_transaction` calls fail.
    async fn close(&self) -> GraphResult<()>;

    /// Deadline applied to every individual store call.
    fn call_timeout(&self) -> Duration;

    /// Apply `writes` in order inside one transaction.
    ///
    /// The first failure rolls the transaction back and is returned as-is;
    /// nothing from the list is visible afterwards.
    async fn run_in_transaction(&self, writes: Vec<StoreWrite>) -> GraphResult<Vec<WriteOutcome>> {
        let mut txn = self.begin_transaction().await?;
        let mut outcomes = Vec::with_capacity(writes.len());

        for write in writes {
            let outcome = match write {
                StoreWrite::CreateNode(node) => txn.create(&node).await.map(WriteOutcome::Node),
                StoreWrite::UpdateNode(node) => txn.update(&node).await.map(WriteOutcome::Node),
                StoreWrite::DeleteNode(id) => txn.delete_node(&id).await.map(WriteOutcome::Deleted),
                StoreWrite::CreateEdge(rel) => {
                    txn.create_edge(&rel).await.map(WriteOutcome::Relationship)
                }
                StoreWrite::UpdateEdge(rel) => {
                    txn.update_edge(&rel).await.map(WriteOutcome::Relationship)
                }
                StoreWrite::DeleteEdge(id) => txn.delete_edge(&id).await.map(WriteOutcome::Deleted),
            };

            match outcome {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    rollback_quietly(txn).await;
                    return Err(e);
                }
            }
        }

        txn.commit().await?;
        Ok(outcomes)
    }
}

/// An open unit of work against the store.
///
/// Dropping a transaction without calling [`commit`](Self::commit) discards it.
#[async_trait]
pub trait GraphTransaction: Send {
    /// Look up a node by its business key.
    async fn find_by_key(
        &mut self,
        label: NodeLabel,
        key_field: &str,
        key_value: &Value,
    ) -> GraphResult<Option<Node>>;

    async fn get_node(&mut self, id: &str) -> GraphResult<Option<Node>>;

    async fn list_nodes(&mut self, label: Option<NodeLabel>, limit: usize) -> GraphResult<Vec<Node>>;

    /// Insert a node. Fails with `ConstraintViolation` if its business key is taken.
    async fn create(&mut self, node: &Node) -> GraphResult<Node>;

    /// Overwrite the properties and `updated_at` of the node with `node.id`.
    async fn update(&mut self, node: &Node) -> GraphResult<Node>;

    /// Delete a node and every relationship touching it.
    async fn delete_node(&mut self, id: &str) -> GraphResult<bool>;

    /// Take a write lock on the node with `id`, held until the transaction
    /// ends. Returns `false` when no such node exists.
    ///
    /// Read-modify-write sequences call this before their read so that two
    /// writers on the same node or outgoing triple serialize instead of both
    /// acting on the same stale read.
    async fn lock_node(&mut self, id: &str) -> GraphResult<bool>;

    async fn find_edge(
        &mut self,
        from_id: &str,
        to_id: &str,
        rel_type: RelationshipType,
    ) -> GraphResult<Option<Relationship>>;

    async fn get_edge(&mut self, id: &str) -> GraphResult<Option<Relationship>>;

    async fn list_edges(&mut self, filter: &EdgeFilter) -> GraphResult<Vec<Relationship>>;

    /// Insert a directed edge between two existing nodes.
    async fn create_edge(&mut self, rel: &Relationship) -> GraphResult<Relationship>;

    /// Overwrite the properties, weight and `updated_at` of the edge with `rel.id`.
    async fn update_edge(&mut self, rel: &Relationship) -> GraphResult<Relationship>;

    async fn delete_edge(&mut self, id: &str) -> GraphResult<bool>;

    /// Nodes within `query.effective_depth()` hops of the root along
    /// admitted relationship types, nearest first, with the relationships
    /// among them. An unknown root yields an empty subgraph.
    async fn subgraph(&mut self, query: &SubgraphQuery) -> GraphResult<Subgraph>;

    /// Simple paths of one or more hops between two distinct existing
    /// nodes, shortest first, at most `query.limit` of them.
    async fn find_paths(&mut self, query: &PathQuery) -> GraphResult<Vec<GraphPath>>;

    async fn commit(self: Box<Self>) -> GraphResult<()>;

    async fn rollback(self: Box<Self>) -> GraphResult<()>;
}

/// Roll back, logging instead of returning a failure. Used on error paths
/// where the original error is the one worth surfacing.
pub async fn rollback_quietly(txn: Box<dyn GraphTransaction>) {
    if let Err(e) = txn.rollback().await {
        warn!(error = %e, "Transaction rollback failed");
    }
}

/// Run a store call under a deadline.
pub(crate) async fn bounded<T, F>(timeout: Duration, operation: &'static str, call: F) -> GraphResult<T>
where
    F: Future<Output = GraphResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(GraphError::StoreTimeout { operation, timeout }),
    }
}
