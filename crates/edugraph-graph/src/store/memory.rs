//! In-process graph store with snapshot-isolated transactions.
//!
//! Each transaction works on a private copy of the committed state. Commit is
//! optimistic: every written entity carries a version, and a commit whose
//! writes overlap a concurrent commit (or would break a business-key or
//! relationship-triple uniqueness rule) fails with `ConstraintViolation`,
//! the same signal Neo4j gives for a unique-constraint race.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use edugraph_core::{GraphError, GraphResult, Node, NodeLabel, Relationship, RelationshipType};

use super::{bounded, EdgeFilter, GraphCounts, GraphStore, GraphTransaction, DEFAULT_CALL_TIMEOUT};
use crate::query::{GraphPath, PathQuery, Subgraph, SubgraphQuery};

#[derive(Debug, Clone, Default)]
struct GraphState {
    nodes: BTreeMap<String, Node>,
    edges: BTreeMap<String, Relationship>,
    versions: HashMap<String, u64>,
}

impl GraphState {
    fn find_by_key(&self, label: NodeLabel, key_field: &str, key_value: &Value) -> Option<&Node> {
        self.nodes
            .values()
            .find(|n| n.label == label && n.properties.get(key_field) == Some(key_value))
    }

    /// Another node of the same label already holding `node`'s business key.
    fn key_holder(&self, node: &Node) -> Option<&Node> {
        let key = node.key_value()?;
        self.find_by_key(node.label, node.label.key_field(), key)
            .filter(|other| other.id != node.id)
    }

    fn find_edge(&self, from_id: &str, to_id: &str, rel_type: RelationshipType) -> Option<&Relationship> {
        self.edges.values().find(|r| r.triple() == (from_id, to_id, rel_type))
    }

    /// Another edge already occupying `rel`'s (from, to, type) triple.
    fn triple_holder(&self, rel: &Relationship) -> Option<&Relationship> {
        let (from_id, to_id, rel_type) = rel.triple();
        self.find_edge(from_id, to_id, rel_type)
            .filter(|other| other.id != rel.id)
    }
}

impl GraphState {
    /// Edges of admitted types, listed under both endpoints.
    fn adjacency(&self, admits: impl Fn(RelationshipType) -> bool) -> HashMap<&str, Vec<&Relationship>> {
        let mut adjacency: HashMap<&str, Vec<&Relationship>> = HashMap::new();
        for rel in self.edges.values().filter(|r| admits(r.rel_type)) {
            adjacency.entry(rel.from_node_id.as_str()).or_default().push(rel);
            if rel.to_node_id != rel.from_node_id {
                adjacency.entry(rel.to_node_id.as_str()).or_default().push(rel);
            }
        }
        adjacency
    }

    /// Breadth-first walk from the root, ignoring direction.
    fn subgraph(&self, query: &SubgraphQuery) -> Subgraph {
        let root = query.root_id.as_str();
        if !self.nodes.contains_key(root) {
            return Subgraph::assemble(query, Vec::new(), Vec::new());
        }

        let adjacency = self.adjacency(|t| query.admits_type(t));
        let depth = query.effective_depth();
        let mut distance: HashMap<&str, usize> = HashMap::from([(root, 0)]);
        let mut queue = VecDeque::from([root]);
        while let Some(at) = queue.pop_front() {
            let hops = distance[at];
            if hops == depth {
                continue;
            }
            for rel in adjacency.get(at).into_iter().flatten() {
                let next = other_end(rel, at);
                if !distance.contains_key(next) {
                    distance.insert(next, hops + 1);
                    queue.push_back(next);
                }
            }
        }

        let mut reached: Vec<(usize, &Node)> = distance
            .iter()
            .filter_map(|(id, hops)| self.nodes.get(*id).map(|n| (*hops, n)))
            .filter(|(_, n)| query.admits_node(n))
            .collect();
        reached.sort_by(|a, b| (a.0, &a.1.id).cmp(&(b.0, &b.1.id)));
        let nodes = reached.into_iter().map(|(_, n)| n.clone()).collect();
        let relationships = self
            .edges
            .values()
            .filter(|r| distance.contains_key(r.from_node_id.as_str()) && distance.contains_key(r.to_node_id.as_str()))
            .cloned()
            .collect();
        Subgraph::assemble(query, nodes, relationships)
    }

    /// Every simple path up to the depth cap, shortest first, ties broken
    /// by relationship ids.
    fn paths(&self, query: &PathQuery) -> Vec<GraphPath> {
        let adjacency = self.adjacency(|t| query.admits_type(t));
        let mut found = Vec::new();
        let mut trail = vec![query.from_id.as_str()];
        let mut steps = Vec::new();
        walk(
            &adjacency,
            &query.to_id,
            query.effective_depth(),
            &mut trail,
            &mut steps,
            &mut found,
        );

        found.sort_by(|(_, a), (_, b)| {
            a.len()
                .cmp(&b.len())
                .then_with(|| a.iter().map(|r| &r.id).cmp(b.iter().map(|r| &r.id)))
        });
        found
            .into_iter()
            .take(query.limit)
            .map(|(trail, steps)| GraphPath {
                nodes: trail.iter().filter_map(|id| self.nodes.get(*id).cloned()).collect(),
                length: steps.len(),
                relationships: steps.into_iter().cloned().collect(),
            })
            .collect()
    }
}

fn other_end<'a>(rel: &'a Relationship, at: &str) -> &'a str {
    if rel.from_node_id == at {
        &rel.to_node_id
    } else {
        &rel.from_node_id
    }
}

type Trail<'a> = (Vec<&'a str>, Vec<&'a Relationship>);

fn walk<'a>(
    adjacency: &HashMap<&'a str, Vec<&'a Relationship>>,
    target: &str,
    max_depth: usize,
    trail: &mut Vec<&'a str>,
    steps: &mut Vec<&'a Relationship>,
    found: &mut Vec<Trail<'a>>,
) {
    let Some(&at) = trail.last() else {
        return;
    };
    if at == target && !steps.is_empty() {
        found.push((trail.clone(), steps.clone()));
        return;
    }
    if steps.len() == max_depth {
        return;
    }
    for &rel in adjacency.get(at).into_iter().flatten() {
        let next = other_end(rel, at);
        if trail.contains(&next) {
            continue;
        }
        trail.push(next);
        steps.push(rel);
        walk(adjacency, target, max_depth, trail, steps, found);
        trail.pop();
        steps.pop();
    }
}

struct Shared {
    state: Mutex<GraphState>,
    open: AtomicBool,
}

impl Shared {
    fn lock(&self) -> GraphResult<MutexGuard<'_, GraphState>> {
        self.state
            .lock()
            .map_err(|_| GraphError::StoreConnection("memory store lock poisoned".into()))
    }
}

/// In-memory implementation of [`GraphStore`].
///
/// Cloning yields another handle to the same graph.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    timeout: Duration,
    latency: Option<Duration>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(GraphState::default()),
                open: AtomicBool::new(true),
            }),
            timeout: DEFAULT_CALL_TIMEOUT,
            latency: None,
        }
    }

    /// Set the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delay every transaction call by `latency`, standing in for a network round-trip.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Committed nodes, ordered by id.
    pub fn nodes(&self) -> Vec<Node> {
        self.shared
            .lock()
            .map(|s| s.nodes.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed relationships, ordered by id.
    pub fn relationships(&self) -> Vec<Relationship> {
        self.shared
            .lock()
            .map(|s| s.edges.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed nodes with the given label.
    pub fn nodes_with_label(&self, label: NodeLabel) -> Vec<Node> {
        self.nodes().into_iter().filter(|n| n.label == label).collect()
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn begin_transaction(&self) -> GraphResult<Box<dyn GraphTransaction>> {
        if !self.shared.open.load(Ordering::Acquire) {
            return Err(GraphError::StoreConnection("store is closed".into()));
        }
        let snapshot = self.shared.lock()?.clone();
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            working: Workspace {
                state: snapshot,
                touched: BTreeSet::new(),
            },
            timeout: self.timeout,
            latency: self.latency,
        }))
    }

    async fn counts(&self) -> GraphResult<GraphCounts> {
        let state = self.shared.lock()?;
        Ok(GraphCounts {
            nodes: state.nodes.len(),
            relationships: state.edges.len(),
        })
    }

    async fn close(&self) -> GraphResult<()> {
        self.shared.open.store(false, Ordering::Release);
        Ok(())
    }

    fn call_timeout(&self) -> Duration {
        self.timeout
    }
}

/// Private working copy plus the ids written through it.
struct Workspace {
    state: GraphState,
    touched: BTreeSet<String>,
}

impl Workspace {
    fn node_mut(&mut self, id: &str) -> GraphResult<&mut Node> {
        self.state
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::node_not_found(id))
    }

    fn edge_mut(&mut self, id: &str) -> GraphResult<&mut Relationship> {
        self.state
            .edges
            .get_mut(id)
            .ok_or_else(|| GraphError::relationship_not_found(id))
    }
}

/// Transaction over a [`MemoryStore`].
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    working: Workspace,
    timeout: Duration,
    latency: Option<Duration>,
}

impl MemoryTransaction {
    /// Run `f` against the working copy under the store's latency and deadline.
    async fn call<T, F>(&mut self, operation: &'static str, f: F) -> GraphResult<T>
    where
        F: FnOnce(&mut Workspace) -> GraphResult<T> + Send,
        T: Send,
    {
        let latency = self.latency;
        let working = &mut self.working;
        bounded(self.timeout, operation, async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            f(working)
        })
        .await
    }
}

#[async_trait]
impl GraphTransaction for MemoryTransaction {
    async fn find_by_key(
        &mut self,
        label: NodeLabel,
        key_field: &str,
        key_value: &Value,
    ) -> GraphResult<Option<Node>> {
        self.call("find_by_key", |w| {
            Ok(w.state.find_by_key(label, key_field, key_value).cloned())
        })
        .await
    }

    async fn get_node(&mut self, id: &str) -> GraphResult<Option<Node>> {
        self.call("get_node", |w| Ok(w.state.nodes.get(id).cloned())).await
    }

    async fn list_nodes(&mut self, label: Option<NodeLabel>, limit: usize) -> GraphResult<Vec<Node>> {
        self.call("list_nodes", |w| {
            Ok(w.state
                .nodes
                .values()
                .filter(|n| label.is_none_or(|l| n.label == l))
                .take(limit)
                .cloned()
                .collect())
        })
        .await
    }

    async fn create(&mut self, node: &Node) -> GraphResult<Node> {
        self.call("create", |w| {
            if w.state.nodes.contains_key(&node.id) {
                return Err(GraphError::ConstraintViolation(format!("node id {} already exists", node.id)));
            }
            if let Some(holder) = w.state.key_holder(node) {
                return Err(GraphError::ConstraintViolation(format!(
                    "{} with {} = {} already exists ({})",
                    node.label,
                    node.label.key_field(),
                    node.key_value().unwrap_or(&Value::Null),
                    holder.id
                )));
            }
            w.state.nodes.insert(node.id.clone(), node.clone());
            w.touched.insert(node.id.clone());
            Ok(node.clone())
        })
        .await
    }

    async fn update(&mut self, node: &Node) -> GraphResult<Node> {
        self.call("update", |w| {
            if let Some(holder) = w.state.key_holder(node) {
                return Err(GraphError::ConstraintViolation(format!(
                    "{} key already held by {}",
                    node.label, holder.id
                )));
            }
            let stored = w.node_mut(&node.id)?;
            stored.properties = node.properties.clone();
            stored.updated_at = node.updated_at;
            let updated = stored.clone();
            w.touched.insert(node.id.clone());
            Ok(updated)
        })
        .await
    }

    async fn delete_node(&mut self, id: &str) -> GraphResult<bool> {
        self.call("delete_node", |w| {
            if w.state.nodes.remove(id).is_none() {
                return Ok(false);
            }
            w.touched.insert(id.to_string());
            let attached: Vec<String> = w
                .state
                .edges
                .values()
                .filter(|r| r.from_node_id == id || r.to_node_id == id)
                .map(|r| r.id.clone())
                .collect();
            for edge_id in attached {
                w.state.edges.remove(&edge_id);
                w.touched.insert(edge_id);
            }
            Ok(true)
        })
        .await
    }

    /// Optimistic commit already rejects a stale read of any entity this
    /// transaction writes, so the lock only checks existence.
    async fn lock_node(&mut self, id: &str) -> GraphResult<bool> {
        self.call("lock_node", |w| Ok(w.state.nodes.contains_key(id))).await
    }

    async fn find_edge(
        &mut self,
        from_id: &str,
        to_id: &str,
        rel_type: RelationshipType,
    ) -> GraphResult<Option<Relationship>> {
        self.call("find_edge", |w| Ok(w.state.find_edge(from_id, to_id, rel_type).cloned()))
            .await
    }

    async fn get_edge(&mut self, id: &str) -> GraphResult<Option<Relationship>> {
        self.call("get_edge", |w| Ok(w.state.edges.get(id).cloned())).await
    }

    async fn list_edges(&mut self, filter: &EdgeFilter) -> GraphResult<Vec<Relationship>> {
        self.call("list_edges", |w| {
            Ok(w.state
                .edges
                .values()
                .filter(|r| filter.matches(r))
                .take(filter.limit.unwrap_or(usize::MAX))
                .cloned()
                .collect())
        })
        .await
    }

    async fn create_edge(&mut self, rel: &Relationship) -> GraphResult<Relationship> {
        self.call("create_edge", |w| {
            for endpoint in [&rel.from_node_id, &rel.to_node_id] {
                if !w.state.nodes.contains_key(endpoint.as_str()) {
                    return Err(GraphError::node_not_found(endpoint.as_str()));
                }
            }
            if w.state.edges.contains_key(&rel.id) || w.state.triple_holder(rel).is_some() {
                return Err(GraphError::ConstraintViolation(format!(
                    "{} edge {} -> {} already exists",
                    rel.rel_type, rel.from_node_id, rel.to_node_id
                )));
            }
            w.state.edges.insert(rel.id.clone(), rel.clone());
            w.touched.insert(rel.id.clone());
            Ok(rel.clone())
        })
        .await
    }

    async fn update_edge(&mut self, rel: &Relationship) -> GraphResult<Relationship> {
        self.call("update_edge", |w| {
            let stored = w.edge_mut(&rel.id)?;
            stored.properties = rel.properties.clone();
            stored.weight = rel.weight;
            stored.updated_at = rel.updated_at;
            let updated = stored.clone();
            w.touched.insert(rel.id.clone());
            Ok(updated)
        })
        .await
    }

    async fn delete_edge(&mut self, id: &str) -> GraphResult<bool> {
        self.call("delete_edge", |w| {
            let removed = w.state.edges.remove(id).is_some();
            if removed {
                w.touched.insert(id.to_string());
            }
            Ok(removed)
        })
        .await
    }

    async fn subgraph(&mut self, query: &SubgraphQuery) -> GraphResult<Subgraph> {
        self.call("subgraph", |w| Ok(w.state.subgraph(query))).await
    }

    async fn find_paths(&mut self, query: &PathQuery) -> GraphResult<Vec<GraphPath>> {
        self.call("find_paths", |w| Ok(w.state.paths(query))).await
    }

    async fn commit(self: Box<Self>) -> GraphResult<()> {
        let MemoryTransaction { shared, working, .. } = *self;
        let Workspace { state: working, touched } = working;
        if touched.is_empty() {
            return Ok(());
        }

        let mut committed = shared.lock()?;

        for id in &touched {
            if committed.versions.get(id) != working.versions.get(id) {
                return Err(GraphError::ConstraintViolation(format!(
                    "concurrent write to {id}"
                )));
            }
        }

        let mut next = committed.clone();
        for id in &touched {
            next.nodes.remove(id);
            next.edges.remove(id);
            if let Some(node) = working.nodes.get(id) {
                next.nodes.insert(id.clone(), node.clone());
            } else if let Some(edge) = working.edges.get(id) {
                next.edges.insert(id.clone(), edge.clone());
            }
            *next.versions.entry(id.clone()).or_insert(0) += 1;
        }

        for id in &touched {
            if let Some(node) = next.nodes.get(id) {
                if let Some(holder) = next.key_holder(node) {
                    return Err(GraphError::ConstraintViolation(format!(
                        "{} business key of {} already held by {}",
                        node.label, node.id, holder.id
                    )));
                }
            }
            if let Some(edge) = next.edges.get(id) {
                if next.triple_holder(edge).is_some() {
                    return Err(GraphError::ConstraintViolation(format!(
                        "{} edge {} -> {} already exists",
                        edge.rel_type, edge.from_node_id, edge.to_node_id
                    )));
                }
                if !next.nodes.contains_key(&edge.from_node_id) || !next.nodes.contains_key(&edge.to_node_id) {
                    return Err(GraphError::ConstraintViolation(format!(
                        "edge {} references a node deleted concurrently",
                        edge.id
                    )));
                }
            }
        }

        // Edges committed concurrently against a node this transaction deleted.
        next.edges
            .retain(|_, e| next.nodes.contains_key(&e.from_node_id) && next.nodes.contains_key(&e.to_node_id));

        *committed = next;
        debug!(writes = touched.len(), "Memory transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> GraphResult<()> {
        debug!(writes = self.working.touched.len(), "Memory transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StoreWrite, WriteOutcome};
    use chrono::Utc;
    use edugraph_core::Properties;
    use serde_json::json;

    fn student(key: &str) -> Node {
        let props: Properties = serde_json::from_value(json!({"studentId": key})).unwrap();
        Node::new(NodeLabel::Student, props, Utc::now())
    }

    #[tokio::test]
    async fn test_writes_invisible_until_commit() {
        let store = MemoryStore::new();
        let mut writer = store.begin_transaction().await.unwrap();
        let node = student("S001");
        writer.create(&node).await.unwrap();

        let mut reader = store.begin_transaction().await.unwrap();
        assert!(reader.get_node(&node.id).await.unwrap().is_none());
        assert!(store.nodes().is_empty());

        writer.commit().await.unwrap();
        assert_eq!(store.nodes().len(), 1);
        // Snapshot taken before the commit stays stable.
        assert!(reader.get_node(&node.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = MemoryStore::new();
        let mut txn = store.begin_transaction().await.unwrap();
        txn.create(&student("S001")).await.unwrap();
        txn.rollback().await.unwrap();

        assert_eq!(store.counts().await.unwrap(), GraphCounts::default());
    }

    #[tokio::test]
    async fn test_unique_key_race_detected_at_commit() {
        let store = MemoryStore::new();
        let mut first = store.begin_transaction().await.unwrap();
        let mut second = store.begin_transaction().await.unwrap();

        first.create(&student("S001")).await.unwrap();
        second.create(&student("S001")).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(err.is_constraint_violation());
        assert_eq!(store.nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected_inside_transaction() {
        let store = MemoryStore::new();
        let mut txn = store.begin_transaction().await.unwrap();
        txn.create(&student("S001")).await.unwrap();

        let err = txn.create(&student("S001")).await.unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[tokio::test]
    async fn test_edge_requires_endpoints() {
        let store = MemoryStore::new();
        let a = student("S001");
        let mut txn = store.begin_transaction().await.unwrap();
        txn.create(&a).await.unwrap();

        let rel = Relationship::new(RelationshipType::ChatWith, &a.id, "missing", Properties::new(), Utc::now());
        let err = txn.create_edge(&rel).await.unwrap_err();
        assert_eq!(err.code(), "ENTITY_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_delete_node_detaches_edges() {
        let store = MemoryStore::new();
        let (a, b) = (student("S001"), student("S002"));
        let rel = Relationship::new(RelationshipType::ChatWith, &a.id, &b.id, Properties::new(), Utc::now());
        store
            .run_in_transaction(vec![
                StoreWrite::CreateNode(a.clone()),
                StoreWrite::CreateNode(b.clone()),
                StoreWrite::CreateEdge(rel),
            ])
            .await
            .unwrap();

        let outcomes = store
            .run_in_transaction(vec![StoreWrite::DeleteNode(a.id.clone())])
            .await
            .unwrap();
        assert_eq!(outcomes, vec![WriteOutcome::Deleted(true)]);
        assert_eq!(store.counts().await.unwrap(), GraphCounts { nodes: 1, relationships: 0 });
    }

    #[tokio::test]
    async fn test_run_in_transaction_is_all_or_nothing() {
        let store = MemoryStore::new();
        let a = student("S001");
        let dangling = Relationship::new(RelationshipType::Likes, &a.id, "ghost", Properties::new(), Utc::now());

        let err = store
            .run_in_transaction(vec![StoreWrite::CreateNode(a), StoreWrite::CreateEdge(dangling)])
            .await
            .unwrap_err();

        assert_eq!(err.code(), "ENTITY_NOT_FOUND");
        assert!(store.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let store = MemoryStore::new()
            .with_latency(Duration::from_millis(200))
            .with_timeout(Duration::from_millis(10));
        let mut txn = store.begin_transaction().await.unwrap();

        let err = txn.get_node("any").await.unwrap_err();
        assert_eq!(err.code(), "STORE_TIMEOUT");
    }

    #[tokio::test]
    async fn test_closed_store_refuses_transactions() {
        let store = MemoryStore::new();
        store.close().await.unwrap();

        let err = store.begin_transaction().await.err().unwrap();
        assert!(err.is_transient());
    }
}
