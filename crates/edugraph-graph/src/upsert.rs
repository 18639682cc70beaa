//! Upsert engine: lookup, conflict resolution, then create-or-update.
//!
//! The `*_in` functions run inside a caller-owned transaction and are what
//! the batch executor composes. [`UpsertEngine`] wraps each call in its own
//! transaction and retries an upsert once when the store reports a
//! unique-constraint race, re-reading current state on the second attempt.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use edugraph_core::model::{split_edge_keys, split_system_keys, FIRST_OCCURRENCE, LAST_OCCURRENCE, OCCURRENCE_COUNT};
use edugraph_core::{GraphError, GraphResult, Node, NodeLabel, Properties, Relationship, RelationshipType};

use crate::query::{find_paths_in, node_details_in, subgraph_in, GraphPath, NodeDetails, PathQuery, Subgraph, SubgraphQuery};
use crate::repository;
use crate::resolver::{resolve, ConflictStrategy, Snapshot, Winner};
use crate::store::{rollback_quietly, EdgeFilter, GraphStore, GraphTransaction};

/// Upsert a node by business key inside `txn`.
///
/// The key value is always written into the resolved properties. Incoming
/// system keys are dropped, except `updatedAt` which serves as the incoming
/// timestamp for [`ConflictStrategy::TimestampPriority`].
pub async fn upsert_node_in(
    txn: &mut dyn GraphTransaction,
    label: NodeLabel,
    key_field: &str,
    key_value: &Value,
    properties: &Properties,
    strategy: ConflictStrategy,
    now: DateTime<Utc>,
) -> GraphResult<Node> {
    if key_value.is_null() {
        return Err(GraphError::invalid_input(key_field, "business key value is null"));
    }
    let mut incoming = properties.clone();
    let system = split_system_keys(&mut incoming);
    incoming.insert(key_field.to_string(), key_value.clone());

    let Some(found) = repository::find_node(txn, label, key_field, key_value).await? else {
        let node = Node::new(label, incoming, now);
        let created = txn
            .create(&node)
            .await
            .map_err(|e| e.context(format!("create {label}")))?;
        info!(id = %created.id, label = %label, key = %key_value, "Node created");
        return Ok(created);
    };
    let mut existing = repository::lock_node(txn, &found.id).await?;

    let resolution = resolve(
        Snapshot::new(&existing.properties, Some(existing.updated_at)),
        Snapshot::new(&incoming, system.updated_at),
        strategy,
        now,
    );
    let mut resolved = resolution.properties;
    let canonical_key = label.key_field();
    if !resolved.contains_key(canonical_key) {
        if let Some(value) = existing.properties.get(canonical_key) {
            resolved.insert(canonical_key.to_string(), value.clone());
        }
    }

    existing.properties = resolved;
    existing.updated_at = now;
    let updated = txn
        .update(&existing)
        .await
        .map_err(|e| e.context(format!("update {label}")))?;
    info!(
        id = %updated.id,
        label = %label,
        key = %key_value,
        strategy = %strategy,
        winner = ?resolution.winner,
        "Node updated"
    );
    Ok(updated)
}

/// Upsert the relationship identified by `(from_id, to_id, rel_type)` inside `txn`.
///
/// Both endpoints must exist. The start node is write-locked before the
/// triple lookup. On the update branch an occurrence-tracked
/// relationship has its `occurrenceCount` incremented regardless of the
/// strategy, its weight set to the new count and `lastOccurrence` refreshed;
/// `firstOccurrence` is kept.
pub async fn upsert_relationship_in(
    txn: &mut dyn GraphTransaction,
    from_id: &str,
    to_id: &str,
    rel_type: RelationshipType,
    properties: &Properties,
    strategy: ConflictStrategy,
    now: DateTime<Utc>,
) -> GraphResult<Relationship> {
    repository::lock_node(txn, from_id).await?;
    repository::require_node(txn, to_id).await?;

    let mut incoming = properties.clone();
    let system = split_edge_keys(&mut incoming);
    let occurred_at = system.updated_at.unwrap_or(now);

    let Some(mut existing) = repository::find_relationship(txn, from_id, to_id, rel_type).await? else {
        let mut rel = Relationship::new(rel_type, from_id, to_id, incoming, now);
        rel.weight = system.weight;
        if rel.is_occurrence_tracked() {
            start_occurrences(&mut rel, occurred_at);
        }
        let created = txn
            .create_edge(&rel)
            .await
            .map_err(|e| e.context(format!("create {rel_type} relationship")))?;
        info!(id = %created.id, rel_type = %rel_type, from = from_id, to = to_id, "Relationship created");
        return Ok(created);
    };

    let resolution = resolve(
        Snapshot::new(&existing.properties, Some(existing.updated_at)),
        Snapshot::new(&incoming, system.updated_at),
        strategy,
        now,
    );
    let tracked = existing.is_occurrence_tracked();
    let previous = existing.properties.clone();
    let incoming_last = incoming.get(LAST_OCCURRENCE).filter(|v| v.is_string()).cloned();

    existing.properties = resolution.properties;
    if system.weight.is_some() && resolution.winner != Winner::Existing {
        existing.weight = system.weight;
    }
    if tracked {
        let count = previous
            .get(OCCURRENCE_COUNT)
            .and_then(Value::as_i64)
            .unwrap_or(1)
            .max(1)
            .saturating_add(1);
        let first = previous
            .get(FIRST_OCCURRENCE)
            .cloned()
            .unwrap_or_else(|| Value::from(existing.created_at.to_rfc3339()));
        let last = incoming_last.unwrap_or_else(|| Value::from(occurred_at.to_rfc3339()));

        existing.properties.insert(OCCURRENCE_COUNT.to_string(), Value::from(count));
        existing.properties.insert(FIRST_OCCURRENCE.to_string(), first);
        existing.properties.insert(LAST_OCCURRENCE.to_string(), last);
        existing.weight = Some(count as f64);
    }
    existing.updated_at = now;

    let updated = txn
        .update_edge(&existing)
        .await
        .map_err(|e| e.context(format!("update {rel_type} relationship")))?;
    info!(
        id = %updated.id,
        rel_type = %rel_type,
        strategy = %strategy,
        occurrences = ?updated.occurrence_count(),
        "Relationship updated"
    );
    Ok(updated)
}

/// Create a node without lookup. The label's business key must be present;
/// a taken key fails with `ConstraintViolation`.
pub async fn create_node_in(
    txn: &mut dyn GraphTransaction,
    label: NodeLabel,
    properties: &Properties,
    now: DateTime<Utc>,
) -> GraphResult<Node> {
    let mut props = properties.clone();
    split_system_keys(&mut props);
    let key_field = label.key_field();
    if props.get(key_field).is_none_or(Value::is_null) {
        return Err(GraphError::invalid_input(key_field, format!("{label} requires '{key_field}'")));
    }

    let node = Node::new(label, props, now);
    let created = txn
        .create(&node)
        .await
        .map_err(|e| e.context(format!("create {label}")))?;
    info!(id = %created.id, label = %label, "Node created");
    Ok(created)
}

/// Create a relationship directly. An occupied triple fails with
/// `ConstraintViolation` instead of being updated.
pub async fn create_relationship_in(
    txn: &mut dyn GraphTransaction,
    from_id: &str,
    to_id: &str,
    rel_type: RelationshipType,
    properties: &Properties,
    now: DateTime<Utc>,
) -> GraphResult<Relationship> {
    repository::lock_node(txn, from_id).await?;
    repository::require_node(txn, to_id).await?;
    if repository::find_relationship(txn, from_id, to_id, rel_type).await?.is_some() {
        return Err(GraphError::ConstraintViolation(format!(
            "{rel_type} relationship {from_id} -> {to_id} already exists"
        )));
    }

    let mut props = properties.clone();
    let system = split_edge_keys(&mut props);
    let mut rel = Relationship::new(rel_type, from_id, to_id, props, now);
    rel.weight = system.weight;
    if rel.is_occurrence_tracked() {
        start_occurrences(&mut rel, system.updated_at.unwrap_or(now));
    }
    let created = txn
        .create_edge(&rel)
        .await
        .map_err(|e| e.context(format!("create {rel_type} relationship")))?;
    info!(id = %created.id, rel_type = %rel_type, "Relationship created");
    Ok(created)
}

/// Initialise occurrence fields on a new relationship. An incoming count of
/// at least one is kept, anything else starts at one.
fn start_occurrences(rel: &mut Relationship, at: DateTime<Utc>) {
    let count = rel
        .properties
        .get(OCCURRENCE_COUNT)
        .and_then(Value::as_i64)
        .filter(|c| *c >= 1)
        .unwrap_or(1);
    let stamp = Value::from(at.to_rfc3339());

    rel.properties.insert(OCCURRENCE_COUNT.to_string(), Value::from(count));
    rel.properties
        .entry(FIRST_OCCURRENCE.to_string())
        .or_insert_with(|| stamp.clone());
    rel.properties.entry(LAST_OCCURRENCE.to_string()).or_insert(stamp);
    rel.weight = Some(count as f64);
}

/// Commit on success, roll back on failure.
pub(crate) async fn finish<T>(txn: Box<dyn GraphTransaction>, result: GraphResult<T>) -> GraphResult<T> {
    match result {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(e) => {
            rollback_quietly(txn).await;
            Err(e)
        }
    }
}

/// Entry point for single writes and reads, each in its own transaction.
#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn GraphStore>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Create-or-update a node by business key.
    pub async fn upsert_node(
        &self,
        label: NodeLabel,
        key_field: &str,
        key_value: &Value,
        properties: &Properties,
        strategy: ConflictStrategy,
    ) -> GraphResult<Node> {
        match self.upsert_node_once(label, key_field, key_value, properties, strategy).await {
            Err(e) if e.is_constraint_violation() => {
                warn!(label = %label, key = %key_value, error = %e, "Constraint violation on node upsert, retrying once");
                self.upsert_node_once(label, key_field, key_value, properties, strategy)
                    .await
            }
            other => other,
        }
    }

    async fn upsert_node_once(
        &self,
        label: NodeLabel,
        key_field: &str,
        key_value: &Value,
        properties: &Properties,
        strategy: ConflictStrategy,
    ) -> GraphResult<Node> {
        let mut txn = self.store.begin_transaction().await?;
        let result = upsert_node_in(txn.as_mut(), label, key_field, key_value, properties, strategy, Utc::now()).await;
        finish(txn, result).await
    }

    /// Create-or-update the relationship identified by its triple.
    pub async fn upsert_relationship(
        &self,
        from_id: &str,
        to_id: &str,
        rel_type: RelationshipType,
        properties: &Properties,
        strategy: ConflictStrategy,
    ) -> GraphResult<Relationship> {
        match self
            .upsert_relationship_once(from_id, to_id, rel_type, properties, strategy)
            .await
        {
            Err(e) if e.is_constraint_violation() => {
                warn!(rel_type = %rel_type, from = from_id, to = to_id, error = %e, "Constraint violation on relationship upsert, retrying once");
                self.upsert_relationship_once(from_id, to_id, rel_type, properties, strategy)
                    .await
            }
            other => other,
        }
    }

    async fn upsert_relationship_once(
        &self,
        from_id: &str,
        to_id: &str,
        rel_type: RelationshipType,
        properties: &Properties,
        strategy: ConflictStrategy,
    ) -> GraphResult<Relationship> {
        let mut txn = self.store.begin_transaction().await?;
        let result =
            upsert_relationship_in(txn.as_mut(), from_id, to_id, rel_type, properties, strategy, Utc::now()).await;
        finish(txn, result).await
    }

    pub async fn create_node(&self, label: NodeLabel, properties: &Properties) -> GraphResult<Node> {
        let mut txn = self.store.begin_transaction().await?;
        let result = create_node_in(txn.as_mut(), label, properties, Utc::now()).await;
        finish(txn, result).await
    }

    /// Patch a node's properties by id.
    pub async fn update_node(&self, id: &str, patch: &Properties) -> GraphResult<Node> {
        let mut txn = self.store.begin_transaction().await?;
        let result = repository::update_node_properties(txn.as_mut(), id, patch, Utc::now()).await;
        finish(txn, result).await
    }

    pub async fn create_relationship(
        &self,
        from_id: &str,
        to_id: &str,
        rel_type: RelationshipType,
        properties: &Properties,
    ) -> GraphResult<Relationship> {
        let mut txn = self.store.begin_transaction().await?;
        let result = create_relationship_in(txn.as_mut(), from_id, to_id, rel_type, properties, Utc::now()).await;
        finish(txn, result).await
    }

    /// Patch a relationship's properties by id.
    pub async fn update_relationship(&self, id: &str, patch: &Properties) -> GraphResult<Relationship> {
        let mut txn = self.store.begin_transaction().await?;
        let result = repository::update_relationship_properties(txn.as_mut(), id, patch, Utc::now()).await;
        finish(txn, result).await
    }

    pub async fn find_node(&self, label: NodeLabel, key_value: &Value) -> GraphResult<Option<Node>> {
        let mut txn = self.store.begin_transaction().await?;
        let result = repository::find_node(txn.as_mut(), label, label.key_field(), key_value).await;
        finish(txn, result).await
    }

    pub async fn get_node(&self, id: &str) -> GraphResult<Option<Node>> {
        let mut txn = self.store.begin_transaction().await?;
        let result = repository::get_node(txn.as_mut(), id).await;
        finish(txn, result).await
    }

    pub async fn list_nodes(&self, label: Option<NodeLabel>, limit: usize) -> GraphResult<Vec<Node>> {
        let mut txn = self.store.begin_transaction().await?;
        let result = repository::list_nodes(txn.as_mut(), label, limit).await;
        finish(txn, result).await
    }

    pub async fn delete_node(&self, id: &str) -> GraphResult<bool> {
        let mut txn = self.store.begin_transaction().await?;
        let result = repository::delete_node(txn.as_mut(), id).await;
        debug!(id, deleted = ?result.as_ref().ok(), "Node delete requested");
        finish(txn, result).await
    }

    pub async fn get_relationship(&self, id: &str) -> GraphResult<Option<Relationship>> {
        let mut txn = self.store.begin_transaction().await?;
        let result = repository::get_relationship(txn.as_mut(), id).await;
        finish(txn, result).await
    }

    pub async fn list_relationships(&self, filter: &EdgeFilter) -> GraphResult<Vec<Relationship>> {
        let mut txn = self.store.begin_transaction().await?;
        let result = repository::list_relationships(txn.as_mut(), filter).await;
        finish(txn, result).await
    }

    pub async fn delete_relationship(&self, id: &str) -> GraphResult<bool> {
        let mut txn = self.store.begin_transaction().await?;
        let result = repository::delete_relationship(txn.as_mut(), id).await;
        finish(txn, result).await
    }

    /// Neighbourhood subgraph around a node.
    pub async fn subgraph(&self, query: &SubgraphQuery) -> GraphResult<Subgraph> {
        let mut txn = self.store.begin_transaction().await?;
        let result = subgraph_in(txn.as_mut(), query).await;
        finish(txn, result).await
    }

    /// Paths between two nodes, shortest first.
    pub async fn find_paths(&self, query: &PathQuery) -> GraphResult<Vec<GraphPath>> {
        let mut txn = self.store.begin_transaction().await?;
        let result = find_paths_in(txn.as_mut(), query).await;
        finish(txn, result).await
    }

    pub async fn node_details(&self, id: &str) -> GraphResult<Option<NodeDetails>> {
        let mut txn = self.store.begin_transaction().await?;
        let result = node_details_in(txn.as_mut(), id).await;
        finish(txn, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn props(value: Value) -> Properties {
        serde_json::from_value(value).unwrap()
    }

    fn engine() -> (MemoryStore, UpsertEngine) {
        let store = MemoryStore::new();
        let engine = UpsertEngine::new(Arc::new(store.clone()));
        (store, engine)
    }

    async fn student(engine: &UpsertEngine, key: &str) -> Node {
        engine
            .upsert_node(NodeLabel::Student, "studentId", &json!(key), &Properties::new(), ConflictStrategy::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_node_is_idempotent() {
        let (store, engine) = engine();
        let input = props(json!({"name": "Alice"}));

        let first = engine
            .upsert_node(NodeLabel::Student, "studentId", &json!("S001"), &input, ConflictStrategy::default())
            .await
            .unwrap();
        let second = engine
            .upsert_node(NodeLabel::Student, "studentId", &json!("S001"), &input, ConflictStrategy::default())
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.properties, props(json!({"studentId": "S001", "name": "Alice"})));
        assert_eq!(store.nodes_with_label(NodeLabel::Student).len(), 1);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_incoming_system_keys_are_not_stored() {
        let (_, engine) = engine();
        let node = engine
            .upsert_node(
                NodeLabel::Course,
                "courseId",
                &json!("C1"),
                &props(json!({"id": "forged", "createdAt": "2020-01-01T00:00:00Z", "title": "Physics"})),
                ConflictStrategy::default(),
            )
            .await
            .unwrap();

        assert_ne!(node.id, "forged");
        assert_eq!(node.properties, props(json!({"courseId": "C1", "title": "Physics"})));
    }

    #[tokio::test]
    async fn test_null_key_rejected_before_write() {
        let (store, engine) = engine();
        let err = engine
            .upsert_node(NodeLabel::Student, "studentId", &Value::Null, &Properties::new(), ConflictStrategy::default())
            .await
            .unwrap_err();

        assert!(err.is_validation());
        assert!(store.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_relationship_requires_existing_endpoints() {
        let (store, engine) = engine();
        let a = student(&engine, "S1").await;

        let err = engine
            .upsert_relationship(&a.id, "missing", RelationshipType::ChatWith, &Properties::new(), ConflictStrategy::default())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "ENTITY_NOT_FOUND");
        assert!(store.relationships().is_empty());
    }

    #[tokio::test]
    async fn test_has_error_counts_occurrences() {
        let (store, engine) = engine();
        let s = student(&engine, "S1").await;
        let e = engine
            .upsert_node(NodeLabel::ErrorType, "errorTypeId", &json!("E1"), &Properties::new(), ConflictStrategy::default())
            .await
            .unwrap();

        let mut first = None;
        for i in 0..4 {
            let rel = engine
                .upsert_relationship(
                    &s.id,
                    &e.id,
                    RelationshipType::HasError,
                    &props(json!({"courseId": "C1", "attempt": i})),
                    ConflictStrategy::KeepExisting,
                )
                .await
                .unwrap();
            first.get_or_insert_with(|| rel.properties[FIRST_OCCURRENCE].clone());
            assert_eq!(rel.occurrence_count(), Some(i + 1));
            assert_eq!(rel.weight, Some((i + 1) as f64));
            assert_eq!(rel.properties[FIRST_OCCURRENCE], first.clone().unwrap());
        }
        assert_eq!(store.relationships().len(), 1);
    }

    #[tokio::test]
    async fn test_plain_relationship_has_no_counter() {
        let (_, engine) = engine();
        let a = student(&engine, "S1").await;
        let b = student(&engine, "S2").await;

        for _ in 0..2 {
            let rel = engine
                .upsert_relationship(&a.id, &b.id, RelationshipType::Likes, &props(json!({"since": "2024"})), ConflictStrategy::default())
                .await
                .unwrap();
            assert_eq!(rel.occurrence_count(), None);
            assert_eq!(rel.weight, None);
        }
    }

    #[tokio::test]
    async fn test_direct_create_rejects_duplicates() {
        let (_, engine) = engine();
        engine
            .create_node(NodeLabel::Teacher, &props(json!({"teacherId": "T1"})))
            .await
            .unwrap();

        let err = engine
            .create_node(NodeLabel::Teacher, &props(json!({"teacherId": "T1"})))
            .await
            .unwrap_err();
        assert!(err.is_constraint_violation());

        let err = engine
            .create_node(NodeLabel::Teacher, &props(json!({"name": "No key"})))
            .await
            .unwrap_err();
        assert_eq!(err.field(), Some("teacherId"));
    }

    /// Delegates to a memory transaction and records the order of calls.
    struct Recording {
        inner: Box<dyn GraphTransaction>,
        calls: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl Recording {
        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait::async_trait]
    impl GraphTransaction for Recording {
        async fn find_by_key(&mut self, label: NodeLabel, key_field: &str, key_value: &Value) -> GraphResult<Option<Node>> {
            self.log("find_by_key".into());
            self.inner.find_by_key(label, key_field, key_value).await
        }
        async fn get_node(&mut self, id: &str) -> GraphResult<Option<Node>> {
            self.log("get_node".into());
            self.inner.get_node(id).await
        }
        async fn list_nodes(&mut self, label: Option<NodeLabel>, limit: usize) -> GraphResult<Vec<Node>> {
            self.inner.list_nodes(label, limit).await
        }
        async fn create(&mut self, node: &Node) -> GraphResult<Node> {
            self.log("create".into());
            self.inner.create(node).await
        }
        async fn update(&mut self, node: &Node) -> GraphResult<Node> {
            self.log("update".into());
            self.inner.update(node).await
        }
        async fn delete_node(&mut self, id: &str) -> GraphResult<bool> {
            self.inner.delete_node(id).await
        }
        async fn lock_node(&mut self, id: &str) -> GraphResult<bool> {
            self.log(format!("lock_node {id}"));
            self.inner.lock_node(id).await
        }
        async fn find_edge(&mut self, from_id: &str, to_id: &str, rel_type: RelationshipType) -> GraphResult<Option<Relationship>> {
            self.log("find_edge".into());
            self.inner.find_edge(from_id, to_id, rel_type).await
        }
        async fn get_edge(&mut self, id: &str) -> GraphResult<Option<Relationship>> {
            self.inner.get_edge(id).await
        }
        async fn list_edges(&mut self, filter: &EdgeFilter) -> GraphResult<Vec<Relationship>> {
            self.inner.list_edges(filter).await
        }
        async fn create_edge(&mut self, rel: &Relationship) -> GraphResult<Relationship> {
            self.log("create_edge".into());
            self.inner.create_edge(rel).await
        }
        async fn update_edge(&mut self, rel: &Relationship) -> GraphResult<Relationship> {
            self.log("update_edge".into());
            self.inner.update_edge(rel).await
        }
        async fn delete_edge(&mut self, id: &str) -> GraphResult<bool> {
            self.inner.delete_edge(id).await
        }
        async fn subgraph(&mut self, query: &SubgraphQuery) -> GraphResult<Subgraph> {
            self.inner.subgraph(query).await
        }
        async fn find_paths(&mut self, query: &PathQuery) -> GraphResult<Vec<GraphPath>> {
            self.inner.find_paths(query).await
        }
        async fn commit(self: Box<Self>) -> GraphResult<()> {
            self.inner.commit().await
        }
        async fn rollback(self: Box<Self>) -> GraphResult<()> {
            self.inner.rollback().await
        }
    }

    fn position(calls: &[String], call: &str) -> usize {
        calls.iter().position(|c| c == call).unwrap()
    }

    #[tokio::test]
    async fn test_start_node_locked_before_triple_lookup() {
        let (store, engine) = engine();
        let s = student(&engine, "S1").await;
        let e = engine
            .upsert_node(NodeLabel::ErrorType, "errorTypeId", &json!("E1"), &Properties::new(), ConflictStrategy::default())
            .await
            .unwrap();

        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        for _ in 0..2 {
            let mut txn = Recording {
                inner: store.begin_transaction().await.unwrap(),
                calls: calls.clone(),
            };
            upsert_relationship_in(&mut txn, &s.id, &e.id, RelationshipType::HasError, &Properties::new(), ConflictStrategy::default(), Utc::now())
                .await
                .unwrap();
            let lock = position(&calls.lock().unwrap(), &format!("lock_node {}", s.id));
            let lookup = position(&calls.lock().unwrap(), "find_edge");
            assert!(lock < lookup);
            Box::new(txn).commit().await.unwrap();
            calls.lock().unwrap().clear();
        }

        let mut txn = Recording {
            inner: store.begin_transaction().await.unwrap(),
            calls: calls.clone(),
        };
        upsert_node_in(&mut txn, NodeLabel::Student, "studentId", &json!("S1"), &Properties::new(), ConflictStrategy::default(), Utc::now())
            .await
            .unwrap();
        let calls = calls.lock().unwrap().clone();
        assert!(position(&calls, &format!("lock_node {}", s.id)) < position(&calls, "update"));
    }

    #[tokio::test]
    async fn test_lock_on_missing_node_is_not_found() {
        let (store, _) = engine();
        let mut txn = store.begin_transaction().await.unwrap();

        let err = repository::lock_node(txn.as_mut(), "ghost").await.unwrap_err();
        assert_eq!(err.code(), "ENTITY_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_occurrence_count_saturates() {
        let (_, engine) = engine();
        let s = student(&engine, "S1").await;
        let e = engine
            .upsert_node(NodeLabel::ErrorType, "errorTypeId", &json!("E1"), &Properties::new(), ConflictStrategy::default())
            .await
            .unwrap();

        let seeded = engine
            .upsert_relationship(
                &s.id,
                &e.id,
                RelationshipType::HasError,
                &props(json!({"occurrenceCount": i64::MAX})),
                ConflictStrategy::default(),
            )
            .await
            .unwrap();
        assert_eq!(seeded.occurrence_count(), Some(i64::MAX));

        let again = engine
            .upsert_relationship(&s.id, &e.id, RelationshipType::HasError, &Properties::new(), ConflictStrategy::default())
            .await
            .unwrap();
        assert_eq!(again.occurrence_count(), Some(i64::MAX));
        assert_eq!(again.weight, Some(i64::MAX as f64));
    }

    #[tokio::test]
    async fn test_concurrent_upserts_converge_on_one_node() {
        let store = MemoryStore::new().with_latency(Duration::from_millis(5));
        let engine = UpsertEngine::new(Arc::new(store.clone()));

        let writes = (0..2).map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .upsert_node(
                        NodeLabel::Student,
                        "studentId",
                        &json!("S-race"),
                        &props(json!({"writer": i})),
                        ConflictStrategy::default(),
                    )
                    .await
            })
        });
        let mut ids = Vec::new();
        for handle in writes.collect::<Vec<_>>() {
            ids.push(handle.await.unwrap().unwrap().id);
        }

        assert_eq!(ids[0], ids[1]);
        let students = store.nodes_with_label(NodeLabel::Student);
        assert_eq!(students.len(), 1);
        assert!(students[0].properties.contains_key("writer"));
    }
}
