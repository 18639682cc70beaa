//! Node and relationship repository.
//!
//! Existence lookups and raw persistence on top of an open
//! [`GraphTransaction`]. Store errors pass through with the repository
//! operation attached as context; their kind is unchanged.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use edugraph_core::model::{apply_patch, split_edge_keys, split_system_keys};
use edugraph_core::{GraphError, GraphResult, Node, NodeLabel, Properties, Relationship, RelationshipType};

use crate::store::{EdgeFilter, GraphTransaction};

/// Find a node by its business key.
pub async fn find_node(
    txn: &mut dyn GraphTransaction,
    label: NodeLabel,
    key_field: &str,
    key_value: &Value,
) -> GraphResult<Option<Node>> {
    txn.find_by_key(label, key_field, key_value)
        .await
        .map_err(|e| e.context(format!("find {label} by {key_field}")))
}

pub async fn get_node(txn: &mut dyn GraphTransaction, id: &str) -> GraphResult<Option<Node>> {
    txn.get_node(id).await.map_err(|e| e.context("get node"))
}

/// Like [`get_node`], failing with `EntityNotFound` when absent.
pub async fn require_node(txn: &mut dyn GraphTransaction, id: &str) -> GraphResult<Node> {
    get_node(txn, id).await?.ok_or_else(|| GraphError::node_not_found(id))
}

/// Write-lock a node for the rest of the transaction, then read it.
/// Fails with `EntityNotFound` when absent.
pub async fn lock_node(txn: &mut dyn GraphTransaction, id: &str) -> GraphResult<Node> {
    let found = txn.lock_node(id).await.map_err(|e| e.context("lock node"))?;
    if !found {
        return Err(GraphError::node_not_found(id));
    }
    require_node(txn, id).await
}

pub async fn list_nodes(
    txn: &mut dyn GraphTransaction,
    label: Option<NodeLabel>,
    limit: usize,
) -> GraphResult<Vec<Node>> {
    txn.list_nodes(label, limit).await.map_err(|e| e.context("list nodes"))
}

/// Find the relationship occupying a `(from, to, type)` triple.
pub async fn find_relationship(
    txn: &mut dyn GraphTransaction,
    from_id: &str,
    to_id: &str,
    rel_type: RelationshipType,
) -> GraphResult<Option<Relationship>> {
    txn.find_edge(from_id, to_id, rel_type)
        .await
        .map_err(|e| e.context(format!("find {rel_type} relationship")))
}

pub async fn get_relationship(txn: &mut dyn GraphTransaction, id: &str) -> GraphResult<Option<Relationship>> {
    txn.get_edge(id).await.map_err(|e| e.context("get relationship"))
}

pub async fn require_relationship(txn: &mut dyn GraphTransaction, id: &str) -> GraphResult<Relationship> {
    get_relationship(txn, id)
        .await?
        .ok_or_else(|| GraphError::relationship_not_found(id))
}

pub async fn list_relationships(
    txn: &mut dyn GraphTransaction,
    filter: &EdgeFilter,
) -> GraphResult<Vec<Relationship>> {
    txn.list_edges(filter).await.map_err(|e| e.context("list relationships"))
}

/// Create the node, or overwrite the stored node with the same id.
pub async fn persist_node(txn: &mut dyn GraphTransaction, node: &Node) -> GraphResult<Node> {
    let exists = get_node(txn, &node.id).await?.is_some();
    let result = if exists {
        txn.update(node).await.map_err(|e| e.context("update node"))
    } else {
        txn.create(node).await.map_err(|e| e.context("create node"))
    };
    if result.is_ok() {
        debug!(id = %node.id, label = %node.label, overwrite = exists, "Node persisted");
    }
    result
}

/// Create the relationship, or overwrite the stored one with the same id.
pub async fn persist_relationship(txn: &mut dyn GraphTransaction, rel: &Relationship) -> GraphResult<Relationship> {
    let exists = get_relationship(txn, &rel.id).await?.is_some();
    let result = if exists {
        txn.update_edge(rel).await.map_err(|e| e.context("update relationship"))
    } else {
        txn.create_edge(rel).await.map_err(|e| e.context("create relationship"))
    };
    if result.is_ok() {
        debug!(id = %rel.id, rel_type = %rel.rel_type, overwrite = exists, "Relationship persisted");
    }
    result
}

/// Apply a property patch to a node: keys in `patch` overwrite, `null`
/// removes, the rest is kept. System keys in the patch are ignored and the
/// business key cannot be removed.
pub async fn update_node_properties(
    txn: &mut dyn GraphTransaction,
    id: &str,
    patch: &Properties,
    now: DateTime<Utc>,
) -> GraphResult<Node> {
    let mut node = lock_node(txn, id).await?;
    let mut patch = patch.clone();
    split_system_keys(&mut patch);

    let key_field = node.label.key_field();
    if patch.get(key_field).is_some_and(Value::is_null) {
        return Err(GraphError::invalid_input(key_field, "business key cannot be removed"));
    }

    apply_patch(&mut node.properties, &patch);
    node.updated_at = now;
    persist_node(txn, &node).await
}

/// Apply a property patch to a relationship. A `weight` in the patch
/// replaces the stored weight.
pub async fn update_relationship_properties(
    txn: &mut dyn GraphTransaction,
    id: &str,
    patch: &Properties,
    now: DateTime<Utc>,
) -> GraphResult<Relationship> {
    let current = require_relationship(txn, id).await?;
    lock_node(txn, &current.from_node_id).await?;
    let mut rel = require_relationship(txn, id).await?;
    let mut patch = patch.clone();
    let system = split_edge_keys(&mut patch);

    apply_patch(&mut rel.properties, &patch);
    if system.weight.is_some() {
        rel.weight = system.weight;
    }
    rel.updated_at = now;
    persist_relationship(txn, &rel).await
}

/// Delete a node together with its relationships.
pub async fn delete_node(txn: &mut dyn GraphTransaction, id: &str) -> GraphResult<bool> {
    txn.delete_node(id).await.map_err(|e| e.context("delete node"))
}

pub async fn delete_relationship(txn: &mut dyn GraphTransaction, id: &str) -> GraphResult<bool> {
    txn.delete_edge(id).await.map_err(|e| e.context("delete relationship"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{GraphStore, MemoryStore};
    use serde_json::json;

    fn props(value: Value) -> Properties {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_persist_node_creates_then_overwrites() {
        let store = MemoryStore::new();
        let mut txn = store.begin_transaction().await.unwrap();

        let mut node = Node::new(NodeLabel::Course, props(json!({"courseId": "C1", "name": "Algebra"})), Utc::now());
        persist_node(txn.as_mut(), &node).await.unwrap();

        node.properties.insert("name".into(), "Algebra I".into());
        persist_node(txn.as_mut(), &node).await.unwrap();
        txn.commit().await.unwrap();

        let stored = store.nodes();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].properties["name"], "Algebra I");
    }

    #[tokio::test]
    async fn test_patch_semantics() {
        let store = MemoryStore::new();
        let mut txn = store.begin_transaction().await.unwrap();
        let node = Node::new(
            NodeLabel::Student,
            props(json!({"studentId": "S1", "name": "Bo", "grade": "7"})),
            Utc::now(),
        );
        persist_node(txn.as_mut(), &node).await.unwrap();

        let updated = update_node_properties(
            txn.as_mut(),
            &node.id,
            &props(json!({"grade": null, "club": "chess", "id": "hijack"})),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(updated.id, node.id);
        assert_eq!(updated.properties, props(json!({"studentId": "S1", "name": "Bo", "club": "chess"})));
    }

    #[tokio::test]
    async fn test_business_key_cannot_be_removed() {
        let store = MemoryStore::new();
        let mut txn = store.begin_transaction().await.unwrap();
        let node = Node::new(NodeLabel::Student, props(json!({"studentId": "S1"})), Utc::now());
        persist_node(txn.as_mut(), &node).await.unwrap();

        let err = update_node_properties(txn.as_mut(), &node.id, &props(json!({"studentId": null})), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.field(), Some("studentId"));
    }

    #[tokio::test]
    async fn test_missing_entities() {
        let store = MemoryStore::new();
        let mut txn = store.begin_transaction().await.unwrap();

        let err = update_relationship_properties(txn.as_mut(), "nope", &Properties::new(), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ENTITY_NOT_FOUND");
        assert!(!delete_node(txn.as_mut(), "nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_relationship_weight_patch() {
        let store = MemoryStore::new();
        let mut txn = store.begin_transaction().await.unwrap();
        let a = Node::new(NodeLabel::Teacher, props(json!({"teacherId": "T1"})), Utc::now());
        let b = Node::new(NodeLabel::Student, props(json!({"studentId": "S1"})), Utc::now());
        persist_node(txn.as_mut(), &a).await.unwrap();
        persist_node(txn.as_mut(), &b).await.unwrap();
        let rel = Relationship::new(RelationshipType::Teaches, &a.id, &b.id, Properties::new(), Utc::now());
        persist_relationship(txn.as_mut(), &rel).await.unwrap();

        let updated = update_relationship_properties(
            txn.as_mut(),
            &rel.id,
            &props(json!({"weight": 2.5, "subject": "math"})),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(updated.weight, Some(2.5));
        assert_eq!(updated.properties, props(json!({"subject": "math"})));

        let found = find_relationship(txn.as_mut(), &a.id, &b.id, RelationshipType::Teaches)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, rel.id);
        assert_eq!(list_relationships(txn.as_mut(), &EdgeFilter::touching(&b.id)).await.unwrap().len(), 1);
    }
}
