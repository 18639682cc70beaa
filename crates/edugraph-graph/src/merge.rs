//! Duplicate node merge.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use edugraph_core::model::{FIRST_OCCURRENCE, LAST_OCCURRENCE, OCCURRENCE_COUNT};
use edugraph_core::{GraphError, GraphResult, Node, Relationship};

use crate::repository;
use crate::resolver::{resolve, ConflictStrategy, Snapshot};
use crate::store::{EdgeFilter, GraphStore, GraphTransaction};
use crate::upsert::finish;

/// What a merge did.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub kept: Node,
    pub removed_id: String,
    /// Relationships moved onto the kept node.
    pub redirected: usize,
    /// Relationships folded into an existing relationship with the same triple.
    pub folded: usize,
    /// Relationships between the two nodes, which would have become self-loops.
    pub dropped_self_loops: usize,
}

/// Merge `duplicate_id` into `keep_id` in one transaction.
pub async fn merge_nodes(
    store: &Arc<dyn GraphStore>,
    keep_id: &str,
    duplicate_id: &str,
    strategy: ConflictStrategy,
) -> GraphResult<MergeReport> {
    let mut txn = store.begin_transaction().await?;
    let result = merge_nodes_in(txn.as_mut(), keep_id, duplicate_id, strategy, Utc::now()).await;
    finish(txn, result).await
}

/// Merge inside `txn`: resolve the duplicate's properties into the kept
/// node (whose business key never changes), move the duplicate's
/// relationships over, then delete the duplicate.
pub async fn merge_nodes_in(
    txn: &mut dyn GraphTransaction,
    keep_id: &str,
    duplicate_id: &str,
    strategy: ConflictStrategy,
    now: DateTime<Utc>,
) -> GraphResult<MergeReport> {
    if keep_id == duplicate_id {
        return Err(GraphError::invalid_input("duplicateId", "cannot merge a node into itself"));
    }
    let mut keep = repository::require_node(txn, keep_id).await?;
    let duplicate = repository::require_node(txn, duplicate_id).await?;
    if keep.label != duplicate.label {
        return Err(GraphError::invalid_input(
            "duplicateId",
            format!("cannot merge {} into {}", duplicate.label, keep.label),
        ));
    }

    let mut report = MergeReport {
        kept: keep.clone(),
        removed_id: duplicate_id.to_string(),
        redirected: 0,
        folded: 0,
        dropped_self_loops: 0,
    };

    let edges = repository::list_relationships(txn, &EdgeFilter::touching(duplicate_id)).await?;
    for edge in edges {
        let from = if edge.from_node_id == duplicate_id { keep_id } else { edge.from_node_id.as_str() };
        let to = if edge.to_node_id == duplicate_id { keep_id } else { edge.to_node_id.as_str() };

        repository::delete_relationship(txn, &edge.id).await?;
        if from == to {
            report.dropped_self_loops += 1;
            continue;
        }

        match repository::find_relationship(txn, from, to, edge.rel_type).await? {
            Some(mut target) => {
                fold_into(&mut target, &edge, now);
                repository::persist_relationship(txn, &target).await?;
                report.folded += 1;
            }
            None => {
                let mut moved = edge.clone();
                moved.from_node_id = from.to_string();
                moved.to_node_id = to.to_string();
                moved.updated_at = now;
                repository::persist_relationship(txn, &moved).await?;
                report.redirected += 1;
            }
        }
        debug!(edge = %edge.id, rel_type = %edge.rel_type, "Relationship moved off duplicate");
    }

    repository::delete_node(txn, duplicate_id).await?;

    let key_field = keep.label.key_field();
    let mut resolved = resolve(
        Snapshot::new(&keep.properties, Some(keep.updated_at)),
        Snapshot::new(&duplicate.properties, Some(duplicate.updated_at)),
        strategy,
        now,
    )
    .properties;
    match keep.properties.get(key_field) {
        Some(key) => resolved.insert(key_field.to_string(), key.clone()),
        None => resolved.remove(key_field),
    };
    keep.properties = resolved;
    keep.updated_at = now;
    report.kept = repository::persist_node(txn, &keep).await?;

    info!(
        kept = keep_id,
        removed = duplicate_id,
        strategy = %strategy,
        redirected = report.redirected,
        folded = report.folded,
        dropped = report.dropped_self_loops,
        "Nodes merged"
    );
    Ok(report)
}

/// Fold `source` into `target`, which holds the same triple. Target values
/// win on key collisions; occurrence counters add up and the occurrence
/// window widens to cover both.
fn fold_into(target: &mut Relationship, source: &Relationship, now: DateTime<Utc>) {
    for (key, value) in &source.properties {
        target.properties.entry(key.clone()).or_insert_with(|| value.clone());
    }

    if target.is_occurrence_tracked() || source.is_occurrence_tracked() {
        let count = target
            .occurrence_count()
            .unwrap_or(1)
            .saturating_add(source.occurrence_count().unwrap_or(1));
        target.properties.insert(OCCURRENCE_COUNT.to_string(), Value::from(count));
        target.weight = Some(count as f64);

        let pick = |key: &str, earliest: bool| {
            let a = target.properties.get(key).and_then(Value::as_str);
            let b = source.properties.get(key).and_then(Value::as_str);
            match (a, b) {
                (Some(a), Some(b)) => {
                    let chosen = if (a <= b) == earliest { a } else { b };
                    Some(chosen.to_string())
                }
                (a, b) => a.or(b).map(str::to_string),
            }
        };
        let first = pick(FIRST_OCCURRENCE, true);
        let last = pick(LAST_OCCURRENCE, false);
        if let Some(first) = first {
            target.properties.insert(FIRST_OCCURRENCE.to_string(), Value::from(first));
        }
        if let Some(last) = last {
            target.properties.insert(LAST_OCCURRENCE.to_string(), Value::from(last));
        }
    } else if target.weight.is_none() {
        target.weight = source.weight;
    }
    target.updated_at = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::upsert::UpsertEngine;
    use edugraph_core::{NodeLabel, Properties, RelationshipType};
    use serde_json::json;

    fn props(value: Value) -> Properties {
        serde_json::from_value(value).unwrap()
    }

    async fn node(engine: &UpsertEngine, label: NodeLabel, key: &str, extra: Value) -> Node {
        engine
            .upsert_node(label, label.key_field(), &json!(key), &props(extra), ConflictStrategy::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_merge_moves_and_folds_relationships() {
        let store = MemoryStore::new();
        let shared: Arc<dyn GraphStore> = Arc::new(store.clone());
        let engine = UpsertEngine::new(shared.clone());

        let keep = node(&engine, NodeLabel::Student, "S1", json!({"name": "Ana"})).await;
        let dup = node(&engine, NodeLabel::Student, "S1-dup", json!({"name": "Ana B.", "grade": "8"})).await;
        let friend = node(&engine, NodeLabel::Student, "S2", json!({})).await;
        let error = node(&engine, NodeLabel::ErrorType, "E1", json!({})).await;

        let none = Properties::new();
        let strategy = ConflictStrategy::default();
        engine.upsert_relationship(&dup.id, &friend.id, RelationshipType::ChatWith, &none, strategy).await.unwrap();
        engine.upsert_relationship(&keep.id, &dup.id, RelationshipType::Likes, &none, strategy).await.unwrap();
        for _ in 0..2 {
            engine.upsert_relationship(&keep.id, &error.id, RelationshipType::HasError, &none, strategy).await.unwrap();
        }
        for _ in 0..3 {
            engine.upsert_relationship(&dup.id, &error.id, RelationshipType::HasError, &none, strategy).await.unwrap();
        }

        let report = merge_nodes(&shared, &keep.id, &dup.id, ConflictStrategy::MergeProperties)
            .await
            .unwrap();

        assert_eq!((report.redirected, report.folded, report.dropped_self_loops), (1, 1, 1));
        assert_eq!(
            report.kept.properties,
            props(json!({"studentId": "S1", "name": "Ana", "grade": "8"}))
        );
        assert!(store.nodes().iter().all(|n| n.id != dup.id));

        let edges = store.relationships();
        assert_eq!(edges.len(), 2);
        let has_error = edges.iter().find(|r| r.rel_type == RelationshipType::HasError).unwrap();
        assert_eq!(has_error.occurrence_count(), Some(5));
        assert_eq!(has_error.weight, Some(5.0));
        let chat = edges.iter().find(|r| r.rel_type == RelationshipType::ChatWith).unwrap();
        assert_eq!(chat.from_node_id, keep.id);
    }

    #[test]
    fn test_fold_saturates_occurrence_count() {
        let now = Utc::now();
        let mut target = Relationship::new(
            RelationshipType::HasError,
            "s",
            "e",
            props(json!({"occurrenceCount": i64::MAX})),
            now,
        );
        let source = Relationship::new(
            RelationshipType::HasError,
            "dup",
            "e",
            props(json!({"occurrenceCount": 4})),
            now,
        );

        fold_into(&mut target, &source, now);

        assert_eq!(target.occurrence_count(), Some(i64::MAX));
        assert_eq!(target.weight, Some(i64::MAX as f64));
    }

    #[tokio::test]
    async fn test_timestamp_priority_keeps_business_key() {
        let store = MemoryStore::new();
        let shared: Arc<dyn GraphStore> = Arc::new(store.clone());
        let engine = UpsertEngine::new(shared.clone());

        let keep = node(&engine, NodeLabel::Course, "C1", json!({"title": "Old"})).await;
        let dup = node(&engine, NodeLabel::Course, "C1-copy", json!({"title": "New"})).await;

        let report = merge_nodes(&shared, &keep.id, &dup.id, ConflictStrategy::TimestampPriority)
            .await
            .unwrap();

        assert_eq!(report.kept.id, keep.id);
        assert_eq!(report.kept.properties, props(json!({"courseId": "C1", "title": "New"})));
    }

    #[tokio::test]
    async fn test_merge_validation() {
        let store = MemoryStore::new();
        let shared: Arc<dyn GraphStore> = Arc::new(store.clone());
        let engine = UpsertEngine::new(shared.clone());
        let student = node(&engine, NodeLabel::Student, "S1", json!({})).await;
        let course = node(&engine, NodeLabel::Course, "C1", json!({})).await;

        let same = merge_nodes(&shared, &student.id, &student.id, ConflictStrategy::default()).await.unwrap_err();
        assert!(same.is_validation());

        let mixed = merge_nodes(&shared, &student.id, &course.id, ConflictStrategy::default()).await.unwrap_err();
        assert_eq!(mixed.field(), Some("duplicateId"));

        let missing = merge_nodes(&shared, &student.id, "ghost", ConflictStrategy::default()).await.unwrap_err();
        assert_eq!(missing.code(), "ENTITY_NOT_FOUND");
        assert_eq!(store.nodes().len(), 2);
    }
}
