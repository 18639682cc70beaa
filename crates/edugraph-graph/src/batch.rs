//! Batch executor.
//!
//! Runs an ordered list of heterogeneous operations either inside one
//! transaction (all-or-nothing) or independently (mixed outcome). Later
//! operations may refer to nodes and relationships produced by earlier ones.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use edugraph_core::{ErrorDescriptor, GraphError, GraphResult, Node, NodeLabel, Properties, Relationship, RelationshipType};

use crate::repository;
use crate::resolver::ConflictStrategy;
use crate::store::{rollback_quietly, GraphStore, GraphTransaction};
use crate::upsert::{finish, upsert_node_in, upsert_relationship_in};

/// Reference to a node from inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRef {
    /// An existing node id.
    Id(String),
    /// The node holding this business key.
    Key { label: NodeLabel, value: Value },
    /// The node produced by an earlier operation of the same batch.
    Operation(usize),
}

/// Reference to a relationship from inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipRef {
    Id(String),
    Operation(usize),
}

/// One step of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchOperation {
    /// Upsert a node by its label's business key, which must be in `properties`.
    CreateNode {
        label: NodeLabel,
        #[serde(default)]
        properties: Properties,
        #[serde(default)]
        strategy: ConflictStrategy,
    },
    /// Patch an existing node.
    UpdateNode {
        node: NodeRef,
        #[serde(default)]
        properties: Properties,
    },
    /// Upsert the relationship identified by `(from, to, type)`.
    CreateRelationship {
        from: NodeRef,
        to: NodeRef,
        #[serde(rename = "type")]
        rel_type: RelationshipType,
        #[serde(default)]
        properties: Properties,
        #[serde(default)]
        strategy: ConflictStrategy,
    },
    /// Patch an existing relationship.
    UpdateRelationship {
        relationship: RelationshipRef,
        #[serde(default)]
        properties: Properties,
    },
}

impl BatchOperation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateNode { .. } => "create_node",
            Self::UpdateNode { .. } => "update_node",
            Self::CreateRelationship { .. } => "create_relationship",
            Self::UpdateRelationship { .. } => "update_relationship",
        }
    }
}

/// Result of one successful operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OperationOutcome {
    Node(Node),
    Relationship(Relationship),
}

impl OperationOutcome {
    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Self::Node(node) => Some(node),
            Self::Relationship(_) => None,
        }
    }

    pub fn as_relationship(&self) -> Option<&Relationship> {
        match self {
            Self::Relationship(rel) => Some(rel),
            Self::Node(_) => None,
        }
    }
}

/// Lifecycle of one batch invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchState {
    Idle,
    Running,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    PartiallyCompleted,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::PartiallyCompleted)
    }
}

/// Outcome of [`BatchExecutor::execute_batch`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub success: bool,
    pub state: BatchState,
    pub operations_count: usize,
    pub successful_operations: usize,
    pub failed_operations: usize,
    /// One slot per operation, `None` where it failed or was rolled back.
    pub results: Vec<Option<OperationOutcome>>,
    pub errors: Vec<ErrorDescriptor>,
    pub elapsed_ms: u64,
}

/// Tracks state transitions for logging.
struct Run {
    state: BatchState,
    started: Instant,
}

impl Run {
    fn start() -> Self {
        Self {
            state: BatchState::Idle,
            started: Instant::now(),
        }
    }

    fn enter(&mut self, next: BatchState) {
        debug!(from = ?self.state, to = ?next, terminal = next.is_terminal(), "Batch state change");
        self.state = next;
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Failure inside a transactional attempt.
struct Abort {
    index: Option<usize>,
    operation: &'static str,
    error: GraphError,
}

/// Executes batches against a store.
#[derive(Clone)]
pub struct BatchExecutor {
    store: Arc<dyn GraphStore>,
}

impl BatchExecutor {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Execute `operations` in order.
    ///
    /// In transactional mode a failure rolls everything back and every result
    /// slot is `None`; a unique-constraint race reruns the whole batch once in
    /// a fresh transaction. In independent mode each operation commits on its
    /// own and failures do not stop the run. Only a failure to open the
    /// transaction is returned as `Err`.
    pub async fn execute_batch(
        &self,
        operations: &[BatchOperation],
        use_transaction: bool,
    ) -> GraphResult<BatchResult> {
        let mut run = Run::start();
        if operations.is_empty() {
            run.enter(BatchState::Committed);
            return Ok(BatchResult {
                success: true,
                state: run.state,
                operations_count: 0,
                successful_operations: 0,
                failed_operations: 0,
                results: Vec::new(),
                errors: Vec::new(),
                elapsed_ms: run.elapsed_ms(),
            });
        }

        run.enter(BatchState::Running);
        info!(operations = operations.len(), transactional = use_transaction, "Executing batch");
        if use_transaction {
            self.execute_transactional(operations, run).await
        } else {
            Ok(self.execute_independent(operations, run).await)
        }
    }

    async fn execute_transactional(&self, operations: &[BatchOperation], mut run: Run) -> GraphResult<BatchResult> {
        let mut attempt = self.attempt_transaction(operations, &mut run).await?;
        if let Err(abort) = &attempt {
            if abort.error.is_constraint_violation() {
                warn!(error = %abort.error, "Constraint violation in batch, retrying once");
                run.enter(BatchState::Running);
                attempt = self.attempt_transaction(operations, &mut run).await?;
            }
        }

        let count = operations.len();
        let result = match attempt {
            Ok(results) => {
                run.enter(BatchState::Committed);
                BatchResult {
                    success: true,
                    state: run.state,
                    operations_count: count,
                    successful_operations: count,
                    failed_operations: 0,
                    results: results.into_iter().map(Some).collect(),
                    errors: Vec::new(),
                    elapsed_ms: run.elapsed_ms(),
                }
            }
            Err(abort) => BatchResult {
                success: false,
                state: run.state,
                operations_count: count,
                successful_operations: 0,
                failed_operations: count,
                results: vec![None; count],
                errors: vec![abort.error.describe(abort.index, abort.operation)],
                elapsed_ms: run.elapsed_ms(),
            },
        };
        info!(
            success = result.success,
            state = ?result.state,
            elapsed_ms = result.elapsed_ms,
            "Transactional batch finished"
        );
        Ok(result)
    }

    /// One transactional pass. The outer `Err` is a failure to begin.
    async fn attempt_transaction(
        &self,
        operations: &[BatchOperation],
        run: &mut Run,
    ) -> GraphResult<Result<Vec<OperationOutcome>, Abort>> {
        let mut txn = self.store.begin_transaction().await?;
        let now = Utc::now();
        let mut done: Vec<Option<OperationOutcome>> = Vec::with_capacity(operations.len());

        for (index, op) in operations.iter().enumerate() {
            match apply_operation(txn.as_mut(), op, &done, now).await {
                Ok(outcome) => done.push(Some(outcome)),
                Err(error) => {
                    warn!(index, operation = op.name(), error = %error, "Batch operation failed, rolling back");
                    run.enter(BatchState::RollingBack);
                    rollback_quietly(txn).await;
                    run.enter(BatchState::RolledBack);
                    return Ok(Err(Abort {
                        index: Some(index),
                        operation: op.name(),
                        error,
                    }));
                }
            }
        }

        run.enter(BatchState::Committing);
        if let Err(error) = txn.commit().await {
            warn!(error = %error, "Batch commit failed");
            run.enter(BatchState::RolledBack);
            return Ok(Err(Abort {
                index: None,
                operation: "commit",
                error,
            }));
        }
        Ok(Ok(done.into_iter().flatten().collect()))
    }

    async fn execute_independent(&self, operations: &[BatchOperation], mut run: Run) -> BatchResult {
        let mut results: Vec<Option<OperationOutcome>> = Vec::with_capacity(operations.len());
        let mut errors = Vec::new();

        for (index, op) in operations.iter().enumerate() {
            match self.apply_alone(op, &results).await {
                Ok(outcome) => results.push(Some(outcome)),
                Err(error) => {
                    warn!(index, operation = op.name(), error = %error, "Batch operation failed");
                    errors.push(error.describe(Some(index), op.name()));
                    results.push(None);
                }
            }
        }

        let failed = errors.len();
        run.enter(if failed == 0 {
            BatchState::Committed
        } else {
            BatchState::PartiallyCompleted
        });
        info!(
            successful = operations.len() - failed,
            failed,
            state = ?run.state,
            "Independent batch finished"
        );
        BatchResult {
            success: failed == 0,
            state: run.state,
            operations_count: operations.len(),
            successful_operations: operations.len() - failed,
            failed_operations: failed,
            results,
            errors,
            elapsed_ms: run.elapsed_ms(),
        }
    }

    /// Run a single operation in its own transaction, retrying a
    /// constraint race once.
    async fn apply_alone(&self, op: &BatchOperation, done: &[Option<OperationOutcome>]) -> GraphResult<OperationOutcome> {
        match self.apply_once(op, done).await {
            Err(e) if e.is_constraint_violation() => {
                warn!(operation = op.name(), error = %e, "Constraint violation, retrying operation once");
                self.apply_once(op, done).await
            }
            other => other,
        }
    }

    async fn apply_once(&self, op: &BatchOperation, done: &[Option<OperationOutcome>]) -> GraphResult<OperationOutcome> {
        let mut txn = self.store.begin_transaction().await?;
        let result = apply_operation(txn.as_mut(), op, done, Utc::now()).await;
        finish(txn, result).await
    }
}

/// Apply one operation inside `txn`. `done` holds the outcomes of the
/// operations before it.
pub async fn apply_operation(
    txn: &mut dyn GraphTransaction,
    op: &BatchOperation,
    done: &[Option<OperationOutcome>],
    now: DateTime<Utc>,
) -> GraphResult<OperationOutcome> {
    match op {
        BatchOperation::CreateNode {
            label,
            properties,
            strategy,
        } => {
            let key_field = label.key_field();
            let key_value = properties
                .get(key_field)
                .filter(|v| !v.is_null())
                .ok_or_else(|| GraphError::invalid_input(key_field, format!("{label} requires '{key_field}'")))?;
            upsert_node_in(txn, *label, key_field, key_value, properties, *strategy, now)
                .await
                .map(OperationOutcome::Node)
        }
        BatchOperation::UpdateNode { node, properties } => {
            let id = resolve_node(txn, node, done).await?;
            repository::update_node_properties(txn, &id, properties, now)
                .await
                .map(OperationOutcome::Node)
        }
        BatchOperation::CreateRelationship {
            from,
            to,
            rel_type,
            properties,
            strategy,
        } => {
            let from_id = resolve_node(txn, from, done).await?;
            let to_id = resolve_node(txn, to, done).await?;
            upsert_relationship_in(txn, &from_id, &to_id, *rel_type, properties, *strategy, now)
                .await
                .map(OperationOutcome::Relationship)
        }
        BatchOperation::UpdateRelationship {
            relationship,
            properties,
        } => {
            let id = resolve_relationship(relationship, done)?;
            repository::update_relationship_properties(txn, &id, properties, now)
                .await
                .map(OperationOutcome::Relationship)
        }
    }
}

async fn resolve_node(
    txn: &mut dyn GraphTransaction,
    node: &NodeRef,
    done: &[Option<OperationOutcome>],
) -> GraphResult<String> {
    match node {
        NodeRef::Id(id) => Ok(id.clone()),
        NodeRef::Key { label, value } => repository::find_node(txn, *label, label.key_field(), value)
            .await?
            .map(|n| n.id)
            .ok_or_else(|| GraphError::node_not_found(format!("{label} {}={value}", label.key_field()))),
        NodeRef::Operation(index) => earlier(done, *index)?
            .as_node()
            .map(|n| n.id.clone())
            .ok_or_else(|| GraphError::invalid_input("operation", format!("operation {index} did not produce a node"))),
    }
}

fn resolve_relationship(rel: &RelationshipRef, done: &[Option<OperationOutcome>]) -> GraphResult<String> {
    match rel {
        RelationshipRef::Id(id) => Ok(id.clone()),
        RelationshipRef::Operation(index) => earlier(done, *index)?
            .as_relationship()
            .map(|r| r.id.clone())
            .ok_or_else(|| {
                GraphError::invalid_input("operation", format!("operation {index} did not produce a relationship"))
            }),
    }
}

fn earlier(done: &[Option<OperationOutcome>], index: usize) -> GraphResult<&OperationOutcome> {
    match done.get(index) {
        Some(Some(outcome)) => Ok(outcome),
        Some(None) => Err(GraphError::invalid_input(
            "operation",
            format!("operation {index} failed, nothing to refer to"),
        )),
        None => Err(GraphError::invalid_input(
            "operation",
            format!("operation {index} has not run yet"),
        )),
    }
}
