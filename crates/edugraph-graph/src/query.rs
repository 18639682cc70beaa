//! Graph exploration queries.
//!
//! Read-side views over the graph: the neighbourhood subgraph around a
//! node, paths between two nodes, and a node with its adjacent
//! relationships. Traversals ignore edge direction.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, info};

use edugraph_core::{GraphError, GraphResult, Node, NodeLabel, Relationship, RelationshipType};

use crate::repository;
use crate::store::{EdgeFilter, GraphTransaction};

/// Deepest traversal any query runs; deeper requests are capped.
pub const MAX_TRAVERSAL_DEPTH: usize = 6;

pub const DEFAULT_MAX_NODES: usize = 1000;
pub const DEFAULT_MAX_RELATIONSHIPS: usize = 5000;
pub const DEFAULT_PATH_LIMIT: usize = 5;

/// Neighbourhood of `root_id` up to `depth` hops.
#[derive(Debug, Clone, PartialEq)]
pub struct SubgraphQuery {
    pub root_id: String,
    pub depth: usize,
    pub max_nodes: usize,
    pub max_relationships: usize,
    /// Node labels to keep; empty keeps all. The root is always kept.
    pub labels: Vec<NodeLabel>,
    /// Relationship types to traverse and return; empty allows all.
    pub rel_types: Vec<RelationshipType>,
}

impl SubgraphQuery {
    pub fn new(root_id: impl Into<String>, depth: usize) -> Self {
        Self {
            root_id: root_id.into(),
            depth,
            max_nodes: DEFAULT_MAX_NODES,
            max_relationships: DEFAULT_MAX_RELATIONSHIPS,
            labels: Vec::new(),
            rel_types: Vec::new(),
        }
    }

    pub fn validate(&self) -> GraphResult<()> {
        if self.depth == 0 {
            return Err(GraphError::invalid_input("depth", "depth must be at least 1"));
        }
        if self.max_nodes == 0 {
            return Err(GraphError::invalid_input("maxNodes", "maxNodes must be greater than 0"));
        }
        if self.max_relationships == 0 {
            return Err(GraphError::invalid_input(
                "maxRelationships",
                "maxRelationships must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn effective_depth(&self) -> usize {
        self.depth.min(MAX_TRAVERSAL_DEPTH)
    }

    pub fn admits_node(&self, node: &Node) -> bool {
        node.id == self.root_id || self.labels.is_empty() || self.labels.contains(&node.label)
    }

    pub fn admits_type(&self, rel_type: RelationshipType) -> bool {
        self.rel_types.is_empty() || self.rel_types.contains(&rel_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubgraphMetadata {
    pub node_count: usize,
    pub relationship_count: usize,
    pub depth: usize,
    pub max_nodes: usize,
    pub max_relationships: usize,
}

/// Nodes around a root, nearest first, and the relationships among them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subgraph {
    pub nodes: Vec<Node>,
    pub relationships: Vec<Relationship>,
    pub metadata: SubgraphMetadata,
}

impl Subgraph {
    /// Apply the query's caps and fill in the metadata. `nodes` must already
    /// be ordered nearest first.
    pub fn assemble(query: &SubgraphQuery, mut nodes: Vec<Node>, relationships: Vec<Relationship>) -> Self {
        nodes.truncate(query.max_nodes);
        let kept: BTreeSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let relationships: Vec<Relationship> = relationships
            .into_iter()
            .filter(|r| {
                query.admits_type(r.rel_type)
                    && kept.contains(r.from_node_id.as_str())
                    && kept.contains(r.to_node_id.as_str())
            })
            .take(query.max_relationships)
            .collect();

        Self {
            metadata: SubgraphMetadata {
                node_count: nodes.len(),
                relationship_count: relationships.len(),
                depth: query.effective_depth(),
                max_nodes: query.max_nodes,
                max_relationships: query.max_relationships,
            },
            nodes,
            relationships,
        }
    }
}

/// Paths between two nodes of at most `max_depth` hops.
#[derive(Debug, Clone, PartialEq)]
pub struct PathQuery {
    pub from_id: String,
    pub to_id: String,
    pub max_depth: usize,
    pub limit: usize,
    /// Relationship types a path may use; empty allows all.
    pub rel_types: Vec<RelationshipType>,
}

impl PathQuery {
    pub fn new(from_id: impl Into<String>, to_id: impl Into<String>, max_depth: usize) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: to_id.into(),
            max_depth,
            limit: DEFAULT_PATH_LIMIT,
            rel_types: Vec::new(),
        }
    }

    pub fn validate(&self) -> GraphResult<()> {
        if self.max_depth == 0 {
            return Err(GraphError::invalid_input("maxDepth", "maxDepth must be at least 1"));
        }
        if self.limit == 0 {
            return Err(GraphError::invalid_input("limit", "limit must be greater than 0"));
        }
        Ok(())
    }

    pub fn effective_depth(&self) -> usize {
        self.max_depth.min(MAX_TRAVERSAL_DEPTH)
    }

    pub fn admits_type(&self, rel_type: RelationshipType) -> bool {
        self.rel_types.is_empty() || self.rel_types.contains(&rel_type)
    }
}

/// A simple path: `nodes[i]` and `nodes[i + 1]` are joined by `relationships[i]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphPath {
    pub nodes: Vec<Node>,
    pub relationships: Vec<Relationship>,
    pub length: usize,
}

/// A node with every relationship touching it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDetails {
    pub node: Node,
    pub relationships: Vec<Relationship>,
    pub relationship_type_counts: BTreeMap<RelationshipType, usize>,
    /// Distinct nodes at the other end of those relationships.
    pub neighbour_count: usize,
}

/// Neighbourhood subgraph inside `txn`. An unknown root yields an empty subgraph.
pub async fn subgraph_in(txn: &mut dyn GraphTransaction, query: &SubgraphQuery) -> GraphResult<Subgraph> {
    query.validate()?;
    if query.depth > MAX_TRAVERSAL_DEPTH {
        debug!(requested = query.depth, cap = MAX_TRAVERSAL_DEPTH, "Subgraph depth capped");
    }

    let subgraph = txn
        .subgraph(query)
        .await
        .map_err(|e| e.context(format!("subgraph around {}", query.root_id)))?;
    info!(
        root = %query.root_id,
        depth = subgraph.metadata.depth,
        nodes = subgraph.metadata.node_count,
        relationships = subgraph.metadata.relationship_count,
        "Subgraph queried"
    );
    Ok(subgraph)
}

/// Paths between two existing nodes inside `txn`, shortest first. A node is
/// joined to itself by a single path of length zero.
pub async fn find_paths_in(txn: &mut dyn GraphTransaction, query: &PathQuery) -> GraphResult<Vec<GraphPath>> {
    query.validate()?;
    let from = repository::require_node(txn, &query.from_id).await?;
    if query.from_id == query.to_id {
        return Ok(vec![GraphPath {
            nodes: vec![from],
            relationships: Vec::new(),
            length: 0,
        }]);
    }
    repository::require_node(txn, &query.to_id).await?;

    let paths = txn
        .find_paths(query)
        .await
        .map_err(|e| e.context(format!("paths {} -> {}", query.from_id, query.to_id)))?;
    info!(
        from = %query.from_id,
        to = %query.to_id,
        found = paths.len(),
        shortest = ?paths.first().map(|p| p.length),
        "Paths queried"
    );
    Ok(paths)
}

/// A node and its adjacent relationships, or `None` when it does not exist.
pub async fn node_details_in(txn: &mut dyn GraphTransaction, id: &str) -> GraphResult<Option<NodeDetails>> {
    let Some(node) = repository::get_node(txn, id).await? else {
        return Ok(None);
    };
    let relationships = repository::list_relationships(txn, &EdgeFilter::touching(id)).await?;

    let mut relationship_type_counts = BTreeMap::new();
    let mut neighbours = BTreeSet::new();
    for rel in &relationships {
        *relationship_type_counts.entry(rel.rel_type).or_insert(0) += 1;
        let other = if rel.from_node_id == id { &rel.to_node_id } else { &rel.from_node_id };
        if other != id {
            neighbours.insert(other.as_str());
        }
    }
    let neighbour_count = neighbours.len();

    Ok(Some(NodeDetails {
        node,
        relationships,
        relationship_type_counts,
        neighbour_count,
    }))
}
