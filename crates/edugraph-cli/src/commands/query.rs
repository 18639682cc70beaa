//! Read-only graph queries: neighbourhoods, paths and node details.

use anyhow::{bail, Result};
use colored::Colorize;
use edugraph_core::{NodeLabel, RelationshipType};
use edugraph_graph::{PathQuery, SubgraphQuery, UpsertEngine};

use super::Backend;
use crate::output;

pub struct SubgraphArgs {
    pub root_id: String,
    pub depth: usize,
    pub max_nodes: usize,
    pub max_relationships: usize,
    pub labels: Vec<NodeLabel>,
    pub rel_types: Vec<RelationshipType>,
}

pub async fn cmd_subgraph(backend: &Backend, args: SubgraphArgs) -> Result<()> {
    let query = SubgraphQuery {
        max_nodes: args.max_nodes,
        max_relationships: args.max_relationships,
        labels: args.labels,
        rel_types: args.rel_types,
        ..SubgraphQuery::new(args.root_id, args.depth)
    };
    let subgraph = UpsertEngine::new(backend.store.clone()).subgraph(&query).await?;

    eprintln!(
        "{} {} nodes, {} relationships within depth {}",
        "Subgraph".cyan().bold(),
        subgraph.metadata.node_count,
        subgraph.metadata.relationship_count,
        subgraph.metadata.depth
    );
    output::print_json(&subgraph)
}

pub async fn cmd_path(
    backend: &Backend,
    from_id: String,
    to_id: String,
    max_depth: usize,
    limit: usize,
    rel_types: Vec<RelationshipType>,
) -> Result<()> {
    let query = PathQuery {
        limit,
        rel_types,
        ..PathQuery::new(from_id, to_id, max_depth)
    };
    let paths = UpsertEngine::new(backend.store.clone()).find_paths(&query).await?;

    match paths.first() {
        Some(shortest) => eprintln!(
            "{} {} found, shortest has {} hops",
            "Paths".cyan().bold(),
            paths.len(),
            shortest.length
        ),
        None => eprintln!("{}", "No path found".yellow()),
    }
    output::print_json(&paths)
}

pub async fn cmd_node(backend: &Backend, id: &str) -> Result<()> {
    let Some(details) = UpsertEngine::new(backend.store.clone()).node_details(id).await? else {
        bail!("node {id} not found");
    };
    eprintln!(
        "{} {} with {} relationships to {} neighbours",
        details.node.label.to_string().cyan().bold(),
        details.node.id,
        details.relationships.len(),
        details.neighbour_count
    );
    output::print_json(&details)
}
