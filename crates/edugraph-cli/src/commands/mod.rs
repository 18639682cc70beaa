//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edugraph_core::{LogFormat, NodeLabel, RelationshipType, Settings};
use edugraph_graph::query::{DEFAULT_MAX_NODES, DEFAULT_MAX_RELATIONSHIPS, DEFAULT_PATH_LIMIT};
use edugraph_graph::{ConflictStrategy, GraphClient, GraphStore, MemoryStore, Neo4jStore};
use tracing::{info, warn};

pub mod batch;
pub mod graph;
pub mod merge;
pub mod query;
pub mod upsert;

/// EduGraph - incremental knowledge graph upserts and batches
#[derive(Parser)]
#[command(name = "edugraph")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to a TOML settings file
    #[arg(short, long, global = true, env = "EDUGRAPH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Run against a throwaway in-memory graph instead of Neo4j
    #[arg(long, global = true)]
    pub in_memory: bool,

    /// Log output format (console or json)
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create uniqueness constraints and indexes
    Schema,

    /// Show node and relationship counts
    Status,

    /// Create or update one node by its business key
    UpsertNode {
        /// Node label (Student, Teacher, Course, KnowledgePoint, ErrorType)
        label: NodeLabel,
        /// Business key value
        value: String,
        /// Properties as a JSON object
        #[arg(long, default_value = "{}")]
        props: String,
        /// Conflict resolution strategy
        #[arg(long, default_value = "TIMESTAMP_PRIORITY")]
        strategy: ConflictStrategy,
    },

    /// Execute a JSON file of batch operations
    Batch {
        /// File holding a JSON array of operations
        file: PathBuf,
        /// Commit each operation on its own instead of all-or-nothing
        #[arg(long)]
        no_transaction: bool,
    },

    /// Import a JSON file of interaction records
    Import {
        /// File holding a JSON array of records
        file: PathBuf,
        /// Records per chunk (defaults to import.batch_size)
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Merge a duplicate node into the node to keep
    Merge {
        /// Id of the node that survives
        keep_id: String,
        /// Id of the node that is folded in and deleted
        duplicate_id: String,
        /// Conflict resolution strategy for properties
        #[arg(long, default_value = "MERGE_PROPERTIES")]
        strategy: ConflictStrategy,
    },

    /// Print the neighbourhood of a node as JSON
    Subgraph {
        /// Id of the node at the centre
        root_id: String,
        /// Hops to follow from the root (capped at 6)
        #[arg(long, default_value_t = 2)]
        depth: usize,
        #[arg(long, default_value_t = DEFAULT_MAX_NODES)]
        max_nodes: usize,
        #[arg(long, default_value_t = DEFAULT_MAX_RELATIONSHIPS)]
        max_relationships: usize,
        /// Only include nodes with this label (repeatable)
        #[arg(long = "label")]
        labels: Vec<NodeLabel>,
        /// Only follow this relationship type (repeatable)
        #[arg(long = "rel-type")]
        rel_types: Vec<RelationshipType>,
    },

    /// Find the shortest paths between two nodes
    Path {
        from_id: String,
        to_id: String,
        /// Longest path to consider, in hops
        #[arg(long, default_value_t = 4)]
        max_depth: usize,
        #[arg(long, default_value_t = DEFAULT_PATH_LIMIT)]
        limit: usize,
        /// Only follow this relationship type (repeatable)
        #[arg(long = "rel-type")]
        rel_types: Vec<RelationshipType>,
    },

    /// Show a node with its relationships and neighbour count
    Node {
        id: String,
    },
}

/// The store a command runs against.
pub struct Backend {
    pub store: Arc<dyn GraphStore>,
    /// Present only for Neo4j; the in-memory store has no schema.
    pub client: Option<GraphClient>,
}

impl Backend {
    async fn open(settings: &Settings, in_memory: bool) -> Result<Self> {
        let backend = if in_memory {
            let store = MemoryStore::new().with_timeout(settings.neo4j.query_timeout());
            Self {
                store: Arc::new(store),
                client: None,
            }
        } else {
            let store = Neo4jStore::connect(&settings.neo4j)
                .await
                .with_context(|| format!("cannot connect to Neo4j at {}", settings.neo4j.uri))?;
            Self {
                client: Some(store.client().clone()),
                store: Arc::new(store),
            }
        };
        info!(
            backend = if in_memory { "memory" } else { "neo4j" },
            call_timeout_ms = backend.store.call_timeout().as_millis() as u64,
            "Graph store ready"
        );
        Ok(backend)
    }

    async fn close(self) {
        if let Err(e) = self.store.close().await {
            warn!(error = %e, "Failed to close graph store");
        }
    }
}

impl Cli {
    pub async fn execute(self, settings: Settings) -> Result<()> {
        let backend = Backend::open(&settings, self.in_memory).await?;

        let result = match self.command {
            Commands::Schema => graph::cmd_schema(&backend).await,
            Commands::Status => graph::cmd_status(&backend).await,
            Commands::UpsertNode {
                label,
                value,
                props,
                strategy,
            } => upsert::cmd_upsert_node(&backend, label, value, &props, strategy).await,
            Commands::Batch { file, no_transaction } => {
                batch::cmd_batch(&backend, &file, !no_transaction).await
            }
            Commands::Import { file, batch_size } => {
                let batch_size = batch_size.unwrap_or(settings.import.batch_size);
                batch::cmd_import(&backend, &file, batch_size).await
            }
            Commands::Merge {
                keep_id,
                duplicate_id,
                strategy,
            } => merge::cmd_merge(&backend, &keep_id, &duplicate_id, strategy).await,
            Commands::Subgraph {
                root_id,
                depth,
                max_nodes,
                max_relationships,
                labels,
                rel_types,
            } => {
                let args = query::SubgraphArgs {
                    root_id,
                    depth,
                    max_nodes,
                    max_relationships,
                    labels,
                    rel_types,
                };
                query::cmd_subgraph(&backend, args).await
            }
            Commands::Path {
                from_id,
                to_id,
                max_depth,
                limit,
                rel_types,
            } => query::cmd_path(&backend, from_id, to_id, max_depth, limit, rel_types).await,
            Commands::Node { id } => query::cmd_node(&backend, &id).await,
        };

        backend.close().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_upsert_node() {
        let cli = Cli::try_parse_from([
            "edugraph",
            "--in-memory",
            "upsert-node",
            "knowledge_point",
            "KP1",
            "--props",
            r#"{"name":"Fractions"}"#,
            "--strategy",
            "keep-existing",
        ])
        .unwrap();

        assert!(cli.in_memory);
        match cli.command {
            Commands::UpsertNode {
                label, value, strategy, ..
            } => {
                assert_eq!(label, NodeLabel::KnowledgePoint);
                assert_eq!(value, "KP1");
                assert_eq!(strategy, ConflictStrategy::KeepExisting);
            }
            _ => panic!("expected upsert-node"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_strategy() {
        let parsed = Cli::try_parse_from(["edugraph", "merge", "a", "b", "--strategy", "newest"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["edugraph", "batch", "ops.json", "--no-transaction", "--log-format", "json"])
            .unwrap();
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        assert!(matches!(cli.command, Commands::Batch { no_transaction: true, .. }));
    }

    #[test]
    fn test_parse_subgraph_filters() {
        let cli = Cli::try_parse_from([
            "edugraph",
            "subgraph",
            "n-1",
            "--depth",
            "3",
            "--label",
            "Student",
            "--label",
            "knowledge_point",
            "--rel-type",
            "HAS_ERROR",
        ])
        .unwrap();

        match cli.command {
            Commands::Subgraph {
                root_id,
                depth,
                max_nodes,
                labels,
                rel_types,
                ..
            } => {
                assert_eq!(root_id, "n-1");
                assert_eq!(depth, 3);
                assert_eq!(max_nodes, DEFAULT_MAX_NODES);
                assert_eq!(labels, vec![NodeLabel::Student, NodeLabel::KnowledgePoint]);
                assert_eq!(rel_types, vec![RelationshipType::HasError]);
            }
            _ => panic!("expected subgraph"),
        }
    }

    #[test]
    fn test_parse_path_defaults() {
        let cli = Cli::try_parse_from(["edugraph", "path", "a", "b"]).unwrap();
        match cli.command {
            Commands::Path {
                max_depth,
                limit,
                rel_types,
                ..
            } => {
                assert_eq!(max_depth, 4);
                assert_eq!(limit, DEFAULT_PATH_LIMIT);
                assert!(rel_types.is_empty());
            }
            _ => panic!("expected path"),
        }
        assert!(Cli::try_parse_from(["edugraph", "path", "a", "b", "--rel-type", "FOLLOWS"]).is_err());
    }
}
