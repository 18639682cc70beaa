//! Neo4j connection client.

use neo4rs::{ConfigBuilder, Graph, Query};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use edugraph_core::{GraphError, GraphResult, Neo4jSettings};

use crate::store::{bounded, GraphCounts};

/// Client for Neo4j Knowledge Graph operations.
#[derive(Clone)]
pub struct GraphClient {
    graph: Graph,
    settings: Neo4jSettings,
}

impl GraphClient {
    /// Create a new GraphClient from settings.
    ///
    /// `Graph::connect` only builds a lazy pool, so a `RETURN 1` ping runs
    /// right away under the connect timeout to surface an unreachable server.
    pub async fn connect(settings: &Neo4jSettings) -> GraphResult<Self> {
        let config = ConfigBuilder::default()
            .uri(&settings.uri)
            .user(&settings.user)
            .password(&settings.password)
            .db(settings.database.as_str())
            .max_connections(settings.max_connections)
            .fetch_size(settings.fetch_size)
            .build()
            .map_err(|e| GraphError::config(format!("invalid Neo4j settings: {e}")))?;

        let connect = async {
            let graph = Graph::connect(config)
                .await
                .map_err(|e| GraphError::StoreConnection(format!("cannot create pool: {e}")))?;
            graph
                .run(Query::new("RETURN 1".to_string()))
                .await
                .map_err(|e| GraphError::StoreConnection(format!("Neo4j is not responding: {e}")))?;
            Ok(graph)
        };
        let graph = bounded(settings.connect_timeout(), "connect", connect).await?;

        info!(uri = %settings.uri, database = %settings.database, "Connected to Neo4j");
        Ok(Self {
            graph,
            settings: settings.clone(),
        })
    }

    /// Execute a Cypher statement that returns no results.
    pub async fn execute(&self, query: Query) -> GraphResult<()> {
        bounded(self.settings.query_timeout(), "execute", async {
            self.graph.run(query).await.map_err(map_neo4j_error)
        })
        .await
    }

    /// Execute a Cypher query and return results as rows.
    pub async fn query(&self, query: Query) -> GraphResult<Vec<neo4rs::Row>> {
        bounded(self.settings.query_timeout(), "query", async {
            let mut result = self.graph.execute(query).await.map_err(map_neo4j_error)?;
            let mut rows = Vec::new();
            while let Some(row) = result.next().await.map_err(map_neo4j_error)? {
                rows.push(row);
            }
            Ok(rows)
        })
        .await
    }

    /// Execute a Cypher query and return a single scalar value.
    pub async fn query_scalar<T: DeserializeOwned>(&self, query: Query, field: &str) -> GraphResult<Option<T>> {
        let rows = self.query(query).await?;
        match rows.into_iter().next() {
            Some(row) => row
                .get(field)
                .map(Some)
                .map_err(|e| GraphError::Query(format!("failed to read field '{field}': {e:?}"))),
            None => Ok(None),
        }
    }

    /// Node and relationship counts for status display.
    pub async fn get_counts(&self) -> GraphResult<GraphCounts> {
        let node_query = Query::new("MATCH (n) RETURN count(n) AS count".to_string());
        let rel_query = Query::new("MATCH ()-[r]->() RETURN count(r) AS count".to_string());

        let nodes: i64 = self.query_scalar(node_query, "count").await?.unwrap_or(0);
        let relationships: i64 = self.query_scalar(rel_query, "count").await?.unwrap_or(0);
        debug!(nodes, relationships, "Fetched graph counts");

        Ok(GraphCounts {
            nodes: nodes.max(0) as usize,
            relationships: relationships.max(0) as usize,
        })
    }

    pub fn settings(&self) -> &Neo4jSettings {
        &self.settings
    }

    /// Get a reference to the underlying neo4rs Graph.
    pub fn inner(&self) -> &Graph {
        &self.graph
    }
}

/// Classify a driver error.
///
/// Unique-constraint failures become `ConstraintViolation` so the engine can
/// retry them; socket-level failures become `StoreConnection`.
pub(crate) fn map_neo4j_error(err: neo4rs::Error) -> GraphError {
    let detail = format!("{err:?}");
    if detail.contains("ConstraintValidationFailed") || detail.contains("already exists with label") {
        GraphError::ConstraintViolation(err.to_string())
    } else if detail.contains("IOError") || detail.contains("ConnectionError") || detail.contains("Connection refused") {
        GraphError::StoreConnection(err.to_string())
    } else {
        GraphError::Query(err.to_string())
    }
}
