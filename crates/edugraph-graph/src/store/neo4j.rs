//! Neo4j-backed graph store.
//!
//! Every node and relationship is stored with its `id`, `createdAt` and
//! `updatedAt` as plain properties (timestamps as RFC 3339 strings), and
//! relationships additionally carry `weight`. Nested JSON objects are stored
//! as JSON strings since Neo4j properties cannot hold maps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use neo4rs::{BoltType, Query, Row, Txn};
use serde_json::Value;
use tracing::{debug, info};

use edugraph_core::model::{split_edge_keys, split_system_keys, CREATED_AT, ID, UPDATED_AT, WEIGHT};
use edugraph_core::{
    GraphError, GraphResult, Neo4jSettings, Node, NodeLabel, Properties, Relationship, RelationshipType,
};

use super::{bounded, EdgeFilter, GraphCounts, GraphStore, GraphTransaction};
use crate::client::{map_neo4j_error, GraphClient};
use crate::query::{GraphPath, PathQuery, Subgraph, SubgraphQuery};

const NODE_RETURN: &str = "RETURN properties(n) AS props, labels(n) AS labels";
const EDGE_RETURN: &str = "RETURN properties(r) AS props, type(r) AS type, a.id AS fromId, b.id AS toId";

/// Setting then removing a property takes the node's exclusive lock without
/// leaving anything behind. Neo4j holds it until commit or rollback.
const LOCK_NODE: &str = "MATCH (n) WHERE n.id = $id SET n._lock = true REMOVE n._lock RETURN count(n) AS count";

/// [`GraphStore`] over a Neo4j connection pool.
#[derive(Clone)]
pub struct Neo4jStore {
    client: GraphClient,
    timeout: Duration,
    open: Arc<AtomicBool>,
}

impl Neo4jStore {
    /// Connect using `settings` and verify the server answers.
    pub async fn connect(settings: &Neo4jSettings) -> GraphResult<Self> {
        let client = GraphClient::connect(settings).await?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: GraphClient) -> Self {
        let timeout = client.settings().query_timeout();
        Self {
            client,
            timeout,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn client(&self) -> &GraphClient {
        &self.client
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn begin_transaction(&self) -> GraphResult<Box<dyn GraphTransaction>> {
        if !self.open.load(Ordering::Acquire) {
            return Err(GraphError::StoreConnection("store is closed".into()));
        }
        let graph = self.client.inner();
        let txn = bounded(self.timeout, "begin_transaction", async {
            graph.start_txn().await.map_err(map_neo4j_error)
        })
        .await?;
        Ok(Box::new(Neo4jTransaction {
            txn,
            timeout: self.timeout,
        }))
    }

    async fn counts(&self) -> GraphResult<GraphCounts> {
        self.client.get_counts().await
    }

    async fn close(&self) -> GraphResult<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            info!("Neo4j store closed");
        }
        Ok(())
    }

    fn call_timeout(&self) -> Duration {
        self.timeout
    }
}

/// One explicit Neo4j transaction.
pub struct Neo4jTransaction {
    txn: Txn,
    timeout: Duration,
}

impl Neo4jTransaction {
    async fn fetch(&mut self, operation: &'static str, query: Query) -> GraphResult<Vec<Row>> {
        let txn = &mut self.txn;
        bounded(self.timeout, operation, async move {
            let mut stream = txn.execute(query).await.map_err(map_neo4j_error)?;
            let mut rows = Vec::new();
            while let Some(row) = stream.next(txn.handle()).await.map_err(map_neo4j_error)? {
                rows.push(row);
            }
            Ok(rows)
        })
        .await
    }

    async fn fetch_node(&mut self, operation: &'static str, query: Query) -> GraphResult<Option<Node>> {
        let rows = self.fetch(operation, query).await?;
        rows.first().map(row_to_node).transpose()
    }

    async fn fetch_edge(&mut self, operation: &'static str, query: Query) -> GraphResult<Option<Relationship>> {
        let rows = self.fetch(operation, query).await?;
        rows.first().map(row_to_edge).transpose()
    }

    async fn fetch_count(&mut self, operation: &'static str, query: Query) -> GraphResult<i64> {
        let rows = self.fetch(operation, query).await?;
        match rows.first() {
            Some(row) => row
                .get::<i64>("count")
                .map_err(|e| GraphError::Query(format!("{operation}: unreadable count: {e:?}"))),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl GraphTransaction for Neo4jTransaction {
    async fn find_by_key(
        &mut self,
        label: NodeLabel,
        key_field: &str,
        key_value: &Value,
    ) -> GraphResult<Option<Node>> {
        let key_field = checked_identifier(key_field)?;
        let Some(key) = json_to_bolt(key_field, key_value)? else {
            return Ok(None);
        };
        let cypher = format!("MATCH (n:{label}) WHERE n.{key_field} = $key {NODE_RETURN} LIMIT 1");
        self.fetch_node("find_by_key", Query::new(cypher).param("key", key)).await
    }

    async fn get_node(&mut self, id: &str) -> GraphResult<Option<Node>> {
        let cypher = format!("MATCH (n) WHERE n.id = $id {NODE_RETURN}");
        self.fetch_node("get_node", Query::new(cypher).param("id", id)).await
    }

    async fn list_nodes(&mut self, label: Option<NodeLabel>, limit: usize) -> GraphResult<Vec<Node>> {
        let pattern = match label {
            Some(label) => format!("(n:{label})"),
            None => "(n)".to_string(),
        };
        let cypher = format!("MATCH {pattern} {NODE_RETURN} ORDER BY n.id LIMIT $limit");
        let rows = self
            .fetch("list_nodes", Query::new(cypher).param("limit", limit as i64))
            .await?;
        rows.iter().map(row_to_node).collect()
    }

    async fn create(&mut self, node: &Node) -> GraphResult<Node> {
        let cypher = format!("CREATE (n:{}) SET n = $props {NODE_RETURN}", node.label);
        let query = Query::new(cypher).param("props", node_to_bolt(node)?);
        self.fetch_node("create", query)
            .await?
            .ok_or_else(|| GraphError::Query(format!("create returned no row for {}", node.id)))
    }

    async fn update(&mut self, node: &Node) -> GraphResult<Node> {
        let cypher = format!("MATCH (n:{}) WHERE n.id = $id SET n = $props {NODE_RETURN}", node.label);
        let query = Query::new(cypher)
            .param("id", node.id.as_str())
            .param("props", node_to_bolt(node)?);
        self.fetch_node("update", query)
            .await?
            .ok_or_else(|| GraphError::node_not_found(node.id.as_str()))
    }

    async fn delete_node(&mut self, id: &str) -> GraphResult<bool> {
        let query = Query::new("MATCH (n) WHERE n.id = $id DETACH DELETE n RETURN count(*) AS count".to_string())
            .param("id", id);
        Ok(self.fetch_count("delete_node", query).await? > 0)
    }

    async fn lock_node(&mut self, id: &str) -> GraphResult<bool> {
        let query = Query::new(LOCK_NODE.to_string()).param("id", id);
        Ok(self.fetch_count("lock_node", query).await? > 0)
    }

    async fn find_edge(
        &mut self,
        from_id: &str,
        to_id: &str,
        rel_type: RelationshipType,
    ) -> GraphResult<Option<Relationship>> {
        let cypher = format!(
            "MATCH (a)-[r:{rel_type}]->(b) WHERE a.id = $from AND b.id = $to {EDGE_RETURN} LIMIT 1"
        );
        let query = Query::new(cypher).param("from", from_id).param("to", to_id);
        self.fetch_edge("find_edge", query).await
    }

    async fn get_edge(&mut self, id: &str) -> GraphResult<Option<Relationship>> {
        let cypher = format!("MATCH (a)-[r]->(b) WHERE r.id = $id {EDGE_RETURN}");
        self.fetch_edge("get_edge", Query::new(cypher).param("id", id)).await
    }

    async fn list_edges(&mut self, filter: &EdgeFilter) -> GraphResult<Vec<Relationship>> {
        let pattern = match filter.rel_type {
            Some(t) => format!("(a)-[r:{t}]->(b)"),
            None => "(a)-[r]->(b)".to_string(),
        };
        let mut clauses = Vec::new();
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(from) = &filter.from_node_id {
            clauses.push("a.id = $from");
            params.push(("from", from.clone()));
        }
        if let Some(to) = &filter.to_node_id {
            clauses.push("b.id = $to");
            params.push(("to", to.clone()));
        }
        if let Some(node) = &filter.node_id {
            clauses.push("(a.id = $node OR b.id = $node)");
            params.push(("node", node.clone()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let limit = filter.limit.map(|l| format!(" LIMIT {l}")).unwrap_or_default();
        let cypher = format!("MATCH {pattern} {where_clause} {EDGE_RETURN} ORDER BY r.id{limit}");

        let query = params
            .into_iter()
            .fold(Query::new(cypher), |q, (name, value)| q.param(name, value));
        let rows = self.fetch("list_edges", query).await?;
        rows.iter().map(row_to_edge).collect()
    }

    async fn create_edge(&mut self, rel: &Relationship) -> GraphResult<Relationship> {
        for endpoint in [&rel.from_node_id, &rel.to_node_id] {
            if self.get_node(endpoint).await?.is_none() {
                return Err(GraphError::node_not_found(endpoint.as_str()));
            }
        }
        let cypher = format!(
            "MATCH (a), (b) WHERE a.id = $from AND b.id = $to \
             CREATE (a)-[r:{}]->(b) SET r = $props {EDGE_RETURN}",
            rel.rel_type
        );
        let query = Query::new(cypher)
            .param("from", rel.from_node_id.as_str())
            .param("to", rel.to_node_id.as_str())
            .param("props", edge_to_bolt(rel)?);
        self.fetch_edge("create_edge", query)
            .await?
            .ok_or_else(|| GraphError::Query(format!("create_edge returned no row for {}", rel.id)))
    }

    async fn update_edge(&mut self, rel: &Relationship) -> GraphResult<Relationship> {
        let cypher = format!("MATCH (a)-[r]->(b) WHERE r.id = $id SET r = $props {EDGE_RETURN}");
        let query = Query::new(cypher)
            .param("id", rel.id.as_str())
            .param("props", edge_to_bolt(rel)?);
        self.fetch_edge("update_edge", query)
            .await?
            .ok_or_else(|| GraphError::relationship_not_found(rel.id.as_str()))
    }

    async fn delete_edge(&mut self, id: &str) -> GraphResult<bool> {
        let query = Query::new("MATCH ()-[r]->() WHERE r.id = $id DELETE r RETURN count(*) AS count".to_string())
            .param("id", id);
        Ok(self.fetch_count("delete_edge", query).await? > 0)
    }

    async fn subgraph(&mut self, query: &SubgraphQuery) -> GraphResult<Subgraph> {
        let types = type_union(&query.rel_types);
        let labels: Vec<String> = query.labels.iter().map(|l| l.to_string()).collect();
        let cypher = format!(
            "MATCH (root) WHERE root.id = $root \
             MATCH p = (root)-[{types}*0..{depth}]-(n) \
             WITH n, min(length(p)) AS dist \
             WHERE n.id = $root OR size($labels) = 0 OR any(l IN labels(n) WHERE l IN $labels) \
             {NODE_RETURN}, dist ORDER BY dist, n.id LIMIT $maxNodes",
            depth = query.effective_depth()
        );
        let node_query = Query::new(cypher)
            .param("root", query.root_id.as_str())
            .param("labels", labels)
            .param("maxNodes", query.max_nodes as i64);
        let nodes = self
            .fetch("subgraph", node_query)
            .await?
            .iter()
            .map(row_to_node)
            .collect::<GraphResult<Vec<_>>>()?;
        if nodes.is_empty() {
            return Ok(Subgraph::assemble(query, nodes, Vec::new()));
        }

        let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let cypher = format!(
            "MATCH (a)-[r{types}]->(b) WHERE a.id IN $ids AND b.id IN $ids \
             {EDGE_RETURN} ORDER BY r.id LIMIT $maxRels"
        );
        let edge_query = Query::new(cypher)
            .param("ids", ids)
            .param("maxRels", query.max_relationships as i64);
        let relationships = self
            .fetch("subgraph", edge_query)
            .await?
            .iter()
            .map(row_to_edge)
            .collect::<GraphResult<Vec<_>>>()?;
        Ok(Subgraph::assemble(query, nodes, relationships))
    }

    async fn find_paths(&mut self, query: &PathQuery) -> GraphResult<Vec<GraphPath>> {
        let cypher = format!(
            "MATCH (a) WHERE a.id = $from MATCH (b) WHERE b.id = $to \
             MATCH p = (a)-[{types}*1..{depth}]-(b) \
             WHERE all(x IN nodes(p) WHERE single(y IN nodes(p) WHERE y = x)) \
             WITH p, [r IN relationships(p) | r.id] AS relIds \
             RETURN [x IN nodes(p) | x.id] AS nodeIds, relIds, length(p) AS len \
             ORDER BY len, relIds LIMIT $limit",
            types = type_union(&query.rel_types),
            depth = query.effective_depth()
        );
        let path_query = Query::new(cypher)
            .param("from", query.from_id.as_str())
            .param("to", query.to_id.as_str())
            .param("limit", query.limit as i64);
        let rows = self.fetch("find_paths", path_query).await?;

        let mut paths = Vec::with_capacity(rows.len());
        for row in rows {
            let node_ids: Vec<String> = row
                .get("nodeIds")
                .map_err(|e| GraphError::Query(format!("unreadable path nodes: {e:?}")))?;
            let rel_ids: Vec<String> = row
                .get("relIds")
                .map_err(|e| GraphError::Query(format!("unreadable path relationships: {e:?}")))?;

            let mut nodes = Vec::with_capacity(node_ids.len());
            for id in &node_ids {
                let node = self
                    .get_node(id)
                    .await?
                    .ok_or_else(|| GraphError::Query(format!("path node {id} vanished")))?;
                nodes.push(node);
            }
            let mut relationships = Vec::with_capacity(rel_ids.len());
            for id in &rel_ids {
                let rel = self
                    .get_edge(id)
                    .await?
                    .ok_or_else(|| GraphError::Query(format!("path relationship {id} vanished")))?;
                relationships.push(rel);
            }
            paths.push(GraphPath {
                length: relationships.len(),
                nodes,
                relationships,
            });
        }
        Ok(paths)
    }

    async fn commit(self: Box<Self>) -> GraphResult<()> {
        let Neo4jTransaction { txn, timeout } = *self;
        bounded(timeout, "commit", async { txn.commit().await.map_err(map_neo4j_error) }).await?;
        debug!("Neo4j transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> GraphResult<()> {
        let Neo4jTransaction { txn, timeout } = *self;
        bounded(timeout, "rollback", async { txn.rollback().await.map_err(map_neo4j_error) }).await?;
        debug!("Neo4j transaction rolled back");
        Ok(())
    }
}

/// Relationship type filter for a pattern: `:A|B`, or nothing to match any type.
fn type_union(types: &[RelationshipType]) -> String {
    if types.is_empty() {
        return String::new();
    }
    let names: Vec<&str> = types.iter().map(RelationshipType::as_str).collect();
    format!(":{}", names.join("|"))
}

/// Accept only plain property names for interpolation into Cypher.
fn checked_identifier(name: &str) -> GraphResult<&str> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(GraphError::invalid_input("keyField", format!("'{name}' is not a valid property name")))
    }
}

/// Convert a JSON value to a Bolt parameter. A top-level `null` has no
/// stored form and yields `None`; values Bolt cannot hold exactly are
/// rejected with `InvalidInput`.
fn json_to_bolt(field: &str, value: &Value) -> GraphResult<Option<BoltType>> {
    let bolt = match value {
        Value::Null => return Ok(None),
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into()
            } else if n.is_u64() {
                return Err(GraphError::invalid_input(field, format!("{n} does not fit a 64-bit signed integer")));
            } else {
                n.as_f64()
                    .ok_or_else(|| GraphError::invalid_input(field, format!("{n} is not a storable number")))?
                    .into()
            }
        }
        Value::String(s) => s.as_str().into(),
        Value::Array(items) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                match json_to_bolt(field, item)? {
                    Some(bolt) => list.push(bolt),
                    None => return Err(GraphError::invalid_input(field, "lists cannot contain null")),
                }
            }
            list.into()
        }
        Value::Object(_) => value.to_string().into(),
    };
    Ok(Some(bolt))
}

fn properties_to_bolt(props: &Properties) -> GraphResult<HashMap<String, BoltType>> {
    let mut map = HashMap::with_capacity(props.len());
    for (key, value) in props {
        if let Some(bolt) = json_to_bolt(key, value)? {
            map.insert(key.clone(), bolt);
        }
    }
    Ok(map)
}

fn node_to_bolt(node: &Node) -> GraphResult<HashMap<String, BoltType>> {
    let mut map = properties_to_bolt(&node.properties)?;
    map.insert(ID.to_string(), node.id.as_str().into());
    map.insert(CREATED_AT.to_string(), node.created_at.to_rfc3339().into());
    map.insert(UPDATED_AT.to_string(), node.updated_at.to_rfc3339().into());
    Ok(map)
}

fn edge_to_bolt(rel: &Relationship) -> GraphResult<HashMap<String, BoltType>> {
    let mut map = properties_to_bolt(&rel.properties)?;
    map.insert(ID.to_string(), rel.id.as_str().into());
    map.insert(CREATED_AT.to_string(), rel.created_at.to_rfc3339().into());
    map.insert(UPDATED_AT.to_string(), rel.updated_at.to_rfc3339().into());
    if let Some(weight) = rel.weight {
        map.insert(WEIGHT.to_string(), weight.into());
    }
    Ok(map)
}

fn read_properties(row: &Row) -> GraphResult<Properties> {
    let props: Value = row
        .get("props")
        .map_err(|e| GraphError::Query(format!("unreadable properties: {e:?}")))?;
    match props {
        Value::Object(map) => Ok(map.into_iter().collect()),
        Value::Null => Ok(Properties::new()),
        other => Err(GraphError::Query(format!("properties are not a map: {other}"))),
    }
}

fn row_to_node(row: &Row) -> GraphResult<Node> {
    let mut properties = read_properties(row)?;
    let labels: Vec<String> = row
        .get("labels")
        .map_err(|e| GraphError::Query(format!("unreadable labels: {e:?}")))?;
    let label = labels
        .iter()
        .find_map(|l| l.parse::<NodeLabel>().ok())
        .ok_or_else(|| GraphError::Query(format!("node has no known label: {labels:?}")))?;

    let system = split_system_keys(&mut properties);
    let id = system
        .id
        .ok_or_else(|| GraphError::Query(format!("{label} node without an id")))?;
    let created_at = system.created_at.unwrap_or_else(Utc::now);
    Ok(Node {
        id,
        label,
        properties,
        created_at,
        updated_at: system.updated_at.unwrap_or(created_at),
    })
}

fn row_to_edge(row: &Row) -> GraphResult<Relationship> {
    let mut properties = read_properties(row)?;
    let rel_type: String = row
        .get("type")
        .map_err(|e| GraphError::Query(format!("unreadable relationship type: {e:?}")))?;
    let from_node_id: String = row
        .get("fromId")
        .map_err(|e| GraphError::Query(format!("unreadable start node id: {e:?}")))?;
    let to_node_id: String = row
        .get("toId")
        .map_err(|e| GraphError::Query(format!("unreadable end node id: {e:?}")))?;

    let system = split_edge_keys(&mut properties);
    let id = system
        .id
        .ok_or_else(|| GraphError::Query(format!("{rel_type} relationship without an id")))?;
    let created_at = system.created_at.unwrap_or_else(Utc::now);
    Ok(Relationship {
        id,
        rel_type: rel_type.parse()?,
        from_node_id,
        to_node_id,
        properties,
        weight: system.weight,
        created_at,
        updated_at: system.updated_at.unwrap_or(created_at),
    })
}
