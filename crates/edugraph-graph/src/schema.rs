//! Neo4j schema initialization (constraints and indexes).

use neo4rs::Query;
use tracing::info;

use edugraph_core::{GraphResult, NodeLabel, RelationshipType};

use crate::GraphClient;

/// Cypher statements for schema initialization.
///
/// Business-key uniqueness is what turns a concurrent double-create into a
/// `ConstraintViolation` the upsert engine can retry.
pub fn schema_statements() -> Vec<String> {
    let mut statements = Vec::new();
    for label in NodeLabel::ALL {
        let name = label.as_str().to_lowercase();
        statements.push(format!(
            "CREATE CONSTRAINT {name}_key IF NOT EXISTS FOR (n:{label}) REQUIRE n.{} IS UNIQUE",
            label.key_field()
        ));
        statements.push(format!(
            "CREATE CONSTRAINT {name}_id IF NOT EXISTS FOR (n:{label}) REQUIRE n.id IS UNIQUE"
        ));
    }
    for rel_type in RelationshipType::ALL {
        let name = rel_type.as_str().to_lowercase();
        statements.push(format!(
            "CREATE INDEX {name}_id IF NOT EXISTS FOR ()-[r:{rel_type}]-() ON (r.id)"
        ));
    }
    statements
}

/// Initialize Neo4j schema with constraints and indexes.
///
/// Safe to run multiple times - uses IF NOT EXISTS clauses.
pub async fn initialize_schema(client: &GraphClient) -> GraphResult<usize> {
    info!("Initializing Neo4j schema...");

    let statements = schema_statements();
    for statement in &statements {
        client.execute(Query::new(statement.clone())).await?;
    }

    info!("Neo4j schema initialized ({} statements)", statements.len());
    Ok(statements.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_key_field_is_constrained() {
        let statements = schema_statements();
        for label in NodeLabel::ALL {
            let expected = format!("REQUIRE n.{} IS UNIQUE", label.key_field());
            assert!(
                statements.iter().any(|s| s.contains(&format!("(n:{label})")) && s.contains(&expected)),
                "no key constraint for {label}"
            );
        }
        assert!(statements.iter().all(|s| s.contains("IF NOT EXISTS")));
    }
}
