//! Single node upsert.

use anyhow::{Context, Result};
use edugraph_core::{NodeLabel, Properties};
use edugraph_graph::{ConflictStrategy, UpsertEngine};
use serde_json::Value;

use super::Backend;
use crate::output;

pub async fn cmd_upsert_node(
    backend: &Backend,
    label: NodeLabel,
    value: String,
    props: &str,
    strategy: ConflictStrategy,
) -> Result<()> {
    let properties = parse_properties(props)?;
    let engine = UpsertEngine::new(backend.store.clone());

    let node = engine
        .upsert_node(label, label.key_field(), &Value::String(value), &properties, strategy)
        .await?;

    output::print_json(&node)
}

/// Parse `--props`, which must be a JSON object.
fn parse_properties(raw: &str) -> Result<Properties> {
    serde_json::from_str(raw).context("--props must be a JSON object")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_properties() {
        let props = parse_properties(r#"{"name": "Ana", "grade": 8}"#).unwrap();
        assert_eq!(props.get("grade"), Some(&Value::from(8)));

        assert!(parse_properties("[1, 2]").is_err());
        assert!(parse_properties("name=Ana").is_err());
    }
}
