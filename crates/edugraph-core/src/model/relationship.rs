//! Typed, directed relationships between nodes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Properties;
use crate::error::GraphError;

pub const OCCURRENCE_COUNT: &str = "occurrenceCount";
pub const FIRST_OCCURRENCE: &str = "firstOccurrence";
pub const LAST_OCCURRENCE: &str = "lastOccurrence";

/// Relationship types stored in the knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    ChatWith,
    Likes,
    Teaches,
    Learns,
    Contains,
    HasError,
    RelatesTo,
}

impl RelationshipType {
    pub const ALL: [RelationshipType; 7] = [
        Self::ChatWith,
        Self::Likes,
        Self::Teaches,
        Self::Learns,
        Self::Contains,
        Self::HasError,
        Self::RelatesTo,
    ];

    /// The graph relationship type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatWith => "CHAT_WITH",
            Self::Likes => "LIKES",
            Self::Teaches => "TEACHES",
            Self::Learns => "LEARNS",
            Self::Contains => "CONTAINS",
            Self::HasError => "HAS_ERROR",
            Self::RelatesTo => "RELATES_TO",
        }
    }

    /// Whether repeated upserts of this kind count occurrences.
    pub fn tracks_occurrences(&self) -> bool {
        matches!(self, Self::HasError)
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationshipType {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == upper)
            .ok_or_else(|| {
                GraphError::invalid_input("type", format!("unknown relationship type '{s}'"))
            })
    }
}

/// A typed, directed edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub id: String,
    #[serde(rename = "type")]
    pub rel_type: RelationshipType,
    pub from_node_id: String,
    pub to_node_id: String,
    pub properties: Properties,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Relationship {
    /// Create a fresh relationship with a generated id.
    pub fn new(
        rel_type: RelationshipType,
        from_node_id: impl Into<String>,
        to_node_id: impl Into<String>,
        properties: Properties,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            rel_type,
            from_node_id: from_node_id.into(),
            to_node_id: to_node_id.into(),
            properties,
            weight: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this edge carries an occurrence counter, either because its
    /// kind tracks occurrences or because the property was set explicitly.
    pub fn is_occurrence_tracked(&self) -> bool {
        self.rel_type.tracks_occurrences() || self.properties.contains_key(OCCURRENCE_COUNT)
    }

    /// Current occurrence count, if present and numeric.
    pub fn occurrence_count(&self) -> Option<i64> {
        self.properties.get(OCCURRENCE_COUNT).and_then(|v| v.as_i64())
    }

    /// Identity triple used for uniqueness.
    pub fn triple(&self) -> (&str, &str, RelationshipType) {
        (&self.from_node_id, &self.to_node_id, self.rel_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_parsing() {
        assert_eq!("has_error".parse::<RelationshipType>().unwrap(), RelationshipType::HasError);
        assert_eq!("CHAT-WITH".parse::<RelationshipType>().unwrap(), RelationshipType::ChatWith);
        assert!("FOLLOWS".parse::<RelationshipType>().is_err());
    }

    #[test]
    fn test_occurrence_tracking() {
        let rel = Relationship::new(RelationshipType::ChatWith, "a", "b", Properties::new(), Utc::now());
        assert!(!rel.is_occurrence_tracked());

        let mut props = Properties::new();
        props.insert(OCCURRENCE_COUNT.into(), 4.into());
        let rel = Relationship::new(RelationshipType::Likes, "a", "b", props, Utc::now());
        assert!(rel.is_occurrence_tracked());
        assert_eq!(rel.occurrence_count(), Some(4));

        let rel = Relationship::new(RelationshipType::HasError, "a", "b", Properties::new(), Utc::now());
        assert!(rel.is_occurrence_tracked());
    }

    #[test]
    fn test_serde_type_name() {
        let json = serde_json::to_value(RelationshipType::RelatesTo).unwrap();
        assert_eq!(json, "RELATES_TO");
    }
}
