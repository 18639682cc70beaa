//! Typed graph nodes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Properties;
use crate::error::GraphError;

/// Node types stored in the knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeLabel {
    Student,
    Teacher,
    Course,
    KnowledgePoint,
    ErrorType,
}

impl NodeLabel {
    pub const ALL: [NodeLabel; 5] = [
        Self::Student,
        Self::Teacher,
        Self::Course,
        Self::KnowledgePoint,
        Self::ErrorType,
    ];

    /// The graph label for this node type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Student => "Student",
            Self::Teacher => "Teacher",
            Self::Course => "Course",
            Self::KnowledgePoint => "KnowledgePoint",
            Self::ErrorType => "ErrorType",
        }
    }

    /// The business-unique key property for this node type.
    pub fn key_field(&self) -> &'static str {
        match self {
            Self::Student => "studentId",
            Self::Teacher => "teacherId",
            Self::Course => "courseId",
            Self::KnowledgePoint => "knowledgePointId",
            Self::ErrorType => "errorTypeId",
        }
    }
}

impl fmt::Display for NodeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeLabel {
    type Err = GraphError;

    /// Parse from a label name, case-insensitive; `_` and `-` are ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "student" => Ok(Self::Student),
            "teacher" => Ok(Self::Teacher),
            "course" => Ok(Self::Course),
            "knowledgepoint" => Ok(Self::KnowledgePoint),
            "errortype" => Ok(Self::ErrorType),
            _ => Err(GraphError::invalid_input("label", format!("unknown node label '{s}'"))),
        }
    }
}

/// A typed node instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub label: NodeLabel,
    pub properties: Properties,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Create a fresh node with a generated id and both timestamps set to `now`.
    pub fn new(label: NodeLabel, properties: Properties, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            label,
            properties,
            created_at: now,
            updated_at: now,
        }
    }

    /// The value of this node's business key, if set.
    pub fn key_value(&self) -> Option<&Value> {
        self.properties.get(self.label.key_field())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_parsing() {
        assert_eq!("Student".parse::<NodeLabel>().unwrap(), NodeLabel::Student);
        assert_eq!("knowledge_point".parse::<NodeLabel>().unwrap(), NodeLabel::KnowledgePoint);
        assert_eq!("ERROR-TYPE".parse::<NodeLabel>().unwrap(), NodeLabel::ErrorType);
        assert!("Classroom".parse::<NodeLabel>().is_err());
    }

    #[test]
    fn test_key_fields_are_distinct() {
        let mut keys: Vec<_> = NodeLabel::ALL.iter().map(|l| l.key_field()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), NodeLabel::ALL.len());
    }

    #[test]
    fn test_node_serializes_camel_case() {
        let mut props = Properties::new();
        props.insert("studentId".into(), "S001".into());
        let node = Node::new(NodeLabel::Student, props, Utc::now());

        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "Student");
        assert_eq!(json["properties"]["studentId"], "S001");
        assert!(json.get("createdAt").is_some());
        assert_eq!(node.key_value(), Some(&Value::from("S001")));
    }
}
