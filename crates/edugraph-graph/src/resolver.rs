//! Conflict resolution between a stored entity and an incoming write.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use edugraph_core::{GraphError, Properties};

/// Policy applied when an upsert finds an existing entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", try_from = "String")]
pub enum ConflictStrategy {
    /// The newer of the two property maps replaces the other wholesale.
    #[default]
    TimestampPriority,
    /// Incoming data is discarded.
    KeepExisting,
    /// Union of both maps; existing values win on key collision.
    MergeProperties,
}

impl ConflictStrategy {
    pub const ALL: [ConflictStrategy; 3] = [Self::TimestampPriority, Self::KeepExisting, Self::MergeProperties];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimestampPriority => "TIMESTAMP_PRIORITY",
            Self::KeepExisting => "KEEP_EXISTING",
            Self::MergeProperties => "MERGE_PROPERTIES",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == token)
            .ok_or_else(|| GraphError::InvalidStrategy(s.to_string()))
    }
}

impl TryFrom<String> for ConflictStrategy {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One side of a conflict: a property map and when it was last written.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot<'a> {
    pub properties: &'a Properties,
    pub updated_at: Option<DateTime<Utc>>,
}

impl<'a> Snapshot<'a> {
    pub fn new(properties: &'a Properties, updated_at: Option<DateTime<Utc>>) -> Self {
        Self { properties, updated_at }
    }
}

/// Which side supplied the resolved properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Existing,
    Incoming,
    Merged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub properties: Properties,
    pub winner: Winner,
}

/// Decide the property map to persist.
///
/// For `TimestampPriority` an incoming side without a timestamp counts as
/// written at `now`, and ties go to the incoming side.
pub fn resolve(
    existing: Snapshot<'_>,
    incoming: Snapshot<'_>,
    strategy: ConflictStrategy,
    now: DateTime<Utc>,
) -> Resolution {
    match strategy {
        ConflictStrategy::TimestampPriority => {
            let incoming_at = incoming.updated_at.unwrap_or(now);
            let existing_at = existing.updated_at.unwrap_or(DateTime::<Utc>::MIN_UTC);
            if incoming_at >= existing_at {
                Resolution {
                    properties: incoming.properties.clone(),
                    winner: Winner::Incoming,
                }
            } else {
                Resolution {
                    properties: existing.properties.clone(),
                    winner: Winner::Existing,
                }
            }
        }
        ConflictStrategy::KeepExisting => Resolution {
            properties: existing.properties.clone(),
            winner: Winner::Existing,
        },
        ConflictStrategy::MergeProperties => {
            let mut properties = existing.properties.clone();
            for (key, value) in incoming.properties {
                properties.entry(key.clone()).or_insert_with(|| value.clone());
            }
            Resolution {
                properties,
                winner: Winner::Merged,
            }
        }
    }
}
