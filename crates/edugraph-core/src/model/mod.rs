//! Graph domain models: typed nodes, typed directed relationships and
//! their property maps.

mod node;
mod properties;
mod relationship;

pub use node::{Node, NodeLabel};
pub use properties::{
    apply_patch, parse_timestamp, split_edge_keys, split_system_keys, Properties, SystemFields, CREATED_AT, ID,
    UPDATED_AT, WEIGHT,
};
pub use relationship::{
    Relationship, RelationshipType, FIRST_OCCURRENCE, LAST_OCCURRENCE, OCCURRENCE_COUNT,
};
