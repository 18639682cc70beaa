//! EduGraph Core Library
//!
//! Data model, error taxonomy and configuration shared by the graph engine
//! and the command-line front end.

pub mod config;
pub mod error;
pub mod model;

pub use config::{ImportSettings, LogFormat, LogSettings, Neo4jSettings, Settings};
pub use error::{ErrorDescriptor, GraphError, GraphResult};
pub use model::{Node, NodeLabel, Properties, Relationship, RelationshipType};
