//! Application settings: optional TOML file, then environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{GraphError, GraphResult};

pub const MAX_BATCH_SIZE: usize = 10_000;

/// Top-level settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub neo4j: Neo4jSettings,
    pub import: ImportSettings,
    pub log: LogSettings,
}

/// Configuration for connecting to Neo4j.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Neo4jSettings {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: usize,
    pub fetch_size: usize,
    pub connect_timeout_secs: u64,
    pub query_timeout_secs: u64,
}

impl Default for Neo4jSettings {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: "password".to_string(),
            database: "neo4j".to_string(),
            max_connections: 16,
            fetch_size: 200,
            connect_timeout_secs: 30,
            query_timeout_secs: 30,
        }
    }
}

impl Neo4jSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Deadline applied to every individual store call.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

/// Bulk import settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImportSettings {
    pub batch_size: usize,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self { batch_size: 1000 }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Console,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "console" => Ok(Self::Console),
            "json" => Ok(Self::Json),
            other => Err(GraphError::config(format!(
                "log format must be 'console' or 'json', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Console,
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file, then apply `EDUGRAPH_*`
    /// environment overrides and validate the result.
    pub fn load(path: Option<&Path>) -> GraphResult<Self> {
        let mut settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    GraphError::config(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        debug!(uri = %settings.neo4j.uri, batch_size = settings.import.batch_size, "Settings loaded");
        Ok(settings)
    }

    /// Parse settings from TOML text.
    pub fn from_toml(raw: &str) -> GraphResult<Self> {
        toml::from_str(raw).map_err(|e| GraphError::config(format!("invalid settings file: {e}")))
    }

    /// Apply overrides from a key lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> GraphResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("EDUGRAPH_NEO4J_URI") {
            self.neo4j.uri = v;
        }
        if let Some(v) = lookup("EDUGRAPH_NEO4J_USER") {
            self.neo4j.user = v;
        }
        if let Some(v) = lookup("EDUGRAPH_NEO4J_PASSWORD") {
            self.neo4j.password = v;
        }
        if let Some(v) = lookup("EDUGRAPH_NEO4J_DATABASE") {
            self.neo4j.database = v;
        }
        if let Some(v) = lookup("EDUGRAPH_NEO4J_MAX_CONNECTIONS") {
            self.neo4j.max_connections = parse_number("EDUGRAPH_NEO4J_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = lookup("EDUGRAPH_NEO4J_CONNECT_TIMEOUT") {
            self.neo4j.connect_timeout_secs = parse_number("EDUGRAPH_NEO4J_CONNECT_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("EDUGRAPH_NEO4J_QUERY_TIMEOUT") {
            self.neo4j.query_timeout_secs = parse_number("EDUGRAPH_NEO4J_QUERY_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("EDUGRAPH_BATCH_SIZE") {
            self.import.batch_size = parse_number("EDUGRAPH_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("EDUGRAPH_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = lookup("EDUGRAPH_LOG_FORMAT") {
            self.log.format = v.parse()?;
        }
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> GraphResult<()> {
        if self.import.batch_size == 0 || self.import.batch_size > MAX_BATCH_SIZE {
            return Err(GraphError::config(format!(
                "import.batch_size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.import.batch_size
            )));
        }
        if self.neo4j.query_timeout_secs == 0 || self.neo4j.connect_timeout_secs == 0 {
            return Err(GraphError::config("neo4j timeouts must be at least one second"));
        }
        if self.neo4j.max_connections == 0 {
            return Err(GraphError::config("neo4j.max_connections must be positive"));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> GraphResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GraphError::config(format!("{key} must be a number, got '{value}'")))
}
