//! Schema and status commands.

use anyhow::Result;
use colored::Colorize;
use edugraph_graph::GraphStore;

use super::Backend;
use crate::output;

/// Create constraints and indexes.
pub async fn cmd_schema(backend: &Backend) -> Result<()> {
    let Some(client) = &backend.client else {
        println!("{}", "In-memory store enforces keys itself; nothing to initialise.".dimmed());
        return Ok(());
    };

    let applied = edugraph_graph::initialize_schema(client).await?;
    println!("{} {} statements applied", "Schema ready:".green().bold(), applied);
    Ok(())
}

/// Show committed node and relationship counts.
pub async fn cmd_status(backend: &Backend) -> Result<()> {
    let counts = backend.store.counts().await?;

    output::heading("Graph status");
    output::print_counts(&counts);
    Ok(())
}
