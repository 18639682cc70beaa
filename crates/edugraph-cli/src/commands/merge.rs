//! Duplicate node merge command.

use anyhow::Result;
use colored::Colorize;
use edugraph_graph::{merge_nodes, ConflictStrategy};

use super::Backend;
use crate::output;

pub async fn cmd_merge(
    backend: &Backend,
    keep_id: &str,
    duplicate_id: &str,
    strategy: ConflictStrategy,
) -> Result<()> {
    let report = merge_nodes(&backend.store, keep_id, duplicate_id, strategy).await?;

    eprintln!(
        "{} {} into {} ({} moved, {} folded, {} self-loops dropped)",
        "Merged".green().bold(),
        duplicate_id.yellow(),
        keep_id.cyan(),
        report.redirected,
        report.folded,
        report.dropped_self_loops
    );
    output::print_json(&report)
}
