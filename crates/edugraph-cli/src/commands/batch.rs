//! Batch execution and record import commands.

use std::path::Path;

use anyhow::{bail, Context, Result};
use edugraph_graph::{BatchExecutor, BatchOperation, ImportRecord, Importer};
use serde::de::DeserializeOwned;
use tracing::info;

use super::Backend;
use crate::output;

/// Execute the operations in `file`.
pub async fn cmd_batch(backend: &Backend, file: &Path, use_transaction: bool) -> Result<()> {
    let operations: Vec<BatchOperation> = read_json(file)?;
    info!(count = operations.len(), use_transaction, "Executing batch file");

    let executor = BatchExecutor::new(backend.store.clone());
    let result = executor.execute_batch(&operations, use_transaction).await?;

    output::print_batch_summary(&result);
    output::print_json(&result)?;

    if !result.success {
        bail!("batch finished as {:?}", result.state);
    }
    Ok(())
}

/// Import the records in `file`.
pub async fn cmd_import(backend: &Backend, file: &Path, batch_size: usize) -> Result<()> {
    let records: Vec<ImportRecord> = read_json(file)?;

    let importer = Importer::new(backend.store.clone());
    let result = importer.import(&records, batch_size).await?;

    output::print_import_summary(&result);
    output::print_json(&result)
}

fn read_json<T: DeserializeOwned>(file: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("cannot read {}", file.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", file.display()))
}
