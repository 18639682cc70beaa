//! Terminal output formatting.

use anyhow::Result;
use colored::{ColoredString, Colorize};
use edugraph_core::ErrorDescriptor;
use edugraph_graph::{BatchResult, BatchState, GraphCounts, ImportResult};
use serde::Serialize;

/// Print any result as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a section heading.
pub fn heading(text: &str) {
    println!("{}", text.cyan().bold());
    println!("{}", "─".repeat(50).dimmed());
}

pub fn print_counts(counts: &GraphCounts) {
    println!("  {:<16} {}", "Nodes".bold(), counts.nodes);
    println!("  {:<16} {}", "Relationships".bold(), counts.relationships);
}

fn state_colored(state: BatchState) -> ColoredString {
    match state {
        BatchState::Committed => "COMMITTED".green(),
        BatchState::PartiallyCompleted => "PARTIALLY_COMPLETED".yellow(),
        BatchState::RolledBack => "ROLLED_BACK".red(),
        other => format!("{other:?}").normal(),
    }
}

/// Batch summary on stderr, keeping stdout for the JSON result.
pub fn print_batch_summary(result: &BatchResult) {
    eprintln!("{}", batch_summary(result));
    print_errors(&result.errors);
}

fn batch_summary(result: &BatchResult) -> String {
    format!(
        "{} {}/{} succeeded, {} failed in {} ms",
        state_colored(result.state),
        result.successful_operations.to_string().bold(),
        result.operations_count,
        result.failed_operations,
        result.elapsed_ms
    )
}

/// Import summary on stderr.
pub fn print_import_summary(result: &ImportResult) {
    eprintln!("{}", import_summary(result));
    print_errors(&result.errors);
}

fn import_summary(result: &ImportResult) -> String {
    let failed = if result.failure_count == 0 {
        result.failure_count.to_string().normal()
    } else {
        result.failure_count.to_string().red()
    };
    format!(
        "{} records: {} imported, {} failed ({:.2}s, {:.1} records/s)",
        result.total_records,
        result.success_count.to_string().green(),
        failed,
        result.total_time_secs,
        result.records_per_second
    )
}

fn print_errors(errors: &[ErrorDescriptor]) {
    for error in errors {
        eprintln!("{}", error_line(error));
    }
}

fn error_line(error: &ErrorDescriptor) -> String {
    let at = error
        .index
        .map(|i| format!("#{i}"))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "  {} {} {} {}",
        at.dimmed(),
        error.operation.yellow(),
        error.code.red(),
        error.message
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summaries_render_without_json() {
        colored::control::set_override(false);
        let result = BatchResult {
            success: false,
            state: BatchState::RolledBack,
            operations_count: 3,
            successful_operations: 0,
            failed_operations: 3,
            results: vec![None, None, None],
            errors: vec![ErrorDescriptor {
                index: Some(2),
                operation: "create_relationship".to_string(),
                code: "ENTITY_NOT_FOUND".to_string(),
                field: None,
                message: "node ghost not found".to_string(),
            }],
            elapsed_ms: 12,
        };

        assert_eq!(batch_summary(&result), "ROLLED_BACK 0/3 succeeded, 3 failed in 12 ms");
        assert_eq!(
            error_line(&result.errors[0]),
            "  #2 create_relationship ENTITY_NOT_FOUND node ghost not found"
        );

        let import = ImportResult {
            import_id: "imp".to_string(),
            total_records: 5,
            success_count: 3,
            failure_count: 2,
            errors: Vec::new(),
            total_time_secs: 0.5,
            records_per_second: 10.0,
        };
        assert_eq!(import_summary(&import), "5 records: 3 imported, 2 failed (0.50s, 10.0 records/s)");
    }
}
