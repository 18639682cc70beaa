//! Bulk import of raw education records.
//!
//! Each valid record turns into one small transactional batch: upsert the two
//! endpoint nodes by business key, then upsert the relationship between them.
//! A failed record is reported and skipped; the import carries on.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use edugraph_core::config::MAX_BATCH_SIZE;
use edugraph_core::model::{FIRST_OCCURRENCE, LAST_OCCURRENCE, OCCURRENCE_COUNT};
use edugraph_core::{ErrorDescriptor, GraphError, GraphResult, NodeLabel, Properties, RelationshipType};

use crate::batch::{BatchExecutor, BatchOperation, NodeRef};
use crate::resolver::ConflictStrategy;
use crate::store::GraphStore;

/// Kind of raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    StudentInteraction,
    TeacherInteraction,
    CourseRecord,
    ErrorRecord,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StudentInteraction => "student_interaction",
            Self::TeacherInteraction => "teacher_interaction",
            Self::CourseRecord => "course_record",
            Self::ErrorRecord => "error_record",
        }
    }

    fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::StudentInteraction => &["student_id_from", "student_id_to", "interaction_type"],
            Self::TeacherInteraction => &["teacher_id", "student_id"],
            Self::CourseRecord => &["student_id", "course_id"],
            Self::ErrorRecord => &["student_id", "course_id", "error_text"],
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw record from an education data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportRecord {
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub timestamp: DateTime<Utc>,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<FieldError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn into_error(self) -> Option<GraphError> {
        let field = self.errors.first()?.field.clone();
        let message = self
            .errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        Some(GraphError::invalid_input(field, message))
    }
}

/// Check a record's data before anything is written.
pub fn validate_record(record: &ImportRecord) -> ValidationResult {
    let data = &record.data;
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if data.is_empty() {
        errors.push(FieldError {
            field: "data".into(),
            message: "data cannot be empty".into(),
        });
    }

    for field in record.record_type.required_fields() {
        if data.get(*field).is_none_or(is_blank) {
            errors.push(FieldError {
                field: (*field).into(),
                message: format!("Missing required field: {field}"),
            });
        }
    }

    match record.record_type {
        RecordType::StudentInteraction => {
            if let Some(kind) = data.get("interaction_type").filter(|v| !is_blank(v)) {
                if !matches!(kind.as_str(), Some("chat" | "like")) {
                    errors.push(FieldError {
                        field: "interaction_type".into(),
                        message: format!("Invalid interaction_type: {kind}. Must be one of chat, like"),
                    });
                }
            }
            if let (Some(from), Some(to)) = (data.get("student_id_from"), data.get("student_id_to")) {
                if from == to && !is_blank(from) {
                    warnings.push(format!("Student {} interacts with themselves", text(from)));
                }
            }
        }
        RecordType::CourseRecord => {
            if let Some(progress) = data.get("progress") {
                match as_number(progress) {
                    Some(p) if (0.0..=100.0).contains(&p) => {}
                    Some(_) => errors.push(FieldError {
                        field: "progress".into(),
                        message: "progress must be between 0 and 100".into(),
                    }),
                    None => errors.push(FieldError {
                        field: "progress".into(),
                        message: "progress must be a number".into(),
                    }),
                }
            }
        }
        RecordType::ErrorRecord => {
            if !data.contains_key("error_type_id") && !data.contains_key("error_type") {
                warnings.push("No error_type_id or error_type, filed under UNKNOWN".into());
            }
        }
        RecordType::TeacherInteraction => {}
    }

    ValidationResult {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Values that count as missing: null, empty strings, empty collections, zero and false.
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Display form of an id value, without JSON quoting.
fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ImportRecord {
    /// The batch that writes this record. Assumes the record validated.
    pub fn operations(&self) -> Vec<BatchOperation> {
        let data = &self.data;
        let at = Value::from(self.timestamp.to_rfc3339());
        let get = |key: &str| data.get(key).cloned().unwrap_or(Value::Null);
        let or = |key: &str, fallback: Value| data.get(key).filter(|v| !v.is_null()).cloned().unwrap_or(fallback);

        let student = |id_key: &str, name_key: &str| {
            let id = get(id_key);
            props([
                ("studentId", id.clone()),
                ("name", or(name_key, Value::from(format!("Student {}", text(&id))))),
            ])
        };

        let (from, to, rel_type, rel_props) = match self.record_type {
            RecordType::StudentInteraction => {
                let from = (NodeLabel::Student, student("student_id_from", "student_name_from"));
                let to = (NodeLabel::Student, student("student_id_to", "student_name_to"));
                if data.get("interaction_type").and_then(Value::as_str) == Some("like") {
                    let rel = props([
                        ("likeCount", or("like_count", Value::from(1))),
                        ("lastLikeDate", at.clone()),
                    ]);
                    (from, to, RelationshipType::Likes, rel)
                } else {
                    let rel = props([
                        ("messageCount", or("message_count", Value::from(1))),
                        ("lastInteractionDate", at.clone()),
                        ("topics", get("topics")),
                    ]);
                    (from, to, RelationshipType::ChatWith, rel)
                }
            }
            RecordType::TeacherInteraction => {
                let teacher_id = get("teacher_id");
                let teacher = props([
                    ("teacherId", teacher_id.clone()),
                    ("name", or("teacher_name", Value::from(format!("Teacher {}", text(&teacher_id))))),
                    ("subject", get("subject")),
                ]);
                let rel = props([
                    ("interactionCount", or("interaction_count", Value::from(1))),
                    ("lastInteractionDate", at.clone()),
                    ("feedback", get("feedback")),
                ]);
                (
                    (NodeLabel::Teacher, teacher),
                    (NodeLabel::Student, student("student_id", "student_name")),
                    RelationshipType::Teaches,
                    rel,
                )
            }
            RecordType::CourseRecord => {
                let course_id = get("course_id");
                let course = props([
                    ("courseId", course_id.clone()),
                    ("name", or("course_name", Value::from(format!("Course {}", text(&course_id))))),
                    ("description", get("course_description")),
                    ("difficulty", get("difficulty")),
                ]);
                let progress = data.get("progress").and_then(as_number).unwrap_or(0.0);
                let rel = props([
                    ("enrollmentDate", or("enrollment_date", at.clone())),
                    ("progress", Value::from(progress)),
                    ("completionDate", get("completion_date")),
                    ("timeSpent", get("time_spent")),
                ]);
                (
                    (NodeLabel::Student, student("student_id", "student_name")),
                    (NodeLabel::Course, course),
                    RelationshipType::Learns,
                    rel,
                )
            }
            RecordType::ErrorRecord => {
                let error_type_id = data
                    .get("error_type_id")
                    .or_else(|| data.get("error_type"))
                    .filter(|v| !is_blank(v))
                    .cloned()
                    .unwrap_or_else(|| Value::from("UNKNOWN"));
                let error_type = props([
                    ("errorTypeId", error_type_id),
                    ("name", or("error_type", Value::from("Unknown Error"))),
                    ("description", or("error_text", Value::from(""))),
                    ("severity", get("severity")),
                ]);
                let rel = props([
                    (OCCURRENCE_COUNT, or("occurrence_count", Value::from(1))),
                    (FIRST_OCCURRENCE, or("first_occurrence", at.clone())),
                    (LAST_OCCURRENCE, at.clone()),
                    ("courseId", get("course_id")),
                    ("resolved", or("resolved", Value::from(false))),
                ]);
                (
                    (NodeLabel::Student, student("student_id", "student_name")),
                    (NodeLabel::ErrorType, error_type),
                    RelationshipType::HasError,
                    rel,
                )
            }
        };

        vec![
            BatchOperation::CreateNode {
                label: from.0,
                properties: from.1,
                strategy: ConflictStrategy::MergeProperties,
            },
            BatchOperation::CreateNode {
                label: to.0,
                properties: to.1,
                strategy: ConflictStrategy::MergeProperties,
            },
            BatchOperation::CreateRelationship {
                from: NodeRef::Operation(0),
                to: NodeRef::Operation(1),
                rel_type,
                properties: rel_props,
                strategy: ConflictStrategy::TimestampPriority,
            },
        ]
    }
}

/// Build a property map, leaving out nulls.
fn props<const N: usize>(entries: [(&str, Value); N]) -> Properties {
    entries
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Live progress of an import.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub import_id: String,
    pub total_records: usize,
    pub processed_records: usize,
    pub successful_records: usize,
    pub failed_records: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub progress_percentage: f64,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub estimated_remaining_secs: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub import_id: String,
    pub total_records: usize,
    pub success_count: usize,
    pub failure_count: usize,
    /// One descriptor per failed record; `index` is the record's position.
    pub errors: Vec<ErrorDescriptor>,
    pub total_time_secs: f64,
    pub records_per_second: f64,
}

/// Shared view of the progress of the import currently (or last) running.
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle(Arc<Mutex<Option<ImportProgress>>>);

impl ProgressHandle {
    pub fn snapshot(&self) -> Option<ImportProgress> {
        self.0.lock().ok().and_then(|p| p.clone())
    }

    fn set(&self, progress: ImportProgress) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(progress);
        }
    }
}

/// Imports raw records through the batch executor.
#[derive(Clone)]
pub struct Importer {
    executor: BatchExecutor,
    progress: ProgressHandle,
}

impl Importer {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            executor: BatchExecutor::new(store),
            progress: ProgressHandle::default(),
        }
    }

    /// Handle for observing progress from another task.
    pub fn progress_handle(&self) -> ProgressHandle {
        self.progress.clone()
    }

    /// Import `records` in chunks of `batch_size`.
    pub async fn import(&self, records: &[ImportRecord], batch_size: usize) -> GraphResult<ImportResult> {
        if !(1..=MAX_BATCH_SIZE).contains(&batch_size) {
            return Err(GraphError::invalid_input(
                "batchSize",
                format!("batch_size must be between 1 and {MAX_BATCH_SIZE}"),
            ));
        }

        let import_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let total = records.len();
        let total_batches = total.div_ceil(batch_size);
        let mut progress = ImportProgress {
            import_id: import_id.clone(),
            total_records: total,
            processed_records: 0,
            successful_records: 0,
            failed_records: 0,
            current_batch: 0,
            total_batches,
            progress_percentage: 0.0,
            started_at: Utc::now(),
            elapsed_secs: 0.0,
            estimated_remaining_secs: None,
        };
        self.progress.set(progress.clone());
        info!(import_id = %import_id, total_records = total, batch_size, total_batches, "Import started");

        let mut errors = Vec::new();
        for (batch_index, chunk) in records.chunks(batch_size).enumerate() {
            progress.current_batch = batch_index + 1;
            info!(import_id = %import_id, batch = batch_index + 1, size = chunk.len(), "Processing import batch");

            for (offset, record) in chunk.iter().enumerate() {
                let index = batch_index * batch_size + offset;
                match self.import_record(index, record).await {
                    Ok(()) => progress.successful_records += 1,
                    Err(failure) => {
                        if failure.code == "INVALID_INPUT" {
                            warn!(import_id = %import_id, index, record_type = %record.record_type, error = %failure.message, "Record validation failed");
                        } else {
                            error!(import_id = %import_id, index, record_type = %record.record_type, code = %failure.code, error = %failure.message, "Record processing failed");
                        }
                        errors.push(failure);
                        progress.failed_records += 1;
                    }
                }

                progress.processed_records += 1;
                let elapsed = started.elapsed().as_secs_f64();
                progress.elapsed_secs = elapsed;
                progress.progress_percentage = progress.processed_records as f64 / total as f64 * 100.0;
                progress.estimated_remaining_secs =
                    Some(elapsed / progress.processed_records as f64 * (total - progress.processed_records) as f64);
                self.progress.set(progress.clone());
            }
        }

        let total_time_secs = started.elapsed().as_secs_f64();
        let records_per_second = if total_time_secs > 0.0 {
            total as f64 / total_time_secs
        } else {
            0.0
        };
        info!(
            import_id = %import_id,
            success_count = progress.successful_records,
            failure_count = progress.failed_records,
            total_time_secs,
            records_per_second,
            "Import completed"
        );

        Ok(ImportResult {
            import_id,
            total_records: total,
            success_count: progress.successful_records,
            failure_count: progress.failed_records,
            errors,
            total_time_secs,
            records_per_second,
        })
    }

    /// Validate and write one record. A batch failure keeps its error code,
    /// re-indexed to the record's position.
    async fn import_record(&self, index: usize, record: &ImportRecord) -> Result<(), ErrorDescriptor> {
        let operation = record.record_type.as_str();
        let validation = validate_record(record);
        for warning in &validation.warnings {
            warn!(index, record_type = %record.record_type, warning = %warning, "Record warning");
        }
        if let Some(err) = validation.into_error() {
            return Err(err.describe(Some(index), operation));
        }

        let result = self
            .executor
            .execute_batch(&record.operations(), true)
            .await
            .map_err(|e| e.describe(Some(index), operation))?;
        if result.success {
            return Ok(());
        }
        Err(match result.errors.into_iter().next() {
            Some(failure) => ErrorDescriptor {
                index: Some(index),
                operation: format!("{operation}/{}", failure.operation),
                ..failure
            },
            None => GraphError::Query("record batch rolled back".into()).describe(Some(index), operation),
        })
    }
}
