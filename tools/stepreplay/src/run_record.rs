//! Validated construction of the persisted run record.

use crate::errors::ReplayError;
use crate::types::{ResultCounts, StepResult, StepStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub project_id: i64,
    pub status: RunStatus,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub total_steps: i64,
    pub passed_steps: i64,
    pub failed_steps: i64,
    pub results: Vec<StepResult>,
    /// All session log lines joined by newlines. Never a list.
    pub logs: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid run record: {}", render_fields(.fields))]
pub struct RunRecordValidationError {
    pub fields: Vec<FieldError>,
}

impl RunRecordValidationError {
    pub fn has_field(&self, field: &str) -> bool {
        self.fields.iter().any(|entry| entry.field == field)
    }
}

fn render_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<RunRecordValidationError> for ReplayError {
    fn from(value: RunRecordValidationError) -> Self {
        ReplayError::Validation(value.to_string())
    }
}

/// Accumulates fields incrementally; `build` validates, `build_unsafe` fills defaults.
#[derive(Debug, Clone, Default)]
pub struct RunRecordBuilder {
    project_id: Option<i64>,
    status: Option<String>,
    started_at: Option<i64>,
    ended_at: Option<i64>,
    total_steps: Option<i64>,
    passed_steps: Option<i64>,
    failed_steps: Option<i64>,
    results: Vec<StepResult>,
    logs: Option<String>,
    logs_type_error: Option<String>,
    results_error: Option<String>,
}

impl RunRecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project_id(mut self, project_id: i64) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status.as_str().to_string());
        self
    }

    /// Raw status text, checked against the closed set at build time.
    pub fn status_str(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn started_at(mut self, unix_ms: i64) -> Self {
        self.started_at = Some(unix_ms);
        self
    }

    pub fn ended_at(mut self, unix_ms: i64) -> Self {
        self.ended_at = Some(unix_ms);
        self
    }

    pub fn total_steps(mut self, total: i64) -> Self {
        self.total_steps = Some(total);
        self
    }

    pub fn passed_steps(mut self, passed: i64) -> Self {
        self.passed_steps = Some(passed);
        self
    }

    pub fn failed_steps(mut self, failed: i64) -> Self {
        self.failed_steps = Some(failed);
        self
    }

    pub fn counts(self, counts: ResultCounts) -> Self {
        self.total_steps(count_to_i64(counts.total()))
            .passed_steps(count_to_i64(counts.passed))
            .failed_steps(count_to_i64(counts.failed))
    }

    pub fn results(mut self, results: Vec<StepResult>) -> Self {
        self.results = results;
        self.results_error = None;
        self
    }

    pub fn logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = Some(logs.into());
        self.logs_type_error = None;
        self
    }

    pub fn logs_lines(self, lines: &[String]) -> Self {
        self.logs(lines.join("\n"))
    }

    /// Seeds a builder from untyped JSON such as a stored provisional record.
    pub fn from_value(value: &Value) -> Self {
        let mut builder = Self::new();
        builder.project_id = value.get("project_id").and_then(Value::as_i64);
        builder.status = value
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string);
        builder.started_at = value.get("started_at").and_then(Value::as_i64);
        builder.ended_at = value.get("ended_at").and_then(Value::as_i64);
        builder.total_steps = value.get("total_steps").and_then(Value::as_i64);
        builder.passed_steps = value.get("passed_steps").and_then(Value::as_i64);
        builder.failed_steps = value.get("failed_steps").and_then(Value::as_i64);
        match value.get("results") {
            None | Some(Value::Null) => {}
            Some(results) => match serde_json::from_value(results.clone()) {
                Ok(results) => builder.results = results,
                Err(err) => builder.results_error = Some(format!("could not be decoded: {err}")),
            },
        }
        match value.get("logs") {
            None | Some(Value::Null) => {}
            Some(Value::String(logs)) => builder.logs = Some(logs.clone()),
            Some(Value::Array(_)) => {
                builder.logs_type_error =
                    Some("must be one concatenated string, not a list".to_string())
            }
            Some(_) => builder.logs_type_error = Some("must be a string".to_string()),
        }
        builder
    }

    pub fn build(self) -> Result<RunRecord, RunRecordValidationError> {
        let mut fields = Vec::new();
        let mut fail = |field: &'static str, message: String| {
            fields.push(FieldError { field, message });
        };

        match self.project_id {
            None => fail("project_id", "is required".to_string()),
            Some(id) if id < 0 => fail("project_id", format!("must be non-negative, got {id}")),
            Some(_) => {}
        }
        let status = match self.status.as_deref() {
            None => {
                fail("status", "is required".to_string());
                None
            }
            Some(raw) => {
                let parsed = RunStatus::parse(raw);
                if parsed.is_none() {
                    fail(
                        "status",
                        format!("must be one of pending|running|completed|failed, got {raw:?}"),
                    );
                }
                parsed
            }
        };
        match self.started_at {
            None => fail("started_at", "is required".to_string()),
            Some(ts) if ts <= 0 => fail("started_at", format!("is not a valid timestamp: {ts}")),
            Some(_) => {}
        }
        if let (Some(started), Some(ended)) = (self.started_at, self.ended_at) {
            if ended < started {
                fail("ended_at", "precedes started_at".to_string());
            }
        }
        for (field, value) in [
            ("total_steps", self.total_steps),
            ("passed_steps", self.passed_steps),
            ("failed_steps", self.failed_steps),
        ] {
            if let Some(count) = value.filter(|count| *count < 0) {
                fail(field, format!("must be non-negative, got {count}"));
            }
        }
        let total = self.total_steps.unwrap_or(0);
        let passed = self.passed_steps.unwrap_or(0);
        let failed = self.failed_steps.unwrap_or(0);
        if passed.saturating_add(failed) > total {
            fail(
                "passed_steps",
                format!("passed ({passed}) + failed ({failed}) exceeds total ({total})"),
            );
        }
        if let Some(message) = self.results_error.clone() {
            fail("results", message);
        }
        if let Some(message) = self.logs_type_error.clone() {
            fail("logs", message);
        }

        match (fields.is_empty(), status) {
            (true, Some(status)) => Ok(RunRecord {
                project_id: self.project_id.unwrap_or_default(),
                status,
                started_at: self.started_at.unwrap_or_default(),
                ended_at: self.ended_at,
                total_steps: total,
                passed_steps: passed,
                failed_steps: failed,
                results: self.results,
                logs: self.logs.unwrap_or_default(),
            }),
            _ => Err(RunRecordValidationError { fields }),
        }
    }

    /// Provisional record: missing or invalid fields fall back to defaults.
    pub fn build_unsafe(self) -> RunRecord {
        RunRecord {
            project_id: self.project_id.unwrap_or(0),
            status: self
                .status
                .as_deref()
                .and_then(RunStatus::parse)
                .unwrap_or(RunStatus::Pending),
            started_at: self.started_at.unwrap_or(0),
            ended_at: self.ended_at,
            total_steps: self.total_steps.unwrap_or(0),
            passed_steps: self.passed_steps.unwrap_or(0),
            failed_steps: self.failed_steps.unwrap_or(0),
            results: self.results,
            logs: self.logs.unwrap_or_default(),
        }
    }
}

fn count_to_i64(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

/// Completed when nothing failed, failed otherwise.
pub fn final_status(results: &[StepResult]) -> RunStatus {
    if results
        .iter()
        .any(|result| result.status == StepStatus::Failed)
    {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> RunRecordBuilder {
        RunRecordBuilder::new()
            .project_id(7)
            .status(RunStatus::Completed)
            .started_at(1_700_000_000_000)
            .ended_at(1_700_000_005_000)
    }

    #[test]
    fn rejects_counts_exceeding_total() {
        let err = base()
            .total_steps(10)
            .passed_steps(8)
            .failed_steps(5)
            .build()
            .expect_err("8 + 5 > 10");
        assert!(err.has_field("passed_steps"));
        assert!(err.to_string().contains("exceeds total (10)"));
    }

    #[test]
    fn accepts_counts_equal_to_total() {
        let record = base()
            .total_steps(10)
            .passed_steps(6)
            .failed_steps(4)
            .logs_lines(&["one".to_string(), "two".to_string()])
            .build()
            .expect("valid record");
        assert_eq!(record.passed_steps + record.failed_steps, record.total_steps);
        assert_eq!(record.logs, "one\ntwo");
    }

    #[test]
    fn lists_every_failing_field() {
        let err = RunRecordBuilder::new()
            .project_id(-1)
            .status_str("finished")
            .total_steps(-2)
            .build()
            .expect_err("invalid");
        for field in ["project_id", "status", "started_at", "total_steps"] {
            assert!(err.has_field(field), "missing {field} in {err}");
        }
    }

    #[test]
    fn list_shaped_logs_are_rejected() {
        let value = json!({
            "project_id": 1,
            "status": "completed",
            "started_at": 10,
            "logs": ["a", "b"],
        });
        let err = RunRecordBuilder::from_value(&value)
            .build()
            .expect_err("logs list");
        assert!(err.has_field("logs"));
        assert_eq!(err.fields.len(), 1);
    }

    #[test]
    fn undecodable_results_are_reported_not_dropped() {
        let value = json!({
            "project_id": 1,
            "status": "completed",
            "started_at": 10,
            "total_steps": 1,
            "passed_steps": 1,
            "results": [{"step_index": 0, "row_index": 0, "status": "passed"}],
            "logs": "",
        });
        let err = RunRecordBuilder::from_value(&value)
            .build()
            .expect_err("results missing fields");
        assert!(err.has_field("results"), "{err}");
        assert_eq!(err.fields.len(), 1);

        let record = RunRecordBuilder::from_value(&value)
            .results(Vec::new())
            .build()
            .expect("explicit results replace the bad input");
        assert!(record.results.is_empty());
    }

    #[test]
    fn counts_saturate_instead_of_wrapping() {
        let counts = ResultCounts {
            passed: u64::MAX,
            failed: 0,
            skipped: 0,
        };
        let record = base().counts(counts).build_unsafe();
        assert_eq!(record.passed_steps, i64::MAX);
        assert_eq!(record.total_steps, i64::MAX);
    }

    #[test]
    fn build_unsafe_fills_defaults_for_provisional_records() {
        let record = RunRecordBuilder::new().project_id(3).build_unsafe();
        assert_eq!(record.status, RunStatus::Pending);
        assert_eq!(record.total_steps, 0);
        assert!(record.logs.is_empty());
    }

    #[test]
    fn validation_error_converts_to_replay_error() {
        let err: ReplayError = RunRecordBuilder::new()
            .build()
            .expect_err("empty")
            .into();
        assert_eq!(err.code(), "validation_error");
    }
}
