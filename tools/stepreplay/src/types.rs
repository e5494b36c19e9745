use crate::errors::ReplayError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One row of tabular input data, keyed by column name.
pub type DataRow = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepEvent {
    Click,
    Input,
    Enter,
    Open,
}

impl StepEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Input => "input",
            Self::Enter => "enter",
            Self::Open => "open",
        }
    }

    /// Only these events take a substituted value during replay.
    pub fn accepts_injection(self) -> bool {
        matches!(self, Self::Input | Self::Click)
    }
}

/// A recorded user action. Never mutated after capture; replay derives copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub id: String,
    pub event: StepEvent,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl Step {
    pub fn new(event: StepEvent, path: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            event,
            path: path.into(),
            value: None,
            label: None,
            x: 0,
            y: 0,
            timestamp: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn validate(&self) -> Result<(), ReplayError> {
        if self.event != StepEvent::Open && self.path.trim().is_empty() {
            return Err(ReplayError::Validation(format!(
                "{} step requires a non-empty path",
                self.event.as_str()
            )));
        }
        Ok(())
    }

    pub fn has_value(&self) -> bool {
        self.value.as_deref().is_some_and(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub row_index: usize,
    pub step_id: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Recording,
    Replay,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recording => "recording",
            Self::Replay => "replay",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultCounts {
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl ResultCounts {
    pub fn record(&mut self, status: StepStatus) {
        match status {
            StepStatus::Passed => self.passed += 1,
            StepStatus::Failed => self.failed += 1,
            StepStatus::Skipped => self.skipped += 1,
            StepStatus::Pending | StepStatus::Running => {}
        }
    }

    pub fn total(&self) -> u64 {
        self.passed.saturating_add(self.failed).saturating_add(self.skipped)
    }
}
