//! Recording and replay sessions: shared snapshot shape, summaries and the
//! collaborators both controllers talk to.

pub mod recording;
pub mod replay;
pub mod state;

pub use recording::{RecordingController, RecordingOutcome};
pub use replay::{ReplayController, ReplayOutcome, ReplayRequest};
pub use state::{validate_transition, SessionStatus};

use crate::errors::ReplayError;
use crate::events::EngineEvent;
use crate::field_mapping::FieldMapping;
use crate::logging::RunLogger;
use crate::pause::PauseReason;
use crate::retry::{ExecuteOptions, RetryingActionExecutor};
use crate::runtime::Clock;
use crate::store::{SessionStateStore, Store};
use crate::surface::RemoteAction;
use crate::types::{DataRow, ResultCounts, SessionKind, Step, StepResult, StepStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Everything needed to rebuild a session after a cold start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub kind: SessionKind,
    pub project_id: i64,
    pub target_id: String,
    pub status: SessionStatus,
    pub started_at: i64,
    #[serde(default)]
    pub paused_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub total_paused_ms: u64,
    #[serde(default)]
    pub pause_reason: Option<PauseReason>,
    #[serde(default)]
    pub current_row: usize,
    #[serde(default)]
    pub current_step: usize,
    #[serde(default)]
    pub total_rows: usize,
    #[serde(default)]
    pub total_steps: usize,
    #[serde(default)]
    pub counts: ResultCounts,
    #[serde(default)]
    pub step_mode: bool,
    /// Captured steps for a recording, the plan for a replay.
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub rows: Vec<DataRow>,
    #[serde(default)]
    pub mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub results: Vec<StepResult>,
    #[serde(default)]
    pub log_mark: u64,
}

impl SessionSnapshot {
    pub fn new(
        kind: SessionKind,
        session_id: String,
        project_id: i64,
        target_id: String,
        now: i64,
        log_mark: u64,
    ) -> Self {
        Self {
            session_id,
            kind,
            project_id,
            target_id,
            status: SessionStatus::working(kind),
            started_at: now,
            paused_at: None,
            completed_at: None,
            total_paused_ms: 0,
            pause_reason: None,
            current_row: 0,
            current_step: 0,
            total_rows: 0,
            total_steps: 0,
            counts: ResultCounts::default(),
            step_mode: false,
            steps: Vec::new(),
            rows: Vec::new(),
            mappings: Vec::new(),
            results: Vec::new(),
            log_mark,
        }
    }

    pub fn transition(&mut self, next: SessionStatus) -> Result<(), ReplayError> {
        validate_transition(self.kind, self.status, next)?;
        self.status = next;
        Ok(())
    }

    pub fn mark_paused(&mut self, reason: PauseReason, now: i64) -> Result<(), ReplayError> {
        self.transition(SessionStatus::Paused)?;
        self.paused_at = Some(now);
        self.pause_reason = Some(reason);
        Ok(())
    }

    /// Folds the finished pause interval into the running total; returns its length.
    pub fn mark_resumed(&mut self, now: i64) -> Result<u64, ReplayError> {
        self.transition(SessionStatus::working(self.kind))?;
        let paused_ms = self
            .paused_at
            .take()
            .map(|at| u64::try_from(now.saturating_sub(at)).unwrap_or(0))
            .unwrap_or(0);
        self.total_paused_ms += paused_ms;
        self.pause_reason = None;
        Ok(paused_ms)
    }

    /// Cumulative pause time including an in-progress pause.
    pub fn paused_ms_at(&self, now: i64) -> u64 {
        let current = self
            .paused_at
            .map(|at| u64::try_from(now.saturating_sub(at)).unwrap_or(0))
            .unwrap_or(0);
        self.total_paused_ms + current
    }

    pub fn is_exhausted(&self) -> bool {
        self.current_row >= self.total_rows
    }

    /// Moves the cursor lexicographically over (row, step).
    pub fn advance_cursor(&mut self) {
        self.current_step += 1;
        if self.current_step >= self.total_steps {
            self.current_step = 0;
            self.current_row += 1;
        }
    }

    /// Percentage of the row/step grid already visited.
    pub fn progress(&self) -> f64 {
        let grid = self.total_steps * self.total_rows;
        if grid == 0 {
            return 0.0;
        }
        let done = (self.current_row * self.total_steps + self.current_step).min(grid);
        done as f64 * 100.0 / grid as f64
    }

    /// (rows with no failed step, rows with at least one failure) among rows touched.
    pub fn row_tally(&self) -> (usize, usize) {
        let mut rows: BTreeMap<usize, bool> = BTreeMap::new();
        for result in &self.results {
            let failed = rows.entry(result.row_index).or_insert(false);
            *failed |= result.status == StepStatus::Failed;
        }
        let failed = rows.values().filter(|failed| **failed).count();
        (rows.len() - failed, failed)
    }

    pub fn summary(&self) -> SessionSummary {
        let (rows_passed, rows_failed) = self.row_tally();
        SessionSummary {
            session_id: self.session_id.clone(),
            kind: self.kind,
            project_id: self.project_id,
            status: self.status,
            counts: self.counts,
            total_steps: self.total_steps,
            total_rows: self.total_rows,
            rows_passed,
            rows_failed,
            steps_recorded: match self.kind {
                SessionKind::Recording => self.steps.len(),
                SessionKind::Replay => 0,
            },
            started_at: self.started_at,
            completed_at: self.completed_at,
            total_paused_ms: self.total_paused_ms,
        }
    }

    pub fn report(&self, now: i64) -> StatusReport {
        StatusReport {
            kind: self.kind,
            session_id: self.session_id.clone(),
            project_id: self.project_id,
            target_id: self.target_id.clone(),
            status: self.status,
            progress: self.progress(),
            counts: self.counts,
            current_row: self.current_row,
            current_step: self.current_step,
            total_rows: self.total_rows,
            total_steps: self.total_steps,
            total_paused_ms: self.paused_ms_at(now),
            step_mode: self.step_mode,
            steps_recorded: match self.kind {
                SessionKind::Recording => self.steps.len(),
                SessionKind::Replay => 0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub kind: SessionKind,
    pub project_id: i64,
    pub status: SessionStatus,
    pub counts: ResultCounts,
    pub total_steps: usize,
    pub total_rows: usize,
    pub rows_passed: usize,
    pub rows_failed: usize,
    pub steps_recorded: usize,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub total_paused_ms: u64,
}

/// What `getStatus` reports for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub kind: SessionKind,
    pub session_id: String,
    pub project_id: i64,
    pub target_id: String,
    pub status: SessionStatus,
    pub progress: f64,
    pub counts: ResultCounts,
    pub current_row: usize,
    pub current_step: usize,
    pub total_rows: usize,
    pub total_steps: usize,
    pub total_paused_ms: u64,
    pub step_mode: bool,
    pub steps_recorded: usize,
}

/// Collaborators shared by both controllers.
pub struct SessionContext {
    pub store: Arc<dyn Store>,
    pub executor: Arc<RetryingActionExecutor>,
    pub logger: Arc<RunLogger>,
    pub clock: Arc<dyn Clock>,
    pub execute_options: ExecuteOptions,
    events: broadcast::Sender<EngineEvent>,
    sequence: AtomicU64,
}

impl SessionContext {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<RetryingActionExecutor>,
        logger: Arc<RunLogger>,
        clock: Arc<dyn Clock>,
        execute_options: ExecuteOptions,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            store,
            executor,
            logger,
            clock,
            execute_options,
            events,
            sequence: AtomicU64::new(1),
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.now_unix_ms()
    }

    pub fn next_session_id(&self, kind: SessionKind, project_id: i64) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}-{project_id}-{}-{seq}", kind.as_str(), self.now())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        // No receivers is not an error.
        let _ = self.events.send(event);
    }

    /// Best-effort snapshot write; failures are logged and the session carries on.
    pub async fn persist(&self, kind: SessionKind, snapshot: Option<&SessionSnapshot>) -> bool {
        match self.store.save(kind, snapshot).await {
            Ok(()) => true,
            Err(err) => {
                self.logger.append(
                    "warn",
                    "session.snapshot.save_failed",
                    json!({
                        "kind": kind.as_str(),
                        "session_id": snapshot.map(|s| s.session_id.clone()),
                        "error": err.to_string(),
                    }),
                );
                false
            }
        }
    }

    /// Tells the remote surface about a lifecycle change. Failure is a warning only.
    pub async fn notify(&self, target_id: &str, action: RemoteAction) -> bool {
        let action_id = action.action_id();
        let outcome = self
            .executor
            .execute(target_id, &action, self.execute_options)
            .await
            .into_result(&action_id);
        match outcome {
            Ok(_) => true,
            Err(err) => {
                self.logger.append(
                    "warn",
                    "session.notify_failed",
                    json!({
                        "target_id": target_id,
                        "action_id": action_id,
                        "code": err.code(),
                        "error": err.to_string(),
                    }),
                );
                false
            }
        }
    }
}

pub(crate) fn validate_start(project_id: i64, target_id: &str) -> Result<(), ReplayError> {
    if project_id < 0 {
        return Err(ReplayError::Validation(format!(
            "project_id must be non-negative, got {project_id}"
        )));
    }
    if target_id.trim().is_empty() {
        return Err(ReplayError::Validation(
            "target_id must not be empty".to_string(),
        ));
    }
    Ok(())
}
