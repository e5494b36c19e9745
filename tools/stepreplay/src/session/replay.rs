use super::{
    validate_start, SessionContext, SessionSnapshot, SessionStatus, SessionSummary, StatusReport,
};
use crate::errors::ReplayError;
use crate::events::EngineEvent;
use crate::field_mapping::{validate_mapping_set, FieldMapping};
use crate::injector::{InjectorOptions, ValueInjector};
use crate::pause::{PauseController, PauseReason};
use crate::run_record::{final_status, RunRecord, RunRecordBuilder, RunStatus};
use crate::step_identity::ensure_step_id;
use crate::store::{ResultStore, RunRecordStore, StepStore};
use crate::surface::RemoteAction;
use crate::types::{DataRow, SessionKind, Step, StepResult, StepStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const KIND: SessionKind = SessionKind::Replay;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRequest {
    pub project_id: i64,
    pub target_id: String,
    /// Empty means "replay what was recorded for the project".
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub rows: Vec<DataRow>,
    #[serde(default)]
    pub mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub step_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayOutcome {
    pub summary: SessionSummary,
    pub results: Vec<StepResult>,
    pub record: RunRecord,
}

struct ActiveReplay {
    snapshot: SessionSnapshot,
    injector: ValueInjector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitMode {
    Execute,
    Skip,
}

enum Unit {
    Done { result: StepResult, exhausted: bool },
    Suspended,
    Halted,
    Exhausted,
}

/// Drives one replay session over its (row, step) grid.
///
/// Work happens one unit at a time under `step_gate`, whether the unit comes
/// from the background loop or from an explicit `executeStep`/`skipStep`.
/// `stop` takes the gate too, so an in-flight action always finishes before
/// the session is flushed and cleared.
pub struct ReplayController {
    ctx: Arc<SessionContext>,
    injection: InjectorOptions,
    auto_run: bool,
    pause: Arc<PauseController>,
    state: Mutex<Option<ActiveReplay>>,
    step_gate: Mutex<()>,
    loop_running: AtomicBool,
    loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    last_outcome: std::sync::Mutex<Option<ReplayOutcome>>,
}

impl ReplayController {
    pub fn new(ctx: Arc<SessionContext>, injection: InjectorOptions, auto_run: bool) -> Self {
        let pause = Arc::new(PauseController::new(ctx.logger.clone()));
        Self {
            ctx,
            injection,
            auto_run,
            pause,
            state: Mutex::new(None),
            step_gate: Mutex::new(()),
            loop_running: AtomicBool::new(false),
            loop_handle: std::sync::Mutex::new(None),
            last_outcome: std::sync::Mutex::new(None),
        }
    }

    pub fn pause_controller(&self) -> &Arc<PauseController> {
        &self.pause
    }

    pub fn is_loop_running(&self) -> bool {
        self.loop_running.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> Option<StatusReport> {
        let now = self.ctx.now();
        self.state
            .lock()
            .await
            .as_ref()
            .map(|active| active.snapshot.report(now))
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.is_some()
    }

    pub async fn start(self: &Arc<Self>, request: ReplayRequest) -> Result<StatusReport, ReplayError> {
        validate_start(request.project_id, &request.target_id)?;
        let ReplayRequest {
            project_id,
            target_id,
            mut steps,
            rows,
            mappings,
            step_mode,
        } = request;

        let report = {
            let mut state = self.state.lock().await;
            if let Some(active) = state.as_ref() {
                return Err(ReplayError::StateConflict(format!(
                    "replay session {} is already {}",
                    active.snapshot.session_id,
                    active.snapshot.status.as_str()
                )));
            }

            if steps.is_empty() {
                steps = self.ctx.store.get_steps(project_id).await.map_err(|err| {
                    ReplayError::Persistence(format!("failed to load recorded steps: {err}"))
                })?;
            }
            if steps.is_empty() {
                return Err(ReplayError::Validation(format!(
                    "project {project_id} has no steps to replay"
                )));
            }
            let session_id = self.ctx.next_session_id(KIND, project_id);
            for (index, step) in steps.iter_mut().enumerate() {
                step.validate().map_err(|err| match err {
                    ReplayError::Validation(message) => {
                        ReplayError::Validation(format!("step {index}: {message}"))
                    }
                    other => other,
                })?;
                step.id = ensure_step_id(&session_id, project_id, index, step);
            }
            validate_mapping_set(&mappings, self.injection.case_sensitive)?;
            let mappings: Vec<FieldMapping> =
                mappings.into_iter().map(FieldMapping::normalized).collect();

            let now = self.ctx.now();
            let mut snapshot = SessionSnapshot::new(
                KIND,
                session_id,
                project_id,
                target_id.clone(),
                now,
                self.ctx.logger.mark(),
            );
            snapshot.total_steps = steps.len();
            snapshot.total_rows = rows.len().max(1);
            snapshot.step_mode = step_mode;
            snapshot.steps = steps;
            snapshot.rows = rows;
            snapshot.mappings = mappings;

            self.pause.reset();
            if step_mode {
                self.pause.enable_step_mode();
            }
            self.ctx.persist(KIND, Some(&snapshot)).await;
            let injector = ValueInjector::new(&snapshot.mappings, self.injection);
            let report = snapshot.report(now);
            *state = Some(ActiveReplay { snapshot, injector });
            report
        };
        *self
            .last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        self.ctx
            .notify(
                &target_id,
                RemoteAction::StartReplay {
                    session_id: report.session_id.clone(),
                    project_id,
                    total_rows: report.total_rows,
                    total_steps: report.total_steps,
                },
            )
            .await;
        self.ctx.logger.append(
            "info",
            "session.replay.started",
            json!({
                "session_id": report.session_id,
                "project_id": project_id,
                "target_id": target_id,
                "total_rows": report.total_rows,
                "total_steps": report.total_steps,
                "step_mode": step_mode,
            }),
        );
        self.ctx.emit(EngineEvent::Started {
            kind: KIND,
            session_id: report.session_id.clone(),
            project_id,
            target_id,
        });
        if self.auto_run {
            self.spawn_loop();
        }
        Ok(report)
    }

    pub async fn pause(&self, reason: PauseReason) -> Result<StatusReport, ReplayError> {
        let mut state = self.state.lock().await;
        let active = active_mut(&mut state)?;
        let now = self.ctx.now();
        active.snapshot.mark_paused(reason, now)?;
        self.pause.pause(reason, "paused by command");
        self.ctx.persist(KIND, Some(&active.snapshot)).await;
        self.ctx.logger.append(
            "info",
            "session.replay.paused",
            json!({
                "session_id": active.snapshot.session_id,
                "reason": reason.as_str(),
                "row": active.snapshot.current_row,
                "step": active.snapshot.current_step,
            }),
        );
        self.ctx.emit(EngineEvent::Paused {
            kind: KIND,
            session_id: active.snapshot.session_id.clone(),
        });
        Ok(active.snapshot.report(now))
    }

    pub async fn resume(self: &Arc<Self>) -> Result<StatusReport, ReplayError> {
        let report = {
            let mut state = self.state.lock().await;
            let active = active_mut(&mut state)?;
            let now = self.ctx.now();
            let paused_ms = active.snapshot.mark_resumed(now)?;
            self.pause.resume(None);
            self.ctx.persist(KIND, Some(&active.snapshot)).await;
            self.ctx.logger.append(
                "info",
                "session.replay.resumed",
                json!({ "session_id": active.snapshot.session_id, "paused_ms": paused_ms }),
            );
            self.ctx.emit(EngineEvent::Resumed {
                kind: KIND,
                session_id: active.snapshot.session_id.clone(),
                paused_ms,
            });
            active.snapshot.report(now)
        };
        if self.auto_run {
            self.spawn_loop();
        }
        Ok(report)
    }

    /// Executes the step under the cursor once, even while paused.
    pub async fn execute_step(&self) -> Result<StepResult, ReplayError> {
        self.manual_unit(UnitMode::Execute).await
    }

    /// Records the step under the cursor as skipped and advances.
    pub async fn skip_step(&self) -> Result<StepResult, ReplayError> {
        self.manual_unit(UnitMode::Skip).await
    }

    pub async fn set_step_mode(&self, enabled: bool) -> Result<StatusReport, ReplayError> {
        let mut state = self.state.lock().await;
        let active = active_mut(&mut state)?;
        active.snapshot.step_mode = enabled;
        if enabled {
            self.pause.enable_step_mode();
        } else {
            self.pause.disable_step_mode();
        }
        self.ctx.persist(KIND, Some(&active.snapshot)).await;
        Ok(active.snapshot.report(self.ctx.now()))
    }

    /// Lets the loop take exactly one unit while in step mode.
    pub async fn step(&self) -> Result<StatusReport, ReplayError> {
        let state = self.state.lock().await;
        let active = state
            .as_ref()
            .ok_or_else(|| ReplayError::StateConflict("no replay session is active".to_string()))?;
        if !active.snapshot.step_mode {
            return Err(ReplayError::StateConflict(
                "step mode is not enabled".to_string(),
            ));
        }
        self.pause.step();
        Ok(active.snapshot.report(self.ctx.now()))
    }

    /// Stops the session. Any in-flight action completes first; then results are
    /// flushed and the session is cleared. A failed flush leaves it `stopping`.
    pub async fn stop(&self) -> Result<ReplayOutcome, ReplayError> {
        let session_id = {
            let mut state = self.state.lock().await;
            let active = active_mut(&mut state)?;
            if active.snapshot.status != SessionStatus::Stopping {
                self.enter_stopping(&mut active.snapshot).await?;
            }
            active.snapshot.session_id.clone()
        };
        self.pause.disable_step_mode();
        self.pause.resume(Some("stopping".to_string()));

        let _gate = self.step_gate.lock().await;
        if !self.is_active().await {
            // The loop reached the end of the grid and closed the session itself.
            return self
                .last_outcome
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .filter(|outcome| outcome.summary.session_id == session_id)
                .ok_or_else(|| {
                    ReplayError::StateConflict("no replay session is active".to_string())
                });
        }
        let outcome = self.finalize().await;
        if outcome.is_err() {
            // The session stays `stopping`; keep the controller in step with its snapshot.
            let state = self.state.lock().await;
            if state.as_ref().is_some_and(|active| active.snapshot.step_mode) {
                self.pause.enable_step_mode();
            }
        }
        outcome
    }

    /// Reinstalls a persisted session after a restart. A running session comes back paused.
    pub async fn restore(&self, mut snapshot: SessionSnapshot) -> Result<StatusReport, ReplayError> {
        if snapshot.kind != KIND || !snapshot.status.is_active() {
            return Err(ReplayError::Validation(format!(
                "cannot restore {} session in state {}",
                snapshot.kind.as_str(),
                snapshot.status.as_str()
            )));
        }
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(ReplayError::StateConflict(
                "a replay session is already loaded".to_string(),
            ));
        }
        let now = self.ctx.now();
        snapshot.log_mark = self.ctx.logger.mark();
        if snapshot.status == SessionStatus::Running {
            snapshot.mark_paused(PauseReason::External, now)?;
            self.ctx.persist(KIND, Some(&snapshot)).await;
        }
        self.pause.reset();
        if snapshot.status == SessionStatus::Paused {
            self.pause.pause(
                snapshot.pause_reason.unwrap_or(PauseReason::External),
                "restored after restart",
            );
        }
        if snapshot.step_mode {
            self.pause.enable_step_mode();
        }
        self.ctx.logger.append(
            "info",
            "session.replay.restored",
            json!({
                "session_id": snapshot.session_id,
                "status": snapshot.status.as_str(),
                "row": snapshot.current_row,
                "step": snapshot.current_step,
            }),
        );
        let injector = ValueInjector::new(&snapshot.mappings, self.injection);
        let report = snapshot.report(now);
        *state = Some(ActiveReplay { snapshot, injector });
        Ok(report)
    }

    /// Waits for the background loop, if one was started, to exit.
    pub async fn join_loop(&self) {
        let handle = self
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn spawn_loop(self: &Arc<Self>) {
        if self.loop_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run_loop().await;
            this.loop_running.store(false, Ordering::SeqCst);
        });
        *self
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    async fn run_loop(&self) {
        loop {
            self.pause.wait_if_suspended().await;
            let gate = self.step_gate.lock().await;
            match self.run_unit(UnitMode::Execute, false).await {
                Ok(Unit::Done {
                    exhausted: false, ..
                }) => {}
                Ok(Unit::Done { exhausted: true, .. }) | Ok(Unit::Exhausted) => {
                    if let Err(err) = self.finalize().await {
                        self.ctx.logger.append(
                            "error",
                            "session.replay.completion_failed",
                            json!({ "error": err.to_string() }),
                        );
                    }
                    break;
                }
                Ok(Unit::Suspended) => {
                    drop(gate);
                    tokio::task::yield_now().await;
                }
                Ok(Unit::Halted) => break,
                Err(err) => {
                    self.ctx.logger.append(
                        "error",
                        "session.replay.loop_failed",
                        json!({ "error": err.to_string() }),
                    );
                    break;
                }
            }
        }
    }

    async fn manual_unit(&self, mode: UnitMode) -> Result<StepResult, ReplayError> {
        let _gate = self.step_gate.lock().await;
        match self.run_unit(mode, true).await? {
            Unit::Done { result, exhausted } => {
                if exhausted {
                    self.finalize().await?;
                }
                Ok(result)
            }
            Unit::Exhausted => Err(ReplayError::StateConflict(
                "every step of every row has already run".to_string(),
            )),
            Unit::Halted | Unit::Suspended => Err(ReplayError::StateConflict(
                "no running or paused replay session".to_string(),
            )),
        }
    }

    async fn run_unit(&self, mode: UnitMode, allow_paused: bool) -> Result<Unit, ReplayError> {
        let (target_id, session_id, row_index, step_index, injected) = {
            let state = self.state.lock().await;
            let Some(active) = state.as_ref() else {
                return Ok(Unit::Halted);
            };
            let snapshot = &active.snapshot;
            match snapshot.status {
                SessionStatus::Running => {}
                SessionStatus::Paused if allow_paused => {}
                SessionStatus::Paused => return Ok(Unit::Suspended),
                _ => return Ok(Unit::Halted),
            }
            if snapshot.is_exhausted() {
                return Ok(Unit::Exhausted);
            }
            let row_index = snapshot.current_row;
            let step_index = snapshot.current_step;
            let empty = DataRow::new();
            let row = snapshot.rows.get(row_index).unwrap_or(&empty);
            let step = snapshot.steps.get(step_index).ok_or_else(|| {
                ReplayError::StateConflict(format!("cursor step {step_index} is out of range"))
            })?;
            (
                snapshot.target_id.clone(),
                snapshot.session_id.clone(),
                row_index,
                step_index,
                active.injector.inject_positioned(step_index, row, step),
            )
        };

        let started = Instant::now();
        let (status, error) = if mode == UnitMode::Skip || injected.skipped {
            (StepStatus::Skipped, None)
        } else {
            let action = RemoteAction::ExecuteStep {
                session_id: session_id.clone(),
                row_index,
                step_index,
                step: injected.injected_step.clone(),
            };
            let outcome = self
                .ctx
                .executor
                .execute(&target_id, &action, self.ctx.execute_options)
                .await;
            if outcome.success {
                (StepStatus::Passed, None)
            } else {
                (StepStatus::Failed, outcome.error)
            }
        };
        let result = StepResult {
            step_index,
            row_index,
            step_id: injected.injected_step.id.clone(),
            status,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            error,
            timestamp: self.ctx.now(),
        };

        let mut state = self.state.lock().await;
        let Some(active) = state
            .as_mut()
            .filter(|active| active.snapshot.session_id == session_id)
        else {
            return Ok(Unit::Halted);
        };
        let snapshot = &mut active.snapshot;
        snapshot.results.push(result.clone());
        snapshot.counts.record(status);
        snapshot.advance_cursor();
        let exhausted = snapshot.is_exhausted() && snapshot.status != SessionStatus::Stopping;
        self.ctx.persist(KIND, Some(&*snapshot)).await;

        self.ctx.logger.append(
            if status == StepStatus::Failed { "warn" } else { "debug" },
            "session.replay.step_result",
            json!({
                "session_id": session_id,
                "row": row_index,
                "step": step_index,
                "status": status.as_str(),
                "source": injected.source,
                "column": injected.column,
                "error": result.error,
            }),
        );
        self.ctx.emit(EngineEvent::StepResult {
            session_id,
            result: result.clone(),
            progress: snapshot.progress(),
        });
        Ok(Unit::Done { result, exhausted })
    }

    async fn enter_stopping(&self, snapshot: &mut SessionSnapshot) -> Result<(), ReplayError> {
        let now = self.ctx.now();
        if snapshot.status == SessionStatus::Paused {
            snapshot.total_paused_ms = snapshot.paused_ms_at(now);
            snapshot.paused_at = None;
        }
        snapshot.transition(SessionStatus::Stopping)?;
        self.ctx.persist(KIND, Some(&*snapshot)).await;
        self.ctx
            .notify(
                &snapshot.target_id,
                RemoteAction::StopReplay {
                    session_id: snapshot.session_id.clone(),
                },
            )
            .await;
        Ok(())
    }

    /// Flushes results and the run record, then clears the session. Caller holds `step_gate`.
    async fn finalize(&self) -> Result<ReplayOutcome, ReplayError> {
        let mut state = self.state.lock().await;
        let active = active_mut(&mut state)?;
        let snapshot = &mut active.snapshot;
        if snapshot.status != SessionStatus::Stopping {
            self.enter_stopping(snapshot).await?;
        }

        let now = self.ctx.now();
        let record = RunRecordBuilder::new()
            .project_id(snapshot.project_id)
            .status(final_status(&snapshot.results))
            .started_at(snapshot.started_at)
            .ended_at(now.max(snapshot.started_at))
            .counts(snapshot.counts)
            .results(snapshot.results.clone())
            .logs(self.ctx.logger.concatenated_since(snapshot.log_mark))
            .build()?;

        let flushed = match self
            .ctx
            .store
            .add_results(&snapshot.session_id, &record.results)
            .await
        {
            Ok(()) => self
                .ctx
                .store
                .save_run(&snapshot.session_id, &record)
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        };
        if let Err(err) = flushed {
            self.ctx.logger.append(
                "error",
                "session.replay.flush_failed",
                json!({ "session_id": snapshot.session_id, "error": err.to_string() }),
            );
            self.ctx.emit(EngineEvent::Failed {
                kind: KIND,
                session_id: snapshot.session_id.clone(),
                error: err.to_string(),
            });
            return Err(ReplayError::Persistence(format!(
                "failed to flush replay results: {err}"
            )));
        }

        snapshot.transition(match record.status {
            RunStatus::Failed => SessionStatus::Failed,
            _ => SessionStatus::Completed,
        })?;
        snapshot.completed_at = Some(now);
        let summary = snapshot.summary();
        let results = std::mem::take(&mut snapshot.results);
        *state = None;
        drop(state);
        self.ctx.persist(KIND, None).await;
        self.pause.reset();

        self.ctx.logger.append(
            "info",
            "session.replay.completed",
            json!({
                "session_id": summary.session_id,
                "status": summary.status.as_str(),
                "passed": summary.counts.passed,
                "failed": summary.counts.failed,
                "skipped": summary.counts.skipped,
                "rows_passed": summary.rows_passed,
                "rows_failed": summary.rows_failed,
            }),
        );
        self.ctx.emit(EngineEvent::Completed {
            kind: KIND,
            session_id: summary.session_id.clone(),
            summary: summary.clone(),
        });
        let outcome = ReplayOutcome {
            summary,
            results,
            record,
        };
        *self
            .last_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outcome.clone());
        Ok(outcome)
    }
}

fn active_mut(state: &mut Option<ActiveReplay>) -> Result<&mut ActiveReplay, ReplayError> {
    state
        .as_mut()
        .ok_or_else(|| ReplayError::StateConflict("no replay session is active".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{harness, Harness};
    use crate::store::SessionStateStore;
    use crate::types::{ResultCounts, StepEvent};
    use std::time::Duration;
    use tokio::time::timeout;

    fn controller(h: &Harness, auto_run: bool) -> Arc<ReplayController> {
        Arc::new(ReplayController::new(
            h.ctx.clone(),
            InjectorOptions::default(),
            auto_run,
        ))
    }

    fn steps(count: usize) -> Vec<Step> {
        (0..count)
            .map(|index| Step::new(StepEvent::Click, format!("//button[{index}]")))
            .collect()
    }

    fn rows(count: usize) -> Vec<DataRow> {
        (0..count)
            .map(|index| DataRow::from([("row".to_string(), index.to_string())]))
            .collect()
    }

    fn request(project_id: i64, row_count: usize, step_count: usize) -> ReplayRequest {
        ReplayRequest {
            project_id,
            target_id: "tab-1".to_string(),
            steps: steps(step_count),
            rows: rows(row_count),
            ..ReplayRequest::default()
        }
    }

    async fn next_step_result(h: &mut Harness) -> StepResult {
        loop {
            let event = timeout(Duration::from_secs(2), h.events.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            if let EngineEvent::StepResult { result, .. } = event {
                return result;
            }
        }
    }

    #[tokio::test]
    async fn second_start_conflicts_without_touching_active_session() {
        let h = harness();
        let replay = controller(&h, false);
        let first = replay.start(request(1, 2, 2)).await.expect("first start");

        let err = replay
            .start(request(2, 1, 1))
            .await
            .expect_err("second start must fail");
        assert_eq!(err.code(), "state_conflict");

        let status = replay.status().await.expect("still active");
        assert_eq!(status.session_id, first.session_id);
        assert_eq!(status.project_id, 1);
        assert_eq!(status.total_rows, 2);
        assert_eq!(status.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn concurrent_starts_admit_exactly_one() {
        let h = harness();
        let replay = controller(&h, false);
        let (a, b) = tokio::join!(
            replay.start(request(1, 1, 2)),
            replay.start(request(2, 2, 1))
        );
        assert_eq!(
            [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(),
            1
        );
        let winner = a.as_ref().or(b.as_ref()).expect("one winner").clone();
        let loser = a.err().or(b.err()).expect("one loser");
        assert_eq!(loser.code(), "state_conflict");

        let status = replay.status().await.expect("winner stays active");
        assert_eq!(status.session_id, winner.session_id);
        assert_eq!(status.project_id, winner.project_id);
        assert_eq!(status.counts, ResultCounts::default());
        assert_eq!(h.surface.calls_for("start_replay"), 1);
    }

    #[tokio::test]
    async fn cursor_after_two_full_rows_sits_at_third_row() {
        let h = harness();
        let replay = controller(&h, false);
        replay.start(request(1, 3, 3)).await.expect("start");
        for _ in 0..6 {
            let result = replay.execute_step().await.expect("step");
            assert_eq!(result.status, StepStatus::Passed);
        }
        let status = replay.status().await.expect("active");
        assert_eq!((status.current_row, status.current_step), (2, 0));
        assert!((status.progress - 66.67).abs() < 0.1, "{}", status.progress);
        assert_eq!(status.counts.passed, 6);
    }

    #[tokio::test]
    async fn failed_actions_are_counted_but_do_not_halt() {
        let h = harness();
        h.surface.fail_by_default("element detached");
        let replay = controller(&h, false);
        replay.start(request(1, 1, 2)).await.expect("start");

        let result = replay.execute_step().await.expect("unit runs");
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("element detached"));
        let status = replay.status().await.expect("still active");
        assert_eq!(status.status, SessionStatus::Running);
        assert_eq!(status.counts.failed, 1);
        assert_eq!(status.current_step, 1);
    }

    #[tokio::test]
    async fn auto_run_exhausts_grid_and_flushes_run_record() {
        let h = harness();
        let replay = controller(&h, true);
        let started = replay.start(request(9, 2, 2)).await.expect("start");
        replay.join_loop().await;

        assert!(replay.status().await.is_none());
        assert!(h
            .store
            .load(SessionKind::Replay)
            .await
            .expect("load")
            .is_none());
        let runs = h.store.list_runs(9).await.expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!((runs[0].total_steps, runs[0].passed_steps), (4, 4));
        assert!(runs[0].logs.contains("session.replay.started"));
        let stored = h
            .store
            .get_results(&started.session_id)
            .await
            .expect("results");
        assert_eq!(stored.len(), 4);
    }

    #[tokio::test]
    async fn step_mode_admits_one_unit_per_step_command() {
        let mut h = harness();
        let replay = controller(&h, true);
        replay
            .start(ReplayRequest {
                step_mode: true,
                ..request(1, 1, 3)
            })
            .await
            .expect("start");

        let first = next_step_result(&mut h).await;
        assert_eq!(first.step_index, 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(replay.status().await.expect("active").current_step, 1);

        replay.step().await.expect("step");
        let second = next_step_result(&mut h).await;
        assert_eq!(second.step_index, 1);

        let outcome = replay.stop().await.expect("stop");
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.summary.status, SessionStatus::Completed);
        replay.join_loop().await;
        assert!(!replay.is_loop_running());
    }

    #[tokio::test]
    async fn pause_parks_loop_until_resume() {
        let mut h = harness();
        let replay = controller(&h, true);
        replay
            .start(ReplayRequest {
                step_mode: true,
                ..request(1, 1, 3)
            })
            .await
            .expect("start");
        next_step_result(&mut h).await;

        replay.pause(PauseReason::UserRequested).await.expect("pause");
        replay.step().await.expect("credit is stored while paused");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(replay.status().await.expect("active").current_step, 1);
        assert!(replay.pause(PauseReason::UserRequested).await.is_err());

        h.clock.advance_ms(250);
        let resumed = replay.resume().await.expect("resume");
        assert_eq!(resumed.total_paused_ms, 250);
        let second = next_step_result(&mut h).await;
        assert_eq!(second.step_index, 1);
        replay.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn failed_final_flush_leaves_session_stopping_until_retried() {
        let h = harness();
        let replay = controller(&h, false);
        replay.start(request(3, 1, 2)).await.expect("start");
        replay.execute_step().await.expect("step");

        h.store.fail_flush(true);
        let err = replay.stop().await.expect_err("flush fails");
        assert_eq!(err.code(), "persistence_error");
        let status = replay.status().await.expect("kept");
        assert_eq!(status.status, SessionStatus::Stopping);
        assert!(replay.execute_step().await.is_err());

        h.store.fail_flush(false);
        let outcome = replay.stop().await.expect("retry succeeds");
        assert_eq!(outcome.record.total_steps, 1);
        assert!(replay.status().await.is_none());
    }

    #[tokio::test]
    async fn failed_flush_keeps_step_mode_in_sync_with_the_snapshot() {
        let h = harness();
        let replay = controller(&h, false);
        replay
            .start(ReplayRequest {
                step_mode: true,
                ..request(3, 1, 2)
            })
            .await
            .expect("start");
        assert!(replay.pause_controller().is_step_mode());

        h.store.fail_flush(true);
        replay.stop().await.expect_err("flush fails");
        let status = replay.status().await.expect("kept");
        assert!(status.step_mode);
        assert!(replay.pause_controller().is_step_mode());

        h.store.fail_flush(false);
        replay.stop().await.expect("retry succeeds");
        assert!(!replay.pause_controller().is_step_mode());
    }

    #[tokio::test]
    async fn snapshot_failures_do_not_block_transitions() {
        let h = harness();
        h.store.fail_snapshots(true);
        let replay = controller(&h, false);
        replay.start(request(1, 1, 1)).await.expect("start despite store");
        replay
            .pause(PauseReason::UserRequested)
            .await
            .expect("pause despite store");
        assert!(h
            .logger
            .lines()
            .iter()
            .any(|line| line.contains("session.snapshot.save_failed")));
    }

    #[tokio::test]
    async fn skip_and_zero_rows_use_recorded_values() {
        let h = harness();
        let replay = controller(&h, false);
        replay
            .start(ReplayRequest {
                project_id: 1,
                target_id: "tab-1".to_string(),
                steps: vec![
                    Step::new(StepEvent::Input, "//input").with_value("recorded"),
                    Step::new(StepEvent::Click, "//submit"),
                ],
                ..ReplayRequest::default()
            })
            .await
            .expect("start");

        let first = replay.execute_step().await.expect("execute");
        assert_eq!(first.status, StepStatus::Passed);
        let skipped = replay.skip_step().await.expect("skip");
        assert_eq!(skipped.status, StepStatus::Skipped);
        assert!(replay.status().await.is_none(), "single pass completes");

        let calls = h.surface.calls();
        let executed: Vec<_> = calls
            .iter()
            .filter_map(|(_, action)| match action {
                RemoteAction::ExecuteStep { step, .. } => Some(step.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].value.as_deref(), Some("recorded"));
    }

    #[tokio::test]
    async fn replay_without_steps_falls_back_to_recorded_project_steps() {
        let h = harness();
        let replay = controller(&h, false);
        let err = replay
            .start(ReplayRequest {
                project_id: 5,
                target_id: "tab".to_string(),
                ..ReplayRequest::default()
            })
            .await
            .expect_err("nothing recorded");
        assert_eq!(err.code(), "validation_error");
        assert!(replay.status().await.is_none());
    }

    #[tokio::test]
    async fn restored_running_session_comes_back_paused() {
        let h = harness();
        let mut snapshot = SessionSnapshot::new(
            SessionKind::Replay,
            "replay-1-0-1".to_string(),
            1,
            "tab".to_string(),
            1_000,
            0,
        );
        snapshot.steps = steps(2);
        snapshot.total_steps = 2;
        snapshot.total_rows = 1;
        snapshot.current_step = 1;

        let replay = controller(&h, false);
        let report = replay.restore(snapshot).await.expect("restore");
        assert_eq!(report.status, SessionStatus::Paused);
        assert!(replay.pause_controller().is_paused());

        replay.resume().await.expect("resume");
        let result = replay.execute_step().await.expect("last step");
        assert_eq!(result.step_index, 1);
        assert!(replay.status().await.is_none());
    }
}
