use super::{validate_start, SessionContext, SessionSnapshot, SessionStatus, SessionSummary, StatusReport};
use crate::errors::ReplayError;
use crate::events::EngineEvent;
use crate::pause::PauseReason;
use crate::step_identity::ensure_step_id;
use crate::store::StepStore;
use crate::surface::RemoteAction;
use crate::types::{SessionKind, Step};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;

const KIND: SessionKind = SessionKind::Recording;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingOutcome {
    pub summary: SessionSummary,
    pub steps: Vec<Step>,
}

/// Owns the single recording slot. Steps are only accepted while `recording`.
pub struct RecordingController {
    ctx: Arc<SessionContext>,
    state: Mutex<Option<SessionSnapshot>>,
}

impl RecordingController {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self {
            ctx,
            state: Mutex::new(None),
        }
    }

    pub async fn status(&self) -> Option<StatusReport> {
        let now = self.ctx.now();
        self.state
            .lock()
            .await
            .as_ref()
            .map(|session| session.report(now))
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.is_some()
    }

    pub async fn start(&self, project_id: i64, target_id: &str) -> Result<StatusReport, ReplayError> {
        validate_start(project_id, target_id)?;
        let report = {
            let mut state = self.state.lock().await;
            if let Some(active) = state.as_ref() {
                return Err(ReplayError::StateConflict(format!(
                    "recording session {} is already {}",
                    active.session_id,
                    active.status.as_str()
                )));
            }
            let now = self.ctx.now();
            let session = SessionSnapshot::new(
                KIND,
                self.ctx.next_session_id(KIND, project_id),
                project_id,
                target_id.to_string(),
                now,
                self.ctx.logger.mark(),
            );
            self.ctx.persist(KIND, Some(&session)).await;
            let report = session.report(now);
            *state = Some(session);
            report
        };

        self.ctx
            .notify(
                target_id,
                RemoteAction::StartCapture {
                    session_id: report.session_id.clone(),
                    project_id,
                },
            )
            .await;
        self.ctx.logger.append(
            "info",
            "session.recording.started",
            json!({
                "session_id": report.session_id,
                "project_id": project_id,
                "target_id": target_id,
            }),
        );
        self.ctx.emit(EngineEvent::Started {
            kind: KIND,
            session_id: report.session_id.clone(),
            project_id,
            target_id: target_id.to_string(),
        });
        Ok(report)
    }

    /// Buffers one captured step, assigning an id and a server timestamp when missing.
    pub async fn record_step(&self, mut step: Step) -> Result<Step, ReplayError> {
        step.validate()?;
        let mut state = self.state.lock().await;
        let session = state.as_mut().ok_or_else(|| {
            ReplayError::StateConflict("no recording session is active".to_string())
        })?;
        if session.status != SessionStatus::Recording {
            return Err(ReplayError::StateConflict(format!(
                "recording session {} is {}; steps are only accepted while recording",
                session.session_id,
                session.status.as_str()
            )));
        }

        let ordinal = session.steps.len();
        step.id = ensure_step_id(&session.session_id, session.project_id, ordinal, &step);
        if step.timestamp.is_none() {
            step.timestamp = Some(self.ctx.now());
        }
        session.steps.push(step.clone());
        session.total_steps = session.steps.len();
        self.ctx.persist(KIND, Some(&*session)).await;
        if let Err(err) = self.ctx.store.add_step(session.project_id, &step).await {
            self.ctx.logger.append(
                "warn",
                "session.recording.step_store_failed",
                json!({ "step_id": step.id, "error": err.to_string() }),
            );
        }

        self.ctx.logger.append(
            "debug",
            "session.recording.step_recorded",
            json!({
                "session_id": session.session_id,
                "step_id": step.id,
                "event": step.event.as_str(),
                "ordinal": ordinal,
            }),
        );
        self.ctx.emit(EngineEvent::StepRecorded {
            session_id: session.session_id.clone(),
            project_id: session.project_id,
            step_id: step.id.clone(),
            ordinal,
        });
        Ok(step)
    }

    pub async fn pause(&self) -> Result<StatusReport, ReplayError> {
        let mut state = self.state.lock().await;
        let session = active(&mut state)?;
        let now = self.ctx.now();
        session.mark_paused(PauseReason::UserRequested, now)?;
        self.ctx.persist(KIND, Some(&*session)).await;
        self.ctx.logger.append(
            "info",
            "session.recording.paused",
            json!({ "session_id": session.session_id }),
        );
        self.ctx.emit(EngineEvent::Paused {
            kind: KIND,
            session_id: session.session_id.clone(),
        });
        Ok(session.report(now))
    }

    pub async fn resume(&self) -> Result<StatusReport, ReplayError> {
        let mut state = self.state.lock().await;
        let session = active(&mut state)?;
        let now = self.ctx.now();
        let paused_ms = session.mark_resumed(now)?;
        self.ctx.persist(KIND, Some(&*session)).await;
        self.ctx.logger.append(
            "info",
            "session.recording.resumed",
            json!({ "session_id": session.session_id, "paused_ms": paused_ms }),
        );
        self.ctx.emit(EngineEvent::Resumed {
            kind: KIND,
            session_id: session.session_id.clone(),
            paused_ms,
        });
        Ok(session.report(now))
    }

    /// Flushes captured steps and closes the session. A failed flush leaves it `stopping`.
    pub async fn stop(&self) -> Result<RecordingOutcome, ReplayError> {
        let mut state = self.state.lock().await;
        let session = active(&mut state)?;
        if session.status != SessionStatus::Stopping {
            let now = self.ctx.now();
            if session.status == SessionStatus::Paused {
                session.total_paused_ms = session.paused_ms_at(now);
                session.paused_at = None;
            }
            session.transition(SessionStatus::Stopping)?;
            self.ctx.persist(KIND, Some(&*session)).await;
            self.ctx
                .notify(
                    &session.target_id,
                    RemoteAction::StopCapture {
                        session_id: session.session_id.clone(),
                    },
                )
                .await;
        }

        for step in &session.steps {
            if let Err(err) = self.ctx.store.add_step(session.project_id, step).await {
                self.ctx.logger.append(
                    "error",
                    "session.recording.flush_failed",
                    json!({ "session_id": session.session_id, "error": err.to_string() }),
                );
                self.ctx.emit(EngineEvent::Failed {
                    kind: KIND,
                    session_id: session.session_id.clone(),
                    error: err.to_string(),
                });
                return Err(ReplayError::Persistence(format!(
                    "failed to flush recorded steps: {err}"
                )));
            }
        }

        session.transition(SessionStatus::Completed)?;
        session.completed_at = Some(self.ctx.now());
        let summary = session.summary();
        let steps = std::mem::take(&mut session.steps);
        *state = None;
        drop(state);
        self.ctx.persist(KIND, None).await;

        self.ctx.logger.append(
            "info",
            "session.recording.completed",
            json!({
                "session_id": summary.session_id,
                "steps_recorded": summary.steps_recorded,
            }),
        );
        self.ctx.emit(EngineEvent::Completed {
            kind: KIND,
            session_id: summary.session_id.clone(),
            summary: summary.clone(),
        });
        Ok(RecordingOutcome { summary, steps })
    }

    /// Reinstalls a persisted session after a restart. Live captures come back paused.
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
                "a recording session is already loaded".to_string(),
            ));
        }
        let now = self.ctx.now();
        if snapshot.status == SessionStatus::Recording {
            snapshot.mark_paused(PauseReason::External, now)?;
            self.ctx.persist(KIND, Some(&snapshot)).await;
        }
        self.ctx.logger.append(
            "info",
            "session.recording.restored",
            json!({ "session_id": snapshot.session_id, "status": snapshot.status.as_str() }),
        );
        let report = snapshot.report(now);
        *state = Some(snapshot);
        Ok(report)
    }
}

fn active(state: &mut Option<SessionSnapshot>) -> Result<&mut SessionSnapshot, ReplayError> {
    state
        .as_mut()
        .ok_or_else(|| ReplayError::StateConflict("no recording session is active".to_string()))
}
