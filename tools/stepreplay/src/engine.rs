//! Command dispatch over the recording and replay controllers.

use crate::command::{decode_command, Command, CommandEnvelope, CommandResponse};
use crate::config::EngineConfig;
use crate::errors::ReplayError;
use crate::events::EngineEvent;
use crate::injector::InjectorOptions;
use crate::logging::RunLogger;
use crate::pause::PauseReason;
use crate::retry::RetryingActionExecutor;
use crate::runtime::Clock;
use crate::session::{
    RecordingController, ReplayController, ReplayRequest, SessionContext, StatusReport,
};
use crate::store::{SessionStateStore, Store};
use crate::surface::ActionSurface;
use crate::types::SessionKind;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RestoreReport {
    pub recording: Option<StatusReport>,
    pub replay: Option<StatusReport>,
}

pub struct Engine {
    ctx: Arc<SessionContext>,
    recording: Arc<RecordingController>,
    replay: Arc<ReplayController>,
    command_lock: Mutex<()>,
}

impl Engine {
    pub fn new(
        config: &EngineConfig,
        store: Arc<dyn Store>,
        surface: Arc<dyn ActionSurface>,
        clock: Arc<dyn Clock>,
        logger: Arc<RunLogger>,
    ) -> Self {
        let executor = Arc::new(RetryingActionExecutor::new(
            surface,
            clock.clone(),
            logger.clone(),
        ));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let ctx = Arc::new(SessionContext::new(
            store,
            executor,
            logger,
            clock,
            config.retry.execute_options(),
            events,
        ));
        let injection = InjectorOptions {
            case_sensitive: config.injection.case_sensitive,
            skip_empty_inputs: config.injection.skip_empty_inputs,
        };
        Self {
            recording: Arc::new(RecordingController::new(ctx.clone())),
            replay: Arc::new(ReplayController::new(
                ctx.clone(),
                injection,
                config.replay.auto_run,
            )),
            ctx,
            command_lock: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.ctx.subscribe()
    }

    pub fn recording(&self) -> &Arc<RecordingController> {
        &self.recording
    }

    pub fn replay(&self) -> &Arc<ReplayController> {
        &self.replay
    }

    pub fn executor(&self) -> &Arc<RetryingActionExecutor> {
        &self.ctx.executor
    }

    /// Reloads persisted sessions after a cold start. Unreadable snapshots are
    /// logged and skipped so the engine still comes up.
    pub async fn restore(&self) -> RestoreReport {
        let mut report = RestoreReport::default();
        for kind in [SessionKind::Recording, SessionKind::Replay] {
            let snapshot = match self.ctx.store.load(kind).await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(err) => {
                    self.ctx.logger.append(
                        "warn",
                        "engine.restore.load_failed",
                        json!({ "kind": kind.as_str(), "error": err.to_string() }),
                    );
                    continue;
                }
            };
            let restored = match kind {
                SessionKind::Recording => self.recording.restore(snapshot).await,
                SessionKind::Replay => self.replay.restore(snapshot).await,
            };
            match restored {
                Ok(status) => match kind {
                    SessionKind::Recording => report.recording = Some(status),
                    SessionKind::Replay => report.replay = Some(status),
                },
                Err(err) => self.ctx.logger.append(
                    "warn",
                    "engine.restore.rejected",
                    json!({ "kind": kind.as_str(), "error": err.to_string() }),
                ),
            }
        }
        report
    }

    /// Decodes and handles one raw bus message.
    pub async fn handle_line(&self, line: &str) -> CommandResponse {
        match decode_command(line) {
            Ok(envelope) => self.handle(envelope).await,
            Err((id, err)) => {
                self.ctx.logger.append(
                    "warn",
                    "command.rejected",
                    json!({ "code": err.code(), "error": err.to_string() }),
                );
                CommandResponse::err(&err).with_id(id)
            }
        }
    }

    pub async fn handle(&self, envelope: CommandEnvelope) -> CommandResponse {
        let CommandEnvelope { id, command } = envelope;
        let name = command.name();
        let _serial = self.command_lock.lock().await;
        self.ctx
            .logger
            .append("debug", "command.received", json!({ "type": name }));
        match self.dispatch(command).await {
            Ok(data) => CommandResponse::ok(data).with_id(id),
            Err(err) => {
                self.ctx.logger.append(
                    "warn",
                    "command.failed",
                    json!({ "type": name, "code": err.code(), "error": err.to_string() }),
                );
                CommandResponse::err(&err).with_id(id)
            }
        }
    }

    async fn dispatch(&self, command: Command) -> Result<Value, ReplayError> {
        match command {
            Command::Start {
                mode: SessionKind::Recording,
                project_id,
                target_id,
                ..
            } => to_data(self.recording.start(project_id, &target_id).await?),
            Command::Start {
                mode: SessionKind::Replay,
                project_id,
                target_id,
                steps,
                rows,
                mappings,
                step_mode,
            } => to_data(
                self.replay
                    .start(ReplayRequest {
                        project_id,
                        target_id,
                        steps,
                        rows,
                        mappings,
                        step_mode,
                    })
                    .await?,
            ),
            Command::Stop { mode } => match self.resolve_kind(mode).await? {
                SessionKind::Recording => to_data(self.recording.stop().await?),
                SessionKind::Replay => to_data(self.replay.stop().await?),
            },
            Command::Pause { mode, reason } => match self.resolve_kind(mode).await? {
                SessionKind::Recording => to_data(self.recording.pause().await?),
                SessionKind::Replay => to_data(
                    self.replay
                        .pause(reason.unwrap_or(PauseReason::UserRequested))
                        .await?,
                ),
            },
            Command::Resume { mode } => match self.resolve_kind(mode).await? {
                SessionKind::Recording => to_data(self.recording.resume().await?),
                SessionKind::Replay => to_data(self.replay.resume().await?),
            },
            Command::RecordStep { step } => to_data(self.recording.record_step(step).await?),
            Command::ExecuteStep {} => to_data(self.replay.execute_step().await?),
            Command::SkipStep {} => to_data(self.replay.skip_step().await?),
            Command::GetStatus {} => Ok(json!({
                "recording": to_data(self.recording.status().await)?,
                "replay": to_data(self.replay.status().await)?,
            })),
            Command::SetStepMode { enabled } => {
                to_data(self.replay.set_step_mode(enabled).await?)
            }
            Command::Step {} => to_data(self.replay.step().await?),
        }
    }

    async fn resolve_kind(&self, mode: Option<SessionKind>) -> Result<SessionKind, ReplayError> {
        if let Some(mode) = mode {
            return Ok(mode);
        }
        match (
            self.recording.is_active().await,
            self.replay.is_active().await,
        ) {
            (true, false) => Ok(SessionKind::Recording),
            (false, true) => Ok(SessionKind::Replay),
            (true, true) => Err(ReplayError::Validation(
                "both a recording and a replay session are active; pass \"mode\"".to_string(),
            )),
            (false, false) => Err(ReplayError::StateConflict(
                "no session is active".to_string(),
            )),
        }
    }
}

fn to_data<T: Serialize>(value: T) -> Result<Value, ReplayError> {
    serde_json::to_value(value)
        .map_err(|e| ReplayError::Transport(format!("failed to encode response: {e}")))
}
