//! The remote execution surface and the actions the engine sends to it.

use crate::errors::ReplayError;
use crate::runtime::{ProcessRequest, ProcessRunner};
use crate::types::Step;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteAction {
    InjectScript {
        script: String,
    },
    StartCapture {
        session_id: String,
        project_id: i64,
    },
    StopCapture {
        session_id: String,
    },
    StartReplay {
        session_id: String,
        project_id: i64,
        total_rows: usize,
        total_steps: usize,
    },
    StopReplay {
        session_id: String,
    },
    ExecuteStep {
        session_id: String,
        row_index: usize,
        step_index: usize,
        step: Step,
    },
}

impl RemoteAction {
    /// Key under which the executor caches the last known status.
    pub fn action_id(&self) -> String {
        match self {
            Self::InjectScript { .. } => "inject_script".to_string(),
            Self::StartCapture { .. } => "start_capture".to_string(),
            Self::StopCapture { .. } => "stop_capture".to_string(),
            Self::StartReplay { .. } => "start_replay".to_string(),
            Self::StopReplay { .. } => "stop_replay".to_string(),
            Self::ExecuteStep { step, .. } => format!("execute_step:{}", step.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait ActionSurface: Send + Sync {
    async fn perform_action(&self, target_id: &str, action: &RemoteAction) -> ActionOutcome;
}

/// Runs an external driver program once per action.
///
/// The driver receives `<args...> <target_id> <action-json>`; exit code zero
/// is success and stderr (or stdout when stderr is empty) is the error text.
pub struct ProcessActionSurface {
    runner: Arc<dyn ProcessRunner>,
    program: String,
    args: Vec<String>,
}

impl ProcessActionSurface {
    pub fn new(runner: Arc<dyn ProcessRunner>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            runner,
            program: program.into(),
            args,
        }
    }

    fn request(&self, target_id: &str, action: &RemoteAction) -> Result<ProcessRequest, ReplayError> {
        let payload =
            serde_json::to_string(action).map_err(|e| ReplayError::Transport(e.to_string()))?;
        let mut args = self.args.clone();
        args.push(target_id.to_string());
        args.push(payload);
        Ok(ProcessRequest {
            program: self.program.clone(),
            args,
            cwd: None,
        })
    }
}

#[async_trait]
impl ActionSurface for ProcessActionSurface {
    async fn perform_action(&self, target_id: &str, action: &RemoteAction) -> ActionOutcome {
        let request = match self.request(target_id, action) {
            Ok(request) => request,
            Err(err) => return ActionOutcome::failed(err.to_string()),
        };
        let runner = self.runner.clone();
        let joined = tokio::task::spawn_blocking(move || runner.run(request)).await;
        match joined {
            Ok(Ok(output)) if output.exit_code == 0 => ActionOutcome::ok(),
            Ok(Ok(output)) => {
                let text = if output.stderr.trim().is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    output.stderr.trim().to_string()
                };
                ActionOutcome::failed(format!("driver exited {}: {text}", output.exit_code))
            }
            Ok(Err(err)) => ActionOutcome::failed(err.to_string()),
            Err(err) => ActionOutcome::failed(format!("driver task failed: {err}")),
        }
    }
}

/// Deterministic surface for tests: scripted outcomes per action id, success otherwise.
#[derive(Default, Clone)]
pub struct ScriptedSurface {
    scripts: Arc<Mutex<HashMap<String, VecDeque<ActionOutcome>>>>,
    default_failure: Arc<Mutex<Option<String>>>,
    calls: Arc<Mutex<Vec<(String, RemoteAction)>>>,
}

impl ScriptedSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, action_id: &str, outcome: ActionOutcome) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(action_id.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Unscripted actions fail with `error` instead of succeeding.
    pub fn fail_by_default(&self, error: impl Into<String>) {
        *self
            .default_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error.into());
    }

    pub fn calls(&self) -> Vec<(String, RemoteAction)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn calls_for(&self, action_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|(_, action)| action.action_id() == action_id)
            .count()
    }
}

#[async_trait]
impl ActionSurface for ScriptedSurface {
    async fn perform_action(&self, target_id: &str, action: &RemoteAction) -> ActionOutcome {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((target_id.to_string(), action.clone()));
        let scripted = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&action.action_id())
            .and_then(VecDeque::pop_front);
        if let Some(outcome) = scripted {
            return outcome;
        }
        match self
            .default_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            Some(error) => ActionOutcome::failed(error),
            None => ActionOutcome::ok(),
        }
    }
}
