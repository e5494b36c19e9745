//! Typed commands decoded once at the bus boundary, and the response envelope.

use crate::errors::ReplayError;
use crate::field_mapping::FieldMapping;
use crate::pause::PauseReason;
use crate::types::{DataRow, SessionKind, Step};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const COMMAND_TYPES: [&str; 10] = [
    "start",
    "stop",
    "pause",
    "resume",
    "recordStep",
    "executeStep",
    "skipStep",
    "getStatus",
    "setStepMode",
    "step",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    Start {
        mode: SessionKind,
        project_id: i64,
        target_id: String,
        #[serde(default)]
        steps: Vec<Step>,
        #[serde(default)]
        rows: Vec<DataRow>,
        #[serde(default)]
        mappings: Vec<FieldMapping>,
        #[serde(default)]
        step_mode: bool,
    },
    Stop {
        #[serde(default)]
        mode: Option<SessionKind>,
    },
    Pause {
        #[serde(default)]
        mode: Option<SessionKind>,
        #[serde(default)]
        reason: Option<PauseReason>,
    },
    Resume {
        #[serde(default)]
        mode: Option<SessionKind>,
    },
    RecordStep {
        step: Step,
    },
    ExecuteStep {},
    SkipStep {},
    GetStatus {},
    SetStepMode {
        enabled: bool,
    },
    Step {},
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Stop { .. } => "stop",
            Self::Pause { .. } => "pause",
            Self::Resume { .. } => "resume",
            Self::RecordStep { .. } => "recordStep",
            Self::ExecuteStep {} => "executeStep",
            Self::SkipStep {} => "skipStep",
            Self::GetStatus {} => "getStatus",
            Self::SetStepMode { .. } => "setStepMode",
            Self::Step {} => "step",
        }
    }
}

/// A decoded command plus the caller's correlation id, echoed in the response.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    pub id: Option<Value>,
    pub command: Command,
}

/// Parses one bus message. Structural problems become validation errors that
/// still carry the correlation id when one could be read.
pub fn decode_command(text: &str) -> Result<CommandEnvelope, (Option<Value>, ReplayError)> {
    let mut value: Value = serde_json::from_str(text)
        .map_err(|e| (None, ReplayError::Validation(format!("command is not valid JSON: {e}"))))?;
    let Some(object) = value.as_object_mut() else {
        return Err((
            None,
            ReplayError::Validation("command must be a JSON object".to_string()),
        ));
    };
    let id = object.remove("id");
    let kind = match object.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => {
            return Err((
                id,
                ReplayError::Validation("command \"type\" must be a string".to_string()),
            ))
        }
        None => {
            return Err((
                id,
                ReplayError::Validation("command is missing \"type\"".to_string()),
            ))
        }
    };
    if !COMMAND_TYPES.contains(&kind.as_str()) {
        return Err((
            id,
            ReplayError::Validation(format!("unknown command type {kind:?}")),
        ));
    }
    match serde_json::from_value::<Command>(value) {
        Ok(command) => Ok(CommandEnvelope { id, command }),
        Err(err) => Err((
            id,
            ReplayError::Validation(format!("invalid {kind} payload: {err}")),
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl CommandResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            id: None,
            success: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn err(error: &ReplayError) -> Self {
        Self {
            id: None,
            success: false,
            data: None,
            error: Some(error.to_string()),
            code: Some(error.code().to_string()),
        }
    }

    pub fn with_id(mut self, id: Option<Value>) -> Self {
        self.id = id;
        self
    }
}
