use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("state conflict: {0}")]
    StateConflict(String),
    #[error("action failed: {0}")]
    Action(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("process error: {0}")]
    Process(String),
}

impl ReplayError {
    /// Stable identifier carried in command response envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::StateConflict(_) => "state_conflict",
            Self::Action(_) => "action_failed",
            Self::Transport(_) => "transport_error",
            Self::Persistence(_) => "persistence_error",
            Self::Database(_) => "database_error",
            Self::Io(_) => "io_error",
            Self::ConfigParse(_) => "config_parse_error",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Cli(_) => "cli_error",
            Self::Process(_) => "process_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ReplayError;

    #[test]
    fn codes_distinguish_caller_errors_from_state_conflicts() {
        assert_eq!(
            ReplayError::Validation("x".to_string()).code(),
            "validation_error"
        );
        assert_eq!(
            ReplayError::StateConflict("x".to_string()).code(),
            "state_conflict"
        );
        assert_eq!(
            ReplayError::StateConflict("resume while running".to_string()).to_string(),
            "state conflict: resume while running"
        );
    }
}
