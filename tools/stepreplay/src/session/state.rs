use crate::errors::ReplayError;
use crate::types::SessionKind;
use serde::{Deserialize, Serialize};

/// Lifecycle of a session. `idle` is the absence of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Recording,
    Running,
    Paused,
    Stopping,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recording => "recording",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Occupies the single slot for its kind.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Recording | Self::Running | Self::Paused | Self::Stopping
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The working state a session of `kind` starts in and resumes to.
    pub fn working(kind: SessionKind) -> Self {
        match kind {
            SessionKind::Recording => Self::Recording,
            SessionKind::Replay => Self::Running,
        }
    }
}

pub fn validate_transition(
    kind: SessionKind,
    from: SessionStatus,
    to: SessionStatus,
) -> Result<(), ReplayError> {
    use SessionStatus as S;

    let working = S::working(kind);
    let allowed = match from {
        S::Recording | S::Running => {
            from == working && matches!(to, S::Paused | S::Stopping | S::Failed)
        }
        S::Paused => to == working || matches!(to, S::Stopping | S::Failed),
        S::Stopping => matches!(to, S::Completed | S::Failed),
        S::Completed | S::Failed => false,
    };

    if !allowed {
        return Err(ReplayError::StateConflict(format!(
            "illegal {} transition: {} -> {}",
            kind.as_str(),
            from.as_str(),
            to.as_str()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_and_resume_edges_follow_session_kind() {
        use SessionStatus as S;
        assert!(validate_transition(SessionKind::Replay, S::Running, S::Paused).is_ok());
        assert!(validate_transition(SessionKind::Replay, S::Paused, S::Running).is_ok());
        assert!(validate_transition(SessionKind::Recording, S::Paused, S::Recording).is_ok());

        let err = validate_transition(SessionKind::Recording, S::Paused, S::Running)
            .expect_err("recording never runs");
        assert!(matches!(err, ReplayError::StateConflict(message) if message.contains("paused -> running")));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        use SessionStatus as S;
        for from in [S::Completed, S::Failed] {
            for to in [S::Running, S::Paused, S::Stopping, S::Completed] {
                assert!(validate_transition(SessionKind::Replay, from, to).is_err());
            }
        }
        assert!(validate_transition(SessionKind::Replay, S::Running, S::Completed).is_err());
        assert!(validate_transition(SessionKind::Replay, S::Stopping, S::Completed).is_ok());
    }

    #[test]
    fn active_set_matches_single_slot_rule() {
        use SessionStatus as S;
        let active: Vec<_> = [S::Recording, S::Running, S::Paused, S::Stopping, S::Completed, S::Failed]
            .into_iter()
            .filter(|status| status.is_active())
            .collect();
        assert_eq!(active, vec![S::Recording, S::Running, S::Paused, S::Stopping]);
    }
}
