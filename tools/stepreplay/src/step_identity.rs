use crate::types::{Step, StepEvent};
use sha2::{Digest, Sha256};

const STEP_ID_HEX_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepIdentity {
    pub session_id: String,
    pub project_id: i64,
    pub ordinal: usize,
    pub event: StepEvent,
    pub path: String,
    pub label: Option<String>,
}

impl StepIdentity {
    pub fn from_step(session_id: &str, project_id: i64, ordinal: usize, step: &Step) -> Self {
        Self {
            session_id: session_id.to_string(),
            project_id,
            ordinal,
            event: step.event,
            path: step.path.clone(),
            label: step.label.clone(),
        }
    }

    pub fn canonical_json(&self) -> String {
        let label = self.label.as_deref().map_or_else(
            || "null".to_string(),
            |value| format!("\"{}\"", escape_json(&normalize_label(value))),
        );
        format!(
            "{{\"session_id\":\"{}\",\"project_id\":{},\"ordinal\":{},\"event\":\"{}\",\"path\":\"{}\",\"label\":{}}}",
            escape_json(&self.session_id),
            self.project_id,
            self.ordinal,
            self.event.as_str(),
            escape_json(self.path.trim()),
            label
        )
    }

    pub fn step_id(&self) -> String {
        let mut digest = Sha256::new();
        digest.update(self.canonical_json().as_bytes());
        let bytes = digest.finalize();
        let mut out = String::with_capacity(5 + STEP_ID_HEX_LEN);
        out.push_str("step-");
        for byte in bytes.iter().take(STEP_ID_HEX_LEN / 2) {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

/// Returns the step's own id, or one derived from the capturing session and the
/// step's content when the sender omitted it.
pub fn ensure_step_id(session_id: &str, project_id: i64, ordinal: usize, step: &Step) -> String {
    if !step.id.trim().is_empty() {
        return step.id.clone();
    }
    StepIdentity::from_step(session_id, project_id, ordinal, step).step_id()
}

fn normalize_label(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn escape_json(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
}

#[cfg(test)]
mod tests {
    use super::{ensure_step_id, StepIdentity};
    use crate::types::{Step, StepEvent};

    #[test]
    fn step_id_is_stable_for_identical_inputs() {
        let step = Step::new(StepEvent::Input, "//form/input[1]").with_label("Email  Field");
        let first = ensure_step_id("recording-7", 7, 3, &step);
        let second = ensure_step_id(
            "recording-7",
            7,
            3,
            &Step::new(StepEvent::Input, " //form/input[1] ").with_label("Email Field"),
        );
        assert_eq!(first, second);
        assert!(first.starts_with("step-"));
        assert_eq!(first.len(), 21);
    }

    #[test]
    fn ordinal_project_and_session_change_the_id() {
        let step = Step::new(StepEvent::Click, "//button");
        let base = ensure_step_id("s-1", 1, 0, &step);
        assert_ne!(base, ensure_step_id("s-1", 1, 1, &step));
        assert_ne!(base, ensure_step_id("s-1", 2, 0, &step));
        assert_ne!(base, ensure_step_id("s-2", 1, 0, &step));
    }

    #[test]
    fn explicit_ids_are_preserved() {
        let mut step = Step::new(StepEvent::Open, "");
        step.id = "recorded-1".to_string();
        assert_eq!(ensure_step_id("s-1", 1, 0, &step), "recorded-1");
    }

    #[test]
    fn canonical_json_field_order_is_deterministic() {
        let identity = StepIdentity {
            session_id: "recording-4-0".to_string(),
            project_id: 4,
            ordinal: 0,
            event: StepEvent::Open,
            path: String::new(),
            label: None,
        };
        assert_eq!(
            identity.canonical_json(),
            "{\"session_id\":\"recording-4-0\",\"project_id\":4,\"ordinal\":0,\"event\":\"open\",\"path\":\"\",\"label\":null}"
        );
    }
}
