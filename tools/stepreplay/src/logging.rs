use crate::config::LoggingConfig;
use crate::errors::ReplayError;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;
pub const DEFAULT_BUFFER_LINES: usize = 10_000;

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn append_line(&self, line: &str) -> Result<(), ReplayError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ReplayError::Io(e.to_string()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ReplayError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| ReplayError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| ReplayError::Io(e.to_string()))
    }
}

/// Log collector shared by every engine component for one engine lifetime.
///
/// Lines are kept in a bounded in-memory buffer tagged with a sequence
/// number, so a session can later pull exactly the lines written while it
/// was active. When a file sink is configured each line is also appended
/// there. Logging never fails the caller.
#[derive(Debug)]
pub struct RunLogger {
    sink: Option<JsonlLogger>,
    max_payload_bytes: usize,
    capacity: usize,
    buffer: Mutex<LogBuffer>,
}

#[derive(Debug, Default)]
struct LogBuffer {
    next_seq: u64,
    lines: VecDeque<(u64, String)>,
}

impl RunLogger {
    pub fn in_memory() -> Self {
        Self {
            sink: None,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            capacity: DEFAULT_BUFFER_LINES,
            buffer: Mutex::new(LogBuffer::default()),
        }
    }

    pub fn with_file(path: impl AsRef<Path>) -> Self {
        Self {
            sink: Some(JsonlLogger::new(path)),
            ..Self::in_memory()
        }
    }

    pub fn from_config(cfg: &LoggingConfig) -> Self {
        Self {
            sink: cfg.path.as_ref().map(JsonlLogger::new),
            max_payload_bytes: cfg.max_payload_bytes,
            capacity: cfg.buffer_lines.max(1),
            buffer: Mutex::new(LogBuffer::default()),
        }
    }

    pub fn append(&self, level: &str, event_type: &str, payload: Value) {
        let line = match serde_json::to_string(&LogEvent {
            level,
            event_type,
            payload: truncate_json(payload, self.max_payload_bytes),
        }) {
            Ok(line) => line,
            Err(_) => return,
        };
        {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            let seq = buffer.next_seq;
            buffer.next_seq += 1;
            buffer.lines.push_back((seq, line.clone()));
            while buffer.lines.len() > self.capacity {
                buffer.lines.pop_front();
            }
        }
        if let Some(sink) = &self.sink {
            let _ = sink.append_line(&line);
        }
    }

    /// Sequence number the next line will receive.
    pub fn mark(&self) -> u64 {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_seq
    }

    pub fn lines_since(&self, mark: u64) -> Vec<String> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lines
            .iter()
            .filter(|(seq, _)| *seq >= mark)
            .map(|(_, line)| line.clone())
            .collect()
    }

    /// The lines written since `mark`, joined into the single string a run record stores.
    pub fn concatenated_since(&self, mark: u64) -> String {
        self.lines_since(mark).join("\n")
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines_since(0)
    }
}

impl Default for RunLogger {
    fn default() -> Self {
        Self::in_memory()
    }
}

pub fn structured_fallback_line(scope: &str, state: &str, message: &str) -> String {
    format!(
        "scope={scope} state={state} message={} ",
        message.replace('\n', "\\n")
    )
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}
