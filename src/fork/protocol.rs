//! IPC protocol between the orchestrator and its worker processes.
//!
//! Messages are JSON-serialized, newline-delimited and tagged by `code`.

use super::aggregate::{LogEntry, ResultAggregate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message from parent to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParentMessage {
    /// One-time configuration, sent in reply to `READY`.
    Init {
        #[serde(rename = "initData", default)]
        init_data: Value,
    },

    /// A batch of items to process. Empty means no work is left.
    Process {
        #[serde(rename = "itemsToProcess", default)]
        items_to_process: Vec<Value>,
    },

    /// Explicit shutdown request.
    Exit,
}

/// Message from worker to parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChildMessage {
    /// Worker has installed its message handler.
    Ready,

    /// A batch was processed successfully.
    Done {
        #[serde(default)]
        result: ResultAggregate,
        #[serde(default)]
        logs: Vec<LogEntry>,
        #[serde(default)]
        data: Value,
    },

    /// A batch failed; the worker keeps serving.
    Error {
        #[serde(default)]
        result: ResultAggregate,
        #[serde(default)]
        logs: Vec<LogEntry>,
        error: String,
    },

    /// Worker received an empty batch and is shutting down.
    Finished,

    /// Free-form payload relayed unchanged.
    Custom {
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
}

impl ParentMessage {
    pub fn init(init_data: Value) -> Self {
        Self::Init { init_data }
    }

    pub fn process(items: Vec<Value>) -> Self {
        Self::Process {
            items_to_process: items,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("ParentMessage serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl ChildMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            result: ResultAggregate::new(),
            logs: Vec::new(),
            error: message.into(),
        }
    }

    /// Protocol code as it appears on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Done { .. } => "DONE",
            Self::Error { .. } => "ERROR",
            Self::Finished => "FINISHED",
            Self::Custom { .. } => "CUSTOM",
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("ChildMessage serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fork::aggregate::{AggregateValue, LogKind};
    use serde_json::json;

    #[test]
    fn test_process_wire_shape() {
        let msg = ParentMessage::process(vec![json!(1), json!("two")]);
        let line = msg.to_line();
        assert!(line.ends_with('\n'));

        let raw: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(raw, json!({"code": "PROCESS", "itemsToProcess": [1, "two"]}));
        assert_eq!(ParentMessage::from_line(&line).unwrap(), msg);
    }

    #[test]
    fn test_init_and_exit_wire_shape() {
        let line = ParentMessage::init(json!({"depth": 2})).to_line();
        let raw: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(raw, json!({"code": "INIT", "initData": {"depth": 2}}));

        let parsed = ParentMessage::from_line(r#"{"code":"EXIT"}"#).unwrap();
        assert_eq!(parsed, ParentMessage::Exit);
    }

    #[test]
    fn test_done_parses_with_payload() {
        let line = concat!(
            r#"{"code":"DONE","result":{"count":2},"#,
            r#""logs":[{"timestamp":"2024-01-01T00:00:00Z","kind":"log","message":"ok"}],"#,
            r#""data":[1,2]}"#
        );
        match ChildMessage::from_line(line).unwrap() {
            ChildMessage::Done { result, logs, data } => {
                assert_eq!(result["count"], AggregateValue::Number(2.0));
                assert_eq!(logs[0].kind, LogKind::Log);
                assert_eq!(data, json!([1, 2]));
            }
            other => panic!("Expected Done, got {:?}", other),
        }
    }

    #[test]
    fn test_done_accepts_bool_and_null_results() {
        let line = r#"{"code":"DONE","result":{"ok":true,"count":1,"meta":{"cached":null}}}"#;
        match ChildMessage::from_line(line).unwrap() {
            ChildMessage::Done { result, .. } => {
                assert_eq!(result["ok"], AggregateValue::Scalar(json!(true)));
                assert_eq!(result["count"], AggregateValue::Number(1.0));
            }
            other => panic!("Expected Done, got {:?}", other),
        }
    }

    #[test]
    fn test_error_defaults_missing_stats() {
        let parsed = ChildMessage::from_line(r#"{"code":"ERROR","error":"bad item"}"#).unwrap();
        assert_eq!(parsed, ChildMessage::error("bad item"));
        assert_eq!(parsed.code(), "ERROR");
    }

    #[test]
    fn test_ready_and_finished() {
        let ready = ChildMessage::from_line(&ChildMessage::Ready.to_line()).unwrap();
        assert_eq!(ready, ChildMessage::Ready);
        let raw: Value = serde_json::from_str(&ChildMessage::Finished.to_line()).unwrap();
        assert_eq!(raw, json!({"code": "FINISHED"}));
    }

    #[test]
    fn test_custom_payload_relayed_unchanged() {
        let line = r#"{"code":"CUSTOM","progress":0.5,"stage":{"name":"warmup"}}"#;
        let parsed = ChildMessage::from_line(line).unwrap();
        match &parsed {
            ChildMessage::Custom { payload } => {
                assert_eq!(payload["progress"], json!(0.5));
                assert_eq!(payload["stage"], json!({"name": "warmup"}));
            }
            other => panic!("Expected Custom, got {:?}", other),
        }

        let back: Value = serde_json::from_str(&parsed.to_line()).unwrap();
        let original: Value = serde_json::from_str(line).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert!(ChildMessage::from_line(r#"{"code":"RESTART"}"#).is_err());
        assert!(ParentMessage::from_line("not json").is_err());
    }
}
