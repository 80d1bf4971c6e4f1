//! Result and log aggregation for worker output.
//!
//! Workers report schema-less results as a [`ResultAggregate`]: a map from key
//! to an [`AggregateValue`]. The parent folds every report into one job-wide
//! aggregate with [`merge`]:
//!
//! | target      | incoming    | outcome                          |
//! |-------------|-------------|----------------------------------|
//! | absent      | any         | copied                           |
//! | number      | number      | added                            |
//! | sequence    | sequence    | appended, order preserved        |
//! | nested      | nested      | merged recursively               |
//! | text        | text        | replaced (last write wins)       |
//! | scalar      | scalar      | replaced (last write wins)       |
//! | other pairs |             | replaced, reported as a conflict |
//!
//! Log entries are never merged by key; they are appended in arrival order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// Job-level result map, keyed by result name.
pub type ResultAggregate = BTreeMap<String, AggregateValue>;

/// A single mergeable result value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregateValue {
    /// Summed across merges.
    Number(f64),
    /// Last write wins.
    Text(String),
    /// Concatenated across merges.
    Sequence(Vec<Value>),
    /// Merged key by key.
    Nested(ResultAggregate),
    /// Booleans and nulls. Last write wins.
    Scalar(Value),
}

/// Discriminant of an [`AggregateValue`], used in conflict reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Number,
    Text,
    Sequence,
    Nested,
    Scalar,
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Number => "number",
            Self::Text => "text",
            Self::Sequence => "sequence",
            Self::Nested => "nested",
            Self::Scalar => "scalar",
        };
        f.write_str(name)
    }
}

impl AggregateValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Number(_) => ValueKind::Number,
            Self::Text(_) => ValueKind::Text,
            Self::Sequence(_) => ValueKind::Sequence,
            Self::Nested(_) => ValueKind::Nested,
            Self::Scalar(_) => ValueKind::Scalar,
        }
    }

    /// Numeric value, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Self::Sequence(items) => Some(items),
            _ => None,
        }
    }
}

impl From<f64> for AggregateValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for AggregateValue {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<usize> for AggregateValue {
    fn from(n: usize) -> Self {
        Self::Number(n as f64)
    }
}

impl From<&str> for AggregateValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for AggregateValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<Value>> for AggregateValue {
    fn from(items: Vec<Value>) -> Self {
        Self::Sequence(items)
    }
}

impl From<ResultAggregate> for AggregateValue {
    fn from(map: ResultAggregate) -> Self {
        Self::Nested(map)
    }
}

/// Two incompatible value kinds met under the same key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeConflict {
    /// Dotted path of the key, e.g. `timings.parse`.
    pub path: String,
    pub existing: ValueKind,
    pub incoming: ValueKind,
}

impl std::fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "key '{}' held a {} but received a {}; overwritten",
            self.path, self.existing, self.incoming
        )
    }
}

/// Merge `incoming` into `target`, returning every kind conflict encountered.
///
/// Conflicting keys are overwritten with the incoming value.
pub fn merge(target: &mut ResultAggregate, incoming: ResultAggregate) -> Vec<MergeConflict> {
    let mut conflicts = Vec::new();
    merge_into(target, incoming, "", &mut conflicts);
    conflicts
}

fn merge_into(
    target: &mut ResultAggregate,
    incoming: ResultAggregate,
    prefix: &str,
    conflicts: &mut Vec<MergeConflict>,
) {
    for (key, value) in incoming {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };

        match target.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
            Entry::Occupied(mut slot) => match (slot.get_mut(), value) {
                (AggregateValue::Number(a), AggregateValue::Number(b)) => *a += b,
                (AggregateValue::Sequence(a), AggregateValue::Sequence(b)) => a.extend(b),
                (AggregateValue::Nested(a), AggregateValue::Nested(b)) => {
                    merge_into(a, b, &path, conflicts)
                }
                (AggregateValue::Text(a), AggregateValue::Text(b)) => *a = b,
                (AggregateValue::Scalar(a), AggregateValue::Scalar(b)) => *a = b,
                (existing, incoming) => {
                    conflicts.push(MergeConflict {
                        path,
                        existing: existing.kind(),
                        incoming: incoming.kind(),
                    });
                    *existing = incoming;
                }
            },
        }
    }
}

/// Kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Error,
    Log,
}

/// A timestamped log record produced by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: LogKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl LogEntry {
    pub fn new(kind: LogKind, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
            data,
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == LogKind::Error
    }
}

/// Accumulated output of a whole job, as seen by the parent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStats {
    pub result: ResultAggregate,
    /// Entries in order of arrival at the parent.
    pub logs: Vec<LogEntry>,
    pub conflicts: Vec<MergeConflict>,
}

impl JobStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one worker report into the job stats.
    ///
    /// Returns the number of merge conflicts the report caused.
    pub fn absorb(&mut self, result: ResultAggregate, logs: Vec<LogEntry>) -> usize {
        let conflicts = merge(&mut self.result, result);
        for conflict in &conflicts {
            tracing::warn!(
                key = %conflict.path,
                existing = %conflict.existing,
                incoming = %conflict.incoming,
                "Result merge conflict"
            );
        }
        let count = conflicts.len();
        self.conflicts.extend(conflicts);
        self.logs.extend(logs);
        count
    }

    pub fn error_count(&self) -> usize {
        self.logs.iter().filter(|entry| entry.is_error()).count()
    }

    /// Look up a top-level numeric result.
    pub fn number(&self, key: &str) -> Option<f64> {
        self.result.get(key).and_then(AggregateValue::as_f64)
    }
}

/// Per-batch accumulator used inside a worker process.
///
/// Everything recorded here is shipped with the next batch response and then
/// cleared.
#[derive(Debug, Default)]
pub struct BatchStats {
    result: ResultAggregate,
    logs: Vec<LogEntry>,
}

impl BatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a result value, merging it with anything already recorded under `key`.
    pub fn add_result(&mut self, key: impl Into<String>, value: impl Into<AggregateValue>) {
        let mut incoming = ResultAggregate::new();
        incoming.insert(key.into(), value.into());
        for conflict in merge(&mut self.result, incoming) {
            tracing::warn!(key = %conflict.path, "{}", conflict);
        }
    }

    pub fn log(&mut self, message: impl Into<String>, data: Option<Value>) {
        self.logs.push(LogEntry::new(LogKind::Log, message, data));
    }

    pub fn error(&mut self, message: impl Into<String>, data: Option<Value>) {
        self.logs.push(LogEntry::new(LogKind::Error, message, data));
    }

    pub fn is_empty(&self) -> bool {
        self.result.is_empty() && self.logs.is_empty()
    }

    /// Hand over everything recorded since the last call and reset.
    pub fn take(&mut self) -> (ResultAggregate, Vec<LogEntry>) {
        (
            std::mem::take(&mut self.result),
            std::mem::take(&mut self.logs),
        )
    }
}
