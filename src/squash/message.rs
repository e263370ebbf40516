use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde_json::{Map, Value};

/// Timestamp rendering for the `ts` output field.
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// An immutable summary record: one line of output.
#[derive(Debug, Clone)]
pub struct Message {
    /// Final rendered string.
    pub message: String,
    /// Timestamp of the first contributing line.
    pub timestamp: NaiveDateTime,
    /// Accumulated named captures; keys with no values are dropped on
    /// serialization.
    pub info: IndexMap<String, Vec<String>>,
    /// First contributing line's index; the sort key of squashed output.
    pub index: usize,
    /// Number of input lines this record represents.
    pub source_lines: usize,
}

impl Message {
    /// Flat key/value rendering: `ts` and `msg` first, then each non-empty
    /// info key. Single-valued keys flatten to a string.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut obj = Map::new();
        obj.insert(
            "ts".to_string(),
            Value::String(self.timestamp.format(TS_FORMAT).to_string()),
        );
        obj.insert("msg".to_string(), Value::String(self.message.clone()));
        for (key, values) in &self.info {
            let value = match values.as_slice() {
                [] => continue,
                [single] => Value::String(single.clone()),
                many => Value::Array(many.iter().cloned().map(Value::String).collect()),
            };
            obj.insert(key.clone(), value);
        }
        obj
    }
}

/// Timestamps and indexes are tick-local bookkeeping; two Messages are the
/// same if they say the same thing about the same number of lines.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.message == other.message
            && self.info == other.info
            && self.source_lines == other.source_lines
    }
}

impl Eq for Message {}
