//! Document model for recorded runs.
//!
//! Every run is a stream of four document kinds:
//!
//! - **StartDoc**: sweep intent, arguments, experiment and sample names
//! - **DescriptorDoc**: schema of one data stream (`primary`, `retrace`, ...)
//! - **EventDoc**: one measurement point
//! - **StopDoc**: completion status and event count
//!
//! ```text
//! StartDoc (1)
//!    │
//!    ├── DescriptorDoc (1+, one per data stream)
//!    │       │
//!    │       └── EventDoc (N, measurements)
//!    │
//! StopDoc (1)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new unique document ID.
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// One line of a run file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    Start(StartDoc),
    Descriptor(DescriptorDoc),
    Event(EventDoc),
    Stop(StopDoc),
}

impl Document {
    /// The document's own UID.
    pub fn uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.uid,
            Document::Event(d) => &d.uid,
            Document::Stop(d) => &d.uid,
        }
    }

    /// The run this document belongs to (a StartDoc's uid is the run uid).
    pub fn run_uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.run_uid,
            Document::Event(d) => &d.run_uid,
            Document::Stop(d) => &d.run_uid,
        }
    }
}

/// Emitted once at the beginning of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier (this IS the run_uid).
    pub uid: String,
    /// Numeric run id, unique within a database.
    pub run_id: u64,
    /// Sweep kind that generated this run (`sweep1d`, `sweep2d`, ...).
    pub sweep_kind: String,
    /// User-chosen measurement name.
    pub name: String,
    /// Experiment name.
    pub experiment: String,
    /// Sample name.
    pub sample: String,
    /// Sweep arguments (start/stop/points/delay, rendered as strings).
    pub args: HashMap<String, String>,
    /// User-provided metadata.
    pub metadata: HashMap<String, String>,
    /// Timestamp when the run started.
    pub time_ns: u64,
}

impl StartDoc {
    pub fn new(run_id: u64, sweep_kind: &str, name: &str) -> Self {
        Self {
            uid: new_uid(),
            run_id,
            sweep_kind: sweep_kind.to_string(),
            name: name.to_string(),
            experiment: String::new(),
            sample: String::new(),
            args: HashMap::new(),
            metadata: HashMap::new(),
            time_ns: now_ns(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl ToString) -> Self {
        self.args.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Role of a field within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataRole {
    /// An independent variable the sweep sets.
    Setpoint,
    /// A dependent variable the sweep reads.
    Measured,
}

/// Schema of one field within a stream's events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataKey {
    /// Parameter that produced the field (e.g. `smu1.volt`).
    pub source: String,
    /// Physical units.
    pub units: String,
    /// Setpoint or measured.
    pub role: DataRole,
}

impl DataKey {
    pub fn setpoint(source: &str, units: &str) -> Self {
        Self {
            source: source.to_string(),
            units: units.to_string(),
            role: DataRole::Setpoint,
        }
    }

    pub fn measured(source: &str, units: &str) -> Self {
        Self {
            source: source.to_string(),
            units: units.to_string(),
            role: DataRole::Measured,
        }
    }
}

/// Defines the schema of one data stream of a run.
///
/// A run can carry several streams: `primary` for the forward sweep and
/// `retrace` for measured return sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorDoc {
    /// Unique descriptor ID.
    pub uid: String,
    /// Links to the StartDoc.
    pub run_uid: String,
    /// Stream name.
    pub stream: String,
    /// Field name to schema.
    pub data_keys: HashMap<String, DataKey>,
    /// Timestamp.
    pub time_ns: u64,
}

impl DescriptorDoc {
    pub fn new(run_uid: &str, stream: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            stream: stream.to_string(),
            data_keys: HashMap::new(),
            time_ns: now_ns(),
        }
    }

    pub fn with_data_key(mut self, field: &str, key: DataKey) -> Self {
        self.data_keys.insert(field.to_string(), key);
        self
    }
}

/// One measurement point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDoc {
    /// Unique event ID.
    pub uid: String,
    /// Links to the StartDoc.
    pub run_uid: String,
    /// Links to the DescriptorDoc that defines the schema.
    pub descriptor_uid: String,
    /// Sequence number within the stream, starting at 0.
    pub seq_num: u32,
    /// Timestamp.
    pub time_ns: u64,
    /// Setpoint values (axis name to position).
    pub positions: HashMap<String, f64>,
    /// Measured values (field name to value).
    pub data: HashMap<String, f64>,
    /// Per-field read timestamps.
    pub timestamps: HashMap<String, u64>,
}

impl EventDoc {
    pub fn new(run_uid: &str, descriptor_uid: &str, seq_num: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            descriptor_uid: descriptor_uid.to_string(),
            seq_num,
            time_ns: now_ns(),
            positions: HashMap::new(),
            data: HashMap::new(),
            timestamps: HashMap::new(),
        }
    }

    pub fn with_position(mut self, axis: &str, position: f64) -> Self {
        self.positions.insert(axis.to_string(), position);
        self
    }

    pub fn with_datum(mut self, field: &str, value: f64) -> Self {
        self.data.insert(field.to_string(), value);
        self.timestamps.insert(field.to_string(), now_ns());
        self
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    Abort,
    Fail,
}

/// Emitted once at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDoc {
    /// Unique stop doc ID.
    pub uid: String,
    /// Links to the StartDoc.
    pub run_uid: String,
    /// How the run ended.
    pub exit_status: ExitStatus,
    /// Reason for abort/failure, empty on success.
    pub reason: String,
    /// Timestamp when the run ended.
    pub time_ns: u64,
    /// Total events emitted across all streams.
    pub num_events: u32,
}

impl StopDoc {
    fn finish(run_uid: &str, exit_status: ExitStatus, reason: &str, num_events: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status,
            reason: reason.to_string(),
            time_ns: now_ns(),
            num_events,
        }
    }

    pub fn success(run_uid: &str, num_events: u32) -> Self {
        Self::finish(run_uid, ExitStatus::Success, "", num_events)
    }

    pub fn abort(run_uid: &str, reason: &str, num_events: u32) -> Self {
        Self::finish(run_uid, ExitStatus::Abort, reason, num_events)
    }

    pub fn fail(run_uid: &str, reason: &str, num_events: u32) -> Self {
        Self::finish(run_uid, ExitStatus::Fail, reason, num_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_doc_builder() {
        let doc = StartDoc::new(7, "sweep1d", "gate trace")
            .with_arg("points", 101)
            .with_arg("settle_ms", 100)
            .with_metadata("operator", "LB");

        assert_eq!(doc.run_id, 7);
        assert_eq!(doc.sweep_kind, "sweep1d");
        assert_eq!(doc.args.get("points"), Some(&"101".to_string()));
        assert_eq!(doc.metadata.get("operator"), Some(&"LB".to_string()));
    }

    #[test]
    fn test_descriptor_doc() {
        let run_uid = new_uid();
        let desc = DescriptorDoc::new(&run_uid, "primary")
            .with_data_key("smu1.volt", DataKey::setpoint("smu1.volt", "V"))
            .with_data_key("lockin1.x", DataKey::measured("lockin1.x", "V"));

        assert_eq!(desc.stream, "primary");
        assert_eq!(
            desc.data_keys.get("smu1.volt").map(|k| k.role),
            Some(DataRole::Setpoint)
        );
        assert_eq!(
            desc.data_keys.get("lockin1.x").map(|k| k.role),
            Some(DataRole::Measured)
        );
    }

    #[test]
    fn test_event_doc() {
        let event = EventDoc::new(&new_uid(), &new_uid(), 0)
            .with_position("smu1.volt", 0.5)
            .with_datum("lockin1.x", 0.042);

        assert_eq!(event.seq_num, 0);
        assert_eq!(event.positions.get("smu1.volt"), Some(&0.5));
        assert_eq!(event.data.get("lockin1.x"), Some(&0.042));
        assert!(event.timestamps.contains_key("lockin1.x"));
    }

    #[test]
    fn test_document_round_trips_through_json() {
        let doc = Document::Stop(StopDoc::abort(&new_uid(), "operator abort", 42));
        let line = serde_json::to_string(&doc).unwrap();
        assert!(line.contains("\"type\":\"stop\""));
        let back: Document = serde_json::from_str(&line).unwrap();
        match back {
            Document::Stop(stop) => {
                assert_eq!(stop.exit_status, ExitStatus::Abort);
                assert_eq!(stop.num_events, 42);
            }
            _ => panic!("wrong variant"),
        }
    }
}
