//! Directory-backed run database.
//!
//! A [`Database`] is a directory of JSON-lines run files, `run_<id>.jsonl`,
//! one document per line. Run ids auto-increment and survive process
//! restarts: [`init_db`] derives the next id from the files already present.
//! Ids are never reused, aborted and failed runs keep theirs.
//!
//! The writer flushes after every event so a crash mid-sweep loses at most
//! the point being written.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::DataPoint;
use crate::error::{MesoError, MesoResult};
use crate::experiment::document::{
    DescriptorDoc, Document, EventDoc, StartDoc, StopDoc,
};
use crate::metadata::Metadata;

/// A directory of recorded runs.
pub struct Database {
    root: PathBuf,
    next_run: AtomicU64,
}

/// Open (or create) a run database at `path`.
pub fn init_db(path: impl AsRef<Path>) -> MesoResult<Arc<Database>> {
    let root = path.as_ref().to_path_buf();
    fs::create_dir_all(&root)?;

    let mut max_id = 0u64;
    for entry in fs::read_dir(&root)? {
        let entry = entry?;
        if let Some(id) = run_id_from_file_name(&entry.file_name().to_string_lossy()) {
            max_id = max_id.max(id);
        }
    }
    info!(path = %root.display(), next_run = max_id + 1, "run database opened");
    Ok(Arc::new(Database {
        root,
        next_run: AtomicU64::new(max_id + 1),
    }))
}

fn run_id_from_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("run_")?
        .strip_suffix(".jsonl")?
        .parse()
        .ok()
}

impl Database {
    /// Directory holding the run files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a run's file (which may not exist yet).
    pub fn run_path(&self, run_id: u64) -> PathBuf {
        self.root.join(format!("run_{run_id}.jsonl"))
    }

    /// Claim the next run id. Ids are handed out once and never reused.
    fn claim_run_id(&self) -> u64 {
        self.next_run.fetch_add(1, Ordering::SeqCst)
    }

    /// Ids of all runs present, ascending.
    pub fn run_ids(&self) -> MesoResult<Vec<u64>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(id) = run_id_from_file_name(&entry.file_name().to_string_lossy()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Load a recorded run back from disk.
    pub fn load_run(&self, run_id: u64) -> MesoResult<RunRecord> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Err(MesoError::RunNotFound(run_id));
        }
        let file = File::open(&path)?;
        let mut record = RunRecord {
            start: None,
            descriptors: Vec::new(),
            events: Vec::new(),
            stop: None,
        };
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Document>(&line)? {
                Document::Start(d) => record.start = Some(d),
                Document::Descriptor(d) => record.descriptors.push(d),
                Document::Event(d) => record.events.push(d),
                Document::Stop(d) => record.stop = Some(d),
            }
        }
        Ok(record)
    }
}

/// A run loaded back from disk.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub start: Option<StartDoc>,
    pub descriptors: Vec<DescriptorDoc>,
    pub events: Vec<EventDoc>,
    pub stop: Option<StopDoc>,
}

impl RunRecord {
    /// Events belonging to the named stream, in sequence order.
    pub fn stream_events(&self, stream: &str) -> Vec<&EventDoc> {
        let Some(descriptor) = self.descriptors.iter().find(|d| d.stream == stream) else {
            return Vec::new();
        };
        self.events
            .iter()
            .filter(|e| e.descriptor_uid == descriptor.uid)
            .collect()
    }

    /// The descriptor of the named stream, if the run has one.
    pub fn descriptor(&self, stream: &str) -> Option<&DescriptorDoc> {
        self.descriptors.iter().find(|d| d.stream == stream)
    }

    /// Flatten a stream's measured fields into scalar [`DataPoint`]s, the
    /// record shape plotting front-ends consume.
    pub fn data_points(&self, stream: &str) -> Vec<DataPoint> {
        let Some(descriptor) = self.descriptor(stream) else {
            return Vec::new();
        };
        let mut points = Vec::new();
        for event in self.stream_events(stream) {
            for (field, value) in &event.data {
                let ns = event.timestamps.get(field).copied().unwrap_or(event.time_ns);
                let (instrument_id, channel) = match field.split_once('.') {
                    Some((inst, chan)) => (inst.to_string(), chan.to_string()),
                    None => (String::new(), field.clone()),
                };
                points.push(DataPoint {
                    timestamp: chrono::DateTime::from_timestamp_nanos(ns as i64),
                    instrument_id,
                    channel,
                    value: *value,
                    unit: descriptor
                        .data_keys
                        .get(field)
                        .map(|k| k.units.clone())
                        .unwrap_or_default(),
                });
            }
        }
        points
    }
}

/// A named experiment within a database.
///
/// Stamps its name and sample onto every run it begins.
#[derive(Clone)]
pub struct Experiment {
    db: Arc<Database>,
    name: String,
    sample: String,
    metadata: Metadata,
}

/// Create an experiment handle for `db`.
pub fn create_exp(
    db: &Arc<Database>,
    name: impl Into<String>,
    sample: impl Into<String>,
) -> Experiment {
    let name = name.into();
    let sample = sample.into();
    let metadata = Metadata::builder()
        .experiment_name(&name)
        .sample_name(&sample)
        .build();
    Experiment {
        db: db.clone(),
        name,
        sample,
        metadata,
    }
}

impl Experiment {
    /// Experiment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sample name.
    pub fn sample(&self) -> &str {
        &self.sample
    }

    /// The backing database.
    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Attach free-form metadata stamped into every future StartDoc.
    pub fn set_metadata(&mut self, metadata: Metadata) {
        self.metadata = metadata;
    }

    /// Begin a run: claims a run id, opens the file and writes the StartDoc.
    pub fn begin_run(&self, mut start: StartDoc) -> MesoResult<RunWriter> {
        let run_id = self.db.claim_run_id();
        start.run_id = run_id;
        start.experiment = self.name.clone();
        start.sample = self.sample.clone();
        for (key, value) in &self.metadata.parameters {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            start.metadata.entry(key.clone()).or_insert(rendered);
        }

        let path = self.db.run_path(run_id);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        let mut writer = RunWriter {
            run_id,
            run_uid: start.uid.clone(),
            file: BufWriter::new(file),
            seq: HashMap::new(),
            num_events: 0,
            closed: false,
        };
        writer.write_doc(&Document::Start(start))?;
        debug!(run_id, path = %path.display(), "run started");
        Ok(writer)
    }
}

/// Writes one run's documents to its file.
pub struct RunWriter {
    run_id: u64,
    run_uid: String,
    file: BufWriter<File>,
    // per-stream sequence counters, keyed by descriptor uid
    seq: HashMap<String, u32>,
    num_events: u32,
    closed: bool,
}

impl RunWriter {
    /// Numeric run id.
    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Run UID (the StartDoc's uid).
    pub fn run_uid(&self) -> &str {
        &self.run_uid
    }

    /// Events written so far, across all streams.
    pub fn num_events(&self) -> u32 {
        self.num_events
    }

    fn write_doc(&mut self, doc: &Document) -> MesoResult<()> {
        let line = serde_json::to_string(doc)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        Ok(())
    }

    /// Declare a data stream; returns the descriptor uid events refer to.
    pub fn descriptor(&mut self, mut doc: DescriptorDoc) -> MesoResult<String> {
        doc.run_uid = self.run_uid.clone();
        let uid = doc.uid.clone();
        self.seq.insert(uid.clone(), 0);
        self.write_doc(&Document::Descriptor(doc))?;
        Ok(uid)
    }

    /// Write one event into the stream `descriptor_uid` belongs to.
    ///
    /// Sequence numbers are assigned here, strictly increasing from 0 per
    /// stream.
    pub fn event(&mut self, descriptor_uid: &str, mut doc: EventDoc) -> MesoResult<()> {
        let seq = self
            .seq
            .get_mut(descriptor_uid)
            .ok_or_else(|| MesoError::UnknownComponent(format!("stream {descriptor_uid}")))?;
        doc.run_uid = self.run_uid.clone();
        doc.descriptor_uid = descriptor_uid.to_string();
        doc.seq_num = *seq;
        *seq += 1;
        self.num_events += 1;
        self.write_doc(&Document::Event(doc))
    }

    /// Close the run with the given StopDoc.
    pub fn finish(mut self, stop: StopDoc) -> MesoResult<()> {
        self.write_doc(&Document::Stop(stop))?;
        self.closed = true;
        debug!(run_id = self.run_id, events = self.num_events, "run closed");
        Ok(())
    }
}

impl Drop for RunWriter {
    fn drop(&mut self) {
        if !self.closed {
            // Crash or early return without a StopDoc: flush what we have.
            let _ = self.file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::document::{DataKey, ExitStatus};
    use tempfile::TempDir;

    fn temp_db() -> (TempDir, Arc<Database>) {
        let dir = TempDir::new().unwrap();
        let db = init_db(dir.path()).unwrap();
        (dir, db)
    }

    #[test]
    fn test_run_ids_increment_and_survive_reopen() {
        let (dir, db) = temp_db();
        let exp = create_exp(&db, "cooldown7", "hall_bar_A");

        let w1 = exp.begin_run(StartDoc::new(0, "sweep1d", "a")).unwrap();
        let id1 = w1.run_id();
        w1.finish(StopDoc::success("", 0)).unwrap();
        let w2 = exp.begin_run(StartDoc::new(0, "sweep1d", "b")).unwrap();
        let id2 = w2.run_id();
        w2.finish(StopDoc::abort("", "test", 0)).unwrap();
        assert_eq!(id2, id1 + 1);

        // Reopen: the next id continues after the aborted run's id.
        let db2 = init_db(dir.path()).unwrap();
        let exp2 = create_exp(&db2, "cooldown7", "hall_bar_A");
        let w3 = exp2.begin_run(StartDoc::new(0, "sweep1d", "c")).unwrap();
        assert_eq!(w3.run_id(), id2 + 1);
        w3.finish(StopDoc::success("", 0)).unwrap();
    }

    #[test]
    fn test_round_trip_run() {
        let (_dir, db) = temp_db();
        let exp = create_exp(&db, "cooldown7", "hall_bar_A");

        let mut writer = exp
            .begin_run(StartDoc::new(0, "sweep1d", "gate trace").with_arg("points", 3))
            .unwrap();
        let primary = writer
            .descriptor(
                DescriptorDoc::new("", "primary")
                    .with_data_key("gate", DataKey::setpoint("mock1.gate", "V"))
                    .with_data_key("x", DataKey::measured("mock1.x", "V")),
            )
            .unwrap();
        for (i, gate) in [0.0, 0.5, 1.0].iter().enumerate() {
            writer
                .event(
                    &primary,
                    EventDoc::new("", "", 0)
                        .with_position("gate", *gate)
                        .with_datum("x", i as f64 * 1e-3),
                )
                .unwrap();
        }
        let run_id = writer.run_id();
        let events = writer.num_events();
        writer.finish(StopDoc::success("", events)).unwrap();

        let record = db.load_run(run_id).unwrap();
        let start = record.start.clone().unwrap();
        assert_eq!(start.experiment, "cooldown7");
        assert_eq!(start.sample, "hall_bar_A");
        assert_eq!(start.run_id, run_id);
        let events = record.stream_events("primary");
        assert_eq!(events.len(), 3);
        let seqs: Vec<u32> = events.iter().map(|e| e.seq_num).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(record.stop.unwrap().exit_status, ExitStatus::Success);
    }

    #[test]
    fn test_streams_have_independent_sequences() {
        let (_dir, db) = temp_db();
        let exp = create_exp(&db, "e", "s");
        let mut writer = exp.begin_run(StartDoc::new(0, "sweep2d", "map")).unwrap();
        let primary = writer.descriptor(DescriptorDoc::new("", "primary")).unwrap();
        let retrace = writer.descriptor(DescriptorDoc::new("", "retrace")).unwrap();

        writer.event(&primary, EventDoc::new("", "", 0)).unwrap();
        writer.event(&retrace, EventDoc::new("", "", 0)).unwrap();
        writer.event(&primary, EventDoc::new("", "", 0)).unwrap();
        let run_id = writer.run_id();
        writer.finish(StopDoc::success("", 3)).unwrap();

        let record = db.load_run(run_id).unwrap();
        let primary_seqs: Vec<u32> = record
            .stream_events("primary")
            .iter()
            .map(|e| e.seq_num)
            .collect();
        let retrace_seqs: Vec<u32> = record
            .stream_events("retrace")
            .iter()
            .map(|e| e.seq_num)
            .collect();
        assert_eq!(primary_seqs, vec![0, 1]);
        assert_eq!(retrace_seqs, vec![0]);
    }

    #[test]
    fn test_load_missing_run_fails() {
        let (_dir, db) = temp_db();
        assert!(matches!(db.load_run(99), Err(MesoError::RunNotFound(99))));
    }
}
