//! Run export with clean feature flag handling.
//!
//! Exports flatten one stream of a recorded run into a table: metadata as
//! commented header lines, then one row per event with setpoints before
//! measured fields.

use crate::error::MesoResult;
use crate::experiment::Database;
use std::path::Path;

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use crate::error::MesoError;
    use crate::experiment::DataRole;
    use std::fs::File;
    use std::io::Write;
    use tracing::info;

    /// Writes one stream of a run as CSV with a commented metadata header.
    pub struct CsvExporter;

    impl Default for CsvExporter {
        fn default() -> Self {
            Self::new()
        }
    }

    impl CsvExporter {
        pub fn new() -> Self {
            Self
        }

        /// Export `stream` of run `run_id` to `output`.
        ///
        /// Columns: `seq_num`, `time_ns`, the stream's setpoint fields, then
        /// its measured fields, each group in name order.
        pub fn export(
            &self,
            db: &Database,
            run_id: u64,
            stream: &str,
            output: impl AsRef<Path>,
        ) -> MesoResult<()> {
            let record = db.load_run(run_id)?;
            let descriptor = record.descriptor(stream).ok_or_else(|| {
                MesoError::UnknownComponent(format!("stream {stream} of run {run_id}"))
            })?;

            let mut setpoints: Vec<&String> = descriptor
                .data_keys
                .iter()
                .filter(|(_, k)| k.role == DataRole::Setpoint)
                .map(|(name, _)| name)
                .collect();
            setpoints.sort();
            let mut measured: Vec<&String> = descriptor
                .data_keys
                .iter()
                .filter(|(_, k)| k.role == DataRole::Measured)
                .map(|(name, _)| name)
                .collect();
            measured.sort();

            let mut file = File::create(output.as_ref())?;
            if let Some(start) = &record.start {
                let header = serde_json::to_string_pretty(start)?;
                for line in header.lines() {
                    file.write_all(b"# ")?;
                    file.write_all(line.as_bytes())?;
                    file.write_all(b"\n")?;
                }
            }

            let mut writer = csv::Writer::from_writer(file);
            let mut columns = vec!["seq_num".to_string(), "time_ns".to_string()];
            columns.extend(setpoints.iter().map(|s| s.to_string()));
            columns.extend(measured.iter().map(|s| s.to_string()));
            writer.write_record(&columns)?;

            let events = record.stream_events(stream);
            let num_rows = events.len();
            for event in events {
                let mut row = vec![event.seq_num.to_string(), event.time_ns.to_string()];
                for name in &setpoints {
                    row.push(
                        event
                            .positions
                            .get(*name)
                            .map(|v| v.to_string())
                            .unwrap_or_default(),
                    );
                }
                for name in &measured {
                    row.push(
                        event
                            .data
                            .get(*name)
                            .map(|v| v.to_string())
                            .unwrap_or_default(),
                    );
                }
                writer.write_record(&row)?;
            }
            writer.flush()?;
            info!(
                run_id,
                stream,
                rows = num_rows,
                path = %output.as_ref().display(),
                "run exported"
            );
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use crate::error::MesoError;

    /// Stub exporter; the `storage_csv` feature is disabled.
    pub struct CsvExporter;

    impl Default for CsvExporter {
        fn default() -> Self {
            Self::new()
        }
    }

    impl CsvExporter {
        pub fn new() -> Self {
            Self
        }

        pub fn export(
            &self,
            _db: &Database,
            _run_id: u64,
            _stream: &str,
            _output: impl AsRef<Path>,
        ) -> MesoResult<()> {
            Err(MesoError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvExporter;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvExporter;
