//! Export of recorded runs to external formats.

mod storage;

pub use storage::CsvExporter;
