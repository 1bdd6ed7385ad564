//! Experiment registration and run persistence.
//!
//! Follows a Bluesky-style document flow: every run emits a StartDoc, one
//! DescriptorDoc per data stream, one EventDoc per measurement point and a
//! closing StopDoc. Runs are stored as JSON-lines files in a directory-backed
//! [`Database`] keyed by auto-incrementing run ids.
//!
//! # Example
//!
//! ```rust,ignore
//! use mesoscope::experiment::{create_exp, init_db};
//!
//! let db = init_db("./data")?;
//! let exp = create_exp(&db, "cooldown7", "hall_bar_A");
//! // pass `&exp` to a sweep; it claims a run id and writes the documents
//! ```

pub mod db;
pub mod document;

pub use db::{create_exp, init_db, Database, Experiment, RunRecord, RunWriter};
pub use document::{
    DataKey, DataRole, DescriptorDoc, Document, EventDoc, ExitStatus, StartDoc, StopDoc,
};
