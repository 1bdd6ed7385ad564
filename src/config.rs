//! Application configuration loading and validation.
//!
//! Settings come from a TOML file with optional environment-variable
//! overrides (prefix `MESO_`, `__` as nesting separator). Loading is split in
//! two phases: deserialization via the `config` crate, then a semantic
//! validation pass that catches values which parse fine but make no sense
//! (unknown drivers, missing VISA resource strings, zero-point retraces).
//!
//! ## Example
//!
//! ```toml
//! [database]
//! path = "data/runs"
//!
//! [station]
//! current_range = 1e-8
//!
//! [station.instruments.lockin1]
//! driver = "sr830"
//! resource = "GPIB0::8::INSTR"
//! timeout = "2s"
//!
//! [station.instruments.smu1]
//! driver = "smu"
//! resource = "TCPIP0::192.168.1.20::INSTR"
//! max_rate = 0.05
//!
//! [sweep]
//! settle = "100ms"
//! outer_settle = "1s"
//! concurrent_reads = false
//! retrace_points = 201
//! ```
//!
//! A `resource` of the form `mock://<anything>` selects the in-memory
//! transport, which is how tests and the demo run without hardware.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MesoError, MesoResult};

/// Instrument driver kinds understood by `init_station`.
pub const KNOWN_DRIVERS: &[&str] = &["mock", "sr830", "smu", "rf", "cryostat"];

/// Top-level application settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Run database location.
    pub database: DatabaseSettings,
    /// Station composition.
    #[serde(default)]
    pub station: StationSettings,
    /// Sweep defaults applied when a sweep does not override them.
    #[serde(default)]
    pub sweep: SweepDefaults,
}

/// Where run documents are persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// Directory holding one JSON-lines file per run.
    pub path: PathBuf,
}

/// Instruments making up the station, plus station-level soft parameters.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StationSettings {
    /// Instrument name -> instrument settings.
    #[serde(default)]
    pub instruments: HashMap<String, InstrumentSettings>,
    /// Current-to-voltage conversion range of the measurement amplifier, A/V.
    #[serde(default = "default_current_range")]
    pub current_range: f64,
}

/// A single configured instrument.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentSettings {
    /// Driver kind, one of [`KNOWN_DRIVERS`].
    pub driver: String,
    /// VISA resource string or IP address, `mock://...` for the in-memory
    /// transport. The `mock` driver needs no resource.
    pub resource: Option<String>,
    /// Transport timeout.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Maximum sweeping rate of this instrument's source outputs, units/s.
    pub max_rate: Option<f64>,
    /// Compliance limit for SMU current, A.
    pub current_limit: Option<f64>,
    /// Soft limit for SMU voltage, V.
    pub voltage_limit: Option<f64>,
}

/// Sweep parameters used when a sweep builder does not override them.
#[derive(Debug, Clone, Deserialize)]
pub struct SweepDefaults {
    /// Settle time after each inner setpoint.
    #[serde(default = "default_settle", with = "humantime_serde")]
    pub settle: Duration,
    /// Settle time after stepping the outer (slow) axis of a 2D sweep.
    #[serde(default = "default_outer_settle", with = "humantime_serde")]
    pub outer_settle: Duration,
    /// Issue dependent-parameter reads concurrently.
    #[serde(default)]
    pub concurrent_reads: bool,
    /// Number of unrecorded steps used to return the fast axis to its start.
    #[serde(default = "default_retrace_points")]
    pub retrace_points: usize,
}

impl Default for SweepDefaults {
    fn default() -> Self {
        Self {
            settle: default_settle(),
            outer_settle: default_outer_settle(),
            concurrent_reads: false,
            retrace_points: default_retrace_points(),
        }
    }
}

fn default_current_range() -> f64 {
    1e-8
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_settle() -> Duration {
    Duration::from_millis(100)
}

fn default_outer_settle() -> Duration {
    Duration::from_secs(1)
}

fn default_retrace_points() -> usize {
    201
}

impl Settings {
    /// Load settings from a TOML file, applying `MESO_*` env overrides.
    pub fn load(path: impl AsRef<Path>) -> MesoResult<Self> {
        let settings: Settings = ::config::Config::builder()
            .add_source(::config::File::from(path.as_ref()))
            .add_source(::config::Environment::with_prefix("MESO").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks beyond what deserialization enforces.
    pub fn validate(&self) -> MesoResult<()> {
        if self.database.path.as_os_str().is_empty() {
            return Err(MesoError::Configuration(
                "database.path must not be empty".to_string(),
            ));
        }
        if self.sweep.retrace_points < 2 {
            return Err(MesoError::Configuration(
                "sweep.retrace_points must be at least 2".to_string(),
            ));
        }
        for (name, instr) in &self.station.instruments {
            if !KNOWN_DRIVERS.contains(&instr.driver.as_str()) {
                return Err(MesoError::Configuration(format!(
                    "instrument '{}' has unknown driver '{}' (known: {})",
                    name,
                    instr.driver,
                    KNOWN_DRIVERS.join(", ")
                )));
            }
            if instr.driver != "mock" && instr.resource.is_none() {
                return Err(MesoError::Configuration(format!(
                    "instrument '{}' with driver '{}' needs a resource string",
                    name, instr.driver
                )));
            }
            if let Some(rate) = instr.max_rate {
                if !(rate > 0.0) {
                    return Err(MesoError::Configuration(format!(
                        "instrument '{}': max_rate must be positive",
                        name
                    )));
                }
            }
        }
        Ok(())
    }
}
