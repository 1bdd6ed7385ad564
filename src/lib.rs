//! Core library for the mesoscope measurement-automation layer.
//!
//! This library provides the building blocks for low-temperature transport
//! measurements: a station registry of instruments (lock-in amplifiers,
//! source-measurement units, RF sources, a cryostat), setpoint array
//! generation, 1D/2D sweep execution with settling delays, and document-based
//! persistence of sweep results keyed by auto-incrementing run ids.
//!
//! # Typical session
//!
//! ```rust,ignore
//! use mesoscope::{config::Settings, experiment, measurement, station};
//!
//! let settings = Settings::load("config/default.toml")?;
//! let db = experiment::init_db(&settings.database.path)?;
//! let station = station::init_station(&settings).await?;
//! let exp = experiment::create_exp(&db, "gate_map", "device_A3");
//!
//! let gate = station.find_settable("smu1", "volt")?;
//! let x = station.find_readable("lockin1", "x")?;
//!
//! let array = measurement::lin_array(-1.0, 1.0, measurement::Spacing::Points(201))?;
//! let summary = measurement::Sweep1d::new(gate, array)
//!     .read(x)
//!     .settle(Duration::from_millis(100))
//!     .named("gate trace")
//!     .run(&exp)
//!     .await?;
//! ```

pub mod config;
pub mod core;
pub mod data;
pub mod error;
pub mod experiment;
pub mod instrument;
pub mod measurement;
pub mod metadata;
pub mod station;
