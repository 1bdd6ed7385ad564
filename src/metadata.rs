//! Experimental metadata structures.
//!
//! A `Metadata` object is created when an experiment is registered and is
//! stamped into the start document of every run it owns. Capturing the
//! instrument configuration and environment next to the data is what makes a
//! cooldown's worth of runs interpretable months later.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Descriptive metadata attached to an experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    /// The name of the experiment (e.g. "gate_map_B0").
    pub experiment_name: String,
    /// Sample identifier (e.g. "hBN-Gr-hBN_A3").
    pub sample_name: String,
    /// Free-text description of the measurement's purpose.
    pub description: String,
    /// Snapshot of the instrument configuration at experiment creation.
    pub instrument_config: HashMap<String, String>,
    /// User-defined experimental parameters.
    pub parameters: HashMap<String, serde_json::Value>,
    /// Environmental conditions (e.g. mixing-chamber temperature, field).
    pub environment: HashMap<String, f64>,
    /// Version of the measurement software.
    pub software_version: String,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            experiment_name: "untitled".to_string(),
            sample_name: "unknown_sample".to_string(),
            description: String::new(),
            instrument_config: HashMap::new(),
            parameters: HashMap::new(),
            environment: HashMap::new(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Metadata {
    /// Start building a metadata object.
    pub fn builder() -> MetadataBuilder {
        MetadataBuilder::new()
    }

    /// Checks the metadata is complete enough to persist.
    pub fn validate(&self) -> Result<(), String> {
        if self.experiment_name.is_empty() {
            return Err("Experiment name cannot be empty.".to_string());
        }
        if self.sample_name.is_empty() {
            return Err("Sample name cannot be empty.".to_string());
        }
        Ok(())
    }
}

/// Builder for constructing [`Metadata`] instances.
#[derive(Default)]
pub struct MetadataBuilder {
    inner: Metadata,
}

impl MetadataBuilder {
    /// Start from default metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the experiment name.
    pub fn experiment_name(mut self, name: &str) -> Self {
        self.inner.experiment_name = name.to_string();
        self
    }

    /// Set the sample name.
    pub fn sample_name(mut self, name: &str) -> Self {
        self.inner.sample_name = name.to_string();
        self
    }

    /// Set the free-text description.
    pub fn description(mut self, description: &str) -> Self {
        self.inner.description = description.to_string();
        self
    }

    /// Record one instrument configuration entry.
    pub fn instrument_config(mut self, key: &str, value: &str) -> Self {
        self.inner
            .instrument_config
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Record one user-defined parameter.
    pub fn parameter(mut self, key: &str, value: serde_json::Value) -> Self {
        self.inner.parameters.insert(key.to_string(), value);
        self
    }

    /// Record one environment reading.
    pub fn environment(mut self, key: &str, value: f64) -> Self {
        self.inner.environment.insert(key.to_string(), value);
        self
    }

    /// Finish building.
    pub fn build(self) -> Metadata {
        self.inner
    }
}
