//! Station registry: the named collection of instruments for a session.
//!
//! A [`Station`] is created once at process start, owns every instrument
//! handle for the lifetime of the measurement session, and is torn down at
//! process exit. Component names are unique; registering a second instrument
//! under an existing name is an error unless [`Station::replace_instrument`]
//! is used, which disconnects the old instance first (the moral equivalent of
//! recreating an instrument that is already open).
//!
//! Besides instruments, a station can carry free-standing soft parameters,
//! e.g. the current-range setting of an external I/V converter that has no
//! remote interface but still belongs in the run metadata.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Settings;
use crate::core::{Readable, Settable, SoftParameter};
use crate::error::{MesoError, MesoResult};
use crate::instrument::{
    transport, Cryostat, Instrument, LockinAmp, MockInstrument, RfSource, Smu, SmuLimits,
};

/// Named collection of instrument handles and soft parameters.
#[derive(Default)]
pub struct Station {
    instruments: HashMap<String, Arc<dyn Instrument>>,
    parameters: HashMap<String, Arc<dyn Settable>>,
}

impl Station {
    /// Create an empty station.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instrument under its own name.
    pub fn add_instrument(&mut self, instrument: Arc<dyn Instrument>) -> MesoResult<()> {
        let name = instrument.name().to_string();
        if self.instruments.contains_key(&name) || self.parameters.contains_key(&name) {
            return Err(MesoError::DuplicateComponent(name));
        }
        self.instruments.insert(name, instrument);
        Ok(())
    }

    /// Replace an instrument, disconnecting the previous instance if present.
    pub async fn replace_instrument(&mut self, instrument: Arc<dyn Instrument>) -> MesoResult<()> {
        let name = instrument.name().to_string();
        if let Some(old) = self.instruments.remove(&name) {
            info!(instrument = %name, "closing and recreating instrument");
            if let Err(e) = old.disconnect().await {
                warn!(instrument = %name, error = %e, "failed to disconnect old instance");
            }
        }
        self.instruments.insert(name, instrument);
        Ok(())
    }

    /// Look up an instrument by name.
    pub fn instrument(&self, name: &str) -> MesoResult<Arc<dyn Instrument>> {
        self.instruments
            .get(name)
            .cloned()
            .ok_or_else(|| MesoError::UnknownComponent(name.to_string()))
    }

    /// Register a station-level soft parameter.
    pub fn add_parameter(&mut self, parameter: Arc<dyn Settable>) -> MesoResult<()> {
        let name = parameter.name().to_string();
        if self.parameters.contains_key(&name) || self.instruments.contains_key(&name) {
            return Err(MesoError::DuplicateComponent(name));
        }
        self.parameters.insert(name, parameter);
        Ok(())
    }

    /// Look up a station-level soft parameter.
    pub fn parameter(&self, name: &str) -> MesoResult<Arc<dyn Settable>> {
        self.parameters
            .get(name)
            .cloned()
            .ok_or_else(|| MesoError::UnknownComponent(name.to_string()))
    }

    /// Find a settable channel of a registered instrument by parameter name.
    ///
    /// `param` matches either the bare channel name ("volt") or the qualified
    /// one ("smu1.volt").
    pub fn find_settable(&self, instrument: &str, param: &str) -> MesoResult<Arc<dyn Settable>> {
        let inst = self.instrument(instrument)?;
        inst.settables()
            .into_iter()
            .find(|p| p.name() == param || p.name().ends_with(&format!(".{param}")))
            .ok_or_else(|| MesoError::UnknownComponent(format!("{instrument}.{param}")))
    }

    /// Find a readable channel of a registered instrument by parameter name.
    pub fn find_readable(&self, instrument: &str, param: &str) -> MesoResult<Arc<dyn Readable>> {
        let inst = self.instrument(instrument)?;
        inst.readables()
            .into_iter()
            .find(|p| p.name() == param || p.name().ends_with(&format!(".{param}")))
            .ok_or_else(|| MesoError::UnknownComponent(format!("{instrument}.{param}")))
    }

    /// Names of all registered instruments, sorted.
    pub fn instrument_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instruments.keys().cloned().collect();
        names.sort();
        names
    }

    /// Disconnect every instrument. Errors are collected so one failing
    /// instrument does not leave the rest connected.
    pub async fn close_all(&self) -> MesoResult<()> {
        let mut errors = Vec::new();
        for (name, instrument) in &self.instruments {
            if let Err(e) = instrument.disconnect().await {
                warn!(instrument = %name, error = %e, "disconnect failed");
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(MesoError::ShutdownFailed(errors))
        }
    }
}

/// Build and connect the station described by the settings.
///
/// Instruments are constructed in name order, connected, and registered.
/// The station-level `current_range` soft parameter is always present.
pub async fn init_station(settings: &Settings) -> MesoResult<Station> {
    let mut station = Station::new();

    let mut names: Vec<&String> = settings.station.instruments.keys().collect();
    names.sort();

    for name in names {
        let cfg = &settings.station.instruments[name];
        let instrument: Arc<dyn Instrument> = match cfg.driver.as_str() {
            "mock" => Arc::new(MockInstrument::new(name)),
            driver => {
                let resource = cfg.resource.as_deref().ok_or_else(|| {
                    MesoError::Configuration(format!("instrument '{name}' has no resource"))
                })?;
                let transport = transport::from_resource(name, resource, cfg.timeout)?;
                match driver {
                    "sr830" => Arc::new(LockinAmp::new(name, transport)),
                    "smu" => Arc::new(Smu::new(
                        name,
                        transport,
                        SmuLimits {
                            max_rate: cfg.max_rate,
                            voltage_limit: cfg.voltage_limit,
                            current_limit: cfg.current_limit,
                        },
                    )),
                    "rf" => Arc::new(RfSource::new(name, transport)),
                    "cryostat" => Arc::new(Cryostat::new(name, transport)),
                    other => {
                        return Err(MesoError::Configuration(format!(
                            "instrument '{name}' has unknown driver '{other}'"
                        )))
                    }
                }
            }
        };

        instrument.connect().await?;
        info!(instrument = %name, driver = %cfg.driver, "instrument connected");
        station.add_instrument(instrument)?;
    }

    station.add_parameter(Arc::new(SoftParameter::new(
        "current_range",
        "A/V",
        settings.station.current_range,
    )))?;

    Ok(station)
}
