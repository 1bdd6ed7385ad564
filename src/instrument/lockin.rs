//! SR830-style lock-in amplifier driver.
//!
//! Command map (SR830 remote programming set): `FREQ`/`SLVL`/`PHAS` for the
//! reference oscillator, `FMOD` for internal/external reference selection,
//! `OUTP? 1..4` for the X, Y, R and theta readings.
//!
//! In a multi-lock-in setup one unit sources the reference signal and the
//! others lock to it externally; [`setup_lockins`] wires a whole station that
//! way.

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tracing::info;

use crate::core::{Readable, Settable};
use crate::error::MesoResult;
use crate::instrument::transport::ScpiTransport;
use crate::instrument::{Instrument, ScpiChannel};
use crate::station::Station;

/// Lock-in amplifier speaking the SR830 command set.
pub struct LockinAmp {
    name: String,
    transport: Arc<dyn ScpiTransport>,
    frequency: Arc<ScpiChannel>,
    amplitude: Arc<ScpiChannel>,
    phase: Arc<ScpiChannel>,
    x: Arc<ScpiChannel>,
    y: Arc<ScpiChannel>,
    r: Arc<ScpiChannel>,
    theta: Arc<ScpiChannel>,
}

impl LockinAmp {
    /// Create a driver over the given transport.
    pub fn new(name: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Self {
        let name = name.into();
        let ch = |param: &str, unit: &str| -> ScpiChannel {
            ScpiChannel::new(format!("{name}.{param}"), unit, transport.clone())
        };
        Self {
            frequency: Arc::new(ch("frequency", "Hz").set_cmd("FREQ").get_cmd("FREQ?")),
            amplitude: Arc::new(
                ch("amplitude", "V")
                    .set_cmd("SLVL")
                    .get_cmd("SLVL?")
                    // SR830 sine output range
                    .with_limits(0.004, 5.0),
            ),
            phase: Arc::new(ch("phase", "deg").set_cmd("PHAS").get_cmd("PHAS?")),
            x: Arc::new(ch("x", "V").get_cmd("OUTP? 1")),
            y: Arc::new(ch("y", "V").get_cmd("OUTP? 2")),
            r: Arc::new(ch("r", "V").get_cmd("OUTP? 3")),
            theta: Arc::new(ch("theta", "deg").get_cmd("OUTP? 4")),
            name,
            transport,
        }
    }

    /// Reference frequency settable.
    pub fn frequency(&self) -> Arc<dyn Settable> {
        self.frequency.clone()
    }

    /// Sine output amplitude settable.
    pub fn amplitude(&self) -> Arc<dyn Settable> {
        self.amplitude.clone()
    }

    /// In-phase demodulator output.
    pub fn x(&self) -> Arc<dyn Readable> {
        self.x.clone()
    }

    /// Quadrature demodulator output.
    pub fn y(&self) -> Arc<dyn Readable> {
        self.y.clone()
    }

    /// Make this unit source the reference signal.
    pub async fn configure_reference(&self, frequency: f64, amplitude: f64) -> MesoResult<()> {
        self.transport.write("FMOD 1").await?;
        self.transport.write("HARM 1").await?;
        self.transport.write("PHAS 0").await?;
        self.frequency.set(frequency).await?;
        self.amplitude.set(amplitude).await?;
        Ok(())
    }

    /// Lock this unit to an externally supplied reference.
    pub async fn configure_external_reference(&self) -> MesoResult<()> {
        self.transport.write("FMOD 0").await?;
        self.transport.write("HARM 1").await?;
        self.transport.write("PHAS 0").await
    }
}

#[async_trait]
impl Instrument for LockinAmp {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> MesoResult<()> {
        self.transport.open().await
    }

    async fn disconnect(&self) -> MesoResult<()> {
        self.transport.close().await
    }

    fn settables(&self) -> Vec<Arc<dyn Settable>> {
        vec![
            self.frequency.clone(),
            self.amplitude.clone(),
            self.phase.clone(),
        ]
    }

    fn readables(&self) -> Vec<Arc<dyn Readable>> {
        vec![
            self.x.clone(),
            self.y.clone(),
            self.r.clone(),
            self.theta.clone(),
        ]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Configure every lock-in in the station for a shared reference.
///
/// The first lock-in (by name order) sources the reference at `frequency` Hz
/// and `amplitude` V; all the others switch to external reference. Returns
/// the number of lock-ins configured.
pub async fn setup_lockins(station: &Station, frequency: f64, amplitude: f64) -> MesoResult<usize> {
    let mut configured = 0usize;
    for name in station.instrument_names() {
        let instrument = station.instrument(&name)?;
        let Some(lockin) = instrument.as_any().downcast_ref::<LockinAmp>() else {
            continue;
        };
        if configured == 0 {
            lockin.configure_reference(frequency, amplitude).await?;
            info!(
                lockin = %name,
                frequency_hz = frequency,
                amplitude_v = amplitude,
                "lock-in sources the reference signal"
            );
        } else {
            lockin.configure_external_reference().await?;
            info!(lockin = %name, "lock-in set to external reference");
        }
        configured += 1;
    }
    Ok(configured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::transport::MockTransport;
    use crate::instrument::MockInstrument;

    #[tokio::test]
    async fn test_reference_configuration_commands() {
        let transport = Arc::new(MockTransport::new("lockin1"));
        let lockin = LockinAmp::new("lockin1", transport.clone());
        lockin.connect().await.unwrap();

        lockin.configure_reference(127.0, 0.004).await.unwrap();
        assert_eq!(
            transport.commands().await,
            vec!["FMOD 1", "HARM 1", "PHAS 0", "FREQ 127", "SLVL 0.004"]
        );
    }

    #[tokio::test]
    async fn test_amplitude_limits() {
        let transport = Arc::new(MockTransport::new("lockin1"));
        let lockin = LockinAmp::new("lockin1", transport);
        lockin.connect().await.unwrap();
        assert!(lockin.amplitude().set(6.0).await.is_err());
        assert!(lockin.amplitude().set(0.001).await.is_err());
        assert!(lockin.amplitude().set(1.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_setup_lockins_reference_then_external() {
        let t1 = Arc::new(MockTransport::new("lockin1"));
        let t2 = Arc::new(MockTransport::new("lockin2"));
        let mut station = Station::new();
        station
            .add_instrument(Arc::new(LockinAmp::new("lockin1", t1.clone())))
            .unwrap();
        station
            .add_instrument(Arc::new(LockinAmp::new("lockin2", t2.clone())))
            .unwrap();
        // Non-lock-ins are skipped.
        station
            .add_instrument(Arc::new(MockInstrument::new("mock1")))
            .unwrap();
        station.instrument("lockin1").unwrap().connect().await.unwrap();
        station.instrument("lockin2").unwrap().connect().await.unwrap();

        let configured = setup_lockins(&station, 127.0, 1.0).await.unwrap();
        assert_eq!(configured, 2);
        assert!(t1.commands().await.contains(&"FMOD 1".to_string()));
        assert!(t2.commands().await.contains(&"FMOD 0".to_string()));
    }
}
