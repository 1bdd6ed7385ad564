//! Source-measurement unit driver (Keithley 24xx-style SCPI).
//!
//! Exposes a voltage source channel with a rate limit and soft voltage
//! limits, a current source channel with a compliance limit, and a measured
//! current readable. [`configure_smus`] applies the lab's standard setup to
//! every SMU in a station: voltage sourcing, current compliance, a short
//! integration time, and a safe ramp to zero if a unit is still sourcing
//! current from a previous session.

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tracing::info;

use crate::core::{Readable, Settable};
use crate::error::MesoResult;
use crate::instrument::transport::ScpiTransport;
use crate::instrument::{Instrument, ScpiChannel};
use crate::measurement::ramp;
use crate::station::Station;

/// Safety limits applied to an SMU's source channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmuLimits {
    /// Maximum sweeping rate of the source outputs, units/second.
    pub max_rate: Option<f64>,
    /// Soft limit for sourced voltage, V (symmetric around zero).
    pub voltage_limit: Option<f64>,
    /// Compliance limit for current, A.
    pub current_limit: Option<f64>,
}

/// A single-channel source-measurement unit.
pub struct Smu {
    name: String,
    transport: Arc<dyn ScpiTransport>,
    volt: Arc<ScpiChannel>,
    source_current: Arc<ScpiChannel>,
    current: Arc<ScpiChannel>,
    limits: SmuLimits,
}

impl Smu {
    /// Create a driver over the given transport.
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn ScpiTransport>,
        limits: SmuLimits,
    ) -> Self {
        let name = name.into();

        let mut volt = ScpiChannel::new(format!("{name}.volt"), "V", transport.clone())
            .set_cmd(":SOUR:VOLT")
            .get_cmd(":SOUR:VOLT?")
            .with_max_rate(limits.max_rate);
        if let Some(v) = limits.voltage_limit {
            volt = volt.with_limits(-v.abs(), v.abs());
        }

        let mut source_current = ScpiChannel::new(format!("{name}.curr"), "A", transport.clone())
            .set_cmd(":SOUR:CURR")
            .get_cmd(":SOUR:CURR?")
            .with_max_rate(limits.max_rate);
        if let Some(i) = limits.current_limit {
            source_current = source_current.with_limits(-i.abs(), i.abs());
        }

        let current = ScpiChannel::new(format!("{name}.current"), "A", transport.clone())
            .get_cmd(":MEAS:CURR?");

        Self {
            volt: Arc::new(volt),
            source_current: Arc::new(source_current),
            current: Arc::new(current),
            name,
            transport,
            limits,
        }
    }

    /// Voltage source settable.
    pub fn volt(&self) -> Arc<dyn Settable> {
        self.volt.clone()
    }

    /// Current source settable.
    pub fn source_current(&self) -> Arc<dyn Settable> {
        self.source_current.clone()
    }

    /// Measured current readable.
    pub fn current(&self) -> Arc<dyn Readable> {
        self.current.clone()
    }

    /// Apply the standard voltage-sourcing setup.
    ///
    /// A unit found sourcing a non-zero current is ramped to zero before the
    /// function switch, honoring the configured rate limit.
    pub async fn configure(&self) -> MesoResult<()> {
        let function = self.transport.query(":SOUR:FUNC?").await?;
        if function.trim() == "CURR" {
            let level = Settable::get(self.source_current.as_ref()).await?;
            if level != 0.0 {
                let chan: Arc<dyn Settable> = self.source_current.clone();
                ramp(&chan, 0.0).await?;
            }
        }
        self.transport.write(":SOUR:FUNC VOLT").await?;
        if let Some(limit) = self.limits.current_limit {
            self.transport
                .write(&format!(":SENS:CURR:PROT {limit}"))
                .await?;
        }
        self.transport.write(":SENS:CURR:NPLC 0.05").await
    }

    /// Ramp the voltage output to zero and switch the output relay off.
    pub async fn park(&self) -> MesoResult<()> {
        let chan: Arc<dyn Settable> = self.volt.clone();
        ramp(&chan, 0.0).await?;
        self.transport.write(":OUTP OFF").await
    }
}

#[async_trait]
impl Instrument for Smu {
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
        vec![self.volt.clone(), self.source_current.clone()]
    }

    fn readables(&self) -> Vec<Arc<dyn Readable>> {
        vec![self.current.clone(), self.volt.clone()]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Apply [`Smu::configure`] to every SMU in the station.
///
/// Returns the number of SMUs configured.
pub async fn configure_smus(station: &Station) -> MesoResult<usize> {
    let mut configured = 0usize;
    for name in station.instrument_names() {
        let instrument = station.instrument(&name)?;
        let Some(smu) = instrument.as_any().downcast_ref::<Smu>() else {
            continue;
        };
        smu.configure().await?;
        info!(smu = %name, "SMU configured for voltage sourcing");
        configured += 1;
    }
    Ok(configured)
}
