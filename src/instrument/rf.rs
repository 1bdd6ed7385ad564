//! RF signal generator driver.
//!
//! Generic SCPI generator (`:POW`, `:FREQ`, `:OUTP`). Output power is
//! clamped to the range the downstream amplifier chain tolerates; the
//! conversion from excitation voltage at the sample to generator power lives
//! in [`crate::measurement::rf_array`].

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

use crate::core::{Readable, Settable};
use crate::error::MesoResult;
use crate::instrument::transport::ScpiTransport;
use crate::instrument::{Instrument, ScpiChannel};

/// Hard output limits in dBm.
pub const MIN_POWER_DBM: f64 = -30.0;
pub const MAX_POWER_DBM: f64 = 25.0;

/// SCPI RF signal generator.
pub struct RfSource {
    name: String,
    transport: Arc<dyn ScpiTransport>,
    power: Arc<ScpiChannel>,
    frequency: Arc<ScpiChannel>,
}

impl RfSource {
    /// Create a driver over the given transport.
    pub fn new(name: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Self {
        let name = name.into();
        Self {
            power: Arc::new(
                ScpiChannel::new(format!("{name}.power"), "dBm", transport.clone())
                    .set_cmd(":POW")
                    .get_cmd(":POW?")
                    .with_limits(MIN_POWER_DBM, MAX_POWER_DBM),
            ),
            frequency: Arc::new(
                ScpiChannel::new(format!("{name}.frequency"), "Hz", transport.clone())
                    .set_cmd(":FREQ")
                    .get_cmd(":FREQ?"),
            ),
            name,
            transport,
        }
    }

    /// Output power settable, dBm.
    pub fn power(&self) -> Arc<dyn Settable> {
        self.power.clone()
    }

    /// Carrier frequency settable, Hz.
    pub fn frequency(&self) -> Arc<dyn Settable> {
        self.frequency.clone()
    }

    /// Switch the RF output on.
    pub async fn enable_output(&self) -> MesoResult<()> {
        self.transport.write(":OUTP ON").await
    }

    /// Switch the RF output off.
    pub async fn disable_output(&self) -> MesoResult<()> {
        self.transport.write(":OUTP OFF").await
    }
}

#[async_trait]
impl Instrument for RfSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> MesoResult<()> {
        self.transport.open().await
    }

    async fn disconnect(&self) -> MesoResult<()> {
        // Leave the sample unexcited when tearing the station down.
        if self.transport.is_open() {
            self.disable_output().await?;
        }
        self.transport.close().await
    }

    fn settables(&self) -> Vec<Arc<dyn Settable>> {
        vec![self.power.clone(), self.frequency.clone()]
    }

    fn readables(&self) -> Vec<Arc<dyn Readable>> {
        vec![self.power.clone(), self.frequency.clone()]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
