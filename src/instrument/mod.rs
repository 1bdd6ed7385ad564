//! Instrument layer: drivers, the transport seam, and channel plumbing.
//!
//! Every driver is built from the same two pieces:
//!
//! - a [`transport::ScpiTransport`] doing raw command I/O (VISA for real
//!   hardware, an in-memory mock for tests and dry runs), and
//! - a set of [`ScpiChannel`]s mapping named parameters onto command pairs.
//!
//! Drivers expose their channels through the [`Instrument`] trait so the
//! station and the sweep engine never see concrete driver types.

pub mod cryostat;
pub mod lockin;
pub mod mock;
pub mod rf;
pub mod smu;
pub mod transport;
#[cfg(feature = "instrument_visa")]
pub mod visa;

pub use cryostat::Cryostat;
pub use lockin::{setup_lockins, LockinAmp};
pub use mock::MockInstrument;
pub use rf::RfSource;
pub use smu::{configure_smus, Smu, SmuLimits};

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

use crate::core::{Readable, Settable};
use crate::error::{MesoError, MesoResult};
use transport::ScpiTransport;

/// Common interface of all station instruments.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Station-unique instrument name.
    fn name(&self) -> &str;

    /// Open the underlying transport and bring the instrument to a usable
    /// state. Idempotent.
    async fn connect(&self) -> MesoResult<()>;

    /// Close the underlying transport.
    async fn disconnect(&self) -> MesoResult<()>;

    /// Settable channels of this instrument.
    fn settables(&self) -> Vec<Arc<dyn Settable>>;

    /// Readable channels of this instrument.
    fn readables(&self) -> Vec<Arc<dyn Readable>>;

    /// Downcast support, used by type-scanning setup helpers.
    fn as_any(&self) -> &dyn Any;
}

/// A named instrument parameter bound to a pair of commands.
///
/// A channel with a `set` command is [`Settable`]; one with a `get` command
/// is [`Readable`] (and readback for `Settable::get`). Values are formatted
/// as `"<command> <value>"` on write and parsed from the trimmed response on
/// read, tolerating a trailing unit suffix like `"1.234K"`.
pub struct ScpiChannel {
    name: String,
    unit: String,
    transport: Arc<dyn ScpiTransport>,
    set_cmd: Option<String>,
    get_cmd: Option<String>,
    max_rate: Option<f64>,
    limits: Option<(f64, f64)>,
}

impl ScpiChannel {
    /// Create a channel with no commands attached.
    pub fn new(
        name: impl Into<String>,
        unit: impl Into<String>,
        transport: Arc<dyn ScpiTransport>,
    ) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            transport,
            set_cmd: None,
            get_cmd: None,
            max_rate: None,
            limits: None,
        }
    }

    /// Command used to program the value, without the value itself.
    pub fn set_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.set_cmd = Some(cmd.into());
        self
    }

    /// Query command used to read the value back.
    pub fn get_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.get_cmd = Some(cmd.into());
        self
    }

    /// Maximum sweeping rate in units/second.
    pub fn with_max_rate(mut self, rate: Option<f64>) -> Self {
        self.max_rate = rate;
        self
    }

    /// Soft limits checked before every write.
    pub fn with_limits(mut self, min: f64, max: f64) -> Self {
        self.limits = Some((min, max));
        self
    }

    fn parse(&self, response: &str) -> MesoResult<f64> {
        let trimmed = response.trim();
        if let Ok(v) = trimmed.parse::<f64>() {
            return Ok(v);
        }
        // Some controllers append a unit ("1.234K"); strip trailing letters.
        let numeric = trimmed.trim_end_matches(|c: char| c.is_alphabetic());
        numeric
            .parse::<f64>()
            .map_err(|_| MesoError::BadResponse {
                channel: self.name.clone(),
                response: response.to_string(),
            })
    }
}

#[async_trait]
impl Settable for ScpiChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    fn max_rate(&self) -> Option<f64> {
        self.max_rate
    }

    async fn set(&self, value: f64) -> MesoResult<()> {
        let cmd = self.set_cmd.as_ref().ok_or_else(|| {
            MesoError::Instrument(format!("channel '{}' is not settable", self.name))
        })?;
        if let Some((min, max)) = self.limits {
            if value < min || value > max {
                return Err(MesoError::Instrument(format!(
                    "value {} out of limits [{}, {}] for '{}'",
                    value, min, max, self.name
                )));
            }
        }
        self.transport.write(&format!("{cmd} {value}")).await
    }

    async fn get(&self) -> MesoResult<f64> {
        let cmd = self.get_cmd.as_ref().ok_or_else(|| {
            MesoError::Instrument(format!("channel '{}' has no readback", self.name))
        })?;
        let response = self.transport.query(cmd).await?;
        self.parse(&response)
    }
}

#[async_trait]
impl Readable for ScpiChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    async fn read(&self) -> MesoResult<f64> {
        Settable::get(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::transport::MockTransport;
    use super::*;

    #[tokio::test]
    async fn test_channel_set_then_readback() {
        let transport = Arc::new(MockTransport::new("lockin1"));
        transport.open().await.unwrap();
        let freq = ScpiChannel::new("lockin1.frequency", "Hz", transport.clone())
            .set_cmd("FREQ")
            .get_cmd("FREQ?");

        freq.set(127.0).await.unwrap();
        assert_eq!(Settable::get(&freq).await.unwrap(), 127.0);
        assert_eq!(transport.commands().await, vec!["FREQ 127", "FREQ?"]);
    }

    #[tokio::test]
    async fn test_channel_limits_enforced() {
        let transport = Arc::new(MockTransport::new("rf1"));
        transport.open().await.unwrap();
        let power = ScpiChannel::new("rf1.power", "dBm", transport.clone())
            .set_cmd(":POW")
            .get_cmd(":POW?")
            .with_limits(-30.0, 25.0);

        assert!(power.set(30.0).await.is_err());
        assert!(power.set(10.0).await.is_ok());
        // The rejected write never reached the transport.
        assert_eq!(transport.commands().await, vec![":POW 10"]);
    }

    #[tokio::test]
    async fn test_unit_suffix_tolerated() {
        let transport = Arc::new(MockTransport::new("triton"));
        transport.open().await.unwrap();
        transport.set_reply("READ:TEMP?", "0.0213K").await;
        let temp = ScpiChannel::new("triton.temperature", "K", transport)
            .get_cmd("READ:TEMP?");
        assert_eq!(temp.read().await.unwrap(), 0.0213);
    }

    #[tokio::test]
    async fn test_garbage_response_is_error() {
        let transport = Arc::new(MockTransport::new("lockin1"));
        transport.open().await.unwrap();
        transport.set_reply("OUTP? 1", "OVLD").await;
        let x = ScpiChannel::new("lockin1.x", "V", transport).get_cmd("OUTP? 1");
        assert!(matches!(
            x.read().await,
            Err(MesoError::BadResponse { .. })
        ));
    }
}
