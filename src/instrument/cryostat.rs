//! Cryostat controller driver (Oxford MercuryiTC-style command set).
//!
//! Exposes the sample temperature as a readable, the temperature setpoint
//! and the magnet field as settables. Controllers of this family append a
//! unit letter to replies (`1.5432K`, `0.25T`); the channel parser strips it.

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::core::{Readable, Settable};
use crate::error::{MesoError, MesoResult};
use crate::instrument::transport::ScpiTransport;
use crate::instrument::{Instrument, ScpiChannel};

/// Cryostat temperature and magnet controller.
pub struct Cryostat {
    name: String,
    transport: Arc<dyn ScpiTransport>,
    temperature: Arc<ScpiChannel>,
    setpoint: Arc<ScpiChannel>,
    field: Arc<ScpiChannel>,
}

impl Cryostat {
    /// Create a driver over the given transport.
    pub fn new(name: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Self {
        let name = name.into();
        Self {
            temperature: Arc::new(
                ScpiChannel::new(format!("{name}.temperature"), "K", transport.clone())
                    .get_cmd("READ:TEMP?"),
            ),
            setpoint: Arc::new(
                ScpiChannel::new(format!("{name}.setpoint"), "K", transport.clone())
                    .set_cmd("SET:TSET")
                    .get_cmd("READ:TSET?"),
            ),
            field: Arc::new(
                ScpiChannel::new(format!("{name}.field"), "T", transport.clone())
                    .set_cmd("SET:FIELD")
                    .get_cmd("READ:FIELD?")
                    // sweep rate limited by the magnet power supply
                    .with_max_rate(Some(0.01)),
            ),
            name,
            transport,
        }
    }

    /// Measured sample temperature, K.
    pub fn temperature(&self) -> Arc<dyn Readable> {
        self.temperature.clone()
    }

    /// Temperature setpoint settable, K.
    pub fn setpoint(&self) -> Arc<dyn Settable> {
        self.setpoint.clone()
    }

    /// Magnet field settable, T.
    pub fn field(&self) -> Arc<dyn Settable> {
        self.field.clone()
    }

    /// Set the temperature setpoint and poll until the measured temperature
    /// is within `tolerance` K of `target`, erroring if `timeout` elapses
    /// first.
    pub async fn wait_for_temperature(
        &self,
        target: f64,
        tolerance: f64,
        poll: Duration,
        timeout: Duration,
    ) -> MesoResult<()> {
        Settable::set(self.setpoint.as_ref(), target).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let temperature = Readable::read(self.temperature.as_ref()).await?;
            if (temperature - target).abs() <= tolerance {
                info!(target_k = target, measured_k = temperature, "temperature settled");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MesoError::Instrument(format!(
                    "{}: temperature {temperature} K did not settle to {target} K within {:?}",
                    self.name, timeout
                )));
            }
            debug!(target_k = target, measured_k = temperature, "waiting for temperature");
            tokio::time::sleep(poll).await;
        }
    }
}

#[async_trait]
impl Instrument for Cryostat {
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
        vec![self.setpoint.clone(), self.field.clone()]
    }

    fn readables(&self) -> Vec<Arc<dyn Readable>> {
        vec![self.temperature.clone(), self.setpoint.clone(), self.field.clone()]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::transport::MockTransport;

    #[tokio::test]
    async fn test_unit_suffix_is_stripped() {
        let transport = Arc::new(MockTransport::new("cryo1"));
        let cryo = Cryostat::new("cryo1", transport.clone());
        cryo.connect().await.unwrap();
        transport.set_reply("READ:TEMP?", "1.5432K").await;
        let t = cryo.temperature().read().await.unwrap();
        assert!((t - 1.5432).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_wait_for_temperature_settles() {
        let transport = Arc::new(MockTransport::new("cryo1"));
        let cryo = Cryostat::new("cryo1", transport.clone());
        cryo.connect().await.unwrap();
        transport.set_reply("READ:TEMP?", "4.001K").await;
        cryo.wait_for_temperature(4.0, 0.01, Duration::from_millis(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(transport
            .commands()
            .await
            .contains(&"SET:TSET 4".to_string()));
    }

    #[tokio::test]
    async fn test_wait_for_temperature_times_out() {
        let transport = Arc::new(MockTransport::new("cryo1"));
        let cryo = Cryostat::new("cryo1", transport.clone());
        cryo.connect().await.unwrap();
        // Stuck at base temperature, setpoint never reached.
        transport.set_reply("READ:TEMP?", "0.012K").await;
        let err = cryo
            .wait_for_temperature(4.0, 0.01, Duration::from_millis(1), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not settle"));
    }

    #[tokio::test]
    async fn test_field_rate_limit_advertised() {
        let transport = Arc::new(MockTransport::new("cryo1"));
        let cryo = Cryostat::new("cryo1", transport);
        assert_eq!(cryo.field().max_rate(), Some(0.01));
    }
}
