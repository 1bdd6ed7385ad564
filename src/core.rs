//! Core traits and data types for the measurement layer.
//!
//! The sweep engine only ever talks to two trait objects:
//!
//! - [`Settable`]: an instrument output that can be driven to a value
//!   (gate voltage, RF power, magnetic field setpoint, ...)
//! - [`Readable`]: an instrument reading sampled at each sweep point
//!   (lock-in X/Y, SMU current, mixing-chamber temperature, ...)
//!
//! Instrument drivers expose their channels through these traits; derived
//! parameters ([`LinearParameter`], [`SoftParameter`]) compose them without
//! touching hardware directly.
//!
//! All traits require `Send + Sync` so parameters can be shared across async
//! tasks during concurrent readout.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::error::MesoResult;

/// A single scalar record captured from an instrument.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// UTC timestamp when the value was captured.
    pub timestamp: DateTime<Utc>,
    /// Instrument identifier (e.g. "lockin1", "smu1").
    pub instrument_id: String,
    /// Channel identifier (e.g. "x", "volt", "temperature").
    pub channel: String,
    /// Measured value, normalized to f64.
    pub value: f64,
    /// Physical unit (SI notation recommended).
    pub unit: String,
}

/// An instrument output the sweep engine can drive.
#[async_trait]
pub trait Settable: Send + Sync {
    /// Qualified parameter name (e.g. "smu1.volt").
    fn name(&self) -> &str;

    /// Physical unit of the setpoint values.
    fn unit(&self) -> &str;

    /// Maximum sweeping rate in units/second, when the hardware (or the
    /// sample) imposes one. Ramps honor this; direct `set` calls do not.
    fn max_rate(&self) -> Option<f64> {
        None
    }

    /// Drive the output to `value`.
    async fn set(&self, value: f64) -> MesoResult<()>;

    /// Return the last programmed (or read-back) output value.
    async fn get(&self) -> MesoResult<f64>;
}

/// An instrument reading sampled at each sweep point.
#[async_trait]
pub trait Readable: Send + Sync {
    /// Qualified parameter name (e.g. "lockin1.x").
    fn name(&self) -> &str;

    /// Physical unit of the readings.
    fn unit(&self) -> &str;

    /// Sample the instrument once.
    async fn read(&self) -> MesoResult<f64>;
}

/// A purely in-memory parameter with no hardware behind it.
///
/// Used for station-level bookkeeping values such as the current-to-voltage
/// conversion range of a transimpedance amplifier, and as a stand-in
/// parameter in tests.
pub struct SoftParameter {
    name: String,
    unit: String,
    value: RwLock<f64>,
}

impl SoftParameter {
    /// Create a soft parameter with an initial value.
    pub fn new(name: impl Into<String>, unit: impl Into<String>, initial: f64) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            value: RwLock::new(initial),
        }
    }
}

#[async_trait]
impl Settable for SoftParameter {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    async fn set(&self, value: f64) -> MesoResult<()> {
        *self.value.write().await = value;
        Ok(())
    }

    async fn get(&self) -> MesoResult<f64> {
        Ok(*self.value.read().await)
    }
}

#[async_trait]
impl Readable for SoftParameter {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    async fn read(&self) -> MesoResult<f64> {
        Ok(*self.value.read().await)
    }
}

/// Slaves a dependent settable to a primary one via `y = m * x + p`.
///
/// Sweeping the linear parameter sweeps the primary axis while dragging the
/// dependent output along, e.g. keeping a displacement field constant while
/// sweeping carrier density with two gates.
pub struct LinearParameter {
    name: String,
    primary: Arc<dyn Settable>,
    dependent: Arc<dyn Settable>,
    m: f64,
    p: f64,
}

impl LinearParameter {
    /// Tie `dependent = m * primary + p`.
    pub fn new(
        name: impl Into<String>,
        primary: Arc<dyn Settable>,
        dependent: Arc<dyn Settable>,
        m: f64,
        p: f64,
    ) -> Self {
        Self {
            name: name.into(),
            primary,
            dependent,
            m,
            p,
        }
    }
}

#[async_trait]
impl Settable for LinearParameter {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> &str {
        self.primary.unit()
    }

    fn max_rate(&self) -> Option<f64> {
        // The slower of the two axes limits the pair. The dependent axis
        // moves |m| times faster than the primary for the same sweep.
        let primary = self.primary.max_rate();
        let dependent = self
            .dependent
            .max_rate()
            .map(|r| if self.m.abs() > 0.0 { r / self.m.abs() } else { r });
        match (primary, dependent) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    async fn set(&self, value: f64) -> MesoResult<()> {
        self.primary.set(value).await?;
        self.dependent.set(self.m * value + self.p).await
    }

    async fn get(&self) -> MesoResult<f64> {
        self.primary.get().await
    }
}

/// Elapsed wall-clock time since construction, in seconds.
///
/// Serves as the independent variable of time sweeps.
pub struct ElapsedTime {
    name: String,
    start: Instant,
}

impl ElapsedTime {
    /// Start the clock now.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: Instant::now(),
        }
    }

    /// Seconds since the clock started.
    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

#[async_trait]
impl Readable for ElapsedTime {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> &str {
        "s"
    }

    async fn read(&self) -> MesoResult<f64> {
        Ok(self.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_soft_parameter_set_get() {
        let p = SoftParameter::new("current_range", "A/V", 1e-8);
        assert_eq!(p.get().await.unwrap(), 1e-8);
        p.set(1e-6).await.unwrap();
        assert_eq!(p.get().await.unwrap(), 1e-6);
        assert_eq!(p.read().await.unwrap(), 1e-6);
        assert_eq!(Settable::unit(&p), "A/V");
    }

    #[tokio::test]
    async fn test_linear_parameter_drags_dependent() {
        let vtg: Arc<dyn Settable> = Arc::new(SoftParameter::new("vtg", "V", 0.0));
        let vbg: Arc<dyn Settable> = Arc::new(SoftParameter::new("vbg", "V", 0.0));
        let pair = LinearParameter::new("density_axis", vtg.clone(), vbg.clone(), -0.5, 1.0);

        pair.set(2.0).await.unwrap();
        assert_eq!(vtg.get().await.unwrap(), 2.0);
        assert_eq!(vbg.get().await.unwrap(), 0.0); // -0.5 * 2 + 1
        assert_eq!(pair.get().await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn test_linear_parameter_max_rate_takes_slower_axis() {
        struct Limited(SoftParameter, f64);

        #[async_trait]
        impl Settable for Limited {
            fn name(&self) -> &str {
                Settable::name(&self.0)
            }
            fn unit(&self) -> &str {
                Settable::unit(&self.0)
            }
            fn max_rate(&self) -> Option<f64> {
                Some(self.1)
            }
            async fn set(&self, value: f64) -> MesoResult<()> {
                self.0.set(value).await
            }
            async fn get(&self) -> MesoResult<f64> {
                self.0.get().await
            }
        }

        let fast: Arc<dyn Settable> = Arc::new(Limited(SoftParameter::new("a", "V", 0.0), 1.0));
        let slow: Arc<dyn Settable> = Arc::new(Limited(SoftParameter::new("b", "V", 0.0), 0.1));
        // Dependent moves 2x per unit of primary, so its 0.1 V/s limit
        // constrains the primary to 0.05 units/s.
        let pair = LinearParameter::new("pair", fast, slow, 2.0, 0.0);
        let rate = pair.max_rate().unwrap();
        assert!((rate - 0.05).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_elapsed_time_monotonic() {
        let t = ElapsedTime::new("time");
        let a = t.read().await.unwrap();
        let b = t.read().await.unwrap();
        assert!(b >= a);
    }
}
