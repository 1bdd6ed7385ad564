//! A mock instrument that synthesizes plausible transport data.
//!
//! The mock exposes two settables (`gate`, `bias`) and readables (`x`, `y`,
//! `r`, `current`) computed deterministically from the current settable
//! state: a Lorentzian conductance peak in gate voltage, scaled by the bias
//! excitation, with a small reproducible ripple standing in for noise.
//! Deterministic output keeps sweep tests exact.

use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::{Readable, Settable};
use crate::error::MesoResult;
use crate::instrument::Instrument;

type State = Arc<RwLock<HashMap<String, f64>>>;

/// Synthetic instrument for tests and hardware-free demos.
pub struct MockInstrument {
    name: String,
    connected: AtomicBool,
    state: State,
}

impl MockInstrument {
    /// Create a mock with `gate = 0 V`, `bias = 1 mV`.
    pub fn new(name: impl Into<String>) -> Self {
        let mut initial = HashMap::new();
        initial.insert("gate".to_string(), 0.0);
        initial.insert("bias".to_string(), 1e-3);
        Self {
            name: name.into(),
            connected: AtomicBool::new(false),
            state: Arc::new(RwLock::new(initial)),
        }
    }

    fn channel(&self, key: &str, unit: &str, max_rate: Option<f64>) -> Arc<MockChannel> {
        Arc::new(MockChannel {
            name: format!("{}.{}", self.name, key),
            unit: unit.to_string(),
            key: key.to_string(),
            max_rate,
            state: self.state.clone(),
        })
    }

    fn signal(&self, key: &str, unit: &str, kind: SignalKind) -> Arc<MockSignal> {
        Arc::new(MockSignal {
            name: format!("{}.{}", self.name, key),
            unit: unit.to_string(),
            kind,
            state: self.state.clone(),
        })
    }

    /// The gate-voltage settable.
    pub fn gate(&self) -> Arc<dyn Settable> {
        self.channel("gate", "V", Some(0.5))
    }

    /// The bias-excitation settable.
    pub fn bias(&self) -> Arc<dyn Settable> {
        self.channel("bias", "V", None)
    }

    /// The lock-in X readable.
    pub fn x(&self) -> Arc<dyn Readable> {
        self.signal("x", "V", SignalKind::X)
    }
}

struct MockChannel {
    name: String,
    unit: String,
    key: String,
    max_rate: Option<f64>,
    state: State,
}

#[async_trait]
impl Settable for MockChannel {
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
        self.state.write().await.insert(self.key.clone(), value);
        Ok(())
    }

    async fn get(&self) -> MesoResult<f64> {
        Ok(self.state.read().await.get(&self.key).copied().unwrap_or(0.0))
    }
}

#[derive(Clone, Copy)]
enum SignalKind {
    X,
    Y,
    R,
    Current,
}

struct MockSignal {
    name: String,
    unit: String,
    kind: SignalKind,
    state: State,
}

impl MockSignal {
    fn evaluate(kind: SignalKind, gate: f64, bias: f64) -> f64 {
        // Lorentzian conductance peak centered at 0.2 V gate, 0.35 V wide,
        // with a deterministic ripple standing in for noise.
        let peak = 1.0 / (1.0 + ((gate - 0.2) / 0.35).powi(2));
        let ripple = 1e-6 * (137.0 * gate).sin();
        let x = bias * peak + ripple;
        let y = 0.05 * x;
        match kind {
            SignalKind::X => x,
            SignalKind::Y => y,
            SignalKind::R => x.hypot(y),
            SignalKind::Current => x * 1e-8,
        }
    }
}

#[async_trait]
impl Readable for MockSignal {
    fn name(&self) -> &str {
        &self.name
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    async fn read(&self) -> MesoResult<f64> {
        let state = self.state.read().await;
        let gate = state.get("gate").copied().unwrap_or(0.0);
        let bias = state.get("bias").copied().unwrap_or(0.0);
        Ok(Self::evaluate(self.kind, gate, bias))
    }
}

#[async_trait]
impl Instrument for MockInstrument {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> MesoResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> MesoResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn settables(&self) -> Vec<Arc<dyn Settable>> {
        vec![self.gate(), self.bias()]
    }

    fn readables(&self) -> Vec<Arc<dyn Readable>> {
        vec![
            self.signal("x", "V", SignalKind::X),
            self.signal("y", "V", SignalKind::Y),
            self.signal("r", "V", SignalKind::R),
            self.signal("current", "A", SignalKind::Current),
        ]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_readables_follow_settables() {
        let mock = MockInstrument::new("mock1");
        let gate = mock.gate();
        let x = mock.x();

        gate.set(0.2).await.unwrap(); // on the conductance peak
        let on_peak = x.read().await.unwrap();
        gate.set(3.0).await.unwrap(); // far off the peak
        let off_peak = x.read().await.unwrap();
        assert!(on_peak > off_peak);
    }

    #[tokio::test]
    async fn test_readback_is_deterministic() {
        let mock = MockInstrument::new("mock1");
        mock.gate().set(0.37).await.unwrap();
        let a = mock.x().read().await.unwrap();
        let b = mock.x().read().await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_r_combines_x_and_y() {
        let mock = MockInstrument::new("mock1");
        let readables = mock.readables();
        let x = readables[0].read().await.unwrap();
        let y = readables[1].read().await.unwrap();
        let r = readables[2].read().await.unwrap();
        assert!((r - x.hypot(y)).abs() < 1e-15);
    }
}
