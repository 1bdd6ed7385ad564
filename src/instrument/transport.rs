//! Transport seam between drivers and the wire.
//!
//! Drivers speak [`ScpiTransport`]; what is on the other end is decided by
//! the resource string: `mock://...` yields the in-memory [`MockTransport`],
//! anything else a VISA session (requires the `instrument_visa` feature).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{MesoError, MesoResult};

/// Raw command I/O with a SCPI-style instrument.
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Name of the owning instrument, used in error messages.
    fn name(&self) -> &str;

    /// Open the connection. Idempotent.
    async fn open(&self) -> MesoResult<()>;

    /// Close the connection.
    async fn close(&self) -> MesoResult<()>;

    /// Send a command that expects no response.
    async fn write(&self, command: &str) -> MesoResult<()>;

    /// Send a query and return the (untrimmed) response.
    async fn query(&self, command: &str) -> MesoResult<String>;

    /// Whether the connection is currently open.
    fn is_open(&self) -> bool;

    /// Human-readable transport description for logs.
    fn info(&self) -> String;
}

/// Select a transport implementation from a resource string.
pub fn from_resource(
    name: &str,
    resource: &str,
    timeout: Duration,
) -> MesoResult<Arc<dyn ScpiTransport>> {
    if resource.starts_with("mock://") {
        let _ = timeout;
        return Ok(Arc::new(MockTransport::new(name)));
    }

    #[cfg(feature = "instrument_visa")]
    {
        Ok(Arc::new(
            super::visa::VisaTransport::new(name, resource).with_timeout(timeout),
        ))
    }

    #[cfg(not(feature = "instrument_visa"))]
    {
        Err(MesoError::FeatureNotEnabled("instrument_visa".to_string()))
    }
}

/// In-memory transport for tests and hardware-free dry runs.
///
/// Every command is appended to a log. Writes of the form `"CMD value"`
/// remember the value, and a query `"CMD?"` with no scripted reply returns
/// the remembered value for `"CMD"`, so set-then-readback works without any
/// scripting. Scripted replies (via [`MockTransport::set_reply`]) take
/// precedence.
pub struct MockTransport {
    name: String,
    open: AtomicBool,
    log: Mutex<Vec<String>>,
    replies: Mutex<HashMap<String, String>>,
    written: Mutex<HashMap<String, String>>,
}

impl MockTransport {
    /// Create a closed mock transport.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            open: AtomicBool::new(false),
            log: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            written: Mutex::new(HashMap::new()),
        }
    }

    /// Script the reply for a specific query command.
    pub async fn set_reply(&self, command: &str, reply: &str) {
        self.replies
            .lock()
            .await
            .insert(command.to_string(), reply.to_string());
    }

    /// All commands seen so far, in order.
    pub async fn commands(&self) -> Vec<String> {
        self.log.lock().await.clone()
    }

    /// Forget the command log (scripted replies are kept).
    pub async fn clear_log(&self) {
        self.log.lock().await.clear();
    }

    fn ensure_open(&self) -> MesoResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(MesoError::TransportNotOpen(self.name.clone()))
        }
    }
}

#[async_trait]
impl ScpiTransport for MockTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> MesoResult<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> MesoResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, command: &str) -> MesoResult<()> {
        self.ensure_open()?;
        self.log.lock().await.push(command.to_string());
        if let Some((cmd, value)) = command.rsplit_once(' ') {
            self.written
                .lock()
                .await
                .insert(cmd.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn query(&self, command: &str) -> MesoResult<String> {
        self.ensure_open()?;
        self.log.lock().await.push(command.to_string());
        if let Some(reply) = self.replies.lock().await.get(command) {
            return Ok(reply.clone());
        }
        let base = command.trim_end_matches('?');
        if let Some(value) = self.written.lock().await.get(base) {
            return Ok(value.clone());
        }
        Ok("0".to_string())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn info(&self) -> String {
        format!("MockTransport({})", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_requires_open() {
        let t = MockTransport::new("mf1");
        assert!(matches!(
            t.write("FREQ 127").await,
            Err(MesoError::TransportNotOpen(_))
        ));
        t.open().await.unwrap();
        t.write("FREQ 127").await.unwrap();
        assert!(t.is_open());
    }

    #[tokio::test]
    async fn test_query_returns_written_value() {
        let t = MockTransport::new("mf1");
        t.open().await.unwrap();
        t.write("SLVL 0.004").await.unwrap();
        assert_eq!(t.query("SLVL?").await.unwrap(), "0.004");
        // Unknown queries default to zero.
        assert_eq!(t.query("OUTP? 3").await.unwrap(), "0");
    }

    #[tokio::test]
    async fn test_scripted_reply_wins() {
        let t = MockTransport::new("mf1");
        t.open().await.unwrap();
        t.write("FREQ 127").await.unwrap();
        t.set_reply("FREQ?", "126.9998").await;
        assert_eq!(t.query("FREQ?").await.unwrap(), "126.9998");
    }

    #[test]
    fn test_mock_resource_selector() {
        let t = from_resource("mf1", "mock://mfli", Duration::from_secs(1)).unwrap();
        assert_eq!(t.name(), "mf1");
        assert!(t.info().contains("Mock"));
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[test]
    fn test_visa_resource_needs_feature() {
        let err =
            from_resource("smu1", "GPIB0::24::INSTR", Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, MesoError::FeatureNotEnabled(_)));
    }
}
