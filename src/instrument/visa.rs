//! VISA transport implementation.
//!
//! Provides [`ScpiTransport`] over the VISA (Virtual Instrument Software
//! Architecture) standard using the `visa-rs` crate, covering GPIB, USB and
//! TCPIP resources:
//!
//! - `GPIB0::8::INSTR`
//! - `USB0::0x1234::0x5678::SERIAL::INSTR`
//! - `TCPIP0::192.168.1.20::INSTR`
//! - `TCPIP0::192.168.1.30::33576::SOCKET` (cryostat controllers)
//!
//! VISA I/O is synchronous, so every operation runs on a blocking thread via
//! `tokio::task::spawn_blocking` to keep the runtime responsive during slow
//! instrument turnarounds.

use async_trait::async_trait;
use std::ffi::CString;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use visa_rs::prelude::*;

use crate::error::{MesoError, MesoResult};
use crate::instrument::transport::ScpiTransport;

struct VisaSession {
    // The resource manager must stay alive as long as the session.
    _rm: DefaultRM,
    instrument: visa_rs::Instrument,
}

/// [`ScpiTransport`] backed by a VISA session.
pub struct VisaTransport {
    name: String,
    resource_string: String,
    timeout: Duration,
    terminator: String,
    open: AtomicBool,
    session: Arc<Mutex<Option<VisaSession>>>,
}

impl VisaTransport {
    /// Create a closed transport for the given VISA resource string.
    pub fn new(name: impl Into<String>, resource_string: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_string: resource_string.into(),
            timeout: Duration::from_secs(5),
            terminator: "\n".to_string(),
            open: AtomicBool::new(false),
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Set the read/write timeout, applied to the session on [`open`].
    ///
    /// [`open`]: ScpiTransport::open
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the command line terminator (SCPI instruments usually want `\n`).
    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }
}

#[async_trait]
impl ScpiTransport for VisaTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> MesoResult<()> {
        if self.is_open() {
            return Ok(());
        }
        let resource = self.resource_string.clone();
        let timeout = self.timeout;
        let session = tokio::task::spawn_blocking(move || -> MesoResult<VisaSession> {
            let rm = DefaultRM::new()
                .map_err(|e| MesoError::Instrument(format!("VISA resource manager: {e}")))?;
            let c_string = CString::new(resource.clone())
                .map_err(|e| MesoError::Instrument(format!("bad resource string: {e}")))?;
            let visa_string = visa_rs::VisaString::from(c_string);
            let instrument = rm
                .open(&visa_string, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                .map_err(|e| {
                    MesoError::Instrument(format!("failed to open VISA resource {resource}: {e}"))
                })?;
            let timeout_ms = timeout.as_millis() as u32;
            let tmo = AttrTmoValue::new_checked(timeout_ms).ok_or_else(|| {
                MesoError::Instrument(format!("VISA timeout out of range: {timeout_ms} ms"))
            })?;
            instrument.set_attr(tmo).map_err(|e| {
                MesoError::Instrument(format!("failed to set VISA timeout ({resource}): {e}"))
            })?;
            Ok(VisaSession {
                _rm: rm,
                instrument,
            })
        })
        .await
        .map_err(|e| MesoError::Instrument(format!("VISA open task panicked: {e}")))??;

        *self.session.lock().await = Some(session);
        self.open.store(true, Ordering::SeqCst);
        debug!(resource = %self.resource_string, "VISA resource opened");
        Ok(())
    }

    async fn close(&self) -> MesoResult<()> {
        self.session.lock().await.take();
        self.open.store(false, Ordering::SeqCst);
        debug!(resource = %self.resource_string, "VISA resource closed");
        Ok(())
    }

    async fn write(&self, command: &str) -> MesoResult<()> {
        let session = self.session.clone();
        let name = self.name.clone();
        let resource = self.resource_string.clone();
        let payload = format!("{}{}", command, self.terminator);
        let command_for_log = command.to_string();

        tokio::task::spawn_blocking(move || -> MesoResult<()> {
            let mut guard = session.blocking_lock();
            let session = guard
                .as_mut()
                .ok_or(MesoError::TransportNotOpen(name))?;
            session.instrument.write_all(payload.as_bytes()).map_err(|e| {
                MesoError::Instrument(format!("VISA write failed ({resource}): {e}"))
            })?;
            debug!(command = %command_for_log, "VISA write");
            Ok(())
        })
        .await
        .map_err(|e| MesoError::Instrument(format!("VISA write task panicked: {e}")))?
    }

    async fn query(&self, command: &str) -> MesoResult<String> {
        let session = self.session.clone();
        let name = self.name.clone();
        let resource = self.resource_string.clone();
        let payload = format!("{}{}", command, self.terminator);
        let command_for_log = command.to_string();

        tokio::task::spawn_blocking(move || -> MesoResult<String> {
            let mut guard = session.blocking_lock();
            let session = guard
                .as_mut()
                .ok_or(MesoError::TransportNotOpen(name))?;
            session.instrument.write_all(payload.as_bytes()).map_err(|e| {
                MesoError::Instrument(format!("VISA query write failed ({resource}): {e}"))
            })?;

            let mut buf = [0u8; 1024];
            let bytes_read = session.instrument.read(&mut buf).map_err(|e| {
                MesoError::Instrument(format!("VISA read failed ({resource}): {e}"))
            })?;
            let response = String::from_utf8_lossy(&buf[..bytes_read]).into_owned();
            debug!(command = %command_for_log, response = %response.trim(), "VISA query");
            Ok(response)
        })
        .await
        .map_err(|e| MesoError::Instrument(format!("VISA query task panicked: {e}")))?
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn info(&self) -> String {
        format!(
            "VisaTransport({} @ {}ms timeout)",
            self.resource_string,
            self.timeout.as_millis()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_settings() {
        let t = VisaTransport::new("smu1", "TCPIP0::192.168.1.20::INSTR")
            .with_timeout(Duration::from_millis(2000))
            .with_terminator("\r\n");
        assert_eq!(t.timeout, Duration::from_millis(2000));
        assert_eq!(t.terminator, "\r\n");
        assert!(!t.is_open());
        assert!(t.info().contains("TCPIP0::192.168.1.20::INSTR"));
    }
}
