//! VISA adapter for GPIB/USB/Ethernet instruments
//!
//! Wraps the `visa-rs` crate (feature `instrument_visa`). VISA calls are
//! blocking, so every operation runs on Tokio's blocking pool and is bounded
//! by the configured timeout.
//!
//! Resource strings look like:
//! - "GPIB0::1::INSTR"
//! - "USB0::0x0699::0x0503::B010294::INSTR"
//! - "TCPIP0::192.168.1.100::inst0::INSTR"

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use anyhow::Context;
#[cfg(feature = "instrument_visa")]
use std::sync::{Arc, Mutex};
#[cfg(feature = "instrument_visa")]
use tracing::debug;

use super::Adapter;
use crate::config::InstrumentSettings;

/// VISA connection to one instrument.
pub struct VisaAdapter {
    /// VISA resource string
    pub(crate) resource_string: String,

    /// Read/write timeout
    pub(crate) timeout: Duration,

    /// Line terminator appended to commands
    pub(crate) line_terminator: String,

    /// The open session, shared with blocking I/O tasks
    #[cfg(feature = "instrument_visa")]
    instrument: Option<Arc<Mutex<visa_rs::Instrument>>>,
}

impl VisaAdapter {
    /// Creates an unconnected adapter with a 7.5 s timeout and `\n` terminator.
    pub fn new(resource_string: String) -> Self {
        Self {
            resource_string,
            timeout: Duration::from_millis(7500),
            line_terminator: "\n".to_string(),
            #[cfg(feature = "instrument_visa")]
            instrument: None,
        }
    }

    /// Creates an unconnected adapter from configuration.
    pub fn from_settings(settings: &InstrumentSettings) -> Self {
        Self::new(settings.resource.clone())
            .with_timeout(Duration::from_millis(settings.timeout_ms))
            .with_line_terminator(settings.line_terminator.clone())
    }

    /// Set read/write timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator for commands
    #[must_use]
    pub fn with_line_terminator(mut self, terminator: String) -> Self {
        self.line_terminator = terminator;
        self
    }

    /// True once [`connect`](Self::connect) succeeded.
    pub fn is_connected(&self) -> bool {
        #[cfg(feature = "instrument_visa")]
        {
            self.instrument.is_some()
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            false
        }
    }

    /// Opens the VISA resource.
    #[cfg(feature = "instrument_visa")]
    pub async fn connect(&mut self) -> Result<()> {
        use std::ffi::CString;
        use visa_rs::{flags::AccessMode, DefaultRM, TIMEOUT_IMMEDIATE};

        let resource = self.resource_string.clone();
        let instrument = self
            .blocking("VISA open", move || {
                let rm = DefaultRM::new()
                    .map_err(|e| anyhow!("{e:?}"))
                    .context("Failed to create VISA resource manager")?;
                let name = CString::new(resource.clone())
                    .with_context(|| format!("Invalid VISA resource string: {resource}"))?;
                rm.open(&name.into(), AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                    .map_err(|e| anyhow!("{e:?}"))
                    .with_context(|| format!("Failed to open VISA resource: {resource}"))
            })
            .await?;
        self.instrument = Some(Arc::new(Mutex::new(instrument)));
        debug!(
            resource = %self.resource_string,
            timeout_ms = self.timeout.as_millis() as u64,
            "VISA resource opened"
        );
        Ok(())
    }

    /// Opens the VISA resource.
    #[cfg(not(feature = "instrument_visa"))]
    pub async fn connect(&mut self) -> Result<()> {
        Err(not_enabled())
    }

    /// Closes the session.
    pub async fn disconnect(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            if self.instrument.take().is_some() {
                debug!(resource = %self.resource_string, "VISA resource closed");
            }
        }
        Ok(())
    }

    #[cfg(feature = "instrument_visa")]
    fn session(&self) -> Result<Arc<Mutex<visa_rs::Instrument>>> {
        self.instrument
            .clone()
            .ok_or_else(|| anyhow!("VISA instrument not connected"))
    }

    /// Runs blocking VISA I/O off the async runtime, bounded by the timeout.
    #[cfg(feature = "instrument_visa")]
    async fn blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let task = tokio::task::spawn_blocking(f);
        tokio::time::timeout(self.timeout, task)
            .await
            .map_err(|_| anyhow!("{operation} timed out after {:?}", self.timeout))?
            .with_context(|| format!("{operation} task panicked"))?
    }

    #[cfg(feature = "instrument_visa")]
    async fn send(&self, bytes: Vec<u8>, label: String) -> Result<usize> {
        use std::io::Write;

        let session = self.session()?;
        self.blocking("VISA write", move || {
            let guard = session
                .lock()
                .map_err(|_| anyhow!("VISA session lock poisoned"))?;
            (&*guard)
                .write_all(&bytes)
                .with_context(|| format!("VISA write failed for: {label}"))?;
            Ok(bytes.len())
        })
        .await
    }
}

fn not_enabled() -> anyhow::Error {
    anyhow!("VISA support not enabled. Rebuild with --features instrument_visa")
}

#[async_trait]
impl Adapter for VisaAdapter {
    async fn write(&mut self, command: &str) -> Result<usize> {
        #[cfg(feature = "instrument_visa")]
        {
            let line = format!("{command}{}", self.line_terminator);
            let written = self.send(line.into_bytes(), command.to_string()).await?;
            debug!(command, "VISA command sent");
            Ok(written)
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = command;
            Err(not_enabled())
        }
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<usize> {
        #[cfg(feature = "instrument_visa")]
        {
            let head = String::from_utf8_lossy(&bytes[..bytes.len().min(48)]).into_owned();
            let written = self.send(bytes.to_vec(), head.clone()).await?;
            debug!(len = written, head = %head, "VISA raw block sent");
            Ok(written)
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = bytes;
            Err(not_enabled())
        }
    }

    async fn read(&mut self) -> Result<String> {
        #[cfg(feature = "instrument_visa")]
        {
            use std::io::{BufRead, BufReader};

            let session = self.session()?;
            let response = self
                .blocking("VISA read", move || {
                    let guard = session
                        .lock()
                        .map_err(|_| anyhow!("VISA session lock poisoned"))?;
                    let mut reader = BufReader::new(&*guard);
                    let mut line = String::new();
                    reader
                        .read_line(&mut line)
                        .context("VISA read failed")?;
                    Ok(line.trim_end().to_string())
                })
                .await?;
            debug!(response = %response, "VISA response");
            Ok(response)
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(not_enabled())
        }
    }

    fn info(&self) -> String {
        format!(
            "VisaAdapter({} @ {}ms timeout)",
            self.resource_string,
            self.timeout.as_millis()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visa_adapter_creation() {
        let adapter = VisaAdapter::new("GPIB0::1::INSTR".to_string());
        assert!(!adapter.is_connected());
        assert_eq!(adapter.resource_string, "GPIB0::1::INSTR");
        assert_eq!(adapter.timeout, Duration::from_millis(7500));
        assert_eq!(adapter.line_terminator, "\n");
    }

    #[test]
    fn test_visa_adapter_from_settings() {
        let settings = InstrumentSettings {
            resource: "TCPIP0::192.168.1.100::inst0::INSTR".to_string(),
            timeout_ms: 3000,
            line_terminator: "\r\n".to_string(),
        };
        let adapter = VisaAdapter::from_settings(&settings);
        assert_eq!(adapter.timeout, Duration::from_millis(3000));
        assert_eq!(adapter.line_terminator, "\r\n");
        let info = adapter.info();
        assert!(info.contains("TCPIP0::192.168.1.100::inst0::INSTR"));
        assert!(info.contains("3000ms"));
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_without_feature_reports_not_enabled() {
        let mut adapter = VisaAdapter::new("GPIB0::1::INSTR".to_string());
        let err = adapter.write("*IDN?").await.unwrap_err();
        assert!(err.to_string().contains("instrument_visa"));
        assert!(adapter.connect().await.is_err());
    }
}
