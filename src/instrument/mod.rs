//! Instrument drivers
//!
//! [`Instrument`] couples a name with an [`Adapter`] and provides the IEEE
//! 488.2 common commands. Model drivers such as [`Awg70000`] build on it.

pub mod awg70000;
pub mod scpi;

use anyhow::Context;
use tracing::debug;

use crate::adapters::Adapter;
use crate::error::AppResult;

pub use awg70000::{
    sequence_command_stack, Awg70000, AwgMode, DriverTimeouts, JumpDestination, RunState,
    TransferredWaveform, TriggerChannel,
};

/// A named connection to one instrument.
pub struct Instrument {
    name: String,
    adapter: Box<dyn Adapter>,
}

impl Instrument {
    /// Wraps an adapter.
    pub fn new(name: impl Into<String>, adapter: Box<dyn Adapter>) -> Self {
        Self {
            name: name.into(),
            adapter,
        }
    }

    /// Instrument name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Description of the underlying adapter.
    pub fn adapter_info(&self) -> String {
        self.adapter.info()
    }

    /// Sends a command.
    ///
    /// # Errors
    ///
    /// [`crate::AwgError::Transport`] if the adapter fails.
    pub async fn write(&mut self, command: &str) -> AppResult<usize> {
        debug!(instrument = %self.name, command, "write");
        let written = self
            .adapter
            .write(command)
            .await
            .with_context(|| format!("{}: write '{command}' failed", self.name))?;
        Ok(written)
    }

    /// Sends raw bytes.
    ///
    /// # Errors
    ///
    /// [`crate::AwgError::Transport`] if the adapter fails.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> AppResult<usize> {
        debug!(instrument = %self.name, len = bytes.len(), "write_raw");
        let written = self
            .adapter
            .write_raw(bytes)
            .await
            .with_context(|| format!("{}: raw write of {} bytes failed", self.name, bytes.len()))?;
        Ok(written)
    }

    /// Reads one response.
    ///
    /// # Errors
    ///
    /// [`crate::AwgError::Transport`] if the adapter fails.
    pub async fn read(&mut self) -> AppResult<String> {
        let response = self
            .adapter
            .read()
            .await
            .with_context(|| format!("{}: read failed", self.name))?;
        Ok(response)
    }

    /// Sends a query and returns the trimmed response.
    ///
    /// # Errors
    ///
    /// [`crate::AwgError::Transport`] if the adapter fails.
    pub async fn ask(&mut self, command: &str) -> AppResult<String> {
        let response = self
            .adapter
            .ask(command)
            .await
            .with_context(|| format!("{}: query '{command}' failed", self.name))?;
        let response = response.trim().to_string();
        debug!(instrument = %self.name, command, response = %response, "ask");
        Ok(response)
    }

    /// `*IDN?`
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub async fn id(&mut self) -> AppResult<String> {
        self.ask("*IDN?").await
    }

    /// `*CLS`
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub async fn clear(&mut self) -> AppResult<()> {
        self.write("*CLS").await.map(drop)
    }

    /// `*RST`
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub async fn reset(&mut self) -> AppResult<()> {
        self.write("*RST").await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::error::AwgError;

    #[tokio::test]
    async fn test_common_commands() {
        let mock = MockAdapter::new();
        let mut inst = Instrument::new("awg", Box::new(mock.clone()));
        assert!(inst.id().await.unwrap().starts_with("TEKTRONIX"));
        inst.clear().await.unwrap();
        inst.reset().await.unwrap();
        assert_eq!(mock.commands(), ["*IDN?", "*CLS", "*RST"]);
        assert_eq!(inst.adapter_info(), "MockAdapter");
    }

    #[tokio::test]
    async fn test_transport_error_carries_context() {
        let mock = MockAdapter::new();
        let mut inst = Instrument::new("awg", Box::new(mock.clone()));
        mock.fail_next("link down");
        let err = inst.write("AWGControl:RUN").await.unwrap_err();
        assert!(matches!(err, AwgError::Transport(_)));
        let text = err.to_string();
        assert!(text.contains("AWGControl:RUN"));
        assert!(text.contains("link down"));
    }
}
