//! Transport adapters
//!
//! An [`Adapter`] moves SCPI text and raw binary blocks to and from an
//! instrument. The driver layer in [`crate::instrument`] depends only on this
//! trait, so the same code runs against real hardware ([`VisaAdapter`]) and
//! against the scripted [`MockAdapter`] used in tests.

pub mod mock_adapter;
pub mod visa_adapter;

use anyhow::Result;
use async_trait::async_trait;

pub use mock_adapter::{MockAdapter, MockCall};
pub use visa_adapter::VisaAdapter;

/// Write/read/ask contract of an instrument connection.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Sends one command, appending the line terminator. Returns bytes written.
    async fn write(&mut self, command: &str) -> Result<usize>;

    /// Sends raw bytes unchanged (binary block transfers). Returns bytes written.
    async fn write_raw(&mut self, bytes: &[u8]) -> Result<usize>;

    /// Reads one response line without its terminator.
    async fn read(&mut self) -> Result<String>;

    /// Writes a query and reads its response.
    async fn ask(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;
        self.read().await
    }

    /// Human-readable description of the connection.
    fn info(&self) -> String;
}
