//! Custom error types for the crate.
//!
//! This module defines the primary error type, `AwgError`. Using the `thiserror`
//! crate, it gives every layer (sample packing, container building, archive
//! assembly, sequence import and the instrument driver) one consistent error
//! surface so that failures propagate unmodified with the `?` operator.
//!
//! ## Error Hierarchy
//!
//! - **Validation errors** (`Validation`, `SampleCount`, `InvalidForgedSequence`,
//!   `InvalidChannelMapping`): raised before any serialization or I/O.
//! - **Range errors** (`OutOfRange`): only the direct-transfer path raises this;
//!   the container path clips and logs instead.
//! - **Capacity errors** (`Capacity`): a single transport write would exceed the
//!   IEEE 488.2 block limit. Raised before anything is written.
//! - **Instrument/transport errors** (`Timeout`, `Transport`, `Instrument`): the
//!   transport adapters report through `anyhow`, which is wrapped here.
//! - **Format errors** (`Xml`, `Archive`, `Json`, `Io`, `Config`).

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, AwgError>;

/// Every error the crate can produce.
#[derive(Error, Debug)]
pub enum AwgError {
    /// Configuration file or environment could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but holds an invalid value.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Malformed input rejected before any output was produced.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Waveform shorter than the container format allows.
    #[error("Waveform has {found} samples, the format requires at least {minimum}")]
    SampleCount {
        /// Number of samples supplied.
        found: usize,
        /// Format floor.
        minimum: usize,
    },

    /// Scaled waveform leaves the [-1, 1] range on the direct-transfer path.
    #[error("Waveform exceeds specified channel range: scaled min {min}, scaled max {max}")]
    OutOfRange {
        /// Smallest scaled sample.
        min: f64,
        /// Largest scaled sample.
        max: f64,
    },

    /// Forged sequence tree does not have the expected shape.
    #[error("Invalid forged sequence: {0}")]
    InvalidForgedSequence(String),

    /// Channel mapping does not match the channels of the sequence.
    #[error("Invalid channel_mapping: {0}")]
    InvalidChannelMapping(String),

    /// A single write would exceed the transport limit.
    #[error("Message of {size} bytes exceeds the single-write limit of {limit} bytes")]
    Capacity {
        /// Size of the rejected message.
        size: usize,
        /// Maximum size accepted by the transport.
        limit: usize,
    },

    /// A poll loop ran past its deadline.
    #[error("Timed out after {timeout:?} while waiting for {operation}")]
    Timeout {
        /// What was being waited for.
        operation: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// Failure reported by the transport adapter.
    #[error("Transport error: {0:#}")]
    Transport(#[from] anyhow::Error),

    /// The instrument returned something unexpected.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// XML could not be written or read.
    #[error("XML error: {0}")]
    Xml(String),

    /// Zip archive could not be written or read.
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Forged sequence JSON could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AwgError {
    /// Wraps any displayable XML failure.
    pub(crate) fn xml(err: impl std::fmt::Display) -> Self {
        AwgError::Xml(err.to_string())
    }

    /// True for the errors raised before any serialization or I/O.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AwgError::Validation(_)
                | AwgError::SampleCount { .. }
                | AwgError::OutOfRange { .. }
                | AwgError::InvalidForgedSequence(_)
                | AwgError::InvalidChannelMapping(_)
        )
    }
}
