//! Tektronix AWG70000 waveform and sequence tooling.
//!
//! The library builds the instrument's native file formats and drives the
//! instrument over SCPI:
//!
//! - [`waveform`]: sample packing and `.wfmx` waveform containers.
//! - [`sequence`]: `.sml` sequence descriptors, the `.seqx` archive and the
//!   forged-sequence importer.
//! - [`instrument`] and [`adapters`]: the AWG70000 driver over a VISA or
//!   scripted transport.
//!
//! Builders are synchronous and pure; the instrument path is async (tokio).
//!
//! ```no_run
//! use awg_seqx::{make_seqx_from_forged, ForgedSequence};
//!
//! # fn main() -> awg_seqx::AppResult<()> {
//! let json = std::fs::read_to_string("sequence.json")?;
//! let forged = ForgedSequence::from_json(&json)?;
//! let seqx = make_seqx_from_forged(&forged, "my_sequence", None, None)?;
//! awg_seqx::sequence::seqx::write_archive("my_sequence.seqx", &seqx)?;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod sequence;
pub mod waveform;
pub mod xml;

pub use adapters::{Adapter, MockAdapter, VisaAdapter};
pub use config::AwgSettings;
pub use error::{AppResult, AwgError};
pub use instrument::{Awg70000, Instrument, TransferredWaveform};
pub use sequence::{
    import_sequence, make_seqx_from_forged, ChannelMapping, ForgedSequence, ImportTarget,
    SequenceDescriptor, SequenceImporter, StepTable,
};
pub use waveform::{MarkerLayout, WaveformRecord};
