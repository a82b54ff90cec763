//! `setup.xml`, the archive member naming the sequence to load.

use crate::error::{AppResult, AwgError};
use crate::xml::{XmlDocument, AWG70002B};

/// Builds the setup descriptor for `main_sequence`.
///
/// # Errors
///
/// [`AwgError::Validation`] for an empty name.
pub fn build_setup(main_sequence: &str) -> AppResult<Vec<u8>> {
    if main_sequence.trim().is_empty() {
        return Err(AwgError::Validation(
            "main sequence name must not be empty".into(),
        ));
    }
    let mut doc = XmlDocument::new();
    doc.open("RSAPersist", &[("version", "0.1")])?;
    doc.text("Application", &[], "Pascal")?;
    doc.text("MainSequence", &[], main_sequence)?;
    doc.open("ProductSpecific", &[("name", AWG70002B.name)])?;
    doc.text("SerialNumber", &[], AWG70002B.serial_number)?;
    doc.text("SoftwareVersion", &[], AWG70002B.software_version)?;
    doc.empty("CreatorProperties", &[("name", "")])?;
    doc.close("ProductSpecific")?;
    doc.close("RSAPersist")?;
    Ok(doc.into_bytes())
}
