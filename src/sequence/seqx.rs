//! `.seqx` archive assembly.
//!
//! Member layout:
//!
//! ```text
//! Sequences/<subsequence>.sml   (zero or more)
//! Sequences/<main>.sml
//! Waveforms/<name>.wfmx         (one per waveform)
//! setup.xml
//! userNotes.txt                 (empty)
//! ```

use std::io::{Cursor, Write};
use std::path::Path;

use chrono::{DateTime, FixedOffset};
use indexmap::IndexMap;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::setup::build_setup;
use super::sml::build_descriptor_at;
use super::StepTable;
use crate::error::{AppResult, AwgError};
use crate::waveform::wfmx::build_container_at;
use crate::waveform::{MarkerLayout, WaveformRecord};
use crate::xml;

/// How archive members are compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// No compression.
    #[default]
    Stored,
    /// Deflate.
    Deflated,
}

impl From<Compression> for CompressionMethod {
    fn from(value: Compression) -> Self {
        match value {
            Compression::Stored => CompressionMethod::Stored,
            Compression::Deflated => CompressionMethod::Deflated,
        }
    }
}

/// Packs descriptors and containers into an uncompressed archive.
///
/// Names are used verbatim. Referenced assets are not cross-checked here.
///
/// # Errors
///
/// [`AwgError::Archive`] or [`AwgError::Io`] if the zip cannot be written,
/// [`AwgError::Validation`] for an empty setup name.
pub fn assemble(
    main: &[u8],
    main_name: &str,
    subsequences: &IndexMap<String, Vec<u8>>,
    waveforms: &IndexMap<String, Vec<u8>>,
    setup_name: &str,
) -> AppResult<Vec<u8>> {
    assemble_with(
        main,
        main_name,
        subsequences,
        waveforms,
        setup_name,
        Compression::Stored,
    )
}

/// [`assemble`] with a selectable compression method.
///
/// # Errors
///
/// As [`assemble`].
pub fn assemble_with(
    main: &[u8],
    main_name: &str,
    subsequences: &IndexMap<String, Vec<u8>>,
    waveforms: &IndexMap<String, Vec<u8>>,
    setup_name: &str,
    compression: Compression,
) -> AppResult<Vec<u8>> {
    let setup = build_setup(setup_name)?;
    let options = SimpleFileOptions::default().compression_method(compression.into());
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

    let mut add = |name: String, data: &[u8]| -> AppResult<()> {
        debug!(member = %name, len = data.len(), "Adding archive member");
        zip.start_file(name, options)?;
        zip.write_all(data)?;
        Ok(())
    };
    for (name, sml) in subsequences {
        add(format!("Sequences/{name}.sml"), sml)?;
    }
    add(format!("Sequences/{main_name}.sml"), main)?;
    for (name, wfmx) in waveforms {
        add(format!("Waveforms/{name}.wfmx"), wfmx)?;
    }
    add("setup.xml".to_string(), &setup)?;
    add("userNotes.txt".to_string(), &[])?;

    let bytes = zip.finish()?.into_inner();
    info!(
        sequence = main_name,
        subsequences = subsequences.len(),
        waveforms = waveforms.len(),
        size = bytes.len(),
        "Assembled seqx archive"
    );
    Ok(bytes)
}

/// Builds a single-sequence archive from per-channel waveform lists.
///
/// `wfms[ch][el]` is the record played by channel `ch + 1` at step `el + 1`;
/// each record carries its channel amplitude. Waveforms are named
/// `wfmch{ch}pos{el}` and spaces in `seq_name` become underscores.
///
/// # Errors
///
/// [`AwgError::Validation`] when no channels are given, channels hold
/// different numbers of positions, or the step table does not match; any
/// container or descriptor error.
pub fn make_seqx_file(
    table: &StepTable,
    wfms: &[Vec<WaveformRecord>],
    seq_name: &str,
) -> AppResult<Vec<u8>> {
    make_seqx_file_at(table, wfms, seq_name, &xml::local_now())
}

/// [`make_seqx_file`] with an explicit timestamp.
///
/// # Errors
///
/// As [`make_seqx_file`].
pub fn make_seqx_file_at(
    table: &StepTable,
    wfms: &[Vec<WaveformRecord>],
    seq_name: &str,
    timestamp: &DateTime<FixedOffset>,
) -> AppResult<Vec<u8>> {
    let seq_name = seq_name.replace(' ', "_");
    let chans = wfms.len();
    let elms = wfms.first().map_or(0, Vec::len);
    if chans == 0 || elms == 0 {
        return Err(AwgError::Validation(
            "at least one channel with one waveform is required".into(),
        ));
    }
    if let Some((ch, list)) = wfms.iter().enumerate().find(|(_, l)| l.len() != elms) {
        return Err(AwgError::Validation(format!(
            "channel {} has {} waveforms, channel 1 has {elms}",
            ch + 1,
            list.len()
        )));
    }

    let elem_names: Vec<Vec<String>> = (1..=elms)
        .map(|el| (1..=chans).map(|ch| format!("wfmch{ch}pos{el}")).collect())
        .collect();
    let sml = build_descriptor_at(table, &elem_names, &seq_name, chans, &[], timestamp)?;

    let layout = MarkerLayout::for_tracks(chans);
    let mut waveforms = IndexMap::with_capacity(chans * elms);
    for (ch, list) in wfms.iter().enumerate() {
        for (el, record) in list.iter().enumerate() {
            let name = format!("wfmch{}pos{}", ch + 1, el + 1);
            waveforms.insert(name, build_container_at(record, layout, timestamp)?);
        }
    }

    assemble(&sml, &seq_name, &IndexMap::new(), &waveforms, &seq_name)
}

/// Writes archive bytes to disk.
///
/// # Errors
///
/// [`AwgError::Io`] on file system failure.
pub fn write_archive(path: impl AsRef<Path>, bytes: &[u8]) -> AppResult<()> {
    let path = path.as_ref();
    std::fs::write(path, bytes)?;
    info!(path = %path.display(), size = bytes.len(), "Wrote seqx archive");
    Ok(())
}
