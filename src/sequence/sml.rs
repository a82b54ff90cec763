//! `.sml` sequence descriptors.

use chrono::{DateTime, FixedOffset};
use tracing::debug;

use super::{Asset, SequenceDescriptor, StepTable};
use crate::error::AppResult;
use crate::xml::{self, XmlDocument};

const SML_VERSION: &str = "0.1";
const SML_SCHEMA: &str = "awgSeqDataSets.xsd";
const FLAG_NAMES: [&str; 4] = ["A", "B", "C", "D"];

/// Builds a descriptor from parallel option arrays and per-step asset names.
///
/// Steps whose 1-indexed position appears in `subseq_positions` reference
/// sub-sequences; every other asset is a waveform, placed on the track given
/// by its position in the step's name list.
///
/// # Errors
///
/// [`crate::AwgError::Validation`] for mismatched array lengths, an
/// `elem_names` length different from the step count, or invalid codes. The
/// check happens before any XML is written.
pub fn build_descriptor(
    table: &StepTable,
    elem_names: &[Vec<String>],
    seq_name: &str,
    channel_count: usize,
    subseq_positions: &[usize],
) -> AppResult<Vec<u8>> {
    build_descriptor_at(
        table,
        elem_names,
        seq_name,
        channel_count,
        subseq_positions,
        &xml::local_now(),
    )
}

/// [`build_descriptor`] with an explicit timestamp.
///
/// # Errors
///
/// As [`build_descriptor`].
pub fn build_descriptor_at(
    table: &StepTable,
    elem_names: &[Vec<String>],
    seq_name: &str,
    channel_count: usize,
    subseq_positions: &[usize],
    timestamp: &DateTime<FixedOffset>,
) -> AppResult<Vec<u8>> {
    let assets = elem_names
        .iter()
        .enumerate()
        .map(|(i, names)| {
            let subsequence = subseq_positions.contains(&(i + 1));
            names
                .iter()
                .enumerate()
                .map(|(track, name)| {
                    if subsequence {
                        Asset::sequence(name.as_str())
                    } else {
                        Asset::waveform(name.as_str(), track + 1)
                    }
                })
                .collect()
        })
        .collect();
    let descriptor = SequenceDescriptor::from_table(seq_name, channel_count, table, assets)?;
    write_sml(&descriptor, timestamp)
}

/// Serializes a resolved descriptor.
///
/// # Errors
///
/// [`crate::AwgError::Xml`] if serialization fails.
pub fn write_sml(
    descriptor: &SequenceDescriptor,
    timestamp: &DateTime<FixedOffset>,
) -> AppResult<Vec<u8>> {
    let mut doc = XmlDocument::new();
    doc.open_data_file(SML_VERSION)?;
    doc.open_data_sets(SML_SCHEMA)?;

    doc.open("DataDescription", &[])?;
    doc.text("SequenceName", &[], &descriptor.name)?;
    doc.text("Timestamp", &[], &xml::format_timestamp(timestamp))?;
    doc.text("JumpTiming", &[], "JumpImmed")?;
    doc.text("RecSampleRate", &[], "NaN")?;
    doc.text("RepeatFlag", &[], "false")?;
    doc.empty("PatternJumpTable", &[("Enabled", "false"), ("Count", "256")])?;

    let step_count = descriptor.steps.len().to_string();
    let track_count = descriptor.track_count.to_string();
    doc.open(
        "Steps",
        &[("StepCount", step_count.as_str()), ("TrackCount", track_count.as_str())],
    )?;
    for step in &descriptor.steps {
        doc.open("Step", &[])?;
        doc.text("StepNumber", &[], &step.number.to_string())?;
        doc.text("Repeat", &[], step.repeat.sml_kind())?;
        doc.text("RepeatCount", &[], &step.repeat.sml_count().to_string())?;
        doc.text("WaitInput", &[], step.wait.sml_name())?;
        doc.text("EventJumpInput", &[], step.event_jump.input.sml_name())?;
        doc.text("EventJumpTo", &[], step.event_jump.target.sml_kind())?;
        doc.text(
            "EventJumpToStep",
            &[],
            &step.event_jump.target.sml_step().to_string(),
        )?;
        doc.text("GoTo", &[], step.go_to.sml_kind())?;
        doc.text("GoToStep", &[], &step.go_to.sml_step().to_string())?;

        doc.open("Assets", &[])?;
        for asset in &step.assets {
            doc.open("Asset", &[])?;
            doc.text("AssetName", &[], &asset.name)?;
            doc.text("AssetType", &[], asset.sml_type())?;
            doc.close("Asset")?;
        }
        doc.close("Assets")?;

        doc.open("Flags", &[])?;
        for _ in 0..descriptor.track_count {
            doc.open("FlagSet", &[])?;
            for flag in FLAG_NAMES {
                doc.text("Flag", &[("name", flag)], "NoChange")?;
            }
            doc.close("FlagSet")?;
        }
        doc.close("Flags")?;
        doc.close("Step")?;
    }
    doc.close("Steps")?;
    doc.close("DataDescription")?;

    doc.empty("ProductSpecific", &[("name", "")])?;
    doc.close("DataSets")?;
    doc.close("DataSetsCollection")?;
    doc.empty("Setup", &[])?;
    doc.close("DataFile")?;

    let mut bytes = doc.into_bytes();
    xml::patch_offset(&mut bytes)?;
    debug!(
        sequence = %descriptor.name,
        steps = descriptor.steps.len(),
        tracks = descriptor.track_count,
        len = bytes.len(),
        "Built sml descriptor"
    );
    Ok(bytes)
}
