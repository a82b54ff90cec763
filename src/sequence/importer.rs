//! Forged sequence importer.
//!
//! Turns a [`ForgedSequence`] into either a `.seqx` archive or a waveform and
//! sequence list on a live [`Awg70000`]. All checks run up front: the tree
//! shape, the channel mapping, the amplitude list and, for the instrument,
//! sample ranges, DAC resolution and message sizes. Nothing is built or
//! written for a rejected input.
//!
//! Waveforms are named `wfm_{position}_{sub_position}_{physical_channel}`;
//! leaf elements use sub-position 1. Sub-sequences are named
//! `subsequence_{position}` and are only supported in archives.

use chrono::{DateTime, FixedOffset};
use indexmap::IndexMap;
use tracing::{debug, info};

use super::forged::{ChannelMapping, ElementData, ForgedSequence, ForgedStep};
use super::seqx::{assemble_with, Compression};
use super::sml::write_sml;
use super::{Asset, AssetKind, SequenceDescriptor, StepTable};
use crate::error::{AppResult, AwgError};
use crate::instrument::awg70000::{
    check_waveform_capacity, sequence_command_stack, Awg70000, TransferredWaveform, MAX_AMPLITUDE,
};
use crate::instrument::scpi::MAX_WRITE_LEN;
use crate::waveform::wfmx::build_container_at;
use crate::waveform::{pack, MarkerLayout, PackedWaveform, RangePolicy, WaveformRecord};
use crate::xml;

/// Highest DAC resolution; every marker bit in use costs one bit.
const MAX_RESOLUTION: u8 = 10;
/// Lowest DAC resolution.
const MIN_RESOLUTION: u8 = 8;

/// Where [`import_sequence`] sends its output.
pub enum ImportTarget<'a> {
    /// Build and return a `.seqx` archive.
    Archive,
    /// Transfer to the waveform and sequence lists of an instrument.
    Instrument {
        /// Connected driver.
        awg: &'a mut Awg70000,
        /// DAC resolution; chosen from the markers in use when `None`.
        resolution: Option<u8>,
        /// Assign the sequence to the outputs, enable them and start playing.
        output: bool,
    },
}

/// One waveform ready to be written to the waveform list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedWaveform {
    /// Waveform list name.
    pub name: String,
    /// Packed samples and markers (bits 6 and 7).
    pub packed: PackedWaveform,
    /// Marker bits needed on the DAC.
    pub markers_used: u8,
}

/// Fully validated instrument transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferPlan {
    /// Waveforms in position then channel order.
    pub waveforms: Vec<PlannedWaveform>,
    /// Sequence to create in the sequence list.
    pub descriptor: SequenceDescriptor,
    /// DAC resolution applied to every channel.
    pub resolution: u8,
    /// Amplitude per physical channel, channel 1 first.
    pub amplitudes: Vec<f64>,
}

struct ChannelWaveform {
    name: String,
    track: usize,
    record: WaveformRecord,
}

/// A forged sequence bound to a name, a channel mapping and amplitudes.
#[derive(Debug, Clone)]
pub struct SequenceImporter<'a> {
    sequence: &'a ForgedSequence,
    name: String,
    channels: Vec<String>,
    mapping: ChannelMapping,
    amplitudes: Vec<f64>,
}

impl<'a> SequenceImporter<'a> {
    /// Validates the inputs. Missing amplitudes default to 0.5 V per channel
    /// and a missing mapping assigns channels 1..=C in first-seen order.
    ///
    /// # Errors
    ///
    /// [`AwgError::InvalidForgedSequence`] for a malformed tree,
    /// [`AwgError::InvalidChannelMapping`] for a mapping that does not match
    /// the channels, [`AwgError::Validation`] for a bad name or amplitude list.
    pub fn new(
        sequence: &'a ForgedSequence,
        name: &str,
        mapping: Option<ChannelMapping>,
        amplitudes: Option<Vec<f64>>,
    ) -> AppResult<Self> {
        Self::with_default_amplitude(sequence, name, mapping, amplitudes, MAX_AMPLITUDE)
    }

    /// [`SequenceImporter::new`] with another default amplitude, such as
    /// [`crate::config::TransferSettings::default_amplitude`].
    ///
    /// # Errors
    ///
    /// As [`SequenceImporter::new`].
    pub fn with_default_amplitude(
        sequence: &'a ForgedSequence,
        name: &str,
        mapping: Option<ChannelMapping>,
        amplitudes: Option<Vec<f64>>,
        default_amplitude: f64,
    ) -> AppResult<Self> {
        sequence.validate()?;
        if name.trim().is_empty() {
            return Err(AwgError::Validation("sequence name must not be empty".into()));
        }

        let channels = sequence.channels();
        let amplitudes = amplitudes.unwrap_or_else(|| vec![default_amplitude; channels.len()]);
        if amplitudes.len() != channels.len() {
            return Err(AwgError::Validation(format!(
                "Incorrect number of amplitudes provided: got {}, the sequence has {} channels",
                amplitudes.len(),
                channels.len()
            )));
        }
        if let Some(bad) = amplitudes.iter().find(|a| !a.is_finite() || **a <= 0.0) {
            return Err(AwgError::Validation(format!(
                "amplitudes must be positive, got {bad}"
            )));
        }

        let mapping = mapping.unwrap_or_else(|| ChannelMapping::first_seen(&channels));
        mapping.validate(&channels)?;

        debug!(sequence = name, ?channels, ?amplitudes, "Importer ready");
        Ok(Self {
            sequence,
            name: name.to_string(),
            channels,
            mapping,
            amplitudes,
        })
    }

    /// Sequence name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical channels in first-seen order.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Number of channels `C`.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Resolved channel mapping.
    pub fn mapping(&self) -> &ChannelMapping {
        &self.mapping
    }

    /// Amplitude per physical channel.
    pub fn amplitudes(&self) -> &[f64] {
        &self.amplitudes
    }

    fn element_waveforms(
        &self,
        pos: u32,
        sub: u32,
        data: &ElementData,
    ) -> AppResult<Vec<ChannelWaveform>> {
        let mut waveforms = data
            .iter()
            .map(|(ch, channel)| {
                let track = self.mapping.get(ch).ok_or_else(|| {
                    AwgError::InvalidChannelMapping(format!("channel '{ch}' is not mapped"))
                })?;
                Ok(ChannelWaveform {
                    name: format!("wfm_{pos}_{sub}_{track}"),
                    track,
                    record: channel.to_record(self.amplitudes[track - 1]),
                })
            })
            .collect::<AppResult<Vec<_>>>()?;
        waveforms.sort_by_key(|w| w.track);
        Ok(waveforms)
    }

    /// Builds the `.seqx` archive, stamped with the current time.
    ///
    /// # Errors
    ///
    /// Container and descriptor errors, or [`AwgError::Validation`] if a
    /// descriptor references an asset that was not built.
    pub fn build_seqx(&self) -> AppResult<Vec<u8>> {
        self.build_seqx_at(&xml::local_now(), Compression::Stored)
    }

    /// [`SequenceImporter::build_seqx`] with an explicit timestamp and
    /// compression.
    ///
    /// # Errors
    ///
    /// As [`SequenceImporter::build_seqx`].
    pub fn build_seqx_at(
        &self,
        timestamp: &DateTime<FixedOffset>,
        compression: Compression,
    ) -> AppResult<Vec<u8>> {
        let tracks = self.channel_count();
        let layout = MarkerLayout::for_tracks(tracks);
        let mut waveforms: IndexMap<String, Vec<u8>> = IndexMap::new();
        let mut subsequences: IndexMap<String, Vec<u8>> = IndexMap::new();
        let mut descriptors = Vec::new();

        let mut main_table = StepTable::default();
        let mut main_assets = Vec::with_capacity(self.sequence.len());
        for (pos, position) in self.sequence.positions() {
            main_table.push(position.sequencing);
            match &position.step {
                ForgedStep::Leaf(data) => {
                    let mut assets = Vec::with_capacity(data.len());
                    for w in self.element_waveforms(pos, 1, data)? {
                        waveforms.insert(w.name.clone(), build_container_at(&w.record, layout, timestamp)?);
                        assets.push(Asset::waveform(w.name, w.track));
                    }
                    main_assets.push(assets);
                }
                ForgedStep::Subsequence(elements) => {
                    let sub_name = format!("subsequence_{pos}");
                    let mut sub_table = StepTable::default();
                    let mut sub_assets = Vec::with_capacity(elements.len());
                    for (&sub, element) in elements {
                        sub_table.push(element.sequencing);
                        let mut assets = Vec::with_capacity(element.data.len());
                        for w in self.element_waveforms(pos, sub, &element.data)? {
                            waveforms.insert(
                                w.name.clone(),
                                build_container_at(&w.record, layout, timestamp)?,
                            );
                            assets.push(Asset::waveform(w.name, w.track));
                        }
                        sub_assets.push(assets);
                    }
                    let descriptor =
                        SequenceDescriptor::from_table(&sub_name, tracks, &sub_table, sub_assets)?;
                    subsequences.insert(sub_name.clone(), write_sml(&descriptor, timestamp)?);
                    descriptors.push(descriptor);
                    main_assets.push(vec![Asset::sequence(sub_name)]);
                }
            }
        }

        let main = SequenceDescriptor::from_table(&self.name, tracks, &main_table, main_assets)?;
        descriptors.push(main);
        for descriptor in &descriptors {
            check_references(descriptor, &waveforms, &subsequences)?;
        }
        let main = descriptors.last().ok_or_else(|| {
            AwgError::Validation("no main sequence was built".into())
        })?;
        let main_sml = write_sml(main, timestamp)?;

        info!(
            sequence = %self.name,
            waveforms = waveforms.len(),
            subsequences = subsequences.len(),
            "Built seqx from forged sequence"
        );
        assemble_with(
            &main_sml,
            &self.name,
            &subsequences,
            &waveforms,
            &self.name,
            compression,
        )
    }

    /// Validates and packs everything an instrument transfer needs.
    ///
    /// # Errors
    ///
    /// [`AwgError::Validation`] for sub-sequences, amplitudes above 0.5 V or a
    /// resolution outside 8..=`10 - markers in use`;
    /// [`AwgError::OutOfRange`] for samples beyond the channel range;
    /// [`AwgError::Capacity`] for any oversized message.
    pub fn prepare_transfer(&self, resolution: Option<u8>) -> AppResult<TransferPlan> {
        if let Some((pos, _)) = self.sequence.positions().find(|(_, p)| p.is_subsequence()) {
            return Err(AwgError::Validation(format!(
                "position {pos} is a subsequence, subsequences are not supported by the instrument transfer"
            )));
        }
        if let Some(bad) = self.amplitudes.iter().find(|&&a| a > MAX_AMPLITUDE) {
            return Err(AwgError::Validation(format!(
                "amplitude {bad} V exceeds the maximum of {MAX_AMPLITUDE} V"
            )));
        }

        let mut waveforms = Vec::new();
        let mut table = StepTable::default();
        let mut assets = Vec::with_capacity(self.sequence.len());
        for (pos, position) in self.sequence.positions() {
            let ForgedStep::Leaf(data) = &position.step else {
                continue;
            };
            table.push(position.sequencing);
            let mut step_assets = Vec::with_capacity(data.len());
            for w in self.element_waveforms(pos, 1, data)? {
                let packed = pack(&w.record, MarkerLayout::Transfer, RangePolicy::Reject)?;
                check_waveform_capacity(&w.name, &packed)?;
                step_assets.push(Asset::waveform(w.name.as_str(), w.track));
                waveforms.push(PlannedWaveform {
                    markers_used: w.record.markers_used(),
                    name: w.name,
                    packed,
                });
            }
            assets.push(step_assets);
        }

        let descriptor =
            SequenceDescriptor::from_table(&self.name, self.channel_count(), &table, assets)?;
        let stack_len = sequence_command_stack(&descriptor)?.len();
        if stack_len > MAX_WRITE_LEN {
            return Err(AwgError::Capacity {
                size: stack_len,
                limit: MAX_WRITE_LEN,
            });
        }

        let markers = waveforms.iter().map(|w| w.markers_used).max().unwrap_or(0);
        let max_resolution = MAX_RESOLUTION - markers;
        let resolution = match resolution {
            None => max_resolution,
            Some(bits) if bits > max_resolution => {
                return Err(AwgError::Validation(format!(
                    "Specified resolution {bits} exceeds the maximum of {max_resolution} bits \
                     with {markers} marker(s) in use"
                )));
            }
            Some(bits) if bits < MIN_RESOLUTION => {
                return Err(AwgError::Validation(format!(
                    "resolution {bits} below the minimum of {MIN_RESOLUTION} bits"
                )));
            }
            Some(bits) => bits,
        };

        Ok(TransferPlan {
            waveforms,
            descriptor,
            resolution,
            amplitudes: self.amplitudes.clone(),
        })
    }

    /// Transfers the sequence to `awg`. With `output`, every physical channel
    /// gets the resolution, its track of the sequence and its amplitude, is
    /// enabled, and playback starts.
    ///
    /// Validation happens completely before the first write.
    ///
    /// # Errors
    ///
    /// Any [`SequenceImporter::prepare_transfer`] error, then transport and
    /// timeout errors.
    pub async fn load_into(
        &self,
        awg: &mut Awg70000,
        resolution: Option<u8>,
        output: bool,
    ) -> AppResult<Vec<TransferredWaveform>> {
        let plan = self.prepare_transfer(resolution)?;

        let mut transferred = Vec::with_capacity(plan.waveforms.len());
        for w in &plan.waveforms {
            transferred.push(
                awg.send_packed_waveform(&w.name, &w.packed, w.markers_used)
                    .await?,
            );
        }
        awg.send_sequence(&plan.descriptor).await?;

        if output {
            for (channel, &amplitude) in (1..).zip(&plan.amplitudes) {
                awg.set_output_resolution(plan.resolution, channel).await?;
                awg.sequence_set_to_channel(&self.name, channel, channel)
                    .await?;
                awg.set_amplitude(amplitude, channel).await?;
                awg.enable(channel).await?;
            }
            awg.play(false).await?;
            awg.wait_for_operation_to_complete().await?;
        }

        info!(
            sequence = %self.name,
            waveforms = transferred.len(),
            resolution = plan.resolution,
            output,
            "Sequence loaded into instrument"
        );
        Ok(transferred)
    }
}

fn check_references(
    descriptor: &SequenceDescriptor,
    waveforms: &IndexMap<String, Vec<u8>>,
    subsequences: &IndexMap<String, Vec<u8>>,
) -> AppResult<()> {
    for step in &descriptor.steps {
        for asset in &step.assets {
            let known = match asset.kind {
                AssetKind::Waveform { .. } => waveforms.contains_key(&asset.name),
                AssetKind::Sequence => subsequences.contains_key(&asset.name),
            };
            if !known {
                return Err(AwgError::Validation(format!(
                    "sequence '{}' step {} references missing {} '{}'",
                    descriptor.name,
                    step.number,
                    asset.sml_type(),
                    asset.name
                )));
            }
        }
    }
    Ok(())
}

/// Builds a `.seqx` archive from a forged sequence.
///
/// # Errors
///
/// See [`SequenceImporter::new`] and [`SequenceImporter::build_seqx`].
pub fn make_seqx_from_forged(
    sequence: &ForgedSequence,
    name: &str,
    mapping: Option<ChannelMapping>,
    amplitudes: Option<Vec<f64>>,
) -> AppResult<Vec<u8>> {
    SequenceImporter::new(sequence, name, mapping, amplitudes)?.build_seqx()
}

/// Imports a forged sequence into an archive or an instrument.
///
/// Returns the archive bytes for [`ImportTarget::Archive`] and `None` after
/// an instrument transfer.
///
/// # Errors
///
/// Validation errors before any output is produced; transport and timeout
/// errors during an instrument transfer.
pub async fn import_sequence(
    sequence: &ForgedSequence,
    name: &str,
    mapping: Option<ChannelMapping>,
    amplitudes: Option<Vec<f64>>,
    target: ImportTarget<'_>,
) -> AppResult<Option<Vec<u8>>> {
    let importer = SequenceImporter::new(sequence, name, mapping, amplitudes)?;
    match target {
        ImportTarget::Archive => importer.build_seqx().map(Some),
        ImportTarget::Instrument {
            awg,
            resolution,
            output,
        } => {
            importer.load_into(awg, resolution, output).await?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::sequence::forged::{ChannelData, ForgedPosition, SubElement};
    use crate::sequence::SequencingOptions;
    use std::collections::BTreeMap;
    use std::io::{Cursor, Read};

    const N: usize = 2400;

    fn element(channels: &[(&str, f64)]) -> ElementData {
        channels
            .iter()
            .map(|&(ch, v)| (ch.to_string(), ChannelData::new(vec![v; N])))
            .collect()
    }

    fn two_channel_sequence() -> ForgedSequence {
        ForgedSequence::new()
            .with_position(1, ForgedPosition::leaf(element(&[("a", 0.1), ("b", -0.1)])))
            .with_position(
                2,
                ForgedPosition::leaf(element(&[("a", 0.0), ("b", 0.05)])).with_sequencing(
                    SequencingOptions {
                        nrep: 0,
                        ..Default::default()
                    },
                ),
            )
    }

    fn members(bytes: Vec<u8>) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    fn member(bytes: &[u8], name: &str) -> String {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).unwrap();
        let mut file = archive.by_name(name).unwrap();
        let mut out = Vec::new();
        file.read_to_end(&mut out).unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn test_rejects_amplitude_count_and_gapped_mapping() {
        let seq = two_channel_sequence();
        let err = SequenceImporter::new(&seq, "s", None, Some(vec![0.5])).unwrap_err();
        assert!(err.to_string().contains("amplitudes"));

        let gapped: ChannelMapping = [("a", 1), ("b", 3)].into_iter().collect();
        let err = SequenceImporter::new(&seq, "s", Some(gapped), None).unwrap_err();
        assert!(matches!(err, AwgError::InvalidChannelMapping(_)));

        let wrong_keys: ChannelMapping = [("a", 1), ("c", 2)].into_iter().collect();
        assert!(SequenceImporter::new(&seq, "s", Some(wrong_keys), None).is_err());
    }

    #[test]
    fn test_defaults() {
        let seq = two_channel_sequence();
        let importer = SequenceImporter::new(&seq, "s", None, None).unwrap();
        assert_eq!(importer.amplitudes(), [0.5, 0.5]);
        assert_eq!(importer.mapping().get("a"), Some(1));
        assert_eq!(importer.mapping().get("b"), Some(2));
    }

    #[test]
    fn test_archive_layout() {
        let seq = two_channel_sequence();
        let bytes = make_seqx_from_forged(&seq, "main", None, None).unwrap();
        assert_eq!(
            members(bytes),
            [
                "Sequences/main.sml",
                "Waveforms/wfm_1_1_1.wfmx",
                "Waveforms/wfm_1_1_2.wfmx",
                "Waveforms/wfm_2_1_1.wfmx",
                "Waveforms/wfm_2_1_2.wfmx",
                "setup.xml",
                "userNotes.txt",
            ]
        );
    }

    #[test]
    fn test_mapping_orders_assets_by_track() {
        let seq = two_channel_sequence();
        let swapped: ChannelMapping = [("a", 2), ("b", 1)].into_iter().collect();
        let importer = SequenceImporter::new(&seq, "main", Some(swapped), None).unwrap();
        let bytes = importer.build_seqx().unwrap();
        let sml = member(&bytes, "Sequences/main.sml");
        let first = sml.find("wfm_1_1_1").unwrap();
        let second = sml.find("wfm_1_1_2").unwrap();
        assert!(first < second);

        // Channel "b" now plays on track 1.
        let wfmx = {
            let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
            let mut file = archive.by_name("Waveforms/wfm_1_1_1.wfmx").unwrap();
            let mut out = Vec::new();
            file.read_to_end(&mut out).unwrap();
            out
        };
        let parsed = crate::waveform::wfmx::parse_container(&wfmx).unwrap();
        assert!((parsed.samples[0] - (-0.4)).abs() < 1e-6);
    }

    #[test]
    fn test_subsequence_archive() {
        let mut elements = BTreeMap::new();
        for sub in 1..=2 {
            elements.insert(
                sub,
                SubElement {
                    data: element(&[("ch1", 0.0)]),
                    sequencing: SequencingOptions::default(),
                },
            );
        }
        let seq = ForgedSequence::new()
            .with_position(1, ForgedPosition::leaf(element(&[("ch1", 0.1)])))
            .with_position(2, ForgedPosition::subsequence(elements));
        let bytes = make_seqx_from_forged(&seq, "main", None, None).unwrap();
        let names = members(bytes.clone());
        assert_eq!(names[0], "Sequences/subsequence_2.sml");
        assert_eq!(names[1], "Sequences/main.sml");
        assert!(names.contains(&"Waveforms/wfm_2_2_1.wfmx".to_string()));

        let main = member(&bytes, "Sequences/main.sml");
        assert!(main.contains("<AssetName>subsequence_2</AssetName>"));
        assert!(main.contains("<AssetType>Sequence</AssetType>"));
    }

    #[test]
    fn test_transfer_plan_resolution() {
        let mut marked = element(&[("ch1", 0.0)]);
        let mut m2 = vec![false; N];
        m2[0] = true;
        marked["ch1"] = ChannelData::new(vec![0.0; N])
            .with_marker(1, vec![false; N])
            .with_marker(2, m2);
        let seq = ForgedSequence::new().with_position(1, ForgedPosition::leaf(marked));
        let importer = SequenceImporter::new(&seq, "s", None, None).unwrap();

        assert_eq!(importer.prepare_transfer(None).unwrap().resolution, 8);
        assert!(importer.prepare_transfer(Some(9)).is_err());

        let plain = ForgedSequence::new().with_position(1, ForgedPosition::leaf(element(&[("ch1", 0.0)])));
        let importer = SequenceImporter::new(&plain, "s", None, None).unwrap();
        assert_eq!(importer.prepare_transfer(None).unwrap().resolution, 10);
        assert_eq!(importer.prepare_transfer(Some(9)).unwrap().resolution, 9);
        assert!(importer.prepare_transfer(Some(7)).is_err());
    }

    #[tokio::test]
    async fn test_instrument_rejections_leave_instrument_untouched() {
        let mock = MockAdapter::new();
        let mut awg = Awg70000::new(Box::new(mock.clone()));

        let mut elements = BTreeMap::new();
        elements.insert(
            1,
            SubElement {
                data: element(&[("ch1", 0.0)]),
                sequencing: SequencingOptions::default(),
            },
        );
        let nested = ForgedSequence::new().with_position(1, ForgedPosition::subsequence(elements));
        let target = ImportTarget::Instrument {
            awg: &mut awg,
            resolution: None,
            output: true,
        };
        assert!(import_sequence(&nested, "s", None, None, target).await.is_err());

        // Second waveform leaves the range, so the first must not be sent either.
        let seq = ForgedSequence::new()
            .with_position(1, ForgedPosition::leaf(element(&[("ch1", 0.1)])))
            .with_position(2, ForgedPosition::leaf(element(&[("ch1", 0.3)])));
        let target = ImportTarget::Instrument {
            awg: &mut awg,
            resolution: None,
            output: false,
        };
        let err = import_sequence(&seq, "s", None, None, target).await.unwrap_err();
        assert!(matches!(err, AwgError::OutOfRange { .. }));
        assert!(mock.is_untouched());
    }

    #[tokio::test]
    async fn test_archive_target_returns_bytes() {
        let seq = two_channel_sequence();
        let bytes = import_sequence(&seq, "main", None, None, ImportTarget::Archive)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&bytes[..2], b"PK");
    }
}
