//! Forged sequences: the tree handed to the importer.
//!
//! A forged sequence maps 1-indexed positions to either a leaf element (one
//! waveform per logical channel) or a sub-sequence of such elements, each with
//! its own sequencing options. Untyped input (JSON in the broadbean forged
//! layout) is checked and defaulted once in [`ForgedSequence::from_json`];
//! everything downstream works on the typed tree.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use serde::Deserialize;

use super::{SequencingOptions, MAX_REPEAT_COUNT};
use crate::error::{AppResult, AwgError};
use crate::waveform::{WaveformRecord, MAX_MARKERS};

/// One logical channel's samples and markers at one element.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChannelData {
    /// Samples in volts.
    pub wfm: Vec<f64>,
    /// Marker planes keyed by index (1..=4).
    pub markers: BTreeMap<u8, Vec<bool>>,
}

impl ChannelData {
    /// Marker-free channel data.
    pub fn new(wfm: Vec<f64>) -> Self {
        Self {
            wfm,
            markers: BTreeMap::new(),
        }
    }

    /// Adds a marker plane.
    #[must_use]
    pub fn with_marker(mut self, index: u8, values: Vec<bool>) -> Self {
        self.markers.insert(index, values);
        self
    }

    /// Record for a channel configured with `amplitude`.
    pub fn to_record(&self, amplitude: f64) -> WaveformRecord {
        WaveformRecord {
            samples: self.wfm.clone(),
            markers: self.markers.clone(),
            amplitude,
        }
    }
}

/// Per-channel data of one element, in channel first-seen order.
pub type ElementData = IndexMap<String, ChannelData>;

/// Element inside a sub-sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SubElement {
    /// Channel data.
    pub data: ElementData,
    /// Sequencing inside the sub-sequence.
    pub sequencing: SequencingOptions,
}

/// Content of a top-level position.
#[derive(Debug, Clone, PartialEq)]
pub enum ForgedStep {
    /// A single element.
    Leaf(ElementData),
    /// A nested sequence keyed by sub-position.
    Subsequence(BTreeMap<u32, SubElement>),
}

/// A top-level position.
#[derive(Debug, Clone, PartialEq)]
pub struct ForgedPosition {
    /// What plays at this position.
    pub step: ForgedStep,
    /// Sequencing in the main sequence.
    pub sequencing: SequencingOptions,
}

impl ForgedPosition {
    /// Leaf position with default sequencing.
    pub fn leaf(data: ElementData) -> Self {
        Self {
            step: ForgedStep::Leaf(data),
            sequencing: SequencingOptions::default(),
        }
    }

    /// Sub-sequence position with default sequencing.
    pub fn subsequence(elements: BTreeMap<u32, SubElement>) -> Self {
        Self {
            step: ForgedStep::Subsequence(elements),
            sequencing: SequencingOptions::default(),
        }
    }

    /// Replaces the sequencing options.
    #[must_use]
    pub fn with_sequencing(mut self, sequencing: SequencingOptions) -> Self {
        self.sequencing = sequencing;
        self
    }

    /// True for sub-sequence positions.
    pub fn is_subsequence(&self) -> bool {
        matches!(self.step, ForgedStep::Subsequence(_))
    }
}

/// A complete forged sequence.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ForgedSequence {
    positions: BTreeMap<u32, ForgedPosition>,
}

impl ForgedSequence {
    /// Empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a position.
    #[must_use]
    pub fn with_position(mut self, position: u32, content: ForgedPosition) -> Self {
        self.positions.insert(position, content);
        self
    }

    /// Positions in ascending order.
    pub fn positions(&self) -> impl Iterator<Item = (u32, &ForgedPosition)> {
        self.positions.iter().map(|(&p, content)| (p, content))
    }

    /// Number of top-level positions.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// True if there are no positions.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Logical channel labels in first-seen order.
    pub fn channels(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        let mut visit = |data: &ElementData| {
            for ch in data.keys() {
                if !seen.contains(ch) {
                    seen.push(ch.clone());
                }
            }
        };
        for position in self.positions.values() {
            match &position.step {
                ForgedStep::Leaf(data) => visit(data),
                ForgedStep::Subsequence(elements) => {
                    for element in elements.values() {
                        visit(&element.data);
                    }
                }
            }
        }
        seen
    }

    /// Checks the tree shape and sequencing codes.
    ///
    /// # Errors
    ///
    /// [`AwgError::InvalidForgedSequence`] describing the first problem found.
    pub fn validate(&self) -> AppResult<()> {
        if self.positions.is_empty() {
            return Err(invalid("sequence has no positions"));
        }
        let steps = self.positions.len();
        for (&pos, position) in &self.positions {
            if pos == 0 {
                return Err(invalid("positions are 1-indexed, found position 0"));
            }
            check_sequencing(&position.sequencing, steps, &format!("position {pos}"))?;
            match &position.step {
                ForgedStep::Leaf(data) => check_data(data, &format!("position {pos}"))?,
                ForgedStep::Subsequence(elements) => {
                    if elements.is_empty() {
                        return Err(invalid(format!("subsequence at position {pos} is empty")));
                    }
                    for (&sub, element) in elements {
                        let place = format!("position {pos}.{sub}");
                        if sub == 0 {
                            return Err(invalid(format!(
                                "{place}: sub-positions are 1-indexed"
                            )));
                        }
                        check_sequencing(&element.sequencing, elements.len(), &place)?;
                        check_data(&element.data, &place)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Parses the broadbean forged layout.
    ///
    /// ```json
    /// {"1": {"type": "element",
    ///        "content": {"1": {"data": {"ch1": {"wfm": [..], "m1": [..]}}}},
    ///        "sequencing": {"nrep": 2}}}
    /// ```
    ///
    /// Missing sequencing keys default to `twait=0, nrep=1, jump_input=0,
    /// jump_target=0, goto=0`.
    ///
    /// # Errors
    ///
    /// [`AwgError::InvalidForgedSequence`] for malformed JSON, wrong shape,
    /// marker values other than 0/1, or invalid sequencing codes.
    pub fn from_json(json: &str) -> AppResult<Self> {
        let raw: BTreeMap<u32, RawPosition> =
            serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;
        let mut sequence = ForgedSequence::new();
        for (pos, position) in raw {
            let sequencing = position.sequencing.resolve();
            let step = match position.kind {
                RawKind::Element => {
                    if position.content.len() != 1 {
                        return Err(invalid(format!(
                            "element at position {pos} must have exactly one content entry, found {}",
                            position.content.len()
                        )));
                    }
                    let data = position
                        .content
                        .into_values()
                        .next()
                        .map(|content| convert_data(content.data, &format!("position {pos}")))
                        .transpose()?
                        .unwrap_or_default();
                    ForgedStep::Leaf(data)
                }
                RawKind::Subsequence => {
                    let mut elements = BTreeMap::new();
                    for (sub, content) in position.content {
                        let data = convert_data(content.data, &format!("position {pos}.{sub}"))?;
                        elements.insert(
                            sub,
                            SubElement {
                                data,
                                sequencing: content.sequencing.resolve(),
                            },
                        );
                    }
                    ForgedStep::Subsequence(elements)
                }
            };
            sequence.positions.insert(pos, ForgedPosition { step, sequencing });
        }
        sequence.validate()?;
        Ok(sequence)
    }
}

fn invalid(msg: impl Into<String>) -> AwgError {
    AwgError::InvalidForgedSequence(msg.into())
}

fn check_sequencing(options: &SequencingOptions, steps: usize, place: &str) -> AppResult<()> {
    if options.twait > 3 {
        return Err(invalid(format!("{place}: twait {} outside 0..=3", options.twait)));
    }
    if options.jump_input > 3 {
        return Err(invalid(format!(
            "{place}: jump_input {} outside 0..=3",
            options.jump_input
        )));
    }
    if options.nrep > MAX_REPEAT_COUNT {
        return Err(invalid(format!(
            "{place}: nrep {} exceeds {MAX_REPEAT_COUNT}",
            options.nrep
        )));
    }
    for (field, target) in [("jump_target", options.jump_target), ("goto", options.goto)] {
        if target as usize > steps {
            return Err(invalid(format!(
                "{place}: {field} {target} outside 0..={steps}"
            )));
        }
    }
    Ok(())
}

fn check_data(data: &ElementData, place: &str) -> AppResult<()> {
    if data.is_empty() {
        return Err(invalid(format!("{place} has no channel data")));
    }
    for (ch, channel) in data {
        if channel.wfm.is_empty() {
            return Err(invalid(format!("{place}, channel {ch}: empty waveform")));
        }
        if let Some(index) = channel
            .markers
            .keys()
            .find(|&&i| !(1..=MAX_MARKERS).contains(&i))
        {
            return Err(invalid(format!(
                "{place}, channel {ch}: marker index {index} outside 1..={MAX_MARKERS}"
            )));
        }
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawKind {
    Element,
    Subsequence,
}

#[derive(Deserialize)]
struct RawPosition {
    #[serde(rename = "type")]
    kind: RawKind,
    content: BTreeMap<u32, RawContent>,
    #[serde(default)]
    sequencing: RawSequencing,
}

#[derive(Deserialize)]
struct RawContent {
    data: IndexMap<String, RawChannel>,
    #[serde(default)]
    sequencing: RawSequencing,
}

#[derive(Deserialize)]
struct RawChannel {
    wfm: Vec<f64>,
    m1: Option<Vec<f64>>,
    m2: Option<Vec<f64>>,
    m3: Option<Vec<f64>>,
    m4: Option<Vec<f64>>,
}

#[derive(Deserialize, Default)]
struct RawSequencing {
    twait: Option<u8>,
    nrep: Option<u32>,
    jump_input: Option<u8>,
    jump_target: Option<u32>,
    goto: Option<u32>,
}

impl RawSequencing {
    fn resolve(&self) -> SequencingOptions {
        let defaults = SequencingOptions::default();
        SequencingOptions {
            twait: self.twait.unwrap_or(defaults.twait),
            nrep: self.nrep.unwrap_or(defaults.nrep),
            jump_input: self.jump_input.unwrap_or(defaults.jump_input),
            jump_target: self.jump_target.unwrap_or(defaults.jump_target),
            goto: self.goto.unwrap_or(defaults.goto),
        }
    }
}

fn convert_data(raw: IndexMap<String, RawChannel>, place: &str) -> AppResult<ElementData> {
    let mut data = ElementData::with_capacity(raw.len());
    for (ch, channel) in raw {
        let mut converted = ChannelData::new(channel.wfm);
        let planes = [channel.m1, channel.m2, channel.m3, channel.m4];
        for (index, plane) in (1u8..).zip(planes) {
            let Some(plane) = plane else { continue };
            let bits = plane
                .iter()
                .map(|&v| {
                    if v == 0.0 {
                        Ok(false)
                    } else if v == 1.0 {
                        Ok(true)
                    } else {
                        Err(invalid(format!(
                            "{place}, channel {ch}, m{index}: marker value {v} is not 0 or 1"
                        )))
                    }
                })
                .collect::<AppResult<Vec<bool>>>()?;
            converted.markers.insert(index, bits);
        }
        data.insert(ch, converted);
    }
    Ok(data)
}

/// Logical channel label to physical channel number.
///
/// Must be a bijection onto `1..=C` for the `C` channels of the sequence.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(transparent)]
pub struct ChannelMapping(IndexMap<String, usize>);

impl ChannelMapping {
    /// Assigns `1..=C` in the given order.
    pub fn first_seen(channels: &[String]) -> Self {
        channels
            .iter()
            .enumerate()
            .map(|(i, ch)| (ch.clone(), i + 1))
            .collect()
    }

    /// Physical channel of a logical label.
    pub fn get(&self, logical: &str) -> Option<usize> {
        self.0.get(logical).copied()
    }

    /// Number of mapped channels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks the mapping against the channels found in a sequence.
    ///
    /// # Errors
    ///
    /// [`AwgError::InvalidChannelMapping`] if the key set differs from
    /// `channels`, or the values are not exactly `1..=channels.len()`.
    pub fn validate(&self, channels: &[String]) -> AppResult<()> {
        let found: BTreeSet<&str> = channels.iter().map(String::as_str).collect();
        let keys: BTreeSet<&str> = self.0.keys().map(String::as_str).collect();
        if found != keys {
            return Err(AwgError::InvalidChannelMapping(format!(
                "the sequence has channels {found:?}, but the channel_mapping maps from the channels {keys:?}"
            )));
        }
        let expected: BTreeSet<usize> = (1..=found.len()).collect();
        let values: BTreeSet<usize> = self.0.values().copied().collect();
        if values != expected || self.0.len() != found.len() {
            return Err(AwgError::InvalidChannelMapping(format!(
                "must map onto {:?}, got {:?}",
                expected,
                self.0.values().collect::<Vec<_>>()
            )));
        }
        Ok(())
    }
}

impl<S: Into<String>> FromIterator<(S, usize)> for ChannelMapping {
    fn from_iter<I: IntoIterator<Item = (S, usize)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}
