//! Waveform data model.
//!
//! A [`WaveformRecord`] is one channel's data for one sequence position: the
//! analog samples in volts, up to four marker bit-planes and the peak-to-peak
//! amplitude configured on the output that will play it.
//!
//! The [`packer`] turns a record into the binary layout shared by `.wfmx`
//! containers and direct waveform-list transfers; [`wfmx`] wraps that payload in
//! the XML container header.

pub mod packer;
pub mod wfmx;

use std::collections::BTreeMap;

use crate::error::{AppResult, AwgError};

pub use packer::{pack, PackedWaveform, RangePolicy, MIN_SAMPLES};

/// Highest marker index a record may carry.
pub const MAX_MARKERS: u8 = 4;

/// One channel's samples and markers.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformRecord {
    /// Analog samples in volts.
    pub samples: Vec<f64>,
    /// Marker bit-planes keyed by marker index (1..=4).
    pub markers: BTreeMap<u8, Vec<bool>>,
    /// Peak-to-peak amplitude (V) of the channel that will play the data.
    pub amplitude: f64,
}

impl WaveformRecord {
    /// Creates a marker-free record.
    pub fn new(samples: Vec<f64>, amplitude: f64) -> Self {
        Self {
            samples,
            markers: BTreeMap::new(),
            amplitude,
        }
    }

    /// Adds (or replaces) a marker bit-plane.
    #[must_use]
    pub fn with_marker(mut self, index: u8, values: Vec<bool>) -> Self {
        self.markers.insert(index, values);
        self
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True if the record holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// True if any marker plane is attached.
    pub fn has_markers(&self) -> bool {
        !self.markers.is_empty()
    }

    /// Marker bits this record needs on the DAC: 2 if marker 2 is ever high,
    /// otherwise 1 when markers are attached, else 0.
    pub fn markers_used(&self) -> u8 {
        if !self.has_markers() {
            0
        } else if self
            .markers
            .get(&2)
            .is_some_and(|plane| plane.iter().any(|&bit| bit))
        {
            2
        } else {
            1
        }
    }

    /// Smallest and largest raw sample, in volts.
    pub fn extent(&self) -> (f64, f64) {
        self.samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &s| {
                (lo.min(s), hi.max(s))
            })
    }

    /// Checks the record invariants.
    ///
    /// # Errors
    ///
    /// * [`AwgError::SampleCount`] below [`MIN_SAMPLES`].
    /// * [`AwgError::Validation`] for a non-positive or non-finite amplitude,
    ///   non-finite samples, marker indices outside 1..=4 or marker planes whose
    ///   length differs from the sample count.
    pub fn validate(&self) -> AppResult<()> {
        if self.samples.len() < MIN_SAMPLES {
            return Err(AwgError::SampleCount {
                found: self.samples.len(),
                minimum: MIN_SAMPLES,
            });
        }
        if !self.amplitude.is_finite() || self.amplitude <= 0.0 {
            return Err(AwgError::Validation(format!(
                "channel amplitude must be a positive number of volts, got {}",
                self.amplitude
            )));
        }
        if let Some(pos) = self.samples.iter().position(|s| !s.is_finite()) {
            return Err(AwgError::Validation(format!(
                "sample {pos} is not finite ({})",
                self.samples[pos]
            )));
        }
        for (&index, plane) in &self.markers {
            if !(1..=MAX_MARKERS).contains(&index) {
                return Err(AwgError::Validation(format!(
                    "marker index {index} outside 1..={MAX_MARKERS}"
                )));
            }
            if plane.len() != self.samples.len() {
                return Err(AwgError::Validation(format!(
                    "marker {index} has {} values but the waveform has {} samples",
                    plane.len(),
                    self.samples.len()
                )));
            }
        }
        Ok(())
    }
}

/// How marker planes are folded into the per-sample marker byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkerLayout {
    /// Marker k on bit k-1, up to four markers.
    #[default]
    Planar,
    /// Marker 1 on bits 0 and 2, marker 2 on bits 1 and 3, so both channels of
    /// a two-track sequence see the same marker pair.
    DualTrack,
    /// Marker 1 on bit 6, marker 2 on bit 7, as expected by
    /// `WLISt:WAVeform:MARKER:DATA`.
    Transfer,
}

impl MarkerLayout {
    /// Layout for containers played by a sequence with `tracks` tracks.
    pub fn for_tracks(tracks: usize) -> Self {
        if tracks >= 2 {
            MarkerLayout::DualTrack
        } else {
            MarkerLayout::Planar
        }
    }

    /// Highest marker index this layout can carry.
    pub fn capacity(self) -> u8 {
        match self {
            MarkerLayout::Planar => MAX_MARKERS,
            MarkerLayout::DualTrack | MarkerLayout::Transfer => 2,
        }
    }

    /// Bit mask set in the marker byte when marker `index` is high.
    pub fn mask(self, index: u8) -> u8 {
        match (self, index) {
            (MarkerLayout::Planar, 1..=4) => 1 << (index - 1),
            (MarkerLayout::DualTrack, 1) => 0b0101,
            (MarkerLayout::DualTrack, 2) => 0b1010,
            (MarkerLayout::Transfer, 1) => 0b0100_0000,
            (MarkerLayout::Transfer, 2) => 0b1000_0000,
            _ => 0,
        }
    }

    /// Reads marker `index` back out of a marker byte.
    pub fn decode(self, byte: u8, index: u8) -> bool {
        let mask = self.mask(index);
        mask != 0 && byte & mask == mask
    }
}
