//! Binary sample packer.
//!
//! Layout: `N` little-endian `f32` samples scaled by `2 / amplitude`, followed
//! (only when markers are attached) by one marker byte per sample.

use tracing::{debug, warn};

use super::{MarkerLayout, WaveformRecord};
use crate::error::{AppResult, AwgError};

/// Minimum sample count accepted by the instrument.
pub const MIN_SAMPLES: usize = 2400;

/// What to do with samples that leave [-1, 1] after scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangePolicy {
    /// Clamp into range and log a warning. Used for containers.
    Clip,
    /// Fail with [`AwgError::OutOfRange`]. Used for direct transfers.
    Reject,
}

/// Packed binary form of one [`WaveformRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedWaveform {
    /// Little-endian `f32` samples, `4 * N` bytes.
    pub samples: Vec<u8>,
    /// One marker byte per sample, if the record carries markers.
    pub markers: Option<Vec<u8>>,
    /// Number of samples `N`.
    pub sample_count: usize,
}

impl PackedWaveform {
    /// Samples followed by marker bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut out = self.samples;
        if let Some(markers) = self.markers {
            out.extend_from_slice(&markers);
        }
        out
    }

    /// Total payload length in bytes.
    pub fn len(&self) -> usize {
        self.samples.len() + self.markers.as_ref().map_or(0, Vec::len)
    }

    /// True if nothing was packed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Packs a record.
///
/// The record is validated first; nothing is allocated for an invalid one.
///
/// # Errors
///
/// Record validation errors, [`AwgError::Validation`] when the record uses more
/// markers than `layout` can carry and, under [`RangePolicy::Reject`],
/// [`AwgError::OutOfRange`].
pub fn pack(
    record: &WaveformRecord,
    layout: MarkerLayout,
    policy: RangePolicy,
) -> AppResult<PackedWaveform> {
    record.validate()?;
    if let Some(&index) = record.markers.keys().find(|&&i| i > layout.capacity()) {
        return Err(AwgError::Validation(format!(
            "marker {index} cannot be encoded, the {layout:?} layout carries at most {} markers",
            layout.capacity()
        )));
    }

    let scale = 2.0 / record.amplitude;
    let (lo, hi) = record.extent();
    if lo * scale < -1.0 || hi * scale > 1.0 {
        match policy {
            RangePolicy::Reject => {
                return Err(AwgError::OutOfRange {
                    min: lo * scale,
                    max: hi * scale,
                });
            }
            RangePolicy::Clip => {
                warn!(
                    waveform_min_v = lo,
                    waveform_max_v = hi,
                    channel_min_v = -record.amplitude / 2.0,
                    channel_max_v = record.amplitude / 2.0,
                    "Waveform exceeds specified channel range, the resulting waveform will be clipped"
                );
            }
        }
    }

    let n = record.len();
    let mut samples = Vec::with_capacity(4 * n);
    for &sample in &record.samples {
        let scaled = (sample * scale).clamp(-1.0, 1.0) as f32;
        samples.extend_from_slice(&scaled.to_le_bytes());
    }

    let markers = record.has_markers().then(|| {
        let mut bytes = vec![0u8; n];
        for (&index, plane) in &record.markers {
            let mask = layout.mask(index);
            for (byte, &high) in bytes.iter_mut().zip(plane) {
                if high {
                    *byte |= mask;
                }
            }
        }
        bytes
    });

    debug!(
        samples = n,
        markers = record.markers.len(),
        ?layout,
        "Packed waveform"
    );
    Ok(PackedWaveform {
        samples,
        markers,
        sample_count: n,
    })
}

/// Decodes little-endian `f32` samples.
///
/// # Errors
///
/// [`AwgError::Validation`] when the length is not a multiple of four.
pub fn decode_samples(bytes: &[u8]) -> AppResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(AwgError::Validation(format!(
            "sample block of {} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Extracts one marker plane from packed marker bytes.
pub fn decode_marker(bytes: &[u8], layout: MarkerLayout, index: u8) -> Vec<bool> {
    bytes.iter().map(|&b| layout.decode(b, index)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tracing_test::traced_test;

    fn ramp(n: usize, peak: f64) -> Vec<f64> {
        (0..n)
            .map(|i| peak * (2.0 * i as f64 / (n - 1) as f64 - 1.0))
            .collect()
    }

    #[test]
    fn test_zero_waveform_without_markers() {
        let rec = WaveformRecord::new(vec![0.0; 2400], 1.0);
        let packed = pack(&rec, MarkerLayout::Planar, RangePolicy::Clip).unwrap();
        assert_eq!(packed.samples.len(), 9600);
        assert!(packed.markers.is_none());
        assert!(packed.samples.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_scaling_maps_channel_range_to_unit() {
        let rec = WaveformRecord::new(ramp(2400, 0.25), 0.5);
        let packed = pack(&rec, MarkerLayout::Planar, RangePolicy::Reject).unwrap();
        let decoded = decode_samples(&packed.samples).unwrap();
        assert_eq!(decoded[0], -1.0);
        assert_eq!(decoded[2399], 1.0);
    }

    #[test]
    fn test_reject_policy_fails_out_of_range() {
        let rec = WaveformRecord::new(ramp(2400, 0.3), 0.5);
        let err = pack(&rec, MarkerLayout::Transfer, RangePolicy::Reject).unwrap_err();
        match err {
            AwgError::OutOfRange { min, max } => {
                assert!((min + 1.2).abs() < 1e-9);
                assert!((max - 1.2).abs() < 1e-9);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    #[traced_test]
    fn test_clip_policy_clamps_and_warns() {
        let rec = WaveformRecord::new(ramp(2400, 0.3), 0.5);
        let packed = pack(&rec, MarkerLayout::Planar, RangePolicy::Clip).unwrap();
        let decoded = decode_samples(&packed.samples).unwrap();
        assert_eq!(decoded[0], -1.0);
        assert_eq!(decoded[2399], 1.0);
        assert!(logs_contain("exceeds specified channel range"));
    }

    #[test]
    fn test_planar_marker_byte() {
        let n = 2400;
        let mut m1 = vec![false; n];
        let mut m3 = vec![false; n];
        m1[0] = true;
        m3[0] = true;
        m3[1] = true;
        let rec = WaveformRecord::new(vec![0.0; n], 1.0)
            .with_marker(1, m1)
            .with_marker(3, m3);
        let packed = pack(&rec, MarkerLayout::Planar, RangePolicy::Clip).unwrap();
        let markers = packed.markers.unwrap();
        assert_eq!(markers.len(), n);
        assert_eq!(markers[0], 0b0101);
        assert_eq!(markers[1], 0b0100);
        assert_eq!(markers[2], 0);
    }

    #[test]
    fn test_transfer_layout_limits_markers() {
        let rec = WaveformRecord::new(vec![0.0; 2400], 1.0).with_marker(3, vec![true; 2400]);
        assert!(matches!(
            pack(&rec, MarkerLayout::Transfer, RangePolicy::Reject),
            Err(AwgError::Validation(_))
        ));
        assert!(pack(&rec, MarkerLayout::Planar, RangePolicy::Reject).is_ok());
    }

    #[test]
    fn test_payload_concatenation() {
        let rec = WaveformRecord::new(vec![0.1; 2400], 1.0).with_marker(2, vec![true; 2400]);
        let packed = pack(&rec, MarkerLayout::Transfer, RangePolicy::Reject).unwrap();
        assert_eq!(packed.len(), 5 * 2400);
        let bytes = packed.into_bytes();
        assert_eq!(bytes.len(), 5 * 2400);
        assert!(bytes[9600..].iter().all(|&b| b == 0x80));
    }

    #[test]
    fn test_decode_samples_rejects_partial_value() {
        assert!(decode_samples(&[0, 0, 0]).is_err());
    }

    fn layout_strategy() -> impl Strategy<Value = (MarkerLayout, u8)> {
        prop_oneof![
            Just((MarkerLayout::Planar, 4u8)),
            Just((MarkerLayout::DualTrack, 2u8)),
            Just((MarkerLayout::Transfer, 2u8)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_samples_recovered(
            amplitude in 0.01f64..2.0,
            fractions in prop::collection::vec(-1.0f64..=1.0, 2400..2600),
        ) {
            let samples: Vec<f64> = fractions.iter().map(|f| f * amplitude / 2.0).collect();
            let rec = WaveformRecord::new(samples.clone(), amplitude);
            let packed = pack(&rec, MarkerLayout::Planar, RangePolicy::Clip).unwrap();
            let decoded = decode_samples(&packed.samples).unwrap();
            prop_assert_eq!(decoded.len(), samples.len());
            for (original, recovered) in samples.iter().zip(&decoded) {
                let expected = (original * 2.0 / amplitude).clamp(-1.0, 1.0);
                prop_assert!((f64::from(*recovered) - expected).abs() <= 1e-6);
            }
        }

        #[test]
        fn prop_markers_reconstructed(
            (layout, count) in layout_strategy(),
            planes in prop::collection::vec(prop::collection::vec(any::<bool>(), 2400), 4),
        ) {
            let mut rec = WaveformRecord::new(vec![0.0; 2400], 1.0);
            for index in 1..=count {
                rec = rec.with_marker(index, planes[usize::from(index - 1)].clone());
            }
            let packed = pack(&rec, layout, RangePolicy::Reject).unwrap();
            let bytes = packed.markers.unwrap();
            for index in 1..=count {
                let plane = decode_marker(&bytes, layout, index);
                prop_assert_eq!(&plane, &planes[usize::from(index - 1)]);
            }
        }
    }
}
