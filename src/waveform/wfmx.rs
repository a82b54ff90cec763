//! `.wfmx` waveform containers.
//!
//! A container is an XML header whose `DataFile offset` attribute quotes the
//! header's own byte length, followed directly by the packed payload from
//! [`super::packer`].

use chrono::{DateTime, FixedOffset};
use tracing::debug;

use super::packer::{decode_samples, pack, RangePolicy};
use super::{MarkerLayout, WaveformRecord};
use crate::error::{AppResult, AwgError};
use crate::xml::{self, XmlDocument, AWG70002B};

const WFMX_VERSION: &str = "0.2";
const WFMX_SCHEMA: &str = "awgDataSets.xsd";

/// Builds a container with the planar marker layout and the current time.
///
/// Out-of-range samples are clipped with a warning.
///
/// # Errors
///
/// Any record validation error. Nothing is serialized for an invalid record.
pub fn build_container(record: &WaveformRecord) -> AppResult<Vec<u8>> {
    build_container_at(record, MarkerLayout::Planar, &xml::local_now())
}

/// Builds a container with an explicit marker layout and timestamp.
///
/// # Errors
///
/// Any record validation error, or [`AwgError::Validation`] if the record
/// carries more markers than `layout` supports.
pub fn build_container_at(
    record: &WaveformRecord,
    layout: MarkerLayout,
    timestamp: &DateTime<FixedOffset>,
) -> AppResult<Vec<u8>> {
    let packed = pack(record, layout, RangePolicy::Clip)?;
    let mut out = header(packed.sample_count, packed.markers.is_some(), timestamp)?;
    let header_len = out.len();
    out.extend_from_slice(&packed.into_bytes());
    debug!(
        header_len,
        total_len = out.len(),
        samples = record.len(),
        "Built wfmx container"
    );
    Ok(out)
}

fn header(
    sample_count: usize,
    markers_included: bool,
    timestamp: &DateTime<FixedOffset>,
) -> AppResult<Vec<u8>> {
    let mut doc = XmlDocument::new();
    doc.open_data_file(WFMX_VERSION)?;
    doc.open_data_sets(WFMX_SCHEMA)?;

    doc.open("DataDescription", &[])?;
    doc.text("NumberSamples", &[], &sample_count.to_string())?;
    doc.text("SamplesType", &[], "AWGWaveformSample")?;
    doc.text("MarkersIncluded", &[], if markers_included { "true" } else { "false" })?;
    doc.text("NumberFormat", &[], "Single")?;
    doc.text("Endian", &[], "Little")?;
    doc.text("Timestamp", &[], &xml::format_timestamp(timestamp))?;
    doc.close("DataDescription")?;

    doc.open("ProductSpecific", &[("name", AWG70002B.name)])?;
    doc.text("RecSamplingRate", &[("units", "Hz")], "NaN")?;
    doc.text("RecAmplitude", &[("units", "Volts")], "NaN")?;
    doc.text("RecOffset", &[("units", "Volts")], "NaN")?;
    doc.text("RecFrequency", &[("units", "Hz")], "NaN")?;
    doc.text("SerialNumber", &[], AWG70002B.serial_number)?;
    doc.text("SoftwareVersion", &[], AWG70002B.software_version)?;
    doc.empty("UserNotes", &[])?;
    doc.empty("Thumbnail", &[])?;
    doc.text("SignalFormat", &[], "Real")?;
    doc.empty("CreatorProperties", &[("name", "")])?;
    doc.close("ProductSpecific")?;

    doc.close("DataSets")?;
    doc.close("DataSetsCollection")?;
    doc.empty("Setup", &[])?;
    doc.close("DataFile")?;

    let mut bytes = doc.into_bytes();
    xml::patch_offset(&mut bytes)?;
    Ok(bytes)
}

/// A container split back into header fields and payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedContainer {
    /// Header length declared by the `offset` attribute.
    pub header_len: usize,
    /// `NumberSamples`.
    pub sample_count: usize,
    /// `MarkersIncluded`.
    pub markers_included: bool,
    /// `Timestamp` text, if present.
    pub timestamp: Option<String>,
    /// Scaled samples.
    pub samples: Vec<f32>,
    /// Marker bytes, one per sample, when `markers_included`.
    pub markers: Option<Vec<u8>>,
}

/// Parses a container produced by [`build_container`] or by the instrument.
///
/// # Errors
///
/// [`AwgError::Validation`] for a missing or inconsistent offset, missing
/// header fields or a payload whose length does not match the header.
pub fn parse_container(bytes: &[u8]) -> AppResult<ParsedContainer> {
    let header_len = xml::read_offset(bytes)
        .ok_or_else(|| AwgError::Validation("container has no DataFile offset".into()))?;
    let header = bytes.get(..header_len).ok_or_else(|| {
        AwgError::Validation(format!(
            "declared header length {header_len} exceeds container size {}",
            bytes.len()
        ))
    })?;
    let header = std::str::from_utf8(header)
        .map_err(|e| AwgError::Validation(format!("container header is not UTF-8: {e}")))?;
    if !header.ends_with("</DataFile>") {
        return Err(AwgError::Validation(format!(
            "offset {header_len} does not end on the DataFile closing tag"
        )));
    }

    let mut sample_count = None;
    let mut markers_included = None;
    let mut timestamp = None;
    for (name, text) in xml::element_texts(header)? {
        match name.as_str() {
            "NumberSamples" => {
                sample_count = Some(text.parse::<usize>().map_err(|e| {
                    AwgError::Validation(format!("NumberSamples '{text}' is not a count: {e}"))
                })?);
            }
            "MarkersIncluded" => markers_included = Some(text == "true"),
            "Timestamp" => timestamp = Some(text),
            _ => {}
        }
    }
    let sample_count = sample_count
        .ok_or_else(|| AwgError::Validation("container header lacks NumberSamples".into()))?;
    let markers_included = markers_included
        .ok_or_else(|| AwgError::Validation("container header lacks MarkersIncluded".into()))?;

    let payload = &bytes[header_len..];
    let marker_bytes = if markers_included { sample_count } else { 0 };
    let (sample_bytes, expected) = sample_count
        .checked_mul(4)
        .and_then(|s| Some((s, s.checked_add(marker_bytes)?)))
        .ok_or_else(|| {
            AwgError::Validation(format!(
                "NumberSamples {sample_count} is too large for a container"
            ))
        })?;
    if payload.len() != expected {
        return Err(AwgError::Validation(format!(
            "payload has {} bytes, header implies {expected}",
            payload.len()
        )));
    }
    let samples = decode_samples(&payload[..sample_bytes])?;
    let markers = markers_included.then(|| payload[sample_bytes..].to_vec());

    Ok(ParsedContainer {
        header_len,
        sample_count,
        markers_included,
        timestamp,
        samples,
        markers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 9, 8, 7, 6)
            .unwrap()
    }

    #[test]
    fn test_zero_waveform_container() {
        let rec = WaveformRecord::new(vec![0.0; 2400], 1.0);
        let bytes = build_container(&rec).unwrap();
        let parsed = parse_container(&bytes).unwrap();
        assert_eq!(parsed.sample_count, 2400);
        assert!(!parsed.markers_included);
        assert_eq!(parsed.samples, vec![0.0f32; 2400]);
        assert_eq!(bytes.len() - parsed.header_len, 4 * 2400);

        let header = std::str::from_utf8(&bytes[..parsed.header_len]).unwrap();
        assert!(header.contains("<MarkersIncluded>false</MarkersIncluded>"));
        assert!(header.contains("<NumberFormat>Single</NumberFormat>\r\n<Endian>Little</Endian>"));
        assert!(header.contains("<UserNotes />\r\n<Thumbnail />"));
    }

    #[test]
    fn test_offset_equals_header_length() {
        let rec = WaveformRecord::new(vec![0.0; 2400], 1.0).with_marker(1, vec![true; 2400]);
        let bytes = build_container_at(&rec, MarkerLayout::Planar, &fixed_time()).unwrap();
        let end = b"</DataFile>";
        let header_len = bytes
            .windows(end.len())
            .position(|w| w == end)
            .unwrap()
            + end.len();
        let declared = format!("offset=\"{header_len:09}\"");
        assert!(std::str::from_utf8(&bytes[..header_len])
            .unwrap()
            .contains(&declared));
        assert_eq!(bytes.len() - header_len, 5 * 2400);

        let parsed = parse_container(&bytes).unwrap();
        assert_eq!(parsed.header_len, header_len);
        assert_eq!(parsed.markers, Some(vec![1u8; 2400]));
        assert_eq!(parsed.timestamp.as_deref(), Some("2024-03-09T08:07:06.000+01:00"));
    }

    #[test]
    fn test_short_waveform_rejected() {
        let rec = WaveformRecord::new(vec![0.0; 100], 1.0);
        assert!(matches!(
            build_container(&rec),
            Err(AwgError::SampleCount { found: 100, .. })
        ));
    }

    #[test]
    fn test_identical_inputs_give_identical_bytes() {
        let rec = WaveformRecord::new(vec![0.125; 3000], 0.5);
        let a = build_container_at(&rec, MarkerLayout::Planar, &fixed_time()).unwrap();
        let b = build_container_at(&rec, MarkerLayout::Planar, &fixed_time()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_rejects_truncated_payload() {
        let rec = WaveformRecord::new(vec![0.0; 2400], 1.0);
        let mut bytes = build_container(&rec).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(parse_container(&bytes), Err(AwgError::Validation(_))));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_container(b"not a container").is_err());
    }

    fn with_sample_count(bytes: &[u8], header_len: usize, count: &str) -> Vec<u8> {
        let header = std::str::from_utf8(&bytes[..header_len]).unwrap().replace(
            "<NumberSamples>2400</NumberSamples>",
            &format!("<NumberSamples>{count}</NumberSamples>"),
        );
        let mut out = header.into_bytes();
        let field = "<DataFile offset=\"".len();
        out[field..field + 9].copy_from_slice(b"000000000");
        crate::xml::patch_offset(&mut out).unwrap();
        out.extend_from_slice(&bytes[header_len..]);
        out
    }

    #[test]
    fn test_parse_rejects_overflowing_sample_count() {
        let rec = WaveformRecord::new(vec![0.0; 2400], 1.0);
        let bytes = build_container(&rec).unwrap();
        let header_len = parse_container(&bytes).unwrap().header_len;

        let huge = with_sample_count(&bytes, header_len, "4611686018427387904");
        let err = parse_container(&huge).unwrap_err();
        assert!(matches!(err, AwgError::Validation(_)));
        assert!(err.to_string().contains("too large"));

        let marked = WaveformRecord::new(vec![0.0; 2400], 1.0).with_marker(1, vec![false; 2400]);
        let bytes = build_container(&marked).unwrap();
        let header_len = parse_container(&bytes).unwrap().header_len;
        let huge = with_sample_count(&bytes, header_len, &(usize::MAX / 4).to_string());
        assert!(matches!(parse_container(&huge), Err(AwgError::Validation(_))));
    }
}
