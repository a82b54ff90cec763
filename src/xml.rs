//! XML plumbing shared by the `.wfmx`, `.sml` and `setup.xml` writers.
//!
//! The instrument expects every tag on its own line with CRLF separators and
//! text kept inline (`<Tag>text</Tag>`). [`XmlDocument`] wraps a `quick_xml`
//! writer and inserts the separators itself. Empty elements are closed with a
//! space before the slash (`<UserNotes />`), matching archives saved by other
//! tools, where `quick_xml` alone would write `<UserNotes/>`.
//!
//! `.wfmx` and `.sml` files open with a `DataFile` element whose `offset`
//! attribute quotes the byte length of the XML header. The attribute is written
//! as a nine digit placeholder at a fixed byte position and patched in place by
//! [`patch_offset`] once the header is complete.

use chrono::{DateTime, FixedOffset, Local};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{AppResult, AwgError};

/// Width of the zero padded `offset` field.
pub const OFFSET_DIGITS: usize = 9;

/// Largest header length representable in the `offset` field.
pub const MAX_HEADER_LEN: usize = 999_999_999;

const OFFSET_PLACEHOLDER: &str = "000000000";

/// Byte index of the first offset digit. The `DataFile` start tag is always
/// the first thing written and `offset` is its first attribute.
const OFFSET_FIELD_START: usize = "<DataFile offset=\"".len();

/// Schema location prefix used by every `DataSetsCollection` element.
pub(crate) const SCHEMA_ROOT: &str =
    r"http://www.tektronix.com file:///C:\Program%20Files\Tektronix\AWG70000\AWG\Schemas\";

pub(crate) const TEKTRONIX_NS: &str = "http://www.tektronix.com";
pub(crate) const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// Product block written into containers and the setup descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductInfo {
    /// Instrument model name.
    pub name: &'static str,
    /// Serial number quoted in the files.
    pub serial_number: &'static str,
    /// Firmware version quoted in the files.
    pub software_version: &'static str,
}

/// The model the generated files claim to come from.
pub const AWG70002B: ProductInfo = ProductInfo {
    name: "AWG70002B",
    serial_number: "B010294",
    software_version: "7.1.0170.0",
};

/// Streaming XML writer producing the instrument's CRLF-separated layout.
pub(crate) struct XmlDocument {
    writer: Writer<Vec<u8>>,
    separate: bool,
}

impl XmlDocument {
    pub(crate) fn new() -> Self {
        Self {
            writer: Writer::new(Vec::new()),
            separate: false,
        }
    }

    fn separator(&mut self) {
        if self.separate {
            self.writer.get_mut().extend_from_slice(b"\r\n");
        }
        self.separate = true;
    }

    fn write(&mut self, event: Event<'_>) -> AppResult<()> {
        self.writer.write_event(event).map_err(AwgError::xml)
    }

    /// Writes a start tag.
    pub(crate) fn open(&mut self, name: &str, attrs: &[(&str, &str)]) -> AppResult<()> {
        self.separator();
        let mut tag = BytesStart::new(name);
        for &attr in attrs {
            tag.push_attribute(attr);
        }
        self.write(Event::Start(tag))
    }

    /// Writes an end tag.
    pub(crate) fn close(&mut self, name: &str) -> AppResult<()> {
        self.separator();
        self.write(Event::End(BytesEnd::new(name)))
    }

    /// Writes a self-closing tag as `<name attrs />`.
    pub(crate) fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> AppResult<()> {
        self.separator();
        let mut tag = BytesStart::new(name);
        for &attr in attrs {
            tag.push_attribute(attr);
        }
        self.write(Event::Start(tag))?;
        let buf = self.writer.get_mut();
        if buf.last() == Some(&b'>') {
            buf.pop();
        }
        buf.extend_from_slice(b" />");
        Ok(())
    }

    /// Writes `<name attrs>text</name>` on a single line.
    pub(crate) fn text(&mut self, name: &str, attrs: &[(&str, &str)], text: &str) -> AppResult<()> {
        self.open(name, attrs)?;
        self.write(Event::Text(BytesText::new(text)))?;
        self.write(Event::End(BytesEnd::new(name)))
    }

    /// Writes the `DataFile` root with the offset placeholder.
    pub(crate) fn open_data_file(&mut self, version: &str) -> AppResult<()> {
        debug_assert!(!self.separate, "DataFile must be the first element");
        self.open("DataFile", &[("offset", OFFSET_PLACEHOLDER), ("version", version)])
    }

    /// Writes the `DataSetsCollection`/`DataSets` preamble for the given schema file.
    pub(crate) fn open_data_sets(&mut self, schema_file: &str) -> AppResult<()> {
        let location = format!("{SCHEMA_ROOT}{schema_file}");
        self.open(
            "DataSetsCollection",
            &[
                ("xmlns", TEKTRONIX_NS),
                ("xmlns:xsi", XSI_NS),
                ("xsi:schemaLocation", location.as_str()),
            ],
        )?;
        self.open("DataSets", &[("version", "1"), ("xmlns", TEKTRONIX_NS)])
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.writer.into_inner()
    }
}

/// Overwrites the `offset` placeholder with the length of `header`.
///
/// The placeholder is located by position, never by searching for its text.
pub(crate) fn patch_offset(header: &mut [u8]) -> AppResult<()> {
    let field = OFFSET_FIELD_START..OFFSET_FIELD_START + OFFSET_DIGITS;
    if header.get(field.clone()) != Some(OFFSET_PLACEHOLDER.as_bytes()) {
        return Err(AwgError::xml(
            "DataFile offset placeholder missing from its fixed position",
        ));
    }
    let len = header.len();
    if len > MAX_HEADER_LEN {
        return Err(AwgError::Capacity {
            size: len,
            limit: MAX_HEADER_LEN,
        });
    }
    let digits = format!("{len:0width$}", width = OFFSET_DIGITS);
    header[field].copy_from_slice(digits.as_bytes());
    Ok(())
}

/// Reads the `offset` attribute back from a patched header.
pub(crate) fn read_offset(bytes: &[u8]) -> Option<usize> {
    let field = bytes.get(OFFSET_FIELD_START..OFFSET_FIELD_START + OFFSET_DIGITS)?;
    std::str::from_utf8(field).ok()?.parse().ok()
}

/// Collects `(element, text)` pairs in document order.
///
/// Elements without text content are skipped.
pub(crate) fn element_texts(xml: &str) -> AppResult<Vec<(String, String)>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut current: Option<String> = None;
    let mut out = Vec::new();
    loop {
        match reader.read_event().map_err(AwgError::xml)? {
            Event::Start(tag) => {
                current = Some(String::from_utf8_lossy(tag.name().as_ref()).into_owned());
            }
            Event::Text(text) => {
                if let Some(name) = current.take() {
                    let value = text.unescape().map_err(AwgError::xml)?.into_owned();
                    out.push((name, value));
                }
            }
            Event::End(_) => current = None,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

/// Current local time with its UTC offset.
pub fn local_now() -> DateTime<FixedOffset> {
    Local::now().fixed_offset()
}

/// Formats a timestamp as `2024-05-01T13:45:12.345+02:00`.
pub fn format_timestamp(timestamp: &DateTime<FixedOffset>) -> String {
    timestamp.format("%Y-%m-%dT%H:%M:%S%.3f%:z").to_string()
}
