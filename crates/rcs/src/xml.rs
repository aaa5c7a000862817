//! Shared helpers for the fixed XML formats (revision metadata, change logs)

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use rcs_core::{RcsError, Result};
use std::io::Write;
use std::path::Path;

/// Write one event, attributing failures to the file being produced
pub(crate) fn emit<W: Write>(writer: &mut Writer<W>, path: &Path, event: Event) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| RcsError::xml(path, e.to_string()))
}

/// Write `<name>text</name>`
pub(crate) fn text_element<W: Write>(
    writer: &mut Writer<W>,
    path: &Path,
    name: &str,
    text: &str,
) -> Result<()> {
    emit(writer, path, Event::Start(BytesStart::new(name)))?;
    emit(writer, path, Event::Text(BytesText::new(text)))?;
    emit(writer, path, Event::End(BytesEnd::new(name)))
}

/// Collect a start tag's attributes as owned key/value pairs
pub(crate) fn attributes(e: &BytesStart, path: &Path) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| RcsError::xml(path, e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| RcsError::xml(path, e.to_string()))?
            .into_owned();
        out.push((key, value));
    }
    Ok(out)
}

/// Render a unix-millisecond timestamp as RFC 3339 (UTC, millisecond precision)
pub(crate) fn render_timestamp(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 timestamp back to unix milliseconds
pub(crate) fn parse_timestamp(text: &str, path: &Path) -> Result<i64> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| RcsError::xml(path, format!("bad timestamp {text:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_timestamp_roundtrip() {
        let ms = 1_724_995_201_123i64;
        let rendered = render_timestamp(ms);
        let parsed = parse_timestamp(&rendered, &PathBuf::from("x")).unwrap();
        assert_eq!(ms, parsed);
    }

    #[test]
    fn test_bad_timestamp_is_xml_error() {
        let err = parse_timestamp("yesterday", &PathBuf::from("rev.xml")).unwrap_err();
        assert!(matches!(err, RcsError::Xml { .. }));
    }
}
