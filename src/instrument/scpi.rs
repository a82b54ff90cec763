//! SCPI message helpers: IEEE 488.2 definite-length blocks and reply parsing.

use crate::error::{AppResult, AwgError};

/// Largest message accepted in a single transport write.
pub const MAX_WRITE_LEN: usize = 999_999_999;

/// `#<digits><len>` header of a definite-length block.
pub fn block_header(len: usize) -> String {
    let digits = len.to_string();
    format!("#{}{digits}", digits.len())
}

/// Total size of `prefix` + block header + payload.
///
/// # Errors
///
/// [`AwgError::Capacity`] above [`MAX_WRITE_LEN`].
pub fn check_capacity(prefix: &str, payload_len: usize) -> AppResult<usize> {
    let size = prefix.len() + block_header(payload_len).len() + payload_len;
    if size > MAX_WRITE_LEN {
        return Err(AwgError::Capacity {
            size,
            limit: MAX_WRITE_LEN,
        });
    }
    Ok(size)
}

/// `prefix` followed by `payload` as a definite-length block.
///
/// # Errors
///
/// [`AwgError::Capacity`] when the message would exceed [`MAX_WRITE_LEN`];
/// nothing is allocated in that case.
pub fn block_message(prefix: &str, payload: &[u8]) -> AppResult<Vec<u8>> {
    let size = check_capacity(prefix, payload.len())?;
    let mut msg = Vec::with_capacity(size);
    msg.extend_from_slice(prefix.as_bytes());
    msg.extend_from_slice(block_header(payload.len()).as_bytes());
    msg.extend_from_slice(payload);
    Ok(msg)
}

/// `ON`/`OFF`.
pub fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

/// Strips whitespace and surrounding double quotes.
pub fn unquote(response: &str) -> String {
    response.trim().trim_matches('"').to_string()
}

/// Parses a comma separated, optionally quoted list. An empty reply is an
/// empty list.
pub fn parse_list(response: &str) -> Vec<String> {
    let cleaned = response.trim().replace('"', "");
    if cleaned.is_empty() {
        return Vec::new();
    }
    cleaned.split(',').map(|s| s.trim().to_string()).collect()
}

/// Parses a numeric reply.
///
/// # Errors
///
/// [`AwgError::Instrument`] naming the query and the reply.
pub fn parse_f64(query: &str, response: &str) -> AppResult<f64> {
    response.trim().parse().map_err(|_| {
        AwgError::Instrument(format!("unexpected reply to {query}: '{}'", response.trim()))
    })
}

/// Parses an integer reply; `"2.0"` style replies are accepted.
///
/// # Errors
///
/// [`AwgError::Instrument`] naming the query and the reply.
pub fn parse_int(query: &str, response: &str) -> AppResult<i64> {
    let text = response.trim();
    if let Ok(value) = text.parse::<i64>() {
        return Ok(value);
    }
    let value = parse_f64(query, text)?;
    if value.fract() != 0.0 || !value.is_finite() {
        return Err(AwgError::Instrument(format!(
            "unexpected reply to {query}: '{text}'"
        )));
    }
    Ok(value as i64)
}

/// Parses a `SYST:ERR?` reply such as `-256,"File name not found"`.
///
/// # Errors
///
/// [`AwgError::Instrument`] if the code is not numeric.
pub fn parse_error(response: &str) -> AppResult<(i64, String)> {
    let (code, message) = response.split_once(',').unwrap_or((response, ""));
    Ok((parse_int("SYST:ERR?", code)?, unquote(message)))
}

/// Doubles backslashes in a Windows path for use inside a quoted argument.
pub fn escape_path(path: &str) -> String {
    path.replace('\\', "\\\\")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_message() {
        let msg = block_message("MMEMory:DATA \"a.seqx\",", b"abcdefghijkl").unwrap();
        assert_eq!(msg, b"MMEMory:DATA \"a.seqx\",#212abcdefghijkl");
        assert_eq!(block_header(0), "#10");
        assert_eq!(block_header(9600), "#49600");
    }

    #[test]
    fn test_capacity_limit() {
        let prefix = "WLISt:WAVeform:DATA \"w\",0,1,";
        let fits = MAX_WRITE_LEN - prefix.len() - 11;
        assert_eq!(check_capacity(prefix, fits).unwrap(), MAX_WRITE_LEN);
        assert!(matches!(
            check_capacity(prefix, fits + 1),
            Err(AwgError::Capacity { limit: MAX_WRITE_LEN, .. })
        ));
    }

    #[test]
    fn test_reply_parsing() {
        assert_eq!(parse_list("\"a\",\"b\"\n"), ["a", "b"]);
        assert!(parse_list("\"\"").is_empty());
        assert_eq!(unquote(" \"seq\"\n"), "seq");
        assert_eq!(parse_int("q", "2").unwrap(), 2);
        assert_eq!(parse_int("q", "9.0").unwrap(), 9);
        assert!(parse_int("q", "9.5").is_err());
        assert!(parse_f64("CLOCk:SRATe?", "abc").is_err());
        assert_eq!(
            parse_error("-256,\"File name not found\"").unwrap(),
            (-256, "File name not found".to_string())
        );
        assert_eq!(parse_error("0,\"No error\"").unwrap().0, 0);
    }

    #[test]
    fn test_escape_path() {
        assert_eq!(escape_path(r"C:\a\b.seqx"), r"C:\\a\\b.seqx");
    }
}
