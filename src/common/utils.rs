//! Utility functions for quorumkv

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::time::{SystemTime, UNIX_EPOCH};

/// Characters that would end or split a path segment
const SEGMENT_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&');

/// Encode one table, row or column name for use as a URL path segment
pub fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT_ENCODE_SET).to_string()
}

/// `/key/{table}/{row}[/{column}]` with every segment encoded
pub fn key_path(table: &str, row: &str, column: Option<&str>) -> String {
    let mut path = format!("/key/{}/{}", encode_segment(table), encode_segment(row));
    if let Some(column) = column {
        path.push('/');
        path.push_str(&encode_segment(column));
    }
    path
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Reject a blank client-supplied segment. The value is returned untouched so
/// that keys are stored exactly as they are later looked up.
pub fn non_empty<'a>(field: &str, value: &'a str) -> crate::Result<&'a str> {
    if value.trim().is_empty() {
        return Err(crate::Error::InvalidRequest(format!("{} must not be empty", field)));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty("table", " users ").unwrap(), " users ");
        assert!(non_empty("row", "   ").is_err());
    }

    #[test]
    fn test_key_path_encodes_segments() {
        assert_eq!(key_path("users", "u1", None), "/key/users/u1");
        assert_eq!(
            key_path("users", "a/b c", Some("e?#%&")),
            "/key/users/a%2Fb%20c/e%3F%23%25%26"
        );
        assert_eq!(encode_segment("caf\u{e9}"), "caf%C3%A9");
    }

    #[test]
    fn test_timestamp_is_monotonic_enough() {
        let a = timestamp_now_millis();
        let b = timestamp_now_millis();
        assert!(b >= a);
    }
}
