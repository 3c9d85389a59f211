use chrono::DateTime;

use std::fmt;

/// COFF timestamp, seconds since the unix epoch. Displays as UTC, or as
/// the raw value when it does not name a representable date.
pub struct Timestamp(pub u32);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match DateTime::from_timestamp(self.0 as i64, 0) {
            Some(datetime) => return write!(f, "{}", datetime.format("%Y-%m-%d %H:%M:%S")),
            None => return write!(f, "{:#010x}", self.0),
        }
    }
}

pub fn format_bytes(bytes: &[u8]) -> String {
    return bytes
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<String>>()
        .join(" ");
}
