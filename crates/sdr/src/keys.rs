// Copyright 2025-2026 CEMAXECUTER LLC

//! Storage key decoding.
//!
//! Keys carry the capture timestamp, the slot index and the receiver
//! channel, e.g. `rfind/2023-05-01T00:00:00Z_03_1`. The second receiver
//! channel covers the upper half of the band, so its slots are folded into
//! the extended slot space by adding [`EXTENDED_SLOT_OFFSET`].

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;

pub const DEFAULT_KEY_PATTERN: &str = r"^rfind/(\S+?)_(\d+)_(\d+)$";

pub const EXTENDED_SLOT_OFFSET: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    pub timestamp: DateTime<Utc>,
    /// Timestamp exactly as it appeared in the key.
    pub raw_timestamp: String,
    /// Slot in the extended slot space.
    pub slot: usize,
    pub channel: u32,
}

/// Parse an ISO-8601 timestamp. Offsets are honoured; naive timestamps
/// are taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub struct KeyDecoder {
    pattern: Regex,
}

impl Default for KeyDecoder {
    fn default() -> Self {
        Self {
            pattern: Regex::new(DEFAULT_KEY_PATTERN).expect("default key pattern is valid"),
        }
    }
}

impl KeyDecoder {
    /// `pattern` must have three capture groups: timestamp, slot, channel.
    pub fn new(pattern: &str) -> Result<Self, String> {
        let pattern =
            Regex::new(pattern).map_err(|e| format!("invalid key pattern {:?}: {}", pattern, e))?;
        if pattern.captures_len() < 4 {
            return Err(format!(
                "key pattern {:?} needs 3 capture groups (timestamp, slot, channel), has {}",
                pattern.as_str(),
                pattern.captures_len() - 1
            ));
        }
        Ok(Self { pattern })
    }

    /// `None` means the key is not ours and should be skipped. A folded slot
    /// that would overflow is treated the same way.
    pub fn decode(&self, key: &str) -> Option<DecodedKey> {
        let caps = self.pattern.captures(key)?;
        let raw_timestamp = caps.get(1)?.as_str();
        let slot: usize = caps.get(2)?.as_str().parse().ok()?;
        let channel: u32 = caps.get(3)?.as_str().parse().ok()?;
        let timestamp = parse_timestamp(raw_timestamp)?;

        let slot = if channel == 1 {
            slot.checked_add(EXTENDED_SLOT_OFFSET)?
        } else {
            slot
        };

        Some(DecodedKey {
            timestamp,
            raw_timestamp: raw_timestamp.to_string(),
            slot,
            channel,
        })
    }
}
