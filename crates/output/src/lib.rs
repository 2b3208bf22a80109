// Copyright 2025-2026 CEMAXECUTER LLC

#[cfg(feature = "zmq")]
pub mod zmq_pub;

use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

/// Event name every frame is published under.
pub const INTEGRATION_EVENT: &str = "integration";

/// Frame timestamp: Unix milliseconds from live backends, the capture
/// timestamp string from replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameTimestamp {
    Millis(f64),
    Iso(String),
}

impl std::fmt::Display for FrameTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameTimestamp::Millis(ms) => write!(f, "{:.0}", ms),
            FrameTimestamp::Iso(s) => f.write_str(s),
        }
    }
}

/// One timestamped, calibrated, trimmed spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationFrame {
    pub timestamp: FrameTimestamp,
    pub bins: Vec<i16>,
}

/// JSON part of a published frame. The bins travel separately as binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationPayload {
    pub timestamp: FrameTimestamp,
    pub n_bins: usize,
}

impl IntegrationFrame {
    pub fn new(timestamp: FrameTimestamp, bins: Vec<i16>) -> Self {
        Self { timestamp, bins }
    }

    pub fn payload(&self) -> IntegrationPayload {
        IntegrationPayload {
            timestamp: self.timestamp.clone(),
            n_bins: self.bins.len(),
        }
    }

    pub fn header_json(&self) -> Result<String, String> {
        serde_json::to_string(&self.payload()).map_err(|e| format!("frame header: {}", e))
    }

    /// Bins as little-endian i16 bytes.
    pub fn bins_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bins.len() * 2);
        for &b in &self.bins {
            // Writing into a Vec cannot fail
            let _ = out.write_i16::<LittleEndian>(b);
        }
        out
    }
}

/// Downstream consumer connection.
pub trait EventChannel: Send {
    fn emit(&mut self, event: &str, frame: &IntegrationFrame) -> Result<(), String>;
}

/// Logs a one-line summary per frame instead of publishing.
#[derive(Debug, Default)]
pub struct LogChannel;

impl EventChannel for LogChannel {
    fn emit(&mut self, event: &str, frame: &IntegrationFrame) -> Result<(), String> {
        let (min, max) = frame
            .bins
            .iter()
            .fold((i16::MAX, i16::MIN), |(lo, hi), &b| (lo.min(b), hi.max(b)));
        if frame.bins.is_empty() {
            log::info!("{} {}: empty frame", event, frame.timestamp);
        } else {
            log::info!(
                "{} {}: {} bins, range [{}, {}]",
                event,
                frame.timestamp,
                frame.bins.len(),
                min,
                max
            );
        }
        Ok(())
    }
}

#[derive(Default)]
struct Recording {
    events: Vec<(String, IntegrationFrame)>,
    fail_next: usize,
}

/// Keeps every emitted frame in memory. Clones share the same record, so
/// a test can hold one clone while the provider owns another.
#[derive(Clone, Default)]
pub struct RecordingChannel {
    inner: Arc<Mutex<Recording>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` emits fail.
    pub fn fail_next(&self, n: usize) {
        let mut rec = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        rec.fail_next = n;
    }

    pub fn events(&self) -> Vec<(String, IntegrationFrame)> {
        let rec = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        rec.events.clone()
    }

    pub fn frames(&self) -> Vec<IntegrationFrame> {
        self.events().into_iter().map(|(_, f)| f).collect()
    }

    pub fn len(&self) -> usize {
        let rec = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        rec.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventChannel for RecordingChannel {
    fn emit(&mut self, event: &str, frame: &IntegrationFrame) -> Result<(), String> {
        let mut rec = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if rec.fail_next > 0 {
            rec.fail_next -= 1;
            return Err("recording channel: injected failure".to_string());
        }
        rec.events.push((event.to_string(), frame.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_json() {
        let frame = IntegrationFrame::new(FrameTimestamp::Millis(1682899200000.0), vec![1, 2, 3]);
        let json: serde_json::Value = serde_json::from_str(&frame.header_json().unwrap()).unwrap();
        assert_eq!(json["timestamp"], 1682899200000.0);
        assert_eq!(json["n_bins"], 3);

        let frame = IntegrationFrame::new(FrameTimestamp::Iso("2023-05-01T00:00:00Z".into()), vec![]);
        assert_eq!(
            frame.header_json().unwrap(),
            r#"{"timestamp":"2023-05-01T00:00:00Z","n_bins":0}"#
        );
    }

    #[test]
    fn test_bins_little_endian() {
        let frame = IntegrationFrame::new(FrameTimestamp::Millis(0.0), vec![1, -2, i16::MIN]);
        assert_eq!(frame.bins_le_bytes(), vec![0x01, 0x00, 0xFE, 0xFF, 0x00, 0x80]);
    }

    #[test]
    fn test_recording_channel_shares_record() {
        let probe = RecordingChannel::new();
        let mut channel: Box<dyn EventChannel> = Box::new(probe.clone());
        let frame = IntegrationFrame::new(FrameTimestamp::Millis(5.0), vec![7]);

        probe.fail_next(1);
        assert!(channel.emit(INTEGRATION_EVENT, &frame).is_err());
        channel.emit(INTEGRATION_EVENT, &frame).unwrap();

        let events = probe.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "integration");
        assert_eq!(events[0].1, frame);
    }

    #[test]
    fn test_timestamp_display() {
        assert_eq!(FrameTimestamp::Millis(1500.0).to_string(), "1500");
        assert_eq!(FrameTimestamp::Iso("t".into()).to_string(), "t");
        assert!(LogChannel
            .emit(INTEGRATION_EVENT, &IntegrationFrame::new(FrameTimestamp::Millis(0.0), vec![]))
            .is_ok());
    }
}
