// Copyright 2025-2026 CEMAXECUTER LLC

use chrono::{DateTime, TimeDelta, Utc};

/// Gaps longer than this between accepted timestamps suggest lost data.
pub const DROP_THRESHOLD_MS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapCheck {
    /// Timestamp moved forward; the previous composite is complete.
    pub advanced: bool,
    /// Gap exceeded the drop threshold.
    pub suspected_drop: bool,
    pub gap: TimeDelta,
}

/// Compares consecutive accepted timestamps. Never alters control flow,
/// only reports.
pub struct GapDetector {
    threshold: TimeDelta,
    drops: u64,
}

impl Default for GapDetector {
    fn default() -> Self {
        Self::new(TimeDelta::milliseconds(DROP_THRESHOLD_MS))
    }
}

impl GapDetector {
    pub fn new(threshold: TimeDelta) -> Self {
        Self { threshold, drops: 0 }
    }

    pub fn check(&mut self, prev: DateTime<Utc>, current: DateTime<Utc>) -> GapCheck {
        let gap = current - prev;
        let suspected_drop = gap > self.threshold;
        if suspected_drop {
            self.drops += 1;
            log::warn!(
                "possible data loss: {:.3} s between {} and {}",
                gap.num_milliseconds() as f64 / 1000.0,
                prev.to_rfc3339(),
                current.to_rfc3339()
            );
        }
        GapCheck {
            advanced: gap > TimeDelta::zero(),
            suspected_drop,
            gap,
        }
    }

    pub fn drops(&self) -> u64 {
        self.drops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_gap_threshold() {
        let mut det = GapDetector::default();
        let t0 = Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap();

        let c = det.check(t0, t0 + TimeDelta::milliseconds(1000));
        assert!(c.advanced);
        assert!(!c.suspected_drop);

        let c = det.check(t0, t0 + TimeDelta::milliseconds(1001));
        assert!(c.suspected_drop);

        let c = det.check(t0, t0 + TimeDelta::seconds(7));
        assert!(c.suspected_drop);
        assert_eq!(det.drops(), 2);
    }

    #[test]
    fn test_same_or_earlier_timestamp_does_not_advance() {
        let mut det = GapDetector::default();
        let t0 = Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 5).unwrap();
        assert!(!det.check(t0, t0).advanced);
        let back = det.check(t0, t0 - TimeDelta::seconds(3));
        assert!(!back.advanced);
        assert!(!back.suspected_drop);
        assert_eq!(det.drops(), 0);
    }
}
