// Copyright 2025-2026 CEMAXECUTER LLC

//! Time-windowed key prefixes.
//!
//! Fragments are stored under keys that start with their capture second,
//! so listing one window means listing one prefix per second in it. A
//! window is handed out only once it has fully elapsed (plus a settle
//! delay for late uploads).

use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};

/// Slack after a window ends before it is listed.
pub const SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    /// One prefix per whole second in `[start, end)`.
    pub fn prefixes(&self, key_prefix: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut t = self.start;
        while t < self.end {
            out.push(format!("{}/{}", key_prefix, t.format("%Y-%m-%dT%H:%M:%S")));
            t += TimeDelta::seconds(1);
        }
        out
    }
}

pub struct TimePrefixGenerator {
    window: TimeDelta,
    settle: TimeDelta,
    next_start: DateTime<Utc>,
}

impl TimePrefixGenerator {
    /// Windows of `window` length starting at `start`, which is rounded
    /// down to the window grid. A window shorter than one second is
    /// stretched to one second.
    pub fn new(window: Duration, start: DateTime<Utc>) -> Self {
        let window = TimeDelta::from_std(window.max(Duration::from_secs(1)))
            .unwrap_or(TimeDelta::seconds(1));
        let next_start = start.duration_trunc(window).unwrap_or(start);
        Self {
            window,
            settle: TimeDelta::from_std(SETTLE_DELAY).unwrap_or(TimeDelta::zero()),
            next_start,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = TimeDelta::from_std(settle).unwrap_or(TimeDelta::zero());
        self
    }

    pub fn next_start(&self) -> DateTime<Utc> {
        self.next_start
    }

    /// The next window if it is ready at `now`, otherwise how long to wait.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Result<Window, Duration> {
        let window = Window {
            start: self.next_start,
            end: self.next_start + self.window,
        };
        let ready_at = window.end + self.settle;
        if now < ready_at {
            return Err((ready_at - now).to_std().unwrap_or(Duration::ZERO));
        }
        self.next_start = window.end;
        Ok(window)
    }
}
