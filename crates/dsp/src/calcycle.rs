// Copyright 2025-2026 CEMAXECUTER LLC

//! Wall-clock driven calibration cycle.
//!
//! Once an hour the noise source is expected to be switched on during
//! minute 1 and off during minute 2. The cycle snapshots the uncalibrated
//! composite in each of those minutes and recomputes coefficients in minute
//! 3. Every replica keys off the same absolute minutes, so no coordination
//! is needed between them.

use crate::calibration::ReferenceSink;

const MINUTE_ON: u32 = 1;
const MINUTE_OFF: u32 = 2;
const MINUTE_RECOMPUTE: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    CapturingOn,
    CapturingOff,
    Recomputing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEvent {
    Started,
    SavedOn,
    SavedOff,
    Recomputed,
    /// The window closed before both references were captured. The cycle
    /// is abandoned and the previous coefficients stay in effect.
    Incomplete { saved_on: bool, saved_off: bool },
}

#[derive(Debug)]
pub struct CalibrationCycle {
    phase: CyclePhase,
    saved_on: bool,
    saved_off: bool,
    incomplete: u64,
}

impl Default for CalibrationCycle {
    fn default() -> Self {
        Self::new()
    }
}

impl CalibrationCycle {
    /// A cycle armed for the next minute-1 window.
    pub fn new() -> Self {
        Self {
            phase: CyclePhase::Idle,
            saved_on: false,
            saved_off: false,
            incomplete: 0,
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn saved_on(&self) -> bool {
        self.saved_on
    }

    pub fn saved_off(&self) -> bool {
        self.saved_off
    }

    pub fn in_cycle(&self) -> bool {
        self.phase != CyclePhase::Idle
    }

    /// Number of cycles abandoned because their window closed.
    pub fn incomplete_count(&self) -> u64 {
        self.incomplete
    }

    /// Evaluate one tick. `spectrum` is the flattened, uncalibrated
    /// composite for this tick.
    pub fn step<S: ReferenceSink>(
        &mut self,
        minute: u32,
        spectrum: &[f32],
        sink: &mut S,
    ) -> Vec<CycleEvent> {
        let mut events = Vec::new();

        if minute == MINUTE_ON && self.phase == CyclePhase::Idle && !self.saved_on {
            self.phase = CyclePhase::CapturingOn;
            events.push(CycleEvent::Started);
        }

        if self.phase == CyclePhase::CapturingOn && minute == MINUTE_ON && !self.saved_on {
            sink.capture_on(spectrum);
            self.saved_on = true;
            self.phase = CyclePhase::CapturingOff;
            events.push(CycleEvent::SavedOn);
        }

        if self.in_cycle() && minute == MINUTE_OFF && !self.saved_off {
            sink.capture_off(spectrum);
            self.saved_off = true;
            self.phase = CyclePhase::Recomputing;
            events.push(CycleEvent::SavedOff);
        }

        if self.in_cycle() && minute == MINUTE_RECOMPUTE {
            sink.recompute();
            self.reset();
            events.push(CycleEvent::Recomputed);
        }

        // Only minute 3 recomputes. With both references saved the cycle
        // waits for the next minute-3 tick.
        if self.in_cycle() && minute > MINUTE_RECOMPUTE && !(self.saved_on && self.saved_off) {
            self.incomplete += 1;
            events.push(CycleEvent::Incomplete {
                saved_on: self.saved_on,
                saved_off: self.saved_off,
            });
            self.reset();
        }

        events
    }

    fn reset(&mut self) {
        self.phase = CyclePhase::Idle;
        self.saved_on = false;
        self.saved_off = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingSink {
        on: Vec<Vec<f32>>,
        off: Vec<Vec<f32>>,
        recomputes: usize,
    }

    impl ReferenceSink for CountingSink {
        fn capture_on(&mut self, spectrum: &[f32]) {
            self.on.push(spectrum.to_vec());
        }
        fn capture_off(&mut self, spectrum: &[f32]) {
            self.off.push(spectrum.to_vec());
        }
        fn recompute(&mut self) {
            self.recomputes += 1;
        }
    }

    #[test]
    fn test_full_cycle() {
        let mut cycle = CalibrationCycle::new();
        let mut sink = CountingSink::default();

        let e = cycle.step(1, &[1.0], &mut sink);
        assert_eq!(e, vec![CycleEvent::Started, CycleEvent::SavedOn]);
        assert_eq!(cycle.phase(), CyclePhase::CapturingOff);

        assert!(cycle.step(1, &[1.5], &mut sink).is_empty());

        let e = cycle.step(2, &[2.0], &mut sink);
        assert_eq!(e, vec![CycleEvent::SavedOff]);
        assert_eq!(cycle.phase(), CyclePhase::Recomputing);

        let e = cycle.step(3, &[3.0], &mut sink);
        assert_eq!(e, vec![CycleEvent::Recomputed]);

        assert_eq!(sink.on, vec![vec![1.0]]);
        assert_eq!(sink.off, vec![vec![2.0]]);
        assert_eq!(sink.recomputes, 1);
        assert_eq!(cycle.phase(), CyclePhase::Idle);
        assert!(!cycle.saved_on() && !cycle.saved_off());
        assert_eq!(cycle.incomplete_count(), 0);
    }

    #[test]
    fn test_skipped_window_signals_once() {
        let mut cycle = CalibrationCycle::new();
        let mut sink = CountingSink::default();

        cycle.step(1, &[1.0], &mut sink);
        let e = cycle.step(5, &[5.0], &mut sink);
        assert_eq!(
            e,
            vec![CycleEvent::Incomplete { saved_on: true, saved_off: false }]
        );
        assert_eq!(cycle.phase(), CyclePhase::Idle);

        for minute in 6..60 {
            assert!(cycle.step(minute, &[0.0], &mut sink).is_empty());
        }
        assert_eq!(cycle.incomplete_count(), 1);
        assert_eq!(sink.recomputes, 0);
        assert!(sink.off.is_empty());
    }

    #[test]
    fn test_next_hour_starts_again() {
        let mut cycle = CalibrationCycle::new();
        let mut sink = CountingSink::default();

        for minute in [1, 2, 3, 30, 59, 0, 1, 2, 3] {
            cycle.step(minute, &[minute as f32], &mut sink);
        }
        assert_eq!(sink.on.len(), 2);
        assert_eq!(sink.off.len(), 2);
        assert_eq!(sink.recomputes, 2);
    }

    #[test]
    fn test_idle_outside_window() {
        let mut cycle = CalibrationCycle::new();
        let mut sink = CountingSink::default();
        for minute in [0, 2, 3, 4, 45] {
            assert!(cycle.step(minute, &[0.0], &mut sink).is_empty());
        }
        assert_eq!(cycle.phase(), CyclePhase::Idle);
    }

    #[test]
    fn test_no_recompute_after_minute_three() {
        let mut cycle = CalibrationCycle::new();
        let mut sink = CountingSink::default();
        cycle.step(1, &[1.0], &mut sink);
        cycle.step(2, &[2.0], &mut sink);

        for minute in [4, 10, 59, 0, 1, 2] {
            assert!(cycle.step(minute, &[0.0], &mut sink).is_empty(), "minute {}", minute);
        }
        assert_eq!(sink.recomputes, 0);
        assert_eq!(cycle.incomplete_count(), 0);
        assert_eq!(cycle.phase(), CyclePhase::Recomputing);
        assert!(cycle.saved_on() && cycle.saved_off());
        // The next hour's captures are suppressed by the held flags.
        assert_eq!(sink.on.len(), 1);
        assert_eq!(sink.off.len(), 1);

        assert_eq!(cycle.step(3, &[3.0], &mut sink), vec![CycleEvent::Recomputed]);
        assert_eq!(sink.recomputes, 1);
        assert_eq!(cycle.phase(), CyclePhase::Idle);
    }

    #[test]
    fn test_recompute_without_off_capture() {
        // Minute 2 never ticked; minute 3 still closes the cycle.
        let mut cycle = CalibrationCycle::new();
        let mut sink = CountingSink::default();
        cycle.step(1, &[1.0], &mut sink);
        let e = cycle.step(3, &[3.0], &mut sink);
        assert_eq!(e, vec![CycleEvent::Recomputed]);
        assert!(sink.off.is_empty());
        assert_eq!(cycle.phase(), CyclePhase::Idle);
    }
}
