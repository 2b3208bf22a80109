// Copyright 2025-2026 CEMAXECUTER LLC

use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

use crate::window;

/// Forward FFT followed by an fftshift, so bin `size / 2` holds DC and the
/// spectrum reads from the lowest to the highest frequency.
pub struct ShiftedFft {
    fft: Arc<dyn Fft<f32>>,
    size: usize,
    scratch: Vec<Complex32>,
}

impl ShiftedFft {
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(size);
        let scratch_len = fft.get_inplace_scratch_len();
        Self {
            fft,
            size,
            scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
        }
    }

    /// In-place FFT + shift on a buffer of exactly `size` complex samples.
    pub fn process(&mut self, buffer: &mut [Complex32]) {
        assert_eq!(
            buffer.len(),
            self.size,
            "buffer length {} != FFT size {}",
            buffer.len(),
            self.size
        );
        self.fft.process_with_scratch(buffer, &mut self.scratch);
        fft_shift(buffer);
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Swap the two halves of a spectrum so the zero-frequency bin lands in
/// the middle (same convention as numpy's `fftshift`).
pub fn fft_shift<T>(buf: &mut [T]) {
    let half = buf.len() / 2;
    buf.rotate_right(half);
}

/// Hamming-windowed power spectral density in centi-dB units.
///
/// Each output bin is `|1000 * log10(|X|^2)|` truncated to i16. Empty bins
/// (log of zero) and NaNs read as 0 rather than saturating.
pub struct Periodogram {
    fft: ShiftedFft,
    window: Vec<f32>,
    buffer: Vec<Complex32>,
}

impl Periodogram {
    pub fn new(size: usize) -> Self {
        Self {
            fft: ShiftedFft::new(size),
            window: window::hamming(size),
            buffer: vec![Complex32::new(0.0, 0.0); size],
        }
    }

    pub fn process(&mut self, samples: &[Complex32]) -> Vec<i16> {
        let n = self.fft.size();
        for (i, slot) in self.buffer.iter_mut().enumerate() {
            *slot = samples.get(i).map_or(Complex32::new(0.0, 0.0), |s| *s * self.window[i]);
        }
        self.fft.process(&mut self.buffer);
        let mut out = Vec::with_capacity(n);
        out.extend(self.buffer.iter().map(|x| power_centibels(x.norm_sqr())));
        out
    }

    pub fn size(&self) -> usize {
        self.fft.size()
    }
}

fn power_centibels(power: f32) -> i16 {
    let level = 1000.0 * (power as f64).log10();
    if !level.is_finite() {
        return 0;
    }
    level.abs().min(i16::MAX as f64) as i16
}
