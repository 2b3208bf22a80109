// Copyright 2025-2026 CEMAXECUTER LLC

//! Composite spectrum assembly from per-slot wideband fragments.

use byteorder::{ByteOrder, LittleEndian};

/// Log-power written for non-positive or non-finite fragment samples.
pub const POWER_FLOOR_DB: f32 = -200.0;

/// Geometry of the composite spectrum and its fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeLayout {
    /// Number of slots (rows) in the composite.
    pub slots: usize,
    /// Bins kept per slot after the guard band is trimmed.
    pub bins_per_slot: usize,
    /// Samples trimmed from each edge of an incoming fragment.
    pub fragment_guard: usize,
    /// Left rotation applied to the flattened spectrum.
    pub rotation: usize,
    /// First slot accepted for assembly.
    pub first_slot: usize,
    /// One past the last slot accepted for assembly.
    pub end_slot: usize,
}

impl Default for CompositeLayout {
    fn default() -> Self {
        Self {
            slots: 16,
            bins_per_slot: 37_500,
            fragment_guard: 1_250,
            rotation: 18_750,
            first_slot: 2,
            end_slot: 15,
        }
    }
}

impl CompositeLayout {
    pub fn total_bins(&self) -> usize {
        self.slots * self.bins_per_slot
    }

    /// Expected raw fragment length before trimming.
    pub fn fragment_len(&self) -> usize {
        self.bins_per_slot + 2 * self.fragment_guard
    }

    pub fn accepts(&self, slot: usize) -> bool {
        slot >= self.first_slot && slot < self.end_slot && slot < self.slots
    }
}

/// `10 * log10(v)` with non-positive and non-finite input clamped to
/// [`POWER_FLOOR_DB`].
pub fn log_power(v: f32) -> f32 {
    if !v.is_finite() || v <= 0.0 {
        return POWER_FLOOR_DB;
    }
    (10.0 * v.log10()).max(POWER_FLOOR_DB)
}

/// Decode a stored fragment: little-endian i64 magnitudes.
pub fn decode_fragment(bytes: &[u8]) -> Result<Vec<f32>, String> {
    if bytes.len() % 8 != 0 {
        return Err(format!(
            "fragment of {} bytes is not a whole number of i64 samples",
            bytes.len()
        ));
    }
    let mut raw = vec![0i64; bytes.len() / 8];
    LittleEndian::read_i64_into(bytes, &mut raw);
    Ok(raw.into_iter().map(|v| v as f32).collect())
}

/// Slots x bins of log-power, overwritten in place one slot at a time.
pub struct CompositeSpectrum {
    layout: CompositeLayout,
    data: Vec<f32>,
}

impl CompositeSpectrum {
    pub fn new(layout: CompositeLayout) -> Self {
        Self {
            data: vec![0.0; layout.total_bins()],
            layout,
        }
    }

    pub fn layout(&self) -> &CompositeLayout {
        &self.layout
    }

    /// Store a raw fragment into `slot`.
    ///
    /// Returns `Ok(false)` without touching the buffer when the slot is not
    /// accepted for assembly.
    pub fn write(&mut self, slot: usize, raw: &[f32]) -> Result<bool, String> {
        if !self.layout.accepts(slot) {
            return Ok(false);
        }
        let guard = self.layout.fragment_guard;
        if raw.len() != self.layout.fragment_len() {
            return Err(format!(
                "slot {}: fragment has {} samples, expected {}",
                slot,
                raw.len(),
                self.layout.fragment_len()
            ));
        }
        let trimmed = &raw[guard..raw.len() - guard];
        let row = self.slot_mut(slot);
        for (dst, &src) in row.iter_mut().zip(trimmed) {
            *dst = log_power(src);
        }
        Ok(true)
    }

    pub fn slot(&self, slot: usize) -> &[f32] {
        let b = self.layout.bins_per_slot;
        &self.data[slot * b..(slot + 1) * b]
    }

    fn slot_mut(&mut self, slot: usize) -> &mut [f32] {
        let b = self.layout.bins_per_slot;
        &mut self.data[slot * b..(slot + 1) * b]
    }

    /// Full-band spectrum: rows concatenated, then rotated left so the band
    /// starts at bin 0. Stale rows are read as-is.
    pub fn flatten(&self) -> Vec<f32> {
        let mut full = self.data.clone();
        if !full.is_empty() {
            let shift = self.layout.rotation % full.len();
            full.rotate_left(shift);
        }
        full
    }
}
