// Copyright 2025-2026 CEMAXECUTER LLC

//! Noise-source calibration of composite spectra.
//!
//! Two reference captures are kept, one with the calibration noise source
//! switched on and one with it off. The per-bin coefficient is the ratio of
//! the source's expected excess level to the excess actually measured, so a
//! bin that reads the diode exactly right gets 1.0. References are stored
//! as flat little-endian f32 dumps and survive restarts.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

/// Measured excess below this magnitude is treated as "no signal".
const MIN_EXCESS_DB: f32 = 1e-6;

/// Reference power for the output level: 1000 * log10(x / 1 mW).
const OUTPUT_REFERENCE: f64 = 0.001;

/// Output level for bins with non-positive or non-finite power.
pub const LEVEL_FLOOR: i16 = -30_000;

pub const NOISE_ON_FILE: &str = "noise_on.dat";
pub const NOISE_OFF_FILE: &str = "noise_off.dat";

/// `n` evenly spaced points over `[start, stop]`, endpoints included.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Calibrated noise diode: excess noise ratio in dB, linear in frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseSource {
    pub enr_db: f64,
    pub slope_db_per_ghz: f64,
}

impl Default for NoiseSource {
    fn default() -> Self {
        Self {
            enr_db: 15.0,
            slope_db_per_ghz: 0.0,
        }
    }
}

impl NoiseSource {
    pub fn excess_db(&self, freq_hz: f64) -> f64 {
        self.enr_db + self.slope_db_per_ghz * freq_hz / 1e9
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationReference {
    pub on: Vec<f32>,
    pub off: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationCoefficients(Vec<f32>);

impl CalibrationCoefficients {
    /// Coefficients that leave a spectrum unchanged.
    pub fn identity(len: usize) -> Self {
        Self(vec![1.0; len])
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Derive per-bin coefficients from an on/off reference pair.
///
/// Output length follows `freq_axis`. Bins missing from either reference,
/// or whose measured excess is degenerate, get 1.0.
pub fn compute_coefficients(
    freq_axis: &[f64],
    on: &[f32],
    off: &[f32],
    source: &NoiseSource,
) -> CalibrationCoefficients {
    let coeffs = freq_axis
        .iter()
        .enumerate()
        .map(|(i, &freq)| match (on.get(i), off.get(i)) {
            (Some(&p_on), Some(&p_off)) => {
                let measured = p_on - p_off;
                if !measured.is_finite() || measured.abs() < MIN_EXCESS_DB {
                    1.0
                } else {
                    (source.excess_db(freq) as f32) / measured
                }
            }
            _ => 1.0,
        })
        .collect();
    CalibrationCoefficients(coeffs)
}

/// Elementwise correction. Bins beyond the coefficient length pass through.
pub fn apply(spectrum: &[f32], coefficients: &CalibrationCoefficients) -> Vec<f32> {
    spectrum
        .iter()
        .enumerate()
        .map(|(i, &v)| v * coefficients.as_slice().get(i).copied().unwrap_or(1.0))
        .collect()
}

/// Convert a calibrated spectrum into integration bins.
///
/// Trims `guard` bins from each end, then maps each value to
/// `1000 * log10(x / 1 mW)`, saturating to i16. Non-positive or non-finite
/// values read as [`LEVEL_FLOOR`].
pub fn to_integration_bins(calibrated: &[f32], guard: usize) -> Vec<i16> {
    if calibrated.len() <= 2 * guard {
        return Vec::new();
    }
    calibrated[guard..calibrated.len() - guard]
        .iter()
        .map(|&x| {
            let x = x as f64;
            if !x.is_finite() || x <= 0.0 {
                return LEVEL_FLOOR;
            }
            let level = 1000.0 * (x / OUTPUT_REFERENCE).log10();
            level.clamp(i16::MIN as f64, i16::MAX as f64) as i16
        })
        .collect()
}

pub fn read_f32_dump(path: &Path) -> io::Result<Vec<f32>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    if bytes.len() % 4 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: {} bytes is not a whole number of f32", path.display(), bytes.len()),
        ));
    }
    let mut out = vec![0.0f32; bytes.len() / 4];
    LittleEndian::read_f32_into(&bytes, &mut out);
    Ok(out)
}

pub fn write_f32_dump(path: &Path, data: &[f32]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for &v in data {
        writer.write_f32::<LittleEndian>(v)?;
    }
    writer.flush()
}

/// Locations of the two persisted reference buffers.
#[derive(Debug, Clone)]
pub struct ReferenceFiles {
    pub on: PathBuf,
    pub off: PathBuf,
}

impl ReferenceFiles {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            on: dir.join(NOISE_ON_FILE),
            off: dir.join(NOISE_OFF_FILE),
        }
    }

    /// Fails if either file is missing or unreadable.
    pub fn load(&self) -> io::Result<CalibrationReference> {
        Ok(CalibrationReference {
            on: read_f32_dump(&self.on)?,
            off: read_f32_dump(&self.off)?,
        })
    }
}

/// Hook used by the calibration cycle to capture references and
/// recompute coefficients.
pub trait ReferenceSink {
    fn capture_on(&mut self, spectrum: &[f32]);
    fn capture_off(&mut self, spectrum: &[f32]);
    fn recompute(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalibrationStats {
    pub captures: u64,
    pub recomputes: u64,
    pub persist_failures: u64,
}

/// Owns the references and coefficients for one backend instance.
pub struct CalibrationEngine {
    files: ReferenceFiles,
    freq_axis: Vec<f64>,
    source: NoiseSource,
    reference: CalibrationReference,
    coefficients: CalibrationCoefficients,
    dirty_on: bool,
    dirty_off: bool,
    stats: CalibrationStats,
}

impl CalibrationEngine {
    /// Build an engine from persisted references. When they cannot be
    /// loaded the engine starts on identity coefficients.
    pub fn start(files: ReferenceFiles, freq_axis: Vec<f64>, source: NoiseSource) -> Self {
        let mut engine = Self {
            coefficients: CalibrationCoefficients::identity(freq_axis.len()),
            files,
            freq_axis,
            source,
            reference: CalibrationReference::default(),
            dirty_on: false,
            dirty_off: false,
            stats: CalibrationStats::default(),
        };

        match engine.load_references() {
            Ok(reference) => {
                if reference.on.len() != engine.freq_axis.len()
                    || reference.off.len() != engine.freq_axis.len()
                {
                    log::warn!(
                        "calibration references have {}/{} bins, expected {}",
                        reference.on.len(),
                        reference.off.len(),
                        engine.freq_axis.len()
                    );
                }
                log::info!(
                    "loaded calibration references from {} and {}",
                    engine.files.on.display(),
                    engine.files.off.display()
                );
                engine.reference = reference;
                engine.coefficients = compute_coefficients(
                    &engine.freq_axis,
                    &engine.reference.on,
                    &engine.reference.off,
                    &engine.source,
                );
            }
            Err(e) => {
                log::warn!(
                    "no usable calibration references ({}), using identity coefficients until the next capture",
                    e
                );
            }
        }
        engine
    }

    pub fn load_references(&self) -> io::Result<CalibrationReference> {
        self.files.load()
    }

    pub fn has_references(&self) -> bool {
        !self.reference.on.is_empty() && !self.reference.off.is_empty()
    }

    pub fn reference(&self) -> &CalibrationReference {
        &self.reference
    }

    pub fn coefficients(&self) -> &CalibrationCoefficients {
        &self.coefficients
    }

    pub fn stats(&self) -> CalibrationStats {
        self.stats
    }

    pub fn apply(&self, spectrum: &[f32]) -> Vec<f32> {
        apply(spectrum, &self.coefficients)
    }

    /// Rewrite any reference whose last persist failed.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.dirty_on {
            write_f32_dump(&self.files.on, &self.reference.on)?;
            self.dirty_on = false;
        }
        if self.dirty_off {
            write_f32_dump(&self.files.off, &self.reference.off)?;
            self.dirty_off = false;
        }
        Ok(())
    }

    fn persist(path: &Path, data: &[f32], stats: &mut CalibrationStats) -> bool {
        match write_f32_dump(path, data) {
            Ok(()) => {
                log::info!("saved calibration reference {}", path.display());
                false
            }
            Err(e) => {
                stats.persist_failures += 1;
                log::error!("failed to save {}: {}", path.display(), e);
                true
            }
        }
    }
}

impl ReferenceSink for CalibrationEngine {
    fn capture_on(&mut self, spectrum: &[f32]) {
        self.reference.on = spectrum.to_vec();
        self.stats.captures += 1;
        self.dirty_on = Self::persist(&self.files.on, &self.reference.on, &mut self.stats);
    }

    fn capture_off(&mut self, spectrum: &[f32]) {
        self.reference.off = spectrum.to_vec();
        self.stats.captures += 1;
        self.dirty_off = Self::persist(&self.files.off, &self.reference.off, &mut self.stats);
    }

    fn recompute(&mut self) {
        self.coefficients = compute_coefficients(
            &self.freq_axis,
            &self.reference.on,
            &self.reference.off,
            &self.source,
        );
        self.stats.recomputes += 1;
        log::info!("recomputed {} calibration coefficients", self.coefficients.len());
    }
}
