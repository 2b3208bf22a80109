use std::f64::consts::PI;
use std::time::Duration;

use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use rf_dsp::fft::ShiftedFft;
use rf_output::{FrameTimestamp, IntegrationFrame};

use crate::config::Config;
use crate::provider::{ChannelTarget, DataProvider, Emitter, ProviderState};

/// Unmodulated carriers, Hz.
const CARRIERS: [f64; 6] = [0.25e9, 0.85e9, 1e9, 1.2e9, 1.3e9, 1.55e9];

/// FM signals as (carrier, occupied bandwidth), Hz.
const FM_SIGNALS: [(f64, f64); 7] = [
    (0.3e9, 200e3),
    (0.5e9, 10e6),
    (0.9e9, 10e6),
    (1.1e9, 10e6),
    (1.25e9, 35e6),
    (1.4e9, 200e3),
    (1.5e9, 20e6),
];

/// Modulating tone of the FM signals.
const FM_TONE_HZ: f64 = 1e5;

/// Synthetic wideband scene: complex Gaussian noise plus fixed carriers and
/// FM signals, shifted down by half the bandwidth so the band sits around DC.
pub struct SpectrumGenerator {
    rng: StdRng,
    carriers: Vec<f64>,
    fm: Vec<(f64, f64)>,
    t_int: f64,
    t_offset: f64,
    fft: ShiftedFft,
    buffer: Vec<Complex32>,
}

impl SpectrumGenerator {
    /// `seed = None` draws a seed from the OS.
    pub fn new(n_bins: usize, t_int: f64, bandwidth_hz: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let shift = bandwidth_hz / 2.0;
        Self {
            rng,
            carriers: CARRIERS.iter().map(|fc| fc - shift).collect(),
            fm: FM_SIGNALS.iter().map(|&(fc, bw)| (fc - shift, bw)).collect(),
            t_int,
            t_offset: 0.0,
            fft: ShiftedFft::new(n_bins),
            buffer: vec![Complex32::new(0.0, 0.0); n_bins],
        }
    }

    /// Next magnitude spectrum, normalised so its peak is 1.
    pub fn next_spectrum(&mut self) -> Vec<f32> {
        let n = self.buffer.len();
        let dt = if n > 1 { self.t_int / (n - 1) as f64 } else { 0.0 };

        for (i, out) in self.buffer.iter_mut().enumerate() {
            let t = self.t_offset + i as f64 * dt;
            let re: f64 = StandardNormal.sample(&mut self.rng);
            let im: f64 = StandardNormal.sample(&mut self.rng);
            let mut acc = (re, im);

            for &fc in &self.carriers {
                let phase = 2.0 * PI * (fc * t).fract();
                acc.0 += phase.cos();
                acc.1 += phase.sin();
            }
            for &(fc, bw) in &self.fm {
                let beta = (bw / 2.0) / FM_TONE_HZ;
                let tone = (2.0 * PI * (FM_TONE_HZ * t).fract()).cos();
                let phase = 2.0 * PI * (fc * t).fract() + beta * tone;
                acc.0 += phase.cos();
                acc.1 += phase.sin();
            }
            *out = Complex32::new(acc.0 as f32, acc.1 as f32);
        }
        self.t_offset += self.t_int;

        self.fft.process(&mut self.buffer);
        let mut mags: Vec<f32> = self.buffer.iter().map(|x| x.norm()).collect();
        let peak = mags.iter().cloned().fold(0.0f32, f32::max);
        if peak > 0.0 {
            mags.iter_mut().for_each(|m| *m /= peak);
        }
        mags
    }
}

/// Map a normalised magnitude in `[0, 1]` to a level between `min_db` and
/// `max_db`, in centi-dB.
pub fn level_centibels(normalized: f32, min_db: f64, max_db: f64) -> f64 {
    let lo = 10f64.powf(min_db / 10.0);
    let hi = 10f64.powf(max_db / 10.0);
    let p = (normalized as f64).clamp(0.0, 1.0);
    1000.0 * (lo + p * (hi - lo)).log10()
}

pub struct SimProvider {
    generator: SpectrumGenerator,
    min_db: f64,
    max_db: f64,
    period: Duration,
    target: ChannelTarget,
    emitter: Option<Emitter>,
    state: ProviderState,
    frames: u64,
}

impl SimProvider {
    pub fn new(config: &Config, seed: Option<u64>, target: ChannelTarget) -> Self {
        Self {
            generator: SpectrumGenerator::new(
                config.n_bins,
                config.integration_secs,
                config.radio.bandwidth_hz,
                seed,
            ),
            min_db: config.output.spectra_min_db,
            max_db: config.output.spectra_max_db,
            period: Duration::from_secs_f64(config.integration_secs),
            target,
            emitter: None,
            state: ProviderState::Disconnected,
            frames: 0,
        }
    }

    /// Next frame's bins, without a timestamp.
    pub fn next_bins(&mut self) -> Vec<i16> {
        self.generator
            .next_spectrum()
            .into_iter()
            .map(|p| level_centibels(p, self.min_db, self.max_db) as i16)
            .collect()
    }
}

impl DataProvider for SimProvider {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn state(&self) -> ProviderState {
        self.state
    }

    fn connect(&mut self) -> Result<(), String> {
        self.emitter = Some(Emitter::connect(&self.target)?);
        self.state = ProviderState::Connected;
        Ok(())
    }

    fn start(&mut self) -> Result<(), String> {
        self.state = ProviderState::Streaming;
        Ok(())
    }

    fn get_integration(&mut self) -> Result<Option<IntegrationFrame>, String> {
        let bins = self.next_bins();
        self.frames += 1;
        Ok(Some(IntegrationFrame::new(
            FrameTimestamp::Millis(crate::provider::unix_millis()),
            bins,
        )))
    }

    fn emitter(&mut self) -> Option<&mut Emitter> {
        self.emitter.as_mut()
    }

    fn pacing(&self) -> Option<Duration> {
        Some(self.period)
    }

    fn stop(&mut self) {
        if self.state != ProviderState::Stopped {
            let emitted = self.emitter.as_ref().map(|e| e.stats()).unwrap_or_default();
            log::info!(
                "sim: {} frames, {} emitted, {} emit failures",
                self.frames,
                emitted.emitted,
                emitted.failed
            );
        }
        self.state = ProviderState::Stopped;
    }
}
