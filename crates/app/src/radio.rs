use std::time::Duration;

use num_complex::Complex32;

use rf_dsp::fft::Periodogram;
use rf_output::{FrameTimestamp, IntegrationFrame};
use rf_sdr::RadioSource;

use crate::config::Config;
use crate::provider::{ChannelTarget, DataProvider, Emitter, ProviderState};

/// Receive calls without a sample before a tick gives up and lets the run
/// loop check for interruption. Collected samples are kept for the next tick.
const MAX_EMPTY_RECEIVES: u32 = 32;

pub type RadioOpener = Box<dyn FnMut() -> Result<Box<dyn RadioSource>, String> + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RadioStats {
    pub frames: u64,
    pub recv_errors: u64,
    pub last_error: Option<i32>,
}

/// Live front-end: one Hamming-windowed periodogram per tick.
pub struct RadioProvider {
    opener: RadioOpener,
    radio: Option<Box<dyn RadioSource>>,
    target: ChannelTarget,
    emitter: Option<Emitter>,
    state: ProviderState,
    period: Duration,
    periodogram: Periodogram,
    samples: Vec<Complex32>,
    filled: usize,
    stats: RadioStats,
}

impl RadioProvider {
    pub fn new(config: &Config, opener: RadioOpener, target: ChannelTarget) -> Self {
        Self {
            opener,
            radio: None,
            target,
            emitter: None,
            state: ProviderState::Disconnected,
            period: Duration::from_secs_f64(config.integration_secs),
            periodogram: Periodogram::new(config.n_bins),
            samples: vec![Complex32::new(0.0, 0.0); config.n_bins],
            filled: 0,
            stats: RadioStats::default(),
        }
    }

    pub fn stats(&self) -> RadioStats {
        self.stats
    }
}

impl DataProvider for RadioProvider {
    fn name(&self) -> &'static str {
        "radio"
    }

    fn state(&self) -> ProviderState {
        self.state
    }

    fn connect(&mut self) -> Result<(), String> {
        let radio = (self.opener)()?;
        log::info!(
            "radio open: {:.3} MHz center, {:.3} MS/s, {} bins",
            radio.center_frequency() / 1e6,
            radio.sample_rate() / 1e6,
            self.periodogram.size()
        );
        self.radio = Some(radio);
        self.emitter = Some(Emitter::connect(&self.target)?);
        self.state = ProviderState::Connected;
        Ok(())
    }

    fn start(&mut self) -> Result<(), String> {
        let radio = self
            .radio
            .as_mut()
            .ok_or_else(|| "radio not connected".to_string())?;
        radio.start_streaming()?;
        self.state = ProviderState::Streaming;
        Ok(())
    }

    fn get_integration(&mut self) -> Result<Option<IntegrationFrame>, String> {
        let radio = self
            .radio
            .as_mut()
            .ok_or_else(|| "radio not connected".to_string())?;

        let mut empty = 0;
        while self.filled < self.samples.len() {
            match radio.recv_into(&mut self.samples[self.filled..]) {
                Ok(0) => empty += 1,
                Ok(n) => {
                    self.filled += n;
                    empty = 0;
                }
                Err(code) => {
                    self.stats.recv_errors += 1;
                    self.stats.last_error = Some(code);
                    log::warn!("radio receive error {}", code);
                    empty += 1;
                }
            }
            if empty >= MAX_EMPTY_RECEIVES {
                log::debug!(
                    "radio starved after {} of {} samples",
                    self.filled,
                    self.samples.len()
                );
                return Ok(None);
            }
        }

        self.filled = 0;
        let bins = self.periodogram.process(&self.samples);
        self.stats.frames += 1;
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
        if let Some(radio) = self.radio.as_mut() {
            radio.stop_streaming();
        }
        if self.state != ProviderState::Stopped {
            let emitted = self.emitter.as_ref().map(|e| e.stats()).unwrap_or_default();
            log::info!(
                "radio: {} frames, {} emitted, {} emit failures, {} receive errors",
                self.stats.frames,
                emitted.emitted,
                emitted.failed,
                self.stats.recv_errors
            );
        }
        self.state = ProviderState::Stopped;
    }
}

/// Open the configured UHD device.
#[cfg(feature = "usrp")]
pub fn usrp_opener(config: &Config) -> RadioOpener {
    use rf_sdr::usrp::{UsrpConfig, UsrpRadio};

    let usrp = UsrpConfig {
        device_args: config.radio.device_args.clone(),
        sample_rate: config.radio.bandwidth_hz,
        center_freq: config.radio.center_freq_hz(),
        gain: config.radio.gain_db,
    };
    Box::new(move || {
        let radio = UsrpRadio::open(&usrp)?;
        Ok(Box::new(radio) as Box<dyn RadioSource>)
    })
}

#[cfg(not(feature = "usrp"))]
pub fn usrp_opener(_config: &Config) -> RadioOpener {
    Box::new(|| Err("built without USRP support (enable the usrp feature)".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rf_output::RecordingChannel;
    use std::sync::{Arc, Mutex};

    /// Delivers a DC tone in `chunk`-sized pieces, failing on scheduled calls.
    struct ToneRadio {
        chunk: usize,
        calls: usize,
        fail_calls: Vec<usize>,
        silent: bool,
        streaming: Arc<Mutex<bool>>,
    }

    impl RadioSource for ToneRadio {
        fn start_streaming(&mut self) -> Result<(), String> {
            *self.streaming.lock().unwrap() = true;
            Ok(())
        }

        fn stop_streaming(&mut self) {
            *self.streaming.lock().unwrap() = false;
        }

        fn recv_into(&mut self, buf: &mut [Complex32]) -> Result<usize, i32> {
            self.calls += 1;
            if self.fail_calls.contains(&self.calls) {
                return Err(8);
            }
            if self.silent {
                return Ok(0);
            }
            let n = buf.len().min(self.chunk);
            buf[..n].fill(Complex32::new(0.5, 0.0));
            Ok(n)
        }

        fn sample_rate(&self) -> f64 {
            1e6
        }

        fn center_frequency(&self) -> f64 {
            100e6
        }
    }

    fn provider_with(radio: ToneRadio, rec: &RecordingChannel) -> RadioProvider {
        let config = Config {
            n_bins: 64,
            ..Config::default()
        };
        let mut slot = Some(radio);
        let opener: RadioOpener = Box::new(move || {
            slot.take()
                .map(|r| Box::new(r) as Box<dyn RadioSource>)
                .ok_or_else(|| "already opened".to_string())
        });
        RadioProvider::new(&config, opener, ChannelTarget::Recording(rec.clone()))
    }

    #[test]
    fn test_collects_full_buffer_across_errors() {
        let streaming = Arc::new(Mutex::new(false));
        let rec = RecordingChannel::new();
        let mut provider = provider_with(
            ToneRadio {
                chunk: 10,
                calls: 0,
                fail_calls: vec![2, 3],
                silent: false,
                streaming: streaming.clone(),
            },
            &rec,
        );
        provider.connect().unwrap();
        provider.start().unwrap();
        assert!(*streaming.lock().unwrap());

        let frame = provider.get_integration().unwrap().unwrap();
        assert_eq!(frame.bins.len(), 64);
        // DC lands in the middle bin: |0.5 * sum(hamming)|^2 = 17.05^2
        assert!((frame.bins[32] as i32 - 2463).abs() <= 2, "{}", frame.bins[32]);
        assert!(matches!(frame.timestamp, FrameTimestamp::Millis(ms) if ms > 0.0));

        let stats = provider.stats();
        assert_eq!(stats.recv_errors, 2);
        assert_eq!(stats.last_error, Some(8));
        assert_eq!(stats.frames, 1);

        assert!(provider.emit_integration(&frame));
        assert_eq!(rec.len(), 1);

        provider.stop();
        assert!(!*streaming.lock().unwrap());
        assert_eq!(provider.state(), ProviderState::Stopped);
    }

    #[test]
    fn test_starved_radio_yields_no_frame() {
        let rec = RecordingChannel::new();
        let mut provider = provider_with(
            ToneRadio {
                chunk: 10,
                calls: 0,
                fail_calls: vec![],
                silent: true,
                streaming: Arc::new(Mutex::new(false)),
            },
            &rec,
        );
        provider.connect().unwrap();
        provider.start().unwrap();
        assert_eq!(provider.get_integration().unwrap(), None);
    }

    #[test]
    fn test_open_failure_surfaces_from_connect() {
        let rec = RecordingChannel::new();
        let mut provider = provider_with(
            ToneRadio {
                chunk: 1,
                calls: 0,
                fail_calls: vec![],
                silent: false,
                streaming: Arc::new(Mutex::new(false)),
            },
            &rec,
        );
        provider.connect().unwrap();
        assert!(provider.connect().is_err());
    }

    #[test]
    fn test_get_integration_requires_connect() {
        let rec = RecordingChannel::new();
        let mut provider = provider_with(
            ToneRadio {
                chunk: 1,
                calls: 0,
                fail_calls: vec![],
                silent: false,
                streaming: Arc::new(Mutex::new(false)),
            },
            &rec,
        );
        assert!(provider.start().is_err());
        assert!(provider.get_integration().is_err());
    }
}
