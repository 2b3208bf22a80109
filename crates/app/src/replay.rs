use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};

use rf_dsp::calcycle::{CalibrationCycle, CycleEvent};
use rf_dsp::calibration::{
    linspace, to_integration_bins, CalibrationEngine, NoiseSource, ReferenceFiles,
};
use rf_dsp::composite::{decode_fragment, CompositeLayout, CompositeSpectrum};
use rf_output::{FrameTimestamp, IntegrationFrame};
use rf_sdr::gap::GapDetector;
use rf_sdr::keys::{parse_timestamp, DecodedKey, KeyDecoder};
use rf_sdr::store::ObjectStore;
use rf_sdr::streamer::{KeyPoll, KeyStreamer, StreamerConfig};

use crate::config::Config;
use crate::provider::{ChannelTarget, DataProvider, Emitter, ProviderState};

/// How long one tick waits for a key before yielding to the run loop.
const KEY_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ReplaySettings {
    pub streamer: StreamerConfig,
    pub key_pattern: String,
    pub layout: CompositeLayout,
    pub output_guard: usize,
    pub cal_dir: PathBuf,
    pub noise_source: NoiseSource,
    pub freq_start_hz: f64,
    pub freq_stop_hz: f64,
}

impl ReplaySettings {
    pub fn from_config(config: &Config) -> Result<Self, String> {
        let start = match config.store.start.as_deref() {
            Some(s) => Some(
                parse_timestamp(s).ok_or_else(|| format!("invalid replay start time {:?}", s))?,
            ),
            None => None,
        };
        Ok(Self {
            streamer: StreamerConfig {
                key_prefix: config.store.key_prefix.clone(),
                window: Duration::from_secs(config.store.window_secs),
                start,
                queue_depth: config.store.queue_depth,
                ..StreamerConfig::default()
            },
            key_pattern: config.store.key_regex.clone(),
            layout: config.composite.layout(),
            output_guard: config.composite.output_guard,
            cal_dir: config.calibration.dir.clone(),
            noise_source: config.calibration.noise_source(),
            freq_start_hz: config.calibration.freq_start_hz,
            freq_stop_hz: config.calibration.freq_stop_hz,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub keys: u64,
    /// Keys the decoder did not recognise.
    pub skipped: u64,
    /// Recognised keys for guard slots.
    pub ignored: u64,
    pub fragments: u64,
    pub fragment_errors: u64,
    pub frames: u64,
}

/// Object-storage replay: assembles slot fragments into a composite,
/// calibrates it and flushes one frame whenever the capture time advances.
pub struct ReplayProvider {
    store: Arc<dyn ObjectStore>,
    settings: ReplaySettings,
    decoder: KeyDecoder,
    streamer: Option<KeyStreamer>,
    composite: CompositeSpectrum,
    calibration: CalibrationEngine,
    cycle: CalibrationCycle,
    gaps: GapDetector,
    /// Capture time of the composite being accumulated.
    current: Option<DateTime<Utc>>,
    target: ChannelTarget,
    emitter: Option<Emitter>,
    state: ProviderState,
    stats: ReplayStats,
}

impl ReplayProvider {
    /// Loads the calibration references right away; missing ones leave the
    /// engine on identity coefficients.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        settings: ReplaySettings,
        target: ChannelTarget,
    ) -> Result<Self, String> {
        let decoder = KeyDecoder::new(&settings.key_pattern)?;
        let freq_axis = linspace(
            settings.freq_start_hz,
            settings.freq_stop_hz,
            settings.layout.total_bins(),
        );
        let calibration = CalibrationEngine::start(
            ReferenceFiles::in_dir(&settings.cal_dir),
            freq_axis,
            settings.noise_source,
        );
        Ok(Self {
            store,
            decoder,
            streamer: None,
            composite: CompositeSpectrum::new(settings.layout),
            calibration,
            cycle: CalibrationCycle::new(),
            gaps: GapDetector::default(),
            current: None,
            target,
            emitter: None,
            state: ProviderState::Disconnected,
            stats: ReplayStats::default(),
            settings,
        })
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    pub fn calibration(&self) -> &CalibrationEngine {
        &self.calibration
    }

    pub fn cycle(&self) -> &CalibrationCycle {
        &self.cycle
    }

    pub fn drops(&self) -> u64 {
        self.gaps.drops()
    }

    /// Handle one storage key. Returns the previous composite as a frame,
    /// labelled with this key's capture time, when this key starts a later
    /// capture time.
    pub fn process_key(&mut self, key: &str) -> Option<IntegrationFrame> {
        self.stats.keys += 1;
        let Some(decoded) = self.decoder.decode(key) else {
            self.stats.skipped += 1;
            log::debug!("skipping unrecognised key {}", key);
            return None;
        };
        if !self.composite.layout().accepts(decoded.slot) {
            self.stats.ignored += 1;
            return None;
        }

        let mut frame = None;
        match self.current {
            None => self.current = Some(decoded.timestamp),
            Some(prev) => {
                if self.gaps.check(prev, decoded.timestamp).advanced {
                    frame = Some(self.flush(
                        decoded.raw_timestamp.clone(),
                        decoded.timestamp.minute(),
                    ));
                    self.current = Some(decoded.timestamp);
                }
            }
        }

        self.write_fragment(key, &decoded);
        frame
    }

    fn write_fragment(&mut self, key: &str, decoded: &DecodedKey) {
        let raw = match self.store.get(key) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.stats.fragment_errors += 1;
                log::warn!("fetching {} failed: {}", key, e);
                return;
            }
        };
        let written = decode_fragment(&raw)
            .and_then(|samples| self.composite.write(decoded.slot, &samples));
        match written {
            Ok(_) => self.stats.fragments += 1,
            Err(e) => {
                self.stats.fragment_errors += 1;
                log::warn!("dropping fragment {}: {}", key, e);
            }
        }
    }

    /// Turn the accumulated composite into a frame labelled `label`. The
    /// calibration cycle is stepped with `minute` first, so a capture
    /// sees the uncalibrated composite. The cycle only advances here: keys
    /// for guard slots and keys within the same capture time never reach it.
    fn flush(&mut self, label: String, minute: u32) -> IntegrationFrame {
        let spectrum = self.composite.flatten();

        for event in self.cycle.step(minute, &spectrum, &mut self.calibration) {
            match event {
                CycleEvent::Started => log::info!("calibration cycle started ({})", label),
                CycleEvent::SavedOn => log::info!("noise-on reference captured"),
                CycleEvent::SavedOff => log::info!("noise-off reference captured"),
                CycleEvent::Recomputed => log::info!("calibration coefficients updated"),
                CycleEvent::Incomplete { saved_on, saved_off } => log::warn!(
                    "calibration cycle ended and calibrations were not saved (on: {}, off: {}), keeping previous coefficients",
                    saved_on,
                    saved_off
                ),
            }
        }

        let calibrated = self.calibration.apply(&spectrum);
        let bins = to_integration_bins(&calibrated, self.settings.output_guard);
        self.stats.frames += 1;
        IntegrationFrame::new(FrameTimestamp::Iso(label), bins)
    }
}

impl DataProvider for ReplayProvider {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn state(&self) -> ProviderState {
        self.state
    }

    fn connect(&mut self) -> Result<(), String> {
        self.emitter = Some(Emitter::connect(&self.target)?);
        self.streamer = Some(KeyStreamer::new(
            self.store.clone(),
            self.settings.streamer.clone(),
        ));
        self.state = ProviderState::Connected;
        Ok(())
    }

    fn start(&mut self) -> Result<(), String> {
        let streamer = self
            .streamer
            .as_mut()
            .ok_or_else(|| "replay not connected".to_string())?;
        streamer.start()?;
        self.state = ProviderState::Streaming;
        Ok(())
    }

    fn get_integration(&mut self) -> Result<Option<IntegrationFrame>, String> {
        let poll = match self.streamer.as_ref() {
            Some(streamer) => streamer.next_key(KEY_POLL),
            None => return Err("replay not connected".to_string()),
        };
        match poll {
            KeyPoll::Key(key) => Ok(self.process_key(&key)),
            KeyPoll::Idle => Ok(None),
            KeyPoll::Closed => Err("key stream closed unexpectedly".to_string()),
        }
    }

    fn emitter(&mut self) -> Option<&mut Emitter> {
        self.emitter.as_mut()
    }

    fn stop(&mut self) {
        if let Some(streamer) = self.streamer.as_mut() {
            streamer.stop();
        }
        if self.state == ProviderState::Stopped {
            return;
        }
        if let Err(e) = self.calibration.flush() {
            log::error!("failed to persist calibration references: {}", e);
        }

        let emitted = self.emitter.as_ref().map(|e| e.stats()).unwrap_or_default();
        let cal = self.calibration.stats();
        log::info!(
            "replay: {} keys ({} skipped, {} guard), {} fragments ({} errors), {} frames, {} emitted, {} emit failures, {} suspected drops",
            self.stats.keys,
            self.stats.skipped,
            self.stats.ignored,
            self.stats.fragments,
            self.stats.fragment_errors,
            self.stats.frames,
            emitted.emitted,
            emitted.failed,
            self.gaps.drops()
        );
        log::info!(
            "calibration: {} captures, {} recomputes, {} incomplete cycles, {} persist failures",
            cal.captures,
            cal.recomputes,
            self.cycle.incomplete_count(),
            cal.persist_failures
        );
        self.state = ProviderState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rf_dsp::calcycle::CyclePhase;
    use rf_dsp::calibration::{read_f32_dump, LEVEL_FLOOR, NOISE_OFF_FILE, NOISE_ON_FILE};
    use rf_output::RecordingChannel;
    use rf_sdr::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use tempfile::TempDir;

    // 16 slots of 4 bins, 1-sample fragment guard: fragments are 6 samples.
    fn small_layout() -> CompositeLayout {
        CompositeLayout {
            slots: 16,
            bins_per_slot: 4,
            fragment_guard: 1,
            rotation: 2,
            first_slot: 2,
            end_slot: 15,
        }
    }

    fn settings(cal_dir: &TempDir, start: Option<DateTime<Utc>>) -> ReplaySettings {
        ReplaySettings {
            streamer: StreamerConfig {
                start,
                settle: Duration::ZERO,
                ..StreamerConfig::default()
            },
            key_pattern: rf_sdr::keys::DEFAULT_KEY_PATTERN.to_string(),
            layout: small_layout(),
            output_guard: 2,
            cal_dir: cal_dir.path().to_path_buf(),
            noise_source: NoiseSource::default(),
            freq_start_hz: 0.0,
            freq_stop_hz: 2e9,
        }
    }

    fn fragment(value: i64) -> Vec<u8> {
        (0..6).flat_map(|_| value.to_le_bytes()).collect()
    }

    fn key(ts: &str, slot: usize, channel: u32) -> String {
        format!("rfind/{}_{:02}_{}", ts, slot, channel)
    }

    fn provider(store: Arc<MemoryStore>, cal_dir: &TempDir) -> ReplayProvider {
        ReplayProvider::new(store, settings(cal_dir, None), ChannelTarget::Log).unwrap()
    }

    #[test]
    fn test_frame_flushed_when_time_advances() {
        let cal = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let t0 = "2023-05-01T00:10:00Z";
        let t1 = "2023-05-01T00:10:01Z";
        store.put(key(t0, 3, 1), fragment(100));
        store.put(key(t0, 4, 0), fragment(1000));
        store.put(key(t1, 3, 1), fragment(100));

        let mut replay = provider(store, &cal);
        assert!(replay.process_key(&key(t0, 3, 1)).is_none());
        assert!(replay.process_key(&key(t0, 4, 0)).is_none());
        let frame = replay.process_key(&key(t1, 3, 1)).unwrap();

        // Labelled with the capture time that triggered the flush.
        assert_eq!(frame.timestamp, FrameTimestamp::Iso(t1.to_string()));
        assert_eq!(frame.bins.len(), 64 - 2 * 2);
        // Slot 11 holds 10*log10(100) = 20 dB; identity calibration then
        // 1000*log10(20 / 0.001) = 4301.
        let slot11 = 11 * 4 - 2 - 2;
        assert_eq!(frame.bins[slot11], 4301);
        // Slot 4 holds 30 dB.
        let slot4 = 4 * 4 - 2 - 2;
        assert_eq!(frame.bins[slot4], 4477);
        // Never-written slots read 0 dB and land on the floor.
        assert_eq!(frame.bins[0], LEVEL_FLOOR);

        let stats = replay.stats();
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.fragments, 3);
        assert_eq!(replay.drops(), 0);
    }

    #[test]
    fn test_bad_keys_and_guard_slots_are_ignored() {
        let cal = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let t0 = "2023-05-01T00:10:00Z";
        let mut replay = provider(store.clone(), &cal);

        assert!(replay.process_key("rfind/garbage").is_none());
        // Folding this slot onto channel 1 would overflow.
        assert!(replay
            .process_key(&format!("rfind/{}_{}_1", t0, usize::MAX - 7))
            .is_none());
        assert!(replay.process_key(&key(t0, 0, 0)).is_none());
        assert!(replay.process_key(&key(t0, 7, 1)).is_none());
        // Accepted slot, but the object is missing.
        assert!(replay.process_key(&key(t0, 5, 0)).is_none());
        // Wrong fragment length.
        store.put(key(t0, 6, 0), vec![0u8; 8]);
        assert!(replay.process_key(&key(t0, 6, 0)).is_none());

        let stats = replay.stats();
        assert_eq!(stats.keys, 6);
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.ignored, 2);
        assert_eq!(stats.fragment_errors, 2);
        assert_eq!(stats.frames, 0);
    }

    #[test]
    fn test_gap_is_flagged_but_frame_still_flushed() {
        let cal = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut replay = provider(store, &cal);

        assert!(replay.process_key(&key("2023-05-01T00:10:00Z", 3, 0)).is_none());
        assert!(replay.process_key(&key("2023-05-01T00:10:05Z", 3, 0)).is_some());
        // An earlier timestamp neither flushes nor counts as a drop.
        assert!(replay.process_key(&key("2023-05-01T00:10:02Z", 3, 0)).is_none());
        assert_eq!(replay.drops(), 1);
    }

    #[test]
    fn test_calibration_cycle_persists_references() {
        let cal = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let stamps = [
            "2023-05-01T01:01:00Z",
            "2023-05-01T01:01:01Z",
            "2023-05-01T01:02:00Z",
            "2023-05-01T01:03:00Z",
        ];
        for ts in stamps {
            store.put(key(ts, 3, 1), fragment(10));
        }

        let mut replay = provider(store, &cal);
        assert!(!replay.calibration().has_references());
        for ts in stamps {
            replay.process_key(&key(ts, 3, 1));
            if ts.ends_with("01:01Z") {
                assert_eq!(replay.cycle().phase(), CyclePhase::CapturingOff);
            }
        }

        assert_eq!(replay.cycle().phase(), CyclePhase::Idle);
        let cal_stats = replay.calibration().stats();
        assert_eq!(cal_stats.captures, 2);
        assert_eq!(cal_stats.recomputes, 1);
        assert!(replay.calibration().has_references());

        let on = read_f32_dump(&cal.path().join(NOISE_ON_FILE)).unwrap();
        let off = read_f32_dump(&cal.path().join(NOISE_OFF_FILE)).unwrap();
        assert_eq!(on.len(), 64);
        assert_eq!(off.len(), 64);
        // Slot 11 was written with 10 dB before both captures.
        assert!((on[11 * 4 - 2] - 10.0).abs() < 1e-4);

        // A restart picks the persisted references back up.
        let again = provider(Arc::new(MemoryStore::new()), &cal);
        assert!(again.calibration().has_references());
    }

    #[test]
    fn test_interrupted_cycle_is_counted() {
        let cal = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut replay = provider(store, &cal);

        replay.process_key(&key("2023-05-01T02:00:59Z", 3, 0));
        replay.process_key(&key("2023-05-01T02:01:00Z", 3, 0));
        assert!(replay.cycle().in_cycle());
        replay.process_key(&key("2023-05-01T02:05:00Z", 3, 0));

        assert_eq!(replay.cycle().incomplete_count(), 1);
        assert_eq!(replay.cycle().phase(), CyclePhase::Idle);
        assert_eq!(replay.calibration().stats().recomputes, 0);
    }

    #[test]
    fn test_run_streams_from_store() {
        let cal = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let stamps = [
            "2023-05-01T00:10:00Z",
            "2023-05-01T00:10:01Z",
            "2023-05-01T00:10:02Z",
        ];
        for ts in stamps {
            store.put(key(ts, 3, 1), fragment(100));
            store.put(key(ts, 5, 0), fragment(100));
        }

        let rec = RecordingChannel::new();
        let start = parse_timestamp(stamps[0]).unwrap();
        let mut replay = ReplayProvider::new(
            store,
            settings(&cal, Some(start)),
            ChannelTarget::Recording(rec.clone()),
        )
        .unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let watcher = {
            let rec = rec.clone();
            let running = running.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    if rec.len() >= 2 {
                        break;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                running.store(false, Ordering::SeqCst);
            })
        };

        replay.run(&running).unwrap();
        watcher.join().unwrap();

        let frames = rec.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].timestamp, FrameTimestamp::Iso(stamps[1].to_string()));
        assert_eq!(frames[1].timestamp, FrameTimestamp::Iso(stamps[2].to_string()));
        assert_eq!(replay.state(), ProviderState::Stopped);
    }

    #[test]
    fn test_invalid_settings() {
        let cal = TempDir::new().unwrap();
        let mut bad = settings(&cal, None);
        bad.key_pattern = "(".to_string();
        assert!(ReplayProvider::new(Arc::new(MemoryStore::new()), bad, ChannelTarget::Log).is_err());

        let mut config = Config::default();
        config.store.start = Some("not a time".to_string());
        assert!(ReplaySettings::from_config(&config).is_err());
        config.store.start = Some("2023-05-01T00:00:00Z".to_string());
        let s = ReplaySettings::from_config(&config).unwrap();
        assert_eq!(s.streamer.window, Duration::from_secs(5));
        assert!(s.streamer.start.is_some());
    }
}
