use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use rf_dsp::calibration::NoiseSource;
use rf_dsp::composite::CompositeLayout;
use rf_sdr::keys::DEFAULT_KEY_PATTERN;

/// Provider configuration, loaded once at startup from a JSON file.
/// Every field has a default, so a partial file is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub channel: ChannelConfig,
    pub store: StoreConfig,
    /// Seconds between frames for the self-paced backends.
    pub integration_secs: f64,
    /// FFT size of the radio and simulation backends.
    pub n_bins: usize,
    pub radio: RadioConfig,
    pub output: OutputConfig,
    pub composite: CompositeConfig,
    pub calibration: CalibrationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            store: StoreConfig::default(),
            integration_secs: 1.0,
            n_bins: 4096,
            radio: RadioConfig::default(),
            output: OutputConfig::default(),
            composite: CompositeConfig::default(),
            calibration: CalibrationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub protocol: String,
    pub ip: String,
    pub port: u16,
    pub namespace: String,
    pub curve_keyfile: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            protocol: "tcp".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 5555,
            namespace: "/backend".to_string(),
            curve_keyfile: None,
        }
    }
}

impl ChannelConfig {
    pub fn endpoint(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.ip, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub key_prefix: String,
    pub key_regex: String,
    pub window_secs: u64,
    /// ISO-8601 instant to replay from. Unset tails live data.
    pub start: Option<String>,
    pub queue_depth: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            key_prefix: "rfind".to_string(),
            key_regex: DEFAULT_KEY_PATTERN.to_string(),
            window_secs: 5,
            start: None,
            queue_depth: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Sample rate and span of the radio; the simulator shifts its
    /// signals down by half of it.
    pub bandwidth_hz: f64,
    pub start_freq_hz: f64,
    pub gain_db: f64,
    /// Extra UHD device args, e.g. `serial=31F1234`.
    pub device_args: String,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            bandwidth_hz: 2e9,
            start_freq_hz: 0.0,
            gain_db: 15.0,
            device_args: String::new(),
        }
    }
}

impl RadioConfig {
    pub fn center_freq_hz(&self) -> f64 {
        self.start_freq_hz + self.bandwidth_hz / 2.0
    }
}

/// Level range of simulated spectra, in dB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub spectra_min_db: f64,
    pub spectra_max_db: f64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            spectra_min_db: -100.0,
            spectra_max_db: -20.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositeConfig {
    pub slots: usize,
    pub bins_per_slot: usize,
    pub fragment_guard: usize,
    pub rotation: usize,
    pub first_slot: usize,
    pub end_slot: usize,
    /// Bins trimmed from each end of the calibrated spectrum.
    pub output_guard: usize,
}

impl Default for CompositeConfig {
    fn default() -> Self {
        let layout = CompositeLayout::default();
        Self {
            slots: layout.slots,
            bins_per_slot: layout.bins_per_slot,
            fragment_guard: layout.fragment_guard,
            rotation: layout.rotation,
            first_slot: layout.first_slot,
            end_slot: layout.end_slot,
            output_guard: 60_000,
        }
    }
}

impl CompositeConfig {
    pub fn layout(&self) -> CompositeLayout {
        CompositeLayout {
            slots: self.slots,
            bins_per_slot: self.bins_per_slot,
            fragment_guard: self.fragment_guard,
            rotation: self.rotation,
            first_slot: self.first_slot,
            end_slot: self.end_slot,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Directory holding `noise_on.dat` and `noise_off.dat`.
    pub dir: PathBuf,
    pub enr_db: f64,
    pub enr_slope_db_per_ghz: f64,
    pub freq_start_hz: f64,
    pub freq_stop_hz: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        let source = NoiseSource::default();
        Self {
            dir: PathBuf::from("."),
            enr_db: source.enr_db,
            enr_slope_db_per_ghz: source.slope_db_per_ghz,
            freq_start_hz: 0.0,
            freq_stop_hz: 2e9,
        }
    }
}

impl CalibrationConfig {
    pub fn noise_source(&self) -> NoiseSource {
        NoiseSource {
            enr_db: self.enr_db,
            slope_db_per_ghz: self.enr_slope_db_per_ghz,
        }
    }
}

impl Config {
    /// Read `path`. A missing file yields the defaults with a warning; a
    /// malformed one is an error.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!(
                    "no config file at {}, using defaults",
                    path.display()
                );
                return Ok(Self::default());
            }
            Err(e) => return Err(format!("failed to read {}: {}", path.display(), e)),
        };
        serde_json::from_str(&text).map_err(|e| format!("invalid config {}: {}", path.display(), e))
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.integration_secs.is_finite() && self.integration_secs > 0.0) {
            return Err(format!(
                "integration_secs must be positive, got {}",
                self.integration_secs
            ));
        }
        if self.n_bins < 2 {
            return Err(format!("n_bins must be at least 2, got {}", self.n_bins));
        }
        if self.output.spectra_min_db >= self.output.spectra_max_db {
            return Err(format!(
                "spectra_min_db ({}) must be below spectra_max_db ({})",
                self.output.spectra_min_db, self.output.spectra_max_db
            ));
        }
        if self.store.window_secs == 0 || self.store.queue_depth == 0 {
            return Err("store window_secs and queue_depth must be non-zero".to_string());
        }

        let c = &self.composite;
        if c.slots == 0 || c.bins_per_slot == 0 {
            return Err("composite needs at least one slot and one bin".to_string());
        }
        if c.first_slot >= c.end_slot || c.end_slot > c.slots {
            return Err(format!(
                "accepted slots [{}, {}) do not fit {} slots",
                c.first_slot, c.end_slot, c.slots
            ));
        }
        if 2 * c.output_guard >= c.slots * c.bins_per_slot {
            return Err(format!(
                "output_guard {} leaves no bins out of {}",
                c.output_guard,
                c.slots * c.bins_per_slot
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.channel.endpoint(), "tcp://127.0.0.1:5555");
        assert_eq!(config.composite.layout().total_bins(), 600_000);
        assert_eq!(config.radio.center_freq_hz(), 1e9);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rfind.json");
        fs::write(
            &path,
            r#"{"channel": {"port": 7000}, "n_bins": 1024, "store": {"start": "2023-05-01T00:00:00Z"}}"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.channel.port, 7000);
        assert_eq!(config.channel.ip, "127.0.0.1");
        assert_eq!(config.n_bins, 1024);
        assert_eq!(config.store.start.as_deref(), Some("2023-05-01T00:00:00Z"));
        assert_eq!(config.store.key_prefix, "rfind");
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rfind.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.output.spectra_min_db = -10.0;
        config.output.spectra_max_db = -20.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.composite.output_guard = 300_000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.integration_secs = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.composite.end_slot = 17;
        assert!(config.validate().is_err());
    }
}
