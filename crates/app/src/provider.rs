use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rf_output::{EventChannel, IntegrationFrame, LogChannel, RecordingChannel, INTEGRATION_EVENT};

use crate::config::ChannelConfig;

/// Longest single sleep while pacing, so an interrupt is noticed promptly.
const PACING_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Disconnected,
    Connected,
    Streaming,
    Stopped,
}

/// Where frames go.
#[derive(Clone)]
pub enum ChannelTarget {
    Zmq {
        endpoint: String,
        namespace: String,
        curve_keyfile: Option<String>,
    },
    /// Log a summary per frame (`--dry-run`).
    Log,
    Recording(RecordingChannel),
}

impl ChannelTarget {
    pub fn from_config(config: &ChannelConfig, dry_run: bool) -> Self {
        if dry_run {
            return ChannelTarget::Log;
        }
        ChannelTarget::Zmq {
            endpoint: config.endpoint(),
            namespace: config.namespace.clone(),
            curve_keyfile: config.curve_keyfile.clone(),
        }
    }

    fn open(&self) -> Result<Box<dyn EventChannel>, String> {
        match self {
            #[cfg(feature = "zmq")]
            ChannelTarget::Zmq {
                endpoint,
                namespace,
                curve_keyfile,
            } => {
                let publisher = rf_output::zmq_pub::ZmqPublisher::new(
                    endpoint,
                    namespace,
                    curve_keyfile.as_deref(),
                )?;
                Ok(Box::new(publisher))
            }
            #[cfg(not(feature = "zmq"))]
            ChannelTarget::Zmq { endpoint, .. } => Err(format!(
                "cannot publish to {}: built without zmq support (use --dry-run)",
                endpoint
            )),
            ChannelTarget::Log => Ok(Box::new(LogChannel)),
            ChannelTarget::Recording(rec) => Ok(Box::new(rec.clone())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitStats {
    pub emitted: u64,
    pub failed: u64,
}

/// Event channel plus per-frame bookkeeping, shared by every backend.
pub struct Emitter {
    channel: Box<dyn EventChannel>,
    stats: EmitStats,
}

impl Emitter {
    pub fn new(channel: Box<dyn EventChannel>) -> Self {
        Self {
            channel,
            stats: EmitStats::default(),
        }
    }

    pub fn connect(target: &ChannelTarget) -> Result<Self, String> {
        Ok(Self::new(target.open()?))
    }

    /// Publish one frame. Failures are logged and counted, never fatal.
    pub fn emit(&mut self, frame: &IntegrationFrame) -> bool {
        match self.channel.emit(INTEGRATION_EVENT, frame) {
            Ok(()) => {
                self.stats.emitted += 1;
                log::debug!("integration emitted ({}, {} bins)", frame.timestamp, frame.bins.len());
                true
            }
            Err(e) => {
                self.stats.failed += 1;
                log::warn!("integration not emitted ({}): {}", frame.timestamp, e);
                false
            }
        }
    }

    pub fn stats(&self) -> EmitStats {
        self.stats
    }
}

/// Per-tick contract shared by the radio, replay and simulation backends.
pub trait DataProvider {
    fn name(&self) -> &'static str;

    fn state(&self) -> ProviderState;

    /// Build the backend resources and the event channel.
    fn connect(&mut self) -> Result<(), String>;

    /// Begin streaming. Called once by `run()`.
    fn start(&mut self) -> Result<(), String>;

    /// Produce the next frame, or `None` when nothing was ready this tick.
    /// An error means the backend cannot continue.
    fn get_integration(&mut self) -> Result<Option<IntegrationFrame>, String>;

    fn emitter(&mut self) -> Option<&mut Emitter>;

    fn emit_integration(&mut self, frame: &IntegrationFrame) -> bool {
        match self.emitter() {
            Some(emitter) => emitter.emit(frame),
            None => {
                log::warn!("integration not emitted ({}): not connected", frame.timestamp);
                false
            }
        }
    }

    /// Target tick period for self-paced backends.
    fn pacing(&self) -> Option<Duration> {
        None
    }

    /// Release streaming resources. Safe to call more than once.
    fn stop(&mut self);

    /// Tick until `running` is cleared, then stop.
    fn run(&mut self, running: &AtomicBool) -> Result<(), String> {
        if self.state() == ProviderState::Disconnected {
            self.connect()?;
        }
        self.start()?;
        log::info!("{} provider streaming", self.name());

        while running.load(Ordering::SeqCst) {
            let tick = Instant::now();
            match self.get_integration() {
                Ok(Some(frame)) => {
                    self.emit_integration(&frame);
                }
                Ok(None) => {}
                Err(e) => {
                    self.stop();
                    return Err(e);
                }
            }

            if let Some(period) = self.pacing() {
                let elapsed = tick.elapsed();
                if elapsed < period {
                    sleep_while_running(period - elapsed, running);
                } else {
                    log::debug!(
                        "tick overran by {:.1} ms",
                        (elapsed - period).as_secs_f64() * 1000.0
                    );
                }
            }
        }

        log::info!("{} provider interrupted", self.name());
        self.stop();
        Ok(())
    }
}

fn sleep_while_running(total: Duration, running: &AtomicBool) {
    let deadline = Instant::now() + total;
    loop {
        let now = Instant::now();
        if now >= deadline || !running.load(Ordering::SeqCst) {
            return;
        }
        thread::sleep((deadline - now).min(PACING_SLICE));
    }
}

/// Unix time in milliseconds, the timestamp live backends stamp frames with.
pub fn unix_millis() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}
