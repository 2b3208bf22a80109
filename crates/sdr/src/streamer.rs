// Copyright 2025-2026 CEMAXECUTER LLC

//! Background key enumeration.
//!
//! A worker thread walks the time-window prefixes, lists each window in one
//! batch and pushes the keys onto a bounded channel. The consumer pulls keys
//! at its own pace. Stopping closes both channels; the worker notices on its next
//! send or wait and exits. A worker stuck inside a listing call is left
//! behind after [`STOP_TIMEOUT`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::prefix::TimePrefixGenerator;
use crate::store::ObjectStore;

/// How long `stop()` waits for the worker before detaching it.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub key_prefix: String,
    pub window: Duration,
    /// Replay from this instant; `None` tails from the current window.
    pub start: Option<DateTime<Utc>>,
    pub queue_depth: usize,
    pub settle: Duration,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            key_prefix: "rfind".to_string(),
            window: Duration::from_secs(5),
            start: None,
            queue_depth: 1024,
            settle: crate::prefix::SETTLE_DELAY,
        }
    }
}

/// Outcome of waiting for the next key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPoll {
    Key(String),
    /// Nothing arrived within the timeout.
    Idle,
    /// The worker is gone (or was never started).
    Closed,
}

pub struct KeyStreamer {
    store: Arc<dyn ObjectStore>,
    config: StreamerConfig,
    keys: Option<Receiver<String>>,
    shutdown: Option<Sender<()>>,
    done: Option<Receiver<()>>,
    handle: Option<JoinHandle<()>>,
}

impl KeyStreamer {
    pub fn new(store: Arc<dyn ObjectStore>, config: StreamerConfig) -> Self {
        Self {
            store,
            config,
            keys: None,
            shutdown: None,
            done: None,
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawn the enumeration worker.
    pub fn start(&mut self) -> Result<(), String> {
        if self.is_running() {
            return Err("key streamer already running".to_string());
        }

        let (key_tx, key_rx) = channel::bounded(self.config.queue_depth.max(1));
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let (done_tx, done_rx) = channel::bounded::<()>(0);

        let generator = TimePrefixGenerator::new(
            self.config.window,
            self.config.start.unwrap_or_else(Utc::now),
        )
        .with_settle(self.config.settle);
        let store = self.store.clone();
        let key_prefix = self.config.key_prefix.clone();

        log::info!(
            "streaming keys under {}/ from {} in {} s windows",
            key_prefix,
            generator.next_start().to_rfc3339(),
            self.config.window.as_secs()
        );

        let handle = thread::Builder::new()
            .name("key-streamer".to_string())
            .spawn(move || {
                // Dropped on exit, which is what stop() waits for.
                let _done = done_tx;
                enumerate_keys(store.as_ref(), generator, &key_prefix, &key_tx, &shutdown_rx);
            })
            .map_err(|e| format!("failed to spawn key streamer: {}", e))?;

        self.keys = Some(key_rx);
        self.shutdown = Some(shutdown_tx);
        self.done = Some(done_rx);
        self.handle = Some(handle);
        Ok(())
    }

    /// Block up to `timeout` for the next key.
    pub fn next_key(&self, timeout: Duration) -> KeyPoll {
        let Some(keys) = self.keys.as_ref() else {
            return KeyPoll::Closed;
        };
        match keys.recv_timeout(timeout) {
            Ok(key) => KeyPoll::Key(key),
            Err(RecvTimeoutError::Timeout) => KeyPoll::Idle,
            Err(RecvTimeoutError::Disconnected) => KeyPoll::Closed,
        }
    }

    /// Close the hand-off and wait briefly for the worker to exit.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.keys = None;
        self.shutdown = None;

        let exited = match self.done.take() {
            Some(done) => !matches!(done.recv_timeout(STOP_TIMEOUT), Err(RecvTimeoutError::Timeout)),
            None => true,
        };
        if exited {
            if handle.join().is_err() {
                log::error!("key streamer panicked");
            }
            log::info!("key streamer stopped");
        } else {
            log::warn!(
                "key streamer did not exit within {:?}, detaching it",
                STOP_TIMEOUT
            );
        }
    }
}

impl Drop for KeyStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn closed(shutdown: &Receiver<()>) -> bool {
    matches!(shutdown.try_recv(), Err(TryRecvError::Disconnected))
}

fn enumerate_keys(
    store: &dyn ObjectStore,
    mut generator: TimePrefixGenerator,
    key_prefix: &str,
    keys: &Sender<String>,
    shutdown: &Receiver<()>,
) {
    loop {
        match generator.poll(Utc::now()) {
            Ok(window) => {
                if closed(shutdown) {
                    return;
                }
                let prefixes = window.prefixes(key_prefix);
                for (prefix, listed) in prefixes.iter().zip(store.list_batch(&prefixes)) {
                    if closed(shutdown) {
                        return;
                    }
                    let listed = match listed {
                        Ok(listed) => listed,
                        Err(e) => {
                            log::warn!("listing {} failed: {}", prefix, e);
                            continue;
                        }
                    };
                    for key in listed {
                        if keys.send(key).is_err() {
                            return; // consumer dropped
                        }
                    }
                }
            }
            Err(wait) => match shutdown.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{TimeDelta, TimeZone};
    use std::time::Instant;

    fn historic_config(start: DateTime<Utc>, depth: usize) -> StreamerConfig {
        StreamerConfig {
            key_prefix: "rfind".to_string(),
            window: Duration::from_secs(5),
            start: Some(start),
            queue_depth: depth,
            settle: Duration::ZERO,
        }
    }

    #[test]
    fn test_streams_keys_in_time_order() {
        let store = Arc::new(MemoryStore::new());
        let t0 = Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap();
        for s in [7, 0, 3] {
            let t = t0 + TimeDelta::seconds(s);
            store.put(format!("rfind/{}Z_03_1", t.format("%Y-%m-%dT%H:%M:%S")), vec![]);
        }
        store.put("elsewhere/2023-05-01T00:00:01Z_03_1", vec![]);

        let mut streamer = KeyStreamer::new(store, historic_config(t0, 16));
        assert_eq!(streamer.next_key(Duration::from_millis(10)), KeyPoll::Closed);
        streamer.start().unwrap();
        assert!(streamer.start().is_err());

        let mut got = Vec::new();
        while got.len() < 3 {
            match streamer.next_key(Duration::from_secs(5)) {
                KeyPoll::Key(k) => got.push(k),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(
            got,
            vec![
                "rfind/2023-05-01T00:00:00Z_03_1",
                "rfind/2023-05-01T00:00:03Z_03_1",
                "rfind/2023-05-01T00:00:07Z_03_1",
            ]
        );

        streamer.stop();
        assert!(!streamer.is_running());
        assert_eq!(streamer.next_key(Duration::from_millis(10)), KeyPoll::Closed);
    }

    #[test]
    fn test_stop_unblocks_worker_on_full_queue() {
        let store = Arc::new(MemoryStore::new());
        let t0 = Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap();
        for i in 0..50 {
            store.put(format!("rfind/2023-05-01T00:00:00Z_{:02}_0", i), vec![]);
        }
        let mut streamer = KeyStreamer::new(store, historic_config(t0, 1));
        streamer.start().unwrap();
        assert!(matches!(streamer.next_key(Duration::from_secs(5)), KeyPoll::Key(_)));

        let begin = Instant::now();
        streamer.stop();
        assert!(begin.elapsed() < STOP_TIMEOUT);
    }

    #[test]
    fn test_stop_while_waiting_for_live_window() {
        let store = Arc::new(MemoryStore::new());
        let config = StreamerConfig {
            window: Duration::from_secs(60),
            ..StreamerConfig::default()
        };
        let mut streamer = KeyStreamer::new(store, config);
        streamer.start().unwrap();
        assert_eq!(streamer.next_key(Duration::from_millis(20)), KeyPoll::Idle);

        let begin = Instant::now();
        streamer.stop();
        assert!(begin.elapsed() < STOP_TIMEOUT);
    }
}
