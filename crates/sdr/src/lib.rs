// Copyright 2025-2026 CEMAXECUTER LLC

pub mod gap;
pub mod keys;
pub mod prefix;
pub mod store;
pub mod streamer;

#[cfg(feature = "usrp")]
pub mod usrp;

use num_complex::Complex32;

/// Common trait for live radio front-ends.
///
/// Reception is synchronous: the caller polls `recv_into` until it has
/// gathered enough samples. The driver buffers internally.
pub trait RadioSource: Send {
    /// Begin continuous streaming.
    fn start_streaming(&mut self) -> Result<(), String>;

    /// Stop streaming. Safe to call more than once.
    fn stop_streaming(&mut self);

    /// Receive up to `buf.len()` complex samples.
    /// Returns the number received, or the driver's error code.
    fn recv_into(&mut self, buf: &mut [Complex32]) -> Result<usize, i32>;

    /// Get the sample rate in Hz
    fn sample_rate(&self) -> f64;

    /// Get the center frequency in Hz
    fn center_frequency(&self) -> f64;
}
