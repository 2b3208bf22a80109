// Copyright 2025-2026 CEMAXECUTER LLC

pub mod calcycle;
pub mod calibration;
pub mod composite;
pub mod fft;
pub mod window;
