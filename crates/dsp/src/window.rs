// Copyright 2025-2026 CEMAXECUTER LLC

use std::f64::consts::PI;

/// Generate Hamming window coefficients
///
/// - `n`: window length
///
/// Symmetric form, `w[i] = 0.54 - 0.46 * cos(2*pi*i / (n-1))`.
pub fn hamming(n: usize) -> Vec<f32> {
    match n {
        0 => Vec::new(),
        1 => vec![1.0],
        _ => {
            let denom = (n - 1) as f64;
            (0..n)
                .map(|i| (0.54 - 0.46 * (2.0 * PI * i as f64 / denom).cos()) as f32)
                .collect()
        }
    }
}
