//! Spectrum check of ADC snapshots.
//!
//! A clean ADC input looks like broadband noise. A tone standing far above the median
//! noise floor usually means a spur from the LO chain or a misconfigured DAC comb, which
//! the attenuation search reports as a warning.

use num_complex::Complex;
use rustfft::FftPlanner;
use serde::Serialize;
use statrs::statistics::{Data, Median};

/// Level reported for bins with no measurable magnitude.
const FLOOR_DB: f64 = -120.0;

/// One bin standing above the noise floor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpectrumSpike {
    /// FFT bin index, in `[0, n)`.
    pub bin: usize,
    /// Height above the median bin, in dB.
    pub excess_db: f64,
}

/// Magnitude spectrum in dB of the complex signal `i + jq`, Hann windowed.
pub fn power_spectrum_db(i: &[f64], q: &[f64]) -> Vec<f64> {
    let n = i.len().min(q.len());
    if n == 0 {
        return Vec::new();
    }
    let window: Vec<f64> = if n > 1 {
        (0..n)
            .map(|k| 0.5 * (1.0 - (std::f64::consts::TAU * k as f64 / (n - 1) as f64).cos()))
            .collect()
    } else {
        vec![1.0]
    };
    let mut buffer: Vec<Complex<f64>> = i
        .iter()
        .zip(q)
        .zip(&window)
        .map(|((re, im), w)| Complex::new(re * w, im * w))
        .collect();

    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(n).process(&mut buffer);

    buffer
        .iter()
        .map(|x| {
            let magnitude = x.norm() / n as f64;
            if magnitude > 1e-6 {
                20.0 * magnitude.log10()
            } else {
                FLOOR_DB
            }
        })
        .collect()
}

/// Bins other than DC more than `threshold_db` above the median level, loudest first.
pub fn find_spikes(spectrum_db: &[f64], threshold_db: f64) -> Vec<SpectrumSpike> {
    if spectrum_db.len() < 2 {
        return Vec::new();
    }
    let floor = median(&spectrum_db[1..]);
    let mut spikes: Vec<SpectrumSpike> = spectrum_db
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, level)| **level - floor > threshold_db)
        .map(|(bin, level)| SpectrumSpike {
            bin,
            excess_db: level - floor,
        })
        .collect();
    spikes.sort_by(|a, b| b.excess_db.total_cmp(&a.excess_db));
    spikes
}

/// Median with the mean of the middle pair for even lengths. Zero for empty input.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    Data::new(values.to_vec()).median()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn noise(n: usize, seed: u64) -> (Vec<f64>, Vec<f64>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|_| (rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
            .unzip()
    }

    #[test]
    fn median_of_even_and_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn noise_has_no_spikes() {
        let (i, q) = noise(1024, 1);
        let spectrum = power_spectrum_db(&i, &q);
        assert_eq!(spectrum.len(), 1024);
        assert!(find_spikes(&spectrum, 30.0).is_empty());
    }

    #[test]
    fn strong_tone_is_reported_at_its_bin() {
        let (mut i, mut q) = noise(1024, 2);
        for (n, (iv, qv)) in i.iter_mut().zip(q.iter_mut()).enumerate() {
            let arg = std::f64::consts::TAU * 100.0 * n as f64 / 1024.0;
            *iv = *iv * 0.01 + 5.0 * arg.cos();
            *qv = *qv * 0.01 + 5.0 * arg.sin();
        }
        let spikes = find_spikes(&power_spectrum_db(&i, &q), 30.0);
        assert_eq!(spikes.first().map(|s| s.bin), Some(100));
    }
}
