//! Individual tone generation and FFT comb synthesis.

use crate::error::{ReadoutError, Result};
use num_complex::Complex64;
use rand::Rng;
use rustfft::FftPlanner;
use std::f64::consts::{PI, SQRT_2, TAU};

/// Tones to synthesize plus their optional per-tone corrections.
///
/// Absent amplitudes default to 1, absent phases are drawn uniformly from `[0, 2π)`,
/// absent I/Q ratios default to 1 and absent I/Q phase offsets to 0 degrees.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToneSet {
    /// Requested frequencies in Hz, before rounding to the sample grid.
    pub freqs: Vec<f64>,
    /// Linear amplitude of each tone.
    pub amplitudes: Option<Vec<f64>>,
    /// Starting phase of each tone, in radians.
    pub phases: Option<Vec<f64>>,
    /// I amplitude over Q amplitude. The pair is normalized to unit mean power.
    pub iq_ratios: Option<Vec<f64>>,
    /// Phase lead of I relative to Q, in degrees.
    pub iq_phase_offsets_deg: Option<Vec<f64>>,
}

impl ToneSet {
    /// Tones at `freqs` with every correction left at its default.
    pub fn new(freqs: Vec<f64>) -> Self {
        Self {
            freqs,
            ..Default::default()
        }
    }

    /// One amplitude per frequency.
    pub fn with_amplitudes(mut self, amplitudes: Vec<f64>) -> Self {
        self.amplitudes = Some(amplitudes);
        self
    }

    /// Fixed starting phases instead of random ones.
    pub fn with_phases(mut self, phases: Vec<f64>) -> Self {
        self.phases = Some(phases);
        self
    }

    /// Per-tone I/Q amplitude imbalance correction.
    pub fn with_iq_ratios(mut self, ratios: Vec<f64>) -> Self {
        self.iq_ratios = Some(ratios);
        self
    }

    /// Per-tone I/Q phase imbalance correction.
    pub fn with_iq_phase_offsets_deg(mut self, offsets: Vec<f64>) -> Self {
        self.iq_phase_offsets_deg = Some(offsets);
        self
    }

    fn check_len(&self, name: &str, values: &Option<Vec<f64>>) -> Result<()> {
        match values {
            Some(v) if v.len() != self.freqs.len() => Err(ReadoutError::validation(format!(
                "Need exactly one {} value for each frequency ({} given, {} freqs)",
                name,
                v.len(),
                self.freqs.len()
            ))),
            _ => Ok(()),
        }
    }

    fn resolve<R: Rng + ?Sized>(
        &self,
        n_samples: usize,
        sample_rate: f64,
        rng: &mut R,
    ) -> Result<Vec<ResolvedTone>> {
        if n_samples == 0 || sample_rate <= 0.0 {
            return Err(ReadoutError::validation(
                "n_samples and sample_rate must be positive",
            ));
        }
        self.check_len("amplitude", &self.amplitudes)?;
        self.check_len("phase", &self.phases)?;
        self.check_len("iq ratio", &self.iq_ratios)?;
        self.check_len("iq phase offset", &self.iq_phase_offsets_deg)?;

        let resolution = sample_rate / n_samples as f64;
        let pick = |values: &Option<Vec<f64>>, idx: usize, default: f64| {
            values.as_ref().map(|v| v[idx]).unwrap_or(default)
        };

        let mut tones = Vec::with_capacity(self.freqs.len());
        for (idx, freq) in self.freqs.iter().enumerate() {
            let bin = (freq / resolution).round();
            let phase = match &self.phases {
                Some(p) => p[idx],
                None => rng.gen_range(0.0..TAU),
            };
            let ratio = pick(&self.iq_ratios, idx, 1.0);
            let offset = pick(&self.iq_phase_offsets_deg, idx, 0.0).to_radians();
            let norm = (1.0 + ratio * ratio).sqrt();
            tones.push(ResolvedTone {
                bin: bin as i64,
                quantized_freq: bin * resolution,
                amplitude: pick(&self.amplitudes, idx, 1.0),
                phase,
                i_scale: SQRT_2 * ratio / norm,
                q_scale: SQRT_2 / norm,
                iq_offset_rad: offset,
            });
        }
        Ok(tones)
    }
}

#[derive(Debug, Clone, Copy)]
struct ResolvedTone {
    bin: i64,
    quantized_freq: f64,
    amplitude: f64,
    phase: f64,
    i_scale: f64,
    q_scale: f64,
    iq_offset_rad: f64,
}

/// Time series of one tone.
#[derive(Debug, Clone, PartialEq)]
pub struct ToneWaveform {
    pub quantized_freq_hz: f64,
    pub phase_rad: f64,
    pub i: Vec<f64>,
    pub q: Vec<f64>,
}

/// Coherent sum of a tone set.
#[derive(Debug, Clone, PartialEq)]
pub struct SummedTones {
    pub i: Vec<f64>,
    pub q: Vec<f64>,
    pub quantized_freqs_hz: Vec<f64>,
    pub phases_rad: Vec<f64>,
}

/// Generate each tone as its own I/Q time series.
///
/// Frequencies are rounded to the nearest multiple of `sample_rate / n_samples` so every
/// tone loops seamlessly over the buffer.
pub fn generate_tones<R: Rng + ?Sized>(
    tones: &ToneSet,
    n_samples: usize,
    sample_rate: f64,
    rng: &mut R,
) -> Result<Vec<ToneWaveform>> {
    let resolved = tones.resolve(n_samples, sample_rate, rng)?;
    let dt = 1.0 / sample_rate;

    Ok(resolved
        .iter()
        .map(|tone| {
            let (sin_o, cos_o) = tone.iq_offset_rad.sin_cos();
            let mut i = Vec::with_capacity(n_samples);
            let mut q = Vec::with_capacity(n_samples);
            for n in 0..n_samples {
                let arg = 2.0 * PI * tone.quantized_freq * dt * n as f64 + tone.phase;
                let (im, re) = arg.sin_cos();
                let (re, im) = (tone.amplitude * re, tone.amplitude * im);
                i.push(tone.i_scale * (cos_o * re + sin_o * im));
                q.push(tone.q_scale * im);
            }
            ToneWaveform {
                quantized_freq_hz: tone.quantized_freq,
                phase_rad: tone.phase,
                i,
                q,
            }
        })
        .collect())
}

/// Sum of all tones, computed with two inverse FFTs.
///
/// Matches the sample-wise sum of [`generate_tones`] to rounding error because every
/// quantized tone lands exactly on an FFT bin.
pub fn synthesize_sum<R: Rng + ?Sized>(
    tones: &ToneSet,
    n_samples: usize,
    sample_rate: f64,
    rng: &mut R,
) -> Result<SummedTones> {
    let resolved = tones.resolve(n_samples, sample_rate, rng)?;
    let n = n_samples as i64;

    let mut spec_i = vec![Complex64::new(0.0, 0.0); n_samples];
    let mut spec_q = vec![Complex64::new(0.0, 0.0); n_samples];
    for tone in &resolved {
        let k = tone.bin.rem_euclid(n) as usize;
        let carrier = Complex64::from_polar(tone.amplitude, tone.phase);
        // Re(z e^{-io}) == cos(o) Re(z) + sin(o) Im(z)
        let rotation = Complex64::from_polar(tone.i_scale, -tone.iq_offset_rad);
        spec_i[k] += carrier * rotation;
        spec_q[k] += carrier * tone.q_scale;
    }

    // rustfft's inverse transform is unnormalized, which is exactly the tone sum.
    let mut planner = FftPlanner::new();
    let ifft = planner.plan_fft_inverse(n_samples);
    ifft.process(&mut spec_i);
    ifft.process(&mut spec_q);

    Ok(SummedTones {
        i: spec_i.iter().map(|c| c.re).collect(),
        q: spec_q.iter().map(|c| c.im).collect(),
        quantized_freqs_hz: resolved.iter().map(|t| t.quantized_freq).collect(),
        phases_rad: resolved.iter().map(|t| t.phase).collect(),
    })
}
