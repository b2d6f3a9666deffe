//! DAC frequency comb synthesis.
//!
//! The comb is the sum of every resonator tone, scaled so that the loudest resonator sits
//! at the DAC full scale and the rest are attenuated relative to it. Whatever headroom
//! the summed waveform needs is taken from the global DAC attenuation.

use super::tones::{synthesize_sum, SummedTones, ToneSet};
use crate::channels::dac_frequency;
use crate::config::FirmwareParams;
use crate::error::{ReadoutError, Result};
use crate::resonator::ResonatorSpec;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use statrs::function::erf::erf_inv;
use statrs::statistics::Statistics;
use std::collections::HashMap;
use std::f64::consts::SQRT_2;
use tracing::{debug, info, warn};

/// Quantized DAC comb ready for the LUT transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct DacComb {
    /// I samples, within the DAC component range.
    pub i: Vec<i32>,
    /// Q samples, within the DAC component range.
    pub q: Vec<i32>,
    /// Quantized DAC frequency of every resonator.
    pub quantized_freqs_hz: Vec<f64>,
    /// Tone phase of every resonator.
    pub phases_rad: Vec<f64>,
    /// Total DAC attenuation to apply in hardware.
    pub dac_atten_db: f64,
    /// Attenuation folded into the digital samples.
    pub rescale_db: f64,
    /// Worst peak-to-sigma ratio of the final waveform.
    pub peak_sigma: f64,
}

impl DacComb {
    /// Split the total attenuation across the two DAC attenuators.
    pub fn attenuator_split(&self) -> (f64, f64) {
        split_quarter_db(self.dac_atten_db)
    }
}

/// Split a total attenuation over two attenuators in quarter-dB steps.
pub fn split_quarter_db(total_db: f64) -> (f64, f64) {
    ((total_db * 2.0).floor() / 4.0, (total_db * 2.0).ceil() / 4.0)
}

/// Builder for [`DacComb`].
#[derive(Debug, Clone)]
pub struct DacCombBuilder<'a> {
    firmware: &'a FirmwareParams,
    seed: u64,
    avoid_spikes: bool,
    max_phase_attempts: u32,
    max_total_atten_db: f64,
}

impl<'a> DacCombBuilder<'a> {
    pub fn new(firmware: &'a FirmwareParams) -> Self {
        Self {
            firmware,
            seed: 0,
            avoid_spikes: true,
            max_phase_attempts: 100,
            max_total_atten_db: 2.0 * 31.75,
        }
    }

    /// Seed for the random tone phases.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Re-draw phases when the summed waveform peaks unusually high.
    pub fn avoid_spikes(mut self, enabled: bool) -> Self {
        self.avoid_spikes = enabled;
        self
    }

    /// Bound on phase re-draws.
    pub fn max_phase_attempts(mut self, attempts: u32) -> Self {
        self.max_phase_attempts = attempts;
        self
    }

    /// Largest attenuation the two DAC attenuators can provide together.
    pub fn max_total_atten_db(mut self, db: f64) -> Self {
        self.max_total_atten_db = db;
        self
    }

    /// Synthesize the comb for `resonators` with the LO at `lo_hz`.
    pub fn build(&self, resonators: &[ResonatorSpec], lo_hz: f64) -> Result<DacComb> {
        let fw = self.firmware;
        let resonators = if resonators.len() > fw.n_channels {
            warn!(
                requested = resonators.len(),
                capacity = fw.n_channels,
                "Too many freqs provided, truncating DAC comb"
            );
            &resonators[..fw.n_channels]
        } else {
            resonators
        };
        if resonators.is_empty() {
            return Err(ReadoutError::validation("Cannot build a DAC comb without tones"));
        }

        let max_amp = fw.dac_max_amplitude();
        let n_samples = fw.n_dac_samples();
        let mut global_atten = resonators
            .iter()
            .map(|r| r.attenuation_db)
            .fold(f64::INFINITY, f64::min);

        // Duplicate DAC tones collapse onto their first occurrence.
        let mut first_of: HashMap<u64, usize> = HashMap::new();
        let mut unique: Vec<usize> = Vec::new();
        let mut unique_idx: Vec<usize> = Vec::with_capacity(resonators.len());
        for (idx, res) in resonators.iter().enumerate() {
            let f = dac_frequency(res.frequency_hz, lo_hz, fw);
            let slot = *first_of.entry(f.to_bits()).or_insert_with(|| {
                unique.push(idx);
                unique.len() - 1
            });
            unique_idx.push(slot);
        }
        if unique.len() < resonators.len() {
            warn!(
                duplicates = resonators.len() - unique.len(),
                "Duplicate DAC frequencies share one tone"
            );
        }

        let pick = |f: &dyn Fn(&ResonatorSpec) -> f64| -> Vec<f64> {
            unique.iter().map(|&i| f(&resonators[i])).collect()
        };
        let mut tones = ToneSet::new(pick(&|r: &ResonatorSpec| dac_frequency(r.frequency_hz, lo_hz, fw)))
            .with_amplitudes(pick(&|r: &ResonatorSpec| {
                max_amp * 10f64.powf(-(r.attenuation_db - global_atten) / 20.0)
            }))
            .with_iq_ratios(pick(&|r: &ResonatorSpec| r.iq_ratio.unwrap_or(1.0)))
            .with_iq_phase_offsets_deg(pick(&|r: &ResonatorSpec| r.phase_offset_deg.unwrap_or(0.0)));
        if unique.iter().all(|&i| resonators[i].tone_phase.is_some()) {
            tones = tones.with_phases(pick(&|r: &ResonatorSpec| r.tone_phase.unwrap_or(0.0)));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut summed = synthesize_sum(&tones, n_samples, fw.dac_sample_rate, &mut rng)?;

        let expected_sigma = crest_limit(n_samples);
        let mut ratio = peak_to_sigma(&summed);
        if self.avoid_spikes && ratio.is_finite() && ratio >= expected_sigma {
            // Phases that were supplied did not work, so draw random ones.
            tones.phases = None;
            let mut attempts = 0;
            while ratio >= expected_sigma && attempts < self.max_phase_attempts {
                attempts += 1;
                debug!(
                    attempt = attempts,
                    ratio, expected_sigma, "Comb phases add up sub-optimally, redrawing"
                );
                let candidate = synthesize_sum(&tones, n_samples, fw.dac_sample_rate, &mut rng)?;
                let candidate_ratio = peak_to_sigma(&candidate);
                if candidate_ratio < ratio {
                    summed = candidate;
                    ratio = candidate_ratio;
                }
            }
            if ratio >= expected_sigma {
                warn!(
                    attempts,
                    ratio, expected_sigma, "Phase redraws exhausted, keeping best comb"
                );
            }
        }

        let highest = peak(&summed.i).max(peak(&summed.q));
        let mut rescale_db = if highest > 0.0 {
            (4.0 * 20.0 * (highest / max_amp).log10()).ceil() / 4.0
        } else {
            0.0
        };
        let (mut i_vals, mut q_vals) = rescale(&summed, rescale_db);
        if peak_int(&i_vals).max(peak_int(&q_vals)) > max_amp {
            rescale_db += 0.25;
            (i_vals, q_vals) = rescale(&summed, rescale_db);
        }

        global_atten -= rescale_db;
        if global_atten > self.max_total_atten_db {
            let reduce = global_atten - self.max_total_atten_db;
            warn!(
                unused_db = reduce,
                "Unable to fully utilize DAC dynamic range"
            );
            global_atten -= reduce;
            rescale_db += reduce;
            (i_vals, q_vals) = rescale(&summed, rescale_db);
        }

        let highest_int = peak_int(&i_vals).max(peak_int(&q_vals));
        info!(
            dac_atten_db = global_atten,
            tones = unique.len(),
            dynamic_range_pct = 100.0 * highest_int / max_amp,
            peak_sigma = ratio,
            expected_sigma,
            "Generated DAC comb"
        );

        if global_atten < 0.0 {
            return Err(ReadoutError::UnachievablePower {
                deficit_db: -global_atten,
            });
        }

        Ok(DacComb {
            i: i_vals,
            q: q_vals,
            quantized_freqs_hz: unique_idx
                .iter()
                .map(|&u| summed.quantized_freqs_hz[u])
                .collect(),
            phases_rad: unique_idx.iter().map(|&u| summed.phases_rad[u]).collect(),
            dac_atten_db: global_atten,
            rescale_db,
            peak_sigma: ratio,
        })
    }
}

fn peak(values: &[f64]) -> f64 {
    values.iter().fold(0.0, |m, v| m.max(v.abs()))
}

fn peak_int(values: &[i32]) -> f64 {
    values.iter().map(|v| v.unsigned_abs()).max().unwrap_or(0) as f64
}

/// Peak-to-sigma ratio a Gaussian waveform of `n_samples` exceeds with probability 0.1.
fn crest_limit(n_samples: usize) -> f64 {
    erf_inv((n_samples as f64 - 0.1) / n_samples as f64) * SQRT_2
}

fn peak_to_sigma(summed: &SummedTones) -> f64 {
    let si = summed.i.iter().population_std_dev();
    let sq = summed.q.iter().population_std_dev();
    if si.is_nan() || sq.is_nan() || si <= 0.0 || sq <= 0.0 {
        return f64::NAN;
    }
    (peak(&summed.i) / si).max(peak(&summed.q) / sq)
}

fn rescale(summed: &SummedTones, db: f64) -> (Vec<i32>, Vec<i32>) {
    let factor = 10f64.powf(db / 20.0);
    let conv = |v: &Vec<f64>| v.iter().map(|x| (x / factor).round() as i32).collect();
    (conv(&summed.i), conv(&summed.q))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_firmware() -> FirmwareParams {
        FirmwareParams {
            n_channels: 64,
            n_channels_per_stream: 16,
            n_fft_bins: 64,
            n_lut_rows_to_use: 128,
            ..FirmwareParams::default()
        }
    }

    fn resonators(n: usize, atten: f64) -> Vec<ResonatorSpec> {
        let res = small_firmware().dac_freq_resolution();
        (0..n)
            .map(|i| ResonatorSpec::new(i as u32, 5.0e9 + (3 + 7 * i) as f64 * res, atten))
            .collect()
    }

    #[test]
    fn deterministic_and_within_range() {
        let fw = small_firmware();
        let list = resonators(12, 40.0);
        let a = DacCombBuilder::new(&fw).build(&list, 5.0e9).unwrap();
        let b = DacCombBuilder::new(&fw).build(&list, 5.0e9).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.i.len(), fw.n_dac_samples());
        assert!(peak_int(&a.i).max(peak_int(&a.q)) <= fw.dac_max_amplitude());
        assert!(a.dac_atten_db < 40.0);
        assert_eq!((a.rescale_db * 4.0).fract(), 0.0);
        assert!(((40.0 - a.rescale_db) - a.dac_atten_db).abs() < 1e-9);
    }

    #[test]
    fn duplicates_share_phase_and_frequency() {
        let fw = small_firmware();
        let mut list = resonators(4, 40.0);
        list.push(ResonatorSpec::new(99, list[1].frequency_hz, 45.0));
        let comb = DacCombBuilder::new(&fw).build(&list, 5.0e9).unwrap();
        assert_eq!(comb.phases_rad[4], comb.phases_rad[1]);
        assert_eq!(comb.quantized_freqs_hz[4], comb.quantized_freqs_hz[1]);
    }

    #[test]
    fn unachievable_power_reports_deficit() {
        let fw = small_firmware();
        let list = resonators(20, 0.0);
        match DacCombBuilder::new(&fw).build(&list, 5.0e9) {
            Err(ReadoutError::UnachievablePower { deficit_db }) => {
                assert!(deficit_db > 0.0);
                assert_eq!((deficit_db * 4.0).fract(), 0.0);
            }
            other => panic!("expected UnachievablePower, got {:?}", other),
        }
    }

    #[test]
    fn excess_attenuation_is_moved_into_samples() {
        let fw = small_firmware();
        let list = resonators(1, 70.0);
        let comb = DacCombBuilder::new(&fw).build(&list, 5.0e9).unwrap();
        assert_eq!(comb.dac_atten_db, 63.5);
        let expected = fw.dac_max_amplitude() * 10f64.powf(-6.5 / 20.0);
        assert!((peak_int(&comb.i) - expected).abs() <= 2.0);
    }

    #[test]
    fn fixed_phases_are_kept_when_benign() {
        let fw = small_firmware();
        let mut list = resonators(2, 30.0);
        list[0].tone_phase = Some(0.5);
        list[1].tone_phase = Some(2.0);
        let comb = DacCombBuilder::new(&fw).build(&list, 5.0e9).unwrap();
        assert_eq!(comb.phases_rad, vec![0.5, 2.0]);
    }

    #[test]
    fn crest_limit_grows_with_length() {
        use statrs::function::erf::erf;
        let limit = crest_limit(fw_samples());
        let tail = (fw_samples() as f64 - 0.1) / fw_samples() as f64;
        assert!((erf(limit / SQRT_2) - tail).abs() < 1e-12);
        assert!(limit > 3.0 && limit < 5.0);
        assert!(crest_limit(1 << 18) > limit);
    }

    fn fw_samples() -> usize {
        small_firmware().n_dac_samples()
    }

    #[test]
    fn splits_attenuation() {
        assert_eq!(split_quarter_db(40.0), (20.0, 20.0));
        assert_eq!(split_quarter_db(40.25), (20.0, 20.25));
        assert!(DacCombBuilder::new(&small_firmware()).build(&[], 5.0e9).is_err());
    }
}
