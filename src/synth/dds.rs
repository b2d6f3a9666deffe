//! Per-channel DDS demodulation tones.
//!
//! After channelization each resonator sits somewhere inside its coarse FFT bin. The DDS
//! tone for that channel is the residual offset from the bin centre, stored in QDR as a
//! time-multiplexed stream: for every cycle, `n_dds_samples_per_cycle` samples of channel
//! 0, then channel 1, and so on.

use super::tones::{generate_tones, ToneSet};
use crate::channels::{quantized_dac_frequency, BinMap, ChannelGrid};
use crate::config::FirmwareParams;
use crate::error::{ReadoutError, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

/// Interleaved DDS samples of one processing stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamTones {
    pub i: Vec<i32>,
    pub q: Vec<i32>,
}

/// DDS tables for all streams.
#[derive(Debug, Clone, PartialEq)]
pub struct DdsTones {
    /// One entry per stream, `[cycle][channel][sample-in-cycle]` order.
    pub streams: Vec<StreamTones>,
    /// Quantized DDS frequency of each resonator.
    pub quantized_freqs_hz: Vec<f64>,
    /// DDS phase of each resonator.
    pub phases_rad: Vec<f64>,
}

impl DdsTones {
    /// Generate DDS tables for resonators `freqs` placed on `grid` with bins `bins`.
    ///
    /// `phases` defaults to zero for every resonator.
    pub fn generate(
        grid: &ChannelGrid,
        bins: &BinMap,
        freqs: &[f64],
        lo_hz: f64,
        phases: Option<&[f64]>,
        firmware: &FirmwareParams,
    ) -> Result<Self> {
        let n_res = grid.n_resonators();
        if freqs.len() < n_res {
            return Err(ReadoutError::validation(format!(
                "grid holds {} resonators but only {} frequencies given",
                n_res,
                freqs.len()
            )));
        }
        if let Some(p) = phases {
            if p.len() < n_res {
                return Err(ReadoutError::validation(
                    "Need one DDS phase for each resonator",
                ));
            }
        }
        if grid.n_streams() != firmware.n_streams()
            || grid.n_channels_per_stream() != firmware.n_channels_per_stream
        {
            return Err(ReadoutError::validation(
                "channel grid does not match firmware stream geometry",
            ));
        }

        let dds_rate = firmware.dds_sample_rate();
        let n_samples = firmware.n_dds_samples();
        let dds_resolution = dds_rate / n_samples as f64;
        let spc = firmware.n_dds_samples_per_cycle;
        let cps = firmware.n_channels_per_stream;
        let n_cycles = n_samples / spc;
        let max_value = firmware.dds_max_amplitude();
        let spacing = firmware.fft_bin_spacing();

        let mut quantized = vec![0.0; n_res];
        let mut dds_phases = vec![0.0; n_res];
        let mut streams = Vec::with_capacity(grid.n_streams());
        // Phases are always explicit here, the generator is never consulted.
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        for stream in 0..grid.n_streams() {
            let mut out = StreamTones {
                i: vec![0; cps * n_samples],
                q: vec![0; cps * n_samples],
            };

            let members: Vec<(usize, usize)> = grid
                .column(stream)
                .enumerate()
                .filter_map(|(ch, res)| res.map(|r| (ch, r)))
                .collect();

            let freqs_dds: Vec<f64> = members
                .iter()
                .map(|&(ch, res)| {
                    let dac = quantized_dac_frequency(freqs[res], lo_hz, firmware);
                    let mut f = dac - bins.bin(ch, stream) as f64 * spacing;
                    if f < 0.0 {
                        f += dds_rate;
                    }
                    (f / dds_resolution).round() * dds_resolution
                })
                .collect();
            let tone_phases: Vec<f64> = members
                .iter()
                .map(|&(_, res)| phases.map(|p| p[res]).unwrap_or(0.0))
                .collect();

            let tones = ToneSet::new(freqs_dds).with_phases(tone_phases);
            let waves = generate_tones(&tones, n_samples, dds_rate, &mut rng)?;

            for (&(ch, res), wave) in members.iter().zip(&waves) {
                quantized[res] = wave.quantized_freq_hz;
                dds_phases[res] = wave.phase_rad;
                for t in 0..n_samples {
                    let (cycle, s) = (t / spc, t % spc);
                    let idx = cycle * cps * spc + ch * spc + s;
                    out.i[idx] = (wave.i[t] * max_value).round() as i32;
                    out.q[idx] = (wave.q[t] * max_value).round() as i32;
                }
            }
            debug!(stream, tones = members.len(), cycles = n_cycles, "Generated DDS stream");
            streams.push(out);
        }

        Ok(Self {
            streams,
            quantized_freqs_hz: quantized,
            phases_rad: dds_phases,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::AllocationOrder;
    use std::f64::consts::PI;

    fn tiny_firmware() -> FirmwareParams {
        FirmwareParams {
            n_channels: 8,
            n_channels_per_stream: 4,
            n_fft_bins: 64,
            n_lut_rows_to_use: 128,
            n_qdr_rows: 64,
            n_cycles_to_loop_to_same_channel: 4,
            ..FirmwareParams::default()
        }
    }

    #[test]
    fn tones_relative_to_bin_centre() {
        let fw = tiny_firmware();
        let lo = 5.0e9;
        let dac_res = fw.dac_freq_resolution();
        let centre = lo + 3.0 * fw.fft_bin_spacing();
        let freqs = [centre, centre + 2.0 * dac_res, centre - 2.0 * dac_res];
        let grid = ChannelGrid::for_firmware(3, &fw, AllocationOrder::SingleStream).unwrap();
        let bins = BinMap::from_grid(&grid, &freqs, lo, &fw).unwrap();
        let dds = DdsTones::generate(&grid, &bins, &freqs, lo, None, &fw).unwrap();

        assert_eq!(fw.n_dds_samples(), 32);
        let dds_res = fw.dds_sample_rate() / 32.0;
        assert_eq!(dds.quantized_freqs_hz[0], 0.0);
        assert_eq!(dds.quantized_freqs_hz[1], dds_res);
        assert_eq!(dds.quantized_freqs_hz[2], 31.0 * dds_res);

        let spc = fw.n_dds_samples_per_cycle;
        let at = |ch: usize, t: usize| (t / spc) * 4 * spc + ch * spc + t % spc;
        // Two rows: resonators 0 and 1 in stream 0, resonator 2 alone in stream 1.
        let (first, second) = (&dds.streams[0], &dds.streams[1]);
        for t in 0..32 {
            assert_eq!(first.i[at(0, t)], 2047);
            assert_eq!(first.q[at(0, t)], 0);
            let arg = 2.0 * PI * t as f64 / 32.0;
            assert_eq!(first.i[at(1, t)], (2047.0 * arg.cos()).round() as i32);
            assert_eq!(first.q[at(1, t)], (2047.0 * arg.sin()).round() as i32);
            assert_eq!(second.q[at(0, t)], -first.q[at(1, t)]);
            assert_eq!(first.i[at(2, t)], 0);
            assert_eq!(second.i[at(1, t)], 0);
        }
    }

    #[test]
    fn rejects_mismatched_geometry() {
        let fw = tiny_firmware();
        let grid = ChannelGrid::allocate(2, 4, 8, AllocationOrder::Spread).unwrap();
        let bins = BinMap::from_grid(&grid, &[5.0e9, 5.1e9], 5.0e9, &fw).unwrap();
        assert!(DdsTones::generate(&grid, &bins, &[5.0e9, 5.1e9], 5.0e9, None, &fw).is_err());
    }
}
