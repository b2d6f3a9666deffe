//! Loaders for the channelizer lookup tables and per-channel registers.
//!
//! These are the plain register/memory writes of the configuration pipeline: channel
//! selection, the DDS table in QDR, the DDS pipeline lag, FIR taps, trigger thresholds,
//! IQ loop centres, board identity and the selected-channel phase snapshot. The MicroBlaze handshakes live
//! in [`crate::transfer`].

use crate::calibration::IqPoint;
use crate::channels::{BinMap, ChannelGrid};
use crate::config::{FirmwareParams, ReadoutConfig, RegisterMap};
use crate::device::RegisterInterface;
use crate::error::{ReadoutError, Result};
use crate::memory::{pack_wave, to_be_bytes, to_be_bytes_u32, MemLayout, QdrCompensation};
use crate::synth::DdsTones;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Lowest threshold the fix16_13 register holds without overflowing.
pub const MIN_THRESHOLD_RAD: f64 = -3.8;
/// Cutoff of the baseline state variable filter.
const BASELINE_CUTOFF_HZ: f64 = 200.0;
const BASELINE_SAMPLE_RATE: f64 = 1.0e6;
const BASELINE_Q: f64 = 0.7;
/// The firmware delays the trigger flag by two samples relative to the phase.
const TRIGGER_LATENCY: usize = 2;
/// IQ centre registers hold the snapshot values divided by 8.
const IQ_CENTER_SCALE: f64 = 8.0;

/// Round `value` to a `bits`-wide fixed-point word with `bin_pt` fractional bits,
/// returned as the unsigned register pattern.
pub fn to_fixed_uint(value: f64, bits: u32, bin_pt: u32) -> u32 {
    let scaled = (value * (1u64 << bin_pt) as f64).round() as i64;
    (scaled as u64 & ((1u64 << bits) - 1)) as u32
}

/// IQ centre register word: I and Q scaled down, truncated and packed as 16-bit two's
/// complement halves, I on top.
pub fn iq_center_word(center: IqPoint) -> u32 {
    let half = |v: f64| {
        let scaled = (v / IQ_CENTER_SCALE).trunc();
        scaled.clamp(i16::MIN as f64, i16::MAX as f64) as i16 as u16 as u32
    };
    (half(center.i) << 16) | half(center.q)
}

/// Seconds from January 1st 00:00 UTC of the year of `now`.
pub fn seconds_since_year_start(now: DateTime<Utc>) -> i64 {
    Utc.with_ymd_and_hms(now.year(), 1, 1, 0, 0, 0)
        .single()
        .map(|start| (now - start).num_seconds())
        .unwrap_or(0)
}

/// Captured phase of one selected channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseSnapshot {
    /// Firmware channel index, `channel + (stream << 8)`.
    pub index: usize,
    /// Phase in radians.
    pub phase: Vec<f64>,
    /// Firmware trigger flags aligned with `phase`.
    pub trig: Vec<bool>,
    /// Sample times in seconds.
    pub time: Vec<f64>,
}

// =============================================================================
// FIR coefficients
// =============================================================================

/// FIR taps read from a text matrix: one row per tap, one column per resonator.
/// A single column is shared by every resonator.
#[derive(Debug, Clone, PartialEq)]
pub struct FirCoefficients {
    columns: Vec<Vec<f64>>,
}

impl FirCoefficients {
    pub fn parse(text: &str) -> Result<Self> {
        let mut rows: Vec<Vec<f64>> = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let row = line
                .split_whitespace()
                .map(|tok| {
                    tok.parse::<f64>().map_err(|_| {
                        ReadoutError::validation(format!(
                            "FIR line {}: '{}' is not a number",
                            lineno + 1,
                            tok
                        ))
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            if let Some(first) = rows.first() {
                if first.len() != row.len() {
                    return Err(ReadoutError::validation(format!(
                        "FIR line {} has {} columns, expected {}",
                        lineno + 1,
                        row.len(),
                        first.len()
                    )));
                }
            }
            rows.push(row);
        }
        let n_cols = rows.first().map(Vec::len).unwrap_or(0);
        if n_cols == 0 {
            return Err(ReadoutError::validation("FIR coefficient file is empty"));
        }
        let columns = (0..n_cols)
            .map(|c| rows.iter().map(|r| r[c]).collect())
            .collect();
        Ok(Self { columns })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&text)
    }

    pub fn n_taps(&self) -> usize {
        self.columns.first().map(Vec::len).unwrap_or(0)
    }

    /// Whether one filter is applied to every resonator.
    pub fn is_shared(&self) -> bool {
        self.columns.len() == 1
    }

    /// Taps for resonator `index`.
    pub fn filter(&self, index: usize) -> Option<&[f64]> {
        if self.is_shared() {
            return self.columns.first().map(Vec::as_slice);
        }
        self.columns.get(index).map(Vec::as_slice)
    }

    /// Taps of `index` in firmware fixed point (truncated toward zero).
    pub fn fixed_point(&self, index: usize, bin_pt: u32) -> Option<Vec<i32>> {
        let scale = (1u64 << bin_pt) as f64;
        self.filter(index)
            .map(|taps| taps.iter().map(|c| (c * scale) as i32).collect())
    }
}

// =============================================================================
// Loader
// =============================================================================

/// Register-level loaders bound to one board.
pub struct BoardLuts<'a> {
    regs: &'a dyn RegisterInterface,
    names: &'a RegisterMap,
    firmware: &'a FirmwareParams,
    config: &'a ReadoutConfig,
}

impl<'a> BoardLuts<'a> {
    pub fn new(regs: &'a dyn RegisterInterface, config: &'a ReadoutConfig) -> Self {
        Self {
            regs,
            names: &config.registers,
            firmware: &config.firmware,
            config,
        }
    }

    fn load_settle(&self) -> Duration {
        Duration::from_millis(self.config.transfer.load_settle_ms)
    }

    fn check_stream(&self, stream: usize) -> Result<()> {
        if stream >= self.firmware.n_streams() {
            return Err(ReadoutError::validation(format!(
                "Stream {} outside 0-{}",
                stream,
                self.firmware.n_streams().saturating_sub(1)
            )));
        }
        Ok(())
    }

    fn check_channel(&self, channel: usize) -> Result<()> {
        if channel >= self.firmware.n_channels_per_stream {
            return Err(ReadoutError::validation(format!(
                "Channel {} outside 0-{}",
                channel,
                self.firmware.n_channels_per_stream - 1
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Channel selection
    // -------------------------------------------------------------------------

    /// Load the FFT bin of every channel. Rows past the grid select bin 0.
    #[instrument(skip_all)]
    pub async fn load_chan_selection(&self, bins: &BinMap) -> Result<()> {
        self.regs.write_register(&self.names.chan_sel_load, 0, false).await?;
        for channel in 0..self.firmware.n_channels_per_stream {
            self.load_single_chan_selection(&bins.row(channel), channel)
                .await?;
        }
        info!(rows = bins.rows(), "Channel selection loaded");
        Ok(())
    }

    /// Load one bin per stream into `channel`.
    pub async fn load_single_chan_selection(&self, bins: &[u32], channel: usize) -> Result<()> {
        let n_streams = self.firmware.n_streams();
        if bins.len() != n_streams {
            return Err(ReadoutError::validation(format!(
                "Need {} bins for channel {}, got {}",
                n_streams,
                channel,
                bins.len()
            )));
        }
        self.check_channel(channel)?;
        for (reg, bin) in self.names.chan_sel.iter().zip(bins) {
            self.regs.write_register(reg, *bin, false).await?;
        }
        // LSB starts the load, the bits above select the channel.
        let load = ((channel as u32) << 1) | 1;
        self.regs.write_register(&self.names.chan_sel_load, load, false).await?;
        tokio::time::sleep(self.load_settle()).await;
        self.regs.write_register(&self.names.chan_sel_load, 0, false).await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // DDS
    // -------------------------------------------------------------------------

    /// Memory layout of one QDR row of DDS samples.
    pub fn dds_layout(&self) -> MemLayout {
        MemLayout {
            bits_per_sample_pair: self.firmware.n_bits_per_dds_sample_pair,
            samples_per_cycle: self.firmware.n_dds_samples_per_cycle,
            n_mems: 1,
            bits_per_mem_row: (self.firmware.n_bytes_per_qdr_sample * 8) as u32,
            earlier_sample_is_msb: true,
        }
    }

    /// Write the DDS tables of every stream into QDR. DDS reads are paused meanwhile.
    #[instrument(skip_all)]
    pub async fn load_dds_lut(&self, dds: &DdsTones) -> Result<()> {
        if dds.streams.len() > self.names.dds_mem.len() {
            return Err(ReadoutError::validation(format!(
                "{} DDS streams but only {} QDR memories configured",
                dds.streams.len(),
                self.names.dds_mem.len()
            )));
        }
        let layout = self.dds_layout();
        let images = dds
            .streams
            .iter()
            .map(|stream| {
                let rows = pack_wave(&stream.i, &stream.q, &layout)?;
                let words: Vec<u64> = rows.iter().map(|r| r[0]).collect();
                Ok(to_be_bytes(&QdrCompensation::SwapAndRotate.apply(&words)))
            })
            .collect::<Result<Vec<Vec<u8>>>>()?;

        self.regs.write_register(&self.names.read_dds, 0, false).await?;
        for (stream, (mem, image)) in self.names.dds_mem.iter().zip(&images).enumerate() {
            debug!(stream, bytes = image.len(), "Writing QDR");
            self.regs.blind_write(mem, image, 0).await?;
        }
        self.regs.write_register(&self.names.read_dds, 1, false).await?;
        info!(streams = images.len(), "DDS LUT loaded");
        Ok(())
    }

    /// Set the lag between the DDS table and the FFT output.
    pub async fn load_dds_shift(&self, shift: u32) -> Result<u32> {
        self.regs.write_register(&self.names.dds_shift, shift, true).await?;
        debug!(shift, "DDS lag set");
        Ok(shift)
    }

    /// Measure the DDS lag the firmware needs from the lag check registers.
    #[instrument(skip_all)]
    pub async fn check_dds_shift(&self) -> Result<u32> {
        let names = self.names;
        self.regs.write_register(&names.start, 1, false).await?;
        self.regs.write_register(&names.read_dds, 1, false).await?;
        let initial = self.regs.read_register(&names.dds_shift).await? as i64;
        for edge in [0, 1, 0] {
            self.regs.write_register(&names.check_lag, edge, false).await?;
        }
        let data_ch = self.regs.read_register(&names.lag_data).await? as i64;
        let dds_ch = self.regs.read_register(&names.lag_dds).await? as i64;
        let cps = self.firmware.n_channels_per_stream as i64;
        let shift = (initial + dds_ch - data_ch + 1).rem_euclid(cps) as u32;
        debug!(initial, dds_ch, data_ch, shift, "Measured DDS lag");
        Ok(shift)
    }

    // -------------------------------------------------------------------------
    // FIR
    // -------------------------------------------------------------------------

    /// Load FIR taps into every channel. Occupied slots take their resonator's filter, the
    /// rest are zeroed. Without a grid, channel `c` of stream `s` takes column
    /// `s * channels_per_stream + c`.
    #[instrument(skip_all, fields(taps = coeffs.n_taps()))]
    pub async fn load_fir_coeffs(
        &self,
        coeffs: &FirCoefficients,
        grid: Option<&ChannelGrid>,
    ) -> Result<()> {
        let cps = self.firmware.n_channels_per_stream;
        let zeros = vec![0i32; coeffs.n_taps()];
        for stream in 0..self.firmware.n_streams() {
            let result = self
                .load_fir_stream(coeffs, grid, stream, cps, &zeros)
                .await;
            if let Err(err) = result {
                // Test firmware often implements only stream 0.
                if stream == 0 {
                    return Err(err);
                }
                error!(stream, error = %err, "Failed to write FIRs");
            }
        }
        info!(shared = coeffs.is_shared(), "FIR coefficients loaded");
        Ok(())
    }

    async fn load_fir_stream(
        &self,
        coeffs: &FirCoefficients,
        grid: Option<&ChannelGrid>,
        stream: usize,
        cps: usize,
        zeros: &[i32],
    ) -> Result<()> {
        let (load_reg, taps_mem) = match (
            self.names.fir_load_chan.get(stream),
            self.names.fir_taps_mem.get(stream),
        ) {
            (Some(load), Some(mem)) => (load, mem),
            _ => {
                return Err(ReadoutError::validation(format!(
                    "No FIR registers configured for stream {}",
                    stream
                )))
            }
        };
        self.regs.write_register(load_reg, 0, false).await?;
        for channel in 0..cps {
            let resonator = match grid {
                Some(grid) => grid.resonator_at(channel, stream),
                None => Some(stream * cps + channel),
            };
            let taps = match resonator {
                Some(res) => coeffs
                    .fixed_point(res, self.firmware.fir_bin_pt)
                    .ok_or_else(|| {
                        ReadoutError::validation(format!("No FIR filter for resonator {}", res))
                    })?,
                None => zeros.to_vec(),
            };
            let bytes = to_be_bytes_u32(&taps.iter().map(|t| *t as u32).collect::<Vec<_>>());
            self.regs.blind_write(taps_mem, &bytes, 0).await?;
            tokio::time::sleep(self.load_settle()).await;
            self.regs
                .write_register(load_reg, (1 << 8) | channel as u32, false)
                .await?;
            tokio::time::sleep(self.load_settle()).await;
            self.regs.write_register(load_reg, 0, false).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Photon capture
    // -------------------------------------------------------------------------

    /// Cap the photon count rate of every stream. Failures are logged and skipped.
    pub async fn set_max_count_rate(&self, cps_limit: u32) {
        for reg in &self.names.capture_cps_limit {
            if let Err(err) = self.regs.write_register(reg, cps_limit, false).await {
                error!(register = %reg, error = %err, "Couldn't write count rate limit");
            }
        }
    }

    /// Program the trigger threshold and baseline filter of one channel.
    ///
    /// Returns the threshold actually loaded after clamping.
    #[instrument(skip(self))]
    pub async fn set_threshold(&self, threshold_rad: f64, channel: usize, stream: usize) -> Result<f64> {
        self.check_stream(stream)?;
        self.check_channel(channel)?;
        let threshold = threshold_rad.max(MIN_THRESHOLD_RAD);
        if threshold != threshold_rad {
            warn!(threshold_rad, "Threshold clamped to {} rad", MIN_THRESHOLD_RAD);
        }
        let (kf, kq) = baseline_filter_words();
        let names = self.names;
        self.regs
            .write_register(stream_reg(&names.capture_base_kf, stream)?, kf, false)
            .await?;
        self.regs
            .write_register(stream_reg(&names.capture_base_kq, stream)?, kq, false)
            .await?;
        self.regs
            .write_register(
                stream_reg(&names.capture_threshold, stream)?,
                to_fixed_uint(threshold, 16, 13),
                false,
            )
            .await?;
        let load = stream_reg(&names.capture_load_threshold, stream)?;
        self.regs
            .write_register(load, 1 | ((channel as u32) << 1), false)
            .await?;
        tokio::time::sleep(Duration::from_millis(self.config.transfer.threshold_settle_ms)).await;
        self.regs.write_register(load, 0, false).await?;
        Ok(threshold)
    }

    /// Load the IQ loop centre of one channel.
    pub async fn load_iq_center(&self, center: IqPoint, channel: usize, stream: usize) -> Result<()> {
        self.check_stream(stream)?;
        self.check_channel(channel)?;
        let names = self.names;
        self.regs
            .write_register(
                stream_reg(&names.capture_iq_center, stream)?,
                iq_center_word(center),
                false,
            )
            .await?;
        let load = stream_reg(&names.capture_load_iq_center, stream)?;
        self.regs
            .write_register(load, 1 | ((channel as u32) << 1), false)
            .await?;
        self.regs.write_register(load, 0, false).await?;
        Ok(())
    }

    /// Capture phase from the channel with firmware index `index`.
    #[instrument(skip(self))]
    pub async fn take_phase_snapshot(&self, index: usize) -> Result<PhaseSnapshot> {
        let names = self.names;
        self.regs
            .write_register(&names.phase_snapshot_channel, index as u32, false)
            .await?;
        self.regs.arm_snapshot(&names.phase_snapshot).await?;
        tokio::time::sleep(self.load_settle()).await;
        self.regs.write_register(&names.phase_snapshot_trigger, 1, false).await?;
        tokio::time::sleep(self.load_settle()).await;
        self.regs.write_register(&names.phase_snapshot_trigger, 0, false).await?;

        let snap = self.regs.read_snapshot(&names.phase_snapshot).await?;
        let phase = snap.require("phase")?.to_vec();
        let mut trig: Vec<bool> = snap.require("trig")?.iter().map(|t| *t != 0.0).collect();
        if trig.len() > TRIGGER_LATENCY {
            trig.rotate_left(TRIGGER_LATENCY);
        }
        let dt = self.firmware.n_channels_per_stream as f64 / self.firmware.fpga_clock_rate;
        let time = (0..phase.len()).map(|n| n as f64 * dt).collect();
        Ok(PhaseSnapshot {
            index,
            phase,
            trig,
            time,
        })
    }

    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------

    pub async fn load_board_num(&self, num: u32) -> Result<()> {
        self.regs.write_register(&self.names.board_num, num, true).await?;
        Ok(())
    }

    /// Load the current time as seconds since the start of the UTC year.
    pub async fn load_timestamp(&self) -> Result<u32> {
        let seconds = seconds_since_year_start(Utc::now()).max(0) as u32;
        self.regs.write_register(&self.names.timestamp, seconds, true).await?;
        Ok(seconds)
    }
}

fn stream_reg(regs: &[String], stream: usize) -> Result<&str> {
    regs.get(stream).map(String::as_str).ok_or_else(|| {
        ReadoutError::validation(format!("No capture registers for stream {}", stream))
    })
}

/// Baseline filter coefficients `(kf, kq)` as fix18_16 register words.
pub fn baseline_filter_words() -> (u32, u32) {
    let kf = 2.0 * (std::f64::consts::PI * BASELINE_CUTOFF_HZ / BASELINE_SAMPLE_RATE).sin();
    let kq = 1.0 / BASELINE_Q;
    (to_fixed_uint(kf, 18, 16), to_fixed_uint(kq, 18, 16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::AllocationOrder;
    use crate::config::TransferConfig;
    use crate::device::{MockFaults, MockRoach};
    use crate::synth::StreamTones;

    fn config() -> ReadoutConfig {
        let mut config = ReadoutConfig::default();
        config.transfer = TransferConfig::immediate();
        config
    }

    #[test]
    fn fixed_point_words() {
        assert_eq!(to_fixed_uint(-0.1, 16, 13), 65536 - 819);
        assert_eq!(to_fixed_uint(0.5, 16, 13), 4096);
        assert_eq!(baseline_filter_words(), (82, 93623));
    }

    #[test]
    fn iq_centres_pack_signed_halves() {
        assert_eq!(iq_center_word(IqPoint::new(800.0, 80.0)), (100 << 16) | 10);
        assert_eq!(iq_center_word(IqPoint::new(-17.0, 15.9)), (0xFFFE << 16) | 1);
        assert_eq!(iq_center_word(IqPoint::new(1.0e9, -1.0e9)), (0x7FFF << 16) | 0x8000);
    }

    #[test]
    fn year_offset() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 10).single().unwrap();
        assert_eq!(seconds_since_year_start(now), 86_410);
    }

    #[test]
    fn fir_matrix_parsing() {
        let shared = FirCoefficients::parse("# taps\n0.5\n-0.25\n1e-6\n").unwrap();
        assert!(shared.is_shared());
        assert_eq!(shared.n_taps(), 3);
        assert_eq!(shared.fixed_point(42, 19).unwrap(), vec![262144, -131072, 0]);

        let per_res = FirCoefficients::parse("1 2\n3 4\n").unwrap();
        assert_eq!(per_res.filter(1).unwrap(), &[2.0, 4.0]);
        assert!(per_res.filter(2).is_none());

        assert!(FirCoefficients::parse("1 2\n3\n").is_err());
        assert!(FirCoefficients::parse("# nothing\n").is_err());
        assert!(FirCoefficients::parse("1 x\n").is_err());
    }

    #[tokio::test]
    async fn chan_selection_strobes_each_row() {
        let config = config();
        let mock = MockRoach::new(&config);
        let luts = BoardLuts::new(&mock, &config);
        luts.load_single_chan_selection(&[10, 20, 30, 40], 5).await.unwrap();
        assert_eq!(mock.register(&config.registers.chan_sel[2]).await, Some(30));
        assert_eq!(mock.writes_to(&config.registers.chan_sel_load).await, vec![11, 0]);
        assert!(luts.load_single_chan_selection(&[1, 2], 0).await.is_err());
        assert!(luts.load_single_chan_selection(&[1, 2, 3, 4], 256).await.is_err());
    }

    #[tokio::test]
    async fn dds_lut_written_with_qdr_compensation() {
        let mut config = config();
        config.firmware.n_channels = 8;
        config.firmware.n_channels_per_stream = 2;
        let mock = MockRoach::new(&config);
        let luts = BoardLuts::new(&mock, &config);

        let stream = StreamTones {
            i: vec![1, -1, 0, 0],
            q: vec![2, -2, 0, 0],
        };
        let dds = DdsTones {
            streams: vec![stream; 4],
            quantized_freqs_hz: vec![],
            phases_rad: vec![],
        };
        luts.load_dds_lut(&dds).await.unwrap();

        // Row 0 is 0x0010_02FF_FFFE; halves swapped then rotated to the last slot.
        let image = mock.memory(&config.registers.dds_mem[0]).await.unwrap();
        assert_eq!(image.len(), 16);
        assert_eq!(&image[..8], &[0; 8]);
        assert_eq!(&image[8..], &0x02FF_FFFE_0000_0010u64.to_be_bytes());
        assert_eq!(mock.writes_to(&config.registers.read_dds).await, vec![0, 1]);
    }

    #[tokio::test]
    async fn dds_shift_measured_from_lag_registers() {
        let config = config();
        let mock = MockRoach::new(&config).with_true_dds_shift(81);
        let luts = BoardLuts::new(&mock, &config);
        assert_eq!(luts.check_dds_shift().await.unwrap(), 81);
        luts.load_dds_shift(81).await.unwrap();
        assert_eq!(luts.check_dds_shift().await.unwrap(), 81);
    }

    #[tokio::test]
    async fn fir_taps_follow_the_grid() {
        let mut config = config();
        config.firmware.n_channels = 8;
        config.firmware.n_channels_per_stream = 2;
        let mock = MockRoach::new(&config);
        let luts = BoardLuts::new(&mock, &config);
        let grid = ChannelGrid::for_firmware(1, &config.firmware, AllocationOrder::RoundRobinRows)
            .unwrap();
        let coeffs = FirCoefficients::parse("1.0\n0.5\n").unwrap();
        luts.load_fir_coeffs(&coeffs, Some(&grid)).await.unwrap();

        // Channel 1 of stream 0 is padding and was written last.
        let taps = mock.memory(&config.registers.fir_taps_mem[0]).await.unwrap();
        assert_eq!(taps, vec![0; 8]);
        assert_eq!(
            mock.writes_to(&config.registers.fir_load_chan[0]).await,
            vec![0, 256, 0, 257, 0]
        );
    }

    #[tokio::test]
    async fn fir_failure_on_later_stream_is_logged() {
        let mut config = config();
        config.firmware.n_channels = 8;
        config.firmware.n_channels_per_stream = 2;
        let mock = MockRoach::new(&config).with_faults(MockFaults {
            dead_registers: vec![config.registers.fir_taps_mem[3].clone()],
            ..Default::default()
        });
        let luts = BoardLuts::new(&mock, &config);
        let coeffs = FirCoefficients::parse("1.0\n").unwrap();
        luts.load_fir_coeffs(&coeffs, None).await.unwrap();

        mock.set_faults(MockFaults {
            dead_registers: vec![config.registers.fir_taps_mem[0].clone()],
            ..Default::default()
        })
        .await;
        assert!(luts.load_fir_coeffs(&coeffs, None).await.is_err());
    }

    #[tokio::test]
    async fn threshold_is_clamped_and_latched() {
        let config = config();
        let mock = MockRoach::new(&config);
        let luts = BoardLuts::new(&mock, &config);
        let loaded = luts.set_threshold(-5.0, 3, 1).await.unwrap();
        assert_eq!(loaded, MIN_THRESHOLD_RAD);
        let names = &config.registers;
        assert_eq!(
            mock.register(&names.capture_threshold[1]).await,
            Some(to_fixed_uint(-3.8, 16, 13))
        );
        assert_eq!(mock.writes_to(&names.capture_load_threshold[1]).await, vec![7, 0]);
        assert!(luts.set_threshold(-0.1, 0, 4).await.is_err());
    }

    #[tokio::test]
    async fn iq_centre_is_latched_per_channel() {
        let config = config();
        let mock = MockRoach::new(&config);
        let luts = BoardLuts::new(&mock, &config);
        luts.load_iq_center(IqPoint::new(-800.0, 8.0), 5, 2).await.unwrap();
        let names = &config.registers;
        assert_eq!(mock.register(&names.capture_iq_center[2]).await, Some((0xFF9C << 16) | 1));
        assert_eq!(mock.writes_to(&names.capture_load_iq_center[2]).await, vec![11, 0]);
        assert!(luts.load_iq_center(IqPoint::default(), 256, 0).await.is_err());
    }

    #[tokio::test]
    async fn phase_snapshot_aligns_trigger() {
        let config = config();
        let mock = MockRoach::new(&config).with_phase_pulses(vec![100]);
        let luts = BoardLuts::new(&mock, &config);
        let snap = luts.take_phase_snapshot(3 + (1 << 8)).await.unwrap();
        assert_eq!(mock.register(&config.registers.phase_snapshot_channel).await, Some(259));
        assert_eq!(snap.phase.len(), snap.trig.len());
        let fired: Vec<usize> = snap.trig.iter().enumerate().filter(|(_, t)| **t).map(|(n, _)| n).collect();
        assert_eq!(fired, vec![112]);
        assert!((snap.time[1] - 256.0 / 250e6).abs() < 1e-15);
    }

    #[tokio::test]
    async fn count_rate_errors_do_not_abort() {
        let config = config();
        let mock = MockRoach::new(&config).with_faults(MockFaults {
            dead_registers: vec![config.registers.capture_cps_limit[0].clone()],
            ..Default::default()
        });
        let luts = BoardLuts::new(&mock, &config);
        luts.set_max_count_rate(2500).await;
        assert_eq!(mock.register(&config.registers.capture_cps_limit[3]).await, Some(2500));
    }
}
