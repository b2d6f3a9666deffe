//! IQ loop sweeps.
//!
//! Every stream has an IQ snapshot that records one I and one Q value per channel on each
//! rising edge of the start register. A snapshot holds two such points, each laid out as
//! `channels_per_stream` I values followed by as many Q values. Points are therefore
//! collected in pairs: the snapshots are armed before even points and read after odd ones.
//!
//! A sweep steps the LO across the configured span and records one point per step. The
//! loop centre of each resonator is the midpoint of the 5th and 95th percentiles of its I
//! and Q traces.

use crate::channels::ChannelGrid;
use crate::config::ReadoutConfig;
use crate::device::RegisterInterface;
use crate::error::{ReadoutError, Result};
use crate::transfer::UartLink;
use serde::Serialize;
use statrs::statistics::{Data, OrderStatistics, Statistics};
use std::ops::Sub;
use std::time::Duration;
use tracing::{debug, instrument};

/// Percentiles whose midpoint estimates a loop centre.
const CENTER_PERCENTILES: (usize, usize) = (5, 95);

/// A point in the IQ plane.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct IqPoint {
    pub i: f64,
    pub q: f64,
}

impl IqPoint {
    pub fn new(i: f64, q: f64) -> Self {
        Self { i, q }
    }

    /// Angle from the positive I axis, in radians.
    pub fn angle(&self) -> f64 {
        self.q.atan2(self.i)
    }
}

impl Sub for IqPoint {
    type Output = IqPoint;

    fn sub(self, rhs: IqPoint) -> IqPoint {
        IqPoint::new(self.i - rhs.i, self.q - rhs.q)
    }
}

/// IQ traces of every resonator, indexed `[resonator][point]`.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct IqTraces {
    pub i: Vec<Vec<f64>>,
    pub q: Vec<Vec<f64>>,
}

impl IqTraces {
    /// Split raw per-stream captures into one trace per resonator of `grid`.
    ///
    /// Each entry of `raw` is the concatenation of captured points of one stream.
    pub fn from_streams(raw: &[Vec<f64>], grid: &ChannelGrid) -> Result<Self> {
        let cps = grid.n_channels_per_stream();
        let stride = 2 * cps;
        let mut traces = IqTraces::default();
        for resonator in 0..grid.n_resonators() {
            let slot = grid.slot_of(resonator).ok_or_else(|| {
                ReadoutError::validation(format!("Resonator {} has no channel", resonator))
            })?;
            let data = raw.get(slot.stream).ok_or_else(|| {
                ReadoutError::validation(format!("No IQ data captured for stream {}", slot.stream))
            })?;
            let every = |first: usize| -> Vec<f64> {
                data.iter().skip(first).step_by(stride).copied().collect()
            };
            traces.i.push(every(slot.channel));
            traces.q.push(every(slot.channel + cps));
        }
        Ok(traces)
    }

    pub fn n_resonators(&self) -> usize {
        self.i.len()
    }

    /// Points per resonator.
    pub fn n_points(&self) -> usize {
        self.i.first().map(Vec::len).unwrap_or(0)
    }

    /// Average point of every resonator.
    pub fn means(&self) -> Vec<IqPoint> {
        self.i
            .iter()
            .zip(&self.q)
            .map(|(i, q)| IqPoint::new(mean(i), mean(q)))
            .collect()
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().mean()
}

fn percentile_midpoint(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut data = Data::new(values.to_vec());
    let (low, high) = CENTER_PERCENTILES;
    (data.percentile(low) + data.percentile(high)) / 2.0
}

/// Loop centre of every resonator of a sweep.
pub fn fit_loop_centers(sweep: &IqTraces) -> Vec<IqPoint> {
    sweep
        .i
        .iter()
        .zip(&sweep.q)
        .map(|(i, q)| IqPoint::new(percentile_midpoint(i), percentile_midpoint(q)))
        .collect()
}

/// Angle of each on-resonance point seen from its loop centre.
///
/// Adding this angle to a resonator's DDS phase turns its on-resonance point onto the
/// positive I axis of the loop.
pub fn loop_rotations(on_resonance: &[IqPoint], centers: &[IqPoint]) -> Vec<f64> {
    on_resonance
        .iter()
        .zip(centers)
        .map(|(point, center)| (*point - *center).angle())
        .collect()
}

/// LO offsets of a sweep, from `-span/2` up to but excluding `span/2`.
pub fn lo_offsets(span_hz: f64, step_hz: f64) -> Vec<f64> {
    if !(step_hz > 0.0 && span_hz > 0.0) {
        return Vec::new();
    }
    let n = (span_hz / step_hz - 1e-9).ceil().max(1.0) as usize;
    (0..n).map(|k| -span_hz / 2.0 + k as f64 * step_hz).collect()
}

/// Sweep results of one board.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    /// LO offset of each sweep point, in Hz.
    pub lo_offsets_hz: Vec<f64>,
    /// Synthesized tone frequency of each resonator.
    pub freqs_hz: Vec<f64>,
    pub sweep: IqTraces,
    pub centers: Vec<IqPoint>,
    /// Points taken at the board LO after the sweep.
    pub on_resonance: IqTraces,
}

/// Loop rotation applied to the DDS phases.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RotationReport {
    pub on_resonance: IqTraces,
    /// Angle added to each resonator's DDS phase.
    pub rotation_rad: Vec<f64>,
}

/// Collects IQ points from the per-stream snapshots of one board.
pub struct IqSampler<'a> {
    regs: &'a dyn RegisterInterface,
    config: &'a ReadoutConfig,
}

impl<'a> IqSampler<'a> {
    pub fn new(regs: &'a dyn RegisterInterface, config: &'a ReadoutConfig) -> Self {
        Self { regs, config }
    }

    fn settle(&self) -> Duration {
        Duration::from_millis(self.config.transfer.load_settle_ms)
    }

    /// Record one point per LO frequency. The LO is left at the last step.
    #[instrument(skip_all, fields(steps = lo_freqs_hz.len()))]
    pub async fn sweep_lo(&self, lo_freqs_hz: &[f64]) -> Result<Vec<Vec<f64>>> {
        self.collect(lo_freqs_hz.len(), Some(lo_freqs_hz)).await
    }

    /// Record `n_points` points with the LO where it is.
    #[instrument(skip(self))]
    pub async fn take_points(&self, n_points: usize) -> Result<Vec<Vec<f64>>> {
        self.collect(n_points, None).await
    }

    async fn collect(&self, n_points: usize, lo_freqs_hz: Option<&[f64]>) -> Result<Vec<Vec<f64>>> {
        let fw = &self.config.firmware;
        let names = &self.config.registers;
        let cps = fw.n_channels_per_stream;
        let n_streams = fw.n_streams();
        let snapshots = names.iq_snapshots.get(..n_streams).ok_or_else(|| {
            ReadoutError::validation(format!(
                "{} IQ snapshots configured, firmware has {} streams",
                names.iq_snapshots.len(),
                n_streams
            ))
        })?;
        let start = names.iq_snapshot_start.as_str();
        let link = UartLink::new(self.regs, self.config);
        let mut raw = vec![Vec::with_capacity(n_points * 2 * cps); n_streams];

        self.regs.write_register(start, 0, false).await?;
        for n in 0..n_points {
            if let Some(lo_hz) = lo_freqs_hz.and_then(|f| f.get(n)) {
                debug!(lo_hz, "Sweeping LO");
                link.load_lo_freq(*lo_hz).await?;
            }
            if n % 2 == 0 {
                for name in snapshots {
                    self.regs.arm_snapshot(name).await?;
                }
            }
            self.regs.write_register(start, 1, false).await?;
            tokio::time::sleep(self.settle()).await;
            if n % 2 == 1 {
                self.read_into(snapshots, &mut raw, 4 * cps).await?;
            }
            self.regs.write_register(start, 0, false).await?;
        }

        // An odd count leaves the first half of the last buffer unread.
        if n_points % 2 == 1 {
            self.regs.write_register(start, 1, false).await?;
            tokio::time::sleep(self.settle()).await;
            self.read_into(snapshots, &mut raw, 2 * cps).await?;
            self.regs.write_register(start, 0, false).await?;
        }
        Ok(raw)
    }

    async fn read_into(&self, snapshots: &[String], raw: &mut [Vec<f64>], keep: usize) -> Result<()> {
        for (name, out) in snapshots.iter().zip(raw.iter_mut()) {
            let snap = self.regs.read_snapshot(name).await?;
            let words = snap.require("iq")?;
            if words.len() < keep {
                return Err(anyhow::anyhow!(
                    "IQ snapshot {} returned {} words, expected {}",
                    name,
                    words.len(),
                    keep
                )
                .into());
            }
            out.extend_from_slice(&words[..keep]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::AllocationOrder;
    use crate::config::TransferConfig;
    use crate::device::MockRoach;
    use std::f64::consts::TAU;

    #[test]
    fn offsets_exclude_the_upper_edge() {
        let offsets = lo_offsets(1.0e6, 5.0e4);
        assert_eq!(offsets.len(), 20);
        assert_eq!(offsets[0], -5.0e5);
        assert_eq!(offsets[19], 4.5e5);
        assert_eq!(lo_offsets(1.0e6, 3.0e5).len(), 4);
        assert!(lo_offsets(1.0e6, 0.0).is_empty());
    }

    #[test]
    fn traces_follow_the_grid() {
        // Two streams of two channels, resonators spread across streams.
        let grid = ChannelGrid::allocate(3, 2, 4, AllocationOrder::RoundRobinRows).unwrap();
        // Point layout per stream: I ch0, I ch1, Q ch0, Q ch1.
        let raw = vec![
            vec![1.0, 2.0, -1.0, -2.0, 11.0, 12.0, -11.0, -12.0],
            vec![3.0, 4.0, -3.0, -4.0, 13.0, 14.0, -13.0, -14.0],
        ];
        let traces = IqTraces::from_streams(&raw, &grid).unwrap();
        assert_eq!(traces.n_resonators(), 3);
        assert_eq!(traces.n_points(), 2);
        let slot = grid.slot_of(2).unwrap();
        let expected_i = raw[slot.stream][slot.channel];
        assert_eq!(traces.i[2], vec![expected_i, expected_i + 10.0]);
        assert_eq!(traces.q[2], vec![-expected_i, -expected_i - 10.0]);
        assert_eq!(traces.means()[2], IqPoint::new(expected_i + 5.0, -expected_i - 5.0));
    }

    #[test]
    fn centre_of_an_evenly_sampled_circle() {
        let (ci, cq, r) = (1200.0, -300.0, 500.0);
        let n = 40;
        let i: Vec<f64> = (0..n).map(|k| ci + r * (TAU * k as f64 / n as f64 + 0.3).cos()).collect();
        let q: Vec<f64> = (0..n).map(|k| cq + r * (TAU * k as f64 / n as f64 + 0.3).sin()).collect();
        let centers = fit_loop_centers(&IqTraces {
            i: vec![i],
            q: vec![q],
        });
        assert!((centers[0].i - ci).abs() < 1e-6);
        assert!((centers[0].q - cq).abs() < 1e-6);
    }

    #[test]
    fn rotation_is_the_angle_from_the_centre() {
        let centers = [IqPoint::new(100.0, 100.0), IqPoint::new(0.0, 0.0)];
        let points = [IqPoint::new(100.0, 150.0), IqPoint::new(-2.0, 0.0)];
        let rotations = loop_rotations(&points, &centers);
        assert!((rotations[0] - TAU / 4.0).abs() < 1e-12);
        assert!((rotations[1] - TAU / 2.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn odd_point_counts_keep_half_a_buffer() {
        let mut config = ReadoutConfig::default();
        config.transfer = TransferConfig::immediate();
        let mock = MockRoach::new(&config);
        let sampler = IqSampler::new(&mock, &config);
        let cps = config.firmware.n_channels_per_stream;

        let raw = sampler.take_points(3).await.unwrap();
        assert_eq!(raw.len(), 4);
        assert!(raw.iter().all(|stream| stream.len() == 3 * 2 * cps));
        assert_eq!(
            mock.writes_to(&config.registers.iq_snapshot_start).await,
            vec![0, 1, 0, 1, 0, 1, 0, 1, 0]
        );
    }
}
