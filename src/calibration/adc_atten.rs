//! ADC input level search.
//!
//! The two ADC attenuators (3 and 4) are stepped together until the RMS of both I and Q,
//! normalized to ADC full scale, falls inside the configured open band. Each step moves by
//! the mean dB distance of I and Q from the band centre, rounded to a quarter dB.

use super::spectrum::{find_spikes, power_spectrum_db};
use super::{CalibrationOutcome, CalibrationState, CalibrationWarning};
use crate::config::{ReadoutConfig, RegisterMap};
use crate::device::{RegisterInterface, Snapshot};
use crate::error::{ReadoutError, Result};
use crate::synth::split_quarter_db;
use crate::transfer::{UartLink, MAX_ATTEN_DB};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// ADC lanes captured by the four calibration snapshots.
const N_ADC_LANES: usize = 8;

/// Raw and collated ADC samples from one Z-DOK capture.
#[derive(Debug, Clone, PartialEq)]
pub struct AdcSnapshot {
    /// Every `data_i*` / `data_q*` field of the four snapshot blocks.
    pub raw: Snapshot,
    /// I samples in ADC time order.
    pub i: Vec<f64>,
    /// Q samples in ADC time order.
    pub q: Vec<f64>,
}

/// Capture the raw ADC input of all lanes and collate it into time order.
pub async fn snap_zdok(
    regs: &dyn RegisterInterface,
    names: &RegisterMap,
    settle: Duration,
) -> Result<AdcSnapshot> {
    regs.write_register(&names.adc_trigger, 0, false).await?;
    for name in &names.adc_snapshots {
        regs.arm_snapshot(name).await?;
    }
    tokio::time::sleep(settle).await;
    regs.write_register(&names.adc_trigger, 1, false).await?;
    tokio::time::sleep(settle).await;
    regs.write_register(&names.adc_trigger, 0, false).await?;

    let mut raw = Snapshot::new();
    for name in &names.adc_snapshots {
        raw.merge(regs.read_snapshot(name).await?);
    }

    let i_lanes = (0..N_ADC_LANES)
        .map(|lane| raw.require(&format!("data_i{lane}")))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let q_lanes = (0..N_ADC_LANES)
        .map(|lane| raw.require(&format!("data_q{lane}")))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let i = collate(&i_lanes);
    let q = collate(&q_lanes);
    Ok(AdcSnapshot { raw, i, q })
}

/// Interleave lanes sample by sample: `[l0[0], l1[0], ..., l7[0], l0[1], ...]`.
fn collate(lanes: &[&[f64]]) -> Vec<f64> {
    let len = lanes.iter().map(|l| l.len()).min().unwrap_or(0);
    (0..len)
        .flat_map(|n| lanes.iter().map(move |lane| lane[n]))
        .collect()
}

fn rms(values: &[f64], full_scale: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sum: f64 = values.iter().map(|v| (v / full_scale).powi(2)).sum();
    (sum / values.len() as f64).sqrt()
}

/// Result of an ADC attenuation search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdcAttenReport {
    /// Total attenuation over attenuators 3 and 4 when the search ended.
    pub atten_db: f64,
    pub state: CalibrationState,
    pub i_rms: f64,
    pub q_rms: f64,
    pub warnings: Vec<CalibrationWarning>,
}

/// Closed-loop ADC attenuation search on one board.
pub struct AdcAttenSearch<'a> {
    regs: &'a dyn RegisterInterface,
    config: &'a ReadoutConfig,
    check_spikes: bool,
}

impl<'a> AdcAttenSearch<'a> {
    pub fn new(regs: &'a dyn RegisterInterface, config: &'a ReadoutConfig) -> Self {
        Self {
            regs,
            config,
            check_spikes: true,
        }
    }

    /// Enable or disable the spectrum spike check on the final capture.
    pub fn check_spikes(mut self, enabled: bool) -> Self {
        self.check_spikes = enabled;
        self
    }

    fn max_total_db(&self) -> f64 {
        2.0 * self.config.calibration.max_atten_db.min(MAX_ATTEN_DB)
    }

    async fn apply(&self, link: &UartLink<'_>, total_db: f64) -> Result<()> {
        let (atten3, atten4) = split_quarter_db(total_db);
        debug!(atten3, atten4, "Setting ADC attenuators");
        link.change_atten(3, atten3).await?;
        link.change_atten(4, atten4).await?;
        Ok(())
    }

    /// Run the search and fail unless it converged.
    pub async fn run(&self, start_db: f64) -> Result<AdcAttenReport> {
        let report = self.search(start_db).await?;
        match report.state.failure() {
            Some(failure) => Err(failure.into()),
            None => Ok(report),
        }
    }

    /// Run the search, reporting non-convergence in the returned state.
    ///
    /// Whenever the search does not succeed both attenuators are left at maximum.
    #[instrument(skip(self))]
    pub async fn search(&self, start_db: f64) -> Result<AdcAttenReport> {
        let max_total = self.max_total_db();
        if !(0.0..=max_total).contains(&start_db) {
            return Err(ReadoutError::validation(format!(
                "Starting ADC attenuation {} dB outside 0-{} dB",
                start_db, max_total
            )));
        }
        let link = UartLink::new(self.regs, self.config);
        match self.iterate(&link, start_db).await {
            Ok(report) if report.state.is_success() => {
                info!(atten_db = report.atten_db, iterations = report.state.iterations, "ADC attenuation found");
                Ok(report)
            }
            Ok(report) => {
                error!(result = %report.state.result, "ADC attenuation search failed, setting attenuators to max");
                self.apply(&link, max_total).await?;
                Ok(report)
            }
            Err(err) => {
                if let Err(reset) = self.apply(&link, max_total).await {
                    warn!(error = %reset, "Could not reset ADC attenuators");
                }
                Err(err)
            }
        }
    }

    async fn iterate(&self, link: &UartLink<'_>, start_db: f64) -> Result<AdcAttenReport> {
        let cal = &self.config.calibration;
        let full_scale = (1u64 << cal.adc_bits.saturating_sub(1)) as f64;
        let target = (cal.adc_rms_low, cal.adc_rms_high);
        let centre = (target.0 + target.1) / 2.0;
        let in_band = |v: f64| target.0 < v && v < target.1;
        let max_total = self.max_total_db();
        let settle = Duration::from_millis(self.config.transfer.zdok_ramp_settle_ms);

        let mut current = start_db;
        let mut iterations = 0;
        loop {
            self.apply(link, current).await?;
            let snap = snap_zdok(self.regs, &self.config.registers, settle).await?;
            let i_rms = rms(&snap.i, full_scale);
            let q_rms = rms(&snap.q, full_scale);
            debug!(current, i_rms, q_rms, "ADC RMS measured");

            let state = |result| CalibrationState {
                value: current,
                target,
                iterations,
                result,
            };
            let report = |result, warnings| AdcAttenReport {
                atten_db: current,
                state: state(result),
                i_rms,
                q_rms,
                warnings,
            };

            if in_band(i_rms) && in_band(q_rms) {
                let warnings = self.inspect(&snap, i_rms, q_rms);
                return Ok(report(CalibrationOutcome::Success, warnings));
            }

            let offset_db = (20.0 * (centre / i_rms).log10() + 20.0 * (centre / q_rms).log10()) / 2.0;
            let requested = ((current - offset_db) * 4.0).round() / 4.0;
            if !(0.0..=max_total).contains(&requested) {
                warn!(requested, "Dynamic range target unachievable");
                return Ok(report(
                    CalibrationOutcome::BoundsExceeded {
                        requested,
                        max: max_total,
                    },
                    Vec::new(),
                ));
            }
            current = requested;
            iterations += 1;
            if iterations >= cal.adc_max_iterations {
                return Ok(AdcAttenReport {
                    atten_db: current,
                    state: CalibrationState {
                        value: current,
                        target,
                        iterations,
                        result: CalibrationOutcome::IterationLimitExceeded,
                    },
                    i_rms,
                    q_rms,
                    warnings: Vec::new(),
                });
            }
        }
    }

    fn inspect(&self, snap: &AdcSnapshot, i_rms: f64, q_rms: f64) -> Vec<CalibrationWarning> {
        let cal = &self.config.calibration;
        let mut warnings = Vec::new();
        let ratio = i_rms / q_rms;
        if ratio < cal.iq_balance_range.0 || ratio > cal.iq_balance_range.1 {
            warn!(ratio, "IQ balance out of range");
            warnings.push(CalibrationWarning::IqImbalance { ratio });
        }
        if self.check_spikes {
            let spikes = find_spikes(&power_spectrum_db(&snap.i, &snap.q), cal.spike_threshold_db);
            if let Some(worst) = spikes.first() {
                warn!(count = spikes.len(), bin = worst.bin, "Spikes in ADC snap spectrum");
                warnings.push(CalibrationWarning::SpectrumSpikes {
                    count: spikes.len(),
                    worst_bin: worst.bin,
                    worst_excess_db: worst.excess_db,
                });
            }
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::device::{MockFaults, MockRoach};
    use crate::error::CalibrationFailure;

    fn config() -> ReadoutConfig {
        let mut config = ReadoutConfig::default();
        config.transfer = TransferConfig::immediate();
        config
    }

    #[test]
    fn lanes_collate_in_time_order() {
        let a = [0.0, 8.0];
        let b = [1.0, 9.0];
        assert_eq!(collate(&[&a, &b]), vec![0.0, 1.0, 8.0, 9.0]);
    }

    #[tokio::test]
    async fn snapshot_collates_all_eight_lanes() {
        let config = config();
        let mock = MockRoach::new(&config);
        let snap = snap_zdok(&mock, &config.registers, Duration::ZERO).await.unwrap();
        assert_eq!(snap.i.len(), 8 * 1024);
        assert_eq!(snap.q.len(), snap.i.len());
        assert_eq!(snap.i[9], snap.raw.field("data_i1").unwrap()[1]);
        assert_eq!(mock.writes_to(&config.registers.adc_trigger).await, vec![0, 1, 0]);
    }

    #[tokio::test]
    async fn search_converges_from_max() {
        let config = config();
        let mock = MockRoach::new(&config).with_adc_target_atten(30.0);
        let report = AdcAttenSearch::new(&mock, &config).run(31.75).await.unwrap();
        assert!(report.state.is_success());
        assert!((report.atten_db - 30.0).abs() <= 0.5, "{}", report.atten_db);
        assert!(report.warnings.is_empty());
        let (a3, a4) = split_quarter_db(report.atten_db);
        assert_eq!(mock.attenuation(3).await, a3);
        assert_eq!(mock.attenuation(4).await, a4);
    }

    #[tokio::test]
    async fn unreachable_level_is_bounds_exceeded_and_maxes_attens() {
        let config = config();
        // Input so weak that even 0 dB is not enough.
        let mock = MockRoach::new(&config).with_adc_target_atten(-20.0);
        let err = AdcAttenSearch::new(&mock, &config).run(10.0).await.unwrap_err();
        assert!(matches!(
            err,
            ReadoutError::Calibration(CalibrationFailure::BoundsExceeded { .. })
        ));
        assert_eq!(mock.attenuation(3).await, 31.75);
        assert_eq!(mock.attenuation(4).await, 31.75);
    }

    #[tokio::test]
    async fn oscillating_search_hits_iteration_limit() {
        let mut config = config();
        config.calibration.adc_max_iterations = 3;
        let mock = MockRoach::new(&config).with_faults(MockFaults {
            iq_imbalance: Some(2.0),
            ..Default::default()
        });
        let report = AdcAttenSearch::new(&mock, &config).search(30.0).await.unwrap();
        assert_eq!(report.state.result, CalibrationOutcome::IterationLimitExceeded);
        assert_eq!(report.state.iterations, 3);
        assert_eq!(mock.attenuation(4).await, 31.75);
    }

    #[tokio::test]
    async fn imbalance_and_spikes_are_warnings() {
        let mut config = config();
        config.calibration.adc_rms_low = 0.10;
        config.calibration.adc_rms_high = 0.25;
        let mock = MockRoach::new(&config).with_faults(MockFaults {
            iq_imbalance: Some(1.35),
            ..Default::default()
        });
        let report = AdcAttenSearch::new(&mock, &config).run(30.0).await.unwrap();
        assert!(matches!(
            report.warnings.as_slice(),
            [CalibrationWarning::IqImbalance { .. }]
        ));

        let config = self::config();
        let mock = MockRoach::new(&config).with_faults(MockFaults {
            adc_spike: true,
            ..Default::default()
        });
        let report = AdcAttenSearch::new(&mock, &config).run(31.75).await.unwrap();
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, CalibrationWarning::SpectrumSpikes { .. })));
    }

    #[tokio::test]
    async fn start_outside_range_is_rejected() {
        let config = config();
        let mock = MockRoach::new(&config);
        assert!(AdcAttenSearch::new(&mock, &config).run(70.0).await.is_err());
    }
}
