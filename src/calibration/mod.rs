//! Calibration of the analog front end and the digital data paths.
//!
//! - [`adc_atten`]: closed-loop search for the ADC attenuation that puts the ADC input RMS
//!   inside a target band, with I/Q balance and spectrum checks
//! - [`delay`]: tap delays of the Z-DOK data lines and bus/QDR lock checks
//! - [`iq_sweep`]: LO sweeps of the resonator IQ loops, loop centres and rotations
//! - [`triggers`]: offline emulation of the firmware photon trigger
//! - [`spectrum`]: FFT helpers used by the spike check
//!
//! Searches report a typed [`CalibrationState`]. A terminal outcome other than success
//! converts into [`CalibrationFailure`].

pub mod adc_atten;
pub mod delay;
pub mod iq_sweep;
pub mod spectrum;
pub mod triggers;

use crate::error::CalibrationFailure;
use serde::Serialize;
use std::fmt;

pub use adc_atten::{snap_zdok, AdcAttenReport, AdcAttenSearch, AdcSnapshot};
pub use delay::{check_bus_status, full_delay_cal_table, load_delay_lut, load_full_delay_cal};
pub use iq_sweep::{
    fit_loop_centers, lo_offsets, loop_rotations, IqPoint, IqSampler, IqTraces, RotationReport,
    SweepReport,
};
pub use spectrum::{find_spikes, power_spectrum_db, SpectrumSpike};
pub use triggers::{calc_sw_triggers, trigger_indices};

/// How a calibration search ended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationOutcome {
    /// The measurement landed inside the target band.
    Success,
    /// The search asked for `requested`, outside `[0, max]`.
    BoundsExceeded { requested: f64, max: f64 },
    /// The iteration budget ran out before the measurement reached the band.
    IterationLimitExceeded,
}

impl fmt::Display for CalibrationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationOutcome::Success => write!(f, "success"),
            CalibrationOutcome::BoundsExceeded { requested, max } => {
                write!(f, "bounds exceeded ({requested:.2} outside 0-{max:.2})")
            }
            CalibrationOutcome::IterationLimitExceeded => write!(f, "iteration limit exceeded"),
        }
    }
}

/// Progress of an iterative search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationState {
    /// Value applied on the last iteration.
    pub value: f64,
    /// Open band the measurement must fall into.
    pub target: (f64, f64),
    /// Adjustments made before the search ended.
    pub iterations: u32,
    /// How the search ended.
    pub result: CalibrationOutcome,
}

impl CalibrationState {
    pub fn is_success(&self) -> bool {
        self.result == CalibrationOutcome::Success
    }

    /// The failure this state represents, if any.
    pub fn failure(&self) -> Option<CalibrationFailure> {
        match self.result {
            CalibrationOutcome::Success => None,
            CalibrationOutcome::BoundsExceeded { requested, max } => {
                Some(CalibrationFailure::BoundsExceeded { requested, max })
            }
            CalibrationOutcome::IterationLimitExceeded => {
                Some(CalibrationFailure::IterationLimitExceeded {
                    iterations: self.iterations,
                    last_value: self.value,
                })
            }
        }
    }
}

/// Non-fatal findings attached to a successful calibration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationWarning {
    /// I RMS over Q RMS outside the accepted range.
    IqImbalance { ratio: f64 },
    /// Tones standing above the ADC noise floor.
    SpectrumSpikes { count: usize, worst_bin: usize, worst_excess_db: f64 },
}

impl fmt::Display for CalibrationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationWarning::IqImbalance { ratio } => {
                write!(f, "IQ balance out of range (I/Q RMS ratio {ratio:.3})")
            }
            CalibrationWarning::SpectrumSpikes {
                count,
                worst_bin,
                worst_excess_db,
            } => write!(
                f,
                "{count} spikes in ADC snap spectrum, worst at bin {worst_bin} ({worst_excess_db:.1} dB)"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_convert_to_failures() {
        let mut state = CalibrationState {
            value: 63.5,
            target: (0.15, 0.19),
            iterations: 10,
            result: CalibrationOutcome::IterationLimitExceeded,
        };
        assert_eq!(
            state.failure(),
            Some(CalibrationFailure::IterationLimitExceeded {
                iterations: 10,
                last_value: 63.5
            })
        );
        state.result = CalibrationOutcome::Success;
        assert!(state.is_success());
        assert!(state.failure().is_none());
    }

    #[test]
    fn warnings_serialize_tagged() {
        let json = serde_json::to_string(&CalibrationWarning::IqImbalance { ratio: 1.5 }).unwrap();
        assert_eq!(json, r#"{"kind":"iq_imbalance","ratio":1.5}"#);
    }
}
