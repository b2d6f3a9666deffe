//! Software emulation of the firmware photon trigger.
//!
//! Used offline on phase snapshots to check that the thresholds loaded into the capture
//! blocks fire where expected. A sample `k` triggers when:
//!
//! - at least `K - L` of the `K` phase steps leading into `k` are non-positive,
//! - the `M` steps leaving `k` are all positive,
//! - the baseline-subtracted phase at `k` is below the threshold.
//!
//! Runs of consecutive qualifying samples count as one event at their first sample. Events
//! closer than the deadtime to another event are all discarded, so a pile-up never yields
//! a trigger.

use super::spectrum::median;
use crate::config::TriggerDefaults;

/// Trigger flags for `phase`, one per sample.
pub fn calc_sw_triggers(phase: &[f64], threshold: f64, params: &TriggerDefaults) -> Vec<bool> {
    let n = phase.len();
    let k_neg = params.neg_deriv_checks;
    let m_pos = params.pos_deriv_checks;
    let need_neg = k_neg.saturating_sub(params.neg_deriv_leniency);
    let mut candidates = vec![false; n];
    if n < k_neg + m_pos + 2 {
        return candidates;
    }

    let baseline = median(phase);
    let deriv: Vec<f64> = phase.windows(2).map(|w| w[1] - w[0]).collect();

    for k in k_neg..n - m_pos - 2 {
        let falling = deriv[k - k_neg..k].iter().filter(|d| **d <= 0.0).count();
        let rising = deriv[k..k + m_pos].iter().all(|d| *d > 0.0);
        candidates[k] = falling >= need_neg && rising && phase[k] - baseline < threshold;
    }

    let onsets: Vec<usize> = (0..n)
        .filter(|&k| candidates[k] && (k == 0 || !candidates[k - 1]))
        .collect();

    let mut triggers = vec![false; n];
    for (idx, &k) in onsets.iter().enumerate() {
        let crowded_before = idx > 0 && k - onsets[idx - 1] < params.deadtime;
        let crowded_after = onsets
            .get(idx + 1)
            .is_some_and(|&next| next - k < params.deadtime);
        if !crowded_before && !crowded_after {
            triggers[k] = true;
        }
    }
    triggers
}

/// Indices where `flags` is set.
pub fn trigger_indices(flags: &[bool]) -> Vec<usize> {
    flags
        .iter()
        .enumerate()
        .filter_map(|(k, f)| f.then_some(k))
        .collect()
}
