//! Resonator descriptions and the frequency list file format.
//!
//! A frequency file holds one resonator per line:
//!
//! ```text
//! # resID  freqHz          attenDb  [phaseOffsDeg]  [iqRatio]
//! 10000    4.5123400e9     45.25
//! 10001    4.5251000e9     46.00    3.5             1.02
//! ```
//!
//! Blank lines and anything after `#` are ignored.

use crate::error::{ReadoutError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One resonator tone to be placed in the readout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResonatorSpec {
    /// Unique resonator identifier.
    pub id: u32,
    /// Resonant frequency in Hz.
    pub frequency_hz: f64,
    /// Requested tone attenuation in dB.
    pub attenuation_db: f64,
    /// I/Q phase imbalance correction in degrees.
    pub phase_offset_deg: Option<f64>,
    /// I/Q amplitude ratio correction.
    pub iq_ratio: Option<f64>,
    /// Fixed tone phase in radians. Drawn at random when absent.
    pub tone_phase: Option<f64>,
}

impl ResonatorSpec {
    /// Resonator with no I/Q corrections.
    pub fn new(id: u32, frequency_hz: f64, attenuation_db: f64) -> Self {
        Self {
            id,
            frequency_hz,
            attenuation_db,
            phase_offset_deg: None,
            iq_ratio: None,
            tone_phase: None,
        }
    }
}

/// Parse a frequency list from text.
pub fn parse_freq_list(text: &str) -> Result<Vec<ResonatorSpec>> {
    let mut resonators = Vec::new();
    let mut ids = HashSet::new();

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if !(3..=5).contains(&fields.len()) {
            return Err(ReadoutError::validation(format!(
                "line {}: expected 3 to 5 columns, found {}",
                lineno + 1,
                fields.len()
            )));
        }

        let num = |idx: usize| -> Result<f64> {
            fields[idx].parse::<f64>().map_err(|e| {
                ReadoutError::validation(format!(
                    "line {}: column {} '{}': {}",
                    lineno + 1,
                    idx + 1,
                    fields[idx],
                    e
                ))
            })
        };

        // IDs are written as floats by some sweep tools.
        let id_value = num(0)?;
        if id_value < 0.0 || id_value.fract() != 0.0 || id_value > u32::MAX as f64 {
            return Err(ReadoutError::validation(format!(
                "line {}: resonator id '{}' is not a non-negative integer",
                lineno + 1,
                fields[0]
            )));
        }
        let id = id_value as u32;
        if !ids.insert(id) {
            return Err(ReadoutError::validation(format!(
                "line {}: duplicate resonator id {}",
                lineno + 1,
                id
            )));
        }

        let mut spec = ResonatorSpec::new(id, num(1)?, num(2)?);
        if fields.len() > 3 {
            spec.phase_offset_deg = Some(num(3)?);
        }
        if fields.len() > 4 {
            spec.iq_ratio = Some(num(4)?);
        }
        resonators.push(spec);
    }

    Ok(resonators)
}

/// Read and parse a frequency list file.
pub fn load_freq_file(path: impl AsRef<Path>) -> Result<Vec<ResonatorSpec>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        ReadoutError::validation(format!("cannot read frequency file {}: {}", path.display(), e))
    })?;
    let resonators = parse_freq_list(&text)?;
    tracing::info!(
        file = %path.display(),
        count = resonators.len(),
        "Loaded resonator frequency list"
    );
    Ok(resonators)
}
