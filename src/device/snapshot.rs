//! Snapshot capture buffers.
//!
//! A snapshot block captures a burst of fixed-width words into BRAM. Each word packs several
//! named fields, most significant field first. Decoded fields are returned as `f64` scaled by
//! their binary point, so a `fix16_13` phase comes back in radians and a 12-bit ADC sample as
//! a plain integer value.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Decoded contents of one snapshot read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    fields: BTreeMap<String, Vec<f64>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) {
        self.fields.insert(name.into(), values);
    }

    pub fn with_field(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.insert(name, values);
        self
    }

    pub fn field(&self, name: &str) -> Option<&[f64]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    /// Field by name, or an error naming the missing field.
    pub fn require(&self, name: &str) -> Result<&[f64]> {
        self.field(name)
            .with_context(|| format!("Snapshot has no field '{}'", name))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Number of captured words.
    pub fn len(&self) -> usize {
        self.fields.values().map(Vec::len).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Absorb the fields of another snapshot, replacing any with the same name.
    pub fn merge(&mut self, other: Snapshot) {
        self.fields.extend(other.fields);
    }
}

/// One field inside a snapshot word.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotField {
    /// Field name. Names starting with `_` are padding and are not decoded.
    pub name: String,
    pub bits: u32,
    #[serde(default)]
    pub bin_pt: u32,
    #[serde(default)]
    pub signed: bool,
}

impl SnapshotField {
    pub fn new(name: impl Into<String>, bits: u32, bin_pt: u32, signed: bool) -> Self {
        Self {
            name: name.into(),
            bits,
            bin_pt,
            signed,
        }
    }

    pub fn padding(bits: u32) -> Self {
        Self::new("_pad", bits, 0, false)
    }

    fn is_padding(&self) -> bool {
        self.name.starts_with('_')
    }
}

/// Word layout of a snapshot block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotLayout {
    /// Width of one captured word. Must be a multiple of 8 and at most 128.
    pub word_bits: u32,
    /// Fields from the most significant bit downwards.
    pub fields: Vec<SnapshotField>,
}

impl SnapshotLayout {
    /// Layout of ADC calibration snapshot `index`, which carries two I and two Q lanes.
    pub fn adc(index: usize) -> Self {
        let (a, b) = (2 * index, 2 * index + 1);
        Self {
            word_bits: 64,
            fields: vec![
                SnapshotField::padding(16),
                SnapshotField::new(format!("data_i{a}"), 12, 0, true),
                SnapshotField::new(format!("data_i{b}"), 12, 0, true),
                SnapshotField::new(format!("data_q{a}"), 12, 0, true),
                SnapshotField::new(format!("data_q{b}"), 12, 0, true),
            ],
        }
    }

    /// Layout of the selected-channel phase snapshot: a trigger flag and a `fix16_13` phase.
    pub fn phase() -> Self {
        Self {
            word_bits: 32,
            fields: vec![
                SnapshotField::padding(15),
                SnapshotField::new("trig", 1, 0, false),
                SnapshotField::new("phase", 16, 13, true),
            ],
        }
    }

    /// Layout of a per-stream IQ snapshot: one signed I or Q value per word.
    pub fn iq() -> Self {
        Self {
            word_bits: 32,
            fields: vec![SnapshotField::new("iq", 32, 0, true)],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.word_bits == 0 || self.word_bits % 8 != 0 || self.word_bits > 128 {
            bail!("Snapshot word width {} is not a byte multiple up to 128", self.word_bits);
        }
        let used: u32 = self.fields.iter().map(|f| f.bits).sum();
        if used > self.word_bits {
            bail!("Snapshot fields use {} bits of a {}-bit word", used, self.word_bits);
        }
        if let Some(f) = self.fields.iter().find(|f| f.bits == 0 || f.bits > 64) {
            bail!("Snapshot field '{}' has invalid width {}", f.name, f.bits);
        }
        Ok(())
    }

    /// Decode big-endian captured words into named fields.
    pub fn decode(&self, bytes: &[u8]) -> Result<Snapshot> {
        self.validate()?;
        let word_bytes = (self.word_bits / 8) as usize;
        if bytes.len() % word_bytes != 0 {
            bail!(
                "Snapshot length {} is not a multiple of the {}-byte word",
                bytes.len(),
                word_bytes
            );
        }

        let n_words = bytes.len() / word_bytes;
        let mut columns: Vec<Vec<f64>> = self
            .fields
            .iter()
            .map(|_| Vec::with_capacity(n_words))
            .collect();

        for chunk in bytes.chunks_exact(word_bytes) {
            let word = chunk.iter().fold(0u128, |acc, b| (acc << 8) | *b as u128);
            let mut top = self.word_bits;
            for (field, column) in self.fields.iter().zip(columns.iter_mut()) {
                top -= field.bits;
                let raw = ((word >> top) & ((1u128 << field.bits) - 1)) as u64;
                column.push(field_value(raw, field));
            }
        }

        let mut snapshot = Snapshot::new();
        for (field, column) in self.fields.iter().zip(columns) {
            if !field.is_padding() {
                snapshot.insert(field.name.clone(), column);
            }
        }
        Ok(snapshot)
    }

    /// Encode field values back into words. Used by simulated boards.
    pub fn encode(&self, snapshot: &Snapshot) -> Result<Vec<u8>> {
        self.validate()?;
        let n_words = snapshot.len();
        let word_bytes = (self.word_bits / 8) as usize;
        let mut out = Vec::with_capacity(n_words * word_bytes);
        for n in 0..n_words {
            let mut word = 0u128;
            let mut top = self.word_bits;
            for field in &self.fields {
                top -= field.bits;
                if field.is_padding() {
                    continue;
                }
                let value = snapshot.field(&field.name).and_then(|v| v.get(n)).copied().unwrap_or(0.0);
                let raw = (value * (1u64 << field.bin_pt) as f64).round() as i64 as u64;
                let masked = raw as u128 & ((1u128 << field.bits) - 1);
                word |= masked << top;
            }
            let be = word.to_be_bytes();
            out.extend_from_slice(&be[16 - word_bytes..]);
        }
        Ok(out)
    }
}

fn field_value(raw: u64, field: &SnapshotField) -> f64 {
    let value = if field.signed && field.bits < 64 && (raw >> (field.bits - 1)) & 1 == 1 {
        raw as i64 - (1i64 << field.bits)
    } else {
        raw as i64
    };
    value as f64 / (1u64 << field.bin_pt) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_phase_words() {
        // trig=1, phase=-0.5 rad (fix16_13 0xF000)
        let bytes = [0x00, 0x01, 0xF0, 0x00, 0x00, 0x00, 0x20, 0x00];
        let snap = SnapshotLayout::phase().decode(&bytes).unwrap();
        assert_eq!(snap.field("trig").unwrap(), &[1.0, 0.0]);
        assert_eq!(snap.field("phase").unwrap(), &[-0.5, 1.0]);
        assert!(snap.field("_pad").is_none());
        assert_eq!(snap.len(), 2);
    }

    #[test]
    fn adc_layout_encodes_and_decodes() {
        let layout = SnapshotLayout::adc(1);
        let snap = Snapshot::new()
            .with_field("data_i2", vec![-2048.0, 5.0])
            .with_field("data_i3", vec![2047.0, -1.0])
            .with_field("data_q2", vec![0.0, 100.0])
            .with_field("data_q3", vec![-7.0, 12.0]);
        let bytes = layout.encode(&snap).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(layout.decode(&bytes).unwrap(), snap);
    }

    #[test]
    fn iq_words_are_signed() {
        let bytes = [0xFF, 0xFF, 0xFF, 0xF6, 0x00, 0x01, 0x00, 0x00];
        let snap = SnapshotLayout::iq().decode(&bytes).unwrap();
        assert_eq!(snap.field("iq").unwrap(), &[-10.0, 65536.0]);
    }

    #[test]
    fn rejects_bad_layouts_and_lengths() {
        let layout = SnapshotLayout {
            word_bits: 16,
            fields: vec![SnapshotField::new("a", 12, 0, false), SnapshotField::new("b", 8, 0, false)],
        };
        assert!(layout.decode(&[0, 0]).is_err());
        assert!(SnapshotLayout::phase().decode(&[0, 0, 0]).is_err());
    }

    #[test]
    fn merge_and_require() {
        let mut a = Snapshot::new().with_field("x", vec![1.0]);
        a.merge(Snapshot::new().with_field("y", vec![2.0, 3.0]));
        assert_eq!(a.field_names().collect::<Vec<_>>(), vec!["x", "y"]);
        assert_eq!(a.len(), 2);
        assert!(a.require("z").is_err());
    }
}
