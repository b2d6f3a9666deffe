//! Bit-exact packing of I/Q waveforms into firmware memory words.
//!
//! A memory "row" holds `samples_per_cycle` I/Q pairs. Each pair carries I in its upper
//! half and Q in its lower half, both two's complement. The row is then cut into
//! `n_mems` lanes of `bits_per_mem_row` bits, lane 0 holding the most significant bits.

use crate::error::{ReadoutError, Result};

/// Geometry of a packed waveform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemLayout {
    /// Width of one I/Q pair, I in the upper half and Q in the lower.
    pub bits_per_sample_pair: u32,
    /// Samples packed side by side into one row.
    pub samples_per_cycle: usize,
    /// Parallel memories (lanes) a row is spread over.
    pub n_mems: usize,
    /// Width of each lane.
    pub bits_per_mem_row: u32,
    /// Put the earliest sample of a cycle in the most significant position.
    pub earlier_sample_is_msb: bool,
}

impl MemLayout {
    fn validate(&self) -> Result<()> {
        if self.bits_per_sample_pair == 0
            || self.bits_per_sample_pair % 2 != 0
            || self.bits_per_sample_pair > 64
        {
            return Err(ReadoutError::validation(format!(
                "bits_per_sample_pair {} must be even and at most 64",
                self.bits_per_sample_pair
            )));
        }
        if self.bits_per_mem_row == 0 || self.bits_per_mem_row > 64 {
            return Err(ReadoutError::validation(format!(
                "bits_per_mem_row {} must be within 1..=64",
                self.bits_per_mem_row
            )));
        }
        if self.samples_per_cycle == 0 || self.n_mems == 0 {
            return Err(ReadoutError::validation(
                "samples_per_cycle and n_mems must be non-zero",
            ));
        }
        let needed = self.bits_per_sample_pair as usize * self.samples_per_cycle;
        let available = self.bits_per_mem_row as usize * self.n_mems;
        if needed > available {
            return Err(ReadoutError::validation(format!(
                "{} bits per row do not fit in {} lanes of {} bits",
                needed, self.n_mems, self.bits_per_mem_row
            )));
        }
        Ok(())
    }

    fn half_bits(&self) -> u32 {
        self.bits_per_sample_pair / 2
    }

    fn shift_of(&self, sample: usize) -> usize {
        let col = if self.earlier_sample_is_msb {
            self.samples_per_cycle - 1 - sample
        } else {
            sample
        };
        col * self.bits_per_sample_pair as usize
    }
}

fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn set_bits(words: &mut [u64], offset: usize, width: u32, value: u64) {
    let (word, bit) = (offset / 64, offset % 64);
    words[word] |= value << bit;
    if bit + width as usize > 64 {
        words[word + 1] |= value >> (64 - bit);
    }
}

fn get_bits(words: &[u64], offset: usize, width: u32) -> u64 {
    let (word, bit) = (offset / 64, offset % 64);
    let mut value = words[word] >> bit;
    if bit + width as usize > 64 {
        value |= words[word + 1] << (64 - bit);
    }
    value & mask(width)
}

fn sign_extend(value: u64, bits: u32) -> i32 {
    let shift = 64 - bits;
    (((value << shift) as i64) >> shift) as i32
}

/// Pack I/Q samples into rows of `n_mems` lanes.
pub fn pack_wave(i: &[i32], q: &[i32], layout: &MemLayout) -> Result<Vec<Vec<u64>>> {
    layout.validate()?;
    if i.len() != q.len() {
        return Err(ReadoutError::validation(format!(
            "I and Q lengths differ ({} vs {})",
            i.len(),
            q.len()
        )));
    }
    if i.len() % layout.samples_per_cycle != 0 {
        return Err(ReadoutError::validation(format!(
            "{} samples is not a whole number of {}-sample cycles",
            i.len(),
            layout.samples_per_cycle
        )));
    }

    let half = layout.half_bits();
    let limit = 1i64 << (half - 1);
    if let Some(bad) = i
        .iter()
        .chain(q)
        .find(|v| (**v as i64) < -limit || (**v as i64) >= limit)
    {
        return Err(ReadoutError::validation(format!(
            "sample {} does not fit in {} bits",
            bad, half
        )));
    }

    let lane_bits = layout.bits_per_mem_row as usize;
    let total_bits = lane_bits * layout.n_mems;
    let n_words = total_bits.div_ceil(64) + 1;
    let field = mask(half);

    let rows = i
        .chunks(layout.samples_per_cycle)
        .zip(q.chunks(layout.samples_per_cycle))
        .map(|(ic, qc)| {
            let mut words = vec![0u64; n_words];
            for (s, (iv, qv)) in ic.iter().zip(qc).enumerate() {
                let pair = ((*iv as i64 as u64 & field) << half) | (*qv as i64 as u64 & field);
                set_bits(&mut words, layout.shift_of(s), layout.bits_per_sample_pair, pair);
            }
            (0..layout.n_mems)
                .map(|m| {
                    let lane_offset = (layout.n_mems - 1 - m) * lane_bits;
                    get_bits(&words, lane_offset, layout.bits_per_mem_row)
                })
                .collect()
        })
        .collect();
    Ok(rows)
}

/// Inverse of [`pack_wave`].
pub fn unpack_wave(rows: &[Vec<u64>], layout: &MemLayout) -> Result<(Vec<i32>, Vec<i32>)> {
    layout.validate()?;
    let half = layout.half_bits();
    let lane_bits = layout.bits_per_mem_row as usize;
    let n_words = (lane_bits * layout.n_mems).div_ceil(64) + 1;

    let mut i = Vec::with_capacity(rows.len() * layout.samples_per_cycle);
    let mut q = Vec::with_capacity(rows.len() * layout.samples_per_cycle);
    for row in rows {
        if row.len() != layout.n_mems {
            return Err(ReadoutError::validation(format!(
                "row has {} lanes, layout expects {}",
                row.len(),
                layout.n_mems
            )));
        }
        let mut words = vec![0u64; n_words];
        for (m, lane) in row.iter().enumerate() {
            let lane_offset = (layout.n_mems - 1 - m) * lane_bits;
            set_bits(&mut words, lane_offset, layout.bits_per_mem_row, lane & mask(layout.bits_per_mem_row));
        }
        for s in 0..layout.samples_per_cycle {
            let pair = get_bits(&words, layout.shift_of(s), layout.bits_per_sample_pair);
            i.push(sign_extend(pair >> half, half));
            q.push(sign_extend(pair & mask(half), half));
        }
    }
    Ok((i, q))
}

/// Address and word-order correction applied before writing QDR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QdrCompensation {
    /// Write words as they are.
    None,
    /// Swap the 32-bit halves of each word and rotate the buffer left by one word.
    /// This matches the calibrated QDR interface on the ROACH2.
    #[default]
    SwapAndRotate,
}

impl QdrCompensation {
    pub fn apply(&self, words: &[u64]) -> Vec<u64> {
        match self {
            QdrCompensation::None => words.to_vec(),
            QdrCompensation::SwapAndRotate => {
                let mut out: Vec<u64> = words.iter().map(|w| w.rotate_left(32)).collect();
                if !out.is_empty() {
                    out.rotate_left(1);
                }
                out
            }
        }
    }
}

/// Serialize words big-endian.
pub fn to_be_bytes(words: &[u64]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// Serialize 32-bit words big-endian.
pub fn to_be_bytes_u32(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// Interleave the DAC comb as `[Q0, I0, Q1, I1, ...]` little-endian `i16`.
pub fn interleave_dac_lut(i: &[i32], q: &[i32]) -> Result<Vec<u8>> {
    if i.len() != q.len() {
        return Err(ReadoutError::validation(format!(
            "I and Q lengths differ ({} vs {})",
            i.len(),
            q.len()
        )));
    }
    let mut out = Vec::with_capacity(i.len() * 4);
    for (iv, qv) in i.iter().zip(q) {
        for v in [*qv, *iv] {
            let sample = i16::try_from(v).map_err(|_| {
                ReadoutError::validation(format!("DAC sample {} does not fit in 16 bits", v))
            })?;
            out.extend_from_slice(&sample.to_le_bytes());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dds_layout() -> MemLayout {
        MemLayout {
            bits_per_sample_pair: 24,
            samples_per_cycle: 2,
            n_mems: 1,
            bits_per_mem_row: 64,
            earlier_sample_is_msb: true,
        }
    }

    #[test]
    fn packs_dds_pairs_msb_first() {
        let rows = pack_wave(&[1, -1], &[2, -2], &dds_layout()).unwrap();
        assert_eq!(rows, vec![vec![0x0010_02FF_FFFE]]);

        let mut lsb_first = dds_layout();
        lsb_first.earlier_sample_is_msb = false;
        let rows = pack_wave(&[1, -1], &[2, -2], &lsb_first).unwrap();
        assert_eq!(rows, vec![vec![0xFFFF_FE00_1002]]);
    }

    #[test]
    fn splits_wide_rows_into_lanes() {
        // 8 pairs of 24 bits fill three 64-bit lanes exactly.
        let layout = MemLayout {
            bits_per_sample_pair: 24,
            samples_per_cycle: 8,
            n_mems: 3,
            bits_per_mem_row: 64,
            earlier_sample_is_msb: true,
        };
        let i: Vec<i32> = (0..8).map(|v| v * 100 - 350).collect();
        let q: Vec<i32> = (0..8).map(|v| 2047 - v * 511).collect();
        let rows = pack_wave(&i, &q, &layout).unwrap();
        assert_eq!(rows[0].len(), 3);
        // Sample 0 occupies the top 24 bits of lane 0.
        let top = rows[0][0] >> 40;
        assert_eq!(top, ((-350i64 as u64 & 0xFFF) << 12) | 2047);
        assert_eq!(unpack_wave(&rows, &layout).unwrap(), (i, q));
    }

    #[test]
    fn rejects_bad_input() {
        let layout = dds_layout();
        assert!(pack_wave(&[1], &[1, 2], &layout).is_err());
        assert!(pack_wave(&[1, 2, 3], &[1, 2, 3], &layout).is_err());
        assert!(pack_wave(&[2048, 0], &[0, 0], &layout).is_err());
        assert!(pack_wave(&[-2048, 0], &[2047, 0], &layout).is_ok());
        let too_small = MemLayout {
            n_mems: 1,
            bits_per_mem_row: 32,
            ..layout
        };
        assert!(pack_wave(&[0, 0], &[0, 0], &too_small).is_err());
    }

    #[test]
    fn qdr_swap_and_rotate() {
        let words = [0x0000_0001_0000_0002, 0x0000_0003_0000_0004];
        assert_eq!(
            QdrCompensation::SwapAndRotate.apply(&words),
            vec![0x0000_0004_0000_0003, 0x0000_0002_0000_0001]
        );
        assert_eq!(QdrCompensation::None.apply(&words), words.to_vec());
        assert_eq!(to_be_bytes(&[0x0102_0304_0506_0708])[..3], [1, 2, 3]);
    }

    #[test]
    fn dac_lut_interleaves_q_first() {
        let bytes = interleave_dac_lut(&[1, -2], &[3, 4]).unwrap();
        assert_eq!(bytes, vec![3, 0, 1, 0, 4, 0, 0xFE, 0xFF]);
        assert!(interleave_dac_lut(&[40000], &[0]).is_err());
        assert!(interleave_dac_lut(&[0, 0], &[0]).is_err());
    }
}
