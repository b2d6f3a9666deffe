//! Waveform synthesis for the DAC comb and the DDS demodulation tables.
//!
//! All synthesis is synchronous and deterministic for a given seed:
//! - [`tones`]: single tones and the FFT-based tone sum
//! - [`comb`]: the DAC comb with global attenuation bookkeeping
//! - [`dds`]: per-channel DDS tables, interleaved per stream

pub mod comb;
pub mod dds;
pub mod tones;

pub use comb::{split_quarter_db, DacComb, DacCombBuilder};
pub use dds::{DdsTones, StreamTones};
pub use tones::{generate_tones, synthesize_sum, SummedTones, ToneSet, ToneWaveform};
