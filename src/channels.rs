//! Channel allocation: which firmware (channel, stream) slot carries which resonator.
//!
//! The firmware splits the band into `n_streams` processing streams of
//! `n_channels / n_streams` channels each. A [`ChannelGrid`] records the assignment as a
//! `rows x streams` table of resonator indices; empty slots are padding. The [`BinMap`]
//! translates the same grid into the coarse FFT bin each slot selects.

use crate::config::FirmwareParams;
use crate::error::{ReadoutError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Ordering used to distribute resonators over streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationOrder {
    /// Each stream gets a contiguous, evenly sized run of the list.
    /// Padding sits near the end of each column.
    #[default]
    Spread,
    /// Consecutive resonators go to consecutive streams of the same row.
    RoundRobinRows,
    /// Fill every row of stream 0 before using stream 1. All padding ends up in the
    /// last streams.
    SingleStream,
}

impl fmt::Display for AllocationOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationOrder::Spread => write!(f, "spread"),
            AllocationOrder::RoundRobinRows => write!(f, "rows"),
            AllocationOrder::SingleStream => write!(f, "stream"),
        }
    }
}

impl FromStr for AllocationOrder {
    type Err = ReadoutError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "spread" | "f" => Ok(AllocationOrder::Spread),
            "rows" | "c" | "a" => Ok(AllocationOrder::RoundRobinRows),
            "stream" | "single" => Ok(AllocationOrder::SingleStream),
            other => Err(ReadoutError::validation(format!(
                "Unknown allocation order '{}'. Use spread, rows or stream",
                other
            ))),
        }
    }
}

/// Firmware location of one resonator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Slot {
    /// Channel (row) within the stream.
    pub channel: usize,
    /// Processing stream (column).
    pub stream: usize,
}

impl Slot {
    /// Combined index used by the firmware phase snapshot and threshold tables.
    pub fn firmware_index(&self) -> usize {
        self.channel + (self.stream << 8)
    }
}

/// Assignment of resonators to (channel, stream) slots.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelGrid {
    rows: usize,
    n_streams: usize,
    n_channels_per_stream: usize,
    /// Row-major cells, `None` is padding.
    cells: Vec<Option<usize>>,
    /// Slot of each resonator, indexed by resonator.
    slots: Vec<Slot>,
}

impl ChannelGrid {
    /// Distribute `n_resonators` over `n_streams` streams with `n_channels` total slots.
    ///
    /// Resonators beyond `n_channels` are dropped with a warning.
    pub fn allocate(
        n_resonators: usize,
        n_streams: usize,
        n_channels: usize,
        order: AllocationOrder,
    ) -> Result<Self> {
        if n_streams == 0 || n_channels % n_streams != 0 {
            return Err(ReadoutError::validation(format!(
                "{} channels cannot be split evenly into {} streams",
                n_channels, n_streams
            )));
        }
        let n_channels_per_stream = n_channels / n_streams;

        let n = if n_resonators > n_channels {
            warn!(
                requested = n_resonators,
                capacity = n_channels,
                "Too many freqs provided, truncating to device capacity"
            );
            n_channels
        } else {
            n_resonators
        };

        let (rows, cells) = match order {
            AllocationOrder::Spread => spread_cells(n, n_streams),
            AllocationOrder::RoundRobinRows => {
                let rows = n.div_ceil(n_streams);
                let mut cells: Vec<Option<usize>> = (0..n).map(Some).collect();
                cells.resize(rows * n_streams, None);
                (rows, cells)
            }
            AllocationOrder::SingleStream => {
                let rows = n.div_ceil(n_streams);
                let mut cells = vec![None; rows * n_streams];
                for res in 0..n {
                    let (stream, channel) = (res / rows, res % rows);
                    cells[channel * n_streams + stream] = Some(res);
                }
                (rows, cells)
            }
        };

        let mut slots = vec![Slot { channel: 0, stream: 0 }; n];
        for (idx, cell) in cells.iter().enumerate() {
            if let Some(res) = cell {
                slots[*res] = Slot {
                    channel: idx / n_streams,
                    stream: idx % n_streams,
                };
            }
        }

        debug!(resonators = n, rows, streams = n_streams, %order, "Allocated channel grid");

        Ok(Self {
            rows,
            n_streams,
            n_channels_per_stream,
            cells,
            slots,
        })
    }

    /// Allocate using the firmware's stream geometry.
    pub fn for_firmware(
        n_resonators: usize,
        firmware: &FirmwareParams,
        order: AllocationOrder,
    ) -> Result<Self> {
        Self::allocate(n_resonators, firmware.n_streams(), firmware.n_channels, order)
    }

    /// Number of occupied rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of streams (columns).
    pub fn n_streams(&self) -> usize {
        self.n_streams
    }

    /// Channel capacity of one stream.
    pub fn n_channels_per_stream(&self) -> usize {
        self.n_channels_per_stream
    }

    /// Resonators placed on the grid, after truncation.
    pub fn n_resonators(&self) -> usize {
        self.slots.len()
    }

    /// Resonator in a slot, `None` for padding or out-of-range slots.
    pub fn resonator_at(&self, channel: usize, stream: usize) -> Option<usize> {
        if channel >= self.rows || stream >= self.n_streams {
            return None;
        }
        self.cells[channel * self.n_streams + stream]
    }

    /// Slot assigned to a resonator.
    pub fn slot_of(&self, resonator: usize) -> Option<Slot> {
        self.slots.get(resonator).copied()
    }

    /// Resonators of one row, one entry per stream.
    pub fn row(&self, channel: usize) -> &[Option<usize>] {
        let start = channel * self.n_streams;
        &self.cells[start..start + self.n_streams]
    }

    /// Resonators of one stream, one entry per occupied row.
    pub fn column(&self, stream: usize) -> impl Iterator<Item = Option<usize>> + '_ {
        (0..self.rows).map(move |ch| self.resonator_at(ch, stream))
    }
}

fn spread_cells(n: usize, n_streams: usize) -> (usize, Vec<Option<usize>>) {
    let mut list: Vec<Option<usize>> = (0..n).map(Some).collect();
    let n_pads = (n_streams - n % n_streams) % n_streams;
    for i in 0..n_pads {
        let len = list.len();
        let at = len - i * len.div_ceil(n_streams);
        list.insert(at, None);
    }
    let rows = list.len() / n_streams;

    // Column-major reshape: stream s holds list[s*rows .. (s+1)*rows].
    let mut cells = vec![None; list.len()];
    for (idx, value) in list.into_iter().enumerate() {
        let stream = idx / rows.max(1);
        let channel = idx % rows.max(1);
        cells[channel * n_streams + stream] = value;
    }
    (rows, cells)
}

// =============================================================================
// Frequency helpers
// =============================================================================

/// Tone frequency as produced by the DAC for a given LO, folded into `[0, fs)`.
pub fn dac_frequency(freq_hz: f64, lo_hz: f64, firmware: &FirmwareParams) -> f64 {
    let dac = freq_hz - lo_hz;
    if dac < 0.0 {
        dac + firmware.dac_sample_rate
    } else {
        dac
    }
}

/// DAC frequency rounded to the DAC comb resolution.
pub fn quantized_dac_frequency(freq_hz: f64, lo_hz: f64, firmware: &FirmwareParams) -> f64 {
    let res = firmware.dac_freq_resolution();
    (dac_frequency(freq_hz, lo_hz, firmware) / res).round() * res
}

/// Round an LO frequency to the synthesizer grid of 2^-16 MHz and sanity check it.
///
/// Fails when every resonator is farther than half the DAC sample rate from the LO.
pub fn quantize_lo(lo_hz: f64, freqs: &[f64], firmware: &FirmwareParams) -> Result<f64> {
    let step = 2f64.powi(-16) * 1e6;
    let lo = (lo_hz / step).round() * step;

    if freqs.is_empty() {
        warn!(lo_hz = lo, "No frequency list loaded, unable to check if LO is reasonable");
        return Ok(lo);
    }

    let half = firmware.dac_sample_rate / 2.0;
    let too_far = freqs.iter().filter(|f| (*f - lo).abs() > half).count();
    if too_far == freqs.len() {
        return Err(ReadoutError::validation(format!(
            "LO out of bounds: all frequencies more than {} Hz from LO {} Hz",
            half, lo
        )));
    }
    if too_far > 0 {
        warn!(count = too_far, lo_hz = lo, "Frequencies more than half a sample rate from the LO");
    }
    Ok(lo)
}

// =============================================================================
// Bin map
// =============================================================================

/// Coarse FFT bin selected by every slot of a [`ChannelGrid`]. Padding selects bin 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinMap {
    n_streams: usize,
    bins: Vec<u32>,
}

impl BinMap {
    /// Compute bins for the resonator `freqs` placed on `grid` with LO `lo_hz`.
    pub fn from_grid(
        grid: &ChannelGrid,
        freqs: &[f64],
        lo_hz: f64,
        firmware: &FirmwareParams,
    ) -> Result<Self> {
        if freqs.len() < grid.n_resonators() {
            return Err(ReadoutError::validation(format!(
                "grid holds {} resonators but only {} frequencies given",
                grid.n_resonators(),
                freqs.len()
            )));
        }

        let spacing = firmware.fft_bin_spacing();
        let n_bins = firmware.n_fft_bins as u64;
        let bins = grid
            .cells
            .iter()
            .map(|cell| match cell {
                Some(res) => {
                    let q = quantized_dac_frequency(freqs[*res], lo_hz, firmware);
                    ((q / spacing).round() as u64 % n_bins) as u32
                }
                None => 0,
            })
            .collect();

        Ok(Self {
            n_streams: grid.n_streams,
            bins,
        })
    }

    /// Bin of one slot.
    pub fn bin(&self, channel: usize, stream: usize) -> u32 {
        self.bins
            .get(channel * self.n_streams + stream)
            .copied()
            .unwrap_or(0)
    }

    /// Bins of one row, one per stream. Rows past the grid are all padding.
    pub fn row(&self, channel: usize) -> Vec<u32> {
        (0..self.n_streams).map(|s| self.bin(channel, s)).collect()
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.bins.len() / self.n_streams.max(1)
    }
}
