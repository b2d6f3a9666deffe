//! # MKID Readout Core Library
//!
//! Configuration and bring-up control for FPGA channelizer boards reading out microwave
//! kinetic inductance detectors. Each board synthesizes a comb of probe tones, splits the
//! returning band into FFT bins, mixes every resonator to baseband with a DDS and triggers
//! on phase pulses. This crate computes everything those stages need and loads it.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-backed `ReadoutConfig` (firmware geometry, register names,
//!   MicroBlaze codes, timeouts, calibration targets, boards).
//! - **`error`**: The `ReadoutError` enum and `Result` alias used across the crate.
//! - **`tracing_init`**: Subscriber setup from configuration or `RUST_LOG`.
//! - **`resonator`**: Resonator specs and the frequency list file format.
//! - **`channels`**: Stream/channel allocation, LO quantization and FFT bin selection.
//! - **`synth`**: DAC comb and DDS tone synthesis, including per-tone power scaling.
//! - **`memory`**: Packing of LUTs into DAC sample streams and QDR rows.
//! - **`device`**: The `RegisterInterface` seam, the KATCP client and the `MockRoach`
//!   simulated board.
//! - **`transfer`**: Byte-serial handshake with the MicroBlaze (UART, DAC LUT, LO, attens).
//! - **`luts`**: Register-level loads: channel selection, DDS, FIR, thresholds, loop
//!   centres, identity.
//! - **`calibration`**: ADC attenuation search, Z-DOK delay tables, IQ loop sweeps and
//!   trigger emulation.
//! - **`session`**: `ChannelizerSession`, one board's configuration pipeline.
//! - **`bringup`**: Dependency-driven command queues and per-board workers.

pub mod bringup;
pub mod calibration;
pub mod channels;
pub mod config;
pub mod device;
pub mod error;
pub mod luts;
pub mod memory;
pub mod resonator;
pub mod session;
pub mod synth;
pub mod tracing_init;
pub mod transfer;

pub use config::{BoardConfig, ReadoutConfig};
pub use error::{ReadoutError, Result};
pub use session::ChannelizerSession;
