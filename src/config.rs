//! Configuration System using Figment
//!
//! Strongly-typed configuration for the readout controller. Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/readout.toml` by default)
//! 2. Environment variables (prefixed with `MKID_`)
//!
//! Every table except `[[boards]]` carries serde defaults matching the Gen2 (DARKNESS-style)
//! firmware, so a minimal file only has to list the boards.
//!
//! # Example
//! ```no_run
//! use mkid_readout::config::ReadoutConfig;
//!
//! let config = ReadoutConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), figment::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReadoutConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Firmware geometry and sample rates
    #[serde(default)]
    pub firmware: FirmwareParams,
    /// Names of firmware registers and memories
    #[serde(default)]
    pub registers: RegisterMap,
    /// MicroBlaze command and status codes
    #[serde(default)]
    pub uart: UartCodes,
    /// Timeouts and settle times for register traffic
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Calibration targets and search limits
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Readout boards driven by this process
    #[serde(default)]
    pub boards: Vec<BoardConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

// =============================================================================
// Firmware parameters
// =============================================================================

/// Fixed geometry of the channelizer firmware.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FirmwareParams {
    /// Total channel capacity across all streams.
    pub n_channels: usize,
    /// Channels handled by one processing stream.
    pub n_channels_per_stream: usize,
    /// Coarse FFT size.
    pub n_fft_bins: usize,
    /// DAC sample rate in Hz.
    pub dac_sample_rate: f64,
    /// DAC samples emitted per FPGA cycle.
    pub n_dac_samples_per_cycle: usize,
    /// Rows of the DAC LUT in use.
    pub n_lut_rows_to_use: usize,
    /// Bits per DAC I/Q sample pair.
    pub n_bits_per_sample_pair: u32,
    /// Bits per DDS I/Q sample pair.
    pub n_bits_per_dds_sample_pair: u32,
    /// DDS samples per FPGA cycle.
    pub n_dds_samples_per_cycle: usize,
    /// FPGA fabric clock in Hz.
    pub fpga_clock_rate: f64,
    /// Cycles before the channel pipeline revisits the same channel.
    pub n_cycles_to_loop_to_same_channel: usize,
    /// Rows of each QDR memory.
    pub n_qdr_rows: usize,
    /// Bytes per QDR row.
    pub n_bytes_per_qdr_sample: usize,
    /// Binary point of the FIR coefficients.
    pub fir_bin_pt: u32,
}

impl Default for FirmwareParams {
    fn default() -> Self {
        Self {
            n_channels: 1024,
            n_channels_per_stream: 256,
            n_fft_bins: 4096,
            dac_sample_rate: 2.0e9,
            n_dac_samples_per_cycle: 8,
            n_lut_rows_to_use: 1 << 15,
            n_bits_per_sample_pair: 32,
            n_bits_per_dds_sample_pair: 24,
            n_dds_samples_per_cycle: 2,
            fpga_clock_rate: 250.0e6,
            n_cycles_to_loop_to_same_channel: 256,
            n_qdr_rows: 1 << 20,
            n_bytes_per_qdr_sample: 8,
            fir_bin_pt: 19,
        }
    }
}

impl FirmwareParams {
    /// Number of processing streams.
    pub fn n_streams(&self) -> usize {
        self.n_channels / self.n_channels_per_stream.max(1)
    }

    /// Samples in the DAC comb.
    pub fn n_dac_samples(&self) -> usize {
        self.n_dac_samples_per_cycle * self.n_lut_rows_to_use
    }

    /// Frequency step of the DAC comb.
    pub fn dac_freq_resolution(&self) -> f64 {
        self.dac_sample_rate / self.n_dac_samples() as f64
    }

    /// Spacing between FFT bin centres.
    pub fn fft_bin_spacing(&self) -> f64 {
        self.dac_sample_rate / self.n_fft_bins as f64
    }

    /// Effective sample rate seen by one DDS channel.
    pub fn dds_sample_rate(&self) -> f64 {
        self.n_dds_samples_per_cycle as f64 * self.fpga_clock_rate
            / self.n_cycles_to_loop_to_same_channel as f64
    }

    /// DDS samples stored per channel.
    pub fn n_dds_samples(&self) -> usize {
        self.n_dds_samples_per_cycle * self.n_qdr_rows / self.n_cycles_to_loop_to_same_channel
    }

    /// Largest DAC sample component.
    pub fn dac_max_amplitude(&self) -> f64 {
        max_component(self.n_bits_per_sample_pair)
    }

    /// Largest DDS sample component.
    pub fn dds_max_amplitude(&self) -> f64 {
        max_component(self.n_bits_per_dds_sample_pair)
    }

    fn validate(&self) -> Result<(), String> {
        if self.n_channels_per_stream == 0 || self.n_channels % self.n_channels_per_stream != 0 {
            return Err(format!(
                "n_channels ({}) must be a positive multiple of n_channels_per_stream ({})",
                self.n_channels, self.n_channels_per_stream
            ));
        }
        if self.n_fft_bins == 0 || self.n_lut_rows_to_use == 0 || self.n_dac_samples_per_cycle == 0
        {
            return Err("FFT and LUT sizes must be non-zero".to_string());
        }
        if self.n_cycles_to_loop_to_same_channel == 0 || self.n_dds_samples_per_cycle == 0 {
            return Err("DDS loop geometry must be non-zero".to_string());
        }
        if self.n_dds_samples() % self.n_dds_samples_per_cycle != 0 {
            return Err("n_qdr_rows must hold whole DDS cycles".to_string());
        }
        if self.n_bits_per_sample_pair % 2 != 0 || self.n_bits_per_dds_sample_pair % 2 != 0 {
            return Err("Sample pair widths must be even".to_string());
        }
        if (self.n_bits_per_dds_sample_pair as usize) * self.n_dds_samples_per_cycle
            > self.n_bytes_per_qdr_sample * 8
        {
            return Err("DDS samples per cycle do not fit in a QDR row".to_string());
        }
        if self.dac_sample_rate <= 0.0 || self.fpga_clock_rate <= 0.0 {
            return Err("Sample rates must be positive".to_string());
        }
        Ok(())
    }
}

fn max_component(pair_bits: u32) -> f64 {
    ((1_i64 << (pair_bits / 2 - 1)) - 1) as f64
}

// =============================================================================
// Register names
// =============================================================================

/// Names of the firmware registers, memories and snapshots the controller touches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegisterMap {
    pub v7_ready: String,
    pub in_byte_uart: String,
    pub tx_en_uart: String,
    pub reset_uart: String,
    pub en_bram_dump: String,
    pub lut_dump_busy: String,
    pub lut_bram_addr: String,
    pub lut_buffer_size: String,
    pub lut_dump_data_period: String,
    pub start: String,
    pub read_dds: String,
    pub dds_shift: String,
    pub check_lag: String,
    pub lag_data: String,
    pub lag_dds: String,
    pub board_num: String,
    pub timestamp: String,
    pub clock_counter: String,
    pub chan_sel_load: String,
    pub chan_sel: Vec<String>,
    pub dds_mem: Vec<String>,
    pub fir_load_chan: Vec<String>,
    pub fir_taps_mem: Vec<String>,
    pub capture_threshold: Vec<String>,
    pub capture_load_threshold: Vec<String>,
    pub capture_base_kf: Vec<String>,
    pub capture_base_kq: Vec<String>,
    pub capture_cps_limit: Vec<String>,
    pub adc_trigger: String,
    pub adc_snapshots: Vec<String>,
    pub adc_load_delay: String,
    pub adc_delay_value: String,
    pub adc_i_scale: String,
    pub run: String,
    pub zdok_bus_status: Vec<String>,
    pub qdr_status: Vec<String>,
    pub phase_snapshot: String,
    pub phase_snapshot_channel: String,
    pub phase_snapshot_trigger: String,
    /// Rising edge captures one IQ point per channel into every armed IQ snapshot.
    pub iq_snapshot_start: String,
    pub iq_snapshots: Vec<String>,
    pub capture_iq_center: Vec<String>,
    pub capture_load_iq_center: Vec<String>,
}

fn per_stream(prefix: &str, suffix: &str) -> Vec<String> {
    (0..4).map(|s| format!("{prefix}{s}{suffix}")).collect()
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            v7_ready: "a2g_ctrl_v7_ready".into(),
            in_byte_uart: "a2g_ctrl_in_byte_uart".into(),
            tx_en_uart: "a2g_ctrl_tx_en_uart".into(),
            reset_uart: "a2g_ctrl_reset_uart".into(),
            en_bram_dump: "a2g_ctrl_en_bram_dump".into(),
            lut_dump_busy: "a2g_ctrl_lut_dump_busy".into(),
            lut_bram_addr: "a2g_ctrl_lut_bram".into(),
            lut_buffer_size: "a2g_ctrl_lut_buffer_size".into(),
            lut_dump_data_period: "a2g_ctrl_lut_dump_data_period".into(),
            start: "run".into(),
            read_dds: "dds_lut_run".into(),
            dds_shift: "dds_lut_dds_shift".into(),
            check_lag: "dds_lut_check_lag".into(),
            lag_data: "dds_lut_lag_data".into(),
            lag_dds: "dds_lut_lag_dds".into(),
            board_num: "board_num".into(),
            timestamp: "start_timestamp".into(),
            clock_counter: "sys_clkcounter".into(),
            chan_sel_load: "chan_sel_load".into(),
            chan_sel: per_stream("chan_sel_ch_bin", ""),
            dds_mem: per_stream("qdr", "_memory"),
            fir_load_chan: per_stream("prog_fir", "_load_chan"),
            fir_taps_mem: per_stream("prog_fir", "_single_chan_coeffs"),
            capture_threshold: per_stream("capture", "_threshold"),
            capture_load_threshold: per_stream("capture", "_load_thresh"),
            capture_base_kf: per_stream("capture", "_base_kf"),
            capture_base_kq: per_stream("capture", "_base_kq"),
            capture_cps_limit: per_stream("capture", "_cps_lim"),
            adc_trigger: "adc_in_trig".into(),
            adc_snapshots: (0..4).map(|i| format!("adc_in_snp_cal{i}_ss")).collect(),
            adc_load_delay: "adc_in_load_dly".into(),
            adc_delay_value: "adc_in_dly_val".into(),
            adc_i_scale: "adc_in_i_scale".into(),
            run: "run".into(),
            zdok_bus_status: (0..4).map(|i| format!("adc_in_cal_ok{i}")).collect(),
            qdr_status: (0..4).map(|i| format!("qdr{i}_cal_ok")).collect(),
            phase_snapshot: "sel_phase_snp_ss".into(),
            phase_snapshot_channel: "sel_phase_snp_ch".into(),
            phase_snapshot_trigger: "sel_phase_snp_trig".into(),
            iq_snapshot_start: "iq_snp_start".into(),
            iq_snapshots: per_stream("iq_snp", "_ss"),
            capture_iq_center: per_stream("capture", "_iq_center"),
            capture_load_iq_center: per_stream("capture", "_load_iq_center"),
        }
    }
}

// =============================================================================
// MicroBlaze codes
// =============================================================================

/// Command bytes understood by the MicroBlaze and the status codes it reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UartCodes {
    pub v7_ready: u32,
    pub v7_lut_ready: u32,
    pub v7_err: u32,
    pub mb_zdok_ramp_on: u32,
    pub mb_zdok_ramp_off: u32,
    pub mb_enable_dacs: u32,
    pub mb_send_lut_to_dac: u32,
    pub mb_init_lo: u32,
    pub mb_init_atten: u32,
    pub mb_en_frac_lo: u32,
    pub mb_recv_dac_lut: u32,
    pub mb_recv_lo: u32,
    pub mb_change_atten: u32,
}

impl Default for UartCodes {
    fn default() -> Self {
        Self {
            v7_ready: 1,
            v7_lut_ready: 2,
            v7_err: 3,
            mb_zdok_ramp_on: 4,
            mb_zdok_ramp_off: 5,
            mb_enable_dacs: 6,
            mb_send_lut_to_dac: 7,
            mb_init_lo: 8,
            mb_init_atten: 9,
            mb_en_frac_lo: 10,
            mb_recv_dac_lut: 11,
            mb_recv_lo: 12,
            mb_change_atten: 13,
        }
    }
}

// =============================================================================
// Transfer timing
// =============================================================================

/// Polling budgets and settle times. All values in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Upper bound on any ready/busy poll.
    pub ready_timeout_ms: u64,
    /// Sleep between two polls of the same register.
    pub poll_interval_ms: u64,
    /// Settle after each UART strobe edge.
    pub strobe_settle_ms: u64,
    /// Settle after the UART reset pulse.
    pub uart_reset_settle_ms: u64,
    /// Settle after a LUT load strobe (channel selection, FIR).
    pub load_settle_ms: u64,
    /// Settle while a threshold is latched.
    pub threshold_settle_ms: u64,
    /// Settle after each delay tap is loaded.
    pub delay_settle_ms: u64,
    /// Settle after switching the Z-DOK calibration ramp.
    pub zdok_ramp_settle_ms: u64,
    /// Bytes per DAC LUT chunk.
    pub lut_dump_buffer_size: usize,
    /// UART baud rate towards the MicroBlaze.
    pub baud_rate: u64,
    /// Block in `initialize` until the MicroBlaze reports ready.
    pub wait_for_v7_ready: bool,
    /// TCP connect and reply timeout for the register transport.
    pub io_timeout_ms: u64,
    /// Counting window of the FPGA clock estimate.
    pub clock_estimate_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: 10_000,
            poll_interval_ms: 1,
            strobe_settle_ms: 10,
            uart_reset_settle_ms: 1000,
            load_settle_ms: 1,
            threshold_settle_ms: 3,
            delay_settle_ms: 10,
            zdok_ramp_settle_ms: 100,
            lut_dump_buffer_size: 4096,
            baud_rate: 921_600,
            wait_for_v7_ready: true,
            io_timeout_ms: 5000,
            clock_estimate_ms: 100,
        }
    }
}

impl TransferConfig {
    /// Configuration with every settle time at zero, for simulated boards.
    pub fn immediate() -> Self {
        Self {
            ready_timeout_ms: 1000,
            poll_interval_ms: 0,
            strobe_settle_ms: 0,
            uart_reset_settle_ms: 0,
            load_settle_ms: 0,
            threshold_settle_ms: 0,
            delay_settle_ms: 0,
            zdok_ramp_settle_ms: 0,
            clock_estimate_ms: 20,
            ..Self::default()
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn strobe_settle(&self) -> Duration {
        Duration::from_millis(self.strobe_settle_ms)
    }
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
    pub fn clock_estimate(&self) -> Duration {
        Duration::from_millis(self.clock_estimate_ms)
    }
}

// =============================================================================
// Calibration
// =============================================================================

/// Targets for the ADC attenuation search and defaults for trigger emulation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Lower edge of the open RMS target band (fraction of full scale).
    pub adc_rms_low: f64,
    /// Upper edge of the open RMS target band.
    pub adc_rms_high: f64,
    /// Bits in one ADC sample component.
    pub adc_bits: u32,
    /// Iteration budget of the attenuation search.
    pub adc_max_iterations: u32,
    /// Maximum setting of one attenuator in dB.
    pub max_atten_db: f64,
    /// Accepted I/Q RMS ratio before warning.
    pub iq_balance_range: (f64, f64),
    /// Spectral spike level above the median that triggers a warning.
    pub spike_threshold_db: f64,
    /// Random phase draws allowed when the DAC comb peaks too high.
    pub max_phase_attempts: u32,
    /// Tap delays per Z-DOK bus.
    pub bus_delays: Vec<u32>,
    /// First bit of each Z-DOK bus.
    pub bus_starts: Vec<u32>,
    /// Bits per Z-DOK bus.
    pub bus_bit_length: u32,
    /// Shift between DDS and FFT channels when not measured.
    pub default_dds_shift: Option<u32>,
    /// Trigger emulation defaults.
    pub triggers: TriggerDefaults,
    /// Phase snapshots per channel when deriving thresholds.
    pub threshold_snapshots: usize,
    /// Standard deviations below baseline for the trigger threshold.
    pub threshold_sigmas: f64,
    /// Photon count rate limit per channel.
    pub max_count_rate: u32,
    /// Width of the LO sweep, centred on the board LO, in Hz.
    pub sweep_lo_span_hz: f64,
    /// LO step of the sweep in Hz.
    pub sweep_lo_step_hz: f64,
    /// IQ points taken on resonance after a sweep.
    pub on_resonance_points: usize,
    /// IQ points averaged to find the loop rotation.
    pub rotation_points: usize,
}

/// Parameters of the software trigger emulation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TriggerDefaults {
    pub neg_deriv_checks: usize,
    pub neg_deriv_leniency: usize,
    pub pos_deriv_checks: usize,
    pub deadtime: usize,
}

impl Default for TriggerDefaults {
    fn default() -> Self {
        Self {
            neg_deriv_checks: 10,
            neg_deriv_leniency: 1,
            pos_deriv_checks: 2,
            deadtime: 10,
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            adc_rms_low: 0.15,
            adc_rms_high: 0.19,
            adc_bits: 12,
            adc_max_iterations: 10,
            max_atten_db: 31.75,
            iq_balance_range: (0.7, 1.3),
            spike_threshold_db: 40.0,
            max_phase_attempts: 100,
            bus_delays: vec![14, 18, 14, 13],
            bus_starts: vec![0, 14, 28, 42],
            bus_bit_length: 12,
            default_dds_shift: None,
            triggers: TriggerDefaults::default(),
            threshold_snapshots: 10,
            threshold_sigmas: 4.0,
            max_count_rate: 2500,
            sweep_lo_span_hz: 1.0e6,
            sweep_lo_step_hz: 1.0e4,
            on_resonance_points: 20,
            rotation_points: 100,
        }
    }
}

// =============================================================================
// Boards
// =============================================================================

/// One readout board.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoardConfig {
    /// Board number, conventionally the last octet of its address.
    pub num: u32,
    /// Host name or address of the board's control port.
    #[serde(default)]
    pub host: String,
    /// KATCP port.
    #[serde(default = "default_katcp_port")]
    pub port: u16,
    /// Drive a simulated board instead of a network connection.
    #[serde(default)]
    pub mock: bool,
    /// Bitstream programmed by ProgramV6.
    #[serde(default)]
    pub bitstream: Option<String>,
    /// LO frequency in Hz.
    #[serde(default = "default_lo_freq")]
    pub lo_freq: f64,
    /// Resonator list file.
    #[serde(default)]
    pub freq_file: Option<PathBuf>,
    /// FIR coefficient file.
    #[serde(default)]
    pub fir_file: Option<PathBuf>,
    /// Starting ADC attenuation in dB.
    #[serde(default = "default_adc_atten")]
    pub adc_atten: f64,
    /// Fixed trigger threshold in radians. Derived from phase noise when absent.
    #[serde(default)]
    pub threshold: Option<f64>,
}

impl BoardConfig {
    /// Mock board with defaults, used by tests and dry runs.
    pub fn mock(num: u32) -> Self {
        Self {
            num,
            host: String::new(),
            port: default_katcp_port(),
            mock: true,
            bitstream: None,
            lo_freq: default_lo_freq(),
            freq_file: None,
            fir_file: None,
            adc_atten: default_adc_atten(),
            threshold: None,
        }
    }
}

// Default value functions
fn default_app_name() -> String {
    "MKID Readout".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_katcp_port() -> u16 {
    crate::device::katcp::DEFAULT_PORT
}

fn default_lo_freq() -> f64 {
    5.0e9
}

fn default_adc_atten() -> f64 {
    31.75
}

impl ReadoutConfig {
    /// Load configuration from `config/readout.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `MKID_`.
    /// Example: `MKID_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/readout.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(ReadoutConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MKID_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        self.firmware.validate()?;

        let n_streams = self.firmware.n_streams();
        let per_stream_lists = [
            ("chan_sel", &self.registers.chan_sel),
            ("dds_mem", &self.registers.dds_mem),
            ("fir_load_chan", &self.registers.fir_load_chan),
            ("fir_taps_mem", &self.registers.fir_taps_mem),
            ("capture_threshold", &self.registers.capture_threshold),
            ("capture_load_threshold", &self.registers.capture_load_threshold),
            ("capture_base_kf", &self.registers.capture_base_kf),
            ("capture_base_kq", &self.registers.capture_base_kq),
            ("iq_snapshots", &self.registers.iq_snapshots),
            ("capture_iq_center", &self.registers.capture_iq_center),
            ("capture_load_iq_center", &self.registers.capture_load_iq_center),
        ];
        for (name, list) in per_stream_lists {
            if list.len() < n_streams {
                return Err(format!(
                    "registers.{} lists {} entries, firmware has {} streams",
                    name,
                    list.len(),
                    n_streams
                ));
            }
        }

        if self.transfer.lut_dump_buffer_size == 0 || self.transfer.lut_dump_buffer_size % 4 != 0 {
            return Err(format!(
                "lut_dump_buffer_size {} must be a positive multiple of 4",
                self.transfer.lut_dump_buffer_size
            ));
        }
        if self.transfer.baud_rate == 0 {
            return Err("baud_rate must be non-zero".to_string());
        }

        let cal = &self.calibration;
        if !(0.0..1.0).contains(&cal.adc_rms_low) || cal.adc_rms_low >= cal.adc_rms_high {
            return Err(format!(
                "Invalid ADC RMS band ({}, {})",
                cal.adc_rms_low, cal.adc_rms_high
            ));
        }
        if cal.bus_delays.len() != cal.bus_starts.len() {
            return Err("bus_delays and bus_starts must have the same length".to_string());
        }
        if !(cal.sweep_lo_step_hz > 0.0 && cal.sweep_lo_span_hz >= cal.sweep_lo_step_hz) {
            return Err(format!(
                "Sweep step {} Hz must be positive and no wider than the {} Hz span",
                cal.sweep_lo_step_hz, cal.sweep_lo_span_hz
            ));
        }
        if cal.on_resonance_points == 0 || cal.rotation_points == 0 {
            return Err("IQ point counts must be non-zero".to_string());
        }
        if cal.triggers.neg_deriv_leniency > cal.triggers.neg_deriv_checks {
            return Err("neg_deriv_leniency cannot exceed neg_deriv_checks".to_string());
        }

        let mut nums = HashSet::new();
        for board in &self.boards {
            if !nums.insert(board.num) {
                return Err(format!("Duplicate board number: {}", board.num));
            }
            if !board.mock && board.host.is_empty() {
                return Err(format!("Board {} needs a host or mock = true", board.num));
            }
        }

        Ok(())
    }

    /// Look up a board by number.
    pub fn board(&self, num: u32) -> Option<&BoardConfig> {
        self.boards.iter().find(|b| b.num == num)
    }

    /// Render the effective configuration, defaults included, as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let config = ReadoutConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.firmware.n_streams(), 4);
        assert_eq!(config.firmware.n_dac_samples(), 1 << 18);
        assert_eq!(config.firmware.n_dds_samples(), 8192);
        assert_eq!(config.firmware.dac_max_amplitude(), 32767.0);
        assert_eq!(config.firmware.dds_max_amplitude(), 2047.0);
    }

    #[test]
    fn load_from_file_merges_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[firmware]
n_channels = 512

[[boards]]
num = 220
mock = true
lo_freq = 5.5e9
"#
        )
        .unwrap();

        let config = ReadoutConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.firmware.n_channels, 512);
        assert_eq!(config.firmware.n_channels_per_stream, 256);
        assert_eq!(config.boards.len(), 1);
        assert_eq!(config.board(220).map(|b| b.lo_freq), Some(5.5e9));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rendered_config_loads_back() {
        let mut config = ReadoutConfig::default();
        let mut board = BoardConfig::mock(4);
        board.threshold = Some(-0.5);
        config.boards = vec![board];
        config.calibration.default_dds_shift = Some(76);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", config.to_toml().unwrap()).unwrap();
        let loaded = ReadoutConfig::load_from(file.path()).unwrap();
        assert_eq!(loaded.firmware, config.firmware);
        assert_eq!(loaded.registers, config.registers);
        assert_eq!(loaded.calibration, config.calibration);
        assert_eq!(loaded.boards, config.boards);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = ReadoutConfig::default();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = ReadoutConfig::default();
        config.firmware.n_channels = 1000;
        assert!(config.validate().unwrap_err().contains("multiple"));

        let mut config = ReadoutConfig::default();
        config.boards = vec![BoardConfig::mock(1), BoardConfig::mock(1)];
        assert!(config.validate().unwrap_err().contains("Duplicate"));

        let mut config = ReadoutConfig::default();
        let mut board = BoardConfig::mock(2);
        board.mock = false;
        config.boards = vec![board];
        assert!(config.validate().is_err());

        let mut config = ReadoutConfig::default();
        config.calibration.sweep_lo_step_hz = 2.0e6;
        assert!(config.validate().unwrap_err().contains("Sweep step"));

        let mut config = ReadoutConfig::default();
        config.registers.capture_iq_center.truncate(2);
        assert!(config.validate().unwrap_err().contains("capture_iq_center"));
    }
}
