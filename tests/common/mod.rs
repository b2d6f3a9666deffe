//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use mkid_readout::config::{BoardConfig, FirmwareParams, ReadoutConfig, TransferConfig};
use std::io::Write;
use tempfile::NamedTempFile;

/// Small firmware geometry with zero settle times so whole pipelines run in milliseconds.
pub fn tiny_config() -> ReadoutConfig {
    let mut config = ReadoutConfig::default();
    config.transfer = TransferConfig::immediate();
    config.transfer.ready_timeout_ms = 200;
    config.transfer.lut_dump_buffer_size = 256;
    config.firmware = FirmwareParams {
        n_channels: 8,
        n_channels_per_stream: 4,
        n_fft_bins: 64,
        n_lut_rows_to_use: 128,
        n_qdr_rows: 64,
        n_cycles_to_loop_to_same_channel: 4,
        ..FirmwareParams::default()
    };
    config.calibration.threshold_snapshots = 2;
    config
}

/// Frequency list of `n` resonators a few DAC bins above 5 GHz.
pub fn freq_file(config: &ReadoutConfig, n: usize) -> NamedTempFile {
    let res = config.firmware.dac_freq_resolution();
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "# resID freqHz attenDb").unwrap();
    for i in 0..n {
        let freq = 5.0e9 + (3 + 7 * i) as f64 * res;
        writeln!(file, "{} {} 40.0", 100 + i, freq).unwrap();
    }
    file
}

/// One FIR column shared by every resonator.
pub fn fir_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "0.5\n0.25\n-0.25\n0.0").unwrap();
    file
}

/// Mock board reading the given files.
pub fn mock_board(num: u32, freqs: &NamedTempFile, firs: &NamedTempFile) -> BoardConfig {
    let mut board = BoardConfig::mock(num);
    board.freq_file = Some(freqs.path().to_path_buf());
    board.fir_file = Some(firs.path().to_path_buf());
    board
}
