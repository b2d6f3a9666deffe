//! Byte-serial link to the MicroBlaze on the ADC/DAC board.
//!
//! The FPGA exposes a tiny UART bridge: a byte register, a transmit-enable strobe and a
//! status register the MicroBlaze fills with one of the [`UartCodes`] sentinels (0 while
//! busy). Every exchange is "wait for a non-zero status, write, strobe". Large payloads such
//! as the DAC comb go through a BRAM buffer that the firmware dumps over the UART in
//! fixed-size chunks.
//!
//! All polls are bounded by `transfer.ready_timeout_ms` and fail with
//! [`HardwareProtocolError::ReadyTimeout`].

use crate::config::{ReadoutConfig, RegisterMap, TransferConfig, UartCodes};
use crate::device::RegisterInterface;
use crate::error::{HardwareProtocolError, ReadoutError, Result};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Byte the controller sends to acknowledge a UART reset.
pub const UART_ACK: u32 = 1;
/// Upper bound of one attenuator in dB.
pub const MAX_ATTEN_DB: f64 = 31.75;
/// Number of attenuators on the board.
pub const N_ATTENUATORS: u32 = 4;

/// Handshaked command channel over one board's registers.
pub struct UartLink<'a> {
    regs: &'a dyn RegisterInterface,
    names: &'a RegisterMap,
    codes: UartCodes,
    timing: &'a TransferConfig,
    fpga_clock_rate: f64,
}

impl<'a> UartLink<'a> {
    pub fn new(regs: &'a dyn RegisterInterface, config: &'a ReadoutConfig) -> Self {
        Self {
            regs,
            names: &config.registers,
            codes: config.uart,
            timing: &config.transfer,
            fpga_clock_rate: config.firmware.fpga_clock_rate,
        }
    }

    // =========================================================================
    // Primitives
    // =========================================================================

    /// Poll the status register until it leaves the busy state and return the code.
    pub async fn wait_ready(&self, operation: &str) -> Result<u32> {
        self.poll(&self.names.v7_ready, operation, |status| status != 0)
            .await
    }

    /// Poll the LUT dump busy flag until it clears.
    pub async fn wait_not_busy(&self, operation: &str) -> Result<()> {
        self.poll(&self.names.lut_dump_busy, operation, |busy| busy == 0)
            .await
            .map(|_| ())
    }

    async fn poll(&self, register: &str, operation: &str, done: impl Fn(u32) -> bool) -> Result<u32> {
        let timeout = self.timing.ready_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let value = self.regs.read_register(register).await?;
            if done(value) {
                return Ok(value);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HardwareProtocolError::ReadyTimeout {
                    register: register.to_string(),
                    operation: operation.to_string(),
                    waited_ms: timeout.as_millis() as u64,
                }
                .into());
            }
            tokio::time::sleep(self.timing.poll_interval()).await;
        }
    }

    /// Pulse the transmit-enable strobe.
    pub async fn strobe(&self) -> Result<()> {
        self.regs.write_register(&self.names.tx_en_uart, 1, false).await?;
        tokio::time::sleep(self.timing.strobe_settle()).await;
        self.regs.write_register(&self.names.tx_en_uart, 0, false).await?;
        Ok(())
    }

    /// Send one byte. With `blocking` set, wait for the MicroBlaze and return its status.
    pub async fn send_command(&self, byte: u32, blocking: bool) -> Result<Option<u32>> {
        self.regs.write_register(&self.names.in_byte_uart, byte, false).await?;
        self.strobe().await?;
        if blocking {
            return self.wait_ready("UART command").await.map(Some);
        }
        Ok(None)
    }

    async fn wait_ok(&self, operation: &str) -> Result<u32> {
        let status = self.wait_ready(operation).await?;
        if status == self.codes.v7_err {
            return Err(HardwareProtocolError::DeviceError(operation.to_string()).into());
        }
        Ok(status)
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Reset the UART bridge, program its baud divider and acknowledge the MicroBlaze.
    #[instrument(skip(self))]
    pub async fn initialize(&self, wait_for_ready: bool) -> Result<()> {
        let names = self.names;
        self.regs.write_register(&names.en_bram_dump, 0, false).await?;
        self.regs.write_register(&names.tx_en_uart, 0, false).await?;

        let period = self.dump_data_period();
        self.regs
            .write_register(&names.lut_dump_data_period, period, false)
            .await?;

        self.regs.write_register(&names.reset_uart, 1, false).await?;
        tokio::time::sleep(Duration::from_millis(self.timing.uart_reset_settle_ms)).await;
        self.regs.write_register(&names.reset_uart, 0, false).await?;

        if wait_for_ready {
            self.wait_ready("UART reset").await?;
        }
        self.send_command(UART_ACK, false).await?;
        info!(period, "UART initialized");
        Ok(())
    }

    /// FPGA cycles per UART bit group at the configured baud rate.
    pub fn dump_data_period(&self) -> u32 {
        (10.0 * self.fpga_clock_rate / self.timing.baud_rate as f64).floor() as u32 + 1
    }

    /// Enable the DACs, start the LUT playback and initialize LO and attenuators.
    #[instrument(skip(self))]
    pub async fn init_microblaze(&self) -> Result<()> {
        let codes = self.codes;
        let steps = [
            (codes.mb_enable_dacs, "enable DACs"),
            (codes.mb_send_lut_to_dac, "send LUT to DAC"),
            (codes.mb_init_lo, "initialize LO"),
            (codes.mb_init_atten, "initialize attenuators"),
            (codes.mb_en_frac_lo, "enable fractional LO"),
        ];
        let mut previous = "MicroBlaze init";
        for (byte, step) in steps {
            self.wait_ok(previous).await?;
            self.send_command(byte, false).await?;
            debug!(step, "MicroBlaze command sent");
            previous = step;
        }
        self.wait_ok(previous).await?;
        Ok(())
    }

    // =========================================================================
    // Payload transfers
    // =========================================================================

    /// Stream the interleaved DAC LUT through the BRAM dump buffer.
    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    pub async fn load_dac_lut(&self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Err(ReadoutError::validation("DAC LUT is empty"));
        }
        let status = self.wait_ready("DAC LUT").await?;
        if status == self.codes.v7_err {
            warn!("MicroBlaze reported an error before the DAC LUT load");
        }
        self.send_command(self.codes.mb_recv_dac_lut, false).await?;
        self.regs.write_register(&self.names.en_bram_dump, 1, false).await?;

        let streamed = self.stream_lut_chunks(bytes).await;
        let disabled = self.regs.write_register(&self.names.en_bram_dump, 0, false).await;
        streamed?;
        disabled?;

        self.wait_ok("DAC LUT").await?;
        info!("DAC LUT loaded");
        Ok(())
    }

    async fn stream_lut_chunks(&self, bytes: &[u8]) -> Result<()> {
        let chunk_size = self.timing.lut_dump_buffer_size;
        let n_chunks = bytes.len().div_ceil(chunk_size);
        for (index, chunk) in bytes.chunks(chunk_size).enumerate() {
            self.wait_not_busy("DAC LUT dump").await?;
            self.regs.blind_write(&self.names.lut_bram_addr, chunk, 0).await?;
            self.regs
                .write_register(&self.names.lut_buffer_size, chunk.len() as u32, false)
                .await?;
            let status = self.wait_ready("DAC LUT chunk").await?;
            if status != self.codes.v7_lut_ready {
                return Err(HardwareProtocolError::UnexpectedStatus {
                    operation: format!("DAC LUT chunk {}/{}", index + 1, n_chunks),
                    expected: self.codes.v7_lut_ready,
                    actual: status,
                }
                .into());
            }
            self.strobe().await?;
        }
        debug!(n_chunks, "DAC LUT chunks streamed");
        Ok(())
    }

    /// Set the LO synthesizer. The frequency is sent as integer MHz and a 16-bit fraction,
    /// each least significant byte first.
    #[instrument(skip(self))]
    pub async fn load_lo_freq(&self, lo_hz: f64) -> Result<()> {
        let mhz = lo_hz / 1e6;
        if !(mhz > 0.0 && mhz < 65536.0) {
            return Err(ReadoutError::validation(format!(
                "LO frequency {} Hz cannot be encoded",
                lo_hz
            )));
        }
        let bytes = lo_bytes(mhz);

        self.wait_ok("LO load").await?;
        self.send_command(self.codes.mb_recv_lo, false).await?;
        for byte in bytes {
            self.wait_ok("LO load").await?;
            self.send_command(byte as u32, false).await?;
        }
        self.wait_ok("LO load").await?;
        info!(lo_mhz = mhz, "LO set");
        Ok(())
    }

    /// Set attenuator `id` (1-4) to `atten_db` in quarter-dB steps.
    #[instrument(skip(self))]
    pub async fn change_atten(&self, id: u32, atten_db: f64) -> Result<()> {
        if !(1..=N_ATTENUATORS).contains(&id) {
            return Err(ReadoutError::validation(format!(
                "Attenuator id {} outside 1-{}",
                id, N_ATTENUATORS
            )));
        }
        if !(0.0..=MAX_ATTEN_DB).contains(&atten_db) {
            return Err(ReadoutError::validation(format!(
                "Attenuation {} dB outside 0-{} dB",
                atten_db, MAX_ATTEN_DB
            )));
        }
        let code = (atten_db * 4.0).round() as u32;

        for byte in [self.codes.mb_change_atten, id, code] {
            self.wait_ok("attenuator change").await?;
            self.send_command(byte, false).await?;
        }
        self.wait_ok("attenuator change").await?;
        debug!(id, atten_db, "Attenuator set");
        Ok(())
    }

    /// Switch the Z-DOK calibration ramp pattern.
    pub async fn zdok_ramp(&self, on: bool) -> Result<()> {
        let byte = if on {
            self.codes.mb_zdok_ramp_on
        } else {
            self.codes.mb_zdok_ramp_off
        };
        let operation = if on { "Z-DOK ramp on" } else { "Z-DOK ramp off" };
        self.wait_ok(operation).await?;
        self.send_command(byte, false).await?;
        self.wait_ok(operation).await?;
        Ok(())
    }
}

/// LO bytes in transmission order: integer MHz LSB, MSB, then fraction LSB, MSB.
pub fn lo_bytes(mhz: f64) -> [u8; 4] {
    let int = mhz.floor() as u32;
    let frac = ((mhz - mhz.floor()) * 65536.0) as u32;
    [
        (int & 0xff) as u8,
        ((int >> 8) & 0xff) as u8,
        (frac & 0xff) as u8,
        ((frac >> 8) & 0xff) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MockFaults, MockRoach};

    fn setup() -> ReadoutConfig {
        let mut config = ReadoutConfig::default();
        config.transfer = TransferConfig::immediate();
        config.transfer.ready_timeout_ms = 50;
        config.firmware.n_lut_rows_to_use = 64;
        config.transfer.lut_dump_buffer_size = 256;
        config
    }

    #[test]
    fn lo_encoding() {
        assert_eq!(lo_bytes(5000.5), [0x88, 0x13, 0x00, 0x80]);
        assert_eq!(lo_bytes(2000.0), [0xd0, 0x07, 0, 0]);
    }

    #[test]
    fn data_period_from_baud() {
        let config = ReadoutConfig::default();
        let mock = MockRoach::new(&config);
        let link = UartLink::new(&mock, &config);
        // 10 * 250e6 / 921600 = 2712.67
        assert_eq!(link.dump_data_period(), 2713);
    }

    #[tokio::test]
    async fn initialize_then_configure_lo_and_atten() {
        let config = setup();
        let mock = MockRoach::new(&config);
        let link = UartLink::new(&mock, &config);
        link.initialize(true).await.unwrap();
        link.init_microblaze().await.unwrap();
        assert!(mock.dacs_enabled().await);

        link.load_lo_freq(5.5e9).await.unwrap();
        assert_eq!(mock.lo_freq_mhz().await, Some(5500.0));
        link.change_atten(2, 12.3).await.unwrap();
        assert_eq!(mock.attenuation(2).await, 12.25);

        assert!(link.change_atten(5, 1.0).await.is_err());
        assert!(link.change_atten(1, 32.0).await.is_err());
        assert!(link.load_lo_freq(-1.0).await.is_err());
    }

    #[tokio::test]
    async fn dac_lut_arrives_in_chunks() {
        let config = setup();
        let mock = MockRoach::new(&config);
        let link = UartLink::new(&mock, &config);
        link.initialize(true).await.unwrap();

        let total = config.firmware.n_dac_samples() * 4;
        let bytes: Vec<u8> = (0..total).map(|b| (b % 251) as u8).collect();
        link.load_dac_lut(&bytes).await.unwrap();

        assert_eq!(mock.dac_lut().await, Some(bytes));
        assert_eq!(mock.writes_to(&config.registers.lut_buffer_size).await.len(), total / 256);
        assert_eq!(mock.register(&config.registers.en_bram_dump).await, Some(0));
    }

    #[tokio::test]
    async fn lut_error_status_is_reported() {
        let config = setup();
        let mock = MockRoach::new(&config).with_faults(MockFaults {
            lut_error: true,
            ..Default::default()
        });
        let link = UartLink::new(&mock, &config);
        let err = link.load_dac_lut(&[0u8; 512]).await.unwrap_err();
        assert!(matches!(
            err,
            ReadoutError::HardwareProtocol(HardwareProtocolError::UnexpectedStatus { actual: 3, .. })
        ));
        assert_eq!(mock.register(&config.registers.en_bram_dump).await, Some(0));
    }

    #[tokio::test]
    async fn stalled_microblaze_times_out() {
        let config = setup();
        let mock = MockRoach::new(&config).with_faults(MockFaults {
            stall_uart: true,
            ..Default::default()
        });
        let link = UartLink::new(&mock, &config);
        let err = link.change_atten(1, 10.0).await.unwrap_err();
        assert!(matches!(
            err,
            ReadoutError::HardwareProtocol(HardwareProtocolError::ReadyTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn lo_error_code_fails_the_load() {
        let config = setup();
        let mock = MockRoach::new(&config).with_faults(MockFaults {
            lo_error: true,
            ..Default::default()
        });
        let link = UartLink::new(&mock, &config);
        let err = link.load_lo_freq(5.0e9).await.unwrap_err();
        assert!(err.to_string().contains("LO load"));
    }
}
