//! Custom error types for the readout controller.
//!
//! This module defines the primary error type, `ReadoutError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures that occur while configuring a readout board, from
//! malformed resonator lists to a MicroBlaze that stops answering mid-transfer.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: Malformed input (mismatched list lengths, bad stream counts, missing
//!   files). Recoverable: the caller must correct the input.
//! - **`UnachievablePower`**: The requested per-tone attenuations cannot fit into the DAC
//!   dynamic range. Reported with the deficit in dB and never retried automatically.
//! - **`HardwareProtocol`**: The board answered with an unexpected status code, or a
//!   bounded ready-poll expired. Fatal to the current command.
//! - **`Calibration`**: A calibration search hit its bounds or iteration limit, or a bus
//!   failed to lock. Terminal for that calibration step.
//! - **`CommandQueue`**: A queued bring-up command failed. The queue is drained and the
//!   failure is also published as an event.
//! - **`Transport`**: Wraps `anyhow::Error` from the register transport (TCP, mock).
//! - **`Config`** / **`Io`**: Configuration loading and file access.
//!
//! By using `#[from]`, `ReadoutError` can be created from the underlying error types
//! with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, ReadoutError>;

/// Primary error type for the readout controller.
#[derive(Error, Debug)]
pub enum ReadoutError {
    /// Malformed input supplied by the caller.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested resonator powers exceed what the DAC can produce.
    #[error(
        "Desired resonator powers are unachievable. Increase resonator attens by {deficit_db:.2} dB"
    )]
    UnachievablePower {
        /// Additional attenuation required, in dB.
        deficit_db: f64,
    },

    /// Unexpected device status during a handshaked transfer.
    #[error("Hardware protocol error: {0}")]
    HardwareProtocol(#[from] HardwareProtocolError),

    /// A calibration step terminated without success.
    #[error("Calibration failed: {0}")]
    Calibration(#[from] CalibrationFailure),

    /// A queued bring-up command raised an error.
    #[error("Command '{command}' failed: {source}")]
    CommandQueue {
        /// Human readable command name.
        command: String,
        /// Underlying failure.
        #[source]
        source: Box<ReadoutError>,
    },

    /// Failure reported by the register transport.
    #[error("Transport error: {0:#}")]
    Transport(#[from] anyhow::Error),

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Filesystem access failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReadoutError {
    /// Build a validation error from anything displayable.
    pub fn validation(msg: impl Into<String>) -> Self {
        ReadoutError::Validation(msg.into())
    }

    /// Whether the caller can fix the problem by correcting its input.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ReadoutError::Validation(_) | ReadoutError::UnachievablePower { .. }
        )
    }
}

impl From<figment::Error> for ReadoutError {
    fn from(value: figment::Error) -> Self {
        ReadoutError::Config(Box::new(value))
    }
}

// =============================================================================
// Hardware protocol errors
// =============================================================================

/// Failures of the byte-serial handshake with the ADC/DAC board.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareProtocolError {
    /// A ready-poll did not see a non-zero status before the deadline.
    #[error("Timed out after {waited_ms} ms waiting for '{register}' during {operation}")]
    ReadyTimeout {
        /// Register that was polled.
        register: String,
        /// What the poll was waiting for.
        operation: String,
        /// Time spent polling.
        waited_ms: u64,
    },

    /// The device answered with a status code other than the one required.
    #[error("Unexpected status {actual} during {operation} (expected {expected})")]
    UnexpectedStatus {
        /// What was being transferred.
        operation: String,
        /// Status code required to proceed.
        expected: u32,
        /// Status code read back.
        actual: u32,
    },

    /// The MicroBlaze reported its error code.
    #[error("MicroBlaze reported an error during {0}")]
    DeviceError(String),

    /// The FPGA is not running a bitstream.
    #[error("Firmware is not running on the board")]
    FirmwareNotRunning,

    /// Measured FPGA clock is outside the allowed window.
    #[error("FPGA clock rate {measured_mhz:.2} MHz outside {min_mhz}-{max_mhz} MHz")]
    ClockOutOfRange {
        /// Estimated clock frequency.
        measured_mhz: f64,
        /// Lower accepted bound.
        min_mhz: f64,
        /// Upper accepted bound.
        max_mhz: f64,
    },
}

// =============================================================================
// Calibration failures
// =============================================================================

/// Terminal outcomes of a calibration step that did not succeed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationFailure {
    /// The search wanted a value outside the device range.
    #[error("Dynamic range target unachievable: wanted {requested:.2} dB, allowed 0-{max:.2} dB")]
    BoundsExceeded {
        /// Value the search asked for before clamping.
        requested: f64,
        /// Upper device bound.
        max: f64,
    },

    /// The search did not converge within its iteration budget.
    #[error("Max iterations ({iterations}) exceeded, last value {last_value:.2}")]
    IterationLimitExceeded {
        /// Iterations performed.
        iterations: u32,
        /// Value applied on the final iteration.
        last_value: f64,
    },

    /// A parallel data bus did not report a calibration lock.
    #[error("No calibration solution found for {bus}")]
    BusFailed {
        /// Name of the status register that reported failure.
        bus: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unachievable_power_reports_deficit() {
        let err = ReadoutError::UnachievablePower { deficit_db: 3.25 };
        assert!(err.to_string().contains("3.25 dB"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn protocol_error_converts_with_question_mark() {
        fn inner() -> Result<()> {
            Err(HardwareProtocolError::DeviceError("LO load".into()))?;
            Ok(())
        }
        match inner() {
            Err(ReadoutError::HardwareProtocol(HardwareProtocolError::DeviceError(op))) => {
                assert_eq!(op, "LO load")
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn command_queue_error_keeps_source() {
        let err = ReadoutError::CommandQueue {
            command: "Calibrate QDR".into(),
            source: Box::new(CalibrationFailure::BusFailed { bus: "qdr0".into() }.into()),
        };
        assert!(!err.is_recoverable());
        let text = err.to_string();
        assert!(text.contains("Calibrate QDR"));
        assert!(text.contains("qdr0"));
    }
}
