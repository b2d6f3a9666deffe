//! Register-level access to a readout board.
//!
//! Everything above this layer talks to the FPGA through [`RegisterInterface`] and
//! [`FpgaProgrammer`], so the same bring-up code drives a real board over KATCP
//! ([`katcp::KatcpClient`]) or the in-process simulator ([`mock::MockRoach`]).
//!
//! Transport failures are reported as `anyhow::Error` with context and are converted into
//! [`crate::error::ReadoutError::Transport`] by the protocol layers.

pub mod katcp;
pub mod mock;
pub mod snapshot;

use crate::config::{BoardConfig, ReadoutConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub use katcp::KatcpClient;
pub use mock::{MockFaults, MockRoach};
pub use snapshot::{Snapshot, SnapshotField, SnapshotLayout};

/// Named registers, memories and snapshot blocks on the FPGA.
#[async_trait]
pub trait RegisterInterface: Send + Sync {
    /// Read a 32-bit software register.
    async fn read_register(&self, name: &str) -> Result<u32>;

    /// Write a 32-bit software register.
    ///
    /// With `blocking` set the value is read back and must match before this returns.
    async fn write_register(&self, name: &str, value: u32, blocking: bool) -> Result<()>;

    /// Write raw bytes into a register or memory at a byte offset without read-back.
    async fn blind_write(&self, name: &str, data: &[u8], offset: usize) -> Result<()>;

    /// Read `size` bytes from a register or memory.
    async fn read_memory(&self, name: &str, size: usize, offset: usize) -> Result<Vec<u8>>;

    /// Arm a snapshot block so the next trigger captures into it.
    async fn arm_snapshot(&self, name: &str) -> Result<()>;

    /// Wait for an armed snapshot to fill and decode it.
    async fn read_snapshot(&self, name: &str) -> Result<Snapshot>;
}

/// Bitstream control.
#[async_trait]
pub trait FpgaProgrammer: Send + Sync {
    /// Whether a bitstream is currently running.
    async fn is_running(&self) -> Result<bool>;

    /// Program the FPGA with a named bitstream.
    async fn program(&self, bitstream: &str) -> Result<()>;
}

/// Shared handle to one connected board.
#[derive(Clone)]
pub struct DeviceHandle {
    pub regs: Arc<dyn RegisterInterface>,
    pub fpga: Arc<dyn FpgaProgrammer>,
}

impl DeviceHandle {
    pub fn new<T>(device: Arc<T>) -> Self
    where
        T: RegisterInterface + FpgaProgrammer + 'static,
    {
        Self {
            regs: device.clone(),
            fpga: device,
        }
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle").finish_non_exhaustive()
    }
}

/// Opens a [`DeviceHandle`] for a configured board.
#[async_trait]
pub trait BoardConnector: Send + Sync {
    async fn connect(&self, board: &BoardConfig, config: &ReadoutConfig) -> Result<DeviceHandle>;
}

/// Connects over KATCP, or builds a fresh simulator for boards marked `mock`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnector;

#[async_trait]
impl BoardConnector for DefaultConnector {
    async fn connect(&self, board: &BoardConfig, config: &ReadoutConfig) -> Result<DeviceHandle> {
        if board.mock {
            info!(board = board.num, "Using simulated board");
            return Ok(DeviceHandle::new(Arc::new(MockRoach::new(config))));
        }
        let client = KatcpClient::connect(&board.host, board.port, config.transfer.io_timeout())
            .await
            .with_context(|| format!("Board {} unreachable", board.num))?
            .with_poll_interval(config.transfer.poll_interval())
            .with_default_layouts(&config.registers);
        Ok(DeviceHandle::new(Arc::new(client)))
    }
}

/// Hands out one pre-built device, regardless of the board asked for.
#[derive(Clone, Debug)]
pub struct StaticConnector(pub DeviceHandle);

#[async_trait]
impl BoardConnector for StaticConnector {
    async fn connect(&self, _board: &BoardConfig, _config: &ReadoutConfig) -> Result<DeviceHandle> {
        Ok(self.0.clone())
    }
}

/// Estimate the FPGA clock in MHz from two reads of a free-running cycle counter.
pub async fn estimate_fpga_clock(
    regs: &dyn RegisterInterface,
    counter: &str,
    interval: Duration,
) -> Result<f64> {
    let first = regs.read_register(counter).await?;
    let start = Instant::now();
    tokio::time::sleep(interval).await;
    let second = regs.read_register(counter).await?;
    let elapsed = start.elapsed().as_secs_f64();
    if elapsed <= 0.0 {
        anyhow::bail!("Clock estimate interval too short");
    }
    let mhz = second.wrapping_sub(first) as f64 / elapsed / 1e6;
    debug!(counter, mhz, "Estimated FPGA clock");
    Ok(mhz)
}
