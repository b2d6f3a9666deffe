//! Z-DOK data line delays and calibration lock checks.

use crate::config::{CalibrationConfig, RegisterMap};
use crate::device::RegisterInterface;
use crate::error::{CalibrationFailure, Result};
use std::time::Duration;
use tracing::{debug, info};

/// `adc_in_load_dly` value that loads no delay.
pub const DELAY_LOAD_IDLE: u32 = 0b11_1111;

/// Load `(bit, delay)` pairs into the ADC input delay taps.
pub async fn load_delay_lut(
    regs: &dyn RegisterInterface,
    names: &RegisterMap,
    table: &[(u32, u32)],
    settle: Duration,
) -> Result<()> {
    regs.write_register(&names.adc_load_delay, DELAY_LOAD_IDLE, false)
        .await?;
    for &(bit, delay) in table {
        regs.write_register(&names.adc_delay_value, delay, false).await?;
        regs.write_register(&names.adc_load_delay, bit, false).await?;
        tokio::time::sleep(settle).await;
        regs.write_register(&names.adc_load_delay, DELAY_LOAD_IDLE, false)
            .await?;
    }
    Ok(())
}

/// Delay table of every Z-DOK bus: `bus_bit_length` consecutive bits from each bus start.
pub fn full_delay_cal_table(cal: &CalibrationConfig) -> Vec<Vec<(u32, u32)>> {
    cal.bus_starts
        .iter()
        .zip(&cal.bus_delays)
        .map(|(&start, &delay)| {
            (start..start + cal.bus_bit_length)
                .map(|bit| (bit, delay))
                .collect()
        })
        .collect()
}

/// Load the fixed delay calibration of all buses.
pub async fn load_full_delay_cal(
    regs: &dyn RegisterInterface,
    names: &RegisterMap,
    cal: &CalibrationConfig,
    settle: Duration,
) -> Result<()> {
    for (bus, table) in full_delay_cal_table(cal).iter().enumerate() {
        load_delay_lut(regs, names, table, settle).await?;
        debug!(bus, bits = table.len(), "Delay LUT loaded");
    }
    Ok(())
}

/// Fail with the first status register that reads 0.
pub async fn check_bus_status(regs: &dyn RegisterInterface, status_regs: &[String]) -> Result<()> {
    for reg in status_regs {
        if regs.read_register(reg).await? == 0 {
            return Err(CalibrationFailure::BusFailed { bus: reg.clone() }.into());
        }
    }
    info!(buses = status_regs.len(), "Calibration locked");
    Ok(())
}
