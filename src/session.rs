//! Per-board channelizer session.
//!
//! A [`ChannelizerSession`] owns everything one board's configuration pipeline produces,
//! stage by stage:
//!
//! 1. **connect**: a [`DeviceHandle`] from a [`BoardConnector`]
//! 2. **load_freq**: the resonator list and its [`ChannelGrid`] ([`FreqPlan`])
//! 3. **define_roach_lut**: quantized LO, FFT bins and DDS tables ([`RoachLuts`])
//! 4. **define_dac_lut**: the DAC comb plus the ADC attenuation it settled on ([`DacLuts`])
//! 5. **sweep**: IQ loops and their centres over an LO sweep ([`SweepReport`])
//! 6. **rotate_loops**: DDS phases that put every on-resonance point on the loop's I axis
//! 7. **translate_loops**: loop centres from a fresh sweep, loaded into the capture blocks
//! 8. **load_threshold**: the per-channel trigger threshold table
//!
//! Each stage checks that the stages it consumes exist and fails with a validation error
//! otherwise. Replacing the resonator list discards everything derived from the old grid,
//! and redefining either LUT discards the last sweep.
//!
//! The hardware bring-up steps (program, MicroBlaze init, Z-DOK and QDR calibration) are
//! methods here as well, since they act on the same connected device.

use crate::calibration::{
    calc_sw_triggers, check_bus_status, fit_loop_centers, load_full_delay_cal, lo_offsets,
    loop_rotations, trigger_indices, AdcAttenReport, AdcAttenSearch, IqPoint, IqSampler,
    IqTraces, RotationReport, SweepReport,
};
use crate::channels::{
    quantize_lo, quantized_dac_frequency, AllocationOrder, BinMap, ChannelGrid, Slot,
};
use crate::config::{BoardConfig, ReadoutConfig};
use crate::device::{estimate_fpga_clock, BoardConnector, DeviceHandle, RegisterInterface};
use crate::error::{HardwareProtocolError, ReadoutError, Result};
use crate::luts::{BoardLuts, FirCoefficients, PhaseSnapshot};
use crate::memory::interleave_dac_lut;
use crate::resonator::{load_freq_file, ResonatorSpec};
use crate::synth::{DacComb, DacCombBuilder, DdsTones};
use crate::transfer::{UartLink, MAX_ATTEN_DB, N_ATTENUATORS};
use serde::Serialize;
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, HashSet};
use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Accepted FPGA clock window after programming, in MHz.
pub const FPGA_CLOCK_RANGE_MHZ: (f64, f64) = (245.0, 255.0);
/// LO frequency loaded while initializing the MicroBlaze.
pub const INIT_LO_FREQ_HZ: f64 = 2.0e9;
/// Relative I/Q scaling of the ADC input, unity in fix8_7.
const ADC_I_SCALE_UNITY: u32 = 1 << 7;

/// Resonators and where they sit in the firmware.
#[derive(Debug, Clone, PartialEq)]
pub struct FreqPlan {
    pub resonators: Vec<ResonatorSpec>,
    pub grid: ChannelGrid,
}

impl FreqPlan {
    pub fn frequencies(&self) -> Vec<f64> {
        self.resonators.iter().map(|r| r.frequency_hz).collect()
    }
}

/// Channelizer side tables, loaded into the FPGA by `define_roach_lut`.
#[derive(Debug, Clone, PartialEq)]
pub struct RoachLuts {
    /// LO rounded to the synthesizer grid.
    pub lo_hz: f64,
    pub bins: BinMap,
    pub dds: DdsTones,
}

/// DAC comb and analog levels, loaded by `define_dac_lut`.
#[derive(Debug, Clone, PartialEq)]
pub struct DacLuts {
    pub comb: DacComb,
    pub adc: AdcAttenReport,
}

/// Identity loaded after programming.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoardIdentity {
    pub clock_mhz: f64,
    /// Seconds since the start of the UTC year.
    pub timestamp: u32,
}

/// Attenuations chosen while loading the DAC LUT.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DacLutSummary {
    /// Total DAC attenuation split over attenuators 1 and 2.
    pub dac_atten_db: f64,
    pub adc: AdcAttenReport,
}

/// Threshold loaded for one resonator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdEntry {
    pub resonator_id: u32,
    pub slot: Slot,
    pub threshold_rad: f64,
}

/// Phase snapshot with the software trigger emulation applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggeredSnapshot {
    pub snapshot: PhaseSnapshot,
    pub threshold_rad: f64,
    /// Software trigger flags aligned with `snapshot.phase`.
    pub sw_trig: Vec<bool>,
}

impl TriggeredSnapshot {
    pub fn sw_trigger_indices(&self) -> Vec<usize> {
        trigger_indices(&self.sw_trig)
    }

    pub fn fw_trigger_indices(&self) -> Vec<usize> {
        trigger_indices(&self.snapshot.trig)
    }
}

/// State of one board's configuration.
pub struct ChannelizerSession {
    board: BoardConfig,
    config: Arc<ReadoutConfig>,
    order: AllocationOrder,
    device: Option<DeviceHandle>,
    dds_shift: Option<u32>,
    freq_plan: Option<FreqPlan>,
    roach_luts: Option<RoachLuts>,
    dac_luts: Option<DacLuts>,
    last_sweep: Option<SweepReport>,
    /// Loaded thresholds keyed by firmware channel index.
    thresholds: BTreeMap<usize, f64>,
}

impl std::fmt::Debug for ChannelizerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelizerSession")
            .field("board", &self.board.num)
            .field("connected", &self.device.is_some())
            .field("freq_plan", &self.freq_plan.is_some())
            .field("roach_luts", &self.roach_luts.is_some())
            .field("dac_luts", &self.dac_luts.is_some())
            .field("last_sweep", &self.last_sweep.is_some())
            .field("thresholds", &self.thresholds.len())
            .finish()
    }
}

impl ChannelizerSession {
    pub fn new(board: BoardConfig, config: Arc<ReadoutConfig>) -> Self {
        Self {
            board,
            config,
            order: AllocationOrder::default(),
            device: None,
            dds_shift: None,
            freq_plan: None,
            roach_luts: None,
            dac_luts: None,
            last_sweep: None,
            thresholds: BTreeMap::new(),
        }
    }

    /// Stream allocation order used by `load_freq`.
    pub fn with_order(mut self, order: AllocationOrder) -> Self {
        self.order = order;
        self
    }

    pub fn board(&self) -> &BoardConfig {
        &self.board
    }

    pub fn config(&self) -> &ReadoutConfig {
        &self.config
    }

    pub fn dds_shift(&self) -> Option<u32> {
        self.dds_shift
    }

    pub fn thresholds(&self) -> &BTreeMap<usize, f64> {
        &self.thresholds
    }

    // =========================================================================
    // Stage accessors
    // =========================================================================

    pub fn device(&self) -> Result<&DeviceHandle> {
        self.device.as_ref().ok_or_else(|| {
            ReadoutError::validation(format!("Board {} is not connected", self.board.num))
        })
    }

    pub fn freq_plan(&self) -> Result<&FreqPlan> {
        self.freq_plan.as_ref().ok_or_else(|| {
            ReadoutError::validation(format!("Board {}: no frequency list loaded", self.board.num))
        })
    }

    pub fn roach_luts(&self) -> Result<&RoachLuts> {
        self.roach_luts.as_ref().ok_or_else(|| {
            ReadoutError::validation(format!("Board {}: channelizer LUTs not defined", self.board.num))
        })
    }

    pub fn dac_luts(&self) -> Result<&DacLuts> {
        self.dac_luts.as_ref().ok_or_else(|| {
            ReadoutError::validation(format!("Board {}: DAC LUT not defined", self.board.num))
        })
    }

    /// Most recent LO sweep, dropped whenever the LUTs it was taken with change.
    pub fn last_sweep(&self) -> Option<&SweepReport> {
        self.last_sweep.as_ref()
    }

    fn regs(&self) -> Result<Arc<dyn RegisterInterface>> {
        Ok(self.device()?.regs.clone())
    }

    // =========================================================================
    // Hardware bring-up
    // =========================================================================

    /// Open the board's register transport. Derived stages are kept.
    #[instrument(skip_all, fields(board = self.board.num))]
    pub async fn connect(&mut self, connector: &dyn BoardConnector) -> Result<()> {
        let handle = connector.connect(&self.board, &self.config).await?;
        self.device = Some(handle);
        info!(host = %self.board.host, mock = self.board.mock, "Connected");
        Ok(())
    }

    /// Program the FPGA if a bitstream is configured, then check the clock and load the
    /// board identity.
    #[instrument(skip_all, fields(board = self.board.num))]
    pub async fn program_v6(&self) -> Result<BoardIdentity> {
        let device = self.device()?;
        match &self.board.bitstream {
            Some(bitstream) => {
                info!(bitstream = %bitstream, "Programming FPGA");
                device.fpga.program(bitstream).await?;
            }
            None => debug!("No bitstream configured, keeping the running firmware"),
        }
        if !device.fpga.is_running().await? {
            return Err(HardwareProtocolError::FirmwareNotRunning.into());
        }

        let clock_mhz = estimate_fpga_clock(
            &*device.regs,
            &self.config.registers.clock_counter,
            self.config.transfer.clock_estimate(),
        )
        .await?;
        info!(clock_mhz, "FPGA clock rate");
        let (min_mhz, max_mhz) = FPGA_CLOCK_RANGE_MHZ;
        if !(min_mhz..=max_mhz).contains(&clock_mhz) {
            return Err(HardwareProtocolError::ClockOutOfRange {
                measured_mhz: clock_mhz,
                min_mhz,
                max_mhz,
            }
            .into());
        }

        let luts = BoardLuts::new(&*device.regs, &self.config);
        luts.load_board_num(self.board.num).await?;
        let timestamp = luts.load_timestamp().await?;
        Ok(BoardIdentity {
            clock_mhz,
            timestamp,
        })
    }

    /// Bring up the UART link and the MicroBlaze, park the LO and max every attenuator.
    #[instrument(skip_all, fields(board = self.board.num))]
    pub async fn init_v7(&self) -> Result<()> {
        let regs = self.regs()?;
        let link = UartLink::new(&*regs, &self.config);
        link.initialize(self.config.transfer.wait_for_v7_ready).await?;
        info!("Initialized UART");
        link.init_microblaze().await?;
        info!("Initialized MicroBlaze");
        link.load_lo_freq(INIT_LO_FREQ_HZ).await?;
        for id in 1..=N_ATTENUATORS {
            link.change_atten(id, MAX_ATTEN_DB).await?;
        }
        info!("Set RF board attenuators to maximum");
        Ok(())
    }

    /// Calibrate the Z-DOK data lines against the DAC board's test ramp.
    ///
    /// The ramp is switched off again whether or not the buses lock.
    #[instrument(skip_all, fields(board = self.board.num))]
    pub async fn cal_zdok(&self) -> Result<()> {
        let regs = self.regs()?;
        let names = &self.config.registers;
        let link = UartLink::new(&*regs, &self.config);
        link.zdok_ramp(true).await?;
        info!("Switched on ADC Z-DOK cal ramp");
        tokio::time::sleep(Duration::from_millis(self.config.transfer.zdok_ramp_settle_ms)).await;

        let result = async {
            regs.write_register(&names.adc_i_scale, ADC_I_SCALE_UNITY, false)
                .await?;
            regs.write_register(&names.run, 1, false).await?;
            load_full_delay_cal(
                &*regs,
                names,
                &self.config.calibration,
                Duration::from_millis(self.config.transfer.delay_settle_ms),
            )
            .await?;
            check_bus_status(&*regs, &names.zdok_bus_status).await
        }
        .await;

        link.zdok_ramp(false).await?;
        info!("Switched off ADC Z-DOK cal ramp");
        result
    }

    /// Check that every QDR chip reports a calibration lock.
    #[instrument(skip_all, fields(board = self.board.num))]
    pub async fn cal_qdr(&self) -> Result<()> {
        let regs = self.regs()?;
        check_bus_status(&*regs, &self.config.registers.qdr_status).await
    }

    // =========================================================================
    // Channelizer configuration
    // =========================================================================

    /// Set the DDS lag. `None` uses the configured default, or measures it when there is none.
    #[instrument(skip_all, fields(board = self.board.num))]
    pub async fn load_dds_shift(&mut self, shift: Option<u32>) -> Result<u32> {
        let regs = self.regs()?;
        let luts = BoardLuts::new(&*regs, &self.config);
        let shift = match shift.or(self.config.calibration.default_dds_shift) {
            Some(shift) => shift,
            None => luts.check_dds_shift().await?,
        };
        let loaded = luts.load_dds_shift(shift).await?;
        self.dds_shift = Some(loaded);
        info!(dds_shift = loaded, "DDS shift loaded");
        Ok(loaded)
    }

    /// Load the fixed Z-DOK delay calibration.
    pub async fn load_full_delay_cal(&self) -> Result<()> {
        let regs = self.regs()?;
        load_full_delay_cal(
            &*regs,
            &self.config.registers,
            &self.config.calibration,
            Duration::from_millis(self.config.transfer.delay_settle_ms),
        )
        .await
    }

    /// Read the board's frequency file and allocate channels.
    #[instrument(skip_all, fields(board = self.board.num))]
    pub async fn load_freq(&mut self) -> Result<usize> {
        let path = self.board.freq_file.clone().ok_or_else(|| {
            ReadoutError::validation(format!("Board {} has no freq_file", self.board.num))
        })?;
        info!(path = %path.display(), "Loading freqs");
        let resonators = load_freq_file(&path)?;
        self.set_resonators(resonators)
    }

    /// Replace the resonator list. Everything derived from the previous grid is dropped.
    pub fn set_resonators(&mut self, mut resonators: Vec<ResonatorSpec>) -> Result<usize> {
        let mut ids = HashSet::new();
        if let Some(dup) = resonators.iter().find(|r| !ids.insert(r.id)) {
            return Err(ReadoutError::validation(format!(
                "Resonator IDs need to be unique, {} appears twice",
                dup.id
            )));
        }
        let grid = ChannelGrid::for_firmware(resonators.len(), &self.config.firmware, self.order)?;
        resonators.truncate(grid.n_resonators());

        self.roach_luts = None;
        self.dac_luts = None;
        self.last_sweep = None;
        self.thresholds.clear();
        let n = resonators.len();
        info!(resonators = n, rows = grid.rows(), order = %self.order, "Resonator channels generated");
        self.freq_plan = Some(FreqPlan { resonators, grid });
        Ok(n)
    }

    /// Quantize the LO, compute bins and DDS tables and load channel selection and QDR.
    #[instrument(skip_all, fields(board = self.board.num))]
    pub async fn define_roach_lut(&mut self) -> Result<f64> {
        let regs = self.regs()?;
        let config = self.config.clone();
        let fw = &config.firmware;
        let plan = self.freq_plan()?;
        let freqs = plan.frequencies();

        let lo_hz = quantize_lo(self.board.lo_freq, &freqs, fw)?;
        let bins = BinMap::from_grid(&plan.grid, &freqs, lo_hz, fw)?;
        let dds = DdsTones::generate(&plan.grid, &bins, &freqs, lo_hz, None, fw)?;

        let luts = BoardLuts::new(&*regs, &config);
        luts.load_chan_selection(&bins).await?;
        luts.load_dds_lut(&dds).await?;

        self.dac_luts = None;
        self.last_sweep = None;
        self.thresholds.clear();
        self.roach_luts = Some(RoachLuts { lo_hz, bins, dds });
        info!(lo_hz, "Channelizer LUTs defined");
        Ok(lo_hz)
    }

    /// Synthesize and load the DAC comb, set the LO and DAC attenuators, then find the
    /// ADC attenuation.
    #[instrument(skip_all, fields(board = self.board.num))]
    pub async fn define_dac_lut(&mut self) -> Result<DacLutSummary> {
        let regs = self.regs()?;
        let config = self.config.clone();
        let lo_hz = self.roach_luts()?.lo_hz;
        let plan = self.freq_plan()?;

        let comb = DacCombBuilder::new(&config.firmware)
            .max_phase_attempts(config.calibration.max_phase_attempts)
            .max_total_atten_db(2.0 * MAX_ATTEN_DB)
            .build(&plan.resonators, lo_hz)?;
        let lut = interleave_dac_lut(&comb.i, &comb.q)?;

        let link = UartLink::new(&*regs, &config);
        info!("Initializing ADC/DAC board communication");
        link.initialize(config.transfer.wait_for_v7_ready).await?;
        link.load_lo_freq(lo_hz).await?;
        info!(bytes = lut.len(), "Loading DAC LUT");
        link.load_dac_lut(&lut).await?;
        let (atten1, atten2) = comb.attenuator_split();
        link.change_atten(1, atten1).await?;
        link.change_atten(2, atten2).await?;
        info!(dac_atten_db = comb.dac_atten_db, "DAC attenuation set");

        let adc = AdcAttenSearch::new(&*regs, &config)
            .run(self.board.adc_atten)
            .await?;
        for warning in &adc.warnings {
            warn!(%warning, "ADC calibration warning");
        }

        let summary = DacLutSummary {
            dac_atten_db: comb.dac_atten_db,
            adc: adc.clone(),
        };
        self.last_sweep = None;
        self.thresholds.clear();
        self.dac_luts = Some(DacLuts { comb, adc });
        Ok(summary)
    }

    /// Sweep the LO around its set point and fit the IQ loop centre of every resonator.
    ///
    /// The LO is restored afterwards, also when the sweep fails, and a batch of
    /// on-resonance points is taken there.
    #[instrument(skip_all, fields(board = self.board.num))]
    pub async fn sweep(&mut self) -> Result<SweepReport> {
        self.dac_luts()?;
        let regs = self.regs()?;
        let config = self.config.clone();
        let cal = &config.calibration;
        let fw = &config.firmware;
        let lo_hz = self.roach_luts()?.lo_hz;
        let plan = self.freq_plan()?;

        let offsets = lo_offsets(cal.sweep_lo_span_hz, cal.sweep_lo_step_hz);
        let lo_freqs: Vec<f64> = offsets.iter().map(|df| lo_hz + df).collect();
        info!(steps = lo_freqs.len(), span_hz = cal.sweep_lo_span_hz, "Sweeping LO");

        let sampler = IqSampler::new(&*regs, &config);
        let swept = sampler.sweep_lo(&lo_freqs).await;
        UartLink::new(&*regs, &config).load_lo_freq(lo_hz).await?;
        let sweep = IqTraces::from_streams(&swept?, &plan.grid)?;
        let centers = fit_loop_centers(&sweep);

        let raw = sampler.take_points(cal.on_resonance_points).await?;
        let on_resonance = IqTraces::from_streams(&raw, &plan.grid)?;

        let half_rate = fw.dac_sample_rate / 2.0;
        let freqs_hz = plan
            .frequencies()
            .iter()
            .take(plan.grid.n_resonators())
            .map(|&f| {
                let dac = quantized_dac_frequency(f, lo_hz, fw);
                let folded = if dac > half_rate { dac - fw.dac_sample_rate } else { dac };
                folded + lo_hz
            })
            .collect();

        let report = SweepReport {
            lo_offsets_hz: offsets,
            freqs_hz,
            sweep,
            centers,
            on_resonance,
        };
        info!(resonators = report.centers.len(), "Loop centres found");
        self.last_sweep = Some(report.clone());
        Ok(report)
    }

    /// Rotate every loop so its on-resonance point lies along the I axis from its centre.
    ///
    /// The measured angle is added to each resonator's DDS phase and the DDS tables are
    /// regenerated and reloaded. Uses the centres of the last sweep.
    #[instrument(skip_all, fields(board = self.board.num))]
    pub async fn rotate_loops(&mut self) -> Result<RotationReport> {
        let regs = self.regs()?;
        let config = self.config.clone();
        let fw = &config.firmware;
        let centers = self
            .last_sweep
            .as_ref()
            .map(|s| s.centers.clone())
            .ok_or_else(|| {
                ReadoutError::validation(format!("Board {}: no IQ sweep taken", self.board.num))
            })?;
        let plan = self.freq_plan()?;
        if centers.len() != plan.grid.n_resonators() {
            return Err(ReadoutError::validation(format!(
                "Sweep has {} loop centres for {} resonators",
                centers.len(),
                plan.grid.n_resonators()
            )));
        }
        let roach = self.roach_luts()?;

        let raw = IqSampler::new(&*regs, &config)
            .take_points(config.calibration.rotation_points)
            .await?;
        let on_resonance = IqTraces::from_streams(&raw, &plan.grid)?;
        let rotation_rad = loop_rotations(&on_resonance.means(), &centers);

        let phases: Vec<f64> = roach
            .dds
            .phases_rad
            .iter()
            .zip(&rotation_rad)
            .map(|(old, rot)| (old + rot).rem_euclid(TAU))
            .collect();
        let dds = DdsTones::generate(
            &plan.grid,
            &roach.bins,
            &plan.frequencies(),
            roach.lo_hz,
            Some(phases.as_slice()),
            fw,
        )?;
        BoardLuts::new(&*regs, &config).load_dds_lut(&dds).await?;
        info!(resonators = phases.len(), "Loops rotated");

        if let Some(roach) = self.roach_luts.as_mut() {
            roach.dds = dds;
        }
        Ok(RotationReport {
            on_resonance,
            rotation_rad,
        })
    }

    /// Sweep again and load the fresh loop centres into the capture blocks.
    #[instrument(skip_all, fields(board = self.board.num))]
    pub async fn translate_loops(&mut self) -> Result<Vec<IqPoint>> {
        let report = self.sweep().await?;
        let regs = self.regs()?;
        let plan = self.freq_plan()?;
        let luts = BoardLuts::new(&*regs, &self.config);
        for (index, center) in report.centers.iter().enumerate() {
            let slot = plan.grid.slot_of(index).ok_or_else(|| {
                ReadoutError::validation(format!("Resonator {} has no channel", index))
            })?;
            luts.load_iq_center(*center, slot.channel, slot.stream).await?;
        }
        info!(resonators = report.centers.len(), "Loop centres loaded");
        Ok(report.centers)
    }

    /// Load FIR taps from the board's coefficient file.
    #[instrument(skip_all, fields(board = self.board.num))]
    pub async fn load_fir(&self) -> Result<()> {
        let path = self.board.fir_file.as_ref().ok_or_else(|| {
            ReadoutError::validation(format!("Board {} has no fir_file", self.board.num))
        })?;
        let regs = self.regs()?;
        let plan = self.freq_plan()?;
        let coeffs = FirCoefficients::load(path)?;
        info!(path = %path.display(), taps = coeffs.n_taps(), "Loading FIRs");
        BoardLuts::new(&*regs, &self.config)
            .load_fir_coeffs(&coeffs, Some(&plan.grid))
            .await
    }

    /// Set a trigger threshold on every resonator channel.
    ///
    /// A fixed board threshold is used when configured. Otherwise each channel gets
    /// `-threshold_sigmas` standard deviations of its phase noise over several snapshots.
    #[instrument(skip_all, fields(board = self.board.num))]
    pub async fn load_threshold(&mut self) -> Result<Vec<ThresholdEntry>> {
        let regs = self.regs()?;
        let config = self.config.clone();
        let cal = &config.calibration;
        let luts = BoardLuts::new(&*regs, &config);
        luts.set_max_count_rate(cal.max_count_rate).await;

        let plan = self.freq_plan()?;
        let n = plan.grid.n_resonators();
        let mut wanted = Vec::with_capacity(n);
        for (index, resonator) in plan.resonators.iter().enumerate().take(n) {
            let slot = plan.grid.slot_of(index).ok_or_else(|| {
                ReadoutError::validation(format!("Resonator {} has no channel", resonator.id))
            })?;
            let threshold = match self.board.threshold {
                Some(fixed) => fixed,
                None => {
                    if index % 5 == 0 {
                        info!(channel = index, of = n, "Collecting phase");
                    }
                    let mut data = Vec::new();
                    for _ in 0..cal.threshold_snapshots.max(1) {
                        data.extend(luts.take_phase_snapshot(slot.firmware_index()).await?.phase);
                    }
                    -std_dev(&data) * cal.threshold_sigmas
                }
            };
            wanted.push((resonator.id, slot, threshold));
        }

        info!(channels = wanted.len(), "Loading thresholds");
        let mut entries = Vec::with_capacity(wanted.len());
        let mut table = BTreeMap::new();
        for (resonator_id, slot, threshold) in wanted {
            let loaded = luts.set_threshold(threshold, slot.channel, slot.stream).await?;
            table.insert(slot.firmware_index(), loaded);
            entries.push(ThresholdEntry {
                resonator_id,
                slot,
                threshold_rad: loaded,
            });
        }
        self.thresholds = table;
        Ok(entries)
    }

    /// Capture the phase of resonator `index` and run the software trigger over it.
    pub async fn phase_snapshot(&self, index: usize) -> Result<TriggeredSnapshot> {
        let slot = self.freq_plan()?.grid.slot_of(index).ok_or_else(|| {
            ReadoutError::validation(format!("No resonator with index {}", index))
        })?;
        let threshold_rad = *self
            .thresholds
            .get(&slot.firmware_index())
            .ok_or_else(|| {
                ReadoutError::validation(format!("No threshold loaded for resonator {}", index))
            })?;
        let regs = self.regs()?;
        let snapshot = BoardLuts::new(&*regs, &self.config)
            .take_phase_snapshot(slot.firmware_index())
            .await?;
        let sw_trig = calc_sw_triggers(&snapshot.phase, threshold_rad, &self.config.calibration.triggers);
        Ok(TriggeredSnapshot {
            snapshot,
            threshold_rad,
            sw_trig,
        })
    }
}

/// Population standard deviation, zero for no samples.
fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().population_std_dev()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FirmwareParams, TransferConfig};
    use crate::device::{MockFaults, MockRoach, StaticConnector};
    use crate::error::CalibrationFailure;
    use std::f64::consts::PI;
    use std::io::Write;

    fn test_config() -> ReadoutConfig {
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

    fn resonators(config: &ReadoutConfig, n: usize) -> Vec<ResonatorSpec> {
        let res = config.firmware.dac_freq_resolution();
        (0..n)
            .map(|i| ResonatorSpec::new(100 + i as u32, 5.0e9 + (3 + 7 * i) as f64 * res, 40.0))
            .collect()
    }

    async fn connected(
        config: ReadoutConfig,
        board: BoardConfig,
        mock: MockRoach,
    ) -> (ChannelizerSession, Arc<MockRoach>) {
        let mock = Arc::new(mock);
        let connector = StaticConnector(DeviceHandle::new(mock.clone()));
        let mut session = ChannelizerSession::new(board, Arc::new(config));
        session.connect(&connector).await.unwrap();
        (session, mock)
    }

    #[tokio::test]
    async fn stages_require_their_inputs() {
        let config = test_config();
        let session = ChannelizerSession::new(BoardConfig::mock(1), Arc::new(config.clone()));
        assert!(matches!(session.init_v7().await, Err(ReadoutError::Validation(_))));

        let (mut session, _mock) = connected(config, BoardConfig::mock(1), MockRoach::new(&test_config())).await;
        assert!(matches!(session.load_freq().await, Err(ReadoutError::Validation(_))));
        assert!(matches!(session.define_roach_lut().await, Err(ReadoutError::Validation(_))));
        assert!(matches!(session.define_dac_lut().await, Err(ReadoutError::Validation(_))));
        assert!(matches!(session.phase_snapshot(0).await, Err(ReadoutError::Validation(_))));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let config = test_config();
        let mut list = resonators(&config, 3);
        list[2].id = list[0].id;
        let mut session = ChannelizerSession::new(BoardConfig::mock(1), Arc::new(config));
        assert!(matches!(session.set_resonators(list), Err(ReadoutError::Validation(_))));
    }

    #[tokio::test]
    async fn configure_pipeline_on_mock_board() {
        let config = test_config();
        let mut board = BoardConfig::mock(7);
        board.lo_freq = 5.0e9;
        let mock = MockRoach::new(&config).with_true_dds_shift(3);
        let (mut session, mock) = connected(config.clone(), board, mock).await;

        assert_eq!(session.load_dds_shift(None).await.unwrap(), 3);
        session.load_full_delay_cal().await.unwrap();

        assert_eq!(session.set_resonators(resonators(&config, 6)).unwrap(), 6);
        let lo = session.define_roach_lut().await.unwrap();
        assert_eq!(lo, 5.0e9);
        for mem in &config.registers.dds_mem[..2] {
            assert!(mock.memory(mem).await.is_some());
        }

        let summary = session.define_dac_lut().await.unwrap();
        assert!(summary.adc.state.is_success());
        let lut = mock.dac_lut().await.unwrap();
        assert_eq!(lut.len(), config.firmware.n_dac_samples() * 4);
        assert_eq!(mock.lo_freq_mhz().await, Some(5000.0));
        let (a1, a2) = session.dac_luts().unwrap().comb.attenuator_split();
        assert_eq!(mock.attenuation(1).await, a1);
        assert_eq!(mock.attenuation(2).await, a2);

        let thresholds = session.load_threshold().await.unwrap();
        assert_eq!(thresholds.len(), 6);
        for entry in &thresholds {
            assert!(entry.threshold_rad < 0.0 && entry.threshold_rad > -0.1);
        }
        assert_eq!(session.thresholds().len(), 6);

        // A new resonator list invalidates everything derived from the old grid.
        session.set_resonators(resonators(&config, 4)).unwrap();
        assert!(session.roach_luts().is_err());
        assert!(session.dac_luts().is_err());
        assert!(session.thresholds().is_empty());
    }

    /// Session with LUTs defined for `n` resonators and a 20 point sweep over one loop turn.
    async fn ready_for_sweep(n: usize) -> (ChannelizerSession, Arc<MockRoach>, ReadoutConfig) {
        let mut config = test_config();
        config.calibration.sweep_lo_step_hz = 5.0e4;
        let mut board = BoardConfig::mock(8);
        board.lo_freq = 5.0e9;
        let (mut session, mock) =
            connected(config.clone(), board, MockRoach::new(&config)).await;
        session.set_resonators(resonators(&config, n)).unwrap();
        session.define_roach_lut().await.unwrap();
        session.define_dac_lut().await.unwrap();
        (session, mock, config)
    }

    #[tokio::test]
    async fn sweep_finds_loop_centres() {
        let (mut session, mock, config) = ready_for_sweep(5).await;
        let report = session.sweep().await.unwrap();
        assert_eq!(report.lo_offsets_hz.len(), 20);
        assert_eq!(report.sweep.n_points(), 20);
        assert_eq!(report.on_resonance.n_points(), config.calibration.on_resonance_points);
        assert_eq!(mock.lo_freq_mhz().await, Some(5000.0));

        let plan = session.freq_plan().unwrap();
        let res = config.firmware.dac_freq_resolution();
        for (index, center) in report.centers.iter().enumerate() {
            let slot = plan.grid.slot_of(index).unwrap();
            let (i, q) = mock.iq_loop_center(slot.channel, slot.stream).await;
            assert!((center.i - i).abs() < 100.0, "resonator {index}: {} vs {}", center.i, i);
            assert!((center.q - q).abs() < 100.0, "resonator {index}: {} vs {}", center.q, q);
            assert!((report.freqs_hz[index] - plan.resonators[index].frequency_hz).abs() <= res);
        }
        assert_eq!(session.last_sweep(), Some(&report));

        session.define_dac_lut().await.unwrap();
        assert!(session.last_sweep().is_none());
    }

    #[tokio::test]
    async fn sweep_needs_the_dac_lut() {
        let config = test_config();
        let (mut session, _mock) =
            connected(config.clone(), BoardConfig::mock(8), MockRoach::new(&config)).await;
        session.set_resonators(resonators(&config, 2)).unwrap();
        session.define_roach_lut().await.unwrap();
        assert!(matches!(session.sweep().await, Err(ReadoutError::Validation(_))));
        assert!(matches!(session.rotate_loops().await, Err(ReadoutError::Validation(_))));
    }

    #[tokio::test]
    async fn rotation_puts_resonance_on_the_i_axis() {
        let (mut session, mock, _config) = ready_for_sweep(6).await;
        session.sweep().await.unwrap();
        let rotation = session.rotate_loops().await.unwrap();
        assert_eq!(rotation.rotation_rad.len(), 6);

        let plan = session.freq_plan().unwrap().clone();
        let phases = session.roach_luts().unwrap().dds.phases_rad.clone();
        for (index, rot) in rotation.rotation_rad.iter().enumerate() {
            assert!((phases[index] - rot.rem_euclid(TAU)).abs() < 1e-9);
            let slot = plan.grid.slot_of(index).unwrap();
            let loaded = mock.dds_phase(slot.channel, slot.stream).await;
            let error = (loaded - phases[index] + PI).rem_euclid(TAU) - PI;
            assert!(error.abs() < 0.01, "resonator {index} loaded {loaded}");
        }

        let resweep = session.sweep().await.unwrap();
        let points = resweep.on_resonance.means();
        for (index, angle) in loop_rotations(&points, &resweep.centers).iter().enumerate() {
            assert!(angle.abs() < 0.02, "resonator {index} still at {angle} rad");
        }
    }

    #[tokio::test]
    async fn translate_loads_fresh_centres() {
        let (mut session, mock, config) = ready_for_sweep(4).await;
        session.sweep().await.unwrap();
        session.rotate_loops().await.unwrap();
        let centers = session.translate_loops().await.unwrap();
        assert_eq!(session.last_sweep().map(|s| &s.centers), Some(&centers));

        let plan = session.freq_plan().unwrap();
        for (index, center) in centers.iter().enumerate() {
            let slot = plan.grid.slot_of(index).unwrap();
            let words = mock.writes_to(&config.registers.capture_iq_center[slot.stream]).await;
            assert!(words.contains(&crate::luts::iq_center_word(*center)));
            let loads = mock
                .writes_to(&config.registers.capture_load_iq_center[slot.stream])
                .await;
            assert!(loads.contains(&(((slot.channel as u32) << 1) | 1)));
            assert_eq!(loads.last(), Some(&0));
        }
    }

    #[tokio::test]
    async fn software_trigger_matches_firmware_flags() {
        let config = test_config();
        let mut board = BoardConfig::mock(3);
        board.threshold = Some(-0.2);
        let mock = MockRoach::new(&config).with_phase_pulses(vec![200]);
        let (mut session, _mock) = connected(config.clone(), board, mock).await;
        session.set_resonators(resonators(&config, 2)).unwrap();
        session.load_threshold().await.unwrap();

        let snap = session.phase_snapshot(1).await.unwrap();
        assert_eq!(snap.threshold_rad, -0.2);
        assert_eq!(snap.sw_trigger_indices(), vec![212]);
        assert_eq!(snap.fw_trigger_indices(), snap.sw_trigger_indices());
    }

    #[tokio::test]
    async fn fir_file_loads_per_resonator() {
        let config = test_config();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# shared filter\n0.5\n0.25\n-0.25\n0.0").unwrap();
        let mut board = BoardConfig::mock(2);
        board.fir_file = Some(file.path().to_path_buf());
        let (mut session, mock) = connected(config.clone(), board, MockRoach::new(&config)).await;
        session.set_resonators(resonators(&config, 3)).unwrap();
        session.load_fir().await.unwrap();
        for stream in 0..2 {
            let loads = mock.writes_to(&config.registers.fir_load_chan[stream]).await;
            for channel in 0..4u32 {
                assert!(loads.contains(&((1 << 8) | channel)));
            }
        }
        assert_eq!(
            mock.memory(&config.registers.fir_taps_mem[0]).await.map(|m| m.len()),
            Some(16)
        );
    }

    #[tokio::test]
    async fn program_checks_clock_and_loads_identity() {
        let config = test_config();
        let mut board = BoardConfig::mock(9);
        board.bitstream = Some("darkness_2019.fpg".into());
        let (session, mock) = connected(config.clone(), board, MockRoach::new(&config)).await;
        let identity = session.program_v6().await.unwrap();
        assert!((245.0..=255.0).contains(&identity.clock_mhz));
        assert_eq!(mock.programmed_bitstream().await.as_deref(), Some("darkness_2019.fpg"));
        assert_eq!(mock.register(&config.registers.board_num).await, Some(9));

        mock.set_faults(MockFaults {
            clock_mhz: Some(200.0),
            ..Default::default()
        })
        .await;
        assert!(matches!(
            session.program_v6().await,
            Err(ReadoutError::HardwareProtocol(HardwareProtocolError::ClockOutOfRange { .. }))
        ));
    }

    #[tokio::test]
    async fn stopped_firmware_without_bitstream_fails() {
        let config = test_config();
        let mock = MockRoach::new(&config).with_running(false);
        let (session, _mock) = connected(config, BoardConfig::mock(4), mock).await;
        assert!(matches!(
            session.program_v6().await,
            Err(ReadoutError::HardwareProtocol(HardwareProtocolError::FirmwareNotRunning))
        ));
    }

    #[tokio::test]
    async fn init_v7_parks_lo_and_attenuators() {
        let config = test_config();
        let (session, mock) = connected(config.clone(), BoardConfig::mock(5), MockRoach::new(&config)).await;
        session.init_v7().await.unwrap();
        assert_eq!(mock.lo_freq_mhz().await, Some(2000.0));
        for id in 1..=4 {
            assert_eq!(mock.attenuation(id).await, MAX_ATTEN_DB);
        }
        assert!(mock.dacs_enabled().await);
    }

    #[tokio::test]
    async fn zdok_ramp_is_switched_off_after_failed_lock() {
        let config = test_config();
        let mock = MockRoach::new(&config).with_faults(MockFaults {
            failed_buses: vec![2],
            ..Default::default()
        });
        let (session, mock) = connected(config.clone(), BoardConfig::mock(6), mock).await;
        session.init_v7().await.unwrap();
        let err = session.cal_zdok().await.unwrap_err();
        assert!(matches!(
            err,
            ReadoutError::Calibration(CalibrationFailure::BusFailed { .. })
        ));
        assert!(!mock.zdok_ramp_on().await);
        session.cal_qdr().await.unwrap();
    }
}
