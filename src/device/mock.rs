//! Simulated ROACH2 board with its ADC/DAC daughter board.
//!
//! `MockRoach` keeps a register file and named memories and models the pieces of firmware
//! the controller interacts with:
//!
//! - the MicroBlaze behind the UART registers: ready codes, DAC LUT reception through the
//!   BRAM dump path, LO bytes, attenuator changes and the Z-DOK calibration ramp
//! - ADC calibration snapshots whose RMS follows the ADC attenuators
//! - phase snapshots with optional photon pulses
//! - per-stream IQ snapshots: every channel traces a resonance loop as the LO is detuned,
//!   rotated by the DDS phase currently stored in QDR
//! - the DDS lag check, a free-running clock counter and bus/QDR calibration flags
//!
//! Failures are injected through [`MockFaults`]. Randomness comes from a seeded ChaCha8 RNG
//! so runs are reproducible.

use super::snapshot::Snapshot;
use super::{FpgaProgrammer, RegisterInterface};
use crate::config::{FirmwareParams, ReadoutConfig, RegisterMap, UartCodes};
use crate::memory::{unpack_wave, MemLayout};
use anyhow::{bail, Result};
use async_trait::async_trait;
use num_complex::Complex64;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, HashSet};
use std::f64::consts::TAU;
use std::time::Instant;
use tokio::sync::Mutex;

/// Total ADC attenuation at which the simulated input sits in the middle of the RMS band.
const DEFAULT_ADC_TARGET_ATTEN_DB: f64 = 30.0;
/// Normalized ADC RMS produced at the target attenuation.
const ADC_RMS_AT_TARGET: f64 = 0.17;
const ADC_FULL_SCALE: f64 = 2048.0;
const DEFAULT_ADC_SNAPSHOT_LEN: usize = 1024;
const DEFAULT_PHASE_SNAPSHOT_LEN: usize = 1024;
const DEFAULT_PHASE_NOISE_RAD: f64 = 0.002;
/// Injected ADC spur: frequency in cycles per collated sample and amplitude in noise sigmas.
const SPIKE_CYCLES_PER_SAMPLE: f64 = 0.125;
const SPIKE_AMPLITUDE: f64 = 3.0;
/// Photon pulse shape: linear fall, exponential recovery.
const PULSE_HEIGHT_RAD: f64 = 0.5;
const PULSE_FALL_SAMPLES: usize = 12;
const PULSE_DECAY_SAMPLES: f64 = 20.0;
/// Firmware delay between the trigger flag and the phase it refers to.
const TRIGGER_DELAY: usize = 2;
/// Channel the simulated lag check reports for the FFT side.
const LAG_CHECK_DATA_CHANNEL: i64 = 100;
/// Resonance loops: distance of the loop centre from the origin and loop radius, in counts.
const LOOP_CENTER_DISTANCE: f64 = 20000.0;
const LOOP_RADIUS: f64 = 8000.0;
/// LO detuning over which a loop makes one full turn.
const LOOP_TURN_HZ: f64 = 1.0e6;
const IQ_NOISE: f64 = 20.0;
/// LO at which every channel sits on resonance.
const DEFAULT_RESONANCE_LO_HZ: f64 = 5.0e9;

/// Failures the simulated board can be told to produce.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MockFaults {
    /// The MicroBlaze stops reporting ready after the next strobe.
    pub stall_uart: bool,
    /// Answer the DAC LUT receive command with the error code.
    pub lut_error: bool,
    /// Answer plain MicroBlaze commands with the error code.
    pub microblaze_error: bool,
    /// Report an error after the last LO byte.
    pub lo_error: bool,
    /// Keep the LUT dump busy flag raised.
    pub lut_dump_stuck: bool,
    /// Z-DOK buses whose calibration flag reads 0.
    pub failed_buses: Vec<usize>,
    /// QDR chips whose calibration flag reads 0.
    pub failed_qdrs: Vec<usize>,
    /// Clock frequency reported by the cycle counter, in MHz.
    pub clock_mhz: Option<f64>,
    /// Fail any `program` call.
    pub program_fails: bool,
    /// Add a strong tone to the ADC snapshots.
    pub adc_spike: bool,
    /// Ratio of I to Q RMS in the ADC snapshots.
    pub iq_imbalance: Option<f64>,
    /// Registers that reject every write.
    pub dead_registers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MbMode {
    AwaitAck,
    Idle,
    ReceivingLut,
    ReceivingLo,
    AttenId,
    AttenValue(u32),
}

/// MicroBlaze model.
#[derive(Debug)]
struct MicroBlaze {
    mode: MbMode,
    ready: u32,
    commands: Vec<u32>,
    lut_buffer: Vec<u8>,
    dac_lut: Option<Vec<u8>>,
    lo_bytes: Vec<u8>,
    lo_mhz: Option<f64>,
    attens: [f64; 4],
    zdok_ramp: bool,
    dacs_enabled: bool,
}

impl MicroBlaze {
    fn new(codes: &UartCodes) -> Self {
        Self {
            mode: MbMode::Idle,
            ready: codes.v7_ready,
            commands: Vec::new(),
            lut_buffer: Vec::new(),
            dac_lut: None,
            lo_bytes: Vec::new(),
            lo_mhz: None,
            attens: [0.0; 4],
            zdok_ramp: false,
            dacs_enabled: false,
        }
    }

    fn receive(&mut self, byte: u32, codes: &UartCodes, faults: &MockFaults) {
        let ok = codes.v7_ready;
        self.ready = match self.mode {
            MbMode::AwaitAck => {
                self.mode = MbMode::Idle;
                ok
            }
            MbMode::Idle => {
                self.commands.push(byte);
                self.command(byte, codes, faults)
            }
            MbMode::ReceivingLo => {
                self.lo_bytes.push((byte & 0xff) as u8);
                if self.lo_bytes.len() < 4 {
                    ok
                } else {
                    let b = &self.lo_bytes;
                    let int = b[0] as u32 | (b[1] as u32) << 8;
                    let frac = b[2] as u32 | (b[3] as u32) << 8;
                    self.lo_mhz = Some(int as f64 + frac as f64 / 65536.0);
                    self.mode = MbMode::Idle;
                    if faults.lo_error {
                        codes.v7_err
                    } else {
                        ok
                    }
                }
            }
            MbMode::AttenId => {
                self.mode = MbMode::AttenValue(byte);
                ok
            }
            MbMode::AttenValue(id) => {
                self.mode = MbMode::Idle;
                match id {
                    1..=4 => {
                        self.attens[id as usize - 1] = byte as f64 / 4.0;
                        ok
                    }
                    _ => codes.v7_err,
                }
            }
            // A plain byte while a LUT is expected means the dump path was not enabled.
            MbMode::ReceivingLut => codes.v7_err,
        };
    }

    fn command(&mut self, byte: u32, codes: &UartCodes, faults: &MockFaults) -> u32 {
        let status = if faults.microblaze_error {
            codes.v7_err
        } else {
            codes.v7_ready
        };
        if byte == codes.mb_recv_dac_lut {
            if faults.lut_error {
                return codes.v7_err;
            }
            self.mode = MbMode::ReceivingLut;
            self.lut_buffer.clear();
            codes.v7_lut_ready
        } else if byte == codes.mb_recv_lo {
            self.mode = MbMode::ReceivingLo;
            self.lo_bytes.clear();
            status
        } else if byte == codes.mb_change_atten {
            self.mode = MbMode::AttenId;
            status
        } else if byte == codes.mb_zdok_ramp_on {
            self.zdok_ramp = true;
            status
        } else if byte == codes.mb_zdok_ramp_off {
            self.zdok_ramp = false;
            status
        } else if byte == codes.mb_enable_dacs {
            self.dacs_enabled = true;
            status
        } else if [
            codes.mb_send_lut_to_dac,
            codes.mb_init_lo,
            codes.mb_init_atten,
            codes.mb_en_frac_lo,
        ]
        .contains(&byte)
        {
            status
        } else {
            codes.v7_err
        }
    }

    fn receive_lut_chunk(&mut self, chunk: &[u8], expected: usize, codes: &UartCodes) {
        self.lut_buffer.extend_from_slice(chunk);
        self.ready = if self.lut_buffer.len() >= expected {
            self.dac_lut = Some(std::mem::take(&mut self.lut_buffer));
            self.mode = MbMode::Idle;
            codes.v7_ready
        } else {
            codes.v7_lut_ready
        };
    }
}

#[derive(Debug)]
struct MockState {
    registers: HashMap<String, u32>,
    memories: HashMap<String, Vec<u8>>,
    writes: Vec<(String, u32)>,
    armed: HashSet<String>,
    /// Words captured into each armed IQ snapshot since it was armed.
    iq_buffers: HashMap<String, Vec<f64>>,
    running: bool,
    bitstream: Option<String>,
    faults: MockFaults,
    rng: ChaCha8Rng,
    mb: MicroBlaze,
}

/// In-process stand-in for a ROACH2 readout board.
pub struct MockRoach {
    state: Mutex<MockState>,
    names: RegisterMap,
    codes: UartCodes,
    firmware: FirmwareParams,
    created: Instant,
    adc_target_atten_db: f64,
    adc_snapshot_len: usize,
    phase_snapshot_len: usize,
    phase_pulses: Vec<usize>,
    true_dds_shift: u32,
    resonance_lo_hz: f64,
}

impl MockRoach {
    /// Board using the register names, UART codes and firmware geometry of `config`.
    pub fn new(config: &ReadoutConfig) -> Self {
        Self {
            state: Mutex::new(MockState {
                registers: HashMap::new(),
                memories: HashMap::new(),
                writes: Vec::new(),
                armed: HashSet::new(),
                iq_buffers: HashMap::new(),
                running: true,
                bitstream: None,
                faults: MockFaults::default(),
                rng: ChaCha8Rng::seed_from_u64(0),
                mb: MicroBlaze::new(&config.uart),
            }),
            names: config.registers.clone(),
            codes: config.uart,
            firmware: config.firmware.clone(),
            created: Instant::now(),
            adc_target_atten_db: DEFAULT_ADC_TARGET_ATTEN_DB,
            adc_snapshot_len: DEFAULT_ADC_SNAPSHOT_LEN,
            phase_snapshot_len: DEFAULT_PHASE_SNAPSHOT_LEN,
            phase_pulses: Vec::new(),
            true_dds_shift: config.calibration.default_dds_shift.unwrap_or(76),
            resonance_lo_hz: DEFAULT_RESONANCE_LO_HZ,
        }
    }

    pub fn with_faults(mut self, faults: MockFaults) -> Self {
        self.state.get_mut().faults = faults;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.state.get_mut().rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    pub fn with_running(mut self, running: bool) -> Self {
        self.state.get_mut().running = running;
        self
    }

    /// Total ADC attenuation (both attenuators) that puts the input mid-band.
    pub fn with_adc_target_atten(mut self, db: f64) -> Self {
        self.adc_target_atten_db = db;
        self
    }

    /// Photon pulses starting at the given phase snapshot samples.
    pub fn with_phase_pulses(mut self, starts: Vec<usize>) -> Self {
        self.phase_pulses = starts;
        self
    }

    pub fn with_phase_snapshot_len(mut self, len: usize) -> Self {
        self.phase_snapshot_len = len;
        self
    }

    /// DDS lag the lag check should report once corrected.
    pub fn with_true_dds_shift(mut self, shift: u32) -> Self {
        self.true_dds_shift = shift;
        self
    }

    /// LO frequency that puts every resonance loop at its on-resonance point.
    pub fn with_resonance_lo(mut self, lo_hz: f64) -> Self {
        self.resonance_lo_hz = lo_hz;
        self
    }

    pub async fn set_faults(&self, faults: MockFaults) {
        self.state.lock().await.faults = faults;
    }

    /// Last value written to a register.
    pub async fn register(&self, name: &str) -> Option<u32> {
        self.state.lock().await.registers.get(name).copied()
    }

    pub async fn memory(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().await.memories.get(name).cloned()
    }

    /// Every value written to `name`, oldest first.
    pub async fn writes_to(&self, name: &str) -> Vec<u32> {
        self.state
            .lock()
            .await
            .writes
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Every register write, oldest first.
    pub async fn write_log(&self) -> Vec<(String, u32)> {
        self.state.lock().await.writes.clone()
    }

    /// Command bytes the MicroBlaze accepted while idle.
    pub async fn uart_commands(&self) -> Vec<u32> {
        self.state.lock().await.mb.commands.clone()
    }

    /// The DAC LUT bytes from the last completed transfer.
    pub async fn dac_lut(&self) -> Option<Vec<u8>> {
        self.state.lock().await.mb.dac_lut.clone()
    }

    pub async fn lo_freq_mhz(&self) -> Option<f64> {
        self.state.lock().await.mb.lo_mhz
    }

    /// Attenuation of attenuator `id` (1-4) in dB.
    pub async fn attenuation(&self, id: usize) -> f64 {
        self.state
            .lock()
            .await
            .mb
            .attens
            .get(id.wrapping_sub(1))
            .copied()
            .unwrap_or(f64::NAN)
    }

    pub async fn zdok_ramp_on(&self) -> bool {
        self.state.lock().await.mb.zdok_ramp
    }

    pub async fn dacs_enabled(&self) -> bool {
        self.state.lock().await.mb.dacs_enabled
    }

    pub async fn programmed_bitstream(&self) -> Option<String> {
        self.state.lock().await.bitstream.clone()
    }

    /// DDS phase of `channel` in `stream`, decoded from the QDR image.
    pub async fn dds_phase(&self, channel: usize, stream: usize) -> f64 {
        let state = self.state.lock().await;
        self.dds_phases(&state.memories, stream)
            .get(channel)
            .copied()
            .unwrap_or(0.0)
    }

    /// Centre of the IQ loop of `channel` in `stream`, as the IQ snapshots currently see it.
    pub async fn iq_loop_center(&self, channel: usize, stream: usize) -> (f64, f64) {
        let phase = self.dds_phase(channel, stream).await;
        let (center, _) = loop_shape(stream * self.firmware.n_channels_per_stream + channel);
        let seen = center * Complex64::from_polar(1.0, -phase);
        (seen.re, seen.im)
    }

    /// Phase of the first DDS sample of every channel of `stream`. Zero without a table.
    fn dds_phases(&self, memories: &HashMap<String, Vec<u8>>, stream: usize) -> Vec<f64> {
        let fw = &self.firmware;
        let cps = fw.n_channels_per_stream;
        let spc = fw.n_dds_samples_per_cycle;
        let image = match self.names.dds_mem.get(stream).and_then(|name| memories.get(name)) {
            Some(image) => image,
            None => return vec![0.0; cps],
        };
        let words: Vec<u64> = image
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap_or([0; 8])))
            .collect();
        let n = words.len();
        if n < cps {
            return vec![0.0; cps];
        }
        // Undo the QDR half swap and one-word rotation for the first cycle of rows.
        let rows: Vec<Vec<u64>> = (0..cps)
            .map(|row| vec![words[(row + n - 1) % n].rotate_left(32)])
            .collect();
        let layout = MemLayout {
            bits_per_sample_pair: fw.n_bits_per_dds_sample_pair,
            samples_per_cycle: spc,
            n_mems: 1,
            bits_per_mem_row: (fw.n_bytes_per_qdr_sample * 8) as u32,
            earlier_sample_is_msb: true,
        };
        match unpack_wave(&rows, &layout) {
            Ok((i, q)) => (0..cps)
                .map(|ch| (q[ch * spc] as f64).atan2(i[ch * spc] as f64))
                .collect(),
            Err(_) => vec![0.0; cps],
        }
    }

    fn clock_counter(&self, faults: &MockFaults) -> u32 {
        let hz = faults
            .clock_mhz
            .map(|mhz| mhz * 1e6)
            .unwrap_or(self.firmware.fpga_clock_rate);
        let cycles = (self.created.elapsed().as_secs_f64() * hz) as u64;
        (cycles & 0xFFFF_FFFF) as u32
    }

    fn status_flag(names: &[String], name: &str, failed: &[usize]) -> Option<u32> {
        names
            .iter()
            .position(|n| n == name)
            .map(|i| u32::from(!failed.contains(&i)))
    }

    fn on_write(&self, state: &mut MockState, name: &str, previous: u32, value: u32) {
        let names = &self.names;
        if name == names.reset_uart && previous == 1 && value == 0 {
            state.mb.mode = MbMode::AwaitAck;
            state.mb.ready = self.codes.v7_ready;
        } else if name == names.tx_en_uart && previous != 1 && value == 1 {
            self.on_strobe(state);
        } else if name == names.iq_snapshot_start && previous == 0 && value == 1 {
            self.capture_iq(state);
        } else if name == names.check_lag && previous == 0 && value == 1 {
            let cps = self.firmware.n_channels_per_stream as i64;
            let current = state.registers.get(&names.dds_shift).copied().unwrap_or(0) as i64;
            let dds_ch = (LAG_CHECK_DATA_CHANNEL + self.true_dds_shift as i64 - current - 1)
                .rem_euclid(cps);
            state
                .registers
                .insert(names.lag_data.clone(), LAG_CHECK_DATA_CHANNEL.rem_euclid(cps) as u32);
            state.registers.insert(names.lag_dds.clone(), dds_ch as u32);
        }
    }

    fn on_strobe(&self, state: &mut MockState) {
        state.mb.ready = 0;
        if state.faults.stall_uart {
            return;
        }
        let names = &self.names;
        let dumping = state.registers.get(&names.en_bram_dump).copied() == Some(1);
        if dumping && state.mb.mode == MbMode::ReceivingLut {
            let size = state.registers.get(&names.lut_buffer_size).copied().unwrap_or(0) as usize;
            let chunk: Vec<u8> = state
                .memories
                .get(&names.lut_bram_addr)
                .map(|m| m[..size.min(m.len())].to_vec())
                .unwrap_or_default();
            let expected = self.firmware.n_dac_samples() * 4;
            state.mb.receive_lut_chunk(&chunk, expected, &self.codes);
        } else {
            let byte = state.registers.get(&names.in_byte_uart).copied().unwrap_or(0);
            let faults = state.faults.clone();
            state.mb.receive(byte, &self.codes, &faults);
        }
    }

    fn adc_snapshot(&self, state: &mut MockState, index: usize) -> Snapshot {
        let total_atten = state.mb.attens[2] + state.mb.attens[3];
        let sigma = ADC_RMS_AT_TARGET
            * ADC_FULL_SCALE
            * 10f64.powf((self.adc_target_atten_db - total_atten) / 20.0);
        let imbalance = state.faults.iq_imbalance.unwrap_or(1.0);
        let spike = state.faults.adc_spike;
        let lanes = [2 * index, 2 * index + 1];
        let n = self.adc_snapshot_len;

        let mut snapshot = Snapshot::new();
        let mut i_cols = vec![Vec::with_capacity(n); 2];
        let mut q_cols = vec![Vec::with_capacity(n); 2];
        for sample in 0..n {
            for (col, lane) in lanes.iter().enumerate() {
                // Collated ADC time of this lane sample.
                let t = (sample * 8 + lane) as f64;
                let (mut i, mut q) = (
                    sigma * gaussian(&mut state.rng),
                    sigma / imbalance * gaussian(&mut state.rng),
                );
                if spike {
                    let arg = TAU * SPIKE_CYCLES_PER_SAMPLE * t;
                    i += SPIKE_AMPLITUDE * sigma * arg.cos();
                    q += SPIKE_AMPLITUDE * sigma * arg.sin();
                }
                i_cols[col].push(i.round().clamp(-ADC_FULL_SCALE, ADC_FULL_SCALE - 1.0));
                q_cols[col].push(q.round().clamp(-ADC_FULL_SCALE, ADC_FULL_SCALE - 1.0));
            }
        }
        for (col, lane) in lanes.iter().enumerate() {
            snapshot.insert(format!("data_i{lane}"), std::mem::take(&mut i_cols[col]));
            snapshot.insert(format!("data_q{lane}"), std::mem::take(&mut q_cols[col]));
        }
        snapshot
    }

    /// Append one IQ point of every channel to each armed IQ snapshot with room left.
    fn capture_iq(&self, state: &mut MockState) {
        let cps = self.firmware.n_channels_per_stream;
        let detuning = state
            .mb
            .lo_mhz
            .map(|mhz| mhz * 1e6 - self.resonance_lo_hz)
            .unwrap_or(0.0);
        let n_streams = self.firmware.n_streams();
        for (stream, name) in self.names.iq_snapshots.iter().enumerate().take(n_streams) {
            let used = state.iq_buffers.get(name).map_or(0, Vec::len);
            if !state.armed.contains(name) || used >= 4 * cps {
                continue;
            }
            let phases = self.dds_phases(&state.memories, stream);
            let mut i_vals = Vec::with_capacity(cps);
            let mut q_vals = Vec::with_capacity(cps);
            for (ch, phase) in phases.iter().enumerate() {
                let (center, on_resonance) = loop_shape(stream * cps + ch);
                let angle = on_resonance + TAU * detuning / LOOP_TURN_HZ;
                let point = (center + Complex64::from_polar(LOOP_RADIUS, angle))
                    * Complex64::from_polar(1.0, -phase);
                i_vals.push((point.re + IQ_NOISE * gaussian(&mut state.rng)).round());
                q_vals.push((point.im + IQ_NOISE * gaussian(&mut state.rng)).round());
            }
            let buffer = state.iq_buffers.entry(name.clone()).or_default();
            buffer.extend(i_vals);
            buffer.extend(q_vals);
        }
    }

    fn phase_snapshot(&self, state: &mut MockState) -> Snapshot {
        let n = self.phase_snapshot_len;
        let mut phase: Vec<f64> = (0..n)
            .map(|_| DEFAULT_PHASE_NOISE_RAD * gaussian(&mut state.rng))
            .collect();
        let mut trig = vec![0.0; n];
        for &start in &self.phase_pulses {
            for (k, value) in phase.iter_mut().enumerate().skip(start) {
                let j = k - start;
                *value -= if j <= PULSE_FALL_SAMPLES {
                    PULSE_HEIGHT_RAD * j as f64 / PULSE_FALL_SAMPLES as f64
                } else {
                    PULSE_HEIGHT_RAD
                        * (-((j - PULSE_FALL_SAMPLES) as f64) / PULSE_DECAY_SAMPLES).exp()
                };
            }
            if let Some(flag) = trig.get_mut(start + PULSE_FALL_SAMPLES + TRIGGER_DELAY) {
                *flag = 1.0;
            }
        }
        Snapshot::new()
            .with_field("phase", phase)
            .with_field("trig", trig)
    }
}

/// Loop centre and on-resonance angle of firmware channel `k`, before DDS demodulation.
fn loop_shape(k: usize) -> (Complex64, f64) {
    let center = Complex64::from_polar(LOOP_CENTER_DISTANCE, 1.0 + 0.5 * k as f64);
    (center, 0.4 + 0.9 * k as f64)
}

fn gaussian(rng: &mut ChaCha8Rng) -> f64 {
    // Box-Muller
    let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}

#[async_trait]
impl RegisterInterface for MockRoach {
    async fn read_register(&self, name: &str) -> Result<u32> {
        let state = self.state.lock().await;
        let names = &self.names;
        if name == names.v7_ready {
            return Ok(state.mb.ready);
        }
        if name == names.lut_dump_busy {
            return Ok(u32::from(state.faults.lut_dump_stuck));
        }
        if name == names.clock_counter {
            return Ok(self.clock_counter(&state.faults));
        }
        if let Some(flag) = Self::status_flag(&names.zdok_bus_status, name, &state.faults.failed_buses)
        {
            return Ok(flag);
        }
        if let Some(flag) = Self::status_flag(&names.qdr_status, name, &state.faults.failed_qdrs) {
            return Ok(flag);
        }
        Ok(state.registers.get(name).copied().unwrap_or(0))
    }

    async fn write_register(&self, name: &str, value: u32, _blocking: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.faults.dead_registers.iter().any(|r| r == name) {
            bail!("Register {} rejected write", name);
        }
        let previous = state.registers.insert(name.to_string(), value).unwrap_or(0);
        state.writes.push((name.to_string(), value));
        self.on_write(&mut state, name, previous, value);
        Ok(())
    }

    async fn blind_write(&self, name: &str, data: &[u8], offset: usize) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.faults.dead_registers.iter().any(|r| r == name) {
            bail!("Memory {} rejected write", name);
        }
        let memory = state.memories.entry(name.to_string()).or_default();
        if memory.len() < offset + data.len() {
            memory.resize(offset + data.len(), 0);
        }
        memory[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn read_memory(&self, name: &str, size: usize, offset: usize) -> Result<Vec<u8>> {
        let state = self.state.lock().await;
        match state.memories.get(name) {
            Some(memory) if memory.len() >= offset + size => Ok(memory[offset..offset + size].to_vec()),
            Some(memory) => bail!(
                "Read of {} bytes at {} beyond {} ({} bytes)",
                size,
                offset,
                name,
                memory.len()
            ),
            None => bail!("No memory named {}", name),
        }
    }

    async fn arm_snapshot(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.iq_buffers.remove(name);
        state.armed.insert(name.to_string());
        Ok(())
    }

    async fn read_snapshot(&self, name: &str) -> Result<Snapshot> {
        let mut state = self.state.lock().await;
        if !state.armed.remove(name) {
            bail!("Snapshot {} read before it was armed", name);
        }
        if let Some(index) = self.names.adc_snapshots.iter().position(|n| n == name) {
            return Ok(self.adc_snapshot(&mut state, index));
        }
        if name == self.names.phase_snapshot {
            return Ok(self.phase_snapshot(&mut state));
        }
        if self.names.iq_snapshots.iter().any(|n| n == name) {
            let words = state.iq_buffers.remove(name).unwrap_or_default();
            return Ok(Snapshot::new().with_field("iq", words));
        }
        bail!("No snapshot named {}", name)
    }
}

#[async_trait]
impl FpgaProgrammer for MockRoach {
    async fn is_running(&self) -> Result<bool> {
        Ok(self.state.lock().await.running)
    }

    async fn program(&self, bitstream: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.faults.program_fails {
            bail!("Failed to program {}", bitstream);
        }
        state.registers.clear();
        state.memories.clear();
        state.armed.clear();
        state.iq_buffers.clear();
        state.running = true;
        state.bitstream = Some(bitstream.to_string());
        tracing::debug!(bitstream, "Mock board programmed");
        Ok(())
    }
}
