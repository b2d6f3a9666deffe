//! Channelizer configuration commands.
//!
//! Explicitly re-running a command resets every later command except `LoadFir`, since FIR
//! taps only depend on the resonator list. Reconnecting resets nothing. A fresh LO sweep
//! therefore discards the loop rotation and the loaded loop centres.

use super::commands::{CommandOutput, CommandSet};
use super::{BoardContext, Executor};
use crate::error::Result;
use async_trait::async_trait;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigureCommand {
    Connect,
    LoadFreq,
    DefineRoachLut,
    DefineDacLut,
    Sweep,
    Rotate,
    Translate,
    LoadFir,
    LoadThreshold,
}

impl CommandSet for ConfigureCommand {
    const ALL: &'static [Self] = &[
        ConfigureCommand::Connect,
        ConfigureCommand::LoadFreq,
        ConfigureCommand::DefineRoachLut,
        ConfigureCommand::DefineDacLut,
        ConfigureCommand::Sweep,
        ConfigureCommand::Rotate,
        ConfigureCommand::Translate,
        ConfigureCommand::LoadFir,
        ConfigureCommand::LoadThreshold,
    ];

    fn id(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            ConfigureCommand::Connect => "Connect",
            ConfigureCommand::LoadFreq => "Read Freqs",
            ConfigureCommand::DefineRoachLut => "Define Roach LUTs",
            ConfigureCommand::DefineDacLut => "Define DAC LUTs",
            ConfigureCommand::Sweep => "Sweep",
            ConfigureCommand::Rotate => "Rotate Loops",
            ConfigureCommand::Translate => "Load Centers",
            ConfigureCommand::LoadFir => "Load FIRs",
            ConfigureCommand::LoadThreshold => "Load Thresholds",
        }
    }

    fn prerequisites(self) -> &'static [Self] {
        use ConfigureCommand::*;
        match self {
            Connect => &[],
            LoadFreq => &[Connect],
            DefineRoachLut => &[LoadFreq],
            DefineDacLut => &[DefineRoachLut],
            Sweep => &[DefineDacLut],
            Rotate => &[Sweep],
            Translate => &[Rotate],
            LoadFir => &[LoadFreq],
            LoadThreshold => &[LoadFir, Translate],
        }
    }

    fn invalidated_by(self) -> Vec<Self> {
        if self == ConfigureCommand::Connect {
            return Vec::new();
        }
        Self::ALL
            .iter()
            .copied()
            .filter(|c| c.id() > self.id() && *c != ConfigureCommand::LoadFir)
            .collect()
    }
}

impl fmt::Display for ConfigureCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[async_trait]
impl Executor<ConfigureCommand> for BoardContext {
    async fn execute(&mut self, command: ConfigureCommand) -> Result<CommandOutput> {
        let session = &mut self.session;
        match command {
            ConfigureCommand::Connect => {
                session.connect(&*self.connector).await?;
                let dds_shift = session.load_dds_shift(None).await?;
                session.load_full_delay_cal().await?;
                Ok(CommandOutput::Connected {
                    dds_shift: Some(dds_shift),
                })
            }
            ConfigureCommand::LoadFreq => {
                let resonators = session.load_freq().await?;
                Ok(CommandOutput::FreqsLoaded { resonators })
            }
            ConfigureCommand::DefineRoachLut => {
                let lo_hz = session.define_roach_lut().await?;
                Ok(CommandOutput::RoachLutDefined { lo_hz })
            }
            ConfigureCommand::DefineDacLut => session
                .define_dac_lut()
                .await
                .map(CommandOutput::DacLutDefined),
            ConfigureCommand::Sweep => {
                let report = session.sweep().await?;
                Ok(CommandOutput::Swept {
                    steps: report.lo_offsets_hz.len(),
                    centers: report.centers,
                })
            }
            ConfigureCommand::Rotate => {
                let report = session.rotate_loops().await?;
                Ok(CommandOutput::Rotated {
                    rotation_rad: report.rotation_rad,
                })
            }
            ConfigureCommand::Translate => {
                let centers = session.translate_loops().await?;
                Ok(CommandOutput::CentersLoaded { centers })
            }
            ConfigureCommand::LoadFir => session.load_fir().await.map(|_| CommandOutput::Done),
            ConfigureCommand::LoadThreshold => {
                let entries = session.load_threshold().await?;
                Ok(CommandOutput::Thresholds { entries })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConfigureCommand::*;

    #[test]
    fn explicit_request_resets_later_commands_but_fir() {
        assert_eq!(
            LoadFreq.invalidated_by(),
            vec![DefineRoachLut, DefineDacLut, Sweep, Rotate, Translate, LoadThreshold]
        );
        assert_eq!(
            DefineDacLut.invalidated_by(),
            vec![Sweep, Rotate, Translate, LoadThreshold]
        );
        assert!(Connect.invalidated_by().is_empty());
        assert!(LoadThreshold.invalidated_by().is_empty());
    }

    #[test]
    fn resweeping_drops_rotation_and_centres() {
        assert_eq!(Sweep.invalidated_by(), vec![Rotate, Translate, LoadThreshold]);
        assert_eq!(Rotate.invalidated_by(), vec![Translate, LoadThreshold]);
        assert_eq!(Translate.prerequisites(), &[Rotate]);
        assert_eq!(LoadThreshold.prerequisites(), &[LoadFir, Translate]);
    }
}
