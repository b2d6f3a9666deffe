//! Hardware bring-up commands: connect, program, MicroBlaze and bus calibration.

use super::commands::{CommandOutput, CommandSet};
use super::{BoardContext, Executor};
use crate::error::Result;
use async_trait::async_trait;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitCommand {
    Connect,
    ProgramV6,
    InitV7,
    CalZdok,
    CalQdr,
}

impl CommandSet for InitCommand {
    const ALL: &'static [Self] = &[
        InitCommand::Connect,
        InitCommand::ProgramV6,
        InitCommand::InitV7,
        InitCommand::CalZdok,
        InitCommand::CalQdr,
    ];

    fn id(self) -> usize {
        self as usize
    }

    fn name(self) -> &'static str {
        match self {
            InitCommand::Connect => "Connect",
            InitCommand::ProgramV6 => "Program V6",
            InitCommand::InitV7 => "Initialize V7",
            InitCommand::CalZdok => "Calibrate Z-DOK",
            InitCommand::CalQdr => "Calibrate QDR",
        }
    }

    fn prerequisites(self) -> &'static [Self] {
        match self {
            InitCommand::Connect => &[],
            InitCommand::ProgramV6 => &[InitCommand::Connect],
            InitCommand::InitV7 => &[InitCommand::ProgramV6],
            InitCommand::CalZdok => &[InitCommand::InitV7],
            InitCommand::CalQdr => &[InitCommand::CalZdok],
        }
    }

    /// Reprogramming the FPGA loses both bus calibrations.
    fn invalidated_by(self) -> Vec<Self> {
        match self {
            InitCommand::ProgramV6 => vec![InitCommand::CalZdok, InitCommand::CalQdr],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for InitCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[async_trait]
impl Executor<InitCommand> for BoardContext {
    async fn execute(&mut self, command: InitCommand) -> Result<CommandOutput> {
        let session = &mut self.session;
        match command {
            InitCommand::Connect => {
                session.connect(&*self.connector).await?;
                Ok(CommandOutput::Connected { dds_shift: None })
            }
            InitCommand::ProgramV6 => session.program_v6().await.map(CommandOutput::Programmed),
            InitCommand::InitV7 => session.init_v7().await.map(|_| CommandOutput::Done),
            InitCommand::CalZdok => session.cal_zdok().await.map(|_| CommandOutput::Done),
            InitCommand::CalQdr => session.cal_qdr().await.map(|_| CommandOutput::Done),
        }
    }
}
