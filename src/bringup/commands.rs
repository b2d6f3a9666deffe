//! Command sets, their dependency tables and per-command state.

use crate::calibration::{CalibrationWarning, IqPoint};
use crate::session::{BoardIdentity, DacLutSummary, ThresholdEntry};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Progress of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    #[default]
    Undefined,
    InProgress,
    Completed,
    Error,
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandState::Undefined => write!(f, "undefined"),
            CommandState::InProgress => write!(f, "in progress"),
            CommandState::Completed => write!(f, "completed"),
            CommandState::Error => write!(f, "error"),
        }
    }
}

/// A totally ordered set of commands with an acyclic prerequisite table.
///
/// Ids run from 0 to `ALL.len() - 1` in `ALL` order. Prerequisites must have lower ids.
pub trait CommandSet:
    Copy + Eq + std::hash::Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Every command, ordered by id.
    const ALL: &'static [Self];

    fn id(self) -> usize;

    /// Human readable name.
    fn name(self) -> &'static str;

    /// Commands that must be completed before this one runs.
    fn prerequisites(self) -> &'static [Self];

    /// Commands reset to undefined when this one is explicitly requested.
    fn invalidated_by(self) -> Vec<Self>;

    fn from_id(id: usize) -> Option<Self> {
        Self::ALL.get(id).copied()
    }

    /// Highest command of the set.
    fn last() -> Self {
        Self::ALL[Self::ALL.len() - 1]
    }
}

/// What a plan should bring to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<C> {
    /// Run this command even if already completed, plus whatever it needs.
    Command(C),
    /// Complete every command without redoing completed ones.
    EnsureAll,
}

impl<C: CommandSet> fmt::Display for Target<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Command(command) => write!(f, "{}", command),
            Target::EnsureAll => write!(f, "all"),
        }
    }
}

/// Parse a command from its name, its variant name in snake case or its id.
pub fn parse_command<C: CommandSet>(s: &str) -> Option<C> {
    let key = normalize(s);
    if let Ok(id) = key.parse::<usize>() {
        return C::from_id(id);
    }
    C::ALL
        .iter()
        .copied()
        .find(|c| normalize(c.name()) == key || normalize(&format!("{:?}", c)) == key)
}

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl<C: CommandSet> FromStr for Target<C> {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if normalize(s) == "all" {
            return Ok(Target::EnsureAll);
        }
        parse_command(s).map(Target::Command).ok_or_else(|| {
            let names: Vec<&str> = C::ALL.iter().map(|c| c.name()).collect();
            format!("Unknown command '{}'. Expected one of: {}, all", s, names.join(", "))
        })
    }
}

/// Payload published when a command finishes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandOutput {
    /// The command has nothing to report.
    Done,
    Connected { dds_shift: Option<u32> },
    Programmed(BoardIdentity),
    FreqsLoaded { resonators: usize },
    RoachLutDefined { lo_hz: f64 },
    DacLutDefined(DacLutSummary),
    /// LO sweep finished with one loop centre per resonator.
    Swept { steps: usize, centers: Vec<IqPoint> },
    Rotated { rotation_rad: Vec<f64> },
    /// Loop centres from a fresh sweep, loaded into the capture blocks.
    CentersLoaded { centers: Vec<IqPoint> },
    Thresholds { entries: Vec<ThresholdEntry> },
}

impl CommandOutput {
    /// Calibration warnings carried by the payload.
    pub fn warnings(&self) -> &[CalibrationWarning] {
        match self {
            CommandOutput::DacLutDefined(summary) => &summary.adc.warnings,
            _ => &[],
        }
    }
}
