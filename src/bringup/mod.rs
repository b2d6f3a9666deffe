//! Dependency-driven command queues for board bring-up and configuration.
//!
//! A [`StateMachine`] tracks one [`CommandState`] per command of a [`CommandSet`] and runs
//! queued commands strictly in order against an [`Executor`]. Requesting a command plans
//! every prerequisite that is not yet completed, so asking for `LoadThreshold` on a fresh
//! board connects, reads the frequency list and builds every LUT first.
//!
//! Progress is published on a broadcast channel as [`MachineEvent`]s. A command failure
//! marks that command as errored, drops everything still queued and is returned to the
//! caller as [`ReadoutError::CommandQueue`].
//!
//! # Example
//!
//! ```no_run
//! use mkid_readout::bringup::{BoardContext, InitCommand, StateMachine, Target};
//! # async fn example(mut context: BoardContext) -> mkid_readout::error::Result<()> {
//! let mut machine = StateMachine::<InitCommand>::new(1);
//! let _events = machine.subscribe();
//! machine.add_commands(Target::EnsureAll);
//! let report = machine.execute_commands(&mut context).await?;
//! assert!(report.aborted.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod configure;
pub mod init;
pub mod worker;

pub use commands::{parse_command, CommandOutput, CommandSet, CommandState, Target};
pub use configure::ConfigureCommand;
pub use init::InitCommand;
pub use worker::{
    run_boards, BoardContext, BoardWorker, PhaseReport, WorkerCommand, WorkerHandle,
    WorkerReport, WorkerRequest,
};

use crate::error::{ReadoutError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Runs one command of a set.
#[async_trait]
pub trait Executor<C: CommandSet>: Send {
    async fn execute(&mut self, command: C) -> Result<CommandOutput>;
}

/// Progress notifications of a [`StateMachine`].
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent<C> {
    Started {
        board: u32,
        command: C,
    },
    Finished {
        board: u32,
        command: C,
        output: CommandOutput,
    },
    Error {
        board: u32,
        command: C,
        message: String,
    },
    Reset {
        board: u32,
        states: Vec<CommandState>,
    },
    /// Emitted at the end of every `execute_commands` call, successful or not.
    BatchComplete {
        board: u32,
        completed: Vec<C>,
    },
}

/// Cancels queued commands of a running batch.
///
/// The command currently executing finishes. Everything queued after it is dropped and
/// reset to undefined. An abort only applies to the batch it was issued against: one that
/// arrives while the machine is idle, or while the last queued command runs, is discarded.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Read and clear the abort flag.
    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Outcome of one `execute_commands` call.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport<C> {
    pub completed: Vec<(C, CommandOutput)>,
    /// Commands dropped from the queue by an abort.
    pub aborted: Vec<C>,
}

impl<C> Default for BatchReport<C> {
    fn default() -> Self {
        Self {
            completed: Vec::new(),
            aborted: Vec::new(),
        }
    }
}

/// Per-board state and queue of one command set.
pub struct StateMachine<C: CommandSet> {
    board: u32,
    states: Vec<CommandState>,
    queue: VecDeque<C>,
    events: broadcast::Sender<MachineEvent<C>>,
    abort: AbortHandle,
}

impl<C: CommandSet> std::fmt::Debug for StateMachine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("board", &self.board)
            .field("states", &self.states)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl<C: CommandSet> StateMachine<C> {
    pub fn new(board: u32) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            board,
            states: vec![CommandState::Undefined; C::ALL.len()],
            queue: VecDeque::new(),
            events,
            abort: AbortHandle::default(),
        }
    }

    pub fn board(&self) -> u32 {
        self.board
    }

    pub fn states(&self) -> &[CommandState] {
        &self.states
    }

    pub fn state(&self, command: C) -> CommandState {
        self.states[command.id()]
    }

    /// Commands waiting to run, in execution order.
    pub fn queued(&self) -> Vec<C> {
        self.queue.iter().copied().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MachineEvent<C>> {
        self.events.subscribe()
    }

    /// Sender side of the event channel, for subscribing from another task.
    pub fn event_sender(&self) -> broadcast::Sender<MachineEvent<C>> {
        self.events.clone()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// States after requesting `target`, without applying them.
    ///
    /// Commands left in progress by an earlier plan are demoted first. An explicit command
    /// is forced to run and resets whatever it invalidates. `EnsureAll` aims at the last
    /// command and only schedules it if it is not completed. Every transitive prerequisite
    /// of the target that is not completed is scheduled.
    pub fn plan(&self, target: Target<C>) -> Vec<CommandState> {
        let mut next: Vec<CommandState> = self
            .states
            .iter()
            .map(|s| match s {
                CommandState::InProgress => CommandState::Undefined,
                other => *other,
            })
            .collect();

        let top = match target {
            Target::Command(command) => {
                for invalid in command.invalidated_by() {
                    next[invalid.id()] = CommandState::Undefined;
                }
                next[command.id()] = CommandState::InProgress;
                command
            }
            Target::EnsureAll => {
                let last = C::last();
                if next[last.id()] != CommandState::Completed {
                    next[last.id()] = CommandState::InProgress;
                }
                last
            }
        };

        let mut visited = vec![false; C::ALL.len()];
        let mut stack = vec![top];
        while let Some(command) = stack.pop() {
            if std::mem::replace(&mut visited[command.id()], true) {
                continue;
            }
            for &pre in command.prerequisites() {
                if next[pre.id()] != CommandState::Completed {
                    next[pre.id()] = CommandState::InProgress;
                }
                stack.push(pre);
            }
        }
        next
    }

    /// Apply the plan for `target` and queue every scheduled command in ascending order.
    pub fn add_commands(&mut self, target: Target<C>) -> Vec<C> {
        if self.abort.take() {
            debug!(board = self.board, "Discarding abort issued while idle");
        }
        self.states = self.plan(target);
        self.queue = C::ALL
            .iter()
            .copied()
            .filter(|c| self.states[c.id()] == CommandState::InProgress)
            .collect();
        debug!(board = self.board, request = %target, queue = ?self.queue, "Commands queued");
        self.queued()
    }

    /// Run queued commands in order until the queue is empty, a command fails or the batch
    /// is aborted.
    #[instrument(skip_all, fields(board = self.board))]
    pub async fn execute_commands<E>(&mut self, executor: &mut E) -> Result<BatchReport<C>>
    where
        E: Executor<C> + ?Sized,
    {
        let mut report = BatchReport::default();

        while let Some(command) = self.queue.pop_front() {
            if self.abort.take() {
                report.aborted.push(command);
                report.aborted.extend(self.queue.drain(..));
                for c in &report.aborted {
                    self.states[c.id()] = CommandState::Undefined;
                }
                warn!(aborted = ?report.aborted, "Command batch aborted");
                break;
            }

            info!(%command, "Starting command");
            let _ = self.events.send(MachineEvent::Started {
                board: self.board,
                command,
            });

            match executor.execute(command).await {
                Ok(output) => {
                    self.states[command.id()] = CommandState::Completed;
                    info!(%command, "Command completed");
                    let _ = self.events.send(MachineEvent::Finished {
                        board: self.board,
                        command,
                        output: output.clone(),
                    });
                    report.completed.push((command, output));
                }
                Err(err) => {
                    self.states[command.id()] = CommandState::Error;
                    for c in self.queue.drain(..) {
                        self.states[c.id()] = CommandState::Undefined;
                    }
                    self.abort.take();
                    error!(%command, error = %err, "Command failed, queue cleared");
                    let _ = self.events.send(MachineEvent::Error {
                        board: self.board,
                        command,
                        message: err.to_string(),
                    });
                    self.emit_batch_complete(&report);
                    return Err(ReadoutError::CommandQueue {
                        command: command.name().to_string(),
                        source: Box::new(err),
                    });
                }
            }
        }

        if self.abort.take() {
            debug!("Abort arrived after the last command started, nothing left to drop");
        }
        self.emit_batch_complete(&report);
        Ok(report)
    }

    /// Roll states back as if `target` were about to run, leaving it undefined.
    ///
    /// `None` resets every command.
    pub fn reset_to(&mut self, target: Option<C>) {
        self.queue.clear();
        match target {
            None => self.states.fill(CommandState::Undefined),
            Some(command) => {
                let mut next = self.plan(Target::Command(command));
                for state in next.iter_mut() {
                    if *state == CommandState::InProgress {
                        *state = CommandState::Undefined;
                    }
                }
                next[command.id()] = CommandState::Undefined;
                self.states = next;
            }
        }
        info!(board = self.board, reset_to = ?target, "States reset");
        let _ = self.events.send(MachineEvent::Reset {
            board: self.board,
            states: self.states.clone(),
        });
    }

    fn emit_batch_complete(&self, report: &BatchReport<C>) {
        let _ = self.events.send(MachineEvent::BatchComplete {
            board: self.board,
            completed: report.completed.iter().map(|(c, _)| *c).collect(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CalibrationFailure;
    use tracing_test::traced_test;
    use CommandState::*;

    /// Records what ran and fails on request.
    struct Recorder<C> {
        ran: Vec<C>,
        fail_on: Option<C>,
        abort_after: Option<(C, AbortHandle)>,
    }

    #[async_trait]
    impl<C: CommandSet> Executor<C> for Recorder<C> {
        async fn execute(&mut self, command: C) -> Result<CommandOutput> {
            self.ran.push(command);
            if let Some((after, handle)) = &self.abort_after {
                if *after == command {
                    handle.abort();
                }
            }
            if self.fail_on == Some(command) {
                return Err(CalibrationFailure::BusFailed {
                    bus: "qdr0_cal_ok".into(),
                }
                .into());
            }
            Ok(CommandOutput::Done)
        }
    }

    fn recorder<C>() -> Recorder<C> {
        Recorder {
            ran: Vec::new(),
            fail_on: None,
            abort_after: None,
        }
    }

    async fn run_all<C: CommandSet>(machine: &mut StateMachine<C>) {
        machine.add_commands(Target::EnsureAll);
        machine.execute_commands(&mut recorder()).await.unwrap();
    }

    #[test]
    fn request_from_scratch_schedules_prerequisites() {
        let machine = StateMachine::<InitCommand>::new(1);
        assert_eq!(
            machine.plan(Target::Command(InitCommand::InitV7)),
            vec![InProgress, InProgress, InProgress, Undefined, Undefined]
        );
        assert_eq!(machine.plan(Target::EnsureAll), vec![InProgress; 5]);
    }

    #[tokio::test]
    async fn ensure_all_skips_completed_commands() {
        let mut machine = StateMachine::<InitCommand>::new(1);
        run_all(&mut machine).await;
        assert_eq!(machine.states(), &[Completed; 5]);
        assert!(machine.add_commands(Target::EnsureAll).is_empty());

        // An explicit request reruns the command even though it completed.
        assert_eq!(
            machine.add_commands(Target::Command(InitCommand::InitV7)),
            vec![InitCommand::InitV7]
        );
    }

    #[tokio::test]
    async fn reprogramming_invalidates_bus_calibrations() {
        let mut machine = StateMachine::<InitCommand>::new(1);
        run_all(&mut machine).await;

        let queued = machine.add_commands(Target::Command(InitCommand::ProgramV6));
        assert_eq!(queued, vec![InitCommand::ProgramV6]);
        assert_eq!(
            machine.states(),
            &[Completed, InProgress, Completed, Undefined, Undefined]
        );

        let mut exec = recorder();
        machine.execute_commands(&mut exec).await.unwrap();
        machine.add_commands(Target::EnsureAll);
        exec.ran.clear();
        machine.execute_commands(&mut exec).await.unwrap();
        assert_eq!(exec.ran, vec![InitCommand::CalZdok, InitCommand::CalQdr]);
    }

    #[tokio::test]
    async fn reloading_freqs_keeps_fir_taps() {
        use ConfigureCommand::*;
        let mut machine = StateMachine::<ConfigureCommand>::new(2);
        run_all(&mut machine).await;

        assert_eq!(machine.add_commands(Target::Command(LoadFreq)), vec![LoadFreq]);
        assert_eq!(
            machine.states(),
            &[
                Completed, InProgress, Undefined, Undefined, Undefined, Undefined, Undefined,
                Completed, Undefined
            ]
        );
        assert_eq!(
            machine.plan(Target::EnsureAll),
            vec![
                Completed, InProgress, InProgress, InProgress, InProgress, InProgress, InProgress,
                Completed, InProgress
            ]
        );
    }

    #[test]
    fn fir_needs_only_the_frequency_list() {
        use ConfigureCommand::*;
        let machine = StateMachine::<ConfigureCommand>::new(2);
        assert_eq!(
            machine.plan(Target::Command(LoadFir)),
            vec![
                InProgress, InProgress, Undefined, Undefined, Undefined, Undefined, Undefined,
                InProgress, Undefined
            ]
        );
    }

    #[tokio::test]
    async fn stale_in_progress_is_demoted() {
        let mut machine = StateMachine::<InitCommand>::new(1);
        machine.add_commands(Target::Command(InitCommand::CalQdr));
        let queued = machine.add_commands(Target::Command(InitCommand::Connect));
        assert_eq!(queued, vec![InitCommand::Connect]);
        assert_eq!(machine.state(InitCommand::CalQdr), Undefined);
    }

    #[tokio::test]
    #[traced_test]
    async fn failure_drains_queue_and_publishes_error() {
        let mut machine = StateMachine::<InitCommand>::new(7);
        let mut events = machine.subscribe();
        machine.add_commands(Target::EnsureAll);

        let mut exec = recorder();
        exec.fail_on = Some(InitCommand::InitV7);
        let err = machine.execute_commands(&mut exec).await.unwrap_err();
        match &err {
            ReadoutError::CommandQueue { command, source } => {
                assert_eq!(command, "Initialize V7");
                assert!(matches!(**source, ReadoutError::Calibration(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }

        assert_eq!(
            exec.ran,
            vec![InitCommand::Connect, InitCommand::ProgramV6, InitCommand::InitV7]
        );
        assert!(machine.queued().is_empty());
        assert_eq!(machine.states(), &[Completed, Completed, Error, Undefined, Undefined]);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&MachineEvent::Error {
            board: 7,
            command: InitCommand::InitV7,
            message: "Calibration failed: No calibration solution found for qdr0_cal_ok".into(),
        }));
        assert_eq!(
            seen.last(),
            Some(&MachineEvent::BatchComplete {
                board: 7,
                completed: vec![InitCommand::Connect, InitCommand::ProgramV6],
            })
        );

        assert!(logs_contain("Command failed, queue cleared"));

        // The errored command is scheduled again on the next request.
        assert_eq!(machine.add_commands(Target::EnsureAll).len(), 3);
    }

    #[tokio::test]
    async fn abort_drops_unstarted_commands() {
        let mut machine = StateMachine::<InitCommand>::new(1);
        machine.add_commands(Target::EnsureAll);
        let mut exec = recorder();
        exec.abort_after = Some((InitCommand::ProgramV6, machine.abort_handle()));

        let report = machine.execute_commands(&mut exec).await.unwrap();
        assert_eq!(report.completed.len(), 2);
        assert_eq!(
            report.aborted,
            vec![InitCommand::InitV7, InitCommand::CalZdok, InitCommand::CalQdr]
        );
        assert_eq!(machine.states(), &[Completed, Completed, Undefined, Undefined, Undefined]);
        assert!(!machine.abort_handle().is_aborted());
    }

    #[tokio::test]
    async fn abort_during_last_command_does_not_reach_next_batch() {
        let mut machine = StateMachine::<InitCommand>::new(1);
        machine.add_commands(Target::EnsureAll);
        let mut exec = recorder();
        exec.abort_after = Some((InitCommand::CalQdr, machine.abort_handle()));

        let report = machine.execute_commands(&mut exec).await.unwrap();
        assert_eq!(report.completed.len(), 5);
        assert!(report.aborted.is_empty());
        assert!(!machine.abort_handle().is_aborted());

        machine.add_commands(Target::Command(InitCommand::CalZdok));
        let report = machine.execute_commands(&mut recorder()).await.unwrap();
        assert_eq!(report.completed.len(), 1);
        assert!(report.aborted.is_empty());
        assert_eq!(machine.state(InitCommand::CalZdok), Completed);
    }

    #[tokio::test]
    async fn abort_while_idle_is_discarded() {
        let mut machine = StateMachine::<InitCommand>::new(1);
        machine.abort_handle().abort();
        machine.add_commands(Target::EnsureAll);

        let mut exec = recorder();
        let report = machine.execute_commands(&mut exec).await.unwrap();
        assert!(report.aborted.is_empty());
        assert_eq!(exec.ran.len(), 5);
        assert_eq!(machine.states(), &[Completed; 5]);
    }

    #[tokio::test]
    async fn reset_to_rolls_back_target_and_invalidated() {
        use ConfigureCommand::*;
        let mut machine = StateMachine::<ConfigureCommand>::new(3);
        let mut events = machine.subscribe();
        run_all(&mut machine).await;

        machine.reset_to(Some(DefineRoachLut));
        let expected = vec![
            Completed, Completed, Undefined, Undefined, Undefined, Undefined, Undefined, Completed,
            Undefined,
        ];
        assert_eq!(machine.states(), expected.as_slice());

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event);
        }
        assert_eq!(last, Some(MachineEvent::Reset { board: 3, states: expected }));

        machine.reset_to(None);
        assert_eq!(machine.states(), &[Undefined; 9]);
    }
}
