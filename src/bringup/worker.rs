//! Per-board worker task and the multi-board runner.
//!
//! Each board is owned by exactly one [`BoardWorker`], which holds the board's
//! [`ChannelizerSession`] and both state machines. Requests are processed one at a time,
//! either directly through [`BoardWorker::run_request`] or by spawning the worker as an
//! actor and talking to it through a [`WorkerHandle`] (mpsc requests, oneshot replies).
//!
//! [`run_boards`] fans a single request out to every selected board, one task per board,
//! and collects a [`WorkerReport`] from each.

use super::commands::{CommandOutput, CommandSet, CommandState, Target};
use super::{AbortHandle, BatchReport, ConfigureCommand, InitCommand, MachineEvent, StateMachine};
use crate::channels::AllocationOrder;
use crate::config::{BoardConfig, ReadoutConfig};
use crate::device::BoardConnector;
use crate::error::{ReadoutError, Result};
use crate::session::{ChannelizerSession, TriggeredSnapshot};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, instrument, warn};

/// What the commands of one board act on.
pub struct BoardContext {
    pub session: ChannelizerSession,
    pub connector: Arc<dyn BoardConnector>,
}

impl BoardContext {
    pub fn new(session: ChannelizerSession, connector: Arc<dyn BoardConnector>) -> Self {
        Self { session, connector }
    }
}

impl std::fmt::Debug for BoardContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardContext")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Which boards to touch and how far to take them.
#[derive(Debug, Clone, Default)]
pub struct WorkerRequest {
    /// Board numbers to run. Empty selects every configured board.
    pub boards: Vec<u32>,
    pub init: Option<Target<InitCommand>>,
    pub configure: Option<Target<ConfigureCommand>>,
    pub order: AllocationOrder,
}

impl WorkerRequest {
    fn selects(&self, board: &BoardConfig) -> bool {
        self.boards.is_empty() || self.boards.contains(&board.num)
    }
}

/// A command that finished, by name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedCommand {
    pub command: String,
    pub output: CommandOutput,
}

/// Result of one state machine batch on one board.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseReport {
    pub completed: Vec<CompletedCommand>,
    pub aborted: Vec<String>,
    /// Final state of every command, in id order.
    pub states: Vec<(String, CommandState)>,
}

impl PhaseReport {
    fn from_batch<C: CommandSet>(batch: &BatchReport<C>, machine: &StateMachine<C>) -> Self {
        Self {
            completed: batch
                .completed
                .iter()
                .map(|(command, output)| CompletedCommand {
                    command: command.name().to_string(),
                    output: output.clone(),
                })
                .collect(),
            aborted: batch.aborted.iter().map(|c| c.name().to_string()).collect(),
            states: state_table(machine),
        }
    }

    fn failed<C: CommandSet>(machine: &StateMachine<C>) -> Self {
        Self {
            completed: Vec::new(),
            aborted: Vec::new(),
            states: state_table(machine),
        }
    }
}

fn state_table<C: CommandSet>(machine: &StateMachine<C>) -> Vec<(String, CommandState)> {
    C::ALL
        .iter()
        .map(|c| (c.name().to_string(), machine.state(*c)))
        .collect()
}

/// Everything that happened on one board during a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerReport {
    pub board: u32,
    pub init: Option<PhaseReport>,
    pub configure: Option<PhaseReport>,
    /// First failure, if any. Configuration is skipped when bring-up fails.
    pub error: Option<String>,
}

impl WorkerReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Messages accepted by a spawned [`BoardWorker`].
#[derive(Debug)]
pub enum WorkerCommand {
    Init {
        target: Target<InitCommand>,
        response: oneshot::Sender<Result<BatchReport<InitCommand>>>,
    },
    Configure {
        target: Target<ConfigureCommand>,
        response: oneshot::Sender<Result<BatchReport<ConfigureCommand>>>,
    },
    ResetInit {
        target: Option<InitCommand>,
        response: oneshot::Sender<Vec<CommandState>>,
    },
    ResetConfigure {
        target: Option<ConfigureCommand>,
        response: oneshot::Sender<Vec<CommandState>>,
    },
    PhaseSnapshot {
        index: usize,
        response: oneshot::Sender<Result<TriggeredSnapshot>>,
    },
    Shutdown,
}

impl WorkerCommand {
    pub fn init(
        target: Target<InitCommand>,
    ) -> (Self, oneshot::Receiver<Result<BatchReport<InitCommand>>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Init { target, response: tx }, rx)
    }

    pub fn configure(
        target: Target<ConfigureCommand>,
    ) -> (Self, oneshot::Receiver<Result<BatchReport<ConfigureCommand>>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Configure { target, response: tx }, rx)
    }

    pub fn reset_init(target: Option<InitCommand>) -> (Self, oneshot::Receiver<Vec<CommandState>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ResetInit { target, response: tx }, rx)
    }

    pub fn reset_configure(
        target: Option<ConfigureCommand>,
    ) -> (Self, oneshot::Receiver<Vec<CommandState>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ResetConfigure { target, response: tx }, rx)
    }

    pub fn phase_snapshot(index: usize) -> (Self, oneshot::Receiver<Result<TriggeredSnapshot>>) {
        let (tx, rx) = oneshot::channel();
        (Self::PhaseSnapshot { index, response: tx }, rx)
    }
}

/// Sole owner of one board's session and command queues.
#[derive(Debug)]
pub struct BoardWorker {
    context: BoardContext,
    init: StateMachine<InitCommand>,
    configure: StateMachine<ConfigureCommand>,
}

impl BoardWorker {
    pub fn new(context: BoardContext) -> Self {
        let board = context.session.board().num;
        Self {
            context,
            init: StateMachine::new(board),
            configure: StateMachine::new(board),
        }
    }

    pub fn board(&self) -> u32 {
        self.init.board()
    }

    pub fn session(&self) -> &ChannelizerSession {
        &self.context.session
    }

    pub fn init_machine(&self) -> &StateMachine<InitCommand> {
        &self.init
    }

    pub fn configure_machine(&self) -> &StateMachine<ConfigureCommand> {
        &self.configure
    }

    pub async fn run_init(&mut self, target: Target<InitCommand>) -> Result<BatchReport<InitCommand>> {
        self.init.add_commands(target);
        self.init.execute_commands(&mut self.context).await
    }

    pub async fn run_configure(
        &mut self,
        target: Target<ConfigureCommand>,
    ) -> Result<BatchReport<ConfigureCommand>> {
        self.configure.add_commands(target);
        self.configure.execute_commands(&mut self.context).await
    }

    /// Run the bring-up phase, then configuration, stopping at the first failure.
    #[instrument(skip_all, fields(board = self.board()))]
    pub async fn run_request(&mut self, request: &WorkerRequest) -> WorkerReport {
        let mut report = WorkerReport {
            board: self.board(),
            init: None,
            configure: None,
            error: None,
        };

        if let Some(target) = request.init {
            match self.run_init(target).await {
                Ok(batch) => report.init = Some(PhaseReport::from_batch(&batch, &self.init)),
                Err(err) => {
                    report.init = Some(PhaseReport::failed(&self.init));
                    report.error = Some(err.to_string());
                    return report;
                }
            }
        }

        if let Some(target) = request.configure {
            match self.run_configure(target).await {
                Ok(batch) => {
                    report.configure = Some(PhaseReport::from_batch(&batch, &self.configure))
                }
                Err(err) => {
                    report.configure = Some(PhaseReport::failed(&self.configure));
                    report.error = Some(err.to_string());
                }
            }
        }
        report
    }

    /// Spawn the worker as an actor task.
    pub fn spawn(self) -> (WorkerHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(32);
        let handle = WorkerHandle {
            board: self.board(),
            sender,
            init_abort: self.init.abort_handle(),
            configure_abort: self.configure.abort_handle(),
            init_events: self.init.event_sender(),
            configure_events: self.configure.event_sender(),
        };
        let task = tokio::spawn(self.run(receiver));
        (handle, task)
    }

    /// Process commands until `Shutdown` or until every handle is dropped.
    pub async fn run(mut self, mut receiver: mpsc::Receiver<WorkerCommand>) {
        info!(board = self.board(), "Board worker started");
        while let Some(command) = receiver.recv().await {
            match command {
                WorkerCommand::Init { target, response } => {
                    let _ = response.send(self.run_init(target).await);
                }
                WorkerCommand::Configure { target, response } => {
                    let _ = response.send(self.run_configure(target).await);
                }
                WorkerCommand::ResetInit { target, response } => {
                    self.init.reset_to(target);
                    let _ = response.send(self.init.states().to_vec());
                }
                WorkerCommand::ResetConfigure { target, response } => {
                    self.configure.reset_to(target);
                    let _ = response.send(self.configure.states().to_vec());
                }
                WorkerCommand::PhaseSnapshot { index, response } => {
                    let _ = response.send(self.context.session.phase_snapshot(index).await);
                }
                WorkerCommand::Shutdown => break,
            }
        }
        info!(board = self.board(), "Board worker stopped");
    }
}

/// Client side of a spawned [`BoardWorker`].
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    board: u32,
    sender: mpsc::Sender<WorkerCommand>,
    init_abort: AbortHandle,
    configure_abort: AbortHandle,
    init_events: broadcast::Sender<MachineEvent<InitCommand>>,
    configure_events: broadcast::Sender<MachineEvent<ConfigureCommand>>,
}

impl WorkerHandle {
    /// Number of the board this worker drives.
    pub fn board(&self) -> u32 {
        self.board
    }

    async fn request<T>(&self, command: WorkerCommand, reply: oneshot::Receiver<T>) -> Result<T> {
        self.sender
            .send(command)
            .await
            .map_err(|_| self.stopped())?;
        reply.await.map_err(|_| self.stopped())
    }

    fn stopped(&self) -> ReadoutError {
        anyhow::anyhow!("Worker for board {} has stopped", self.board).into()
    }

    /// Queue bring-up commands for `target` and wait for the batch to finish.
    ///
    /// Fails if the worker has stopped or a command in the batch failed.
    pub async fn init(&self, target: Target<InitCommand>) -> Result<BatchReport<InitCommand>> {
        let (command, reply) = WorkerCommand::init(target);
        self.request(command, reply).await?
    }

    /// Queue configuration commands for `target` and wait for the batch to finish.
    pub async fn configure(
        &self,
        target: Target<ConfigureCommand>,
    ) -> Result<BatchReport<ConfigureCommand>> {
        let (command, reply) = WorkerCommand::configure(target);
        self.request(command, reply).await?
    }

    /// Roll the bring-up machine back, see [`StateMachine::reset_to`]. Returns the new states.
    pub async fn reset_init(&self, target: Option<InitCommand>) -> Result<Vec<CommandState>> {
        let (command, reply) = WorkerCommand::reset_init(target);
        self.request(command, reply).await
    }

    /// Roll the configuration machine back. Returns the new states.
    pub async fn reset_configure(
        &self,
        target: Option<ConfigureCommand>,
    ) -> Result<Vec<CommandState>> {
        let (command, reply) = WorkerCommand::reset_configure(target);
        self.request(command, reply).await
    }

    /// Capture the phase of resonator `index` with the software trigger applied.
    pub async fn phase_snapshot(&self, index: usize) -> Result<TriggeredSnapshot> {
        let (command, reply) = WorkerCommand::phase_snapshot(index);
        self.request(command, reply).await?
    }

    /// Stop whatever is queued after the running command, in both machines.
    pub fn abort(&self) {
        warn!(board = self.board, "Abort requested");
        self.init_abort.abort();
        self.configure_abort.abort();
    }

    /// Events of the bring-up machine from now on.
    pub fn subscribe_init(&self) -> broadcast::Receiver<MachineEvent<InitCommand>> {
        self.init_events.subscribe()
    }

    /// Events of the configuration machine from now on.
    pub fn subscribe_configure(&self) -> broadcast::Receiver<MachineEvent<ConfigureCommand>> {
        self.configure_events.subscribe()
    }

    /// Ask the worker to exit after the requests queued before this one.
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(WorkerCommand::Shutdown)
            .await
            .map_err(|_| self.stopped())
    }
}

/// Run `request` on every selected board in parallel, one task per board.
///
/// Reports come back sorted by board number. A board whose task panicked gets a report
/// carrying the panic as its error.
pub async fn run_boards(
    config: Arc<ReadoutConfig>,
    connector: Arc<dyn BoardConnector>,
    request: WorkerRequest,
) -> Result<Vec<WorkerReport>> {
    let boards: Vec<BoardConfig> = config
        .boards
        .iter()
        .filter(|b| request.selects(b))
        .cloned()
        .collect();
    if boards.is_empty() {
        return Err(ReadoutError::validation(format!(
            "No configured board matches {:?}",
            request.boards
        )));
    }

    let request = Arc::new(request);
    let mut tasks: JoinSet<WorkerReport> = JoinSet::new();
    let mut nums = Vec::with_capacity(boards.len());
    for board in boards {
        nums.push(board.num);
        let session = ChannelizerSession::new(board, config.clone()).with_order(request.order);
        let context = BoardContext::new(session, connector.clone());
        let request = request.clone();
        tasks.spawn(async move { BoardWorker::new(context).run_request(&request).await });
    }
    info!(boards = ?nums, "Board workers spawned");

    let mut reports = Vec::with_capacity(nums.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => {
                if let Some(err) = &report.error {
                    error!(board = report.board, error = %err, "Board failed");
                }
                reports.push(report);
            }
            Err(join_err) => error!(error = %join_err, "Board worker panicked"),
        }
    }

    for num in nums {
        if !reports.iter().any(|r| r.board == num) {
            reports.push(WorkerReport {
                board: num,
                init: None,
                configure: None,
                error: Some("worker task panicked".to_string()),
            });
        }
    }
    reports.sort_by_key(|r| r.board);
    Ok(reports)
}
