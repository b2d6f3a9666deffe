//! End-to-end bring-up and configuration against simulated boards.

mod common;

use common::{fir_file, freq_file, mock_board, tiny_config};
use mkid_readout::bringup::{
    run_boards, BoardContext, BoardWorker, CommandOutput, CommandState, ConfigureCommand,
    InitCommand, Target, WorkerRequest,
};
use mkid_readout::bringup::MachineEvent;
use mkid_readout::device::{DefaultConnector, DeviceHandle, MockFaults, MockRoach, StaticConnector};
use mkid_readout::error::ReadoutError;
use mkid_readout::session::ChannelizerSession;
use std::sync::Arc;

fn worker_on(config: &Arc<mkid_readout::ReadoutConfig>, board: mkid_readout::BoardConfig, mock: Arc<MockRoach>) -> BoardWorker {
    let session = ChannelizerSession::new(board, config.clone());
    let connector = Arc::new(StaticConnector(DeviceHandle::new(mock)));
    BoardWorker::new(BoardContext::new(session, connector))
}

#[tokio::test]
async fn all_boards_come_up_in_parallel() {
    let mut config = tiny_config();
    let freqs = freq_file(&config, 6);
    let firs = fir_file();
    config.boards = vec![mock_board(2, &freqs, &firs), mock_board(1, &freqs, &firs)];

    let request = WorkerRequest {
        init: Some(Target::EnsureAll),
        configure: Some(Target::EnsureAll),
        ..WorkerRequest::default()
    };
    let reports = run_boards(Arc::new(config), Arc::new(DefaultConnector), request)
        .await
        .unwrap();

    assert_eq!(reports.iter().map(|r| r.board).collect::<Vec<_>>(), vec![1, 2]);
    for report in &reports {
        assert!(report.is_ok(), "board {} failed: {:?}", report.board, report.error);
        let init = report.init.as_ref().unwrap();
        assert_eq!(init.completed.len(), 5);
        assert!(init.states.iter().all(|(_, s)| *s == CommandState::Completed));

        let configure = report.configure.as_ref().unwrap();
        let names: Vec<&str> = configure.completed.iter().map(|c| c.command.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Connect",
                "Read Freqs",
                "Define Roach LUTs",
                "Define DAC LUTs",
                "Sweep",
                "Rotate Loops",
                "Load Centers",
                "Load FIRs",
                "Load Thresholds"
            ]
        );
        match &configure.completed[4].output {
            CommandOutput::Swept { steps, centers } => {
                assert_eq!(*steps, 100);
                assert_eq!(centers.len(), 6);
            }
            other => panic!("unexpected output {other:?}"),
        }
        match &configure.completed[8].output {
            CommandOutput::Thresholds { entries } => assert_eq!(entries.len(), 6),
            other => panic!("unexpected output {other:?}"),
        }
    }

    let json = serde_json::to_value(&reports).unwrap();
    assert_eq!(json[0]["configure"]["completed"][1]["output"]["resonators"], 6);
}

#[tokio::test]
async fn unknown_board_is_rejected() {
    let config = tiny_config();
    let request = WorkerRequest {
        boards: vec![999],
        init: Some(Target::EnsureAll),
        ..WorkerRequest::default()
    };
    let result = run_boards(Arc::new(config), Arc::new(DefaultConnector), request).await;
    let err = tokio_test::assert_err!(result);
    assert!(matches!(err, ReadoutError::Validation(_)));
}

#[tokio::test]
async fn failed_qdr_stops_before_configuration() {
    let config = Arc::new(tiny_config());
    let freqs = freq_file(&config, 4);
    let firs = fir_file();
    let mock = Arc::new(MockRoach::new(&config).with_faults(MockFaults {
        failed_qdrs: vec![1],
        ..Default::default()
    }));
    let mut worker = worker_on(&config, mock_board(3, &freqs, &firs), mock);

    let report = worker
        .run_request(&WorkerRequest {
            init: Some(Target::EnsureAll),
            configure: Some(Target::EnsureAll),
            ..WorkerRequest::default()
        })
        .await;

    let error = report.error.unwrap();
    assert!(error.contains("Calibrate QDR"), "{error}");
    assert!(report.configure.is_none());
    assert_eq!(
        worker.init_machine().states(),
        &[
            CommandState::Completed,
            CommandState::Completed,
            CommandState::Completed,
            CommandState::Completed,
            CommandState::Error
        ]
    );
}

#[tokio::test]
async fn spawned_worker_reconfigures_on_request() {
    let config = Arc::new(tiny_config());
    let freqs = freq_file(&config, 5);
    let firs = fir_file();
    let mock = Arc::new(MockRoach::new(&config).with_true_dds_shift(2));
    let worker = worker_on(&config, mock_board(4, &freqs, &firs), mock.clone());
    let (handle, task) = worker.spawn();
    let mut events = handle.subscribe_configure();

    let batch = handle.configure(Target::EnsureAll).await.unwrap();
    assert_eq!(batch.completed.len(), 9);
    assert_eq!(
        batch.completed[0].1,
        CommandOutput::Connected { dds_shift: Some(2) }
    );

    let mut finished = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let MachineEvent::Finished { command, .. } = event {
            finished.push(command);
        }
    }
    assert_eq!(finished.len(), 9);

    // Asking for the DAC LUT again redoes it and everything measured through it, but not
    // the FIR taps.
    let batch = handle
        .configure(Target::Command(ConfigureCommand::DefineDacLut))
        .await
        .unwrap();
    let rerun: Vec<ConfigureCommand> = batch.completed.iter().map(|(c, _)| *c).collect();
    assert_eq!(rerun, vec![ConfigureCommand::DefineDacLut]);
    let batch = handle.configure(Target::EnsureAll).await.unwrap();
    let rerun: Vec<ConfigureCommand> = batch.completed.iter().map(|(c, _)| *c).collect();
    assert_eq!(
        rerun,
        vec![
            ConfigureCommand::Sweep,
            ConfigureCommand::Rotate,
            ConfigureCommand::Translate,
            ConfigureCommand::LoadThreshold
        ]
    );

    let snap = handle.phase_snapshot(0).await.unwrap();
    assert!(snap.threshold_rad < 0.0);

    let states = handle.reset_configure(Some(ConfigureCommand::LoadFreq)).await.unwrap();
    assert_eq!(states[ConfigureCommand::LoadFreq as usize], CommandState::Undefined);
    assert_eq!(states[ConfigureCommand::LoadFir as usize], CommandState::Completed);

    let states = handle.reset_init(None).await.unwrap();
    assert!(states.iter().all(|s| *s == CommandState::Undefined));

    handle.shutdown().await.unwrap();
    task.await.unwrap();
    assert!(handle.configure(Target::EnsureAll).await.is_err());
}

#[tokio::test]
async fn init_target_reprograms_and_recalibrates() {
    let config = Arc::new(tiny_config());
    let freqs = freq_file(&config, 2);
    let firs = fir_file();
    let mock = Arc::new(MockRoach::new(&config));
    let mut board = mock_board(5, &freqs, &firs);
    board.bitstream = Some("readout.fpg".into());
    let mut worker = worker_on(&config, board, mock.clone());

    worker.run_init(Target::EnsureAll).await.unwrap();
    assert_eq!(mock.programmed_bitstream().await.as_deref(), Some("readout.fpg"));

    let batch = worker
        .run_init(Target::Command(InitCommand::ProgramV6))
        .await
        .unwrap();
    assert!(matches!(batch.completed[0].1, CommandOutput::Programmed(_)));
    assert_eq!(worker.init_machine().state(InitCommand::CalZdok), CommandState::Undefined);

    let batch = worker.run_init(Target::EnsureAll).await.unwrap();
    let rerun: Vec<InitCommand> = batch.completed.iter().map(|(c, _)| *c).collect();
    assert_eq!(rerun, vec![InitCommand::CalZdok, InitCommand::CalQdr]);
}
