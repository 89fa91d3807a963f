//! Single-active-run enforcement of the run supervisor

use std::time::Duration;
use tempfile::TempDir;
use waveguide_daq::config::{CurrentProfile, Settings};
use waveguide_daq::error::DaqError;
use waveguide_daq::experiment::{RunState, RunSupervisor, ScanEvent};
use waveguide_daq::hardware::mock::SimulatedBench;

fn settings(dir: &TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.scan.currents_a = CurrentProfile::List(vec![0.080, 0.090]);
    settings.storage.output_dir = dir.path().to_path_buf();
    settings
}

#[tokio::test(start_paused = true)]
async fn second_start_needs_confirmation() {
    let dir = TempDir::new().unwrap();
    let sim = SimulatedBench::stabilized(25.0);
    let mut supervisor = RunSupervisor::new(settings(&dir), sim.bench());

    let first = supervisor.start(false).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(supervisor.is_active());

    let err = supervisor.start(false).await.unwrap_err();
    assert!(matches!(err, DaqError::RunActive));

    let summary = supervisor.join().await.unwrap();
    assert_eq!(summary.run_id, first);
    assert!(!summary.stopped, "refused start leaves the run alone");
    assert_eq!(summary.currents_applied, vec![0.080, 0.090]);
}

#[tokio::test(start_paused = true)]
async fn confirmed_restart_stops_and_joins_the_prior_run() {
    let dir = TempDir::new().unwrap();
    let sim = SimulatedBench::stabilized(25.0);
    let mut supervisor = RunSupervisor::new(settings(&dir), sim.bench());
    let mut events = supervisor.subscribe();

    supervisor.start(false).await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    let first_control = supervisor.control().unwrap();

    supervisor.start(true).await.unwrap();

    assert_eq!(first_control.state(), RunState::Finished);
    let setpoints = sim.source.setpoints();
    assert_eq!(&setpoints[..2], &[0.080, 0.0], "prior run unwound first");

    let summary = supervisor.join().await.unwrap();
    assert!(!summary.stopped);
    assert_eq!(sim.source.setpoints().last(), Some(&0.0));

    let mut finished = 0;
    while let Ok(event) = events.try_recv() {
        if event == ScanEvent::Finished {
            finished += 1;
        }
    }
    assert_eq!(finished, 2);
}

#[tokio::test(start_paused = true)]
async fn controls_forward_to_the_active_run() {
    let dir = TempDir::new().unwrap();
    let sim = SimulatedBench::stabilized(25.0);
    let mut supervisor = RunSupervisor::new(settings(&dir), sim.bench());

    supervisor.start(false).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    supervisor.pause().unwrap();
    assert_eq!(supervisor.state(), Some(RunState::Paused));

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(supervisor.is_active(), "held at a checkpoint");

    supervisor.resume().unwrap();
    supervisor.stop().unwrap();
    let summary = supervisor.join().await.unwrap();
    assert!(summary.stopped);
    assert!(!supervisor.is_active());
    assert!(matches!(supervisor.stop(), Err(DaqError::NoActiveRun)));
}
