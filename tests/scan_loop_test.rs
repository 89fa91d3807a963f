//! Integration tests for the scan loop on the simulated bench
//!
//! All tests run on a paused tokio clock, so the 20 s current settle, the
//! tracking hold times and the temperature polls complete instantly.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use waveguide_daq::config::{CurrentProfile, Settings};
use waveguide_daq::data::{DataRecorder, MeasurementRecord};
use waveguide_daq::experiment::{
    ExecutionControl, Notifier, RunState, RunSummary, ScanEvent, ScanPhase, ScanScheduler,
};
use waveguide_daq::hardware::mock::{
    CouplingProfile, MockTemperatureController, SimulatedBench,
};

const CURRENTS: [f64; 3] = [0.080, 0.085, 0.090];

fn settings(dir: &Path, currents: &[f64]) -> Settings {
    let mut settings = Settings::default();
    settings.scan.currents_a = CurrentProfile::List(currents.to_vec());
    settings.storage.output_dir = dir.to_path_buf();
    settings
}

struct Harness {
    control: ExecutionControl,
    notifier: Notifier,
    worker: JoinHandle<RunSummary>,
}

fn spawn_run(settings: &Settings, sim: &SimulatedBench) -> Harness {
    let control = ExecutionControl::new();
    let (notifier, _rx) = Notifier::channel();
    let scheduler = ScanScheduler::new(
        settings,
        sim.bench(),
        control.clone(),
        notifier.clone(),
        DataRecorder::new(&settings.storage.output_dir),
    )
    .unwrap();
    Harness {
        control,
        notifier,
        worker: tokio::spawn(scheduler.run()),
    }
}

/// Collect every event up to and including `Finished`.
fn collect(notifier: &Notifier) -> JoinHandle<Vec<ScanEvent>> {
    let mut rx = notifier.subscribe();
    tokio::spawn(async move {
        let mut events = Vec::new();
        loop {
            match rx.recv().await {
                Ok(ScanEvent::Finished) => {
                    events.push(ScanEvent::Finished);
                    break;
                }
                Ok(event) => events.push(event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
        events
    })
}

async fn wait_for_site(rx: &mut broadcast::Receiver<ScanEvent>, wanted: usize) {
    loop {
        match rx.recv().await.unwrap() {
            ScanEvent::RecordSaved { site, .. } if site == wanted => return,
            _ => {}
        }
    }
}

fn saved_sites(events: &[ScanEvent]) -> Vec<usize> {
    events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::RecordSaved { site, .. } => Some(*site),
            _ => None,
        })
        .collect()
}

fn statuses(events: &[ScanEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::Status { text } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn current_sequence_is_visited_once_in_order() {
    let dir = TempDir::new().unwrap();
    let settings = settings(dir.path(), &CURRENTS);
    let sim = SimulatedBench::new(&settings);
    let run = spawn_run(&settings, &sim);
    let events = collect(&run.notifier);

    let summary = run.worker.await.unwrap();
    let events = events.await.unwrap();

    assert_eq!(sim.source.setpoints(), vec![0.080, 0.085, 0.090, 0.0]);
    assert_eq!(summary.currents_applied, CURRENTS.to_vec());
    assert_eq!(sim.temperature.setpoints(), vec![25.0], "setpoint written once");
    assert!(!summary.stopped);
    assert_eq!(summary.iteration_failures, 0);
    assert_eq!(summary.sites_captured, 15);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 15);
    assert_eq!(run.control.state(), RunState::Finished);

    let phases: Vec<ScanPhase> = events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::PhaseChanged { phase } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(phases.first(), Some(&ScanPhase::WaitingTemperature));
    assert_eq!(&phases[phases.len() - 2..], &[ScanPhase::Unwinding, ScanPhase::Finished]);

    let texts = statuses(&events);
    assert!(texts.iter().any(|t| t == "Temperature stabilized."));
    assert!(texts.iter().any(|t| t == "Set current: 0.0850A"));
    assert_eq!(texts.last().map(String::as_str), Some("Loop finished."));
}

#[tokio::test(start_paused = true)]
async fn records_follow_the_site_numbering() {
    let dir = TempDir::new().unwrap();
    let settings = settings(dir.path(), &[0.085]);
    let sim = SimulatedBench::stabilized(25.0);
    let run = spawn_run(&settings, &sim);
    let events = collect(&run.notifier);

    let summary = run.worker.await.unwrap();
    assert_eq!(saved_sites(&events.await.unwrap()), vec![0, 1, 2, 3, 4]);

    let record: MeasurementRecord =
        serde_json::from_slice(&std::fs::read(&summary.records[2]).unwrap()).unwrap();
    assert_eq!(record.metadata.site, 2);
    assert_eq!(record.metadata.currents_a, 0.085);
    assert_eq!(record.metadata.gaussian_fit_params.len(), 3);
    assert_eq!(record.metadata.sampled_power_output.len(), 21);
    assert_eq!(record.data.wavelength_nm.len(), record.data.il_te_db.len());
    // -30 dBm + 200 dBm/A * 0.085 A
    assert!((record.metadata.measured_power_dbm + 13.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn output_three_of_the_first_chip_is_reached_without_a_move() {
    let dir = TempDir::new().unwrap();
    let settings = settings(dir.path(), &[0.085]);
    let sim = SimulatedBench::stabilized(25.0);
    let run = spawn_run(&settings, &sim);

    let summary = run.worker.await.unwrap();

    // Three grid moves plus the return move; output index 3 is skipped.
    let moves = sim.output_stage.moves();
    assert_eq!(moves.len(), 4);
    assert_eq!(&moves[..3], &[0.127, 0.127, 0.127]);
    assert!((moves[3] + 0.381).abs() < 1e-9, "return move {}", moves[3]);
    assert!((sim.output_stage.target() - 12.0).abs() < 1e-9);
    assert_eq!(sim.input_stage.moves(), vec![0.127; 4]);
    assert_eq!(summary.sites_captured, 5, "the skipped site is still captured");
    // One convergence per grid site plus the final one.
    assert_eq!(sim.focus_tracker.latch_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn later_chips_start_with_the_chip_pitch() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(dir.path(), &[0.085]);
    settings.grid.number_of_chips = 2;
    settings.grid.outputs_per_chip = 2;
    let sim = SimulatedBench::stabilized(25.0);
    let run = spawn_run(&settings, &sim);
    let events = collect(&run.notifier);

    run.worker.await.unwrap();

    let moves = sim.output_stage.moves();
    assert_eq!(&moves[..4], &[0.127, 0.127, 2.0, 0.127]);
    assert_eq!(saved_sites(&events.await.unwrap()), vec![0, 1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn stop_during_the_grid_unwinds_without_further_moves() {
    let dir = TempDir::new().unwrap();
    let settings = settings(dir.path(), &CURRENTS);
    let sim = SimulatedBench::stabilized(25.0);
    let run = spawn_run(&settings, &sim);
    let mut rx = run.notifier.subscribe();

    wait_for_site(&mut rx, 2).await;
    run.control.request_stop();
    let input_moves = sim.input_stage.move_count();
    let output_moves = sim.output_stage.move_count();

    loop {
        if let ScanEvent::Finished = rx.recv().await.unwrap() {
            assert_eq!(sim.source.current(), 0.0, "current restored before finish");
            break;
        }
    }
    let summary = run.worker.await.unwrap();

    assert!(summary.stopped);
    assert_eq!(sim.input_stage.move_count(), input_moves);
    assert_eq!(sim.output_stage.move_count(), output_moves);
    assert_eq!(sim.source.setpoints(), vec![0.080, 0.0]);
    assert_eq!(summary.currents_applied, vec![0.080]);
    assert_eq!(run.control.state(), RunState::Finished);
}

#[tokio::test(start_paused = true)]
async fn pause_holds_at_a_checkpoint_and_resume_continues() {
    let dir = TempDir::new().unwrap();
    let settings = settings(dir.path(), &[0.085]);
    let sim = SimulatedBench::stabilized(25.0);
    let run = spawn_run(&settings, &sim);
    let events = collect(&run.notifier);
    let mut rx = run.notifier.subscribe();

    wait_for_site(&mut rx, 1).await;
    run.control.pause();
    tokio::time::sleep(Duration::from_secs(3600)).await;

    assert_eq!(run.control.state(), RunState::Paused);
    assert!(!run.worker.is_finished());
    let captured = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(captured, 2, "sites 0 and 1 only");
    let moves_while_paused = sim.output_stage.move_count();
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(sim.output_stage.move_count(), moves_while_paused);

    run.control.resume();
    let summary = run.worker.await.unwrap();

    assert_eq!(saved_sites(&events.await.unwrap()), vec![0, 1, 2, 3, 4]);
    assert_eq!(summary.sites_captured, 5);
    assert!(!summary.stopped);
}

#[tokio::test(start_paused = true)]
async fn a_failed_iteration_is_reported_and_skipped() {
    let dir = TempDir::new().unwrap();
    let settings = settings(dir.path(), &[0.080, 0.090]);
    let sim = SimulatedBench::stabilized(25.0);
    sim.source.fail_next_power_reads(1);
    let run = spawn_run(&settings, &sim);
    let events = collect(&run.notifier);

    let summary = run.worker.await.unwrap();
    let texts = statuses(&events.await.unwrap());

    assert_eq!(summary.iteration_failures, 1);
    assert_eq!(summary.currents_applied, vec![0.080, 0.090]);
    assert_eq!(summary.sites_captured, 5, "only the second current captured");
    assert!(texts
        .iter()
        .any(|t| t.starts_with("An error occurred in the loop:")));
    assert_eq!(sim.source.setpoints(), vec![0.080, 0.090, 0.0]);
}

#[tokio::test(start_paused = true)]
async fn scan_errors_are_retried_inside_the_loop() {
    let dir = TempDir::new().unwrap();
    let settings = settings(dir.path(), &[0.085]);
    let sim = SimulatedBench::stabilized(25.0);
    sim.scanner.fail_next_scans(3);
    let run = spawn_run(&settings, &sim);

    let summary = run.worker.await.unwrap();

    assert_eq!(summary.sites_captured, 5);
    assert_eq!(summary.iteration_failures, 0);
    // Two polarizations per site plus the three failed attempts.
    assert_eq!(sim.scanner.scan_count(), 13);
}

#[tokio::test(start_paused = true)]
async fn rejected_coupling_waits_for_the_operator() {
    let dir = TempDir::new().unwrap();
    let settings = settings(dir.path(), &[0.085]);
    let sim = SimulatedBench::stabilized(25.0);
    sim.input_tracker.set_profile(CouplingProfile {
        sigma: 12.0,
        ..CouplingProfile::default()
    });
    let run = spawn_run(&settings, &sim);
    let mut rx = run.notifier.subscribe();

    loop {
        if let ScanEvent::Status { text } = rx.recv().await.unwrap() {
            if text == "Loop paused." {
                break;
            }
        }
    }
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(run.control.is_paused());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    // Operator realigns the fiber.
    sim.input_tracker.set_profile(CouplingProfile::default());
    run.control.resume();
    let summary = run.worker.await.unwrap();

    assert_eq!(summary.sites_captured, 5);
    assert!(!summary.stopped);
}

#[tokio::test(start_paused = true)]
async fn stop_interrupts_the_temperature_wait() {
    let dir = TempDir::new().unwrap();
    let settings = settings(dir.path(), &CURRENTS);
    let mut sim = SimulatedBench::new(&settings);
    sim.temperature = Arc::new(MockTemperatureController::stuck_at(20.0));
    let run = spawn_run(&settings, &sim);

    tokio::time::sleep(Duration::from_secs(35)).await;
    assert!(!run.worker.is_finished());
    let readings = sim.temperature.reading_count();
    run.control.request_stop();

    let summary = run.worker.await.unwrap();
    assert!(summary.stopped);
    assert!(summary.currents_applied.is_empty());
    assert_eq!(sim.source.setpoints(), vec![0.0]);
    assert_eq!(sim.temperature.reading_count(), readings, "no reading after stop");
}

#[tokio::test(start_paused = true)]
async fn rejected_tracking_at_a_site_waits_for_the_operator() {
    let dir = TempDir::new().unwrap();
    let settings = settings(dir.path(), &[0.085]);
    let sim = SimulatedBench::stabilized(25.0);
    sim.output_tracker.set_lock_target(5.0, 9.0);
    let run = spawn_run(&settings, &sim);
    let events = collect(&run.notifier);
    let mut rx = run.notifier.subscribe();

    loop {
        if let ScanEvent::Status { text } = rx.recv().await.unwrap() {
            if text == "Loop paused." {
                break;
            }
        }
    }
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(run.control.is_paused());
    assert_eq!(
        std::fs::read_dir(dir.path()).unwrap().count(),
        1,
        "only site 0 captured before the hold"
    );

    sim.output_tracker.set_lock_target(5.0, 5.0);
    run.control.resume();
    let summary = run.worker.await.unwrap();
    let events = events.await.unwrap();

    assert_eq!(saved_sites(&events), vec![0, 1, 2, 3, 4]);
    let holds = statuses(&events)
        .iter()
        .filter(|t| t.as_str() == "Loop paused.")
        .count();
    assert_eq!(holds, 1);
    assert!(!summary.stopped);
}

#[tokio::test(start_paused = true)]
async fn pause_during_the_settle_holds_before_the_power_sample() {
    let dir = TempDir::new().unwrap();
    let settings = settings(dir.path(), &[0.085]);
    let sim = SimulatedBench::stabilized(25.0);
    let run = spawn_run(&settings, &sim);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(sim.source.setpoints(), vec![0.085]);
    run.control.pause();
    tokio::time::sleep(Duration::from_secs(3600)).await;

    assert_eq!(run.control.state(), RunState::Paused);
    assert_eq!(sim.source.power_reads(), 0);

    run.control.resume();
    let summary = run.worker.await.unwrap();

    assert_eq!(sim.source.power_reads(), 1);
    assert_eq!(summary.sites_captured, 5);
}
