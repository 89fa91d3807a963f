//! Outer scan loop: current sweep × temperature wait × chip/output grid.
//!
//! [`ScanScheduler::run`] owns all mutable run state and executes on one
//! worker task. Each current setpoint is one iteration:
//!
//! ```text
//! set current ─▶ settle ─▶ measure power ─▶ wait temperature ─▶ coupling
//!      ─▶ TE/TM capture (site 0) ─▶ grid sites 1..=chips*outputs
//!      ─▶ return output stage ─▶ track
//! ```
//!
//! Errors inside an iteration are reported and the loop moves on to the next
//! current. An operator stop ends the loop at the next checkpoint; the worker
//! then unwinds by restoring the source to 0 A.

use chrono::Local;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::control::ExecutionControl;
use super::coupling::CouplingValidator;
use super::events::{Notifier, ScanEvent};
use super::motion::MotorChoreographer;
use super::spectrum::PolarizationScanner;
use super::state::{ScanPhase, ScanState};
use super::tracking::TrackingStage;
use crate::config::{GridConfig, Settings};
use crate::data::{DataRecorder, MeasurementRecord};
use crate::error::{AppResult, DaqError};
use crate::hardware::Bench;

/// Output-stage step before visiting `(chip, output)`.
///
/// `None` means the site is reached without moving: output 3 of the first
/// chip sits at a fixed hardware offset. The first output of every later chip
/// is reached with the chip pitch; everything else, including the very first
/// site, with the output waveguide pitch.
#[must_use]
pub fn grid_step(chip: usize, output: usize, grid: &GridConfig) -> Option<f64> {
    match (chip, output) {
        (0, 3) => None,
        (c, 0) if c > 0 => Some(grid.chip_pitch),
        _ => Some(grid.output_waveguide_pitch),
    }
}

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Run identifier
    pub run_id: Uuid,
    /// Drive currents applied, in order (the final 0 A reset excluded)
    pub currents_applied: Vec<f64>,
    /// Record files written, in order
    pub records: Vec<PathBuf>,
    /// Sites captured over all iterations
    pub sites_captured: usize,
    /// Iterations abandoned because of an error
    pub iteration_failures: usize,
    /// Ended by an operator stop
    pub stopped: bool,
}

/// Drives one run from the first temperature wait to the final unwind.
pub struct ScanScheduler {
    settings: Settings,
    bench: Bench,
    control: ExecutionControl,
    notifier: Notifier,
    recorder: DataRecorder,
    motion: MotorChoreographer,
    tracking: TrackingStage,
    coupling: CouplingValidator,
    spectra: PolarizationScanner,
    state: ScanState,
    summary: RunSummary,
}

impl ScanScheduler {
    /// Wire the stages of one run.
    ///
    /// Fails if the routing table has no entry for the configured band.
    pub fn new(
        settings: &Settings,
        bench: Bench,
        control: ExecutionControl,
        notifier: Notifier,
        recorder: DataRecorder,
    ) -> AppResult<Self> {
        let routing = *settings.active_routing().ok_or_else(|| {
            DaqError::Configuration(format!(
                "No routing configured for band {}",
                settings.sweep.band
            ))
        })?;
        let run_id = Uuid::new_v4();
        Ok(Self {
            motion: MotorChoreographer::new(
                &bench,
                settings.grid.input_waveguide_pitch,
                settings.timing.motion_poll,
                notifier.clone(),
            ),
            tracking: TrackingStage::new(&bench, notifier.clone()),
            coupling: CouplingValidator::new(
                bench.input_tracker.clone(),
                &settings.scan,
                &settings.timing,
                notifier.clone(),
            ),
            spectra: PolarizationScanner::new(&bench, routing, &settings.sweep, notifier.clone()),
            settings: settings.clone(),
            bench,
            control,
            notifier,
            recorder,
            state: ScanState::new(run_id),
            summary: RunSummary {
                run_id,
                ..RunSummary::default()
            },
        })
    }

    /// Run identifier.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.state.run_id
    }

    /// Execute the run to completion or stop.
    ///
    /// Never fails: errors are reported as status text. The source current is
    /// set to 0 and [`ScanEvent::Finished`] is emitted before this returns.
    pub async fn run(mut self) -> RunSummary {
        self.control.mark_running();
        info!(run_id = %self.state.run_id, "run started");

        match self.execute().await {
            Ok(()) => info!(run_id = %self.state.run_id, "current sequence exhausted"),
            Err(e) if e.is_stop() => {
                info!(run_id = %self.state.run_id, "run stopped by operator");
                self.summary.stopped = true;
            }
            Err(e) => {
                error!(error = %e, "run aborted");
                self.notifier.status(format!("An error occurred in the loop: {e}"));
            }
        }

        self.unwind().await;
        self.summary
    }

    async fn execute(&mut self) -> AppResult<()> {
        let setpoint = self.settings.scan.temperature_setpoint_c;
        self.set_phase(ScanPhase::WaitingTemperature);
        self.bench.temperature.set_temp(setpoint).await?;
        self.wait_for_temperature().await?;

        for (index, current) in self.settings.scan.currents().into_iter().enumerate() {
            self.control.ensure_running()?;
            let span = info_span!("iteration", index, current_a = current);
            match self.run_iteration(index, current).instrument(span).await {
                Ok(()) => {}
                Err(e) if e.is_stop() => return Err(e),
                Err(e) => {
                    self.summary.iteration_failures += 1;
                    error!(error = %e, current_a = current, "iteration failed");
                    self.notifier
                        .status(format!("An error occurred in the loop: {e}"));
                }
            }
        }
        Ok(())
    }

    async fn run_iteration(&mut self, index: usize, current: f64) -> AppResult<()> {
        self.state.current_index = Some(index);
        self.state.current_a = current;
        self.state.measured_power_dbm = f64::NAN;
        self.state.latest_coupling = None;
        self.state.chip = 0;
        self.state.output = 0;
        self.state.site = 0;

        self.set_phase(ScanPhase::SettingCurrent);
        self.bench.source.set_current(current).await?;
        self.summary.currents_applied.push(current);
        self.notifier.status(format!("Set current: {current:.4}A"));
        sleep(self.settings.timing.current_settle).await;
        self.control.checkpoint().await?;
        self.state.measured_power_dbm = self.bench.source.measure_power().await?;
        debug!(power_dbm = self.state.measured_power_dbm, "power after settle");

        self.set_phase(ScanPhase::WaitingTemperature);
        self.wait_for_temperature().await?;
        self.control.checkpoint().await?;

        self.set_phase(ScanPhase::ConfirmingCoupling);
        if !self.probe_coupling().await? {
            self.operator_hold().await?;
        }
        self.capture_site().await?;

        self.set_phase(ScanPhase::TraversingGrid);
        self.traverse_grid().await
    }

    async fn traverse_grid(&mut self) -> AppResult<()> {
        let start = self.motion.output_position().await?;
        let chips = self.settings.grid.number_of_chips;
        let outputs = self.settings.grid.outputs_per_chip;

        for chip in 0..chips {
            for output in 0..outputs {
                self.control.checkpoint().await?;
                self.state.chip = chip;
                self.state.output = output;
                self.state.site = chip * outputs + output + 1;
                let site_span = info_span!("site", site = self.state.site, chip, output);
                self.visit_site().instrument(site_span).await?;
            }
        }

        let end = self.motion.output_position().await?;
        self.notifier.status("Returning output stage to start position.");
        self.motion
            .move_synchronized(start - end, &mut self.state.positions)
            .await?;
        self.control.checkpoint().await?;

        let outcome = self
            .tracking
            .converge(&self.control, &mut self.state.offsets)
            .await?;
        self.notifier
            .emit(ScanEvent::MotorOffsetCompleted(self.state.motor_offsets()));
        if !outcome.accepted {
            self.operator_hold().await?;
        }
        Ok(())
    }

    async fn visit_site(&mut self) -> AppResult<()> {
        match grid_step(self.state.chip, self.state.output, &self.settings.grid) {
            Some(distance) => {
                self.motion
                    .move_synchronized(distance, &mut self.state.positions)
                    .await?;
                self.control.checkpoint().await?;
            }
            None => debug!("site reached without a move"),
        }

        let outcome = self
            .tracking
            .converge(&self.control, &mut self.state.offsets)
            .await?;
        self.notifier
            .emit(ScanEvent::MotorOffsetCompleted(self.state.motor_offsets()));
        if !outcome.accepted {
            self.operator_hold().await?;
        }

        self.set_phase(ScanPhase::ConfirmingCoupling);
        if !self.probe_coupling().await? {
            self.operator_hold().await?;
            if !self.probe_coupling().await? {
                warn!("coupling still rejected after operator adjustment");
                self.notifier.status("Coupling not confirmed, continuing.");
            }
        }
        self.set_phase(ScanPhase::TraversingGrid);

        self.capture_site().await
    }

    /// One validation call; keeps the report for the next record.
    async fn probe_coupling(&mut self) -> AppResult<bool> {
        let report = self.coupling.validate(&self.control).await?;
        let accepted = report.accepted;
        self.state.latest_coupling = Some(report);
        Ok(accepted)
    }

    async fn operator_hold(&mut self) -> AppResult<()> {
        self.notifier.status("Loop paused.");
        self.control.hold().await?;
        self.notifier.status("Loop resumed.");
        Ok(())
    }

    async fn capture_site(&mut self) -> AppResult<()> {
        self.control.ensure_running()?;
        let spectra = self.spectra.capture_both(&self.control).await?;
        let snapshot = self.state.snapshot();
        let record =
            MeasurementRecord::from_snapshot(&snapshot, &self.settings.sweep, &spectra, Local::now());
        let path = self.recorder.persist(&record).await?;
        self.notifier.emit(ScanEvent::RecordSaved {
            path: path.clone(),
            site: snapshot.site,
            current_a: snapshot.current_a,
        });
        self.summary.records.push(path);
        self.summary.sites_captured += 1;
        Ok(())
    }

    /// Poll until the chip is within tolerance. The poll wait ends early on
    /// a stop request.
    async fn wait_for_temperature(&mut self) -> AppResult<()> {
        let setpoint = self.settings.scan.temperature_setpoint_c;
        let tolerance = self.settings.scan.temperature_tolerance_c;
        let poll: Duration = self.settings.timing.temperature_poll;

        let mut temperature = self.bench.temperature.measure_temp().await?;
        self.notifier.status(format!(
            "Setting temperature to {setpoint}°C. Current temperature: {temperature:.2}°C"
        ));
        while (temperature - setpoint).abs() > tolerance {
            self.control.checkpoint().await?;
            tokio::select! {
                _ = sleep(poll) => {}
                _ = self.control.stopped() => return Err(DaqError::OperatorStop),
            }
            temperature = self.bench.temperature.measure_temp().await?;
            self.notifier
                .status(format!("Current temperature: {temperature:.2}°C"));
        }
        self.notifier.status("Temperature stabilized.");
        Ok(())
    }

    async fn unwind(&mut self) {
        self.set_phase(ScanPhase::Unwinding);
        if let Err(e) = self.bench.source.set_current(0.0).await {
            error!(error = %e, "failed to restore baseline current");
            self.notifier
                .status(format!("An error occurred in the loop: {e}"));
        }
        self.notifier.status("Loop finished.");
        self.set_phase(ScanPhase::Finished);
        self.control.mark_finished();
        self.notifier.emit(ScanEvent::Finished);
    }

    fn set_phase(&mut self, phase: ScanPhase) {
        if self.state.phase != phase {
            debug!(from = %self.state.phase, to = %phase, "phase");
            self.state.phase = phase;
            self.notifier.emit(ScanEvent::PhaseChanged { phase });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_step_rules() {
        let grid = GridConfig {
            output_waveguide_pitch: 0.127,
            chip_pitch: 2.0,
            number_of_chips: 3,
            outputs_per_chip: 5,
            ..GridConfig::default()
        };
        assert_eq!(grid_step(0, 0, &grid), Some(0.127));
        assert_eq!(grid_step(0, 1, &grid), Some(0.127));
        assert_eq!(grid_step(0, 3, &grid), None);
        assert_eq!(grid_step(0, 4, &grid), Some(0.127));
        assert_eq!(grid_step(1, 0, &grid), Some(2.0));
        assert_eq!(grid_step(1, 3, &grid), Some(0.127));
        assert_eq!(grid_step(2, 0, &grid), Some(2.0));
    }

    #[test]
    fn missing_routing_is_a_configuration_error() {
        let mut settings = Settings::default();
        settings.routing.clear();
        let sim = crate::hardware::mock::SimulatedBench::stabilized(25.0);
        let (notifier, _rx) = Notifier::channel();
        let result = ScanScheduler::new(
            &settings,
            sim.bench(),
            ExecutionControl::new(),
            notifier,
            DataRecorder::new("unused"),
        );
        assert!(matches!(result, Err(DaqError::Configuration(_))));
    }
}
