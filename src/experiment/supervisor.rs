//! Operator-facing control surface.
//!
//! At most one run is active at a time. Starting a second run needs an
//! explicit confirmation; a confirmed start stops the active run and waits
//! for its worker to unwind before the new one is spawned.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use super::control::{ExecutionControl, RunState};
use super::events::{Notifier, ScanEvent};
use super::scheduler::{RunSummary, ScanScheduler};
use crate::config::Settings;
use crate::data::DataRecorder;
use crate::error::{AppResult, DaqError};
use crate::hardware::Bench;

struct ActiveRun {
    run_id: Uuid,
    control: ExecutionControl,
    handle: JoinHandle<RunSummary>,
}

/// Starts runs and forwards pause/resume/stop to the active one.
pub struct RunSupervisor {
    settings: Settings,
    bench: Bench,
    notifier: Notifier,
    active: Option<ActiveRun>,
}

impl RunSupervisor {
    /// Supervisor with its own notification channel.
    #[must_use]
    pub fn new(settings: Settings, bench: Bench) -> Self {
        let (notifier, _) = Notifier::channel();
        Self::with_notifier(settings, bench, notifier)
    }

    /// Supervisor publishing on an existing channel.
    #[must_use]
    pub fn with_notifier(settings: Settings, bench: Bench, notifier: Notifier) -> Self {
        Self {
            settings,
            bench,
            notifier,
            active: None,
        }
    }

    /// Receive notifications of every run started from here.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.notifier.subscribe()
    }

    /// Settings used for the next run.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Replace the settings used for the next run.
    pub fn set_settings(&mut self, settings: Settings) {
        self.settings = settings;
    }

    /// Whether a worker is still executing.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|run| !run.handle.is_finished())
    }

    /// Control handle of the most recent run.
    #[must_use]
    pub fn control(&self) -> Option<ExecutionControl> {
        self.active.as_ref().map(|run| run.control.clone())
    }

    /// Lifecycle state of the most recent run.
    #[must_use]
    pub fn state(&self) -> Option<RunState> {
        self.active.as_ref().map(|run| run.control.state())
    }

    /// Spawn a new run.
    ///
    /// With a run still active this fails with [`DaqError::RunActive`] unless
    /// `confirmed`, in which case the active run is stopped and joined first.
    pub async fn start(&mut self, confirmed: bool) -> AppResult<Uuid> {
        if self.is_active() {
            if !confirmed {
                warn!("start refused: a run is active");
                return Err(DaqError::RunActive);
            }
            if let Some(run) = &self.active {
                info!(run_id = %run.run_id, "stopping active run before restart");
                run.control.request_stop();
            }
            self.join().await?;
        }
        self.active = None;

        self.settings.validate().map_err(DaqError::Configuration)?;
        let control = ExecutionControl::new();
        let scheduler = ScanScheduler::new(
            &self.settings,
            self.bench.clone(),
            control.clone(),
            self.notifier.clone(),
            DataRecorder::new(&self.settings.storage.output_dir),
        )?;
        let run_id = scheduler.run_id();
        let handle = tokio::spawn(scheduler.run());
        info!(%run_id, "run spawned");
        self.active = Some(ActiveRun {
            run_id,
            control,
            handle,
        });
        Ok(run_id)
    }

    fn active_control(&self, action: &str) -> AppResult<&ExecutionControl> {
        match &self.active {
            Some(run) if !run.handle.is_finished() => Ok(&run.control),
            _ => {
                warn!(action, "no active run");
                self.notifier.status(format!("No active run to {action}."));
                Err(DaqError::NoActiveRun)
            }
        }
    }

    /// Close the pause gate of the active run.
    pub fn pause(&self) -> AppResult<()> {
        self.active_control("pause")?.pause();
        self.notifier.status("Pause requested.");
        Ok(())
    }

    /// Reopen the pause gate of the active run.
    pub fn resume(&self) -> AppResult<()> {
        self.active_control("resume")?.resume();
        self.notifier.status("Resume requested.");
        Ok(())
    }

    /// Request a stop of the active run. Does not wait for it.
    pub fn stop(&self) -> AppResult<()> {
        self.active_control("stop")?.request_stop();
        self.notifier.status("Stop requested.");
        Ok(())
    }

    /// Wait for the most recent run to finish and take its summary.
    pub async fn join(&mut self) -> AppResult<RunSummary> {
        let run = self.active.take().ok_or(DaqError::NoActiveRun)?;
        run.handle
            .await
            .map_err(|e| DaqError::Device(anyhow::anyhow!("run worker failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedBench;

    #[tokio::test]
    async fn controls_without_a_run_are_refused() {
        let sim = SimulatedBench::stabilized(25.0);
        let supervisor = RunSupervisor::new(Settings::default(), sim.bench());
        assert!(matches!(supervisor.pause(), Err(DaqError::NoActiveRun)));
        assert!(matches!(supervisor.resume(), Err(DaqError::NoActiveRun)));
        assert!(matches!(supervisor.stop(), Err(DaqError::NoActiveRun)));
        assert!(!supervisor.is_active());
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected_before_spawning() {
        let sim = SimulatedBench::stabilized(25.0);
        let mut settings = Settings::default();
        settings.scan.gaus_min = 10.0;
        let mut supervisor = RunSupervisor::new(settings, sim.bench());
        let err = supervisor.start(false).await.unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(supervisor.control().is_none());
    }
}
