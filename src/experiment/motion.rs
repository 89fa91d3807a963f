//! Relative motion of the fiber stages.
//!
//! The grid traversal only uses [`MotorChoreographer::move_synchronized`]:
//! the input stage always steps one input waveguide pitch while the output
//! stage steps the requested distance. Both moves are issued concurrently and
//! the call returns once both axes report idle.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use super::events::Notifier;
use super::state::MotorPositionLog;
use crate::error::{AppResult, DaqError};
use crate::hardware::{Bench, PositionerAxis, StageConnector};

/// Relative offsets for a manual correction. Zero entries are skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ManualOffsets {
    /// Input stage
    pub input: f64,
    /// Output stage
    pub output: f64,
    /// Focus axis
    pub focus: f64,
    /// Chip carrier axis
    pub chip: f64,
    /// Chip height axis
    pub height: f64,
}

impl ManualOffsets {
    fn is_empty(&self) -> bool {
        [self.input, self.output, self.focus, self.chip, self.height]
            .iter()
            .all(|d| *d == 0.0)
    }
}

/// Moves the input/output stages and keeps their position history.
pub struct MotorChoreographer {
    input: Arc<dyn PositionerAxis>,
    output: Arc<dyn PositionerAxis>,
    focus: Arc<dyn PositionerAxis>,
    chip: Arc<dyn PositionerAxis>,
    height: Arc<dyn StageConnector>,
    input_pitch: f64,
    poll: Duration,
    notifier: Notifier,
}

impl MotorChoreographer {
    /// Build from the bench handles.
    #[must_use]
    pub fn new(bench: &Bench, input_pitch: f64, poll: Duration, notifier: Notifier) -> Self {
        Self {
            input: bench.input_stage.clone(),
            output: bench.output_stage.clone(),
            focus: bench.focus_stage.clone(),
            chip: bench.chip_stage.clone(),
            height: bench.height.clone(),
            input_pitch,
            poll,
            notifier,
        }
    }

    /// Current output stage position.
    pub async fn output_position(&self) -> AppResult<f64> {
        Ok(self.output.position().await?)
    }

    /// Step input by the waveguide pitch and output by `distance` together.
    ///
    /// A zero distance on one axis skips that axis' command; the other axis
    /// is still moved and waited on. Both positions are appended to `log`.
    pub async fn move_synchronized(
        &self,
        distance: f64,
        log: &mut MotorPositionLog,
    ) -> AppResult<()> {
        debug!(input = self.input_pitch, output = distance, "synchronized move");
        tokio::try_join!(
            start_move(self.input.as_ref(), self.input_pitch),
            start_move(self.output.as_ref(), distance),
        )?;
        self.notifier.status("Motors are moving...");

        loop {
            let (input_moving, output_moving) =
                tokio::try_join!(self.input.is_moving(), self.output.is_moving())?;
            if !input_moving && !output_moving {
                break;
            }
            sleep(self.poll).await;
        }
        self.notifier.status("Motors stopped");

        log.push_input(self.input.position().await?);
        log.push_output(self.output.position().await?);
        Ok(())
    }

    /// Move only the input stage.
    pub async fn move_input(&self, distance: f64, log: &mut MotorPositionLog) -> AppResult<()> {
        self.notifier.status("Input motor is moving...");
        move_and_wait(self.input.as_ref(), distance, self.poll).await?;
        self.notifier.status("Input motor stopped.");
        log.push_input(self.input.position().await?);
        Ok(())
    }

    /// Move only the output stage.
    pub async fn move_output(&self, distance: f64, log: &mut MotorPositionLog) -> AppResult<()> {
        self.notifier.status("Output motor is moving...");
        move_and_wait(self.output.as_ref(), distance, self.poll).await?;
        self.notifier.status("Output motor stopped.");
        log.push_output(self.output.position().await?);
        Ok(())
    }

    /// Operator correction outside the grid loop.
    ///
    /// Each non-zero offset moves its axis in turn. The height axis is opened
    /// through a fresh connection for the move.
    pub async fn manual_adjust(&self, offsets: ManualOffsets) -> AppResult<()> {
        if offsets.is_empty() {
            self.notifier.status("No motor selected.");
            return Err(DaqError::NoMotorSelected);
        }
        let axes: [(&str, &dyn PositionerAxis, f64); 4] = [
            ("input", self.input.as_ref(), offsets.input),
            ("output", self.output.as_ref(), offsets.output),
            ("focus", self.focus.as_ref(), offsets.focus),
            ("chip", self.chip.as_ref(), offsets.chip),
        ];
        for (name, axis, distance) in axes {
            if distance != 0.0 {
                debug!(axis = name, distance, "manual move");
                move_and_wait(axis, distance, self.poll).await?;
            }
        }
        if offsets.height != 0.0 {
            let height = self.height.connect().await?;
            move_and_wait(height.as_ref(), offsets.height, self.poll).await?;
        }
        self.notifier.status("Manual adjustment done.");
        Ok(())
    }
}

async fn start_move(axis: &dyn PositionerAxis, distance: f64) -> anyhow::Result<()> {
    if distance == 0.0 {
        return Ok(());
    }
    axis.move_relative(distance).await
}

async fn move_and_wait(axis: &dyn PositionerAxis, distance: f64, poll: Duration) -> AppResult<()> {
    start_move(axis, distance).await?;
    while axis.is_moving().await? {
        sleep(poll).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockPositioner, SimulatedBench};

    fn choreographer(sim: &SimulatedBench) -> MotorChoreographer {
        let (notifier, _rx) = Notifier::channel();
        MotorChoreographer::new(&sim.bench(), 0.127, Duration::from_millis(100), notifier)
    }

    #[tokio::test(start_paused = true)]
    async fn synchronized_move_waits_for_both_axes() {
        let sim = SimulatedBench::stabilized(25.0);
        let motion = choreographer(&sim);
        let mut log = MotorPositionLog::default();

        motion.move_synchronized(0.5, &mut log).await.unwrap();

        assert_eq!(sim.input_stage.moves(), vec![0.127]);
        assert_eq!(sim.output_stage.moves(), vec![0.5]);
        // The output stage is the slower one: 3 busy polls + 1 idle poll.
        assert_eq!(sim.output_stage.status_polls(), 4);
        assert!((log.input()[0] - 10.127).abs() < 1e-12);
        assert!((log.output()[0] - 12.5).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_distance_skips_only_that_axis() {
        let sim = SimulatedBench::stabilized(25.0);
        let motion = choreographer(&sim);
        let mut log = MotorPositionLog::default();

        motion.move_synchronized(0.0, &mut log).await.unwrap();

        assert_eq!(sim.output_stage.move_count(), 0);
        assert_eq!(sim.input_stage.move_count(), 1);
        assert_eq!(log.output(), &[12.0]);
        assert!((log.input()[0] - 10.127).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn single_axis_moves_log_one_axis() {
        let sim = SimulatedBench::stabilized(25.0);
        let motion = choreographer(&sim);
        let mut log = MotorPositionLog::default();

        motion.move_output(-1.0, &mut log).await.unwrap();
        motion.move_input(2.0, &mut log).await.unwrap();

        assert_eq!(log.output(), &[11.0]);
        assert_eq!(log.input(), &[12.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_adjust_moves_non_zero_axes() {
        let sim = SimulatedBench::stabilized(25.0);
        let motion = choreographer(&sim);

        motion
            .manual_adjust(ManualOffsets {
                focus: 0.01,
                height: 5.0,
                ..ManualOffsets::default()
            })
            .await
            .unwrap();

        assert_eq!(sim.focus_stage.moves(), vec![0.01]);
        assert_eq!(sim.input_stage.move_count(), 0);
        assert_eq!(sim.chip_stage.move_count(), 0);
        assert_eq!(sim.height.connection_count(), 1);
        assert_eq!(sim.height.axis().moves(), vec![5.0]);
    }

    #[tokio::test]
    async fn manual_adjust_rejects_all_zero() {
        let sim = SimulatedBench::stabilized(25.0);
        let motion = choreographer(&sim);
        let err = motion
            .manual_adjust(ManualOffsets::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::NoMotorSelected));
        assert_eq!(err.to_string(), "No motor selected");
    }

    #[tokio::test(start_paused = true)]
    async fn height_opens_a_fresh_connection_per_move() {
        let sim = SimulatedBench::stabilized(25.0);
        let motion = choreographer(&sim);
        for _ in 0..3 {
            motion
                .manual_adjust(ManualOffsets {
                    height: 1.0,
                    ..ManualOffsets::default()
                })
                .await
                .unwrap();
        }
        assert_eq!(sim.height.connection_count(), 3);
        let axis: &MockPositioner = sim.height.axis();
        assert_eq!(axis.move_count(), 3);
    }
}
