//! Track-and-latch convergence of the three piezo tracking channels.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use super::control::ExecutionControl;
use super::events::Notifier;
use super::state::{ChannelOffset, TrackingOffsetLog};
use crate::error::AppResult;
use crate::hardware::{Bench, CircularPosition, TrackingChannel};

/// Capture diameters and hold times, applied in order after `track`.
pub const CAPTURE_SCHEDULE: [(f64, Duration); 3] = [
    (1.0, Duration::from_millis(3750)),
    (0.75, Duration::from_millis(3750)),
    (0.25, Duration::from_millis(5000)),
];

/// Lower bound of the accepted tracker window (exclusive).
pub const WINDOW_MIN: f64 = 2.0;
/// Upper bound of the accepted tracker window (exclusive).
pub const WINDOW_MAX: f64 = 8.0;
/// Tracker units to physical offset units.
pub const OFFSET_SCALE: f64 = 2.0;

/// Whether a latched position lies strictly inside (2, 8) on both axes.
#[must_use]
pub fn within_window(position: &CircularPosition) -> bool {
    let inside = |v: f64| v > WINDOW_MIN && v < WINDOW_MAX;
    inside(position.horizontal) && inside(position.vertical)
}

/// Result of one [`TrackingStage::converge`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingOutcome {
    /// Every channel latched inside the window
    pub accepted: bool,
    /// Scaled offsets for input, output, focus
    pub offsets: [ChannelOffset; 3],
    /// Latched positions for input, output, focus
    pub latched: [CircularPosition; 3],
}

/// Drives the input, output and focus trackers together.
pub struct TrackingStage {
    channels: [Arc<dyn TrackingChannel>; 3],
    notifier: Notifier,
}

impl TrackingStage {
    /// Build from the bench handles.
    #[must_use]
    pub fn new(bench: &Bench, notifier: Notifier) -> Self {
        Self {
            channels: [
                bench.input_tracker.clone(),
                bench.output_tracker.clone(),
                bench.focus_tracker.clone(),
            ],
            notifier,
        }
    }

    async fn positions(&self) -> AppResult<[CircularPosition; 3]> {
        let [input, output, focus] = &self.channels;
        let (i, o, f) =
            tokio::try_join!(input.circ_position(), output.circ_position(), focus.circ_position())?;
        Ok([i, o, f])
    }

    async fn set_diameter(&self, diameter: f64) -> AppResult<()> {
        for channel in &self.channels {
            channel.set_capture_diameter(diameter).await?;
        }
        Ok(())
    }

    /// Track, shrink the capture circle, latch and validate.
    ///
    /// Offsets `(post - pre) * 2` are appended to `log` whether or not the
    /// result is accepted. The hold times are not interruptible; a stop is
    /// only observed between stages.
    ///
    /// After an early stop the channels are left in track mode, unlatched.
    pub async fn converge(
        &self,
        control: &ExecutionControl,
        log: &mut TrackingOffsetLog,
    ) -> AppResult<TrackingOutcome> {
        control.ensure_running()?;
        let before = self.positions().await?;

        self.notifier.status("Tracking...");
        for (step, (diameter, hold)) in CAPTURE_SCHEDULE.iter().enumerate() {
            control.ensure_running()?;
            self.set_diameter(*diameter).await?;
            if step == 0 {
                for channel in &self.channels {
                    channel.track().await?;
                }
            }
            sleep(*hold).await;
        }
        for channel in &self.channels {
            channel.latch().await?;
        }
        self.notifier.status("Latched.");

        let after = self.positions().await?;
        let offsets: [ChannelOffset; 3] = std::array::from_fn(|i| ChannelOffset {
            horizontal: (after[i].horizontal - before[i].horizontal) * OFFSET_SCALE,
            vertical: (after[i].vertical - before[i].vertical) * OFFSET_SCALE,
        });
        log.append(offsets[0], offsets[1], offsets[2]);

        let accepted = after.iter().all(within_window);
        if accepted {
            self.notifier.status("Tracking successful.");
        } else {
            warn!(?after, "tracking latched outside the capture window");
            self.notifier.status("Adjust manually.");
        }
        Ok(TrackingOutcome {
            accepted,
            offsets,
            latched: after,
        })
    }
}
