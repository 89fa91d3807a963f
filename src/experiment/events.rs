//! One-way notifications from the worker to the control surface.
//!
//! The worker publishes [`ScanEvent`]s on a `tokio::sync::broadcast` channel.
//! Payloads are owned copies; a consumer that falls behind sees
//! `RecvError::Lagged` and the worker never blocks.

use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::info;

use super::state::{MotorOffsets, ScanPhase};
use crate::config::{Polarization, ScanType};

/// Broadcast capacity of the notification channel.
pub const EVENT_CAPACITY: usize = 1024;

/// Coupling probe result for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CouplingPayload {
    /// Probe geometry
    pub scan_type: ScanType,
    /// Sampled linear power (2-D: row-major, x outer)
    pub raw: Vec<f64>,
    /// Fitted curve (1-D: 0.01 grid over [0, 10.5); 2-D: at the sample points).
    /// Empty when the fit failed.
    pub fitted: Vec<f64>,
    /// Sample x coordinates (2-D only)
    pub x_positions: Vec<f64>,
    /// Sample y coordinates (2-D only)
    pub y_positions: Vec<f64>,
    /// Whether the acceptance test passed
    pub accepted: bool,
}

/// Notification emitted by the scan worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    /// Human-readable progress text
    Status {
        /// Message
        text: String,
    },
    /// State-machine transition
    PhaseChanged {
        /// New phase
        phase: ScanPhase,
    },
    /// One polarization sweep finished
    MeasurementCompleted {
        /// Polarization of the sweep
        polarization: Polarization,
        /// Wavelength axis (nm)
        wavelengths_nm: Vec<f64>,
        /// Insertion loss (dB)
        loss_db: Vec<f64>,
    },
    /// A coupling probe finished
    CouplingCompleted(CouplingPayload),
    /// Stage positions and tracking offsets after a site converged
    MotorOffsetCompleted(MotorOffsets),
    /// A record file was written
    RecordSaved {
        /// File path
        path: PathBuf,
        /// Site index
        site: usize,
        /// Applied current (A)
        current_a: f64,
    },
    /// The worker is done; no further events follow
    Finished,
}

/// Sending half used by every component of the worker.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<ScanEvent>,
}

impl Notifier {
    /// Wrap an existing sender.
    #[must_use]
    pub fn new(tx: broadcast::Sender<ScanEvent>) -> Self {
        Self { tx }
    }

    /// Create a channel with [`EVENT_CAPACITY`] slots.
    #[must_use]
    pub fn channel() -> (Self, broadcast::Receiver<ScanEvent>) {
        let (tx, rx) = broadcast::channel(EVENT_CAPACITY);
        (Self { tx }, rx)
    }

    /// New receiver on the same channel.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ScanEvent) {
        let _ = self.tx.send(event);
    }

    /// Publish status text and mirror it to the log.
    pub fn status(&self, text: impl Into<String>) {
        let text = text.into();
        info!(status = %text);
        self.emit(ScanEvent::Status { text });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn status_is_mirrored_to_the_log() {
        let (notifier, mut rx) = Notifier::channel();
        notifier.status("Temperature stabilized.");

        assert_eq!(
            rx.try_recv().unwrap(),
            ScanEvent::Status {
                text: "Temperature stabilized.".to_string()
            }
        );
        assert!(logs_contain("Temperature stabilized."));
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let (notifier, rx) = Notifier::channel();
        drop(rx);
        notifier.emit(ScanEvent::Finished);
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let json = serde_json::to_value(ScanEvent::PhaseChanged {
            phase: ScanPhase::Unwinding,
        })
        .unwrap();
        assert_eq!(json["event"], "phase_changed");
        assert_eq!(json["phase"], "Unwinding");
    }
}
