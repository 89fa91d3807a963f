//! Per-run scan state.
//!
//! [`ScanState`] is owned by the scheduler's worker and never shared. The
//! outside world only sees copies: [`SiteSnapshot`] for the recorder and
//! [`MotorOffsets`] for the display. Pause and stop flags live in
//! [`super::control::ExecutionControl`], which is the only state the control
//! surface may touch.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::coupling::CouplingReport;

/// Phase of the scan state machine.
///
/// ```text
/// Idle ─▶ WaitingTemperature ─▶ SettingCurrent ─▶ WaitingTemperature
///                                     ▲                   │
///                                     │                   ▼
///                               TraversingGrid ◀── ConfirmingCoupling
///                                     │
///                   (sequence done or stop) ─▶ Unwinding ─▶ Finished
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanPhase {
    /// Not started
    Idle,
    /// Applying a drive current and waiting for it to settle
    SettingCurrent,
    /// Polling the chip temperature
    WaitingTemperature,
    /// Probing fiber-to-chip coupling
    ConfirmingCoupling,
    /// Stepping through chip/output sites
    TraversingGrid,
    /// Restoring baseline current
    Unwinding,
    /// Terminal
    Finished,
}

impl std::fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScanPhase::Idle => "idle",
            ScanPhase::SettingCurrent => "setting-current",
            ScanPhase::WaitingTemperature => "waiting-temperature",
            ScanPhase::ConfirmingCoupling => "confirming-coupling",
            ScanPhase::TraversingGrid => "traversing-grid",
            ScanPhase::Unwinding => "unwinding",
            ScanPhase::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Stage positions after every completed move. Append-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MotorPositionLog {
    input: Vec<f64>,
    output: Vec<f64>,
}

impl MotorPositionLog {
    /// Record the input stage position.
    pub fn push_input(&mut self, position: f64) {
        self.input.push(position);
    }

    /// Record the output stage position.
    pub fn push_output(&mut self, position: f64) {
        self.output.push(position);
    }

    /// Input stage history.
    #[must_use]
    pub fn input(&self) -> &[f64] {
        &self.input
    }

    /// Output stage history.
    #[must_use]
    pub fn output(&self) -> &[f64] {
        &self.output
    }
}

/// Horizontal/vertical offset of one tracking channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelOffset {
    /// Horizontal offset (physical units)
    pub horizontal: f64,
    /// Vertical offset (physical units)
    pub vertical: f64,
}

/// Tracking offsets per channel, already scaled ×2 to physical units.
/// Append-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingOffsetLog {
    input: Vec<ChannelOffset>,
    output: Vec<ChannelOffset>,
    focus: Vec<ChannelOffset>,
}

impl TrackingOffsetLog {
    /// Append one convergence result for all three channels.
    pub fn append(&mut self, input: ChannelOffset, output: ChannelOffset, focus: ChannelOffset) {
        self.input.push(input);
        self.output.push(output);
        self.focus.push(focus);
    }

    /// Input channel history.
    #[must_use]
    pub fn input(&self) -> &[ChannelOffset] {
        &self.input
    }

    /// Output channel history.
    #[must_use]
    pub fn output(&self) -> &[ChannelOffset] {
        &self.output
    }

    /// Focus channel history.
    #[must_use]
    pub fn focus(&self) -> &[ChannelOffset] {
        &self.focus
    }

    /// Number of convergence results recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.input.len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }
}

/// The eight sequences of a `motorOffsetCompleted` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorOffsets {
    /// Input stage positions
    pub input_positions: Vec<f64>,
    /// Output stage positions
    pub output_positions: Vec<f64>,
    /// Input tracker horizontal offsets
    pub input_horizontal: Vec<f64>,
    /// Input tracker vertical offsets
    pub input_vertical: Vec<f64>,
    /// Output tracker horizontal offsets
    pub output_horizontal: Vec<f64>,
    /// Output tracker vertical offsets
    pub output_vertical: Vec<f64>,
    /// Focus tracker horizontal offsets
    pub focus_horizontal: Vec<f64>,
    /// Focus tracker vertical offsets
    pub focus_vertical: Vec<f64>,
}

/// Immutable per-site copy handed to the recorder.
#[derive(Debug, Clone)]
pub struct SiteSnapshot {
    /// Run identifier
    pub run_id: Uuid,
    /// 0 for the pre-grid capture, then `chip * outputs + output + 1`
    pub site: usize,
    /// Applied drive current (A)
    pub current_a: f64,
    /// Power measured after the current settled (dBm)
    pub measured_power_dbm: f64,
    /// Most recent coupling probe
    pub coupling: Option<CouplingReport>,
}

/// Mutable state of one run. Owned by the worker.
#[derive(Debug, Clone)]
pub struct ScanState {
    /// Run identifier
    pub run_id: Uuid,
    /// Current state-machine phase
    pub phase: ScanPhase,
    /// Index into the current sequence
    pub current_index: Option<usize>,
    /// Applied drive current (A)
    pub current_a: f64,
    /// Power measured after the current settled (dBm)
    pub measured_power_dbm: f64,
    /// Chip index inside the grid
    pub chip: usize,
    /// Output index inside the chip
    pub output: usize,
    /// Site index of the next capture
    pub site: usize,
    /// Stage position history
    pub positions: MotorPositionLog,
    /// Tracking offset history
    pub offsets: TrackingOffsetLog,
    /// Latest coupling probe, replaced on every call
    pub latest_coupling: Option<CouplingReport>,
}

impl ScanState {
    /// Fresh state for a new run.
    #[must_use]
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            phase: ScanPhase::Idle,
            current_index: None,
            current_a: 0.0,
            measured_power_dbm: f64::NAN,
            chip: 0,
            output: 0,
            site: 0,
            positions: MotorPositionLog::default(),
            offsets: TrackingOffsetLog::default(),
            latest_coupling: None,
        }
    }

    /// Copy of what the recorder needs for the current site.
    #[must_use]
    pub fn snapshot(&self) -> SiteSnapshot {
        SiteSnapshot {
            run_id: self.run_id,
            site: self.site,
            current_a: self.current_a,
            measured_power_dbm: self.measured_power_dbm,
            coupling: self.latest_coupling.clone(),
        }
    }

    /// Copy of the position and offset histories for display.
    #[must_use]
    pub fn motor_offsets(&self) -> MotorOffsets {
        let split = |log: &[ChannelOffset]| -> (Vec<f64>, Vec<f64>) {
            log.iter().map(|o| (o.horizontal, o.vertical)).unzip()
        };
        let (input_horizontal, input_vertical) = split(self.offsets.input());
        let (output_horizontal, output_vertical) = split(self.offsets.output());
        let (focus_horizontal, focus_vertical) = split(self.offsets.focus());
        MotorOffsets {
            input_positions: self.positions.input().to_vec(),
            output_positions: self.positions.output().to_vec(),
            input_horizontal,
            input_vertical,
            output_horizontal,
            output_vertical,
            focus_horizontal,
            focus_vertical,
        }
    }
}
