//! Measurement control loop.
//!
//! The scan worker and everything it drives:
//!
//! - [`control`]: pause gate and stop flag shared with the control surface
//! - [`events`]: one-way notifications from the worker
//! - [`state`]: per-run state owned by the worker
//! - [`motion`]: synchronized and single-axis stage moves
//! - [`tracking`]: track-and-latch convergence of the tracking channels
//! - [`coupling`]: coupling probe, Gaussian fit and acceptance
//! - [`spectrum`]: TE/TM insertion-loss sweeps
//! - [`scheduler`]: the outer current/temperature/grid loop
//! - [`supervisor`]: single-active-run control surface

pub mod control;
pub mod coupling;
pub mod events;
pub mod motion;
pub mod scheduler;
pub mod spectrum;
pub mod state;
pub mod supervisor;
pub mod tracking;

pub use control::{ExecutionControl, RunState};
pub use coupling::{CouplingReport, CouplingValidator, FitParameters};
pub use events::{CouplingPayload, Notifier, ScanEvent};
pub use motion::{ManualOffsets, MotorChoreographer};
pub use scheduler::{grid_step, RunSummary, ScanScheduler};
pub use spectrum::{PolarizationScanner, Spectrum, SpectrumPair};
pub use state::{MotorOffsets, ScanPhase, ScanState, SiteSnapshot};
pub use supervisor::RunSupervisor;
pub use tracking::{TrackingOutcome, TrackingStage};
