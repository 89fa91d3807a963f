//! Hardware Abstraction
//!
//! Capability traits for the characterization bench plus simulated
//! implementations.
//!
//! - [`capabilities`]: one async trait per device category
//! - [`mock`]: in-process simulated devices and [`mock::SimulatedBench`]
//!
//! Drivers for the physical instruments implement the same traits and are
//! assembled into a [`Bench`] by the caller.

pub mod capabilities;
pub mod mock;

use std::sync::Arc;

pub use capabilities::{
    CircularPosition, CurrentSource, OpticalRouter, OpticalScanner, PositionerAxis,
    ScanOutcome, ScanParameters, StageConnector, TemperatureController, TrackingChannel,
};

/// Every device handle a run needs.
///
/// Cloning is cheap; all handles are shared.
#[derive(Clone)]
pub struct Bench {
    /// Drive current source / power monitor
    pub source: Arc<dyn CurrentSource>,
    /// Swept-laser insertion-loss scanner
    pub scanner: Arc<dyn OpticalScanner>,
    /// Router in front of the detector
    pub lower_router: Arc<dyn OpticalRouter>,
    /// Router behind the laser
    pub upper_router: Arc<dyn OpticalRouter>,
    /// Chip temperature controller
    pub temperature: Arc<dyn TemperatureController>,
    /// Input fiber stage
    pub input_stage: Arc<dyn PositionerAxis>,
    /// Output fiber stage
    pub output_stage: Arc<dyn PositionerAxis>,
    /// Focus axis (manual correction only)
    pub focus_stage: Arc<dyn PositionerAxis>,
    /// Chip carrier axis (manual correction only)
    pub chip_stage: Arc<dyn PositionerAxis>,
    /// Chip height axis, opened per move
    pub height: Arc<dyn StageConnector>,
    /// Input fiber tracker
    pub input_tracker: Arc<dyn TrackingChannel>,
    /// Output fiber tracker
    pub output_tracker: Arc<dyn TrackingChannel>,
    /// Focus tracker
    pub focus_tracker: Arc<dyn TrackingChannel>,
}

impl std::fmt::Debug for Bench {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bench").finish_non_exhaustive()
    }
}
