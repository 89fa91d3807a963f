//! Bench Capabilities
//!
//! Fine-grained capability traits for every device the scan loop touches.
//! The loop never sees a concrete driver; it holds `Arc<dyn Trait>` handles
//! collected in [`crate::hardware::Bench`].
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE device category
//!
//! Raw command encoding (SCPI strings, APT messages, serial framing) lives in
//! the driver behind the trait and is out of scope here.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Capability: Drive Current Source
///
/// Source-measure unit that biases the device under test and reports the
/// optical power on its monitor channel.
#[async_trait]
pub trait CurrentSource: Send + Sync {
    /// Set the output current in amperes.
    async fn set_current(&self, amps: f64) -> Result<()>;

    /// Measure the monitored optical power in dBm.
    async fn measure_power(&self) -> Result<f64>;
}

/// Sweep parameters passed to [`OpticalScanner::set_scan_parameters`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanParameters {
    /// Sweep start (nm)
    pub start_wavelength_nm: f64,
    /// Sweep stop (nm)
    pub stop_wavelength_nm: f64,
    /// Sampling resolution (pm)
    pub sampling_pm: f64,
    /// Sweep speed (nm/s)
    pub speed_nm_per_s: f64,
    /// Laser output power (dBm)
    pub laser_power_dbm: f64,
}

/// Outcome of [`OpticalScanner::perform_scan`]. Code 0 means success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Instrument error code
    pub code: i32,
    /// Instrument error name
    pub name: String,
}

impl ScanOutcome {
    /// Successful scan.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            code: 0,
            name: "NO_ERROR".to_string(),
        }
    }

    /// Whether the scan succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Capability: Swept-Laser Insertion-Loss Scanner
///
/// # Contract
/// - `perform_scan` reports instrument errors through [`ScanOutcome`]; an
///   `Err` is reserved for transport failures
/// - `create_wavelength_array` and `retrieve_trace` describe the most recent
///   successful scan and have equal length
#[async_trait]
pub trait OpticalScanner: Send + Sync {
    /// Drop any queued traces.
    async fn clear_trace_queue(&self) -> Result<()>;

    /// Configure the next sweep.
    async fn set_scan_parameters(&self, params: &ScanParameters) -> Result<()>;

    /// Run one sweep.
    async fn perform_scan(&self) -> Result<ScanOutcome>;

    /// Wavelength axis (nm) of the last sweep.
    async fn create_wavelength_array(&self) -> Result<Vec<f64>>;

    /// Insertion loss (dB) of the last sweep.
    async fn retrieve_trace(&self) -> Result<Vec<f64>>;
}

/// Capability: Optical Switch
#[async_trait]
pub trait OpticalRouter: Send + Sync {
    /// Apply a route specification such as `A,5`.
    async fn set_routing(&self, route: &str) -> Result<()>;
}

/// Capability: Chip Temperature Controller
#[async_trait]
pub trait TemperatureController: Send + Sync {
    /// Set the target temperature in °C.
    async fn set_temp(&self, celsius: f64) -> Result<()>;

    /// Measure the current temperature in °C.
    async fn measure_temp(&self) -> Result<f64>;
}

/// Capability: Linear Positioner Axis
///
/// # Contract
/// - `move_relative` initiates motion and may return before completion
/// - callers poll `is_moving` until it reports `false`
/// - `position` is exact once the axis is idle
#[async_trait]
pub trait PositionerAxis: Send + Sync {
    /// Start a relative move.
    async fn move_relative(&self, distance: f64) -> Result<()>;

    /// Whether the axis is still in motion.
    async fn is_moving(&self) -> Result<bool>;

    /// Current position in stage units.
    async fn position(&self) -> Result<f64>;
}

/// Capability: Fresh Stage Connection
///
/// Opens a new handle on every call. Used for the auxiliary chip height axis,
/// whose controller is not kept open between manual corrections.
#[async_trait]
pub trait StageConnector: Send + Sync {
    /// Open a new connection to the axis.
    async fn connect(&self) -> Result<Box<dyn PositionerAxis>>;
}

/// Circle position reported by a tracking channel (0-10 tracker units).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircularPosition {
    /// Horizontal position
    pub horizontal: f64,
    /// Vertical position
    pub vertical: f64,
    /// Detector signal as a raw reading
    pub signal: f64,
}

/// Capability: Piezo Alignment Tracker
///
/// A closed-loop channel that dithers a fiber in a circle of configurable
/// diameter and climbs the detector signal (`track`), or holds its position
/// (`latch`).
#[async_trait]
pub trait TrackingChannel: Send + Sync {
    /// Current circle position and signal.
    async fn circ_position(&self) -> Result<CircularPosition>;

    /// Move the circle center (only meaningful while latched).
    async fn move_to(&self, horizontal: f64, vertical: f64) -> Result<()>;

    /// Set the dither circle diameter (tracker units).
    async fn set_capture_diameter(&self, diameter: f64) -> Result<()>;

    /// Enter tracking mode.
    async fn track(&self) -> Result<()>;

    /// Freeze the current position.
    async fn latch(&self) -> Result<()>;
}
