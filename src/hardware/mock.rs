//! Mock Hardware Implementations
//!
//! Provides simulated bench devices for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not
//! std::thread::sleep), so tests running on a paused clock finish instantly.
//!
//! # Available Mocks
//!
//! - `MockCurrentSource` - records every setpoint, reports a current-dependent power
//! - `MockOpticalScanner` - synthetic insertion-loss sweeps with error injection
//! - `MockOpticalRouter` - records route specifications
//! - `MockTemperatureController` - exponential approach to the setpoint
//! - `MockPositioner` - reports "moving" for a fixed number of polls per move
//! - `MockStageConnector` - hands out fresh positioner handles on one shared axis
//! - `MockTracker` - tracking channel over a Gaussian coupling profile
//! - `SimulatedBench` - all of the above, wired into a [`Bench`]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::f64::consts::LN_10;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::analysis::dbm_to_reading;
use crate::config::Settings;
use crate::hardware::capabilities::{
    CircularPosition, CurrentSource, OpticalRouter, OpticalScanner, PositionerAxis,
    ScanOutcome, ScanParameters, StageConnector, TemperatureController, TrackingChannel,
};
use crate::hardware::Bench;

// =============================================================================
// MockCurrentSource
// =============================================================================

/// Simulated source-measure unit.
///
/// Power rises linearly with current: `-30 dBm + 200 dBm/A * I`.
#[derive(Default)]
pub struct MockCurrentSource {
    setpoints: Mutex<Vec<f64>>,
    failing_reads: AtomicUsize,
    power_reads: AtomicUsize,
}

impl MockCurrentSource {
    /// Create a source at 0 A.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every current applied so far, in order.
    #[must_use]
    pub fn setpoints(&self) -> Vec<f64> {
        self.setpoints.lock().clone()
    }

    /// Most recent setpoint (0 A before the first call).
    #[must_use]
    pub fn current(&self) -> f64 {
        self.setpoints.lock().last().copied().unwrap_or(0.0)
    }

    /// Power samples requested so far, failed ones included.
    #[must_use]
    pub fn power_reads(&self) -> usize {
        self.power_reads.load(Ordering::SeqCst)
    }

    /// Make the next `count` power reads fail.
    pub fn fail_next_power_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl CurrentSource for MockCurrentSource {
    async fn set_current(&self, amps: f64) -> Result<()> {
        debug!(amps, "MockCurrentSource: set current");
        self.setpoints.lock().push(amps);
        Ok(())
    }

    async fn measure_power(&self) -> Result<f64> {
        self.power_reads.fetch_add(1, Ordering::SeqCst);
        let pending = self.failing_reads.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_reads.store(pending - 1, Ordering::SeqCst);
            return Err(anyhow!("power monitor read timed out"));
        }
        Ok(-30.0 + 200.0 * self.current())
    }
}

// =============================================================================
// MockOpticalScanner
// =============================================================================

/// Simulated swept-laser scanner.
///
/// Each sweep sleeps for `(stop - start) / speed` and produces `points`
/// evenly spaced samples. Scan errors can be injected with
/// [`MockOpticalScanner::fail_next_scans`].
pub struct MockOpticalScanner {
    params: Mutex<Option<ScanParameters>>,
    points: usize,
    failures_remaining: AtomicUsize,
    scans: AtomicUsize,
    clears: AtomicUsize,
}

impl MockOpticalScanner {
    /// Scanner producing `points` samples per sweep.
    #[must_use]
    pub fn new(points: usize) -> Self {
        Self {
            params: Mutex::new(None),
            points: points.max(2),
            failures_remaining: AtomicUsize::new(0),
            scans: AtomicUsize::new(0),
            clears: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` sweeps return a non-zero error code.
    pub fn fail_next_scans(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Sweeps attempted so far, failed ones included.
    #[must_use]
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    /// Trace-queue clears so far.
    #[must_use]
    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    fn configured(&self) -> Result<ScanParameters> {
        self.params
            .lock()
            .ok_or_else(|| anyhow!("scan parameters not set"))
    }
}

impl Default for MockOpticalScanner {
    fn default() -> Self {
        Self::new(501)
    }
}

#[async_trait]
impl OpticalScanner for MockOpticalScanner {
    async fn clear_trace_queue(&self) -> Result<()> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_scan_parameters(&self, params: &ScanParameters) -> Result<()> {
        *self.params.lock() = Some(*params);
        Ok(())
    }

    async fn perform_scan(&self) -> Result<ScanOutcome> {
        let params = self.configured()?;
        self.scans.fetch_add(1, Ordering::SeqCst);
        let span = params.stop_wavelength_nm - params.start_wavelength_nm;
        if params.speed_nm_per_s > 0.0 && span > 0.0 {
            sleep(Duration::from_secs_f64(span / params.speed_nm_per_s)).await;
        }

        let pending = self.failures_remaining.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures_remaining.store(pending - 1, Ordering::SeqCst);
            debug!("MockOpticalScanner: injected scan failure");
            return Ok(ScanOutcome {
                code: -3,
                name: "ERR_SWEEP_TIMEOUT".to_string(),
            });
        }
        Ok(ScanOutcome::ok())
    }

    async fn create_wavelength_array(&self) -> Result<Vec<f64>> {
        let params = self.configured()?;
        let step = (params.stop_wavelength_nm - params.start_wavelength_nm) / (self.points - 1) as f64;
        Ok((0..self.points)
            .map(|i| params.start_wavelength_nm + step * i as f64)
            .collect())
    }

    async fn retrieve_trace(&self) -> Result<Vec<f64>> {
        let wavelengths = self.create_wavelength_array().await?;
        let start = wavelengths.first().copied().unwrap_or_default();
        Ok(wavelengths
            .iter()
            .map(|wl| -(3.0 + 0.2 * ((wl - start) / 10.0).sin()))
            .collect())
    }
}

// =============================================================================
// MockOpticalRouter
// =============================================================================

/// Simulated optical switch that remembers every route it was given.
#[derive(Default)]
pub struct MockOpticalRouter {
    routes: Mutex<Vec<String>>,
}

impl MockOpticalRouter {
    /// Create a router with no routes applied.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route specifications in the order applied.
    #[must_use]
    pub fn routes(&self) -> Vec<String> {
        self.routes.lock().clone()
    }
}

#[async_trait]
impl OpticalRouter for MockOpticalRouter {
    async fn set_routing(&self, route: &str) -> Result<()> {
        self.routes.lock().push(route.to_string());
        Ok(())
    }
}

// =============================================================================
// MockTemperatureController
// =============================================================================

struct ThermalState {
    temperature: f64,
    setpoint: Option<f64>,
    approach: f64,
    setpoints: Vec<f64>,
    readings: usize,
}

/// Simulated thermo-electric controller.
///
/// Every reading closes `approach` of the remaining gap to the setpoint.
pub struct MockTemperatureController {
    state: Mutex<ThermalState>,
}

impl MockTemperatureController {
    /// Controller starting at `initial` °C that halves the error per reading.
    #[must_use]
    pub fn new(initial: f64) -> Self {
        Self::with_approach(initial, 0.5)
    }

    /// Controller with a custom approach fraction in (0, 1].
    #[must_use]
    pub fn with_approach(initial: f64, approach: f64) -> Self {
        Self {
            state: Mutex::new(ThermalState {
                temperature: initial,
                setpoint: None,
                approach: approach.clamp(0.0, 1.0),
                setpoints: Vec::new(),
                readings: 0,
            }),
        }
    }

    /// Controller that never moves off its initial temperature.
    #[must_use]
    pub fn stuck_at(temperature: f64) -> Self {
        Self::with_approach(temperature, 0.0)
    }

    /// Setpoints written so far.
    #[must_use]
    pub fn setpoints(&self) -> Vec<f64> {
        self.state.lock().setpoints.clone()
    }

    /// Number of temperature readings taken.
    #[must_use]
    pub fn reading_count(&self) -> usize {
        self.state.lock().readings
    }
}

#[async_trait]
impl TemperatureController for MockTemperatureController {
    async fn set_temp(&self, celsius: f64) -> Result<()> {
        let mut state = self.state.lock();
        state.setpoint = Some(celsius);
        state.setpoints.push(celsius);
        Ok(())
    }

    async fn measure_temp(&self) -> Result<f64> {
        let mut state = self.state.lock();
        state.readings += 1;
        if let Some(target) = state.setpoint {
            let gap = target - state.temperature;
            state.temperature += gap * state.approach;
        }
        Ok(state.temperature)
    }
}

// =============================================================================
// MockPositioner / MockStageConnector
// =============================================================================

#[derive(Debug, Default)]
struct AxisState {
    position: f64,
    target: f64,
    polls_remaining: usize,
    polls_per_move: usize,
    moves: Vec<f64>,
    status_polls: usize,
}

/// Simulated linear axis.
///
/// After `move_relative` the axis reports moving for `polls_per_move` status
/// polls and lands on the target on the first idle poll.
#[derive(Clone)]
pub struct MockPositioner {
    state: Arc<Mutex<AxisState>>,
}

impl MockPositioner {
    /// Axis at `position` that stays busy for `polls_per_move` polls.
    #[must_use]
    pub fn new(position: f64, polls_per_move: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(AxisState {
                position,
                target: position,
                polls_per_move,
                ..AxisState::default()
            })),
        }
    }

    /// Relative moves issued so far.
    #[must_use]
    pub fn moves(&self) -> Vec<f64> {
        self.state.lock().moves.clone()
    }

    /// Number of relative moves issued.
    #[must_use]
    pub fn move_count(&self) -> usize {
        self.state.lock().moves.len()
    }

    /// Number of `is_moving` polls answered.
    #[must_use]
    pub fn status_polls(&self) -> usize {
        self.state.lock().status_polls
    }

    /// Target of the last move (equals the position once idle).
    #[must_use]
    pub fn target(&self) -> f64 {
        self.state.lock().target
    }
}

impl Default for MockPositioner {
    fn default() -> Self {
        Self::new(0.0, 2)
    }
}

#[async_trait]
impl PositionerAxis for MockPositioner {
    async fn move_relative(&self, distance: f64) -> Result<()> {
        let mut state = self.state.lock();
        state.target = state.position + distance;
        state.polls_remaining = state.polls_per_move;
        state.moves.push(distance);
        Ok(())
    }

    async fn is_moving(&self) -> Result<bool> {
        let mut state = self.state.lock();
        state.status_polls += 1;
        if state.polls_remaining > 0 {
            state.polls_remaining -= 1;
            Ok(true)
        } else {
            state.position = state.target;
            Ok(false)
        }
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.state.lock().position)
    }
}

/// Hands out a fresh [`MockPositioner`] handle per `connect`, all driving the
/// same physical axis.
pub struct MockStageConnector {
    axis: MockPositioner,
    connections: AtomicUsize,
}

impl MockStageConnector {
    /// Connector over an idle axis at 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            axis: MockPositioner::new(0.0, 0),
            connections: AtomicUsize::new(0),
        }
    }

    /// Number of connections opened.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// The underlying axis, for inspection.
    #[must_use]
    pub fn axis(&self) -> &MockPositioner {
        &self.axis
    }
}

impl Default for MockStageConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageConnector for MockStageConnector {
    async fn connect(&self) -> Result<Box<dyn PositionerAxis>> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.axis.clone()))
    }
}

// =============================================================================
// MockTracker
// =============================================================================

/// Gaussian coupling profile seen by a tracking channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CouplingProfile {
    /// Horizontal peak position (tracker units)
    pub center_h: f64,
    /// Vertical peak position (tracker units)
    pub center_v: f64,
    /// Standard deviation of the intensity profile (tracker units)
    pub sigma: f64,
    /// Calibrated power at the peak (dBm)
    pub peak_dbm: f64,
}

impl CouplingProfile {
    /// Raw reading the detector reports at `(h, v)`.
    #[must_use]
    pub fn reading_at(&self, h: f64, v: f64) -> f64 {
        let r2 = (h - self.center_h).powi(2) + (v - self.center_v).powi(2);
        let dbm = self.peak_dbm - 10.0 * r2 / (2.0 * self.sigma * self.sigma * LN_10);
        dbm_to_reading(dbm)
    }
}

impl Default for CouplingProfile {
    fn default() -> Self {
        Self {
            center_h: 5.0,
            center_v: 5.0,
            sigma: 2.0,
            peak_dbm: -20.0,
        }
    }
}

#[derive(Debug)]
struct TrackerState {
    position: (f64, f64),
    tracking: bool,
    lock_target: (f64, f64),
    profile: CouplingProfile,
    diameters: Vec<f64>,
    latches: usize,
    moves: usize,
}

/// Simulated piezo tracking channel.
///
/// While tracking, a latch lands the circle on the lock target (the profile
/// peak unless overridden). `move_to` positions the circle directly.
pub struct MockTracker {
    state: Mutex<TrackerState>,
}

impl MockTracker {
    /// Tracker at `start` over `profile`.
    #[must_use]
    pub fn new(start: (f64, f64), profile: CouplingProfile) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                position: start,
                tracking: false,
                lock_target: (profile.center_h, profile.center_v),
                profile,
                diameters: Vec::new(),
                latches: 0,
                moves: 0,
            }),
        }
    }

    /// Where the next track-and-latch cycle will settle.
    pub fn set_lock_target(&self, horizontal: f64, vertical: f64) {
        self.state.lock().lock_target = (horizontal, vertical);
    }

    /// Replace the coupling profile.
    pub fn set_profile(&self, profile: CouplingProfile) {
        self.state.lock().profile = profile;
    }

    /// Current circle center.
    #[must_use]
    pub fn position(&self) -> (f64, f64) {
        self.state.lock().position
    }

    /// Capture diameters applied so far.
    #[must_use]
    pub fn diameters(&self) -> Vec<f64> {
        self.state.lock().diameters.clone()
    }

    /// Latch commands received.
    #[must_use]
    pub fn latch_count(&self) -> usize {
        self.state.lock().latches
    }

    /// Direct `move_to` commands received.
    #[must_use]
    pub fn move_count(&self) -> usize {
        self.state.lock().moves
    }
}

impl Default for MockTracker {
    fn default() -> Self {
        Self::new((4.5, 5.5), CouplingProfile::default())
    }
}

#[async_trait]
impl TrackingChannel for MockTracker {
    async fn circ_position(&self) -> Result<CircularPosition> {
        let state = self.state.lock();
        let (horizontal, vertical) = state.position;
        Ok(CircularPosition {
            horizontal,
            vertical,
            signal: state.profile.reading_at(horizontal, vertical),
        })
    }

    async fn move_to(&self, horizontal: f64, vertical: f64) -> Result<()> {
        let mut state = self.state.lock();
        state.position = (horizontal, vertical);
        state.moves += 1;
        Ok(())
    }

    async fn set_capture_diameter(&self, diameter: f64) -> Result<()> {
        self.state.lock().diameters.push(diameter);
        Ok(())
    }

    async fn track(&self) -> Result<()> {
        self.state.lock().tracking = true;
        Ok(())
    }

    async fn latch(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.tracking {
            state.position = state.lock_target;
        }
        state.tracking = false;
        state.latches += 1;
        Ok(())
    }
}

// =============================================================================
// SimulatedBench
// =============================================================================

/// A complete simulated bench with typed access to every mock.
pub struct SimulatedBench {
    /// Current source
    pub source: Arc<MockCurrentSource>,
    /// Swept-laser scanner
    pub scanner: Arc<MockOpticalScanner>,
    /// Lower router
    pub lower_router: Arc<MockOpticalRouter>,
    /// Upper router
    pub upper_router: Arc<MockOpticalRouter>,
    /// Temperature controller
    pub temperature: Arc<MockTemperatureController>,
    /// Input stage
    pub input_stage: Arc<MockPositioner>,
    /// Output stage
    pub output_stage: Arc<MockPositioner>,
    /// Focus axis
    pub focus_stage: Arc<MockPositioner>,
    /// Chip carrier axis
    pub chip_stage: Arc<MockPositioner>,
    /// Height axis connector
    pub height: Arc<MockStageConnector>,
    /// Input tracker
    pub input_tracker: Arc<MockTracker>,
    /// Output tracker
    pub output_tracker: Arc<MockTracker>,
    /// Focus tracker
    pub focus_tracker: Arc<MockTracker>,
}

impl SimulatedBench {
    /// Bench whose thermal start point sits 1.5 °C below the configured
    /// setpoint.
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        Self::with_temperature(MockTemperatureController::new(
            settings.scan.temperature_setpoint_c - 1.5,
        ))
    }

    /// Bench already at `setpoint` (no temperature wait).
    #[must_use]
    pub fn stabilized(setpoint: f64) -> Self {
        Self::with_temperature(MockTemperatureController::with_approach(setpoint, 1.0))
    }

    fn with_temperature(temperature: MockTemperatureController) -> Self {
        Self {
            source: Arc::new(MockCurrentSource::new()),
            scanner: Arc::new(MockOpticalScanner::default()),
            lower_router: Arc::new(MockOpticalRouter::new()),
            upper_router: Arc::new(MockOpticalRouter::new()),
            temperature: Arc::new(temperature),
            input_stage: Arc::new(MockPositioner::new(10.0, 2)),
            output_stage: Arc::new(MockPositioner::new(12.0, 3)),
            focus_stage: Arc::new(MockPositioner::default()),
            chip_stage: Arc::new(MockPositioner::default()),
            height: Arc::new(MockStageConnector::new()),
            input_tracker: Arc::new(MockTracker::default()),
            output_tracker: Arc::new(MockTracker::new((5.4, 4.7), CouplingProfile::default())),
            focus_tracker: Arc::new(MockTracker::new((5.1, 5.2), CouplingProfile::default())),
        }
    }

    /// Trait-object view used by the scan loop.
    #[must_use]
    pub fn bench(&self) -> Bench {
        Bench {
            source: self.source.clone(),
            scanner: self.scanner.clone(),
            lower_router: self.lower_router.clone(),
            upper_router: self.upper_router.clone(),
            temperature: self.temperature.clone(),
            input_stage: self.input_stage.clone(),
            output_stage: self.output_stage.clone(),
            focus_stage: self.focus_stage.clone(),
            chip_stage: self.chip_stage.clone(),
            height: self.height.clone(),
            input_tracker: self.input_tracker.clone(),
            output_tracker: self.output_tracker.clone(),
            focus_tracker: self.focus_tracker.clone(),
        }
    }

    /// Relative moves issued on both grid stages.
    #[must_use]
    pub fn stage_move_count(&self) -> usize {
        self.input_stage.move_count() + self.output_stage.move_count()
    }
}

impl Default for SimulatedBench {
    fn default() -> Self {
        Self::new(&Settings::default())
    }
}
