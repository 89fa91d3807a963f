//! Fiber-to-chip coupling confirmation.
//!
//! The input tracker is latched, so its circle center can be positioned
//! directly. The validator samples the detector signal over a line (1-D) or a
//! raster (2-D) of tracker positions, converts the readings to linear power,
//! fits a Gaussian and applies the acceptance bounds. The tracker is returned
//! to where it started afterwards.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::control::ExecutionControl;
use super::events::{CouplingPayload, Notifier, ScanEvent};
use crate::analysis::{
    dbm_to_linear, fit_gaussian_1d, fit_gaussian_2d, reading_to_dbm, FitError, FitOptions,
    Gaussian1D, Gaussian2D,
};
use crate::config::{ScanConfig, ScanType, TimingConfig};
use crate::error::AppResult;
use crate::hardware::TrackingChannel;

/// Samples per axis.
pub const SCAN_POINTS: usize = 21;
/// Spacing between samples (tracker units).
pub const SCAN_PITCH: f64 = 0.5;
/// Spacing of the displayed 1-D fitted curve.
pub const FINE_PITCH: f64 = 0.01;
/// Upper end (exclusive) of the displayed 1-D fitted curve.
pub const FINE_END: f64 = 10.5;

/// Sample coordinate for index `i`.
fn scan_position(i: usize) -> f64 {
    i as f64 * SCAN_PITCH
}

/// Fitted model of an accepted or rejected probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FitParameters {
    /// `[a, x0, sigma]`
    OneD(Gaussian1D),
    /// `[A, x0, y0, sigma_x, sigma_y, theta, offset]`
    TwoD(Gaussian2D),
}

impl FitParameters {
    /// Parameters as a flat list in model order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<f64> {
        match self {
            FitParameters::OneD(g) => g.params(),
            FitParameters::TwoD(g) => g.params(),
        }
    }
}

/// Outcome of one validation call.
#[derive(Debug, Clone, PartialEq)]
pub struct CouplingReport {
    /// Probe geometry
    pub scan_type: ScanType,
    /// Acceptance test passed
    pub accepted: bool,
    /// Fitted model, `None` when the fit failed
    pub fit: Option<FitParameters>,
    /// Why the fit failed
    pub fit_error: Option<FitError>,
    /// Sample coordinates `(x, y)` in acquisition order
    pub positions: Vec<(f64, f64)>,
    /// Calibrated power per sample (dBm)
    pub sampled_dbm: Vec<f64>,
    /// Linear power per sample (mW)
    pub sampled_linear: Vec<f64>,
    /// Fitted curve for display, empty when the fit failed
    pub fitted: Vec<f64>,
}

impl CouplingReport {
    /// Display payload for `couplingCompleted`.
    #[must_use]
    pub fn payload(&self) -> CouplingPayload {
        let (x_positions, y_positions) = match self.scan_type {
            ScanType::OneD => (Vec::new(), Vec::new()),
            ScanType::TwoD => self.positions.iter().copied().unzip(),
        };
        CouplingPayload {
            scan_type: self.scan_type,
            raw: self.sampled_linear.clone(),
            fitted: self.fitted.clone(),
            x_positions,
            y_positions,
            accepted: self.accepted,
        }
    }
}

/// Acceptance for a 1-D fit: `gaus_min < |sigma| < gaus_max`.
#[must_use]
pub fn accept_1d(fit: &Gaussian1D, gaus_min: f64, gaus_max: f64) -> bool {
    let width = fit.sigma.abs();
    gaus_min < width && width < gaus_max
}

/// Acceptance for a 2-D fit: both centers strictly inside `(gaus_min, gaus_max)`.
#[must_use]
pub fn accept_2d(fit: &Gaussian2D, gaus_min: f64, gaus_max: f64) -> bool {
    let inside = |c: f64| gaus_min < c && c < gaus_max;
    inside(fit.x0) && inside(fit.y0)
}

/// Samples, fits and judges the coupling on the input tracker.
pub struct CouplingValidator {
    tracker: Arc<dyn TrackingChannel>,
    scan_type: ScanType,
    gaus_min: f64,
    gaus_max: f64,
    sample_settle: Duration,
    row_settle: Duration,
    fit_options: FitOptions,
    notifier: Notifier,
}

impl CouplingValidator {
    /// Build from the input tracker and run settings.
    #[must_use]
    pub fn new(
        tracker: Arc<dyn TrackingChannel>,
        scan: &ScanConfig,
        timing: &TimingConfig,
        notifier: Notifier,
    ) -> Self {
        Self {
            tracker,
            scan_type: scan.coupling_scan,
            gaus_min: scan.gaus_min,
            gaus_max: scan.gaus_max,
            sample_settle: timing.sample_settle,
            row_settle: timing.row_settle,
            fit_options: FitOptions::default(),
            notifier,
        }
    }

    /// Override the fitter settings.
    #[must_use]
    pub fn with_fit_options(mut self, options: FitOptions) -> Self {
        self.fit_options = options;
        self
    }

    /// Probe geometry used by [`Self::validate`].
    #[must_use]
    pub fn scan_type(&self) -> ScanType {
        self.scan_type
    }

    /// Run one probe.
    ///
    /// Every sample is preceded by a checkpoint. A stop aborts the probe with
    /// [`crate::error::DaqError::OperatorStop`] and leaves the tracker where
    /// it is. Fit failures are reported as a rejected probe, not an error.
    pub async fn validate(&self, control: &ExecutionControl) -> AppResult<CouplingReport> {
        let start = self.tracker.circ_position().await?;
        let mut positions = Vec::new();
        let mut readings = Vec::new();

        match self.scan_type {
            ScanType::OneD => {
                for i in 0..SCAN_POINTS {
                    control.checkpoint().await?;
                    let x = scan_position(i);
                    self.tracker.move_to(x, start.vertical).await?;
                    sleep(self.sample_settle).await;
                    positions.push((x, start.vertical));
                    readings.push(self.tracker.circ_position().await?.signal);
                }
            }
            ScanType::TwoD => {
                for i in 0..SCAN_POINTS {
                    for j in 0..SCAN_POINTS {
                        control.checkpoint().await?;
                        let (x, y) = (scan_position(i), scan_position(j));
                        self.tracker.move_to(x, y).await?;
                        let settle = if j == 0 {
                            self.row_settle
                        } else {
                            self.sample_settle
                        };
                        sleep(settle).await;
                        positions.push((x, y));
                        readings.push(self.tracker.circ_position().await?.signal);
                    }
                }
            }
        }

        self.tracker.move_to(start.horizontal, start.vertical).await?;

        let sampled_dbm: Vec<f64> = readings.iter().map(|r| reading_to_dbm(*r)).collect();
        let sampled_linear: Vec<f64> = sampled_dbm.iter().map(|d| dbm_to_linear(*d)).collect();

        let report = match self.scan_type {
            ScanType::OneD => self.judge_1d(positions, sampled_dbm, sampled_linear),
            ScanType::TwoD => self.judge_2d(positions, sampled_dbm, sampled_linear),
        };

        self.notifier
            .emit(ScanEvent::CouplingCompleted(report.payload()));
        if report.accepted {
            self.notifier.status("Coupling successful.");
        } else {
            warn!(fit = ?report.fit, error = ?report.fit_error, "coupling rejected");
            if let Some(err) = &report.fit_error {
                let text = match self.scan_type {
                    ScanType::OneD => err.to_string(),
                    ScanType::TwoD => format!("Error during 2D scan fitting: {err}"),
                };
                self.notifier.status(text);
            }
            self.notifier.status("Adjust manually.");
        }
        Ok(report)
    }

    fn judge_1d(
        &self,
        positions: Vec<(f64, f64)>,
        sampled_dbm: Vec<f64>,
        sampled_linear: Vec<f64>,
    ) -> CouplingReport {
        let x: Vec<f64> = positions.iter().map(|(x, _)| *x).collect();
        let fit = fit_gaussian_1d(&x, &sampled_linear, Gaussian1D::INITIAL_GUESS, &self.fit_options);
        let (fit, fit_error, fitted, accepted) = match fit {
            Ok(g) => {
                debug!(?g, "1-D fit");
                let steps = (FINE_END / FINE_PITCH).round() as usize;
                let fitted = (0..steps)
                    .map(|i| g.evaluate(i as f64 * FINE_PITCH))
                    .collect();
                let accepted = accept_1d(&g, self.gaus_min, self.gaus_max);
                (Some(FitParameters::OneD(g)), None, fitted, accepted)
            }
            Err(e) => (None, Some(e), Vec::new(), false),
        };
        CouplingReport {
            scan_type: ScanType::OneD,
            accepted,
            fit,
            fit_error,
            positions,
            sampled_dbm,
            sampled_linear,
            fitted,
        }
    }

    fn judge_2d(
        &self,
        positions: Vec<(f64, f64)>,
        sampled_dbm: Vec<f64>,
        sampled_linear: Vec<f64>,
    ) -> CouplingReport {
        let guess = Gaussian2D::guess_from_samples(&positions, &sampled_linear);
        let fit = fit_gaussian_2d(&positions, &sampled_linear, guess, &self.fit_options);
        let (fit, fit_error, fitted, accepted) = match fit {
            Ok(g) => {
                debug!(?g, "2-D fit");
                let fitted = positions.iter().map(|&(x, y)| g.evaluate(x, y)).collect();
                let accepted = accept_2d(&g, self.gaus_min, self.gaus_max);
                (Some(FitParameters::TwoD(g)), None, fitted, accepted)
            }
            Err(e) => (None, Some(e), Vec::new(), false),
        };
        CouplingReport {
            scan_type: ScanType::TwoD,
            accepted,
            fit,
            fit_error,
            positions,
            sampled_dbm,
            sampled_linear,
            fitted,
        }
    }
}
