//! Polarization-resolved insertion-loss sweeps.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use super::control::ExecutionControl;
use super::events::{Notifier, ScanEvent};
use crate::config::{BandRouting, Polarization, SweepConfig};
use crate::error::AppResult;
use crate::hardware::{Bench, OpticalRouter, OpticalScanner, ScanParameters};

/// One completed sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    /// Polarization the routers were set for
    pub polarization: Polarization,
    /// Wavelength axis (nm)
    pub wavelengths_nm: Vec<f64>,
    /// Insertion loss (dB)
    pub loss_db: Vec<f64>,
}

/// TE and TM sweeps of one site.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumPair {
    /// TE sweep
    pub te: Spectrum,
    /// TM sweep
    pub tm: Spectrum,
}

/// Routes both optical switches and runs the swept-laser scan.
pub struct PolarizationScanner {
    scanner: Arc<dyn OpticalScanner>,
    lower: Arc<dyn OpticalRouter>,
    upper: Arc<dyn OpticalRouter>,
    routing: BandRouting,
    params: ScanParameters,
    notifier: Notifier,
}

impl PolarizationScanner {
    /// Build from the bench, the active band's routing and sweep settings.
    #[must_use]
    pub fn new(bench: &Bench, routing: BandRouting, sweep: &SweepConfig, notifier: Notifier) -> Self {
        Self {
            scanner: bench.scanner.clone(),
            lower: bench.lower_router.clone(),
            upper: bench.upper_router.clone(),
            routing,
            params: ScanParameters {
                start_wavelength_nm: sweep.start_wavelength_nm,
                stop_wavelength_nm: sweep.stop_wavelength_nm,
                sampling_pm: sweep.sampling_pm,
                speed_nm_per_s: sweep.speed_nm_per_s,
                laser_power_dbm: sweep.laser_power_dbm,
            },
            notifier,
        }
    }

    async fn prepare_and_scan(&self) -> AppResult<crate::hardware::ScanOutcome> {
        self.scanner.clear_trace_queue().await?;
        self.scanner.set_scan_parameters(&self.params).await?;
        Ok(self.scanner.perform_scan().await?)
    }

    /// Route for `polarization` and sweep until the instrument reports success.
    ///
    /// Scan errors are retried immediately and without limit; the stop flag is
    /// consulted before every retry.
    pub async fn capture(
        &self,
        polarization: Polarization,
        control: &ExecutionControl,
    ) -> AppResult<Spectrum> {
        control.ensure_running()?;
        let (lower, upper) = self.routing.ports(polarization);
        self.lower.set_routing(&format!("A,{lower}")).await?;
        self.upper.set_routing(&format!("A,{upper}")).await?;
        self.notifier.status(format!(
            "Switch settings: {polarization} Lower {lower}, Upper {upper}"
        ));

        self.notifier.status("Scanning...");
        let mut outcome = self.prepare_and_scan().await?;
        while !outcome.is_success() {
            warn!(code = outcome.code, name = %outcome.name, %polarization, "scan failed");
            self.notifier.status(format!(
                "Scan failed with error code {}: {}",
                outcome.code, outcome.name
            ));
            control.ensure_running()?;
            self.notifier.status("Scan again...");
            outcome = self.prepare_and_scan().await?;
        }
        self.notifier.status("Scan completed successfully.");

        let wavelengths_nm = self.scanner.create_wavelength_array().await?;
        let loss_db = self.scanner.retrieve_trace().await?;
        self.notifier.emit(ScanEvent::MeasurementCompleted {
            polarization,
            wavelengths_nm: wavelengths_nm.clone(),
            loss_db: loss_db.clone(),
        });
        Ok(Spectrum {
            polarization,
            wavelengths_nm,
            loss_db,
        })
    }

    /// TE then TM.
    pub async fn capture_both(&self, control: &ExecutionControl) -> AppResult<SpectrumPair> {
        let te = self.capture(Polarization::TE, control).await?;
        let tm = self.capture(Polarization::TM, control).await?;
        Ok(SpectrumPair { te, tm })
    }
}
