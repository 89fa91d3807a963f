//! Per-site measurement records.
//!
//! One JSON document is written for every (current, site) capture. Files are
//! created with `create_new`, so an existing record is never reopened for
//! writing; a name collision gets a numeric suffix instead.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{ScanType, SweepConfig};
use crate::error::AppResult;
use crate::experiment::spectrum::SpectrumPair;
use crate::experiment::state::SiteSnapshot;

/// Timestamp layout used in records and file names.
pub const TIME_FORMAT: &str = "%Y-%m-%d_%H%M%S";

/// Suffixes tried after the plain name is taken.
const MAX_SUFFIX: usize = 1000;

/// Sweep settings, coupling fit and operating point of one capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Local capture time, `YYYY-MM-DD_HHMMSS`
    pub measurement_time: String,
    /// Run the record belongs to
    pub run_id: Uuid,
    /// Site index (0 is the pre-grid capture)
    pub site: usize,
    /// Sweep start (nm)
    pub start_wavelength_nm: f64,
    /// Sweep stop (nm)
    pub stop_wavelength_nm: f64,
    /// Sampling resolution (pm)
    pub sampling_resolution_pm: f64,
    /// Sweep speed (nm/s)
    pub laser_sweep_speed_nm_per_s: f64,
    /// Laser power (dBm)
    pub laser_power_dbm: f64,
    /// Geometry of the coupling probe, if one ran
    pub coupling_scan: Option<ScanType>,
    /// Fitted Gaussian parameters in model order, empty if the fit failed
    pub gaussian_fit_params: Vec<f64>,
    /// Sampled coupling power (dBm)
    pub sampled_power_output: Vec<f64>,
    /// Fitted coupling curve
    pub fitted_power_output: Vec<f64>,
    /// Applied drive current (A)
    pub currents_a: f64,
    /// Power measured after the current settled (dBm)
    pub measured_power_dbm: f64,
}

/// Raw insertion-loss traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordData {
    /// Wavelength axis (nm)
    pub wavelength_nm: Vec<f64>,
    /// TE insertion loss (dB)
    pub il_te_db: Vec<f64>,
    /// TM insertion loss (dB)
    pub il_tm_db: Vec<f64>,
}

/// One persisted capture. Never mutated after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Settings and operating point
    pub metadata: RecordMetadata,
    /// Traces
    pub data: RecordData,
}

impl MeasurementRecord {
    /// Assemble a record from the site snapshot and both sweeps.
    ///
    /// Wavelength bounds are the ends of the TE wavelength array; the
    /// configured sweep bounds are used only when that array is empty.
    #[must_use]
    pub fn from_snapshot(
        snapshot: &SiteSnapshot,
        sweep: &SweepConfig,
        spectra: &SpectrumPair,
        measured_at: DateTime<Local>,
    ) -> Self {
        let coupling = snapshot.coupling.as_ref();
        let swept = &spectra.te.wavelengths_nm;
        Self {
            metadata: RecordMetadata {
                measurement_time: measured_at.format(TIME_FORMAT).to_string(),
                run_id: snapshot.run_id,
                site: snapshot.site,
                start_wavelength_nm: swept.first().copied().unwrap_or(sweep.start_wavelength_nm),
                stop_wavelength_nm: swept.last().copied().unwrap_or(sweep.stop_wavelength_nm),
                sampling_resolution_pm: sweep.sampling_pm,
                laser_sweep_speed_nm_per_s: sweep.speed_nm_per_s,
                laser_power_dbm: sweep.laser_power_dbm,
                coupling_scan: coupling.map(|c| c.scan_type),
                gaussian_fit_params: coupling
                    .and_then(|c| c.fit)
                    .map(|fit| fit.to_vec())
                    .unwrap_or_default(),
                sampled_power_output: coupling
                    .map(|c| c.sampled_dbm.clone())
                    .unwrap_or_default(),
                fitted_power_output: coupling.map(|c| c.fitted.clone()).unwrap_or_default(),
                currents_a: snapshot.current_a,
                measured_power_dbm: snapshot.measured_power_dbm,
            },
            data: RecordData {
                wavelength_nm: spectra.te.wavelengths_nm.clone(),
                il_te_db: spectra.te.loss_db.clone(),
                il_tm_db: spectra.tm.loss_db.clone(),
            },
        }
    }

    /// `<time>_output_<site>_current_<current>A`, without extension.
    #[must_use]
    pub fn file_stem(&self) -> String {
        format!(
            "{}_output_{}_current_{:.6}A",
            self.metadata.measurement_time, self.metadata.site, self.metadata.currents_a
        )
    }
}

/// Writes records into one output directory.
#[derive(Debug, Clone)]
pub struct DataRecorder {
    output_dir: PathBuf,
}

impl DataRecorder {
    /// Recorder writing into `output_dir` (created on first write).
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Target directory.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write `record` as pretty JSON and return the path written.
    pub async fn persist(&self, record: &MeasurementRecord) -> AppResult<PathBuf> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let body = serde_json::to_vec_pretty(record)?;
        let stem = record.file_stem();

        let mut attempt = 0;
        loop {
            let name = if attempt == 0 {
                format!("{stem}.json")
            } else {
                format!("{stem}_{attempt}.json")
            };
            let path = self.output_dir.join(name);
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(&body).await?;
                    file.flush().await?;
                    info!(path = %path.display(), site = record.metadata.site, "record saved");
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists && attempt < MAX_SUFFIX => {
                    debug!(path = %path.display(), "record name taken");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
