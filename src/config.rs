//! Run configuration using Figment
//!
//! Settings are loaded from:
//! 1. a TOML file (base configuration, see `config/default.toml`)
//! 2. environment variables prefixed with `WAVEGUIDE_DAQ_`, nested keys
//!    separated by `__` (e.g. `WAVEGUIDE_DAQ_SCAN__GAUS_MAX=7.5`)
//!
//! Every section has defaults, so an empty file yields a runnable bench
//! configuration. Call [`Settings::validate`] before starting a run.
//!
//! # Example
//! ```no_run
//! use waveguide_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/default.toml")?;
//! settings.validate().map_err(|e| anyhow::anyhow!(e))?;
//! println!("{} current setpoints", settings.scan.currents().len());
//! # Ok::<(), anyhow::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, DaqError};

/// Environment override prefix.
pub const ENV_PREFIX: &str = "WAVEGUIDE_DAQ_";

/// Drive currents (A) used when no `[scan] currents_a` is configured.
pub const DEFAULT_CURRENTS_A: [f64; 8] = [
    0.080_201_950_981_110_61,
    0.081_673_669_167_572_71,
    0.083_119_333_066_451_9,
    0.084_540_279_296_495_19,
    0.085_937_733_956_900_79,
    0.087_312_825_013_079_87,
    0.088_666_592_952_940_02,
    0.09,
];

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Where records are written
    pub storage: StorageConfig,
    /// Current sweep, temperature and coupling acceptance
    pub scan: ScanConfig,
    /// Swept-laser parameters
    pub sweep: SweepConfig,
    /// Router ports per wavelength band
    pub routing: BTreeMap<WavelengthBand, BandRouting>,
    /// Chip/output grid geometry
    pub grid: GridConfig,
    /// Settle and poll durations
    pub timing: TimingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            storage: StorageConfig::default(),
            scan: ScanConfig::default(),
            sweep: SweepConfig::default(),
            routing: default_routing(),
            grid: GridConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "waveguide-daq".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Log output format as written in the settings file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored
    Pretty,
    /// Single-line
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Output directory for record files (created on demand)
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

/// Current sequence definition.
///
/// Either an explicit list or a square-root profile that front-loads the
/// step density near `max_a`. Profiles are expanded once in
/// [`Settings::load_from`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CurrentProfile {
    /// Explicit ascending list in amperes
    List(Vec<f64>),
    /// `min_a + sqrt(t) * (max_a - min_a)` for `t` evenly spaced in [0, 1]
    Sqrt {
        /// First setpoint (A)
        min_a: f64,
        /// Last setpoint (A)
        max_a: f64,
        /// Number of setpoints
        steps: usize,
    },
}

impl Default for CurrentProfile {
    fn default() -> Self {
        CurrentProfile::List(DEFAULT_CURRENTS_A.to_vec())
    }
}

impl CurrentProfile {
    /// Concrete setpoints in visiting order.
    #[must_use]
    pub fn values(&self) -> Vec<f64> {
        match self {
            CurrentProfile::List(values) => values.clone(),
            CurrentProfile::Sqrt { min_a, max_a, steps } => match *steps {
                0 => Vec::new(),
                1 => vec![*min_a],
                n => (0..n)
                    .map(|i| {
                        let t = i as f64 / (n - 1) as f64;
                        min_a + t.sqrt() * (max_a - min_a)
                    })
                    .collect(),
            },
        }
    }
}

/// Which coupling probe the run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanType {
    /// 21-point horizontal line
    #[serde(rename = "1d", alias = "1D")]
    OneD,
    /// 21x21 raster
    #[serde(rename = "2d", alias = "2D")]
    TwoD,
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanType::OneD => write!(f, "1D"),
            ScanType::TwoD => write!(f, "2D"),
        }
    }
}

/// Scan loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Drive current sequence
    pub currents_a: CurrentProfile,
    /// Chip temperature setpoint
    pub temperature_setpoint_c: f64,
    /// Accepted |measured - setpoint|
    pub temperature_tolerance_c: f64,
    /// Coupling probe used for every validation in the run
    pub coupling_scan: ScanType,
    /// Lower acceptance bound for the fitted width (1-D) or centers (2-D)
    pub gaus_min: f64,
    /// Upper acceptance bound
    pub gaus_max: f64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            currents_a: CurrentProfile::default(),
            temperature_setpoint_c: 25.0,
            temperature_tolerance_c: 0.01,
            coupling_scan: ScanType::OneD,
            gaus_min: 1.0,
            gaus_max: 9.0,
        }
    }
}

impl ScanConfig {
    /// Current setpoints in visiting order.
    #[must_use]
    pub fn currents(&self) -> Vec<f64> {
        self.currents_a.values()
    }
}

/// Wavelength band of the swept laser; selects the router table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WavelengthBand {
    /// O-band
    #[serde(rename = "1260_1360")]
    B1260To1360,
    /// E/S-band
    #[serde(rename = "1350_1510")]
    B1350To1510,
    /// C/L-band
    #[serde(rename = "1500_1630")]
    B1500To1630,
}

impl fmt::Display for WavelengthBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WavelengthBand::B1260To1360 => "1260_1360",
            WavelengthBand::B1350To1510 => "1350_1510",
            WavelengthBand::B1500To1630 => "1500_1630",
        };
        f.write_str(name)
    }
}

/// Polarization of an insertion-loss scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Polarization {
    /// Transverse electric
    TE,
    /// Transverse magnetic
    TM,
}

impl fmt::Display for Polarization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Polarization::TE => write!(f, "TE"),
            Polarization::TM => write!(f, "TM"),
        }
    }
}

/// Router ports `[lower, upper]` for each polarization of one band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandRouting {
    /// Ports used for TE scans
    pub te: [u32; 2],
    /// Ports used for TM scans
    pub tm: [u32; 2],
}

impl BandRouting {
    /// `(lower, upper)` ports for a polarization.
    #[must_use]
    pub fn ports(&self, polarization: Polarization) -> (u32, u32) {
        let [lower, upper] = match polarization {
            Polarization::TE => self.te,
            Polarization::TM => self.tm,
        };
        (lower, upper)
    }
}

/// Default router table for the three bands of the bench.
#[must_use]
pub fn default_routing() -> BTreeMap<WavelengthBand, BandRouting> {
    BTreeMap::from([
        (
            WavelengthBand::B1260To1360,
            BandRouting { te: [1, 1], tm: [2, 2] },
        ),
        (
            WavelengthBand::B1350To1510,
            BandRouting { te: [3, 3], tm: [4, 4] },
        ),
        (
            WavelengthBand::B1500To1630,
            BandRouting { te: [5, 5], tm: [6, 6] },
        ),
    ])
}

/// Swept-laser configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
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
    /// Active band, selects the routing table entry
    pub band: WavelengthBand,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            start_wavelength_nm: 1500.0,
            stop_wavelength_nm: 1630.0,
            sampling_pm: 1.0,
            speed_nm_per_s: 50.0,
            laser_power_dbm: 6.0,
            band: WavelengthBand::B1500To1630,
        }
    }
}

/// Chip/output grid geometry (stage units)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Input stage step per synchronized move
    pub input_waveguide_pitch: f64,
    /// Output stage step between neighbouring outputs
    pub output_waveguide_pitch: f64,
    /// Output stage step onto the first output of the next chip
    pub chip_pitch: f64,
    /// Chips on the carrier
    pub number_of_chips: usize,
    /// Inputs per chip (recorded for reference)
    pub inputs_per_chip: usize,
    /// Outputs per chip
    pub outputs_per_chip: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            input_waveguide_pitch: 0.127,
            output_waveguide_pitch: 0.127,
            chip_pitch: 2.0,
            number_of_chips: 1,
            inputs_per_chip: 1,
            outputs_per_chip: 4,
        }
    }
}

/// Fixed waits of the scan loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait after setting a new drive current
    #[serde(with = "humantime_serde")]
    pub current_settle: Duration,
    /// Interval between temperature readings while stabilizing
    #[serde(with = "humantime_serde")]
    pub temperature_poll: Duration,
    /// Interval between "is moving" polls
    #[serde(with = "humantime_serde")]
    pub motion_poll: Duration,
    /// Settle after each coupling-probe position
    #[serde(with = "humantime_serde")]
    pub sample_settle: Duration,
    /// Settle at the first point of each 2-D raster row
    #[serde(with = "humantime_serde")]
    pub row_settle: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            current_settle: Duration::from_secs(20),
            temperature_poll: Duration::from_secs(10),
            motion_poll: Duration::from_millis(100),
            sample_settle: Duration::from_millis(100),
            row_settle: Duration::from_millis(250),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file merged with `WAVEGUIDE_DAQ_` overrides.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::extract(Figment::new().merge(Toml::file(path.as_ref())))
    }

    /// Load settings from an in-memory TOML document (plus env overrides).
    pub fn from_toml_str(toml: &str) -> Result<Self, figment::Error> {
        Self::extract(Figment::new().merge(Toml::string(toml)))
    }

    /// Load, then validate. Convenience for the binary.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Self::load_from(path)?;
        settings.validate().map_err(DaqError::Configuration)?;
        Ok(settings)
    }

    fn extract(figment: Figment) -> Result<Self, figment::Error> {
        let mut settings: Settings = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        settings.scan.currents_a = CurrentProfile::List(settings.scan.currents());
        Ok(settings)
    }

    /// Resolved settings (file, env and profile expansion applied) as TOML.
    pub fn to_toml_string(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Configuration(e.to_string()))
    }

    /// Router ports for the active band.
    #[must_use]
    pub fn active_routing(&self) -> Option<&BandRouting> {
        self.routing.get(&self.sweep.band)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if let CurrentProfile::Sqrt { steps, .. } = self.scan.currents_a {
            if steps == 0 {
                return Err("Current profile steps must be positive".to_string());
            }
        }
        let currents = self.scan.currents();
        if currents.is_empty() {
            return Err("Current sequence is empty".to_string());
        }
        if currents.iter().any(|c| !c.is_finite() || *c < 0.0) {
            return Err("Currents must be finite and non-negative".to_string());
        }
        if let Some(pair) = currents.windows(2).find(|w| w[1] <= w[0]) {
            return Err(format!(
                "Current sequence must be strictly ascending ({} A followed by {} A)",
                pair[0], pair[1]
            ));
        }

        if self.scan.temperature_tolerance_c <= 0.0 {
            return Err("temperature_tolerance_c must be positive".to_string());
        }
        if self.scan.gaus_min >= self.scan.gaus_max {
            return Err(format!(
                "gaus_min ({}) must be below gaus_max ({})",
                self.scan.gaus_min, self.scan.gaus_max
            ));
        }

        if self.grid.number_of_chips == 0 || self.grid.outputs_per_chip == 0 {
            return Err("Grid must contain at least one chip and one output".to_string());
        }

        if self.sweep.start_wavelength_nm >= self.sweep.stop_wavelength_nm {
            return Err(format!(
                "start_wavelength_nm ({}) must be below stop_wavelength_nm ({})",
                self.sweep.start_wavelength_nm, self.sweep.stop_wavelength_nm
            ));
        }
        if self.active_routing().is_none() {
            return Err(format!("No routing configured for band {}", self.sweep.band));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Settings {
        Settings::default()
    }

    #[test]
    fn test_defaults_validate() {
        let settings = valid();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.scan.currents().len(), 8);
        assert_eq!(settings.timing.current_settle, Duration::from_secs(20));
        assert_eq!(settings.timing.row_settle, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = valid();
        settings.application.log_level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_non_ascending_currents_rejected() {
        let mut settings = valid();
        settings.scan.currents_a = CurrentProfile::List(vec![0.08, 0.09, 0.09]);
        let err = settings.validate().unwrap_err();
        assert!(err.contains("ascending"), "{err}");

        settings.scan.currents_a = CurrentProfile::List(vec![]);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_empty_grid_rejected() {
        let mut settings = valid();
        settings.grid.outputs_per_chip = 0;
        assert!(settings.validate().is_err());

        let mut settings = valid();
        settings.grid.number_of_chips = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_inverted_gaussian_bounds_rejected() {
        let mut settings = valid();
        settings.scan.gaus_min = 8.0;
        settings.scan.gaus_max = 2.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_missing_band_routing_rejected() {
        let mut settings = valid();
        settings.routing.remove(&WavelengthBand::B1500To1630);
        let err = settings.validate().unwrap_err();
        assert!(err.contains("1500_1630"), "{err}");
    }

    #[test]
    fn test_inverted_wavelengths_rejected() {
        let mut settings = valid();
        settings.sweep.start_wavelength_nm = 1630.0;
        settings.sweep.stop_wavelength_nm = 1500.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_sqrt_profile_expansion() {
        let profile = CurrentProfile::Sqrt {
            min_a: 0.0,
            max_a: 0.1,
            steps: 5,
        };
        let values = profile.values();
        assert_eq!(values.len(), 5);
        assert_eq!(values[0], 0.0);
        assert!((values[1] - 0.05).abs() < 1e-12);
        assert!((values[4] - 0.1).abs() < 1e-12);
        assert!(values.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_load_from_toml_string() {
        let settings = Settings::from_toml_str(
            r#"
            [application]
            name = "bench"
            log_level = "debug"
            log_format = "json"

            [scan]
            currents_a = { min_a = 0.08, max_a = 0.09, steps = 3 }
            coupling_scan = "2d"
            gaus_min = 2.0
            gaus_max = 8.0

            [sweep]
            band = "1260_1360"

            [routing.1260_1360]
            te = [7, 8]
            tm = [9, 10]

            [grid]
            number_of_chips = 2
            outputs_per_chip = 6

            [timing]
            current_settle = "2s"
            motion_poll = "50ms"
            "#,
        )
        .unwrap();

        assert_eq!(settings.application.log_format, LogFormat::Json);
        assert_eq!(settings.scan.coupling_scan, ScanType::TwoD);
        assert!(matches!(settings.scan.currents_a, CurrentProfile::List(ref v) if v.len() == 3));
        assert_eq!(
            settings.active_routing().unwrap().ports(Polarization::TM),
            (9, 10)
        );
        assert_eq!(settings.grid.outputs_per_chip, 6);
        assert_eq!(settings.timing.current_settle, Duration::from_secs(2));
        assert_eq!(settings.timing.motion_poll, Duration::from_millis(50));
        assert_eq!(settings.timing.temperature_poll, Duration::from_secs(10));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        std::fs::write(&path, "[storage]\noutput_dir = \"/tmp/records\"\n").unwrap();

        let settings = Settings::load_validated(&path).unwrap();
        assert_eq!(settings.storage.output_dir, PathBuf::from("/tmp/records"));
        assert_eq!(settings.routing.len(), 3);
    }

    #[test]
    fn test_resolved_settings_reload() {
        let mut settings = valid();
        settings.scan.coupling_scan = ScanType::TwoD;
        settings.timing.row_settle = Duration::from_millis(300);

        let text = settings.to_toml_string().unwrap();
        assert!(text.contains("[routing.1350_1510]"), "{text}");

        let reloaded = Settings::from_toml_str(&text).unwrap();
        assert_eq!(reloaded.scan.currents(), settings.scan.currents());
        assert_eq!(reloaded.scan.coupling_scan, ScanType::TwoD);
        assert_eq!(reloaded.routing, settings.routing);
        assert_eq!(reloaded.timing.row_settle, Duration::from_millis(300));
    }
}
