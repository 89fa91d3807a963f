//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the failures that can occur while a characterization run is active,
//! from configuration problems to device faults and curve-fit failures.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically TOML syntax errors or
//!   type mismatches in the settings file.
//! - **`Configuration`**: Semantic validation failures (e.g. a non-ascending
//!   current list) caught by [`crate::config::Settings::validate`].
//! - **`Io`** / **`Serialization`**: Failures while persisting measurement records.
//! - **`Device`**: Any error bubbled up from a capability implementation. Device
//!   drivers speak `anyhow`, the scan loop converts at the boundary.
//! - **`Fit`**: The coupling fit did not converge. The scheduler treats this as a
//!   failed acceptance test rather than a fault.
//! - **`OperatorStop`**: Not a failure. Raised by checkpoints once the operator has
//!   requested a stop so that `?` unwinds the loop in order.
//! - **`RunActive`** / **`NoActiveRun`** / **`NoMotorSelected`**: Control-surface misuse.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types,
//! so the scan loop can use the `?` operator throughout.

use crate::analysis::FitError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the characterization application.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Settings file could not be parsed or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Settings parsed but are semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File system failure (record directory, record file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A device capability returned an error.
    #[error(transparent)]
    Device(#[from] anyhow::Error),

    /// Gaussian fit failed to converge.
    #[error("Fit error: {0}")]
    Fit(#[from] FitError),

    /// The operator requested a stop; the loop unwinds.
    #[error("Stopped by operator")]
    OperatorStop,

    /// A run is already active and the restart was not confirmed.
    #[error("A measurement run is already active; confirm to stop it and start a new one")]
    RunActive,

    /// A control command was issued without an active run.
    #[error("No measurement run is active")]
    NoActiveRun,

    /// A manual correction named no axis.
    #[error("No motor selected")]
    NoMotorSelected,
}

impl DaqError {
    /// Whether this error is the ordered-unwind signal rather than a failure.
    #[must_use]
    pub fn is_stop(&self) -> bool {
        matches!(self, DaqError::OperatorStop)
    }
}
