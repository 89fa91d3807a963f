//! # Waveguide DAQ Core Library
//!
//! Automated characterization of photonic waveguide chips. The crate sweeps a
//! drive current, holds the chip temperature, confirms fiber-to-chip coupling
//! with a Gaussian fit, steps the fiber stages across a chip/output grid and
//! records TE/TM insertion-loss sweeps at every site.
//!
//! ## Crate Structure
//!
//! - **`analysis`**: Levenberg–Marquardt Gaussian fitting and the power-monitor
//!   calibration.
//! - **`config`**: Settings loaded with Figment from TOML plus environment
//!   overrides. See `config::Settings`.
//! - **`data`**: Per-site JSON measurement records.
//! - **`error`**: The `DaqError` enum shared by every layer.
//! - **`experiment`**: The measurement control loop: pause/stop signaling,
//!   notifications, the scan scheduler and the run supervisor.
//! - **`hardware`**: Capability traits for the bench instruments plus a
//!   simulated bench.
//! - **`logging`**: `tracing` subscriber setup.

pub mod analysis;
pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
