//! Signal analysis for coupling confirmation.
//!
//! - [`gaussian`]: 1-D and rotated 2-D Gaussian models with a
//!   Levenberg-Marquardt least-squares fitter.
//! - Power calibration: the tracking controller reports the detector signal as
//!   a raw reading; the helpers below convert it to dBm and linear power.

pub mod gaussian;

pub use gaussian::{
    fit_gaussian_1d, fit_gaussian_2d, FitError, FitOptions, Gaussian1D, Gaussian2D,
};

/// Raw reading that corresponds to the calibration origin.
pub const READING_OFFSET: f64 = 3.5;
/// Slope of the reading-to-dBm calibration.
pub const DBM_PER_READING: f64 = 22.17647059;
/// Power offset of the reading-to-dBm calibration.
pub const DBM_OFFSET: f64 = 20.1;

/// Convert a raw tracker reading to calibrated optical power in dBm.
///
/// `dBm = (reading - 3.5) * 22.17647059 - 20.1`
#[must_use]
pub fn reading_to_dbm(reading: f64) -> f64 {
    (reading - READING_OFFSET) * DBM_PER_READING - DBM_OFFSET
}

/// Inverse of [`reading_to_dbm`]. Used by the simulated bench.
#[must_use]
pub fn dbm_to_reading(dbm: f64) -> f64 {
    (dbm + DBM_OFFSET) / DBM_PER_READING + READING_OFFSET
}

/// Convert dBm to linear power (mW).
#[must_use]
pub fn dbm_to_linear(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

/// Convert linear power (mW) to dBm.
#[must_use]
pub fn linear_to_dbm(milliwatts: f64) -> f64 {
    10.0 * milliwatts.log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calibration_is_the_fixed_affine_map() {
        for reading in [0.0, 1.25, 3.5, 4.0, 7.75, 10.0] {
            assert_eq!(reading_to_dbm(reading), (reading - 3.5) * 22.17647059 - 20.1);
        }
        assert_eq!(reading_to_dbm(3.5), -20.1);
    }

    #[test]
    fn test_calibration_round_trips_through_reading() {
        let dbm = -12.5;
        assert!((reading_to_dbm(dbm_to_reading(dbm)) - dbm).abs() < 1e-12);
    }

    #[test]
    fn test_linear_scale() {
        assert!((dbm_to_linear(0.0) - 1.0).abs() < 1e-15);
        assert!((dbm_to_linear(-20.0) - 0.01).abs() < 1e-15);
        assert!((linear_to_dbm(0.001) + 30.0).abs() < 1e-12);
    }
}
