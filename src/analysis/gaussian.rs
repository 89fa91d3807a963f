//! Gaussian beam-profile models and a Levenberg-Marquardt fitter.
//!
//! The fitter minimizes the sum of squared residuals between sampled linear
//! power and a parametric model. Jacobians are taken by central differences,
//! the damped normal equations are solved with a truncated SVD from
//! `nalgebra` so that unidentifiable directions (the rotation of a circular
//! beam) get a zero step instead of a blow-up.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const LAMBDA_INITIAL: f64 = 1e-3;
const LAMBDA_MIN: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e16;
const SINGULAR_CUTOFF: f64 = 1e-12;

/// Reasons a fit can fail. Any of these counts as a failed coupling check.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    /// Fewer samples than free parameters.
    #[error("{points} samples cannot constrain {parameters} parameters")]
    InsufficientData {
        /// Number of samples supplied.
        points: usize,
        /// Number of model parameters.
        parameters: usize,
    },

    /// Sample coordinates and values differ in length.
    #[error("{coordinates} coordinates but {values} values")]
    LengthMismatch {
        /// Number of coordinates.
        coordinates: usize,
        /// Number of values.
        values: usize,
    },

    /// A sample or the model evaluated at the initial guess is NaN or infinite.
    #[error("non-finite sample or model value")]
    NonFiniteData,

    /// Iteration budget exhausted before the step or cost settled.
    #[error("fit did not converge after {iterations} iterations")]
    NotConverged {
        /// Iterations performed.
        iterations: usize,
    },
}

/// Tuning knobs for [`fit_gaussian_1d`] and [`fit_gaussian_2d`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitOptions {
    /// Maximum number of accepted-or-rejected outer iterations.
    pub max_iterations: usize,
    /// Relative cost reduction below which the fit is considered settled.
    pub ftol: f64,
    /// Relative step size below which the fit is considered settled.
    pub xtol: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iterations: 800,
            ftol: 1e-12,
            xtol: 1e-10,
        }
    }
}

// =============================================================================
// 1-D model
// =============================================================================

/// `a * exp(-(x - x0)^2 / (2 sigma^2))`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gaussian1D {
    /// Peak amplitude `a`.
    pub amplitude: f64,
    /// Center `x0`.
    pub center: f64,
    /// Width `sigma`. The sign is not constrained; use `sigma.abs()`.
    pub sigma: f64,
}

impl Gaussian1D {
    /// Starting point used by the coupling check: a=0.01, x0=5, sigma=4.
    pub const INITIAL_GUESS: Gaussian1D = Gaussian1D {
        amplitude: 0.01,
        center: 5.0,
        sigma: 4.0,
    };

    /// Evaluate the profile at `x`.
    #[must_use]
    pub fn evaluate(&self, x: f64) -> f64 {
        let dx = x - self.center;
        self.amplitude * (-(dx * dx) / (2.0 * self.sigma * self.sigma)).exp()
    }

    /// Parameters in `[a, x0, sigma]` order.
    #[must_use]
    pub fn params(&self) -> Vec<f64> {
        vec![self.amplitude, self.center, self.sigma]
    }

    fn from_params(p: &[f64]) -> Self {
        Self {
            amplitude: p[0],
            center: p[1],
            sigma: p[2],
        }
    }
}

/// Fit a [`Gaussian1D`] to `(x, y)` samples starting from `guess`.
pub fn fit_gaussian_1d(
    x: &[f64],
    y: &[f64],
    guess: Gaussian1D,
    options: &FitOptions,
) -> Result<Gaussian1D, FitError> {
    if x.len() != y.len() {
        return Err(FitError::LengthMismatch {
            coordinates: x.len(),
            values: y.len(),
        });
    }
    let fitted = levenberg_marquardt(
        |p, i| Gaussian1D::from_params(p).evaluate(x[i]),
        y,
        &guess.params(),
        options,
    )?;
    Ok(Gaussian1D::from_params(&fitted))
}

// =============================================================================
// Rotated 2-D model
// =============================================================================

/// Rotated elliptical Gaussian with constant background.
///
/// `offset + A * exp(-(a dx^2 + 2 b dx dy + c dy^2))` where `a`, `b`, `c`
/// are derived from `sigma_x`, `sigma_y` and `theta`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gaussian2D {
    /// Peak amplitude above the background.
    pub amplitude: f64,
    /// Horizontal center.
    pub x0: f64,
    /// Vertical center.
    pub y0: f64,
    /// Width along the rotated x axis.
    pub sigma_x: f64,
    /// Width along the rotated y axis.
    pub sigma_y: f64,
    /// Rotation in radians.
    pub theta: f64,
    /// Constant background.
    pub offset: f64,
}

impl Gaussian2D {
    /// Initial guess derived from the samples: peak value, mean coordinates,
    /// widths 3/3, no rotation and the smallest sample as background.
    #[must_use]
    pub fn guess_from_samples(points: &[(f64, f64)], values: &[f64]) -> Self {
        let n = points.len().max(1) as f64;
        let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
        let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        Self {
            amplitude: max,
            x0: mean_x,
            y0: mean_y,
            sigma_x: 3.0,
            sigma_y: 3.0,
            theta: 0.0,
            offset: min,
        }
    }

    /// Evaluate the profile at `(x, y)`.
    #[must_use]
    pub fn evaluate(&self, x: f64, y: f64) -> f64 {
        let (sin_t, cos_t) = self.theta.sin_cos();
        let sin_2t = (2.0 * self.theta).sin();
        let sx2 = self.sigma_x * self.sigma_x;
        let sy2 = self.sigma_y * self.sigma_y;
        let a = cos_t * cos_t / (2.0 * sx2) + sin_t * sin_t / (2.0 * sy2);
        let b = -sin_2t / (4.0 * sx2) + sin_2t / (4.0 * sy2);
        let c = sin_t * sin_t / (2.0 * sx2) + cos_t * cos_t / (2.0 * sy2);
        let dx = x - self.x0;
        let dy = y - self.y0;
        self.offset + self.amplitude * (-(a * dx * dx + 2.0 * b * dx * dy + c * dy * dy)).exp()
    }

    /// Parameters in `[A, x0, y0, sigma_x, sigma_y, theta, offset]` order.
    #[must_use]
    pub fn params(&self) -> Vec<f64> {
        vec![
            self.amplitude,
            self.x0,
            self.y0,
            self.sigma_x,
            self.sigma_y,
            self.theta,
            self.offset,
        ]
    }

    fn from_params(p: &[f64]) -> Self {
        Self {
            amplitude: p[0],
            x0: p[1],
            y0: p[2],
            sigma_x: p[3],
            sigma_y: p[4],
            theta: p[5],
            offset: p[6],
        }
    }
}

/// Fit a [`Gaussian2D`] to scattered `(x, y) -> value` samples.
pub fn fit_gaussian_2d(
    points: &[(f64, f64)],
    values: &[f64],
    guess: Gaussian2D,
    options: &FitOptions,
) -> Result<Gaussian2D, FitError> {
    if points.len() != values.len() {
        return Err(FitError::LengthMismatch {
            coordinates: points.len(),
            values: values.len(),
        });
    }
    let fitted = levenberg_marquardt(
        |p, i| {
            let (x, y) = points[i];
            Gaussian2D::from_params(p).evaluate(x, y)
        },
        values,
        &guess.params(),
        options,
    )?;
    Ok(Gaussian2D::from_params(&fitted))
}

// =============================================================================
// Solver
// =============================================================================

fn residuals<F>(model: &F, targets: &[f64], params: &DVector<f64>) -> DVector<f64>
where
    F: Fn(&[f64], usize) -> f64,
{
    let p = params.as_slice();
    DVector::from_iterator(
        targets.len(),
        targets.iter().enumerate().map(|(i, y)| y - model(p, i)),
    )
}

/// Model derivatives `d f_i / d p_j` by central differences.
fn jacobian<F>(model: &F, n: usize, params: &DVector<f64>) -> DMatrix<f64>
where
    F: Fn(&[f64], usize) -> f64,
{
    let m = params.len();
    let step_scale = f64::EPSILON.cbrt();
    let mut jac = DMatrix::<f64>::zeros(n, m);
    let mut forward = params.clone();
    let mut backward = params.clone();
    for j in 0..m {
        let h = step_scale * params[j].abs().max(1.0);
        forward[j] = params[j] + h;
        backward[j] = params[j] - h;
        for i in 0..n {
            jac[(i, j)] =
                (model(forward.as_slice(), i) - model(backward.as_slice(), i)) / (2.0 * h);
        }
        forward[j] = params[j];
        backward[j] = params[j];
    }
    jac
}

fn levenberg_marquardt<F>(
    model: F,
    targets: &[f64],
    initial: &[f64],
    options: &FitOptions,
) -> Result<Vec<f64>, FitError>
where
    F: Fn(&[f64], usize) -> f64,
{
    let n = targets.len();
    let m = initial.len();
    if n < m {
        return Err(FitError::InsufficientData {
            points: n,
            parameters: m,
        });
    }
    if targets.iter().any(|y| !y.is_finite()) || initial.iter().any(|p| !p.is_finite()) {
        return Err(FitError::NonFiniteData);
    }

    let mut params = DVector::from_column_slice(initial);
    let mut resid = residuals(&model, targets, &params);
    let mut cost = resid.norm_squared();
    if !cost.is_finite() {
        return Err(FitError::NonFiniteData);
    }

    let mut lambda = LAMBDA_INITIAL;
    for _ in 0..options.max_iterations {
        if cost == 0.0 {
            return Ok(params.as_slice().to_vec());
        }
        let jac = jacobian(&model, n, &params);
        let jt = jac.transpose();
        let normal = &jt * &jac;
        let gradient = &jt * &resid;
        let max_diag = (0..m).map(|k| normal[(k, k)]).fold(0.0, f64::max);
        let diag_floor = (max_diag * 1e-12).max(f64::MIN_POSITIVE);

        // Raise damping until the step reduces the cost.
        loop {
            let mut damped = normal.clone();
            for k in 0..m {
                damped[(k, k)] += lambda * normal[(k, k)].max(diag_floor);
            }
            let svd = damped.svd(true, true);
            let cutoff = svd.singular_values.max() * SINGULAR_CUTOFF;
            if let Ok(step) = svd.solve(&gradient, cutoff) {
                let candidate = &params + &step;
                let candidate_resid = residuals(&model, targets, &candidate);
                let candidate_cost = candidate_resid.norm_squared();
                if candidate_cost.is_finite() && candidate_cost <= cost {
                    // Only trust a plateau or a tiny step when it is close to
                    // Gauss-Newton; heavily damped steps are always small.
                    let settled = lambda <= LAMBDA_INITIAL
                        && (cost - candidate_cost <= options.ftol * cost
                            || step.norm() <= options.xtol * (candidate.norm() + options.xtol));
                    params = candidate;
                    resid = candidate_resid;
                    cost = candidate_cost;
                    lambda = (lambda / 10.0).max(LAMBDA_MIN);
                    if settled {
                        return Ok(params.as_slice().to_vec());
                    }
                    break;
                }
            }
            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                // No descent direction left: local minimum.
                return Ok(params.as_slice().to_vec());
            }
        }
    }

    Err(FitError::NotConverged {
        iterations: options.max_iterations,
    })
}
