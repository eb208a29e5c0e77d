//! Adaptive integration of `dx/dt = f(t, x)`.
//!
//! [`integrate`] advances a [`VectorField`] from `t0` to `tf` (either direction) with local
//! error control and records every accepted step together with its derivative, which gives
//! a piecewise cubic Hermite interpolant of the same order as the step data.
//!
//! # Step control
//!
//! A step is accepted when the RMS of `err_i / (atol + rtol * max(|y_i|, |y_new_i|))` is at
//! most one. The next step size is `h * 0.9 * err^(-1/(q+1))`, clamped to `[0.2, 10] * h`,
//! where `q` is the order of the error estimate. Rejected steps never grow the step, and the
//! last step is clipped to land exactly on `tf`.
//!
//! # Example
//! ```
//! use odejit::integrate::{integrate, FnField, IntegratorOptions};
//!
//! // y' = -y
//! let field = FnField::new(1, |_t: f64, y: &[f64], dy: &mut [f64]| dy[0] = -y[0]);
//! let trajectory = integrate(&field, 0.0, 1.0, &[1.0], &IntegratorOptions::default()).unwrap();
//!
//! let y1 = trajectory.y.last().unwrap()[0];
//! assert!((y1 - (-1.0f64).exp()).abs() < 1e-6);
//! ```

mod dopri5;
mod options;
mod rosenbrock;

pub use options::{IntegratorOptions, Method};

use log::{debug, info};

use crate::errors::IntegrationError;

/// Right-hand side of a first-order system.
pub trait VectorField {
    /// Number of state coordinates.
    fn dimension(&self) -> usize;

    /// Writes `f(t, x)` into `out`.
    fn rhs(&self, t: f64, x: &[f64], out: &mut [f64]);

    /// Writes the row-major Jacobian `∂f_i/∂x_j` into `out` and returns `true`, or returns
    /// `false` when no analytic Jacobian is available.
    fn jacobian(&self, _t: f64, _x: &[f64], _out: &mut [f64]) -> bool {
        false
    }

    fn has_jacobian(&self) -> bool {
        false
    }
}

/// A [`VectorField`] backed by a closure.
pub struct FnField<F> {
    dimension: usize,
    f: F,
}

impl<F> FnField<F>
where
    F: Fn(f64, &[f64], &mut [f64]),
{
    pub fn new(dimension: usize, f: F) -> Self {
        Self { dimension, f }
    }
}

impl<F> VectorField for FnField<F>
where
    F: Fn(f64, &[f64], &mut [f64]),
{
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn rhs(&self, t: f64, x: &[f64], out: &mut [f64]) {
        (self.f)(t, x, out)
    }
}

/// Counters collected during one integration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntegrationStats {
    pub rhs_evals: usize,
    pub jacobian_evals: usize,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub lu_decompositions: usize,
    /// Time at which `Method::Auto` switched to the stiff method
    pub stiffness_switch: Option<f64>,
}

/// Accepted steps of an integration.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    /// Time points, from `t0` to `tf` (decreasing when integrating backward)
    pub t: Vec<f64>,
    /// State at every time point
    pub y: Vec<Vec<f64>>,
    /// `f(t, y)` at every time point
    pub dy: Vec<Vec<f64>>,
    pub stats: IntegrationStats,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    /// `(min, max)` of the covered time range.
    pub fn span(&self) -> (f64, f64) {
        let first = self.t.first().copied().unwrap_or(0.0);
        let last = self.t.last().copied().unwrap_or(first);
        (first.min(last), first.max(last))
    }

    /// Cubic Hermite interpolation of coordinate `index` at `t`.
    ///
    /// Returns `None` outside the covered range.
    pub fn interpolate(&self, t: f64, index: usize) -> Option<f64> {
        let (lo, hi) = self.span();
        if !(lo..=hi).contains(&t) || self.is_empty() {
            return None;
        }
        if self.len() == 1 {
            return self.y[0].get(index).copied();
        }

        let forward = self.t[self.len() - 1] >= self.t[0];
        // First time point strictly past `t` in integration direction
        let upper = self
            .t
            .partition_point(|&ti| if forward { ti <= t } else { ti >= t })
            .clamp(1, self.len() - 1);
        let a = upper - 1;

        let (ta, tb) = (self.t[a], self.t[upper]);
        let h = tb - ta;
        let s = (t - ta) / h;
        let (s2, s3) = (s * s, s * s * s);
        let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
        let h10 = s3 - 2.0 * s2 + s;
        let h01 = -2.0 * s3 + 3.0 * s2;
        let h11 = s3 - s2;

        Some(
            h00 * self.y[a].get(index)?
                + h10 * h * self.dy[a].get(index)?
                + h01 * self.y[upper].get(index)?
                + h11 * h * self.dy[upper].get(index)?,
        )
    }

    /// Interpolated state at `t`.
    pub fn state_at(&self, t: f64) -> Option<Vec<f64>> {
        let n = self.y.first()?.len();
        (0..n).map(|i| self.interpolate(t, i)).collect()
    }
}

/// Tolerances of the local error test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Tolerance {
    pub rtol: f64,
    pub atol: f64,
}

impl Tolerance {
    /// RMS of the error scaled by `atol + rtol * max(|y|, |y_new|)`.
    fn error_norm(&self, err: &[f64], y: &[f64], y_new: &[f64]) -> f64 {
        if err.is_empty() {
            return 0.0;
        }
        let sum: f64 = err
            .iter()
            .zip(y.iter().zip(y_new))
            .map(|(e, (a, b))| {
                let scale = self.atol + self.rtol * a.abs().max(b.abs());
                (e / scale).powi(2)
            })
            .sum();
        (sum / err.len() as f64).sqrt()
    }

    fn rms_scaled(&self, v: &[f64], y: &[f64]) -> f64 {
        self.error_norm(v, y, y)
    }
}

/// Result of one attempted step.
pub(crate) struct Attempt {
    y: Vec<f64>,
    /// `f(t + h, y)`
    dy: Vec<f64>,
    error: f64,
    /// Estimate of `|h λ|` for the dominant eigenvalue, explicit methods only
    stiffness: Option<f64>,
}

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;
const STIFF_THRESHOLD: f64 = 3.25;
const STIFF_STEPS: usize = 15;
const NONSTIFF_RESET: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Active {
    Explicit,
    Implicit,
}

/// Hairer's stiffness detection: `STIFF_STEPS` accepted steps with `|h λ|` above the
/// stability threshold, not interrupted by `NONSTIFF_RESET` consecutive non-stiff ones.
#[derive(Default)]
struct StiffnessDetector {
    stiff: usize,
    nonstiff: usize,
}

impl StiffnessDetector {
    fn update(&mut self, indicator: Option<f64>) -> bool {
        match indicator {
            Some(hl) if hl > STIFF_THRESHOLD => {
                self.nonstiff = 0;
                self.stiff += 1;
                self.stiff >= STIFF_STEPS
            }
            Some(_) => {
                self.nonstiff += 1;
                if self.nonstiff >= NONSTIFF_RESET {
                    self.stiff = 0;
                }
                false
            }
            None => false,
        }
    }
}

/// Integrates `field` from `t0` to `tf` starting at `y0`.
///
/// # Errors
/// - [`IntegrationError::StepSizeUnderflow`] when the step size drops below `min_step`
/// - [`IntegrationError::MaxStepsExceeded`] after `max_steps` attempted steps
/// - [`IntegrationError::NonFiniteState`] when the state or its derivative is not finite
/// - [`IntegrationError::SingularMatrix`] when the implicit iteration matrix is singular
/// - [`IntegrationError::InvalidOptions`] for inconsistent options or a wrong `y0` length
pub fn integrate(
    field: &dyn VectorField,
    t0: f64,
    tf: f64,
    y0: &[f64],
    options: &IntegratorOptions,
) -> Result<Trajectory, IntegrationError> {
    options.validate()?;
    if y0.len() != field.dimension() {
        return Err(IntegrationError::InvalidOptions(format!(
            "initial state has {} values for a system of dimension {}",
            y0.len(),
            field.dimension()
        )));
    }
    if !t0.is_finite() || !tf.is_finite() {
        return Err(IntegrationError::InvalidOptions(
            "time span must be finite".to_string(),
        ));
    }

    let tolerance = Tolerance {
        rtol: options.rtol,
        atol: options.atol,
    };
    let mut stats = IntegrationStats::default();
    let n = y0.len();
    let direction = if tf >= t0 { 1.0 } else { -1.0 };

    let mut t = t0;
    let mut y = y0.to_vec();
    let mut dy = vec![0.0; n];
    field.rhs(t, &y, &mut dy);
    stats.rhs_evals += 1;
    if !all_finite(&y) || !all_finite(&dy) {
        return Err(IntegrationError::NonFiniteState { t });
    }

    let mut times = vec![t];
    let mut states = vec![y.clone()];
    let mut derivatives = vec![dy.clone()];

    let mut active = match options.method {
        Method::Rosenbrock23 => Active::Implicit,
        Method::Dopri5 | Method::Auto => Active::Explicit,
    };
    let may_switch = options.method == Method::Auto && field.has_jacobian();
    let mut detector = StiffnessDetector::default();

    let span = (tf - t0).abs();
    let mut h = match options.first_step {
        Some(h) => h.abs(),
        None => initial_step(field, t0, &y, &dy, direction, order(active), tolerance, &mut stats),
    }
    .min(options.max_step)
    .min(span);
    let mut last_rejected = false;

    debug!(
        "integrating dimension {n} from {t0} to {tf} with {:?}, h0 = {h:e}",
        options.method
    );

    while (tf - t) * direction > 0.0 {
        if stats.accepted_steps + stats.rejected_steps >= options.max_steps {
            return Err(IntegrationError::MaxStepsExceeded {
                t,
                max_steps: options.max_steps,
            });
        }

        let remaining = (tf - t).abs();
        let last = h >= remaining;
        let step = if last { remaining } else { h };

        let attempt = match active {
            Active::Explicit => {
                dopri5::step(field, t, &y, &dy, direction * step, tolerance, &mut stats)
            }
            Active::Implicit => {
                rosenbrock::step(field, t, &y, &dy, direction * step, tolerance, &mut stats)?
            }
        };
        let q = order(active) as f64;

        if attempt.error.is_finite() && attempt.error <= 1.0 {
            t = if last { tf } else { t + direction * step };
            y = attempt.y;
            dy = attempt.dy;
            if !all_finite(&y) || !all_finite(&dy) {
                return Err(IntegrationError::NonFiniteState { t });
            }
            stats.accepted_steps += 1;
            times.push(t);
            states.push(y.clone());
            derivatives.push(dy.clone());

            if may_switch && active == Active::Explicit && detector.update(attempt.stiffness) {
                info!("problem appears stiff at t = {t}, switching to Rosenbrock23");
                active = Active::Implicit;
                stats.stiffness_switch = Some(t);
            }

            let mut factor = if attempt.error == 0.0 {
                MAX_FACTOR
            } else {
                (SAFETY * attempt.error.powf(-1.0 / (q + 1.0))).clamp(MIN_FACTOR, MAX_FACTOR)
            };
            if last_rejected {
                factor = factor.min(1.0);
            }
            last_rejected = false;
            h = (step * factor).min(options.max_step);
        } else {
            stats.rejected_steps += 1;
            let factor = if attempt.error.is_finite() {
                (SAFETY * attempt.error.powf(-1.0 / (q + 1.0))).clamp(MIN_FACTOR, 1.0)
            } else {
                MIN_FACTOR
            };
            last_rejected = true;
            h = step * factor;
            if h < options.min_step {
                return Err(IntegrationError::StepSizeUnderflow { t, h });
            }
        }
    }

    debug!(
        "integration finished: {} accepted, {} rejected, {} rhs evaluations",
        stats.accepted_steps, stats.rejected_steps, stats.rhs_evals
    );
    Ok(Trajectory {
        t: times,
        y: states,
        dy: derivatives,
        stats,
    })
}

fn order(active: Active) -> usize {
    match active {
        Active::Explicit => Method::Dopri5.error_order(),
        Active::Implicit => Method::Rosenbrock23.error_order(),
    }
}

fn all_finite(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite())
}

/// Initial step size of Hairer, Nørsett and Wanner (Solving ODEs I, II.4).
#[allow(clippy::too_many_arguments)]
fn initial_step(
    field: &dyn VectorField,
    t0: f64,
    y0: &[f64],
    f0: &[f64],
    direction: f64,
    order: usize,
    tolerance: Tolerance,
    stats: &mut IntegrationStats,
) -> f64 {
    let d0 = tolerance.rms_scaled(y0, y0);
    let d1 = tolerance.rms_scaled(f0, y0);
    let h0 = if d0 < 1e-5 || d1 < 1e-5 {
        1e-6
    } else {
        0.01 * d0 / d1
    };

    let y1: Vec<f64> = y0
        .iter()
        .zip(f0)
        .map(|(y, f)| y + direction * h0 * f)
        .collect();
    let mut f1 = vec![0.0; y0.len()];
    field.rhs(t0 + direction * h0, &y1, &mut f1);
    stats.rhs_evals += 1;

    let diff: Vec<f64> = f1.iter().zip(f0).map(|(a, b)| a - b).collect();
    let d2 = tolerance.rms_scaled(&diff, y0) / h0;

    let h1 = if d1.max(d2) <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(1.0 / (order as f64 + 1.0))
    };
    let h = (100.0 * h0).min(h1);
    if h.is_finite() && h > 0.0 {
        h
    } else {
        1e-6
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn oscillator() -> FnField<impl Fn(f64, &[f64], &mut [f64])> {
        FnField::new(2, |_t: f64, y: &[f64], dy: &mut [f64]| {
            dy[0] = y[1];
            dy[1] = -y[0];
        })
    }

    /// y' = -k (y - cos t), stiff for large k, with an analytic Jacobian
    struct Stiff {
        k: f64,
    }

    impl VectorField for Stiff {
        fn dimension(&self) -> usize {
            1
        }

        fn rhs(&self, t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = -self.k * (x[0] - t.cos());
        }

        fn jacobian(&self, _t: f64, _x: &[f64], out: &mut [f64]) -> bool {
            out[0] = -self.k;
            true
        }

        fn has_jacobian(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_harmonic_oscillator() -> Result<(), Box<dyn std::error::Error>> {
        let options = IntegratorOptions::with_tolerances(1e-9, 1e-12).method(Method::Dopri5);
        let traj = integrate(&oscillator(), 0.0, 2.0 * PI, &[1.0, 0.0], &options)?;

        assert_eq!(traj.t.last().copied(), Some(2.0 * PI));
        let end = traj.y.last().ok_or("empty trajectory")?;
        assert!((end[0] - 1.0).abs() < 1e-7);
        assert!(end[1].abs() < 1e-7);

        // Dense output between grid points
        let mid = traj.interpolate(1.0, 0).ok_or("outside span")?;
        assert!((mid - 1f64.cos()).abs() < 1e-6);
        assert_eq!(traj.interpolate(7.0, 0), None);
        Ok(())
    }

    #[test]
    fn test_backward_integration() -> Result<(), Box<dyn std::error::Error>> {
        let field = FnField::new(1, |_t: f64, y: &[f64], dy: &mut [f64]| dy[0] = y[0]);
        let traj = integrate(&field, 1.0, 0.0, &[1f64.exp()], &IntegratorOptions::default())?;

        assert_eq!(traj.t.last().copied(), Some(0.0));
        assert!(traj.t.windows(2).all(|w| w[1] < w[0]));
        let end = traj.y.last().ok_or("empty trajectory")?[0];
        assert!((end - 1.0).abs() < 1e-5);
        let half = traj.interpolate(0.5, 0).ok_or("outside span")?;
        assert!((half - 0.5f64.exp()).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_empty_span() -> Result<(), Box<dyn std::error::Error>> {
        let traj = integrate(&oscillator(), 2.0, 2.0, &[1.0, 0.0], &IntegratorOptions::default())?;
        assert_eq!(traj.len(), 1);
        assert_eq!(traj.state_at(2.0), Some(vec![1.0, 0.0]));
        Ok(())
    }

    #[test]
    fn test_step_size_underflow() {
        // Bounded right-hand side that jumps at t = 1: every step of at least `min_step`
        // across the jump is rejected.
        let field = FnField::new(1, |t: f64, _y: &[f64], dy: &mut [f64]| {
            dy[0] = if t < 1.0 { -1e3 } else { 1e3 }
        });
        let options = IntegratorOptions::with_tolerances(1e-6, 1e-9)
            .method(Method::Dopri5)
            .min_step(1e-3);
        let err = integrate(&field, 0.0, 2.0, &[0.0], &options).unwrap_err();
        assert!(
            matches!(
                err,
                IntegrationError::StepSizeUnderflow { t, h } if t > 0.9 && t < 1.0 && h < 1e-3
            ),
            "{err}"
        );
    }

    #[test]
    fn test_max_steps() {
        let options = IntegratorOptions::default().max_steps(3).max_step(0.01);
        let err = integrate(&oscillator(), 0.0, 10.0, &[1.0, 0.0], &options).unwrap_err();
        assert!(matches!(err, IntegrationError::MaxStepsExceeded { max_steps: 3, .. }));
    }

    #[test]
    fn test_stiff_switch() -> Result<(), Box<dyn std::error::Error>> {
        let field = Stiff { k: 1e4 };
        let options = IntegratorOptions::with_tolerances(1e-6, 1e-9);

        let auto = integrate(&field, 0.0, 2.0, &[0.0], &options)?;
        assert!(auto.stats.stiffness_switch.is_some());
        assert!(auto.stats.jacobian_evals > 0);

        let explicit = integrate(&field, 0.0, 2.0, &[0.0], &options.clone().method(Method::Dopri5))?;
        assert!(explicit.stats.stiffness_switch.is_none());
        assert!(auto.stats.accepted_steps < explicit.stats.accepted_steps);

        // Both follow the slow manifold y ≈ cos t
        for traj in [&auto, &explicit] {
            let end = traj.y.last().ok_or("empty trajectory")?[0];
            assert!((end - 2f64.cos()).abs() < 1e-3);
        }
        Ok(())
    }

    #[test]
    fn test_rosenbrock_accuracy() -> Result<(), Box<dyn std::error::Error>> {
        let options = IntegratorOptions::with_tolerances(1e-8, 1e-10).method(Method::Rosenbrock23);
        let traj = integrate(&oscillator(), 0.0, PI, &[1.0, 0.0], &options)?;
        let end = traj.y.last().ok_or("empty trajectory")?;
        assert!((end[0] + 1.0).abs() < 1e-5);
        assert!(traj.stats.lu_decompositions > 0);
        Ok(())
    }

    #[test]
    fn test_invalid_inputs() {
        let options = IntegratorOptions::default();
        assert!(matches!(
            integrate(&oscillator(), 0.0, 1.0, &[1.0], &options),
            Err(IntegrationError::InvalidOptions(_))
        ));
        let field = FnField::new(1, |_t: f64, _y: &[f64], dy: &mut [f64]| dy[0] = f64::NAN);
        assert!(matches!(
            integrate(&field, 0.0, 1.0, &[1.0], &options),
            Err(IntegrationError::NonFiniteState { .. })
        ));
    }
}
