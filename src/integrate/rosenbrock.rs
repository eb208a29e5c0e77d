//! Linearly implicit Rosenbrock 2(3) step (the modified Rosenbrock triple of Shampine and
//! Reichelt).
//!
//! With `W = I - h d J` each stage needs one linear solve against the same LU factorization:
//!
//! ```text
//! k1 = W⁻¹ (f0 + h d T)
//! k2 = W⁻¹ (f(t + h/2, y + h/2 k1) - k1) + k1
//! y1 = y + h k2
//! k3 = W⁻¹ (f(t + h, y1) - e32 (k2 - f1) - 2 (k1 - f0) + h d T)
//! err = h/6 (k1 - 2 k2 + k3)
//! ```
//!
//! where `T = ∂f/∂t` is estimated by a forward difference.

use nalgebra::{DMatrix, DVector};

use super::{Attempt, IntegrationStats, Tolerance, VectorField};
use crate::errors::IntegrationError;

const D: f64 = 1.0 / (2.0 + std::f64::consts::SQRT_2);
const E32: f64 = 6.0 + std::f64::consts::SQRT_2;

/// One attempted step of signed size `h` from `(t, y)`, where `f0 = f(t, y)`.
pub(super) fn step(
    field: &dyn VectorField,
    t: f64,
    y: &[f64],
    f0: &[f64],
    h: f64,
    tolerance: Tolerance,
    stats: &mut IntegrationStats,
) -> Result<Attempt, IntegrationError> {
    let n = y.len();
    let jacobian = jacobian(field, t, y, f0, stats);

    // ∂f/∂t by forward difference
    let dt = f64::EPSILON.sqrt() * t.abs().max(h.abs()).max(1.0);
    let mut shifted = vec![0.0; n];
    field.rhs(t + dt, y, &mut shifted);
    stats.rhs_evals += 1;
    let f0 = DVector::from_column_slice(f0);
    let dfdt = (DVector::from_vec(shifted) - &f0) / dt;

    let w = DMatrix::<f64>::identity(n, n) - jacobian * (h * D);
    let lu = w.lu();
    stats.lu_decompositions += 1;
    let solve = |rhs: &DVector<f64>| lu.solve(rhs).ok_or(IntegrationError::SingularMatrix { t });

    let hdt = &dfdt * (h * D);
    let k1 = solve(&(&f0 + &hdt))?;

    let y_half = DVector::from_column_slice(y) + &k1 * (0.5 * h);
    let mut f1 = vec![0.0; n];
    field.rhs(t + 0.5 * h, y_half.as_slice(), &mut f1);
    let f1 = DVector::from_vec(f1);
    let k2 = solve(&(&f1 - &k1))? + &k1;

    let y_new = DVector::from_column_slice(y) + &k2 * h;
    let mut f2 = vec![0.0; n];
    field.rhs(t + h, y_new.as_slice(), &mut f2);
    let f2 = DVector::from_vec(f2);
    stats.rhs_evals += 2;

    let k3 = solve(&(&f2 - (&k2 - &f1) * E32 - (&k1 - &f0) * 2.0 + &hdt))?;
    let err = (&k1 - &k2 * 2.0 + &k3) * (h / 6.0);

    let y_new: Vec<f64> = y_new.iter().copied().collect();
    let error = tolerance.error_norm(err.as_slice(), y, &y_new);
    Ok(Attempt {
        y: y_new,
        dy: f2.iter().copied().collect(),
        error,
        stiffness: None,
    })
}

/// Analytic Jacobian when the field provides one, forward differences otherwise.
fn jacobian(
    field: &dyn VectorField,
    t: f64,
    y: &[f64],
    f0: &[f64],
    stats: &mut IntegrationStats,
) -> DMatrix<f64> {
    let n = y.len();
    let mut entries = vec![0.0; n * n];
    if field.jacobian(t, y, &mut entries) {
        stats.jacobian_evals += 1;
        return DMatrix::from_row_slice(n, n, &entries);
    }

    let mut perturbed = y.to_vec();
    let mut column = vec![0.0; n];
    let mut matrix = DMatrix::zeros(n, n);
    for j in 0..n {
        let delta = f64::EPSILON.sqrt() * y[j].abs().max(1.0);
        perturbed[j] = y[j] + delta;
        field.rhs(t, &perturbed, &mut column);
        perturbed[j] = y[j];
        for i in 0..n {
            matrix[(i, j)] = (column[i] - f0[i]) / delta;
        }
    }
    stats.rhs_evals += n;
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrate::FnField;

    const TOLERANCE: Tolerance = Tolerance {
        rtol: 1e-6,
        atol: 1e-9,
    };

    #[test]
    fn test_linear_decay_step() -> Result<(), Box<dyn std::error::Error>> {
        let field = FnField::new(1, |_: f64, y: &[f64], out: &mut [f64]| out[0] = -y[0]);
        let mut stats = IntegrationStats::default();
        let attempt = step(&field, 0.0, &[1.0], &[-1.0], 0.01, TOLERANCE, &mut stats)?;
        assert!((attempt.y[0] - (-0.01f64).exp()).abs() < 1e-6);
        assert_eq!(stats.lu_decompositions, 1);
        // One column of finite differences, one time shift, two stages
        assert_eq!(stats.rhs_evals, 4);
        Ok(())
    }

    #[test]
    fn test_stable_for_stiff_steps() -> Result<(), Box<dyn std::error::Error>> {
        // A step far beyond the explicit stability limit stays bounded
        let field = FnField::new(1, |_: f64, y: &[f64], out: &mut [f64]| out[0] = -1e4 * y[0]);
        let mut stats = IntegrationStats::default();
        let attempt = step(&field, 0.0, &[1.0], &[-1e4], 0.1, TOLERANCE, &mut stats)?;
        assert!(attempt.y[0].abs() < 1.0);
        Ok(())
    }
}
