//! Dormand-Prince 5(4) step with FSAL and the Hairer stiffness indicator.

use super::{Attempt, IntegrationStats, Tolerance, VectorField};

const C2: f64 = 1.0 / 5.0;
const C3: f64 = 3.0 / 10.0;
const C4: f64 = 4.0 / 5.0;
const C5: f64 = 8.0 / 9.0;

const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;
const A71: f64 = 35.0 / 384.0;
const A73: f64 = 500.0 / 1113.0;
const A74: f64 = 125.0 / 192.0;
const A75: f64 = -2187.0 / 6784.0;
const A76: f64 = 11.0 / 84.0;

// Difference between the 5th and 4th order weights
const E1: f64 = 71.0 / 57600.0;
const E3: f64 = -71.0 / 16695.0;
const E4: f64 = 71.0 / 1920.0;
const E5: f64 = -17253.0 / 339200.0;
const E6: f64 = 22.0 / 525.0;
const E7: f64 = -1.0 / 40.0;

/// One attempted step of signed size `h` from `(t, y)`, where `k1 = f(t, y)`.
pub(super) fn step(
    field: &dyn VectorField,
    t: f64,
    y: &[f64],
    k1: &[f64],
    h: f64,
    tolerance: Tolerance,
    stats: &mut IntegrationStats,
) -> Attempt {
    let n = y.len();
    let mut stage = vec![0.0; n];
    let mut k2 = vec![0.0; n];
    let mut k3 = vec![0.0; n];
    let mut k4 = vec![0.0; n];
    let mut k5 = vec![0.0; n];
    let mut k6 = vec![0.0; n];
    let mut k7 = vec![0.0; n];

    for i in 0..n {
        stage[i] = y[i] + h * A21 * k1[i];
    }
    field.rhs(t + C2 * h, &stage, &mut k2);

    for i in 0..n {
        stage[i] = y[i] + h * (A31 * k1[i] + A32 * k2[i]);
    }
    field.rhs(t + C3 * h, &stage, &mut k3);

    for i in 0..n {
        stage[i] = y[i] + h * (A41 * k1[i] + A42 * k2[i] + A43 * k3[i]);
    }
    field.rhs(t + C4 * h, &stage, &mut k4);

    for i in 0..n {
        stage[i] = y[i] + h * (A51 * k1[i] + A52 * k2[i] + A53 * k3[i] + A54 * k4[i]);
    }
    field.rhs(t + C5 * h, &stage, &mut k5);

    for i in 0..n {
        stage[i] = y[i]
            + h * (A61 * k1[i] + A62 * k2[i] + A63 * k3[i] + A64 * k4[i] + A65 * k5[i]);
    }
    field.rhs(t + h, &stage, &mut k6);

    let y_new: Vec<f64> = (0..n)
        .map(|i| {
            y[i] + h * (A71 * k1[i] + A73 * k3[i] + A74 * k4[i] + A75 * k5[i] + A76 * k6[i])
        })
        .collect();
    field.rhs(t + h, &y_new, &mut k7);
    stats.rhs_evals += 6;

    let err: Vec<f64> = (0..n)
        .map(|i| {
            h * (E1 * k1[i] + E3 * k3[i] + E4 * k4[i] + E5 * k5[i] + E6 * k6[i] + E7 * k7[i])
        })
        .collect();
    let error = tolerance.error_norm(&err, y, &y_new);

    // Hairer: |h| * ||k7 - k6|| / ||y_new - stage6|| estimates |h λ| of the dominant
    // eigenvalue; stage6 is still held in `stage`.
    let (num, den) = (0..n).fold((0.0, 0.0), |(num, den), i| {
        (
            num + (k7[i] - k6[i]).powi(2),
            den + (y_new[i] - stage[i]).powi(2),
        )
    });
    let stiffness = (den > 0.0).then(|| h.abs() * (num / den).sqrt());

    Attempt {
        y: y_new,
        dy: k7,
        error,
        stiffness,
    }
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
    fn test_exact_for_polynomials() {
        // y' = 3 t^2 is integrated exactly by a 5th order method
        let field = FnField::new(1, |t: f64, _: &[f64], out: &mut [f64]| out[0] = 3.0 * t * t);
        let mut stats = IntegrationStats::default();
        let attempt = step(&field, 1.0, &[1.0], &[3.0], 0.5, TOLERANCE, &mut stats);
        assert!((attempt.y[0] - 1.5f64.powi(3)).abs() < 1e-12);
        assert!((attempt.dy[0] - 3.0 * 1.5 * 1.5).abs() < 1e-12);
        assert!(attempt.error < 1e-6);
        assert_eq!(stats.rhs_evals, 6);
    }

    #[test]
    fn test_stiffness_indicator() {
        // y' = -1000 y with h = 0.01 gives |h λ| = 10
        let field = FnField::new(1, |_: f64, y: &[f64], out: &mut [f64]| out[0] = -1000.0 * y[0]);
        let mut stats = IntegrationStats::default();
        let attempt = step(&field, 0.0, &[1.0], &[-1000.0], 0.01, TOLERANCE, &mut stats);
        let indicator = attempt.stiffness.unwrap_or(0.0);
        assert!(indicator > 3.25, "indicator {indicator}");
    }
}
