//! Signatures of the compiled vector field and Jacobian.

use std::sync::Arc;

/// Vector field `f(t, x, out)`: writes `dx/dt` into `out`.
///
/// Compiled functions hold no mutable state and can be called from many threads at once.
pub type RhsFunction = Arc<dyn Fn(f64, &[f64], &mut [f64]) + Send + Sync>;

/// Jacobian `J(t, x, out)`: writes the row-major `N × N` matrix `∂f_i/∂x_j` into `out`.
pub type JacobianFunction = Arc<dyn Fn(f64, &[f64], &mut [f64]) + Send + Sync>;
