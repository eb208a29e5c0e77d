//! Solution accessors.
//!
//! A [`Solution`] owns the accepted steps of one integration together with the compiled
//! system and the [`StateMap`] that produced them. Rows of the trajectory are looked up by
//! term: a scalar or a component yields one row, a whole vector one row per component.
//! Point evaluation interpolates with cubic Hermite polynomials between accepted steps and
//! fails outside the integrated span.
//!
//! The symbolic path returns a [`ClosedFormSolution`] instead.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::errors::OdeError;
use crate::expr::{Expr, Wrt};
use crate::integrate::{IntegrationStats, Trajectory};
use crate::state::StateMap;
use crate::symbols::Term;
use crate::system::CompiledSystem;
use crate::types::{JacobianFunction, RhsFunction};

/// Numerically integrated trajectory.
#[derive(Debug, Clone)]
pub struct Solution {
    trajectory: Trajectory,
    /// State-major copy of the trajectory, `N × T`
    rows: Vec<Vec<f64>>,
    system: CompiledSystem,
}

/// The first-order system behind a [`Solution`].
pub struct FirstOrderView<'a> {
    /// `f(t, x)`
    pub f: &'a RhsFunction,
    /// `J(t, x)`, row-major
    pub jacobian: Option<&'a JacobianFunction>,
    pub x0: &'a [f64],
    pub t0: f64,
    pub state_map: &'a StateMap,
}

impl Solution {
    pub(crate) fn new(system: CompiledSystem, trajectory: Trajectory) -> Self {
        let rows = (0..system.dimension())
            .map(|i| trajectory.y.iter().map(|state| state[i]).collect())
            .collect();
        Self {
            trajectory,
            rows,
            system,
        }
    }

    /// Time grid, in integration order.
    pub fn t(&self) -> &[f64] {
        &self.trajectory.t
    }

    /// Raw state trajectory, one row per state coordinate.
    pub fn y(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn stats(&self) -> &IntegrationStats {
        &self.trajectory.stats
    }

    pub fn state_map(&self) -> &StateMap {
        self.system.state_map()
    }

    pub fn system(&self) -> &CompiledSystem {
        &self.system
    }

    /// Rows stored for `term`: one for scalars and components, one per component for
    /// whole vectors.
    ///
    /// # Errors
    /// - [`OdeError::LevelOutOfRange`] when `term.level` is not below the variable's order
    /// - [`OdeError::ComponentOutOfRange`] for a component outside the shape
    /// - [`OdeError::UnknownVariable`] for a variable that is not part of the system
    pub fn rows(&self, term: impl Into<Term>) -> Result<Vec<&[f64]>, OdeError> {
        let slots = self.state_map().slots_for(&term.into())?;
        Ok(slots.into_iter().map(|i| self.rows[i].as_slice()).collect())
    }

    /// The single row stored for a scalar variable or a vector component.
    pub fn row(&self, term: impl Into<Term>) -> Result<&[f64], OdeError> {
        let term = term.into();
        let mut rows = self.rows(term)?;
        match rows.len() {
            1 => Ok(rows.remove(0)),
            got => Err(OdeError::ShapeMismatch {
                variable: self.name_of(&term),
                expected: 1,
                got,
            }),
        }
    }

    /// Interpolated value of `term` at `t`, one entry per component.
    ///
    /// # Errors
    /// Besides the errors of [`rows`](Self::rows), returns [`OdeError::TimeOutOfRange`] when
    /// `t` lies outside the integrated span.
    pub fn eval(&self, term: impl Into<Term>, t: f64) -> Result<Vec<f64>, OdeError> {
        let slots = self.state_map().slots_for(&term.into())?;
        self.interpolate(&slots, t)
    }

    /// Interpolated value of a scalar variable or vector component at `t`.
    pub fn eval_scalar(&self, term: impl Into<Term>, t: f64) -> Result<f64, OdeError> {
        let term = term.into();
        let values = self.eval(term, t)?;
        match values.as_slice() {
            [value] => Ok(*value),
            _ => Err(OdeError::ShapeMismatch {
                variable: self.name_of(&term),
                expected: 1,
                got: values.len(),
            }),
        }
    }

    /// Evaluates `term` at every time in `times`, in parallel.
    pub fn sample(&self, term: impl Into<Term>, times: &[f64]) -> Result<Vec<Vec<f64>>, OdeError> {
        let slots = self.state_map().slots_for(&term.into())?;
        times
            .par_iter()
            .map(|&t| self.interpolate(&slots, t))
            .collect()
    }

    /// `(f, J, x0, t0, state map)` of the integrated system.
    pub fn as_first_order(&self) -> FirstOrderView<'_> {
        FirstOrderView {
            f: self.system.rhs_function(),
            jacobian: self.system.jacobian_function(),
            x0: self.trajectory.y.first().map(Vec::as_slice).unwrap_or(&[]),
            t0: self.trajectory.t.first().copied().unwrap_or(0.0),
            state_map: self.system.state_map(),
        }
    }

    /// The trajectory as an `N × T` array.
    #[cfg(feature = "ndarray")]
    pub fn to_array(&self) -> ndarray::Array2<f64> {
        ndarray::Array2::from_shape_fn((self.rows.len(), self.trajectory.len()), |(i, j)| {
            self.rows[i][j]
        })
    }

    fn interpolate(&self, slots: &[usize], t: f64) -> Result<Vec<f64>, OdeError> {
        let out_of_range = || OdeError::TimeOutOfRange {
            t,
            start: self.trajectory.t.first().copied().unwrap_or(f64::NAN),
            end: self.trajectory.t.last().copied().unwrap_or(f64::NAN),
        };
        slots
            .iter()
            .map(|&i| self.trajectory.interpolate(t, i).ok_or_else(out_of_range))
            .collect()
    }

    fn name_of(&self, term: &Term) -> String {
        self.state_map()
            .layout(term.var)
            .map(|l| l.name.clone())
            .unwrap_or_else(|| term.to_string())
    }
}

/// Closed-form solution of a single scalar equation.
///
/// The general solution carries integration constants `C1`, `C2`, ... When initial values
/// were supplied they are already substituted and [`constants`](Self::constants) is empty.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedFormSolution {
    variable: Term,
    name: String,
    expr: Expr,
    constants: Vec<String>,
}

impl ClosedFormSolution {
    pub(crate) fn new(variable: Term, name: String, expr: Expr, constants: Vec<String>) -> Self {
        Self {
            variable: variable.base(),
            name,
            expr,
            constants,
        }
    }

    /// The solved variable.
    pub fn variable(&self) -> Term {
        self.variable
    }

    /// Expression in time (and remaining constants) for `term` or one of its derivatives.
    ///
    /// # Errors
    /// Returns [`OdeError::UnknownVariable`] for any other variable.
    pub fn as_expr(&self, term: impl Into<Term>) -> Result<Expr, OdeError> {
        let term = term.into();
        if term.base() != self.variable {
            return Err(OdeError::UnknownVariable(term.to_string()));
        }
        Ok((0..term.level).fold(self.expr.clone(), |e, _| {
            *e.derivative(&Wrt::Time).simplify()
        }))
    }

    /// Names of the integration constants still free in the solution.
    pub fn constants(&self) -> &[String] {
        &self.constants
    }

    /// Evaluates `term` at `t` with the given values for the free constants.
    ///
    /// # Errors
    /// Returns [`OdeError::InvalidProblem`] when a free constant has no value.
    pub fn eval(
        &self,
        term: impl Into<Term>,
        t: f64,
        constants: &HashMap<String, f64>,
    ) -> Result<f64, OdeError> {
        let bound = self.as_expr(term)?.bind_symbols(constants);
        bound.evaluate(t, &[]).ok_or_else(|| {
            OdeError::InvalidProblem(format!(
                "closed-form solution of `{}` still depends on {}",
                self.name,
                bound.symbols().into_iter().collect::<Vec<_>>().join(", ")
            ))
        })
    }
}

impl std::fmt::Display for ClosedFormSolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(t) = {}", self.name, self.expr)
    }
}
