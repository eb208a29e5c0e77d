//! The `solve` entry point.
//!
//! A [`Problem`] collects equations, initial values, a time span and a backend, and runs
//! the pipeline:
//!
//! ```text
//! equations ─ bind parameters ─ expand vectors ─ infer/resolve orders
//!     ─ validate initial values ─ state map ─ isolate ─ compile ─ integrate ─ Solution
//! ```
//!
//! The symbolic backend hands a single scalar equation to the [`Algebra`] engine instead and
//! returns a [`ClosedFormSolution`].
//!
//! # Example
//! ```
//! use odejit::prelude::*;
//!
//! let mut model = Model::new();
//! let y = model.var("y");
//!
//! // y'' + y = 0, y(0) = 1, y'(0) = 0
//! let solution = model
//!     .problem(y.d(2) + y)
//!     .ivp(InitialValues::new().set(y, 1.0).set(y.d(1), 0.0))
//!     .t_span(0.0, 3.0)
//!     .solve_numeric()
//!     .unwrap();
//!
//! let value = solution.eval_scalar(y, 2.0).unwrap();
//! assert!((value - 2f64.cos()).abs() < 1e-5);
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::algebra::{Algebra, BuiltinAlgebra, ClosedForm};
use crate::analyze::{expand_vector_equations, infer_orders, resolve_orders};
use crate::equation::{Equation, EquationSet};
use crate::errors::{AlgebraError, OdeError};
use crate::expr::{Expr, Wrt};
use crate::integrate::{integrate, IntegratorOptions};
use crate::isolate::isolate;
use crate::solution::{ClosedFormSolution, Solution};
use crate::state::StateMap;
use crate::symbols::Model;
use crate::system::CompiledSystem;
use crate::validate::{validate_ivp, InitialValues};

/// Solver backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Compile the first-order system and integrate it.
    #[default]
    Numeric,
    /// Closed-form solution of a single scalar equation.
    Symbolic,
    /// Closed form when available, numeric otherwise.
    Auto,
}

/// Result of [`Problem::solve`].
#[derive(Debug, Clone)]
pub enum SolveOutput {
    Numeric(Solution),
    Symbolic(ClosedFormSolution),
}

impl SolveOutput {
    pub fn as_numeric(&self) -> Option<&Solution> {
        match self {
            SolveOutput::Numeric(solution) => Some(solution),
            SolveOutput::Symbolic(_) => None,
        }
    }

    pub fn as_symbolic(&self) -> Option<&ClosedFormSolution> {
        match self {
            SolveOutput::Symbolic(solution) => Some(solution),
            SolveOutput::Numeric(_) => None,
        }
    }
}

/// Equations over the variables of a [`Model`], with everything needed to solve them.
#[derive(Clone)]
pub struct Problem<'a> {
    model: &'a Model,
    equations: Vec<Equation>,
    ivp: Option<InitialValues>,
    t_span: Option<(f64, f64)>,
    backend: Backend,
    options: IntegratorOptions,
    parameters: HashMap<String, f64>,
    algebra: Arc<dyn Algebra>,
}

impl<'a> Problem<'a> {
    pub fn new(model: &'a Model, equations: impl EquationSet) -> Self {
        Self {
            model,
            equations: equations.into_equations(),
            ivp: None,
            t_span: None,
            backend: Backend::default(),
            options: IntegratorOptions::default(),
            parameters: HashMap::new(),
            algebra: Arc::new(BuiltinAlgebra),
        }
    }

    pub fn ivp(mut self, ivp: InitialValues) -> Self {
        self.ivp = Some(ivp);
        self
    }

    /// Integration span; `tf < t0` integrates backward.
    pub fn t_span(mut self, t0: f64, tf: f64) -> Self {
        self.t_span = Some((t0, tf));
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn options(mut self, options: IntegratorOptions) -> Self {
        self.options = options;
        self
    }

    /// Binds the named symbol `name` to `value` in every equation.
    pub fn parameter(mut self, name: &str, value: f64) -> Self {
        self.parameters.insert(name.to_string(), value);
        self
    }

    /// Replaces the algebra engine.
    pub fn algebra(mut self, algebra: Arc<dyn Algebra>) -> Self {
        self.algebra = algebra;
        self
    }

    /// Runs the selected backend.
    pub fn solve(&self) -> Result<SolveOutput, OdeError> {
        match self.backend {
            Backend::Numeric => self.solve_numeric().map(SolveOutput::Numeric),
            Backend::Symbolic => self.solve_symbolic().map(SolveOutput::Symbolic),
            Backend::Auto => match self.solve_symbolic() {
                Ok(solution) => Ok(SolveOutput::Symbolic(solution)),
                Err(e) => {
                    debug!("closed-form path failed ({e}), falling back to integration");
                    self.solve_numeric().map(SolveOutput::Numeric)
                }
            },
        }
    }

    /// Reduces the equations to a first-order system and integrates it.
    ///
    /// # Errors
    /// [`OdeError::InvalidProblem`] without initial values or time span, and every error of
    /// the pipeline stages otherwise.
    pub fn solve_numeric(&self) -> Result<Solution, OdeError> {
        let model = self.model;
        let equations = self.scalar_equations()?;
        let inferred = infer_orders(model, &equations)?;

        let ivp = self.ivp.as_ref().ok_or_else(|| {
            OdeError::InvalidProblem("initial values are required to integrate".to_string())
        })?;
        let (t0, tf) = self.t_span.ok_or_else(|| {
            OdeError::InvalidProblem("a time span is required to integrate".to_string())
        })?;

        let orders = resolve_orders(model, &inferred, &ivp.variables())?;
        let initial = validate_ivp(model, &orders, ivp)?;
        let state_map = StateMap::new(model, &orders);
        debug!("state vector has {} coordinates", state_map.len());

        let first_order = isolate(model, &equations, &state_map, self.algebra.as_ref())?;
        debug!("first-order system:\n{first_order}");
        let system = CompiledSystem::compile(model, &first_order)?;

        let x0 = initial.to_state_vector(&state_map);
        let trajectory = integrate(&system, t0, tf, &x0, &self.options)?;
        debug!(
            "integrated from {t0} to {tf} in {} steps",
            trajectory.stats.accepted_steps
        );
        Ok(Solution::new(system, trajectory))
    }

    /// Solves a single scalar equation in closed form.
    ///
    /// With initial values the integration constants are fixed at the start of the time span
    /// (or `t = 0` without one).
    ///
    /// # Errors
    /// [`OdeError::Backend`] when the equation is not a single scalar equation or the algebra
    /// engine declines; validation errors when initial values are given.
    pub fn solve_symbolic(&self) -> Result<ClosedFormSolution, OdeError> {
        let model = self.model;
        let equations = self.scalar_equations()?;
        let [equation] = equations.as_slice() else {
            return Err(OdeError::Backend(format!(
                "closed-form solving needs a single scalar equation, got {}",
                equations.len()
            )));
        };

        let residual = equation.residual();
        let unknown = residual
            .terms()
            .first()
            .map(|t| t.base())
            .ok_or_else(|| OdeError::Backend("equation references no variable".to_string()))?;
        let closed_form = self
            .algebra
            .dsolve_closed_form(&residual, &unknown)
            .map_err(backend_error)?;
        let name = model.term_name(&unknown);
        debug!(
            "closed form of {name}: {} with {} constants",
            closed_form.general(),
            closed_form.basis.len()
        );

        let Some(ivp) = &self.ivp else {
            return Ok(ClosedFormSolution::new(
                unknown,
                name,
                closed_form.general(),
                closed_form.constant_names(),
            ));
        };

        let inferred = infer_orders(model, &equations)?;
        let orders = resolve_orders(model, &inferred, &ivp.variables())?;
        let initial = validate_ivp(model, &orders, ivp)?;
        let t0 = self.t_span.map_or(0.0, |(t0, _)| t0);

        let mut targets = Vec::with_capacity(closed_form.basis.len());
        for level in 0..closed_form.basis.len() {
            let value = initial
                .get(unknown.var, level)
                .and_then(|values| values.get(unknown.component.unwrap_or(0)))
                .copied()
                .ok_or_else(|| OdeError::MissingInitialCondition {
                    variable: model.name(unknown.var).to_string(),
                    level,
                })?;
            targets.push(value);
        }
        let constants = self.fit_constants(&closed_form, &targets, t0)?;
        let expr = closed_form.general().bind_symbols(&constants).simplify();
        Ok(ClosedFormSolution::new(unknown, name, *expr, Vec::new()))
    }

    /// Parameter-bound, vector-expanded equations.
    fn scalar_equations(&self) -> Result<Vec<Equation>, OdeError> {
        let bound: Vec<Equation> = self
            .equations
            .iter()
            .map(|e| Equation {
                lhs: *e.lhs.bind_symbols(&self.parameters),
                rhs: *e.rhs.bind_symbols(&self.parameters),
            })
            .collect();
        expand_vector_equations(self.model, &bound)
    }

    /// Solves `Σ C_i φ_i^(k)(t0) = y^(k)(t0) - p^(k)(t0)` for the integration constants.
    fn fit_constants(
        &self,
        closed_form: &ClosedForm,
        targets: &[f64],
        t0: f64,
    ) -> Result<HashMap<String, f64>, OdeError> {
        let n = closed_form.basis.len();
        let at = |expr: &Expr, level: usize| -> Result<f64, OdeError> {
            let derivative = self
                .algebra
                .differentiate(expr, &Wrt::Time, level)
                .map_err(backend_error)?;
            derivative.evaluate(t0, &[]).ok_or_else(|| {
                OdeError::Backend(format!("closed form cannot be evaluated at t = {t0}"))
            })
        };

        let mut matrix = DMatrix::zeros(n, n);
        let mut rhs = DVector::zeros(n);
        for (level, target) in targets.iter().enumerate() {
            rhs[level] = target - at(&closed_form.particular, level)?;
            for (i, phi) in closed_form.basis.iter().enumerate() {
                matrix[(level, i)] = at(phi, level)?;
            }
        }
        let solved = matrix.lu().solve(&rhs).ok_or_else(|| {
            OdeError::Backend(format!("initial values do not determine the constants at t = {t0}"))
        })?;

        Ok(closed_form
            .constant_names()
            .into_iter()
            .zip(solved.iter().copied())
            .collect())
    }
}

fn backend_error(error: AlgebraError) -> OdeError {
    OdeError::Backend(error.to_string())
}

/// One-call form of [`Problem`].
pub fn solve(
    model: &Model,
    equations: impl EquationSet,
    ivp: Option<InitialValues>,
    t_span: Option<(f64, f64)>,
    backend: Backend,
) -> Result<SolveOutput, OdeError> {
    let mut problem = Problem::new(model, equations).backend(backend);
    if let Some(ivp) = ivp {
        problem = problem.ivp(ivp);
    }
    if let Some((t0, tf)) = t_span {
        problem = problem.t_span(t0, tf);
    }
    problem.solve()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{sin, symbol};

    #[test]
    fn test_numeric_with_parameter() -> Result<(), Box<dyn std::error::Error>> {
        let mut model = Model::new();
        let y = model.var("y");

        // y' = -k y
        let solution = model
            .problem(Equation::new(y.d(1), -symbol("k") * y))
            .parameter("k", 2.0)
            .ivp(InitialValues::new().set(y, 1.0))
            .t_span(0.0, 1.0)
            .solve_numeric()?;

        let end = solution.eval_scalar(y, 1.0)?;
        assert!((end - (-2.0f64).exp()).abs() < 1e-6);
        assert_eq!(solution.state_map().len(), 1);
        Ok(())
    }

    #[test]
    fn test_unbound_parameter() {
        let mut model = Model::new();
        let y = model.var("y");
        let err = model
            .problem(Equation::new(y.d(1), -symbol("k") * y))
            .ivp(InitialValues::new().set(y, 1.0))
            .t_span(0.0, 1.0)
            .solve_numeric()
            .unwrap_err();
        assert!(
            matches!(&err, OdeError::Compilation(e) if e.to_string().contains("`k`")),
            "{err}"
        );
    }

    #[test]
    fn test_requires_ivp_and_span() {
        let mut model = Model::new();
        let y = model.var("y");
        let problem = model.problem(y.d(1) + y);
        assert!(matches!(
            problem.solve_numeric(),
            Err(OdeError::InvalidProblem(_))
        ));
        assert!(matches!(
            problem.clone().ivp(InitialValues::new().set(y, 1.0)).solve_numeric(),
            Err(OdeError::InvalidProblem(_))
        ));
    }

    #[test]
    fn test_symbolic_general_and_fitted() -> Result<(), Box<dyn std::error::Error>> {
        let mut model = Model::new();
        let y = model.var("y");

        let general = model.problem(y.d(2) + y).solve_symbolic()?;
        assert_eq!(general.constants(), ["C1", "C2"]);

        let fitted = model
            .problem(y.d(2) + y)
            .ivp(InitialValues::new().set(y, 1.0).set(y.d(1), 2.0))
            .solve_symbolic()?;
        assert!(fitted.constants().is_empty());
        let value = fitted.eval(y, 0.7, &HashMap::new())?;
        assert!((value - (0.7f64.cos() + 2.0 * 0.7f64.sin())).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_symbolic_at_shifted_start() -> Result<(), Box<dyn std::error::Error>> {
        let mut model = Model::new();
        let y = model.var("y");

        // y' + y = 1, y(1) = 3  =>  y = 1 + 2 e^(1 - t)
        let fitted = model
            .problem(Equation::new(y.d(1) + y, 1.0))
            .ivp(InitialValues::new().set(y, 3.0))
            .t_span(1.0, 2.0)
            .solve_symbolic()?;
        let value = fitted.eval(y, 2.0, &HashMap::new())?;
        assert!((value - (1.0 + 2.0 * (-1.0f64).exp())).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_auto_backend() -> Result<(), Box<dyn std::error::Error>> {
        let mut model = Model::new();
        let y = model.var("y");
        let ivp = InitialValues::new().set(y, 0.5);

        let linear = model
            .problem(y.d(1) + y)
            .ivp(ivp.clone())
            .t_span(0.0, 1.0)
            .backend(Backend::Auto)
            .solve()?;
        assert!(linear.as_symbolic().is_some());

        // y' = sin(y) has no closed form here
        let nonlinear = model
            .problem(Equation::new(y.d(1), sin(y)))
            .ivp(ivp)
            .t_span(0.0, 1.0)
            .backend(Backend::Auto)
            .solve()?;
        assert!(nonlinear.as_numeric().is_some());
        Ok(())
    }

    #[test]
    fn test_symbolic_rejects_systems() {
        let mut model = Model::new();
        let x = model.var("x");
        let y = model.var("y");
        let err = solve(
            &model,
            vec![Equation::new(x.d(1), y), Equation::new(y.d(1), -x)],
            None,
            None,
            Backend::Symbolic,
        )
        .unwrap_err();
        assert!(matches!(err, OdeError::Backend(_)));
    }
}
