//! Highest-derivative isolation and Jacobian construction.
//!
//! Every component of a variable of order `k` contributes one unknown, its `k`-th derivative
//! (for order-0 variables, the value itself). Each scalar equation resolves exactly one of
//! them: equations are processed in order, already resolved unknowns are substituted, and
//! the remaining candidate of highest derivative level is handed to the algebra engine.
//! Solutions are substituted back into earlier ones, so at the end every unknown is an
//! expression of the state, the independent variable and constants.
//!
//! An equation that references none of the unknowns once the resolved ones are substituted
//! (for example `y' = x` when `y` must be carried to second order) is differentiated along
//! the trajectory, and substituted again, until one appears.
//!
//! The resulting first-order system `dx/dt = f(t, x)` is expressed over state slots; its
//! Jacobian `∂f_i/∂x_j` is built in parallel and dropped when the engine cannot
//! differentiate.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;

use colored::Colorize;
use log::{debug, warn};
use rayon::prelude::*;

use crate::algebra::Algebra;
use crate::equation::Equation;
use crate::errors::{AlgebraError, OdeError};
use crate::expr::{Expr, Wrt};
use crate::state::StateMap;
use crate::symbols::{Model, Term};

/// `dx/dt = f(t, x)` over the slots of a [`StateMap`].
#[derive(Debug, Clone, PartialEq)]
pub struct FirstOrderSystem {
    /// `f_i`, one per state coordinate
    pub rhs: Vec<Expr>,
    /// Row-major `∂f_i/∂x_j`, if the algebra engine could differentiate every entry
    pub jacobian: Option<Vec<Vec<Expr>>>,
    pub state_map: StateMap,
}

impl FirstOrderSystem {
    pub fn dimension(&self) -> usize {
        self.rhs.len()
    }
}

impl fmt::Display for FirstOrderSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rhs) in self.rhs.iter().enumerate() {
            writeln!(
                f,
                "  {} {} {}",
                format!("d/dt {}", self.state_map.slot_name(i)).cyan(),
                "=".cyan(),
                rhs
            )?;
        }
        if self.jacobian.is_none() {
            writeln!(f, "  {}", "(no symbolic Jacobian)".yellow())?;
        }
        Ok(())
    }
}

/// Solves every equation for its highest-order unknown and builds `f` and its Jacobian.
///
/// `equations` must be scalar (vector references expanded) with all named symbols bound.
///
/// # Errors
/// - [`OdeError::UnderOrOverdeterminedSystem`] when the number of equations differs from the
///   number of unknowns, or an equation determines none of the remaining ones
/// - [`OdeError::UnsolvableIsolation`] when the algebra engine cannot solve an equation for
///   any of its candidate unknowns
pub fn isolate(
    model: &Model,
    equations: &[Equation],
    state_map: &StateMap,
    algebra: &dyn Algebra,
) -> Result<FirstOrderSystem, OdeError> {
    let targets = unknowns(state_map);
    if equations.len() != targets.len() {
        return Err(OdeError::UnderOrOverdeterminedSystem {
            equations: equations.len(),
            unknowns: targets.len(),
            detail: format!(
                "unknowns are {}",
                targets
                    .iter()
                    .map(|t| model.term_name(t))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        });
    }
    let position = |term: &Term| targets.iter().position(|t| t == term);

    let mut resolved: Vec<(Term, Expr)> = Vec::with_capacity(targets.len());
    for (index, equation) in equations.iter().enumerate() {
        let residual = equation.residual();
        if residual.terms().iter().all(|t| state_map.order(t.var).is_none()) {
            return Err(OdeError::UnderOrOverdeterminedSystem {
                equations: equations.len(),
                unknowns: targets.len(),
                detail: format!(
                    "equation {index} ({}) references no variable of the system",
                    equation.display(model)
                ),
            });
        }
        let determines_none = || OdeError::UnderOrOverdeterminedSystem {
            equations: equations.len(),
            unknowns: targets.len(),
            detail: format!("equation {index} determines none of the remaining unknowns"),
        };
        let reduced =
            lift(model, index, residual, &resolved, state_map).ok_or_else(determines_none)?;

        let mut candidates: Vec<Term> = reduced
            .terms()
            .into_iter()
            .filter(|t| position(t).is_some())
            .collect();
        candidates.sort_by_key(|t| (Reverse(t.level), position(t)));
        let first = candidates.first().copied().ok_or_else(determines_none)?;

        let mut failure: Option<AlgebraError> = None;
        let mut chosen = None;
        for candidate in &candidates {
            match algebra.solve_for(&reduced, candidate) {
                Ok(solution) if !solution.contains_term(candidate) => {
                    chosen = Some((*candidate, solution));
                    break;
                }
                Ok(_) => {
                    failure.get_or_insert(AlgebraError::Unsolvable(
                        "solution still contains the unknown".to_string(),
                    ));
                }
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        let Some((target, solution)) = chosen else {
            return Err(OdeError::UnsolvableIsolation {
                equation: index,
                term: model.term_name(&first),
                reason: failure.map(|e| e.to_string()).unwrap_or_default(),
            });
        };

        debug!(
            "equation {index}: {} = {}",
            model.term_name(&target),
            model.render(&solution)
        );
        for (_, value) in resolved.iter_mut() {
            *value = *value.substitute(&target, &solution).simplify();
        }
        resolved.push((target, solution));
    }

    let resolved: BTreeMap<Term, Expr> = resolved.into_iter().collect();
    let to_slots = |expr: &Expr| {
        expr.replace(&|node| match node {
            Expr::Term(t) => state_map.index_of(t).map(|i| Expr::Slot(i as u32)),
            _ => None,
        })
        .simplify()
    };

    let mut rhs = Vec::with_capacity(state_map.len());
    for key in state_map.keys() {
        let next = key.d(1);
        let f = match state_map.index_of(&next) {
            Some(carrier) => Expr::Slot(carrier as u32),
            None => match resolved.get(&next) {
                Some(value) => *to_slots(value),
                None => {
                    return Err(OdeError::UnderOrOverdeterminedSystem {
                        equations: equations.len(),
                        unknowns: targets.len(),
                        detail: format!("no equation determines {}", model.term_name(&next)),
                    })
                }
            },
        };
        rhs.push(f);
    }

    let jacobian = jacobian(&rhs, algebra);
    debug!(
        "first-order system of dimension {} ({} Jacobian)",
        rhs.len(),
        if jacobian.is_some() { "with" } else { "without" }
    );
    Ok(FirstOrderSystem {
        rhs,
        jacobian,
        state_map: state_map.clone(),
    })
}

/// Highest-order unknowns in state order.
fn unknowns(state_map: &StateMap) -> Vec<Term> {
    state_map
        .layouts()
        .iter()
        .flat_map(|layout| {
            (0..layout.components).map(move |c| Term {
                var: layout.var,
                component: layout.vector.then_some(c),
                level: layout.order,
            })
        })
        .collect()
}

/// Substitutes the resolved unknowns into `residual` and differentiates it along the
/// trajectory until some remaining term reaches its variable's order. `None` when that takes
/// more derivatives than the highest order of the system.
fn lift(
    model: &Model,
    index: usize,
    residual: Expr,
    resolved: &[(Term, Expr)],
    state_map: &StateMap,
) -> Option<Expr> {
    let substitute = |expr: Expr| {
        *resolved
            .iter()
            .fold(expr, |acc, (term, value)| *acc.substitute(term, value))
            .simplify()
    };
    let max_order = state_map.layouts().iter().map(|l| l.order).max().unwrap_or(0);

    let mut reduced = substitute(residual);
    let mut lifted = 0;
    loop {
        let gap = reduced
            .terms()
            .iter()
            .filter_map(|t| state_map.order(t.var)?.checked_sub(t.level))
            .min()?;
        if gap == 0 {
            return Some(reduced);
        }
        lifted += gap;
        if lifted > max_order {
            return None;
        }
        debug!(
            "equation {index}: differentiating {} {gap} time(s) to reach the highest order",
            model.render(&reduced)
        );
        reduced = substitute((0..gap).fold(reduced, |acc, _| *acc.time_derivative().simplify()));
    }
}

fn jacobian(rhs: &[Expr], algebra: &dyn Algebra) -> Option<Vec<Vec<Expr>>> {
    let n = rhs.len();
    let rows: Result<Vec<Vec<Expr>>, AlgebraError> = rhs
        .par_iter()
        .map(|f| {
            (0..n)
                .map(|j| algebra.differentiate(f, &Wrt::Slot(j as u32), 1))
                .collect()
        })
        .collect();
    match rows {
        Ok(rows) => Some(rows),
        Err(err) => {
            warn!("symbolic Jacobian unavailable: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::{BuiltinAlgebra, ClosedForm};
    use crate::analyze::{expand_vector_equations, infer_orders, resolve_orders};
    use crate::equation::eq;
    use crate::expr::{pow, sin, time};
    use std::collections::BTreeSet;

    fn reduce(
        model: &Model,
        equations: &[Equation],
        algebra: &dyn Algebra,
    ) -> Result<FirstOrderSystem, OdeError> {
        let expanded = expand_vector_equations(model, equations)?;
        let inferred = infer_orders(model, &expanded)?;
        let orders = resolve_orders(model, &inferred, &BTreeSet::new())?;
        let map = StateMap::new(model, &orders);
        isolate(model, &expanded, &map, algebra)
    }

    struct NoDerivatives;

    impl Algebra for NoDerivatives {
        fn differentiate(&self, _: &Expr, _: &Wrt, _: usize) -> Result<Expr, AlgebraError> {
            Err(AlgebraError::NonDifferentiable("disabled".to_string()))
        }

        fn solve_for(&self, residual: &Expr, unknown: &Term) -> Result<Expr, AlgebraError> {
            BuiltinAlgebra.solve_for(residual, unknown)
        }

        fn dsolve_closed_form(&self, _: &Expr, _: &Term) -> Result<ClosedForm, AlgebraError> {
            Err(AlgebraError::Unsupported("disabled".to_string()))
        }
    }

    #[test]
    fn test_harmonic_oscillator() -> Result<(), Box<dyn std::error::Error>> {
        let mut model = Model::new();
        let y = model.var("y");

        let system = reduce(&model, &[eq(y.d(2) + y, 0.0)], &BuiltinAlgebra)?;
        assert_eq!(system.dimension(), 2);
        assert_eq!(system.rhs[0], Expr::Slot(1));
        assert_eq!(system.rhs[1].evaluate(0.0, &[3.0, 0.0]), Some(-3.0));

        let jac = system.jacobian.ok_or("missing Jacobian")?;
        let values: Vec<Option<f64>> = jac
            .iter()
            .flatten()
            .map(|e| e.try_evaluate_constant())
            .collect();
        assert_eq!(values, vec![Some(0.0), Some(1.0), Some(-1.0), Some(0.0)]);
        Ok(())
    }

    #[test]
    fn test_coupled_mixed_order() -> Result<(), Box<dyn std::error::Error>> {
        let mut model = Model::new();
        let x = model.var("x");
        let y = model.var("y");

        // x'' = -x + y', y' = -y + t
        let equations = [eq(x.d(2), -x + y.d(1)), eq(y.d(1), -y + time())];
        let system = reduce(&model, &equations, &BuiltinAlgebra)?;
        assert_eq!(system.dimension(), 3);

        // state: x, x', y
        let state = [1.0, 0.5, 2.0];
        let f: Vec<Option<f64>> = system.rhs.iter().map(|e| e.evaluate(1.0, &state)).collect();
        assert_eq!(f, vec![Some(0.5), Some(-1.0 + (-2.0 + 1.0)), Some(-1.0)]);
        Ok(())
    }

    #[test]
    fn test_algebraic_variable_eliminated() -> Result<(), Box<dyn std::error::Error>> {
        let mut model = Model::new();
        let x = model.var("x");
        let z = model.var("z");

        let equations = [eq(x.d(1), z), eq(z, 2.0 * x)];
        let system = reduce(&model, &equations, &BuiltinAlgebra)?;
        assert_eq!(system.dimension(), 1);
        assert_eq!(system.rhs[0].evaluate(0.0, &[1.5]), Some(3.0));
        Ok(())
    }

    #[test]
    fn test_lifted_equation() -> Result<(), Box<dyn std::error::Error>> {
        let mut model = Model::new();
        let x = model.var("x");
        let y = model.var_with_order("y", 2);

        // y is declared second order but only y' appears: the second equation is lifted to
        // y'' = x'.
        let expanded = vec![eq(x.d(1), -x), eq(y.d(1), x)];
        let inferred = infer_orders(&model, &expanded)?;
        let orders = resolve_orders(&model, &inferred, &BTreeSet::new())?;
        let map = StateMap::new(&model, &orders);
        let system = isolate(&model, &expanded, &map, &BuiltinAlgebra)?;

        // state: x, y, y'
        assert_eq!(system.rhs[1], Expr::Slot(2));
        assert_eq!(system.rhs[2].evaluate(0.0, &[2.0, 0.0, 0.0]), Some(-2.0));
        Ok(())
    }

    #[test]
    fn test_lifted_after_substitution() -> Result<(), Box<dyn std::error::Error>> {
        let mut model = Model::new();
        let x = model.var("x");
        let y = model.var_with_order("y", 2);

        // x'' = -x, y' = x''. The second equation holds x'' at its top level, but once the
        // first is substituted it reads y' = -x and has to be lifted to y'' = -x'.
        let expanded = vec![eq(x.d(2), -x), eq(y.d(1), x.d(2))];
        let inferred = infer_orders(&model, &expanded)?;
        let orders = resolve_orders(&model, &inferred, &BTreeSet::new())?;
        let map = StateMap::new(&model, &orders);
        let system = isolate(&model, &expanded, &map, &BuiltinAlgebra)?;

        // state: x, x', y, y'
        assert_eq!(system.dimension(), 4);
        assert_eq!(system.rhs[2], Expr::Slot(3));
        assert_eq!(system.rhs[3].evaluate(0.0, &[1.0, 0.5, 0.0, 0.0]), Some(-0.5));
        Ok(())
    }

    #[test]
    fn test_redundant_equation_determines_nothing() {
        let mut model = Model::new();
        let x = model.var("x");
        let y = model.var("y");

        // The second equation cancels to 0 = 0 once x' = y is substituted
        let err = reduce(&model, &[eq(x.d(1), y), eq(2.0 * x.d(1), 2.0 * y)], &BuiltinAlgebra);
        assert!(matches!(err, Err(OdeError::UnderOrOverdeterminedSystem { .. })));
    }

    #[test]
    fn test_vector_rows() -> Result<(), Box<dyn std::error::Error>> {
        let mut model = Model::new();
        let u = model.vector("u", 2);

        let system = reduce(&model, &[eq(u.d(2) + u, 0.0)], &BuiltinAlgebra)?;
        // state: u[0], u[1], u[0]', u[1]'
        assert_eq!(system.rhs[0], Expr::Slot(2));
        assert_eq!(system.rhs[1], Expr::Slot(3));
        assert_eq!(system.rhs[3].evaluate(0.0, &[0.0, 4.0, 0.0, 0.0]), Some(-4.0));
        Ok(())
    }

    #[test]
    fn test_unsolvable_equation() {
        let mut model = Model::new();
        let y = model.var("y");

        let err = reduce(&model, &[eq(sin(y.d(2)) + y, 0.0)], &BuiltinAlgebra).unwrap_err();
        assert!(matches!(
            err,
            OdeError::UnsolvableIsolation { equation: 0, ref term, .. } if term == "y''"
        ));
    }

    #[test]
    fn test_nonlinear_isolation() -> Result<(), Box<dyn std::error::Error>> {
        let mut model = Model::new();
        let y = model.var("y");

        // 1 / y'' + y = 0  ->  y'' = -1 / y
        let system = reduce(&model, &[eq(1.0 / y.d(2) + y, 0.0)], &BuiltinAlgebra)?;
        assert_eq!(system.rhs[1].evaluate(0.0, &[4.0, 0.0]), Some(-0.25));

        // y'^3 = y  ->  y' = root(y, 3)
        let system = reduce(&model, &[eq(pow(y.d(1), 3), y)], &BuiltinAlgebra)?;
        let value = system.rhs[0].evaluate(0.0, &[-27.0]).ok_or("not evaluable")?;
        assert!((value + 3.0).abs() < 1e-12);

        let jac = system.jacobian.ok_or("missing Jacobian")?;
        let slope = jac[0][0].evaluate(0.0, &[-27.0]).ok_or("not evaluable")?;
        assert!((slope - 1.0 / 27.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_equation_count() {
        let mut model = Model::new();
        let x = model.var("x");
        let y = model.var("y");

        let err = reduce(&model, &[eq(x.d(1) + y.d(1), 0.0)], &BuiltinAlgebra).unwrap_err();
        assert!(matches!(
            err,
            OdeError::UnderOrOverdeterminedSystem { equations: 1, unknowns: 2, .. }
        ));

        let err = reduce(
            &model,
            &[eq(x.d(1), y), eq(y.d(1), x), eq(x.d(1), 1.0)],
            &BuiltinAlgebra,
        )
        .unwrap_err();
        assert!(matches!(err, OdeError::UnderOrOverdeterminedSystem { .. }));
    }

    #[test]
    fn test_jacobian_unavailable() -> Result<(), Box<dyn std::error::Error>> {
        let mut model = Model::new();
        let y = model.var("y");

        let system = reduce(&model, &[eq(y.d(1), -y)], &NoDerivatives)?;
        assert!(system.jacobian.is_none());
        assert_eq!(system.rhs[0].evaluate(0.0, &[2.0]), Some(-2.0));
        Ok(())
    }
}
