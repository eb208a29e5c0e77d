//! Algebra collaborator.
//!
//! The pipeline never manipulates equations beyond substitution on its own: differentiation,
//! isolation of an unknown and closed-form solving go through the [`Algebra`] trait, so a
//! different engine (or a test double) can be injected into a [`Problem`](crate::solve::Problem).
//!
//! [`BuiltinAlgebra`] is the default engine:
//!
//! - `differentiate` applies the rules of [`Expr::derivative`] and simplifies
//! - `solve_for` isolates unknowns that enter an equation affinely, `a * u + b = 0` with `a`
//!   free of `u`, or through a single chain of invertible operations: reciprocals, odd and
//!   fractional powers, roots, `exp` and `ln`
//! - `dsolve_closed_form` solves scalar linear equations of order one or two with constant
//!   coefficients and constant forcing

use log::debug;

use crate::errors::AlgebraError;
use crate::expr::{Expr, Wrt};
use crate::symbols::Term;

/// General solution `particular + Σ C_i * basis_i`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedForm {
    pub particular: Expr,
    pub basis: Vec<Expr>,
}

impl ClosedForm {
    /// Names of the integration constants, `C1`, `C2`, ...
    pub fn constant_names(&self) -> Vec<String> {
        (1..=self.basis.len()).map(|i| format!("C{i}")).collect()
    }

    /// The general solution with symbolic constants.
    pub fn general(&self) -> Expr {
        let combined = self
            .basis
            .iter()
            .zip(self.constant_names())
            .fold(self.particular.clone(), |acc, (phi, c)| {
                acc + Expr::Symbol(c) * phi.clone()
            });
        *combined.simplify()
    }
}

/// Capability interface of a computer-algebra engine.
pub trait Algebra: Send + Sync {
    /// `order`-th partial derivative of `expr`.
    fn differentiate(&self, expr: &Expr, wrt: &Wrt, order: usize) -> Result<Expr, AlgebraError>;

    /// Solves `residual = 0` for `unknown`. The result must not contain `unknown`.
    fn solve_for(&self, residual: &Expr, unknown: &Term) -> Result<Expr, AlgebraError>;

    /// Closed-form solution of `residual = 0` for the scalar variable of `unknown`.
    fn dsolve_closed_form(&self, residual: &Expr, unknown: &Term)
        -> Result<ClosedForm, AlgebraError>;
}

/// Built-in engine working directly on [`Expr`] trees.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinAlgebra;

const ZERO_TOLERANCE: f64 = 1e-12;

impl Algebra for BuiltinAlgebra {
    fn differentiate(&self, expr: &Expr, wrt: &Wrt, order: usize) -> Result<Expr, AlgebraError> {
        Ok((0..order).fold(expr.clone(), |acc, _| *acc.derivative(wrt).simplify()))
    }

    fn solve_for(&self, residual: &Expr, unknown: &Term) -> Result<Expr, AlgebraError> {
        let residual = residual.simplify();
        if !residual.contains_term(unknown) {
            return Err(AlgebraError::Unsolvable(
                "unknown does not appear in the equation".to_string(),
            ));
        }

        let coefficient = residual.derivative(&Wrt::Term(*unknown)).simplify();
        if !coefficient.contains_term(unknown) {
            if coefficient.is_zero() {
                return Err(AlgebraError::Unsolvable(
                    "unknown cancels out of the equation".to_string(),
                ));
            }
            let rest = residual.substitute(unknown, &Expr::Const(0.0)).simplify();
            return Ok(*(-*rest / *coefficient).simplify());
        }

        let (inner, target) = split_sum(&residual, unknown)?;
        debug!("inverting {inner} = {target}");
        invert(inner, target, unknown)
    }

    fn dsolve_closed_form(
        &self,
        residual: &Expr,
        unknown: &Term,
    ) -> Result<ClosedForm, AlgebraError> {
        let base = unknown.base();
        if let Some(other) = residual.terms().iter().find(|t| t.base() != base) {
            return Err(AlgebraError::Unsupported(format!(
                "equation references a second variable {other}"
            )));
        }
        if !residual.symbols().is_empty() {
            return Err(AlgebraError::Unsupported(
                "equation contains unbound symbols".to_string(),
            ));
        }

        let order = highest(residual, &base);
        let mut coefficients = Vec::with_capacity(order + 1);
        for level in 0..=order {
            let term = base.with_level(level);
            let a = residual.derivative(&Wrt::Term(term)).simplify();
            let value = a.try_evaluate_constant().ok_or_else(|| {
                AlgebraError::Unsupported(format!("coefficient of level {level} is not constant"))
            })?;
            coefficients.push(value);
        }
        let forcing = (0..=order)
            .fold(residual.clone(), |acc, level| {
                *acc.substitute(&base.with_level(level), &Expr::Const(0.0))
            })
            .try_evaluate_constant()
            .ok_or_else(|| AlgebraError::Unsupported("forcing term is not constant".to_string()))?;

        debug!("closed form: coefficients {coefficients:?}, forcing {forcing}");
        match coefficients.as_slice() {
            [a0, a1] => first_order(*a0, *a1, forcing),
            [a0, a1, a2] => second_order(*a0, *a1, *a2, forcing),
            _ => Err(AlgebraError::Unsupported(format!(
                "closed forms are available for orders 1 and 2, got {order}"
            ))),
        }
    }
}

/// Writes `residual = 0` as `inner = target`, with `inner` the only additive term that
/// contains `unknown`.
fn split_sum(residual: &Expr, unknown: &Term) -> Result<(Expr, Expr), AlgebraError> {
    fn collect(expr: &Expr, positive: bool, out: &mut Vec<(bool, Expr)>) {
        match expr {
            Expr::Add(l, r) => {
                collect(l, positive, out);
                collect(r, positive, out);
            }
            Expr::Sub(l, r) => {
                collect(l, positive, out);
                collect(r, !positive, out);
            }
            Expr::Neg(e) => collect(e, !positive, out),
            _ => out.push((positive, expr.clone())),
        }
    }

    let mut summands = Vec::new();
    collect(residual, true, &mut summands);
    let (with, without): (Vec<_>, Vec<_>) = summands
        .into_iter()
        .partition(|(_, e)| e.contains_term(unknown));
    let [(positive, inner)] = <[_; 1]>::try_from(with).map_err(|_| {
        AlgebraError::Unsolvable("unknown occurs in several nonlinear terms".to_string())
    })?;

    // inner + rest = 0  ->  inner = -rest
    let rest = without
        .into_iter()
        .fold(Expr::Const(0.0), |acc, (p, e)| if p { acc + e } else { acc - e });
    let target = if positive { -rest } else { rest };
    Ok((inner, *target.simplify()))
}

/// Peels the operations around the single occurrence of `unknown` in `inner`, applying their
/// inverses to `target`.
fn invert(mut inner: Expr, mut target: Expr, unknown: &Term) -> Result<Expr, AlgebraError> {
    let unsolvable = |what: &str| -> Result<Expr, AlgebraError> {
        Err(AlgebraError::Unsolvable(format!("cannot invert {what}")))
    };
    loop {
        let holds = |e: &Expr| e.contains_term(unknown);
        (inner, target) = match inner {
            Expr::Term(t) if t == *unknown => return Ok(*target.simplify()),
            Expr::Neg(e) => (*e, -target),
            Expr::Add(l, r) if holds(&l) && !holds(&r) => (*l, target - *r),
            Expr::Add(l, r) if holds(&r) && !holds(&l) => (*r, target - *l),
            Expr::Sub(l, r) if holds(&l) && !holds(&r) => (*l, target + *r),
            Expr::Sub(l, r) if holds(&r) && !holds(&l) => (*r, *l - target),
            Expr::Mul(l, r) if holds(&l) && !holds(&r) => (*l, target / *r),
            Expr::Mul(l, r) if holds(&r) && !holds(&l) => (*r, target / *l),
            Expr::Div(l, r) if holds(&l) && !holds(&r) => (*l, target * *r),
            Expr::Div(l, r) if holds(&r) && !holds(&l) => (*r, *l / target),
            Expr::Pow(e, n) if n % 2 != 0 => {
                let target = if n < 0 { 1.0 / target } else { target };
                (*e, Expr::Root(Box::new(target), n.abs()))
            }
            Expr::Pow(_, _) => return unsolvable("an even power"),
            Expr::PowFloat(e, c) => {
                let reciprocal = 1.0 / c;
                let target = if reciprocal.fract() == 0.0 && reciprocal.abs() < i32::MAX as f64 {
                    Expr::Pow(Box::new(target), reciprocal as i64)
                } else {
                    Expr::PowFloat(Box::new(target), reciprocal)
                };
                (*e, target)
            }
            Expr::Root(e, n) => (*e, Expr::Pow(Box::new(target), n)),
            Expr::Sqrt(e) => (*e, Expr::Pow(Box::new(target), 2)),
            Expr::Exp(e) => (*e, Expr::Ln(Box::new(target))),
            Expr::Ln(e) => (*e, Expr::Exp(Box::new(target))),
            Expr::Term(_) => return unsolvable("a different term"),
            Expr::Sin(_) | Expr::Cos(_) => return unsolvable("a trigonometric function"),
            Expr::Abs(_) => return unsolvable("an absolute value"),
            _ => return unsolvable("an expression with several occurrences of the unknown"),
        };
    }
}

fn highest(residual: &Expr, base: &Term) -> usize {
    residual
        .terms()
        .iter()
        .filter(|t| t.base() == *base)
        .map(|t| t.level)
        .max()
        .unwrap_or(0)
}

fn is_zero(value: f64) -> bool {
    value.abs() < ZERO_TOLERANCE
}

fn exp_t(rate: f64) -> Expr {
    *Expr::Exp(Box::new(rate * Expr::Time)).simplify()
}

/// `a1 y' + a0 y + b = 0`
fn first_order(a0: f64, a1: f64, b: f64) -> Result<ClosedForm, AlgebraError> {
    if is_zero(a1) {
        return Err(AlgebraError::Unsolvable("leading coefficient vanishes".to_string()));
    }
    if is_zero(a0) {
        return Ok(ClosedForm {
            particular: *(-(b / a1) * Expr::Time).simplify(),
            basis: vec![Expr::Const(1.0)],
        });
    }
    Ok(ClosedForm {
        particular: Expr::Const(-b / a0),
        basis: vec![exp_t(-a0 / a1)],
    })
}

/// `a2 y'' + a1 y' + a0 y + b = 0`
fn second_order(a0: f64, a1: f64, a2: f64, b: f64) -> Result<ClosedForm, AlgebraError> {
    if is_zero(a2) {
        return Err(AlgebraError::Unsolvable("leading coefficient vanishes".to_string()));
    }
    let particular = if !is_zero(a0) {
        Expr::Const(-b / a0)
    } else if !is_zero(a1) {
        *(-(b / a1) * Expr::Time).simplify()
    } else {
        *(-(b / (2.0 * a2)) * Expr::Pow(Box::new(Expr::Time), 2)).simplify()
    };

    let p = a1 / a2;
    let q = a0 / a2;
    let discriminant = p * p - 4.0 * q;
    let scale = (p * p).max(q.abs()).max(1.0);

    let basis = if discriminant.abs() <= ZERO_TOLERANCE * scale {
        // Repeated root r: e^(rt), t e^(rt)
        let r = -p / 2.0;
        vec![exp_t(r), *(Expr::Time * exp_t(r)).simplify()]
    } else if discriminant > 0.0 {
        let root = discriminant.sqrt();
        vec![exp_t((-p + root) / 2.0), exp_t((-p - root) / 2.0)]
    } else {
        // Complex pair α ± iβ: e^(αt) cos(βt), e^(αt) sin(βt)
        let alpha = -p / 2.0;
        let beta = (-discriminant).sqrt() / 2.0;
        let cos = Expr::Cos(Box::new(beta * Expr::Time));
        let sin = Expr::Sin(Box::new(beta * Expr::Time));
        vec![
            *(exp_t(alpha) * cos).simplify(),
            *(exp_t(alpha) * sin).simplify(),
        ]
    };

    Ok(ClosedForm { particular, basis })
}
