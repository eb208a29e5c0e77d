//! Expression module for representing symbolic right-hand sides.
//!
//! This module defines the expression tree every pipeline stage consumes:
//!
//! - `Expr`: a tagged union over constants, named symbols, the independent variable,
//!   variable/derivative references ([`Term`]), state-vector coordinates and operators
//! - `Wrt`: the quantity a partial derivative is taken against
//!
//! Expressions are immutable values. The operator impls (`+ - * /` and unary `-`) and the
//! constructor functions (`sin`, `exp`, `pow`, ...) always build new trees and never touch
//! their operands.
//!
//! # Expression Tree Structure
//! - Leaf nodes: `Const`, `Symbol`, `Time`, `Term` and `Slot`
//! - Unary operations: `Abs`, `Neg`, `Exp`, `Ln`, `Sqrt`, `Sin`, `Cos`
//! - Binary operations: `Add`, `Sub`, `Mul`, `Div`
//! - Powers: `Pow` (integer exponent), `PowFloat`, `PowExpr`
//!
//! `Slot` leaves only appear after state-space reduction, where every `Term` is replaced by
//! the state-vector coordinate that carries it.
//!
//! # Symbolic Differentiation
//! `derivative` applies the product, quotient, chain and power rules with respect to a
//! `Term`, a `Slot` or the independent variable. `time_derivative` is the total derivative
//! along a trajectory: every `Term` moves one derivative level up.
//!
//! # Expression Simplification
//! `simplify` folds constants and applies identity rules (x + 0 → x, x * 1 → x, x^1 → x,
//! -(-x) → x, ...). It never changes the value of an expression where it is defined.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::symbols::{Model, Term};

/// An expression tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant floating point value
    Const(f64),
    /// A named symbolic constant, bound to a number before compilation
    Symbol(String),
    /// The independent variable
    Time,
    /// A variable, vector component or derivative reference
    Term(Term),
    /// A coordinate of the flat state vector
    Slot(u32),
    /// Addition of two expressions
    Add(Box<Expr>, Box<Expr>),
    /// Subtraction of two expressions
    Sub(Box<Expr>, Box<Expr>),
    /// Multiplication of two expressions
    Mul(Box<Expr>, Box<Expr>),
    /// Division of two expressions
    Div(Box<Expr>, Box<Expr>),
    /// Absolute value of an expression
    Abs(Box<Expr>),
    /// Exponentiation of an expression by an integer constant
    Pow(Box<Expr>, i64),
    /// Exponentiation of an expression by a floating point constant
    PowFloat(Box<Expr>, f64),
    /// Exponentiation of an expression by another expression
    PowExpr(Box<Expr>, Box<Expr>),
    /// Exponential function of an expression
    Exp(Box<Expr>),
    /// Natural logarithm of an expression
    Ln(Box<Expr>),
    /// Square root of an expression
    Sqrt(Box<Expr>),
    /// Real `n`-th root; odd roots keep the sign of their argument
    Root(Box<Expr>, i64),
    /// Sine of an expression (argument in radians)
    Sin(Box<Expr>),
    /// Cosine of an expression (argument in radians)
    Cos(Box<Expr>),
    /// Negation of an expression
    Neg(Box<Expr>),
}

/// What a partial derivative is taken with respect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrt {
    Term(Term),
    Slot(u32),
    Time,
}

impl Expr {
    /// Computes the partial derivative of this expression.
    ///
    /// Every leaf other than the one named by `wrt` is treated as independent of it, so the
    /// derivative with respect to `y` of `y'` is zero.
    ///
    /// # Arguments
    /// * `wrt` - The leaf to differentiate against
    ///
    /// # Returns
    /// A new unsimplified expression tree representing the derivative
    pub fn derivative(&self, wrt: &Wrt) -> Box<Expr> {
        self.chain(&|leaf| match (leaf, wrt) {
            (Expr::Term(t), Wrt::Term(w)) if t == w => Expr::Const(1.0),
            (Expr::Slot(i), Wrt::Slot(j)) if i == j => Expr::Const(1.0),
            (Expr::Time, Wrt::Time) => Expr::Const(1.0),
            _ => Expr::Const(0.0),
        })
    }

    /// Total derivative with respect to the independent variable.
    ///
    /// Each `Term` is replaced by the term one derivative level higher; `Time` contributes 1.
    /// `Slot` leaves are treated as constants.
    pub fn time_derivative(&self) -> Box<Expr> {
        self.chain(&|leaf| match leaf {
            Expr::Term(t) => Expr::Term(t.d(1)),
            Expr::Time => Expr::Const(1.0),
            _ => Expr::Const(0.0),
        })
    }

    /// Differentiation rules shared by partial and total derivatives. `leaf` gives the
    /// derivative of every leaf node.
    fn chain<F>(&self, leaf: &F) -> Box<Expr>
    where
        F: Fn(&Expr) -> Expr,
    {
        match self {
            Expr::Const(_) | Expr::Symbol(_) | Expr::Time | Expr::Term(_) | Expr::Slot(_) => {
                Box::new(leaf(self))
            }

            // d(f + g) = df + dg
            Expr::Add(left, right) => Box::new(Expr::Add(left.chain(leaf), right.chain(leaf))),

            // d(f - g) = df - dg
            Expr::Sub(left, right) => Box::new(Expr::Sub(left.chain(leaf), right.chain(leaf))),

            // d(f * g) = f * dg + g * df
            Expr::Mul(left, right) => Box::new(Expr::Add(
                Box::new(Expr::Mul(left.clone(), right.chain(leaf))),
                Box::new(Expr::Mul(right.clone(), left.chain(leaf))),
            )),

            // d(f / g) = (g * df - f * dg) / g^2
            Expr::Div(left, right) => Box::new(Expr::Div(
                Box::new(Expr::Sub(
                    Box::new(Expr::Mul(right.clone(), left.chain(leaf))),
                    Box::new(Expr::Mul(left.clone(), right.chain(leaf))),
                )),
                Box::new(Expr::Pow(right.clone(), 2)),
            )),

            // d|f| = f / |f| * df
            Expr::Abs(inner) => Box::new(Expr::Mul(
                Box::new(Expr::Div(inner.clone(), Box::new(Expr::Abs(inner.clone())))),
                inner.chain(leaf),
            )),

            // d(f^n) = n * f^(n-1) * df
            Expr::Pow(base, n) => Box::new(Expr::Mul(
                Box::new(Expr::Mul(
                    Box::new(Expr::Const(*n as f64)),
                    Box::new(Expr::Pow(base.clone(), n - 1)),
                )),
                base.chain(leaf),
            )),

            // d(f^c) = c * f^(c-1) * df
            Expr::PowFloat(base, c) => Box::new(Expr::Mul(
                Box::new(Expr::Mul(
                    Box::new(Expr::Const(*c)),
                    Box::new(Expr::PowFloat(base.clone(), c - 1.0)),
                )),
                base.chain(leaf),
            )),

            // d(f^g) = f^g * (dg * ln(f) + g * df / f)
            Expr::PowExpr(base, exponent) => Box::new(Expr::Mul(
                Box::new(Expr::PowExpr(base.clone(), exponent.clone())),
                Box::new(Expr::Add(
                    Box::new(Expr::Mul(exponent.chain(leaf), Box::new(Expr::Ln(base.clone())))),
                    Box::new(Expr::Mul(
                        exponent.clone(),
                        Box::new(Expr::Div(base.chain(leaf), base.clone())),
                    )),
                )),
            )),

            // d(e^f) = e^f * df
            Expr::Exp(inner) => Box::new(Expr::Mul(
                Box::new(Expr::Exp(inner.clone())),
                inner.chain(leaf),
            )),

            // d(ln f) = 1/f * df
            Expr::Ln(inner) => Box::new(Expr::Mul(
                Box::new(Expr::Div(Box::new(Expr::Const(1.0)), inner.clone())),
                inner.chain(leaf),
            )),

            // d(sqrt f) = 1/(2 sqrt f) * df
            Expr::Sqrt(inner) => Box::new(Expr::Mul(
                Box::new(Expr::Div(
                    Box::new(Expr::Const(1.0)),
                    Box::new(Expr::Mul(
                        Box::new(Expr::Const(2.0)),
                        Box::new(Expr::Sqrt(inner.clone())),
                    )),
                )),
                inner.chain(leaf),
            )),

            // d(f^(1/n)) = df / (n * (f^(1/n))^(n-1))
            Expr::Root(inner, n) => Box::new(Expr::Div(
                inner.chain(leaf),
                Box::new(Expr::Mul(
                    Box::new(Expr::Const(*n as f64)),
                    Box::new(Expr::Pow(Box::new(Expr::Root(inner.clone(), *n)), n - 1)),
                )),
            )),

            // d(sin f) = cos f * df
            Expr::Sin(inner) => Box::new(Expr::Mul(
                Box::new(Expr::Cos(inner.clone())),
                inner.chain(leaf),
            )),

            // d(cos f) = -sin f * df
            Expr::Cos(inner) => Box::new(Expr::Mul(
                Box::new(Expr::Neg(Box::new(Expr::Sin(inner.clone())))),
                inner.chain(leaf),
            )),

            // d(-f) = -df
            Expr::Neg(inner) => Box::new(Expr::Neg(inner.chain(leaf))),
        }
    }

    /// Simplifies the expression by folding constants and applying basic algebraic rules.
    ///
    /// # Constant Folding
    /// - Evaluates constant subtrees: 2 + 3 → 5, sin(0) → 0
    /// - Absorbing zero: x * 0 → 0, 0 / x → 0
    ///
    /// # Identity Rules
    /// - x + 0 → x, x - 0 → x, x * 1 → x, x / 1 → x
    /// - x - x → 0, x / x → 1
    /// - x * -1 → -x, -(-x) → x
    ///
    /// # Exponent Rules
    /// - x^0 → 1, x^1 → x, (x^a)^b → x^(a*b), x^a * x^b → x^(a+b), x^a * x → x^(a+1)
    /// - Odd roots of odd powers: root(x^n, n) → x
    /// - Constant float or expression exponents with integral value become integer powers
    ///
    /// # Returns
    /// A new simplified expression tree
    pub fn simplify(&self) -> Box<Expr> {
        match self {
            Expr::Const(_) | Expr::Symbol(_) | Expr::Time | Expr::Term(_) | Expr::Slot(_) => {
                Box::new(self.clone())
            }

            Expr::Add(left, right) => {
                let l = left.simplify();
                let r = right.simplify();
                match (&*l, &*r) {
                    // Fold constants: 1 + 2 -> 3
                    (Expr::Const(a), Expr::Const(b)) => Box::new(Expr::Const(a + b)),
                    // Identity: x + 0 -> x
                    (expr, Expr::Const(0.0)) | (Expr::Const(0.0), expr) => Box::new(expr.clone()),
                    // x + (-y) -> x - y
                    (x, Expr::Neg(y)) => Expr::Sub(Box::new(x.clone()), y.clone()).simplify(),
                    // Combine like terms: c1*x + c2*x -> (c1+c2)*x
                    (Expr::Mul(a1, x1), Expr::Mul(a2, x2))
                        if x1 == x2
                            && matches!(**a1, Expr::Const(_))
                            && matches!(**a2, Expr::Const(_)) =>
                    {
                        let combined = Expr::Add(a1.clone(), a2.clone()).simplify();
                        Expr::Mul(combined, x1.clone()).simplify()
                    }
                    // Associativity: (x + c1) + c2 -> x + (c1 + c2)
                    (Expr::Add(x, c1), c2)
                        if matches!(**c1, Expr::Const(_)) && matches!(*c2, Expr::Const(_)) =>
                    {
                        Box::new(Expr::Add(
                            x.clone(),
                            Expr::Add(c1.clone(), Box::new(c2.clone())).simplify(),
                        ))
                    }
                    _ => Box::new(Expr::Add(l, r)),
                }
            }

            Expr::Sub(left, right) => {
                let l = left.simplify();
                let r = right.simplify();
                match (&*l, &*r) {
                    // Fold constants: 3 - 2 -> 1
                    (Expr::Const(a), Expr::Const(b)) => Box::new(Expr::Const(a - b)),
                    // Identity: x - 0 -> x
                    (expr, Expr::Const(0.0)) => Box::new(expr.clone()),
                    // 0 - x -> -x
                    (Expr::Const(0.0), expr) => Expr::Neg(Box::new(expr.clone())).simplify(),
                    // Zero: x - x -> 0
                    (a, b) if a == b => Box::new(Expr::Const(0.0)),
                    // x - (-y) -> x + y
                    (x, Expr::Neg(y)) => Box::new(Expr::Add(Box::new(x.clone()), y.clone())),
                    // Combine like terms: c1*x - c2*x -> (c1-c2)*x
                    (Expr::Mul(a1, x1), Expr::Mul(a2, x2))
                        if x1 == x2
                            && matches!(**a1, Expr::Const(_))
                            && matches!(**a2, Expr::Const(_)) =>
                    {
                        let combined = Expr::Sub(a1.clone(), a2.clone()).simplify();
                        Expr::Mul(combined, x1.clone()).simplify()
                    }
                    _ => Box::new(Expr::Sub(l, r)),
                }
            }

            Expr::Mul(left, right) => {
                let l = left.simplify();
                let r = right.simplify();
                match (&*l, &*r) {
                    // Fold constants: 2 * 3 -> 6
                    (Expr::Const(a), Expr::Const(b)) => Box::new(Expr::Const(a * b)),
                    // Zero property: x * 0 -> 0
                    (Expr::Const(0.0), _) | (_, Expr::Const(0.0)) => Box::new(Expr::Const(0.0)),
                    // Identity: x * 1 -> x
                    (expr, Expr::Const(1.0)) | (Expr::Const(1.0), expr) => Box::new(expr.clone()),
                    // Negative one: x * (-1) -> -x
                    (expr, Expr::Const(-1.0)) | (Expr::Const(-1.0), expr) => {
                        Expr::Neg(Box::new(expr.clone())).simplify()
                    }
                    // Constants to the left: x * c -> c * x
                    (expr, Expr::Const(c)) => {
                        Expr::Mul(Box::new(Expr::Const(*c)), Box::new(expr.clone())).simplify()
                    }
                    // Associativity: c1 * (c2 * x) -> (c1 * c2) * x
                    (Expr::Const(c1), Expr::Mul(c2, x)) if matches!(**c2, Expr::Const(_)) => {
                        let folded = Expr::Mul(Box::new(Expr::Const(*c1)), c2.clone()).simplify();
                        Box::new(Expr::Mul(folded, x.clone()))
                    }
                    // Pull negation out: (-x) * y -> -(x * y)
                    (Expr::Neg(x), y) | (y, Expr::Neg(x)) => {
                        Expr::Neg(Box::new(Expr::Mul(x.clone(), Box::new(y.clone())))).simplify()
                    }
                    // Square: x * x -> x^2
                    (a, b) if a == b => Box::new(Expr::Pow(l.clone(), 2)),
                    // Combine exponents: x^a * x^b -> x^(a+b)
                    (Expr::Pow(b1, e1), Expr::Pow(b2, e2)) if b1 == b2 => {
                        Expr::Pow(b1.clone(), e1 + e2).simplify()
                    }
                    // x^a * x -> x^(a+1)
                    (Expr::Pow(b, e), x) | (x, Expr::Pow(b, e)) if **b == *x => {
                        Expr::Pow(b.clone(), e + 1).simplify()
                    }
                    _ => Box::new(Expr::Mul(l, r)),
                }
            }

            Expr::Div(left, right) => {
                let l = left.simplify();
                let r = right.simplify();
                match (&*l, &*r) {
                    // Fold constants: 6 / 2 -> 3
                    (Expr::Const(a), Expr::Const(b)) if *b != 0.0 => Box::new(Expr::Const(a / b)),
                    // Zero numerator: 0 / x -> 0
                    (Expr::Const(0.0), _) => Box::new(Expr::Const(0.0)),
                    // Identity: x / 1 -> x
                    (expr, Expr::Const(1.0)) => Box::new(expr.clone()),
                    // Division by negative one: x / (-1) -> -x
                    (expr, Expr::Const(-1.0)) => Expr::Neg(Box::new(expr.clone())).simplify(),
                    // Identity: x / x -> 1
                    (a, b) if a == b => Box::new(Expr::Const(1.0)),
                    // Pull negation out: (-x) / y -> -(x / y)
                    (Expr::Neg(x), y) => {
                        Expr::Neg(Box::new(Expr::Div(x.clone(), Box::new(y.clone())))).simplify()
                    }
                    // Nested divisions: (x / y) / z -> x / (y * z)
                    (Expr::Div(x, y), z) => Box::new(Expr::Div(
                        x.clone(),
                        Expr::Mul(y.clone(), Box::new(z.clone())).simplify(),
                    )),
                    _ => Box::new(Expr::Div(l, r)),
                }
            }

            Expr::Abs(inner) => {
                let e = inner.simplify();
                match &*e {
                    // Fold constants: abs(-3) -> 3
                    Expr::Const(a) => Box::new(Expr::Const(a.abs())),
                    // Nested abs: abs(abs(x)) -> abs(x)
                    Expr::Abs(_) => e,
                    // abs(-x) -> abs(x)
                    Expr::Neg(x) => Box::new(Expr::Abs(x.clone())),
                    // Even powers are never negative
                    Expr::Pow(_, n) if n % 2 == 0 => e,
                    _ => Box::new(Expr::Abs(e)),
                }
            }

            Expr::Pow(base, exp) => {
                let b = base.simplify();
                match (&*b, *exp) {
                    // x^0 -> 1
                    (_, 0) => Box::new(Expr::Const(1.0)),
                    // Fold constants: 2^3 -> 8
                    (Expr::Const(a), n) => Box::new(Expr::Const(a.powi(n as i32))),
                    // Identity: x^1 -> x
                    (_, 1) => b,
                    // Nested exponents: (x^a)^b -> x^(a*b)
                    (Expr::Pow(inner, inner_exp), n) => {
                        Expr::Pow(inner.clone(), inner_exp * n).simplify()
                    }
                    _ => Box::new(Expr::Pow(b, *exp)),
                }
            }

            Expr::PowFloat(base, exp) => {
                let b = base.simplify();
                match &*b {
                    // Fold constants: 2.0^3.5 -> result
                    Expr::Const(a) => Box::new(Expr::Const(a.powf(*exp))),
                    // Integral exponent: x^2.0 -> x^2
                    _ if exp.fract() == 0.0 && exp.abs() < i32::MAX as f64 => {
                        Expr::Pow(b, *exp as i64).simplify()
                    }
                    _ => Box::new(Expr::PowFloat(b, *exp)),
                }
            }

            Expr::PowExpr(base, exponent) => {
                let b = base.simplify();
                let e = exponent.simplify();
                match (&*b, &*e) {
                    // Fold constants: 2^3 -> 8
                    (Expr::Const(x), Expr::Const(y)) => Box::new(Expr::Const(x.powf(*y))),
                    // Constant exponents become fixed powers
                    (_, Expr::Const(c)) => Expr::PowFloat(b.clone(), *c).simplify(),
                    _ => Box::new(Expr::PowExpr(b, e)),
                }
            }

            Expr::Exp(inner) => {
                let e = inner.simplify();
                match &*e {
                    // Fold constants: exp(c) -> e^c
                    Expr::Const(a) => Box::new(Expr::Const(a.exp())),
                    // exp(ln(x)) -> x
                    Expr::Ln(x) => x.clone(),
                    _ => Box::new(Expr::Exp(e)),
                }
            }

            Expr::Ln(inner) => {
                let e = inner.simplify();
                match &*e {
                    // Fold constants: ln(c) -> ln(c)
                    Expr::Const(a) if *a > 0.0 => Box::new(Expr::Const(a.ln())),
                    // ln(exp(x)) -> x
                    Expr::Exp(x) => x.clone(),
                    _ => Box::new(Expr::Ln(e)),
                }
            }

            Expr::Sqrt(inner) => {
                let e = inner.simplify();
                match &*e {
                    // Fold constants: sqrt(4) -> 2
                    Expr::Const(a) if *a >= 0.0 => Box::new(Expr::Const(a.sqrt())),
                    // sqrt(x^2) -> abs(x)
                    Expr::Pow(x, 2) => Box::new(Expr::Abs(x.clone())),
                    _ => Box::new(Expr::Sqrt(e)),
                }
            }

            Expr::Root(inner, n) => {
                let e = inner.simplify();
                match (&*e, *n) {
                    (_, 1) => e,
                    (Expr::Const(a), n) if n % 2 != 0 || *a >= 0.0 => {
                        Box::new(Expr::Const(real_root(*a, n)))
                    }
                    // Odd roots undo odd powers: (x^n)^(1/n) -> x
                    (Expr::Pow(x, m), n) if *m == n && n % 2 != 0 => x.clone(),
                    _ => Box::new(Expr::Root(e, *n)),
                }
            }

            Expr::Sin(inner) => {
                let e = inner.simplify();
                match &*e {
                    Expr::Const(a) => Box::new(Expr::Const(a.sin())),
                    _ => Box::new(Expr::Sin(e)),
                }
            }

            Expr::Cos(inner) => {
                let e = inner.simplify();
                match &*e {
                    Expr::Const(a) => Box::new(Expr::Const(a.cos())),
                    _ => Box::new(Expr::Cos(e)),
                }
            }

            Expr::Neg(inner) => {
                let e = inner.simplify();
                match &*e {
                    // Fold constants: -(3) -> -3
                    Expr::Const(a) => Box::new(Expr::Const(-a)),
                    // Double negation: -(-x) -> x
                    Expr::Neg(x) => x.clone(),
                    // -(x - y) -> y - x
                    Expr::Sub(x, y) => Box::new(Expr::Sub(y.clone(), x.clone())),
                    // Factor out negation: -(c*x) -> (-c)*x
                    Expr::Mul(c, x) if matches!(**c, Expr::Const(_)) => {
                        Expr::Mul(Box::new(Expr::Neg(c.clone())), x.clone()).simplify()
                    }
                    _ => Box::new(Expr::Neg(e)),
                }
            }
        }
    }

    /// Rebuilds the tree top-down, replacing every node for which `f` returns a value.
    ///
    /// Replaced nodes are not visited again.
    pub fn replace<F>(&self, f: &F) -> Box<Expr>
    where
        F: Fn(&Expr) -> Option<Expr>,
    {
        if let Some(replacement) = f(self) {
            return Box::new(replacement);
        }
        match self {
            Expr::Const(_) | Expr::Symbol(_) | Expr::Time | Expr::Term(_) | Expr::Slot(_) => {
                Box::new(self.clone())
            }
            Expr::Add(l, r) => Box::new(Expr::Add(l.replace(f), r.replace(f))),
            Expr::Sub(l, r) => Box::new(Expr::Sub(l.replace(f), r.replace(f))),
            Expr::Mul(l, r) => Box::new(Expr::Mul(l.replace(f), r.replace(f))),
            Expr::Div(l, r) => Box::new(Expr::Div(l.replace(f), r.replace(f))),
            Expr::PowExpr(l, r) => Box::new(Expr::PowExpr(l.replace(f), r.replace(f))),
            Expr::Pow(base, n) => Box::new(Expr::Pow(base.replace(f), *n)),
            Expr::PowFloat(base, c) => Box::new(Expr::PowFloat(base.replace(f), *c)),
            Expr::Abs(e) => Box::new(Expr::Abs(e.replace(f))),
            Expr::Exp(e) => Box::new(Expr::Exp(e.replace(f))),
            Expr::Ln(e) => Box::new(Expr::Ln(e.replace(f))),
            Expr::Sqrt(e) => Box::new(Expr::Sqrt(e.replace(f))),
            Expr::Root(e, n) => Box::new(Expr::Root(e.replace(f), *n)),
            Expr::Sin(e) => Box::new(Expr::Sin(e.replace(f))),
            Expr::Cos(e) => Box::new(Expr::Cos(e.replace(f))),
            Expr::Neg(e) => Box::new(Expr::Neg(e.replace(f))),
        }
    }

    /// Replaces every occurrence of `term` with `replacement`.
    pub fn substitute(&self, term: &Term, replacement: &Expr) -> Box<Expr> {
        self.replace(&|node| match node {
            Expr::Term(t) if t == term => Some(replacement.clone()),
            _ => None,
        })
    }

    /// Replaces named symbols by the values found in `values`. Unknown names are kept.
    pub fn bind_symbols(&self, values: &HashMap<String, f64>) -> Box<Expr> {
        if values.is_empty() {
            return Box::new(self.clone());
        }
        self.replace(&|node| match node {
            Expr::Symbol(name) => values.get(name).map(|v| Expr::Const(*v)),
            _ => None,
        })
    }

    /// Visits every node in pre-order.
    pub fn visit<F>(&self, f: &mut F)
    where
        F: FnMut(&Expr),
    {
        f(self);
        match self {
            Expr::Const(_) | Expr::Symbol(_) | Expr::Time | Expr::Term(_) | Expr::Slot(_) => {}
            Expr::Add(l, r)
            | Expr::Sub(l, r)
            | Expr::Mul(l, r)
            | Expr::Div(l, r)
            | Expr::PowExpr(l, r) => {
                l.visit(f);
                r.visit(f);
            }
            Expr::Pow(e, _)
            | Expr::PowFloat(e, _)
            | Expr::Abs(e)
            | Expr::Exp(e)
            | Expr::Ln(e)
            | Expr::Sqrt(e)
            | Expr::Root(e, _)
            | Expr::Sin(e)
            | Expr::Cos(e)
            | Expr::Neg(e) => e.visit(f),
        }
    }

    /// All distinct terms referenced by the expression, in `Term` order.
    pub fn terms(&self) -> BTreeSet<Term> {
        let mut out = BTreeSet::new();
        self.visit(&mut |node| {
            if let Expr::Term(t) = node {
                out.insert(*t);
            }
        });
        out
    }

    /// All named symbols referenced by the expression.
    pub fn symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.visit(&mut |node| {
            if let Expr::Symbol(name) = node {
                out.insert(name.clone());
            }
        });
        out
    }

    /// Whether `term` occurs anywhere in the expression.
    pub fn contains_term(&self, term: &Term) -> bool {
        let mut found = false;
        self.visit(&mut |node| found |= matches!(node, Expr::Term(t) if t == term));
        found
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Const(c) if *c == 0.0)
    }

    /// Tries to evaluate the expression as a constant.
    pub fn try_evaluate_constant(&self) -> Option<f64> {
        self.eval_with(&|_| None)
    }

    /// Reference tree-walking evaluation over a state vector.
    ///
    /// Returns `None` when the expression still holds terms or symbols, or refers to a slot
    /// outside `slots`.
    pub fn evaluate(&self, t: f64, slots: &[f64]) -> Option<f64> {
        self.eval_with(&|leaf| match leaf {
            Expr::Time => Some(t),
            Expr::Slot(i) => slots.get(*i as usize).copied(),
            _ => None,
        })
    }

    fn eval_with<F>(&self, leaf: &F) -> Option<f64>
    where
        F: Fn(&Expr) -> Option<f64>,
    {
        let v = match self {
            Expr::Const(c) => *c,
            Expr::Symbol(_) | Expr::Time | Expr::Term(_) | Expr::Slot(_) => leaf(self)?,
            Expr::Add(l, r) => l.eval_with(leaf)? + r.eval_with(leaf)?,
            Expr::Sub(l, r) => l.eval_with(leaf)? - r.eval_with(leaf)?,
            Expr::Mul(l, r) => l.eval_with(leaf)? * r.eval_with(leaf)?,
            Expr::Div(l, r) => l.eval_with(leaf)? / r.eval_with(leaf)?,
            Expr::Abs(e) => e.eval_with(leaf)?.abs(),
            Expr::Pow(e, n) => e.eval_with(leaf)?.powi(*n as i32),
            Expr::PowFloat(e, c) => e.eval_with(leaf)?.powf(*c),
            Expr::PowExpr(b, e) => b.eval_with(leaf)?.powf(e.eval_with(leaf)?),
            Expr::Exp(e) => e.eval_with(leaf)?.exp(),
            Expr::Ln(e) => e.eval_with(leaf)?.ln(),
            Expr::Sqrt(e) => e.eval_with(leaf)?.sqrt(),
            Expr::Root(e, n) => real_root(e.eval_with(leaf)?, *n),
            Expr::Sin(e) => e.eval_with(leaf)?.sin(),
            Expr::Cos(e) => e.eval_with(leaf)?.cos(),
            Expr::Neg(e) => -e.eval_with(leaf)?,
        };
        Some(v)
    }
}

/// Real `n`-th root of `x`. Odd roots are defined on the whole line, even roots give NaN for
/// negative `x`.
pub(crate) fn real_root(x: f64, n: i64) -> f64 {
    match n {
        2 => x.sqrt(),
        3 => x.cbrt(),
        n if n % 2 != 0 => x.signum() * x.abs().powf(1.0 / n as f64),
        n => x.powf(1.0 / n as f64),
    }
}

/// Named symbolic constant, e.g. a model parameter bound later with
/// [`Problem::parameter`](crate::solve::Problem::parameter).
pub fn symbol(name: &str) -> Expr {
    Expr::Symbol(name.to_string())
}

/// The independent variable.
pub fn time() -> Expr {
    Expr::Time
}

pub fn constant(value: f64) -> Expr {
    Expr::Const(value)
}

pub fn sin(e: impl Into<Expr>) -> Expr {
    Expr::Sin(Box::new(e.into()))
}

pub fn cos(e: impl Into<Expr>) -> Expr {
    Expr::Cos(Box::new(e.into()))
}

pub fn exp(e: impl Into<Expr>) -> Expr {
    Expr::Exp(Box::new(e.into()))
}

pub fn ln(e: impl Into<Expr>) -> Expr {
    Expr::Ln(Box::new(e.into()))
}

pub fn sqrt(e: impl Into<Expr>) -> Expr {
    Expr::Sqrt(Box::new(e.into()))
}

/// Real `n`-th root.
pub fn root(e: impl Into<Expr>, n: i64) -> Expr {
    Expr::Root(Box::new(e.into()), n)
}

pub fn abs(e: impl Into<Expr>) -> Expr {
    Expr::Abs(Box::new(e.into()))
}

/// Integer power.
pub fn pow(e: impl Into<Expr>, n: i64) -> Expr {
    Expr::Pow(Box::new(e.into()), n)
}

/// Real power.
pub fn powf(e: impl Into<Expr>, c: f64) -> Expr {
    Expr::PowFloat(Box::new(e.into()), c)
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::Const(value)
    }
}

impl From<i32> for Expr {
    fn from(value: i32) -> Self {
        Expr::Const(value as f64)
    }
}

impl From<Term> for Expr {
    fn from(term: Term) -> Self {
        Expr::Term(term)
    }
}

impl From<&Expr> for Expr {
    fn from(expr: &Expr) -> Self {
        expr.clone()
    }
}

macro_rules! impl_binary_op {
    ($op:ident, $method:ident, $variant:ident) => {
        impl<R: Into<Expr>> std::ops::$op<R> for Expr {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                Expr::$variant(Box::new(self), Box::new(rhs.into()))
            }
        }

        impl<R: Into<Expr>> std::ops::$op<R> for Term {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                Expr::$variant(Box::new(Expr::Term(self)), Box::new(rhs.into()))
            }
        }

        impl std::ops::$op<Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::$variant(Box::new(Expr::Const(self)), Box::new(rhs))
            }
        }

        impl std::ops::$op<Term> for f64 {
            type Output = Expr;
            fn $method(self, rhs: Term) -> Expr {
                Expr::$variant(Box::new(Expr::Const(self)), Box::new(Expr::Term(rhs)))
            }
        }
    };
}

impl_binary_op!(Add, add, Add);
impl_binary_op!(Sub, sub, Sub);
impl_binary_op!(Mul, mul, Mul);
impl_binary_op!(Div, div, Div);

impl std::ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Neg(Box::new(self))
    }
}

impl std::ops::Neg for Term {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Neg(Box::new(Expr::Term(self)))
    }
}

fn write_expr<'a>(
    f: &mut fmt::Formatter<'_>,
    expr: &'a Expr,
    model: Option<&'a Model>,
) -> fmt::Result {
    let sub = |e: &'a Expr| Wrapped(e, model);
    match expr {
        Expr::Const(val) => write!(f, "{val}"),
        Expr::Symbol(name) => write!(f, "{name}"),
        Expr::Time => match model {
            Some(m) => write!(f, "{}", m.independent().name()),
            None => write!(f, "t"),
        },
        Expr::Term(term) => match model {
            Some(m) => write!(f, "{}", m.term_name(term)),
            None => write!(f, "{term}"),
        },
        Expr::Slot(i) => write!(f, "state[{i}]"),
        Expr::Add(l, r) => write!(f, "({} + {})", sub(l), sub(r)),
        Expr::Sub(l, r) => write!(f, "({} - {})", sub(l), sub(r)),
        Expr::Mul(l, r) => write!(f, "({} * {})", sub(l), sub(r)),
        Expr::Div(l, r) => write!(f, "({} / {})", sub(l), sub(r)),
        Expr::Abs(e) => write!(f, "|{}|", sub(e)),
        Expr::Pow(b, n) => write!(f, "({}^{n})", sub(b)),
        Expr::PowFloat(b, c) => write!(f, "({}^{c})", sub(b)),
        Expr::PowExpr(b, e) => write!(f, "({}^{})", sub(b), sub(e)),
        Expr::Exp(e) => write!(f, "exp({})", sub(e)),
        Expr::Ln(e) => write!(f, "ln({})", sub(e)),
        Expr::Sqrt(e) => write!(f, "sqrt({})", sub(e)),
        Expr::Root(e, n) => write!(f, "root({}, {n})", sub(e)),
        Expr::Sin(e) => write!(f, "sin({})", sub(e)),
        Expr::Cos(e) => write!(f, "cos({})", sub(e)),
        Expr::Neg(e) => write!(f, "-({})", sub(e)),
    }
}

struct Wrapped<'a>(&'a Expr, Option<&'a Model>);

impl fmt::Display for Wrapped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_expr(f, self.0, self.1)
    }
}

/// Formats expressions in standard mathematical notation.
///
/// Binary operations are wrapped in parentheses, functions use call notation and absolute
/// values use `|x|`. Terms are shown by handle (`v0''`); use [`Model::render`] for names.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_expr(f, self, None)
    }
}

/// An expression displayed with the variable names of its [`Model`].
pub struct RenderedExpr<'a> {
    expr: &'a Expr,
    model: &'a Model,
}

impl<'a> RenderedExpr<'a> {
    pub(crate) fn new(expr: &'a Expr, model: &'a Model) -> Self {
        Self { expr, model }
    }
}

impl fmt::Display for RenderedExpr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_expr(f, self.expr, Some(self.model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Model, Term, Term) {
        let mut model = Model::new();
        let x = model.var("x");
        let y = model.var("y");
        (model, x, y)
    }

    #[test]
    fn test_simplify() {
        let (_, x, _) = setup();
        let x = Expr::Term(x);

        // 2 + 3 → 5
        assert_eq!(*(constant(2.0) + 3.0).simplify(), Expr::Const(5.0));
        // x + 0 → x
        assert_eq!(*(x.clone() + 0.0).simplify(), x);
        // x * 1 → x
        assert_eq!(*(x.clone() * 1.0).simplify(), x);
        // x * 0 → 0
        assert_eq!(*(x.clone() * 0.0).simplify(), Expr::Const(0.0));
        // x / 1 → x
        assert_eq!(*(x.clone() / 1.0).simplify(), x);
        // x / x → 1
        assert_eq!(*(x.clone() / x.clone()).simplify(), Expr::Const(1.0));
        // x^0 → 1, x^1 → x
        assert_eq!(*pow(x.clone(), 0).simplify(), Expr::Const(1.0));
        assert_eq!(*pow(x.clone(), 1).simplify(), x);
        // |-3| → 3
        assert_eq!(*abs(-3.0).simplify(), Expr::Const(3.0));
        // ||x|| → |x|
        assert_eq!(*abs(abs(x.clone())).simplify(), abs(x.clone()));
        // -(-x) → x
        assert_eq!(*(-(-x.clone())).simplify(), x);
    }

    #[test]
    fn test_simplify_like_terms() {
        let (_, x, _) = setup();
        let e = 2.0 * x + 3.0 * x;
        assert_eq!(*e.simplify(), 5.0 * x);

        let e = (x * 4.0) - (x * 4.0);
        assert_eq!(*e.simplify(), Expr::Const(0.0));
    }

    #[test]
    fn test_derivative() {
        let (_, x, y) = setup();
        let wrt = Wrt::Term(x);

        assert_eq!(*constant(5.0).derivative(&wrt), Expr::Const(0.0));
        assert_eq!(*x.expr().derivative(&wrt), Expr::Const(1.0));
        assert_eq!(*y.expr().derivative(&wrt), Expr::Const(0.0));
        // x' is an independent leaf
        assert_eq!(*x.d(1).expr().derivative(&wrt), Expr::Const(0.0));

        // d/dx(x * y) = y
        assert_eq!(*(x * y).derivative(&wrt).simplify(), y.expr());
        // d/dx(x^3) = 3 x^2
        assert_eq!(*pow(x, 3).derivative(&wrt).simplify(), 3.0 * pow(x, 2));
        // d/dx sin(x) = cos(x)
        assert_eq!(*sin(x).derivative(&wrt).simplify(), cos(x));
    }

    #[test]
    fn test_time_derivative() {
        let (_, x, y) = setup();
        // d/dt (x * y') = x * y'' + y' * x'
        let e = x * y.d(1);
        let expected = x * y.d(2) + y.d(1) * x.d(1);
        assert_eq!(*e.time_derivative(), expected);
        // d/dt t = 1
        assert_eq!(*time().time_derivative(), Expr::Const(1.0));
    }

    #[test]
    fn test_substitute_and_terms() {
        let (_, x, y) = setup();
        let e = x.d(2) + 3.0 * y;
        let replaced = e.substitute(&x.d(2), &sin(y));
        assert_eq!(*replaced, sin(y) + 3.0 * y);
        assert_eq!(e.terms().into_iter().collect::<Vec<_>>(), vec![x.d(2), y]);
        assert!(e.contains_term(&y));
        assert!(!replaced.contains_term(&x.d(2)));
    }

    #[test]
    fn test_bind_symbols() {
        let (_, x, _) = setup();
        let e = symbol("k") * x;
        assert_eq!(e.symbols().into_iter().collect::<Vec<_>>(), vec!["k".to_string()]);
        let values = HashMap::from([("k".to_string(), 4.0)]);
        assert_eq!(*e.bind_symbols(&values), 4.0 * x);
    }

    #[test]
    fn test_evaluate() {
        let e = Expr::Slot(0) * Expr::Slot(1) + time();
        assert_eq!(e.evaluate(0.5, &[2.0, 3.0]), Some(6.5));
        assert_eq!(e.evaluate(0.5, &[2.0]), None);
        assert_eq!(symbol("a").try_evaluate_constant(), None);
        assert_eq!((sqrt(16.0) + 1.0).try_evaluate_constant(), Some(5.0));
    }

    #[test]
    fn test_root_and_repeated_factors() {
        let (_, x, _) = setup();
        // x * x * x -> x^3
        assert_eq!(*(x * x * x).simplify(), pow(x, 3));
        // (x^3)^(1/3) -> x
        assert_eq!(*root(pow(x, 3), 3).simplify(), x.expr());
        assert_eq!(root(-8.0, 3).try_evaluate_constant(), Some(-2.0));
        assert!(real_root(-4.0, 2).is_nan());

        // d/dx x^(1/3) at x = 8 is 1 / (3 * 4)
        let d = root(x, 3).derivative(&Wrt::Term(x));
        let value = d.substitute(&x, &Expr::Const(8.0)).try_evaluate_constant();
        assert!((value.unwrap_or(f64::NAN) - 1.0 / 12.0).abs() < 1e-12);
    }

    #[test]
    fn test_display() {
        let (model, x, y) = setup();
        assert_eq!(format!("{}", Expr::Const(5.0)), "5");
        let sum = x + y;
        assert_eq!(format!("{}", model.render(&sum)), "(x + y)");
        let complex = (pow(x.d(1), 2) + y) / time();
        assert_eq!(format!("{}", model.render(&complex)), "(((x'^2) + y) / t)");
        assert_eq!(format!("{}", Expr::Slot(3)), "state[3]");
        assert_eq!(format!("{}", abs(exp(x))), "|exp(v0)|");
    }
}
