//! Equations between symbolic expressions.
//!
//! An [`Equation`] holds a left and a right hand side and means `lhs - rhs = 0`. Equations
//! are built with [`eq`], converted from a bare expression (right hand side zero), or parsed
//! from text with [`Equation::parse`].
//!
//! # Example
//! ```
//! use odejit::equation::{eq, Equation};
//! use odejit::symbols::Model;
//!
//! let mut model = Model::new();
//! let y = model.var("y");
//!
//! let built = eq(y.d(2) + y, 0.0);
//! let parsed = Equation::parse(&model, "d(y, 2) + y", "0").unwrap();
//! assert_eq!(built, parsed);
//! ```

use std::collections::BTreeSet;
use std::fmt;

use colored::Colorize;
use evalexpr::{build_operator_tree, DefaultNumericTypes};

use crate::convert::build_expr;
use crate::errors::OdeError;
use crate::expr::Expr;
use crate::symbols::{Model, Term};

/// `lhs = rhs`, semantically `lhs - rhs = 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Equation {
    pub lhs: Expr,
    pub rhs: Expr,
}

/// Builds the equation `lhs = rhs`.
pub fn eq(lhs: impl Into<Expr>, rhs: impl Into<Expr>) -> Equation {
    Equation::new(lhs, rhs)
}

impl Equation {
    pub fn new(lhs: impl Into<Expr>, rhs: impl Into<Expr>) -> Self {
        Self {
            lhs: lhs.into(),
            rhs: rhs.into(),
        }
    }

    /// Parses both sides from text, resolving names against `model`.
    pub fn parse(model: &Model, lhs: &str, rhs: &str) -> Result<Self, OdeError> {
        Ok(Self {
            lhs: parse_side(model, lhs)?,
            rhs: parse_side(model, rhs)?,
        })
    }

    /// Parses an expression that must vanish.
    pub fn parse_residual(model: &Model, text: &str) -> Result<Self, OdeError> {
        Ok(Self::from(parse_side(model, text)?))
    }

    /// `lhs - rhs`, or just `lhs` when the right hand side is zero.
    pub fn residual(&self) -> Expr {
        if self.rhs.is_zero() {
            self.lhs.clone()
        } else {
            Expr::Sub(Box::new(self.lhs.clone()), Box::new(self.rhs.clone()))
        }
    }

    /// All terms referenced on either side.
    pub fn terms(&self) -> BTreeSet<Term> {
        let mut terms = self.lhs.terms();
        terms.extend(self.rhs.terms());
        terms
    }

    /// Displays the equation with variable names from `model`.
    pub fn display<'a>(&'a self, model: &'a Model) -> RenderedEquation<'a> {
        RenderedEquation {
            equation: self,
            model,
        }
    }
}

fn parse_side(model: &Model, text: &str) -> Result<Expr, OdeError> {
    let node = build_operator_tree::<DefaultNumericTypes>(text)?;
    Ok(build_expr(&node, model)?)
}

impl From<Expr> for Equation {
    fn from(lhs: Expr) -> Self {
        Self::new(lhs, 0.0)
    }
}

impl From<Term> for Equation {
    fn from(lhs: Term) -> Self {
        Self::new(lhs, 0.0)
    }
}

pub struct RenderedEquation<'a> {
    equation: &'a Equation,
    model: &'a Model,
}

impl fmt::Display for RenderedEquation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.model.render(&self.equation.lhs),
            "=".cyan(),
            self.model.render(&self.equation.rhs)
        )
    }
}

/// Anything `solve` accepts as its equations: one equation or a collection.
pub trait EquationSet {
    fn into_equations(self) -> Vec<Equation>;
}

impl EquationSet for Equation {
    fn into_equations(self) -> Vec<Equation> {
        vec![self]
    }
}

impl EquationSet for Expr {
    fn into_equations(self) -> Vec<Equation> {
        vec![Equation::from(self)]
    }
}

impl EquationSet for Vec<Equation> {
    fn into_equations(self) -> Vec<Equation> {
        self
    }
}

impl EquationSet for &[Equation] {
    fn into_equations(self) -> Vec<Equation> {
        self.to_vec()
    }
}

impl<const N: usize> EquationSet for [Equation; N] {
    fn into_equations(self) -> Vec<Equation> {
        self.into()
    }
}
