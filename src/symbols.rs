//! Variable registry and derivative references.
//!
//! Variables are identified by a [`VarId`] handle issued by a [`Model`]. The name, shape and
//! declared order are metadata only: registering the same name twice yields two distinct
//! variables, and equality between references is always decided by the handle.
//!
//! A [`Term`] is the leaf used inside expressions. It points at a variable, optionally at one
//! component of a vector variable, and at a derivative level (`0` is the variable itself).
//!
//! # Example
//! ```
//! use odejit::symbols::Model;
//!
//! let mut model = Model::new();
//! let y = model.var("y");
//! let u = model.vector("u", 2);
//!
//! assert_eq!(y.d(2).level, 2);
//! assert_eq!(u.at(1).d(1).component, Some(1));
//! assert_eq!(model.term_name(&u.at(1).d(1)), "u[1]'");
//! ```

use std::fmt;

use crate::equation::EquationSet;
use crate::expr::{Expr, RenderedExpr};
use crate::solve::Problem;

/// Opaque handle of a variable registered in a [`Model`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(u32);

impl VarId {
    /// Position of the variable in its registry.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Shape of a dependent variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Scalar,
    Vector(usize),
}

impl Shape {
    /// Number of scalar components (1 for scalars).
    pub fn components(&self) -> usize {
        match self {
            Shape::Scalar => 1,
            Shape::Vector(n) => *n,
        }
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, Shape::Vector(_))
    }
}

/// Metadata stored for every registered variable.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableInfo {
    pub name: String,
    pub shape: Shape,
    /// Order the user declared for validation. Never used for inference.
    pub declared_order: Option<usize>,
}

/// The independent variable all derivatives are taken against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndependentVariable {
    name: String,
}

impl IndependentVariable {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Default for IndependentVariable {
    fn default() -> Self {
        Self::new("t")
    }
}

/// Reference to a variable, one of its components, or one of their derivatives.
///
/// `component` is `None` for scalar variables and for whole-vector references. Whole-vector
/// references are expanded into one scalar equation per component during order analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Term {
    pub var: VarId,
    pub component: Option<usize>,
    pub level: usize,
}

impl Term {
    /// The `n`-th derivative of this term.
    pub fn d(self, n: usize) -> Term {
        Term {
            level: self.level + n,
            ..self
        }
    }

    /// Component `i` of a vector term, keeping the derivative level.
    pub fn at(self, i: usize) -> Term {
        Term {
            component: Some(i),
            ..self
        }
    }

    /// The same reference at level 0.
    pub fn base(self) -> Term {
        Term { level: 0, ..self }
    }

    /// The same reference at an explicit level.
    pub fn with_level(self, level: usize) -> Term {
        Term { level, ..self }
    }

    pub fn expr(self) -> Expr {
        Expr::Term(self)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.var.0)?;
        if let Some(i) = self.component {
            write!(f, "[{i}]")?;
        }
        write_level(f, self.level)
    }
}

fn write_level(f: &mut impl fmt::Write, level: usize) -> fmt::Result {
    match level {
        0 => Ok(()),
        1..=3 => f.write_str(&"'".repeat(level)),
        n => write!(f, "^({n})"),
    }
}

/// Registry issuing variable handles, together with the independent variable.
#[derive(Debug, Clone, Default)]
pub struct Model {
    vars: Vec<VariableInfo>,
    independent: IndependentVariable,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a model whose independent variable has a custom name.
    pub fn with_independent(name: impl Into<String>) -> Self {
        Self {
            vars: Vec::new(),
            independent: IndependentVariable::new(name),
        }
    }

    fn register(&mut self, name: &str, shape: Shape, declared_order: Option<usize>) -> Term {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(VariableInfo {
            name: name.to_string(),
            shape,
            declared_order,
        });
        Term {
            var: id,
            component: None,
            level: 0,
        }
    }

    /// Registers a scalar variable and returns its level-0 term.
    pub fn var(&mut self, name: &str) -> Term {
        self.register(name, Shape::Scalar, None)
    }

    /// Registers a scalar variable with a declared order.
    pub fn var_with_order(&mut self, name: &str, order: usize) -> Term {
        self.register(name, Shape::Scalar, Some(order))
    }

    /// Registers a vector variable with `n` components.
    ///
    /// A vector always has at least one component: `n = 0` registers a one-component vector,
    /// so that every variable owns state slots and initial values.
    pub fn vector(&mut self, name: &str, n: usize) -> Term {
        self.register(name, Shape::Vector(n.max(1)), None)
    }

    /// Registers a vector variable with a declared order. `n = 0` is raised to one component
    /// as in [`Model::vector`].
    pub fn vector_with_order(&mut self, name: &str, n: usize, order: usize) -> Term {
        self.register(name, Shape::Vector(n.max(1)), Some(order))
    }

    pub fn independent(&self) -> &IndependentVariable {
        &self.independent
    }

    /// Metadata of a variable. Returns `None` for handles from another registry.
    pub fn get(&self, id: VarId) -> Option<&VariableInfo> {
        self.vars.get(id.index())
    }

    /// Metadata of a variable issued by this model.
    ///
    /// # Panics
    /// Panics if `id` was not issued by this model.
    pub fn info(&self, id: VarId) -> &VariableInfo {
        &self.vars[id.index()]
    }

    pub fn name(&self, id: VarId) -> &str {
        self.get(id).map(|info| info.name.as_str()).unwrap_or("?")
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// All handles registered under `name`, in registration order.
    pub fn lookup(&self, name: &str) -> Vec<VarId> {
        self.vars
            .iter()
            .enumerate()
            .filter(|(_, info)| info.name == name)
            .map(|(i, _)| VarId(i as u32))
            .collect()
    }

    /// Human readable name of a term, e.g. `x`, `y''`, `u[1]'`, `z^(4)`.
    pub fn term_name(&self, term: &Term) -> String {
        let mut out = self.name(term.var).to_string();
        if let Some(i) = term.component {
            out.push_str(&format!("[{i}]"));
        }
        // Writing into a String cannot fail.
        let _ = write_level(&mut out, term.level);
        out
    }

    /// Displays an expression with variable names from this model.
    pub fn render<'a>(&'a self, expr: &'a Expr) -> RenderedExpr<'a> {
        RenderedExpr::new(expr, self)
    }

    /// Starts a [`Problem`] over the given equations.
    pub fn problem(&self, equations: impl EquationSet) -> Problem<'_> {
        Problem::new(self, equations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_not_name() {
        let mut model = Model::new();
        let a = model.var("x");
        let b = model.var("x");
        assert_ne!(a, b);
        assert_eq!(model.lookup("x"), vec![a.var, b.var]);
    }

    #[test]
    fn test_derivative_references() {
        let mut model = Model::new();
        let y = model.var("y");
        assert_eq!(y.d(1).d(1), y.d(2));
        assert_eq!(y.d(0), y);
        assert_eq!(y.d(3).base(), y);
    }

    #[test]
    fn test_shapes() {
        let mut model = Model::new();
        let u = model.vector("u", 3);
        let s = model.vector("s", 1);
        assert_eq!(model.info(u.var).shape, Shape::Vector(3));
        assert_eq!(model.info(s.var).shape.components(), 1);

        // Empty vectors are raised to one component
        let e = model.vector("e", 0);
        let f = model.vector_with_order("f", 0, 2);
        assert_eq!(model.info(e.var).shape, Shape::Vector(1));
        assert_eq!(model.info(f.var).shape, Shape::Vector(1));
        assert_eq!(model.info(f.var).declared_order, Some(2));
    }

    #[test]
    fn test_term_names() {
        let mut model = Model::with_independent("tau");
        let x = model.var_with_order("x", 2);
        assert_eq!(model.term_name(&x), "x");
        assert_eq!(model.term_name(&x.d(2)), "x''");
        assert_eq!(model.term_name(&x.d(5)), "x^(5)");
        assert_eq!(model.independent().name(), "tau");
        assert_eq!(model.info(x.var).declared_order, Some(2));
    }
}
