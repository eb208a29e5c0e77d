//! Compiled first-order systems.
//!
//! [`CompiledSystem::compile`] takes the isolated right-hand sides of a [`FirstOrderSystem`]
//! and turns them into native functions of `(t, x)` over the state vector described by its
//! [`StateMap`]. Before any code is generated every expression is checked for leaves the
//! native code cannot evaluate: a variable or derivative reference that survived the
//! reduction, a parameter symbol that was never bound, or a slot outside the state.
//!
//! # Example
//!
//! ```
//! use odejit::algebra::BuiltinAlgebra;
//! use odejit::analyze::{expand_vector_equations, infer_orders, resolve_orders};
//! use odejit::equation::Equation;
//! use odejit::isolate::isolate;
//! use odejit::state::StateMap;
//! use odejit::symbols::Model;
//! use odejit::system::CompiledSystem;
//!
//! let mut model = Model::new();
//! let y = model.var("y");
//! let equations = expand_vector_equations(&model, &[Equation::from(y.d(2) + y)]).unwrap();
//! let inferred = infer_orders(&model, &equations).unwrap();
//! let orders = resolve_orders(&model, &inferred, &Default::default()).unwrap();
//! let state_map = StateMap::new(&model, &orders);
//! let first_order = isolate(&model, &equations, &state_map, &BuiltinAlgebra).unwrap();
//!
//! let system = CompiledSystem::compile(&model, &first_order).unwrap();
//! let dx = system.rhs(0.0, &[1.0, 0.5]).unwrap();
//! assert_eq!(dx, vec![0.5, -1.0]); // [y', -y]
//! ```

use std::fmt;

use log::debug;

use crate::builder::build_functions;
use crate::errors::{CompileError, OdeError};
use crate::expr::Expr;
use crate::integrate::VectorField;
use crate::isolate::FirstOrderSystem;
use crate::state::StateMap;
use crate::symbols::Model;
use crate::types::{JacobianFunction, RhsFunction};

/// Native `f(t, x)` and optional `J(t, x)` of a first-order system.
#[derive(Clone)]
pub struct CompiledSystem {
    dimension: usize,
    rhs: RhsFunction,
    jacobian: Option<JacobianFunction>,
    state_map: StateMap,
}

impl CompiledSystem {
    /// Checks the expressions of `system` and compiles them.
    ///
    /// # Errors
    /// - [`CompileError::UnresolvedSymbol`] for a variable reference or unbound symbol
    /// - [`CompileError::SlotOutOfRange`] for a slot outside the state vector
    /// - [`CompileError::Builder`] when code generation fails
    pub fn compile(model: &Model, system: &FirstOrderSystem) -> Result<Self, CompileError> {
        let dimension = system.dimension();
        for (slot, expr) in system.rhs.iter().enumerate() {
            check_leaves(model, slot, expr, dimension)?;
        }
        if let Some(rows) = &system.jacobian {
            for (slot, entry) in rows.iter().flatten().enumerate() {
                check_leaves(model, slot / dimension.max(1), entry, dimension)?;
            }
        }

        let native = build_functions(&system.rhs, system.jacobian.as_deref())?;
        debug!(
            "compiled system of dimension {dimension} ({})",
            if native.jacobian.is_some() {
                "with Jacobian"
            } else {
                "without Jacobian"
            }
        );

        Ok(Self {
            dimension,
            rhs: native.rhs,
            jacobian: native.jacobian,
            state_map: system.state_map.clone(),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn state_map(&self) -> &StateMap {
        &self.state_map
    }

    pub fn has_jacobian(&self) -> bool {
        self.jacobian.is_some()
    }

    /// The compiled vector field.
    pub fn rhs_function(&self) -> &RhsFunction {
        &self.rhs
    }

    /// The compiled Jacobian, if one was built.
    pub fn jacobian_function(&self) -> Option<&JacobianFunction> {
        self.jacobian.as_ref()
    }

    /// Evaluates `f(t, x)` into `out`.
    ///
    /// # Errors
    /// Returns [`OdeError::InvalidInputLength`] if `x` or `out` does not hold exactly
    /// `dimension` values.
    pub fn rhs_into<'a>(&self, t: f64, x: &[f64], out: &'a mut [f64]) -> Result<&'a [f64], OdeError> {
        self.check_length(x.len(), self.dimension)?;
        self.check_length(out.len(), self.dimension)?;
        (self.rhs)(t, x, out);
        Ok(out)
    }

    /// Evaluates `f(t, x)`.
    pub fn rhs(&self, t: f64, x: &[f64]) -> Result<Vec<f64>, OdeError> {
        let mut out = vec![0.0; self.dimension];
        self.rhs_into(t, x, &mut out)?;
        Ok(out)
    }

    /// Evaluates the row-major Jacobian into `out` (`dimension²` values).
    ///
    /// Returns `Ok(false)` and leaves `out` untouched when no Jacobian was built.
    pub fn jacobian_into(&self, t: f64, x: &[f64], out: &mut [f64]) -> Result<bool, OdeError> {
        self.check_length(x.len(), self.dimension)?;
        self.check_length(out.len(), self.dimension * self.dimension)?;
        match &self.jacobian {
            Some(jacobian) => {
                jacobian(t, x, out);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Evaluates the Jacobian as rows, if one was built.
    pub fn jacobian(&self, t: f64, x: &[f64]) -> Result<Option<Vec<Vec<f64>>>, OdeError> {
        let n = self.dimension;
        let mut entries = vec![0.0; n * n];
        if !self.jacobian_into(t, x, &mut entries)? {
            return Ok(None);
        }
        Ok(Some(entries.chunks(n.max(1)).map(<[f64]>::to_vec).collect()))
    }

    fn check_length(&self, got: usize, expected: usize) -> Result<(), OdeError> {
        if got != expected {
            return Err(OdeError::InvalidInputLength { expected, got });
        }
        Ok(())
    }
}

impl VectorField for CompiledSystem {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn rhs(&self, t: f64, x: &[f64], out: &mut [f64]) {
        (self.rhs)(t, x, out)
    }

    fn jacobian(&self, t: f64, x: &[f64], out: &mut [f64]) -> bool {
        match &self.jacobian {
            Some(jacobian) => {
                jacobian(t, x, out);
                true
            }
            None => false,
        }
    }

    fn has_jacobian(&self) -> bool {
        self.jacobian.is_some()
    }
}

impl fmt::Debug for CompiledSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSystem")
            .field("dimension", &self.dimension)
            .field("jacobian", &self.jacobian.is_some())
            .field("state_map", &self.state_map)
            .finish()
    }
}

/// First leaf of `expr` that native code cannot evaluate.
fn check_leaves(model: &Model, slot: usize, expr: &Expr, size: usize) -> Result<(), CompileError> {
    let mut error = None;
    expr.visit(&mut |node| {
        if error.is_some() {
            return;
        }
        error = match node {
            Expr::Term(term) => Some(CompileError::UnresolvedSymbol {
                slot,
                symbol: model.term_name(term),
            }),
            Expr::Symbol(name) => Some(CompileError::UnresolvedSymbol {
                slot,
                symbol: name.clone(),
            }),
            Expr::Slot(index) if *index as usize >= size => Some(CompileError::SlotOutOfRange {
                slot,
                index: *index,
                size,
            }),
            _ => None,
        };
    });
    error.map_or(Ok(()), Err)
}
