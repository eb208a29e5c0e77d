//! Symbolic ordinary differential equations compiled to native code.
//!
//! Equations are written over the variables of a [`Model`](symbols::Model) and their
//! derivatives. The crate infers the order of every variable, checks the initial values
//! against it, flattens the system into a first-order state vector, isolates the highest
//! derivatives, JIT compiles the vector field (and its Jacobian) with
//! [Cranelift](https://github.com/bytecodealliance/wasmtime/tree/main/cranelift) and
//! integrates it with an adaptive Runge-Kutta method. Single scalar linear equations can also
//! be solved in closed form.
//!
//! # Features
//!
//! - Scalar and vector variables of any order, mixed in one system
//! - Exact initial-value validation with diagnostics naming variable and level
//! - Symbolic Jacobian, used by the stiff integrator
//! - Dormand-Prince 5(4) with automatic switching to a Rosenbrock method on stiffness
//! - Dense output by cubic Hermite interpolation
//! - Text front-end based on [evalexpr](https://github.com/ISibboI/evalexpr)
//!
//! # Example
//!
//! ```rust
//! use odejit::prelude::*;
//!
//! let mut model = Model::new();
//! let x = model.var("x");
//! let u = model.vector("u", 2);
//!
//! // x'' = -x, u' = -u
//! let solution = model
//!     .problem(vec![eq(x.d(2), -x), eq(u.d(1), -u)])
//!     .ivp(
//!         InitialValues::new()
//!             .set(x, 1.0)
//!             .set(x.d(1), 0.0)
//!             .set(u, [1.0, 2.0]),
//!     )
//!     .t_span(0.0, 1.0)
//!     .solve_numeric()
//!     .unwrap();
//!
//! assert_eq!(solution.state_map().len(), 4);
//! let u1 = solution.eval(u, 1.0).unwrap();
//! assert!((u1[1] - 2.0 * (-1.0f64).exp()).abs() < 1e-5);
//! ```

pub use equation::{eq, Equation};
pub use errors::OdeError;
pub use solve::{solve, Backend, Problem, SolveOutput};

pub mod prelude {
    pub use crate::algebra::{Algebra, BuiltinAlgebra};
    pub use crate::equation::{eq, Equation};
    pub use crate::errors::OdeError;
    pub use crate::expr::{abs, cos, exp, ln, pow, powf, sin, sqrt, symbol, time, Expr};
    pub use crate::integrate::{IntegratorOptions, Method};
    pub use crate::solution::{ClosedFormSolution, Solution};
    pub use crate::solve::{solve, Backend, Problem, SolveOutput};
    pub use crate::symbols::{Model, Term};
    pub use crate::validate::InitialValues;
}

/// Algebra engine interface and the built-in engine
pub mod algebra;
/// Order analysis and vector-equation expansion
pub mod analyze;
/// JIT compilation using Cranelift
pub mod builder;
/// Conversion from parsed expressions to `Expr`
pub mod convert;
/// Equations and their text form
pub mod equation;
/// Error types for the various failure modes
pub mod errors;
/// Expression tree representation and symbolic differentiation
pub mod expr;
/// Adaptive integrators
pub mod integrate;
/// Highest-derivative isolation
pub mod isolate;
/// Math functions linked into the generated code
pub(crate) mod operators;
/// Solution accessors
pub mod solution;
/// The `solve` entry point
pub mod solve;
/// State-vector layout
pub mod state;
/// Variables and derivative references
pub mod symbols;
/// Compiled first-order systems
pub mod system;
/// Compiled function signatures
pub mod types;
/// Initial-value validation
pub mod validate;
