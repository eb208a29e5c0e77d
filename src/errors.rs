//! Error types for the odejit crate.
//!
//! This module defines the errors raised along the pipeline, from parsing equations to
//! integrating them. The main error types are:
//!
//! - `ConvertError`: Errors during conversion from an evalexpr parse tree to `Expr`
//! - `BuilderError`: Errors during JIT compilation with Cranelift
//! - `AlgebraError`: Failures reported by the algebra collaborator
//! - `CompileError`: Residual symbols or code generation failures in the numeric compiler
//! - `IntegrationError`: Step size underflow and other integrator failures
//! - `OdeError`: The error returned by `solve` and the solution accessors
//!
//! Every variant carries the variable name, derivative level or slot index needed to
//! diagnose it.

use cranelift_codegen::CodegenError;
use cranelift_module::ModuleError;
use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

/// Errors that can occur during conversion from an evalexpr parse tree to an `Expr`.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// Error when the exponent of `^` cannot be represented
    #[error("Could not convert exponent in Exp operator: {0}")]
    ExpOperator(String),
    /// Error when encountering an operator that is not supported by our implementation
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// Error when encountering a function that is not supported by our implementation
    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),
    /// Error when the root node does not have exactly one child
    #[error("Expected single child for root node: {0}")]
    RootNode(String),
    /// Error when a constant value is not numeric
    #[error("Expected numeric constant: {0}")]
    ConstOperator(String),
    /// Error when a name refers to more than one registered variable
    #[error("Ambiguous variable name: {0}")]
    AmbiguousVariable(String),
    /// Error when a function receives the wrong arguments
    #[error("Invalid arguments for {function}: {reason}")]
    InvalidArguments { function: String, reason: String },
}

/// Errors that can occur during JIT compilation of expressions.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// Error when the target machine architecture is not supported
    #[error("host machine is not supported: {0}")]
    HostMachineNotSupported(String),
    /// Error during Cranelift code generation
    #[error("codegen error: {0}")]
    CodegenError(CodegenError),
    /// Error in the Cranelift JIT module
    #[error("module error: {0}")]
    ModuleError(ModuleError),
    /// Error when defining the JIT function
    #[error("function error: {0}")]
    FunctionError(String),
    /// Error when declaring the JIT function or one of its imports
    #[error("declaration error: {0}")]
    DeclarationError(String),
    /// Error when configuring the code generator
    #[error("settings error: {0}")]
    SettingsError(String),
}

/// Failures reported by an [`Algebra`](crate::algebra::Algebra) implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlgebraError {
    /// No closed-form isolation or solution exists
    #[error("unsolvable: {0}")]
    Unsolvable(String),
    /// The expression contains a construct that cannot be differentiated
    #[error("not differentiable: {0}")]
    NonDifferentiable(String),
    /// The request is outside what the engine supports
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Errors raised while turning symbolic right-hand sides into native functions.
#[derive(Error, Debug)]
pub enum CompileError {
    /// An expression still refers to a variable or named symbol after reduction
    #[error("slot {slot} still references unresolved symbol `{symbol}`")]
    UnresolvedSymbol { slot: usize, symbol: String },
    /// An expression refers to a state slot that does not exist
    #[error("slot {slot} references state index {index} outside a state of size {size}")]
    SlotOutOfRange { slot: usize, index: u32, size: usize },
    /// Error when JIT compiling the expressions
    #[error("Failed to build JIT function")]
    Builder(#[from] BuilderError),
}

/// Errors raised by the adaptive integrator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntegrationError {
    #[error("step size underflow at t = {t}: h = {h:e}")]
    StepSizeUnderflow { t: f64, h: f64 },
    #[error("maximum number of steps ({max_steps}) exceeded at t = {t}")]
    MaxStepsExceeded { t: f64, max_steps: usize },
    #[error("non-finite state encountered at t = {t}")]
    NonFiniteState { t: f64 },
    #[error("singular iteration matrix at t = {t}")]
    SingularMatrix { t: f64 },
    #[error("invalid integrator options: {0}")]
    InvalidOptions(String),
}

/// High-level errors returned by `solve` and the solution accessors.
#[derive(Error, Debug)]
pub enum OdeError {
    /// The initial values leave a derivative level of a variable uncovered
    #[error("missing initial condition for `{variable}` at derivative level {level}")]
    MissingInitialCondition { variable: String, level: usize },
    /// Extra, duplicate or out-of-range initial values
    #[error("overdetermined initial conditions for `{variable}` at level {level}: {reason}")]
    OverdeterminedConditions {
        variable: String,
        level: usize,
        reason: String,
    },
    /// Declared and inferred orders disagree
    #[error("order mismatch for `{variable}`: {reason}")]
    OrderMismatch { variable: String, reason: String },
    /// A vector value or vector reference has the wrong number of components
    #[error("shape mismatch for `{variable}`: expected {expected} components, got {got}")]
    ShapeMismatch {
        variable: String,
        expected: usize,
        got: usize,
    },
    /// A component index beyond the variable's shape
    #[error("component {component} out of range for `{variable}` with {components} components")]
    ComponentOutOfRange {
        variable: String,
        component: usize,
        components: usize,
    },
    /// The highest-order term of an equation cannot be solved for
    #[error("cannot isolate `{term}` in equation {equation}: {reason}")]
    UnsolvableIsolation {
        equation: usize,
        term: String,
        reason: String,
    },
    /// Number of equations does not match the number of highest-order unknowns
    #[error("system has {equations} equations for {unknowns} unknowns: {detail}")]
    UnderOrOverdeterminedSystem {
        equations: usize,
        unknowns: usize,
        detail: String,
    },
    /// Residual symbols or code generation failures
    #[error("compilation failed: {0}")]
    Compilation(#[from] CompileError),
    /// Step size underflow or other non-convergence
    #[error("integration failed: {0}")]
    IntegrationFailure(#[from] IntegrationError),
    /// The algebra collaborator raised or declined
    #[error("backend error: {0}")]
    Backend(String),
    /// Error when parsing an equation string with evalexpr
    #[error("Failed to build Evalexpr AST")]
    Parse(#[from] EvalexprError<DefaultNumericTypes>),
    /// Error when converting the parse tree into an expression
    #[error("Failed to convert expression: {0}")]
    Convert(#[from] ConvertError),
    /// Requested derivative level is not stored in the solution
    #[error("level {level} of `{variable}` is out of range for order {order}")]
    LevelOutOfRange {
        variable: String,
        level: usize,
        order: usize,
    },
    /// Evaluation time outside the integrated span
    #[error("time {t} is outside the solution span [{start}, {end}]")]
    TimeOutOfRange { t: f64, start: f64, end: f64 },
    /// A variable that is not part of the system
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    /// Error when a buffer does not have the expected length
    #[error("Invalid input length: expected {expected}, got {got}")]
    InvalidInputLength { expected: usize, got: usize },
    /// Missing or inconsistent problem configuration
    #[error("invalid problem: {0}")]
    InvalidProblem(String),
}
