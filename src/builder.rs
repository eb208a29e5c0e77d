//! JIT compilation of first-order systems with Cranelift.
//!
//! Every compiled function has the native signature
//!
//! ```text
//! extern "C" fn(t: f64, x: *const f64, out: *mut f64)
//! ```
//!
//! and writes one value per expression into `out`. The vector field and its Jacobian are
//! compiled into the same module, so the imported math wrappers are declared only once.
//!
//! The main entry point is [`build_functions`], which returns safe, thread-safe closures
//! around the generated code.

use std::collections::HashMap;
use std::sync::Arc;

use cranelift::prelude::*;
use cranelift_codegen::ir::immediates::Offset32;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use isa::TargetIsa;
use log::debug;

use crate::errors::BuilderError;
use crate::expr::Expr;
use crate::operators::{self, CallSites, Imports, Libcall};
use crate::types::{JacobianFunction, RhsFunction};

struct ThreadSafeFunction(*const u8);
unsafe impl Send for ThreadSafeFunction {}
unsafe impl Sync for ThreadSafeFunction {}

/// Native vector field and, when available, its Jacobian.
pub struct NativeFunctions {
    pub rhs: RhsFunction,
    pub jacobian: Option<JacobianFunction>,
}

/// Compiles `rhs` (length `N`) and the row-major Jacobian entries (`N × N`).
///
/// Expressions must only contain constants, `Time` and `Slot` leaves below `N`.
///
/// # Errors
/// Returns a [`BuilderError`] if the host is not supported, an expression still holds a
/// symbolic leaf or Cranelift rejects the generated code.
pub fn build_functions(
    rhs: &[Expr],
    jacobian: Option<&[Vec<Expr>]>,
) -> Result<NativeFunctions, BuilderError> {
    let dimension = rhs.len();
    let isa = create_isa()?;
    let mut module = create_module(isa);
    let mut imports = Imports::default();

    let rhs_id = define_function(&mut module, &mut imports, "odejit_rhs", rhs)?;
    let jacobian_id = match jacobian {
        Some(rows) => {
            let entries: Vec<Expr> = rows.iter().flatten().cloned().collect();
            Some(define_function(
                &mut module,
                &mut imports,
                "odejit_jacobian",
                &entries,
            )?)
        }
        None => None,
    };

    module
        .finalize_definitions()
        .map_err(BuilderError::ModuleError)?;
    debug!(
        "compiled vector field of dimension {dimension}{}",
        if jacobian_id.is_some() { " with Jacobian" } else { "" }
    );

    let rhs = wrap(
        ThreadSafeFunction(module.get_finalized_function(rhs_id)),
        dimension,
        dimension,
    );
    let jacobian = jacobian_id.map(|id| {
        wrap(
            ThreadSafeFunction(module.get_finalized_function(id)),
            dimension,
            dimension * dimension,
        )
    });
    Ok(NativeFunctions { rhs, jacobian })
}

/// Creates an Instruction Set Architecture (ISA) target for code generation.
///
/// Detects the host machine and configures position independent code on x86_64.
///
/// # Errors
/// Returns a BuilderError if:
/// - The host machine architecture is not supported
/// - A code generation flag is rejected
pub(crate) fn create_isa() -> Result<Arc<dyn TargetIsa>, BuilderError> {
    let mut flag_builder = settings::builder();
    let mut set = |name: &str, value: &str| {
        flag_builder
            .set(name, value)
            .map_err(|e| BuilderError::SettingsError(format!("{name}={value}: {e}")))
    };

    let is_x86 = matches!(
        target_lexicon::Triple::host().architecture,
        target_lexicon::Architecture::X86_64
    );
    set("use_colocated_libcalls", if is_x86 { "true" } else { "false" })?;
    set("is_pic", if is_x86 { "true" } else { "false" })?;
    set("opt_level", "speed")?;
    set(
        "enable_verifier",
        if cfg!(debug_assertions) { "true" } else { "false" },
    )?;

    let isa_builder = cranelift_native::builder()
        .map_err(|msg| BuilderError::HostMachineNotSupported(msg.to_string()))?;

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(BuilderError::CodegenError)
}

fn create_module(isa: Arc<dyn TargetIsa>) -> JITModule {
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    operators::register_symbols(&mut builder);
    JITModule::new(builder)
}

/// Declares and defines `name` as `fn(t, x, out)` storing `exprs[i]` at `out[i]`.
fn define_function(
    module: &mut JITModule,
    imports: &mut Imports,
    name: &str,
    exprs: &[Expr],
) -> Result<FuncId, BuilderError> {
    let pointer = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(types::F64)); // t
    sig.params.push(AbiParam::new(pointer)); // x
    sig.params.push(AbiParam::new(pointer)); // out

    let func_id = module
        .declare_function(name, Linkage::Export, &sig)
        .map_err(|msg| BuilderError::DeclarationError(msg.to_string()))?;

    let mut ctx = module.make_context();
    ctx.func.signature = sig;
    let mut builder_ctx = FunctionBuilderContext::new();
    {
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
        let entry_block = builder.create_block();
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        builder.seal_block(entry_block);
        let params = builder.block_params(entry_block).to_vec();

        let mut emitter = Emitter {
            builder,
            module: &mut *module,
            imports,
            calls: CallSites::default(),
            loads: HashMap::new(),
            time: params[0],
            state: params[1],
        };
        let values = exprs
            .iter()
            .map(|expr| emitter.emit(expr))
            .collect::<Result<Vec<_>, _>>()?;

        for (i, value) in values.into_iter().enumerate() {
            emitter.builder.ins().store(
                MemFlags::trusted(),
                value,
                params[2],
                Offset32::new((i * 8) as i32),
            );
        }
        emitter.builder.ins().return_(&[]);
        emitter.builder.finalize();
    }

    module
        .define_function(func_id, &mut ctx)
        .map_err(|msg| BuilderError::FunctionError(msg.to_string()))?;
    module.clear_context(&mut ctx);
    Ok(func_id)
}

/// Wraps a finalized `fn(t, x, out)` into a safe closure.
///
/// # Panics
/// The returned closure panics if `x` holds fewer than `inputs` or `out` fewer than
/// `outputs` values.
fn wrap(
    code: ThreadSafeFunction,
    inputs: usize,
    outputs: usize,
) -> Arc<dyn Fn(f64, &[f64], &mut [f64]) + Send + Sync> {
    let code = Arc::new(code);
    Arc::new(move |t: f64, x: &[f64], out: &mut [f64]| {
        assert!(
            x.len() >= inputs && out.len() >= outputs,
            "compiled function needs {inputs} inputs and {outputs} outputs, got {} and {}",
            x.len(),
            out.len()
        );
        // SAFETY: the function was compiled with signature fn(f64, *const f64, *mut f64),
        // reads at most `inputs` and writes at most `outputs` values, and the JIT memory is
        // never freed.
        unsafe {
            let f: extern "C" fn(f64, *const f64, *mut f64) = std::mem::transmute(code.0);
            f(t, x.as_ptr(), out.as_mut_ptr());
        }
    })
}

/// Recursive code generator for one function body.
struct Emitter<'a, 'f> {
    builder: FunctionBuilder<'f>,
    module: &'a mut JITModule,
    imports: &'a mut Imports,
    calls: CallSites,
    /// State loads already emitted, by slot
    loads: HashMap<u32, Value>,
    time: Value,
    state: Value,
}

impl Emitter<'_, '_> {
    fn emit(&mut self, expr: &Expr) -> Result<Value, BuilderError> {
        let value = match expr {
            Expr::Const(val) => self.builder.ins().f64const(*val),
            Expr::Time => self.time,
            Expr::Slot(index) => self.load(*index),
            Expr::Symbol(name) => {
                return Err(BuilderError::FunctionError(format!(
                    "unbound symbol `{name}`"
                )))
            }
            Expr::Term(term) => {
                return Err(BuilderError::FunctionError(format!(
                    "term {term} was not reduced to a state slot"
                )))
            }
            Expr::Add(left, right) => {
                let (l, r) = (self.emit(left)?, self.emit(right)?);
                self.builder.ins().fadd(l, r)
            }
            Expr::Sub(left, right) => {
                let (l, r) = (self.emit(left)?, self.emit(right)?);
                self.builder.ins().fsub(l, r)
            }
            Expr::Mul(left, right) => {
                let (l, r) = (self.emit(left)?, self.emit(right)?);
                self.builder.ins().fmul(l, r)
            }
            Expr::Div(left, right) => {
                let (l, r) = (self.emit(left)?, self.emit(right)?);
                self.builder.ins().fdiv(l, r)
            }
            Expr::Abs(inner) => {
                let v = self.emit(inner)?;
                self.builder.ins().fabs(v)
            }
            Expr::Neg(inner) => {
                let v = self.emit(inner)?;
                self.builder.ins().fneg(v)
            }
            Expr::Sqrt(inner) => {
                let v = self.emit(inner)?;
                self.builder.ins().sqrt(v)
            }
            Expr::Root(inner, n) => {
                let v = self.emit(inner)?;
                let n = self.builder.ins().f64const(*n as f64);
                self.call(Libcall::Root, &[v, n])?
            }
            Expr::Pow(base, exp) => {
                let v = self.emit(base)?;
                generate_optimized_power(&mut self.builder, v, *exp)
            }
            Expr::PowFloat(base, exp) => {
                let v = self.emit(base)?;
                let e = self.builder.ins().f64const(*exp);
                self.call(Libcall::Pow, &[v, e])?
            }
            Expr::PowExpr(base, exponent) => {
                let (b, e) = (self.emit(base)?, self.emit(exponent)?);
                self.call(Libcall::Pow, &[b, e])?
            }
            Expr::Exp(inner) => {
                let v = self.emit(inner)?;
                self.call(Libcall::Exp, &[v])?
            }
            Expr::Ln(inner) => {
                let v = self.emit(inner)?;
                self.call(Libcall::Ln, &[v])?
            }
            Expr::Sin(inner) => {
                let v = self.emit(inner)?;
                self.call(Libcall::Sin, &[v])?
            }
            Expr::Cos(inner) => {
                let v = self.emit(inner)?;
                self.call(Libcall::Cos, &[v])?
            }
        };
        Ok(value)
    }

    fn load(&mut self, index: u32) -> Value {
        if let Some(value) = self.loads.get(&index) {
            return *value;
        }
        let value = self.builder.ins().load(
            types::F64,
            MemFlags::trusted().with_readonly(),
            self.state,
            Offset32::new((index * 8) as i32),
        );
        self.loads.insert(index, value);
        value
    }

    fn call(&mut self, call: Libcall, args: &[Value]) -> Result<Value, BuilderError> {
        self.calls.call(
            &mut self.builder,
            &mut *self.module,
            &mut *self.imports,
            call,
            args,
        )
    }
}

/// Integer powers by repeated squaring; negative exponents take the reciprocal.
fn generate_optimized_power(builder: &mut FunctionBuilder, base: Value, exp: i64) -> Value {
    match exp {
        0 => builder.ins().f64const(1.0),
        1 => base,
        2 => builder.ins().fmul(base, base),
        -1 => {
            let one = builder.ins().f64const(1.0);
            builder.ins().fdiv(one, base)
        }
        _ => {
            let mut result: Option<Value> = None;
            let mut current = base;
            let mut remaining = exp.unsigned_abs();

            while remaining > 0 {
                if remaining & 1 == 1 {
                    result = Some(match result {
                        Some(acc) => builder.ins().fmul(acc, current),
                        None => current,
                    });
                }
                if remaining > 1 {
                    current = builder.ins().fmul(current, current);
                }
                remaining >>= 1;
            }
            let result = result.unwrap_or(base);

            if exp < 0 {
                let one = builder.ins().f64const(1.0);
                builder.ins().fdiv(one, result)
            } else {
                result
            }
        }
    }
}
