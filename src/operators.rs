//! Math functions linked into JIT-compiled code.
//!
//! Cranelift has native instructions for `sqrt`, `fabs` and `fneg`; everything else is a call
//! into one of the `extern "C"` wrappers below. The wrappers are registered with the
//! [`JITBuilder`] under their own symbol names, so compiled code never depends on which libm
//! the host process happens to export.

use std::collections::HashMap;

use cranelift::prelude::FunctionBuilder;
use cranelift_codegen::ir::types::F64;
use cranelift_codegen::ir::{AbiParam, FuncRef, InstBuilder, Value};
use cranelift_jit::JITBuilder;
use cranelift_module::{FuncId, Linkage, Module};

use crate::errors::BuilderError;
use crate::expr::real_root;

/// A function called from compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Libcall {
    Exp,
    Ln,
    Sin,
    Cos,
    Pow,
    Root,
}

impl Libcall {
    const ALL: [Libcall; 6] = [
        Libcall::Exp,
        Libcall::Ln,
        Libcall::Sin,
        Libcall::Cos,
        Libcall::Pow,
        Libcall::Root,
    ];

    fn symbol(self) -> &'static str {
        match self {
            Libcall::Exp => "odejit_exp",
            Libcall::Ln => "odejit_ln",
            Libcall::Sin => "odejit_sin",
            Libcall::Cos => "odejit_cos",
            Libcall::Pow => "odejit_pow",
            Libcall::Root => "odejit_root",
        }
    }

    fn arity(self) -> usize {
        match self {
            Libcall::Pow | Libcall::Root => 2,
            _ => 1,
        }
    }

    fn address(self) -> *const u8 {
        match self {
            Libcall::Exp => odejit_exp as *const u8,
            Libcall::Ln => odejit_ln as *const u8,
            Libcall::Sin => odejit_sin as *const u8,
            Libcall::Cos => odejit_cos as *const u8,
            Libcall::Pow => odejit_pow as *const u8,
            Libcall::Root => odejit_root as *const u8,
        }
    }
}

extern "C" fn odejit_exp(x: f64) -> f64 {
    x.exp()
}

extern "C" fn odejit_ln(x: f64) -> f64 {
    x.ln()
}

extern "C" fn odejit_sin(x: f64) -> f64 {
    x.sin()
}

extern "C" fn odejit_cos(x: f64) -> f64 {
    x.cos()
}

extern "C" fn odejit_pow(base: f64, exponent: f64) -> f64 {
    base.powf(exponent)
}

extern "C" fn odejit_root(x: f64, n: f64) -> f64 {
    real_root(x, n as i64)
}

/// Makes every wrapper resolvable by the module built from `builder`.
pub(crate) fn register_symbols(builder: &mut JITBuilder) {
    for call in Libcall::ALL {
        builder.symbol(call.symbol(), call.address());
    }
}

/// Module-level imports, declared once and shared by every function of the module.
#[derive(Default)]
pub(crate) struct Imports {
    ids: HashMap<Libcall, FuncId>,
}

impl Imports {
    /// Declares `call` in `module` on first use.
    fn link(&mut self, module: &mut dyn Module, call: Libcall) -> Result<FuncId, BuilderError> {
        if let Some(id) = self.ids.get(&call) {
            return Ok(*id);
        }

        // Signature (f64, ...) -> f64
        let mut sig = module.make_signature();
        for _ in 0..call.arity() {
            sig.params.push(AbiParam::new(F64));
        }
        sig.returns.push(AbiParam::new(F64));

        let id = module
            .declare_function(call.symbol(), Linkage::Import, &sig)
            .map_err(|e| BuilderError::DeclarationError(e.to_string()))?;
        self.ids.insert(call, id);
        Ok(id)
    }
}

/// Per-function references to imported wrappers.
#[derive(Default)]
pub(crate) struct CallSites {
    refs: HashMap<Libcall, FuncRef>,
}

impl CallSites {
    /// Emits a call to `call` with `args` and returns its result.
    pub(crate) fn call(
        &mut self,
        builder: &mut FunctionBuilder,
        module: &mut dyn Module,
        imports: &mut Imports,
        call: Libcall,
        args: &[Value],
    ) -> Result<Value, BuilderError> {
        let func = match self.refs.get(&call) {
            Some(func) => *func,
            None => {
                let id = imports.link(module, call)?;
                let func = module.declare_func_in_func(id, builder.func);
                self.refs.insert(call, func);
                func
            }
        };
        let inst = builder.ins().call(func, args);
        Ok(builder.inst_results(inst)[0])
    }
}
