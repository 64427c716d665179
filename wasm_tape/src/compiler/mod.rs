// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Module compiler: stack operators in, register bytecode out.
//!
//! Every function in the index space goes through the same pipeline:
//!
//! 1. lowering to register form; imported functions get a two-instruction stub instead
//! 2. the floating-point policy ([`FloatPolicy`])
//! 3. gas instrumentation, when a [`CostPolicy`] is configured
//! 4. register allocation
//! 5. encoding through [`crate::asm`]
//!
//! Functions are independent, so [`compile_module`] compiles them on a worker pool. The output
//! order (and every byte of it) is independent of the worker count.

use core::fmt;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::asm::{self, Label, UnresolvedLabel};
use crate::module::Module;
use crate::opcode::Opcode;

mod float_filter;
mod gas;
mod regalloc;
mod ssa;

pub use float_filter::FloatPolicy;
pub use gas::{CostPolicy, SimpleCostPolicy, TableCostPolicy};

/// What went wrong while compiling one function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// An operator needed more operands than the current block holds.
    StackUnderflow,
    /// The symbolic operand stack grew past its limit.
    StackOverflow,
    /// A block ended with the wrong number of values on the stack.
    StackImbalance {
        /// Height the block type requires.
        expected: usize,
        /// Height found.
        actual: usize,
    },
    /// `else`/`end` without a matching opener, or `else` twice.
    MalformedControl,
    /// An `if` that yields a value has no `else` arm.
    MissingElse,
    /// The body ran out before the function-level `end`.
    UnexpectedEnd,
    /// Operators follow the function-level `end`.
    TrailingOperators,
    /// A branch depth exceeds the control nesting.
    InvalidBranchDepth(u32),
    /// `br_table` targets disagree on whether they carry a value.
    BranchArityMismatch,
    /// A local index is out of range.
    InvalidLocal(u32),
    /// A global index is out of range.
    InvalidGlobal(u32),
    /// `set_global` on an immutable global.
    ImmutableGlobal(u32),
    /// A function index is out of range.
    InvalidFunction(u32),
    /// A type index is out of range.
    InvalidType(u32),
    /// A signature with more than one result.
    MultiValue,
    /// An opcode used in an operator of the wrong class.
    OperatorClass(Opcode),
    /// A floating-point operation under [`FloatPolicy::Reject`].
    FloatingPoint(Opcode),
    /// The register allocator found a register read before any write.
    AllocatorInconsistency,
    /// A jump target was never placed.
    UnresolvedLabel(Label),
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackUnderflow => write!(f, "operand stack underflow"),
            Self::StackOverflow => write!(f, "operand stack overflow"),
            Self::StackImbalance { expected, actual } => {
                write!(f, "stack height {actual} at block end, expected {expected}")
            }
            Self::MalformedControl => write!(f, "malformed control structure"),
            Self::MissingElse => write!(f, "if with a result has no else arm"),
            Self::UnexpectedEnd => write!(f, "function body ends before its final end"),
            Self::TrailingOperators => write!(f, "operators after the final end"),
            Self::InvalidBranchDepth(d) => write!(f, "branch depth {d} out of range"),
            Self::BranchArityMismatch => write!(f, "br_table targets disagree on arity"),
            Self::InvalidLocal(i) => write!(f, "local {i} out of range"),
            Self::InvalidGlobal(i) => write!(f, "global {i} out of range"),
            Self::ImmutableGlobal(i) => write!(f, "global {i} is immutable"),
            Self::InvalidFunction(i) => write!(f, "function {i} out of range"),
            Self::InvalidType(i) => write!(f, "type {i} out of range"),
            Self::MultiValue => write!(f, "multiple results are not supported"),
            Self::OperatorClass(op) => write!(f, "opcode {} used in the wrong operator", op.name()),
            Self::FloatingPoint(op) => write!(f, "floating-point operation {} rejected", op.name()),
            Self::AllocatorInconsistency => write!(f, "register read before definition"),
            Self::UnresolvedLabel(l) => write!(f, "label L{} never placed", l.id()),
        }
    }
}

/// Module compilation failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompileError {
    /// Function `func` could not be compiled.
    Function {
        /// Index in the function index space.
        func: u32,
        /// Index of the offending operator in the body, when known.
        at: Option<usize>,
        /// What went wrong.
        kind: CompileErrorKind,
    },
    /// The worker pool could not be started.
    WorkerPool(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function {
                func,
                at: Some(at),
                kind,
            } => write!(f, "function {func}, operator {at}: {kind}"),
            Self::Function {
                func,
                at: None,
                kind,
            } => write!(f, "function {func}: {kind}"),
            Self::WorkerPool(msg) => write!(f, "compile worker pool: {msg}"),
        }
    }
}

impl core::error::Error for CompileError {}

/// Compilation options.
#[derive(Clone, Default)]
pub struct CompileConfig {
    /// Treatment of floating-point operations.
    pub float_policy: FloatPolicy,
    /// Gas cost model; `None` disables metering.
    pub cost_policy: Option<Arc<dyn CostPolicy>>,
    /// Worker count; `None` uses one per available core.
    pub parallelism: Option<usize>,
}

impl CompileConfig {
    /// Sets the floating-point policy.
    #[must_use]
    pub fn with_float_policy(mut self, policy: FloatPolicy) -> Self {
        self.float_policy = policy;
        self
    }

    /// Enables gas metering with `policy`.
    #[must_use]
    pub fn with_cost_policy(mut self, policy: impl CostPolicy + 'static) -> Self {
        self.cost_policy = Some(Arc::new(policy));
        self
    }

    /// Fixes the number of compile workers.
    #[must_use]
    pub fn with_parallelism(mut self, workers: usize) -> Self {
        self.parallelism = Some(workers);
        self
    }
}

impl fmt::Debug for CompileConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileConfig")
            .field("float_policy", &self.float_policy)
            .field("metered", &self.cost_policy.is_some())
            .field("parallelism", &self.parallelism)
            .finish()
    }
}

/// Register bytecode for one function, plus its frame shape.
pub struct InterpreterCode {
    /// Registers the frame needs (at least 1).
    pub num_regs: u32,
    /// Parameters; they occupy the first locals.
    pub num_params: u32,
    /// Parameters plus declared locals.
    pub num_locals: u32,
    /// 0 or 1.
    pub num_returns: u32,
    /// Encoded instructions.
    pub bytes: Vec<u8>,
    #[cfg(feature = "jit")]
    pub(crate) native: crate::jit::NativeSlot,
}

impl InterpreterCode {
    /// Wraps already-encoded bytecode.
    #[must_use]
    pub fn new(
        num_regs: u32,
        num_params: u32,
        num_locals: u32,
        num_returns: u32,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            num_regs,
            num_params,
            num_locals,
            num_returns,
            bytes,
            #[cfg(feature = "jit")]
            native: crate::jit::NativeSlot::default(),
        }
    }
}

// Native code is a cache; copies start without it and equality ignores it.
impl Clone for InterpreterCode {
    fn clone(&self) -> Self {
        Self::new(
            self.num_regs,
            self.num_params,
            self.num_locals,
            self.num_returns,
            self.bytes.clone(),
        )
    }
}

impl PartialEq for InterpreterCode {
    fn eq(&self, other: &Self) -> bool {
        self.num_regs == other.num_regs
            && self.num_params == other.num_params
            && self.num_locals == other.num_locals
            && self.num_returns == other.num_returns
            && self.bytes == other.bytes
    }
}

impl Eq for InterpreterCode {}

impl fmt::Debug for InterpreterCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterpreterCode")
            .field("num_regs", &self.num_regs)
            .field("num_params", &self.num_params)
            .field("num_locals", &self.num_locals)
            .field("num_returns", &self.num_returns)
            .field("bytes", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

/// Compiled code for every function in a module's index space.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompiledModule {
    /// Indexed by function index; imported functions hold their stubs.
    pub functions: Vec<InterpreterCode>,
}

impl CompiledModule {
    /// Returns the code of function `func`.
    #[must_use]
    pub fn function(&self, func: u32) -> Option<&InterpreterCode> {
        self.functions.get(func as usize)
    }
}

/// Compiles function `func` of `module` (imported or defined).
pub fn compile_function(
    module: &Module,
    func: u32,
    config: &CompileConfig,
) -> Result<InterpreterCode, CompileError> {
    let err = |kind| CompileError::Function {
        func,
        at: None,
        kind,
    };
    let sig = module
        .function_type(func)
        .ok_or_else(|| err(CompileErrorKind::InvalidFunction(func)))?;
    let num_params = u32::try_from(sig.params.len()).unwrap_or(u32::MAX);
    let num_returns = u32::try_from(sig.results.len()).unwrap_or(u32::MAX);
    if num_returns > 1 {
        return Err(err(CompileErrorKind::MultiValue));
    }

    let imported = module.num_imported_functions();
    let (mut code, num_vregs, num_locals) = if func < imported {
        (ssa::import_stub(func, num_returns == 1), 1, num_params)
    } else {
        let body = &module.functions[(func - imported) as usize];
        let lowered = ssa::compile_function_body(module, func, body)?;
        let num_locals = num_params.saturating_add(body.num_declared_locals());
        (lowered.code, lowered.num_vregs, num_locals)
    };

    float_filter::filter_floating_point(&mut code, config.float_policy).map_err(err)?;
    if let Some(policy) = &config.cost_policy {
        code = gas::insert_gas_counters(code, policy.as_ref());
    }
    let num_regs = regalloc::allocate_registers(&mut code, num_vregs).map_err(err)?;
    let bytes = asm::assemble(&code)
        .map_err(|UnresolvedLabel(l)| err(CompileErrorKind::UnresolvedLabel(l)))?;

    trace!(
        func,
        num_vregs,
        num_regs,
        bytes = bytes.len(),
        "compiled function"
    );
    Ok(InterpreterCode::new(num_regs, num_params, num_locals, num_returns, bytes))
}

/// Compiles every function of `module` on a worker pool.
///
/// Results are collected in function-index order; the first failure (by index) is returned.
pub fn compile_module(
    module: &Module,
    config: &CompileConfig,
) -> Result<CompiledModule, CompileError> {
    let n = module.num_functions();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.parallelism.unwrap_or(0))
        .thread_name(|i| format!("wasm-tape-compile-{i}"))
        .build()
        .map_err(|e| CompileError::WorkerPool(e.to_string()))?;
    debug!(
        functions = n,
        workers = pool.current_num_threads(),
        "compiling module"
    );

    let results: Vec<Result<InterpreterCode, CompileError>> = pool.install(|| {
        (0..n)
            .into_par_iter()
            .map(|func| compile_function(module, func, config))
            .collect()
    });
    let functions = results.into_iter().collect::<Result<Vec<_>, _>>()?;
    debug!(
        functions = n,
        bytes = functions.iter().map(|c| c.bytes.len()).sum::<usize>(),
        "module compiled"
    );
    Ok(CompiledModule { functions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Op, decode_instructions};
    use crate::module::{ModuleBuilder, ValueType};
    use crate::operator::{BlockType, Operator};

    fn sample_module() -> Module {
        let mut b = ModuleBuilder::new();
        b.import_function("env", "tick", &[ValueType::I32], &[ValueType::I32]);
        for k in 0..8 {
            b.function(
                &[ValueType::I32],
                &[ValueType::I32],
                &[(1, ValueType::I32)],
                vec![
                    Operator::GetLocal(0),
                    Operator::I32Const(k),
                    Operator::Binary(Opcode::I32Add),
                    Operator::TeeLocal(1),
                    Operator::If(BlockType::Value(ValueType::I32)),
                    Operator::GetLocal(1),
                    Operator::Else,
                    Operator::I32Const(0),
                    Operator::Call(0),
                    Operator::End,
                    Operator::End,
                ],
            );
        }
        b.build()
    }

    #[test]
    fn output_is_independent_of_worker_count() {
        let m = sample_module();
        let one = compile_module(&m, &CompileConfig::default().with_parallelism(1)).unwrap();
        let many = compile_module(&m, &CompileConfig::default().with_parallelism(4)).unwrap();
        assert_eq!(one, many);
        assert_eq!(one.functions.len(), 9);
    }

    #[test]
    fn import_stub_invokes_host() {
        let m = sample_module();
        let code = compile_function(&m, 0, &CompileConfig::default()).unwrap();
        assert_eq!((code.num_regs, code.num_params, code.num_locals), (1, 1, 1));
        let ops: Vec<_> = decode_instructions(&code.bytes)
            .unwrap()
            .into_iter()
            .map(|d| d.instr.op)
            .collect();
        assert_eq!(ops[0], Op::InvokeImport(0));
        assert!(matches!(ops[1], Op::ReturnValue(_)));
    }

    #[test]
    fn metering_adds_charges() {
        let m = sample_module();
        let config = CompileConfig::default().with_cost_policy(SimpleCostPolicy::default());
        let code = compile_function(&m, 1, &config).unwrap();
        let charges = decode_instructions(&code.bytes)
            .unwrap()
            .into_iter()
            .filter(|d| matches!(d.instr.op, Op::AddGas(_)))
            .count();
        assert!(charges >= 3, "entry, both arms and the join are charged");
    }

    #[test]
    fn first_failing_function_is_reported() {
        let mut b = ModuleBuilder::new();
        b.function(&[], &[], &[], vec![Operator::End]);
        b.function(&[], &[], &[], vec![Operator::Drop, Operator::End]);
        b.function(&[], &[], &[], vec![Operator::Else, Operator::End]);
        let err = compile_module(&b.build(), &CompileConfig::default()).unwrap_err();
        assert_eq!(
            err,
            CompileError::Function {
                func: 1,
                at: Some(0),
                kind: CompileErrorKind::StackUnderflow
            }
        );
        assert_eq!(
            err.to_string(),
            "function 1, operator 0: operand stack underflow"
        );
    }

    #[test]
    fn rejected_floats_fail_compilation() {
        let mut b = ModuleBuilder::new();
        b.function(
            &[],
            &[ValueType::F64],
            &[],
            vec![Operator::F64Const(0), Operator::End],
        );
        let config = CompileConfig::default().with_float_policy(FloatPolicy::Reject);
        let err = compile_module(&b.build(), &config).unwrap_err();
        assert!(matches!(
            err,
            CompileError::Function {
                kind: CompileErrorKind::FloatingPoint(Opcode::F64Const),
                ..
            }
        ));
    }
}
