// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Interpreter for register bytecode.
//!
//! A [`VirtualMachine`] owns one instance of a module: linear memory, globals, the function table
//! and the resolved host imports. Compiled code is immutable and shared, so cloning a VM copies
//! only the mutable state.
//!
//! Execution is single-threaded. Functions with an attached native routine run natively and
//! hand calls, host imports, gas charges and memory growth back to the interpreter loop, which
//! stays in control of the call stack.

use core::fmt;
use std::sync::Arc;

use tracing::debug;
#[cfg(feature = "jit")]
use tracing::warn;

use crate::bytecode::{DecodedInstr, Op, Reg, decode_instructions};
use crate::compiler::{CompileConfig, CompileError, CompiledModule, compile_module};
use crate::format::DecodeError;
use crate::host::{HostError, HostFunction, ImportContext, ImportResolver};
use crate::jit::CodegenError;
#[cfg(feature = "jit")]
use crate::jit::{NativeExit, NativeFrame, NativeRoutine};
use crate::module::{ConstExpr, ImportKind, MAX_PAGES, Module, PAGE_SIZE, ValueType};
use crate::numerics;
use crate::opcode::{OpClass, Opcode};
use crate::trace::{NoTrace, ScopeKind, TraceMask, TraceOutcome, TraceSink};

/// A runtime trap.
///
/// Traps are the program misbehaving; they abort the call chain back to [`VirtualMachine::run`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Trap {
    /// `unreachable` executed.
    Unreachable,
    /// Execution fell off the end of a function or hit an impossible state.
    InvalidExecution,
    /// A load or store past the end of linear memory.
    MemoryOutOfBounds,
    /// Division by zero, signed division overflow or an unrepresentable float to int conversion.
    Arithmetic,
    /// The gas budget cannot cover the next block.
    GasExhausted,
    /// Call nesting exceeded [`VmConfig::max_call_depth`].
    CallStackExhausted,
    /// Indirect call through an empty or out-of-range table slot.
    UndefinedElement,
    /// Indirect call whose callee signature differs from the expected one.
    IndirectCallTypeMismatch,
    /// Floating point was compiled out with [`FloatPolicy::Trap`](crate::compiler::FloatPolicy).
    FpDisabled,
    /// A host import returned an error.
    HostFailure,
}

impl Trap {
    /// Returns the trap's code in the shared interpreter/native code space.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Unreachable => -2,
            Self::InvalidExecution => -3,
            Self::MemoryOutOfBounds => -4,
            Self::Arithmetic => -5,
            Self::GasExhausted => -6,
            Self::CallStackExhausted => -7,
            Self::UndefinedElement => -8,
            Self::IndirectCallTypeMismatch => -9,
            Self::FpDisabled => -10,
            Self::HostFailure => -11,
        }
    }

    /// Inverse of [`Trap::code`].
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -2 => Self::Unreachable,
            -3 => Self::InvalidExecution,
            -4 => Self::MemoryOutOfBounds,
            -5 => Self::Arithmetic,
            -6 => Self::GasExhausted,
            -7 => Self::CallStackExhausted,
            -8 => Self::UndefinedElement,
            -9 => Self::IndirectCallTypeMismatch,
            -10 => Self::FpDisabled,
            -11 => Self::HostFailure,
            _ => return None,
        })
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unreachable => "unreachable executed",
            Self::InvalidExecution => "invalid execution",
            Self::MemoryOutOfBounds => "memory access out of bounds",
            Self::Arithmetic => "arithmetic fault",
            Self::GasExhausted => "gas exhausted",
            Self::CallStackExhausted => "call stack exhausted",
            Self::UndefinedElement => "undefined table element",
            Self::IndirectCallTypeMismatch => "indirect call signature mismatch",
            Self::FpDisabled => "floating point disabled",
            Self::HostFailure => "host import failed",
        })
    }
}

impl core::error::Error for Trap {}

/// A trap annotated with its location.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TrapInfo {
    /// Function index.
    pub func: u32,
    /// Byte offset of the trapping instruction.
    pub pc: u32,
    /// Trap kind.
    pub trap: Trap,
}

impl fmt::Display for TrapInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trap at f{} pc={}: {}", self.func, self.pc, self.trap)
    }
}

impl core::error::Error for TrapInfo {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        Some(&self.trap)
    }
}

/// An integrity defect in compiled code or at the invocation boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// Register index past the frame's register file.
    BadRegister(u32),
    /// Local index past the frame's locals.
    BadLocal(u32),
    /// Global index past the module's globals.
    BadGlobal(u32),
    /// Jump target that is not an instruction boundary.
    BadJumpTarget(u32),
    /// Function index outside the module.
    BadFunction(u32),
    /// Host import index outside the resolved imports.
    BadImport(u32),
    /// Wrong number of arguments for the callee.
    ArgumentCount {
        /// Parameters the callee declares.
        expected: u32,
        /// Arguments supplied.
        actual: usize,
    },
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRegister(r) => write!(f, "register r{r} out of range"),
            Self::BadLocal(l) => write!(f, "local {l} out of range"),
            Self::BadGlobal(g) => write!(f, "global {g} out of range"),
            Self::BadJumpTarget(t) => write!(f, "jump target {t} is not an instruction"),
            Self::BadFunction(func) => write!(f, "function {func} does not exist"),
            Self::BadImport(i) => write!(f, "host import {i} was not resolved"),
            Self::ArgumentCount { expected, actual } => {
                write!(f, "expected {expected} arguments, got {actual}")
            }
        }
    }
}

/// A fault annotated with its location.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FaultInfo {
    /// Function index.
    pub func: u32,
    /// Byte offset of the faulting instruction.
    pub pc: u32,
    /// What went wrong.
    pub kind: FaultKind,
}

impl fmt::Display for FaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fault at f{} pc={}: {}", self.func, self.pc, self.kind)
    }
}

/// Errors from [`VirtualMachine::run`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunError {
    /// The program trapped.
    Trap(TrapInfo),
    /// A host import failed; reported as [`Trap::HostFailure`].
    Host {
        /// Function index of the import stub.
        func: u32,
        /// Byte offset of the invoking instruction.
        pc: u32,
        /// The host's error.
        error: HostError,
    },
    /// Compiled code violated its own invariants, or the caller passed bad arguments.
    Fault(FaultInfo),
}

impl RunError {
    /// Returns the trap kind, or `None` for faults.
    #[must_use]
    pub fn trap(&self) -> Option<Trap> {
        match self {
            Self::Trap(info) => Some(info.trap),
            Self::Host { .. } => Some(Trap::HostFailure),
            Self::Fault(_) => None,
        }
    }

    /// Returns `(func, pc)` of the failing instruction.
    #[must_use]
    pub fn location(&self) -> (u32, u32) {
        match self {
            Self::Trap(TrapInfo { func, pc, .. })
            | Self::Host { func, pc, .. }
            | Self::Fault(FaultInfo { func, pc, .. }) => (*func, *pc),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trap(info) => info.fmt(f),
            Self::Host { func, pc, error } => {
                write!(f, "host import at f{func} pc={pc} failed: {error}")
            }
            Self::Fault(info) => info.fmt(f),
        }
    }
}

impl core::error::Error for RunError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Trap(info) => Some(info),
            Self::Host { error, .. } => Some(error),
            Self::Fault(_) => None,
        }
    }
}

/// Errors from creating a [`VirtualMachine`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstantiateError {
    /// The module failed to compile.
    Compile(CompileError),
    /// The compiled code does not belong to the module.
    CodeMismatch {
        /// Functions in the module's index space.
        expected: u32,
        /// Functions in the compiled module.
        actual: usize,
    },
    /// The resolver does not provide an import.
    UnresolvedImport {
        /// Host module name.
        module: String,
        /// Field name.
        field: String,
    },
    /// The module needs more memory than allowed.
    MemoryLimit {
        /// Pages requested.
        requested: u32,
        /// Pages allowed.
        maximum: u32,
    },
    /// The table's initial size exceeds its declared maximum.
    TableLimit {
        /// Entries requested.
        requested: u32,
        /// Entries allowed.
        maximum: u32,
    },
    /// A global initializer refers to a missing or later global.
    InvalidGlobalInit(u32),
    /// Element segment `n` does not fit the table or names a missing function.
    ElementOutOfBounds(usize),
    /// Data segment `n` does not fit linear memory.
    DataOutOfBounds(usize),
    /// The start function is missing or takes parameters or returns a value.
    InvalidStart(u32),
    /// A function's bytecode does not decode.
    Decode {
        /// Function index.
        func: u32,
        /// Decode failure.
        error: DecodeError,
    },
}

impl fmt::Display for InstantiateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile(e) => write!(f, "compilation failed: {e}"),
            Self::CodeMismatch { expected, actual } => {
                write!(
                    f,
                    "compiled code has {actual} functions, module has {expected}"
                )
            }
            Self::UnresolvedImport { module, field } => {
                write!(f, "unresolved import {module}.{field}")
            }
            Self::MemoryLimit { requested, maximum } => {
                write!(
                    f,
                    "memory of {requested} pages exceeds the limit of {maximum}"
                )
            }
            Self::TableLimit { requested, maximum } => {
                write!(
                    f,
                    "table of {requested} entries exceeds the limit of {maximum}"
                )
            }
            Self::InvalidGlobalInit(g) => write!(f, "global {g} has an invalid initializer"),
            Self::ElementOutOfBounds(i) => write!(f, "element segment {i} out of bounds"),
            Self::DataOutOfBounds(i) => write!(f, "data segment {i} out of bounds"),
            Self::InvalidStart(func) => write!(f, "function {func} cannot be a start function"),
            Self::Decode { func, error } => write!(f, "function {func}: {error}"),
        }
    }
}

impl core::error::Error for InstantiateError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Compile(e) => Some(e),
            Self::Decode { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<CompileError> for InstantiateError {
    fn from(e: CompileError) -> Self {
        Self::Compile(e)
    }
}

/// Instance configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct VmConfig {
    /// Minimum memory size in pages; the module's own minimum wins if larger.
    pub default_memory_pages: u32,
    /// Memory growth limit in pages; 0 means the 32-bit address space limit.
    pub max_memory_pages: u32,
    /// Minimum table size; the module's own minimum wins if larger.
    pub default_table_size: u32,
    /// Maximum number of simultaneously active frames.
    pub max_call_depth: usize,
    /// Gas budget; `None` disables metering checks (counters still accumulate).
    pub gas_limit: Option<u64>,
    /// Compile functions natively in the background on their first call.
    pub enable_jit: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            default_memory_pages: 0,
            max_memory_pages: 0,
            default_table_size: 65_536,
            max_call_depth: 1024,
            gas_limit: None,
            enable_jit: false,
        }
    }
}

/// Code shared between a VM and its clones.
struct Program {
    module: Arc<Module>,
    code: Arc<CompiledModule>,
    decoded: Vec<Vec<DecodedInstr>>,
}

impl Program {
    fn instrs(&self, func: u32) -> &[DecodedInstr] {
        self.decoded
            .get(func as usize)
            .map_or(&[], Vec::as_slice)
    }

    fn index_of(&self, func: u32, pc: u32) -> Option<usize> {
        self.instrs(func)
            .binary_search_by_key(&pc, |d| d.offset)
            .ok()
    }
}

#[cfg(feature = "jit")]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Mode {
    Interpret,
    /// Run the native routine from this continuation.
    Native(u32),
    /// Interpret the hand-off instruction at `ix`, then continue natively.
    Resume(u32),
}

#[derive(Debug)]
struct Frame {
    func: u32,
    ix: usize,
    regs: Vec<i64>,
    locals: Vec<i64>,
    ret_target: Option<Reg>,
    #[cfg(feature = "jit")]
    mode: Mode,
}

impl Frame {
    fn fault(&self, pc: u32, kind: FaultKind) -> RunError {
        RunError::Fault(FaultInfo {
            func: self.func,
            pc,
            kind,
        })
    }

    fn reg(&self, r: Reg, pc: u32) -> Result<i64, RunError> {
        self.regs
            .get(r.index())
            .copied()
            .ok_or_else(|| self.fault(pc, FaultKind::BadRegister(r.0)))
    }

    fn set(&mut self, target: Option<Reg>, value: i64, pc: u32) -> Result<(), RunError> {
        let Some(r) = target else {
            return Ok(());
        };
        let func = self.func;
        let slot = self
            .regs
            .get_mut(r.index())
            .ok_or(RunError::Fault(FaultInfo {
                func,
                pc,
                kind: FaultKind::BadRegister(r.0),
            }))?;
        *slot = value;
        Ok(())
    }
}

enum Flow {
    Next,
    Call(Frame),
    Return(Option<i64>),
}

fn trap(func: u32, pc: u32, trap: Trap) -> RunError {
    RunError::Trap(TrapInfo { func, pc, trap })
}

fn mask_to(ty: Option<ValueType>, v: i64) -> i64 {
    match ty {
        Some(ValueType::I32 | ValueType::F32) => v & 0xFFFF_FFFF,
        _ => v,
    }
}

/// One instance of a compiled module.
pub struct VirtualMachine {
    program: Arc<Program>,
    config: VmConfig,
    resolver: Box<dyn ImportResolver>,
    host_functions: Vec<HostFunction>,
    memory: Vec<u8>,
    max_pages: u32,
    globals: Vec<i64>,
    table: Vec<Option<u32>>,
    gas_used: u64,
    started: bool,
    backtrace: Vec<(u32, u32)>,
}

impl fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("config", &self.config)
            .field("functions", &self.program.code.functions.len())
            .field("memory_pages", &(self.memory.len() / PAGE_SIZE))
            .field("globals", &self.globals.len())
            .field("gas_used", &self.gas_used)
            .finish_non_exhaustive()
    }
}

impl Clone for VirtualMachine {
    fn clone(&self) -> Self {
        let resolver = self.resolver.clone_resolver();
        let host_functions = self
            .program
            .module
            .imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Function { .. }))
            .zip(&self.host_functions)
            .map(|(import, existing)| {
                resolver
                    .resolve_function(&import.module, &import.field)
                    .unwrap_or_else(|| Arc::clone(existing))
            })
            .collect();
        Self {
            program: Arc::clone(&self.program),
            config: self.config.clone(),
            resolver,
            host_functions,
            memory: self.memory.clone(),
            max_pages: self.max_pages,
            globals: self.globals.clone(),
            table: self.table.clone(),
            gas_used: self.gas_used,
            started: self.started,
            backtrace: Vec::new(),
        }
    }
}

impl VirtualMachine {
    /// Compiles `module` and instantiates it.
    pub fn new(
        module: Arc<Module>,
        config: VmConfig,
        compile: &CompileConfig,
        resolver: Box<dyn ImportResolver>,
    ) -> Result<Self, InstantiateError> {
        let code = Arc::new(compile_module(&module, compile)?);
        Self::instantiate(module, code, config, resolver)
    }

    /// Instantiates already compiled code.
    ///
    /// `code` must come from compiling `module`; it may be shared by any number of instances.
    pub fn instantiate(
        module: Arc<Module>,
        code: Arc<CompiledModule>,
        config: VmConfig,
        resolver: Box<dyn ImportResolver>,
    ) -> Result<Self, InstantiateError> {
        let num_functions = module.num_functions();
        if code.functions.len() != num_functions as usize {
            return Err(InstantiateError::CodeMismatch {
                expected: num_functions,
                actual: code.functions.len(),
            });
        }

        let mut host_functions = Vec::new();
        let mut globals = Vec::new();
        for import in &module.imports {
            let unresolved = || InstantiateError::UnresolvedImport {
                module: import.module.clone(),
                field: import.field.clone(),
            };
            match import.kind {
                ImportKind::Function { .. } => host_functions.push(
                    resolver
                        .resolve_function(&import.module, &import.field)
                        .ok_or_else(unresolved)?,
                ),
                ImportKind::Global { ty, .. } => {
                    let v = resolver
                        .resolve_global(&import.module, &import.field)
                        .ok_or_else(unresolved)?;
                    globals.push(mask_to(Some(ty), v));
                }
            }
        }
        for global in &module.globals {
            let index = u32::try_from(globals.len()).unwrap_or(u32::MAX);
            let v = eval_const(global.init, &globals)
                .ok_or(InstantiateError::InvalidGlobalInit(index))?;
            globals.push(mask_to(Some(global.ty), v));
        }

        let limits = module.memory.unwrap_or_default();
        let mut max_pages = match config.max_memory_pages {
            0 => MAX_PAGES,
            n => n.min(MAX_PAGES),
        };
        if let Some(declared) = limits.maximum {
            max_pages = max_pages.min(declared);
        }
        if limits.initial > max_pages {
            return Err(InstantiateError::MemoryLimit {
                requested: limits.initial,
                maximum: max_pages,
            });
        }
        let pages = limits
            .initial
            .max(config.default_memory_pages)
            .min(max_pages);
        let mut memory = vec![0_u8; pages as usize * PAGE_SIZE];

        let table_limits = module.table.unwrap_or_default();
        if let Some(maximum) = table_limits.maximum
            && table_limits.initial > maximum
        {
            return Err(InstantiateError::TableLimit {
                requested: table_limits.initial,
                maximum,
            });
        }
        let table_size = table_limits.initial.max(config.default_table_size);
        let mut table = vec![None; table_size as usize];
        for (i, seg) in module.elements.iter().enumerate() {
            let oob = InstantiateError::ElementOutOfBounds(i);
            let start =
                eval_const(seg.offset, &globals).ok_or_else(|| oob.clone())? as u32 as usize;
            let slots = table
                .get_mut(start..start.saturating_add(seg.functions.len()))
                .ok_or_else(|| oob.clone())?;
            for (slot, &func) in slots.iter_mut().zip(&seg.functions) {
                if func >= num_functions {
                    return Err(oob);
                }
                *slot = Some(func);
            }
        }
        for (i, seg) in module.data.iter().enumerate() {
            let oob = InstantiateError::DataOutOfBounds(i);
            let start =
                eval_const(seg.offset, &globals).ok_or_else(|| oob.clone())? as u32 as usize;
            memory
                .get_mut(start..start.saturating_add(seg.bytes.len()))
                .ok_or(oob)?
                .copy_from_slice(&seg.bytes);
        }

        if let Some(start) = module.start {
            let nullary = module
                .function_type(start)
                .is_some_and(|t| t.params.is_empty() && t.results.is_empty());
            if !nullary {
                return Err(InstantiateError::InvalidStart(start));
            }
        }

        let decoded = code
            .functions
            .iter()
            .enumerate()
            .map(|(func, c)| {
                decode_instructions(&c.bytes).map_err(|error| InstantiateError::Decode {
                    func: u32::try_from(func).unwrap_or(u32::MAX),
                    error,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            functions = num_functions,
            imports = host_functions.len(),
            memory_pages = pages,
            globals = globals.len(),
            table_size,
            "instantiated vm"
        );

        Ok(Self {
            program: Arc::new(Program {
                module,
                code,
                decoded,
            }),
            config,
            resolver,
            host_functions,
            memory,
            max_pages,
            globals,
            table,
            gas_used: 0,
            started: false,
            backtrace: Vec::new(),
        })
    }

    /// The instantiated module.
    #[must_use]
    pub fn module(&self) -> &Module {
        &self.program.module
    }

    /// The compiled code, shared with clones.
    #[must_use]
    pub fn compiled(&self) -> &Arc<CompiledModule> {
        &self.program.code
    }

    /// Looks up an exported function by name.
    #[must_use]
    pub fn function_export(&self, name: &str) -> Option<u32> {
        self.program.module.export_function(name)
    }

    /// Linear memory.
    #[must_use]
    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    /// Linear memory, writable.
    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    /// Global values, in global index order.
    #[must_use]
    pub fn globals(&self) -> &[i64] {
        &self.globals
    }

    /// Gas charged since instantiation or the last [`VirtualMachine::reset_gas`].
    #[must_use]
    pub fn gas_used(&self) -> u64 {
        self.gas_used
    }

    /// Resets the gas counter.
    pub fn reset_gas(&mut self) {
        self.gas_used = 0;
    }

    /// `(func, pc)` of every frame active when the last run failed, outermost first.
    #[must_use]
    pub fn last_backtrace(&self) -> &[(u32, u32)] {
        &self.backtrace
    }

    /// Compiles `func` to native code now and attaches it.
    ///
    /// Attached code is shared by every instance using the same compiled module.
    pub fn compile_native(&self, func: u32) -> Result<(), CodegenError> {
        #[cfg(feature = "jit")]
        {
            let code = self
                .program
                .code
                .function(func)
                .ok_or(CodegenError::Backend(format!("function {func} does not exist")))?;
            if code.native.get().is_some() {
                return Ok(());
            }
            code.native.try_claim();
            attach_native(func, code, self.num_globals())
        }
        #[cfg(not(feature = "jit"))]
        {
            let _ = func;
            Err(CodegenError::Unavailable)
        }
    }

    /// Runs function `func` with `args`; `i32` arguments use their low 32 bits.
    ///
    /// The module's start function runs first if it has not run on this instance yet.
    pub fn run(&mut self, func: u32, args: &[i64]) -> Result<Option<i64>, RunError> {
        self.run_traced(func, args, &mut NoTrace)
    }

    /// Like [`VirtualMachine::run`], reporting the events `sink` asks for.
    pub fn run_traced(
        &mut self,
        func: u32,
        args: &[i64],
        sink: &mut dyn TraceSink,
    ) -> Result<Option<i64>, RunError> {
        let mask = sink.mask();
        if mask.contains(TraceMask::RUN) {
            sink.run_start(func, args.len());
        }
        self.backtrace.clear();

        let mut result = Ok(None);
        if !self.started {
            self.started = true;
            if let Some(start) = self.program.module.start {
                result = self.execute(start, &[], sink, mask);
            }
        }
        if result.is_ok() {
            result = self.execute(func, args, sink, mask);
        }

        if mask.contains(TraceMask::RUN) {
            let outcome = match &result {
                Ok(v) => TraceOutcome::Ok(*v),
                Err(e) => TraceOutcome::Err(e),
            };
            sink.run_end(outcome);
        }
        result
    }

    #[cfg(feature = "jit")]
    fn num_globals(&self) -> u32 {
        u32::try_from(self.globals.len()).unwrap_or(u32::MAX)
    }

    fn new_frame(
        &self,
        func: u32,
        args: &[i64],
        ret_target: Option<Reg>,
        caller: (u32, u32),
    ) -> Result<Frame, RunError> {
        let fault = |kind| {
            RunError::Fault(FaultInfo {
                func: caller.0,
                pc: caller.1,
                kind,
            })
        };
        let code = self
            .program
            .code
            .function(func)
            .ok_or_else(|| fault(FaultKind::BadFunction(func)))?;
        if args.len() != code.num_params as usize {
            return Err(fault(FaultKind::ArgumentCount {
                expected: code.num_params,
                actual: args.len(),
            }));
        }
        let mut locals = vec![0_i64; code.num_locals.max(code.num_params) as usize];
        locals[..args.len()].copy_from_slice(args);

        #[cfg(feature = "jit")]
        let mode = match code.native.get() {
            Some(_) => Mode::Native(0),
            None => {
                if self.config.enable_jit {
                    self.request_native(func);
                }
                Mode::Interpret
            }
        };

        Ok(Frame {
            func,
            ix: 0,
            regs: vec![0; code.num_regs as usize],
            locals,
            ret_target,
            #[cfg(feature = "jit")]
            mode,
        })
    }

    #[cfg(feature = "jit")]
    fn request_native(&self, func: u32) {
        let Some(code) = self.program.code.function(func) else {
            return;
        };
        if !code.native.try_claim() {
            return;
        }
        let compiled = Arc::clone(&self.program.code);
        let num_globals = self.num_globals();
        rayon::spawn(move || {
            if let Some(code) = compiled.function(func) {
                let _ = attach_native(func, code, num_globals);
            }
        });
    }

    fn execute(
        &mut self,
        entry: u32,
        args: &[i64],
        sink: &mut dyn TraceSink,
        mask: TraceMask,
    ) -> Result<Option<i64>, RunError> {
        let program = Arc::clone(&self.program);
        let params = program
            .module
            .function_type(entry)
            .map(|t| t.params.clone());
        let args: Vec<i64> = match params {
            Some(params) if params.len() == args.len() => params
                .iter()
                .zip(args)
                .map(|(ty, v)| mask_to(Some(*ty), *v))
                .collect(),
            _ => args.to_vec(),
        };

        let mut frames = vec![self.new_frame(entry, &args, None, (entry, 0))?];
        if mask.contains(TraceMask::CALL) {
            sink.scope_enter(ScopeKind::CallFrame { func: entry }, 1);
        }
        let mut yielded = 0_i64;

        loop {
            let depth = frames.len();
            let Some(frame) = frames.last_mut() else {
                return Err(trap(entry, 0, Trap::InvalidExecution));
            };

            let flow = match self.native_step(&program, frame, &mut yielded, sink, mask) {
                Some(flow) => flow,
                None => self.step(&program, frame, &mut yielded, sink, mask),
            };
            let flow = match flow {
                Ok(flow) => flow,
                Err(e) => {
                    self.record_backtrace(&program, &frames, &e);
                    return Err(e);
                }
            };

            match flow {
                Flow::Next => {}
                Flow::Call(callee) => {
                    if depth >= self.config.max_call_depth {
                        let e = trap(callee.func, 0, Trap::CallStackExhausted);
                        self.record_backtrace(&program, &frames, &e);
                        return Err(e);
                    }
                    if mask.contains(TraceMask::CALL) {
                        sink.scope_enter(ScopeKind::CallFrame { func: callee.func }, depth + 1);
                    }
                    frames.push(callee);
                }
                Flow::Return(value) => {
                    let Some(done) = frames.pop() else {
                        return Err(trap(entry, 0, Trap::InvalidExecution));
                    };
                    if mask.contains(TraceMask::CALL) {
                        sink.scope_exit(ScopeKind::CallFrame { func: done.func }, depth);
                    }
                    let returns = program
                        .code
                        .function(done.func)
                        .is_some_and(|c| c.num_returns == 1);
                    let value = value.filter(|_| returns);
                    let Some(caller) = frames.last_mut() else {
                        return Ok(value);
                    };
                    if let Some(v) = value {
                        let pc = program
                            .instrs(caller.func)
                            .get(caller.ix.saturating_sub(1))
                            .map_or(0, |d| d.offset);
                        caller.set(done.ret_target, v, pc)?;
                    }
                }
            }
        }
    }

    fn record_backtrace(&mut self, program: &Program, frames: &[Frame], error: &RunError) {
        self.backtrace = frames
            .iter()
            .map(|f| {
                let pc = program
                    .instrs(f.func)
                    .get(f.ix.saturating_sub(1))
                    .map_or(0, |d| d.offset);
                (f.func, pc)
            })
            .collect();
        if let Some(last) = self.backtrace.last_mut() {
            *last = error.location();
        }
    }

    /// Runs the frame natively if it is in native mode. Returns `None` when the next instruction
    /// must be interpreted.
    #[cfg(feature = "jit")]
    fn native_step(
        &mut self,
        program: &Program,
        frame: &mut Frame,
        yielded: &mut i64,
        sink: &mut dyn TraceSink,
        mask: TraceMask,
    ) -> Option<Result<Flow, RunError>> {
        let continuation = match frame.mode {
            Mode::Interpret => return None,
            Mode::Resume(k) => {
                frame.mode = Mode::Native(k);
                return None;
            }
            Mode::Native(k) => k,
        };
        let func = frame.func;
        let routine = program.code.function(func)?.native.get()?;
        if mask.contains(TraceMask::NATIVE) {
            sink.native_enter(func, continuation);
        }
        let exit = routine.execute(
            NativeFrame {
                regs: &mut frame.regs,
                locals: &mut frame.locals,
                globals: &mut self.globals,
                memory: &mut self.memory,
                yielded,
            },
            continuation,
        );
        if mask.contains(TraceMask::NATIVE) {
            let code = match exit {
                NativeExit::Done(_) => -1,
                NativeExit::Trapped { trap, .. } => trap.code(),
                NativeExit::Pending { continuation, .. } => {
                    i32::try_from(continuation).unwrap_or(i32::MAX)
                }
            };
            sink.native_exit(func, code);
        }
        Some(match exit {
            NativeExit::Done(v) => Ok(Flow::Return(Some(v))),
            NativeExit::Trapped { trap: t, pc } => {
                if let Some(ix) = program.index_of(func, pc) {
                    frame.ix = ix + 1;
                }
                Err(trap(func, pc, t))
            }
            NativeExit::Pending { continuation, pc } => match program.index_of(func, pc) {
                Some(ix) => {
                    frame.ix = ix;
                    frame.mode = Mode::Resume(continuation);
                    Ok(Flow::Next)
                }
                None => Err(frame.fault(pc, FaultKind::BadJumpTarget(pc))),
            },
        })
    }

    #[cfg(not(feature = "jit"))]
    fn native_step(
        &mut self,
        _program: &Program,
        _frame: &mut Frame,
        _yielded: &mut i64,
        _sink: &mut dyn TraceSink,
        _mask: TraceMask,
    ) -> Option<Result<Flow, RunError>> {
        None
    }

    fn jump(program: &Program, frame: &mut Frame, target: u32, pc: u32) -> Result<(), RunError> {
        frame.ix = program
            .index_of(frame.func, target)
            .ok_or_else(|| frame.fault(pc, FaultKind::BadJumpTarget(target)))?;
        Ok(())
    }

    fn carry(frame: &Frame, yielded: &mut i64, reg: Option<Reg>, pc: u32) -> Result<(), RunError> {
        if let Some(r) = reg {
            *yielded = frame.reg(r, pc)?;
        }
        Ok(())
    }

    /// Returns the memory range `[offset + base, +size)`, or `None` past the end of memory.
    fn effective_range(
        &self,
        offset: u32,
        base: i64,
        size: u32,
    ) -> Option<core::ops::Range<usize>> {
        let start = u64::from(offset) + u64::from(base as u32);
        let end = start + u64::from(size);
        if end > self.memory.len() as u64 {
            return None;
        }
        Some(start as usize..end as usize)
    }

    fn step(
        &mut self,
        program: &Program,
        frame: &mut Frame,
        yielded: &mut i64,
        sink: &mut dyn TraceSink,
        mask: TraceMask,
    ) -> Result<Flow, RunError> {
        let func = frame.func;
        let instrs = program.instrs(func);
        let Some(di) = instrs.get(frame.ix) else {
            let end = instrs.last().map_or(0, |d| d.next);
            return Err(trap(func, end, Trap::InvalidExecution));
        };
        let pc = di.offset;
        if mask.contains(TraceMask::INSTR) {
            sink.instr(func, pc, di.opcode());
        }
        frame.ix += 1;
        let target = di.instr.target;

        match &di.instr.op {
            Op::Place(_) | Op::Nop => {}
            Op::Unreachable => return Err(trap(func, pc, Trap::Unreachable)),
            Op::FpDisabled => return Err(trap(func, pc, Trap::FpDisabled)),
            Op::Select { a, b, cond } => {
                let v = if frame.reg(*cond, pc)? as u32 != 0 {
                    frame.reg(*a, pc)?
                } else {
                    frame.reg(*b, pc)?
                };
                frame.set(target, v, pc)?;
            }
            Op::Phi => frame.set(target, *yielded, pc)?,
            Op::Jmp {
                target: dest,
                yielded: carried,
            } => {
                Self::carry(frame, yielded, *carried, pc)?;
                Self::jump(program, frame, *dest, pc)?;
            }
            Op::JmpIf {
                target: dest,
                cond,
                yielded: carried,
            } => {
                if frame.reg(*cond, pc)? as u32 != 0 {
                    Self::carry(frame, yielded, *carried, pc)?;
                    Self::jump(program, frame, *dest, pc)?;
                }
            }
            Op::JmpTable {
                targets,
                default,
                cond,
                yielded: carried,
            } => {
                let idx = frame.reg(*cond, pc)? as u32;
                let dest = targets.get(idx as usize).unwrap_or(default);
                Self::carry(frame, yielded, *carried, pc)?;
                Self::jump(program, frame, *dest, pc)?;
            }
            Op::ReturnVoid => return Ok(Flow::Return(None)),
            Op::ReturnValue(r) => return Ok(Flow::Return(Some(frame.reg(*r, pc)?))),
            Op::Call { func: callee, args } => {
                let args = args
                    .iter()
                    .map(|r| frame.reg(*r, pc))
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(Flow::Call(self.new_frame(*callee, &args, target, (func, pc))?));
            }
            Op::CallIndirect {
                type_idx,
                args,
                table_index,
            } => {
                let idx = frame.reg(*table_index, pc)? as u32;
                let callee = self
                    .table
                    .get(idx as usize)
                    .copied()
                    .flatten()
                    .ok_or_else(|| trap(func, pc, Trap::UndefinedElement))?;
                let module = &program.module;
                let expected = module.types.get(*type_idx as usize);
                if expected.is_none() || expected != module.function_type(callee) {
                    return Err(trap(func, pc, Trap::IndirectCallTypeMismatch));
                }
                let args = args
                    .iter()
                    .map(|r| frame.reg(*r, pc))
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(Flow::Call(self.new_frame(callee, &args, target, (func, pc))?));
            }
            Op::InvokeImport(import) => {
                let host = self
                    .host_functions
                    .get(*import as usize)
                    .cloned()
                    .ok_or_else(|| frame.fault(pc, FaultKind::BadImport(*import)))?;
                let num_params = program
                    .code
                    .function(func)
                    .map_or(0, |c| c.num_params as usize);
                let params = frame
                    .locals
                    .get(..num_params)
                    .ok_or_else(|| frame.fault(pc, FaultKind::BadLocal(num_params as u32)))?;
                if mask.contains(TraceMask::HOST) {
                    sink.scope_enter(ScopeKind::HostImport { import: *import }, 0);
                }
                let result = host(&mut ImportContext::new(
                    params,
                    &mut self.memory,
                    &mut self.globals,
                ));
                if mask.contains(TraceMask::HOST) {
                    sink.scope_exit(ScopeKind::HostImport { import: *import }, 0);
                }
                let v = result.map_err(|error| RunError::Host { func, pc, error })?;
                let ty = program
                    .module
                    .function_type(func)
                    .and_then(|t| t.results.first().copied());
                frame.set(target, mask_to(ty, v), pc)?;
            }
            Op::AddGas(amount) => {
                let next = self.gas_used.saturating_add(*amount);
                if self.config.gas_limit.is_some_and(|limit| next > limit) {
                    return Err(trap(func, pc, Trap::GasExhausted));
                }
                self.gas_used = next;
            }
            Op::GetLocal(l) => {
                let v = frame
                    .locals
                    .get(*l as usize)
                    .copied()
                    .ok_or_else(|| frame.fault(pc, FaultKind::BadLocal(*l)))?;
                frame.set(target, v, pc)?;
            }
            Op::SetLocal { local, value } => {
                let v = frame.reg(*value, pc)?;
                let fault = frame.fault(pc, FaultKind::BadLocal(*local));
                *frame.locals.get_mut(*local as usize).ok_or(fault)? = v;
            }
            Op::GetGlobal(g) => {
                let v = self
                    .globals
                    .get(*g as usize)
                    .copied()
                    .ok_or_else(|| frame.fault(pc, FaultKind::BadGlobal(*g)))?;
                frame.set(target, v, pc)?;
            }
            Op::SetGlobal { global, value } => {
                let v = frame.reg(*value, pc)?;
                *self
                    .globals
                    .get_mut(*global as usize)
                    .ok_or_else(|| frame.fault(pc, FaultKind::BadGlobal(*global)))? = v;
            }
            Op::CurrentMemory => {
                let pages = (self.memory.len() / PAGE_SIZE) as i64;
                frame.set(target, pages, pc)?;
            }
            Op::GrowMemory(delta) => {
                let delta = frame.reg(*delta, pc)? as u32;
                let old = (self.memory.len() / PAGE_SIZE) as u32;
                let result = match old.checked_add(delta) {
                    Some(new) if new <= self.max_pages => {
                        self.memory.resize(new as usize * PAGE_SIZE, 0);
                        old
                    }
                    _ => u32::MAX,
                };
                frame.set(target, i64::from(result), pc)?;
            }
            Op::Const { op, bits } => {
                let v = if op.class() == OpClass::Const32 {
                    (*bits & 0xFFFF_FFFF) as i64
                } else {
                    *bits as i64
                };
                frame.set(target, v, pc)?;
            }
            Op::Unary { op, a } => {
                let v = numerics::eval_unary(*op, frame.reg(*a, pc)?)
                    .map_err(|t| trap(func, pc, t))?;
                frame.set(target, v, pc)?;
            }
            Op::Binary { op, a, b } => {
                let (a, b) = (frame.reg(*a, pc)?, frame.reg(*b, pc)?);
                let v = numerics::eval_binary(*op, a, b).map_err(|t| trap(func, pc, t))?;
                frame.set(target, v, pc)?;
            }
            Op::Load {
                op, offset, base, ..
            } => {
                let size = access_size(*op, func, pc)?;
                let range = self
                    .effective_range(*offset, frame.reg(*base, pc)?, size)
                    .ok_or_else(|| trap(func, pc, Trap::MemoryOutOfBounds))?;
                let v = numerics::load_value(*op, &self.memory[range])
                    .ok_or_else(|| trap(func, pc, Trap::InvalidExecution))?;
                frame.set(target, v, pc)?;
            }
            Op::Store {
                op,
                offset,
                base,
                value,
                ..
            } => {
                let size = access_size(*op, func, pc)?;
                let v = frame.reg(*value, pc)?;
                let range = self
                    .effective_range(*offset, frame.reg(*base, pc)?, size)
                    .ok_or_else(|| trap(func, pc, Trap::MemoryOutOfBounds))?;
                self.memory[range]
                    .copy_from_slice(&v.to_le_bytes()[..size as usize]);
            }
        }
        Ok(Flow::Next)
    }
}

fn access_size(op: Opcode, func: u32, pc: u32) -> Result<u32, RunError> {
    op.access_size()
        .ok_or_else(|| trap(func, pc, Trap::InvalidExecution))
}

fn eval_const(expr: ConstExpr, globals: &[i64]) -> Option<i64> {
    Some(match expr {
        ConstExpr::I32(v) => i64::from(v.cast_unsigned()),
        ConstExpr::I64(v) => v,
        ConstExpr::F32(bits) => i64::from(bits),
        ConstExpr::F64(bits) => bits.cast_signed(),
        ConstExpr::GetGlobal(g) => *globals.get(g as usize)?,
    })
}

#[cfg(feature = "jit")]
fn attach_native(
    func: u32,
    code: &crate::compiler::InterpreterCode,
    num_globals: u32,
) -> Result<(), CodegenError> {
    match NativeRoutine::compile(code, num_globals) {
        Ok(routine) => {
            debug!(
                func,
                continuations = routine.continuations(),
                "native routine attached"
            );
            code.native.attach(Arc::new(routine));
            Ok(())
        }
        Err(e @ CodegenError::Unsupported { .. }) => {
            debug!(func, reason = %e, "function stays interpreted");
            Err(e)
        }
        Err(e) => {
            warn!(func, error = %e, "native code generation failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostRegistry, NoImports};
    use crate::module::ModuleBuilder;
    use crate::operator::{MemArg, Operator};

    use ValueType::I32;

    fn vm(module: Module) -> VirtualMachine {
        VirtualMachine::new(
            Arc::new(module),
            VmConfig::default(),
            &CompileConfig::default(),
            Box::new(NoImports),
        )
        .unwrap()
    }

    fn add_module() -> (Module, u32) {
        let mut b = ModuleBuilder::new();
        let f = b.function(
            &[I32, I32],
            &[I32],
            &[],
            vec![
                Operator::GetLocal(0),
                Operator::GetLocal(1),
                Operator::Binary(Opcode::I32Add),
                Operator::End,
            ],
        );
        b.export_function("add", f);
        (b.build(), f)
    }

    #[test]
    fn trap_codes_round_trip() {
        for code in -11..=-2 {
            assert_eq!(Trap::from_code(code).map(Trap::code), Some(code));
        }
        assert_eq!(Trap::from_code(-1), None);
        assert_eq!(Trap::from_code(0), None);
    }

    #[test]
    fn runs_exported_add() {
        let (m, _) = add_module();
        let mut vm = vm(m);
        let f = vm.function_export("add").unwrap();
        assert_eq!(vm.run(f, &[2, 3]), Ok(Some(5)));
        assert_eq!(vm.run(f, &[0xFFFF_FFFF, 1]), Ok(Some(0)));
        assert!(vm.function_export("sub").is_none());
    }

    #[test]
    fn wrong_argument_count_is_a_fault() {
        let (m, f) = add_module();
        let mut vm = vm(m);
        let err = vm.run(f, &[1]).unwrap_err();
        assert_eq!(err.trap(), None);
        assert!(matches!(
            err,
            RunError::Fault(FaultInfo {
                kind: FaultKind::ArgumentCount {
                    expected: 2,
                    actual: 1
                },
                ..
            })
        ));
        assert!(matches!(
            vm.run(99, &[]),
            Err(RunError::Fault(FaultInfo {
                kind: FaultKind::BadFunction(99),
                ..
            }))
        ));
    }

    #[test]
    fn memory_grow_reports_old_size_and_failure() {
        let mut b = ModuleBuilder::new();
        b.memory(1, Some(2));
        let f = b.function(
            &[I32],
            &[I32],
            &[],
            vec![
                Operator::GetLocal(0),
                Operator::GrowMemory,
                Operator::End,
            ],
        );
        let mut vm = vm(b.build());
        assert_eq!(vm.run(f, &[1]), Ok(Some(1)));
        assert_eq!(vm.memory().len(), 2 * PAGE_SIZE);
        assert_eq!(vm.run(f, &[1]), Ok(Some(0xFFFF_FFFF)));
        assert_eq!(vm.memory().len(), 2 * PAGE_SIZE);
    }

    #[test]
    fn out_of_bounds_load_traps_with_backtrace() {
        let mut b = ModuleBuilder::new();
        b.memory(1, None);
        let load = b.function(
            &[I32],
            &[I32],
            &[],
            vec![
                Operator::GetLocal(0),
                Operator::Load(Opcode::I32Load, MemArg::default()),
                Operator::End,
            ],
        );
        let outer = b.function(
            &[I32],
            &[I32],
            &[],
            vec![Operator::GetLocal(0), Operator::Call(load), Operator::End],
        );
        let mut vm = vm(b.build());
        assert_eq!(vm.run(outer, &[0]), Ok(Some(0)));
        let err = vm.run(outer, &[PAGE_SIZE as i64 - 3]).unwrap_err();
        assert_eq!(err.trap(), Some(Trap::MemoryOutOfBounds));
        let frames: Vec<u32> = vm.last_backtrace().iter().map(|(f, _)| *f).collect();
        assert_eq!(frames, vec![outer, load]);
    }

    #[test]
    fn start_function_runs_once() {
        let mut b = ModuleBuilder::new();
        let g = b.global(I32, true, ConstExpr::I32(0));
        let start = b.function(
            &[],
            &[],
            &[],
            vec![
                Operator::GetGlobal(g),
                Operator::I32Const(1),
                Operator::Binary(Opcode::I32Add),
                Operator::SetGlobal(g),
                Operator::End,
            ],
        );
        let get = b.function(
            &[],
            &[I32],
            &[],
            vec![Operator::GetGlobal(g), Operator::End],
        );
        b.start(start);
        let mut vm = vm(b.build());
        assert_eq!(vm.run(get, &[]), Ok(Some(1)));
        assert_eq!(vm.run(get, &[]), Ok(Some(1)));
        let mut copy = vm.clone();
        assert_eq!(copy.run(get, &[]), Ok(Some(1)));
    }

    #[test]
    fn host_import_sees_params_and_memory() {
        let mut b = ModuleBuilder::new();
        let poke = b.import_function("env", "poke", &[I32], &[I32]);
        b.memory(1, None);
        let f = b.function(
            &[],
            &[I32],
            &[],
            vec![Operator::I32Const(8), Operator::Call(poke), Operator::End],
        );
        let registry = HostRegistry::new().with_function("env", "poke", |ctx| {
            let addr = ctx.param(0)? as u64;
            ctx.write(addr, &[0xAB])?;
            Ok(-1)
        });
        let mut vm = VirtualMachine::new(
            Arc::new(b.build()),
            VmConfig::default(),
            &CompileConfig::default(),
            Box::new(registry),
        )
        .unwrap();
        assert_eq!(vm.run(f, &[]), Ok(Some(0xFFFF_FFFF)));
        assert_eq!(vm.memory()[8], 0xAB);
    }

    #[test]
    fn unresolved_import_fails_instantiation() {
        let mut b = ModuleBuilder::new();
        b.import_function("env", "missing", &[], &[]);
        let err = VirtualMachine::new(
            Arc::new(b.build()),
            VmConfig::default(),
            &CompileConfig::default(),
            Box::new(NoImports),
        )
        .unwrap_err();
        assert_eq!(
            err,
            InstantiateError::UnresolvedImport {
                module: "env".into(),
                field: "missing".into()
            }
        );
    }

    #[test]
    fn data_segment_out_of_bounds_is_rejected() {
        let mut b = ModuleBuilder::new();
        b.memory(1, None);
        b.data(PAGE_SIZE as u32 - 1, &[1, 2]);
        let err = VirtualMachine::new(
            Arc::new(b.build()),
            VmConfig::default(),
            &CompileConfig::default(),
            Box::new(NoImports),
        )
        .unwrap_err();
        assert_eq!(err, InstantiateError::DataOutOfBounds(0));
    }

    #[test]
    fn deep_recursion_exhausts_call_stack() {
        let mut b = ModuleBuilder::new();
        // Function 0 calls itself unconditionally.
        let f = b.function(&[], &[], &[], vec![Operator::Call(0), Operator::End]);
        assert_eq!(f, 0);
        let mut vm = VirtualMachine::new(
            Arc::new(b.build()),
            VmConfig {
                max_call_depth: 16,
                ..VmConfig::default()
            },
            &CompileConfig::default(),
            Box::new(NoImports),
        )
        .unwrap();
        let err = vm.run(f, &[]).unwrap_err();
        assert_eq!(err.trap(), Some(Trap::CallStackExhausted));
        assert_eq!(vm.last_backtrace().len(), 16);
    }
}
