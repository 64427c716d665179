// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `wasm_tape`: a register-bytecode engine for stack-machine modules.
//!
//! A decoded [`module::Module`] is compiled function by function into register bytecode:
//! the stack is flattened into virtual registers, optional passes filter floating point and insert
//! gas counters, and a liveness-based allocator packs the registers into a small frame. The
//! [`vm::VirtualMachine`] interprets that bytecode and, with the `jit` feature, can hand whole
//! functions to Cranelift-generated native routines that suspend back to the interpreter for
//! calls.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use wasm_tape::compiler::CompileConfig;
//! use wasm_tape::host::NoImports;
//! use wasm_tape::module::{ModuleBuilder, ValueType};
//! use wasm_tape::opcode::Opcode;
//! use wasm_tape::operator::Operator;
//! use wasm_tape::vm::{VirtualMachine, VmConfig};
//!
//! let mut b = ModuleBuilder::new();
//! let add = b.function(
//!     &[ValueType::I32, ValueType::I32],
//!     &[ValueType::I32],
//!     &[],
//!     vec![
//!         Operator::GetLocal(0),
//!         Operator::GetLocal(1),
//!         Operator::Binary(Opcode::I32Add),
//!         Operator::End,
//!     ],
//! );
//! b.export_function("add", add);
//!
//! let mut vm = VirtualMachine::new(
//!     Arc::new(b.build()),
//!     VmConfig::default(),
//!     &CompileConfig::default(),
//!     Box::new(NoImports),
//! )?;
//! let add = vm.function_export("add").unwrap();
//! assert_eq!(vm.run(add, &[2, 3])?, Some(5));
//! # Ok::<(), Box<dyn core::error::Error>>(())
//! ```
//!
//! ## Features
//!
//! - `jit` (default): Cranelift-backed native routines ([`jit`]).
//! - `serde`: `Serialize`/`Deserialize` for configuration and type descriptions.

pub(crate) mod analysis;
pub mod asm;
pub mod bytecode;
pub mod compiler;
pub mod disasm;
pub mod format;
pub mod host;
pub mod jit;
pub mod module;
pub(crate) mod numerics;
pub mod opcode;
pub mod operator;
pub mod trace;
pub mod vm;

pub use compiler::{CompileConfig, CompileError, CompiledModule, InterpreterCode, compile_module};
pub use module::{Module, ModuleBuilder, ValueType};
pub use vm::{RunError, Trap, VirtualMachine, VmConfig};
