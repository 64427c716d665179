// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Stack-machine operators: the decoded form of a function body.
//!
//! Bodies arrive already disassembled; this crate never parses the binary container. Structured
//! control (`block`/`loop`/`if`) is kept as-is and lowered by [`crate::compiler`].

use crate::module::ValueType;
use crate::opcode::Opcode;

/// Result type of a structured control block.
///
/// At most one value may cross a block boundary.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlockType {
    /// The block yields nothing.
    #[default]
    Empty,
    /// The block yields one value of the given type.
    Value(ValueType),
}

impl BlockType {
    /// Number of values the block yields (0 or 1).
    #[must_use]
    pub const fn arity(self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Value(_) => 1,
        }
    }
}

/// Immediate of a memory access.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct MemArg {
    /// Alignment hint (log2). Carried through to the bytecode; never enforced.
    pub align: u32,
    /// Constant byte offset added to the base address.
    pub offset: u32,
}

/// A stack-machine operator.
///
/// Numeric operators reuse the register-form [`Opcode`]; the compiler rejects an opcode whose
/// [`crate::opcode::OpClass`] does not match the variant it is wrapped in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operator {
    /// Trap unconditionally.
    Unreachable,
    /// Do nothing.
    Nop,
    /// Begin a block; branches to it jump to its end.
    Block(BlockType),
    /// Begin a loop; branches to it jump to its start.
    Loop(BlockType),
    /// Pop a condition and begin a conditional block.
    If(BlockType),
    /// Switch to the alternative arm of the innermost `if`.
    Else,
    /// Close the innermost block, or the function body.
    End,
    /// Unconditional branch to the enclosing block at the given depth.
    Br(u32),
    /// Pop a condition and branch if it is non-zero.
    BrIf(u32),
    /// Pop an index and branch to the selected depth (or the default).
    BrTable {
        /// Branch depths selected by index.
        targets: Vec<u32>,
        /// Depth taken when the index is out of range.
        default: u32,
    },
    /// Return from the function.
    Return,
    /// Direct call through the function index space.
    Call(u32),
    /// Indirect call through the table, checked against the given type index.
    CallIndirect(u32),
    /// Discard the top of the stack.
    Drop,
    /// Pop `cond`, `b`, `a`; push `cond != 0 ? a : b`.
    Select,
    /// Push a local.
    GetLocal(u32),
    /// Pop into a local.
    SetLocal(u32),
    /// Copy the top of the stack into a local without popping it.
    TeeLocal(u32),
    /// Push a global.
    GetGlobal(u32),
    /// Pop into a global.
    SetGlobal(u32),
    /// Memory load; the opcode must be of class `Load`.
    Load(Opcode, MemArg),
    /// Memory store; the opcode must be of class `Store`.
    Store(Opcode, MemArg),
    /// Push the memory size in pages.
    CurrentMemory,
    /// Pop a page delta, grow memory, push the previous size (or -1).
    GrowMemory,
    /// Push an `i32` constant.
    I32Const(i32),
    /// Push an `i64` constant.
    I64Const(i64),
    /// Push an `f32` constant, given as raw bits.
    F32Const(u32),
    /// Push an `f64` constant, given as raw bits.
    F64Const(u64),
    /// One-operand numeric operator (including conversions).
    Unary(Opcode),
    /// Two-operand numeric operator (including comparisons).
    Binary(Opcode),
}
