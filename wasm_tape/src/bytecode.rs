// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Register-bytecode instructions: in-memory form, encoder and decoder.
//!
//! Encoding (little-endian throughout):
//!
//! ```text
//! [target: u32][opcode: u8][operands...]
//! ```
//!
//! `target` is the result register, or `0xFFFF_FFFF` when the instruction produces nothing. Every
//! operand is a 4-byte word except 64-bit immediates (`i64.const`, `f64.const`, `add_gas`), which
//! take 8 bytes. Operand layouts per opcode:
//!
//! | opcode | operands |
//! |---|---|
//! | `select` | `a, b, cond` |
//! | `jmp` | `target_pc, yielded` |
//! | `jmp_if` | `target_pc, cond, yielded` |
//! | `jmp_table` | `count, target_pc * count, default_pc, cond, yielded` |
//! | `return_value` | `value` |
//! | `call` | `func, argc, args * argc` |
//! | `call_indirect` | `type_idx, argc, args * argc, table_index` |
//! | `invoke_import` | `import` |
//! | `add_gas` | `cost: u64` |
//! | `get_local` / `get_global` | `index` |
//! | `set_local` / `set_global` | `index, value` |
//! | `grow_memory` | `pages` |
//! | const | `imm: u32` or `imm: u64` |
//! | unary | `a` |
//! | binary | `a, b` |
//! | load | `align, offset, base` |
//! | store | `align, offset, base, value` |
//!
//! A `yielded` word of `0xFFFF_FFFF` means the edge carries no value.

use crate::format::{DecodeError, Reader, Writer};
use crate::opcode::{OpClass, Opcode};

/// Encoded "no register" marker.
pub const NO_REG: u32 = u32::MAX;

/// A register id. Virtual during compilation, physical once allocated.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u32);

impl Reg {
    /// Returns the register index as `usize`.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// An instruction operation, generic over how jump targets are named.
///
/// The compiler uses symbolic labels; decoded bytecode uses byte offsets (`u32`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op<T> {
    /// Marks where a jump target lands. Encodes to nothing and never appears in decoded code.
    Place(T),
    /// Do nothing.
    Nop,
    /// Trap unconditionally.
    Unreachable,
    /// `target = cond != 0 ? a : b`.
    Select {
        /// Value when the condition is non-zero.
        a: Reg,
        /// Value when the condition is zero.
        b: Reg,
        /// Condition (low 32 bits).
        cond: Reg,
    },
    /// `target = yielded`: receives the value carried by the incoming edge.
    Phi,
    /// Unconditional jump.
    Jmp {
        /// Destination.
        target: T,
        /// Value carried to the destination.
        yielded: Option<Reg>,
    },
    /// Jump if the low 32 bits of `cond` are non-zero.
    JmpIf {
        /// Destination.
        target: T,
        /// Condition.
        cond: Reg,
        /// Value carried to the destination when taken.
        yielded: Option<Reg>,
    },
    /// Multi-way jump indexed by the low 32 bits of `cond` (unsigned).
    JmpTable {
        /// Destinations selected by index.
        targets: Vec<T>,
        /// Destination when the index is out of range.
        default: T,
        /// Index.
        cond: Reg,
        /// Value carried to the destination.
        yielded: Option<Reg>,
    },
    /// Return without a value.
    ReturnVoid,
    /// Return one value.
    ReturnValue(Reg),
    /// Direct call; `target` receives the result if the callee returns one.
    Call {
        /// Function index.
        func: u32,
        /// Argument registers.
        args: Vec<Reg>,
    },
    /// Call through the table.
    CallIndirect {
        /// Expected signature (type index).
        type_idx: u32,
        /// Argument registers.
        args: Vec<Reg>,
        /// Table slot (low 32 bits, unsigned).
        table_index: Reg,
    },
    /// Invoke host import `n` with the current frame's locals as arguments.
    InvokeImport(u32),
    /// Charge gas, trapping if the budget cannot cover it.
    AddGas(u64),
    /// Trap: floating point is disabled for this module.
    FpDisabled,
    /// `target = locals[index]`.
    GetLocal(u32),
    /// `locals[local] = value`.
    SetLocal {
        /// Local index.
        local: u32,
        /// Source register.
        value: Reg,
    },
    /// `target = globals[index]`.
    GetGlobal(u32),
    /// `globals[global] = value`.
    SetGlobal {
        /// Global index.
        global: u32,
        /// Source register.
        value: Reg,
    },
    /// `target = memory size in pages`.
    CurrentMemory,
    /// Grow memory by `pages`; `target` receives the old size or `-1`.
    GrowMemory(Reg),
    /// `target = bits`; `op` is one of the four const opcodes.
    Const {
        /// Const opcode.
        op: Opcode,
        /// Raw immediate (only the low 32 bits for 32-bit consts).
        bits: u64,
    },
    /// One-operand numeric operator.
    Unary {
        /// Operator.
        op: Opcode,
        /// Operand.
        a: Reg,
    },
    /// Two-operand numeric operator.
    Binary {
        /// Operator.
        op: Opcode,
        /// Left operand.
        a: Reg,
        /// Right operand.
        b: Reg,
    },
    /// Memory load from `offset + base`.
    Load {
        /// Load opcode.
        op: Opcode,
        /// Alignment hint.
        align: u32,
        /// Constant offset.
        offset: u32,
        /// Base address register (low 32 bits, unsigned).
        base: Reg,
    },
    /// Memory store of `value` to `offset + base`.
    Store {
        /// Store opcode.
        op: Opcode,
        /// Alignment hint.
        align: u32,
        /// Constant offset.
        offset: u32,
        /// Base address register.
        base: Reg,
        /// Stored value.
        value: Reg,
    },
}

/// One instruction: an operation plus its optional result register.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction<T> {
    /// Result register.
    pub target: Option<Reg>,
    /// Operation.
    pub op: Op<T>,
}

impl<T> Instruction<T> {
    /// Creates an instruction that produces `target`.
    #[must_use]
    pub fn with_target(target: Reg, op: Op<T>) -> Self {
        Self {
            target: Some(target),
            op,
        }
    }

    /// Creates an instruction without a result.
    #[must_use]
    pub fn effect(op: Op<T>) -> Self {
        Self { target: None, op }
    }

    /// Calls `f` for every register the instruction reads.
    pub fn for_each_use(&self, mut f: impl FnMut(Reg)) {
        match &self.op {
            Op::Select { a, b, cond } => {
                f(*a);
                f(*b);
                f(*cond);
            }
            Op::Jmp { yielded, .. } => yielded.iter().copied().for_each(f),
            Op::JmpIf { cond, yielded, .. } | Op::JmpTable { cond, yielded, .. } => {
                f(*cond);
                yielded.iter().copied().for_each(f);
            }
            Op::ReturnValue(r)
            | Op::GrowMemory(r)
            | Op::SetLocal { value: r, .. }
            | Op::SetGlobal { value: r, .. }
            | Op::Unary { a: r, .. }
            | Op::Load { base: r, .. } => f(*r),
            Op::Call { args, .. } => args.iter().copied().for_each(f),
            Op::CallIndirect {
                args, table_index, ..
            } => {
                args.iter().copied().for_each(&mut f);
                f(*table_index);
            }
            Op::Binary { a, b, .. } => {
                f(*a);
                f(*b);
            }
            Op::Store { base, value, .. } => {
                f(*base);
                f(*value);
            }
            Op::Place(_)
            | Op::Nop
            | Op::Unreachable
            | Op::Phi
            | Op::ReturnVoid
            | Op::InvokeImport(_)
            | Op::AddGas(_)
            | Op::FpDisabled
            | Op::GetLocal(_)
            | Op::GetGlobal(_)
            | Op::CurrentMemory
            | Op::Const { .. } => {}
        }
    }

    /// Calls `f` for every register slot the instruction reads or writes, allowing rewrites.
    pub fn for_each_reg_mut(&mut self, mut f: impl FnMut(&mut Reg)) {
        if let Some(t) = self.target.as_mut() {
            f(t);
        }
        match &mut self.op {
            Op::Select { a, b, cond } => {
                f(a);
                f(b);
                f(cond);
            }
            Op::Jmp { yielded, .. } => yielded.iter_mut().for_each(f),
            Op::JmpIf { cond, yielded, .. } | Op::JmpTable { cond, yielded, .. } => {
                f(cond);
                yielded.iter_mut().for_each(f);
            }
            Op::ReturnValue(r)
            | Op::GrowMemory(r)
            | Op::SetLocal { value: r, .. }
            | Op::SetGlobal { value: r, .. }
            | Op::Unary { a: r, .. }
            | Op::Load { base: r, .. } => f(r),
            Op::Call { args, .. } => args.iter_mut().for_each(f),
            Op::CallIndirect {
                args, table_index, ..
            } => {
                args.iter_mut().for_each(&mut f);
                f(table_index);
            }
            Op::Binary { a, b, .. } => {
                f(a);
                f(b);
            }
            Op::Store { base, value, .. } => {
                f(base);
                f(value);
            }
            Op::Place(_)
            | Op::Nop
            | Op::Unreachable
            | Op::Phi
            | Op::ReturnVoid
            | Op::InvokeImport(_)
            | Op::AddGas(_)
            | Op::FpDisabled
            | Op::GetLocal(_)
            | Op::GetGlobal(_)
            | Op::CurrentMemory
            | Op::Const { .. } => {}
        }
    }
}

impl<T> Op<T> {
    /// Returns the opcode this operation encodes to, or `None` for [`Op::Place`].
    #[must_use]
    pub fn opcode(&self) -> Option<Opcode> {
        Some(match self {
            Self::Place(_) => return None,
            Self::Nop => Opcode::Nop,
            Self::Unreachable => Opcode::Unreachable,
            Self::Select { .. } => Opcode::Select,
            Self::Phi => Opcode::Phi,
            Self::Jmp { .. } => Opcode::Jmp,
            Self::JmpIf { .. } => Opcode::JmpIf,
            Self::JmpTable { .. } => Opcode::JmpTable,
            Self::ReturnVoid => Opcode::ReturnVoid,
            Self::ReturnValue(_) => Opcode::ReturnValue,
            Self::Call { .. } => Opcode::Call,
            Self::CallIndirect { .. } => Opcode::CallIndirect,
            Self::InvokeImport(_) => Opcode::InvokeImport,
            Self::AddGas(_) => Opcode::AddGas,
            Self::FpDisabled => Opcode::FpDisabled,
            Self::GetLocal(_) => Opcode::GetLocal,
            Self::SetLocal { .. } => Opcode::SetLocal,
            Self::GetGlobal(_) => Opcode::GetGlobal,
            Self::SetGlobal { .. } => Opcode::SetGlobal,
            Self::CurrentMemory => Opcode::CurrentMemory,
            Self::GrowMemory(_) => Opcode::GrowMemory,
            Self::Const { op, .. }
            | Self::Unary { op, .. }
            | Self::Binary { op, .. }
            | Self::Load { op, .. }
            | Self::Store { op, .. } => *op,
        })
    }

    /// Returns `true` if control never falls through past this operation.
    #[must_use]
    pub fn is_terminator(&self) -> bool {
        self.opcode().is_some_and(Opcode::is_terminator)
    }

    /// Calls `f` for every jump destination.
    pub fn for_each_target(&self, mut f: impl FnMut(&T)) {
        match self {
            Self::Jmp { target, .. } | Self::JmpIf { target, .. } => f(target),
            Self::JmpTable {
                targets, default, ..
            } => {
                targets.iter().for_each(&mut f);
                f(default);
            }
            _ => {}
        }
    }
}

fn reg_word(r: Option<Reg>) -> u32 {
    r.map_or(NO_REG, |r| r.0)
}

fn word_reg(w: u32) -> Option<Reg> {
    (w != NO_REG).then_some(Reg(w))
}

fn len_word(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Encodes `inst` into `w`, delegating every jump-target word to `target`.
///
/// [`Op::Place`] writes nothing; the caller is expected to record the current offset instead.
pub fn encode_with<T>(
    inst: &Instruction<T>,
    w: &mut Writer,
    mut target: impl FnMut(&mut Writer, &T),
) {
    let Some(opcode) = inst.op.opcode() else {
        return;
    };
    w.write_u32_le(reg_word(inst.target));
    w.write_u8(opcode.byte());
    match &inst.op {
        Op::Place(_)
        | Op::Nop
        | Op::Unreachable
        | Op::Phi
        | Op::ReturnVoid
        | Op::FpDisabled
        | Op::CurrentMemory => {}
        Op::Select { a, b, cond } => {
            w.write_u32_le(a.0);
            w.write_u32_le(b.0);
            w.write_u32_le(cond.0);
        }
        Op::Jmp { target: t, yielded } => {
            target(w, t);
            w.write_u32_le(reg_word(*yielded));
        }
        Op::JmpIf {
            target: t,
            cond,
            yielded,
        } => {
            target(w, t);
            w.write_u32_le(cond.0);
            w.write_u32_le(reg_word(*yielded));
        }
        Op::JmpTable {
            targets,
            default,
            cond,
            yielded,
        } => {
            w.write_u32_le(len_word(targets.len()));
            for t in targets {
                target(w, t);
            }
            target(w, default);
            w.write_u32_le(cond.0);
            w.write_u32_le(reg_word(*yielded));
        }
        Op::ReturnValue(r) | Op::GrowMemory(r) => w.write_u32_le(r.0),
        Op::Call { func, args } => {
            w.write_u32_le(*func);
            w.write_u32_le(len_word(args.len()));
            args.iter().for_each(|a| w.write_u32_le(a.0));
        }
        Op::CallIndirect {
            type_idx,
            args,
            table_index,
        } => {
            w.write_u32_le(*type_idx);
            w.write_u32_le(len_word(args.len()));
            args.iter().for_each(|a| w.write_u32_le(a.0));
            w.write_u32_le(table_index.0);
        }
        Op::InvokeImport(idx) | Op::GetLocal(idx) | Op::GetGlobal(idx) => w.write_u32_le(*idx),
        Op::AddGas(cost) => w.write_u64_le(*cost),
        Op::SetLocal { local: idx, value } | Op::SetGlobal { global: idx, value } => {
            w.write_u32_le(*idx);
            w.write_u32_le(value.0);
        }
        Op::Const { op, bits } => match op.class() {
            OpClass::Const64 => w.write_u64_le(*bits),
            _ => w.write_u32_le(*bits as u32),
        },
        Op::Unary { a, .. } => w.write_u32_le(a.0),
        Op::Binary { a, b, .. } => {
            w.write_u32_le(a.0);
            w.write_u32_le(b.0);
        }
        Op::Load {
            align,
            offset,
            base,
            ..
        } => {
            w.write_u32_le(*align);
            w.write_u32_le(*offset);
            w.write_u32_le(base.0);
        }
        Op::Store {
            align,
            offset,
            base,
            value,
            ..
        } => {
            w.write_u32_le(*align);
            w.write_u32_le(*offset);
            w.write_u32_le(base.0);
            w.write_u32_le(value.0);
        }
    }
}

/// Encodes an instruction whose jump targets are already byte offsets.
pub fn encode(inst: &Instruction<u32>, w: &mut Writer) {
    encode_with(inst, w, |w, pc| w.write_u32_le(*pc));
}

/// One decoded instruction and its location in the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedInstr {
    /// Byte offset of the instruction.
    pub offset: u32,
    /// Byte offset of the following instruction.
    pub next: u32,
    /// The instruction, with jump targets as byte offsets.
    pub instr: Instruction<u32>,
}

impl DecodedInstr {
    /// Returns the instruction's opcode.
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        // Decoded instructions never contain `Place`.
        self.instr.op.opcode().unwrap_or(Opcode::Nop)
    }
}

fn read_regs(r: &mut Reader<'_>, n: u32) -> Result<Vec<Reg>, DecodeError> {
    let mut out = Vec::new();
    for _ in 0..n {
        out.push(Reg(r.read_u32_le()?));
    }
    Ok(out)
}

/// Decodes the instruction starting at `offset`.
pub fn decode_at(bytes: &[u8], offset: usize) -> Result<DecodedInstr, DecodeError> {
    let mut r = Reader::at(bytes, offset);
    let target = word_reg(r.read_u32_le()?);
    let tag_offset = r.offset();
    let tag = r.read_u8()?;
    let opcode = Opcode::from_u8(tag).ok_or(DecodeError::UnknownOpcode {
        offset: tag_offset,
        byte: tag,
    })?;

    let op = match opcode.class() {
        OpClass::Const32 => Op::Const {
            op: opcode,
            bits: u64::from(r.read_u32_le()?),
        },
        OpClass::Const64 => Op::Const {
            op: opcode,
            bits: r.read_u64_le()?,
        },
        OpClass::Unary => Op::Unary {
            op: opcode,
            a: Reg(r.read_u32_le()?),
        },
        OpClass::Binary => Op::Binary {
            op: opcode,
            a: Reg(r.read_u32_le()?),
            b: Reg(r.read_u32_le()?),
        },
        OpClass::Load => Op::Load {
            op: opcode,
            align: r.read_u32_le()?,
            offset: r.read_u32_le()?,
            base: Reg(r.read_u32_le()?),
        },
        OpClass::Store => Op::Store {
            op: opcode,
            align: r.read_u32_le()?,
            offset: r.read_u32_le()?,
            base: Reg(r.read_u32_le()?),
            value: Reg(r.read_u32_le()?),
        },
        OpClass::Special => match opcode {
            Opcode::Nop => Op::Nop,
            Opcode::Unreachable => Op::Unreachable,
            Opcode::Phi => Op::Phi,
            Opcode::ReturnVoid => Op::ReturnVoid,
            Opcode::FpDisabled => Op::FpDisabled,
            Opcode::CurrentMemory => Op::CurrentMemory,
            Opcode::Select => Op::Select {
                a: Reg(r.read_u32_le()?),
                b: Reg(r.read_u32_le()?),
                cond: Reg(r.read_u32_le()?),
            },
            Opcode::Jmp => Op::Jmp {
                target: r.read_u32_le()?,
                yielded: word_reg(r.read_u32_le()?),
            },
            Opcode::JmpIf => Op::JmpIf {
                target: r.read_u32_le()?,
                cond: Reg(r.read_u32_le()?),
                yielded: word_reg(r.read_u32_le()?),
            },
            Opcode::JmpTable => {
                let count = r.read_u32_le()?;
                let mut targets = Vec::new();
                for _ in 0..count {
                    targets.push(r.read_u32_le()?);
                }
                Op::JmpTable {
                    targets,
                    default: r.read_u32_le()?,
                    cond: Reg(r.read_u32_le()?),
                    yielded: word_reg(r.read_u32_le()?),
                }
            }
            Opcode::ReturnValue => Op::ReturnValue(Reg(r.read_u32_le()?)),
            Opcode::GrowMemory => Op::GrowMemory(Reg(r.read_u32_le()?)),
            Opcode::Call => {
                let func = r.read_u32_le()?;
                let argc = r.read_u32_le()?;
                Op::Call {
                    func,
                    args: read_regs(&mut r, argc)?,
                }
            }
            Opcode::CallIndirect => {
                let type_idx = r.read_u32_le()?;
                let argc = r.read_u32_le()?;
                let args = read_regs(&mut r, argc)?;
                Op::CallIndirect {
                    type_idx,
                    args,
                    table_index: Reg(r.read_u32_le()?),
                }
            }
            Opcode::InvokeImport => Op::InvokeImport(r.read_u32_le()?),
            Opcode::AddGas => Op::AddGas(r.read_u64_le()?),
            Opcode::GetLocal => Op::GetLocal(r.read_u32_le()?),
            Opcode::GetGlobal => Op::GetGlobal(r.read_u32_le()?),
            Opcode::SetLocal => Op::SetLocal {
                local: r.read_u32_le()?,
                value: Reg(r.read_u32_le()?),
            },
            Opcode::SetGlobal => Op::SetGlobal {
                global: r.read_u32_le()?,
                value: Reg(r.read_u32_le()?),
            },
            _ => return Err(DecodeError::OperandMismatch { offset }),
        },
    };

    Ok(DecodedInstr {
        offset: len_word(offset),
        next: len_word(r.offset()),
        instr: Instruction { target, op },
    })
}

/// Decodes a complete instruction stream.
pub fn decode_instructions(bytes: &[u8]) -> Result<Vec<DecodedInstr>, DecodeError> {
    let mut out = Vec::new();
    let mut offset = 0_usize;
    while offset < bytes.len() {
        let di = decode_at(bytes, offset)?;
        offset = di.next as usize;
        out.push(di);
    }
    Ok(out)
}
