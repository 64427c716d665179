// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Human-readable listings of register bytecode.
//!
//! One instruction per line: byte offset, result register (if any), mnemonic and operands. Jump
//! targets are printed as byte offsets so they can be matched against the left column.
//!
//! ```text
//! ; regs=2 params=2 locals=2 returns=1
//! 0000: r0 = get_local 0
//! 0009: r1 = get_local 1
//! 0012: r0 = i32.add r0, r1
//! 001f: return_value r0
//! ```

use core::fmt::{self, Write as _};

use crate::bytecode::{DecodedInstr, Op, Reg, decode_instructions};
use crate::compiler::{CompiledModule, InterpreterCode};
use crate::module::Module;

struct Regs<'a>(&'a [Reg]);

impl fmt::Display for Regs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "r{}", r.0)?;
        }
        Ok(())
    }
}

fn carried(f: &mut String, yielded: Option<Reg>) -> fmt::Result {
    match yielded {
        Some(r) => write!(f, " yield r{}", r.0),
        None => Ok(()),
    }
}

fn write_instr(out: &mut String, di: &DecodedInstr) -> fmt::Result {
    write!(out, "{:04x}: ", di.offset)?;
    if let Some(t) = di.instr.target {
        write!(out, "r{} = ", t.0)?;
    }
    out.push_str(di.opcode().name());
    match &di.instr.op {
        Op::Place(_)
        | Op::Nop
        | Op::Unreachable
        | Op::Phi
        | Op::ReturnVoid
        | Op::FpDisabled
        | Op::CurrentMemory => {}
        Op::Select { a, b, cond } => write!(out, " r{}, r{} if r{}", a.0, b.0, cond.0)?,
        Op::Jmp { target, yielded } => {
            write!(out, " @{target:04x}")?;
            carried(out, *yielded)?;
        }
        Op::JmpIf {
            target,
            cond,
            yielded,
        } => {
            write!(out, " @{target:04x} if r{}", cond.0)?;
            carried(out, *yielded)?;
        }
        Op::JmpTable {
            targets,
            default,
            cond,
            yielded,
        } => {
            write!(out, " r{} [", cond.0)?;
            for (i, t) in targets.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write!(out, "@{t:04x}")?;
            }
            write!(out, "] default @{default:04x}")?;
            carried(out, *yielded)?;
        }
        Op::ReturnValue(r) | Op::GrowMemory(r) => write!(out, " r{}", r.0)?,
        Op::Call { func, args } => write!(out, " f{func}({})", Regs(args))?,
        Op::CallIndirect {
            type_idx,
            args,
            table_index,
        } => write!(out, " type{type_idx} [r{}]({})", table_index.0, Regs(args))?,
        Op::InvokeImport(i) => write!(out, " import{i}")?,
        Op::AddGas(n) => write!(out, " {n}")?,
        Op::GetLocal(i) | Op::GetGlobal(i) => write!(out, " {i}")?,
        Op::SetLocal { local: i, value } | Op::SetGlobal { global: i, value } => {
            write!(out, " {i}, r{}", value.0)?;
        }
        Op::Const { bits, .. } => write!(out, " {bits:#x}")?,
        Op::Unary { a, .. } => write!(out, " r{}", a.0)?,
        Op::Binary { a, b, .. } => write!(out, " r{}, r{}", a.0, b.0)?,
        Op::Load { offset, base, .. } => write!(out, " [r{} + {offset}]", base.0)?,
        Op::Store {
            offset,
            base,
            value,
            ..
        } => write!(out, " [r{} + {offset}], r{}", base.0, value.0)?,
    }
    out.push('\n');
    Ok(())
}

fn listing(code: &InterpreterCode, out: &mut String) -> fmt::Result {
    writeln!(
        out,
        "; regs={} params={} locals={} returns={}",
        code.num_regs, code.num_params, code.num_locals, code.num_returns
    )?;
    match decode_instructions(&code.bytes) {
        Ok(instrs) => {
            for di in &instrs {
                write_instr(out, di)?;
            }
        }
        Err(e) => writeln!(out, "; decode error: {e}")?,
    }
    Ok(())
}

/// Disassembles one function.
///
/// Best-effort: a stream that does not decode produces the header and an error comment.
#[must_use]
pub fn disassemble(code: &InterpreterCode) -> String {
    let mut out = String::new();
    // Writing into a `String` cannot fail.
    let _ = listing(code, &mut out);
    out
}

/// Disassembles every function of `compiled`, headed by its index and debug name.
#[must_use]
pub fn disassemble_module(module: &Module, compiled: &CompiledModule) -> String {
    let mut out = String::new();
    for (idx, code) in compiled.functions.iter().enumerate() {
        let func = u32::try_from(idx).unwrap_or(u32::MAX);
        let _ = match module.function_name(func) {
            Some(name) => writeln!(out, "f{func} <{name}>:"),
            None => writeln!(out, "f{func}:"),
        };
        let _ = listing(code, &mut out);
        out.push('\n');
    }
    out
}
