// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Register bytecode to Cranelift IR.
//!
//! The generated routine has the signature
//!
//! ```text
//! fn(regs, locals, globals, memory, memory_len, yielded, continuation, ret) -> i32
//! ```
//!
//! and is a resumable state machine. The entry block dispatches on `continuation`: 0 starts at
//! the first instruction, `k > 0` resumes right after the `k`-th hand-off instruction. A hand-off
//! (call, indirect call, host import, gas charge, memory growth) stores its own byte offset in
//! `*ret` and returns `k`; the driver interprets that one instruction and re-enters at `k`.
//!
//! Every register, local and global access is range-checked here, at translation time, against the
//! frame shape the routine is compiled for. Memory accesses are checked at run time.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{Block, InstBuilder, MemFlags, Value, types};
use cranelift_frontend::{FunctionBuilder, Switch};
use hashbrown::HashMap;

use crate::bytecode::{DecodedInstr, Op, Reg, decode_instructions};
use crate::jit::CodegenError;
use crate::opcode::{OpClass, Opcode};
use crate::vm::Trap;

/// Return code for a normal return; the result (if any) is in `*ret`.
pub(crate) const DONE: i32 = -1;

/// Frame shape a routine is compiled against.
#[derive(Copy, Clone, Debug)]
pub(crate) struct FrameShape {
    pub(crate) num_regs: u32,
    pub(crate) num_locals: u32,
    pub(crate) num_globals: u32,
}

/// Returns `true` for operations the routine hands back to the driver.
pub(crate) fn is_handoff<T>(op: &Op<T>) -> bool {
    matches!(
        op,
        Op::Call { .. }
            | Op::CallIndirect { .. }
            | Op::InvokeImport(_)
            | Op::AddGas(_)
            | Op::GrowMemory(_)
    )
}

struct Params {
    regs: Value,
    locals: Value,
    globals: Value,
    memory: Value,
    memory_len: Value,
    yielded: Value,
    ret: Value,
}

struct Translator<'a> {
    b: FunctionBuilder<'a>,
    p: Params,
    shape: FrameShape,
    targets: HashMap<u32, Block>,
    resumes: Vec<Block>,
    next_resume: usize,
    terminated: bool,
}

/// Translates `bytes` into `b`, whose function signature is already set. Returns the number of
/// hand-off continuations.
pub(crate) fn translate(
    mut b: FunctionBuilder<'_>,
    bytes: &[u8],
    shape: FrameShape,
) -> Result<u32, CodegenError> {
    let instrs = decode_instructions(bytes).map_err(CodegenError::Decode)?;

    let entry = b.create_block();
    b.append_block_params_for_function_params(entry);
    b.switch_to_block(entry);
    let params = b.block_params(entry).to_vec();
    let [regs, locals, globals, memory, memory_len, yielded, continuation, ret] = params[..]
    else {
        return Err(CodegenError::Backend("unexpected routine signature".into()));
    };

    let mut targets: HashMap<u32, Block> = HashMap::new();
    let mut resumes = Vec::new();
    for di in &instrs {
        let mut bad = None;
        di.instr.op.for_each_target(|&t| {
            if instrs.binary_search_by_key(&t, |d| d.offset).is_err() {
                bad = Some(t);
            }
        });
        if let Some(target) = bad {
            return Err(CodegenError::InvalidJumpTarget {
                pc: di.offset,
                target,
            });
        }
        di.instr.op.for_each_target(|&t| {
            targets.entry(t).or_insert_with(|| b.create_block());
        });
        if is_handoff(&di.instr.op) {
            resumes.push(b.create_block());
        }
    }
    let start = *targets.entry(0).or_insert_with(|| b.create_block());

    let mut dispatch = Switch::new();
    dispatch.set_entry(0, start);
    for (k, blk) in resumes.iter().enumerate() {
        dispatch.set_entry(k as u128 + 1, *blk);
    }
    let bad_continuation = b.create_block();
    dispatch.emit(&mut b, continuation, bad_continuation);

    let mut t = Translator {
        b,
        p: Params {
            regs,
            locals,
            globals,
            memory,
            memory_len,
            yielded,
            ret,
        },
        shape,
        targets,
        resumes,
        next_resume: 0,
        terminated: true,
    };

    t.b.switch_to_block(bad_continuation);
    t.exit(Trap::InvalidExecution.code(), 0);

    for di in &instrs {
        t.begin(di.offset);
        t.instr(di)?;
    }
    if !t.terminated || instrs.is_empty() {
        if instrs.is_empty() {
            t.b.switch_to_block(start);
        }
        let end = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
        t.exit(Trap::InvalidExecution.code(), i64::from(end));
    }

    let continuations = u32::try_from(t.resumes.len()).unwrap_or(u32::MAX);
    t.b.seal_all_blocks();
    t.b.finalize();
    Ok(continuations)
}

fn heap_flags() -> MemFlags {
    let mut f = MemFlags::new();
    f.set_notrap();
    f
}

impl Translator<'_> {
    fn begin(&mut self, pc: u32) {
        if let Some(&blk) = self.targets.get(&pc) {
            if !self.terminated {
                self.b.ins().jump(blk, &[]);
            }
            self.b.switch_to_block(blk);
            self.terminated = false;
        } else if self.terminated {
            let dead = self.b.create_block();
            self.b.switch_to_block(dead);
            self.terminated = false;
        }
    }

    /// Stores `ret` in the return slot and returns `code`.
    fn exit(&mut self, code: i32, ret: i64) {
        let v = self.b.ins().iconst(types::I64, ret);
        self.b.ins().store(MemFlags::trusted(), v, self.p.ret, 0);
        let c = self
            .b
            .ins()
            .iconst(types::I32, i64::from(code.cast_unsigned()));
        self.b.ins().return_(&[c]);
        self.terminated = true;
    }

    fn trap_if(&mut self, cond: Value, trap: Trap, pc: u32) {
        let trap_blk = self.b.create_block();
        let cont = self.b.create_block();
        self.b.ins().brif(cond, trap_blk, &[], cont, &[]);
        self.b.switch_to_block(trap_blk);
        self.exit(trap.code(), i64::from(pc));
        self.b.switch_to_block(cont);
        self.terminated = false;
    }

    fn slot(index: u32, limit: u32) -> Option<i32> {
        if index >= limit {
            return None;
        }
        i32::try_from(u64::from(index) * 8).ok()
    }

    fn reg_offset(&self, r: Reg, pc: u32) -> Result<i32, CodegenError> {
        Self::slot(r.0, self.shape.num_regs)
            .ok_or(CodegenError::RegisterOutOfRange { pc, reg: r.0 })
    }

    fn get(&mut self, r: Reg, pc: u32) -> Result<Value, CodegenError> {
        let off = self.reg_offset(r, pc)?;
        Ok(self
            .b
            .ins()
            .load(types::I64, MemFlags::trusted(), self.p.regs, off))
    }

    fn get32(&mut self, r: Reg, pc: u32) -> Result<Value, CodegenError> {
        let v = self.get(r, pc)?;
        Ok(self.b.ins().ireduce(types::I32, v))
    }

    fn set(&mut self, target: Option<Reg>, v: Value, pc: u32) -> Result<(), CodegenError> {
        if let Some(r) = target {
            let off = self.reg_offset(r, pc)?;
            self.b
                .ins()
                .store(MemFlags::trusted(), v, self.p.regs, off);
        }
        Ok(())
    }

    fn set32(&mut self, target: Option<Reg>, v: Value, pc: u32) -> Result<(), CodegenError> {
        let wide = self.b.ins().uextend(types::I64, v);
        self.set(target, wide, pc)
    }

    fn set_flag(&mut self, target: Option<Reg>, flag: Value, pc: u32) -> Result<(), CodegenError> {
        let wide = self.b.ins().uextend(types::I64, flag);
        self.set(target, wide, pc)
    }

    fn store_yielded(&mut self, yielded: Option<Reg>, pc: u32) -> Result<(), CodegenError> {
        if let Some(r) = yielded {
            let v = self.get(r, pc)?;
            self.b
                .ins()
                .store(MemFlags::trusted(), v, self.p.yielded, 0);
        }
        Ok(())
    }

    fn target_block(&self, target: u32, pc: u32) -> Result<Block, CodegenError> {
        self.targets
            .get(&target)
            .copied()
            .ok_or(CodegenError::InvalidJumpTarget { pc, target })
    }

    /// Checks `[offset + base, +size)` against the memory length and returns the host address.
    fn heap_addr(
        &mut self,
        base: Reg,
        offset: u32,
        size: u32,
        pc: u32,
    ) -> Result<Value, CodegenError> {
        let base = self.get32(base, pc)?;
        let addr = self.b.ins().uextend(types::I64, base);
        let addr = self.b.ins().iadd_imm(addr, i64::from(offset));
        let end = self.b.ins().iadd_imm(addr, i64::from(size));
        let oob = self
            .b
            .ins()
            .icmp(IntCC::UnsignedGreaterThan, end, self.p.memory_len);
        self.trap_if(oob, Trap::MemoryOutOfBounds, pc);
        Ok(self.b.ins().iadd(self.p.memory, addr))
    }

    fn instr(&mut self, di: &DecodedInstr) -> Result<(), CodegenError> {
        let pc = di.offset;
        let target = di.instr.target;
        match &di.instr.op {
            Op::Place(_) | Op::Nop => {}
            Op::Unreachable => self.exit(Trap::Unreachable.code(), i64::from(pc)),
            Op::FpDisabled => self.exit(Trap::FpDisabled.code(), i64::from(pc)),
            Op::Select { a, b, cond } => {
                let c = self.get32(*cond, pc)?;
                let x = self.get(*a, pc)?;
                let y = self.get(*b, pc)?;
                let v = self.b.ins().select(c, x, y);
                self.set(target, v, pc)?;
            }
            Op::Phi => {
                let v = self
                    .b
                    .ins()
                    .load(types::I64, MemFlags::trusted(), self.p.yielded, 0);
                self.set(target, v, pc)?;
            }
            Op::Jmp {
                target: dest,
                yielded,
            } => {
                let blk = self.target_block(*dest, pc)?;
                self.store_yielded(*yielded, pc)?;
                self.b.ins().jump(blk, &[]);
                self.terminated = true;
            }
            Op::JmpIf {
                target: dest,
                cond,
                yielded,
            } => {
                let blk = self.target_block(*dest, pc)?;
                let c = self.get32(*cond, pc)?;
                let fallthrough = self.b.create_block();
                if yielded.is_some() {
                    let taken = self.b.create_block();
                    self.b.ins().brif(c, taken, &[], fallthrough, &[]);
                    self.b.switch_to_block(taken);
                    self.store_yielded(*yielded, pc)?;
                    self.b.ins().jump(blk, &[]);
                } else {
                    self.b.ins().brif(c, blk, &[], fallthrough, &[]);
                }
                self.b.switch_to_block(fallthrough);
            }
            Op::JmpTable {
                targets,
                default,
                cond,
                yielded,
            } => {
                let idx = self.get32(*cond, pc)?;
                self.store_yielded(*yielded, pc)?;
                let mut sw = Switch::new();
                for (i, t) in targets.iter().enumerate() {
                    let blk = self.target_block(*t, pc)?;
                    sw.set_entry(i as u128, blk);
                }
                let default = self.target_block(*default, pc)?;
                sw.emit(&mut self.b, idx, default);
                self.terminated = true;
            }
            Op::ReturnVoid => self.exit(DONE, 0),
            Op::ReturnValue(r) => {
                let v = self.get(*r, pc)?;
                self.b.ins().store(MemFlags::trusted(), v, self.p.ret, 0);
                let c = self
                    .b
                    .ins()
                    .iconst(types::I32, i64::from(DONE.cast_unsigned()));
                self.b.ins().return_(&[c]);
                self.terminated = true;
            }
            Op::Call { .. }
            | Op::CallIndirect { .. }
            | Op::InvokeImport(_)
            | Op::AddGas(_)
            | Op::GrowMemory(_) => {
                let resume = self.resumes[self.next_resume];
                self.next_resume += 1;
                let k = i32::try_from(self.next_resume).unwrap_or(i32::MAX);
                self.exit(k, i64::from(pc));
                self.b.switch_to_block(resume);
                self.terminated = false;
            }
            Op::CurrentMemory => {
                let pages = self.b.ins().ushr_imm(self.p.memory_len, 16);
                self.set(target, pages, pc)?;
            }
            Op::GetLocal(l) => {
                let off = Self::slot(*l, self.shape.num_locals)
                    .ok_or(CodegenError::LocalOutOfRange { pc, local: *l })?;
                let v = self
                    .b
                    .ins()
                    .load(types::I64, MemFlags::trusted(), self.p.locals, off);
                self.set(target, v, pc)?;
            }
            Op::SetLocal { local, value } => {
                let off = Self::slot(*local, self.shape.num_locals)
                    .ok_or(CodegenError::LocalOutOfRange { pc, local: *local })?;
                let v = self.get(*value, pc)?;
                self.b
                    .ins()
                    .store(MemFlags::trusted(), v, self.p.locals, off);
            }
            Op::GetGlobal(g) => {
                let off = Self::slot(*g, self.shape.num_globals)
                    .ok_or(CodegenError::GlobalOutOfRange { pc, global: *g })?;
                let v = self
                    .b
                    .ins()
                    .load(types::I64, MemFlags::trusted(), self.p.globals, off);
                self.set(target, v, pc)?;
            }
            Op::SetGlobal { global, value } => {
                let off = Self::slot(*global, self.shape.num_globals)
                    .ok_or(CodegenError::GlobalOutOfRange {
                        pc,
                        global: *global,
                    })?;
                let v = self.get(*value, pc)?;
                self.b
                    .ins()
                    .store(MemFlags::trusted(), v, self.p.globals, off);
            }
            Op::Const { bits, .. } => {
                let v = self.b.ins().iconst(types::I64, *bits as i64);
                self.set(target, v, pc)?;
            }
            Op::Unary { op, a } => self.unary(*op, *a, target, pc)?,
            Op::Binary { op, a, b } => self.binary(*op, *a, *b, target, pc)?,
            Op::Load {
                op, offset, base, ..
            } => self.load(*op, *offset, *base, target, pc)?,
            Op::Store {
                op,
                offset,
                base,
                value,
                ..
            } => self.store(*op, *offset, *base, *value, pc)?,
        }
        Ok(())
    }

    fn unary(
        &mut self,
        op: Opcode,
        a: Reg,
        target: Option<Reg>,
        pc: u32,
    ) -> Result<(), CodegenError> {
        use Opcode as O;
        match op {
            O::I32Clz | O::I32Ctz | O::I32Popcnt => {
                let x = self.get32(a, pc)?;
                let v = match op {
                    O::I32Clz => self.b.ins().clz(x),
                    O::I32Ctz => self.b.ins().ctz(x),
                    _ => self.b.ins().popcnt(x),
                };
                self.set32(target, v, pc)
            }
            O::I32Eqz => {
                let x = self.get32(a, pc)?;
                let f = self.b.ins().icmp_imm(IntCC::Equal, x, 0);
                self.set_flag(target, f, pc)
            }
            O::I64Clz | O::I64Ctz | O::I64Popcnt => {
                let x = self.get(a, pc)?;
                let v = match op {
                    O::I64Clz => self.b.ins().clz(x),
                    O::I64Ctz => self.b.ins().ctz(x),
                    _ => self.b.ins().popcnt(x),
                };
                self.set(target, v, pc)
            }
            O::I64Eqz => {
                let x = self.get(a, pc)?;
                let f = self.b.ins().icmp_imm(IntCC::Equal, x, 0);
                self.set_flag(target, f, pc)
            }
            O::I32WrapI64
            | O::I64ExtendUI32
            | O::I32ReinterpretF32
            | O::F32ReinterpretI32 => {
                let x = self.get(a, pc)?;
                let v = self.b.ins().band_imm(x, 0xFFFF_FFFF);
                self.set(target, v, pc)
            }
            O::I64ExtendSI32 => {
                let x = self.get32(a, pc)?;
                let v = self.b.ins().sextend(types::I64, x);
                self.set(target, v, pc)
            }
            O::I64ReinterpretF64 | O::F64ReinterpretI64 => {
                let x = self.get(a, pc)?;
                self.set(target, x, pc)
            }
            _ => Err(CodegenError::Unsupported { pc, opcode: op }),
        }
    }

    fn binary(
        &mut self,
        op: Opcode,
        a: Reg,
        b: Reg,
        target: Option<Reg>,
        pc: u32,
    ) -> Result<(), CodegenError> {
        use Opcode as O;
        let byte = op.byte();
        let is32 = (0x20..=0x3C).contains(&byte);
        let is64 = (0x40..=0x5C).contains(&byte);
        if !is32 && !is64 {
            return Err(CodegenError::Unsupported { pc, opcode: op });
        }
        let (x, y) = if is32 {
            (self.get32(a, pc)?, self.get32(b, pc)?)
        } else {
            (self.get(a, pc)?, self.get(b, pc)?)
        };
        let ty = if is32 { types::I32 } else { types::I64 };
        // Narrow immediates are zero-extended.
        let (min, neg1) = if is32 {
            (0x8000_0000, 0xFFFF_FFFF)
        } else {
            (i64::MIN, -1)
        };

        let cmp = match op {
            O::I32Eq | O::I64Eq => Some(IntCC::Equal),
            O::I32Ne | O::I64Ne => Some(IntCC::NotEqual),
            O::I32LtS | O::I64LtS => Some(IntCC::SignedLessThan),
            O::I32LtU | O::I64LtU => Some(IntCC::UnsignedLessThan),
            O::I32GtS | O::I64GtS => Some(IntCC::SignedGreaterThan),
            O::I32GtU | O::I64GtU => Some(IntCC::UnsignedGreaterThan),
            O::I32LeS | O::I64LeS => Some(IntCC::SignedLessThanOrEqual),
            O::I32LeU | O::I64LeU => Some(IntCC::UnsignedLessThanOrEqual),
            O::I32GeS | O::I64GeS => Some(IntCC::SignedGreaterThanOrEqual),
            O::I32GeU | O::I64GeU => Some(IntCC::UnsignedGreaterThanOrEqual),
            _ => None,
        };
        if let Some(cc) = cmp {
            let f = self.b.ins().icmp(cc, x, y);
            return self.set_flag(target, f, pc);
        }

        let v = match op {
            O::I32Add | O::I64Add => self.b.ins().iadd(x, y),
            O::I32Sub | O::I64Sub => self.b.ins().isub(x, y),
            O::I32Mul | O::I64Mul => self.b.ins().imul(x, y),
            O::I32And | O::I64And => self.b.ins().band(x, y),
            O::I32Or | O::I64Or => self.b.ins().bor(x, y),
            O::I32Xor | O::I64Xor => self.b.ins().bxor(x, y),
            O::I32Shl | O::I64Shl => self.b.ins().ishl(x, y),
            O::I32ShrS | O::I64ShrS => self.b.ins().sshr(x, y),
            O::I32ShrU | O::I64ShrU => self.b.ins().ushr(x, y),
            O::I32Rotl | O::I64Rotl => self.b.ins().rotl(x, y),
            O::I32Rotr | O::I64Rotr => self.b.ins().rotr(x, y),
            O::I32DivU | O::I64DivU | O::I32RemU | O::I64RemU => {
                let zero = self.b.ins().icmp_imm(IntCC::Equal, y, 0);
                self.trap_if(zero, Trap::Arithmetic, pc);
                if matches!(op, O::I32DivU | O::I64DivU) {
                    self.b.ins().udiv(x, y)
                } else {
                    self.b.ins().urem(x, y)
                }
            }
            O::I32DivS | O::I64DivS => {
                let zero = self.b.ins().icmp_imm(IntCC::Equal, y, 0);
                self.trap_if(zero, Trap::Arithmetic, pc);
                let x_min = self.b.ins().icmp_imm(IntCC::Equal, x, min);
                let y_neg1 = self.b.ins().icmp_imm(IntCC::Equal, y, neg1);
                let overflow = self.b.ins().band(x_min, y_neg1);
                self.trap_if(overflow, Trap::Arithmetic, pc);
                self.b.ins().sdiv(x, y)
            }
            O::I32RemS | O::I64RemS => {
                let zero = self.b.ins().icmp_imm(IntCC::Equal, y, 0);
                self.trap_if(zero, Trap::Arithmetic, pc);
                // x % -1 is always 0; a divisor of 1 avoids the hardware overflow fault.
                let y_neg1 = self.b.ins().icmp_imm(IntCC::Equal, y, neg1);
                let one = self.b.ins().iconst(ty, 1);
                let divisor = self.b.ins().select(y_neg1, one, y);
                self.b.ins().srem(x, divisor)
            }
            _ => return Err(CodegenError::Unsupported { pc, opcode: op }),
        };
        if is32 {
            self.set32(target, v, pc)
        } else {
            self.set(target, v, pc)
        }
    }

    fn load(
        &mut self,
        op: Opcode,
        offset: u32,
        base: Reg,
        target: Option<Reg>,
        pc: u32,
    ) -> Result<(), CodegenError> {
        use Opcode as O;
        let size = op
            .access_size()
            .filter(|_| op.class() == OpClass::Load)
            .ok_or(CodegenError::Unsupported { pc, opcode: op })?;
        let p = self.heap_addr(base, offset, size, pc)?;
        let f = heap_flags();
        let ins = self.b.ins();
        let v = match op {
            O::I32Load | O::F32Load | O::I64Load32U => ins.uload32(f, p, 0),
            O::I64Load | O::F64Load => ins.load(types::I64, f, p, 0),
            O::I32Load8U | O::I64Load8U => ins.uload8(types::I64, f, p, 0),
            O::I32Load16U | O::I64Load16U => ins.uload16(types::I64, f, p, 0),
            O::I32Load8S | O::I64Load8S => ins.sload8(types::I64, f, p, 0),
            O::I32Load16S | O::I64Load16S => ins.sload16(types::I64, f, p, 0),
            O::I64Load32S => ins.sload32(f, p, 0),
            _ => return Err(CodegenError::Unsupported { pc, opcode: op }),
        };
        // i32 results are kept zero-extended in their cell.
        let v = if matches!(op, O::I32Load8S | O::I32Load16S) {
            self.b.ins().band_imm(v, 0xFFFF_FFFF)
        } else {
            v
        };
        self.set(target, v, pc)
    }

    fn store(
        &mut self,
        op: Opcode,
        offset: u32,
        base: Reg,
        value: Reg,
        pc: u32,
    ) -> Result<(), CodegenError> {
        use Opcode as O;
        let size = op
            .access_size()
            .filter(|_| op.class() == OpClass::Store)
            .ok_or(CodegenError::Unsupported { pc, opcode: op })?;
        let v = self.get(value, pc)?;
        let p = self.heap_addr(base, offset, size, pc)?;
        let f = heap_flags();
        match op {
            O::I64Store | O::F64Store => {
                self.b.ins().store(f, v, p, 0);
            }
            O::I32Store | O::F32Store | O::I64Store32 => {
                self.b.ins().istore32(f, v, p, 0);
            }
            O::I32Store16 | O::I64Store16 => {
                self.b.ins().istore16(f, v, p, 0);
            }
            O::I32Store8 | O::I64Store8 => {
                self.b.ins().istore8(f, v, p, 0);
            }
            _ => return Err(CodegenError::Unsupported { pc, opcode: op }),
        }
        Ok(())
    }
}
