// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Stack-machine to register-form lowering.
//!
//! The operand stack is replaced by a symbolic stack of virtual registers. Every value-producing
//! operator gets a fresh register (never reused within a function); consumers pop register ids
//! and emit them as operands.
//!
//! Structured control is lowered to jumps on symbolic labels. A block result crosses an edge as
//! the jump's `yielded` register and is received by a `phi` placed right after the destination
//! label. Only one value can cross any edge.
//!
//! Code following an unconditional transfer (`br`, `br_table`, `return`, `unreachable`) is dead
//! until the enclosing block ends and is not emitted.

use crate::asm::Label;
use crate::bytecode::{Instruction, Op, Reg};
use crate::compiler::{CompileError, CompileErrorKind};
use crate::module::{Function, Module};
use crate::opcode::{OpClass, Opcode};
use crate::operator::{BlockType, Operator};

/// Symbolic operand stack limit per function.
const MAX_OPERAND_STACK: usize = 65_536;

/// A function lowered to register form, still addressed by virtual registers and labels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SsaFunction {
    pub(crate) code: Vec<Instruction<Label>>,
    pub(crate) num_vregs: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FrameKind {
    Function,
    Block,
    Loop,
    If { else_label: Label, has_else: bool },
}

#[derive(Copy, Clone, Debug)]
struct ControlFrame {
    kind: FrameKind,
    /// Where a branch to this frame lands: the loop header for loops, `end` otherwise.
    branch_label: Label,
    end: Label,
    result: BlockType,
    height: usize,
    /// Set once any edge other than fallthrough targets `end`.
    end_targeted: bool,
}

struct Lowering<'m> {
    module: &'m Module,
    num_locals: u32,
    code: Vec<Instruction<Label>>,
    stack: Vec<Reg>,
    controls: Vec<ControlFrame>,
    next_reg: u32,
    next_label: u32,
    unreachable: bool,
    dead_depth: u32,
    finished: bool,
}

/// Lowers the body of defined function `func` (an index in the function index space).
pub(crate) fn compile_function_body(
    module: &Module,
    func: u32,
    body: &Function,
) -> Result<SsaFunction, CompileError> {
    let err = |at: Option<usize>, kind| CompileError::Function { func, at, kind };
    let sig = module
        .types
        .get(body.type_idx as usize)
        .ok_or_else(|| err(None, CompileErrorKind::InvalidType(body.type_idx)))?;
    let result = match sig.results.as_slice() {
        [] => BlockType::Empty,
        [t] => BlockType::Value(*t),
        _ => return Err(err(None, CompileErrorKind::MultiValue)),
    };
    let num_params = u32::try_from(sig.params.len()).unwrap_or(u32::MAX);

    let mut l = Lowering {
        module,
        num_locals: num_params.saturating_add(body.num_declared_locals()),
        code: Vec::new(),
        stack: Vec::new(),
        controls: Vec::new(),
        next_reg: 0,
        next_label: 0,
        unreachable: false,
        dead_depth: 0,
        finished: false,
    };
    let end = l.new_label();
    l.controls.push(ControlFrame {
        kind: FrameKind::Function,
        branch_label: end,
        end,
        result,
        height: 0,
        end_targeted: false,
    });

    for (at, op) in body.body.iter().enumerate() {
        if l.finished {
            return Err(err(Some(at), CompileErrorKind::TrailingOperators));
        }
        l.lower(op).map_err(|kind| err(Some(at), kind))?;
    }
    if !l.finished {
        return Err(err(None, CompileErrorKind::UnexpectedEnd));
    }

    Ok(SsaFunction {
        code: l.code,
        num_vregs: l.next_reg,
    })
}

/// Builds the stub standing in for imported function `import`.
///
/// The stub invokes the host with the frame's locals (the call arguments) and returns its result.
#[must_use]
pub(crate) fn import_stub(import: u32, returns_value: bool) -> Vec<Instruction<Label>> {
    let result = Reg(0);
    let ret = if returns_value {
        Op::ReturnValue(result)
    } else {
        Op::ReturnVoid
    };
    vec![
        Instruction::with_target(result, Op::InvokeImport(import)),
        Instruction::effect(ret),
    ]
}

impl Lowering<'_> {
    fn new_reg(&mut self) -> Reg {
        let r = Reg(self.next_reg);
        self.next_reg += 1;
        r
    }

    fn new_label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    fn emit(&mut self, target: Option<Reg>, op: Op<Label>) {
        self.code.push(Instruction { target, op });
    }

    fn emit_value(&mut self, op: Op<Label>) -> Result<Reg, CompileErrorKind> {
        let r = self.new_reg();
        self.emit(Some(r), op);
        self.push(r)?;
        Ok(r)
    }

    fn push(&mut self, r: Reg) -> Result<(), CompileErrorKind> {
        if self.stack.len() >= MAX_OPERAND_STACK {
            return Err(CompileErrorKind::StackOverflow);
        }
        self.stack.push(r);
        Ok(())
    }

    fn frame_height(&self) -> usize {
        self.controls.last().map_or(0, |f| f.height)
    }

    fn pop(&mut self) -> Result<Reg, CompileErrorKind> {
        if self.stack.len() <= self.frame_height() {
            return Err(CompileErrorKind::StackUnderflow);
        }
        self.stack.pop().ok_or(CompileErrorKind::StackUnderflow)
    }

    fn peek(&self) -> Result<Reg, CompileErrorKind> {
        if self.stack.len() <= self.frame_height() {
            return Err(CompileErrorKind::StackUnderflow);
        }
        self.stack
            .last()
            .copied()
            .ok_or(CompileErrorKind::StackUnderflow)
    }

    fn pop_args(&mut self, n: usize) -> Result<Vec<Reg>, CompileErrorKind> {
        let mut args = vec![Reg(0); n];
        for slot in args.iter_mut().rev() {
            *slot = self.pop()?;
        }
        Ok(args)
    }

    /// Resolves a branch depth to its landing label and whether the edge carries a value.
    fn branch_target(&mut self, depth: u32) -> Result<(Label, bool), CompileErrorKind> {
        let idx = self
            .controls
            .len()
            .checked_sub(1 + depth as usize)
            .ok_or(CompileErrorKind::InvalidBranchDepth(depth))?;
        let frame = &mut self.controls[idx];
        if frame.kind == FrameKind::Loop {
            return Ok((frame.branch_label, false));
        }
        frame.end_targeted = true;
        Ok((frame.end, frame.result.arity() == 1))
    }

    fn carried(&self, carries: bool) -> Result<Option<Reg>, CompileErrorKind> {
        if carries {
            self.peek().map(Some)
        } else {
            Ok(None)
        }
    }

    fn check_local(&self, idx: u32) -> Result<(), CompileErrorKind> {
        if idx < self.num_locals {
            Ok(())
        } else {
            Err(CompileErrorKind::InvalidLocal(idx))
        }
    }

    fn check_class(op: Opcode, class: OpClass) -> Result<(), CompileErrorKind> {
        if op.class() == class {
            Ok(())
        } else {
            Err(CompileErrorKind::OperatorClass(op))
        }
    }

    fn lower(&mut self, op: &Operator) -> Result<(), CompileErrorKind> {
        if self.unreachable {
            match op {
                Operator::Block(_) | Operator::Loop(_) | Operator::If(_) => {
                    self.dead_depth += 1;
                    return Ok(());
                }
                Operator::End if self.dead_depth > 0 => {
                    self.dead_depth -= 1;
                    return Ok(());
                }
                Operator::Else | Operator::End if self.dead_depth == 0 => {}
                _ => return Ok(()),
            }
        }

        match op {
            Operator::Nop => {}
            Operator::Unreachable => {
                self.emit(None, Op::Unreachable);
                self.unreachable = true;
            }
            Operator::Block(bt) => {
                let end = self.new_label();
                self.controls.push(ControlFrame {
                    kind: FrameKind::Block,
                    branch_label: end,
                    end,
                    result: *bt,
                    height: self.stack.len(),
                    end_targeted: false,
                });
            }
            Operator::Loop(bt) => {
                let header = self.new_label();
                let end = self.new_label();
                self.emit(None, Op::Place(header));
                self.controls.push(ControlFrame {
                    kind: FrameKind::Loop,
                    branch_label: header,
                    end,
                    result: *bt,
                    height: self.stack.len(),
                    end_targeted: false,
                });
            }
            Operator::If(bt) => {
                let cond = self.pop()?;
                let then_label = self.new_label();
                let else_label = self.new_label();
                let end = self.new_label();
                self.emit(
                    None,
                    Op::JmpIf {
                        target: then_label,
                        cond,
                        yielded: None,
                    },
                );
                self.emit(
                    None,
                    Op::Jmp {
                        target: else_label,
                        yielded: None,
                    },
                );
                self.emit(None, Op::Place(then_label));
                self.controls.push(ControlFrame {
                    kind: FrameKind::If {
                        else_label,
                        has_else: false,
                    },
                    branch_label: end,
                    end,
                    result: *bt,
                    height: self.stack.len(),
                    end_targeted: false,
                });
            }
            Operator::Else => self.lower_else()?,
            Operator::End => self.lower_end()?,
            Operator::Br(depth) => {
                let (target, carries) = self.branch_target(*depth)?;
                let yielded = self.carried(carries)?;
                self.emit(None, Op::Jmp { target, yielded });
                self.unreachable = true;
            }
            Operator::BrIf(depth) => {
                let cond = self.pop()?;
                let (target, carries) = self.branch_target(*depth)?;
                let yielded = self.carried(carries)?;
                self.emit(
                    None,
                    Op::JmpIf {
                        target,
                        cond,
                        yielded,
                    },
                );
            }
            Operator::BrTable { targets, default } => {
                let cond = self.pop()?;
                let (default, carries) = self.branch_target(*default)?;
                let mut labels = Vec::with_capacity(targets.len());
                for depth in targets {
                    let (label, c) = self.branch_target(*depth)?;
                    if c != carries {
                        return Err(CompileErrorKind::BranchArityMismatch);
                    }
                    labels.push(label);
                }
                let yielded = self.carried(carries)?;
                self.emit(
                    None,
                    Op::JmpTable {
                        targets: labels,
                        default,
                        cond,
                        yielded,
                    },
                );
                self.unreachable = true;
            }
            Operator::Return => {
                let returns_value = self
                    .controls
                    .first()
                    .is_some_and(|f| f.result.arity() == 1);
                if returns_value {
                    let v = self.pop()?;
                    self.emit(None, Op::ReturnValue(v));
                } else {
                    self.emit(None, Op::ReturnVoid);
                }
                self.unreachable = true;
            }
            Operator::Call(func) => {
                let ty = self
                    .module
                    .function_type(*func)
                    .ok_or(CompileErrorKind::InvalidFunction(*func))?;
                let (n_params, n_results) = (ty.params.len(), ty.results.len());
                if n_results > 1 {
                    return Err(CompileErrorKind::MultiValue);
                }
                let args = self.pop_args(n_params)?;
                let op = Op::Call { func: *func, args };
                if n_results == 1 {
                    self.emit_value(op)?;
                } else {
                    self.emit(None, op);
                }
            }
            Operator::CallIndirect(type_idx) => {
                let ty = self
                    .module
                    .types
                    .get(*type_idx as usize)
                    .ok_or(CompileErrorKind::InvalidType(*type_idx))?;
                let (n_params, n_results) = (ty.params.len(), ty.results.len());
                if n_results > 1 {
                    return Err(CompileErrorKind::MultiValue);
                }
                let table_index = self.pop()?;
                let args = self.pop_args(n_params)?;
                let op = Op::CallIndirect {
                    type_idx: *type_idx,
                    args,
                    table_index,
                };
                if n_results == 1 {
                    self.emit_value(op)?;
                } else {
                    self.emit(None, op);
                }
            }
            Operator::Drop => {
                self.pop()?;
            }
            Operator::Select => {
                let cond = self.pop()?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.emit_value(Op::Select { a, b, cond })?;
            }
            Operator::GetLocal(idx) => {
                self.check_local(*idx)?;
                self.emit_value(Op::GetLocal(*idx))?;
            }
            Operator::SetLocal(idx) => {
                self.check_local(*idx)?;
                let value = self.pop()?;
                self.emit(None, Op::SetLocal { local: *idx, value });
            }
            Operator::TeeLocal(idx) => {
                self.check_local(*idx)?;
                let value = self.peek()?;
                self.emit(None, Op::SetLocal { local: *idx, value });
            }
            Operator::GetGlobal(idx) => {
                if self.module.global_type(*idx).is_none() {
                    return Err(CompileErrorKind::InvalidGlobal(*idx));
                }
                self.emit_value(Op::GetGlobal(*idx))?;
            }
            Operator::SetGlobal(idx) => {
                match self.module.global_type(*idx) {
                    None => return Err(CompileErrorKind::InvalidGlobal(*idx)),
                    Some((_, false)) => return Err(CompileErrorKind::ImmutableGlobal(*idx)),
                    Some((_, true)) => {}
                }
                let value = self.pop()?;
                self.emit(
                    None,
                    Op::SetGlobal {
                        global: *idx,
                        value,
                    },
                );
            }
            Operator::Load(op, memarg) => {
                Self::check_class(*op, OpClass::Load)?;
                let base = self.pop()?;
                self.emit_value(Op::Load {
                    op: *op,
                    align: memarg.align,
                    offset: memarg.offset,
                    base,
                })?;
            }
            Operator::Store(op, memarg) => {
                Self::check_class(*op, OpClass::Store)?;
                let value = self.pop()?;
                let base = self.pop()?;
                self.emit(
                    None,
                    Op::Store {
                        op: *op,
                        align: memarg.align,
                        offset: memarg.offset,
                        base,
                        value,
                    },
                );
            }
            Operator::CurrentMemory => {
                self.emit_value(Op::CurrentMemory)?;
            }
            Operator::GrowMemory => {
                let pages = self.pop()?;
                self.emit_value(Op::GrowMemory(pages))?;
            }
            Operator::I32Const(v) => {
                self.emit_value(Op::Const {
                    op: Opcode::I32Const,
                    bits: u64::from(v.cast_unsigned()),
                })?;
            }
            Operator::I64Const(v) => {
                self.emit_value(Op::Const {
                    op: Opcode::I64Const,
                    bits: v.cast_unsigned(),
                })?;
            }
            Operator::F32Const(bits) => {
                self.emit_value(Op::Const {
                    op: Opcode::F32Const,
                    bits: u64::from(*bits),
                })?;
            }
            Operator::F64Const(bits) => {
                self.emit_value(Op::Const {
                    op: Opcode::F64Const,
                    bits: *bits,
                })?;
            }
            Operator::Unary(op) => {
                Self::check_class(*op, OpClass::Unary)?;
                let a = self.pop()?;
                self.emit_value(Op::Unary { op: *op, a })?;
            }
            Operator::Binary(op) => {
                Self::check_class(*op, OpClass::Binary)?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.emit_value(Op::Binary { op: *op, a, b })?;
            }
        }
        Ok(())
    }

    fn lower_else(&mut self) -> Result<(), CompileErrorKind> {
        let Some(frame) = self.controls.last().copied() else {
            return Err(CompileErrorKind::MalformedControl);
        };
        let FrameKind::If {
            else_label,
            has_else: false,
        } = frame.kind
        else {
            return Err(CompileErrorKind::MalformedControl);
        };

        if !self.unreachable {
            let yielded = self.fallthrough_value(&frame)?;
            self.emit(
                None,
                Op::Jmp {
                    target: frame.end,
                    yielded,
                },
            );
            if let Some(f) = self.controls.last_mut() {
                f.end_targeted = true;
            }
        }
        self.stack.truncate(frame.height);
        self.emit(None, Op::Place(else_label));
        if let Some(f) = self.controls.last_mut() {
            f.kind = FrameKind::If {
                else_label,
                has_else: true,
            };
        }
        self.unreachable = false;
        Ok(())
    }

    /// Pops the value falling out of `frame` and checks the stack is balanced.
    fn fallthrough_value(&mut self, frame: &ControlFrame) -> Result<Option<Reg>, CompileErrorKind> {
        let value = if frame.result.arity() == 1 {
            Some(self.pop()?)
        } else {
            None
        };
        if self.stack.len() != frame.height {
            return Err(CompileErrorKind::StackImbalance {
                expected: frame.height,
                actual: self.stack.len(),
            });
        }
        Ok(value)
    }

    fn lower_end(&mut self) -> Result<(), CompileErrorKind> {
        let Some(frame) = self.controls.last().copied() else {
            return Err(CompileErrorKind::MalformedControl);
        };
        let falls_through = !self.unreachable;
        let value = if falls_through {
            self.fallthrough_value(&frame)?
        } else {
            None
        };
        self.stack.truncate(frame.height);
        self.controls.pop();

        match frame.kind {
            FrameKind::Function => {
                if frame.end_targeted {
                    if value.is_some() {
                        self.emit(
                            None,
                            Op::Jmp {
                                target: frame.end,
                                yielded: value,
                            },
                        );
                    }
                    self.emit(None, Op::Place(frame.end));
                    if frame.result.arity() == 1 {
                        let r = self.new_reg();
                        self.emit(Some(r), Op::Phi);
                        self.emit(None, Op::ReturnValue(r));
                    } else {
                        self.emit(None, Op::ReturnVoid);
                    }
                } else if falls_through {
                    match value {
                        Some(r) => self.emit(None, Op::ReturnValue(r)),
                        None => self.emit(None, Op::ReturnVoid),
                    }
                }
                self.finished = true;
            }
            FrameKind::Loop => {
                // Branches target the header, so only fallthrough reaches the end.
                if let Some(r) = value {
                    self.push(r)?;
                }
            }
            FrameKind::Block | FrameKind::If { .. } => {
                let mut reached = frame.end_targeted || falls_through;
                if value.is_some() {
                    self.emit(
                        None,
                        Op::Jmp {
                            target: frame.end,
                            yielded: value,
                        },
                    );
                }
                if let FrameKind::If {
                    else_label,
                    has_else: false,
                } = frame.kind
                {
                    if frame.result.arity() == 1 {
                        return Err(CompileErrorKind::MissingElse);
                    }
                    // The implicit empty else arm falls straight into the end.
                    self.emit(None, Op::Place(else_label));
                    reached = true;
                }
                if reached {
                    self.emit(None, Op::Place(frame.end));
                    if frame.result.arity() == 1 {
                        let r = self.new_reg();
                        self.emit(Some(r), Op::Phi);
                        self.push(r)?;
                    }
                }
                self.unreachable = !reached;
            }
        }
        Ok(())
    }
}
