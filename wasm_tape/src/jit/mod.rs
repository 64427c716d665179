// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Native execution of register bytecode.
//!
//! A [`NativeRoutine`] is the Cranelift translation of one function's register bytecode. It runs
//! over the same frame as the interpreter (registers, locals, globals, memory and the yielded
//! slot) and stops at every operation that needs the VM: calls, host imports, gas charges and
//! memory growth. The VM interprets that one instruction and re-enters the routine at the
//! returned continuation.
//!
//! Functions using floating-point arithmetic are not translated; they always run interpreted.

use core::fmt;

use crate::format::DecodeError;
use crate::opcode::Opcode;
use crate::vm::Trap;

#[cfg(feature = "jit")]
mod codegen;

/// Errors from native code generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodegenError {
    /// The crate was built without the `jit` feature.
    Unavailable,
    /// The bytecode does not decode.
    Decode(DecodeError),
    /// The function uses an operation the native backend does not implement.
    Unsupported {
        /// Byte offset of the instruction.
        pc: u32,
        /// Its opcode.
        opcode: Opcode,
    },
    /// A register outside the frame.
    RegisterOutOfRange {
        /// Byte offset of the instruction.
        pc: u32,
        /// Register index.
        reg: u32,
    },
    /// A local outside the frame.
    LocalOutOfRange {
        /// Byte offset of the instruction.
        pc: u32,
        /// Local index.
        local: u32,
    },
    /// A global outside the module.
    GlobalOutOfRange {
        /// Byte offset of the instruction.
        pc: u32,
        /// Global index.
        global: u32,
    },
    /// A jump to an offset that is not an instruction boundary.
    InvalidJumpTarget {
        /// Byte offset of the jump.
        pc: u32,
        /// The offending target.
        target: u32,
    },
    /// Cranelift rejected the function.
    Backend(String),
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => f.write_str("native code generation is not compiled in"),
            Self::Decode(e) => write!(f, "bytecode does not decode: {e}"),
            Self::Unsupported { pc, opcode } => {
                write!(f, "{} at {pc} has no native lowering", opcode.name())
            }
            Self::RegisterOutOfRange { pc, reg } => {
                write!(f, "register r{reg} out of range at {pc}")
            }
            Self::LocalOutOfRange { pc, local } => write!(f, "local {local} out of range at {pc}"),
            Self::GlobalOutOfRange { pc, global } => {
                write!(f, "global {global} out of range at {pc}")
            }
            Self::InvalidJumpTarget { pc, target } => {
                write!(
                    f,
                    "jump at {pc} targets {target}, which is not an instruction"
                )
            }
            Self::Backend(msg) => write!(f, "code generator: {msg}"),
        }
    }
}

impl core::error::Error for CodegenError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

/// How a native routine stopped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NativeExit {
    /// The function returned; the value is meaningful only for functions with a result.
    Done(i64),
    /// The function trapped at byte offset `pc`.
    Trapped {
        /// Trap kind.
        trap: Trap,
        /// Byte offset of the trapping instruction.
        pc: u32,
    },
    /// The instruction at `pc` needs the VM. Re-enter at `continuation` once it has run.
    Pending {
        /// Resume point, always non-zero.
        continuation: u32,
        /// Byte offset of the instruction to interpret.
        pc: u32,
    },
}

/// The frame a routine runs over.
#[derive(Debug)]
pub struct NativeFrame<'a> {
    /// Register cells.
    pub regs: &'a mut [i64],
    /// Parameters then declared locals.
    pub locals: &'a mut [i64],
    /// Module globals.
    pub globals: &'a mut [i64],
    /// Linear memory.
    pub memory: &'a mut [u8],
    /// Value carried along the last taken edge.
    pub yielded: &'a mut i64,
}

#[cfg(feature = "jit")]
pub use native::NativeRoutine;
#[cfg(feature = "jit")]
pub(crate) use native::NativeSlot;

#[cfg(feature = "jit")]
mod native {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, OnceLock};

    use cranelift_codegen::ir::{AbiParam, types};
    use cranelift_codegen::settings::{self, Configurable};
    use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
    use cranelift_jit::{JITBuilder, JITModule};
    use cranelift_module::{Linkage, Module};

    use super::codegen::{self, DONE, FrameShape};
    use super::{CodegenError, NativeExit, NativeFrame};
    use crate::compiler::InterpreterCode;
    use crate::vm::Trap;

    type Entry = unsafe extern "C" fn(
        *mut i64,
        *mut i64,
        *mut i64,
        *mut u8,
        u64,
        *mut i64,
        i32,
        *mut i64,
    ) -> i32;

    fn backend(e: impl core::fmt::Display) -> CodegenError {
        CodegenError::Backend(e.to_string())
    }

    /// A compiled native routine for one function.
    pub struct NativeRoutine {
        module: Option<JITModule>,
        entry: Entry,
        shape: FrameShape,
        continuations: u32,
    }

    // SAFETY: the module is only touched again by `Drop`, and the finalized code it owns is
    // immutable and reentrant: all state lives in the frame passed to each call.
    unsafe impl Send for NativeRoutine {}
    // SAFETY: see above; `execute` takes `&self` and never mutates the module.
    unsafe impl Sync for NativeRoutine {}

    impl core::fmt::Debug for NativeRoutine {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.debug_struct("NativeRoutine")
                .field("shape", &self.shape)
                .field("continuations", &self.continuations)
                .finish_non_exhaustive()
        }
    }

    impl Drop for NativeRoutine {
        fn drop(&mut self) {
            if let Some(module) = self.module.take() {
                // SAFETY: `entry` is only reachable through `self`, which is going away.
                unsafe { module.free_memory() };
            }
        }
    }

    impl NativeRoutine {
        /// Translates `code` for a module with `num_globals` globals.
        pub fn compile(code: &InterpreterCode, num_globals: u32) -> Result<Self, CodegenError> {
            let mut flags = settings::builder();
            flags.set("opt_level", "speed").map_err(backend)?;
            let isa_builder = cranelift_native::builder().map_err(backend)?;
            let isa = isa_builder
                .finish(settings::Flags::new(flags))
                .map_err(backend)?;
            let mut module = JITModule::new(JITBuilder::with_isa(
                isa,
                cranelift_module::default_libcall_names(),
            ));

            let ptr = module.target_config().pointer_type();
            if ptr != types::I64 {
                return Err(CodegenError::Backend(format!("unsupported pointer width {ptr}")));
            }
            let mut sig = module.make_signature();
            for ty in [ptr, ptr, ptr, ptr, types::I64, ptr, types::I32, ptr] {
                sig.params.push(AbiParam::new(ty));
            }
            sig.returns.push(AbiParam::new(types::I32));

            let id = module
                .declare_function("routine", Linkage::Export, &sig)
                .map_err(backend)?;
            let mut ctx = module.make_context();
            ctx.func.signature = sig;

            let shape = FrameShape {
                num_regs: code.num_regs,
                num_locals: code.num_locals,
                num_globals,
            };
            let mut fctx = FunctionBuilderContext::new();
            let builder = FunctionBuilder::new(&mut ctx.func, &mut fctx);
            let continuations = codegen::translate(builder, &code.bytes, shape)?;

            module.define_function(id, &mut ctx).map_err(backend)?;
            module.clear_context(&mut ctx);
            module.finalize_definitions().map_err(backend)?;
            let raw = module.get_finalized_function(id);
            // SAFETY: `raw` points at a finalized function built with exactly this signature
            // under the platform's default calling convention.
            let entry = unsafe { core::mem::transmute::<*const u8, Entry>(raw) };

            Ok(Self {
                module: Some(module),
                entry,
                shape,
                continuations,
            })
        }

        /// Number of resume points (hand-off instructions) in the routine.
        #[must_use]
        pub fn continuations(&self) -> u32 {
            self.continuations
        }

        /// Runs the routine from `continuation` (0 for the function start).
        ///
        /// Frames whose shape does not match the compiled one trap with
        /// [`Trap::InvalidExecution`] without running any code.
        pub fn execute(&self, frame: NativeFrame<'_>, continuation: u32) -> NativeExit {
            let shape = self.shape;
            if frame.regs.len() != shape.num_regs as usize
                || frame.locals.len() != shape.num_locals as usize
                || frame.globals.len() != shape.num_globals as usize
                || continuation > self.continuations
            {
                return NativeExit::Trapped {
                    trap: Trap::InvalidExecution,
                    pc: 0,
                };
            }
            let Ok(continuation) = i32::try_from(continuation) else {
                return NativeExit::Trapped {
                    trap: Trap::InvalidExecution,
                    pc: 0,
                };
            };

            let mut ret = 0_i64;
            // SAFETY: every pointer comes from a live exclusive borrow whose length matches the
            // frame shape the routine was translated against; memory accesses are bounds
            // checked against `memory.len()` inside the routine.
            let code = unsafe {
                (self.entry)(
                    frame.regs.as_mut_ptr(),
                    frame.locals.as_mut_ptr(),
                    frame.globals.as_mut_ptr(),
                    frame.memory.as_mut_ptr(),
                    frame.memory.len() as u64,
                    frame.yielded,
                    continuation,
                    &mut ret,
                )
            };

            let pc = u32::try_from(ret).unwrap_or(u32::MAX);
            match code {
                DONE => NativeExit::Done(ret),
                k if k > 0 => NativeExit::Pending {
                    continuation: k.unsigned_abs(),
                    pc,
                },
                other => NativeExit::Trapped {
                    trap: Trap::from_code(other).unwrap_or(Trap::InvalidExecution),
                    pc,
                },
            }
        }
    }

    /// Lazily attached native code for one function.
    #[derive(Default)]
    pub(crate) struct NativeSlot {
        routine: OnceLock<Arc<NativeRoutine>>,
        attempted: AtomicBool,
    }

    impl NativeSlot {
        pub(crate) fn get(&self) -> Option<&Arc<NativeRoutine>> {
            self.routine.get()
        }

        /// Returns `true` exactly once: for the first caller that should compile this function.
        pub(crate) fn try_claim(&self) -> bool {
            !self.attempted.swap(true, Ordering::AcqRel)
        }

        pub(crate) fn attach(&self, routine: Arc<NativeRoutine>) {
            self.attempted.store(true, Ordering::Release);
            let _ = self.routine.set(routine);
        }
    }

    impl core::fmt::Debug for NativeSlot {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.debug_struct("NativeSlot")
                .field("attached", &self.routine.get().is_some())
                .finish()
        }
    }
}

#[cfg(all(test, feature = "jit"))]
mod tests {
    use super::*;
    use crate::asm::Asm;
    use crate::bytecode::{Instruction, Op, Reg};
    use crate::compiler::InterpreterCode;

    fn code(regs: u32, params: u32, insts: &[Instruction<crate::asm::Label>]) -> InterpreterCode {
        let mut a = Asm::new();
        a.extend(insts);
        InterpreterCode::new(regs, params, params, 1, a.finish().unwrap())
    }

    struct Frame {
        regs: Vec<i64>,
        locals: Vec<i64>,
        globals: Vec<i64>,
        memory: Vec<u8>,
        yielded: i64,
    }

    impl Frame {
        fn new(regs: u32, locals: &[i64]) -> Self {
            Self {
                regs: vec![0; regs as usize],
                locals: locals.to_vec(),
                globals: Vec::new(),
                memory: vec![0; 16],
                yielded: 0,
            }
        }

        fn run(&mut self, r: &NativeRoutine, k: u32) -> NativeExit {
            r.execute(
                NativeFrame {
                    regs: &mut self.regs,
                    locals: &mut self.locals,
                    globals: &mut self.globals,
                    memory: &mut self.memory,
                    yielded: &mut self.yielded,
                },
                k,
            )
        }
    }

    fn add_code() -> InterpreterCode {
        code(
            2,
            2,
            &[
                Instruction::with_target(Reg(0), Op::GetLocal(0)),
                Instruction::with_target(Reg(1), Op::GetLocal(1)),
                Instruction::with_target(
                    Reg(0),
                    Op::Binary {
                        op: Opcode::I32Add,
                        a: Reg(0),
                        b: Reg(1),
                    },
                ),
                Instruction::effect(Op::ReturnValue(Reg(0))),
            ],
        )
    }

    #[test]
    fn adds_natively() {
        let r = NativeRoutine::compile(&add_code(), 0).unwrap();
        let mut f = Frame::new(2, &[2, 3]);
        assert_eq!(f.run(&r, 0), NativeExit::Done(5));
        let mut f = Frame::new(2, &[0xFFFF_FFFF, 2]);
        assert_eq!(f.run(&r, 0), NativeExit::Done(1));
    }

    #[test]
    fn mismatched_frame_is_rejected() {
        let r = NativeRoutine::compile(&add_code(), 0).unwrap();
        let mut f = Frame::new(1, &[2, 3]);
        assert_eq!(
            f.run(&r, 0),
            NativeExit::Trapped {
                trap: Trap::InvalidExecution,
                pc: 0
            }
        );
    }

    #[test]
    fn division_by_zero_traps_with_pc() {
        let c = code(
            2,
            2,
            &[
                Instruction::with_target(Reg(0), Op::GetLocal(0)),
                Instruction::with_target(Reg(1), Op::GetLocal(1)),
                Instruction::with_target(
                    Reg(0),
                    Op::Binary {
                        op: Opcode::I32DivS,
                        a: Reg(0),
                        b: Reg(1),
                    },
                ),
                Instruction::effect(Op::ReturnValue(Reg(0))),
            ],
        );
        let r = NativeRoutine::compile(&c, 0).unwrap();
        let div_pc = crate::bytecode::decode_instructions(&c.bytes).unwrap()[2].offset;
        let mut f = Frame::new(2, &[7, 0]);
        assert_eq!(
            f.run(&r, 0),
            NativeExit::Trapped {
                trap: Trap::Arithmetic,
                pc: div_pc
            }
        );
        let mut f = Frame::new(2, &[0x8000_0000, 0xFFFF_FFFF]);
        assert!(matches!(
            f.run(&r, 0),
            NativeExit::Trapped {
                trap: Trap::Arithmetic,
                ..
            }
        ));
    }

    #[test]
    fn handoff_suspends_and_resumes() {
        let c = code(
            1,
            0,
            &[
                Instruction::effect(Op::AddGas(3)),
                Instruction::with_target(
                    Reg(0),
                    Op::Const {
                        op: Opcode::I32Const,
                        bits: 9,
                    },
                ),
                Instruction::effect(Op::ReturnValue(Reg(0))),
            ],
        );
        let r = NativeRoutine::compile(&c, 0).unwrap();
        assert_eq!(r.continuations(), 1);
        let mut f = Frame::new(1, &[]);
        assert_eq!(
            f.run(&r, 0),
            NativeExit::Pending {
                continuation: 1,
                pc: 0
            }
        );
        assert_eq!(f.run(&r, 1), NativeExit::Done(9));
    }

    #[test]
    fn out_of_bounds_store_traps() {
        let c = code(
            2,
            0,
            &[
                Instruction::with_target(
                    Reg(0),
                    Op::Const {
                        op: Opcode::I32Const,
                        bits: 13,
                    },
                ),
                Instruction::effect(Op::Store {
                    op: Opcode::I32Store,
                    align: 2,
                    offset: 0,
                    base: Reg(0),
                    value: Reg(0),
                }),
                Instruction::effect(Op::ReturnValue(Reg(0))),
            ],
        );
        let r = NativeRoutine::compile(&c, 0).unwrap();
        let mut f = Frame::new(2, &[]);
        assert!(matches!(
            f.run(&r, 0),
            NativeExit::Trapped {
                trap: Trap::MemoryOutOfBounds,
                ..
            }
        ));
        assert_eq!(f.memory, vec![0; 16]);
    }

    #[test]
    fn float_arithmetic_is_not_translated() {
        let c = code(
            1,
            0,
            &[
                Instruction::with_target(
                    Reg(0),
                    Op::Unary {
                        op: Opcode::F64Sqrt,
                        a: Reg(0),
                    },
                ),
                Instruction::effect(Op::ReturnValue(Reg(0))),
            ],
        );
        assert!(matches!(
            NativeRoutine::compile(&c, 0),
            Err(CodegenError::Unsupported {
                opcode: Opcode::F64Sqrt,
                ..
            })
        ));
    }

    #[test]
    fn slot_is_claimed_once() {
        let slot = NativeSlot::default();
        assert!(slot.try_claim());
        assert!(!slot.try_claim());
        assert!(slot.get().is_none());
    }
}
