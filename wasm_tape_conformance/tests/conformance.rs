// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end behavior of the compiler, the interpreter and the native path.
//!
//! Run with:
//! `cargo test -p wasm_tape_conformance`

#![allow(missing_docs, reason = "integration tests")]

use std::sync::Arc;

use proptest::prelude::*;

use wasm_tape::asm::Asm;
use wasm_tape::bytecode::{Instruction, Op, Reg};
use wasm_tape::compiler::{
    CompileConfig, CompileError, CompileErrorKind, CompiledModule, FloatPolicy, InterpreterCode,
    SimpleCostPolicy, compile_module,
};
use wasm_tape::host::{HostRegistry, NoImports};
use wasm_tape::jit::CodegenError;
use wasm_tape::module::{ConstExpr, Module, ModuleBuilder, ValueType};
use wasm_tape::opcode::Opcode;
use wasm_tape::operator::{BlockType, MemArg, Operator as O};
use wasm_tape::trace::{TraceMask, TraceSink};
use wasm_tape::vm::{FaultKind, RunError, Trap, VirtualMachine, VmConfig};

const I32: ValueType = ValueType::I32;
const I64: ValueType = ValueType::I64;

fn vm(module: Module) -> VirtualMachine {
    vm_with(module, VmConfig::default(), &CompileConfig::default())
}

fn vm_with(module: Module, config: VmConfig, compile: &CompileConfig) -> VirtualMachine {
    VirtualMachine::new(Arc::new(module), config, compile, Box::new(NoImports)).unwrap()
}

/// Instance whose every defined function runs natively.
fn native_vm(module: Module) -> VirtualMachine {
    let vm = vm(module);
    let first = vm.module().num_imported_functions();
    for func in first..vm.module().num_functions() {
        vm.compile_native(func).unwrap();
    }
    vm
}

#[derive(Default)]
struct NativeCounter {
    enters: usize,
    exits: Vec<i32>,
    instrs: usize,
}

impl TraceSink for NativeCounter {
    fn mask(&self) -> TraceMask {
        TraceMask::NATIVE | TraceMask::INSTR
    }

    fn instr(&mut self, _func: u32, _pc: u32, _opcode: Opcode) {
        self.instrs += 1;
    }

    fn native_enter(&mut self, _func: u32, _continuation: u32) {
        self.enters += 1;
    }

    fn native_exit(&mut self, _func: u32, code: i32) {
        self.exits.push(code);
    }
}

fn add_module() -> (Module, u32) {
    let mut b = ModuleBuilder::new();
    let add = b.function(
        &[I32, I32],
        &[I32],
        &[],
        vec![
            O::GetLocal(0),
            O::GetLocal(1),
            O::Binary(Opcode::I32Add),
            O::End,
        ],
    );
    b.export_function("add", add);
    (b.build(), add)
}

/// `countdown(n)` loops `n` times and returns nothing.
fn countdown_module() -> (Module, u32) {
    let mut b = ModuleBuilder::new();
    let f = b.function(
        &[I32],
        &[],
        &[],
        vec![
            O::Block(BlockType::Empty),
            O::Loop(BlockType::Empty),
            O::GetLocal(0),
            O::Unary(Opcode::I32Eqz),
            O::BrIf(1),
            O::GetLocal(0),
            O::I32Const(1),
            O::Binary(Opcode::I32Sub),
            O::SetLocal(0),
            O::Br(0),
            O::End,
            O::End,
            O::End,
        ],
    );
    (b.build(), f)
}

#[test]
fn add_on_both_paths() {
    let (module, add) = add_module();
    let mut interp = vm(module.clone());
    assert_eq!(interp.run(add, &[2, 3]).unwrap(), Some(5));

    let mut native = native_vm(module);
    let mut sink = NativeCounter::default();
    assert_eq!(native.run_traced(add, &[2, 3], &mut sink).unwrap(), Some(5));
    assert_eq!(sink.enters, 1);
    assert_eq!(sink.exits, vec![-1]);
    assert_eq!(sink.instrs, 0, "nothing was interpreted");
}

#[test]
fn i32_addition_wraps() {
    let (module, add) = add_module();
    let mut native = native_vm(module.clone());
    let mut interp = vm(module);
    for vm in [&mut interp, &mut native] {
        assert_eq!(vm.run(add, &[0xFFFF_FFFF, 2]).unwrap(), Some(1));
    }
}

#[test]
fn traps_agree_between_paths() {
    let mut b = ModuleBuilder::new();
    let div = b.function(
        &[I32, I32],
        &[I32],
        &[],
        vec![
            O::GetLocal(0),
            O::GetLocal(1),
            O::Binary(Opcode::I32DivS),
            O::End,
        ],
    );
    let unreachable = b.function(&[], &[], &[], vec![O::Unreachable, O::End]);
    let module = b.build();

    let mut interp = vm(module.clone());
    let mut native = native_vm(module);
    for vm in [&mut interp, &mut native] {
        let err = vm.run(div, &[7, 0]).unwrap_err();
        assert_eq!(err.trap(), Some(Trap::Arithmetic));
        let err = vm.run(div, &[0x8000_0000, 0xFFFF_FFFF]).unwrap_err();
        assert_eq!(err.trap(), Some(Trap::Arithmetic));
        assert_eq!(vm.run(div, &[0xFFFF_FFF9, 2]).unwrap(), Some(0xFFFF_FFFD));

        let err = vm.run(unreachable, &[]).unwrap_err();
        assert_eq!(err.trap(), Some(Trap::Unreachable));
        assert_eq!(vm.last_backtrace().first().map(|f| f.0), Some(unreachable));
    }
}

#[test]
fn trap_locations_match_between_paths() {
    let mut b = ModuleBuilder::new();
    let f = b.function(
        &[I32],
        &[I32],
        &[],
        vec![
            O::I32Const(100),
            O::GetLocal(0),
            O::Binary(Opcode::I32RemU),
            O::End,
        ],
    );
    let module = b.build();
    let interp_err = vm(module.clone()).run(f, &[0]).unwrap_err();
    let native_err = native_vm(module).run(f, &[0]).unwrap_err();
    assert_eq!(interp_err.location(), native_err.location());
}

#[test]
fn compilation_is_independent_of_parallelism() {
    let mut b = ModuleBuilder::new();
    let mut prev = None;
    for i in 0..24_i32 {
        let mut body = vec![O::GetLocal(0), O::I32Const(i), O::Binary(Opcode::I32Add)];
        if let Some(p) = prev {
            body.push(O::Call(p));
        }
        body.push(O::End);
        prev = Some(b.function(&[I32], &[I32], &[], body));
    }
    let module = b.build();

    let serial = compile_module(&module, &CompileConfig::default().with_parallelism(1)).unwrap();
    for workers in [2, 4, 8] {
        let parallel =
            compile_module(&module, &CompileConfig::default().with_parallelism(workers)).unwrap();
        assert_eq!(serial, parallel, "{workers} workers");
    }
}

#[test]
fn first_failing_function_is_reported() {
    let mut b = ModuleBuilder::new();
    for _ in 0..6 {
        b.function(&[], &[I32], &[], vec![O::I32Const(1), O::End]);
    }
    let bad = b.function(&[], &[], &[], vec![O::Binary(Opcode::I32Add), O::End]);
    b.function(&[], &[], &[], vec![O::Drop, O::End]);
    let module = b.build();

    let err = compile_module(&module, &CompileConfig::default().with_parallelism(4)).unwrap_err();
    let CompileError::Function { func, kind, .. } = &err else {
        panic!("unexpected error {err:?}");
    };
    assert_eq!(*func, bad);
    assert_eq!(*kind, CompileErrorKind::StackUnderflow);
}

#[test]
fn gas_budget_is_exact() {
    let (module, f) = countdown_module();
    let metered = CompileConfig::default().with_cost_policy(SimpleCostPolicy::default());
    let unlimited = VmConfig {
        gas_limit: Some(u64::MAX),
        ..VmConfig::default()
    };

    let mut meter = vm_with(module.clone(), unlimited, &metered);
    meter.run(f, &[10]).unwrap();
    let needed = meter.gas_used();
    assert!(needed > 0);
    meter.reset_gas();
    meter.run(f, &[20]).unwrap();
    assert!(meter.gas_used() > needed);

    let exact = VmConfig {
        gas_limit: Some(needed),
        ..VmConfig::default()
    };
    let mut ok = vm_with(module.clone(), exact, &metered);
    ok.run(f, &[10]).unwrap();
    assert_eq!(ok.gas_used(), needed);

    let short = VmConfig {
        gas_limit: Some(needed - 1),
        ..VmConfig::default()
    };
    let mut starved = vm_with(module, short, &metered);
    let err = starved.run(f, &[10]).unwrap_err();
    assert_eq!(err.trap(), Some(Trap::GasExhausted));
    assert!(starved.gas_used() < needed);
}

#[test]
fn native_path_charges_the_same_gas() {
    let (module, f) = countdown_module();
    let metered = CompileConfig::default().with_cost_policy(SimpleCostPolicy::default());

    let mut interp = vm_with(module.clone(), VmConfig::default(), &metered);
    interp.run(f, &[25]).unwrap();

    let mut native = vm_with(module, VmConfig::default(), &metered);
    native.compile_native(f).unwrap();
    let mut sink = NativeCounter::default();
    native.run_traced(f, &[25], &mut sink).unwrap();

    assert_eq!(native.gas_used(), interp.gas_used());
    assert!(sink.enters > 1, "gas charges suspend the routine");
    assert!(sink.exits.iter().all(|&code| code == -1 || code > 0));
}

#[test]
fn unmetered_code_has_no_gas_instructions() {
    let (module, f) = countdown_module();
    let mut plain = vm(module);
    plain.run(f, &[5]).unwrap();
    assert_eq!(plain.gas_used(), 0);
}

#[test]
fn float_policies() {
    let mut b = ModuleBuilder::new();
    let f = b.function(
        &[],
        &[ValueType::F64],
        &[],
        vec![
            O::F64Const(1.5_f64.to_bits()),
            O::F64Const(2.25_f64.to_bits()),
            O::Binary(Opcode::F64Add),
            O::End,
        ],
    );
    let module = b.build();

    let mut allowed = vm(module.clone());
    let bits = allowed.run(f, &[]).unwrap().unwrap();
    assert_eq!(f64::from_bits(bits as u64), 3.75);
    assert!(matches!(
        allowed.compile_native(f),
        Err(CodegenError::Unsupported { .. })
    ));
    // Without a routine the function keeps running in the interpreter.
    assert_eq!(allowed.run(f, &[]).unwrap(), Some(bits));

    let err = compile_module(
        &module,
        &CompileConfig::default().with_float_policy(FloatPolicy::Reject),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        CompileError::Function {
            kind: CompileErrorKind::FloatingPoint(Opcode::F64Const),
            ..
        }
    ));

    let trapping = CompileConfig::default().with_float_policy(FloatPolicy::Trap);
    let err = vm_with(module, VmConfig::default(), &trapping)
        .run(f, &[])
        .unwrap_err();
    assert_eq!(err.trap(), Some(Trap::FpDisabled));
}

#[test]
fn imports_on_both_paths() {
    let mut b = ModuleBuilder::new();
    let twice = b.import_function("env", "twice", &[I64], &[I64]);
    let base = b.import_global("env", "base", I64, false);
    let main = b.function(
        &[I64],
        &[I64],
        &[],
        vec![
            O::GetLocal(0),
            O::Call(twice),
            O::GetGlobal(base),
            O::Binary(Opcode::I64Add),
            O::End,
        ],
    );
    let module = Arc::new(b.build());
    let registry = || {
        HostRegistry::new()
            .with_function("env", "twice", |ctx| Ok(ctx.param(0)? * 2))
            .with_global("env", "base", 100)
    };

    let mut interp = VirtualMachine::new(
        module.clone(),
        VmConfig::default(),
        &CompileConfig::default(),
        Box::new(registry()),
    )
    .unwrap();
    assert_eq!(interp.run(main, &[21]).unwrap(), Some(142));

    let mut native = VirtualMachine::new(
        module,
        VmConfig::default(),
        &CompileConfig::default(),
        Box::new(registry()),
    )
    .unwrap();
    native.compile_native(main).unwrap();
    native.compile_native(twice).unwrap();
    let mut sink = NativeCounter::default();
    assert_eq!(
        native.run_traced(main, &[21], &mut sink).unwrap(),
        Some(142)
    );
    assert!(sink.enters >= 2);
}

#[test]
fn host_failure_is_reported_with_location() {
    let mut b = ModuleBuilder::new();
    let fail = b.import_function("env", "fail", &[], &[]);
    let main = b.function(&[], &[], &[], vec![O::Call(fail), O::End]);
    let registry = HostRegistry::new().with_function("env", "fail", |_| {
        Err(wasm_tape::host::HostError::Failed("nope".into()))
    });
    let mut vm = VirtualMachine::new(
        Arc::new(b.build()),
        VmConfig::default(),
        &CompileConfig::default(),
        Box::new(registry),
    )
    .unwrap();
    let err = vm.run(main, &[]).unwrap_err();
    assert!(matches!(err, RunError::Host { func, .. } if func == fail));
    assert_eq!(err.trap(), Some(Trap::HostFailure));
}

#[test]
fn indirect_calls() {
    let mut b = ModuleBuilder::new();
    let sig = b.func_type(&[I32], &[I32]);
    let inc = b.function(
        &[I32],
        &[I32],
        &[],
        vec![
            O::GetLocal(0),
            O::I32Const(1),
            O::Binary(Opcode::I32Add),
            O::End,
        ],
    );
    let nullary = b.function(&[], &[I32], &[], vec![O::I32Const(7), O::End]);
    let dispatch = b.function(
        &[I32],
        &[I32],
        &[],
        vec![
            O::I32Const(41),
            O::GetLocal(0),
            O::CallIndirect(sig),
            O::End,
        ],
    );
    b.table(3, None).element(0, &[inc, nullary]);
    let module = b.build();

    let mut interp = vm(module.clone());
    let mut native = native_vm(module);
    for vm in [&mut interp, &mut native] {
        assert_eq!(vm.run(dispatch, &[0]).unwrap(), Some(42));
        let err = vm.run(dispatch, &[1]).unwrap_err();
        assert_eq!(err.trap(), Some(Trap::IndirectCallTypeMismatch));
        let err = vm.run(dispatch, &[2]).unwrap_err();
        assert_eq!(err.trap(), Some(Trap::UndefinedElement));
        let err = vm.run(dispatch, &[99]).unwrap_err();
        assert_eq!(err.trap(), Some(Trap::UndefinedElement));
    }
}

#[test]
fn memory_grow_on_both_paths() {
    let mut b = ModuleBuilder::new();
    let grow = b.function(
        &[I32],
        &[I32],
        &[],
        vec![
            O::GetLocal(0),
            O::GrowMemory,
            O::Drop,
            O::CurrentMemory,
            O::End,
        ],
    );
    b.memory(1, Some(4));
    let module = b.build();

    let mut interp = vm(module.clone());
    let mut native = native_vm(module);
    for vm in [&mut interp, &mut native] {
        assert_eq!(vm.run(grow, &[2]).unwrap(), Some(3));
        assert_eq!(vm.memory().len(), 3 * 65536);
        assert_eq!(
            vm.run(grow, &[5]).unwrap(), Some(3),
            "growth past the maximum fails"
        );
    }
}

#[test]
fn start_function_and_globals() {
    let mut b = ModuleBuilder::new();
    let counter = b.global(I64, true, ConstExpr::I64(1));
    let start = b.function(
        &[],
        &[],
        &[],
        vec![
            O::GetGlobal(counter),
            O::I64Const(10),
            O::Binary(Opcode::I64Mul),
            O::SetGlobal(counter),
            O::End,
        ],
    );
    let read = b.function(&[], &[I64], &[], vec![O::GetGlobal(counter), O::End]);
    b.start(start);
    let mut vm = vm(b.build());
    assert_eq!(vm.run(read, &[]).unwrap(), Some(10));
    assert_eq!(vm.run(read, &[]).unwrap(), Some(10));
    assert_eq!(vm.globals()[counter as usize], 10);
}

#[test]
fn clones_are_isolated() {
    let mut b = ModuleBuilder::new();
    let poke = b.function(
        &[I32, I32],
        &[],
        &[],
        vec![
            O::GetLocal(0),
            O::GetLocal(1),
            O::Store(Opcode::I32Store8, MemArg::default()),
            O::End,
        ],
    );
    b.memory(1, None).data(0, b"abc");
    let mut original = vm(b.build());
    let mut copy = original.clone();

    copy.run(poke, &[0, u32::from(b'z').into()]).unwrap();
    assert_eq!(&copy.memory()[..3], b"zbc");
    assert_eq!(&original.memory()[..3], b"abc");

    original.run(poke, &[2, u32::from(b'!').into()]).unwrap();
    assert_eq!(&original.memory()[..3], b"ab!");
    assert_eq!(&copy.memory()[..3], b"zbc");
}

/// Module with one void function whose code is replaced by `code`.
fn with_code(code: InterpreterCode) -> (VirtualMachine, u32) {
    let mut b = ModuleBuilder::new();
    let f = b.function(&[], &[], &[], vec![O::End]);
    b.memory(1, None).data(0, &[0xAA; 8]);
    let module = Arc::new(b.build());
    let compiled = Arc::new(CompiledModule {
        functions: vec![code],
    });
    let vm = VirtualMachine::instantiate(module, compiled, VmConfig::default(), Box::new(NoImports))
        .unwrap();
    (vm, f)
}

fn store_code(base: Reg, num_regs: u32, address: u64) -> InterpreterCode {
    let mut a = Asm::new();
    a.push(&Instruction::with_target(
        Reg(0),
        Op::Const {
            op: Opcode::I32Const,
            bits: address,
        },
    ));
    a.push(&Instruction::effect(Op::Store {
        op: Opcode::I64Store,
        align: 3,
        offset: 0,
        base,
        value: Reg(0),
    }));
    a.push(&Instruction::effect(Op::ReturnVoid));
    InterpreterCode::new(num_regs, 0, 0, 0, a.finish().unwrap())
}

#[test]
fn corrupted_store_faults_without_touching_memory() {
    let (mut vm, f) = with_code(store_code(Reg(5), 1, 0));
    let err = vm.run(f, &[]).unwrap_err();
    assert!(
        matches!(&err, RunError::Fault(info) if matches!(info.kind, FaultKind::BadRegister(5))),
        "{err:?}"
    );
    assert_eq!(err.trap(), None);
    assert_eq!(&vm.memory()[..8], &[0xAA; 8]);

    assert!(matches!(
        vm.compile_native(f),
        Err(CodegenError::RegisterOutOfRange { reg: 5, .. })
    ));
}

#[test]
fn out_of_bounds_store_leaves_memory_intact() {
    for native in [false, true] {
        let (mut vm, f) = with_code(store_code(Reg(0), 1, 65536 - 4));
        if native {
            vm.compile_native(f).unwrap();
        }
        let err = vm.run(f, &[]).unwrap_err();
        assert_eq!(err.trap(), Some(Trap::MemoryOutOfBounds));
        assert!(vm.memory().iter().skip(8).all(|&b| b == 0));
        assert_eq!(&vm.memory()[..8], &[0xAA; 8]);
    }
}

#[test]
fn background_compilation_does_not_change_results() {
    let (module, add) = add_module();
    let config = VmConfig {
        enable_jit: true,
        ..VmConfig::default()
    };
    let mut vm = vm_with(module, config, &CompileConfig::default());
    for i in 0..200_i64 {
        assert_eq!(vm.run(add, &[i, 1]).unwrap(), Some(i + 1));
    }
}

#[test]
fn native_code_is_shared_between_instances() {
    let (module, add) = add_module();
    let first = vm(module);
    first.compile_native(add).unwrap();
    let mut second = VirtualMachine::instantiate(
        Arc::new(first.module().clone()),
        first.compiled().clone(),
        VmConfig::default(),
        Box::new(NoImports),
    )
    .unwrap();
    let mut sink = NativeCounter::default();
    assert_eq!(second.run_traced(add, &[4, 5], &mut sink).unwrap(), Some(9));
    assert_eq!(sink.enters, 1);
}

#[test]
fn br_table_carries_a_value_on_both_paths() {
    let mut b = ModuleBuilder::new();
    let f = b.function(
        &[I32],
        &[I32],
        &[],
        vec![
            O::Block(BlockType::Value(I32)),
            O::Block(BlockType::Value(I32)),
            O::Block(BlockType::Value(I32)),
            O::I32Const(10),
            O::GetLocal(0),
            O::BrTable {
                targets: vec![0, 1],
                default: 2,
            },
            O::End,
            O::I32Const(1),
            O::Binary(Opcode::I32Add),
            O::End,
            O::I32Const(2),
            O::Binary(Opcode::I32Add),
            O::End,
            O::End,
        ],
    );
    let module = b.build();

    let mut interp = vm(module.clone());
    let mut native = native_vm(module);
    for vm in [&mut interp, &mut native] {
        let got: Vec<_> = [0, 1, 2, 3, 0xFFFF_FFFF]
            .iter()
            .map(|&k| vm.run(f, &[k]).unwrap())
            .collect();
        assert_eq!(got, vec![Some(13), Some(12), Some(10), Some(10), Some(10)]);
    }
}

#[test]
fn loops_and_if_else_agree_on_i64() {
    let mut b = ModuleBuilder::new();
    // Sum of 1..=n, negated when n is negative.
    let f = b.function(
        &[I64],
        &[I64],
        &[(1, I64), (1, I32)],
        vec![
            O::GetLocal(0),
            O::I64Const(0),
            O::Binary(Opcode::I64LtS),
            O::TeeLocal(2),
            O::If(BlockType::Value(I64)),
            O::I64Const(0),
            O::GetLocal(0),
            O::Binary(Opcode::I64Sub),
            O::Else,
            O::GetLocal(0),
            O::End,
            O::SetLocal(0),
            O::Block(BlockType::Empty),
            O::Loop(BlockType::Empty),
            O::GetLocal(0),
            O::Unary(Opcode::I64Eqz),
            O::BrIf(1),
            O::GetLocal(1),
            O::GetLocal(0),
            O::Binary(Opcode::I64Add),
            O::SetLocal(1),
            O::GetLocal(0),
            O::I64Const(1),
            O::Binary(Opcode::I64Sub),
            O::SetLocal(0),
            O::Br(0),
            O::End,
            O::End,
            O::GetLocal(2),
            O::If(BlockType::Value(I64)),
            O::I64Const(0),
            O::GetLocal(1),
            O::Binary(Opcode::I64Sub),
            O::Else,
            O::GetLocal(1),
            O::End,
            O::End,
        ],
    );
    let module = b.build();

    let mut interp = vm(module.clone());
    let mut native = native_vm(module);
    for vm in [&mut interp, &mut native] {
        assert_eq!(vm.run(f, &[100]).unwrap(), Some(5050));
        assert_eq!(vm.run(f, &[-4]).unwrap(), Some(-10));
        assert_eq!(vm.run(f, &[0]).unwrap(), Some(0));
    }
}

#[test]
fn i64_division_edges_agree() {
    let mut b = ModuleBuilder::new();
    let mut binary = |op| {
        b.function(
            &[I64, I64],
            &[I64],
            &[],
            vec![O::GetLocal(0), O::GetLocal(1), O::Binary(op), O::End],
        )
    };
    let div_s = binary(Opcode::I64DivS);
    let div_u = binary(Opcode::I64DivU);
    let rem_s = binary(Opcode::I64RemS);
    let module = b.build();

    let mut interp = vm(module.clone());
    let mut native = native_vm(module);
    for vm in [&mut interp, &mut native] {
        assert_eq!(
            vm.run(div_s, &[i64::MIN, -1]).unwrap_err().trap(),
            Some(Trap::Arithmetic)
        );
        assert_eq!(vm.run(div_s, &[-7, 2]).unwrap(), Some(-3));
        assert_eq!(
            vm.run(div_u, &[5, 0]).unwrap_err().trap(),
            Some(Trap::Arithmetic)
        );
        assert_eq!(vm.run(div_u, &[-1, 2]).unwrap(), Some(i64::MAX));
        assert_eq!(vm.run(rem_s, &[i64::MIN, -1]).unwrap(), Some(0));
        assert_eq!(vm.run(rem_s, &[-7, 2]).unwrap(), Some(-1));
        assert_eq!(
            vm.run(rem_s, &[1, 0]).unwrap_err().trap(),
            Some(Trap::Arithmetic)
        );
    }
}

#[test]
fn signed_narrow_loads_agree() {
    let mut b = ModuleBuilder::new();
    let mut load = |op, result| {
        b.function(
            &[I32],
            &[result],
            &[],
            vec![O::GetLocal(0), O::Load(op, MemArg::default()), O::End],
        )
    };
    let i32_8s = load(Opcode::I32Load8S, I32);
    let i32_16s = load(Opcode::I32Load16S, I32);
    let i64_8s = load(Opcode::I64Load8S, I64);
    let i64_32s = load(Opcode::I64Load32S, I64);
    b.memory(1, None).data(0, &[0x80, 0xFF, 0xFF, 0xFF]);
    let module = b.build();

    let mut interp = vm(module.clone());
    let mut native = native_vm(module);
    for vm in [&mut interp, &mut native] {
        assert_eq!(vm.run(i32_8s, &[0]).unwrap(), Some(0xFFFF_FF80));
        assert_eq!(vm.run(i32_16s, &[0]).unwrap(), Some(0xFFFF_FF80));
        assert_eq!(vm.run(i64_8s, &[0]).unwrap(), Some(-128));
        assert_eq!(vm.run(i64_32s, &[0]).unwrap(), Some(-128));
    }
}

#[derive(Copy, Clone, Debug)]
enum Expr {
    Param(u32),
    Const(i32),
}

#[derive(Clone, Debug)]
enum Tree {
    Leaf(Expr),
    Bin(Opcode, Box<Tree>, Box<Tree>),
    /// Both operands sign-extended to i64, combined, then wrapped back.
    Wide(Opcode, Box<Tree>, Box<Tree>),
    Select(Box<Tree>, Box<Tree>, Box<Tree>),
    Eqz(Box<Tree>),
    /// `if (cond) then else`, yielding a value.
    If(Box<Tree>, Box<Tree>, Box<Tree>),
    /// A value block left early by `br_if`: `cond ? value : value + 1`.
    Exit(Box<Tree>, Box<Tree>),
}

const BINARY: [Opcode; 15] = [
    Opcode::I32Add,
    Opcode::I32Sub,
    Opcode::I32Mul,
    Opcode::I32And,
    Opcode::I32Or,
    Opcode::I32Xor,
    Opcode::I32Shl,
    Opcode::I32ShrU,
    Opcode::I32ShrS,
    Opcode::I32Rotl,
    Opcode::I32Eq,
    Opcode::I32LtS,
    Opcode::I32GeU,
    Opcode::I32DivS,
    Opcode::I32RemU,
];

const WIDE: [Opcode; 7] = [
    Opcode::I64Add,
    Opcode::I64Sub,
    Opcode::I64Mul,
    Opcode::I64ShrS,
    Opcode::I64DivS,
    Opcode::I64DivU,
    Opcode::I64RemS,
];

fn tree() -> impl Strategy<Value = Tree> {
    let leaf = prop_oneof![
        (0..3_u32).prop_map(|p| Tree::Leaf(Expr::Param(p))),
        any::<i32>().prop_map(|c| Tree::Leaf(Expr::Const(c))),
        (-3..3_i32).prop_map(|c| Tree::Leaf(Expr::Const(c))),
        Just(Tree::Leaf(Expr::Const(i32::MIN))),
    ];
    leaf.prop_recursive(5, 48, 3, |inner| {
        prop_oneof![
            4 => (prop::sample::select(BINARY.to_vec()), inner.clone(), inner.clone())
                .prop_map(|(op, a, b)| Tree::Bin(op, Box::new(a), Box::new(b))),
            2 => (prop::sample::select(WIDE.to_vec()), inner.clone(), inner.clone())
                .prop_map(|(op, a, b)| Tree::Wide(op, Box::new(a), Box::new(b))),
            1 => (inner.clone(), inner.clone(), inner.clone())
                .prop_map(|(a, b, c)| Tree::Select(Box::new(a), Box::new(b), Box::new(c))),
            1 => (inner.clone(), inner.clone(), inner.clone())
                .prop_map(|(c, a, b)| Tree::If(Box::new(c), Box::new(a), Box::new(b))),
            1 => (inner.clone(), inner.clone())
                .prop_map(|(v, c)| Tree::Exit(Box::new(v), Box::new(c))),
            1 => inner.prop_map(|a| Tree::Eqz(Box::new(a))),
        ]
    })
}

fn emit(t: &Tree, out: &mut Vec<O>) {
    match t {
        Tree::Leaf(Expr::Param(p)) => out.push(O::GetLocal(*p)),
        Tree::Leaf(Expr::Const(c)) => out.push(O::I32Const(*c)),
        Tree::Bin(op, a, b) => {
            emit(a, out);
            emit(b, out);
            out.push(O::Binary(*op));
        }
        Tree::Wide(op, a, b) => {
            emit(a, out);
            out.push(O::Unary(Opcode::I64ExtendSI32));
            emit(b, out);
            out.push(O::Unary(Opcode::I64ExtendSI32));
            out.push(O::Binary(*op));
            out.push(O::Unary(Opcode::I32WrapI64));
        }
        Tree::Select(a, b, c) => {
            emit(a, out);
            emit(b, out);
            emit(c, out);
            out.push(O::Select);
        }
        Tree::Eqz(a) => {
            emit(a, out);
            out.push(O::Unary(Opcode::I32Eqz));
        }
        Tree::If(c, a, b) => {
            emit(c, out);
            out.push(O::If(BlockType::Value(I32)));
            emit(a, out);
            out.push(O::Else);
            emit(b, out);
            out.push(O::End);
        }
        Tree::Exit(v, c) => {
            out.push(O::Block(BlockType::Value(I32)));
            emit(v, out);
            emit(c, out);
            out.push(O::BrIf(0));
            out.push(O::I32Const(1));
            out.push(O::Binary(Opcode::I32Add));
            out.push(O::End);
        }
    }
}

/// Reference evaluation; `None` is an arithmetic trap.
fn eval(t: &Tree, params: &[u32; 3]) -> Option<u32> {
    Some(match t {
        Tree::Leaf(Expr::Param(p)) => params[*p as usize],
        Tree::Leaf(Expr::Const(c)) => c.cast_unsigned(),
        Tree::Eqz(a) => u32::from(eval(a, params)? == 0),
        Tree::Select(a, b, c) => {
            let (a, b, c) = (eval(a, params)?, eval(b, params)?, eval(c, params)?);
            if c != 0 { a } else { b }
        }
        Tree::If(c, a, b) => {
            if eval(c, params)? != 0 {
                eval(a, params)?
            } else {
                eval(b, params)?
            }
        }
        Tree::Exit(v, c) => {
            let (v, c) = (eval(v, params)?, eval(c, params)?);
            if c != 0 { v } else { v.wrapping_add(1) }
        }
        Tree::Wide(op, a, b) => {
            let x = i64::from(eval(a, params)?.cast_signed());
            let y = i64::from(eval(b, params)?.cast_signed());
            let r = match op {
                Opcode::I64Add => x.wrapping_add(y),
                Opcode::I64Sub => x.wrapping_sub(y),
                Opcode::I64Mul => x.wrapping_mul(y),
                Opcode::I64ShrS => x.wrapping_shr(y as u32),
                Opcode::I64DivS => x.checked_div(y)?,
                Opcode::I64DivU => x
                    .cast_unsigned()
                    .checked_div(y.cast_unsigned())?
                    .cast_signed(),
                Opcode::I64RemS => {
                    if y == 0 {
                        return None;
                    }
                    x.wrapping_rem(y)
                }
                _ => unreachable!("not generated"),
            };
            r as u32
        }
        Tree::Bin(op, a, b) => {
            let (a, b) = (eval(a, params)?, eval(b, params)?);
            let (sa, sb) = (a.cast_signed(), b.cast_signed());
            match op {
                Opcode::I32Add => a.wrapping_add(b),
                Opcode::I32Sub => a.wrapping_sub(b),
                Opcode::I32Mul => a.wrapping_mul(b),
                Opcode::I32And => a & b,
                Opcode::I32Or => a | b,
                Opcode::I32Xor => a ^ b,
                Opcode::I32Shl => a.wrapping_shl(b),
                Opcode::I32ShrU => a.wrapping_shr(b),
                Opcode::I32ShrS => sa.wrapping_shr(b).cast_unsigned(),
                Opcode::I32Rotl => a.rotate_left(b % 32),
                Opcode::I32Eq => u32::from(a == b),
                Opcode::I32LtS => u32::from(sa < sb),
                Opcode::I32GeU => u32::from(a >= b),
                Opcode::I32DivS => {
                    if sb == 0 || (sa == i32::MIN && sb == -1) {
                        return None;
                    }
                    (sa / sb).cast_unsigned()
                }
                Opcode::I32RemU => a.checked_rem(b)?,
                _ => unreachable!("not generated"),
            }
        }
    })
}

fn tree_module(t: &Tree) -> (Module, u32) {
    let mut body = Vec::new();
    emit(t, &mut body);
    body.push(O::End);
    let mut b = ModuleBuilder::new();
    let f = b.function(&[I32, I32, I32], &[I32], &[], body);
    (b.build(), f)
}

fn outcome(result: Result<Option<i64>, RunError>) -> Result<Option<i64>, Option<Trap>> {
    result.map_err(|e| e.trap())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn register_allocation_preserves_results(t in tree(), params in any::<[u32; 3]>()) {
        let (module, f) = tree_module(&t);
        let mut vm = vm(module);
        let args = params.map(i64::from);
        let expected = match eval(&t, &params) {
            Some(v) => Ok(Some(i64::from(v))),
            None => Err(Some(Trap::Arithmetic)),
        };
        prop_assert_eq!(outcome(vm.run(f, &args)), expected);
    }

    #[test]
    fn native_matches_interpreter(t in tree(), params in any::<[u32; 3]>()) {
        let (module, f) = tree_module(&t);
        let args = params.map(i64::from);
        let mut interp = vm(module.clone());
        let mut native = native_vm(module);
        prop_assert_eq!(outcome(native.run(f, &args)), outcome(interp.run(f, &args)));
    }

    #[test]
    fn loads_trap_exactly_when_out_of_bounds(
        offset in 0..70_000_u32,
        base in 0..70_000_u32,
        op in prop::sample::select(vec![
            Opcode::I32Load8U,
            Opcode::I32Load16U,
            Opcode::I32Load,
            Opcode::I64Load,
        ]),
    ) {
        let mut b = ModuleBuilder::new();
        let result = if op == Opcode::I64Load { I64 } else { I32 };
        let f = b.function(
            &[I32],
            &[result],
            &[],
            vec![
                O::GetLocal(0),
                O::Load(op, MemArg { align: 0, offset }),
                O::End,
            ],
        );
        b.memory(1, None);
        let module = b.build();
        let size = u64::from(op.access_size().unwrap());
        let in_bounds = u64::from(offset) + u64::from(base) + size <= 65536;

        let mut interp = vm(module.clone());
        let mut native = native_vm(module);
        for vm in [&mut interp, &mut native] {
            let r = vm.run(f, &[i64::from(base)]);
            if in_bounds {
                prop_assert_eq!(r, Ok(Some(0)));
            } else {
                prop_assert_eq!(r.unwrap_err().trap(), Some(Trap::MemoryOutOfBounds));
            }
        }
    }
}
