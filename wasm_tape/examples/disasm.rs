// Copyright 2026 the Wasm Tape Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Compiles a small module and prints its register bytecode.
//!
//! Run with:
//! `cargo run -p wasm_tape --example disasm`
//!
//! Pass `--gas` to see the metering instructions and `--run N` to also evaluate `fib(N)`.

use std::sync::Arc;

use anyhow::{Context, bail};
use wasm_tape::compiler::{CompileConfig, SimpleCostPolicy, compile_module};
use wasm_tape::disasm::disassemble_module;
use wasm_tape::host::NoImports;
use wasm_tape::module::{Module, ModuleBuilder, ValueType};
use wasm_tape::opcode::Opcode;
use wasm_tape::operator::{BlockType, Operator};
use wasm_tape::vm::{VirtualMachine, VmConfig};

/// Iterative Fibonacci: locals are `n`, `a`, `b`, `t`.
fn fib_module() -> Module {
    use Operator as O;
    let mut b = ModuleBuilder::new();
    let fib = b.function(
        &[ValueType::I64],
        &[ValueType::I64],
        &[(3, ValueType::I64)],
        vec![
            O::I64Const(1),
            O::SetLocal(2),
            O::Block(BlockType::Empty),
            O::Loop(BlockType::Empty),
            O::GetLocal(0),
            O::Unary(Opcode::I64Eqz),
            O::BrIf(1),
            O::GetLocal(1),
            O::GetLocal(2),
            O::Binary(Opcode::I64Add),
            O::SetLocal(3),
            O::GetLocal(2),
            O::SetLocal(1),
            O::GetLocal(3),
            O::SetLocal(2),
            O::GetLocal(0),
            O::I64Const(1),
            O::Binary(Opcode::I64Sub),
            O::SetLocal(0),
            O::Br(0),
            O::End,
            O::End,
            O::GetLocal(1),
            O::End,
        ],
    );
    b.export_function("fib", fib).name_function(fib, "fib");
    b.build()
}

fn main() -> anyhow::Result<()> {
    let mut gas = false;
    let mut run = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--gas" => gas = true,
            "--run" => {
                let n = args.next().context("--run needs an argument")?;
                run = Some(n.parse::<i64>().context("--run expects an integer")?);
            }
            other => bail!("unknown argument `{other}`"),
        }
    }

    let mut config = CompileConfig::default();
    if gas {
        config = config.with_cost_policy(SimpleCostPolicy::default());
    }
    let module = Arc::new(fib_module());
    let compiled = Arc::new(compile_module(&module, &config).context("compiling fib")?);
    print!("{}", disassemble_module(&module, &compiled));

    if let Some(n) = run {
        let mut vm = VirtualMachine::instantiate(
            module,
            compiled,
            VmConfig::default(),
            Box::new(NoImports),
        )?;
        let fib = vm.function_export("fib").context("fib is exported")?;
        let result = vm.run(fib, &[n])?;
        println!("fib({n}) = {result:?}, gas used {}", vm.gas_used());
    }
    Ok(())
}
