//! Shared helpers: bytecode fragment constructors (prefix encoding) and a
//! module fixture that builds, decodes, and instantiates test modules.

#![allow(dead_code)]

use std::sync::Arc;

use protowasm::builder::ModuleBuilder;
use protowasm::instance::{instantiate, ImportMap, ModuleInstance};
use protowasm::opcodes::{load_store_opcode, Opcode};
use protowasm::{decode_module, EvalBackend, MemType, ModuleConfig, Value, ValueType};

pub fn cat(parts: &[&[u8]]) -> Vec<u8> {
    parts.concat()
}

pub fn i8c(v: i8) -> Vec<u8> {
    vec![Opcode::I8Const as u8, v as u8]
}

pub fn i32c(v: i32) -> Vec<u8> {
    let mut b = vec![Opcode::I32Const as u8];
    b.extend_from_slice(&v.to_le_bytes());
    b
}

pub fn i64c(v: i64) -> Vec<u8> {
    let mut b = vec![Opcode::I64Const as u8];
    b.extend_from_slice(&v.to_le_bytes());
    b
}

pub fn f32c(v: f32) -> Vec<u8> {
    let mut b = vec![Opcode::F32Const as u8];
    b.extend_from_slice(&v.to_bits().to_le_bytes());
    b
}

pub fn f64c(v: f64) -> Vec<u8> {
    let mut b = vec![Opcode::F64Const as u8];
    b.extend_from_slice(&v.to_bits().to_le_bytes());
    b
}

pub fn get_local(i: u8) -> Vec<u8> {
    vec![Opcode::GetLocal as u8, i]
}

pub fn set_local(i: u8, value: &[u8]) -> Vec<u8> {
    cat(&[&[Opcode::SetLocal as u8, i], value])
}

pub fn load_global(i: u8) -> Vec<u8> {
    vec![Opcode::LoadGlobal as u8, i]
}

pub fn store_global(i: u8, value: &[u8]) -> Vec<u8> {
    cat(&[&[Opcode::StoreGlobal as u8, i], value])
}

pub fn load_mem(mem: MemType, addr: &[u8]) -> Vec<u8> {
    cat(&[&[load_store_opcode(mem, false) as u8, mem as u8], addr])
}

pub fn store_mem(mem: MemType, addr: &[u8], value: &[u8]) -> Vec<u8> {
    cat(&[&[load_store_opcode(mem, true) as u8, mem as u8], addr, value])
}

pub fn ret(value: &[u8]) -> Vec<u8> {
    cat(&[&[Opcode::Return as u8], value])
}

pub fn ret0() -> Vec<u8> {
    vec![Opcode::Return as u8]
}

pub fn unop(op: Opcode, a: &[u8]) -> Vec<u8> {
    cat(&[&[op as u8], a])
}

pub fn binop(op: Opcode, a: &[u8], b: &[u8]) -> Vec<u8> {
    cat(&[&[op as u8], a, b])
}

pub fn not(a: &[u8]) -> Vec<u8> {
    unop(Opcode::BoolNot, a)
}

pub fn block(stmts: &[&[u8]]) -> Vec<u8> {
    let mut b = vec![Opcode::Block as u8, stmts.len() as u8];
    for s in stmts {
        b.extend_from_slice(s);
    }
    b
}

pub fn loop_(stmts: &[&[u8]]) -> Vec<u8> {
    let mut b = vec![Opcode::Loop as u8, stmts.len() as u8];
    for s in stmts {
        b.extend_from_slice(s);
    }
    b
}

pub fn if_(cond: &[u8], then: &[u8]) -> Vec<u8> {
    cat(&[&[Opcode::If as u8], cond, then])
}

pub fn if_then(cond: &[u8], then: &[u8], els: &[u8]) -> Vec<u8> {
    cat(&[&[Opcode::IfThen as u8], cond, then, els])
}

pub fn switch(key: &[u8], cases: &[&[u8]]) -> Vec<u8> {
    let mut b = vec![Opcode::Switch as u8, cases.len() as u8];
    b.extend_from_slice(key);
    for c in cases {
        b.extend_from_slice(c);
    }
    b
}

pub fn switch_nf(key: &[u8], cases: &[&[u8]]) -> Vec<u8> {
    let mut b = vec![Opcode::SwitchNf as u8, cases.len() as u8];
    b.extend_from_slice(key);
    for c in cases {
        b.extend_from_slice(c);
    }
    b
}

pub fn brk(depth: u8) -> Vec<u8> {
    vec![Opcode::Break as u8, depth]
}

pub fn cont(depth: u8) -> Vec<u8> {
    vec![Opcode::Continue as u8, depth]
}

pub fn nop() -> Vec<u8> {
    vec![Opcode::Nop as u8]
}

pub fn infinite_loop() -> Vec<u8> {
    vec![Opcode::InfiniteLoop as u8]
}

pub fn ternary(cond: &[u8], t: &[u8], e: &[u8]) -> Vec<u8> {
    cat(&[&[Opcode::Ternary as u8], cond, t, e])
}

pub fn comma(a: &[u8], b: &[u8]) -> Vec<u8> {
    cat(&[&[Opcode::Comma as u8], a, b])
}

pub fn call(index: u8, args: &[&[u8]]) -> Vec<u8> {
    let mut b = vec![Opcode::CallFunction as u8, index];
    for a in args {
        b.extend_from_slice(a);
    }
    b
}

/// `while (cond) body` in its canonical lowering.
pub fn while_(cond: &[u8], body: &[u8]) -> Vec<u8> {
    loop_(&[&if_(&not(cond), &brk(0)), body])
}

/// Builds test modules and instantiates them with the reference backend.
pub struct TestModule {
    pub builder: ModuleBuilder,
}

impl TestModule {
    pub fn new() -> Self {
        Self { builder: ModuleBuilder::new() }
    }

    /// Add a function; locals must be listed in type order.
    pub fn add_function(
        &mut self,
        ret: ValueType,
        params: &[ValueType],
        locals: &[ValueType],
        body: &[u8],
    ) -> u16 {
        let index = self.builder.add_function();
        let f = self.builder.function_at(index);
        f.return_type(ret);
        for &p in params {
            f.add_param(p);
        }
        for &l in locals {
            f.add_local(l);
        }
        f.emit(body);
        index
    }

    pub fn add_global(&mut self, mem: MemType) -> u16 {
        self.builder.add_global(mem, false)
    }

    pub fn instantiate(&self) -> ModuleInstance {
        self.instantiate_with(&ImportMap::new())
    }

    pub fn instantiate_with(&self, imports: &ImportMap) -> ModuleInstance {
        let bytes = self.builder.build().expect("module builds");
        let config = ModuleConfig::default();
        let module = decode_module(&bytes, &config).expect("module decodes and verifies");
        instantiate(Arc::new(module), imports, &EvalBackend, &config).expect("module instantiates")
    }
}

/// Build a single-function module and return its instance; the function is
/// index 0.
pub fn instance_for(
    ret: ValueType,
    params: &[ValueType],
    locals: &[ValueType],
    body: &[u8],
) -> ModuleInstance {
    let mut m = TestModule::new();
    m.add_function(ret, params, locals, body);
    m.instantiate()
}

pub fn call_i32(inst: &mut ModuleInstance, index: u16, args: &[Value]) -> i32 {
    match inst.invoke_function(index, args) {
        Ok(Some(Value::I32(v))) => v,
        other => panic!("expected an i32 result, got {other:?}"),
    }
}

pub fn call_i64(inst: &mut ModuleInstance, index: u16, args: &[Value]) -> i64 {
    match inst.invoke_function(index, args) {
        Ok(Some(Value::I64(v))) => v,
        other => panic!("expected an i64 result, got {other:?}"),
    }
}

/// Run a single-function module once.
pub fn run_i32(ret: ValueType, params: &[ValueType], body: &[u8], args: &[Value]) -> i32 {
    let mut inst = instance_for(ret, params, &[], body);
    call_i32(&mut inst, 0, args)
}

/// Fill instance memory from a seeded generator, like the original test
/// harness randomizes its test memories.
pub fn randomize_memory(inst: &mut ModuleInstance, seed: u64) {
    use rand::{RngCore, SeedableRng};
    rand::rngs::StdRng::seed_from_u64(seed).fill_bytes(&mut inst.memory);
}

pub fn read_mem_u32(inst: &ModuleInstance, addr: usize) -> u32 {
    u32::from_le_bytes(inst.memory[addr..addr + 4].try_into().unwrap())
}

pub fn write_mem_u32(inst: &mut ModuleInstance, addr: usize, v: u32) {
    inst.memory[addr..addr + 4].copy_from_slice(&v.to_le_bytes());
}

/// A spread of interesting i32 inputs, in the spirit of the original
/// value-helper tables.
pub fn i32_inputs() -> Vec<i32> {
    vec![
        0,
        1,
        -1,
        2,
        -2,
        63,
        64,
        -64,
        127,
        128,
        -128,
        0x0FFF_FFFF,
        0x7FFF_FFFF,
        i32::MIN,
        i32::MIN + 1,
        -0x0100_0000,
        0x55AA_55AA,
        -559038737,
    ]
}
