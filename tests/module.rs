//! Module-level tests: the binary format byte-for-byte, data segments,
//! external functions, exports, and the placeholder-and-patch link pass.

mod common;

use std::rc::Rc;
use std::sync::Arc;

use common::*;
use protowasm::backend::{CallDescriptor, CodeGenerator};
use protowasm::instance::{instantiate, Export, ImportMap};
use protowasm::link::Linker;
use protowasm::module::FunctionEnv;
use protowasm::opcodes::Opcode;
use protowasm::verify::verify_function;
use protowasm::ValueType::I32;
use protowasm::{
    compile_and_run, decode_module, DecodeError, EvalBackend, InstantiateError, MemType,
    ModuleConfig, Value, ValueType,
};

/// The forward-reference module, spelled out byte for byte: function 0
/// (exported) returns `call 1 (77, 22)`; function 1 adds its parameters.
/// Function 0 compiles first, so its call site goes through a placeholder.
fn call_add_reversed_bytes() -> Vec<u8> {
    const RET: u8 = Opcode::Return as u8;
    const CALL: u8 = Opcode::CallFunction as u8;
    const I8C: u8 = Opcode::I8Const as u8;
    const GETL: u8 = Opcode::GetLocal as u8;
    const ADD: u8 = Opcode::I32Add as u8;
    const AST_I32: u8 = ValueType::I32 as u8;

    vec![
        // header: mem 2^16, no export, 0 globals, 2 functions, 0 segments
        16, 0, 0, 0, 2, 0, 0, 0,
        // func#0 (main) ----------------------------------
        0, AST_I32,                 // signature: () -> i32
        0, 0, 0, 0,                 // name offset (unnamed)
        64, 0, 0, 0,                // code start
        71, 0, 0, 0,                // code end
        0, 0,                       // local i32 count
        0, 0,                       // local i64 count
        0, 0,                       // local f32 count
        0, 0,                       // local f64 count
        1,                          // exported
        0,                          // external
        // func#1 -----------------------------------------
        2, AST_I32, AST_I32, AST_I32, // signature: (i32, i32) -> i32
        0, 0, 0, 0,                 // name offset
        58, 0, 0, 0,                // code start
        64, 0, 0, 0,                // code end
        0, 0, 0, 0, 0, 0, 0, 0,     // local counts
        0,                          // exported
        0,                          // external
        // body of func#1 at 58: return p0 + p1
        RET, ADD, GETL, 0, GETL, 1,
        // body of func#0 at 64: return call#1(77, 22)
        RET, CALL, 1, I8C, 77, I8C, 22,
    ]
}

#[test]
fn forward_call_through_placeholder() {
    let result = compile_and_run(&call_add_reversed_bytes()).unwrap();
    assert_eq!(result, 99);
}

#[test]
fn golden_module_decodes_as_written() {
    let bytes = call_add_reversed_bytes();
    let m = decode_module(&bytes, &ModuleConfig::default()).unwrap();
    assert_eq!(m.mem_size_log2, 16);
    assert_eq!(m.functions.len(), 2);
    assert!(m.functions[0].exported);
    assert_eq!(m.functions[0].code_start, 64);
    assert_eq!(m.functions[0].code_end, 71);
    assert_eq!(m.functions[1].sig.param_count(), 2);
    assert_eq!(m.functions[1].code_start, 58);
}

#[test]
fn bad_body_error_names_the_function() {
    let mut bytes = call_add_reversed_bytes();
    // Clobber func#1's body with an unknown opcode.
    bytes[58] = 0xFF;
    let err = decode_module(&bytes, &ModuleConfig::default()).unwrap_err();
    match err {
        DecodeError::Function { index, source } => {
            assert_eq!(index, 1);
            assert_eq!(source.kind, protowasm::ErrorKind::UnknownOpcode);
            assert_eq!(source.pc, 58);
        }
        other => panic!("expected a function error, got {other}"),
    }
}

#[test]
fn mutual_recursion_links() {
    // even(n): if (n) return odd(n - 1); return 1
    // odd(n):  if (n) return even(n - 1); return 0
    let mut m = TestModule::new();
    let even_body = block(&[
        &if_(
            &get_local(0),
            &ret(&call(1, &[&binop(Opcode::I32Sub, &get_local(0), &i8c(1))])),
        ),
        &ret(&i8c(1)),
    ]);
    m.add_function(I32, &[I32], &[], &even_body);
    let odd_body = block(&[
        &if_(
            &get_local(0),
            &ret(&call(0, &[&binop(Opcode::I32Sub, &get_local(0), &i8c(1))])),
        ),
        &ret(&i8c(0)),
    ]);
    m.add_function(I32, &[I32], &[], &odd_body);
    let mut inst = m.instantiate();
    assert_eq!(call_i32(&mut inst, 0, &[Value::I32(10)]), 1);
    assert_eq!(call_i32(&mut inst, 0, &[Value::I32(7)]), 0);
    assert_eq!(call_i32(&mut inst, 1, &[Value::I32(9)]), 1);
}

#[test]
fn self_recursion_links() {
    // fac(n): if (n) return n * fac(n - 1); return 1
    let mut m = TestModule::new();
    let body = block(&[
        &if_(
            &get_local(0),
            &ret(&binop(
                Opcode::I32Mul,
                &get_local(0),
                &call(0, &[&binop(Opcode::I32Sub, &get_local(0), &i8c(1))]),
            )),
        ),
        &ret(&i8c(1)),
    ]);
    m.add_function(I32, &[I32], &[], &body);
    let mut inst = m.instantiate();
    assert_eq!(call_i32(&mut inst, 0, &[Value::I32(5)]), 120);
}

#[test]
fn link_pass_reaches_fixed_point() {
    let bytes = call_add_reversed_bytes();
    let config = ModuleConfig::default();
    let module = decode_module(&bytes, &config).unwrap();
    let mut linker = Linker::new(module.functions.len());
    // Compile in declaration order: func 0 references func 1 early.
    for (i, func) in module.functions.iter().enumerate() {
        let env = FunctionEnv::for_function(&module, func);
        let graph = verify_function(
            &env,
            &module.bytes,
            func.code_start as usize,
            func.code_end as usize,
        )
        .unwrap();
        let code = EvalBackend
            .generate(graph, CallDescriptor::for_sig(&func.sig), &mut linker)
            .unwrap();
        linker.finish(i as u16, code);
    }
    let patched = linker.link();
    assert_eq!(patched, 1, "func 0's call to func 1 goes through a placeholder");
    assert_eq!(linker.link(), 0, "second pass is a fixed point");
    assert!(linker.finished_code(0).unwrap().borrow().was_patched());
    assert!(!linker.finished_code(1).unwrap().borrow().was_patched());
}

#[test]
fn data_segments_applied_in_order() {
    let mut m = TestModule::new();
    m.builder.mem_size_log2 = 8;
    m.builder.add_data_segment(0, vec![1, 1, 1, 1]);
    m.builder.add_data_segment(2, vec![9, 9]);
    let inst = m.instantiate();
    // The later segment overwrote the overlap.
    assert_eq!(&inst.memory[0..4], &[1, 1, 9, 9]);
}

#[test]
fn data_segments_idempotent() {
    let mut once = TestModule::new();
    once.builder.mem_size_log2 = 8;
    once.builder.add_data_segment(3, vec![7, 8, 9]);
    once.builder.add_data_segment(100, vec![0xAB; 16]);
    let a = once.instantiate();

    let mut twice = TestModule::new();
    twice.builder.mem_size_log2 = 8;
    for _ in 0..2 {
        twice.builder.add_data_segment(3, vec![7, 8, 9]);
        twice.builder.add_data_segment(100, vec![0xAB; 16]);
    }
    let b = twice.instantiate();
    assert_eq!(a.memory, b.memory);
}

#[test]
fn data_segment_out_of_bounds_fails_instantiation() {
    let mut m = TestModule::new();
    m.builder.mem_size_log2 = 4; // 16 bytes of memory
    m.builder.add_data_segment(12, vec![0; 8]);
    let bytes = m.builder.build().unwrap();
    let config = ModuleConfig::default();
    let module = decode_module(&bytes, &config).unwrap();
    let err = instantiate(Arc::new(module), &ImportMap::new(), &EvalBackend, &config).unwrap_err();
    assert!(matches!(err, InstantiateError::DataSegmentOutOfBounds { index: 0 }));
}

#[test]
fn memory_too_large_rejected() {
    let mut m = TestModule::new();
    m.builder.mem_size_log2 = 31;
    let bytes = m.builder.build().unwrap();
    let config = ModuleConfig::default();
    let module = decode_module(&bytes, &config).unwrap();
    let err = instantiate(Arc::new(module), &ImportMap::new(), &EvalBackend, &config).unwrap_err();
    assert!(matches!(err, InstantiateError::MemoryTooLarge { .. }));
}

#[test]
fn external_function_resolved_through_imports() {
    let mut m = TestModule::new();
    let ext = m.builder.add_function();
    {
        let f = m.builder.function_at(ext);
        f.return_type(I32);
        f.add_param(I32);
        f.add_param(I32);
        f.external(true);
        f.name("host_add");
    }
    let caller_body = ret(&call(0, &[&i8c(30), &i8c(12)]));
    m.add_function(I32, &[], &[], &caller_body);

    let mut imports = ImportMap::new();
    imports.insert(
        "host_add".to_string(),
        Rc::new(|args: &[Value]| {
            let (Value::I32(a), Value::I32(b)) = (args[0], args[1]) else {
                return Err(protowasm::Trap::ArgumentMismatch);
            };
            Ok(Some(Value::I32(a + b)))
        }),
    );
    let mut inst = m.instantiate_with(&imports);
    assert_eq!(call_i32(&mut inst, 1, &[]), 42);
}

#[test]
fn missing_external_fails_instantiation() {
    let mut m = TestModule::new();
    let ext = m.builder.add_function();
    {
        let f = m.builder.function_at(ext);
        f.return_type(I32);
        f.external(true);
        f.name("absent");
    }
    let bytes = m.builder.build().unwrap();
    let config = ModuleConfig::default();
    let module = decode_module(&bytes, &config).unwrap();
    let err = instantiate(Arc::new(module), &ImportMap::new(), &EvalBackend, &config).unwrap_err();
    assert!(matches!(err, InstantiateError::UnresolvedExternal { .. }));
}

#[test]
fn exports_by_name_and_memory() {
    let mut m = TestModule::new();
    m.builder.mem_export = true;
    let fi = m.builder.add_function();
    {
        let f = m.builder.function_at(fi);
        f.return_type(I32);
        f.exported(true);
        f.name("answer");
        f.emit(&ret(&i8c(42)));
    }
    let mut inst = m.instantiate();
    assert_eq!(inst.export("memory"), Some(Export::Memory));
    assert_eq!(inst.export("answer"), Some(Export::Function(0)));
    assert_eq!(inst.invoke_export("answer", &[]).unwrap(), Some(Value::I32(42)));
    assert!(matches!(
        inst.invoke_export("memory", &[]),
        Err(protowasm::Trap::NotAFunction(_))
    ));
    assert!(matches!(
        inst.invoke_export("missing", &[]),
        Err(protowasm::Trap::ExportNotFound(_))
    ));
}

#[test]
fn argument_type_checking_at_invoke() {
    let mut inst = instance_for(I32, &[I32], &[], &ret(&get_local(0)));
    assert!(matches!(
        inst.invoke_function(0, &[]),
        Err(protowasm::Trap::ArgumentMismatch)
    ));
    assert!(matches!(
        inst.invoke_function(0, &[Value::F32(0)]),
        Err(protowasm::Trap::ArgumentMismatch)
    ));
}

#[test]
fn globals_area_uses_assigned_offsets() {
    let mut m = TestModule::new();
    m.add_global(MemType::U8);
    m.add_global(MemType::F64); // aligns to 8
    m.add_global(MemType::I16);
    let inst = m.instantiate();
    assert_eq!(inst.module.globals[0].offset, 0);
    assert_eq!(inst.module.globals[1].offset, 8);
    assert_eq!(inst.module.globals[2].offset, 16);
    assert_eq!(inst.globals.len(), 18);
}
