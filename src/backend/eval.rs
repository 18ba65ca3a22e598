//! Reference execution backend.
//!
//! "Code generation" here consumes the IR graph into an [`EvalCode`] object
//! that is executed by a direct walk: blocks run their nodes in order (node
//! order is the effect order), jumps bind block parameters, and direct call
//! sites go through patchable [`CodeHandle`]s so the placeholder-and-patch
//! linker works exactly as it would for machine code.

use crate::error::{BackendError, Trap};
use crate::link::Linker;
use crate::module::WasmGlobal;
use crate::opcodes::Opcode;
use crate::types::{MemType, Value, ValueType};
use crate::verify::graph::{Graph, Node, NodeId, NodeOp, Terminator};

use super::{CallDescriptor, Code, CodeGenerator, CodeHandle};

/// A direct-call fixup: the callee's function index and the handle the call
/// site currently targets. The linker rewrites placeholder handles in place.
pub struct CallTarget {
    pub index: u16,
    pub handle: CodeHandle,
}

impl std::fmt::Debug for CallTarget {
    // The handle is omitted: after linking, a self-call's handle cycles
    // back into this code object.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallTarget").field("index", &self.index).finish()
    }
}

/// Executable form produced by [`EvalBackend`]: the graph it consumed plus
/// the call-site fixup table.
#[derive(Debug)]
pub struct EvalCode {
    pub descriptor: CallDescriptor,
    graph: Graph,
    pub calls: Vec<CallTarget>,
    pub patched: bool,
}

/// The reference code generator.
pub struct EvalBackend;

impl CodeGenerator for EvalBackend {
    fn generate(
        &self,
        graph: Graph,
        descriptor: CallDescriptor,
        linker: &mut Linker,
    ) -> Result<Code, BackendError> {
        let mut calls: Vec<CallTarget> = Vec::new();
        for node in &graph.nodes {
            if let NodeOp::Call(index) = node.op {
                if !calls.iter().any(|c| c.index == index) {
                    calls.push(CallTarget { index, handle: linker.get_function_code(index) });
                }
            }
        }
        Ok(Code::Evaluated(EvalCode { descriptor, graph, calls, patched: false }))
    }
}

/// Mutable view of the instance state a function executes against.
pub struct ExecContext<'a> {
    pub memory: &'a mut [u8],
    pub globals: &'a mut [u8],
    pub globals_table: &'a [WasmGlobal],
}

/// Execute a code object with the given arguments.
pub fn execute(
    code: &Code,
    args: &[Value],
    ctx: &mut ExecContext<'_>,
) -> Result<Option<Value>, Trap> {
    match code {
        Code::Placeholder { index } => {
            panic!("placeholder for function {index} executed; module was not linked")
        }
        Code::Adapter(adapter) => {
            check_args(adapter.sig.params(), args)?;
            (adapter.func)(args)
        }
        Code::Evaluated(ec) => {
            check_args(&ec.descriptor.params, args)?;
            run(ec, args, ctx)
        }
    }
}

fn check_args(params: &[ValueType], args: &[Value]) -> Result<(), Trap> {
    if args.len() != params.len() {
        return Err(Trap::ArgumentMismatch);
    }
    for (arg, &p) in args.iter().zip(params) {
        if arg.ty() != p {
            return Err(Trap::ArgumentMismatch);
        }
    }
    Ok(())
}

fn run(code: &EvalCode, args: &[Value], ctx: &mut ExecContext<'_>) -> Result<Option<Value>, Trap> {
    let g = &code.graph;
    let mut values: Vec<Option<Value>> = vec![None; g.nodes.len()];
    let mut block = g.entry;
    loop {
        let blk = g.block(block);
        for &id in &blk.nodes {
            if let Some(v) = eval_node(code, g.node(id), &values, args, ctx)? {
                values[id as usize] = Some(v);
            }
        }
        match &blk.term {
            Terminator::Jump { target, args: jump_args } => {
                // Read all arguments before binding: on back edges they
                // refer to the parameters being replaced.
                let incoming: Vec<Value> =
                    jump_args.iter().map(|&a| value_of(&values, a)).collect();
                let params = &g.block(*target).params;
                debug_assert_eq!(params.len(), incoming.len());
                for (&p, v) in params.iter().zip(incoming) {
                    values[p as usize] = Some(v);
                }
                block = *target;
            }
            Terminator::Branch { cond, then_blk, else_blk } => {
                let c = as_i32(value_of(&values, *cond));
                block = if c != 0 { *then_blk } else { *else_blk };
            }
            Terminator::Switch { key, cases, default } => {
                let k = as_i32(value_of(&values, *key)) as u32 as usize;
                block = if k < cases.len() { cases[k] } else { *default };
            }
            Terminator::Return { value } => {
                return Ok(value.map(|v| value_of(&values, v)));
            }
            Terminator::None => {
                panic!("execution reached an unterminated block; malformed graph")
            }
        }
    }
}

fn value_of(values: &[Option<Value>], id: NodeId) -> Value {
    values[id as usize].expect("node evaluated before use")
}

fn eval_node(
    code: &EvalCode,
    node: &Node,
    values: &[Option<Value>],
    args: &[Value],
    ctx: &mut ExecContext<'_>,
) -> Result<Option<Value>, Trap> {
    let input = |i: usize| value_of(values, node.inputs[i]);
    Ok(match &node.op {
        NodeOp::Start | NodeOp::EffectPhi | NodeOp::Phi => None,
        NodeOp::Param(i) => Some(args[*i as usize]),
        NodeOp::ConstI32(v) => Some(Value::I32(*v)),
        NodeOp::ConstI64(v) => Some(Value::I64(*v)),
        NodeOp::ConstF32(bits) => Some(Value::F32(*bits)),
        NodeOp::ConstF64(bits) => Some(Value::F64(*bits)),
        NodeOp::Unop(op) => Some(eval_unop(*op, input(0))?),
        NodeOp::Binop(op) => Some(eval_binop(*op, input(0), input(1))?),
        NodeOp::Select => {
            let c = as_i32(input(0));
            Some(if c != 0 { input(1) } else { input(2) })
        }
        NodeOp::LoadGlobal(i) => {
            let g = &ctx.globals_table[*i as usize];
            Some(read_scalar(ctx.globals, g.offset, g.mem_type)?)
        }
        NodeOp::StoreGlobal(i) => {
            let g = &ctx.globals_table[*i as usize];
            write_scalar(ctx.globals, g.offset, g.mem_type, input(0))?;
            None
        }
        NodeOp::LoadMem(mem) => {
            let addr = as_i32(input(0)) as u32;
            Some(read_scalar(ctx.memory, addr, *mem)?)
        }
        NodeOp::StoreMem(mem) => {
            let addr = as_i32(input(0)) as u32;
            write_scalar(ctx.memory, addr, *mem, input(1))?;
            None
        }
        NodeOp::Call(index) => {
            let target = code
                .calls
                .iter()
                .find(|c| c.index == *index)
                .expect("call target collected at generate time");
            let argv: Vec<Value> = node.inputs.iter().map(|&a| value_of(values, a)).collect();
            let callee = target.handle.borrow();
            execute(&callee, &argv, ctx)?
        }
    })
}

/* ----- typed extraction; a verified graph never mismatches ----- */

fn as_i32(v: Value) -> i32 {
    match v {
        Value::I32(x) => x,
        _ => unreachable!("verified graph produced a non-i32"),
    }
}

fn as_i64(v: Value) -> i64 {
    match v {
        Value::I64(x) => x,
        _ => unreachable!("verified graph produced a non-i64"),
    }
}

fn as_f32(v: Value) -> f32 {
    match v {
        Value::F32(bits) => f32::from_bits(bits),
        _ => unreachable!("verified graph produced a non-f32"),
    }
}

fn as_f64(v: Value) -> f64 {
    match v {
        Value::F64(bits) => f64::from_bits(bits),
        _ => unreachable!("verified graph produced a non-f64"),
    }
}

fn bool_i32(b: bool) -> Value {
    Value::I32(b as i32)
}

fn eval_unop(op: Opcode, a: Value) -> Result<Value, Trap> {
    use Opcode::*;
    Ok(match op {
        BoolNot => bool_i32(as_i32(a) == 0),
        F32Abs => Value::from_f32(as_f32(a).abs()),
        F32Neg => Value::from_f32(-as_f32(a)),
        F32Sqrt => Value::from_f32(as_f32(a).sqrt()),
        F64Abs => Value::from_f64(as_f64(a).abs()),
        F64Neg => Value::from_f64(-as_f64(a)),
        F64Sqrt => Value::from_f64(as_f64(a).sqrt()),
        // Float-to-int conversions saturate (host cast semantics).
        I32SConvertF32 => Value::I32(as_f32(a) as i32),
        I32SConvertF64 => Value::I32(as_f64(a) as i32),
        I64SConvertI32 => Value::I64(as_i32(a) as i64),
        F32SConvertI32 => Value::from_f32(as_i32(a) as f32),
        F32ConvertF64 => Value::from_f32(as_f64(a) as f32),
        F64SConvertI32 => Value::from_f64(as_i32(a) as f64),
        F64ConvertF32 => Value::from_f64(as_f32(a) as f64),
        _ => unreachable!("not a unary opcode: {}", op.name()),
    })
}

fn eval_binop(op: Opcode, a: Value, b: Value) -> Result<Value, Trap> {
    use Opcode::*;
    Ok(match op {
        I32Add => Value::I32(as_i32(a).wrapping_add(as_i32(b))),
        I32Sub => Value::I32(as_i32(a).wrapping_sub(as_i32(b))),
        I32Mul => Value::I32(as_i32(a).wrapping_mul(as_i32(b))),
        I32DivS => {
            let (x, y) = (as_i32(a), as_i32(b));
            if y == 0 {
                return Err(Trap::DivByZero);
            }
            if x == i32::MIN && y == -1 {
                return Err(Trap::DivOverflow);
            }
            Value::I32(x / y)
        }
        I32DivU => {
            let (x, y) = (as_i32(a) as u32, as_i32(b) as u32);
            if y == 0 {
                return Err(Trap::DivByZero);
            }
            Value::I32((x / y) as i32)
        }
        I32RemS => {
            let (x, y) = (as_i32(a), as_i32(b));
            if y == 0 {
                return Err(Trap::DivByZero);
            }
            Value::I32(x.wrapping_rem(y))
        }
        I32RemU => {
            let (x, y) = (as_i32(a) as u32, as_i32(b) as u32);
            if y == 0 {
                return Err(Trap::DivByZero);
            }
            Value::I32((x % y) as i32)
        }
        I32And => Value::I32(as_i32(a) & as_i32(b)),
        I32Ior => Value::I32(as_i32(a) | as_i32(b)),
        I32Xor => Value::I32(as_i32(a) ^ as_i32(b)),
        I32Shl => Value::I32(as_i32(a).wrapping_shl(as_i32(b) as u32)),
        I32ShrU => Value::I32(((as_i32(a) as u32).wrapping_shr(as_i32(b) as u32)) as i32),
        I32ShrS => Value::I32(as_i32(a).wrapping_shr(as_i32(b) as u32)),
        I32Eq => bool_i32(as_i32(a) == as_i32(b)),
        I32Ne => bool_i32(as_i32(a) != as_i32(b)),
        I32LtS => bool_i32(as_i32(a) < as_i32(b)),
        I32LeS => bool_i32(as_i32(a) <= as_i32(b)),
        I32LtU => bool_i32((as_i32(a) as u32) < (as_i32(b) as u32)),
        I32LeU => bool_i32((as_i32(a) as u32) <= (as_i32(b) as u32)),
        I32GtS => bool_i32(as_i32(a) > as_i32(b)),
        I32GeS => bool_i32(as_i32(a) >= as_i32(b)),
        I32GtU => bool_i32((as_i32(a) as u32) > (as_i32(b) as u32)),
        I32GeU => bool_i32((as_i32(a) as u32) >= (as_i32(b) as u32)),

        I64Add => Value::I64(as_i64(a).wrapping_add(as_i64(b))),
        I64Sub => Value::I64(as_i64(a).wrapping_sub(as_i64(b))),
        I64Mul => Value::I64(as_i64(a).wrapping_mul(as_i64(b))),
        I64DivS => {
            let (x, y) = (as_i64(a), as_i64(b));
            if y == 0 {
                return Err(Trap::DivByZero);
            }
            if x == i64::MIN && y == -1 {
                return Err(Trap::DivOverflow);
            }
            Value::I64(x / y)
        }
        I64DivU => {
            let (x, y) = (as_i64(a) as u64, as_i64(b) as u64);
            if y == 0 {
                return Err(Trap::DivByZero);
            }
            Value::I64((x / y) as i64)
        }
        I64RemS => {
            let (x, y) = (as_i64(a), as_i64(b));
            if y == 0 {
                return Err(Trap::DivByZero);
            }
            Value::I64(x.wrapping_rem(y))
        }
        I64RemU => {
            let (x, y) = (as_i64(a) as u64, as_i64(b) as u64);
            if y == 0 {
                return Err(Trap::DivByZero);
            }
            Value::I64((x % y) as i64)
        }
        I64And => Value::I64(as_i64(a) & as_i64(b)),
        I64Ior => Value::I64(as_i64(a) | as_i64(b)),
        I64Xor => Value::I64(as_i64(a) ^ as_i64(b)),
        I64Shl => Value::I64(as_i64(a).wrapping_shl(as_i64(b) as u32)),
        I64ShrU => Value::I64(((as_i64(a) as u64).wrapping_shr(as_i64(b) as u32)) as i64),
        I64ShrS => Value::I64(as_i64(a).wrapping_shr(as_i64(b) as u32)),
        I64Eq => bool_i32(as_i64(a) == as_i64(b)),
        I64Ne => bool_i32(as_i64(a) != as_i64(b)),
        I64LtS => bool_i32(as_i64(a) < as_i64(b)),
        I64LeS => bool_i32(as_i64(a) <= as_i64(b)),
        I64LtU => bool_i32((as_i64(a) as u64) < (as_i64(b) as u64)),
        I64LeU => bool_i32((as_i64(a) as u64) <= (as_i64(b) as u64)),
        I64GtS => bool_i32(as_i64(a) > as_i64(b)),
        I64GeS => bool_i32(as_i64(a) >= as_i64(b)),
        I64GtU => bool_i32((as_i64(a) as u64) > (as_i64(b) as u64)),
        I64GeU => bool_i32((as_i64(a) as u64) >= (as_i64(b) as u64)),

        F32Add => Value::from_f32(as_f32(a) + as_f32(b)),
        F32Sub => Value::from_f32(as_f32(a) - as_f32(b)),
        F32Mul => Value::from_f32(as_f32(a) * as_f32(b)),
        F32Div => Value::from_f32(as_f32(a) / as_f32(b)),
        F32Eq => bool_i32(as_f32(a) == as_f32(b)),
        F32Ne => bool_i32(as_f32(a) != as_f32(b)),
        F32Lt => bool_i32(as_f32(a) < as_f32(b)),
        F32Le => bool_i32(as_f32(a) <= as_f32(b)),
        F32Gt => bool_i32(as_f32(a) > as_f32(b)),
        F32Ge => bool_i32(as_f32(a) >= as_f32(b)),

        F64Add => Value::from_f64(as_f64(a) + as_f64(b)),
        F64Sub => Value::from_f64(as_f64(a) - as_f64(b)),
        F64Mul => Value::from_f64(as_f64(a) * as_f64(b)),
        F64Div => Value::from_f64(as_f64(a) / as_f64(b)),
        F64Eq => bool_i32(as_f64(a) == as_f64(b)),
        F64Ne => bool_i32(as_f64(a) != as_f64(b)),
        F64Lt => bool_i32(as_f64(a) < as_f64(b)),
        F64Le => bool_i32(as_f64(a) <= as_f64(b)),
        F64Gt => bool_i32(as_f64(a) > as_f64(b)),
        F64Ge => bool_i32(as_f64(a) >= as_f64(b)),

        _ => unreachable!("not a binary opcode: {}", op.name()),
    })
}

/// Read a global's current value from the globals area.
pub fn read_global(globals: &[u8], g: &WasmGlobal) -> Result<Value, Trap> {
    read_scalar(globals, g.offset, g.mem_type)
}

/* ----- little-endian scalar access with extension/truncation ----- */

fn check_bounds(buf: &[u8], addr: u32, size: u8) -> Result<usize, Trap> {
    let start = addr as usize;
    let end = start
        .checked_add(size as usize)
        .ok_or(Trap::MemoryOutOfBounds { addr, size: size as u32 })?;
    if end > buf.len() {
        return Err(Trap::MemoryOutOfBounds { addr, size: size as u32 });
    }
    Ok(start)
}

fn read_scalar(buf: &[u8], addr: u32, mem: MemType) -> Result<Value, Trap> {
    let i = check_bounds(buf, addr, mem.size())?;
    Ok(match mem {
        MemType::I8 => Value::I32(buf[i] as i8 as i32),
        MemType::U8 => Value::I32(buf[i] as i32),
        MemType::I16 => Value::I32(i16::from_le_bytes([buf[i], buf[i + 1]]) as i32),
        MemType::U16 => Value::I32(u16::from_le_bytes([buf[i], buf[i + 1]]) as i32),
        MemType::I32 | MemType::U32 => {
            Value::I32(u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]) as i32)
        }
        MemType::I64 | MemType::U64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i..i + 8]);
            Value::I64(u64::from_le_bytes(b) as i64)
        }
        MemType::F32 => {
            Value::F32(u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]))
        }
        MemType::F64 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i..i + 8]);
            Value::F64(u64::from_le_bytes(b))
        }
    })
}

fn write_scalar(buf: &mut [u8], addr: u32, mem: MemType, v: Value) -> Result<(), Trap> {
    let i = check_bounds(buf, addr, mem.size())?;
    match mem {
        MemType::I8 | MemType::U8 => buf[i] = as_i32(v) as u8,
        MemType::I16 | MemType::U16 => {
            buf[i..i + 2].copy_from_slice(&(as_i32(v) as u16).to_le_bytes())
        }
        MemType::I32 | MemType::U32 => {
            buf[i..i + 4].copy_from_slice(&(as_i32(v) as u32).to_le_bytes())
        }
        MemType::I64 | MemType::U64 => {
            buf[i..i + 8].copy_from_slice(&(as_i64(v) as u64).to_le_bytes())
        }
        MemType::F32 => match v {
            Value::F32(bits) => buf[i..i + 4].copy_from_slice(&bits.to_le_bytes()),
            _ => unreachable!("verified graph produced a non-f32"),
        },
        MemType::F64 => match v {
            Value::F64(bits) => buf[i..i + 8].copy_from_slice(&bits.to_le_bytes()),
            _ => unreachable!("verified graph produced a non-f64"),
        },
    }
    Ok(())
}
