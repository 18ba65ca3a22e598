//! Bytecode emitter: lowers a typed AST of a restricted asm-style dialect
//! into the binary module format.
//!
//! Every expression carries an inferred type class (signed, unsigned, f32,
//! f64); arithmetic and comparison opcodes are chosen by the pair of the
//! operand class and the operator token. Functions are allocated module
//! indices on first reference, so mutually recursive calls lower without a
//! separate pass. A stack of `(label, is_loop)` entries tracks the relative
//! depth for `break` and `continue`.

use std::collections::HashMap;

use thiserror::Error;

use crate::builder::{BuildError, ModuleBuilder};
use crate::opcodes::Opcode;
use crate::types::ValueType;

/// Inferred type class of an asm-dialect expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    Signed,
    Unsigned,
    Float,
    Double,
}

impl TypeClass {
    pub fn value_type(self) -> ValueType {
        match self {
            TypeClass::Signed | TypeClass::Unsigned => ValueType::I32,
            TypeClass::Float => ValueType::F32,
            TypeClass::Double => ValueType::F64,
        }
    }

    fn is_int(self) -> bool {
        matches!(self, TypeClass::Signed | TypeClass::Unsigned)
    }
}

/// Binary operator tokens of the dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Sar,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
pub enum AsmExpr {
    Int(i32),
    Uint(u32),
    Float(f32),
    Double(f64),
    Var(String),
    Assign(String, Box<AsmExpr>),
    Call(String, Vec<AsmExpr>),
    Not(Box<AsmExpr>),
    Binary(AsmOp, Box<AsmExpr>, Box<AsmExpr>),
    Ternary(Box<AsmExpr>, Box<AsmExpr>, Box<AsmExpr>),
    Comma(Box<AsmExpr>, Box<AsmExpr>),
}

#[derive(Debug, Clone)]
pub enum AsmStmt {
    Expr(AsmExpr),
    Block(Vec<AsmStmt>),
    If(AsmExpr, Box<AsmStmt>, Option<Box<AsmStmt>>),
    While(AsmExpr, Box<AsmStmt>),
    Break,
    Continue,
    Return(Option<AsmExpr>),
}

#[derive(Debug, Clone)]
pub struct AsmFunction {
    pub name: String,
    pub params: Vec<(String, TypeClass)>,
    pub ret: Option<TypeClass>,
    pub locals: Vec<(String, TypeClass)>,
    pub body: Vec<AsmStmt>,
    pub exported: bool,
}

#[derive(Debug, Clone)]
pub struct AsmModule {
    pub mem_size_log2: u8,
    pub mem_export: bool,
    pub functions: Vec<AsmFunction>,
}

impl Default for AsmModule {
    fn default() -> Self {
        Self { mem_size_log2: 16, mem_export: false, functions: Vec::new() }
    }
}

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("unknown variable {0:?}")]
    UnknownVariable(String),

    #[error("unknown function {0:?}")]
    UnknownFunction(String),

    #[error("duplicate variable {0:?}")]
    DuplicateVariable(String),

    #[error("duplicate function {0:?}")]
    DuplicateFunction(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(&'static str),

    #[error("unsupported construct: {0}")]
    Unsupported(&'static str),

    #[error("index does not fit the single-byte bytecode encoding")]
    IndexTooWide,

    #[error("break or continue outside a loop")]
    BadBreak,

    #[error("more than 255 statements in one block")]
    TooManyStatements,

    #[error("wrong argument count in call to {0:?}")]
    ArgumentCount(String),

    #[error(transparent)]
    Build(#[from] BuildError),
}

/// Lower a whole module to the binary format.
pub fn emit_module(module: &AsmModule) -> Result<Vec<u8>, EmitError> {
    let mut em = Emitter {
        module,
        builder: ModuleBuilder::new(),
        func_indices: HashMap::new(),
        defined: std::collections::HashSet::new(),
        cur: 0,
        cur_ret: None,
        locals: HashMap::new(),
        breakables: Vec::new(),
    };
    em.builder.mem_size_log2 = module.mem_size_log2;
    em.builder.mem_export = module.mem_export;
    for f in &module.functions {
        em.emit_function(f)?;
    }
    Ok(em.builder.build()?)
}

struct Emitter<'a> {
    module: &'a AsmModule,
    builder: ModuleBuilder,
    func_indices: HashMap<String, u16>,
    defined: std::collections::HashSet<String>,
    cur: u16,
    cur_ret: Option<TypeClass>,
    locals: HashMap<String, (u16, TypeClass)>,
    /// One entry per emitted label; `true` marks loops.
    breakables: Vec<bool>,
}

impl<'a> Emitter<'a> {
    fn lookup_or_insert_function(&mut self, name: &str) -> u16 {
        if let Some(&i) = self.func_indices.get(name) {
            return i;
        }
        let i = self.builder.add_function();
        self.func_indices.insert(name.to_string(), i);
        i
    }

    fn declared(&self, name: &str) -> Result<&'a AsmFunction, EmitError> {
        self.module
            .functions
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| EmitError::UnknownFunction(name.to_string()))
    }

    fn push_op(&mut self, op: Opcode) {
        self.builder.function_at(self.cur).byte(op as u8);
    }

    fn push_byte(&mut self, b: u8) {
        self.builder.function_at(self.cur).byte(b);
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.builder.function_at(self.cur).emit(bytes);
    }

    fn emit_function(&mut self, f: &AsmFunction) -> Result<(), EmitError> {
        if !self.defined.insert(f.name.clone()) {
            return Err(EmitError::DuplicateFunction(f.name.clone()));
        }
        let index = self.lookup_or_insert_function(&f.name);
        self.cur = index;
        self.cur_ret = f.ret;
        self.locals.clear();
        self.breakables.clear();

        {
            let fb = self.builder.function_at(index);
            fb.return_type(f.ret.map_or(ValueType::Stmt, TypeClass::value_type));
            fb.name(&f.name);
            fb.exported(f.exported);
        }
        for (name, class) in &f.params {
            let idx = self.builder.function_at(index).add_param(class.value_type());
            if self.locals.insert(name.clone(), (idx, *class)).is_some() {
                return Err(EmitError::DuplicateVariable(name.clone()));
            }
        }
        // Locals go into the body grouped by value type, i32 first.
        for want in [ValueType::I32, ValueType::F32, ValueType::F64] {
            for (name, class) in &f.locals {
                if class.value_type() != want {
                    continue;
                }
                let idx = self.builder.function_at(index).add_local(want);
                if self.locals.insert(name.clone(), (idx, *class)).is_some() {
                    return Err(EmitError::DuplicateVariable(name.clone()));
                }
            }
        }
        self.emit_statements(&f.body)
    }

    fn emit_statements(&mut self, stmts: &[AsmStmt]) -> Result<(), EmitError> {
        if stmts.len() > u8::MAX as usize {
            return Err(EmitError::TooManyStatements);
        }
        self.push_op(Opcode::Block);
        self.push_byte(stmts.len() as u8);
        self.breakables.push(false);
        for s in stmts {
            self.emit_stmt(s)?;
        }
        self.breakables.pop();
        Ok(())
    }

    fn emit_stmt(&mut self, stmt: &AsmStmt) -> Result<(), EmitError> {
        match stmt {
            AsmStmt::Expr(e) => {
                self.emit_expr(e)?;
                Ok(())
            }
            AsmStmt::Block(stmts) => self.emit_statements(stmts),
            AsmStmt::If(cond, then, els) => {
                self.push_op(if els.is_some() { Opcode::IfThen } else { Opcode::If });
                self.emit_int_expr(cond)?;
                self.emit_stmt(then)?;
                if let Some(e) = els {
                    self.emit_stmt(e)?;
                }
                Ok(())
            }
            AsmStmt::While(cond, body) => {
                // while (c) body  =>  loop(2) { if (!c) break 0; body }
                self.push_op(Opcode::Loop);
                self.push_byte(2);
                self.breakables.push(true);
                self.push_op(Opcode::If);
                self.push_op(Opcode::BoolNot);
                self.emit_int_expr(cond)?;
                self.push_op(Opcode::Break);
                self.push_byte(0);
                self.emit_stmt(body)?;
                self.breakables.pop();
                Ok(())
            }
            AsmStmt::Break => {
                let depth = self.loop_depth()?;
                self.push_op(Opcode::Break);
                self.push_byte(depth);
                Ok(())
            }
            AsmStmt::Continue => {
                let depth = self.loop_depth()?;
                self.push_op(Opcode::Continue);
                self.push_byte(depth);
                Ok(())
            }
            AsmStmt::Return(expr) => {
                self.push_op(Opcode::Return);
                match (expr, self.cur_ret) {
                    (Some(e), Some(ret)) => {
                        let class = self.emit_value_expr(e)?;
                        if !compatible(class, ret) {
                            return Err(EmitError::TypeMismatch("return value"));
                        }
                        Ok(())
                    }
                    (None, None) => Ok(()),
                    _ => Err(EmitError::TypeMismatch("return arity")),
                }
            }
        }
    }

    /// Relative depth of the innermost loop label.
    fn loop_depth(&self) -> Result<u8, EmitError> {
        let depth = self
            .breakables
            .iter()
            .rev()
            .position(|&is_loop| is_loop)
            .ok_or(EmitError::BadBreak)?;
        u8::try_from(depth).map_err(|_| EmitError::IndexTooWide)
    }

    /// Emit an expression; `None` marks a call to a void function.
    fn emit_expr(&mut self, expr: &AsmExpr) -> Result<Option<TypeClass>, EmitError> {
        match expr {
            AsmExpr::Int(v) => {
                self.push_op(Opcode::I32Const);
                self.push_bytes(&v.to_le_bytes());
                Ok(Some(TypeClass::Signed))
            }
            AsmExpr::Uint(v) => {
                self.push_op(Opcode::I32Const);
                self.push_bytes(&v.to_le_bytes());
                Ok(Some(TypeClass::Unsigned))
            }
            AsmExpr::Float(v) => {
                self.push_op(Opcode::F32Const);
                self.push_bytes(&v.to_bits().to_le_bytes());
                Ok(Some(TypeClass::Float))
            }
            AsmExpr::Double(v) => {
                self.push_op(Opcode::F64Const);
                self.push_bytes(&v.to_bits().to_le_bytes());
                Ok(Some(TypeClass::Double))
            }
            AsmExpr::Var(name) => {
                let (idx, class) = self.local(name)?;
                self.push_op(Opcode::GetLocal);
                self.push_byte(byte_index(idx)?);
                Ok(Some(class))
            }
            AsmExpr::Assign(name, value) => {
                let (idx, class) = self.local(name)?;
                self.push_op(Opcode::SetLocal);
                self.push_byte(byte_index(idx)?);
                let vc = self.emit_value_expr(value)?;
                if !compatible(vc, class) {
                    return Err(EmitError::TypeMismatch("assignment"));
                }
                Ok(Some(class))
            }
            AsmExpr::Call(name, args) => {
                let callee = self.declared(name)?;
                if args.len() != callee.params.len() {
                    return Err(EmitError::ArgumentCount(name.clone()));
                }
                let index = self.lookup_or_insert_function(name);
                self.push_op(Opcode::CallFunction);
                self.push_byte(byte_index(index)?);
                for (arg, (_, pclass)) in args.iter().zip(&callee.params) {
                    let ac = self.emit_value_expr(arg)?;
                    if !compatible(ac, *pclass) {
                        return Err(EmitError::TypeMismatch("call argument"));
                    }
                }
                Ok(callee.ret)
            }
            AsmExpr::Not(e) => {
                self.push_op(Opcode::BoolNot);
                let class = self.emit_value_expr(e)?;
                if !class.is_int() {
                    return Err(EmitError::TypeMismatch("logical not on a float"));
                }
                Ok(Some(TypeClass::Signed))
            }
            AsmExpr::Binary(op, l, r) => {
                let class = self.binary_operand_class(*op, l, r)?;
                self.push_op(binop_opcode(*op, class)?);
                self.emit_value_expr(l)?;
                self.emit_value_expr(r)?;
                Ok(Some(if is_compare(*op) { TypeClass::Signed } else { class }))
            }
            AsmExpr::Ternary(c, t, e) => {
                self.push_op(Opcode::Ternary);
                self.emit_int_expr(c)?;
                let tc = self.emit_value_expr(t)?;
                let ec = self.emit_value_expr(e)?;
                if !compatible(tc, ec) {
                    return Err(EmitError::TypeMismatch("ternary arms"));
                }
                Ok(Some(tc))
            }
            AsmExpr::Comma(a, b) => {
                self.push_op(Opcode::Comma);
                self.emit_expr(a)?;
                let class = self.emit_value_expr(b)?;
                Ok(Some(class))
            }
        }
    }

    fn emit_value_expr(&mut self, expr: &AsmExpr) -> Result<TypeClass, EmitError> {
        self.emit_expr(expr)?
            .ok_or(EmitError::TypeMismatch("void call used as a value"))
    }

    fn emit_int_expr(&mut self, expr: &AsmExpr) -> Result<(), EmitError> {
        let class = self.emit_value_expr(expr)?;
        if !class.is_int() {
            return Err(EmitError::TypeMismatch("condition must be an int"));
        }
        Ok(())
    }

    fn local(&self, name: &str) -> Result<(u16, TypeClass), EmitError> {
        self.locals
            .get(name)
            .copied()
            .ok_or_else(|| EmitError::UnknownVariable(name.to_string()))
    }

    /// The operand class a binary operator works at, resolved from both
    /// sides. Sign-insensitive operators allow mixing signed and unsigned
    /// ints; everything else requires the classes to agree.
    fn binary_operand_class(
        &self,
        op: AsmOp,
        l: &AsmExpr,
        r: &AsmExpr,
    ) -> Result<TypeClass, EmitError> {
        let lc = self
            .class_of(l)?
            .ok_or(EmitError::TypeMismatch("void call used as a value"))?;
        let rc = self
            .class_of(r)?
            .ok_or(EmitError::TypeMismatch("void call used as a value"))?;
        if lc == rc {
            return Ok(lc);
        }
        if ignore_sign(op) && lc.is_int() && rc.is_int() {
            return Ok(lc);
        }
        Err(EmitError::TypeMismatch("binary operand classes differ"))
    }

    /// Pure type inference, used where the opcode must be chosen before the
    /// operands are emitted.
    fn class_of(&self, expr: &AsmExpr) -> Result<Option<TypeClass>, EmitError> {
        Ok(match expr {
            AsmExpr::Int(_) => Some(TypeClass::Signed),
            AsmExpr::Uint(_) => Some(TypeClass::Unsigned),
            AsmExpr::Float(_) => Some(TypeClass::Float),
            AsmExpr::Double(_) => Some(TypeClass::Double),
            AsmExpr::Var(name) | AsmExpr::Assign(name, _) => Some(self.local(name)?.1),
            AsmExpr::Call(name, _) => self.declared(name)?.ret,
            AsmExpr::Not(_) => Some(TypeClass::Signed),
            AsmExpr::Binary(op, l, r) => {
                if is_compare(*op) {
                    Some(TypeClass::Signed)
                } else {
                    Some(self.binary_operand_class(*op, l, r)?)
                }
            }
            AsmExpr::Ternary(_, t, _) => self.class_of(t)?,
            AsmExpr::Comma(_, b) => self.class_of(b)?,
        })
    }
}

fn byte_index(index: u16) -> Result<u8, EmitError> {
    u8::try_from(index).map_err(|_| EmitError::IndexTooWide)
}

fn compatible(a: TypeClass, b: TypeClass) -> bool {
    a == b || (a.is_int() && b.is_int())
}

fn is_compare(op: AsmOp) -> bool {
    matches!(op, AsmOp::Eq | AsmOp::Ne | AsmOp::Lt | AsmOp::Le | AsmOp::Gt | AsmOp::Ge)
}

fn ignore_sign(op: AsmOp) -> bool {
    matches!(
        op,
        AsmOp::Add
            | AsmOp::Sub
            | AsmOp::Mul
            | AsmOp::BitAnd
            | AsmOp::BitOr
            | AsmOp::BitXor
            | AsmOp::Shl
            | AsmOp::Sar
            | AsmOp::Shr
    )
}

fn binop_opcode(op: AsmOp, class: TypeClass) -> Result<Opcode, EmitError> {
    use Opcode::*;
    use TypeClass::*;
    Ok(match (op, class) {
        (AsmOp::Add, Signed | Unsigned) => I32Add,
        (AsmOp::Add, Float) => F32Add,
        (AsmOp::Add, Double) => F64Add,
        (AsmOp::Sub, Signed | Unsigned) => I32Sub,
        (AsmOp::Sub, Float) => F32Sub,
        (AsmOp::Sub, Double) => F64Sub,
        (AsmOp::Mul, Signed | Unsigned) => I32Mul,
        (AsmOp::Mul, Float) => F32Mul,
        (AsmOp::Mul, Double) => F64Mul,
        (AsmOp::Div, Signed) => I32DivS,
        (AsmOp::Div, Unsigned) => I32DivU,
        (AsmOp::Div, Float) => F32Div,
        (AsmOp::Div, Double) => F64Div,
        (AsmOp::Mod, Signed) => I32RemS,
        (AsmOp::Mod, Unsigned) => I32RemU,
        (AsmOp::Mod, _) => return Err(EmitError::Unsupported("float modulus")),
        (AsmOp::BitAnd, Signed | Unsigned) => I32And,
        (AsmOp::BitOr, Signed | Unsigned) => I32Ior,
        (AsmOp::BitXor, Signed | Unsigned) => I32Xor,
        (AsmOp::Shl, Signed | Unsigned) => I32Shl,
        (AsmOp::Sar, Signed | Unsigned) => I32ShrS,
        (AsmOp::Shr, Signed | Unsigned) => I32ShrU,
        (AsmOp::BitAnd | AsmOp::BitOr | AsmOp::BitXor | AsmOp::Shl | AsmOp::Sar | AsmOp::Shr, _) => {
            return Err(EmitError::Unsupported("bitwise operator on a float"))
        }
        (AsmOp::Eq, Signed | Unsigned) => I32Eq,
        (AsmOp::Eq, Float) => F32Eq,
        (AsmOp::Eq, Double) => F64Eq,
        (AsmOp::Ne, Signed | Unsigned) => I32Ne,
        (AsmOp::Ne, Float) => F32Ne,
        (AsmOp::Ne, Double) => F64Ne,
        (AsmOp::Lt, Signed) => I32LtS,
        (AsmOp::Lt, Unsigned) => I32LtU,
        (AsmOp::Lt, Float) => F32Lt,
        (AsmOp::Lt, Double) => F64Lt,
        (AsmOp::Le, Signed) => I32LeS,
        (AsmOp::Le, Unsigned) => I32LeU,
        (AsmOp::Le, Float) => F32Le,
        (AsmOp::Le, Double) => F64Le,
        (AsmOp::Gt, Signed) => I32GtS,
        (AsmOp::Gt, Unsigned) => I32GtU,
        (AsmOp::Gt, Float) => F32Gt,
        (AsmOp::Gt, Double) => F64Gt,
        (AsmOp::Ge, Signed) => I32GeS,
        (AsmOp::Ge, Unsigned) => I32GeU,
        (AsmOp::Ge, Float) => F32Ge,
        (AsmOp::Ge, Double) => F64Ge,
    })
}
