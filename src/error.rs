//! Crate-level error types, one enum per pipeline layer.

use thiserror::Error;

/// Verification failure kinds, latched first-error-wins inside a function
/// body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("unexpected end of bytes")]
    UnexpectedEndOfBytes,
    #[error("unknown opcode")]
    UnknownOpcode,
    #[error("type mismatch")]
    TypeMismatch,
    #[error("local index out of range")]
    LocalIndexOutOfRange,
    #[error("global index out of range")]
    GlobalIndexOutOfRange,
    #[error("function index out of range")]
    FunctionIndexOutOfRange,
    #[error("break depth out of range")]
    BreakDepthOutOfRange,
    #[error("statement expected, value found")]
    StmtExpectedValueFound,
    #[error("value expected, statement found")]
    ValueExpectedStmtFound,
    #[error("offset out of bounds")]
    OffsetOutOfBounds,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid local type")]
    InvalidLocalType,
    #[error("invalid memory access type")]
    InvalidMemType,
}

/// A verification failure: the kind, the byte offset of the offending
/// bytecode (relative to the module origin), and for type mismatches the
/// offset of the construct that established the expected type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyError {
    pub kind: ErrorKind,
    pub pc: u32,
    pub pt: Option<u32>,
}

impl VerifyError {
    pub fn new(kind: ErrorKind, pc: u32) -> Self {
        Self { kind, pc, pt: None }
    }

    pub fn with_pt(kind: ErrorKind, pc: u32, pt: u32) -> Self {
        Self { kind, pc, pt: Some(pt) }
    }
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at pc +{}", self.kind, self.pc)?;
        if let Some(pt) = self.pt {
            write!(f, ", pt +{pt}")?;
        }
        Ok(())
    }
}

impl std::error::Error for VerifyError {}

/// Module decoding failures (header, tables, per-function verification).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("module shorter than minimum size ({size} < {min})")]
    ModuleTooSmall { size: usize, min: usize },

    #[error("module larger than maximum size ({size} > {max})")]
    ModuleTooLarge { size: usize, max: usize },

    #[error("function {index} body larger than maximum size ({size} > {max})")]
    FunctionTooLarge { index: u32, size: usize, max: usize },

    #[error("module truncated at offset {offset}")]
    Truncated { offset: u32 },

    #[error("offset field out of bounds at offset {offset}")]
    OffsetOutOfBounds { offset: u32 },

    #[error("invalid signature at offset {offset}")]
    InvalidSignature { offset: u32 },

    #[error("invalid memory access type at offset {offset}")]
    InvalidMemType { offset: u32 },

    #[error("function {index} failed verification: {source}")]
    Function { index: u32, source: VerifyError },
}

/// Instantiation failures. Surfaced to the embedder with descriptive
/// messages; each step of instantiation is a gate.
#[derive(Debug, Error)]
pub enum InstantiateError {
    #[error("out of memory: wasm memory too large (2^{log2} > 2^{max_log2})")]
    MemoryTooLarge { log2: u8, max_log2: u8 },

    #[error("out of memory: wasm memory")]
    OutOfMemory,

    #[error("data segment {index} writes outside linear memory")]
    DataSegmentOutOfBounds { index: u32 },

    #[error("external function {index} has no name")]
    UnnamedExternal { index: u32 },

    #[error("external function {name:?} is not provided by the embedder")]
    UnresolvedExternal { name: String },

    #[error("function {index} failed verification: {source}")]
    Compile { index: u32, source: VerifyError },

    #[error("code generation failed for function {index}: {source}")]
    Backend { index: u32, source: BackendError },
}

/// Code generator failures.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unsupported graph shape: {0}")]
    Unsupported(&'static str),
}

/// Runtime faults raised while executing compiled code.
#[derive(Debug, Error)]
pub enum Trap {
    #[error("memory access out of bounds (addr {addr}, size {size})")]
    MemoryOutOfBounds { addr: u32, size: u32 },

    #[error("integer division by zero")]
    DivByZero,

    #[error("integer division overflow")]
    DivOverflow,

    #[error("export {0:?} not found")]
    ExportNotFound(String),

    #[error("export {0:?} is not a function")]
    NotAFunction(String),

    #[error("argument count or type does not match the signature")]
    ArgumentMismatch,

    #[error("host function fault: {0}")]
    Host(String),
}
