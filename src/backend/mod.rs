//! Code objects and the code-generator interface.
//!
//! A compiled function is an opaque [`Code`] object behind a shared handle.
//! Direct call sites hold handles; before a callee is compiled they hold a
//! placeholder carrying the callee's function index, which the linker
//! rewrites after all bodies are compiled.

pub mod eval;

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{BackendError, Trap};
use crate::link::Linker;
use crate::types::{FunctionSig, Value, ValueType};
use crate::verify::graph::Graph;
use eval::EvalCode;

/// A host-provided callable backing an `external` function.
pub type HostFunc = dyn Fn(&[Value]) -> Result<Option<Value>, Trap>;

/// Adapter code object wrapping a host function.
pub struct AdapterCode {
    pub sig: FunctionSig,
    pub func: Rc<HostFunc>,
}

impl std::fmt::Debug for AdapterCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterCode").field("sig", &self.sig).finish()
    }
}

/// An executable (or not-yet-executable) code object.
#[derive(Debug)]
pub enum Code {
    /// Stand-in for a function that has not been compiled yet. Carries the
    /// function index it will resolve to; executing one is a linking bug.
    Placeholder { index: u16 },
    /// Output of the reference backend.
    Evaluated(EvalCode),
    /// Host-function adapter for `external` functions.
    Adapter(AdapterCode),
}

impl Code {
    pub fn placeholder_index(&self) -> Option<u16> {
        match self {
            Code::Placeholder { index } => Some(*index),
            _ => None,
        }
    }

    /// Whether the last link pass rewrote any call site in this code.
    /// A real machine backend would flush the instruction cache when set.
    pub fn was_patched(&self) -> bool {
        match self {
            Code::Evaluated(ec) => ec.patched,
            _ => false,
        }
    }
}

/// Shared, patchable handle to a code object. Compilation and linking are
/// single-threaded per module instance.
pub type CodeHandle = Rc<RefCell<Code>>;

pub fn handle(code: Code) -> CodeHandle {
    Rc::new(RefCell::new(code))
}

/// Calling convention summary derived from a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDescriptor {
    pub params: Vec<ValueType>,
    pub ret: ValueType,
}

impl CallDescriptor {
    pub fn for_sig(sig: &FunctionSig) -> Self {
        Self { params: sig.params().to_vec(), ret: sig.ret() }
    }
}

/// The code-generator interface: consumes a verified IR graph and a call
/// descriptor, resolves direct callees through the linker, and returns an
/// executable code object.
pub trait CodeGenerator {
    fn generate(
        &self,
        graph: Graph,
        descriptor: CallDescriptor,
        linker: &mut Linker,
    ) -> Result<Code, BackendError>;
}
