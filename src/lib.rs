//! protowasm: an early-WASM toolchain core.
//!
//! The pipeline is: raw bytes -> bounded reader -> module decoder -> per
//! function a verifying IR-graph builder -> code generator -> placeholder
//! linker -> runnable module instance. A companion emitter lowers a typed
//! asm-style dialect into the same binary format the decoder consumes.

pub mod backend;
pub mod binary;
pub mod builder;
pub mod emitter;
pub mod error;
pub mod instance;
pub mod link;
pub mod module;
pub mod opcodes;
pub mod types;
pub mod verify;

use std::sync::Arc;

pub use backend::eval::EvalBackend;
pub use binary::{decode_module, ModuleConfig};
pub use error::{DecodeError, ErrorKind, InstantiateError, Trap, VerifyError};
pub use instance::{instantiate, ImportMap, ModuleInstance};
pub use module::{FunctionEnv, WasmModule};
pub use types::{FunctionSig, MemType, Value, ValueType};

use thiserror::Error;

/// Failure of the combined decode + instantiate + invoke helper.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Instantiate(#[from] InstantiateError),
    #[error(transparent)]
    Trap(#[from] Trap),
    #[error("module has no exported function")]
    NoExportedFunction,
}

/// Decode a module, instantiate it with the reference backend and no host
/// imports, and invoke its first exported function with no arguments.
/// Returns the i32 result (0 for void functions).
pub fn compile_and_run(bytes: &[u8]) -> Result<i32, RunError> {
    let config = ModuleConfig::default();
    let module = Arc::new(decode_module(bytes, &config)?);
    let mut inst = instantiate(module, &ImportMap::new(), &EvalBackend, &config)?;
    let index = inst.first_exported_function().ok_or(RunError::NoExportedFunction)?;
    match inst.invoke_function(index, &[])? {
        Some(Value::I32(v)) => Ok(v),
        _ => Ok(0),
    }
}
