//! Module decoder: header, globals table, function table, data segments.
//!
//! Layout (all integers little-endian):
//! header `{ mem_size_log2: u8, mem_export: u8, globals: u16, functions: u16,
//! data_segments: u16 }`, then the three tables in that order. Function
//! entries start with an inline signature `{ param_count: u8, return: u8,
//! params: u8[param_count] }`. Bytes past the tables hold code bodies and
//! names, addressed by the offsets in the entries.

use log::debug;

use super::reader::{Latch, ReadError, Reader};
use crate::error::DecodeError;
use crate::module::{WasmDataSegment, WasmFunction, WasmGlobal, WasmModule};
use crate::types::{FunctionSig, MemType, ValueType};
use crate::verify;

/// Decode-time limits and switches.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    /// Run the verifier over every non-external function body.
    pub verify_functions: bool,
    pub min_module_size: usize,
    pub max_module_size: usize,
    pub max_function_size: usize,
    /// Largest accepted `mem_size_log2`.
    pub max_mem_log2: u8,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            verify_functions: true,
            min_module_size: 8,
            max_module_size: 1024 * 1024,
            max_function_size: 128 * 1024,
            max_mem_log2: 30,
        }
    }
}

fn check_reader(latch: Option<Latch>) -> Result<(), DecodeError> {
    match latch {
        None => Ok(()),
        Some(Latch { code: ReadError::Truncated, pc, .. }) => {
            Err(DecodeError::Truncated { offset: pc })
        }
        Some(Latch { code: ReadError::OffsetOutOfBounds, pc, .. }) => {
            Err(DecodeError::OffsetOutOfBounds { offset: pc })
        }
    }
}

fn read_signature(r: &mut Reader<'_>) -> Result<FunctionSig, DecodeError> {
    let at = r.pc();
    let param_count = r.u8() as usize;
    let ret_byte = r.u8();
    check_reader(r.error())?;
    let ret = ValueType::from_u8(ret_byte)
        .ok_or(DecodeError::InvalidSignature { offset: at })?;
    let mut params = Vec::with_capacity(param_count);
    for _ in 0..param_count {
        let p_at = r.pc();
        let b = r.u8();
        check_reader(r.error())?;
        let p = ValueType::from_u8(b)
            .filter(|p| p.is_concrete())
            .ok_or(DecodeError::InvalidSignature { offset: p_at })?;
        params.push(p);
    }
    Ok(FunctionSig::new(ret, params))
}

/// Decode a module from its raw bytes. Global offsets are assigned before
/// returning; with `verify_functions` set, the first body that fails
/// verification aborts the decode, annotated with its function index.
pub fn decode_module(bytes: &[u8], config: &ModuleConfig) -> Result<WasmModule, DecodeError> {
    if bytes.len() < config.min_module_size {
        return Err(DecodeError::ModuleTooSmall { size: bytes.len(), min: config.min_module_size });
    }
    if bytes.len() > config.max_module_size {
        return Err(DecodeError::ModuleTooLarge { size: bytes.len(), max: config.max_module_size });
    }

    let mut r = Reader::new(bytes);
    let mut module = WasmModule {
        bytes: bytes.to_vec(),
        ..WasmModule::default()
    };

    module.mem_size_log2 = r.u8();
    module.mem_export = r.u8() != 0;
    let globals_count = r.u16();
    let functions_count = r.u16();
    let data_segments_count = r.u16();
    check_reader(r.error())?;
    debug!(
        "module header: mem 2^{}, {} globals, {} functions, {} data segments",
        module.mem_size_log2, globals_count, functions_count, data_segments_count
    );

    for _ in 0..globals_count {
        let name_offset = r.offset_u32();
        let type_at = r.pc();
        let type_byte = r.u8();
        let exported = r.u8() != 0;
        check_reader(r.error())?;
        let mem_type = MemType::from_u8(type_byte)
            .ok_or(DecodeError::InvalidMemType { offset: type_at })?;
        module.globals.push(WasmGlobal { name_offset, mem_type, offset: 0, exported });
    }

    for index in 0..functions_count {
        let sig = read_signature(&mut r)?;
        let name_offset = r.offset_u32();
        let start_at = r.pc();
        let code_start = r.offset_u32();
        let code_end = r.offset_u32();
        let local_i32 = r.u16();
        let local_i64 = r.u16();
        let local_f32 = r.u16();
        let local_f64 = r.u16();
        let exported = r.u8() != 0;
        let external = r.u8() != 0;
        check_reader(r.error())?;
        if code_start > code_end {
            return Err(DecodeError::OffsetOutOfBounds { offset: start_at });
        }
        let body_size = (code_end - code_start) as usize;
        if body_size > config.max_function_size {
            return Err(DecodeError::FunctionTooLarge {
                index: index as u32,
                size: body_size,
                max: config.max_function_size,
            });
        }
        module.functions.push(WasmFunction {
            sig,
            name_offset,
            code_start,
            code_end,
            local_i32,
            local_i64,
            local_f32,
            local_f64,
            exported,
            external,
        });
    }

    for _ in 0..data_segments_count {
        let dest_addr = r.u32();
        let at = r.pc();
        let source_offset = r.offset_u32();
        let source_size = r.u32();
        let init = r.u8() != 0;
        check_reader(r.error())?;
        if source_offset as u64 + source_size as u64 > bytes.len() as u64 {
            return Err(DecodeError::OffsetOutOfBounds { offset: at });
        }
        module.data_segments.push(WasmDataSegment { dest_addr, source_offset, source_size, init });
    }

    module.assign_global_offsets();

    if config.verify_functions {
        for (index, func) in module.functions.iter().enumerate() {
            if func.external {
                continue;
            }
            let env = crate::module::FunctionEnv::for_function(&module, func);
            verify::verify_function(
                &env,
                &module.bytes,
                func.code_start as usize,
                func.code_end as usize,
            )
            .map_err(|source| DecodeError::Function { index: index as u32, source })?;
        }
    }

    Ok(module)
}
