//! Module instantiation and the runtime instance.
//!
//! Instantiation allocates linear memory, applies data segments, allocates
//! the globals area, resolves external functions, compiles everything else
//! in declaration order, runs the link pass, and installs exports. Every
//! step is a failure gate; buffers allocated so far drop with the error.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use log::debug;

use crate::backend::eval::{execute, ExecContext};
use crate::backend::{AdapterCode, Code, CodeGenerator, CodeHandle, CallDescriptor, HostFunc};
use crate::binary::ModuleConfig;
use crate::error::{InstantiateError, Trap};
use crate::link::Linker;
use crate::module::{FunctionEnv, WasmModule};
use crate::types::Value;
use crate::verify;

/// Host functions backing `external` functions, by name.
pub type ImportMap = HashMap<String, Rc<HostFunc>>;

/// What an export name resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Export {
    Function(u16),
    Memory,
}

#[derive(Debug)]
pub struct ModuleInstance {
    pub module: Arc<WasmModule>,
    pub memory: Vec<u8>,
    pub globals: Vec<u8>,
    code: Vec<CodeHandle>,
    exports: HashMap<String, Export>,
}

/// Instantiate a decoded module.
pub fn instantiate(
    module: Arc<WasmModule>,
    imports: &ImportMap,
    backend: &dyn CodeGenerator,
    config: &ModuleConfig,
) -> Result<ModuleInstance, InstantiateError> {
    // 1. Memory size gate.
    if module.mem_size_log2 > config.max_mem_log2 {
        return Err(InstantiateError::MemoryTooLarge {
            log2: module.mem_size_log2,
            max_log2: config.max_mem_log2,
        });
    }

    // 2. Zeroed linear memory.
    let mem_size = module.mem_size() as usize;
    let mut memory = Vec::new();
    memory
        .try_reserve_exact(mem_size)
        .map_err(|_| InstantiateError::OutOfMemory)?;
    memory.resize(mem_size, 0);

    // 3. Data segments, in order; later writes win.
    for (index, seg) in module.data_segments.iter().enumerate() {
        if !seg.init {
            continue;
        }
        if seg.dest_addr as u64 + seg.source_size as u64 > mem_size as u64 {
            return Err(InstantiateError::DataSegmentOutOfBounds { index: index as u32 });
        }
        let dest = seg.dest_addr as usize;
        let size = seg.source_size as usize;
        let src = seg.source_offset as usize;
        memory[dest..dest + size].copy_from_slice(&module.bytes[src..src + size]);
    }

    // 4. Zeroed globals area (offsets were assigned at decode time).
    let globals = vec![0u8; module.globals_area_size() as usize];

    // 5–6. Resolve externals, compile the rest, install into the code table.
    let mut linker = Linker::new(module.functions.len());
    for (i, func) in module.functions.iter().enumerate() {
        let index = i as u16;
        if func.external {
            let name = module
                .name_at(func.name_offset)
                .ok_or(InstantiateError::UnnamedExternal { index: i as u32 })?;
            let host = imports
                .get(name)
                .ok_or_else(|| InstantiateError::UnresolvedExternal { name: name.to_string() })?;
            linker.finish(
                index,
                Code::Adapter(AdapterCode { sig: func.sig.clone(), func: host.clone() }),
            );
        } else {
            let env = FunctionEnv::for_function(&module, func);
            let graph = verify::verify_function(
                &env,
                &module.bytes,
                func.code_start as usize,
                func.code_end as usize,
            )
            .map_err(|source| InstantiateError::Compile { index: i as u32, source })?;
            let descriptor = CallDescriptor::for_sig(&func.sig);
            let code = backend
                .generate(graph, descriptor, &mut linker)
                .map_err(|source| InstantiateError::Backend { index: i as u32, source })?;
            linker.finish(index, code);
            debug!("compiled function {i}");
        }
    }

    // 7. Patch direct calls.
    linker.link();

    // 8. Exports.
    let mut exports = HashMap::new();
    for (i, func) in module.functions.iter().enumerate() {
        if func.exported {
            if let Some(name) = module.name_at(func.name_offset) {
                exports.insert(name.to_string(), Export::Function(i as u16));
            }
        }
    }
    if module.mem_export {
        exports.insert("memory".to_string(), Export::Memory);
    }

    let code = (0..module.functions.len() as u16)
        .map(|i| linker.finished_code(i).expect("every function compiled or adapted"))
        .collect();

    Ok(ModuleInstance { module, memory, globals, code, exports })
}

impl ModuleInstance {
    pub fn export(&self, name: &str) -> Option<Export> {
        self.exports.get(name).copied()
    }

    /// The first exported function in declaration order, if any.
    pub fn first_exported_function(&self) -> Option<u16> {
        self.module
            .functions
            .iter()
            .position(|f| f.exported)
            .map(|i| i as u16)
    }

    /// Invoke an export by name.
    pub fn invoke_export(&mut self, name: &str, args: &[Value]) -> Result<Option<Value>, Trap> {
        match self.exports.get(name) {
            Some(Export::Function(index)) => self.invoke_function(*index, args),
            Some(Export::Memory) => Err(Trap::NotAFunction(name.to_string())),
            None => Err(Trap::ExportNotFound(name.to_string())),
        }
    }

    /// Invoke a function by its index in the module's function table.
    pub fn invoke_function(&mut self, index: u16, args: &[Value]) -> Result<Option<Value>, Trap> {
        let handle = self.code[index as usize].clone();
        let mut ctx = ExecContext {
            memory: &mut self.memory,
            globals: &mut self.globals,
            globals_table: &self.module.globals,
        };
        let code = handle.borrow();
        execute(&code, args, &mut ctx)
    }

    /// Read a global's current value (test and embedder convenience).
    pub fn global_value(&self, index: u16) -> Option<Value> {
        let g = self.module.globals.get(index as usize)?;
        crate::backend::eval::read_global(&self.globals, g).ok()
    }
}
