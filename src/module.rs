//! Module-level data model: global, function, and data-segment descriptors,
//! the decoded module, and the per-function verification environment.

use crate::types::{FunctionSig, MemType, ValueType};

/// A global variable. The offset into the globals area is assigned by
/// [`WasmModule::assign_global_offsets`]; the area itself is an untyped
/// buffer owned by the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WasmGlobal {
    pub name_offset: u32,
    pub mem_type: MemType,
    pub offset: u32,
    pub exported: bool,
}

/// A function descriptor. Code offsets index into the module byte range;
/// locals are counted per value type, ordered i32, i64, f32, f64 after the
/// parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WasmFunction {
    pub sig: FunctionSig,
    pub name_offset: u32,
    pub code_start: u32,
    pub code_end: u32,
    pub local_i32: u16,
    pub local_i64: u16,
    pub local_f32: u16,
    pub local_f64: u16,
    pub exported: bool,
    pub external: bool,
}

/// A data segment; `init` segments are copied into linear memory at
/// instantiation, in order, last write winning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WasmDataSegment {
    pub dest_addr: u32,
    pub source_offset: u32,
    pub source_size: u32,
    pub init: bool,
}

/// A decoded module. Keeps the original bytes for name and code lookup; the
/// module lives from a successful decode until dropped.
#[derive(Debug, Clone, Default)]
pub struct WasmModule {
    pub bytes: Vec<u8>,
    pub mem_size_log2: u8,
    pub mem_export: bool,
    pub globals: Vec<WasmGlobal>,
    pub functions: Vec<WasmFunction>,
    pub data_segments: Vec<WasmDataSegment>,
}

impl WasmModule {
    /// Linear memory size in bytes.
    pub fn mem_size(&self) -> u32 {
        1u32 << self.mem_size_log2
    }

    /// Resolve a name offset to its string. Offset 0 is the unnamed
    /// sentinel (it falls inside the header); otherwise the offset points
    /// at a length-prefixed UTF-8 name in the module bytes.
    pub fn name_at(&self, offset: u32) -> Option<&str> {
        if offset == 0 {
            return None;
        }
        let at = offset as usize;
        let len = *self.bytes.get(at)? as usize;
        let raw = self.bytes.get(at + 1..at + 1 + len)?;
        std::str::from_utf8(raw).ok()
    }

    /// Assign offsets into the globals area: one pass, rounding each global
    /// up to its natural alignment (== its size) and advancing by the size.
    /// Returns the total area size.
    pub fn assign_global_offsets(&mut self) -> u32 {
        let mut offset = 0u32;
        for g in &mut self.globals {
            let size = g.mem_type.size() as u32;
            offset = (offset + size - 1) & !(size - 1);
            g.offset = offset;
            offset += size;
        }
        offset
    }

    /// Size of the globals area implied by the assigned offsets.
    pub fn globals_area_size(&self) -> u32 {
        self.globals
            .iter()
            .map(|g| g.offset + g.mem_type.size() as u32)
            .max()
            .unwrap_or(0)
    }
}

/// Per-function verification context: the signature, the module view, and
/// the local layout. Parameter indices precede locals; locals are grouped
/// i32, then i64, f32, f64.
pub struct FunctionEnv<'a> {
    pub module: Option<&'a WasmModule>,
    pub sig: FunctionSig,
    pub local_i32: u16,
    pub local_i64: u16,
    pub local_f32: u16,
    pub local_f64: u16,
    pub total_locals: u32,
}

impl<'a> FunctionEnv<'a> {
    pub fn new(module: Option<&'a WasmModule>, sig: FunctionSig) -> Self {
        let mut env = Self {
            module,
            sig,
            local_i32: 0,
            local_i64: 0,
            local_f32: 0,
            local_f64: 0,
            total_locals: 0,
        };
        env.sum_locals();
        env
    }

    /// Environment for a decoded function within its module.
    pub fn for_function(module: &'a WasmModule, func: &WasmFunction) -> Self {
        let mut env = Self {
            module: Some(module),
            sig: func.sig.clone(),
            local_i32: func.local_i32,
            local_i64: func.local_i64,
            local_f32: func.local_f32,
            local_f64: func.local_f64,
            total_locals: 0,
        };
        env.sum_locals();
        env
    }

    pub fn sum_locals(&mut self) {
        self.total_locals = self.sig.param_count() as u32
            + self.local_i32 as u32
            + self.local_i64 as u32
            + self.local_f32 as u32
            + self.local_f64 as u32;
    }

    /// Add locals of one type, returning the index of the first new local.
    /// Callers must allocate in type order (i32 before i64 before floats)
    /// for earlier indices to stay stable.
    pub fn add_locals(&mut self, ty: ValueType, count: u16) -> u32 {
        let first = self.total_locals;
        match ty {
            ValueType::I32 => self.local_i32 += count,
            ValueType::I64 => self.local_i64 += count,
            ValueType::F32 => self.local_f32 += count,
            ValueType::F64 => self.local_f64 += count,
            ValueType::Stmt => panic!("stmt is not a local type"),
        }
        self.sum_locals();
        first
    }

    /// The type of local `index`, or `None` when out of range.
    pub fn local_type(&self, index: u32) -> Option<ValueType> {
        let params = self.sig.param_count() as u32;
        if index < params {
            return Some(self.sig.params()[index as usize]);
        }
        let mut base = params;
        for (count, ty) in [
            (self.local_i32 as u32, ValueType::I32),
            (self.local_i64 as u32, ValueType::I64),
            (self.local_f32 as u32, ValueType::F32),
            (self.local_f64 as u32, ValueType::F64),
        ] {
            if index < base + count {
                return Some(ty);
            }
            base += count;
        }
        None
    }
}
