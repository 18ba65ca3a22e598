//! Module writer: builds the exact binary layout the decoder consumes.
//!
//! Bodies are appended as raw bytecode; the writer computes code offsets,
//! lays out the name region (length-prefixed strings past the tables), and
//! assigns data-segment source offsets.

use thiserror::Error;

use crate::types::{MemType, ValueType};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("too many {0} for a 16-bit count")]
    TooManyEntries(&'static str),

    #[error("name longer than 255 bytes: {0:?}")]
    NameTooLong(String),

    #[error("too many parameters for an 8-bit count")]
    TooManyParams,
}

struct GlobalDecl {
    mem_type: MemType,
    exported: bool,
    name: Option<String>,
}

struct SegmentDecl {
    dest_addr: u32,
    data: Vec<u8>,
}

#[derive(Default)]
pub struct FunctionBuilder {
    params: Vec<ValueType>,
    ret: Option<ValueType>,
    local_i32: u16,
    local_i64: u16,
    local_f32: u16,
    local_f64: u16,
    body: Vec<u8>,
    exported: bool,
    external: bool,
    name: Option<String>,
}

impl FunctionBuilder {
    pub fn return_type(&mut self, ty: ValueType) {
        self.ret = Some(ty);
    }

    /// Add a parameter, returning its local index.
    pub fn add_param(&mut self, ty: ValueType) -> u16 {
        debug_assert!(ty.is_concrete(), "stmt is not a parameter type");
        debug_assert_eq!(
            self.local_i32 + self.local_i64 + self.local_f32 + self.local_f64,
            0,
            "parameters must precede locals"
        );
        self.params.push(ty);
        (self.params.len() - 1) as u16
    }

    /// Add a local, returning its index. Locals must be added grouped in
    /// type order (i32, i64, f32, f64) for earlier indices to stay stable.
    pub fn add_local(&mut self, ty: ValueType) -> u16 {
        let base = self.params.len() as u16;
        match ty {
            ValueType::I32 => {
                debug_assert_eq!(self.local_i64 + self.local_f32 + self.local_f64, 0);
                self.local_i32 += 1;
                base + self.local_i32 - 1
            }
            ValueType::I64 => {
                debug_assert_eq!(self.local_f32 + self.local_f64, 0);
                self.local_i64 += 1;
                base + self.local_i32 + self.local_i64 - 1
            }
            ValueType::F32 => {
                debug_assert_eq!(self.local_f64, 0);
                self.local_f32 += 1;
                base + self.local_i32 + self.local_i64 + self.local_f32 - 1
            }
            ValueType::F64 => {
                self.local_f64 += 1;
                base + self.local_i32 + self.local_i64 + self.local_f32 + self.local_f64 - 1
            }
            ValueType::Stmt => panic!("stmt is not a local type"),
        }
    }

    pub fn exported(&mut self, exported: bool) {
        self.exported = exported;
    }

    pub fn external(&mut self, external: bool) {
        self.external = external;
    }

    pub fn name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    /// Append one byte of body code.
    pub fn byte(&mut self, b: u8) {
        self.body.push(b);
    }

    /// Append raw body bytes.
    pub fn emit(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }
}

pub struct ModuleBuilder {
    pub mem_size_log2: u8,
    pub mem_export: bool,
    globals: Vec<GlobalDecl>,
    functions: Vec<FunctionBuilder>,
    segments: Vec<SegmentDecl>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self {
            mem_size_log2: 16,
            mem_export: false,
            globals: Vec::new(),
            functions: Vec::new(),
            segments: Vec::new(),
        }
    }

    /// Allocate a function slot, returning its index. The body is filled in
    /// through [`ModuleBuilder::function_at`], possibly after other
    /// functions referenced it.
    pub fn add_function(&mut self) -> u16 {
        self.functions.push(FunctionBuilder::default());
        (self.functions.len() - 1) as u16
    }

    pub fn function_at(&mut self, index: u16) -> &mut FunctionBuilder {
        &mut self.functions[index as usize]
    }

    pub fn function_count(&self) -> u16 {
        self.functions.len() as u16
    }

    pub fn add_global(&mut self, mem_type: MemType, exported: bool) -> u16 {
        self.globals.push(GlobalDecl { mem_type, exported, name: None });
        (self.globals.len() - 1) as u16
    }

    pub fn global_name(&mut self, index: u16, name: &str) {
        self.globals[index as usize].name = Some(name.to_string());
    }

    pub fn add_data_segment(&mut self, dest_addr: u32, data: Vec<u8>) {
        self.segments.push(SegmentDecl { dest_addr, data });
    }

    /// Serialize the module.
    pub fn build(&self) -> Result<Vec<u8>, BuildError> {
        if self.globals.len() > u16::MAX as usize {
            return Err(BuildError::TooManyEntries("globals"));
        }
        if self.functions.len() > u16::MAX as usize {
            return Err(BuildError::TooManyEntries("functions"));
        }
        if self.segments.len() > u16::MAX as usize {
            return Err(BuildError::TooManyEntries("data segments"));
        }
        for f in &self.functions {
            if f.params.len() > u8::MAX as usize {
                return Err(BuildError::TooManyParams);
            }
        }

        // Layout pass: header and the three tables, then bodies, then the
        // name region, then data-segment payloads.
        let mut size = 8usize;
        size += self.globals.len() * 6;
        for f in &self.functions {
            size += 2 + f.params.len() + 22;
        }
        size += self.segments.len() * 13;
        let mut code_offsets = Vec::with_capacity(self.functions.len());
        for f in &self.functions {
            code_offsets.push((size as u32, (size + f.body.len()) as u32));
            size += f.body.len();
        }
        let mut name_offset_of = |name: &Option<String>, size: &mut usize| -> Result<u32, BuildError> {
            match name {
                None => Ok(0),
                Some(n) => {
                    if n.len() > u8::MAX as usize {
                        return Err(BuildError::NameTooLong(n.clone()));
                    }
                    let at = *size as u32;
                    *size += 1 + n.len();
                    Ok(at)
                }
            }
        };
        let mut func_names = Vec::with_capacity(self.functions.len());
        for f in &self.functions {
            func_names.push(name_offset_of(&f.name, &mut size)?);
        }
        let mut global_names = Vec::with_capacity(self.globals.len());
        for g in &self.globals {
            global_names.push(name_offset_of(&g.name, &mut size)?);
        }
        let mut segment_offsets = Vec::with_capacity(self.segments.len());
        for s in &self.segments {
            segment_offsets.push(size as u32);
            size += s.data.len();
        }

        // Emit pass.
        let mut out = Vec::with_capacity(size);
        out.push(self.mem_size_log2);
        out.push(self.mem_export as u8);
        out.extend_from_slice(&(self.globals.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.functions.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.segments.len() as u16).to_le_bytes());

        for (g, &name_at) in self.globals.iter().zip(&global_names) {
            out.extend_from_slice(&name_at.to_le_bytes());
            out.push(g.mem_type as u8);
            out.push(g.exported as u8);
        }

        for ((f, &(start, end)), &name_at) in
            self.functions.iter().zip(&code_offsets).zip(&func_names)
        {
            out.push(f.params.len() as u8);
            out.push(f.ret.unwrap_or(ValueType::Stmt) as u8);
            for &p in &f.params {
                out.push(p as u8);
            }
            out.extend_from_slice(&name_at.to_le_bytes());
            out.extend_from_slice(&start.to_le_bytes());
            out.extend_from_slice(&end.to_le_bytes());
            out.extend_from_slice(&f.local_i32.to_le_bytes());
            out.extend_from_slice(&f.local_i64.to_le_bytes());
            out.extend_from_slice(&f.local_f32.to_le_bytes());
            out.extend_from_slice(&f.local_f64.to_le_bytes());
            out.push(f.exported as u8);
            out.push(f.external as u8);
        }

        for (s, &src) in self.segments.iter().zip(&segment_offsets) {
            out.extend_from_slice(&s.dest_addr.to_le_bytes());
            out.extend_from_slice(&src.to_le_bytes());
            out.extend_from_slice(&(s.data.len() as u32).to_le_bytes());
            out.push(1u8);
        }

        for f in &self.functions {
            out.extend_from_slice(&f.body);
        }
        for f in &self.functions {
            if let Some(n) = &f.name {
                out.push(n.len() as u8);
                out.extend_from_slice(n.as_bytes());
            }
        }
        for g in &self.globals {
            if let Some(n) = &g.name {
                out.push(n.len() as u8);
                out.extend_from_slice(n.as_bytes());
            }
        }
        for s in &self.segments {
            out.extend_from_slice(&s.data);
        }

        debug_assert_eq!(out.len(), size);
        Ok(out)
    }
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::{decode_module, ModuleConfig};
    use crate::opcodes::Opcode;

    #[test]
    fn roundtrip_single_function() {
        let mut b = ModuleBuilder::new();
        let fi = b.add_function();
        {
            let f = b.function_at(fi);
            f.return_type(ValueType::I32);
            assert_eq!(f.add_param(ValueType::I32), 0);
            assert_eq!(f.add_local(ValueType::I32), 1);
            f.name("loop");
            f.exported(true);
            f.emit(&[Opcode::Return as u8, Opcode::GetLocal as u8, 0]);
        }
        let bytes = b.build().unwrap();
        let m = decode_module(&bytes, &ModuleConfig::default()).unwrap();
        assert_eq!(m.functions.len(), 1);
        let f = &m.functions[0];
        assert_eq!(f.sig.param_count(), 1);
        assert_eq!(f.local_i32, 1);
        assert!(f.exported);
        assert_eq!(m.name_at(f.name_offset), Some("loop"));
        assert_eq!(
            &m.bytes[f.code_start as usize..f.code_end as usize],
            &[Opcode::Return as u8, Opcode::GetLocal as u8, 0]
        );
    }

    #[test]
    fn roundtrip_globals_and_segments() {
        let mut b = ModuleBuilder::new();
        b.mem_size_log2 = 12;
        b.mem_export = true;
        b.add_global(MemType::F64, true);
        b.add_data_segment(16, vec![1, 2, 3, 4]);
        let bytes = b.build().unwrap();
        let m = decode_module(&bytes, &ModuleConfig::default()).unwrap();
        assert_eq!(m.mem_size_log2, 12);
        assert!(m.mem_export);
        assert_eq!(m.globals.len(), 1);
        assert_eq!(m.globals[0].mem_type, MemType::F64);
        assert_eq!(m.data_segments.len(), 1);
        let seg = &m.data_segments[0];
        assert_eq!(seg.dest_addr, 16);
        assert!(seg.init);
        let src = seg.source_offset as usize;
        assert_eq!(&m.bytes[src..src + 4], &[1, 2, 3, 4]);
    }

    #[test]
    fn local_index_groups() {
        let mut f = FunctionBuilder::default();
        f.add_param(ValueType::I32);
        assert_eq!(f.add_local(ValueType::I32), 1);
        assert_eq!(f.add_local(ValueType::I32), 2);
        assert_eq!(f.add_local(ValueType::F32), 3);
        assert_eq!(f.add_local(ValueType::F64), 4);
    }
}
