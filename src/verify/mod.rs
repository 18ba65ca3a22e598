//! Single-pass function verifier and IR graph builder.
//!
//! One recursive-descent walk over the bytecode both type-checks the body
//! and constructs the typed IR graph. Labels are a stack of `(label,
//! is_loop)` entries; forward merges create phis only for locals whose
//! definitions differ across predecessors, while loop headers start with
//! phis for every local and drop the ones whose back-edge value never
//! diverges from the entry value. Code after a terminator is still decoded
//! and typed, into a detached block nothing jumps to.

pub mod graph;

use std::collections::HashMap;

use log::trace;

use crate::binary::Reader;
use crate::error::{ErrorKind, VerifyError};
use crate::module::FunctionEnv;
use crate::opcodes::{load_store_value_type, Opcode};
use crate::types::{MemType, ValueType};
use graph::{BlockId, Graph, Node, NodeId, NodeOp, Terminator};

type VResult<T> = Result<T, VerifyError>;

/// A typed expression result: the value's type, its node (absent for void
/// expressions such as calls to void functions), and the opcode position
/// for diagnostics.
#[derive(Debug, Clone, Copy)]
struct TypedVal {
    ty: ValueType,
    node: Option<NodeId>,
    pc: u32,
}

/// One incoming edge of a pending merge: the predecessor block (left
/// unterminated until the merge seals) and its environment snapshot.
struct Pred {
    block: BlockId,
    locals: Vec<NodeId>,
    effect: NodeId,
}

#[derive(Default)]
struct Merge {
    preds: Vec<Pred>,
}

struct LoopHeader {
    block: BlockId,
    params: Vec<NodeId>,
    effect_param: NodeId,
    entry_args: Vec<NodeId>,
    entry_effect: NodeId,
    /// Back-edge snapshots: (phi arguments, effect at the back edge).
    backedges: Vec<(Vec<NodeId>, NodeId)>,
}

struct Label {
    is_loop: bool,
    exit: Merge,
    header: Option<LoopHeader>,
}

/// Verify the body at `[pc_start, pc_end)` of `bytes` against the function
/// environment, producing the IR graph on success.
pub fn verify_function(
    env: &FunctionEnv<'_>,
    bytes: &[u8],
    pc_start: usize,
    pc_end: usize,
) -> Result<Graph, VerifyError> {
    if env.sig.params().iter().any(|p| !p.is_concrete()) {
        return Err(VerifyError::new(ErrorKind::InvalidLocalType, pc_start as u32));
    }
    let mut b = Builder::new(env, bytes, pc_start, pc_end);
    b.build()?;
    trace!(
        "verified body [{pc_start}, {pc_end}): {} nodes, {} blocks",
        b.g.nodes.len(),
        b.g.blocks.len()
    );
    Ok(b.g)
}

struct Builder<'a, 'm> {
    env: &'a FunctionEnv<'m>,
    r: Reader<'a>,
    pc_start: u32,
    pc_end: u32,
    g: Graph,
    block: BlockId,
    locals: Vec<NodeId>,
    effect: NodeId,
    reachable: bool,
    labels: Vec<Label>,
}

impl<'a, 'm> Builder<'a, 'm> {
    fn new(env: &'a FunctionEnv<'m>, bytes: &'a [u8], pc_start: usize, pc_end: usize) -> Self {
        let mut g = Graph::new();
        let entry = g.entry;
        let start = g.add_node(Node {
            op: NodeOp::Start,
            ty: ValueType::Stmt,
            inputs: vec![],
            effect: None,
        });
        g.block_mut(entry).nodes.push(start);

        let mut locals = Vec::with_capacity(env.total_locals as usize);
        for (i, &ty) in env.sig.params().iter().enumerate() {
            let id = g.add_node(Node {
                op: NodeOp::Param(i as u16),
                ty,
                inputs: vec![],
                effect: None,
            });
            g.block_mut(entry).nodes.push(id);
            locals.push(id);
        }
        // Non-parameter locals start as zero; one shared constant per type.
        let mut zeros: HashMap<ValueType, NodeId> = HashMap::new();
        for i in env.sig.param_count() as u32..env.total_locals {
            let ty = env.local_type(i).expect("local in range");
            let id = *zeros.entry(ty).or_insert_with(|| {
                let op = match ty {
                    ValueType::I32 => NodeOp::ConstI32(0),
                    ValueType::I64 => NodeOp::ConstI64(0),
                    ValueType::F32 => NodeOp::ConstF32(0),
                    ValueType::F64 => NodeOp::ConstF64(0),
                    ValueType::Stmt => unreachable!("locals are concrete"),
                };
                let id = g.add_node(Node { op, ty, inputs: vec![], effect: None });
                g.block_mut(entry).nodes.push(id);
                id
            });
            locals.push(id);
        }

        Self {
            env,
            r: Reader::with_range(bytes, pc_start, pc_end),
            pc_start: pc_start as u32,
            pc_end: pc_end as u32,
            g,
            block: entry,
            locals,
            effect: start,
            reachable: true,
            labels: Vec::new(),
        }
    }

    /* ----- byte reading ----- */

    fn imm_u8(&mut self) -> VResult<u8> {
        let pc = self.r.pc();
        let v = self.r.u8();
        if !self.r.ok() {
            return Err(VerifyError::new(ErrorKind::UnexpectedEndOfBytes, pc));
        }
        Ok(v)
    }

    fn imm_u32(&mut self) -> VResult<u32> {
        let pc = self.r.pc();
        let v = self.r.u32();
        if !self.r.ok() {
            return Err(VerifyError::new(ErrorKind::UnexpectedEndOfBytes, pc));
        }
        Ok(v)
    }

    fn imm_u64(&mut self) -> VResult<u64> {
        let pc = self.r.pc();
        let v = self.r.u64();
        if !self.r.ok() {
            return Err(VerifyError::new(ErrorKind::UnexpectedEndOfBytes, pc));
        }
        Ok(v)
    }

    fn opcode(&mut self) -> VResult<(Opcode, u32)> {
        let pc = self.r.pc();
        let b = self.imm_u8()?;
        let op = Opcode::from_u8(b).ok_or(VerifyError::new(ErrorKind::UnknownOpcode, pc))?;
        Ok((op, pc))
    }

    /* ----- graph construction ----- */

    fn add_pure(&mut self, op: NodeOp, ty: ValueType, inputs: Vec<NodeId>) -> NodeId {
        let id = self.g.add_node(Node { op, ty, inputs, effect: None });
        self.g.block_mut(self.block).nodes.push(id);
        id
    }

    fn add_effectful(&mut self, op: NodeOp, ty: ValueType, inputs: Vec<NodeId>) -> NodeId {
        let id = self.g.add_node(Node { op, ty, inputs, effect: Some(self.effect) });
        self.g.block_mut(self.block).nodes.push(id);
        self.effect = id;
        id
    }

    fn make_unreachable(&mut self) {
        if self.reachable {
            self.reachable = false;
            self.block = self.g.add_block();
        }
    }

    fn enter(&mut self, block: BlockId, locals: Vec<NodeId>, effect: NodeId, reachable: bool) {
        self.block = block;
        self.locals = locals;
        self.effect = effect;
        self.reachable = reachable;
    }

    fn register(&mut self, merge: &mut Merge) {
        if self.reachable {
            merge.preds.push(Pred {
                block: self.block,
                locals: self.locals.clone(),
                effect: self.effect,
            });
        }
    }

    fn register_label_exit(&mut self, li: usize) {
        if self.reachable {
            let pred = Pred {
                block: self.block,
                locals: self.locals.clone(),
                effect: self.effect,
            };
            self.labels[li].exit.preds.push(pred);
        }
    }

    /// Close a pending merge. Zero predecessors leave the continuation
    /// unreachable; a single predecessor is resumed in place; multiple
    /// predecessors get a merge block with phis for every local whose
    /// definition differs.
    fn seal(&mut self, merge: Merge) {
        let mut preds = merge.preds;
        match preds.len() {
            0 => {
                self.reachable = false;
                self.block = self.g.add_block();
            }
            1 => {
                let p = preds.pop().expect("one pred");
                self.enter(p.block, p.locals, p.effect, true);
            }
            _ => {
                let target = self.g.add_block();
                let nlocals = self.locals.len();
                let mut merged = Vec::with_capacity(nlocals);
                let mut phi_slots = Vec::new();
                for i in 0..nlocals {
                    let first = preds[0].locals[i];
                    if preds.iter().all(|p| p.locals[i] == first) {
                        merged.push(first);
                    } else {
                        let ty = self.env.local_type(i as u32).expect("local in range");
                        let phi = self.g.add_node(Node {
                            op: NodeOp::Phi,
                            ty,
                            inputs: vec![],
                            effect: None,
                        });
                        self.g.block_mut(target).params.push(phi);
                        merged.push(phi);
                        phi_slots.push(i);
                    }
                }
                let first_effect = preds[0].effect;
                let effect = if preds.iter().all(|p| p.effect == first_effect) {
                    first_effect
                } else {
                    let phi = self.g.add_node(Node {
                        op: NodeOp::EffectPhi,
                        ty: ValueType::Stmt,
                        inputs: vec![],
                        effect: None,
                    });
                    self.g.block_mut(target).effect_param = Some(phi);
                    phi
                };
                for p in &preds {
                    let args = phi_slots.iter().map(|&i| p.locals[i]).collect();
                    self.g.block_mut(p.block).term = Terminator::Jump { target, args };
                }
                self.enter(target, merged, effect, true);
            }
        }
    }

    /* ----- driver ----- */

    fn build(&mut self) -> VResult<()> {
        let mut last: Option<TypedVal> = None;
        while !self.r.at_end() {
            last = self.stmt()?;
        }
        let ret = self.env.sig.ret();
        if self.env.sig.return_count() == 1 {
            if self.reachable {
                match last {
                    Some(v) if v.ty == ret => {
                        let node = v.node.expect("typed value has a node");
                        self.g.block_mut(self.block).term =
                            Terminator::Return { value: Some(node) };
                    }
                    Some(v) if v.ty == ValueType::Stmt => {
                        return Err(VerifyError::new(ErrorKind::ValueExpectedStmtFound, v.pc));
                    }
                    Some(v) => {
                        return Err(VerifyError::with_pt(ErrorKind::TypeMismatch, v.pc, self.pc_start));
                    }
                    None => {
                        return Err(VerifyError::new(
                            ErrorKind::ValueExpectedStmtFound,
                            self.pc_end,
                        ));
                    }
                }
            }
        } else if self.reachable {
            self.g.block_mut(self.block).term = Terminator::Return { value: None };
        }
        Ok(())
    }

    /* ----- statements ----- */

    fn stmt(&mut self) -> VResult<Option<TypedVal>> {
        let (op, pc) = self.opcode()?;
        match op {
            Opcode::Nop => Ok(None),
            Opcode::Block => {
                let count = self.imm_u8()?;
                self.do_block(count)
            }
            Opcode::Loop => {
                let count = self.imm_u8()?;
                self.do_loop(count)?;
                Ok(None)
            }
            Opcode::If => {
                self.do_if(pc, false)?;
                Ok(None)
            }
            Opcode::IfThen => {
                self.do_if(pc, true)?;
                Ok(None)
            }
            Opcode::Switch => {
                self.do_switch(pc, true)?;
                Ok(None)
            }
            Opcode::SwitchNf => {
                self.do_switch(pc, false)?;
                Ok(None)
            }
            Opcode::Break => {
                let d_pc = self.r.pc();
                let depth = self.imm_u8()? as usize;
                if depth >= self.labels.len() {
                    return Err(VerifyError::new(ErrorKind::BreakDepthOutOfRange, d_pc));
                }
                let li = self.labels.len() - 1 - depth;
                self.register_label_exit(li);
                self.make_unreachable();
                Ok(None)
            }
            Opcode::Continue => {
                let d_pc = self.r.pc();
                let depth = self.imm_u8()? as usize;
                if depth >= self.labels.len() {
                    return Err(VerifyError::new(ErrorKind::BreakDepthOutOfRange, d_pc));
                }
                let li = self.labels.len() - 1 - depth;
                if !self.labels[li].is_loop {
                    return Err(VerifyError::new(ErrorKind::BreakDepthOutOfRange, d_pc));
                }
                self.backedge(li);
                self.make_unreachable();
                Ok(None)
            }
            Opcode::Return => {
                if self.env.sig.return_count() == 1 {
                    let v = self.expr_value(self.env.sig.ret(), pc)?;
                    if self.reachable {
                        self.g.block_mut(self.block).term =
                            Terminator::Return { value: v.node };
                    }
                } else if self.reachable {
                    self.g.block_mut(self.block).term = Terminator::Return { value: None };
                }
                self.make_unreachable();
                Ok(None)
            }
            Opcode::InfiniteLoop => {
                if self.reachable {
                    let header = self.g.add_block();
                    self.g.block_mut(self.block).term =
                        Terminator::Jump { target: header, args: vec![] };
                    self.g.block_mut(header).term =
                        Terminator::Jump { target: header, args: vec![] };
                }
                self.make_unreachable();
                Ok(None)
            }
            Opcode::SetLocal | Opcode::StoreGlobal | Opcode::StoreMemI32 | Opcode::StoreMemI64
            | Opcode::StoreMemF32 | Opcode::StoreMemF64 => self.assignment(op, pc).map(Some),
            _ => self.expr_opcode(op, pc).map(Some),
        }
    }

    fn do_block(&mut self, count: u8) -> VResult<Option<TypedVal>> {
        self.labels.push(Label { is_loop: false, exit: Merge::default(), header: None });
        let li = self.labels.len() - 1;
        let mut last = None;
        for _ in 0..count {
            last = self.stmt()?;
        }
        let completed = self.reachable;
        self.register_label_exit(li);
        let label = self.labels.pop().expect("label pushed above");
        // The block's fallthru value survives only when the end of the block
        // is reached normally and nothing broke to this label; otherwise the
        // value does not dominate the continuation.
        let value = if completed && label.exit.preds.len() == 1 { last } else { None };
        self.seal(label.exit);
        Ok(value)
    }

    fn do_if(&mut self, pc: u32, has_else: bool) -> VResult<()> {
        let cond = self.expr_value(ValueType::I32, pc)?;
        let snap_block = self.block;
        let snap_locals = self.locals.clone();
        let snap_effect = self.effect;
        let snap_reachable = self.reachable;

        let then_blk = self.g.add_block();
        let else_blk = self.g.add_block();
        if snap_reachable {
            self.g.block_mut(snap_block).term = Terminator::Branch {
                cond: cond.node.expect("typed value has a node"),
                then_blk,
                else_blk,
            };
        }
        let mut merge = Merge::default();

        self.enter(then_blk, snap_locals.clone(), snap_effect, snap_reachable);
        self.stmt()?;
        self.register(&mut merge);

        self.enter(else_blk, snap_locals, snap_effect, snap_reachable);
        if has_else {
            self.stmt()?;
        }
        self.register(&mut merge);

        self.seal(merge);
        Ok(())
    }

    fn do_loop(&mut self, count: u8) -> VResult<()> {
        let entry_reachable = self.reachable;
        let entry_block = self.block;
        let entry_args = self.locals.clone();
        let entry_effect = self.effect;

        let header = self.g.add_block();
        let mut params = Vec::with_capacity(self.locals.len());
        for i in 0..self.locals.len() {
            let ty = self.env.local_type(i as u32).expect("local in range");
            let phi = self.g.add_node(Node { op: NodeOp::Phi, ty, inputs: vec![], effect: None });
            self.g.block_mut(header).params.push(phi);
            params.push(phi);
        }
        let effect_param = self.g.add_node(Node {
            op: NodeOp::EffectPhi,
            ty: ValueType::Stmt,
            inputs: vec![],
            effect: None,
        });
        self.g.block_mut(header).effect_param = Some(effect_param);
        if entry_reachable {
            self.g.block_mut(entry_block).term =
                Terminator::Jump { target: header, args: entry_args.clone() };
        }

        self.labels.push(Label {
            is_loop: true,
            exit: Merge::default(),
            header: Some(LoopHeader {
                block: header,
                params: params.clone(),
                effect_param,
                entry_args,
                entry_effect,
                backedges: Vec::new(),
            }),
        });
        let li = self.labels.len() - 1;
        self.enter(header, params, effect_param, entry_reachable);
        for _ in 0..count {
            self.stmt()?;
        }
        // The body falling off its end is the implicit back edge.
        self.backedge(li);

        let mut label = self.labels.pop().expect("label pushed above");
        if entry_reachable {
            let h = label.header.take().expect("loop label has a header");
            self.prune_loop_phis(h, &mut label.exit);
        }
        self.seal(label.exit);
        Ok(())
    }

    fn backedge(&mut self, li: usize) {
        if !self.reachable {
            return;
        }
        let h = self.labels[li].header.as_mut().expect("continue target is a loop");
        let args = self.locals.clone();
        self.g.block_mut(self.block).term =
            Terminator::Jump { target: h.block, args: args.clone() };
        h.backedges.push((args, self.effect));
        self.reachable = false;
        self.block = self.g.add_block();
    }

    /// Remove loop phis whose value never changes across any back edge,
    /// rewriting their uses to the loop-entry value. Pending merges (outer
    /// labels, the loop's own exit, the current environment) are rewritten
    /// along with the graph.
    fn prune_loop_phis(&mut self, h: LoopHeader, exit: &mut Merge) {
        let n = h.params.len();
        let mut keep = vec![false; n];
        for (args, _) in &h.backedges {
            for i in 0..n {
                if args[i] != h.params[i] {
                    keep[i] = true;
                }
            }
        }
        let mut map: HashMap<NodeId, NodeId> = HashMap::new();
        for i in 0..n {
            if !keep[i] {
                map.insert(h.params[i], h.entry_args[i]);
            }
        }
        let effect_trivial = h.backedges.iter().all(|(_, e)| *e == h.effect_param);
        if effect_trivial {
            map.insert(h.effect_param, h.entry_effect);
        }

        let blk = self.g.block_mut(h.block);
        blk.params = h
            .params
            .iter()
            .enumerate()
            .filter(|(i, _)| keep[*i])
            .map(|(_, p)| *p)
            .collect();
        if effect_trivial {
            blk.effect_param = None;
        }
        // Narrow the argument lists of every jump into the header (the
        // entry edge, the implicit back edge, and continues).
        for block in &mut self.g.blocks {
            if let Terminator::Jump { target, args } = &mut block.term {
                if *target == h.block && args.len() == n {
                    *args = args
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| keep[*i])
                        .map(|(_, a)| *a)
                        .collect();
                }
            }
        }
        self.g.replace_uses(&map);
        let subst = |id: &mut NodeId| {
            if let Some(&to) = map.get(id) {
                *id = to;
            }
        };
        for label in &mut self.labels {
            for pred in &mut label.exit.preds {
                pred.locals.iter_mut().for_each(subst);
                subst(&mut pred.effect);
            }
        }
        for pred in &mut exit.preds {
            pred.locals.iter_mut().for_each(subst);
            subst(&mut pred.effect);
        }
        self.locals.iter_mut().for_each(subst);
        subst(&mut self.effect);
    }

    fn do_switch(&mut self, pc: u32, fallthrough: bool) -> VResult<()> {
        let count = self.imm_u8()? as usize;
        let key = self.expr_value(ValueType::I32, pc)?;
        let snap_block = self.block;
        let snap_locals = self.locals.clone();
        let snap_effect = self.effect;
        let snap_reachable = self.reachable;

        let case_edges: Vec<BlockId> = (0..count).map(|_| self.g.add_block()).collect();
        let default_edge = self.g.add_block();
        if snap_reachable {
            self.g.block_mut(snap_block).term = Terminator::Switch {
                key: key.node.expect("typed value has a node"),
                cases: case_edges.clone(),
                default: default_edge,
            };
        }

        self.labels.push(Label { is_loop: false, exit: Merge::default(), header: None });
        let li = self.labels.len() - 1;

        // Out-of-range keys execute no case.
        self.enter(default_edge, snap_locals.clone(), snap_effect, snap_reachable);
        self.register_label_exit(li);

        let mut fall: Option<Pred> = None;
        for (i, &edge) in case_edges.iter().enumerate() {
            let mut entry = Merge::default();
            self.enter(edge, snap_locals.clone(), snap_effect, snap_reachable);
            self.register(&mut entry);
            if let Some(prev) = fall.take() {
                entry.preds.push(prev);
            }
            self.seal(entry);
            self.stmt()?;
            if fallthrough && i + 1 < count {
                if self.reachable {
                    fall = Some(Pred {
                        block: self.block,
                        locals: self.locals.clone(),
                        effect: self.effect,
                    });
                    self.reachable = false;
                    self.block = self.g.add_block();
                }
            } else {
                self.register_label_exit(li);
            }
        }

        let label = self.labels.pop().expect("label pushed above");
        self.seal(label.exit);
        Ok(())
    }

    /* ----- assignments (statements that also produce the stored value) ----- */

    fn assignment(&mut self, op: Opcode, pc: u32) -> VResult<TypedVal> {
        if !op.is_supported() {
            return Err(VerifyError::new(ErrorKind::UnknownOpcode, pc));
        }
        match op {
            Opcode::SetLocal => {
                let idx_pc = self.r.pc();
                let index = self.imm_u8()? as u32;
                let ty = self
                    .env
                    .local_type(index)
                    .ok_or(VerifyError::new(ErrorKind::LocalIndexOutOfRange, idx_pc))?;
                let v = self.expr_value(ty, pc)?;
                let node = v.node.expect("typed value has a node");
                self.locals[index as usize] = node;
                Ok(TypedVal { ty, node: Some(node), pc })
            }
            Opcode::StoreGlobal => {
                let idx_pc = self.r.pc();
                let index = self.imm_u8()? as u16;
                let global = self
                    .env
                    .module
                    .and_then(|m| m.globals.get(index as usize))
                    .ok_or(VerifyError::new(ErrorKind::GlobalIndexOutOfRange, idx_pc))?;
                let ty = global.mem_type.value_type();
                let v = self.expr_value(ty, pc)?;
                let node = v.node.expect("typed value has a node");
                self.add_effectful(NodeOp::StoreGlobal(index), ValueType::Stmt, vec![node]);
                Ok(TypedVal { ty, node: Some(node), pc })
            }
            Opcode::StoreMemI32 | Opcode::StoreMemI64 | Opcode::StoreMemF32
            | Opcode::StoreMemF64 => {
                let class = load_store_value_type(op).expect("store opcode");
                let mem = self.mem_access(class)?;
                let addr = self.expr_value(ValueType::I32, pc)?;
                let v = self.expr_value(class, pc)?;
                let addr_node = addr.node.expect("typed value has a node");
                let node = v.node.expect("typed value has a node");
                self.add_effectful(NodeOp::StoreMem(mem), ValueType::Stmt, vec![addr_node, node]);
                Ok(TypedVal { ty: class, node: Some(node), pc })
            }
            _ => unreachable!("assignment called for non-assignment opcode"),
        }
    }

    /// Read and check the access byte after a load/store opcode.
    fn mem_access(&mut self, class: ValueType) -> VResult<MemType> {
        let at = self.r.pc();
        let b = self.imm_u8()?;
        let mem = MemType::from_u8(b).ok_or(VerifyError::new(ErrorKind::InvalidMemType, at))?;
        if mem.value_type() != class {
            return Err(VerifyError::new(ErrorKind::InvalidMemType, at));
        }
        Ok(mem)
    }

    /* ----- expressions ----- */

    fn expr(&mut self) -> VResult<TypedVal> {
        let (op, pc) = self.opcode()?;
        match op {
            Opcode::Nop | Opcode::Block | Opcode::Loop | Opcode::If | Opcode::IfThen
            | Opcode::Switch | Opcode::SwitchNf | Opcode::Break | Opcode::Continue
            | Opcode::Return | Opcode::InfiniteLoop => {
                Err(VerifyError::new(ErrorKind::ValueExpectedStmtFound, pc))
            }
            Opcode::SetLocal | Opcode::StoreGlobal | Opcode::StoreMemI32 | Opcode::StoreMemI64
            | Opcode::StoreMemF32 | Opcode::StoreMemF64 => self.assignment(op, pc),
            _ => self.expr_opcode(op, pc),
        }
    }

    /// Decode an expression and require a concrete value of `expected`.
    /// `pt` is the position of the construct that fixed the expectation.
    fn expr_value(&mut self, expected: ValueType, pt: u32) -> VResult<TypedVal> {
        let v = self.expr()?;
        if v.ty == ValueType::Stmt {
            return Err(VerifyError::new(ErrorKind::ValueExpectedStmtFound, v.pc));
        }
        if v.ty != expected {
            return Err(VerifyError::with_pt(ErrorKind::TypeMismatch, v.pc, pt));
        }
        Ok(v)
    }

    /// Decode an expression and require any concrete value.
    fn expr_any(&mut self) -> VResult<TypedVal> {
        let v = self.expr()?;
        if v.ty == ValueType::Stmt {
            return Err(VerifyError::new(ErrorKind::ValueExpectedStmtFound, v.pc));
        }
        Ok(v)
    }

    fn expr_opcode(&mut self, op: Opcode, pc: u32) -> VResult<TypedVal> {
        if !op.is_supported() {
            return Err(VerifyError::new(ErrorKind::UnknownOpcode, pc));
        }
        match op {
            Opcode::I8Const => {
                let v = self.imm_u8()? as i8;
                let node = self.add_pure(NodeOp::ConstI32(v as i32), ValueType::I32, vec![]);
                Ok(TypedVal { ty: ValueType::I32, node: Some(node), pc })
            }
            Opcode::I32Const => {
                let v = self.imm_u32()? as i32;
                let node = self.add_pure(NodeOp::ConstI32(v), ValueType::I32, vec![]);
                Ok(TypedVal { ty: ValueType::I32, node: Some(node), pc })
            }
            Opcode::I64Const => {
                let v = self.imm_u64()? as i64;
                let node = self.add_pure(NodeOp::ConstI64(v), ValueType::I64, vec![]);
                Ok(TypedVal { ty: ValueType::I64, node: Some(node), pc })
            }
            Opcode::F32Const => {
                let bits = self.imm_u32()?;
                let node = self.add_pure(NodeOp::ConstF32(bits), ValueType::F32, vec![]);
                Ok(TypedVal { ty: ValueType::F32, node: Some(node), pc })
            }
            Opcode::F64Const => {
                let bits = self.imm_u64()?;
                let node = self.add_pure(NodeOp::ConstF64(bits), ValueType::F64, vec![]);
                Ok(TypedVal { ty: ValueType::F64, node: Some(node), pc })
            }
            Opcode::GetLocal => {
                let idx_pc = self.r.pc();
                let index = self.imm_u8()? as u32;
                let ty = self
                    .env
                    .local_type(index)
                    .ok_or(VerifyError::new(ErrorKind::LocalIndexOutOfRange, idx_pc))?;
                Ok(TypedVal { ty, node: Some(self.locals[index as usize]), pc })
            }
            Opcode::LoadGlobal => {
                let idx_pc = self.r.pc();
                let index = self.imm_u8()? as u16;
                let global = self
                    .env
                    .module
                    .and_then(|m| m.globals.get(index as usize))
                    .ok_or(VerifyError::new(ErrorKind::GlobalIndexOutOfRange, idx_pc))?;
                let ty = global.mem_type.value_type();
                let node = self.add_effectful(NodeOp::LoadGlobal(index), ty, vec![]);
                Ok(TypedVal { ty, node: Some(node), pc })
            }
            Opcode::LoadMemI32 | Opcode::LoadMemI64 | Opcode::LoadMemF32 | Opcode::LoadMemF64 => {
                let class = load_store_value_type(op).expect("load opcode");
                let mem = self.mem_access(class)?;
                let addr = self.expr_value(ValueType::I32, pc)?;
                let addr_node = addr.node.expect("typed value has a node");
                let node = self.add_effectful(NodeOp::LoadMem(mem), class, vec![addr_node]);
                Ok(TypedVal { ty: class, node: Some(node), pc })
            }
            Opcode::CallFunction => {
                let idx_pc = self.r.pc();
                let index = self.imm_u8()? as u16;
                let callee = self
                    .env
                    .module
                    .and_then(|m| m.functions.get(index as usize))
                    .ok_or(VerifyError::new(ErrorKind::FunctionIndexOutOfRange, idx_pc))?;
                let sig = callee.sig.clone();
                let mut args = Vec::with_capacity(sig.param_count());
                for &p in sig.params() {
                    let a = self.expr_value(p, pc)?;
                    args.push(a.node.expect("typed value has a node"));
                }
                let ret = sig.ret();
                let node = self.add_effectful(NodeOp::Call(index), ret, args);
                let value = if ret.is_concrete() { Some(node) } else { None };
                Ok(TypedVal { ty: ret, node: value, pc })
            }
            Opcode::Ternary => {
                let cond = self.expr_value(ValueType::I32, pc)?;
                let t = self.expr_any()?;
                let e = self.expr_value(t.ty, t.pc)?;
                let node = self.add_pure(
                    NodeOp::Select,
                    t.ty,
                    vec![
                        cond.node.expect("typed value has a node"),
                        t.node.expect("typed value has a node"),
                        e.node.expect("typed value has a node"),
                    ],
                );
                Ok(TypedVal { ty: t.ty, node: Some(node), pc })
            }
            Opcode::Comma => {
                let _first = self.expr()?;
                let second = self.expr_any()?;
                Ok(TypedVal { ty: second.ty, node: second.node, pc })
            }
            _ => {
                let sig = op
                    .signature()
                    .ok_or(VerifyError::new(ErrorKind::UnknownOpcode, pc))?;
                let mut inputs = Vec::with_capacity(sig.params.len());
                for &p in sig.params {
                    let a = self.expr_value(p, pc)?;
                    inputs.push(a.node.expect("typed value has a node"));
                }
                let node_op = match sig.params.len() {
                    1 => NodeOp::Unop(op),
                    2 => NodeOp::Binop(op),
                    n => unreachable!("simple opcode with arity {n}"),
                };
                let node = self.add_pure(node_op, sig.ret, inputs);
                Ok(TypedVal { ty: sig.ret, node: Some(node), pc })
            }
        }
    }
}
