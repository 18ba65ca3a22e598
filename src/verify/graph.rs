//! Typed IR graph produced by the verifier.
//!
//! The graph is block-argument SSA: control-flow merges are blocks whose
//! parameters are the phi values, filled by the arguments of incoming jumps.
//! Side effects (memory, globals, calls) are threaded through an explicit
//! effect chain: each effectful node records the effect it depends on and
//! becomes the new current effect. Node order inside a block is evaluation
//! order, which is strict left-to-right.

use crate::opcodes::Opcode;
use crate::types::{MemType, ValueType};

pub type NodeId = u32;
pub type BlockId = u32;

/// Operation performed by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOp {
    /// Initial effect token of the function.
    Start,
    /// The i-th function parameter.
    Param(u16),
    /// A value merge; lives in a block's parameter list and is bound by the
    /// arguments of jumps targeting that block.
    Phi,
    /// An effect merge at a block head. Carries no runtime value.
    EffectPhi,
    ConstI32(i32),
    ConstI64(i64),
    /// Raw IEEE-754 bits.
    ConstF32(u32),
    ConstF64(u64),
    Unop(Opcode),
    Binop(Opcode),
    /// inputs: condition, then-value, else-value. Both operands are
    /// evaluated; only the selection is conditional.
    Select,
    LoadGlobal(u16),
    /// inputs: value. Produces no value; the assigned value flows from the
    /// input node.
    StoreGlobal(u16),
    /// inputs: address.
    LoadMem(MemType),
    /// inputs: address, value.
    StoreMem(MemType),
    /// inputs: arguments, left to right.
    Call(u16),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub op: NodeOp,
    /// `Stmt` for pure-effect nodes (stores, void calls, effect merges).
    pub ty: ValueType,
    pub inputs: Vec<NodeId>,
    /// The effect this node depends on; set for effectful nodes only.
    pub effect: Option<NodeId>,
}

/// Block terminator. `Branch` and `Switch` arms always target fresh
/// single-predecessor blocks, so only `Jump` carries phi arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    /// Unterminated: either still under construction or a detached block
    /// holding decoded-but-unreachable code. Never executed.
    None,
    Jump { target: BlockId, args: Vec<NodeId> },
    Branch { cond: NodeId, then_blk: BlockId, else_blk: BlockId },
    /// Dispatch on `key` as an unsigned index; out-of-range keys (including
    /// negative ones) go to `default`.
    Switch { key: NodeId, cases: Vec<BlockId>, default: BlockId },
    Return { value: Option<NodeId> },
}

#[derive(Debug, Clone)]
pub struct Block {
    /// Phi nodes bound by incoming jump arguments.
    pub params: Vec<NodeId>,
    /// Effect merge, if the incoming effect chains differ.
    pub effect_param: Option<NodeId>,
    /// Nodes in evaluation order.
    pub nodes: Vec<NodeId>,
    pub term: Terminator,
}

impl Block {
    fn new() -> Self {
        Self { params: Vec::new(), effect_param: None, nodes: Vec::new(), term: Terminator::None }
    }
}

#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub blocks: Vec<Block>,
    pub entry: BlockId,
}

impl Graph {
    pub fn new() -> Self {
        Self { nodes: Vec::new(), blocks: vec![Block::new()], entry: 0 }
    }

    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(node);
        id
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = self.blocks.len() as BlockId;
        self.blocks.push(Block::new());
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id as usize]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id as usize]
    }

    /// Rewrite every use of the map's keys to their values: node inputs,
    /// effect edges, and terminator operands. Block parameter lists are the
    /// caller's responsibility (pruning removes entries there directly).
    pub fn replace_uses(&mut self, map: &std::collections::HashMap<NodeId, NodeId>) {
        if map.is_empty() {
            return;
        }
        let subst = |id: &mut NodeId| {
            if let Some(&to) = map.get(id) {
                *id = to;
            }
        };
        for node in &mut self.nodes {
            for input in &mut node.inputs {
                subst(input);
            }
            if let Some(e) = &mut node.effect {
                subst(e);
            }
        }
        for block in &mut self.blocks {
            match &mut block.term {
                Terminator::Jump { args, .. } => args.iter_mut().for_each(subst),
                Terminator::Branch { cond, .. } => subst(cond),
                Terminator::Switch { key, .. } => subst(key),
                Terminator::Return { value: Some(v) } => subst(v),
                Terminator::Return { value: None } | Terminator::None => {}
            }
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
