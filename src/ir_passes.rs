//! The pass framework and the optimization passes that run between lifting
//! and host code emission.
//!
//! A pass is a post-order walk over the operand edges of the graph, starting
//! at the root. Hooks fire around the walk (`start`/`finish`) and around
//! each node (`before`/`after`). `before` may cut the walk short by
//! returning true, which skips the node's operands and its `after` hook —
//! the evaluator uses this to treat `block` as a boundary.
//!
//! Three passes live here:
//!
//! - [`BlockMarker`] pairs every `block` node with its terminator.
//! - [`RegisterAccessElimination`] forwards stores to loads, folds redundant
//!   loads, and deletes dead stores over the machine register file, while
//!   keeping the memory-token chain correct across exception barriers.
//! - [`LocalValueNumbering`] folds constants, applies algebraic identities,
//!   canonicalizes commutative operands, and hash-conses pure nodes.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::eval;
use crate::ir::{Attr, Builder, Graph, NodeId, Opcode, Type, Value, Visit};

// ─── Pass framework ─────────────────────────────────────────────────────────

pub trait Pass {
    /// Called once before the walk.
    fn start(&mut self, graph: &mut Graph) {
        let _ = graph;
    }

    /// Called before a node's operands are visited. Returning true skips
    /// the operands and the `after` hook for this node.
    fn before(&mut self, graph: &mut Graph, n: NodeId) -> bool {
        let _ = (graph, n);
        false
    }

    /// Called once all reachable operands have been post-processed.
    fn after(&mut self, graph: &mut Graph, n: NodeId) {
        let _ = (graph, n);
    }

    /// Called once after the walk.
    fn finish(&mut self, graph: &mut Graph) {
        let _ = graph;
    }
}

/// Run `pass` over the graph, starting at the root.
pub fn run(graph: &mut Graph, pass: &mut dyn Pass) {
    let root = graph.root().expect("pass: graph root not set");
    run_from(graph, root, pass);
}

/// Run `pass` over everything transitively reachable from `root`.
pub fn run_from(graph: &mut Graph, root: NodeId, pass: &mut dyn Pass) {
    graph.reset_visit_marks();
    pass.start(graph);
    recurse(graph, root, pass);
    pass.finish(graph);
}

fn recurse(graph: &mut Graph, n: NodeId, pass: &mut dyn Pass) {
    match graph.visit(n) {
        Visit::Visited => return,
        // Operand edges form a DAG; a back-edge means the graph is broken.
        Visit::Visiting => panic!("pass: cycle through {n:?} on operand edges"),
        Visit::Unvisited => {}
    }
    if pass.before(graph, n) {
        graph.set_visit(n, Visit::Visited);
        return;
    }
    graph.set_visit(n, Visit::Visiting);

    // Hooks may rewrite the operand list of a pending node, so re-read the
    // bound and the slot on every step.
    let mut i = 0;
    while i < graph.node(n).operand_count() {
        let operand = graph.node(n).operand(i);
        recurse(graph, operand.node, pass);
        i += 1;
    }

    pass.after(graph, n);
    graph.set_visit(n, Visit::Visited);
}

/// Redirect all uses of `old`'s outputs to the matching outputs of `new`.
///
/// `new` must produce at least as many outputs as `old`, with matching
/// types slot for slot.
pub fn replace(graph: &mut Graph, old: NodeId, new: NodeId) {
    let old_outputs = graph.node(old).output_count();
    let new_outputs = graph.node(new).output_count();
    assert!(
        new_outputs >= old_outputs,
        "replace: {new:?} has {new_outputs} outputs, {old:?} needs {old_outputs}"
    );
    for i in 0..old_outputs {
        assert_eq!(
            graph.node(old).output_type(i),
            graph.node(new).output_type(i),
            "replace: output type mismatch at slot {i}"
        );
        graph.replace_all_uses(Value::new(old, i as u16), Value::new(new, i as u16));
    }
}

// ─── Block marker ───────────────────────────────────────────────────────────

/// Records each block's terminator in the block's attribute.
///
/// The walk reaches a terminator (`jmp` or `if`) before the `block` node it
/// terminates, so a single slot carried across the pre-order hook suffices.
/// Afterwards the backend and the evaluator can jump from a `block` straight
/// to its terminator without re-discovering the chain.
#[derive(Default)]
pub struct BlockMarker {
    block_end: Option<NodeId>,
}

impl Pass for BlockMarker {
    fn before(&mut self, graph: &mut Graph, n: NodeId) -> bool {
        match graph.node(n).opcode() {
            Opcode::Jmp | Opcode::If => {
                assert!(
                    self.block_end.is_none(),
                    "block marker: two terminators without a block between them"
                );
                self.block_end = Some(n);
            }
            Opcode::Block => {
                let end = self
                    .block_end
                    .take()
                    .expect("block marker: block without a terminator");
                graph.set_attr(n, Attr::Node(end));
            }
            _ => {}
        }
        false
    }
}

// ─── Register access elimination ────────────────────────────────────────────

/// Eliminates redundant machine-register traffic within a block.
///
/// The rules, applied in post-order (i.e. program order along the token
/// chain):
///
/// - a register load with a pending store to the same register forwards the
///   stored value and drops out of the chain;
/// - a register load with a prior load and no store in between folds into
///   that load;
/// - a register store makes the previous store to the same register dead,
///   unless an exception barrier was crossed since — a store that precedes
///   a faulting operation is observable and must survive;
/// - `emulate` and the terminator act as full barriers and collect the
///   loads and pending stores they must be ordered after;
/// - guest memory accesses may fault, so they are exception barriers:
///   load folding stops at them, though pending stores still forward
///   because the access cannot write the register file;
/// - a `fence` orders the token chain but not register state: it drops
///   load-forwarding state conservatively and keeps pending stores.
///
/// Rewritten dependencies are the minimal barrier set; where more than one
/// token is needed, a fresh `fence` joins them. Nodes that drop out of the
/// chain lose all uses and are reclaimed by garbage collection.
pub struct RegisterAccessElimination {
    last_load: Vec<Option<NodeId>>,
    last_store: Vec<Option<NodeId>>,
    has_store_after_exception: Vec<bool>,
    last_exception: Option<Value>,
    last_effect: Option<Value>,
}

impl RegisterAccessElimination {
    pub fn new(register_count: usize) -> Self {
        Self {
            last_load: vec![None; register_count],
            last_store: vec![None; register_count],
            has_store_after_exception: vec![false; register_count],
            last_exception: None,
            last_effect: None,
        }
    }

    /// The token a node must depend on to be ordered after `deps`: nothing,
    /// the sole element, or a fence joining the deduplicated set.
    fn dependency(&self, graph: &mut Graph, deps: Vec<Value>) -> Option<Value> {
        let mut unique: Vec<Value> = Vec::with_capacity(deps.len());
        for dep in deps {
            if !unique.contains(&dep) {
                unique.push(dep);
            }
        }
        match unique.len() {
            0 => None,
            1 => Some(unique[0]),
            _ => Some(Builder::new(graph).fence(unique)),
        }
    }

    fn rewrite_dependency(&self, graph: &mut Graph, n: NodeId, deps: Vec<Value>) {
        let dep = self.dependency(graph, deps).or(self.last_effect);
        if let Some(dep) = dep {
            graph.set_operand(n, 0, dep);
        }
    }
}

impl Pass for RegisterAccessElimination {
    fn after(&mut self, graph: &mut Graph, n: NodeId) {
        let opcode = graph.node(n).opcode();
        match opcode {
            Opcode::Block => {
                assert!(
                    self.last_effect.is_none(),
                    "register access elimination expects a single block"
                );
                self.last_effect = Some(Value::new(n, 0));
            }

            Opcode::LoadRegister => {
                let r = graph.node(n).attr().word() as usize;
                if let Some(store) = self.last_store[r] {
                    // Forward the stored value; the load drops out of the
                    // token chain.
                    let stored = graph.node(store).operand(1);
                    let incoming = graph.node(n).operand(0);
                    graph.replace_all_uses(Value::new(n, 1), stored);
                    graph.replace_all_uses(Value::new(n, 0), incoming);
                } else if let Some(prev) = self.last_load[r] {
                    // No store since the previous load: same value.
                    let incoming = graph.node(n).operand(0);
                    graph.replace_all_uses(Value::new(n, 1), Value::new(prev, 1));
                    graph.replace_all_uses(Value::new(n, 0), incoming);
                } else {
                    let mut deps = Vec::new();
                    if let Some(exception) = self.last_exception {
                        deps.push(exception);
                    }
                    if let Some(effect) = self.last_effect {
                        deps.push(effect);
                    }
                    self.rewrite_dependency(graph, n, deps);
                    self.last_load[r] = Some(n);
                }
            }

            Opcode::StoreRegister => {
                let r = graph.node(n).attr().word() as usize;
                let mut dep: Option<Value> = self.last_load[r].map(|load| Value::new(load, 0));
                if !self.has_store_after_exception[r] {
                    match (dep, self.last_exception) {
                        (None, exception) => dep = exception,
                        (Some(load), Some(exception)) => {
                            dep = self.dependency(graph, vec![load, exception]);
                        }
                        (Some(_), None) => {}
                    }
                } else if dep.is_none() {
                    // Store over store with nothing observing the old value
                    // in between: bypass the previous store so it loses its
                    // place in the chain.
                    let prev = self.last_store[r].expect("store bookkeeping out of sync");
                    dep = Some(graph.node(prev).operand(0));
                }
                if let Some(dep) = dep.or(self.last_effect) {
                    graph.set_operand(n, 0, dep);
                }
                self.last_load[r] = None;
                self.last_store[r] = Some(n);
                self.has_store_after_exception[r] = true;
            }

            Opcode::LoadMemory | Opcode::StoreMemory => {
                // May fault: every store that is only pending since the last
                // exception must be ordered before this node, and register
                // loads no longer fold across it. Pending stores stay valid
                // for forwarding since the access cannot write registers.
                let mut deps = Vec::new();
                for r in 0..self.last_load.len() {
                    if self.has_store_after_exception[r] {
                        let store = self.last_store[r].expect("store bookkeeping out of sync");
                        deps.push(Value::new(store, 0));
                    }
                    self.has_store_after_exception[r] = false;
                    self.last_load[r] = None;
                }
                if deps.is_empty() {
                    if let Some(exception) = self.last_exception {
                        deps.push(exception);
                    }
                }
                self.rewrite_dependency(graph, n, deps);
                self.last_exception = Some(Value::new(n, 0));
            }

            Opcode::Emulate | Opcode::Jmp => {
                // Full barrier: the interpreter (or the next block) may
                // observe and modify any register.
                let mut deps = Vec::new();
                let mut need_last_exception = true;
                for r in 0..self.last_load.len() {
                    if let Some(load) = self.last_load[r] {
                        deps.push(Value::new(load, 0));
                    }
                    if self.has_store_after_exception[r] {
                        if self.last_load[r].is_none() {
                            let store = self.last_store[r].expect("store bookkeeping out of sync");
                            deps.push(Value::new(store, 0));
                        }
                        need_last_exception = false;
                    }
                    self.has_store_after_exception[r] = false;
                    self.last_load[r] = None;
                    self.last_store[r] = None;
                }
                if need_last_exception {
                    if let Some(exception) = self.last_exception {
                        deps.push(exception);
                    }
                }
                self.rewrite_dependency(graph, n, deps);
                self.last_exception = None;
                if opcode == Opcode::Emulate {
                    self.last_effect = Some(Value::new(n, 0));
                }
            }

            Opcode::Fence => {
                // Orders guest memory accesses, not the register file.
                for r in 0..self.last_load.len() {
                    self.last_load[r] = None;
                    self.has_store_after_exception[r] = false;
                }
                if let Some(dep) = self.last_exception.or(self.last_effect) {
                    graph.set_operand(n, 0, dep);
                }
                self.last_exception = Some(Value::new(n, 0));
            }

            _ => {}
        }
    }
}

// ─── Local value numbering ──────────────────────────────────────────────────

/// Structural hash key of a pure node: opcode, output types, attribute and
/// operand sequence.
#[derive(PartialEq, Eq, Hash)]
struct LvnKey {
    opcode: Opcode,
    types: Vec<Type>,
    attr: Attr,
    operands: Vec<Value>,
}

fn key_of(graph: &Graph, n: NodeId) -> LvnKey {
    let node = graph.node(n);
    LvnKey {
        opcode: node.opcode(),
        types: (0..node.output_count()).map(|i| node.output_type(i)).collect(),
        attr: node.attr(),
        operands: node.operands().to_vec(),
    }
}

/// Rewrite `n` into a constant carrying `value`, keeping its output type.
fn replace_with_constant(graph: &mut Graph, n: NodeId, value: u64) {
    graph.set_operands(n, Vec::new());
    graph.set_opcode(n, Opcode::Constant);
    graph.set_attr(n, Attr::Word(value));
}

/// Folds and hash-conses pure nodes.
///
/// The walk is post-order, so a node's operands are already in canonical
/// form when the node is visited; one run reaches a fixed point. Non-pure
/// nodes are left untouched. Nodes replaced by an existing equal node lose
/// all uses and are reclaimed by garbage collection.
#[derive(Default)]
pub struct LocalValueNumbering {
    set: HashMap<LvnKey, NodeId>,
}

impl LocalValueNumbering {
    pub fn new() -> Self {
        Self::default()
    }

    fn number(&mut self, graph: &mut Graph, n: NodeId) {
        match self.set.entry(key_of(graph, n)) {
            Entry::Occupied(entry) => {
                let existing = *entry.get();
                if existing != n {
                    replace(graph, n, existing);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(n);
            }
        }
    }

    /// Returns true when the node was replaced by another value outright
    /// (nothing left to number).
    fn simplify_cast(&mut self, graph: &mut Graph, n: NodeId) -> bool {
        let x = graph.node(n).operand(0);
        let to = graph.node(n).output_type(0);
        let sext = graph.node(n).attr().word() != 0;

        if x.is_const(graph) {
            let folded = eval::cast(to, x.ty(graph), sext, x.const_value(graph));
            replace_with_constant(graph, n, folded);
            return false;
        }

        // A cast of a cast can often be folded.
        if x.opcode(graph) == Opcode::Cast {
            let y = graph.node(x.node).operand(0);
            let ysize = y.ty(graph).bits();
            let xsize = x.ty(graph).bits();
            let size = to.bits();

            // Back to the original width with no truncation in between.
            if ysize == size && xsize >= ysize {
                graph.replace_all_uses(Value::new(n, 0), y);
                return true;
            }

            // A down-cast followed by an up-cast cannot be folded.
            if ysize > xsize && xsize < size {
                return false;
            }

            // An up-cast followed by an up-cast cannot be folded if the
            // sign-extension flags disagree.
            let xsext = graph.node(x.node).attr().word() != 0;
            if ysize < xsize && xsize < size && xsext != sext {
                return false;
            }

            // Up-then-up or up-then-down: retarget to the innermost value.
            // The result of an up-cast inherits the inner sign flag.
            if ysize < size {
                graph.set_attr(n, Attr::Word(xsext as u64));
            }
            graph.set_operand(n, 0, y);
        }
        false
    }

    /// Returns true when the node was replaced by another value outright.
    fn simplify_binary(&mut self, graph: &mut Graph, n: NodeId) -> bool {
        let opcode = graph.node(n).opcode();
        let ty = graph.node(n).output_type(0);
        let mut x = graph.node(n).operand(0);
        let mut y = graph.node(n).operand(1);

        if x.is_const(graph) && y.is_const(graph) {
            let folded = eval::binary(
                x.ty(graph),
                opcode,
                x.const_value(graph),
                y.const_value(graph),
            );
            replace_with_constant(graph, n, folded);
            return false;
        }

        // Canonicalization: for commutative opcodes move the constant to
        // the right so structurally equal nodes hash the same.
        if x.is_const(graph) {
            if opcode.is_commutative() {
                graph.swap_operands(n, 0, 1);
                std::mem::swap(&mut x, &mut y);
            } else if x.const_value(graph) == 0 {
                match opcode {
                    Opcode::Sub => {
                        graph.set_opcode(n, Opcode::Neg);
                        graph.set_operands(n, vec![y]);
                        self.number(graph, n);
                        return true;
                    }
                    Opcode::Shl | Opcode::Shr | Opcode::Sar => {
                        replace_with_constant(graph, n, 0);
                        return false;
                    }
                    // 0 <u y is y != 0; 0 >=u y is y == 0.
                    Opcode::Ltu => {
                        graph.set_opcode(n, Opcode::Ne);
                        graph.swap_operands(n, 0, 1);
                        return false;
                    }
                    Opcode::Geu => {
                        graph.set_opcode(n, Opcode::Eq);
                        graph.swap_operands(n, 0, 1);
                        return false;
                    }
                    _ => {}
                }
            }
        }

        if y.is_const(graph) {
            let yv = y.const_value(graph);
            if yv == 0 {
                match opcode {
                    Opcode::Add
                    | Opcode::Sub
                    | Opcode::Xor
                    | Opcode::Or
                    | Opcode::Shl
                    | Opcode::Shr
                    | Opcode::Sar => {
                        graph.replace_all_uses(Value::new(n, 0), x);
                        return true;
                    }
                    Opcode::And | Opcode::Ltu => {
                        replace_with_constant(graph, n, 0);
                        return false;
                    }
                    // unsigned >= 0 is a tautology.
                    Opcode::Geu => {
                        replace_with_constant(graph, n, 1);
                        return false;
                    }
                    _ => {}
                }
            } else if yv == u64::MAX {
                match opcode {
                    Opcode::Xor => {
                        graph.set_opcode(n, Opcode::Not);
                        graph.set_operands(n, vec![x]);
                        self.number(graph, n);
                        return true;
                    }
                    Opcode::And => {
                        graph.replace_all_uses(Value::new(n, 0), x);
                        return true;
                    }
                    Opcode::Or => {
                        replace_with_constant(graph, n, u64::MAX);
                        return false;
                    }
                    _ => {}
                }
            }
        }

        if x == y {
            match opcode {
                Opcode::Sub | Opcode::Xor | Opcode::Ne | Opcode::Lt | Opcode::Ltu => {
                    replace_with_constant(graph, n, 0);
                    return false;
                }
                Opcode::Or | Opcode::And => {
                    graph.replace_all_uses(Value::new(n, 0), x);
                    return true;
                }
                Opcode::Eq | Opcode::Ge | Opcode::Geu => {
                    replace_with_constant(graph, n, 1);
                    return false;
                }
                _ => {}
            }
        }

        // (a + c1) + c2 becomes a + (c1 + c2).
        if opcode == Opcode::Add && y.is_const(graph) && x.opcode(graph) == Opcode::Add {
            let inner_rhs = graph.node(x.node).operand(1);
            if inner_rhs.is_const(graph) {
                let folded = eval::binary(
                    ty,
                    Opcode::Add,
                    y.const_value(graph),
                    inner_rhs.const_value(graph),
                );
                let a = graph.node(x.node).operand(0);
                let combined = Builder::new(&mut *graph).constant(ty, folded);
                graph.set_operand(n, 0, a);
                graph.set_operand(n, 1, combined);
                // Keep the fresh constant canonical too.
                self.number(graph, combined.node);
            }
        }

        false
    }
}

impl Pass for LocalValueNumbering {
    fn after(&mut self, graph: &mut Graph, n: NodeId) {
        let opcode = graph.node(n).opcode();
        if !opcode.is_pure() {
            return;
        }

        match opcode {
            Opcode::Cast => {
                if self.simplify_cast(graph, n) {
                    return;
                }
            }
            Opcode::Neg | Opcode::Not => {
                let x = graph.node(n).operand(0);
                if x.is_const(graph) {
                    let ty = graph.node(n).output_type(0);
                    let folded = eval::unary(ty, opcode, x.const_value(graph));
                    replace_with_constant(graph, n, folded);
                }
            }
            Opcode::Mux => {
                let cond = graph.node(n).operand(0);
                let left = graph.node(n).operand(1);
                let right = graph.node(n).operand(2);
                if cond.is_const(graph) {
                    let chosen = if cond.const_value(graph) != 0 { left } else { right };
                    graph.replace_all_uses(Value::new(n, 0), chosen);
                    return;
                }
                if left == right {
                    graph.replace_all_uses(Value::new(n, 0), left);
                    return;
                }
            }
            op if op.is_binary() => {
                if self.simplify_binary(graph, n) {
                    return;
                }
            }
            _ => {}
        }

        self.number(graph, n);
    }
}
