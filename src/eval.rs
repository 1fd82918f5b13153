//! Reference semantics for the IR.
//!
//! Two layers live here. The free functions define the numeric semantics of
//! the pure ops: every value is represented as a 64-bit word holding the
//! sign-extension of its typed payload, which makes signed comparisons work
//! without knowing the type and makes widening casts cheap. Local value
//! numbering folds constants with these exact functions.
//!
//! On top of them, [`Evaluator`] executes a finalized graph against a
//! [`CpuContext`] and a [`Machine`]. It is the interpretation fallback and
//! the reference implementation the translated code must agree with.

use crate::context::CpuContext;
use crate::ir::{Graph, NodeId, Opcode, Type, Value};
use crate::ir_passes::{self, Pass};

// ─── Numeric primitives ─────────────────────────────────────────────────────

/// Sign-extend a value of the given type to 64 bits.
pub fn sign_extend(ty: Type, value: u64) -> u64 {
    match ty {
        Type::I1 => (value != 0) as u64,
        Type::I8 => value as i8 as i64 as u64,
        Type::I16 => value as i16 as i64 as u64,
        Type::I32 => value as i32 as i64 as u64,
        Type::I64 => value,
        _ => panic!("sign_extend: {ty} is not a data type"),
    }
}

/// Zero-extend a value of the given type to 64 bits.
pub fn zero_extend(ty: Type, value: u64) -> u64 {
    match ty {
        Type::I1 => (value != 0) as u64,
        Type::I8 => value as u8 as u64,
        Type::I16 => value as u16 as u64,
        Type::I32 => value as u32 as u64,
        Type::I64 => value,
        _ => panic!("zero_extend: {ty} is not a data type"),
    }
}

/// Evaluate a cast.
///
/// A signed widening is a sign-extension to 64 bits followed by an implicit
/// truncation to the target; an unsigned widening zero-extends from the old
/// type first. For narrowing the flag makes no difference. The result is
/// re-canonicalized to the sign-extended representation.
pub fn cast(to: Type, from: Type, sext: bool, value: u64) -> u64 {
    if sext {
        sign_extend(to, value)
    } else {
        sign_extend(to, zero_extend(from, value))
    }
}

/// Evaluate a binary operation on values of type `ty`.
///
/// Arithmetic wraps modulo the type width. Shift counts are masked by
/// `width - 1`. `lt`/`ge` are signed, `ltu`/`geu` unsigned; both work
/// directly on the sign-extended representation.
pub fn binary(ty: Type, op: Opcode, l: u64, r: u64) -> u64 {
    let shamt = (r & (ty.bits().max(1) as u64 - 1)) as u32;
    match op {
        Opcode::Add => sign_extend(ty, l.wrapping_add(r)),
        Opcode::Sub => sign_extend(ty, l.wrapping_sub(r)),
        // Bitwise ops preserve the sign-extension on their own.
        Opcode::Xor => l ^ r,
        Opcode::Or => l | r,
        Opcode::And => l & r,
        Opcode::Shl => sign_extend(ty, l.wrapping_shl(shamt)),
        // Logical shift needs the zero-extended payload.
        Opcode::Shr => sign_extend(ty, zero_extend(ty, l).wrapping_shr(shamt)),
        Opcode::Sar => ((l as i64) >> shamt) as u64,
        Opcode::Eq => (l == r) as u64,
        Opcode::Ne => (l != r) as u64,
        Opcode::Lt => ((l as i64) < (r as i64)) as u64,
        Opcode::Ge => ((l as i64) >= (r as i64)) as u64,
        Opcode::Ltu => (l < r) as u64,
        Opcode::Geu => (l >= r) as u64,
        _ => panic!("binary: {op} is not a binary opcode"),
    }
}

/// Evaluate `neg` or `not`.
pub fn unary(ty: Type, op: Opcode, value: u64) -> u64 {
    match op {
        Opcode::Neg => sign_extend(ty, value.wrapping_neg()),
        Opcode::Not => !value,
        _ => panic!("unary: {op} is not a unary opcode"),
    }
}

// ─── Graph evaluator ────────────────────────────────────────────────────────

/// Guest memory and the interpretation fallback, as seen by the evaluator.
///
/// Addresses are guest-virtual. `emulate` receives the raw instruction bits
/// an `emulate` node carries and may read and write the whole context.
pub trait Machine {
    fn load_u8(&mut self, addr: u64) -> u8;
    fn load_u16(&mut self, addr: u64) -> u16;
    fn load_u32(&mut self, addr: u64) -> u32;
    fn load_u64(&mut self, addr: u64) -> u64;
    fn store_u8(&mut self, addr: u64, value: u8);
    fn store_u16(&mut self, addr: u64, value: u16);
    fn store_u32(&mut self, addr: u64, value: u32);
    fn store_u64(&mut self, addr: u64, value: u64);
    fn emulate(&mut self, ctx: &mut CpuContext, raw: u64);
}

/// Executes a graph in post-order along its operand edges.
///
/// Per-node results live in a side table indexed by node id; side effects
/// go straight to the context and the machine. `block` is a walk boundary,
/// so evaluation stays within the block that the root terminates.
pub struct Evaluator<'a, M: Machine> {
    ctx: &'a mut CpuContext,
    machine: &'a mut M,
    values: Vec<u64>,
}

impl<'a, M: Machine> Evaluator<'a, M> {
    pub fn new(ctx: &'a mut CpuContext, machine: &'a mut M) -> Self {
        Self {
            ctx,
            machine,
            values: Vec::new(),
        }
    }

    /// Execute the block terminated by the graph's root.
    pub fn run(&mut self, graph: &mut Graph) {
        ir_passes::run(graph, self);
    }

    fn value(&self, v: Value) -> u64 {
        self.values[v.node.index()]
    }
}

impl<M: Machine> Pass for Evaluator<'_, M> {
    fn start(&mut self, graph: &mut Graph) {
        self.values = vec![0; graph.slot_count()];
    }

    fn before(&mut self, graph: &mut Graph, n: NodeId) -> bool {
        graph.node(n).opcode() == Opcode::Block
    }

    fn after(&mut self, graph: &mut Graph, n: NodeId) {
        let opcode = graph.node(n).opcode();
        let result = match opcode {
            Opcode::Start | Opcode::Block | Opcode::Jmp | Opcode::End | Opcode::Fence => return,

            Opcode::Constant => graph.node(n).attr().word(),

            Opcode::Cast => {
                let x = graph.node(n).operand(0);
                cast(
                    graph.node(n).output_type(0),
                    x.ty(graph),
                    graph.node(n).attr().word() != 0,
                    self.value(x),
                )
            }

            Opcode::LoadRegister => self.ctx.reg(graph.node(n).attr().word() as u16),

            Opcode::StoreRegister => {
                let value = self.value(graph.node(n).operand(1));
                self.ctx.set_reg(graph.node(n).attr().word() as u16, value);
                return;
            }

            Opcode::LoadMemory => {
                let addr = self.value(graph.node(n).operand(1));
                let ty = graph.node(n).output_type(1);
                let raw = match ty {
                    Type::I8 => self.machine.load_u8(addr) as u64,
                    Type::I16 => self.machine.load_u16(addr) as u64,
                    Type::I32 => self.machine.load_u32(addr) as u64,
                    Type::I64 => self.machine.load_u64(addr),
                    _ => panic!("load_memory of {ty}"),
                };
                sign_extend(ty, raw)
            }

            Opcode::StoreMemory => {
                let addr = self.value(graph.node(n).operand(1));
                let v = graph.node(n).operand(2);
                let value = self.value(v);
                match v.ty(graph) {
                    Type::I8 => self.machine.store_u8(addr, value as u8),
                    Type::I16 => self.machine.store_u16(addr, value as u16),
                    Type::I32 => self.machine.store_u32(addr, value as u32),
                    Type::I64 => self.machine.store_u64(addr, value),
                    ty => panic!("store_memory of {ty}"),
                }
                return;
            }

            Opcode::Emulate => {
                self.machine.emulate(self.ctx, graph.node(n).attr().word());
                return;
            }

            Opcode::Neg | Opcode::Not => unary(
                graph.node(n).output_type(0),
                opcode,
                self.value(graph.node(n).operand(0)),
            ),

            Opcode::Mux => {
                let cond = self.value(graph.node(n).operand(0));
                if cond != 0 {
                    self.value(graph.node(n).operand(1))
                } else {
                    self.value(graph.node(n).operand(2))
                }
            }

            op if op.is_binary() => {
                let l = self.value(graph.node(n).operand(0));
                let r = self.value(graph.node(n).operand(1));
                binary(graph.node(n).output_type(0), op, l, r)
            }

            other => panic!("evaluator: cannot execute {other}"),
        };
        self.values[n.index()] = result;
    }
}
