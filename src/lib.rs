//! Compiler core of a RISC-V to x86-64 dynamic binary translator.
//!
//! Guest basic blocks are decoded elsewhere and arrive as
//! [`riscv::BasicBlock`]s. The [`frontend`] lifts them into a typed value
//! graph ([`ir`]) where side effects hang off a threaded memory token. The
//! [`ir_passes`] pipeline then eliminates redundant register traffic,
//! folds and hash-conses pure nodes, and pairs each block with its
//! terminator, before garbage collection trims the graph for the host
//! backend. The [`dbt`] runtime caches translations in a direct-mapped hot
//! cache backed by full maps of code buffers and graphs, and [`eval`] can
//! interpret a finalized graph directly when running native code is not an
//! option.

pub mod context;
pub mod dbt;
pub mod eval;
pub mod frontend;
pub mod ir;
pub mod ir_passes;
pub mod multiset;
pub mod riscv;

pub use context::{CpuContext, REG_COUNT, REG_INSTRET, REG_PC};
pub use dbt::{BlockDecoder, BlockFn, CodeBuffer, HostBackend, Options, Runtime};
pub use ir::{Builder, Graph, Opcode, Type, Value};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{Evaluator, Machine};
    use crate::ir_passes::{self, BlockMarker, LocalValueNumbering, RegisterAccessElimination};
    use crate::riscv::{BasicBlock, GuestOp, Inst};
    use std::collections::HashMap;

    /// Byte-addressed sparse guest memory; `emulate` bumps a counter and
    /// writes a sentinel into a10 so tests can observe the callback.
    #[derive(Default)]
    struct FlatMemory {
        mem: HashMap<u64, u8>,
        emulated: Vec<u64>,
    }

    impl FlatMemory {
        fn read(&mut self, addr: u64, len: u64) -> u64 {
            let mut out = 0u64;
            for i in 0..len {
                out |= (*self.mem.entry(addr + i).or_insert(0) as u64) << (8 * i);
            }
            out
        }

        fn write(&mut self, addr: u64, len: u64, value: u64) {
            for i in 0..len {
                self.mem.insert(addr + i, (value >> (8 * i)) as u8);
            }
        }
    }

    impl Machine for FlatMemory {
        fn load_u8(&mut self, addr: u64) -> u8 {
            self.read(addr, 1) as u8
        }
        fn load_u16(&mut self, addr: u64) -> u16 {
            self.read(addr, 2) as u16
        }
        fn load_u32(&mut self, addr: u64) -> u32 {
            self.read(addr, 4) as u32
        }
        fn load_u64(&mut self, addr: u64) -> u64 {
            self.read(addr, 8)
        }
        fn store_u8(&mut self, addr: u64, value: u8) {
            self.write(addr, 1, value as u64)
        }
        fn store_u16(&mut self, addr: u64, value: u16) {
            self.write(addr, 2, value as u64)
        }
        fn store_u32(&mut self, addr: u64, value: u32) {
            self.write(addr, 4, value as u64)
        }
        fn store_u64(&mut self, addr: u64, value: u64) {
            self.write(addr, 8, value)
        }
        fn emulate(&mut self, ctx: &mut CpuContext, raw: u64) {
            self.emulated.push(raw);
            ctx.set_reg(10, 0xAAAA);
        }
    }

    /// Lift and run the full optimization pipeline, as the cache miss path
    /// does.
    fn translate(block: &BasicBlock) -> Graph {
        let mut graph = frontend::lift(block, false);
        let mut rae = RegisterAccessElimination::new(REG_COUNT);
        ir_passes::run(&mut graph, &mut rae);
        let mut lvn = LocalValueNumbering::new();
        ir_passes::run(&mut graph, &mut lvn);
        let mut marker = BlockMarker::default();
        ir_passes::run(&mut graph, &mut marker);
        graph.garbage_collect();
        graph
    }

    fn execute(graph: &mut Graph, ctx: &mut CpuContext) -> FlatMemory {
        let mut machine = FlatMemory::default();
        Evaluator::new(ctx, &mut machine).run(graph);
        machine
    }

    fn count_op(graph: &Graph, opcode: Opcode) -> usize {
        graph.iter().filter(|(_, n)| n.opcode() == opcode).count()
    }

    #[test]
    fn addi_block_translates_to_a_single_constant_store() {
        // addi x1, x0, 5
        let block = BasicBlock::new(0x1000, vec![Inst::new(GuestOp::Addi, 1, 0, 0, 5)]);
        let mut graph = translate(&block);

        // x0 is a constant, so no register load except pc/instret, and the
        // stored value folds to the immediate.
        for (_, node) in graph.iter() {
            if node.opcode() == Opcode::LoadRegister {
                assert!(node.attr().word() >= REG_PC as u64);
            }
        }
        let store1 = graph
            .iter()
            .find(|(_, n)| n.opcode() == Opcode::StoreRegister && n.attr().word() == 1)
            .map(|(id, _)| id)
            .unwrap();
        assert_eq!(graph.node(store1).operand(1).const_value(&graph), 5);

        let mut ctx = CpuContext::new();
        ctx.pc = 0x1000;
        ctx.instret = 100;
        execute(&mut graph, &mut ctx);
        assert_eq!(ctx.reg(1), 5);
        assert_eq!(ctx.pc, 0x1004);
        assert_eq!(ctx.instret, 101);
    }

    #[test]
    fn overwritten_store_leaves_a_single_store() {
        // addi x1, x0, 3; addi x1, x0, 4
        let block = BasicBlock::new(
            0x1000,
            vec![
                Inst::new(GuestOp::Addi, 1, 0, 0, 3),
                Inst::new(GuestOp::Addi, 1, 0, 0, 4),
            ],
        );
        let mut graph = translate(&block);

        let stores: Vec<u64> = graph
            .iter()
            .filter(|(_, n)| n.opcode() == Opcode::StoreRegister && n.attr().word() == 1)
            .map(|(_, n)| n.operand(1).const_value(&graph))
            .collect();
        assert_eq!(stores, vec![4], "only the second store survives");

        let mut ctx = CpuContext::new();
        ctx.pc = 0x1000;
        execute(&mut graph, &mut ctx);
        assert_eq!(ctx.reg(1), 4);
        assert_eq!(ctx.pc, 0x1008);
    }

    #[test]
    fn emulate_barrier_keeps_both_stores() {
        // addi x1, x0, 3; <unknown>; addi x1, x0, 4
        let block = BasicBlock::new(
            0x1000,
            vec![
                Inst::new(GuestOp::Addi, 1, 0, 0, 3),
                Inst::new(GuestOp::Unknown, 0, 0, 0, 0).with_raw(0xffff_ffff),
                Inst::new(GuestOp::Addi, 1, 0, 0, 4),
            ],
        );
        let mut graph = translate(&block);

        let store_count = graph
            .iter()
            .filter(|(_, n)| n.opcode() == Opcode::StoreRegister && n.attr().word() == 1)
            .count();
        assert_eq!(store_count, 2, "the interpreter may observe the first store");
        assert_eq!(count_op(&graph, Opcode::Emulate), 1);

        let mut ctx = CpuContext::new();
        ctx.pc = 0x1000;
        let machine = execute(&mut graph, &mut ctx);
        assert_eq!(machine.emulated, vec![0xffff_ffff]);
        assert_eq!(ctx.reg(1), 4);
    }

    #[test]
    fn identical_expressions_are_computed_once() {
        // add x3, x1, x2; add x4, x1, x2
        let block = BasicBlock::new(
            0x1000,
            vec![
                Inst::new(GuestOp::Add, 3, 1, 2, 0),
                Inst::new(GuestOp::Add, 4, 1, 2, 0),
            ],
        );
        let mut graph = translate(&block);

        // One load per source register, one shared add.
        let gpr_loads = graph
            .iter()
            .filter(|(_, n)| {
                n.opcode() == Opcode::LoadRegister && n.attr().word() < REG_PC as u64
            })
            .count();
        assert_eq!(gpr_loads, 2);
        // pc update, instret update, and the one shared guest add.
        assert_eq!(count_op(&graph, Opcode::Add), 3);
        let stores: Vec<Value> = graph
            .iter()
            .filter(|(_, n)| {
                n.opcode() == Opcode::StoreRegister && matches!(n.attr().word(), 3 | 4)
            })
            .map(|(_, n)| n.operand(1))
            .collect();
        assert_eq!(stores[0], stores[1], "both stores read the same node");

        let mut ctx = CpuContext::new();
        ctx.pc = 0x1000;
        ctx.set_reg(1, 30);
        ctx.set_reg(2, 12);
        execute(&mut graph, &mut ctx);
        assert_eq!(ctx.reg(3), 42);
        assert_eq!(ctx.reg(4), 42);
    }

    #[test]
    fn taken_and_untaken_branches_update_pc() {
        // beq x1, x2, +0x20
        let block = BasicBlock::new(0x1000, vec![Inst::new(GuestOp::Beq, 0, 1, 2, 0x20)]);
        let mut graph = translate(&block);

        let mut ctx = CpuContext::new();
        ctx.pc = 0x1000;
        ctx.set_reg(1, 7);
        ctx.set_reg(2, 7);
        execute(&mut graph, &mut ctx);
        assert_eq!(ctx.pc, 0x1020, "taken branch jumps to the target");

        let mut graph = translate(&block);
        let mut ctx = CpuContext::new();
        ctx.pc = 0x1000;
        ctx.set_reg(1, 7);
        ctx.set_reg(2, 8);
        execute(&mut graph, &mut ctx);
        assert_eq!(ctx.pc, 0x1004, "untaken branch falls through");
    }

    #[test]
    fn memory_round_trip_through_translated_block() {
        // sw x1, 0(x2); lw x3, 0(x2)
        let block = BasicBlock::new(
            0x1000,
            vec![
                Inst::new(GuestOp::Sw, 0, 2, 1, 0),
                Inst::new(GuestOp::Lw, 3, 2, 0, 0),
            ],
        );
        let mut graph = translate(&block);

        let mut ctx = CpuContext::new();
        ctx.pc = 0x1000;
        ctx.set_reg(1, 0xFFFF_FFFF_8000_0001);
        ctx.set_reg(2, 0x4000);
        let machine = execute(&mut graph, &mut ctx);
        assert_eq!(ctx.reg(3), 0xFFFF_FFFF_8000_0001);
        assert_eq!(machine.mem.len(), 4);
    }

    #[test]
    fn loaded_word_arithmetic_matches_rv64_semantics() {
        // lw x1, 0(x2); addiw x1, x1, 1
        let block = BasicBlock::new(
            0x1000,
            vec![
                Inst::new(GuestOp::Lw, 1, 2, 0, 0),
                Inst::new(GuestOp::Addiw, 1, 1, 0, 1),
            ],
        );
        let mut graph = translate(&block);

        let mut ctx = CpuContext::new();
        ctx.pc = 0x1000;
        ctx.set_reg(2, 0x4000);
        let mut machine = FlatMemory::default();
        machine.write(0x4000, 4, 0x7FFF_FFFF);
        Evaluator::new(&mut ctx, &mut machine).run(&mut graph);
        // 0x7FFFFFFF + 1 wraps to i32 min, sign-extended.
        assert_eq!(ctx.reg(1), 0xFFFF_FFFF_8000_0000);
    }

    #[test]
    fn every_side_effect_keeps_its_memory_token_after_the_pipeline() {
        let block = BasicBlock::new(
            0x1000,
            vec![
                Inst::new(GuestOp::Addi, 1, 0, 0, 3),
                Inst::new(GuestOp::Sw, 0, 2, 1, 0),
                Inst::new(GuestOp::Fence, 0, 0, 0, 0),
                Inst::new(GuestOp::Lw, 3, 2, 0, 0),
                Inst::new(GuestOp::Unknown, 0, 0, 0, 0),
                Inst::new(GuestOp::Add, 4, 3, 1, 0),
            ],
        );
        let graph = translate(&block);
        for (id, node) in graph.iter() {
            if node.opcode().has_side_effect() {
                assert_eq!(
                    node.operand(0).ty(&graph),
                    Type::Memory,
                    "side-effecting node {id:?} lost its memory token"
                );
            }
        }
    }
}
