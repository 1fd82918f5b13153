//! Lifts decoded RISC-V basic blocks into IR.
//!
//! One rolling memory token threads every side effect in program order; the
//! optimization passes then relax that chain. Reads of the zero register
//! materialize a typed constant instead of a register access, and writes to
//! it are dropped. Word-sized (`*w`) operations compute in `i32` and store
//! back sign-extended, matching the RV64 convention.
//!
//! Control transfers stay straight-line: a branch becomes a comparison and
//! a `mux` over the taken and fall-through addresses, stored to `pc`. The
//! final memory token feeds the `jmp` terminator, and an `end` node over
//! the `jmp` becomes the graph root. Anything the lifter does not
//! understand turns into an `emulate` node carrying the raw instruction
//! bits.

use crate::context::{REG_INSTRET, REG_PC};
use crate::ir::{Builder, Graph, Opcode, Type, Value};
use crate::riscv::{BasicBlock, GuestOp, Inst};

/// Lift one basic block. `no_instret` skips the retired-instruction
/// counter update for hosts that do not need it.
pub fn lift(block: &BasicBlock, no_instret: bool) -> Graph {
    let mut graph = Graph::new();
    let start_mem = Value::new(graph.start(), 0);
    let block_mem = Builder::new(&mut graph).block(vec![start_mem]);
    let mut lifter = Lifter {
        graph,
        block,
        last_memory: block_mem,
    };
    lifter.run(no_instret);
    lifter.graph
}

struct Lifter<'a> {
    graph: Graph,
    block: &'a BasicBlock,
    /// The rolling memory token.
    last_memory: Value,
}

impl Lifter<'_> {
    fn b(&mut self) -> Builder<'_> {
        Builder::new(&mut self.graph)
    }

    /// Read a guest register as a value of the given type. Register 0 is
    /// the hard-wired zero register and never becomes a register access.
    fn emit_load_register(&mut self, ty: Type, reg: u8) -> Value {
        if reg == 0 {
            return self.b().constant(ty, 0);
        }
        let dep = self.last_memory;
        let (mem, value) = self.b().load_register(dep, reg as u16);
        self.last_memory = mem;
        if ty != Type::I64 {
            self.b().cast(ty, false, value)
        } else {
            value
        }
    }

    /// Write a guest register, widening to i64 first. Callers have already
    /// filtered out register 0.
    fn emit_store_register(&mut self, reg: u8, value: Value, sext: bool) {
        debug_assert_ne!(reg, 0, "stores to the zero register are dropped earlier");
        let value = if value.ty(&self.graph) != Type::I64 {
            self.b().cast(Type::I64, sext, value)
        } else {
            value
        };
        let dep = self.last_memory;
        self.last_memory = self.b().store_register(dep, reg as u16, value);
    }

    fn emit_load(&mut self, inst: Inst, ty: Type, sext: bool) {
        let rs1 = self.emit_load_register(Type::I64, inst.rs1());
        let imm = self.b().constant(Type::I64, inst.imm() as u64);
        let address = self.b().arithmetic(Opcode::Add, rs1, imm);
        let dep = self.last_memory;
        let (mem, value) = self.b().load_memory(dep, ty, address);
        self.last_memory = mem;
        // A load to x0 still accesses memory (it may fault); only the
        // writeback is dropped.
        if inst.rd() != 0 {
            self.emit_store_register(inst.rd(), value, sext);
        }
    }

    fn emit_store(&mut self, inst: Inst, ty: Type) {
        let rs2 = self.emit_load_register(ty, inst.rs2());
        let rs1 = self.emit_load_register(Type::I64, inst.rs1());
        let imm = self.b().constant(Type::I64, inst.imm() as u64);
        let address = self.b().arithmetic(Opcode::Add, rs1, imm);
        let dep = self.last_memory;
        self.last_memory = self.b().store_memory(dep, address, rs2);
    }

    fn emit_alui(&mut self, inst: Inst, op: Opcode, word: bool) {
        if inst.rd() == 0 {
            return;
        }
        let ty = if word { Type::I32 } else { Type::I64 };
        let rs1 = self.emit_load_register(ty, inst.rs1());
        let imm = self.b().constant(ty, inst.imm() as u64);
        let value = self.b().arithmetic(op, rs1, imm);
        self.emit_store_register(inst.rd(), value, true);
    }

    fn emit_shifti(&mut self, inst: Inst, op: Opcode, word: bool) {
        if inst.rd() == 0 {
            return;
        }
        let ty = if word { Type::I32 } else { Type::I64 };
        let rs1 = self.emit_load_register(ty, inst.rs1());
        let amount = self.b().constant(Type::I8, inst.imm() as u64);
        let value = self.b().shift(op, rs1, amount);
        self.emit_store_register(inst.rd(), value, true);
    }

    fn emit_slti(&mut self, inst: Inst, op: Opcode) {
        if inst.rd() == 0 {
            return;
        }
        let rs1 = self.emit_load_register(Type::I64, inst.rs1());
        let imm = self.b().constant(Type::I64, inst.imm() as u64);
        let value = self.b().compare(op, rs1, imm);
        self.emit_store_register(inst.rd(), value, false);
    }

    fn emit_alu(&mut self, inst: Inst, op: Opcode, word: bool) {
        if inst.rd() == 0 {
            return;
        }
        let ty = if word { Type::I32 } else { Type::I64 };
        let rs1 = self.emit_load_register(ty, inst.rs1());
        let rs2 = self.emit_load_register(ty, inst.rs2());
        let value = self.b().arithmetic(op, rs1, rs2);
        self.emit_store_register(inst.rd(), value, true);
    }

    fn emit_shift(&mut self, inst: Inst, op: Opcode, word: bool) {
        if inst.rd() == 0 {
            return;
        }
        let ty = if word { Type::I32 } else { Type::I64 };
        let rs1 = self.emit_load_register(ty, inst.rs1());
        let rs2 = self.emit_load_register(Type::I8, inst.rs2());
        let value = self.b().shift(op, rs1, rs2);
        self.emit_store_register(inst.rd(), value, true);
    }

    fn emit_slt(&mut self, inst: Inst, op: Opcode) {
        if inst.rd() == 0 {
            return;
        }
        let rs1 = self.emit_load_register(Type::I64, inst.rs1());
        let rs2 = self.emit_load_register(Type::I64, inst.rs2());
        let value = self.b().compare(op, rs1, rs2);
        self.emit_store_register(inst.rd(), value, false);
    }

    /// A branch selects between the taken target and the fall-through pc
    /// with a mux; control flow itself stays straight-line.
    fn emit_branch(&mut self, inst: Inst, op: Opcode, pc: u64) {
        let rs1 = self.emit_load_register(Type::I64, inst.rs1());
        let rs2 = self.emit_load_register(Type::I64, inst.rs2());
        let cond = self.b().compare(op, rs1, rs2);
        let end_pc = self.block.end_pc;
        let taken = self
            .b()
            .constant(Type::I64, pc.wrapping_add(inst.imm() as u64));
        let fallthrough = self.b().constant(Type::I64, end_pc);
        let target = self.b().mux(cond, taken, fallthrough);
        let dep = self.last_memory;
        self.last_memory = self.b().store_register(dep, REG_PC, target);
    }

    fn run(&mut self, no_instret: bool) {
        let block = self.block;

        // Prologue: advance pc past the block, count retired instructions.
        // A branch later overwrites pc; the dead store is cleaned up by
        // register access elimination.
        let pc_delta = block.end_pc.wrapping_sub(block.start_pc);
        let dep = self.last_memory;
        let (mem, pc_value) = self.b().load_register(dep, REG_PC);
        self.last_memory = mem;
        let delta = self.b().constant(Type::I64, pc_delta);
        let new_pc = self.b().arithmetic(Opcode::Add, pc_value, delta);
        let dep = self.last_memory;
        self.last_memory = self.b().store_register(dep, REG_PC, new_pc);

        if !no_instret {
            let dep = self.last_memory;
            let (mem, instret) = self.b().load_register(dep, REG_INSTRET);
            self.last_memory = mem;
            let count = self.b().constant(Type::I64, block.instructions.len() as u64);
            let new_instret = self.b().arithmetic(Opcode::Add, instret, count);
            let dep = self.last_memory;
            self.last_memory = self.b().store_register(dep, REG_INSTRET, new_instret);
        }

        let mut pc = block.start_pc;
        for &inst in &block.instructions {
            match inst.opcode() {
                GuestOp::Lui => {
                    if inst.rd() != 0 {
                        let imm = self.b().constant(Type::I64, inst.imm() as u64);
                        self.emit_store_register(inst.rd(), imm, false);
                    }
                }
                GuestOp::Auipc => {
                    if inst.rd() != 0 {
                        let value = self
                            .b()
                            .constant(Type::I64, pc.wrapping_add(inst.imm() as u64));
                        self.emit_store_register(inst.rd(), value, false);
                    }
                }

                GuestOp::Lb => self.emit_load(inst, Type::I8, true),
                GuestOp::Lh => self.emit_load(inst, Type::I16, true),
                GuestOp::Lw => self.emit_load(inst, Type::I32, true),
                GuestOp::Ld => self.emit_load(inst, Type::I64, false),
                GuestOp::Lbu => self.emit_load(inst, Type::I8, false),
                GuestOp::Lhu => self.emit_load(inst, Type::I16, false),
                GuestOp::Lwu => self.emit_load(inst, Type::I32, false),

                GuestOp::Sb => self.emit_store(inst, Type::I8),
                GuestOp::Sh => self.emit_store(inst, Type::I16),
                GuestOp::Sw => self.emit_store(inst, Type::I32),
                GuestOp::Sd => self.emit_store(inst, Type::I64),

                GuestOp::Addi => self.emit_alui(inst, Opcode::Add, false),
                GuestOp::Slti => self.emit_slti(inst, Opcode::Lt),
                GuestOp::Sltiu => self.emit_slti(inst, Opcode::Ltu),
                GuestOp::Xori => self.emit_alui(inst, Opcode::Xor, false),
                GuestOp::Ori => self.emit_alui(inst, Opcode::Or, false),
                GuestOp::Andi => self.emit_alui(inst, Opcode::And, false),
                GuestOp::Slli => self.emit_shifti(inst, Opcode::Shl, false),
                GuestOp::Srli => self.emit_shifti(inst, Opcode::Shr, false),
                GuestOp::Srai => self.emit_shifti(inst, Opcode::Sar, false),
                GuestOp::Addiw => self.emit_alui(inst, Opcode::Add, true),
                GuestOp::Slliw => self.emit_shifti(inst, Opcode::Shl, true),
                GuestOp::Srliw => self.emit_shifti(inst, Opcode::Shr, true),
                GuestOp::Sraiw => self.emit_shifti(inst, Opcode::Sar, true),

                GuestOp::Add => self.emit_alu(inst, Opcode::Add, false),
                GuestOp::Sub => self.emit_alu(inst, Opcode::Sub, false),
                GuestOp::Sll => self.emit_shift(inst, Opcode::Shl, false),
                GuestOp::Slt => self.emit_slt(inst, Opcode::Lt),
                GuestOp::Sltu => self.emit_slt(inst, Opcode::Ltu),
                GuestOp::Xor => self.emit_alu(inst, Opcode::Xor, false),
                GuestOp::Srl => self.emit_shift(inst, Opcode::Shr, false),
                GuestOp::Sra => self.emit_shift(inst, Opcode::Sar, false),
                GuestOp::Or => self.emit_alu(inst, Opcode::Or, false),
                GuestOp::And => self.emit_alu(inst, Opcode::And, false),
                GuestOp::Addw => self.emit_alu(inst, Opcode::Add, true),
                GuestOp::Subw => self.emit_alu(inst, Opcode::Sub, true),
                GuestOp::Sllw => self.emit_shift(inst, Opcode::Shl, true),
                GuestOp::Srlw => self.emit_shift(inst, Opcode::Shr, true),
                GuestOp::Sraw => self.emit_shift(inst, Opcode::Sar, true),

                GuestOp::Jal => {
                    assert_eq!(
                        pc + inst.length() as u64,
                        block.end_pc,
                        "jal must terminate its block"
                    );
                    if inst.rd() != 0 {
                        let link = self.b().constant(Type::I64, block.end_pc);
                        self.emit_store_register(inst.rd(), link, false);
                    }
                    let target = self
                        .b()
                        .constant(Type::I64, pc.wrapping_add(inst.imm() as u64));
                    let dep = self.last_memory;
                    self.last_memory = self.b().store_register(dep, REG_PC, target);
                }
                GuestOp::Jalr => {
                    // Read rs1 before the link writeback; rd may alias rs1.
                    let rs1 = self.emit_load_register(Type::I64, inst.rs1());
                    let imm = self.b().constant(Type::I64, inst.imm() as u64);
                    let sum = self.b().arithmetic(Opcode::Add, rs1, imm);
                    let mask = self.b().constant(Type::I64, !1u64);
                    let target = self.b().arithmetic(Opcode::And, sum, mask);
                    if inst.rd() != 0 {
                        let link = self.b().constant(Type::I64, block.end_pc);
                        self.emit_store_register(inst.rd(), link, false);
                    }
                    let dep = self.last_memory;
                    self.last_memory = self.b().store_register(dep, REG_PC, target);
                }

                GuestOp::Beq => {
                    self.emit_branch(inst, Opcode::Eq, pc);
                    break;
                }
                GuestOp::Bne => {
                    self.emit_branch(inst, Opcode::Ne, pc);
                    break;
                }
                GuestOp::Blt => {
                    self.emit_branch(inst, Opcode::Lt, pc);
                    break;
                }
                GuestOp::Bge => {
                    self.emit_branch(inst, Opcode::Ge, pc);
                    break;
                }
                GuestOp::Bltu => {
                    self.emit_branch(inst, Opcode::Ltu, pc);
                    break;
                }
                GuestOp::Bgeu => {
                    self.emit_branch(inst, Opcode::Geu, pc);
                    break;
                }

                GuestOp::Fence => {
                    let dep = self.last_memory;
                    self.last_memory = self.b().fence(vec![dep]);
                }

                // Everything else goes to the interpreter, including
                // fence.i (which must invalidate the translation cache)
                // and the system instructions.
                GuestOp::FenceI | GuestOp::Ecall | GuestOp::Ebreak | GuestOp::Unknown => {
                    let dep = self.last_memory;
                    self.last_memory = self.b().emulate(dep, inst.raw() as u64);
                }
            }
            pc += inst.length() as u64;
        }

        let dep = self.last_memory;
        let jmp = self.b().jmp(dep);
        let root = self.b().end(vec![jmp]);
        self.graph.set_root(root);
    }
}
