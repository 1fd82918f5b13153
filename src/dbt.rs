//! The translation cache and the miss path.
//!
//! Two tiers: a direct-mapped hot cache of (guest pc tag, entry pointer)
//! pairs sized for cheap lookup on every dispatched block, and cold maps
//! holding every code buffer and optimized graph produced so far. A miss
//! runs the full pipeline — decode, lift, register access elimination,
//! local value numbering, block marking, garbage collection — and hands
//! the finalized graph to the host backend, which fills a code buffer.
//!
//! The decoder and the host code emitter stay outside this crate, behind
//! [`BlockDecoder`] and [`HostBackend`]. Translation runs inline on the
//! thread that executes the translated code; nothing here is shared, so
//! there are no locks and no atomics.
//!
//! Set `RVJIT_TRACE=1` to log every translation (and the optimized graph)
//! to stderr.

use std::collections::HashMap;
use std::sync::OnceLock;

use dynasmrt::AssemblyOffset;
use dynasmrt::mmap::{ExecutableBuffer, MutableBuffer};

use crate::context::{CpuContext, REG_COUNT};
use crate::frontend;
use crate::ir::Graph;
use crate::ir_passes::{self, BlockMarker, LocalValueNumbering, RegisterAccessElimination};
use crate::riscv::BasicBlock;

/// Entry point of a translated block.
pub type BlockFn = unsafe extern "C" fn(*mut CpuContext);

/// Hot cache entry count. Index is `(pc >> 1) & 0xFFF`: guest instructions
/// are at least 2-byte aligned, so bit 0 carries no information.
pub const HOT_CACHE_ENTRIES: usize = 4096;

/// Initial reserve for each code buffer — one page covers typical blocks
/// without reallocation.
pub const CODE_BUFFER_RESERVE: usize = 4096;

fn hot_index(pc: u64) -> usize {
    ((pc >> 1) & 0xFFF) as usize
}

static TRACE: OnceLock<bool> = OnceLock::new();

/// Translation tracing, read once from `RVJIT_TRACE`.
fn trace_enabled() -> bool {
    *TRACE.get_or_init(|| std::env::var("RVJIT_TRACE").is_ok_and(|v| v != "0"))
}

// ─── Collaborator seams ─────────────────────────────────────────────────────

/// Produces the straight-line block starting at a guest pc.
pub trait BlockDecoder {
    fn decode_basic_block(&mut self, pc: u64) -> BasicBlock;
}

/// Emits host code for a finalized graph into a code buffer.
///
/// The graph's root is the block terminator, every `block` node's attribute
/// names its terminator, and dead nodes have been collected. The emitted
/// code must implement the `BlockFn` calling convention: one argument, the
/// guest context pointer.
pub trait HostBackend {
    fn emit(&mut self, graph: &Graph, code: &mut CodeBuffer);
}

// ─── Code buffers ───────────────────────────────────────────────────────────

/// A block's native code: bytes staged by the backend, then sealed into
/// executable memory.
///
/// Sealed buffers stay valid until the cache entry owning them is dropped;
/// the hot cache only ever hands out pointers into sealed buffers.
#[derive(Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    exec: Option<ExecutableBuffer>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty() && self.exec.is_none()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn reserve(&mut self, additional: usize) {
        self.bytes.reserve(additional);
    }

    /// Append raw instruction bytes. Only valid before sealing.
    pub fn emit(&mut self, bytes: &[u8]) {
        assert!(self.exec.is_none(), "code buffer is already sealed");
        self.bytes.extend_from_slice(bytes);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Move the staged bytes into executable memory. Running out of
    /// executable memory is fatal.
    pub fn seal(&mut self) {
        assert!(self.exec.is_none(), "code buffer is already sealed");
        assert!(!self.bytes.is_empty(), "sealing an empty code buffer");
        let mut buf =
            MutableBuffer::new(self.bytes.len()).expect("failed to reserve executable memory");
        buf.set_len(self.bytes.len());
        buf[..self.bytes.len()].copy_from_slice(&self.bytes);
        self.exec = match buf.make_exec() {
            Ok(exec) => Some(exec),
            Err(_) => panic!("failed to mark code buffer executable"),
        };
    }

    /// The entry point at the buffer's base.
    pub fn entry(&self) -> BlockFn {
        let exec = self.exec.as_ref().expect("code buffer is not sealed");
        unsafe { std::mem::transmute(exec.ptr(AssemblyOffset(0))) }
    }
}

// ─── Runtime ────────────────────────────────────────────────────────────────

/// Behavior toggles for the translator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Skip the retired-instruction counter update in lifted blocks.
    pub no_instret: bool,
}

/// The per-hart translation cache and dispatch loop driver.
pub struct Runtime<D, B> {
    options: Options,
    decoder: D,
    backend: B,
    icache_tag: Vec<u64>,
    icache_entry: Vec<Option<BlockFn>>,
    /// Every code buffer produced since the last invalidation.
    code_cache: HashMap<u64, CodeBuffer>,
    /// Optimized graphs, kept across invalidations so code can be
    /// re-emitted without re-lifting.
    graph_cache: HashMap<u64, Graph>,
}

impl<D: BlockDecoder, B: HostBackend> Runtime<D, B> {
    pub fn new(options: Options, decoder: D, backend: B) -> Self {
        Self {
            options,
            decoder,
            backend,
            icache_tag: vec![0; HOT_CACHE_ENTRIES],
            icache_entry: vec![None; HOT_CACHE_ENTRIES],
            code_cache: HashMap::new(),
            graph_cache: HashMap::new(),
        }
    }

    /// Dispatch one block: translate on miss, then run the native code.
    pub fn step(&mut self, ctx: &mut CpuContext) {
        let pc = ctx.pc;
        let index = hot_index(pc);
        if self.icache_tag[index] != pc {
            self.compile(pc);
        }
        let entry = self.icache_entry[index].expect("hot cache entry missing for tagged pc");
        unsafe { entry(ctx) };
    }

    /// Translate the block at `pc` if needed and refresh its hot entry.
    pub fn compile(&mut self, pc: u64) {
        let index = hot_index(pc);
        let mut code = self.code_cache.remove(&pc).unwrap_or_default();

        if code.is_empty() {
            code.reserve(CODE_BUFFER_RESERVE);
            if !self.graph_cache.contains_key(&pc) {
                let block = self.decoder.decode_basic_block(pc);
                if trace_enabled() {
                    eprintln!(
                        "rvjit: translating {:#x}..{:#x} ({} instructions)",
                        block.start_pc,
                        block.end_pc,
                        block.instructions.len()
                    );
                }
                let graph = self.optimize(&block);
                if trace_enabled() {
                    eprint!("{graph}");
                }
                self.graph_cache.insert(pc, graph);
            }
            let graph = &self.graph_cache[&pc];
            self.backend.emit(graph, &mut code);
            code.seal();
        }

        self.icache_entry[index] = Some(code.entry());
        self.icache_tag[index] = pc;
        self.code_cache.insert(pc, code);
    }

    fn optimize(&self, block: &BasicBlock) -> Graph {
        let mut graph = frontend::lift(block, self.options.no_instret);
        let mut rae = RegisterAccessElimination::new(REG_COUNT);
        ir_passes::run(&mut graph, &mut rae);
        let mut lvn = LocalValueNumbering::new();
        ir_passes::run(&mut graph, &mut lvn);
        let mut marker = BlockMarker::default();
        ir_passes::run(&mut graph, &mut marker);
        graph.garbage_collect();
        graph
    }

    /// Drop all translated code. Called when the guest executes `fence.i`.
    ///
    /// Zeroed tags alone would force recompilation, but the buffers are
    /// gone too, so the stale entry pointers go with them. Graphs are
    /// retained: re-compilation re-emits from the cached graph.
    pub fn invalidate_all(&mut self) {
        for tag in &mut self.icache_tag {
            *tag = 0;
        }
        for entry in &mut self.icache_entry {
            *entry = None;
        }
        self.code_cache.clear();
    }

    /// The cached optimized graph for a pc, if it was ever compiled.
    pub fn graph(&self, pc: u64) -> Option<&Graph> {
        self.graph_cache.get(&pc)
    }

    /// The sealed code buffer for a pc, if present since the last
    /// invalidation.
    pub fn code(&self, pc: u64) -> Option<&CodeBuffer> {
        self.code_cache.get(&pc)
    }

    /// The hot-cache tag at the slot `pc` maps to.
    pub fn hot_tag(&self, pc: u64) -> u64 {
        self.icache_tag[hot_index(pc)]
    }
}
