//! Trace compiler and code cache
//!
//! Compiled code is organised per `(mode, page)`. A [`JitPage`] holds one
//! entry point per byte of the page, all starting out
//! [`EntryPoint::Unjitted`], and owns the executable blocks its code lives
//! in. Reaching an unjitted entry compiles a trace starting there; the page
//! fills in only where execution actually goes.
//!
//! Invalidation is per page: a bus write to (or a remap of) a page holding
//! compiled code drops every mode's [`JitPage`] for it, blocks included.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::codegen::{CodeEmitter, ExitReason, JitContext, TraceStep};
use super::ir::InstructionPlan;
use super::native::{NativeMemory, NativeMemoryAllocator, NATIVE_PAGE_SIZE};
use super::{JitError, JittableCpu};
use crate::cpu::CpuState;
use crate::memory::SystemBus;

/// Default arena block size
pub const BLOCK_SIZE: usize = 64 * 1024;
/// A trace stops growing once less than this much room is left in a block
pub const SAFETY_MARGIN: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryPoint {
    Unjitted,
    Compiled { block: usize, offset: usize },
}

struct CodeBlock {
    memory: Box<dyn NativeMemory>,
    used: usize,
}

impl CodeBlock {
    fn free(&self) -> usize {
        self.memory.len() - self.used
    }
}

pub struct JitPage {
    entries: Vec<EntryPoint>,
    blocks: Vec<CodeBlock>,
}

impl JitPage {
    fn new(page_size: usize) -> Self {
        JitPage {
            entries: vec![EntryPoint::Unjitted; page_size],
            blocks: Vec::new(),
        }
    }

    pub fn entry(&self, offset: usize) -> EntryPoint {
        self.entries[offset]
    }

    pub fn compiled_offsets(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| **e != EntryPoint::Unjitted)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JitStats {
    /// Traces compiled
    pub traces: u64,
    /// Instructions given an entry point
    pub instructions: u64,
    /// Trace entries executed
    pub runs: u64,
    /// Compilations abandoned for the interpreter
    pub fallbacks: u64,
    /// Pages dropped because their code went stale
    pub invalidations: u64,
    /// Arena blocks allocated
    pub blocks: u64,
}

pub struct JitCore {
    pages: HashMap<(u32, u32), JitPage>,
    emitter: Box<dyn CodeEmitter>,
    allocator: Box<dyn NativeMemoryAllocator>,
    max_trace_length: usize,
    block_size: usize,
    page_shift: u32,
    pub stats: JitStats,
}

impl JitCore {
    pub fn new(
        emitter: Box<dyn CodeEmitter>,
        allocator: Box<dyn NativeMemoryAllocator>,
        max_trace_length: usize,
    ) -> Result<Self, JitError> {
        if emitter.needs_native_memory() && !allocator.is_native() {
            return Err(JitError::NotExecutable(emitter.name()));
        }
        Ok(JitCore {
            pages: HashMap::new(),
            emitter,
            allocator,
            max_trace_length: max_trace_length.max(1),
            block_size: BLOCK_SIZE,
            page_shift: 0,
            stats: JitStats::default(),
        })
    }

    /// Use smaller arena blocks; a trace never grows past the block size
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(SAFETY_MARGIN * 2);
        self
    }

    pub fn emitter_name(&self) -> &'static str {
        self.emitter.name()
    }

    fn page_key(&self, mode: u32, address: u32) -> (u32, u32) {
        (mode, (address >> self.page_shift) << self.page_shift)
    }

    pub fn page(&self, mode: u32, address: u32) -> Option<&JitPage> {
        self.pages.get(&self.page_key(mode, address))
    }

    pub fn entry_point(&self, mode: u32, address: u32) -> EntryPoint {
        let mask = (1u32 << self.page_shift) - 1;
        self.page(mode, address)
            .map_or(EntryPoint::Unjitted, |p| p.entry((address & mask) as usize))
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Drop compiled code for bus page `page_index` in every mode
    pub fn invalidate_jit(&mut self, page_index: u32) {
        let base = page_index << self.page_shift;
        let before = self.pages.len();
        self.pages.retain(|&(_, page), _| page != base);
        let dropped = before - self.pages.len();
        if dropped > 0 {
            self.stats.invalidations += dropped as u64;
            debug!(page = format_args!("{base:#x}"), dropped, "jit page invalidated");
        }
    }

    /// Drop compiled code covering `address`
    pub fn jit_invalidate_for_write(&mut self, address: u32) {
        self.invalidate_jit(address >> self.page_shift);
    }

    pub fn invalidate_all(&mut self) {
        self.stats.invalidations += self.pages.len() as u64;
        self.pages.clear();
    }

    /// Apply invalidations queued by bus writes and remaps
    pub fn sync_with_bus(&mut self, bus: &mut SystemBus) {
        if self.page_shift != bus.memory.page_shift {
            self.pages.clear();
            self.page_shift = bus.memory.page_shift;
        }
        for page in bus.memory.take_dirty_code() {
            self.invalidate_jit(page);
        }
    }

    /// Run compiled code from `state.ip`, compiling first if needed.
    ///
    /// An `Err` means nothing ran; the caller should interpret one
    /// instruction instead.
    pub fn execute(
        &mut self,
        model: &dyn JittableCpu,
        state: &mut CpuState,
        bus: &mut SystemBus,
    ) -> Result<ExitReason, JitError> {
        self.sync_with_bus(bus);
        let address = state.canonical_address();
        let key = self.page_key(state.mode, address);
        let offset = (address - key.1) as usize;

        let entry = match self.pages.get(&key).map(|p| p.entry(offset)) {
            Some(EntryPoint::Compiled { block, offset }) => (block, offset),
            _ => {
                if let Err(e) = self.compile(model, state, bus) {
                    self.stats.fallbacks += 1;
                    return Err(e);
                }
                match self.pages.get(&key).map(|p| p.entry(offset)) {
                    Some(EntryPoint::Compiled { block, offset }) => (block, offset),
                    _ => return Err(JitError::NothingCompiled(address)),
                }
            }
        };

        let Some(page) = self.pages.get(&key) else {
            return Err(JitError::NothingCompiled(address));
        };
        let mut ctx = JitContext::load(state).ok_or(JitError::TooManyRegisters(state.regs.len()))?;
        let exit = self.emitter.execute(page.blocks[entry.0].memory.as_ref(), entry.1, &mut ctx, bus);
        ctx.store(state);
        self.stats.runs += 1;
        Ok(exit)
    }

    /// Compile a trace starting at the current instruction
    fn compile(&mut self, model: &dyn JittableCpu, state: &CpuState, bus: &mut SystemBus) -> Result<(), JitError> {
        if state.regs.len() > super::codegen::JIT_REGISTERS {
            return Err(JitError::TooManyRegisters(state.regs.len()));
        }
        let page_size = 1usize << self.page_shift;
        let page_mask = (page_size - 1) as u32;
        let start = state.canonical_address();
        // Device-backed code is neither peekable nor tracked for writes
        if bus.memory.page(start & bus.mem_mask()).routes_io() {
            return Err(JitError::IoPage(start));
        }
        let key = self.page_key(state.mode, start);
        if !self.pages.contains_key(&key) {
            debug!(mode = key.0, page = format_args!("{:#x}", key.1), "jit page created");
            self.pages.insert(key, JitPage::new(page_size));
        }

        let limit = self.block_size - SAFETY_MARGIN;
        let mut entries: Vec<(usize, usize)> = Vec::new();
        let mut ip = state.ip & state.ip_mask;
        self.emitter.begin_trace();

        for _ in 0..self.max_trace_length {
            let address = state.code_segment_base.wrapping_add(ip);
            if address & !page_mask != key.1 || bus.memory.page(address & bus.mem_mask()).routes_io() {
                break;
            }
            let slot = (address & page_mask) as usize;
            if !entries.is_empty() {
                if self.emitter.code_len() >= limit {
                    break;
                }
                if let Some(page) = self.pages.get(&key) {
                    if page.entry(slot) != EntryPoint::Unjitted {
                        break;
                    }
                }
            }

            let plan = InstructionPlan::new(model.jit_ops(bus, state.mode, address));
            let step = if plan.needs_interpreter {
                TraceStep::Interpret
            } else {
                TraceStep::Native(&plan.ops)
            };
            let entry = self.emitter.emit_step(step);
            if entries.is_empty() && self.emitter.code_len() > limit {
                return Err(JitError::InstructionTooLarge(address));
            }
            entries.push((slot, entry));

            if plan.needs_interpreter || plan.writes_ip || plan.length == 0 {
                break;
            }
            ip = ip.wrapping_add(plan.length) & state.ip_mask;
        }

        let code = self.emitter.finish_trace()?;
        let (block, base) = self.place(key, &code)?;
        let Some(page) = self.pages.get_mut(&key) else {
            return Err(JitError::NothingCompiled(start));
        };
        for &(slot, entry) in &entries {
            page.entries[slot] = EntryPoint::Compiled { block, offset: base + entry };
        }
        bus.memory.mark_code(key.1);

        self.stats.traces += 1;
        self.stats.instructions += entries.len() as u64;
        debug!(
            start = format_args!("{start:#x}"),
            instructions = entries.len(),
            bytes = code.len(),
            "trace compiled"
        );
        Ok(())
    }

    /// Copy `code` into the page's arena; returns (block index, offset)
    fn place(&mut self, key: (u32, u32), code: &[u8]) -> Result<(usize, usize), JitError> {
        let block_size = self.block_size;
        let Some(page) = self.pages.get_mut(&key) else {
            return Err(JitError::NothingCompiled(key.1));
        };
        let index = match page.blocks.iter().rposition(|b| b.free() >= code.len()) {
            Some(i) => i,
            None => {
                let len = block_size.max(code.len()).div_ceil(NATIVE_PAGE_SIZE) * NATIVE_PAGE_SIZE;
                let memory = self.allocator.allocate(len).map_err(|e| {
                    warn!(len, error = %e, "code arena allocation failed, interpreting instead");
                    JitError::Allocation(e)
                })?;
                debug!(len, page = format_args!("{:#x}", key.1), "code arena block allocated");
                self.stats.blocks += 1;
                page.blocks.push(CodeBlock { memory, used: 0 });
                page.blocks.len() - 1
            }
        };

        let block = &mut page.blocks[index];
        let base = block.used;
        {
            let buf = block.memory.map_for_write()?;
            buf[base..base + code.len()].copy_from_slice(code);
        }
        block.memory.map_for_execute()?;
        block.used += code.len();
        Ok((index, base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::codegen::threaded::ThreadedEmitter;
    use crate::jit::ir::{reg, temp, JitOperation, Oper, FLAG_NEGATIVE, FLAG_ZERO, IP_REG};
    use crate::jit::native::{HeapAllocator, NativeMemoryError};
    use crate::memory::{MemoryBlock, NoIo};

    /// Toy ISA: 0x01 = INC r0 (1 byte), 0x02 nn = LD r0,#nn, 0x03 lo hi = JMP,
    /// 0xFF = handled by the interpreter, anything else = 1-byte NOP
    struct Toy;

    static INC: [JitOperation; 3] = [
        JitOperation::new(Oper::Add, reg(0, 1), 1),
        JitOperation::new(Oper::UpdateFlags, FLAG_ZERO | FLAG_NEGATIVE, reg(0, 1)),
        JitOperation::new(Oper::IncrementIP, 0, 1),
    ];
    static LD: [JitOperation; 2] = [
        JitOperation::new(Oper::ReadImm, reg(0, 1), 1),
        JitOperation::new(Oper::IncrementIP, 0, 2),
    ];
    static JMP: [JitOperation; 2] = [
        JitOperation::new(Oper::ReadImm, temp(0, 2), 1),
        JitOperation::new(Oper::Move, IP_REG, temp(0, 2)),
    ];
    static CUSTOM: [JitOperation; 1] = [JitOperation::new(Oper::Custom, 0, 0)];
    static NOP: [JitOperation; 2] = [
        JitOperation::new(Oper::AddCycles, 0, 1),
        JitOperation::new(Oper::IncrementIP, 0, 1),
    ];

    impl JittableCpu for Toy {
        fn jit_ops(&self, bus: &SystemBus, _mode: u32, address: u32) -> &'static [JitOperation] {
            match bus.peek_byte(address) {
                0x01 => &INC,
                0x02 => &LD,
                0x03 => &JMP,
                0xFF => &CUSTOM,
                _ => &NOP,
            }
        }
    }

    struct NoMemory;

    impl NativeMemoryAllocator for NoMemory {
        fn allocate(&self, len: usize) -> Result<Box<dyn NativeMemory>, NativeMemoryError> {
            Err(NativeMemoryError::Exhausted { len })
        }

        fn is_native(&self) -> bool {
            false
        }
    }

    fn setup(program: &[u8]) -> (JitCore, CpuState, SystemBus, MemoryBlock) {
        let core = JitCore::new(Box::new(ThreadedEmitter::new()), Box::new(HeapAllocator), 32).unwrap();
        let mut state = CpuState::new(1, 16);
        state.event_cycle.set(u64::MAX);
        let mut bus = SystemBus::with_uniform_pages(8, 16, 1, Box::new(NoIo));
        let ram = MemoryBlock::new(0x1_0000);
        ram.load(0, program);
        bus.map(0, &ram, 0, 0x1_0000, false).unwrap();
        (core, state, bus, ram)
    }

    #[test]
    fn test_lazy_fill_and_reuse() {
        // 0: LD #5 ; 2: INC ; 3: JMP $0002
        let (mut core, mut state, mut bus, _ram) = setup(&[0x02, 0x05, 0x01, 0x03, 0x02, 0x00]);
        assert_eq!(core.execute(&Toy, &mut state, &mut bus).unwrap(), ExitReason::Continue);
        assert_eq!(state.regs.get(0), 6);
        assert_eq!(state.ip, 2);
        assert_eq!(core.stats.traces, 1);
        let page = core.page(0, 0).unwrap();
        // Entries for instruction starts only, never for operand bytes
        assert_eq!(page.compiled_offsets(), vec![0, 2, 3]);

        // Re-entering at 2 reuses the mid-trace entry
        core.execute(&Toy, &mut state, &mut bus).unwrap();
        assert_eq!(state.regs.get(0), 7);
        assert_eq!(core.stats.traces, 1);
        assert_eq!(core.stats.runs, 2);
    }

    #[test]
    fn test_trace_stops_at_custom_op() {
        let (mut core, mut state, mut bus, _ram) = setup(&[0x01, 0xFF, 0x01]);
        assert_eq!(core.execute(&Toy, &mut state, &mut bus).unwrap(), ExitReason::Interpret);
        assert_eq!(state.ip, 1);
        assert_eq!(core.page(0, 0).unwrap().compiled_offsets(), vec![0, 1]);
        // The interpreter stub is itself an entry, so no recompilation
        assert_eq!(core.execute(&Toy, &mut state, &mut bus).unwrap(), ExitReason::Interpret);
        assert_eq!(core.stats.traces, 1);
    }

    #[test]
    fn test_trace_stops_at_page_end_and_max_length() {
        let (mut core, mut state, mut bus, _ram) = setup(&[0xEA; 0x200]);
        state.ip = 0xFC;
        core.execute(&Toy, &mut state, &mut bus).unwrap();
        assert_eq!(state.ip, 0x100);
        assert_eq!(core.page(0, 0).unwrap().compiled_offsets(), vec![0xFC, 0xFD, 0xFE, 0xFF]);

        let mut short = JitCore::new(Box::new(ThreadedEmitter::new()), Box::new(HeapAllocator), 3).unwrap();
        state.ip = 0x100;
        short.execute(&Toy, &mut state, &mut bus).unwrap();
        assert_eq!(state.ip, 0x103);
    }

    #[test]
    fn test_write_invalidates_page() {
        let (mut core, mut state, mut bus, _ram) = setup(&[0x01, 0x03, 0x00, 0x00]);
        core.execute(&Toy, &mut state, &mut bus).unwrap();
        assert_eq!(state.regs.get(0), 1);
        assert_eq!(core.page_count(), 1);

        // Self-modifying store: INC becomes LD #$40
        bus.write_byte(0x0000, 0x02);
        bus.write_byte(0x0001, 0x40);
        state.ip = 0;
        core.execute(&Toy, &mut state, &mut bus).unwrap();
        assert_eq!(state.regs.get(0), 0x40);
        assert_eq!(core.stats.invalidations, 1);
        assert_eq!(core.stats.traces, 2);
    }

    #[test]
    fn test_modes_have_separate_pages() {
        let (mut core, mut state, mut bus, _ram) = setup(&[0x01, 0x03, 0x00, 0x00]);
        core.execute(&Toy, &mut state, &mut bus).unwrap();
        state.mode = 1;
        core.execute(&Toy, &mut state, &mut bus).unwrap();
        assert_eq!(core.page_count(), 2);
        core.jit_invalidate_for_write(0x0042);
        assert_eq!(core.page_count(), 0);
    }

    #[test]
    fn test_allocation_failure_is_recoverable() {
        let (_, mut state, mut bus, _ram) = setup(&[0x01]);
        let mut core = JitCore::new(Box::new(ThreadedEmitter::new()), Box::new(NoMemory), 32).unwrap();
        assert!(matches!(core.execute(&Toy, &mut state, &mut bus), Err(JitError::Allocation(_))));
        assert_eq!(state.ip, 0);
        assert_eq!(state.regs.get(0), 0);
        assert_eq!(core.stats.fallbacks, 1);
    }

    #[test]
    fn test_io_routed_pages_are_interpreted() {
        let (mut core, mut state, mut bus, ram) = setup(&[]);
        ram.load(0x100, &[0x01, 0x01, 0x03, 0x00, 0x01]);
        // only the top of page 1 goes to the devices
        let page = bus.memory.page_mut(0x100);
        page.io_mask = 0xFFF0;
        page.io_eq = 0x01F0;
        state.ip = 0x100;
        assert!(matches!(
            core.execute(&Toy, &mut state, &mut bus),
            Err(JitError::IoPage(0x100))
        ));
        assert_eq!(state.ip, 0x100);
        assert_eq!(core.stats.traces, 0);
        assert_eq!(core.stats.fallbacks, 1);
        assert!(core.page(0, 0x100).is_none());

        // plain memory pages still compile
        state.ip = 0;
        ram.load(0, &[0x01, 0x03, 0x00, 0x00]);
        core.execute(&Toy, &mut state, &mut bus).unwrap();
        assert_eq!(core.stats.traces, 1);
    }

    #[test]
    fn test_small_blocks_grow_arena() {
        let (core, mut state, mut bus, _ram) = setup(&[0xEA; 0x100]);
        let mut core = core.with_block_size(SAFETY_MARGIN * 2);
        for start in [0x00u32, 0x40, 0x80] {
            state.ip = start;
            core.execute(&Toy, &mut state, &mut bus).unwrap();
        }
        // Each trace stops once it is within the safety margin of a block
        assert_eq!(state.ip, 0x88);
        assert_eq!(core.stats.traces, 3);
        assert_eq!(core.stats.blocks as usize, core.page(0, 0).unwrap().block_count());
    }
}
