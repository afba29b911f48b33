//! Architecture-agnostic CPU engine
//!
//! A CPU model (see [`mos6502`]) supplies instruction semantics through the
//! [`EmulatedCpu`] trait. Everything else lives here: the shared register and
//! flag bookkeeping in [`CpuState`], the cross-thread interrupt line, the
//! execution loop in [`machine`], the cycle scheduler in [`events`] and the
//! debugger handshake in [`debug`].

pub mod debug;
pub mod events;
pub mod machine;
pub mod mos6502;
pub mod trace;

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jit::JittableCpu;
use crate::memory::SystemBus;

pub use debug::{BreakpointCallback, DebugError, DebugInterface};
pub use events::EventQueue;
pub use machine::{BreakpointHandler, CycleProcessor, Machine};
pub use trace::TraceBuffer;

/// Interrupt flavours the engine dispatches to a model
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum InterruptKind {
    /// Maskable request
    Irq,
    /// Non-maskable request
    Nmi,
}

/// Pending-interrupt bitmask shared between the CPU loop and any thread that
/// raises or drops an interrupt line.
///
/// Each source owns one bit. Bit [`InterruptSignal::NMI`] is the
/// non-maskable line. Source 0 is reserved and never raises an interrupt;
/// every other bit is a maskable request.
/// Read-modify-write updates use `AcqRel`, loads use `Acquire`.
#[derive(Clone, Debug, Default)]
pub struct InterruptSignal(Arc<AtomicU32>);

impl InterruptSignal {
    /// Source number of the generic maskable line
    pub const IRQ: u32 = 1;
    /// Source number of the non-maskable line
    pub const NMI: u32 = 2;
    pub const NMI_BIT: u32 = 1 << Self::NMI;
    /// Bits that request a maskable interrupt
    pub const MASKABLE_BITS: u32 = !(1 | Self::NMI_BIT);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_source(&self, source: u32) {
        self.0.fetch_or(1 << source, Ordering::AcqRel);
    }

    pub fn clear_source(&self, source: u32) {
        self.0.fetch_and(!(1 << source), Ordering::AcqRel);
    }

    #[inline(always)]
    pub fn load(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn store(&self, mask: u32) {
        self.0.store(mask, Ordering::Release);
    }

    /// Which interrupt to take now, if any.
    ///
    /// NMI fires whatever `enabled` says; maskable sources only when enabled.
    #[inline(always)]
    pub fn pending_kind(&self, enabled: bool) -> Option<InterruptKind> {
        interrupt_for(self.load(), enabled)
    }

    pub(crate) fn as_atomic(&self) -> &AtomicU32 {
        &self.0
    }
}

/// Truth table shared by the interpreter loop and the JIT prologue
#[inline(always)]
pub fn interrupt_for(pending: u32, enabled: bool) -> Option<InterruptKind> {
    if pending & InterruptSignal::NMI_BIT != 0 {
        Some(InterruptKind::Nmi)
    } else if enabled && pending & InterruptSignal::MASKABLE_BITS != 0 {
        Some(InterruptKind::Irq)
    } else {
        None
    }
}

/// The `event_cycle` watermark: the cycle at which the run loop must stop
/// and let the event queue catch up. The queue lowers it from any thread.
#[derive(Clone, Debug, Default)]
pub struct CycleSlot(Arc<AtomicU64>);

impl CycleSlot {
    pub fn new(value: u64) -> Self {
        CycleSlot(Arc::new(AtomicU64::new(value)))
    }

    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Release);
    }

    /// Lower the watermark to `value` if it is currently higher
    pub fn lower_to(&self, value: u64) {
        self.0.fetch_min(value, Ordering::AcqRel);
    }

    pub(crate) fn as_atomic(&self) -> &AtomicU64 {
        &self.0
    }
}

/// Fixed-width register storage.
///
/// Registers narrower than 64 bits are accessed through the sized accessors,
/// which leave the untouched upper bits alone.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterFile {
    regs: Vec<u64>,
}

impl RegisterFile {
    pub fn new(count: usize) -> Self {
        RegisterFile { regs: vec![0; count] }
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> u64 {
        self.regs[index]
    }

    #[inline(always)]
    pub fn set(&mut self, index: usize, value: u64) {
        self.regs[index] = value;
    }

    #[inline(always)]
    pub fn get8(&self, index: usize) -> u8 {
        self.regs[index] as u8
    }

    #[inline(always)]
    pub fn set8(&mut self, index: usize, value: u8) {
        self.set_masked(index, value as u64, 0xFF);
    }

    #[inline(always)]
    pub fn get16(&self, index: usize) -> u16 {
        self.regs[index] as u16
    }

    #[inline(always)]
    pub fn set16(&mut self, index: usize, value: u16) {
        self.set_masked(index, value as u64, 0xFFFF);
    }

    #[inline(always)]
    pub fn get32(&self, index: usize) -> u32 {
        self.regs[index] as u32
    }

    #[inline(always)]
    pub fn set32(&mut self, index: usize, value: u32) {
        self.set_masked(index, value as u64, 0xFFFF_FFFF);
    }

    #[inline(always)]
    fn set_masked(&mut self, index: usize, value: u64, mask: u64) {
        let r = &mut self.regs[index];
        *r = (*r & !mask) | (value & mask);
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.regs
    }
}

/// Register, flag and cycle bookkeeping common to every CPU model.
///
/// Flag encodings:
/// - `zero` holds the last result; the Z flag is set when it is 0
/// - `negative` is 1 when the N flag is set
/// - `carry` is 1 when the C flag is set
/// - `other_flags` is model-defined (decimal, overflow, ...)
pub struct CpuState {
    pub regs: RegisterFile,
    /// Program counter within the code segment
    pub ip: u32,
    /// Architectural width of `ip`
    pub ip_mask: u32,
    pub code_segment_base: u32,
    /// Data segment bases; `[0]` is the default data segment
    pub data_segments: [u32; 2],
    /// Model-defined execution mode (e.g. 8/16-bit accumulator); keys JIT pages
    pub mode: u32,
    /// Free-running cycle counter
    pub cycle: u64,
    /// Requested end of the current run
    pub cycle_stop: u64,
    pub event_cycle: CycleSlot,
    pub zero: u32,
    pub negative: u32,
    pub carry: u32,
    pub interrupts_enabled: bool,
    pub other_flags: u32,
    pub interrupts: InterruptSignal,
}

impl CpuState {
    pub fn new(register_count: usize, pc_bits: u32) -> Self {
        let ip_mask = if pc_bits >= 32 { u32::MAX } else { (1u32 << pc_bits) - 1 };
        CpuState {
            regs: RegisterFile::new(register_count),
            ip: 0,
            ip_mask,
            code_segment_base: 0,
            data_segments: [0; 2],
            mode: 0,
            cycle: 0,
            cycle_stop: 0,
            event_cycle: CycleSlot::new(0),
            zero: 1,
            negative: 0,
            carry: 0,
            interrupts_enabled: false,
            other_flags: 0,
            interrupts: InterruptSignal::new(),
        }
    }

    /// Flat address of the next instruction: code segment base plus masked ip
    #[inline(always)]
    pub fn canonical_address(&self) -> u32 {
        self.code_segment_base.wrapping_add(self.ip & self.ip_mask)
    }

    pub fn zero_flag(&self) -> bool {
        self.zero == 0
    }

    pub fn negative_flag(&self) -> bool {
        self.negative & 1 != 0
    }

    pub fn carry_flag(&self) -> bool {
        self.carry != 0
    }

    /// Set Z and N from an 8-bit result
    #[inline(always)]
    pub fn set_nz8(&mut self, value: u8) {
        self.zero = value as u32;
        self.negative = (value >> 7) as u32;
    }
}

/// A named register value as shown by a debugger
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugReg {
    pub name: &'static str,
    pub value: u32,
    /// Display width in bytes
    pub width: u8,
}

/// One decoded instruction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuInstruction {
    pub address: u32,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
}

impl fmt::Display for CpuInstruction {
    /// `AAAAAA: OP B1 B2 B3 MNEMONIC`, padding missing bytes with blanks
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06X}:", self.address)?;
        for i in 0..4 {
            match self.bytes.get(i) {
                Some(b) => write!(f, " {:02X}", b)?,
                None => write!(f, "   ")?,
            }
        }
        write!(f, " {}", self.mnemonic)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DisassemblyConfig {
    pub max_instruction_count: usize,
}

impl Default for DisassemblyConfig {
    fn default() -> Self {
        DisassemblyConfig { max_instruction_count: 16 }
    }
}

/// Optional disassembly capability
pub trait Disassembler {
    /// Decode the instruction at `address` without side effects
    fn disassemble_one(&self, bus: &SystemBus, address: u32) -> CpuInstruction;

    /// Decode up to `config.max_instruction_count` consecutive instructions
    fn disassemble(&self, bus: &SystemBus, config: &DisassemblyConfig, address: u32) -> Vec<CpuInstruction> {
        let mut out = Vec::with_capacity(config.max_instruction_count);
        let mut addr = address;
        for _ in 0..config.max_instruction_count {
            let insn = self.disassemble_one(bus, addr);
            addr = addr.wrapping_add(insn.bytes.len().max(1) as u32) & bus.mem_mask();
            out.push(insn);
        }
        out
    }
}

/// Assembler syntax or range error, reported to the user rather than raised
#[derive(Debug, Error, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct AssembleError {
    pub line: usize,
    pub message: String,
}

/// Optional assembler capability
pub trait Assembler {
    fn assemble(&self, source: &str, origin: u32) -> Result<Vec<u8>, AssembleError>;
}

/// The model contract.
///
/// A model owns no engine state: registers, flags and cycles live in the
/// [`CpuState`] it created, which the [`Machine`] hands back on every call.
pub trait EmulatedCpu: Send {
    fn name(&self) -> &'static str;

    fn address_bus_bits(&self) -> u32;

    fn pc_bits(&self) -> u32;

    /// Fresh state with the model's register layout
    fn create_state(&self) -> CpuState;

    fn power_on(&mut self, state: &mut CpuState, bus: &mut SystemBus);

    fn reset(&mut self, state: &mut CpuState, bus: &mut SystemBus);

    /// Execute exactly one instruction at `state.ip`
    fn execute(&mut self, state: &mut CpuState, bus: &mut SystemBus);

    /// Enter the handler for `kind`
    fn interrupt(&mut self, kind: InterruptKind, state: &mut CpuState, bus: &mut SystemBus);

    fn disassembler(&self) -> Option<&dyn Disassembler> {
        None
    }

    fn assembler(&self) -> Option<&dyn Assembler> {
        None
    }

    fn jittable(&self) -> Option<&dyn JittableCpu> {
        None
    }

    fn debug_registers(&self, _state: &CpuState) -> Vec<DebugReg> {
        Vec::new()
    }

    /// Returns false if no register is called `name`
    fn set_register(&mut self, _state: &mut CpuState, _name: &str, _value: u32) -> bool {
        false
    }

    /// Model-private state beyond [`CpuState`], for save states
    fn save_extra(&self) -> Vec<u8> {
        Vec::new()
    }

    fn load_extra(&mut self, _data: &[u8]) {}
}
