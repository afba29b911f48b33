//! Code emitters
//!
//! Every emitter consumes the same flattened micro-op lists and runs against
//! the same [`JitContext`], so compiled code behaves identically whichever
//! backend produced it:
//! - `threaded`: portable encoded ops run by a small executor (always built)
//! - `dynasm`: x86-64 machine code (`jit-dynasm` feature)

pub mod threaded;

#[cfg(all(unix, feature = "jit-dynasm", target_arch = "x86_64"))]
pub mod dynasm;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::ir::{JitOperation, TEMP_REGISTERS};
use super::native::NativeMemory;
use super::JitError;
use crate::cpu::{interrupt_for, CpuState};
use crate::memory::SystemBus;

/// Register file slots visible to compiled code
pub const JIT_REGISTERS: usize = 16;

/// Why compiled code handed control back
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ExitReason {
    /// Ran to the end of the trace or took a jump; `ip` is the next instruction
    Continue = 0,
    /// An instruction prologue found an event due, an interrupt pending or
    /// stale code; `ip` is that instruction, not yet executed
    Yield = 1,
    /// The instruction at `ip` must go through the interpreter
    Interpret = 2,
}

impl ExitReason {
    pub fn from_u32(v: u32) -> ExitReason {
        match v {
            1 => ExitReason::Yield,
            2 => ExitReason::Interpret,
            _ => ExitReason::Continue,
        }
    }
}

/// Machine state as seen by compiled code.
///
/// Loaded from [`CpuState`] before entering a trace and stored back after.
#[repr(C)]
pub struct JitContext {
    pub regs: [u32; JIT_REGISTERS],
    pub temps: [u32; TEMP_REGISTERS],
    pub ip: u32,
    pub ip_mask: u32,
    pub code_base: u32,
    pub data_base: u32,
    pub zero: u32,
    pub negative: u32,
    pub carry: u32,
    pub interrupts_enabled: u32,
    pub exit: u32,
    /// Set when a write hit a page holding compiled code
    pub yield_requested: u32,
    /// Scratch words for multi-byte bus transfers
    pub scratch_value: u32,
    pub scratch_addr: u32,
    pub cycle: u64,
    pub event_cycle: *const AtomicU64,
    pub pending: *const AtomicU32,
    /// Only valid for the duration of an `execute` call
    pub bus: *mut SystemBus,
}

impl JitContext {
    /// Snapshot of `state`; `None` if the model has more registers than
    /// compiled code can address
    pub fn load(state: &CpuState) -> Option<Self> {
        if state.regs.len() > JIT_REGISTERS {
            return None;
        }
        let mut regs = [0u32; JIT_REGISTERS];
        for (i, r) in regs.iter_mut().enumerate().take(state.regs.len()) {
            *r = state.regs.get32(i);
        }
        Some(JitContext {
            regs,
            temps: [0; TEMP_REGISTERS],
            ip: state.ip & state.ip_mask,
            ip_mask: state.ip_mask,
            code_base: state.code_segment_base,
            data_base: state.data_segments[0],
            zero: state.zero,
            negative: state.negative,
            carry: state.carry,
            interrupts_enabled: state.interrupts_enabled as u32,
            exit: ExitReason::Continue as u32,
            yield_requested: 0,
            scratch_value: 0,
            scratch_addr: 0,
            cycle: state.cycle,
            event_cycle: state.event_cycle.as_atomic(),
            pending: state.interrupts.as_atomic(),
            bus: std::ptr::null_mut(),
        })
    }

    pub fn store(&self, state: &mut CpuState) {
        for i in 0..state.regs.len() {
            state.regs.set32(i, self.regs[i]);
        }
        state.ip = self.ip;
        state.data_segments[0] = self.data_base;
        state.zero = self.zero;
        state.negative = self.negative;
        state.carry = self.carry;
        state.interrupts_enabled = self.interrupts_enabled != 0;
        state.cycle = self.cycle;
    }

    pub fn exit_reason(&self) -> ExitReason {
        ExitReason::from_u32(self.exit)
    }
}

/// One instruction of a trace
#[derive(Clone, Copy, Debug)]
pub enum TraceStep<'a> {
    /// Compile these flattened ops
    Native(&'a [JitOperation]),
    /// Exit to the interpreter when reached
    Interpret,
}

/// Backend that turns trace steps into code and runs it.
///
/// Emission is incremental: `begin_trace`, one `emit_step` per instruction,
/// then `finish_trace`. Code must be position independent; the core copies
/// it into the arena at an arbitrary offset.
pub trait CodeEmitter: Send {
    fn name(&self) -> &'static str;

    /// The code is real machine code and needs executable memory
    fn needs_native_memory(&self) -> bool;

    fn begin_trace(&mut self);

    /// Emit the instruction prologue and body; returns the entry offset
    fn emit_step(&mut self, step: TraceStep<'_>) -> usize;

    /// Bytes emitted so far in this trace
    fn code_len(&self) -> usize;

    /// Close the trace with a `Continue` exit and return the code
    fn finish_trace(&mut self) -> Result<Vec<u8>, JitError>;

    /// Run code at `offset` in an executable block
    fn execute(&self, block: &dyn NativeMemory, offset: usize, ctx: &mut JitContext, bus: &mut SystemBus)
        -> ExitReason;
}

/// Prologue predicate shared by every backend
#[inline(always)]
pub(crate) fn must_yield(ctx: &JitContext) -> bool {
    // SAFETY: both pointers come from the CpuState borrowed for the whole run
    let (event_cycle, pending) = unsafe { (&*ctx.event_cycle, &*ctx.pending) };
    ctx.cycle >= event_cycle.load(Ordering::Acquire)
        || ctx.yield_requested != 0
        || interrupt_for(pending.load(Ordering::Acquire), ctx.interrupts_enabled != 0).is_some()
}
