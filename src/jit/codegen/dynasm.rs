//! x86-64 backend built on dynasm-rs
//!
//! Every instruction gets a small entry stub so a trace can be entered at
//! any instruction boundary:
//!
//! ```text
//! entry_i: push rbx ; mov rbx, rdi      ; rbx = *mut JitContext
//! body_i:  prologue (yield check)
//!          micro-ops
//!          jmp body_i+1                 ; skips the next entry stub
//! ```
//!
//! Every exit stores the reason, pops `rbx` and returns. Bus accesses call
//! back into Rust through `sysv64` helpers. Code only uses relative jumps
//! between its own labels and absolute helper addresses, so it can be copied
//! anywhere in the arena.

use std::mem::offset_of;

use dynasm::dynasm;
use dynasmrt::x64::X64Relocation;
use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi, VecAssembler};

use super::{CodeEmitter, ExitReason, JitContext, TraceStep};
use crate::cpu::InterruptSignal;
use crate::jit::ir::{width_mask, Oper, Operand, FLAG_CARRY, FLAG_INTERRUPTS, FLAG_NEGATIVE, FLAG_ZERO};
use crate::jit::native::{NativeMemory, Protection};
use crate::jit::JitError;
use crate::memory::SystemBus;

type Asm = VecAssembler<X64Relocation>;

const CARRY: i32 = offset_of!(JitContext, carry) as i32;
const CODE_BASE: i32 = offset_of!(JitContext, code_base) as i32;
const CYCLE: i32 = offset_of!(JitContext, cycle) as i32;
const DATA_BASE: i32 = offset_of!(JitContext, data_base) as i32;
const EVENT_CYCLE: i32 = offset_of!(JitContext, event_cycle) as i32;
const EXIT: i32 = offset_of!(JitContext, exit) as i32;
const INTERRUPTS_ENABLED: i32 = offset_of!(JitContext, interrupts_enabled) as i32;
const IP: i32 = offset_of!(JitContext, ip) as i32;
const IP_MASK: i32 = offset_of!(JitContext, ip_mask) as i32;
const NEGATIVE: i32 = offset_of!(JitContext, negative) as i32;
const PENDING: i32 = offset_of!(JitContext, pending) as i32;
const REGS: i32 = offset_of!(JitContext, regs) as i32;
const SCRATCH_ADDR: i32 = offset_of!(JitContext, scratch_addr) as i32;
const SCRATCH_VALUE: i32 = offset_of!(JitContext, scratch_value) as i32;
const TEMPS: i32 = offset_of!(JitContext, temps) as i32;
const YIELD_REQUESTED: i32 = offset_of!(JitContext, yield_requested) as i32;
const ZERO: i32 = offset_of!(JitContext, zero) as i32;

extern "sysv64" fn helper_read(ctx: *mut JitContext, addr: u32) -> u32 {
    // SAFETY: called only from a trace entered through `execute`, which set `bus`
    let ctx = unsafe { &mut *ctx };
    let bus = unsafe { &mut *ctx.bus };
    let (value, cycles) = bus.read_byte(addr);
    ctx.cycle += cycles as u64;
    value as u32
}

extern "sysv64" fn helper_write(ctx: *mut JitContext, addr: u32, value: u32) {
    // SAFETY: as for `helper_read`
    let ctx = unsafe { &mut *ctx };
    let bus = unsafe { &mut *ctx.bus };
    ctx.cycle += bus.write_byte(addr, value as u8) as u64;
    if bus.memory.has_dirty_code() {
        ctx.yield_requested = 1;
    }
}

pub struct DynasmEmitter {
    ops: Asm,
    yield_label: DynamicLabel,
    steps: usize,
}

impl Default for DynasmEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl DynasmEmitter {
    pub fn new() -> Self {
        let mut ops = Asm::new(0);
        let yield_label = ops.new_dynamic_label();
        DynasmEmitter { ops, yield_label, steps: 0 }
    }

    fn exit(&mut self, reason: ExitReason) {
        let reason = reason as i32;
        dynasm!(self.ops
            ; mov DWORD [rbx + EXIT], reason
            ; pop rbx
            ; ret
        );
    }

    fn prologue(&mut self) {
        let ok = self.ops.new_dynamic_label();
        let bail = self.yield_label;
        let nmi = InterruptSignal::NMI_BIT as i32;
        let maskable = InterruptSignal::MASKABLE_BITS as i32;
        dynasm!(self.ops
            ; mov rax, QWORD [rbx + CYCLE]
            ; mov rcx, QWORD [rbx + EVENT_CYCLE]
            ; cmp rax, QWORD [rcx]
            ; jae =>bail
            ; cmp DWORD [rbx + YIELD_REQUESTED], 0
            ; jne =>bail
            ; mov rcx, QWORD [rbx + PENDING]
            ; mov eax, DWORD [rcx]
            ; test eax, nmi
            ; jnz =>bail
            ; and eax, maskable
            ; jz =>ok
            ; cmp DWORD [rbx + INTERRUPTS_ENABLED], 0
            ; jne =>bail
            ; =>ok
        );
    }

    /// eax = operand, masked to its width
    fn load(&mut self, raw: u32) {
        match Operand::decode(raw) {
            Operand::Register { index, width } => {
                let o = REGS + index as i32 * 4;
                dynasm!(self.ops ; mov eax, DWORD [rbx + o]);
                self.mask(width);
            }
            Operand::Temp { index, width } => {
                let o = TEMPS + index as i32 * 4;
                dynasm!(self.ops ; mov eax, DWORD [rbx + o]);
                self.mask(width);
            }
            Operand::Ip => dynasm!(self.ops ; mov eax, DWORD [rbx + IP]),
            Operand::DataBase => dynasm!(self.ops ; mov eax, DWORD [rbx + DATA_BASE]),
            Operand::Immediate(v) => dynasm!(self.ops ; mov eax, v as i32),
        }
    }

    fn mask(&mut self, width: u32) {
        if width < 4 {
            let m = width_mask(width) as i32;
            dynasm!(self.ops ; and eax, m);
        }
    }

    /// operand = eax; clobbers ecx
    fn store(&mut self, raw: u32) {
        match Operand::decode(raw) {
            Operand::Register { index, width } => self.store_slot(REGS + index as i32 * 4, width),
            Operand::Temp { index, width } => self.store_slot(TEMPS + index as i32 * 4, width),
            Operand::Ip => dynasm!(self.ops
                ; and eax, DWORD [rbx + IP_MASK]
                ; mov DWORD [rbx + IP], eax
            ),
            Operand::DataBase => dynasm!(self.ops ; mov DWORD [rbx + DATA_BASE], eax),
            Operand::Immediate(_) => panic!("immediate {raw:#x} used as a destination"),
        }
    }

    fn store_slot(&mut self, o: i32, width: u32) {
        match width {
            1 => dynasm!(self.ops ; mov BYTE [rbx + o], al),
            2 => dynasm!(self.ops ; mov WORD [rbx + o], ax),
            3 => {
                let m = width_mask(width) as i32;
                let keep = !m;
                dynasm!(self.ops
                    ; and eax, m
                    ; mov ecx, DWORD [rbx + o]
                    ; and ecx, keep
                    ; or ecx, eax
                    ; mov DWORD [rbx + o], ecx
                );
            }
            _ => dynasm!(self.ops ; mov DWORD [rbx + o], eax),
        }
    }

    fn set_flags(&mut self, mask: u32, set: bool) {
        let (on, off) = (set as i32, (!set) as i32);
        if mask & FLAG_ZERO != 0 {
            // Z is set when the stored result is zero
            dynasm!(self.ops ; mov DWORD [rbx + ZERO], off);
        }
        if mask & FLAG_NEGATIVE != 0 {
            dynasm!(self.ops ; mov DWORD [rbx + NEGATIVE], on);
        }
        if mask & FLAG_CARRY != 0 {
            dynasm!(self.ops ; mov DWORD [rbx + CARRY], on);
        }
        if mask & FLAG_INTERRUPTS != 0 {
            dynasm!(self.ops ; mov DWORD [rbx + INTERRUPTS_ENABLED], on);
        }
    }

    /// Read one byte at esi into eax
    fn call_read(&mut self) {
        let helper = helper_read as usize as i64;
        dynasm!(self.ops
            ; mov rdi, rbx
            ; mov rax, QWORD helper
            ; call rax
        );
    }

    /// Assemble `width` bytes read by `addr_of_byte` into scratch_value, then eax
    fn read_bytes(&mut self, width: u32, addr_of_byte: impl Fn(&mut Self, i32)) {
        dynasm!(self.ops ; mov DWORD [rbx + SCRATCH_VALUE], 0);
        for k in 0..width as i32 {
            addr_of_byte(self, k);
            self.call_read();
            if k > 0 {
                let shift = (8 * k) as i8;
                dynasm!(self.ops ; shl eax, shift);
            }
            dynasm!(self.ops ; or DWORD [rbx + SCRATCH_VALUE], eax);
        }
        dynasm!(self.ops ; mov eax, DWORD [rbx + SCRATCH_VALUE]);
    }

    fn binary(&mut self, op: Oper, dst: u32, src: u32) {
        self.load(src);
        dynasm!(self.ops ; mov edx, eax);
        self.load(dst);
        match op {
            Oper::Add => dynasm!(self.ops ; add eax, edx),
            Oper::And => dynasm!(self.ops ; and eax, edx),
            Oper::Or => dynasm!(self.ops ; or eax, edx),
            Oper::Xor => dynasm!(self.ops ; xor eax, edx),
            _ => unreachable!(),
        }
        self.store(dst);
    }

    fn op(&mut self, op: Oper, dst: u32, src: u32) {
        match op {
            Oper::Move => {
                self.load(src);
                self.store(dst);
            }
            Oper::Add | Oper::And | Oper::Or | Oper::Xor => self.binary(op, dst, src),
            Oper::ShiftLeftImm => {
                self.load(dst);
                let n = (src & 31) as i8;
                dynasm!(self.ops ; shl eax, n);
                self.store(dst);
            }
            Oper::ClearFlag => self.set_flags(dst, false),
            Oper::SetFlag => self.set_flags(dst, true),
            Oper::IncrementIP => {
                self.load(src);
                dynasm!(self.ops
                    ; add eax, DWORD [rbx + IP]
                    ; and eax, DWORD [rbx + IP_MASK]
                    ; mov DWORD [rbx + IP], eax
                );
            }
            Oper::UpdateFlags => {
                let sign = (Operand::decode(src).width() * 8 - 1) as i8;
                self.load(src);
                if dst & FLAG_ZERO != 0 {
                    dynasm!(self.ops ; mov DWORD [rbx + ZERO], eax);
                }
                if dst & FLAG_NEGATIVE != 0 {
                    dynasm!(self.ops
                        ; mov ecx, eax
                        ; shr ecx, sign
                        ; and ecx, 1
                        ; mov DWORD [rbx + NEGATIVE], ecx
                    );
                }
            }
            Oper::Read | Oper::ReadNoSegment => {
                self.load(src);
                if op == Oper::Read {
                    dynasm!(self.ops ; add eax, DWORD [rbx + DATA_BASE]);
                }
                dynasm!(self.ops ; mov DWORD [rbx + SCRATCH_ADDR], eax);
                self.read_bytes(Operand::decode(dst).width(), |e, k| {
                    dynasm!(e.ops
                        ; mov esi, DWORD [rbx + SCRATCH_ADDR]
                        ; add esi, k
                    );
                });
                self.store(dst);
            }
            Oper::ReadImm => {
                self.load(src);
                dynasm!(self.ops ; mov DWORD [rbx + SCRATCH_ADDR], eax);
                self.read_bytes(Operand::decode(dst).width(), |e, k| {
                    dynasm!(e.ops
                        ; mov esi, DWORD [rbx + IP]
                        ; add esi, DWORD [rbx + SCRATCH_ADDR]
                        ; add esi, k
                        ; and esi, DWORD [rbx + IP_MASK]
                        ; add esi, DWORD [rbx + CODE_BASE]
                    );
                });
                self.store(dst);
            }
            Oper::Write | Oper::WriteNoSegment => {
                self.load(dst);
                if op == Oper::Write {
                    dynasm!(self.ops ; add eax, DWORD [rbx + DATA_BASE]);
                }
                dynasm!(self.ops ; mov DWORD [rbx + SCRATCH_ADDR], eax);
                self.load(src);
                dynasm!(self.ops ; mov DWORD [rbx + SCRATCH_VALUE], eax);
                let helper = helper_write as usize as i64;
                for k in 0..Operand::decode(src).width() as i32 {
                    let shift = (8 * k) as i8;
                    dynasm!(self.ops
                        ; mov esi, DWORD [rbx + SCRATCH_ADDR]
                        ; add esi, k
                        ; mov edx, DWORD [rbx + SCRATCH_VALUE]
                        ; shr edx, shift
                        ; and edx, 0xFF
                        ; mov rdi, rbx
                        ; mov rax, QWORD helper
                        ; call rax
                    );
                }
            }
            Oper::AddCycles => {
                self.load(src);
                dynasm!(self.ops ; add QWORD [rbx + CYCLE], rax);
            }
            Oper::End | Oper::ExecuteSublist | Oper::Custom | Oper::Interrupt => {
                panic!("{op:?} has no native encoding")
            }
        }
    }
}

impl CodeEmitter for DynasmEmitter {
    fn name(&self) -> &'static str {
        "x64"
    }

    fn needs_native_memory(&self) -> bool {
        true
    }

    fn begin_trace(&mut self) {
        *self = Self::new();
    }

    fn emit_step(&mut self, step: TraceStep<'_>) -> usize {
        let body = self.ops.new_dynamic_label();
        if self.steps > 0 {
            dynasm!(self.ops ; jmp =>body);
        }
        self.steps += 1;
        let entry = self.ops.offset().0;
        dynasm!(self.ops
            ; push rbx
            ; mov rbx, rdi
            ; =>body
        );
        self.prologue();
        match step {
            TraceStep::Native(ops) => {
                for op in ops {
                    self.op(op.op, op.dst, op.src);
                }
            }
            TraceStep::Interpret => self.exit(ExitReason::Interpret),
        }
        entry
    }

    fn code_len(&self) -> usize {
        self.ops.offset().0
    }

    fn finish_trace(&mut self) -> Result<Vec<u8>, JitError> {
        self.exit(ExitReason::Continue);
        let bail = self.yield_label;
        dynasm!(self.ops ; =>bail);
        self.exit(ExitReason::Yield);
        let ops = std::mem::replace(&mut self.ops, Asm::new(0));
        self.steps = 0;
        ops.finalize().map_err(|e| JitError::Assembler(e.to_string()))
    }

    fn execute(&self, block: &dyn NativeMemory, offset: usize, ctx: &mut JitContext, bus: &mut SystemBus) -> ExitReason {
        assert_eq!(block.protection(), Protection::Executable, "jump into a block that is not executable");
        assert!(offset < block.len());
        ctx.bus = bus as *mut SystemBus;
        // SAFETY: `offset` is an entry stub recorded when the trace was copied
        // into this block, and the block is mapped read/execute
        unsafe {
            let entry: unsafe extern "sysv64" fn(*mut JitContext) = std::mem::transmute(block.as_ptr().add(offset));
            entry(ctx);
        }
        ctx.bus = std::ptr::null_mut();
        ctx.exit_reason()
    }
}
