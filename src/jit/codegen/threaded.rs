//! Portable threaded-code backend
//!
//! Each micro-op is encoded as a 12-byte record `[op, 0, 0, 0, dst, src]`
//! (little-endian `u32`s) and stored in the code arena like native code
//! would be. Two extra record kinds mark instruction prologues and exits.

use super::{must_yield, CodeEmitter, ExitReason, JitContext, TraceStep};
use crate::jit::ir::{width_mask, Oper, Operand, FLAG_CARRY, FLAG_INTERRUPTS, FLAG_NEGATIVE, FLAG_ZERO};
use crate::jit::native::NativeMemory;
use crate::jit::JitError;
use crate::memory::SystemBus;

const RECORD: usize = 12;
const OP_PROLOGUE: u8 = 0x80;
const OP_EXIT: u8 = 0x81;

#[derive(Default)]
pub struct ThreadedEmitter {
    code: Vec<u8>,
}

impl ThreadedEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, op: u8, dst: u32, src: u32) {
        self.code.extend_from_slice(&[op, 0, 0, 0]);
        self.code.extend_from_slice(&dst.to_le_bytes());
        self.code.extend_from_slice(&src.to_le_bytes());
    }
}

impl CodeEmitter for ThreadedEmitter {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn needs_native_memory(&self) -> bool {
        false
    }

    fn begin_trace(&mut self) {
        self.code.clear();
    }

    fn emit_step(&mut self, step: TraceStep<'_>) -> usize {
        let entry = self.code.len();
        self.record(OP_PROLOGUE, 0, 0);
        match step {
            TraceStep::Native(ops) => {
                for op in ops {
                    match op.op {
                        Oper::End | Oper::ExecuteSublist | Oper::Custom | Oper::Interrupt => {
                            panic!("{:?} cannot be compiled; the plan should have caught it", op.op)
                        }
                        o => self.record(o as u8, op.dst, op.src),
                    }
                }
            }
            TraceStep::Interpret => self.record(OP_EXIT, 0, ExitReason::Interpret as u32),
        }
        entry
    }

    fn code_len(&self) -> usize {
        self.code.len()
    }

    fn finish_trace(&mut self) -> Result<Vec<u8>, JitError> {
        self.record(OP_EXIT, 0, ExitReason::Continue as u32);
        Ok(std::mem::take(&mut self.code))
    }

    fn execute(&self, block: &dyn NativeMemory, offset: usize, ctx: &mut JitContext, bus: &mut SystemBus) -> ExitReason {
        run(block.as_slice(), offset, ctx, bus)
    }
}

fn field(code: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]])
}

fn run(code: &[u8], mut pc: usize, ctx: &mut JitContext, bus: &mut SystemBus) -> ExitReason {
    loop {
        let op = code[pc];
        let dst = field(code, pc + 4);
        let src = field(code, pc + 8);
        pc += RECORD;
        match op {
            OP_PROLOGUE => {
                if must_yield(ctx) {
                    return ExitReason::Yield;
                }
            }
            OP_EXIT => return ExitReason::from_u32(src),
            _ => match Oper::from_u8(op) {
                Some(o) => step(o, dst, src, ctx, bus),
                None => panic!("corrupt threaded code: op {op:#x} at {:#x}", pc - RECORD),
            },
        }
    }
}

fn read_operand(ctx: &JitContext, raw: u32) -> u32 {
    match Operand::decode(raw) {
        Operand::Register { index, width } => ctx.regs[index] & width_mask(width),
        Operand::Temp { index, width } => ctx.temps[index] & width_mask(width),
        Operand::Ip => ctx.ip,
        Operand::DataBase => ctx.data_base,
        Operand::Immediate(v) => v,
    }
}

fn write_operand(ctx: &mut JitContext, raw: u32, value: u32) {
    match Operand::decode(raw) {
        Operand::Register { index, width } => {
            let m = width_mask(width);
            ctx.regs[index] = (ctx.regs[index] & !m) | (value & m);
        }
        Operand::Temp { index, width } => {
            let m = width_mask(width);
            ctx.temps[index] = (ctx.temps[index] & !m) | (value & m);
        }
        Operand::Ip => ctx.ip = value & ctx.ip_mask,
        Operand::DataBase => ctx.data_base = value,
        Operand::Immediate(_) => panic!("immediate {raw:#x} used as a destination"),
    }
}

fn read_bus(ctx: &mut JitContext, bus: &mut SystemBus, width: u32, addr_of: impl Fn(u32) -> u32) -> u32 {
    let mut value = 0;
    for k in 0..width {
        let (b, cycles) = bus.read_byte(addr_of(k));
        ctx.cycle += cycles as u64;
        value |= (b as u32) << (8 * k);
    }
    value
}

fn write_bus(ctx: &mut JitContext, bus: &mut SystemBus, addr: u32, value: u32, width: u32) {
    for k in 0..width {
        let cycles = bus.write_byte(addr.wrapping_add(k), (value >> (8 * k)) as u8);
        ctx.cycle += cycles as u64;
    }
    if bus.memory.has_dirty_code() {
        ctx.yield_requested = 1;
    }
}

fn set_flags(ctx: &mut JitContext, mask: u32, set: bool) {
    if mask & FLAG_ZERO != 0 {
        ctx.zero = if set { 0 } else { 1 };
    }
    if mask & FLAG_NEGATIVE != 0 {
        ctx.negative = set as u32;
    }
    if mask & FLAG_CARRY != 0 {
        ctx.carry = set as u32;
    }
    if mask & FLAG_INTERRUPTS != 0 {
        ctx.interrupts_enabled = set as u32;
    }
}

fn step(op: Oper, dst: u32, src: u32, ctx: &mut JitContext, bus: &mut SystemBus) {
    match op {
        Oper::Move => {
            let v = read_operand(ctx, src);
            write_operand(ctx, dst, v);
        }
        Oper::Add => {
            let v = read_operand(ctx, dst).wrapping_add(read_operand(ctx, src));
            write_operand(ctx, dst, v);
        }
        Oper::And => {
            let v = read_operand(ctx, dst) & read_operand(ctx, src);
            write_operand(ctx, dst, v);
        }
        Oper::Or => {
            let v = read_operand(ctx, dst) | read_operand(ctx, src);
            write_operand(ctx, dst, v);
        }
        Oper::Xor => {
            let v = read_operand(ctx, dst) ^ read_operand(ctx, src);
            write_operand(ctx, dst, v);
        }
        Oper::ShiftLeftImm => {
            let v = read_operand(ctx, dst) << (src & 31);
            write_operand(ctx, dst, v);
        }
        Oper::ClearFlag => set_flags(ctx, dst, false),
        Oper::SetFlag => set_flags(ctx, dst, true),
        Oper::IncrementIP => {
            ctx.ip = ctx.ip.wrapping_add(read_operand(ctx, src)) & ctx.ip_mask;
        }
        Oper::UpdateFlags => {
            let width = Operand::decode(src).width();
            let v = read_operand(ctx, src);
            if dst & FLAG_ZERO != 0 {
                ctx.zero = v;
            }
            if dst & FLAG_NEGATIVE != 0 {
                ctx.negative = (v >> (width * 8 - 1)) & 1;
            }
        }
        Oper::Read | Oper::ReadNoSegment => {
            let base = if op == Oper::Read { ctx.data_base } else { 0 };
            let addr = base.wrapping_add(read_operand(ctx, src));
            let v = read_bus(ctx, bus, Operand::decode(dst).width(), |k| addr.wrapping_add(k));
            write_operand(ctx, dst, v);
        }
        Oper::ReadImm => {
            let (ip, offset, mask, code_base) = (ctx.ip, read_operand(ctx, src), ctx.ip_mask, ctx.code_base);
            let v = read_bus(ctx, bus, Operand::decode(dst).width(), |k| {
                code_base.wrapping_add(ip.wrapping_add(offset).wrapping_add(k) & mask)
            });
            write_operand(ctx, dst, v);
        }
        Oper::Write | Oper::WriteNoSegment => {
            let base = if op == Oper::Write { ctx.data_base } else { 0 };
            let addr = base.wrapping_add(read_operand(ctx, dst));
            let value = read_operand(ctx, src);
            write_bus(ctx, bus, addr, value, Operand::decode(src).width());
        }
        Oper::AddCycles => ctx.cycle += read_operand(ctx, src) as u64,
        Oper::End | Oper::ExecuteSublist | Oper::Custom | Oper::Interrupt => {
            unreachable!("{op:?} is never emitted")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuState;
    use crate::jit::ir::{reg, temp, JitOperation, IP_REG};
    use crate::jit::native::{HeapMemory, NativeMemory};
    use crate::memory::{MemoryBlock, NoIo};

    fn bus_with(program: &[u8]) -> (SystemBus, MemoryBlock) {
        let mut bus = SystemBus::with_uniform_pages(8, 16, 2, Box::new(NoIo));
        let ram = MemoryBlock::new(0x1_0000);
        ram.load(0, program);
        bus.map(0, &ram, 0, 0x1_0000, false).unwrap();
        (bus, ram)
    }

    fn assemble(steps: &[TraceStep<'_>]) -> (HeapMemory, Vec<usize>) {
        let mut e = ThreadedEmitter::new();
        e.begin_trace();
        let offsets = steps.iter().map(|s| e.emit_step(*s)).collect();
        let code = e.finish_trace().unwrap();
        let mut mem = HeapMemory::new(code.len());
        mem.map_for_write().unwrap()[..code.len()].copy_from_slice(&code);
        mem.map_for_execute().unwrap();
        (mem, offsets)
    }

    fn run_at(mem: &HeapMemory, offset: usize, state: &mut CpuState, bus: &mut SystemBus) -> ExitReason {
        let mut ctx = JitContext::load(state).unwrap();
        let exit = ThreadedEmitter::new().execute(mem, offset, &mut ctx, bus);
        ctx.store(state);
        exit
    }

    fn state() -> CpuState {
        let mut s = CpuState::new(4, 16);
        s.event_cycle.set(u64::MAX);
        s
    }

    #[test]
    fn test_load_add_store() {
        // LDA #$40 ; ADD 2 ; STA $0300
        let load = [
            JitOperation::new(Oper::ReadImm, reg(0, 1), 1),
            JitOperation::new(Oper::UpdateFlags, FLAG_ZERO | FLAG_NEGATIVE, reg(0, 1)),
            JitOperation::new(Oper::IncrementIP, 0, 2),
        ];
        let add = [
            JitOperation::new(Oper::Add, reg(0, 1), 0xC2),
            JitOperation::new(Oper::UpdateFlags, FLAG_ZERO | FLAG_NEGATIVE, reg(0, 1)),
            JitOperation::new(Oper::AddCycles, 0, 1),
            JitOperation::new(Oper::IncrementIP, 0, 1),
        ];
        let store = [
            JitOperation::new(Oper::ReadImm, temp(0, 2), 1),
            JitOperation::new(Oper::Write, temp(0, 2), reg(0, 1)),
            JitOperation::new(Oper::IncrementIP, 0, 3),
        ];
        let (mem, offsets) = assemble(&[TraceStep::Native(&load), TraceStep::Native(&add), TraceStep::Native(&store)]);
        let (mut bus, ram) = bus_with(&[0xA9, 0x40, 0x00, 0x8D, 0x00, 0x03]);
        let mut s = state();

        assert_eq!(run_at(&mem, offsets[0], &mut s, &mut bus), ExitReason::Continue);
        // 0x40 + 0xC2 wraps to 0x02 in an 8-bit register
        assert_eq!(s.regs.get(0), 0x02);
        assert!(!s.zero_flag());
        assert!(!s.negative_flag());
        assert_eq!(ram.read(0x300), 0x02);
        assert_eq!(s.ip, 6);
        // 1 read + 1 internal + 2 reads + 1 write, two cycles per access
        assert_eq!(s.cycle, 2 + 1 + 4 + 2);
    }

    #[test]
    fn test_mid_trace_entry_and_yield() {
        let nop = [JitOperation::new(Oper::AddCycles, 0, 1), JitOperation::new(Oper::IncrementIP, 0, 1)];
        let (mem, offsets) = assemble(&[TraceStep::Native(&nop), TraceStep::Native(&nop)]);
        let (mut bus, _ram) = bus_with(&[]);
        let mut s = state();
        s.ip = 1;
        assert_eq!(run_at(&mem, offsets[1], &mut s, &mut bus), ExitReason::Continue);
        assert_eq!((s.ip, s.cycle), (2, 1));

        // Event due: the first prologue bails out before doing anything
        s.ip = 0;
        s.event_cycle.set(1);
        assert_eq!(run_at(&mem, offsets[0], &mut s, &mut bus), ExitReason::Yield);
        assert_eq!((s.ip, s.cycle), (0, 1));
    }

    #[test]
    fn test_interrupt_prologue_and_interpret_exit() {
        let jmp = [
            JitOperation::new(Oper::ReadImm, temp(0, 2), 1),
            JitOperation::new(Oper::Move, IP_REG, temp(0, 2)),
        ];
        let (mem, offsets) = assemble(&[TraceStep::Interpret, TraceStep::Native(&jmp)]);
        let (mut bus, _ram) = bus_with(&[0xEA, 0x4C, 0x34, 0x12]);
        let mut s = state();
        assert_eq!(run_at(&mem, offsets[0], &mut s, &mut bus), ExitReason::Interpret);

        s.ip = 1;
        s.interrupts.set_source(crate::cpu::InterruptSignal::IRQ);
        s.interrupts_enabled = false;
        assert_eq!(run_at(&mem, offsets[1], &mut s, &mut bus), ExitReason::Continue);
        assert_eq!(s.ip, 0x1234);

        s.ip = 1;
        s.interrupts_enabled = true;
        assert_eq!(run_at(&mem, offsets[1], &mut s, &mut bus), ExitReason::Yield);
    }

    #[test]
    fn test_flag_ops() {
        let ops = [
            JitOperation::new(Oper::SetFlag, FLAG_CARRY | FLAG_INTERRUPTS, 0),
            JitOperation::new(Oper::ClearFlag, FLAG_ZERO, 0),
            JitOperation::new(Oper::Move, reg(1, 1), 0x81),
            JitOperation::new(Oper::ShiftLeftImm, reg(1, 1), 1),
            JitOperation::new(Oper::UpdateFlags, FLAG_NEGATIVE, reg(1, 1)),
        ];
        let (mem, offsets) = assemble(&[TraceStep::Native(&ops)]);
        let (mut bus, _ram) = bus_with(&[]);
        let mut s = state();
        run_at(&mem, offsets[0], &mut s, &mut bus);
        assert!(s.carry_flag());
        assert!(s.interrupts_enabled);
        assert!(!s.zero_flag());
        assert_eq!(s.regs.get(1), 0x02);
        assert!(!s.negative_flag());
    }
}
