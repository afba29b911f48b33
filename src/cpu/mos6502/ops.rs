//! Interpreter
//!
//! Bus accesses happen in the same order and cost the same cycles as the
//! micro-op descriptions in `jit_ops`, so compiled and interpreted runs
//! agree cycle for cycle.

use tracing::trace;

use super::{set_status, status, A, FLAG_B, FLAG_V, IRQ_VECTOR, NMI_VECTOR, RESET_VECTOR, S, X, Y};
use crate::cpu::{CpuState, InterruptKind};
use crate::memory::SystemBus;

#[inline]
fn fetch(state: &mut CpuState, bus: &mut SystemBus, offset: u32) -> u8 {
    let addr = state
        .code_segment_base
        .wrapping_add(state.ip.wrapping_add(offset) & state.ip_mask);
    let (v, cycles) = bus.read_byte(addr);
    state.cycle += cycles as u64;
    v
}

fn fetch16(state: &mut CpuState, bus: &mut SystemBus, offset: u32) -> u16 {
    let lo = fetch(state, bus, offset);
    let hi = fetch(state, bus, offset + 1);
    u16::from_le_bytes([lo, hi])
}

fn read(state: &mut CpuState, bus: &mut SystemBus, addr: u32) -> u8 {
    let (v, cycles) = bus.read_byte(state.data_segments[0].wrapping_add(addr));
    state.cycle += cycles as u64;
    v
}

fn write(state: &mut CpuState, bus: &mut SystemBus, addr: u32, value: u8) {
    let cycles = bus.write_byte(state.data_segments[0].wrapping_add(addr), value);
    state.cycle += cycles as u64;
}

fn read_vector(state: &mut CpuState, bus: &mut SystemBus, vector: u32) -> u16 {
    let (lo, c1) = bus.read_byte(vector);
    let (hi, c2) = bus.read_byte(vector + 1);
    state.cycle += (c1 + c2) as u64;
    u16::from_le_bytes([lo, hi])
}

fn push(state: &mut CpuState, bus: &mut SystemBus, value: u8) {
    let sp = state.regs.get8(S);
    write(state, bus, 0x100 | sp as u32, value);
    state.regs.set8(S, sp.wrapping_sub(1));
}

fn pull(state: &mut CpuState, bus: &mut SystemBus) -> u8 {
    let sp = state.regs.get8(S).wrapping_add(1);
    state.regs.set8(S, sp);
    read(state, bus, 0x100 | sp as u32)
}

#[inline]
fn internal(state: &mut CpuState, cycles: u64) {
    state.cycle += cycles;
}

#[inline]
fn advance(state: &mut CpuState, n: u32) {
    state.ip = state.ip.wrapping_add(n) & state.ip_mask;
}

fn load(state: &mut CpuState, r: usize, value: u8) {
    state.regs.set8(r, value);
    state.set_nz8(value);
}

fn absolute_address(state: &mut CpuState, bus: &mut SystemBus) -> u32 {
    fetch16(state, bus, 1) as u32
}

fn branch(state: &mut CpuState, bus: &mut SystemBus, taken: bool) {
    let offset = fetch(state, bus, 1) as i8;
    advance(state, 2);
    if taken {
        internal(state, 1);
        let target = state.ip.wrapping_add(offset as i32 as u32) & state.ip_mask;
        if target & 0xFF00 != state.ip & 0xFF00 {
            internal(state, 1);
        }
        state.ip = target;
    }
}

fn push_pc_and_status(state: &mut CpuState, bus: &mut SystemBus, pc: u32, p: u8) {
    let [lo, hi] = (pc as u16).to_le_bytes();
    push(state, bus, hi);
    push(state, bus, lo);
    push(state, bus, p);
}

pub(super) fn reset(state: &mut CpuState, bus: &mut SystemBus) {
    internal(state, 5);
    let sp = state.regs.get8(S).wrapping_sub(3);
    state.regs.set8(S, sp);
    state.interrupts_enabled = false;
    state.ip = read_vector(state, bus, RESET_VECTOR) as u32;
}

pub(super) fn interrupt(kind: InterruptKind, state: &mut CpuState, bus: &mut SystemBus) {
    internal(state, 2);
    let p = status(state) & !FLAG_B;
    let pc = state.ip;
    push_pc_and_status(state, bus, pc, p);
    state.interrupts_enabled = false;
    let vector = match kind {
        InterruptKind::Irq => IRQ_VECTOR,
        InterruptKind::Nmi => NMI_VECTOR,
    };
    state.ip = read_vector(state, bus, vector) as u32;
}

pub(super) fn execute(state: &mut CpuState, bus: &mut SystemBus) {
    let opcode = fetch(state, bus, 0);
    match opcode {
        // Loads
        0xA9 => {
            let v = fetch(state, bus, 1);
            load(state, A, v);
            advance(state, 2);
        }
        0xA2 => {
            let v = fetch(state, bus, 1);
            load(state, X, v);
            advance(state, 2);
        }
        0xA0 => {
            let v = fetch(state, bus, 1);
            load(state, Y, v);
            advance(state, 2);
        }
        0xAD | 0xAE | 0xAC => {
            let addr = absolute_address(state, bus);
            let v = read(state, bus, addr);
            let r = match opcode {
                0xAD => A,
                0xAE => X,
                _ => Y,
            };
            load(state, r, v);
            advance(state, 3);
        }

        // Stores
        0x8D | 0x8E | 0x8C => {
            let addr = absolute_address(state, bus);
            let r = match opcode {
                0x8D => A,
                0x8E => X,
                _ => Y,
            };
            let v = state.regs.get8(r);
            write(state, bus, addr, v);
            advance(state, 3);
        }

        // Transfers, increments and decrements
        0xAA | 0xA8 | 0x8A | 0x98 => {
            let (from, to) = match opcode {
                0xAA => (A, X),
                0xA8 => (A, Y),
                0x8A => (X, A),
                _ => (Y, A),
            };
            internal(state, 1);
            let v = state.regs.get8(from);
            load(state, to, v);
            advance(state, 1);
        }
        0xE8 | 0xC8 | 0xCA | 0x88 => {
            let (r, delta) = match opcode {
                0xE8 => (X, 1u8),
                0xC8 => (Y, 1),
                0xCA => (X, 0xFF),
                _ => (Y, 0xFF),
            };
            internal(state, 1);
            let v = state.regs.get8(r).wrapping_add(delta);
            load(state, r, v);
            advance(state, 1);
        }

        // Flags
        0x18 | 0x38 => {
            internal(state, 1);
            state.carry = (opcode == 0x38) as u32;
            advance(state, 1);
        }
        0x58 | 0x78 => {
            internal(state, 1);
            state.interrupts_enabled = opcode == 0x58;
            advance(state, 1);
        }

        // Immediate ALU
        0x29 | 0x09 | 0x49 => {
            let m = fetch(state, bus, 1);
            let a = state.regs.get8(A);
            let v = match opcode {
                0x29 => a & m,
                0x09 => a | m,
                _ => a ^ m,
            };
            load(state, A, v);
            advance(state, 2);
        }
        0x69 => {
            let m = fetch(state, bus, 1);
            let a = state.regs.get8(A);
            let sum = a as u32 + m as u32 + state.carry;
            let result = sum as u8;
            let overflow = (!(a ^ m) & (a ^ result) & 0x80) != 0;
            state.carry = (sum > 0xFF) as u32;
            state.other_flags = (state.other_flags & !(FLAG_V as u32)) | if overflow { FLAG_V as u32 } else { 0 };
            load(state, A, result);
            advance(state, 2);
        }
        0xC9 => {
            let m = fetch(state, bus, 1);
            let a = state.regs.get8(A);
            state.carry = (a >= m) as u32;
            state.set_nz8(a.wrapping_sub(m));
            advance(state, 2);
        }
        0x0A => {
            internal(state, 1);
            let a = state.regs.get8(A);
            state.carry = (a >> 7) as u32;
            load(state, A, a << 1);
            advance(state, 1);
        }

        // Control flow
        0x4C => {
            state.ip = absolute_address(state, bus) & state.ip_mask;
        }
        0x20 => {
            let lo = fetch(state, bus, 1);
            internal(state, 1);
            let [ret_lo, ret_hi] = (state.ip.wrapping_add(2) as u16).to_le_bytes();
            push(state, bus, ret_hi);
            push(state, bus, ret_lo);
            let hi = fetch(state, bus, 2);
            state.ip = u16::from_le_bytes([lo, hi]) as u32 & state.ip_mask;
        }
        0x60 => {
            fetch(state, bus, 1);
            internal(state, 1);
            let lo = pull(state, bus);
            let hi = pull(state, bus);
            internal(state, 1);
            state.ip = (u16::from_le_bytes([lo, hi]) as u32).wrapping_add(1) & state.ip_mask;
        }
        0xD0 => {
            let taken = !state.zero_flag();
            branch(state, bus, taken);
        }
        0xF0 => {
            let taken = state.zero_flag();
            branch(state, bus, taken);
        }
        0x10 => {
            let taken = !state.negative_flag();
            branch(state, bus, taken);
        }
        0x30 => {
            let taken = state.negative_flag();
            branch(state, bus, taken);
        }
        0x90 => {
            let taken = !state.carry_flag();
            branch(state, bus, taken);
        }
        0xB0 => {
            let taken = state.carry_flag();
            branch(state, bus, taken);
        }

        // Stack
        0x48 => {
            internal(state, 1);
            let a = state.regs.get8(A);
            push(state, bus, a);
            advance(state, 1);
        }
        0x68 => {
            internal(state, 2);
            let v = pull(state, bus);
            load(state, A, v);
            advance(state, 1);
        }

        // Interrupts
        0x00 => {
            fetch(state, bus, 1);
            let p = status(state) | FLAG_B;
            let ret = state.ip.wrapping_add(2);
            push_pc_and_status(state, bus, ret, p);
            state.interrupts_enabled = false;
            state.ip = read_vector(state, bus, IRQ_VECTOR) as u32;
        }
        0x40 => {
            fetch(state, bus, 1);
            internal(state, 1);
            let p = pull(state, bus);
            set_status(state, p);
            let lo = pull(state, bus);
            let hi = pull(state, bus);
            state.ip = u16::from_le_bytes([lo, hi]) as u32 & state.ip_mask;
        }

        0xEA => {
            internal(state, 1);
            advance(state, 1);
        }
        _ => {
            trace!(opcode = format_args!("{opcode:#04x}"), ip = state.ip, "unimplemented opcode");
            internal(state, 1);
            advance(state, 1);
        }
    }
}
