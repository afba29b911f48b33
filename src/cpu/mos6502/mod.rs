//! A MOS 6502 subset
//!
//! Enough of the instruction set to drive the engine end to end: loads,
//! stores, transfers, increments, flag ops, immediate ALU ops, branches,
//! the stack, JSR/RTS and the BRK/RTI interrupt path. Decimal mode is not
//! implemented and undocumented opcodes execute as one-byte NOPs.
//!
//! Instructions without side effects beyond registers and plain memory are
//! also described as JIT micro-ops (see [`jit_ops`]); the rest are
//! interpreted.

mod asm;
mod disasm;
mod jit_ops;
mod ops;

use crate::cpu::{Assembler, CpuState, DebugReg, Disassembler, EmulatedCpu, InterruptKind};
use crate::jit::{JitOperation, JittableCpu};
use crate::memory::SystemBus;

pub const A: usize = 0;
pub const X: usize = 1;
pub const Y: usize = 2;
pub const S: usize = 3;

pub const FLAG_C: u8 = 0x01;
pub const FLAG_Z: u8 = 0x02;
pub const FLAG_I: u8 = 0x04;
pub const FLAG_D: u8 = 0x08;
pub const FLAG_B: u8 = 0x10;
pub const FLAG_V: u8 = 0x40;
pub const FLAG_N: u8 = 0x80;

pub const NMI_VECTOR: u32 = 0xFFFA;
pub const RESET_VECTOR: u32 = 0xFFFC;
pub const IRQ_VECTOR: u32 = 0xFFFE;

/// 256-byte pages, one per 6502 page
pub const PAGE_SHIFT: u32 = 8;

/// Addressing modes of the supported subset
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrMode {
    Implied,
    Accumulator,
    Immediate,
    Absolute,
    Relative,
}

impl AddrMode {
    pub fn len(self) -> u32 {
        match self {
            AddrMode::Implied | AddrMode::Accumulator => 1,
            AddrMode::Immediate | AddrMode::Relative => 2,
            AddrMode::Absolute => 3,
        }
    }
}

pub(crate) const OPCODES: &[(u8, &str, AddrMode)] = &[
    (0x00, "BRK", AddrMode::Implied),
    (0x09, "ORA", AddrMode::Immediate),
    (0x0A, "ASL", AddrMode::Accumulator),
    (0x10, "BPL", AddrMode::Relative),
    (0x18, "CLC", AddrMode::Implied),
    (0x20, "JSR", AddrMode::Absolute),
    (0x29, "AND", AddrMode::Immediate),
    (0x30, "BMI", AddrMode::Relative),
    (0x38, "SEC", AddrMode::Implied),
    (0x40, "RTI", AddrMode::Implied),
    (0x48, "PHA", AddrMode::Implied),
    (0x49, "EOR", AddrMode::Immediate),
    (0x4C, "JMP", AddrMode::Absolute),
    (0x58, "CLI", AddrMode::Implied),
    (0x60, "RTS", AddrMode::Implied),
    (0x68, "PLA", AddrMode::Implied),
    (0x69, "ADC", AddrMode::Immediate),
    (0x78, "SEI", AddrMode::Implied),
    (0x88, "DEY", AddrMode::Implied),
    (0x8A, "TXA", AddrMode::Implied),
    (0x8C, "STY", AddrMode::Absolute),
    (0x8D, "STA", AddrMode::Absolute),
    (0x8E, "STX", AddrMode::Absolute),
    (0x90, "BCC", AddrMode::Relative),
    (0x98, "TYA", AddrMode::Implied),
    (0xA0, "LDY", AddrMode::Immediate),
    (0xA2, "LDX", AddrMode::Immediate),
    (0xA8, "TAY", AddrMode::Implied),
    (0xA9, "LDA", AddrMode::Immediate),
    (0xAA, "TAX", AddrMode::Implied),
    (0xAC, "LDY", AddrMode::Absolute),
    (0xAD, "LDA", AddrMode::Absolute),
    (0xAE, "LDX", AddrMode::Absolute),
    (0xB0, "BCS", AddrMode::Relative),
    (0xC8, "INY", AddrMode::Implied),
    (0xC9, "CMP", AddrMode::Immediate),
    (0xCA, "DEX", AddrMode::Implied),
    (0xD0, "BNE", AddrMode::Relative),
    (0xE8, "INX", AddrMode::Implied),
    (0xEA, "NOP", AddrMode::Implied),
    (0xF0, "BEQ", AddrMode::Relative),
];

pub(crate) fn lookup(opcode: u8) -> Option<(&'static str, AddrMode)> {
    OPCODES
        .iter()
        .find(|(op, _, _)| *op == opcode)
        .map(|&(_, name, mode)| (name, mode))
}

/// Processor status byte from the engine's flag encoding
pub fn status(state: &CpuState) -> u8 {
    let mut p = 0x20 | (state.other_flags as u8 & (FLAG_V | FLAG_D));
    if state.negative_flag() {
        p |= FLAG_N;
    }
    if state.zero_flag() {
        p |= FLAG_Z;
    }
    if state.carry_flag() {
        p |= FLAG_C;
    }
    if !state.interrupts_enabled {
        p |= FLAG_I;
    }
    p
}

pub fn set_status(state: &mut CpuState, p: u8) {
    state.negative = (p >> 7) as u32;
    state.zero = if p & FLAG_Z != 0 { 0 } else { 1 };
    state.carry = (p & FLAG_C) as u32;
    state.interrupts_enabled = p & FLAG_I == 0;
    state.other_flags = (p & (FLAG_V | FLAG_D)) as u32;
}

#[derive(Default)]
pub struct Mos6502;

impl Mos6502 {
    pub fn new() -> Self {
        Mos6502
    }
}

impl EmulatedCpu for Mos6502 {
    fn name(&self) -> &'static str {
        "mos6502"
    }

    fn address_bus_bits(&self) -> u32 {
        16
    }

    fn pc_bits(&self) -> u32 {
        16
    }

    fn create_state(&self) -> CpuState {
        CpuState::new(4, self.pc_bits())
    }

    fn power_on(&mut self, state: &mut CpuState, bus: &mut SystemBus) {
        for r in [A, X, Y] {
            state.regs.set8(r, 0);
        }
        state.regs.set8(S, 0);
        set_status(state, FLAG_I);
        self.reset(state, bus);
    }

    fn reset(&mut self, state: &mut CpuState, bus: &mut SystemBus) {
        ops::reset(state, bus);
    }

    fn execute(&mut self, state: &mut CpuState, bus: &mut SystemBus) {
        ops::execute(state, bus);
    }

    fn interrupt(&mut self, kind: InterruptKind, state: &mut CpuState, bus: &mut SystemBus) {
        ops::interrupt(kind, state, bus);
    }

    fn disassembler(&self) -> Option<&dyn Disassembler> {
        Some(self)
    }

    fn assembler(&self) -> Option<&dyn Assembler> {
        Some(self)
    }

    fn jittable(&self) -> Option<&dyn JittableCpu> {
        Some(self)
    }

    fn debug_registers(&self, state: &CpuState) -> Vec<DebugReg> {
        let byte = |name, value: u8| DebugReg { name, value: value as u32, width: 1 };
        vec![
            DebugReg { name: "PC", value: state.ip, width: 2 },
            byte("A", state.regs.get8(A)),
            byte("X", state.regs.get8(X)),
            byte("Y", state.regs.get8(Y)),
            byte("S", state.regs.get8(S)),
            byte("P", status(state)),
        ]
    }

    fn set_register(&mut self, state: &mut CpuState, name: &str, value: u32) -> bool {
        match name.to_ascii_uppercase().as_str() {
            "PC" => state.ip = value & state.ip_mask,
            "A" => state.regs.set8(A, value as u8),
            "X" => state.regs.set8(X, value as u8),
            "Y" => state.regs.set8(Y, value as u8),
            "S" => state.regs.set8(S, value as u8),
            "P" => set_status(state, value as u8),
            _ => return false,
        }
        true
    }
}

impl JittableCpu for Mos6502 {
    fn jit_ops(&self, bus: &SystemBus, _mode: u32, address: u32) -> &'static [JitOperation] {
        jit_ops::for_opcode(bus.peek_byte(address))
    }
}
