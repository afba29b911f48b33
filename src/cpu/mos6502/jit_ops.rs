//! Micro-op descriptions
//!
//! Every list starts with the shared opcode fetch so the compiled code
//! charges the same bus cycles as the interpreter.

use super::{A, X, Y};
use crate::jit::ir::{
    reg, temp, JitOperation, Oper, FLAG_CARRY, FLAG_INTERRUPTS, FLAG_NEGATIVE, FLAG_ZERO, IP_REG, NO_DUPLICATE_LIST,
};

const fn op(o: Oper, dst: u32, src: u32) -> JitOperation {
    JitOperation::new(o, dst, src)
}

const RA: u32 = reg(A as u32, 1);
const RX: u32 = reg(X as u32, 1);
const RY: u32 = reg(Y as u32, 1);
const T8: u32 = temp(0, 1);
const T16: u32 = temp(0, 2);
const NZ: u32 = FLAG_ZERO | FLAG_NEGATIVE;

static OPCODE_FETCH: [JitOperation; 2] = [op(Oper::ReadImm, temp(3, 1), 0), JitOperation::end()];

macro_rules! fetch {
    () => {
        JitOperation::sublist(&OPCODE_FETCH, NO_DUPLICATE_LIST)
    };
}

static NOP: [JitOperation; 3] = [fetch!(), op(Oper::AddCycles, 0, 1), op(Oper::IncrementIP, 0, 1)];

static INTERPRET: [JitOperation; 1] = [op(Oper::Custom, 0, 0)];

static BRK: [JitOperation; 1] = [op(Oper::Interrupt, 0, 0)];

static LDA_IMM: [JitOperation; 4] = [
    fetch!(),
    op(Oper::ReadImm, RA, 1),
    op(Oper::UpdateFlags, NZ, RA),
    op(Oper::IncrementIP, 0, 2),
];

static LDX_IMM: [JitOperation; 4] = [
    fetch!(),
    op(Oper::ReadImm, RX, 1),
    op(Oper::UpdateFlags, NZ, RX),
    op(Oper::IncrementIP, 0, 2),
];

static LDY_IMM: [JitOperation; 4] = [
    fetch!(),
    op(Oper::ReadImm, RY, 1),
    op(Oper::UpdateFlags, NZ, RY),
    op(Oper::IncrementIP, 0, 2),
];

static ABSOLUTE_OPERAND: [JitOperation; 2] = [op(Oper::ReadImm, T16, 1), JitOperation::end()];

macro_rules! operand {
    () => {
        JitOperation::sublist(&ABSOLUTE_OPERAND, 0)
    };
}

static LDA_ABS: [JitOperation; 5] = [
    fetch!(),
    operand!(),
    op(Oper::Read, RA, T16),
    op(Oper::UpdateFlags, NZ, RA),
    op(Oper::IncrementIP, 0, 3),
];

static LDX_ABS: [JitOperation; 5] = [
    fetch!(),
    operand!(),
    op(Oper::Read, RX, T16),
    op(Oper::UpdateFlags, NZ, RX),
    op(Oper::IncrementIP, 0, 3),
];

static LDY_ABS: [JitOperation; 5] = [
    fetch!(),
    operand!(),
    op(Oper::Read, RY, T16),
    op(Oper::UpdateFlags, NZ, RY),
    op(Oper::IncrementIP, 0, 3),
];

static STA_ABS: [JitOperation; 4] = [fetch!(), operand!(), op(Oper::Write, T16, RA), op(Oper::IncrementIP, 0, 3)];

static STX_ABS: [JitOperation; 4] = [fetch!(), operand!(), op(Oper::Write, T16, RX), op(Oper::IncrementIP, 0, 3)];

static STY_ABS: [JitOperation; 4] = [fetch!(), operand!(), op(Oper::Write, T16, RY), op(Oper::IncrementIP, 0, 3)];

macro_rules! transfer {
    ($name:ident, $from:expr, $to:expr) => {
        static $name: [JitOperation; 5] = [
            fetch!(),
            op(Oper::AddCycles, 0, 1),
            op(Oper::Move, $to, $from),
            op(Oper::UpdateFlags, NZ, $to),
            op(Oper::IncrementIP, 0, 1),
        ];
    };
}

transfer!(TAX, RA, RX);
transfer!(TAY, RA, RY);
transfer!(TXA, RX, RA);
transfer!(TYA, RY, RA);

macro_rules! step {
    ($name:ident, $reg:expr, $delta:expr) => {
        static $name: [JitOperation; 5] = [
            fetch!(),
            op(Oper::AddCycles, 0, 1),
            op(Oper::Add, $reg, $delta),
            op(Oper::UpdateFlags, NZ, $reg),
            op(Oper::IncrementIP, 0, 1),
        ];
    };
}

step!(INX, RX, 1);
step!(INY, RY, 1);
step!(DEX, RX, 0xFF);
step!(DEY, RY, 0xFF);

macro_rules! flag {
    ($name:ident, $oper:expr, $flag:expr) => {
        static $name: [JitOperation; 4] = [
            fetch!(),
            op(Oper::AddCycles, 0, 1),
            op($oper, $flag, 0),
            op(Oper::IncrementIP, 0, 1),
        ];
    };
}

flag!(CLC, Oper::ClearFlag, FLAG_CARRY);
flag!(SEC, Oper::SetFlag, FLAG_CARRY);
// The engine tracks "interrupts enabled", the inverse of the I flag
flag!(CLI, Oper::SetFlag, FLAG_INTERRUPTS);
flag!(SEI, Oper::ClearFlag, FLAG_INTERRUPTS);

macro_rules! alu_imm {
    ($name:ident, $oper:expr) => {
        static $name: [JitOperation; 5] = [
            fetch!(),
            op(Oper::ReadImm, T8, 1),
            op($oper, RA, T8),
            op(Oper::UpdateFlags, NZ, RA),
            op(Oper::IncrementIP, 0, 2),
        ];
    };
}

alu_imm!(AND_IMM, Oper::And);
alu_imm!(ORA_IMM, Oper::Or);
alu_imm!(EOR_IMM, Oper::Xor);

static JMP_ABS: [JitOperation; 3] = [fetch!(), operand!(), op(Oper::Move, IP_REG, T16)];

pub(super) fn for_opcode(opcode: u8) -> &'static [JitOperation] {
    match opcode {
        0xA9 => &LDA_IMM,
        0xA2 => &LDX_IMM,
        0xA0 => &LDY_IMM,
        0xAD => &LDA_ABS,
        0xAE => &LDX_ABS,
        0xAC => &LDY_ABS,
        0x8D => &STA_ABS,
        0x8E => &STX_ABS,
        0x8C => &STY_ABS,
        0xAA => &TAX,
        0xA8 => &TAY,
        0x8A => &TXA,
        0x98 => &TYA,
        0xE8 => &INX,
        0xC8 => &INY,
        0xCA => &DEX,
        0x88 => &DEY,
        0x18 => &CLC,
        0x38 => &SEC,
        0x58 => &CLI,
        0x78 => &SEI,
        0x29 => &AND_IMM,
        0x09 => &ORA_IMM,
        0x49 => &EOR_IMM,
        0x4C => &JMP_ABS,
        0x00 => &BRK,
        0x69 | 0xC9 | 0x0A | 0x20 | 0x60 | 0x40 | 0x48 | 0x68 | 0x10 | 0x30 | 0x90 | 0xB0 | 0xD0 | 0xF0 => {
            &INTERPRET
        }
        _ => &NOP,
    }
}
