//! Disassembler for the supported subset

use super::{lookup, AddrMode, Mos6502};
use crate::cpu::{CpuInstruction, Disassembler};
use crate::memory::SystemBus;

impl Disassembler for Mos6502 {
    fn disassemble_one(&self, bus: &SystemBus, address: u32) -> CpuInstruction {
        let mask = bus.mem_mask();
        let byte = |offset: u32| bus.peek_byte(address.wrapping_add(offset) & mask);
        let opcode = byte(0);
        let Some((name, mode)) = lookup(opcode) else {
            return CpuInstruction {
                address,
                bytes: vec![opcode],
                mnemonic: format!(".byte ${opcode:02X}"),
            };
        };
        let bytes: Vec<u8> = (0..mode.len()).map(byte).collect();
        let mnemonic = match mode {
            AddrMode::Implied => name.to_string(),
            AddrMode::Accumulator => format!("{name} A"),
            AddrMode::Immediate => format!("{name} #${:02X}", bytes[1]),
            AddrMode::Absolute => format!("{name} ${:04X}", u16::from_le_bytes([bytes[1], bytes[2]])),
            AddrMode::Relative => {
                let target = address.wrapping_add(2).wrapping_add(bytes[1] as i8 as i32 as u32) & 0xFFFF;
                format!("{name} ${target:04X}")
            }
        };
        CpuInstruction { address, bytes, mnemonic }
    }
}
