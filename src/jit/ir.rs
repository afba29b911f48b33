//! Micro-op IR that CPU models describe their instructions with
//!
//! Operands are tagged integers. The high bits pick the operand class, the
//! width field holds the access size in bytes and the low bits hold an index:
//!
//! | class       | meaning                                   |
//! |-------------|-------------------------------------------|
//! | `MEMORY`    | register file slot `index`                |
//! | `TEMP_REG`  | scratch register `index` (0..4)           |
//! | `IP_REG`    | instruction pointer                       |
//! | `DATA_BASE` | default data segment base                 |
//! | none        | the raw value is an immediate             |
//!
//! A width of 0 means four bytes.

pub const TEMP_REG: u32 = 0x1000_0000;
pub const MEMORY: u32 = 0x2000_0000;
pub const IP_REG: u32 = 0x4000_0000;
pub const DATA_BASE: u32 = 0x0800_0000;
const CLASS_MASK: u32 = TEMP_REG | MEMORY | IP_REG | DATA_BASE;

const WIDTH_SHIFT: u32 = 10;
const INDEX_MASK: u32 = (1 << WIDTH_SHIFT) - 1;

pub const FLAG_ZERO: u32 = 0x10;
pub const FLAG_NEGATIVE: u32 = 0x20;
pub const FLAG_CARRY: u32 = 0x40;
pub const FLAG_INTERRUPTS: u32 = 0x100;

/// `ExecuteSublist` flag: expand this sublist at most once per instruction
pub const NO_DUPLICATE_LIST: u32 = 0x80;

pub const TEMP_REGISTERS: usize = 4;

/// Width field for an `n`-byte access
pub const fn bytes(n: u32) -> u32 {
    (n & 7) << WIDTH_SHIFT
}

/// Register file slot `index`, `width` bytes wide
pub const fn reg(index: u32, width: u32) -> u32 {
    MEMORY | bytes(width) | index
}

pub const fn temp(index: u32, width: u32) -> u32 {
    TEMP_REG | bytes(width) | index
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Oper {
    /// Terminates a list
    End = 0,
    /// Splice `sublist` in place
    ExecuteSublist,
    /// Defer the whole instruction to the model's interpreter
    Custom,
    /// Software interrupt; also deferred to the interpreter
    Interrupt,
    Move,
    Add,
    And,
    Or,
    Xor,
    ClearFlag,
    SetFlag,
    ShiftLeftImm,
    IncrementIP,
    /// Set the flags in `dst` from the value of `src`
    UpdateFlags,
    /// `dst = bus[data_base + src]`
    Read,
    /// `dst = bus[src]`
    ReadNoSegment,
    /// `dst = bus[code_base + ((ip + src) & ip_mask)]`
    ReadImm,
    /// `bus[data_base + dst] = src`
    Write,
    /// `bus[dst] = src`
    WriteNoSegment,
    /// Charge `src` internal cycles
    AddCycles,
}

impl Oper {
    pub const ALL: [Oper; 20] = [
        Oper::End,
        Oper::ExecuteSublist,
        Oper::Custom,
        Oper::Interrupt,
        Oper::Move,
        Oper::Add,
        Oper::And,
        Oper::Or,
        Oper::Xor,
        Oper::ClearFlag,
        Oper::SetFlag,
        Oper::ShiftLeftImm,
        Oper::IncrementIP,
        Oper::UpdateFlags,
        Oper::Read,
        Oper::ReadNoSegment,
        Oper::ReadImm,
        Oper::Write,
        Oper::WriteNoSegment,
        Oper::AddCycles,
    ];

    pub fn from_u8(v: u8) -> Option<Oper> {
        Self::ALL.get(v as usize).copied()
    }

    /// Ops whose destination operand is written
    fn writes_dst(self) -> bool {
        matches!(
            self,
            Oper::Move
                | Oper::Add
                | Oper::And
                | Oper::Or
                | Oper::Xor
                | Oper::ShiftLeftImm
                | Oper::Read
                | Oper::ReadNoSegment
                | Oper::ReadImm
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JitOperation {
    pub op: Oper,
    pub dst: u32,
    pub src: u32,
    pub sublist: Option<&'static [JitOperation]>,
}

impl JitOperation {
    pub const fn new(op: Oper, dst: u32, src: u32) -> Self {
        JitOperation { op, dst, src, sublist: None }
    }

    pub const fn sublist(list: &'static [JitOperation], flags: u32) -> Self {
        JitOperation {
            op: Oper::ExecuteSublist,
            dst: 0,
            src: flags,
            sublist: Some(list),
        }
    }

    pub const fn end() -> Self {
        Self::new(Oper::End, 0, 0)
    }
}

/// Decoded operand
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Register { index: usize, width: u32 },
    Temp { index: usize, width: u32 },
    Ip,
    DataBase,
    Immediate(u32),
}

impl Operand {
    pub fn decode(raw: u32) -> Operand {
        let width = match (raw >> WIDTH_SHIFT) & 7 {
            0 => 4,
            w => w,
        };
        let index = (raw & INDEX_MASK) as usize;
        match raw & CLASS_MASK {
            IP_REG => Operand::Ip,
            MEMORY => Operand::Register { index, width },
            TEMP_REG => Operand::Temp { index, width },
            DATA_BASE => Operand::DataBase,
            _ => Operand::Immediate(raw),
        }
    }

    /// Access size in bytes; immediates count as one byte
    pub fn width(&self) -> u32 {
        match *self {
            Operand::Register { width, .. } | Operand::Temp { width, .. } => width,
            Operand::Ip | Operand::DataBase => 4,
            Operand::Immediate(_) => 1,
        }
    }

    pub fn mask(&self) -> u32 {
        width_mask(self.width())
    }
}

#[inline(always)]
pub fn width_mask(width: u32) -> u32 {
    if width >= 4 {
        u32::MAX
    } else {
        (1u32 << (width * 8)) - 1
    }
}

/// Expand sublists into `out`, stopping at `End`.
///
/// A sublist flagged [`NO_DUPLICATE_LIST`] is expanded only the first time
/// it is reached.
pub fn flatten(ops: &'static [JitOperation], out: &mut Vec<JitOperation>) {
    let mut seen = Vec::new();
    flatten_into(ops, out, &mut seen);
}

fn flatten_into(ops: &'static [JitOperation], out: &mut Vec<JitOperation>, seen: &mut Vec<*const JitOperation>) {
    for op in ops {
        match op.op {
            Oper::End => return,
            Oper::ExecuteSublist => {
                let Some(list) = op.sublist else { continue };
                if op.src & NO_DUPLICATE_LIST != 0 {
                    if seen.contains(&list.as_ptr()) {
                        continue;
                    }
                    seen.push(list.as_ptr());
                }
                flatten_into(list, out, seen);
            }
            _ => out.push(*op),
        }
    }
}

/// What the trace compiler needs to know about one instruction
#[derive(Debug)]
pub struct InstructionPlan {
    pub ops: Vec<JitOperation>,
    /// Contains an op only the interpreter can run
    pub needs_interpreter: bool,
    /// Changes control flow, so the trace ends after it
    pub writes_ip: bool,
    /// Bytes the instruction advances ip by
    pub length: u32,
}

impl InstructionPlan {
    pub fn new(ops: &'static [JitOperation]) -> Self {
        let mut flat = Vec::with_capacity(ops.len() + 4);
        flatten(ops, &mut flat);

        let mut needs_interpreter = false;
        let mut writes_ip = false;
        let mut length = 0u32;
        for op in &flat {
            match op.op {
                Oper::Custom | Oper::Interrupt => needs_interpreter = true,
                Oper::IncrementIP => match Operand::decode(op.src) {
                    Operand::Immediate(n) => length = length.wrapping_add(n),
                    _ => writes_ip = true,
                },
                o if o.writes_dst() && Operand::decode(op.dst) == Operand::Ip => writes_ip = true,
                _ => {}
            }
        }
        InstructionPlan {
            ops: flat,
            needs_interpreter,
            writes_ip,
            length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static SHARED: [JitOperation; 2] = [
        JitOperation::new(Oper::AddCycles, 0, 1),
        JitOperation::end(),
    ];

    static NESTED: [JitOperation; 3] = [
        JitOperation::sublist(&SHARED, NO_DUPLICATE_LIST),
        JitOperation::new(Oper::Move, reg(0, 1), 5),
        JitOperation::end(),
    ];

    static INSN: [JitOperation; 5] = [
        JitOperation::sublist(&SHARED, NO_DUPLICATE_LIST),
        JitOperation::sublist(&NESTED, 0),
        JitOperation::new(Oper::IncrementIP, 0, 2),
        JitOperation::end(),
        JitOperation::new(Oper::Custom, 0, 0),
    ];

    static JUMP: [JitOperation; 2] = [
        JitOperation::new(Oper::ReadImm, temp(0, 2), 1),
        JitOperation::new(Oper::Move, IP_REG, temp(0, 2)),
    ];

    #[test]
    fn test_operand_decode() {
        assert_eq!(Operand::decode(reg(3, 1)), Operand::Register { index: 3, width: 1 });
        assert_eq!(Operand::decode(reg(3, 0)), Operand::Register { index: 3, width: 4 });
        assert_eq!(Operand::decode(temp(1, 2)), Operand::Temp { index: 1, width: 2 });
        assert_eq!(Operand::decode(IP_REG), Operand::Ip);
        assert_eq!(Operand::decode(DATA_BASE), Operand::DataBase);
        assert_eq!(Operand::decode(0x1234), Operand::Immediate(0x1234));
        assert_eq!(Operand::decode(reg(0, 2)).mask(), 0xFFFF);
    }

    #[test]
    fn test_flatten_dedups_shared_sublist() {
        let plan = InstructionPlan::new(&INSN);
        let ops: Vec<Oper> = plan.ops.iter().map(|o| o.op).collect();
        // SHARED once, then NESTED's Move, then IncrementIP; stops at End
        assert_eq!(ops, vec![Oper::AddCycles, Oper::Move, Oper::IncrementIP]);
        assert_eq!(plan.length, 2);
        assert!(!plan.needs_interpreter);
        assert!(!plan.writes_ip);
    }

    #[test]
    fn test_jump_writes_ip() {
        let plan = InstructionPlan::new(&JUMP);
        assert!(plan.writes_ip);
        assert_eq!(plan.length, 0);
    }

    #[test]
    fn test_oper_round_trip_through_u8() {
        for op in Oper::ALL {
            assert_eq!(Oper::from_u8(op as u8), Some(op));
        }
        assert_eq!(Oper::from_u8(200), None);
    }
}
