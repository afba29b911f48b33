#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use retrocore::cpu::mos6502::{Mos6502, IRQ_VECTOR, NMI_VECTOR, PAGE_SHIFT, RESET_VECTOR};
use retrocore::cpu::{Assembler, InterruptSignal, Machine};
use retrocore::memory::{IoDevices, MemoryBlock, MemoryMap, Page, SystemBus};
use retrocore::EngineConfig;

pub const ORIGIN: u32 = 0x8000;
pub const HANDLER: u32 = 0x9000;
pub const ACK_PORT: u32 = 0xD000;

pub fn assemble(source: &str, origin: u32) -> Vec<u8> {
    Mos6502
        .assemble(source, origin)
        .unwrap_or_else(|e| panic!("{e}"))
}

/// Interrupt controller stand-in: any write to its page drops the IRQ
/// line, reads return the number of acknowledgements so far
pub struct AckDevice {
    irq: InterruptSignal,
    acks: Arc<AtomicUsize>,
}

impl IoDevices for AckDevice {
    fn read(&mut self, _addr: u32, data: &mut u8, _memory: &mut MemoryMap) {
        *data = self.acks.load(Ordering::SeqCst) as u8;
    }

    fn write(&mut self, _addr: u32, _value: u8, _memory: &mut MemoryMap) {
        self.acks.fetch_add(1, Ordering::SeqCst);
        self.irq.clear_source(InterruptSignal::IRQ);
    }
}

pub struct Board {
    pub machine: Machine,
    pub ram: MemoryBlock,
    pub acks: Arc<AtomicUsize>,
}

/// 64K of RAM with the I/O page at `ACK_PORT`. `main` is assembled at
/// `ORIGIN`, `handler` (if any) at `HANDLER` and used for IRQ and NMI.
pub fn board(main: &str, handler: Option<&str>, config: EngineConfig) -> Board {
    let ram = MemoryBlock::new(0x1_0000);
    ram.load(ORIGIN as usize, &assemble(main, ORIGIN));
    if let Some(src) = handler {
        ram.load(HANDLER as usize, &assemble(src, HANDLER));
    }
    let [lo, hi] = (ORIGIN as u16).to_le_bytes();
    ram.load(RESET_VECTOR as usize, &[lo, hi]);
    let [lo, hi] = (HANDLER as u16).to_le_bytes();
    ram.load(IRQ_VECTOR as usize, &[lo, hi]);
    ram.load(NMI_VECTOR as usize, &[lo, hi]);

    let mut pages = vec![Page::memory(1); 256];
    pages[(ACK_PORT >> PAGE_SHIFT) as usize] = Page::io(1);
    let mut bus = SystemBus::new(PAGE_SHIFT, 16, pages, Box::new(retrocore::memory::NoIo));
    bus.map(0, &ram, 0, 0x1_0000, false).unwrap();

    let mut machine = Machine::new(Box::new(Mos6502::new()), bus, config);
    let acks = Arc::new(AtomicUsize::new(0));
    machine.bus.set_io_devices(Box::new(AckDevice {
        irq: machine.interrupts(),
        acks: acks.clone(),
    }));
    machine.power_on();
    Board { machine, ram, acks }
}

/// Raise IRQ every `period` cycles from the event queue
pub fn start_timer(machine: &Machine, period: u64) {
    fn schedule(machine: &Machine, at: u64, period: u64) {
        machine.events().schedule(at, move |m: &mut Machine| {
            m.state.interrupts.set_source(InterruptSignal::IRQ);
            let next = m.state.cycle + period;
            schedule(m, next, period);
        });
    }
    schedule(machine, machine.state.cycle + period, period);
}
