//! Retargetable CPU execution engine
//!
//! The pieces a cycle-counted emulator shares between CPU architectures:
//! a paged memory bus with I/O routing and open-bus reads, a cycle-indexed
//! event queue, an execution loop with interrupts and breakpoints, a
//! cross-thread pause/step protocol for debuggers and a trace JIT.
//!
//! A CPU model plugs in through [`cpu::EmulatedCpu`]; [`cpu::mos6502`] is a
//! small sample model.
//!
//! ```
//! use retrocore::cpu::mos6502::{Mos6502, PAGE_SHIFT};
//! use retrocore::cpu::{Assembler, Machine};
//! use retrocore::memory::{MemoryBlock, NoIo, SystemBus};
//! use retrocore::EngineConfig;
//!
//! let ram = MemoryBlock::new(0x1_0000);
//! let program = Mos6502.assemble("LDA #$2A\nSTA $0200\nloop: JMP loop", 0x8000).unwrap();
//! ram.load(0x8000, &program);
//! ram.load(0xFFFC, &[0x00, 0x80]);
//!
//! let mut bus = SystemBus::with_uniform_pages(PAGE_SHIFT, 16, 1, Box::new(NoIo));
//! bus.map(0, &ram, 0, 0x1_0000, false).unwrap();
//! let mut machine = Machine::new(Box::new(Mos6502::new()), bus, EngineConfig::default());
//! machine.power_on();
//! machine.emulate(100);
//! assert_eq!(ram.read(0x200), 0x2A);
//! ```

pub mod config;
pub mod cpu;
pub mod jit;
pub mod memory;
pub mod snapshot;

pub use config::EngineConfig;
pub use cpu::{DebugInterface, EmulatedCpu, Machine};
pub use jit::JitFactory;
pub use memory::SystemBus;
