//! The execution loop
//!
//! [`Machine`] ties a CPU model to its [`CpuState`], the [`SystemBus`] and
//! the [`EventQueue`]. It runs until a requested stop cycle, but in slices
//! bounded by the next scheduled event, so callbacks (timers, DMA, a
//! debugger pause) fire at the right cycle in the middle of a long run.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::{
    AssembleError, CpuInstruction, CpuState, DebugError, DebugReg, DisassemblyConfig, EmulatedCpu, EventQueue,
    InterruptKind, InterruptSignal, TraceBuffer,
};
use crate::config::EngineConfig;
use crate::jit::{ExitReason, JitCore, JitFactory};
use crate::memory::SystemBus;
use crate::snapshot::{CpuSnapshot, SnapshotError};

/// Called before the instruction at its address executes
pub type BreakpointHandler = Arc<dyn Fn(&mut Machine) + Send + Sync>;

/// Per-instruction hooks for peripherals that must catch up after every
/// instruction rather than at event granularity
pub trait CycleProcessor {
    fn before_instruction(&mut self, _machine: &mut Machine) {}

    fn after_instruction(&mut self, _machine: &mut Machine) {}
}

struct NoProcessing;

impl CycleProcessor for NoProcessing {}

pub struct Machine {
    pub cpu: Box<dyn EmulatedCpu>,
    pub state: CpuState,
    pub bus: SystemBus,
    events: Arc<EventQueue<Machine>>,
    breakpoints: HashMap<u32, BreakpointHandler>,
    jit: Option<JitCore>,
    trace: Option<TraceBuffer>,
    config: EngineConfig,
}

impl Machine {
    pub fn new(cpu: Box<dyn EmulatedCpu>, mut bus: SystemBus, config: EngineConfig) -> Self {
        bus.open_bus_is_data = config.open_bus_is_data;
        let state = cpu.create_state();
        let trace = (config.trace_buffer > 0).then(|| TraceBuffer::new(config.trace_buffer));
        Machine {
            cpu,
            state,
            bus,
            events: Arc::new(EventQueue::new()),
            breakpoints: HashMap::new(),
            jit: None,
            trace,
            config,
        }
    }

    /// Like [`Machine::new`], attaching the factory's preferred emitter when
    /// `config.jit` is set
    pub fn with_jit(cpu: Box<dyn EmulatedCpu>, bus: SystemBus, config: EngineConfig, factory: &JitFactory) -> Self {
        let jit = config.jit && cpu.jittable().is_some();
        let max_trace_length = config.max_trace_length;
        let mut machine = Self::new(cpu, bus, config);
        if jit {
            match factory.create_preferred(max_trace_length) {
                Ok(core) => machine.attach_jit(core),
                Err(e) => warn!(error = %e, "JIT unavailable, interpreting"),
            }
        }
        machine
    }

    pub fn attach_jit(&mut self, core: JitCore) {
        debug!(emitter = core.emitter_name(), cpu = self.cpu.name(), "JIT attached");
        self.jit = Some(core);
    }

    pub fn detach_jit(&mut self) -> Option<JitCore> {
        self.jit.take()
    }

    pub fn jit(&self) -> Option<&JitCore> {
        self.jit.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventQueue<Machine>> {
        &self.events
    }

    pub fn interrupts(&self) -> InterruptSignal {
        self.state.interrupts.clone()
    }

    pub fn power_on(&mut self) {
        self.cpu.power_on(&mut self.state, &mut self.bus);
        self.flush_jit();
    }

    pub fn reset(&mut self) {
        self.cpu.reset(&mut self.state, &mut self.bus);
        self.flush_jit();
    }

    fn flush_jit(&mut self) {
        if let Some(jit) = self.jit.as_mut() {
            jit.invalidate_all();
        }
    }

    /// Run callbacks due at the current cycle
    pub fn expire_events(&mut self) {
        let events = self.events.clone();
        events.expire(self.state.cycle, self);
    }

    /// Expire due events, then take an interrupt or execute one instruction
    pub fn single_step(&mut self) {
        self.expire_events();
        self.step_instruction(&mut NoProcessing);
    }

    /// Run until `state.cycle >= stop`
    pub fn emulate(&mut self, stop: u64) {
        self.run(stop, &mut NoProcessing, true);
    }

    /// Run until `stop`, calling `processor` around every instruction.
    /// Never uses the JIT.
    pub fn emulate_with_cycle_processing<P: CycleProcessor>(&mut self, stop: u64, processor: &mut P) {
        self.run(stop, processor, false);
    }

    fn run<P: CycleProcessor>(&mut self, stop: u64, processor: &mut P, allow_jit: bool) {
        self.state.cycle_stop = stop;
        self.events.start(&self.state.event_cycle, stop);
        while self.state.cycle < self.state.cycle_stop {
            if allow_jit && self.jit_usable() {
                self.run_jit_slice();
            } else {
                while self.state.cycle < self.state.event_cycle.get() {
                    self.step_instruction(processor);
                }
            }
            self.expire_events();
        }
    }

    /// End the current run at the next instruction boundary
    pub fn request_stop(&mut self) {
        self.state.cycle_stop = self.state.cycle;
        self.state.event_cycle.set(self.state.cycle);
    }

    fn jit_usable(&self) -> bool {
        self.jit.is_some() && self.breakpoints.is_empty() && self.trace.is_none() && self.cpu.jittable().is_some()
    }

    fn pending_interrupt(&self) -> Option<InterruptKind> {
        self.state.interrupts.pending_kind(self.state.interrupts_enabled)
    }

    fn take_interrupt(&mut self, kind: InterruptKind) {
        trace!(?kind, cycle = self.state.cycle, "interrupt taken");
        self.cpu.interrupt(kind, &mut self.state, &mut self.bus);
        // NMI is edge triggered; IRQ lines stay up until the device drops them
        if kind == InterruptKind::Nmi {
            self.state.interrupts.clear_source(InterruptSignal::NMI);
        }
        self.bus.irq_taken(kind);
    }

    fn step_instruction<P: CycleProcessor>(&mut self, processor: &mut P) {
        self.state.ip &= self.state.ip_mask;
        if let Some(kind) = self.pending_interrupt() {
            self.take_interrupt(kind);
            return;
        }
        let address = self.state.canonical_address();
        if !self.breakpoints.is_empty() {
            if let Some(handler) = self.breakpoints.get(&address).cloned() {
                handler(self);
            }
        }
        if let Some(trace) = self.trace.as_mut() {
            trace.push(address);
        }
        processor.before_instruction(self);
        self.cpu.execute(&mut self.state, &mut self.bus);
        processor.after_instruction(self);
    }

    fn run_jit_slice(&mut self) {
        while self.state.cycle < self.state.event_cycle.get() {
            self.state.ip &= self.state.ip_mask;
            if let Some(kind) = self.pending_interrupt() {
                self.take_interrupt(kind);
                continue;
            }
            let (Some(jit), Some(model)) = (self.jit.as_mut(), self.cpu.jittable()) else {
                return;
            };
            match jit.execute(model, &mut self.state, &mut self.bus) {
                Ok(ExitReason::Continue) | Ok(ExitReason::Yield) => {}
                Ok(ExitReason::Interpret) => self.cpu.execute(&mut self.state, &mut self.bus),
                Err(e) => {
                    trace!(error = %e, ip = self.state.ip, "interpreting after JIT failure");
                    self.cpu.execute(&mut self.state, &mut self.bus);
                }
            }
        }
    }

    /// Install `handler` at canonical `address`, replacing any previous one
    pub fn add_breakpoint(&mut self, address: u32, handler: BreakpointHandler) {
        debug!(address = format_args!("{address:#x}"), "breakpoint set");
        self.breakpoints.insert(address, handler);
    }

    pub fn remove_breakpoint(&mut self, address: u32) -> bool {
        debug!(address = format_args!("{address:#x}"), "breakpoint cleared");
        self.breakpoints.remove(&address).is_some()
    }

    pub fn has_breakpoint(&self, address: u32) -> bool {
        self.breakpoints.contains_key(&address)
    }

    pub fn breakpoint_addresses(&self) -> Vec<u32> {
        let mut v: Vec<u32> = self.breakpoints.keys().copied().collect();
        v.sort_unstable();
        v
    }

    /// Read a byte for a debugger. I/O addresses are only read (with their
    /// side effects) when `allow_io` is set.
    pub fn peek(&mut self, address: u32, allow_io: bool) -> Result<u8, DebugError> {
        if self.bus.query_io(address) {
            if !allow_io {
                return Err(DebugError::IoAddress(address));
            }
            return Ok(self.bus.read_byte(address).0);
        }
        Ok(self.bus.peek_byte(address))
    }

    pub fn poke(&mut self, address: u32, value: u8, allow_io: bool) -> Result<(), DebugError> {
        if self.bus.query_io(address) && !allow_io {
            return Err(DebugError::IoAddress(address));
        }
        self.bus.write_byte(address, value);
        Ok(())
    }

    pub fn debug_registers(&self) -> Vec<DebugReg> {
        self.cpu.debug_registers(&self.state)
    }

    pub fn set_register(&mut self, name: &str, value: u32) -> bool {
        self.cpu.set_register(&mut self.state, name, value)
    }

    pub fn disassemble(&self, address: u32, count: usize) -> Option<Vec<CpuInstruction>> {
        let config = DisassemblyConfig { max_instruction_count: count };
        self.cpu
            .disassembler()
            .map(|d| d.disassemble(&self.bus, &config, address))
    }

    /// `None` if the model has no assembler
    pub fn assemble(&self, source: &str, origin: u32) -> Option<Result<Vec<u8>, AssembleError>> {
        self.cpu.assembler().map(|a| a.assemble(source, origin))
    }

    pub fn trace_buffer(&self) -> Option<&TraceBuffer> {
        self.trace.as_ref()
    }

    pub fn save_state(&self) -> Result<Vec<u8>, SnapshotError> {
        CpuSnapshot::capture(self.cpu.name(), &self.state, self.cpu.save_extra()).to_bytes()
    }

    pub fn load_state(&mut self, data: &[u8]) -> Result<(), SnapshotError> {
        let snapshot = CpuSnapshot::from_bytes(data)?;
        if snapshot.model != self.cpu.name() {
            return Err(SnapshotError::ModelMismatch {
                expected: self.cpu.name().to_string(),
                found: snapshot.model,
            });
        }
        snapshot.restore(&mut self.state)?;
        self.cpu.load_extra(&snapshot.extra);
        self.flush_jit();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBlock, NoIo, Page};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// One-byte instructions: fetch costs the page's access time, reg0 counts
    /// instructions, reg1 IRQs and reg2 NMIs. Taking an IRQ disables them.
    struct Counter;

    impl EmulatedCpu for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }
        fn address_bus_bits(&self) -> u32 {
            16
        }
        fn pc_bits(&self) -> u32 {
            16
        }
        fn create_state(&self) -> CpuState {
            CpuState::new(3, 16)
        }
        fn power_on(&mut self, state: &mut CpuState, _bus: &mut SystemBus) {
            state.ip = 0;
        }
        fn reset(&mut self, state: &mut CpuState, _bus: &mut SystemBus) {
            state.ip = 0;
            state.interrupts_enabled = false;
        }
        fn execute(&mut self, state: &mut CpuState, bus: &mut SystemBus) {
            let (_, cycles) = bus.read_byte(state.canonical_address());
            state.cycle += cycles as u64;
            state.ip = state.ip.wrapping_add(1) & state.ip_mask;
            state.regs.set(0, state.regs.get(0) + 1);
        }
        fn interrupt(&mut self, kind: InterruptKind, state: &mut CpuState, _bus: &mut SystemBus) {
            state.cycle += 7;
            match kind {
                InterruptKind::Irq => {
                    state.regs.set(1, state.regs.get(1) + 1);
                    state.interrupts_enabled = false;
                }
                InterruptKind::Nmi => state.regs.set(2, state.regs.get(2) + 1),
            }
        }
    }

    fn machine() -> Machine {
        let mut bus = SystemBus::new(8, 16, vec![Page::memory(2); 256], Box::new(NoIo));
        let ram = MemoryBlock::new(0x1_0000);
        bus.map(0, &ram, 0, 0x1_0000, false).unwrap();
        Machine::new(Box::new(Counter), bus, EngineConfig::default())
    }

    #[test]
    fn test_emulate_runs_to_budget() {
        let mut m = machine();
        m.emulate(100);
        assert_eq!(m.state.cycle, 100);
        assert_eq!(m.state.regs.get(0), 50);
        m.emulate(101);
        // Instructions are never split; the budget may overshoot by one
        assert_eq!(m.state.cycle, 102);
    }

    #[test]
    fn test_events_fire_mid_run_at_their_cycle() {
        let mut m = machine();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for at in [31u64, 10, 60] {
            let seen = seen.clone();
            m.events().schedule(at, move |m: &mut Machine| {
                seen.lock().unwrap().push((at, m.state.cycle));
            });
        }
        m.emulate(100);
        // Each callback sees the first instruction boundary at or past its cycle
        assert_eq!(*seen.lock().unwrap(), vec![(10, 10), (31, 32), (60, 60)]);
    }

    #[test]
    fn test_event_can_stop_the_run() {
        let mut m = machine();
        m.events().schedule(20, |m: &mut Machine| m.request_stop());
        m.emulate(1000);
        assert_eq!(m.state.cycle, 20);
    }

    #[test]
    fn test_interrupt_gating() {
        let mut m = machine();
        let irq = m.interrupts();
        irq.set_source(InterruptSignal::IRQ);
        m.single_step();
        assert_eq!(m.state.regs.get(1), 0);
        assert_eq!(m.state.regs.get(0), 1);

        m.state.interrupts_enabled = true;
        m.single_step();
        assert_eq!(m.state.regs.get(1), 1);
        assert_eq!(m.state.regs.get(0), 1);

        irq.set_source(InterruptSignal::NMI);
        m.single_step();
        assert_eq!(m.state.regs.get(2), 1);
        // NMI is consumed; the IRQ line is still up but now masked
        m.single_step();
        assert_eq!(m.state.regs.get(2), 1);
        assert_eq!(m.state.regs.get(0), 2);
    }

    #[test]
    fn test_breakpoint_runs_before_instruction() {
        let mut m = machine();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        m.add_breakpoint(
            3,
            Arc::new(move |m: &mut Machine| {
                assert_eq!(m.state.regs.get(0), 3);
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        m.emulate(20);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(m.remove_breakpoint(3));
        assert!(!m.remove_breakpoint(3));
    }

    #[test]
    fn test_cycle_processing_hooks() {
        struct Catchup {
            before: u64,
            after: u64,
        }
        impl CycleProcessor for Catchup {
            fn before_instruction(&mut self, _m: &mut Machine) {
                self.before += 1;
            }
            fn after_instruction(&mut self, m: &mut Machine) {
                self.after = m.state.cycle;
            }
        }
        let mut m = machine();
        let mut p = Catchup { before: 0, after: 0 };
        m.emulate_with_cycle_processing(10, &mut p);
        assert_eq!(p.before, 5);
        assert_eq!(p.after, 10);
    }

    #[test]
    fn test_trace_buffer_records_addresses() {
        let mut bus = SystemBus::new(8, 16, vec![Page::memory(1); 256], Box::new(NoIo));
        bus.map(0, &MemoryBlock::new(0x1_0000), 0, 0x1_0000, false).unwrap();
        let config = EngineConfig { trace_buffer: 4, ..Default::default() };
        let mut m = Machine::new(Box::new(Counter), bus, config);
        m.emulate(6);
        assert_eq!(m.trace_buffer().unwrap().recent(), vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_peek_poke_respect_io() {
        let mut pages = vec![Page::memory(1); 256];
        pages[0xFF] = Page::io(1);
        let mut bus = SystemBus::new(8, 16, pages, Box::new(NoIo));
        bus.map(0, &MemoryBlock::new(0x100), 0, 0x100, false).unwrap();
        let mut m = Machine::new(Box::new(Counter), bus, EngineConfig::default());
        m.poke(0x10, 0xAB, false).unwrap();
        assert_eq!(m.peek(0x10, false), Ok(0xAB));
        // NoIo claims no device addresses, so I/O pages read as open bus
        assert_eq!(m.peek(0xFF00, false), Ok(0xAB));
    }

    #[test]
    fn test_save_and_load_state() {
        let mut m = machine();
        m.emulate(40);
        let saved = m.save_state().unwrap();
        m.emulate(80);
        assert_eq!(m.state.regs.get(0), 40);
        m.load_state(&saved).unwrap();
        assert_eq!(m.state.regs.get(0), 20);
        assert_eq!(m.state.cycle, 40);
    }
}
