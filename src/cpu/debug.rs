//! Debugger handshake
//!
//! A [`DebugInterface`] lets a controller (a UI or debugger thread) pause
//! the emulation thread at an instruction boundary, look at the machine
//! while it is parked, single-step it and manage breakpoints.
//!
//! The emulation thread only ever stops inside an event callback or a
//! breakpoint handler, i.e. between instructions. Everything that touches
//! the [`Machine`] from the controller side runs as a job on the
//! emulation thread while it is parked, so the machine itself never needs
//! a lock.
//!
//! With `cross_thread_debug` disabled the same interface drives a host
//! loop that calls [`Machine::emulate`] itself: nothing blocks, a pause
//! just ends the current run and [`DebugInterface::paused`] tells the host
//! not to start another one.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace, warn};

use super::machine::BreakpointHandler;
use super::{CpuInstruction, DebugReg, EventQueue, Machine};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DebugError {
    #[error("address {0:#x} is routed to an I/O device")]
    IoAddress(u32),
    #[error("the emulation thread is not paused")]
    NotPaused,
    #[error("pause depth is {0}; resume nested pauses before stepping")]
    NestedPause(i32),
    #[error("the emulation thread is gone")]
    Disconnected,
    #[error("no register named {0}")]
    UnknownRegister(String),
    #[error("debugging on the emulation thread; use the Machine directly")]
    SameThread,
}

/// User code run when a breakpoint is hit, before any pause
pub type BreakpointCallback = Arc<dyn Fn(&mut Machine) + Send + Sync>;

type Job = Box<dyn FnOnce(&mut Machine) + Send>;

struct PauseState {
    /// Outstanding pause requests
    pause: i32,
    /// Set while the emulation thread is parked
    pause_response: bool,
    step_pending: bool,
    parked_cycle: u64,
    parks: u64,
    unparks: u64,
    jobs: VecDeque<Job>,
}

struct PauseShared {
    state: Mutex<PauseState>,
    /// Wakes the parked emulation thread
    pause_var: Condvar,
    /// Wakes controllers waiting for a park or unpark
    pause_wait_var: Condvar,
    breakpoints_pause: bool,
    cross_thread: bool,
}

impl PauseShared {
    fn lock(&self) -> MutexGuard<'_, PauseState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(&self, var: &Condvar, guard: MutexGuard<'a, PauseState>) -> MutexGuard<'a, PauseState> {
        var.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    /// Emulation thread: stop here until every pause is released, running
    /// controller jobs meanwhile
    fn park(&self, machine: &mut Machine) {
        if !self.cross_thread {
            self.lock().parked_cycle = machine.state.cycle;
            machine.request_stop();
            return;
        }
        let mut st = self.lock();
        st.pause_response = true;
        st.parked_cycle = machine.state.cycle;
        st.parks += 1;
        debug!(cycle = machine.state.cycle, ip = machine.state.ip, "emulation parked");
        self.pause_wait_var.notify_all();
        loop {
            while let Some(job) = st.jobs.pop_front() {
                drop(st);
                job(machine);
                st = self.lock();
            }
            if st.pause <= 0 {
                break;
            }
            st = self.wait(&self.pause_var, st);
        }
        st.pause_response = false;
        st.unparks += 1;
        debug!(cycle = machine.state.cycle, "emulation resumed");
        self.pause_wait_var.notify_all();
    }

    fn on_pause_event(&self, machine: &mut Machine) {
        let due = {
            let st = self.lock();
            st.pause > 0 && !st.pause_response
        };
        if due {
            self.park(machine);
        }
    }

    fn on_step_event(&self, machine: &mut Machine) {
        let due = {
            let mut st = self.lock();
            if st.step_pending {
                st.step_pending = false;
                st.pause += 1;
            }
            st.pause > 0 && !st.pause_response
        };
        if due {
            self.park(machine);
        }
    }

    fn on_breakpoint(&self, machine: &mut Machine, callback: Option<&BreakpointCallback>, pause_on_hit: bool) {
        trace!(address = format_args!("{:#x}", machine.state.canonical_address()), "breakpoint hit");
        if let Some(cb) = callback {
            cb(machine);
        }
        if !pause_on_hit || !self.breakpoints_pause {
            return;
        }
        {
            let mut st = self.lock();
            // The pending step event parks once this instruction has run
            if st.step_pending {
                return;
            }
            if st.pause == 0 {
                st.pause = 1;
            }
        }
        self.park(machine);
    }
}

/// Controller handle; cheap to clone and safe to use from any thread
#[derive(Clone)]
pub struct DebugInterface {
    shared: Arc<PauseShared>,
    events: Arc<EventQueue<Machine>>,
}

impl DebugInterface {
    /// Attach to `machine`. Must be created before the machine moves to its
    /// emulation thread.
    ///
    /// In single-thread mode the interface starts paused.
    pub fn new(machine: &Machine) -> Self {
        let config = machine.config();
        let cross_thread = config.cross_thread_debug;
        DebugInterface {
            shared: Arc::new(PauseShared {
                state: Mutex::new(PauseState {
                    pause: if cross_thread { 0 } else { 1 },
                    pause_response: false,
                    step_pending: false,
                    parked_cycle: machine.state.cycle,
                    parks: 0,
                    unparks: 0,
                    jobs: VecDeque::new(),
                }),
                pause_var: Condvar::new(),
                pause_wait_var: Condvar::new(),
                breakpoints_pause: config.breakpoints_pause(),
                cross_thread,
            }),
            events: machine.events().clone(),
        }
    }

    pub fn is_cross_thread(&self) -> bool {
        self.shared.cross_thread
    }

    /// Request a pause and, in cross-thread mode, block until the emulation
    /// thread has parked. Pauses nest.
    pub fn pause(&self) {
        self.pause_with(true);
    }

    /// Like [`DebugInterface::pause`]. With `schedule_event` false no park
    /// event is queued; the caller expects the thread to park on its own,
    /// e.g. at a breakpoint, and only the depth is raised.
    pub fn pause_with(&self, schedule_event: bool) {
        let mut st = self.shared.lock();
        st.pause += 1;
        debug!(depth = st.pause, "pause requested");
        if st.pause == 1 && schedule_event && !st.pause_response {
            let shared = self.shared.clone();
            self.events.schedule(0, move |m: &mut Machine| shared.on_pause_event(m));
        }
        if !self.shared.cross_thread {
            return;
        }
        while !st.pause_response {
            st = self.shared.wait(&self.shared.pause_wait_var, st);
        }
    }

    /// Release one pause. When the last one goes the emulation thread
    /// continues; in cross-thread mode this blocks until it has.
    pub fn resume(&self) {
        let mut st = self.shared.lock();
        if st.pause <= 0 {
            warn!("resume without a matching pause");
            return;
        }
        st.pause -= 1;
        debug!(depth = st.pause, "resume");
        if st.pause > 0 || !self.shared.cross_thread || !st.pause_response {
            return;
        }
        let unparks = st.unparks;
        self.shared.pause_var.notify_all();
        while st.unparks == unparks {
            st = self.shared.wait(&self.shared.pause_wait_var, st);
        }
    }

    /// Run for at least `clocks` cycles (one instruction for `clocks <= 1`)
    /// and pause again. Requires a single outstanding pause.
    ///
    /// In cross-thread mode this returns once the thread has parked again.
    /// Breakpoints passed on the way run their callbacks but do not park.
    pub fn single_step(&self, clocks: u64) -> Result<(), DebugError> {
        let mut st = self.shared.lock();
        if st.pause <= 0 || (self.shared.cross_thread && !st.pause_response) {
            return Err(DebugError::NotPaused);
        }
        if st.pause > 1 {
            return Err(DebugError::NestedPause(st.pause));
        }
        st.step_pending = true;
        let target = st.parked_cycle + clocks.max(1);
        let shared = self.shared.clone();
        self.events.schedule(target, move |m: &mut Machine| shared.on_step_event(m));
        st.pause = 0;
        trace!(target, "single step");
        if !self.shared.cross_thread {
            return Ok(());
        }
        let parks = st.parks;
        self.shared.pause_var.notify_all();
        while st.parks == parks {
            st = self.shared.wait(&self.shared.pause_wait_var, st);
        }
        Ok(())
    }

    /// Is the emulation thread stopped? In single-thread mode: should the
    /// host hold off calling `emulate`?
    pub fn paused(&self) -> bool {
        let st = self.shared.lock();
        if self.shared.cross_thread {
            st.pause_response
        } else {
            st.pause > 0
        }
    }

    pub fn pause_depth(&self) -> i32 {
        self.shared.lock().pause
    }

    pub fn recursively_paused(&self) -> bool {
        self.pause_depth() > 1
    }

    /// Cycle at which the thread last parked
    pub fn parked_cycle(&self) -> u64 {
        self.shared.lock().parked_cycle
    }

    /// Block until the emulation thread parks (e.g. on a breakpoint).
    /// Returns false on timeout.
    pub fn wait_for_pause(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.lock();
        while !st.pause_response {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .shared
                .pause_wait_var
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            st = guard;
        }
        true
    }

    /// Install a breakpoint. `callback` runs first; the thread then parks if
    /// `pause_on_hit` is set and breakpoints pause in this configuration.
    pub fn set_breakpoint(&self, address: u32, pause_on_hit: bool, callback: Option<BreakpointCallback>) {
        let shared = self.shared.clone();
        let handler: BreakpointHandler =
            Arc::new(move |m: &mut Machine| shared.on_breakpoint(m, callback.as_ref(), pause_on_hit));
        self.run_on_emulation_thread(move |m| m.add_breakpoint(address, handler));
    }

    pub fn clear_breakpoint(&self, address: u32) {
        self.run_on_emulation_thread(move |m| {
            m.remove_breakpoint(address);
        });
    }

    /// Queue `job` as a parked-thread job, or as a cycle-0 event (next
    /// instruction boundary) if the thread is running
    fn run_on_emulation_thread(&self, job: impl FnOnce(&mut Machine) + Send + 'static) {
        let mut st = self.shared.lock();
        if self.shared.cross_thread && st.pause_response {
            st.jobs.push_back(Box::new(job));
            self.shared.pause_var.notify_all();
        } else {
            self.events.schedule(0, job);
        }
    }

    /// Run `f` on the parked emulation thread and return its result
    pub fn inspect<R, F>(&self, f: F) -> Result<R, DebugError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Machine) -> R + Send + 'static,
    {
        if !self.shared.cross_thread {
            return Err(DebugError::SameThread);
        }
        let (tx, rx) = mpsc::sync_channel(1);
        {
            let mut st = self.shared.lock();
            if !st.pause_response {
                return Err(DebugError::NotPaused);
            }
            st.jobs.push_back(Box::new(move |m: &mut Machine| {
                let _ = tx.send(f(m));
            }));
            self.shared.pause_var.notify_all();
        }
        rx.recv().map_err(|_| DebugError::Disconnected)
    }

    pub fn peek(&self, address: u32, allow_io: bool) -> Result<u8, DebugError> {
        self.inspect(move |m| m.peek(address, allow_io))?
    }

    pub fn poke(&self, address: u32, value: u8, allow_io: bool) -> Result<(), DebugError> {
        self.inspect(move |m| m.poke(address, value, allow_io))?
    }

    pub fn registers(&self) -> Result<Vec<DebugReg>, DebugError> {
        self.inspect(|m| m.debug_registers())
    }

    pub fn set_register(&self, name: &str, value: u32) -> Result<(), DebugError> {
        let name = name.to_string();
        self.inspect(move |m| {
            if m.set_register(&name, value) {
                Ok(())
            } else {
                Err(DebugError::UnknownRegister(name))
            }
        })?
    }

    pub fn disassemble(&self, address: u32, count: usize) -> Result<Option<Vec<CpuInstruction>>, DebugError> {
        self.inspect(move |m| m.disassemble(address, count))
    }

    pub fn cycle(&self) -> Result<u64, DebugError> {
        self.inspect(|m| m.state.cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::cpu::{CpuState, EmulatedCpu};
    use crate::memory::{MemoryBlock, NoIo, SystemBus};

    /// Every instruction is one byte and one cycle
    struct Ticker;

    impl EmulatedCpu for Ticker {
        fn name(&self) -> &'static str {
            "ticker"
        }
        fn address_bus_bits(&self) -> u32 {
            16
        }
        fn pc_bits(&self) -> u32 {
            16
        }
        fn create_state(&self) -> CpuState {
            CpuState::new(1, 16)
        }
        fn power_on(&mut self, _state: &mut CpuState, _bus: &mut SystemBus) {}
        fn reset(&mut self, _state: &mut CpuState, _bus: &mut SystemBus) {}
        fn execute(&mut self, state: &mut CpuState, bus: &mut SystemBus) {
            let (_, c) = bus.read_byte(state.canonical_address());
            state.cycle += c as u64;
            state.ip = (state.ip + 1) & state.ip_mask;
        }
        fn interrupt(&mut self, _kind: crate::cpu::InterruptKind, _state: &mut CpuState, _bus: &mut SystemBus) {}
    }

    fn machine_with(config: EngineConfig) -> Machine {
        let mut bus = SystemBus::with_uniform_pages(8, 16, 1, Box::new(NoIo));
        bus.map(0, &MemoryBlock::new(0x1_0000), 0, 0x1_0000, false).unwrap();
        Machine::new(Box::new(Ticker), bus, config)
    }

    fn machine(cross_thread: bool) -> Machine {
        machine_with(EngineConfig { cross_thread_debug: cross_thread, ..Default::default() })
    }

    #[test]
    fn test_single_thread_pause_ends_run() {
        let mut m = machine(false);
        let dbg = DebugInterface::new(&m);
        assert!(dbg.paused());
        dbg.resume();
        assert!(!dbg.paused());

        m.emulate(10);
        dbg.pause();
        m.emulate(1000);
        assert!(dbg.paused());
        assert_eq!(m.state.cycle, 10);
        assert_eq!(dbg.parked_cycle(), 10);
        assert_eq!(dbg.inspect(|m| m.state.cycle), Err(DebugError::SameThread));
    }

    #[test]
    fn test_single_thread_step() {
        let mut m = machine(false);
        let dbg = DebugInterface::new(&m);
        dbg.single_step(3).unwrap();
        assert!(!dbg.paused());
        m.emulate(1000);
        assert_eq!(m.state.cycle, 3);
        assert!(dbg.paused());
        assert_eq!(dbg.single_step(1), Ok(()));
        m.emulate(1000);
        assert_eq!(m.state.cycle, 4);
    }

    #[test]
    fn test_single_thread_breakpoint_stops() {
        let mut m = machine_with(EngineConfig {
            cross_thread_debug: false,
            breakpoints_pause: Some(true),
            ..Default::default()
        });
        let dbg = DebugInterface::new(&m);
        dbg.set_breakpoint(0x20, true, None);
        dbg.resume();
        m.emulate(1000);
        assert!(dbg.paused());
        // Without a thread to block, the hit instruction completes before the run ends
        assert_eq!(m.state.ip, 0x21);
    }

    #[test]
    fn test_step_across_breakpoint_finishes_the_step() {
        let mut m = machine_with(EngineConfig {
            cross_thread_debug: false,
            breakpoints_pause: Some(true),
            ..Default::default()
        });
        let dbg = DebugInterface::new(&m);
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let h = hits.clone();
        dbg.set_breakpoint(
            0x02,
            true,
            Some(Arc::new(move |_m: &mut Machine| {
                h.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
        );
        dbg.single_step(5).unwrap();
        m.emulate(1000);
        assert!(dbg.paused());
        assert_eq!(m.state.cycle, 5);
        assert_eq!(m.state.ip, 5);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_breakpoints_ignored_unless_configured_to_pause() {
        let mut m = machine(false);
        let dbg = DebugInterface::new(&m);
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let h = hits.clone();
        dbg.set_breakpoint(
            0x20,
            true,
            Some(Arc::new(move |_m: &mut Machine| {
                h.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
        );
        dbg.resume();
        m.emulate(0x100);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!dbg.paused());
        assert_eq!(m.state.cycle, 0x100);
    }

    #[test]
    fn test_resume_without_pause_is_ignored() {
        let m = machine(true);
        let dbg = DebugInterface::new(&m);
        dbg.resume();
        assert_eq!(dbg.pause_depth(), 0);
        assert_eq!(dbg.single_step(1), Err(DebugError::NotPaused));
        assert_eq!(dbg.peek(0, false), Err(DebugError::NotPaused));
    }
}
