//! Trace JIT
//!
//! CPU models describe each instruction as a list of micro-ops ([`ir`]).
//! [`JitCore`] strings consecutive instructions into traces, hands them to a
//! [`CodeEmitter`] and caches the result per `(mode, page)`. Compiled code
//! checks for due events and pending interrupts before every instruction,
//! so it keeps the interpreter's timing and interrupt behaviour.

pub mod codegen;
pub mod cache;
pub mod ir;
pub mod native;

use thiserror::Error;

use crate::memory::SystemBus;

pub use self::codegen::{CodeEmitter, ExitReason, JitContext};
pub use self::cache::{EntryPoint, JitCore, JitPage, JitStats};
pub use self::ir::{InstructionPlan, JitOperation, Oper, Operand};
pub use self::native::{NativeMemory, NativeMemoryAllocator, NativeMemoryError};

/// Errors that make the engine interpret instead; none of them are fatal
#[derive(Debug, Error)]
pub enum JitError {
    #[error("executable memory: {0}")]
    Allocation(#[from] NativeMemoryError),
    #[error("instruction at {0:#x} does not fit in a code block")]
    InstructionTooLarge(u32),
    #[error("the CPU model has no JIT description")]
    NoJitModel,
    #[error("{0} registers exceed what compiled code can address")]
    TooManyRegisters(usize),
    #[error("emitter {0} needs executable memory the allocator cannot provide")]
    NotExecutable(&'static str),
    #[error("code at {0:#x} is on a page routed to I/O")]
    IoPage(u32),
    #[error("no code was produced for {0:#x}")]
    NothingCompiled(u32),
    #[error("assembler failed: {0}")]
    Assembler(String),
    #[error("no emitter named {0}")]
    UnknownEmitter(String),
}

/// JIT capability of a CPU model
pub trait JittableCpu {
    /// Micro-ops for the instruction at `address` in `mode`.
    ///
    /// Must not have side effects; use [`SystemBus::peek_byte`] to look at
    /// the opcode.
    fn jit_ops(&self, bus: &SystemBus, mode: u32, address: u32) -> &'static [JitOperation];
}

pub type EmitterConstructor = fn() -> Box<dyn CodeEmitter>;
pub type AllocatorConstructor = fn() -> Box<dyn NativeMemoryAllocator>;

/// Registry of code emitters.
///
/// Built once by the host and passed to whatever creates a
/// [`Machine`](crate::cpu::Machine); there is no global instance.
pub struct JitFactory {
    emitters: Vec<(&'static str, EmitterConstructor)>,
    allocator: AllocatorConstructor,
}

impl Default for JitFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl JitFactory {
    /// Factory with every emitter this build supports
    pub fn new() -> Self {
        let mut factory = Self::empty();
        factory.register("threaded", || Box::new(codegen::threaded::ThreadedEmitter::new()));
        #[cfg(all(unix, feature = "jit-dynasm", target_arch = "x86_64"))]
        factory.register("x64", || Box::new(codegen::dynasm::DynasmEmitter::new()));
        factory
    }

    pub fn empty() -> Self {
        JitFactory {
            emitters: Vec::new(),
            allocator: native::default_allocator,
        }
    }

    /// Add or replace an emitter. The most recently registered one is preferred.
    pub fn register(&mut self, name: &'static str, constructor: EmitterConstructor) {
        self.emitters.retain(|(n, _)| *n != name);
        self.emitters.push((name, constructor));
    }

    pub fn set_allocator(&mut self, allocator: AllocatorConstructor) {
        self.allocator = allocator;
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.emitters.iter().map(|(n, _)| *n).collect()
    }

    pub fn create(&self, name: &str, max_trace_length: usize) -> Result<JitCore, JitError> {
        let (_, constructor) = self
            .emitters
            .iter()
            .find(|(n, _)| *n == name)
            .ok_or_else(|| JitError::UnknownEmitter(name.to_string()))?;
        JitCore::new(constructor(), (self.allocator)(), max_trace_length)
    }

    pub fn create_preferred(&self, max_trace_length: usize) -> Result<JitCore, JitError> {
        let (name, _) = self
            .emitters
            .last()
            .ok_or_else(|| JitError::UnknownEmitter("<none>".to_string()))?;
        self.create(name, max_trace_length)
    }
}
