//! CPU save states
//!
//! Only engine-visible CPU state is captured: registers, flags, cycle
//! counters, segments and the pending-interrupt mask, plus whatever opaque
//! bytes the model adds. Memory contents and devices belong to the host.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cpu::{CpuState, RegisterFile};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("serialization error: {0}")]
    Encode(#[source] bincode::Error),
    #[error("deserialization error: {0}")]
    Decode(#[source] bincode::Error),
    #[error("compression error: {0}")]
    Compress(#[source] std::io::Error),
    #[error("decompression error: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("snapshot version {found} is not supported (expected {expected})")]
    Version { expected: u32, found: u32 },
    #[error("snapshot is for {found}, not {expected}")]
    ModelMismatch { expected: String, found: String },
    #[error("snapshot has {found} registers, the model has {expected}")]
    RegisterCount { expected: usize, found: usize },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub version: u32,
    /// [`EmulatedCpu::name`](crate::cpu::EmulatedCpu::name) of the model that saved it
    pub model: String,
    pub regs: RegisterFile,
    pub ip: u32,
    pub code_segment_base: u32,
    pub data_segments: [u32; 2],
    pub mode: u32,
    pub cycle: u64,
    pub zero: u32,
    pub negative: u32,
    pub carry: u32,
    pub interrupts_enabled: bool,
    pub other_flags: u32,
    pub pending_interrupts: u32,
    /// Model-private state
    pub extra: Vec<u8>,
}

impl CpuSnapshot {
    pub const VERSION: u32 = 1;

    pub fn capture(model: &str, state: &CpuState, extra: Vec<u8>) -> Self {
        CpuSnapshot {
            version: Self::VERSION,
            model: model.to_string(),
            regs: state.regs.clone(),
            ip: state.ip,
            code_segment_base: state.code_segment_base,
            data_segments: state.data_segments,
            mode: state.mode,
            cycle: state.cycle,
            zero: state.zero,
            negative: state.negative,
            carry: state.carry,
            interrupts_enabled: state.interrupts_enabled,
            other_flags: state.other_flags,
            pending_interrupts: state.interrupts.load(),
            extra,
        }
    }

    /// Write the snapshot into `state`. The run bounds (`cycle_stop`,
    /// `event_cycle`) are left alone; the next run sets them.
    pub fn restore(&self, state: &mut CpuState) -> Result<(), SnapshotError> {
        if self.regs.len() != state.regs.len() {
            return Err(SnapshotError::RegisterCount {
                expected: state.regs.len(),
                found: self.regs.len(),
            });
        }
        state.regs = self.regs.clone();
        state.ip = self.ip & state.ip_mask;
        state.code_segment_base = self.code_segment_base;
        state.data_segments = self.data_segments;
        state.mode = self.mode;
        state.cycle = self.cycle;
        state.zero = self.zero;
        state.negative = self.negative;
        state.carry = self.carry;
        state.interrupts_enabled = self.interrupts_enabled;
        state.other_flags = self.other_flags;
        state.interrupts.store(self.pending_interrupts);
        Ok(())
    }

    /// Serialize to bytes (compressed with zstd)
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        let serialized = bincode::serialize(self).map_err(SnapshotError::Encode)?;
        zstd::stream::encode_all(&serialized[..], 3).map_err(SnapshotError::Compress)
    }

    /// Deserialize from bytes (compressed with zstd)
    pub fn from_bytes(data: &[u8]) -> Result<Self, SnapshotError> {
        let decompressed = zstd::stream::decode_all(data).map_err(SnapshotError::Decompress)?;
        let snapshot: CpuSnapshot = bincode::deserialize(&decompressed).map_err(SnapshotError::Decode)?;
        if snapshot.version != Self::VERSION {
            return Err(SnapshotError::Version {
                expected: Self::VERSION,
                found: snapshot.version,
            });
        }
        Ok(snapshot)
    }
}
