//! Real-mode 16-bit x86 execution core for hosting NE bulletin-board
//! extension modules on a modern host.
//!
//! The crate emulates 8086/80186/80286 integer code plus the x87 stack over
//! a selector-keyed segmented memory image. Relocation records the NE loader
//! hands to [`vm::memory::MemoryCore`] are consulted during operand decode,
//! and far calls that resolve to imported ordinals are vectored to the
//! embedding host through [`host::HostInvoker`]. Guest entry goes through
//! pooled [`vm::unit::ExecutionUnit`]s, which host callbacks may nest.

pub mod errors;
pub mod host;
pub mod utils;
pub mod vm;

pub use errors::{CpuFault, FpuExceptionKind, HostError};
pub use host::{HostContext, HostInvoker, InterruptDisposition, SharedInvoker, SharedMemory};
pub use vm::memory::{
    FarPtr, MemoryCore, RelocationRecord, RelocationTarget, Segment, SegmentKind,
};
pub use vm::registers::{CpuFlag, CpuRegisters};
pub use vm::unit::{ExecutionUnit, ExecutionUnitPool};
