//! The host side of the call/interrupt bridge.
//!
//! Guest far calls whose relocation resolves to an imported ordinal, and
//! software interrupts, are vectored out of the core through [`HostInvoker`].
//! The callback runs synchronously on the guest thread with full access to
//! the register file and shared memory, and may itself re-enter guest code by
//! checking a fresh execution unit out of the pool.

use std::cell::RefCell;
use std::rc::Rc;

use crate::errors::{CpuFault, HostError};
use crate::vm::memory::MemoryCore;
use crate::vm::registers::CpuRegisters;

/// Memory is shared by reference between the pool's execution units and the
/// host; registers are owned per unit and only lent out for the duration of
/// a callback.
pub type SharedMemory = Rc<RefCell<MemoryCore>>;

pub type SharedInvoker = Rc<dyn HostInvoker>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptDisposition {
    Handled,
    /// No table entry for the vector; the execution unit faults.
    Unhandled,
}

/// State lent to a host callback while the bridge holds the guest suspended.
pub struct HostContext<'a> {
    pub registers: &'a mut CpuRegisters,
    pub memory: &'a SharedMemory,
}

impl HostContext<'_> {
    /// Read the `index`-th 16-bit argument of a Pascal-convention call.
    /// Arguments were pushed left to right by the guest caller, so argument 0
    /// sits at `SS:SP` and later arguments above it.
    pub fn argument(&self, index: u16) -> Result<u16, CpuFault> {
        let sp = self.registers.sp.word().wrapping_add(index.wrapping_mul(2));
        self.memory.borrow().get_word(self.registers.ss, sp)
    }

    /// Discard `count` 16-bit arguments, implementing the callee-cleans
    /// convention before control returns to the guest.
    pub fn discard_arguments(&mut self, count: u16) {
        let sp = self.registers.sp.word().wrapping_add(count.wrapping_mul(2));
        self.registers.sp.set_word(sp);
    }

    /// Place a 16-bit return value in AX.
    pub fn set_return_word(&mut self, value: u16) {
        self.registers.ax.set_word(value);
    }

    /// Place a 32-bit return value in DX:AX.
    pub fn set_return_dword(&mut self, value: u32) {
        self.registers.ax.set_word(value as u16);
        self.registers.dx.set_word((value >> 16) as u16);
    }
}

/// The emulated API surface: an opaque callback table keyed by
/// `(import ordinal, function ordinal)`, plus the software-interrupt table.
///
/// Methods take `&self`; implementations needing mutable state manage their
/// own interior mutability, which keeps nested guest re-entry (host callback
/// running guest code that calls the host again) borrow-safe.
pub trait HostInvoker {
    fn invoke(
        &self,
        import: u16,
        ordinal: u16,
        ctx: &mut HostContext<'_>,
    ) -> Result<(), HostError>;

    fn interrupt(
        &self,
        vector: u8,
        ctx: &mut HostContext<'_>,
    ) -> Result<InterruptDisposition, HostError> {
        let _ = (vector, ctx);
        Ok(InterruptDisposition::Unhandled)
    }
}
