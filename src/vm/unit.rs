use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;

use crate::errors::CpuFault;
use crate::host::{SharedInvoker, SharedMemory};
use crate::vm::cpu::CpuCore;
use crate::vm::memory::FarPtr;
use crate::vm::registers::CpuRegisters;

/// Reserved selector pushed as the far-return address of a simulated call;
/// an RETF into it terminates the unit normally.
pub const SENTINEL_RETURN_SEGMENT: u16 = 0xFFFF;

/// A single logical thread of guest execution. Units own their register file
/// and borrow the module's memory and callback table; nested host->guest
/// re-entry uses a different unit over the same memory, so caller register
/// state is never disturbed.
pub struct ExecutionUnit {
    cpu: CpuCore,
    instruction_budget: Option<u64>,
}

impl ExecutionUnit {
    pub fn new(memory: SharedMemory, invoker: SharedInvoker, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            cpu: CpuCore::new(memory, invoker, cancelled),
            instruction_budget: None,
        }
    }

    /// Bound the next `execute` to at most `budget` instructions; exceeding
    /// it terminates the unit with `Cancelled`.
    pub fn set_instruction_budget(&mut self, budget: Option<u64>) {
        self.instruction_budget = budget;
    }

    /// Registers of the last execution, for host inspection between calls.
    pub fn registers(&self) -> &CpuRegisters {
        &self.cpu.registers
    }

    pub fn registers_mut(&mut self) -> &mut CpuRegisters {
        &mut self.cpu.registers
    }

    /// Run guest code at `entry`.
    ///
    /// Unless `bypass_state` is set, the standard startup state is seeded:
    /// registers cleared, AX = channel number, DS = ES = the module's default
    /// data segment. `initial_stack` values are pushed rightmost-first after
    /// SP is set to `initial_sp`. With `simulate_call_far`, a sentinel far
    /// return address is pushed so the guest's final RETF ends the call;
    /// otherwise the unit runs until HLT, a fault, or cancellation.
    pub fn execute(
        &mut self,
        entry: FarPtr,
        channel: u16,
        simulate_call_far: bool,
        bypass_state: bool,
        initial_stack: &[u16],
        initial_sp: u16,
    ) -> Result<CpuRegisters, CpuFault> {
        if !bypass_state {
            let ss = self.cpu.registers.ss;
            self.cpu.registers.zero();
            self.cpu.registers.ss = ss;
            self.cpu.registers.ax.set_word(channel);
            let data_segment = self.cpu.memory().borrow().default_data_segment();
            if let Some(data) = data_segment {
                self.cpu.registers.ds = data;
                self.cpu.registers.es = data;
            }
        }
        self.cpu.registers.cs = entry.segment;
        self.cpu.registers.ip = entry.offset;
        self.cpu.registers.sp.set_word(initial_sp);
        for value in initial_stack.iter().rev() {
            self.cpu.push_word(*value)?;
        }
        if simulate_call_far {
            self.cpu.push_word(SENTINEL_RETURN_SEGMENT)?;
            self.cpu.push_word(0xFFFF)?;
        }

        self.cpu.halted = false;
        let mut executed: u64 = 0;
        while !self.cpu.halted {
            if let Some(budget) = self.instruction_budget {
                if executed >= budget {
                    debug!("instruction budget of {} exhausted at {}", budget, entry);
                    return Err(CpuFault::Cancelled);
                }
            }
            self.cpu.tick()?;
            executed += 1;
            // A near RET can also unwind into the sentinel frame; it leaves
            // the selector word behind, so discard it before finishing.
            if simulate_call_far && !self.cpu.halted && self.cpu.registers.ip == u16::MAX {
                let sp = self.cpu.registers.sp.word();
                let leftover = self
                    .cpu
                    .memory()
                    .borrow()
                    .get_word(self.cpu.registers.ss, sp);
                if matches!(leftover, Ok(SENTINEL_RETURN_SEGMENT)) {
                    self.cpu.registers.sp.set_word(sp.wrapping_add(2));
                }
                self.cpu.halted = true;
            }
        }
        Ok(self.cpu.registers.clone())
    }
}

/// LIFO pool of execution units over one module's memory and callbacks. A
/// unit is checked out for each guest-entry call (host callbacks re-entering
/// guest code check out their own) and returned on normal or exceptional
/// completion.
pub struct ExecutionUnitPool {
    memory: SharedMemory,
    invoker: SharedInvoker,
    cancelled: Arc<AtomicBool>,
    units: RefCell<Vec<ExecutionUnit>>,
}

impl ExecutionUnitPool {
    pub fn new(memory: SharedMemory, invoker: SharedInvoker) -> Self {
        Self {
            memory,
            invoker,
            cancelled: Arc::new(AtomicBool::new(false)),
            units: RefCell::new(Vec::new()),
        }
    }

    /// Flag consulted between instructions by every unit of this pool.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    pub fn checkout(&self) -> ExecutionUnit {
        self.units.borrow_mut().pop().unwrap_or_else(|| {
            ExecutionUnit::new(
                SharedMemory::clone(&self.memory),
                SharedInvoker::clone(&self.invoker),
                Arc::clone(&self.cancelled),
            )
        })
    }

    pub fn checkin(&self, unit: ExecutionUnit) {
        self.units.borrow_mut().push(unit);
    }

    /// Checkout/execute/checkin in one step; the unit returns to the pool on
    /// both normal and exceptional completion.
    pub fn execute(
        &self,
        entry: FarPtr,
        channel: u16,
        simulate_call_far: bool,
        bypass_state: bool,
        initial_stack: &[u16],
        initial_sp: u16,
    ) -> Result<CpuRegisters, CpuFault> {
        let mut unit = self.checkout();
        let result = unit.execute(
            entry,
            channel,
            simulate_call_far,
            bypass_state,
            initial_stack,
            initial_sp,
        );
        self.checkin(unit);
        result
    }

    /// Signal cooperative cancellation; running units observe it at the next
    /// instruction boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Re-arm the pool after a cancellation.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::Relaxed);
    }
}
