use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use iced_x86::{OpKind, Register as Reg};
use log::{debug, trace};

use crate::errors::CpuFault;
use crate::host::{HostContext, InterruptDisposition, SharedInvoker, SharedMemory};
use crate::vm::decoder::{DecodedInstruction, RELOC_SENTINEL};
use crate::vm::flags::Width;
use crate::vm::instructions::{self, Flow};
use crate::vm::memory::FarPtr;
use crate::vm::registers::CpuRegisters;

/// One logical thread of guest execution: its own register file over the
/// module's shared memory and callback table.
pub struct CpuCore {
    pub registers: CpuRegisters,
    pub halted: bool,
    memory: SharedMemory,
    invoker: SharedInvoker,
    cancelled: Arc<AtomicBool>,
}

impl CpuCore {
    pub fn new(memory: SharedMemory, invoker: SharedInvoker, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            registers: CpuRegisters::new(),
            halted: false,
            memory,
            invoker,
            cancelled,
        }
    }

    #[inline]
    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    /// Fetch, dispatch and retire one instruction. Cancellation is observed
    /// only here, between instructions.
    pub fn tick(&mut self) -> Result<(), CpuFault> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(CpuFault::Cancelled);
        }
        let decoded = self
            .memory
            .borrow_mut()
            .instruction_at(self.registers.cs, self.registers.ip)?;
        self.registers.op_ip = self.registers.ip;
        trace!(
            "{:04X}:{:04X} {}",
            self.registers.cs,
            self.registers.ip,
            decoded.instruction
        );
        match instructions::execute(self, &decoded)? {
            Flow::Next => {
                self.registers.ip = self.registers.op_ip.wrapping_add(decoded.len());
            }
            Flow::Branch => {}
            Flow::Halt => self.halted = true,
        }
        Ok(())
    }

    // ---- operand access --------------------------------------------------

    /// Width of the instruction's register/memory operands; immediate-only
    /// shapes (e.g. `PUSH imm`) default to word.
    pub fn op_width(&self, di: &DecodedInstruction) -> Result<Width, CpuFault> {
        let instr = &di.instruction;
        for idx in 0..instr.op_count() {
            let width = match instr.op_kind(idx) {
                OpKind::Register => Width::from_bytes(instr.op_register(idx).size()),
                OpKind::Memory => Width::from_bytes(instr.memory_size().size()),
                _ => None,
            };
            if let Some(width) = width {
                return Ok(width);
            }
        }
        Ok(Width::Word)
    }

    pub fn read_operand(
        &mut self,
        di: &DecodedInstruction,
        idx: u32,
        width: Width,
    ) -> Result<u32, CpuFault> {
        let instr = &di.instruction;
        match instr.op_kind(idx) {
            OpKind::Register => Ok(self.registers.read(instr.op_register(idx))),
            OpKind::Immediate8 => Ok(instr.immediate8() as u32),
            // Sign-extension mandated by the operand kind.
            OpKind::Immediate8to16 => Ok(instr.immediate8to16() as u16 as u32),
            OpKind::Immediate8to32 => Ok(instr.immediate8to32() as u32),
            OpKind::Immediate16 => self.relocated_word_immediate(di, instr.immediate16()),
            OpKind::Immediate32 => self.relocated_dword_immediate(di, instr.immediate32()),
            OpKind::NearBranch16 => Ok(instr.near_branch16() as u32),
            OpKind::Memory => {
                let ea = self.effective_address(di)?;
                self.read_memory(width, ea)
            }
            _ => Err(operand_shape_fault(di)),
        }
    }

    pub fn write_operand(
        &mut self,
        di: &DecodedInstruction,
        idx: u32,
        width: Width,
        value: u32,
    ) -> Result<(), CpuFault> {
        let instr = &di.instruction;
        match instr.op_kind(idx) {
            OpKind::Register => {
                self.registers.write(instr.op_register(idx), value);
                Ok(())
            }
            OpKind::Memory => {
                let ea = self.effective_address(di)?;
                self.write_memory(width, ea, value)
            }
            _ => Err(operand_shape_fault(di)),
        }
    }

    /// `(segment, offset)` of the instruction's memory operand. The offset is
    /// `base + index + displacement` in wrapping 16-bit arithmetic; the
    /// segment honors override prefixes and defaults to SS for BP-based
    /// addressing, DS otherwise (both already folded in by the decoder).
    pub fn effective_address(&self, di: &DecodedInstruction) -> Result<FarPtr, CpuFault> {
        let instr = &di.instruction;
        let mut offset = 0u16;
        if instr.memory_base() != Reg::None {
            offset = offset.wrapping_add(self.registers.read(instr.memory_base()) as u16);
        }
        if instr.memory_index() != Reg::None {
            offset = offset.wrapping_add(self.registers.read(instr.memory_index()) as u16);
        }
        let mut displacement = instr.memory_displacement64() as u16;
        if displacement == RELOC_SENTINEL && di.offsets.has_displacement() {
            let slot = self
                .registers
                .op_ip
                .wrapping_add(di.offsets.displacement_offset() as u16);
            let memory = self.memory.borrow();
            if let Some(record) = memory.relocation(self.registers.cs, slot) {
                displacement = record.target.resolved().offset;
            }
        }
        offset = offset.wrapping_add(displacement);
        let segment = self.registers.read(instr.memory_segment()) as u16;
        Ok(FarPtr::new(segment, offset))
    }

    /// Memory read on the operand path: a word whose on-disk value is the
    /// relocation sentinel reads as the record's resolved target.
    pub fn read_memory(&self, width: Width, ptr: FarPtr) -> Result<u32, CpuFault> {
        let memory = self.memory.borrow();
        match width {
            Width::Byte => Ok(memory.get_byte(ptr.segment, ptr.offset)? as u32),
            Width::Word => {
                let raw = memory.get_word(ptr.segment, ptr.offset)?;
                if raw == RELOC_SENTINEL {
                    if let Some(record) = memory.relocation(ptr.segment, ptr.offset) {
                        return Ok(record.target.resolved().offset as u32);
                    }
                }
                Ok(raw as u32)
            }
            Width::Dword => {
                let raw = memory.get_dword(ptr.segment, ptr.offset)?;
                if raw as u16 == RELOC_SENTINEL {
                    if let Some(record) = memory.relocation(ptr.segment, ptr.offset) {
                        return Ok(record.target.resolved().to_dword());
                    }
                }
                Ok(raw)
            }
        }
    }

    pub fn write_memory(&self, width: Width, ptr: FarPtr, value: u32) -> Result<(), CpuFault> {
        let mut memory = self.memory.borrow_mut();
        match width {
            Width::Byte => memory.set_byte(ptr.segment, ptr.offset, value as u8),
            Width::Word => memory.set_word(ptr.segment, ptr.offset, value as u16),
            Width::Dword => memory.set_dword(ptr.segment, ptr.offset, value),
        }
    }

    fn relocated_word_immediate(
        &self,
        di: &DecodedInstruction,
        raw: u16,
    ) -> Result<u32, CpuFault> {
        if raw != RELOC_SENTINEL || !di.offsets.has_immediate() {
            return Ok(raw as u32);
        }
        let slot = self
            .registers
            .op_ip
            .wrapping_add(di.offsets.immediate_offset() as u16);
        let memory = self.memory.borrow();
        match memory.relocation(self.registers.cs, slot) {
            Some(record) => Ok(record.target.resolved().offset as u32),
            // A literal 0xFFFF immediate with no record is just the value -1.
            None => Ok(raw as u32),
        }
    }

    fn relocated_dword_immediate(&self, di: &DecodedInstruction, raw: u32) -> Result<u32, CpuFault> {
        if raw as u16 != RELOC_SENTINEL || !di.offsets.has_immediate() {
            return Ok(raw);
        }
        let slot = self
            .registers
            .op_ip
            .wrapping_add(di.offsets.immediate_offset() as u16);
        let memory = self.memory.borrow();
        match memory.relocation(self.registers.cs, slot) {
            Some(record) => Ok(record.target.resolved().to_dword()),
            None => Ok(raw),
        }
    }

    // ---- stack -----------------------------------------------------------

    pub fn push_word(&mut self, value: u16) -> Result<(), CpuFault> {
        let sp = self.registers.sp.word();
        if sp < 2 {
            return Err(CpuFault::StackFault {
                segment: self.registers.ss,
                sp,
            });
        }
        let sp = sp - 2;
        self.registers.sp.set_word(sp);
        self.memory
            .borrow_mut()
            .set_word(self.registers.ss, sp, value)
    }

    pub fn pop_word(&mut self) -> Result<u16, CpuFault> {
        let sp = self.registers.sp.word();
        if sp == u16::MAX {
            return Err(CpuFault::StackFault {
                segment: self.registers.ss,
                sp,
            });
        }
        let value = self.memory.borrow().get_word(self.registers.ss, sp)?;
        self.registers.sp.set_word(sp.wrapping_add(2));
        Ok(value)
    }

    pub fn push_byte(&mut self, value: u8) -> Result<(), CpuFault> {
        let sp = self.registers.sp.word();
        if sp < 1 {
            return Err(CpuFault::StackFault {
                segment: self.registers.ss,
                sp,
            });
        }
        let sp = sp - 1;
        self.registers.sp.set_word(sp);
        self.memory
            .borrow_mut()
            .set_byte(self.registers.ss, sp, value)
    }

    pub fn pop_byte(&mut self) -> Result<u8, CpuFault> {
        let sp = self.registers.sp.word();
        let value = self.memory.borrow().get_byte(self.registers.ss, sp)?;
        self.registers.sp.set_word(sp.wrapping_add(1));
        Ok(value)
    }

    // ---- host bridge -----------------------------------------------------

    /// Vector a far call that resolved to an imported ordinal out to the
    /// host. IP has not been advanced past the CALL yet; the caller does so
    /// once this returns.
    pub fn invoke_host(&mut self, import: u16, ordinal: u16) -> Result<(), CpuFault> {
        debug!("host invoke {:#06X}:{}", import, ordinal);
        let invoker = Rc::clone(&self.invoker);
        let memory = Rc::clone(&self.memory);
        let mut ctx = HostContext {
            registers: &mut self.registers,
            memory: &memory,
        };
        invoker
            .invoke(import, ordinal, &mut ctx)
            .map_err(|cause| CpuFault::HostInvokeFailure {
                import,
                ordinal,
                cause,
            })
    }

    /// Deliver a software interrupt to the host table.
    pub fn invoke_interrupt(&mut self, vector: u8) -> Result<(), CpuFault> {
        debug!("interrupt {:#04X}", vector);
        let invoker = Rc::clone(&self.invoker);
        let memory = Rc::clone(&self.memory);
        let mut ctx = HostContext {
            registers: &mut self.registers,
            memory: &memory,
        };
        match invoker.interrupt(vector, &mut ctx) {
            Ok(InterruptDisposition::Handled) => Ok(()),
            Ok(InterruptDisposition::Unhandled) => Err(CpuFault::UnhandledInterrupt(vector)),
            Err(cause) => Err(CpuFault::HostInvokeFailure {
                import: 0,
                ordinal: vector as u16,
                cause,
            }),
        }
    }
}

pub(crate) fn operand_shape_fault(di: &DecodedInstruction) -> CpuFault {
    let instr = &di.instruction;
    let second = if instr.op_count() > 1 {
        instr.op1_kind()
    } else {
        instr.op0_kind()
    };
    CpuFault::UnsupportedOperandShape {
        mnemonic: instr.mnemonic(),
        kinds: (instr.op0_kind(), second),
    }
}
