use iced_x86::{MemorySize, Mnemonic, OpKind};

use crate::errors::CpuFault;
use crate::vm::cpu::{operand_shape_fault, CpuCore};
use crate::vm::decoder::{DecodedInstruction, RELOC_SENTINEL};
use crate::vm::flags::Width;
use crate::vm::memory::{FarPtr, RelocationTarget};
use crate::vm::registers::{CpuFlag, FLAGS_RESERVED};
use crate::vm::unit::SENTINEL_RETURN_SEGMENT;

use super::Flow;

/// Resolved destination of a far transfer that went through a relocation.
enum FarTarget {
    Import { import: u16, ordinal: u16 },
    Internal(FarPtr),
}

impl From<RelocationTarget> for FarTarget {
    fn from(target: RelocationTarget) -> Self {
        match target {
            RelocationTarget::InternalRef(ptr) => FarTarget::Internal(ptr),
            RelocationTarget::ImportedOrdinal { import, ordinal } => {
                FarTarget::Import { import, ordinal }
            }
            RelocationTarget::ImportedName {
                import,
                name_ordinal,
            } => FarTarget::Import {
                import,
                ordinal: name_ordinal,
            },
        }
    }
}

/// Relocation lookup for a direct far branch: the patched word is the offset
/// slot of the `9A`/`EA` encoding, one byte past the opcode.
fn direct_far_target(cpu: &CpuCore, di: &DecodedInstruction) -> Result<FarTarget, CpuFault> {
    let selector = di.instruction.far_branch_selector();
    if selector != RELOC_SENTINEL {
        return Ok(FarTarget::Internal(FarPtr::new(
            selector,
            di.instruction.far_branch16(),
        )));
    }
    let slot = cpu.registers.op_ip.wrapping_add(1);
    let memory = cpu.memory().borrow();
    match memory.relocation(cpu.registers.cs, slot) {
        Some(record) => Ok(record.target.into()),
        None => Err(CpuFault::RelocationMissing {
            segment: cpu.registers.cs,
            offset: slot,
        }),
    }
}

/// Far pointer loaded through memory (`CALL FAR [mem]` / `JMP FAR [mem]`),
/// honoring a relocation record registered at the pointer's address.
fn indirect_far_target(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<FarTarget, CpuFault> {
    let ea = cpu.effective_address(di)?;
    let memory = cpu.memory().borrow();
    let offset = memory.get_word(ea.segment, ea.offset)?;
    if offset == RELOC_SENTINEL {
        if let Some(record) = memory.relocation(ea.segment, ea.offset) {
            return Ok(record.target.into());
        }
    }
    let selector = memory.get_word(ea.segment, ea.offset.wrapping_add(2))?;
    Ok(FarTarget::Internal(FarPtr::new(selector, offset)))
}

fn jump_to(cpu: &mut CpuCore, ptr: FarPtr) {
    cpu.registers.cs = ptr.segment;
    cpu.registers.ip = ptr.offset;
}

pub(super) fn jmp(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let instr = &di.instruction;
    match instr.op0_kind() {
        OpKind::NearBranch16 => {
            cpu.registers.ip = instr.near_branch16();
            Ok(Flow::Branch)
        }
        OpKind::FarBranch16 => match direct_far_target(cpu, di)? {
            FarTarget::Internal(ptr) => {
                jump_to(cpu, ptr);
                Ok(Flow::Branch)
            }
            FarTarget::Import { import, ordinal } => {
                // A far jump into an import is a tail call: run the host
                // function, then return to this frame's caller.
                cpu.invoke_host(import, ordinal)?;
                far_return(cpu, 0)
            }
        },
        OpKind::Register => {
            cpu.registers.ip = cpu.read_operand(di, 0, Width::Word)? as u16;
            Ok(Flow::Branch)
        }
        OpKind::Memory if instr.memory_size() == MemorySize::SegPtr16 => {
            match indirect_far_target(cpu, di)? {
                FarTarget::Internal(ptr) => {
                    jump_to(cpu, ptr);
                    Ok(Flow::Branch)
                }
                FarTarget::Import { import, ordinal } => {
                    cpu.invoke_host(import, ordinal)?;
                    far_return(cpu, 0)
                }
            }
        }
        OpKind::Memory => {
            cpu.registers.ip = cpu.read_operand(di, 0, Width::Word)? as u16;
            Ok(Flow::Branch)
        }
        _ => Err(operand_shape_fault(di)),
    }
}

fn condition(cpu: &CpuCore, mnemonic: Mnemonic) -> bool {
    let cf = cpu.registers.check_flag(CpuFlag::Carry);
    let zf = cpu.registers.check_flag(CpuFlag::Zero);
    let sf = cpu.registers.check_flag(CpuFlag::Sign);
    let of = cpu.registers.check_flag(CpuFlag::Overflow);
    let pf = cpu.registers.check_flag(CpuFlag::Parity);
    match mnemonic {
        Mnemonic::Jo => of,
        Mnemonic::Jno => !of,
        Mnemonic::Jb => cf,
        Mnemonic::Jae => !cf,
        Mnemonic::Je => zf,
        Mnemonic::Jne => !zf,
        Mnemonic::Jbe => cf || zf,
        Mnemonic::Ja => !cf && !zf,
        Mnemonic::Js => sf,
        Mnemonic::Jns => !sf,
        Mnemonic::Jp => pf,
        Mnemonic::Jnp => !pf,
        Mnemonic::Jl => sf != of,
        Mnemonic::Jge => sf == of,
        Mnemonic::Jle => zf || sf != of,
        Mnemonic::Jg => !zf && sf == of,
        _ => unreachable!(),
    }
}

pub(super) fn jcc(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    if condition(cpu, di.instruction.mnemonic()) {
        cpu.registers.ip = di.instruction.near_branch16();
        Ok(Flow::Branch)
    } else {
        Ok(Flow::Next)
    }
}

/// JCXZ tests CX; the address-size-prefixed JECXZ form tests all of ECX.
pub(super) fn jcxz(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let zero = if di.instruction.mnemonic() == Mnemonic::Jecxz {
        cpu.registers.cx.dword() == 0
    } else {
        cpu.registers.cx.word() == 0
    };
    if zero {
        cpu.registers.ip = di.instruction.near_branch16();
        Ok(Flow::Branch)
    } else {
        Ok(Flow::Next)
    }
}

/// LOOP/LOOPE/LOOPNE: decrement CX, branch while it is non-zero (and ZF
/// matches `zero_condition` when present).
pub(super) fn loop_cx(
    cpu: &mut CpuCore,
    di: &DecodedInstruction,
    zero_condition: Option<bool>,
) -> Result<Flow, CpuFault> {
    let cx = cpu.registers.cx.operation(1, u16::wrapping_sub);
    let mut branch = cx != 0;
    if let Some(required) = zero_condition {
        branch = branch && cpu.registers.check_flag(CpuFlag::Zero) == required;
    }
    if branch {
        cpu.registers.ip = di.instruction.near_branch16();
        Ok(Flow::Branch)
    } else {
        Ok(Flow::Next)
    }
}

pub(super) fn call(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let instr = &di.instruction;
    let return_ip = cpu.registers.op_ip.wrapping_add(di.len());
    match instr.op0_kind() {
        OpKind::NearBranch16 => {
            cpu.push_word(return_ip)?;
            cpu.registers.ip = instr.near_branch16();
            Ok(Flow::Branch)
        }
        OpKind::FarBranch16 => match direct_far_target(cpu, di)? {
            FarTarget::Internal(ptr) => {
                cpu.push_word(cpu.registers.cs)?;
                cpu.push_word(return_ip)?;
                jump_to(cpu, ptr);
                Ok(Flow::Branch)
            }
            FarTarget::Import { import, ordinal } => {
                // The bridge: IP stays on the CALL while the host runs, then
                // execution resumes at the next instruction.
                cpu.invoke_host(import, ordinal)?;
                Ok(Flow::Next)
            }
        },
        OpKind::Register => {
            let target = cpu.read_operand(di, 0, Width::Word)? as u16;
            cpu.push_word(return_ip)?;
            cpu.registers.ip = target;
            Ok(Flow::Branch)
        }
        OpKind::Memory if instr.memory_size() == MemorySize::SegPtr16 => {
            match indirect_far_target(cpu, di)? {
                FarTarget::Internal(ptr) => {
                    cpu.push_word(cpu.registers.cs)?;
                    cpu.push_word(return_ip)?;
                    jump_to(cpu, ptr);
                    Ok(Flow::Branch)
                }
                FarTarget::Import { import, ordinal } => {
                    cpu.invoke_host(import, ordinal)?;
                    Ok(Flow::Next)
                }
            }
        }
        OpKind::Memory => {
            let target = cpu.read_operand(di, 0, Width::Word)? as u16;
            cpu.push_word(return_ip)?;
            cpu.registers.ip = target;
            Ok(Flow::Branch)
        }
        _ => Err(operand_shape_fault(di)),
    }
}

fn stack_adjust(di: &DecodedInstruction) -> u16 {
    if di.instruction.op_count() > 0 {
        di.instruction.immediate16()
    } else {
        0
    }
}

pub(super) fn ret_near(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let ip = cpu.pop_word()?;
    cpu.registers.ip = ip;
    let sp = cpu.registers.sp.word().wrapping_add(stack_adjust(di));
    cpu.registers.sp.set_word(sp);
    Ok(Flow::Branch)
}

fn far_return(cpu: &mut CpuCore, adjust: u16) -> Result<Flow, CpuFault> {
    let ip = cpu.pop_word()?;
    let cs = cpu.pop_word()?;
    cpu.registers.ip = ip;
    cpu.registers.cs = cs;
    let sp = cpu.registers.sp.word().wrapping_add(adjust);
    cpu.registers.sp.set_word(sp);
    // Returning into the reserved selector means the execution unit's
    // simulated far call has unwound.
    if cs == SENTINEL_RETURN_SEGMENT {
        Ok(Flow::Halt)
    } else {
        Ok(Flow::Branch)
    }
}

pub(super) fn ret_far(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    far_return(cpu, stack_adjust(di))
}

pub(super) fn int_n(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    int_vector(cpu, di.instruction.immediate8())
}

pub(super) fn int_vector(cpu: &mut CpuCore, vector: u8) -> Result<Flow, CpuFault> {
    cpu.invoke_interrupt(vector)?;
    Ok(Flow::Next)
}

pub(super) fn into(cpu: &mut CpuCore) -> Result<Flow, CpuFault> {
    if cpu.registers.check_flag(CpuFlag::Overflow) {
        cpu.invoke_interrupt(4)?;
    }
    Ok(Flow::Next)
}

pub(super) fn iret(cpu: &mut CpuCore) -> Result<Flow, CpuFault> {
    let ip = cpu.pop_word()?;
    let cs = cpu.pop_word()?;
    let flags = cpu.pop_word()?;
    cpu.registers.ip = ip;
    cpu.registers.cs = cs;
    cpu.registers.flags = (flags & 0x0FD5) | FLAGS_RESERVED;
    if cs == SENTINEL_RETURN_SEGMENT {
        Ok(Flow::Halt)
    } else {
        Ok(Flow::Branch)
    }
}

pub(super) fn flag_instruction(cpu: &mut CpuCore, mnemonic: Mnemonic) -> Result<Flow, CpuFault> {
    match mnemonic {
        Mnemonic::Clc => cpu.registers.unset_flag(CpuFlag::Carry),
        Mnemonic::Stc => cpu.registers.set_flag(CpuFlag::Carry),
        Mnemonic::Cmc => cpu.registers.flip_flag(CpuFlag::Carry),
        Mnemonic::Cld => cpu.registers.unset_flag(CpuFlag::Directional),
        Mnemonic::Std => cpu.registers.set_flag(CpuFlag::Directional),
        Mnemonic::Cli => cpu.registers.unset_flag(CpuFlag::Interrupt),
        Mnemonic::Sti => cpu.registers.set_flag(CpuFlag::Interrupt),
        _ => unreachable!(),
    }
    Ok(Flow::Next)
}
