use iced_x86::{Mnemonic, OpKind};

use crate::errors::CpuFault;
use crate::vm::cpu::{operand_shape_fault, CpuCore};
use crate::vm::decoder::DecodedInstruction;
use crate::vm::flags::Width;
use crate::vm::registers::{CpuFlag, FLAGS_RESERVED};

use super::Flow;

/// Bits of FLAGS that POPF/SAHF may load; the reserved bit stays set.
const FLAGS_WRITABLE: u16 = 0x0FD5;

fn operand_width_at(di: &DecodedInstruction, idx: u32) -> Result<Width, CpuFault> {
    let instr = &di.instruction;
    let width = match instr.op_kind(idx) {
        OpKind::Register => Width::from_bytes(instr.op_register(idx).size()),
        OpKind::Memory => Width::from_bytes(instr.memory_size().size()),
        _ => None,
    };
    width.ok_or_else(|| operand_shape_fault(di))
}

pub(super) fn mov(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let width = cpu.op_width(di)?;
    let value = cpu.read_operand(di, 1, width)?;
    cpu.write_operand(di, 0, width, value)?;
    Ok(Flow::Next)
}

pub(super) fn movzx(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let dst_width = operand_width_at(di, 0)?;
    let src_width = operand_width_at(di, 1)?;
    let value = cpu.read_operand(di, 1, src_width)?;
    cpu.write_operand(di, 0, dst_width, value)?;
    Ok(Flow::Next)
}

pub(super) fn movsx(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let dst_width = operand_width_at(di, 0)?;
    let src_width = operand_width_at(di, 1)?;
    let value = cpu.read_operand(di, 1, src_width)?;
    let extended = if value & src_width.sign_bit() != 0 {
        value | !src_width.mask()
    } else {
        value
    };
    cpu.write_operand(di, 0, dst_width, extended & dst_width.mask())?;
    Ok(Flow::Next)
}

pub(super) fn xchg(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let width = cpu.op_width(di)?;
    let a = cpu.read_operand(di, 0, width)?;
    let b = cpu.read_operand(di, 1, width)?;
    cpu.write_operand(di, 0, width, b)?;
    cpu.write_operand(di, 1, width, a)?;
    Ok(Flow::Next)
}

pub(super) fn lea(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    if di.instruction.op1_kind() != OpKind::Memory {
        return Err(operand_shape_fault(di));
    }
    let ea = cpu.effective_address(di)?;
    cpu.write_operand(di, 0, Width::Word, ea.offset as u32)?;
    Ok(Flow::Next)
}

/// LDS/LES: load a full far pointer from memory, offset into the register
/// operand and selector into the segment register the mnemonic names.
pub(super) fn load_far_pointer(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    if di.instruction.op1_kind() != OpKind::Memory {
        return Err(operand_shape_fault(di));
    }
    let ea = cpu.effective_address(di)?;
    let pointer = cpu.read_memory(Width::Dword, ea)?;
    cpu.write_operand(di, 0, Width::Word, pointer & 0xFFFF)?;
    let selector = (pointer >> 16) as u16;
    match di.instruction.mnemonic() {
        Mnemonic::Lds => cpu.registers.ds = selector,
        Mnemonic::Les => cpu.registers.es = selector,
        _ => return Err(operand_shape_fault(di)),
    }
    Ok(Flow::Next)
}

pub(super) fn push(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    // Reads before pushing, so PUSH SP stores the pre-decrement value
    // (80286 behavior).
    let value = cpu.read_operand(di, 0, Width::Word)?;
    cpu.push_word(value as u16)?;
    Ok(Flow::Next)
}

pub(super) fn pop(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let value = cpu.pop_word()?;
    cpu.write_operand(di, 0, Width::Word, value as u32)?;
    Ok(Flow::Next)
}

pub(super) fn pushf(cpu: &mut CpuCore) -> Result<Flow, CpuFault> {
    let flags = cpu.registers.flags | FLAGS_RESERVED;
    cpu.push_word(flags)?;
    Ok(Flow::Next)
}

pub(super) fn popf(cpu: &mut CpuCore) -> Result<Flow, CpuFault> {
    let value = cpu.pop_word()?;
    cpu.registers.flags = (value & FLAGS_WRITABLE) | FLAGS_RESERVED;
    Ok(Flow::Next)
}

pub(super) fn pusha(cpu: &mut CpuCore) -> Result<Flow, CpuFault> {
    let original_sp = cpu.registers.sp.word();
    cpu.push_word(cpu.registers.ax.word())?;
    cpu.push_word(cpu.registers.cx.word())?;
    cpu.push_word(cpu.registers.dx.word())?;
    cpu.push_word(cpu.registers.bx.word())?;
    cpu.push_word(original_sp)?;
    cpu.push_word(cpu.registers.bp.word())?;
    cpu.push_word(cpu.registers.si.word())?;
    cpu.push_word(cpu.registers.di.word())?;
    Ok(Flow::Next)
}

pub(super) fn popa(cpu: &mut CpuCore) -> Result<Flow, CpuFault> {
    let di = cpu.pop_word()?;
    cpu.registers.di.set_word(di);
    let si = cpu.pop_word()?;
    cpu.registers.si.set_word(si);
    let bp = cpu.pop_word()?;
    cpu.registers.bp.set_word(bp);
    // The stored SP is discarded.
    let sp = cpu.registers.sp.word().wrapping_add(2);
    cpu.registers.sp.set_word(sp);
    let bx = cpu.pop_word()?;
    cpu.registers.bx.set_word(bx);
    let dx = cpu.pop_word()?;
    cpu.registers.dx.set_word(dx);
    let cx = cpu.pop_word()?;
    cpu.registers.cx.set_word(cx);
    let ax = cpu.pop_word()?;
    cpu.registers.ax.set_word(ax);
    Ok(Flow::Next)
}

pub(super) fn cbw(cpu: &mut CpuCore) -> Result<Flow, CpuFault> {
    let extended = cpu.registers.ax.low() as i8 as i16 as u16;
    cpu.registers.ax.set_word(extended);
    Ok(Flow::Next)
}

pub(super) fn cwd(cpu: &mut CpuCore) -> Result<Flow, CpuFault> {
    let fill = if cpu.registers.ax.word() & 0x8000 != 0 {
        0xFFFF
    } else {
        0x0000
    };
    cpu.registers.dx.set_word(fill);
    Ok(Flow::Next)
}

pub(super) fn cwde(cpu: &mut CpuCore) -> Result<Flow, CpuFault> {
    let extended = cpu.registers.ax.word() as i16 as i32 as u32;
    cpu.registers.ax.set_dword(extended);
    Ok(Flow::Next)
}

pub(super) fn cdq(cpu: &mut CpuCore) -> Result<Flow, CpuFault> {
    let fill = if cpu.registers.ax.dword() & 0x8000_0000 != 0 {
        0xFFFF_FFFF
    } else {
        0
    };
    cpu.registers.dx.set_dword(fill);
    Ok(Flow::Next)
}

pub(super) fn xlat(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let segment = cpu.registers.read(di.instruction.memory_segment()) as u16;
    let offset = cpu
        .registers
        .bx
        .word()
        .wrapping_add(cpu.registers.ax.low() as u16);
    let value = cpu.memory().borrow().get_byte(segment, offset)?;
    cpu.registers.ax.set_low(value);
    Ok(Flow::Next)
}

// Undocumented, but real modules use it: AL <- CF ? 0xFF : 0x00.
pub(super) fn salc(cpu: &mut CpuCore) -> Result<Flow, CpuFault> {
    let value = if cpu.registers.check_flag(CpuFlag::Carry) {
        0xFF
    } else {
        0x00
    };
    cpu.registers.ax.set_low(value);
    Ok(Flow::Next)
}

pub(super) fn lahf(cpu: &mut CpuCore) -> Result<Flow, CpuFault> {
    let low = (cpu.registers.flags as u8 & 0xD5) | 0x02;
    cpu.registers.ax.set_high(low);
    Ok(Flow::Next)
}

pub(super) fn sahf(cpu: &mut CpuCore) -> Result<Flow, CpuFault> {
    let ah = cpu.registers.ax.high() as u16;
    cpu.registers.flags =
        (cpu.registers.flags & 0xFF00) | (ah & 0x00D5) | FLAGS_RESERVED;
    Ok(Flow::Next)
}

pub(super) fn enter(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let size = di.instruction.immediate16();
    let level = (di.instruction.immediate8_2nd() % 32) as u16;
    cpu.push_word(cpu.registers.bp.word())?;
    let frame = cpu.registers.sp.word();
    if level > 0 {
        for _ in 1..level {
            let bp = cpu.registers.bp.word().wrapping_sub(2);
            cpu.registers.bp.set_word(bp);
            let saved = cpu.memory().borrow().get_word(cpu.registers.ss, bp)?;
            cpu.push_word(saved)?;
        }
        cpu.push_word(frame)?;
    }
    cpu.registers.bp.set_word(frame);
    let sp = cpu.registers.sp.word().wrapping_sub(size);
    cpu.registers.sp.set_word(sp);
    Ok(Flow::Next)
}

pub(super) fn leave(cpu: &mut CpuCore) -> Result<Flow, CpuFault> {
    cpu.registers.sp.set_word(cpu.registers.bp.word());
    let bp = cpu.pop_word()?;
    cpu.registers.bp.set_word(bp);
    Ok(Flow::Next)
}
