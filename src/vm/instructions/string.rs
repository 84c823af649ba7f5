use iced_x86::Register as Reg;

use crate::errors::CpuFault;
use crate::vm::cpu::CpuCore;
use crate::vm::decoder::DecodedInstruction;
use crate::vm::flags::{self, FlagOp, Width};
use crate::vm::registers::CpuFlag;

use super::Flow;

/// DS:SI is overridable by a segment prefix; ES:DI never is.
fn source_segment(cpu: &CpuCore, di: &DecodedInstruction) -> u16 {
    let prefix = di.instruction.segment_prefix();
    let reg = if prefix == Reg::None { Reg::DS } else { prefix };
    cpu.registers.read(reg) as u16
}

fn read_at(cpu: &CpuCore, width: Width, segment: u16, offset: u16) -> Result<u32, CpuFault> {
    let memory = cpu.memory().borrow();
    Ok(match width {
        Width::Byte => memory.get_byte(segment, offset)? as u32,
        Width::Word => memory.get_word(segment, offset)? as u32,
        Width::Dword => memory.get_dword(segment, offset)?,
    })
}

fn write_at(
    cpu: &CpuCore,
    width: Width,
    segment: u16,
    offset: u16,
    value: u32,
) -> Result<(), CpuFault> {
    let mut memory = cpu.memory().borrow_mut();
    match width {
        Width::Byte => memory.set_byte(segment, offset, value as u8),
        Width::Word => memory.set_word(segment, offset, value as u16),
        Width::Dword => memory.set_dword(segment, offset, value),
    }
}

fn read_accumulator(cpu: &CpuCore, width: Width) -> u32 {
    match width {
        Width::Byte => cpu.registers.ax.low() as u32,
        Width::Word => cpu.registers.ax.word() as u32,
        Width::Dword => cpu.registers.ax.dword(),
    }
}

fn write_accumulator(cpu: &mut CpuCore, width: Width, value: u32) {
    match width {
        Width::Byte => cpu.registers.ax.set_low(value as u8),
        Width::Word => cpu.registers.ax.set_word(value as u16),
        Width::Dword => cpu.registers.ax.set_dword(value),
    }
}

fn advance_si(cpu: &mut CpuCore, step: u16) {
    if cpu.registers.check_flag(CpuFlag::Directional) {
        cpu.registers.si.operation(step, u16::wrapping_sub);
    } else {
        cpu.registers.si.operation(step, u16::wrapping_add);
    }
}

fn advance_di(cpu: &mut CpuCore, step: u16) {
    if cpu.registers.check_flag(CpuFlag::Directional) {
        cpu.registers.di.operation(step, u16::wrapping_sub);
    } else {
        cpu.registers.di.operation(step, u16::wrapping_add);
    }
}

fn has_rep(di: &DecodedInstruction) -> bool {
    di.instruction.has_rep_prefix() || di.instruction.has_repne_prefix()
}

/// REPE/REPNE termination condition: `Some(state)` means repeat while
/// ZF == state.
fn rep_condition(di: &DecodedInstruction) -> Option<bool> {
    if di.instruction.has_repe_prefix() {
        Some(true)
    } else if di.instruction.has_repne_prefix() {
        Some(false)
    } else {
        None
    }
}

pub(super) fn movs(cpu: &mut CpuCore, di: &DecodedInstruction, width: Width) -> Result<Flow, CpuFault> {
    let rep = has_rep(di);
    let step = width.bytes() as u16;
    let source = source_segment(cpu, di);
    loop {
        if rep && cpu.registers.cx.word() == 0 {
            break;
        }
        let value = read_at(cpu, width, source, cpu.registers.si.word())?;
        write_at(cpu, width, cpu.registers.es, cpu.registers.di.word(), value)?;
        advance_si(cpu, step);
        advance_di(cpu, step);
        if !rep {
            break;
        }
        cpu.registers.cx.operation(1, u16::wrapping_sub);
    }
    Ok(Flow::Next)
}

pub(super) fn cmps(cpu: &mut CpuCore, di: &DecodedInstruction, width: Width) -> Result<Flow, CpuFault> {
    let rep = rep_condition(di);
    let step = width.bytes() as u16;
    let source = source_segment(cpu, di);
    loop {
        if rep.is_some() && cpu.registers.cx.word() == 0 {
            break;
        }
        let a = read_at(cpu, width, source, cpu.registers.si.word())?;
        let b = read_at(cpu, width, cpu.registers.es, cpu.registers.di.word())?;
        flags::evaluate(
            &mut cpu.registers,
            FlagOp::Cmp,
            width,
            a,
            b,
            a.wrapping_sub(b),
        );
        advance_si(cpu, step);
        advance_di(cpu, step);
        let Some(required) = rep else {
            break;
        };
        cpu.registers.cx.operation(1, u16::wrapping_sub);
        if cpu.registers.check_flag(CpuFlag::Zero) != required {
            break;
        }
    }
    Ok(Flow::Next)
}

pub(super) fn scas(cpu: &mut CpuCore, di: &DecodedInstruction, width: Width) -> Result<Flow, CpuFault> {
    let rep = rep_condition(di);
    let step = width.bytes() as u16;
    loop {
        if rep.is_some() && cpu.registers.cx.word() == 0 {
            break;
        }
        let a = read_accumulator(cpu, width);
        let b = read_at(cpu, width, cpu.registers.es, cpu.registers.di.word())?;
        flags::evaluate(
            &mut cpu.registers,
            FlagOp::Cmp,
            width,
            a,
            b,
            a.wrapping_sub(b),
        );
        advance_di(cpu, step);
        let Some(required) = rep else {
            break;
        };
        cpu.registers.cx.operation(1, u16::wrapping_sub);
        if cpu.registers.check_flag(CpuFlag::Zero) != required {
            break;
        }
    }
    Ok(Flow::Next)
}

pub(super) fn lods(cpu: &mut CpuCore, di: &DecodedInstruction, width: Width) -> Result<Flow, CpuFault> {
    let rep = has_rep(di);
    let step = width.bytes() as u16;
    let source = source_segment(cpu, di);
    loop {
        if rep && cpu.registers.cx.word() == 0 {
            break;
        }
        let value = read_at(cpu, width, source, cpu.registers.si.word())?;
        write_accumulator(cpu, width, value);
        advance_si(cpu, step);
        if !rep {
            break;
        }
        cpu.registers.cx.operation(1, u16::wrapping_sub);
    }
    Ok(Flow::Next)
}

pub(super) fn stos(cpu: &mut CpuCore, di: &DecodedInstruction, width: Width) -> Result<Flow, CpuFault> {
    let rep = has_rep(di);
    let step = width.bytes() as u16;
    loop {
        if rep && cpu.registers.cx.word() == 0 {
            break;
        }
        let value = read_accumulator(cpu, width);
        write_at(cpu, width, cpu.registers.es, cpu.registers.di.word(), value)?;
        advance_di(cpu, step);
        if !rep {
            break;
        }
        cpu.registers.cx.operation(1, u16::wrapping_sub);
    }
    Ok(Flow::Next)
}
