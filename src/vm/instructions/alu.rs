use iced_x86::Mnemonic;

use crate::errors::CpuFault;
use crate::utils::number::div_rem;
use crate::vm::cpu::CpuCore;
use crate::vm::decoder::DecodedInstruction;
use crate::vm::flags::{self, FlagOp, Width};
use crate::vm::registers::CpuFlag;

use super::Flow;

#[inline]
fn sign_extend(value: u32, width: Width) -> i64 {
    let shift = 64 - width.bits();
    ((value as u64) << shift) as i64 >> shift
}

fn update_szp(cpu: &mut CpuCore, value: u8) {
    cpu.registers.update_flag(CpuFlag::Zero, value == 0);
    cpu.registers.update_flag(CpuFlag::Sign, value & 0x80 != 0);
    cpu.registers
        .update_flag(CpuFlag::Parity, value.count_ones() & 1 == 0);
}

/// The two-operand arithmetic/logic family. CMP and TEST evaluate flags
/// without writing back.
pub(super) fn binop(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let width = cpu.op_width(di)?;
    let a = cpu.read_operand(di, 0, width)?;
    let b = cpu.read_operand(di, 1, width)?;
    let carry = cpu.registers.check_flag(CpuFlag::Carry) as u32;
    let (op, result, writes_back) = match di.instruction.mnemonic() {
        Mnemonic::Add => (FlagOp::Add, a.wrapping_add(b), true),
        Mnemonic::Adc => (FlagOp::Adc, a.wrapping_add(b).wrapping_add(carry), true),
        Mnemonic::Sub => (FlagOp::Sub, a.wrapping_sub(b), true),
        Mnemonic::Sbb => (FlagOp::Sbb, a.wrapping_sub(b).wrapping_sub(carry), true),
        Mnemonic::Cmp => (FlagOp::Cmp, a.wrapping_sub(b), false),
        Mnemonic::And => (FlagOp::And, a & b, true),
        Mnemonic::Or => (FlagOp::Or, a | b, true),
        Mnemonic::Xor => (FlagOp::Xor, a ^ b, true),
        Mnemonic::Test => (FlagOp::Test, a & b, false),
        _ => unreachable!(),
    };
    flags::evaluate(&mut cpu.registers, op, width, a, b, result);
    if writes_back {
        cpu.write_operand(di, 0, width, result & width.mask())?;
    }
    Ok(Flow::Next)
}

pub(super) fn inc_dec(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let width = cpu.op_width(di)?;
    let a = cpu.read_operand(di, 0, width)?;
    let (op, result) = match di.instruction.mnemonic() {
        Mnemonic::Inc => (FlagOp::Inc, a.wrapping_add(1)),
        _ => (FlagOp::Dec, a.wrapping_sub(1)),
    };
    flags::evaluate(&mut cpu.registers, op, width, a, 1, result);
    cpu.write_operand(di, 0, width, result & width.mask())?;
    Ok(Flow::Next)
}

pub(super) fn neg(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let width = cpu.op_width(di)?;
    let operand = cpu.read_operand(di, 0, width)?;
    let result = 0u32.wrapping_sub(operand);
    flags::evaluate(&mut cpu.registers, FlagOp::Neg, width, 0, operand, result);
    cpu.write_operand(di, 0, width, result & width.mask())?;
    Ok(Flow::Next)
}

pub(super) fn not(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let width = cpu.op_width(di)?;
    let operand = cpu.read_operand(di, 0, width)?;
    cpu.write_operand(di, 0, width, !operand & width.mask())?;
    Ok(Flow::Next)
}

pub(super) fn mul(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let width = cpu.op_width(di)?;
    let src = cpu.read_operand(di, 0, width)?;
    match width {
        Width::Byte => {
            let product = (cpu.registers.ax.low() as u16) * (src as u16);
            cpu.registers.ax.set_word(product);
            flags::evaluate(
                &mut cpu.registers,
                FlagOp::Mul,
                width,
                src,
                (product >> 8) as u32,
                (product & 0xFF) as u32,
            );
        }
        Width::Word => {
            let product = (cpu.registers.ax.word() as u32) * src;
            cpu.registers.ax.set_word(product as u16);
            cpu.registers.dx.set_word((product >> 16) as u16);
            flags::evaluate(
                &mut cpu.registers,
                FlagOp::Mul,
                width,
                src,
                product >> 16,
                product & 0xFFFF,
            );
        }
        Width::Dword => {
            let product = (cpu.registers.ax.dword() as u64) * (src as u64);
            cpu.registers.ax.set_dword(product as u32);
            cpu.registers.dx.set_dword((product >> 32) as u32);
            flags::evaluate(
                &mut cpu.registers,
                FlagOp::Mul,
                width,
                src,
                (product >> 32) as u32,
                product as u32,
            );
        }
    }
    Ok(Flow::Next)
}

pub(super) fn imul(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let width = cpu.op_width(di)?;
    match di.instruction.op_count() {
        // One-operand form: widening multiply into the accumulator pair.
        1 => {
            let src = cpu.read_operand(di, 0, width)?;
            match width {
                Width::Byte => {
                    let product =
                        (cpu.registers.ax.low() as i8 as i16) * (src as u8 as i8 as i16);
                    cpu.registers.ax.set_word(product as u16);
                    flags::evaluate(
                        &mut cpu.registers,
                        FlagOp::IMul,
                        width,
                        src,
                        ((product as u16) >> 8) as u32,
                        (product as u16 & 0xFF) as u32,
                    );
                }
                Width::Word => {
                    let product =
                        (cpu.registers.ax.word() as i16 as i32) * (src as u16 as i16 as i32);
                    cpu.registers.ax.set_word(product as u16);
                    cpu.registers.dx.set_word((product as u32 >> 16) as u16);
                    flags::evaluate(
                        &mut cpu.registers,
                        FlagOp::IMul,
                        width,
                        src,
                        product as u32 >> 16,
                        product as u32 & 0xFFFF,
                    );
                }
                Width::Dword => {
                    let product =
                        (cpu.registers.ax.dword() as i32 as i64) * (src as i32 as i64);
                    cpu.registers.ax.set_dword(product as u32);
                    cpu.registers.dx.set_dword((product as u64 >> 32) as u32);
                    flags::evaluate(
                        &mut cpu.registers,
                        FlagOp::IMul,
                        width,
                        src,
                        (product as u64 >> 32) as u32,
                        product as u32,
                    );
                }
            }
        }
        // Two- and three-operand forms: truncating multiply into a register.
        count @ (2 | 3) => {
            let (a_idx, b_idx) = if count == 2 { (0, 1) } else { (1, 2) };
            let a = cpu.read_operand(di, a_idx, width)?;
            let b = cpu.read_operand(di, b_idx, width)?;
            let full = sign_extend(a, width).wrapping_mul(sign_extend(b, width));
            let result = (full as u64 as u32) & width.mask();
            let high = ((full >> width.bits()) as u32) & width.mask();
            cpu.write_operand(di, 0, width, result)?;
            flags::evaluate(&mut cpu.registers, FlagOp::IMul, width, a, high, result);
        }
        _ => return Err(crate::vm::cpu::operand_shape_fault(di)),
    }
    Ok(Flow::Next)
}

pub(super) fn div(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let width = cpu.op_width(di)?;
    let divisor = cpu.read_operand(di, 0, width)?;
    if divisor == 0 {
        return Err(CpuFault::DivideError);
    }
    match width {
        Width::Byte => {
            let dividend = cpu.registers.ax.word();
            let (quotient, remainder) = div_rem(dividend, divisor as u16);
            if quotient > 0xFF {
                return Err(CpuFault::DivideError);
            }
            cpu.registers.ax.set_low(quotient as u8);
            cpu.registers.ax.set_high(remainder as u8);
        }
        Width::Word => {
            let dividend =
                ((cpu.registers.dx.word() as u32) << 16) | cpu.registers.ax.word() as u32;
            let (quotient, remainder) = div_rem(dividend, divisor);
            if quotient > 0xFFFF {
                return Err(CpuFault::DivideError);
            }
            cpu.registers.ax.set_word(quotient as u16);
            cpu.registers.dx.set_word(remainder as u16);
        }
        Width::Dword => {
            let dividend =
                ((cpu.registers.dx.dword() as u64) << 32) | cpu.registers.ax.dword() as u64;
            let (quotient, remainder) = div_rem(dividend, divisor as u64);
            if quotient > u32::MAX as u64 {
                return Err(CpuFault::DivideError);
            }
            cpu.registers.ax.set_dword(quotient as u32);
            cpu.registers.dx.set_dword(remainder as u32);
        }
    }
    Ok(Flow::Next)
}

pub(super) fn idiv(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let width = cpu.op_width(di)?;
    let divisor = sign_extend(cpu.read_operand(di, 0, width)?, width);
    match width {
        Width::Byte => {
            let dividend = cpu.registers.ax.word() as i16 as i64;
            let quotient = dividend.checked_div(divisor).ok_or(CpuFault::DivideError)?;
            if quotient < i8::MIN as i64 || quotient > i8::MAX as i64 {
                return Err(CpuFault::DivideError);
            }
            cpu.registers.ax.set_low(quotient as u8);
            cpu.registers.ax.set_high((dividend % divisor) as u8);
        }
        Width::Word => {
            let dividend = (((cpu.registers.dx.word() as u32) << 16)
                | cpu.registers.ax.word() as u32) as i32 as i64;
            let quotient = dividend.checked_div(divisor).ok_or(CpuFault::DivideError)?;
            if quotient < i16::MIN as i64 || quotient > i16::MAX as i64 {
                return Err(CpuFault::DivideError);
            }
            cpu.registers.ax.set_word(quotient as u16);
            cpu.registers.dx.set_word((dividend % divisor) as u16);
        }
        Width::Dword => {
            let dividend = (((cpu.registers.dx.dword() as u64) << 32)
                | cpu.registers.ax.dword() as u64) as i64;
            let quotient = dividend.checked_div(divisor).ok_or(CpuFault::DivideError)?;
            if quotient < i32::MIN as i64 || quotient > i32::MAX as i64 {
                return Err(CpuFault::DivideError);
            }
            cpu.registers.ax.set_dword(quotient as u32);
            cpu.registers.dx.set_dword((dividend % divisor) as u32);
        }
    }
    Ok(Flow::Next)
}

pub(super) fn daa(cpu: &mut CpuCore) -> Result<Flow, CpuFault> {
    let old_al = cpu.registers.ax.low();
    let old_cf = cpu.registers.check_flag(CpuFlag::Carry);
    let mut al = old_al;
    if (old_al & 0x0F) > 9 || cpu.registers.check_flag(CpuFlag::AuxCarry) {
        al = al.wrapping_add(6);
        cpu.registers.set_flag(CpuFlag::AuxCarry);
    } else {
        cpu.registers.unset_flag(CpuFlag::AuxCarry);
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_add(0x60);
        cpu.registers.set_flag(CpuFlag::Carry);
    } else {
        cpu.registers.unset_flag(CpuFlag::Carry);
    }
    cpu.registers.ax.set_low(al);
    update_szp(cpu, al);
    Ok(Flow::Next)
}

pub(super) fn das(cpu: &mut CpuCore) -> Result<Flow, CpuFault> {
    let old_al = cpu.registers.ax.low();
    let old_cf = cpu.registers.check_flag(CpuFlag::Carry);
    let mut al = old_al;
    if (old_al & 0x0F) > 9 || cpu.registers.check_flag(CpuFlag::AuxCarry) {
        al = al.wrapping_sub(6);
        cpu.registers.set_flag(CpuFlag::AuxCarry);
    } else {
        cpu.registers.unset_flag(CpuFlag::AuxCarry);
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_sub(0x60);
        cpu.registers.set_flag(CpuFlag::Carry);
    } else {
        cpu.registers.unset_flag(CpuFlag::Carry);
    }
    cpu.registers.ax.set_low(al);
    update_szp(cpu, al);
    Ok(Flow::Next)
}

pub(super) fn aaa(cpu: &mut CpuCore) -> Result<Flow, CpuFault> {
    let al = cpu.registers.ax.low();
    if (al & 0x0F) >= 0xA || cpu.registers.check_flag(CpuFlag::AuxCarry) {
        cpu.registers.ax.set_low(al.wrapping_add(6));
        let ah = cpu.registers.ax.high();
        cpu.registers.ax.set_high(ah.wrapping_add(1));
        cpu.registers.set_flag(CpuFlag::AuxCarry);
        cpu.registers.set_flag(CpuFlag::Carry);
    } else {
        cpu.registers.unset_flag(CpuFlag::AuxCarry);
        cpu.registers.unset_flag(CpuFlag::Carry);
    }
    // Re-read AL after adjustment, then mask the low nibble.
    let new_al = cpu.registers.ax.low() & 0x0F;
    cpu.registers.ax.set_low(new_al);
    Ok(Flow::Next)
}

pub(super) fn aas(cpu: &mut CpuCore) -> Result<Flow, CpuFault> {
    let al = cpu.registers.ax.low();
    if (al & 0x0F) >= 0xA || cpu.registers.check_flag(CpuFlag::AuxCarry) {
        cpu.registers.ax.set_low(al.wrapping_sub(6));
        let ah = cpu.registers.ax.high();
        cpu.registers.ax.set_high(ah.wrapping_sub(1));
        cpu.registers.set_flag(CpuFlag::AuxCarry);
        cpu.registers.set_flag(CpuFlag::Carry);
    } else {
        cpu.registers.unset_flag(CpuFlag::AuxCarry);
        cpu.registers.unset_flag(CpuFlag::Carry);
    }
    let new_al = cpu.registers.ax.low() & 0x0F;
    cpu.registers.ax.set_low(new_al);
    Ok(Flow::Next)
}

pub(super) fn aam(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let factor = di.instruction.immediate8();
    if factor == 0 {
        // The stacked FLAGS of the real fault reflect a zero result.
        cpu.registers.update_flag(CpuFlag::Zero, true);
        cpu.registers.update_flag(CpuFlag::Sign, false);
        cpu.registers.update_flag(CpuFlag::Parity, true);
        return Err(CpuFault::DivideError);
    }
    let (ah, al) = div_rem(cpu.registers.ax.low(), factor);
    cpu.registers.ax.set_high(ah);
    cpu.registers.ax.set_low(al);
    update_szp(cpu, al);
    Ok(Flow::Next)
}

pub(super) fn aad(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let factor = di.instruction.immediate8();
    let al = cpu
        .registers
        .ax
        .low()
        .wrapping_add(cpu.registers.ax.high().wrapping_mul(factor));
    cpu.registers.ax.set_low(al);
    cpu.registers.ax.set_high(0);
    update_szp(cpu, al);
    Ok(Flow::Next)
}
