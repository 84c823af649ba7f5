use iced_x86::Mnemonic;

use crate::errors::CpuFault;
use crate::utils::number::CarryRotate;
use crate::vm::cpu::CpuCore;
use crate::vm::decoder::DecodedInstruction;
use crate::vm::flags::{self, FlagOp, Width};
use crate::vm::registers::CpuFlag;

use super::Flow;

/// Shift counts are masked to 5 bits (80186+ semantics the emulated target
/// exhibits); a resulting count of zero leaves the flags untouched.
const COUNT_MASK: u32 = 0x1F;

pub(super) fn shift_rotate(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let width = cpu.op_width(di)?;
    let value = cpu.read_operand(di, 0, width)?;
    let count = cpu.read_operand(di, 1, Width::Byte)? & COUNT_MASK;
    if count == 0 {
        return Ok(Flow::Next);
    }
    let bits = width.bits();
    let rot = count % bits;
    let (op, result) = match di.instruction.mnemonic() {
        Mnemonic::Shl => (FlagOp::Shl, value.wrapping_shl(count)),
        Mnemonic::Shr => (
            FlagOp::Shr,
            if count >= bits { 0 } else { (value & width.mask()) >> count },
        ),
        Mnemonic::Sar => {
            let shift = count.min(bits - 1);
            let extended = ((value << (32 - bits)) as i32) >> (32 - bits);
            (FlagOp::Sar, (extended >> shift) as u32)
        }
        Mnemonic::Rol => (
            FlagOp::Rol,
            if rot == 0 {
                value
            } else {
                (value << rot) | ((value & width.mask()) >> (bits - rot))
            },
        ),
        Mnemonic::Ror => (
            FlagOp::Ror,
            if rot == 0 {
                value
            } else {
                ((value & width.mask()) >> rot) | (value << (bits - rot))
            },
        ),
        _ => unreachable!(),
    };
    cpu.write_operand(di, 0, width, result & width.mask())?;
    flags::evaluate(&mut cpu.registers, op, width, value, count, result);
    Ok(Flow::Next)
}

pub(super) fn rotate_through_carry(
    cpu: &mut CpuCore,
    di: &DecodedInstruction,
) -> Result<Flow, CpuFault> {
    let width = cpu.op_width(di)?;
    let value = cpu.read_operand(di, 0, width)?;
    let count = cpu.read_operand(di, 1, Width::Byte)? & COUNT_MASK;
    if count == 0 {
        return Ok(Flow::Next);
    }
    let carry_in = cpu.registers.check_flag(CpuFlag::Carry);
    let left = di.instruction.mnemonic() == Mnemonic::Rcl;
    let (result, carry) = match width {
        Width::Byte => {
            let v = value as u8;
            let (r, c) = if left {
                v.rotate_carry_left(count, carry_in)
            } else {
                v.rotate_carry_right(count, carry_in)
            };
            (r as u32, c)
        }
        Width::Word => {
            let v = value as u16;
            let (r, c) = if left {
                v.rotate_carry_left(count, carry_in)
            } else {
                v.rotate_carry_right(count, carry_in)
            };
            (r as u32, c)
        }
        Width::Dword => {
            if left {
                value.rotate_carry_left(count, carry_in)
            } else {
                value.rotate_carry_right(count, carry_in)
            }
        }
    };
    cpu.write_operand(di, 0, width, result & width.mask())?;
    cpu.registers.update_flag(CpuFlag::Carry, carry);
    if count == 1 {
        let msb = result & width.sign_bit() != 0;
        let overflow = if left {
            msb != carry
        } else {
            msb != (result & (width.sign_bit() >> 1) != 0)
        };
        cpu.registers.update_flag(CpuFlag::Overflow, overflow);
    }
    Ok(Flow::Next)
}
