use iced_x86::{Mnemonic, OpKind};

use crate::errors::CpuFault;
use crate::vm::cpu::CpuCore;
use crate::vm::decoder::DecodedInstruction;
use crate::vm::registers::CpuFlag;

use super::Flow;

/// BT/BTS/BTR/BTC. Register destinations take the bit index modulo the
/// operand width; memory destinations with a register index address the full
/// bit string, word-stepping the effective address.
pub(super) fn bit_test(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let width = cpu.op_width(di)?;
    let bits = width.bits() as i32;
    let raw_index = cpu.read_operand(di, 1, width)?;
    let mnemonic = di.instruction.mnemonic();

    let (value, bit, writeback_mem) = if di.instruction.op0_kind() == OpKind::Memory
        && di.instruction.op1_kind() == OpKind::Register
    {
        let shift = 64 - width.bits();
        let index = (((raw_index as u64) << shift) as i64 >> shift) as i32;
        let unit = index.div_euclid(bits);
        let bit = index.rem_euclid(bits) as u32;
        let mut ea = cpu.effective_address(di)?;
        ea.offset = ea
            .offset
            .wrapping_add((unit * width.bytes() as i32) as u16);
        let value = cpu.read_memory(width, ea)?;
        (value, bit, Some(ea))
    } else {
        let bit = raw_index % width.bits();
        let value = cpu.read_operand(di, 0, width)?;
        (value, bit, None)
    };

    let carry = (value >> bit) & 1 != 0;
    cpu.registers.update_flag(CpuFlag::Carry, carry);

    let updated = match mnemonic {
        Mnemonic::Bt => None,
        Mnemonic::Bts => Some(value | (1 << bit)),
        Mnemonic::Btr => Some(value & !(1 << bit)),
        Mnemonic::Btc => Some(value ^ (1 << bit)),
        _ => unreachable!(),
    };
    if let Some(updated) = updated {
        match writeback_mem {
            Some(ea) => cpu.write_memory(width, ea, updated & width.mask())?,
            None => cpu.write_operand(di, 0, width, updated & width.mask())?,
        }
    }
    Ok(Flow::Next)
}

pub(super) fn bsf(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let width = cpu.op_width(di)?;
    let source = cpu.read_operand(di, 1, width)? & width.mask();
    if source == 0 {
        cpu.registers.set_flag(CpuFlag::Zero);
    } else {
        cpu.registers.unset_flag(CpuFlag::Zero);
        cpu.write_operand(di, 0, width, source.trailing_zeros())?;
    }
    Ok(Flow::Next)
}

pub(super) fn bsr(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let width = cpu.op_width(di)?;
    let source = cpu.read_operand(di, 1, width)? & width.mask();
    if source == 0 {
        cpu.registers.set_flag(CpuFlag::Zero);
    } else {
        cpu.registers.unset_flag(CpuFlag::Zero);
        cpu.write_operand(di, 0, width, 31 - source.leading_zeros())?;
    }
    Ok(Flow::Next)
}
