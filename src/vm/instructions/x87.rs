use iced_x86::{MemorySize, Mnemonic, OpKind, Register as Reg};

use crate::errors::{CpuFault, FpuExceptionKind};
use crate::vm::cpu::{operand_shape_fault, CpuCore};
use crate::vm::decoder::DecodedInstruction;
use crate::vm::fpu::{f32_bits_to_f64, f64_to_f32_bits, f64_to_f80, f80_to_f64};
use crate::vm::memory::FarPtr;

use super::Flow;

pub(super) fn handles(m: Mnemonic) -> bool {
    matches!(
        m,
        Mnemonic::Fld
            | Mnemonic::Fst
            | Mnemonic::Fstp
            | Mnemonic::Fild
            | Mnemonic::Fist
            | Mnemonic::Fistp
            | Mnemonic::Fadd
            | Mnemonic::Faddp
            | Mnemonic::Fsub
            | Mnemonic::Fsubp
            | Mnemonic::Fsubr
            | Mnemonic::Fsubrp
            | Mnemonic::Fmul
            | Mnemonic::Fmulp
            | Mnemonic::Fdiv
            | Mnemonic::Fdivp
            | Mnemonic::Fdivr
            | Mnemonic::Fdivrp
            | Mnemonic::Fabs
            | Mnemonic::Fchs
            | Mnemonic::Fsqrt
            | Mnemonic::Fscale
            | Mnemonic::Fprem
            | Mnemonic::Frndint
            | Mnemonic::Fxch
            | Mnemonic::Fxam
            | Mnemonic::Ftst
            | Mnemonic::Fcom
            | Mnemonic::Fcomp
            | Mnemonic::Fcompp
            | Mnemonic::Fucom
            | Mnemonic::Fucomp
            | Mnemonic::Fucompp
            | Mnemonic::Fsin
            | Mnemonic::Fcos
            | Mnemonic::Fsincos
            | Mnemonic::Fptan
            | Mnemonic::Fpatan
            | Mnemonic::F2xm1
            | Mnemonic::Fyl2x
            | Mnemonic::Fldcw
            | Mnemonic::Fnstcw
            | Mnemonic::Fnstsw
            | Mnemonic::Fldz
            | Mnemonic::Fld1
            | Mnemonic::Fldpi
            | Mnemonic::Fldl2t
            | Mnemonic::Fldl2e
            | Mnemonic::Fldlg2
            | Mnemonic::Fldln2
            | Mnemonic::Fninit
            | Mnemonic::Fnclex
            | Mnemonic::Ffree
            | Mnemonic::Fincstp
            | Mnemonic::Fdecstp
    )
}

fn fpu_err(kind: FpuExceptionKind) -> CpuFault {
    CpuFault::FpuException(kind)
}

fn st_index(reg: Reg) -> Option<usize> {
    Some(match reg {
        Reg::ST0 => 0,
        Reg::ST1 => 1,
        Reg::ST2 => 2,
        Reg::ST3 => 3,
        Reg::ST4 => 4,
        Reg::ST5 => 5,
        Reg::ST6 => 6,
        Reg::ST7 => 7,
        _ => return None,
    })
}

/// ST index of the last register operand, defaulting to ST(1) for the
/// no-operand encodings.
fn last_st_operand(di: &DecodedInstruction) -> Result<usize, CpuFault> {
    let instr = &di.instruction;
    if instr.op_count() == 0 {
        return Ok(1);
    }
    let reg = instr.op_register(instr.op_count() - 1);
    st_index(reg).ok_or_else(|| operand_shape_fault(di))
}

fn read_f64_at(cpu: &CpuCore, ptr: FarPtr) -> Result<f64, CpuFault> {
    let memory = cpu.memory().borrow();
    let lo = memory.get_dword(ptr.segment, ptr.offset)? as u64;
    let hi = memory.get_dword(ptr.segment, ptr.offset.wrapping_add(4))? as u64;
    Ok(f64::from_bits((hi << 32) | lo))
}

fn write_f64_at(cpu: &CpuCore, ptr: FarPtr, v: f64) -> Result<(), CpuFault> {
    let bits = v.to_bits();
    let mut memory = cpu.memory().borrow_mut();
    memory.set_dword(ptr.segment, ptr.offset, bits as u32)?;
    memory.set_dword(ptr.segment, ptr.offset.wrapping_add(4), (bits >> 32) as u32)
}

/// Read the instruction's floating-point memory operand, widening to f64.
fn float_operand(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<f64, CpuFault> {
    let ea = cpu.effective_address(di)?;
    match di.instruction.memory_size() {
        MemorySize::Float32 => {
            let bits = cpu.memory().borrow().get_dword(ea.segment, ea.offset)?;
            Ok(f32_bits_to_f64(bits))
        }
        MemorySize::Float64 => read_f64_at(cpu, ea),
        MemorySize::Float80 => {
            let mut bytes = [0u8; 10];
            let memory = cpu.memory().borrow();
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = memory.get_byte(ea.segment, ea.offset.wrapping_add(i as u16))?;
            }
            Ok(f80_to_f64(bytes))
        }
        _ => Err(operand_shape_fault(di)),
    }
}

/// Store to the instruction's floating-point memory operand, narrowing per
/// the current rounding mode where the format requires it.
fn store_float(cpu: &mut CpuCore, di: &DecodedInstruction, v: f64) -> Result<(), CpuFault> {
    let ea = cpu.effective_address(di)?;
    match di.instruction.memory_size() {
        MemorySize::Float32 => {
            let bits = f64_to_f32_bits(v, cpu.registers.fpu.rounding());
            cpu.memory().borrow_mut().set_dword(ea.segment, ea.offset, bits)
        }
        MemorySize::Float64 => write_f64_at(cpu, ea, v),
        MemorySize::Float80 => {
            let bytes = f64_to_f80(v);
            cpu.memory().borrow_mut().set_array(ea.segment, ea.offset, &bytes)
        }
        _ => Err(operand_shape_fault(di)),
    }
}

fn integer_range(di: &DecodedInstruction) -> Result<(i64, i64), CpuFault> {
    match di.instruction.memory_size() {
        MemorySize::Int16 => Ok((i16::MIN as i64, i16::MAX as i64)),
        MemorySize::Int32 => Ok((i32::MIN as i64, i32::MAX as i64)),
        MemorySize::Int64 => Ok((i64::MIN, i64::MAX)),
        _ => Err(operand_shape_fault(di)),
    }
}

fn arith_fn(m: Mnemonic) -> fn(f64, f64) -> f64 {
    match m {
        Mnemonic::Fadd | Mnemonic::Faddp => |a, b| a + b,
        Mnemonic::Fsub | Mnemonic::Fsubp => |a, b| a - b,
        Mnemonic::Fsubr | Mnemonic::Fsubrp => |a, b| b - a,
        Mnemonic::Fmul | Mnemonic::Fmulp => |a, b| a * b,
        Mnemonic::Fdiv | Mnemonic::Fdivp => |a, b| a / b,
        Mnemonic::Fdivr | Mnemonic::Fdivrp => |a, b| b / a,
        _ => unreachable!(),
    }
}

pub(super) fn execute(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    let instr = &di.instruction;
    let mnemonic = instr.mnemonic();
    match mnemonic {
        Mnemonic::Fld => match instr.op0_kind() {
            OpKind::Memory => {
                let v = float_operand(cpu, di)?;
                cpu.registers.fpu.fld(v).map_err(fpu_err)?;
            }
            OpKind::Register => {
                let i = last_st_operand(di)?;
                cpu.registers.fpu.fld_st(i).map_err(fpu_err)?;
            }
            _ => return Err(operand_shape_fault(di)),
        },
        Mnemonic::Fst | Mnemonic::Fstp => {
            let pop = mnemonic == Mnemonic::Fstp;
            match instr.op0_kind() {
                OpKind::Memory => {
                    let v = if pop {
                        cpu.registers.fpu.fstp().map_err(fpu_err)?
                    } else {
                        cpu.registers.fpu.fst().map_err(fpu_err)?
                    };
                    store_float(cpu, di, v)?;
                }
                OpKind::Register => {
                    let i = last_st_operand(di)?;
                    if pop {
                        cpu.registers.fpu.fstp_st(i).map_err(fpu_err)?;
                    } else {
                        cpu.registers.fpu.fst_st(i).map_err(fpu_err)?;
                    }
                }
                _ => return Err(operand_shape_fault(di)),
            }
        }
        Mnemonic::Fild => {
            let ea = cpu.effective_address(di)?;
            let value = {
                let memory = cpu.memory().borrow();
                match instr.memory_size() {
                    MemorySize::Int16 => memory.get_word(ea.segment, ea.offset)? as i16 as i64,
                    MemorySize::Int32 => memory.get_dword(ea.segment, ea.offset)? as i32 as i64,
                    MemorySize::Int64 => {
                        let lo = memory.get_dword(ea.segment, ea.offset)? as u64;
                        let hi = memory.get_dword(ea.segment, ea.offset.wrapping_add(4))? as u64;
                        ((hi << 32) | lo) as i64
                    }
                    _ => return Err(operand_shape_fault(di)),
                }
            };
            cpu.registers.fpu.fild(value).map_err(fpu_err)?;
        }
        Mnemonic::Fist | Mnemonic::Fistp => {
            let (min, max) = integer_range(di)?;
            let value = if mnemonic == Mnemonic::Fistp {
                cpu.registers.fpu.fistp(min, max).map_err(fpu_err)?
            } else {
                cpu.registers.fpu.fist(min, max).map_err(fpu_err)?
            };
            let ea = cpu.effective_address(di)?;
            let mut memory = cpu.memory().borrow_mut();
            match instr.memory_size() {
                MemorySize::Int16 => memory.set_word(ea.segment, ea.offset, value as u16)?,
                MemorySize::Int32 => memory.set_dword(ea.segment, ea.offset, value as u32)?,
                MemorySize::Int64 => {
                    memory.set_dword(ea.segment, ea.offset, value as u32)?;
                    memory.set_dword(
                        ea.segment,
                        ea.offset.wrapping_add(4),
                        ((value as u64) >> 32) as u32,
                    )?;
                }
                _ => return Err(operand_shape_fault(di)),
            }
        }
        Mnemonic::Fadd
        | Mnemonic::Fsub
        | Mnemonic::Fsubr
        | Mnemonic::Fmul
        | Mnemonic::Fdiv
        | Mnemonic::Fdivr => match instr.op0_kind() {
            OpKind::Memory => {
                let v = float_operand(cpu, di)?;
                let fpu = &mut cpu.registers.fpu;
                match mnemonic {
                    Mnemonic::Fadd => fpu.fadd(v),
                    Mnemonic::Fsub => fpu.fsub(v),
                    Mnemonic::Fsubr => fpu.fsubr(v),
                    Mnemonic::Fmul => fpu.fmul(v),
                    Mnemonic::Fdiv => fpu.fdiv(v),
                    _ => fpu.fdivr(v),
                }
                .map_err(fpu_err)?;
            }
            OpKind::Register => {
                let dst = st_index(instr.op0_register()).ok_or_else(|| operand_shape_fault(di))?;
                let src = if instr.op_count() > 1 {
                    st_index(instr.op1_register()).ok_or_else(|| operand_shape_fault(di))?
                } else {
                    0
                };
                cpu.registers
                    .fpu
                    .binop_st(dst, src, arith_fn(mnemonic))
                    .map_err(fpu_err)?;
            }
            _ => return Err(operand_shape_fault(di)),
        },
        Mnemonic::Faddp
        | Mnemonic::Fsubp
        | Mnemonic::Fsubrp
        | Mnemonic::Fmulp
        | Mnemonic::Fdivp
        | Mnemonic::Fdivrp => {
            let dst = if instr.op_count() == 0 {
                1
            } else {
                st_index(instr.op0_register()).ok_or_else(|| operand_shape_fault(di))?
            };
            cpu.registers
                .fpu
                .binop_pop(dst, arith_fn(mnemonic))
                .map_err(fpu_err)?;
        }
        Mnemonic::Fabs => cpu.registers.fpu.fabs().map_err(fpu_err)?,
        Mnemonic::Fchs => cpu.registers.fpu.fchs().map_err(fpu_err)?,
        Mnemonic::Fsqrt => cpu.registers.fpu.fsqrt().map_err(fpu_err)?,
        Mnemonic::Fscale => cpu.registers.fpu.fscale().map_err(fpu_err)?,
        Mnemonic::Fprem => cpu.registers.fpu.fprem().map_err(fpu_err)?,
        Mnemonic::Frndint => cpu.registers.fpu.frndint().map_err(fpu_err)?,
        Mnemonic::Fxch => {
            let i = last_st_operand(di)?;
            cpu.registers.fpu.fxch(i).map_err(fpu_err)?;
        }
        Mnemonic::Fxam => cpu.registers.fpu.fxam(),
        Mnemonic::Ftst => cpu.registers.fpu.ftst().map_err(fpu_err)?,
        Mnemonic::Fcom | Mnemonic::Fcomp => {
            match instr.op0_kind() {
                OpKind::Memory => {
                    let v = float_operand(cpu, di)?;
                    cpu.registers.fpu.fcom(v).map_err(fpu_err)?;
                }
                OpKind::Register => {
                    let i = last_st_operand(di)?;
                    cpu.registers.fpu.fcom_st(i).map_err(fpu_err)?;
                }
                _ => {
                    // The no-operand encoding compares against ST(1).
                    cpu.registers.fpu.fcom_st(1).map_err(fpu_err)?;
                }
            }
            if mnemonic == Mnemonic::Fcomp {
                cpu.registers.fpu.pop_discard().map_err(fpu_err)?;
            }
        }
        Mnemonic::Fcompp => {
            cpu.registers.fpu.fcom_st(1).map_err(fpu_err)?;
            cpu.registers.fpu.pop_discard().map_err(fpu_err)?;
            cpu.registers.fpu.pop_discard().map_err(fpu_err)?;
        }
        Mnemonic::Fucom | Mnemonic::Fucomp => {
            let i = last_st_operand(di)?;
            cpu.registers.fpu.fucom_st(i).map_err(fpu_err)?;
            if mnemonic == Mnemonic::Fucomp {
                cpu.registers.fpu.pop_discard().map_err(fpu_err)?;
            }
        }
        Mnemonic::Fucompp => {
            cpu.registers.fpu.fucom_st(1).map_err(fpu_err)?;
            cpu.registers.fpu.pop_discard().map_err(fpu_err)?;
            cpu.registers.fpu.pop_discard().map_err(fpu_err)?;
        }
        Mnemonic::Fsin => cpu.registers.fpu.fsin().map_err(fpu_err)?,
        Mnemonic::Fcos => cpu.registers.fpu.fcos().map_err(fpu_err)?,
        Mnemonic::Fsincos => cpu.registers.fpu.fsincos().map_err(fpu_err)?,
        Mnemonic::Fptan => cpu.registers.fpu.fptan().map_err(fpu_err)?,
        Mnemonic::Fpatan => cpu.registers.fpu.fpatan().map_err(fpu_err)?,
        Mnemonic::F2xm1 => cpu.registers.fpu.f2xm1().map_err(fpu_err)?,
        Mnemonic::Fyl2x => cpu.registers.fpu.fyl2x().map_err(fpu_err)?,
        Mnemonic::Fldcw => {
            let ea = cpu.effective_address(di)?;
            let cw = cpu.memory().borrow().get_word(ea.segment, ea.offset)?;
            cpu.registers.fpu.fldcw(cw);
        }
        Mnemonic::Fnstcw => {
            let ea = cpu.effective_address(di)?;
            let cw = cpu.registers.fpu.fnstcw();
            cpu.memory().borrow_mut().set_word(ea.segment, ea.offset, cw)?;
        }
        Mnemonic::Fnstsw => {
            let sw = cpu.registers.fpu.fnstsw();
            if instr.op0_kind() == OpKind::Memory {
                let ea = cpu.effective_address(di)?;
                cpu.memory().borrow_mut().set_word(ea.segment, ea.offset, sw)?;
            } else {
                cpu.registers.ax.set_word(sw);
            }
        }
        Mnemonic::Fldz => cpu.registers.fpu.fld(0.0).map_err(fpu_err)?,
        Mnemonic::Fld1 => cpu.registers.fpu.fld(1.0).map_err(fpu_err)?,
        Mnemonic::Fldpi => cpu.registers.fpu.fld(std::f64::consts::PI).map_err(fpu_err)?,
        Mnemonic::Fldl2t => cpu
            .registers
            .fpu
            .fld(std::f64::consts::LOG2_10)
            .map_err(fpu_err)?,
        Mnemonic::Fldl2e => cpu
            .registers
            .fpu
            .fld(std::f64::consts::LOG2_E)
            .map_err(fpu_err)?,
        Mnemonic::Fldlg2 => cpu
            .registers
            .fpu
            .fld(std::f64::consts::LOG10_2)
            .map_err(fpu_err)?,
        Mnemonic::Fldln2 => cpu.registers.fpu.fld(std::f64::consts::LN_2).map_err(fpu_err)?,
        Mnemonic::Fninit => cpu.registers.fpu.fninit(),
        Mnemonic::Fnclex => cpu.registers.fpu.fnclex(),
        Mnemonic::Ffree => {
            let i = last_st_operand(di)?;
            cpu.registers.fpu.ffree(i);
        }
        Mnemonic::Fincstp => cpu.registers.fpu.fincstp(),
        Mnemonic::Fdecstp => cpu.registers.fpu.fdecstp(),
        m => return Err(CpuFault::UnsupportedMnemonic(m)),
    }
    Ok(Flow::Next)
}
