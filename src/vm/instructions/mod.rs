mod alu;
mod bits;
mod control;
mod data;
mod shift;
mod string;
mod x87;

#[cfg(test)]
mod tests;

use iced_x86::Mnemonic;

use crate::errors::CpuFault;
use crate::vm::cpu::CpuCore;
use crate::vm::decoder::DecodedInstruction;
use crate::vm::flags::Width;

/// How the retired instruction affects IP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Advance IP by the instruction length.
    Next,
    /// Control-flow semantics already set CS:IP.
    Branch,
    /// Suspend the execution unit.
    Halt,
}

/// Mnemonic dispatch. Every supported mnemonic routes into its family
/// module; anything else is an explicit fault rather than silent behavior.
pub(crate) fn execute(cpu: &mut CpuCore, di: &DecodedInstruction) -> Result<Flow, CpuFault> {
    use Mnemonic::*;

    let mnemonic = di.instruction.mnemonic();
    match mnemonic {
        // Data movement
        Mov => data::mov(cpu, di),
        Movzx => data::movzx(cpu, di),
        Movsx => data::movsx(cpu, di),
        Xchg => data::xchg(cpu, di),
        Lea => data::lea(cpu, di),
        Lds | Les => data::load_far_pointer(cpu, di),
        Push => data::push(cpu, di),
        Pop => data::pop(cpu, di),
        Pushf => data::pushf(cpu),
        Popf => data::popf(cpu),
        Pusha => data::pusha(cpu),
        Popa => data::popa(cpu),
        Cbw => data::cbw(cpu),
        Cwd => data::cwd(cpu),
        Cwde => data::cwde(cpu),
        Cdq => data::cdq(cpu),
        Xlatb => data::xlat(cpu, di),
        Salc => data::salc(cpu),
        Lahf => data::lahf(cpu),
        Sahf => data::sahf(cpu),
        Enter => data::enter(cpu, di),
        Leave => data::leave(cpu),

        // Arithmetic and logic
        Add | Adc | Sub | Sbb | Cmp | And | Or | Xor | Test => alu::binop(cpu, di),
        Inc | Dec => alu::inc_dec(cpu, di),
        Neg => alu::neg(cpu, di),
        Not => alu::not(cpu, di),
        Mul => alu::mul(cpu, di),
        Imul => alu::imul(cpu, di),
        Div => alu::div(cpu, di),
        Idiv => alu::idiv(cpu, di),
        Daa => alu::daa(cpu),
        Das => alu::das(cpu),
        Aaa => alu::aaa(cpu),
        Aas => alu::aas(cpu),
        Aam => alu::aam(cpu, di),
        Aad => alu::aad(cpu, di),

        // Shifts and rotates
        Shl | Shr | Sar | Rol | Ror => shift::shift_rotate(cpu, di),
        Rcl | Rcr => shift::rotate_through_carry(cpu, di),

        // String operations
        Movsb => string::movs(cpu, di, Width::Byte),
        Movsw => string::movs(cpu, di, Width::Word),
        Movsd => string::movs(cpu, di, Width::Dword),
        Cmpsb => string::cmps(cpu, di, Width::Byte),
        Cmpsw => string::cmps(cpu, di, Width::Word),
        Cmpsd => string::cmps(cpu, di, Width::Dword),
        Scasb => string::scas(cpu, di, Width::Byte),
        Scasw => string::scas(cpu, di, Width::Word),
        Scasd => string::scas(cpu, di, Width::Dword),
        Lodsb => string::lods(cpu, di, Width::Byte),
        Lodsw => string::lods(cpu, di, Width::Word),
        Lodsd => string::lods(cpu, di, Width::Dword),
        Stosb => string::stos(cpu, di, Width::Byte),
        Stosw => string::stos(cpu, di, Width::Word),
        Stosd => string::stos(cpu, di, Width::Dword),

        // Control transfer
        Jmp => control::jmp(cpu, di),
        Ja | Jae | Jb | Jbe | Je | Jne | Jg | Jge | Jl | Jle | Jo | Jno | Jp | Jnp | Js
        | Jns => control::jcc(cpu, di),
        Jcxz | Jecxz => control::jcxz(cpu, di),
        Loop => control::loop_cx(cpu, di, None),
        Loope => control::loop_cx(cpu, di, Some(true)),
        Loopne => control::loop_cx(cpu, di, Some(false)),
        Call => control::call(cpu, di),
        Ret => control::ret_near(cpu, di),
        Retf => control::ret_far(cpu, di),
        Int => control::int_n(cpu, di),
        Int3 => control::int_vector(cpu, 3),
        Into => control::into(cpu),
        Iret => control::iret(cpu),
        Hlt => Ok(Flow::Halt),

        // Flag control
        Clc | Stc | Cmc | Cld | Std | Cli | Sti => control::flag_instruction(cpu, mnemonic),

        // Bit operations
        Bt | Bts | Btr | Btc => bits::bit_test(cpu, di),
        Bsf => bits::bsf(cpu, di),
        Bsr => bits::bsr(cpu, di),

        Nop | Wait => Ok(Flow::Next),

        m if x87::handles(m) => x87::execute(cpu, di),

        m => Err(CpuFault::UnsupportedMnemonic(m)),
    }
}
