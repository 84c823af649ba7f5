use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::vm::registers::{CpuFlag, CpuRegisters};

/// Operand width of the instruction whose flags are being evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Width {
    Byte = 1,
    Word = 2,
    Dword = 4,
}

impl Width {
    #[inline]
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        FromPrimitive::from_usize(bytes)
    }

    #[inline]
    pub fn bytes(self) -> u32 {
        self as u32
    }

    #[inline]
    pub fn bits(self) -> u32 {
        self.bytes() * 8
    }

    #[inline]
    pub fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
            Width::Dword => 0xFFFF_FFFF,
        }
    }

    #[inline]
    pub fn sign_bit(self) -> u32 {
        1 << (self.bits() - 1)
    }
}

/// Operation class driving CF/PF/AF/ZF/SF/OF evaluation. Closed union: an
/// instruction that needs a rule not covered here gets its own variant, never
/// an ad-hoc flag write at the call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagOp {
    Add,
    Adc,
    Sub,
    Sbb,
    And,
    Or,
    Xor,
    Neg,
    Inc,
    Dec,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    Mul,
    IMul,
    Div,
    IDiv,
    Test,
    Cmp,
    Logic,
}

#[inline]
fn parity_even(value: u32) -> bool {
    (value as u8).count_ones() & 1 == 0
}

#[inline]
fn sign(width: Width, value: u32) -> bool {
    value & width.sign_bit() != 0
}

fn update_szp(regs: &mut CpuRegisters, width: Width, masked: u32) {
    regs.update_flag(CpuFlag::Zero, masked == 0);
    regs.update_flag(CpuFlag::Sign, sign(width, masked));
    regs.update_flag(CpuFlag::Parity, parity_even(masked));
}

/// Evaluate the arithmetic flags for `result = op(a, b)` at `width`.
///
/// Conventions the call sites follow:
/// - `Adc`/`Sbb`: the carry/borrow-in is recovered from `a`, `b` and
///   `result`, so callers pass the same operands they computed with.
/// - `Neg`: `b` is the negated operand (`result = 0 - b`).
/// - Shifts and rotates: `b` is the masked shift count; a count of zero
///   leaves every flag untouched.
/// - `Mul`/`IMul`: `b` is the upper half of the double-width product and
///   `result` the lower half.
/// - `Div`/`IDiv` leave all flags undefined, which this core models as
///   "unchanged".
pub fn evaluate(regs: &mut CpuRegisters, op: FlagOp, width: Width, a: u32, b: u32, result: u32) {
    let mask = width.mask();
    let a = a & mask;
    let b = b & mask;
    let masked = result & mask;

    match op {
        FlagOp::Add => {
            regs.update_flag(CpuFlag::Carry, (a as u64) + (b as u64) > mask as u64);
            regs.update_flag(CpuFlag::AuxCarry, (a & 0xF) + (b & 0xF) > 0xF);
            regs.update_flag(
                CpuFlag::Overflow,
                sign(width, a) == sign(width, b) && sign(width, masked) != sign(width, a),
            );
            update_szp(regs, width, masked);
        }
        FlagOp::Adc => {
            // Carry-in is the residue the plain sum cannot explain.
            let cin = masked.wrapping_sub(a.wrapping_add(b)) & 1;
            regs.update_flag(
                CpuFlag::Carry,
                (a as u64) + (b as u64) + (cin as u64) > mask as u64,
            );
            regs.update_flag(CpuFlag::AuxCarry, (a & 0xF) + (b & 0xF) + cin > 0xF);
            regs.update_flag(
                CpuFlag::Overflow,
                sign(width, a) == sign(width, b) && sign(width, masked) != sign(width, a),
            );
            update_szp(regs, width, masked);
        }
        FlagOp::Sub | FlagOp::Cmp => {
            regs.update_flag(CpuFlag::Carry, a < b);
            regs.update_flag(CpuFlag::AuxCarry, (a & 0xF) < (b & 0xF));
            regs.update_flag(
                CpuFlag::Overflow,
                sign(width, a) != sign(width, b) && sign(width, masked) != sign(width, a),
            );
            update_szp(regs, width, masked);
        }
        FlagOp::Sbb => {
            let bin = a.wrapping_sub(b).wrapping_sub(masked) & 1;
            regs.update_flag(CpuFlag::Carry, (a as u64) < (b as u64) + (bin as u64));
            regs.update_flag(CpuFlag::AuxCarry, (a & 0xF) < (b & 0xF) + bin);
            regs.update_flag(
                CpuFlag::Overflow,
                sign(width, a) != sign(width, b) && sign(width, masked) != sign(width, a),
            );
            update_szp(regs, width, masked);
        }
        FlagOp::And | FlagOp::Or | FlagOp::Xor | FlagOp::Test | FlagOp::Logic => {
            regs.unset_flag(CpuFlag::Carry);
            regs.unset_flag(CpuFlag::Overflow);
            regs.unset_flag(CpuFlag::AuxCarry);
            update_szp(regs, width, masked);
        }
        FlagOp::Neg => {
            regs.update_flag(CpuFlag::Carry, b != 0);
            regs.update_flag(CpuFlag::AuxCarry, b & 0xF != 0);
            regs.update_flag(CpuFlag::Overflow, masked == width.sign_bit());
            update_szp(regs, width, masked);
        }
        FlagOp::Inc => {
            // CF survives INC.
            regs.update_flag(CpuFlag::AuxCarry, (a & 0xF) + 1 > 0xF);
            regs.update_flag(CpuFlag::Overflow, masked == width.sign_bit());
            update_szp(regs, width, masked);
        }
        FlagOp::Dec => {
            // CF survives DEC.
            regs.update_flag(CpuFlag::AuxCarry, a & 0xF == 0);
            regs.update_flag(CpuFlag::Overflow, a == width.sign_bit());
            update_szp(regs, width, masked);
        }
        FlagOp::Shl => {
            let count = b;
            if count == 0 {
                return;
            }
            let cf = count <= width.bits() && (a >> (width.bits() - count)) & 1 != 0;
            regs.update_flag(CpuFlag::Carry, cf);
            if count == 1 {
                regs.update_flag(CpuFlag::Overflow, sign(width, masked) != cf);
            }
            update_szp(regs, width, masked);
        }
        FlagOp::Shr => {
            let count = b;
            if count == 0 {
                return;
            }
            let cf = count <= width.bits() && (a >> (count - 1)) & 1 != 0;
            regs.update_flag(CpuFlag::Carry, cf);
            if count == 1 {
                regs.update_flag(CpuFlag::Overflow, sign(width, a));
            }
            update_szp(regs, width, masked);
        }
        FlagOp::Sar => {
            let count = b;
            if count == 0 {
                return;
            }
            let cf = if count <= width.bits() {
                (a >> (count - 1)) & 1 != 0
            } else {
                sign(width, a)
            };
            regs.update_flag(CpuFlag::Carry, cf);
            if count == 1 {
                regs.unset_flag(CpuFlag::Overflow);
            }
            update_szp(regs, width, masked);
        }
        FlagOp::Rol => {
            let count = b;
            if count == 0 {
                return;
            }
            let cf = masked & 1 != 0;
            regs.update_flag(CpuFlag::Carry, cf);
            if count == 1 {
                regs.update_flag(CpuFlag::Overflow, sign(width, masked) != cf);
            }
        }
        FlagOp::Ror => {
            let count = b;
            if count == 0 {
                return;
            }
            regs.update_flag(CpuFlag::Carry, sign(width, masked));
            if count == 1 {
                let top_two_differ =
                    sign(width, masked) != (masked & (width.sign_bit() >> 1) != 0);
                regs.update_flag(CpuFlag::Overflow, top_two_differ);
            }
        }
        FlagOp::Mul => {
            let upper_used = b != 0;
            regs.update_flag(CpuFlag::Carry, upper_used);
            regs.update_flag(CpuFlag::Overflow, upper_used);
            update_szp(regs, width, masked);
        }
        FlagOp::IMul => {
            let sign_fill = if sign(width, masked) { mask } else { 0 };
            let upper_used = b != sign_fill;
            regs.update_flag(CpuFlag::Carry, upper_used);
            regs.update_flag(CpuFlag::Overflow, upper_used);
            update_szp(regs, width, masked);
        }
        FlagOp::Div | FlagOp::IDiv => {}
    }
}
