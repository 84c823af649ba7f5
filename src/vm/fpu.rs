//! x87 FPU model.
//!
//! Eight-slot ring stack addressed through TOP, with control/status words and
//! per-register tags. Register contents are held as `f64`; real hardware uses
//! 80-bit extended precision, and the reduced precision is accepted for the
//! guest workloads this core hosts. 80-bit memory transfers encode and decode
//! the extended format explicitly, and NaN payloads survive 32/64-bit memory
//! round trips by bit manipulation instead of float casts.

use crate::errors::FpuExceptionKind;

pub type FpuResult<T> = Result<T, FpuExceptionKind>;

const FCW_DEFAULT: u16 = 0x037F;
const FCW_EXCEPTION_MASK: u16 = 0b11_1111;

const FSW_IE: u16 = 1 << 0;
const FSW_DE: u16 = 1 << 1;
const FSW_ZE: u16 = 1 << 2;
const FSW_OE: u16 = 1 << 3;
const FSW_UE: u16 = 1 << 4;
const FSW_PE: u16 = 1 << 5;
const FSW_SF: u16 = 1 << 6;
const FSW_ES: u16 = 1 << 7;
const FSW_C0: u16 = 1 << 8;
const FSW_C1: u16 = 1 << 9;
const FSW_C2: u16 = 1 << 10;
const FSW_TOP_MASK: u16 = 0b111 << 11;
const FSW_C3: u16 = 1 << 14;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Tag {
    Valid = 0b00,
    Zero = 0b01,
    Special = 0b10,
    Empty = 0b11,
}

impl Tag {
    fn from_f64(v: f64) -> Self {
        if v.is_nan() || v.is_infinite() {
            Tag::Special
        } else if v == 0.0 {
            Tag::Zero
        } else {
            Tag::Valid
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundingControl {
    NearestEven,
    Down,
    Up,
    TowardZero,
}

impl RoundingControl {
    fn from_fcw(fcw: u16) -> Self {
        match (fcw >> 10) & 0b11 {
            0b00 => RoundingControl::NearestEven,
            0b01 => RoundingControl::Down,
            0b10 => RoundingControl::Up,
            _ => RoundingControl::TowardZero,
        }
    }

    fn round(self, v: f64) -> f64 {
        match self {
            RoundingControl::NearestEven => v.round_ties_even(),
            RoundingControl::Down => v.floor(),
            RoundingControl::Up => v.ceil(),
            RoundingControl::TowardZero => v.trunc(),
        }
    }
}

/// The x87 register stack and word state, owned by the register file.
#[derive(Clone, Debug)]
pub struct Fpu {
    regs: [f64; 8],
    tags: [Tag; 8],
    top: u8,
    fcw: u16,
    fsw: u16,
}

impl Default for Fpu {
    fn default() -> Self {
        Self {
            regs: [0.0; 8],
            tags: [Tag::Empty; 8],
            top: 0,
            fcw: FCW_DEFAULT,
            fsw: 0,
        }
    }
}

impl Fpu {
    pub fn fninit(&mut self) {
        *self = Self::default();
    }

    pub fn control_word(&self) -> u16 {
        self.fcw
    }

    pub fn status_word(&self) -> u16 {
        self.fsw
    }

    pub fn tag_word(&self) -> u16 {
        let mut tw = 0u16;
        for (i, tag) in self.tags.iter().copied().enumerate() {
            tw |= (tag as u16) << (i * 2);
        }
        tw
    }

    pub fn top(&self) -> u8 {
        self.top
    }

    pub fn rounding(&self) -> RoundingControl {
        RoundingControl::from_fcw(self.fcw)
    }

    /// ST(i) if the slot holds a value.
    pub fn st(&self, i: usize) -> Option<f64> {
        let phys = self.phys_index(i);
        match self.tags[phys] {
            Tag::Empty => None,
            _ => Some(self.regs[phys]),
        }
    }

    pub fn fldcw(&mut self, cw: u16) {
        self.fcw = cw;
        self.sync_es();
    }

    pub fn fnstcw(&self) -> u16 {
        self.fcw
    }

    pub fn fnstsw(&self) -> u16 {
        self.fsw
    }

    pub fn fnclex(&mut self) {
        // Clear exception flags, stack fault, ES and busy; keep CCs and TOP.
        self.fsw &= 0x7F00;
    }

    // ---- loads ----------------------------------------------------------

    pub fn fld(&mut self, v: f64) -> FpuResult<()> {
        self.push(v)
    }

    pub fn fld_st(&mut self, i: usize) -> FpuResult<()> {
        let v = self.read_st(i)?;
        self.push(v)
    }

    pub fn fild(&mut self, v: i64) -> FpuResult<()> {
        self.push(v as f64)
    }

    // ---- stores ---------------------------------------------------------

    pub fn fst(&mut self) -> FpuResult<f64> {
        self.read_st(0)
    }

    pub fn fstp(&mut self) -> FpuResult<f64> {
        let v = self.read_st(0)?;
        self.pop()?;
        Ok(v)
    }

    pub fn fst_st(&mut self, i: usize) -> FpuResult<()> {
        let v = self.read_st(0)?;
        self.write_st(i, v)
    }

    pub fn fstp_st(&mut self, i: usize) -> FpuResult<()> {
        self.fst_st(i)?;
        self.pop()
    }

    /// Round ST(0) to an integer in `[min, max]` per the control word; an
    /// out-of-range or non-finite value stores the integer indefinite (`min`)
    /// and raises IE.
    pub fn fist(&mut self, min: i64, max: i64) -> FpuResult<i64> {
        let v = self.read_st(0)?;
        let rounded = self.rounding().round(v);
        if !rounded.is_finite() || rounded < min as f64 || rounded > max as f64 {
            self.signal(FSW_IE)?;
            return Ok(min);
        }
        Ok(rounded as i64)
    }

    pub fn fistp(&mut self, min: i64, max: i64) -> FpuResult<i64> {
        let v = self.fist(min, max)?;
        self.pop()?;
        Ok(v)
    }

    // ---- arithmetic -----------------------------------------------------

    pub fn fadd(&mut self, v: f64) -> FpuResult<()> {
        let st0 = self.read_st(0)?;
        self.write_st(0, st0 + v)
    }

    pub fn fsub(&mut self, v: f64) -> FpuResult<()> {
        let st0 = self.read_st(0)?;
        self.write_st(0, st0 - v)
    }

    pub fn fsubr(&mut self, v: f64) -> FpuResult<()> {
        let st0 = self.read_st(0)?;
        self.write_st(0, v - st0)
    }

    pub fn fmul(&mut self, v: f64) -> FpuResult<()> {
        let st0 = self.read_st(0)?;
        self.write_st(0, st0 * v)
    }

    pub fn fdiv(&mut self, v: f64) -> FpuResult<()> {
        let st0 = self.read_st(0)?;
        if v == 0.0 && st0.is_finite() && st0 != 0.0 {
            self.signal(FSW_ZE)?;
        }
        self.write_st(0, st0 / v)
    }

    pub fn fdivr(&mut self, v: f64) -> FpuResult<()> {
        let st0 = self.read_st(0)?;
        if st0 == 0.0 && v.is_finite() && v != 0.0 {
            self.signal(FSW_ZE)?;
        }
        self.write_st(0, v / st0)
    }

    /// Two-register form: `ST(dst) <- op(ST(dst), ST(src))`, with the operand
    /// order of the non-reversed instruction being `ST(0) op ST(i)` when the
    /// destination is ST(0).
    pub fn binop_st(
        &mut self,
        dst: usize,
        src: usize,
        op: fn(f64, f64) -> f64,
    ) -> FpuResult<()> {
        let a = self.read_st(dst)?;
        let b = self.read_st(src)?;
        self.write_st(dst, op(a, b))
    }

    pub fn binop_pop(&mut self, dst: usize, op: fn(f64, f64) -> f64) -> FpuResult<()> {
        let sti = self.read_st(dst)?;
        let st0 = self.read_st(0)?;
        self.write_st(dst, op(sti, st0))?;
        self.pop()
    }

    // ---- unary ----------------------------------------------------------

    pub fn fchs(&mut self) -> FpuResult<()> {
        let v = self.read_st(0)?;
        self.write_st(0, -v)
    }

    pub fn fabs(&mut self) -> FpuResult<()> {
        let v = self.read_st(0)?;
        self.write_st(0, v.abs())
    }

    pub fn fsqrt(&mut self) -> FpuResult<()> {
        let v = self.read_st(0)?;
        if v < 0.0 {
            self.signal(FSW_IE)?;
            return self.write_st(0, f64::NAN);
        }
        self.write_st(0, v.sqrt())
    }

    pub fn frndint(&mut self) -> FpuResult<()> {
        let v = self.read_st(0)?;
        let rounded = self.rounding().round(v);
        self.write_st(0, rounded)
    }

    pub fn fscale(&mut self) -> FpuResult<()> {
        let st0 = self.read_st(0)?;
        let st1 = self.read_st(1)?;
        let scale = st1.trunc();
        let factor = if scale >= i32::MAX as f64 {
            f64::INFINITY
        } else if scale <= i32::MIN as f64 {
            0.0
        } else {
            exp2i(scale as i32)
        };
        self.write_st(0, st0 * factor)
    }

    /// Partial remainder with truncating quotient. A 64-bit significand
    /// always completes in one step, so C2 is cleared; C0/C3/C1 carry the
    /// low quotient bits as hardware does.
    pub fn fprem(&mut self) -> FpuResult<()> {
        let st0 = self.read_st(0)?;
        let st1 = self.read_st(1)?;
        if st1 == 0.0 {
            self.signal(FSW_IE)?;
            return self.write_st(0, f64::NAN);
        }
        let quotient = (st0 / st1).trunc();
        let remainder = st0 - quotient * st1;
        let q = quotient.abs() as u64;
        self.set_condition_codes(q & 0b100 != 0, false, q & 0b010 != 0, q & 0b001 != 0);
        self.write_st(0, remainder)
    }

    pub fn fxch(&mut self, i: usize) -> FpuResult<()> {
        let a = self.read_st(0)?;
        let b = self.read_st(i)?;
        self.write_st(0, b)?;
        self.write_st(i, a)
    }

    pub fn ffree(&mut self, i: usize) {
        let phys = self.phys_index(i);
        self.tags[phys] = Tag::Empty;
    }

    pub fn fincstp(&mut self) {
        self.top = (self.top + 1) & 7;
        self.sync_top();
    }

    pub fn fdecstp(&mut self) {
        self.top = self.top.wrapping_sub(1) & 7;
        self.sync_top();
    }

    // ---- transcendentals ------------------------------------------------

    pub fn fsin(&mut self) -> FpuResult<()> {
        let v = self.read_st(0)?;
        self.set_c2(false);
        self.write_st(0, v.sin())
    }

    pub fn fcos(&mut self) -> FpuResult<()> {
        let v = self.read_st(0)?;
        self.set_c2(false);
        self.write_st(0, v.cos())
    }

    pub fn fsincos(&mut self) -> FpuResult<()> {
        let v = self.read_st(0)?;
        self.set_c2(false);
        self.write_st(0, v.sin())?;
        self.push(v.cos())
    }

    pub fn fptan(&mut self) -> FpuResult<()> {
        let v = self.read_st(0)?;
        self.set_c2(false);
        self.write_st(0, v.tan())?;
        self.push(1.0)
    }

    pub fn f2xm1(&mut self) -> FpuResult<()> {
        let v = self.read_st(0)?;
        self.write_st(0, v.exp2() - 1.0)
    }

    /// ST(1) <- ST(1) * log2(ST(0)), pop.
    pub fn fyl2x(&mut self) -> FpuResult<()> {
        let st0 = self.read_st(0)?;
        let st1 = self.read_st(1)?;
        self.write_st(1, st1 * st0.log2())?;
        self.pop()
    }

    /// ST(1) <- atan2(ST(1), ST(0)), pop.
    pub fn fpatan(&mut self) -> FpuResult<()> {
        let st0 = self.read_st(0)?;
        let st1 = self.read_st(1)?;
        self.write_st(1, st1.atan2(st0))?;
        self.pop()
    }

    // ---- compare / classify --------------------------------------------

    /// Ordered compare of ST(0) against `v`: C3=ZF, C2=PF, C0=CF. NaN input
    /// reports unordered and raises IE.
    pub fn fcom(&mut self, v: f64) -> FpuResult<()> {
        let st0 = self.read_st(0)?;
        if st0.is_nan() || v.is_nan() {
            self.set_condition_codes(true, false, true, true);
            self.signal(FSW_IE)?;
            return Ok(());
        }
        self.compare_codes(st0, v);
        Ok(())
    }

    pub fn fcom_st(&mut self, i: usize) -> FpuResult<()> {
        let v = self.read_st(i)?;
        self.fcom(v)
    }

    /// Unordered compare: same condition codes, but quiet NaNs do not raise.
    pub fn fucom_st(&mut self, i: usize) -> FpuResult<()> {
        let st0 = self.read_st(0)?;
        let v = self.read_st(i)?;
        if st0.is_nan() || v.is_nan() {
            self.set_condition_codes(true, false, true, true);
            return Ok(());
        }
        self.compare_codes(st0, v);
        Ok(())
    }

    pub fn ftst(&mut self) -> FpuResult<()> {
        self.fcom(0.0)
    }

    /// Classify ST(0) into C3:C2:C0 per the FXAM encoding; C1 is the sign.
    pub fn fxam(&mut self) {
        let phys = self.phys_index(0);
        let (c3, c2, c0, sign) = match self.tags[phys] {
            Tag::Empty => (true, false, true, false),
            _ => {
                let v = self.regs[phys];
                let sign = v.is_sign_negative();
                if v.is_nan() {
                    (false, false, true, sign)
                } else if v.is_infinite() {
                    (false, true, true, sign)
                } else if v == 0.0 {
                    (true, false, false, sign)
                } else if v.is_subnormal() {
                    (true, true, false, sign)
                } else {
                    (false, true, false, sign)
                }
            }
        };
        self.set_condition_codes(c0, sign, c2, c3);
    }

    pub fn pop_discard(&mut self) -> FpuResult<()> {
        self.pop()
    }

    // ---- internals ------------------------------------------------------

    fn phys_index(&self, st: usize) -> usize {
        (self.top as usize + st) & 7
    }

    fn read_st(&mut self, st: usize) -> FpuResult<f64> {
        let phys = self.phys_index(st);
        if self.tags[phys] == Tag::Empty {
            self.stack_underflow()?;
            Ok(f64::NAN)
        } else {
            Ok(self.regs[phys])
        }
    }

    fn write_st(&mut self, st: usize, v: f64) -> FpuResult<()> {
        let phys = self.phys_index(st);
        self.regs[phys] = v;
        self.tags[phys] = Tag::from_f64(v);
        Ok(())
    }

    fn push(&mut self, v: f64) -> FpuResult<()> {
        let new_top = (self.top.wrapping_sub(1)) & 7;
        let phys = new_top as usize;
        if self.tags[phys] != Tag::Empty {
            // Push into an occupied slot: stack overflow, QNaN result.
            self.fsw |= FSW_C1;
            self.fsw |= FSW_SF;
            self.top = new_top;
            self.sync_top();
            self.regs[phys] = f64::NAN;
            self.tags[phys] = Tag::Special;
            return self.signal(FSW_IE);
        }
        self.top = new_top;
        self.sync_top();
        self.regs[phys] = v;
        self.tags[phys] = Tag::from_f64(v);
        Ok(())
    }

    fn pop(&mut self) -> FpuResult<()> {
        let phys = self.top as usize;
        if self.tags[phys] == Tag::Empty {
            return self.stack_underflow();
        }
        self.tags[phys] = Tag::Empty;
        self.regs[phys] = 0.0;
        self.top = (self.top + 1) & 7;
        self.sync_top();
        Ok(())
    }

    fn stack_underflow(&mut self) -> FpuResult<()> {
        self.fsw &= !FSW_C1;
        self.fsw |= FSW_SF;
        self.signal(FSW_IE)
    }

    fn sync_top(&mut self) {
        self.fsw = (self.fsw & !FSW_TOP_MASK) | ((self.top as u16) << 11);
    }

    fn sync_es(&mut self) {
        let flags = self.fsw & FCW_EXCEPTION_MASK;
        let masks = self.fcw & FCW_EXCEPTION_MASK;
        if flags & !masks != 0 {
            self.fsw |= FSW_ES;
        } else {
            self.fsw &= !FSW_ES;
        }
    }

    fn compare_codes(&mut self, a: f64, b: f64) {
        if a > b {
            self.set_condition_codes(false, false, false, false);
        } else if a < b {
            self.set_condition_codes(true, false, false, false);
        } else {
            self.set_condition_codes(false, false, false, true);
        }
    }

    fn set_condition_codes(&mut self, c0: bool, c1: bool, c2: bool, c3: bool) {
        self.fsw &= !(FSW_C0 | FSW_C1 | FSW_C2 | FSW_C3);
        if c0 {
            self.fsw |= FSW_C0;
        }
        if c1 {
            self.fsw |= FSW_C1;
        }
        if c2 {
            self.fsw |= FSW_C2;
        }
        if c3 {
            self.fsw |= FSW_C3;
        }
    }

    fn set_c2(&mut self, c2: bool) {
        if c2 {
            self.fsw |= FSW_C2;
        } else {
            self.fsw &= !FSW_C2;
        }
    }

    /// Record a sticky exception; escalates to a fault when unmasked.
    fn signal(&mut self, flag: u16) -> FpuResult<()> {
        self.fsw |= flag;
        self.sync_es();
        if flag & !(self.fcw & FCW_EXCEPTION_MASK) != 0 {
            Err(match flag {
                FSW_IE => FpuExceptionKind::InvalidOperation,
                FSW_DE => FpuExceptionKind::DenormalOperand,
                FSW_ZE => FpuExceptionKind::ZeroDivide,
                FSW_OE => FpuExceptionKind::Overflow,
                FSW_UE => FpuExceptionKind::Underflow,
                FSW_PE | _ => FpuExceptionKind::Precision,
            })
        } else {
            Ok(())
        }
    }
}

fn exp2i(e: i32) -> f64 {
    // Split so intermediate powers stay in f64 range for extreme exponents.
    let half = e / 2;
    2f64.powi(half) * 2f64.powi(e - half)
}

// ---- memory format conversions ------------------------------------------

/// Widen an m32 image, keeping NaN payload bits in place.
pub fn f32_bits_to_f64(bits: u32) -> f64 {
    let v = f32::from_bits(bits);
    if v.is_nan() {
        let sign = ((bits >> 31) as u64) << 63;
        let mantissa = ((bits & 0x007F_FFFF) as u64) << 29;
        return f64::from_bits(sign | 0x7FF0_0000_0000_0000 | mantissa);
    }
    v as f64
}

/// Narrow to an m32 image with the given rounding mode, keeping NaN payload
/// bits in place.
pub fn f64_to_f32_bits(v: f64, rc: RoundingControl) -> u32 {
    if v.is_nan() {
        let bits = v.to_bits();
        let sign = ((bits >> 63) as u32) << 31;
        let mut mantissa = ((bits >> 29) & 0x007F_FFFF) as u32;
        if mantissa == 0 {
            // Payload lived entirely in the truncated low bits; stay a NaN.
            mantissa = 0x0040_0000;
        }
        return sign | 0x7F80_0000 | mantissa;
    }
    let nearest = v as f32;
    let adjusted = match rc {
        RoundingControl::NearestEven => nearest,
        RoundingControl::Down => {
            if (nearest as f64) > v {
                f32_step_down(nearest)
            } else {
                nearest
            }
        }
        RoundingControl::Up => {
            if (nearest as f64) < v {
                f32_step_up(nearest)
            } else {
                nearest
            }
        }
        RoundingControl::TowardZero => {
            if (nearest as f64).abs() > v.abs() {
                if nearest > 0.0 {
                    f32_step_down(nearest)
                } else {
                    f32_step_up(nearest)
                }
            } else {
                nearest
            }
        }
    };
    adjusted.to_bits()
}

fn f32_step_up(x: f32) -> f32 {
    let bits = x.to_bits();
    if x == 0.0 {
        f32::from_bits(1)
    } else if bits >> 31 == 0 {
        f32::from_bits(bits + 1)
    } else {
        f32::from_bits(bits - 1)
    }
}

fn f32_step_down(x: f32) -> f32 {
    let bits = x.to_bits();
    if x == 0.0 {
        f32::from_bits(0x8000_0001)
    } else if bits >> 31 == 0 {
        f32::from_bits(bits - 1)
    } else {
        f32::from_bits(bits + 1)
    }
}

/// Encode to the 80-bit extended format: sign, 15-bit exponent (bias 16383),
/// 64-bit significand with an explicit integer bit.
pub fn f64_to_f80(v: f64) -> [u8; 10] {
    let bits = v.to_bits();
    let sign = (bits >> 63) as u16;
    let exp = ((bits >> 52) & 0x7FF) as u16;
    let mantissa = bits & 0x000F_FFFF_FFFF_FFFF;

    let (exp80, sig): (u16, u64) = if exp == 0x7FF {
        // Infinity / NaN: integer bit set, payload shifted up.
        (0x7FFF, 0x8000_0000_0000_0000 | (mantissa << 11))
    } else if exp == 0 {
        if mantissa == 0 {
            (0, 0)
        } else {
            // Denormal: the wider exponent range lets it normalize.
            let lz = mantissa.leading_zeros();
            (15372 - lz as u16, mantissa << lz)
        }
    } else {
        (
            exp - 1023 + 16383,
            0x8000_0000_0000_0000 | (mantissa << 11),
        )
    };

    let mut out = [0u8; 10];
    out[..8].copy_from_slice(&sig.to_le_bytes());
    out[8..].copy_from_slice(&((sign << 15) | exp80).to_le_bytes());
    out
}

/// Decode an 80-bit extended value, rounding the 64-bit significand into the
/// nearest f64.
pub fn f80_to_f64(bytes: [u8; 10]) -> f64 {
    let sig = u64::from_le_bytes(bytes[..8].try_into().unwrap());
    let se = u16::from_le_bytes(bytes[8..].try_into().unwrap());
    let sign = se >> 15 != 0;
    let exp = se & 0x7FFF;

    let magnitude = if exp == 0x7FFF {
        let payload = sig & 0x7FFF_FFFF_FFFF_FFFF;
        if payload == 0 {
            f64::INFINITY
        } else {
            let mut mantissa = (payload >> 11) & 0x000F_FFFF_FFFF_FFFF;
            if mantissa == 0 {
                mantissa = 1 << 51;
            }
            return f64::from_bits(
                ((sign as u64) << 63) | 0x7FF0_0000_0000_0000 | mantissa,
            );
        }
    } else if sig == 0 {
        0.0
    } else {
        let scale = exp as i32 - 16383 - 63;
        let half = scale / 2;
        (sig as f64) * 2f64.powi(half) * 2f64.powi(scale - half)
    };
    if sign {
        -magnitude
    } else {
        magnitude
    }
}
