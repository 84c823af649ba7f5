use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use crate::errors::{CpuFault, HostError};
use crate::host::{HostContext, HostInvoker, InterruptDisposition, SharedMemory};
use crate::vm::cpu::CpuCore;
use crate::vm::memory::{FarPtr, MemoryCore, RelocationRecord, RelocationTarget, SegmentKind};
use crate::vm::registers::CpuFlag::*;

const CODE: u16 = 0x0001;
const DATA: u16 = 0x0002;
const STACK: u16 = 0x0003;

#[derive(Default)]
struct RecordingHost {
    invokes: RefCell<Vec<(u16, u16)>>,
    interrupts: RefCell<Vec<u8>>,
}

impl HostInvoker for RecordingHost {
    fn invoke(&self, import: u16, ordinal: u16, _ctx: &mut HostContext<'_>) -> Result<(), HostError> {
        self.invokes.borrow_mut().push((import, ordinal));
        Ok(())
    }

    fn interrupt(
        &self,
        vector: u8,
        _ctx: &mut HostContext<'_>,
    ) -> Result<InterruptDisposition, HostError> {
        self.interrupts.borrow_mut().push(vector);
        Ok(InterruptDisposition::Handled)
    }
}

struct Vm {
    cpu: CpuCore,
    host: Rc<RecordingHost>,
}

fn setup_with_relocations(code: &[u8], relocations: Vec<RelocationRecord>) -> Vm {
    let mut memory = MemoryCore::new();
    memory.add_segment(CODE, SegmentKind::Code, code, relocations);
    memory.add_segment(DATA, SegmentKind::Data, &[], Vec::new());
    memory.add_segment(STACK, SegmentKind::Stack, &[], Vec::new());
    let memory: SharedMemory = Rc::new(RefCell::new(memory));
    let host = Rc::new(RecordingHost::default());
    let mut cpu = CpuCore::new(memory, host.clone(), Arc::new(AtomicBool::new(false)));
    cpu.registers.cs = CODE;
    cpu.registers.ds = DATA;
    cpu.registers.es = DATA;
    cpu.registers.ss = STACK;
    cpu.registers.sp.set_word(0xFFFE);
    Vm { cpu, host }
}

fn setup(code: &[u8]) -> Vm {
    setup_with_relocations(code, Vec::new())
}

fn exec(vm: &mut Vm) {
    vm.cpu.tick().unwrap();
}

fn exec_n(vm: &mut Vm, n: usize) {
    for _ in 0..n {
        exec(vm);
    }
}

fn data_byte(vm: &Vm, offset: u16) -> u8 {
    vm.cpu.memory().borrow().get_byte(DATA, offset).unwrap()
}

fn data_word(vm: &Vm, offset: u16) -> u16 {
    vm.cpu.memory().borrow().get_word(DATA, offset).unwrap()
}

fn set_data_word(vm: &Vm, offset: u16, value: u16) {
    vm.cpu
        .memory()
        .borrow_mut()
        .set_word(DATA, offset, value)
        .unwrap();
}

fn set_data_byte(vm: &Vm, offset: u16, value: u8) {
    vm.cpu
        .memory()
        .borrow_mut()
        .set_byte(DATA, offset, value)
        .unwrap();
}

// ========================================================================
// DATA TRANSFER
// ========================================================================

#[test]
fn mov_reg16_imm16() {
    // MOV AX,0x1234  (B8 34 12)
    let mut vm = setup(&[0xB8, 0x34, 0x12]);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.ax.word(), 0x1234);
    assert_eq!(vm.cpu.registers.ip, 3);
}

#[test]
fn mov_reg8_imm8_low_and_high() {
    // MOV AL,0x42; MOV AH,0xAB  (B0 42 B4 AB)
    let mut vm = setup(&[0xB0, 0x42, 0xB4, 0xAB]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.word(), 0xAB42);
}

#[test]
fn mov_reg_reg_word() {
    // MOV AX,0x1234; MOV BX,AX  (89 C3)
    let mut vm = setup(&[0xB8, 0x34, 0x12, 0x89, 0xC3]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.bx.word(), 0x1234);
}

#[test]
fn mov_moffs_ax() {
    // MOV AX,0xABCD; MOV [0x100],AX  (A3 00 01)
    let mut vm = setup(&[0xB8, 0xCD, 0xAB, 0xA3, 0x00, 0x01]);
    exec_n(&mut vm, 2);
    assert_eq!(data_word(&vm, 0x100), 0xABCD);
}

#[test]
fn mov_ax_moffs() {
    // MOV AX,[0x200]  (A1 00 02)
    let mut vm = setup(&[0xA1, 0x00, 0x02]);
    set_data_word(&vm, 0x200, 0xBEEF);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.ax.word(), 0xBEEF);
}

#[test]
fn mov_rm_imm_word() {
    // MOV WORD [0x100],0x5678  (C7 06 00 01 78 56)
    let mut vm = setup(&[0xC7, 0x06, 0x00, 0x01, 0x78, 0x56]);
    exec(&mut vm);
    assert_eq!(data_word(&vm, 0x100), 0x5678);
}

#[test]
fn mov_sreg_rm() {
    // MOV BX,0x1000; MOV ES,BX  (8E C3)
    let mut vm = setup(&[0xBB, 0x00, 0x10, 0x8E, 0xC3]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.es, 0x1000);
}

#[test]
fn mov_rm_sreg() {
    // MOV AX,DS  (8C D8)
    let mut vm = setup(&[0x8C, 0xD8]);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.ax.word(), DATA);
}

#[test]
fn mov_with_bx_si_addressing() {
    // MOV AX,[BX+SI+0x10]  (8B 40 10: mod=01 reg=000 rm=000 disp8)
    let mut vm = setup(&[0x8B, 0x40, 0x10]);
    vm.cpu.registers.bx.set_word(0x100);
    vm.cpu.registers.si.set_word(0x20);
    set_data_word(&vm, 0x130, 0xCAFE);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.ax.word(), 0xCAFE);
}

#[test]
fn mov_bp_defaults_to_stack_segment() {
    // MOV AX,[BP+2]  (8B 46 02) reads SS, not DS
    let mut vm = setup(&[0x8B, 0x46, 0x02]);
    vm.cpu.registers.bp.set_word(0x500);
    vm.cpu
        .memory()
        .borrow_mut()
        .set_word(STACK, 0x502, 0x4242)
        .unwrap();
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.ax.word(), 0x4242);
}

#[test]
fn mov_segment_override_prefix() {
    // MOV AX,ES:[0x100]  (26 A1 00 01) with ES pointed at the stack segment
    let mut vm = setup(&[0x26, 0xA1, 0x00, 0x01]);
    vm.cpu.registers.es = STACK;
    vm.cpu
        .memory()
        .borrow_mut()
        .set_word(STACK, 0x100, 0x9999)
        .unwrap();
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.ax.word(), 0x9999);
}

#[test]
fn xchg_ax_cx() {
    // XCHG AX,CX  (91)
    let mut vm = setup(&[0x91]);
    vm.cpu.registers.ax.set_word(0x1111);
    vm.cpu.registers.cx.set_word(0x2222);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.ax.word(), 0x2222);
    assert_eq!(vm.cpu.registers.cx.word(), 0x1111);
}

#[test]
fn lea_bx_disp() {
    // LEA AX,[BX+0x1234]  (8D 87 34 12)
    let mut vm = setup(&[0x8D, 0x87, 0x34, 0x12]);
    vm.cpu.registers.bx.set_word(0x1000);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.ax.word(), 0x2234);
}

#[test]
fn lds_loads_offset_and_selector() {
    // LDS BX,[0x100]  (C5 1E 00 01)
    let mut vm = setup(&[0xC5, 0x1E, 0x00, 0x01]);
    set_data_word(&vm, 0x100, 0x1234);
    set_data_word(&vm, 0x102, 0x2000);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.bx.word(), 0x1234);
    assert_eq!(vm.cpu.registers.ds, 0x2000);
}

#[test]
fn les_loads_offset_and_selector() {
    // LES DI,[0x100]  (C4 3E 00 01)
    let mut vm = setup(&[0xC4, 0x3E, 0x00, 0x01]);
    set_data_word(&vm, 0x100, 0xAAAA);
    set_data_word(&vm, 0x102, 0x3000);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.di.word(), 0xAAAA);
    assert_eq!(vm.cpu.registers.es, 0x3000);
}

#[test]
fn push_pop_round_trip() {
    // MOV AX,0x1234; PUSH AX; POP BX  (50 5B)
    let mut vm = setup(&[0xB8, 0x34, 0x12, 0x50, 0x5B]);
    let sp = vm.cpu.registers.sp.word();
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.bx.word(), 0x1234);
    assert_eq!(vm.cpu.registers.sp.word(), sp);
}

#[test]
fn push_imm8_sign_extends() {
    // PUSH -2  (6A FE); POP AX
    let mut vm = setup(&[0x6A, 0xFE, 0x58]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.word(), 0xFFFE);
}

#[test]
fn pusha_popa() {
    // PUSHA; POPA  (60 61)
    let mut vm = setup(&[0x60, 0x61]);
    vm.cpu.registers.ax.set_word(1);
    vm.cpu.registers.cx.set_word(2);
    vm.cpu.registers.dx.set_word(3);
    vm.cpu.registers.bx.set_word(4);
    vm.cpu.registers.bp.set_word(5);
    vm.cpu.registers.si.set_word(6);
    vm.cpu.registers.di.set_word(7);
    let sp = vm.cpu.registers.sp.word();
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.sp.word(), sp - 16);
    vm.cpu.registers.ax.set_word(0);
    vm.cpu.registers.di.set_word(0);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.ax.word(), 1);
    assert_eq!(vm.cpu.registers.di.word(), 7);
    assert_eq!(vm.cpu.registers.sp.word(), sp);
}

#[test]
fn pushf_popf_round_trip() {
    // STC; PUSHF; CLC; POPF  (F9 9C F8 9D)
    let mut vm = setup(&[0xF9, 0x9C, 0xF8, 0x9D]);
    exec_n(&mut vm, 4);
    assert!(vm.cpu.registers.check_flag(Carry));
}

#[test]
fn cbw_sign_extends_al() {
    // MOV AL,0x80; CBW  (98)
    let mut vm = setup(&[0xB0, 0x80, 0x98]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.word(), 0xFF80);
}

#[test]
fn cwd_sign_extends_ax_into_dx() {
    // MOV AX,0x8000; CWD  (99)
    let mut vm = setup(&[0xB8, 0x00, 0x80, 0x99]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.dx.word(), 0xFFFF);
}

#[test]
fn xlat_translates_through_bx() {
    // XLAT  (D7)
    let mut vm = setup(&[0xD7]);
    vm.cpu.registers.bx.set_word(0x300);
    vm.cpu.registers.ax.set_low(5);
    set_data_byte(&vm, 0x305, 0x77);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.ax.low(), 0x77);
}

#[test]
fn lahf_sahf_round_trip() {
    // STC; LAHF; CLC; SAHF  (F9 9F F8 9E)
    let mut vm = setup(&[0xF9, 0x9F, 0xF8, 0x9E]);
    exec_n(&mut vm, 4);
    assert!(vm.cpu.registers.check_flag(Carry));
}

#[test]
fn enter_leave_frame() {
    // ENTER 0x10,0; LEAVE  (C8 10 00 00 C9)
    let mut vm = setup(&[0xC8, 0x10, 0x00, 0x00, 0xC9]);
    let sp = vm.cpu.registers.sp.word();
    let bp = vm.cpu.registers.bp.word();
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.sp.word(), sp - 2 - 0x10);
    assert_eq!(vm.cpu.registers.bp.word(), sp - 2);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.sp.word(), sp);
    assert_eq!(vm.cpu.registers.bp.word(), bp);
}

// ========================================================================
// ARITHMETIC
// ========================================================================

#[test]
fn add_al_imm8() {
    // MOV AL,5; ADD AL,3  (04 03)
    let mut vm = setup(&[0xB0, 0x05, 0x04, 0x03]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.low(), 8);
    assert!(!vm.cpu.registers.check_flag(Carry));
    assert!(!vm.cpu.registers.check_flag(Zero));
}

#[test]
fn add_overflow_and_carry() {
    // MOV AL,0xFF; ADD AL,1 -> zero, carry, aux-carry, no signed overflow
    let mut vm = setup(&[0xB0, 0xFF, 0x04, 0x01]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.low(), 0);
    assert!(vm.cpu.registers.check_flag(Carry));
    assert!(vm.cpu.registers.check_flag(Zero));
    assert!(vm.cpu.registers.check_flag(AuxCarry));
    assert!(!vm.cpu.registers.check_flag(Overflow));
}

#[test]
fn add_signed_overflow() {
    // MOV AX,0x7FFF; ADD AX,1 -> signed overflow, sign set
    let mut vm = setup(&[0xB8, 0xFF, 0x7F, 0x05, 0x01, 0x00]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.word(), 0x8000);
    assert!(vm.cpu.registers.check_flag(Overflow));
    assert!(vm.cpu.registers.check_flag(Sign));
    assert!(!vm.cpu.registers.check_flag(Carry));
}

#[test]
fn add_rm_reg_writes_destination() {
    // MOV AX,1; MOV BX,2; ADD AX,BX  (01 D8)
    let mut vm = setup(&[0xB8, 0x01, 0x00, 0xBB, 0x02, 0x00, 0x01, 0xD8]);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.ax.word(), 3);
    assert_eq!(vm.cpu.registers.bx.word(), 2);
}

#[test]
fn add_sign_extended_imm8() {
    // MOV AX,5; ADD AX,-1  (83 C0 FF)
    let mut vm = setup(&[0xB8, 0x05, 0x00, 0x83, 0xC0, 0xFF]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.word(), 4);
    assert!(vm.cpu.registers.check_flag(Carry)); // 5 + 0xFFFF carries out
}

#[test]
fn adc_uses_carry_in() {
    // STC; MOV AL,1; ADC AL,1  (14 01)
    let mut vm = setup(&[0xF9, 0xB0, 0x01, 0x14, 0x01]);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.ax.low(), 3);
}

#[test]
fn sub_borrow_sets_carry() {
    // MOV AL,1; SUB AL,2  (2C 02)
    let mut vm = setup(&[0xB0, 0x01, 0x2C, 0x02]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.low(), 0xFF);
    assert!(vm.cpu.registers.check_flag(Carry));
    assert!(vm.cpu.registers.check_flag(Sign));
}

#[test]
fn sbb_uses_borrow_in() {
    // STC; MOV AL,5; SBB AL,1  (1C 01)
    let mut vm = setup(&[0xF9, 0xB0, 0x05, 0x1C, 0x01]);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.ax.low(), 3);
}

#[test]
fn cmp_does_not_write() {
    // MOV AX,5; CMP AX,5  (3D 05 00)
    let mut vm = setup(&[0xB8, 0x05, 0x00, 0x3D, 0x05, 0x00]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.word(), 5);
    assert!(vm.cpu.registers.check_flag(Zero));
}

#[test]
fn inc_preserves_carry_sets_overflow() {
    // STC; MOV AX,0x7FFF; INC AX  (40)
    let mut vm = setup(&[0xF9, 0xB8, 0xFF, 0x7F, 0x40]);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.ax.word(), 0x8000);
    assert!(vm.cpu.registers.check_flag(Overflow));
    assert!(vm.cpu.registers.check_flag(Sign));
    assert!(!vm.cpu.registers.check_flag(Zero));
    assert!(vm.cpu.registers.check_flag(Carry)); // untouched
}

#[test]
fn dec_preserves_carry() {
    // STC; MOV AX,1; DEC AX  (48)
    let mut vm = setup(&[0xF9, 0xB8, 0x01, 0x00, 0x48]);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.ax.word(), 0);
    assert!(vm.cpu.registers.check_flag(Zero));
    assert!(vm.cpu.registers.check_flag(Carry));
}

#[test]
fn inc_byte_rm() {
    // INC BYTE [0x100]  (FE 06 00 01)
    let mut vm = setup(&[0xFE, 0x06, 0x00, 0x01]);
    set_data_byte(&vm, 0x100, 0x7F);
    exec(&mut vm);
    assert_eq!(data_byte(&vm, 0x100), 0x80);
    assert!(vm.cpu.registers.check_flag(Overflow));
}

#[test]
fn neg_sets_carry_for_nonzero() {
    // MOV AX,5; NEG AX  (F7 D8)
    let mut vm = setup(&[0xB8, 0x05, 0x00, 0xF7, 0xD8]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.word(), 0xFFFB);
    assert!(vm.cpu.registers.check_flag(Carry));
}

#[test]
fn not_has_no_flag_effect() {
    // STC; MOV AX,0x00FF; NOT AX  (F7 D0)
    let mut vm = setup(&[0xF9, 0xB8, 0xFF, 0x00, 0xF7, 0xD0]);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.ax.word(), 0xFF00);
    assert!(vm.cpu.registers.check_flag(Carry));
}

#[test]
fn mul_word_widens_into_dx_ax() {
    // MOV AX,0x1000; MOV BX,0x10; MUL BX  (F7 E3)
    let mut vm = setup(&[0xB8, 0x00, 0x10, 0xBB, 0x10, 0x00, 0xF7, 0xE3]);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.ax.word(), 0x0000);
    assert_eq!(vm.cpu.registers.dx.word(), 0x0001);
    assert!(vm.cpu.registers.check_flag(Carry));
    assert!(vm.cpu.registers.check_flag(Overflow));
}

#[test]
fn mul_byte_into_ax() {
    // MOV AL,7; MOV BL,3; MUL BL  (F6 E3)
    let mut vm = setup(&[0xB0, 0x07, 0xB3, 0x03, 0xF6, 0xE3]);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.ax.word(), 21);
    assert!(!vm.cpu.registers.check_flag(Carry));
}

#[test]
fn imul_one_operand_signed() {
    // MOV AX,-2; MOV BX,3; IMUL BX  (F7 EB)
    let mut vm = setup(&[0xB8, 0xFE, 0xFF, 0xBB, 0x03, 0x00, 0xF7, 0xEB]);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.ax.word(), 0xFFFA); // -6
    assert_eq!(vm.cpu.registers.dx.word(), 0xFFFF);
    assert!(!vm.cpu.registers.check_flag(Carry)); // fits in 16 bits
}

#[test]
fn imul_three_operand() {
    // MOV BX,-3; IMUL AX,BX,5  (6B C3 05)
    let mut vm = setup(&[0xBB, 0xFD, 0xFF, 0x6B, 0xC3, 0x05]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.word(), 0xFFF1); // -15
    assert!(!vm.cpu.registers.check_flag(Overflow));
}

#[test]
fn div_byte_quotient_remainder() {
    // MOV AX,10; MOV BL,3; DIV BL  (F6 F3)
    let mut vm = setup(&[0xB8, 0x0A, 0x00, 0xB3, 0x03, 0xF6, 0xF3]);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.ax.low(), 3);
    assert_eq!(vm.cpu.registers.ax.high(), 1);
}

#[test]
fn div_by_zero_faults() {
    // MOV AX,10; MOV BL,0; DIV BL  (F6 F3)
    let mut vm = setup(&[0xB8, 0x0A, 0x00, 0xB3, 0x00, 0xF6, 0xF3]);
    exec_n(&mut vm, 2);
    assert!(matches!(vm.cpu.tick(), Err(CpuFault::DivideError)));
}

#[test]
fn div_quotient_overflow_faults() {
    // MOV AX,0x200; MOV BL,1; DIV BL -> quotient 0x200 does not fit AL
    let mut vm = setup(&[0xB8, 0x00, 0x02, 0xB3, 0x01, 0xF6, 0xF3]);
    exec_n(&mut vm, 2);
    assert!(matches!(vm.cpu.tick(), Err(CpuFault::DivideError)));
}

#[test]
fn idiv_word_signed() {
    // DX:AX = -100, BX = 7: quotient -14, remainder -2
    // MOV AX,0xFF9C; CWD; MOV BX,7; IDIV BX  (F7 FB)
    let mut vm = setup(&[0xB8, 0x9C, 0xFF, 0x99, 0xBB, 0x07, 0x00, 0xF7, 0xFB]);
    exec_n(&mut vm, 4);
    assert_eq!(vm.cpu.registers.ax.word(), 0xFFF2); // -14
    assert_eq!(vm.cpu.registers.dx.word(), 0xFFFE); // -2
}

#[test]
fn aam_splits_al() {
    // MOV AL,47; AAM  (D4 0A)
    let mut vm = setup(&[0xB0, 0x2F, 0xD4, 0x0A]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.high(), 4);
    assert_eq!(vm.cpu.registers.ax.low(), 7);
}

#[test]
fn aad_recombines_ah_al() {
    // MOV AX,0x0407; AAD  (D5 0A)
    let mut vm = setup(&[0xB8, 0x07, 0x04, 0xD5, 0x0A]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.word(), 47);
}

#[test]
fn daa_adjusts_packed_bcd() {
    // MOV AL,0x15; ADD AL,0x27; DAA -> 0x42
    let mut vm = setup(&[0xB0, 0x15, 0x04, 0x27, 0x27]);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.ax.low(), 0x42);
}

#[test]
fn aaa_adjusts_unpacked_bcd() {
    // MOV AX,0x000F; AAA -> AH=1, AL=5
    let mut vm = setup(&[0xB8, 0x0F, 0x00, 0x37]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.high(), 1);
    assert_eq!(vm.cpu.registers.ax.low(), 5);
}

// ========================================================================
// LOGIC, SHIFTS, ROTATES
// ========================================================================

#[test]
fn and_clears_carry() {
    // STC; MOV AX,0xF0F0; AND AX,0x0FF0  (25 F0 0F)
    let mut vm = setup(&[0xF9, 0xB8, 0xF0, 0xF0, 0x25, 0xF0, 0x0F]);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.ax.word(), 0x00F0);
    assert!(!vm.cpu.registers.check_flag(Carry));
    assert!(!vm.cpu.registers.check_flag(Overflow));
}

#[test]
fn xor_self_zeroes() {
    // MOV AX,0x1234; XOR AX,AX  (31 C0)
    let mut vm = setup(&[0xB8, 0x34, 0x12, 0x31, 0xC0]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.word(), 0);
    assert!(vm.cpu.registers.check_flag(Zero));
    assert!(vm.cpu.registers.check_flag(Parity));
}

#[test]
fn test_sets_flags_without_writing() {
    // MOV AL,0x0F; TEST AL,0x80  (A8 80)
    let mut vm = setup(&[0xB0, 0x0F, 0xA8, 0x80]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.low(), 0x0F);
    assert!(vm.cpu.registers.check_flag(Zero));
}

#[test]
fn shl_by_one_sets_carry_and_overflow() {
    // MOV AL,0x81; SHL AL,1  (D0 E0)
    let mut vm = setup(&[0xB0, 0x81, 0xD0, 0xE0]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.low(), 0x02);
    assert!(vm.cpu.registers.check_flag(Carry));
    // MSB of result (0) != CF (1) -> OF set
    assert!(vm.cpu.registers.check_flag(Overflow));
}

#[test]
fn shl_by_imm_count() {
    // MOV AX,1; SHL AX,4  (C1 E0 04)
    let mut vm = setup(&[0xB8, 0x01, 0x00, 0xC1, 0xE0, 0x04]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.word(), 0x10);
}

#[test]
fn shr_lsb_to_carry() {
    // MOV AL,3; SHR AL,1  (D0 E8)
    let mut vm = setup(&[0xB0, 0x03, 0xD0, 0xE8]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.low(), 1);
    assert!(vm.cpu.registers.check_flag(Carry));
}

#[test]
fn sar_keeps_sign() {
    // MOV AL,0xF0; SAR AL,1  (D0 F8)
    let mut vm = setup(&[0xB0, 0xF0, 0xD0, 0xF8]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.low(), 0xF8);
}

#[test]
fn sar_by_cl() {
    // MOV AX,0x8000; MOV CL,15; SAR AX,CL  (D3 F8)
    let mut vm = setup(&[0xB8, 0x00, 0x80, 0xB1, 0x0F, 0xD3, 0xF8]);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.ax.word(), 0xFFFF);
}

#[test]
fn rol_wraps_msb_to_lsb() {
    // MOV AL,0x81; ROL AL,1  (D0 C0)
    let mut vm = setup(&[0xB0, 0x81, 0xD0, 0xC0]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.low(), 0x03);
    assert!(vm.cpu.registers.check_flag(Carry));
}

#[test]
fn ror_wraps_lsb_to_msb() {
    // MOV AL,0x01; ROR AL,1  (D0 C8)
    let mut vm = setup(&[0xB0, 0x01, 0xD0, 0xC8]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.low(), 0x80);
    assert!(vm.cpu.registers.check_flag(Carry));
}

#[test]
fn rcl_rotates_through_carry() {
    // STC; MOV AL,0x80; RCL AL,1  (D0 D0)
    let mut vm = setup(&[0xF9, 0xB0, 0x80, 0xD0, 0xD0]);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.ax.low(), 0x01);
    assert!(vm.cpu.registers.check_flag(Carry));
}

#[test]
fn rcr_rotates_through_carry() {
    // STC; MOV AL,0x01; RCR AL,1  (D0 D8)
    let mut vm = setup(&[0xF9, 0xB0, 0x01, 0xD0, 0xD8]);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.ax.low(), 0x80);
    assert!(vm.cpu.registers.check_flag(Carry));
}

// ========================================================================
// STRING OPERATIONS
// ========================================================================

#[test]
fn rep_movsb_copies_and_advances() {
    // CX=5, SI=0, DI=10, DF=0: REP MOVSB  (F3 A4)
    let mut vm = setup(&[0xF3, 0xA4]);
    for i in 0..5u16 {
        set_data_byte(&vm, i, 0x60 + i as u8);
    }
    vm.cpu.registers.cx.set_word(5);
    vm.cpu.registers.si.set_word(0);
    vm.cpu.registers.di.set_word(10);
    exec(&mut vm);
    for i in 0..5u16 {
        assert_eq!(data_byte(&vm, 10 + i), 0x60 + i as u8);
    }
    assert_eq!(vm.cpu.registers.cx.word(), 0);
    assert_eq!(vm.cpu.registers.si.word(), 5);
    assert_eq!(vm.cpu.registers.di.word(), 15);
}

#[test]
fn rep_movsb_with_zero_count_is_a_no_op() {
    // CX=0: REP MOVSB leaves SI/DI/CX untouched
    let mut vm = setup(&[0xF3, 0xA4]);
    vm.cpu.registers.cx.set_word(0);
    vm.cpu.registers.si.set_word(0x20);
    vm.cpu.registers.di.set_word(0x40);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.cx.word(), 0);
    assert_eq!(vm.cpu.registers.si.word(), 0x20);
    assert_eq!(vm.cpu.registers.di.word(), 0x40);
}

#[test]
fn movsw_without_rep_moves_once() {
    // MOVSW  (A5)
    let mut vm = setup(&[0xA5]);
    set_data_word(&vm, 0, 0x1234);
    vm.cpu.registers.si.set_word(0);
    vm.cpu.registers.di.set_word(0x10);
    vm.cpu.registers.cx.set_word(9); // must not be consumed
    exec(&mut vm);
    assert_eq!(data_word(&vm, 0x10), 0x1234);
    assert_eq!(vm.cpu.registers.cx.word(), 9);
    assert_eq!(vm.cpu.registers.si.word(), 2);
}

#[test]
fn std_reverses_string_direction() {
    // STD; LODSB twice walks SI downward  (FD AC AC)
    let mut vm = setup(&[0xFD, 0xAC, 0xAC]);
    set_data_byte(&vm, 0x10, 0xAA);
    set_data_byte(&vm, 0x0F, 0xBB);
    vm.cpu.registers.si.set_word(0x10);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.ax.low(), 0xBB);
    assert_eq!(vm.cpu.registers.si.word(), 0x0E);
}

#[test]
fn rep_stosw_fills() {
    // MOV AX,0xABAB; CX=3, DI=0: REP STOSW  (F3 AB)
    let mut vm = setup(&[0xB8, 0xAB, 0xAB, 0xF3, 0xAB]);
    vm.cpu.registers.cx.set_word(3);
    vm.cpu.registers.di.set_word(0);
    exec_n(&mut vm, 2);
    for i in 0..3 {
        assert_eq!(data_word(&vm, i * 2), 0xABAB);
    }
    assert_eq!(vm.cpu.registers.di.word(), 6);
}

#[test]
fn repe_cmpsb_stops_at_mismatch() {
    // REPE CMPSB  (F3 A6), buffers differ at the third byte
    let mut vm = setup(&[0xF3, 0xA6]);
    for (i, b) in [1u8, 2, 3].iter().enumerate() {
        set_data_byte(&vm, i as u16, *b);
    }
    for (i, b) in [1u8, 2, 9].iter().enumerate() {
        set_data_byte(&vm, 0x20 + i as u16, *b);
    }
    vm.cpu.registers.cx.set_word(3);
    vm.cpu.registers.si.set_word(0);
    vm.cpu.registers.di.set_word(0x20);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.cx.word(), 0);
    assert!(!vm.cpu.registers.check_flag(Zero));
    assert_eq!(vm.cpu.registers.si.word(), 3);
}

#[test]
fn repne_scasb_finds_byte() {
    // MOV AL,0x33; REPNE SCASB  (F2 AE)
    let mut vm = setup(&[0xB0, 0x33, 0xF2, 0xAE]);
    for (i, b) in [0x11u8, 0x22, 0x33, 0x44].iter().enumerate() {
        set_data_byte(&vm, i as u16, *b);
    }
    vm.cpu.registers.cx.set_word(4);
    vm.cpu.registers.di.set_word(0);
    exec_n(&mut vm, 2);
    assert!(vm.cpu.registers.check_flag(Zero));
    assert_eq!(vm.cpu.registers.di.word(), 3); // one past the match
    assert_eq!(vm.cpu.registers.cx.word(), 1);
}

#[test]
fn movs_honors_source_segment_override() {
    // ES:MOVSB with the source prefix pointing at the stack segment (26 A4)
    let mut vm = setup(&[0x26, 0xA4]);
    vm.cpu
        .memory()
        .borrow_mut()
        .set_byte(STACK, 0x5, 0x99)
        .unwrap();
    vm.cpu.registers.es = STACK;
    vm.cpu.registers.si.set_word(0x5);
    vm.cpu.registers.di.set_word(0x8);
    exec(&mut vm);
    // Destination is ES:DI, which the prefix must not change.
    assert_eq!(
        vm.cpu.memory().borrow().get_byte(STACK, 0x8).unwrap(),
        0x99
    );
}

// ========================================================================
// CONTROL TRANSFER
// ========================================================================

#[test]
fn jmp_short_forward() {
    // JMP +1; (skipped INC AX); INC BX  (EB 01 40 43)
    let mut vm = setup(&[0xEB, 0x01, 0x40, 0x43]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.word(), 0);
    assert_eq!(vm.cpu.registers.bx.word(), 1);
}

#[test]
fn jmp_far_direct() {
    // JMP 0001:0010  (EA 10 00 01 00)
    let mut vm = setup(&[0xEA, 0x10, 0x00, 0x01, 0x00]);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.cs, CODE);
    assert_eq!(vm.cpu.registers.ip, 0x10);
}

#[test]
fn jmp_register_indirect() {
    // MOV BX,0x10; JMP BX  (FF E3)
    let mut vm = setup(&[0xBB, 0x10, 0x00, 0xFF, 0xE3]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ip, 0x10);
}

#[test]
fn je_taken_and_not_taken() {
    // XOR AX,AX; JE +1; INC BX; INC CX  (31 C0 74 01 43 41)
    let mut vm = setup(&[0x31, 0xC0, 0x74, 0x01, 0x43, 0x41]);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.bx.word(), 0); // skipped
    assert_eq!(vm.cpu.registers.cx.word(), 1);

    // MOV AX,1 clears ZF via OR AX,AX; JE not taken
    let mut vm = setup(&[0xB8, 0x01, 0x00, 0x09, 0xC0, 0x74, 0x01, 0x43, 0x41]);
    exec_n(&mut vm, 4);
    assert_eq!(vm.cpu.registers.bx.word(), 1); // fell through
}

#[test]
fn jl_uses_sign_and_overflow() {
    // MOV AX,-1; CMP AX,1; JL +1; INC BX; INC CX
    // (B8 FF FF 3D 01 00 7C 01 43 41)
    let mut vm = setup(&[0xB8, 0xFF, 0xFF, 0x3D, 0x01, 0x00, 0x7C, 0x01, 0x43, 0x41]);
    exec_n(&mut vm, 4);
    assert_eq!(vm.cpu.registers.bx.word(), 0);
    assert_eq!(vm.cpu.registers.cx.word(), 1);
}

#[test]
fn jcxz_branches_on_zero_cx() {
    // JCXZ +1; INC BX; INC DX  (E3 01 43 42)
    let mut vm = setup(&[0xE3, 0x01, 0x43, 0x42]);
    vm.cpu.registers.cx.set_word(0);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.bx.word(), 0);
    assert_eq!(vm.cpu.registers.dx.word(), 1);
}

#[test]
fn jecxz_tests_full_ecx() {
    // JECXZ +1  (67 E3 01); INC BX; INC DX
    // CX is zero but the high half of ECX is not: no branch.
    let mut vm = setup(&[0x67, 0xE3, 0x01, 0x43, 0x42]);
    vm.cpu.registers.cx.set_dword(0x0001_0000);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.bx.word(), 1);

    // All of ECX zero: branch taken, INC BX skipped.
    let mut vm = setup(&[0x67, 0xE3, 0x01, 0x43, 0x42]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.bx.word(), 0);
    assert_eq!(vm.cpu.registers.dx.word(), 1);
}

#[test]
fn loop_decrements_until_zero() {
    // MOV CX,3; INC AX; LOOP -3  (E2 FD)
    let mut vm = setup(&[0xB9, 0x03, 0x00, 0x40, 0xE2, 0xFD]);
    exec(&mut vm);
    for _ in 0..3 {
        exec_n(&mut vm, 2); // INC + LOOP
    }
    assert_eq!(vm.cpu.registers.ax.word(), 3);
    assert_eq!(vm.cpu.registers.cx.word(), 0);
    assert_eq!(vm.cpu.registers.ip, 6);
}

#[test]
fn call_near_and_ret() {
    // CALL +1; HLT; INC AX; RET  (E8 01 00 F4 40 C3)
    let mut vm = setup(&[0xE8, 0x01, 0x00, 0xF4, 0x40, 0xC3]);
    let sp = vm.cpu.registers.sp.word();
    exec(&mut vm); // CALL -> 4
    assert_eq!(vm.cpu.registers.ip, 4);
    assert_eq!(vm.cpu.registers.sp.word(), sp - 2);
    exec_n(&mut vm, 2); // INC, RET
    assert_eq!(vm.cpu.registers.ip, 3);
    assert_eq!(vm.cpu.registers.sp.word(), sp);
    assert_eq!(vm.cpu.registers.ax.word(), 1);
}

#[test]
fn ret_with_stack_adjust() {
    // Callee cleans two words of arguments: RET 4
    // PUSH 1; PUSH 2; CALL +1; HLT; RET 4  (C2 04 00)
    let mut vm = setup(&[0x6A, 0x01, 0x6A, 0x02, 0xE8, 0x01, 0x00, 0xF4, 0xC2, 0x04, 0x00]);
    let sp = vm.cpu.registers.sp.word();
    exec_n(&mut vm, 4);
    assert_eq!(vm.cpu.registers.ip, 7);
    assert_eq!(vm.cpu.registers.sp.word(), sp);
}

#[test]
fn call_far_internal_and_retf() {
    // CALL 0001:0008; HLT; ...; RETF at 8  (9A 08 00 01 00 F4 00 00 CB)
    let mut vm = setup(&[0x9A, 0x08, 0x00, 0x01, 0x00, 0xF4, 0x00, 0x00, 0xCB]);
    let sp = vm.cpu.registers.sp.word();
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.ip, 8);
    assert_eq!(vm.cpu.registers.sp.word(), sp - 4);
    exec(&mut vm); // RETF
    assert_eq!(vm.cpu.registers.cs, CODE);
    assert_eq!(vm.cpu.registers.ip, 5);
    assert_eq!(vm.cpu.registers.sp.word(), sp);
}

#[test]
fn call_far_indirect_through_memory() {
    // CALL FAR [0x100]  (FF 1E 00 01) with 0001:0006 stored at DS:0x100
    let mut vm = setup(&[0xFF, 0x1E, 0x00, 0x01, 0xF4, 0xF4, 0xCB]);
    set_data_word(&vm, 0x100, 0x0006);
    set_data_word(&vm, 0x102, CODE);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.ip, 6);
    exec(&mut vm); // RETF back past the CALL
    assert_eq!(vm.cpu.registers.ip, 4);
}

#[test]
fn int_is_delivered_to_host() {
    // INT 0x21; INC AX  (CD 21 40)
    let mut vm = setup(&[0xCD, 0x21, 0x40]);
    exec_n(&mut vm, 2);
    assert_eq!(*vm.host.interrupts.borrow(), vec![0x21]);
    assert_eq!(vm.cpu.registers.ax.word(), 1);
}

#[test]
fn flag_instructions() {
    // STC; CMC; STD; CLI  (F9 F5 FD FA)
    let mut vm = setup(&[0xF9, 0xF5, 0xFD, 0xFA]);
    exec_n(&mut vm, 2);
    assert!(!vm.cpu.registers.check_flag(Carry));
    exec_n(&mut vm, 2);
    assert!(vm.cpu.registers.check_flag(Directional));
    assert!(!vm.cpu.registers.check_flag(Interrupt));
}

// ========================================================================
// BIT OPERATIONS
// ========================================================================

#[test]
fn bt_sets_carry_from_bit() {
    // MOV AX,0x0010; MOV BX,4; BT AX,BX  (0F A3 D8)
    let mut vm = setup(&[0xB8, 0x10, 0x00, 0xBB, 0x04, 0x00, 0x0F, 0xA3, 0xD8]);
    exec_n(&mut vm, 3);
    assert!(vm.cpu.registers.check_flag(Carry));
    assert_eq!(vm.cpu.registers.ax.word(), 0x0010);
}

#[test]
fn bts_btr_btc_modify() {
    // MOV BX,1; BTS AX,BX; BTC AX,BX; BTR AX,BX
    // (0F AB D8, 0F BB D8, 0F B3 D8)
    let mut vm = setup(&[
        0xBB, 0x01, 0x00, 0x0F, 0xAB, 0xD8, 0x0F, 0xBB, 0xD8, 0x0F, 0xB3, 0xD8,
    ]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.word(), 0x0002);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.ax.word(), 0x0000);
    assert!(vm.cpu.registers.check_flag(Carry));
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.ax.word(), 0x0000);
    assert!(!vm.cpu.registers.check_flag(Carry));
}

#[test]
fn bt_imm_on_memory() {
    // BT WORD [0x100],4  (0F BA 26 00 01 04)
    let mut vm = setup(&[0x0F, 0xBA, 0x26, 0x00, 0x01, 0x04]);
    set_data_word(&vm, 0x100, 0x0010);
    exec(&mut vm);
    assert!(vm.cpu.registers.check_flag(Carry));
}

#[test]
fn bsf_finds_lowest_set_bit() {
    // MOV BX,0x0048; BSF AX,BX  (0F BC C3)
    let mut vm = setup(&[0xBB, 0x48, 0x00, 0x0F, 0xBC, 0xC3]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.word(), 3);
    assert!(!vm.cpu.registers.check_flag(Zero));
}

#[test]
fn bsr_finds_highest_set_bit() {
    // MOV BX,0x0048; BSR AX,BX  (0F BD C3)
    let mut vm = setup(&[0xBB, 0x48, 0x00, 0x0F, 0xBD, 0xC3]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.word(), 6);
}

#[test]
fn bsf_zero_source_sets_zf_only() {
    // XOR BX,BX; BSF AX,BX
    let mut vm = setup(&[0x31, 0xDB, 0x0F, 0xBC, 0xC3]);
    vm.cpu.registers.ax.set_word(0x5555);
    exec_n(&mut vm, 2);
    assert!(vm.cpu.registers.check_flag(Zero));
    assert_eq!(vm.cpu.registers.ax.word(), 0x5555); // destination untouched
}

#[test]
fn movzx_zero_extends() {
    // MOV BL,0x80; MOVZX AX,BL  (0F B6 C3)
    let mut vm = setup(&[0xB3, 0x80, 0x0F, 0xB6, 0xC3]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.word(), 0x0080);
}

#[test]
fn movsx_sign_extends() {
    // MOV BL,0x80; MOVSX AX,BL  (0F BE C3)
    let mut vm = setup(&[0xB3, 0x80, 0x0F, 0xBE, 0xC3]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.ax.word(), 0xFF80);
}

// ========================================================================
// RELOCATION REDIRECTION
// ========================================================================

#[test]
fn relocated_immediate_reads_target_offset() {
    // MOV AX,0xFFFF with a record at the immediate slot (offset 1)
    let record = RelocationRecord {
        offset: 1,
        target: RelocationTarget::InternalRef(FarPtr::new(7, 0x1000)),
    };
    let mut vm = setup_with_relocations(&[0xB8, 0xFF, 0xFF], vec![record]);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.ax.word(), 0x1000);
}

#[test]
fn literal_ffff_immediate_without_record_is_minus_one() {
    // MOV AX,0xFFFF and no relocation registered
    let mut vm = setup(&[0xB8, 0xFF, 0xFF]);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.ax.word(), 0xFFFF);
}

#[test]
fn far_call_through_import_invokes_host_once() {
    // CALL FAR 0xFFFF:0xFFFF with ImportedOrdinal(3, 42) at offset 1
    let record = RelocationRecord {
        offset: 1,
        target: RelocationTarget::ImportedOrdinal {
            import: 3,
            ordinal: 42,
        },
    };
    let mut vm =
        setup_with_relocations(&[0x9A, 0xFF, 0xFF, 0xFF, 0xFF, 0x40], vec![record]);
    exec(&mut vm);
    // Resumes right after the 5-byte CALL.
    assert_eq!(vm.cpu.registers.ip, 5);
    assert_eq!(*vm.host.invokes.borrow(), vec![(3, 42)]);
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.ax.word(), 1);
}

#[test]
fn far_call_sentinel_without_record_faults() {
    let mut vm = setup(&[0x9A, 0xFF, 0xFF, 0xFF, 0xFF]);
    assert!(matches!(
        vm.cpu.tick(),
        Err(CpuFault::RelocationMissing { segment: CODE, offset: 1 })
    ));
}

#[test]
fn far_call_through_internal_relocation_branches() {
    // CALL FAR 0xFFFF:0xFFFF patched to 0001:0006
    let record = RelocationRecord {
        offset: 1,
        target: RelocationTarget::InternalRef(FarPtr::new(CODE, 0x0006)),
    };
    let mut vm = setup_with_relocations(
        &[0x9A, 0xFF, 0xFF, 0xFF, 0xFF, 0xF4, 0xCB],
        vec![record],
    );
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.cs, CODE);
    assert_eq!(vm.cpu.registers.ip, 6);
    exec(&mut vm); // RETF
    assert_eq!(vm.cpu.registers.ip, 5);
}

#[test]
fn relocated_memory_word_read() {
    // MOV AX,[0x100] where DS:0x100 holds the sentinel and a record exists
    let mut vm = setup(&[0xA1, 0x00, 0x01]);
    {
        let mut memory = vm.cpu.memory().borrow_mut();
        memory.set_word(DATA, 0x100, 0xFFFF).unwrap();
    }
    // Re-register the data segment with a relocation at 0x100.
    vm.cpu.memory().borrow_mut().add_segment(
        DATA,
        SegmentKind::Data,
        &{
            let mut image = vec![0u8; 0x102];
            image[0x100] = 0xFF;
            image[0x101] = 0xFF;
            image
        },
        vec![RelocationRecord {
            offset: 0x100,
            target: RelocationTarget::InternalRef(FarPtr::new(9, 0x4321)),
        }],
    );
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.ax.word(), 0x4321);
}

#[test]
fn unsupported_mnemonic_faults() {
    // VMCALL (0F 01 C1) is far outside the supported set
    let mut vm = setup(&[0x0F, 0x01, 0xC1]);
    assert!(matches!(
        vm.cpu.tick(),
        Err(CpuFault::UnsupportedMnemonic(_))
    ));
}

// ========================================================================
// X87 THROUGH THE DISPATCHER
// ========================================================================

fn set_data_f32(vm: &Vm, offset: u16, v: f32) {
    vm.cpu
        .memory()
        .borrow_mut()
        .set_dword(DATA, offset, v.to_bits())
        .unwrap();
}

#[test]
fn fld_fmul_m32() {
    // FLD DWORD [0x200]; FMUL DWORD [0x204]  (D9 06 00 02, D8 0E 04 02)
    let mut vm = setup(&[0xD9, 0x06, 0x00, 0x02, 0xD8, 0x0E, 0x04, 0x02]);
    set_data_f32(&vm, 0x200, 10.0);
    set_data_f32(&vm, 0x204, 2.5);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.fpu.st(0), Some(25.0));
}

#[test]
fn fld_fstp_m32_round_trip() {
    // FLD DWORD [0x200]; FSTP DWORD [0x208]  (D9 1E 08 02)
    let mut vm = setup(&[0xD9, 0x06, 0x00, 0x02, 0xD9, 0x1E, 0x08, 0x02]);
    set_data_f32(&vm, 0x200, -2.5);
    exec_n(&mut vm, 2);
    let bits = vm.cpu.memory().borrow().get_dword(DATA, 0x208).unwrap();
    assert_eq!(f32::from_bits(bits), -2.5);
    assert_eq!(vm.cpu.registers.fpu.st(0), None); // popped
}

#[test]
fn fild_fistp_m16() {
    // FILD WORD [0x200]; FISTP WORD [0x204]  (DF 06 00 02, DF 1E 04 02)
    let mut vm = setup(&[0xDF, 0x06, 0x00, 0x02, 0xDF, 0x1E, 0x04, 0x02]);
    set_data_word(&vm, 0x200, 0xFFF6); // -10
    exec_n(&mut vm, 2);
    assert_eq!(data_word(&vm, 0x204), 0xFFF6);
}

#[test]
fn fadd_st0_st1() {
    // FLD1; FLDPI; FADD ST(0),ST(1)  (D9 E8 D9 EB D8 C1)
    let mut vm = setup(&[0xD9, 0xE8, 0xD9, 0xEB, 0xD8, 0xC1]);
    exec_n(&mut vm, 3);
    let st0 = vm.cpu.registers.fpu.st(0).unwrap();
    assert!((st0 - (std::f64::consts::PI + 1.0)).abs() < 1e-12);
}

#[test]
fn faddp_pops_after_store() {
    // FLD1; FLD1; FADDP  (DE C1)
    let mut vm = setup(&[0xD9, 0xE8, 0xD9, 0xE8, 0xDE, 0xC1]);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.fpu.st(0), Some(2.0));
    assert_eq!(vm.cpu.registers.fpu.st(1), None);
}

#[test]
fn fchs_fabs() {
    // FLD1; FCHS; FABS  (D9 E0, D9 E1)
    let mut vm = setup(&[0xD9, 0xE8, 0xD9, 0xE0, 0xD9, 0xE1]);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.fpu.st(0), Some(-1.0));
    exec(&mut vm);
    assert_eq!(vm.cpu.registers.fpu.st(0), Some(1.0));
}

#[test]
fn fsqrt_of_constant() {
    // FLD DWORD [0x200]=9.0; FSQRT  (D9 FA)
    let mut vm = setup(&[0xD9, 0x06, 0x00, 0x02, 0xD9, 0xFA]);
    set_data_f32(&vm, 0x200, 9.0);
    exec_n(&mut vm, 2);
    assert_eq!(vm.cpu.registers.fpu.st(0), Some(3.0));
}

#[test]
fn fnstsw_ax_reports_condition_codes() {
    // FLD1; FTST; FNSTSW AX  (D9 E4, DF E0)
    let mut vm = setup(&[0xD9, 0xE8, 0xD9, 0xE4, 0xDF, 0xE0]);
    exec_n(&mut vm, 3);
    // 1.0 > 0.0: C3=C2=C0=0
    assert_eq!(vm.cpu.registers.ax.word() & 0x4500, 0);
}

#[test]
fn fldcw_fnstcw_round_trip() {
    // FLDCW [0x200]; FNSTCW [0x202]  (D9 2E 00 02, D9 3E 02 02)
    let mut vm = setup(&[0xD9, 0x2E, 0x00, 0x02, 0xD9, 0x3E, 0x02, 0x02]);
    set_data_word(&vm, 0x200, 0x0F7F);
    exec_n(&mut vm, 2);
    assert_eq!(data_word(&vm, 0x202), 0x0F7F);
}

#[test]
fn fxch_swaps_top_two() {
    // FLD1; FLDZ; FXCH  (D9 C9)
    let mut vm = setup(&[0xD9, 0xE8, 0xD9, 0xEE, 0xD9, 0xC9]);
    exec_n(&mut vm, 3);
    assert_eq!(vm.cpu.registers.fpu.st(0), Some(1.0));
    assert_eq!(vm.cpu.registers.fpu.st(1), Some(0.0));
}

#[test]
fn fcompp_compares_and_clears_stack() {
    // FLD1; FLDZ; FCOMPP  (DE D9): ST(0)=0 < ST(1)=1 -> C0 set
    let mut vm = setup(&[0xD9, 0xE8, 0xD9, 0xEE, 0xDE, 0xD9]);
    exec_n(&mut vm, 3);
    assert_ne!(vm.cpu.registers.fpu.status_word() & 0x0100, 0);
    assert_eq!(vm.cpu.registers.fpu.st(0), None);
}
