//! Lowering decoded blocks into wasm functions and assembling the
//! per-region module with its dispatch function.

use arena::state::{freg_offset, xreg_offset};
use rvdec::{Block, Instr, Op, Region, REGION_SIZE};
use rustc_hash::FxHashMap;

use crate::abi;
use crate::insts::{BlockType, ValType, WasmInst};
use crate::module::{FuncBody, LocalAlloc, ModuleBuilder};
use crate::passes::run_peephole;
use crate::regcache::block_liveness;
use crate::{Error, Result, Tier};

pub struct TranslatedRegion {
    pub base: u64,
    pub wasm: Vec<u8>,
    pub block_count: usize,
}

/// True when the translator can lower this op. Anything else truncates
/// the block; the interpreter picks up at the untranslated instruction.
fn translatable(op: Op) -> bool {
    use Op::*;
    !matches!(
        op,
        Mulh | Mulhsu
            | Mulhu
            | Csrrw
            | Csrrs
            | Csrrc
            | Csrrwi
            | Csrrsi
            | Csrrci
            | LrW
            | LrD
            | ScW
            | ScD
            | AmoSwapW
            | AmoSwapD
            | AmoAddW
            | AmoAddD
            | AmoXorW
            | AmoXorD
            | AmoAndW
            | AmoAndD
            | AmoOrW
            | AmoOrD
            | AmoMinW
            | AmoMinD
            | AmoMaxW
            | AmoMaxD
            | AmoMinuW
            | AmoMinuD
            | AmoMaxuW
            | AmoMaxuD
            | FaddS
            | FsubS
            | FmulS
            | FdivS
            | FsqrtS
            | FminS
            | FmaxS
            | FminD
            | FmaxD
            | FmaddS
            | FmsubS
            | FnmsubS
            | FnmaddS
            | FmaddD
            | FmsubD
            | FnmsubD
            | FnmaddD
            | FsgnjS
            | FsgnjnS
            | FsgnjxS
            | FeqS
            | FltS
            | FleS
            | FclassS
            | FclassD
            | FcvtWS
            | FcvtWuS
            | FcvtLS
            | FcvtLuS
            | FcvtSW
            | FcvtSWu
            | FcvtSL
            | FcvtSLu
            | FcvtWD
            | FcvtWuD
            | FcvtLD
            | FcvtLuD
            | FcvtDW
            | FcvtDWu
            | FcvtDL
            | FcvtDLu
            | FcvtSD
            | FcvtDS
            | FmvXW
            | FmvWX
    )
}

enum RegMode {
    /// Every register access is linear-memory traffic.
    Memory,
    /// Used x-registers live in locals; live-ins loaded by the prologue,
    /// writes flushed by the epilogue.
    Cached { map: FxHashMap<u8, u32> },
}

struct BlockCx {
    out: Vec<WasmInst>,
    mode: RegMode,
    locals: LocalAlloc,
    scratch_v: u32,
    scratch_a: Option<u32>,
    scratch_b: Option<u32>,
    scratch_wa: Option<u32>,
    scratch_wb: Option<u32>,
    scratch_f: Option<u32>,
}

impl BlockCx {
    fn new(mode: RegMode, locals: LocalAlloc, scratch_v: u32) -> BlockCx {
        BlockCx {
            out: Vec::new(),
            mode,
            locals,
            scratch_v,
            scratch_a: None,
            scratch_b: None,
            scratch_wa: None,
            scratch_wb: None,
            scratch_f: None,
        }
    }

    fn scratch_a(&mut self) -> u32 {
        if self.scratch_a.is_none() {
            self.scratch_a = Some(self.locals.alloc(ValType::I64));
        }
        self.scratch_a.unwrap()
    }

    fn scratch_b(&mut self) -> u32 {
        if self.scratch_b.is_none() {
            self.scratch_b = Some(self.locals.alloc(ValType::I64));
        }
        self.scratch_b.unwrap()
    }

    fn scratch_wa(&mut self) -> u32 {
        if self.scratch_wa.is_none() {
            self.scratch_wa = Some(self.locals.alloc(ValType::I32));
        }
        self.scratch_wa.unwrap()
    }

    fn scratch_wb(&mut self) -> u32 {
        if self.scratch_wb.is_none() {
            self.scratch_wb = Some(self.locals.alloc(ValType::I32));
        }
        self.scratch_wb.unwrap()
    }

    fn scratch_f(&mut self) -> u32 {
        if self.scratch_f.is_none() {
            self.scratch_f = Some(self.locals.alloc(ValType::F64));
        }
        self.scratch_f.unwrap()
    }

    /// Pushes the i64 value of integer register `r`.
    fn read_x(&mut self, r: u8) {
        if r == 0 {
            self.out.push(WasmInst::I64Const(0));
            return;
        }
        match &self.mode {
            RegMode::Cached { map } => self.out.push(WasmInst::LocalGet(map[&r])),
            RegMode::Memory => self.emit_mem_load(xreg_offset(r) as i32),
        }
    }

    /// Consumes an i64 from the stack into integer register `r`.
    fn write_x(&mut self, r: u8) {
        if r == 0 {
            self.out.push(WasmInst::Drop);
            return;
        }
        match &self.mode {
            RegMode::Cached { map } => self.out.push(WasmInst::LocalSet(map[&r])),
            RegMode::Memory => {
                let off = xreg_offset(r) as i32;
                self.emit_mem_store(off);
            }
        }
    }

    /// Register write that bypasses the local cache; used for terminator
    /// writes after the epilogue has already flushed.
    fn write_x_direct(&mut self, r: u8) {
        if r == 0 {
            self.out.push(WasmInst::Drop);
            return;
        }
        self.emit_mem_store(xreg_offset(r) as i32);
    }

    fn emit_mem_load(&mut self, off: i32) {
        self.out.extend([
            WasmInst::LocalGet(0),
            WasmInst::I32Const(off),
            WasmInst::I32Add,
            WasmInst::I64Load { offset: 0 },
        ]);
    }

    /// Canonical store form: value first through the scratch so the five
    /// address/store instructions stay contiguous for the peephole passes.
    fn emit_mem_store(&mut self, off: i32) {
        let sv = self.scratch_v;
        self.out.extend([
            WasmInst::LocalSet(sv),
            WasmInst::LocalGet(0),
            WasmInst::I32Const(off),
            WasmInst::I32Add,
            WasmInst::LocalGet(sv),
            WasmInst::I64Store { offset: 0 },
        ]);
    }

    /// Pushes the raw i64 bits of FP register `r`. FP registers are never
    /// cached in locals.
    fn read_f_bits(&mut self, r: u8) {
        self.out.extend([
            WasmInst::LocalGet(0),
            WasmInst::I32Const(freg_offset(r) as i32),
            WasmInst::I32Add,
            WasmInst::I64Load { offset: 0 },
        ]);
    }

    fn write_f_bits(&mut self, r: u8) {
        let sv = self.scratch_v;
        self.out.extend([
            WasmInst::LocalSet(sv),
            WasmInst::LocalGet(0),
            WasmInst::I32Const(freg_offset(r) as i32),
            WasmInst::I32Add,
            WasmInst::LocalGet(sv),
            WasmInst::I64Store { offset: 0 },
        ]);
    }

    fn read_f64(&mut self, r: u8) {
        self.out.extend([
            WasmInst::LocalGet(0),
            WasmInst::I32Const(freg_offset(r) as i32),
            WasmInst::I32Add,
            WasmInst::F64Load { offset: 0 },
        ]);
    }

    fn write_f64(&mut self, r: u8) {
        let sf = self.scratch_f();
        self.out.extend([
            WasmInst::LocalSet(sf),
            WasmInst::LocalGet(0),
            WasmInst::I32Const(freg_offset(r) as i32),
            WasmInst::I32Add,
            WasmInst::LocalGet(sf),
            WasmInst::F64Store { offset: 0 },
        ]);
    }

    /// Pushes the i32 guest address `rs1 + imm`.
    fn guest_addr(&mut self, instr: &Instr) {
        self.read_x(instr.rs1);
        if instr.imm != 0 {
            self.out.push(WasmInst::I64Const(instr.imm));
            self.out.push(WasmInst::I64Add);
        }
        self.out.push(WasmInst::I32WrapI64);
    }
}

fn alu_binop(cx: &mut BlockCx, i: &Instr, op: WasmInst) {
    cx.read_x(i.rs1);
    cx.read_x(i.rs2);
    cx.out.push(op);
    cx.write_x(i.rd);
}

fn alu_imm(cx: &mut BlockCx, i: &Instr, op: WasmInst) {
    cx.read_x(i.rs1);
    cx.out.push(WasmInst::I64Const(i.imm));
    cx.out.push(op);
    cx.write_x(i.rd);
}

fn alu_binop_w(cx: &mut BlockCx, i: &Instr, op: WasmInst) {
    cx.read_x(i.rs1);
    cx.out.push(WasmInst::I32WrapI64);
    cx.read_x(i.rs2);
    cx.out.push(WasmInst::I32WrapI64);
    cx.out.push(op);
    cx.out.push(WasmInst::I64ExtendI32S);
    cx.write_x(i.rd);
}

fn cmp_to_reg(cx: &mut BlockCx, i: &Instr, rhs_imm: Option<i64>, op: WasmInst) {
    cx.read_x(i.rs1);
    match rhs_imm {
        Some(imm) => cx.out.push(WasmInst::I64Const(imm)),
        None => cx.read_x(i.rs2),
    }
    cx.out.push(op);
    cx.out.push(WasmInst::I64ExtendI32U);
    cx.write_x(i.rd);
}

/// Signed 64-bit division/remainder with RISC-V edge semantics: divide by
/// zero yields all-ones (div) or the dividend (rem); MIN/-1 yields the
/// dividend (div) or zero (rem). Wasm traps on both, so guard explicitly.
fn div_i64(cx: &mut BlockCx, i: &Instr, is_rem: bool, signed: bool) {
    let a = cx.scratch_a();
    let b = cx.scratch_b();
    cx.read_x(i.rs1);
    cx.out.push(WasmInst::LocalSet(a));
    cx.read_x(i.rs2);
    cx.out.push(WasmInst::LocalSet(b));

    cx.out.push(WasmInst::LocalGet(b));
    cx.out.push(WasmInst::I64Eqz);
    cx.out.push(WasmInst::If(BlockType::Value(ValType::I64)));
    if is_rem {
        cx.out.push(WasmInst::LocalGet(a));
    } else {
        cx.out.push(WasmInst::I64Const(-1));
    }
    cx.out.push(WasmInst::Else);
    if signed {
        cx.out.push(WasmInst::LocalGet(a));
        cx.out.push(WasmInst::I64Const(i64::MIN));
        cx.out.push(WasmInst::I64Eq);
        cx.out.push(WasmInst::LocalGet(b));
        cx.out.push(WasmInst::I64Const(-1));
        cx.out.push(WasmInst::I64Eq);
        cx.out.push(WasmInst::I32And);
        cx.out.push(WasmInst::If(BlockType::Value(ValType::I64)));
        if is_rem {
            cx.out.push(WasmInst::I64Const(0));
        } else {
            cx.out.push(WasmInst::LocalGet(a));
        }
        cx.out.push(WasmInst::Else);
    }
    cx.out.push(WasmInst::LocalGet(a));
    cx.out.push(WasmInst::LocalGet(b));
    cx.out.push(match (is_rem, signed) {
        (false, true) => WasmInst::I64DivS,
        (false, false) => WasmInst::I64DivU,
        (true, true) => WasmInst::I64RemS,
        (true, false) => WasmInst::I64RemU,
    });
    if signed {
        cx.out.push(WasmInst::End);
    }
    cx.out.push(WasmInst::End);
    cx.write_x(i.rd);
}

/// 32-bit variant; result sign-extends to 64 bits.
fn div_i32(cx: &mut BlockCx, i: &Instr, is_rem: bool, signed: bool) {
    let a = cx.scratch_wa();
    let b = cx.scratch_wb();
    cx.read_x(i.rs1);
    cx.out.push(WasmInst::I32WrapI64);
    cx.out.push(WasmInst::LocalSet(a));
    cx.read_x(i.rs2);
    cx.out.push(WasmInst::I32WrapI64);
    cx.out.push(WasmInst::LocalSet(b));

    cx.out.push(WasmInst::LocalGet(b));
    cx.out.push(WasmInst::I32Eqz);
    cx.out.push(WasmInst::If(BlockType::Value(ValType::I32)));
    if is_rem {
        cx.out.push(WasmInst::LocalGet(a));
    } else {
        cx.out.push(WasmInst::I32Const(-1));
    }
    cx.out.push(WasmInst::Else);
    if signed {
        cx.out.push(WasmInst::LocalGet(a));
        cx.out.push(WasmInst::I32Const(i32::MIN));
        cx.out.push(WasmInst::I32Eq);
        cx.out.push(WasmInst::LocalGet(b));
        cx.out.push(WasmInst::I32Const(-1));
        cx.out.push(WasmInst::I32Eq);
        cx.out.push(WasmInst::I32And);
        cx.out.push(WasmInst::If(BlockType::Value(ValType::I32)));
        if is_rem {
            cx.out.push(WasmInst::I32Const(0));
        } else {
            cx.out.push(WasmInst::LocalGet(a));
        }
        cx.out.push(WasmInst::Else);
    }
    cx.out.push(WasmInst::LocalGet(a));
    cx.out.push(WasmInst::LocalGet(b));
    cx.out.push(match (is_rem, signed) {
        (false, true) => WasmInst::I32DivS,
        (false, false) => WasmInst::I32DivU,
        (true, true) => WasmInst::I32RemS,
        (true, false) => WasmInst::I32RemU,
    });
    if signed {
        cx.out.push(WasmInst::End);
    }
    cx.out.push(WasmInst::End);
    cx.out.push(WasmInst::I64ExtendI32S);
    cx.write_x(i.rd);
}

/// Emits the straight-line lowering for one non-terminator instruction.
fn emit_instr(cx: &mut BlockCx, pc: u64, i: &Instr) {
    use Op::*;
    match i.op {
        Lui => {
            cx.out.push(WasmInst::I64Const(i.imm));
            cx.write_x(i.rd);
        }
        Auipc => {
            cx.out.push(WasmInst::I64Const(pc as i64 + i.imm));
            cx.write_x(i.rd);
        }

        Addi => alu_imm(cx, i, WasmInst::I64Add),
        Xori => alu_imm(cx, i, WasmInst::I64Xor),
        Ori => alu_imm(cx, i, WasmInst::I64Or),
        Andi => alu_imm(cx, i, WasmInst::I64And),
        Slli => alu_imm(cx, i, WasmInst::I64Shl),
        Srli => alu_imm(cx, i, WasmInst::I64ShrU),
        Srai => alu_imm(cx, i, WasmInst::I64ShrS),
        Slti => cmp_to_reg(cx, i, Some(i.imm), WasmInst::I64LtS),
        Sltiu => cmp_to_reg(cx, i, Some(i.imm), WasmInst::I64LtU),

        Add => alu_binop(cx, i, WasmInst::I64Add),
        Sub => alu_binop(cx, i, WasmInst::I64Sub),
        Sll => alu_binop(cx, i, WasmInst::I64Shl),
        Srl => alu_binop(cx, i, WasmInst::I64ShrU),
        Sra => alu_binop(cx, i, WasmInst::I64ShrS),
        Xor => alu_binop(cx, i, WasmInst::I64Xor),
        Or => alu_binop(cx, i, WasmInst::I64Or),
        And => alu_binop(cx, i, WasmInst::I64And),
        Slt => cmp_to_reg(cx, i, None, WasmInst::I64LtS),
        Sltu => cmp_to_reg(cx, i, None, WasmInst::I64LtU),
        Mul => alu_binop(cx, i, WasmInst::I64Mul),

        Addiw => {
            cx.read_x(i.rs1);
            cx.out.push(WasmInst::I64Const(i.imm));
            cx.out.push(WasmInst::I64Add);
            cx.out.push(WasmInst::I32WrapI64);
            cx.out.push(WasmInst::I64ExtendI32S);
            cx.write_x(i.rd);
        }
        Slliw => {
            cx.read_x(i.rs1);
            cx.out.push(WasmInst::I32WrapI64);
            cx.out.push(WasmInst::I32Const(i.imm as i32));
            cx.out.push(WasmInst::I32Shl);
            cx.out.push(WasmInst::I64ExtendI32S);
            cx.write_x(i.rd);
        }
        Srliw => {
            cx.read_x(i.rs1);
            cx.out.push(WasmInst::I32WrapI64);
            cx.out.push(WasmInst::I32Const(i.imm as i32));
            cx.out.push(WasmInst::I32ShrU);
            cx.out.push(WasmInst::I64ExtendI32S);
            cx.write_x(i.rd);
        }
        Sraiw => {
            cx.read_x(i.rs1);
            cx.out.push(WasmInst::I32WrapI64);
            cx.out.push(WasmInst::I32Const(i.imm as i32));
            cx.out.push(WasmInst::I32ShrS);
            cx.out.push(WasmInst::I64ExtendI32S);
            cx.write_x(i.rd);
        }
        Addw => alu_binop_w(cx, i, WasmInst::I32Add),
        Subw => alu_binop_w(cx, i, WasmInst::I32Sub),
        Sllw => alu_binop_w(cx, i, WasmInst::I32Shl),
        Srlw => alu_binop_w(cx, i, WasmInst::I32ShrU),
        Sraw => alu_binop_w(cx, i, WasmInst::I32ShrS),
        Mulw => alu_binop_w(cx, i, WasmInst::I32Mul),

        Div => div_i64(cx, i, false, true),
        Divu => div_i64(cx, i, false, false),
        Rem => div_i64(cx, i, true, true),
        Remu => div_i64(cx, i, true, false),
        Divw => div_i32(cx, i, false, true),
        Divuw => div_i32(cx, i, false, false),
        Remw => div_i32(cx, i, true, true),
        Remuw => div_i32(cx, i, true, false),

        Lb => {
            cx.guest_addr(i);
            cx.out.push(WasmInst::I64Load8S { offset: 0 });
            cx.write_x(i.rd);
        }
        Lbu => {
            cx.guest_addr(i);
            cx.out.push(WasmInst::I64Load8U { offset: 0 });
            cx.write_x(i.rd);
        }
        Lh => {
            cx.guest_addr(i);
            cx.out.push(WasmInst::I64Load16S { offset: 0 });
            cx.write_x(i.rd);
        }
        Lhu => {
            cx.guest_addr(i);
            cx.out.push(WasmInst::I64Load16U { offset: 0 });
            cx.write_x(i.rd);
        }
        Lw => {
            cx.guest_addr(i);
            cx.out.push(WasmInst::I64Load32S { offset: 0 });
            cx.write_x(i.rd);
        }
        Lwu => {
            cx.guest_addr(i);
            cx.out.push(WasmInst::I64Load32U { offset: 0 });
            cx.write_x(i.rd);
        }
        Ld => {
            cx.guest_addr(i);
            cx.out.push(WasmInst::I64Load { offset: 0 });
            cx.write_x(i.rd);
        }

        Sb => {
            cx.guest_addr(i);
            cx.read_x(i.rs2);
            cx.out.push(WasmInst::I64Store8 { offset: 0 });
        }
        Sh => {
            cx.guest_addr(i);
            cx.read_x(i.rs2);
            cx.out.push(WasmInst::I64Store16 { offset: 0 });
        }
        Sw => {
            cx.guest_addr(i);
            cx.read_x(i.rs2);
            cx.out.push(WasmInst::I64Store32 { offset: 0 });
        }
        Sd => {
            cx.guest_addr(i);
            cx.read_x(i.rs2);
            cx.out.push(WasmInst::I64Store { offset: 0 });
        }

        // Memory ordering is trivially preserved by single-threaded
        // dispatch; fences lower to nothing.
        Fence | FenceI => {}

        Flw => {
            cx.guest_addr(i);
            cx.out.push(WasmInst::I64Load32U { offset: 0 });
            // NaN-box the single into the high bits.
            cx.out.push(WasmInst::I64Const(-1i64 << 32));
            cx.out.push(WasmInst::I64Or);
            cx.write_f_bits(i.rd);
        }
        Fld => {
            cx.guest_addr(i);
            cx.out.push(WasmInst::I64Load { offset: 0 });
            cx.write_f_bits(i.rd);
        }
        Fsw => {
            cx.guest_addr(i);
            cx.read_f_bits(i.rs2);
            cx.out.push(WasmInst::I64Store32 { offset: 0 });
        }
        Fsd => {
            cx.guest_addr(i);
            cx.read_f_bits(i.rs2);
            cx.out.push(WasmInst::I64Store { offset: 0 });
        }

        FaddD | FsubD | FmulD | FdivD => {
            cx.read_f64(i.rs1);
            cx.read_f64(i.rs2);
            cx.out.push(match i.op {
                FaddD => WasmInst::F64Add,
                FsubD => WasmInst::F64Sub,
                FmulD => WasmInst::F64Mul,
                _ => WasmInst::F64Div,
            });
            cx.write_f64(i.rd);
        }
        FsqrtD => {
            cx.read_f64(i.rs1);
            cx.out.push(WasmInst::F64Sqrt);
            cx.write_f64(i.rd);
        }
        FsgnjD => {
            cx.read_f64(i.rs1);
            cx.read_f64(i.rs2);
            cx.out.push(WasmInst::F64Copysign);
            cx.write_f64(i.rd);
        }
        FsgnjnD => {
            cx.read_f64(i.rs1);
            cx.read_f64(i.rs2);
            cx.out.push(WasmInst::F64Neg);
            cx.out.push(WasmInst::F64Copysign);
            cx.write_f64(i.rd);
        }
        FsgnjxD => {
            // Sign-bit xor on the raw encodings.
            cx.read_f_bits(i.rs1);
            cx.read_f_bits(i.rs2);
            cx.out.push(WasmInst::I64Const(i64::MIN));
            cx.out.push(WasmInst::I64And);
            cx.out.push(WasmInst::I64Xor);
            cx.write_f_bits(i.rd);
        }
        FeqD | FltD | FleD => {
            cx.read_f64(i.rs1);
            cx.read_f64(i.rs2);
            cx.out.push(match i.op {
                FeqD => WasmInst::F64Eq,
                FltD => WasmInst::F64Lt,
                _ => WasmInst::F64Le,
            });
            cx.out.push(WasmInst::I64ExtendI32U);
            cx.write_x(i.rd);
        }
        FmvXD => {
            cx.read_f_bits(i.rs1);
            cx.write_x(i.rd);
        }
        FmvDX => {
            cx.read_x(i.rs1);
            cx.write_f_bits(i.rd);
        }

        _ => unreachable!("untranslatable op reached emit_instr: {:?}", i.op),
    }
}

/// Flushes cached registers back to the state window.
fn emit_epilogue(cx: &mut BlockCx, writes: &[u8]) {
    if let RegMode::Cached { map } = &cx.mode {
        let map = map.clone();
        for &r in writes {
            cx.out.extend([
                WasmInst::LocalGet(0),
                WasmInst::I32Const(xreg_offset(r) as i32),
                WasmInst::I32Add,
                WasmInst::LocalGet(map[&r]),
                WasmInst::I64Store { offset: 0 },
            ]);
        }
    }
}

fn ret_pc(cx: &mut BlockCx, pc: u64) {
    cx.out.push(WasmInst::I32Const(pc as u32 as i32));
    cx.out.push(WasmInst::Return);
}

/// Emits the terminator. Registers it writes go straight to memory; the
/// epilogue has already run.
fn emit_terminator(cx: &mut BlockCx, pc: u64, i: &Instr) {
    use Op::*;
    match i.op {
        Jal => {
            if i.rd != 0 {
                cx.out.push(WasmInst::I64Const((pc + i.len as u64) as i64));
                cx.write_x_direct(i.rd);
            }
            ret_pc(cx, (pc as i64 + i.imm) as u64);
        }
        Jalr => {
            let t = cx.scratch_a();
            cx.read_x(i.rs1);
            cx.out.push(WasmInst::I64Const(i.imm));
            cx.out.push(WasmInst::I64Add);
            cx.out.push(WasmInst::I64Const(-2));
            cx.out.push(WasmInst::I64And);
            cx.out.push(WasmInst::LocalSet(t));
            if i.rd != 0 {
                cx.out.push(WasmInst::I64Const((pc + i.len as u64) as i64));
                cx.write_x_direct(i.rd);
            }
            cx.out.push(WasmInst::LocalGet(t));
            cx.out.push(WasmInst::I32WrapI64);
            cx.out.push(WasmInst::Return);
        }
        Beq | Bne | Blt | Bge | Bltu | Bgeu => {
            cx.read_x(i.rs1);
            cx.read_x(i.rs2);
            cx.out.push(match i.op {
                Beq => WasmInst::I64Eq,
                Bne => WasmInst::I64Ne,
                Blt => WasmInst::I64LtS,
                Bge => WasmInst::I64GeS,
                Bltu => WasmInst::I64LtU,
                _ => WasmInst::I64GeU,
            });
            cx.out.push(WasmInst::If(BlockType::Empty));
            ret_pc(cx, (pc as i64 + i.imm) as u64);
            cx.out.push(WasmInst::End);
            ret_pc(cx, pc + i.len as u64);
        }
        Ecall => {
            cx.out
                .push(WasmInst::I32Const((pc as u32 | abi::RET_SYSCALL_BIT) as i32));
            cx.out.push(WasmInst::Return);
        }
        // Ebreak and undecodable bytes surface as a plain next-pc; the
        // slot at that address is a miss stub, so the host falls back to
        // the interpreter to deal with them.
        Ebreak | Unknown => ret_pc(cx, pc),
        _ => unreachable!("non-terminator in emit_terminator: {:?}", i.op),
    }
}

/// Lowers one block. Returns `None` when nothing can be translated (the
/// block starts with an untranslatable instruction).
pub fn translate_block(block: &Block, tier: Tier) -> Option<FuncBody> {
    if block.instrs.is_empty() {
        return None;
    }
    let first = &block.instrs[0].1;
    if !translatable(first.op) && !rvdec::is_block_end(first.op) {
        return None;
    }
    if matches!(first.op, Op::Ebreak | Op::Unknown) {
        return None;
    }

    let mut locals = LocalAlloc::new(1);
    let scratch_v = locals.alloc(ValType::I64);

    let liveness = block_liveness(block);
    let mode = match tier {
        Tier::Optimized => {
            let mut map = FxHashMap::default();
            for &r in &liveness.used {
                map.insert(r, locals.alloc(ValType::I64));
            }
            RegMode::Cached { map }
        }
        _ => RegMode::Memory,
    };
    let mut cx = BlockCx::new(mode, locals, scratch_v);

    // Prologue: load live-in registers into their locals.
    if let RegMode::Cached { map } = &cx.mode {
        let map = map.clone();
        for &r in &liveness.live_in {
            cx.emit_mem_load(xreg_offset(r) as i32);
            cx.out.push(WasmInst::LocalSet(map[&r]));
        }
    }

    let last = block.instrs.len() - 1;
    let has_term = block.terminator().is_some();

    for (idx, (pc, instr)) in block.instrs.iter().enumerate() {
        let is_term = idx == last && has_term;
        if is_term {
            emit_epilogue(&mut cx, &liveness.writes);
            emit_terminator(&mut cx, *pc, instr);
            break;
        }
        if !translatable(instr.op) {
            // Truncate: hand the rest of the block to the interpreter.
            emit_epilogue(&mut cx, &liveness.writes);
            ret_pc(&mut cx, *pc);
            break;
        }
        emit_instr(&mut cx, *pc, instr);
        if idx == last {
            // Fell off the region boundary.
            emit_epilogue(&mut cx, &liveness.writes);
            ret_pc(&mut cx, *pc + instr.len as u64);
        }
    }

    let mut insts = cx.out;
    run_peephole(&mut insts, &mut cx.locals);

    Some(FuncBody {
        locals: cx.locals.types().to_vec(),
        insts,
    })
}

fn dispatch_body(base: u64) -> FuncBody {
    use WasmInst::*;
    let insts = vec![
        Loop(BlockType::Empty),
        // idx = pc - base; out of window means region miss.
        LocalGet(1),
        I32Const(base as u32 as i32),
        I32Sub,
        LocalTee(3),
        I32Const(REGION_SIZE as i32),
        I32GeU,
        If(BlockType::Empty),
        LocalGet(1),
        I32Const(abi::RET_MISS_BIT as i32),
        I32Or,
        Return,
        End,
        // ret = table[idx >> 1](state)
        LocalGet(0),
        LocalGet(3),
        I32Const(1),
        I32ShrU,
        CallIndirect { type_idx: 1, table: 0 },
        LocalSet(2),
        // Untranslated slot.
        LocalGet(2),
        I32Const(abi::MISS_SENTINEL),
        I32Eq,
        If(BlockType::Empty),
        LocalGet(1),
        I32Const(abi::RET_MISS_BIT as i32),
        I32Or,
        Return,
        End,
        // Halt.
        LocalGet(2),
        I32Const(abi::RET_HALT),
        I32Eq,
        If(BlockType::Empty),
        I32Const(abi::RET_HALT),
        Return,
        End,
        // Syscall: ask the host; it may continue us inline or take over.
        LocalGet(2),
        I32Const(abi::RET_SYSCALL_BIT as i32),
        I32And,
        If(BlockType::Empty),
        LocalGet(0),
        LocalGet(2),
        I32Const(0x7fff_ffff),
        I32And,
        Call(0),
        LocalTee(4),
        I32Const(abi::SYSCALL_ASYNC),
        I32Eq,
        If(BlockType::Empty),
        LocalGet(2),
        Return,
        End,
        LocalGet(4),
        I32Const(abi::RET_HALT),
        I32Eq,
        If(BlockType::Empty),
        I32Const(abi::RET_HALT),
        Return,
        End,
        LocalGet(4),
        LocalSet(1),
        Br(1),
        End,
        // Plain in-region transfer: keep dispatching.
        LocalGet(2),
        LocalSet(1),
        Br(0),
        End,
        Unreachable,
    ];
    FuncBody {
        locals: vec![ValType::I32, ValType::I32, ValType::I32],
        insts,
    }
}

/// Translates every translatable block of `region` into one wasm module.
pub fn translate_region(region: &Region, tier: Tier, mem_min_pages: u64) -> Result<TranslatedRegion> {
    if region.base >= abi::RET_MISS_BIT as u64 {
        return Err(Error::BaseTooHigh { base: region.base });
    }

    let mut builder = ModuleBuilder::new(mem_min_pages);
    let mut starts: Vec<u64> = region.blocks.keys().copied().collect();
    starts.sort_unstable();

    let mut count = 0usize;
    for start in starts {
        let block = &region.blocks[&start];
        if let Some(body) = translate_block(block, tier) {
            let idx = builder.push_block(body);
            builder.map_slot(((start - region.base) / 2) as u32, idx);
            count += 1;
        }
    }
    if count == 0 {
        return Err(Error::EmptyRegion { base: region.base });
    }

    let wasm = builder.build(dispatch_body(region.base));
    tracing::trace!(base = region.base, blocks = count, bytes = wasm.len(), "translated region");
    Ok(TranslatedRegion {
        base: region.base,
        wasm,
        block_count: count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvdec::{build_region, decode_block};

    fn asm(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn simple_block_translates_in_both_tiers() {
        // addi x5, x0, 7 ; add x6, x5, x5 ; jalr x0, 0(x1)
        let code = asm(&[0x0070_0293, 0x0052_8333, 0x0000_8067]);
        let block = decode_block(&code.as_slice(), 0, None);

        let baseline = translate_block(&block, Tier::Baseline).unwrap();
        assert!(baseline.insts.iter().any(|i| matches!(i, WasmInst::I64Store { .. })));

        let opt = translate_block(&block, Tier::Optimized).unwrap();
        // Cached tier ends with an epilogue store per written register
        // (x5, x6) before the return.
        let stores = opt
            .insts
            .iter()
            .filter(|i| matches!(i, WasmInst::I64Store { .. }))
            .count();
        assert_eq!(stores, 2);
    }

    #[test]
    fn branch_returns_both_targets() {
        // beq x5, x6, +12
        let code = asm(&[0x0062_8663]);
        let block = decode_block(&code.as_slice(), 0x100, None);
        let body = translate_block(&block, Tier::Baseline).unwrap();
        let consts: Vec<i32> = body
            .insts
            .iter()
            .filter_map(|i| match i {
                WasmInst::I32Const(v) => Some(*v),
                _ => None,
            })
            .collect();
        assert!(consts.contains(&(0x100 + 12)));
        assert!(consts.contains(&(0x100 + 4)));
    }

    #[test]
    fn ecall_encodes_the_syscall_marker() {
        let code = asm(&[0x0000_0073]);
        let block = decode_block(&code.as_slice(), 0x40, None);
        let body = translate_block(&block, Tier::Baseline).unwrap();
        let marker = (0x40u32 | abi::RET_SYSCALL_BIT) as i32;
        assert!(body.insts.contains(&WasmInst::I32Const(marker)));
    }

    #[test]
    fn amo_truncates_the_block() {
        // addi x5, x0, 1 ; amoadd.w x6, x5, (x7) ; jalr x0, 0(x1)
        let code = asm(&[0x0010_0293, 0x0053_a32f, 0x0000_8067]);
        let block = decode_block(&code.as_slice(), 0, None);
        let body = translate_block(&block, Tier::Baseline).unwrap();
        // Returns pc of the amo (4), not the jalr path.
        assert!(body.insts.contains(&WasmInst::I32Const(4)));
    }

    #[test]
    fn untranslatable_leader_yields_none() {
        let code = asm(&[0x0053_a32f]); // amoadd.w
        let block = decode_block(&code.as_slice(), 0, None);
        assert!(translate_block(&block, Tier::Baseline).is_none());
    }

    #[test]
    fn region_module_builds() {
        // Two blocks: entry falls into a loop body that returns.
        let code = asm(&[0x0070_0293, 0x0052_8333, 0x0000_8067]);
        let region = build_region(&code.as_slice(), 0, &[0]);
        let tr = translate_region(&region, Tier::Baseline, 1).unwrap();
        assert_eq!(&tr.wasm[0..4], b"\0asm");
        assert!(tr.block_count >= 1);
    }

    #[test]
    fn high_region_base_is_refused() {
        let code = asm(&[0x0000_8067]);
        let region = build_region(&code.as_slice(), 0, &[0]);
        let mut high = region;
        high.base = 0x5000_0000;
        assert!(matches!(
            translate_region(&high, Tier::Baseline, 1),
            Err(Error::BaseTooHigh { .. })
        ));
    }
}
