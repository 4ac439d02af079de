//! Instruction decoding: 32-bit base encodings and the 16-bit compressed
//! quadrants, the latter expanded to canonical ops.

use utils::bits::sign_extend;

use crate::{CodeReader, Instr, Op};

#[inline]
fn rd(inst: u32) -> u8 {
    ((inst >> 7) & 0x1f) as u8
}

#[inline]
fn rs1(inst: u32) -> u8 {
    ((inst >> 15) & 0x1f) as u8
}

#[inline]
fn rs2(inst: u32) -> u8 {
    ((inst >> 20) & 0x1f) as u8
}

#[inline]
fn funct3(inst: u32) -> u32 {
    (inst >> 12) & 7
}

#[inline]
fn funct7(inst: u32) -> u32 {
    inst >> 25
}

#[inline]
fn imm_i(inst: u32) -> i64 {
    sign_extend((inst >> 20) as u64, 12)
}

#[inline]
fn imm_s(inst: u32) -> i64 {
    sign_extend((((inst >> 25) << 5) | ((inst >> 7) & 0x1f)) as u64, 12)
}

#[inline]
fn imm_b(inst: u32) -> i64 {
    let imm = ((inst >> 31) << 12)
        | (((inst >> 7) & 1) << 11)
        | (((inst >> 25) & 0x3f) << 5)
        | (((inst >> 8) & 0xf) << 1);
    sign_extend(imm as u64, 13)
}

#[inline]
fn imm_u(inst: u32) -> i64 {
    sign_extend((inst & 0xffff_f000) as u64, 32)
}

#[inline]
fn imm_j(inst: u32) -> i64 {
    let imm = ((inst >> 31) << 20)
        | (((inst >> 12) & 0xff) << 12)
        | (((inst >> 20) & 1) << 11)
        | (((inst >> 21) & 0x3ff) << 1);
    sign_extend(imm as u64, 21)
}

fn instr(op: Op, rd: u8, rs1: u8, rs2: u8, imm: i64, len: u8) -> Instr {
    Instr { op, rd, rs1, rs2, rs3: 0, imm, len }
}

/// Decodes one 32-bit encoding. Returns `Op::Unknown` for anything outside
/// RV64GC rather than failing, so block building can stop gracefully.
pub fn decode_u32(inst: u32) -> Instr {
    let op = inst & 0x7f;
    match op {
        0x37 => instr(Op::Lui, rd(inst), 0, 0, imm_u(inst), 4),
        0x17 => instr(Op::Auipc, rd(inst), 0, 0, imm_u(inst), 4),
        0x6f => instr(Op::Jal, rd(inst), 0, 0, imm_j(inst), 4),
        0x67 if funct3(inst) == 0 => instr(Op::Jalr, rd(inst), rs1(inst), 0, imm_i(inst), 4),
        0x63 => {
            let op = match funct3(inst) {
                0 => Op::Beq,
                1 => Op::Bne,
                4 => Op::Blt,
                5 => Op::Bge,
                6 => Op::Bltu,
                7 => Op::Bgeu,
                _ => return Instr::unknown(),
            };
            instr(op, 0, rs1(inst), rs2(inst), imm_b(inst), 4)
        }
        0x03 => {
            let op = match funct3(inst) {
                0 => Op::Lb,
                1 => Op::Lh,
                2 => Op::Lw,
                3 => Op::Ld,
                4 => Op::Lbu,
                5 => Op::Lhu,
                6 => Op::Lwu,
                _ => return Instr::unknown(),
            };
            instr(op, rd(inst), rs1(inst), 0, imm_i(inst), 4)
        }
        0x23 => {
            let op = match funct3(inst) {
                0 => Op::Sb,
                1 => Op::Sh,
                2 => Op::Sw,
                3 => Op::Sd,
                _ => return Instr::unknown(),
            };
            instr(op, 0, rs1(inst), rs2(inst), imm_s(inst), 4)
        }
        0x13 => match funct3(inst) {
            0 => instr(Op::Addi, rd(inst), rs1(inst), 0, imm_i(inst), 4),
            2 => instr(Op::Slti, rd(inst), rs1(inst), 0, imm_i(inst), 4),
            3 => instr(Op::Sltiu, rd(inst), rs1(inst), 0, imm_i(inst), 4),
            4 => instr(Op::Xori, rd(inst), rs1(inst), 0, imm_i(inst), 4),
            6 => instr(Op::Ori, rd(inst), rs1(inst), 0, imm_i(inst), 4),
            7 => instr(Op::Andi, rd(inst), rs1(inst), 0, imm_i(inst), 4),
            1 if funct7(inst) >> 1 == 0 => {
                instr(Op::Slli, rd(inst), rs1(inst), 0, ((inst >> 20) & 0x3f) as i64, 4)
            }
            5 => {
                let shamt = ((inst >> 20) & 0x3f) as i64;
                match funct7(inst) >> 1 {
                    0x00 => instr(Op::Srli, rd(inst), rs1(inst), 0, shamt, 4),
                    0x10 => instr(Op::Srai, rd(inst), rs1(inst), 0, shamt, 4),
                    _ => Instr::unknown(),
                }
            }
            _ => Instr::unknown(),
        },
        0x1b => match funct3(inst) {
            0 => instr(Op::Addiw, rd(inst), rs1(inst), 0, imm_i(inst), 4),
            1 if funct7(inst) == 0 => {
                instr(Op::Slliw, rd(inst), rs1(inst), 0, ((inst >> 20) & 0x1f) as i64, 4)
            }
            5 => {
                let shamt = ((inst >> 20) & 0x1f) as i64;
                match funct7(inst) {
                    0x00 => instr(Op::Srliw, rd(inst), rs1(inst), 0, shamt, 4),
                    0x20 => instr(Op::Sraiw, rd(inst), rs1(inst), 0, shamt, 4),
                    _ => Instr::unknown(),
                }
            }
            _ => Instr::unknown(),
        },
        0x33 => {
            let op = match (funct7(inst), funct3(inst)) {
                (0x00, 0) => Op::Add,
                (0x20, 0) => Op::Sub,
                (0x00, 1) => Op::Sll,
                (0x00, 2) => Op::Slt,
                (0x00, 3) => Op::Sltu,
                (0x00, 4) => Op::Xor,
                (0x00, 5) => Op::Srl,
                (0x20, 5) => Op::Sra,
                (0x00, 6) => Op::Or,
                (0x00, 7) => Op::And,
                (0x01, 0) => Op::Mul,
                (0x01, 1) => Op::Mulh,
                (0x01, 2) => Op::Mulhsu,
                (0x01, 3) => Op::Mulhu,
                (0x01, 4) => Op::Div,
                (0x01, 5) => Op::Divu,
                (0x01, 6) => Op::Rem,
                (0x01, 7) => Op::Remu,
                _ => return Instr::unknown(),
            };
            instr(op, rd(inst), rs1(inst), rs2(inst), 0, 4)
        }
        0x3b => {
            let op = match (funct7(inst), funct3(inst)) {
                (0x00, 0) => Op::Addw,
                (0x20, 0) => Op::Subw,
                (0x00, 1) => Op::Sllw,
                (0x00, 5) => Op::Srlw,
                (0x20, 5) => Op::Sraw,
                (0x01, 0) => Op::Mulw,
                (0x01, 4) => Op::Divw,
                (0x01, 5) => Op::Divuw,
                (0x01, 6) => Op::Remw,
                (0x01, 7) => Op::Remuw,
                _ => return Instr::unknown(),
            };
            instr(op, rd(inst), rs1(inst), rs2(inst), 0, 4)
        }
        0x0f => match funct3(inst) {
            0 => instr(Op::Fence, 0, 0, 0, 0, 4),
            1 => instr(Op::FenceI, 0, 0, 0, 0, 4),
            _ => Instr::unknown(),
        },
        0x73 => match funct3(inst) {
            0 => match inst >> 20 {
                0 => instr(Op::Ecall, 0, 0, 0, 0, 4),
                1 => instr(Op::Ebreak, 0, 0, 0, 0, 4),
                _ => Instr::unknown(),
            },
            f3 => {
                let csr = (inst >> 20) as i64;
                let op = match f3 {
                    1 => Op::Csrrw,
                    2 => Op::Csrrs,
                    3 => Op::Csrrc,
                    5 => Op::Csrrwi,
                    6 => Op::Csrrsi,
                    7 => Op::Csrrci,
                    _ => return Instr::unknown(),
                };
                instr(op, rd(inst), rs1(inst), 0, csr, 4)
            }
        },
        0x2f => {
            let wide = match funct3(inst) {
                2 => false,
                3 => true,
                _ => return Instr::unknown(),
            };
            let op = match (funct7(inst) >> 2, wide) {
                (0x02, false) => Op::LrW,
                (0x02, true) => Op::LrD,
                (0x03, false) => Op::ScW,
                (0x03, true) => Op::ScD,
                (0x01, false) => Op::AmoSwapW,
                (0x01, true) => Op::AmoSwapD,
                (0x00, false) => Op::AmoAddW,
                (0x00, true) => Op::AmoAddD,
                (0x04, false) => Op::AmoXorW,
                (0x04, true) => Op::AmoXorD,
                (0x0c, false) => Op::AmoAndW,
                (0x0c, true) => Op::AmoAndD,
                (0x08, false) => Op::AmoOrW,
                (0x08, true) => Op::AmoOrD,
                (0x10, false) => Op::AmoMinW,
                (0x10, true) => Op::AmoMinD,
                (0x14, false) => Op::AmoMaxW,
                (0x14, true) => Op::AmoMaxD,
                (0x18, false) => Op::AmoMinuW,
                (0x18, true) => Op::AmoMinuD,
                (0x1c, false) => Op::AmoMaxuW,
                (0x1c, true) => Op::AmoMaxuD,
                _ => return Instr::unknown(),
            };
            instr(op, rd(inst), rs1(inst), rs2(inst), 0, 4)
        }
        0x07 => match funct3(inst) {
            2 => instr(Op::Flw, rd(inst), rs1(inst), 0, imm_i(inst), 4),
            3 => instr(Op::Fld, rd(inst), rs1(inst), 0, imm_i(inst), 4),
            _ => Instr::unknown(),
        },
        0x27 => match funct3(inst) {
            2 => instr(Op::Fsw, 0, rs1(inst), rs2(inst), imm_s(inst), 4),
            3 => instr(Op::Fsd, 0, rs1(inst), rs2(inst), imm_s(inst), 4),
            _ => Instr::unknown(),
        },
        0x43 | 0x47 | 0x4b | 0x4f => {
            let double = (inst >> 25) & 3 == 1;
            let fop = match (op, double) {
                (0x43, false) => Op::FmaddS,
                (0x47, false) => Op::FmsubS,
                (0x4b, false) => Op::FnmsubS,
                (0x4f, false) => Op::FnmaddS,
                (0x43, true) => Op::FmaddD,
                (0x47, true) => Op::FmsubD,
                (0x4b, true) => Op::FnmsubD,
                (0x4f, true) => Op::FnmaddD,
                _ => return Instr::unknown(),
            };
            Instr {
                op: fop,
                rd: rd(inst),
                rs1: rs1(inst),
                rs2: rs2(inst),
                rs3: (inst >> 27) as u8,
                imm: 0,
                len: 4,
            }
        }
        0x53 => decode_op_fp(inst),
        _ => Instr::unknown(),
    }
}

fn decode_op_fp(inst: u32) -> Instr {
    let rm = funct3(inst);
    let op = match funct7(inst) {
        0x00 => Op::FaddS,
        0x01 => Op::FaddD,
        0x04 => Op::FsubS,
        0x05 => Op::FsubD,
        0x08 => Op::FmulS,
        0x09 => Op::FmulD,
        0x0c => Op::FdivS,
        0x0d => Op::FdivD,
        0x2c => Op::FsqrtS,
        0x2d => Op::FsqrtD,
        0x10 => match rm {
            0 => Op::FsgnjS,
            1 => Op::FsgnjnS,
            2 => Op::FsgnjxS,
            _ => return Instr::unknown(),
        },
        0x11 => match rm {
            0 => Op::FsgnjD,
            1 => Op::FsgnjnD,
            2 => Op::FsgnjxD,
            _ => return Instr::unknown(),
        },
        0x14 => match rm {
            0 => Op::FminS,
            1 => Op::FmaxS,
            _ => return Instr::unknown(),
        },
        0x15 => match rm {
            0 => Op::FminD,
            1 => Op::FmaxD,
            _ => return Instr::unknown(),
        },
        0x50 => match rm {
            0 => Op::FleS,
            1 => Op::FltS,
            2 => Op::FeqS,
            _ => return Instr::unknown(),
        },
        0x51 => match rm {
            0 => Op::FleD,
            1 => Op::FltD,
            2 => Op::FeqD,
            _ => return Instr::unknown(),
        },
        0x60 => match rs2(inst) {
            0 => Op::FcvtWS,
            1 => Op::FcvtWuS,
            2 => Op::FcvtLS,
            3 => Op::FcvtLuS,
            _ => return Instr::unknown(),
        },
        0x61 => match rs2(inst) {
            0 => Op::FcvtWD,
            1 => Op::FcvtWuD,
            2 => Op::FcvtLD,
            3 => Op::FcvtLuD,
            _ => return Instr::unknown(),
        },
        0x68 => match rs2(inst) {
            0 => Op::FcvtSW,
            1 => Op::FcvtSWu,
            2 => Op::FcvtSL,
            3 => Op::FcvtSLu,
            _ => return Instr::unknown(),
        },
        0x69 => match rs2(inst) {
            0 => Op::FcvtDW,
            1 => Op::FcvtDWu,
            2 => Op::FcvtDL,
            3 => Op::FcvtDLu,
            _ => return Instr::unknown(),
        },
        0x20 if rs2(inst) == 1 => Op::FcvtSD,
        0x21 if rs2(inst) == 0 => Op::FcvtDS,
        0x70 => match rm {
            0 => Op::FmvXW,
            1 => Op::FclassS,
            _ => return Instr::unknown(),
        },
        0x71 => match rm {
            0 => Op::FmvXD,
            1 => Op::FclassD,
            _ => return Instr::unknown(),
        },
        0x78 => Op::FmvWX,
        0x79 => Op::FmvDX,
        _ => return Instr::unknown(),
    };
    Instr {
        op,
        rd: rd(inst),
        rs1: rs1(inst),
        rs2: rs2(inst),
        rs3: 0,
        imm: rm as i64,
        len: 4,
    }
}

/// Expands a compressed encoding (low two bits != 0b11) to its canonical
/// form with `len == 2`.
pub fn decode_u16(half: u16) -> Instr {
    let h = half as u32;
    let op = h & 3;
    let funct3 = (h >> 13) & 7;

    // Register fields for the common formats.
    let r_full = ((h >> 7) & 0x1f) as u8; // rd/rs1
    let r2_full = ((h >> 2) & 0x1f) as u8; // rs2
    let r_c = (((h >> 7) & 7) + 8) as u8; // rd'/rs1'
    let r2_c = (((h >> 2) & 7) + 8) as u8; // rs2'/rd'

    let two = |i: Instr| Instr { len: 2, ..i };

    match (op, funct3) {
        // Quadrant 0
        (0, 0) => {
            // c.addi4spn
            let imm = (((h >> 7) & 0xf) << 6)
                | (((h >> 11) & 3) << 4)
                | (((h >> 5) & 1) << 3)
                | (((h >> 6) & 1) << 2);
            if imm == 0 {
                return Instr::unknown();
            }
            two(instr(Op::Addi, r2_c, 2, 0, imm as i64, 2))
        }
        (0, 1) => {
            let imm = (((h >> 10) & 7) << 3) | (((h >> 5) & 3) << 6);
            two(instr(Op::Fld, r2_c, r_c, 0, imm as i64, 2))
        }
        (0, 2) => {
            let imm = (((h >> 10) & 7) << 3) | (((h >> 6) & 1) << 2) | (((h >> 5) & 1) << 6);
            two(instr(Op::Lw, r2_c, r_c, 0, imm as i64, 2))
        }
        (0, 3) => {
            let imm = (((h >> 10) & 7) << 3) | (((h >> 5) & 3) << 6);
            two(instr(Op::Ld, r2_c, r_c, 0, imm as i64, 2))
        }
        (0, 5) => {
            let imm = (((h >> 10) & 7) << 3) | (((h >> 5) & 3) << 6);
            two(instr(Op::Fsd, 0, r_c, r2_c, imm as i64, 2))
        }
        (0, 6) => {
            let imm = (((h >> 10) & 7) << 3) | (((h >> 6) & 1) << 2) | (((h >> 5) & 1) << 6);
            two(instr(Op::Sw, 0, r_c, r2_c, imm as i64, 2))
        }
        (0, 7) => {
            let imm = (((h >> 10) & 7) << 3) | (((h >> 5) & 3) << 6);
            two(instr(Op::Sd, 0, r_c, r2_c, imm as i64, 2))
        }

        // Quadrant 1
        (1, 0) => {
            let imm = sign_extend(((((h >> 12) & 1) << 5) | ((h >> 2) & 0x1f)) as u64, 6);
            two(instr(Op::Addi, r_full, r_full, 0, imm, 2))
        }
        (1, 1) => {
            let imm = sign_extend(((((h >> 12) & 1) << 5) | ((h >> 2) & 0x1f)) as u64, 6);
            if r_full == 0 {
                return Instr::unknown();
            }
            two(instr(Op::Addiw, r_full, r_full, 0, imm, 2))
        }
        (1, 2) => {
            let imm = sign_extend(((((h >> 12) & 1) << 5) | ((h >> 2) & 0x1f)) as u64, 6);
            two(instr(Op::Addi, r_full, 0, 0, imm, 2))
        }
        (1, 3) => {
            if r_full == 2 {
                // c.addi16sp
                let imm = (((h >> 12) & 1) << 9)
                    | (((h >> 6) & 1) << 4)
                    | (((h >> 5) & 1) << 6)
                    | (((h >> 3) & 3) << 7)
                    | (((h >> 2) & 1) << 5);
                let imm = sign_extend(imm as u64, 10);
                if imm == 0 {
                    return Instr::unknown();
                }
                two(instr(Op::Addi, 2, 2, 0, imm, 2))
            } else {
                let imm = sign_extend(
                    (((((h >> 12) & 1) << 5) | ((h >> 2) & 0x1f)) << 12) as u64,
                    18,
                );
                if imm == 0 {
                    return Instr::unknown();
                }
                two(instr(Op::Lui, r_full, 0, 0, imm, 2))
            }
        }
        (1, 4) => {
            let shamt = ((((h >> 12) & 1) << 5) | ((h >> 2) & 0x1f)) as i64;
            match (h >> 10) & 3 {
                0 => two(instr(Op::Srli, r_c, r_c, 0, shamt, 2)),
                1 => two(instr(Op::Srai, r_c, r_c, 0, shamt, 2)),
                2 => {
                    let imm = sign_extend(((((h >> 12) & 1) << 5) | ((h >> 2) & 0x1f)) as u64, 6);
                    two(instr(Op::Andi, r_c, r_c, 0, imm, 2))
                }
                _ => {
                    let op = match (((h >> 12) & 1), (h >> 5) & 3) {
                        (0, 0) => Op::Sub,
                        (0, 1) => Op::Xor,
                        (0, 2) => Op::Or,
                        (0, 3) => Op::And,
                        (1, 0) => Op::Subw,
                        (1, 1) => Op::Addw,
                        _ => return Instr::unknown(),
                    };
                    two(instr(op, r_c, r_c, r2_c, 0, 2))
                }
            }
        }
        (1, 5) => {
            // c.j
            let imm = (((h >> 12) & 1) << 11)
                | (((h >> 11) & 1) << 4)
                | (((h >> 9) & 3) << 8)
                | (((h >> 8) & 1) << 10)
                | (((h >> 7) & 1) << 6)
                | (((h >> 6) & 1) << 7)
                | (((h >> 3) & 7) << 1)
                | (((h >> 2) & 1) << 5);
            two(instr(Op::Jal, 0, 0, 0, sign_extend(imm as u64, 12), 2))
        }
        (1, 6) | (1, 7) => {
            let imm = (((h >> 12) & 1) << 8)
                | (((h >> 10) & 3) << 3)
                | (((h >> 5) & 3) << 6)
                | (((h >> 3) & 3) << 1)
                | (((h >> 2) & 1) << 5);
            let imm = sign_extend(imm as u64, 9);
            let op = if funct3 == 6 { Op::Beq } else { Op::Bne };
            two(instr(op, 0, r_c, 0, imm, 2))
        }

        // Quadrant 2
        (2, 0) => {
            let shamt = ((((h >> 12) & 1) << 5) | ((h >> 2) & 0x1f)) as i64;
            two(instr(Op::Slli, r_full, r_full, 0, shamt, 2))
        }
        (2, 1) => {
            let imm = (((h >> 12) & 1) << 5) | (((h >> 5) & 3) << 3) | (((h >> 2) & 7) << 6);
            two(instr(Op::Fld, r_full, 2, 0, imm as i64, 2))
        }
        (2, 2) => {
            let imm = (((h >> 12) & 1) << 5) | (((h >> 4) & 7) << 2) | (((h >> 2) & 3) << 6);
            two(instr(Op::Lw, r_full, 2, 0, imm as i64, 2))
        }
        (2, 3) => {
            let imm = (((h >> 12) & 1) << 5) | (((h >> 5) & 3) << 3) | (((h >> 2) & 7) << 6);
            two(instr(Op::Ld, r_full, 2, 0, imm as i64, 2))
        }
        (2, 4) => {
            let bit12 = (h >> 12) & 1;
            match (bit12, r_full, r2_full) {
                (0, 0, _) => Instr::unknown(),
                (0, rs1, 0) => two(instr(Op::Jalr, 0, rs1, 0, 0, 2)),
                (0, rd, rs2) => two(instr(Op::Add, rd, 0, rs2, 0, 2)),
                (1, 0, 0) => two(instr(Op::Ebreak, 0, 0, 0, 0, 2)),
                (1, rs1, 0) => two(instr(Op::Jalr, 1, rs1, 0, 0, 2)),
                (1, rd, rs2) => two(instr(Op::Add, rd, rd, rs2, 0, 2)),
                _ => Instr::unknown(),
            }
        }
        (2, 5) => {
            let imm = (((h >> 10) & 7) << 3) | (((h >> 7) & 7) << 6);
            two(instr(Op::Fsd, 0, 2, r2_full, imm as i64, 2))
        }
        (2, 6) => {
            let imm = (((h >> 9) & 0xf) << 2) | (((h >> 7) & 3) << 6);
            two(instr(Op::Sw, 0, 2, r2_full, imm as i64, 2))
        }
        (2, 7) => {
            let imm = (((h >> 10) & 7) << 3) | (((h >> 7) & 7) << 6);
            two(instr(Op::Sd, 0, 2, r2_full, imm as i64, 2))
        }
        _ => Instr::unknown(),
    }
}

/// Decodes whichever width starts with `lo`; `hi` supplies the upper half
/// of a 32-bit encoding.
pub fn decode_u16_pair(lo: u16, hi: u16) -> Instr {
    if lo & 3 == 3 {
        decode_u32((lo as u32) | ((hi as u32) << 16))
    } else {
        decode_u16(lo)
    }
}

/// Decodes the instruction at `pc`, reading through `reader`.
pub fn decode_at(reader: &impl CodeReader, pc: u64) -> Option<Instr> {
    let lo = reader.read_code_u16(pc)?;
    if lo & 3 == 3 {
        let hi = reader.read_code_u16(pc + 2)?;
        Some(decode_u32((lo as u32) | ((hi as u32) << 16)))
    } else {
        Some(decode_u16(lo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_alu_forms() {
        // addi x5, x6, -1
        let i = decode_u32(0xfff3_0293);
        assert_eq!((i.op, i.rd, i.rs1, i.imm), (Op::Addi, 5, 6, -1));
        // add x1, x2, x3
        let i = decode_u32(0x0031_00b3);
        assert_eq!((i.op, i.rd, i.rs1, i.rs2), (Op::Add, 1, 2, 3));
        // sub x1, x2, x3
        let i = decode_u32(0x4031_00b3);
        assert_eq!(i.op, Op::Sub);
        // mul x10, x11, x12
        let i = decode_u32(0x02c5_8533);
        assert_eq!((i.op, i.rd, i.rs1, i.rs2), (Op::Mul, 10, 11, 12));
    }

    #[test]
    fn branches_and_jumps() {
        // beq x1, x2, +16
        let i = decode_u32(0x0020_8863);
        assert_eq!((i.op, i.rs1, i.rs2, i.imm), (Op::Beq, 1, 2, 16));
        // jal x1, +2048... use -4 instead: 0xffdff0ef = jal x1, -4
        let i = decode_u32(0xffdf_f0ef);
        assert_eq!((i.op, i.rd, i.imm), (Op::Jal, 1, -4));
        // jalr x0, 0(x1) = ret
        let i = decode_u32(0x0000_8067);
        assert_eq!((i.op, i.rd, i.rs1, i.imm), (Op::Jalr, 0, 1, 0));
    }

    #[test]
    fn loads_stores() {
        // ld x7, 8(x2)
        let i = decode_u32(0x0081_3383);
        assert_eq!((i.op, i.rd, i.rs1, i.imm), (Op::Ld, 7, 2, 8));
        // sd x7, -8(x2)
        let i = decode_u32(0xfe71_3c23);
        assert_eq!((i.op, i.rs1, i.rs2, i.imm), (Op::Sd, 2, 7, -8));
    }

    #[test]
    fn system_forms() {
        assert_eq!(decode_u32(0x0000_0073).op, Op::Ecall);
        assert_eq!(decode_u32(0x0010_0073).op, Op::Ebreak);
        // csrrs x5, fcsr(0x003), x0
        let i = decode_u32(0x0030_22f3);
        assert_eq!((i.op, i.rd, i.imm), (Op::Csrrs, 5, 3));
    }

    #[test]
    fn compressed_expansion() {
        // c.li x10, 1 => addi x10, x0, 1
        let i = decode_u16(0x4505);
        assert_eq!((i.op, i.rd, i.rs1, i.imm, i.len), (Op::Addi, 10, 0, 1, 2));
        // c.add x10, x11
        let i = decode_u16(0x952e);
        assert_eq!((i.op, i.rd, i.rs1, i.rs2), (Op::Add, 10, 10, 11));
        // c.mv x10, x11
        let i = decode_u16(0x852e);
        assert_eq!((i.op, i.rd, i.rs1, i.rs2), (Op::Add, 10, 0, 11));
        // c.jr x1 (ret)
        let i = decode_u16(0x8082);
        assert_eq!((i.op, i.rd, i.rs1), (Op::Jalr, 0, 1));
        // c.addi4spn x8, sp, 16 => addi x8, x2, 16
        let i = decode_u16(0x0800);
        assert_eq!((i.op, i.rd, i.rs1, i.imm), (Op::Addi, 8, 2, 16));
        // c.sdsp x8, 8(sp)
        let i = decode_u16(0xe422);
        assert_eq!((i.op, i.rs1, i.rs2, i.imm), (Op::Sd, 2, 8, 8));
        // c.beqz x8, +8
        let i = decode_u16(0xc401);
        assert_eq!((i.op, i.rs1, i.rs2, i.imm), (Op::Beq, 8, 0, 8));
    }

    #[test]
    fn width_detection() {
        let code: &[u8] = &[0x05, 0x45, 0x93, 0x02, 0x10, 0x00];
        let first = decode_at(&code, 0).unwrap();
        assert_eq!((first.op, first.len), (Op::Addi, 2));
        let second = decode_at(&code, 2).unwrap();
        assert_eq!((second.op, second.rd, second.imm, second.len), (Op::Addi, 5, 1, 4));
    }
}
