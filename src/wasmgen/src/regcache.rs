//! Integer-register liveness for one basic block, feeding the register
//! caching pass: which registers a block reads before writing (live-in),
//! which it writes (live-out), and the union it touches at all.

use rvdec::{Block, Instr, Op};

#[derive(Debug, Default, Clone)]
pub struct Liveness {
    pub live_in: Vec<u8>,
    pub writes: Vec<u8>,
    pub used: Vec<u8>,
}

/// Integer registers an instruction reads. FP register numbers never
/// appear here; only the x-file is cacheable.
pub fn x_reads(i: &Instr) -> Vec<u8> {
    use Op::*;
    let mut out = Vec::new();
    let rs1 = matches!(
        i.op,
        Jalr | Beq
            | Bne
            | Blt
            | Bge
            | Bltu
            | Bgeu
            | Lb
            | Lh
            | Lw
            | Ld
            | Lbu
            | Lhu
            | Lwu
            | Sb
            | Sh
            | Sw
            | Sd
            | Addi
            | Slti
            | Sltiu
            | Xori
            | Ori
            | Andi
            | Slli
            | Srli
            | Srai
            | Add
            | Sub
            | Sll
            | Slt
            | Sltu
            | Xor
            | Srl
            | Sra
            | Or
            | And
            | Addiw
            | Slliw
            | Srliw
            | Sraiw
            | Addw
            | Subw
            | Sllw
            | Srlw
            | Sraw
            | Mul
            | Mulh
            | Mulhsu
            | Mulhu
            | Div
            | Divu
            | Rem
            | Remu
            | Mulw
            | Divw
            | Divuw
            | Remw
            | Remuw
            | Csrrw
            | Csrrs
            | Csrrc
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
            | Flw
            | Fld
            | Fsw
            | Fsd
            | FcvtSW
            | FcvtSWu
            | FcvtSL
            | FcvtSLu
            | FcvtDW
            | FcvtDWu
            | FcvtDL
            | FcvtDLu
            | FmvWX
            | FmvDX
    );
    if rs1 && i.rs1 != 0 {
        out.push(i.rs1);
    }
    let rs2 = matches!(
        i.op,
        Beq | Bne
            | Blt
            | Bge
            | Bltu
            | Bgeu
            | Sb
            | Sh
            | Sw
            | Sd
            | Add
            | Sub
            | Sll
            | Slt
            | Sltu
            | Xor
            | Srl
            | Sra
            | Or
            | And
            | Addw
            | Subw
            | Sllw
            | Srlw
            | Sraw
            | Mul
            | Mulh
            | Mulhsu
            | Mulhu
            | Div
            | Divu
            | Rem
            | Remu
            | Mulw
            | Divw
            | Divuw
            | Remw
            | Remuw
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
    );
    if rs2 && i.rs2 != 0 && !out.contains(&i.rs2) {
        out.push(i.rs2);
    }
    out
}

/// Integer register an instruction writes, if any. x0 writes are
/// architectural no-ops and reported as `None`.
pub fn x_write(i: &Instr) -> Option<u8> {
    use Op::*;
    let writes = matches!(
        i.op,
        Lui | Auipc
            | Jal
            | Jalr
            | Lb
            | Lh
            | Lw
            | Ld
            | Lbu
            | Lhu
            | Lwu
            | Addi
            | Slti
            | Sltiu
            | Xori
            | Ori
            | Andi
            | Slli
            | Srli
            | Srai
            | Add
            | Sub
            | Sll
            | Slt
            | Sltu
            | Xor
            | Srl
            | Sra
            | Or
            | And
            | Addiw
            | Slliw
            | Srliw
            | Sraiw
            | Addw
            | Subw
            | Sllw
            | Srlw
            | Sraw
            | Mul
            | Mulh
            | Mulhsu
            | Mulhu
            | Div
            | Divu
            | Rem
            | Remu
            | Mulw
            | Divw
            | Divuw
            | Remw
            | Remuw
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
            | FcvtWS
            | FcvtWuS
            | FcvtLS
            | FcvtLuS
            | FcvtWD
            | FcvtWuD
            | FcvtLD
            | FcvtLuD
            | FmvXW
            | FmvXD
            | FclassS
            | FclassD
            | FeqS
            | FltS
            | FleS
            | FeqD
            | FltD
            | FleD
    );
    (writes && i.rd != 0).then_some(i.rd)
}

/// Scans a block once, in order: a register read before any write makes it
/// live-in; any write makes it live-out.
pub fn block_liveness(block: &Block) -> Liveness {
    let mut lv = Liveness::default();
    let mut written = [false; 32];
    for (_, instr) in &block.instrs {
        for r in x_reads(instr) {
            if !written[r as usize] && !lv.live_in.contains(&r) {
                lv.live_in.push(r);
            }
            if !lv.used.contains(&r) {
                lv.used.push(r);
            }
        }
        if let Some(rd) = x_write(instr) {
            written[rd as usize] = true;
            if !lv.writes.contains(&rd) {
                lv.writes.push(rd);
            }
            if !lv.used.contains(&rd) {
                lv.used.push(rd);
            }
        }
    }
    lv
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvdec::decode_block;

    fn asm(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn read_before_write_is_live_in() {
        // add x5, x5, x6 ; addi x6, x0, 7 ; add x7, x5, x6 ; ret
        let code = asm(&[0x0062_82b3, 0x0070_0313, 0x0062_83b3, 0x0000_8067]);
        let block = decode_block(&code.as_slice(), 0, None);
        let lv = block_liveness(&block);
        assert_eq!(lv.live_in, vec![5, 6, 1]); // x1 read by ret
        assert_eq!(lv.writes, vec![5, 6, 7]);
        assert!(lv.used.contains(&7));
    }

    #[test]
    fn x0_is_never_tracked() {
        // addi x0, x0, 0 (canonical nop)
        let code = asm(&[0x0000_0013, 0x0000_8067]);
        let block = decode_block(&code.as_slice(), 0, None);
        let lv = block_liveness(&block);
        assert!(!lv.used.contains(&0));
        assert!(lv.writes.is_empty());
    }

    #[test]
    fn store_reads_both_operands() {
        // sd x7, 8(x2) ; ret
        let code = asm(&[0x0071_3423, 0x0000_8067]);
        let block = decode_block(&code.as_slice(), 0, None);
        let lv = block_liveness(&block);
        assert!(lv.live_in.contains(&2));
        assert!(lv.live_in.contains(&7));
        assert!(lv.writes.is_empty());
    }
}
