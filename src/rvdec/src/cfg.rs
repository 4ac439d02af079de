//! Basic-block and region construction over decoded instructions.

use rustc_hash::FxHashMap;

use crate::{decode_at, CodeReader, Instr, Op};

/// JIT compilation unit: a 16 KiB aligned window of guest code.
pub const REGION_SIZE: u64 = 16 * 1024;

/// Safety bound; real blocks are far shorter.
pub const MAX_BLOCK_INSTRS: usize = 1024;

#[inline]
pub fn region_base(pc: u64) -> u64 {
    pc & !(REGION_SIZE - 1)
}

/// True for instructions that always end a basic block.
pub fn is_block_end(op: Op) -> bool {
    matches!(
        op,
        Op::Beq
            | Op::Bne
            | Op::Blt
            | Op::Bge
            | Op::Bltu
            | Op::Bgeu
            | Op::Jal
            | Op::Jalr
            | Op::Ecall
            | Op::Ebreak
            | Op::Unknown
    )
}

/// A straight-line run of instructions. The terminator (branch, jump,
/// ecall, unknown) is included as the final element; a block that stops at
/// a region boundary simply ends without one.
#[derive(Debug, Clone)]
pub struct Block {
    pub start: u64,
    pub instrs: Vec<(u64, Instr)>,
}

impl Block {
    /// Address of the first byte past the block.
    pub fn end(&self) -> u64 {
        self.instrs
            .last()
            .map(|(pc, i)| pc + i.len as u64)
            .unwrap_or(self.start)
    }

    pub fn terminator(&self) -> Option<&(u64, Instr)> {
        self.instrs.last().filter(|(_, i)| is_block_end(i.op))
    }

    /// Successor addresses that are statically known. Conditional branches
    /// yield both arms; calls also yield their return site, since returns
    /// come back through dynamic jumps the discoverer cannot follow.
    pub fn static_successors(&self) -> Vec<u64> {
        let Some(&(pc, instr)) = self.terminator() else {
            // Fell off the region edge: falls through.
            return vec![self.end()];
        };
        match instr.op {
            Op::Jal => {
                let mut out = vec![(pc as i64 + instr.imm) as u64];
                if instr.rd != 0 {
                    out.push(pc + instr.len as u64);
                }
                out
            }
            Op::Jalr if instr.rd != 0 => vec![pc + instr.len as u64],
            // The syscall continuation is a real block entry; dispatch
            // resumes there once the host has handled the ecall.
            Op::Ecall => vec![pc + instr.len as u64],
            Op::Beq | Op::Bne | Op::Blt | Op::Bge | Op::Bltu | Op::Bgeu => vec![
                (pc as i64 + instr.imm) as u64,
                pc + instr.len as u64,
            ],
            _ => Vec::new(),
        }
    }
}

/// Decodes the block starting at `pc`. When `bound` is given, decoding
/// stops before crossing it (region boundary).
pub fn decode_block(reader: &impl CodeReader, pc: u64, bound: Option<u64>) -> Block {
    let mut instrs = Vec::new();
    let mut cur = pc;
    loop {
        if let Some(limit) = bound {
            if cur >= limit {
                break;
            }
        }
        let Some(instr) = decode_at(reader, cur) else {
            instrs.push((cur, Instr::unknown()));
            break;
        };
        instrs.push((cur, instr));
        if is_block_end(instr.op) || instrs.len() >= MAX_BLOCK_INSTRS {
            break;
        }
        cur += instr.len as u64;
    }
    Block { start: pc, instrs }
}

/// All blocks of one region, discovered from a root set of entry
/// addresses. Blocks referenced from inside but starting outside the
/// window are left to the dispatch miss path.
#[derive(Debug)]
pub struct Region {
    pub base: u64,
    pub blocks: FxHashMap<u64, Block>,
}

impl Region {
    pub fn limit(&self) -> u64 {
        self.base + REGION_SIZE
    }

    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.base && pc < self.limit()
    }
}

pub fn build_region(reader: &impl CodeReader, base: u64, entries: &[u64]) -> Region {
    let base = region_base(base);
    let limit = base + REGION_SIZE;
    let mut region = Region {
        base,
        blocks: FxHashMap::default(),
    };

    let mut worklist: Vec<u64> = entries
        .iter()
        .copied()
        .filter(|&pc| pc >= base && pc < limit)
        .collect();

    while let Some(pc) = worklist.pop() {
        if region.blocks.contains_key(&pc) {
            continue;
        }
        let block = decode_block(reader, pc, Some(limit));
        if block.instrs.is_empty() {
            continue;
        }
        for succ in block.static_successors() {
            if succ >= base && succ < limit && !region.blocks.contains_key(&succ) {
                worklist.push(succ);
            }
        }
        region.blocks.insert(pc, block);
    }
    region
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asm(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn block_stops_at_branch() {
        // addi x5, x0, 1 ; addi x6, x0, 2 ; beq x5, x6, +8 ; addi x7, x0, 3
        let code = asm(&[0x0010_0293, 0x0020_0313, 0x0062_8463, 0x0030_0393]);
        let block = decode_block(&code.as_slice(), 0, None);
        assert_eq!(block.instrs.len(), 3);
        assert_eq!(block.end(), 12);
        let succs = block.static_successors();
        assert_eq!(succs, vec![16, 12]);
    }

    #[test]
    fn block_stops_at_unknown() {
        let code = asm(&[0x0010_0293, 0xffff_ffff]);
        let block = decode_block(&code.as_slice(), 0, None);
        assert_eq!(block.instrs.len(), 2);
        assert_eq!(block.instrs[1].1.op, Op::Unknown);
    }

    #[test]
    fn region_discovers_both_branch_arms() {
        // 0x0: beq x0, x0, +12 ; 0x4: addi x5,x0,1 ; 0x8: jal x0, -8 ;
        // 0xc: jalr x0, 0(x1)
        let code = asm(&[0x0000_0663, 0x0010_0293, 0xff9f_f06f, 0x0000_8067]);
        let region = build_region(&code.as_slice(), 0, &[0]);
        assert!(region.blocks.contains_key(&0));
        assert!(region.blocks.contains_key(&4));
        assert!(region.blocks.contains_key(&0xc));
        // The jal at 0x8 targets 0x0, already present.
        assert_eq!(region.blocks[&4].instrs.len(), 2);
    }

    #[test]
    fn region_boundary_truncates() {
        let base = 0;
        // A block of plain addis crossing the 16 KiB line never includes
        // the out-of-window instruction.
        let mut words = vec![0x0010_0293u32; (REGION_SIZE / 4) as usize + 8];
        let len = words.len();
        words[len - 1] = 0x0000_8067;
        let code = asm(&words);
        let block = decode_block(&code.as_slice(), base, Some(REGION_SIZE));
        assert!(block.end() <= REGION_SIZE);
    }
}
