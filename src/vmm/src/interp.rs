//! The reference interpreter: executes decoded blocks directly against
//! the cpu state and the arena. It is the fallback for everything the
//! translator does not cover, and the oracle the JIT is tested against.

use arena::state::CpuState;
use arena::{Arena, Error as ArenaError};
use rustc_hash::FxHashMap;
use rvdec::{decode_block, Block, Op};

/// Why a quantum stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpStop {
    /// Instruction budget exhausted; keep going next iteration.
    Quantum,
    /// ecall reached; `cpu.pc` points at it.
    Ecall,
    /// ebreak reached.
    Ebreak,
    /// Data access faulted at this guest address.
    Fault(u64),
    /// Undecodable instruction at `cpu.pc`.
    BadInstr(u64),
}

#[derive(Default)]
pub struct BlockCache {
    blocks: FxHashMap<u64, Block>,
}

impl BlockCache {
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    fn get_or_decode(&mut self, arena: &Arena, pc: u64) -> &Block {
        self.blocks
            .entry(pc)
            .or_insert_with(|| decode_block(arena, pc, None))
    }
}

fn nanbox(v: f32) -> u64 {
    (v.to_bits() as u64) | 0xffff_ffff_0000_0000
}

fn unbox_f32(v: u64) -> f32 {
    if v >> 32 == 0xffff_ffff {
        f32::from_bits(v as u32)
    } else {
        f32::NAN
    }
}

fn cvt_f64_to_i32(v: f64, rm: i64) -> i32 {
    if v.is_nan() {
        return i32::MAX;
    }
    let r = if rm == 1 { v.trunc() } else { round_half_even(v) };
    if r >= i32::MAX as f64 {
        i32::MAX
    } else if r <= i32::MIN as f64 {
        i32::MIN
    } else {
        r as i32
    }
}

fn cvt_f64_to_u32(v: f64, rm: i64) -> u32 {
    if v.is_nan() {
        return u32::MAX;
    }
    let r = if rm == 1 { v.trunc() } else { round_half_even(v) };
    if r >= u32::MAX as f64 {
        u32::MAX
    } else if r <= 0.0 {
        0
    } else {
        r as u32
    }
}

fn cvt_f64_to_i64(v: f64, rm: i64) -> i64 {
    if v.is_nan() {
        return i64::MAX;
    }
    let r = if rm == 1 { v.trunc() } else { round_half_even(v) };
    if r >= i64::MAX as f64 {
        i64::MAX
    } else if r <= i64::MIN as f64 {
        i64::MIN
    } else {
        r as i64
    }
}

fn cvt_f64_to_u64(v: f64, rm: i64) -> u64 {
    if v.is_nan() {
        return u64::MAX;
    }
    let r = if rm == 1 { v.trunc() } else { round_half_even(v) };
    if r >= u64::MAX as f64 {
        u64::MAX
    } else if r <= 0.0 {
        0
    } else {
        r as u64
    }
}

fn round_half_even(v: f64) -> f64 {
    let r = v.round();
    if (v - v.trunc()).abs() == 0.5 && r % 2.0 != 0.0 {
        r - v.signum()
    } else {
        r
    }
}

fn fault_addr(e: &ArenaError) -> u64 {
    match e {
        ArenaError::ProtectionFault { addr } => *addr,
        ArenaError::OutOfArena { addr, .. } => *addr,
        ArenaError::OutOfMemory { .. } => 0,
    }
}

/// Runs up to `max_instrs` instructions. On return, `executed` holds
/// aggregated per-block instruction counts, fed to the JIT's hot-page
/// detector.
pub fn run_quantum(
    cpu: &mut CpuState,
    arena: &mut Arena,
    cache: &mut BlockCache,
    max_instrs: u64,
    executed: &mut FxHashMap<u64, u32>,
) -> InterpStop {
    let mut budget = max_instrs;
    let mut record = |pc: u64, count: u32| {
        *executed.entry(pc).or_insert(0) += count;
    };
    loop {
        let block_pc = cpu.pc;
        let block = cache.get_or_decode(arena, block_pc).clone();
        if block.instrs.is_empty() {
            return InterpStop::BadInstr(block_pc);
        }
        let mut count = 0u32;
        for (pc, instr) in &block.instrs {
            cpu.pc = *pc;
            match step(cpu, arena, *pc, instr) {
                Ok(Flow::Next) => {
                    cpu.pc = pc + instr.len as u64;
                }
                Ok(Flow::Jump(target)) => {
                    cpu.pc = target;
                    count += 1;
                    break;
                }
                Ok(Flow::Ecall) => {
                    record(block_pc, count + 1);
                    return InterpStop::Ecall;
                }
                Ok(Flow::Ebreak) => {
                    record(block_pc, count + 1);
                    return InterpStop::Ebreak;
                }
                Ok(Flow::Bad) => {
                    record(block_pc, count);
                    return InterpStop::BadInstr(*pc);
                }
                Err(e) => {
                    record(block_pc, count);
                    return InterpStop::Fault(fault_addr(&e));
                }
            }
            count += 1;
        }
        record(block_pc, count.max(1));
        budget = budget.saturating_sub(count.max(1) as u64);
        if budget == 0 {
            return InterpStop::Quantum;
        }
    }
}

enum Flow {
    Next,
    Jump(u64),
    Ecall,
    Ebreak,
    Bad,
}

fn step(
    cpu: &mut CpuState,
    arena: &mut Arena,
    pc: u64,
    i: &rvdec::Instr,
) -> Result<Flow, ArenaError> {
    use Op::*;
    let rs1 = cpu.get_x(i.rs1);
    let rs2 = cpu.get_x(i.rs2);
    let imm = i.imm;

    match i.op {
        Lui => cpu.set_x(i.rd, imm as u64),
        Auipc => cpu.set_x(i.rd, pc.wrapping_add(imm as u64)),
        Jal => {
            cpu.set_x(i.rd, pc + i.len as u64);
            return Ok(Flow::Jump(pc.wrapping_add(imm as u64)));
        }
        Jalr => {
            let target = rs1.wrapping_add(imm as u64) & !1;
            cpu.set_x(i.rd, pc + i.len as u64);
            return Ok(Flow::Jump(target));
        }
        Beq | Bne | Blt | Bge | Bltu | Bgeu => {
            let take = match i.op {
                Beq => rs1 == rs2,
                Bne => rs1 != rs2,
                Blt => (rs1 as i64) < (rs2 as i64),
                Bge => (rs1 as i64) >= (rs2 as i64),
                Bltu => rs1 < rs2,
                _ => rs1 >= rs2,
            };
            return Ok(if take {
                Flow::Jump(pc.wrapping_add(imm as u64))
            } else {
                Flow::Next
            });
        }

        Lb => {
            let v = arena.read_u8(rs1.wrapping_add(imm as u64))? as i8 as i64;
            cpu.set_x(i.rd, v as u64);
        }
        Lbu => {
            let v = arena.read_u8(rs1.wrapping_add(imm as u64))?;
            cpu.set_x(i.rd, v as u64);
        }
        Lh => {
            let v = arena.read_u16(rs1.wrapping_add(imm as u64))? as i16 as i64;
            cpu.set_x(i.rd, v as u64);
        }
        Lhu => {
            let v = arena.read_u16(rs1.wrapping_add(imm as u64))?;
            cpu.set_x(i.rd, v as u64);
        }
        Lw => {
            let v = arena.read_u32(rs1.wrapping_add(imm as u64))? as i32 as i64;
            cpu.set_x(i.rd, v as u64);
        }
        Lwu => {
            let v = arena.read_u32(rs1.wrapping_add(imm as u64))?;
            cpu.set_x(i.rd, v as u64);
        }
        Ld => {
            let v = arena.read_u64(rs1.wrapping_add(imm as u64))?;
            cpu.set_x(i.rd, v);
        }
        Sb => arena.write_obj(rs1.wrapping_add(imm as u64), rs2 as u8)?,
        Sh => arena.write_obj(rs1.wrapping_add(imm as u64), rs2 as u16)?,
        Sw => arena.write_obj(rs1.wrapping_add(imm as u64), rs2 as u32)?,
        Sd => arena.write_obj(rs1.wrapping_add(imm as u64), rs2)?,

        Addi => cpu.set_x(i.rd, rs1.wrapping_add(imm as u64)),
        Slti => cpu.set_x(i.rd, ((rs1 as i64) < imm) as u64),
        Sltiu => cpu.set_x(i.rd, (rs1 < imm as u64) as u64),
        Xori => cpu.set_x(i.rd, rs1 ^ imm as u64),
        Ori => cpu.set_x(i.rd, rs1 | imm as u64),
        Andi => cpu.set_x(i.rd, rs1 & imm as u64),
        Slli => cpu.set_x(i.rd, rs1 << (imm & 0x3f)),
        Srli => cpu.set_x(i.rd, rs1 >> (imm & 0x3f)),
        Srai => cpu.set_x(i.rd, ((rs1 as i64) >> (imm & 0x3f)) as u64),

        Add => cpu.set_x(i.rd, rs1.wrapping_add(rs2)),
        Sub => cpu.set_x(i.rd, rs1.wrapping_sub(rs2)),
        Sll => cpu.set_x(i.rd, rs1 << (rs2 & 0x3f)),
        Slt => cpu.set_x(i.rd, ((rs1 as i64) < rs2 as i64) as u64),
        Sltu => cpu.set_x(i.rd, (rs1 < rs2) as u64),
        Xor => cpu.set_x(i.rd, rs1 ^ rs2),
        Srl => cpu.set_x(i.rd, rs1 >> (rs2 & 0x3f)),
        Sra => cpu.set_x(i.rd, ((rs1 as i64) >> (rs2 & 0x3f)) as u64),
        Or => cpu.set_x(i.rd, rs1 | rs2),
        And => cpu.set_x(i.rd, rs1 & rs2),

        Addiw => cpu.set_x(i.rd, (rs1.wrapping_add(imm as u64) as i32) as i64 as u64),
        Slliw => cpu.set_x(i.rd, ((rs1 as u32) << (imm & 0x1f)) as i32 as i64 as u64),
        Srliw => cpu.set_x(i.rd, ((rs1 as u32) >> (imm & 0x1f)) as i32 as i64 as u64),
        Sraiw => cpu.set_x(i.rd, ((rs1 as i32) >> (imm & 0x1f)) as i64 as u64),
        Addw => cpu.set_x(i.rd, (rs1.wrapping_add(rs2) as i32) as i64 as u64),
        Subw => cpu.set_x(i.rd, (rs1.wrapping_sub(rs2) as i32) as i64 as u64),
        Sllw => cpu.set_x(i.rd, ((rs1 as u32) << (rs2 & 0x1f)) as i32 as i64 as u64),
        Srlw => cpu.set_x(i.rd, ((rs1 as u32) >> (rs2 & 0x1f)) as i32 as i64 as u64),
        Sraw => cpu.set_x(i.rd, ((rs1 as i32) >> (rs2 & 0x1f)) as i64 as u64),

        Mul => cpu.set_x(i.rd, rs1.wrapping_mul(rs2)),
        Mulh => {
            let v = ((rs1 as i64 as i128) * (rs2 as i64 as i128)) >> 64;
            cpu.set_x(i.rd, v as u64);
        }
        Mulhsu => {
            let v = ((rs1 as i64 as i128) * (rs2 as u128 as i128)) >> 64;
            cpu.set_x(i.rd, v as u64);
        }
        Mulhu => {
            let v = ((rs1 as u128) * (rs2 as u128)) >> 64;
            cpu.set_x(i.rd, v as u64);
        }
        Div => {
            let (a, b) = (rs1 as i64, rs2 as i64);
            let v = if b == 0 {
                -1
            } else if a == i64::MIN && b == -1 {
                a
            } else {
                a / b
            };
            cpu.set_x(i.rd, v as u64);
        }
        Divu => cpu.set_x(i.rd, if rs2 == 0 { u64::MAX } else { rs1 / rs2 }),
        Rem => {
            let (a, b) = (rs1 as i64, rs2 as i64);
            let v = if b == 0 {
                a
            } else if a == i64::MIN && b == -1 {
                0
            } else {
                a % b
            };
            cpu.set_x(i.rd, v as u64);
        }
        Remu => cpu.set_x(i.rd, if rs2 == 0 { rs1 } else { rs1 % rs2 }),
        Mulw => cpu.set_x(i.rd, (rs1.wrapping_mul(rs2) as i32) as i64 as u64),
        Divw => {
            let (a, b) = (rs1 as i32, rs2 as i32);
            let v = if b == 0 {
                -1
            } else if a == i32::MIN && b == -1 {
                a
            } else {
                a / b
            };
            cpu.set_x(i.rd, v as i64 as u64);
        }
        Divuw => {
            let (a, b) = (rs1 as u32, rs2 as u32);
            let v = if b == 0 { u32::MAX } else { a / b };
            cpu.set_x(i.rd, v as i32 as i64 as u64);
        }
        Remw => {
            let (a, b) = (rs1 as i32, rs2 as i32);
            let v = if b == 0 {
                a
            } else if a == i32::MIN && b == -1 {
                0
            } else {
                a % b
            };
            cpu.set_x(i.rd, v as i64 as u64);
        }
        Remuw => {
            let (a, b) = (rs1 as u32, rs2 as u32);
            let v = if b == 0 { a } else { a % b };
            cpu.set_x(i.rd, v as i32 as i64 as u64);
        }

        Fence | FenceI => {}
        Ecall => return Ok(Flow::Ecall),
        Ebreak => return Ok(Flow::Ebreak),

        Csrrw | Csrrs | Csrrc | Csrrwi | Csrrsi | Csrrci => {
            let csr = imm as u64 & 0xfff;
            let old = match csr {
                0x001 => cpu.fcsr & 0x1f,
                0x002 => (cpu.fcsr >> 5) & 0x7,
                0x003 => cpu.fcsr,
                0xc00 | 0xc02 => pc, // cycle/instret: monotonic enough
                0xc01 => pc,
                _ => 0,
            };
            let operand = match i.op {
                Csrrw | Csrrs | Csrrc => rs1,
                _ => i.rs1 as u64,
            };
            let new = match i.op {
                Csrrw | Csrrwi => operand,
                Csrrs | Csrrsi => old | operand,
                _ => old & !operand,
            };
            match csr {
                0x001 => cpu.fcsr = (cpu.fcsr & !0x1f) | (new & 0x1f),
                0x002 => cpu.fcsr = (cpu.fcsr & !0xe0) | ((new & 0x7) << 5),
                0x003 => cpu.fcsr = new & 0xff,
                _ => {}
            }
            cpu.set_x(i.rd, old);
        }

        // A extension: single-threaded between syscalls, so atomics are
        // plain read-modify-writes and lr/sc always succeeds.
        LrW => {
            let v = arena.read_u32(rs1)? as i32 as i64;
            cpu.set_x(i.rd, v as u64);
        }
        LrD => {
            let v = arena.read_u64(rs1)?;
            cpu.set_x(i.rd, v);
        }
        ScW => {
            arena.write_obj(rs1, rs2 as u32)?;
            cpu.set_x(i.rd, 0);
        }
        ScD => {
            arena.write_obj(rs1, rs2)?;
            cpu.set_x(i.rd, 0);
        }
        AmoSwapW | AmoAddW | AmoXorW | AmoAndW | AmoOrW | AmoMinW | AmoMaxW | AmoMinuW
        | AmoMaxuW => {
            let old = arena.read_u32(rs1)?;
            let b = rs2 as u32;
            let new = match i.op {
                AmoSwapW => b,
                AmoAddW => old.wrapping_add(b),
                AmoXorW => old ^ b,
                AmoAndW => old & b,
                AmoOrW => old | b,
                AmoMinW => (old as i32).min(b as i32) as u32,
                AmoMaxW => (old as i32).max(b as i32) as u32,
                AmoMinuW => old.min(b),
                _ => old.max(b),
            };
            arena.write_obj(rs1, new)?;
            cpu.set_x(i.rd, old as i32 as i64 as u64);
        }
        AmoSwapD | AmoAddD | AmoXorD | AmoAndD | AmoOrD | AmoMinD | AmoMaxD | AmoMinuD
        | AmoMaxuD => {
            let old = arena.read_u64(rs1)?;
            let new = match i.op {
                AmoSwapD => rs2,
                AmoAddD => old.wrapping_add(rs2),
                AmoXorD => old ^ rs2,
                AmoAndD => old & rs2,
                AmoOrD => old | rs2,
                AmoMinD => (old as i64).min(rs2 as i64) as u64,
                AmoMaxD => (old as i64).max(rs2 as i64) as u64,
                AmoMinuD => old.min(rs2),
                _ => old.max(rs2),
            };
            arena.write_obj(rs1, new)?;
            cpu.set_x(i.rd, old);
        }

        // F/D extension.
        Flw => {
            let v = arena.read_u32(rs1.wrapping_add(imm as u64))?;
            cpu.f[i.rd as usize] = (v as u64) | 0xffff_ffff_0000_0000;
        }
        Fld => {
            cpu.f[i.rd as usize] = arena.read_u64(rs1.wrapping_add(imm as u64))?;
        }
        Fsw => arena.write_obj(rs1.wrapping_add(imm as u64), cpu.f[i.rs2 as usize] as u32)?,
        Fsd => arena.write_obj(rs1.wrapping_add(imm as u64), cpu.f[i.rs2 as usize])?,

        FaddS | FsubS | FmulS | FdivS | FminS | FmaxS => {
            let a = unbox_f32(cpu.f[i.rs1 as usize]);
            let b = unbox_f32(cpu.f[i.rs2 as usize]);
            let v = match i.op {
                FaddS => a + b,
                FsubS => a - b,
                FmulS => a * b,
                FdivS => a / b,
                FminS => {
                    if a.is_nan() {
                        b
                    } else if b.is_nan() {
                        a
                    } else {
                        a.min(b)
                    }
                }
                _ => {
                    if a.is_nan() {
                        b
                    } else if b.is_nan() {
                        a
                    } else {
                        a.max(b)
                    }
                }
            };
            cpu.f[i.rd as usize] = nanbox(v);
        }
        FsqrtS => {
            cpu.f[i.rd as usize] = nanbox(unbox_f32(cpu.f[i.rs1 as usize]).sqrt());
        }
        FaddD | FsubD | FmulD | FdivD | FminD | FmaxD => {
            let a = f64::from_bits(cpu.f[i.rs1 as usize]);
            let b = f64::from_bits(cpu.f[i.rs2 as usize]);
            let v = match i.op {
                FaddD => a + b,
                FsubD => a - b,
                FmulD => a * b,
                FdivD => a / b,
                FminD => {
                    if a.is_nan() {
                        b
                    } else if b.is_nan() {
                        a
                    } else {
                        a.min(b)
                    }
                }
                _ => {
                    if a.is_nan() {
                        b
                    } else if b.is_nan() {
                        a
                    } else {
                        a.max(b)
                    }
                }
            };
            cpu.f[i.rd as usize] = v.to_bits();
        }
        FsqrtD => {
            cpu.f[i.rd as usize] = f64::from_bits(cpu.f[i.rs1 as usize]).sqrt().to_bits();
        }

        FmaddS | FmsubS | FnmsubS | FnmaddS => {
            let a = unbox_f32(cpu.f[i.rs1 as usize]);
            let b = unbox_f32(cpu.f[i.rs2 as usize]);
            let c = unbox_f32(cpu.f[i.rs3 as usize]);
            let v = match i.op {
                FmaddS => a.mul_add(b, c),
                FmsubS => a.mul_add(b, -c),
                FnmsubS => (-a).mul_add(b, c),
                _ => (-a).mul_add(b, -c),
            };
            cpu.f[i.rd as usize] = nanbox(v);
        }
        FmaddD | FmsubD | FnmsubD | FnmaddD => {
            let a = f64::from_bits(cpu.f[i.rs1 as usize]);
            let b = f64::from_bits(cpu.f[i.rs2 as usize]);
            let c = f64::from_bits(cpu.f[i.rs3 as usize]);
            let v = match i.op {
                FmaddD => a.mul_add(b, c),
                FmsubD => a.mul_add(b, -c),
                FnmsubD => (-a).mul_add(b, c),
                _ => (-a).mul_add(b, -c),
            };
            cpu.f[i.rd as usize] = v.to_bits();
        }

        FsgnjS | FsgnjnS | FsgnjxS => {
            let a = cpu.f[i.rs1 as usize] as u32;
            let b = cpu.f[i.rs2 as usize] as u32;
            let sign = match i.op {
                FsgnjS => b & 0x8000_0000,
                FsgnjnS => !b & 0x8000_0000,
                _ => (a ^ b) & 0x8000_0000,
            };
            cpu.f[i.rd as usize] = ((a & 0x7fff_ffff) | sign) as u64 | 0xffff_ffff_0000_0000;
        }
        FsgnjD | FsgnjnD | FsgnjxD => {
            let a = cpu.f[i.rs1 as usize];
            let b = cpu.f[i.rs2 as usize];
            let sign = match i.op {
                FsgnjD => b & (1 << 63),
                FsgnjnD => !b & (1 << 63),
                _ => (a ^ b) & (1 << 63),
            };
            cpu.f[i.rd as usize] = (a & !(1 << 63)) | sign;
        }

        FeqS | FltS | FleS => {
            let a = unbox_f32(cpu.f[i.rs1 as usize]);
            let b = unbox_f32(cpu.f[i.rs2 as usize]);
            let v = match i.op {
                FeqS => a == b,
                FltS => a < b,
                _ => a <= b,
            };
            cpu.set_x(i.rd, v as u64);
        }
        FeqD | FltD | FleD => {
            let a = f64::from_bits(cpu.f[i.rs1 as usize]);
            let b = f64::from_bits(cpu.f[i.rs2 as usize]);
            let v = match i.op {
                FeqD => a == b,
                FltD => a < b,
                _ => a <= b,
            };
            cpu.set_x(i.rd, v as u64);
        }

        FclassS => cpu.set_x(i.rd, fclass64(unbox_f32(cpu.f[i.rs1 as usize]) as f64)),
        FclassD => cpu.set_x(i.rd, fclass64(f64::from_bits(cpu.f[i.rs1 as usize]))),

        FcvtWS => cpu.set_x(i.rd, cvt_f64_to_i32(unbox_f32(cpu.f[i.rs1 as usize]) as f64, imm) as i64 as u64),
        FcvtWuS => cpu.set_x(i.rd, cvt_f64_to_u32(unbox_f32(cpu.f[i.rs1 as usize]) as f64, imm) as i32 as i64 as u64),
        FcvtLS => cpu.set_x(i.rd, cvt_f64_to_i64(unbox_f32(cpu.f[i.rs1 as usize]) as f64, imm) as u64),
        FcvtLuS => cpu.set_x(i.rd, cvt_f64_to_u64(unbox_f32(cpu.f[i.rs1 as usize]) as f64, imm)),
        FcvtWD => cpu.set_x(i.rd, cvt_f64_to_i32(f64::from_bits(cpu.f[i.rs1 as usize]), imm) as i64 as u64),
        FcvtWuD => cpu.set_x(i.rd, cvt_f64_to_u32(f64::from_bits(cpu.f[i.rs1 as usize]), imm) as i32 as i64 as u64),
        FcvtLD => cpu.set_x(i.rd, cvt_f64_to_i64(f64::from_bits(cpu.f[i.rs1 as usize]), imm) as u64),
        FcvtLuD => cpu.set_x(i.rd, cvt_f64_to_u64(f64::from_bits(cpu.f[i.rs1 as usize]), imm)),
        FcvtSW => cpu.f[i.rd as usize] = nanbox(rs1 as i32 as f32),
        FcvtSWu => cpu.f[i.rd as usize] = nanbox(rs1 as u32 as f32),
        FcvtSL => cpu.f[i.rd as usize] = nanbox(rs1 as i64 as f32),
        FcvtSLu => cpu.f[i.rd as usize] = nanbox(rs1 as f32),
        FcvtDW => cpu.f[i.rd as usize] = (rs1 as i32 as f64).to_bits(),
        FcvtDWu => cpu.f[i.rd as usize] = (rs1 as u32 as f64).to_bits(),
        FcvtDL => cpu.f[i.rd as usize] = (rs1 as i64 as f64).to_bits(),
        FcvtDLu => cpu.f[i.rd as usize] = (rs1 as f64).to_bits(),
        FcvtSD => cpu.f[i.rd as usize] = nanbox(f64::from_bits(cpu.f[i.rs1 as usize]) as f32),
        FcvtDS => cpu.f[i.rd as usize] = (unbox_f32(cpu.f[i.rs1 as usize]) as f64).to_bits(),

        FmvXW => cpu.set_x(i.rd, cpu.f[i.rs1 as usize] as u32 as i32 as i64 as u64),
        FmvWX => cpu.f[i.rd as usize] = (rs1 as u32 as u64) | 0xffff_ffff_0000_0000,
        FmvXD => cpu.set_x(i.rd, cpu.f[i.rs1 as usize]),
        FmvDX => cpu.f[i.rd as usize] = rs1,

        Unknown => return Ok(Flow::Bad),
    }
    Ok(Flow::Next)
}

fn fclass64(v: f64) -> u64 {
    if v.is_nan() {
        // Quiet vs signaling: report quiet.
        return 1 << 9;
    }
    match (v.is_sign_negative(), v.is_infinite(), v == 0.0, v.is_subnormal()) {
        (true, true, _, _) => 1 << 0,
        (true, _, true, _) => 1 << 3,
        (true, _, _, true) => 1 << 2,
        (true, _, _, _) => 1 << 1,
        (false, true, _, _) => 1 << 7,
        (false, _, true, _) => 1 << 4,
        (false, _, _, true) => 1 << 5,
        (false, _, _, _) => 1 << 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(words: &[u32]) -> (CpuState, Arena, BlockCache) {
        let mut arena = Arena::new_owned(64 * arena::PAGE_SIZE);
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        arena.poke(0x1000, &bytes).unwrap();
        arena
            .set_page_attr(0x2000, 8 * arena::PAGE_SIZE, arena::PageAttrs::RW)
            .unwrap();
        let mut cpu = CpuState::default();
        cpu.pc = 0x1000;
        (cpu, arena, BlockCache::default())
    }

    #[test]
    fn alu_chain() {
        // addi x5, x0, 7 ; slli x6, x5, 4 ; sub x7, x6, x5 ; ecall
        let (mut cpu, mut arena, mut cache) =
            setup(&[0x0070_0293, 0x0042_9313, 0x4053_03b3, 0x0000_0073]);
        let mut counts = FxHashMap::default();
        let stop = run_quantum(&mut cpu, &mut arena, &mut cache, 1000, &mut counts);
        assert_eq!(stop, InterpStop::Ecall);
        assert_eq!(cpu.get_x(5), 7);
        assert_eq!(cpu.get_x(6), 112);
        assert_eq!(cpu.get_x(7), 105);
        assert_eq!(cpu.pc, 0x100c);
    }

    #[test]
    fn loads_and_stores_round_trip() {
        // sd x5, 0(x6) ; ld x7, 0(x6) ; ecall
        let (mut cpu, mut arena, mut cache) = setup(&[0x0053_3023, 0x0003_3383, 0x0000_0073]);
        cpu.set_x(5, 0xdead_beef_cafe_f00d);
        cpu.set_x(6, 0x2000);
        let mut counts = FxHashMap::default();
        run_quantum(&mut cpu, &mut arena, &mut cache, 100, &mut counts);
        assert_eq!(cpu.get_x(7), 0xdead_beef_cafe_f00d);
    }

    #[test]
    fn store_to_protected_page_faults() {
        // sd x5, 0(x6) with x6 pointing at an unmapped page.
        let (mut cpu, mut arena, mut cache) = setup(&[0x0053_3023]);
        cpu.set_x(6, 0x30000);
        let mut counts = FxHashMap::default();
        let stop = run_quantum(&mut cpu, &mut arena, &mut cache, 100, &mut counts);
        assert_eq!(stop, InterpStop::Fault(0x30000));
        // pc still points at the faulting instruction for the retry.
        assert_eq!(cpu.pc, 0x1000);
    }

    #[test]
    fn division_edges() {
        // div x7, x5, x6 ; rem x28, x5, x6 ; ecall
        let (mut cpu, mut arena, mut cache) = setup(&[0x0262_c3b3, 0x0262_ee33, 0x0000_0073]);
        cpu.set_x(5, i64::MIN as u64);
        cpu.set_x(6, -1i64 as u64);
        let mut counts = FxHashMap::default();
        run_quantum(&mut cpu, &mut arena, &mut cache, 100, &mut counts);
        assert_eq!(cpu.get_x(7), i64::MIN as u64);
        assert_eq!(cpu.get_x(28), 0);
    }

    #[test]
    fn loop_terminates_on_quantum() {
        // jal x0, 0 (tight self-loop)
        let (mut cpu, mut arena, mut cache) = setup(&[0x0000_006f]);
        let mut counts = FxHashMap::default();
        let stop = run_quantum(&mut cpu, &mut arena, &mut cache, 100, &mut counts);
        assert_eq!(stop, InterpStop::Quantum);
        assert_eq!(cpu.pc, 0x1000);
    }

    #[test]
    fn double_arithmetic() {
        // fmv.d.x f1, x5 ; fmv.d.x f2, x6 ; fadd.d f3, f1, f2 ; fmv.x.d x7, f3 ; ecall
        let (mut cpu, mut arena, mut cache) = setup(&[
            0xf202_80d3, // fmv.d.x f1, x5
            0xf203_0153, // fmv.d.x f2, x6
            0x0220_81d3, // fadd.d f3, f1, f2
            0xe201_83d3, // fmv.x.d x7, f3
            0x0000_0073,
        ]);
        cpu.set_x(5, 1.5f64.to_bits());
        cpu.set_x(6, 2.25f64.to_bits());
        let mut counts = FxHashMap::default();
        run_quantum(&mut cpu, &mut arena, &mut cache, 100, &mut counts);
        assert_eq!(f64::from_bits(cpu.get_x(7)), 3.75);
    }
}
