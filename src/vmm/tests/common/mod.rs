//! Shared harness for the end-to-end tests: a tiny riscv64 assembler and
//! an emulator builder over an in-memory rootfs.

#![allow(dead_code)]

use vfs::{Node, Vfs};
use vmm::{EmuConfig, Emulator};

// === Instruction encoders (32-bit forms only) === //

pub fn r_type(f7: u32, rs2: u32, rs1: u32, f3: u32, rd: u32, op: u32) -> u32 {
    (f7 << 25) | (rs2 << 20) | (rs1 << 15) | (f3 << 12) | (rd << 7) | op
}

pub fn i_type(imm: i32, rs1: u32, f3: u32, rd: u32, op: u32) -> u32 {
    ((imm as u32 & 0xfff) << 20) | (rs1 << 15) | (f3 << 12) | (rd << 7) | op
}

pub fn s_type(imm: i32, rs2: u32, rs1: u32, f3: u32, op: u32) -> u32 {
    let imm = imm as u32;
    ((imm >> 5 & 0x7f) << 25) | (rs2 << 20) | (rs1 << 15) | (f3 << 12) | ((imm & 0x1f) << 7) | op
}

pub fn b_type(imm: i32, rs2: u32, rs1: u32, f3: u32) -> u32 {
    let imm = imm as u32;
    ((imm >> 12 & 1) << 31)
        | ((imm >> 5 & 0x3f) << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (f3 << 12)
        | ((imm >> 1 & 0xf) << 8)
        | ((imm >> 11 & 1) << 7)
        | 0x63
}

pub fn j_type(imm: i32, rd: u32) -> u32 {
    let imm = imm as u32;
    ((imm >> 20 & 1) << 31)
        | ((imm >> 1 & 0x3ff) << 21)
        | ((imm >> 11 & 1) << 20)
        | ((imm >> 12 & 0xff) << 12)
        | (rd << 7)
        | 0x6f
}

pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 0, rd, 0x13)
}

pub fn addiw(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 0, rd, 0x1b)
}

pub fn lui(rd: u32, imm20: u32) -> u32 {
    (imm20 << 12) | (rd << 7) | 0x37
}

pub fn slli(rd: u32, rs1: u32, sh: u32) -> u32 {
    i_type(sh as i32, rs1, 1, rd, 0x13)
}

pub fn srli(rd: u32, rs1: u32, sh: u32) -> u32 {
    i_type(sh as i32, rs1, 5, rd, 0x13)
}

pub fn add(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0, rs2, rs1, 0, rd, 0x33)
}

pub fn sub(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0x20, rs2, rs1, 0, rd, 0x33)
}

pub fn xor(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0, rs2, rs1, 4, rd, 0x33)
}

pub fn or(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0, rs2, rs1, 6, rd, 0x33)
}

pub fn and(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0, rs2, rs1, 7, rd, 0x33)
}

pub fn mul(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(1, rs2, rs1, 0, rd, 0x33)
}

pub fn ld(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 3, rd, 0x03)
}

pub fn sd(rs2: u32, rs1: u32, imm: i32) -> u32 {
    s_type(imm, rs2, rs1, 3, 0x23)
}

pub fn lbu(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 4, rd, 0x03)
}

pub fn lhu(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 5, rd, 0x03)
}

pub fn sb(rs2: u32, rs1: u32, imm: i32) -> u32 {
    s_type(imm, rs2, rs1, 0, 0x23)
}

pub fn beq(rs1: u32, rs2: u32, imm: i32) -> u32 {
    b_type(imm, rs2, rs1, 0)
}

pub fn bne(rs1: u32, rs2: u32, imm: i32) -> u32 {
    b_type(imm, rs2, rs1, 1)
}

pub fn bge(rs1: u32, rs2: u32, imm: i32) -> u32 {
    b_type(imm, rs2, rs1, 5)
}

pub fn blt(rs1: u32, rs2: u32, imm: i32) -> u32 {
    b_type(imm, rs2, rs1, 4)
}

pub fn jal(rd: u32, imm: i32) -> u32 {
    j_type(imm, rd)
}

pub fn jalr(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 0, rd, 0x67)
}

pub fn ecall() -> u32 {
    0x0000_0073
}

/// Loads a 32-bit constant into `rd` (clobbers nothing else).
pub fn li32(rd: u32, value: u32) -> Vec<u32> {
    let hi = (value.wrapping_add(0x800)) >> 12;
    let lo = (value & 0xfff) as i32;
    let lo = if lo >= 0x800 { lo - 0x1000 } else { lo };
    let mut out = vec![lui(rd, hi & 0xfffff)];
    out.push(addiw(rd, rd, lo));
    // lui sign-extends; clear the upper half for an unsigned constant.
    out.push(slli(rd, rd, 32));
    out.push(srli(rd, rd, 32));
    out
}

/// exit_group(code).
pub fn exit_seq(code: i32) -> Vec<u32> {
    vec![addi(17, 0, 94), addi(10, 0, code), ecall()]
}

/// Packs string bytes into instruction words (placed after the final
/// exit, so they are data, never executed).
pub fn data_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks(4)
        .map(|c| {
            let mut w = [0u8; 4];
            w[..c.len()].copy_from_slice(c);
            u32::from_le_bytes(w)
        })
        .collect()
}

// === Harness === //

pub const LOAD_BASE: u64 = 0x10000;

pub fn rootfs_with(programs: &[(&str, &[u32], u64)]) -> Vfs {
    let mut fs = Vfs::new();
    fs.mkdir_all("/bin").unwrap();
    for (path, words, vaddr) in programs {
        let code: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let elf = loader::synth::make_static_elf(&code, *vaddr);
        fs.create_at(path, Node::regular(0o755, elf)).unwrap();
    }
    fs.populate_defaults("krill-test");
    fs
}

pub fn test_config() -> EmuConfig {
    let mut cfg = EmuConfig::default();
    cfg.arena_size = 64 * 1024 * 1024;
    cfg.interp_quantum = 100_000;
    cfg
}

pub fn build_emu(cfg: EmuConfig, fs: Vfs, entry: &str, io: std::sync::Arc<bridge::LocalIo>) -> Emulator {
    let mut emu = Emulator::new(cfg, fs, Box::new(io)).unwrap();
    emu.load(entry, &[entry.to_string()], &vmm::default_env("krill-test"))
        .unwrap();
    emu
}

/// Runs `entry` to completion; returns (exit code, stdout bytes).
pub fn run_to_exit(cfg: EmuConfig, fs: Vfs, entry: &str, stdin: &[u8]) -> (i32, Vec<u8>) {
    let io = std::sync::Arc::new(bridge::LocalIo::new(stdin));
    let mut emu = build_emu(cfg, fs, entry, io.clone());
    let code = emu.run().unwrap();
    (code, io.stdout())
}
