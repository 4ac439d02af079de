//! Tier equivalence: the same guest program must produce byte-identical
//! output under the pure interpreter, ahead-of-time baseline translation,
//! and the optimized (register-caching) tier.

mod common;

use common::*;
use vmm::CompileTier;

fn run_all_tiers(words: &[u32]) -> Vec<Vec<u8>> {
    let mut outputs = Vec::new();

    // Pure interpreter.
    let fs = rootfs_with(&[("/bin/prog", words, LOAD_BASE)]);
    let mut cfg = test_config();
    cfg.enable_jit = false;
    let (code, out) = run_to_exit(cfg, fs, "/bin/prog", b"");
    assert_eq!(code, 0);
    outputs.push(out);

    // AOT tiers.
    for tier in [CompileTier::Baseline, CompileTier::Optimized] {
        let fs = rootfs_with(&[("/bin/prog", words, LOAD_BASE)]);
        let mut cfg = test_config();
        // Keep background compilation and promotion quiet so the tier
        // under test is the one that runs.
        cfg.jit.hot_threshold = u32::MAX;
        cfg.jit.optimize_threshold = u32::MAX;
        let io = std::sync::Arc::new(bridge::LocalIo::new(b""));
        let mut emu = build_emu(cfg, fs, "/bin/prog", io.clone());
        emu.compile_entry_region(tier).unwrap();
        assert!(emu.jit.has_region(emu.cpu.pc));
        let code = emu.run().unwrap();
        assert_eq!(code, 0);
        assert!(emu.jit.stats().dispatches > 0, "tier {tier:?} never dispatched");
        outputs.push(io.stdout());
    }
    outputs
}

/// Register dependency chain: add, xor, add, mul-by-3, add, rotate over
/// 1000 iterations, then a mixing hash written to stdout.
#[test]
fn register_chain_hash_matches_across_tiers() {
    let mut w = vec![
        addi(5, 0, 1),
        addi(6, 0, 2),
        addi(7, 0, 3),
        addi(9, 0, 1000),
        addi(28, 0, 3),
    ];
    // loop:
    w.extend([
        add(5, 5, 6),
        xor(6, 6, 7),
        add(7, 7, 5),
        mul(6, 6, 28),
        add(5, 5, 7),
        slli(29, 7, 1),
        srli(30, 7, 63),
        or(7, 29, 30),
        addi(9, 9, -1),
        bne(9, 0, -36),
    ]);
    // hash = x5 ^ (x6 << 13) ^ (x7 >> 7) ^ (x5 + x6 + x7)
    w.extend([
        slli(29, 6, 13),
        srli(30, 7, 7),
        add(31, 5, 6),
        add(31, 31, 7),
        xor(28, 5, 29),
        xor(28, 28, 30),
        xor(28, 28, 31),
        addi(11, 2, -16),
        sd(28, 11, 0),
        addi(17, 0, 64),
        addi(10, 0, 1),
        addi(12, 0, 8),
        ecall(),
    ]);
    w.extend(exit_seq(0));

    let outputs = run_all_tiers(&w);

    // Reference value computed the same way on the host.
    let (mut a, mut b, mut c) = (1u64, 2u64, 3u64);
    for _ in 0..1000 {
        a = a.wrapping_add(b);
        b ^= c;
        c = c.wrapping_add(a);
        b = b.wrapping_mul(3);
        a = a.wrapping_add(c);
        c = c.rotate_left(1);
    }
    let hash = a ^ (b << 13) ^ (c >> 7) ^ a.wrapping_add(b).wrapping_add(c);

    for out in &outputs {
        assert_eq!(out.as_slice(), hash.to_le_bytes());
    }
}

/// Stack-buffer stores and reloads: proves general memory traffic is not
/// mistakenly register-cached in locals.
#[test]
fn memory_sums_match_across_tiers() {
    let mut w = vec![addi(20, 2, -1024)];
    w.extend(li32(21, 0xdead_beef));
    w.extend([addi(9, 0, 0), addi(22, 0, 64)]);
    // fill: buf[i] = i * C + i
    w.extend([
        mul(28, 9, 21),
        add(28, 28, 9),
        slli(29, 9, 3),
        add(29, 29, 20),
        sd(28, 29, 0),
        addi(9, 9, 1),
        bne(9, 22, -24),
    ]);
    w.extend([addi(9, 0, 0), addi(30, 0, 0)]);
    // sum: sum += buf[i]; sum ^= sum << 3
    w.extend([
        slli(29, 9, 3),
        add(29, 29, 20),
        ld(28, 29, 0),
        add(30, 30, 28),
        slli(31, 30, 3),
        xor(30, 30, 31),
        addi(9, 9, 1),
        bne(9, 22, -28),
    ]);
    w.extend([
        sd(30, 20, 0),
        addi(11, 20, 0),
        addi(17, 0, 64),
        addi(10, 0, 1),
        addi(12, 0, 8),
        ecall(),
    ]);
    w.extend(exit_seq(0));

    let outputs = run_all_tiers(&w);

    let c = 0xdead_beefu64;
    let mut buf = [0u64; 64];
    for i in 0..64u64 {
        buf[i as usize] = i.wrapping_mul(c).wrapping_add(i);
    }
    let mut sum = 0u64;
    for v in buf {
        sum = sum.wrapping_add(v);
        sum ^= sum << 3;
    }
    for out in &outputs {
        assert_eq!(out.as_slice(), sum.to_le_bytes());
    }
}

/// Computation alternating with write(1, ..) 100 times: syscall
/// boundaries inside dispatch chains must preserve program order.
#[test]
fn interleaved_writes_match_across_tiers() {
    let mut w = vec![addi(9, 0, 100), addi(20, 0, 17), addi(21, 2, -16)];
    w.extend([
        addi(28, 0, 31),
        mul(20, 20, 28),
        addi(20, 20, 7),
        sb(20, 21, 0),
        addi(17, 0, 64),
        addi(10, 0, 1),
        addi(11, 21, 0),
        addi(12, 0, 1),
        ecall(),
        addi(9, 9, -1),
        bne(9, 0, -40),
    ]);
    w.extend(exit_seq(0));

    let outputs = run_all_tiers(&w);

    let mut expected = Vec::new();
    let mut x: u64 = 17;
    for _ in 0..100 {
        x = x.wrapping_mul(31).wrapping_add(7);
        expected.push(x as u8);
    }
    for out in &outputs {
        assert_eq!(out, &expected, "stdout must be byte-identical in order");
    }
}
