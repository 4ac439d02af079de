//! Cross-region dispatch: two functions in different 16 KiB regions,
//! called alternately. Compiled code must chain between regions and the
//! JIT statistics must account for both.

mod common;

use common::*;
use vmm::CompileTier;

const F2_WORD: usize = 0x4100 / 4; // 0x14100, the next 16 KiB region

fn cross_region_program(iterations_li: &[u32]) -> Vec<u32> {
    let mut w = Vec::new();
    w.push(addi(9, 0, 0)); // w0: i = 0
    let mut idx = 1;
    w.extend_from_slice(iterations_li); // x22 = iteration count
    idx += iterations_li.len();
    w.push(addi(20, 0, 0)); // acc = 0
    idx += 1;
    let loop_start = idx;
    // jal x1, f1 (at 0x10100 == word 64)
    w.push(jal(1, ((64 - idx as i32) * 4) as i32));
    idx += 1;
    // jal x1, f2
    w.push(jal(1, ((F2_WORD as i32 - idx as i32) * 4) as i32));
    idx += 1;
    w.push(addi(9, 9, 1));
    idx += 1;
    w.push(bne(9, 22, (loop_start as i32 - idx as i32) * 4));
    idx += 1;
    // write the accumulator and exit
    w.push(addi(11, 2, -16));
    w.push(sd(20, 11, 0));
    w.push(addi(17, 0, 64));
    w.push(addi(10, 0, 1));
    w.push(addi(12, 0, 8));
    w.push(ecall());
    w.extend(exit_seq(0));

    // f1 at word 64 (0x10100): acc += 3; ret
    while w.len() < 64 {
        w.push(0); // never executed
    }
    w.push(addi(20, 20, 3));
    w.push(jalr(0, 1, 0));

    // f2 at 0x14100: acc += i; ret
    while w.len() < F2_WORD {
        w.push(0);
    }
    w.push(add(20, 20, 9));
    w.push(jalr(0, 1, 0));
    w
}

#[test]
fn alternating_calls_chain_between_compiled_regions() {
    let w = cross_region_program(&[addi(22, 0, 1000)]);
    let fs = rootfs_with(&[("/bin/pingpong", &w, LOAD_BASE)]);
    let mut cfg = test_config();
    cfg.jit.hot_threshold = u32::MAX; // only the AOT-compiled regions run

    let io = std::sync::Arc::new(bridge::LocalIo::new(b""));
    let mut emu = build_emu(cfg, fs, "/bin/pingpong", io.clone());
    emu.jit
        .compile_now(&emu.arena, 0x10000, CompileTier::Baseline)
        .unwrap();
    emu.jit
        .compile_now(&emu.arena, 0x14100, CompileTier::Baseline)
        .unwrap();
    assert!(emu.jit.has_region(0x10000));
    assert!(emu.jit.has_region(0x14100));

    let code = emu.run().unwrap();
    assert_eq!(code, 0);

    // acc = 1000 * 3 + sum(0..1000)
    let expected: u64 = 3000 + (0..1000u64).sum::<u64>();
    assert_eq!(io.stdout().as_slice(), expected.to_le_bytes());

    let stats = emu.jit.stats();
    assert!(stats.dispatches > 0);
    assert!(stats.max_chain >= 1, "calls must chain across regions");
    assert!(stats.region_misses > 0);
}

#[test]
fn hot_loop_gets_compiled_in_the_background() {
    let w = cross_region_program(&li32(22, 400_000));
    let fs = rootfs_with(&[("/bin/pingpong", &w, LOAD_BASE)]);
    let mut cfg = test_config();
    cfg.jit.hot_threshold = 50;
    cfg.jit.compile_budget_per_second = 1000.0;
    cfg.interp_quantum = 20_000;

    let io = std::sync::Arc::new(bridge::LocalIo::new(b""));
    let mut emu = build_emu(cfg, fs, "/bin/pingpong", io.clone());
    let code = emu.run().unwrap();
    assert_eq!(code, 0);

    let expected: u64 = 3 * 400_000 + (0..400_000u64).sum::<u64>();
    assert_eq!(io.stdout().as_slice(), expected.to_le_bytes());

    let stats = emu.jit.stats();
    assert!(
        stats.compiles_ok >= 1,
        "a 400k-iteration loop must go hot and compile: {stats:?}"
    );
    assert!(stats.dispatches > 0, "compiled code must actually run: {stats:?}");
}
