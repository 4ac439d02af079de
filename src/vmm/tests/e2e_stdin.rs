//! Blocking stdin over the real bridge: the guest's read(0, ...) arrives
//! before any input exists, the machine stops with the pc rewound, and
//! the retried ecall picks the bytes up once the foreground supplies
//! them.

mod common;

use std::time::Duration;

use common::*;

#[test]
fn read_blocks_until_the_foreground_types() {
    // read(0, sp-64, 16); write(1, sp-64, a0); exit(0)
    let mut w = Vec::new();
    w.push(addi(17, 0, 63)); // w0: read
    w.push(addi(10, 0, 0)); // w1
    w.push(addi(11, 2, -64)); // w2
    w.push(addi(12, 0, 16)); // w3
    w.push(ecall()); // w4
    w.push(addi(12, 10, 0)); // w5: len = bytes read
    w.push(addi(17, 0, 64)); // w6: write
    w.push(addi(10, 0, 1)); // w7
    w.push(addi(11, 2, -64)); // w8
    w.push(ecall()); // w9
    w.extend(exit_seq(0));

    let fs = rootfs_with(&[("/bin/cat1", &w, LOAD_BASE)]);
    let (worker_io, fg) = bridge::channel();

    let guest = std::thread::spawn(move || {
        let mut emu = vmm::Emulator::new(test_config(), fs, Box::new(worker_io)).unwrap();
        emu.load(
            "/bin/cat1",
            &["cat1".to_string()],
            &vmm::default_env("krill-test"),
        )
        .unwrap();
        emu.run().unwrap()
    });

    // Give the guest time to reach the blocking read, then type.
    std::thread::sleep(Duration::from_millis(50));
    assert!(fg.exited().is_none(), "guest must be parked on stdin");
    fg.push_stdin(b"hi krill\n");

    let code = guest.join().unwrap();
    assert_eq!(code, 0);
    assert_eq!(fg.exited(), Some(0));
    assert_eq!(fg.drain_stdout(), b"hi krill\n");
}
