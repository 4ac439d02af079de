//! Cooperative fork plus execve: a shell-like parent forks, the child
//! execs an echo binary, the parent waits and prints its prompt with all
//! of its pre-fork state intact.

mod common;

use common::*;

const ECHO_BASE: u64 = 0x18000;

fn echo_program() -> Vec<u32> {
    let mut w = Vec::new();
    w.push(addi(17, 0, 64)); // w0 write
    w.push(addi(10, 0, 1)); // w1
    w.push(lui(11, 0x18)); // w2
    w.push(addi(11, 11, 36)); // w3: "hello\n" at w9
    w.push(addi(12, 0, 6)); // w4
    w.push(ecall()); // w5
    w.extend(exit_seq(0)); // w6..w8
    assert_eq!(w.len(), 9);
    w.extend(data_words(b"hello\n"));
    w
}

fn shell_program() -> Vec<u32> {
    let mut w = Vec::new();
    // clone(SIGCHLD)
    w.push(addi(17, 0, 220)); // w0
    w.push(addi(10, 0, 17)); // w1
    w.push(addi(11, 0, 0)); // w2
    w.push(addi(12, 0, 0)); // w3
    w.push(addi(13, 0, 0)); // w4
    w.push(addi(14, 0, 0)); // w5
    w.push(ecall()); // w6
    w.push(bne(10, 0, 32)); // w7 -> w15 (parent)
    // child: execve("/bin/echo", NULL, NULL)
    w.push(lui(10, 0x10)); // w8
    w.push(addi(10, 10, 156)); // w9: path at w39
    w.push(addi(11, 0, 0)); // w10
    w.push(addi(12, 0, 0)); // w11
    w.push(addi(17, 0, 221)); // w12
    w.push(ecall()); // w13
    w.push(jal(0, 88)); // w14 -> w36 (exec failed)
    // parent:
    w.push(addi(20, 10, 0)); // w15: child pid
    w.push(addi(17, 0, 260)); // w16: wait4
    w.push(addi(10, 0, -1)); // w17
    w.push(addi(11, 2, -64)); // w18: wstatus
    w.push(addi(12, 0, 0)); // w19
    w.push(addi(13, 0, 0)); // w20
    w.push(ecall()); // w21
    w.push(bne(10, 20, 44)); // w22 -> w33 (wrong pid)
    // prompt '$'
    w.push(addi(28, 0, 36)); // w23
    w.push(sb(28, 2, -128)); // w24
    w.push(addi(17, 0, 64)); // w25
    w.push(addi(10, 0, 1)); // w26
    w.push(addi(11, 2, -128)); // w27
    w.push(addi(12, 0, 1)); // w28
    w.push(ecall()); // w29
    w.extend(exit_seq(0)); // w30..w32
    // wrong pid from wait4:
    w.extend(exit_seq(3)); // w33..w35
    // exec failure in the child:
    w.extend(exit_seq(127)); // w36..w38
    assert_eq!(w.len(), 39);
    w.extend(data_words(b"/bin/echo\0")); // w39
    w
}

#[test]
fn fork_exec_wait_round_trip() {
    let shell = shell_program();
    let echo = echo_program();
    let fs = rootfs_with(&[
        ("/bin/shell", &shell, LOAD_BASE),
        ("/bin/echo", &echo, ECHO_BASE),
    ]);

    let (code, out) = run_to_exit(test_config(), fs, "/bin/shell", b"");
    assert_eq!(code, 0, "parent must exit cleanly after wait4");
    assert_eq!(out, b"hello\n$", "child output, then the parent prompt");
}

/// The fork snapshot must also cover descriptors: a file the child opens
/// is closed again when the parent resumes, and wait4 reports the child's
/// exit status.
#[test]
fn fork_restores_parent_fd_table() {
    let mut w = Vec::new();
    // clone(SIGCHLD)
    w.push(addi(17, 0, 220)); // w0
    w.push(addi(10, 0, 17)); // w1
    w.push(addi(11, 0, 0)); // w2
    w.push(addi(12, 0, 0)); // w3
    w.push(addi(13, 0, 0)); // w4
    w.push(addi(14, 0, 0)); // w5
    w.push(ecall()); // w6
    w.push(bne(10, 0, 40)); // w7 -> w17 (parent)
    // child: openat(AT_FDCWD, "/etc/passwd", 0), then exit(7)
    w.push(addi(17, 0, 56)); // w8
    w.push(addi(10, 0, -100)); // w9
    w.push(lui(11, 0x10)); // w10
    w.push(addi(11, 11, 148)); // w11: path at w37
    w.push(addi(12, 0, 0)); // w12
    w.push(ecall()); // w13
    w.push(addi(17, 0, 94)); // w14
    w.push(addi(10, 0, 7)); // w15
    w.push(ecall()); // w16
    // parent: wait4(-1, sp-64, 0, 0)
    w.push(addi(17, 0, 260)); // w17
    w.push(addi(10, 0, -1)); // w18
    w.push(addi(11, 2, -64)); // w19
    w.push(addi(12, 0, 0)); // w20
    w.push(addi(13, 0, 0)); // w21
    w.push(ecall()); // w22
    // wstatus must encode exit code 7.
    w.push(ld(28, 2, -64)); // w23
    w.push(addi(29, 0, 7 << 8)); // w24
    w.push(bne(28, 29, 36)); // w25 -> w34 (fail)
    // parent reopens: the child's fd must be gone, so this yields 3.
    w.push(addi(17, 0, 56)); // w26
    w.push(addi(10, 0, -100)); // w27
    w.push(lui(11, 0x10)); // w28
    w.push(addi(11, 11, 148)); // w29
    w.push(addi(12, 0, 0)); // w30
    w.push(ecall()); // w31
    // exit(fd)
    w.push(addi(17, 0, 94)); // w32
    w.push(ecall()); // w33
    w.extend(exit_seq(9)); // w34..w36: status mismatch
    assert_eq!(w.len(), 37);
    w.extend(data_words(b"/etc/passwd\0")); // w37

    let fs = rootfs_with(&[("/bin/forker", &w, LOAD_BASE)]);
    let (code, _) = run_to_exit(test_config(), fs, "/bin/forker", b"");
    assert_eq!(code, 3, "the parent's next fd must be the lowest free one");
}
