//! Directory listing end-to-end: a static guest walks `/` via openat +
//! getdents64 and prints one name per line, like a minimal `ls /`.

mod common;

use common::*;
use vfs::Node;

#[test]
fn guest_ls_lists_root_lexicographically() {
    // Word layout is position-sensitive; see the offsets in the jumps.
    let mut w = Vec::new();
    // openat(AT_FDCWD, "/", O_RDONLY | O_DIRECTORY)
    w.push(addi(17, 0, 56)); // w0
    w.push(addi(10, 0, -100)); // w1
    w.push(lui(11, 0x10)); // w2
    w.push(addi(11, 11, 172)); // w3: "/" at w43
    w.push(lui(12, 0x10)); // w4: O_DIRECTORY = 0o200000
    w.push(addi(13, 0, 0)); // w5
    w.push(ecall()); // w6
    w.push(addi(20, 10, 0)); // w7: fd
    // getdents64(fd, sp-2048, 1024)
    w.push(addi(17, 0, 61)); // w8
    w.push(addi(10, 20, 0)); // w9
    w.push(addi(11, 2, -2048)); // w10
    w.push(addi(21, 11, 0)); // w11: buf
    w.push(addi(12, 0, 1024)); // w12
    w.push(ecall()); // w13
    w.push(addi(22, 10, 0)); // w14: nread
    w.push(addi(9, 0, 0)); // w15: cursor
    // loop: while cursor < nread
    w.push(bge(9, 22, 96)); // w16 -> w40 (done)
    w.push(add(23, 21, 9)); // w17: rec
    w.push(lhu(24, 23, 16)); // w18: reclen
    w.push(addi(25, 23, 19)); // w19: name
    w.push(addi(26, 0, 0)); // w20: len
    // strlen:
    w.push(add(28, 25, 26)); // w21
    w.push(lbu(29, 28, 0)); // w22
    w.push(beq(29, 0, 12)); // w23 -> w26
    w.push(addi(26, 26, 1)); // w24
    w.push(jal(0, -16)); // w25 -> w21
    // write(1, name, len)
    w.push(addi(17, 0, 64)); // w26
    w.push(addi(10, 0, 1)); // w27
    w.push(addi(11, 25, 0)); // w28
    w.push(addi(12, 26, 0)); // w29
    w.push(ecall()); // w30
    // write(1, "\n", 1)
    w.push(addi(28, 0, 10)); // w31
    w.push(sb(28, 21, -1)); // w32
    w.push(addi(17, 0, 64)); // w33
    w.push(addi(10, 0, 1)); // w34
    w.push(addi(11, 21, -1)); // w35
    w.push(addi(12, 0, 1)); // w36
    w.push(ecall()); // w37
    w.push(add(9, 9, 24)); // w38: cursor += reclen
    w.push(jal(0, -92)); // w39 -> w16
    // done:
    w.extend(exit_seq(0)); // w40..w42
    assert_eq!(w.len(), 43);
    w.extend(data_words(b"/\0")); // w43

    let mut fs = rootfs_with(&[("/bin/ls", &w, LOAD_BASE)]);
    fs.create_at("/alpha.txt", Node::regular(0o644, b"a".to_vec()))
        .unwrap();
    fs.create_at("/zeta.txt", Node::regular(0o644, b"z".to_vec()))
        .unwrap();

    let (code, out) = run_to_exit(test_config(), fs, "/bin/ls", b"");
    assert_eq!(code, 0);

    let text = String::from_utf8(out).unwrap();
    let names: Vec<&str> = text.lines().collect();
    // "." and ".." first, then children in lexicographic order.
    assert_eq!(names[0], ".");
    assert_eq!(names[1], "..");
    let children = &names[2..];
    let mut sorted = children.to_vec();
    sorted.sort_unstable();
    assert_eq!(children, &sorted[..], "listing must be lexicographic");
    assert!(children.contains(&"alpha.txt"));
    assert!(children.contains(&"zeta.txt"));
    assert!(children.contains(&"bin"));
    assert_eq!(*children.first().unwrap(), "alpha.txt");
    assert_eq!(*children.last().unwrap(), "zeta.txt");
}
