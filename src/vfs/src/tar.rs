//! ustar/GNU tar ingestion and export.
//!
//! Ingestion accepts the streams docker/podman produce for rootfs
//! archives: ustar headers, GNU `L`/`K` long-name records, pax headers
//! (skipped), and entries arriving before their parent directories.
//! Export produces a ustar stream that re-ingests to the same tree.

use crate::node::{Node, NodeKind};
use crate::{Error, Result, Vfs};

const BLOCK: usize = 512;

fn parse_octal(field: &[u8]) -> u64 {
    // GNU base-256 extension for large values.
    if field.first().map_or(false, |b| b & 0x80 != 0) {
        let mut v: u64 = (field[0] & 0x7f) as u64;
        for &b in &field[1..] {
            v = (v << 8) | b as u64;
        }
        return v;
    }
    let mut v = 0u64;
    for &b in field {
        match b {
            b'0'..=b'7' => v = v * 8 + (b - b'0') as u64,
            b' ' | 0 => {
                if v != 0 {
                    break;
                }
            }
            _ => break,
        }
    }
    v
}

fn parse_name(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn header_checksum(block: &[u8]) -> u64 {
    let mut sum = 0u64;
    for (i, &b) in block.iter().enumerate().take(BLOCK) {
        sum += if (148..156).contains(&i) { b' ' as u64 } else { b as u64 };
    }
    sum
}

pub fn load_tar(vfs: &mut Vfs, data: &[u8]) -> Result<()> {
    let mut off = 0usize;
    let mut pending_name: Option<String> = None;
    let mut pending_link: Option<String> = None;

    while off + BLOCK <= data.len() {
        let block = &data[off..off + BLOCK];
        if block.iter().all(|&b| b == 0) {
            break;
        }
        let magic = &block[257..263];
        if magic != b"ustar\0" && magic != b"ustar " {
            return Err(Error::BadTar(format!("bad magic at offset {off:#x}")));
        }
        let stored_sum = parse_octal(&block[148..156]);
        if stored_sum != header_checksum(block) {
            return Err(Error::BadTar(format!("checksum mismatch at offset {off:#x}")));
        }

        let size = parse_octal(&block[124..136]) as usize;
        let content_blocks = (size + BLOCK - 1) / BLOCK;
        let content_end = off + BLOCK + size;
        if off + BLOCK + content_blocks * BLOCK > data.len() {
            return Err(Error::BadTar("truncated archive".to_string()));
        }
        let content = &data[off + BLOCK..content_end];

        let typeflag = block[156];
        let mut name = pending_name.take().unwrap_or_else(|| {
            let prefix = parse_name(&block[345..500]);
            let base = parse_name(&block[0..100]);
            if prefix.is_empty() {
                base
            } else {
                format!("{prefix}/{base}")
            }
        });
        let link_target = pending_link
            .take()
            .unwrap_or_else(|| parse_name(&block[157..257]));

        if let Some(stripped) = name.strip_prefix("./") {
            name = stripped.to_string();
        }
        let name = name.trim_end_matches('/').to_string();

        let mode = (parse_octal(&block[100..108]) & 0o7777) as u32;
        let uid = parse_octal(&block[108..116]) as u32;
        let gid = parse_octal(&block[116..124]) as u32;
        let mtime = parse_octal(&block[136..148]);

        let path = format!("/{name}");
        match typeflag {
            b'L' => pending_name = Some(parse_name(content)),
            b'K' => pending_link = Some(parse_name(content)),
            b'x' | b'g' => {} // pax metadata; names stay in the ustar fields
            _ if name.is_empty() => {}
            b'5' => {
                let id = vfs.mkdir_all(&path)?;
                let node = vfs.node_mut(id);
                node.mode = mode;
                node.uid = uid;
                node.gid = gid;
                node.mtime = mtime;
            }
            b'0' | 0 | b'7' => {
                let mut node = Node::regular(mode, content.to_vec());
                node.uid = uid;
                node.gid = gid;
                node.mtime = mtime;
                upsert(vfs, &path, node)?;
            }
            b'2' => {
                let mut node = Node::symlink(&link_target);
                node.uid = uid;
                node.gid = gid;
                node.mtime = mtime;
                upsert(vfs, &path, node)?;
            }
            b'1' => {
                let target = format!("/{}", link_target.trim_start_matches("./"));
                let id = vfs
                    .resolve_nofollow(&target)
                    .map_err(|_| Error::BadTar(format!("dangling hardlink {name} -> {link_target}")))?;
                let (dir, base) = vfs.resolve_parent(&path)?;
                vfs.node_mut(dir).children.insert(base, id);
            }
            b'3' | b'4' => {
                let kind = if typeflag == b'3' { NodeKind::CharDev } else { NodeKind::BlockDev };
                let mut node = Node::new(kind, mode);
                node.uid = uid;
                node.gid = gid;
                node.mtime = mtime;
                upsert(vfs, &path, node)?;
            }
            b'6' => {
                let mut node = Node::new(NodeKind::Fifo, mode);
                node.uid = uid;
                node.gid = gid;
                upsert(vfs, &path, node)?;
            }
            other => {
                tracing::debug!(typeflag = %(other as char), name, "skipping tar entry type");
            }
        }

        off += BLOCK + content_blocks * BLOCK;
    }
    Ok(())
}

fn upsert(vfs: &mut Vfs, path: &str, node: Node) -> Result<()> {
    if let Some((dir, _)) = path.rsplit_once('/') {
        let dir = if dir.is_empty() { "/" } else { dir };
        vfs.mkdir_all(dir)?;
    }
    match vfs.resolve_nofollow(path) {
        Ok(existing) => {
            *vfs.node_mut(existing) = node;
            Ok(())
        }
        Err(_) => vfs.create_at(path, node).map(|_| ()),
    }
}

fn write_octal(field: &mut [u8], value: u64) {
    let s = format!("{:0width$o}", value, width = field.len() - 1);
    let bytes = s.as_bytes();
    let tail = &bytes[bytes.len() - (field.len() - 1)..];
    field[..tail.len()].copy_from_slice(tail);
    field[field.len() - 1] = 0;
}

fn emit_header(out: &mut Vec<u8>, name: &str, node: &Node, typeflag: u8, size: u64) {
    // Names longer than the ustar field travel in a GNU 'L' record, which
    // our own parser (and GNU tar) understands.
    if name.len() > 100 {
        let mut long = Node::regular(0, name.as_bytes().to_vec());
        long.mtime = 0;
        emit_header(out, "././@LongLink", &long, b'L', name.len() as u64);
        out.extend_from_slice(name.as_bytes());
        pad_block(out);
        return emit_header_raw(out, &name[..100.min(name.len())], node, typeflag, size);
    }
    emit_header_raw(out, name, node, typeflag, size);
}

fn emit_header_raw(out: &mut Vec<u8>, name: &str, node: &Node, typeflag: u8, size: u64) {
    let mut block = [0u8; BLOCK];
    block[..name.len().min(100)].copy_from_slice(&name.as_bytes()[..name.len().min(100)]);
    write_octal(&mut block[100..108], node.mode as u64);
    write_octal(&mut block[108..116], node.uid as u64);
    write_octal(&mut block[116..124], node.gid as u64);
    write_octal(&mut block[124..136], size);
    write_octal(&mut block[136..148], node.mtime);
    block[156] = typeflag;
    let link = node.link_target.as_bytes();
    block[157..157 + link.len().min(100)].copy_from_slice(&link[..link.len().min(100)]);
    block[257..263].copy_from_slice(b"ustar\0");
    block[263..265].copy_from_slice(b"00");
    block[265..269].copy_from_slice(b"root");
    block[297..301].copy_from_slice(b"root");

    let sum = header_checksum(&block);
    let chk = format!("{sum:06o}\0 ");
    block[148..156].copy_from_slice(chk.as_bytes());
    out.extend_from_slice(&block);
}

fn pad_block(out: &mut Vec<u8>) {
    while out.len() % BLOCK != 0 {
        out.push(0);
    }
}

pub fn export_tar(vfs: &Vfs) -> Vec<u8> {
    let mut out = Vec::new();
    export_dir(vfs, Vfs::ROOT, "", &mut out);
    // Two zero blocks terminate the archive.
    out.extend_from_slice(&[0u8; BLOCK * 2]);
    out
}

fn export_dir(vfs: &Vfs, dir: crate::NodeId, prefix: &str, out: &mut Vec<u8>) {
    for (name, &child) in &vfs.node(dir).children {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        let node = vfs.node(child);
        match node.kind {
            NodeKind::Directory => {
                emit_header(out, &format!("{path}/"), node, b'5', 0);
                export_dir(vfs, child, &path, out);
            }
            NodeKind::Regular => {
                emit_header(out, &path, node, b'0', node.content.len() as u64);
                out.extend_from_slice(&node.content);
                pad_block(out);
            }
            NodeKind::Symlink => emit_header(out, &path, node, b'2', 0),
            NodeKind::CharDev => emit_header(out, &path, node, b'3', 0),
            NodeKind::BlockDev => emit_header(out, &path, node, b'4', 0),
            NodeKind::Fifo => emit_header(out, &path, node, b'6', 0),
            NodeKind::Socket => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_simple_tar() -> Vec<u8> {
        let mut vfs = Vfs::new();
        vfs.mkdir_all("/etc/sub").unwrap();
        vfs.create_at("/etc/motd", Node::regular(0o640, b"welcome\n".to_vec()))
            .unwrap();
        vfs.symlink("motd", "/etc/motd-link").unwrap();
        let deep = format!("/etc/sub/{}", "n".repeat(120));
        vfs.create_at(&deep, Node::regular(0o644, b"deep".to_vec()))
            .unwrap();
        export_tar(&vfs)
    }

    #[test]
    fn round_trip_preserves_entries() {
        let tar = build_simple_tar();
        let mut vfs = Vfs::new();
        load_tar(&mut vfs, &tar).unwrap();

        let motd = vfs.resolve("/etc/motd").unwrap();
        assert_eq!(vfs.node(motd).content, b"welcome\n");
        assert_eq!(vfs.node(motd).mode, 0o640);
        assert_eq!(vfs.readlink("/etc/motd-link").unwrap(), "motd");

        let deep = format!("/etc/sub/{}", "n".repeat(120));
        let deep_id = vfs.resolve(&deep).unwrap();
        assert_eq!(vfs.node(deep_id).content, b"deep");

        // Exporting the re-ingested tree yields the same byte stream.
        assert_eq!(export_tar(&vfs), tar);
    }

    #[test]
    fn rejects_corrupt_checksums() {
        let mut tar = build_simple_tar();
        tar[150] ^= 0x55;
        let mut vfs = Vfs::new();
        assert!(matches!(load_tar(&mut vfs, &tar), Err(Error::BadTar(_))));
    }

    #[test]
    fn accepts_files_before_parents() {
        // Hand-build an archive whose first entry is nested.
        let mut vfs = Vfs::new();
        vfs.mkdir_all("/a/b").unwrap();
        vfs.create_at("/a/b/c", Node::regular(0o644, b"x".to_vec()))
            .unwrap();
        let full = export_tar(&vfs);

        // Strip the directory headers, keeping only the file entry.
        let mut stripped = Vec::new();
        let mut off = 0;
        while off + BLOCK <= full.len() {
            let block = &full[off..off + BLOCK];
            if block.iter().all(|&b| b == 0) {
                break;
            }
            let size = parse_octal(&block[124..136]) as usize;
            let total = BLOCK + ((size + BLOCK - 1) / BLOCK) * BLOCK;
            if block[156] != b'5' {
                stripped.extend_from_slice(&full[off..off + total]);
            }
            off += total;
        }
        stripped.extend_from_slice(&[0u8; BLOCK * 2]);

        let mut fresh = Vfs::new();
        load_tar(&mut fresh, &stripped).unwrap();
        assert_eq!(fresh.node(fresh.resolve("/a/b/c").unwrap()).content, b"x");
    }
}
