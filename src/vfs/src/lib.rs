//! In-memory filesystem backing the syscall layer.
//!
//! The tree is ingested from a tar stream at startup and lives entirely in
//! the host heap: nodes sit in a slab indexed by [`NodeId`], directories
//! own their children by name, and `..` is resolved by walking the
//! already-resolved prefix rather than by parent pointers.

mod dirent;
mod fd;
mod node;
mod tar;

use std::collections::VecDeque;
use std::hash::Hasher;

use rustc_hash::FxHasher;

pub use dirent::{emit_dirents, DirentInput};
pub use fd::flags as fd_flags;
pub use fd::{EpollInstance, FdEntry, FdTable, OpenFile, OpenFlags, PipeState, SocketState, EPOLL_FD_BASE};
pub use node::{Node, NodeId, NodeKind};
pub use tar::{export_tar, load_tar};

pub const MAX_SYMLINK_DEPTH: u32 = 16;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotDir(String),
    #[error("is a directory: {0}")]
    IsDir(String),
    #[error("already exists: {0}")]
    Exists(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("too many levels of symbolic links: {0}")]
    SymlinkLoop(String),
    #[error("bad file descriptor: {0}")]
    BadFd(i32),
    #[error("invalid argument")]
    InvalidArg,
    #[error("malformed tar archive: {0}")]
    BadTar(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stat-relevant metadata snapshot for one node.
#[derive(Debug, Clone)]
pub struct Meta {
    pub kind: NodeKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    pub size: u64,
    pub ino: u64,
}

/// Deterministic synthesized inode: a hash of the (normalized, absolute)
/// path. Stable across runs so guests caching by inode behave.
pub fn path_inode(path: &str) -> u64 {
    let mut h = FxHasher::default();
    h.write(path.as_bytes());
    // Inode 0 means "deleted" to some guests.
    h.finish() | 1
}

pub struct Vfs {
    nodes: Vec<Node>,
    cwd: String,
    pub fds: FdTable,
}

impl Vfs {
    pub fn new() -> Vfs {
        Vfs {
            nodes: vec![Node::directory(0o755)],
            cwd: "/".to_string(),
            fds: FdTable::new(),
        }
    }

    pub const ROOT: NodeId = NodeId(0);

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn alloc_node(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn chdir(&mut self, path: &str) -> Result<()> {
        let id = self.resolve(path)?;
        if self.node(id).kind != NodeKind::Directory {
            return Err(Error::NotDir(path.to_string()));
        }
        self.cwd = self.normalize(path);
        Ok(())
    }

    /// Joins against the cwd and removes `.` segments; `..` is left to the
    /// resolver so it can walk the real tree.
    pub fn normalize(&self, path: &str) -> String {
        let joined = if path.starts_with('/') {
            path.to_string()
        } else if self.cwd == "/" {
            format!("/{path}")
        } else {
            format!("{}/{}", self.cwd, path)
        };
        let mut out: Vec<&str> = Vec::new();
        for comp in joined.split('/') {
            match comp {
                "" | "." => {}
                ".." => {
                    out.pop();
                }
                c => out.push(c),
            }
        }
        if out.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", out.join("/"))
        }
    }

    // === Path resolution === //

    pub fn resolve(&self, path: &str) -> Result<NodeId> {
        let mut depth = 0;
        self.resolve_inner(path, true, &mut depth)
    }

    /// Resolution that does not follow a symlink in the final component
    /// (lstat, readlink, unlink).
    pub fn resolve_nofollow(&self, path: &str) -> Result<NodeId> {
        let mut depth = 0;
        self.resolve_inner(path, false, &mut depth)
    }

    fn resolve_inner(&self, path: &str, follow_last: bool, depth: &mut u32) -> Result<NodeId> {
        let abs = if path.starts_with('/') {
            path.to_string()
        } else if self.cwd == "/" {
            format!("/{path}")
        } else {
            format!("{}/{}", self.cwd, path)
        };

        let mut queue: VecDeque<String> =
            abs.split('/').filter(|c| !c.is_empty()).map(str::to_string).collect();
        let mut stack: Vec<NodeId> = vec![Self::ROOT];

        while let Some(comp) = queue.pop_front() {
            if comp == "." {
                continue;
            }
            if comp == ".." {
                if stack.len() > 1 {
                    stack.pop();
                }
                continue;
            }
            let cur = *stack.last().unwrap();
            if self.node(cur).kind != NodeKind::Directory {
                return Err(Error::NotDir(path.to_string()));
            }
            let child = *self
                .node(cur)
                .children
                .get(&comp)
                .ok_or_else(|| Error::NotFound(path.to_string()))?;

            if self.node(child).kind == NodeKind::Symlink && (!queue.is_empty() || follow_last) {
                *depth += 1;
                if *depth > MAX_SYMLINK_DEPTH {
                    return Err(Error::SymlinkLoop(path.to_string()));
                }
                let target = self.node(child).link_target.clone();
                if target.starts_with('/') {
                    stack.truncate(1);
                }
                for comp in target.split('/').filter(|c| !c.is_empty()).rev() {
                    queue.push_front(comp.to_string());
                }
                continue;
            }
            stack.push(child);
        }
        Ok(*stack.last().unwrap())
    }

    /// Resolves the directory part of `path` and returns it with the final
    /// component, for create-style operations.
    pub fn resolve_parent(&self, path: &str) -> Result<(NodeId, String)> {
        let norm = self.normalize(path);
        if norm == "/" {
            return Err(Error::Exists("/".to_string()));
        }
        let (dir, name) = norm.rsplit_once('/').unwrap();
        let dir = if dir.is_empty() { "/" } else { dir };
        let dir_id = self.resolve(dir)?;
        if self.node(dir_id).kind != NodeKind::Directory {
            return Err(Error::NotDir(dir.to_string()));
        }
        Ok((dir_id, name.to_string()))
    }

    // === Tree operations === //

    pub fn mkdir(&mut self, path: &str, mode: u32) -> Result<NodeId> {
        let (dir, name) = self.resolve_parent(path)?;
        if self.node(dir).children.contains_key(&name) {
            return Err(Error::Exists(path.to_string()));
        }
        let id = self.alloc_node(Node::directory(mode & 0o7777));
        self.node_mut(dir).children.insert(name, id);
        Ok(id)
    }

    /// Creates all missing ancestors of `path` as directories; used by tar
    /// ingestion, which may list files before their parents.
    pub fn mkdir_all(&mut self, path: &str) -> Result<NodeId> {
        let norm = self.normalize(path);
        let mut cur = Self::ROOT;
        for comp in norm.split('/').filter(|c| !c.is_empty()) {
            let existing = self.node(cur).children.get(comp).copied();
            cur = match existing {
                Some(id) if self.node(id).kind == NodeKind::Directory => id,
                Some(_) => return Err(Error::NotDir(norm.clone())),
                None => {
                    let id = self.alloc_node(Node::directory(0o755));
                    self.node_mut(cur).children.insert(comp.to_string(), id);
                    id
                }
            };
        }
        Ok(cur)
    }

    /// Creates (or replaces nothing: fails on collision) a node at `path`.
    pub fn create_at(&mut self, path: &str, node: Node) -> Result<NodeId> {
        let (dir, name) = self.resolve_parent(path)?;
        if self.node(dir).children.contains_key(&name) {
            return Err(Error::Exists(path.to_string()));
        }
        let id = self.alloc_node(node);
        self.node_mut(dir).children.insert(name, id);
        Ok(id)
    }

    pub fn unlink(&mut self, path: &str, rmdir: bool) -> Result<()> {
        let (dir, name) = self.resolve_parent(path)?;
        let id = *self
            .node(dir)
            .children
            .get(&name)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        let kind = self.node(id).kind;
        if rmdir {
            if kind != NodeKind::Directory {
                return Err(Error::NotDir(path.to_string()));
            }
            if !self.node(id).children.is_empty() {
                return Err(Error::NotEmpty(path.to_string()));
            }
        } else if kind == NodeKind::Directory {
            return Err(Error::IsDir(path.to_string()));
        }
        self.node_mut(dir).children.remove(&name);
        Ok(())
    }

    pub fn symlink(&mut self, target: &str, path: &str) -> Result<()> {
        self.create_at(path, Node::symlink(target))?;
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        let id = self.resolve_nofollow(path)?;
        if self.node(id).kind != NodeKind::Symlink {
            return Err(Error::InvalidArg);
        }
        Ok(self.node(id).link_target.clone())
    }

    pub fn link(&mut self, existing: &str, new_path: &str) -> Result<()> {
        let id = self.resolve(existing)?;
        if self.node(id).kind == NodeKind::Directory {
            return Err(Error::IsDir(existing.to_string()));
        }
        let (dir, name) = self.resolve_parent(new_path)?;
        if self.node(dir).children.contains_key(&name) {
            return Err(Error::Exists(new_path.to_string()));
        }
        self.node_mut(dir).children.insert(name, id);
        Ok(())
    }

    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let (old_dir, old_name) = self.resolve_parent(old)?;
        let id = *self
            .node(old_dir)
            .children
            .get(&old_name)
            .ok_or_else(|| Error::NotFound(old.to_string()))?;
        let (new_dir, new_name) = self.resolve_parent(new)?;
        // Replacing a non-empty directory is refused, like Linux.
        if let Some(&existing) = self.node(new_dir).children.get(&new_name) {
            if self.node(existing).kind == NodeKind::Directory
                && !self.node(existing).children.is_empty()
            {
                return Err(Error::NotEmpty(new.to_string()));
            }
        }
        self.node_mut(old_dir).children.remove(&old_name);
        self.node_mut(new_dir).children.insert(new_name, id);
        Ok(())
    }

    pub fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        let id = self.resolve(path)?;
        self.node_mut(id).mode = mode & 0o7777;
        Ok(())
    }

    pub fn meta(&self, path: &str, follow: bool) -> Result<Meta> {
        let id = if follow {
            self.resolve(path)?
        } else {
            self.resolve_nofollow(path)?
        };
        Ok(self.meta_of(id, &self.normalize(path)))
    }

    pub fn meta_of(&self, id: NodeId, path: &str) -> Meta {
        let n = self.node(id);
        Meta {
            kind: n.kind,
            mode: n.mode,
            uid: n.uid,
            gid: n.gid,
            mtime: n.mtime,
            size: n.size(),
            ino: path_inode(path),
        }
    }

    /// Sorted child listing with dirent types, prefixed with `.` and `..`.
    pub fn list_dir(&self, id: NodeId, self_path: &str) -> Result<Vec<DirentInput>> {
        let n = self.node(id);
        if n.kind != NodeKind::Directory {
            return Err(Error::NotDir(self_path.to_string()));
        }
        let mut out = vec![
            DirentInput {
                name: ".".to_string(),
                d_type: NodeKind::Directory.dirent_type(),
                ino: path_inode(self_path),
            },
            DirentInput {
                name: "..".to_string(),
                d_type: NodeKind::Directory.dirent_type(),
                ino: path_inode(self_path),
            },
        ];
        for (name, &child) in &n.children {
            let child_path = if self_path == "/" {
                format!("/{name}")
            } else {
                format!("{self_path}/{name}")
            };
            out.push(DirentInput {
                name: name.clone(),
                d_type: self.node(child).kind.dirent_type(),
                ino: path_inode(&child_path),
            });
        }
        Ok(out)
    }

    /// Seeds the entries a container rootfs expects to exist even when the
    /// tar does not carry them.
    pub fn populate_defaults(&mut self, hostname: &str) {
        let _ = self.mkdir_all("/dev");
        let _ = self.mkdir_all("/etc");
        let _ = self.mkdir_all("/proc/self");
        let _ = self.mkdir_all("/tmp");
        let _ = self.mkdir_all("/root");
        let _ = self.mkdir_all("/usr/share/zoneinfo");

        let mut add = |vfs: &mut Vfs, path: &str, node: Node| {
            if vfs.resolve_nofollow(path).is_err() {
                let _ = vfs.create_at(path, node);
            }
        };

        add(self, "/dev/null", Node::new(NodeKind::CharDev, 0o666));
        add(self, "/dev/zero", Node::new(NodeKind::CharDev, 0o666));
        add(self, "/dev/urandom", Node::new(NodeKind::CharDev, 0o666));
        add(self, "/dev/random", Node::new(NodeKind::CharDev, 0o666));
        add(self, "/dev/tty", Node::new(NodeKind::CharDev, 0o666));

        add(
            self,
            "/etc/passwd",
            Node::regular(0o644, b"root:x:0:0:root:/root:/bin/sh\n".to_vec()),
        );
        add(self, "/etc/group", Node::regular(0o644, b"root:x:0:\n".to_vec()));
        add(
            self,
            "/etc/hostname",
            Node::regular(0o644, format!("{hostname}\n").into_bytes()),
        );
        add(
            self,
            "/etc/resolv.conf",
            Node::regular(0o644, b"nameserver 1.1.1.1\n".to_vec()),
        );

        // Minimal TZif for UTC; glibc and musl both accept it.
        let mut tzif = Vec::new();
        tzif.extend_from_slice(b"TZif");
        tzif.extend_from_slice(&[0; 16]); // version + reserved
        tzif.extend_from_slice(&0u32.to_be_bytes()); // isutcnt
        tzif.extend_from_slice(&0u32.to_be_bytes()); // isstdcnt
        tzif.extend_from_slice(&0u32.to_be_bytes()); // leapcnt
        tzif.extend_from_slice(&0u32.to_be_bytes()); // timecnt
        tzif.extend_from_slice(&1u32.to_be_bytes()); // typecnt
        tzif.extend_from_slice(&4u32.to_be_bytes()); // charcnt
        tzif.extend_from_slice(&0i32.to_be_bytes()); // utoff
        tzif.push(0); // isdst
        tzif.push(0); // desigidx
        tzif.extend_from_slice(b"UTC\0");
        add(self, "/usr/share/zoneinfo/UTC", Node::regular(0o644, tzif));
        add(self, "/etc/localtime", Node::symlink("/usr/share/zoneinfo/UTC"));

        add(
            self,
            "/proc/cpuinfo",
            Node::regular(
                0o444,
                b"processor\t: 0\nhart\t\t: 0\nisa\t\t: rv64imafdc\nmmu\t\t: sv48\n".to_vec(),
            ),
        );
        add(
            self,
            "/proc/meminfo",
            Node::regular(0o444, b"MemTotal:        2097152 kB\nMemFree:         1048576 kB\n".to_vec()),
        );
        add(self, "/proc/mounts", Node::regular(0o444, b"rootfs / rootfs rw 0 0\n".to_vec()));
        add(self, "/proc/self/maps", Node::regular(0o444, Vec::new()));
        add(self, "/proc/self/cmdline", Node::regular(0o444, Vec::new()));
        add(self, "/proc/self/exe", Node::symlink("/"));
    }

    /// Updates the `/proc/self` entries that depend on the running binary.
    pub fn set_proc_self(&mut self, exe_path: &str, argv: &[String]) {
        if let Ok(id) = self.resolve_nofollow("/proc/self/exe") {
            self.node_mut(id).link_target = exe_path.to_string();
        }
        if let Ok(id) = self.resolve_nofollow("/proc/self/cmdline") {
            let mut bytes = Vec::new();
            for arg in argv {
                bytes.extend_from_slice(arg.as_bytes());
                bytes.push(0);
            }
            self.node_mut(id).content = bytes;
        }
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vfs {
        let mut v = Vfs::new();
        v.mkdir_all("/bin").unwrap();
        v.create_at("/bin/sh", Node::regular(0o755, b"#!ignored".to_vec()))
            .unwrap();
        v.mkdir_all("/home/user").unwrap();
        v.create_at("/home/user/a.txt", Node::regular(0o644, b"hello".to_vec()))
            .unwrap();
        v
    }

    #[test]
    fn resolve_walks_dirs_and_dotdot() {
        let v = sample();
        let id = v.resolve("/home/user/../user/./a.txt").unwrap();
        assert_eq!(v.node(id).content, b"hello");
    }

    #[test]
    fn relative_symlink_resolves_against_parent() {
        let mut v = sample();
        v.symlink("a.txt", "/home/user/alias").unwrap();
        let id = v.resolve("/home/user/alias").unwrap();
        assert_eq!(v.node(id).content, b"hello");
        // lstat-style resolution stops at the link itself.
        let link = v.resolve_nofollow("/home/user/alias").unwrap();
        assert_eq!(v.node(link).kind, NodeKind::Symlink);
    }

    #[test]
    fn absolute_symlink_restarts_at_root() {
        let mut v = sample();
        v.symlink("/bin/sh", "/home/user/shell").unwrap();
        let id = v.resolve("/home/user/shell").unwrap();
        assert_eq!(v.node(id).mode, 0o755);
    }

    #[test]
    fn symlink_loops_are_bounded() {
        let mut v = sample();
        v.symlink("/x/y", "/x/y").unwrap_err();
        v.symlink("/loop2", "/loop1").unwrap();
        v.symlink("/loop1", "/loop2").unwrap();
        assert!(matches!(v.resolve("/loop1"), Err(Error::SymlinkLoop(_))));
    }

    #[test]
    fn rename_moves_between_directories() {
        let mut v = sample();
        v.rename("/home/user/a.txt", "/bin/moved").unwrap();
        assert!(v.resolve("/home/user/a.txt").is_err());
        assert_eq!(v.node(v.resolve("/bin/moved").unwrap()).content, b"hello");
    }

    #[test]
    fn unlink_keeps_directories_safe() {
        let mut v = sample();
        assert!(matches!(v.unlink("/home/user", false), Err(Error::IsDir(_))));
        assert!(matches!(v.unlink("/home", true), Err(Error::NotEmpty(_))));
        v.unlink("/home/user/a.txt", false).unwrap();
        v.unlink("/home/user", true).unwrap();
    }

    #[test]
    fn cwd_relative_resolution() {
        let mut v = sample();
        v.chdir("/home/user").unwrap();
        assert_eq!(v.cwd(), "/home/user");
        let id = v.resolve("a.txt").unwrap();
        assert_eq!(v.node(id).content, b"hello");
        assert_eq!(v.normalize("../user/a.txt"), "/home/user/a.txt");
    }

    #[test]
    fn listing_is_lexicographic() {
        let mut v = Vfs::new();
        for name in ["zeta", "alpha", "midway"] {
            v.create_at(&format!("/{name}"), Node::regular(0o644, Vec::new()))
                .unwrap();
        }
        let names: Vec<String> = v
            .list_dir(Vfs::ROOT, "/")
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec![".", "..", "alpha", "midway", "zeta"]);
    }
}
