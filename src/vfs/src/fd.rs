//! Open-file table and descriptor-level I/O.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use utils::Mutex;

use crate::{Error, Meta, NodeKind, Result, Vfs};
use crate::node::NodeId;

/// Epoll descriptors come from their own numeric range so they can never
/// collide with file descriptors handed out by the lowest-free allocator.
pub const EPOLL_FD_BASE: i32 = 0x1000;

// Linux open(2) flag values for the generic (riscv64) ABI.
pub mod flags {
    pub const O_ACCMODE: u32 = 0o3;
    pub const O_WRONLY: u32 = 0o1;
    pub const O_RDWR: u32 = 0o2;
    pub const O_CREAT: u32 = 0o100;
    pub const O_EXCL: u32 = 0o200;
    pub const O_TRUNC: u32 = 0o1000;
    pub const O_APPEND: u32 = 0o2000;
    pub const O_NONBLOCK: u32 = 0o4000;
    pub const O_DIRECTORY: u32 = 0o200000;
    pub const O_NOFOLLOW: u32 = 0o400000;
    pub const O_CLOEXEC: u32 = 0o2000000;
}

/// Raw open(2) flags with the accessors the handlers need.
#[derive(Debug, Copy, Clone, Default)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub fn readable(self) -> bool {
        self.0 & flags::O_ACCMODE != flags::O_WRONLY
    }

    pub fn writable(self) -> bool {
        matches!(self.0 & flags::O_ACCMODE, flags::O_WRONLY | flags::O_RDWR)
    }

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

#[derive(Debug)]
pub struct OpenFile {
    pub node: NodeId,
    /// Normalized absolute path, kept for fstat's synthesized inode and
    /// for the terminal/`/dev` special cases in the syscall layer.
    pub path: String,
    pub offset: u64,
    pub flags: OpenFlags,
    /// getdents64 cursor.
    pub dir_pos: usize,
}

#[derive(Debug)]
pub struct PipeState {
    pub buffer: Vec<u8>,
    pub readers: u32,
    pub writers: u32,
}

#[derive(Debug, Default)]
pub struct EpollInstance {
    /// fd -> (interest events, opaque user data).
    pub interests: FxHashMap<i32, (u32, u64)>,
}

#[derive(Debug, Default)]
pub struct SocketState {
    /// Handle on the foreground network adaptor's side.
    pub handle: i32,
    pub domain: i32,
    pub sock_type: i32,
    pub nonblock: bool,
}

#[derive(Clone)]
pub enum FdEntry {
    File(Arc<Mutex<OpenFile>>),
    Pipe {
        state: Arc<Mutex<PipeState>>,
        write_end: bool,
        nonblock: bool,
    },
    /// One end of a socketpair: reads drain one buffer, writes feed the
    /// peer's.
    Duplex {
        rx: Arc<Mutex<PipeState>>,
        tx: Arc<Mutex<PipeState>>,
    },
    Epoll(Arc<Mutex<EpollInstance>>),
    Socket(Arc<Mutex<SocketState>>),
}

pub struct FdTable {
    pub entries: FxHashMap<i32, FdEntry>,
    next_epoll: i32,
}

impl FdTable {
    pub fn new() -> FdTable {
        FdTable {
            entries: FxHashMap::default(),
            next_epoll: EPOLL_FD_BASE,
        }
    }

    /// Lowest free descriptor at or above 3; 0/1/2 stay reserved for the
    /// terminal unless something is explicitly dup'ed onto them.
    pub fn alloc_fd(&self) -> i32 {
        let mut fd = 3;
        while self.entries.contains_key(&fd) {
            fd += 1;
        }
        fd
    }

    pub fn alloc_epoll_fd(&mut self) -> i32 {
        let fd = self.next_epoll;
        self.next_epoll += 1;
        fd
    }

    pub fn get(&self, fd: i32) -> Result<&FdEntry> {
        self.entries.get(&fd).ok_or(Error::BadFd(fd))
    }

    /// Descriptor numbers currently open; the fork snapshot records this
    /// set so descriptors the child adds can be closed at restore.
    pub fn snapshot_fds(&self) -> Vec<i32> {
        self.entries.keys().copied().collect()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    pub fn open(&mut self, path: &str, raw_flags: u32, mode: u32) -> Result<i32> {
        let flags = OpenFlags(raw_flags);
        let norm = self.normalize(path);

        let resolved = if flags.contains(flags::O_NOFOLLOW) {
            self.resolve_nofollow(&norm)
        } else {
            self.resolve(&norm)
        };

        let node = match resolved {
            Ok(id) => {
                if flags.contains(flags::O_CREAT) && flags.contains(flags::O_EXCL) {
                    return Err(Error::Exists(norm));
                }
                id
            }
            Err(Error::NotFound(_)) if flags.contains(flags::O_CREAT) => {
                let (dir, name) = self.resolve_parent(&norm)?;
                let id = self.alloc_node(crate::Node::regular(mode & 0o7777, Vec::new()));
                self.node_mut(dir).children.insert(name, id);
                id
            }
            Err(e) => return Err(e),
        };

        let kind = self.node(node).kind;
        if flags.contains(flags::O_DIRECTORY) && kind != NodeKind::Directory {
            return Err(Error::NotDir(norm));
        }
        if kind == NodeKind::Directory && flags.writable() {
            return Err(Error::IsDir(norm));
        }
        if flags.contains(flags::O_TRUNC) && kind == NodeKind::Regular {
            self.node_mut(node).content.clear();
        }

        let fd = self.fds.alloc_fd();
        self.fds.entries.insert(
            fd,
            FdEntry::File(Arc::new(Mutex::new(OpenFile {
                node,
                path: norm,
                offset: 0,
                flags,
                dir_pos: 0,
            }))),
        );
        Ok(fd)
    }

    pub fn close(&mut self, fd: i32) -> Result<()> {
        let entry = self.fds.entries.remove(&fd).ok_or(Error::BadFd(fd))?;
        if let FdEntry::Pipe { state, write_end, .. } = entry {
            let mut st = state.lock();
            if write_end {
                st.writers = st.writers.saturating_sub(1);
            } else {
                st.readers = st.readers.saturating_sub(1);
            }
        }
        Ok(())
    }

    /// dup shares the underlying handle: offsets move together.
    pub fn dup(&mut self, fd: i32) -> Result<i32> {
        let entry = self.fds.get(fd)?.clone();
        self.bump_pipe_refs(&entry);
        let new_fd = self.fds.alloc_fd();
        self.fds.entries.insert(new_fd, entry);
        Ok(new_fd)
    }

    pub fn dup3(&mut self, old_fd: i32, new_fd: i32) -> Result<i32> {
        if old_fd == new_fd {
            return Err(Error::InvalidArg);
        }
        let entry = self.fds.get(old_fd)?.clone();
        self.bump_pipe_refs(&entry);
        if self.fds.entries.contains_key(&new_fd) {
            let _ = self.close(new_fd);
        }
        self.fds.entries.insert(new_fd, entry);
        Ok(new_fd)
    }

    fn bump_pipe_refs(&self, entry: &FdEntry) {
        if let FdEntry::Pipe { state, write_end, .. } = entry {
            let mut st = state.lock();
            if *write_end {
                st.writers += 1;
            } else {
                st.readers += 1;
            }
        }
    }

    pub fn pipe(&mut self, nonblock: bool) -> (i32, i32) {
        let state = Arc::new(Mutex::new(PipeState {
            buffer: Vec::new(),
            readers: 1,
            writers: 1,
        }));
        let read_fd = self.fds.alloc_fd();
        self.fds.entries.insert(
            read_fd,
            FdEntry::Pipe {
                state: state.clone(),
                write_end: false,
                nonblock,
            },
        );
        let write_fd = self.fds.alloc_fd();
        self.fds.entries.insert(
            write_fd,
            FdEntry::Pipe {
                state,
                write_end: true,
                nonblock,
            },
        );
        (read_fd, write_fd)
    }

    /// Connected pair of bidirectional descriptors (socketpair).
    pub fn socketpair(&mut self) -> (i32, i32) {
        let a = Arc::new(Mutex::new(PipeState { buffer: Vec::new(), readers: 1, writers: 1 }));
        let b = Arc::new(Mutex::new(PipeState { buffer: Vec::new(), readers: 1, writers: 1 }));
        let fd0 = self.fds.alloc_fd();
        self.fds
            .entries
            .insert(fd0, FdEntry::Duplex { rx: a.clone(), tx: b.clone() });
        let fd1 = self.fds.alloc_fd();
        self.fds.entries.insert(fd1, FdEntry::Duplex { rx: b, tx: a });
        (fd0, fd1)
    }

    /// Reads up to `len` bytes from the descriptor's current position.
    /// An empty pipe with live writers reports `WouldBlock` through
    /// `PipeEmpty` handling in the syscall layer, so this never blocks.
    pub fn read_fd(&mut self, fd: i32, len: usize) -> Result<Vec<u8>> {
        match self.fds.get(fd)?.clone() {
            FdEntry::File(file) => {
                let mut f = file.lock();
                if !f.flags.readable() {
                    return Err(Error::BadFd(fd));
                }
                let node = self.node(f.node);
                if node.kind == NodeKind::Directory {
                    return Err(Error::IsDir(f.path.clone()));
                }
                if node.kind != NodeKind::Regular {
                    return Ok(Vec::new());
                }
                let start = (f.offset as usize).min(node.content.len());
                let end = (start + len).min(node.content.len());
                let out = node.content[start..end].to_vec();
                f.offset += out.len() as u64;
                Ok(out)
            }
            FdEntry::Pipe { state, write_end, .. } => {
                if write_end {
                    return Err(Error::BadFd(fd));
                }
                let mut st = state.lock();
                let take = len.min(st.buffer.len());
                let out: Vec<u8> = st.buffer.drain(..take).collect();
                Ok(out)
            }
            FdEntry::Duplex { rx, .. } => {
                let mut st = rx.lock();
                let take = len.min(st.buffer.len());
                let out: Vec<u8> = st.buffer.drain(..take).collect();
                Ok(out)
            }
            _ => Err(Error::BadFd(fd)),
        }
    }

    pub fn write_fd(&mut self, fd: i32, data: &[u8]) -> Result<usize> {
        match self.fds.get(fd)?.clone() {
            FdEntry::File(file) => {
                let mut f = file.lock();
                if !f.flags.writable() {
                    return Err(Error::BadFd(fd));
                }
                if self.node(f.node).kind == NodeKind::CharDev {
                    return Ok(data.len());
                }
                if f.flags.contains(flags::O_APPEND) {
                    f.offset = self.node(f.node).size();
                }
                let offset = f.offset as usize;
                let node = self.node_mut(f.node);
                if node.content.len() < offset + data.len() {
                    node.content.resize(offset + data.len(), 0);
                }
                node.content[offset..offset + data.len()].copy_from_slice(data);
                f.offset += data.len() as u64;
                Ok(data.len())
            }
            FdEntry::Pipe { state, write_end, .. } => {
                if !write_end {
                    return Err(Error::BadFd(fd));
                }
                state.lock().buffer.extend_from_slice(data);
                Ok(data.len())
            }
            FdEntry::Duplex { tx, .. } => {
                tx.lock().buffer.extend_from_slice(data);
                Ok(data.len())
            }
            _ => Err(Error::BadFd(fd)),
        }
    }

    pub fn pread_fd(&mut self, fd: i32, len: usize, offset: u64) -> Result<Vec<u8>> {
        match self.fds.get(fd)?.clone() {
            FdEntry::File(file) => {
                let f = file.lock();
                let node = self.node(f.node);
                let start = (offset as usize).min(node.content.len());
                let end = (start + len).min(node.content.len());
                Ok(node.content[start..end].to_vec())
            }
            _ => Err(Error::InvalidArg),
        }
    }

    pub fn pwrite_fd(&mut self, fd: i32, data: &[u8], offset: u64) -> Result<usize> {
        match self.fds.get(fd)?.clone() {
            FdEntry::File(file) => {
                let f = file.lock();
                let offset = offset as usize;
                let node = self.node_mut(f.node);
                if node.content.len() < offset + data.len() {
                    node.content.resize(offset + data.len(), 0);
                }
                node.content[offset..offset + data.len()].copy_from_slice(data);
                Ok(data.len())
            }
            _ => Err(Error::InvalidArg),
        }
    }

    pub fn lseek_fd(&mut self, fd: i32, offset: i64, whence: i32) -> Result<u64> {
        match self.fds.get(fd)?.clone() {
            FdEntry::File(file) => {
                let mut f = file.lock();
                let size = self.node(f.node).size() as i64;
                let base = match whence {
                    libc::SEEK_SET => 0,
                    libc::SEEK_CUR => f.offset as i64,
                    libc::SEEK_END => size,
                    _ => return Err(Error::InvalidArg),
                };
                let new = base + offset;
                if new < 0 {
                    return Err(Error::InvalidArg);
                }
                f.offset = new as u64;
                // Rewinding a directory restarts its dirent cursor.
                if new == 0 {
                    f.dir_pos = 0;
                }
                Ok(f.offset)
            }
            _ => Err(Error::InvalidArg),
        }
    }

    pub fn ftruncate_fd(&mut self, fd: i32, len: u64) -> Result<()> {
        match self.fds.get(fd)?.clone() {
            FdEntry::File(file) => {
                let f = file.lock();
                self.node_mut(f.node).content.resize(len as usize, 0);
                Ok(())
            }
            _ => Err(Error::InvalidArg),
        }
    }

    pub fn fchmod_fd(&mut self, fd: i32, mode: u32) -> Result<()> {
        match self.fds.get(fd)?.clone() {
            FdEntry::File(file) => {
                let f = file.lock();
                self.node_mut(f.node).mode = mode & 0o7777;
                Ok(())
            }
            _ => Err(Error::InvalidArg),
        }
    }

    /// Fills `buf_len` worth of dirent64 records, advancing the cursor
    /// stored in the handle. Returns the encoded bytes (empty at EOF).
    pub fn getdents_fd(&mut self, fd: i32, buf_len: usize) -> Result<Vec<u8>> {
        match self.fds.get(fd)?.clone() {
            FdEntry::File(file) => {
                let mut f = file.lock();
                let entries = self.list_dir(f.node, &f.path.clone())?;
                let mut pos = f.dir_pos;
                let out = crate::dirent::emit_dirents(&entries, &mut pos, buf_len);
                f.dir_pos = pos;
                Ok(out)
            }
            _ => Err(Error::BadFd(fd)),
        }
    }

    pub fn meta_fd(&self, fd: i32) -> Result<Meta> {
        match self.fds.get(fd)? {
            FdEntry::File(file) => {
                let f = file.lock();
                Ok(self.meta_of(f.node, &f.path))
            }
            FdEntry::Pipe { state, .. } => Ok(Meta {
                kind: NodeKind::Fifo,
                mode: 0o600,
                uid: 0,
                gid: 0,
                mtime: 0,
                size: state.lock().buffer.len() as u64,
                ino: crate::path_inode(&format!("pipe:{fd}")),
            }),
            FdEntry::Socket(_) | FdEntry::Duplex { .. } => Ok(Meta {
                kind: NodeKind::Socket,
                mode: 0o600,
                uid: 0,
                gid: 0,
                mtime: 0,
                size: 0,
                ino: crate::path_inode(&format!("socket:{fd}")),
            }),
            FdEntry::Epoll(_) => Err(Error::InvalidArg),
        }
    }

    /// Bytes immediately readable without blocking, if the descriptor
    /// supports the notion (FIONREAD, ppoll, epoll readiness).
    pub fn readable_bytes(&self, fd: i32) -> Result<usize> {
        match self.fds.get(fd)? {
            FdEntry::File(file) => {
                let f = file.lock();
                let node = self.node(f.node);
                Ok(node.content.len().saturating_sub(f.offset as usize))
            }
            FdEntry::Pipe { state, .. } => Ok(state.lock().buffer.len()),
            FdEntry::Duplex { rx, .. } => Ok(rx.lock().buffer.len()),
            _ => Ok(0),
        }
    }

    /// True when a read would return EOF rather than block: pipe drained
    /// and every writer closed.
    pub fn pipe_at_eof(&self, fd: i32) -> bool {
        match self.fds.get(fd) {
            Ok(FdEntry::Pipe { state, .. }) => {
                let st = state.lock();
                st.buffer.is_empty() && st.writers == 0
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Node;

    fn vfs_with_file() -> Vfs {
        let mut v = Vfs::new();
        v.create_at("/data", Node::regular(0o644, b"0123456789".to_vec()))
            .unwrap();
        v
    }

    #[test]
    fn open_read_write_offsets() {
        let mut v = vfs_with_file();
        let fd = v.open("/data", flags::O_RDWR, 0).unwrap();
        assert_eq!(fd, 3);
        assert_eq!(v.read_fd(fd, 4).unwrap(), b"0123");
        assert_eq!(v.write_fd(fd, b"XY").unwrap(), 2);
        assert_eq!(v.read_fd(fd, 10).unwrap(), b"6789");
        let node = v.resolve("/data").unwrap();
        assert_eq!(v.node(node).content, b"0123XY6789");
    }

    #[test]
    fn dup_shares_the_offset() {
        let mut v = vfs_with_file();
        let fd = v.open("/data", 0, 0).unwrap();
        let dup = v.dup(fd).unwrap();
        assert_eq!(v.read_fd(fd, 5).unwrap(), b"01234");
        assert_eq!(v.read_fd(dup, 5).unwrap(), b"56789");
    }

    #[test]
    fn o_creat_excl_and_trunc() {
        let mut v = vfs_with_file();
        assert!(matches!(
            v.open("/data", flags::O_CREAT | flags::O_EXCL, 0o644),
            Err(Error::Exists(_))
        ));
        let fd = v
            .open("/fresh", flags::O_CREAT | flags::O_RDWR, 0o600)
            .unwrap();
        v.write_fd(fd, b"abc").unwrap();
        let fd2 = v.open("/fresh", flags::O_TRUNC | flags::O_RDWR, 0).unwrap();
        assert_eq!(v.read_fd(fd2, 16).unwrap(), b"");
        assert_eq!(v.node(v.resolve("/fresh").unwrap()).content, b"");
    }

    #[test]
    fn pipe_drains_from_the_front() {
        let mut v = Vfs::new();
        let (r, w) = v.pipe(false);
        v.write_fd(w, b"first").unwrap();
        v.write_fd(w, b"second").unwrap();
        assert_eq!(v.read_fd(r, 5).unwrap(), b"first");
        assert!(!v.pipe_at_eof(r));
        v.close(w).unwrap();
        assert_eq!(v.read_fd(r, 100).unwrap(), b"second");
        assert!(v.pipe_at_eof(r));
    }

    #[test]
    fn lseek_whence() {
        let mut v = vfs_with_file();
        let fd = v.open("/data", 0, 0).unwrap();
        assert_eq!(v.lseek_fd(fd, 4, libc::SEEK_SET).unwrap(), 4);
        assert_eq!(v.lseek_fd(fd, 2, libc::SEEK_CUR).unwrap(), 6);
        assert_eq!(v.lseek_fd(fd, -1, libc::SEEK_END).unwrap(), 9);
        assert!(v.lseek_fd(fd, -20, libc::SEEK_SET).is_err());
    }

    #[test]
    fn append_mode_seeks_to_end() {
        let mut v = vfs_with_file();
        let fd = v.open("/data", flags::O_WRONLY | flags::O_APPEND, 0).unwrap();
        v.write_fd(fd, b"!").unwrap();
        assert_eq!(v.node(v.resolve("/data").unwrap()).content, b"0123456789!");
    }
}
