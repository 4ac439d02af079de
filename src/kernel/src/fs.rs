//! File and filesystem syscalls, including terminal routing and ioctl.

use arena::state::CpuState;
use arena::Arena;
use bridge::{HostIo, StdinResult};
use zerocopy::AsBytes;

use crate::defs::{self, errno, ioctl, nr};
use crate::{Kernel, Outcome};
use vfs::{FdEntry, Meta, NodeKind};

impl Kernel {
    fn path_arg(&self, arena: &Arena, ptr: u64) -> Result<String, i64> {
        arena.read_cstr(ptr).map_err(|_| -errno::EFAULT)
    }

    /// The relative-directory argument must be the CWD sentinel unless the
    /// path is absolute; anything else is unsupported here.
    fn at_check(&self, dirfd: i64, path: &str) -> Result<(), i64> {
        if path.starts_with('/') || dirfd == defs::AT_FDCWD {
            Ok(())
        } else {
            Err(-errno::ENOTSUP)
        }
    }

    /// Fds 0/1/2 with no table entry, and anything opened under
    /// `/dev/tty*` or `/dev/console`, route to the host terminal.
    pub(crate) fn is_terminal_fd(&self, fd: i32) -> bool {
        match self.vfs.fds.entries.get(&fd) {
            None => (0..=2).contains(&fd),
            Some(FdEntry::File(file)) => {
                let guard = file.lock();
                guard.path.starts_with("/dev/tty") || guard.path == "/dev/console"
            }
            Some(_) => false,
        }
    }

    pub(crate) fn sys_openat(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let dirfd = cpu.get_x(10) as i64;
        let path = match self.path_arg(arena, cpu.get_x(11)) {
            Ok(p) => p,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        if let Err(e) = self.at_check(dirfd, &path) {
            self.ret(cpu, e);
            return Outcome::Done;
        }
        let flags = cpu.get_x(12) as u32;
        let mode = cpu.get_x(13) as u32 & !self.umask;
        let r = self.vfs.open(&path, flags, mode);
        self.ret_vfs(cpu, r, |fd| fd as i64);
        Outcome::Done
    }

    pub(crate) fn sys_close(&mut self, cpu: &mut CpuState) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        if self.vfs.fds.entries.contains_key(&fd) {
            let r = self.vfs.close(fd);
            self.ret_vfs(cpu, r, |_| 0);
        } else if (0..=2).contains(&fd) {
            // Closing a std stream detaches nothing; accept it.
            self.ret(cpu, 0);
        } else {
            self.ret(cpu, -errno::EBADF);
        }
        Outcome::Done
    }

    pub(crate) fn sys_read(&mut self, cpu: &mut CpuState, arena: &mut Arena, io: &dyn HostIo) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        let buf = cpu.get_x(11);
        let len = cpu.get_x(12) as usize;
        self.read_common(cpu, arena, io, fd, buf, len)
    }

    pub(crate) fn read_common(
        &mut self,
        cpu: &mut CpuState,
        arena: &mut Arena,
        io: &dyn HostIo,
        fd: i32,
        buf: u64,
        len: usize,
    ) -> Outcome {
        if self.is_terminal_fd(fd) {
            return match io.read_stdin(len.min(8192)) {
                StdinResult::Data(data) => {
                    match arena.memcpy_in(buf, &data) {
                        Ok(()) => self.ret(cpu, data.len() as i64),
                        Err(_) => self.ret(cpu, -errno::EFAULT),
                    }
                    Outcome::Done
                }
                StdinResult::Eof => {
                    self.ret(cpu, 0);
                    Outcome::Done
                }
                StdinResult::WouldBlock => Outcome::StdinWait,
            };
        }

        // /dev pseudo-devices by path.
        if let Some(special) = self.dev_read(fd, len) {
            match special {
                DevRead::Zeroes(n) => {
                    let zeros = vec![0u8; n];
                    match arena.memcpy_in(buf, &zeros) {
                        Ok(()) => self.ret(cpu, n as i64),
                        Err(_) => self.ret(cpu, -errno::EFAULT),
                    }
                }
                DevRead::Random(n) => {
                    let mut bytes = vec![0u8; n];
                    rand::Rng::fill(&mut rand::thread_rng(), bytes.as_mut_slice());
                    match arena.memcpy_in(buf, &bytes) {
                        Ok(()) => self.ret(cpu, n as i64),
                        Err(_) => self.ret(cpu, -errno::EFAULT),
                    }
                }
                DevRead::Empty => self.ret(cpu, 0),
            }
            return Outcome::Done;
        }

        // Pipes that would block: let a sibling run, or report EOF /
        // would-block when there is nobody to produce data.
        let pipe = match self.vfs.fds.get(fd) {
            Ok(FdEntry::Pipe { state, write_end: false, nonblock }) => {
                Some((state.clone(), *nonblock))
            }
            _ => None,
        };
        if let Some((state, nonblock)) = pipe {
            let (empty, writers) = {
                let st = state.lock();
                (st.buffer.is_empty(), st.writers)
            };
            if empty {
                if writers == 0 {
                    self.ret(cpu, 0);
                    return Outcome::Done;
                }
                if nonblock {
                    self.ret(cpu, -errno::EAGAIN);
                    return Outcome::Done;
                }
                // Rewind and let another thread fill the pipe.
                cpu.pc -= 4;
                if !self.threads.rotate(cpu) {
                    cpu.pc += 4;
                    self.ret(cpu, -errno::EAGAIN);
                }
                return Outcome::Done;
            }
        }

        let r = self.vfs.read_fd(fd, len);
        match r {
            Ok(data) => match arena.memcpy_in(buf, &data) {
                Ok(()) => self.ret(cpu, data.len() as i64),
                Err(_) => self.ret(cpu, -errno::EFAULT),
            },
            Err(e) => self.ret(cpu, Self::vfs_errno(&e)),
        }
        Outcome::Done
    }

    fn dev_read(&self, fd: i32, len: usize) -> Option<DevRead> {
        let entry = self.vfs.fds.entries.get(&fd)?;
        let FdEntry::File(file) = entry else { return None };
        let path = file.lock().path.clone();
        match path.as_str() {
            "/dev/zero" => Some(DevRead::Zeroes(len.min(1 << 20))),
            "/dev/urandom" | "/dev/random" => Some(DevRead::Random(len.min(1 << 20))),
            "/dev/null" => Some(DevRead::Empty),
            _ => None,
        }
    }

    pub(crate) fn sys_write(&mut self, cpu: &mut CpuState, arena: &mut Arena, io: &dyn HostIo) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        let buf = cpu.get_x(11);
        let len = cpu.get_x(12) as usize;
        self.write_common(cpu, arena, io, fd, buf, len)
    }

    pub(crate) fn write_common(
        &mut self,
        cpu: &mut CpuState,
        arena: &mut Arena,
        io: &dyn HostIo,
        fd: i32,
        buf: u64,
        len: usize,
    ) -> Outcome {
        let mut data = vec![0u8; len];
        if arena.memcpy_out(&mut data, buf).is_err() {
            self.ret(cpu, -errno::EFAULT);
            return Outcome::Done;
        }
        if self.is_terminal_fd(fd) {
            io.write_stdout(&data);
            self.ret(cpu, len as i64);
            return Outcome::Done;
        }
        let r = self.vfs.write_fd(fd, &data);
        self.ret_vfs(cpu, r, |n| n as i64);
        Outcome::Done
    }

    fn iovecs(&self, arena: &Arena, iov: u64, iovcnt: usize) -> Result<Vec<(u64, usize)>, i64> {
        let mut out = Vec::new();
        for i in 0..iovcnt.min(64) {
            let base = arena.peek_u64(iov + i as u64 * 16).map_err(|_| -errno::EFAULT)?;
            let len = arena.peek_u64(iov + i as u64 * 16 + 8).map_err(|_| -errno::EFAULT)?;
            out.push((base, len as usize));
        }
        Ok(out)
    }

    pub(crate) fn sys_readv(&mut self, cpu: &mut CpuState, arena: &mut Arena, io: &dyn HostIo) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        let iovs = match self.iovecs(arena, cpu.get_x(11), cpu.get_x(12) as usize) {
            Ok(v) => v,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        // Reads fill the first non-empty iovec; short reads are fine.
        for (base, len) in iovs {
            if len == 0 {
                continue;
            }
            return self.read_common(cpu, arena, io, fd, base, len);
        }
        self.ret(cpu, 0);
        Outcome::Done
    }

    pub(crate) fn sys_writev(&mut self, cpu: &mut CpuState, arena: &mut Arena, io: &dyn HostIo) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        let iovs = match self.iovecs(arena, cpu.get_x(11), cpu.get_x(12) as usize) {
            Ok(v) => v,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        let mut total: i64 = 0;
        for (base, len) in iovs {
            if len == 0 {
                continue;
            }
            let mut data = vec![0u8; len];
            if arena.memcpy_out(&mut data, base).is_err() {
                self.ret(cpu, -errno::EFAULT);
                return Outcome::Done;
            }
            if self.is_terminal_fd(fd) {
                io.write_stdout(&data);
                total += len as i64;
            } else {
                match self.vfs.write_fd(fd, &data) {
                    Ok(n) => total += n as i64,
                    Err(e) => {
                        self.ret(cpu, Self::vfs_errno(&e));
                        return Outcome::Done;
                    }
                }
            }
        }
        self.ret(cpu, total);
        Outcome::Done
    }

    pub(crate) fn sys_pread(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        let buf = cpu.get_x(11);
        let len = cpu.get_x(12) as usize;
        let off = cpu.get_x(13);
        match self.vfs.pread_fd(fd, len, off) {
            Ok(data) => match arena.memcpy_in(buf, &data) {
                Ok(()) => self.ret(cpu, data.len() as i64),
                Err(_) => self.ret(cpu, -errno::EFAULT),
            },
            Err(e) => self.ret(cpu, Self::vfs_errno(&e)),
        }
        Outcome::Done
    }

    pub(crate) fn sys_pwritev_family(&mut self, sysno: u64, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        if sysno == nr::PWRITE64 {
            let buf = cpu.get_x(11);
            let len = cpu.get_x(12) as usize;
            let off = cpu.get_x(13);
            let mut data = vec![0u8; len];
            if arena.memcpy_out(&mut data, buf).is_err() {
                self.ret(cpu, -errno::EFAULT);
                return Outcome::Done;
            }
            let r = self.vfs.pwrite_fd(fd, &data, off);
            self.ret_vfs(cpu, r, |n| n as i64);
            return Outcome::Done;
        }
        // preadv/pwritev: vector at a1, count a2, offset a3.
        let iovs = match self.iovecs(arena, cpu.get_x(11), cpu.get_x(12) as usize) {
            Ok(v) => v,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        let mut off = cpu.get_x(13);
        let mut total: i64 = 0;
        for (base, len) in iovs {
            if len == 0 {
                continue;
            }
            if sysno == nr::PWRITEV {
                let mut data = vec![0u8; len];
                if arena.memcpy_out(&mut data, base).is_err() {
                    self.ret(cpu, -errno::EFAULT);
                    return Outcome::Done;
                }
                match self.vfs.pwrite_fd(fd, &data, off) {
                    Ok(n) => {
                        total += n as i64;
                        off += n as u64;
                    }
                    Err(e) => {
                        self.ret(cpu, Self::vfs_errno(&e));
                        return Outcome::Done;
                    }
                }
            } else {
                match self.vfs.pread_fd(fd, len, off) {
                    Ok(data) => {
                        if arena.memcpy_in(base, &data).is_err() {
                            self.ret(cpu, -errno::EFAULT);
                            return Outcome::Done;
                        }
                        let n = data.len();
                        total += n as i64;
                        off += n as u64;
                        if n < len {
                            break;
                        }
                    }
                    Err(e) => {
                        self.ret(cpu, Self::vfs_errno(&e));
                        return Outcome::Done;
                    }
                }
            }
        }
        self.ret(cpu, total);
        Outcome::Done
    }

    pub(crate) fn sys_lseek(&mut self, cpu: &mut CpuState) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        let off = cpu.get_x(11) as i64;
        let whence = cpu.get_x(12) as i32;
        let r = self.vfs.lseek_fd(fd, off, whence);
        self.ret_vfs(cpu, r, |n| n as i64);
        Outcome::Done
    }

    pub(crate) fn sys_sendfile(&mut self, cpu: &mut CpuState, arena: &mut Arena, io: &dyn HostIo) -> Outcome {
        let out_fd = cpu.get_x(10) as i32;
        let in_fd = cpu.get_x(11) as i32;
        let off_ptr = cpu.get_x(12);
        let count = (cpu.get_x(13) as usize).min(1 << 20);

        let data = if off_ptr != 0 {
            let off = match arena.peek_u64(off_ptr) {
                Ok(v) => v,
                Err(_) => {
                    self.ret(cpu, -errno::EFAULT);
                    return Outcome::Done;
                }
            };
            match self.vfs.pread_fd(in_fd, count, off) {
                Ok(d) => {
                    let _ = arena.poke_u64(off_ptr, off + d.len() as u64);
                    d
                }
                Err(e) => {
                    self.ret(cpu, Self::vfs_errno(&e));
                    return Outcome::Done;
                }
            }
        } else {
            match self.vfs.read_fd(in_fd, count) {
                Ok(d) => d,
                Err(e) => {
                    self.ret(cpu, Self::vfs_errno(&e));
                    return Outcome::Done;
                }
            }
        };

        if self.is_terminal_fd(out_fd) {
            io.write_stdout(&data);
            self.ret(cpu, data.len() as i64);
        } else {
            let r = self.vfs.write_fd(out_fd, &data);
            self.ret_vfs(cpu, r, |n| n as i64);
        }
        Outcome::Done
    }

    pub(crate) fn sys_ftruncate(&mut self, cpu: &mut CpuState) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        let len = cpu.get_x(11);
        let r = self.vfs.ftruncate_fd(fd, len);
        self.ret_vfs(cpu, r, |_| 0);
        Outcome::Done
    }

    pub(crate) fn sys_fchmod(&mut self, cpu: &mut CpuState) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        let mode = cpu.get_x(11) as u32;
        let r = self.vfs.fchmod_fd(fd, mode);
        self.ret_vfs(cpu, r, |_| 0);
        Outcome::Done
    }

    pub(crate) fn sys_fchmodat(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let dirfd = cpu.get_x(10) as i64;
        let path = match self.path_arg(arena, cpu.get_x(11)) {
            Ok(p) => p,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        if let Err(e) = self.at_check(dirfd, &path) {
            self.ret(cpu, e);
            return Outcome::Done;
        }
        let mode = cpu.get_x(12) as u32;
        let r = self.vfs.chmod(&path, mode);
        self.ret_vfs(cpu, r, |_| 0);
        Outcome::Done
    }

    fn stat_from_meta(meta: &Meta) -> defs::Stat {
        defs::Stat {
            st_dev: 8,
            st_ino: meta.ino,
            st_mode: meta.kind.mode_bits() | (meta.mode & 0o7777),
            st_nlink: 1,
            st_uid: meta.uid,
            st_gid: meta.gid,
            st_size: meta.size as i64,
            st_blksize: 4096,
            st_blocks: (meta.size as i64 + 511) / 512,
            st_mtime: meta.mtime as i64,
            st_ctime: meta.mtime as i64,
            st_atime: meta.mtime as i64,
            ..Default::default()
        }
    }

    fn tty_meta() -> Meta {
        Meta {
            kind: NodeKind::CharDev,
            mode: 0o620,
            uid: 0,
            gid: 0,
            mtime: 0,
            size: 0,
            ino: vfs::path_inode("/dev/tty"),
        }
    }

    pub(crate) fn sys_fstat(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        let out = cpu.get_x(11);
        let meta = if self.is_terminal_fd(fd) {
            Ok(Self::tty_meta())
        } else {
            self.vfs.meta_fd(fd)
        };
        match meta {
            Ok(meta) => {
                let stat = Self::stat_from_meta(&meta);
                match arena.memcpy_in(out, stat.as_bytes()) {
                    Ok(()) => self.ret(cpu, 0),
                    Err(_) => self.ret(cpu, -errno::EFAULT),
                }
            }
            Err(e) => self.ret(cpu, Self::vfs_errno(&e)),
        }
        Outcome::Done
    }

    pub(crate) fn sys_newfstatat(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let dirfd = cpu.get_x(10) as i64;
        let path = match self.path_arg(arena, cpu.get_x(11)) {
            Ok(p) => p,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        let out = cpu.get_x(12);
        let flags = cpu.get_x(13);

        if path.is_empty() && flags & defs::AT_EMPTY_PATH != 0 {
            cpu.set_x(10, dirfd as u64);
            cpu.set_x(11, out);
            return self.sys_fstat(cpu, arena);
        }
        if let Err(e) = self.at_check(dirfd, &path) {
            self.ret(cpu, e);
            return Outcome::Done;
        }
        let follow = flags & defs::AT_SYMLINK_NOFOLLOW == 0;
        match self.vfs.meta(&path, follow) {
            Ok(meta) => {
                let stat = Self::stat_from_meta(&meta);
                match arena.memcpy_in(out, stat.as_bytes()) {
                    Ok(()) => self.ret(cpu, 0),
                    Err(_) => self.ret(cpu, -errno::EFAULT),
                }
            }
            Err(e) => self.ret(cpu, Self::vfs_errno(&e)),
        }
        Outcome::Done
    }

    pub(crate) fn sys_statx(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let dirfd = cpu.get_x(10) as i64;
        let path = match self.path_arg(arena, cpu.get_x(11)) {
            Ok(p) => p,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        let flags = cpu.get_x(12);
        let out = cpu.get_x(14);

        let meta = if path.is_empty() && flags & defs::AT_EMPTY_PATH != 0 {
            if self.is_terminal_fd(dirfd as i32) {
                Ok(Self::tty_meta())
            } else {
                self.vfs.meta_fd(dirfd as i32)
            }
        } else {
            if let Err(e) = self.at_check(dirfd, &path) {
                self.ret(cpu, e);
                return Outcome::Done;
            }
            let follow = flags & defs::AT_SYMLINK_NOFOLLOW == 0;
            self.vfs.meta(&path, follow)
        };

        match meta {
            Ok(meta) => {
                let stx = defs::Statx {
                    stx_mask: defs::STATX_BASIC_STATS,
                    stx_blksize: 4096,
                    stx_nlink: 1,
                    stx_uid: meta.uid,
                    stx_gid: meta.gid,
                    stx_mode: (meta.kind.mode_bits() | (meta.mode & 0o7777)) as u16,
                    stx_ino: meta.ino,
                    stx_size: meta.size,
                    stx_blocks: (meta.size + 511) / 512,
                    stx_mtime: defs::StatxTimestamp {
                        tv_sec: meta.mtime as i64,
                        ..Default::default()
                    },
                    ..Default::default()
                };
                match arena.memcpy_in(out, stx.as_bytes()) {
                    Ok(()) => self.ret(cpu, 0),
                    Err(_) => self.ret(cpu, -errno::EFAULT),
                }
            }
            Err(e) => self.ret(cpu, Self::vfs_errno(&e)),
        }
        Outcome::Done
    }

    pub(crate) fn sys_readlinkat(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let dirfd = cpu.get_x(10) as i64;
        let path = match self.path_arg(arena, cpu.get_x(11)) {
            Ok(p) => p,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        if let Err(e) = self.at_check(dirfd, &path) {
            self.ret(cpu, e);
            return Outcome::Done;
        }
        let buf = cpu.get_x(12);
        let bufsiz = cpu.get_x(13) as usize;
        match self.vfs.readlink(&path) {
            Ok(target) => {
                let bytes = target.as_bytes();
                let n = bytes.len().min(bufsiz);
                match arena.memcpy_in(buf, &bytes[..n]) {
                    Ok(()) => self.ret(cpu, n as i64),
                    Err(_) => self.ret(cpu, -errno::EFAULT),
                }
            }
            Err(e) => self.ret(cpu, Self::vfs_errno(&e)),
        }
        Outcome::Done
    }

    pub(crate) fn sys_getcwd(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let buf = cpu.get_x(10);
        let size = cpu.get_x(11) as usize;
        let cwd = self.vfs.cwd().to_string();
        if cwd.len() + 1 > size {
            self.ret(cpu, -errno::ERANGE);
            return Outcome::Done;
        }
        let mut bytes = cwd.into_bytes();
        bytes.push(0);
        match arena.memcpy_in(buf, &bytes) {
            Ok(()) => self.ret(cpu, bytes.len() as i64),
            Err(_) => self.ret(cpu, -errno::EFAULT),
        }
        Outcome::Done
    }

    pub(crate) fn sys_chdir(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let path = match self.path_arg(arena, cpu.get_x(10)) {
            Ok(p) => p,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        let r = self.vfs.chdir(&path);
        self.ret_vfs(cpu, r, |_| 0);
        Outcome::Done
    }

    pub(crate) fn sys_faccessat(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let dirfd = cpu.get_x(10) as i64;
        let path = match self.path_arg(arena, cpu.get_x(11)) {
            Ok(p) => p,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        if let Err(e) = self.at_check(dirfd, &path) {
            self.ret(cpu, e);
            return Outcome::Done;
        }
        let r = self.vfs.resolve(&path).map(|_| ());
        self.ret_vfs(cpu, r, |_| 0);
        Outcome::Done
    }

    pub(crate) fn sys_getdents64(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        let buf = cpu.get_x(11);
        let len = cpu.get_x(12) as usize;
        match self.vfs.getdents_fd(fd, len) {
            Ok(bytes) => match arena.memcpy_in(buf, &bytes) {
                Ok(()) => self.ret(cpu, bytes.len() as i64),
                Err(_) => self.ret(cpu, -errno::EFAULT),
            },
            Err(e) => self.ret(cpu, Self::vfs_errno(&e)),
        }
        Outcome::Done
    }

    pub(crate) fn sys_mkdirat(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let dirfd = cpu.get_x(10) as i64;
        let path = match self.path_arg(arena, cpu.get_x(11)) {
            Ok(p) => p,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        if let Err(e) = self.at_check(dirfd, &path) {
            self.ret(cpu, e);
            return Outcome::Done;
        }
        let mode = cpu.get_x(12) as u32 & !self.umask;
        let r = self.vfs.mkdir(&path, mode).map(|_| ());
        self.ret_vfs(cpu, r, |_| 0);
        Outcome::Done
    }

    pub(crate) fn sys_mknodat(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let dirfd = cpu.get_x(10) as i64;
        let path = match self.path_arg(arena, cpu.get_x(11)) {
            Ok(p) => p,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        if let Err(e) = self.at_check(dirfd, &path) {
            self.ret(cpu, e);
            return Outcome::Done;
        }
        let mode = cpu.get_x(12) as u32;
        let kind = match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFIFO as u32 => NodeKind::Fifo,
            m if m == libc::S_IFCHR as u32 => NodeKind::CharDev,
            m if m == libc::S_IFBLK as u32 => NodeKind::BlockDev,
            _ => NodeKind::Regular,
        };
        let r = self
            .vfs
            .create_at(&path, vfs::Node::new(kind, mode & 0o7777))
            .map(|_| ());
        self.ret_vfs(cpu, r, |_| 0);
        Outcome::Done
    }

    pub(crate) fn sys_unlinkat(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let dirfd = cpu.get_x(10) as i64;
        let path = match self.path_arg(arena, cpu.get_x(11)) {
            Ok(p) => p,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        if let Err(e) = self.at_check(dirfd, &path) {
            self.ret(cpu, e);
            return Outcome::Done;
        }
        let rmdir = cpu.get_x(12) & defs::AT_REMOVEDIR != 0;
        let r = self.vfs.unlink(&path, rmdir);
        self.ret_vfs(cpu, r, |_| 0);
        Outcome::Done
    }

    pub(crate) fn sys_symlinkat(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let target = match self.path_arg(arena, cpu.get_x(10)) {
            Ok(p) => p,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        let dirfd = cpu.get_x(11) as i64;
        let linkpath = match self.path_arg(arena, cpu.get_x(12)) {
            Ok(p) => p,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        if let Err(e) = self.at_check(dirfd, &linkpath) {
            self.ret(cpu, e);
            return Outcome::Done;
        }
        let r = self.vfs.symlink(&target, &linkpath);
        self.ret_vfs(cpu, r, |_| 0);
        Outcome::Done
    }

    pub(crate) fn sys_linkat(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let olddirfd = cpu.get_x(10) as i64;
        let oldpath = match self.path_arg(arena, cpu.get_x(11)) {
            Ok(p) => p,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        let newdirfd = cpu.get_x(12) as i64;
        let newpath = match self.path_arg(arena, cpu.get_x(13)) {
            Ok(p) => p,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        if let Err(e) = self.at_check(olddirfd, &oldpath).and(self.at_check(newdirfd, &newpath)) {
            self.ret(cpu, e);
            return Outcome::Done;
        }
        let r = self.vfs.link(&oldpath, &newpath);
        self.ret_vfs(cpu, r, |_| 0);
        Outcome::Done
    }

    pub(crate) fn sys_renameat(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let olddirfd = cpu.get_x(10) as i64;
        let oldpath = match self.path_arg(arena, cpu.get_x(11)) {
            Ok(p) => p,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        let newdirfd = cpu.get_x(12) as i64;
        let newpath = match self.path_arg(arena, cpu.get_x(13)) {
            Ok(p) => p,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        if let Err(e) = self.at_check(olddirfd, &oldpath).and(self.at_check(newdirfd, &newpath)) {
            self.ret(cpu, e);
            return Outcome::Done;
        }
        let r = self.vfs.rename(&oldpath, &newpath);
        self.ret_vfs(cpu, r, |_| 0);
        Outcome::Done
    }

    pub(crate) fn sys_pipe2(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let fds_ptr = cpu.get_x(10);
        let nonblock = cpu.get_x(11) as u32 & vfs::fd_flags::O_NONBLOCK != 0;
        let (r, w) = self.vfs.pipe(nonblock);
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&r.to_le_bytes());
        buf[4..8].copy_from_slice(&w.to_le_bytes());
        match arena.memcpy_in(fds_ptr, &buf) {
            Ok(()) => self.ret(cpu, 0),
            Err(_) => {
                let _ = self.vfs.close(r);
                let _ = self.vfs.close(w);
                self.ret(cpu, -errno::EFAULT);
            }
        }
        Outcome::Done
    }

    pub(crate) fn sys_dup(&mut self, cpu: &mut CpuState) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        let r = self.vfs.dup(fd);
        self.ret_vfs(cpu, r, |n| n as i64);
        Outcome::Done
    }

    pub(crate) fn sys_dup3(&mut self, cpu: &mut CpuState) -> Outcome {
        let old = cpu.get_x(10) as i32;
        let new = cpu.get_x(11) as i32;
        let r = self.vfs.dup3(old, new);
        self.ret_vfs(cpu, r, |n| n as i64);
        Outcome::Done
    }

    pub(crate) fn sys_fcntl(&mut self, cpu: &mut CpuState) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        let cmd = cpu.get_x(11);
        match cmd {
            defs::F_DUPFD | defs::F_DUPFD_CLOEXEC => {
                let r = self.vfs.dup(fd);
                self.ret_vfs(cpu, r, |n| n as i64);
            }
            defs::F_GETFD | defs::F_SETFD => self.ret(cpu, 0),
            defs::F_GETFL => match self.vfs.fds.get(fd) {
                Ok(FdEntry::File(file)) => {
                    let flags = file.lock().flags.0 as i64;
                    self.ret(cpu, flags);
                }
                Ok(_) => self.ret(cpu, 0),
                Err(_) if self.is_terminal_fd(fd) => self.ret(cpu, 2), // O_RDWR
                Err(e) => self.ret(cpu, Self::vfs_errno(&e)),
            },
            defs::F_SETFL => {
                let newflags = cpu.get_x(12) as u32;
                if let Some(FdEntry::File(file)) = self.vfs.fds.entries.get(&fd) {
                    file.lock().flags.0 = newflags;
                } else {
                    // Only O_NONBLOCK matters for pipes and sockets.
                    self.set_nonblock(fd, newflags & vfs::fd_flags::O_NONBLOCK != 0);
                }
                self.ret(cpu, 0);
            }
            _ => self.ret(cpu, 0),
        }
        Outcome::Done
    }

    fn set_nonblock(&mut self, fd: i32, nb: bool) {
        if let Some(entry) = self.vfs.fds.entries.get_mut(&fd) {
            match entry {
                FdEntry::Pipe { nonblock, .. } => *nonblock = nb,
                FdEntry::Socket(sock) => sock.lock().nonblock = nb,
                _ => {}
            }
        }
    }

    pub(crate) fn sys_close_range(&mut self, cpu: &mut CpuState) -> Outcome {
        let first = cpu.get_x(10) as i32;
        let last = cpu.get_x(11).min(i32::MAX as u64) as i32;
        let fds: Vec<i32> = self
            .vfs
            .fds
            .entries
            .keys()
            .copied()
            .filter(|fd| *fd >= first && *fd <= last)
            .collect();
        for fd in fds {
            let _ = self.vfs.close(fd);
        }
        self.ret(cpu, 0);
        Outcome::Done
    }

    pub(crate) fn sys_statfs(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        // struct statfs: 15 u64-ish fields on riscv64 (120 bytes). Report
        // a rootfs-flavoured tmpfs.
        let out = cpu.get_x(11);
        let mut buf = [0u8; 120];
        let mut put = |idx: usize, v: u64| {
            buf[idx * 8..idx * 8 + 8].copy_from_slice(&v.to_le_bytes());
        };
        put(0, 0x01021994); // TMPFS_MAGIC
        put(1, 4096); // bsize
        put(2, 1 << 19); // blocks
        put(3, 1 << 18); // bfree
        put(4, 1 << 18); // bavail
        put(5, 1 << 20); // files
        put(6, 1 << 19); // ffree
        put(9, 255); // namelen
        put(10, 4096); // frsize
        match arena.memcpy_in(out, &buf) {
            Ok(()) => self.ret(cpu, 0),
            Err(_) => self.ret(cpu, -errno::EFAULT),
        }
        Outcome::Done
    }

    pub(crate) fn sys_ioctl(&mut self, cpu: &mut CpuState, arena: &mut Arena, io: &dyn HostIo) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        let req = cpu.get_x(11);
        let arg = cpu.get_x(12);

        match req {
            ioctl::TCGETS => {
                if !self.is_terminal_fd(fd) {
                    self.ret(cpu, -errno::ENOTTY);
                    return Outcome::Done;
                }
                let t = self.termios;
                match arena.memcpy_in(arg, &t) {
                    Ok(()) => self.ret(cpu, 0),
                    Err(_) => self.ret(cpu, -errno::EFAULT),
                }
            }
            ioctl::TCSETS | ioctl::TCSETSW | ioctl::TCSETSF => {
                if !self.is_terminal_fd(fd) {
                    self.ret(cpu, -errno::ENOTTY);
                    return Outcome::Done;
                }
                let mut t = [0u8; defs::TERMIOS_LEN];
                match arena.memcpy_out(&mut t, arg) {
                    Ok(()) => {
                        // Raw-mode state persists until the guest restores it.
                        self.termios = t;
                        self.ret(cpu, 0);
                    }
                    Err(_) => self.ret(cpu, -errno::EFAULT),
                }
            }
            ioctl::TIOCGWINSZ => {
                let (cols, rows) = io.window_size();
                let mut ws = [0u8; 8];
                ws[0..2].copy_from_slice(&rows.to_le_bytes());
                ws[2..4].copy_from_slice(&cols.to_le_bytes());
                match arena.memcpy_in(arg, &ws) {
                    Ok(()) => self.ret(cpu, 0),
                    Err(_) => self.ret(cpu, -errno::EFAULT),
                }
            }
            ioctl::TIOCSWINSZ => self.ret(cpu, 0),
            ioctl::TIOCGPGRP => {
                let pg = self.pgrp;
                match arena.poke(arg, &pg.to_le_bytes()) {
                    Ok(()) => self.ret(cpu, 0),
                    Err(_) => self.ret(cpu, -errno::EFAULT),
                }
            }
            ioctl::TIOCSPGRP => {
                let mut b = [0u8; 4];
                if arena.peek(arg, &mut b).is_ok() {
                    self.pgrp = i32::from_le_bytes(b);
                }
                self.ret(cpu, 0);
            }
            ioctl::FIONBIO => {
                let mut b = [0u8; 4];
                let nb = arena.peek(arg, &mut b).is_ok() && i32::from_le_bytes(b) != 0;
                self.set_nonblock(fd, nb);
                self.ret(cpu, 0);
            }
            ioctl::FIONREAD => {
                let n = if self.is_terminal_fd(fd) {
                    usize::from(io.stdin_ready())
                } else {
                    self.vfs.readable_bytes(fd).unwrap_or(0)
                };
                match arena.poke(arg, &(n as i32).to_le_bytes()) {
                    Ok(()) => self.ret(cpu, 0),
                    Err(_) => self.ret(cpu, -errno::EFAULT),
                }
            }
            _ => {
                tracing::debug!(fd, req, "unhandled ioctl");
                self.ret(cpu, -errno::EINVAL);
            }
        }
        Outcome::Done
    }
}

enum DevRead {
    Zeroes(usize),
    Random(usize),
    Empty,
}
