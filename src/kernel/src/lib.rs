//! Linux system-call emulation for a single root process.
//!
//! Handlers implement riscv64 Linux semantics over the in-memory
//! filesystem, the guest arena and the host bridge. Nothing here ever
//! aborts the emulator: failures become negative errnos in `a0`.
//!
//! Suspension is a value, not an exception: `Outcome` tells the execution
//! loop whether the call completed, wants the machine stopped until stdin
//! arrives (with the pc rewound so the ecall re-executes on resume), or
//! requests an execve restart.

pub mod defs;
mod exec;
mod fs;
mod mem;
mod poll;
mod proc;
mod socket;

use std::time::{Duration, Instant};

use arena::state::CpuState;
use arena::Arena;
use bridge::HostIo;
use tracing::trace;

use defs::{errno, nr};
pub use exec::ExecRequest;
pub use proc::{ForkSnapshot, ProcLayout, ThreadSet, MAX_THREADS};
use vfs::Vfs;

/// What the execution loop should do after a syscall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Completed; registers hold the result.
    Done,
    /// No input available: the pc has been rewound to the ecall; stop the
    /// machine and retry once the foreground supplies data.
    StdinWait,
    /// nanosleep: yield to the host for the duration, then continue.
    Sleep(Duration),
    /// Guest exited with this status.
    Exit(i32),
    /// execve succeeded; reload from `Kernel::take_exec_request`.
    ExecRestart,
}

pub struct Kernel {
    pub vfs: Vfs,
    pub threads: ThreadSet,
    pub layout: ProcLayout,
    pub fork: Option<ForkSnapshot>,
    exited_children: proc::ExitedChildren,
    exec_request: Option<ExecRequest>,

    termios: [u8; defs::TERMIOS_LEN],
    pgrp: i32,
    umask: u32,
    tid_address: u64,
    hostname: String,
    next_pid: i32,
    start: Instant,
    /// ppoll/epoll retry marker: second identical poll with a finite
    /// timeout reports expiry instead of suspending again.
    pending_poll: Option<u64>,
}

impl Kernel {
    pub fn new(vfs: Vfs, hostname: &str, syscall_quantum: u32) -> Kernel {
        Kernel {
            vfs,
            threads: ThreadSet::new(syscall_quantum),
            layout: ProcLayout::default(),
            fork: None,
            exited_children: Default::default(),
            exec_request: None,
            termios: defs::default_termios(),
            pgrp: 1,
            umask: 0o022,
            tid_address: 0,
            hostname: hostname.to_string(),
            next_pid: 2,
            start: Instant::now(),
            pending_poll: None,
        }
    }

    pub fn take_exec_request(&mut self) -> Option<ExecRequest> {
        self.exec_request.take()
    }

    pub fn in_forked_child(&self) -> bool {
        self.fork.is_some()
    }

    fn ret(&self, cpu: &mut CpuState, value: i64) {
        cpu.set_x(10, value as u64);
    }

    fn vfs_errno(e: &vfs::Error) -> i64 {
        use vfs::Error::*;
        match e {
            NotFound(_) => -errno::ENOENT,
            NotDir(_) => -errno::ENOTDIR,
            IsDir(_) => -errno::EISDIR,
            Exists(_) => -errno::EEXIST,
            NotEmpty(_) => -errno::ENOTEMPTY,
            SymlinkLoop(_) => -errno::ELOOP,
            BadFd(_) => -errno::EBADF,
            InvalidArg => -errno::EINVAL,
            BadTar(_) => -errno::EINVAL,
        }
    }

    fn ret_vfs<T>(&self, cpu: &mut CpuState, r: vfs::Result<T>, ok: impl FnOnce(T) -> i64) {
        match r {
            Ok(v) => self.ret(cpu, ok(v)),
            Err(e) => self.ret(cpu, Self::vfs_errno(&e)),
        }
    }

    /// Entry point: `cpu.pc` is at the ecall. The pc is committed past it
    /// up front; retry outcomes rewind by one instruction, implementing
    /// the wait-on-stdin contract.
    pub fn handle_syscall(
        &mut self,
        cpu: &mut CpuState,
        arena: &mut Arena,
        io: &dyn HostIo,
    ) -> Outcome {
        let sysno = cpu.get_x(17);
        cpu.pc += 4;

        let outcome = self.dispatch(sysno, cpu, arena, io);

        if !matches!(outcome, Outcome::StdinWait) && sysno != nr::PPOLL && sysno != nr::EPOLL_PWAIT
        {
            self.pending_poll = None;
        }
        if matches!(outcome, Outcome::StdinWait) {
            cpu.pc -= 4;
        }
        if matches!(outcome, Outcome::Done) {
            self.threads.on_syscall(cpu);
        }
        outcome
    }

    fn dispatch(
        &mut self,
        sysno: u64,
        cpu: &mut CpuState,
        arena: &mut Arena,
        io: &dyn HostIo,
    ) -> Outcome {
        trace!(sysno, a0 = cpu.get_x(10), a1 = cpu.get_x(11), pc = cpu.pc - 4, "syscall");
        match sysno {
            // File I/O and filesystem.
            nr::OPENAT => self.sys_openat(cpu, arena),
            nr::CLOSE => self.sys_close(cpu),
            nr::READ => self.sys_read(cpu, arena, io),
            nr::WRITE => self.sys_write(cpu, arena, io),
            nr::READV => self.sys_readv(cpu, arena, io),
            nr::WRITEV => self.sys_writev(cpu, arena, io),
            nr::PREAD64 => self.sys_pread(cpu, arena),
            nr::PWRITE64 | nr::PWRITEV | nr::PREADV => self.sys_pwritev_family(sysno, cpu, arena),
            nr::LSEEK => self.sys_lseek(cpu),
            nr::SENDFILE => self.sys_sendfile(cpu, arena, io),
            nr::FTRUNCATE => self.sys_ftruncate(cpu),
            nr::FSYNC | nr::FDATASYNC | nr::SYNC | nr::FLOCK => {
                self.ret(cpu, 0);
                Outcome::Done
            }
            nr::FCHMOD => self.sys_fchmod(cpu),
            nr::FCHMODAT => self.sys_fchmodat(cpu, arena),
            nr::FCHOWNAT | nr::FCHOWN => {
                self.ret(cpu, 0);
                Outcome::Done
            }
            nr::NEWFSTATAT => self.sys_newfstatat(cpu, arena),
            nr::FSTAT => self.sys_fstat(cpu, arena),
            nr::STATX => self.sys_statx(cpu, arena),
            nr::READLINKAT => self.sys_readlinkat(cpu, arena),
            nr::GETCWD => self.sys_getcwd(cpu, arena),
            nr::CHDIR => self.sys_chdir(cpu, arena),
            nr::FACCESSAT | nr::FACCESSAT2 => self.sys_faccessat(cpu, arena),
            nr::GETDENTS64 => self.sys_getdents64(cpu, arena),
            nr::MKDIRAT => self.sys_mkdirat(cpu, arena),
            nr::MKNODAT => self.sys_mknodat(cpu, arena),
            nr::UNLINKAT => self.sys_unlinkat(cpu, arena),
            nr::SYMLINKAT => self.sys_symlinkat(cpu, arena),
            nr::LINKAT => self.sys_linkat(cpu, arena),
            nr::RENAMEAT | nr::RENAMEAT2 => self.sys_renameat(cpu, arena),
            nr::UTIMENSAT => {
                self.ret(cpu, 0);
                Outcome::Done
            }
            nr::PIPE2 => self.sys_pipe2(cpu, arena),
            nr::DUP => self.sys_dup(cpu),
            nr::DUP3 => self.sys_dup3(cpu),
            nr::FCNTL => self.sys_fcntl(cpu),
            nr::IOCTL => self.sys_ioctl(cpu, arena, io),
            nr::CLOSE_RANGE => self.sys_close_range(cpu),
            nr::STATFS => self.sys_statfs(cpu, arena),

            // Memory.
            nr::BRK => self.sys_brk(cpu, arena),
            nr::MMAP => self.sys_mmap(cpu, arena),
            nr::MUNMAP => self.sys_munmap(cpu, arena),
            nr::MPROTECT => self.sys_mprotect(cpu, arena),
            nr::MREMAP => self.sys_mremap(cpu, arena),
            nr::MADVISE => {
                self.ret(cpu, 0);
                Outcome::Done
            }

            // Polling.
            nr::PPOLL => self.sys_ppoll(cpu, arena, io),
            nr::EPOLL_CREATE1 => self.sys_epoll_create1(cpu),
            nr::EPOLL_CTL => self.sys_epoll_ctl(cpu, arena),
            nr::EPOLL_PWAIT => self.sys_epoll_pwait(cpu, arena, io),

            // Identity and credentials: one root process, pid 1.
            nr::GETPID | nr::GETPPID | nr::GETPGID | nr::GETSID | nr::SETSID => {
                self.ret(cpu, 1);
                Outcome::Done
            }
            nr::GETTID => {
                let tid = self.threads.current_tid();
                self.ret(cpu, tid as i64);
                Outcome::Done
            }
            nr::GETUID | nr::GETEUID | nr::GETGID | nr::GETEGID => {
                self.ret(cpu, 0);
                Outcome::Done
            }
            nr::GETGROUPS => {
                self.ret(cpu, 0);
                Outcome::Done
            }
            nr::GETRESUID | nr::GETRESGID => {
                for reg in 10..=12 {
                    let ptr = cpu.get_x(reg);
                    if ptr != 0 {
                        let _ = arena.poke(ptr, &0u32.to_le_bytes());
                    }
                }
                self.ret(cpu, 0);
                Outcome::Done
            }
            nr::SETPGID => {
                self.ret(cpu, 0);
                Outcome::Done
            }
            nr::UMASK => {
                let old = self.umask;
                self.umask = cpu.get_x(10) as u32 & 0o777;
                self.ret(cpu, old as i64);
                Outcome::Done
            }

            // Signals: accepted and ignored; no asynchronous delivery.
            nr::RT_SIGACTION | nr::RT_SIGPROCMASK | nr::SIGALTSTACK | nr::RT_SIGTIMEDWAIT
            | nr::RT_SIGSUSPEND | nr::RT_SIGRETURN | nr::KILL | nr::TKILL | nr::TGKILL => {
                self.ret(cpu, 0);
                Outcome::Done
            }

            // Synchronization.
            nr::FUTEX => self.sys_futex(cpu, arena),
            nr::MEMBARRIER => {
                self.ret(cpu, 0);
                Outcome::Done
            }

            // Time.
            nr::CLOCK_GETTIME | nr::GETTIMEOFDAY => self.sys_clock_gettime(cpu, arena, sysno),
            nr::CLOCK_GETRES => {
                let ptr = cpu.get_x(11);
                if ptr != 0 {
                    let ts = defs::Timespec { tv_sec: 0, tv_nsec: 1 };
                    let _ = arena.write_obj(ptr, ts);
                }
                self.ret(cpu, 0);
                Outcome::Done
            }
            nr::NANOSLEEP | nr::CLOCK_NANOSLEEP => self.sys_nanosleep(cpu, arena, sysno),

            // System info.
            nr::UNAME => self.sys_uname(cpu, arena),
            nr::SYSINFO => self.sys_sysinfo(cpu, arena),
            nr::GETRLIMIT | nr::PRLIMIT64 => self.sys_prlimit(cpu, arena, sysno),
            nr::SETRLIMIT | nr::GETRUSAGE | nr::SYSLOG => {
                self.ret(cpu, 0);
                Outcome::Done
            }
            nr::GETRANDOM => self.sys_getrandom(cpu, arena),

            // Scheduling odds and ends.
            nr::SCHED_YIELD => self.sys_sched_yield(cpu),
            nr::SCHED_GETSCHEDULER | nr::SCHED_GETPARAM | nr::SCHED_SETPARAM
            | nr::SCHED_SETSCHEDULER | nr::SCHED_SETAFFINITY | nr::PRCTL => {
                self.ret(cpu, 0);
                Outcome::Done
            }
            nr::SCHED_GETAFFINITY => {
                let len = cpu.get_x(11) as usize;
                let ptr = cpu.get_x(12);
                if len >= 8 && ptr != 0 {
                    let _ = arena.poke(ptr, &1u64.to_le_bytes());
                    self.ret(cpu, 8);
                } else {
                    self.ret(cpu, -errno::EINVAL);
                }
                Outcome::Done
            }
            nr::SET_TID_ADDRESS => {
                self.tid_address = cpu.get_x(10);
                let tid = self.threads.current_tid();
                self.ret(cpu, tid as i64);
                Outcome::Done
            }
            nr::SET_ROBUST_LIST => {
                self.ret(cpu, 0);
                Outcome::Done
            }

            // Processes.
            nr::CLONE => self.sys_clone(cpu, arena),
            nr::CLONE3 => {
                // Guests fall back to clone(2).
                self.ret(cpu, -errno::ENOSYS);
                Outcome::Done
            }
            nr::EXECVE => self.sys_execve(cpu, arena),
            nr::WAIT4 | nr::WAITID => self.sys_wait4(cpu, arena),
            nr::EXIT => self.sys_exit(cpu, arena, false),
            nr::EXIT_GROUP => self.sys_exit(cpu, arena, true),

            // Sockets.
            nr::SOCKET => self.sys_socket(cpu, io),
            nr::SOCKETPAIR => self.sys_socketpair(cpu, arena),
            nr::BIND | nr::CONNECT | nr::LISTEN | nr::SHUTDOWN | nr::SETSOCKOPT => {
                self.sys_socket_fwd(sysno, cpu, arena, io)
            }
            nr::GETSOCKOPT => self.sys_getsockopt(cpu, arena, io),
            nr::ACCEPT | nr::ACCEPT4 => self.sys_accept(cpu, io),
            nr::SENDTO | nr::SENDMSG => self.sys_send(sysno, cpu, arena, io),
            nr::RECVFROM | nr::RECVMSG => self.sys_recv(sysno, cpu, arena, io),
            nr::GETSOCKNAME | nr::GETPEERNAME => self.sys_getsockname(cpu, arena),

            // Probed by modern runtimes; refusing makes them fall back.
            nr::EVENTFD2 | nr::IO_URING_SETUP | nr::CAPGET | nr::RSEQ | nr::RISCV_HWPROBE => {
                self.ret(cpu, -errno::ENOSYS);
                Outcome::Done
            }

            other => {
                tracing::debug!(sysno = other, "unimplemented syscall");
                self.ret(cpu, -errno::ENOSYS);
                Outcome::Done
            }
        }
    }

    // === Small handlers that do not warrant their own module === //

    fn sys_clock_gettime(&mut self, cpu: &mut CpuState, arena: &mut Arena, sysno: u64) -> Outcome {
        let (clock_id, ptr) = if sysno == nr::GETTIMEOFDAY {
            (0, cpu.get_x(10))
        } else {
            (cpu.get_x(10), cpu.get_x(11))
        };
        let now = if clock_id == 1 || clock_id == 4 {
            // CLOCK_MONOTONIC and friends: time since boot.
            self.start.elapsed()
        } else {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
        };
        if ptr != 0 {
            let ts = defs::Timespec {
                tv_sec: now.as_secs() as i64,
                tv_nsec: if sysno == nr::GETTIMEOFDAY {
                    now.subsec_micros() as i64
                } else {
                    now.subsec_nanos() as i64
                },
            };
            if arena.write_obj(ptr, ts).is_err() {
                self.ret(cpu, -errno::EFAULT);
                return Outcome::Done;
            }
        }
        self.ret(cpu, 0);
        Outcome::Done
    }

    fn sys_nanosleep(&mut self, cpu: &mut CpuState, arena: &mut Arena, sysno: u64) -> Outcome {
        let req_ptr = if sysno == nr::CLOCK_NANOSLEEP {
            cpu.get_x(12)
        } else {
            cpu.get_x(10)
        };
        let mut buf = [0u8; 16];
        if arena.peek(req_ptr, &mut buf).is_err() {
            self.ret(cpu, -errno::EFAULT);
            return Outcome::Done;
        }
        let sec = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        let nsec = i64::from_le_bytes(buf[8..16].try_into().unwrap());
        if sec < 0 || !(0..1_000_000_000).contains(&nsec) {
            self.ret(cpu, -errno::EINVAL);
            return Outcome::Done;
        }
        self.ret(cpu, 0);
        // Rounded up to a millisecond; the loop performs the host sleep
        // after yielding to any runnable sibling.
        let dur = Duration::from_secs(sec as u64) + Duration::from_nanos(nsec as u64);
        let dur = dur.max(Duration::from_millis(1));
        self.threads.rotate(cpu);
        Outcome::Sleep(dur)
    }

    fn sys_uname(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let ptr = cpu.get_x(10);
        let bytes = defs::utsname_bytes(&self.hostname);
        if arena.poke(ptr, &bytes).is_err() {
            self.ret(cpu, -errno::EFAULT);
        } else {
            self.ret(cpu, 0);
        }
        Outcome::Done
    }

    fn sys_sysinfo(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let ptr = cpu.get_x(10);
        let info = defs::Sysinfo {
            uptime: self.start.elapsed().as_secs() as i64,
            totalram: arena.size(),
            freeram: arena.size().saturating_sub(arena.mmap_top()),
            procs: 1 + self.threads.len() as u16 - 1,
            mem_unit: 1,
            ..Default::default()
        };
        if arena.write_obj(ptr, info).is_err() {
            self.ret(cpu, -errno::EFAULT);
        } else {
            self.ret(cpu, 0);
        }
        Outcome::Done
    }

    fn sys_prlimit(&mut self, cpu: &mut CpuState, arena: &mut Arena, sysno: u64) -> Outcome {
        const RLIMIT_STACK: u64 = 3;
        const RLIMIT_NOFILE: u64 = 7;
        let (resource, old_ptr) = if sysno == nr::PRLIMIT64 {
            (cpu.get_x(11), cpu.get_x(13))
        } else {
            (cpu.get_x(10), cpu.get_x(11))
        };
        if old_ptr != 0 {
            let (cur, max) = match resource {
                RLIMIT_STACK => (8 * 1024 * 1024u64, 8 * 1024 * 1024u64),
                RLIMIT_NOFILE => (1024, 4096),
                _ => (u64::MAX, u64::MAX),
            };
            let mut buf = [0u8; 16];
            buf[0..8].copy_from_slice(&cur.to_le_bytes());
            buf[8..16].copy_from_slice(&max.to_le_bytes());
            if arena.poke(old_ptr, &buf).is_err() {
                self.ret(cpu, -errno::EFAULT);
                return Outcome::Done;
            }
        }
        self.ret(cpu, 0);
        Outcome::Done
    }

    fn sys_getrandom(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let ptr = cpu.get_x(10);
        let len = (cpu.get_x(11) as usize).min(1024 * 1024);
        let mut bytes = vec![0u8; len];
        rand::Rng::fill(&mut rand::thread_rng(), bytes.as_mut_slice());
        match arena.memcpy_in(ptr, &bytes) {
            Ok(()) => self.ret(cpu, len as i64),
            Err(_) => self.ret(cpu, -errno::EFAULT),
        }
        Outcome::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena::{PageAttrs, PAGE_SIZE};
    use bridge::LocalIo;

    const ECALL_PC: u64 = 0x1000;

    fn setup() -> (Kernel, CpuState, Arena, LocalIo) {
        let mut vfs = Vfs::new();
        vfs.populate_defaults("test");
        let kernel = Kernel::new(vfs, "test", 50_000);
        let mut arena = Arena::new_owned(256 * PAGE_SIZE);
        arena
            .set_page_attr(0x10 * PAGE_SIZE, 0x80 * PAGE_SIZE, PageAttrs::RW)
            .unwrap();
        let mut cpu = CpuState::default();
        cpu.pc = ECALL_PC;
        cpu.set_x(2, 0x80 * PAGE_SIZE); // sp
        (kernel, cpu, arena, LocalIo::new(b""))
    }

    fn syscall(
        k: &mut Kernel,
        cpu: &mut CpuState,
        arena: &mut Arena,
        io: &LocalIo,
        sysno: u64,
        args: &[u64],
    ) -> Outcome {
        cpu.pc = ECALL_PC;
        cpu.set_x(17, sysno);
        for (i, a) in args.iter().enumerate() {
            cpu.set_x(10 + i as u8, *a);
        }
        k.handle_syscall(cpu, arena, io)
    }

    #[test]
    fn write_routes_to_the_terminal() {
        let (mut k, mut cpu, mut arena, io) = setup();
        arena.memcpy_in(0x11000, b"hello").unwrap();
        let out = syscall(&mut k, &mut cpu, &mut arena, &io, defs::nr::WRITE, &[1, 0x11000, 5]);
        assert_eq!(out, Outcome::Done);
        assert_eq!(cpu.get_x(10), 5);
        assert_eq!(cpu.pc, ECALL_PC + 4);
        assert_eq!(io.stdout(), b"hello");
    }

    #[test]
    fn unknown_syscall_is_enosys() {
        let (mut k, mut cpu, mut arena, io) = setup();
        syscall(&mut k, &mut cpu, &mut arena, &io, 9999, &[]);
        assert_eq!(cpu.get_x(10) as i64, -errno::ENOSYS);
    }

    #[test]
    fn futex_wait_wake_makes_progress() {
        let (mut k, mut cpu, mut arena, io) = setup();
        let futex_addr = 0x20000u64;

        // Spawn a second thread; the child runs first with a0 == 0.
        let out = syscall(
            &mut k,
            &mut cpu,
            &mut arena,
            &io,
            defs::nr::CLONE,
            &[defs::CLONE_VM | defs::CLONE_THREAD, 0x70000, 0, 0, 0],
        );
        assert_eq!(out, Outcome::Done);
        assert_eq!(cpu.get_x(10), 0, "child resumes first");
        assert_eq!(k.threads.current_tid(), 2);

        // Child: futex WAIT with the expected value matching -> blocks and
        // the scheduler hands the cpu back to the main thread.
        syscall(
            &mut k,
            &mut cpu,
            &mut arena,
            &io,
            defs::nr::FUTEX,
            &[futex_addr, defs::FUTEX_WAIT, 0],
        );
        assert_eq!(k.threads.current_tid(), 1);
        assert_eq!(cpu.get_x(10), 2, "parent finally sees the clone result");

        // Parent writes the value and wakes the futex.
        arena.poke(futex_addr, &1u32.to_le_bytes()).unwrap();
        syscall(
            &mut k,
            &mut cpu,
            &mut arena,
            &io,
            defs::nr::FUTEX,
            &[futex_addr, defs::FUTEX_WAKE, 1],
        );
        assert_eq!(cpu.get_x(10), 1, "one waiter woken");
        // The wake yields; the child can now observe the new value.
        assert_eq!(k.threads.current_tid(), 2);
        let mut word = [0u8; 4];
        arena.peek(futex_addr, &mut word).unwrap();
        assert_eq!(u32::from_le_bytes(word), 1);
    }

    #[test]
    fn futex_mismatch_is_eagain() {
        let (mut k, mut cpu, mut arena, io) = setup();
        arena.poke(0x20000, &7u32.to_le_bytes()).unwrap();
        syscall(
            &mut k,
            &mut cpu,
            &mut arena,
            &io,
            defs::nr::FUTEX,
            &[0x20000, defs::FUTEX_WAIT, 0],
        );
        assert_eq!(cpu.get_x(10) as i64, -errno::EAGAIN);
    }

    #[test]
    fn futex_deadlock_breaks_by_waking_a_sleeper() {
        let (mut k, mut cpu, mut arena, io) = setup();
        // One extra thread; both will wait on distinct unsignalled words.
        syscall(
            &mut k,
            &mut cpu,
            &mut arena,
            &io,
            defs::nr::CLONE,
            &[defs::CLONE_VM | defs::CLONE_THREAD, 0x70000, 0, 0, 0],
        );
        // Child waits on A.
        syscall(&mut k, &mut cpu, &mut arena, &io, defs::nr::FUTEX, &[0x20000, defs::FUTEX_WAIT, 0]);
        assert_eq!(k.threads.current_tid(), 1);
        // Main waits on B: everyone is blocked, so one sleeper is force
        // woken and execution continues instead of deadlocking.
        syscall(&mut k, &mut cpu, &mut arena, &io, defs::nr::FUTEX, &[0x28000, defs::FUTEX_WAIT, 0]);
        assert!(k.threads.current_tid() == 1 || k.threads.current_tid() == 2);
    }

    #[test]
    fn fork_round_trip_restores_the_parent_world() {
        let (mut k, mut cpu, mut arena, io) = setup();
        k.layout = ProcLayout {
            data_range: Some((0x10000, 0x12000)),
            interp_data: None,
            stack_high: 0x80 * PAGE_SIZE,
        };
        arena.memcpy_in(0x10100, b"parent-data").unwrap();
        let parent_sp = cpu.get_x(2);
        arena.memcpy_in(parent_sp - 64, b"parent-stack").unwrap();
        cpu.set_x(9, 0xabcd); // callee-saved, must survive the child

        let out = syscall(&mut k, &mut cpu, &mut arena, &io, defs::nr::CLONE, &[17, 0, 0, 0, 0]);
        assert_eq!(out, Outcome::Done);
        assert_eq!(cpu.get_x(10), 0, "in the child");
        assert!(k.in_forked_child());

        // Child scribbles over data and stack, opens an fd, changes regs.
        arena.memcpy_in(0x10100, b"child-data!").unwrap();
        arena.memcpy_in(parent_sp - 64, b"child-stack!").unwrap();
        cpu.set_x(9, 0x9999);
        let fd = k.vfs.open("/etc/passwd", 0, 0).unwrap();
        assert_eq!(fd, 3);

        // Child exits 5; the parent resumes with the pid in a0.
        let out = syscall(&mut k, &mut cpu, &mut arena, &io, defs::nr::EXIT_GROUP, &[5]);
        assert_eq!(out, Outcome::Done);
        assert!(!k.in_forked_child());
        let child_pid = cpu.get_x(10);
        assert_eq!(child_pid, 2);
        assert_eq!(cpu.get_x(9), 0xabcd, "registers restored");

        let mut buf = [0u8; 11];
        arena.memcpy_out(&mut buf, 0x10100).unwrap();
        assert_eq!(&buf, b"parent-data");
        let mut sbuf = [0u8; 12];
        arena.memcpy_out(&mut sbuf, parent_sp - 64).unwrap();
        assert_eq!(&sbuf, b"parent-stack");
        assert!(k.vfs.fds.entries.is_empty(), "child's fd closed at restore");

        // wait4 reports the pid and encoded status.
        let out = syscall(
            &mut k,
            &mut cpu,
            &mut arena,
            &io,
            defs::nr::WAIT4,
            &[u64::MAX, parent_sp - 128, 0, 0],
        );
        assert_eq!(out, Outcome::Done);
        assert_eq!(cpu.get_x(10), child_pid);
        let mut status = [0u8; 4];
        arena.memcpy_out(&mut status, parent_sp - 128).unwrap();
        assert_eq!(u32::from_le_bytes(status), 5 << 8);
    }

    #[test]
    fn nested_fork_would_block() {
        let (mut k, mut cpu, mut arena, io) = setup();
        k.layout.stack_high = 0x80 * PAGE_SIZE;
        syscall(&mut k, &mut cpu, &mut arena, &io, defs::nr::CLONE, &[17, 0, 0, 0, 0]);
        assert_eq!(cpu.get_x(10), 0);
        syscall(&mut k, &mut cpu, &mut arena, &io, defs::nr::CLONE, &[17, 0, 0, 0, 0]);
        assert_eq!(cpu.get_x(10) as i64, -errno::EAGAIN);
    }

    #[test]
    fn stdin_wait_rewinds_the_pc() {
        let (mut k, mut cpu, mut arena, _io) = setup();
        // A bridge-backed worker with no buffered input reports
        // WouldBlock; LocalIo never blocks, so use the real channel.
        let (worker, _fg) = bridge::channel();
        cpu.set_x(17, defs::nr::READ);
        cpu.set_x(10, 0);
        cpu.set_x(11, 0x11000);
        cpu.set_x(12, 64);
        cpu.pc = ECALL_PC;
        let out = k.handle_syscall(&mut cpu, &mut arena, &worker);
        assert_eq!(out, Outcome::StdinWait);
        assert_eq!(cpu.pc, ECALL_PC, "pc rewound so the ecall re-executes");
    }

    #[test]
    fn openat_requires_the_cwd_sentinel() {
        let (mut k, mut cpu, mut arena, io) = setup();
        arena.memcpy_in(0x11000, b"etc\0").unwrap();
        syscall(&mut k, &mut cpu, &mut arena, &io, defs::nr::OPENAT, &[5, 0x11000, 0, 0]);
        assert_eq!(cpu.get_x(10) as i64, -errno::ENOTSUP);
        syscall(
            &mut k,
            &mut cpu,
            &mut arena,
            &io,
            defs::nr::OPENAT,
            &[defs::AT_FDCWD as u64, 0x11000, 0, 0],
        );
        assert!((cpu.get_x(10) as i64) >= 3);
    }

    #[test]
    fn brk_and_mmap_grow_monotonically() {
        let (mut k, mut cpu, mut arena, io) = setup();
        arena.set_brk_base(0x40000);
        arena.set_mmap_base(0x60000);
        syscall(&mut k, &mut cpu, &mut arena, &io, defs::nr::BRK, &[0]);
        assert_eq!(cpu.get_x(10), 0x40000);
        syscall(&mut k, &mut cpu, &mut arena, &io, defs::nr::BRK, &[0x48000]);
        assert_eq!(cpu.get_x(10), 0x48000);

        syscall(
            &mut k,
            &mut cpu,
            &mut arena,
            &io,
            defs::nr::MMAP,
            &[0, 0x3000, defs::PROT_READ | defs::PROT_WRITE, defs::MAP_ANONYMOUS, u64::MAX, 0],
        );
        let first = cpu.get_x(10);
        assert_eq!(first, 0x60000);
        syscall(
            &mut k,
            &mut cpu,
            &mut arena,
            &io,
            defs::nr::MMAP,
            &[0, 0x1000, defs::PROT_READ | defs::PROT_WRITE, defs::MAP_ANONYMOUS, u64::MAX, 0],
        );
        assert!(cpu.get_x(10) >= first + 0x3000);
    }
}
