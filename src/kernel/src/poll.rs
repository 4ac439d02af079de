//! ppoll and epoll over the cooperative model: readiness is computed
//! synchronously; an empty result either reports timeout expiry or
//! suspends to the foreground until input can arrive.

use std::sync::Arc;

use arena::state::CpuState;
use arena::Arena;
use bridge::{ops, HostIo, NetRequest};
use utils::Mutex;

use crate::defs::{self, errno};
use crate::{Kernel, Outcome};
use vfs::{EpollInstance, FdEntry};

impl Kernel {
    /// POLLIN/POLLOUT/POLLHUP readiness for one descriptor.
    fn poll_events(&self, fd: i32, io: &dyn HostIo) -> u16 {
        if self.is_terminal_fd(fd) {
            let mut ev = defs::POLLOUT;
            if io.stdin_ready() {
                ev |= defs::POLLIN;
            }
            return ev;
        }
        match self.vfs.fds.entries.get(&fd) {
            Some(FdEntry::File(_)) => defs::POLLIN | defs::POLLOUT,
            Some(FdEntry::Pipe { write_end: true, .. }) => defs::POLLOUT,
            Some(FdEntry::Pipe { .. }) => {
                let readable = self.vfs.readable_bytes(fd).unwrap_or(0) > 0;
                let eof = self.vfs.pipe_at_eof(fd);
                let mut ev = 0;
                if readable {
                    ev |= defs::POLLIN;
                }
                if eof {
                    ev |= defs::POLLIN | defs::POLLHUP;
                }
                ev
            }
            Some(FdEntry::Duplex { .. }) => {
                let mut ev = defs::POLLOUT;
                if self.vfs.readable_bytes(fd).unwrap_or(0) > 0 {
                    ev |= defs::POLLIN;
                }
                ev
            }
            Some(FdEntry::Socket(sock)) => {
                let handle = sock.lock().handle;
                let has = io.net_call(NetRequest {
                    op: ops::HAS_DATA,
                    fd: handle,
                    arg0: 0,
                    arg1: 0,
                    payload: Vec::new(),
                });
                let mut ev = defs::POLLOUT;
                if has.result > 0 {
                    ev |= defs::POLLIN;
                }
                ev
            }
            Some(FdEntry::Epoll(_)) => 0,
            None => defs::POLLERR,
        }
    }

    /// Second consecutive suspension at the same pc with a finite timeout
    /// reports expiry; the foreground wait in between bounds the delay.
    fn poll_suspend(&mut self, cpu: &mut CpuState, has_timeout: bool) -> Outcome {
        if !has_timeout {
            return Outcome::StdinWait;
        }
        let pc = cpu.pc - 4;
        if self.pending_poll == Some(pc) {
            self.pending_poll = None;
            self.ret(cpu, 0);
            return Outcome::Done;
        }
        self.pending_poll = Some(pc);
        Outcome::StdinWait
    }

    pub(crate) fn sys_ppoll(&mut self, cpu: &mut CpuState, arena: &mut Arena, io: &dyn HostIo) -> Outcome {
        let fds_ptr = cpu.get_x(10);
        let nfds = (cpu.get_x(11) as usize).min(64);
        let timeout_ptr = cpu.get_x(12);

        let mut ready = 0i64;
        for i in 0..nfds {
            let base = fds_ptr + i as u64 * 8;
            let Ok(fd) = arena.peek_u64(base).map(|v| v as u32 as i32) else {
                self.ret(cpu, -errno::EFAULT);
                return Outcome::Done;
            };
            let mut word = [0u8; 8];
            let _ = arena.peek(base, &mut word);
            let events = u16::from_le_bytes([word[4], word[5]]);
            let revents = self.poll_events(fd, io) & (events | defs::POLLERR | defs::POLLHUP);
            if revents != 0 {
                ready += 1;
            }
            word[6..8].copy_from_slice(&revents.to_le_bytes());
            let _ = arena.poke(base, &word);
        }
        if ready > 0 {
            self.pending_poll = None;
            self.ret(cpu, ready);
            return Outcome::Done;
        }

        // Zero timespec means pure poll.
        if timeout_ptr != 0 {
            let sec = arena.peek_u64(timeout_ptr).unwrap_or(0);
            let nsec = arena.peek_u64(timeout_ptr + 8).unwrap_or(0);
            if sec == 0 && nsec == 0 {
                self.ret(cpu, 0);
                return Outcome::Done;
            }
        }
        self.poll_suspend(cpu, timeout_ptr != 0)
    }

    pub(crate) fn sys_epoll_create1(&mut self, cpu: &mut CpuState) -> Outcome {
        let fd = self.vfs.fds.alloc_epoll_fd();
        self.vfs
            .fds
            .entries
            .insert(fd, FdEntry::Epoll(Arc::new(Mutex::new(EpollInstance::default()))));
        self.ret(cpu, fd as i64);
        Outcome::Done
    }

    fn epoll_of(&self, fd: i32) -> Result<Arc<Mutex<EpollInstance>>, i64> {
        match self.vfs.fds.entries.get(&fd) {
            Some(FdEntry::Epoll(e)) => Ok(e.clone()),
            Some(_) => Err(-errno::EINVAL),
            None => Err(-errno::EBADF),
        }
    }

    pub(crate) fn sys_epoll_ctl(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let epfd = cpu.get_x(10) as i32;
        let op = cpu.get_x(11);
        let fd = cpu.get_x(12) as i32;
        let event_ptr = cpu.get_x(13);

        let instance = match self.epoll_of(epfd) {
            Ok(i) => i,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        match op {
            defs::EPOLL_CTL_ADD | defs::EPOLL_CTL_MOD => {
                // riscv64 epoll_event: u32 events, 4 bytes padding, u64 data.
                let mut buf = [0u8; 16];
                if arena.peek(event_ptr, &mut buf).is_err() {
                    self.ret(cpu, -errno::EFAULT);
                    return Outcome::Done;
                }
                let events = u32::from_le_bytes(buf[0..4].try_into().unwrap());
                let data = u64::from_le_bytes(buf[8..16].try_into().unwrap());
                instance.lock().interests.insert(fd, (events, data));
                self.ret(cpu, 0);
            }
            defs::EPOLL_CTL_DEL => {
                instance.lock().interests.remove(&fd);
                self.ret(cpu, 0);
            }
            _ => self.ret(cpu, -errno::EINVAL),
        }
        Outcome::Done
    }

    pub(crate) fn sys_epoll_pwait(&mut self, cpu: &mut CpuState, arena: &mut Arena, io: &dyn HostIo) -> Outcome {
        let epfd = cpu.get_x(10) as i32;
        let events_ptr = cpu.get_x(11);
        let maxevents = (cpu.get_x(12) as usize).min(64);
        let timeout_ms = cpu.get_x(13) as i64 as i32;

        let instance = match self.epoll_of(epfd) {
            Ok(i) => i,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        let interests: Vec<(i32, (u32, u64))> = instance
            .lock()
            .interests
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();

        let mut out = Vec::new();
        for (fd, (events, data)) in interests {
            if out.len() >= maxevents {
                break;
            }
            let ready = self.poll_events(fd, io);
            let mut hit = 0u32;
            if events & defs::EPOLLIN != 0 && ready & defs::POLLIN != 0 {
                hit |= defs::EPOLLIN;
            }
            if events & defs::EPOLLOUT != 0 && ready & defs::POLLOUT != 0 {
                hit |= defs::EPOLLOUT;
            }
            if hit != 0 {
                let mut buf = [0u8; 16];
                buf[0..4].copy_from_slice(&hit.to_le_bytes());
                buf[8..16].copy_from_slice(&data.to_le_bytes());
                out.push(buf);
            }
        }
        if !out.is_empty() {
            for (i, ev) in out.iter().enumerate() {
                if arena.poke(events_ptr + i as u64 * 16, ev).is_err() {
                    self.ret(cpu, -errno::EFAULT);
                    return Outcome::Done;
                }
            }
            self.pending_poll = None;
            self.ret(cpu, out.len() as i64);
            return Outcome::Done;
        }
        if timeout_ms == 0 {
            self.ret(cpu, 0);
            return Outcome::Done;
        }
        self.poll_suspend(cpu, timeout_ms > 0)
    }
}
