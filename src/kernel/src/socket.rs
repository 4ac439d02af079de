//! Socket syscalls, forwarded over the bridge's network RPC channel to
//! whatever adaptor the foreground installed.

use std::sync::Arc;

use arena::state::CpuState;
use arena::Arena;
use bridge::{ops, HostIo, NetRequest};
use utils::Mutex;

use crate::defs::{errno, nr};
use crate::{Kernel, Outcome};
use vfs::{FdEntry, SocketState};

impl Kernel {
    fn socket_of(&self, fd: i32) -> Result<Arc<Mutex<SocketState>>, i64> {
        match self.vfs.fds.entries.get(&fd) {
            Some(FdEntry::Socket(s)) => Ok(s.clone()),
            Some(_) => Err(-errno::ENOTSUP),
            None => Err(-errno::EBADF),
        }
    }

    pub(crate) fn sys_socket(&mut self, cpu: &mut CpuState, io: &dyn HostIo) -> Outcome {
        let domain = cpu.get_x(10) as i32;
        let sock_type = cpu.get_x(11) as i32;
        let reply = io.net_call(NetRequest {
            op: ops::CREATE,
            fd: 0,
            arg0: domain,
            arg1: sock_type,
            payload: Vec::new(),
        });
        if reply.result < 0 {
            self.ret(cpu, reply.result as i64);
            return Outcome::Done;
        }
        let fd = self.vfs.fds.alloc_fd();
        self.vfs.fds.entries.insert(
            fd,
            FdEntry::Socket(Arc::new(Mutex::new(SocketState {
                handle: reply.result,
                domain,
                sock_type,
                nonblock: sock_type & 0o4000 != 0,
            }))),
        );
        self.ret(cpu, fd as i64);
        Outcome::Done
    }

    pub(crate) fn sys_socketpair(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let out = cpu.get_x(13);
        let (a, b) = self.vfs.socketpair();
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&a.to_le_bytes());
        buf[4..8].copy_from_slice(&b.to_le_bytes());
        match arena.memcpy_in(out, &buf) {
            Ok(()) => self.ret(cpu, 0),
            Err(_) => self.ret(cpu, -errno::EFAULT),
        }
        Outcome::Done
    }

    /// bind/connect/listen/shutdown/setsockopt: fd plus a small payload,
    /// result forwarded verbatim.
    pub(crate) fn sys_socket_fwd(
        &mut self,
        sysno: u64,
        cpu: &mut CpuState,
        arena: &mut Arena,
        io: &dyn HostIo,
    ) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        let sock = match self.socket_of(fd) {
            Ok(s) => s,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        let handle = sock.lock().handle;

        let (op, arg0, arg1, payload) = match sysno {
            nr::BIND | nr::CONNECT => {
                let addr = cpu.get_x(11);
                let len = (cpu.get_x(12) as usize).min(128);
                let mut bytes = vec![0u8; len];
                if arena.memcpy_out(&mut bytes, addr).is_err() {
                    self.ret(cpu, -errno::EFAULT);
                    return Outcome::Done;
                }
                let op = if sysno == nr::BIND { ops::BIND } else { ops::CONNECT };
                (op, 0, 0, bytes)
            }
            nr::LISTEN => (ops::LISTEN, cpu.get_x(11) as i32, 0, Vec::new()),
            nr::SHUTDOWN => (ops::SHUTDOWN, cpu.get_x(11) as i32, 0, Vec::new()),
            nr::SETSOCKOPT => {
                let level = cpu.get_x(11) as i32;
                let optname = cpu.get_x(12) as i32;
                let optlen = (cpu.get_x(14) as usize).min(128);
                let mut bytes = vec![0u8; optlen];
                if arena.memcpy_out(&mut bytes, cpu.get_x(13)).is_err() {
                    self.ret(cpu, -errno::EFAULT);
                    return Outcome::Done;
                }
                (ops::SETSOCKOPT, level, optname, bytes)
            }
            _ => unreachable!("sys_socket_fwd called for {sysno}"),
        };

        let reply = io.net_call(NetRequest { op, fd: handle, arg0, arg1, payload });
        self.ret(cpu, reply.result as i64);
        Outcome::Done
    }

    pub(crate) fn sys_getsockopt(&mut self, cpu: &mut CpuState, arena: &mut Arena, io: &dyn HostIo) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        let sock = match self.socket_of(fd) {
            Ok(s) => s,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        let handle = sock.lock().handle;
        let level = cpu.get_x(11) as i32;
        let optname = cpu.get_x(12) as i32;
        let optval = cpu.get_x(13);
        let optlen_ptr = cpu.get_x(14);

        let reply = io.net_call(NetRequest {
            op: ops::GETSOCKOPT,
            fd: handle,
            arg0: level,
            arg1: optname,
            payload: Vec::new(),
        });
        if reply.result < 0 {
            self.ret(cpu, reply.result as i64);
            return Outcome::Done;
        }
        let data = if reply.payload.is_empty() {
            // SO_ERROR-style zero answer.
            0i32.to_le_bytes().to_vec()
        } else {
            reply.payload
        };
        if arena.memcpy_in(optval, &data).is_err()
            || arena.poke(optlen_ptr, &(data.len() as u32).to_le_bytes()).is_err()
        {
            self.ret(cpu, -errno::EFAULT);
            return Outcome::Done;
        }
        self.ret(cpu, 0);
        Outcome::Done
    }

    pub(crate) fn sys_accept(&mut self, cpu: &mut CpuState, io: &dyn HostIo) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        let sock = match self.socket_of(fd) {
            Ok(s) => s,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        let (handle, nonblock, domain, sock_type) = {
            let s = sock.lock();
            (s.handle, s.nonblock, s.domain, s.sock_type)
        };

        let pending = io.net_call(NetRequest {
            op: ops::HAS_PENDING_ACCEPT,
            fd: handle,
            arg0: 0,
            arg1: 0,
            payload: Vec::new(),
        });
        if pending.result <= 0 {
            if nonblock {
                self.ret(cpu, -errno::EAGAIN);
                return Outcome::Done;
            }
            return Outcome::StdinWait;
        }

        let reply = io.net_call(NetRequest {
            op: ops::ACCEPT,
            fd: handle,
            arg0: 0,
            arg1: 0,
            payload: Vec::new(),
        });
        if reply.result < 0 {
            self.ret(cpu, reply.result as i64);
            return Outcome::Done;
        }
        let new_fd = self.vfs.fds.alloc_fd();
        self.vfs.fds.entries.insert(
            new_fd,
            FdEntry::Socket(Arc::new(Mutex::new(SocketState {
                handle: reply.result,
                domain,
                sock_type,
                nonblock: false,
            }))),
        );
        self.ret(cpu, new_fd as i64);
        Outcome::Done
    }

    pub(crate) fn sys_send(&mut self, sysno: u64, cpu: &mut CpuState, arena: &mut Arena, io: &dyn HostIo) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        // Duplex socketpairs are local.
        if matches!(self.vfs.fds.entries.get(&fd), Some(FdEntry::Duplex { .. })) {
            return self.duplex_send(sysno, cpu, arena, fd);
        }
        let sock = match self.socket_of(fd) {
            Ok(s) => s,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        let handle = sock.lock().handle;

        let data = match self.gather_send_bytes(sysno, cpu, arena) {
            Ok(d) => d,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        let reply = io.net_call(NetRequest {
            op: ops::SEND,
            fd: handle,
            arg0: data.len() as i32,
            arg1: 0,
            payload: data,
        });
        self.ret(cpu, reply.result as i64);
        Outcome::Done
    }

    fn gather_send_bytes(&self, sysno: u64, cpu: &CpuState, arena: &Arena) -> Result<Vec<u8>, i64> {
        if sysno == nr::SENDTO {
            let buf = cpu.get_x(11);
            let len = (cpu.get_x(12) as usize).min(bridge::NET_PAYLOAD_MAX);
            let mut data = vec![0u8; len];
            arena.memcpy_out(&mut data, buf).map_err(|_| -errno::EFAULT)?;
            return Ok(data);
        }
        // sendmsg: walk msghdr.msg_iov.
        let msg = cpu.get_x(11);
        let iov = arena.peek_u64(msg + 16).map_err(|_| -errno::EFAULT)?;
        let iovlen = arena.peek_u64(msg + 24).map_err(|_| -errno::EFAULT)? as usize;
        let mut data = Vec::new();
        for i in 0..iovlen.min(16) {
            let base = arena.peek_u64(iov + i as u64 * 16).map_err(|_| -errno::EFAULT)?;
            let len = arena.peek_u64(iov + i as u64 * 16 + 8).map_err(|_| -errno::EFAULT)? as usize;
            let mut chunk = vec![0u8; len.min(bridge::NET_PAYLOAD_MAX - data.len())];
            arena.memcpy_out(&mut chunk, base).map_err(|_| -errno::EFAULT)?;
            data.extend_from_slice(&chunk);
            if data.len() >= bridge::NET_PAYLOAD_MAX {
                break;
            }
        }
        Ok(data)
    }

    pub(crate) fn sys_recv(&mut self, sysno: u64, cpu: &mut CpuState, arena: &mut Arena, io: &dyn HostIo) -> Outcome {
        let fd = cpu.get_x(10) as i32;
        if matches!(self.vfs.fds.entries.get(&fd), Some(FdEntry::Duplex { .. })) {
            return self.duplex_recv(sysno, cpu, arena, fd);
        }
        let sock = match self.socket_of(fd) {
            Ok(s) => s,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        let (handle, nonblock) = {
            let s = sock.lock();
            (s.handle, s.nonblock)
        };

        let (buf, len) = match self.recv_target(sysno, cpu, arena) {
            Ok(t) => t,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };

        let has = io.net_call(NetRequest {
            op: ops::HAS_DATA,
            fd: handle,
            arg0: 0,
            arg1: 0,
            payload: Vec::new(),
        });
        if has.result == 0 {
            if nonblock {
                self.ret(cpu, -errno::EAGAIN);
                return Outcome::Done;
            }
            // Blocking receive is a suspension point.
            return Outcome::StdinWait;
        }

        let reply = io.net_call(NetRequest {
            op: ops::RECV,
            fd: handle,
            arg0: len.min(bridge::NET_PAYLOAD_MAX) as i32,
            arg1: 0,
            payload: Vec::new(),
        });
        if reply.result < 0 {
            self.ret(cpu, reply.result as i64);
            return Outcome::Done;
        }
        if arena.memcpy_in(buf, &reply.payload).is_err() {
            self.ret(cpu, -errno::EFAULT);
            return Outcome::Done;
        }
        self.ret(cpu, reply.payload.len() as i64);
        Outcome::Done
    }

    fn recv_target(&self, sysno: u64, cpu: &CpuState, arena: &Arena) -> Result<(u64, usize), i64> {
        if sysno == nr::RECVFROM {
            return Ok((cpu.get_x(11), cpu.get_x(12) as usize));
        }
        let msg = cpu.get_x(11);
        let iov = arena.peek_u64(msg + 16).map_err(|_| -errno::EFAULT)?;
        let base = arena.peek_u64(iov).map_err(|_| -errno::EFAULT)?;
        let len = arena.peek_u64(iov + 8).map_err(|_| -errno::EFAULT)? as usize;
        Ok((base, len))
    }

    fn duplex_send(&mut self, sysno: u64, cpu: &mut CpuState, arena: &mut Arena, fd: i32) -> Outcome {
        let data = match self.gather_send_bytes(sysno, cpu, arena) {
            Ok(d) => d,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        let r = self.vfs.write_fd(fd, &data);
        self.ret_vfs(cpu, r, |n| n as i64);
        Outcome::Done
    }

    fn duplex_recv(&mut self, sysno: u64, cpu: &mut CpuState, arena: &mut Arena, fd: i32) -> Outcome {
        let (buf, len) = match self.recv_target(sysno, cpu, arena) {
            Ok(t) => t,
            Err(e) => {
                self.ret(cpu, e);
                return Outcome::Done;
            }
        };
        if self.vfs.readable_bytes(fd).unwrap_or(0) == 0 {
            // Let the peer thread run and retry.
            cpu.pc -= 4;
            if !self.threads.rotate(cpu) {
                cpu.pc += 4;
                self.ret(cpu, -errno::EAGAIN);
            }
            return Outcome::Done;
        }
        match self.vfs.read_fd(fd, len) {
            Ok(data) => match arena.memcpy_in(buf, &data) {
                Ok(()) => self.ret(cpu, data.len() as i64),
                Err(_) => self.ret(cpu, -errno::EFAULT),
            },
            Err(e) => self.ret(cpu, Self::vfs_errno(&e)),
        }
        Outcome::Done
    }

    pub(crate) fn sys_getsockname(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let addr = cpu.get_x(11);
        let len_ptr = cpu.get_x(12);
        // AF_INET any-address placeholder; the proxy owns real naming.
        let mut sa = [0u8; 16];
        sa[0] = libc::AF_INET as u8;
        if arena.memcpy_in(addr, &sa).is_err()
            || arena.poke(len_ptr, &16u32.to_le_bytes()).is_err()
        {
            self.ret(cpu, -errno::EFAULT);
            return Outcome::Done;
        }
        self.ret(cpu, 0);
        Outcome::Done
    }
}
