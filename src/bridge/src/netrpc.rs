//! Worker/foreground network RPC channel.
//!
//! The worker stores a request and blocks; the foreground polls, services
//! the call through the network adaptor, stores the response and wakes
//! the worker. The status word follows the shared-memory discipline:
//! 0 idle, 1 request posted, 2 response ready.

use std::sync::atomic::{AtomicU32, Ordering::*};
use std::sync::{Condvar, Mutex};

pub const NET_PAYLOAD_MAX: usize = 64 * 1024 - 64;

/// Operation codes on the wire; the foreground forwards them verbatim to
/// the external proxy adaptor.
pub mod ops {
    pub const CREATE: u32 = 1;
    pub const CONNECT: u32 = 2;
    pub const BIND: u32 = 3;
    pub const LISTEN: u32 = 4;
    pub const ACCEPT: u32 = 5;
    pub const SEND: u32 = 6;
    pub const RECV: u32 = 7;
    pub const CLOSE: u32 = 8;
    pub const HAS_DATA: u32 = 9;
    pub const HAS_PENDING_ACCEPT: u32 = 10;
    pub const SETSOCKOPT: u32 = 11;
    pub const GETSOCKOPT: u32 = 12;
    pub const SHUTDOWN: u32 = 13;
}

#[derive(Debug, Clone)]
pub struct NetRequest {
    pub op: u32,
    pub fd: i32,
    pub arg0: i32,
    pub arg1: i32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct NetReply {
    /// Signed result; negative values are Linux errno, negated.
    pub result: i32,
    pub payload: Vec<u8>,
}

/// The foreground's window to the outside world. The real proxy lives
/// out of scope; embedders plug their own adaptor in.
pub trait NetworkAdaptor: Send {
    fn call(&mut self, req: &NetRequest) -> NetReply;
}

/// Default adaptor: no network. Socket creation succeeds so guests get a
/// descriptor to fail politely on; everything that would touch the wire
/// is refused.
#[derive(Default)]
pub struct RefusingAdaptor {
    next_handle: i32,
}

impl NetworkAdaptor for RefusingAdaptor {
    fn call(&mut self, req: &NetRequest) -> NetReply {
        let result = match req.op {
            ops::CREATE => {
                self.next_handle += 1;
                self.next_handle
            }
            ops::CLOSE | ops::SETSOCKOPT | ops::SHUTDOWN => 0,
            ops::HAS_DATA | ops::HAS_PENDING_ACCEPT => 0,
            ops::CONNECT | ops::SEND | ops::RECV | ops::BIND | ops::LISTEN | ops::ACCEPT => {
                -libc::ECONNREFUSED
            }
            _ => -libc::ENOSYS,
        };
        NetReply { result, payload: Vec::new() }
    }
}

const IDLE: u32 = 0;
const REQUEST: u32 = 1;
const RESPONSE: u32 = 2;

#[derive(Default)]
struct Slot {
    request: Option<NetRequest>,
    reply: Option<NetReply>,
}

pub struct NetChannel {
    state: AtomicU32,
    slot: Mutex<Slot>,
    cv: Condvar,
}

impl NetChannel {
    pub fn new() -> NetChannel {
        NetChannel {
            state: AtomicU32::new(IDLE),
            slot: Mutex::new(Slot::default()),
            cv: Condvar::new(),
        }
    }

    /// Worker side: posts the request and blocks until the foreground has
    /// serviced it.
    pub fn call(&self, mut req: NetRequest) -> NetReply {
        req.payload.truncate(NET_PAYLOAD_MAX);
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.request = Some(req);
        self.state.store(REQUEST, Release);
        self.cv.notify_all();
        loop {
            if self.state.load(Acquire) == RESPONSE {
                if let Some(reply) = slot.reply.take() {
                    self.state.store(IDLE, Release);
                    return reply;
                }
            }
            slot = self
                .cv
                .wait(slot)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Foreground side: services one pending request, if any.
    pub fn service(&self, adaptor: &mut dyn NetworkAdaptor) -> bool {
        if self.state.load(Acquire) != REQUEST {
            return false;
        }
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        let Some(req) = slot.request.take() else {
            return false;
        };
        let mut reply = adaptor.call(&req);
        reply.payload.truncate(NET_PAYLOAD_MAX);
        tracing::trace!(op = req.op, fd = req.fd, result = reply.result, "net rpc");
        slot.reply = Some(reply);
        self.state.store(RESPONSE, Release);
        self.cv.notify_all();
        true
    }
}

impl Default for NetChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn request_reply_round_trip() {
        let chan = Arc::new(NetChannel::new());
        let server = chan.clone();
        let t = std::thread::spawn(move || {
            let mut adaptor = RefusingAdaptor::default();
            // Poll until one request has been serviced.
            loop {
                if server.service(&mut adaptor) {
                    break;
                }
                std::thread::yield_now();
            }
        });
        let reply = chan.call(NetRequest {
            op: ops::CREATE,
            fd: 0,
            arg0: libc::AF_INET,
            arg1: libc::SOCK_STREAM,
            payload: Vec::new(),
        });
        assert!(reply.result > 0);
        t.join().unwrap();
    }

    #[test]
    fn refusing_adaptor_maps_errnos() {
        let mut a = RefusingAdaptor::default();
        let connect = a.call(&NetRequest {
            op: ops::CONNECT,
            fd: 1,
            arg0: 0,
            arg1: 0,
            payload: vec![0; 16],
        });
        assert_eq!(connect.result, -libc::ECONNREFUSED);
        let weird = a.call(&NetRequest { op: 99, fd: 0, arg0: 0, arg1: 0, payload: Vec::new() });
        assert_eq!(weird.result, -libc::ENOSYS);
    }
}
