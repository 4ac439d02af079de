//! Worker/foreground bridge.
//!
//! The emulator runs on its own thread; the foreground owns the terminal
//! and the network adaptor. They exchange three channels: a control
//! channel for stdin, window size and exit, a lock-free stdout ring, and
//! a blocking network RPC channel. Guest-side blocking maps onto parking
//! the worker thread; the guest-visible contract (rewind the pc, stop the
//! machine, retry the syscall on resume) is implemented by the syscall
//! layer on top of [`HostIo`].

mod netrpc;
mod ring;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering::*};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

pub use netrpc::{ops, NetChannel, NetReply, NetRequest, NetworkAdaptor, RefusingAdaptor, NET_PAYLOAD_MAX};
pub use ring::{StdoutRing, RING_SIZE};

pub const CONTROL_PAYLOAD_MAX: usize = 4096 - 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinResult {
    Data(Vec<u8>),
    /// Nothing buffered; the caller should suspend and retry.
    WouldBlock,
    Eof,
}

/// What the syscall layer needs from the host. The bridge provides the
/// threaded implementation; tests provide an in-process one.
pub trait HostIo {
    fn write_stdout(&self, bytes: &[u8]);
    /// Non-blocking read of buffered terminal input.
    fn read_stdin(&self, max: usize) -> StdinResult;
    fn stdin_ready(&self) -> bool;
    /// Parks the calling (worker) thread until new input, EOF or a resize
    /// arrives, or the timeout elapses.
    fn wait_for_input(&self, timeout: Option<Duration>);
    fn window_size(&self) -> (u16, u16);
    fn net_call(&self, req: NetRequest) -> NetReply;
    fn notify_exit(&self, code: i32);
}

struct StdinBuf {
    data: VecDeque<u8>,
    eof: bool,
    /// Bumped on every push/resize so waiters can detect activity.
    generation: u64,
}

struct Shared {
    ring: StdoutRing,
    stdin: Mutex<StdinBuf>,
    stdin_cv: Condvar,
    winsize: Mutex<(u16, u16)>,
    exit_code: Mutex<Option<i32>>,
    exit_flag: AtomicU32,
    net: NetChannel,
}

fn lock<'a, T>(m: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle held by the emulator thread.
#[derive(Clone)]
pub struct WorkerSide {
    shared: Arc<Shared>,
}

/// Handle held by the foreground (terminal + network owner).
#[derive(Clone)]
pub struct ForegroundSide {
    shared: Arc<Shared>,
}

/// Creates the paired endpoints.
pub fn channel() -> (WorkerSide, ForegroundSide) {
    let shared = Arc::new(Shared {
        ring: StdoutRing::new(),
        stdin: Mutex::new(StdinBuf {
            data: VecDeque::new(),
            eof: false,
            generation: 0,
        }),
        stdin_cv: Condvar::new(),
        winsize: Mutex::new((80, 24)),
        exit_code: Mutex::new(None),
        exit_flag: AtomicU32::new(0),
        net: NetChannel::new(),
    });
    (
        WorkerSide { shared: shared.clone() },
        ForegroundSide { shared },
    )
}

impl HostIo for WorkerSide {
    fn write_stdout(&self, bytes: &[u8]) {
        // Program order is preserved; overflow beyond the ring capacity
        // drops the newest bytes.
        let mut written = 0;
        while written < bytes.len() {
            let n = self.shared.ring.write(&bytes[written..]);
            if n == 0 {
                // Give the foreground a chance to drain before dropping.
                std::thread::yield_now();
                if self.shared.ring.write(&bytes[written..]) == 0 {
                    break;
                }
            }
            written += n;
        }
    }

    fn read_stdin(&self, max: usize) -> StdinResult {
        let mut buf = lock(&self.shared.stdin);
        if buf.data.is_empty() {
            return if buf.eof {
                StdinResult::Eof
            } else {
                StdinResult::WouldBlock
            };
        }
        let take = max.min(buf.data.len());
        StdinResult::Data(buf.data.drain(..take).collect())
    }

    fn stdin_ready(&self) -> bool {
        let buf = lock(&self.shared.stdin);
        !buf.data.is_empty() || buf.eof
    }

    fn wait_for_input(&self, timeout: Option<Duration>) {
        let buf = lock(&self.shared.stdin);
        if !buf.data.is_empty() || buf.eof {
            return;
        }
        let gen = buf.generation;
        match timeout {
            Some(t) => {
                drop(
                    self.shared
                        .stdin_cv
                        .wait_timeout_while(buf, t, |b| b.generation == gen && b.data.is_empty() && !b.eof)
                        .unwrap_or_else(|e| e.into_inner()),
                );
            }
            None => {
                drop(
                    self.shared
                        .stdin_cv
                        .wait_while(buf, |b| b.generation == gen && b.data.is_empty() && !b.eof)
                        .unwrap_or_else(|e| e.into_inner()),
                );
            }
        }
    }

    fn window_size(&self) -> (u16, u16) {
        *lock(&self.shared.winsize)
    }

    fn net_call(&self, req: NetRequest) -> NetReply {
        self.shared.net.call(req)
    }

    fn notify_exit(&self, code: i32) {
        *lock(&self.shared.exit_code) = Some(code);
        self.shared.exit_flag.store(1, Release);
        self.shared.stdin_cv.notify_all();
    }
}

impl ForegroundSide {
    /// Drains buffered guest stdout; called from a timer tick.
    pub fn drain_stdout(&self) -> Vec<u8> {
        let mut out = vec![0u8; RING_SIZE];
        let n = self.shared.ring.read(&mut out);
        out.truncate(n);
        out
    }

    pub fn push_stdin(&self, bytes: &[u8]) {
        let mut buf = lock(&self.shared.stdin);
        buf.data.extend(bytes);
        buf.generation += 1;
        drop(buf);
        self.shared.stdin_cv.notify_all();
    }

    pub fn close_stdin(&self) {
        let mut buf = lock(&self.shared.stdin);
        buf.eof = true;
        buf.generation += 1;
        drop(buf);
        self.shared.stdin_cv.notify_all();
    }

    pub fn set_window_size(&self, cols: u16, rows: u16) {
        *lock(&self.shared.winsize) = (cols, rows);
        let mut buf = lock(&self.shared.stdin);
        buf.generation += 1;
        drop(buf);
        self.shared.stdin_cv.notify_all();
    }

    /// Services one pending network RPC, if any.
    pub fn service_net(&self, adaptor: &mut dyn NetworkAdaptor) -> bool {
        self.shared.net.service(adaptor)
    }

    pub fn exited(&self) -> Option<i32> {
        if self.shared.exit_flag.load(Acquire) == 0 {
            return None;
        }
        *lock(&self.shared.exit_code)
    }
}

/// In-process host I/O for tests and embedding: stdin comes from a fixed
/// buffer, stdout accumulates, network calls go through a local adaptor.
pub struct LocalIo {
    stdin: Mutex<VecDeque<u8>>,
    stdout: Mutex<Vec<u8>>,
    adaptor: Mutex<Box<dyn NetworkAdaptor>>,
    exit: Mutex<Option<i32>>,
    pub winsize: (u16, u16),
}

impl LocalIo {
    pub fn new(stdin: &[u8]) -> LocalIo {
        LocalIo {
            stdin: Mutex::new(stdin.iter().copied().collect()),
            stdout: Mutex::new(Vec::new()),
            adaptor: Mutex::new(Box::new(RefusingAdaptor::default())),
            exit: Mutex::new(None),
            winsize: (80, 24),
        }
    }

    pub fn stdout(&self) -> Vec<u8> {
        lock(&self.stdout).clone()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *lock(&self.exit)
    }
}

impl HostIo for Arc<LocalIo> {
    fn write_stdout(&self, bytes: &[u8]) {
        (**self).write_stdout(bytes)
    }

    fn read_stdin(&self, max: usize) -> StdinResult {
        (**self).read_stdin(max)
    }

    fn stdin_ready(&self) -> bool {
        (**self).stdin_ready()
    }

    fn wait_for_input(&self, timeout: Option<Duration>) {
        (**self).wait_for_input(timeout)
    }

    fn window_size(&self) -> (u16, u16) {
        (**self).window_size()
    }

    fn net_call(&self, req: NetRequest) -> NetReply {
        (**self).net_call(req)
    }

    fn notify_exit(&self, code: i32) {
        (**self).notify_exit(code)
    }
}

impl HostIo for LocalIo {
    fn write_stdout(&self, bytes: &[u8]) {
        lock(&self.stdout).extend_from_slice(bytes);
    }

    fn read_stdin(&self, max: usize) -> StdinResult {
        let mut b = lock(&self.stdin);
        if b.is_empty() {
            return StdinResult::Eof;
        }
        let take = max.min(b.len());
        StdinResult::Data(b.drain(..take).collect())
    }

    fn stdin_ready(&self) -> bool {
        true
    }

    fn wait_for_input(&self, _timeout: Option<Duration>) {}

    fn window_size(&self) -> (u16, u16) {
        self.winsize
    }

    fn net_call(&self, req: NetRequest) -> NetReply {
        lock(&self.adaptor).call(&req)
    }

    fn notify_exit(&self, code: i32) {
        *lock(&self.exit) = Some(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdout_flows_worker_to_foreground() {
        let (worker, fg) = channel();
        worker.write_stdout(b"boot ok\n");
        assert_eq!(fg.drain_stdout(), b"boot ok\n");
        assert!(fg.drain_stdout().is_empty());
    }

    #[test]
    fn stdin_blocks_until_pushed() {
        let (worker, fg) = channel();
        assert_eq!(worker.read_stdin(16), StdinResult::WouldBlock);

        let w = worker.clone();
        let t = std::thread::spawn(move || {
            w.wait_for_input(None);
            w.read_stdin(16)
        });
        std::thread::sleep(Duration::from_millis(20));
        fg.push_stdin(b"ls\n");
        assert_eq!(t.join().unwrap(), StdinResult::Data(b"ls\n".to_vec()));
    }

    #[test]
    fn eof_after_close() {
        let (worker, fg) = channel();
        fg.push_stdin(b"x");
        fg.close_stdin();
        assert_eq!(worker.read_stdin(8), StdinResult::Data(b"x".to_vec()));
        assert_eq!(worker.read_stdin(8), StdinResult::Eof);
    }

    #[test]
    fn wait_with_timeout_returns() {
        let (worker, _fg) = channel();
        let start = std::time::Instant::now();
        worker.wait_for_input(Some(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn exit_propagates() {
        let (worker, fg) = channel();
        assert!(fg.exited().is_none());
        worker.notify_exit(42);
        assert_eq!(fg.exited(), Some(42));
    }

    #[test]
    fn resize_reaches_the_worker() {
        let (worker, fg) = channel();
        fg.set_window_size(132, 50);
        assert_eq!(worker.window_size(), (132, 50));
    }
}
