//! Lock-free single-producer single-consumer byte ring for stdout.
//!
//! The worker writes, the foreground drains on a timer. Head and tail are
//! monotonically increasing 32-bit counters; only their difference is
//! meaningful, so wraparound is free. On overflow the *new* bytes are
//! dropped; already-queued output is never corrupted.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering::*};

pub const RING_SIZE: usize = 64 * 1024;

pub struct StdoutRing {
    buf: UnsafeCell<Box<[u8]>>,
    /// Producer cursor (bytes ever written).
    head: AtomicU32,
    /// Consumer cursor (bytes ever read).
    tail: AtomicU32,
}

// One writer (emulator thread), one reader (foreground). The cursors
// carry the acquire/release edges that order access to the byte slots.
unsafe impl Send for StdoutRing {}
unsafe impl Sync for StdoutRing {}

impl StdoutRing {
    pub fn new() -> StdoutRing {
        StdoutRing {
            buf: UnsafeCell::new(vec![0u8; RING_SIZE].into_boxed_slice()),
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }

    fn writable(&self) -> usize {
        let head = self.head.load(Relaxed);
        let tail = self.tail.load(Acquire);
        RING_SIZE - 1 - (head.wrapping_sub(tail) as usize % RING_SIZE)
    }

    /// Appends as much of `bytes` as fits; returns how many were taken.
    pub fn write(&self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(self.writable());
        let head = self.head.load(Relaxed);
        let buf = unsafe { &mut *self.buf.get() };
        for (i, &b) in bytes[..take].iter().enumerate() {
            buf[(head.wrapping_add(i as u32) as usize) % RING_SIZE] = b;
        }
        self.head.store(head.wrapping_add(take as u32), Release);
        take
    }

    /// Drains up to `out.len()` bytes; returns how many were produced.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let head = self.head.load(Acquire);
        let tail = self.tail.load(Relaxed);
        let avail = head.wrapping_sub(tail) as usize % RING_SIZE;
        let take = out.len().min(avail);
        let buf = unsafe { &*self.buf.get() };
        for (i, slot) in out[..take].iter_mut().enumerate() {
            *slot = buf[(tail.wrapping_add(i as u32) as usize) % RING_SIZE];
        }
        self.tail.store(tail.wrapping_add(take as u32), Release);
        take
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Acquire);
        let tail = self.tail.load(Acquire);
        head.wrapping_sub(tail) as usize % RING_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StdoutRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_come_out_in_order() {
        let ring = StdoutRing::new();
        assert_eq!(ring.write(b"hello "), 6);
        assert_eq!(ring.write(b"world"), 5);
        let mut out = [0u8; 16];
        let n = ring.read(&mut out);
        assert_eq!(&out[..n], b"hello world");
    }

    #[test]
    fn overflow_drops_new_bytes() {
        let ring = StdoutRing::new();
        let big = vec![0xabu8; RING_SIZE * 2];
        let taken = ring.write(&big);
        assert_eq!(taken, RING_SIZE - 1);
        assert_eq!(ring.write(b"x"), 0);
        let mut out = vec![0u8; RING_SIZE];
        assert_eq!(ring.read(&mut out), RING_SIZE - 1);
        // Space is free again.
        assert_eq!(ring.write(b"x"), 1);
    }

    #[test]
    fn wraps_across_the_boundary() {
        let ring = StdoutRing::new();
        let chunk = vec![1u8; RING_SIZE - 100];
        ring.write(&chunk);
        let mut sink = vec![0u8; RING_SIZE];
        ring.read(&mut sink);
        // Head/tail now near the end of the buffer; this write wraps.
        let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        assert_eq!(ring.write(&data), 200);
        let mut out = [0u8; 200];
        assert_eq!(ring.read(&mut out), 200);
        assert_eq!(out.to_vec(), data);
    }

    #[test]
    fn cross_thread_order_is_preserved() {
        use std::sync::Arc;
        let ring = Arc::new(StdoutRing::new());
        let writer = ring.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..50_000u32 {
                let b = [i as u8];
                while writer.write(&b) == 0 {
                    std::thread::yield_now();
                }
            }
        });
        let mut seen = 0u32;
        let mut buf = [0u8; 512];
        while seen < 50_000 {
            let n = ring.read(&mut buf);
            for &b in &buf[..n] {
                assert_eq!(b, seen as u8);
                seen += 1;
            }
            if n == 0 {
                std::thread::yield_now();
            }
        }
        handle.join().unwrap();
    }
}
