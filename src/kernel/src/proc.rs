//! Processes and threads: the cooperative scheduler, fork snapshots,
//! futex, clone, exit and wait4.

use std::collections::VecDeque;

use arena::state::CpuState;
use arena::{Arena, PAGE_SIZE};
use utils::bits::align_down;

use crate::defs::{self, errno};
use crate::{Kernel, Outcome};

pub const MAX_THREADS: usize = 64;

/// Writable-memory spans restored when a forked child exits.
#[derive(Debug)]
pub struct ForkSnapshot {
    pub saved_cpu: CpuState,
    pub child_pid: i32,
    pub ranges: Vec<(u64, Vec<u8>)>,
    pub fds: Vec<i32>,
}

/// Address-space landmarks the fork snapshot needs; filled in by the
/// loader glue after each (re)load.
#[derive(Debug, Default, Clone)]
pub struct ProcLayout {
    pub data_range: Option<(u64, u64)>,
    pub interp_data: Option<(u64, u64)>,
    pub stack_high: u64,
}

#[derive(Debug)]
pub struct ThreadSlot {
    pub tid: i32,
    pub cpu: CpuState,
    pub waiting: bool,
    pub futex_addr: u64,
    pub clear_child_tid: u64,
}

/// Fixed-capacity cooperative scheduler: one runnable thread at a time,
/// switches at syscall boundaries only.
pub struct ThreadSet {
    slots: Vec<ThreadSlot>,
    current: usize,
    next_tid: i32,
    budget: u32,
    quantum: u32,
}

impl ThreadSet {
    pub fn new(quantum: u32) -> ThreadSet {
        ThreadSet {
            slots: vec![ThreadSlot {
                tid: 1,
                cpu: CpuState::default(),
                waiting: false,
                futex_addr: 0,
                clear_child_tid: 0,
            }],
            current: 0,
            next_tid: 2,
            budget: quantum,
            quantum,
        }
    }

    pub fn current_tid(&self) -> i32 {
        self.slots[self.current].tid
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn current_slot_mut(&mut self) -> &mut ThreadSlot {
        &mut self.slots[self.current]
    }

    fn next_runnable(&self, from: usize) -> Option<usize> {
        let n = self.slots.len();
        (1..=n).map(|d| (from + d) % n).find(|&i| !self.slots[i].waiting)
    }

    fn switch_to(&mut self, idx: usize, cpu: &mut CpuState) {
        if idx == self.current {
            self.budget = self.quantum;
            return;
        }
        self.slots[self.current].cpu = cpu.clone();
        self.current = idx;
        *cpu = self.slots[idx].cpu.clone();
        self.budget = self.quantum;
    }

    /// Round-robin rotation to the next runnable slot, if any.
    pub fn rotate(&mut self, cpu: &mut CpuState) -> bool {
        match self.next_runnable(self.current) {
            Some(idx) if idx != self.current => {
                self.switch_to(idx, cpu);
                true
            }
            _ => {
                self.budget = self.quantum;
                false
            }
        }
    }

    /// Counts one syscall against the quantum; switches when exhausted.
    pub fn on_syscall(&mut self, cpu: &mut CpuState) {
        self.budget = self.budget.saturating_sub(1);
        if self.budget == 0 {
            self.rotate(cpu);
        }
    }

    /// Creates a new thread running `cpu`'s state; the caller has already
    /// set the child's registers. Returns the new tid, or None when the
    /// table is full.
    pub fn spawn(&mut self, child_cpu: CpuState, clear_child_tid: u64) -> Option<i32> {
        if self.slots.len() >= MAX_THREADS {
            return None;
        }
        let tid = self.next_tid;
        self.next_tid += 1;
        self.slots.push(ThreadSlot {
            tid,
            cpu: child_cpu,
            waiting: false,
            futex_addr: 0,
            clear_child_tid,
        });
        Some(tid)
    }

    pub fn switch_to_tid(&mut self, tid: i32, cpu: &mut CpuState) {
        if let Some(idx) = self.slots.iter().position(|s| s.tid == tid) {
            self.switch_to(idx, cpu);
        }
    }

    /// Blocks the current thread on `addr` and hands the cpu to another.
    /// When every other thread is also blocked the deadlock is broken by
    /// force-waking one sleeper so it can observe any shutdown writes.
    pub fn block_current_on_futex(&mut self, addr: u64, cpu: &mut CpuState) {
        self.slots[self.current].waiting = true;
        self.slots[self.current].futex_addr = addr;
        if let Some(idx) = self.next_runnable(self.current) {
            self.switch_to(idx, cpu);
            return;
        }
        // Everyone is parked: force-wake the next sleeper in order.
        let idx = (self.current + 1) % self.slots.len();
        self.slots[idx].waiting = false;
        tracing::debug!(tid = self.slots[idx].tid, "futex deadlock break");
        self.switch_to(idx, cpu);
    }

    /// Wakes up to `n` threads waiting on `addr`; returns the count.
    pub fn wake_futex(&mut self, addr: u64, n: usize) -> usize {
        let mut woken = 0;
        for slot in &mut self.slots {
            if woken >= n {
                break;
            }
            if slot.waiting && slot.futex_addr == addr {
                slot.waiting = false;
                woken += 1;
            }
        }
        woken
    }

    /// Removes the current thread. Returns false when it was the last
    /// runnable context and the process should exit instead.
    pub fn exit_current(&mut self, cpu: &mut CpuState) -> bool {
        if self.slots.len() <= 1 {
            return false;
        }
        let leaving_main = self.current == 0;
        self.slots.remove(self.current);
        if leaving_main {
            // Main thread gone: Linux keeps the process while others run.
            self.current = 0;
        } else if self.current >= self.slots.len() {
            self.current = 0;
        }
        let idx = if self.slots[self.current].waiting {
            match self.next_runnable(self.current) {
                Some(i) => i,
                None => {
                    // All remaining threads blocked; break the deadlock.
                    self.slots[self.current].waiting = false;
                    self.current
                }
            }
        } else {
            self.current
        };
        self.budget = self.quantum;
        *cpu = self.slots[idx].cpu.clone();
        self.current = idx;
        true
    }
}

impl Kernel {
    /// clone(2). Thread clones get a slot; anything else is the
    /// cooperative vfork-style fork with memory snapshots.
    pub(crate) fn sys_clone(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let flags = cpu.get_x(10);
        let child_stack = cpu.get_x(11);
        let ptid = cpu.get_x(12);
        let tls = cpu.get_x(13);
        let ctid = cpu.get_x(14);

        if flags & defs::CLONE_THREAD != 0 {
            let mut child = cpu.clone();
            child.set_x(10, 0);
            if child_stack != 0 {
                child.set_x(2, child_stack);
            }
            if flags & defs::CLONE_SETTLS != 0 {
                child.set_x(4, tls);
            }
            let clear = if flags & defs::CLONE_CHILD_CLEARTID != 0 { ctid } else { 0 };
            let Some(tid) = self.threads.spawn(child, clear) else {
                self.ret(cpu, -errno::EAGAIN);
                return Outcome::Done;
            };
            if flags & defs::CLONE_PARENT_SETTID != 0 && ptid != 0 {
                let _ = arena.poke(ptid, &(tid as u32).to_le_bytes());
            }
            if flags & defs::CLONE_CHILD_SETTID != 0 && ctid != 0 {
                let _ = arena.poke(ctid, &(tid as u32).to_le_bytes());
            }
            // Parent will see the tid when it is scheduled again; the
            // child runs first.
            self.ret(cpu, tid as i64);
            self.threads.switch_to_tid(tid, cpu);
            tracing::debug!(tid, "thread spawned");
            return Outcome::Done;
        }

        // Fork. One cooperative child at a time.
        if self.fork.is_some() {
            self.ret(cpu, -errno::EAGAIN);
            return Outcome::Done;
        }
        let child_pid = self.next_pid;
        self.next_pid += 1;

        let mut saved_cpu = cpu.clone();
        saved_cpu.set_x(10, child_pid as u64);

        let mut ranges: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut snap = |arena: &mut Arena, lo: u64, hi: u64, ranges: &mut Vec<(u64, Vec<u8>)>| {
            if hi > lo {
                if let Ok(bytes) = arena.snapshot_range(lo, hi - lo) {
                    ranges.push((lo, bytes));
                }
            }
        };

        if let Some((lo, hi)) = self.layout.data_range {
            snap(arena, lo, hi.max(arena.brk()), &mut ranges);
        }
        if let Some((lo, hi)) = self.layout.interp_data {
            snap(arena, lo, hi, &mut ranges);
        }
        let sp = cpu.get_x(2);
        if sp != 0 && self.layout.stack_high >= sp {
            let lo = align_down(sp, PAGE_SIZE)
                .saturating_sub(2 * PAGE_SIZE)
                .max(self.layout.stack_high.saturating_sub(4 * 1024 * 1024));
            snap(arena, lo, self.layout.stack_high, &mut ranges);
        }
        if arena.mmap_top() > arena.mmap_base() {
            snap(arena, arena.mmap_base(), arena.mmap_top(), &mut ranges);
        }

        self.fork = Some(ForkSnapshot {
            saved_cpu,
            child_pid,
            ranges,
            fds: self.vfs.fds.snapshot_fds(),
        });
        tracing::debug!(child_pid, "fork: entering child");
        self.ret(cpu, 0);
        Outcome::Done
    }

    /// exit / exit_group. A forked child unwinds to its parent; a
    /// secondary thread leaves its slot; otherwise the emulator stops.
    pub(crate) fn sys_exit(&mut self, cpu: &mut CpuState, arena: &mut Arena, group: bool) -> Outcome {
        let status = cpu.get_x(10) as i32 & 0xff;

        // Thread exit (not whole-group) with siblings alive.
        if !group && self.threads.len() > 1 {
            let clear = self.threads.current_slot_mut().clear_child_tid;
            if clear != 0 {
                let _ = arena.poke(clear, &0u32.to_le_bytes());
                self.threads.wake_futex(clear, 1);
            }
            if self.threads.exit_current(cpu) {
                return Outcome::Done;
            }
        }

        if let Some(snapshot) = self.fork.take() {
            // Child is done: put the parent's world back.
            for (addr, bytes) in &snapshot.ranges {
                let _ = arena.restore_range(*addr, bytes);
            }
            let snapshot_fds = &snapshot.fds;
            let added: Vec<i32> = self
                .vfs
                .fds
                .snapshot_fds()
                .into_iter()
                .filter(|fd| !snapshot_fds.contains(fd))
                .collect();
            for fd in added {
                let _ = self.vfs.close(fd);
            }
            *cpu = snapshot.saved_cpu.clone();
            self.exited_children.push_back((snapshot.child_pid, status));
            tracing::debug!(pid = snapshot.child_pid, status, "fork child exited; parent resumed");
            return Outcome::Done;
        }

        Outcome::Exit(status)
    }

    pub(crate) fn sys_wait4(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let pid = cpu.get_x(10) as i64;
        let wstatus = cpu.get_x(11);
        let options = cpu.get_x(12);
        const WNOHANG: u64 = 1;

        let pos = self
            .exited_children
            .iter()
            .position(|(p, _)| pid == -1 || *p as i64 == pid);
        match pos {
            Some(idx) => {
                let (child, code) = self.exited_children.remove(idx).unwrap();
                if wstatus != 0 {
                    let encoded = ((code & 0xff) as u32) << 8;
                    let _ = arena.poke(wstatus, &encoded.to_le_bytes());
                }
                self.ret(cpu, child as i64);
            }
            None if options & WNOHANG != 0 => self.ret(cpu, 0),
            None => self.ret(cpu, -errno::ECHILD),
        }
        Outcome::Done
    }

    pub(crate) fn sys_futex(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let addr = cpu.get_x(10);
        let op = cpu.get_x(11) & defs::FUTEX_CMD_MASK;
        let val = cpu.get_x(12) as u32;

        match op {
            defs::FUTEX_WAIT => {
                let mut word = [0u8; 4];
                if arena.peek(addr, &mut word).is_err() {
                    self.ret(cpu, -errno::EFAULT);
                    return Outcome::Done;
                }
                let current = u32::from_le_bytes(word);
                if current != val {
                    self.ret(cpu, -errno::EAGAIN);
                    return Outcome::Done;
                }
                // Block with a zero return staged for when we wake.
                self.ret(cpu, 0);
                self.threads.block_current_on_futex(addr, cpu);
                Outcome::Done
            }
            defs::FUTEX_WAKE => {
                let woken = self.threads.wake_futex(addr, val as usize);
                self.ret(cpu, woken as i64);
                self.threads.rotate(cpu);
                Outcome::Done
            }
            _ => {
                self.ret(cpu, -errno::ENOSYS);
                Outcome::Done
            }
        }
    }

    pub(crate) fn sys_sched_yield(&mut self, cpu: &mut CpuState) -> Outcome {
        self.ret(cpu, 0);
        self.threads.rotate(cpu);
        Outcome::Done
    }
}

pub(crate) type ExitedChildren = VecDeque<(i32, i32)>;
