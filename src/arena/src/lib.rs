//! Flat guest address space with per-page attributes.
//!
//! The whole guest lives in one contiguous byte range so that address
//! translation is a bounds check in both the interpreter and generated
//! code. The backing is either an owned allocation (tests) or a raw view
//! over the JIT's linear memory (production); the raw form follows the
//! host-pointer guest RAM convention used across the VMM.

pub mod state;

use std::ptr::NonNull;

use bitflags::bitflags;
use utils::bits::{align_down, align_up};
use zerocopy::{AsBytes, FromBytes};

pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Default guest address space: 2 GiB. Guest pointers stay below
/// `i32::MAX`, which the generated code's return encoding relies on.
pub const DEFAULT_ARENA_SIZE: u64 = 2 << 30;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct PageAttrs: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl PageAttrs {
    pub const RW: PageAttrs = PageAttrs::READ.union(PageAttrs::WRITE);
    pub const RX: PageAttrs = PageAttrs::READ.union(PageAttrs::EXEC);
    pub const RWX: PageAttrs = PageAttrs::RW.union(PageAttrs::EXEC);
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("protection fault at {addr:#x}")]
    ProtectionFault { addr: u64 },
    #[error("guest address {addr:#x}+{len:#x} outside the arena")]
    OutOfArena { addr: u64, len: u64 },
    #[error("arena exhausted allocating {len:#x} bytes")]
    OutOfMemory { len: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;

enum Backing {
    Owned(Box<[u8]>),
    /// Borrowed view over memory owned elsewhere (the wasm linear memory).
    /// The owner must outlive the arena and must not move or shrink it.
    Raw { ptr: NonNull<u8>, len: usize },
}

/// The guest address space. Address zero is reserved; page zero holds the
/// CPU state window described in [`state`].
pub struct Arena {
    backing: Backing,
    attrs: Vec<PageAttrs>,
    mmap_base: u64,
    mmap_top: u64,
    brk_base: u64,
    brk_cur: u64,
    invalidations: Vec<(u64, u64)>,
}

// The raw backing is only ever touched from the emulator thread; the arena
// moves there once at startup.
unsafe impl Send for Arena {}

impl Arena {
    pub fn new_owned(size: u64) -> Arena {
        assert_eq!(size % PAGE_SIZE, 0, "arena size must be page granular");
        Arena {
            backing: Backing::Owned(vec![0u8; size as usize].into_boxed_slice()),
            attrs: vec![PageAttrs::empty(); (size / PAGE_SIZE) as usize],
            mmap_base: 0,
            mmap_top: 0,
            brk_base: 0,
            brk_cur: 0,
            invalidations: Vec::new(),
        }
    }

    /// Wraps memory owned by the JIT backend.
    ///
    /// # Safety
    /// `ptr..ptr+len` must stay valid and stationary for the arena's
    /// lifetime, and nothing else may mutate it concurrently.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Arena {
        assert_eq!(len as u64 % PAGE_SIZE, 0, "arena size must be page granular");
        Arena {
            backing: Backing::Raw { ptr, len },
            attrs: vec![PageAttrs::empty(); len / PAGE_SIZE as usize],
            mmap_base: 0,
            mmap_top: 0,
            brk_base: 0,
            brk_cur: 0,
            invalidations: Vec::new(),
        }
    }

    pub fn size(&self) -> u64 {
        match &self.backing {
            Backing::Owned(b) => b.len() as u64,
            Backing::Raw { len, .. } => *len as u64,
        }
    }

    fn bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Owned(b) => b,
            Backing::Raw { ptr, len } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), *len)
            },
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Owned(b) => b,
            Backing::Raw { ptr, len } => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr(), *len)
            },
        }
    }

    fn check_bounds(&self, addr: u64, len: u64) -> Result<()> {
        if addr.checked_add(len).map_or(true, |end| end > self.size()) {
            return Err(Error::OutOfArena { addr, len });
        }
        Ok(())
    }

    fn check_attrs(&self, addr: u64, len: u64, need: PageAttrs) -> Result<()> {
        self.check_bounds(addr, len)?;
        let first = addr >> PAGE_SHIFT;
        let last = (addr + len.max(1) - 1) >> PAGE_SHIFT;
        for page in first..=last {
            if !self.attrs[page as usize].contains(need) {
                return Err(Error::ProtectionFault {
                    addr: page << PAGE_SHIFT,
                });
            }
        }
        Ok(())
    }

    pub fn page_attrs(&self, addr: u64) -> PageAttrs {
        let page = (addr >> PAGE_SHIFT) as usize;
        self.attrs.get(page).copied().unwrap_or(PageAttrs::empty())
    }

    /// Applies attributes over a half-open byte range, page aligned.
    /// Removing exec (or granting write over pages that held exec) records
    /// an invalidation for the JIT to consume before the next guest
    /// instruction runs.
    pub fn set_page_attr(&mut self, addr: u64, len: u64, attrs: PageAttrs) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let start = align_down(addr, PAGE_SIZE);
        let end = align_up(addr + len, PAGE_SIZE);
        self.check_bounds(start, end - start)?;

        let mut invalidate = false;
        for page in (start >> PAGE_SHIFT)..(end >> PAGE_SHIFT) {
            let old = self.attrs[page as usize];
            if old.contains(PageAttrs::EXEC)
                && (!attrs.contains(PageAttrs::EXEC) || attrs.contains(PageAttrs::WRITE))
            {
                invalidate = true;
            }
            self.attrs[page as usize] = attrs;
        }
        if invalidate {
            self.invalidations.push((start, end - start));
        }
        Ok(())
    }

    /// Invalidation records produced by attribute changes since the last
    /// drain. The execution loop feeds these to the JIT manager.
    pub fn take_invalidations(&mut self) -> Vec<(u64, u64)> {
        std::mem::take(&mut self.invalidations)
    }

    // === Guest-visible accessors (attribute checked) === //

    pub fn read_obj<T: FromBytes>(&self, addr: u64) -> Result<T> {
        let len = std::mem::size_of::<T>() as u64;
        self.check_attrs(addr, len, PageAttrs::READ)?;
        let bytes = &self.bytes()[addr as usize..(addr + len) as usize];
        Ok(T::read_from(bytes).expect("size checked above"))
    }

    pub fn write_obj<T: AsBytes>(&mut self, addr: u64, value: T) -> Result<()> {
        let len = std::mem::size_of::<T>() as u64;
        self.check_attrs(addr, len, PageAttrs::WRITE)?;
        self.bytes_mut()[addr as usize..(addr + len) as usize].copy_from_slice(value.as_bytes());
        Ok(())
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8> {
        self.read_obj(addr)
    }

    pub fn read_u16(&self, addr: u64) -> Result<u16> {
        self.read_obj(addr)
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        self.read_obj(addr)
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        self.read_obj(addr)
    }

    pub fn memcpy_in(&mut self, dst: u64, src: &[u8]) -> Result<()> {
        self.check_attrs(dst, src.len() as u64, PageAttrs::WRITE)?;
        self.bytes_mut()[dst as usize..dst as usize + src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn memcpy_out(&self, dst: &mut [u8], src: u64) -> Result<()> {
        self.check_attrs(src, dst.len() as u64, PageAttrs::READ)?;
        dst.copy_from_slice(&self.bytes()[src as usize..src as usize + dst.len()]);
        Ok(())
    }

    /// Reads a NUL-terminated guest string, bounded at 4096 bytes.
    pub fn read_cstr(&self, addr: u64) -> Result<String> {
        let mut out = Vec::new();
        let mut p = addr;
        loop {
            let b = self.read_u8(p)?;
            if b == 0 || out.len() >= 4096 {
                break;
            }
            out.push(b);
            p += 1;
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Reads a NULL-terminated vector of guest string pointers (argv/envp).
    pub fn read_str_vec(&self, addr: u64) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut p = addr;
        loop {
            let ptr = self.read_u64(p)?;
            if ptr == 0 || out.len() >= 1024 {
                break;
            }
            out.push(self.read_cstr(ptr)?);
            p += 8;
        }
        Ok(out)
    }

    // === Host-side accessors (bounds checked only) === //
    //
    // Used by the loader before attributes exist, by fork snapshots, and by
    // the CPU state window on the reserved zero page.

    pub fn poke(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        self.check_bounds(addr, bytes.len() as u64)?;
        self.bytes_mut()[addr as usize..addr as usize + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn peek(&self, addr: u64, out: &mut [u8]) -> Result<()> {
        self.check_bounds(addr, out.len() as u64)?;
        out.copy_from_slice(&self.bytes()[addr as usize..addr as usize + out.len()]);
        Ok(())
    }

    pub fn peek_u64(&self, addr: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.peek(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn poke_u64(&mut self, addr: u64, value: u64) -> Result<()> {
        self.poke(addr, &value.to_le_bytes())
    }

    /// Zero-fills a range ignoring attributes; munmap is logically a
    /// zero-fill plus invalidation since bump addresses are never reused.
    pub fn fill_zero(&mut self, addr: u64, len: u64) -> Result<()> {
        self.check_bounds(addr, len)?;
        let had_exec = ((addr >> PAGE_SHIFT)..=((addr + len.max(1) - 1) >> PAGE_SHIFT))
            .any(|p| self.attrs[p as usize].contains(PageAttrs::EXEC));
        self.bytes_mut()[addr as usize..(addr + len) as usize].fill(0);
        if had_exec {
            self.invalidations.push((
                align_down(addr, PAGE_SIZE),
                align_up(addr + len, PAGE_SIZE) - align_down(addr, PAGE_SIZE),
            ));
        }
        Ok(())
    }

    // === Anonymous mmap bump allocator === //

    pub fn set_mmap_base(&mut self, base: u64) {
        let base = align_up(base, PAGE_SIZE);
        self.mmap_base = base;
        self.mmap_top = base;
    }

    pub fn mmap_top(&self) -> u64 {
        self.mmap_top
    }

    pub fn mmap_base(&self) -> u64 {
        self.mmap_base
    }

    /// Reserves `len` bytes. A zero hint takes the next bump address. An
    /// in-arena hint is honored as-is; a hint beyond the arena reports out
    /// of memory so guests retry through their fallback path.
    pub fn mmap_allocate(&mut self, len: u64, hint: u64) -> Result<u64> {
        let len = align_up(len.max(1), PAGE_SIZE);
        if hint != 0 {
            let hint = align_down(hint, PAGE_SIZE);
            if hint.checked_add(len).map_or(true, |end| end > self.size()) {
                return Err(Error::OutOfMemory { len });
            }
            // Keep the bump frontier past any honored fixed mapping so the
            // two can never overlap later.
            self.mmap_top = self.mmap_top.max(hint + len);
            return Ok(hint);
        }
        let addr = self.mmap_top;
        if addr.checked_add(len).map_or(true, |end| end > self.size()) {
            return Err(Error::OutOfMemory { len });
        }
        self.mmap_top = addr + len;
        Ok(addr)
    }

    // === brk === //

    pub fn set_brk_base(&mut self, base: u64) {
        let base = align_up(base, PAGE_SIZE);
        self.brk_base = base;
        self.brk_cur = base;
    }

    pub fn brk(&self) -> u64 {
        self.brk_cur
    }

    pub fn set_brk(&mut self, new_brk: u64) -> u64 {
        if new_brk >= self.brk_base && new_brk <= self.size() {
            self.brk_cur = new_brk;
        }
        self.brk_cur
    }

    pub fn brk_base(&self) -> u64 {
        self.brk_base
    }

    // === Fork snapshot support === //

    /// Copies a writable-range snapshot out. Attributes are raised to R/W
    /// first (exec preserved) so the copy itself can never fault; see
    /// DESIGN.md for the rationale.
    pub fn snapshot_range(&mut self, addr: u64, len: u64) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        self.check_bounds(addr, len)?;
        let start = align_down(addr, PAGE_SIZE);
        let end = align_up(addr + len, PAGE_SIZE);
        for page in (start >> PAGE_SHIFT)..(end >> PAGE_SHIFT) {
            let attrs = &mut self.attrs[page as usize];
            *attrs = attrs.union(PageAttrs::RW);
        }
        let mut out = vec![0u8; len as usize];
        self.peek(addr, &mut out)?;
        Ok(out)
    }

    /// Restores a snapshot, re-granting write+exec over the range first so
    /// decoded caches and page state can be rebuilt cleanly afterwards.
    pub fn restore_range(&mut self, addr: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.set_page_attr(addr, bytes.len() as u64, PageAttrs::RWX)?;
        self.poke(addr, bytes)
    }

    /// Drops all mappings ahead of an execve reload. Attribute state is
    /// cleared; the loader re-establishes segments, brk and the mmap
    /// frontier for the new image.
    pub fn reset_for_exec(&mut self) {
        for attrs in &mut self.attrs {
            *attrs = PageAttrs::empty();
        }
        self.mmap_base = 0;
        self.mmap_top = 0;
        self.brk_base = 0;
        self.brk_cur = 0;
        self.invalidations.push((0, self.size()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> Arena {
        Arena::new_owned(64 * PAGE_SIZE)
    }

    #[test]
    fn attrs_gate_reads_and_writes() {
        let mut a = arena();
        a.set_page_attr(PAGE_SIZE, PAGE_SIZE, PageAttrs::READ).unwrap();
        assert_eq!(a.read_u32(PAGE_SIZE).unwrap(), 0);
        assert!(matches!(
            a.write_obj(PAGE_SIZE, 7u32),
            Err(Error::ProtectionFault { .. })
        ));
        a.set_page_attr(PAGE_SIZE, PAGE_SIZE, PageAttrs::RW).unwrap();
        a.write_obj(PAGE_SIZE, 0xdead_beefu32).unwrap();
        assert_eq!(a.read_u32(PAGE_SIZE).unwrap(), 0xdead_beef);
    }

    #[test]
    fn out_of_arena_is_not_a_protection_fault() {
        let a = arena();
        assert!(matches!(
            a.read_u32(a.size()),
            Err(Error::OutOfArena { .. })
        ));
    }

    #[test]
    fn bump_allocator_is_monotonic() {
        let mut a = arena();
        a.set_mmap_base(8 * PAGE_SIZE);
        let first = a.mmap_allocate(100, 0).unwrap();
        let second = a.mmap_allocate(PAGE_SIZE, 0).unwrap();
        assert_eq!(first, 8 * PAGE_SIZE);
        assert_eq!(second, 9 * PAGE_SIZE);
        assert!(a.mmap_top() >= second + PAGE_SIZE);
    }

    #[test]
    fn oversized_hint_reports_oom() {
        let mut a = arena();
        a.set_mmap_base(PAGE_SIZE);
        assert!(matches!(
            a.mmap_allocate(PAGE_SIZE, a.size() + PAGE_SIZE),
            Err(Error::OutOfMemory { .. })
        ));
        // An in-arena hint is honored and the frontier moves past it.
        let hinted = a.mmap_allocate(PAGE_SIZE, 16 * PAGE_SIZE).unwrap();
        assert_eq!(hinted, 16 * PAGE_SIZE);
        assert!(a.mmap_top() >= 17 * PAGE_SIZE);
    }

    #[test]
    fn exec_removal_records_invalidation() {
        let mut a = arena();
        a.set_page_attr(4 * PAGE_SIZE, PAGE_SIZE, PageAttrs::RX).unwrap();
        assert!(a.take_invalidations().is_empty());
        a.set_page_attr(4 * PAGE_SIZE, PAGE_SIZE, PageAttrs::RW).unwrap();
        assert_eq!(a.take_invalidations(), vec![(4 * PAGE_SIZE, PAGE_SIZE)]);
        // Granting write while keeping exec also invalidates.
        a.set_page_attr(4 * PAGE_SIZE, PAGE_SIZE, PageAttrs::RX).unwrap();
        a.take_invalidations();
        a.set_page_attr(4 * PAGE_SIZE, PAGE_SIZE, PageAttrs::RWX).unwrap();
        assert_eq!(a.take_invalidations(), vec![(4 * PAGE_SIZE, PAGE_SIZE)]);
    }

    #[test]
    fn snapshot_restore_round_trips() {
        let mut a = arena();
        a.set_page_attr(2 * PAGE_SIZE, PAGE_SIZE, PageAttrs::RW).unwrap();
        a.memcpy_in(2 * PAGE_SIZE, b"before").unwrap();
        let snap = a.snapshot_range(2 * PAGE_SIZE, 6).unwrap();
        a.memcpy_in(2 * PAGE_SIZE, b"after!").unwrap();
        a.restore_range(2 * PAGE_SIZE, &snap).unwrap();
        let mut buf = [0u8; 6];
        a.memcpy_out(&mut buf, 2 * PAGE_SIZE).unwrap();
        assert_eq!(&buf, b"before");
    }

    #[test]
    fn cstr_reader_stops_at_nul() {
        let mut a = arena();
        a.set_page_attr(PAGE_SIZE, PAGE_SIZE, PageAttrs::RW).unwrap();
        a.memcpy_in(PAGE_SIZE, b"hello\0world").unwrap();
        assert_eq!(a.read_cstr(PAGE_SIZE).unwrap(), "hello");
    }
}
