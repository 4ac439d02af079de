//! Memory-management syscalls over the flat arena.

use arena::state::CpuState;
use arena::{Arena, PageAttrs, PAGE_SIZE};
use utils::bits::{align_down, align_up};

use crate::defs::{self, errno};
use crate::{Kernel, Outcome};

fn prot_to_attrs(prot: u64) -> PageAttrs {
    let mut attrs = PageAttrs::empty();
    if prot & defs::PROT_READ != 0 {
        attrs |= PageAttrs::READ;
    }
    if prot & defs::PROT_WRITE != 0 {
        attrs |= PageAttrs::WRITE;
    }
    if prot & defs::PROT_EXEC != 0 {
        attrs |= PageAttrs::EXEC;
    }
    attrs
}

impl Kernel {
    pub(crate) fn sys_brk(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let addr = cpu.get_x(10);
        let old = arena.brk();
        let new = arena.set_brk(addr);
        if new > old {
            let lo = align_down(old, PAGE_SIZE);
            let hi = align_up(new, PAGE_SIZE);
            let _ = arena.set_page_attr(lo, hi - lo, PageAttrs::RW);
            let _ = arena.fill_zero(old, new - old);
        }
        self.ret(cpu, new as i64);
        Outcome::Done
    }

    pub(crate) fn sys_mmap(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let hint = cpu.get_x(10);
        let len = cpu.get_x(11);
        let prot = cpu.get_x(12);
        let flags = cpu.get_x(13);
        let fd = cpu.get_x(14) as i32;
        let offset = cpu.get_x(15);

        if len == 0 {
            self.ret(cpu, -errno::EINVAL);
            return Outcome::Done;
        }

        let addr = match arena.mmap_allocate(len, hint) {
            Ok(a) => a,
            Err(_) => {
                self.ret(cpu, -errno::ENOMEM);
                return Outcome::Done;
            }
        };
        let span = align_up(len, PAGE_SIZE);

        // Populate writable first, then apply the requested protection.
        if arena.set_page_attr(addr, span, PageAttrs::RW).is_err() {
            self.ret(cpu, -errno::ENOMEM);
            return Outcome::Done;
        }
        let _ = arena.fill_zero(addr, span);

        if flags & defs::MAP_ANONYMOUS == 0 && fd >= 0 {
            // File-backed: copy the byte range in.
            match self.vfs.pread_fd(fd, len as usize, offset) {
                Ok(data) => {
                    if arena.memcpy_in(addr, &data).is_err() {
                        self.ret(cpu, -errno::EFAULT);
                        return Outcome::Done;
                    }
                }
                Err(e) => {
                    self.ret(cpu, Self::vfs_errno(&e));
                    return Outcome::Done;
                }
            }
        }

        let _ = arena.set_page_attr(addr, span, prot_to_attrs(prot));
        tracing::trace!(addr, len, prot, flags, "mmap");
        self.ret(cpu, addr as i64);
        Outcome::Done
    }

    pub(crate) fn sys_munmap(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let addr = cpu.get_x(10);
        let len = cpu.get_x(11);
        if addr % PAGE_SIZE != 0 || len == 0 {
            self.ret(cpu, -errno::EINVAL);
            return Outcome::Done;
        }
        let span = align_up(len, PAGE_SIZE);
        // Bump addresses are never reused: logically a zero-fill plus
        // invalidation of anything compiled from those pages.
        if arena.fill_zero(addr, span).is_err() {
            self.ret(cpu, -errno::EINVAL);
            return Outcome::Done;
        }
        let _ = arena.set_page_attr(addr, span, PageAttrs::empty());
        self.ret(cpu, 0);
        Outcome::Done
    }

    pub(crate) fn sys_mprotect(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let addr = cpu.get_x(10);
        let len = cpu.get_x(11);
        let prot = cpu.get_x(12);
        // Below the anonymous-mmap region this is a no-op: fiddling with
        // code/data pages would churn decoded caches across fork/exec.
        if addr >= arena.mmap_base() {
            if arena
                .set_page_attr(addr, align_up(len.max(1), PAGE_SIZE), prot_to_attrs(prot))
                .is_err()
            {
                self.ret(cpu, -errno::ENOMEM);
                return Outcome::Done;
            }
        }
        self.ret(cpu, 0);
        Outcome::Done
    }

    pub(crate) fn sys_mremap(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let old_addr = cpu.get_x(10);
        let old_len = cpu.get_x(11);
        let new_len = cpu.get_x(12);
        if new_len <= old_len {
            self.ret(cpu, old_addr as i64);
            return Outcome::Done;
        }
        let new_addr = match arena.mmap_allocate(new_len, 0) {
            Ok(a) => a,
            Err(_) => {
                self.ret(cpu, -errno::ENOMEM);
                return Outcome::Done;
            }
        };
        let span = align_up(new_len, PAGE_SIZE);
        if arena.set_page_attr(new_addr, span, PageAttrs::RW).is_err() {
            self.ret(cpu, -errno::ENOMEM);
            return Outcome::Done;
        }
        let mut data = vec![0u8; old_len as usize];
        if arena.peek(old_addr, &mut data).is_err() || arena.poke(new_addr, &data).is_err() {
            self.ret(cpu, -errno::EFAULT);
            return Outcome::Done;
        }
        let _ = arena.fill_zero(old_addr, align_up(old_len, PAGE_SIZE));
        let _ = arena.set_page_attr(old_addr, align_up(old_len, PAGE_SIZE), PageAttrs::empty());
        self.ret(cpu, new_addr as i64);
        Outcome::Done
    }
}
