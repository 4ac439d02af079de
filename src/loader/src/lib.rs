//! ELF loading and process startup: PT_LOAD placement, PIE bases,
//! dynamic-linker discovery, and the initial stack with its aux vector.

use arena::{Arena, PageAttrs, PAGE_SIZE};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_INTERP, PT_LOAD, PT_PHDR};
use goblin::elf::Elf;
use utils::bits::{align_down, align_up};

/// PIE base for the main image. Low enough that a whole container's code
/// stays well under the 1 GiB line the JIT return encoding reserves.
pub const MAIN_BASE: u64 = 0x40000;
/// The dynamic linker loads at a fixed higher base, clear of any main
/// image.
pub const INTERP_BASE: u64 = 0x2000_0000;

pub const DEFAULT_STACK_SIZE: u64 = 8 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid ELF image: {0}")]
    BadElf(String),
    #[error("image does not fit the arena")]
    NoSpace,
    #[error("arena: {0}")]
    Arena(#[from] arena::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One loaded ELF object.
#[derive(Debug, Clone)]
pub struct Image {
    pub base: u64,
    pub entry: u64,
    pub phdr_addr: u64,
    pub phent: u64,
    pub phnum: u64,
    pub start: u64,
    pub end: u64,
    /// Writable segment span (data + bss), for fork snapshots.
    pub writable: Option<(u64, u64)>,
    pub interp: Option<String>,
}

/// Returns the PT_INTERP path without loading anything.
pub fn interp_path(bytes: &[u8]) -> Result<Option<String>> {
    let elf = Elf::parse(bytes).map_err(|e| Error::BadElf(e.to_string()))?;
    Ok(elf.interpreter.map(str::to_string))
}

/// Loads PT_LOAD segments at `pie_base` (ignored for ET_EXEC images),
/// zeroes bss, and applies initial page attributes per segment.
pub fn load_image(arena: &mut Arena, bytes: &[u8], pie_base: u64) -> Result<Image> {
    let elf = Elf::parse(bytes).map_err(|e| Error::BadElf(e.to_string()))?;
    if elf.header.e_machine != goblin::elf::header::EM_RISCV {
        return Err(Error::BadElf(format!(
            "wrong machine {:#x}, expected riscv",
            elf.header.e_machine
        )));
    }
    let base = match elf.header.e_type {
        goblin::elf::header::ET_EXEC => 0,
        goblin::elf::header::ET_DYN => pie_base,
        other => return Err(Error::BadElf(format!("unsupported e_type {other}"))),
    };

    let mut start = u64::MAX;
    let mut end = 0u64;
    let mut writable: Option<(u64, u64)> = None;
    let mut phdr_addr = None;

    for ph in &elf.program_headers {
        if ph.p_type == PT_PHDR {
            phdr_addr = Some(base + ph.p_vaddr);
        }
        if ph.p_type != PT_LOAD {
            continue;
        }
        let dest = base + ph.p_vaddr;
        let filesz = ph.p_filesz as usize;
        let memsz = ph.p_memsz;
        if dest + memsz > arena.size() {
            return Err(Error::NoSpace);
        }
        let file_range = ph.p_offset as usize..ph.p_offset as usize + filesz;
        let data = bytes.get(file_range).ok_or_else(|| {
            Error::BadElf(format!("segment at {:#x} extends past the file", ph.p_offset))
        })?;
        arena.poke(dest, data)?;
        if memsz > filesz as u64 {
            arena.fill_zero(dest + filesz as u64, memsz - filesz as u64)?;
        }

        let mut attrs = PageAttrs::empty();
        if ph.p_flags & PF_R != 0 {
            attrs |= PageAttrs::READ;
        }
        if ph.p_flags & PF_W != 0 {
            attrs |= PageAttrs::WRITE;
        }
        if ph.p_flags & PF_X != 0 {
            attrs |= PageAttrs::EXEC;
        }
        arena.set_page_attr(dest, memsz.max(1), attrs)?;

        start = start.min(align_down(dest, PAGE_SIZE));
        end = end.max(align_up(dest + memsz, PAGE_SIZE));
        if ph.p_flags & PF_W != 0 {
            let seg = (align_down(dest, PAGE_SIZE), align_up(dest + memsz, PAGE_SIZE));
            writable = Some(match writable {
                None => seg,
                Some((s, e)) => (s.min(seg.0), e.max(seg.1)),
            });
        }
    }
    if start == u64::MAX {
        return Err(Error::BadElf("no loadable segments".to_string()));
    }

    // Fall back to the usual "phdrs live inside the first segment" layout
    // when there is no explicit PT_PHDR.
    let phdr_addr = phdr_addr.unwrap_or(base + elf.header.e_phoff);

    tracing::debug!(
        base,
        entry = base + elf.header.e_entry,
        start,
        end,
        "loaded elf image"
    );
    Ok(Image {
        base,
        entry: base + elf.header.e_entry,
        phdr_addr,
        phent: elf.header.e_phentsize as u64,
        phnum: elf.header.e_phnum as u64,
        start,
        end,
        writable,
        interp: elf.interpreter.map(str::to_string),
    })
}

/// Post-load address-space layout: brk sits right above the image, the
/// anonymous-mmap frontier well above that.
pub fn configure_memory_layout(arena: &mut Arena, image_end: u64) {
    let brk_base = align_up(image_end, PAGE_SIZE);
    arena.set_brk_base(brk_base);
    let gap = (arena.size() / 8).max(4 * PAGE_SIZE);
    arena.set_mmap_base(brk_base + gap);
}

// Aux vector tags (linux/auxvec.h).
const AT_NULL: u64 = 0;
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_PAGESZ: u64 = 6;
const AT_BASE: u64 = 7;
const AT_FLAGS: u64 = 8;
const AT_ENTRY: u64 = 9;
const AT_UID: u64 = 11;
const AT_EUID: u64 = 12;
const AT_GID: u64 = 13;
const AT_EGID: u64 = 14;
const AT_PLATFORM: u64 = 15;
const AT_HWCAP: u64 = 16;
const AT_CLKTCK: u64 = 17;
const AT_SECURE: u64 = 23;
const AT_RANDOM: u64 = 25;
const AT_EXECFN: u64 = 31;

pub struct StackLayout {
    pub sp: u64,
    pub stack_low: u64,
    pub stack_high: u64,
}

/// Builds the initial stack leaves-first: argument and environment
/// strings, 16 random bytes, then (growing downward) the aux vector, envp
/// pointers, argv pointers and argc, with the final sp 16-byte aligned.
pub fn setup_stack(
    arena: &mut Arena,
    main: &Image,
    interp: Option<&Image>,
    exe_path: &str,
    argv: &[String],
    envp: &[String],
) -> Result<StackLayout> {
    let stack_high = align_down(arena.size() - PAGE_SIZE, 16);
    let stack_size = DEFAULT_STACK_SIZE.min(arena.size() / 4).max(16 * PAGE_SIZE);
    let stack_low = align_down(stack_high - stack_size, PAGE_SIZE);
    arena.set_page_attr(stack_low, stack_high - stack_low + PAGE_SIZE, PageAttrs::RW)?;

    let mut sp = stack_high;
    let mut push_str = |arena: &mut Arena, s: &str, sp: &mut u64| -> Result<u64> {
        let bytes = s.as_bytes();
        *sp -= bytes.len() as u64 + 1;
        arena.poke(*sp, bytes)?;
        arena.poke(*sp + bytes.len() as u64, &[0])?;
        Ok(*sp)
    };

    let execfn_ptr = push_str(arena, exe_path, &mut sp)?;
    let platform_ptr = push_str(arena, "riscv64", &mut sp)?;
    let mut argv_ptrs = Vec::with_capacity(argv.len());
    for arg in argv {
        argv_ptrs.push(push_str(arena, arg, &mut sp)?);
    }
    let mut envp_ptrs = Vec::with_capacity(envp.len());
    for env in envp {
        envp_ptrs.push(push_str(arena, env, &mut sp)?);
    }

    sp -= 16;
    let random_ptr = sp;
    arena.poke(random_ptr, &rand::random::<[u8; 16]>())?;
    sp = align_down(sp, 16);

    let auxv: Vec<(u64, u64)> = vec![
        (AT_PHDR, main.phdr_addr),
        (AT_PHENT, main.phent),
        (AT_PHNUM, main.phnum),
        (AT_PAGESZ, PAGE_SIZE),
        (AT_BASE, interp.map(|i| i.base).unwrap_or(0)),
        (AT_FLAGS, 0),
        (AT_ENTRY, main.entry),
        (AT_UID, 0),
        (AT_EUID, 0),
        (AT_GID, 0),
        (AT_EGID, 0),
        (AT_SECURE, 0),
        (AT_CLKTCK, 100),
        (AT_HWCAP, 0x112d), // imafdc
        (AT_PLATFORM, platform_ptr),
        (AT_RANDOM, random_ptr),
        (AT_EXECFN, execfn_ptr),
        (AT_NULL, 0),
    ];

    // argc + argv + NULL + envp + NULL + auxv, laid out upward from sp.
    let words = 1 + argv_ptrs.len() + 1 + envp_ptrs.len() + 1 + auxv.len() * 2;
    sp -= (words as u64) * 8;
    sp = align_down(sp, 16);

    let mut at = sp;
    let mut put = |arena: &mut Arena, at: &mut u64, v: u64| -> Result<()> {
        arena.poke_u64(*at, v)?;
        *at += 8;
        Ok(())
    };
    put(arena, &mut at, argv.len() as u64)?;
    for p in &argv_ptrs {
        put(arena, &mut at, *p)?;
    }
    put(arena, &mut at, 0)?;
    for p in &envp_ptrs {
        put(arena, &mut at, *p)?;
    }
    put(arena, &mut at, 0)?;
    for (tag, value) in &auxv {
        put(arena, &mut at, *tag)?;
        put(arena, &mut at, *value)?;
    }

    Ok(StackLayout { sp, stack_low, stack_high })
}

pub mod synth {
    //! Synthesized ELF images for tests and in-memory tooling.

    use goblin::elf::program_header::{PF_R, PF_W, PF_X};

    /// Minimal static riscv64 ELF: one RWX segment holding `code` loaded
    /// at `vaddr`, entry at `vaddr`, with a small bss tail.
    pub fn make_static_elf(code: &[u8], vaddr: u64) -> Vec<u8> {
        let mut out = Vec::new();
        let phoff = 64u64;
        let hdrsize = 64 + 56;
        // ELF header.
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        out.extend_from_slice(&243u16.to_le_bytes()); // EM_RISCV
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&vaddr.to_le_bytes()); // e_entry
        out.extend_from_slice(&phoff.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes());
        out.extend_from_slice(&56u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // phnum
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        assert_eq!(out.len(), 64);
        // Program header: one PT_LOAD covering the code.
        out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        out.extend_from_slice(&(PF_R | PF_X | PF_W).to_le_bytes());
        out.extend_from_slice(&(hdrsize as u64).to_le_bytes()); // p_offset
        out.extend_from_slice(&vaddr.to_le_bytes()); // p_vaddr
        out.extend_from_slice(&vaddr.to_le_bytes()); // p_paddr
        out.extend_from_slice(&(code.len() as u64).to_le_bytes());
        out.extend_from_slice(&(code.len() as u64 + 64).to_le_bytes()); // bss tail
        out.extend_from_slice(&0x1000u64.to_le_bytes());
        assert_eq!(out.len(), hdrsize);
        out.extend_from_slice(code);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::synth::make_static_elf;
    use super::*;

    #[test]
    fn loads_segments_and_reports_layout() {
        let mut arena = Arena::new_owned(4 * 1024 * 1024);
        let code = [0x13u8, 0x00, 0x00, 0x00]; // nop
        let elf = make_static_elf(&code, 0x10000);
        let image = load_image(&mut arena, &elf, 0).unwrap();
        assert_eq!(image.entry, 0x10000);
        assert_eq!(arena.read_u32(0x10000).unwrap(), 0x0000_0013);
        assert!(arena.page_attrs(0x10000).contains(PageAttrs::EXEC));
        assert!(image.writable.is_some());
        assert!(image.end >= 0x10000 + 4);
    }

    #[test]
    fn stack_has_argc_argv_envp_auxv() {
        let mut arena = Arena::new_owned(4 * 1024 * 1024);
        let code = [0x13u8, 0x00, 0x00, 0x00];
        let elf = make_static_elf(&code, 0x10000);
        let image = load_image(&mut arena, &elf, 0).unwrap();
        let layout = setup_stack(
            &mut arena,
            &image,
            None,
            "/bin/prog",
            &["prog".to_string(), "arg1".to_string()],
            &["HOME=/root".to_string()],
        )
        .unwrap();

        assert_eq!(layout.sp % 16, 0);
        assert_eq!(arena.read_u64(layout.sp).unwrap(), 2); // argc
        let argv0 = arena.read_u64(layout.sp + 8).unwrap();
        assert_eq!(arena.read_cstr(argv0).unwrap(), "prog");
        let argv1 = arena.read_u64(layout.sp + 16).unwrap();
        assert_eq!(arena.read_cstr(argv1).unwrap(), "arg1");
        assert_eq!(arena.read_u64(layout.sp + 24).unwrap(), 0);
        let env0 = arena.read_u64(layout.sp + 32).unwrap();
        assert_eq!(arena.read_cstr(env0).unwrap(), "HOME=/root");
        assert_eq!(arena.read_u64(layout.sp + 40).unwrap(), 0);

        // Walk the auxv for AT_ENTRY and AT_RANDOM.
        let mut at = layout.sp + 48;
        let mut entry = None;
        let mut random = None;
        loop {
            let tag = arena.read_u64(at).unwrap();
            let val = arena.read_u64(at + 8).unwrap();
            if tag == AT_NULL {
                break;
            }
            if tag == AT_ENTRY {
                entry = Some(val);
            }
            if tag == AT_RANDOM {
                random = Some(val);
            }
            at += 16;
        }
        assert_eq!(entry, Some(0x10000));
        assert!(random.is_some());
    }

    #[test]
    fn memory_layout_puts_mmap_above_brk() {
        let mut arena = Arena::new_owned(4 * 1024 * 1024);
        configure_memory_layout(&mut arena, 0x20000);
        assert_eq!(arena.brk(), 0x20000);
        assert!(arena.mmap_base() > arena.brk());
    }
}
