//! RISC-V to WebAssembly translation.
//!
//! Each 16 KiB guest region becomes one wasm module: a function per basic
//! block, a dispatch function routing program counters through a funcref
//! table, and a miss stub for addresses with no translated block. The
//! module imports the arena as linear memory and a host syscall hook; its
//! only export is `run(state_ptr, pc) -> i32` with the return encoding in
//! [`abi`].

mod insts;
mod module;
mod passes;
mod regcache;
mod translate;

pub use insts::{BlockType, ValType, WasmInst};
pub use module::{LocalAlloc, ModuleBuilder};
pub use passes::run_peephole;
pub use regcache::{block_liveness, Liveness};
pub use translate::{translate_block, translate_region, TranslatedRegion};

/// Compilation quality levels. `Compat` tags legacy single-stage modules
/// loaded through the compatibility path; no compiler here produces it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Tier {
    Baseline,
    Optimized,
    Compat,
}

/// The `run` export's return encoding plus module-internal sentinels.
pub mod abi {
    /// Guest called exit; no further dispatch.
    pub const RET_HALT: i32 = -1;
    /// High bit set: an ecall was reached; low 31 bits are its pc.
    pub const RET_SYSCALL_BIT: u32 = 0x8000_0000;
    /// Bit 30 set: the next pc leaves every translated block of this
    /// region; low bits are the real target.
    pub const RET_MISS_BIT: u32 = 0x4000_0000;
    /// Returned by the miss stub inside the module. Odd, so it can never
    /// collide with a real (2-byte aligned) program counter.
    pub const MISS_SENTINEL: i32 = 0x4000_0001;
    /// Reply from the imported `env.syscall` meaning "surface the syscall
    /// to the host instead of continuing inline".
    pub const SYSCALL_ASYNC: i32 = -2;

    pub const IMPORT_MODULE: &str = "env";
    pub const IMPORT_MEMORY: &str = "memory";
    pub const IMPORT_SYSCALL: &str = "syscall";
    pub const EXPORT_RUN: &str = "run";

    /// Function-table slots per region: one per possible 2-byte aligned
    /// instruction start in a 16 KiB window.
    pub const TABLE_SLOTS: u32 = (rvdec::REGION_SIZE / 2) as u32;
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("region at {base:#x} has no translatable blocks")]
    EmptyRegion { base: u64 },
    #[error("region base {base:#x} conflicts with the return-code encoding")]
    BaseTooHigh { base: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;
