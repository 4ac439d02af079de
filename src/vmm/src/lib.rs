//! The emulator: owns every subsystem by value and drives the execution
//! loop. No global state; the "current thread" and fork machinery live on
//! the kernel, the compiled-code world on the JIT manager.

mod interp;

use std::time::Duration;

use arena::state::CpuState;
use arena::{Arena, PageAttrs, PAGE_SIZE};
use rustc_hash::FxHashMap;
use bridge::HostIo;
use jit::{ExecStatus, JitConfig, JitManager};
use kernel::{Kernel, Outcome, ProcLayout};
use tracing::{debug, error, info};

pub use interp::{BlockCache, InterpStop};
pub use jit::Tier;
pub use wasmgen::Tier as CompileTier;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("load error: {0}")]
    Load(#[from] loader::Error),
    #[error("jit error: {0}")]
    Jit(#[from] jit::Error),
    #[error("filesystem error: {0}")]
    Vfs(#[from] vfs::Error),
    #[error("arena error: {0}")]
    Arena(#[from] arena::Error),
    #[error("guest faulted at {addr:#x} and retries were exhausted")]
    StuckFault { addr: u64 },
    #[error("entry binary {0} not found in the rootfs")]
    NoEntry(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct EmuConfig {
    /// Guest address space; 2 GiB unless a test shrinks it.
    pub arena_size: u64,
    /// Interpreter instructions per quantum between JIT checks.
    pub interp_quantum: u64,
    /// Syscalls per cooperative-thread quantum.
    pub syscall_quantum: u32,
    /// Protection-fault upgrade retries per address.
    pub fault_retries: u32,
    pub hostname: String,
    pub jit: JitConfig,
    /// Gate for dispatching compiled code (the compiler still runs when
    /// scheduled; pure-interpreter runs disable both).
    pub enable_jit: bool,
}

impl Default for EmuConfig {
    fn default() -> Self {
        EmuConfig {
            arena_size: arena::DEFAULT_ARENA_SIZE,
            interp_quantum: 2_000_000,
            syscall_quantum: 50_000,
            fault_retries: 8,
            hostname: "krill".to_string(),
            jit: JitConfig::default(),
            enable_jit: true,
        }
    }
}

/// Default guest environment, matched by the CLI unless overridden.
pub fn default_env(hostname: &str) -> Vec<String> {
    vec![
        "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        "HOME=/root".to_string(),
        "USER=root".to_string(),
        "TERM=xterm-256color".to_string(),
        "LANG=C.UTF-8".to_string(),
        format!("HOSTNAME={hostname}"),
        "TZ=UTC".to_string(),
    ]
}

pub struct Emulator {
    cfg: EmuConfig,
    pub jit: JitManager,
    pub arena: Arena,
    pub cpu: CpuState,
    pub kernel: Kernel,
    cache: BlockCache,
    io: Box<dyn HostIo + Send>,
}

impl Emulator {
    pub fn new(cfg: EmuConfig, vfs: vfs::Vfs, io: Box<dyn HostIo + Send>) -> Result<Emulator> {
        let pages = cfg.arena_size.div_ceil(64 * 1024);
        let mut jit = JitManager::new(cfg.jit.clone(), pages)?;
        let (ptr, len) = jit.arena_view();
        // The wasm linear memory backs the arena; the JIT owns it and
        // outlives every guest access.
        let arena = unsafe { Arena::from_raw(ptr, len) };
        let kernel = Kernel::new(vfs, &cfg.hostname, cfg.syscall_quantum);
        Ok(Emulator {
            cfg,
            jit,
            arena,
            cpu: CpuState::default(),
            kernel,
            cache: BlockCache::default(),
            io,
        })
    }

    /// Loads the entry binary (and its dynamic linker, if any) and builds
    /// the initial stack.
    pub fn load(&mut self, path: &str, argv: &[String], envp: &[String]) -> Result<()> {
        let node = self
            .kernel
            .vfs
            .resolve(path)
            .map_err(|_| Error::NoEntry(path.to_string()))?;
        let bytes = self.kernel.vfs.node(node).content.clone();

        let main = loader::load_image(&mut self.arena, &bytes, loader::MAIN_BASE)?;
        let interp = match &main.interp {
            Some(interp_path) => {
                let node = self
                    .kernel
                    .vfs
                    .resolve(interp_path)
                    .map_err(|_| Error::NoEntry(interp_path.clone()))?;
                let interp_bytes = self.kernel.vfs.node(node).content.clone();
                Some(loader::load_image(
                    &mut self.arena,
                    &interp_bytes,
                    loader::INTERP_BASE,
                )?)
            }
            None => None,
        };

        let image_end = interp.as_ref().map(|i| i.end).unwrap_or(0).max(main.end);
        loader::configure_memory_layout(&mut self.arena, image_end);

        let exe = self.kernel.vfs.normalize(path);
        let stack = loader::setup_stack(&mut self.arena, &main, interp.as_ref(), &exe, argv, envp)?;

        self.cpu = CpuState::default();
        self.cpu.set_x(2, stack.sp);
        self.cpu.pc = interp.as_ref().map(|i| i.entry).unwrap_or(main.entry);

        self.kernel.layout = ProcLayout {
            data_range: main.writable,
            interp_data: interp.as_ref().and_then(|i| i.writable),
            stack_high: stack.stack_high,
        };
        self.kernel.vfs.set_proc_self(&exe, argv);
        self.cache.clear();

        info!(
            entry = self.cpu.pc,
            sp = stack.sp,
            interp = interp.is_some(),
            "guest loaded"
        );
        Ok(())
    }

    /// Ahead-of-time compiles the region containing the current pc;
    /// used by tests and the AOT tier comparisons.
    pub fn compile_entry_region(&mut self, tier: CompileTier) -> Result<()> {
        self.jit.compile_now(&self.arena, self.cpu.pc, tier)?;
        Ok(())
    }

    fn drain_invalidations(&mut self) {
        for (addr, len) in self.arena.take_invalidations() {
            self.jit.invalidate(addr, len);
            // Decoded blocks may cover the range too; drop them all, the
            // cache refills quickly.
            self.cache.clear();
        }
    }

    /// Runs the guest to completion; returns its exit status.
    pub fn run(&mut self) -> Result<i32> {
        let mut fault_pc = 0u64;
        let mut fault_count = 0u32;

        let mut skip_jit_once = false;
        loop {
            self.drain_invalidations();
            if self.cfg.enable_jit {
                self.jit.tick(&self.arena);
            }

            // Compiled code first — except right after a region miss,
            // where the missed pc may sit untranslated inside a live
            // region and re-dispatching would spin on the miss stub.
            if self.cfg.enable_jit && !skip_jit_once && self.jit.has_region(self.cpu.pc) {
                self.cpu.sync_to_arena(&mut self.arena)?;
                if let Some(status) = self.jit.execute(self.cpu.pc) {
                    self.cpu.sync_from_arena(&self.arena)?;
                    match status {
                        ExecStatus::Halt => {
                            self.io.notify_exit(0);
                            return Ok(0);
                        }
                        ExecStatus::Syscall { pc } => {
                            self.cpu.pc = pc;
                            if let Some(code) = self.do_syscall()? {
                                return Ok(code);
                            }
                        }
                        ExecStatus::Miss { pc } => {
                            self.cpu.pc = pc;
                            skip_jit_once = true;
                        }
                    }
                    continue;
                }
            }
            skip_jit_once = false;

            // Interpreter quantum.
            let mut executed: FxHashMap<u64, u32> = FxHashMap::default();
            let stop = interp::run_quantum(
                &mut self.cpu,
                &mut self.arena,
                &mut self.cache,
                self.cfg.interp_quantum,
                &mut executed,
            );
            if self.cfg.enable_jit {
                for (pc, count) in executed {
                    self.jit.on_interp_block(pc, count);
                }
            }

            match stop {
                InterpStop::Quantum => {}
                InterpStop::Ecall => {
                    if let Some(code) = self.do_syscall()? {
                        return Ok(code);
                    }
                }
                InterpStop::Ebreak => {
                    error!(pc = self.cpu.pc, "guest hit ebreak");
                    self.io.notify_exit(133);
                    return Ok(133);
                }
                InterpStop::BadInstr(pc) => {
                    error!(pc, "undecodable instruction");
                    self.io.notify_exit(132);
                    return Ok(132);
                }
                InterpStop::Fault(addr) => {
                    if self.cpu.pc == fault_pc {
                        fault_count += 1;
                    } else {
                        fault_pc = self.cpu.pc;
                        fault_count = 1;
                    }
                    if fault_count > self.cfg.fault_retries {
                        error!(addr, pc = self.cpu.pc, "protection fault retries exhausted");
                        self.io.notify_exit(1);
                        return Err(Error::StuckFault { addr });
                    }
                    // Upgrade and retry the faulting access.
                    debug!(addr, pc = self.cpu.pc, "upgrading faulted page");
                    if self
                        .arena
                        .set_page_attr(addr, PAGE_SIZE, PageAttrs::RWX)
                        .is_err()
                    {
                        self.io.notify_exit(1);
                        return Err(Error::StuckFault { addr });
                    }
                }
            }
        }
    }

    /// Routes one syscall; `Some(code)` ends the run.
    fn do_syscall(&mut self) -> Result<Option<i32>> {
        match self
            .kernel
            .handle_syscall(&mut self.cpu, &mut self.arena, self.io.as_ref())
        {
            Outcome::Done => Ok(None),
            Outcome::StdinWait => {
                // Machine stopped; the ecall re-executes once the
                // foreground supplies input (or the wait times out and the
                // handler re-evaluates).
                self.io.wait_for_input(Some(Duration::from_millis(100)));
                Ok(None)
            }
            Outcome::Sleep(d) => {
                std::thread::sleep(d.min(Duration::from_secs(60)));
                Ok(None)
            }
            Outcome::Exit(code) => {
                info!(code, stats = ?self.jit.stats(), "guest exited");
                self.io.notify_exit(code);
                Ok(Some(code))
            }
            Outcome::ExecRestart => {
                let req = self
                    .kernel
                    .take_exec_request()
                    .expect("ExecRestart without a request");
                self.reload(req)?;
                Ok(None)
            }
        }
    }

    /// execve: evict everything derived from the old image and start over
    /// with the new one.
    fn reload(&mut self, req: kernel::ExecRequest) -> Result<()> {
        debug!(path = %req.path, "execve reload");
        self.jit.reset();
        self.arena.reset_for_exec();
        let _ = self.arena.take_invalidations();
        self.cache.clear();
        self.load(&req.path, &req.argv, &req.envp)
    }

    pub fn io(&self) -> &(dyn HostIo + Send) {
        self.io.as_ref()
    }
}
