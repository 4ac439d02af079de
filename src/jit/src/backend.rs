//! wasmtime execution backend.
//!
//! One engine, one store, one linear memory shared by every compiled
//! region. The memory *is* the guest arena: the emulator reads and writes
//! it through a raw view, compiled code addresses it as `env.memory`.

use std::ptr::NonNull;

use wasmtime::{Caller, Engine, Linker, Memory, MemoryType, Module, Store, TypedFunc};

use crate::{Error, Result};
use wasmgen::abi;

/// Host-side state visible to the `env.syscall` import. The current
/// implementation always defers syscalls to the execution loop; the
/// import exists so a future backend can service cheap calls inline.
#[derive(Default)]
pub struct HostCtx {
    pub syscall_requests: u64,
}

pub struct WasmBackend {
    engine: Engine,
    store: Store<HostCtx>,
    linker: Linker<HostCtx>,
    memory: Memory,
}

pub type RegionFunc = TypedFunc<(i32, i32), i32>;

impl WasmBackend {
    /// Creates a backend whose linear memory holds `pages` 64 KiB wasm
    /// pages (the whole guest arena plus the state window).
    pub fn new(pages: u64) -> Result<WasmBackend> {
        let engine = Engine::default();
        let mut store = Store::new(&engine, HostCtx::default());
        let mut linker: Linker<HostCtx> = Linker::new(&engine);

        let ty = MemoryType::new(pages as u32, Some(pages as u32));
        let memory = Memory::new(&mut store, ty).map_err(|e| Error::Backend(e.to_string()))?;
        linker
            .define(&mut store, abi::IMPORT_MODULE, abi::IMPORT_MEMORY, memory)
            .map_err(|e| Error::Backend(e.to_string()))?;

        linker
            .func_wrap(
                abi::IMPORT_MODULE,
                abi::IMPORT_SYSCALL,
                |mut caller: Caller<'_, HostCtx>, _state: i32, _pc: i32| -> i32 {
                    caller.data_mut().syscall_requests += 1;
                    abi::SYSCALL_ASYNC
                },
            )
            .map_err(|e| Error::Backend(e.to_string()))?;

        Ok(WasmBackend {
            engine,
            store,
            linker,
            memory,
        })
    }

    /// Engines are reference counted; the compile worker holds its own.
    pub fn engine(&self) -> Engine {
        self.engine.clone()
    }

    /// Raw view over the linear memory for the arena. Valid for the
    /// backend's lifetime: the memory's min equals its max, so wasmtime
    /// never moves it.
    pub fn arena_view(&mut self) -> (NonNull<u8>, usize) {
        let ptr = self.memory.data_ptr(&self.store);
        let len = self.memory.data_size(&self.store);
        (NonNull::new(ptr).expect("wasm memory base"), len)
    }

    pub fn compile(&self, wasm: &[u8]) -> Result<Module> {
        Module::new(&self.engine, wasm).map_err(|e| Error::Backend(e.to_string()))
    }

    pub fn instantiate(&mut self, module: &Module) -> Result<RegionFunc> {
        let instance = self
            .linker
            .instantiate(&mut self.store, module)
            .map_err(|e| Error::Backend(e.to_string()))?;
        instance
            .get_typed_func::<(i32, i32), i32>(&mut self.store, abi::EXPORT_RUN)
            .map_err(|e| Error::Backend(e.to_string()))
    }

    /// Calls a region's dispatch entry. A trap is a backend error; the
    /// caller invalidates the region and falls back to the interpreter.
    pub fn run(&mut self, func: RegionFunc, state_ptr: u64, pc: u64) -> Result<i32> {
        func.call(&mut self.store, (state_ptr as i32, pc as u32 as i32))
            .map_err(|e| Error::Backend(e.to_string()))
    }
}
