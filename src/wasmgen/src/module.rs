//! Region module assembly: section layout, function index space, the
//! funcref dispatch table and the final binary.

use crate::insts::{leb_u, ValType, WasmInst};
use crate::abi;

/// Local variable allocator for one function body. Indices start after
/// the function's parameters.
#[derive(Debug)]
pub struct LocalAlloc {
    params: u32,
    locals: Vec<ValType>,
}

impl LocalAlloc {
    pub fn new(params: u32) -> LocalAlloc {
        LocalAlloc { params, locals: Vec::new() }
    }

    pub fn alloc(&mut self, ty: ValType) -> u32 {
        self.locals.push(ty);
        self.params + self.locals.len() as u32 - 1
    }

    pub fn types(&self) -> &[ValType] {
        &self.locals
    }
}

/// A function body ready for encoding: extra locals plus instructions
/// (without the trailing `end`, which encoding appends).
#[derive(Debug, Default)]
pub struct FuncBody {
    pub locals: Vec<ValType>,
    pub insts: Vec<WasmInst>,
}

/// Builds the one module shape every compiled region uses:
///
/// - type 0: `(i32, i32) -> i32` for `run` and the syscall import
/// - type 1: `(i32) -> i32` for block functions and the miss stub
/// - imports: `env.memory`, `env.syscall` (function index 0)
/// - functions: blocks, then the miss stub, then `run`
/// - a funcref table with one slot per 2-byte instruction start
pub struct ModuleBuilder {
    mem_min_pages: u64,
    blocks: Vec<FuncBody>,
    /// (table slot, block index) pairs; unset slots route to the miss stub.
    slots: Vec<(u32, u32)>,
}

impl ModuleBuilder {
    pub fn new(mem_min_pages: u64) -> ModuleBuilder {
        ModuleBuilder {
            mem_min_pages,
            blocks: Vec::new(),
            slots: Vec::new(),
        }
    }

    /// Adds a block function; returns its block index.
    pub fn push_block(&mut self, body: FuncBody) -> u32 {
        self.blocks.push(body);
        self.blocks.len() as u32 - 1
    }

    pub fn map_slot(&mut self, slot: u32, block_index: u32) {
        debug_assert!(slot < abi::TABLE_SLOTS);
        self.slots.push((slot, block_index));
    }

    pub fn block_func_index(&self, block_index: u32) -> u32 {
        1 + block_index
    }

    fn miss_func_index(&self) -> u32 {
        1 + self.blocks.len() as u32
    }

    pub fn run_func_index(&self) -> u32 {
        2 + self.blocks.len() as u32
    }

    pub fn build(self, run: FuncBody) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00]);

        // Type section.
        let mut payload = Vec::new();
        leb_u(&mut payload, 2);
        payload.extend_from_slice(&[0x60, 2, 0x7f, 0x7f, 1, 0x7f]); // (i32,i32)->i32
        payload.extend_from_slice(&[0x60, 1, 0x7f, 1, 0x7f]); // (i32)->i32
        section(&mut out, 1, &payload);

        // Import section: env.memory, env.syscall.
        let mut payload = Vec::new();
        leb_u(&mut payload, 2);
        import_name(&mut payload, abi::IMPORT_MODULE, abi::IMPORT_MEMORY);
        payload.push(0x02); // memory
        payload.push(0x00); // min only
        leb_u(&mut payload, self.mem_min_pages);
        import_name(&mut payload, abi::IMPORT_MODULE, abi::IMPORT_SYSCALL);
        payload.push(0x00); // function
        leb_u(&mut payload, 0); // type 0
        section(&mut out, 2, &payload);

        // Function section: blocks (type 1), miss stub (type 1), run (type 0).
        let mut payload = Vec::new();
        leb_u(&mut payload, self.blocks.len() as u64 + 2);
        for _ in &self.blocks {
            leb_u(&mut payload, 1);
        }
        leb_u(&mut payload, 1); // miss stub
        leb_u(&mut payload, 0); // run
        section(&mut out, 3, &payload);

        // Table section.
        let mut payload = Vec::new();
        leb_u(&mut payload, 1);
        payload.push(0x70); // funcref
        payload.push(0x01); // min and max
        leb_u(&mut payload, abi::TABLE_SLOTS as u64);
        leb_u(&mut payload, abi::TABLE_SLOTS as u64);
        section(&mut out, 4, &payload);

        // Export section.
        let mut payload = Vec::new();
        leb_u(&mut payload, 1);
        export_name(&mut payload, abi::EXPORT_RUN);
        payload.push(0x00);
        leb_u(&mut payload, self.run_func_index() as u64);
        section(&mut out, 7, &payload);

        // Element section: one active segment covering the whole table,
        // defaulting every slot to the miss stub.
        let miss = self.miss_func_index();
        let mut table: Vec<u32> = vec![miss; abi::TABLE_SLOTS as usize];
        for (slot, block) in &self.slots {
            table[*slot as usize] = self.block_func_index(*block);
        }
        let mut payload = Vec::new();
        leb_u(&mut payload, 1);
        payload.push(0x00); // active, table 0, offset expr
        payload.push(0x41); // i32.const
        payload.push(0x00);
        payload.push(0x0b); // end
        leb_u(&mut payload, table.len() as u64);
        for idx in table {
            leb_u(&mut payload, idx as u64);
        }
        section(&mut out, 9, &payload);

        // Code section.
        let mut payload = Vec::new();
        leb_u(&mut payload, self.blocks.len() as u64 + 2);
        for body in &self.blocks {
            encode_func(&mut payload, body);
        }
        // Miss stub: every untranslated slot reports a region miss.
        encode_func(
            &mut payload,
            &FuncBody {
                locals: Vec::new(),
                insts: vec![WasmInst::I32Const(abi::MISS_SENTINEL)],
            },
        );
        encode_func(&mut payload, &run);
        section(&mut out, 10, &payload);

        out
    }
}

fn section(out: &mut Vec<u8>, id: u8, payload: &[u8]) {
    out.push(id);
    leb_u(out, payload.len() as u64);
    out.extend_from_slice(payload);
}

fn import_name(out: &mut Vec<u8>, module: &str, name: &str) {
    leb_u(out, module.len() as u64);
    out.extend_from_slice(module.as_bytes());
    leb_u(out, name.len() as u64);
    out.extend_from_slice(name.as_bytes());
}

fn export_name(out: &mut Vec<u8>, name: &str) {
    leb_u(out, name.len() as u64);
    out.extend_from_slice(name.as_bytes());
}

fn encode_func(out: &mut Vec<u8>, body: &FuncBody) {
    let mut code = Vec::new();

    // Locals, grouped by runs of the same type.
    let mut groups: Vec<(u64, ValType)> = Vec::new();
    for &ty in &body.locals {
        match groups.last_mut() {
            Some((count, t)) if *t == ty => *count += 1,
            _ => groups.push((1, ty)),
        }
    }
    leb_u(&mut code, groups.len() as u64);
    for (count, ty) in groups {
        leb_u(&mut code, count);
        code.push(ty.byte());
    }

    for inst in &body.insts {
        inst.encode(&mut code);
    }
    code.push(0x0b); // end

    leb_u(out, code.len() as u64);
    out.extend_from_slice(&code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_starts_with_magic_and_exports_run() {
        let mut b = ModuleBuilder::new(1);
        let idx = b.push_block(FuncBody {
            locals: vec![ValType::I64],
            insts: vec![WasmInst::I32Const(4)],
        });
        b.map_slot(0, idx);
        let run = FuncBody {
            locals: Vec::new(),
            insts: vec![WasmInst::I32Const(abi::RET_HALT)],
        };
        let bytes = b.build(run);
        assert_eq!(&bytes[0..8], &[0x00, 0x61, 0x73, 0x6d, 1, 0, 0, 0]);
        // The export section must contain the literal name "run".
        let needle = b"run";
        assert!(bytes.windows(needle.len()).any(|w| w == *needle));
    }

    #[test]
    fn local_groups_collapse() {
        let mut out = Vec::new();
        encode_func(
            &mut out,
            &FuncBody {
                locals: vec![ValType::I64, ValType::I64, ValType::I32],
                insts: vec![WasmInst::I32Const(0)],
            },
        );
        // body size, 2 groups: (2 x i64), (1 x i32)
        assert_eq!(out[1], 2);
        assert_eq!(&out[2..6], &[2, 0x7e, 1, 0x7f]);
    }
}
