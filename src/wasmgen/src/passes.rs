//! Peephole passes over a block's instruction list.
//!
//! All passes key on the canonical register-access shapes the translator
//! emits:
//!
//! - load site:  `local.get 0, i32.const C, i32.add, i64.load`
//! - store site: `local.get 0, i32.const C, i32.add, local.get V, i64.store`
//!
//! where `C` is a register-file offset inside the state window. Guest
//! memory traffic never takes this shape (its addresses come from register
//! values), so the passes cannot touch it. Each pass is idempotent.

use arena::state::{STATE_END, XREG_OFF};
use rustc_hash::FxHashMap;

use crate::insts::{ValType, WasmInst};
use crate::module::LocalAlloc;

fn is_reg_offset(c: i32) -> bool {
    (c as i64) >= XREG_OFF as i64 && (c as i64) < STATE_END as i64
}

fn load_site(w: &[WasmInst]) -> Option<i32> {
    match w {
        [WasmInst::LocalGet(0), WasmInst::I32Const(c), WasmInst::I32Add, WasmInst::I64Load { offset: 0 }, ..]
            if is_reg_offset(*c) =>
        {
            Some(*c)
        }
        _ => None,
    }
}

fn store_site(w: &[WasmInst]) -> Option<(i32, u32)> {
    match w {
        [WasmInst::LocalGet(0), WasmInst::I32Const(c), WasmInst::I32Add, WasmInst::LocalGet(v), WasmInst::I64Store { offset: 0 }, ..]
            if is_reg_offset(*c) =>
        {
            Some((*c, *v))
        }
        _ => None,
    }
}

fn is_control(inst: &WasmInst) -> bool {
    matches!(
        inst,
        WasmInst::Block(_)
            | WasmInst::Loop(_)
            | WasmInst::If(_)
            | WasmInst::Else
            | WasmInst::End
            | WasmInst::Br(_)
            | WasmInst::BrIf(_)
            | WasmInst::BrTable { .. }
            | WasmInst::Return
            | WasmInst::Unreachable
            | WasmInst::Call(_)
            | WasmInst::CallIndirect { .. }
    )
}

/// Pass 4: within a straight-line run, a register offset stored twice with
/// no intervening reload drops the earlier store. The value computation
/// stays (it ends in a `local.set`, stack-neutral); only the five store
/// instructions go.
fn dead_store_elim(insts: &mut Vec<WasmInst>) {
    let mut delete: Vec<(usize, usize)> = Vec::new();
    let mut pending: FxHashMap<i32, usize> = FxHashMap::default();
    let mut i = 0;
    while i < insts.len() {
        if is_control(&insts[i]) {
            pending.clear();
            i += 1;
            continue;
        }
        if let Some(c) = load_site(&insts[i..]) {
            pending.remove(&c);
            i += 4;
            continue;
        }
        if let Some((c, _)) = store_site(&insts[i..]) {
            if let Some(prev) = pending.insert(c, i) {
                delete.push((prev, prev + 5));
            }
            i += 5;
            continue;
        }
        i += 1;
    }
    if delete.is_empty() {
        return;
    }
    let mut out = Vec::with_capacity(insts.len());
    'next: for (idx, inst) in insts.drain(..).enumerate() {
        for &(start, end) in &delete {
            if idx >= start && idx < end {
                continue 'next;
            }
        }
        out.push(inst);
    }
    *insts = out;
}

/// Pass 1: a reload of an offset stored earlier in the same run reads the
/// stored value from a local instead of going back through memory. Store
/// sites fed by the shared value scratch get a fresh local of their own so
/// the value survives later stores.
fn store_reload_forward(insts: &mut Vec<WasmInst>, locals: &mut LocalAlloc) {
    let mut current: FxHashMap<i32, u32> = FxHashMap::default();
    let mut i = 0;
    while i < insts.len() {
        if is_control(&insts[i]) {
            current.clear();
            i += 1;
            continue;
        }
        // A later write to a local we are forwarding invalidates it.
        if let WasmInst::LocalSet(l) | WasmInst::LocalTee(l) = insts[i] {
            current.retain(|_, v| *v != l);
        }
        if let Some((c, v)) = store_site(&insts[i..]) {
            let set_count = insts
                .iter()
                .filter(|x| matches!(x, WasmInst::LocalSet(l) | WasmInst::LocalTee(l) if *l == v))
                .count();
            let stable = if set_count > 1 && i > 0 && insts[i - 1] == WasmInst::LocalSet(v) {
                // Shared scratch: move the value into a dedicated local so
                // it survives the scratch's next assignment.
                let fresh = locals.alloc(ValType::I64);
                insts[i - 1] = WasmInst::LocalSet(fresh);
                insts[i + 3] = WasmInst::LocalGet(fresh);
                fresh
            } else {
                v
            };
            current.insert(c, stable);
            i += 5;
            continue;
        }
        if let Some(c) = load_site(&insts[i..]) {
            if let Some(&l) = current.get(&c) {
                insts.splice(i..i + 4, [WasmInst::LocalGet(l)]);
                i += 1;
                continue;
            }
            i += 4;
            continue;
        }
        i += 1;
    }
}

/// Pass 2: repeated state-pointer address computations within a run are
/// computed once and teed into a local; later sites read the local.
fn state_addr_dedup(insts: &mut Vec<WasmInst>, locals: &mut LocalAlloc) {
    let mut seen: FxHashMap<i32, u32> = FxHashMap::default();
    let mut i = 0;
    while i < insts.len() {
        if is_control(&insts[i]) {
            seen.clear();
            i += 1;
            continue;
        }
        let prefix = matches!(
            &insts[i..],
            [WasmInst::LocalGet(0), WasmInst::I32Const(c), WasmInst::I32Add, ..] if is_reg_offset(*c)
        );
        if prefix {
            let WasmInst::I32Const(c) = &insts[i + 1] else { unreachable!() };
            let c = *c;
            match seen.get(&c) {
                Some(&l) => {
                    insts.splice(i..i + 3, [WasmInst::LocalGet(l)]);
                    i += 1;
                }
                // Already teed by an earlier run of this pass.
                None if matches!(insts.get(i + 3), Some(WasmInst::LocalTee(_))) => {
                    let WasmInst::LocalTee(l) = &insts[i + 3] else { unreachable!() };
                    seen.insert(c, *l);
                    i += 4;
                }
                None => {
                    let l = locals.alloc(ValType::I32);
                    insts.insert(i + 3, WasmInst::LocalTee(l));
                    seen.insert(c, l);
                    i += 4;
                }
            }
            continue;
        }
        i += 1;
    }
}

/// Pass 3: integer constant folding for `const, const, binop`. Floating
/// point is never folded; rounding happens at run time.
fn const_fold(insts: &mut Vec<WasmInst>) {
    loop {
        let mut changed = false;
        let mut i = 0;
        while i + 2 < insts.len() {
            let folded = match (&insts[i], &insts[i + 1], &insts[i + 2]) {
                (WasmInst::I64Const(a), WasmInst::I64Const(b), op) => fold_i64(*a, *b, op).map(WasmInst::I64Const),
                (WasmInst::I32Const(a), WasmInst::I32Const(b), op) => fold_i32(*a, *b, op).map(WasmInst::I32Const),
                _ => None,
            };
            if let Some(inst) = folded {
                insts.splice(i..i + 3, [inst]);
                changed = true;
                // Re-examine from one instruction back so chains fold.
                i = i.saturating_sub(1);
            } else {
                i += 1;
            }
        }
        if !changed {
            break;
        }
    }
}

fn fold_i64(a: i64, b: i64, op: &WasmInst) -> Option<i64> {
    Some(match op {
        WasmInst::I64Add => a.wrapping_add(b),
        WasmInst::I64Sub => a.wrapping_sub(b),
        WasmInst::I64And => a & b,
        WasmInst::I64Or => a | b,
        WasmInst::I64Xor => a ^ b,
        WasmInst::I64Shl => a.wrapping_shl(b as u32 & 63),
        WasmInst::I64ShrS => a.wrapping_shr(b as u32 & 63),
        WasmInst::I64ShrU => ((a as u64).wrapping_shr(b as u32 & 63)) as i64,
        _ => return None,
    })
}

fn fold_i32(a: i32, b: i32, op: &WasmInst) -> Option<i32> {
    Some(match op {
        WasmInst::I32Add => a.wrapping_add(b),
        WasmInst::I32Sub => a.wrapping_sub(b),
        WasmInst::I32And => a & b,
        WasmInst::I32Or => a | b,
        WasmInst::I32Xor => a ^ b,
        WasmInst::I32Shl => a.wrapping_shl(b as u32 & 31),
        WasmInst::I32ShrS => a.wrapping_shr(b as u32 & 31),
        WasmInst::I32ShrU => ((a as u32).wrapping_shr(b as u32 & 31)) as i32,
        _ => return None,
    })
}

/// Runs all four passes in an order that lets each feed the next: dead
/// stores first (less work for forwarding), then store-to-load
/// forwarding, then address dedup over what is left, then folding.
pub fn run_peephole(insts: &mut Vec<WasmInst>, locals: &mut LocalAlloc) {
    dead_store_elim(insts);
    store_reload_forward(insts, locals);
    state_addr_dedup(insts, locals);
    const_fold(insts);
}

#[cfg(test)]
mod tests {
    use super::*;
    use WasmInst::*;

    const X5: i32 = 0x128; // xreg_offset(5)
    const X6: i32 = 0x130;

    fn reg_load(c: i32) -> Vec<WasmInst> {
        vec![LocalGet(0), I32Const(c), I32Add, I64Load { offset: 0 }]
    }

    fn reg_store(c: i32, v: u32) -> Vec<WasmInst> {
        vec![LocalGet(0), I32Const(c), I32Add, LocalGet(v), I64Store { offset: 0 }]
    }

    #[test]
    fn dead_stores_drop_the_earlier_site() {
        let mut insts = Vec::new();
        insts.push(I64Const(1));
        insts.push(LocalSet(1));
        insts.extend(reg_store(X5, 1));
        insts.push(I64Const(2));
        insts.push(LocalSet(1));
        insts.extend(reg_store(X5, 1));
        let before = insts.clone();
        dead_store_elim(&mut insts);
        // One store site (5 instructions) removed; values still computed.
        assert_eq!(insts.len(), before.len() - 5);
        assert_eq!(insts.iter().filter(|i| matches!(i, I64Store { .. })).count(), 1);

        // Idempotent.
        let once = insts.clone();
        dead_store_elim(&mut insts);
        assert_eq!(insts, once);
    }

    #[test]
    fn intervening_load_preserves_both_stores() {
        let mut insts = Vec::new();
        insts.push(I64Const(1));
        insts.push(LocalSet(1));
        insts.extend(reg_store(X5, 1));
        insts.extend(reg_load(X5));
        insts.push(Drop);
        insts.push(I64Const(2));
        insts.push(LocalSet(1));
        insts.extend(reg_store(X5, 1));
        let before = insts.len();
        dead_store_elim(&mut insts);
        assert_eq!(insts.len(), before);
    }

    #[test]
    fn control_flow_fences_dead_store_elim() {
        let mut insts = Vec::new();
        insts.push(I64Const(1));
        insts.push(LocalSet(1));
        insts.extend(reg_store(X5, 1));
        insts.push(If(crate::BlockType::Empty));
        insts.push(End);
        insts.push(I64Const(2));
        insts.push(LocalSet(1));
        insts.extend(reg_store(X5, 1));
        let before = insts.len();
        dead_store_elim(&mut insts);
        assert_eq!(insts.len(), before);
    }

    #[test]
    fn reload_after_store_reads_the_local() {
        let mut locals = LocalAlloc::new(1);
        let scratch = locals.alloc(ValType::I64); // local 1
        let mut insts = Vec::new();
        // Two stores through the shared scratch, then a reload of the
        // first: the forwarded value must survive the second store.
        insts.push(I64Const(42));
        insts.push(LocalSet(scratch));
        insts.extend(reg_store(X5, scratch));
        insts.push(I64Const(7));
        insts.push(LocalSet(scratch));
        insts.extend(reg_store(X6, scratch));
        insts.extend(reg_load(X5));
        insts.push(Drop);
        store_reload_forward(&mut insts, &mut locals);
        // The reload is gone; the X5 store's value lives in a fresh local.
        assert_eq!(insts.iter().filter(|i| matches!(i, I64Load { .. })).count(), 0);
        let fresh = match insts[1] {
            LocalSet(l) => l,
            ref other => panic!("expected local.set, got {other:?}"),
        };
        assert_ne!(fresh, scratch);
        assert!(insts.contains(&LocalGet(fresh)));

        // Idempotent: a second run changes nothing.
        let once = insts.clone();
        store_reload_forward(&mut insts, &mut locals);
        assert_eq!(insts, once);
    }

    #[test]
    fn addr_dedup_tees_once() {
        let mut locals = LocalAlloc::new(1);
        let mut insts = Vec::new();
        insts.extend(reg_load(X6));
        insts.push(Drop);
        insts.extend(reg_load(X6));
        insts.push(Drop);
        state_addr_dedup(&mut insts, &mut locals);
        // First site gains a tee; second collapses to one local.get.
        assert_eq!(insts.iter().filter(|i| matches!(i, LocalTee(_))).count(), 1);
        assert_eq!(insts.iter().filter(|i| matches!(i, I32Const(_))).count(), 1);

        let once = insts.clone();
        state_addr_dedup(&mut insts, &mut locals);
        assert_eq!(insts, once);
    }

    #[test]
    fn folding_is_integer_only() {
        let mut insts = vec![I64Const(3), I64Const(4), I64Add, I64Const(1), I64Shl];
        const_fold(&mut insts);
        assert_eq!(insts, vec![I64Const(14)]);

        let mut fp = vec![F64Const(1.5), F64Const(2.5), F64Add];
        const_fold(&mut fp);
        assert_eq!(fp.len(), 3);
    }
}
