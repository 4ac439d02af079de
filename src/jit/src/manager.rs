//! The JIT manager: detection, scheduling, prediction, invalidation.

use std::ptr::NonNull;
use std::time::Instant;

use arena::{Arena, PAGE_SHIFT, PAGE_SIZE};
use rustc_hash::{FxHashMap, FxHashSet};
use rvdec::{build_region, region_base, REGION_SIZE};
use wasmgen::{abi, translate_region, Tier};

use crate::backend::{RegionFunc, WasmBackend};
use crate::worker::{CompileRequest, CompileWorker};
use crate::{failure_cooldown, ExecStatus, JitConfig, Result};

/// Entry points remembered per region, fed to the block discoverer. Caps
/// keep pathological indirect-jump code from growing the set unboundedly.
const MAX_ENTRIES_PER_REGION: usize = 64;

fn tier_rank(tier: Tier) -> u8 {
    match tier {
        Tier::Compat => 0,
        Tier::Baseline => 1,
        Tier::Optimized => 2,
    }
}

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub dispatches: u64,
    pub region_misses: u64,
    pub chain_hops: u64,
    pub max_chain: u32,
    pub compiles_ok: u64,
    pub compiles_failed: u64,
    pub invalidations: u64,
    pub predictor_hits: u64,
    pub predictor_misses: u64,
    pub queue_evictions: u64,
    pub queue_drops: u64,
    pub hot_enqueues: u64,
    pub promotions: u64,
}

struct CompiledRegion {
    tier: Tier,
    func: RegionFunc,
    #[allow(dead_code)]
    block_count: usize,
}

#[derive(Debug)]
struct CompileTask {
    base: u64,
    tier: Tier,
    priority: f64,
}

#[derive(Debug)]
struct Failure {
    count: u32,
    until: Instant,
    last_error: String,
}

pub struct JitManager {
    cfg: JitConfig,
    arena_pages: u64,
    backend: WasmBackend,
    worker: CompileWorker,

    regions: FxHashMap<u64, CompiledRegion>,
    page_hits: FxHashMap<u64, u32>,
    region_hits: FxHashMap<u64, u32>,
    region_entries: FxHashMap<u64, FxHashSet<u64>>,

    queue: Vec<CompileTask>,
    demand: FxHashMap<u64, u32>,
    failures: FxHashMap<u64, Failure>,
    inflight: FxHashMap<u64, Tier>,
    stale_inflight: FxHashSet<u64>,
    epoch: u64,

    markov1: FxHashMap<u64, FxHashMap<u64, u32>>,
    markov2: FxHashMap<(u64, u64), FxHashMap<u64, u32>>,
    markov1_age: FxHashMap<u64, u64>,
    markov2_age: FxHashMap<(u64, u64), u64>,
    age_counter: u64,
    prev_region: Option<u64>,

    predicted: FxHashSet<u64>,
    dirty_pages: FxHashSet<u64>,

    tokens: f64,
    last_refill: Instant,

    stats: Stats,
}

impl JitManager {
    pub fn new(cfg: JitConfig, arena_pages: u64) -> Result<JitManager> {
        let backend = WasmBackend::new(arena_pages)?;
        let worker = CompileWorker::spawn(backend.engine());
        Ok(JitManager {
            tokens: cfg.compile_budget_per_second.max(1.0),
            cfg,
            arena_pages,
            backend,
            worker,
            regions: FxHashMap::default(),
            page_hits: FxHashMap::default(),
            region_hits: FxHashMap::default(),
            region_entries: FxHashMap::default(),
            queue: Vec::new(),
            demand: FxHashMap::default(),
            failures: FxHashMap::default(),
            inflight: FxHashMap::default(),
            stale_inflight: FxHashSet::default(),
            epoch: 0,
            markov1: FxHashMap::default(),
            markov2: FxHashMap::default(),
            markov1_age: FxHashMap::default(),
            markov2_age: FxHashMap::default(),
            age_counter: 0,
            prev_region: None,
            predicted: FxHashSet::default(),
            dirty_pages: FxHashSet::default(),
            last_refill: Instant::now(),
            stats: Stats::default(),
        })
    }

    /// Raw view of the backend's linear memory, handed to the arena.
    pub fn arena_view(&mut self) -> (NonNull<u8>, usize) {
        self.backend.arena_view()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn has_region(&self, pc: u64) -> bool {
        self.regions.contains_key(&region_base(pc))
    }

    pub fn region_tier(&self, pc: u64) -> Option<Tier> {
        self.regions.get(&region_base(pc)).map(|r| r.tier)
    }

    // === Detection === //

    /// Called by the interpreter after executing `count` instructions
    /// starting at `pc`. Crossing the hot threshold enqueues the
    /// containing region for baseline compilation.
    pub fn on_interp_block(&mut self, pc: u64, count: u32) {
        self.note_entry(pc);
        let page = pc >> PAGE_SHIFT;
        let hits = self.page_hits.entry(page).or_insert(0);
        let old = *hits;
        *hits = old.saturating_add(count);
        if old < self.cfg.hot_threshold && *hits >= self.cfg.hot_threshold {
            let base = region_base(pc);
            tracing::debug!(base, page, "page went hot");
            self.stats.hot_enqueues += 1;
            self.enqueue(base, Tier::Baseline, 0.5, false);
        }
    }

    fn note_entry(&mut self, pc: u64) {
        let set = self.region_entries.entry(region_base(pc)).or_default();
        if set.len() < MAX_ENTRIES_PER_REGION {
            set.insert(pc);
        }
    }

    // === Execution === //

    /// Dispatches compiled code covering `pc`, chaining across regions up
    /// to the hop cap. `None` means no compiled region covers `pc`.
    pub fn execute(&mut self, pc: u64) -> Option<ExecStatus> {
        let mut cur = pc;
        let mut hops: u32 = 0;
        loop {
            let base = region_base(cur);
            let Some(region) = self.regions.get(&base) else {
                return if hops == 0 {
                    None
                } else {
                    Some(ExecStatus::Miss { pc: cur })
                };
            };
            let func = region.func.clone();
            let tier = region.tier;

            if self.predicted.remove(&base) {
                self.stats.predictor_hits += 1;
            }
            self.stats.dispatches += 1;
            self.bump_region_hits(base, tier);

            let ret = match self.backend.run(func, arena::state::STATE_PTR, cur) {
                Ok(ret) => ret,
                Err(e) => {
                    tracing::warn!(base, error = %e, "compiled region trapped; invalidating");
                    self.record_failure(base, e.to_string());
                    self.invalidate(base, REGION_SIZE);
                    return Some(ExecStatus::Miss { pc: cur });
                }
            };

            if ret == abi::RET_HALT {
                return Some(ExecStatus::Halt);
            }
            let r = ret as u32;
            if r & abi::RET_SYSCALL_BIT != 0 {
                return Some(ExecStatus::Syscall {
                    pc: (r & 0x7fff_ffff) as u64,
                });
            }
            if r & abi::RET_MISS_BIT != 0 {
                let target = (r & !abi::RET_MISS_BIT) as u64;
                self.stats.region_misses += 1;
                self.note_transition(base, target);
                let tbase = region_base(target);
                if tbase == base {
                    // A pc inside this region with no translated block;
                    // re-dispatching would loop on the miss stub.
                    return Some(ExecStatus::Miss { pc: target });
                }
                hops += 1;
                self.stats.chain_hops += 1;
                self.stats.max_chain = self.stats.max_chain.max(hops);
                if hops >= self.cfg.max_chain_hops {
                    return Some(ExecStatus::Miss { pc: target });
                }
                cur = target;
                continue;
            }
            // Plain continuation out of dispatch; treat like a chain hop.
            hops += 1;
            if hops >= self.cfg.max_chain_hops {
                return Some(ExecStatus::Miss { pc: r as u64 });
            }
            cur = r as u64;
        }
    }

    fn bump_region_hits(&mut self, base: u64, tier: Tier) {
        let hits = self.region_hits.entry(base).or_insert(0);
        let old = *hits;
        *hits = old.saturating_add(1);
        if tier == Tier::Baseline
            && old < self.cfg.optimize_threshold
            && *hits >= self.cfg.optimize_threshold
        {
            tracing::debug!(base, "promoting region to optimized tier");
            self.stats.promotions += 1;
            self.enqueue(base, Tier::Optimized, 1.0, false);
        }
    }

    // === Trace prediction === //

    fn note_transition(&mut self, from_base: u64, to_pc: u64) {
        self.note_entry(to_pc);
        let to_base = region_base(to_pc);
        self.age_counter += 1;

        // First-order edge.
        self.bound_markov1();
        let row = self.markov1.entry(from_base).or_default();
        *row.entry(to_base).or_insert(0) += 1;
        let edge_count = row[&to_base];
        let row_sum: u32 = row.values().sum();
        self.markov1_age.insert(from_base, self.age_counter);

        // Second-order triplet keyed on the previous two regions.
        let mut triplet_count = 0;
        if let Some(prev) = self.prev_region {
            self.bound_markov2();
            let row2 = self.markov2.entry((prev, from_base)).or_default();
            *row2.entry(to_base).or_insert(0) += 1;
            triplet_count = row2[&to_base];
            self.markov2_age.insert((prev, from_base), self.age_counter);
        }

        // Direct promotion of busy edges and triplets.
        if !self.regions.contains_key(&to_base) {
            if edge_count >= self.adaptive_edge_threshold() {
                let confidence = edge_count as f64 / row_sum.max(1) as f64;
                self.enqueue(to_base, Tier::Baseline, confidence, false);
            } else if triplet_count >= self.adaptive_triplet_threshold() {
                self.enqueue(to_base, Tier::Baseline, 0.75, false);
            }
        }

        self.run_predictor(from_base, to_base);
        self.prev_region = Some(from_base);
    }

    /// Enqueues up to `predictor_top_k` likely successors of the region we
    /// just transitioned into, if their confidence beats the adaptive
    /// threshold. Second-order matches get a 10% confidence boost.
    fn run_predictor(&mut self, from_base: u64, to_base: u64) {
        let threshold = self.adaptive_confidence_threshold();
        let mut candidates: FxHashMap<u64, f64> = FxHashMap::default();

        if let Some(row) = self.markov1.get(&to_base) {
            let sum: u32 = row.values().sum();
            for (&t, &c) in row {
                let conf = c as f64 / sum.max(1) as f64;
                let e = candidates.entry(t).or_insert(0.0);
                *e = e.max(conf);
            }
        }
        if let Some(row) = self.markov2.get(&(from_base, to_base)) {
            let sum: u32 = row.values().sum();
            for (&t, &c) in row {
                let conf = (c as f64 / sum.max(1) as f64) * 1.1;
                let e = candidates.entry(t).or_insert(0.0);
                *e = e.max(conf);
            }
        }

        let mut ranked: Vec<(u64, f64)> = candidates
            .into_iter()
            .filter(|(base, conf)| *conf >= threshold && !self.regions.contains_key(base))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(self.cfg.predictor_top_k);
        for (base, conf) in ranked {
            tracing::trace!(base, conf, "predictor enqueue");
            self.enqueue(base, Tier::Baseline, conf, true);
        }
    }

    fn queue_pressure(&self) -> f64 {
        self.queue.len() as f64 / self.cfg.queue_max.max(1) as f64
    }

    fn miss_rate(&self) -> f64 {
        if self.stats.dispatches == 0 {
            return 0.0;
        }
        self.stats.region_misses as f64 / self.stats.dispatches as f64
    }

    fn adaptive_confidence_threshold(&self) -> f64 {
        let t = self.cfg.base_confidence + self.queue_pressure() * 0.25
            - self.miss_rate().min(0.5) * 0.2;
        t.clamp(0.15, 0.95)
    }

    fn adaptive_edge_threshold(&self) -> u32 {
        let scale = 1.0 + self.queue_pressure() * 0.5 - self.miss_rate().min(0.5) * 0.25;
        ((self.cfg.edge_threshold as f64 * scale).max(2.0)) as u32
    }

    fn adaptive_triplet_threshold(&self) -> u32 {
        let scale = 1.0 + self.queue_pressure() * 0.5 - self.miss_rate().min(0.5) * 0.25;
        ((self.cfg.triplet_threshold as f64 * scale).max(2.0)) as u32
    }

    fn bound_markov1(&mut self) {
        if self.markov1.len() < self.cfg.markov_max_rows {
            return;
        }
        if let Some((&oldest, _)) = self.markov1_age.iter().min_by_key(|(_, age)| **age) {
            self.markov1.remove(&oldest);
            self.markov1_age.remove(&oldest);
        }
    }

    fn bound_markov2(&mut self) {
        if self.markov2.len() < self.cfg.markov_max_rows {
            return;
        }
        if let Some((&oldest, _)) = self.markov2_age.iter().min_by_key(|(_, age)| **age) {
            self.markov2.remove(&oldest);
            self.markov2_age.remove(&oldest);
        }
    }

    // === Queueing === //

    fn enqueue(&mut self, base: u64, tier: Tier, confidence: f64, predicted: bool) {
        if base >= abi::RET_MISS_BIT as u64 {
            return; // outside the encodable pc range; interpreter only
        }
        if let Some(r) = self.regions.get(&base) {
            if tier_rank(r.tier) >= tier_rank(tier) {
                return;
            }
        }
        if let Some(t) = self.inflight.get(&base) {
            if tier_rank(*t) >= tier_rank(tier) {
                return;
            }
        }
        if let Some(f) = self.failures.get(&base) {
            if Instant::now() < f.until {
                tracing::trace!(base, failures = f.count, "enqueue rejected: cooling");
                return;
            }
        }

        let demand = self.demand.entry(base).or_insert(0);
        *demand += 1;
        let miss_cost = 1.0 + (1.0 + *demand as f64).log2();
        let priority = confidence * miss_cost;

        if let Some(task) = self.queue.iter_mut().find(|t| t.base == base) {
            if tier_rank(tier) > tier_rank(task.tier) {
                task.tier = tier;
            }
            task.priority = task.priority.max(priority);
        } else if self.queue.len() >= self.cfg.queue_max {
            let (idx, lowest) = self
                .queue
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.priority.total_cmp(&b.1.priority))
                .map(|(i, t)| (i, t.priority))
                .expect("queue non-empty");
            if priority > lowest {
                self.stats.queue_evictions += 1;
                self.queue[idx] = CompileTask { base, tier, priority };
            } else {
                self.stats.queue_drops += 1;
                return;
            }
        } else {
            self.queue.push(CompileTask { base, tier, priority });
        }
        if predicted {
            self.predicted.insert(base);
        }
    }

    // === Scheduler tick === //

    /// Collects finished compiles, refills the token bucket and launches
    /// new compile tasks. Called from the execution loop between quanta.
    pub fn tick(&mut self, arena: &Arena) {
        self.collect_finished();
        self.refill_tokens(Instant::now());

        while self.tokens >= 1.0
            && self.inflight.len() < self.cfg.max_concurrent_compiles
            && !self.queue.is_empty()
        {
            let idx = self
                .queue
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.priority.total_cmp(&b.1.priority))
                .map(|(i, _)| i)
                .expect("queue non-empty");
            let task = self.queue.swap_remove(idx);

            if let Some(f) = self.failures.get(&task.base) {
                if Instant::now() < f.until {
                    continue;
                }
            }

            let entries: Vec<u64> = self
                .region_entries
                .get(&task.base)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_else(|| vec![task.base]);
            let region = build_region(arena, task.base, &entries);
            match translate_region(&region, task.tier, self.arena_pages) {
                Ok(tr) => {
                    self.tokens -= 1.0;
                    self.inflight.insert(task.base, task.tier);
                    self.worker.submit(CompileRequest {
                        base: tr.base,
                        tier: task.tier,
                        epoch: self.epoch,
                        wasm: tr.wasm,
                    });
                }
                Err(e) => {
                    self.record_failure(task.base, e.to_string());
                }
            }
        }
    }

    fn collect_finished(&mut self) {
        while let Some(rep) = self.worker.try_recv() {
            self.inflight.remove(&rep.base);
            if rep.epoch != self.epoch || self.stale_inflight.remove(&rep.base) {
                continue;
            }
            match rep.result {
                Ok(module) => match self.backend.instantiate(&module) {
                    Ok(func) => {
                        tracing::debug!(base = rep.base, tier = ?rep.tier, "region compiled");
                        self.stats.compiles_ok += 1;
                        self.failures.remove(&rep.base);
                        self.regions.insert(
                            rep.base,
                            CompiledRegion {
                                tier: rep.tier,
                                func,
                                block_count: 0,
                            },
                        );
                    }
                    Err(e) => self.record_failure(rep.base, e.to_string()),
                },
                Err(e) => self.record_failure(rep.base, e),
            }
        }
    }

    fn refill_tokens(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        let cap = self.cfg.compile_budget_per_second.max(1.0);
        self.tokens = (self.tokens + elapsed * self.cfg.compile_budget_per_second).min(cap);
    }

    fn record_failure(&mut self, base: u64, error: String) {
        self.stats.compiles_failed += 1;
        let entry = self.failures.entry(base).or_insert(Failure {
            count: 0,
            until: Instant::now(),
            last_error: String::new(),
        });
        entry.count += 1;
        entry.until = Instant::now() + failure_cooldown(entry.count);
        tracing::warn!(base, failures = entry.count, error = %error, "region compile failed");
        entry.last_error = error;
    }

    /// Compiles a region synchronously (ahead-of-time path and tests).
    pub fn compile_now(&mut self, arena: &Arena, pc: u64, tier: Tier) -> Result<()> {
        let base = region_base(pc);
        self.note_entry(pc);
        let entries: Vec<u64> = self
            .region_entries
            .get(&base)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_else(|| vec![pc]);
        let region = build_region(arena, base, &entries);
        let tr = translate_region(&region, tier, self.arena_pages)?;
        let module = self.backend.compile(&tr.wasm)?;
        let func = self.backend.instantiate(&module)?;
        self.stats.compiles_ok += 1;
        self.regions.insert(
            base,
            CompiledRegion {
                tier,
                func,
                block_count: tr.block_count,
            },
        );
        Ok(())
    }

    // === Invalidation and reset === //

    /// Removes every compiled region overlapping `[addr, addr+len)` and
    /// prunes all scheduling state that refers to it. Must run before any
    /// subsequent guest execution of those addresses.
    pub fn invalidate(&mut self, addr: u64, len: u64) {
        self.stats.invalidations += 1;
        let end = addr.saturating_add(len.max(1));
        let overlaps = |base: u64| base < end && base + REGION_SIZE > addr;

        let bases: Vec<u64> = self.regions.keys().copied().filter(|b| overlaps(*b)).collect();
        for base in bases {
            self.regions.remove(&base);
        }

        self.queue.retain(|t| !overlaps(t.base));
        self.region_hits.retain(|b, _| !overlaps(*b));
        self.region_entries.retain(|b, _| !overlaps(*b));
        self.demand.retain(|b, _| !overlaps(*b));

        self.markov1.retain(|b, _| !overlaps(*b));
        self.markov1_age.retain(|b, _| !overlaps(*b));
        for row in self.markov1.values_mut() {
            row.retain(|b, _| !overlaps(*b));
        }
        self.markov2.retain(|(a, b), _| !overlaps(*a) && !overlaps(*b));
        self.markov2_age.retain(|(a, b), _| !overlaps(*a) && !overlaps(*b));
        for row in self.markov2.values_mut() {
            row.retain(|b, _| !overlaps(*b));
        }

        let before = self.predicted.len();
        self.predicted.retain(|b| !overlaps(*b));
        self.stats.predictor_misses += (before - self.predicted.len()) as u64;

        for page in (addr >> PAGE_SHIFT)..((end + PAGE_SIZE - 1) >> PAGE_SHIFT) {
            self.page_hits.remove(&page);
            self.dirty_pages.insert(page);
        }

        for (base, _) in self.inflight.iter() {
            if overlaps(*base) {
                self.stale_inflight.insert(*base);
            }
        }
        if self.prev_region.map_or(false, overlaps) {
            self.prev_region = None;
        }
    }

    /// Drops all JIT state; used by execve.
    pub fn reset(&mut self) {
        self.regions.clear();
        self.page_hits.clear();
        self.region_hits.clear();
        self.region_entries.clear();
        self.queue.clear();
        self.demand.clear();
        self.markov1.clear();
        self.markov2.clear();
        self.markov1_age.clear();
        self.markov2_age.clear();
        self.stats.predictor_misses += self.predicted.len() as u64;
        self.predicted.clear();
        self.dirty_pages.clear();
        self.prev_region = None;
        self.failures.clear();
        self.stale_inflight.clear();
        self.epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager() -> JitManager {
        // 16 wasm pages = 1 MiB arena: plenty for unit tests.
        JitManager::new(JitConfig::default(), 16).unwrap()
    }

    fn arena_for(m: &mut JitManager) -> Arena {
        let (ptr, len) = m.arena_view();
        unsafe { Arena::from_raw(ptr, len) }
    }

    fn asm(arena: &mut Arena, addr: u64, words: &[u32]) {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        arena.poke(addr, &bytes).unwrap();
    }

    #[test]
    fn token_bucket_refills_and_caps() {
        let mut m = manager();
        m.tokens = 0.0;
        let start = m.last_refill;
        m.refill_tokens(start + Duration::from_millis(500));
        assert!((m.tokens - 3.0).abs() < 0.01);
        m.refill_tokens(start + Duration::from_secs(100));
        assert!((m.tokens - 6.0).abs() < 0.01, "bucket caps at the refill rate");
    }

    #[test]
    fn adaptive_threshold_clamps() {
        let mut m = manager();
        assert!((m.adaptive_confidence_threshold() - 0.3).abs() < 1e-9);
        // Full queue raises it; heavy misses lower it.
        for i in 0..m.cfg.queue_max {
            m.queue.push(CompileTask { base: (i as u64) * REGION_SIZE, tier: Tier::Baseline, priority: 1.0 });
        }
        assert!((m.adaptive_confidence_threshold() - 0.55).abs() < 1e-9);
        m.queue.clear();
        m.stats.dispatches = 100;
        m.stats.region_misses = 100;
        assert!((m.adaptive_confidence_threshold() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn queue_eviction_prefers_higher_priority() {
        let mut m = manager();
        m.cfg.queue_max = 2;
        m.enqueue(0x0000, Tier::Baseline, 0.2, false);
        m.enqueue(0x4000, Tier::Baseline, 0.2, false);
        // Equal priority incoming is dropped, strictly higher evicts.
        m.enqueue(0x8000, Tier::Baseline, 0.2, false);
        assert_eq!(m.stats.queue_drops, 1);
        m.enqueue(0xc000, Tier::Baseline, 0.9, false);
        assert_eq!(m.stats.queue_evictions, 1);
        assert_eq!(m.queue.len(), 2);
        assert!(m.queue.iter().any(|t| t.base == 0xc000));
    }

    #[test]
    fn hot_page_enqueues_once() {
        let mut m = manager();
        for _ in 0..49 {
            m.on_interp_block(0x2000, 1);
        }
        assert_eq!(m.queue.len(), 0);
        m.on_interp_block(0x2000, 1);
        assert_eq!(m.queue.len(), 1);
        m.on_interp_block(0x2000, 10);
        assert_eq!(m.queue.len(), 1, "crossing fires a single enqueue");
        assert_eq!(m.stats.hot_enqueues, 1);
    }

    #[test]
    fn invalidate_prunes_everything() {
        let mut m = manager();
        m.enqueue(0x4000, Tier::Baseline, 0.5, true);
        m.markov1.insert(0x4000, FxHashMap::default());
        m.markov1.entry(0x0).or_default().insert(0x4000, 3);
        m.markov2.insert((0x0, 0x4000), FxHashMap::default());
        m.region_hits.insert(0x4000, 7);
        m.on_interp_block(0x4100, 1);

        m.invalidate(0x4000, 0x100);

        assert!(m.queue.is_empty());
        assert!(!m.markov1.contains_key(&0x4000));
        assert!(m.markov1[&0x0].is_empty());
        assert!(m.markov2.is_empty());
        assert!(!m.region_hits.contains_key(&0x4000));
        assert!(m.predicted.is_empty());
        assert_eq!(m.stats.predictor_misses, 1);
        assert!(m.page_hits.is_empty());
    }

    #[test]
    fn cooling_region_rejects_enqueues() {
        let mut m = manager();
        m.record_failure(0x4000, "synthetic".to_string());
        m.enqueue(0x4000, Tier::Baseline, 0.9, false);
        assert!(m.queue.is_empty());
    }

    #[test]
    fn straight_line_region_executes() {
        let mut m = manager();
        let mut arena = arena_for(&mut m);
        // addi x5, x0, 7 ; add x6, x5, x5 ; ecall
        asm(&mut arena, 0x1000, &[0x0070_0293, 0x0052_8333, 0x0000_0073]);
        m.compile_now(&arena, 0x1000, Tier::Baseline).unwrap();
        assert!(m.has_region(0x1000));

        let status = m.execute(0x1000).unwrap();
        assert_eq!(status, ExecStatus::Syscall { pc: 0x1008 });
        assert_eq!(arena.peek_u64(arena::state::xreg_offset(5)).unwrap(), 7);
        assert_eq!(arena.peek_u64(arena::state::xreg_offset(6)).unwrap(), 14);
    }

    #[test]
    fn loop_region_executes_under_regcache() {
        let mut m = manager();
        let mut arena = arena_for(&mut m);
        // addi x5, x0, 0 ; addi x6, x0, 10 ;
        // loop: addi x5, x5, 1 ; bne x5, x6, loop ; ecall
        asm(
            &mut arena,
            0x1000,
            &[0x0000_0293, 0x00a0_0313, 0x0012_8293, 0xfe62_9ee3, 0x0000_0073],
        );
        m.compile_now(&arena, 0x1000, Tier::Optimized).unwrap();
        let status = m.execute(0x1000).unwrap();
        assert_eq!(status, ExecStatus::Syscall { pc: 0x1010 });
        assert_eq!(arena.peek_u64(arena::state::xreg_offset(5)).unwrap(), 10);
    }

    #[test]
    fn miss_outside_any_region_falls_back() {
        let mut m = manager();
        let mut arena = arena_for(&mut m);
        // jalr x0, 0(x5) with x5 pointing far away.
        asm(&mut arena, 0x1000, &[0x0002_8067]);
        arena.poke_u64(arena::state::xreg_offset(5), 0x9000).unwrap();
        m.compile_now(&arena, 0x1000, Tier::Baseline).unwrap();
        let status = m.execute(0x1000).unwrap();
        assert_eq!(status, ExecStatus::Miss { pc: 0x9000 });
        assert_eq!(m.stats.region_misses, 1);
        // The transition was recorded for the predictor.
        assert_eq!(m.markov1[&0x0000][&0x8000], 1);
    }

    #[test]
    fn untranslated_pc_in_own_region_does_not_livelock() {
        let mut m = manager();
        let mut arena = arena_for(&mut m);
        // Entry jumps to an address in the same region that holds an
        // untranslatable instruction (amoadd.w).
        asm(&mut arena, 0x1000, &[0x0100_006f]); // jal x0, +16 -> 0x1010
        asm(&mut arena, 0x1010, &[0x0053_a32f]); // amoadd.w
        m.compile_now(&arena, 0x1000, Tier::Baseline).unwrap();
        let status = m.execute(0x1000).unwrap();
        assert_eq!(status, ExecStatus::Miss { pc: 0x1010 });
    }
}
