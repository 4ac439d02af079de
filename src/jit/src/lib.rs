//! Runtime JIT management: hot-code detection, compile scheduling under a
//! token budget, Markov trace prediction, region invalidation, and the
//! wasmtime execution backend.

mod backend;
mod manager;
mod worker;

pub use backend::WasmBackend;
pub use manager::{JitManager, Stats};
pub use wasmgen::Tier;

use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("wasm backend: {0}")]
    Backend(String),
    #[error("translation: {0}")]
    Translate(#[from] wasmgen::Error),
    #[error("region {base:#x} is cooling down after {failures} failures")]
    Cooling { base: u64, failures: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of dispatching compiled code at a program counter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecStatus {
    /// Guest requested exit.
    Halt,
    /// An ecall was reached at `pc`; the syscall layer takes over.
    Syscall { pc: u64 },
    /// Control left compiled code at `pc`; the interpreter continues.
    Miss { pc: u64 },
}

#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Page hits before the containing region is enqueued for baseline
    /// compilation.
    pub hot_threshold: u32,
    /// Region dispatches before an optimized recompile is enqueued.
    pub optimize_threshold: u32,
    /// Token bucket refill rate; each compile costs one token.
    pub compile_budget_per_second: f64,
    pub max_concurrent_compiles: usize,
    /// Predictions enqueued per observed transition.
    pub predictor_top_k: usize,
    pub queue_max: usize,
    /// Base confidence for the adaptive predictor threshold.
    pub base_confidence: f64,
    /// Base count for trace-edge and triplet promotion.
    pub edge_threshold: u32,
    pub triplet_threshold: u32,
    /// Bound on Markov table rows before age-based eviction.
    pub markov_max_rows: usize,
    /// Cap on region-miss chain hops before interpreter fallback.
    pub max_chain_hops: u32,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            hot_threshold: 50,
            optimize_threshold: 200,
            compile_budget_per_second: 6.0,
            max_concurrent_compiles: 1,
            predictor_top_k: 2,
            queue_max: 32,
            base_confidence: 0.3,
            edge_threshold: 8,
            triplet_threshold: 4,
            markov_max_rows: 256,
            max_chain_hops: 16,
        }
    }
}

/// Exponential-backoff cooldown after a compile failure: doubling from two
/// seconds, capped at seven doublings and two minutes.
pub fn failure_cooldown(failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(7);
    let secs = 2u64 << doublings;
    Duration::from_secs(secs.min(120))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_doubles_and_caps() {
        assert_eq!(failure_cooldown(1), Duration::from_secs(2));
        assert_eq!(failure_cooldown(2), Duration::from_secs(4));
        assert_eq!(failure_cooldown(5), Duration::from_secs(32));
        assert_eq!(failure_cooldown(8), Duration::from_secs(120));
        assert_eq!(failure_cooldown(50), Duration::from_secs(120));
    }
}
