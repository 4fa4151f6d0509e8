//! Usage accounting for LLM requests

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::provider::TokenUsage;

/// Per-agent request statistics, owned by the agent's state
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost: f64,
    pub requests: u64,
    pub failed_requests: u64,
}

impl RequestStats {
    pub fn add(&mut self, other: &RequestStats) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cost += other.cost;
        self.requests += other.requests;
        self.failed_requests += other.failed_requests;
    }

    pub fn from_usage(usage: &TokenUsage, cost: f64) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cached_tokens: usage.cache_read_tokens,
            cache_creation_tokens: usage.cache_creation_tokens,
            cost,
            requests: 1,
            failed_requests: 0,
        }
    }
}

/// Scan-wide usage counters shared across agents.
///
/// Cost is tracked in micro-dollars so updates stay atomic.
#[derive(Debug, Clone, Default)]
pub struct UsageCounters {
    inner: Arc<CounterCells>,
}

#[derive(Debug, Default)]
struct CounterCells {
    input: AtomicU64,
    output: AtomicU64,
    cached: AtomicU64,
    cache_creation: AtomicU64,
    cost_micro_usd: AtomicU64,
    requests: AtomicU64,
    failed_requests: AtomicU64,
}

/// Point-in-time snapshot of the counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost: f64,
    pub requests: u64,
    pub failed_requests: u64,
}

impl UsageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, usage: &TokenUsage, cost: f64) {
        let cells = &self.inner;
        cells.input.fetch_add(usage.input_tokens, Ordering::Relaxed);
        cells.output.fetch_add(usage.output_tokens, Ordering::Relaxed);
        cells.cached.fetch_add(usage.cache_read_tokens, Ordering::Relaxed);
        cells
            .cache_creation
            .fetch_add(usage.cache_creation_tokens, Ordering::Relaxed);
        cells
            .cost_micro_usd
            .fetch_add((cost * 1_000_000.0) as u64, Ordering::Relaxed);
        cells.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.inner.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let cells = &self.inner;
        UsageSnapshot {
            input_tokens: cells.input.load(Ordering::Relaxed),
            output_tokens: cells.output.load(Ordering::Relaxed),
            cached_tokens: cells.cached.load(Ordering::Relaxed),
            cache_creation_tokens: cells.cache_creation.load(Ordering::Relaxed),
            cost: cells.cost_micro_usd.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            requests: cells.requests.load(Ordering::Relaxed),
            failed_requests: cells.failed_requests.load(Ordering::Relaxed),
        }
    }
}
