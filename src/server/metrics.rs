//! Prometheus metrics for the cache server.

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};

use crate::cache::builder::BuilderStats;

pub struct CacheMetrics {
    registry: Registry,

    /// Snapshot queries by result (hit / miss).
    queries: IntCounterVec,
    updates: IntCounter,
    pub splits: IntCounter,
    pub evictions: IntCounter,
    pub seals: IntCounter,

    version: IntGauge,
    entries: IntGauge,
    live_blocks: IntGauge,
    pending_blocks: IntGauge,
}

impl CacheMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let queries = register_int_counter_vec_with_registry!(
            "kv_cache_queries_total",
            "Snapshot queries by result",
            &["result"],
            registry
        )?;
        let updates = register_int_counter_with_registry!(
            "kv_cache_updates_total",
            "Accepted KV state updates",
            registry
        )?;
        let splits = register_int_counter_with_registry!(
            "kv_cache_splits_total",
            "Block splits caused by updates",
            registry
        )?;
        let evictions = register_int_counter_with_registry!(
            "kv_cache_evictions_total",
            "Entries evicted",
            registry
        )?;
        let seals = register_int_counter_with_registry!(
            "kv_cache_seals_total",
            "Published cache revisions",
            registry
        )?;
        let version = register_int_gauge_with_registry!(
            "kv_cache_builder_version",
            "Version of the open revision",
            registry
        )?;
        let entries = register_int_gauge_with_registry!(
            "kv_cache_entries",
            "Cached entries in the open revision",
            registry
        )?;
        let live_blocks = register_int_gauge_with_registry!(
            "kv_cache_live_blocks",
            "Live blocks in the open revision",
            registry
        )?;
        let pending_blocks = register_int_gauge_with_registry!(
            "kv_cache_pending_blocks",
            "Blocks awaiting deletion at the next seal",
            registry
        )?;

        Ok(Self {
            registry,
            queries,
            updates,
            splits,
            evictions,
            seals,
            version,
            entries,
            live_blocks,
            pending_blocks,
        })
    }

    pub fn record_query(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.queries.with_label_values(&[result]).inc();
    }

    pub fn record_update(&self) {
        self.updates.inc();
    }

    /// Refresh the gauges from builder counters.
    pub fn observe(&self, stats: &BuilderStats) {
        self.version.set(stats.version as i64);
        self.entries.set(stats.entries as i64);
        self.live_blocks.set(stats.live_blocks as i64);
        self.pending_blocks.set(stats.pending_blocks as i64);
    }

    pub fn queries(&self, hit: bool) -> u64 {
        let result = if hit { "hit" } else { "miss" };
        self.queries.with_label_values(&[result]).get()
    }

    /// Text exposition of every registered metric.
    pub fn encode(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = String::new();
        encoder.encode_utf8(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}
