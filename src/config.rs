use serde::{Deserialize, Serialize};

/// Which build the engine runs inside. Only the operator opt-out flag cares:
/// it suppresses in `Production` and is ignored in `Development`, so the
/// pipeline stays observable while developing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeEnv {
    Development,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub env: RuntimeEnv,
    /// Extra user-agent substrings treated as automation, on top of the
    /// built-in list. Matched case-insensitively.
    pub extra_bot_markers: Vec<String>,
    /// Per-day cap on distinct route keys held in one document. 0 disables
    /// pruning. Applies to stores that keep whole documents in memory.
    pub max_routes_per_day: usize,
    /// Buffered capacity of the change feed; slow subscribers past this
    /// lag out with a terminal error.
    pub feed_capacity: usize,
    /// How long enqueued events sit in the batcher before its background
    /// loop folds them into one grouped store write.
    pub batch_flush_interval_ms: u64,
    /// Retries for a busy SQLite connection before the write is dropped.
    pub sqlite_busy_retries: u32,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            env: RuntimeEnv::Production,
            extra_bot_markers: Vec::new(),
            max_routes_per_day: 200,
            feed_capacity: 64,
            batch_flush_interval_ms: 1_000,
            sqlite_busy_retries: 3,
        }
    }
}

impl AnalyticsConfig {
    pub fn new() -> Self {
        Self::default()
    }
}
