//! Metrics for the collector
//!
//! Counters updated by the queue worker plus a system snapshot, serialized
//! as JSON by the metrics server.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// The job the worker is currently running
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveJobMetrics {
    pub id: String,
    pub title_id: String,
    pub task: String,
    /// Chapter being worked on
    pub chapter_index: Option<u32>,
    pub chapters_done: usize,
    pub chapters_total: usize,
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub active_job: Option<ActiveJobMetrics>,
    pub system: SystemMetrics,
    pub queue_len: usize,
    pub worker_active: bool,
    pub worker_starts: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub chapters_downloaded: u64,
    pub chapters_failed: u64,
    pub chapters_translated: u64,
    pub chapters_skipped: u64,
    pub chapters_removed: u64,
    pub pages_fetched: u64,
    pub pages_reused: u64,
    pub images_skipped: u64,
}

/// Shared metrics state for concurrent access across components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Current time in unix milliseconds
pub fn now_unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}
