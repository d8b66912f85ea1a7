//! Concurrency planning for Toonkor Collector
//!
//! Derives the page download pool size from CPU core count and configuration.

use crate::config::Config;

/// Upper bound for the auto-derived page pool.
const MAX_AUTO_PAGE_WORKERS: u32 = 32;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Concurrent page fetches per chapter
    pub page_fetch_workers: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Page fetches are I/O bound, so the derived pool is `cores + 4`
    /// capped at 32. A non-zero `download.page_concurrency` wins.
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_with_cores(cfg, num_cpus::get() as u32)
    }

    pub fn derive_with_cores(cfg: &Config, total_cores: u32) -> Self {
        let page_fetch_workers = if cfg.download.page_concurrency > 0 {
            cfg.download.page_concurrency
        } else {
            derive_page_workers(total_cores)
        };

        Self {
            total_cores,
            page_fetch_workers,
        }
    }
}

fn derive_page_workers(cores: u32) -> u32 {
    cores.saturating_add(4).clamp(1, MAX_AUTO_PAGE_WORKERS)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}
