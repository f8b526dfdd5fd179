//! Resource planning for clipmerge
//!
//! Derives download parallelism and external-tool slots from the CPU core count and
//! configuration.

use clipmerge_config::Config;

/// Resource limits shared by every job in the process
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePlan {
    /// Logical CPU cores detected
    pub total_cores: u32,
    /// Entries fetched concurrently within one job
    pub download_concurrency: usize,
    /// External tool runs allowed at once across all sessions
    pub tool_slots: usize,
}

impl ResourcePlan {
    /// Derive a plan from configuration, detecting cores via num_cpus.
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_for_cores(cfg, num_cpus::get() as u32)
    }

    /// Derive a plan for a known core count.
    ///
    /// - `download_concurrency`: explicit if non-zero, else `clamp(cores / 2, 1, 4)`
    /// - `tool_slots`: explicit if non-zero, else 1 below 8 cores, 2 otherwise
    pub fn derive_for_cores(cfg: &Config, total_cores: u32) -> Self {
        let download_concurrency = if cfg.pipeline.download_concurrency > 0 {
            cfg.pipeline.download_concurrency as usize
        } else {
            derive_downloads(total_cores)
        };

        let tool_slots = if cfg.pipeline.tool_slots > 0 {
            cfg.pipeline.tool_slots as usize
        } else {
            derive_tool_slots(total_cores)
        };

        Self {
            total_cores,
            download_concurrency,
            tool_slots,
        }
    }
}

fn derive_downloads(cores: u32) -> usize {
    ((cores / 2) as usize).clamp(1, 4)
}

fn derive_tool_slots(cores: u32) -> usize {
    if cores >= 8 {
        2
    } else {
        1
    }
}
