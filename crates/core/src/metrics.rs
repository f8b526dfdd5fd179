//! Metrics module for clipmerge
//!
//! Shared snapshot of job, session and system state, serialized as JSON by the
//! metrics endpoint.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-job metrics tracking merge progress
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub id: String,
    pub session_id: String,
    pub stage: String,
    pub strategy: String,
    pub percent: f32,
    pub bytes_per_sec: f64,
    pub entries: usize,
    pub total_bytes: u64,
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot including jobs, system, and aggregate stats
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobMetrics>,
    pub system: SystemMetrics,
    pub active_sessions: usize,
    pub running_jobs: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub cancelled_jobs: u64,
    pub total_bytes_delivered: u64,
}

/// Finished jobs kept in a snapshot; older ones are dropped first.
pub const MAX_FINISHED_JOBS: usize = 50;

impl JobMetrics {
    pub fn is_finished(&self) -> bool {
        self.stage == "done" || self.stage == "failed"
    }
}

impl MetricsSnapshot {
    /// Inserts or replaces the metrics for one job, trims old finished jobs and
    /// recounts running ones.
    pub fn upsert_job(&mut self, job: JobMetrics) {
        match self.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job,
            None => self.jobs.push(job),
        }

        let finished = self.jobs.iter().filter(|j| j.is_finished()).count();
        let mut excess = finished.saturating_sub(MAX_FINISHED_JOBS);
        if excess > 0 {
            self.jobs.retain(|j| {
                if excess > 0 && j.is_finished() {
                    excess -= 1;
                    return false;
                }
                true
            });
        }

        self.running_jobs = self.jobs.iter().filter(|j| !j.is_finished()).count();
    }
}

/// Shared metrics state for concurrent access across sessions and jobs
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let mem_usage = if total_memory > 0 {
        (sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: sys.global_cpu_usage(),
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}
