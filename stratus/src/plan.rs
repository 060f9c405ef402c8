//! Resource planner: sizes the two worker lanes from host CPU and memory.
//!
//! The blocking lane is CPU-led and memory-capped; the non-blocking lane
//! takes whatever memory is left. Both lanes always get at least one slot
//! so a small host still makes progress.

use serde::{Deserialize, Serialize};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Tunables for the worker plan.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlannerConfig {
    /// Multiplier from cores to blocking workers.
    pub cpu_mult: f64,
    /// Memory budget per blocking slot, in gigabytes.
    pub per_blocking_gb: f64,
    /// Memory budget per non-blocking slot, in gigabytes.
    pub per_nonblocking_gb: f64,
    /// Fraction of usable memory the blocking lane may claim.
    pub blocking_mem_pct: f64,
    /// Cap on blocking workers when not deploying.
    pub local_blocking_cap: usize,
    /// Memory withheld from the plan, in gigabytes.
    pub reserved_floor_gb: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            cpu_mult: 2.0,
            per_blocking_gb: 0.25,
            per_nonblocking_gb: 0.15,
            blocking_mem_pct: 0.6,
            local_blocking_cap: 4,
            reserved_floor_gb: 0.5,
        }
    }
}

/// Worker counts for the two lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerPlan {
    /// Long-lived workers on the blocking lane, one execution slot each.
    pub blocking_workers: usize,
    /// Execution slots of the single non-blocking worker.
    pub nonblocking_slots: usize,
}

impl WorkerPlan {
    /// Compute the plan for a host with `cpus` cores and `mem_gb` gigabytes
    /// of available memory.
    pub fn compute(cpus: usize, mem_gb: f64, config: &PlannerConfig, deploy: bool) -> Self {
        let usable_gb = (mem_gb - config.reserved_floor_gb).max(0.0);

        let by_cpu = (cpus as f64 * config.cpu_mult).floor() as usize;
        let by_mem =
            (usable_gb * config.blocking_mem_pct / config.per_blocking_gb).floor() as usize;
        let mut blocking_workers = by_cpu.min(by_mem).max(1);
        if !deploy {
            blocking_workers = blocking_workers.min(config.local_blocking_cap.max(1));
        }

        let remaining_gb = (usable_gb - blocking_workers as f64 * config.per_blocking_gb).max(0.0);
        let nonblocking_slots = ((remaining_gb / config.per_nonblocking_gb).floor() as usize).max(1);

        WorkerPlan {
            blocking_workers,
            nonblocking_slots,
        }
    }

    /// Compute the plan from detected host resources.
    pub fn detect(config: &PlannerConfig, deploy: bool) -> Self {
        let (cpus, mem_gb) = detect_resources();
        let plan = Self::compute(cpus, mem_gb, config, deploy);
        tracing::info!(
            cpus,
            mem_gb = format!("{mem_gb:.1}"),
            blocking_workers = plan.blocking_workers,
            nonblocking_slots = plan.nonblocking_slots,
            deploy,
            "Computed worker plan"
        );
        plan
    }
}

/// Host CPU count and available memory in gigabytes.
pub fn detect_resources() -> (usize, f64) {
    let mut sys = sysinfo::System::new();
    sys.refresh_cpu_list(sysinfo::CpuRefreshKind::nothing());
    sys.refresh_memory();
    let cpus = sys.cpus().len().max(1);
    let mem_gb = sys.available_memory() as f64 / BYTES_PER_GB;
    (cpus, mem_gb)
}
