//! Auto-scaling decisions and resource sampling

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

/// Host resource usage, both ratios in `[0, 1]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_ratio: f64,
    pub cpu_ratio: f64,
}

/// Source of resource usage samples
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Samples system memory and global CPU usage
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_memory(MemoryRefreshKind::everything())
                .with_cpu(CpuRefreshKind::everything()),
        );
        Self {
            system: Mutex::new(system),
        }
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&self) -> ResourceUsage {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_cpu_usage();

        let total = system.total_memory();
        let memory_ratio = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64
        };

        ResourceUsage {
            memory_ratio,
            cpu_ratio: (system.global_cpu_usage() as f64 / 100.0).clamp(0.0, 1.0),
        }
    }
}

/// Probe returning a fixed, adjustable value
#[derive(Debug, Default)]
pub struct StaticProbe {
    usage: Mutex<ResourceUsage>,
}

impl StaticProbe {
    pub fn new(usage: ResourceUsage) -> Self {
        Self {
            usage: Mutex::new(usage),
        }
    }

    pub fn set(&self, usage: ResourceUsage) {
        *self.usage.lock() = usage;
    }
}

impl ResourceProbe for StaticProbe {
    fn sample(&self) -> ResourceUsage {
        *self.usage.lock()
    }
}

/// Inputs to one scaling tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingInput {
    pub workers: usize,
    pub idle_workers: usize,
    pub queue_depth: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub under_pressure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    Hold,
    ScaleTo(usize),
}

/// Pick a worker count for the next tick
///
/// Grows to half the queue depth when the backlog exceeds twice the worker
/// count and the host has headroom. Shrinks by one idle worker when the
/// queue is empty or the host is under pressure. Never leaves
/// `[min_workers, max_workers]`.
pub fn decide(input: ScalingInput) -> ScalingDecision {
    let ScalingInput {
        workers,
        idle_workers,
        queue_depth,
        min_workers,
        max_workers,
        under_pressure,
    } = input;

    if workers < min_workers {
        return ScalingDecision::ScaleTo(min_workers);
    }
    if workers > max_workers {
        return ScalingDecision::ScaleTo(max_workers);
    }

    if !under_pressure && queue_depth > workers * 2 && workers < max_workers {
        let target = queue_depth.div_ceil(2).clamp(workers + 1, max_workers);
        return ScalingDecision::ScaleTo(target);
    }

    if (under_pressure || queue_depth == 0) && idle_workers > 0 && workers > min_workers {
        return ScalingDecision::ScaleTo(workers - 1);
    }

    ScalingDecision::Hold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(workers: usize, idle: usize, depth: usize, pressure: bool) -> ScalingInput {
        ScalingInput {
            workers,
            idle_workers: idle,
            queue_depth: depth,
            min_workers: 1,
            max_workers: 8,
            under_pressure: pressure,
        }
    }

    #[test]
    fn test_scale_up_on_backlog() {
        assert_eq!(decide(input(2, 0, 5, false)), ScalingDecision::ScaleTo(3));
        assert_eq!(decide(input(2, 0, 4, false)), ScalingDecision::Hold);
        assert_eq!(decide(input(2, 0, 40, false)), ScalingDecision::ScaleTo(8));
        assert_eq!(decide(input(8, 0, 40, false)), ScalingDecision::Hold);
    }

    #[test]
    fn test_pressure_blocks_growth_and_sheds_idle() {
        assert_eq!(decide(input(2, 0, 40, true)), ScalingDecision::Hold);
        assert_eq!(decide(input(3, 1, 40, true)), ScalingDecision::ScaleTo(2));
    }

    #[test]
    fn test_scale_down_when_queue_empty() {
        assert_eq!(decide(input(4, 2, 0, false)), ScalingDecision::ScaleTo(3));
        assert_eq!(decide(input(1, 1, 0, false)), ScalingDecision::Hold);
        // Busy workers are never removed
        assert_eq!(decide(input(4, 0, 0, false)), ScalingDecision::Hold);
    }

    #[test]
    fn test_bounds_are_restored() {
        assert_eq!(decide(input(0, 0, 0, false)), ScalingDecision::ScaleTo(1));
        assert_eq!(decide(input(10, 10, 0, false)), ScalingDecision::ScaleTo(8));
    }

    #[test]
    fn test_static_probe() {
        let probe = StaticProbe::default();
        assert_eq!(probe.sample(), ResourceUsage::default());
        probe.set(ResourceUsage {
            memory_ratio: 0.5,
            cpu_ratio: 0.25,
        });
        assert_eq!(probe.sample().memory_ratio, 0.5);
    }
}
