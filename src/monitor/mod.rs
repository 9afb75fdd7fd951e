//! Host resource sampling and admission control.
//!
//! A [`ResourceMonitor`] turns probe readings into two decisions: whether a
//! new conversion may start right now ([`ResourceMonitor::admission`]) and
//! how many workers the pool should run ([`ResourceMonitor::optimal_concurrency`]).
//! A failed reading degrades to [`ResourceSnapshot::zeroed`], which is never
//! admitted because it reports no free memory or disk.

mod probe;

pub use probe::{ResourceProbe, StaticProbe, SystemProbe};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// One reading of host utilization.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_available_gb: f64,
    pub disk_percent: f64,
    pub disk_free_gb: f64,
}

impl ResourceSnapshot {
    /// The reading used when the host could not be sampled.
    pub fn zeroed() -> Self {
        Self::default()
    }
}

/// Admission thresholds and pool sizing bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "default_usage_limit")]
    pub cpu_limit_percent: f64,

    #[serde(default = "default_usage_limit")]
    pub memory_limit_percent: f64,

    #[serde(default = "default_min_memory_gb")]
    pub min_memory_gb: f64,

    #[serde(default = "default_min_disk_gb")]
    pub min_disk_gb: f64,

    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// CPU load above which the pool shrinks to a quarter of the cores.
    #[serde(default = "default_high_cpu_percent")]
    pub high_cpu_percent: f64,

    /// CPU load above which the pool shrinks to half of the cores.
    #[serde(default = "default_medium_cpu_percent")]
    pub medium_cpu_percent: f64,
}

fn default_usage_limit() -> f64 {
    80.0
}

fn default_min_memory_gb() -> f64 {
    2.0
}

fn default_min_disk_gb() -> f64 {
    5.0
}

fn default_max_concurrent_jobs() -> usize {
    2
}

fn default_high_cpu_percent() -> f64 {
    70.0
}

fn default_medium_cpu_percent() -> f64 {
    50.0
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_limit_percent: default_usage_limit(),
            memory_limit_percent: default_usage_limit(),
            min_memory_gb: default_min_memory_gb(),
            min_disk_gb: default_min_disk_gb(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            high_cpu_percent: default_high_cpu_percent(),
            medium_cpu_percent: default_medium_cpu_percent(),
        }
    }
}

/// Result of an admission check. Denials carry the offending reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Admitted,
    CpuBusy { percent: f64, limit: f64 },
    MemoryBusy { percent: f64, limit: f64 },
    MemoryLow { available_gb: f64, min_gb: f64 },
    DiskLow { free_gb: f64, min_gb: f64 },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

impl fmt::Display for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Admission::Admitted => write!(f, "admitted"),
            Admission::CpuBusy { percent, limit } => {
                write!(f, "CPU at {percent:.1}% exceeds {limit:.1}%")
            }
            Admission::MemoryBusy { percent, limit } => {
                write!(f, "memory at {percent:.1}% exceeds {limit:.1}%")
            }
            Admission::MemoryLow {
                available_gb,
                min_gb,
            } => write!(f, "{available_gb:.2} GB memory available, need {min_gb:.2} GB"),
            Admission::DiskLow { free_gb, min_gb } => {
                write!(f, "{free_gb:.2} GB disk free, need {min_gb:.2} GB")
            }
        }
    }
}

/// Samples host resources and applies [`ResourceLimits`]. Cheap to clone.
#[derive(Clone)]
pub struct ResourceMonitor {
    probe: Arc<dyn ResourceProbe>,
    limits: ResourceLimits,
}

impl ResourceMonitor {
    pub fn new(probe: Arc<dyn ResourceProbe>, limits: ResourceLimits) -> Self {
        Self { probe, limits }
    }

    /// A monitor reading the real host, with disk space measured where job
    /// outputs are written.
    pub fn system(limits: ResourceLimits, output_dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(SystemProbe::new(output_dir)), limits)
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Take a reading on the current thread. Blocks for the CPU sampling
    /// interval with [`SystemProbe`].
    pub fn sample_blocking(&self) -> ResourceSnapshot {
        match self.probe.sample() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Failed to sample host resources, assuming none available");
                ResourceSnapshot::zeroed()
            }
        }
    }

    /// Take a reading without blocking the async runtime.
    pub async fn sample(&self) -> ResourceSnapshot {
        let monitor = self.clone();
        match tokio::task::spawn_blocking(move || monitor.sample_blocking()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Resource sampling task failed");
                ResourceSnapshot::zeroed()
            }
        }
    }

    /// First limit the reading violates, or [`Admission::Admitted`].
    pub fn admission(&self, snapshot: &ResourceSnapshot) -> Admission {
        let limits = &self.limits;
        let decision = if snapshot.cpu_percent > limits.cpu_limit_percent {
            Admission::CpuBusy {
                percent: snapshot.cpu_percent,
                limit: limits.cpu_limit_percent,
            }
        } else if snapshot.memory_percent > limits.memory_limit_percent {
            Admission::MemoryBusy {
                percent: snapshot.memory_percent,
                limit: limits.memory_limit_percent,
            }
        } else if snapshot.memory_available_gb < limits.min_memory_gb {
            Admission::MemoryLow {
                available_gb: snapshot.memory_available_gb,
                min_gb: limits.min_memory_gb,
            }
        } else if snapshot.disk_free_gb < limits.min_disk_gb {
            Admission::DiskLow {
                free_gb: snapshot.disk_free_gb,
                min_gb: limits.min_disk_gb,
            }
        } else {
            Admission::Admitted
        };

        if !decision.is_admitted() {
            debug!(reason = %decision, "Admission denied");
        }
        decision
    }

    pub fn can_admit(&self, snapshot: &ResourceSnapshot) -> bool {
        self.admission(snapshot).is_admitted()
    }

    /// Worker count for a pool started under `snapshot` on a host with
    /// `cores` logical CPUs.
    ///
    /// Never exceeds `min(max_concurrent_jobs, cores)` and never drops below
    /// 1, so higher CPU load can only lower the result.
    pub fn optimal_concurrency(&self, snapshot: &ResourceSnapshot, cores: usize) -> usize {
        let cores = cores.max(1);
        let ceiling = self.limits.max_concurrent_jobs.min(cores).max(1);

        let target = if snapshot.cpu_percent > self.limits.high_cpu_percent {
            (cores / 4).max(1)
        } else if snapshot.cpu_percent > self.limits.medium_cpu_percent {
            (cores / 2).max(2)
        } else {
            ceiling
        };

        target.min(ceiling)
    }
}
