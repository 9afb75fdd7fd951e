//! Host resource readings.

use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use sysinfo::System;
use transq_common::{Error, Result};

use super::ResourceSnapshot;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Source of [`ResourceSnapshot`]s.
///
/// `sample` may block (CPU usage is measured over a short interval), so
/// async callers should go through [`ResourceMonitor::sample`](super::ResourceMonitor::sample).
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> Result<ResourceSnapshot>;
}

/// Reads the real host: CPU and memory through `sysinfo`, free space of the
/// filesystem holding `disk_path` through `fs2`.
pub struct SystemProbe {
    system: Mutex<System>,
    disk_path: PathBuf,
}

impl SystemProbe {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            disk_path: disk_path.into(),
        }
    }

    pub fn disk_path(&self) -> &Path {
        &self.disk_path
    }
}

/// The closest ancestor of `path` that exists, so an output directory that
/// has not been created yet still maps to its filesystem.
fn existing_ancestor(path: &Path) -> &Path {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .unwrap_or_else(|| Path::new("."))
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> Result<ResourceSnapshot> {
        let (cpu_percent, total_memory, available_memory) = {
            let mut system = self.system.lock();
            // Usage is the delta between two refreshes.
            system.refresh_cpu();
            std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
            system.refresh_cpu();
            system.refresh_memory();
            (
                f64::from(system.global_cpu_info().cpu_usage()),
                system.total_memory(),
                system.available_memory(),
            )
        };

        if total_memory == 0 {
            return Err(Error::internal("memory statistics unavailable"));
        }
        let memory_percent =
            total_memory.saturating_sub(available_memory) as f64 / total_memory as f64 * 100.0;

        let disk = existing_ancestor(&self.disk_path);
        let disk_free = fs2::available_space(disk)?;
        let disk_total = fs2::total_space(disk)?;
        let disk_percent = if disk_total == 0 {
            0.0
        } else {
            disk_total.saturating_sub(disk_free) as f64 / disk_total as f64 * 100.0
        };

        Ok(ResourceSnapshot {
            cpu_percent,
            memory_percent,
            memory_available_gb: available_memory as f64 / BYTES_PER_GB,
            disk_percent,
            disk_free_gb: disk_free as f64 / BYTES_PER_GB,
        })
    }
}

/// A probe that reports whatever reading it was last given. `None` makes
/// every sample fail, which exercises the zeroed fallback.
#[derive(Default)]
pub struct StaticProbe {
    reading: RwLock<Option<ResourceSnapshot>>,
}

impl StaticProbe {
    pub fn new(reading: ResourceSnapshot) -> Self {
        Self {
            reading: RwLock::new(Some(reading)),
        }
    }

    /// A probe whose reads always fail.
    pub fn failing() -> Self {
        Self::default()
    }

    pub fn set(&self, reading: ResourceSnapshot) {
        *self.reading.write() = Some(reading);
    }

    pub fn set_failing(&self) {
        *self.reading.write() = None;
    }
}

impl ResourceProbe for StaticProbe {
    fn sample(&self) -> Result<ResourceSnapshot> {
        (*self.reading.read()).ok_or_else(|| Error::io("resource reading unavailable"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_ancestor_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not").join("yet").join("created");
        assert_eq!(existing_ancestor(&missing), dir.path());
        assert_eq!(existing_ancestor(dir.path()), dir.path());
    }

    #[test]
    fn system_probe_reads_plausible_values() {
        let dir = tempfile::tempdir().unwrap();
        let probe = SystemProbe::new(dir.path().join("out"));
        let snapshot = probe.sample().unwrap();
        assert!((0.0..=100.0).contains(&snapshot.memory_percent));
        assert!((0.0..=100.0).contains(&snapshot.disk_percent));
        assert!(snapshot.memory_available_gb > 0.0);
        assert!(snapshot.cpu_percent >= 0.0);
    }

    #[test]
    fn static_probe_can_fail_and_recover() {
        let probe = StaticProbe::failing();
        assert!(probe.sample().is_err());
        probe.set(ResourceSnapshot::zeroed());
        assert_eq!(probe.sample().unwrap(), ResourceSnapshot::zeroed());
        probe.set_failing();
        assert!(probe.sample().is_err());
    }
}
