//! Host CPU, memory, and disk sampling.
//!
//! Wraps a [`sysinfo::System`] behind a mutex so the heartbeat loop and the
//! agent's health queries can share one monitor. Sampling is cheap and
//! non-blocking; CPU usage is the delta since the previous refresh, so the
//! first sample after construction reads low.

use std::sync::Mutex;

use serde::Serialize;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One host telemetry sample, reported with every heartbeat.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SystemSample {
    /// Average usage across all cores, 0–100.
    pub cpu_percent: f32,
    pub memory_used_gb: f64,
    pub memory_total_gb: f64,
    pub disk_used_gb: f64,
    pub disk_total_gb: f64,
}

/// Host resource monitor.
pub struct SystemMonitor {
    system: Mutex<System>,
}

impl SystemMonitor {
    /// Build a monitor refreshing only what sampling needs (CPU usage and
    /// memory) — frequency polling and per-process tables add overhead for
    /// data the agent never reports.
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::new().with_cpu_usage())
                .with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            system: Mutex::new(system),
        }
    }

    /// Take a sample. Never fails; a poisoned lock yields a default sample.
    pub fn sample(&self) -> SystemSample {
        let Ok(mut system) = self.system.lock() else {
            return SystemSample::default();
        };
        system.refresh_cpu();
        system.refresh_memory();

        let cpus = system.cpus();
        let cpu_percent = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / cpus.len() as f32
        };

        let memory_used_gb = system.used_memory() as f64 / BYTES_PER_GB;
        let memory_total_gb = system.total_memory() as f64 / BYTES_PER_GB;

        let disks = Disks::new_with_refreshed_list();
        let mut disk_total_gb = 0.0;
        let mut disk_used_gb = 0.0;
        for disk in disks.list() {
            let total = disk.total_space() as f64 / BYTES_PER_GB;
            let available = disk.available_space() as f64 / BYTES_PER_GB;
            disk_total_gb += total;
            disk_used_gb += total - available;
        }

        SystemSample {
            cpu_percent,
            memory_used_gb,
            memory_total_gb,
            disk_used_gb,
            disk_total_gb,
        }
    }

    /// Host name reported at registration.
    pub fn hostname(&self) -> String {
        System::host_name().unwrap_or_else(|| "unknown".to_string())
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}
