//! NVIDIA GPU telemetry via NVML.
//!
//! The monitor is built once at startup. If NVML is unavailable (no driver,
//! no GPU, unsupported platform) the monitor still constructs and every
//! sample comes back zero-valued — CPU-only development machines run the
//! full agent without special-casing.

use nvml_wrapper::Nvml;
use serde::Serialize;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One GPU telemetry sample.
///
/// NVML reports framebuffer usage for the whole device; it cannot separate
/// allocator-reserved memory from allocated memory, so both fields read the
/// same source. All fields are zero when no GPU is present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GpuSample {
    pub memory_allocated_gb: f64,
    pub memory_reserved_gb: f64,
    pub utilization_percent: f64,
}

/// Static device description, used as registration metadata.
#[derive(Debug, Clone, Serialize)]
pub struct GpuDeviceInfo {
    pub name: String,
    pub memory_total_gb: f64,
}

/// GPU monitor holding an optional NVML handle.
pub struct GpuMonitor {
    nvml: Option<Nvml>,
    device_index: u32,
}

impl GpuMonitor {
    /// Initialize NVML for the given device index.
    ///
    /// Never fails: an init error leaves the monitor in degraded mode where
    /// every sample is zero-valued.
    pub fn new(device_index: u32) -> Self {
        let nvml = match Nvml::init() {
            Ok(nvml) => {
                tracing::info!(device_index, "NVML initialized");
                Some(nvml)
            }
            Err(e) => {
                tracing::debug!("NVML unavailable, GPU samples will be zero-valued: {e}");
                None
            }
        };
        Self { nvml, device_index }
    }

    /// Whether an NVML handle is live.
    pub fn is_available(&self) -> bool {
        self.nvml.is_some()
    }

    /// Describe the device for registration metadata. `None` without a GPU.
    pub fn device_info(&self) -> Option<GpuDeviceInfo> {
        let nvml = self.nvml.as_ref()?;
        let device = nvml.device_by_index(self.device_index).ok()?;
        let name = device.name().ok()?;
        let memory_total_gb = device
            .memory_info()
            .ok()
            .map(|m| m.total as f64 / BYTES_PER_GB)?;
        Some(GpuDeviceInfo {
            name,
            memory_total_gb,
        })
    }

    /// Take a telemetry sample.
    ///
    /// Per-call NVML failures are logged at debug and produce a zero-valued
    /// sample; they never propagate.
    pub fn sample(&self) -> GpuSample {
        let Some(nvml) = self.nvml.as_ref() else {
            return GpuSample::default();
        };

        let device = match nvml.device_by_index(self.device_index) {
            Ok(device) => device,
            Err(e) => {
                tracing::debug!(device_index = self.device_index, "GPU query failed: {e}");
                return GpuSample::default();
            }
        };

        let (memory_allocated_gb, memory_reserved_gb) = match device.memory_info() {
            Ok(mem) => {
                let used = mem.used as f64 / BYTES_PER_GB;
                (used, used)
            }
            Err(e) => {
                tracing::debug!("GPU memory query failed: {e}");
                (0.0, 0.0)
            }
        };

        let utilization_percent = match device.utilization_rates() {
            Ok(rates) => rates.gpu as f64,
            Err(e) => {
                tracing::debug!("GPU utilization query failed: {e}");
                0.0
            }
        };

        GpuSample {
            memory_allocated_gb,
            memory_reserved_gb,
            utilization_percent,
        }
    }

    /// Post-cancel hook. The trainer subprocess owns all CUDA allocations,
    /// so killing it is what actually frees memory; this resamples and logs
    /// what the device still reports. Always succeeds.
    pub fn clear_cache(&self) {
        if self.nvml.is_none() {
            return;
        }
        let sample = self.sample();
        tracing::debug!(
            residual_gb = sample.memory_allocated_gb,
            "GPU memory after trainer shutdown"
        );
    }
}
