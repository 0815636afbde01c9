/// Resource monitors for the kiln worker agent.
///
/// - **GPU** (`gpu`): NVML-backed telemetry with graceful degradation —
///   machines without an NVIDIA GPU get zero-valued samples, never errors
/// - **System** (`system`): CPU, memory, and disk sampling for heartbeats
pub mod gpu;
pub mod system;

pub use gpu::{GpuDeviceInfo, GpuMonitor, GpuSample};
pub use system::{SystemMonitor, SystemSample};
