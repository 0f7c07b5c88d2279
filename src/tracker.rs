//! VRAM Tracker: read-only interface to the GPU driver's management counter.
//!
//! Implements `spec.md` §4.1. No mutation ever happens through this module;
//! every call is a poll against NVML or, in tests, a canned fixture.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nvml_wrapper::Nvml;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::constants::GPU_DEVICE_INDEX;
use crate::error::ManagerError;

/// One process's reported GPU memory usage, as it appears in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessUsage {
    /// Host process id.
    pub pid: u32,
    /// Process name, best-effort (NVML doesn't always resolve this).
    pub name: String,
    /// Memory attributed to this process, in MB.
    pub memory_mb: u64,
}

/// A momentary reading from the VRAM tracker (`spec.md` §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuSnapshot {
    /// Total device memory, in MB.
    pub total_mb: u64,
    /// Memory currently in use, in MB.
    pub used_mb: u64,
    /// Memory currently free, in MB.
    pub free_mb: u64,
    /// Per-process usage, in the order NVML reported it.
    pub processes: Vec<ProcessUsage>,
    /// Device temperature in Celsius, when the driver exposes it.
    pub temperature_c: Option<u32>,
    /// GPU utilization percentage, when the driver exposes it.
    pub utilization_percent: Option<u32>,
    /// When this reading was taken.
    pub sampled_at: DateTime<Utc>,
}

/// Read-only interface to GPU telemetry.
#[async_trait]
pub trait VramTracker: Send + Sync {
    /// Returns a freshly sampled reading.
    async fn snapshot(&self) -> Result<GpuSnapshot, ManagerError>;

    /// `true` iff `free_mb - margin_mb >= required_mb` using a fresh snapshot.
    async fn can_fit(&self, required_mb: u64, margin_mb: u64) -> Result<bool, ManagerError> {
        let snapshot = self.snapshot().await?;
        let available = snapshot.free_mb as i64 - margin_mb as i64;
        Ok(available >= required_mb as i64)
    }

    /// First process in the snapshot whose name matches `substring`,
    /// case-insensitively.
    async fn find_process(&self, substring: &str) -> Result<Option<ProcessUsage>, ManagerError> {
        let snapshot = self.snapshot().await?;
        let needle = substring.to_lowercase();
        Ok(snapshot
            .processes
            .into_iter()
            .find(|p| p.name.to_lowercase().contains(&needle)))
    }
}

/// NVML-backed tracker. Holds a single process-wide handle, initialized
/// lazily on first use and kept for the tracker's lifetime.
pub struct NvmlTracker {
    handle: OnceCell<Nvml>,
}

impl NvmlTracker {
    /// Creates a tracker with no NVML handle yet; `init()` on first call.
    pub fn new() -> Self {
        Self {
            handle: OnceCell::new(),
        }
    }

    async fn handle(&self) -> Result<&Nvml, ManagerError> {
        self.handle
            .get_or_try_init(|| async {
                Nvml::init().map_err(|e| ManagerError::TrackerUnavailable(e.to_string()))
            })
            .await
    }
}

impl Default for NvmlTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VramTracker for NvmlTracker {
    async fn snapshot(&self) -> Result<GpuSnapshot, ManagerError> {
        let nvml = self.handle().await?;
        let device = nvml.device_by_index(GPU_DEVICE_INDEX)?;

        let mem = device.memory_info()?;
        let to_mb = |bytes: u64| bytes / (1024 * 1024);

        let mut processes = Vec::new();
        for proc_info in device.running_compute_processes()? {
            let memory_mb = match proc_info.used_gpu_memory {
                nvml_wrapper::enums::device::UsedGpuMemory::Used(bytes) => to_mb(bytes),
                nvml_wrapper::enums::device::UsedGpuMemory::Unavailable => 0,
            };
            let name = nvml
                .sys_process_name(proc_info.pid, 64)
                .unwrap_or_else(|_| "<unknown>".to_string());
            processes.push(ProcessUsage {
                pid: proc_info.pid,
                name,
                memory_mb,
            });
        }

        let temperature_c = device.temperature(TemperatureSensor::Gpu).ok();
        let utilization_percent = device.utilization_rates().ok().map(|u| u.gpu);

        Ok(GpuSnapshot {
            total_mb: to_mb(mem.total),
            used_mb: to_mb(mem.used),
            free_mb: to_mb(mem.free),
            processes,
            temperature_c,
            utilization_percent,
            sampled_at: Utc::now(),
        })
    }
}
