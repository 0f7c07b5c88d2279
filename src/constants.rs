//! Constants and default values for the GPU resource manager.
//!
//! Centralizes the magic numbers scattered across §4 and §5 of the
//! specification so they are defined exactly once.

use std::time::Duration;

/// System VRAM reserve protecting desktop/background consumers, in MB.
pub const DEFAULT_VRAM_RESERVE_MB: u64 = 1024;

/// Default TTL applied to a lease's lock record, in seconds.
pub const DEFAULT_LOCK_TTL_S: u64 = 600;

/// Back-off series (seconds) for contended lock acquisition. Five attempts.
pub const LOCK_BACKOFF_SECONDS: &[u64] = &[1, 2, 4, 8, 16];

/// Per-probe deadline for a single health check.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for any single container-engine call (start/stop/inspect).
pub const CONTAINER_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Polling interval used by `WaitReady` between health probes.
pub const WAIT_READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Graceful stop deadline handed to the container engine before a force-kill.
pub const CONTAINER_STOP_DEADLINE: Duration = Duration::from_secs(30);

/// Settle delay after a containerized stop, so the driver reclaims VRAM.
pub const CONTAINER_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Settle delay after a native stop. Higher than the container settle delay
/// because shell-based kills are coarser and less immediately observable.
pub const NATIVE_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Lowest legal phase number (inclusive).
pub const MIN_PHASE: u32 = 1;

/// Highest legal phase number (inclusive).
pub const MAX_PHASE: u32 = 5;

/// NVML device index this process manages. Multi-GPU topology is a
/// non-goal (`spec.md` §1), so this is fixed rather than configurable.
pub const GPU_DEVICE_INDEX: u32 = 0;
