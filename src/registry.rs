//! Service registry: the static, declarative catalog of managed services.
//!
//! Implements §3.1 (`ServiceDescriptor`) and §4.2 (`ServiceRegistry`) of the
//! specification. Descriptors are immutable after load (invariant I1); the
//! registry's only job is lookup.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Whether a service runs inside a container the engine already knows about,
/// or as a native process this manager spawns and reaps directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Managed through the container engine by a pre-existing container id.
    Containerized,
    /// Spawned directly as a detached host process.
    Native,
}

/// The lifecycle state of a managed service, as tracked by the Lifecycle
/// Manager. See `spec.md` §4.3 for the full transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// No probe has run yet this process lifetime.
    Unknown,
    /// Observed stopped: no process/container running, or health probe
    /// failed from a stable non-starting state.
    Stopped,
    /// Start issued; warming up or waiting for the first successful probe.
    Starting,
    /// Health probe succeeded; the service is usable.
    Ready,
    /// Stop issued; graceful eviction and/or kill in flight.
    Stopping,
    /// Start failed to reach `Ready` before its timeout.
    Error,
}

impl ServiceState {
    /// `Ready` and `Stopped` are the only states §4.3 calls "stable" and
    /// promises callers will observe outside of a transition in flight.
    pub fn is_stable(self) -> bool {
        matches!(self, ServiceState::Ready | ServiceState::Stopped)
    }
}

/// Immutable catalog entry for one managed service (`spec.md` §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Unique identifier; the canonical name used everywhere (invariant I2).
    pub name: String,
    /// Containerized or native.
    pub kind: ServiceKind,
    /// Nominal VRAM footprint in MB. A planning figure, not a guarantee (I5).
    pub vram_mb: u64,
    /// Preemption priority; higher is more important.
    pub priority: i64,
    /// HTTP URL that returns 2xx when the service is ready.
    pub health_url: String,
    /// Maximum time to wait for readiness after start, in seconds.
    pub health_timeout_s: u64,
    /// Minimum delay after start before the first health probe, in seconds.
    pub warmup_s: u64,
    /// Pipeline phases in which this service is required.
    pub phases: HashSet<u32>,
    /// Identifier of the pre-existing container (required iff containerized).
    pub container_id: Option<String>,
    /// Shell command used to start a native service (required iff native).
    pub start_cmd: Option<String>,
    /// Shell command used to stop a native service (required iff native).
    pub stop_cmd: Option<String>,
    /// Shell command used to force-stop a native service. Falls back to
    /// `stop_cmd` if absent; `stop_cmd` alone is never escalated implicitly
    /// (Open Question 4 in `spec.md` §9: force semantics are a configuration
    /// concern, not something this manager infers).
    pub force_stop_cmd: Option<String>,
    /// Optional path used to persist the native process's PID.
    pub pid_file: Option<String>,
    /// Optional endpoint invoked before a hard stop to ask the service to
    /// release its GPU allocation without a full shutdown.
    pub graceful_evict_url: Option<String>,
}

impl ServiceDescriptor {
    /// Whether `phase` is among the phases this service is required for.
    pub fn required_for(&self, phase: u32) -> bool {
        self.phases.contains(&phase)
    }
}

/// Static, declarative catalog of managed services (`spec.md` §4.2).
///
/// Built once at startup and never mutated; `ServiceDescriptor` order is
/// preserved from configuration (insertion order), which `Orchestrator`
/// relies on for its equal-priority tie-break.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    descriptors: Vec<ServiceDescriptor>,
}

impl ServiceRegistry {
    /// Builds a registry from an already-validated, ordered list of
    /// descriptors. Validation (duplicate names, missing kind-specific
    /// fields, ...) happens in `config::load_config`, not here — by the
    /// time a registry exists, I1 holds.
    pub fn new(descriptors: Vec<ServiceDescriptor>) -> Self {
        Self { descriptors }
    }

    /// Looks up a descriptor by name.
    pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    /// All descriptors required for `phase`, in registry (insertion) order.
    pub fn for_phase(&self, phase: u32) -> Vec<&ServiceDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| d.required_for(phase))
            .collect()
    }

    /// All descriptors, in stable insertion order.
    pub fn all(&self) -> &[ServiceDescriptor] {
        &self.descriptors
    }
}
