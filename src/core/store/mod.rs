//! Persistent machine store contract and backends.
//!
//! Any relational store with optimistic concurrency can satisfy
//! [`MachineStore`]; the crate ships an in-memory backend for embedding and
//! tests plus a SQLite backend for single-host deployments.

mod memory;
mod sqlite;

use std::path::PathBuf;

use crate::config::{FirewallRule, MachineStatus, RuntimeState, VmSpec};
use crate::error::Result;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Minimal row returned by [`MachineStore::find_machine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineRow {
    pub id: String,
    pub status: MachineStatus,
}

/// Projection of a record whose persisted status is `running`.
#[derive(Debug, Clone)]
pub struct RunningVm {
    pub id: String,
    pub status: MachineStatus,
    pub qemu_pid: Option<u32>,
    pub tap_device: Option<String>,
    pub monitor_socket: Option<PathBuf>,
    pub guest_agent_socket: Option<PathBuf>,
    pub host_agent_socket: Option<PathBuf>,
}

/// Full machine record with configuration and runtime state.
#[derive(Debug, Clone, PartialEq)]
pub struct VmRecord {
    pub id: String,
    pub name: String,
    pub internal_name: String,
    pub os: String,
    /// Monotonic counter used for optimistic locking.
    pub version: i64,
    pub status: MachineStatus,
    pub spec: VmSpec,
    pub runtime: RuntimeState,
}

/// Partial update applied by [`MachineStore::update_machine_configuration`].
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct RuntimeUpdate {
    pub monitor_socket: Option<PathBuf>,
    pub qemu_pid: Option<u32>,
    pub tap_device: Option<String>,
    pub graphic_port: Option<u16>,
    pub disk_paths: Option<Vec<PathBuf>>,
    pub effective: Option<crate::config::EffectiveTunables>,
    pub guest_agent_socket: Option<PathBuf>,
    pub host_agent_socket: Option<PathBuf>,
}

impl RuntimeUpdate {
    /// Fold this update into an existing runtime state.
    pub fn apply_to(&self, runtime: &mut RuntimeState) {
        if let Some(path) = &self.monitor_socket {
            runtime.monitor_socket = Some(path.clone());
        }
        if let Some(pid) = self.qemu_pid {
            runtime.qemu_pid = Some(pid);
        }
        if let Some(tap) = &self.tap_device {
            runtime.tap_device = Some(tap.clone());
        }
        if let Some(port) = self.graphic_port {
            runtime.graphic_port = Some(port);
        }
        if let Some(paths) = &self.disk_paths {
            runtime.disk_paths = paths.clone();
        }
        if let Some(effective) = &self.effective {
            runtime.effective = Some(effective.clone());
        }
        if let Some(path) = &self.guest_agent_socket {
            runtime.guest_agent_socket = Some(path.clone());
        }
        if let Some(path) = &self.host_agent_socket {
            runtime.host_agent_socket = Some(path.clone());
        }
    }
}

/// Result of a successful compare-and-swap status transition.
#[derive(Debug, Clone)]
pub struct Transition {
    pub new_version: i64,
    pub record: VmRecord,
}

/// Store contract for machine records and firewall rules.
///
/// Status writes are serialized per machine by [`transition_vm_status`]'s
/// compare-and-swap on `(status, version)`; plain status updates are
/// last-writer-wins and idempotent on missing rows.
///
/// [`transition_vm_status`]: MachineStore::transition_vm_status
pub trait MachineStore: Send + Sync {
    /// Insert a brand-new record with `version = 1`.
    fn insert_machine(&self, record: &VmRecord) -> Result<()>;

    fn find_machine(&self, id: &str) -> Result<Option<MachineRow>>;

    /// Set the status unconditionally. A missing row is a no-op.
    fn update_machine_status(&self, id: &str, status: MachineStatus) -> Result<()>;

    fn find_running_vms(&self) -> Result<Vec<RunningVm>>;

    /// Clear all volatile fields including the TAP device name.
    fn clear_machine_configuration(&self, id: &str) -> Result<()>;

    /// Clear volatile fields but preserve the TAP device name.
    fn clear_volatile_machine_configuration(&self, id: &str) -> Result<()>;

    fn find_machine_with_config(&self, id: &str) -> Result<Option<VmRecord>>;

    /// Merge the given runtime fields into the record.
    fn update_machine_configuration(&self, id: &str, update: &RuntimeUpdate) -> Result<()>;

    /// Atomically move `id` from `expected_status` to `new_status`, guarded
    /// by `expected_version`. Fails with `version-conflict` when the version
    /// moved, or `invalid-state` when the status does not match.
    fn transition_vm_status(
        &self,
        id: &str,
        expected_status: MachineStatus,
        new_status: MachineStatus,
        expected_version: i64,
    ) -> Result<Transition>;

    /// Effective firewall rules for a machine: department rules first, then
    /// machine-specific rules, each group stably sorted by ascending
    /// priority.
    fn firewall_rules(&self, vm_id: &str) -> Result<Vec<FirewallRule>>;
}

/// Stable sort applied to each rule group before concatenation.
pub(crate) fn sort_rules(rules: &mut [FirewallRule]) {
    rules.sort_by_key(|rule| rule.priority);
}
