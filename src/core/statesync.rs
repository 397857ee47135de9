//! Maps the hypervisor's runtime status vocabulary onto the persistent
//! status vocabulary and applies the result to the store.

use tracing::warn;

use crate::config::MachineStatus;
use crate::core::monitor::MonitorClient;
use crate::core::store::MachineStore;
use crate::error::Result;

/// Translate one `query-status` value. `None` means the value is outside
/// the known vocabulary; callers persist `error` in that case.
pub fn map_runtime_status(raw: &str) -> Option<MachineStatus> {
    match raw {
        "running" | "colo" => Some(MachineStatus::Running),
        "paused" | "suspended" => Some(MachineStatus::Suspended),
        "shutdown" => Some(MachineStatus::Off),
        "inmigrate" | "postmigrate" | "prelaunch" | "finish-migrate" | "restore-vm" => {
            Some(MachineStatus::Building)
        }
        "watchdog" | "guest-panicked" | "io-error" => Some(MachineStatus::Error),
        _ => None,
    }
}

/// Query the hypervisor and persist the mapped status. A record deleted
/// concurrently is a no-op, as is an unchanged status.
pub fn sync_state(
    store: &dyn MachineStore,
    vm_id: &str,
    client: &MonitorClient,
) -> Result<MachineStatus> {
    let reply = client.query_status()?;
    let mapped = map_runtime_status(&reply.status).unwrap_or_else(|| {
        warn!(vm_id, status = reply.status, "unknown runtime status, persisting error");
        MachineStatus::Error
    });

    if let Some(row) = store.find_machine(vm_id)? {
        if row.status != mapped {
            store.update_machine_status(vm_id, mapped)?;
        }
    }
    Ok(mapped)
}

/// Persist a status already known from an event, without querying.
pub fn update_status_direct(
    store: &dyn MachineStore,
    vm_id: &str,
    status: MachineStatus,
) -> Result<()> {
    store.update_machine_status(vm_id, status)
}
