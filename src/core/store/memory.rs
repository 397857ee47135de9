use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::{FirewallRule, MachineStatus};
use crate::error::{Error, Result};

use super::{
    MachineRow, MachineStore, RunningVm, RuntimeUpdate, Transition, VmRecord, sort_rules,
};

/// In-memory [`MachineStore`] backend.
///
/// Useful for embedding hosts that keep records elsewhere and for tests.
/// All operations lock one table mutex, which also serializes the
/// compare-and-swap transition.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    machines: HashMap<String, VmRecord>,
    department_rules: Vec<FirewallRule>,
    vm_rules: HashMap<String, Vec<FirewallRule>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the department-wide rule set.
    pub fn set_department_rules(&self, rules: Vec<FirewallRule>) {
        if let Ok(mut tables) = self.inner.lock() {
            tables.department_rules = rules;
        }
    }

    /// Replace the per-machine rule set.
    pub fn set_vm_rules(&self, vm_id: &str, rules: Vec<FirewallRule>) {
        if let Ok(mut tables) = self.inner.lock() {
            tables.vm_rules.insert(vm_id.to_string(), rules);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.inner.lock().map_err(|_| Error::DatabaseError {
            message: "memory store mutex poisoned".to_string(),
        })
    }
}

impl MachineStore for MemoryStore {
    fn insert_machine(&self, record: &VmRecord) -> Result<()> {
        let mut tables = self.lock()?;
        if tables.machines.contains_key(&record.id) {
            return Err(Error::DatabaseError {
                message: format!("machine `{}` already exists", record.id),
            });
        }
        tables.machines.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn find_machine(&self, id: &str) -> Result<Option<MachineRow>> {
        let tables = self.lock()?;
        Ok(tables.machines.get(id).map(|record| MachineRow {
            id: record.id.clone(),
            status: record.status,
        }))
    }

    fn update_machine_status(&self, id: &str, status: MachineStatus) -> Result<()> {
        let mut tables = self.lock()?;
        if let Some(record) = tables.machines.get_mut(id) {
            record.status = status;
        }
        Ok(())
    }

    fn find_running_vms(&self) -> Result<Vec<RunningVm>> {
        let tables = self.lock()?;
        Ok(tables
            .machines
            .values()
            .filter(|record| record.status == MachineStatus::Running)
            .map(|record| RunningVm {
                id: record.id.clone(),
                status: record.status,
                qemu_pid: record.runtime.qemu_pid,
                tap_device: record.runtime.tap_device.clone(),
                monitor_socket: record.runtime.monitor_socket.clone(),
                guest_agent_socket: record.runtime.guest_agent_socket.clone(),
                host_agent_socket: record.runtime.host_agent_socket.clone(),
            })
            .collect())
    }

    fn clear_machine_configuration(&self, id: &str) -> Result<()> {
        let mut tables = self.lock()?;
        if let Some(record) = tables.machines.get_mut(id) {
            record.runtime = Default::default();
        }
        Ok(())
    }

    fn clear_volatile_machine_configuration(&self, id: &str) -> Result<()> {
        let mut tables = self.lock()?;
        if let Some(record) = tables.machines.get_mut(id) {
            record.runtime.clear_volatile();
        }
        Ok(())
    }

    fn find_machine_with_config(&self, id: &str) -> Result<Option<VmRecord>> {
        let tables = self.lock()?;
        Ok(tables.machines.get(id).cloned())
    }

    fn update_machine_configuration(&self, id: &str, update: &RuntimeUpdate) -> Result<()> {
        let mut tables = self.lock()?;
        match tables.machines.get_mut(id) {
            Some(record) => {
                update.apply_to(&mut record.runtime);
                Ok(())
            }
            None => Err(Error::VmNotFound { vm: id.to_string() }),
        }
    }

    fn transition_vm_status(
        &self,
        id: &str,
        expected_status: MachineStatus,
        new_status: MachineStatus,
        expected_version: i64,
    ) -> Result<Transition> {
        let mut tables = self.lock()?;
        let record = tables
            .machines
            .get_mut(id)
            .ok_or_else(|| Error::VmNotFound { vm: id.to_string() })?;

        if record.version != expected_version {
            return Err(Error::VersionConflict { vm: id.to_string() });
        }
        if record.status != expected_status {
            return Err(Error::InvalidState {
                vm: id.to_string(),
                expected: expected_status.as_str().to_string(),
                actual: record.status.as_str().to_string(),
            });
        }

        record.status = new_status;
        record.version += 1;
        Ok(Transition {
            new_version: record.version,
            record: record.clone(),
        })
    }

    fn firewall_rules(&self, vm_id: &str) -> Result<Vec<FirewallRule>> {
        let tables = self.lock()?;
        let mut department = tables.department_rules.clone();
        sort_rules(&mut department);
        let mut specific = tables.vm_rules.get(vm_id).cloned().unwrap_or_default();
        sort_rules(&mut specific);
        department.extend(specific);
        Ok(department)
    }
}
