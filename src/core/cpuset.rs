//! CPU pinning through the unified control-group hierarchy.
//!
//! Each pinned hypervisor process gets its own scope under the product
//! slice, named by PID rather than machine id: scopes are cleaned up
//! opportunistically, and several restarts of one machine may leave
//! several empty scopes behind. Pinning is best-effort throughout — when
//! the `cpuset` controller is unavailable or a write fails, the launch
//! proceeds unpinned.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

const SLICE: &str = "castellan.slice";
const SCOPE_PREFIX: &str = "qemu-";
const SCOPE_SUFFIX: &str = ".scope";

/// Manages `castellan.slice/qemu-<pid>.scope` cgroups.
#[derive(Debug)]
pub struct CpusetManager {
    cgroup_root: PathBuf,
}

impl CpusetManager {
    pub fn new() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
        }
    }

    /// Override the unified-hierarchy mountpoint (used by tests).
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }

    /// Reject core indices that cannot exist on this host.
    pub fn validate_cores(cores: &[i32], host_cpus: usize) -> Result<()> {
        for &core in cores {
            if core < 0 {
                return Err(Error::InvalidConfig {
                    message: format!("CPU pinning core {core} is negative"),
                });
            }
            if core as usize >= host_cpus {
                return Err(Error::InvalidConfig {
                    message: format!(
                        "CPU pinning core {core} exceeds host CPU count {host_cpus}"
                    ),
                });
            }
        }
        if cores.is_empty() {
            return Err(Error::InvalidConfig {
                message: "CPU pinning requires at least one core".to_string(),
            });
        }
        Ok(())
    }

    /// Move `pid` into a fresh scope restricted to `cores`. Best-effort:
    /// failures are logged and swallowed.
    pub fn apply_cpu_pinning(&self, pid: u32, cores: &[i32]) {
        if !self.controller_available() {
            warn!(pid, "cpuset controller unavailable, skipping CPU pinning");
            return;
        }

        let slice = self.cgroup_root.join(SLICE);
        if let Err(err) = fs::create_dir_all(&slice) {
            warn!(pid, %err, "failed to create slice, skipping CPU pinning");
            return;
        }

        // Delegation must be enabled down the path before the scope can
        // use the controller.
        for control in [
            self.cgroup_root.join("cgroup.subtree_control"),
            slice.join("cgroup.subtree_control"),
        ] {
            if let Err(err) = fs::write(&control, "+cpuset") {
                debug!(path = %control.display(), %err, "could not enable cpuset controller");
            }
        }

        let scope = slice.join(format!("{SCOPE_PREFIX}{pid}{SCOPE_SUFFIX}"));
        if let Err(err) = fs::create_dir_all(&scope) {
            warn!(pid, %err, "failed to create scope, skipping CPU pinning");
            return;
        }

        let core_list = cores
            .iter()
            .map(|core| core.to_string())
            .collect::<Vec<_>>()
            .join(",");
        if let Err(err) = fs::write(scope.join("cpuset.cpus"), &core_list) {
            warn!(pid, cores = core_list, %err, "failed to write cpuset.cpus");
            return;
        }
        if let Err(err) = fs::write(scope.join("cpuset.mems"), "0") {
            debug!(pid, %err, "failed to write cpuset.mems");
        }
        if let Err(err) = fs::write(scope.join("cgroup.procs"), pid.to_string()) {
            warn!(pid, %err, "failed to move pid into scope");
            return;
        }
        debug!(pid, cores = core_list, "applied CPU pinning");
    }

    /// Remove every scope under the slice whose `cgroup.procs` is empty.
    /// Returns the number of scopes removed.
    pub fn cleanup_empty_scopes(&self) -> usize {
        let slice = self.cgroup_root.join(SLICE);
        let entries = match fs::read_dir(&slice) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(SCOPE_PREFIX) || !name.ends_with(SCOPE_SUFFIX) {
                continue;
            }
            let scope = entry.path();
            if !scope_is_empty(&scope) {
                continue;
            }
            match fs::remove_dir(&scope) {
                Ok(()) => {
                    debug!(scope = %scope.display(), "removed empty scope");
                    removed += 1;
                }
                Err(err) => {
                    warn!(scope = %scope.display(), %err, "failed to remove empty scope");
                }
            }
        }
        removed
    }

    fn controller_available(&self) -> bool {
        match fs::read_to_string(self.cgroup_root.join("cgroup.controllers")) {
            Ok(controllers) => controllers.split_whitespace().any(|name| name == "cpuset"),
            Err(_) => false,
        }
    }
}

impl Default for CpusetManager {
    fn default() -> Self {
        Self::new()
    }
}

fn scope_is_empty(scope: &Path) -> bool {
    match fs::read_to_string(scope.join("cgroup.procs")) {
        Ok(procs) => procs.trim().is_empty(),
        Err(_) => false,
    }
}
