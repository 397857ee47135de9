//! TAP device facility.
//!
//! Every machine owns one TAP device with a name derived from its id; the
//! device is identity-bound and survives stop/start, so normal stop only
//! detaches it from the bridge. Creation reclaims orphans left behind by a
//! crashed hypervisor: a pre-existing device with no carrier is destroyed
//! and recreated, while a device with carrier is refused.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::runner::{SystemRunner, expect_success};
use crate::error::{Error, Result};

/// Kernel interface-name limit (IFNAMSIZ minus the NUL).
const IFNAME_MAX: usize = 15;
const TAP_PREFIX: &str = "vnet-";

/// Carrier polling cadence and retry budget used after hypervisor spawn.
pub const CARRIER_RETRIES: u32 = 10;
pub const CARRIER_POLL: Duration = Duration::from_millis(500);

/// Manages per-machine TAP devices through `ip(8)` and sysfs.
pub struct TapManager {
    runner: Arc<dyn SystemRunner>,
    sysfs_net: PathBuf,
}

impl std::fmt::Debug for TapManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapManager")
            .field("sysfs_net", &self.sysfs_net)
            .finish()
    }
}

impl TapManager {
    pub fn new(runner: Arc<dyn SystemRunner>) -> Self {
        Self {
            runner,
            sysfs_net: PathBuf::from("/sys/class/net"),
        }
    }

    /// Override the sysfs root (used by tests).
    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_net = root.into();
        self
    }

    /// Deterministic TAP name for a machine id.
    pub fn tap_name_for(vm_id: &str) -> String {
        let mut name = String::from(TAP_PREFIX);
        for ch in vm_id.chars() {
            if name.len() >= IFNAME_MAX {
                break;
            }
            if ch.is_ascii_alphanumeric() || ch == '-' {
                name.push(ch.to_ascii_lowercase());
            }
        }
        name
    }

    /// Create the machine's TAP device, reclaiming a stale one first.
    /// Returns the device name.
    pub fn create(&self, vm_id: &str, _bridge: &str) -> Result<String> {
        let tap = Self::tap_name_for(vm_id);
        if self.exists(&tap) {
            if self.has_carrier(&tap) {
                return Err(Error::ResourceUnavailable {
                    message: format!(
                        "TAP device {tap} already exists and has carrier; another hypervisor is using it"
                    ),
                });
            }
            warn!(tap, "reclaiming orphaned TAP device");
            self.destroy(&tap)?;
        }

        self.run("ip", &["tuntap", "add", "dev", &tap, "mode", "tap"])?;
        Ok(tap)
    }

    /// Bring the device up and attach it to the bridge.
    pub fn configure(&self, tap: &str, bridge: &str) -> Result<()> {
        self.run("ip", &["link", "set", "dev", tap, "up"])?;
        self.attach_to_bridge(tap, bridge)
    }

    /// Idempotent bridge attachment.
    pub fn attach_to_bridge(&self, tap: &str, bridge: &str) -> Result<()> {
        self.run("ip", &["link", "set", "dev", tap, "master", bridge])
    }

    /// Idempotent bridge detachment; the device itself is preserved.
    pub fn detach_from_bridge(&self, tap: &str) -> Result<()> {
        self.run("ip", &["link", "set", "dev", tap, "nomaster"])
    }

    pub fn bring_down(&self, tap: &str) -> Result<()> {
        self.run("ip", &["link", "set", "dev", tap, "down"])
    }

    pub fn destroy(&self, tap: &str) -> Result<()> {
        self.run("ip", &["link", "del", "dev", tap])
    }

    pub fn exists(&self, iface: &str) -> bool {
        self.sysfs_net.join(iface).is_dir()
    }

    /// Link-state bit; rises once the hypervisor opens the TAP. A read
    /// failure (interface down) reads as no carrier.
    pub fn has_carrier(&self, iface: &str) -> bool {
        match fs::read_to_string(self.sysfs_net.join(iface).join("carrier")) {
            Ok(contents) => contents.trim() == "1",
            Err(_) => false,
        }
    }

    /// Poll for carrier after hypervisor spawn. Returns `true` when the
    /// carrier rose within the retry budget.
    pub fn wait_for_carrier(&self, iface: &str) -> bool {
        for attempt in 0..CARRIER_RETRIES {
            if self.has_carrier(iface) {
                return true;
            }
            debug!(iface, attempt, "waiting for TAP carrier");
            thread::sleep(CARRIER_POLL);
        }
        self.has_carrier(iface)
    }

    /// One-line state dump used in network-error diagnostics.
    pub fn device_state(&self, iface: &str) -> String {
        match self
            .runner
            .run("ip", &["-o", "link", "show", "dev", iface])
        {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            }
            Ok(output) => format!(
                "ip link show {iface} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(err) => format!("ip link show {iface} could not run: {err}"),
        }
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        let output = self
            .runner
            .run(program, args)
            .map_err(|err| Error::NetworkError {
                message: format!("failed to spawn {program}: {err}"),
                diagnostics: Vec::new(),
            })?;
        expect_success(program, args, &output).map_err(|message| Error::NetworkError {
            message,
            diagnostics: Vec::new(),
        })
    }
}
