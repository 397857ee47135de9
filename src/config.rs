use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default base of the display-port scan window.
pub const DEFAULT_DISPLAY_PORT: u16 = 5900;

/// Number of candidate ports probed when allocating a display port.
pub const DISPLAY_PORT_SCAN_WINDOW: u16 = 100;

/// Persistent lifecycle status of a machine record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Off,
    Starting,
    Running,
    Suspended,
    Paused,
    Building,
    Error,
}

impl MachineStatus {
    /// Stable string form used by the store and the CLI.
    pub fn as_str(self) -> &'static str {
        match self {
            MachineStatus::Off => "off",
            MachineStatus::Starting => "starting",
            MachineStatus::Running => "running",
            MachineStatus::Suspended => "suspended",
            MachineStatus::Paused => "paused",
            MachineStatus::Building => "building",
            MachineStatus::Error => "error",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "off" => Some(MachineStatus::Off),
            "starting" => Some(MachineStatus::Starting),
            "running" => Some(MachineStatus::Running),
            "suspended" => Some(MachineStatus::Suspended),
            "paused" => Some(MachineStatus::Paused),
            "building" => Some(MachineStatus::Building),
            "error" => Some(MachineStatus::Error),
            _ => None,
        }
    }
}

/// Disk bus exposed to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    Virtio,
    Scsi,
    Ide,
    Sata,
}

impl DiskBus {
    pub fn as_str(self) -> &'static str {
        match self {
            DiskBus::Virtio => "virtio",
            DiskBus::Scsi => "scsi",
            DiskBus::Ide => "ide",
            DiskBus::Sata => "sata",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "virtio" => Some(DiskBus::Virtio),
            "scsi" => Some(DiskBus::Scsi),
            "ide" => Some(DiskBus::Ide),
            "sata" => Some(DiskBus::Sata),
            _ => None,
        }
    }
}

/// Host-side cache mode for a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskCacheMode {
    Writeback,
    Writethrough,
    None,
    Unsafe,
}

impl DiskCacheMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DiskCacheMode::Writeback => "writeback",
            DiskCacheMode::Writethrough => "writethrough",
            DiskCacheMode::None => "none",
            DiskCacheMode::Unsafe => "unsafe",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "writeback" => Some(DiskCacheMode::Writeback),
            "writethrough" => Some(DiskCacheMode::Writethrough),
            "none" => Some(DiskCacheMode::None),
            "unsafe" => Some(DiskCacheMode::Unsafe),
            _ => None,
        }
    }
}

/// One virtual disk attached to a machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub size_gb: u32,
    /// Image format handed to the image tool (`qcow2` when unset).
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub bus: Option<DiskBus>,
    #[serde(default)]
    pub cache: Option<DiskCacheMode>,
    #[serde(default)]
    pub discard: Option<bool>,
}

/// Display protocol spoken by the machine's graphic device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayKind {
    Spice,
    Vnc,
}

impl DisplayKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DisplayKind::Spice => "spice",
            DisplayKind::Vnc => "vnc",
        }
    }
}

/// Display configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplaySpec {
    pub kind: DisplayKind,
    #[serde(default)]
    pub port: Option<u32>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub addr: Option<String>,
}

/// NUMA strategy used when the machine pins vCPUs to host cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinningStrategy {
    Basic,
    Hybrid,
}

impl PinningStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            PinningStrategy::Basic => "basic",
            PinningStrategy::Hybrid => "hybrid",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "basic" => Some(PinningStrategy::Basic),
            "hybrid" => Some(PinningStrategy::Hybrid),
            _ => None,
        }
    }
}

/// PCI passthrough configuration for a GPU (plus its audio function).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassthroughSpec {
    /// PCI address of the GPU function, `hhhh:hh:hh.f`.
    pub gpu_address: String,
    /// PCI address of the GPU's audio function; must differ from the GPU.
    #[serde(default)]
    pub audio_address: Option<String>,
    /// Optional ROM image; must live under the allowed ROM directory.
    #[serde(default)]
    pub rom_path: Option<PathBuf>,
}

/// Unattended-installation request attached to `create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnattendedInstall {
    /// OS family the install media targets; must match the machine's `os`.
    pub os: String,
    /// Source installation ISO.
    pub source_iso: PathBuf,
    /// Hostname, user and password baked into the answer file.
    pub hostname: String,
    pub username: String,
    pub password: String,
}

/// Hardware shape and tunables of one machine.
///
/// Optional tunables are canonicalized by the validation layer before any
/// command line is assembled; `None` means "use the OS-family preset".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    pub cpu_cores: u32,
    pub ram_gb: u32,
    pub disks: Vec<DiskSpec>,
    pub bridge: String,
    #[serde(default)]
    pub mac_address: Option<String>,
    pub display: DisplaySpec,
    #[serde(default)]
    pub machine_type: Option<String>,
    #[serde(default)]
    pub network_model: Option<String>,
    #[serde(default)]
    pub network_queues: Option<u32>,
    #[serde(default)]
    pub passthrough: Option<PassthroughSpec>,
    #[serde(default)]
    pub firmware: Option<PathBuf>,
    #[serde(default)]
    pub hugepages: bool,
    #[serde(default)]
    pub balloon: bool,
    #[serde(default)]
    pub cpu_pinning: Option<Vec<i32>>,
    #[serde(default)]
    pub pinning_strategy: Option<PinningStrategy>,
    #[serde(default)]
    pub tpm_socket: Option<PathBuf>,
    #[serde(default)]
    pub guest_agent_socket: Option<PathBuf>,
    #[serde(default)]
    pub host_agent_socket: Option<PathBuf>,
    #[serde(default)]
    pub driver_iso: Option<PathBuf>,
    #[serde(default)]
    pub audio_enabled: bool,
    #[serde(default)]
    pub tablet_enabled: bool,
    #[serde(default)]
    pub unattended_install: Option<UnattendedInstall>,
}

/// Request handed to `create`: identity plus hardware shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Immutable opaque identifier.
    pub vm_id: String,
    /// Human-facing name.
    pub name: String,
    /// Filesystem-safe name used to derive on-disk paths.
    pub internal_name: String,
    /// OS family string (`ubuntu`, `windows10`, `fedora`, ...).
    pub os: String,
    pub spec: VmSpec,
}

/// Effective (validated) tunables persisted alongside the runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveTunables {
    pub machine_type: String,
    pub disk_bus: DiskBus,
    pub disk_cache: DiskCacheMode,
    pub network_model: String,
    pub network_queues: u32,
    pub firmware: Option<PathBuf>,
    pub hugepages: bool,
    pub pinning_strategy: PinningStrategy,
}

/// Volatile runtime fields of a machine record.
///
/// `tap_device` is deliberately preserved across stop/start so the kernel
/// device can be reused; everything else belongs to one running instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    #[serde(default)]
    pub monitor_socket: Option<PathBuf>,
    #[serde(default)]
    pub qemu_pid: Option<u32>,
    #[serde(default)]
    pub tap_device: Option<String>,
    #[serde(default)]
    pub graphic_port: Option<u16>,
    #[serde(default)]
    pub disk_paths: Vec<PathBuf>,
    #[serde(default)]
    pub effective: Option<EffectiveTunables>,
    #[serde(default)]
    pub guest_agent_socket: Option<PathBuf>,
    #[serde(default)]
    pub host_agent_socket: Option<PathBuf>,
}

impl RuntimeState {
    /// Clear everything that belongs to a running instance, keeping the TAP
    /// device name so the next start can reuse it.
    pub fn clear_volatile(&mut self) {
        let tap = self.tap_device.take();
        *self = RuntimeState::default();
        self.tap_device = tap;
    }
}

/// Action taken by a firewall rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleAction {
    Accept,
    Drop,
    Reject,
}

impl RuleAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleAction::Accept => "accept",
            RuleAction::Drop => "drop",
            RuleAction::Reject => "reject",
        }
    }
}

/// Direction a rule applies to, relative to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleDirection {
    In,
    Out,
    InOut,
}

/// Inclusive port range; a single port is `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

/// IP network in address/prefix form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpNet {
    pub addr: IpAddr,
    pub prefix: u8,
}

/// One packet-filter rule owned by a department or a single machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub id: String,
    pub name: String,
    pub action: RuleAction,
    pub direction: RuleDirection,
    /// Lower priority sorts earlier within its group.
    pub priority: i32,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub src_ports: Option<PortRange>,
    #[serde(default)]
    pub dst_ports: Option<PortRange>,
    #[serde(default)]
    pub src_net: Option<IpNet>,
    #[serde(default)]
    pub dst_net: Option<IpNet>,
    /// Connection-tracking states the rule matches (`established`, ...).
    #[serde(default)]
    pub conn_states: Vec<String>,
    #[serde(default)]
    pub overrides_dept: bool,
}

/// Host directory layout for per-VM artifacts.
#[derive(Debug, Clone)]
pub struct HostPaths {
    /// Disk images live here as `<internal_name>.qcow2`, `-disk1`, ...
    pub disk_dir: PathBuf,
    /// Monitor sockets live here as `<internal_name>.sock`.
    pub socket_dir: PathBuf,
    /// Pidfiles live here as `<internal_name>.pid`.
    pub pidfile_dir: PathBuf,
    /// UEFI variable templates are copied from here.
    pub uefi_template: Option<PathBuf>,
    /// ROM images for passthrough must normalize under this directory.
    pub rom_dir: PathBuf,
}

impl HostPaths {
    pub fn disk_path(&self, internal_name: &str, index: usize) -> PathBuf {
        if index == 0 {
            self.disk_dir.join(format!("{internal_name}.qcow2"))
        } else {
            self.disk_dir
                .join(format!("{internal_name}-disk{index}.qcow2"))
        }
    }

    pub fn monitor_socket(&self, internal_name: &str) -> PathBuf {
        self.socket_dir.join(format!("{internal_name}.sock"))
    }

    pub fn pidfile(&self, internal_name: &str) -> PathBuf {
        self.pidfile_dir.join(format!("{internal_name}.pid"))
    }

    pub fn uefi_vars(&self, vm_id: &str) -> PathBuf {
        self.disk_dir.join(format!("uefi-vars-{vm_id}.fd"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for status in [
            MachineStatus::Off,
            MachineStatus::Starting,
            MachineStatus::Running,
            MachineStatus::Suspended,
            MachineStatus::Paused,
            MachineStatus::Building,
            MachineStatus::Error,
        ] {
            assert_eq!(MachineStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MachineStatus::parse("shutdown"), None);
    }

    #[test]
    fn clear_volatile_preserves_tap() {
        let mut runtime = RuntimeState {
            monitor_socket: Some(PathBuf::from("/run/vm.sock")),
            qemu_pid: Some(4242),
            tap_device: Some("vnet-v1".to_string()),
            graphic_port: Some(5901),
            disk_paths: vec![PathBuf::from("/var/lib/vm.qcow2")],
            ..RuntimeState::default()
        };
        runtime.clear_volatile();
        assert_eq!(runtime.tap_device.as_deref(), Some("vnet-v1"));
        assert!(runtime.qemu_pid.is_none());
        assert!(runtime.monitor_socket.is_none());
        assert!(runtime.graphic_port.is_none());
        assert!(runtime.disk_paths.is_empty());
    }

    #[test]
    fn disk_paths_follow_naming_scheme() {
        let paths = HostPaths {
            disk_dir: PathBuf::from("/var/lib/castellan/disks"),
            socket_dir: PathBuf::from("/run/castellan"),
            pidfile_dir: PathBuf::from("/run/castellan"),
            uefi_template: None,
            rom_dir: PathBuf::from("/usr/share/castellan/roms"),
        };
        assert_eq!(
            paths.disk_path("vm-v1", 0),
            PathBuf::from("/var/lib/castellan/disks/vm-v1.qcow2")
        );
        assert_eq!(
            paths.disk_path("vm-v1", 2),
            PathBuf::from("/var/lib/castellan/disks/vm-v1-disk2.qcow2")
        );
        assert_eq!(
            paths.monitor_socket("vm-v1"),
            PathBuf::from("/run/castellan/vm-v1.sock")
        );
        assert_eq!(
            paths.pidfile("vm-v1"),
            PathBuf::from("/run/castellan/vm-v1.pid")
        );
    }
}
