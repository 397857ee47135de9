//! Canonicalization of user-supplied and persisted tunables.
//!
//! Every tunable is funneled through a small canonicalizer that returns the
//! effective value and records a warning diagnostic whenever it substitutes
//! the input.

use std::ffi::CString;
use std::fs;
use std::net::TcpListener;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use sysinfo::System;

use crate::config::{
    CreateRequest, DEFAULT_DISPLAY_PORT, DISPLAY_PORT_SCAN_WINDOW, DiskBus, DiskCacheMode,
    EffectiveTunables, PassthroughSpec, PinningStrategy, VmSpec,
};
use crate::core::cpuset::CpusetManager;
use crate::core::diagnostics::{Diagnostic, Severity};
use crate::error::{Error, Result};

const MAX_NETWORK_QUEUES: u32 = 4;

/// Per-OS-family driver defaults. Explicit configuration wins, then the
/// preset, then the hardcoded virtio default.
#[derive(Debug, Clone, Copy)]
pub struct DriverPreset {
    pub disk_bus: DiskBus,
    pub disk_cache: DiskCacheMode,
    pub network_model: &'static str,
}

const DEFAULT_PRESET: DriverPreset = DriverPreset {
    disk_bus: DiskBus::Virtio,
    disk_cache: DiskCacheMode::Writeback,
    network_model: "virtio-net-pci",
};

/// Canonical OS family of a free-form OS string.
pub fn os_family(os: &str) -> Option<&'static str> {
    let lower = os.to_lowercase();
    if lower.contains("ubuntu") {
        return Some("ubuntu");
    }
    if lower.contains("windows") {
        return Some("windows");
    }
    if lower.contains("fedora") || lower.contains("redhat") || lower.contains("rhel") {
        return Some("fedora");
    }
    None
}

/// Whether install media targeting `media_os` may be attached to a machine
/// whose OS is `machine_os`.
pub fn os_family_matches(media_os: &str, machine_os: &str) -> bool {
    match (os_family(media_os), os_family(machine_os)) {
        (Some(media), Some(machine)) => media == machine,
        _ => false,
    }
}

pub fn driver_preset(os: &str) -> DriverPreset {
    match os_family(os) {
        // Windows installers lack virtio drivers out of the box.
        Some("windows") => DriverPreset {
            disk_bus: DiskBus::Sata,
            disk_cache: DiskCacheMode::Writeback,
            network_model: "e1000",
        },
        _ => DEFAULT_PRESET,
    }
}

fn substitution(diags: &mut Vec<Diagnostic>, what: &str, given: &str, used: &str) {
    diags.push(Diagnostic::new(
        Severity::Warning,
        format!("Unsupported {what} `{given}`; using `{used}`."),
    ));
}

pub fn canonical_machine_type(input: Option<&str>, diags: &mut Vec<Diagnostic>) -> String {
    match input {
        None => "q35".to_string(),
        Some(value) if value == "q35" || value == "pc" => value.to_string(),
        Some(other) => {
            substitution(diags, "machine type", other, "q35");
            "q35".to_string()
        }
    }
}

pub fn canonical_network_model(
    input: Option<&str>,
    preset: &DriverPreset,
    diags: &mut Vec<Diagnostic>,
) -> String {
    match input {
        None => preset.network_model.to_string(),
        Some(value) if value == "virtio-net-pci" || value == "e1000" => value.to_string(),
        Some(other) => {
            substitution(diags, "network model", other, preset.network_model);
            preset.network_model.to_string()
        }
    }
}

/// Explicit values clamp into `[1, 4]`; otherwise `min(cpu_cores, 4)`.
pub fn canonical_network_queues(
    explicit: Option<u32>,
    cpu_cores: u32,
    diags: &mut Vec<Diagnostic>,
) -> u32 {
    match explicit {
        Some(queues) => {
            let clamped = queues.clamp(1, MAX_NETWORK_QUEUES);
            if clamped != queues {
                substitution(
                    diags,
                    "network queue count",
                    &queues.to_string(),
                    &clamped.to_string(),
                );
            }
            clamped
        }
        None => cpu_cores.clamp(1, MAX_NETWORK_QUEUES),
    }
}

/// Display ports must sit in `[5900, 65535]`; anything else coerces to the
/// default base.
pub fn canonical_display_port(requested: Option<u32>, diags: &mut Vec<Diagnostic>) -> u16 {
    match requested {
        None => DEFAULT_DISPLAY_PORT,
        Some(port) if (DEFAULT_DISPLAY_PORT as u32..=u16::MAX as u32).contains(&port) => {
            port as u16
        }
        Some(out_of_range) => {
            substitution(
                diags,
                "display port",
                &out_of_range.to_string(),
                &DEFAULT_DISPLAY_PORT.to_string(),
            );
            DEFAULT_DISPLAY_PORT
        }
    }
}

/// Scan upward from `base`, transiently binding each candidate, until a
/// free port is found. At most [`DISPLAY_PORT_SCAN_WINDOW`] candidates are
/// probed.
pub fn allocate_display_port(base: u16) -> Result<u16> {
    for offset in 0..DISPLAY_PORT_SCAN_WINDOW {
        let Some(port) = base.checked_add(offset) else {
            break;
        };
        match TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => {
                drop(listener);
                return Ok(port);
            }
            Err(_) => continue,
        }
    }
    Err(Error::ResourceUnavailable {
        message: format!(
            "no free display port in [{base}, {}]",
            base.saturating_add(DISPLAY_PORT_SCAN_WINDOW - 1)
        ),
    })
}

/// Firmware must exist and be readable; otherwise the machine boots BIOS.
pub fn canonical_firmware(
    input: Option<&Path>,
    diags: &mut Vec<Diagnostic>,
) -> Option<PathBuf> {
    let path = input?;
    if fs::File::open(path).is_ok() {
        return Some(path.to_path_buf());
    }
    diags.push(
        Diagnostic::new(
            Severity::Warning,
            format!(
                "UEFI firmware {} is missing or unreadable; falling back to BIOS boot.",
                path.display()
            ),
        )
        .with_path(path.to_path_buf()),
    );
    None
}

/// Hugepages require a writable hugetlbfs mount at the expected location.
pub fn hugepages_available(hugepages_dir: &Path, proc_mounts: &Path) -> bool {
    if !hugepages_dir.is_dir() || !is_writable(hugepages_dir) {
        return false;
    }
    let Ok(mounts) = fs::read_to_string(proc_mounts) else {
        return false;
    };
    mounts.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let _device = fields.next();
        let mountpoint = fields.next();
        let fstype = fields.next();
        mountpoint == hugepages_dir.to_str() && fstype == Some("hugetlbfs")
    })
}

pub fn canonical_hugepages(
    requested: bool,
    available: bool,
    diags: &mut Vec<Diagnostic>,
) -> bool {
    if requested && !available {
        diags.push(Diagnostic::new(
            Severity::Warning,
            "Hugepages requested but no writable hugetlbfs mount was found; disabling.",
        ));
        return false;
    }
    requested
}

fn is_writable(path: &Path) -> bool {
    let Ok(raw) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(raw.as_ptr(), libc::W_OK) == 0 }
}

/// Normalize a passthrough ROM path and require it to stay inside the
/// allowed directory.
pub fn validate_rom_path(path: &Path, rom_dir: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        rom_dir.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(Error::InvalidConfig {
                        message: format!("ROM path {} escapes the root", path.display()),
                    });
                }
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    if !normalized.starts_with(rom_dir) {
        return Err(Error::InvalidConfig {
            message: format!(
                "ROM path {} must live under {}",
                path.display(),
                rom_dir.display()
            ),
        });
    }
    Ok(normalized)
}

/// `hhhh:hh:hh.f` with hex digits and a function in `0..=7`.
pub fn validate_pci_address(address: &str) -> Result<()> {
    let invalid = || Error::InvalidConfig {
        message: format!("`{address}` is not a valid PCI address (expected hhhh:hh:hh.f)"),
    };

    let (bus_part, function) = address.rsplit_once('.').ok_or_else(invalid)?;
    if function.len() != 1 || !matches!(function.chars().next(), Some('0'..='7')) {
        return Err(invalid());
    }

    let segments: Vec<&str> = bus_part.split(':').collect();
    let [domain, bus, device] = segments.as_slice() else {
        return Err(invalid());
    };
    for (segment, width) in [(domain, 4), (bus, 2), (device, 2)] {
        if segment.len() != width || !segment.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(invalid());
        }
    }
    Ok(())
}

pub fn validate_passthrough(spec: &PassthroughSpec, rom_dir: &Path) -> Result<()> {
    validate_pci_address(&spec.gpu_address)?;
    if let Some(audio) = &spec.audio_address {
        validate_pci_address(audio)?;
        if audio == &spec.gpu_address {
            return Err(Error::InvalidConfig {
                message: "GPU and audio passthrough addresses must differ".to_string(),
            });
        }
    }
    if let Some(rom) = &spec.rom_path {
        validate_rom_path(rom, rom_dir)?;
    }
    Ok(())
}

/// Deterministic locally-administered MAC derived from the machine id.
pub fn derive_mac(vm_id: &str) -> String {
    let digest = Sha256::digest(vm_id.as_bytes());
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        digest[0], digest[1], digest[2]
    )
}

/// Number of logical CPUs on this host.
pub fn host_cpu_count() -> usize {
    let system = System::new_all();
    system.cpus().len()
}

/// Structural validation of a create request. Returns substitution
/// warnings; hard violations are errors.
pub fn validate_create_request(
    request: &CreateRequest,
    host_cpus: usize,
    rom_dir: &Path,
) -> Result<Vec<Diagnostic>> {
    let mut diags = Vec::new();

    if request.vm_id.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "vm_id must not be empty".to_string(),
        });
    }
    if request.name.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "name must not be empty".to_string(),
        });
    }
    if request.internal_name.is_empty()
        || !request
            .internal_name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(Error::InvalidConfig {
            message: format!(
                "internal name `{}` must be non-empty and filesystem-safe",
                request.internal_name
            ),
        });
    }
    if request.os.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "os must not be empty".to_string(),
        });
    }

    let spec = &request.spec;
    if spec.cpu_cores == 0 {
        return Err(Error::InvalidConfig {
            message: "cpu_cores must be at least 1".to_string(),
        });
    }
    if spec.cpu_cores as usize > host_cpus {
        return Err(Error::InvalidConfig {
            message: format!(
                "cpu_cores {} exceeds host CPU count {host_cpus}",
                spec.cpu_cores
            ),
        });
    }
    if spec.ram_gb == 0 {
        return Err(Error::InvalidConfig {
            message: "ram_gb must be at least 1".to_string(),
        });
    }
    if spec.disks.is_empty() {
        return Err(Error::InvalidConfig {
            message: "at least one disk is required".to_string(),
        });
    }
    if spec.disks.iter().any(|disk| disk.size_gb == 0) {
        return Err(Error::InvalidConfig {
            message: "disk sizes must be at least 1 GB".to_string(),
        });
    }
    if spec.bridge.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "bridge must not be empty".to_string(),
        });
    }

    if let Some(cores) = &spec.cpu_pinning {
        CpusetManager::validate_cores(cores, host_cpus)?;
    }
    if let Some(passthrough) = &spec.passthrough {
        validate_passthrough(passthrough, rom_dir)?;
    }
    if let Some(install) = &spec.unattended_install {
        if !os_family_matches(&install.os, &request.os) {
            return Err(Error::InvalidConfig {
                message: format!(
                    "unattended install media targets `{}` but the machine runs `{}`",
                    install.os, request.os
                ),
            });
        }
    }

    // Substitutable tunables only produce warnings here; the effective
    // values are resolved right before command assembly.
    canonical_display_port(spec.display.port, &mut diags);
    Ok(diags)
}

/// Resolve the effective tunables for command assembly and persistence.
pub fn resolve_effective(
    spec: &VmSpec,
    os: &str,
    hugepages_dir: &Path,
    proc_mounts: &Path,
    diags: &mut Vec<Diagnostic>,
) -> EffectiveTunables {
    let preset = driver_preset(os);
    let disk_bus = spec
        .disks
        .first()
        .and_then(|disk| disk.bus)
        .unwrap_or(preset.disk_bus);
    let disk_cache = spec
        .disks
        .first()
        .and_then(|disk| disk.cache)
        .unwrap_or(preset.disk_cache);

    EffectiveTunables {
        machine_type: canonical_machine_type(spec.machine_type.as_deref(), diags),
        disk_bus,
        disk_cache,
        network_model: canonical_network_model(spec.network_model.as_deref(), &preset, diags),
        network_queues: canonical_network_queues(spec.network_queues, spec.cpu_cores, diags),
        firmware: canonical_firmware(spec.firmware.as_deref(), diags),
        hugepages: canonical_hugepages(
            spec.hugepages,
            hugepages_available(hugepages_dir, proc_mounts),
            diags,
        ),
        pinning_strategy: spec.pinning_strategy.unwrap_or(PinningStrategy::Basic),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn display_port_boundaries() {
        let mut diags = Vec::new();
        assert_eq!(canonical_display_port(None, &mut diags), 5900);
        assert_eq!(canonical_display_port(Some(5899), &mut diags), 5900);
        assert_eq!(canonical_display_port(Some(65536), &mut diags), 5900);
        assert_eq!(canonical_display_port(Some(5901), &mut diags), 5901);
        assert_eq!(canonical_display_port(Some(65535), &mut diags), 65535);
        assert_eq!(diags.len(), 2, "two substitutions warned: {diags:?}");
    }

    #[test]
    fn display_port_allocation_skips_busy_ports() {
        // Grab an ephemeral port, then allocate starting from it; the next
        // port up must be returned.
        let holder = TcpListener::bind("127.0.0.1:0").expect("bind");
        let base = holder.local_addr().expect("addr").port();
        let allocated = allocate_display_port(base).expect("allocate");
        assert!(allocated > base);
        drop(holder);
        let allocated = allocate_display_port(base).expect("allocate");
        assert_eq!(allocated, base);
    }

    #[test]
    fn network_queue_clamping() {
        let mut diags = Vec::new();
        assert_eq!(canonical_network_queues(Some(0), 2, &mut diags), 1);
        assert_eq!(canonical_network_queues(Some(99), 2, &mut diags), 4);
        assert_eq!(canonical_network_queues(Some(3), 2, &mut diags), 3);
        assert_eq!(diags.len(), 2);

        let mut diags = Vec::new();
        assert_eq!(canonical_network_queues(None, 2, &mut diags), 2);
        assert_eq!(canonical_network_queues(None, 16, &mut diags), 4);
        assert!(diags.is_empty());
    }

    #[test]
    fn machine_type_and_network_model_substitution() {
        let mut diags = Vec::new();
        assert_eq!(canonical_machine_type(Some("q35"), &mut diags), "q35");
        assert_eq!(canonical_machine_type(Some("i440fx"), &mut diags), "q35");
        assert_eq!(canonical_machine_type(None, &mut diags), "q35");

        let preset = driver_preset("ubuntu24.04");
        assert_eq!(
            canonical_network_model(Some("rtl8139"), &preset, &mut diags),
            "virtio-net-pci"
        );
        assert_eq!(diags.len(), 2);
    }

    #[test]
    fn firmware_requires_readable_file() {
        let dir = tempdir().expect("tempdir");
        let firmware = dir.path().join("OVMF.fd");

        let mut diags = Vec::new();
        assert!(canonical_firmware(Some(&firmware), &mut diags).is_none());
        assert_eq!(diags.len(), 1);

        std::fs::write(&firmware, b"firmware").expect("write");
        let mut diags = Vec::new();
        assert_eq!(
            canonical_firmware(Some(&firmware), &mut diags),
            Some(firmware)
        );
        assert!(diags.is_empty());
    }

    #[test]
    fn hugepages_check_consults_mounts() {
        let dir = tempdir().expect("tempdir");
        let hugepages = dir.path().join("hugepages");
        std::fs::create_dir(&hugepages).expect("dir");
        let mounts = dir.path().join("mounts");

        std::fs::write(&mounts, "none /dev/shm tmpfs rw 0 0\n").expect("mounts");
        assert!(!hugepages_available(&hugepages, &mounts));

        std::fs::write(
            &mounts,
            format!("hugetlbfs {} hugetlbfs rw,relatime 0 0\n", hugepages.display()),
        )
        .expect("mounts");
        assert!(hugepages_available(&hugepages, &mounts));

        let mut diags = Vec::new();
        assert!(!canonical_hugepages(true, false, &mut diags));
        assert_eq!(diags.len(), 1);
        assert!(canonical_hugepages(true, true, &mut diags));
        assert!(!canonical_hugepages(false, false, &mut diags));
    }

    #[test]
    fn rom_paths_must_stay_in_allowed_directory() {
        let roms = Path::new("/usr/share/castellan/roms");
        assert_eq!(
            validate_rom_path(Path::new("gpu.rom"), roms).expect("relative"),
            roms.join("gpu.rom")
        );
        assert!(validate_rom_path(Path::new("../secrets.rom"), roms).is_err());
        assert!(validate_rom_path(Path::new("/etc/passwd"), roms).is_err());
        assert_eq!(
            validate_rom_path(Path::new("/usr/share/castellan/roms/sub/x.rom"), roms)
                .expect("absolute inside"),
            roms.join("sub/x.rom")
        );
    }

    #[test]
    fn pci_address_pattern() {
        assert!(validate_pci_address("0000:01:00.0").is_ok());
        assert!(validate_pci_address("abcd:ff:1f.7").is_ok());
        assert!(validate_pci_address("0000:01:00.8").is_err());
        assert!(validate_pci_address("0000:01:00").is_err());
        assert!(validate_pci_address("00:01:00.0").is_err());
        assert!(validate_pci_address("zzzz:01:00.0").is_err());
    }

    #[test]
    fn gpu_and_audio_addresses_must_differ() {
        let roms = Path::new("/usr/share/castellan/roms");
        let mut spec = PassthroughSpec {
            gpu_address: "0000:01:00.0".to_string(),
            audio_address: Some("0000:01:00.1".to_string()),
            rom_path: None,
        };
        assert!(validate_passthrough(&spec, roms).is_ok());
        spec.audio_address = Some("0000:01:00.0".to_string());
        assert!(validate_passthrough(&spec, roms).is_err());
    }

    #[test]
    fn os_family_substring_rules() {
        assert!(os_family_matches("ubuntu-24.04-server", "ubuntu"));
        assert!(os_family_matches("windows", "windows10"));
        assert!(os_family_matches("windows", "windows11"));
        assert!(os_family_matches("rhel9", "fedora"));
        assert!(os_family_matches("redhat-enterprise", "fedora"));
        assert!(!os_family_matches("windows", "ubuntu"));
        assert!(!os_family_matches("debian", "ubuntu"));
    }

    #[test]
    fn mac_derivation_is_deterministic_and_local() {
        let mac = derive_mac("v1");
        assert_eq!(mac, derive_mac("v1"));
        assert_ne!(mac, derive_mac("v2"));
        let shape = regex::Regex::new(r"^52:54:00(:[0-9a-f]{2}){3}$").expect("pattern");
        assert!(shape.is_match(&mac), "{mac}");
    }
}
