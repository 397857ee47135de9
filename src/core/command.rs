//! Hypervisor command assembly.
//!
//! The lifecycle paths consume the [`CommandBuilder`] contract; the
//! bundled [`QemuCommandBuilder`] assembles a QEMU argv. Hosts with a
//! different hypervisor or wrapper scheme substitute their own builder.

use std::path::{Path, PathBuf};

use crate::config::{DiskBus, DisplayKind, EffectiveTunables, PinningStrategy};
use crate::core::store::VmRecord;
use crate::core::supervisor::LaunchWrapper;
use crate::error::{Error, Result};

/// Everything a builder needs to assemble one launch.
#[derive(Debug)]
pub struct BuildContext<'a> {
    pub record: &'a VmRecord,
    pub effective: &'a EffectiveTunables,
    pub disk_paths: &'a [PathBuf],
    pub tap: &'a str,
    pub mac: &'a str,
    pub display_port: u16,
    pub monitor_socket: &'a Path,
    pub pidfile: &'a Path,
    /// UEFI variable store, present when the machine boots UEFI.
    pub uefi_vars: Option<&'a Path>,
    /// Generated unattended-install media to attach, if any.
    pub install_iso: Option<&'a Path>,
}

/// Assembled hypervisor invocation.
#[derive(Debug, Clone)]
pub struct VmCommand {
    pub command: PathBuf,
    pub args: Vec<String>,
    /// CPU-pinning launcher that receives the hypervisor command as its
    /// first non-option argument.
    pub wrapper: Option<LaunchWrapper>,
    pub daemonize: bool,
    pub pidfile: Option<PathBuf>,
}

/// Contract for hypervisor argument assembly.
pub trait CommandBuilder: Send + Sync {
    fn build(&self, ctx: &BuildContext<'_>) -> Result<VmCommand>;
}

/// Builds a QEMU system-emulator argv.
#[derive(Debug, Clone)]
pub struct QemuCommandBuilder {
    binary: PathBuf,
    hugepages_dir: PathBuf,
}

impl QemuCommandBuilder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            hugepages_dir: PathBuf::from("/dev/hugepages"),
        }
    }

    /// Locate the system emulator in `PATH`.
    pub fn discover() -> Result<Self> {
        find_executable(&["qemu-system-x86_64", "qemu-system-aarch64"])
            .map(Self::new)
            .ok_or_else(|| Error::InvalidConfig {
                message: "qemu-system binary not found in PATH".to_string(),
            })
    }
}

impl CommandBuilder for QemuCommandBuilder {
    fn build(&self, ctx: &BuildContext<'_>) -> Result<VmCommand> {
        let record = ctx.record;
        let spec = &record.spec;
        let effective = ctx.effective;
        let mut args: Vec<String> = Vec::new();

        args.push("-name".into());
        args.push(record.internal_name.clone());
        args.push("-machine".into());
        args.push(format!("{},accel=kvm", effective.machine_type));
        args.push("-cpu".into());
        args.push("host".into());
        args.push("-smp".into());
        args.push(spec.cpu_cores.to_string());
        args.push("-m".into());
        args.push(format!("{}G", spec.ram_gb));
        args.push("-daemonize".into());
        args.push("-pidfile".into());
        args.push(ctx.pidfile.display().to_string());

        if effective.hugepages {
            args.push("-mem-path".into());
            args.push(self.hugepages_dir.display().to_string());
        }

        if let Some(firmware) = &effective.firmware {
            args.push("-drive".into());
            args.push(format!(
                "if=pflash,format=raw,readonly=on,file={}",
                firmware.display()
            ));
            if let Some(vars) = ctx.uefi_vars {
                args.push("-drive".into());
                args.push(format!("if=pflash,format=raw,file={}", vars.display()));
            }
        }

        for (index, (disk, path)) in spec.disks.iter().zip(ctx.disk_paths).enumerate() {
            let bus = disk.bus.unwrap_or(effective.disk_bus);
            let cache = disk.cache.unwrap_or(effective.disk_cache);
            let format = disk.format.as_deref().unwrap_or("qcow2");
            let mut drive = format!(
                "file={},if={},cache={},format={},index={index}",
                path.display(),
                drive_interface(bus),
                cache.as_str(),
                format
            );
            if disk.discard.unwrap_or(false) {
                drive.push_str(",discard=unmap");
            }
            args.push("-drive".into());
            args.push(drive);
        }

        args.push("-netdev".into());
        let mut netdev = format!(
            "tap,id=net0,ifname={},script=no,downscript=no",
            ctx.tap
        );
        if effective.network_queues > 1 {
            netdev.push_str(&format!(",queues={}", effective.network_queues));
        }
        args.push(netdev);
        args.push("-device".into());
        let mut netdevice = format!("{},netdev=net0,mac={}", effective.network_model, ctx.mac);
        if effective.network_queues > 1 && effective.network_model == "virtio-net-pci" {
            netdevice.push_str(&format!(
                ",mq=on,vectors={}",
                2 * effective.network_queues + 2
            ));
        }
        args.push(netdevice);

        match spec.display.kind {
            DisplayKind::Spice => {
                let mut parts = vec![format!("port={}", ctx.display_port)];
                match &spec.display.password {
                    Some(password) => parts.push(format!("password={password}")),
                    None => parts.push("disable-ticketing=on".to_string()),
                }
                if let Some(addr) = &spec.display.addr {
                    parts.push(format!("addr={addr}"));
                }
                args.push("-spice".into());
                args.push(parts.join(","));
                args.push("-vga".into());
                args.push("qxl".into());
            }
            DisplayKind::Vnc => {
                let addr = spec.display.addr.as_deref().unwrap_or("127.0.0.1");
                // VNC displays are numbered relative to 5900.
                let display = ctx.display_port.saturating_sub(5900);
                args.push("-vnc".into());
                args.push(format!("{addr}:{display}"));
                args.push("-vga".into());
                args.push("std".into());
            }
        }
        args.push("-display".into());
        args.push("none".into());

        args.push("-qmp".into());
        args.push(format!(
            "unix:{},server=on,wait=off",
            ctx.monitor_socket.display()
        ));

        if spec.balloon {
            args.push("-device".into());
            args.push("virtio-balloon-pci".into());
        }
        if spec.tablet_enabled {
            args.push("-usb".into());
            args.push("-device".into());
            args.push("usb-tablet".into());
        }
        if spec.audio_enabled {
            args.push("-audiodev".into());
            args.push("spice,id=audio0".into());
            args.push("-device".into());
            args.push("intel-hda".into());
            args.push("-device".into());
            args.push("hda-duplex,audiodev=audio0".into());
        }

        if let Some(tpm) = &spec.tpm_socket {
            args.push("-chardev".into());
            args.push(format!("socket,id=chrtpm,path={}", tpm.display()));
            args.push("-tpmdev".into());
            args.push("emulator,id=tpm0,chardev=chrtpm".into());
            args.push("-device".into());
            args.push("tpm-tis,tpmdev=tpm0".into());
        }

        let mut serial_ports: Vec<(String, &Path, &str)> = Vec::new();
        if let Some(path) = &spec.guest_agent_socket {
            serial_ports.push(("qga0".into(), path, "org.qemu.guest_agent.0"));
        }
        if let Some(path) = &spec.host_agent_socket {
            serial_ports.push(("hostsvc0".into(), path, "org.castellan.agent.0"));
        }
        if !serial_ports.is_empty() {
            args.push("-device".into());
            args.push("virtio-serial-pci".into());
            for (id, path, name) in serial_ports {
                args.push("-chardev".into());
                args.push(format!(
                    "socket,id={id},path={},server=on,wait=off",
                    path.display()
                ));
                args.push("-device".into());
                args.push(format!("virtserialport,chardev={id},name={name}"));
            }
        }

        if let Some(passthrough) = &spec.passthrough {
            args.push("-device".into());
            let mut vfio = format!("vfio-pci,host={}", passthrough.gpu_address);
            if let Some(rom) = &passthrough.rom_path {
                vfio.push_str(&format!(",romfile={}", rom.display()));
            }
            args.push(vfio);
            if let Some(audio) = &passthrough.audio_address {
                args.push("-device".into());
                args.push(format!("vfio-pci,host={audio}"));
            }
        }

        for iso in [spec.driver_iso.as_deref(), ctx.install_iso] {
            if let Some(iso) = iso {
                args.push("-drive".into());
                args.push(format!("file={},media=cdrom", iso.display()));
            }
        }

        let wrapper = match (spec.pinning_strategy, &spec.cpu_pinning) {
            (Some(PinningStrategy::Hybrid), Some(cores)) if !cores.is_empty() => {
                Some(LaunchWrapper {
                    command: PathBuf::from("taskset"),
                    args: vec![
                        "-c".to_string(),
                        cores
                            .iter()
                            .map(|core| core.to_string())
                            .collect::<Vec<_>>()
                            .join(","),
                    ],
                })
            }
            _ => None,
        };

        Ok(VmCommand {
            command: self.binary.clone(),
            args,
            wrapper,
            daemonize: true,
            pidfile: Some(ctx.pidfile.to_path_buf()),
        })
    }
}

fn drive_interface(bus: DiskBus) -> &'static str {
    match bus {
        DiskBus::Virtio => "virtio",
        DiskBus::Scsi => "scsi",
        DiskBus::Ide => "ide",
        DiskBus::Sata => "sata",
    }
}

/// Search `PATH` for the first matching executable.
pub fn find_executable(candidates: &[&str]) -> Option<PathBuf> {
    for candidate in candidates {
        let path = Path::new(candidate);
        if path.is_file() {
            return Some(path.to_path_buf());
        }
    }

    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        for candidate in candidates {
            let full = dir.join(candidate);
            if full.is_file() {
                return Some(full);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::config::{DiskCacheMode, MachineStatus, RuntimeState};
    use crate::core::store::contract_tests::sample_record;

    use super::*;

    fn sample_context<'a>(
        record: &'a VmRecord,
        effective: &'a EffectiveTunables,
        disks: &'a [PathBuf],
    ) -> BuildContext<'a> {
        BuildContext {
            record,
            effective,
            disk_paths: disks,
            tap: "vnet-v1",
            mac: "52:54:00:aa:bb:cc",
            display_port: 5901,
            monitor_socket: Path::new("/run/castellan/vm-v1.sock"),
            pidfile: Path::new("/run/castellan/vm-v1.pid"),
            uefi_vars: None,
            install_iso: None,
        }
    }

    fn effective() -> EffectiveTunables {
        EffectiveTunables {
            machine_type: "q35".to_string(),
            disk_bus: DiskBus::Virtio,
            disk_cache: DiskCacheMode::Writeback,
            network_model: "virtio-net-pci".to_string(),
            network_queues: 2,
            firmware: None,
            hugepages: false,
            pinning_strategy: crate::config::PinningStrategy::Basic,
        }
    }

    #[test]
    fn builds_a_daemonized_qemu_argv() {
        let mut record = sample_record("v1");
        record.status = MachineStatus::Off;
        record.runtime = RuntimeState::default();
        let effective = effective();
        let disks = vec![PathBuf::from("/var/lib/castellan/disks/vm-v1.qcow2")];

        let builder = QemuCommandBuilder::new("/usr/bin/qemu-system-x86_64");
        let command = builder
            .build(&sample_context(&record, &effective, &disks))
            .expect("build");

        assert!(command.daemonize);
        assert_eq!(
            command.pidfile.as_deref(),
            Some(Path::new("/run/castellan/vm-v1.pid"))
        );
        let joined = command.args.join(" ");
        assert!(joined.contains("-daemonize"), "{joined}");
        assert!(joined.contains("-pidfile /run/castellan/vm-v1.pid"), "{joined}");
        assert!(
            joined.contains(
                "file=/var/lib/castellan/disks/vm-v1.qcow2,if=virtio,cache=writeback,format=qcow2,index=0"
            ),
            "{joined}"
        );
        assert!(
            joined.contains("tap,id=net0,ifname=vnet-v1,script=no,downscript=no,queues=2"),
            "{joined}"
        );
        assert!(
            joined.contains("virtio-net-pci,netdev=net0,mac=52:54:00:aa:bb:cc,mq=on,vectors=6"),
            "{joined}"
        );
        assert!(
            joined.contains("unix:/run/castellan/vm-v1.sock,server=on,wait=off"),
            "{joined}"
        );
        assert!(joined.contains("port=5901"), "{joined}");
        assert!(command.wrapper.is_none());
    }

    #[test]
    fn hybrid_pinning_adds_the_wrapper() {
        let mut record = sample_record("v1");
        record.spec.pinning_strategy = Some(PinningStrategy::Hybrid);
        record.spec.cpu_pinning = Some(vec![0, 2]);
        let effective = effective();
        let disks = vec![PathBuf::from("/d.qcow2")];

        let builder = QemuCommandBuilder::new("/usr/bin/qemu-system-x86_64");
        let command = builder
            .build(&sample_context(&record, &effective, &disks))
            .expect("build");
        let wrapper = command.wrapper.expect("wrapper");
        assert_eq!(wrapper.command, PathBuf::from("taskset"));
        assert_eq!(wrapper.args, ["-c", "0,2"]);
    }

    #[test]
    fn uefi_and_install_media_are_attached() {
        let record = sample_record("v1");
        let mut tunables = effective();
        tunables.firmware = Some(PathBuf::from("/usr/share/OVMF/OVMF_CODE.fd"));
        let disks = vec![PathBuf::from("/d.qcow2")];
        let mut ctx = sample_context(&record, &tunables, &disks);
        let vars = PathBuf::from("/var/lib/castellan/disks/uefi-vars-v1.fd");
        ctx.uefi_vars = Some(&vars);
        let iso = PathBuf::from("/tmp/install-v1.iso");
        ctx.install_iso = Some(&iso);

        let builder = QemuCommandBuilder::new("/usr/bin/qemu-system-x86_64");
        let command = builder.build(&ctx).expect("build");
        let joined = command.args.join(" ");
        assert!(
            joined.contains("if=pflash,format=raw,readonly=on,file=/usr/share/OVMF/OVMF_CODE.fd"),
            "{joined}"
        );
        assert!(
            joined.contains("if=pflash,format=raw,file=/var/lib/castellan/disks/uefi-vars-v1.fd"),
            "{joined}"
        );
        assert!(joined.contains("file=/tmp/install-v1.iso,media=cdrom"), "{joined}");
    }
}
