//! Top-level machine lifecycle orchestration.
//!
//! Composes the monitor client, process supervisor, resource facilities,
//! store and watcher into transactional lifecycle operations. Every
//! create/start threads a cleanup ledger recording each side effect so a
//! failure at any step can restore the pre-call state; partial progress
//! never leaks.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{CreateRequest, HostPaths, MachineStatus};
use crate::core::command::{BuildContext, CommandBuilder, QemuCommandBuilder};
use crate::core::cpuset::CpusetManager;
use crate::core::diagnostics::{Diagnostic, Severity};
use crate::core::events::{CrudAction, Event, EventBus};
use crate::core::firewall::FirewallManager;
use crate::core::images::{ImageTool, MediaBuilder, NoMediaBuilder, QemuImgTool};
use crate::core::monitor::{MonitorClient, MonitorConfig, ReconnectPolicy};
use crate::core::net::TapManager;
use crate::core::options::StopOptions;
use crate::core::outcome::{
    CreateOutcome, DestroyOutcome, OperationOutput, OperationResult, StartOutcome, StatusOutcome,
    StopOutcome,
};
use crate::core::runner::{ShellRunner, SystemRunner};
use crate::core::store::{MachineStore, RuntimeUpdate, VmRecord};
use crate::core::supervisor::{LaunchPlan, Supervisor, process_alive, wait_for_exit};
use crate::core::validate;
use crate::core::watcher::MachineWatcher;
use crate::error::{Error, Result};

/// Settle delays used during rollback; the kernel needs a moment to
/// release device and filter-table references after a force-kill.
const ROLLBACK_KILL_SETTLE: Duration = Duration::from_millis(500);
const ROLLBACK_LINK_SETTLE: Duration = Duration::from_millis(200);

const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(2);
const FORCE_KILL_CONFIRM: Duration = Duration::from_secs(5);
const INSTALL_POLL: Duration = Duration::from_secs(5);
const INSTALL_WATCH_LIMIT: Duration = Duration::from_secs(4 * 60 * 60);

/// Builder for [`LifecycleManager`]; every collaborator can be swapped.
pub struct LifecycleBuilder {
    store: Arc<dyn MachineStore>,
    paths: HostPaths,
    runner: Arc<dyn SystemRunner>,
    command_builder: Option<Arc<dyn CommandBuilder>>,
    image_tool: Option<Arc<dyn ImageTool>>,
    media_builder: Arc<dyn MediaBuilder>,
    bus: EventBus,
    events: Option<Sender<Event>>,
    monitor_config: MonitorConfig,
    host_cpus: Option<usize>,
    hugepages_dir: PathBuf,
    proc_mounts: PathBuf,
    sysfs_net: Option<PathBuf>,
    cgroup_root: Option<PathBuf>,
    restart_delay: Duration,
}

impl LifecycleBuilder {
    pub fn new(store: Arc<dyn MachineStore>, paths: HostPaths) -> Self {
        Self {
            store,
            paths,
            runner: Arc::new(ShellRunner),
            command_builder: None,
            image_tool: None,
            media_builder: Arc::new(NoMediaBuilder),
            bus: EventBus::disabled(),
            events: None,
            monitor_config: MonitorConfig {
                reconnect: Some(ReconnectPolicy {
                    max_attempts: 3,
                    delay: Duration::from_secs(1),
                }),
                ..MonitorConfig::default()
            },
            host_cpus: None,
            hugepages_dir: PathBuf::from("/dev/hugepages"),
            proc_mounts: PathBuf::from("/proc/mounts"),
            sysfs_net: None,
            cgroup_root: None,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn SystemRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_command_builder(mut self, builder: Arc<dyn CommandBuilder>) -> Self {
        self.command_builder = Some(builder);
        self
    }

    pub fn with_image_tool(mut self, tool: Arc<dyn ImageTool>) -> Self {
        self.image_tool = Some(tool);
        self
    }

    pub fn with_media_builder(mut self, media: Arc<dyn MediaBuilder>) -> Self {
        self.media_builder = media;
        self
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_events(mut self, events: Sender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_monitor_config(mut self, config: MonitorConfig) -> Self {
        self.monitor_config = config;
        self
    }

    pub fn with_host_cpus(mut self, cpus: usize) -> Self {
        self.host_cpus = Some(cpus);
        self
    }

    pub fn with_hugepages_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.hugepages_dir = dir.into();
        self
    }

    pub fn with_proc_mounts(mut self, mounts: impl Into<PathBuf>) -> Self {
        self.proc_mounts = mounts.into();
        self
    }

    pub fn with_sysfs_net(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_net = Some(root.into());
        self
    }

    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = Some(root.into());
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn build(self) -> Result<LifecycleManager> {
        let command_builder = match self.command_builder {
            Some(builder) => builder,
            None => Arc::new(QemuCommandBuilder::discover()?),
        };
        let image_tool = match self.image_tool {
            Some(tool) => tool,
            None => Arc::new(QemuImgTool::new(Arc::clone(&self.runner))),
        };

        let mut net = TapManager::new(Arc::clone(&self.runner));
        if let Some(root) = self.sysfs_net {
            net = net.with_sysfs_root(root);
        }
        let net = Arc::new(net);
        let firewall = Arc::new(FirewallManager::new(Arc::clone(&self.runner)));
        let mut cpuset = CpusetManager::new();
        if let Some(root) = self.cgroup_root {
            cpuset = cpuset.with_root(root);
        }
        let cpuset = Arc::new(cpuset);

        let watcher = Arc::new(MachineWatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&net),
            Arc::clone(&firewall),
            Arc::clone(&cpuset),
            self.bus.clone(),
            self.events.clone(),
        ));

        Ok(LifecycleManager {
            store: self.store,
            paths: self.paths,
            net,
            firewall,
            cpuset,
            builder: command_builder,
            images: image_tool,
            media: self.media_builder,
            bus: self.bus,
            events: self.events,
            watcher,
            monitor_config: self.monitor_config,
            host_cpus: self.host_cpus.unwrap_or_else(validate::host_cpu_count),
            hugepages_dir: self.hugepages_dir,
            proc_mounts: self.proc_mounts,
            restart_delay: self.restart_delay,
        })
    }
}

/// Accumulates every side effect of one in-flight create/start so the
/// rollback routine can consume it. Owned exclusively by one invocation.
#[derive(Default)]
struct CleanupLedger {
    vm_id: String,
    monitor: Option<Arc<MonitorClient>>,
    supervisor: Option<Supervisor>,
    pid: Option<u32>,
    tap: Option<String>,
    chain_touched: bool,
    monitor_socket: Option<PathBuf>,
    pidfile: Option<PathBuf>,
    install_iso: Option<PathBuf>,
    agent_sockets: Vec<PathBuf>,
}

impl CleanupLedger {
    fn new(vm_id: &str) -> Self {
        Self {
            vm_id: vm_id.to_string(),
            ..Self::default()
        }
    }
}

/// Orchestrates the full lifecycle of machines on this host.
pub struct LifecycleManager {
    store: Arc<dyn MachineStore>,
    paths: HostPaths,
    net: Arc<TapManager>,
    firewall: Arc<FirewallManager>,
    cpuset: Arc<CpusetManager>,
    builder: Arc<dyn CommandBuilder>,
    images: Arc<dyn ImageTool>,
    media: Arc<dyn MediaBuilder>,
    bus: EventBus,
    events: Option<Sender<Event>>,
    watcher: Arc<MachineWatcher>,
    monitor_config: MonitorConfig,
    host_cpus: usize,
    hugepages_dir: PathBuf,
    proc_mounts: PathBuf,
    restart_delay: Duration,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("paths", &self.paths)
            .field("host_cpus", &self.host_cpus)
            .finish()
    }
}

impl LifecycleManager {
    /// The watcher owning monitor connections for attached machines.
    pub fn watcher(&self) -> &Arc<MachineWatcher> {
        &self.watcher
    }

    /// Atomically realize a fully-running machine, or restore the
    /// pre-create state.
    pub fn create(&self, request: CreateRequest) -> OperationResult<CreateOutcome> {
        let mut diags =
            validate::validate_create_request(&request, self.host_cpus, &self.paths.rom_dir)?;
        let mut events = Vec::new();

        let record = VmRecord {
            id: request.vm_id.clone(),
            name: request.name.clone(),
            internal_name: request.internal_name.clone(),
            os: request.os.clone(),
            version: 1,
            status: MachineStatus::Building,
            spec: request.spec.clone(),
            runtime: Default::default(),
        };
        self.store.insert_machine(&record)?;

        let mut ledger = CleanupLedger::new(&record.id);
        match self.create_inner(&record, &mut ledger, &mut diags, &mut events) {
            Ok(outcome) => {
                self.bus.emit_crud(CrudAction::Create, &record.id, None);
                self.bus.emit_crud(CrudAction::PowerOn, &record.id, None);
                Ok(OperationOutput::new(outcome)
                    .with_diagnostics(diags)
                    .with_events(events))
            }
            Err(err) => {
                warn!(vm = record.id, %err, "create failed, rolling back");
                self.rollback(&mut ledger, &mut diags);
                Err(Error::CreateFailed {
                    vm: record.id,
                    source: Box::new(err),
                })
            }
        }
    }

    fn create_inner(
        &self,
        record: &VmRecord,
        ledger: &mut CleanupLedger,
        diags: &mut Vec<Diagnostic>,
        events: &mut Vec<Event>,
    ) -> Result<CreateOutcome> {
        let internal = &record.internal_name;
        let socket = self.paths.monitor_socket(internal);
        let pidfile = self.paths.pidfile(internal);
        ledger.monitor_socket = Some(socket.clone());
        ledger.pidfile = Some(pidfile.clone());
        ledger.agent_sockets = agent_sockets(record);

        self.reclaim_orphans(&record.id, &socket, &pidfile, diags)?;

        let disk_paths: Vec<PathBuf> = (0..record.spec.disks.len())
            .map(|index| self.paths.disk_path(internal, index))
            .collect();
        for (disk, path) in record.spec.disks.iter().zip(&disk_paths) {
            let format = disk.format.as_deref().unwrap_or("qcow2");
            self.images.create_image(path, disk.size_gb, format)?;
        }

        let install_iso = match &record.spec.unattended_install {
            Some(install) => {
                let iso = self
                    .media
                    .build_install_iso(install, &self.paths.disk_dir)?;
                ledger.install_iso = Some(iso.clone());
                Some(iso)
            }
            None => None,
        };

        let (pid, tap, port) =
            self.provision_and_launch(record, &disk_paths, &socket, &pidfile, install_iso.as_deref(), ledger, diags)?;

        events.push(Event::MachineCreated {
            vm: record.id.clone(),
            pid,
            tap: tap.clone(),
            display_port: port,
        });
        if install_iso.is_some() {
            self.spawn_install_monitor(record.id.clone(), pid);
        }
        info!(vm = record.id, pid, tap, port, "machine created");
        Ok(CreateOutcome {
            vm_id: record.id.clone(),
            pid,
            tap_device: tap,
            display_port: port,
        })
    }

    /// Bring a persisted machine from `off` to `running`.
    pub fn start(&self, vm_id: &str) -> OperationResult<StartOutcome> {
        let mut diags = Vec::new();
        let mut events = Vec::new();

        let mut record = self.require_record(vm_id)?;
        if record.status == MachineStatus::Running {
            if let Some(pid) = record.runtime.qemu_pid {
                if process_alive(pid) {
                    return Ok(OperationOutput::new(StartOutcome {
                        pid,
                        tap_device: record.runtime.tap_device,
                        display_port: record.runtime.graphic_port,
                        changed: false,
                    }));
                }
            }
            // Stale `running` record from a dead hypervisor: reset the
            // volatile fields (keeping the TAP) and fall through.
            diags.push(Diagnostic::new(
                Severity::Warning,
                format!("VM `{vm_id}` was marked running but its process is gone; recovering."),
            ));
            self.store.clear_volatile_machine_configuration(vm_id)?;
            self.store
                .update_machine_status(vm_id, MachineStatus::Off)?;
            record = self.require_record(vm_id)?;
        }

        let transition = self
            .store
            .transition_vm_status(
                vm_id,
                MachineStatus::Off,
                MachineStatus::Starting,
                record.version,
            )
            .map_err(|err| match err {
                Error::VersionConflict { vm } => Error::ConcurrentModification { vm },
                other => other,
            })?;
        let record = transition.record;

        let mut ledger = CleanupLedger::new(vm_id);
        match self.start_inner(&record, &mut ledger, &mut diags, &mut events) {
            Ok(outcome) => {
                self.bus.emit_crud(CrudAction::PowerOn, vm_id, None);
                Ok(OperationOutput::new(outcome)
                    .with_diagnostics(diags)
                    .with_events(events))
            }
            Err(err) => {
                warn!(vm = vm_id, %err, "start failed, rolling back");
                self.rollback(&mut ledger, &mut diags);
                // The rollback parks the record in `error`; a failed start
                // returns it to `off` so the next attempt is ordinary.
                if let Err(status_err) = self
                    .store
                    .update_machine_status(vm_id, MachineStatus::Off)
                {
                    warn!(vm = vm_id, %status_err, "failed to restore status after rollback");
                }
                Err(Error::StartFailed {
                    vm: vm_id.to_string(),
                    source: Box::new(err),
                })
            }
        }
    }

    fn start_inner(
        &self,
        record: &VmRecord,
        ledger: &mut CleanupLedger,
        diags: &mut Vec<Diagnostic>,
        events: &mut Vec<Event>,
    ) -> Result<StartOutcome> {
        let internal = &record.internal_name;
        let socket = self.paths.monitor_socket(internal);
        let pidfile = self.paths.pidfile(internal);
        ledger.monitor_socket = Some(socket.clone());
        ledger.pidfile = Some(pidfile.clone());
        ledger.agent_sockets = agent_sockets(record);

        // Prefer the persisted disk list; migrate legacy single-disk
        // records by recomputing from the internal name.
        let mut disk_paths = record.runtime.disk_paths.clone();
        if disk_paths.len() != record.spec.disks.len() {
            disk_paths = (0..record.spec.disks.len())
                .map(|index| self.paths.disk_path(internal, index))
                .collect();
            self.store.update_machine_configuration(
                &record.id,
                &RuntimeUpdate {
                    disk_paths: Some(disk_paths.clone()),
                    ..RuntimeUpdate::default()
                },
            )?;
            diags.push(Diagnostic::new(
                Severity::Info,
                format!("Migrated disk path list for `{}`.", record.id),
            ));
        }

        self.reclaim_orphans(&record.id, &socket, &pidfile, diags)?;

        let (pid, tap, port) =
            self.provision_and_launch(record, &disk_paths, &socket, &pidfile, None, ledger, diags)?;

        events.push(Event::MachineStarted {
            vm: record.id.clone(),
            pid,
        });
        info!(vm = record.id, pid, tap, port, "machine started");
        Ok(StartOutcome {
            pid,
            tap_device: Some(tap),
            display_port: Some(port),
            changed: true,
        })
    }

    /// Shared tail of create/start: network, firewall, spawn, carrier,
    /// pinning, monitor, persistence, watcher attach.
    #[allow(clippy::too_many_arguments)]
    fn provision_and_launch(
        &self,
        record: &VmRecord,
        disk_paths: &[PathBuf],
        socket: &Path,
        pidfile: &Path,
        install_iso: Option<&Path>,
        ledger: &mut CleanupLedger,
        diags: &mut Vec<Diagnostic>,
    ) -> Result<(u32, String, u16)> {
        let spec = &record.spec;

        // TAP: reuse the persisted device when it still exists, else
        // create one (reclaiming orphans) with the deterministic name.
        let tap = match &record.runtime.tap_device {
            Some(tap) if self.net.exists(tap) => {
                debug!(vm = record.id, tap, "reusing existing TAP device");
                tap.clone()
            }
            _ => self.net.create(&record.id, &spec.bridge)?,
        };
        ledger.tap = Some(tap.clone());
        self.net.configure(&tap, &spec.bridge)?;

        self.firewall.ensure_vm_chain(&record.id)?;
        ledger.chain_touched = true;
        self.firewall.attach_jump_rules(&record.id, &tap)?;
        // The store returns the merged department+machine list already
        // ordered, so the machine-specific slice stays empty here.
        let rules = self.store.firewall_rules(&record.id)?;
        self.firewall
            .apply_rules_if_changed(&record.id, &tap, &rules, &[])?;

        let base_port = validate::canonical_display_port(spec.display.port, diags);
        let port = validate::allocate_display_port(base_port)?;

        let effective = validate::resolve_effective(
            spec,
            &record.os,
            &self.hugepages_dir,
            &self.proc_mounts,
            diags,
        );
        let mac = spec
            .mac_address
            .clone()
            .unwrap_or_else(|| validate::derive_mac(&record.id));
        let uefi_vars = self.prepare_uefi_vars(record, effective.firmware.is_some())?;

        let command = self.builder.build(&BuildContext {
            record,
            effective: &effective,
            disk_paths,
            tap: &tap,
            mac: &mac,
            display_port: port,
            monitor_socket: socket,
            pidfile,
            uefi_vars: uefi_vars.as_deref(),
            install_iso,
        })?;

        let mut supervisor = Supervisor::new();
        let pid = supervisor.start(&LaunchPlan {
            vm: record.id.clone(),
            command: command.command,
            args: command.args,
            wrapper: command.wrapper,
            pidfile: command.pidfile,
            monitor_socket: Some(socket.to_path_buf()),
            daemonize: command.daemonize,
        })?;
        ledger.pid = Some(pid);
        ledger.supervisor = Some(supervisor);

        self.verify_carrier(&tap, &spec.bridge, pid)?;

        if let Some(cores) = &spec.cpu_pinning {
            self.cpuset.apply_cpu_pinning(pid, cores);
        }

        let client = Arc::new(MonitorClient::new(socket, self.monitor_config));
        client.connect()?;
        ledger.monitor = Some(Arc::clone(&client));

        let reply = client.query_status()?;
        debug!(vm = record.id, status = reply.status, "hypervisor confirmed");

        self.store.update_machine_configuration(
            &record.id,
            &RuntimeUpdate {
                monitor_socket: Some(socket.to_path_buf()),
                qemu_pid: Some(pid),
                tap_device: Some(tap.clone()),
                graphic_port: Some(port),
                disk_paths: Some(disk_paths.to_vec()),
                effective: Some(effective),
                guest_agent_socket: spec.guest_agent_socket.clone(),
                host_agent_socket: spec.host_agent_socket.clone(),
            },
        )?;
        self.store
            .update_machine_status(&record.id, MachineStatus::Running)?;

        // Success: the ledger's client now belongs to the watcher.
        ledger.monitor = None;
        ledger.supervisor = None;
        self.watcher.attach(&record.id, client);
        Ok((pid, tap, port))
    }

    /// Gracefully request guest shutdown, wait for the hypervisor to exit
    /// naturally, force-kill on timeout when allowed.
    pub fn stop(&self, vm_id: &str, options: StopOptions) -> OperationResult<StopOutcome> {
        let started = Instant::now();
        let mut diags = Vec::new();
        let mut events = Vec::new();

        let record = self.require_record(vm_id)?;
        let pid = record.runtime.qemu_pid;
        let alive = pid.map(process_alive).unwrap_or(false);

        if record.status == MachineStatus::Off && !alive {
            debug!(vm = vm_id, "already off");
            return Ok(OperationOutput::new(StopOutcome {
                changed: false,
                forced: false,
            }));
        }

        events.push(Event::ShutdownRequested {
            vm: vm_id.to_string(),
        });
        let mut forced = false;

        if let Some(pid) = pid.filter(|pid| process_alive(*pid)) {
            if options.graceful {
                // The hypervisor permits one monitor connection; prefer
                // the watcher's, open a fresh one only when unattached.
                // Never `quit` here: it is immediate and data-lossy, and
                // the hypervisor exits on its own once the guest finishes.
                match self.acpi_powerdown(&record) {
                    Ok(()) => events.push(Event::PowerdownSent {
                        vm: vm_id.to_string(),
                    }),
                    Err(err) => diags.push(Diagnostic::new(
                        Severity::Warning,
                        format!("ACPI powerdown request failed ({err}); falling back to waiting."),
                    )),
                }
            }

            if !wait_for_exit(pid, options.timeout) {
                if !options.force {
                    return Err(Error::StopFailed {
                        vm: vm_id.to_string(),
                        message: format!(
                            "hypervisor pid {pid} still running after {} ms",
                            options.timeout.as_millis()
                        ),
                    });
                }
                warn!(vm = vm_id, pid, "guest ignored shutdown; sending SIGKILL");
                forced = true;
                force_kill_pid(vm_id, pid)?;
            }
        } else if pid.is_some() {
            diags.push(Diagnostic::new(
                Severity::Info,
                format!("Hypervisor process for `{vm_id}` already exited; cleaning up."),
            ));
        }

        // Detach before the status write so late events cannot flip the
        // record back to running.
        if let Some(client) = self.watcher.detach(vm_id) {
            client.disconnect();
        }
        self.store
            .update_machine_status(vm_id, MachineStatus::Off)?;
        self.store.clear_volatile_machine_configuration(vm_id)?;

        if let Some(tap) = &record.runtime.tap_device {
            if let Err(err) = self.net.detach_from_bridge(tap) {
                diags.push(Diagnostic::new(
                    Severity::Warning,
                    format!("Failed to detach TAP {tap}: {err}"),
                ));
            }
        }
        if let Err(err) = self.firewall.detach_jump_rules(vm_id) {
            diags.push(Diagnostic::new(
                Severity::Warning,
                format!("Failed to detach firewall jump rules for `{vm_id}`: {err}"),
            ));
        }
        if record.spec.cpu_pinning.is_some() {
            self.cpuset.cleanup_empty_scopes();
        }
        remove_if_exists(&self.paths.pidfile(&record.internal_name));
        remove_if_exists(&self.paths.monitor_socket(&record.internal_name));

        self.bus.emit_crud(CrudAction::PowerOff, vm_id, None);
        events.push(Event::ShutdownComplete {
            vm: vm_id.to_string(),
            forced,
            total_ms: started.elapsed().as_millis() as u64,
        });
        Ok(OperationOutput::new(StopOutcome {
            changed: true,
            forced,
        })
        .with_diagnostics(diags)
        .with_events(events))
    }

    /// Stop if running, then permanently destroy the TAP device, remove
    /// the firewall chain, and clear all runtime fields including the TAP
    /// name.
    pub fn destroy_resources(&self, vm_id: &str) -> OperationResult<DestroyOutcome> {
        let mut diags = Vec::new();
        let mut events = Vec::new();
        let record = self.require_record(vm_id)?;

        let mut changed = false;
        if record
            .runtime
            .qemu_pid
            .map(process_alive)
            .unwrap_or(false)
        {
            let output = self.stop(vm_id, StopOptions::immediate())?;
            diags.extend(output.diagnostics);
            changed = true;
        }

        let record = self.require_record(vm_id)?;
        if let Some(tap) = &record.runtime.tap_device {
            if self.net.exists(tap) {
                if let Err(err) = self.net.destroy(tap) {
                    diags.push(Diagnostic::new(
                        Severity::Warning,
                        format!("Failed to destroy TAP {tap}: {err}"),
                    ));
                } else {
                    changed = true;
                }
            }
        }
        if let Err(err) = self.firewall.remove_vm_chain(vm_id) {
            diags.push(Diagnostic::new(
                Severity::Warning,
                format!("Failed to remove firewall chain for `{vm_id}`: {err}"),
            ));
        }
        self.store.clear_machine_configuration(vm_id)?;
        remove_if_exists(&self.paths.monitor_socket(&record.internal_name));
        remove_if_exists(&self.paths.pidfile(&record.internal_name));

        events.push(Event::ResourcesDestroyed {
            vm: vm_id.to_string(),
        });
        self.bus.emit_crud(CrudAction::Update, vm_id, None);
        Ok(OperationOutput::new(DestroyOutcome { changed })
            .with_diagnostics(diags)
            .with_events(events))
    }

    /// Graceful stop, settle, start.
    pub fn restart(&self, vm_id: &str, options: StopOptions) -> OperationResult<StartOutcome> {
        let stop_output = self.stop(vm_id, options)?;
        thread::sleep(self.restart_delay);
        let mut output = self.start(vm_id)?;
        let mut diagnostics = stop_output.diagnostics;
        diagnostics.extend(std::mem::take(&mut output.diagnostics));
        output.diagnostics = diagnostics;
        let mut events = stop_output.events;
        events.extend(std::mem::take(&mut output.events));
        output.events = events;
        Ok(output)
    }

    /// Pause guest execution.
    pub fn suspend(&self, vm_id: &str) -> OperationResult<()> {
        let record = self.require_record(vm_id)?;
        self.require_status(&record, MachineStatus::Running)?;

        let (client, fresh) = self.monitor_client_for(&record)?;
        let result = client.stop();
        if fresh {
            client.disconnect();
        }
        result?;
        self.store
            .update_machine_status(vm_id, MachineStatus::Suspended)?;
        self.bus.emit_crud(CrudAction::Suspend, vm_id, None);
        Ok(OperationOutput::new(()).with_events(vec![Event::MachineSuspended {
            vm: vm_id.to_string(),
        }]))
    }

    /// Resume guest execution.
    pub fn resume(&self, vm_id: &str) -> OperationResult<()> {
        let record = self.require_record(vm_id)?;
        if !matches!(
            record.status,
            MachineStatus::Suspended | MachineStatus::Paused
        ) {
            return Err(Error::InvalidState {
                vm: vm_id.to_string(),
                expected: "suspended".to_string(),
                actual: record.status.as_str().to_string(),
            });
        }

        let (client, fresh) = self.monitor_client_for(&record)?;
        let result = client.cont();
        if fresh {
            client.disconnect();
        }
        result?;
        self.store
            .update_machine_status(vm_id, MachineStatus::Running)?;
        self.bus.emit_crud(CrudAction::Resume, vm_id, None);
        Ok(OperationOutput::new(()).with_events(vec![Event::MachineResumed {
            vm: vm_id.to_string(),
        }]))
    }

    /// Hard-reset the guest. Status is unchanged.
    pub fn reset(&self, vm_id: &str) -> OperationResult<()> {
        let record = self.require_record(vm_id)?;
        self.require_status(&record, MachineStatus::Running)?;

        let (client, fresh) = self.monitor_client_for(&record)?;
        let result = client.reset();
        if fresh {
            client.disconnect();
        }
        result?;
        Ok(OperationOutput::new(()).with_events(vec![Event::MachineReset {
            vm: vm_id.to_string(),
        }]))
    }

    /// Combine the persisted status with a live process probe and, when
    /// reachable, a live monitor query.
    pub fn get_status(&self, vm_id: &str) -> OperationResult<StatusOutcome> {
        let mut diags = Vec::new();
        let record = self.require_record(vm_id)?;
        let pid = record.runtime.qemu_pid;
        let process_alive_now = pid.map(process_alive).unwrap_or(false);

        if record.status == MachineStatus::Running {
            if pid.is_none() {
                diags.push(Diagnostic::new(
                    Severity::Warning,
                    format!(
                        "VM `{vm_id}` is marked running but records no PID; a stray \
                         untracked hypervisor process may exist."
                    ),
                ));
            } else if !process_alive_now {
                diags.push(Diagnostic::new(
                    Severity::Warning,
                    format!("VM `{vm_id}` is marked running but its PID is not alive."),
                ));
            }
        }

        let runtime_status = if process_alive_now && record.runtime.monitor_socket.is_some() {
            match self.monitor_client_for(&record) {
                Ok((client, fresh)) => {
                    let status = client.query_status().ok().map(|reply| reply.status);
                    if fresh {
                        client.disconnect();
                    }
                    status
                }
                Err(_) => None,
            }
        } else {
            None
        };

        let consistent = match record.status {
            MachineStatus::Running => process_alive_now,
            MachineStatus::Off | MachineStatus::Error => !process_alive_now,
            _ => true,
        };

        Ok(OperationOutput::new(StatusOutcome {
            persisted: record.status,
            pid,
            process_alive: process_alive_now,
            runtime_status,
            consistent,
        })
        .with_diagnostics(diags))
    }

    /// Sweep records marked `running` whose hypervisor is gone: clear the
    /// volatile fields (keeping the TAP) and mark them `off`. Returns the
    /// number of records recovered.
    pub fn reconcile_running(&self) -> OperationResult<usize> {
        let mut diags = Vec::new();
        let mut recovered = 0;
        for vm in self.store.find_running_vms()? {
            let alive = vm.qemu_pid.map(process_alive).unwrap_or(false);
            if alive {
                continue;
            }
            diags.push(Diagnostic::new(
                Severity::Warning,
                format!(
                    "VM `{}` was marked running but its hypervisor is gone; marking off.",
                    vm.id
                ),
            ));
            self.store.clear_volatile_machine_configuration(&vm.id)?;
            self.store.update_machine_status(&vm.id, MachineStatus::Off)?;
            recovered += 1;
        }
        Ok(OperationOutput::new(recovered).with_diagnostics(diags))
    }

    // Internal helpers.

    fn require_record(&self, vm_id: &str) -> Result<VmRecord> {
        self.store
            .find_machine_with_config(vm_id)?
            .ok_or_else(|| Error::VmNotFound {
                vm: vm_id.to_string(),
            })
    }

    fn require_status(&self, record: &VmRecord, expected: MachineStatus) -> Result<()> {
        if record.status != expected {
            return Err(Error::InvalidState {
                vm: record.id.clone(),
                expected: expected.as_str().to_string(),
                actual: record.status.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Reclaim stale per-instance artifacts, refusing when a recorded PID
    /// is still alive.
    fn reclaim_orphans(
        &self,
        vm_id: &str,
        socket: &Path,
        pidfile: &Path,
        diags: &mut Vec<Diagnostic>,
    ) -> Result<()> {
        if socket.exists() {
            diags.push(
                Diagnostic::new(
                    Severity::Info,
                    format!("Removing stale monitor socket {}.", socket.display()),
                )
                .with_path(socket.to_path_buf()),
            );
            remove_if_exists(socket);
        }

        if pidfile.exists() {
            let contents = fs::read_to_string(pidfile).unwrap_or_default();
            match contents.trim().parse::<u32>() {
                Ok(pid) if process_alive(pid) => {
                    return Err(Error::ProcessError {
                        vm: vm_id.to_string(),
                        message: format!(
                            "pidfile {} references live pid {pid}; refusing to replace a \
                             running hypervisor",
                            pidfile.display()
                        ),
                    });
                }
                _ => {
                    diags.push(
                        Diagnostic::new(
                            Severity::Info,
                            format!("Removing stale pidfile {}.", pidfile.display()),
                        )
                        .with_path(pidfile.to_path_buf()),
                    );
                    remove_if_exists(pidfile);
                }
            }
        }
        Ok(())
    }

    fn verify_carrier(&self, tap: &str, bridge: &str, pid: u32) -> Result<()> {
        if self.net.wait_for_carrier(tap) {
            return Ok(());
        }
        let diagnostics = vec![
            format!("tap: {}", self.net.device_state(tap)),
            format!("bridge: {}", self.net.device_state(bridge)),
            format!("hypervisor pid {pid} alive: {}", process_alive(pid)),
            "carrier retries exhausted (10 x 500 ms)".to_string(),
        ];
        Err(Error::NetworkError {
            message: format!("hypervisor never raised carrier on {tap}"),
            diagnostics,
        })
    }

    fn prepare_uefi_vars(&self, record: &VmRecord, uefi: bool) -> Result<Option<PathBuf>> {
        if !uefi {
            return Ok(None);
        }
        let Some(template) = &self.paths.uefi_template else {
            return Ok(None);
        };
        let target = self.paths.uefi_vars(&record.id);
        if !target.exists() {
            fs::copy(template, &target).map_err(|err| Error::DiskError {
                message: format!(
                    "failed to copy UEFI variable template to {}: {err}",
                    target.display()
                ),
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(&target, fs::Permissions::from_mode(0o644));
            }
        }
        Ok(Some(target))
    }

    fn acpi_powerdown(&self, record: &VmRecord) -> Result<()> {
        let (client, fresh) = self.monitor_client_for(record)?;
        let result = client.powerdown();
        if fresh {
            client.disconnect();
        }
        result
    }

    /// The watcher's connection when attached, else a fresh short-lived
    /// one (`fresh = true`; the caller disconnects it).
    fn monitor_client_for(&self, record: &VmRecord) -> Result<(Arc<MonitorClient>, bool)> {
        if let Some(client) = self.watcher.client_for(&record.id) {
            return Ok((client, false));
        }
        let socket = record
            .runtime
            .monitor_socket
            .clone()
            .ok_or_else(|| Error::QmpError {
                message: format!("no monitor socket recorded for `{}`", record.id),
            })?;
        let client = Arc::new(MonitorClient::new(
            socket,
            MonitorConfig {
                reconnect: None,
                ..self.monitor_config
            },
        ));
        client.connect()?;
        Ok((client, true))
    }

    /// Tear down everything the ledger recorded, in strict order. Every
    /// step is best-effort; errors are logged, never re-raised.
    fn rollback(&self, ledger: &mut CleanupLedger, diags: &mut Vec<Diagnostic>) {
        let vm_id = ledger.vm_id.clone();
        let mut note = |message: String| {
            warn!(vm = vm_id.as_str(), "{message}");
            diags.push(Diagnostic::new(Severity::Warning, message));
        };

        if let Some(client) = ledger.monitor.take() {
            client.disconnect();
        }

        if let Some(mut supervisor) = ledger.supervisor.take() {
            if let Err(err) = supervisor.force_kill() {
                note(format!("rollback: force-kill failed: {err}"));
            }
        } else if let Some(pid) = ledger.pid {
            if process_alive(pid) {
                if let Err(err) = force_kill_pid(&ledger.vm_id, pid) {
                    note(format!("rollback: force-kill failed: {err}"));
                }
            }
        }
        if ledger.pid.is_some() {
            // Give the kernel a moment to release device handles.
            thread::sleep(ROLLBACK_KILL_SETTLE);
        }

        if let Some(tap) = &ledger.tap {
            if let Err(err) = self.net.bring_down(tap) {
                note(format!("rollback: failed to bring down {tap}: {err}"));
            }
            thread::sleep(ROLLBACK_LINK_SETTLE);
        }

        // Chain removal must precede TAP destruction: the jump rules
        // reference the TAP by name and a referenced device reports busy.
        if ledger.chain_touched {
            if let Err(err) = self.firewall.remove_vm_chain(&ledger.vm_id) {
                note(format!("rollback: failed to remove firewall chain: {err}"));
            }
            thread::sleep(ROLLBACK_LINK_SETTLE);
        }

        if let Some(tap) = &ledger.tap {
            if let Err(err) = self.net.destroy(tap) {
                note(format!("rollback: failed to destroy {tap}: {err}"));
            }
        }

        if let Err(err) = self.store.clear_machine_configuration(&ledger.vm_id) {
            note(format!("rollback: failed to clear runtime fields: {err}"));
        }
        if let Err(err) = self
            .store
            .update_machine_status(&ledger.vm_id, MachineStatus::Error)
        {
            note(format!("rollback: failed to set error status: {err}"));
        }

        // Disk images are intentionally preserved.
        for path in ledger
            .monitor_socket
            .iter()
            .chain(ledger.pidfile.iter())
            .chain(ledger.agent_sockets.iter())
            .chain(ledger.install_iso.iter())
        {
            remove_if_exists(path);
        }
    }

    /// Watch an unattended installation in the background. Progress is
    /// reported over the event channel and never affects the create call
    /// that spawned it.
    fn spawn_install_monitor(&self, vm_id: String, pid: u32) {
        let events = self.events.clone();
        thread::spawn(move || {
            let emit = |event: Event| {
                if let Some(events) = &events {
                    let _ = events.send(event);
                }
            };
            emit(Event::InstallProgress {
                vm: vm_id.clone(),
                text: "unattended installation running".to_string(),
                finished: false,
            });
            let deadline = Instant::now() + INSTALL_WATCH_LIMIT;
            while Instant::now() < deadline {
                if !process_alive(pid) {
                    emit(Event::InstallProgress {
                        vm: vm_id.clone(),
                        text: "installer hypervisor exited".to_string(),
                        finished: true,
                    });
                    return;
                }
                thread::sleep(INSTALL_POLL);
            }
            emit(Event::InstallProgress {
                vm: vm_id,
                text: "gave up watching installation progress".to_string(),
                finished: true,
            });
        });
    }
}

fn agent_sockets(record: &VmRecord) -> Vec<PathBuf> {
    record
        .spec
        .guest_agent_socket
        .iter()
        .chain(record.spec.host_agent_socket.iter())
        .cloned()
        .collect()
}

fn force_kill_pid(vm_id: &str, pid: u32) -> Result<()> {
    let res = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if res != 0 {
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or_default();
        if errno != libc::ESRCH {
            return Err(Error::ProcessError {
                vm: vm_id.to_string(),
                message: format!("failed to send SIGKILL to pid {pid}: errno {errno}"),
            });
        }
    }
    if !wait_for_exit(pid, FORCE_KILL_CONFIRM) {
        return Err(Error::ProcessError {
            vm: vm_id.to_string(),
            message: format!("pid {pid} did not exit after SIGKILL"),
        });
    }
    Ok(())
}

fn remove_if_exists(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), %err, "failed to remove file");
        }
    }
}
