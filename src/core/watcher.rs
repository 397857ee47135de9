//! Reacts to monitor events for attached machines.
//!
//! For each attached machine the watcher registers listeners for the seven
//! state-change events plus disconnect, keeps the persistent status in step
//! with the hypervisor, and performs post-shutdown resource cleanup for
//! guest-initiated shutdowns.
//!
//! The hypervisor cannot distinguish "guest clicked shutdown" from "host
//! sent the powerdown command" — both arrive as `guest=true,
//! reason="guest-shutdown"`. The only reliably host-explicit reason is
//! `host-qmp-quit` (an explicit `quit` command), so only that case is left
//! to the coordinator; every other shutdown is treated as ACPI-originated
//! and cleaned up here.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::MachineStatus;
use crate::core::cpuset::CpusetManager;
use crate::core::events::{CrudAction, Event, EventBus};
use crate::core::firewall::FirewallManager;
use crate::core::monitor::{ListenerId, MonitorClient, MonitorEvent, MonitorEventKind};
use crate::core::net::TapManager;
use crate::core::statesync;
use crate::core::store::MachineStore;
use crate::core::supervisor::wait_for_exit;

/// Reason value identifying an explicit host-side `quit` command.
const HOST_QUIT_REASON: &str = "host-qmp-quit";

/// How long a guest-initiated shutdown may take before we proceed with
/// cleanup anyway. Never escalated to SIGKILL: a stuck guest is a
/// diagnostic condition, not an emergency.
const GUEST_EXIT_WAIT: Duration = Duration::from_secs(30);

struct AttachedVm {
    client: Arc<MonitorClient>,
    listeners: Vec<ListenerId>,
}

struct WatcherShared {
    store: Arc<dyn MachineStore>,
    net: Arc<TapManager>,
    firewall: Arc<FirewallManager>,
    cpuset: Arc<CpusetManager>,
    bus: EventBus,
    events: Option<Sender<Event>>,
    attached: Mutex<HashMap<String, AttachedVm>>,
}

/// Event reactor for attached machines.
pub struct MachineWatcher {
    shared: Arc<WatcherShared>,
}

impl std::fmt::Debug for MachineWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let attached = self
            .shared
            .attached
            .lock()
            .map(|attached| attached.len())
            .unwrap_or(0);
        f.debug_struct("MachineWatcher")
            .field("attached", &attached)
            .finish()
    }
}

impl MachineWatcher {
    pub fn new(
        store: Arc<dyn MachineStore>,
        net: Arc<TapManager>,
        firewall: Arc<FirewallManager>,
        cpuset: Arc<CpusetManager>,
        bus: EventBus,
        events: Option<Sender<Event>>,
    ) -> Self {
        Self {
            shared: Arc::new(WatcherShared {
                store,
                net,
                firewall,
                cpuset,
                bus,
                events,
                attached: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Begin reacting to events from `client` for `vm_id`. The watcher
    /// owns the monitor connection until detach or disconnect.
    pub fn attach(&self, vm_id: &str, client: Arc<MonitorClient>) {
        let kinds = [
            MonitorEventKind::Shutdown,
            MonitorEventKind::Powerdown,
            MonitorEventKind::Reset,
            MonitorEventKind::Stop,
            MonitorEventKind::Resume,
            MonitorEventKind::Suspend,
            MonitorEventKind::Wakeup,
        ];

        let mut listeners = Vec::with_capacity(kinds.len() + 1);
        for kind in kinds {
            let shared = Arc::clone(&self.shared);
            let vm = vm_id.to_string();
            listeners.push(client.on_event(kind, move |event| {
                handle_event(&shared, &vm, event);
            }));
        }
        {
            let shared = Arc::clone(&self.shared);
            let vm = vm_id.to_string();
            listeners.push(client.on_disconnect(move || {
                debug!(vm, "monitor connection lost, detaching watcher");
                if let Ok(mut attached) = shared.attached.lock() {
                    attached.remove(&vm);
                }
            }));
        }

        if let Ok(mut attached) = self.shared.attached.lock() {
            attached.insert(
                vm_id.to_string(),
                AttachedVm {
                    client,
                    listeners,
                },
            );
        }
    }

    /// Stop reacting to the machine's events. Returns the monitor client
    /// so the caller can keep using the single permitted connection.
    pub fn detach(&self, vm_id: &str) -> Option<Arc<MonitorClient>> {
        let entry = match self.shared.attached.lock() {
            Ok(mut attached) => attached.remove(vm_id),
            Err(_) => None,
        };
        let entry = entry?;
        for listener in &entry.listeners {
            entry.client.remove_listener(*listener);
        }
        Some(entry.client)
    }

    /// Monitor client attached for `vm_id`, if any.
    pub fn client_for(&self, vm_id: &str) -> Option<Arc<MonitorClient>> {
        self.shared
            .attached
            .lock()
            .ok()
            .and_then(|attached| attached.get(vm_id).map(|entry| Arc::clone(&entry.client)))
    }

    pub fn is_attached(&self, vm_id: &str) -> bool {
        self.shared
            .attached
            .lock()
            .map(|attached| attached.contains_key(vm_id))
            .unwrap_or(false)
    }
}

fn emit(shared: &WatcherShared, event: Event) {
    if let Some(events) = &shared.events {
        let _ = events.send(event);
    }
}

/// Runs on the monitor reader thread; must stay non-blocking. Shutdown
/// cleanup hops to its own thread for the exit wait.
fn handle_event(shared: &Arc<WatcherShared>, vm_id: &str, event: &MonitorEvent) {
    emit(
        shared,
        Event::MonitorEvent {
            vm: vm_id.to_string(),
            name: event.name.clone(),
        },
    );

    match event.kind() {
        MonitorEventKind::Shutdown | MonitorEventKind::Powerdown => {
            // The pid must be read before the status write: once the
            // record leaves `running`, pid lookups filtered by status
            // would hide it.
            let cached_pid = shared
                .store
                .find_machine_with_config(vm_id)
                .ok()
                .flatten()
                .and_then(|record| record.runtime.qemu_pid);

            apply_status(shared, vm_id, MachineStatus::Off);
            shared.bus.emit_crud(CrudAction::PowerOff, vm_id, None);

            if event.kind() == MonitorEventKind::Shutdown {
                let reason = event
                    .shutdown_reason()
                    .unwrap_or("guest-shutdown")
                    .to_string();
                emit(
                    shared,
                    Event::GuestShutdown {
                        vm: vm_id.to_string(),
                        reason: reason.clone(),
                    },
                );
                if reason == HOST_QUIT_REASON {
                    // The coordinator issued the quit and owns cleanup.
                    debug!(vm_id, "host-explicit quit, leaving cleanup to the caller");
                } else {
                    let shared = Arc::clone(shared);
                    let vm = vm_id.to_string();
                    thread::spawn(move || {
                        post_shutdown_cleanup(&shared, &vm, cached_pid);
                    });
                }
            }
        }
        MonitorEventKind::Stop | MonitorEventKind::Suspend => {
            apply_status(shared, vm_id, MachineStatus::Suspended);
            shared.bus.emit_crud(CrudAction::Suspend, vm_id, None);
        }
        MonitorEventKind::Resume | MonitorEventKind::Wakeup => {
            apply_status(shared, vm_id, MachineStatus::Running);
            shared.bus.emit_crud(CrudAction::Resume, vm_id, None);
        }
        MonitorEventKind::Reset => {
            // Status stays `running`.
            info!(vm_id, "guest reset");
            emit(
                shared,
                Event::MachineReset {
                    vm: vm_id.to_string(),
                },
            );
        }
        MonitorEventKind::Other => {}
    }
}

fn apply_status(shared: &WatcherShared, vm_id: &str, status: MachineStatus) {
    if let Err(err) = statesync::update_status_direct(shared.store.as_ref(), vm_id, status) {
        warn!(vm_id, %err, "failed to persist event-driven status");
        return;
    }
    emit(
        shared,
        Event::StatusChanged {
            vm: vm_id.to_string(),
            status,
        },
    );
}

/// Mirror of the coordinator's stop-path cleanup for guest-initiated
/// shutdowns; both paths must produce the same observable end-state.
fn post_shutdown_cleanup(shared: &WatcherShared, vm_id: &str, pid: Option<u32>) {
    if let Some(pid) = pid {
        if !wait_for_exit(pid, GUEST_EXIT_WAIT) {
            warn!(
                vm_id,
                pid, "hypervisor still alive 30s after guest shutdown; continuing cleanup"
            );
        }
    }

    let tap = shared
        .store
        .find_machine_with_config(vm_id)
        .ok()
        .flatten()
        .and_then(|record| record.runtime.tap_device);

    if let Err(err) = shared.store.clear_volatile_machine_configuration(vm_id) {
        warn!(vm_id, %err, "failed to clear volatile fields after guest shutdown");
    }
    if let Some(tap) = &tap {
        if let Err(err) = shared.net.detach_from_bridge(tap) {
            warn!(vm_id, tap, %err, "failed to detach TAP after guest shutdown");
        }
    }
    if let Err(err) = shared.firewall.detach_jump_rules(vm_id) {
        warn!(vm_id, %err, "failed to detach jump rules after guest shutdown");
    }
    shared.cpuset.cleanup_empty_scopes();
    info!(vm_id, "guest-initiated shutdown cleanup complete");
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use tempfile::tempdir;

    use crate::core::monitor::test_support::{connected_client, quick_config, spawn_server};
    use crate::core::net::test_support::RecordingRunner;
    use crate::core::store::{MachineStore, MemoryStore, RuntimeUpdate, contract_tests};

    use super::*;

    struct Fixture {
        watcher: MachineWatcher,
        store: Arc<MemoryStore>,
        runner: Arc<RecordingRunner>,
        events: mpsc::Receiver<Event>,
    }

    fn fixture(sysfs: &std::path::Path, cgroup: &std::path::Path) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(RecordingRunner::new());
        let net = Arc::new(TapManager::new(
            Arc::clone(&runner) as Arc<dyn crate::core::runner::SystemRunner>
        ).with_sysfs_root(sysfs));
        let firewall = Arc::new(FirewallManager::new(
            Arc::clone(&runner) as Arc<dyn crate::core::runner::SystemRunner>
        ));
        let cpuset = Arc::new(CpusetManager::new().with_root(cgroup));
        let (tx, rx) = mpsc::channel();
        let watcher = MachineWatcher::new(
            Arc::clone(&store) as Arc<dyn MachineStore>,
            net,
            firewall,
            cpuset,
            EventBus::disabled(),
            Some(tx),
        );
        Fixture {
            watcher,
            store,
            runner,
            events: rx,
        }
    }

    fn seed_running(store: &MemoryStore, id: &str, pid: Option<u32>) {
        store
            .insert_machine(&contract_tests::sample_record(id))
            .expect("insert");
        let mut update = RuntimeUpdate {
            tap_device: Some(format!("vnet-{id}")),
            monitor_socket: Some(format!("/run/{id}.sock").into()),
            ..RuntimeUpdate::default()
        };
        update.qemu_pid = pid;
        store.update_machine_configuration(id, &update).expect("update");
        store
            .update_machine_status(id, MachineStatus::Running)
            .expect("status");
    }

    fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if predicate() {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn guest_shutdown_cleans_up_but_preserves_identity_resources() {
        let dir = tempdir().expect("tempdir");
        let socket = dir.path().join("monitor.sock");
        let sysfs = dir.path().join("sysfs");
        let cgroup = dir.path().join("cgroup");
        std::fs::create_dir_all(&sysfs).expect("sysfs");
        std::fs::create_dir_all(&cgroup).expect("cgroup");

        let server = spawn_server(&socket, |_reader, mut writer| {
            writer
                .write_all(
                    b"{\"event\":\"SHUTDOWN\",\"data\":{\"guest\":true,\"reason\":\"guest-shutdown\"},\"timestamp\":{\"seconds\":1,\"microseconds\":0}}\n",
                )
                .expect("event");
            thread::sleep(Duration::from_millis(200));
        });

        let fixture = fixture(&sysfs, &cgroup);
        // A pid that is certainly dead so the exit wait returns at once.
        seed_running(&fixture.store, "v1", Some(999_999_999));

        let client = Arc::new(connected_client(&socket, quick_config()));
        fixture.watcher.attach("v1", client);

        wait_for("status off", || {
            fixture
                .store
                .find_machine("v1")
                .expect("find")
                .expect("row")
                .status
                == MachineStatus::Off
        });
        wait_for("tap detach", || {
            fixture
                .runner
                .calls()
                .iter()
                .any(|call| call == "ip link set dev vnet-v1 nomaster")
        });
        wait_for("jump detach", || {
            fixture
                .runner
                .calls()
                .iter()
                .any(|call| call.contains("list chain inet castellan forward"))
        });

        let record = fixture
            .store
            .find_machine_with_config("v1")
            .expect("find")
            .expect("record");
        assert_eq!(record.runtime.tap_device.as_deref(), Some("vnet-v1"));
        assert!(record.runtime.qemu_pid.is_none());
        assert!(record.runtime.monitor_socket.is_none());
        // The TAP device itself and the chain are never destroyed here.
        assert!(
            !fixture
                .runner
                .calls()
                .iter()
                .any(|call| call.contains("link del") || call.contains("delete chain")),
            "identity-bound resources must survive guest shutdown"
        );

        server.join().expect("server");
    }

    #[test]
    fn host_quit_reason_triggers_no_cleanup() {
        let dir = tempdir().expect("tempdir");
        let socket = dir.path().join("monitor.sock");
        let sysfs = dir.path().join("sysfs");
        let cgroup = dir.path().join("cgroup");
        std::fs::create_dir_all(&sysfs).expect("sysfs");
        std::fs::create_dir_all(&cgroup).expect("cgroup");

        let server = spawn_server(&socket, |_reader, mut writer| {
            writer
                .write_all(
                    b"{\"event\":\"SHUTDOWN\",\"data\":{\"guest\":false,\"reason\":\"host-qmp-quit\"},\"timestamp\":{\"seconds\":1,\"microseconds\":0}}\n",
                )
                .expect("event");
            thread::sleep(Duration::from_millis(200));
        });

        let fixture = fixture(&sysfs, &cgroup);
        seed_running(&fixture.store, "v1", Some(999_999_999));
        let client = Arc::new(connected_client(&socket, quick_config()));
        fixture.watcher.attach("v1", client);

        wait_for("status off", || {
            fixture
                .store
                .find_machine("v1")
                .expect("find")
                .expect("row")
                .status
                == MachineStatus::Off
        });
        // Give a would-be cleanup thread time to run, then assert nothing
        // touched the kernel resources.
        thread::sleep(Duration::from_millis(300));
        assert!(
            fixture.runner.calls().is_empty(),
            "host-qmp-quit must leave cleanup to the coordinator: {:?}",
            fixture.runner.calls()
        );
        let record = fixture
            .store
            .find_machine_with_config("v1")
            .expect("find")
            .expect("record");
        assert_eq!(record.runtime.qemu_pid, Some(999_999_999), "volatile fields untouched");

        server.join().expect("server");
    }

    #[test]
    fn suspend_and_resume_events_move_status() {
        let dir = tempdir().expect("tempdir");
        let socket = dir.path().join("monitor.sock");
        let sysfs = dir.path().join("sysfs");
        let cgroup = dir.path().join("cgroup");
        std::fs::create_dir_all(&sysfs).expect("sysfs");
        std::fs::create_dir_all(&cgroup).expect("cgroup");

        let server = spawn_server(&socket, |_reader, mut writer| {
            writer
                .write_all(b"{\"event\":\"STOP\",\"timestamp\":{\"seconds\":1,\"microseconds\":0}}\n")
                .expect("event");
            writer
                .write_all(b"{\"event\":\"RESUME\",\"timestamp\":{\"seconds\":2,\"microseconds\":0}}\n")
                .expect("event");
            writer
                .write_all(b"{\"event\":\"RESET\",\"timestamp\":{\"seconds\":3,\"microseconds\":0}}\n")
                .expect("event");
            thread::sleep(Duration::from_millis(200));
        });

        let fixture = fixture(&sysfs, &cgroup);
        seed_running(&fixture.store, "v1", None);
        let client = Arc::new(connected_client(&socket, quick_config()));
        fixture.watcher.attach("v1", client);

        // STOP then RESUME land in order; RESET leaves running untouched.
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline && seen.len() < 2 {
            if let Ok(event) = fixture.events.recv_timeout(Duration::from_millis(100)) {
                if let Event::StatusChanged { status, .. } = event {
                    seen.push(status);
                }
            }
        }
        assert_eq!(seen, [MachineStatus::Suspended, MachineStatus::Running]);
        assert_eq!(
            fixture
                .store
                .find_machine("v1")
                .expect("find")
                .expect("row")
                .status,
            MachineStatus::Running
        );

        server.join().expect("server");
    }

    #[test]
    fn detach_returns_the_client_and_stops_reacting() {
        let dir = tempdir().expect("tempdir");
        let socket = dir.path().join("monitor.sock");
        let sysfs = dir.path().join("sysfs");
        let cgroup = dir.path().join("cgroup");
        std::fs::create_dir_all(&sysfs).expect("sysfs");
        std::fs::create_dir_all(&cgroup).expect("cgroup");

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let server = spawn_server(&socket, move |_reader, mut writer| {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
            let _ = writer.write_all(
                b"{\"event\":\"STOP\",\"timestamp\":{\"seconds\":1,\"microseconds\":0}}\n",
            );
        });

        let fixture = fixture(&sysfs, &cgroup);
        seed_running(&fixture.store, "v1", None);
        let client = Arc::new(connected_client(&socket, quick_config()));
        fixture.watcher.attach("v1", Arc::clone(&client));
        assert!(fixture.watcher.is_attached("v1"));

        let detached = fixture.watcher.detach("v1").expect("client returned");
        assert!(!fixture.watcher.is_attached("v1"));
        assert!(detached.is_connected());

        // Events after detach must not move status.
        release_tx.send(()).expect("release");
        thread::sleep(Duration::from_millis(300));
        assert_eq!(
            fixture
                .store
                .find_machine("v1")
                .expect("find")
                .expect("row")
                .status,
            MachineStatus::Running
        );

        detached.disconnect();
        server.join().expect("server");
    }
}
