//! End-to-end lifecycle scenarios against a fake hypervisor.
//!
//! The "hypervisor" is a shell launcher that daemonizes a sleeper and
//! symlinks the monitor socket to an in-process QMP server; kernel-side
//! `ip`/`nft` invocations run against a recording fake that mirrors the
//! relevant sysfs state.

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;

use castellan::core::command::{BuildContext, CommandBuilder, VmCommand};
use castellan::core::images::ImageTool;
use castellan::core::lifecycle::{LifecycleBuilder, LifecycleManager};
use castellan::core::options::StopOptions;
use castellan::core::runner::SystemRunner;
use castellan::core::store::{MachineStore, MemoryStore};
use castellan::{
    CreateRequest, DiskSpec, DisplayKind, DisplaySpec, Error, MachineStatus, VmSpec,
};

/// Records `ip`/`nft` invocations and mirrors TAP lifecycle into a fake
/// sysfs tree so carrier checks behave like the kernel.
struct FakeKernelRunner {
    sysfs: PathBuf,
    carrier: &'static str,
    calls: Mutex<Vec<String>>,
}

impl FakeKernelRunner {
    fn new(sysfs: PathBuf, carrier: &'static str) -> Self {
        Self {
            sysfs,
            carrier,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }
}

impl SystemRunner for FakeKernelRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<Output> {
        let mut rendered = String::from(program);
        for arg in args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        self.calls.lock().expect("calls").push(rendered.clone());

        if program == "ip" {
            if let ["tuntap", "add", "dev", tap, "mode", "tap"] = args {
                let dir = self.sysfs.join(tap);
                fs::create_dir_all(&dir)?;
                fs::write(dir.join("carrier"), self.carrier)?;
            }
            if let ["link", "del", "dev", tap] = args {
                let _ = fs::remove_dir_all(self.sysfs.join(tap));
            }
        }

        Ok(Output {
            status: ExitStatus::from_raw(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

/// Builds a launcher that imitates a daemonizing hypervisor: it symlinks
/// the monitor socket onto the fake QMP server, backgrounds a sleeper and
/// records its PID in the pidfile.
struct FakeHypervisorBuilder {
    server_socket: PathBuf,
}

impl CommandBuilder for FakeHypervisorBuilder {
    fn build(&self, ctx: &BuildContext<'_>) -> Result<VmCommand, Error> {
        let script = format!(
            "ln -sf {server} {socket}; sleep 300 & echo $! > {pidfile}",
            server = self.server_socket.display(),
            socket = ctx.monitor_socket.display(),
            pidfile = ctx.pidfile.display(),
        );
        Ok(VmCommand {
            command: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script],
            wrapper: None,
            daemonize: true,
            pidfile: Some(ctx.pidfile.to_path_buf()),
        })
    }
}

/// Creates empty files standing in for disk images.
struct TouchImageTool;

impl ImageTool for TouchImageTool {
    fn create_image(&self, path: &Path, _size_gb: u32, _format: &str) -> Result<(), Error> {
        if path.exists() {
            return Err(Error::DiskError {
                message: format!("image {} already exists", path.display()),
            });
        }
        fs::write(path, b"").map_err(|err| Error::DiskError {
            message: err.to_string(),
        })
    }
}

/// In-process QMP server accepting sequential monitor connections.
fn spawn_qmp_server(socket: &Path, pidfile: PathBuf, kill_on_powerdown: bool) -> Arc<AtomicBool> {
    let listener = UnixListener::bind(socket).expect("bind qmp server");
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    thread::spawn(move || {
        while !flag.load(Ordering::SeqCst) {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let _ = serve_connection(stream, &pidfile, kill_on_powerdown);
        }
    });
    shutdown
}

fn serve_connection(stream: UnixStream, pidfile: &Path, kill_on_powerdown: bool) -> io::Result<()> {
    let mut writer = stream.try_clone()?;
    writer.write_all(
        br#"{"QMP":{"version":{"qemu":{"major":8,"minor":2,"micro":0},"package":""},"capabilities":[]}}"#,
    )?;
    writer.write_all(b"\n")?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let Ok(request) = serde_json::from_str::<Value>(line.trim()) else {
            continue;
        };
        let Some(command) = request.get("execute").and_then(Value::as_str) else {
            continue;
        };
        let id = request.get("id").and_then(Value::as_str).unwrap_or("");

        if command == "system_powerdown" && kill_on_powerdown {
            if let Ok(raw) = fs::read_to_string(pidfile) {
                if let Ok(pid) = raw.trim().parse::<i32>() {
                    unsafe {
                        libc::kill(pid, libc::SIGKILL);
                    }
                }
            }
        }

        let reply = if command == "query-status" {
            format!(
                "{{\"return\":{{\"status\":\"running\",\"running\":true}},\"id\":\"{id}\"}}\n"
            )
        } else {
            format!("{{\"return\":{{}},\"id\":\"{id}\"}}\n")
        };
        writer.write_all(reply.as_bytes())?;
    }
}

struct Harness {
    _root: TempDir,
    manager: LifecycleManager,
    store: Arc<MemoryStore>,
    runner: Arc<FakeKernelRunner>,
    run_dir: PathBuf,
    disk_dir: PathBuf,
    _qmp_shutdown: Arc<AtomicBool>,
}

impl Harness {
    fn new(carrier: &'static str, kill_on_powerdown: bool) -> Self {
        let root = TempDir::new().expect("tempdir");
        let disk_dir = root.path().join("disks");
        let run_dir = root.path().join("run");
        let sysfs = root.path().join("sysfs");
        let cgroup = root.path().join("cgroup");
        for dir in [&disk_dir, &run_dir, &sysfs, &cgroup] {
            fs::create_dir_all(dir).expect("dir");
        }

        let server_socket = root.path().join("qmp-server.sock");
        // Every machine in these tests is `v1`.
        let pidfile = run_dir.join("vm-v1.pid");
        let qmp_shutdown = spawn_qmp_server(&server_socket, pidfile, kill_on_powerdown);

        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(FakeKernelRunner::new(sysfs, carrier));
        let paths = castellan::HostPaths {
            disk_dir: disk_dir.clone(),
            socket_dir: run_dir.clone(),
            pidfile_dir: run_dir.clone(),
            uefi_template: None,
            rom_dir: root.path().join("roms"),
        };

        let manager = LifecycleBuilder::new(Arc::clone(&store) as Arc<dyn MachineStore>, paths)
            .with_runner(Arc::clone(&runner) as Arc<dyn SystemRunner>)
            .with_command_builder(Arc::new(FakeHypervisorBuilder { server_socket }))
            .with_image_tool(Arc::new(TouchImageTool))
            .with_host_cpus(8)
            .with_sysfs_net(root.path().join("sysfs"))
            .with_cgroup_root(root.path().join("cgroup"))
            .with_restart_delay(Duration::from_millis(100))
            .build()
            .expect("manager");

        Self {
            _root: root,
            manager,
            store,
            runner,
            run_dir,
            disk_dir,
            _qmp_shutdown: qmp_shutdown,
        }
    }

    fn request(&self) -> CreateRequest {
        CreateRequest {
            vm_id: "v1".to_string(),
            name: "V1".to_string(),
            internal_name: "vm-v1".to_string(),
            os: "ubuntu".to_string(),
            spec: VmSpec {
                cpu_cores: 2,
                ram_gb: 1,
                disks: vec![DiskSpec {
                    size_gb: 10,
                    format: None,
                    bus: None,
                    cache: None,
                    discard: None,
                }],
                bridge: "br0".to_string(),
                mac_address: None,
                display: DisplaySpec {
                    kind: DisplayKind::Spice,
                    port: Some(5900),
                    password: None,
                    addr: None,
                },
                machine_type: None,
                network_model: None,
                network_queues: None,
                passthrough: None,
                firmware: None,
                hugepages: false,
                balloon: false,
                cpu_pinning: None,
                pinning_strategy: None,
                tpm_socket: None,
                guest_agent_socket: None,
                host_agent_socket: None,
                driver_iso: None,
                audio_enabled: false,
                tablet_enabled: false,
                unattended_install: None,
            },
        }
    }

    fn record(&self) -> castellan::core::store::VmRecord {
        self.store
            .find_machine_with_config("v1")
            .expect("find")
            .expect("record")
    }
}

#[test]
fn create_then_graceful_stop() {
    let harness = Harness::new("1", true);

    let output = harness.manager.create(harness.request()).expect("create");
    let outcome = &output.value;
    assert!(outcome.pid > 0);
    assert_eq!(outcome.tap_device, "vnet-v1");
    assert!(outcome.display_port >= 5900);

    // P1: a successful create reports running, alive and consistent.
    let status = harness.manager.get_status("v1").expect("status");
    assert_eq!(status.value.persisted, MachineStatus::Running);
    assert!(status.value.process_alive);
    assert!(status.value.consistent);
    assert_eq!(status.value.runtime_status.as_deref(), Some("running"));

    let record = harness.record();
    assert_eq!(record.runtime.qemu_pid, Some(outcome.pid));
    assert_eq!(record.runtime.tap_device.as_deref(), Some("vnet-v1"));
    assert_eq!(record.runtime.disk_paths.len(), 1);
    assert!(harness.disk_dir.join("vm-v1.qcow2").exists());

    let stop = harness
        .manager
        .stop("v1", StopOptions::default())
        .expect("stop");
    assert!(stop.value.changed);
    assert!(!stop.value.forced, "guest honored ACPI; no SIGKILL");

    // P3: volatile fields cleared, TAP name preserved, chain preserved,
    // jump rules detached, pidfile removed.
    let record = harness.record();
    assert_eq!(record.status, MachineStatus::Off);
    assert_eq!(record.runtime.tap_device.as_deref(), Some("vnet-v1"));
    assert!(record.runtime.qemu_pid.is_none());
    assert!(record.runtime.monitor_socket.is_none());
    assert!(!harness.run_dir.join("vm-v1.pid").exists());

    let calls = harness.runner.calls();
    assert!(calls.iter().any(|call| call == "ip link set dev vnet-v1 nomaster"));
    assert!(
        !calls.iter().any(|call| call.contains("link del")),
        "TAP device survives stop: {calls:?}"
    );
    assert!(
        !calls.iter().any(|call| call.contains("delete chain")),
        "firewall chain survives stop: {calls:?}"
    );
}

#[test]
fn stop_then_start_reuses_the_tap_device() {
    let harness = Harness::new("1", true);
    harness.manager.create(harness.request()).expect("create");
    harness
        .manager
        .stop("v1", StopOptions::default())
        .expect("stop");

    let tap_before = harness.record().runtime.tap_device.clone();
    let calls_before = harness.runner.calls().len();

    let output = harness.manager.start("v1").expect("start");
    assert!(output.value.changed);

    // P4: the TAP name is stable across stop/start, and the device was
    // reused rather than recreated.
    let record = harness.record();
    assert_eq!(record.runtime.tap_device, tap_before);
    let new_calls = &harness.runner.calls()[calls_before..];
    assert!(
        !new_calls.iter().any(|call| call.contains("tuntap add")),
        "existing TAP must be reused: {new_calls:?}"
    );

    harness
        .manager
        .stop("v1", StopOptions::default())
        .expect("stop again");
}

#[test]
fn concurrent_starts_have_one_winner() {
    let harness = Harness::new("1", true);
    harness.manager.create(harness.request()).expect("create");
    harness
        .manager
        .stop("v1", StopOptions::default())
        .expect("stop");

    let manager = Arc::new(harness.manager);
    let mut handles = Vec::new();
    for _ in 0..2 {
        let manager = Arc::clone(&manager);
        handles.push(thread::spawn(move || manager.start("v1")));
    }
    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .collect();

    let winners = results
        .iter()
        .filter(|result| matches!(result, Ok(output) if output.value.changed))
        .count();
    assert_eq!(winners, 1, "exactly one start may boot the machine");
    for result in results {
        match result {
            Ok(output) if output.value.changed => {}
            // A start that observed the winner's finished state reports
            // the machine as already running without touching it.
            Ok(output) => assert!(!output.value.changed),
            Err(loser) => {
                // The slower CAS sees either the moved version or the
                // new status.
                let source_code = match &loser {
                    Error::StartFailed { source, .. } => source.code(),
                    other => other.code(),
                };
                assert!(
                    matches!(source_code, "concurrent-modification" | "invalid-state"),
                    "unexpected loser error: {loser:?}"
                );
            }
        }
    }

    let record = manager.get_status("v1").expect("status");
    assert_eq!(record.value.persisted, MachineStatus::Running);
    assert!(record.value.process_alive);

    manager.stop("v1", StopOptions::default()).expect("stop");
}

#[test]
fn start_reclaims_stale_socket_and_pidfile() {
    let harness = Harness::new("1", true);
    harness.manager.create(harness.request()).expect("create");
    harness
        .manager
        .stop("v1", StopOptions::default())
        .expect("stop");

    // Simulate a crashed prior run: a stale socket file and a pidfile
    // pointing at a dead process.
    let socket = harness.run_dir.join("vm-v1.sock");
    let pidfile = harness.run_dir.join("vm-v1.pid");
    fs::write(&socket, b"").expect("stale socket");
    fs::write(&pidfile, b"999999999\n").expect("stale pidfile");

    let output = harness.manager.start("v1").expect("start");
    assert!(output.value.changed);
    assert!(
        output
            .diagnostics
            .iter()
            .filter(|diag| diag.message.contains("stale"))
            .count()
            >= 2,
        "stale artifacts reported: {:?}",
        output.diagnostics
    );
    assert_eq!(
        harness.record().status,
        MachineStatus::Running
    );

    harness
        .manager
        .stop("v1", StopOptions::default())
        .expect("stop");
}

#[test]
fn start_refuses_live_orphan_pid() {
    let harness = Harness::new("1", true);
    harness.manager.create(harness.request()).expect("create");
    harness
        .manager
        .stop("v1", StopOptions::default())
        .expect("stop");

    // A pidfile referencing a live process must not be clobbered.
    let pidfile = harness.run_dir.join("vm-v1.pid");
    fs::write(&pidfile, format!("{}\n", std::process::id())).expect("pidfile");

    let err = harness.manager.start("v1").unwrap_err();
    assert_eq!(err.code(), "start-failed");
    assert!(
        err.to_string().contains("live pid"),
        "refusal names the live pid: {err}"
    );
}

#[test]
fn create_rolls_back_when_carrier_never_rises() {
    let harness = Harness::new("0", true);

    let err = harness.manager.create(harness.request()).unwrap_err();
    assert_eq!(err.code(), "create-failed");
    let Error::CreateFailed { source, .. } = &err else {
        panic!("unexpected error: {err:?}");
    };
    assert_eq!(source.code(), "network-error");

    // P2: no TAP, no chain, no pidfile, no socket; the record parks in
    // `error`. Disk images are preserved.
    let calls = harness.runner.calls();
    assert!(
        calls.iter().any(|call| call == "ip link del dev vnet-v1"),
        "rollback destroys the TAP: {calls:?}"
    );
    assert!(
        calls.iter().any(|call| call.contains("delete chain inet castellan vm-v1")),
        "rollback removes the chain: {calls:?}"
    );
    let destroy_position = calls
        .iter()
        .position(|call| call == "ip link del dev vnet-v1")
        .expect("tap destroy");
    let chain_position = calls
        .iter()
        .position(|call| call.contains("delete chain inet castellan vm-v1"))
        .expect("chain removal");
    assert!(
        chain_position < destroy_position,
        "chain removal must precede TAP destruction: {calls:?}"
    );

    assert!(!harness.run_dir.join("vm-v1.pid").exists());
    assert!(!harness.run_dir.join("vm-v1.sock").exists());
    assert_eq!(harness.record().status, MachineStatus::Error);
    assert!(
        harness.disk_dir.join("vm-v1.qcow2").exists(),
        "disk images are intentionally preserved"
    );
}

#[test]
fn stop_escalates_when_guest_ignores_acpi() {
    let harness = Harness::new("1", false);
    let output = harness.manager.create(harness.request()).expect("create");
    let pid = output.value.pid;

    let stop = harness
        .manager
        .stop(
            "v1",
            StopOptions {
                graceful: true,
                timeout: Duration::from_secs(1),
                force: true,
            },
        )
        .expect("stop");
    assert!(stop.value.forced, "guest ignored ACPI; SIGKILL expected");

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if unsafe { libc::kill(pid as i32, 0) } != 0 {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    assert_ne!(
        unsafe { libc::kill(pid as i32, 0) },
        0,
        "hypervisor process must be gone"
    );
    assert_eq!(harness.record().status, MachineStatus::Off);
}
