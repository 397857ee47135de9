//! Spawns and supervises exactly one hypervisor subprocess.
//!
//! The supervisor is single-shot: once stopped or failed, a fresh instance
//! is required for the next launch. When the hypervisor daemonizes, the
//! spawned child is only a launcher; the real PID is re-read from the
//! pidfile after startup completes.

use std::collections::VecDeque;
use std::fs;
use std::io::{self, BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use libc::pid_t;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const PID_POLL: Duration = Duration::from_millis(100);
const READY_WAIT: Duration = Duration::from_secs(5);
const SETTLE_WAIT: Duration = Duration::from_millis(500);
const FORCE_KILL_WAIT: Duration = Duration::from_secs(5);
const STDERR_TAIL_LINES: usize = 64;

/// CPU-pinning launcher that wraps the hypervisor invocation.
#[derive(Debug, Clone)]
pub struct LaunchWrapper {
    pub command: PathBuf,
    /// Arguments placed before the hypervisor binary.
    pub args: Vec<String>,
}

/// Pre-built hypervisor invocation handed to [`Supervisor::start`].
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub vm: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub wrapper: Option<LaunchWrapper>,
    /// Present when the hypervisor writes its own pidfile.
    pub pidfile: Option<PathBuf>,
    /// Present when a monitor socket will appear once the hypervisor is up.
    pub monitor_socket: Option<PathBuf>,
    /// Whether the hypervisor double-forks; the launcher exiting zero is
    /// then expected, not a failure.
    pub daemonize: bool,
}

/// Lifecycle of one supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Initial,
    Spawning,
    WaitingForReady,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

/// Single-shot supervisor for one hypervisor process.
#[derive(Debug)]
pub struct Supervisor {
    state: SupervisorState,
    vm: String,
    pid: Option<u32>,
    pidfile: Option<PathBuf>,
    pidfile_removed: bool,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            state: SupervisorState::Initial,
            vm: String::new(),
            pid: None,
            pidfile: None,
            pidfile_removed: false,
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// PID of the supervised hypervisor, once ready.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Last captured stderr lines, newest last.
    pub fn stderr_tail(&self) -> Vec<String> {
        match self.stderr_tail.lock() {
            Ok(tail) => tail.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Launch the hypervisor and wait for its startup milestone.
    ///
    /// Milestones are checked in priority order: monitor socket on disk,
    /// then pidfile with a positive integer, then a short settle window
    /// with the child still alive. Returns the effective PID.
    pub fn start(&mut self, plan: &LaunchPlan) -> Result<u32> {
        if self.state != SupervisorState::Initial {
            return Err(Error::ProcessError {
                vm: plan.vm.clone(),
                message: format!(
                    "supervisor is single-shot; already {:?}",
                    self.state
                ),
            });
        }
        self.vm = plan.vm.clone();
        self.pidfile = plan.pidfile.clone();
        self.state = SupervisorState::Spawning;

        let mut command = match &plan.wrapper {
            Some(wrapper) => {
                let mut command = Command::new(&wrapper.command);
                command.args(&wrapper.args);
                command.arg(&plan.command);
                command
            }
            None => Command::new(&plan.command),
        };
        command
            .args(&plan.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|err| {
            self.state = SupervisorState::Failed;
            Error::StartupFailed {
                vm: plan.vm.clone(),
                message: format!("failed to spawn {}: {err}", plan.command.display()),
                stderr: Vec::new(),
            }
        })?;
        self.drain_output(&mut child);
        self.state = SupervisorState::WaitingForReady;

        let spawned_pid = child.id();
        let result = self.wait_until_ready(plan, &mut child);
        match result {
            Ok(()) => {}
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                self.state = SupervisorState::Failed;
                return Err(err);
            }
        }

        // Launcher children must be reaped; daemonized hypervisors have
        // re-parented and the launcher exits on its own. Direct children
        // get a reaper thread so they never zombify.
        if plan.daemonize {
            let _ = child.wait();
        } else {
            thread::spawn(move || {
                let _ = child.wait();
            });
        }

        let effective = if plan.daemonize {
            match plan.pidfile.as_deref().map(read_pidfile) {
                Some(Ok(pid)) => pid,
                Some(Err(err)) => {
                    self.state = SupervisorState::Failed;
                    return Err(Error::StartupFailed {
                        vm: plan.vm.clone(),
                        message: err,
                        stderr: self.stderr_tail(),
                    });
                }
                None => spawned_pid,
            }
        } else {
            spawned_pid
        };

        self.pid = Some(effective);
        self.state = SupervisorState::Ready;
        Ok(effective)
    }

    fn wait_until_ready(&mut self, plan: &LaunchPlan, child: &mut Child) -> Result<()> {
        if let Some(socket) = &plan.monitor_socket {
            return self.wait_for_path(plan, child, socket, "monitor socket");
        }
        if plan.daemonize {
            if let Some(pidfile) = &plan.pidfile {
                self.wait_for_path(plan, child, pidfile, "pidfile")?;
                // The milestone is a pidfile with a positive integer.
                read_pidfile(pidfile).map_err(|err| Error::StartupFailed {
                    vm: plan.vm.clone(),
                    message: err,
                    stderr: self.stderr_tail(),
                })?;
                return Ok(());
            }
        }

        // No milestone artifact; observe the child through a settle window.
        let deadline = Instant::now() + SETTLE_WAIT;
        while Instant::now() < deadline {
            if let Some(status) = child.try_wait().map_err(|err| Error::ProcessError {
                vm: plan.vm.clone(),
                message: format!("failed to poll child: {err}"),
            })? {
                return Err(Error::StartupFailed {
                    vm: plan.vm.clone(),
                    message: format!("hypervisor exited during startup with {status}"),
                    stderr: self.stderr_tail(),
                });
            }
            thread::sleep(PID_POLL);
        }
        Ok(())
    }

    fn wait_for_path(
        &mut self,
        plan: &LaunchPlan,
        child: &mut Child,
        path: &Path,
        what: &str,
    ) -> Result<()> {
        let deadline = Instant::now() + READY_WAIT;
        loop {
            if path.exists() {
                return Ok(());
            }
            if let Some(status) = child.try_wait().map_err(|err| Error::ProcessError {
                vm: plan.vm.clone(),
                message: format!("failed to poll child: {err}"),
            })? {
                // With -daemonize the parent exits zero once the daemon is
                // up; keep polling for the artifact in that case.
                if !(plan.daemonize && status.success()) {
                    return Err(Error::StartupFailed {
                        vm: plan.vm.clone(),
                        message: format!("hypervisor exited during startup with {status}"),
                        stderr: self.stderr_tail(),
                    });
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::StartupFailed {
                    vm: plan.vm.clone(),
                    message: format!(
                        "{what} {} did not appear within {} ms",
                        path.display(),
                        READY_WAIT.as_millis()
                    ),
                    stderr: self.stderr_tail(),
                });
            }
            thread::sleep(PID_POLL);
        }
    }

    fn drain_output(&self, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            spawn_drain(stdout, Arc::clone(&self.stderr_tail), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_drain(stderr, Arc::clone(&self.stderr_tail), "stderr");
        }
    }

    /// Zero-signal probe of the supervised PID.
    pub fn is_alive(&self) -> bool {
        match self.pid {
            Some(pid) => process_alive(pid),
            None => false,
        }
    }

    /// SIGTERM, poll for exit, then force-kill on timeout.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        let Some(pid) = self.pid else {
            self.state = SupervisorState::Stopped;
            return Ok(());
        };
        self.state = SupervisorState::Stopping;

        if let Err(errno) = send_signal(pid, libc::SIGTERM) {
            if errno == libc::ESRCH {
                self.finish_stop();
                return Ok(());
            }
            return Err(Error::ProcessError {
                vm: self.vm.clone(),
                message: format!("failed to send SIGTERM to pid {pid}: errno {errno}"),
            });
        }

        if wait_for_exit(pid, timeout) {
            self.finish_stop();
            return Ok(());
        }

        warn!(vm = self.vm, pid, "graceful stop timed out, escalating");
        self.force_kill()
    }

    /// SIGKILL with a bounded confirmation wait, then pidfile cleanup.
    pub fn force_kill(&mut self) -> Result<()> {
        let Some(pid) = self.pid else {
            self.finish_stop();
            return Ok(());
        };
        self.state = SupervisorState::Stopping;

        if let Err(errno) = send_signal(pid, libc::SIGKILL) {
            if errno != libc::ESRCH {
                return Err(Error::ProcessError {
                    vm: self.vm.clone(),
                    message: format!("failed to send SIGKILL to pid {pid}: errno {errno}"),
                });
            }
        }

        if !wait_for_exit(pid, FORCE_KILL_WAIT) {
            return Err(Error::Timeout {
                what: format!("pid {pid} to exit after SIGKILL"),
                waited_ms: FORCE_KILL_WAIT.as_millis() as u64,
            });
        }
        self.finish_stop();
        Ok(())
    }

    fn finish_stop(&mut self) {
        self.remove_pidfile();
        self.state = SupervisorState::Stopped;
    }

    fn remove_pidfile(&mut self) {
        if self.pidfile_removed {
            return;
        }
        self.pidfile_removed = true;
        if let Some(pidfile) = &self.pidfile {
            if let Err(err) = fs::remove_file(pidfile) {
                if err.kind() != ErrorKind::NotFound {
                    warn!(
                        vm = self.vm,
                        pidfile = %pidfile.display(),
                        %err,
                        "failed to remove pidfile"
                    );
                }
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_drain<R: io::Read + Send + 'static>(
    source: R,
    tail: Arc<Mutex<VecDeque<String>>>,
    label: &'static str,
) {
    thread::spawn(move || {
        let reader = BufReader::new(source);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            debug!(stream = label, line, "hypervisor output");
            if let Ok(mut tail) = tail.lock() {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    });
}

/// Read a pidfile expecting a positive integer.
fn read_pidfile(path: &Path) -> std::result::Result<u32, String> {
    let contents = fs::read_to_string(path)
        .map_err(|err| format!("unable to read pidfile {}: {err}", path.display()))?;
    let trimmed = contents.trim();
    let pid: i64 = trimmed.parse().map_err(|_| {
        format!(
            "pidfile {} contained invalid pid `{trimmed}`",
            path.display()
        )
    })?;
    if pid <= 0 {
        return Err(format!(
            "pidfile {} contained non-positive pid {pid}",
            path.display()
        ));
    }
    Ok(pid as u32)
}

fn send_signal(pid: u32, signal: i32) -> std::result::Result<(), i32> {
    let res = unsafe { libc::kill(pid as pid_t, signal) };
    if res == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error().raw_os_error().unwrap_or_default())
    }
}

/// Zero-signal probe. `EPERM` counts as alive; zombies count as exited
/// (a daemonized hypervisor is reparented, and its reaper may lag).
pub fn process_alive(pid: u32) -> bool {
    let res = unsafe { libc::kill(pid as pid_t, 0) };
    if res != 0 {
        return io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    }
    !is_zombie(pid)
}

fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // State is the first field after the parenthesized comm.
    stat.rsplit(')')
        .next()
        .and_then(|rest| rest.split_whitespace().next())
        .map(|state| state == "Z")
        .unwrap_or(false)
}

/// Poll at 100 ms until the PID exits or the timeout elapses. Returns
/// whether the process exited.
pub fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !process_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(PID_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_plan(vm: &str, script: &str) -> LaunchPlan {
        LaunchPlan {
            vm: vm.to_string(),
            command: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            wrapper: None,
            pidfile: None,
            monitor_socket: None,
            daemonize: false,
        }
    }

    #[test]
    fn settle_window_start_and_stop() {
        let mut supervisor = Supervisor::new();
        let pid = supervisor
            .start(&shell_plan("devbox", "sleep 60"))
            .expect("start");
        assert!(pid > 0);
        assert_eq!(supervisor.state(), SupervisorState::Ready);
        assert!(supervisor.is_alive());

        supervisor.stop(Duration::from_secs(2)).expect("stop");
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(!supervisor.is_alive());
    }

    #[test]
    fn early_exit_fails_startup_with_stderr_tail() {
        let mut supervisor = Supervisor::new();
        let err = supervisor
            .start(&shell_plan("devbox", "echo boom >&2; exit 3"))
            .unwrap_err();
        match err {
            Error::StartupFailed { stderr, .. } => {
                assert!(
                    stderr.iter().any(|line| line.contains("boom")),
                    "stderr tail missing diagnostics: {stderr:?}"
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(supervisor.state(), SupervisorState::Failed);
    }

    #[test]
    fn daemonized_start_reads_true_pid_from_pidfile() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pidfile = dir.path().join("vm.pid");
        // The launcher backgrounds a worker, records its pid, and exits
        // zero, imitating the hypervisor's double-fork.
        let script = format!(
            "sleep 60 & echo $! > {}; exit 0",
            pidfile.display()
        );
        let mut plan = shell_plan("devbox", &script);
        plan.pidfile = Some(pidfile.clone());
        plan.daemonize = true;

        let mut supervisor = Supervisor::new();
        let pid = supervisor.start(&plan).expect("start");
        assert!(process_alive(pid));
        assert_eq!(
            read_pidfile(&pidfile).expect("pidfile"),
            pid,
            "effective pid must come from the pidfile"
        );

        supervisor.force_kill().expect("force kill");
        assert!(!process_alive(pid));
        assert!(!pidfile.exists(), "pidfile removed on the way out of ready");
    }

    #[test]
    fn monitor_socket_milestone_tolerates_parent_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pidfile = dir.path().join("vm.pid");
        let socket = dir.path().join("vm.sock");
        let script = format!(
            "(sleep 0.2; touch {}; sleep 60) & echo $! > {}; exit 0",
            socket.display(),
            pidfile.display()
        );
        let mut plan = shell_plan("devbox", &script);
        plan.pidfile = Some(pidfile);
        plan.monitor_socket = Some(socket.clone());
        plan.daemonize = true;

        let mut supervisor = Supervisor::new();
        let pid = supervisor.start(&plan).expect("start");
        assert!(socket.exists());
        assert!(process_alive(pid));
        supervisor.force_kill().expect("force kill");
    }

    #[test]
    fn stop_escalates_to_sigkill_for_stubborn_processes() {
        let mut supervisor = Supervisor::new();
        let pid = supervisor
            .start(&shell_plan("devbox", "trap '' TERM; sleep 60"))
            .expect("start");
        assert!(supervisor.is_alive());

        supervisor.stop(Duration::from_millis(400)).expect("stop");
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(!process_alive(pid));
    }

    #[test]
    fn supervisor_is_single_shot() {
        let mut supervisor = Supervisor::new();
        supervisor
            .start(&shell_plan("devbox", "sleep 60"))
            .expect("start");
        let err = supervisor
            .start(&shell_plan("devbox", "sleep 60"))
            .unwrap_err();
        assert_eq!(err.code(), "process-error");
        supervisor.force_kill().expect("cleanup");
    }

    #[test]
    fn pidfile_parsing_rejects_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vm.pid");
        fs::write(&path, "not-a-pid\n").expect("write");
        assert!(read_pidfile(&path).is_err());
        fs::write(&path, "-4\n").expect("write");
        assert!(read_pidfile(&path).is_err());
        fs::write(&path, "  1234 \n").expect("write");
        assert_eq!(read_pidfile(&path).expect("pid"), 1234);
    }
}
