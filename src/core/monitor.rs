//! Client for the hypervisor's line-framed JSON monitor protocol.
//!
//! The server sends one greeting object on accept, then speaks
//! newline-delimited JSON: command requests carry a correlation `id`, and
//! the server interleaves correlated responses with asynchronous events.
//! One reader thread per connection dispatches parsed lines to either the
//! pending-command table or the event listeners; correlation by id is the
//! only ordering mechanism, so responses to distinct commands may arrive in
//! any order.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const CONNECT_POLL: Duration = Duration::from_millis(100);

/// Reconnection policy applied after an unsolicited close.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

/// Tunables for one monitor connection.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Deadline for socket connect plus greeting/handshake.
    pub connect_timeout: Duration,
    /// Per-command response deadline.
    pub command_timeout: Duration,
    /// Retry on unsolicited close when set.
    pub reconnect: Option<ReconnectPolicy>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            reconnect: None,
        }
    }
}

/// State-change events the hypervisor reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitorEventKind {
    Shutdown,
    Powerdown,
    Reset,
    Stop,
    Resume,
    Suspend,
    Wakeup,
    /// Any event name outside the recognized set.
    Other,
}

impl MonitorEventKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "SHUTDOWN" => MonitorEventKind::Shutdown,
            "POWERDOWN" => MonitorEventKind::Powerdown,
            "RESET" => MonitorEventKind::Reset,
            "STOP" => MonitorEventKind::Stop,
            "RESUME" => MonitorEventKind::Resume,
            "SUSPEND" => MonitorEventKind::Suspend,
            "WAKEUP" => MonitorEventKind::Wakeup,
            _ => MonitorEventKind::Other,
        }
    }
}

/// One asynchronous event as received from the wire.
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub name: String,
    pub data: Value,
    pub seconds: i64,
    pub microseconds: i64,
}

impl MonitorEvent {
    pub fn kind(&self) -> MonitorEventKind {
        MonitorEventKind::from_name(&self.name)
    }

    /// `reason` field of a SHUTDOWN event, when present.
    pub fn shutdown_reason(&self) -> Option<&str> {
        self.data.get("reason").and_then(Value::as_str)
    }

    /// `guest` field of a SHUTDOWN event; defaults to `false`.
    pub fn guest_initiated(&self) -> bool {
        self.data
            .get("guest")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Handle returned by listener registration; pass to
/// [`MonitorClient::remove_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type EventCallback = Box<dyn Fn(&MonitorEvent) + Send>;
type NotifyCallback = Box<dyn Fn() + Send>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    typed: Vec<(ListenerId, MonitorEventKind, EventCallback)>,
    any: Vec<(ListenerId, EventCallback)>,
    disconnect: Vec<(ListenerId, NotifyCallback)>,
    reconnect: Vec<(ListenerId, NotifyCallback)>,
    reconnect_failed: Vec<(ListenerId, NotifyCallback)>,
}

impl Listeners {
    fn allocate(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }

    fn remove(&mut self, id: ListenerId) {
        self.typed.retain(|(entry, _, _)| *entry != id);
        self.any.retain(|(entry, _)| *entry != id);
        self.disconnect.retain(|(entry, _)| *entry != id);
        self.reconnect.retain(|(entry, _)| *entry != id);
        self.reconnect_failed.retain(|(entry, _)| *entry != id);
    }
}

enum CommandReply {
    Return(Value),
    Error { class: String, desc: String },
    Disconnected,
}

struct Pending {
    command: String,
    tx: Sender<CommandReply>,
}

struct Shared {
    socket_path: PathBuf,
    config: MonitorConfig,
    writer: Mutex<Option<UnixStream>>,
    pending: Mutex<HashMap<String, Pending>>,
    listeners: Mutex<Listeners>,
    next_command: AtomicU64,
    connected: AtomicBool,
    shutting_down: AtomicBool,
}

/// Connection to one hypervisor monitor socket.
///
/// Commands may overlap freely; each carries its own deadline. The
/// correlation table is empty whenever the client is not connected.
pub struct MonitorClient {
    shared: Arc<Shared>,
    reader: Mutex<Option<(ThreadId, JoinHandle<()>)>>,
}

impl std::fmt::Debug for MonitorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorClient")
            .field("socket_path", &self.shared.socket_path)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl MonitorClient {
    pub fn new(socket_path: impl Into<PathBuf>, config: MonitorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                socket_path: socket_path.into(),
                config,
                writer: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Listeners::default()),
                next_command: AtomicU64::new(1),
                connected: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
            }),
            reader: Mutex::new(None),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.shared.socket_path
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Open the socket, consume the greeting, perform the capability
    /// handshake, and start the reader thread.
    pub fn connect(&self) -> Result<()> {
        self.shared.shutting_down.store(false, Ordering::SeqCst);
        let reader = establish(&self.shared)?;
        let handle = spawn_reader(Arc::clone(&self.shared), reader);
        let thread_id = handle.thread().id();
        if let Ok(mut slot) = self.reader.lock() {
            *slot = Some((thread_id, handle));
        }
        Ok(())
    }

    /// Reject every pending command with `client-disconnected` and close
    /// the socket. Must not be called from an event callback.
    pub fn disconnect(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        if let Ok(mut writer) = self.shared.writer.lock() {
            if let Some(stream) = writer.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        reject_pending(&self.shared);

        let handle = match self.reader.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some((thread_id, handle)) = handle {
            if thread::current().id() != thread_id {
                let _ = handle.join();
            }
        }
    }

    /// Issue a correlated command and wait for its response.
    pub fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        if !self.is_connected() {
            return Err(Error::ClientDisconnected);
        }

        let id = format!(
            "castellan-{}",
            self.shared.next_command.fetch_add(1, Ordering::SeqCst)
        );
        let mut frame = json!({ "execute": command, "id": id });
        if let Some(arguments) = arguments {
            frame["arguments"] = arguments;
        }

        let (tx, rx) = mpsc::channel();
        {
            let mut pending = lock_pending(&self.shared);
            pending.insert(
                id.clone(),
                Pending {
                    command: command.to_string(),
                    tx,
                },
            );
        }

        if let Err(err) = write_frame(&self.shared, &frame) {
            lock_pending(&self.shared).remove(&id);
            return Err(err);
        }

        match rx.recv_timeout(self.shared.config.command_timeout) {
            Ok(CommandReply::Return(value)) => Ok(value),
            Ok(CommandReply::Error { class, desc }) => Err(Error::CommandError {
                command: command.to_string(),
                class,
                desc,
            }),
            Ok(CommandReply::Disconnected) => Err(Error::ClientDisconnected),
            Err(RecvTimeoutError::Timeout) => {
                lock_pending(&self.shared).remove(&id);
                Err(Error::CommandTimeout {
                    command: command.to_string(),
                    waited_ms: self.shared.config.command_timeout.as_millis() as u64,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::ClientDisconnected),
        }
    }

    /// Register a listener for one event kind.
    pub fn on_event(
        &self,
        kind: MonitorEventKind,
        callback: impl Fn(&MonitorEvent) + Send + 'static,
    ) -> ListenerId {
        let mut listeners = lock_listeners(&self.shared);
        let id = listeners.allocate();
        listeners.typed.push((id, kind, Box::new(callback)));
        id
    }

    /// Register a listener receiving every event.
    pub fn on_any_event(&self, callback: impl Fn(&MonitorEvent) + Send + 'static) -> ListenerId {
        let mut listeners = lock_listeners(&self.shared);
        let id = listeners.allocate();
        listeners.any.push((id, Box::new(callback)));
        id
    }

    /// Register a listener fired on unsolicited close.
    pub fn on_disconnect(&self, callback: impl Fn() + Send + 'static) -> ListenerId {
        let mut listeners = lock_listeners(&self.shared);
        let id = listeners.allocate();
        listeners.disconnect.push((id, Box::new(callback)));
        id
    }

    /// Register a listener fired when auto-reconnect succeeds.
    pub fn on_reconnect(&self, callback: impl Fn() + Send + 'static) -> ListenerId {
        let mut listeners = lock_listeners(&self.shared);
        let id = listeners.allocate();
        listeners.reconnect.push((id, Box::new(callback)));
        id
    }

    /// Register a listener fired when auto-reconnect gives up.
    pub fn on_reconnect_failed(&self, callback: impl Fn() + Send + 'static) -> ListenerId {
        let mut listeners = lock_listeners(&self.shared);
        let id = listeners.allocate();
        listeners.reconnect_failed.push((id, Box::new(callback)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        lock_listeners(&self.shared).remove(id);
    }

    /// Number of commands awaiting responses.
    pub fn pending_commands(&self) -> usize {
        lock_pending(&self.shared).len()
    }

    // Typed helpers for the commands the lifecycle paths rely on.

    pub fn query_status(&self) -> Result<StatusReply> {
        let value = self.execute("query-status", None)?;
        serde_json::from_value(value).map_err(|err| Error::QmpError {
            message: format!("unexpected query-status payload: {err}"),
        })
    }

    /// ACPI powerdown request; the guest decides when to exit.
    pub fn powerdown(&self) -> Result<()> {
        self.execute("system_powerdown", None).map(|_| ())
    }

    pub fn reset(&self) -> Result<()> {
        self.execute("system_reset", None).map(|_| ())
    }

    /// Pause guest execution.
    pub fn stop(&self) -> Result<()> {
        self.execute("stop", None).map(|_| ())
    }

    /// Resume guest execution.
    pub fn cont(&self) -> Result<()> {
        self.execute("cont", None).map(|_| ())
    }

    /// Immediate hypervisor exit. Data-lossy; reserved for destroy paths.
    pub fn quit(&self) -> Result<()> {
        self.execute("quit", None).map(|_| ())
    }

    pub fn eject(&self, device: &str, force: bool) -> Result<()> {
        self.execute("eject", Some(json!({ "device": device, "force": force })))
            .map(|_| ())
    }

    pub fn query_cpus(&self) -> Result<Value> {
        self.execute("query-cpus-fast", None)
    }

    pub fn query_block(&self) -> Result<Value> {
        self.execute("query-block", None)
    }

    /// Resize the balloon. `bytes` is the target guest memory in bytes.
    pub fn balloon(&self, bytes: u64) -> Result<()> {
        self.execute("balloon", Some(json!({ "value": bytes })))
            .map(|_| ())
    }

    pub fn query_balloon(&self) -> Result<u64> {
        let value = self.execute("query-balloon", None)?;
        value
            .get("actual")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::QmpError {
                message: "query-balloon response lacked `actual`".to_string(),
            })
    }
}

impl Drop for MonitorClient {
    fn drop(&mut self) {
        if self.is_connected() {
            self.disconnect();
        }
    }
}

/// Runtime status payload of `query-status`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusReply {
    pub status: String,
    #[serde(default)]
    pub running: bool,
}

fn lock_pending(shared: &Shared) -> std::sync::MutexGuard<'_, HashMap<String, Pending>> {
    shared
        .pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_listeners(shared: &Shared) -> std::sync::MutexGuard<'_, Listeners> {
    shared
        .listeners
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_frame(shared: &Shared, frame: &Value) -> Result<()> {
    let mut line = frame.to_string();
    line.push('\n');
    let mut writer = shared
        .writer
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    match writer.as_mut() {
        Some(stream) => stream
            .write_all(line.as_bytes())
            .map_err(|_| Error::ClientDisconnected),
        None => Err(Error::ClientDisconnected),
    }
}

fn reject_pending(shared: &Shared) {
    let entries: Vec<Pending> = {
        let mut pending = lock_pending(shared);
        pending.drain().map(|(_, entry)| entry).collect()
    };
    for entry in entries {
        let _ = entry.tx.send(CommandReply::Disconnected);
    }
}

/// Connect, consume the greeting, and complete the capability handshake.
/// Returns the buffered reader to hand to the reader thread; any bytes the
/// server sent after the handshake response stay buffered.
fn establish(shared: &Shared) -> Result<BufReader<UnixStream>> {
    let deadline = Instant::now() + shared.config.connect_timeout;
    let stream = loop {
        match UnixStream::connect(&shared.socket_path) {
            Ok(stream) => break stream,
            Err(err) => match err.kind() {
                ErrorKind::NotFound | ErrorKind::ConnectionRefused => {
                    if Instant::now() >= deadline {
                        return Err(Error::ConnectTimeout {
                            path: shared.socket_path.clone(),
                            waited_ms: shared.config.connect_timeout.as_millis() as u64,
                        });
                    }
                    thread::sleep(CONNECT_POLL);
                }
                ErrorKind::PermissionDenied => {
                    return Err(Error::ConnectFailed {
                        path: shared.socket_path.clone(),
                        message: "permission denied".to_string(),
                    });
                }
                _ => {
                    return Err(Error::ConnectFailed {
                        path: shared.socket_path.clone(),
                        message: err.to_string(),
                    });
                }
            },
        }
    };

    stream
        .set_read_timeout(Some(shared.config.connect_timeout))
        .map_err(|err| Error::ConnectFailed {
            path: shared.socket_path.clone(),
            message: err.to_string(),
        })?;

    let writer_half = stream.try_clone().map_err(|err| Error::ConnectFailed {
        path: shared.socket_path.clone(),
        message: format!("failed to clone stream: {err}"),
    })?;
    let mut reader = BufReader::new(stream);

    let greeting = read_message(&mut reader, shared)?;
    if greeting.get("QMP").is_none() {
        return Err(Error::HandshakeFailed {
            message: format!("unexpected greeting: {greeting}"),
        });
    }

    let handshake_id = format!(
        "castellan-{}",
        shared.next_command.fetch_add(1, Ordering::SeqCst)
    );
    {
        let mut line = json!({ "execute": "qmp_capabilities", "id": handshake_id }).to_string();
        line.push('\n');
        let mut writer_ref = &writer_half;
        writer_ref
            .write_all(line.as_bytes())
            .map_err(|err| Error::HandshakeFailed {
                message: format!("failed to send qmp_capabilities: {err}"),
            })?;
    }

    // Events may arrive before the handshake response; skip them.
    loop {
        let message = read_message(&mut reader, shared)?;
        if message.get("event").is_some() {
            continue;
        }
        if message.get("return").is_some() {
            break;
        }
        if let Some(error) = message.get("error") {
            return Err(Error::HandshakeFailed {
                message: format!("capability negotiation rejected: {error}"),
            });
        }
        debug!(%message, "ignoring unexpected message during handshake");
    }

    reader
        .get_ref()
        .set_read_timeout(None)
        .map_err(|err| Error::ConnectFailed {
            path: shared.socket_path.clone(),
            message: err.to_string(),
        })?;

    if let Ok(mut writer) = shared.writer.lock() {
        *writer = Some(writer_half);
    }
    shared.connected.store(true, Ordering::SeqCst);
    Ok(reader)
}

fn read_message(reader: &mut BufReader<UnixStream>, shared: &Shared) -> Result<Value> {
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).map_err(|err| {
            if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) {
                Error::HandshakeTimeout {
                    waited_ms: shared.config.connect_timeout.as_millis() as u64,
                }
            } else {
                Error::HandshakeFailed {
                    message: err.to_string(),
                }
            }
        })?;
        if bytes == 0 {
            return Err(Error::HandshakeFailed {
                message: "connection closed during handshake".to_string(),
            });
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return serde_json::from_str(trimmed).map_err(|err| Error::HandshakeFailed {
            message: format!("malformed handshake message: {err}"),
        });
    }
}

fn spawn_reader(shared: Arc<Shared>, reader: BufReader<UnixStream>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("monitor-reader".to_string())
        .spawn(move || reader_thread(shared, reader))
        .unwrap_or_else(|err| {
            // Thread spawn failure leaves the client connected but deaf;
            // treat it as fatal for the process.
            panic!("failed to spawn monitor reader thread: {err}");
        })
}

fn reader_thread(shared: Arc<Shared>, mut reader: BufReader<UnixStream>) {
    loop {
        pump_lines(&shared, &mut reader);

        if shared.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        // Unsolicited close.
        shared.connected.store(false, Ordering::SeqCst);
        if let Ok(mut writer) = shared.writer.lock() {
            writer.take();
        }
        reject_pending(&shared);
        notify(&shared, NotifyKind::Disconnect);

        match try_reconnect(&shared) {
            Some(next) => {
                notify(&shared, NotifyKind::Reconnect);
                reader = next;
            }
            None => {
                if shared.config.reconnect.is_some()
                    && !shared.shutting_down.load(Ordering::SeqCst)
                {
                    notify(&shared, NotifyKind::ReconnectFailed);
                }
                return;
            }
        }
    }
}

/// Read and dispatch lines until EOF or a read error.
fn pump_lines(shared: &Shared, reader: &mut BufReader<UnixStream>) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(message) => dispatch(shared, message),
                    Err(err) => {
                        // Malformed lines are dropped; the connection stays up.
                        warn!(line = trimmed, %err, "discarding malformed monitor line");
                    }
                }
            }
            Err(err) => {
                if !shared.shutting_down.load(Ordering::SeqCst) {
                    warn!(%err, "monitor read failed");
                }
                return;
            }
        }
    }
}

fn dispatch(shared: &Shared, message: Value) {
    if message.get("QMP").is_some() {
        debug!("ignoring repeated greeting");
        return;
    }

    if let Some(name) = message.get("event").and_then(Value::as_str) {
        let (seconds, microseconds) = message
            .get("timestamp")
            .map(|timestamp| {
                (
                    timestamp
                        .get("seconds")
                        .and_then(Value::as_i64)
                        .unwrap_or(0),
                    timestamp
                        .get("microseconds")
                        .and_then(Value::as_i64)
                        .unwrap_or(0),
                )
            })
            .unwrap_or((0, 0));
        let event = MonitorEvent {
            name: name.to_string(),
            data: message.get("data").cloned().unwrap_or(Value::Null),
            seconds,
            microseconds,
        };
        let kind = event.kind();
        let listeners = lock_listeners(shared);
        for (_, registered, callback) in &listeners.typed {
            if *registered == kind {
                callback(&event);
            }
        }
        for (_, callback) in &listeners.any {
            callback(&event);
        }
        return;
    }

    if message.get("return").is_some() || message.get("error").is_some() {
        let Some(id) = message.get("id").and_then(Value::as_str) else {
            warn!(%message, "dropping response without id");
            return;
        };
        let entry = lock_pending(shared).remove(id);
        let Some(entry) = entry else {
            warn!(id, "dropping response with no pending command");
            return;
        };
        let reply = if let Some(error) = message.get("error") {
            CommandReply::Error {
                class: error
                    .get("class")
                    .and_then(Value::as_str)
                    .unwrap_or("GenericError")
                    .to_string(),
                desc: error
                    .get("desc")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            }
        } else {
            CommandReply::Return(message.get("return").cloned().unwrap_or(Value::Null))
        };
        // The awaiter may have timed out and evicted itself; that is fine.
        if entry.tx.send(reply).is_err() {
            debug!(id, command = entry.command, "response arrived after timeout");
        }
        return;
    }

    warn!(%message, "dropping unclassifiable monitor message");
}

enum NotifyKind {
    Disconnect,
    Reconnect,
    ReconnectFailed,
}

fn notify(shared: &Shared, kind: NotifyKind) {
    let listeners = lock_listeners(shared);
    let callbacks = match kind {
        NotifyKind::Disconnect => &listeners.disconnect,
        NotifyKind::Reconnect => &listeners.reconnect,
        NotifyKind::ReconnectFailed => &listeners.reconnect_failed,
    };
    for (_, callback) in callbacks {
        callback();
    }
}

fn try_reconnect(shared: &Shared) -> Option<BufReader<UnixStream>> {
    let policy = shared.config.reconnect?;
    for attempt in 1..=policy.max_attempts {
        if shared.shutting_down.load(Ordering::SeqCst) {
            return None;
        }
        thread::sleep(policy.delay);
        match establish(shared) {
            Ok(reader) => return Some(reader),
            Err(err) => {
                warn!(attempt, %err, "monitor reconnect attempt failed");
            }
        }
    }
    None
}

/// Map a raw connect error to the taxonomy used by callers that probe
/// sockets directly.
pub fn classify_connect_error(err: &io::Error) -> &'static str {
    match err.kind() {
        ErrorKind::ConnectionRefused => "connection-refused",
        ErrorKind::NotFound => "not-found",
        ErrorKind::PermissionDenied => "permission-denied",
        ErrorKind::WouldBlock | ErrorKind::TimedOut => "timeout",
        _ => "generic",
    }
}
