use std::sync::mpsc::Sender;

use serde_json::Value;

use crate::config::MachineStatus;

use super::diagnostics::Severity;

/// Structured event emitted during lifecycle operations.
#[derive(Debug, Clone)]
pub enum Event {
    /// A textual progress update with a severity level.
    Message {
        /// Severity of the message.
        severity: Severity,
        /// Human-readable text.
        text: String,
    },
    /// A machine finished `create` and is running.
    MachineCreated {
        /// Machine id.
        vm: String,
        /// Hypervisor PID.
        pid: u32,
        /// TAP device carrying the machine's traffic.
        tap: String,
        /// Allocated display port.
        display_port: u16,
    },
    /// A machine finished `start` and is running.
    MachineStarted {
        /// Machine id.
        vm: String,
        /// Hypervisor PID.
        pid: u32,
    },
    /// Host-side stop sequence began.
    ShutdownRequested {
        /// Machine id.
        vm: String,
    },
    /// The ACPI powerdown command was delivered to the guest.
    PowerdownSent {
        /// Machine id.
        vm: String,
    },
    /// The stop sequence finished.
    ShutdownComplete {
        /// Machine id.
        vm: String,
        /// Whether SIGKILL was required.
        forced: bool,
        /// Milliseconds from request to completion.
        total_ms: u64,
    },
    /// Guest execution paused.
    MachineSuspended {
        /// Machine id.
        vm: String,
    },
    /// Guest execution resumed.
    MachineResumed {
        /// Machine id.
        vm: String,
    },
    /// Guest was reset; status is unchanged.
    MachineReset {
        /// Machine id.
        vm: String,
    },
    /// Identity-bound resources (TAP, chain) were destroyed.
    ResourcesDestroyed {
        /// Machine id.
        vm: String,
    },
    /// The guest initiated its own shutdown (or honored an ACPI request).
    GuestShutdown {
        /// Machine id.
        vm: String,
        /// Reason string reported by the hypervisor.
        reason: String,
    },
    /// Persisted status changed in reaction to a monitor event.
    StatusChanged {
        /// Machine id.
        vm: String,
        /// New persisted status.
        status: MachineStatus,
    },
    /// Raw monitor event passthrough for embedding hosts.
    MonitorEvent {
        /// Machine id.
        vm: String,
        /// QMP event name.
        name: String,
    },
    /// Progress report from an unattended-install monitor task.
    InstallProgress {
        /// Machine id.
        vm: String,
        /// Human-readable progress text.
        text: String,
        /// Whether the installation finished (successfully or not).
        finished: bool,
    },
}

/// CRUD action mirrored onto the optional event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrudAction {
    Create,
    PowerOn,
    PowerOff,
    Suspend,
    Resume,
    Update,
}

impl CrudAction {
    /// Wire name used by bus consumers.
    pub fn as_str(self) -> &'static str {
        match self {
            CrudAction::Create => "create",
            CrudAction::PowerOn => "power_on",
            CrudAction::PowerOff => "power_off",
            CrudAction::Suspend => "suspend",
            CrudAction::Resume => "resume",
            CrudAction::Update => "update",
        }
    }
}

/// One message on the CRUD bus.
#[derive(Debug, Clone)]
pub struct CrudEvent {
    pub resource: &'static str,
    pub action: CrudAction,
    pub id: String,
    pub data: Option<Value>,
}

/// Optional fan-out of machine CRUD events to an embedding host.
///
/// Emission is fire-and-forget: a missing or disconnected consumer never
/// fails the operation that emitted.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    tx: Option<Sender<CrudEvent>>,
}

impl EventBus {
    /// A bus that drops everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(tx: Sender<CrudEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn emit_crud(&self, action: CrudAction, id: &str, data: Option<Value>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(CrudEvent {
                resource: "machines",
                action,
                id: id.to_string(),
                data,
            });
        }
    }
}
