use crate::config::MachineStatus;

use super::diagnostics::Diagnostic;
use super::events::Event;

/// Result wrapper returned by high-level operations.
pub type OperationResult<T> = crate::error::Result<OperationOutput<T>>;

/// Envelope for successful operation outcomes.
#[derive(Debug)]
pub struct OperationOutput<T> {
    /// Primary value produced by the operation.
    pub value: T,
    /// Diagnostics collected while performing the operation.
    pub diagnostics: Vec<Diagnostic>,
    /// Structured events captured during the run.
    pub events: Vec<Event>,
}

impl<T> OperationOutput<T> {
    /// Create a new operation output.
    pub fn new(value: T) -> Self {
        Self {
            value,
            diagnostics: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Attach diagnostics to the output.
    pub fn with_diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Attach events to the output.
    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events = events;
        self
    }
}

/// Outcome of `create`.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub vm_id: String,
    pub pid: u32,
    pub tap_device: String,
    pub display_port: u16,
}

/// Outcome of `start`.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub pid: u32,
    pub tap_device: Option<String>,
    pub display_port: Option<u16>,
    /// False when the machine was already running.
    pub changed: bool,
}

/// Outcome of `stop`.
#[derive(Debug, Clone, Copy)]
pub struct StopOutcome {
    /// Whether the machine transitioned from running to off.
    pub changed: bool,
    /// Whether SIGKILL was required.
    pub forced: bool,
}

/// Outcome of `destroy_resources`.
#[derive(Debug, Clone, Copy)]
pub struct DestroyOutcome {
    pub changed: bool,
}

/// Outcome of `get_status`.
#[derive(Debug, Clone)]
pub struct StatusOutcome {
    pub persisted: MachineStatus,
    pub pid: Option<u32>,
    pub process_alive: bool,
    /// Live runtime status from the monitor, when reachable.
    pub runtime_status: Option<String>,
    /// False when the persisted status contradicts process liveness.
    pub consistent: bool,
}
