//! Core Castellan library API surface.

pub mod diagnostics;
pub mod events;
pub mod options;
pub mod outcome;

pub mod command;
pub mod cpuset;
pub mod firewall;
pub mod images;
pub mod lifecycle;
pub mod monitor;
pub mod net;
pub mod runner;
pub mod statesync;
pub mod store;
pub mod supervisor;
pub mod validate;
pub mod watcher;

pub use diagnostics::{Diagnostic, Severity};
pub use events::{CrudAction, CrudEvent, Event, EventBus};
pub use lifecycle::{LifecycleBuilder, LifecycleManager};
pub use monitor::{MonitorClient, MonitorConfig, MonitorEvent, MonitorEventKind, ReconnectPolicy};
pub use options::StopOptions;
pub use outcome::{
    CreateOutcome, DestroyOutcome, OperationOutput, OperationResult, StartOutcome, StatusOutcome,
    StopOutcome,
};
pub use store::{MachineStore, MemoryStore, RuntimeUpdate, SqliteStore, Transition, VmRecord};
pub use supervisor::{LaunchPlan, LaunchWrapper, Supervisor, SupervisorState};
pub use watcher::MachineWatcher;
