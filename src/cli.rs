use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Hypervisor control plane for a single Linux host.
#[derive(Debug, Parser)]
#[command(name = "castellan", version, about)]
pub struct Cli {
    /// State directory holding the machine database and runtime artifacts.
    #[arg(long, global = true, default_value = "/var/lib/castellan")]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create and boot a machine from a JSON definition.
    Create(CreateArgs),
    /// Start a persisted machine.
    Start(MachineArgs),
    /// Stop a machine, waiting for the guest to shut down.
    Stop(StopArgs),
    /// Stop then start a machine.
    Restart(MachineArgs),
    /// Pause guest execution.
    Suspend(MachineArgs),
    /// Resume a suspended guest.
    Resume(MachineArgs),
    /// Hard-reset the guest.
    Reset(MachineArgs),
    /// Destroy a machine's host resources (TAP, firewall chain).
    Destroy(MachineArgs),
    /// Report persisted and live status.
    Status(MachineArgs),
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Path to a JSON machine definition.
    #[arg(long, value_name = "FILE")]
    pub definition: PathBuf,
}

#[derive(Debug, Args)]
pub struct MachineArgs {
    /// Machine identifier.
    pub vm_id: String,
}

#[derive(Debug, Args)]
pub struct StopArgs {
    /// Machine identifier.
    pub vm_id: String,

    /// Skip the ACPI shutdown request and just wait for exit.
    #[arg(long)]
    pub no_graceful: bool,

    /// Seconds to wait for the hypervisor to exit on its own.
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    /// Give up instead of force-killing when the timeout elapses.
    #[arg(long)]
    pub no_force: bool,
}
