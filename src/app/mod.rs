//! Thin CLI adapters over the lifecycle library.

pub mod error;

use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::cli::{CreateArgs, MachineArgs, StopArgs};
use crate::config::{CreateRequest, HostPaths};
use crate::core::diagnostics::{Diagnostic, Severity};
use crate::core::events::Event;
use crate::core::lifecycle::{LifecycleBuilder, LifecycleManager};
use crate::core::options::StopOptions;
use crate::core::store::SqliteStore;
use crate::error::{Error, Result};

use std::sync::Arc;

fn manager_for(data_dir: &Path) -> Result<LifecycleManager> {
    let disk_dir = data_dir.join("disks");
    let run_dir = data_dir.join("run");
    for dir in [data_dir, disk_dir.as_path(), run_dir.as_path()] {
        fs::create_dir_all(dir).map_err(|err| Error::InvalidConfig {
            message: format!("failed to prepare {}: {err}", dir.display()),
        })?;
    }

    let store = Arc::new(SqliteStore::open(data_dir.join("machines.db"))?);
    let paths = HostPaths {
        disk_dir,
        socket_dir: run_dir.clone(),
        pidfile_dir: run_dir,
        uefi_template: None,
        rom_dir: data_dir.join("roms"),
    };
    let manager = LifecycleBuilder::new(store, paths).build()?;

    // Recover records that claim to be running but whose hypervisor died
    // while we were not looking.
    let reconciled = manager.reconcile_running()?;
    emit_diagnostics(&reconciled.diagnostics);
    Ok(manager)
}

fn emit_diagnostics(diagnostics: &[Diagnostic]) {
    for diagnostic in diagnostics {
        let prefix = match diagnostic.severity {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        eprintln!("{prefix}: {}", diagnostic.message);
        if let Some(help) = &diagnostic.help {
            eprintln!("  help: {help}");
        }
    }
}

fn render_events(events: &[Event]) {
    for event in events {
        match event {
            Event::MachineCreated {
                vm,
                pid,
                tap,
                display_port,
            } => println!("→ {vm}: created (pid {pid}, tap {tap}, display port {display_port})."),
            Event::MachineStarted { vm, pid } => println!("→ {vm}: started (pid {pid})."),
            Event::PowerdownSent { vm } => println!("→ {vm}: ACPI shutdown requested."),
            Event::ShutdownComplete {
                vm,
                forced,
                total_ms,
            } => {
                let how = if *forced { "forced" } else { "graceful" };
                println!("→ {vm}: stopped ({how}, {total_ms} ms).");
            }
            Event::MachineSuspended { vm } => println!("→ {vm}: suspended."),
            Event::MachineResumed { vm } => println!("→ {vm}: resumed."),
            Event::MachineReset { vm } => println!("→ {vm}: reset."),
            Event::ResourcesDestroyed { vm } => println!("→ {vm}: resources destroyed."),
            Event::Message { text, .. } => println!("{text}"),
            _ => {}
        }
    }
}

pub fn handle_create(args: CreateArgs, data_dir: &Path) -> Result<()> {
    let raw = fs::read_to_string(&args.definition).map_err(|err| Error::InvalidConfig {
        message: format!("failed to read {}: {err}", args.definition.display()),
    })?;
    let request: CreateRequest = serde_json::from_str(&raw).map_err(|err| Error::InvalidConfig {
        message: format!("invalid machine definition: {err}"),
    })?;

    let manager = manager_for(data_dir)?;
    let output = manager.create(request)?;
    emit_diagnostics(&output.diagnostics);
    render_events(&output.events);
    Ok(())
}

pub fn handle_start(args: MachineArgs, data_dir: &Path) -> Result<()> {
    let manager = manager_for(data_dir)?;
    let output = manager.start(&args.vm_id)?;
    emit_diagnostics(&output.diagnostics);
    render_events(&output.events);
    if !output.value.changed {
        println!("→ {}: already running (pid {}).", args.vm_id, output.value.pid);
    }
    Ok(())
}

pub fn handle_stop(args: StopArgs, data_dir: &Path) -> Result<()> {
    let manager = manager_for(data_dir)?;
    let options = StopOptions {
        graceful: !args.no_graceful,
        timeout: Duration::from_secs(args.timeout_secs),
        force: !args.no_force,
    };
    let output = manager.stop(&args.vm_id, options)?;
    emit_diagnostics(&output.diagnostics);
    render_events(&output.events);
    if !output.value.changed {
        println!("→ {}: already off.", args.vm_id);
    }
    Ok(())
}

pub fn handle_restart(args: MachineArgs, data_dir: &Path) -> Result<()> {
    let manager = manager_for(data_dir)?;
    let output = manager.restart(&args.vm_id, StopOptions::default())?;
    emit_diagnostics(&output.diagnostics);
    render_events(&output.events);
    Ok(())
}

pub fn handle_suspend(args: MachineArgs, data_dir: &Path) -> Result<()> {
    let manager = manager_for(data_dir)?;
    let output = manager.suspend(&args.vm_id)?;
    emit_diagnostics(&output.diagnostics);
    render_events(&output.events);
    Ok(())
}

pub fn handle_resume(args: MachineArgs, data_dir: &Path) -> Result<()> {
    let manager = manager_for(data_dir)?;
    let output = manager.resume(&args.vm_id)?;
    emit_diagnostics(&output.diagnostics);
    render_events(&output.events);
    Ok(())
}

pub fn handle_reset(args: MachineArgs, data_dir: &Path) -> Result<()> {
    let manager = manager_for(data_dir)?;
    let output = manager.reset(&args.vm_id)?;
    emit_diagnostics(&output.diagnostics);
    render_events(&output.events);
    Ok(())
}

pub fn handle_destroy(args: MachineArgs, data_dir: &Path) -> Result<()> {
    let manager = manager_for(data_dir)?;
    let output = manager.destroy_resources(&args.vm_id)?;
    emit_diagnostics(&output.diagnostics);
    render_events(&output.events);
    Ok(())
}

pub fn handle_status(args: MachineArgs, data_dir: &Path) -> Result<()> {
    let manager = manager_for(data_dir)?;
    let output = manager.get_status(&args.vm_id)?;
    emit_diagnostics(&output.diagnostics);

    if let Ok(now) = time::OffsetDateTime::now_utc().format(&time::format_description::well_known::Rfc3339) {
        println!("checked: {now}");
    }
    let status = &output.value;
    println!("status: {}", status.persisted.as_str());
    match status.pid {
        Some(pid) => println!("pid: {pid} ({})", if status.process_alive { "alive" } else { "dead" }),
        None => println!("pid: -"),
    }
    if let Some(runtime) = &status.runtime_status {
        println!("hypervisor: {runtime}");
    }
    if !status.consistent {
        println!("inconsistent: persisted status contradicts process liveness");
    }
    Ok(())
}
