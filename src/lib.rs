//! Castellan library crate.
//!
//! A hypervisor control plane for Linux hosts: it reconciles a relational
//! store of machine definitions with the live kernel resources (hypervisor
//! processes, TAP devices, packet-filter chains, cgroup scopes, monitor
//! sockets, disk images) that realize them.

/// Core library modules and APIs.
pub mod core;

/// CLI argument parsing and adapters (only when the `cli` feature is enabled).
#[cfg(feature = "cli")]
pub mod cli;

#[cfg(feature = "cli")]
pub mod app;

mod config;
mod error;

pub use config::*;
pub use error::*;
