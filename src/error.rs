use std::path::PathBuf;

use thiserror::Error;

/// Convenient result alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Castellan library error type.
///
/// Every variant carries a stable machine-readable code (see [`Error::code`])
/// so embedding hosts can branch without parsing messages.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Timed out connecting to monitor socket {path} after {waited_ms} ms.")]
    ConnectTimeout { path: PathBuf, waited_ms: u64 },
    #[error("Monitor command `{command}` timed out after {waited_ms} ms.")]
    CommandTimeout { command: String, waited_ms: u64 },
    #[error("Monitor handshake failed: {message}")]
    HandshakeFailed { message: String },
    #[error("Monitor handshake timed out after {waited_ms} ms.")]
    HandshakeTimeout { waited_ms: u64 },
    #[error("Monitor client disconnected before the command completed.")]
    ClientDisconnected,
    #[error("Hypervisor rejected `{command}`: {class}: {desc}")]
    CommandError {
        command: String,
        class: String,
        desc: String,
    },
    #[error("Failed to connect to monitor socket {path}: {message}")]
    ConnectFailed { path: PathBuf, message: String },

    #[error("Hypervisor startup failed for `{vm}`: {message}")]
    StartupFailed {
        vm: String,
        message: String,
        stderr: Vec<String>,
    },
    #[error("Hypervisor process error for `{vm}`: {message}")]
    ProcessError { vm: String, message: String },
    #[error("Timed out waiting for {what} after {waited_ms} ms.")]
    Timeout { what: String, waited_ms: u64 },

    #[error("Network setup failed: {message}")]
    NetworkError {
        message: String,
        diagnostics: Vec<String>,
    },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
    #[error("VM `{vm}` is {actual}; operation requires {expected}.")]
    InvalidState {
        vm: String,
        expected: String,
        actual: String,
    },
    #[error("VM `{vm}` was not found in the store.")]
    VmNotFound { vm: String },
    #[error("VM `{vm}` was modified concurrently; retry the operation.")]
    ConcurrentModification { vm: String },
    #[error("Version conflict while updating VM `{vm}`.")]
    VersionConflict { vm: String },
    #[error("Store operation failed: {message}")]
    DatabaseError { message: String },
    #[error("Disk image operation failed: {message}")]
    DiskError { message: String },
    #[error("Resource unavailable: {message}")]
    ResourceUnavailable { message: String },

    #[error("Failed to create VM `{vm}`: {source}")]
    CreateFailed {
        vm: String,
        #[source]
        source: Box<Error>,
    },
    #[error("Failed to start VM `{vm}`: {source}")]
    StartFailed {
        vm: String,
        #[source]
        source: Box<Error>,
    },
    #[error("Failed to stop VM `{vm}`: {message}")]
    StopFailed { vm: String, message: String },
    #[error("Monitor protocol error: {message}")]
    QmpError { message: String },
}

impl Error {
    /// Stable error code for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ConnectTimeout { .. } => "connect-timeout",
            Error::CommandTimeout { .. } => "command-timeout",
            Error::HandshakeFailed { .. } => "handshake-failed",
            Error::HandshakeTimeout { .. } => "handshake-timeout",
            Error::ClientDisconnected => "client-disconnected",
            Error::CommandError { .. } => "command-error",
            Error::ConnectFailed { .. } => "connect-failed",
            Error::StartupFailed { .. } => "startup-failed",
            Error::ProcessError { .. } => "process-error",
            Error::Timeout { .. } => "timeout",
            Error::NetworkError { .. } => "network-error",
            Error::InvalidConfig { .. } => "invalid-config",
            Error::InvalidState { .. } => "invalid-state",
            Error::VmNotFound { .. } => "vm-not-found",
            Error::ConcurrentModification { .. } => "concurrent-modification",
            Error::VersionConflict { .. } => "version-conflict",
            Error::DatabaseError { .. } => "database-error",
            Error::DiskError { .. } => "disk-error",
            Error::ResourceUnavailable { .. } => "resource-unavailable",
            Error::CreateFailed { .. } => "create-failed",
            Error::StartFailed { .. } => "start-failed",
            Error::StopFailed { .. } => "stop-failed",
            Error::QmpError { .. } => "qmp-error",
        }
    }

    /// The VM this error concerns, when known.
    pub fn vm(&self) -> Option<&str> {
        match self {
            Error::StartupFailed { vm, .. }
            | Error::ProcessError { vm, .. }
            | Error::InvalidState { vm, .. }
            | Error::VmNotFound { vm }
            | Error::ConcurrentModification { vm }
            | Error::VersionConflict { vm }
            | Error::CreateFailed { vm, .. }
            | Error::StartFailed { vm, .. }
            | Error::StopFailed { vm, .. } => Some(vm),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = Error::ConcurrentModification {
            vm: "v1".to_string(),
        };
        assert_eq!(err.code(), "concurrent-modification");
        assert_eq!(err.vm(), Some("v1"));

        let err = Error::CreateFailed {
            vm: "v1".to_string(),
            source: Box::new(Error::NetworkError {
                message: "carrier never rose".to_string(),
                diagnostics: Vec::new(),
            }),
        };
        assert_eq!(err.code(), "create-failed");
        assert!(err.to_string().contains("carrier never rose"));
    }
}
