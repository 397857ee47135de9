use std::process::ExitCode;

use crate::Error;

/// Map library errors onto process exit codes.
pub fn exit_code(err: &Error) -> ExitCode {
    match err.code() {
        "invalid-config" => ExitCode::from(64),
        "vm-not-found" => ExitCode::from(66),
        "invalid-state" | "concurrent-modification" | "version-conflict" => ExitCode::from(69),
        "resource-unavailable" => ExitCode::from(75),
        _ => ExitCode::FAILURE,
    }
}
