use std::io;
use std::process::{Command, Output};

use tracing::debug;

/// Seam through which the resource facilities execute host commands
/// (`ip`, `nft`). Tests substitute a recording implementation; production
/// code uses [`ShellRunner`].
pub trait SystemRunner: Send + Sync {
    /// Run `program` with `args`, capturing output. An `Err` means the
    /// program could not be spawned; a non-zero exit status is reported
    /// through the returned [`Output`].
    fn run(&self, program: &str, args: &[&str]) -> io::Result<Output>;
}

/// Runs commands via `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

impl SystemRunner for ShellRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<Output> {
        debug!(program, ?args, "running host command");
        Command::new(program).args(args).output()
    }
}

/// Render a spawned command for error messages.
pub(crate) fn render_command(program: &str, args: &[&str]) -> String {
    let mut rendered = String::from(program);
    for arg in args {
        rendered.push(' ');
        rendered.push_str(arg);
    }
    rendered
}

/// Interpret an [`Output`], mapping non-zero exits to an error string that
/// includes the captured stderr.
pub(crate) fn expect_success(program: &str, args: &[&str], output: &Output) -> Result<(), String> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(format!(
        "`{}` exited with code {}: {}",
        render_command(program, args),
        output.status.code().unwrap_or(-1),
        stderr.trim()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_runner_captures_output() {
        let runner = ShellRunner;
        let output = runner.run("true", &[]).expect("spawn true");
        assert!(output.status.success());
        expect_success("true", &[], &output).expect("true succeeds");

        let output = runner.run("false", &[]).expect("spawn false");
        let err = expect_success("false", &[], &output).unwrap_err();
        assert!(err.contains("`false` exited with code 1"), "{err}");
    }

    #[test]
    fn render_command_joins_arguments() {
        assert_eq!(
            render_command("ip", &["link", "set", "vnet-v1", "up"]),
            "ip link set vnet-v1 up"
        );
    }
}
