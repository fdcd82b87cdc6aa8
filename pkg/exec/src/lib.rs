//! External-tool gateway.
//!
//! Every switch, link, namespace and runtime operation goes through a
//! [`CommandRunner`], so the workflows can be driven against a fake host in
//! tests without touching real interfaces.

use async_trait::async_trait;
use tracing::{error, info};

pub mod fake;

/// Combined stdout+stderr of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Tally of the tool invocations of one best-effort workflow step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    pub attempted: usize,
    pub failed: usize,
}

impl StepReport {
    /// Count `out` and hand it back.
    pub fn record(&mut self, out: CommandOutput) -> CommandOutput {
        self.attempted += 1;
        if !out.success {
            self.failed += 1;
        }
        out
    }

    pub fn merge(&mut self, other: StepReport) {
        self.attempted += other.attempted;
        self.failed += other.failed;
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Build an argument vector from string slices.
pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Runs external tools.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` and wait for it. Spawn failures are reported
    /// as an unsuccessful output, never as a panic.
    async fn run(&self, program: &str, args: &[String]) -> CommandOutput;

    /// Run with logging: the invocation is logged, failures are logged with
    /// the full command line and captured output, and `verbose` calls also log
    /// any non-empty output. The result is returned either way.
    async fn execute(&self, program: &str, args: &[String], verbose: bool) -> CommandOutput {
        let line = command_line(program, args);
        info!("Executing command {}", line);
        let out = self.run(program, args).await;
        if !out.success {
            error!(
                "command {} returned failure and following output: {}",
                line,
                out.output.trim_end()
            );
        } else if verbose && !out.output.trim().is_empty() {
            info!("Command '{}' returned: {}", line, out.output.trim_end());
        }
        out
    }
}

/// `program arg1 arg2 ...`
pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Spawns real processes via `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> CommandOutput {
        match tokio::process::Command::new(program).args(args).output().await {
            Ok(out) => {
                let mut combined = String::from_utf8_lossy(&out.stdout).to_string();
                combined.push_str(&String::from_utf8_lossy(&out.stderr));
                CommandOutput {
                    success: out.status.success(),
                    output: combined,
                }
            }
            Err(e) => CommandOutput::failed(format!("failed to spawn {}: {}", program, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_command_line() {
        let args = argv(&["add-port", "br0", "veth1"]);
        assert_eq!(command_line("ovs-vsctl", &args), "ovs-vsctl add-port br0 veth1");
    }

    #[test]
    fn report_counts_failures() {
        let mut report = StepReport::default();
        report.record(CommandOutput::ok(""));
        report.record(CommandOutput::failed("boom"));
        let mut total = StepReport::default();
        total.merge(report);
        assert_eq!(total.attempted, 2);
        assert_eq!(total.failed, 1);
        assert!(!total.is_clean());
    }

    #[tokio::test]
    async fn system_runner_captures_output() {
        let out = SystemRunner.run("echo", &argv(&["hello"])).await;
        assert!(out.success);
        assert_eq!(out.output.trim(), "hello");
    }

    #[tokio::test]
    async fn missing_binary_is_a_failed_output() {
        let out = SystemRunner
            .execute("kovs-definitely-not-installed", &[], true)
            .await;
        assert!(!out.success);
        assert!(out.output.contains("failed to spawn"));
    }
}
