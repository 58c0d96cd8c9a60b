use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::protocol::{JobFailure, KIND_BAD_ARGUMENTS, KIND_COMMAND_FAILED};
use crate::worker::{JobContext, JobHandler};

/// Registered name of the built-in shell handler.
pub const SHELL_JOB: &str = "shell";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellArgs {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs one shell command and captures its output.
#[derive(Debug, Default)]
pub struct ShellJob;

#[async_trait]
impl JobHandler for ShellJob {
    async fn run(&self, ctx: JobContext, args: Vec<u8>) -> Result<Vec<u8>, JobFailure> {
        let args: ShellArgs = bincode::deserialize(&args)
            .map_err(|e| JobFailure::new(KIND_BAD_ARGUMENTS, format!("bad shell args: {e}")))?;

        tracing::info!(command = %args.command, "Running shell command");
        ctx.report_progress(None, None, Some(args.command.as_str()));

        let output = Command::new("sh")
            .arg("-c")
            .arg(&args.command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| JobFailure::new(KIND_COMMAND_FAILED, e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();

        if !output.status.success() {
            let message = if stderr.is_empty() {
                format!("exit code: {exit_code:?}")
            } else {
                stderr
            };
            return Err(JobFailure::new(KIND_COMMAND_FAILED, message));
        }

        let result = ShellOutput {
            exit_code,
            stdout,
            stderr,
        };
        bincode::serialize(&result)
            .map_err(|e| JobFailure::new(KIND_COMMAND_FAILED, format!("unencodable output: {e}")))
    }
}
