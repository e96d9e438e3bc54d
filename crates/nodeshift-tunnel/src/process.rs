//! External command execution
//!
//! Exit status and stderr are the only contract with the tools we invoke.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::ProcessError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `program` with `args` and wait for it to exit
    async fn run(&self, program: &str, args: &[String]) -> Result<ProcessOutput, ProcessError>;

    /// Run a shell script body with `sh -e`
    async fn run_script(&self, script: &str) -> Result<ProcessOutput, ProcessError> {
        let args = vec!["-e".to_string(), "-c".to_string(), script.to_string()];
        self.run("/bin/sh", &args).await
    }
}

/// Runs commands on the local machine
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for ShellRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<ProcessOutput, ProcessError> {
        debug!("Running {} ({} args)", program, args.len());

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProcessError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let code = output.status.code().ok_or_else(|| ProcessError::Killed {
            program: program.to_string(),
        })?;

        Ok(ProcessOutput {
            code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
