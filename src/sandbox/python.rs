//! Default interpreter provider: Python subprocesses in a temp work directory
//!
//! Every `exec` writes the program to disk and spawns a fresh `python3`
//! process, so runs never share interpreter state. The work directory is the
//! provisioned "environment" and is removed on shutdown.

use super::{Interpreter, InterpreterProvider, RawRun, SessionError};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::debug;

/// Provisions Python subprocess environments
pub struct PythonInterpreterProvider {
    python_bin: String,
}

impl PythonInterpreterProvider {
    pub fn new(python_bin: impl Into<String>) -> Self {
        Self {
            python_bin: python_bin.into(),
        }
    }
}

#[async_trait]
impl InterpreterProvider for PythonInterpreterProvider {
    async fn provision(&self) -> Result<Box<dyn Interpreter>, SessionError> {
        let workdir = TempDir::new()
            .map_err(|e| SessionError::Provisioning(format!("workdir: {}", e)))?;
        debug!(path = %workdir.path().display(), "Provisioned python sandbox");
        Ok(Box::new(PythonInterpreter {
            workdir,
            python_bin: self.python_bin.clone(),
        }))
    }
}

/// One Python sandbox environment
pub struct PythonInterpreter {
    workdir: TempDir,
    python_bin: String,
}

#[async_trait]
impl Interpreter for PythonInterpreter {
    async fn exec(&mut self, program: &str) -> Result<RawRun, SessionError> {
        let program_path = self.workdir.path().join("program.py");
        tokio::fs::write(&program_path, program)
            .await
            .map_err(|e| SessionError::Crashed(format!("write program: {}", e)))?;

        // kill_on_drop so a run abandoned by the session timeout does not
        // leave the child behind.
        let output = Command::new(&self.python_bin)
            .arg(&program_path)
            .current_dir(self.workdir.path())
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SessionError::Crashed(format!("spawn {}: {}", self.python_bin, e)))?;

        Ok(RawRun {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }

    async fn shutdown(&mut self) {
        // TempDir removal happens on drop; nothing to await.
        debug!(path = %self.workdir.path().display(), "Shutting down python sandbox");
    }
}
