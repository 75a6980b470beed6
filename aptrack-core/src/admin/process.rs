//! Game server process control.

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

/// Start, stop and probe the external game server.
pub trait ProcessManager {
    fn is_running(&mut self) -> bool;

    /// Start the server, returning its pid.
    fn start(&mut self) -> Result<u32>;

    /// Stop the server, returning the pids that were killed.
    fn kill(&mut self) -> Result<Vec<u32>>;
}

/// A server binary spawned as a child of this process.
#[derive(Debug)]
pub struct LocalServerProcess {
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    child: Option<Child>,
}

impl LocalServerProcess {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            child: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }
}

impl ProcessManager for LocalServerProcess {
    fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::info!(pid = child.id(), %status, "Game server exited");
                self.child = None;
                false
            }
            Err(e) => {
                tracing::warn!(pid = child.id(), error = %e, "Could not poll game server");
                false
            }
        }
    }

    fn start(&mut self) -> Result<u32> {
        if self.is_running() {
            return Err(Error::Process(format!(
                "{} is already running",
                self.program.display()
            )));
        }
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        let child = command.spawn().map_err(|e| {
            Error::Process(format!("failed to start {}: {}", self.program.display(), e))
        })?;
        let pid = child.id();
        tracing::info!(pid, program = %self.program.display(), "Game server started");
        self.child = Some(child);
        Ok(pid)
    }

    fn kill(&mut self) -> Result<Vec<u32>> {
        let Some(mut child) = self.child.take() else {
            return Ok(Vec::new());
        };
        let pid = child.id();
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(Vec::new());
        }
        child
            .kill()
            .map_err(|e| Error::Process(format!("failed to kill {}: {}", pid, e)))?;
        child.wait()?;
        tracing::info!(pid, "Game server killed");
        Ok(vec![pid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_and_kill_child() {
        let mut process = LocalServerProcess::new("sleep", vec!["30".to_string()]);
        assert!(!process.is_running());

        let pid = process.start().unwrap();
        assert!(process.is_running());
        assert_eq!(process.pid(), Some(pid));
        assert!(matches!(process.start(), Err(Error::Process(_))));

        assert_eq!(process.kill().unwrap(), vec![pid]);
        assert!(!process.is_running());
        assert!(process.kill().unwrap().is_empty());
    }

    #[test]
    fn test_missing_binary_is_process_error() {
        let mut process = LocalServerProcess::new("/nonexistent/aptrack-server", Vec::new());
        assert!(matches!(process.start(), Err(Error::Process(_))));
        assert!(!process.is_running());
    }

    #[test]
    fn test_exited_child_is_not_running() {
        let mut process = LocalServerProcess::new("true", Vec::new());
        process.start().unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while process.is_running() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(!process.is_running());
        assert!(process.kill().unwrap().is_empty());
    }
}
