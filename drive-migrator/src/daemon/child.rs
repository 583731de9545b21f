//! The supervised transfer process.

use crate::utils::{MigratorError, Result};
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::info;

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    /// `None` when the process was ended by a signal
    pub code: Option<i32>,
}

impl ChildExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ChildExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self { code: status.code() }
    }
}

/// A running child the watchdog can observe and stop
#[async_trait]
pub trait SupervisedChild: Send {
    fn id(&self) -> Option<u32>;

    /// Exit status if the child has already exited
    fn try_wait(&mut self) -> Result<Option<ChildExit>>;

    /// Ask the child to stop (SIGTERM)
    fn terminate(&mut self) -> Result<()>;

    /// Force the child to stop (SIGKILL)
    async fn kill(&mut self) -> Result<()>;

    async fn wait(&mut self) -> Result<ChildExit>;
}

/// Starts a fresh child for every run
pub trait ChildLauncher: Send + Sync {
    fn launch(&self) -> Result<Box<dyn SupervisedChild>>;
}

/// Re-invokes this binary as `transfer`, appending its output to log files
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    stdout_log: PathBuf,
    stderr_log: PathBuf,
}

impl ProcessLauncher {
    pub fn new(
        program: impl Into<PathBuf>,
        args: Vec<String>,
        stdout_log: impl Into<PathBuf>,
        stderr_log: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            stdout_log: stdout_log.into(),
            stderr_log: stderr_log.into(),
        }
    }

    /// `<current exe> [-c <config>] transfer`
    pub fn transfer_command(
        config_path: Option<&Path>,
        stdout_log: &Path,
        stderr_log: &Path,
    ) -> Result<Self> {
        let program = std::env::current_exe()?;
        let mut args = Vec::new();
        if let Some(path) = config_path {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        args.push("transfer".to_string());
        Ok(Self::new(program, args, stdout_log, stderr_log))
    }

    fn append_log(path: &Path) -> Result<std::fs::File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }
}

impl ChildLauncher for ProcessLauncher {
    fn launch(&self) -> Result<Box<dyn SupervisedChild>> {
        let stdout = Self::append_log(&self.stdout_log)?;
        let stderr = Self::append_log(&self.stderr_log)?;

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                MigratorError::Process(format!("failed to start {}: {}", self.program.display(), e))
            })?;

        info!(
            "Started {} {} (pid {})",
            self.program.display(),
            self.args.join(" "),
            child.id().map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
        );
        Ok(Box::new(ProcessChild { child }))
    }
}

/// OS process handle
pub struct ProcessChild {
    child: Child,
}

#[async_trait]
impl SupervisedChild for ProcessChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> Result<Option<ChildExit>> {
        Ok(self.child.try_wait()?.map(ChildExit::from))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .map_err(|e| MigratorError::Process(format!("SIGTERM to pid {} failed: {}", pid, e)))
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<()> {
        self.child.start_kill()?;
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }

    async fn wait(&mut self) -> Result<ChildExit> {
        Ok(self.child.wait().await?.into())
    }
}
