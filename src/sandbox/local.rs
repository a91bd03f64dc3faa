//! Runs servers as local child processes.
//!
//! There is no isolation beyond a separate process: this provider exists for
//! development against servers you trust, and as the reference for what a
//! remote provider has to deliver.

use super::{SandboxHandle, SandboxProcess, SandboxProvider};
use crate::error::{McpError, Result};
use crate::models::ServerConfig;
use crate::network_adapter::NdjsonAdapter;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Upper bound for a single install command.
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// How much of a failed install command's stderr ends up in the error.
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Clone)]
pub struct LocalSandboxProvider {
    shell: String,
    working_dir: Option<PathBuf>,
    install_timeout: Duration,
}

impl Default for LocalSandboxProvider {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            working_dir: None,
            install_timeout: INSTALL_TIMEOUT,
        }
    }
}

impl LocalSandboxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shell used as `<shell> -c <command>`.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_install_timeout(mut self, timeout: Duration) -> Self {
        self.install_timeout = timeout;
        self
    }

    fn command(&self, line: &str, config: &ServerConfig) -> Command {
        let mut command = Command::new(&self.shell);
        command.arg("-c").arg(line).envs(&config.env).kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }

    async fn run_install(&self, line: &str, config: &ServerConfig) -> Result<()> {
        debug!(server = %config.name, command = line, "Running install command");
        let mut command = self.command(line, config);
        command.stdin(Stdio::null());

        let output = tokio::time::timeout(self.install_timeout, command.output())
            .await
            .map_err(|_| {
                McpError::Sandbox(format!(
                    "install command '{line}' timed out after {:?}",
                    self.install_timeout
                ))
            })?
            .map_err(|e| McpError::Sandbox(format!("failed to run '{line}': {e}")))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail_start = stderr
            .char_indices()
            .rev()
            .nth(STDERR_TAIL)
            .map_or(0, |(i, _)| i);
        Err(McpError::Sandbox(format!(
            "install command '{line}' failed with {}: {}",
            output.status,
            stderr[tail_start..].trim()
        )))
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    #[instrument(skip(self, config), fields(server = %config.name))]
    async fn launch(&self, config: &ServerConfig) -> Result<SandboxProcess> {
        for line in &config.install_commands {
            self.run_install(line, config).await?;
        }

        let mut command = self.command(&config.command, config);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so terminate reaches whatever the shell starts.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            McpError::Sandbox(format!(
                "failed to spawn '{}' with {}: {e}",
                config.command, self.shell
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Sandbox("failed to capture server stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Sandbox("failed to capture server stdout".into()))?;

        let id = format!("local-{}", Uuid::new_v4().simple());
        let stderr_task = child.stderr.take().map(|stderr| {
            let sandbox = id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(sandbox = %sandbox, "stderr: {line}");
                }
            })
        });

        let process_group = child.id();
        info!(sandbox = %id, pid = ?process_group, "Started local MCP server");
        Ok(SandboxProcess {
            adapter: Box::new(NdjsonAdapter::new(stdout, stdin)),
            handle: Box::new(LocalSandboxHandle {
                id,
                child,
                process_group,
                stderr_task,
            }),
        })
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

struct LocalSandboxHandle {
    id: String,
    child: Child,
    /// Group id of the server; equal to the shell's pid. `None` once signalled.
    #[cfg_attr(not(unix), allow(dead_code))]
    process_group: Option<u32>,
    stderr_task: Option<JoinHandle<()>>,
}

impl LocalSandboxHandle {
    /// Kills every process left in the server's group.
    #[cfg(unix)]
    fn kill_process_group(&mut self) {
        let Some(pgid) = self.process_group.take() else {
            return;
        };
        match signal::killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(sandbox = %self.id, error = %e, "Failed to signal process group"),
        }
    }

    #[cfg(not(unix))]
    fn kill_process_group(&mut self) {}
}

impl Drop for LocalSandboxHandle {
    fn drop(&mut self) {
        self.kill_process_group();
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl SandboxHandle for LocalSandboxHandle {
    fn id(&self) -> &str {
        &self.id
    }

    async fn terminate(&mut self) -> Result<()> {
        self.kill_process_group();
        if self.child.try_wait()?.is_none() {
            if let Err(e) = self.child.start_kill() {
                warn!(sandbox = %self.id, error = %e, "Failed to signal server process");
            }
            let status = self.child.wait().await?;
            debug!(sandbox = %self.id, %status, "Server process exited");
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        Ok(())
    }
}
