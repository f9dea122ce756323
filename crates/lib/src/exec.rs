//! Process executor: run the configured binary with the configured arguments.
//! No shell is used; arguments are passed as a list and the prompt goes in on stdin.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::config::TaskConfig;
use crate::task::{RunningTask, TaskCompletion, TaskError, TaskExecutor};

/// Spawns one child process per prompt.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    command: String,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl ProcessExecutor {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            working_directory: None,
            env: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &TaskConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            working_directory: config.working_directory.clone(),
            env: config.env.clone(),
        }
    }
}

#[async_trait]
impl TaskExecutor for ProcessExecutor {
    async fn start(&self, prompt: &str) -> Result<Box<dyn RunningTask>, TaskError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_directory {
            cmd.current_dir(dir);
        }
        // Own process group, so terminate reaches anything the task spawned.
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd.spawn().map_err(TaskError::Spawn)?;
        log::debug!(
            "exec: started {} (pid {:?}), prompt {} bytes",
            self.command,
            child.id(),
            prompt.len()
        );

        // Written from a separate task so a child that never reads stdin cannot stall us.
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    log::debug!("exec: writing prompt to stdin failed: {}", e);
                }
                let _ = stdin.shutdown().await;
            });
        }

        let pgid = child.id().and_then(|pid| i32::try_from(pid).ok());
        Ok(Box::new(ChildTask { child, pgid }))
    }
}

/// Grace period between SIGTERM and SIGKILL for the task's process group.
#[cfg(unix)]
const KILL_GRACE: std::time::Duration = std::time::Duration::from_millis(500);

struct ChildTask {
    child: Child,
    /// Process group id; equal to the child's pid since it leads its own group.
    pgid: Option<i32>,
}

impl ChildTask {
    #[cfg(unix)]
    fn signal_group(&self) -> bool {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pgid) = self.pgid else {
            return false;
        };
        let group = Pid::from_raw(pgid);
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            log::debug!("exec: SIGTERM to process group {} failed: {}", pgid, e);
            return false;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(KILL_GRACE).await;
                    // ESRCH here just means the group is already gone.
                    let _ = killpg(group, Signal::SIGKILL);
                });
            }
            Err(_) => {
                let _ = killpg(group, Signal::SIGKILL);
            }
        }
        true
    }

    #[cfg(not(unix))]
    fn signal_group(&self) -> bool {
        false
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[async_trait]
impl RunningTask for ChildTask {
    async fn wait(&mut self) -> Result<TaskCompletion, TaskError> {
        let stdout = self.child.stdout.take();
        let stderr = self.child.stderr.take();
        let (status, stdout, stderr) =
            tokio::try_join!(self.child.wait(), read_pipe(stdout), read_pipe(stderr))?;
        Ok(TaskCompletion {
            succeeded: status.success(),
            exit_reason: status.to_string(),
            stdout,
            stderr,
        })
    }

    fn terminate(&mut self) {
        if self.signal_group() {
            return;
        }
        if let Err(e) = self.child.start_kill() {
            log::debug!("exec: kill failed: {}", e);
        }
    }
}
