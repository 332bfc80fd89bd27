//! Execution of the external check routine.
//!
//! Every check spawns exactly one child process. The domain travels in the
//! `v_v_domain` environment variable and the program is executed directly,
//! so shell metacharacters in a domain are never interpreted. On unix the
//! child leads its own process group. The whole group is killed when the
//! check outlives its time budget or the surrounding future is cancelled, so
//! helpers started by a check script do not outlive it.

use std::{future::Future, path::PathBuf, process::Stdio, time::Duration};

use serde_json::Value;
use thiserror::Error;
use tokio::{io::AsyncReadExt, process::Command};
use tracing::{debug, instrument, warn};

/// Environment variable through which the domain reaches the check routine.
pub const DOMAIN_ENV_VAR: &str = "v_v_domain";

/// Ways a check can fail to produce a result.
#[derive(Error, Debug)]
pub enum CheckError {
    /// The routine ran past its time budget and was killed.
    #[error("Check timed out after {}", display_duration(.0))]
    Timeout(Duration),

    /// The routine exited unsuccessfully.
    #[error("Check failed")]
    Failed { stderr: String, code: Option<i32> },

    /// The routine exited successfully but did not print valid JSON.
    #[error("Invalid response from checker")]
    MalformedOutput { output: String },

    /// The routine could not be started or its pipes could not be read.
    #[error("Failed to run checker: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CheckError::Timeout(_) => "timeout",
            CheckError::Failed { .. } => "failed",
            CheckError::MalformedOutput { .. } => "malformed",
            CheckError::Io(_) => "spawn_error",
        }
    }
}

fn display_duration(duration: &Duration) -> String {
    match (duration.as_secs(), duration.subsec_nanos()) {
        (1, 0) => "1 second".to_string(),
        (secs, 0) => format!("{secs} seconds"),
        _ => format!("{:.1} seconds", duration.as_secs_f64()),
    }
}

/// Something that can run a health check for a domain.
pub trait CheckRunner: Send + Sync + 'static {
    fn run(&self, domain: &str) -> impl Future<Output = Result<Value, CheckError>> + Send;
}

/// Runs the check routine as a child process.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    /// Fixed arguments passed on every invocation.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[instrument(skip(self), fields(program = %self.program.display()))]
    async fn execute(&self, domain: &str) -> Result<Value, CheckError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(DOMAIN_ENV_VAR, domain)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        // Declared after `child` so the group is signalled before the child is dropped.
        let mut group = ProcessGroup::led_by(child.id());

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let finished = tokio::time::timeout(self.timeout, async {
            let (status, _, _) = tokio::try_join!(
                child.wait(),
                drain(stdout_pipe.as_mut(), &mut stdout),
                drain(stderr_pipe.as_mut(), &mut stderr),
            )?;
            Ok::<_, std::io::Error>(status)
        })
        .await;

        let status = match finished {
            Ok(status) => status?,
            Err(_) => {
                warn!(timeout = ?self.timeout, "Check exceeded its time budget, killing");
                group.kill();
                // kill() also reaps the child.
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed out check: {}", e);
                }
                return Err(CheckError::Timeout(self.timeout));
            }
        };

        group.kill();

        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        if !status.success() {
            debug!(code = ?status.code(), "Check exited unsuccessfully");
            return Err(CheckError::Failed {
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                code: status.code(),
            });
        }

        serde_json::from_str(&stdout).map_err(|_| CheckError::MalformedOutput { output: stdout })
    }
}

/// Process group of a running check, killed at the latest when dropped.
struct ProcessGroup {
    leader: Option<u32>,
}

impl ProcessGroup {
    fn led_by(pid: Option<u32>) -> Self {
        Self { leader: pid }
    }

    /// Sends SIGKILL to every process left in the group.
    fn kill(&mut self) {
        let Some(leader) = self.leader.take() else {
            return;
        };

        #[cfg(unix)]
        {
            use nix::{
                errno::Errno,
                sys::signal::{killpg, Signal},
                unistd::Pid,
            };

            let Ok(pgid) = i32::try_from(leader) else {
                return;
            };
            match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(pgid, "Failed to kill check process group: {}", e),
            }
        }

        #[cfg(not(unix))]
        let _ = leader;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn drain<R>(pipe: Option<&mut R>, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match pipe {
        Some(pipe) => pipe.read_to_end(buf).await,
        None => Ok(0),
    }
}

impl CheckRunner for ProcessRunner {
    fn run(&self, domain: &str) -> impl Future<Output = Result<Value, CheckError>> + Send {
        self.execute(domain)
    }
}
