//! The inference engine child process.
//!
//! [`EngineProcess`] is the capability the supervisor drives; the production
//! implementation [`LlamaServerProcess`] runs `llama-server` bound to the
//! internal interface only.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::model::artifact::PreparedArtifact;

/// How a finished engine process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineExit {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
}

impl std::fmt::Display for EngineExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "terminated by signal"),
        }
    }
}

impl From<std::process::ExitStatus> for EngineExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// A single engine process lifecycle.
#[async_trait]
pub trait EngineProcess: Send + Sync {
    /// Launch the engine serving `artifact`.
    async fn start(&mut self, artifact: &PreparedArtifact) -> std::io::Result<()>;

    /// OS process id, once started.
    fn pid(&self) -> Option<u32>;

    /// One liveness probe. Never blocks longer than a probe timeout.
    async fn is_healthy(&self) -> bool;

    /// Non-blocking exit check.
    fn try_exit(&mut self) -> std::io::Result<Option<EngineExit>>;

    /// Wait for the process to exit. Must be cancel-safe.
    async fn wait_exit(&mut self) -> std::io::Result<EngineExit>;

    /// Ask the process to terminate, forcing it after the grace period.
    async fn stop(&mut self) -> std::io::Result<EngineExit>;
}

/// `llama-server` launched as a child process.
pub struct LlamaServerProcess {
    config: EngineConfig,
    http: reqwest::Client,
    child: Option<Child>,
}

impl LlamaServerProcess {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            child: None,
        }
    }

    fn command(&self, artifact: &PreparedArtifact) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("--host")
            .arg(&self.config.host)
            .arg("--port")
            .arg(self.config.port.to_string())
            .arg("--model")
            .arg(&artifact.local_path)
            .args(&self.config.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn child_mut(&mut self) -> std::io::Result<&mut Child> {
        self.child.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "engine process not started")
        })
    }
}

#[async_trait]
impl EngineProcess for LlamaServerProcess {
    async fn start(&mut self, artifact: &PreparedArtifact) -> std::io::Result<()> {
        let mut child = self.command(artifact).spawn()?;

        info!(
            binary = %self.config.binary.display(),
            pid = child.id(),
            host = self.config.host,
            port = self.config.port,
            model = %artifact.local_path.display(),
            extra_args = ?self.config.extra_args,
            "Engine process launched"
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }

        self.child = Some(child);
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    async fn is_healthy(&self) -> bool {
        let probe_timeout = self.config.health_poll_interval().max(Duration::from_secs(1));
        match self
            .http
            .get(self.config.health_url())
            .timeout(probe_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Engine health probe failed: {e}");
                false
            }
        }
    }

    fn try_exit(&mut self) -> std::io::Result<Option<EngineExit>> {
        Ok(self.child_mut()?.try_wait()?.map(EngineExit::from))
    }

    async fn wait_exit(&mut self) -> std::io::Result<EngineExit> {
        Ok(self.child_mut()?.wait().await?.into())
    }

    async fn stop(&mut self) -> std::io::Result<EngineExit> {
        let grace = self.config.shutdown_grace();
        let child = self.child_mut()?;

        // `id()` is None once the child has been reaped.
        if let Some(pid) = child.id() {
            info!(pid, "Sending SIGTERM to engine");
            signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)?;
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => Ok(status?.into()),
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "Engine ignored SIGTERM, killing");
                child.kill().await?;
                Ok(child.wait().await?.into())
            }
        }
    }
}

/// Re-emit child output line by line under the `engine` target.
async fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                info!(target: "engine", stream, "{}", line.trim_end());
            }
            Err(e) => {
                warn!(stream, "Failed to read engine output: {e}");
                break;
            }
        }
    }
}
