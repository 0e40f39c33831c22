//! Engine supervision: launch, wait for health, then watch for exit.
//!
//! The supervisor publishes [`EngineStatus`] over a `watch` channel. Request
//! handlers hold an [`EngineHandle`] (a receiver plus the internal address) and
//! can only observe the state. A crashed engine is never restarted.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::engine::process::{EngineExit, EngineProcess};
use crate::model::artifact::PreparedArtifact;

#[derive(Error, Debug)]
pub enum EngineStartupError {
    #[error("Failed to launch engine: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Engine exited before becoming healthy ({0})")]
    ExitedEarly(EngineExit),

    #[error("Engine did not become healthy within {0:?}")]
    HealthTimeout(Duration),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Lifecycle state of the engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Starting,
    Healthy,
    Crashed,
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Starting => write!(f, "starting"),
            EngineState::Healthy => write!(f, "healthy"),
            EngineState::Crashed => write!(f, "crashed"),
            EngineState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub process_id: Option<u32>,
}

/// Read-only view of the supervised engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    base_url: String,
    internal_port: u16,
    status: watch::Receiver<EngineStatus>,
}

impl EngineHandle {
    /// `http://host:port` of the engine's internal listener.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn internal_port(&self) -> u16 {
        self.internal_port
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> EngineState {
        self.status().state
    }

    pub fn process_id(&self) -> Option<u32> {
        self.status().process_id
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == EngineState::Healthy
    }

    /// Wait until the engine leaves `Healthy` (or never was). Returns the new state.
    pub async fn wait_until_unhealthy(&mut self) -> EngineState {
        match self
            .status
            .wait_for(|s| s.state != EngineState::Healthy)
            .await
        {
            Ok(status) => status.state,
            Err(_) => EngineState::Stopped,
        }
    }
}

/// Owns the engine process from launch until it becomes healthy.
pub struct EngineSupervisor {
    process: Box<dyn EngineProcess>,
    config: EngineConfig,
    status: watch::Sender<EngineStatus>,
}

impl EngineSupervisor {
    pub fn new(process: Box<dyn EngineProcess>, config: EngineConfig) -> Self {
        let (status, _) = watch::channel(EngineStatus {
            state: EngineState::Starting,
            process_id: None,
        });
        Self {
            process,
            config,
            status,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            base_url: self.config.base_url(),
            internal_port: self.config.port,
            status: self.status.subscribe(),
        }
    }

    fn publish(&self, state: EngineState) {
        let process_id = self.process.pid();
        self.status.send_replace(EngineStatus { state, process_id });
    }

    /// Launch the engine and block until it reports healthy.
    ///
    /// On success ownership of the process moves to a monitor task.
    pub async fn start(
        mut self,
        artifact: &PreparedArtifact,
    ) -> Result<RunningEngine, EngineStartupError> {
        if let Err(e) = self.process.start(artifact).await {
            self.publish(EngineState::Crashed);
            return Err(EngineStartupError::Spawn(e));
        }
        self.publish(EngineState::Starting);

        let timeout = self.config.health_timeout();
        let poll_interval = self.config.health_poll_interval();
        let deadline = Instant::now() + timeout;
        let started = Instant::now();

        info!(
            pid = self.process.pid(),
            timeout_secs = timeout.as_secs(),
            "Waiting for engine to become healthy"
        );

        loop {
            if let Some(exit) = self.process.try_exit()? {
                error!(%exit, "Engine exited during startup");
                self.publish(EngineState::Crashed);
                return Err(EngineStartupError::ExitedEarly(exit));
            }

            if self.process.is_healthy().await {
                break;
            }

            if Instant::now() >= deadline {
                warn!(timeout_secs = timeout.as_secs(), "Engine health timeout, stopping it");
                if let Err(e) = self.process.stop().await {
                    warn!("Failed to stop engine: {e}");
                }
                self.publish(EngineState::Stopped);
                return Err(EngineStartupError::HealthTimeout(timeout));
            }

            tokio::time::sleep(poll_interval).await;
        }

        self.publish(EngineState::Healthy);
        info!(
            pid = self.process.pid(),
            port = self.config.port,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Engine healthy"
        );

        let handle = self.handle();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(monitor(self.process, self.status, shutdown_rx));

        Ok(RunningEngine {
            handle,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// A healthy engine owned by its monitor task.
#[derive(Debug)]
pub struct RunningEngine {
    handle: EngineHandle,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RunningEngine {
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Stop the engine and wait for the monitor to finish.
    pub async fn shutdown(self) {
        // The monitor may already be gone if the engine crashed.
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            error!("Engine monitor task failed: {e}");
        }
    }
}

async fn monitor(
    mut process: Box<dyn EngineProcess>,
    status: watch::Sender<EngineStatus>,
    shutdown: oneshot::Receiver<()>,
) {
    let exited = tokio::select! {
        exit = process.wait_exit() => Some(exit),
        _ = shutdown => None,
    };

    let state = match exited {
        Some(Ok(exit)) => {
            error!(%exit, "Engine exited unexpectedly, not restarting");
            EngineState::Crashed
        }
        Some(Err(e)) => {
            error!("Lost track of engine process: {e}");
            EngineState::Crashed
        }
        None => {
            info!("Stopping engine");
            match process.stop().await {
                Ok(exit) => info!(%exit, "Engine stopped"),
                Err(e) => warn!("Failed to stop engine cleanly: {e}"),
            }
            EngineState::Stopped
        }
    };

    status.send_replace(EngineStatus {
        state,
        process_id: None,
    });
}
