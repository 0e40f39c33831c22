//! First-boot sequence: resolve, prepare, start the engine, flip readiness.
//!
//! The coordinator is consumed by [`BootstrapCoordinator::run`], so the
//! sequence runs at most once per process. Phases only move forward; any error
//! ends in [`BootstrapPhase::Failed`] and is fatal to the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::engine::supervisor::{EngineStartupError, EngineSupervisor, RunningEngine};
use crate::model::converter::{ConverterRunner, PreparationError};
use crate::model::resolver::{ArtifactResolver, Resolution, ResolutionError};
use crate::model::spec::ModelSpec;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Model resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Model preparation failed: {0}")]
    Preparation(#[from] PreparationError),

    #[error("Engine startup failed: {0}")]
    Engine(#[from] EngineStartupError),
}

/// Process-wide readiness. Starts unset and can be set exactly once.
#[derive(Debug, Clone, Default)]
pub struct ReadinessFlag(Arc<AtomicBool>);

impl ReadinessFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootstrapPhase {
    Resolving,
    Preparing,
    StartingEngine,
    Ready,
    Failed,
}

impl std::fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BootstrapPhase::Resolving => "resolving",
            BootstrapPhase::Preparing => "preparing",
            BootstrapPhase::StartingEngine => "starting_engine",
            BootstrapPhase::Ready => "ready",
            BootstrapPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Drives the boot sequence for one [`ModelSpec`].
pub struct BootstrapCoordinator {
    spec: ModelSpec,
    resolver: ArtifactResolver,
    converter: ConverterRunner,
    supervisor: EngineSupervisor,
    readiness: ReadinessFlag,
    phase: watch::Sender<BootstrapPhase>,
}

impl BootstrapCoordinator {
    pub fn new(
        spec: ModelSpec,
        resolver: ArtifactResolver,
        converter: ConverterRunner,
        supervisor: EngineSupervisor,
        readiness: ReadinessFlag,
    ) -> Self {
        let (phase, _) = watch::channel(BootstrapPhase::Resolving);
        Self {
            spec,
            resolver,
            converter,
            supervisor,
            readiness,
            phase,
        }
    }

    /// Observe phase transitions.
    pub fn phases(&self) -> watch::Receiver<BootstrapPhase> {
        self.phase.subscribe()
    }

    /// Run the sequence. On success the engine is healthy and readiness is set.
    pub async fn run(self) -> Result<RunningEngine, BootstrapError> {
        let Self {
            spec,
            resolver,
            converter,
            supervisor,
            readiness,
            phase,
        } = self;

        let started = Instant::now();
        info!(
            source = %spec.source,
            model = spec.identifier,
            quantization = %spec.quantization,
            explicit_filename = spec.explicit_filename.as_deref(),
            "Bootstrap started"
        );

        let outcome = async {
            enter(&phase, BootstrapPhase::Resolving);
            let artifact = match resolver.resolve(&spec).await? {
                Resolution::Ready(artifact) => artifact,
                Resolution::NeedsConversion(raw) => {
                    enter(&phase, BootstrapPhase::Preparing);
                    converter.prepare(&raw, &spec).await?
                }
            };

            enter(&phase, BootstrapPhase::StartingEngine);
            let engine = supervisor.start(&artifact).await?;
            Ok::<_, BootstrapError>((artifact, engine))
        }
        .await;

        match outcome {
            Ok((artifact, engine)) => {
                readiness.set();
                enter(&phase, BootstrapPhase::Ready);
                info!(
                    model = %artifact.local_path.display(),
                    size_bytes = artifact.size_bytes,
                    elapsed_secs = started.elapsed().as_secs(),
                    "Bootstrap complete, serving traffic"
                );
                Ok(engine)
            }
            Err(e) => {
                enter(&phase, BootstrapPhase::Failed);
                error!(elapsed_secs = started.elapsed().as_secs(), "Bootstrap failed: {e}");
                Err(e)
            }
        }
    }
}

fn enter(phase: &watch::Sender<BootstrapPhase>, next: BootstrapPhase) {
    let current = *phase.borrow();
    if next < current {
        warn!(%current, %next, "Ignoring backwards bootstrap transition");
        return;
    }
    if next != current {
        info!(phase = %next, "Bootstrap phase");
    }
    phase.send_replace(next);
}
