//! Boot sequence tests: idempotent preparation and fatal failures.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use llama_adapter::bootstrap::{BootstrapCoordinator, BootstrapError, BootstrapPhase, ReadinessFlag};
use llama_adapter::config::{EngineConfig, ToolsConfig};
use llama_adapter::engine::process::{EngineExit, EngineProcess};
use llama_adapter::engine::supervisor::{EngineStartupError, EngineState, EngineSupervisor};
use llama_adapter::model::artifact::PreparedArtifact;
use llama_adapter::model::converter::{
    ConverterRunner, PreparationError, ToolInvocation, ToolOutput, ToolRunner,
};
use llama_adapter::model::resolver::{ArtifactResolver, ResolutionError};
use llama_adapter::model::sources::{
    HubClient, ObjectEntry, ObjectStoreClient, ObjectUri, SourceError,
};
use llama_adapter::model::spec::{ModelSource, ModelSpec, QuantizationLevel};

// ─── Fakes ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeHub {
    files: BTreeMap<String, Vec<u8>>,
    snapshots: AtomicUsize,
}

impl FakeHub {
    fn with_files(files: &[(&str, &[u8])]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl HubClient for FakeHub {
    async fn snapshot(
        &self,
        _repo_id: &str,
        _token: Option<&str>,
        dest: &Path,
    ) -> Result<Vec<PathBuf>, SourceError> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        for (name, data) in &self.files {
            std::fs::write(dest.join(name), data)?;
        }
        Ok(self.files.keys().map(PathBuf::from).collect())
    }

    async fn fetch_file(
        &self,
        _repo_id: &str,
        _token: Option<&str>,
        filename: &str,
        _dest: &Path,
    ) -> Result<(), SourceError> {
        Err(SourceError::Hub(format!("404 {filename}")))
    }
}

struct NoObjectStore;

#[async_trait]
impl ObjectStoreClient for NoObjectStore {
    async fn list(&self, _uri: &ObjectUri) -> Result<Vec<ObjectEntry>, SourceError> {
        Ok(Vec::new())
    }

    async fn download(&self, _uri: &ObjectUri, key: &str, _dest: &Path) -> Result<(), SourceError> {
        Err(SourceError::ObjectStore(format!("NoSuchKey {key}")))
    }
}

/// Writes the output file each tool would produce, or fails with `exit_code`.
#[derive(Default)]
struct CountingTools {
    calls: AtomicUsize,
    exit_code: Option<i32>,
}

#[async_trait]
impl ToolRunner for CountingTools {
    async fn run(&self, invocation: &ToolInvocation) -> std::io::Result<ToolOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = self.exit_code {
            return Ok(ToolOutput {
                code: Some(code),
                output: "Traceback: unsupported architecture".to_string(),
            });
        }
        let args = &invocation.args;
        let out = match args.iter().position(|a| a == "--outfile") {
            Some(i) => &args[i + 1],
            None => &args[1],
        };
        std::fs::write(out, b"GGUF")?;
        Ok(ToolOutput {
            code: Some(0),
            output: String::new(),
        })
    }
}

#[derive(Default)]
struct EngineCounters {
    starts: AtomicUsize,
}

struct FakeEngine {
    counters: Arc<EngineCounters>,
    exits_early: bool,
}

#[async_trait]
impl EngineProcess for FakeEngine {
    async fn start(&mut self, artifact: &PreparedArtifact) -> std::io::Result<()> {
        assert!(artifact.local_path.is_file());
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        Some(1)
    }

    async fn is_healthy(&self) -> bool {
        !self.exits_early
    }

    fn try_exit(&mut self) -> std::io::Result<Option<EngineExit>> {
        Ok(self.exits_early.then_some(EngineExit { code: Some(1) }))
    }

    async fn wait_exit(&mut self) -> std::io::Result<EngineExit> {
        std::future::pending().await
    }

    async fn stop(&mut self) -> std::io::Result<EngineExit> {
        Ok(EngineExit { code: None })
    }
}

struct Setup {
    hub: Arc<FakeHub>,
    tools: Arc<CountingTools>,
    engine: Arc<EngineCounters>,
    exits_early: bool,
}

impl Setup {
    fn new(hub: FakeHub, tools: CountingTools) -> Self {
        Self {
            hub: Arc::new(hub),
            tools: Arc::new(tools),
            engine: Arc::default(),
            exits_early: false,
        }
    }

    fn coordinator(&self, models_dir: &Path, spec: ModelSpec) -> (BootstrapCoordinator, ReadinessFlag) {
        let resolver = ArtifactResolver::new(
            models_dir.to_path_buf(),
            self.hub.clone(),
            Arc::new(NoObjectStore),
        );
        let converter = ConverterRunner::new(
            models_dir.to_path_buf(),
            ToolsConfig::default(),
            self.tools.clone(),
        );
        let supervisor = EngineSupervisor::new(
            Box::new(FakeEngine {
                counters: self.engine.clone(),
                exits_early: self.exits_early,
            }),
            EngineConfig {
                health_poll_interval_ms: 1,
                ..Default::default()
            },
        );
        let readiness = ReadinessFlag::new();
        let coordinator =
            BootstrapCoordinator::new(spec, resolver, converter, supervisor, readiness.clone());
        (coordinator, readiness)
    }
}

fn raw_repo() -> FakeHub {
    FakeHub::with_files(&[("config.json", b"{}"), ("model.safetensors", b"weights")])
}

fn spec() -> ModelSpec {
    ModelSpec::new(ModelSource::HubRepository, "org/model")
        .with_quantization(QuantizationLevel::Q4_K_M)
}

// ─── Tests ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_second_boot_reuses_prepared_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let setup = Setup::new(raw_repo(), CountingTools::default());

    let (coordinator, readiness) = setup.coordinator(dir.path(), spec());
    let running = coordinator.run().await.unwrap();
    assert!(readiness.is_set());
    assert_eq!(running.handle().state(), EngineState::Healthy);
    running.shutdown().await;

    assert_eq!(setup.tools.calls.load(Ordering::SeqCst), 2);
    assert!(dir.path().join("org--model/org--model-f16.Q4_K_M.gguf").is_file());

    let (coordinator, readiness) = setup.coordinator(dir.path(), spec());
    let mut phases = coordinator.phases();
    coordinator.run().await.unwrap().shutdown().await;
    assert!(readiness.is_set());
    assert_eq!(*phases.borrow_and_update(), BootstrapPhase::Ready);

    // No download and no tool run the second time.
    assert_eq!(setup.hub.snapshots.load(Ordering::SeqCst), 1);
    assert_eq!(setup.tools.calls.load(Ordering::SeqCst), 2);
    assert_eq!(setup.engine.starts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_conversion_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let setup = Setup::new(
        raw_repo(),
        CountingTools {
            exit_code: Some(1),
            ..Default::default()
        },
    );

    let (coordinator, readiness) = setup.coordinator(dir.path(), spec());
    let phases = coordinator.phases();
    let err = coordinator.run().await.unwrap_err();

    assert!(matches!(
        err,
        BootstrapError::Preparation(PreparationError::ConversionFailed { .. })
    ));
    assert!(err.to_string().contains("unsupported architecture"));
    assert!(!readiness.is_set());
    assert_eq!(*phases.borrow(), BootstrapPhase::Failed);
    assert_eq!(setup.tools.calls.load(Ordering::SeqCst), 1);
    assert_eq!(setup.engine.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_ambiguous_snapshot_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let hub = FakeHub::with_files(&[("a.Q4_0.gguf", b"GGUF"), ("a.Q8_0.gguf", b"GGUF")]);
    let setup = Setup::new(hub, CountingTools::default());

    let (coordinator, readiness) = setup.coordinator(dir.path(), spec());
    let err = coordinator.run().await.unwrap_err();

    assert!(matches!(
        err,
        BootstrapError::Resolution(ResolutionError::AmbiguousArtifacts(_))
    ));
    assert!(!readiness.is_set());
    assert_eq!(setup.tools.calls.load(Ordering::SeqCst), 0);
    assert_eq!(setup.engine.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_engine_exit_during_startup_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let hub = FakeHub::with_files(&[("model.gguf", b"GGUF")]);
    let mut setup = Setup::new(hub, CountingTools::default());
    setup.exits_early = true;

    let (coordinator, readiness) = setup.coordinator(dir.path(), spec());
    let err = coordinator.run().await.unwrap_err();

    assert!(matches!(
        err,
        BootstrapError::Engine(EngineStartupError::ExitedEarly(_))
    ));
    assert!(!readiness.is_set());
    assert_eq!(setup.engine.starts.load(Ordering::SeqCst), 1);
}
