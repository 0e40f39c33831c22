//! Artifact resolution: decide where the model comes from and whether it
//! still needs conversion.
//!
//! Resolution is safe to re-run. A previously prepared artifact is found by its
//! deterministic name before anything touches the network, a complete raw
//! snapshot is never downloaded twice, and an interrupted download is discarded
//! and restarted.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::model::artifact::{
    has_native_extension, is_nonempty_file, ArtifactError, ModelLayout, PreparedArtifact,
};
use crate::model::sources::{HubClient, ObjectStoreClient, ObjectUri, SourceError};
use crate::model::spec::{ModelSource, ModelSpec};

#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("Unresolvable model source: {0}")]
    UnresolvableSource(String),

    #[error("Explicit model file {filename} not found: {reason}")]
    ExplicitFileNotFound { filename: String, reason: String },

    #[error("Explicit model file must be a relative .gguf path: {0}")]
    NotNativeFormat(String),

    #[error("Ambiguous model source, set an explicit filename to one of: {}", .0.join(", "))]
    AmbiguousArtifacts(Vec<String>),

    #[error("No objects found under {0}")]
    EmptySource(String),

    #[error("No usable model in {0}: expected a GGUF file, config.json or *.safetensors")]
    NoUsableModel(PathBuf),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Raw model files that must be converted before serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawModel {
    pub dir: PathBuf,
}

/// Outcome of resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Serve this file as is.
    Ready(PreparedArtifact),
    /// Run the converter (and quantizer) over these raw files first.
    NeedsConversion(RawModel),
}

/// Resolves a [`ModelSpec`] against the persistent models directory and the
/// remote sources.
pub struct ArtifactResolver {
    models_dir: PathBuf,
    hub: Arc<dyn HubClient>,
    object_store: Arc<dyn ObjectStoreClient>,
}

impl ArtifactResolver {
    pub fn new(
        models_dir: PathBuf,
        hub: Arc<dyn HubClient>,
        object_store: Arc<dyn ObjectStoreClient>,
    ) -> Self {
        Self {
            models_dir,
            hub,
            object_store,
        }
    }

    pub fn layout(&self, spec: &ModelSpec) -> ModelLayout {
        ModelLayout::new(&self.models_dir, spec)
    }

    /// Produce a ready artifact or the raw files to convert.
    pub async fn resolve(&self, spec: &ModelSpec) -> Result<Resolution, ResolutionError> {
        if spec.identifier.trim().is_empty() {
            return Err(ResolutionError::UnresolvableSource(
                "empty model identifier".to_string(),
            ));
        }

        let layout = self.layout(spec);

        if let Some(filename) = &spec.explicit_filename {
            let artifact = self.resolve_explicit(spec, &layout, filename).await?;
            return Ok(Resolution::Ready(artifact));
        }

        let target = layout.target_path();
        if is_nonempty_file(&target) {
            info!(
                path = %target.display(),
                quantization = %spec.quantization,
                "Found previously prepared artifact"
            );
            return Ok(Resolution::Ready(PreparedArtifact::from_path(&target)?));
        }

        match spec.source {
            ModelSource::ObjectStoreUri => self.resolve_object_store(spec, &layout).await,
            ModelSource::HubRepository => self.resolve_hub(spec, &layout).await,
            ModelSource::LocalPath => resolve_local(spec),
        }
    }

    async fn resolve_explicit(
        &self,
        spec: &ModelSpec,
        layout: &ModelLayout,
        filename: &str,
    ) -> Result<PreparedArtifact, ResolutionError> {
        let relative = Path::new(filename);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || !has_native_extension(relative) {
            return Err(ResolutionError::NotNativeFormat(filename.to_string()));
        }

        let mut candidates = vec![
            layout.model_dir().join(relative),
            layout.source_dir().join(relative),
        ];
        if spec.source == ModelSource::LocalPath {
            candidates.push(local_path(&spec.identifier).join(relative));
        }

        if let Some(found) = candidates.iter().find(|p| is_nonempty_file(p)) {
            info!(path = %found.display(), "Using explicit model file");
            return Ok(PreparedArtifact::from_path(found)?);
        }

        let dest = layout.model_dir().join(relative);
        let not_found = |reason: String| ResolutionError::ExplicitFileNotFound {
            filename: filename.to_string(),
            reason,
        };

        match spec.source {
            ModelSource::HubRepository => {
                self.hub
                    .fetch_file(&spec.identifier, spec.auth_token.as_deref(), filename, &dest)
                    .await
                    .map_err(|e| not_found(e.to_string()))?;
            }
            ModelSource::ObjectStoreUri => {
                let uri = ObjectUri::parse(&spec.identifier)?;
                let key = uri.child_key(filename);
                self.object_store
                    .download(&uri, &key, &dest)
                    .await
                    .map_err(|e| not_found(e.to_string()))?;
            }
            ModelSource::LocalPath => {
                return Err(not_found(format!(
                    "not present under {}",
                    local_path(&spec.identifier).display()
                )));
            }
        }

        Ok(PreparedArtifact::from_path(&dest)?)
    }

    async fn resolve_object_store(
        &self,
        spec: &ModelSpec,
        layout: &ModelLayout,
    ) -> Result<Resolution, ResolutionError> {
        let uri = ObjectUri::parse(&spec.identifier)?;
        let objects = self.object_store.list(&uri).await?;
        if objects.is_empty() {
            return Err(ResolutionError::EmptySource(uri.to_string()));
        }

        let native: Vec<_> = objects
            .iter()
            .filter(|o| has_native_extension(Path::new(&o.key)))
            .collect();

        match native.as_slice() {
            [single] => {
                let name = uri.relative_key(&single.key);
                let name = name.rsplit('/').next().unwrap_or(name);
                let dest = layout.model_dir().join(name);
                if is_nonempty_file(&dest) {
                    debug!(path = %dest.display(), "GGUF object already downloaded");
                } else {
                    info!(key = single.key, size = single.size, "Downloading GGUF object");
                    self.object_store.download(&uri, &single.key, &dest).await?;
                }
                Ok(Resolution::Ready(PreparedArtifact::from_path(&dest)?))
            }
            [] => {
                let source = layout.source_dir();
                if source.is_dir() {
                    info!(dir = %source.display(), "Raw model already downloaded");
                } else {
                    let partial = begin_partial(layout).await?;
                    info!(uri = %uri, objects = objects.len(), "Downloading raw model");
                    for object in &objects {
                        let dest = partial.join(uri.relative_key(&object.key));
                        self.object_store.download(&uri, &object.key, &dest).await?;
                    }
                    commit_partial(layout).await?;
                }
                raw_model(source)
            }
            many => Err(ResolutionError::AmbiguousArtifacts(
                many.iter()
                    .map(|o| uri.relative_key(&o.key).to_string())
                    .collect(),
            )),
        }
    }

    async fn resolve_hub(
        &self,
        spec: &ModelSpec,
        layout: &ModelLayout,
    ) -> Result<Resolution, ResolutionError> {
        let source = layout.source_dir();
        if source.is_dir() {
            info!(dir = %source.display(), "Hub snapshot already downloaded");
        } else {
            let partial = begin_partial(layout).await?;
            let files = self
                .hub
                .snapshot(&spec.identifier, spec.auth_token.as_deref(), &partial)
                .await?;
            info!(repo_id = spec.identifier, files = files.len(), "Hub snapshot complete");
            commit_partial(layout).await?;
        }

        classify_directory(&source)
    }
}

fn local_path(identifier: &str) -> PathBuf {
    PathBuf::from(identifier.strip_prefix("file://").unwrap_or(identifier))
}

fn resolve_local(spec: &ModelSpec) -> Result<Resolution, ResolutionError> {
    let path = local_path(&spec.identifier);
    if path.is_file() {
        if !has_native_extension(&path) {
            return Err(ResolutionError::UnresolvableSource(format!(
                "{} is neither a GGUF file nor a model directory",
                path.display()
            )));
        }
        return Ok(Resolution::Ready(PreparedArtifact::from_path(&path)?));
    }
    if path.is_dir() {
        return classify_directory(&path);
    }
    Err(ResolutionError::UnresolvableSource(format!(
        "{} does not exist",
        path.display()
    )))
}

/// Serve the single GGUF file in `dir`, or convert `dir` as a raw repository.
fn classify_directory(dir: &Path) -> Result<Resolution, ResolutionError> {
    let native = find_native_files(dir)?;
    match native.as_slice() {
        [single] => Ok(Resolution::Ready(PreparedArtifact::from_path(single)?)),
        [] => raw_model(dir.to_path_buf()),
        many => Err(ResolutionError::AmbiguousArtifacts(
            many.iter()
                .map(|p| p.strip_prefix(dir).unwrap_or(p).display().to_string())
                .collect(),
        )),
    }
}

fn raw_model(dir: PathBuf) -> Result<Resolution, ResolutionError> {
    if looks_like_raw_repository(&dir) {
        Ok(Resolution::NeedsConversion(RawModel { dir }))
    } else {
        Err(ResolutionError::NoUsableModel(dir))
    }
}

/// A raw repository has a `config.json` or at least one `*.safetensors` file.
pub fn looks_like_raw_repository(dir: &Path) -> bool {
    if dir.join("config.json").is_file() {
        return true;
    }
    std::fs::read_dir(dir)
        .map(|entries| {
            entries.filter_map(|e| e.ok()).any(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "safetensors")
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// All `.gguf` files under `dir`, sorted, skipping hidden directories.
pub fn find_native_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if !hidden {
                    pending.push(path);
                }
            } else if has_native_extension(&path) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Start a fresh download directory, discarding leftovers of an interrupted run.
async fn begin_partial(layout: &ModelLayout) -> Result<PathBuf, ResolutionError> {
    let partial = layout.partial_dir();
    if fs::try_exists(&partial).await? {
        warn!(dir = %partial.display(), "Removing incomplete download");
        fs::remove_dir_all(&partial).await?;
    }
    fs::create_dir_all(&partial).await?;
    Ok(partial)
}

async fn commit_partial(layout: &ModelLayout) -> Result<(), ResolutionError> {
    fs::rename(layout.partial_dir(), layout.source_dir()).await?;
    Ok(())
}
