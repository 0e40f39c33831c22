//! Prepared GGUF artifacts and the on-disk naming contract.
//!
//! Every file the pipeline produces lives under a single models directory:
//!
//! ```text
//! <models_dir>/<slug>/source/                   raw downloaded files
//! <models_dir>/<slug>/<slug>-f16.gguf           converted F16 artifact
//! <models_dir>/<slug>/<slug>-f16.<LEVEL>.gguf   quantized variants
//! ```
//!
//! Later runs rely on these names to find an existing artifact without
//! re-downloading or re-converting anything.

use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::model::spec::{ModelSource, ModelSpec, QuantizationLevel};

/// File extension of the engine's native serialized tensor format.
pub const NATIVE_EXTENSION: &str = "gguf";

/// First four bytes of every GGUF file.
const GGUF_MAGIC: [u8; 4] = *b"GGUF";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Model file not found: {0}")]
    FileNotFound(String),

    #[error("Not a GGUF file: {0}")]
    InvalidFormat(String),

    #[error("Model file is empty: {0}")]
    Empty(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Serialized weight format of a prepared artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactFormat {
    Gguf,
}

/// A ready-to-serve weight file. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedArtifact {
    /// Absolute path to the weight file.
    pub local_path: PathBuf,

    pub format: ArtifactFormat,

    pub size_bytes: u64,
}

impl PreparedArtifact {
    /// Validate `path` and wrap it.
    ///
    /// The file must exist, carry the `.gguf` extension and start with the
    /// GGUF magic.
    pub fn from_path(path: &Path) -> Result<Self, ArtifactError> {
        if !path.is_file() {
            return Err(ArtifactError::FileNotFound(path.display().to_string()));
        }
        if !has_native_extension(path) {
            return Err(ArtifactError::InvalidFormat(path.display().to_string()));
        }

        let size_bytes = std::fs::metadata(path)?.len();
        if size_bytes == 0 {
            return Err(ArtifactError::Empty(path.display().to_string()));
        }

        let mut magic = [0u8; 4];
        let mut file = std::fs::File::open(path)?;
        if file.read_exact(&mut magic).is_err() || magic != GGUF_MAGIC {
            return Err(ArtifactError::InvalidFormat(path.display().to_string()));
        }

        let local_path = std::fs::canonicalize(path)?;

        info!(
            path = %local_path.display(),
            size_bytes,
            "Prepared artifact"
        );

        Ok(Self {
            local_path,
            format: ArtifactFormat::Gguf,
            size_bytes,
        })
    }

    pub fn file_name(&self) -> Option<&str> {
        self.local_path.file_name().and_then(|n| n.to_str())
    }
}

/// Whether `path` ends in `.gguf` (case-insensitive).
pub fn has_native_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(NATIVE_EXTENSION))
        .unwrap_or(false)
}

/// Whether `path` is a regular file with at least one byte in it.
pub fn is_nonempty_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Filesystem-safe directory name derived from a model source and identifier.
///
/// `meta-llama/Llama-3-8B` on the hub becomes `meta-llama--Llama-3-8B`. Object
/// store and local sources are prefixed with `s3+` and `local+`, a URI scheme is
/// dropped, and path segments are joined with `--`.
///
/// Distinct `(source, identifier)` pairs never share a slug:
/// - `_` escapes, as `__` for itself and `_xx` (hex) for any byte outside
///   `[A-Za-z0-9._-]`, so `+` only ever comes from the prefix;
/// - a `-` that starts or ends a segment, or follows another `-`, is written
///   `_-`, so a bare `--` is always a segment boundary.
pub fn model_slug(source: ModelSource, identifier: &str) -> String {
    let without_scheme = identifier
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(identifier);

    let mut slug = match source {
        ModelSource::HubRepository => String::new(),
        ModelSource::ObjectStoreUri => "s3+".to_string(),
        ModelSource::LocalPath => "local+".to_string(),
    };

    let segments = without_scheme.split('/').filter(|p| !p.is_empty());
    for (i, segment) in segments.enumerate() {
        if i > 0 {
            slug.push_str("--");
        }
        let bytes = segment.as_bytes();
        for (j, &b) in bytes.iter().enumerate() {
            match b {
                b'-' => {
                    let edge = j == 0 || j + 1 == bytes.len() || bytes[j - 1] == b'-';
                    slug.push_str(if edge { "_-" } else { "-" });
                }
                b'_' => slug.push_str("__"),
                b'.' if j == 0 && i == 0 => slug.push_str("_2e"),
                b if b.is_ascii_alphanumeric() || b == b'.' => slug.push(b as char),
                b => slug.push_str(&format!("_{b:02x}")),
            }
        }
    }

    if slug.is_empty() {
        "_".to_string()
    } else {
        slug
    }
}

/// Name of the converted F16 file for a model slug.
pub fn f16_filename(slug: &str) -> String {
    format!("{slug}-f16.{NATIVE_EXTENSION}")
}

/// Name of a quantized variant: the F16 name with `.<LEVEL>` before the extension.
pub fn quantized_filename(f16_name: &str, level: QuantizationLevel) -> String {
    let suffix = format!(".{NATIVE_EXTENSION}");
    let stem = f16_name.strip_suffix(&suffix).unwrap_or(f16_name);
    format!("{stem}.{level}{suffix}")
}

/// Paths of everything the pipeline reads or writes for one model.
#[derive(Debug, Clone)]
pub struct ModelLayout {
    slug: String,
    model_dir: PathBuf,
    quantization: QuantizationLevel,
}

impl ModelLayout {
    pub fn new(models_dir: &Path, spec: &ModelSpec) -> Self {
        let slug = model_slug(spec.source, &spec.identifier);
        Self {
            model_dir: models_dir.join(&slug),
            slug,
            quantization: spec.quantization,
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// Per-model directory holding sources and every derived artifact.
    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Complete raw snapshot.
    pub fn source_dir(&self) -> PathBuf {
        self.model_dir.join("source")
    }

    /// In-flight download, renamed to [`source_dir`](Self::source_dir) when complete.
    pub fn partial_dir(&self) -> PathBuf {
        self.model_dir.join("source.partial")
    }

    pub fn f16_path(&self) -> PathBuf {
        self.model_dir.join(f16_filename(&self.slug))
    }

    pub fn quantized_path(&self, level: QuantizationLevel) -> PathBuf {
        self.model_dir
            .join(quantized_filename(&f16_filename(&self.slug), level))
    }

    /// The file a full preparation run ends with for this spec.
    pub fn target_path(&self) -> PathBuf {
        if self.quantization.requires_quantization() {
            self.quantized_path(self.quantization)
        } else {
            self.f16_path()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_slug() {
        let hub = ModelSource::HubRepository;
        assert_eq!(model_slug(hub, "meta-llama/Llama-3-8B"), "meta-llama--Llama-3-8B");
        assert_eq!(model_slug(hub, "org/my_model"), "org--my__model");
        assert_eq!(
            model_slug(ModelSource::ObjectStoreUri, "s3://bucket/models/qwen/"),
            "s3+bucket--models--qwen"
        );
        assert_eq!(
            model_slug(ModelSource::LocalPath, "/data/my model"),
            "local+data--my_20model"
        );
        assert_eq!(model_slug(hub, "../x"), "_2e.--x");
        assert_eq!(model_slug(hub, ""), "_");
    }

    #[test]
    fn test_model_slug_keeps_identifiers_apart() {
        let pairs = [
            (
                (ModelSource::HubRepository, "bucket/models"),
                (ModelSource::ObjectStoreUri, "s3://bucket/models"),
            ),
            (
                (ModelSource::HubRepository, "a/b"),
                (ModelSource::HubRepository, "a--b"),
            ),
            (
                (ModelSource::HubRepository, "a-/b"),
                (ModelSource::HubRepository, "a/-b"),
            ),
            (
                (ModelSource::HubRepository, "a_2f"),
                (ModelSource::HubRepository, "a/"),
            ),
            (
                (ModelSource::HubRepository, "s3+bucket/models"),
                (ModelSource::ObjectStoreUri, "s3://bucket/models"),
            ),
        ];
        for ((sa, a), (sb, b)) in pairs {
            assert_ne!(model_slug(sa, a), model_slug(sb, b), "{a} vs {b}");
        }
    }

    #[test]
    fn test_quantized_name_appends_level() {
        let f16 = f16_filename("org--model");
        assert_eq!(f16, "org--model-f16.gguf");
        assert_eq!(
            quantized_filename(&f16, QuantizationLevel::Q4_K_M),
            "org--model-f16.Q4_K_M.gguf"
        );
    }

    #[test]
    fn test_target_path_depends_on_identifier_and_level() {
        let root = Path::new("/models");
        let spec = ModelSpec::new(ModelSource::HubRepository, "org/model");

        let f16 = ModelLayout::new(root, &spec);
        assert_eq!(f16.target_path(), root.join("org--model/org--model-f16.gguf"));

        let q8 = ModelLayout::new(root, &spec.clone().with_quantization(QuantizationLevel::Q8_0));
        assert_eq!(
            q8.target_path(),
            root.join("org--model/org--model-f16.Q8_0.gguf")
        );

        let other = ModelLayout::new(root, &ModelSpec::new(ModelSource::HubRepository, "org/other"));
        assert_ne!(other.target_path(), f16.target_path());
    }

    #[test]
    fn test_prepared_artifact_validation() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.gguf");
        assert!(matches!(
            PreparedArtifact::from_path(&missing),
            Err(ArtifactError::FileNotFound(_))
        ));

        let empty = dir.path().join("empty.gguf");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(
            PreparedArtifact::from_path(&empty),
            Err(ArtifactError::Empty(_))
        ));

        let wrong = dir.path().join("weights.bin");
        std::fs::write(&wrong, b"abc").unwrap();
        assert!(matches!(
            PreparedArtifact::from_path(&wrong),
            Err(ArtifactError::InvalidFormat(_))
        ));

        let renamed = dir.path().join("weights.gguf");
        std::fs::write(&renamed, b"PK\x03\x04safetensors").unwrap();
        assert!(matches!(
            PreparedArtifact::from_path(&renamed),
            Err(ArtifactError::InvalidFormat(_))
        ));

        let short = dir.path().join("short.gguf");
        std::fs::write(&short, b"GG").unwrap();
        assert!(matches!(
            PreparedArtifact::from_path(&short),
            Err(ArtifactError::InvalidFormat(_))
        ));

        let good = dir.path().join("model.GGUF");
        std::fs::write(&good, b"GGUF....").unwrap();
        let artifact = PreparedArtifact::from_path(&good).unwrap();
        assert_eq!(artifact.size_bytes, 8);
        assert!(artifact.local_path.is_absolute());
        assert_eq!(artifact.format, ArtifactFormat::Gguf);
    }
}
