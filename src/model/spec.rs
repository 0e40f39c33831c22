//! The resolved description of what to serve.
//!
//! A [`ModelSpec`] is built once at boot from configuration and never mutated.
//! It carries everything the resolver and converter need to decide where the
//! model comes from and what the final artifact must be called.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where the model weights come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelSource {
    /// A repository on the model hub, addressed by repo id.
    HubRepository,
    /// An object-store prefix such as `s3://bucket/path/`.
    ObjectStoreUri,
    /// A file or directory already on the local filesystem.
    LocalPath,
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::HubRepository => write!(f, "hub"),
            ModelSource::ObjectStoreUri => write!(f, "object-store"),
            ModelSource::LocalPath => write!(f, "local"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unknown quantization level: {0}")]
pub struct UnknownQuantization(pub String);

/// Target precision of the served artifact.
///
/// `F16` means "convert only"; every other level adds a quantization pass.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QuantizationLevel {
    #[default]
    F16,
    BF16,
    F32,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q2_K,
    Q3_K_S,
    Q3_K_M,
    Q3_K_L,
    Q4_K_S,
    Q4_K_M,
    Q5_K_S,
    Q5_K_M,
    Q6_K,
    IQ4_NL,
    IQ4_XS,
}

impl QuantizationLevel {
    pub const ALL: [QuantizationLevel; 19] = [
        QuantizationLevel::F16,
        QuantizationLevel::BF16,
        QuantizationLevel::F32,
        QuantizationLevel::Q4_0,
        QuantizationLevel::Q4_1,
        QuantizationLevel::Q5_0,
        QuantizationLevel::Q5_1,
        QuantizationLevel::Q8_0,
        QuantizationLevel::Q2_K,
        QuantizationLevel::Q3_K_S,
        QuantizationLevel::Q3_K_M,
        QuantizationLevel::Q3_K_L,
        QuantizationLevel::Q4_K_S,
        QuantizationLevel::Q4_K_M,
        QuantizationLevel::Q5_K_S,
        QuantizationLevel::Q5_K_M,
        QuantizationLevel::Q6_K,
        QuantizationLevel::IQ4_NL,
        QuantizationLevel::IQ4_XS,
    ];

    /// Canonical name, as accepted by `llama-quantize` and used in filenames.
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantizationLevel::F16 => "F16",
            QuantizationLevel::BF16 => "BF16",
            QuantizationLevel::F32 => "F32",
            QuantizationLevel::Q4_0 => "Q4_0",
            QuantizationLevel::Q4_1 => "Q4_1",
            QuantizationLevel::Q5_0 => "Q5_0",
            QuantizationLevel::Q5_1 => "Q5_1",
            QuantizationLevel::Q8_0 => "Q8_0",
            QuantizationLevel::Q2_K => "Q2_K",
            QuantizationLevel::Q3_K_S => "Q3_K_S",
            QuantizationLevel::Q3_K_M => "Q3_K_M",
            QuantizationLevel::Q3_K_L => "Q3_K_L",
            QuantizationLevel::Q4_K_S => "Q4_K_S",
            QuantizationLevel::Q4_K_M => "Q4_K_M",
            QuantizationLevel::Q5_K_S => "Q5_K_S",
            QuantizationLevel::Q5_K_M => "Q5_K_M",
            QuantizationLevel::Q6_K => "Q6_K",
            QuantizationLevel::IQ4_NL => "IQ4_NL",
            QuantizationLevel::IQ4_XS => "IQ4_XS",
        }
    }

    /// Whether producing this level needs a quantization pass after conversion.
    pub fn requires_quantization(&self) -> bool {
        *self != QuantizationLevel::F16
    }
}

impl fmt::Display for QuantizationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuantizationLevel {
    type Err = UnknownQuantization;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        QuantizationLevel::ALL
            .iter()
            .copied()
            .find(|level| level.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownQuantization(s.to_string()))
    }
}

/// Everything needed to produce the artifact the engine will serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub source: ModelSource,

    /// Repo id, object-store URI, or local path depending on `source`.
    pub identifier: String,

    /// Only present for gated or private sources.
    pub auth_token: Option<String>,

    pub quantization: QuantizationLevel,

    /// When set, preparation is skipped and this GGUF file is served verbatim.
    pub explicit_filename: Option<String>,
}

impl ModelSpec {
    pub fn new(source: ModelSource, identifier: impl Into<String>) -> Self {
        Self {
            source,
            identifier: identifier.into(),
            auth_token: None,
            quantization: QuantizationLevel::default(),
            explicit_filename: None,
        }
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_quantization(mut self, level: QuantizationLevel) -> Self {
        self.quantization = level;
        self
    }

    pub fn with_explicit_filename(mut self, filename: Option<String>) -> Self {
        self.explicit_filename = filename
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty());
        self
    }
}
