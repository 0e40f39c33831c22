//! Runtime configuration for llama-adapter.
//!
//! Tuning knobs (timeouts, tool locations, engine flags) live in an optional
//! JSON file; everything an operator sets per deployment comes from CLI flags
//! or the environment variables the hosting container already uses. CLI and
//! environment values override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::model::sources::ObjectUri;
use crate::model::spec::{ModelSource, ModelSpec, QuantizationLevel, UnknownQuantization};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No model source configured: set HF_MODEL_ID or HF_MODEL_URI")]
    MissingSource,

    #[error("Could not split engine arguments: {0}")]
    InvalidEngineArgs(String),

    #[error(transparent)]
    InvalidQuantization(#[from] UnknownQuantization),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Command-line arguments.
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "llama-adapter",
    about = "Prepares a GGUF model and serves it through a supervised llama-server",
    version
)]
pub struct Cli {
    /// Path to an optional JSON tuning file.
    #[arg(short, long, env = "ADAPTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// External listen host.
    #[arg(long)]
    pub host: Option<String>,

    /// External listen port.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Model hub repository id, e.g. `org/model`.
    #[arg(long, env = "HF_MODEL_ID")]
    pub model_id: Option<String>,

    /// `s3://bucket/prefix` URI or local path of the model.
    #[arg(long, env = "HF_MODEL_URI")]
    pub model_uri: Option<String>,

    /// Token for gated or private hub repositories.
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,

    /// Target quantization level (default F16).
    #[arg(long, env = "QUANTIZATION")]
    pub quantization: Option<String>,

    /// Serve this GGUF file verbatim instead of preparing one.
    #[arg(long, env = "MODEL_FILENAME")]
    pub model_filename: Option<String>,

    /// Extra arguments appended to the engine command line.
    #[arg(long, env = "LLAMA_CPP_ARGS", allow_hyphen_values = true)]
    pub engine_args: Option<String>,

    /// Engine bind host (internal only).
    #[arg(long, env = "UPSTREAM_HOST")]
    pub upstream_host: Option<String>,

    /// Engine bind port (internal only).
    #[arg(long, env = "UPSTREAM_PORT")]
    pub upstream_port: Option<u16>,

    /// Persistent directory for downloaded and converted models.
    #[arg(long, env = "MODELS_DIR")]
    pub models_dir: Option<PathBuf>,

    /// Directory containing the llama.cpp conversion script.
    #[arg(long, env = "LLAMACPP_DIR")]
    pub llamacpp_dir: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

impl Cli {
    /// Token from `--hf-token`/`HF_TOKEN`, falling back to `HUGGINGFACE_TOKEN`.
    pub fn auth_token(&self) -> Option<String> {
        self.hf_token
            .clone()
            .or_else(|| std::env::var("HUGGINGFACE_TOKEN").ok())
            .filter(|t| !t.trim().is_empty())
    }

    /// Build the immutable description of what to serve.
    pub fn model_spec(&self) -> Result<ModelSpec, ConfigError> {
        let model_id = non_empty(&self.model_id);
        let model_uri = non_empty(&self.model_uri);

        let (source, identifier) = match (model_id, model_uri) {
            (Some(id), uri) => {
                if uri.is_some() {
                    warn!("Both HF_MODEL_ID and HF_MODEL_URI are set, using HF_MODEL_ID");
                }
                (ModelSource::HubRepository, id)
            }
            (None, Some(uri)) if uri.starts_with(ObjectUri::SCHEME) => {
                (ModelSource::ObjectStoreUri, uri)
            }
            (None, Some(path)) => (ModelSource::LocalPath, path),
            (None, None) => return Err(ConfigError::MissingSource),
        };

        let quantization = match non_empty(&self.quantization) {
            Some(level) => level.parse::<QuantizationLevel>()?,
            None => QuantizationLevel::default(),
        };

        Ok(ModelSpec::new(source, identifier)
            .with_auth_token(self.auth_token())
            .with_quantization(quantization)
            .with_explicit_filename(self.model_filename.clone()))
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// External HTTP server.
    pub server: ServerConfig,

    /// Supervised inference engine.
    pub engine: EngineConfig,

    /// External conversion and quantization tools.
    pub tools: ToolsConfig,

    /// Persistent model storage.
    pub storage: StorageConfig,
}

/// External HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,

    pub port: u16,

    /// Maximum wait for the engine's response headers on a proxied request.
    pub first_byte_timeout_secs: u64,

    /// Maximum wait to open a connection to the engine.
    pub connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            first_byte_timeout_secs: 120,
            connect_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn first_byte_timeout(&self) -> Duration {
        Duration::from_secs(self.first_byte_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Inference engine launch and supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine executable, resolved through `PATH` when relative.
    pub binary: PathBuf,

    /// Internal bind host; never exposed externally.
    pub host: String,

    pub port: u16,

    /// Liveness endpoint on the engine.
    pub health_path: String,

    pub health_poll_interval_ms: u64,

    /// Upper bound on the boot-time wait for the engine to become healthy.
    pub health_timeout_secs: u64,

    /// Wait between SIGTERM and SIGKILL on shutdown.
    pub shutdown_grace_secs: u64,

    /// Appended verbatim to the engine command line.
    pub extra_args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("llama-server"),
            host: "127.0.0.1".to_string(),
            port: 8081,
            health_path: "/health".to_string(),
            health_poll_interval_ms: 500,
            health_timeout_secs: 600,
            shutdown_grace_secs: 10,
            extra_args: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url(), self.health_path)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Locations of the llama.cpp conversion and quantization tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Interpreter for the conversion script.
    pub python: PathBuf,

    pub convert_script: PathBuf,

    pub quantize_binary: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            python: PathBuf::from("/opt/venv/bin/python3"),
            convert_script: PathBuf::from("/opt/llama.cpp/convert_hf_to_gguf.py"),
            quantize_binary: PathBuf::from("llama-quantize"),
        }
    }
}

/// Persistent model storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub models_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("/opt/models"),
        }
    }
}

impl StorageConfig {
    /// Cache directory handed to the hub client.
    pub fn hub_cache_dir(&self) -> PathBuf {
        self.models_dir.join(".cache").join("huggingface")
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Load the optional tuning file and apply CLI/environment overrides.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        config.apply_cli(cli)?;
        Ok(config)
    }

    fn apply_cli(&mut self, cli: &Cli) -> Result<(), ConfigError> {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(host) = non_empty(&cli.upstream_host) {
            self.engine.host = host;
        }
        if let Some(port) = cli.upstream_port {
            self.engine.port = port;
        }
        if let Some(args) = non_empty(&cli.engine_args) {
            let split =
                shlex::split(&args).ok_or_else(|| ConfigError::InvalidEngineArgs(args.clone()))?;
            self.engine.extra_args.extend(split);
        }
        if let Some(dir) = &cli.models_dir {
            self.storage.models_dir = dir.clone();
        }
        if let Some(dir) = &cli.llamacpp_dir {
            self.tools.convert_script = dir.join("convert_hf_to_gguf.py");
        }
        Ok(())
    }
}
