//! Conversion and quantization through external llama.cpp tools.
//!
//! Each step writes to a `.partial` file and renames it into place only after
//! the tool exits successfully. A step whose output already exists and is
//! non-empty is therefore complete and is skipped. The F16 intermediate is kept
//! so that a later run asking for a different quantization level only quantizes.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::ToolsConfig;
use crate::model::artifact::{is_nonempty_file, ArtifactError, ModelLayout, PreparedArtifact};
use crate::model::resolver::RawModel;
use crate::model::spec::ModelSpec;

/// Lines of tool output kept for error reports.
const OUTPUT_TAIL_LINES: usize = 40;

#[derive(Error, Debug)]
pub enum PreparationError {
    #[error("Conversion failed ({status}):\n{output}")]
    ConversionFailed { status: String, output: String },

    #[error("Quantization failed ({status}):\n{output}")]
    QuantizationFailed { status: String, output: String },

    #[error("Could not run {tool}: {source}")]
    ToolUnavailable {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tool exited successfully but produced no output at {0}")]
    MissingOutput(PathBuf),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// One external tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Program name used in log lines.
    pub fn name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

/// Result of a finished tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,

    /// Tail of the combined stdout and stderr.
    pub output: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn status(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Runs external programs to completion.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run the tool and wait for it to exit. `Err` only when it could not be
    /// started or waited on; a non-zero exit is reported through [`ToolOutput`].
    async fn run(&self, invocation: &ToolInvocation) -> std::io::Result<ToolOutput>;
}

/// [`ToolRunner`] that spawns real child processes and forwards their output
/// to the log under the `tool` target.
#[derive(Debug, Default)]
pub struct SystemToolRunner;

#[async_trait]
impl ToolRunner for SystemToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> std::io::Result<ToolOutput> {
        let name = invocation.name();
        info!(
            tool = name,
            args = ?invocation.args,
            "Running external tool"
        );

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (status, out_tail, err_tail) = tokio::join!(
            child.wait(),
            collect_tail(stdout, &name),
            collect_tail(stderr, &name)
        );
        let status = status?;

        let output = out_tail
            .into_iter()
            .chain(err_tail)
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ToolOutput {
            code: status.code(),
            output,
        })
    }
}

/// Log every line of `reader` and keep the last few.
async fn collect_tail<R>(reader: Option<R>, tool: &str) -> VecDeque<String>
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
    let Some(reader) = reader else {
        return tail;
    };

    // Drain to EOF even through undecodable bytes, or the tool dies on SIGPIPE.
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                info!(target: "tool", tool, "{line}");
                if tail.len() == OUTPUT_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Err(e) => {
                warn!(tool, "Failed to read tool output: {e}");
                break;
            }
        }
    }
    tail
}

/// Turns raw model files into the GGUF artifact a [`ModelSpec`] asks for.
pub struct ConverterRunner {
    models_dir: PathBuf,
    tools: ToolsConfig,
    runner: Arc<dyn ToolRunner>,
}

impl ConverterRunner {
    pub fn new(models_dir: PathBuf, tools: ToolsConfig, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            models_dir,
            tools,
            runner,
        }
    }

    /// Convert to F16 and, if requested, quantize. Completed steps are skipped.
    pub async fn prepare(
        &self,
        raw: &RawModel,
        spec: &ModelSpec,
    ) -> Result<PreparedArtifact, PreparationError> {
        let layout = ModelLayout::new(&self.models_dir, spec);
        fs::create_dir_all(layout.model_dir()).await?;

        let f16 = layout.f16_path();
        if is_nonempty_file(&f16) {
            info!(path = %f16.display(), "F16 artifact present, skipping conversion");
        } else {
            self.convert(&raw.dir, &f16).await?;
        }

        if !spec.quantization.requires_quantization() {
            return Ok(PreparedArtifact::from_path(&f16)?);
        }

        let quantized = layout.quantized_path(spec.quantization);
        if is_nonempty_file(&quantized) {
            info!(
                path = %quantized.display(),
                "Quantized artifact present, skipping quantization"
            );
        } else {
            self.quantize(&f16, &quantized, spec).await?;
        }

        Ok(PreparedArtifact::from_path(&quantized)?)
    }

    async fn convert(&self, source_dir: &Path, out: &Path) -> Result<(), PreparationError> {
        let partial = partial_path(out);
        let invocation = ToolInvocation::new(&self.tools.python)
            .arg(&self.tools.convert_script)
            .arg("--outtype")
            .arg("f16")
            .arg("--outfile")
            .arg(&partial)
            .arg(source_dir);

        info!(
            source = %source_dir.display(),
            out = %out.display(),
            "Converting model to GGUF F16"
        );
        let output = self.run_tool(&invocation).await?;
        if !output.success() {
            discard(&partial).await;
            return Err(PreparationError::ConversionFailed {
                status: output.status(),
                output: output.output,
            });
        }
        commit(&partial, out).await
    }

    async fn quantize(
        &self,
        f16: &Path,
        out: &Path,
        spec: &ModelSpec,
    ) -> Result<(), PreparationError> {
        let partial = partial_path(out);
        let invocation = ToolInvocation::new(&self.tools.quantize_binary)
            .arg(f16)
            .arg(&partial)
            .arg(spec.quantization.as_str());

        info!(
            level = %spec.quantization,
            out = %out.display(),
            "Quantizing model"
        );
        let output = self.run_tool(&invocation).await?;
        if !output.success() {
            discard(&partial).await;
            return Err(PreparationError::QuantizationFailed {
                status: output.status(),
                output: output.output,
            });
        }
        commit(&partial, out).await
    }

    async fn run_tool(&self, invocation: &ToolInvocation) -> Result<ToolOutput, PreparationError> {
        self.runner
            .run(invocation)
            .await
            .map_err(|source| PreparationError::ToolUnavailable {
                tool: invocation.program.display().to_string(),
                source,
            })
    }
}

fn partial_path(out: &Path) -> PathBuf {
    let mut name = out.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

async fn commit(partial: &Path, out: &Path) -> Result<(), PreparationError> {
    if !is_nonempty_file(partial) {
        discard(partial).await;
        return Err(PreparationError::MissingOutput(out.to_path_buf()));
    }
    fs::rename(partial, out).await?;
    Ok(())
}

async fn discard(partial: &Path) {
    if let Err(e) = fs::remove_file(partial).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %partial.display(), "Failed to remove partial output: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::model::spec::{ModelSource, QuantizationLevel};

    /// Records invocations and writes the output file each tool would produce.
    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<ToolInvocation>>,
        fail_with: Option<i32>,
        write_output: bool,
    }

    impl RecordingRunner {
        fn succeeding() -> Self {
            Self {
                write_output: true,
                ..Default::default()
            }
        }

        fn names(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|c| c.name()).collect()
        }
    }

    #[async_trait]
    impl ToolRunner for RecordingRunner {
        async fn run(&self, invocation: &ToolInvocation) -> std::io::Result<ToolOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            if let Some(code) = self.fail_with {
                return Ok(ToolOutput {
                    code: Some(code),
                    output: "error: out of disk".to_string(),
                });
            }
            if self.write_output {
                let args = &invocation.args;
                let out = match args.iter().position(|a| a == "--outfile") {
                    Some(i) => &args[i + 1],
                    None => &args[1],
                };
                std::fs::write(out, b"GGUF")?;
            }
            Ok(ToolOutput {
                code: Some(0),
                output: String::new(),
            })
        }
    }

    fn tools() -> ToolsConfig {
        ToolsConfig {
            python: PathBuf::from("python3"),
            convert_script: PathBuf::from("convert_hf_to_gguf.py"),
            quantize_binary: PathBuf::from("llama-quantize"),
        }
    }

    fn spec(level: QuantizationLevel) -> ModelSpec {
        ModelSpec::new(ModelSource::HubRepository, "org/model").with_quantization(level)
    }

    fn raw(root: &Path) -> RawModel {
        RawModel {
            dir: root.join("org--model/source"),
        }
    }

    #[tokio::test]
    async fn test_convert_then_quantize() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::succeeding());
        let converter = ConverterRunner::new(dir.path().to_path_buf(), tools(), runner.clone());

        let artifact = converter
            .prepare(&raw(dir.path()), &spec(QuantizationLevel::Q4_K_M))
            .await
            .unwrap();

        assert_eq!(artifact.file_name(), Some("org--model-f16.Q4_K_M.gguf"));
        assert_eq!(runner.names(), vec!["python3", "llama-quantize"]);

        // F16 intermediate is retained, no partial files left behind.
        let model_dir = dir.path().join("org--model");
        assert!(model_dir.join("org--model-f16.gguf").is_file());
        assert!(!model_dir.join("org--model-f16.gguf.partial").exists());

        let calls = runner.calls.lock().unwrap();
        assert!(calls[0].args.contains(&OsString::from("--outtype")));
        assert_eq!(calls[1].args[2], OsString::from("Q4_K_M"));
    }

    #[tokio::test]
    async fn test_f16_only_skips_quantization() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::succeeding());
        let converter = ConverterRunner::new(dir.path().to_path_buf(), tools(), runner.clone());

        let artifact = converter
            .prepare(&raw(dir.path()), &spec(QuantizationLevel::F16))
            .await
            .unwrap();
        assert_eq!(artifact.file_name(), Some("org--model-f16.gguf"));
        assert_eq!(runner.names(), vec!["python3"]);
    }

    #[tokio::test]
    async fn test_existing_outputs_are_not_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::succeeding());
        let converter = ConverterRunner::new(dir.path().to_path_buf(), tools(), runner.clone());

        converter
            .prepare(&raw(dir.path()), &spec(QuantizationLevel::Q8_0))
            .await
            .unwrap();
        converter
            .prepare(&raw(dir.path()), &spec(QuantizationLevel::Q8_0))
            .await
            .unwrap();
        assert_eq!(runner.names().len(), 2);

        // A different level reuses the F16 file and only quantizes.
        converter
            .prepare(&raw(dir.path()), &spec(QuantizationLevel::Q4_0))
            .await
            .unwrap();
        assert_eq!(
            runner.names(),
            vec!["python3", "llama-quantize", "llama-quantize"]
        );
    }

    #[tokio::test]
    async fn test_conversion_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner {
            fail_with: Some(1),
            ..Default::default()
        });
        let converter = ConverterRunner::new(dir.path().to_path_buf(), tools(), runner.clone());

        let err = converter
            .prepare(&raw(dir.path()), &spec(QuantizationLevel::Q4_K_M))
            .await
            .unwrap_err();
        match err {
            PreparationError::ConversionFailed { status, output } => {
                assert_eq!(status, "exit code 1");
                assert!(output.contains("out of disk"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // No retry and no quantization after a failed conversion.
        assert_eq!(runner.names(), vec!["python3"]);
    }

    #[tokio::test]
    async fn test_missing_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let converter = ConverterRunner::new(dir.path().to_path_buf(), tools(), runner);

        let err = converter
            .prepare(&raw(dir.path()), &spec(QuantizationLevel::F16))
            .await
            .unwrap_err();
        assert!(matches!(err, PreparationError::MissingOutput(_)));
    }

    #[tokio::test]
    async fn test_system_runner_reports_exit_code() {
        let runner = SystemToolRunner;
        let ok = runner
            .run(&ToolInvocation::new("sh").arg("-c").arg("echo converted"))
            .await
            .unwrap();
        assert!(ok.success());
        assert_eq!(ok.output, "converted");

        let failed = runner
            .run(&ToolInvocation::new("sh").arg("-c").arg("echo boom >&2; exit 3"))
            .await
            .unwrap();
        assert_eq!(failed.code, Some(3));
        assert!(failed.output.contains("boom"));

        assert!(runner
            .run(&ToolInvocation::new("/nonexistent/tool"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_system_runner_survives_invalid_utf8_output() {
        let script = r"printf 'bad \377 byte\n'; sleep 0.2; i=0; while [ $i -lt 2000 ]; do echo line $i; i=$((i+1)); done; exit 0";
        let output = SystemToolRunner
            .run(&ToolInvocation::new("sh").arg("-c").arg(script))
            .await
            .unwrap();

        assert!(output.success(), "tool ended with {}", output.status());
        assert!(output.output.ends_with("line 1999"));
        assert_eq!(output.output.lines().count(), OUTPUT_TAIL_LINES);
    }
}
