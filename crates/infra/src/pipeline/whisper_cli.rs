//! Whisper engine backed by the `whisper` command line tool.
//!
//! The tool writes `<stem>.json` into an output directory; we point it at a
//! scratch directory per call and parse that file.

use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::engine::{EngineError, EngineOutput, EngineRequest, TranscriptionEngine};

/// How often a running tool is checked for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs `<program> <audio> --model <model> [--language <code>] --output_format json --output_dir <tmp>`.
#[derive(Debug, Clone)]
pub struct WhisperCliEngine {
    program: OsString,
    leading_args: Vec<OsString>,
    model: String,
}

impl WhisperCliEngine {
    pub fn new(program: impl Into<OsString>, model: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            model: model.into(),
        }
    }

    /// Build from a command line such as `whisper` or `python3 -m whisper`.
    ///
    /// Words after the first are passed before the audio path.
    pub fn from_command_line(command: &str, model: impl Into<String>) -> Result<Self, EngineError> {
        let mut words = command.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| EngineError::Failed("empty whisper command".to_string()))?;
        Ok(Self {
            program: program.into(),
            leading_args: words.map(OsString::from).collect(),
            model: model.into(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Check that the tool can be started at all.
    pub fn probe(&self) -> Result<(), EngineError> {
        let status = self
            .command()
            .arg("--help")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| {
                EngineError::Failed(format!(
                    "cannot run {}: {e}",
                    self.program.to_string_lossy()
                ))
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(EngineError::Failed(format!(
                "{} --help exited with {status}",
                self.program.to_string_lossy()
            )))
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args);
        cmd
    }
}

impl TranscriptionEngine for WhisperCliEngine {
    fn transcribe(&self, request: &EngineRequest) -> Result<EngineOutput, EngineError> {
        let out_dir = tempfile::Builder::new()
            .prefix("whisper-")
            .tempdir()
            .map_err(|e| EngineError::Failed(format!("failed to create output dir: {e}")))?;

        let mut cmd = self.command();
        cmd.arg(&request.audio_path)
            .arg("--model")
            .arg(&self.model);
        if let Some(code) = request.language.code() {
            cmd.arg("--language").arg(code);
        }
        let stderr_path = out_dir.path().join("whisper.stderr");
        let stderr = File::create(&stderr_path)
            .map_err(|e| EngineError::Failed(format!("failed to create stderr log: {e}")))?;
        cmd.arg("--output_format")
            .arg("json")
            .arg("--output_dir")
            .arg(out_dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr);

        debug!(audio = %request.audio_path.display(), model = %self.model, "running whisper");
        let mut child = cmd.spawn().map_err(|e| {
            EngineError::Failed(format!(
                "failed to run {}: {e}",
                self.program.to_string_lossy()
            ))
        })?;
        let status = wait_for_exit(&mut child, request.timeout)?;

        if !status.success() {
            let stderr = std::fs::read(&stderr_path).unwrap_or_default();
            let stderr = String::from_utf8_lossy(&stderr);
            let tail = stderr.trim().lines().last().unwrap_or("").to_string();
            warn!(status = %status, stderr = %tail, "whisper exited with failure");
            return Err(EngineError::Failed(format!("whisper exited with {status}: {tail}")));
        }

        let json_path = output_json_path(out_dir.path(), &request.audio_path);
        let raw = std::fs::read(&json_path).map_err(|e| {
            EngineError::InvalidOutput(format!("missing {}: {e}", json_path.display()))
        })?;
        parse_whisper_json(&raw)
    }

    fn name(&self) -> &str {
        "whisper-cli"
    }
}

/// Wait for `child`, killing it once `timeout` has elapsed.
fn wait_for_exit(child: &mut Child, timeout: Option<Duration>) -> Result<ExitStatus, EngineError> {
    let wait_failed = |e: std::io::Error| EngineError::Failed(format!("failed to wait for whisper: {e}"));
    let Some(deadline) = timeout.and_then(|t| Instant::now().checked_add(t)) else {
        return child.wait().map_err(wait_failed);
    };

    loop {
        if let Some(status) = child.try_wait().map_err(wait_failed)? {
            return Ok(status);
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(pid = child.id(), "whisper ran past its timeout, killing it");
            // The child may have exited since the last poll.
            let _ = child.kill();
            let _ = child.wait();
            return Err(EngineError::Timeout(timeout.unwrap_or_default()));
        }
        thread::sleep(EXIT_POLL_INTERVAL.min(deadline - now));
    }
}

fn output_json_path(out_dir: &Path, audio_path: &Path) -> PathBuf {
    let stem = audio_path
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| OsString::from("output"));
    let mut name = stem;
    name.push(".json");
    out_dir.join(name)
}

/// Parse the JSON document whisper writes. Unknown fields are ignored.
pub fn parse_whisper_json(raw: &[u8]) -> Result<EngineOutput, EngineError> {
    serde_json::from_slice(raw).map_err(|e| EngineError::InvalidOutput(e.to_string()))
}
