pub mod formulas;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Prepended to every Python calculation. Scripts read their payload with
/// `load_input()` and report structured results with `write_result(...)`.
pub const PYTHON_PREAMBLE: &str = r#"import json
import math
import os
import sys

INPUT_PATH = os.environ.get("CALC_INPUT_PATH")
OUTPUT_PATH = os.environ.get("CALC_OUTPUT_PATH")


def load_input():
    if INPUT_PATH and os.path.exists(INPUT_PATH):
        with open(INPUT_PATH) as f:
            return json.load(f)
    return None


def write_result(summary, insights=None, recommendations=None, plots=None):
    with open(OUTPUT_PATH, "w") as f:
        json.dump(
            {
                "plots": plots or [],
                "analysis": {
                    "summary": summary,
                    "insights": insights or [],
                    "recommendations": recommendations or [],
                },
            },
            f,
        )

"#;

/// Outcome of one subprocess run. Never persisted on its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalculationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_data: Option<JsonValue>,
}

/// Typed view of the output file a script may write.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CalcReport {
    #[serde(default)]
    pub plots: Vec<String>,
    #[serde(default)]
    pub analysis: CalcAnalysis,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CalcAnalysis {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl CalculationResult {
    pub fn report(&self) -> Option<CalcReport> {
        serde_json::from_value(self.structured_data.clone()?).ok()
    }
}

enum ProcessOutcome {
    Completed { stdout: String },
    ProcessError { status: String, stdout: String, stderr: String },
    TimedOut,
    Failed(String),
}

/// Scratch file paths for one run, namespaced by a random id. The files are
/// removed when this is dropped, so a cancelled run cleans up too.
struct ScratchFiles {
    script: PathBuf,
    input: PathBuf,
    output: PathBuf,
}

impl ScratchFiles {
    fn new(dir: &Path) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            script: dir.join(format!("calc_{}_script", id)),
            input: dir.join(format!("calc_{}_input.json", id)),
            output: dir.join(format!("calc_{}_output.json", id)),
        }
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        for path in [&self.script, &self.input, &self.output] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "Failed to remove scratch file: {}", e),
            }
        }
    }
}

pub struct CalcRunner {
    interpreter: String,
    scratch_dir: PathBuf,
    preamble: String,
    /// Caps concurrently running subprocesses.
    limit: Arc<Semaphore>,
}

impl CalcRunner {
    pub fn new(interpreter: &str, scratch_dir: impl Into<PathBuf>, max_concurrent: usize) -> Self {
        Self {
            interpreter: interpreter.to_string(),
            scratch_dir: scratch_dir.into(),
            preamble: String::new(),
            limit: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Python runner configured from the environment.
    pub fn from_env() -> Self {
        let interpreter =
            dotenv::var("CALC_INTERPRETER").unwrap_or_else(|_| "python3".to_string());
        let scratch_dir = dotenv::var("CALC_SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("stormwater-calc"));
        let max_concurrent = dotenv::var("CALC_MAX_CONCURRENT")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(4);

        Self::new(&interpreter, scratch_dir, max_concurrent).with_preamble(PYTHON_PREAMBLE)
    }

    pub fn with_preamble(mut self, preamble: &str) -> Self {
        self.preamble = preamble.to_string();
        self
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    /// Check that the interpreter can be started at all.
    pub async fn health_check(&self) -> bool {
        match Command::new(&self.interpreter)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(e) => {
                warn!(interpreter = %self.interpreter, "Interpreter health check failed: {}", e);
                false
            }
        }
    }

    /// Write the script (preamble + code) and optional input payload, run the
    /// interpreter, and collect the result. `timeout` covers the wait for a
    /// free slot as well as the process itself.
    ///
    /// Script failures and timeouts come back as an unsuccessful
    /// `CalculationResult`. `Err` means the runner could not run the script
    /// at all (scratch files unwritable, interpreter not startable).
    pub async fn run(
        &self,
        code: &str,
        data: Option<&JsonValue>,
        timeout: Duration,
    ) -> Result<CalculationResult> {
        let deadline = Instant::now() + timeout;
        let _permit = match tokio::time::timeout_at(deadline, self.limit.acquire()).await {
            Ok(permit) => permit.ok(),
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "no calculation slot before deadline");
                return Ok(timed_out(timeout));
            }
        };
        let files = ScratchFiles::new(&self.scratch_dir);

        let outcome = match self.write_scratch(&files, code, data).await {
            Ok(()) => self.execute(&files, deadline).await,
            Err(e) => ProcessOutcome::Failed(format!("{:#}", e)),
        };

        let structured_data = match outcome {
            ProcessOutcome::Completed { .. } | ProcessOutcome::ProcessError { .. } => {
                read_output(&files.output).await
            }
            _ => None,
        };
        drop(files);

        let result = match outcome {
            ProcessOutcome::Completed { stdout } => CalculationResult {
                success: true,
                output: Some(stdout),
                error: None,
                structured_data,
            },
            ProcessOutcome::ProcessError {
                status,
                stdout,
                stderr,
            } => {
                let stderr = stderr.trim();
                CalculationResult {
                    success: false,
                    output: Some(stdout).filter(|s| !s.is_empty()),
                    error: Some(if stderr.is_empty() {
                        format!("process exited with {}", status)
                    } else {
                        stderr.to_string()
                    }),
                    structured_data,
                }
            }
            ProcessOutcome::TimedOut => timed_out(timeout),
            ProcessOutcome::Failed(msg) => {
                warn!(interpreter = %self.interpreter, error = %msg, "calculation could not run");
                anyhow::bail!(msg);
            }
        };

        info!(
            interpreter = %self.interpreter,
            success = result.success,
            structured = result.structured_data.is_some(),
            "calculation finished"
        );
        Ok(result)
    }

    async fn write_scratch(
        &self,
        files: &ScratchFiles,
        code: &str,
        data: Option<&JsonValue>,
    ) -> Result<()> {
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .context("Failed to create scratch directory")?;

        let script = if self.preamble.is_empty() {
            code.to_string()
        } else {
            format!("{}\n{}\n", self.preamble, code)
        };
        tokio::fs::write(&files.script, script)
            .await
            .context("Failed to write script file")?;

        if let Some(data) = data {
            let payload = serde_json::to_vec(data).context("serialize calculation input")?;
            tokio::fs::write(&files.input, payload)
                .await
                .context("Failed to write input file")?;
        }
        Ok(())
    }

    async fn execute(&self, files: &ScratchFiles, deadline: Instant) -> ProcessOutcome {
        let child = Command::new(&self.interpreter)
            .arg(&files.script)
            .current_dir(&self.scratch_dir)
            .env("CALC_INPUT_PATH", &files.input)
            .env("CALC_OUTPUT_PATH", &files.output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return ProcessOutcome::Failed(format!(
                    "Failed to start {}: {}",
                    self.interpreter, e
                ))
            }
        };
        let pid = child.id();
        debug!(pid = ?pid, script = %files.script.display(), "calculation process started");

        // Dropping the wait future on timeout drops the child, which kills it.
        match tokio::time::timeout_at(deadline, child.wait_with_output()).await {
            Err(_) => {
                warn!(pid = ?pid, "calculation timed out, process killed");
                ProcessOutcome::TimedOut
            }
            Ok(Err(e)) => ProcessOutcome::Failed(format!("Failed to collect process output: {}", e)),
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                if output.status.success() {
                    ProcessOutcome::Completed { stdout }
                } else {
                    ProcessOutcome::ProcessError {
                        status: output.status.to_string(),
                        stdout,
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    }
                }
            }
        }
    }
}

fn timed_out(after: Duration) -> CalculationResult {
    CalculationResult {
        success: false,
        output: None,
        error: Some(format!("timed out after {}s", after.as_secs_f32())),
        structured_data: None,
    }
}

/// Parse the script's output file if one was written. Unparseable output is
/// logged and dropped.
async fn read_output(path: &Path) -> Option<JsonValue> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), "Failed to read calculation output: {}", e);
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), "Calculation output is not valid JSON: {}", e);
            None
        }
    }
}
