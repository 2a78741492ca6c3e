//! Per-run artifacts: frame dumps, a JSON-lines cycle log and a summary.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;

use crate::action::{ActionDescriptor, ActionSignature};
use crate::executor::ActionOutcome;
use crate::files::{timestamp_compact, timestamp_iso, write_atomic, write_json_pretty};

pub const CYCLES_FILE: &str = "cycles.jsonl";
pub const SUMMARY_FILE: &str = "summary.json";

/// One line of `cycles.jsonl`.
#[derive(Debug, Clone, Serialize)]
pub struct CycleRecord {
    pub cycle: u32,
    pub at: String,
    pub attempts: u32,
    pub action: Option<ActionDescriptor>,
    pub justification: Option<String>,
    /// `"ok"` or the last validation/oracle error.
    pub validation: String,
    pub execution: Option<ActionOutcome>,
    pub error: Option<String>,
    pub signature: Option<ActionSignature>,
    pub loop_detected: bool,
    pub frame: Option<String>,
}

impl CycleRecord {
    pub fn new(cycle: u32) -> Self {
        Self {
            cycle,
            at: timestamp_iso(),
            attempts: 0,
            action: None,
            justification: None,
            validation: "ok".to_string(),
            execution: None,
            error: None,
            signature: None,
            loop_detected: false,
            frame: None,
        }
    }
}

pub struct RunLog {
    dir: PathBuf,
    cycles: File,
}

impl RunLog {
    /// Creates `<root>/runs/run-<ts>-<pid>-<nonce>/`.
    pub fn create(root: &Path) -> Result<Self> {
        let run_id = format!(
            "run-{}-{}-{}",
            timestamp_compact(),
            std::process::id(),
            rand::thread_rng().gen_range(1000..9999)
        );
        Self::create_at(root.join("runs").join(run_id))
    }

    pub fn create_at(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create run dir: {}", dir.display()))?;
        let cycles_path = dir.join(CYCLES_FILE);
        let cycles = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cycles_path)
            .with_context(|| format!("failed to open {}", cycles_path.display()))?;
        Ok(Self { dir, cycles })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn frame_path(&self, step: u32) -> PathBuf {
        self.dir.join(format!("step{step:03}_screen.png"))
    }

    pub fn write_frame(&self, step: u32, png: &[u8]) -> Result<PathBuf> {
        let path = self.frame_path(step);
        write_atomic(&path, png)?;
        Ok(path)
    }

    pub fn append(&mut self, record: &CycleRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.cycles
            .write_all(line.as_bytes())
            .context("failed to append cycle record")?;
        self.cycles.flush().context("failed to flush cycle log")
    }

    pub fn write_summary(&self, summary: &Value) -> Result<PathBuf> {
        let path = self.dir.join(SUMMARY_FILE);
        write_json_pretty(&path, summary)?;
        Ok(path)
    }
}
