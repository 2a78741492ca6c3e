//! Agent configuration (TOML).
//!
//! Every field has a default, so a missing file or a partial file is valid.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::raster::parse_color;

pub const DEFAULT_CONFIG_FILE: &str = "visual-truth-loop.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub frame: FrameConfig,
    pub timing: TimingConfig,
    pub overlay: OverlayConfig,
    pub policy: LoopConfig,
    pub oracle: OracleConfig,
    pub output: OutputConfig,
}

/// Resolution of the ground-truth frame sent to the oracle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FrameConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 576,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    /// Settle time after each injected batch.
    pub input_settle_ms: u64,
    pub drag_step_ms: u64,
    pub hover_ms: u64,
    pub post_action_ms: u64,
    pub scroll_settle_ms: u64,
    /// Pause between oracle attempts within one cycle.
    pub retry_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            input_settle_ms: 50,
            drag_step_ms: 10,
            hover_ms: 1500,
            post_action_ms: 100,
            scroll_settle_ms: 150,
            retry_delay_ms: 1500,
        }
    }
}

impl TimingConfig {
    /// All delays zero; used by tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            input_settle_ms: 0,
            drag_step_ms: 0,
            hover_ms: 0,
            post_action_ms: 0,
            scroll_settle_ms: 0,
            retry_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OverlayConfig {
    pub hud_enabled: bool,
    pub hud_max_chars: usize,
    pub hud_margin: i32,
    pub hud_max_width: i32,
    pub glyph_scale: u32,
    pub label_max_chars: usize,
    pub topmost_pulses: u32,
    pub topmost_pause_ms: u64,
    /// How long to wait for a requested repaint before capturing anyway.
    pub paint_timeout_ms: u64,
    pub annotation_color: String,
    pub highlight_color: String,
    pub path_color: String,
    pub marker_color: String,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            hud_enabled: true,
            hud_max_chars: 180,
            hud_margin: 6,
            hud_max_width: 960,
            glyph_scale: 1,
            label_max_chars: 120,
            topmost_pulses: 2,
            topmost_pause_ms: 30,
            paint_timeout_ms: 500,
            annotation_color: "#FFFF00".to_string(),
            highlight_color: "#FF00FF".to_string(),
            path_color: "#00FF00".to_string(),
            marker_color: "#FF0000".to_string(),
        }
    }
}

/// What to do when the last `repeat_threshold` signatures are identical.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LoopRecovery {
    /// Forget action history and signatures, keep running.
    ClearHistory,
    /// Log only.
    Ignore,
    /// End the run as failed.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    pub max_cycles: u32,
    pub oracle_attempts: u32,
    pub history_len: usize,
    pub oracle_history: usize,
    pub signature_window: usize,
    pub repeat_threshold: usize,
    pub recovery: LoopRecovery,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_cycles: 60,
            oracle_attempts: 3,
            history_len: 8,
            oracle_history: 4,
            signature_window: 10,
            repeat_threshold: 4,
            recovery: LoopRecovery::ClearHistory,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OracleKind {
    Http,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OracleConfig {
    pub kind: OracleKind,
    /// argv for `kind = "command"`; the request JSON is written to stdin.
    pub command: Vec<String>,
    pub endpoint: String,
    pub model: String,
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
    pub temperature: f64,
    pub max_tokens: u32,
    pub annotations_in_request: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            kind: OracleKind::Http,
            command: Vec::new(),
            endpoint: "http://localhost:1234/v1/chat/completions".to_string(),
            model: "qwen3-vl-4b-instruct-1m".to_string(),
            api_key_env: None,
            timeout_secs: 60,
            temperature: 0.2,
            max_tokens: 250,
            annotations_in_request: 8,
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    /// Root for run dumps; `VTL_OUT_DIR` wins when set.
    pub root: Option<PathBuf>,
    /// Label store; defaults to `<root>/annotations.json`.
    pub annotations: Option<PathBuf>,
}

impl OutputConfig {
    pub fn resolved_root(&self) -> PathBuf {
        env::var("VTL_OUT_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .or_else(|| self.root.clone())
            .unwrap_or_else(|| PathBuf::from(".visual-truth-loop"))
    }

    pub fn annotations_path(&self) -> PathBuf {
        self.annotations
            .clone()
            .unwrap_or_else(|| self.resolved_root().join("annotations.json"))
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frame.width == 0 || self.frame.height == 0 {
            return Err(anyhow!("frame.width and frame.height must be > 0"));
        }
        if self.policy.max_cycles == 0 {
            return Err(anyhow!("policy.max_cycles must be > 0"));
        }
        if self.policy.oracle_attempts == 0 {
            return Err(anyhow!("policy.oracle_attempts must be > 0"));
        }
        if self.policy.repeat_threshold < 2 {
            return Err(anyhow!("policy.repeat_threshold must be >= 2"));
        }
        if self.policy.signature_window < self.policy.repeat_threshold {
            return Err(anyhow!(
                "policy.signature_window must be >= policy.repeat_threshold"
            ));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        if self.oracle.kind == OracleKind::Command
            && self.oracle.command.first().map_or(true, |c| c.trim().is_empty())
        {
            return Err(anyhow!("oracle.command must be a non-empty array"));
        }
        if self.overlay.topmost_pulses == 0 {
            return Err(anyhow!("overlay.topmost_pulses must be > 0"));
        }
        for (name, value) in [
            ("annotation_color", &self.overlay.annotation_color),
            ("highlight_color", &self.overlay.highlight_color),
            ("path_color", &self.overlay.path_color),
            ("marker_color", &self.overlay.marker_color),
        ] {
            if parse_color(value).is_none() {
                return Err(anyhow!("overlay.{name} is not a #RRGGBB[AA] color: {value}"));
            }
        }
        Ok(())
    }
}

/// Missing file ⇒ defaults.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().unwrap();
        let cfg = load_config(&temp.path().join("missing.toml")).unwrap();
        assert_eq!(cfg, AgentConfig::default());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("cfg.toml");
        fs::write(
            &path,
            "[frame]\nwidth = 512\n\n[policy]\nrecovery = \"fail\"\n\n[oracle]\nkind = \"command\"\ncommand = [\"my-oracle\", \"--json\"]\n",
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.frame.width, 512);
        assert_eq!(cfg.frame.height, 576);
        assert_eq!(cfg.policy.recovery, LoopRecovery::Fail);
        assert_eq!(cfg.policy.oracle_attempts, 3);
        assert_eq!(cfg.oracle.kind, OracleKind::Command);
        assert_eq!(cfg.timing.hover_ms, 1500);
    }

    #[test]
    fn rejects_empty_command_oracle() {
        let mut cfg = AgentConfig::default();
        cfg.oracle.kind = OracleKind::Command;
        assert!(cfg.validate().is_err());
        cfg.oracle.command = vec!["oracle".to_string()];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_bad_colors_and_zero_sizes() {
        let mut cfg = AgentConfig::default();
        cfg.overlay.marker_color = "crimson".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = AgentConfig::default();
        cfg.frame.height = 0;
        assert!(cfg.validate().is_err());
    }
}
