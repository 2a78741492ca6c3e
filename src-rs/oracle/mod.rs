//! The decision oracle: frames and context in, raw action text out.
//!
//! Oracles never parse. Whatever they return goes through
//! [`crate::action::accept_decision`] before anything is executed.

pub mod command;
pub mod http;

use std::time::Duration;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};

use crate::annotations::AnnotationStore;
use crate::config::{OracleConfig, OracleKind};
use crate::error::OracleError;
use crate::history::HistoryEntry;

pub use command::CommandOracle;
pub use http::HttpOracle;

pub const SYSTEM_PROMPT: &str = r#"You control a desktop computer via tools. Output one JSON object only - no extra text.

Tools:
click    -> {"tool":"click","x":500,"y":300,"justification":"..."}
move     -> {"tool":"move","x":500,"y":300,"justification":"..."}
drag     -> {"tool":"drag","x1":500,"y1":300,"x2":700,"y2":300,"justification":"..."}
type     -> {"tool":"type","text":"...","justification":"..."}
scroll   -> {"tool":"scroll","dx":0,"dy":-300,"justification":"..."}
annotate -> {"tool":"annotate","label":"...","x":500,"y":300,"description":"...","width":120,"height":120}
recall   -> {"tool":"recall","label":"...","justification":"..."}
done     -> {"tool":"done","justification":"..."}

Rules:
- x,y are normalized 0..1000 (0,0 top-left; 1000,1000 bottom-right).
- Use CURRENT screenshot primarily. Use PREVIOUS screenshot only as context.
- Use drag for drawing/painting (press-hold-move-release).
- Prefer annotate for stable UI targets, then recall by label.
- Every command includes a justification describing what you see and why.
"#;

/// Everything one oracle call sees.
#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub goal: String,
    /// Oldest first.
    pub recent: Vec<HistoryEntry>,
    /// `(label, description)` in store order.
    pub labels: Vec<(String, String)>,
    pub previous_png: Option<Vec<u8>>,
    pub current_png: Vec<u8>,
}

impl OracleRequest {
    pub fn new(
        goal: &str,
        recent: Vec<HistoryEntry>,
        store: &AnnotationStore,
        max_labels: usize,
        previous_png: Option<Vec<u8>>,
        current_png: Vec<u8>,
    ) -> Self {
        Self {
            goal: goal.to_string(),
            recent,
            labels: store
                .top(max_labels)
                .map(|(label, ann)| (label.to_string(), ann.description.trim().to_string()))
                .collect(),
            previous_png,
            current_png,
        }
    }

    /// Text part of the user message.
    pub fn prompt_text(&self) -> String {
        let mut out = format!("Goal: {}\n\n", self.goal);
        if !self.recent.is_empty() {
            out.push_str(&format!("Recent actions (last {}):\n", self.recent.len()));
            for entry in &self.recent {
                let status = if entry.success { "OK" } else { "FAIL" };
                out.push_str(&format!("- {} ({status}): {}\n", entry.tool, entry.justification));
            }
            out.push('\n');
        }
        if !self.labels.is_empty() {
            out.push_str("Labels:\n");
            let lines: Vec<String> = self
                .labels
                .iter()
                .map(|(label, desc)| {
                    if desc.is_empty() {
                        label.clone()
                    } else {
                        format!("{label}: {desc}")
                    }
                })
                .collect();
            out.push_str(&lines.join("\n"));
            out.push_str("\n\n");
        }
        out.push_str("Decide the next action using the screenshots.\n");
        out
    }

    /// OpenAI-style chat messages with both frames inlined as data URLs.
    pub fn chat_messages(&self) -> Value {
        let mut content = vec![json!({"type": "text", "text": self.prompt_text()})];
        if let Some(previous) = &self.previous_png {
            content.push(json!({"type": "text", "text": "Previous screenshot (t-1):"}));
            content.push(image_part(previous));
        }
        content.push(json!({"type": "text", "text": "Current screenshot (t):"}));
        content.push(image_part(&self.current_png));
        json!([
            {"role": "system", "content": SYSTEM_PROMPT},
            {"role": "user", "content": content},
        ])
    }

    /// Flat document for external commands.
    pub fn to_json(&self) -> Value {
        json!({
            "system": SYSTEM_PROMPT,
            "prompt": self.prompt_text(),
            "goal": self.goal,
            "recent": self.recent,
            "labels": self
                .labels
                .iter()
                .map(|(label, description)| json!({"label": label, "description": description}))
                .collect::<Vec<_>>(),
            "previous_png_base64": self.previous_png.as_ref().map(|png| STANDARD.encode(png)),
            "current_png_base64": STANDARD.encode(&self.current_png),
        })
    }
}

pub fn png_data_url(png: &[u8]) -> String {
    format!("data:image/png;base64,{}", STANDARD.encode(png))
}

fn image_part(png: &[u8]) -> Value {
    json!({"type": "image_url", "image_url": {"url": png_data_url(png), "detail": "auto"}})
}

pub trait DecisionOracle {
    /// Raw response text for `request`, bounded by `timeout`.
    fn decide(&mut self, request: &OracleRequest, timeout: Duration) -> Result<String, OracleError>;

    fn describe(&self) -> String;
}

pub fn build_oracle(cfg: &OracleConfig) -> Result<Box<dyn DecisionOracle>> {
    Ok(match cfg.kind {
        OracleKind::Http => Box::new(HttpOracle::from_config(cfg)?),
        OracleKind::Command => Box::new(CommandOracle::from_config(cfg)?),
    })
}
