//! Action vocabulary: parsing oracle text, validation, and signatures.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::annotations::{AnnotationStore, DEFAULT_EXTENT};
use crate::coords::{in_normalized_range, NORM_MAX};
use crate::error::ValidationError;

pub const MAX_TYPE_CHARS: usize = 2000;
pub const MAX_SCROLL: f64 = 10_000.0;
const TEXT_DIGEST_CHARS: usize = 16;

pub const TOOLS: [&str; 8] = [
    "click", "move", "drag", "type", "scroll", "annotate", "recall", "done",
];

/// One action, coordinates normalized to `[0, 1000]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "tool", rename_all = "lowercase")]
pub enum ActionDescriptor {
    Click {
        x: f64,
        y: f64,
    },
    Move {
        x: f64,
        y: f64,
    },
    Drag {
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
    },
    Type {
        text: String,
    },
    Scroll {
        dx: f64,
        dy: f64,
    },
    Annotate {
        label: String,
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        description: String,
        confidence: f64,
    },
    Recall {
        label: String,
    },
    Done,
}

/// A parsed oracle answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub action: ActionDescriptor,
    pub justification: String,
}

impl ActionDescriptor {
    pub fn tool(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::Move { .. } => "move",
            Self::Drag { .. } => "drag",
            Self::Type { .. } => "type",
            Self::Scroll { .. } => "scroll",
            Self::Annotate { .. } => "annotate",
            Self::Recall { .. } => "recall",
            Self::Done => "done",
        }
    }

    /// Range and existence checks against the current store.
    pub fn validate(&self, store: &AnnotationStore) -> Result<(), ValidationError> {
        match self {
            Self::Click { x, y } | Self::Move { x, y } => {
                check_norm("x", *x)?;
                check_norm("y", *y)
            }
            Self::Drag { x1, y1, x2, y2 } => {
                check_norm("x1", *x1)?;
                check_norm("y1", *y1)?;
                check_norm("x2", *x2)?;
                check_norm("y2", *y2)
            }
            Self::Type { text } => {
                if text.is_empty() {
                    return Err(ValidationError::Empty("text"));
                }
                let len = text.chars().count();
                if len > MAX_TYPE_CHARS {
                    return Err(ValidationError::TooLong {
                        field: "text",
                        len,
                        max: MAX_TYPE_CHARS,
                    });
                }
                Ok(())
            }
            Self::Scroll { dx, dy } => {
                for (field, value) in [("dx", *dx), ("dy", *dy)] {
                    if !value.is_finite() || value.abs() > MAX_SCROLL {
                        return Err(ValidationError::OutOfRange { field, value });
                    }
                }
                if *dx == 0.0 && *dy == 0.0 {
                    return Err(ValidationError::NoScroll);
                }
                Ok(())
            }
            Self::Annotate {
                label,
                x,
                y,
                width,
                height,
                description,
                confidence,
            } => {
                if label.trim().is_empty() {
                    return Err(ValidationError::Empty("label"));
                }
                check_norm("x", *x)?;
                check_norm("y", *y)?;
                for (field, value) in [("width", *width), ("height", *height)] {
                    if !(value.is_finite() && value > 0.0 && value <= NORM_MAX) {
                        return Err(ValidationError::OutOfRange { field, value });
                    }
                }
                if description.trim().is_empty() {
                    return Err(ValidationError::Empty("description"));
                }
                if !(confidence.is_finite() && (0.0..=1.0).contains(confidence)) {
                    return Err(ValidationError::OutOfRange {
                        field: "confidence",
                        value: *confidence,
                    });
                }
                Ok(())
            }
            Self::Recall { label } => {
                if label.trim().is_empty() {
                    return Err(ValidationError::Empty("label"));
                }
                if !store.contains(label) {
                    return Err(ValidationError::UnknownLabel(label.clone()));
                }
                Ok(())
            }
            Self::Done => Ok(()),
        }
    }

    pub fn signature(&self) -> ActionSignature {
        ActionSignature::of(self)
    }
}

fn check_norm(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if in_normalized_range(value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange { field, value })
    }
}

/// Canonical text form of an action, used only for equality. Fields are
/// written in a fixed order and truncated to integers, so key order and
/// sub-unit jitter in the oracle's JSON do not matter. Typed text is kept as
/// its length plus a digest prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ActionSignature(String);

impl ActionSignature {
    pub fn of(action: &ActionDescriptor) -> Self {
        let int = |v: f64| v.trunc() as i64;
        let raw = match action {
            ActionDescriptor::Click { x, y } => format!("click:{}:{}:", int(*x), int(*y)),
            ActionDescriptor::Move { x, y } => format!("move:{}:{}:", int(*x), int(*y)),
            ActionDescriptor::Annotate { label, x, y, .. } => {
                format!("annotate:{}:{}:{}", int(*x), int(*y), label.trim())
            }
            ActionDescriptor::Drag { x1, y1, x2, y2 } => format!(
                "drag:{}:{}:{}:{}",
                int(*x1),
                int(*y1),
                int(*x2),
                int(*y2)
            ),
            ActionDescriptor::Scroll { dx, dy } => format!("scroll:{}:{}", int(*dx), int(*dy)),
            ActionDescriptor::Type { text } => {
                let digest = hex::encode(Sha256::digest(text.as_bytes()));
                format!("type:{}:{}", text.chars().count(), &digest[..TEXT_DIGEST_CHARS])
            }
            ActionDescriptor::Recall { label } => format!("recall:{}", label.trim()),
            ActionDescriptor::Done => "done".to_string(),
        };
        Self(raw)
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn strip_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    trimmed
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// First balanced `{...}` in `raw`, ignoring braces inside JSON strings.
pub fn extract_json_object(raw: &str) -> Option<String> {
    let text = strip_fences(raw);
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Numbers, numeric strings, and one-element arrays all count.
fn lenient_number(obj: &Map<String, Value>, field: &'static str) -> Result<Option<f64>, ValidationError> {
    let value = match obj.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Array(items)) => match items.first() {
            Some(first) => first,
            None => return Err(ValidationError::NotNumeric(field)),
        },
        Some(other) => other,
    };
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match number {
        Some(n) if n.is_finite() => Ok(Some(n)),
        _ => Err(ValidationError::NotNumeric(field)),
    }
}

fn required_number(obj: &Map<String, Value>, field: &'static str) -> Result<f64, ValidationError> {
    lenient_number(obj, field)?.ok_or(ValidationError::Missing(field))
}

fn string_field(obj: &Map<String, Value>, field: &str) -> String {
    match obj.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Parses one oracle response into a decision. Only the shape is checked
/// here; ranges are checked by [`ActionDescriptor::validate`].
pub fn parse_decision(raw: &str) -> Result<Decision, ValidationError> {
    let candidate = extract_json_object(raw).ok_or(ValidationError::NoJson)?;
    let value: Value =
        serde_json::from_str(&candidate).map_err(|err| ValidationError::Malformed(err.to_string()))?;
    let Value::Object(obj) = value else {
        return Err(ValidationError::Malformed("expected a JSON object".to_string()));
    };
    let tool = match obj.get("tool") {
        Some(Value::String(tool)) => tool.trim().to_ascii_lowercase(),
        Some(_) => return Err(ValidationError::Malformed("`tool` must be a string".to_string())),
        None => return Err(ValidationError::Missing("tool")),
    };
    let justification = string_field(&obj, "justification").trim().to_string();

    let action = match tool.as_str() {
        "click" => ActionDescriptor::Click {
            x: required_number(&obj, "x")?,
            y: required_number(&obj, "y")?,
        },
        "move" => ActionDescriptor::Move {
            x: required_number(&obj, "x")?,
            y: required_number(&obj, "y")?,
        },
        "drag" => ActionDescriptor::Drag {
            x1: required_number(&obj, "x1")?,
            y1: required_number(&obj, "y1")?,
            x2: required_number(&obj, "x2")?,
            y2: required_number(&obj, "y2")?,
        },
        "type" => ActionDescriptor::Type {
            text: string_field(&obj, "text"),
        },
        "scroll" => ActionDescriptor::Scroll {
            dx: lenient_number(&obj, "dx")?.unwrap_or(0.0),
            dy: lenient_number(&obj, "dy")?.unwrap_or(0.0),
        },
        "annotate" => ActionDescriptor::Annotate {
            label: string_field(&obj, "label").trim().to_string(),
            x: required_number(&obj, "x")?,
            y: required_number(&obj, "y")?,
            width: lenient_number(&obj, "width")?.unwrap_or(DEFAULT_EXTENT),
            height: lenient_number(&obj, "height")?.unwrap_or(DEFAULT_EXTENT),
            description: string_field(&obj, "description").trim().to_string(),
            confidence: lenient_number(&obj, "confidence")?.unwrap_or(1.0),
        },
        "recall" => ActionDescriptor::Recall {
            label: string_field(&obj, "label").trim().to_string(),
        },
        "done" => ActionDescriptor::Done,
        _ => return Err(ValidationError::UnknownTool(tool)),
    };
    Ok(Decision {
        action,
        justification,
    })
}

/// Parse plus validation: the only way oracle text becomes an action.
pub fn accept_decision(raw: &str, store: &AnnotationStore) -> Result<Decision, ValidationError> {
    let decision = parse_decision(raw)?;
    decision.action.validate(store)?;
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::Annotation;

    fn accept(raw: &str) -> Result<Decision, ValidationError> {
        accept_decision(raw, &AnnotationStore::in_memory())
    }

    #[test]
    fn parses_fenced_response_with_prose() {
        let raw = "```json\n{\"tool\":\"click\",\"x\":500,\"y\":\"250\",\"justification\":\"the {OK} button\"}\n```";
        let decision = accept(raw).unwrap();
        assert_eq!(decision.action, ActionDescriptor::Click { x: 500.0, y: 250.0 });
        assert_eq!(decision.justification, "the {OK} button");

        let chatty = "Sure! {\"tool\": \"done\"} and then some {junk}";
        assert_eq!(accept(chatty).unwrap().action, ActionDescriptor::Done);
    }

    #[test]
    fn numbers_accept_single_element_arrays() {
        let decision = accept(r#"{"tool":"move","x":[120],"y":[80.5]}"#).unwrap();
        assert_eq!(decision.action, ActionDescriptor::Move { x: 120.0, y: 80.5 });
    }

    #[test]
    fn rejects_click_out_of_range() {
        assert_eq!(
            accept(r#"{"tool":"click","x":1001,"y":10}"#),
            Err(ValidationError::OutOfRange {
                field: "x",
                value: 1001.0
            })
        );
    }

    #[test]
    fn rejects_zero_scroll() {
        assert_eq!(
            accept(r#"{"tool":"scroll","dx":0,"dy":0}"#),
            Err(ValidationError::NoScroll)
        );
        assert!(accept(r#"{"tool":"scroll","dy":-300}"#).is_ok());
        assert!(accept(r#"{"tool":"scroll","dx":20000}"#).is_err());
    }

    #[test]
    fn recall_requires_known_label() {
        let mut store = AnnotationStore::in_memory();
        let raw = r#"{"tool":"recall","label":"save"}"#;
        assert_eq!(
            accept_decision(raw, &store),
            Err(ValidationError::UnknownLabel("save".to_string()))
        );
        store
            .upsert("save", Annotation::new(900.0, 40.0, 60.0, 30.0, "save icon"))
            .unwrap();
        assert!(accept_decision(raw, &store).is_ok());
    }

    #[test]
    fn rejects_annotate_confidence_above_one() {
        let raw = r#"{"tool":"annotate","label":"ok","x":10,"y":10,"description":"ok button","confidence":1.5}"#;
        assert_eq!(
            accept(raw),
            Err(ValidationError::OutOfRange {
                field: "confidence",
                value: 1.5
            })
        );
        let defaults = accept(r#"{"tool":"annotate","label":"ok","x":10,"y":10,"description":"ok button"}"#)
            .unwrap();
        assert!(matches!(
            defaults.action,
            ActionDescriptor::Annotate { width, height, confidence, .. }
                if width == 100.0 && height == 100.0 && confidence == 1.0
        ));
    }

    #[test]
    fn shape_errors_name_the_field() {
        assert_eq!(accept("no json here"), Err(ValidationError::NoJson));
        assert_eq!(
            accept(r#"{"tool":"click","y":1}"#),
            Err(ValidationError::Missing("x"))
        );
        assert_eq!(
            accept(r#"{"tool":"click","x":"left","y":1}"#),
            Err(ValidationError::NotNumeric("x"))
        );
        assert_eq!(
            accept(r#"{"tool":"teleport"}"#),
            Err(ValidationError::UnknownTool("teleport".to_string()))
        );
        assert_eq!(accept(r#"{"tool":"type","text":""}"#), Err(ValidationError::Empty("text")));
        assert!(matches!(
            accept(&format!(r#"{{"tool":"type","text":"{}"}}"#, "a".repeat(2001))),
            Err(ValidationError::TooLong { len: 2001, .. })
        ));
    }

    #[test]
    fn signatures_ignore_key_order_and_fractions() {
        let a = parse_decision(r#"{"tool":"click","x":500.2,"y":500}"#).unwrap();
        let b = parse_decision(r#"{"y":500.9,"x":500,"tool":"click","justification":"again"}"#).unwrap();
        assert_eq!(a.action.signature(), b.action.signature());
        assert_eq!(a.action.signature().as_str(), "click:500:500:");
        assert_eq!(
            ActionDescriptor::Scroll { dx: 0.0, dy: -300.0 }.signature().as_str(),
            "scroll:0:-300"
        );
    }

    #[test]
    fn typed_text_signature_distinguishes_same_length_inputs() {
        let typed = |text: &str| {
            ActionDescriptor::Type {
                text: text.to_string(),
            }
            .signature()
        };
        let hello = typed("héllo");
        assert!(hello.as_str().starts_with("type:5:"), "{hello}");
        assert_eq!(hello.as_str().len(), "type:5:".len() + 16);
        assert_eq!(hello, typed("héllo"));
        assert_ne!(hello, typed("world"));
    }
}
