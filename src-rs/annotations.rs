//! Named UI-element locations that survive across runs.
//!
//! On disk the store is a JSON object keyed by label, in insertion order.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::coords::{in_normalized_range, NORM_MAX};
use crate::error::ValidationError;
use crate::files::{timestamp_iso, write_json_pretty};

/// Box size used when `annotate` omits width or height.
pub const DEFAULT_EXTENT: f64 = 100.0;

/// Normalized `[0, 1000]` box plus what the oracle said about it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Annotation {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub description: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Annotation {
    pub fn new(x: f64, y: f64, width: f64, height: f64, description: impl Into<String>) -> Self {
        Self {
            x,
            y,
            width,
            height,
            description: description.into(),
            confidence: 1.0,
            updated_at: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn check(&self) -> Result<(), ValidationError> {
        for (field, value) in [("x", self.x), ("y", self.y)] {
            if !in_normalized_range(value) {
                return Err(ValidationError::OutOfRange { field, value });
            }
        }
        for (field, value) in [("width", self.width), ("height", self.height)] {
            if !(value.is_finite() && value > 0.0 && value <= NORM_MAX) {
                return Err(ValidationError::OutOfRange { field, value });
            }
        }
        if !(self.confidence.is_finite() && (0.0..=1.0).contains(&self.confidence)) {
            return Err(ValidationError::OutOfRange {
                field: "confidence",
                value: self.confidence,
            });
        }
        Ok(())
    }

    /// `label: description`, or just the label.
    pub fn caption(&self, label: &str) -> String {
        let desc = self.description.trim();
        if desc.is_empty() {
            label.to_string()
        } else {
            format!("{label}: {desc}")
        }
    }
}

#[derive(Debug, Default)]
pub struct AnnotationStore {
    path: Option<PathBuf>,
    entries: IndexMap<String, Annotation>,
}

impl AnnotationStore {
    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads `path` if present. A file that does not parse is reported and
    /// replaced by an empty store on the next flush. Entries that break the
    /// annotation bounds are dropped.
    pub fn load(path: &Path) -> Result<Self> {
        let mut entries = match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<IndexMap<String, Annotation>>(&raw) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "annotation store is corrupt; starting empty");
                    IndexMap::new()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => IndexMap::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read annotation store {}", path.display()))
            }
        };
        entries.retain(|label, annotation| {
            let label_ok = !label.trim().is_empty();
            match annotation.check() {
                Ok(()) if label_ok => true,
                Ok(()) => {
                    warn!(path = %path.display(), "dropping stored annotation with blank label");
                    false
                }
                Err(err) => {
                    warn!(path = %path.display(), label = %label, error = %err, "dropping invalid stored annotation");
                    false
                }
            }
        });
        debug!(path = %path.display(), labels = entries.len(), "annotation store loaded");
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Inserts or overwrites `label`, then flushes. An overwrite keeps the
    /// label's original position.
    ///
    /// Returns the flush failure, if any. The entry stays in memory either way.
    pub fn upsert(&mut self, label: &str, mut annotation: Annotation) -> Result<Option<String>, ValidationError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(ValidationError::Empty("label"));
        }
        annotation.check()?;
        annotation.updated_at = Some(timestamp_iso());
        self.entries.insert(label.to_string(), annotation);
        match self.flush() {
            Ok(()) => Ok(None),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(error = %message, "failed to persist annotation store");
                Ok(Some(message))
            }
        }
    }

    pub fn get(&self, label: &str) -> Option<&Annotation> {
        self.entries.get(label.trim())
    }

    pub fn contains(&self, label: &str) -> bool {
        self.entries.contains_key(label.trim())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Annotation)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// First `n` labels in insertion order.
    pub fn top(&self, n: usize) -> impl Iterator<Item = (&str, &Annotation)> {
        self.iter().take(n)
    }

    pub fn flush(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        write_json_pretty(path, &self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_overwrites_in_place_and_persists() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("labels").join("annotations.json");
        let mut store = AnnotationStore::load(&path).unwrap();
        assert!(store.is_empty());

        store
            .upsert("search", Annotation::new(100.0, 50.0, 200.0, 40.0, "search box"))
            .unwrap();
        store
            .upsert("submit", Annotation::new(800.0, 900.0, 80.0, 40.0, "submit button"))
            .unwrap();
        store
            .upsert("search", Annotation::new(110.0, 55.0, 200.0, 40.0, "search field").with_confidence(0.7))
            .unwrap();

        let reloaded = AnnotationStore::load(&path).unwrap();
        let labels: Vec<&str> = reloaded.iter().map(|(label, _)| label).collect();
        assert_eq!(labels, vec!["search", "submit"]);
        let search = reloaded.get("search").unwrap();
        assert_eq!(search.x, 110.0);
        assert_eq!(search.description, "search field");
        assert_eq!(search.confidence, 0.7);
        assert!(search.updated_at.is_some());
    }

    #[test]
    fn corrupt_file_yields_empty_store() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("annotations.json");
        fs::write(&path, "{not json").unwrap();
        let mut store = AnnotationStore::load(&path).unwrap();
        assert!(store.is_empty());
        store
            .upsert("menu", Annotation::new(10.0, 10.0, 50.0, 50.0, "menu"))
            .unwrap();
        assert_eq!(AnnotationStore::load(&path).unwrap().len(), 1);
    }

    #[test]
    fn load_drops_entries_outside_bounds() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("annotations.json");
        fs::write(
            &path,
            r#"{
                "btn": {"x": 1500, "y": -20, "width": 5000, "height": 0, "description": "bad", "confidence": 7.0},
                "ok": {"x": 100, "y": 200, "width": 40, "height": 20, "description": "fine", "confidence": 0.5},
                "sure": {"x": 10, "y": 10, "width": 40, "height": 20, "description": "overconfident", "confidence": 1.2}
            }"#,
        )
        .unwrap();
        let store = AnnotationStore::load(&path).unwrap();
        let labels: Vec<&str> = store.iter().map(|(label, _)| label).collect();
        assert_eq!(labels, vec!["ok"]);
    }

    #[test]
    fn upsert_reports_flush_failure_but_keeps_entry() {
        let temp = tempfile::tempdir().unwrap();
        let blocker = temp.path().join("labels");
        let mut store = AnnotationStore::load(&blocker.join("annotations.json")).unwrap();
        fs::write(&blocker, "file in the way").unwrap();

        let failure = store
            .upsert("menu", Annotation::new(10.0, 10.0, 50.0, 50.0, "menu"))
            .unwrap();
        assert!(failure.is_some());
        assert!(store.contains("menu"));
        assert_eq!(
            AnnotationStore::in_memory().upsert("menu", Annotation::new(10.0, 10.0, 50.0, 50.0, "menu")),
            Ok(None)
        );
    }

    #[test]
    fn rejects_out_of_bounds_records() {
        let mut store = AnnotationStore::in_memory();
        assert_eq!(
            store.upsert("x", Annotation::new(10.0, 10.0, 50.0, 50.0, "d").with_confidence(1.5)),
            Err(ValidationError::OutOfRange {
                field: "confidence",
                value: 1.5
            })
        );
        assert!(store
            .upsert("x", Annotation::new(1001.0, 10.0, 50.0, 50.0, "d"))
            .is_err());
        assert!(store
            .upsert("x", Annotation::new(10.0, 10.0, 0.0, 50.0, "d"))
            .is_err());
        assert_eq!(
            store.upsert("  ", Annotation::new(10.0, 10.0, 50.0, 50.0, "d")),
            Err(ValidationError::Empty("label"))
        );
        assert!(store.is_empty());
    }

    #[test]
    fn top_is_insertion_ordered_prefix() {
        let mut store = AnnotationStore::in_memory();
        for i in 0..10 {
            store
                .upsert(&format!("l{i}"), Annotation::new(f64::from(i), 0.0, 10.0, 10.0, "d"))
                .unwrap();
        }
        let top: Vec<&str> = store.top(8).map(|(label, _)| label).collect();
        assert_eq!(top.len(), 8);
        assert_eq!(top[0], "l0");
        assert_eq!(top[7], "l7");
    }
}
