//! Per-source summary artifacts: a typed header bracketed by two delimiter
//! lines, one blank line, then the body.

use std::path::Path;

use chrono::{SecondsFormat, Utc};

use crate::error::{EngineError, Result};

const DELIMITER: &str = "---";

/// Inline `critical-todos` rendering is used only for short lists; anything
/// longer spills to one item per line.
const INLINE_TODO_MAX_ITEMS: usize = 3;
const INLINE_TODO_MAX_LEN: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryHeader {
    /// Generation timestamp, UTC, RFC-3339.
    pub generated: String,
    /// SHA-256 of the source bytes that produced the body.
    pub source_hash: String,
    pub purpose: Option<String>,
    pub critical_todos: Vec<String>,
    pub related_files: Vec<String>,
}

impl SummaryHeader {
    pub fn new(source_hash: String) -> Self {
        Self {
            generated: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            source_hash,
            purpose: None,
            critical_todos: Vec::new(),
            related_files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryArtifact {
    pub header: SummaryHeader,
    pub body: String,
}

impl SummaryArtifact {
    /// Serialize into the canonical on-disk form. Header fields are written
    /// in a fixed order; optional fields are omitted when empty.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(DELIMITER);
        out.push('\n');
        out.push_str(&format!("generated: {}\n", self.header.generated));
        out.push_str(&format!("source-hash: {}\n", self.header.source_hash));
        if let Some(purpose) = &self.header.purpose {
            out.push_str(&format!("purpose: {}\n", purpose));
        }
        if !self.header.critical_todos.is_empty() {
            let inline = self.header.critical_todos.len() <= INLINE_TODO_MAX_ITEMS
                && self
                    .header
                    .critical_todos
                    .iter()
                    .all(|t| t.len() <= INLINE_TODO_MAX_LEN && !t.contains(';'));
            if inline {
                out.push_str(&format!(
                    "critical-todos: {}\n",
                    self.header.critical_todos.join("; ")
                ));
            } else {
                out.push_str("critical-todos:\n");
                for todo in &self.header.critical_todos {
                    out.push_str(&format!("  - {}\n", todo));
                }
            }
        }
        if !self.header.related_files.is_empty() {
            out.push_str(&format!(
                "related-files: {}\n",
                self.header.related_files.join(", ")
            ));
        }
        out.push_str(DELIMITER);
        out.push('\n');
        out.push('\n');
        out.push_str(self.body.trim_end());
        out.push('\n');
        out
    }

    /// Parse the canonical form back. Tolerates unknown keys so newer
    /// writers do not break older readers.
    pub fn parse(content: &str) -> Result<Self> {
        let mut lines = content.lines();
        match lines.next() {
            Some(l) if l.trim() == DELIMITER => {}
            _ => {
                return Err(EngineError::ParseError(
                    "summary artifact missing header delimiter".to_string(),
                ))
            }
        }

        let mut generated = None;
        let mut source_hash = None;
        let mut purpose = None;
        let mut critical_todos = Vec::new();
        let mut related_files = Vec::new();
        let mut in_todo_list = false;
        let mut closed = false;

        for line in lines.by_ref() {
            if line.trim() == DELIMITER {
                closed = true;
                break;
            }
            if in_todo_list {
                if let Some(item) = line.strip_prefix("  - ") {
                    critical_todos.push(item.trim().to_string());
                    continue;
                }
                in_todo_list = false;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(EngineError::ParseError(format!(
                    "malformed summary header line: {:?}",
                    line
                )));
            };
            let value = value.trim();
            match key.trim() {
                "generated" => generated = Some(value.to_string()),
                "source-hash" => source_hash = Some(value.to_string()),
                "purpose" => purpose = Some(value.to_string()),
                "critical-todos" => {
                    if value.is_empty() {
                        in_todo_list = true;
                    } else {
                        critical_todos
                            .extend(value.split(';').map(|t| t.trim().to_string()));
                    }
                }
                "related-files" => {
                    related_files.extend(value.split(',').map(|t| t.trim().to_string()));
                }
                _ => {}
            }
        }

        if !closed {
            return Err(EngineError::ParseError(
                "summary artifact header not closed".to_string(),
            ));
        }

        let header = SummaryHeader {
            generated: generated.ok_or_else(|| {
                EngineError::ParseError("summary header missing 'generated'".to_string())
            })?,
            source_hash: source_hash.ok_or_else(|| {
                EngineError::ParseError("summary header missing 'source-hash'".to_string())
            })?,
            purpose,
            critical_todos,
            related_files,
        };

        let body: String = lines.collect::<Vec<_>>().join("\n");
        Ok(Self {
            header,
            body: body.trim_start_matches('\n').trim_end().to_string(),
        })
    }
}

impl SummaryArtifact {
    /// Build an artifact from raw AI output. The templates ask the model to
    /// flag structured fields with `PURPOSE:` / `CRITICAL-TODOS:` /
    /// `RELATED-FILES:` marker lines; those are lifted into the header and
    /// dropped from the body. Unmarked output becomes the body as-is.
    pub fn from_generated_text(source_hash: String, text: &str) -> Self {
        let mut header = SummaryHeader::new(source_hash);
        let mut body_lines: Vec<&str> = Vec::new();
        let mut section: Option<&str> = None;

        for line in text.lines() {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix("PURPOSE:") {
                header.purpose = Some(rest.trim().to_string());
                section = None;
                continue;
            }
            if trimmed == "CRITICAL-TODOS:" {
                section = Some("todos");
                continue;
            }
            if trimmed == "RELATED-FILES:" {
                section = Some("related");
                continue;
            }
            if let Some(kind) = section {
                if let Some(item) = trimmed.strip_prefix("- ") {
                    match kind {
                        "todos" => header.critical_todos.push(item.trim().to_string()),
                        _ => header.related_files.push(item.trim().to_string()),
                    }
                    continue;
                }
                section = None;
            }
            body_lines.push(line);
        }

        Self {
            header,
            body: body_lines.join("\n").trim().to_string(),
        }
    }
}

/// Write a summary artifact to its canonical path.
pub fn write_summary(path: &Path, artifact: &SummaryArtifact) -> Result<()> {
    super::write_atomic(path, &artifact.render())
}

/// Read and parse a summary artifact.
pub fn read_summary(path: &Path) -> Result<SummaryArtifact> {
    let content = std::fs::read_to_string(path)?;
    SummaryArtifact::parse(&content)
}

/// Read just the stored content identifier, without requiring a full parse.
pub fn read_source_hash(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    SummaryArtifact::parse(&content)
        .ok()
        .map(|a| a.header.source_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SummaryArtifact {
        SummaryArtifact {
            header: SummaryHeader {
                generated: "2026-08-01T10:00:00Z".to_string(),
                source_hash: "ab".repeat(32),
                purpose: Some("Parses widget manifests".to_string()),
                critical_todos: vec!["drop legacy path".to_string()],
                related_files: vec!["src/widget.rs".to_string(), "src/parse.rs".to_string()],
            },
            body: "## Overview\n\nDoes things.".to_string(),
        }
    }

    #[test]
    fn render_parse_round_trip() {
        let artifact = sample();
        let parsed = SummaryArtifact::parse(&artifact.render()).unwrap();
        assert_eq!(parsed, artifact);
    }

    #[test]
    fn long_todo_list_spills_to_multiline() {
        let mut artifact = sample();
        artifact.header.critical_todos = (0..5).map(|i| format!("todo {}", i)).collect();
        let rendered = artifact.render();
        assert!(rendered.contains("critical-todos:\n  - todo 0\n"));
        let parsed = SummaryArtifact::parse(&rendered).unwrap();
        assert_eq!(parsed.header.critical_todos.len(), 5);
    }

    #[test]
    fn header_and_body_separated_by_blank_line() {
        let rendered = sample().render();
        assert!(rendered.contains("---\n\n## Overview"));
    }

    #[test]
    fn missing_hash_rejected() {
        let content = "---\ngenerated: 2026-08-01T10:00:00Z\n---\n\nbody\n";
        assert!(SummaryArtifact::parse(content).is_err());
    }

    #[test]
    fn generated_text_markers_lift_into_header() {
        let text = "PURPOSE: Parses widget manifests.\n\nThe parser walks...\n\nCRITICAL-TODOS:\n- drop legacy path\n- handle v2 schema\n\nRELATED-FILES:\n- src/widget.rs\n";
        let artifact = SummaryArtifact::from_generated_text("0".repeat(64), text);
        assert_eq!(
            artifact.header.purpose.as_deref(),
            Some("Parses widget manifests.")
        );
        assert_eq!(artifact.header.critical_todos.len(), 2);
        assert_eq!(artifact.header.related_files, vec!["src/widget.rs"]);
        assert_eq!(artifact.body, "The parser walks...");
    }

    #[test]
    fn unmarked_text_becomes_plain_body() {
        let artifact = SummaryArtifact::from_generated_text("0".repeat(64), "Just prose.\n");
        assert!(artifact.header.purpose.is_none());
        assert_eq!(artifact.body, "Just prose.");
    }

    #[test]
    fn unknown_keys_tolerated() {
        let content = format!(
            "---\ngenerated: t\nsource-hash: {}\nfuture-key: x\n---\n\nbody\n",
            "0".repeat(64)
        );
        let parsed = SummaryArtifact::parse(&content).unwrap();
        assert_eq!(parsed.body, "body");
    }
}
