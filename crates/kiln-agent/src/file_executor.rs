//! FILE block executor: parses whole-file edits out of provider output and writes them
//!
//! Providers answer with repeated blocks of the form:
//!
//! ```text
//! FILE: src/health.ts
//! export const ok = true;
//! END FILE
//! ```
//!
//! Headers may be decorated with markdown (`### FILE: x`, `**FILE: x**`), content may
//! be wrapped in one code fence, and `END FILE` may be missing, in which case the
//! block runs to the next header or the end of the response.

use kiln_core::{ChangeSet, FileEdit, KilnError, Result};
use regex::Regex;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

/// Paths that are never written, whatever the repository config says
pub const DEFAULT_PROTECTED: &[&str] = &[".git", ".env", ".kiln/config.toml"];

fn header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^[ \t>#*`]*FILE:[ \t]*(.*?)[ \t*`]*\r?$").expect("valid header regex")
    })
}

fn end_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t>#*`]*END FILE[ \t*`]*\r?$").expect("valid end regex"))
}

/// Parse every FILE block in `text` into a change set.
///
/// Blocks with an empty path are dropped. A path seen twice keeps its first position
/// and takes the later content.
pub fn parse_file_blocks(text: &str) -> ChangeSet {
    let headers: Vec<(usize, usize, String)> = header_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let path = caps.get(1).map(|m| clean_path(m.as_str())).unwrap_or_default();
            Some((whole.start(), whole.end(), path))
        })
        .collect();

    let mut change_set = ChangeSet::new();
    for (i, (_, body_start, path)) in headers.iter().enumerate() {
        let body_end = headers.get(i + 1).map(|h| h.0).unwrap_or(text.len());
        let mut body = &text[*body_start..body_end];

        if let Some(end) = end_regex().find(body) {
            body = &body[..end.start()];
        }

        if path.is_empty() {
            tracing::debug!("Discarding FILE block with empty path");
            continue;
        }

        change_set.push(FileEdit::new(path.clone(), clean_content(body)));
    }
    change_set
}

fn clean_path(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c| c == '`' || c == '"' || c == '\'' || c == '*')
        .trim()
        .to_string()
}

fn clean_content(body: &str) -> String {
    let body = body
        .strip_prefix("\r\n")
        .or_else(|| body.strip_prefix('\n'))
        .unwrap_or(body);

    let mut lines: Vec<&str> = body.lines().collect();
    while lines.first().is_some_and(|l| l.trim().is_empty()) {
        lines.remove(0);
    }

    if lines.first().is_some_and(|l| l.trim_start().starts_with("```")) {
        lines.remove(0);
        while lines.last().is_some_and(|l| l.trim().is_empty()) {
            lines.pop();
        }
        if lines.last().is_some_and(|l| l.trim() == "```") {
            lines.pop();
        }
    }

    lines.join("\n").trim_end().to_string()
}

/// Check that `path` is a repository-relative, non-protected location
pub fn validate_path(path: &str, protected: &[String]) -> Result<PathBuf> {
    let candidate = Path::new(path);

    if path.trim().is_empty() {
        return Err(KilnError::PathValidation("Empty path".to_string()));
    }

    if candidate.is_absolute() || path.starts_with('/') || path.starts_with('\\') {
        return Err(KilnError::PathValidation(format!(
            "Absolute paths not allowed: {}",
            path
        )));
    }

    for component in candidate.components() {
        match component {
            Component::ParentDir => {
                return Err(KilnError::PathValidation(format!(
                    "Path traversal not allowed: {}",
                    path
                )))
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(KilnError::PathValidation(format!(
                    "Absolute paths not allowed: {}",
                    path
                )))
            }
            _ => {}
        }
    }

    let normalized: PathBuf = candidate
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();

    let protected_iter = DEFAULT_PROTECTED
        .iter()
        .copied()
        .chain(protected.iter().map(String::as_str));
    for entry in protected_iter {
        if is_protected(&normalized, entry) {
            return Err(KilnError::PathValidation(format!(
                "Cannot write to protected path: {}",
                path
            )));
        }
    }

    Ok(normalized)
}

fn is_protected(path: &Path, entry: &str) -> bool {
    let entry = Path::new(entry.trim_matches('/'));
    if entry.as_os_str().is_empty() {
        return false;
    }
    // Single-segment entries (".env", ".git") are protected at any depth
    if entry.components().count() == 1 {
        path.components().any(|c| c.as_os_str() == entry.as_os_str())
    } else {
        path.starts_with(entry)
    }
}

/// Files touched by [`apply_change_set`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
}

impl ApplyResult {
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.files_created.is_empty() {
            parts.push(format!("{} created", self.files_created.len()));
        }
        if !self.files_modified.is_empty() {
            parts.push(format!("{} modified", self.files_modified.len()));
        }
        if parts.is_empty() {
            "no files written".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Write every edit in `change_set` under `workspace`.
///
/// All paths are validated before anything is written, so a rejected path leaves the
/// workspace untouched. Each file is overwritten with the full supplied content.
pub fn apply_change_set(
    workspace: &Path,
    change_set: &ChangeSet,
    protected: &[String],
) -> Result<ApplyResult> {
    let targets = change_set
        .edits()
        .iter()
        .map(|edit| validate_path(&edit.path, protected).map(|rel| (workspace.join(rel), edit)))
        .collect::<Result<Vec<_>>>()?;

    let mut result = ApplyResult::default();
    for (target, edit) in targets {
        let created = !target.exists();

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                KilnError::Validation(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        fs::write(&target, &edit.content)
            .map_err(|e| KilnError::Validation(format!("Failed to write {}: {}", edit.path, e)))?;

        if created {
            tracing::info!(path = %edit.path, "Created file");
            result.files_created.push(edit.path.clone());
        } else {
            tracing::info!(path = %edit.path, "Modified file");
            result.files_modified.push(edit.path.clone());
        }
    }

    Ok(result)
}

/// Output-format instructions for the provider
pub fn file_block_instructions() -> &'static str {
    r#"## OUTPUT FORMAT

Respond ONLY with file blocks. For every file you create or change, emit:

FILE: relative/path/to/file.ext
<the complete new content of the file>
END FILE

Rules:
- Paths are relative to the repository root
- Always give the COMPLETE file content, never a diff or an excerpt
- Parent directories are created automatically
- You may emit several blocks in one response
- Do not touch .git, .env or .kiln/config.toml
- Text outside file blocks is ignored
"#
}
