//! Repository context document for generation requests
//!
//! Sections, in order: dependency manifests, target files (explicitly mentioned or
//! auto-discovered), working tree status.

use kiln_core::{RepoConfig, Task};
use kiln_git::GitExecutor;
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

pub const MANIFESTS: &[&str] = &[
    "package.json",
    "Cargo.toml",
    "pyproject.toml",
    "go.mod",
    "requirements.txt",
];

pub const MAX_SAMPLE_FILES: usize = 20;
pub const MAX_FILE_CHARS: usize = 8000;

const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    "vendor",
    "__pycache__",
    ".venv",
    "coverage",
    ".kiln",
];

const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "mjs", "py", "go", "java", "kt", "rb", "php", "cs", "c",
    "h", "cpp", "hpp", "swift", "scala", "vue", "svelte",
];

fn path_mention_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9_.\-/]+\.[A-Za-z0-9]+").expect("valid path mention regex")
    })
}

/// Build the context document for `task` from the checkout at `workspace`
pub async fn build_context<E: GitExecutor>(
    workspace: &Path,
    task: &Task,
    repo_config: &RepoConfig,
    git: &E,
) -> String {
    let mut doc = String::new();

    for manifest in MANIFESTS {
        if let Some(content) = read_truncated(&workspace.join(manifest)) {
            doc.push_str(&format!("## {}\n\n```\n{}\n```\n\n", manifest, content));
        }
    }

    let mut targets = mentioned_files(workspace, task);
    for extra in &repo_config.context_files {
        if workspace.join(extra).is_file() && !targets.contains(extra) {
            targets.push(extra.clone());
        }
    }

    let (heading, files) = if targets.is_empty() {
        ("Repository sample", discover_source_files(workspace, MAX_SAMPLE_FILES))
    } else {
        ("Target files", targets)
    };
    debug!(count = files.len(), kind = heading, "Context files selected");

    doc.push_str(&format!("# {}\n\n", heading));
    for rel in &files {
        if let Some(content) = read_truncated(&workspace.join(rel)) {
            doc.push_str(&format!("## {}\n\n```\n{}\n```\n\n", rel, content));
        }
    }

    // Status is informational; a failing git call just leaves the section out
    match git.exec(workspace, &["status", "--short"]).await {
        Ok(output) if output.success => {
            let status = output.stdout.trim();
            doc.push_str("# Working tree status\n\n```\n");
            doc.push_str(if status.is_empty() { "clean" } else { status });
            doc.push_str("\n```\n");
        }
        Ok(output) => debug!(stderr = %output.stderr.trim(), "git status failed"),
        Err(e) => debug!(error = %e, "git status failed"),
    }

    doc
}

/// Repository-relative paths named in the task text that exist as files
pub fn mentioned_files(workspace: &Path, task: &Task) -> Vec<String> {
    let text = format!("{}\n{}", task.title, task.description_text());
    let mut seen = BTreeSet::new();
    let mut files = Vec::new();

    for m in path_mention_regex().find_iter(&text) {
        let candidate = m.as_str().trim_start_matches("./").trim_end_matches('.');
        if candidate.is_empty() || candidate.starts_with('/') || candidate.contains("..") {
            continue;
        }
        if workspace.join(candidate).is_file() && seen.insert(candidate.to_string()) {
            files.push(candidate.to_string());
        }
    }
    files
}

/// Breadth-first, name-ordered sample of source files
pub fn discover_source_files(workspace: &Path, limit: usize) -> Vec<String> {
    let mut found = Vec::new();
    let mut queue = std::collections::VecDeque::from([PathBuf::new()]);

    while let Some(rel_dir) = queue.pop_front() {
        let Ok(entries) = fs::read_dir(workspace.join(&rel_dir)) else {
            continue;
        };
        let mut entries: Vec<_> = entries.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name().to_string_lossy().to_string();
            let rel = rel_dir.join(&name);
            let Ok(file_type) = entry.file_type() else {
                continue;
            };

            if file_type.is_dir() {
                if !SKIP_DIRS.contains(&name.as_str()) {
                    queue.push_back(rel);
                }
            } else if file_type.is_file() && is_source_file(&rel) {
                found.push(rel.to_string_lossy().replace('\\', "/"));
                if found.len() >= limit {
                    return found;
                }
            }
        }
    }
    found
}

fn is_source_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
}

fn read_truncated(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    Some(truncate_chars(&content, MAX_FILE_CHARS))
}

/// Cut `text` to at most `max` characters, marking the cut
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}\n...[truncated]", &text[..idx]),
        None => text.to_string(),
    }
}
