//! Unified diff application with exact context matching.
//!
//! A patch file may touch several files. It is split into per-file sections,
//! each section is parsed and applied in memory with [`diffy`], and only when
//! every section applies cleanly are the results written back. A single
//! mismatching hunk therefore leaves the source tree untouched.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

const DEV_NULL: &str = "/dev/null";

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed patch: {0}")]
    Parse(String),

    #[error("Patch does not apply to {file}: {reason}")]
    Mismatch { file: PathBuf, reason: String },

    #[error("Patch path '{0}' escapes the source directory")]
    UnsafePath(String),
}

/// Applies a patch file to a source tree.
pub trait Patcher: Send + Sync {
    /// Apply `patch_file` with paths relative to `source_dir`.
    ///
    /// # Errors
    ///
    /// [`PatchError::Mismatch`] when any hunk's context does not match.
    fn apply(&self, patch_file: &Path, source_dir: &Path) -> Result<(), PatchError>;
}

/// [`Patcher`] for unified diffs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffPatcher {
    strip: usize,
}

impl DiffPatcher {
    /// Strip level 0: paths in the patch are used as written, except that
    /// sections introduced by `diff --git` lose their `a/` and `b/` prefixes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop `strip` leading path components, like `patch -p<strip>`.
    pub fn with_strip(mut self, strip: usize) -> Self {
        self.strip = strip;
        self
    }

    fn resolve(&self, source_dir: &Path, name: &str) -> Result<PathBuf, PatchError> {
        let relative: PathBuf = Path::new(name).components().skip(self.strip).collect();
        let safe = !relative.as_os_str().is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe {
            return Err(PatchError::UnsafePath(name.to_string()));
        }
        Ok(source_dir.join(relative))
    }
}

/// What to do with one file once its section applied.
enum Outcome {
    Write(PathBuf, String),
    Remove(PathBuf),
}

impl Patcher for DiffPatcher {
    fn apply(&self, patch_file: &Path, source_dir: &Path) -> Result<(), PatchError> {
        let text = fs::read_to_string(patch_file)?;
        let sections = split_sections(&text)?;
        if sections.is_empty() {
            return Err(PatchError::Parse(format!(
                "no file sections in {}",
                patch_file.display()
            )));
        }

        let mut outcomes = Vec::with_capacity(sections.len());
        for section in &sections {
            let patch = diffy::Patch::from_str(&section.body)
                .map_err(|e| PatchError::Parse(e.to_string()))?;
            let (original, modified) = section.paths(self.strip);

            if modified == DEV_NULL {
                outcomes.push(Outcome::Remove(self.resolve(source_dir, original)?));
                continue;
            }

            let path = self.resolve(source_dir, modified)?;
            let base = if original == DEV_NULL {
                String::new()
            } else {
                let original = self.resolve(source_dir, original)?;
                fs::read_to_string(&original).map_err(|e| PatchError::Mismatch {
                    file: original.clone(),
                    reason: e.to_string(),
                })?
            };
            let patched = diffy::apply(&base, &patch).map_err(|e| PatchError::Mismatch {
                file: path.clone(),
                reason: e.to_string(),
            })?;
            outcomes.push(Outcome::Write(path, patched));
        }

        for outcome in outcomes {
            match outcome {
                Outcome::Write(path, content) => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    debug!(file = %path.display(), "patched");
                    fs::write(path, content)?;
                }
                Outcome::Remove(path) => {
                    debug!(file = %path.display(), "removed by patch");
                    fs::remove_file(path)?;
                }
            }
        }
        Ok(())
    }
}

/// One file's worth of a unified diff.
#[derive(Debug, PartialEq, Eq)]
struct Section {
    original: String,
    modified: String,
    body: String,
    /// Preceded by a `diff --git` line.
    git: bool,
}

impl Section {
    /// Original and modified paths as the patcher should resolve them.
    ///
    /// Git writes `a/` and `b/` in front of every path; at strip level 0
    /// those are dropped, matching how `git apply` reads its own output.
    fn paths(&self, strip: usize) -> (&str, &str) {
        if self.git && strip == 0 {
            (
                without_prefix(&self.original, "a/"),
                without_prefix(&self.modified, "b/"),
            )
        } else {
            (&self.original, &self.modified)
        }
    }
}

fn without_prefix<'a>(path: &'a str, prefix: &str) -> &'a str {
    path.strip_prefix(prefix).unwrap_or(path)
}

/// `--- a/x.c\t2024-01-01 00:00:00` -> `a/x.c`
fn header_path(line: &str, prefix: &str) -> Option<String> {
    let rest = line.strip_prefix(prefix)?;
    let name = rest.split('\t').next().unwrap_or(rest).trim_end();
    Some(name.to_string())
}

/// Parse `@@ -l,s +l,s @@` into (old, new) line counts.
fn hunk_counts(line: &str) -> Result<(usize, usize), PatchError> {
    let malformed = || PatchError::Parse(format!("bad hunk header: {line}"));
    let ranges = line
        .strip_prefix("@@ ")
        .and_then(|r| r.split(" @@").next())
        .ok_or_else(malformed)?;
    let mut parts = ranges.split(' ');
    let count = |part: Option<&str>, sign: char| -> Result<usize, PatchError> {
        let range = part.and_then(|p| p.strip_prefix(sign)).ok_or_else(malformed)?;
        match range.split_once(',') {
            Some((_, len)) => len.parse().map_err(|_| malformed()),
            None => Ok(1),
        }
    };
    Ok((count(parts.next(), '-')?, count(parts.next(), '+')?))
}

/// Split a (possibly multi-file) unified diff into per-file sections.
///
/// Lines outside any section (`diff --git`, `index`, commentary) are dropped.
fn split_sections(text: &str) -> Result<Vec<Section>, PatchError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut sections = Vec::new();
    let mut git = false;
    let mut i = 0;

    while i < lines.len() {
        if lines[i].starts_with("diff --git ") {
            git = true;
        }
        let Some(original) = header_path(lines[i], "--- ") else {
            i += 1;
            continue;
        };
        let Some(modified) = lines.get(i + 1).and_then(|l| header_path(l, "+++ ")) else {
            i += 1;
            continue;
        };

        // headers are rewritten without timestamps
        let mut body = format!("--- {original}\n+++ {modified}\n");
        i += 2;

        while i < lines.len() && lines[i].starts_with("@@") {
            let (mut old, mut new) = hunk_counts(lines[i])?;
            body.push_str(lines[i]);
            body.push('\n');
            i += 1;

            while (old > 0 || new > 0) && i < lines.len() {
                let line = lines[i];
                match line.chars().next() {
                    Some('-') => old = old.saturating_sub(1),
                    Some('+') => new = new.saturating_sub(1),
                    Some('\\') => {}
                    // context, including blank lines some tools emit for empty context
                    _ => {
                        old = old.saturating_sub(1);
                        new = new.saturating_sub(1);
                    }
                }
                body.push_str(if line.is_empty() { " " } else { line });
                body.push('\n');
                i += 1;
            }
            // trailing "\ No newline at end of file"
            while i < lines.len() && lines[i].starts_with('\\') {
                body.push_str(lines[i]);
                body.push('\n');
                i += 1;
            }
        }

        sections.push(Section {
            original,
            modified,
            body,
            git,
        });
        git = false;
    }

    Ok(sections)
}
