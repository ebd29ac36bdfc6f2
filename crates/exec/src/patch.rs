//! Unified-diff application with a just-in-time backup.
//!
//! [`backup_then_apply_patch`] is all-or-nothing: every hunk is attempted
//! against the current file content, and the file is only rewritten (via a
//! temp file + rename) when all of them apply.  The backup is taken before
//! any of that and is never removed.

use std::fs::{self, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("malformed patch: {0}")]
    Malformed(String),
    #[error("{} is outside the workspace", .0.display())]
    OutsideWorkspace(PathBuf),
    #[error("{} is not valid UTF-8", .0.display())]
    NotUtf8(PathBuf),
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to back up {}: {source}", .path.display())]
    Backup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOutcome {
    pub applied: bool,
    /// 1-based ids of hunks whose context could not be located.
    pub hunks_failed: Vec<usize>,
    pub backup: Option<BackupRecord>,
}

// ── Parsing ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 1-based position within the patch.
    pub id: usize,
    pub old_start: usize,
    /// Old-range length from the header (`1` when omitted).  Only `0` is
    /// significant: the hunk then inserts after line `old_start`.
    pub old_count: usize,
    pub lines: Vec<HunkLine>,
    /// `\ No newline at end of file` followed an old-side line.
    pub old_missing_newline: bool,
    /// `\ No newline at end of file` followed a new-side line.
    pub new_missing_newline: bool,
}

impl Hunk {
    /// 0-based index of the first old line, or of the insertion point.
    fn anchor(&self) -> usize {
        if self.old_count == 0 {
            self.old_start
        } else {
            self.old_start.saturating_sub(1)
        }
    }

    /// Lines the hunk expects to find in the file.
    fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                HunkLine::Context(text) | HunkLine::Remove(text) => Some(text.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    /// Lines that replace them.
    fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                HunkLine::Context(text) | HunkLine::Add(text) => Some(text.as_str()),
                HunkLine::Remove(_) => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub hunks: Vec<Hunk>,
}

impl Patch {
    /// Parse the hunks of a single-file unified diff.
    ///
    /// `---`/`+++`/`diff`/`index` headers are skipped.  Hunk bodies run until
    /// the next `@@` header.  Header line counts are not enforced; an old
    /// count of `0` marks a pure insertion after `old_start`.
    pub fn parse(text: &str) -> Result<Self, PatchError> {
        let header = Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+\d+(?:,\d+)? @@")
            .map_err(|e| PatchError::Malformed(e.to_string()))?;

        let mut hunks: Vec<Hunk> = Vec::new();
        // Unprefixed empty lines at the current end of the last hunk.  They are
        // blank context only if more hunk lines follow.
        let mut bare_tail = 0usize;
        let mut lines = text.split('\n').peekable();
        while let Some(raw) = lines.next() {
            let line = raw.strip_suffix('\r').unwrap_or(raw);

            if let Some(caps) = header.captures(line) {
                trim_bare_tail(&mut hunks, &mut bare_tail);
                let bad_header = || PatchError::Malformed(format!("bad hunk header: {line}"));
                let old_start = caps[1].parse().map_err(|_| bad_header())?;
                let old_count = match caps.get(2) {
                    Some(count) => count.as_str().parse().map_err(|_| bad_header())?,
                    None => 1,
                };
                hunks.push(Hunk {
                    id: hunks.len() + 1,
                    old_start,
                    old_count,
                    lines: Vec::new(),
                    old_missing_newline: false,
                    new_missing_newline: false,
                });
                continue;
            }
            if line.starts_with("@@") {
                return Err(PatchError::Malformed(format!("bad hunk header: {line}")));
            }

            let Some(hunk) = hunks.last_mut() else {
                // Preamble before the first hunk.
                continue;
            };
            let is_file_header = line.starts_with("diff ")
                || line.starts_with("index ")
                || (line.starts_with("--- ")
                    && lines.peek().is_some_and(|next| next.starts_with("+++ ")));
            if is_file_header {
                // Skip the `+++` line that follows a `---` header.
                if line.starts_with("--- ") {
                    lines.next();
                }
                trim_bare_tail(&mut hunks, &mut bare_tail);
                continue;
            }

            if line.is_empty() {
                hunk.lines.push(HunkLine::Context(String::new()));
                bare_tail += 1;
                continue;
            }
            if line.starts_with('\\') {
                // "\ No newline at end of file" qualifies the line before it.
                match hunk.lines.last() {
                    Some(HunkLine::Remove(_)) => hunk.old_missing_newline = true,
                    Some(HunkLine::Add(_)) => hunk.new_missing_newline = true,
                    Some(HunkLine::Context(_)) => {
                        hunk.old_missing_newline = true;
                        hunk.new_missing_newline = true;
                    }
                    None => {}
                }
                continue;
            }

            bare_tail = 0;
            if let Some(rest) = line.strip_prefix(' ') {
                hunk.lines.push(HunkLine::Context(rest.to_string()));
            } else if let Some(rest) = line.strip_prefix('-') {
                hunk.lines.push(HunkLine::Remove(rest.to_string()));
            } else if let Some(rest) = line.strip_prefix('+') {
                hunk.lines.push(HunkLine::Add(rest.to_string()));
            } else {
                return Err(PatchError::Malformed(format!(
                    "unexpected line in hunk {}: {line}",
                    hunk.id
                )));
            }
        }
        trim_bare_tail(&mut hunks, &mut bare_tail);

        if hunks.is_empty() {
            return Err(PatchError::Malformed("patch contains no hunks".to_string()));
        }
        Ok(Self { hunks })
    }

    /// Apply every hunk to `original`.
    ///
    /// Returns the patched text, or the ids of every hunk that failed.
    pub fn apply(&self, original: &str) -> Result<String, Vec<usize>> {
        let had_trailing_newline = original.ends_with('\n');
        let mut lines: Vec<String> = original.split('\n').map(str::to_string).collect();
        if had_trailing_newline || original.is_empty() {
            lines.pop();
        }

        let mut offset: isize = 0;
        let mut failed = Vec::new();
        for hunk in &self.hunks {
            let old = hunk.old_lines();
            let new = hunk.new_lines();
            let anchor = hunk.anchor() as isize;
            let expected = (anchor + offset).max(0) as usize;

            match locate(&lines, &old, expected) {
                Some(pos) => {
                    lines.splice(pos..pos + old.len(), new.iter().map(|s| s.to_string()));
                    offset = pos as isize - anchor + new.len() as isize - old.len() as isize;
                }
                None => failed.push(hunk.id),
            }
        }

        if !failed.is_empty() {
            return Err(failed);
        }
        let trailing_newline = if self.hunks.iter().any(|h| h.new_missing_newline) {
            false
        } else if self.hunks.iter().any(|h| h.old_missing_newline) || original.is_empty() {
            true
        } else {
            had_trailing_newline
        };
        let mut patched = lines.join("\n");
        if trailing_newline && !lines.is_empty() {
            patched.push('\n');
        }
        Ok(patched)
    }
}

/// Drop the unprefixed empty lines that ended the last hunk; they separate
/// hunks rather than belong to them.
fn trim_bare_tail(hunks: &mut [Hunk], bare_tail: &mut usize) {
    if let Some(hunk) = hunks.last_mut() {
        let keep = hunk.lines.len().saturating_sub(*bare_tail);
        hunk.lines.truncate(keep);
    }
    *bare_tail = 0;
}

fn same_line(a: &str, b: &str) -> bool {
    a.trim_end_matches('\r') == b.trim_end_matches('\r')
}

fn matches_at(lines: &[String], old: &[&str], pos: usize) -> bool {
    pos + old.len() <= lines.len()
        && old
            .iter()
            .zip(&lines[pos..pos + old.len()])
            .all(|(want, have)| same_line(want, have))
}

/// Find `old` in `lines`, preferring the position nearest `expected`.
fn locate(lines: &[String], old: &[&str], expected: usize) -> Option<usize> {
    if old.is_empty() {
        return Some(expected.min(lines.len()));
    }
    if matches_at(lines, old, expected) {
        return Some(expected);
    }
    for distance in 1..=lines.len() {
        if let Some(before) = expected.checked_sub(distance) {
            if matches_at(lines, old, before) {
                return Some(before);
            }
        }
        let after = expected + distance;
        if after < lines.len() && matches_at(lines, old, after) {
            return Some(after);
        }
    }
    None
}

// ── Backup + apply ───────────────────────────────────────────────────────────

/// First free backup name: `<path><suffix>`, then `<path><suffix>.1`, ...
pub fn backup_path(path: &Path, suffix: &str) -> PathBuf {
    let base = format!("{}{suffix}", path.display());
    let first = PathBuf::from(&base);
    if !first.exists() {
        return first;
    }
    (1..)
        .map(|n| PathBuf::from(format!("{base}.{n}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(first)
}

/// Write a byte-identical copy of `path` next to it.  Never overwrites an
/// existing file.
fn create_backup(path: &Path, contents: &[u8], suffix: &str) -> Result<BackupRecord, PatchError> {
    let backup = backup_path(path, suffix);
    let backup_err = |source| PatchError::Backup {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&backup)
        .map_err(backup_err)?;
    file.write_all(contents).map_err(backup_err)?;
    file.sync_all().map_err(backup_err)?;

    if let Ok(meta) = fs::metadata(path) {
        let _ = fs::set_permissions(&backup, meta.permissions());
    }
    Ok(BackupRecord {
        original_path: path.to_path_buf(),
        backup_path: backup,
    })
}

/// Replace `path` with `contents` via a sibling temp file and rename.
fn write_atomic(path: &Path, contents: &str) -> Result<(), PatchError> {
    let write_err = |source| PatchError::Write {
        path: path.to_path_buf(),
        source,
    };
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        if let Ok(meta) = fs::metadata(path) {
            fs::set_permissions(&tmp, meta.permissions())?;
        }
        fs::rename(&tmp, path)
    })();

    if let Err(err) = result {
        let _ = fs::remove_file(&tmp);
        return Err(write_err(err));
    }
    Ok(())
}

/// Back up `path`, then apply `patch_text` to it.
///
/// - A malformed patch is rejected before anything is touched.
/// - If the backup cannot be created the original is left alone.
/// - If any hunk fails nothing is written; `hunks_failed` lists them all.
pub fn backup_then_apply_patch(
    path: &Path,
    patch_text: &str,
    backup_suffix: &str,
) -> Result<PatchOutcome, PatchError> {
    let patch = Patch::parse(patch_text)?;

    let bytes = fs::read(path).map_err(|source| PatchError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let original =
        String::from_utf8(bytes).map_err(|_| PatchError::NotUtf8(path.to_path_buf()))?;

    let backup = create_backup(path, original.as_bytes(), backup_suffix)?;
    info!(
        original = %backup.original_path.display(),
        backup = %backup.backup_path.display(),
        "backup created"
    );

    match patch.apply(&original) {
        Ok(patched) => {
            write_atomic(path, &patched)?;
            info!(path = %path.display(), hunks = patch.hunks.len(), "patch applied");
            Ok(PatchOutcome {
                applied: true,
                hunks_failed: Vec::new(),
                backup: Some(backup),
            })
        }
        Err(hunks_failed) => {
            warn!(path = %path.display(), ?hunks_failed, "patch rejected; file left unchanged");
            Ok(PatchOutcome {
                applied: false,
                hunks_failed,
                backup: Some(backup),
            })
        }
    }
}
