/// Change-set rendering: unified text and structured JSON
use crate::config::types::{ChangeKind, ChangeRecord, ChangeSet, Result};
use crate::utils::hashing::Digest;
use crate::utils::tree::{join_rel, read_entry};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffFormat {
    #[default]
    Unified,
    Json,
}

/// File and line counts over a change-set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub added: usize,
    pub deleted: usize,
    pub modified: usize,
    pub lines_added: usize,
    pub lines_removed: usize,
}

/// One entry of the JSON rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub kind: ChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    pub size: u64,
    pub binary: bool,
    pub lines_added: usize,
    pub lines_removed: usize,
}

struct Rendered {
    text: String,
    binary: bool,
    lines_added: usize,
    lines_removed: usize,
}

/// Render `records` comparing `base` (pre-state) against `mount` (post-state)
pub fn render<'a, I>(base: &Path, mount: &Path, records: I, format: DiffFormat) -> Result<(DiffSummary, String)>
where
    I: IntoIterator<Item = &'a ChangeRecord>,
{
    let mut summary = DiffSummary::default();
    let mut unified = String::new();
    let mut entries = Vec::new();

    for record in records {
        match record.kind {
            ChangeKind::Added => summary.added += 1,
            ChangeKind::Deleted => summary.deleted += 1,
            ChangeKind::Modified => summary.modified += 1,
        }
        let rendered = render_record(base, mount, record)?;
        summary.lines_added += rendered.lines_added;
        summary.lines_removed += rendered.lines_removed;

        match format {
            DiffFormat::Unified => unified.push_str(&rendered.text),
            DiffFormat::Json => entries.push(FileDiff {
                path: record.path.clone(),
                kind: record.kind,
                digest: record.digest,
                size: record.size,
                binary: rendered.binary,
                lines_added: rendered.lines_added,
                lines_removed: rendered.lines_removed,
            }),
        }
    }

    let text = match format {
        DiffFormat::Unified => unified,
        DiffFormat::Json => serde_json::to_string_pretty(&entries)?,
    };
    Ok((summary, text))
}

/// Unified diff over a whole change-set
pub fn unified(base: &Path, mount: &Path, changes: &ChangeSet) -> Result<(DiffSummary, String)> {
    render(base, mount, changes.iter(), DiffFormat::Unified)
}

fn read_side(root: &Path, rel: &str, present: bool) -> Result<Option<Vec<u8>>> {
    if !present {
        return Ok(None);
    }
    match join_rel(root, rel) {
        // A symlink diffs as its target path
        Some(path) => match read_entry(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        },
        None => Ok(None),
    }
}

fn render_record(base: &Path, mount: &Path, record: &ChangeRecord) -> Result<Rendered> {
    let old = read_side(base, &record.path, record.kind != ChangeKind::Added)?;
    let new = read_side(mount, &record.path, record.kind != ChangeKind::Deleted)?;

    let old_header = if old.is_some() {
        format!("a/{}", record.path)
    } else {
        "/dev/null".to_string()
    };
    let new_header = if new.is_some() {
        format!("b/{}", record.path)
    } else {
        "/dev/null".to_string()
    };

    let old_bytes = old.unwrap_or_default();
    let new_bytes = new.unwrap_or_default();
    let (old_text, new_text) = match (std::str::from_utf8(&old_bytes), std::str::from_utf8(&new_bytes)) {
        (Ok(o), Ok(n)) => (o, n),
        _ => {
            return Ok(Rendered {
                text: format!("Binary files {} and {} differ\n", old_header, new_header),
                binary: true,
                lines_added: 0,
                lines_removed: 0,
            })
        }
    };

    let diff = TextDiff::from_lines(old_text, new_text);
    let mut lines_added = 0;
    let mut lines_removed = 0;
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => lines_added += 1,
            ChangeTag::Delete => lines_removed += 1,
            ChangeTag::Equal => {}
        }
    }

    let text = diff
        .unified_diff()
        .context_radius(3)
        .header(&old_header, &new_header)
        .to_string();

    Ok(Rendered {
        text,
        binary: false,
        lines_added,
        lines_removed,
    })
}
