//! Conflict resolution and three-way merge

use crate::error::{Error, Result};
use crate::operation::{apply_all, transform_sequence, Operation};
use crate::session::FileState;
use crate::transform::sequence;
use serde::{Deserialize, Serialize};
use tracing::info;

pub const MINE_MARKER: &str = "<<<<<<< mine";
pub const SEPARATOR_MARKER: &str = "=======";
pub const THEIRS_MARKER: &str = ">>>>>>> theirs";

/// How to settle a conflict marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    /// Keep the server copy as is
    AcceptMine,
    /// Install the competing content the caller supplies
    AcceptTheirs,
    /// Install caller-merged content verbatim
    MergeManual,
    /// Bracket the conflicted line with conflict markers
    MergeAuto,
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionStrategy::AcceptMine => write!(f, "accept-mine"),
            ResolutionStrategy::AcceptTheirs => write!(f, "accept-theirs"),
            ResolutionStrategy::MergeManual => write!(f, "merge-manual"),
            ResolutionStrategy::MergeAuto => write!(f, "merge-auto"),
        }
    }
}

impl std::str::FromStr for ResolutionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "accept-mine" | "mine" => Ok(ResolutionStrategy::AcceptMine),
            "accept-theirs" | "theirs" => Ok(ResolutionStrategy::AcceptTheirs),
            "merge-manual" | "manual" => Ok(ResolutionStrategy::MergeManual),
            "merge-auto" | "auto" => Ok(ResolutionStrategy::MergeAuto),
            _ => Err(Error::InvalidOperation(format!("Unknown strategy: {}", s))),
        }
    }
}

/// Settle one conflict marker, returning the new file version
///
/// Every strategy bumps the version, including `accept-mine`. Content
/// changes are recorded as a revision so stale batches that touch the
/// rewritten text are still caught.
pub fn resolve_conflict(
    file: &mut FileState,
    conflict_id: &str,
    strategy: ResolutionStrategy,
    merged_content: Option<String>,
    resolver: &str,
    now: u64,
) -> Result<u64> {
    let marker = file
        .conflicts
        .iter()
        .find(|m| m.id == conflict_id)
        .ok_or_else(|| Error::ConflictNotFound(conflict_id.to_string()))?;

    if marker.resolved {
        return Err(Error::ConflictAlreadyResolved(conflict_id.to_string()));
    }
    let line = marker.line;

    let operations = match strategy {
        ResolutionStrategy::AcceptMine => Vec::new(),
        ResolutionStrategy::AcceptTheirs | ResolutionStrategy::MergeManual => {
            let content =
                merged_content.ok_or_else(|| Error::MissingContent(strategy.to_string()))?;
            if content == file.content {
                Vec::new()
            } else {
                let len = file.content.chars().count();
                vec![Operation::replace(0, len, content, resolver).with_timestamp(now)]
            }
        }
        ResolutionStrategy::MergeAuto => bracket_line(&file.content, line, resolver, now),
    };

    let content = apply_all(&file.content, &operations)?;
    let version = file.commit(resolver, operations, content, now);

    if let Some(marker) = file.conflicts.iter_mut().find(|m| m.id == conflict_id) {
        marker.mark_resolved(resolver, now);
    }

    info!(
        file = %file.id,
        conflict = conflict_id,
        strategy = %strategy,
        version = version,
        "Conflict resolved"
    );

    Ok(version)
}

/// Inserts that wrap a 1-based line in conflict markers
fn bracket_line(content: &str, line: u32, author: &str, now: u64) -> Vec<Operation> {
    let (start, end, has_newline) = line_bounds(content, line);

    let opening = format!("{}\n", MINE_MARKER);
    let mut closing = String::new();
    if !has_newline {
        closing.push('\n');
    }
    closing.push_str(SEPARATOR_MARKER);
    closing.push('\n');
    closing.push_str(THEIRS_MARKER);
    closing.push('\n');

    let shift = opening.chars().count();
    vec![
        Operation::insert(start, opening, author).with_timestamp(now),
        Operation::insert(end + shift, closing, author).with_timestamp(now),
    ]
}

/// Char range of a 1-based line, clamped to the last line
///
/// `end` points past the line's newline when it has one.
fn line_bounds(content: &str, line: u32) -> (usize, usize, bool) {
    let target = line.max(1);
    let mut current = 1;
    let mut start = 0;

    for (offset, c) in content.chars().enumerate() {
        if c == '\n' {
            if current == target {
                return (start, offset + 1, true);
            }
            current += 1;
            start = offset + 1;
        }
    }

    (start, content.chars().count(), false)
}

/// A "their" operation held back because it overlaps one of mine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConflict {
    pub theirs: Operation,
    pub mine: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub content: String,
    pub conflicts: Vec<MergeConflict>,
    pub success: bool,
}

/// Merge two sets of operations authored against the same base
///
/// All of `mine` is applied. Each of `theirs` that overlaps any of `mine`
/// is reported instead of applied; the rest are rebased past `mine` and
/// applied.
pub fn three_way_merge(
    base: &str,
    theirs: &[Operation],
    mine: &[Operation],
) -> Result<MergeResult> {
    let base_len = base.chars().count();
    for op in theirs.iter().chain(mine) {
        op.validate(base_len)?;
    }

    let mine_seq = sequence(mine);
    let merged = apply_all(base, &mine_seq)?;

    let mut conflicts = Vec::new();
    let mut clean = Vec::new();

    for op in theirs {
        match mine.iter().find(|m| m.overlaps(op)) {
            Some(m) => conflicts.push(MergeConflict {
                theirs: op.clone(),
                mine: m.clone(),
            }),
            None => clean.push(op.clone()),
        }
    }

    let theirs_seq = transform_sequence(&sequence(&clean), &mine_seq);
    let content = apply_all(&merged, &theirs_seq)?;

    Ok(MergeResult {
        success: conflicts.is_empty(),
        content,
        conflicts,
    })
}
