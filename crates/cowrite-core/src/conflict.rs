//! Conflict detection
//!
//! Overlap is decided on half-open char ranges (see [`Operation::span`]).
//! Detection never mutates file state; callers decide whether to record the
//! synthesized markers.

use crate::operation::{line_at, transform, OpKind, Operation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How a conflict came about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    /// Concurrent inserts into the same region
    Merge,
    /// At least one side removes text the other touches
    Overwrite,
    /// Flagged by a participant
    Manual,
}

/// A record of overlapping edits by two or more authors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictMarker {
    pub id: String,
    /// 1-based line
    pub line: u32,
    pub kind: ConflictKind,
    pub authors: BTreeSet<String>,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<u64>,
    pub created_at: u64,
}

impl ConflictMarker {
    pub fn new(line: u32, kind: ConflictKind, now: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            line,
            kind,
            authors: BTreeSet::new(),
            resolved: false,
            resolved_by: None,
            resolved_at: None,
            created_at: now,
        }
    }

    pub fn mark_resolved(&mut self, resolver: &str, now: u64) {
        self.resolved = true;
        self.resolved_by = Some(resolver.to_string());
        self.resolved_at = Some(now);
    }
}

/// Markers synthesized during one detection pass, one per conflicted line
#[derive(Debug, Default)]
pub struct Detection {
    markers: Vec<ConflictMarker>,
    /// Unresolved markers already on the file that the batch runs into
    existing: Vec<ConflictMarker>,
}

impl Detection {
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty() && self.existing.is_empty()
    }

    /// Newly synthesized markers
    pub fn new_markers(&self) -> &[ConflictMarker] {
        &self.markers
    }

    /// All markers the caller should report, new ones first
    pub fn into_markers(self) -> (Vec<ConflictMarker>, Vec<ConflictMarker>) {
        (self.markers, self.existing)
    }

    fn record(&mut self, line: u32, a: &Operation, b: &Operation, now: u64) {
        let kind = if a.kind == OpKind::Insert && b.kind == OpKind::Insert {
            ConflictKind::Merge
        } else {
            ConflictKind::Overwrite
        };

        let idx = match self.markers.iter().position(|m| m.line == line) {
            Some(idx) => idx,
            None => {
                self.markers.push(ConflictMarker::new(line, kind, now));
                self.markers.len() - 1
            }
        };

        let marker = &mut self.markers[idx];
        if kind == ConflictKind::Overwrite {
            marker.kind = ConflictKind::Overwrite;
        }
        marker.authors.insert(a.author.clone());
        marker.authors.insert(b.author.clone());
    }
}

/// Carry a char offset through operations applied after it
///
/// Text inserted exactly at the offset stays after it.
fn map_offset(offset: usize, ops: &[Operation]) -> usize {
    ops.iter().fold(offset, |pos, op| {
        let pos = if op.removed_len() > 0 && pos > op.position {
            pos - op.removed_len().min(pos - op.position)
        } else {
            pos
        };
        if op.inserted_len() > 0 && pos > op.position {
            pos.saturating_add(op.inserted_len())
        } else {
            pos
        }
    })
}

/// Line in the current content of an offset expressed before `later` ran
fn current_line(content: &str, offset: usize, later: &[Operation]) -> u32 {
    line_at(content, map_offset(offset, later))
}

/// Run every check the transform pipeline needs before committing a batch
///
/// `content` is the file's current content; `concurrent` is the sequence of
/// operations committed since the batch's base version. Batch positions
/// refer to the base content, and marker lines to the current one.
pub fn detect(
    content: &str,
    batch: &[Operation],
    concurrent: &[Operation],
    unresolved: &[ConflictMarker],
    now: u64,
) -> Detection {
    let mut detection = Detection::default();

    within_batch(&mut detection, content, batch, concurrent, now);
    against_concurrent(&mut detection, content, batch, concurrent, now);
    against_markers(&mut detection, content, batch, concurrent, unresolved);

    detection
}

/// Overlapping operations from different authors in the same batch
fn within_batch(
    detection: &mut Detection,
    content: &str,
    batch: &[Operation],
    concurrent: &[Operation],
    now: u64,
) {
    for (i, a) in batch.iter().enumerate() {
        for b in &batch[i + 1..] {
            if a.author != b.author && a.overlaps(b) {
                let line = current_line(content, a.position.min(b.position), concurrent);
                detection.record(line, a, b, now);
            }
        }
    }
}

/// Overlap with operations other authors committed since the base version
///
/// Each batch operation is rebased through the concurrent sequence so that
/// it is compared with every concurrent operation in that operation's own
/// coordinate space.
fn against_concurrent(
    detection: &mut Detection,
    content: &str,
    batch: &[Operation],
    concurrent: &[Operation],
    now: u64,
) {
    for op in batch {
        let mut rebased = op.clone();
        for (i, other) in concurrent.iter().enumerate() {
            if other.author != op.author && rebased.overlaps(other) {
                let offset = other.position.min(rebased.position);
                let line = current_line(content, offset, &concurrent[i..]);
                detection.record(line, other, &rebased, now);
            }
            rebased = transform(&rebased, other);
        }
    }
}

/// Operations whose line range covers a line with an unresolved marker
fn against_markers(
    detection: &mut Detection,
    content: &str,
    batch: &[Operation],
    concurrent: &[Operation],
    unresolved: &[ConflictMarker],
) {
    for marker in unresolved.iter().filter(|m| !m.resolved) {
        let hit = batch.iter().any(|op| {
            let (start, end) = op.span();
            if start == end {
                return false;
            }
            let first = current_line(content, start, concurrent);
            let last = current_line(content, end - 1, concurrent).max(first);
            (first..=last).contains(&marker.line)
        });

        if hit && !detection.existing.iter().any(|m| m.id == marker.id) {
            detection.existing.push(marker.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_delete_by_two_authors_is_one_marker() {
        let batch = vec![Operation::delete(0, 5, "x"), Operation::delete(0, 5, "y")];
        let detection = detect("hello world", &batch, &[], &[], 1);

        let markers = detection.new_markers();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].line, 1);
        assert_eq!(markers[0].kind, ConflictKind::Overwrite);
        assert!(markers[0].authors.contains("x"));
        assert!(markers[0].authors.contains("y"));
    }

    #[test]
    fn test_same_author_overlap_is_not_a_conflict() {
        let batch = vec![Operation::delete(0, 5, "x"), Operation::delete(3, 5, "x")];
        assert!(detect("hello world", &batch, &[], &[], 1).is_empty());
    }

    #[test]
    fn test_disjoint_concurrent_edit_passes() {
        let concurrent = vec![Operation::insert(11, "!", "x")];
        let batch = vec![Operation::insert(0, "Oh, ", "y")];
        assert!(detect("hello world!", &batch, &concurrent, &[], 1).is_empty());
    }

    #[test]
    fn test_overlapping_concurrent_edit_is_flagged() {
        let concurrent = vec![Operation::delete(0, 5, "x")];
        let batch = vec![Operation::replace(2, 2, "LL", "y")];
        let detection = detect(" world", &batch, &concurrent, &[], 1);

        let markers = detection.new_markers();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].authors.len(), 2);
    }

    #[test]
    fn test_concurrent_check_uses_rebased_positions() {
        // x inserted 4 chars at 0, then deleted what was originally 6..11
        let concurrent = vec![Operation::insert(0, "Oh, ", "x"), Operation::delete(10, 5, "x")];
        // y inserts at the original end: touches nothing x did
        let batch = vec![Operation::insert(11, "!", "y")];
        assert!(detect("Oh, hello ", &batch, &concurrent, &[], 1).is_empty());

        // y rewrites "world", which x deleted
        let batch = vec![Operation::replace(6, 5, "there", "y")];
        assert!(!detect("Oh, hello ", &batch, &concurrent, &[], 1).is_empty());
    }

    #[test]
    fn test_own_concurrent_edits_are_ignored() {
        let concurrent = vec![Operation::delete(0, 5, "x")];
        let batch = vec![Operation::delete(0, 5, "x")];
        assert!(detect(" world", &batch, &concurrent, &[], 1).is_empty());
    }

    #[test]
    fn test_unresolved_marker_blocks_edits_on_its_line() {
        let content = "one\ntwo\nthree";
        let marker = ConflictMarker::new(2, ConflictKind::Manual, 1);

        let on_line = vec![Operation::insert(5, "X", "y")];
        let detection = detect(content, &on_line, &[], std::slice::from_ref(&marker), 1);
        let (fresh, existing) = detection.into_markers();
        assert!(fresh.is_empty());
        assert_eq!(existing.len(), 1);

        let elsewhere = vec![Operation::insert(0, "X", "y")];
        assert!(detect(content, &elsewhere, &[], &[marker], 1).is_empty());
    }

    #[test]
    fn test_marker_line_follows_concurrent_newlines() {
        // base "abcdef\nxy"; x prepended two lines since then
        let concurrent = vec![Operation::insert(0, "1\n2\n", "x")];
        let batch = vec![Operation::delete(7, 1, "y"), Operation::delete(7, 1, "z")];

        let detection = detect("1\n2\nabcdef\nxy", &batch, &concurrent, &[], 1);

        let markers = detection.new_markers();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].line, 4);
    }

    #[test]
    fn test_stale_edit_hits_marker_on_its_current_line() {
        let content = "1\n2\nabcdef\nxy";
        let concurrent = vec![Operation::insert(0, "1\n2\n", "x")];
        let batch = vec![Operation::insert(7, "Z", "y")];

        let marker = ConflictMarker::new(4, ConflictKind::Manual, 1);
        let detection = detect(content, &batch, &concurrent, std::slice::from_ref(&marker), 1);
        let (_, existing) = detection.into_markers();
        assert_eq!(existing.len(), 1);

        let marker = ConflictMarker::new(3, ConflictKind::Manual, 1);
        assert!(detect(content, &batch, &concurrent, &[marker], 1).is_empty());
    }

    #[test]
    fn test_resolved_marker_is_ignored() {
        let mut marker = ConflictMarker::new(1, ConflictKind::Manual, 1);
        marker.mark_resolved("owner", 2);

        let batch = vec![Operation::insert(0, "X", "y")];
        assert!(detect("abc", &batch, &[], &[marker], 3).is_empty());
    }
}
