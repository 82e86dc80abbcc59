//! Operational transform pipeline
//!
//! A batch is either committed whole, with exactly one version bump, or not
//! at all.

use crate::conflict::{self, ConflictMarker};
use crate::error::{Error, Result};
use crate::operation::{apply_all, batch_order, transform, transform_sequence, Operation};
use crate::session::FileState;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// What happened to a submitted batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum BatchOutcome {
    /// Committed; `operations` are the rebased ops as applied
    Applied {
        version: u64,
        operations: Vec<Operation>,
    },
    /// Refused; nothing was applied
    Conflict { markers: Vec<ConflictMarker> },
}

/// Sort a batch and rewrite it into a sequence
///
/// Input positions all refer to the same content. Each operation of the
/// output is expressed against the content left by the ones before it.
pub fn sequence(batch: &[Operation]) -> Vec<Operation> {
    let mut sorted = batch.to_vec();
    sorted.sort_by(batch_order);

    let mut accepted: Vec<Operation> = Vec::with_capacity(sorted.len());
    for op in sorted {
        let rebased = accepted.iter().fold(op, |current, earlier| transform(&current, earlier));
        accepted.push(rebased);
    }
    accepted
}

/// Run a batch against the authoritative file state
pub fn apply_batch(
    file: &mut FileState,
    author: &str,
    operations: Vec<Operation>,
    base_version: u64,
    now: u64,
) -> Result<BatchOutcome> {
    if operations.is_empty() {
        return Err(Error::InvalidOperation("empty batch".into()));
    }

    let concurrent = file
        .concurrent_since(base_version)
        .ok_or(Error::VersionConflict {
            base: base_version,
            current: file.version,
        })?;

    // Walk the concurrent sequence backwards to the base content's length
    let base_len = concurrent
        .iter()
        .rev()
        .fold(file.content.chars().count(), |len, op| {
            len.saturating_sub(op.inserted_len()) + op.removed_len()
        });
    for op in &operations {
        op.validate(base_len)?;
    }

    let unresolved = file.unresolved_conflicts();
    let detection = conflict::detect(&file.content, &operations, &concurrent, &unresolved, now);

    if !detection.is_empty() {
        let (fresh, existing) = detection.into_markers();
        info!(
            file = %file.id,
            base = base_version,
            version = file.version,
            new_markers = fresh.len(),
            existing_markers = existing.len(),
            "Batch refused: conflicting edits"
        );

        file.conflicts.extend(fresh.iter().cloned());
        let mut markers = fresh;
        markers.extend(existing);
        return Ok(BatchOutcome::Conflict { markers });
    }

    let sequenced = sequence(&operations);
    let rebased = transform_sequence(&sequenced, &concurrent);
    let content = apply_all(&file.content, &rebased)?;

    let version = file.commit(author, rebased.clone(), content, now);
    debug!(
        file = %file.id,
        author = author,
        base = base_version,
        version = version,
        ops = rebased.len(),
        "Batch applied"
    );

    Ok(BatchOutcome::Applied {
        version,
        operations: rebased,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictKind;

    fn file(content: &str) -> FileState {
        FileState::new("f1", "f1.txt", content, 1, 0)
    }

    fn applied_version(outcome: &BatchOutcome) -> u64 {
        match outcome {
            BatchOutcome::Applied { version, .. } => *version,
            other => panic!("expected applied, got {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_disjoint_inserts() {
        let mut f = file("hello world");

        let x = apply_batch(&mut f, "x", vec![Operation::insert(11, "!", "x")], 1, 1).unwrap();
        assert_eq!(applied_version(&x), 2);
        assert_eq!(f.content, "hello world!");

        let y = apply_batch(&mut f, "y", vec![Operation::insert(0, "Oh, ", "y")], 1, 2).unwrap();
        assert_eq!(applied_version(&y), 3);
        assert_eq!(f.content, "Oh, hello world!");
    }

    #[test]
    fn test_same_delete_from_two_authors_in_one_batch() {
        let mut f = file("hello world");
        let batch = vec![Operation::delete(0, 5, "x"), Operation::delete(0, 5, "y")];

        let outcome = apply_batch(&mut f, "x", batch, 1, 1).unwrap();

        match outcome {
            BatchOutcome::Conflict { markers } => {
                assert_eq!(markers.len(), 1);
                assert!(markers[0].authors.contains("x") && markers[0].authors.contains("y"));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(f.version, 1);
        assert_eq!(f.content, "hello world");
        assert_eq!(f.conflicts.len(), 1);
    }

    #[test]
    fn test_stale_overlapping_delete_is_refused() {
        let mut f = file("hello world");

        apply_batch(&mut f, "x", vec![Operation::delete(0, 5, "x")], 1, 1).unwrap();
        let outcome = apply_batch(&mut f, "y", vec![Operation::delete(0, 5, "y")], 1, 2).unwrap();

        match outcome {
            BatchOutcome::Conflict { markers } => {
                assert_eq!(markers[0].kind, ConflictKind::Overwrite);
                assert_eq!(markers[0].authors.len(), 2);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(f.version, 2);
        assert_eq!(f.content, " world");
    }

    #[test]
    fn test_version_bumps_once_per_batch() {
        let mut f = file("abc");
        let batch = vec![
            Operation::insert(0, "1", "x"),
            Operation::insert(1, "2", "x"),
            Operation::delete(2, 1, "x"),
        ];

        let outcome = apply_batch(&mut f, "x", batch, 1, 1).unwrap();
        assert_eq!(applied_version(&outcome), 2);
        assert_eq!(f.content, "1a2b");
    }

    #[test]
    fn test_batch_positions_refer_to_base_content() {
        let mut f = file("0123456789");
        // submitted out of order; both offsets refer to the original text
        let batch = vec![Operation::delete(6, 2, "x"), Operation::insert(2, "ab", "x")];

        apply_batch(&mut f, "x", batch, 1, 1).unwrap();
        assert_eq!(f.content, "01ab234589");
    }

    #[test]
    fn test_same_author_same_offset_inserts_keep_timestamp_order() {
        let mut f = file("");
        let batch = vec![
            Operation::insert(0, "b", "x").with_timestamp(2),
            Operation::insert(0, "a", "x").with_timestamp(1),
        ];

        apply_batch(&mut f, "x", batch, 1, 1).unwrap();
        assert_eq!(f.content, "ab");
    }

    #[test]
    fn test_overlapping_deletes_in_batch_remove_union() {
        let mut f = file("0123456789");
        let batch = vec![Operation::delete(0, 5, "x"), Operation::delete(3, 5, "x")];

        apply_batch(&mut f, "x", batch, 1, 1).unwrap();
        assert_eq!(f.content, "89");
    }

    #[test]
    fn test_invalid_batches_leave_state_untouched() {
        let mut f = file("abc");

        assert!(apply_batch(&mut f, "x", vec![], 1, 1).is_err());
        assert!(matches!(
            apply_batch(&mut f, "x", vec![Operation::insert(0, "z", "x")], 5, 1),
            Err(Error::VersionConflict { base: 5, current: 1 })
        ));
        assert!(matches!(
            apply_batch(
                &mut f,
                "x",
                vec![Operation::insert(0, "z", "x"), Operation::delete(2, 9, "x")],
                1,
                1
            ),
            Err(Error::InvalidOperation(_))
        ));

        assert_eq!(f.version, 1);
        assert_eq!(f.content, "abc");
    }

    #[test]
    fn test_oversized_delete_is_rejected_before_detection() {
        let mut f = file("hello");
        let result = apply_batch(&mut f, "x", vec![Operation::delete(1, usize::MAX, "x")], 1, 1);
        assert!(matches!(result, Err(Error::InvalidOperation(_))));

        // stale against another author's edit: still rejected, no marker left behind
        apply_batch(&mut f, "y", vec![Operation::insert(0, ">", "y")], 1, 2).unwrap();
        let result = apply_batch(&mut f, "x", vec![Operation::delete(1, usize::MAX, "x")], 1, 3);
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
        assert!(f.conflicts.is_empty());
        assert_eq!(f.version, 2);
        assert_eq!(f.content, ">hello");
    }

    #[test]
    fn test_stale_batch_is_checked_against_base_length() {
        let mut f = file("abc");
        apply_batch(&mut f, "y", vec![Operation::delete(0, 2, "y")], 1, 1).unwrap();
        assert_eq!(f.content, "c");

        // "abc" had 3 chars at version 1, so position 3 is still in range
        let outcome = apply_batch(&mut f, "x", vec![Operation::insert(3, "!", "x")], 1, 2).unwrap();
        assert_eq!(applied_version(&outcome), 3);
        assert_eq!(f.content, "c!");

        let result = apply_batch(&mut f, "x", vec![Operation::insert(4, "!", "x")], 1, 3);
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_commutativity_of_disjoint_batches() {
        let base = "fn main() {\n    println!(\"hi\");\n}\n";
        let a = vec![
            Operation::insert(0, "// header\n", "alice"),
            Operation::replace(3, 4, "start", "alice"),
        ];
        let b = vec![Operation::delete(16, 8, "bob"), Operation::insert(33, "// end\n", "bob")];

        let mut left = FileState::new("f", "f.rs", base, 1, 0);
        apply_batch(&mut left, "alice", a.clone(), 1, 1).unwrap();
        apply_batch(&mut left, "bob", b.clone(), 1, 2).unwrap();

        let mut right = FileState::new("f", "f.rs", base, 1, 0);
        apply_batch(&mut right, "bob", b, 1, 1).unwrap();
        apply_batch(&mut right, "alice", a, 1, 2).unwrap();

        assert_eq!(left.content, right.content);
        assert_eq!(left.version, 3);
        assert_eq!(right.version, 3);
    }

    #[test]
    fn test_stale_base_beyond_history_is_a_version_conflict() {
        let mut f = FileState::new("f", "f", "x", 40, 0);
        let result = apply_batch(&mut f, "y", vec![Operation::insert(0, "a", "y")], 3, 1);
        assert!(matches!(result, Err(Error::VersionConflict { .. })));
    }
}
