//! Edit operations and pairwise transform rules
//!
//! Positions and lengths are measured in `char`s. Two operations are
//! "in the same coordinate space" when both were authored against the same
//! content; [`transform`] rebases one of them so it can be applied after the
//! other.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Kind of edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpKind {
    Insert,
    Delete,
    Replace,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Insert => write!(f, "insert"),
            OpKind::Delete => write!(f, "delete"),
            OpKind::Replace => write!(f, "replace"),
        }
    }
}

/// A single edit intent against a file's text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OpKind,
    pub position: usize,
    /// Characters removed (delete/replace)
    #[serde(default)]
    pub length: usize,
    /// Characters inserted (insert/replace)
    #[serde(default)]
    pub text: String,
    /// Stamped by the server from the submitting participant
    #[serde(default)]
    pub author: String,
    /// Client timestamp in ms, used as the secondary tie-break
    #[serde(default)]
    pub timestamp: u64,
    /// File version the author believed current
    #[serde(default)]
    pub base_version: u64,
}

impl Operation {
    pub fn insert(position: usize, text: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Insert,
            position,
            length: 0,
            text: text.into(),
            author: author.into(),
            timestamp: 0,
            base_version: 0,
        }
    }

    pub fn delete(position: usize, length: usize, author: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Delete,
            position,
            length,
            text: String::new(),
            author: author.into(),
            timestamp: 0,
            base_version: 0,
        }
    }

    pub fn replace(
        position: usize,
        length: usize,
        text: impl Into<String>,
        author: impl Into<String>,
    ) -> Self {
        Self {
            kind: OpKind::Replace,
            position,
            length,
            text: text.into(),
            author: author.into(),
            timestamp: 0,
            base_version: 0,
        }
    }

    pub fn with_base_version(mut self, version: u64) -> Self {
        self.base_version = version;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Number of chars in `text`
    pub fn text_len(&self) -> usize {
        self.text.chars().count()
    }

    /// Chars removed from the content when applied
    pub fn removed_len(&self) -> usize {
        match self.kind {
            OpKind::Insert => 0,
            OpKind::Delete | OpKind::Replace => self.length,
        }
    }

    /// Chars added to the content when applied
    pub fn inserted_len(&self) -> usize {
        match self.kind {
            OpKind::Delete => 0,
            OpKind::Insert | OpKind::Replace => self.text_len(),
        }
    }

    /// Half-open range `[start, end)` this operation touches
    ///
    /// An insert spans its own text length, so two inserts at the same
    /// offset touch each other. Empty ranges touch nothing.
    pub fn span(&self) -> (usize, usize) {
        let len = match self.kind {
            OpKind::Insert => self.text_len(),
            OpKind::Delete => self.length,
            OpKind::Replace => self.length.max(self.text_len()),
        };
        (self.position, self.position.saturating_add(len))
    }

    /// First char offset past the removed range; `None` on overflow
    pub fn end(&self) -> Option<usize> {
        self.position.checked_add(self.removed_len())
    }

    /// Check that this operation fits content of `len` chars
    pub fn validate(&self, len: usize) -> Result<()> {
        match self.end() {
            Some(end) if end <= len => Ok(()),
            _ => Err(Error::InvalidOperation(format!(
                "{} of {} chars at {} does not fit content of {} chars",
                self.kind, self.length, self.position, len
            ))),
        }
    }

    /// Whether the two operations touch overlapping ranges
    pub fn overlaps(&self, other: &Operation) -> bool {
        let (a_start, a_end) = self.span();
        let (b_start, b_end) = other.span();

        if a_start == a_end || b_start == b_end {
            return false;
        }

        a_start < b_end && b_start < a_end
    }

    /// Insert-insert tie-break: larger author id, then later timestamp, goes right
    fn goes_after(&self, other: &Operation) -> bool {
        (self.author.as_str(), self.timestamp) >= (other.author.as_str(), other.timestamp)
    }

    /// Apply this operation to `content` in place
    pub fn apply_to(&self, content: &mut String) -> Result<()> {
        let start = byte_offset(content, self.position).ok_or_else(|| {
            Error::InvalidOperation(format!(
                "{} at {} is beyond the end of the content",
                self.kind, self.position
            ))
        })?;
        let end = self
            .end()
            .and_then(|end| byte_offset(content, end))
            .ok_or_else(|| {
                Error::InvalidOperation(format!(
                    "{} of {} chars at {} runs past the end of the content",
                    self.kind, self.length, self.position
                ))
            })?;

        match self.kind {
            OpKind::Delete => content.replace_range(start..end, ""),
            OpKind::Insert | OpKind::Replace => content.replace_range(start..end, &self.text),
        }
        Ok(())
    }
}

/// Apply a sequence of operations, returning the new content
///
/// The input is left untouched if any operation fails.
pub fn apply_all(content: &str, operations: &[Operation]) -> Result<String> {
    let mut out = content.to_string();
    for op in operations {
        op.apply_to(&mut out)?;
    }
    Ok(out)
}

/// Rebase `op` so it applies after `against`
///
/// Both operations must be expressed against the same content.
pub fn transform(op: &Operation, against: &Operation) -> Operation {
    match against.kind {
        OpKind::Insert => past_insert(op, against),
        OpKind::Delete => past_delete(op, against.position, against.length),
        OpKind::Replace => {
            let op = past_delete(op, against.position, against.length);
            past_insert(&op, against)
        }
    }
}

/// Transform a sequence of operations against a concurrent sequence
///
/// Both inputs are sequential (each element expressed against the content
/// left by the previous one) and start from the same content. The result
/// applies after all of `against`.
pub fn transform_sequence(ops: &[Operation], against: &[Operation]) -> Vec<Operation> {
    let mut against = against.to_vec();

    ops.iter()
        .map(|op| {
            let mut current = op.clone();
            for other in against.iter_mut() {
                let rebased = transform(&current, other);
                *other = transform(other, &current);
                current = rebased;
            }
            current
        })
        .collect()
}

/// Order used before self-transforming a batch
///
/// Ascending position; at equal positions inserts come first, ordered by
/// author then timestamp. Everything else keeps its submission order.
pub fn batch_order(a: &Operation, b: &Operation) -> Ordering {
    let rank = |op: &Operation| u8::from(op.kind != OpKind::Insert);

    a.position
        .cmp(&b.position)
        .then_with(|| rank(a).cmp(&rank(b)))
        .then_with(|| match (a.kind, b.kind) {
            (OpKind::Insert, OpKind::Insert) => (a.author.as_str(), a.timestamp)
                .cmp(&(b.author.as_str(), b.timestamp)),
            _ => Ordering::Equal,
        })
}

fn past_insert(op: &Operation, insert: &Operation) -> Operation {
    let at = insert.position;
    let n = insert.inserted_len();
    let mut out = op.clone();

    if n == 0 {
        return out;
    }

    let shift = match op.position.cmp(&at) {
        Ordering::Greater => true,
        Ordering::Equal => op.kind != OpKind::Insert || op.goes_after(insert),
        Ordering::Less => false,
    };

    if shift {
        out.position = out.position.saturating_add(n);
    } else if op.kind != OpKind::Insert
        && op.position < at
        && at < op.position.saturating_add(op.length)
    {
        // text landed inside the removed range; the removal swallows it
        out.length = out.length.saturating_add(n);
    }

    out
}

fn past_delete(op: &Operation, at: usize, len: usize) -> Operation {
    let mut out = op.clone();

    if len == 0 {
        return out;
    }

    let del_end = at.saturating_add(len);

    match op.kind {
        OpKind::Insert => {
            if op.position >= del_end {
                out.position -= len;
            } else if op.position > at {
                out.position = at;
            }
        }
        OpKind::Delete | OpKind::Replace => {
            let start = op.position;
            let end = start.saturating_add(op.length);

            if end <= at {
                // entirely before
            } else if start >= del_end {
                out.position -= len;
            } else {
                // overlapping removals merge into their union
                let overlap = end.min(del_end) - start.max(at);
                out.position = start.min(at);
                out.length = op.length - overlap;
            }
        }
    }

    out
}

/// Convert a char offset into a byte offset; `None` when out of range
pub(crate) fn byte_offset(s: &str, pos: usize) -> Option<usize> {
    s.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(s.len()))
        .nth(pos)
}

/// 1-based line number of a char offset, clamped to the content
pub fn line_at(content: &str, offset: usize) -> u32 {
    let newlines = content.chars().take(offset).filter(|&c| c == '\n').count();
    newlines as u32 + 1
}
