//! Advisory line-range locks
//!
//! Locks only arbitrate between lock requests. Nothing here stops an edit
//! from touching a locked range; that policy belongs to the caller.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A held line-range reservation on one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLock {
    pub id: String,
    pub holder: String,
    /// Inclusive
    pub start_line: u32,
    /// Inclusive
    pub end_line: u32,
    pub acquired_at: u64,
    pub duration_secs: u64,
}

impl FileLock {
    pub fn new(
        holder: impl Into<String>,
        start_line: u32,
        end_line: u32,
        duration_secs: u64,
        now: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            holder: holder.into(),
            start_line,
            end_line,
            acquired_at: now,
            duration_secs,
        }
    }

    pub fn expires_at(&self) -> u64 {
        self.acquired_at
            .saturating_add(self.duration_secs.saturating_mul(1000))
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at()
    }

    /// Closed-interval overlap with `[start, end]`
    pub fn overlaps(&self, start: u32, end: u32) -> bool {
        self.start_line <= end && start <= self.end_line
    }
}

/// All locks held on a single file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockTable {
    locks: Vec<FileLock>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileLock> {
        self.locks.iter()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Grant a lock iff no held lock overlaps the range
    ///
    /// Never waits. Expired locks are dropped first and returned alongside
    /// the grant so the caller can announce them.
    pub fn request(
        &mut self,
        holder: &str,
        start_line: u32,
        end_line: u32,
        duration_secs: u64,
        now: u64,
    ) -> Result<(FileLock, Vec<FileLock>)> {
        if start_line > end_line {
            return Err(Error::InvalidOperation(format!(
                "lock range {}-{} is inverted",
                start_line, end_line
            )));
        }
        if duration_secs == 0 {
            return Err(Error::InvalidOperation("lock duration must be positive".into()));
        }

        let expired = self.purge_expired(now);

        let conflicting: Vec<FileLock> = self
            .locks
            .iter()
            .filter(|lock| lock.overlaps(start_line, end_line))
            .cloned()
            .collect();

        if !conflicting.is_empty() {
            return Err(Error::LockDenied { conflicting });
        }

        let lock = FileLock::new(holder, start_line, end_line, duration_secs, now);
        self.locks.push(lock.clone());
        Ok((lock, expired))
    }

    /// Release the holder's lock on exactly this range; no-op if absent
    pub fn release(&mut self, holder: &str, start_line: u32, end_line: u32) -> Option<FileLock> {
        let idx = self.locks.iter().position(|lock| {
            lock.holder == holder && lock.start_line == start_line && lock.end_line == end_line
        })?;
        Some(self.locks.remove(idx))
    }

    pub fn release_by_id(&mut self, lock_id: &str) -> Option<FileLock> {
        let idx = self.locks.iter().position(|lock| lock.id == lock_id)?;
        Some(self.locks.remove(idx))
    }

    /// Release every lock the holder has on this file
    pub fn release_all(&mut self, holder: &str) -> Vec<FileLock> {
        let (released, kept) = std::mem::take(&mut self.locks)
            .into_iter()
            .partition(|lock| lock.holder == holder);
        self.locks = kept;
        released
    }

    pub fn purge_expired(&mut self, now: u64) -> Vec<FileLock> {
        let (expired, kept) = std::mem::take(&mut self.locks)
            .into_iter()
            .partition(|lock| lock.is_expired(now));
        self.locks = kept;
        expired
    }
}
