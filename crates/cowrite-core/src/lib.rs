//! Cowrite Core - collaborative editing engine
//!
//! This crate provides the authoritative state of live editing sessions:
//! - Operational transform of concurrent edit batches
//! - Conflict detection, resolution and three-way merge
//! - Advisory line-range locks with automatic expiry
//! - A session registry with per-session serialization and event fan-out
//! - Periodic maintenance (expiry, presence aging, durability)

pub mod conflict;
pub mod error;
pub mod event;
pub mod lock;
pub mod operation;
pub mod persistence;
pub mod registry;
pub mod resolve;
pub mod scheduler;
pub mod session;
pub mod transform;

pub use conflict::{ConflictKind, ConflictMarker};
pub use error::{Error, Result};
pub use event::{OutboundEvent, Outcome, SessionEvent};
pub use lock::{FileLock, LockTable};
pub use operation::{apply_all, transform, transform_sequence, OpKind, Operation};
pub use persistence::{
    ChangeLog, ChangeRecord, FileSeed, RosterEntry, SessionSeed, SessionSource, StorageError,
};
pub use registry::{RegistryStats, SessionRegistry};
pub use resolve::{three_way_merge, MergeConflict, MergeResult, ResolutionStrategy};
pub use scheduler::{MaintenanceConfig, MaintenanceHandle, MaintenanceScheduler};
pub use session::{
    now_millis, CollaborationEvent, Cursor, EventKind, FileState, Participant, Presence, Revision,
    Role, Selection, SessionId, SessionState,
};
pub use transform::{apply_batch, BatchOutcome};
