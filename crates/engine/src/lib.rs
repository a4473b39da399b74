//! Storage engine interface for the tandem XA coordinator
//!
//! The coordinator drives storage engines exclusively through the
//! [`StorageEngine`] capability trait: two-phase commit entry points on the
//! session path, by-xid finalization for detached branches, and the
//! prepared-branch scan used by crash recovery.
//!
//! [`MemoryEngine`] is an in-memory implementation used by the coordinator's
//! tests, with failure injection for the error paths.

mod engine;
mod memory;

pub use engine::{EngineError, RecoveredBranch, StorageEngine, TableRef};
pub use memory::{BranchPhase, MemoryEngine};
