//! XA two-phase-commit transaction coordinator
//!
//! Coordinates distributed transaction branches that span the server's
//! storage engines, on behalf of an external transaction manager speaking
//! the `XA` statement surface. Three pieces carry the weight:
//!
//! - a per-session state machine (`NotR → Active → Idle → Prepared`,
//!   terminated by commit or rollback) in [`session`];
//! - a process-wide [`cache`] of branches keyed by XID, which owns
//!   prepared branches that outlived their session and guarantees at most
//!   one finalizer per branch;
//! - a crash-[`recovery`] resolver that reconciles engine-prepared
//!   branches against the binlog's view and commits, rolls back, or
//!   retains each one.
//!
//! [`XaCoordinator`] ties them together and exposes one method per XA
//! statement. The binlog writer, metadata-lock graph, and GTID tracker are
//! collaborators behind narrow seams ([`binlog`], [`mdl`], [`gtid`]).

pub mod binlog;
pub mod cache;
pub mod commands;
pub mod config;
pub mod error;
pub mod gtid;
pub mod mdl;
pub mod observer;
pub mod recovery;
pub mod registry;
pub mod row;
pub mod session;

pub use commands::{EndOption, StartOption, XaCoordinator};
pub use config::{CoordinatorConfig, HeuristicRecover};
pub use error::{Result, XaError};
pub use session::{Session, XaState};
