//! Common types for the tandem XA coordinator
//!
//! This crate defines:
//! - The X/Open transaction identifier (`Xid`) with its text encodings and
//!   the internal/external classification used by crash recovery
//! - The XA status codes storage engines return from by-xid operations
//! - Resource-manager error classification (`RmCode`)

mod status;
mod xid;

pub use status::{RmCode, XaStatus};
pub use xid::{INTERNAL_SYSTEM_XID, MAX_BQUAL, MAX_GTRID, XID_DATA_SIZE, Xid, XidParseError};
