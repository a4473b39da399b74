//! XA status codes and resource-manager error classification

/// Return codes storage engines speak for by-xid operations, following the
/// X/Open XA return-code vocabulary.
///
/// `Nota` from an engine is treated as success by the commit/rollback
/// fan-out: not every engine participates in every branch, so "no such
/// transaction" is a legitimate answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaStatus {
    /// Normal execution.
    Ok,
    /// The XID is not known to this resource manager.
    Nota,
    /// A resource-manager error occurred.
    RmError,
    /// Invalid arguments.
    Inval,
    /// Call issued in an improper context.
    Proto,
    /// The resource manager is unavailable.
    RmFail,
    /// The XID already exists.
    Duplicate,
    /// Work is being done outside the transaction.
    Outside,
}

impl XaStatus {
    /// Whether the by-xid fan-out may keep going after this answer.
    pub fn is_acceptable(self) -> bool {
        matches!(self, XaStatus::Ok | XaStatus::Nota)
    }
}

/// Classified resource-manager error, recorded in a branch's `rm_error`
/// field as a bare code (0 means "no error").
///
/// The classification decides which rollback-only error the client sees:
/// lock wait timeout reports `XA_RBTIMEOUT`, deadlock reports
/// `XA_RBDEADLOCK`, anything else reports `XA_RBROLLBACK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmCode {
    LockWaitTimeout,
    Deadlock,
    Other(u32),
}

const CODE_LOCK_WAIT_TIMEOUT: u32 = 1205;
const CODE_LOCK_DEADLOCK: u32 = 1213;
const CODE_GENERIC: u32 = 1;

impl RmCode {
    pub fn code(self) -> u32 {
        match self {
            RmCode::LockWaitTimeout => CODE_LOCK_WAIT_TIMEOUT,
            RmCode::Deadlock => CODE_LOCK_DEADLOCK,
            // Never let a classified error collapse to "no error".
            RmCode::Other(0) => CODE_GENERIC,
            RmCode::Other(c) => c,
        }
    }

    /// Recover the classification from a stored code. 0 means no error.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => None,
            CODE_LOCK_WAIT_TIMEOUT => Some(RmCode::LockWaitTimeout),
            CODE_LOCK_DEADLOCK => Some(RmCode::Deadlock),
            c => Some(RmCode::Other(c)),
        }
    }
}
