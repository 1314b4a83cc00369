//! Status codes written to status logs

/// Accepted, not yet picked up by a worker
pub const RECEIVED: i32 = 200;

/// A worker is running the operation
pub const PROCESSING: i32 = 205;

/// Finished successfully
pub const SUCCESS: i32 = 210;

/// Rejected because of caller input or a failed precondition
pub const FAILED_VALIDATION: i32 = 400;

/// Failed because the store, the tile server or the filesystem did
pub const FAILED_UPSTREAM: i32 = 500;

pub fn is_terminal(status: i32) -> bool {
    matches!(status, SUCCESS | FAILED_VALIDATION | FAILED_UPSTREAM)
}
