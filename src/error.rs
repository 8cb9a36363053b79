//! Error types for vdi-relay

use crate::buffer::BufferRole;
use thiserror::Error;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for relay operations
#[derive(Error, Debug)]
pub enum Error {
    /// The collective runtime has already been initialized
    #[error("MPI has already been initialized")]
    AlreadyInitialized,

    /// The collective runtime has not been initialized
    #[error("MPI has not been initialized")]
    NotInitialized,

    /// Handle not issued by the registry, or already released
    #[error("Invalid resource handle: {0}")]
    InvalidHandle(i64),

    /// Negative region capacity
    #[error("Invalid capacity for {role} buffer: {capacity}")]
    InvalidCapacity {
        /// Region the capacity was meant for
        role: BufferRole,
        /// Capacity that was requested
        capacity: i64,
    },

    /// Negative or overflowing count / displacement
    #[error("Invalid count: {0}")]
    InvalidCount(i64),

    /// Group reported fewer than one participant
    #[error("Invalid group size: {0}")]
    InvalidGroupSize(i32),

    /// Explicit group size disagrees with the communicator
    #[error("Group size mismatch: caller passed {given}, communicator has {actual}")]
    GroupSizeMismatch {
        /// Size supplied by the caller
        given: i32,
        /// Size reported by the communicator
        actual: i32,
    },

    /// Descriptor table length does not match the group
    #[error("{table} has {actual} entries, group has {expected} participants")]
    DescriptorLength {
        /// Name of the offending table
        table: &'static str,
        /// Group size
        expected: usize,
        /// Table length
        actual: usize,
    },

    /// Displacements are not the running sums of their counts
    #[error("Displacements for {table} are not prefix sums of the counts")]
    InconsistentDisplacements {
        /// Name of the offending table
        table: &'static str,
    },

    /// A send window reaches past the end of the local buffer
    #[error("Send window ends at byte {end}, local buffer holds {len}")]
    SendWindowOutOfBounds {
        /// End offset of the furthest window
        end: usize,
        /// Local buffer length
        len: usize,
    },

    /// Receive would not fit the target region
    #[error("{role} buffer needs {required} bytes, capacity is {capacity}")]
    CapacityExceeded {
        /// Target region
        role: BufferRole,
        /// Bytes the exchange would deliver
        required: usize,
        /// Region capacity
        capacity: usize,
    },

    /// Fixed-size exchange input does not divide across the group
    #[error("Local buffer of {len} bytes does not split evenly across {group} participants")]
    UnevenSplit {
        /// Local buffer length
        len: usize,
        /// Group size
        group: usize,
    },

    /// Region has no supersegment layout
    #[error("No supersegment layout for {0} buffer")]
    NoSupersegmentLayout(BufferRole),

    /// Invalid buffer provided
    #[error("Invalid buffer")]
    InvalidBuffer,

    /// Unparsable configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// MPI error with code
    #[error("MPI error (code {0})")]
    MpiError(i32),

    /// In-process transport broke the collective contract
    #[error("Transport error: {0}")]
    Transport(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an error from an MPI error code.
    pub fn from_code(code: i32) -> Self {
        Error::MpiError(code)
    }

    /// Check an MPI return code, returning Ok(()) for success.
    pub fn check(code: i32) -> Result<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(Error::from_code(code))
        }
    }

    /// Whether the error stems from a malformed request rather than the runtime.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidCapacity { .. }
                | Error::InvalidCount(_)
                | Error::GroupSizeMismatch { .. }
                | Error::DescriptorLength { .. }
                | Error::InconsistentDisplacements { .. }
                | Error::SendWindowOutOfBounds { .. }
                | Error::CapacityExceeded { .. }
                | Error::UnevenSplit { .. }
                | Error::NoSupersegmentLayout(_)
                | Error::InvalidBuffer
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_success_code() {
        assert!(Error::check(0).is_ok());
    }

    #[test]
    fn check_failure_code() {
        match Error::check(15) {
            Err(Error::MpiError(15)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn messages_name_the_region() {
        let err = Error::CapacityExceeded {
            role: BufferRole::Depth,
            required: 128,
            capacity: 64,
        };
        assert_eq!(err.to_string(), "depth buffer needs 128 bytes, capacity is 64");
    }

    #[test]
    fn caller_errors_are_classified() {
        assert!(Error::UnevenSplit { len: 7, group: 2 }.is_caller_error());
        assert!(Error::InvalidCount(-1).is_caller_error());
        assert!(!Error::MpiError(1).is_caller_error());
        assert!(!Error::InvalidHandle(3).is_caller_error());
    }
}
