//! The two collaborators the relay is written against.
//!
//! [`Runtime`] is the process-level lifecycle of the collective library and
//! [`Collective`] is one communication group. Both are injected into every
//! operation; nothing in this crate reads a process-wide communicator.

use crate::datatype::RelayDatatype;
use crate::error::Result;

/// Lifecycle of the collective runtime (`MPI_Init` / `MPI_Finalize`).
pub trait Runtime {
    /// Whether the runtime is currently usable.
    fn is_active(&self) -> bool;

    /// Bring the runtime up.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime is already active or fails to start.
    fn start(&self) -> Result<()>;

    /// Tear the runtime down. A runtime that is not active is left alone.
    fn shutdown(&self) -> Result<()>;
}

/// A communication group executing matched, blocking collectives.
///
/// Every member must enter each collective with consistent arguments or the
/// call blocks forever. At most one collective may be in flight per group.
pub trait Collective {
    /// Rank of the calling participant.
    fn rank(&self) -> i32;

    /// Number of participants in the group.
    fn size(&self) -> i32;

    /// Fixed-size all-to-all.
    ///
    /// `send` is split into `size()` equal blocks; block *j* goes to
    /// participant *j*. Block *i* of `recv` receives participant *i*'s block
    /// addressed to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBuffer`](crate::Error::InvalidBuffer) if the
    /// lengths differ or do not divide by the group size.
    fn alltoall<T: RelayDatatype>(&self, send: &[T], recv: &mut [T]) -> Result<()>;

    /// Variable-size all-to-all.
    ///
    /// `send_counts[i]` elements starting at `send_displs[i]` go to
    /// participant *i*; `recv_counts[i]` elements from participant *i* are
    /// written at `recv_displs[i]`. All tables have `size()` entries and the
    /// windows lie inside their buffers.
    fn alltoallv<T: RelayDatatype>(
        &self,
        send: &[T],
        send_counts: &[i32],
        send_displs: &[i32],
        recv: &mut [T],
        recv_counts: &[i32],
        recv_displs: &[i32],
    ) -> Result<()>;
}
