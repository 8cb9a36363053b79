//! MPI backend: the world communicator and the MPI lifecycle.

use std::marker::PhantomData;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::collective::{Collective, Runtime};
use crate::datatype::RelayDatatype;
use crate::error::{Error, Result};
use crate::ffi;
use crate::ThreadLevel;

/// Set while this library holds MPI initialized.
static MPI_STARTED: AtomicBool = AtomicBool::new(false);

/// `MPI_COMM_WORLD`.
///
/// # Example
///
/// ```no_run
/// use vdi_relay::{Collective, MpiComm};
///
/// let world = MpiComm::world();
/// println!("I am rank {} of {}", world.rank(), world.size());
/// ```
#[derive(Debug, Clone)]
pub struct MpiComm {
    handle: i32,
    /// Marker to prevent Send/Sync (MPI communicators are not thread-safe)
    _marker: PhantomData<*mut ()>,
}

impl MpiComm {
    /// Handle to the world communicator. MPI must be active before it is used.
    pub fn world() -> Self {
        MpiComm {
            handle: unsafe { ffi::vdirelay_comm_world() },
            _marker: PhantomData,
        }
    }

    /// Get the raw communicator handle (for advanced use).
    pub fn raw_handle(&self) -> i32 {
        self.handle
    }

    /// Terminate every process of the communicator.
    pub fn abort(&self, errorcode: i32) -> ! {
        unsafe { ffi::vdirelay_abort(self.handle, errorcode) };
        std::process::abort()
    }
}

impl Collective for MpiComm {
    fn rank(&self) -> i32 {
        let mut rank: i32 = 0;
        unsafe { ffi::vdirelay_comm_rank(self.handle, &mut rank) };
        rank
    }

    fn size(&self) -> i32 {
        let mut size: i32 = 0;
        unsafe { ffi::vdirelay_comm_size(self.handle, &mut size) };
        size
    }

    fn alltoall<T: RelayDatatype>(&self, send: &[T], recv: &mut [T]) -> Result<()> {
        let size = usize::try_from(self.size()).map_err(|_| Error::InvalidGroupSize(self.size()))?;
        if size == 0 || send.len() != recv.len() || send.len() % size != 0 {
            return Err(Error::InvalidBuffer);
        }
        let count = (send.len() / size) as i64;
        let ret = unsafe {
            ffi::vdirelay_alltoall(
                send.as_ptr().cast::<c_void>(),
                recv.as_mut_ptr().cast::<c_void>(),
                count,
                T::TAG as i32,
                self.handle,
            )
        };
        Error::check(ret)
    }

    fn alltoallv<T: RelayDatatype>(
        &self,
        send: &[T],
        send_counts: &[i32],
        send_displs: &[i32],
        recv: &mut [T],
        recv_counts: &[i32],
        recv_displs: &[i32],
    ) -> Result<()> {
        let size = usize::try_from(self.size()).map_err(|_| Error::InvalidGroupSize(self.size()))?;
        // MPI reads `size` entries from every table and trusts every window.
        check_windows(size, send_counts, send_displs, send.len())?;
        check_windows(size, recv_counts, recv_displs, recv.len())?;

        let ret = unsafe {
            ffi::vdirelay_alltoallv(
                send.as_ptr().cast::<c_void>(),
                send_counts.as_ptr(),
                send_displs.as_ptr(),
                recv.as_mut_ptr().cast::<c_void>(),
                recv_counts.as_ptr(),
                recv_displs.as_ptr(),
                T::TAG as i32,
                self.handle,
            )
        };
        Error::check(ret)
    }
}

fn check_windows(size: usize, counts: &[i32], displs: &[i32], len: usize) -> Result<()> {
    if counts.len() != size || displs.len() != size {
        return Err(Error::InvalidBuffer);
    }
    for (&count, &displ) in counts.iter().zip(displs) {
        let count = usize::try_from(count).map_err(|_| Error::InvalidCount(count.into()))?;
        let displ = usize::try_from(displ).map_err(|_| Error::InvalidCount(displ.into()))?;
        if displ.checked_add(count).map_or(true, |end| end > len) {
            return Err(Error::InvalidBuffer);
        }
    }
    Ok(())
}

/// The MPI library's process-wide lifecycle.
///
/// Starting requests `thread_level`; a lower provided level is logged, not
/// rejected. MPI cannot be restarted once finalized.
#[derive(Debug, Clone, Copy)]
pub struct MpiRuntime {
    thread_level: ThreadLevel,
}

impl MpiRuntime {
    /// A runtime that will request `thread_level` when started.
    pub fn new(thread_level: ThreadLevel) -> Self {
        MpiRuntime { thread_level }
    }

    /// The level requested on start.
    pub fn thread_level(&self) -> ThreadLevel {
        self.thread_level
    }

    /// Check if MPI has been initialized.
    pub fn is_initialized() -> bool {
        let mut flag: i32 = 0;
        unsafe { ffi::vdirelay_initialized(&mut flag) };
        flag != 0
    }

    /// Check if MPI has been finalized.
    pub fn is_finalized() -> bool {
        let mut flag: i32 = 0;
        unsafe { ffi::vdirelay_finalized(&mut flag) };
        flag != 0
    }
}

impl Default for MpiRuntime {
    fn default() -> Self {
        MpiRuntime::new(ThreadLevel::Serialized)
    }
}

impl Runtime for MpiRuntime {
    fn is_active(&self) -> bool {
        Self::is_initialized() && !Self::is_finalized()
    }

    fn start(&self) -> Result<()> {
        if Self::is_finalized() {
            return Err(Error::Internal("MPI cannot be restarted after finalization".into()));
        }
        if Self::is_initialized() || MPI_STARTED.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }

        let mut provided: i32 = 0;
        let ret = unsafe { ffi::vdirelay_init_thread(self.thread_level as i32, &mut provided) };
        if ret != 0 {
            MPI_STARTED.store(false, Ordering::SeqCst);
            return Err(Error::from_code(ret));
        }

        let provided = ThreadLevel::from_raw(provided);
        if provided < self.thread_level {
            warn!(requested = ?self.thread_level, ?provided, "MPI provides a lower thread level");
        }
        debug!(?provided, "MPI initialized");
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        // Only finalize what this library initialized
        if !MPI_STARTED.swap(false, Ordering::SeqCst) || Self::is_finalized() {
            return Ok(());
        }
        let ret = unsafe { ffi::vdirelay_finalize() };
        Error::check(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_must_fit_the_buffer() {
        assert!(check_windows(2, &[2, 2], &[0, 2], 4).is_ok());
        assert!(matches!(check_windows(2, &[2, 3], &[0, 2], 4), Err(Error::InvalidBuffer)));
        assert!(matches!(check_windows(2, &[2], &[0], 4), Err(Error::InvalidBuffer)));
        assert!(matches!(check_windows(1, &[-1], &[0], 4), Err(Error::InvalidCount(-1))));
        assert!(matches!(check_windows(1, &[1], &[i32::MAX], 4), Err(Error::InvalidBuffer)));
    }

    #[test]
    fn runtime_defaults_to_serialized() {
        assert_eq!(MpiRuntime::default().thread_level(), ThreadLevel::Serialized);
    }

    // Collectives themselves need mpiexec: see demos/relay_exchange.rs.
}
