//! Raw FFI bindings to the C wrapper layer.
//!
//! These are low-level unsafe functions. Use the safe wrappers in [`crate::comm`].

#![allow(non_camel_case_types)]

use std::os::raw::{c_int, c_void};

// Type aliases matching the C header
pub type int32_t = i32;
pub type int64_t = i64;

extern "C" {
    // ============================================================
    // Initialization and Finalization
    // ============================================================

    pub fn vdirelay_init_thread(required: c_int, provided: *mut c_int) -> c_int;
    pub fn vdirelay_finalize() -> c_int;
    pub fn vdirelay_initialized(flag: *mut c_int) -> c_int;
    pub fn vdirelay_finalized(flag: *mut c_int) -> c_int;

    // ============================================================
    // Communicator Queries
    // ============================================================

    pub fn vdirelay_comm_world() -> int32_t;
    pub fn vdirelay_comm_rank(comm: int32_t, rank: *mut int32_t) -> c_int;
    pub fn vdirelay_comm_size(comm: int32_t, size: *mut int32_t) -> c_int;

    // ============================================================
    // All-to-all Exchanges
    // ============================================================

    pub fn vdirelay_alltoall(
        sendbuf: *const c_void,
        recvbuf: *mut c_void,
        count: int64_t,
        datatype_tag: int32_t,
        comm: int32_t,
    ) -> c_int;

    pub fn vdirelay_alltoallv(
        sendbuf: *const c_void,
        sendcounts: *const int32_t,
        sdispls: *const int32_t,
        recvbuf: *mut c_void,
        recvcounts: *const int32_t,
        rdispls: *const int32_t,
        datatype_tag: int32_t,
        comm: int32_t,
    ) -> c_int;

    // ============================================================
    // Utility Functions
    // ============================================================

    pub fn vdirelay_abort(comm: int32_t, errorcode: int32_t) -> c_int;
}
