//! # vdi-relay
//!
//! All-to-all relay of volumetric depth image (VDI) fragments between the
//! ranks of a distributed renderer.
//!
//! Every rank renders part of a volume and produces, for each peer, the
//! supersegments that fall into that peer's screen tile. This crate moves
//! those fragments around:
//! - Count exchange: one integer per peer, so every rank learns what it will receive
//! - Variable-size exchange of the color and depth supersegments
//! - Fixed-size exchange of the per-pixel prefix sums
//! - Fixed-capacity scratch regions that receive the results without reallocating
//!
//! Operations are written against two traits, [`Runtime`] and [`Collective`].
//! [`local`] provides an in-process implementation on threads; the `mpi`
//! feature provides one on MPI through a thin C layer, and the `jni` feature
//! exports the whole thing to the JVM.
//!
//! ## Quick Start
//!
//! ```
//! use vdi_relay::{local, Capacities, Collective, LocalRuntime, RelayResources, TruncationPolicy};
//!
//! let prefixes = local::run_group(4, |comm| {
//!     let mut relay = RelayResources::initialize(
//!         LocalRuntime::already_active(),
//!         Capacities::new(0, 0, 64),
//!         TruncationPolicy::Strict,
//!     )
//!     .unwrap();
//!
//!     // 8 bytes for every peer
//!     let local = vec![comm.rank() as u8; 32];
//!     relay.distribute_prefix(&comm, &local).unwrap().to_vec()
//! });
//! assert_eq!(&prefixes[0][8..16], &[1; 8]);
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Description | Dependencies |
//! |---------|-------------|--------------|
//! | `mpi`   | MPI backend ([`MpiComm`], [`MpiRuntime`]) | a system MPI |
//! | `jni`   | `graphics.scenery.natives.VDIMPIWrapper` entry points | `mpi`, `jni`, `tracing-subscriber` |
//!
//! ## Truncation
//!
//! The relay never writes past a region. What happens when a request does
//! not fit is decided by [`TruncationPolicy`]: cut it down with a warning, or
//! reject it before any rank enters the collective.

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow certain pedantic lints for existing code
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::similar_names)]

mod buffer;
mod collective;
#[cfg(feature = "mpi")]
mod comm;
mod config;
mod datatype;
mod descriptor;
mod error;
#[cfg(feature = "mpi")]
mod ffi;
#[cfg(feature = "jni")]
pub mod jni;
pub mod local;
mod registry;
mod relay;
mod resources;

pub use buffer::{BufferRole, Capacities, RegionView, ScratchRegion};
pub use collective::{Collective, Runtime};
#[cfg(feature = "mpi")]
pub use comm::{MpiComm, MpiRuntime};
pub use config::{
    RelayConfig, TruncationPolicy, COLOR_CAPACITY_VAR, DEPTH_CAPACITY_VAR, PREFIX_CAPACITY_VAR,
    STRICT_VAR, THREAD_LEVEL_VAR,
};
pub use datatype::{DatatypeTag, RelayDatatype};
pub use descriptor::{displacements, ExchangeDescriptor};
pub use error::{Error, Result};
pub use local::{LocalComm, LocalRuntime};
pub use registry::{Handle, HandleRegistry};
pub use relay::{check_group_size, group_rank, group_size};
pub use resources::{RelayResources, RuntimeGuard};

/// MPI thread support levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum ThreadLevel {
    /// Only single-threaded execution
    Single = 0,
    /// Multi-threaded, but MPI calls only from main thread
    Funneled = 1,
    /// Multi-threaded, but MPI calls serialized by user
    Serialized = 2,
    /// Full multi-threaded support
    Multiple = 3,
}

impl ThreadLevel {
    /// Level from the value the C layer reports; anything above 3 is `Multiple`.
    pub fn from_raw(provided: i32) -> ThreadLevel {
        match provided {
            i32::MIN..=0 => ThreadLevel::Single,
            1 => ThreadLevel::Funneled,
            2 => ThreadLevel::Serialized,
            _ => ThreadLevel::Multiple,
        }
    }
}
