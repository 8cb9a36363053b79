//! Lifecycle of the scratch regions and of the runtime they may have started.

use tracing::{debug, info, warn};

use crate::buffer::{BufferRole, Capacities, ScratchRegion};
use crate::collective::Runtime;
use crate::config::{RelayConfig, TruncationPolicy};
use crate::error::Result;

/// Shuts the runtime down when dropped.
///
/// Only exists when the relay was the one to start the runtime.
#[derive(Debug)]
pub struct RuntimeGuard<R: Runtime> {
    runtime: R,
}

impl<R: Runtime> RuntimeGuard<R> {
    /// Start `runtime` unless it is already active.
    ///
    /// Returns `None` when someone else owns the runtime's lifetime.
    pub fn start_if_inactive(runtime: R) -> Result<Option<Self>> {
        if runtime.is_active() {
            debug!("collective runtime already active, leaving its lifetime to the host");
            return Ok(None);
        }
        runtime.start()?;
        info!("collective runtime started by relay");
        Ok(Some(RuntimeGuard { runtime }))
    }

    /// The guarded runtime.
    pub fn runtime(&self) -> &R {
        &self.runtime
    }
}

impl<R: Runtime> Drop for RuntimeGuard<R> {
    fn drop(&mut self) {
        match self.runtime.shutdown() {
            Ok(()) => info!("collective runtime shut down by relay"),
            Err(err) => warn!(%err, "collective runtime shutdown failed"),
        }
    }
}

/// The three scratch regions of one relay handle.
///
/// Regions are zero-filled on allocation and freed on drop. If creating the
/// handle started the collective runtime, dropping it shuts the runtime down
/// again, after the regions are gone.
///
/// # Example
///
/// ```
/// use vdi_relay::{Capacities, LocalRuntime, RelayResources, TruncationPolicy};
///
/// let runtime = LocalRuntime::new();
/// let resources = RelayResources::initialize(
///     runtime.clone(),
///     Capacities::new(1024, 512, 256),
///     TruncationPolicy::Truncate,
/// )
/// .unwrap();
/// assert!(resources.owns_runtime());
///
/// resources.release();
/// assert_eq!(runtime.shutdowns(), 1);
/// ```
#[derive(Debug)]
pub struct RelayResources<R: Runtime> {
    color: ScratchRegion,
    depth: ScratchRegion,
    prefix: ScratchRegion,
    policy: TruncationPolicy,
    // Declared last: dropped after the regions.
    runtime_guard: Option<RuntimeGuard<R>>,
}

impl<R: Runtime> RelayResources<R> {
    /// Allocate the regions, starting the runtime if it is not active yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime fails to start. Allocation failure
    /// aborts the process.
    pub fn initialize(runtime: R, capacities: Capacities, policy: TruncationPolicy) -> Result<Self> {
        let runtime_guard = RuntimeGuard::start_if_inactive(runtime)?;
        debug!(
            color = capacities.color,
            depth = capacities.depth,
            prefix = capacities.prefix,
            ?policy,
            "allocating relay regions"
        );
        Ok(RelayResources {
            color: ScratchRegion::zeroed(BufferRole::Color, capacities.color),
            depth: ScratchRegion::zeroed(BufferRole::Depth, capacities.depth),
            prefix: ScratchRegion::zeroed(BufferRole::Prefix, capacities.prefix),
            policy,
            runtime_guard,
        })
    }

    /// [`initialize`](Self::initialize) with capacities and policy from `config`.
    pub fn from_config(runtime: R, config: &RelayConfig) -> Result<Self> {
        Self::initialize(runtime, config.capacities, config.policy)
    }

    /// Free the regions and, if this handle started it, shut the runtime down.
    pub fn release(self) {
        debug!(owns_runtime = self.owns_runtime(), "releasing relay regions");
        drop(self);
    }

    /// Whether releasing this handle shuts the runtime down.
    pub fn owns_runtime(&self) -> bool {
        self.runtime_guard.is_some()
    }

    /// Current mismatch handling.
    pub fn policy(&self) -> TruncationPolicy {
        self.policy
    }

    /// Change mismatch handling for subsequent operations.
    pub fn set_policy(&mut self, policy: TruncationPolicy) {
        self.policy = policy;
    }

    /// Capacity of one region in bytes.
    pub fn capacity(&self, role: BufferRole) -> usize {
        self.region(role).capacity()
    }

    /// All three capacities.
    pub fn capacities(&self) -> Capacities {
        Capacities::new(
            self.color.capacity(),
            self.depth.capacity(),
            self.prefix.capacity(),
        )
    }

    /// Read access to a region.
    pub fn region(&self, role: BufferRole) -> &ScratchRegion {
        match role {
            BufferRole::Color => &self.color,
            BufferRole::Depth => &self.depth,
            BufferRole::Prefix => &self.prefix,
        }
    }

    pub(crate) fn region_mut(&mut self, role: BufferRole) -> &mut ScratchRegion {
        match role {
            BufferRole::Color => &mut self.color,
            BufferRole::Depth => &mut self.depth,
            BufferRole::Prefix => &mut self.prefix,
        }
    }
}
