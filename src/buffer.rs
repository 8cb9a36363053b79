//! Scratch regions owned by a relay handle and the views handed out over them.

use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::error::{Error, Result};

/// Which of the three scratch regions an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// Supersegment colors: 4 channels of 32-bit floats.
    Color,
    /// Supersegment depths: start and end as 32-bit floats.
    Depth,
    /// Per-pixel supersegment prefix sums of the image.
    Prefix,
}

impl BufferRole {
    /// All roles in allocation order.
    pub const ALL: [BufferRole; 3] = [BufferRole::Color, BufferRole::Depth, BufferRole::Prefix];

    /// Lower-case name used in logs and error messages.
    pub fn name(self) -> &'static str {
        match self {
            BufferRole::Color => "color",
            BufferRole::Depth => "depth",
            BufferRole::Prefix => "prefix",
        }
    }

    /// Bytes one supersegment occupies in this region, if the region is
    /// laid out in supersegments at all.
    pub fn bytes_per_supersegment(self) -> Option<usize> {
        match self {
            BufferRole::Color => Some(4 * 4),
            BufferRole::Depth => Some(4 * 2),
            BufferRole::Prefix => None,
        }
    }
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Byte capacities of the three regions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capacities {
    /// Color region size in bytes.
    pub color: usize,
    /// Depth region size in bytes.
    pub depth: usize,
    /// Prefix region size in bytes.
    pub prefix: usize,
}

impl Capacities {
    /// Capacities in bytes.
    pub fn new(color: usize, depth: usize, prefix: usize) -> Self {
        Capacities { color, depth, prefix }
    }

    /// Capacities as they arrive from a JVM `int`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapacity`] for the first negative value.
    pub fn from_raw(color: i32, depth: i32, prefix: i32) -> Result<Self> {
        let checked = |role: BufferRole, capacity: i32| {
            usize::try_from(capacity).map_err(|_| Error::InvalidCapacity {
                role,
                capacity: capacity.into(),
            })
        };
        Ok(Capacities {
            color: checked(BufferRole::Color, color)?,
            depth: checked(BufferRole::Depth, depth)?,
            prefix: checked(BufferRole::Prefix, prefix)?,
        })
    }

    /// Capacity of one region.
    pub fn get(&self, role: BufferRole) -> usize {
        match role {
            BufferRole::Color => self.color,
            BufferRole::Depth => self.depth,
            BufferRole::Prefix => self.prefix,
        }
    }

    /// Combined size of all regions.
    pub fn total(&self) -> usize {
        self.color + self.depth + self.prefix
    }
}

/// A zero-initialised, fixed-capacity byte region.
///
/// The region never grows or moves after allocation, so addresses taken from
/// it stay valid until it is dropped.
pub struct ScratchRegion {
    role: BufferRole,
    bytes: Box<[u8]>,
}

impl ScratchRegion {
    /// Allocate `capacity` zeroed bytes. Allocation failure aborts the process.
    pub fn zeroed(role: BufferRole, capacity: usize) -> Self {
        ScratchRegion {
            role,
            bytes: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    /// The role this region serves.
    pub fn role(&self) -> BufferRole {
        self.role
    }

    /// Size in bytes.
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// The whole region.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// The whole region, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// A view over the first `len` bytes, clamped to the capacity.
    pub fn view(&mut self, len: usize) -> RegionView<'_> {
        let len = len.min(self.bytes.len());
        RegionView {
            role: self.role,
            bytes: &mut self.bytes[..len],
        }
    }
}

impl fmt::Debug for ScratchRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchRegion")
            .field("role", &self.role)
            .field("capacity", &self.bytes.len())
            .finish()
    }
}

/// Borrowed view over the received part of a region.
///
/// Dereferences to the bytes. The view borrows the owning handle, so no other
/// relay operation can run while it is alive.
#[derive(Debug)]
pub struct RegionView<'a> {
    role: BufferRole,
    bytes: &'a mut [u8],
}

impl RegionView<'_> {
    /// Region the view points into.
    pub fn role(&self) -> BufferRole {
        self.role
    }

    /// Start address, for handing the view to a foreign runtime without copying.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr()
    }
}

impl Deref for RegionView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

impl DerefMut for RegionView<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.bytes
    }
}
