//! Relay datatype trait and type tag mapping.
//!
//! The relay only ever moves two element types across the group: `i32` for
//! the count exchange and `u8` for the payload exchanges.
//!
//! | Rust Type | MPI Equivalent | Tag Value |
//! |-----------|----------------|-----------|
//! | `i32`     | `MPI_INT32_T`  | 0         |
//! | `u8`      | `MPI_BYTE`     | 1         |

/// Seals [`RelayDatatype`] against outside implementations.
mod sealed {
    pub trait Sealed {}
}

/// Tag values matching C-side `VDIRELAY_*` defines.
///
/// These discriminants must stay in sync with `csrc/vdirelay.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DatatypeTag {
    /// 32-bit signed integer (`MPI_INT32_T`)
    I32 = 0,
    /// Raw byte (`MPI_BYTE`)
    Byte = 1,
}

/// Element types that can travel through a [`Collective`](crate::Collective).
///
/// This is a **sealed trait**. `encode`/`decode` give the in-process backend
/// a byte representation; the MPI backend passes the memory through as-is.
pub trait RelayDatatype: sealed::Sealed + Copy + Default + Send + Sync + 'static {
    /// The datatype tag used for FFI dispatch to the C layer.
    const TAG: DatatypeTag;
    /// Size of one element in bytes.
    const SIZE: usize;

    /// Append the native-endian bytes of `items` to `out`.
    fn encode(items: &[Self], out: &mut Vec<u8>);

    /// Fill `out` from native-endian bytes. `bytes.len()` is `out.len() * SIZE`.
    fn decode(bytes: &[u8], out: &mut [Self]);
}

impl sealed::Sealed for i32 {}
impl RelayDatatype for i32 {
    const TAG: DatatypeTag = DatatypeTag::I32;
    const SIZE: usize = 4;

    fn encode(items: &[Self], out: &mut Vec<u8>) {
        out.reserve(items.len() * Self::SIZE);
        for item in items {
            out.extend_from_slice(&item.to_ne_bytes());
        }
    }

    fn decode(bytes: &[u8], out: &mut [Self]) {
        for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(Self::SIZE)) {
            *slot = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }
}

impl sealed::Sealed for u8 {}
impl RelayDatatype for u8 {
    const TAG: DatatypeTag = DatatypeTag::Byte;
    const SIZE: usize = 1;

    fn encode(items: &[Self], out: &mut Vec<u8>) {
        out.extend_from_slice(items);
    }

    fn decode(bytes: &[u8], out: &mut [Self]) {
        out.copy_from_slice(bytes);
    }
}
