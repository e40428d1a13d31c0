//! In-place chunk headers.
//!
//! Every free chunk starts with a [`ChunkHeader`] and its payload follows
//! immediately. Payload sizes are multiples of four, so on 64-bit targets a
//! header can sit at an address that is not aligned for `usize`. All field
//! access therefore goes through unaligned reads and writes, and all of it
//! lives in this module.
//!
//! ```text
//! ┌──────────────────────────────────────────┬─────────────────────────┐
//! │ ChunkHeader (HEADER_SIZE bytes)          │ payload (`size` bytes)  │
//! │ ┌────────────┬────────────┬────────────┐ │                         │
//! │ │ prev       │ next       │ size       │ │                         │
//! │ └────────────┴────────────┴────────────┘ │                         │
//! └──────────────────────────────────────────┴─────────────────────────┘
//! ^ address()                                ^ data()                  ^ end()
//! ```

use core::{fmt, ptr::NonNull};

use crate::address::Address;

#[repr(C)]
struct ChunkHeader {
    prev: *mut ChunkHeader,
    next: *mut ChunkHeader,
    size: usize,
}

pub const HEADER_SIZE: usize = size_of::<ChunkHeader>();
const _: () = assert!(HEADER_SIZE.is_multiple_of(4));

/// Handle to a header inside the managed region.
///
/// Handles compare by address, which is the order the free list is kept in.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) struct Chunk(NonNull<ChunkHeader>);

impl Chunk {
    /// Writes a fresh, unlinked header at `address`.
    ///
    /// # Safety
    ///
    /// `address..address + HEADER_SIZE` must be writable memory owned by the
    /// free list, non-null, and stay owned by it for as long as the returned
    /// handle (or any copy) is used.
    pub(super) unsafe fn format(address: Address, size: usize) -> Self {
        let chunk = unsafe { Self::at(address) };
        chunk.set_prev(None);
        chunk.set_next(None);
        chunk.set_size(size);
        chunk
    }

    /// Reinterprets the header that precedes the payload at `data`.
    ///
    /// # Safety
    ///
    /// A header written by [`format`](Self::format) must live directly
    /// before `data`, with the ownership requirements of `format`.
    pub(super) unsafe fn from_data(data: Address) -> Self {
        unsafe { Self::at(data.sub(HEADER_SIZE)) }
    }

    unsafe fn at(address: Address) -> Self {
        debug_assert!(!address.is_null(), "chunk header at null");
        Self(unsafe { NonNull::new_unchecked(address.as_ptr()) })
    }

    fn get<T>(field: *const T) -> T {
        // Validity is the construction invariant of `Chunk`.
        unsafe { field.read_unaligned() }
    }

    fn put<T>(field: *mut T, value: T) {
        unsafe { field.write_unaligned(value) }
    }

    pub(super) fn address(self) -> Address {
        Address::from_ptr(self.0.as_ptr())
    }

    /// First byte of the payload.
    pub(super) fn data(self) -> Address {
        self.address().add(HEADER_SIZE)
    }

    /// One past the last byte of the payload.
    pub(super) fn end(self) -> Address {
        self.data().add(self.size())
    }

    pub(super) fn size(self) -> usize {
        let header = self.0.as_ptr();
        Self::get(unsafe { &raw const (*header).size })
    }

    pub(super) fn set_size(self, size: usize) {
        let header = self.0.as_ptr();
        Self::put(unsafe { &raw mut (*header).size }, size);
    }

    pub(super) fn prev(self) -> Option<Self> {
        let header = self.0.as_ptr();
        NonNull::new(Self::get(unsafe { &raw const (*header).prev })).map(Self)
    }

    pub(super) fn set_prev(self, prev: Option<Self>) {
        let header = self.0.as_ptr();
        Self::put(unsafe { &raw mut (*header).prev }, Self::raw(prev));
    }

    pub(super) fn next(self) -> Option<Self> {
        let header = self.0.as_ptr();
        NonNull::new(Self::get(unsafe { &raw const (*header).next })).map(Self)
    }

    pub(super) fn set_next(self, next: Option<Self>) {
        let header = self.0.as_ptr();
        Self::put(unsafe { &raw mut (*header).next }, Self::raw(next));
    }

    fn raw(chunk: Option<Self>) -> *mut ChunkHeader {
        chunk.map_or(core::ptr::null_mut(), |c| c.0.as_ptr())
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("address", &self.address())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_survive_unaligned_headers() {
        let mut buf = [0_u8; 4 * HEADER_SIZE];
        let base = Address::from_ptr(buf.as_mut_ptr());
        unsafe {
            let a = Chunk::format(base.add(4), 8);
            let b = Chunk::format(base.add(4 + HEADER_SIZE + 8), 12);
            a.set_next(Some(b));
            b.set_prev(Some(a));

            assert_eq!(a.size(), 8);
            assert_eq!(a.end(), b.address());
            assert_eq!(a.next(), Some(b));
            assert_eq!(b.prev(), Some(a));
            assert_eq!(a.prev(), None);
            assert_eq!(b.next(), None);
            assert!(a < b);
            assert_eq!(Chunk::from_data(b.data()), b);

            b.set_size(20);
            assert_eq!(b.end(), b.data().add(20));
        }
    }
}
