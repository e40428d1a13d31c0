//! Capability traits shared by every memory manager.
//!
//! Managed regions are inclusive: `start_address()..=end_address()`.

use crate::error::AllocError;

/// Reports the extent and occupancy of a managed region.
pub trait MemoryManager {
    /// Size of the managed region in bytes.
    fn total_memory(&self) -> usize;

    /// Bytes currently available for allocation.
    ///
    /// May be read without synchronization and can be momentarily stale
    /// while another thread is allocating.
    fn free_memory(&self) -> usize;

    fn start_address(&self) -> usize;

    fn end_address(&self) -> usize;
}

/// Variable-size allocation with alignment.
pub trait HeapMemoryManager: MemoryManager {
    /// Takes ownership of `start..=end` and formats it as one free chunk.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes, unused by anything
    /// else, and stay valid for as long as this manager is in use.
    unsafe fn initialize(&self, start: usize, end: usize) -> Result<(), AllocError>;

    /// Allocates `size` bytes whose address is a multiple of `alignment`.
    ///
    /// A zero `size` yields a null pointer. An `alignment` of zero means
    /// "no particular alignment".
    fn allocate_memory(&self, size: usize, alignment: usize) -> Result<*mut u8, AllocError>;

    /// Moves an allocation into a block of `size` bytes, preserving
    /// `min(size, old size)` bytes of content.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this manager. On success
    /// it must no longer be used.
    unsafe fn reallocate_memory(
        &self,
        ptr: *mut u8,
        size: usize,
        alignment: usize,
    ) -> Result<*mut u8, AllocError>;

    /// Returns an allocation to the manager. Null is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this manager and must not
    /// be used afterwards.
    unsafe fn deallocate_memory(&self, ptr: *mut u8, alignment: usize) -> Result<(), AllocError>;
}

/// Fixed-size block allocation.
pub trait BlockMemoryManager: MemoryManager {
    /// Hands out the lowest free block.
    fn allocate_block(&self) -> Result<*mut u8, AllocError>;

    /// Returns a block obtained from [`allocate_block`](Self::allocate_block).
    fn free_block(&self, ptr: *mut u8) -> Result<(), AllocError>;

    /// Marks the block containing `ptr` as used or free without handing it
    /// out, e.g. to reserve frames the bootloader already occupies.
    fn mark_block(&self, ptr: *mut u8, used: bool) -> Result<(), AllocError>;
}
