//! Global allocation surface of an address space.
//!
//! A [`Heap`] is meant to live in a `static` and be registered with
//! `#[global_allocator]`. It is constructed empty at compile time and becomes
//! usable only once [`Heap::init`] hands it a region, so nothing depends on
//! static initialization order.
//!
//! ```no_run
//! use memory_manager::{heap::Heap, vmm::NoVirtualMemory};
//!
//! #[global_allocator]
//! static HEAP: Heap = Heap::new(NoVirtualMemory);
//!
//! fn main() {
//!     # let (heap_start, heap_end) = (0x8000_0000, 0x80ff_ffff);
//!     unsafe { HEAP.init(heap_start, heap_end) }.unwrap();
//! }
//! ```
//!
//! Allocator faults are not recoverable at this boundary: every error from
//! the underlying manager ends in [`report`].

use core::alloc::{GlobalAlloc, Layout};

use crate::{
    error::{AllocError, report},
    free_list::FreeListMemoryManager,
    manager::HeapMemoryManager as _,
    vmm::{NoVirtualMemory, VirtualMemory},
};

#[derive(Debug)]
pub struct Heap<V = NoVirtualMemory> {
    manager: FreeListMemoryManager<V>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(NoVirtualMemory)
    }
}

impl<V> Heap<V>
where
    V: VirtualMemory,
{
    #[must_use]
    pub const fn new(vmm: V) -> Self {
        Self {
            manager: FreeListMemoryManager::new(vmm),
        }
    }

    /// Starts serving allocations from the inclusive range `start..=end`.
    ///
    /// # Safety
    ///
    /// The range must be mapped, writable, and used by nothing but this heap
    /// until [`teardown`](Self::teardown).
    pub unsafe fn init(&self, start: usize, end: usize) -> Result<(), AllocError> {
        unsafe { self.manager.initialize(start, end) }
    }

    /// Stops serving allocations and forgets the region.
    ///
    /// # Safety
    ///
    /// Every allocation made from this heap must be dead.
    pub unsafe fn teardown(&self) {
        unsafe { self.manager.teardown() };
        log::debug!("heap torn down");
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.manager.is_initialized()
    }

    #[must_use]
    pub fn manager(&self) -> &FreeListMemoryManager<V> {
        &self.manager
    }
}

unsafe impl<V> GlobalAlloc for Heap<V>
where
    V: VirtualMemory,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.manager
            .allocate_memory(layout.size(), layout.align())
            .unwrap_or_else(|err| report(err))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.manager.deallocate_memory(ptr, layout.align()) }
            .unwrap_or_else(|err| report(err));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        unsafe { self.manager.reallocate_memory(ptr, new_size, layout.align()) }
            .unwrap_or_else(|err| report(err))
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use alloc::{boxed::Box, vec::Vec};

    use super::*;
    use crate::{free_list::HEADER_SIZE, manager::MemoryManager as _};

    const HEAP_SIZE: usize = 4096;

    #[repr(align(16))]
    struct Arena([u8; HEAP_SIZE]);

    fn arena() -> Box<Arena> {
        Box::new(Arena([0; HEAP_SIZE]))
    }

    fn bounds(arena: &mut Arena) -> (usize, usize) {
        let start = arena.0.as_mut_ptr().expose_provenance();
        (start, start + HEAP_SIZE - 1)
    }

    static STATIC_HEAP: Heap = Heap::new(NoVirtualMemory);

    #[test]
    fn static_heap_starts_empty() {
        assert!(!STATIC_HEAP.is_initialized());
        assert_eq!(STATIC_HEAP.manager().total_memory(), 0);
    }

    #[test]
    fn serves_layouts() {
        let mut arena = arena();
        let (start, end) = bounds(&mut arena);
        let heap = Heap::default();
        unsafe {
            heap.init(start, end).unwrap();
            assert!(heap.is_initialized());

            let layouts = [
                Layout::new::<u8>(),
                Layout::new::<u64>(),
                Layout::from_size_align(100, 64).unwrap(),
                Layout::from_size_align(3, 2).unwrap(),
            ];
            let ptrs = layouts
                .iter()
                .map(|&layout| {
                    let ptr = heap.alloc(layout);
                    assert!(!ptr.is_null());
                    assert!(ptr.addr().is_multiple_of(layout.align()));
                    assert!(ptr.addr() >= start && ptr.addr() + layout.size() <= end + 1);
                    ptr
                })
                .collect::<Vec<_>>();

            for (&ptr, &layout) in ptrs.iter().zip(&layouts) {
                heap.dealloc(ptr, layout);
            }
            assert_eq!(heap.manager().free_memory(), HEAP_SIZE - HEADER_SIZE);
            assert!(heap.manager().check_integrity());
        }
    }

    #[test]
    fn realloc_keeps_contents() {
        let mut arena = arena();
        let (start, end) = bounds(&mut arena);
        let heap = Heap::default();
        unsafe {
            heap.init(start, end).unwrap();
            let layout = Layout::from_size_align(16, 8).unwrap();
            let ptr = heap.alloc(layout);
            ptr.copy_from_nonoverlapping(b"0123456789abcdef".as_ptr(), 16);

            let grown = heap.realloc(ptr, layout, 512);
            assert_eq!(core::slice::from_raw_parts(grown, 16), b"0123456789abcdef");
            heap.dealloc(grown, Layout::from_size_align(512, 8).unwrap());
        }
    }

    #[test]
    fn teardown_resets() {
        let mut arena = arena();
        let (start, end) = bounds(&mut arena);
        let heap = Heap::default();
        unsafe {
            heap.init(start, end).unwrap();
            heap.teardown();
            assert!(!heap.is_initialized());
            heap.init(start, end).unwrap();
            assert_eq!(heap.manager().free_memory(), HEAP_SIZE - HEADER_SIZE);
        }
    }

    #[test]
    #[should_panic(expected = "Critical error occurred")]
    fn exhaustion_is_fatal() {
        let mut arena = arena();
        let (start, end) = bounds(&mut arena);
        let heap = Heap::default();
        unsafe {
            heap.init(start, end).unwrap();
            heap.alloc(Layout::from_size_align(2 * HEAP_SIZE, 8).unwrap());
        }
    }

    #[test]
    #[should_panic(expected = "not initialized")]
    fn allocation_after_teardown_is_fatal() {
        let mut arena = arena();
        let (start, end) = bounds(&mut arena);
        let heap = Heap::default();
        unsafe {
            heap.init(start, end).unwrap();
            heap.teardown();
            heap.alloc(Layout::new::<u32>());
        }
    }
}
