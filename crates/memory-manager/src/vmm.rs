//! The slice of the virtual-memory system the managers depend on.

use crate::address::Address;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;
const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);

/// How many pages the paging code may release before it flushes the TLB.
pub const UNMAP_BREAK_COUNT: usize = 8;

/// Page mapping primitives provided by the kernel.
pub trait VirtualMemory {
    /// Whether paging is up. During early boot nothing may be unmapped.
    fn is_system_initialized(&self) -> bool;

    /// Releases `page_count` whole pages starting at the page-aligned
    /// address `start`. Advisory: the caller never checks the outcome.
    fn unmap(&self, start: Address, page_count: usize, break_count: usize);

    /// Maps `page_count` pages of physical memory starting at `physical`
    /// into I/O space and returns the virtual address of the first page.
    fn map_io(&self, physical: usize, page_count: usize) -> Address;
}

/// Virtual memory for contexts without paging: early boot and hosted code.
///
/// Reports itself uninitialized, so managers never try to unmap anything,
/// and maps I/O space one to one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVirtualMemory;

impl VirtualMemory for NoVirtualMemory {
    fn is_system_initialized(&self) -> bool {
        false
    }

    fn unmap(&self, _start: Address, _page_count: usize, _break_count: usize) {}

    fn map_io(&self, physical: usize, _page_count: usize) -> Address {
        Address::new(physical)
    }
}

impl<V> VirtualMemory for &V
where
    V: VirtualMemory + ?Sized,
{
    fn is_system_initialized(&self) -> bool {
        (**self).is_system_initialized()
    }

    fn unmap(&self, start: Address, page_count: usize, break_count: usize) {
        (**self).unmap(start, page_count, break_count);
    }

    fn map_io(&self, physical: usize, page_count: usize) -> Address {
        (**self).map_io(physical, page_count)
    }
}
