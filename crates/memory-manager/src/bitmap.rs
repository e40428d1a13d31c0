//! Fixed-size block manager backed by an [`AtomicBitmap`].
//!
//! One bit tracks one block of `block_size` bytes. Block `i` starts at
//! `start + i * block_size`. Allocation claims the lowest clear bit with a
//! compare-exchange, so the manager never takes a lock and may be used on
//! paths that run with interrupts disabled, such as page-frame allocation.

use snafu::ensure;

use crate::{
    address::Address,
    atomic_bitmap::AtomicBitmap,
    error::{AllocError, IllegalStateSnafu, OutOfBoundsSnafu, OutOfMemorySnafu},
    manager::{BlockMemoryManager, MemoryManager},
    vmm::{PAGE_SIZE, VirtualMemory},
};

#[derive(Debug)]
pub struct BitmapMemoryManager {
    start: usize,
    end: usize,
    block_size: usize,
    zero_memory: bool,
    bitmap: AtomicBitmap,
}

impl BitmapMemoryManager {
    /// Creates a manager for the inclusive range `start..=end`, split into
    /// blocks of `block_size` bytes. A trailing partial block is not managed.
    ///
    /// With `zero_memory` set, every block is zero-filled before it is
    /// handed out, which requires the range to be mapped and writable.
    ///
    /// # Errors
    ///
    /// [`AllocError::IllegalState`] if `block_size` is zero, `end` lies
    /// before `start`, or the range cannot hold a single block.
    pub fn new(
        start: usize,
        end: usize,
        block_size: usize,
        zero_memory: bool,
    ) -> Result<Self, AllocError> {
        ensure!(
            block_size > 0,
            IllegalStateSnafu {
                reason: "block size must not be zero"
            }
        );
        ensure!(
            start <= end,
            IllegalStateSnafu {
                reason: "memory range ends before it starts"
            }
        );
        let block_count = (end - start).saturating_add(1) / block_size;
        ensure!(
            block_count > 0,
            IllegalStateSnafu {
                reason: "memory range is smaller than one block"
            }
        );

        log::debug!(
            "bitmap memory manager: {start:#x}..={end:#x}, {block_count} blocks of {block_size:#x} bytes"
        );

        Ok(Self {
            start,
            end,
            block_size,
            zero_memory,
            bitmap: AtomicBitmap::new(block_count),
        })
    }

    /// Maps `page_count` pages of physical memory at `physical` into I/O
    /// space and manages the mapping in blocks of `block_size` bytes.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new). Also [`AllocError::IllegalState`] if
    /// `page_count` is zero.
    pub fn over_io<V>(
        vmm: &V,
        physical: usize,
        page_count: usize,
        block_size: usize,
        zero_memory: bool,
    ) -> Result<Self, AllocError>
    where
        V: VirtualMemory + ?Sized,
    {
        ensure!(
            page_count > 0,
            IllegalStateSnafu {
                reason: "I/O region must span at least one page"
            }
        );
        let start = vmm.map_io(physical, page_count).get();
        let end = start + page_count * PAGE_SIZE - 1;
        Self::new(start, end, block_size, zero_memory)
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.bitmap.len()
    }

    /// Whether the block containing `ptr` is in use.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfBounds`] if `ptr` is not inside a managed block.
    pub fn is_block_used(&self, ptr: *const u8) -> Result<bool, AllocError> {
        let index = self.block_index(ptr.expose_provenance())?;
        Ok(self.bitmap.test(index))
    }

    /// Marks `count` blocks starting at block `start_block` as used.
    ///
    /// Blocks past the end of the range are ignored. Returns how many blocks
    /// were actually marked.
    pub fn reserve_range(&self, start_block: usize, count: usize) -> usize {
        let marked = self.bitmap.set_range(start_block, count);
        log::debug!(
            "bitmap memory manager: reserved blocks {start_block}..{}",
            start_block + marked
        );
        marked
    }

    fn block_address(&self, index: usize) -> usize {
        self.start + index * self.block_size
    }

    fn block_index(&self, address: usize) -> Result<usize, AllocError> {
        let index = address
            .checked_sub(self.start)
            .map(|offset| offset / self.block_size)
            .filter(|&index| index < self.bitmap.len());
        index.ok_or_else(|| {
            OutOfBoundsSnafu {
                address,
                start: self.start,
                end: self.end,
            }
            .build()
        })
    }
}

impl MemoryManager for BitmapMemoryManager {
    fn total_memory(&self) -> usize {
        self.bitmap.len() * self.block_size
    }

    fn free_memory(&self) -> usize {
        self.bitmap.count_unset() * self.block_size
    }

    fn start_address(&self) -> usize {
        self.start
    }

    fn end_address(&self) -> usize {
        self.end
    }
}

impl BlockMemoryManager for BitmapMemoryManager {
    fn allocate_block(&self) -> Result<*mut u8, AllocError> {
        let index = self.bitmap.find_and_set().ok_or_else(|| {
            OutOfMemorySnafu {
                size: self.block_size,
                alignment: self.block_size,
            }
            .build()
        })?;

        let address = Address::new(self.block_address(index));
        if self.zero_memory {
            // The block was just claimed, nobody else can reach it.
            unsafe { address.set_range(0, self.block_size) };
        }
        Ok(address.as_ptr())
    }

    fn free_block(&self, ptr: *mut u8) -> Result<(), AllocError> {
        let index = self.block_index(ptr.expose_provenance())?;
        self.bitmap.unset(index);
        Ok(())
    }

    fn mark_block(&self, ptr: *mut u8, used: bool) -> Result<(), AllocError> {
        let index = self.block_index(ptr.expose_provenance())?;
        if used {
            self.bitmap.set(index);
        } else {
            self.bitmap.unset(index);
        }
        Ok(())
    }
}
