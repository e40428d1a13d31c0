//! First-fit heap manager over an address-ordered free list.
//!
//! The whole managed region starts out as one free chunk. Allocation walks
//! the list from the lowest address and takes the first chunk that is large
//! enough, carving an aligned chunk out of it when the caller asks for an
//! alignment the chunk's payload does not already have, and splitting off
//! the tail when enough is left over. Allocated chunks keep their header in
//! front of the payload but are not linked anywhere. Freeing links the
//! header back in address order and merges it with neighbours that touch it.
//!
//! ```text
//! free list:  head ──► [H|free] ◄──► [H|free] ◄──► [H|free]
//! memory:     [H|free][H|used][H|free][H|used][H|used][H|free]
//! ```
//!
//! Large merged chunks are handed back to the virtual-memory system: every
//! whole page of payload is unmapped once a chunk reaches [`PAGE_SIZE`].
//!
//! A [`spin::Mutex`] serializes every list walk and mutation. The occupancy
//! readers of [`MemoryManager`] use atomics and take no lock.

use core::{
    fmt, ptr,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use snafu::{OptionExt as _, ensure};

pub use self::chunk::HEADER_SIZE;
use self::chunk::Chunk;
use crate::{
    address::Address,
    error::{AllocError, IllegalStateSnafu, OutOfBoundsSnafu, OutOfMemorySnafu},
    manager::{HeapMemoryManager, MemoryManager},
    vmm::{NoVirtualMemory, PAGE_SHIFT, PAGE_SIZE, UNMAP_BREAK_COUNT, VirtualMemory},
};

mod chunk;

/// Smallest payload worth keeping as a separate free chunk.
pub const MIN_BLOCK_SIZE: usize = 4;

/// Allocation sizes are rounded up to a multiple of this.
const SIZE_GRANULE: usize = size_of::<u32>();

/// The list proper. Only reachable through the manager's lock.
struct FreeList {
    start: usize,
    end: usize,
    head: Option<Chunk>,
    unused: usize,
}

// Chunk handles point into the region the list exclusively owns.
unsafe impl Send for FreeList {}

impl FreeList {
    /// # Safety
    ///
    /// See [`HeapMemoryManager::initialize`].
    unsafe fn new(start: usize, end: usize) -> Self {
        let size = (end - start + 1 - HEADER_SIZE) / SIZE_GRANULE * SIZE_GRANULE;
        let head = unsafe { Chunk::format(Address::new(start), size) };
        Self {
            start,
            end,
            head: Some(head),
            unused: size,
        }
    }

    fn find_next(mut current: Option<Chunk>, size: usize) -> Option<Chunk> {
        while let Some(chunk) = current {
            if chunk.size() >= size {
                return Some(chunk);
            }
            current = chunk.next();
        }
        None
    }

    fn allocate(&mut self, size: usize, alignment: usize) -> Option<Chunk> {
        let mut candidate = Self::find_next(self.head, size);
        let chosen = loop {
            let current = candidate?;
            if let Some(chunk) = self.align_within(current, size, alignment) {
                break chunk;
            }
            candidate = Self::find_next(current.next(), size);
        };
        self.take(chosen, size);
        Some(chosen)
    }

    /// Returns a chunk inside `current` whose payload is aligned and can hold
    /// `size` bytes, carving it off the back of `current` if needed.
    fn align_within(&mut self, current: Chunk, size: usize, alignment: usize) -> Option<Chunk> {
        let data = current.data();
        let mut aligned_data = data.align_up(alignment);
        if aligned_data == data {
            return Some(current);
        }

        // The part left in front must still hold a header and a minimal block.
        while aligned_data.get() - HEADER_SIZE < data.get() + MIN_BLOCK_SIZE {
            aligned_data = aligned_data.add(alignment);
        }
        if aligned_data.get().checked_add(size)? > current.end().get() {
            return None;
        }

        let header = aligned_data.sub(HEADER_SIZE);
        let aligned_size = current.end().get() - aligned_data.get();
        // `header` lies inside the payload of `current`, which the list owns.
        let aligned = unsafe { Chunk::format(header, aligned_size) };
        current.set_size(header.get() - data.get());

        aligned.set_prev(Some(current));
        aligned.set_next(current.next());
        if let Some(next) = aligned.next() {
            next.set_prev(Some(aligned));
        }
        current.set_next(Some(aligned));

        self.unused -= HEADER_SIZE;
        Some(aligned)
    }

    /// Removes `chunk` from the list, leaving `size` bytes in it and linking
    /// whatever remains behind it back in its place.
    fn take(&mut self, chunk: Chunk, size: usize) {
        if chunk.size() - size >= MIN_BLOCK_SIZE + HEADER_SIZE {
            let rest_size = chunk.size() - size - HEADER_SIZE;
            // Directly behind the `size` bytes kept, still inside `chunk`.
            let rest = unsafe { Chunk::format(chunk.data().add(size), rest_size) };
            rest.set_prev(chunk.prev());
            rest.set_next(chunk.next());
            self.replace(chunk, rest);
            chunk.set_size(size);
            self.unused -= HEADER_SIZE;
        } else {
            self.unlink(chunk);
        }

        chunk.set_prev(None);
        chunk.set_next(None);
        self.unused -= chunk.size();
    }

    /// Points the neighbours of `old` at `new`.
    fn replace(&mut self, old: Chunk, new: Chunk) {
        if let Some(next) = old.next() {
            next.set_prev(Some(new));
        }
        match old.prev() {
            Some(prev) => prev.set_next(Some(new)),
            None => self.head = Some(new),
        }
    }

    fn unlink(&mut self, chunk: Chunk) {
        if let Some(next) = chunk.next() {
            next.set_prev(chunk.prev());
        }
        match chunk.prev() {
            Some(prev) => prev.set_next(chunk.next()),
            None => self.head = chunk.next(),
        }
    }

    /// Recovers the header of an allocation, checking that it belongs here.
    fn chunk_of(&self, ptr: *mut u8) -> Result<Chunk, AllocError> {
        let data = Address::from_ptr(ptr);
        ensure!(
            data.get() >= self.start + HEADER_SIZE && data.get() <= self.end,
            OutOfBoundsSnafu {
                address: data.get(),
                start: self.start,
                end: self.end,
            }
        );
        // Inside the region, so the header lies in memory the list owns.
        let chunk = unsafe { Chunk::from_data(data) };
        let chunk_end = data.get().checked_add(chunk.size());
        ensure!(
            chunk_end.is_some_and(|end| end <= self.end + 1),
            IllegalStateSnafu {
                reason: "chunk header extends past the end of the heap"
            }
        );
        Ok(chunk)
    }

    /// Fails if any part of `chunk` already lies inside a free chunk.
    fn ensure_allocated(&self, chunk: Chunk) -> Result<(), AllocError> {
        let overlaps = self
            .chunks()
            .take_while(|free| free.address() < chunk.end())
            .any(|free| chunk.address() < free.end());
        ensure!(
            !overlaps,
            IllegalStateSnafu {
                reason: "chunk is already free"
            }
        );
        Ok(())
    }

    /// Links a chunk that passed [`ensure_allocated`](Self::ensure_allocated)
    /// back in address order and merges it with touching neighbours. Returns
    /// the chunk that now contains it.
    fn insert(&mut self, chunk: Chunk) -> Chunk {
        let prev = self.chunks().take_while(|free| *free < chunk).last();
        let next = prev.map_or(self.head, Chunk::next);

        chunk.set_prev(prev);
        chunk.set_next(next);
        if let Some(next) = next {
            next.set_prev(Some(chunk));
        }
        match prev {
            Some(prev) => prev.set_next(Some(chunk)),
            None => self.head = Some(chunk),
        }

        self.unused += chunk.size();
        self.merge(chunk)
    }

    fn merge(&mut self, chunk: Chunk) -> Chunk {
        if let Some(next) = chunk.next().filter(|next| chunk.end() == next.address()) {
            chunk.set_size(chunk.size() + HEADER_SIZE + next.size());
            chunk.set_next(next.next());
            if let Some(after) = next.next() {
                after.set_prev(Some(chunk));
            }
            self.unused += HEADER_SIZE;
        }

        let Some(prev) = chunk.prev().filter(|prev| prev.end() == chunk.address()) else {
            return chunk;
        };
        prev.set_size(prev.size() + HEADER_SIZE + chunk.size());
        prev.set_next(chunk.next());
        if let Some(next) = chunk.next() {
            next.set_prev(Some(prev));
        }
        self.unused += HEADER_SIZE;
        prev
    }

    fn chunks(&self) -> impl Iterator<Item = Chunk> {
        let mut current = self.head;
        core::iter::from_fn(move || {
            let chunk = current?;
            current = chunk.next();
            Some(chunk)
        })
    }

    fn check_integrity(&self) -> bool {
        let mut prev: Option<Chunk> = None;
        let mut payload = 0;
        for chunk in self.chunks() {
            let inside = chunk.address().get() >= self.start && chunk.end().get() <= self.end + 1;
            let linked = chunk.prev() == prev;
            let ordered = prev.is_none_or(|p| p.end() < chunk.address());
            if !inside || !linked || !ordered || !chunk.size().is_multiple_of(SIZE_GRANULE) {
                return false;
            }
            payload += chunk.size();
            prev = Some(chunk);
        }
        payload == self.unused
    }
}

/// Heap manager for one contiguous region, see the [module docs](self).
///
/// The manager starts uninitialized; every operation except
/// [`initialize`](HeapMemoryManager::initialize) fails with
/// [`AllocError::IllegalState`] until it has been given a region.
pub struct FreeListMemoryManager<V = NoVirtualMemory> {
    start: AtomicUsize,
    end: AtomicUsize,
    unused: AtomicUsize,
    initialized: AtomicBool,
    unmap_freed_memory: AtomicBool,
    list: spin::Mutex<Option<FreeList>>,
    vmm: V,
}

impl Default for FreeListMemoryManager {
    fn default() -> Self {
        Self::new(NoVirtualMemory)
    }
}

impl<V> fmt::Debug for FreeListMemoryManager<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeListMemoryManager")
            .field("start", &self.start.load(Ordering::Relaxed))
            .field("end", &self.end.load(Ordering::Relaxed))
            .field("unused", &self.unused.load(Ordering::Relaxed))
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<V> FreeListMemoryManager<V>
where
    V: VirtualMemory,
{
    /// Creates an uninitialized manager that returns freed pages through
    /// `vmm`.
    #[must_use]
    pub const fn new(vmm: V) -> Self {
        Self {
            start: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
            unused: AtomicUsize::new(0),
            initialized: AtomicBool::new(false),
            unmap_freed_memory: AtomicBool::new(true),
            list: spin::Mutex::new(None),
            vmm,
        }
    }

    /// Keeps freed pages mapped. Needed for heaps whose backing memory is
    /// not demand paged.
    pub fn disable_automatic_unmapping(&self) {
        self.unmap_freed_memory.store(false, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Whether some thread currently holds the list lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.list.is_locked()
    }

    /// Walks the free list and verifies its structural invariants: every
    /// chunk inside the region, addresses strictly ascending with no two
    /// chunks touching, back links consistent, sizes word multiples, and the
    /// free-memory counter matching the list.
    ///
    /// An uninitialized manager is trivially intact.
    #[must_use]
    pub fn check_integrity(&self) -> bool {
        self.list.lock().as_ref().is_none_or(FreeList::check_integrity)
    }

    /// Forgets the managed region and returns to the uninitialized state.
    ///
    /// # Safety
    ///
    /// No allocation made from this manager may be used or freed afterwards.
    pub(crate) unsafe fn teardown(&self) {
        let mut list = self.list.lock();
        *list = None;
        self.initialized.store(false, Ordering::Release);
        self.unused.store(0, Ordering::Relaxed);
        self.start.store(0, Ordering::Relaxed);
        self.end.store(0, Ordering::Relaxed);
    }

    fn with_list<R>(
        &self,
        f: impl FnOnce(&mut FreeList) -> Result<R, AllocError>,
    ) -> Result<R, AllocError> {
        let mut guard = self.list.lock();
        let list = guard.as_mut().context(IllegalStateSnafu {
            reason: "free list memory manager is not initialized",
        })?;
        let result = f(list);
        self.unused.store(list.unused, Ordering::Relaxed);
        result
    }

    fn allocate_locked(
        list: &mut FreeList,
        size: usize,
        alignment: usize,
    ) -> Result<*mut u8, AllocError> {
        if size == 0 {
            return Ok(ptr::null_mut());
        }
        let chunk = size
            .checked_next_multiple_of(SIZE_GRANULE)
            .and_then(|size| list.allocate(size, alignment))
            .context(OutOfMemorySnafu { size, alignment })?;
        Ok(chunk.data().as_ptr())
    }

    /// Returns a validated chunk to the list and hands large free areas
    /// back to the virtual-memory system.
    fn reclaim_locked(&self, list: &mut FreeList, chunk: Chunk) -> Option<Unmapped> {
        let merged = list.insert(chunk);
        if self.unmap_freed_memory.load(Ordering::Relaxed)
            && merged.size() >= PAGE_SIZE
            && self.vmm.is_system_initialized()
        {
            self.unmap_free_pages(merged)
        } else {
            None
        }
    }

    /// Unmaps the whole pages of a free chunk's payload. The header stays
    /// mapped.
    fn unmap_free_pages(&self, chunk: Chunk) -> Option<Unmapped> {
        let first_page = chunk.data().align_up(PAGE_SIZE);
        let end_page = chunk.end().align_down(PAGE_SIZE);
        if end_page <= first_page {
            return None;
        }
        let page_count = (end_page.get() - first_page.get()) >> PAGE_SHIFT;
        self.vmm.unmap(first_page, page_count, UNMAP_BREAK_COUNT);
        Some(Unmapped {
            start: first_page,
            page_count,
        })
    }

    /// Logs what a free did once the list lock is released. A logger may
    /// allocate, so nothing is logged while the lock is held.
    fn finish_free<T>(
        ptr: *mut u8,
        result: Result<(T, Option<Unmapped>), AllocError>,
    ) -> Result<T, AllocError> {
        match result {
            Ok((value, unmapped)) => {
                if let Some(Unmapped { start, page_count }) = unmapped {
                    log::trace!("free list: unmapped {page_count} pages at {start:?}");
                }
                Ok(value)
            }
            Err(err) => {
                if err.kind().is_illegal_state() {
                    log::warn!("free list: rejected free of {ptr:p}: {err}");
                }
                Err(err)
            }
        }
    }
}

/// Pages returned to the virtual-memory system by a free.
struct Unmapped {
    start: Address,
    page_count: usize,
}

impl<V> MemoryManager for FreeListMemoryManager<V>
where
    V: VirtualMemory,
{
    fn total_memory(&self) -> usize {
        if !self.is_initialized() {
            return 0;
        }
        self.end.load(Ordering::Relaxed) - self.start.load(Ordering::Relaxed) + 1
    }

    fn free_memory(&self) -> usize {
        self.unused.load(Ordering::Relaxed)
    }

    fn start_address(&self) -> usize {
        self.start.load(Ordering::Relaxed)
    }

    fn end_address(&self) -> usize {
        self.end.load(Ordering::Relaxed)
    }
}

impl<V> HeapMemoryManager for FreeListMemoryManager<V>
where
    V: VirtualMemory,
{
    unsafe fn initialize(&self, start: usize, end: usize) -> Result<(), AllocError> {
        let mut guard = self.list.lock();
        ensure!(
            guard.is_none(),
            IllegalStateSnafu {
                reason: "free list memory manager is already initialized"
            }
        );
        ensure!(
            start != 0 && start.is_multiple_of(SIZE_GRANULE),
            IllegalStateSnafu {
                reason: "heap must start at a non-null word-aligned address"
            }
        );
        ensure!(
            end >= start && end - start + 1 >= HEADER_SIZE,
            IllegalStateSnafu {
                reason: "heap is too small"
            }
        );

        let list = unsafe { FreeList::new(start, end) };
        self.start.store(start, Ordering::Relaxed);
        self.end.store(end, Ordering::Relaxed);
        self.unused.store(list.unused, Ordering::Relaxed);
        *guard = Some(list);
        self.initialized.store(true, Ordering::Release);
        drop(guard);

        log::debug!("free list memory manager: heap at {start:#x}..={end:#x}");
        Ok(())
    }

    fn allocate_memory(&self, size: usize, alignment: usize) -> Result<*mut u8, AllocError> {
        self.with_list(|list| Self::allocate_locked(list, size, alignment))
    }

    unsafe fn reallocate_memory(
        &self,
        ptr: *mut u8,
        size: usize,
        alignment: usize,
    ) -> Result<*mut u8, AllocError> {
        if ptr.is_null() {
            return self.allocate_memory(size, alignment);
        }
        let result = self.with_list(|list| {
            // Nothing may fail once the new block is taken.
            let old = list.chunk_of(ptr)?;
            list.ensure_allocated(old)?;
            let new = Self::allocate_locked(list, size, alignment)?;
            if !new.is_null() {
                // `new` was just carved from free memory, `old` is still in use,
                // so the two cannot overlap.
                unsafe { Address::from_ptr(new).copy_range(old.data(), size.min(old.size())) };
            }
            Ok((new, self.reclaim_locked(list, old)))
        });
        Self::finish_free(ptr, result)
    }

    unsafe fn deallocate_memory(&self, ptr: *mut u8, _alignment: usize) -> Result<(), AllocError> {
        if ptr.is_null() {
            return Ok(());
        }
        let result = self.with_list(|list| {
            let chunk = list.chunk_of(ptr)?;
            list.ensure_allocated(chunk)?;
            Ok(((), self.reclaim_locked(list, chunk)))
        });
        Self::finish_free(ptr, result)
    }
}
