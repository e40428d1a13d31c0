//! Memory managers for kernel and process heaps.
//!
//! The crate provides the two allocation strategies every address space is
//! built on, plus the byte-level primitives they use to touch memory before
//! any runtime is available. Everything is `no_std`; the bitmap manager
//! needs `alloc` for its bit storage.
//!
//! # Managers
//!
//! ## [`FreeListMemoryManager`](free_list::FreeListMemoryManager)
//!
//! A first-fit heap over one contiguous region. Chunk headers live in place
//! in front of every payload, free chunks are kept in an address-ordered
//! doubly linked list and merged with their neighbours when freed. Suited
//! for:
//!
//! - Variable-sized allocations with arbitrary power-of-two alignment
//! - Process heaps backing the global allocator (see [`heap::Heap`])
//! - Returning large freed areas to the virtual-memory system
//!
//! **Performance**: O(n) allocation and deallocation where n is the number of
//! free chunks. One spinlock per instance.
//!
//! ## [`BitmapMemoryManager`](bitmap::BitmapMemoryManager)
//!
//! Fixed-size blocks tracked by one bit each. Suited for:
//!
//! - Page-frame allocation
//! - Carving I/O-mapped regions into buffers
//!
//! **Performance**: O(n / 64) allocation, O(1) deallocation. Lock-free.
//!
//! # Usage Examples
//!
//! ## Basic `FreeListMemoryManager` Usage
//!
//! ```rust
//! use memory_manager::{
//!     free_list::FreeListMemoryManager,
//!     manager::{HeapMemoryManager as _, MemoryManager as _},
//! };
//!
//! let mut heap = vec![0_u64; 512]; // In a kernel, this would be heap pages
//! let start = heap.as_mut_ptr().expose_provenance();
//! let end = start + heap.len() * 8 - 1;
//!
//! let manager = FreeListMemoryManager::default();
//! unsafe { manager.initialize(start, end) }.unwrap();
//!
//! let ptr = manager.allocate_memory(100, 64).unwrap();
//! assert_eq!(ptr.addr() % 64, 0);
//! unsafe { manager.deallocate_memory(ptr, 64) }.unwrap();
//! assert!(manager.check_integrity());
//! ```
//!
//! ## Basic `BitmapMemoryManager` Usage
//!
//! ```rust
//! use memory_manager::{bitmap::BitmapMemoryManager, manager::BlockMemoryManager as _};
//!
//! // Physical frames 0x8000_0000..=0x8fff_ffff, never touched by the manager
//! let frames = BitmapMemoryManager::new(0x8000_0000, 0x8fff_ffff, 4096, false).unwrap();
//! frames.reserve_range(0, 16); // kernel image
//!
//! let frame = frames.allocate_block().unwrap();
//! assert_eq!(frame.addr(), 0x8001_0000);
//! frames.free_block(frame).unwrap();
//! ```
//!
//! # Errors
//!
//! Every manager operation returns [`AllocError`](error::AllocError).
//! Callers that cannot continue without memory hand it to
//! [`error::report`], which is what [`heap::Heap`] does.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub mod address;
pub mod atomic_bitmap;
pub mod bitmap;
pub mod error;
pub mod free_list;
pub mod heap;
pub mod manager;
pub mod vmm;

pub use self::{
    address::Address,
    bitmap::BitmapMemoryManager,
    error::{AllocError, ErrorKind},
    free_list::FreeListMemoryManager,
    heap::Heap,
    manager::{BlockMemoryManager, HeapMemoryManager, MemoryManager},
};
