#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

// The logger is process-wide, so this binary holds a single test.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};
use memory_manager::{
    Address, FreeListMemoryManager, HeapMemoryManager as _,
    vmm::{PAGE_SIZE, VirtualMemory},
};

struct Paging;

impl VirtualMemory for Paging {
    fn is_system_initialized(&self) -> bool {
        true
    }

    fn unmap(&self, _start: Address, _page_count: usize, _break_count: usize) {}

    fn map_io(&self, physical: usize, _page_count: usize) -> Address {
        Address::new(physical)
    }
}

static MANAGER: FreeListMemoryManager<Paging> = FreeListMemoryManager::new(Paging);

/// Logger that records whether the heap lock was held when it was called.
struct LockWatcher {
    logged_under_lock: AtomicBool,
    records: [AtomicUsize; 3],
}

impl Log for LockWatcher {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        if MANAGER.is_locked() {
            self.logged_under_lock.store(true, Ordering::SeqCst);
        }
        let slot = match record.level() {
            Level::Error | Level::Warn => 0,
            Level::Info | Level::Debug => 1,
            Level::Trace => 2,
        };
        self.records[slot].fetch_add(1, Ordering::SeqCst);
    }

    fn flush(&self) {}
}

static LOGGER: LockWatcher = LockWatcher {
    logged_under_lock: AtomicBool::new(false),
    records: [const { AtomicUsize::new(0) }; 3],
};

#[test]
fn nothing_is_logged_while_the_heap_is_locked() {
    log::set_logger(&LOGGER).unwrap();
    log::set_max_level(LevelFilter::Trace);

    let region = Vec::leak(vec![0_u128; 4 * PAGE_SIZE / size_of::<u128>()]);
    let start = region.as_mut_ptr().expose_provenance();
    let end = start + 4 * PAGE_SIZE - 1;

    unsafe {
        MANAGER.initialize(start, end).unwrap();

        let big = MANAGER.allocate_memory(2 * PAGE_SIZE, 0).unwrap();
        MANAGER.deallocate_memory(big, 0).unwrap();
        assert!(MANAGER.deallocate_memory(big, 0).is_err());
        assert!(MANAGER.reallocate_memory(big, 64, 0).is_err());
    }

    let [warn, debug, trace] = &LOGGER.records;
    assert!(debug.load(Ordering::SeqCst) >= 1, "initialization");
    assert!(trace.load(Ordering::SeqCst) >= 1, "unmap");
    assert_eq!(warn.load(Ordering::SeqCst), 2, "rejected frees");
    assert!(!LOGGER.logged_under_lock.load(Ordering::SeqCst));
    assert!(!MANAGER.is_locked());
}
