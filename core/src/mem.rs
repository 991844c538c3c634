//! Backing memory for shared memory segments.

use allocator::{AllocError, BaseAllocator, BitmapPageAllocator, PageAllocator};
use axerrno::{LinuxError, LinuxResult};
use memory_addr::{PAGE_SIZE_4K, PhysAddr, PhysAddrRange, is_aligned_4k};
use spin::Mutex;

/// Hands out page-aligned ranges of backing memory.
///
/// A range returned by [`allocate`](BackingMemory::allocate) stays valid until
/// it is passed back to [`release`](BackingMemory::release), which happens
/// exactly once.
pub trait BackingMemory: Send + Sync {
    /// Allocates `len` bytes. `len` is a non-zero multiple of the page size.
    fn allocate(&self, len: usize) -> LinuxResult<PhysAddrRange>;

    /// Returns a range obtained from `allocate`.
    fn release(&self, range: PhysAddrRange);
}

fn alloc_err(err: AllocError) -> LinuxError {
    match err {
        AllocError::NoMemory => LinuxError::ENOMEM,
        AllocError::MemoryOverlap => LinuxError::EEXIST,
        _ => LinuxError::EINVAL,
    }
}

/// Page frame allocator over one contiguous physical region.
///
/// The region must start on a 1 GiB boundary and fit the bitmap's capacity
/// (256 MiB with the default `allocator` features).
pub struct FrameAllocator {
    region: PhysAddrRange,
    inner: Mutex<BitmapPageAllocator<PAGE_SIZE_4K>>,
}

impl FrameAllocator {
    /// Creates an allocator managing `region`, which must be page aligned.
    pub fn new(region: PhysAddrRange) -> Self {
        debug_assert!(is_aligned_4k(region.start.as_usize()));
        debug_assert!(is_aligned_4k(region.size()));
        let mut inner = BitmapPageAllocator::new();
        inner.init(region.start.as_usize(), region.size());
        Self {
            region,
            inner: Mutex::new(inner),
        }
    }

    pub fn region(&self) -> PhysAddrRange {
        self.region
    }

    /// Bytes currently handed out.
    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used_pages() * PAGE_SIZE_4K
    }
}

impl BackingMemory for FrameAllocator {
    fn allocate(&self, len: usize) -> LinuxResult<PhysAddrRange> {
        if len == 0 || !is_aligned_4k(len) {
            return Err(LinuxError::EINVAL);
        }
        let start = self
            .inner
            .lock()
            .alloc_pages(len / PAGE_SIZE_4K, PAGE_SIZE_4K)
            .map_err(alloc_err)?;
        trace!("backing alloc [{:#x}, {:#x})", start, start + len);
        Ok(PhysAddrRange::from_start_size(PhysAddr::from(start), len))
    }

    fn release(&self, range: PhysAddrRange) {
        trace!("backing release {:?}", range);
        self.inner
            .lock()
            .dealloc_pages(range.start.as_usize(), range.size() / PAGE_SIZE_4K);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(pages: usize) -> FrameAllocator {
        FrameAllocator::new(PhysAddrRange::from_start_size(
            PhysAddr::from(0x8000_0000),
            pages * PAGE_SIZE_4K,
        ))
    }

    #[test]
    fn contiguous_ranges_and_exhaustion() {
        let mem = allocator(4);
        let a = mem.allocate(2 * PAGE_SIZE_4K).unwrap();
        let b = mem.allocate(2 * PAGE_SIZE_4K).unwrap();
        assert_eq!(a.start, mem.region().start);
        assert!(a.end <= b.start || b.end <= a.start);
        assert_eq!(mem.allocate(PAGE_SIZE_4K), Err(LinuxError::ENOMEM));
        assert_eq!(mem.used_bytes(), 4 * PAGE_SIZE_4K);
    }

    #[test]
    fn released_pages_are_reused() {
        let mem = allocator(3);
        let a = mem.allocate(PAGE_SIZE_4K).unwrap();
        let b = mem.allocate(PAGE_SIZE_4K).unwrap();
        let c = mem.allocate(PAGE_SIZE_4K).unwrap();
        mem.release(a);
        mem.release(c);
        mem.release(b);
        assert_eq!(mem.used_bytes(), 0);
        let all = mem.allocate(3 * PAGE_SIZE_4K).unwrap();
        assert_eq!(all, mem.region());
    }

    #[test]
    fn rejects_unaligned_lengths() {
        let mem = allocator(1);
        assert_eq!(mem.allocate(0), Err(LinuxError::EINVAL));
        assert_eq!(mem.allocate(100), Err(LinuxError::EINVAL));
    }
}
