//! System-wide shared memory limits.

use memory_addr::PAGE_SIZE_4K;

/// Page granularity of every segment allocation.
pub const PAGE_SIZE: usize = PAGE_SIZE_4K;

/// Minimum size of a segment in bytes.
pub const SHMMIN: usize = 1;
/// Maximum size of a segment in bytes.
pub const SHMMAX: usize = usize::MAX - (1 << 24);
/// Maximum number of segments in one IPC namespace.
pub const SHMMNI: usize = 4096;
/// Maximum number of segments attached by one process. Reported only.
pub const SHMSEG: usize = 4096;
/// Maximum number of pages used by all segments of one IPC namespace.
pub const SHMALL: usize = usize::MAX - (1 << 24);

/// Segment low boundary address multiple, used by `SHM_RND`.
pub const SHMLBA: usize = PAGE_SIZE;

/// Limits enforced by a [`Registry`](crate::shm::Registry) at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmLimits {
    /// Smallest segment size in bytes.
    pub min_size: usize,
    /// Largest segment size in bytes.
    pub max_size: usize,
    /// Largest number of live segments.
    pub max_segments: usize,
    /// Largest sum of page-rounded segment sizes, in pages.
    pub max_total_pages: usize,
    /// Per-process attach limit, reported through `IPC_INFO` only.
    pub max_attach_per_process: usize,
    /// Largest identifier handed out; ids live in `0..=max_id`.
    pub max_id: i32,
}

impl ShmLimits {
    /// Linux default limits.
    pub const fn new() -> Self {
        Self {
            min_size: SHMMIN,
            max_size: SHMMAX,
            max_segments: SHMMNI,
            max_total_pages: SHMALL,
            max_attach_per_process: SHMSEG,
            max_id: i32::MAX,
        }
    }
}

impl Default for ShmLimits {
    fn default() -> Self {
        Self::new()
    }
}
