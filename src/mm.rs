use core::sync::atomic::Ordering;

use linux_raw_sys::general::SIGSEGV;
use memory_addr::VirtAddr;
use starry_shm_api::Task;
use starry_shm_core::mm::AccessType;

/// Handles a user page fault in `task` at `vaddr`.
///
/// Returns whether the faulting access may be retried. On failure `SIGSEGV`
/// is left pending on the task.
pub fn handle_page_fault(task: &Task, vaddr: VirtAddr, access: AccessType) -> bool {
    trace!("Page fault at {:#x}, access: {:?}", vaddr, access);

    let result = task.aspace.lock().handle_page_fault(vaddr, access);

    if result {
        // 共享内存段常驻内存，不涉及磁盘I/O，只有 minor fault
        task.minflt.fetch_add(1, Ordering::Relaxed);
    } else {
        warn!(
            "{}: segmentation fault at {:#x}, access: {:?}",
            task.tgid(),
            vaddr,
            access
        );
        task.raise(SIGSEGV);
    }
    result
}
