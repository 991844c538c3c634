//! The seam between mappable kernel objects and user address spaces.
//!
//! A [`Mappable`] is something whose contents can be mapped into an
//! [`AddrSpace`]; the address space calls back into it to resolve page faults
//! and to report mappings coming and going. A [`MappingIdentity`] is the
//! reference-counted object a mapping keeps alive. Shared memory segments are
//! both.

use alloc::{collections::btree_map::BTreeMap, string::String, sync::Arc, vec::Vec};
use core::{
    any::Any,
    cmp::{max, min},
    fmt,
};

use axerrno::{LinuxError, LinuxResult};
use bitflags::bitflags;
use memory_addr::{
    PAGE_SIZE_4K, PhysAddr, PhysAddrRange, VirtAddr, VirtAddrRange, align_down_4k, is_aligned_4k,
};

use crate::{ctx::Requester, shm::Shm};

bitflags! {
    /// Access permissions, laid out like one `rwx` triad of a file mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessType: u8 {
        const READ = 0o4;
        const WRITE = 0o2;
        const EXECUTE = 0o1;
    }
}

/// A byte range within a mappable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappableRange {
    pub start: usize,
    pub end: usize,
}

impl MappableRange {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub const fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The overlap of two ranges; empty when they are disjoint.
    pub fn intersect(&self, other: &Self) -> Self {
        let start = max(self.start, other.start);
        let end = min(self.end, other.end);
        Self::new(start, max(start, end))
    }
}

/// Where the bytes of a mappable range live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// The translated range of the mappable object.
    pub source: MappableRange,
    /// The backing allocation holding `source`.
    pub backing: PhysAddrRange,
    /// Address of the byte at `source.start`.
    pub paddr: PhysAddr,
}

/// An object whose contents can be mapped into an address space.
pub trait Mappable: Send + Sync {
    /// Notifies that `ar` now maps the object at `offset`.
    fn add_mapping(&self, ctx: &Requester, ar: VirtAddrRange, offset: usize) -> LinuxResult;

    /// Notifies that `ar` no longer maps the object. Never fails.
    fn remove_mapping(&self, ctx: &Requester, ar: VirtAddrRange, offset: usize);

    /// Notifies that `src` was duplicated into `dst` of another address space.
    fn copy_mapping(
        &self,
        ctx: &Requester,
        src: VirtAddrRange,
        dst: VirtAddrRange,
        offset: usize,
    ) -> LinuxResult;

    /// Resolves `required` (and as much of `optional` as possible) to backing
    /// memory.
    ///
    /// The translations may be non-empty even when the result is an error:
    /// the caller can install what was translated and then fault.
    fn translate(
        &self,
        required: MappableRange,
        optional: MappableRange,
        at: AccessType,
    ) -> (Vec<Translation>, LinuxResult);
}

/// The reference-counted identity of a mapped object.
pub trait MappingIdentity: Send + Sync {
    fn inc_ref(&self);

    /// Drops a reference. Releasing the last one may tear the object down.
    fn dec_ref(&self);

    /// Name shown for the mapping in `/proc/<pid>/maps`.
    fn mapped_name(&self) -> String;

    fn device_id(&self) -> u64;

    fn inode_id(&self) -> u64;

    fn msync(&self, _range: MappableRange) -> LinuxResult {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// One counted reference to a [`MappingIdentity`].
///
/// Cloning takes another reference and dropping gives it back.
pub struct MappingRef(Arc<dyn MappingIdentity>);

impl MappingRef {
    /// Wraps a reference the caller already took.
    pub fn adopt(identity: Arc<dyn MappingIdentity>) -> Self {
        Self(identity)
    }

    pub fn identity(&self) -> &dyn MappingIdentity {
        &*self.0
    }

    /// Whether both references point at the same object.
    pub fn same_object(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }

    pub fn as_shm(&self) -> Option<&Shm> {
        self.0.as_any().downcast_ref::<Shm>()
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl Clone for MappingRef {
    fn clone(&self) -> Self {
        self.0.inc_ref();
        Self(self.0.clone())
    }
}

impl Drop for MappingRef {
    fn drop(&mut self) {
        self.0.dec_ref();
    }
}

impl fmt::Debug for MappingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingRef")
            .field("name", &self.0.mapped_name())
            .field("inode", &self.0.inode_id())
            .finish()
    }
}

/// Everything an address space needs to install a mapping.
pub struct MmapOpts {
    /// Length in bytes; rounded up to whole pages when installed.
    pub length: usize,
    /// Offset into the mappable object.
    pub offset: usize,
    /// Placement hint, or the exact address when `fixed`.
    pub addr: VirtAddr,
    /// Place exactly at `addr`, replacing whatever is mapped there.
    pub fixed: bool,
    pub perms: AccessType,
    pub max_perms: AccessType,
    pub mappable: Arc<dyn Mappable>,
    /// The reference that keeps the object alive until the mapping is
    /// installed. The installed mapping takes its own.
    pub identity: MappingRef,
}

impl fmt::Debug for MmapOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmapOpts")
            .field("length", &self.length)
            .field("offset", &self.offset)
            .field("addr", &self.addr)
            .field("fixed", &self.fixed)
            .field("perms", &self.perms)
            .field("identity", &self.identity)
            .finish()
    }
}

struct Vma {
    range: VirtAddrRange,
    offset: usize,
    perms: AccessType,
    max_perms: AccessType,
    mappable: Arc<dyn Mappable>,
    identity: MappingRef,
}

impl Vma {
    /// A copy of the part `[start, end)` of this vma, holding its own reference.
    fn slice(&self, start: usize, end: usize) -> Self {
        Self {
            range: VirtAddrRange::new(start.into(), end.into()),
            offset: self.offset + (start - self.range.start.as_usize()),
            perms: self.perms,
            max_perms: self.max_perms,
            mappable: self.mappable.clone(),
            identity: self.identity.clone(),
        }
    }
}

/// A user address space reduced to what mappable objects interact with.
pub struct AddrSpace {
    range: VirtAddrRange,
    vmas: BTreeMap<usize, Vma>,
    /// 已建立的页映射: page address -> (backing address, perms)
    pages: BTreeMap<usize, (PhysAddr, AccessType)>,
}

impl AddrSpace {
    pub fn new(range: VirtAddrRange) -> Self {
        Self {
            range,
            vmas: BTreeMap::new(),
            pages: BTreeMap::new(),
        }
    }

    pub fn range(&self) -> VirtAddrRange {
        self.range
    }

    /// Number of distinct mapped areas.
    pub fn vma_count(&self) -> usize {
        self.vmas.len()
    }

    /// The mapped area containing `addr`.
    pub fn find_area(&self, addr: VirtAddr) -> Option<VirtAddrRange> {
        self.vma_at(addr.as_usize()).map(|vma| vma.range)
    }

    /// Whether any mapping overlaps `[addr, addr + len)`.
    pub fn overlaps(&self, addr: VirtAddr, len: usize) -> bool {
        let start = addr.as_usize();
        !self.is_free(start, start.saturating_add(len))
    }

    /// Installs a mapping and returns its start address.
    pub fn mmap(&mut self, ctx: &Requester, opts: MmapOpts) -> LinuxResult<VirtAddr> {
        if opts.length == 0 {
            return Err(LinuxError::EINVAL);
        }
        if !opts.max_perms.contains(opts.perms) {
            return Err(LinuxError::EACCES);
        }
        let len = opts
            .length
            .checked_add(PAGE_SIZE_4K - 1)
            .map(align_down_4k)
            .ok_or(LinuxError::ENOMEM)?;

        let start = if opts.fixed {
            let start = opts.addr.as_usize();
            if !is_aligned_4k(start) {
                return Err(LinuxError::EINVAL);
            }
            let end = start.checked_add(len).ok_or(LinuxError::ENOMEM)?;
            if start < self.range.start.as_usize() || end > self.range.end.as_usize() {
                return Err(LinuxError::ENOMEM);
            }
            self.unmap_range(ctx, start, end);
            start
        } else {
            self.find_free_area(opts.addr.as_usize(), len)
                .ok_or(LinuxError::ENOMEM)?
        };

        let range = VirtAddrRange::from_start_size(start.into(), len);
        opts.mappable.add_mapping(ctx, range, opts.offset)?;
        debug!(
            "mmap: [{:#x}, {:#x}) {} perms={:?}",
            range.start,
            range.end,
            opts.identity.identity().mapped_name(),
            opts.perms
        );
        self.vmas.insert(
            start,
            Vma {
                range,
                offset: opts.offset,
                perms: opts.perms,
                max_perms: opts.max_perms,
                mappable: opts.mappable.clone(),
                identity: opts.identity.clone(),
            },
        );
        Ok(range.start)
    }

    /// Removes every mapping overlapping `[addr, addr + len)`.
    pub fn munmap(&mut self, ctx: &Requester, addr: VirtAddr, len: usize) -> LinuxResult {
        let start = addr.as_usize();
        if len == 0 || !is_aligned_4k(start) {
            return Err(LinuxError::EINVAL);
        }
        let end = len
            .checked_add(PAGE_SIZE_4K - 1)
            .map(align_down_4k)
            .and_then(|len| start.checked_add(len))
            .ok_or(LinuxError::EINVAL)?;
        self.unmap_range(ctx, start, end);
        Ok(())
    }

    /// Detaches the shared memory segment attached at `addr`.
    ///
    /// Every piece of the attachment still mapped within the segment's extent
    /// is removed, however it was fragmented since being attached.
    pub fn detach_shm(&mut self, ctx: &Requester, addr: VirtAddr) -> LinuxResult {
        let start = addr.as_usize();
        let (end, target) = {
            let vma = self.vmas.get(&start).ok_or(LinuxError::EINVAL)?;
            let shm = vma.identity.as_shm().ok_or(LinuxError::EINVAL)?;
            if vma.offset != 0 {
                return Err(LinuxError::EINVAL);
            }
            let end = start.saturating_add(shm.effective_size());
            (end, vma.identity.clone())
        };

        let pieces: Vec<(usize, usize)> = self
            .vmas
            .range(start..end)
            .filter(|(_, vma)| vma.identity.same_object(&target))
            .map(|(&s, vma)| (s, min(vma.range.end.as_usize(), end)))
            .collect();
        drop(target);
        for (s, e) in pieces {
            self.unmap_range(ctx, s, e);
        }
        Ok(())
    }

    /// Removes every mapping; used when the owning process exits.
    pub fn unmap_all(&mut self, ctx: &Requester) {
        let (start, end) = (self.range.start.as_usize(), self.range.end.as_usize());
        self.unmap_range(ctx, start, end);
    }

    /// Duplicates all mappings into a new address space.
    pub fn fork(&self, ctx: &Requester) -> LinuxResult<AddrSpace> {
        let mut child = AddrSpace::new(self.range);
        for (&start, vma) in &self.vmas {
            vma.mappable
                .copy_mapping(ctx, vma.range, vma.range, vma.offset)?;
            child
                .vmas
                .insert(start, vma.slice(start, vma.range.end.as_usize()));
        }
        Ok(child)
    }

    /// Resolves a page fault at `vaddr`. Returns whether the access may now
    /// proceed.
    pub fn handle_page_fault(&mut self, vaddr: VirtAddr, access: AccessType) -> bool {
        let addr = vaddr.as_usize();
        let Some(vma) = self
            .vmas
            .range(..=addr)
            .next_back()
            .map(|(_, vma)| vma)
            .filter(|vma| vma.range.contains(vaddr))
        else {
            return false;
        };
        if !vma.perms.contains(access) {
            return false;
        }

        let base = vma.range.start.as_usize();
        let page = align_down_4k(addr);
        let off = vma.offset + (page - base);
        let required = MappableRange::new(off, off + PAGE_SIZE_4K);
        let optional = MappableRange::new(vma.offset, vma.offset + vma.range.size());
        let (translations, result) = vma.mappable.translate(required, optional, access);

        for t in &translations {
            for src in (t.source.start..t.source.end).step_by(PAGE_SIZE_4K) {
                let va = base + (src - vma.offset);
                let pa = t.paddr + (src - t.source.start);
                self.pages.insert(va, (pa, vma.perms));
            }
        }
        if let Err(err) = result {
            debug!("page fault at {:#x} not satisfiable: {:?}", vaddr, err);
            return false;
        }
        true
    }

    /// The backing address `vaddr` is currently mapped to.
    pub fn translate(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let addr = vaddr.as_usize();
        self.pages
            .get(&align_down_4k(addr))
            .map(|&(pa, _)| pa + (addr - align_down_4k(addr)))
    }

    fn vma_at(&self, addr: usize) -> Option<&Vma> {
        self.vmas
            .range(..=addr)
            .next_back()
            .map(|(_, vma)| vma)
            .filter(|vma| vma.range.contains(addr.into()))
    }

    fn is_free(&self, start: usize, end: usize) -> bool {
        self.vmas
            .range(..end)
            .next_back()
            .is_none_or(|(_, vma)| vma.range.end.as_usize() <= start)
    }

    fn find_free_area(&self, hint: usize, len: usize) -> Option<usize> {
        let (lo, hi) = (self.range.start.as_usize(), self.range.end.as_usize());
        if hint != 0 && is_aligned_4k(hint) {
            if let Some(end) = hint.checked_add(len) {
                if hint >= lo && end <= hi && self.is_free(hint, end) {
                    return Some(hint);
                }
            }
        }
        let mut cursor = lo;
        for vma in self.vmas.values() {
            let vs = vma.range.start.as_usize();
            if vs >= cursor && vs - cursor >= len {
                return Some(cursor);
            }
            cursor = max(cursor, vma.range.end.as_usize());
        }
        (hi.saturating_sub(cursor) >= len).then_some(cursor)
    }

    fn unmap_range(&mut self, ctx: &Requester, start: usize, end: usize) {
        let keys: Vec<usize> = self
            .vmas
            .range(..end)
            .filter(|(_, vma)| vma.range.end.as_usize() > start)
            .map(|(&k, _)| k)
            .collect();

        for key in keys {
            let Some(vma) = self.vmas.remove(&key) else {
                continue;
            };
            let (vs, ve) = (vma.range.start.as_usize(), vma.range.end.as_usize());
            let (cut_start, cut_end) = (max(vs, start), min(ve, end));
            vma.mappable.remove_mapping(
                ctx,
                VirtAddrRange::new(cut_start.into(), cut_end.into()),
                vma.offset + (cut_start - vs),
            );
            if vs < cut_start {
                self.vmas.insert(vs, vma.slice(vs, cut_start));
            }
            if cut_end < ve {
                self.vmas.insert(cut_end, vma.slice(cut_end, ve));
            }
            trace!("munmap: [{:#x}, {:#x})", cut_start, cut_end);
            // vma 在此处被释放，归还其引用
        }

        let stale: Vec<usize> = self.pages.range(start..end).map(|(&va, _)| va).collect();
        for va in stale {
            self.pages.remove(&va);
        }
    }
}

impl Drop for AddrSpace {
    fn drop(&mut self) {
        if !self.vmas.is_empty() {
            debug!("dropping address space with {} live mappings", self.vmas.len());
        }
    }
}
