use alloc::{
    format,
    string::String,
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
use core::{
    any::Any,
    sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering},
    time::Duration,
};

use axerrno::{LinuxError, LinuxResult};
use memory_addr::{PhysAddrRange, VirtAddr, VirtAddrRange};
use spin::Mutex;

use super::{FilePermissions, IPC_PRIVATE, IpcPerm, Registry, SHM_DEST, SHM_DEVICE_ID, ShmidDs};
use crate::{
    Pid,
    config::PAGE_SIZE,
    cred::{Capabilities, Credentials, KGid, KUid, UserNamespace},
    ctx::Requester,
    mem::BackingMemory,
    mm::{
        AccessType, Mappable, MappableRange, MappingIdentity, MappingRef, MmapOpts, Translation,
    },
};

/// Owner or creator of a segment, as kernel ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOwner {
    pub uid: KUid,
    pub gid: KGid,
}

impl FileOwner {
    pub fn of(creds: &Credentials) -> Self {
        Self {
            uid: creds.euid,
            gid: creds.egid,
        }
    }
}

/// Flags passed to `shmat`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AttachOpts {
    pub execute: bool,
    pub readonly: bool,
    pub remap: bool,
}

impl AttachOpts {
    fn access(&self) -> AccessType {
        let mut access = AccessType::READ;
        if !self.readonly {
            access |= AccessType::WRITE;
        }
        if self.execute {
            access |= AccessType::EXECUTE;
        }
        access
    }
}

/// Where a segment is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// Reachable from the registry. Lives on with no mappings.
    Active,
    /// Removed with `IPC_RMID`. Torn down when the last mapping goes away.
    PendingDestruction,
}

struct ShmInner {
    perms: FilePermissions,
    owner: FileOwner,
    /// Updated on every successful attach.
    attach_time: Duration,
    /// Updated on every successful detach.
    detach_time: Duration,
    /// Updated on creation and on every `IPC_SET`.
    change_time: Duration,
    last_attach_detach_pid: Pid,
    lifetime: Lifetime,
}

/// A single shared memory segment.
///
/// A segment is backed by one allocation from [`BackingMemory`] and is always
/// mapped as a whole, so it only needs to count the mappings referencing it,
/// not track them. Mapping references are taken by [`attach`](Self::attach)
/// and by copies of [`MappingRef`].
///
/// The segment stays alive with no mappings until it is marked for
/// destruction; after that it is destroyed as soon as the mapping count drops
/// to zero.
pub struct Shm {
    registry: Weak<Registry>,
    mem: Arc<dyn BackingMemory>,
    /// Namespace whose capabilities override permission checks.
    user_ns: Arc<UserNamespace>,

    id: i32,
    creator: FileOwner,
    creator_pid: Pid,
    /// Requested size in bytes.
    size: usize,
    /// `size` rounded up to whole pages. Always a multiple of the page size.
    effective_size: usize,
    backing: PhysAddrRange,

    /// Public lookup key. Becomes [`IPC_PRIVATE`] once marked for destruction.
    key: AtomicI32,
    /// References held by mappings and by attaches still being installed.
    /// Only decremented with `inner` held.
    mappings: AtomicUsize,
    destroyed: AtomicBool,

    inner: Mutex<ShmInner>,
}

pub(super) struct NewShm {
    pub registry: Weak<Registry>,
    pub mem: Arc<dyn BackingMemory>,
    pub user_ns: Arc<UserNamespace>,
    pub id: i32,
    pub key: i32,
    pub creator: FileOwner,
    pub creator_pid: Pid,
    pub perms: FilePermissions,
    pub size: usize,
    pub backing: PhysAddrRange,
    pub now: Duration,
}

impl Shm {
    pub(super) fn new(args: NewShm) -> Self {
        Self {
            registry: args.registry,
            mem: args.mem,
            user_ns: args.user_ns,
            id: args.id,
            creator: args.creator,
            creator_pid: args.creator_pid,
            size: args.size,
            effective_size: args.backing.size(),
            backing: args.backing,
            key: AtomicI32::new(args.key),
            mappings: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            inner: Mutex::new(ShmInner {
                perms: args.perms,
                owner: args.creator,
                attach_time: Duration::ZERO,
                detach_time: Duration::ZERO,
                change_time: args.now,
                last_attach_detach_pid: 0,
                lifetime: Lifetime::Active,
            }),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn key(&self) -> i32 {
        self.key.load(Ordering::Acquire)
    }

    /// The size requested at creation.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The size of the backing allocation, which may be larger than the
    /// requested size due to page rounding.
    pub fn effective_size(&self) -> usize {
        self.effective_size
    }

    pub(super) fn pages(&self) -> usize {
        self.effective_size / PAGE_SIZE
    }

    pub fn lifetime(&self) -> Lifetime {
        self.inner.lock().lifetime
    }

    /// Number of mappings currently referencing the segment.
    pub fn attach_count(&self) -> usize {
        self.mappings.load(Ordering::Acquire)
    }

    /// Creates a mapping configuration for attaching the segment at `addr`.
    ///
    /// On success the returned options carry a reference to the segment,
    /// released when they are dropped. The installed mapping takes its own
    /// reference, so the segment can't be destroyed in between.
    pub fn attach(
        self: &Arc<Self>,
        ctx: &Requester,
        addr: VirtAddr,
        opts: AttachOpts,
    ) -> LinuxResult<MmapOpts> {
        let mut inner = self.inner.lock();
        let pending = inner.lifetime == Lifetime::PendingDestruction;
        if pending && self.mappings.load(Ordering::Acquire) == 0 {
            return Err(LinuxError::EIDRM);
        }

        let access = opts.access();
        if !self.check_permissions(&inner, &ctx.creds, access) {
            // "The calling process does not have the required permissions for
            // the requested attach type, and does not have the CAP_IPC_OWNER
            // capability in the user namespace that governs its IPC
            // namespace." - man shmat(2)
            return Err(LinuxError::EACCES);
        }

        // The count only drops under the segment lock, so it can't reach zero
        // between the check above and this increment.
        self.mappings.fetch_add(1, Ordering::AcqRel);

        if let Some(now) = ctx.now {
            inner.attach_time = now;
        }
        if let Some(pid) = ctx.tgid {
            inner.last_attach_detach_pid = pid;
        }

        Ok(MmapOpts {
            length: self.size,
            offset: 0,
            addr,
            fixed: opts.remap,
            perms: access,
            max_perms: AccessType::all(),
            mappable: self.clone(),
            identity: MappingRef::adopt(self.clone()),
        })
    }

    /// Reports the segment's attributes. See `shmctl(IPC_STAT)`.
    pub fn stat(&self, ctx: &Requester) -> LinuxResult<ShmidDs> {
        let inner = self.inner.lock();

        // "The caller must have read permission on the shared memory segment."
        //   - man shmctl(2)
        if !self.check_permissions(&inner, &ctx.creds, AccessType::READ) {
            return Err(LinuxError::EACCES);
        }

        let mut mode = inner.perms.linux_mode();
        if inner.lifetime == Lifetime::PendingDestruction {
            mode |= SHM_DEST;
        }
        let ns = &ctx.creds.user_ns;

        Ok(ShmidDs {
            shm_perm: IpcPerm {
                key: self.key(),
                uid: ns.map_from_kuid(inner.owner.uid),
                gid: ns.map_from_kgid(inner.owner.gid),
                cuid: ns.map_from_kuid(self.creator.uid),
                cgid: ns.map_from_kgid(self.creator.gid),
                mode,
                // IPC sequence numbers are not supported.
                seq: 0,
                ..Default::default()
            },
            shm_segsz: self.size,
            shm_atime: inner.attach_time.as_secs() as i64,
            shm_dtime: inner.detach_time.as_secs() as i64,
            shm_ctime: inner.change_time.as_secs() as i64,
            shm_cpid: self.creator_pid as i32,
            shm_lpid: inner.last_attach_detach_pid as i32,
            shm_nattch: self.mappings.load(Ordering::Acquire) as u64,
            ..Default::default()
        })
    }

    /// Changes the owner and mode of the segment. See `shmctl(IPC_SET)`.
    ///
    /// `uid` and `gid` are interpreted in the requester's user namespace.
    pub fn set(&self, ctx: &Requester, uid: u32, gid: u32, mode: u16) -> LinuxResult {
        let mut inner = self.inner.lock();

        if !self.check_ownership(&inner, &ctx.creds) {
            return Err(LinuxError::EPERM);
        }

        let ns = &ctx.creds.user_ns;
        let (Some(uid), Some(gid)) = (ns.map_to_kuid(uid), ns.map_to_kgid(gid)) else {
            return Err(LinuxError::EINVAL);
        };

        // Only the lower 9 bits of the mode may be changed; the others are
        // always 0 for a segment.
        inner.perms = FilePermissions::from_mode((mode & 0o777) as u32);
        inner.owner = FileOwner { uid, gid };
        if let Some(now) = ctx.now {
            inner.change_time = now;
        }
        Ok(())
    }

    /// Whether `creds` may act as the segment's owner.
    pub fn is_owned_by(&self, creds: &Credentials) -> bool {
        let inner = self.inner.lock();
        self.check_ownership(&inner, creds)
    }

    /// Marks the segment for destruction. See `shmctl(IPC_RMID)`.
    ///
    /// The segment can no longer be found by key, and is destroyed right away
    /// if nothing maps it, otherwise when the last mapping goes away.
    ///
    /// The caller must not hold the registry lock.
    pub fn mark_destroyed(&self) {
        let idle = {
            let mut inner = self.inner.lock();
            self.key.store(IPC_PRIVATE, Ordering::Release);
            inner.lifetime = Lifetime::PendingDestruction;
            self.mappings.load(Ordering::Acquire) == 0
        };
        // The segment lock is dropped: destruction takes the registry lock.
        if idle {
            self.destroy();
        }
    }

    /// Drops one mapping reference.
    ///
    /// The decrement and the destroy decision happen under the segment lock,
    /// like in [`attach`](Self::attach) and [`mark_destroyed`](Self::mark_destroyed),
    /// so a reference taken after the count hit zero is always seen.
    fn release(&self) {
        let idle = {
            let inner = self.inner.lock();
            let prev = self.mappings.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0, "shm {} reference underflow", self.id);
            prev == 1 && inner.lifetime == Lifetime::PendingDestruction
        };
        if idle {
            self.destroy();
        }
    }

    /// Runs at most once.
    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("shm {} destroyed, releasing {:?}", self.id, self.backing);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self);
        }
        self.mem.release(self.backing);
    }

    /// Verifies whether `creds` may act as an owner. See
    /// ipc/util.c:ipcctl_obtain_check() in Linux.
    fn check_ownership(&self, inner: &ShmInner, creds: &Credentials) -> bool {
        if inner.owner.uid == creds.euid || self.creator.uid == creds.euid {
            return true;
        }
        // Tasks with CAP_SYS_ADMIN may bypass ownership checks. Linux doesn't
        // use CAP_IPC_OWNER here, despite its documentation.
        creds.has_capability_in(Capabilities::CAP_SYS_ADMIN, &self.user_ns)
    }

    /// Verifies whether `creds` has access `req` to the segment. See
    /// ipc/util.c:ipcperms() in Linux.
    fn check_permissions(&self, inner: &ShmInner, creds: &Credentials, req: AccessType) -> bool {
        let granted = if inner.owner.uid == creds.euid {
            inner.perms.user
        } else if creds.in_group(inner.owner.gid) {
            inner.perms.group
        } else {
            inner.perms.other
        };
        if granted.contains(req) {
            return true;
        }
        // Tasks with CAP_IPC_OWNER may bypass permission checks.
        creds.has_capability_in(Capabilities::CAP_IPC_OWNER, &self.user_ns)
    }

    pub(super) fn check_access(&self, creds: &Credentials, req: AccessType) -> bool {
        let inner = self.inner.lock();
        self.check_permissions(&inner, creds, req)
    }
}

impl Mappable for Shm {
    fn add_mapping(&self, ctx: &Requester, _ar: VirtAddrRange, _offset: usize) -> LinuxResult {
        let mut inner = self.inner.lock();
        if let Some(now) = ctx.now {
            inner.attach_time = now;
        }
        match ctx.tgid {
            Some(pid) => inner.last_attach_detach_pid = pid,
            None => debug!(
                "adding mapping to shm {} without a pid; not updating the last attach pid",
                self.id
            ),
        }
        Ok(())
    }

    fn remove_mapping(&self, ctx: &Requester, _ar: VirtAddrRange, _offset: usize) {
        let mut inner = self.inner.lock();
        // Mappings are also removed while an exiting task's address space is
        // torn down, with no clock or thread group at hand. Nobody can observe
        // the detach time or pid not being updated then.
        if let Some(now) = ctx.now {
            inner.detach_time = now;
        }
        match ctx.tgid {
            Some(pid) => inner.last_attach_detach_pid = pid,
            None => debug!(
                "removing mapping from shm {} without a pid; not updating the last detach pid",
                self.id
            ),
        }
    }

    fn copy_mapping(
        &self,
        _ctx: &Requester,
        _src: VirtAddrRange,
        _dst: VirtAddrRange,
        _offset: usize,
    ) -> LinuxResult {
        Ok(())
    }

    fn translate(
        &self,
        required: MappableRange,
        optional: MappableRange,
        _at: AccessType,
    ) -> (Vec<Translation>, LinuxResult) {
        let len = self.backing.size();
        let result = if required.end > len {
            Err(LinuxError::EFAULT)
        } else {
            Ok(())
        };
        let source = optional.intersect(&MappableRange::new(0, len));
        if source.is_empty() {
            return (Vec::new(), result);
        }
        let translation = Translation {
            source,
            backing: self.backing,
            paddr: self.backing.start + source.start,
        };
        (vec![translation], result)
    }
}

impl MappingIdentity for Shm {
    fn inc_ref(&self) {
        // Only holders of a reference clone it, so the count is never zero here.
        self.mappings.fetch_add(1, Ordering::AcqRel);
    }

    fn dec_ref(&self) {
        self.release();
    }

    fn mapped_name(&self) -> String {
        format!("SYSV{:08}", self.key())
    }

    fn device_id(&self) -> u64 {
        SHM_DEVICE_ID
    }

    fn inode_id(&self) -> u64 {
        // "shmid gets reported as "inode#" in /proc/pid/maps. proc-ps tools
        // use this. Changing this will break them." -- Linux, ipc/shm.c
        self.id as u64
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl core::fmt::Debug for Shm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Shm")
            .field("id", &self.id)
            .field("key", &self.key())
            .field("size", &self.size)
            .field("effective_size", &self.effective_size)
            .field("mappings", &self.attach_count())
            .finish()
    }
}
