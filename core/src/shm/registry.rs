use alloc::{
    collections::btree_map::BTreeMap,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::time::Duration;

use axerrno::{LinuxError, LinuxResult};
use memory_addr::align_down_4k;
use spin::Mutex;

use super::{
    FilePermissions, IPC_PRIVATE, ShmInfo, ShmParams, requested_access,
    segment::{FileOwner, NewShm, Shm},
};
use crate::{
    config::{PAGE_SIZE, ShmLimits},
    cred::UserNamespace,
    ctx::Requester,
    mem::BackingMemory,
};

struct RegistryInner {
    /// 共享内存段表，按 shmid 索引
    shms: BTreeMap<i32, Arc<Shm>>,
    /// Sum of the page-rounded sizes of all segments in `shms`, in pages.
    total_pages: usize,
    last_id_used: i32,
}

/// All shared memory segments of one IPC namespace.
///
/// The registry creates and finds segments, and reports global shm
/// parameters. It holds one reference to every live segment, dropped when the
/// segment is destroyed.
pub struct Registry {
    /// Owner of the IPC namespace this registry belongs to.
    user_ns: Arc<UserNamespace>,
    mem: Arc<dyn BackingMemory>,
    limits: ShmLimits,
    this: Weak<Registry>,
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new(user_ns: Arc<UserNamespace>, mem: Arc<dyn BackingMemory>) -> Arc<Self> {
        Self::with_limits(user_ns, mem, ShmLimits::default())
    }

    pub fn with_limits(
        user_ns: Arc<UserNamespace>,
        mem: Arc<dyn BackingMemory>,
        limits: ShmLimits,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            user_ns,
            mem,
            limits,
            this: this.clone(),
            inner: Mutex::new(RegistryInner {
                shms: BTreeMap::new(),
                total_pages: 0,
                last_id_used: 0,
            }),
        })
    }

    /// Looks up a segment by id.
    pub fn find_by_id(&self, id: i32) -> Option<Arc<Shm>> {
        self.inner.lock().shms.get(&id).cloned()
    }

    /// Number of live segments.
    pub fn len(&self) -> usize {
        self.inner.lock().shms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pages used by all live segments.
    pub fn total_pages(&self) -> usize {
        self.inner.lock().total_pages
    }

    /// Looks up or creates a segment. The counterpart of `open(2)` for shm.
    ///
    /// `private` always creates a new segment, which is never found by key.
    #[allow(clippy::too_many_arguments)]
    pub fn find_or_create(
        &self,
        ctx: &Requester,
        key: i32,
        size: usize,
        mode: u32,
        private: bool,
        create: bool,
        exclusive: bool,
    ) -> LinuxResult<Arc<Shm>> {
        if (create || private) && (size < self.limits.min_size || size > self.limits.max_size) {
            // "A new segment was to be created and size is less than SHMMIN or
            // greater than SHMMAX." - man shmget(2)
            return Err(LinuxError::EINVAL);
        }

        let mut inner = self.inner.lock();

        if inner.shms.len() >= self.limits.max_segments {
            // "All possible shared memory IDs have been taken (SHMMNI) ..."
            //   - man shmget(2)
            return Err(LinuxError::ENOSPC);
        }

        if !private {
            if let Some(shm) = Self::find_by_key(&inner, key) {
                if !shm.check_access(&ctx.creds, requested_access(mode)) {
                    // "The user does not have permission to access the shared
                    // memory segment, and does not have the CAP_IPC_OWNER
                    // capability in the user namespace that governs its IPC
                    // namespace." - man shmget(2)
                    return Err(LinuxError::EACCES);
                }
                if size > shm.size() {
                    // "A segment for the given key exists, but size is greater
                    // than the size of that segment." - man shmget(2)
                    return Err(LinuxError::EINVAL);
                }
                if create && exclusive {
                    // "IPC_CREAT and IPC_EXCL were specified in shmflg, but a
                    // shared memory segment already exists for key."
                    //   - man shmget(2)
                    return Err(LinuxError::EEXIST);
                }
                return Ok(shm);
            }

            if !create {
                // "No segment exists for the given key, and IPC_CREAT was not
                // specified." - man shmget(2)
                return Err(LinuxError::ENOENT);
            }
        }

        let effective_size = size
            .checked_add(PAGE_SIZE - 1)
            .map(align_down_4k)
            .ok_or(LinuxError::EINVAL)?;
        let pages = effective_size / PAGE_SIZE;
        if inner
            .total_pages
            .checked_add(pages)
            .is_none_or(|total| total > self.limits.max_total_pages)
        {
            // "... allocating a segment of the requested size would cause the
            // system to exceed the system-wide limit on shared memory
            // (SHMALL)." - man shmget(2)
            return Err(LinuxError::ENOSPC);
        }

        let Some(id) = self.next_free_id(&inner) else {
            warn!("shm ids exhausted, they may be leaking");
            return Err(LinuxError::ENOSPC);
        };

        let backing = self.mem.allocate(effective_size)?;
        let shm = Arc::new(Shm::new(NewShm {
            registry: self.this.clone(),
            mem: self.mem.clone(),
            user_ns: self.user_ns.clone(),
            id,
            key: if private { IPC_PRIVATE } else { key },
            creator: FileOwner::of(&ctx.creds),
            creator_pid: ctx.tgid.unwrap_or(0),
            perms: FilePermissions::from_mode(mode),
            size,
            backing,
            now: ctx.now.unwrap_or(Duration::ZERO),
        }));

        inner.shms.insert(id, shm.clone());
        inner.last_id_used = id;
        inner.total_pages += pages;
        debug!(
            "shm {} created: key={} size={} pages={}",
            id, key, size, pages
        );
        Ok(shm)
    }

    /// Reports the configured limits. See `shmctl(IPC_INFO)`.
    pub fn ipc_info(&self) -> ShmParams {
        ShmParams {
            shmmax: self.limits.max_size as u64,
            shmmin: self.limits.min_size as u64,
            shmmni: self.limits.max_segments as u64,
            shmseg: self.limits.max_attach_per_process as u64,
            shmall: self.limits.max_total_pages as u64,
            ..Default::default()
        }
    }

    /// Reports current usage. See `shmctl(SHM_INFO)`.
    pub fn shm_info(&self) -> ShmInfo {
        let inner = self.inner.lock();
        ShmInfo {
            used_ids: inner.last_id_used,
            shm_tot: inner.total_pages as u64,
            // Everything is resident; there is no swap.
            shm_rss: inner.total_pages as u64,
            shm_swp: 0,
            ..Default::default()
        }
    }

    /// Marks every segment for destruction; used when the IPC namespace goes
    /// away. Segments still mapped live on until they are unmapped.
    pub fn release_all(&self) {
        let shms: Vec<Arc<Shm>> = self.inner.lock().shms.values().cloned().collect();
        for shm in shms {
            shm.mark_destroyed();
        }
    }

    /// Unregisters a segment being destroyed.
    ///
    /// To preserve lock ordering, the caller must not hold the segment's lock.
    pub(super) fn remove(&self, shm: &Shm) {
        let mut inner = self.inner.lock();
        if inner.shms.remove(&shm.id()).is_some() {
            inner.total_pages -= shm.pages();
        }
    }

    fn find_by_key(inner: &RegistryInner, key: i32) -> Option<Arc<Shm>> {
        if key == IPC_PRIVATE {
            return None;
        }
        inner.shms.values().find(|shm| shm.key() == key).cloned()
    }

    /// The first free id after the last one used, wrapping around to zero.
    fn next_free_id(&self, inner: &RegistryInner) -> Option<i32> {
        let max_id = self.limits.max_id;
        let mut id = inner.last_id_used;
        loop {
            id = if id >= max_id { 0 } else { id + 1 };
            if !inner.shms.contains_key(&id) {
                return Some(id);
            }
            if id == inner.last_id_used {
                return None;
            }
        }
    }
}

impl core::fmt::Debug for Registry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Registry")
            .field("segments", &inner.shms.len())
            .field("total_pages", &inner.total_pages)
            .field("last_id_used", &inner.last_id_used)
            .finish()
    }
}
