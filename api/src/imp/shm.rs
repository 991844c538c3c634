use axerrno::{LinuxError, LinuxResult};
use bitflags::bitflags;
use memory_addr::{VirtAddr, align_down};
use starry_shm_core::{
    config::SHMLBA,
    shm::{AttachOpts, IPC_PRIVATE, ShmInfo, ShmParams, ShmidDs},
};

use crate::task::Task;

/// IPC commands
pub const IPC_RMID: i32 = 0;
pub const IPC_SET: i32 = 1;
pub const IPC_STAT: i32 = 2;
pub const IPC_INFO: i32 = 3;

/// SHM commands
pub const SHM_LOCK: i32 = 11;
pub const SHM_UNLOCK: i32 = 12;
pub const SHM_INFO: i32 = 14;

bitflags! {
    /// Flags accepted by `shmget`, above the permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShmGetFlags: i32 {
        const IPC_CREAT = 0o1000;
        const IPC_EXCL = 0o2000;
        const SHM_HUGETLB = 0o4000;
        const SHM_NORESERVE = 0o10000;
    }
}

bitflags! {
    /// Flags accepted by `shmat`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ShmAtFlags: i32 {
        const SHM_RDONLY = 0o10000;
        const SHM_RND = 0o20000;
        const SHM_REMAP = 0o40000;
        const SHM_EXEC = 0o100000;
    }
}

/// The user buffer passed to `shmctl`, typed by what the command expects.
#[derive(Debug)]
pub enum ShmctlBuf<'a> {
    Null,
    Ds(&'a mut ShmidDs),
    Params(&'a mut ShmParams),
    Info(&'a mut ShmInfo),
}

impl ShmctlBuf<'_> {
    fn ds(&mut self) -> LinuxResult<&mut ShmidDs> {
        match self {
            Self::Ds(ds) => Ok(ds),
            _ => Err(LinuxError::EFAULT),
        }
    }
}

/// System call: shmget - get shared memory segment
///
/// # Arguments
/// * `key` - Shared memory key, or `IPC_PRIVATE` for a new anonymous segment
/// * `size` - Size of the shared memory segment in bytes
/// * `shmflg` - Flags (IPC_CREAT, IPC_EXCL) and permissions
///
/// # Returns
/// * `Ok(shmid)` - Shared memory identifier on success
/// * `Err(LinuxError)` - Error code on failure
pub fn sys_shmget(task: &Task, key: i32, size: usize, shmflg: i32) -> LinuxResult<isize> {
    debug!(
        "sys_shmget <= key: {}, size: {}, shmflg: {:#o}",
        key, size, shmflg
    );
    let flags = ShmGetFlags::from_bits_truncate(shmflg);
    if flags.intersects(ShmGetFlags::SHM_HUGETLB | ShmGetFlags::SHM_NORESERVE) {
        debug!("sys_shmget: ignoring {:?}", flags);
    }
    let mode = (shmflg & 0o777) as u32;

    let shm = task.ipc_ns().shm_registry().find_or_create(
        &task.requester(),
        key,
        size,
        mode,
        key == IPC_PRIVATE,
        flags.contains(ShmGetFlags::IPC_CREAT),
        flags.contains(ShmGetFlags::IPC_EXCL),
    )?;
    Ok(shm.id() as isize)
}

/// System call: shmat - attach shared memory segment
///
/// # Arguments
/// * `shmid` - Shared memory identifier
/// * `shmaddr` - Desired attach address (0 for system choice)
/// * `shmflg` - Flags (SHM_RDONLY, SHM_EXEC, SHM_RND, SHM_REMAP)
///
/// # Returns
/// * `Ok(addr)` - Virtual address where segment is attached
/// * `Err(LinuxError)` - Error code on failure
pub fn sys_shmat(task: &Task, shmid: i32, shmaddr: usize, shmflg: i32) -> LinuxResult<isize> {
    debug!(
        "sys_shmat <= shmid: {}, shmaddr: {:#x}, shmflg: {:#o}",
        shmid, shmaddr, shmflg
    );
    let flags = ShmAtFlags::from_bits_truncate(shmflg);

    let mut addr = shmaddr;
    if addr % SHMLBA != 0 {
        if !flags.contains(ShmAtFlags::SHM_RND) {
            return Err(LinuxError::EINVAL);
        }
        addr = align_down(addr, SHMLBA);
    }
    if addr == 0 && flags.contains(ShmAtFlags::SHM_REMAP) {
        // "SHM_REMAP was specified and shmaddr was NULL." - man shmat(2)
        return Err(LinuxError::EINVAL);
    }

    let ctx = task.requester();
    let mut aspace = task.aspace.lock();
    let shm = task
        .ipc_ns()
        .shm_registry()
        .find_by_id(shmid)
        .ok_or(LinuxError::EINVAL)?;

    if addr != 0
        && !flags.contains(ShmAtFlags::SHM_REMAP)
        && aspace.overlaps(VirtAddr::from(addr), shm.effective_size())
    {
        return Err(LinuxError::EINVAL);
    }

    let opts = shm.attach(
        &ctx,
        VirtAddr::from(addr),
        AttachOpts {
            execute: flags.contains(ShmAtFlags::SHM_EXEC),
            readonly: flags.contains(ShmAtFlags::SHM_RDONLY),
            // An explicit address is always honored exactly.
            remap: addr != 0,
        },
    )?;
    let start = aspace.mmap(&ctx, opts)?;
    debug!("sys_shmat: shm {} attached at {:#x}", shmid, start);
    Ok(start.as_usize() as isize)
}

/// System call: shmdt - detach shared memory segment
///
/// # Arguments
/// * `shmaddr` - Address returned by a previous `shmat`
///
/// # Returns
/// * `Ok(0)` - Success
/// * `Err(LinuxError)` - `EINVAL` if no segment is attached at `shmaddr`
pub fn sys_shmdt(task: &Task, shmaddr: usize) -> LinuxResult<isize> {
    debug!("sys_shmdt <= shmaddr: {:#x}", shmaddr);
    let ctx = task.requester();
    task.aspace
        .lock()
        .detach_shm(&ctx, VirtAddr::from(shmaddr))?;
    Ok(0)
}

/// System call: shmctl - shared memory control operations
///
/// # Arguments
/// * `shmid` - Shared memory identifier; ignored by `IPC_INFO` and `SHM_INFO`
/// * `cmd` - Control command (IPC_STAT, IPC_SET, IPC_RMID, IPC_INFO, SHM_INFO,
///   SHM_LOCK, SHM_UNLOCK)
/// * `buf` - Buffer for the command's input or output
///
/// # Returns
/// * `Ok(0)` - Success
/// * `Err(LinuxError)` - Error code on failure
pub fn sys_shmctl(task: &Task, shmid: i32, cmd: i32, mut buf: ShmctlBuf) -> LinuxResult<isize> {
    debug!("sys_shmctl <= shmid: {}, cmd: {}", shmid, cmd);
    let registry = task.ipc_ns().shm_registry();

    match cmd {
        IPC_INFO => {
            let ShmctlBuf::Params(params) = buf else {
                return Err(LinuxError::EFAULT);
            };
            *params = registry.ipc_info();
            // TODO: Linux returns the highest used index for IPC_INFO and SHM_INFO.
            return Ok(0);
        }
        SHM_INFO => {
            let ShmctlBuf::Info(info) = buf else {
                return Err(LinuxError::EFAULT);
            };
            *info = registry.shm_info();
            return Ok(0);
        }
        _ => {}
    }

    let shm = registry.find_by_id(shmid).ok_or(LinuxError::EINVAL)?;
    let ctx = task.requester();

    match cmd {
        IPC_STAT => {
            let ds = shm.stat(&ctx)?;
            *buf.ds()? = ds;
            Ok(0)
        }
        IPC_SET => {
            let ds = *buf.ds()?;
            shm.set(&ctx, ds.shm_perm.uid, ds.shm_perm.gid, ds.shm_perm.mode)?;
            Ok(0)
        }
        IPC_RMID => {
            // "The caller must be the owner or creator of the segment, or be
            // privileged." - man shmctl(2)
            if !shm.is_owned_by(&ctx.creds) {
                return Err(LinuxError::EPERM);
            }
            shm.mark_destroyed();
            Ok(0)
        }
        SHM_LOCK | SHM_UNLOCK => {
            // 暂不支持内存锁定
            Ok(0)
        }
        _ => {
            warn!("sys_shmctl: unsupported command {}", cmd);
            Err(LinuxError::EINVAL)
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use core::time::Duration;

    use memory_addr::{PAGE_SIZE_4K, PhysAddr, PhysAddrRange, VirtAddrRange};
    use starry_shm_core::{
        cred::{Credentials, KGid, KUid, UserNamespace},
        ipc::IpcNamespace,
        mem::FrameAllocator,
        shm::SHM_DEST,
    };

    use super::*;
    use crate::task::ManualClock;

    const USER_BASE: usize = 0x1000_0000;

    fn ns() -> (Arc<UserNamespace>, Arc<IpcNamespace>) {
        let user_ns = UserNamespace::root();
        let mem = Arc::new(FrameAllocator::new(PhysAddrRange::from_start_size(
            PhysAddr::from(0x8000_0000),
            256 * PAGE_SIZE_4K,
        )));
        let ipc = IpcNamespace::new(user_ns.clone(), mem);
        (user_ns, ipc)
    }

    fn task(user_ns: &Arc<UserNamespace>, ipc: &Arc<IpcNamespace>, pid: u32, uid: u32) -> Task {
        let creds = Credentials::new(KUid(uid), KGid(uid), user_ns.clone());
        Task::new(
            pid,
            Arc::new(creds),
            ipc.clone(),
            Arc::new(ManualClock::new(Duration::from_secs(pid as u64))),
            VirtAddrRange::from_start_size(USER_BASE.into(), 0x100_0000),
        )
    }

    fn stat(task: &Task, id: i32) -> LinuxResult<ShmidDs> {
        let mut ds = ShmidDs::default();
        sys_shmctl(task, id, IPC_STAT, ShmctlBuf::Ds(&mut ds))?;
        Ok(ds)
    }

    #[test]
    fn shmget_flags() {
        let (user_ns, ipc) = ns();
        let t = task(&user_ns, &ipc, 1, 1000);
        assert_eq!(sys_shmget(&t, 5, 100, 0o600), Err(LinuxError::ENOENT));
        let id = sys_shmget(&t, 5, 100, 0o1600).unwrap();
        assert_eq!(sys_shmget(&t, 5, 100, 0o600), Ok(id));
        assert_eq!(sys_shmget(&t, 5, 100, 0o3600), Err(LinuxError::EEXIST));
        // Huge page and no-reserve requests are accepted and ignored.
        assert!(sys_shmget(&t, 6, 100, 0o15600).is_ok());
        let a = sys_shmget(&t, IPC_PRIVATE, 100, 0o600).unwrap();
        let b = sys_shmget(&t, IPC_PRIVATE, 100, 0o600).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn shmat_address_rules() {
        let (user_ns, ipc) = ns();
        let t = task(&user_ns, &ipc, 1, 1000);
        let id = sys_shmget(&t, IPC_PRIVATE, 100, 0o600).unwrap() as i32;

        let unaligned = USER_BASE + 0x10;
        assert_eq!(sys_shmat(&t, id, unaligned, 0), Err(LinuxError::EINVAL));
        let addr = sys_shmat(&t, id, unaligned, ShmAtFlags::SHM_RND.bits()).unwrap();
        assert_eq!(addr as usize, USER_BASE);

        // Occupied without SHM_REMAP.
        assert_eq!(sys_shmat(&t, id, USER_BASE, 0), Err(LinuxError::EINVAL));
        let again = sys_shmat(&t, id, USER_BASE, ShmAtFlags::SHM_REMAP.bits()).unwrap();
        assert_eq!(again, addr);
        assert_eq!(
            sys_shmat(&t, id, 0, ShmAtFlags::SHM_REMAP.bits()),
            Err(LinuxError::EINVAL)
        );
        assert_eq!(sys_shmat(&t, 999, 0, 0), Err(LinuxError::EINVAL));

        // The replaced attachment gave its reference back.
        assert_eq!(stat(&t, id).unwrap().shm_nattch, 1);
    }

    #[test]
    fn shmat_readonly_needs_only_read() {
        let (user_ns, ipc) = ns();
        let owner = task(&user_ns, &ipc, 1, 1000);
        let other = task(&user_ns, &ipc, 2, 2000);
        let id = sys_shmget(&owner, 9, 100, 0o1644).unwrap() as i32;
        assert_eq!(sys_shmat(&other, id, 0, 0), Err(LinuxError::EACCES));
        let addr = sys_shmat(&other, id, 0, ShmAtFlags::SHM_RDONLY.bits()).unwrap();
        let aspace = other.aspace.lock();
        assert!(aspace.find_area(VirtAddr::from(addr as usize)).is_some());
    }

    #[test]
    fn shmdt_requires_attach_address() {
        let (user_ns, ipc) = ns();
        let t = task(&user_ns, &ipc, 1, 1000);
        let id = sys_shmget(&t, IPC_PRIVATE, 2 * PAGE_SIZE_4K, 0o600).unwrap() as i32;
        let addr = sys_shmat(&t, id, 0, 0).unwrap() as usize;
        assert_eq!(sys_shmdt(&t, addr + PAGE_SIZE_4K), Err(LinuxError::EINVAL));
        assert_eq!(sys_shmdt(&t, addr), Ok(0));
        assert_eq!(sys_shmdt(&t, addr), Err(LinuxError::EINVAL));
        assert_eq!(stat(&t, id).unwrap().shm_nattch, 0);
    }

    #[test]
    fn shmctl_rmid_requires_ownership() {
        let (user_ns, ipc) = ns();
        let owner = task(&user_ns, &ipc, 1, 1000);
        let other = task(&user_ns, &ipc, 2, 2000);
        let id = sys_shmget(&owner, 9, 100, 0o1666).unwrap() as i32;
        assert_eq!(
            sys_shmctl(&other, id, IPC_RMID, ShmctlBuf::Null),
            Err(LinuxError::EPERM)
        );
        let addr = sys_shmat(&owner, id, 0, 0).unwrap() as usize;
        assert_eq!(sys_shmctl(&owner, id, IPC_RMID, ShmctlBuf::Null), Ok(0));

        let ds = stat(&owner, id).unwrap();
        assert_eq!(ds.shm_perm.mode & SHM_DEST, SHM_DEST);
        assert_eq!(sys_shmget(&owner, 9, 100, 0o600), Err(LinuxError::ENOENT));

        sys_shmdt(&owner, addr).unwrap();
        assert_eq!(stat(&owner, id), Err(LinuxError::EINVAL));
    }

    #[test]
    fn shmctl_set_and_stat() {
        let (user_ns, ipc) = ns();
        let owner = task(&user_ns, &ipc, 7, 1000);
        let id = sys_shmget(&owner, 9, 100, 0o1600).unwrap() as i32;

        let mut ds = stat(&owner, id).unwrap();
        assert_eq!(ds.shm_cpid, 7);
        assert_eq!(ds.shm_ctime, 7);
        ds.shm_perm.mode = 0o640;
        ds.shm_perm.gid = 3000;
        assert_eq!(sys_shmctl(&owner, id, IPC_SET, ShmctlBuf::Ds(&mut ds)), Ok(0));

        let ds = stat(&owner, id).unwrap();
        assert_eq!(ds.shm_perm.mode, 0o640);
        assert_eq!(ds.shm_perm.gid, 3000);
        assert_eq!(
            sys_shmctl(&owner, id, IPC_STAT, ShmctlBuf::Null),
            Err(LinuxError::EFAULT)
        );
        assert_eq!(
            sys_shmctl(&owner, id, 42, ShmctlBuf::Null),
            Err(LinuxError::EINVAL)
        );
        assert_eq!(sys_shmctl(&owner, id, SHM_LOCK, ShmctlBuf::Null), Ok(0));
    }

    #[test]
    fn shmctl_info_commands() {
        let (user_ns, ipc) = ns();
        let t = task(&user_ns, &ipc, 1, 1000);
        sys_shmget(&t, 1, 3 * PAGE_SIZE_4K, 0o1600).unwrap();

        let mut params = ShmParams::default();
        assert_eq!(
            sys_shmctl(&t, 0, IPC_INFO, ShmctlBuf::Params(&mut params)),
            Ok(0)
        );
        assert_eq!(params.shmmni, 4096);

        let mut info = ShmInfo::default();
        assert_eq!(sys_shmctl(&t, 0, SHM_INFO, ShmctlBuf::Info(&mut info)), Ok(0));
        assert_eq!(info.shm_tot, 3);
        assert_eq!(
            sys_shmctl(&t, 0, SHM_INFO, ShmctlBuf::Params(&mut params)),
            Err(LinuxError::EFAULT)
        );
    }
}
