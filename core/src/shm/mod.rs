//! System V shared memory segments.
//!
//! Known missing features:
//!
//! - `SHM_LOCK`/`SHM_UNLOCK` are no-ops; memory locking is not implemented.
//! - `SHM_HUGETLB` and related `shmget` flags are ignored.
//! - `SHM_NORESERVE` is ignored, there is no swap to reserve.
//! - No per-process segment count enforcement. Linux defaults the per-process
//!   limit to the system-wide one anyway.
//!
//! Lock ordering: address space -> registry -> segment.

mod registry;
mod segment;

pub use self::{
    registry::Registry,
    segment::{AttachOpts, FileOwner, Lifetime, Shm},
};

use crate::mm::AccessType;

/// The key of segments that can't be found by key.
pub const IPC_PRIVATE: i32 = 0;

/// `shm_perm.mode` bit reported for segments marked for destruction.
pub const SHM_DEST: u16 = 0o1000;

/// Device number reported for every segment mapping.
pub const SHM_DEVICE_ID: u64 = 0x0000_0001_0000_0000;

/// The `rwx` triads of a segment's mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilePermissions {
    pub user: AccessType,
    pub group: AccessType,
    pub other: AccessType,
}

impl FilePermissions {
    /// Takes the low 9 bits of `mode`.
    pub fn from_mode(mode: u32) -> Self {
        let triad = |shift: u32| AccessType::from_bits_truncate(((mode >> shift) & 0o7) as u8);
        Self {
            user: triad(6),
            group: triad(3),
            other: triad(0),
        }
    }

    pub fn linux_mode(&self) -> u16 {
        ((self.user.bits() as u16) << 6) | ((self.group.bits() as u16) << 3) | self.other.bits() as u16
    }
}

/// The access asked for by a `shmget` mode: the union of its three triads.
pub fn requested_access(mode: u32) -> AccessType {
    AccessType::from_bits_truncate((((mode >> 6) | (mode >> 3) | mode) & 0o7) as u8)
}

/// `struct ipc64_perm`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IpcPerm {
    pub key: i32,
    pub uid: u32,
    pub gid: u32,
    pub cuid: u32,
    pub cgid: u32,
    pub mode: u16,
    pub _pad1: u16,
    pub seq: u16,
    pub _pad2: u16,
    pub _unused1: u64,
    pub _unused2: u64,
}

/// `struct shmid64_ds`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShmidDs {
    pub shm_perm: IpcPerm,
    pub shm_segsz: usize,
    pub shm_atime: i64,
    pub shm_dtime: i64,
    pub shm_ctime: i64,
    pub shm_cpid: i32,
    pub shm_lpid: i32,
    pub shm_nattch: u64,
    pub _unused4: u64,
    pub _unused5: u64,
}

/// `struct shminfo64`, reported by `IPC_INFO`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShmParams {
    pub shmmax: u64,
    pub shmmin: u64,
    pub shmmni: u64,
    pub shmseg: u64,
    pub shmall: u64,
    pub _unused1: u64,
    pub _unused2: u64,
    pub _unused3: u64,
    pub _unused4: u64,
}

/// `struct shm_info`, reported by `SHM_INFO`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShmInfo {
    pub used_ids: i32,
    pub shm_tot: u64,
    pub shm_rss: u64,
    pub shm_swp: u64,
    pub swap_attempts: u64,
    pub swap_successes: u64,
}
