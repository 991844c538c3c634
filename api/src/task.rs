//! The calling task, as seen by the shm system calls.

use alloc::sync::Arc;
use core::{
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

use axerrno::LinuxResult;
use memory_addr::VirtAddrRange;
use spin::Mutex;
use starry_shm_core::{Pid, cred::Credentials, ctx::Requester, ipc::IpcNamespace, mm::AddrSpace};

/// Source of the wall-clock time recorded in segment timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub const fn new(now: Duration) -> Self {
        Self {
            nanos: AtomicU64::new(now.as_nanos() as u64),
        }
    }

    pub fn set(&self, now: Duration) {
        self.nanos.store(now.as_nanos() as u64, Ordering::Release);
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }
}

/// A user process: credentials, namespaces and address space.
pub struct Task {
    tgid: Pid,
    creds: Arc<Credentials>,
    ipc_ns: Arc<IpcNamespace>,
    clock: Arc<dyn Clock>,
    /// 进程地址空间
    pub aspace: Mutex<AddrSpace>,
    /// Page faults resolved without I/O.
    pub minflt: AtomicU64,
    pending_signal: AtomicU32,
}

impl Task {
    pub fn new(
        tgid: Pid,
        creds: Arc<Credentials>,
        ipc_ns: Arc<IpcNamespace>,
        clock: Arc<dyn Clock>,
        user_range: VirtAddrRange,
    ) -> Self {
        Self::with_aspace(tgid, creds, ipc_ns, clock, AddrSpace::new(user_range))
    }

    fn with_aspace(
        tgid: Pid,
        creds: Arc<Credentials>,
        ipc_ns: Arc<IpcNamespace>,
        clock: Arc<dyn Clock>,
        aspace: AddrSpace,
    ) -> Self {
        Self {
            tgid,
            creds,
            ipc_ns,
            clock,
            aspace: Mutex::new(aspace),
            minflt: AtomicU64::new(0),
            pending_signal: AtomicU32::new(0),
        }
    }

    pub fn tgid(&self) -> Pid {
        self.tgid
    }

    pub fn creds(&self) -> &Arc<Credentials> {
        &self.creds
    }

    pub fn ipc_ns(&self) -> &Arc<IpcNamespace> {
        &self.ipc_ns
    }

    /// Describes this task to the shm core.
    pub fn requester(&self) -> Requester {
        Requester::new(self.creds.clone(), self.tgid, self.clock.now())
    }

    /// Creates a child process sharing this task's namespaces, with a copy of
    /// its address space.
    pub fn fork(&self, child_tgid: Pid) -> LinuxResult<Task> {
        let aspace = self.aspace.lock().fork(&self.requester())?;
        debug!("fork: {} -> {}", self.tgid, child_tgid);
        Ok(Self::with_aspace(
            child_tgid,
            self.creds.clone(),
            self.ipc_ns.clone(),
            self.clock.clone(),
            aspace,
        ))
    }

    /// Tears down the address space of an exiting process.
    ///
    /// Detaches every segment still attached, without updating their last
    /// detach time or pid.
    pub fn exit(&self) {
        let ctx = Requester::background(self.creds.clone());
        self.aspace.lock().unmap_all(&ctx);
    }

    /// Records a signal to be delivered on return to user space.
    pub fn raise(&self, sig: u32) {
        self.pending_signal.store(sig, Ordering::Release);
    }

    /// Takes the pending signal, if any.
    pub fn take_pending_signal(&self) -> Option<u32> {
        match self.pending_signal.swap(0, Ordering::AcqRel) {
            0 => None,
            sig => Some(sig),
        }
    }
}
