use alloc::sync::Arc;

use crate::{
    config::ShmLimits, cred::UserNamespace, mem::BackingMemory, shm::Registry,
};

/// An IPC namespace: the System V objects visible to a group of tasks.
pub struct IpcNamespace {
    shms: Arc<Registry>,
}

impl IpcNamespace {
    pub fn new(user_ns: Arc<UserNamespace>, mem: Arc<dyn BackingMemory>) -> Arc<Self> {
        Self::with_limits(user_ns, mem, ShmLimits::default())
    }

    pub fn with_limits(
        user_ns: Arc<UserNamespace>,
        mem: Arc<dyn BackingMemory>,
        limits: ShmLimits,
    ) -> Arc<Self> {
        let shms = Registry::with_limits(user_ns, mem, limits);
        Arc::new(Self { shms })
    }

    pub fn shm_registry(&self) -> &Arc<Registry> {
        &self.shms
    }
}

impl Drop for IpcNamespace {
    fn drop(&mut self) {
        self.shms.release_all();
    }
}
