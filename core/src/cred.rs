//! Credentials and user namespaces, as far as IPC permission checks need them.

use alloc::{sync::Arc, vec, vec::Vec};

use bitflags::bitflags;

/// Reported in place of a kernel uid that has no mapping in a namespace.
pub const OVERFLOW_UID: u32 = 65534;
/// Reported in place of a kernel gid that has no mapping in a namespace.
pub const OVERFLOW_GID: u32 = 65534;

/// A user id in the root user namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KUid(pub u32);

/// A group id in the root user namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KGid(pub u32);

bitflags! {
    /// Effective capability set. Bit `n` is capability number `n`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u64 {
        const CAP_IPC_LOCK = 1 << 14;
        const CAP_IPC_OWNER = 1 << 15;
        const CAP_SYS_ADMIN = 1 << 21;
    }
}

/// One contiguous extent of an id map.
///
/// Ids `first..first + len` inside the namespace correspond to kernel ids
/// `first_kernel..first_kernel + len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapEntry {
    pub first: u32,
    pub first_kernel: u32,
    pub len: u32,
}

impl IdMapEntry {
    pub const fn new(first: u32, first_kernel: u32, len: u32) -> Self {
        Self {
            first,
            first_kernel,
            len,
        }
    }

    fn to_kernel(&self, id: u32) -> Option<u32> {
        let off = id.checked_sub(self.first).filter(|&off| off < self.len)?;
        self.first_kernel.checked_add(off)
    }

    fn from_kernel(&self, kid: u32) -> Option<u32> {
        let off = kid.checked_sub(self.first_kernel).filter(|&off| off < self.len)?;
        self.first.checked_add(off)
    }
}

/// A user namespace: an id translation layer and a capability scope.
#[derive(Debug)]
pub struct UserNamespace {
    parent: Option<Arc<UserNamespace>>,
    owner: KUid,
    uid_map: Vec<IdMapEntry>,
    gid_map: Vec<IdMapEntry>,
}

impl UserNamespace {
    /// The initial namespace, mapping every id to itself.
    pub fn root() -> Arc<Self> {
        let identity = vec![IdMapEntry::new(0, 0, u32::MAX)];
        Arc::new(Self {
            parent: None,
            owner: KUid(0),
            uid_map: identity.clone(),
            gid_map: identity,
        })
    }

    /// Creates a namespace nested in `parent`, owned by `owner`.
    pub fn new_child(
        parent: &Arc<Self>,
        owner: KUid,
        uid_map: Vec<IdMapEntry>,
        gid_map: Vec<IdMapEntry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(parent.clone()),
            owner,
            uid_map,
            gid_map,
        })
    }

    pub fn parent(&self) -> Option<&Arc<Self>> {
        self.parent.as_ref()
    }

    pub fn owner(&self) -> KUid {
        self.owner
    }

    pub fn map_to_kuid(&self, uid: u32) -> Option<KUid> {
        self.uid_map.iter().find_map(|e| e.to_kernel(uid)).map(KUid)
    }

    pub fn map_to_kgid(&self, gid: u32) -> Option<KGid> {
        self.gid_map.iter().find_map(|e| e.to_kernel(gid)).map(KGid)
    }

    pub fn map_from_kuid(&self, kuid: KUid) -> u32 {
        self.uid_map
            .iter()
            .find_map(|e| e.from_kernel(kuid.0))
            .unwrap_or(OVERFLOW_UID)
    }

    pub fn map_from_kgid(&self, kgid: KGid) -> u32 {
        self.gid_map
            .iter()
            .find_map(|e| e.from_kernel(kgid.0))
            .unwrap_or(OVERFLOW_GID)
    }
}

/// The identity a task presents to permission checks.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub euid: KUid,
    pub egid: KGid,
    /// Supplementary groups.
    pub extra_gids: Vec<KGid>,
    pub effective_caps: Capabilities,
    pub user_ns: Arc<UserNamespace>,
}

impl Credentials {
    /// Unprivileged credentials.
    pub fn new(euid: KUid, egid: KGid, user_ns: Arc<UserNamespace>) -> Self {
        Self {
            euid,
            egid,
            extra_gids: Vec::new(),
            effective_caps: Capabilities::empty(),
            user_ns,
        }
    }

    /// Credentials of uid 0 holding every capability in `user_ns`.
    pub fn root(user_ns: Arc<UserNamespace>) -> Self {
        Self {
            effective_caps: Capabilities::all(),
            ..Self::new(KUid(0), KGid(0), user_ns)
        }
    }

    pub fn with_groups(mut self, gids: impl IntoIterator<Item = KGid>) -> Self {
        self.extra_gids.extend(gids);
        self
    }

    pub fn with_caps(mut self, caps: Capabilities) -> Self {
        self.effective_caps |= caps;
        self
    }

    pub fn in_group(&self, kgid: KGid) -> bool {
        self.egid == kgid || self.extra_gids.contains(&kgid)
    }

    /// Whether these credentials hold `cap` in `ns`.
    ///
    /// Capabilities held in a namespace apply to every descendant. The owner
    /// of a namespace holds all capabilities in it when its credentials live
    /// in the parent namespace.
    pub fn has_capability_in(&self, cap: Capabilities, ns: &Arc<UserNamespace>) -> bool {
        let mut ns = ns;
        loop {
            if Arc::ptr_eq(&self.user_ns, ns) {
                return self.effective_caps.contains(cap);
            }
            let Some(parent) = ns.parent() else {
                return false;
            };
            if Arc::ptr_eq(&self.user_ns, parent) && self.euid == ns.owner() {
                return true;
            }
            ns = parent;
        }
    }
}
