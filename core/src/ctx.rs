use alloc::sync::Arc;
use core::time::Duration;

use crate::{Pid, cred::Credentials};

/// Who is asking, and when.
///
/// Every registry and segment operation takes the requester explicitly.
/// `tgid` and `now` are absent when the call does not originate from a task,
/// e.g. mappings torn down while an address space is being released.
#[derive(Debug, Clone)]
pub struct Requester {
    pub creds: Arc<Credentials>,
    pub tgid: Option<Pid>,
    pub now: Option<Duration>,
}

impl Requester {
    pub fn new(creds: Arc<Credentials>, tgid: Pid, now: Duration) -> Self {
        Self {
            creds,
            tgid: Some(tgid),
            now: Some(now),
        }
    }

    /// A requester with no thread group and no clock.
    pub fn background(creds: Arc<Credentials>) -> Self {
        Self {
            creds,
            tgid: None,
            now: None,
        }
    }
}
