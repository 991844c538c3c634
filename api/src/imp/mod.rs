mod shm;

pub use self::shm::*;
