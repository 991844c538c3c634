//! Core kernel objects backing System V shared memory.
//!
//! This crate holds the per-namespace shm registry and the segments it
//! manages, together with the narrow interfaces the segments present to the
//! memory-mapping subsystem (page-fault translation, mapping notifications
//! and reference release) and the interfaces they consume (backing memory
//! and credentials).
//!
//! Lock ordering: address space -> shm registry -> shm segment.

#![no_std]

#[macro_use]
extern crate log;
extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod config;
pub mod cred;
pub mod ctx;
pub mod ipc;
pub mod mem;
pub mod mm;
pub mod shm;

/// Process (thread group) identifier.
pub type Pid = u32;
