//! System V shared memory system calls.
//!
//! Every call takes the calling [`Task`] explicitly and returns the value to
//! hand back to user space, or the errno to fail with.

#![no_std]

#[macro_use]
extern crate log;
extern crate alloc;

#[cfg(test)]
extern crate std;

mod imp;
pub mod task;

pub use self::{imp::*, task::Task};
