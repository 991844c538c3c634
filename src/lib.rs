//! System V shared memory for the Starry kernel.
//!
//! The shm objects live in `starry-shm-core`, the system calls in
//! `starry-shm-api`. This crate ties them to the trap path.

#![no_std]

#[macro_use]
extern crate log;

mod mm;

pub use self::mm::handle_page_fault;
pub use starry_shm_api::*;
