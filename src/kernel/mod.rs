//! Thin wrappers around Linux kernel primitives.
//!
//! Most `unsafe` code lives here. Functions meant for the pre-exec hook only
//! issue raw syscalls on buffers prepared before fork.

pub mod cgroup;
pub mod credentials;
pub mod namespace;
pub mod pidns;
pub mod rootfs;
pub mod signal;
