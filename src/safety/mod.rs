//! Workspace lifecycle and cleanup
//!
//! Every request's files live in a private directory that is removed on
//! every exit path.

pub mod safe_cleanup;
pub mod workspace;
