//! Language-agnostic execution core.
//!
//! Owns the process model, limits, admission and request orchestration.
//! Language-specific steps live in judge adapters.

pub mod admission;
pub mod coordinator;
pub mod limits;
pub mod runner;
pub mod types;
