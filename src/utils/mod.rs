//! Utilities
//!
//! Bounded output capture and result reporting.

pub mod output;
pub mod report;
