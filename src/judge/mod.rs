//! Language adapters.
//!
//! The runtime core knows nothing about languages. Adapters decide file
//! layout, dependency installation, compilation and the final command line.

pub mod adapter;
pub mod dependency;
pub mod languages;
pub mod registry;
