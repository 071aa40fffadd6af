//! coderunner: run untrusted programs in several languages under isolation
//! and resource limits, and hand back what they printed.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::namespace`]: user, network and mount namespaces for each run
//! - [`kernel::cgroup`]: cgroup v2 scopes for memory, pids and CPU accounting
//! - [`kernel::signal`]: process-group termination and shutdown signals
//!
//! ## Execution Core ([`core`])
//! - [`core::runner`]: spawns one command, enforces limits, captures output
//! - [`core::admission`]: bounded execution slots with a bounded wait queue
//! - [`core::coordinator`]: request lifecycle from validation to cleanup
//! - [`core::limits`]: resource ceilings and their rlimit form
//!
//! ## Language Adapters ([`judge`])
//! - [`judge::adapter`]: the per-language contract
//! - [`judge::registry`]: lookup by identifier or alias
//! - [`judge::languages`]: built-in adapters
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::workspace`]: request-scoped scratch directories
//! - [`safety::safe_cleanup`]: symlink-safe tree removal
//!
//! ## Configuration ([`config`])
//! - [`config::settings`]: runner configuration file
//! - [`config::validator`]: configuration sanity checks
//! - [`config::types`]: results and the error taxonomy
//!
//! ## Utilities ([`utils`])
//! - [`utils::output`]: bounded stdout/stderr capture
//! - [`utils::report`]: JSON report and legacy text rendering

// Kernel Primitives
pub mod kernel;

// Language-agnostic execution core
pub mod core;

// Language adapters
pub mod judge;

// Safety & Cleanup
pub mod safety;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// Command-line front end
pub mod cli;

pub use config::settings::{OverloadPolicy, RunnerConfig, SandboxMode};
pub use config::types::{
    ExecutionError, ExecutionResult, LimitKind, OutputSegment, Result, StreamKind, Termination,
};
pub use core::coordinator::{ExecutionCoordinator, ExecutionHandle};
pub use core::limits::ResourceLimits;
pub use core::types::{CancellationToken, ExecutionRequest, RunCommand};
pub use judge::adapter::LanguageAdapter;
pub use judge::dependency::Dependency;
pub use judge::registry::AdapterRegistry;
pub use utils::report::{render_legacy_text, ExecutionReport};
