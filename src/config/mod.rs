//! Configuration and error types
//!
//! Runner settings, their startup validation, and the shared error taxonomy.

pub mod settings;
pub mod types;
pub mod validator;
