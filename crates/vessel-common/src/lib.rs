//! Shared domain types and error kinds for the sandbox control plane.
//!
//! This crate has zero imports from async runtimes, HTTP clients, or SSH
//! libraries. Everything here is a plain data type or a pure function —
//! the kind of thing a `Store`, a TUI, or an MCP server would also need to
//! depend on without pulling in the provider driver or the orchestrator.

pub mod error;
pub mod model;
pub mod sanitize;

pub use error::CoreError;
pub use model::*;
pub use sanitize::sanitize;
