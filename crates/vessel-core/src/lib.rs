//! Provider abstraction, agent orchestrator, and source-VM preparation
//! protocol for ephemeral sandbox control.
//!
//! Layered the way the teacher structures its `cli` crate:
//! `domain` (pure logic) <- `application` (ports + services, the use
//! cases) <- `infra` (concrete adapters: the Proxmox driver over
//! `reqwest`). `infra` is the only layer allowed to depend on an async
//! HTTP client; `application` never imports it directly, only the port
//! traits it defines.

pub mod application;
pub mod domain;
pub mod infra;

pub use application::ports;
pub use application::services;
